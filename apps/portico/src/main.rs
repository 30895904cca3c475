use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use portico::browser::BrowserScope;
use portico::cli::{AppsCommand, Cli, Commands};
use portico::flatpak::FlatpakFixer;
use portico::manifest::{self, ManifestFile};
use portico::server::{SettingsConfigSource, Supervisor};
use portico::settings::SettingsStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { browser, listen_in } => serve(browser, listen_in).await,
        Commands::Apps(command) => apps(command),
    }
}

async fn serve(scope: BrowserScope, listen_in: bool) -> Result<()> {
    for browser in scope.browsers() {
        if let Err(err) = manifest::ensure_client_stub(browser) {
            warn!(browser = %browser, error = %err, "could not provision client stub");
        }
    }

    let settings = SettingsStore::open_default().context("could not open settings store")?;
    let changes = settings.subscribe();
    settings.spawn_watch_task();

    let configs = Arc::new(SettingsConfigSource::new(Arc::clone(&settings)));
    let supervisor = Supervisor::new(configs, Arc::new(FlatpakFixer));
    let mut all_exited = supervisor.subscribe_all_exited();
    let _reconciler = supervisor.start(scope, listen_in, changes);
    info!("servers started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm() => {}
        _ = all_exited.recv() => {
            error!("all servers exited");
            std::process::exit(5);
        }
    }

    info!("cleaning up, press Ctrl-C again to force close");
    tokio::spawn(async {
        let _ = tokio::signal::ctrl_c().await;
        std::process::exit(3);
    });
    supervisor.stop_all().await;
    Ok(())
}

async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => {
            warn!(error = %err, "could not install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

fn apps(command: AppsCommand) -> Result<()> {
    let settings = SettingsStore::open_default().context("could not open settings store")?;
    match command {
        AppsCommand::List { browser } => {
            let files = manifest::collect(browser)?;
            if files.is_empty() {
                bail!("could not find any native app configuration files");
            }
            println!("{:<36} {:<10} {:<8} EXTENSIONS", "CONFIG", "BROWSER", "ENABLED");
            for file in files {
                println!(
                    "{:<36} {:<10} {:<8} {}",
                    file.name(),
                    file.browser,
                    file.is_enabled(&settings),
                    file.manifest.extensions().join(" | ")
                );
            }
            Ok(())
        }
        AppsCommand::Enable { name, browser } => toggle(browser, &name, true, &settings),
        AppsCommand::Disable { name, browser } => toggle(browser, &name, false, &settings),
    }
}

fn toggle(scope: BrowserScope, name: &str, enable: bool, settings: &SettingsStore) -> Result<()> {
    let files: Vec<ManifestFile> = manifest::collect(scope)?
        .into_iter()
        .filter(|file| file.name() == name)
        .collect();
    if files.is_empty() {
        bail!("no config named {name} found for scope {scope}");
    }
    for file in files {
        if enable {
            file.enable(settings)
                .with_context(|| format!("failed to enable {name} for {}", file.browser))?;
            println!("{name} enabled for {}.", file.browser);
        } else {
            file.disable(settings)
                .with_context(|| format!("failed to disable {name} for {}", file.browser))?;
            println!("{name} disabled for {}.", file.browser);
        }
    }
    println!("A running bridge reloads automatically.");
    Ok(())
}
