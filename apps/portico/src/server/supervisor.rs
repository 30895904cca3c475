//! Server registry and reconciliation against the enabled-config set.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::browser::{Browser, BrowserScope};
use crate::flatpak::PermissionFixer;
use crate::manifest::ManifestFile;
use crate::settings::SettingsStore;

use super::listener::{Server, ServerKey};

/// Where the supervisor gets the enabled-config set from. Re-queried on
/// every reconciliation pass; implementations re-read disk state fresh.
pub trait ConfigSource: Send + Sync + 'static {
    fn enabled_configs(&self, scope: BrowserScope) -> Result<Vec<ManifestFile>>;
}

/// Production source: manifest discovery filtered by the settings store.
pub struct SettingsConfigSource {
    settings: Arc<SettingsStore>,
}

impl SettingsConfigSource {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self { settings }
    }
}

impl ConfigSource for SettingsConfigSource {
    fn enabled_configs(&self, scope: BrowserScope) -> Result<Vec<ManifestFile>> {
        crate::manifest::collect_enabled(scope, &self.settings)
            .context("can't collect native app config files")
    }
}

/// Owns the set of running servers and keeps it equal to the desired set.
///
/// The registry lock guards only map mutation; reconciliation does its I/O
/// (config collection) before taking it and server shutdown happens in the
/// servers' own tasks afterwards.
pub struct Supervisor {
    configs: Arc<dyn ConfigSource>,
    registry: Mutex<HashMap<ServerKey, Arc<Server>>>,
    all_exited: broadcast::Sender<()>,
    fixer_tx: mpsc::Sender<Browser>,
    socket_root: Option<PathBuf>,
}

impl Supervisor {
    pub fn new(configs: Arc<dyn ConfigSource>, fixer: Arc<dyn PermissionFixer>) -> Arc<Self> {
        Self::with_socket_root(configs, fixer, None)
    }

    /// `socket_root` overrides the per-browser runtime directory; used by
    /// tests to keep sockets inside a scratch directory.
    pub fn with_socket_root(
        configs: Arc<dyn ConfigSource>,
        fixer: Arc<dyn PermissionFixer>,
        socket_root: Option<PathBuf>,
    ) -> Arc<Self> {
        let (fixer_tx, mut fixer_rx) = mpsc::channel::<Browser>(10);
        tokio::spawn(async move {
            while let Some(browser) = fixer_rx.recv().await {
                fixer.ensure_visible(browser).await;
            }
        });
        let (all_exited, _) = broadcast::channel(8);
        Arc::new(Self {
            configs,
            registry: Mutex::new(HashMap::new()),
            all_exited,
            fixer_tx,
            socket_root,
        })
    }

    /// Fires once whenever the registry becomes empty; lets the process top
    /// level treat "all servers gone without a stop request" as fatal.
    pub fn subscribe_all_exited(&self) -> broadcast::Receiver<()> {
        self.all_exited.subscribe()
    }

    /// Runs one reconciliation immediately, then one per change
    /// notification, until the returned task is aborted or the settings
    /// store goes away. A failing pass stops every server rather than
    /// leaving a half-reconciled state.
    pub fn start(
        self: &Arc<Self>,
        scope: BrowserScope,
        listen_in: bool,
        mut changes: watch::Receiver<u64>,
    ) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(err) = supervisor.reconcile(scope, listen_in).await {
                    error!(error = %err, "failed reloading servers");
                    supervisor.stop_all().await;
                }
                if changes.changed().await.is_err() {
                    debug!("settings change channel closed; reconciliation ends");
                    break;
                }
            }
        })
    }

    /// One reconciliation pass: diff desired (config, extension) pairs
    /// against the registry, stop the stale servers, start the missing ones.
    pub async fn reconcile(self: &Arc<Self>, scope: BrowserScope, listen_in: bool) -> Result<()> {
        let enabled = self.configs.enabled_configs(scope)?;
        if enabled.is_empty() {
            warn!("no native app configs are currently enabled");
            self.stop_all().await;
            return Ok(());
        }

        let mut desired: Vec<(ServerKey, PathBuf)> = Vec::new();
        for config in &enabled {
            for extension in config.manifest.extensions() {
                desired.push((
                    ServerKey {
                        browser: config.browser,
                        manifest_path: config.path.clone(),
                        extension: extension.clone(),
                    },
                    config.manifest.executable.clone(),
                ));
            }
        }

        let mut to_start = Vec::new();
        {
            let mut registry = self.registry.lock();
            let desired_keys: HashSet<&ServerKey> = desired.iter().map(|(key, _)| key).collect();
            for (key, server) in registry.iter() {
                if !desired_keys.contains(key) {
                    info!(server = %key, "stopping server");
                    server.request_stop();
                }
            }
            for (key, executable) in desired {
                if registry.contains_key(&key) {
                    continue;
                }
                let socket_dir = self.socket_dir_for(key.browser);
                let server = Arc::new(Server::new(key.clone(), executable, socket_dir, listen_in));
                registry.insert(key, Arc::clone(&server));
                to_start.push(server);
            }
        }
        for server in to_start {
            self.spawn_server(server);
        }
        Ok(())
    }

    /// Stops every running server and waits until the registry is empty.
    /// Safe to call repeatedly and from several callers at once; with
    /// nothing running it returns immediately.
    pub async fn stop_all(&self) {
        let mut exited = self.all_exited.subscribe();
        let already_empty = {
            let registry = self.registry.lock();
            for server in registry.values() {
                server.request_stop();
            }
            registry.is_empty()
        };
        if already_empty {
            let _ = self.all_exited.send(());
        }
        debug!("waiting for all servers to exit");
        let _ = exited.recv().await;
        debug!("all servers exited");
    }

    /// Registry snapshot, for status output and tests.
    pub fn running_keys(&self) -> Vec<ServerKey> {
        self.registry.lock().keys().cloned().collect()
    }

    pub fn server(&self, key: &ServerKey) -> Option<Arc<Server>> {
        self.registry.lock().get(key).cloned()
    }

    fn spawn_server(self: &Arc<Self>, server: Arc<Server>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = server.run(supervisor.fixer_tx.clone()).await {
                error!(server = %server.key(), error = %err, "server exited with error");
            }
            let became_empty = {
                let mut registry = supervisor.registry.lock();
                registry.remove(server.key());
                registry.is_empty()
            };
            debug!(server = %server.key(), "server exited");
            if became_empty {
                let _ = supervisor.all_exited.send(());
            }
        });
    }

    fn socket_dir_for(&self, browser: Browser) -> PathBuf {
        match &self.socket_root {
            Some(root) => root.join(browser.flatpak_id()),
            None => browser.runtime_app_dir(),
        }
    }
}
