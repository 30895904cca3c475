//! Sandbox permission repair.
//!
//! A Flatpak browser can only reach the bridge sockets if its sandbox has a
//! filesystem override for the runtime directory they live in. The fixer
//! shells out to `flatpak --user override`; it is invoked opportunistically
//! when a server starts and is never allowed to fail server startup.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::browser::Browser;

#[async_trait]
pub trait PermissionFixer: Send + Sync {
    /// Make sure the browser's sandbox can see its portico runtime
    /// directory. Idempotent and best-effort.
    async fn ensure_visible(&self, browser: Browser);
}

pub struct FlatpakFixer;

#[async_trait]
impl PermissionFixer for FlatpakFixer {
    async fn ensure_visible(&self, browser: Browser) {
        match has_filesystem_override(browser).await {
            Ok(true) => debug!(browser = %browser, "sandbox permissions already in place"),
            Ok(false) => {
                if let Err(err) = grant_filesystem_override(browser).await {
                    error!(browser = %browser, error = %err, "could not grant sandbox filesystem permission");
                }
            }
            Err(err) => {
                error!(browser = %browser, error = %err, "could not check sandbox permissions");
            }
        }
    }
}

/// Fixer that does nothing; for tests and for environments without flatpak.
pub struct NoopFixer;

#[async_trait]
impl PermissionFixer for NoopFixer {
    async fn ensure_visible(&self, _browser: Browser) {}
}

async fn has_filesystem_override(browser: Browser) -> Result<bool> {
    let output = Command::new("flatpak")
        .args(["--user", "override", "--show", browser.flatpak_id()])
        .output()
        .await
        .context("failed to run flatpak")?;
    if !output.status.success() {
        bail!(
            "flatpak override --show for {} exited with {}: {}",
            browser.flatpak_id(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let dir = browser.runtime_app_dir();
    let needle = dir.to_string_lossy();
    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        if let Some(filesystems) = line.strip_prefix("filesystems=") {
            if filesystems
                .split(';')
                .any(|entry| entry.trim_end_matches('/') == needle)
            {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

async fn grant_filesystem_override(browser: Browser) -> Result<()> {
    let dir = browser.runtime_app_dir();
    info!(browser = %browser, dir = %dir.display(), "granting sandbox filesystem permission");
    let output = Command::new("flatpak")
        .args([
            "--user",
            "override",
            &format!("--filesystem={}", dir.display()),
            browser.flatpak_id(),
        ])
        .output()
        .await
        .context("failed to run flatpak")?;
    if !output.status.success() {
        bail!(
            "flatpak override for {} exited with {}: {}",
            browser.flatpak_id(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
