//! Discovery and handling of native-messaging host manifests, plus the
//! sandbox-visible shim copies of them.
//!
//! A manifest describes one native app: the executable to launch and the
//! extensions allowed to talk to it. Portico never edits the original
//! manifest; enabling a config writes a rewritten copy (executable swapped
//! for the client stub) into the browser's sandbox manifest directory.

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::browser::{Browser, BrowserScope, CLIENT_BIN_NAME};
use crate::settings::{SettingsError, SettingsStore};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest {path} has unsupported type {kind:?}; only stdio hosts are supported")]
    UnsupportedType { path: PathBuf, kind: String },
    #[error("manifest {path} does not list any extensions")]
    NoExtensions { path: PathBuf },
    #[error("failed to write manifest {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not encode manifest {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to scan manifest directory {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not provision client stub at {path}: {source}")]
    Provision {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// On-disk native-messaging host manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "path")]
    pub executable: PathBuf,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_extensions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_origins: Vec<String>,
}

impl NativeManifest {
    pub fn parse_file(path: &Path) -> Result<Self, ManifestError> {
        let data = fs::read(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut manifest: NativeManifest =
            serde_json::from_slice(&data).map_err(|source| ManifestError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if manifest.executable.is_relative() {
            if let Some(dir) = path.parent() {
                manifest.executable = dir.join(&manifest.executable);
            }
        }
        if manifest.kind != "stdio" {
            return Err(ManifestError::UnsupportedType {
                path: path.to_path_buf(),
                kind: manifest.kind,
            });
        }
        if manifest.allowed_extensions.is_empty() && manifest.allowed_origins.is_empty() {
            return Err(ManifestError::NoExtensions {
                path: path.to_path_buf(),
            });
        }
        Ok(manifest)
    }

    /// Extension identifiers this manifest grants access to. Manifests
    /// usually fill only one of the two lists; the longer one wins.
    pub fn extensions(&self) -> &[String] {
        if self.allowed_extensions.len() >= self.allowed_origins.len() {
            &self.allowed_extensions
        } else {
            &self.allowed_origins
        }
    }

    fn write_file(&self, path: &Path) -> Result<(), ManifestError> {
        if let Some(parent) = path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!(dir = %parent.display(), error = %err, "could not create manifest directory");
            }
        }
        let data = serde_json::to_vec_pretty(self).map_err(|source| ManifestError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
        let staged = path.with_extension("json.new");
        fs::write(&staged, data).map_err(|source| ManifestError::Write {
            path: staged.clone(),
            source,
        })?;
        fs::rename(&staged, path).map_err(|source| ManifestError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// A manifest located on disk, bound to the browser it was discovered for.
#[derive(Debug, Clone)]
pub struct ManifestFile {
    pub path: PathBuf,
    pub browser: Browser,
    pub manifest: NativeManifest,
}

impl ManifestFile {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Structural identity: same browser, same manifest path. Contents are
    /// re-read on every reconciliation pass and do not participate.
    pub fn matches(&self, other: &ManifestFile) -> bool {
        self.browser == other.browser && self.path == other.path
    }

    pub fn shim_path(&self) -> PathBuf {
        self.browser.sandbox_manifest_dir().join(self.name())
    }

    /// Whether this config is enabled in the settings store. Re-materializes
    /// the sandbox shim if it went missing while enabled (browser data
    /// resets are common).
    pub fn is_enabled(&self, settings: &SettingsStore) -> bool {
        let enabled = settings.is_enabled(self.browser, &self.name());
        if enabled && !self.shim_path().exists() {
            info!(manifest = %self.name(), browser = %self.browser, "rewriting sandbox manifest copy");
            if let Err(err) = self.write_shim() {
                warn!(error = %err, "could not rewrite sandbox manifest copy");
            }
        }
        enabled
    }

    pub fn enable(&self, settings: &SettingsStore) -> Result<(), ManifestError> {
        self.write_shim()?;
        settings.set_config_enabled(self.browser, &self.name(), true)?;
        Ok(())
    }

    pub fn disable(&self, settings: &SettingsStore) -> Result<(), ManifestError> {
        if let Err(err) = self.remove_shim() {
            warn!(error = %err, "sandbox manifest copy not removed");
        }
        settings.set_config_enabled(self.browser, &self.name(), false)?;
        Ok(())
    }

    /// The manifest as the sandboxed browser should see it: same grants,
    /// executable swapped for the client stub.
    pub fn shim_manifest(&self) -> NativeManifest {
        let mut shim = self.manifest.clone();
        shim.executable = self.browser.client_path();
        shim
    }

    pub fn write_shim(&self) -> Result<(), ManifestError> {
        let path = self.shim_path();
        if path.exists() {
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "could not remove old sandbox manifest copy");
            }
        }
        self.shim_manifest().write_file(&path)
    }

    pub fn remove_shim(&self) -> Result<(), ManifestError> {
        let path = self.shim_path();
        if !path.exists() {
            debug!(path = %path.display(), "sandbox manifest copy already gone");
            return Ok(());
        }
        fs::remove_file(&path).map_err(|source| ManifestError::Write { path, source })
    }
}

/// Discovers every parseable manifest in the scope's host directories.
/// Unusable manifests are logged and skipped, not fatal.
pub fn collect(scope: BrowserScope) -> Result<Vec<ManifestFile>, ManifestError> {
    let mut out = Vec::new();
    for browser in scope.browsers() {
        let dir = browser.host_manifest_dir();
        if !dir.exists() {
            warn!(dir = %dir.display(), "host manifest directory missing; creating it");
            let _ = fs::create_dir_all(&dir);
        }
        for path in manifest_paths_in(&dir)? {
            match NativeManifest::parse_file(&path) {
                Ok(manifest) => out.push(ManifestFile {
                    path,
                    browser,
                    manifest,
                }),
                Err(err) => warn!(error = %err, "skipping unusable manifest"),
            }
        }
    }
    Ok(out)
}

pub fn collect_enabled(
    scope: BrowserScope,
    settings: &SettingsStore,
) -> Result<Vec<ManifestFile>, ManifestError> {
    let mut files = collect(scope)?;
    files.retain(|file| file.is_enabled(settings));
    Ok(files)
}

fn manifest_paths_in(dir: &Path) -> Result<Vec<PathBuf>, ManifestError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ManifestError::Scan {
                path: dir.to_path_buf(),
                source,
            })
        }
    };
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ManifestError::Scan {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

static PROVISIONED_STUBS: Lazy<Mutex<HashSet<PathBuf>>> =
    Lazy::new(|| Mutex::new(HashSet::new()));

/// Copies the installed client stub into the browser's runtime directory so
/// shim manifests have something to point at. Done at most once per target
/// path per process.
pub fn ensure_client_stub(browser: Browser) -> Result<(), ManifestError> {
    let target = browser.client_path();
    {
        let mut seen = PROVISIONED_STUBS.lock();
        if !seen.insert(target.clone()) {
            return Ok(());
        }
    }
    let provision_err = |source| ManifestError::Provision {
        path: target.clone(),
        source,
    };
    let source = std::env::current_exe()
        .map_err(provision_err)?
        .parent()
        .map(|dir| dir.join(CLIENT_BIN_NAME))
        .ok_or_else(|| {
            provision_err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "daemon executable has no parent directory",
            ))
        })?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(provision_err)?;
    }
    fs::copy(&source, &target).map_err(provision_err)?;
    fs::set_permissions(&target, fs::Permissions::from_mode(0o755)).map_err(provision_err)?;
    info!(path = %target.display(), "client stub installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, name: &str, json: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn parses_and_resolves_relative_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            "app.json",
            r#"{"name":"app","description":"d","path":"host/run.sh","type":"stdio",
                "allowed_extensions":["app@example.org"]}"#,
        );
        let manifest = NativeManifest::parse_file(&path).unwrap();
        assert_eq!(manifest.executable, dir.path().join("host/run.sh"));
        assert_eq!(manifest.extensions(), ["app@example.org".to_string()]);
    }

    #[test]
    fn rejects_non_stdio_and_empty_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            "odd.json",
            r#"{"name":"odd","path":"/bin/true","type":"socket","allowed_extensions":["x"]}"#,
        );
        assert!(matches!(
            NativeManifest::parse_file(&path),
            Err(ManifestError::UnsupportedType { .. })
        ));

        let path = write_manifest(
            dir.path(),
            "empty.json",
            r#"{"name":"empty","path":"/bin/true","type":"stdio"}"#,
        );
        assert!(matches!(
            NativeManifest::parse_file(&path),
            Err(ManifestError::NoExtensions { .. })
        ));
    }

    #[test]
    fn extensions_prefers_the_longer_grant_list() {
        let manifest = NativeManifest {
            name: "app".into(),
            description: String::new(),
            executable: "/bin/true".into(),
            kind: "stdio".into(),
            allowed_extensions: vec![],
            allowed_origins: vec!["chrome-extension://one/".into()],
        };
        assert_eq!(manifest.extensions().len(), 1);
        assert!(manifest.extensions()[0].starts_with("chrome-extension://"));
    }

    #[test]
    fn shim_manifest_rewrites_only_the_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            "app.json",
            r#"{"name":"app","path":"/usr/bin/host","type":"stdio",
                "allowed_extensions":["app@example.org"]}"#,
        );
        let file = ManifestFile {
            path,
            browser: Browser::Firefox,
            manifest: NativeManifest::parse_file(&dir.path().join("app.json")).unwrap(),
        };
        let shim = file.shim_manifest();
        assert_eq!(shim.executable, Browser::Firefox.client_path());
        assert_eq!(shim.allowed_extensions, file.manifest.allowed_extensions);
        assert_eq!(shim.name, file.manifest.name);
    }

    #[test]
    fn scan_only_picks_up_json_files() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "keep.json", "{}");
        fs::write(dir.path().join("skip.txt"), "x").unwrap();
        let paths = manifest_paths_in(dir.path()).unwrap();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].ends_with("keep.json"));
    }

    #[test]
    fn manifest_serde_uses_the_wire_field_names() {
        let manifest = NativeManifest {
            name: "app".into(),
            description: "d".into(),
            executable: "/usr/bin/host".into(),
            kind: "stdio".into(),
            allowed_extensions: vec!["x@example.org".into()],
            allowed_origins: vec![],
        };
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["path"], "/usr/bin/host");
        assert_eq!(json["type"], "stdio");
        assert!(json.get("allowed_origins").is_none());
    }
}
