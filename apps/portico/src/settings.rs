//! File-backed settings store with change notifications.
//!
//! The store records which native app configs are enabled per browser in a
//! TOML file. Everything that supervises servers subscribes to the change
//! channel; in-process mutations notify immediately and a background poll
//! task picks up external edits to the file. The channel is a `watch`, so
//! notifications coalesce and a slow subscriber never blocks a writer.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::browser::{user_config_dir, Browser};

pub const SETTINGS_FILE_NAME: &str = "settings.toml";

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("could not access settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("settings file {path} is malformed: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("could not encode settings: {0}")]
    Encode(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct BrowserSettings {
    #[serde(default)]
    enabled: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct SettingsData {
    #[serde(flatten)]
    browsers: BTreeMap<String, BrowserSettings>,
}

struct Inner {
    data: SettingsData,
    mtime: Option<SystemTime>,
    revision: u64,
}

pub struct SettingsStore {
    path: PathBuf,
    inner: Mutex<Inner>,
    change_tx: watch::Sender<u64>,
}

impl SettingsStore {
    pub fn open_default() -> Result<Arc<Self>, SettingsError> {
        Self::open(user_config_dir().join(SETTINGS_FILE_NAME))
    }

    /// Opens the store, creating an empty settings file (and its parent
    /// directory) on first use.
    pub fn open(path: PathBuf) -> Result<Arc<Self>, SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        if !path.exists() {
            debug!(path = %path.display(), "creating settings file");
            write_atomic(&path, &SettingsData::default())?;
        }
        let data = read_data(&path)?;
        let mtime = modified_time(&path);
        let (change_tx, _) = watch::channel(0);
        Ok(Arc::new(Self {
            path,
            inner: Mutex::new(Inner {
                data,
                mtime,
                revision: 0,
            }),
            change_tx,
        }))
    }

    /// Change notifications; the value is a revision counter, only its
    /// movement matters.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.change_tx.subscribe()
    }

    pub fn enabled_configs(&self, browser: Browser) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .data
            .browsers
            .get(browser.short_name())
            .map(|settings| settings.enabled.clone())
            .unwrap_or_default()
    }

    pub fn is_enabled(&self, browser: Browser, config_name: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .data
            .browsers
            .get(browser.short_name())
            .map(|settings| settings.enabled.iter().any(|name| name == config_name))
            .unwrap_or(false)
    }

    /// Flips one config entry and persists the file atomically. A request
    /// that matches the current state is a no-op and does not notify.
    pub fn set_config_enabled(
        &self,
        browser: Browser,
        config_name: &str,
        enable: bool,
    ) -> Result<(), SettingsError> {
        let revision = {
            let mut inner = self.inner.lock();
            let entry = inner
                .data
                .browsers
                .entry(browser.short_name().to_string())
                .or_default();
            let currently = entry.enabled.iter().any(|name| name == config_name);
            if currently == enable {
                return Ok(());
            }
            if enable {
                entry.enabled.push(config_name.to_string());
            } else {
                entry.enabled.retain(|name| name != config_name);
            }
            write_atomic(&self.path, &inner.data)?;
            inner.mtime = modified_time(&self.path);
            inner.revision += 1;
            inner.revision
        };
        let _ = self.change_tx.send(revision);
        Ok(())
    }

    /// Watches the settings file for edits made by other processes.
    pub fn spawn_watch_task(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.poll_file();
            }
        })
    }

    fn poll_file(&self) {
        let mtime = modified_time(&self.path);
        let revision = {
            let mut inner = self.inner.lock();
            if mtime == inner.mtime {
                return;
            }
            inner.mtime = mtime;
            match read_data(&self.path) {
                Ok(data) => {
                    inner.data = data;
                    inner.revision += 1;
                    inner.revision
                }
                Err(err) => {
                    warn!(error = %err, "ignoring unreadable settings file edit");
                    return;
                }
            }
        };
        debug!("settings file changed, notifying subscribers");
        let _ = self.change_tx.send(revision);
    }
}

fn modified_time(path: &PathBuf) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

fn read_data(path: &PathBuf) -> Result<SettingsData, SettingsError> {
    let text = fs::read_to_string(path).map_err(|source| SettingsError::Io {
        path: path.clone(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| SettingsError::Parse {
        path: path.clone(),
        source,
    })
}

fn write_atomic(path: &PathBuf, data: &SettingsData) -> Result<(), SettingsError> {
    let text = toml::to_string_pretty(data)?;
    let staged = path.with_extension("toml.new");
    fs::write(&staged, text).map_err(|source| SettingsError::Io {
        path: staged.clone(),
        source,
    })?;
    fs::rename(&staged, path).map_err(|source| SettingsError::Io {
        path: path.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Arc<SettingsStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path().join(SETTINGS_FILE_NAME)).unwrap();
        (dir, store)
    }

    #[test]
    fn toggles_round_trip_through_the_file() {
        let (dir, store) = temp_store();
        store
            .set_config_enabled(Browser::Firefox, "app.json", true)
            .unwrap();
        assert!(store.is_enabled(Browser::Firefox, "app.json"));
        assert!(!store.is_enabled(Browser::Chromium, "app.json"));

        // A fresh store over the same file sees the persisted state.
        let reopened = SettingsStore::open(dir.path().join(SETTINGS_FILE_NAME)).unwrap();
        assert_eq!(
            reopened.enabled_configs(Browser::Firefox),
            vec!["app.json".to_string()]
        );

        store
            .set_config_enabled(Browser::Firefox, "app.json", false)
            .unwrap();
        assert!(store.enabled_configs(Browser::Firefox).is_empty());
    }

    #[test]
    fn redundant_toggle_does_not_notify() {
        let (_dir, store) = temp_store();
        let rx = store.subscribe();
        store
            .set_config_enabled(Browser::Brave, "app.json", false)
            .unwrap();
        assert!(!rx.has_changed().unwrap());
        store
            .set_config_enabled(Browser::Brave, "app.json", true)
            .unwrap();
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn external_edit_is_picked_up_by_polling() {
        let (dir, store) = temp_store();
        let rx = store.subscribe();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        fs::write(&path, "[firefox]\nenabled = [\"other.json\"]\n").unwrap();
        // Force an mtime difference regardless of filesystem resolution.
        {
            let mut inner = store.inner.lock();
            inner.mtime = Some(SystemTime::UNIX_EPOCH);
        }
        store.poll_file();
        assert!(rx.has_changed().unwrap());
        assert!(store.is_enabled(Browser::Firefox, "other.json"));
    }
}
