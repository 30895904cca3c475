//! Browser identities and the filesystem locations tied to them.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use directories::BaseDirs;
use thiserror::Error;

/// Directory component used for everything portico writes per browser.
pub const APP_DIR_NAME: &str = "portico";

/// File name of the stub executable the browser launches.
pub const CLIENT_BIN_NAME: &str = "portico-client";

#[derive(Debug, Error)]
#[error("unknown browser {0:?}; supported browsers: firefox, floorp, chromium, brave, all")]
pub struct UnknownBrowser(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Browser {
    Firefox,
    Floorp,
    Chromium,
    Brave,
}

impl Browser {
    pub const ALL: [Browser; 4] = [
        Browser::Firefox,
        Browser::Floorp,
        Browser::Chromium,
        Browser::Brave,
    ];

    pub fn flatpak_id(&self) -> &'static str {
        match self {
            Browser::Firefox => "org.mozilla.firefox",
            Browser::Floorp => "one.ablaze.floorp",
            Browser::Chromium => "org.chromium.Chromium",
            Browser::Brave => "com.brave.Browser",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Browser::Firefox => "Firefox",
            Browser::Floorp => "Floorp",
            Browser::Chromium => "Chromium",
            Browser::Brave => "Brave",
        }
    }

    /// Key used for CLI input and the settings store.
    pub fn short_name(&self) -> &'static str {
        match self {
            Browser::Firefox => "firefox",
            Browser::Floorp => "floorp",
            Browser::Chromium => "chromium",
            Browser::Brave => "brave",
        }
    }

    /// Where natively installed native-messaging manifests live for this
    /// browser family. Chromium-family browsers are discovered through the
    /// chromium host directory.
    pub fn host_manifest_dir(&self) -> PathBuf {
        let home = home_dir();
        match self {
            Browser::Firefox | Browser::Floorp => {
                home.join(".mozilla").join("native-messaging-hosts")
            }
            Browser::Chromium | Browser::Brave => home
                .join(".config")
                .join("chromium")
                .join("NativeMessagingHosts"),
        }
    }

    /// Manifest directory inside the browser's Flatpak sandbox, where the
    /// rewritten shim copies go.
    pub fn sandbox_manifest_dir(&self) -> PathBuf {
        let base = home_dir().join(".var").join("app").join(self.flatpak_id());
        match self {
            Browser::Firefox | Browser::Floorp => {
                base.join(".mozilla").join("native-messaging-hosts")
            }
            Browser::Chromium => base
                .join("config")
                .join("chromium")
                .join("NativeMessagingHosts"),
            Browser::Brave => base
                .join("config")
                .join("BraveSoftware")
                .join("Brave-Browser")
                .join("NativeMessagingHosts"),
        }
    }

    /// Runtime directory holding the sockets and the client stub for this
    /// browser. Flatpak exposes per-app subtrees of the user runtime dir, so
    /// this path can be made visible inside the sandbox.
    pub fn runtime_app_dir(&self) -> PathBuf {
        runtime_dir()
            .join("app")
            .join(self.flatpak_id())
            .join(APP_DIR_NAME)
    }

    pub fn client_path(&self) -> PathBuf {
        self.runtime_app_dir().join(CLIENT_BIN_NAME)
    }
}

impl fmt::Display for Browser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

impl FromStr for Browser {
    type Err = UnknownBrowser;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_lowercase().as_str() {
            "firefox" => Ok(Browser::Firefox),
            "floorp" => Ok(Browser::Floorp),
            "chromium" => Ok(Browser::Chromium),
            "brave" => Ok(Browser::Brave),
            _ => Err(UnknownBrowser(input.to_string())),
        }
    }
}

/// Browser selection for CLI commands and the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserScope {
    All,
    One(Browser),
}

impl BrowserScope {
    pub fn browsers(&self) -> Vec<Browser> {
        match self {
            BrowserScope::All => Browser::ALL.to_vec(),
            BrowserScope::One(browser) => vec![*browser],
        }
    }
}

impl fmt::Display for BrowserScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrowserScope::All => f.write_str("all"),
            BrowserScope::One(browser) => browser.fmt(f),
        }
    }
}

impl FromStr for BrowserScope {
    type Err = UnknownBrowser;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.eq_ignore_ascii_case("all") {
            Ok(BrowserScope::All)
        } else {
            input.parse().map(BrowserScope::One)
        }
    }
}

pub fn home_dir() -> PathBuf {
    if let Some(dirs) = BaseDirs::new() {
        return dirs.home_dir().to_path_buf();
    }
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

fn runtime_dir() -> PathBuf {
    if let Some(dirs) = BaseDirs::new() {
        if let Some(dir) = dirs.runtime_dir() {
            return dir.to_path_buf();
        }
    }
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

/// Default config directory for the settings store.
pub fn user_config_dir() -> PathBuf {
    let base = if let Some(dirs) = BaseDirs::new() {
        dirs.config_dir().to_path_buf()
    } else {
        home_dir().join(".config")
    };
    base.join(APP_DIR_NAME)
}
