//! Portico bridges browser extensions to local native-messaging hosts when
//! the browser runs inside a Flatpak sandbox and cannot start the host
//! itself.
//!
//! For every enabled (native app config, extension) pair the bridge binds a
//! Unix socket in a runtime directory the sandbox can see. The browser
//! launches a tiny client stub that dials that socket; the bridge spawns the
//! real native app and relays bytes between the two, optionally decoding the
//! native-messaging frames that pass through for inspection.

pub mod browser;
pub mod cli;
pub mod flatpak;
pub mod manifest;
pub mod server;
pub mod settings;
