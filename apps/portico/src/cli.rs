//! Command-line surface.

use std::str::FromStr;

use clap::{Parser, Subcommand};

use crate::browser::BrowserScope;

#[derive(Parser, Debug)]
#[command(name = "portico")]
#[command(about = "Bridge browser extensions to native apps across the Flatpak sandbox")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the bridge for every enabled native app config
    Serve {
        /// Restrict to one browser
        #[arg(long, short = 'b', default_value = "all", value_parser = BrowserScope::from_str)]
        browser: BrowserScope,

        /// Print the native-messaging traffic passing through the bridge
        #[arg(long, short = 'l')]
        listen_in: bool,
    },

    /// Inspect and toggle native app configs
    #[command(subcommand)]
    Apps(AppsCommand),
}

#[derive(Subcommand, Debug)]
pub enum AppsCommand {
    /// List discovered native app configs
    List {
        #[arg(long, short = 'b', default_value = "all", value_parser = BrowserScope::from_str)]
        browser: BrowserScope,
    },

    /// Enable a config by manifest file name
    Enable {
        /// Manifest file name, e.g. `org.example.app.json`
        name: String,

        #[arg(long, short = 'b', default_value = "all", value_parser = BrowserScope::from_str)]
        browser: BrowserScope,
    },

    /// Disable a config by manifest file name
    Disable {
        /// Manifest file name, e.g. `org.example.app.json`
        name: String,

        #[arg(long, short = 'b', default_value = "all", value_parser = BrowserScope::from_str)]
        browser: BrowserScope,
    },
}
