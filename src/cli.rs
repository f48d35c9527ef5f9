//! Command-line surface (spec.md §6): `bncd init` scaffolds a config file,
//! storage file, and initial owner account; `bncd start` loads the config
//! and runs the bouncer.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

fn default_config_path() -> PathBuf {
    PathBuf::from("bnc.yaml")
}

#[derive(Debug, Parser)]
#[command(name = "bncd", version, about = "A multiplexing IRC bouncer")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a config file and provision the first owner account.
    Init {
        /// Path to the config file to create.
        #[arg(short, long, default_value_os_t = default_config_path())]
        conf: PathBuf,
    },
    /// Load the config and run the bouncer until signaled to stop.
    Start {
        /// Path to the config file to load.
        #[arg(short, long, default_value_os_t = default_config_path())]
        conf: PathBuf,
    },
}
