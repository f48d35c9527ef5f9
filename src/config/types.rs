//! Configuration type definitions.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::Deserialize;

use super::defaults::{default_status_nick, default_storage_path};

/// Top-level config file shape (`bnc.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The `bouncer:` block.
    pub bouncer: BouncerConfig,
}

/// The `bouncer:` block.
#[derive(Debug, Clone, Deserialize)]
pub struct BouncerConfig {
    /// Plain-TCP listen addresses, `host:port`.
    #[serde(default)]
    pub listeners: Vec<SocketAddr>,

    /// TLS listen addresses, each with its own cert/key pair.
    #[serde(default, rename = "tls-listeners")]
    pub tls_listeners: HashMap<SocketAddr, TlsListenerConfig>,

    /// Storage backend selection.
    pub storage: StorageConfig,

    /// Message logger configuration (extension hook, §4.10).
    #[serde(default)]
    pub logging: Option<LoggingConfig>,

    /// Virtual status nick commands are intercepted on (default `*status`).
    #[serde(default = "default_status_nick")]
    pub status_nick: String,

    /// Hostname advertised as the bouncer's own source.
    #[serde(default = "default_product_host")]
    pub product_host: String,
}

fn default_product_host() -> String {
    "bnc".to_string()
}

/// One entry of `bouncer.tls-listeners`.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsListenerConfig {
    /// PEM certificate chain path.
    pub cert: String,
    /// PEM private key path.
    pub key: String,
}

/// Storage backend selection (`bouncer.storage`).
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend identifier. Only `"redb"` is implemented; the contract is
    /// backend-agnostic per spec.md §4.4.
    #[serde(default = "default_storage_type")]
    pub r#type: String,
    /// Path to the backend's data file.
    #[serde(default = "default_storage_path")]
    pub path: String,
}

fn default_storage_type() -> String {
    "redb".to_string()
}

/// Message logger configuration (`bouncer.logging`).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LoggingConfig {
    /// Append-only file-per-buffer logging.
    File {
        /// Directory holding one log file per (user, network, buffer).
        path: String,
    },
    /// An embedded SQLite table.
    Sqlite {
        /// Path to the SQLite database file.
        database: String,
    },
}

/// Convenience alias used by `main.rs`/`manager.rs`.
pub type ListenerConfig = SocketAddr;
