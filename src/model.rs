//! Data model (spec.md §3): users, server connections, and the buffers a
//! server connection remembers across reconnects.

use std::collections::BTreeMap;

use bnc_proto::casemap::irc_to_lower;
use serde::{Deserialize, Serialize};

/// A user's role. Only `Owner` can run owner-restricted control commands
/// (`adduser`); see [`crate::ext::control`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Full administrative access, including user management.
    Owner,
    /// An ordinary bouncer user.
    User,
}

impl Default for Role {
    fn default() -> Self {
        Role::User
    }
}

/// A case-folded user identifier. Two usernames that differ only in case
/// name the same user, per spec.md §3 ("Identified by a case-folded
/// username").
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    /// Fold `raw` the way the store keys users, so lookups are
    /// case-insensitive without needing every caller to remember to fold.
    #[must_use]
    pub fn fold(raw: &str) -> Self {
        UserId(irc_to_lower(raw.trim()))
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted per-user record. Credentials are never stored in plaintext —
/// only a bcrypt-style hash of `(global_salt | salt | password)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserInfo {
    /// Case-folded identifier (the primary key).
    pub id: UserId,
    /// `bcrypt` hash of the salted password.
    pub hash: String,
    /// Per-user salt, combined with the process-wide salt before hashing.
    pub salt: String,
    /// `Owner` or `User`.
    pub role: Role,
    /// Named permission grants beyond the role (reserved for extensions).
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Default nick seeded onto new server connections.
    pub default_nick: String,
    /// Fallback nick, used if the default is rejected.
    pub default_nick_fallback: String,
    /// Default ident/username.
    pub default_username: String,
    /// Default realname ("gecos").
    pub default_realname: String,
}

impl UserInfo {
    /// Whether this user holds the `Owner` role.
    ///
    /// Per spec.md §9 open question (c): a record with no role defaults to
    /// `User`, so legacy rows without the field never pass owner checks.
    #[must_use]
    pub fn is_owner(&self) -> bool {
        matches!(self.role, Role::Owner)
    }
}

/// One candidate address for a server connection, tried in list order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Hostname or IP to dial.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Whether to use TLS.
    #[serde(default, rename = "use-tls")]
    pub use_tls: bool,
    /// Whether to verify the peer certificate (ignored if `use_tls` is false).
    #[serde(default = "default_true", rename = "verify-tls")]
    pub verify_tls: bool,
}

fn default_true() -> bool {
    true
}

/// A channel or private-message target a server connection remembers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buffer {
    /// Channel buffers autojoin; non-channel buffers only carry history.
    #[serde(default)]
    pub channel: bool,
    /// Channel or nick name.
    pub name: String,
    /// Join key, if any.
    #[serde(default)]
    pub key: Option<String>,
    /// Whether to send `key` on JOIN.
    #[serde(default, rename = "use-key")]
    pub use_key: bool,
}

impl Buffer {
    /// A plain channel buffer with no key.
    #[must_use]
    pub fn channel(name: impl Into<String>) -> Self {
        Buffer { channel: true, name: name.into(), key: None, use_key: false }
    }
}

/// Persisted, non-runtime fields of a server connection (spec.md §3).
/// Runtime state (replay buffer, attached listeners, live upstream handle)
/// is layered on top in [`crate::server::ServerConnection`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConnectionInfo {
    /// Name of this network, unique per user (e.g. `"freenode"`).
    pub name: String,
    /// Whether this connection should autostart / reconnect.
    #[serde(default)]
    pub enabled: bool,
    /// Nick to register with.
    pub nickname: String,
    /// Fallback nick if the primary is rejected.
    #[serde(rename = "nickname-fallback")]
    pub nickname_fallback: String,
    /// Ident/username sent in USER.
    pub username: String,
    /// Realname sent in USER.
    pub realname: String,
    /// Upstream connection password (PASS), if required.
    #[serde(default, rename = "connect-password")]
    pub connect_password: Option<String>,
    /// Candidate addresses, tried in order.
    #[serde(default)]
    pub addresses: Vec<Address>,
    /// Known buffers (channels to autojoin plus PM history targets),
    /// keyed by case-folded name for stable iteration order.
    #[serde(default)]
    pub buffers: BTreeMap<String, Buffer>,
}

impl ServerConnectionInfo {
    /// A fresh, disabled server connection record seeded from a user's
    /// defaults, as `addnetwork` creates.
    #[must_use]
    pub fn new_from_defaults(name: impl Into<String>, user: &UserInfo) -> Self {
        ServerConnectionInfo {
            name: name.into(),
            enabled: false,
            nickname: user.default_nick.clone(),
            nickname_fallback: user.default_nick_fallback.clone(),
            username: user.default_username.clone(),
            realname: user.default_realname.clone(),
            connect_password: None,
            addresses: Vec::new(),
            buffers: BTreeMap::new(),
        }
    }
}

/// The fixed set of capabilities the upstream client always requests
/// (spec.md §4.5).
pub const WANTED_UPSTREAM_CAPS: &[&str] = &[
    "account-notify",
    "away-notify",
    "extended-join",
    "account-tag",
    "invite-notify",
    "server-time",
    "userhost-in-names",
];

/// The fixed set of numerics captured into the replay buffer between
/// `RPL_WELCOME` and the end of the MOTD (spec.md §3).
pub const REPLAY_CAPTURE_NUMERICS: &[&str] =
    &["001", "002", "003", "004", "005", "250", "251", "252", "254", "255", "265", "266", "372", "375", "376", "422"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_folds_case_and_whitespace() {
        assert_eq!(UserId::fold(" Alice "), UserId::fold("alice"));
    }

    #[test]
    fn legacy_user_without_role_is_not_owner() {
        let u = UserInfo {
            id: UserId::fold("bob"),
            hash: String::new(),
            salt: String::new(),
            role: Role::default(),
            permissions: vec![],
            default_nick: "bob".into(),
            default_nick_fallback: "bob_".into(),
            default_username: "bob".into(),
            default_realname: "Bob".into(),
        };
        assert!(!u.is_owner());
    }

    #[test]
    fn replay_capture_set_is_within_documented_bound() {
        // spec.md §3/§8: replay buffer size <= |captureSet| (17).
        assert!(REPLAY_CAPTURE_NUMERICS.len() <= 17);
    }
}
