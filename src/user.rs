//! Runtime user registry (spec.md §3: "Owns a mapping from network-name to
//! ServerConnection"). [`crate::model::UserInfo`] is the persisted record;
//! [`RuntimeUser`] layers the live, in-memory network map on top of it, the
//! way [`crate::server::ServerConnection`] layers runtime state on top of
//! [`crate::model::ServerConnectionInfo`].

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::model::{UserId, UserInfo};
use crate::server::ServerConnection;

/// A logged-in user and its live server connections.
pub struct RuntimeUser {
    /// The persisted record. Mutated in place on `setpass`/role changes.
    pub info: RwLock<UserInfo>,
    /// Network name -> live `ServerConnection`, non-owning reference held
    /// by Listeners and ServerConnections back to this user.
    pub networks: RwLock<BTreeMap<String, Arc<ServerConnection>>>,
}

impl RuntimeUser {
    /// Wrap a freshly loaded `UserInfo` with an empty network map.
    #[must_use]
    pub fn new(info: UserInfo) -> Arc<Self> {
        Arc::new(RuntimeUser { info: RwLock::new(info), networks: RwLock::new(BTreeMap::new()) })
    }

    /// This user's case-folded id.
    pub async fn id(&self) -> UserId {
        self.info.read().await.id.clone()
    }

    /// Whether this user holds the `Owner` role.
    pub async fn is_owner(&self) -> bool {
        self.info.read().await.is_owner()
    }

    /// Look up one network by name.
    pub async fn network(&self, name: &str) -> Option<Arc<ServerConnection>> {
        self.networks.read().await.get(name).cloned()
    }

    /// Insert or replace a network's runtime handle.
    pub async fn insert_network(&self, name: String, sc: Arc<ServerConnection>) {
        self.networks.write().await.insert(name, sc);
    }

    /// Remove a network's runtime handle (does not touch storage).
    pub async fn remove_network(&self, name: &str) {
        self.networks.write().await.remove(name);
    }

    /// All network names, sorted (BTreeMap iteration order).
    pub async fn network_names(&self) -> Vec<String> {
        self.networks.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    fn sample_info() -> UserInfo {
        UserInfo {
            id: UserId::fold("alice"),
            hash: String::new(),
            salt: String::new(),
            role: Role::User,
            permissions: vec![],
            default_nick: "alice".into(),
            default_nick_fallback: "alice_".into(),
            default_username: "alice".into(),
            default_realname: "Alice".into(),
        }
    }

    #[tokio::test]
    async fn network_names_reflects_insertions() {
        let user = RuntimeUser::new(sample_info());
        assert!(user.network_names().await.is_empty());
    }

    #[tokio::test]
    async fn id_matches_underlying_info() {
        let user = RuntimeUser::new(sample_info());
        assert_eq!(user.id().await, UserId::fold("alice"));
    }
}
