//! Data store interface (spec.md §4.4): the contract `Manager` consumes.
//! Any backend satisfying [`Store`] works; [`redb_store::RedbStore`] is the
//! concrete reference backend described in spec.md §6.

pub mod redb_store;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{ServerConnectionInfo, UserInfo};

/// Persistence contract consumed by [`crate::manager::Manager`].
///
/// All writes that touch more than one logical record (user info +
/// permissions; server info + addresses + buffers) happen in a single
/// transaction per save, so a reader never observes a half-written
/// aggregate.
#[async_trait]
pub trait Store: Send + Sync {
    /// Load every user known to the store.
    async fn load_users(&self) -> Result<Vec<UserInfo>, StoreError>;

    /// Load one user by (already case-folded) id.
    async fn load_user(&self, id: &str) -> Result<Option<UserInfo>, StoreError>;

    /// Persist a user record, including permissions, atomically.
    async fn save_user(&self, user: &UserInfo) -> Result<(), StoreError>;

    /// Hash `password` with a fresh per-user salt and persist it in place.
    async fn set_user_password(&self, id: &str, password: &str) -> Result<(), StoreError>;

    /// Verify `password` against the stored hash for `username`, folding
    /// case on the username the same way [`crate::model::UserId::fold`]
    /// does. Returns the resolved (case-folded) id on success.
    async fn authenticate(&self, username: &str, password: &str) -> Result<Option<String>, StoreError>;

    /// Persist a server connection's info, addresses, and buffers atomically.
    async fn save_server_connection(&self, user_id: &str, sc: &ServerConnectionInfo) -> Result<(), StoreError>;

    /// Load one server connection by user + name.
    async fn load_server_connection(
        &self,
        user_id: &str,
        name: &str,
    ) -> Result<Option<ServerConnectionInfo>, StoreError>;

    /// Load all server connections belonging to a user.
    async fn load_server_connections(&self, user_id: &str) -> Result<Vec<ServerConnectionInfo>, StoreError>;

    /// Delete a server connection.
    async fn delete_server_connection(&self, user_id: &str, name: &str) -> Result<(), StoreError>;

    /// The process-wide bouncer salt, generating and persisting one on
    /// first run.
    async fn global_salt(&self) -> Result<String, StoreError>;
}
