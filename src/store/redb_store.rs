//! Reference data store backend: an embedded ordered key/value store
//! (`redb`), keyed exactly as spec.md §4.4/§6 describes:
//!
//! ```text
//! user.info <id>
//! user.permissions <id>
//! user.server.info <uid> <name>
//! user.server.addresses <uid> <name>
//! user.server.channels <uid> <name>
//! crypto.salt
//! db.version
//! ```
//!
//! `redb` is a synchronous, mmap-backed store, so every operation runs on
//! the blocking thread pool via `spawn_blocking` rather than on the async
//! executor directly.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bcrypt::{hash, verify, DEFAULT_COST};
use rand::Rng;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::StoreError;
use crate::model::{Role, ServerConnectionInfo, UserId, UserInfo};
use crate::store::Store;

const KV: TableDefinition<&str, &str> = TableDefinition::new("kv");
const CURRENT_DB_VERSION: u32 = 1;

/// Concrete [`Store`] implementation backed by `redb`.
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (creating if absent) the store at `path`, initializing
    /// `db.version` and `crypto.salt` on first run.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(|e| StoreError::Backend(e.to_string()))?;
        let store = RedbStore { db: Arc::new(db) };
        store.ensure_initialized()?;
        Ok(store)
    }

    fn ensure_initialized(&self) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(|e| StoreError::Backend(e.to_string()))?;
        {
            let mut table = write_txn.open_table(KV).map_err(|e| StoreError::Backend(e.to_string()))?;
            if table.get("db.version").map_err(|e| StoreError::Backend(e.to_string()))?.is_none() {
                table
                    .insert("db.version", CURRENT_DB_VERSION.to_string().as_str())
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
            }
            if table.get("crypto.salt").map_err(|e| StoreError::Backend(e.to_string()))?.is_none() {
                let salt = generate_salt();
                table.insert("crypto.salt", salt.as_str()).map_err(|e| StoreError::Backend(e.to_string()))?;
            }
        }
        write_txn.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let read_txn = self.db.begin_read().map_err(|e| StoreError::Backend(e.to_string()))?;
        let table = read_txn.open_table(KV).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(table.get(key).map_err(|e| StoreError::Backend(e.to_string()))?.map(|v| v.value().to_string()))
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(|e| StoreError::Backend(e.to_string()))?;
        {
            let mut table = write_txn.open_table(KV).map_err(|e| StoreError::Backend(e.to_string()))?;
            table.insert(key, value).map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        write_txn.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn put_many(&self, entries: &[(String, String)]) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(|e| StoreError::Backend(e.to_string()))?;
        {
            let mut table = write_txn.open_table(KV).map_err(|e| StoreError::Backend(e.to_string()))?;
            for (k, v) in entries {
                table.insert(k.as_str(), v.as_str()).map_err(|e| StoreError::Backend(e.to_string()))?;
            }
        }
        write_txn.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn delete_prefixed(&self, prefix: &str) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(|e| StoreError::Backend(e.to_string()))?;
        {
            let mut table = write_txn.open_table(KV).map_err(|e| StoreError::Backend(e.to_string()))?;
            let keys: Vec<String> = table
                .iter()
                .map_err(|e| StoreError::Backend(e.to_string()))?
                .filter_map(|entry| entry.ok())
                .map(|(k, _)| k.value().to_string())
                .filter(|k| k.starts_with(prefix))
                .collect();
            for k in keys {
                table.remove(k.as_str()).map_err(|e| StoreError::Backend(e.to_string()))?;
            }
        }
        write_txn.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let read_txn = self.db.begin_read().map_err(|e| StoreError::Backend(e.to_string()))?;
        let table = read_txn.open_table(KV).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(table
            .iter()
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .filter_map(|entry| entry.ok())
            .map(|(k, _)| k.value().to_string())
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}

fn generate_salt() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn user_info_key(id: &str) -> String {
    format!("user.info {id}")
}
fn user_permissions_key(id: &str) -> String {
    format!("user.permissions {id}")
}
fn sc_info_key(uid: &str, name: &str) -> String {
    format!("user.server.info {uid} {name}")
}
fn sc_addresses_key(uid: &str, name: &str) -> String {
    format!("user.server.addresses {uid} {name}")
}
fn sc_channels_key(uid: &str, name: &str) -> String {
    format!("user.server.channels {uid} {name}")
}

#[async_trait]
impl Store for RedbStore {
    async fn load_users(&self) -> Result<Vec<UserInfo>, StoreError> {
        let this = self.clone_handle();
        tokio::task::spawn_blocking(move || {
            let keys = this.keys_with_prefix("user.info ")?;
            let mut out = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(raw) = this.get(&key)? {
                    out.push(decode_user(&this, &raw)?);
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn load_user(&self, id: &str) -> Result<Option<UserInfo>, StoreError> {
        let this = self.clone_handle();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || match this.get(&user_info_key(&id))? {
            Some(raw) => Ok(Some(decode_user(&this, &raw)?)),
            None => Ok(None),
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn save_user(&self, user: &UserInfo) -> Result<(), StoreError> {
        let this = self.clone_handle();
        let user = user.clone();
        tokio::task::spawn_blocking(move || {
            let info = UserInfoRow {
                id: user.id.0.clone(),
                hash: user.hash.clone(),
                salt: user.salt.clone(),
                role: user.role,
                default_nick: user.default_nick.clone(),
                default_nick_fallback: user.default_nick_fallback.clone(),
                default_username: user.default_username.clone(),
                default_realname: user.default_realname.clone(),
            };
            let info_json = serde_json::to_string(&info)?;
            let perms_json = serde_json::to_string(&user.permissions)?;
            this.put_many(&[
                (user_info_key(&user.id.0), info_json),
                (user_permissions_key(&user.id.0), perms_json),
            ])
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn set_user_password(&self, id: &str, password: &str) -> Result<(), StoreError> {
        let mut user = self
            .load_user(id)
            .await?
            .ok_or_else(|| StoreError::NoSuchUser(id.to_string()))?;
        let global_salt = self.global_salt().await?;
        let salt = generate_salt();
        user.hash = hash_password(&global_salt, &salt, password)?;
        user.salt = salt;
        self.save_user(&user).await
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<Option<String>, StoreError> {
        let id = UserId::fold(username);
        let Some(user) = self.load_user(&id.0).await? else {
            return Ok(None);
        };
        let global_salt = self.global_salt().await?;
        let ok = verify_password(&global_salt, &user.salt, password, &user.hash)?;
        Ok(ok.then_some(id.0))
    }

    async fn save_server_connection(&self, user_id: &str, sc: &ServerConnectionInfo) -> Result<(), StoreError> {
        let this = self.clone_handle();
        let user_id = user_id.to_string();
        let sc = sc.clone();
        tokio::task::spawn_blocking(move || {
            let info = ServerConnectionInfoRow {
                enabled: sc.enabled,
                connect_password: sc.connect_password.clone(),
                nickname: sc.nickname.clone(),
                nickname_fallback: sc.nickname_fallback.clone(),
                username: sc.username.clone(),
                realname: sc.realname.clone(),
            };
            let info_json = serde_json::to_string(&info)?;
            let addrs_json = serde_json::to_string(&sc.addresses)?;
            let bufs: Vec<_> = sc.buffers.values().cloned().collect();
            let bufs_json = serde_json::to_string(&bufs)?;
            this.put_many(&[
                (sc_info_key(&user_id, &sc.name), info_json),
                (sc_addresses_key(&user_id, &sc.name), addrs_json),
                (sc_channels_key(&user_id, &sc.name), bufs_json),
            ])
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn load_server_connection(
        &self,
        user_id: &str,
        name: &str,
    ) -> Result<Option<ServerConnectionInfo>, StoreError> {
        let this = self.clone_handle();
        let user_id = user_id.to_string();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || this.decode_server_connection(&user_id, &name))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn load_server_connections(&self, user_id: &str) -> Result<Vec<ServerConnectionInfo>, StoreError> {
        let this = self.clone_handle();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || {
            let prefix = format!("user.server.info {user_id} ");
            let keys = this.keys_with_prefix(&prefix)?;
            let mut out = Vec::with_capacity(keys.len());
            for key in keys {
                let name = key[prefix.len()..].to_string();
                if let Some(sc) = this.decode_server_connection(&user_id, &name)? {
                    out.push(sc);
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn delete_server_connection(&self, user_id: &str, name: &str) -> Result<(), StoreError> {
        let this = self.clone_handle();
        let user_id = user_id.to_string();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || {
            this.delete_prefixed(&sc_info_key(&user_id, &name))?;
            this.delete_prefixed(&sc_addresses_key(&user_id, &name))?;
            this.delete_prefixed(&sc_channels_key(&user_id, &name))
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn global_salt(&self) -> Result<String, StoreError> {
        let this = self.clone_handle();
        tokio::task::spawn_blocking(move || {
            this.get("crypto.salt")?.ok_or_else(|| StoreError::Backend("crypto.salt missing".into()))
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }
}

impl RedbStore {
    fn clone_handle(&self) -> RedbStore {
        RedbStore { db: self.db.clone() }
    }

    fn decode_server_connection(&self, user_id: &str, name: &str) -> Result<Option<ServerConnectionInfo>, StoreError> {
        let Some(info_raw) = self.get(&sc_info_key(user_id, name))? else {
            return Ok(None);
        };
        let info: ServerConnectionInfoRow = serde_json::from_str(&info_raw)?;
        let addrs_raw = self.get(&sc_addresses_key(user_id, name))?.unwrap_or_else(|| "[]".to_string());
        let addresses = serde_json::from_str(&addrs_raw)?;
        let bufs_raw = self.get(&sc_channels_key(user_id, name))?.unwrap_or_else(|| "[]".to_string());
        let bufs: Vec<crate::model::Buffer> = serde_json::from_str(&bufs_raw)?;
        let buffers = bufs.into_iter().map(|b| (b.name.clone(), b)).collect();
        Ok(Some(ServerConnectionInfo {
            name: name.to_string(),
            enabled: info.enabled,
            nickname: info.nickname,
            nickname_fallback: info.nickname_fallback,
            username: info.username,
            realname: info.realname,
            connect_password: info.connect_password,
            addresses,
            buffers,
        }))
    }
}

fn decode_user(store: &RedbStore, info_raw: &str) -> Result<UserInfo, StoreError> {
    let info: UserInfoRow = serde_json::from_str(info_raw)?;
    let permissions = match store.get(&user_permissions_key(&info.id))? {
        Some(raw) => serde_json::from_str(&raw)?,
        None => Vec::new(),
    };
    Ok(UserInfo {
        id: UserId(info.id.clone()),
        hash: info.hash,
        salt: info.salt,
        role: info.role,
        permissions,
        default_nick: info.default_nick,
        default_nick_fallback: info.default_nick_fallback,
        default_username: info.default_username,
        default_realname: info.default_realname,
    })
}

#[derive(serde::Serialize, serde::Deserialize)]
struct UserInfoRow {
    id: String,
    hash: String,
    salt: String,
    role: Role,
    default_nick: String,
    default_nick_fallback: String,
    default_username: String,
    default_realname: String,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ServerConnectionInfoRow {
    enabled: bool,
    connect_password: Option<String>,
    nickname: String,
    nickname_fallback: String,
    username: String,
    realname: String,
}

/// `bcrypt`-style hash of `(global_salt | salt | password)`, per spec.md §3.
pub fn hash_password(global_salt: &str, salt: &str, password: &str) -> Result<String, StoreError> {
    let combined = format!("{global_salt}{salt}{password}");
    hash(combined, DEFAULT_COST).map_err(|e| StoreError::Backend(e.to_string()))
}

/// Verify a password against a stored hash, per [`hash_password`]'s scheme.
pub fn verify_password(global_salt: &str, salt: &str, password: &str, stored_hash: &str) -> Result<bool, StoreError> {
    let combined = format!("{global_salt}{salt}{password}");
    verify(combined, stored_hash).map_err(|e| StoreError::Backend(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Address, Buffer};
    use std::collections::BTreeMap;

    fn open_tmp() -> (tempfile::TempDir, RedbStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bnc.redb");
        let store = RedbStore::open(&path).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn save_and_reload_user_round_trips() {
        let (_dir, store) = open_tmp();
        let global_salt = store.global_salt().await.unwrap();
        let salt = generate_salt();
        let hash = hash_password(&global_salt, &salt, "hunter2").unwrap();
        let user = UserInfo {
            id: UserId::fold("Alice"),
            hash,
            salt,
            role: Role::Owner,
            permissions: vec!["admin".into()],
            default_nick: "alice".into(),
            default_nick_fallback: "alice_".into(),
            default_username: "alice".into(),
            default_realname: "Alice".into(),
        };
        store.save_user(&user).await.unwrap();

        let reloaded = store.load_user("alice").await.unwrap().unwrap();
        assert_eq!(reloaded.id, user.id);
        assert_eq!(reloaded.role, Role::Owner);
        assert_eq!(reloaded.permissions, vec!["admin".to_string()]);
        assert_eq!(reloaded.default_nick, "alice");
    }

    #[tokio::test]
    async fn authenticate_accepts_correct_password_only() {
        let (_dir, store) = open_tmp();
        store.set_user_password_for_test("bob", "s3cret").await;
        assert_eq!(store.authenticate("bob", "s3cret").await.unwrap(), Some("bob".to_string()));
        assert_eq!(store.authenticate("bob", "wrong").await.unwrap(), None);
        assert_eq!(store.authenticate("Bob", "s3cret").await.unwrap(), Some("bob".to_string()));
    }

    #[tokio::test]
    async fn server_connection_round_trips_with_addresses_and_buffers() {
        let (_dir, store) = open_tmp();
        let mut buffers = BTreeMap::new();
        buffers.insert("#rust".to_string(), Buffer::channel("#rust"));
        let sc = ServerConnectionInfo {
            name: "freenode".into(),
            enabled: true,
            nickname: "alice".into(),
            nickname_fallback: "alice_".into(),
            username: "alice".into(),
            realname: "Alice".into(),
            connect_password: None,
            addresses: vec![Address { host: "irc.freenode.net".into(), port: 6697, use_tls: true, verify_tls: true }],
            buffers,
        };
        store.save_server_connection("alice", &sc).await.unwrap();
        let reloaded = store.load_server_connection("alice", "freenode").await.unwrap().unwrap();
        assert_eq!(reloaded.addresses.len(), 1);
        assert!(reloaded.buffers.contains_key("#rust"));
        assert!(reloaded.enabled);
    }

    impl RedbStore {
        async fn set_user_password_for_test(&self, id: &str, password: &str) {
            let user = UserInfo {
                id: UserId::fold(id),
                hash: String::new(),
                salt: String::new(),
                role: Role::User,
                permissions: vec![],
                default_nick: id.to_string(),
                default_nick_fallback: format!("{id}_"),
                default_username: id.to_string(),
                default_realname: id.to_string(),
            };
            self.save_user(&user).await.unwrap();
            self.set_user_password(id, password).await.unwrap();
        }
    }
}
