//! Interactive setup wizard (spec.md §6) run by `bncd init`: writes a
//! starter config file if one doesn't exist, opens (creating) the storage
//! backend it points at, and provisions the first Owner account.

use std::io::Write;
use std::path::Path;

use crate::config::Config;
use crate::model::{Role, UserId, UserInfo};
use crate::store::redb_store::RedbStore;
use crate::store::Store;

const STARTER_CONFIG: &str = r#"bouncer:
  listeners:
    - "0.0.0.0:6667"
  storage:
    type: redb
    path: bnc.redb
  status-nick: "*status"
  product-host: bnc
"#;

/// Write `conf` if it doesn't already exist, then open its storage backend
/// and provision an Owner account from interactive prompts.
pub async fn run(conf: &Path) -> anyhow::Result<()> {
    if conf.exists() {
        println!("{} already exists, leaving it in place.", conf.display());
    } else {
        std::fs::write(conf, STARTER_CONFIG)?;
        println!("Wrote starter config to {}.", conf.display());
    }

    let config = Config::load(conf)?;
    let store = RedbStore::open(&config.bouncer.storage.path)?;

    let username = prompt("Owner username")?;
    let password = prompt("Owner password")?;

    let id = UserId::fold(&username);
    let info = UserInfo {
        id: id.clone(),
        hash: String::new(),
        salt: String::new(),
        role: Role::Owner,
        permissions: vec![],
        default_nick: username.clone(),
        default_nick_fallback: format!("{username}_"),
        default_username: username.clone(),
        default_realname: username.clone(),
    };
    store.save_user(&info).await?;
    store.set_user_password(&id.0, &password).await?;

    println!(
        "Created owner account {username}. Edit {} to add listeners, then run `bncd start`.",
        conf.display()
    );
    Ok(())
}

fn prompt(label: &str) -> anyhow::Result<String> {
    print!("{label}: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
