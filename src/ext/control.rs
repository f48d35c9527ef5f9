//! Control-nick command interpreter (spec.md §4.10): messages targeting the
//! configured status nick are intercepted here instead of reaching the
//! upstream. Grounded on `examples/original_source/lib/components/control`:
//! same table-shaped command set (`addnetwork, adduser, connect,
//! disconnect, listnetworks, help`), same "render as line-by-line NOTICEs
//! from the status source" reply style.

use std::sync::Arc;

use bnc_proto::casemap::irc_eq;

use crate::bus::Bus;
use crate::listener::{Listener, ListenerContext};
use crate::model::{Address, Role, ServerConnectionInfo, UserId, UserInfo};
use crate::server::ServerConnection;
use crate::user::RuntimeUser;

/// Attach the control-nick interceptor to `bus`.
pub fn register(bus: &mut Bus, ctx: Arc<ListenerContext>) {
    bus.on_irc_raw(move |ev| {
        if !ev.from_client || ev.message.command != "PRIVMSG" {
            return;
        }
        let Some(target) = ev.message.params.first() else { return };
        if !irc_eq(target, &ctx.status_nick) {
            return;
        }
        ev.halt = true;
        let Some(listener) = ev.listener.clone() else { return };
        let Some(text) = ev.message.params.get(1).cloned() else { return };
        let ctx = ctx.clone();
        tokio::spawn(async move { dispatch(&ctx, &listener, &text).await });
    });
}

async fn dispatch(ctx: &Arc<ListenerContext>, listener: &Arc<Listener>, text: &str) {
    let mut words = text.split_whitespace();
    let Some(command) = words.next() else { return };
    let args: Vec<&str> = words.collect();

    let Some(user) = listener.user().await else {
        reply_lines(listener, ctx, &["You are not logged in.".to_string()]).await;
        return;
    };

    let lines = match command.to_ascii_lowercase().as_str() {
        "help" => help_text(),
        "listnetworks" => list_networks(&user).await,
        "addnetwork" => add_network(ctx, &user, &args).await,
        "adduser" => add_user(ctx, &user, &args).await,
        "connect" => connect_network(&user, &args).await,
        "disconnect" => disconnect_network(&user, &args).await,
        other => vec![format!("Unknown command: {other}. Try HELP.")],
    };
    reply_lines(listener, ctx, &lines).await;
}

async fn reply_lines(listener: &Arc<Listener>, ctx: &Arc<ListenerContext>, lines: &[String]) {
    let source = format!("{}!bnc@{}", ctx.status_nick, ctx.product_host);
    let nick = listener.current_nick().await;
    for line in lines {
        let msg = bnc_proto::IrcMessage {
            tags: None,
            prefix: Some(bnc_proto::Prefix::parse(&source)),
            command: "NOTICE".to_string(),
            params: vec![nick.clone(), line.clone()],
        };
        listener.send(msg).await;
    }
}

fn help_text() -> Vec<String> {
    vec![
        "Available commands:".to_string(),
        "  listnetworks".to_string(),
        "  addnetwork <name> <host> <port> [tls]".to_string(),
        "  adduser <username> <password> [owner]   (Owner only)".to_string(),
        "  connect <network>".to_string(),
        "  disconnect <network>".to_string(),
        "  help".to_string(),
    ]
}

async fn list_networks(user: &Arc<RuntimeUser>) -> Vec<String> {
    let names = user.network_names().await;
    if names.is_empty() {
        return vec!["No networks configured.".to_string()];
    }
    let mut rows = vec![("Name".to_string(), "Nick".to_string(), "Connected".to_string())];
    for name in names {
        if let Some(sc) = user.network(&name).await {
            let nick = sc.upstream().nick().await;
            let connected = if sc.is_connected().await { "Yes" } else { "No" };
            rows.push((name, nick, connected.to_string()));
        }
    }
    render_table(&rows)
}

fn render_table(rows: &[(String, String, String)]) -> Vec<String> {
    let w0 = rows.iter().map(|r| r.0.len()).max().unwrap_or(0);
    let w1 = rows.iter().map(|r| r.1.len()).max().unwrap_or(0);
    rows.iter().map(|(a, b, c)| format!("{a:w0$}  {b:w1$}  {c}")).collect()
}

async fn add_network(ctx: &Arc<ListenerContext>, user: &Arc<RuntimeUser>, args: &[&str]) -> Vec<String> {
    let [name, host, rest @ ..] = args else {
        return vec!["Usage: addnetwork <name> <host> <port> [tls]".to_string()];
    };
    let name = match crate::listener::validate_bnc_name(name) {
        Ok(n) => n,
        Err(bad) => return vec![format!("Invalid network name: {bad}")],
    };
    if user.network(&name).await.is_some() {
        return vec![format!("A network named {name} already exists.")];
    }
    let Some(port) = rest.first().and_then(|p| p.parse::<u16>().ok()) else {
        return vec!["Usage: addnetwork <name> <host> <port> [tls]".to_string()];
    };
    let use_tls = rest.get(1).is_some_and(|v| *v == "tls");

    let user_info = user.info.read().await.clone();
    let mut info = ServerConnectionInfo::new_from_defaults(name.clone(), &user_info);
    info.addresses.push(Address { host: host.to_string(), port, use_tls, verify_tls: true });

    if let Err(e) = ctx.store.save_server_connection(&user_info.id.0, &info).await {
        return vec![format!("Failed to save network: {e}")];
    }
    let sc = ServerConnection::new(info, ctx.clone(), ctx.store.clone(), std::sync::Arc::downgrade(user));
    user.insert_network(name.clone(), sc).await;
    vec![format!("Added network {name}. Use \"connect {name}\" to connect.")]
}

async fn add_user(ctx: &Arc<ListenerContext>, user: &Arc<RuntimeUser>, args: &[&str]) -> Vec<String> {
    if !user.is_owner().await {
        return vec!["Only the owner may add users.".to_string()];
    }
    let [username, password, rest @ ..] = args else {
        return vec!["Usage: adduser <username> <password> [owner]".to_string()];
    };
    let id = UserId::fold(username);
    if matches!(ctx.store.load_user(&id.0).await, Ok(Some(_))) {
        return vec![format!("User {username} already exists.")];
    }
    let role = if rest.first().is_some_and(|v| *v == "owner") { Role::Owner } else { Role::User };
    let new_user = UserInfo {
        id: id.clone(),
        hash: String::new(),
        salt: String::new(),
        role,
        permissions: vec![],
        default_nick: username.to_string(),
        default_nick_fallback: format!("{username}_"),
        default_username: username.to_string(),
        default_realname: username.to_string(),
    };
    if let Err(e) = ctx.store.save_user(&new_user).await {
        return vec![format!("Failed to create user: {e}")];
    }
    if let Err(e) = ctx.store.set_user_password(&id.0, password).await {
        return vec![format!("User created but password hashing failed: {e}")];
    }
    vec![format!("Created user {username}.")]
}

async fn connect_network(user: &Arc<RuntimeUser>, args: &[&str]) -> Vec<String> {
    let Some(name) = args.first() else { return vec!["Usage: connect <network>".to_string()] };
    let Some(sc) = user.network(name).await else { return vec![format!("No such network: {name}")] };
    match sc.connect().await {
        Ok(()) => vec![format!("Connecting to {name}...")],
        Err(e) => vec![format!("Could not connect to {name}: {e}")],
    }
}

async fn disconnect_network(user: &Arc<RuntimeUser>, args: &[&str]) -> Vec<String> {
    let Some(name) = args.first() else { return vec!["Usage: disconnect <network>".to_string()] };
    let Some(sc) = user.network(name).await else { return vec![format!("No such network: {name}")] };
    sc.disconnect().await;
    vec![format!("Disconnected from {name}.")]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_table_aligns_columns() {
        let rows = vec![
            ("Name".to_string(), "Nick".to_string(), "Connected".to_string()),
            ("freenode".to_string(), "alice".to_string(), "Yes".to_string()),
        ];
        let lines = render_table(&rows);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("freenode"));
    }
}
