//! Upstream protocol state machine (spec.md §4.5): the "named handlers"
//! that run inline in the reader task before the line is forwarded to the
//! owning `ServerConnection`.

use std::sync::Arc;

use bnc_proto::{FramedSocket, IrcMessage};
use bnc_proto::casemap::irc_eq;
use tracing::debug;

use super::UpstreamClient;

pub async fn handle_inbound(client: &Arc<UpstreamClient>, socket: &Arc<FramedSocket>, msg: &IrcMessage) {
    match msg.command.as_str() {
        "001" => on_welcome(client, msg).await,
        "005" => on_isupport(client, msg).await,
        "433" => on_nick_in_use(client, socket, msg).await,
        "NICK" => on_nick(client, msg).await,
        "PING" => on_ping(socket, msg).await,
        "CAP" => on_cap(client, socket, msg).await,
        _ => {}
    }
}

async fn on_welcome(client: &Arc<UpstreamClient>, msg: &IrcMessage) {
    let Some(nick) = msg.params.first() else { return };
    let mut state = client.state.write().await;
    state.nick = nick.clone();
    state.has_registered = true;
}

async fn on_isupport(client: &Arc<UpstreamClient>, msg: &IrcMessage) {
    // params[0] is the target nick, params[last] is the trailing note;
    // the tokens are everything in between.
    if msg.params.len() < 2 {
        return;
    }
    let tokens = &msg.params[1..msg.params.len() - 1];
    let mut state = client.state.write().await;
    for token in tokens {
        match token.split_once('=') {
            Some((k, v)) => {
                state.supported.insert(k.to_string(), Some(v.to_string()));
            }
            None => {
                state.supported.insert(token.clone(), None);
            }
        }
    }
}

async fn on_nick_in_use(client: &Arc<UpstreamClient>, socket: &Arc<FramedSocket>, _msg: &IrcMessage) {
    let has_registered = client.state.read().await.has_registered;
    if has_registered {
        // Post-registration NICK collisions propagate to the fan-out path
        // unexamined; nothing to recover here.
        return;
    }
    let mut state = client.state.write().await;
    let retries = state.nick_retries;
    state.nick_retries = retries.saturating_add(1);
    drop(state);

    // One suffix-growth step, then fall back to the configured
    // `nickname_fallback` rather than growing the suffix unboundedly.
    let mut config = client.config.write().await;
    if retries == 0 {
        config.nickname.push('_');
    } else if retries == 1 {
        config.nickname = config.nickname_fallback.clone();
    } else {
        config.nickname.push('_');
    }
    let retry = config.nickname.clone();
    drop(config);
    let _ = socket.send_line(IrcMessage::new("NICK", vec![retry]).to_string());
}

async fn on_nick(client: &Arc<UpstreamClient>, msg: &IrcMessage) {
    let Some(from) = msg.source_nick() else { return };
    let Some(new_nick) = msg.params.first() else { return };
    let mut state = client.state.write().await;
    if irc_eq(from, &state.nick) {
        state.nick = new_nick.clone();
    }
}

async fn on_ping(socket: &Arc<FramedSocket>, msg: &IrcMessage) {
    let arg = msg.params.first().cloned().unwrap_or_default();
    let _ = socket.send_line(IrcMessage::new("PONG", vec![arg]).to_string());
}

async fn on_cap(client: &Arc<UpstreamClient>, socket: &Arc<FramedSocket>, msg: &IrcMessage) {
    let Some(subcommand) = msg.params.get(1) else { return };
    match subcommand.as_str() {
        "LS" => on_cap_ls(client, socket, msg).await,
        "ACK" => on_cap_ack(client, socket, msg).await,
        "NAK" => {
            // spec.md §9 open question (a): treat NAK as "proceed with no caps".
            debug!("upstream CAP NAK; proceeding with no capabilities");
            let _ = socket.send_line(IrcMessage::new("CAP", vec!["END".into()]).to_string());
        }
        _ => {}
    }
}

async fn on_cap_ls(client: &Arc<UpstreamClient>, socket: &Arc<FramedSocket>, msg: &IrcMessage) {
    let is_multiline = msg.params.get(2).map(String::as_str) == Some("*");
    let token_param = if is_multiline { msg.params.get(3) } else { msg.params.get(2) };
    if let Some(tokens) = token_param {
        let mut state = client.state.write().await;
        for tok in tokens.split(' ').filter(|t| !t.is_empty()) {
            let name = tok.split('=').next().unwrap_or(tok).to_string();
            state.available_caps.push(name);
        }
    }
    if is_multiline {
        return;
    }

    let (wanted, available) = {
        let config = client.config.read().await;
        let state = client.state.read().await;
        (config.wanted_caps.clone(), state.available_caps.clone())
    };
    let common: Vec<String> = wanted.into_iter().filter(|c| available.contains(c)).collect();
    if common.is_empty() {
        let _ = socket.send_line(IrcMessage::new("CAP", vec!["END".into()]).to_string());
    } else {
        let _ = socket.send_line(IrcMessage::new("CAP", vec!["REQ".into(), common.join(" ")]).to_string());
    }
}

async fn on_cap_ack(client: &Arc<UpstreamClient>, socket: &Arc<FramedSocket>, msg: &IrcMessage) {
    if let Some(granted) = msg.params.get(2) {
        let mut state = client.state.write().await;
        for name in granted.split(' ').filter(|t| !t.is_empty()) {
            state.enabled_caps.push(name.to_string());
        }
    }
    let _ = socket.send_line(IrcMessage::new("CAP", vec!["END".into()]).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Address;
    use crate::upstream::UpstreamConfig;

    fn sample_config() -> UpstreamConfig {
        UpstreamConfig {
            addresses: vec![Address { host: "irc".into(), port: 6667, use_tls: false, verify_tls: true }],
            nickname: "alice".into(),
            nickname_fallback: "alice_".into(),
            username: "alice".into(),
            realname: "Alice".into(),
            connect_password: None,
            wanted_caps: vec!["server-time".into(), "away-notify".into()],
        }
    }

    #[tokio::test]
    async fn welcome_sets_nick_and_registered() {
        let (client, _rx) = UpstreamClient::new(sample_config());
        let msg: IrcMessage = ":irc.example 001 alice :Welcome".parse().unwrap();
        on_welcome(&client, &msg).await;
        let state = client.state.read().await;
        assert_eq!(state.nick, "alice");
        assert!(state.has_registered);
    }

    #[tokio::test]
    async fn isupport_parses_kv_and_flag_tokens() {
        let (client, _rx) = UpstreamClient::new(sample_config());
        let msg: IrcMessage = ":irc.example 005 alice NICKLEN=30 SAFELIST :are supported".parse().unwrap();
        on_isupport(&client, &msg).await;
        let state = client.state.read().await;
        assert_eq!(state.supported.get("NICKLEN"), Some(&Some("30".to_string())));
        assert_eq!(state.supported.get("SAFELIST"), Some(&None));
    }

    #[tokio::test]
    async fn nick_updates_when_source_matches_current_nick() {
        let (client, _rx) = UpstreamClient::new(sample_config());
        client.state.write().await.nick = "alice".into();
        let msg: IrcMessage = ":alice!u@h NICK :alice2".parse().unwrap();
        on_nick(&client, &msg).await;
        assert_eq!(client.state.read().await.nick, "alice2");
    }

    #[tokio::test]
    async fn nick_in_use_grows_suffix_then_falls_back() {
        let (client, _rx) = UpstreamClient::new(sample_config());
        let (_socket, peer) = loopback_socket().await;

        on_nick_in_use(&client, &_socket, &IrcMessage::new("433", vec![])).await;
        assert_eq!(client.config.read().await.nickname, "alice_");

        on_nick_in_use(&client, &_socket, &IrcMessage::new("433", vec![])).await;
        assert_eq!(client.config.read().await.nickname, "alice_");
        drop(peer);
    }

    async fn loopback_socket() -> (Arc<FramedSocket>, tokio::net::TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client_half, (server_half, _)) =
            tokio::try_join!(tokio::net::TcpStream::connect(addr), listener.accept()).unwrap();
        (Arc::new(FramedSocket::tcp(client_half)), server_half)
    }

    #[tokio::test]
    async fn nick_ignores_unrelated_source() {
        let (client, _rx) = UpstreamClient::new(sample_config());
        client.state.write().await.nick = "alice".into();
        let msg: IrcMessage = ":bob!u@h NICK :bob2".parse().unwrap();
        on_nick(&client, &msg).await;
        assert_eq!(client.state.read().await.nick, "alice");
    }
}
