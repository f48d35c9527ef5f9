//! `BOUNCER` client command (spec.md §4.10), grounded on
//! `examples/original_source/lib/components/bouncer/bouncer.go`: a
//! tag-serialized (`key=value;key=value`) wire protocol for managing
//! networks without a control-nick PRIVMSG round-trip.
//!
//! Advertises itself via the `BOUNCER` ISUPPORT token (spec.md §4.7) so
//! clients can detect support before issuing the command.

use std::sync::Arc;

use bnc_proto::{IrcMessage, Prefix};

use crate::bus::Bus;
use crate::listener::{Listener, ListenerContext};
use crate::model::{Address, ServerConnectionInfo};
use crate::server::ServerConnection;
use crate::user::RuntimeUser;

/// Attach the `BOUNCER` command interceptor and ISUPPORT advertisement to
/// `bus`.
pub fn register(bus: &mut Bus, ctx: Arc<ListenerContext>) {
    bus.on_listener_new(|ev| {
        ev.listener.add_extra_isupport("BOUNCER".to_string());
    });

    bus.on_irc_raw(move |ev| {
        if !ev.from_client || ev.message.command != "BOUNCER" {
            return;
        }
        ev.halt = true;
        let Some(listener) = ev.listener.clone() else { return };
        let params = ev.message.params.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { dispatch(&ctx, &listener, &params).await });
    });
}

async fn dispatch(ctx: &Arc<ListenerContext>, listener: &Arc<Listener>, params: &[String]) {
    let Some(sub) = params.first() else { return };
    let Some(user) = listener.user().await else {
        send(listener, ctx, sub, "ERR_NOTCONNECTED").await;
        return;
    };

    match sub.as_str() {
        "listnetworks" => list_networks(listener, ctx, &user).await,
        "listbuffers" => list_buffers(listener, ctx, &user, params.get(1)).await,
        "addnetwork" => add_network(listener, ctx, &user, params.get(1), params.get(2)).await,
        "changenetwork" => change_network(listener, ctx, &user, params.get(1), params.get(2)).await,
        "connect" => connect(listener, ctx, &user, params.get(1)).await,
        "disconnect" => disconnect(listener, ctx, &user, params.get(1)).await,
        _ => send(listener, ctx, sub, "ERR_UNKNOWN").await,
    }
}

async fn send(listener: &Arc<Listener>, ctx: &Arc<ListenerContext>, sub: &str, tail: &str) {
    let msg = IrcMessage {
        tags: None,
        prefix: Some(Prefix::ServerName(ctx.product_host.clone())),
        command: "BOUNCER".to_string(),
        params: vec![sub.to_string(), tail.to_string()],
    };
    listener.send(msg).await;
}

fn encode(pairs: &[(&str, String)]) -> String {
    pairs.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(";")
}

fn parse_kv(s: &str) -> Vec<(String, String)> {
    s.split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn list_networks(listener: &Arc<Listener>, ctx: &Arc<ListenerContext>, user: &Arc<RuntimeUser>) {
    for name in user.network_names().await {
        let Some(sc) = user.network(&name).await else { continue };
        let connected = sc.is_connected().await;
        let nick = sc.upstream().nick().await;
        let line = encode(&[
            ("network", name.clone()),
            ("currentNick", nick),
            ("state", if connected { "connected".to_string() } else { "disconnected".to_string() }),
        ]);
        send(listener, ctx, "listnetworks", &line).await;
    }
    send(listener, ctx, "listnetworks", "end").await;
}

async fn list_buffers(listener: &Arc<Listener>, ctx: &Arc<ListenerContext>, user: &Arc<RuntimeUser>, network: Option<&String>) {
    let Some(network) = network else {
        send(listener, ctx, "listbuffers", "ERR_INVALIDARGS").await;
        return;
    };
    let Some(sc) = user.network(network).await else {
        send(listener, ctx, "listbuffers", "ERR_NETNOTFOUND").await;
        return;
    };
    let buffers = sc.buffers_snapshot().await;
    for buf in buffers {
        let line = encode(&[("network", network.clone()), ("name", buf.name.clone()), ("channel", bool01(buf.channel))]);
        send(listener, ctx, "listbuffers", &line).await;
    }
    send(listener, ctx, "listbuffers", "end").await;
}

fn bool01(b: bool) -> String {
    if b { "1".to_string() } else { "0".to_string() }
}

async fn add_network(
    listener: &Arc<Listener>,
    ctx: &Arc<ListenerContext>,
    user: &Arc<RuntimeUser>,
    name: Option<&String>,
    attrs: Option<&String>,
) {
    let Some(name) = name else {
        send(listener, ctx, "addnetwork", "ERR_INVALIDARGS").await;
        return;
    };
    let validated = match crate::listener::validate_bnc_name(name) {
        Ok(n) => n,
        Err(_) => {
            send(listener, ctx, "addnetwork", "ERR_INVALIDARGS").await;
            return;
        }
    };
    if user.network(&validated).await.is_some() {
        send(listener, ctx, "addnetwork", "ERR_NAMEINUSE").await;
        return;
    }

    let user_info = user.info.read().await.clone();
    let mut info = ServerConnectionInfo::new_from_defaults(validated.clone(), &user_info);
    if let Some(attrs) = attrs {
        apply_attrs(&mut info, &parse_kv(attrs));
    }
    if info.addresses.is_empty() {
        send(listener, ctx, "addnetwork", "ERR_INVALIDARGS").await;
        return;
    }

    if let Err(_e) = ctx.store.save_server_connection(&user_info.id.0, &info).await {
        send(listener, ctx, "addnetwork", "ERR_UNKNOWN").await;
        return;
    }
    let sc = ServerConnection::new(info, ctx.clone(), ctx.store.clone(), Arc::downgrade(user));
    user.insert_network(validated, sc).await;
    send(listener, ctx, "addnetwork", "RPL_OK").await;
}

async fn change_network(
    listener: &Arc<Listener>,
    ctx: &Arc<ListenerContext>,
    user: &Arc<RuntimeUser>,
    name: Option<&String>,
    attrs: Option<&String>,
) {
    let (Some(name), Some(attrs)) = (name, attrs) else {
        send(listener, ctx, "changenetwork", "ERR_INVALIDARGS").await;
        return;
    };
    let Some(sc) = user.network(name).await else {
        send(listener, ctx, "changenetwork", "ERR_NETNOTFOUND").await;
        return;
    };
    sc.update_info(|info| apply_attrs(info, &parse_kv(attrs))).await;
    if let Err(_e) = sc.persist().await {
        send(listener, ctx, "changenetwork", "ERR_UNKNOWN").await;
        return;
    }
    send(listener, ctx, "changenetwork", "RPL_OK").await;
}

fn apply_attrs(info: &mut ServerConnectionInfo, attrs: &[(String, String)]) {
    let mut host = info.addresses.first().map(|a| a.host.clone());
    let mut port = info.addresses.first().map(|a| a.port);
    let mut use_tls = info.addresses.first().is_some_and(|a| a.use_tls);
    for (key, value) in attrs {
        match key.as_str() {
            "nick" => info.nickname = value.clone(),
            "host" => host = Some(value.clone()),
            "port" => port = value.parse().ok(),
            "tls" => use_tls = value == "1",
            "username" => info.username = value.clone(),
            "realname" => info.realname = value.clone(),
            "pass" => info.connect_password = Some(value.clone()),
            _ => {}
        }
    }
    if let (Some(host), Some(port)) = (host, port) {
        info.addresses = vec![Address { host, port, use_tls, verify_tls: true }];
    }
}

async fn connect(listener: &Arc<Listener>, ctx: &Arc<ListenerContext>, user: &Arc<RuntimeUser>, name: Option<&String>) {
    let Some(name) = name else {
        send(listener, ctx, "connect", "ERR_INVALIDARGS").await;
        return;
    };
    let Some(sc) = user.network(name).await else {
        send(listener, ctx, "connect", "ERR_NETNOTFOUND").await;
        return;
    };
    match sc.connect().await {
        Ok(()) => send(listener, ctx, "connect", "RPL_OK").await,
        Err(_) => send(listener, ctx, "connect", "ERR_UNKNOWN").await,
    }
}

async fn disconnect(listener: &Arc<Listener>, ctx: &Arc<ListenerContext>, user: &Arc<RuntimeUser>, name: Option<&String>) {
    let Some(name) = name else {
        send(listener, ctx, "disconnect", "ERR_INVALIDARGS").await;
        return;
    };
    let Some(sc) = user.network(name).await else {
        send(listener, ctx, "disconnect", "ERR_NETNOTFOUND").await;
        return;
    };
    sc.disconnect().await;
    send(listener, ctx, "disconnect", "RPL_OK").await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kv_splits_pairs() {
        let pairs = parse_kv("nick=alice;port=6697;tls=1");
        assert_eq!(pairs, vec![
            ("nick".to_string(), "alice".to_string()),
            ("port".to_string(), "6697".to_string()),
            ("tls".to_string(), "1".to_string()),
        ]);
    }

    #[test]
    fn encode_round_trips_through_parse_kv() {
        let pairs: Vec<(&str, String)> = vec![("network", "freenode".to_string()), ("state", "connected".to_string())];
        let line = encode(&pairs);
        assert_eq!(parse_kv(&line), vec![
            ("network".to_string(), "freenode".to_string()),
            ("state".to_string(), "connected".to_string()),
        ]);
    }
}
