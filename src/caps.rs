//! Capability manager (spec.md §4.8): a process-wide registry of advertised
//! IRCv3 capabilities plus per-cap interposition filters run on every line
//! headed to or from an attached client.
//!
//! Each built-in filter is short, stateless, and commutative with the
//! others — order between them is not semantically meaningful, matching
//! the original `CapManager.FnsMessageToClient`/`FnsMessageFromClient`
//! chains in `examples/original_source/lib/capabilities.go`.

use bnc_proto::IrcMessage;

use crate::listener::Listener;

/// One registered capability: its wire name plus optional hooks.
pub struct CapDef {
    /// Wire name, e.g. `"server-time"`.
    pub name: &'static str,
    /// Runs once when a listener's CAP REQ for this cap is granted.
    pub init: Option<fn(&Listener)>,
    /// Runs on every line headed to the client. Returning `true` halts
    /// (drops) the line; the filter may also mutate `msg` in place.
    pub outbound: Option<fn(&Listener, &mut IrcMessage) -> bool>,
    /// Runs on every line received from the client, same contract.
    pub inbound: Option<fn(&Listener, &mut IrcMessage) -> bool>,
}

/// The full set of capabilities the bouncer advertises to attached clients.
pub const REGISTRY: &[CapDef] = &[
    CapDef { name: "away-notify", init: None, outbound: Some(away_notify_outbound), inbound: None },
    CapDef { name: "server-time", init: Some(server_time_init), outbound: Some(server_time_outbound), inbound: None },
    CapDef { name: "extended-join", init: None, outbound: Some(extended_join_outbound), inbound: None },
    CapDef { name: "account-notify", init: None, outbound: Some(account_notify_outbound), inbound: None },
    CapDef { name: "account-tag", init: Some(account_tag_init), outbound: Some(account_tag_outbound), inbound: None },
    CapDef { name: "invite-notify", init: None, outbound: Some(invite_notify_outbound), inbound: None },
    CapDef {
        name: "userhost-in-names",
        init: None,
        outbound: Some(userhost_in_names_outbound),
        inbound: None,
    },
    // batch is advertised only; chathistory (ext::logger) emits BATCH
    // envelopes directly rather than through a per-line filter.
    CapDef { name: "batch", init: None, outbound: None, inbound: None },
    // bouncer is advertised only; a client granting it is understood to
    // pull its own history via CHATHISTORY/BOUNCER rather than receiving
    // ext::logger's automatic last-50-lines replay on state.sent.
    CapDef { name: "bouncer", init: None, outbound: None, inbound: None },
];

/// Look up a capability definition by name.
#[must_use]
pub fn find(name: &str) -> Option<&'static CapDef> {
    REGISTRY.iter().find(|c| c.name == name)
}

/// All advertised capability names, for `CAP LS`.
#[must_use]
pub fn advertised_names() -> Vec<&'static str> {
    REGISTRY.iter().map(|c| c.name).collect()
}

/// Run every registered outbound filter for `cap_name`-gated caps against
/// `msg`. Returns `true` if any filter halted the line.
#[must_use]
pub fn run_outbound(listener: &Listener, msg: &mut IrcMessage) -> bool {
    let mut halted = false;
    for def in REGISTRY {
        if let Some(f) = def.outbound {
            if f(listener, msg) {
                halted = true;
            }
        }
    }
    halted
}

/// Run every registered inbound filter against `msg`.
#[must_use]
pub fn run_inbound(listener: &Listener, msg: &mut IrcMessage) -> bool {
    let mut halted = false;
    for def in REGISTRY {
        if let Some(f) = def.inbound {
            if f(listener, msg) {
                halted = true;
            }
        }
    }
    halted
}

/// Run `cap`'s initializer against a newly-granted listener, if it has one.
pub fn init_on_listener(cap: &str, listener: &Listener) {
    if let Some(def) = find(cap) {
        if let Some(f) = def.init {
            f(listener);
        }
    }
}

fn away_notify_outbound(listener: &Listener, msg: &mut IrcMessage) -> bool {
    msg.command == "AWAY" && !listener.cap_enabled("away-notify")
}

fn server_time_init(listener: &Listener) {
    listener.set_tags_enabled(true);
}

fn server_time_outbound(listener: &Listener, msg: &mut IrcMessage) -> bool {
    if listener.cap_enabled("server-time") && msg.tag_value("time").is_none() {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        *msg = msg.clone().with_tag(bnc_proto::Tag::with_value("time", now));
    }
    false
}

fn extended_join_outbound(listener: &Listener, msg: &mut IrcMessage) -> bool {
    if msg.command == "JOIN" && !listener.cap_enabled("extended-join") && msg.params.len() == 3 {
        msg.params.truncate(2);
    }
    false
}

fn account_notify_outbound(listener: &Listener, msg: &mut IrcMessage) -> bool {
    msg.command == "ACCOUNT" && !listener.cap_enabled("account-notify")
}

fn account_tag_init(listener: &Listener) {
    listener.set_tags_enabled(true);
}

fn account_tag_outbound(listener: &Listener, msg: &mut IrcMessage) -> bool {
    if !listener.cap_enabled("account-tag") {
        msg.remove_tag("account");
    }
    false
}

fn invite_notify_outbound(listener: &Listener, msg: &mut IrcMessage) -> bool {
    msg.command == "INVITE" && !listener.cap_enabled("invite-notify")
}

fn userhost_in_names_outbound(listener: &Listener, msg: &mut IrcMessage) -> bool {
    if msg.command == "353" && !listener.cap_enabled("userhost-in-names") {
        if let Some(names) = msg.params.last_mut() {
            *names = names
                .split(' ')
                .map(|token| token.split('!').next().unwrap_or(token))
                .collect::<Vec<_>>()
                .join(" ");
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::test_support::bare_listener;

    #[tokio::test]
    async fn away_notify_halts_when_not_enabled() {
        let listener = bare_listener().await;
        let mut msg: IrcMessage = ":bob!u@h AWAY :lunch".parse().unwrap();
        assert!(run_outbound(&listener, &mut msg));
    }

    #[tokio::test]
    async fn away_notify_passes_through_when_enabled() {
        let listener = bare_listener().await;
        listener.set_cap_enabled("away-notify", true);
        let mut msg: IrcMessage = ":bob!u@h AWAY :lunch".parse().unwrap();
        assert!(!run_outbound(&listener, &mut msg));
    }

    #[tokio::test]
    async fn extended_join_strips_account_when_not_enabled() {
        let listener = bare_listener().await;
        let mut msg = IrcMessage::new("JOIN", vec!["#chan".into(), "acct".into(), "Real Name".into()]);
        run_outbound(&listener, &mut msg);
        assert_eq!(msg.params, vec!["#chan", "acct"]);
    }

    #[tokio::test]
    async fn userhost_in_names_strips_hostmasks() {
        let listener = bare_listener().await;
        let mut msg = IrcMessage::new(
            "353",
            vec!["nick".into(), "=".into(), "#chan".into(), "alice!a@h bob!b@h".into()],
        );
        run_outbound(&listener, &mut msg);
        assert_eq!(msg.params.last().unwrap(), "alice bob");
    }

    #[tokio::test]
    async fn server_time_inserts_tag_once() {
        let listener = bare_listener().await;
        listener.set_cap_enabled("server-time", true);
        let mut msg = IrcMessage::new("PRIVMSG", vec!["#chan".into(), "hi".into()]);
        run_outbound(&listener, &mut msg);
        assert!(msg.tag_value("time").is_some());
    }
}
