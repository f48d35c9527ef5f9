//! Server connection (spec.md §4.6): wraps an [`UpstreamClient`] and layers
//! bouncer semantics — replay buffer, attached listeners, saved buffers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bnc_proto::casemap::{irc_eq, irc_to_lower};
use bnc_proto::{IrcMessage, IsupportBuilder, Prefix};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::bus::IrcRawEvent;
use crate::listener::{Listener, ListenerContext};
use crate::model::{Buffer, ServerConnectionInfo, WANTED_UPSTREAM_CAPS};
use crate::store::Store;
use crate::upstream::{Phase, UpstreamClient, UpstreamConfig, UpstreamError, UpstreamEvent};
use crate::user::RuntimeUser;

const CONNECTING_POLL: Duration = Duration::from_secs(1);

/// One persistent, named upstream session for one user.
pub struct ServerConnection {
    name: String,
    ctx: Arc<ListenerContext>,
    store: Arc<dyn Store>,
    user: Weak<RuntimeUser>,
    info: RwLock<ServerConnectionInfo>,
    upstream: Arc<UpstreamClient>,
    replay_buffer: RwLock<Vec<IrcMessage>>,
    capturing: AtomicBool,
    listeners: RwLock<Vec<Arc<Listener>>>,
}

impl ServerConnection {
    /// Construct a server connection from its persisted record and start
    /// its upstream event-consuming task. Does not dial; call
    /// [`Self::connect`] explicitly (the manager does this at autostart).
    #[must_use]
    pub fn new(
        info: ServerConnectionInfo,
        ctx: Arc<ListenerContext>,
        store: Arc<dyn Store>,
        user: Weak<RuntimeUser>,
    ) -> Arc<Self> {
        let name = info.name.clone();
        let upstream_config = upstream_config_from_info(&info);
        let (upstream, inbound_rx) = UpstreamClient::new(upstream_config);
        let sc = Arc::new(ServerConnection {
            name,
            ctx,
            store,
            user,
            info: RwLock::new(info),
            upstream,
            replay_buffer: RwLock::new(Vec::new()),
            capturing: AtomicBool::new(false),
            listeners: RwLock::new(Vec::new()),
        });
        sc.clone().spawn_event_loop(inbound_rx);
        sc
    }

    /// This network's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The wrapped upstream client.
    #[must_use]
    pub fn upstream(&self) -> &Arc<UpstreamClient> {
        &self.upstream
    }

    /// Whether the upstream socket is currently open.
    pub async fn is_connected(&self) -> bool {
        self.upstream.phase().await == Phase::Connected
    }

    /// The case-folded id of the owning user, if it's still alive.
    pub(crate) async fn user_id(&self) -> Option<crate::model::UserId> {
        let user = self.user.upgrade()?;
        Some(user.id().await)
    }

    /// `Connect()` per spec.md §4.6: refuses if already connected or
    /// connecting (delegated to the upstream client), resets the replay
    /// buffer, and rewrites the persisted record to `enabled=true` if this
    /// was a user-initiated reconnect from a disabled state.
    pub async fn connect(self: &Arc<Self>) -> Result<(), UpstreamError> {
        self.upstream.connect().await?;
        *self.replay_buffer.write().await = Vec::new();
        self.capturing.store(true, Ordering::SeqCst);

        let mut info = self.info.write().await;
        if !info.enabled {
            info.enabled = true;
            if let Some(uid) = self.user_id().await {
                if let Err(e) = self.store.save_server_connection(&uid.0, &info).await {
                    warn!(error = %e, network = %self.name, "failed to persist enabled flag");
                }
            }
        }
        Ok(())
    }

    /// `Disconnect()`: closes the upstream and persists `enabled=false`.
    pub async fn disconnect(&self) {
        self.upstream.close().await;
        let mut info = self.info.write().await;
        info.enabled = false;
        if let Some(uid) = self.user_id().await {
            if let Err(e) = self.store.save_server_connection(&uid.0, &info).await {
                warn!(error = %e, network = %self.name, "failed to persist disabled flag");
            }
        }
    }

    /// Append `listener` to the attached set and bind it to this
    /// connection. No replay happens here; replay is driven by the
    /// listener's own registration completion.
    pub async fn add_listener(self: &Arc<Self>, listener: Arc<Listener>) {
        listener.bind_server(self.clone()).await;
        self.listeners.write().await.push(listener);
    }

    /// Drop `listener` from the attached set.
    pub async fn remove_listener(&self, listener: &Arc<Listener>) {
        self.listeners.write().await.retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Snapshot of all known buffers, for `BOUNCER listbuffers`.
    pub async fn buffers_snapshot(&self) -> Vec<Buffer> {
        self.info.read().await.buffers.values().cloned().collect()
    }

    /// Mutate the persisted record in place (e.g. `BOUNCER changenetwork`).
    /// Caller is responsible for calling [`Self::persist`] afterward.
    pub async fn update_info(&self, f: impl FnOnce(&mut ServerConnectionInfo)) {
        let mut info = self.info.write().await;
        f(&mut info);
    }

    /// Write the current in-memory record back to storage.
    pub async fn persist(&self) -> Result<(), crate::error::StoreError> {
        let info = self.info.read().await;
        if let Some(uid) = self.user_id().await {
            self.store.save_server_connection(&uid.0, &info).await
        } else {
            Ok(())
        }
    }

    /// Forget a channel buffer (e.g. on client PART) and persist.
    pub async fn forget_buffer(&self, channel: &str) {
        let folded = irc_to_lower(channel);
        let mut info = self.info.write().await;
        if info.buffers.remove(&folded).is_some() {
            if let Some(uid) = self.user_id().await {
                if let Err(e) = self.store.save_server_connection(&uid.0, &info).await {
                    warn!(error = %e, network = %self.name, "failed to persist buffer removal");
                }
            }
        }
    }

    /// `DumpRegistration(listener)` per spec.md §4.6.
    pub async fn dump_registration(&self, listener: &Arc<Listener>) {
        while self.upstream.phase().await == Phase::Connecting {
            sleep(CONNECTING_POLL).await;
        }

        if self.upstream.phase().await != Phase::Connected {
            listener.send_nil_connect().await;
            return;
        }

        while !self.upstream.has_registered().await {
            sleep(CONNECTING_POLL).await;
            if self.upstream.phase().await != Phase::Connected {
                listener.send_nil_connect().await;
                return;
            }
        }

        let nick = listener.current_nick().await;
        let replay: Vec<IrcMessage> = self.replay_buffer.read().await.clone();
        for mut msg in replay {
            if !msg.params.is_empty() {
                msg.params[0] = nick.clone();
            }
            let is_welcome = msg.command == "001";
            listener.send(msg).await;
            if is_welcome {
                let extra = listener.extra_isupport_tokens();
                if !extra.is_empty() {
                    let mut builder = IsupportBuilder::new();
                    for token in &extra {
                        builder.raw(token.clone());
                    }
                    let prefix = Prefix::ServerName(self.ctx.product_host.clone());
                    for mut line in builder.build_lines() {
                        let mut params = vec![nick.clone()];
                        params.append(&mut line);
                        listener
                            .send(IrcMessage::numeric(prefix.clone(), bnc_proto::Response::RPL_ISUPPORT, params))
                            .await;
                    }
                }
            }
        }

        let upstream_nick = self.upstream.nick().await;
        if nick != upstream_nick {
            let prefix = Prefix::Nickname(nick, String::new(), String::new());
            listener
                .send(IrcMessage { tags: None, prefix: Some(prefix), command: "NICK".into(), params: vec![upstream_nick.clone()] })
                .await;
            listener.set_nick_silently(upstream_nick).await;
        }
    }

    /// `DumpChannels(listener)`: synthesize JOINs and request fresh NAMES.
    pub async fn dump_channels(&self, listener: &Arc<Listener>) {
        let upstream_nick = self.upstream.nick().await;
        let channels: Vec<String> =
            self.info.read().await.buffers.values().filter(|b| b.channel).map(|b| b.name.clone()).collect();
        for channel in channels {
            let prefix = Prefix::Nickname(upstream_nick.clone(), String::new(), String::new());
            listener
                .send(IrcMessage { tags: None, prefix: Some(prefix), command: "JOIN".into(), params: vec![channel.clone()] })
                .await;
            self.upstream.send(&IrcMessage::new("NAMES", vec![channel])).await;
        }
    }

    fn spawn_event_loop(self: Arc<Self>, mut inbound_rx: mpsc::UnboundedReceiver<UpstreamEvent>) {
        tokio::spawn(async move {
            while let Some(event) = inbound_rx.recv().await {
                match event {
                    UpstreamEvent::Line(msg) => {
                        self.connect_lines(&msg).await;
                        self.raw_to_listeners(msg.clone()).await;
                        self.update_nick(&msg).await;
                        self.join_saved_channels(&msg).await;
                        self.handle_join(&msg).await;
                    }
                    UpstreamEvent::Closed => self.on_closed().await,
                }
            }
        });
    }

    async fn connect_lines(&self, msg: &IrcMessage) {
        if !self.capturing.load(Ordering::SeqCst) {
            return;
        }
        if crate::model::REPLAY_CAPTURE_NUMERICS.contains(&msg.command.as_str()) {
            self.replay_buffer.write().await.push(msg.clone());
        }
        if msg.command == "376" || msg.command == "422" {
            self.capturing.store(false, Ordering::SeqCst);
        }
    }

    async fn raw_to_listeners(self: &Arc<Self>, msg: IrcMessage) {
        let mut event = IrcRawEvent {
            listener: None,
            user: self.user_id().await,
            server: Some(self.clone()),
            from_client: false,
            from_server: true,
            raw: msg.to_string(),
            message: msg,
            halt: false,
        };
        self.ctx.bus.dispatch_irc_raw(&mut event);
        if event.halt {
            return;
        }
        let msg = event.message;
        for listener in self.listeners.read().await.iter() {
            listener.send(msg.clone()).await;
        }
    }

    async fn update_nick(&self, msg: &IrcMessage) {
        if msg.command != "001" && msg.command != "NICK" {
            return;
        }
        let current_nick = self.upstream.nick().await;
        for listener in self.listeners.read().await.iter() {
            if listener.current_nick().await != current_nick {
                listener.set_nick_silently(current_nick.clone()).await;
            }
        }
    }

    async fn join_saved_channels(&self, msg: &IrcMessage) {
        if msg.command != "001" {
            return;
        }
        let buffers: Vec<Buffer> = self.info.read().await.buffers.values().filter(|b| b.channel).cloned().collect();
        for buf in buffers {
            let mut params = vec![buf.name.clone()];
            if buf.use_key {
                if let Some(key) = &buf.key {
                    params.push(key.clone());
                }
            }
            self.upstream.send(&IrcMessage::new("JOIN", params)).await;
        }
    }

    async fn handle_join(&self, msg: &IrcMessage) {
        if msg.command != "JOIN" {
            return;
        }
        let Some(nick) = msg.source_nick() else { return };
        let current_nick = self.upstream.nick().await;
        if !irc_eq(nick, &current_nick) {
            return;
        }
        let Some(channel) = msg.params.first() else { return };
        let folded = irc_to_lower(channel);
        let mut info = self.info.write().await;
        if !info.buffers.contains_key(&folded) {
            info.buffers.insert(folded, Buffer::channel(channel.clone()));
            if let Some(uid) = self.user_id().await {
                if let Err(e) = self.store.save_server_connection(&uid.0, &info).await {
                    warn!(error = %e, network = %self.name, "failed to persist new channel buffer");
                }
            }
        }
    }

    async fn on_closed(&self) {
        info!(network = %self.name, "upstream disconnected");
        let text = format!("Disconnected from {}.", self.name);
        let source = format!("{}!bnc@{}", self.ctx.status_nick, self.ctx.product_host);
        let msg = IrcMessage {
            tags: None,
            prefix: Some(Prefix::parse(&source)),
            command: "PRIVMSG".into(),
            params: vec![self.ctx.status_nick.clone(), text],
        };
        for listener in self.listeners.read().await.iter() {
            listener.send(msg.clone()).await;
        }
        // replay_buffer is intentionally left intact for diagnosis.
    }
}

fn upstream_config_from_info(info: &ServerConnectionInfo) -> UpstreamConfig {
    UpstreamConfig {
        addresses: info.addresses.clone(),
        nickname: info.nickname.clone(),
        nickname_fallback: info.nickname_fallback.clone(),
        username: info.username.clone(),
        realname: info.realname.clone(),
        connect_password: info.connect_password.clone(),
        wanted_caps: WANTED_UPSTREAM_CAPS.iter().map(|s| s.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Address;

    fn sample_info() -> ServerConnectionInfo {
        ServerConnectionInfo {
            name: "freenode".into(),
            enabled: false,
            nickname: "alice".into(),
            nickname_fallback: "alice_".into(),
            username: "alice".into(),
            realname: "Alice".into(),
            connect_password: None,
            addresses: vec![Address { host: "irc.example".into(), port: 6667, use_tls: false, verify_tls: true }],
            buffers: Default::default(),
        }
    }

    #[test]
    fn upstream_config_carries_wanted_caps() {
        let config = upstream_config_from_info(&sample_info());
        assert_eq!(config.wanted_caps.len(), WANTED_UPSTREAM_CAPS.len());
        assert_eq!(config.nickname, "alice");
    }
}
