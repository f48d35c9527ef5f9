//! Listener (spec.md §4.7): one attached IRC client and its registration
//! state machine.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bnc_proto::{FramedSocket, IrcMessage, IsupportBuilder, Prefix, Response};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::bus::{Bus, IrcRawEvent, ListenerCloseEvent, StateSentEvent};
use crate::caps;
use crate::error::HandlerError;
use crate::model::UserId;
use crate::server::ServerConnection;
use crate::store::Store;
use crate::user::RuntimeUser;

/// The four booleans whose conjunction admits a Listener into `registered`.
#[derive(Debug, Clone, Copy)]
pub struct RegistrationLocks {
    /// Starts true; flips false on `CAP`, true again on `CAP END`.
    pub cap: bool,
    pub nick: bool,
    pub user: bool,
    pub pass: bool,
}

impl Default for RegistrationLocks {
    fn default() -> Self {
        RegistrationLocks { cap: true, nick: false, user: false, pass: false }
    }
}

impl RegistrationLocks {
    fn all_set(&self) -> bool {
        self.cap && self.nick && self.user && self.pass
    }
}

/// Shared, process-wide context every Listener needs but doesn't own.
pub struct ListenerContext {
    pub bus: Arc<Bus>,
    pub store: Arc<dyn Store>,
    pub users: Arc<dashmap::DashMap<UserId, Arc<RuntimeUser>>>,
    pub status_nick: String,
    pub product_host: String,
}

/// One attached client connection.
pub struct Listener {
    socket: Arc<FramedSocket>,
    ctx: Arc<ListenerContext>,
    client_nick: RwLock<String>,
    registered: AtomicBool,
    locks: Mutex<RegistrationLocks>,
    caps_enabled: Mutex<HashSet<String>>,
    tags_enabled: AtomicBool,
    extra_isupport: std::sync::Mutex<Vec<String>>,
    user: Mutex<Option<Arc<RuntimeUser>>>,
    server: Mutex<Option<Arc<ServerConnection>>>,
}

impl Listener {
    /// Wrap a freshly accepted socket. Not yet registered; no user or
    /// server bound.
    #[must_use]
    pub fn new(socket: Arc<FramedSocket>, ctx: Arc<ListenerContext>) -> Arc<Self> {
        Arc::new(Listener {
            socket,
            ctx,
            client_nick: RwLock::new("*".to_string()),
            registered: AtomicBool::new(false),
            locks: Mutex::new(RegistrationLocks::default()),
            caps_enabled: Mutex::new(HashSet::new()),
            tags_enabled: AtomicBool::new(false),
            extra_isupport: std::sync::Mutex::new(Vec::new()),
            user: Mutex::new(None),
            server: Mutex::new(None),
        })
    }

    /// Main read loop: one iteration per inbound line, until EOF/error.
    /// Per spec.md §7 ("panic containment"), a panic inside one line's
    /// handling is caught and logged rather than tearing down the task.
    pub async fn run(self: Arc<Self>) {
        loop {
            let line = match self.socket.recv_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "listener read error");
                    break;
                }
            };

            let this = self.clone();
            let outcome =
                tokio::spawn(async move { this.handle_line(line).await }).await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(HandlerError::Quit)) => {}
                Ok(Err(e)) => {
                    if let Some(reply) = e.to_irc_reply(&self.ctx.product_host, &self.current_nick().await) {
                        let _ = self.socket.send_line(reply.to_string());
                    }
                }
                Err(join_err) => {
                    warn!(error = %join_err, "listener line handler panicked");
                }
            }
            if self.socket.is_closed() {
                break;
            }
        }
        self.socket.close().await;
        if let Some(server) = self.server.lock().await.clone() {
            server.remove_listener(&self).await;
        }
        self.ctx.bus.dispatch_listener_close(&ListenerCloseEvent { listener: self.clone() });
    }

    async fn handle_line(self: &Arc<Self>, raw: String) -> Result<(), HandlerError> {
        let mut msg: IrcMessage = match raw.parse() {
            Ok(m) => m,
            Err(_) => return Ok(()),
        };
        if caps::run_inbound(self, &mut msg) {
            return Ok(());
        }

        let user_id = self.user.lock().await.as_ref().map(|u| sync_user_id(u));
        let server = self.server.lock().await.clone();
        let mut event = IrcRawEvent {
            listener: Some(self.clone()),
            user: user_id,
            server: server.clone(),
            from_client: true,
            from_server: false,
            raw: raw.clone(),
            message: msg,
            halt: false,
        };
        self.ctx.bus.dispatch_irc_raw(&mut event);
        if event.halt {
            return Ok(());
        }
        let msg = event.message;

        self.dispatch_command(&msg, server).await
    }

    async fn dispatch_command(self: &Arc<Self>, msg: &IrcMessage, server: Option<Arc<ServerConnection>>) -> Result<(), HandlerError> {
        match msg.command.as_str() {
            "PASS" => self.handle_pass(msg).await,
            "NICK" => self.handle_nick(msg).await,
            "USER" => self.handle_user(msg).await,
            "CAP" => self.handle_cap(msg).await,
            "PING" => {
                let arg = msg.params.first().cloned().unwrap_or_default();
                let _ = self.socket.send_line(IrcMessage::new("PONG", vec![arg]).to_string());
                Ok(())
            }
            "QUIT" => Err(HandlerError::Quit),
            "PART" if self.is_registered() => self.handle_part(msg, server).await,
            _ if self.is_registered() => {
                if let Some(server) = server {
                    server.upstream().send(msg).await;
                }
                Ok(())
            }
            other => {
                debug_assert!(!crate::dispatch::usable_pre_reg(other), "usablePreReg commands are matched above");
                // Not `usablePreReg`; spec.md §7 has it silently ignored.
                Ok(())
            }
        }
    }

    async fn handle_pass(self: &Arc<Self>, msg: &IrcMessage) -> Result<(), HandlerError> {
        let Some(value) = msg.params.first() else { return Err(HandlerError::NeedMoreParams) };
        let (account_part, password) = value.split_once(':').ok_or(HandlerError::NeedMoreParams)?;
        let (username, network) = match account_part.split_once('/') {
            Some((u, n)) => (u, Some(n.to_string())),
            None => (account_part, None),
        };

        match self.ctx.store.authenticate(username, password).await {
            Ok(Some(resolved_id)) => {
                let user_id = UserId::fold(&resolved_id);
                let runtime_user = self.ensure_runtime_user(&user_id).await;
                *self.user.lock().await = Some(runtime_user.clone());

                if let Some(network_name) = network {
                    if let Some(sc) = runtime_user.network(&network_name).await {
                        sc.clone().add_listener(self.clone()).await;
                        *self.server.lock().await = Some(sc.clone());
                        if !sc.is_connected().await {
                            let sc2 = sc.clone();
                            tokio::spawn(async move {
                                if let Err(e) = sc2.connect().await {
                                    warn!(error = %e, "upstream connect failed after PASS attach");
                                }
                            });
                        }
                    }
                }

                let mut locks = self.locks.lock().await;
                locks.pass = true;
                let completed = locks.all_set();
                drop(locks);
                if completed {
                    self.complete_registration().await;
                }
                Ok(())
            }
            _ => {
                let reply = IrcMessage::numeric(
                    Prefix::ServerName(self.ctx.product_host.clone()),
                    Response::ERR_PASSWDMISMATCH,
                    vec!["*".to_string(), "Invalid password".to_string()],
                );
                self.socket.set_final_data(reply.to_string()).await;
                self.socket.close().await;
                Err(HandlerError::AccessDenied)
            }
        }
    }

    async fn ensure_runtime_user(&self, id: &UserId) -> Arc<RuntimeUser> {
        if let Some(existing) = self.ctx.users.get(id) {
            return existing.clone();
        }
        // Loaded lazily here only if the manager hasn't already populated
        // the registry at startup; `load_user` is idempotent either way.
        let info = self.ctx.store.load_user(&id.0).await.ok().flatten();
        let runtime = RuntimeUser::new(info.unwrap_or_else(|| crate::model::UserInfo {
            id: id.clone(),
            hash: String::new(),
            salt: String::new(),
            role: crate::model::Role::User,
            permissions: vec![],
            default_nick: id.0.clone(),
            default_nick_fallback: format!("{}_", id.0),
            default_username: id.0.clone(),
            default_realname: id.0.clone(),
        }));
        self.ctx.users.insert(id.clone(), runtime.clone());
        runtime
    }

    async fn handle_nick(self: &Arc<Self>, msg: &IrcMessage) -> Result<(), HandlerError> {
        let Some(candidate) = msg.params.first() else { return Err(HandlerError::NeedMoreParams) };
        let validated = validate_nick(candidate).map_err(HandlerError::ErroneousNickname)?;

        if self.is_registered() {
            *self.client_nick.write().await = validated.clone();
            if let Some(server) = self.server.lock().await.clone() {
                server.upstream().set_desired_nick(validated.clone()).await;
                server.upstream().send(&IrcMessage::new("NICK", vec![validated])).await;
            }
            return Ok(());
        }

        *self.client_nick.write().await = validated;
        let mut locks = self.locks.lock().await;
        locks.nick = true;
        let completed = locks.all_set();
        drop(locks);
        if completed {
            self.complete_registration().await;
        }
        Ok(())
    }

    async fn handle_user(self: &Arc<Self>, msg: &IrcMessage) -> Result<(), HandlerError> {
        if msg.params.len() < 4 {
            return Err(HandlerError::NeedMoreParams);
        }
        if self.is_registered() {
            return Err(HandlerError::AlreadyRegistered);
        }
        let mut locks = self.locks.lock().await;
        locks.user = true;
        let completed = locks.all_set();
        drop(locks);
        if completed {
            self.complete_registration().await;
        }
        Ok(())
    }

    async fn handle_cap(self: &Arc<Self>, msg: &IrcMessage) -> Result<(), HandlerError> {
        let Some(subcommand) = msg.params.first() else { return Err(HandlerError::NeedMoreParams) };
        match subcommand.as_str() {
            "LS" => {
                if self.is_registered() {
                    return Err(HandlerError::AlreadyRegistered);
                }
                self.locks.lock().await.cap = false;
                let names = caps::advertised_names().join(" ");
                let reply = IrcMessage::new("CAP", vec!["*".into(), "LS".into(), names]);
                let _ = self.socket.send_line(reply.to_string());
                Ok(())
            }
            "REQ" => {
                let requested = msg.params.get(1).cloned().unwrap_or_default();
                let mut granted = Vec::new();
                for name in requested.split(' ').filter(|n| !n.is_empty()) {
                    if caps::find(name).is_some() {
                        self.set_cap_enabled(name, true);
                        caps::init_on_listener(name, self);
                        granted.push(name.to_string());
                    }
                }
                let reply = IrcMessage::new("CAP", vec!["*".into(), "ACK".into(), granted.join(" ")]);
                let _ = self.socket.send_line(reply.to_string());
                Ok(())
            }
            "END" => {
                if self.is_registered() {
                    return Err(HandlerError::AlreadyRegistered);
                }
                let mut locks = self.locks.lock().await;
                locks.cap = true;
                let completed = locks.all_set();
                drop(locks);
                if completed {
                    self.complete_registration().await;
                }
                Ok(())
            }
            "ENABLED" => {
                let enabled = self.caps_enabled.lock().await.iter().cloned().collect::<Vec<_>>().join(" ");
                let _ = self.socket.send_line(self.status_notice(&enabled).to_string());
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn handle_part(self: &Arc<Self>, msg: &IrcMessage, server: Option<Arc<ServerConnection>>) -> Result<(), HandlerError> {
        let Some(channel) = msg.params.first() else { return Err(HandlerError::NeedMoreParams) };
        if let Some(server) = server {
            server.forget_buffer(channel).await;
            server.upstream().send(msg).await;
        }
        Ok(())
    }

    async fn complete_registration(self: &Arc<Self>) {
        let server = self.server.lock().await.clone();
        match &server {
            Some(sc) => sc.dump_registration(self).await,
            None => self.send_nil_connect().await,
        }
        self.registered.store(true, Ordering::SeqCst);
        if let Some(sc) = &server {
            sc.dump_channels(self).await;
        }
        self.ctx.bus.dispatch_state_sent(&StateSentEvent { listener: self.clone(), server });
    }

    pub(crate) async fn send_nil_connect(self: &Arc<Self>) {
        let nick = self.current_nick().await;
        let prefix = Prefix::ServerName(self.ctx.product_host.clone());

        let welcome = IrcMessage::numeric(
            prefix.clone(),
            Response::RPL_WELCOME,
            vec![nick.clone(), format!("- Welcome to {} -", self.ctx.product_host)],
        );
        let _ = self.socket.send_line(welcome.to_string());

        let mut isupport = IsupportBuilder::new();
        for token in self.extra_isupport.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            isupport.raw(token.clone());
        }
        for line in isupport.build_lines() {
            let mut params = vec![nick.clone()];
            params.extend(line);
            let _ = self.socket.send_line(IrcMessage::numeric(prefix.clone(), Response::RPL_ISUPPORT, params).to_string());
        }

        let no_motd = IrcMessage::numeric(
            prefix,
            Response::ERR_NOMOTD,
            vec![nick.clone(), "MOTD File is missing".to_string()],
        );
        let _ = self.socket.send_line(no_motd.to_string());

        let _ = self.socket.send_line(self.status_notice("You are not connected to a network.").to_string());
        let _ = self
            .socket
            .send_line(self.status_notice("Use the BOUNCER or control commands to add one.").to_string());
    }

    fn status_notice(&self, text: &str) -> IrcMessage {
        let source = format!("{}!bnc@{}", self.ctx.status_nick, self.ctx.product_host);
        IrcMessage {
            tags: None,
            prefix: Some(Prefix::parse(&source)),
            command: "NOTICE".to_string(),
            params: vec![self.ctx.status_nick.clone(), text.to_string()],
        }
    }

    /// Send a line to this client, applying the outbound capability filter
    /// chain. Dropped (not an error) if a filter halts it.
    pub async fn send(&self, mut msg: IrcMessage) {
        if caps::run_outbound(self, &mut msg) {
            return;
        }
        if !self.tags_enabled.load(Ordering::Relaxed) {
            msg.tags = None;
        }
        let _ = self.socket.send_line(msg.to_string());
    }

    /// Whether `cap` has been negotiated for this listener.
    #[must_use]
    pub fn cap_enabled(&self, cap: &str) -> bool {
        self.caps_enabled.try_lock().map(|set| set.contains(cap)).unwrap_or(false)
    }

    /// Mark `cap` enabled or disabled.
    pub fn set_cap_enabled(&self, cap: &str, on: bool) {
        if let Ok(mut set) = self.caps_enabled.try_lock() {
            if on {
                set.insert(cap.to_string());
            } else {
                set.remove(cap);
            }
        }
    }

    /// Gate whether message tags are serialized at all.
    pub fn set_tags_enabled(&self, on: bool) {
        self.tags_enabled.store(on, Ordering::Relaxed);
    }

    /// Append an ISUPPORT token published via the `listener.new` hook.
    /// Synchronous so `ext::bouncer_protocol` can call it directly from a
    /// bus handler, which runs on the dispatching task with no `.await`.
    pub fn add_extra_isupport(&self, token: String) {
        self.extra_isupport.lock().unwrap_or_else(|e| e.into_inner()).push(token);
    }

    /// Snapshot the extra ISUPPORT tokens published for this listener.
    pub(crate) fn extra_isupport_tokens(&self) -> Vec<String> {
        self.extra_isupport.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether all four registration locks are set.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// The client's current advertised nick.
    pub async fn current_nick(&self) -> String {
        self.client_nick.read().await.clone()
    }

    /// Overwrite the client's advertised nick (used by
    /// `ServerConnection::updateNick`).
    pub async fn set_nick_silently(&self, nick: String) {
        *self.client_nick.write().await = nick;
    }

    /// The bound server connection, if any.
    pub async fn server(&self) -> Option<Arc<ServerConnection>> {
        self.server.lock().await.clone()
    }

    /// Bind this listener to a server connection (used outside PASS too,
    /// e.g. by the `connect` control command).
    pub async fn bind_server(&self, sc: Arc<ServerConnection>) {
        *self.server.lock().await = Some(sc);
    }

    /// The authenticated user bound to this listener, if any.
    pub async fn user(&self) -> Option<Arc<RuntimeUser>> {
        self.user.lock().await.clone()
    }

    /// Shared context, for extensions that need the store or user registry.
    #[must_use]
    pub fn ctx(&self) -> &Arc<ListenerContext> {
        &self.ctx
    }
}

fn sync_user_id(user: &Arc<RuntimeUser>) -> UserId {
    // The info lock is never held across an await point elsewhere in this
    // module, so a non-blocking read here always succeeds in practice.
    user.info.try_read().map(|info| info.id.clone()).unwrap_or_else(|_| UserId::fold(""))
}

/// Validate a candidate nick per spec.md §4.7.2: trimmed, nonempty, no
/// whitespace, and none of the reserved characters.
pub fn validate_nick(candidate: &str) -> Result<String, String> {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return Err(trimmed.to_string());
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(trimmed.to_string());
    }
    const RESERVED: &[char] = &[',', '.', '!', '@', '#', '?', '*'];
    if trimmed.chars().any(|c| RESERVED.contains(&c)) {
        return Err(trimmed.to_string());
    }
    Ok(trimmed.to_string())
}

/// Validate a "bnc name" (network name, control-command identifier): like
/// [`validate_nick`] plus PRECIS-UsernameCaseMapped-style rejection of a
/// leading digit.
pub fn validate_bnc_name(candidate: &str) -> Result<String, String> {
    let validated = validate_nick(candidate)?;
    if validated.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return Err(validated);
    }
    Ok(validated)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::bus::Bus;

    struct NullStore;

    #[async_trait::async_trait]
    impl Store for NullStore {
        async fn load_users(&self) -> Result<Vec<crate::model::UserInfo>, crate::error::StoreError> {
            Ok(vec![])
        }
        async fn load_user(&self, _id: &str) -> Result<Option<crate::model::UserInfo>, crate::error::StoreError> {
            Ok(None)
        }
        async fn save_user(&self, _user: &crate::model::UserInfo) -> Result<(), crate::error::StoreError> {
            Ok(())
        }
        async fn set_user_password(&self, _id: &str, _password: &str) -> Result<(), crate::error::StoreError> {
            Ok(())
        }
        async fn authenticate(&self, _username: &str, _password: &str) -> Result<Option<String>, crate::error::StoreError> {
            Ok(None)
        }
        async fn save_server_connection(
            &self,
            _user_id: &str,
            _sc: &crate::model::ServerConnectionInfo,
        ) -> Result<(), crate::error::StoreError> {
            Ok(())
        }
        async fn load_server_connection(
            &self,
            _user_id: &str,
            _name: &str,
        ) -> Result<Option<crate::model::ServerConnectionInfo>, crate::error::StoreError> {
            Ok(None)
        }
        async fn load_server_connections(
            &self,
            _user_id: &str,
        ) -> Result<Vec<crate::model::ServerConnectionInfo>, crate::error::StoreError> {
            Ok(vec![])
        }
        async fn delete_server_connection(&self, _user_id: &str, _name: &str) -> Result<(), crate::error::StoreError> {
            Ok(())
        }
        async fn global_salt(&self) -> Result<String, crate::error::StoreError> {
            Ok("salt".to_string())
        }
    }

    /// A Listener with a live loopback socket but no bound user/server,
    /// for exercising capability filters and registration-lock logic in
    /// isolation.
    pub async fn bare_listener() -> Arc<Listener> {
        let tcp_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp_listener.local_addr().unwrap();
        let (client_half, (server_half, _)) =
            tokio::try_join!(tokio::net::TcpStream::connect(addr), tcp_listener.accept()).unwrap();
        // Keep the peer half alive for the socket's lifetime by leaking it;
        // these are short-lived unit-test sockets, never written to.
        std::mem::forget(server_half);

        let ctx = Arc::new(ListenerContext {
            bus: Arc::new(Bus::builder()),
            store: Arc::new(NullStore),
            users: Arc::new(dashmap::DashMap::new()),
            status_nick: "*status".to_string(),
            product_host: "bnc".to_string(),
        });
        Listener::new(Arc::new(FramedSocket::tcp(client_half)), ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_nick_rejects_whitespace_and_reserved_chars() {
        assert!(validate_nick("ok_nick").is_ok());
        assert!(validate_nick("bad nick").is_err());
        assert!(validate_nick("bad,nick").is_err());
        assert!(validate_nick("").is_err());
    }

    #[test]
    fn validate_bnc_name_rejects_leading_digit() {
        assert!(validate_bnc_name("freenode").is_ok());
        assert!(validate_bnc_name("1freenode").is_err());
    }

    #[tokio::test]
    async fn registration_completes_only_once_all_locks_set() {
        let listener = test_support::bare_listener().await;
        assert!(!listener.is_registered());
        {
            let mut locks = listener.locks.lock().await;
            locks.nick = true;
            locks.user = true;
            // cap defaults true, pass still false.
            assert!(!locks.all_set());
        }
    }
}
