//! Upstream client (spec.md §4.5): one connection to one IRC network.
//!
//! The spec describes the reader's dispatch as a string-keyed handler table
//! (named commands, plus the pseudo-names `ALL` and `CLOSED`). This carries
//! the same contract over a task+channel model instead, per the design
//! notes in spec.md §9 ("generalizes to any task+channel or reactor
//! model"): the client runs its own protocol state machine internally (the
//! "named handlers" for 001/005/433/NICK/PING/CAP) and forwards every
//! inbound line, in order, to the owner over an unbounded channel (the
//! `ALL` semantics), closing the channel when the reader returns (the
//! `CLOSED` semantics).

mod handlers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bnc_proto::{FramedSocket, IrcMessage, Prefix};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::model::Address;
use crate::tls;

/// One line arriving from the upstream network, or the terminal close event.
pub enum UpstreamEvent {
    /// A parsed inbound line.
    Line(IrcMessage),
    /// The reader returned; the connection is down.
    Closed,
}

/// Connection parameters fixed for the lifetime of one `Connect()` attempt.
#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    /// Candidate addresses, tried in order.
    pub addresses: Vec<Address>,
    /// Desired nick.
    pub nickname: String,
    /// Fallback nick if the primary is rejected pre-registration.
    pub nickname_fallback: String,
    /// Ident/username sent in USER.
    pub username: String,
    /// Realname sent in USER.
    pub realname: String,
    /// Upstream PASS value, if required.
    pub connect_password: Option<String>,
    /// Capability set requested on CAP LS.
    pub wanted_caps: Vec<String>,
}

/// Mutable protocol state, guarded by one lock per spec.md §5
/// ("read/write lock guarding Nick, HasRegistered, Caps, and Supported").
#[derive(Debug, Default)]
pub struct UpstreamState {
    /// Current nick, updated on 001 and on NICK-from-self.
    pub nick: String,
    /// True once RPL_WELCOME has been seen for this connection.
    pub has_registered: bool,
    /// Capabilities the server advertised on CAP LS.
    pub available_caps: Vec<String>,
    /// Capabilities actually ACKed.
    pub enabled_caps: Vec<String>,
    /// Parsed RPL_ISUPPORT tokens.
    pub supported: std::collections::BTreeMap<String, Option<String>>,
    /// Number of 433 (nick-in-use) retries seen this connection attempt.
    /// Drives `on_nick_in_use`'s suffix-growth-then-fallback-nick policy.
    pub nick_retries: u8,
}

/// Coarse connection phase, polled by `ServerConnection::dump_registration`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No socket open.
    Disconnected,
    /// Dial in progress.
    Connecting,
    /// Socket open; registration may or may not have completed yet.
    Connected,
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("already connected or connecting")]
    AlreadyConnecting,
    #[error("empty nickname, username, or realname")]
    IncompleteCredentials,
    #[error("no addresses configured")]
    NoAddresses,
    #[error("all candidate addresses failed; last error: {0}")]
    AllAddressesFailed(String),
}

/// One persistent connection to one IRC network.
pub struct UpstreamClient {
    config: RwLock<UpstreamConfig>,
    state: RwLock<UpstreamState>,
    phase: RwLock<Phase>,
    socket: RwLock<Option<Arc<FramedSocket>>>,
    connecting: AtomicBool,
    inbound_tx: mpsc::UnboundedSender<UpstreamEvent>,
}

impl UpstreamClient {
    /// Build a client and return it along with the receiving half of its
    /// inbound event channel (owned by the enclosing `ServerConnection`).
    #[must_use]
    pub fn new(config: UpstreamConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<UpstreamEvent>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let client = Arc::new(UpstreamClient {
            config: RwLock::new(config),
            state: RwLock::new(UpstreamState::default()),
            phase: RwLock::new(Phase::Disconnected),
            socket: RwLock::new(None),
            connecting: AtomicBool::new(false),
            inbound_tx,
        });
        (client, inbound_rx)
    }

    /// Current connection phase.
    pub async fn phase(&self) -> Phase {
        *self.phase.read().await
    }

    /// Current nick, as tracked from 001/NICK traffic.
    pub async fn nick(&self) -> String {
        self.state.read().await.nick.clone()
    }

    /// Whether RPL_WELCOME has been observed on the current connection.
    pub async fn has_registered(&self) -> bool {
        self.state.read().await.has_registered
    }

    /// Dial, per spec.md §4.5: refuse if already connected/connecting,
    /// require nonempty credentials, try addresses in order.
    pub async fn connect(self: &Arc<Self>) -> Result<(), UpstreamError> {
        if self.connecting.swap(true, Ordering::SeqCst) {
            return Err(UpstreamError::AlreadyConnecting);
        }
        let result = self.connect_inner().await;
        if result.is_err() {
            self.connecting.store(false, Ordering::SeqCst);
            *self.phase.write().await = Phase::Disconnected;
        }
        result
    }

    async fn connect_inner(&self) -> Result<(), UpstreamError> {
        let config = self.config.read().await.clone();
        if config.nickname.trim().is_empty() || config.username.trim().is_empty() || config.realname.trim().is_empty()
        {
            return Err(UpstreamError::IncompleteCredentials);
        }
        if config.addresses.is_empty() {
            return Err(UpstreamError::NoAddresses);
        }

        *self.phase.write().await = Phase::Connecting;

        let mut last_err = String::new();
        for addr in &config.addresses {
            match self.dial_one(addr).await {
                Ok(socket) => {
                    *self.socket.write().await = Some(socket.clone());
                    {
                        let mut state = self.state.write().await;
                        state.nick = config.nickname.clone();
                        state.has_registered = false;
                        state.available_caps.clear();
                        state.enabled_caps.clear();
                        state.supported.clear();
                    }
                    *self.phase.write().await = Phase::Connected;
                    self.spawn_reader(socket.clone());
                    if let Some(pass) = &config.connect_password {
                        let _ = socket.send_line(IrcMessage::new("PASS", vec![pass.clone()]).to_string());
                    }
                    let _ = socket.send_line(IrcMessage::new("CAP", vec!["LS".into(), "302".into()]).to_string());
                    let _ = socket.send_line(IrcMessage::new("NICK", vec![config.nickname.clone()]).to_string());
                    let _ = socket.send_line(
                        IrcMessage::new(
                            "USER",
                            vec![config.username.clone(), "0".into(), "*".into(), config.realname.clone()],
                        )
                        .to_string(),
                    );
                    info!(host = %addr.host, port = addr.port, "upstream connected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(host = %addr.host, port = addr.port, error = %e, "upstream dial failed");
                    last_err = e;
                }
            }
        }
        Err(UpstreamError::AllAddressesFailed(last_err))
    }

    async fn dial_one(&self, addr: &Address) -> Result<Arc<FramedSocket>, String> {
        let tcp = TcpStream::connect((addr.host.as_str(), addr.port)).await.map_err(|e| e.to_string())?;
        if !addr.use_tls {
            return Ok(Arc::new(FramedSocket::tcp(tcp)));
        }
        let connector = TlsConnector::from(tls::client_config(addr.verify_tls));
        let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from(addr.host.clone())
            .map_err(|e| format!("invalid TLS server name {}: {e}", addr.host))?;
        let tls_stream = connector.connect(server_name, tcp).await.map_err(|e| e.to_string())?;
        Ok(Arc::new(FramedSocket::tls_client(tls_stream)))
    }

    fn spawn_reader(self: &Arc<Self>, socket: Arc<FramedSocket>) {
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                match socket.recv_line().await {
                    Ok(Some(line)) => {
                        let msg: IrcMessage = match line.parse() {
                            Ok(m) => m,
                            Err(e) => {
                                debug!(%line, error = %e, "dropping malformed upstream line");
                                continue;
                            }
                        };
                        handlers::handle_inbound(&client, &socket, &msg).await;
                        let _ = client.inbound_tx.send(UpstreamEvent::Line(msg));
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            client.on_closed().await;
        });
    }

    async fn on_closed(&self) {
        *self.phase.write().await = Phase::Disconnected;
        self.state.write().await.has_registered = false;
        *self.socket.write().await = None;
        self.connecting.store(false, Ordering::SeqCst);
        let _ = self.inbound_tx.send(UpstreamEvent::Closed);
    }

    /// Send one line upstream, if connected.
    pub async fn send(&self, msg: &IrcMessage) {
        if let Some(socket) = self.socket.read().await.as_ref() {
            let _ = socket.send_line(msg.to_string());
        }
    }

    /// Close the underlying socket, if any.
    pub async fn close(&self) {
        if let Some(socket) = self.socket.read().await.as_ref() {
            socket.close().await;
        }
    }

    /// `wanted ∩ available` capability names, read-only snapshot.
    pub async fn snapshot_state(&self) -> UpstreamState {
        let state = self.state.read().await;
        UpstreamState {
            nick: state.nick.clone(),
            has_registered: state.has_registered,
            available_caps: state.available_caps.clone(),
            enabled_caps: state.enabled_caps.clone(),
            supported: state.supported.clone(),
            nick_retries: state.nick_retries,
        }
    }

    /// Update the desired nick (used when the bound client issues NICK
    /// while registered); does not itself send anything upstream.
    pub async fn set_desired_nick(&self, nick: String) {
        self.config.write().await.nickname = nick;
    }

    /// The BNC-side status/server prefix used when synthesizing replies.
    #[must_use]
    pub fn server_prefix(product_host: &str) -> Prefix {
        Prefix::ServerName(product_host.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> UpstreamConfig {
        UpstreamConfig {
            addresses: vec![],
            nickname: "alice".into(),
            nickname_fallback: "alice_".into(),
            username: "alice".into(),
            realname: "Alice".into(),
            connect_password: None,
            wanted_caps: vec!["server-time".into()],
        }
    }

    #[tokio::test]
    async fn connect_rejects_empty_address_list() {
        let (client, _rx) = UpstreamClient::new(sample_config());
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, UpstreamError::NoAddresses));
    }

    #[tokio::test]
    async fn connect_rejects_incomplete_credentials() {
        let mut config = sample_config();
        config.addresses.push(Address { host: "irc.example.org".into(), port: 6667, use_tls: false, verify_tls: true });
        config.username.clear();
        let (client, _rx) = UpstreamClient::new(config);
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, UpstreamError::IncompleteCredentials));
    }

    #[tokio::test]
    async fn fresh_client_reports_disconnected() {
        let (client, _rx) = UpstreamClient::new(sample_config());
        assert_eq!(client.phase().await, Phase::Disconnected);
    }
}
