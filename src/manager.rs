//! Process orchestrator (spec.md §6): loads users and their server
//! connections from the store, autostarts enabled ones, accepts listeners
//! (plain and TLS), and wires the control/bouncer/logger extensions onto
//! one shared [`Bus`].

use std::net::SocketAddr;
use std::sync::Arc;

use bnc_proto::FramedSocket;
use tokio::net::TcpListener as TokioTcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::bus::{Bus, ListenerNewEvent};
use crate::config::Config;
use crate::ext;
use crate::listener::{Listener, ListenerContext};
use crate::model::UserId;
use crate::server::ServerConnection;
use crate::store::Store;
use crate::tls;
use crate::user::RuntimeUser;

/// Owns the shared bus/context built at startup and the accept loops that
/// feed it.
pub struct Manager {
    ctx: Arc<ListenerContext>,
}

impl Manager {
    /// Build the runtime: load every user and network from `store`, wire
    /// the bundled extensions, autostart enabled connections. Does not yet
    /// listen; call [`Self::run`] for that.
    pub async fn new(config: &Config, store: Arc<dyn Store>) -> anyhow::Result<Arc<Manager>> {
        let users: Arc<dashmap::DashMap<UserId, Arc<RuntimeUser>>> = Arc::new(dashmap::DashMap::new());

        // Extensions are registered against a context built before the real
        // bus exists -- a bus can't both hold the handlers being registered
        // and live inside the Arc those same handlers close over. None of
        // the three read `ctx.bus` themselves (they only react to what the
        // core dispatches), so registering them against this throwaway one
        // is harmless. Listeners and ServerConnections use the real `ctx`
        // built further down, once `bus` is complete.
        let bootstrap_ctx = Arc::new(ListenerContext {
            bus: Arc::new(Bus::builder()),
            store: store.clone(),
            users: users.clone(),
            status_nick: config.bouncer.status_nick.clone(),
            product_host: config.bouncer.product_host.clone(),
        });

        let mut bus = Bus::builder();
        ext::control::register(&mut bus, bootstrap_ctx.clone());
        ext::bouncer_protocol::register(&mut bus, bootstrap_ctx.clone());
        if let Some(logging) = &config.bouncer.logging {
            let message_store = ext::logger::open(logging).await?;
            ext::logger::register(&mut bus, bootstrap_ctx.clone(), message_store);
        }

        let ctx = Arc::new(ListenerContext {
            bus: Arc::new(bus),
            store: store.clone(),
            users,
            status_nick: config.bouncer.status_nick.clone(),
            product_host: config.bouncer.product_host.clone(),
        });

        let manager = Arc::new(Manager { ctx });
        manager.load_users().await?;
        Ok(manager)
    }

    async fn load_users(&self) -> anyhow::Result<()> {
        let infos = self.ctx.store.load_users().await?;
        for info in infos {
            let user = RuntimeUser::new(info);
            let user_id = user.id().await;
            let connections = self.ctx.store.load_server_connections(&user_id.0).await?;
            for sc_info in connections {
                let enabled = sc_info.enabled;
                let name = sc_info.name.clone();
                let sc =
                    ServerConnection::new(sc_info, self.ctx.clone(), self.ctx.store.clone(), Arc::downgrade(&user));
                user.insert_network(name.clone(), sc.clone()).await;
                if enabled {
                    tokio::spawn(async move {
                        if let Err(e) = sc.connect().await {
                            warn!(network = %name, error = %e, "autostart connect failed");
                        }
                    });
                }
            }
            self.ctx.users.insert(user_id, user);
        }
        Ok(())
    }

    /// Bind every configured listener and run until SIGINT/SIGTERM.
    pub async fn run(self: Arc<Self>, config: &Config) -> anyhow::Result<()> {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        tokio::spawn(wait_for_signal(shutdown_tx.clone()));

        let mut tasks = Vec::new();

        for addr in &config.bouncer.listeners {
            let tcp = TokioTcpListener::bind(*addr).await?;
            info!(%addr, "listening (plain)");
            let ctx = self.ctx.clone();
            let mut rx = shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move { accept_plain(tcp, ctx, &mut rx).await }));
        }

        for (addr, tls_cfg) in &config.bouncer.tls_listeners {
            let tcp = TokioTcpListener::bind(*addr).await?;
            let server_config = tls::server_config(&tls_cfg.cert, &tls_cfg.key)?;
            let acceptor = TlsAcceptor::from(server_config);
            info!(%addr, "listening (tls)");
            let ctx = self.ctx.clone();
            let mut rx = shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move { accept_tls(tcp, acceptor, ctx, &mut rx).await }));
        }

        if tasks.is_empty() {
            warn!("no listeners configured; bouncer is idle");
        }

        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

async fn wait_for_signal(shutdown_tx: broadcast::Sender<()>) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }
    let _ = shutdown_tx.send(());
}

async fn accept_plain(listener: TokioTcpListener, ctx: Arc<ListenerContext>, shutdown: &mut broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => { warn!(error = %e, "accept failed"); continue; }
                };
                let _ = stream.set_nodelay(true);
                spawn_listener(FramedSocket::tcp(stream), ctx.clone(), peer);
            }
            _ = shutdown.recv() => return,
        }
    }
}

async fn accept_tls(
    listener: TokioTcpListener,
    acceptor: TlsAcceptor,
    ctx: Arc<ListenerContext>,
    shutdown: &mut broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => { warn!(error = %e, "accept failed"); continue; }
                };
                let acceptor = acceptor.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => spawn_listener(FramedSocket::tls_server(tls_stream), ctx, peer),
                        Err(e) => warn!(error = %e, %peer, "TLS handshake failed"),
                    }
                });
            }
            _ = shutdown.recv() => return,
        }
    }
}

fn spawn_listener(socket: FramedSocket, ctx: Arc<ListenerContext>, peer: SocketAddr) {
    let listener = Listener::new(Arc::new(socket), ctx.clone());
    let mut ev = ListenerNewEvent { listener: listener.clone(), halt: false };
    ctx.bus.dispatch_listener_new(&mut ev);
    if ev.halt {
        info!(%peer, "connection refused by extension");
        return;
    }
    info!(%peer, "accepted connection");
    tokio::spawn(listener.run());
}
