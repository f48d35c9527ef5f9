//! In-process typed event bus (spec.md §4.3).
//!
//! Handlers are registered under a name at startup and invoked in
//! registration order on the caller's own task — there is no queue, so a
//! handler must not block longer than the caller is willing to wait.
//! Events carry a `halt` field: once any handler sets it, later handlers in
//! the same dispatch still run (so every interested subsystem gets to see
//! the line), but the pipeline stage that triggered dispatch treats the
//! line as consumed.

use std::sync::Arc;

use bnc_proto::IrcMessage;

use crate::listener::Listener;
use crate::model::UserId;
use crate::server::ServerConnection;

/// `irc.raw` — dispatched for every line entering or leaving the bouncer,
/// in either direction.
pub struct IrcRawEvent {
    /// The listener this line is associated with, if any.
    pub listener: Option<Arc<Listener>>,
    /// The authenticated user, if known.
    pub user: Option<UserId>,
    /// The server connection this line is associated with, if any.
    pub server: Option<Arc<ServerConnection>>,
    /// True if this line came from an attached client.
    pub from_client: bool,
    /// True if this line came from the upstream network.
    pub from_server: bool,
    /// The raw wire text, pre-parse.
    pub raw: String,
    /// The parsed message. Handlers may mutate it (e.g. to inject tags);
    /// mutations are visible downstream and to the eventual send/forward.
    pub message: IrcMessage,
    /// Set by a handler to mark this line as consumed.
    pub halt: bool,
}

/// `listener.new` — a listener has just been accepted. Setting `halt`
/// causes immediate disconnect (used by extensions enforcing connection
/// limits or IP policy).
pub struct ListenerNewEvent {
    /// The newly accepted listener.
    pub listener: Arc<Listener>,
    /// Set to refuse this connection.
    pub halt: bool,
}

/// `listener.close` — a listener's socket has closed.
pub struct ListenerCloseEvent {
    /// The listener that closed.
    pub listener: Arc<Listener>,
}

/// `state.sent` — emitted right after a listener has received its
/// registration replay (or the nil-connect block, if unbound).
pub struct StateSentEvent {
    /// The listener that just finished replay.
    pub listener: Arc<Listener>,
    /// The server connection it is bound to, if any.
    pub server: Option<Arc<ServerConnection>>,
}

type IrcRawHandler = Box<dyn Fn(&mut IrcRawEvent) + Send + Sync>;
type ListenerNewHandler = Box<dyn Fn(&mut ListenerNewEvent) + Send + Sync>;
type ListenerCloseHandler = Box<dyn Fn(&ListenerCloseEvent) + Send + Sync>;
type StateSentHandler = Box<dyn Fn(&StateSentEvent) + Send + Sync>;

/// The process-wide event bus. Built once via [`Bus::builder`] during
/// startup, then shared read-only behind an `Arc`.
#[derive(Default)]
pub struct Bus {
    irc_raw: Vec<IrcRawHandler>,
    listener_new: Vec<ListenerNewHandler>,
    listener_close: Vec<ListenerCloseHandler>,
    state_sent: Vec<StateSentHandler>,
}

impl Bus {
    /// Start building a bus. Extensions register against this during
    /// `Manager` construction; nothing may register afterward.
    #[must_use]
    pub fn builder() -> Bus {
        Bus::default()
    }

    /// Register an `irc.raw` handler.
    pub fn on_irc_raw(&mut self, f: impl Fn(&mut IrcRawEvent) + Send + Sync + 'static) {
        self.irc_raw.push(Box::new(f));
    }

    /// Register a `listener.new` handler.
    pub fn on_listener_new(&mut self, f: impl Fn(&mut ListenerNewEvent) + Send + Sync + 'static) {
        self.listener_new.push(Box::new(f));
    }

    /// Register a `listener.close` handler.
    pub fn on_listener_close(&mut self, f: impl Fn(&ListenerCloseEvent) + Send + Sync + 'static) {
        self.listener_close.push(Box::new(f));
    }

    /// Register a `state.sent` handler.
    pub fn on_state_sent(&mut self, f: impl Fn(&StateSentEvent) + Send + Sync + 'static) {
        self.state_sent.push(Box::new(f));
    }

    /// Dispatch `irc.raw` to every registered handler in registration order.
    pub fn dispatch_irc_raw(&self, ev: &mut IrcRawEvent) {
        for handler in &self.irc_raw {
            handler(ev);
        }
    }

    /// Dispatch `listener.new`.
    pub fn dispatch_listener_new(&self, ev: &mut ListenerNewEvent) {
        for handler in &self.listener_new {
            handler(ev);
        }
    }

    /// Dispatch `listener.close`.
    pub fn dispatch_listener_close(&self, ev: &ListenerCloseEvent) {
        for handler in &self.listener_close {
            handler(ev);
        }
    }

    /// Dispatch `state.sent`.
    pub fn dispatch_state_sent(&self, ev: &StateSentEvent) {
        for handler in &self.state_sent {
            handler(ev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn handlers_run_in_registration_order_and_all_run_after_halt() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut bus = Bus::builder();
        let o1 = order.clone();
        bus.on_irc_raw(move |ev| {
            o1.lock().unwrap().push(1);
            ev.halt = true;
        });
        let o2 = order.clone();
        bus.on_irc_raw(move |_ev| {
            o2.lock().unwrap().push(2);
        });

        let mut ev = IrcRawEvent {
            listener: None,
            user: None,
            server: None,
            from_client: true,
            from_server: false,
            raw: "PING :x".into(),
            message: "PING :x".parse().unwrap(),
            halt: false,
        };
        bus.dispatch_irc_raw(&mut ev);
        assert!(ev.halt);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn dispatch_invokes_every_registered_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut bus = Bus::builder();
        let c = calls.clone();
        bus.on_irc_raw(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let mut ev = IrcRawEvent {
            listener: None,
            user: None,
            server: None,
            from_client: false,
            from_server: true,
            raw: "PING :x".into(),
            message: "PING :x".parse().unwrap(),
            halt: false,
        };
        bus.dispatch_irc_raw(&mut ev);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
