//! # bnc-proto
//!
//! Line-oriented IRC protocol toolkit for `bncd`.
//!
//! Covers just what a bouncer needs: a tagged-line parser/serializer, IRC
//! numeric constants, a prefix type, an ISUPPORT line builder, case folding,
//! and (behind the `tokio` feature, on by default) a framed socket with a
//! bounded outbound queue.
//!
//! This crate carries no bouncer semantics; it is a context-free IRC line
//! toolkit, the same relationship `slirc-proto` has to `slircd-ng`.

pub mod casemap;
pub mod error;
pub mod isupport;
pub mod message;
pub mod prefix;
pub mod response;
pub mod tags;

#[cfg(feature = "tokio")]
pub mod transport;

pub use casemap::{irc_eq, irc_to_lower};
pub use error::ProtocolError;
pub use isupport::IsupportBuilder;
pub use message::IrcMessage;
pub use prefix::Prefix;
pub use response::Response;
pub use tags::Tag;

#[cfg(feature = "tokio")]
pub use transport::{FramedSocket, TransportError};
