//! Unified error hierarchy, following the teacher's `HandlerError`/store-error
//! split: typed leaf errors convertible to an IRC reply, `anyhow` at the
//! process boundary.

use bnc_proto::{IrcMessage, Prefix, Response};
use thiserror::Error;

/// Errors surfaced while handling one line from a listener.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Not enough parameters for the command.
    #[error("not enough parameters")]
    NeedMoreParams,

    /// Sent a command that requires registration before it completed.
    #[error("not registered")]
    NotRegistered,

    /// Attempted to re-register (NICK/USER/CAP after completion, outside
    /// the one case — nick change — that's allowed post-registration).
    #[error("already registered")]
    AlreadyRegistered,

    /// PASS failed authentication; the caller has already queued `464` and
    /// must close the socket.
    #[error("access denied")]
    AccessDenied,

    /// Nickname failed validation (§4.7.2).
    #[error("erroneous nickname: {0}")]
    ErroneousNickname(String),

    /// Client requested to quit; the caller should *not* close the
    /// upstream (QUIT from a bouncer client just means "going away").
    #[error("quit")]
    Quit,

    /// Internal error not meant for client display.
    #[error("internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Render as a client-visible IRC reply, or `None` for internal-only
    /// errors (mirrors the teacher's `to_irc_reply`).
    #[must_use]
    pub fn to_irc_reply(&self, server_name: &str, nick: &str) -> Option<IrcMessage> {
        let prefix = Prefix::ServerName(server_name.to_string());
        match self {
            HandlerError::NeedMoreParams => Some(IrcMessage::numeric(
                prefix,
                Response::ERR_NEEDMOREPARAMS,
                vec![nick.to_string(), "Not enough parameters".to_string()],
            )),
            HandlerError::NotRegistered => Some(IrcMessage::numeric(
                prefix,
                Response::ERR_NOTREGISTERED,
                vec!["*".to_string(), "You have not registered".to_string()],
            )),
            HandlerError::AlreadyRegistered => Some(IrcMessage::numeric(
                prefix,
                Response::ERR_ALREADYREGISTERED,
                vec![nick.to_string(), "You may not reregister".to_string()],
            )),
            // 422, not 432: the original reuses ERR_NOMOTD's numeral for a
            // rejected nickname rather than ERR_ERRONEUSNICKNAME.
            HandlerError::ErroneousNickname(bad) => Some(IrcMessage::numeric(
                prefix,
                Response::ERR_NOMOTD,
                vec![nick.to_string(), bad.clone(), "Erroneous nickname".to_string()],
            )),
            HandlerError::AccessDenied | HandlerError::Quit | HandlerError::Internal(_) => None,
        }
    }
}

/// Errors returned by a [`crate::store::Store`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying storage engine failed.
    #[error("storage backend error: {0}")]
    Backend(String),
    /// Serialization of a stored record failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// No such user.
    #[error("no such user: {0}")]
    NoSuchUser(String),
    /// No such server connection.
    #[error("no such server connection: {0}/{1}")]
    NoSuchServerConnection(String, String),
}
