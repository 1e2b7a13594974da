//! Error taxonomy shared by the signaling link, the negotiator and the
//! vessel session.

use thiserror::Error;

/// Errors surfaced to the caller of the protocol engine.
///
/// Negotiation-internal failures (rejected candidates, description mismatches)
/// are logged and absorbed where they happen and only reach the caller as
/// [`Error::Transport`] when a collaborator call is made on its behalf.
#[derive(Debug, Error)]
pub enum Error {
    /// A control message was sent while the signaling link had no open connection.
    #[error("cannot send message, signaling link is not connected")]
    NotConnected,
    /// Contact was attempted before the vessel identity was set.
    #[error("cannot contact the monitoring party, identity is not set")]
    MissingIdentity,
    /// A `request` control message had no recognized shape.
    #[error("received invalid request: {0}")]
    InvalidRequest(String),
    /// The signaling target could not be turned into a connection address.
    #[error("invalid signaling address: {0}")]
    InvalidAddress(String),
    /// The message channel or the peer transport rejected an operation.
    #[error("transport error: {0}")]
    Transport(String),
    /// An outbound control message could not be encoded.
    #[error("failed to serialize control message: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Wraps any displayable collaborator error as [`Error::Transport`].
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Error::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
