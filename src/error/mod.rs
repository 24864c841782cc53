use crate::connection::ConnectionStatus;
use crate::transport::TransportError;
use thiserror::Error;

/// An operation was issued in a connection state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionStateError {
    #[error("already attached to the peer")]
    AlreadyAttached,
    #[error("peer reported itself unavailable")]
    PeerUnavailable,
    #[error("a connect attempt is already in flight")]
    ConnectInProgress,
    #[error("not attached to a peer")]
    NotAttached,
    #[error("a placed call is still waiting for its id")]
    CallPending,
}

/// Terminal handshake status reported by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("peer refused the attach request: {status:?}")]
pub struct PeerRefusal {
    pub status: ConnectionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error(transparent)]
    State(#[from] ConnectionStateError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Refused(#[from] PeerRefusal),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("client delivery loop has stopped")]
    Closed,
}
