use crate::engine::data::DataError;
use crate::engine::peer::PeerHandle;
use crate::engine::{peer, storage};
use std::net::SocketAddr;
use thiserror::Error;

/// The result type for the engine package.
pub type Result<T> = std::result::Result<T, EngineError>;

/// The errors that can occur while operating the exchange engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Indicates that the given peer address is temporarily banned
    #[error("peer address {0} is banned")]
    Banned(SocketAddr),
    /// Indicates that the given peer handle is unknown to the engine
    #[error("peer {0} is unknown")]
    UnknownPeer(PeerHandle),
    /// Indicates that the engine has been stopped
    #[error("the engine has been stopped")]
    Stopped,
    #[error("peer error: {0}")]
    Peer(peer::Error),
    #[error("a piece data error occurred, {0}")]
    Data(DataError),
    #[error("a storage error occurred, {0}")]
    Storage(storage::Error),
}

impl PartialEq for EngineError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (EngineError::Banned(a), EngineError::Banned(b)) => a == b,
            (EngineError::UnknownPeer(a), EngineError::UnknownPeer(b)) => a == b,
            (EngineError::Stopped, EngineError::Stopped) => true,
            (EngineError::Peer(a), EngineError::Peer(b)) => a == b,
            (EngineError::Data(a), EngineError::Data(b)) => a == b,
            (EngineError::Storage(a), EngineError::Storage(b)) => a == b,
            _ => false,
        }
    }
}

impl From<peer::Error> for EngineError {
    fn from(error: peer::Error) -> Self {
        Self::Peer(error)
    }
}

impl From<DataError> for EngineError {
    fn from(error: DataError) -> Self {
        Self::Data(error)
    }
}

impl From<storage::Error> for EngineError {
    fn from(error: storage::Error) -> Self {
        Self::Storage(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_from_peer_error() {
        let err = peer::Error::Closed;

        let result: EngineError = err.into();

        assert_eq!(EngineError::Peer(peer::Error::Closed), result);
    }

    #[test]
    fn test_engine_error_from_data_error() {
        let err = DataError::OutOfRange(10, 16);

        let result: EngineError = err.into();

        assert_eq!(EngineError::Data(DataError::OutOfRange(10, 16)), result);
    }
}
