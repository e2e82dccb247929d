use crate::engine::peer::BlockKey;
use crate::engine::PieceIndex;
use std::io;
use thiserror::Error;

/// The peer operation specific [std::result::Result] type
pub type Result<T> = std::result::Result<T, Error>;

/// Indicates that an error occurred while communicating with a peer
#[derive(Debug, Error)]
pub enum Error {
    /// Indicates that an invalid message length has been received
    #[error("invalid message length, expected {0} but got {1}")]
    InvalidLength(u32, u32),
    /// Indicates that an invalid piece index has been received
    #[error("piece index {0} is invalid")]
    InvalidPiece(PieceIndex),
    /// Indicates that a received bitfield does not match the torrent piece count
    #[error("bitfield has wrong size, expected {0} pieces but got {1} bits")]
    InvalidBitfield(usize, usize),
    /// Indicates that a block was received which was never requested
    #[error("received unexpected block {0}")]
    UnexpectedBlock(BlockKey),
    /// Indicates that an invalid block request has been received
    #[error("received invalid block request {0}")]
    InvalidBlockRequest(BlockKey),
    /// Indicates that a received message is unsupported
    #[error("unsupported message type {0}")]
    UnsupportedMessage(u8),
    /// Indicates that a received message couldn't be parsed
    #[error("failed to parse message, {0}")]
    Parsing(String),
    /// Indicates that an io error occurred
    #[error("an io error occurred, {0}")]
    Io(io::Error),
    /// Indicates that the peer connection is closed
    #[error("the peer connection is closed")]
    Closed,
}

impl Error {
    /// Check if this error is a violation of the exchange protocol by the remote peer.
    /// Protocol violations are fatal to the connection and may place the peer under a
    /// temporary ban.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::InvalidLength(_, _)
                | Error::InvalidPiece(_)
                | Error::InvalidBitfield(_, _)
                | Error::UnexpectedBlock(_)
                | Error::InvalidBlockRequest(_)
                | Error::UnsupportedMessage(_)
                | Error::Parsing(_)
        )
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::InvalidLength(_, _), Error::InvalidLength(_, _)) => true,
            (Error::InvalidPiece(a), Error::InvalidPiece(b)) => a == b,
            (Error::InvalidBitfield(_, _), Error::InvalidBitfield(_, _)) => true,
            (Error::UnexpectedBlock(a), Error::UnexpectedBlock(b)) => a == b,
            (Error::InvalidBlockRequest(a), Error::InvalidBlockRequest(b)) => a == b,
            (Error::UnsupportedMessage(a), Error::UnsupportedMessage(b)) => a == b,
            (Error::Parsing(_), Error::Parsing(_)) => true,
            (Error::Io(_), Error::Io(_)) => true,
            (Error::Closed, Error::Closed) => true,
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_from_io() {
        let error = io::Error::from(io::ErrorKind::UnexpectedEof);

        let result = Error::from(error);

        if let Error::Io(_) = result {
            return;
        } else {
            assert!(false, "expected Error::Io, got {:?} instead", result)
        }
    }

    #[test]
    fn test_error_is_protocol_violation() {
        let key = BlockKey::new(0, 0, 16384);

        assert_eq!(true, Error::UnexpectedBlock(key).is_protocol_violation());
        assert_eq!(true, Error::UnsupportedMessage(42).is_protocol_violation());
        assert_eq!(
            false,
            Error::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_protocol_violation()
        );
        assert_eq!(false, Error::Closed.is_protocol_violation());
    }
}
