pub use bitfield::*;
pub use chunk::*;
pub use digest::*;

mod bitfield;
mod chunk;
mod digest;

use crate::engine::{PieceIndex, MAX_BLOCK_SIZE};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// The result type for piece data operations.
pub type DataResult<T> = std::result::Result<T, DataError>;

/// The piece data specific errors.
/// These errors can occur when working with [ChunkDescriptor] or [Bitfield] operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DataError {
    /// Indicates that a write or read exceeds the chunk data range
    #[error("data range exceeds the chunk size, chunk size {0} but got {1}")]
    OutOfRange(usize, usize),
    /// Indicates that the given piece index is unknown
    #[error("piece index {0} is invalid")]
    InvalidPiece(PieceIndex),
    /// Indicates that the given block index is unknown within the chunk
    #[error("block index {0} is invalid")]
    InvalidBlock(usize),
}

/// The complete piece data model of a single torrent.
///
/// It combines the verified-piece [Bitfield] with the per-piece block bookkeeping of the
/// [ChunkDescriptor]s. The bitfield and each chunk are individually locked, allowing
/// concurrent data worker tasks to make progress on different pieces.
#[derive(Debug)]
pub struct TorrentData {
    bitfield: RwLock<Bitfield>,
    chunks: Vec<Mutex<ChunkDescriptor>>,
}

impl TorrentData {
    /// Create the data model for a torrent with the given layout.
    ///
    /// # Arguments
    ///
    /// * `piece_length` - The length in bytes of every piece except possibly the last one.
    /// * `total_length` - The total length in bytes of the torrent data.
    /// * `checksums` - The expected digest of each piece, indexed by piece.
    pub fn new(piece_length: usize, total_length: u64, checksums: Vec<Checksum>) -> Self {
        let bitfield = Bitfield::new(checksums.len(), piece_length, total_length);
        let mut chunks = Vec::with_capacity(checksums.len());

        for (piece, checksum) in checksums.into_iter().enumerate() {
            let offset = piece as u64 * piece_length as u64;
            let length = bitfield.piece_length(piece);
            chunks.push(Mutex::new(ChunkDescriptor::new(
                piece,
                offset,
                length,
                MAX_BLOCK_SIZE,
                checksum,
            )));
        }

        Self {
            bitfield: RwLock::new(bitfield),
            chunks,
        }
    }

    /// Get the total number of pieces within the torrent.
    pub fn total_pieces(&self) -> usize {
        self.chunks.len()
    }

    /// Get the chunk descriptor lock of the given piece.
    pub fn chunk(&self, piece: PieceIndex) -> DataResult<&Mutex<ChunkDescriptor>> {
        self.chunks.get(piece).ok_or(DataError::InvalidPiece(piece))
    }

    /// Get the verified-piece bitfield lock of the torrent.
    pub fn bitfield(&self) -> &RwLock<Bitfield> {
        &self.bitfield
    }

    /// Check if the given piece has been verified.
    pub async fn is_piece_verified(&self, piece: PieceIndex) -> bool {
        self.bitfield.read().await.is_verified(piece)
    }

    /// Get the number of pieces that still need to be downloaded.
    pub async fn pieces_remaining(&self) -> usize {
        self.bitfield.read().await.pieces_remaining()
    }
}
