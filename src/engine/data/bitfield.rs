use crate::engine::PieceIndex;
use bit_vec::BitVec;
use std::fmt::{Debug, Formatter};

/// The verified-piece status of a torrent.
///
/// Each piece is either `absent` or `verified`; a piece only transitions to verified
/// through [Bitfield::mark_verified], which is invoked exclusively by the data worker
/// after a successful digest match. The transition is monotonic and never reverses.
#[derive(Clone)]
pub struct Bitfield {
    verified: BitVec,
    piece_length: usize,
    last_piece_length: usize,
}

impl Bitfield {
    /// Create a new bitfield with all pieces marked as absent.
    ///
    /// # Arguments
    ///
    /// * `total_pieces` - The total number of pieces within the torrent.
    /// * `piece_length` - The length in bytes of every piece except possibly the last one.
    /// * `total_length` - The total length in bytes of the torrent data.
    pub fn new(total_pieces: usize, piece_length: usize, total_length: u64) -> Self {
        let remainder = (total_length % piece_length as u64) as usize;
        let last_piece_length = if remainder == 0 { piece_length } else { remainder };

        Self {
            verified: BitVec::from_elem(total_pieces, false),
            piece_length,
            last_piece_length,
        }
    }

    /// Get the total number of pieces within the torrent.
    pub fn total_pieces(&self) -> usize {
        self.verified.len()
    }

    /// Get the number of pieces that have been verified.
    pub fn pieces_complete(&self) -> usize {
        self.verified.iter().filter(|e| *e).count()
    }

    /// Get the number of pieces that still need to be downloaded.
    pub fn pieces_remaining(&self) -> usize {
        self.total_pieces() - self.pieces_complete()
    }

    /// Get the length in bytes of the given piece.
    /// The last piece of the torrent might be smaller than the piece length.
    pub fn piece_length(&self, piece: PieceIndex) -> usize {
        if piece == self.total_pieces() - 1 {
            self.last_piece_length
        } else {
            self.piece_length
        }
    }

    /// Check if the given piece has been verified.
    pub fn is_verified(&self, piece: PieceIndex) -> bool {
        self.verified.get(piece).unwrap_or(false)
    }

    /// Check if any piece of the torrent has been verified.
    pub fn has_any(&self) -> bool {
        self.verified.any()
    }

    /// Mark the given piece as verified.
    /// This is the only operation that transitions a piece from absent to verified and
    /// must only be invoked by the data worker after a digest match.
    ///
    /// # Returns
    ///
    /// Returns `true` when the piece transitioned to verified, `false` when it already was.
    pub fn mark_verified(&mut self, piece: PieceIndex) -> bool {
        if self.is_verified(piece) {
            return false;
        }

        self.verified.set(piece, true);
        true
    }

    /// Get the packed bitmask of this bitfield, matching the wire `Bitfield` message
    /// layout (MSB-first per byte, trailing pad bits zero).
    pub fn to_bytes(&self) -> Vec<u8> {
        self.verified.to_bytes()
    }

    /// Get the underlying per-piece flags of this bitfield.
    pub fn as_bits(&self) -> &BitVec {
        &self.verified
    }
}

impl Debug for Bitfield {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "Bitfield({}/{})",
            self.pieces_complete(),
            self.total_pieces()
        ))
    }
}
