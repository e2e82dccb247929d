use crate::engine::data::{Checksum, DataError, DataResult};
use crate::engine::{BlockIndex, PieceIndex};
use bit_vec::BitVec;
use std::fmt::{Debug, Formatter};

/// The presence status of a chunk's data.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataStatus {
    /// No block of the chunk is present
    Empty,
    /// Some, but not all, blocks of the chunk are present
    Incomplete,
    /// Every block of the chunk is present, but the data has not been verified yet
    Complete,
}

/// Identifies a single block within a chunk.
/// Blocks are the granularity at which data is requested from and transferred between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// The piece index to which this block belongs
    pub piece: PieceIndex,
    /// The unique index of this block within the chunk
    pub block: BlockIndex,
    /// The offset in bytes where this block begins within the chunk
    pub begin: usize,
    /// The size in bytes of this block
    pub length: usize,
}

/// The block bookkeeping of a single piece.
///
/// A chunk owns a fixed-size run of bytes, subdivided into fixed-size blocks except for a
/// possibly shorter last block. It tracks, per block, whether the block data has been
/// written. Verification of the written data is tracked by the [super::Bitfield] instead.
///
/// A block becomes present once a single write has covered the whole block; writes may
/// overlap and presence is idempotent and monotonic until [ChunkDescriptor::reset] is
/// called after a failed verification.
pub struct ChunkDescriptor {
    piece: PieceIndex,
    offset: u64,
    length: usize,
    block_size: usize,
    checksum: Checksum,
    present_blocks: BitVec,
}

impl ChunkDescriptor {
    /// Create a new chunk descriptor.
    ///
    /// # Arguments
    ///
    /// * `piece` - The piece index of the chunk within the torrent.
    /// * `offset` - The beginning offset of the chunk within the torrent data.
    /// * `length` - The length of the chunk in bytes.
    /// * `block_size` - The size of a single block, the last block might be smaller.
    /// * `checksum` - The expected digest of the chunk data.
    pub fn new(
        piece: PieceIndex,
        offset: u64,
        length: usize,
        block_size: usize,
        checksum: Checksum,
    ) -> Self {
        let num_of_blocks = (length + block_size - 1) / block_size;

        Self {
            piece,
            offset,
            length,
            block_size,
            checksum,
            present_blocks: BitVec::from_elem(num_of_blocks, false),
        }
    }

    /// Get the piece index of this chunk.
    pub fn piece(&self) -> PieceIndex {
        self.piece
    }

    /// Get the length of this chunk in bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Get the number of blocks within this chunk.
    pub fn num_of_blocks(&self) -> usize {
        self.present_blocks.len()
    }

    /// Get the expected digest of the chunk data.
    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }

    /// Get the byte range of the chunk within the torrent data.
    pub fn torrent_range(&self) -> std::ops::Range<u64> {
        self.offset..(self.offset + self.length as u64)
    }

    /// Get the length in bytes of the given block.
    /// The last block of the chunk might be smaller than the chunk block size.
    pub fn block_length(&self, block: BlockIndex) -> DataResult<usize> {
        if block >= self.num_of_blocks() {
            return Err(DataError::InvalidBlock(block));
        }

        let begin = block * self.block_size;
        Ok(self.block_size.min(self.length - begin))
    }

    /// Mark the blocks covered by the given write as present.
    /// Only blocks which are fully contained within `[offset, offset + length)` become
    /// present; a partially covered block remains absent.
    ///
    /// # Arguments
    ///
    /// * `offset` - The offset within the chunk at which the write starts.
    /// * `length` - The number of bytes written.
    ///
    /// # Returns
    ///
    /// Returns an error when the write would extend past the chunk size.
    pub fn write_block(&mut self, offset: usize, length: usize) -> DataResult<()> {
        let end = offset
            .checked_add(length)
            .ok_or(DataError::OutOfRange(self.length, usize::MAX))?;
        if end > self.length {
            return Err(DataError::OutOfRange(self.length, end));
        }
        // a zero-length write is a legal no-op
        if length == 0 {
            return Ok(());
        }

        // the first block that might start at or after the write offset
        let first_block = (offset + self.block_size - 1) / self.block_size;
        for block in first_block..self.num_of_blocks() {
            let block_begin = block * self.block_size;
            let block_end = block_begin + self.block_length(block)?;

            if block_end > end {
                break;
            }

            self.present_blocks.set(block, true);
        }

        Ok(())
    }

    /// Check if the given block data is present.
    pub fn is_block_present(&self, block: BlockIndex) -> bool {
        self.present_blocks.get(block).unwrap_or(false)
    }

    /// Check if every block of this chunk is present.
    pub fn is_complete(&self) -> bool {
        self.present_blocks.all()
    }

    /// Check if no block of this chunk is present.
    pub fn is_empty(&self) -> bool {
        self.present_blocks.none()
    }

    /// Get the presence status of this chunk.
    pub fn status(&self) -> DataStatus {
        if self.is_complete() {
            DataStatus::Complete
        } else if self.is_empty() {
            DataStatus::Empty
        } else {
            DataStatus::Incomplete
        }
    }

    /// Get the blocks of this chunk that are not yet present.
    /// These are the blocks that still need to be requested from a peer.
    pub fn absent_blocks(&self) -> Vec<Block> {
        self.present_blocks
            .iter()
            .enumerate()
            .filter(|(_, present)| !present)
            .map(|(block, _)| Block {
                piece: self.piece,
                block,
                begin: block * self.block_size,
                length: self.block_size.min(self.length - block * self.block_size),
            })
            .collect()
    }

    /// Get the per-block presence bitmask of this chunk.
    pub fn block_bitmask(&self) -> Vec<u8> {
        self.present_blocks
            .iter()
            .map(|present| if present { 1 } else { 0 })
            .collect()
    }

    /// Invalidate all written blocks of this chunk.
    /// This is called when the verification of the chunk data failed, re-arming every
    /// block for a new request.
    pub fn reset(&mut self) {
        self.present_blocks = BitVec::from_elem(self.present_blocks.len(), false);
    }
}

impl Debug for ChunkDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkDescriptor")
            .field("piece", &self.piece)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("block_size", &self.block_size)
            .field(
                "present_blocks",
                &format!(
                    "{}/{}",
                    self.present_blocks.iter().filter(|e| *e).count(),
                    self.present_blocks.len()
                ),
            )
            .finish()
    }
}
