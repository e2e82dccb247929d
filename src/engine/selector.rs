use crate::engine::PieceIndex;
use bit_vec::BitVec;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Debug;
use std::sync::Mutex;

/// The swarm-wide availability bookkeeping of the torrent pieces.
///
/// The availability of a piece is the number of connected peers that announced the piece,
/// either through their initial bitfield or a later have message.
#[derive(Debug, Clone, PartialEq)]
pub struct PieceStatistics {
    availability: Vec<u32>,
}

impl PieceStatistics {
    pub fn new(total_pieces: usize) -> Self {
        Self {
            availability: vec![0; total_pieces],
        }
    }

    /// Get the total number of pieces being tracked.
    pub fn total_pieces(&self) -> usize {
        self.availability.len()
    }

    /// Get the number of peers that announced the given piece.
    pub fn availability(&self, piece: PieceIndex) -> u32 {
        self.availability.get(piece).copied().unwrap_or(0)
    }

    /// Increase the availability of a single piece.
    /// This is invoked when a peer announces a piece through a have message.
    pub fn piece_announced(&mut self, piece: PieceIndex) {
        if let Some(count) = self.availability.get_mut(piece) {
            *count += 1;
        }
    }

    /// Increase the availability of every piece set within the given peer bitfield.
    pub fn add_bitfield(&mut self, bits: &BitVec) {
        for (piece, available) in bits.iter().enumerate().take(self.availability.len()) {
            if available {
                self.availability[piece] += 1;
            }
        }
    }

    /// Decrease the availability of every piece set within the given peer bitfield.
    /// This is invoked when a peer leaves the swarm.
    pub fn remove_bitfield(&mut self, bits: &BitVec) {
        for (piece, available) in bits.iter().enumerate().take(self.availability.len()) {
            if available {
                self.availability[piece] = self.availability[piece].saturating_sub(1);
            }
        }
    }
}

/// The strategy seam used to pick the next piece to download.
///
/// The engine computes the candidate pieces for a peer, the selector only decides the
/// order in which they're picked.
pub trait PieceSelector: Debug + Send + Sync {
    /// Select the next piece to download out of the given candidates.
    ///
    /// # Arguments
    ///
    /// * `candidates` - The pieces the peer has which are unverified and unassigned.
    /// * `stats` - The current swarm availability of all pieces.
    ///
    /// # Returns
    ///
    /// Returns the selected piece, or [None] when no candidate is given.
    fn select(&self, candidates: &[PieceIndex], stats: &PieceStatistics) -> Option<PieceIndex>;
}

/// Selects the candidate piece with the lowest swarm availability.
/// Ties between equally rare pieces are broken at random to spread the initial requests
/// of the swarm across different pieces.
#[derive(Debug)]
pub struct RarestFirstSelector {
    rng: Mutex<StdRng>,
}

impl RarestFirstSelector {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_rng(&mut rand::rng())),
        }
    }

    /// Create a selector with a fixed seed, producing a reproducible selection order.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RarestFirstSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl PieceSelector for RarestFirstSelector {
    fn select(&self, candidates: &[PieceIndex], stats: &PieceStatistics) -> Option<PieceIndex> {
        let rarest = candidates
            .iter()
            .map(|piece| stats.availability(*piece))
            .min()?;
        let ties: Vec<PieceIndex> = candidates
            .iter()
            .filter(|piece| stats.availability(**piece) == rarest)
            .copied()
            .collect();

        let mut rng = self.rng.lock().expect("expected the rng lock to not be poisoned");
        let index = rng.random_range(0..ties.len());
        Some(ties[index])
    }
}

/// Selects the candidate piece with the lowest index.
/// This realizes an in-order download, used for streaming-like consumption of the data.
#[derive(Debug, Default)]
pub struct SequentialSelector;

impl PieceSelector for SequentialSelector {
    fn select(&self, candidates: &[PieceIndex], _: &PieceStatistics) -> Option<PieceIndex> {
        candidates.iter().min().copied()
    }
}
