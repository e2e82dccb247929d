use crate::engine::peer::PeerHandle;
use crate::engine::selector::{PieceSelector, PieceStatistics};
use crate::engine::PieceIndex;
use bit_vec::BitVec;
use log::trace;
use std::collections::HashMap;
use std::sync::Mutex;

/// The piece assignment bookkeeping of the engine.
///
/// Every peer is assigned at most one piece at a time, and a piece is assigned to at most
/// one peer. The endgame mode relaxes the latter, once no unassigned candidate is left,
/// pieces may be assigned to multiple peers to finish the last pieces faster.
#[derive(Debug)]
pub struct Assignments {
    selector: Box<dyn PieceSelector>,
    endgame: bool,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    stats: PieceStatistics,
    piece_of_peer: HashMap<PeerHandle, PieceIndex>,
}

impl Assignments {
    /// Create a new assignment bookkeeping for the given number of pieces.
    ///
    /// # Arguments
    ///
    /// * `selector` - The strategy used to pick the next piece out of the candidates.
    /// * `total_pieces` - The total number of pieces within the torrent.
    /// * `endgame` - Allow duplicate assignments once no unassigned candidate is left.
    pub fn new(selector: Box<dyn PieceSelector>, total_pieces: usize, endgame: bool) -> Self {
        Self {
            selector,
            endgame,
            state: Mutex::new(State {
                stats: PieceStatistics::new(total_pieces),
                piece_of_peer: HashMap::new(),
            }),
        }
    }

    /// Get the swarm availability of the given piece.
    pub fn availability(&self, piece: PieceIndex) -> u32 {
        self.state().stats.availability(piece)
    }

    /// Register a piece announced by a peer through a have message.
    pub fn piece_announced(&self, piece: PieceIndex) {
        self.state().stats.piece_announced(piece);
    }

    /// Register the initial bitfield of a peer.
    pub fn add_bitfield(&self, bits: &BitVec) {
        self.state().stats.add_bitfield(bits);
    }

    /// Unregister the bitfield of a peer that left the swarm.
    pub fn remove_bitfield(&self, bits: &BitVec) {
        self.state().stats.remove_bitfield(bits);
    }

    /// Get the piece currently assigned to the given peer.
    pub fn assigned_piece(&self, peer: PeerHandle) -> Option<PieceIndex> {
        self.state().piece_of_peer.get(&peer).copied()
    }

    /// Assign a piece to the given peer.
    ///
    /// When the peer already has an assignment, that assignment is returned instead of
    /// creating a new one.
    ///
    /// # Arguments
    ///
    /// * `peer` - The peer to assign a piece to.
    /// * `candidates` - The unverified pieces which the peer has announced.
    ///
    /// # Returns
    ///
    /// Returns the assigned piece, or [None] when no candidate could be assigned.
    pub fn assign(&self, peer: PeerHandle, candidates: &[PieceIndex]) -> Option<PieceIndex> {
        let mut state = self.state();

        if let Some(piece) = state.piece_of_peer.get(&peer) {
            return Some(*piece);
        }

        let unassigned: Vec<PieceIndex> = candidates
            .iter()
            .filter(|piece| !state.is_assigned(**piece))
            .copied()
            .collect();
        let piece = if !unassigned.is_empty() {
            self.selector.select(&unassigned, &state.stats)
        } else if self.endgame {
            self.selector.select(candidates, &state.stats)
        } else {
            None
        }?;

        trace!("Assigned piece {} to peer {}", piece, peer);
        state.piece_of_peer.insert(peer, piece);
        Some(piece)
    }

    /// Release the assignment of the given peer.
    ///
    /// # Returns
    ///
    /// Returns the piece that was assigned to the peer, if any.
    pub fn unassign(&self, peer: PeerHandle) -> Option<PieceIndex> {
        self.state().piece_of_peer.remove(&peer)
    }

    /// Release every assignment of the given piece after it has been completed.
    ///
    /// # Returns
    ///
    /// Returns the peers that were assigned to the piece.
    pub fn complete(&self, piece: PieceIndex) -> Vec<PeerHandle> {
        let mut state = self.state();
        let peers: Vec<PeerHandle> = state
            .piece_of_peer
            .iter()
            .filter(|(_, assigned)| **assigned == piece)
            .map(|(peer, _)| *peer)
            .collect();

        for peer in &peers {
            state.piece_of_peer.remove(peer);
        }

        peers
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .expect("expected the assignments lock to not be poisoned")
    }
}

impl State {
    fn is_assigned(&self, piece: PieceIndex) -> bool {
        self.piece_of_peer.values().any(|assigned| *assigned == piece)
    }
}
