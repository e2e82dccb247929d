use crate::engine::data::Block;
use crate::engine::data_worker::BlockWrite;
use crate::engine::peer::protocol::{Message, Piece, Request};
use crate::engine::PieceIndex;
use derive_more::Display;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;
use tokio::sync::oneshot;

/// The unique key of a block within the torrent, as exchanged on the wire.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
#[display("piece {} [{}..{}]", piece, begin, begin + length)]
pub struct BlockKey {
    pub piece: PieceIndex,
    pub begin: usize,
    pub length: usize,
}

impl BlockKey {
    pub fn new(piece: PieceIndex, begin: usize, length: usize) -> Self {
        Self {
            piece,
            begin,
            length,
        }
    }
}

impl From<&Request> for BlockKey {
    fn from(value: &Request) -> Self {
        Self::new(value.index, value.begin, value.length)
    }
}

impl From<&Piece> for BlockKey {
    fn from(value: &Piece) -> Self {
        Self::new(value.index, value.begin, value.data.len())
    }
}

impl From<&Block> for BlockKey {
    fn from(value: &Block) -> Self {
        Self::new(value.piece, value.begin, value.length)
    }
}

/// The choke state of one side of a peer connection.
#[derive(Debug, Display, Copy, Clone, Default, PartialEq)]
pub enum ChokeState {
    #[display("choked")]
    #[default]
    Choked,
    #[display("unchoked")]
    Unchoked,
}

/// The interest state of one side of a peer connection.
#[derive(Debug, Display, Copy, Clone, Default, PartialEq)]
pub enum InterestState {
    #[display("interested")]
    Interested,
    #[display("not interested")]
    #[default]
    NotInterested,
}

/// The mutable exchange state kept for a single peer connection.
///
/// Both sides start out choked and not interested as defined by BEP03.
#[derive(Debug)]
pub struct ConnectionState {
    /// Our choke state towards the remote peer
    pub local_choke: ChokeState,
    /// The choke state of the remote peer towards us
    pub remote_choke: ChokeState,
    /// Our interest in the pieces of the remote peer
    pub local_interest: InterestState,
    /// The interest of the remote peer in our pieces
    pub remote_interest: InterestState,
    /// Control messages queued for delivery on the next produce cycle
    pub control_queue: VecDeque<Message>,
    /// Block requests sent to the remote peer which haven't been answered yet
    pub pending_requests: HashSet<BlockKey>,
    /// Blocks of the assigned piece which still need to be requested
    pub request_queue: VecDeque<Block>,
    /// Indicates if the request queue has been built for the current assignment
    pub queue_initialized: bool,
    /// Block writes handed to the data worker which haven't settled yet
    pub pending_writes: HashMap<BlockKey, oneshot::Receiver<BlockWrite>>,
    /// Incoming block requests from the remote peer
    pub upload_queue: VecDeque<Request>,
    /// Upload requests which were cancelled by the remote peer before being served
    pub cancelled_uploads: HashSet<BlockKey>,
    /// The total amount of payload bytes received from the peer
    pub downloaded: u64,
    /// The total amount of payload bytes sent to the peer
    pub uploaded: u64,
    /// The last time the download from this peer made progress
    pub last_progress: Instant,
    /// The last time any message was sent to this peer
    pub last_message_sent: Instant,
}

impl ConnectionState {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            local_choke: ChokeState::default(),
            remote_choke: ChokeState::default(),
            local_interest: InterestState::default(),
            remote_interest: InterestState::default(),
            control_queue: VecDeque::new(),
            pending_requests: HashSet::new(),
            request_queue: VecDeque::new(),
            queue_initialized: false,
            pending_writes: HashMap::new(),
            upload_queue: VecDeque::new(),
            cancelled_uploads: HashSet::new(),
            downloaded: 0,
            uploaded: 0,
            last_progress: now,
            last_message_sent: now,
        }
    }

    /// Check if we're allowed to request blocks from the remote peer.
    pub fn can_request(&self) -> bool {
        self.remote_choke == ChokeState::Unchoked
    }

    /// Check if additional block requests may be sent to the remote peer.
    pub fn has_request_capacity(&self, max_pending_requests: usize) -> bool {
        self.pending_requests.len() < max_pending_requests
    }

    /// Queue a control message for delivery on the next produce cycle.
    pub fn queue_message(&mut self, message: Message) {
        self.control_queue.push_back(message);
    }

    /// Register a block request that has been sent to the remote peer.
    pub fn register_request(&mut self, key: BlockKey) {
        self.pending_requests.insert(key);
    }

    /// Settle a block request after its data has been received.
    ///
    /// # Returns
    ///
    /// Returns `true` when the block was expected, else `false`.
    pub fn complete_request(&mut self, key: &BlockKey) -> bool {
        let known = self.pending_requests.remove(key);
        if known {
            self.last_progress = Instant::now();
        }
        known
    }

    /// Drop the request queue of the current assignment.
    ///
    /// The in-flight requests are kept, as the remote peer might still answer them.
    pub fn clear_request_queue(&mut self) {
        self.request_queue.clear();
        self.queue_initialized = false;
    }

    /// Check if the peer hasn't delivered any requested block within the given timeout.
    pub fn is_stalled(&self, timeout: std::time::Duration) -> bool {
        !self.pending_requests.is_empty() && self.last_progress.elapsed() >= timeout
    }

    pub fn record_downloaded(&mut self, bytes: usize) {
        self.downloaded += bytes as u64;
    }

    pub fn record_uploaded(&mut self, bytes: usize) {
        self.uploaded += bytes as u64;
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_block_key_from_request() {
        let request = Request {
            index: 5,
            begin: 16384,
            length: 16384,
        };

        let result = BlockKey::from(&request);

        assert_eq!(BlockKey::new(5, 16384, 16384), result);
    }

    #[test]
    fn test_block_key_from_piece() {
        let piece = Piece {
            index: 2,
            begin: 0,
            data: vec![0u8; 512],
        };

        let result = BlockKey::from(&piece);

        assert_eq!(BlockKey::new(2, 0, 512), result);
    }

    #[test]
    fn test_block_key_display() {
        let key = BlockKey::new(3, 16384, 16384);

        let result = key.to_string();

        assert_eq!("piece 3 [16384..32768]", result.as_str());
    }

    #[test]
    fn test_connection_state_defaults() {
        let state = ConnectionState::new();

        assert_eq!(ChokeState::Choked, state.local_choke);
        assert_eq!(ChokeState::Choked, state.remote_choke);
        assert_eq!(InterestState::NotInterested, state.local_interest);
        assert_eq!(InterestState::NotInterested, state.remote_interest);
        assert_eq!(false, state.can_request(), "expected requests to be disallowed while choked");
    }

    #[test]
    fn test_connection_state_request_capacity() {
        let mut state = ConnectionState::new();

        state.register_request(BlockKey::new(0, 0, 16384));
        state.register_request(BlockKey::new(0, 16384, 16384));

        assert_eq!(true, state.has_request_capacity(3));
        assert_eq!(false, state.has_request_capacity(2));
    }

    #[test]
    fn test_connection_state_complete_request() {
        let mut state = ConnectionState::new();
        let key = BlockKey::new(1, 0, 16384);

        state.register_request(key);

        assert_eq!(true, state.complete_request(&key));
        assert_eq!(
            false,
            state.complete_request(&key),
            "expected an unknown block to not be settled"
        );
    }

    #[test]
    fn test_connection_state_clear_request_queue() {
        let mut state = ConnectionState::new();
        let key = BlockKey::new(0, 0, 16384);
        state.register_request(key);
        state.queue_initialized = true;
        state.request_queue.push_back(Block {
            piece: 0,
            block: 1,
            begin: 16384,
            length: 16384,
        });

        state.clear_request_queue();

        assert_eq!(0, state.request_queue.len());
        assert_eq!(false, state.queue_initialized);
        assert_eq!(
            true,
            state.pending_requests.contains(&key),
            "expected in-flight requests to be kept"
        );
    }

    #[test]
    fn test_connection_state_is_stalled() {
        let mut state = ConnectionState::new();

        assert_eq!(
            false,
            state.is_stalled(Duration::from_secs(0)),
            "expected an idle peer to never stall"
        );

        state.register_request(BlockKey::new(0, 0, 16384));
        state.last_progress = Instant::now() - Duration::from_secs(31);

        assert_eq!(true, state.is_stalled(Duration::from_secs(30)));
    }
}
