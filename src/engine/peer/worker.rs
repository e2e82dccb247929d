use crate::engine::assignments::Assignments;
use crate::engine::config::EngineConfig;
use crate::engine::data::{Block, TorrentData};
use crate::engine::data_worker::{BlockRead, DataWorker};
use crate::engine::dispatcher::{MessageConsumer, MessageProducer};
use crate::engine::peer::{
    self, BlockKey, ChokeState, ConnectionState, Error, InterestState, Message, PeerHandle, Piece,
    Request,
};
use crate::engine::{PieceIndex, MAX_BLOCK_SIZE};
use async_trait::async_trait;
use bit_vec::BitVec;
use log::{debug, trace};
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{oneshot, Mutex};

/// The per-peer exchange state machine of the engine.
///
/// A worker consumes the messages received from its peer and produces the messages to
/// send on each cycle, requesting blocks of the assigned piece, serving the block
/// requests of the remote peer and maintaining the choke and interest states.
#[derive(Debug)]
pub struct PeerWorker {
    handle: PeerHandle,
    data: Arc<TorrentData>,
    data_worker: DataWorker,
    assignments: Arc<Assignments>,
    config: EngineConfig,
    state: Mutex<WorkerState>,
}

#[derive(Debug)]
struct WorkerState {
    conn: ConnectionState,
    /// The pieces announced by the remote peer
    remote_bitfield: BitVec,
    /// The piece for which the request queue was built
    current_piece: Option<PieceIndex>,
    /// The block reads in flight for the remote peer
    pending_reads: VecDeque<oneshot::Receiver<BlockRead>>,
}

impl PeerWorker {
    pub fn new(
        handle: PeerHandle,
        data: Arc<TorrentData>,
        data_worker: DataWorker,
        assignments: Arc<Assignments>,
        config: EngineConfig,
    ) -> Self {
        let total_pieces = data.total_pieces();

        Self {
            handle,
            data,
            data_worker,
            assignments,
            config,
            state: Mutex::new(WorkerState {
                conn: ConnectionState::new(),
                remote_bitfield: BitVec::from_elem(total_pieces, false),
                current_piece: None,
                pending_reads: VecDeque::new(),
            }),
        }
    }

    /// The handle of the peer driven by this worker.
    pub fn handle(&self) -> PeerHandle {
        self.handle
    }

    /// Queue the local bitfield for delivery to the remote peer.
    /// This is a no-op when no piece has been verified yet.
    pub async fn announce_bitfield(&self) {
        let bits = self.data.bitfield().read().await;

        if bits.has_any() {
            let message = Message::Bitfield(bits.as_bits().clone());
            drop(bits);
            self.state.lock().await.conn.queue_message(message);
        }
    }

    /// Queue a have message announcing the given verified piece.
    pub async fn announce_piece(&self, piece: PieceIndex) {
        self.state
            .lock()
            .await
            .conn
            .queue_message(Message::Have(piece as u32));
    }

    /// Withdraw every outstanding request of the given piece after it has been completed.
    /// A cancel message is queued for every request that is still in flight.
    pub async fn piece_completed(&self, piece: PieceIndex) {
        let mut state = self.state.lock().await;
        let in_flight: Vec<BlockKey> = state
            .conn
            .pending_requests
            .iter()
            .filter(|key| key.piece == piece)
            .copied()
            .collect();

        for key in in_flight {
            state.conn.pending_requests.remove(&key);
            state.conn.queue_message(Message::Cancel(Request {
                index: key.piece,
                begin: key.begin,
                length: key.length,
            }));
        }

        state.conn.request_queue.retain(|block| block.piece != piece);
        if state.current_piece == Some(piece) {
            state.current_piece = None;
            state.conn.queue_initialized = false;
        }
    }

    /// Get the pieces announced by the remote peer.
    pub async fn remote_bitfield(&self) -> BitVec {
        self.state.lock().await.remote_bitfield.clone()
    }

    /// Get the total payload bytes downloaded from and uploaded to this peer.
    pub async fn transfer_totals(&self) -> (u64, u64) {
        let state = self.state.lock().await;
        (state.conn.downloaded, state.conn.uploaded)
    }

    /// Get the unverified pieces which the remote peer has announced.
    async fn candidates(&self, state: &WorkerState) -> Vec<PieceIndex> {
        let verified = self.data.bitfield().read().await;

        state
            .remote_bitfield
            .iter()
            .enumerate()
            .filter(|(piece, has)| *has && !verified.is_verified(*piece))
            .map(|(piece, _)| piece)
            .collect()
    }

    /// Remove the settled block writes from the bookkeeping.
    /// A write that was rejected or failed leaves its block absent, forcing the request
    /// queue to be rebuilt so the block is requested again.
    fn settle_block_writes(&self, state: &mut WorkerState) {
        let mut rebuild = false;

        state.conn.pending_writes.retain(|key, rx| match rx.try_recv() {
            Ok(write) => {
                if !write.is_success() {
                    trace!("Block write of {} was not stored, requeueing", key);
                    rebuild = true;
                }
                false
            }
            Err(TryRecvError::Empty) => true,
            Err(TryRecvError::Closed) => false,
        });

        if rebuild {
            state.conn.queue_initialized = false;
        }
    }

    async fn update_interest(&self, state: &mut WorkerState, messages: &mut Vec<Message>) {
        let interesting = !self.candidates(state).await.is_empty();

        match state.conn.local_interest {
            InterestState::NotInterested if interesting => {
                state.conn.local_interest = InterestState::Interested;
                messages.push(Message::Interested);
            }
            InterestState::Interested if !interesting => {
                state.conn.local_interest = InterestState::NotInterested;
                messages.push(Message::NotInterested);
            }
            _ => {}
        }
    }

    async fn fill_requests(&self, state: &mut WorkerState, messages: &mut Vec<Message>) {
        if !state.conn.can_request() || state.conn.local_interest != InterestState::Interested {
            return;
        }

        if state.conn.is_stalled(self.config.request_timeout) {
            debug!("Peer {} stalled, requeueing its outstanding requests", self.handle);
            state.conn.pending_requests.clear();
            state.conn.clear_request_queue();
            state.conn.last_progress = Instant::now();
        }

        let candidates = self.candidates(state).await;
        let piece = match self.assignments.assign(self.handle, &candidates) {
            Some(piece) => piece,
            None => return,
        };

        if state.current_piece != Some(piece) {
            state.current_piece = Some(piece);
            state.conn.clear_request_queue();
        }
        // re-arm the queue once nothing is queued or in flight anymore, which picks up
        // the blocks of a piece that failed verification or whose writes were dropped
        if state.conn.queue_initialized
            && state.conn.request_queue.is_empty()
            && state.conn.pending_requests.is_empty()
        {
            state.conn.queue_initialized = false;
        }
        if !state.conn.queue_initialized {
            self.build_request_queue(state, piece).await;
        }

        while state.conn.has_request_capacity(self.config.max_pending_requests) {
            let block = match state.conn.request_queue.pop_front() {
                Some(block) => block,
                None => break,
            };
            let key = BlockKey::from(&block);

            state.conn.register_request(key);
            messages.push(Message::Request(Request::from(&block)));
        }
    }

    /// Build the request queue out of the absent blocks of the given piece.
    /// Blocks that are already in flight, either on the wire or towards the data worker,
    /// are left out. The queue is shuffled to spread the requests of peers working on the
    /// same piece across different blocks.
    async fn build_request_queue(&self, state: &mut WorkerState, piece: PieceIndex) {
        let chunk = match self.data.chunk(piece) {
            Ok(chunk) => chunk,
            Err(_) => return,
        };
        let mut blocks: Vec<Block> = chunk
            .lock()
            .await
            .absent_blocks()
            .into_iter()
            .filter(|block| {
                let key = BlockKey::from(block);
                !state.conn.pending_requests.contains(&key)
                    && !state.conn.pending_writes.contains_key(&key)
            })
            .collect();

        blocks.shuffle(&mut rand::rng());
        trace!(
            "Built request queue of {} blocks for piece {} of peer {}",
            blocks.len(),
            piece,
            self.handle
        );
        state.conn.request_queue = blocks.into();
        state.conn.queue_initialized = true;
    }

    /// Hand the next queued block requests of the remote peer to the data worker.
    fn start_uploads(&self, state: &mut WorkerState) {
        for _ in 0..self.config.uploads_per_cycle {
            let request = match state.conn.upload_queue.pop_front() {
                Some(request) => request,
                None => break,
            };
            let key = BlockKey::from(&request);

            if state.conn.cancelled_uploads.remove(&key) {
                trace!("Skipping cancelled block request {} of peer {}", key, self.handle);
                continue;
            }

            let rx = self.data_worker.read_block(self.handle, &request);
            state.pending_reads.push_back(rx);
        }
    }

    /// Turn the settled block reads into piece messages for the remote peer.
    fn settle_uploads(&self, state: &mut WorkerState, messages: &mut Vec<Message>) {
        let mut served = 0;

        while served < self.config.uploads_per_cycle {
            let mut rx = match state.pending_reads.pop_front() {
                Some(rx) => rx,
                None => break,
            };

            match rx.try_recv() {
                Ok(read) => {
                    let key = read.key;

                    if state.conn.cancelled_uploads.remove(&key) {
                        continue;
                    }
                    if read.rejected {
                        // the data worker queue is saturated, choke the peer instead of
                        // letting its requests pile up
                        if state.conn.local_choke == ChokeState::Unchoked {
                            debug!("Choking peer {} due to data worker saturation", self.handle);
                            state.conn.local_choke = ChokeState::Choked;
                            messages.push(Message::Choke);
                        }
                        continue;
                    }
                    if let Some(data) = read.data {
                        state.conn.record_uploaded(data.len());
                        messages.push(Message::Piece(Piece {
                            index: key.piece,
                            begin: key.begin,
                            data,
                        }));
                        served += 1;
                    } else {
                        debug!("Block read of {} for peer {} failed", key, self.handle);
                    }
                }
                Err(TryRecvError::Empty) => {
                    state.pending_reads.push_front(rx);
                    break;
                }
                Err(TryRecvError::Closed) => {}
            }
        }
    }

    async fn on_bitfield(&self, bits: BitVec) -> peer::Result<()> {
        let total_pieces = self.data.total_pieces();
        let expected_bits = (total_pieces + 7) / 8 * 8;

        if bits.len() != expected_bits {
            return Err(Error::InvalidBitfield(total_pieces, bits.len()));
        }
        // the spare bits of the last byte must remain zero
        if bits.iter().skip(total_pieces).any(|bit| bit) {
            return Err(Error::InvalidBitfield(total_pieces, bits.len()));
        }

        let mut bits = bits;
        bits.truncate(total_pieces);

        let mut state = self.state.lock().await;
        self.assignments.remove_bitfield(&state.remote_bitfield);
        self.assignments.add_bitfield(&bits);
        state.remote_bitfield = bits;
        Ok(())
    }

    async fn on_have(&self, piece: PieceIndex) -> peer::Result<()> {
        if piece >= self.data.total_pieces() {
            return Err(Error::InvalidPiece(piece));
        }

        let mut state = self.state.lock().await;
        if !state.remote_bitfield.get(piece).unwrap_or(false) {
            state.remote_bitfield.set(piece, true);
            self.assignments.piece_announced(piece);
        }
        Ok(())
    }

    async fn on_request(&self, request: Request) -> peer::Result<()> {
        let key = BlockKey::from(&request);

        if request.length == 0 || request.length > MAX_BLOCK_SIZE {
            return Err(Error::InvalidBlockRequest(key));
        }
        if request.index >= self.data.total_pieces() {
            return Err(Error::InvalidBlockRequest(key));
        }
        let piece_length = self.data.bitfield().read().await.piece_length(request.index);
        if request.begin + request.length > piece_length {
            return Err(Error::InvalidBlockRequest(key));
        }

        let verified = self.data.is_piece_verified(request.index).await;
        let mut state = self.state.lock().await;

        // only verified data is served, and only while the peer is unchoked
        if state.conn.local_choke == ChokeState::Choked || !verified {
            if state.conn.local_choke == ChokeState::Unchoked {
                state.conn.local_choke = ChokeState::Choked;
                state.conn.queue_message(Message::Choke);
            }
            debug!("Ignoring block request {} of peer {}", key, self.handle);
            return Ok(());
        }

        state.conn.upload_queue.push_back(request);
        Ok(())
    }

    async fn on_piece(&self, piece: Piece) -> peer::Result<()> {
        let key = BlockKey::from(&piece);
        let mut state = self.state.lock().await;

        if !state.conn.complete_request(&key) {
            return Err(Error::UnexpectedBlock(key));
        }

        state.conn.record_downloaded(piece.data.len());
        let rx = self
            .data_worker
            .write_block(self.handle, piece.index, piece.begin, piece.data);
        state.conn.pending_writes.insert(key, rx);
        Ok(())
    }

    async fn on_cancel(&self, request: Request) {
        let key = BlockKey::from(&request);
        let mut state = self.state.lock().await;
        let queued_before = state.conn.upload_queue.len();

        state
            .conn
            .upload_queue
            .retain(|request| BlockKey::from(request) != key);
        if state.conn.upload_queue.len() == queued_before {
            // the request is no longer queued, suppress the in-flight read instead
            state.conn.cancelled_uploads.insert(key);
        }
    }
}

#[async_trait]
impl MessageConsumer for PeerWorker {
    async fn consume(&self, message: Message) -> peer::Result<()> {
        trace!("Peer {} worker is consuming {:?}", self.handle, message);
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                let mut state = self.state.lock().await;
                state.conn.remote_choke = ChokeState::Choked;
                // keep the in-flight requests, the peer might still answer them
                state.conn.clear_request_queue();
                state.current_piece = None;
                drop(state);
                self.assignments.unassign(self.handle);
            }
            Message::Unchoke => {
                self.state.lock().await.conn.remote_choke = ChokeState::Unchoked;
            }
            Message::Interested => {
                let serveable = self.data.bitfield().read().await.has_any();
                let mut state = self.state.lock().await;

                state.conn.remote_interest = InterestState::Interested;
                if serveable && state.conn.local_choke == ChokeState::Choked {
                    state.conn.local_choke = ChokeState::Unchoked;
                    state.conn.queue_message(Message::Unchoke);
                }
            }
            Message::NotInterested => {
                let mut state = self.state.lock().await;

                state.conn.remote_interest = InterestState::NotInterested;
                if state.conn.local_choke == ChokeState::Unchoked {
                    state.conn.local_choke = ChokeState::Choked;
                    state.conn.queue_message(Message::Choke);
                }
            }
            Message::Have(piece) => self.on_have(piece as PieceIndex).await?,
            Message::Bitfield(bits) => self.on_bitfield(bits).await?,
            Message::Request(request) => self.on_request(request).await?,
            Message::Piece(piece) => self.on_piece(piece).await?,
            Message::Cancel(request) => self.on_cancel(request).await,
            Message::Port(port) => {
                trace!("Ignoring port announcement {} of peer {}", port, self.handle);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl MessageProducer for PeerWorker {
    async fn produce(&self) -> peer::Result<Vec<Message>> {
        let mut state = self.state.lock().await;
        let mut messages: Vec<Message> = state.conn.control_queue.drain(..).collect();

        self.settle_block_writes(&mut state);
        self.update_interest(&mut state, &mut messages).await;
        self.fill_requests(&mut state, &mut messages).await;
        self.start_uploads(&mut state);
        self.settle_uploads(&mut state, &mut messages);

        if messages.is_empty() {
            if state.conn.last_message_sent.elapsed() >= self.config.keep_alive_interval {
                messages.push(Message::KeepAlive);
            }
        }
        if !messages.is_empty() {
            state.conn.last_message_sent = Instant::now();
        }

        Ok(messages)
    }
}
