use crate::engine::assignments::Assignments;
use crate::engine::config::EngineConfig;
use crate::engine::data::{Checksum, Sha1Digester, TorrentData};
use crate::engine::data_worker::{DataWorker, DataWorkerEvent};
use crate::engine::dispatcher::{MessageDispatcher, PeerDeparture};
use crate::engine::peer::{PeerConnection, PeerHandle, PeerWorker};
use crate::engine::selector::PieceSelector;
use crate::engine::storage::Storage;
use crate::engine::{EngineError, PieceIndex, Result};
use bit_vec::BitVec;
use derive_more::Display;
use fx_callback::{Callback, MultiThreadedCallback, Subscriber, Subscription};
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::select;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

/// The events of the [TorrentEngine].
#[derive(Debug, Display, Clone, PartialEq)]
pub enum EngineEvent {
    /// Invoked when a peer has been attached to the engine
    #[display("peer {} connected", _0)]
    PeerConnected(PeerHandle),
    /// Invoked when a peer has left the engine
    #[display("peer {} disconnected", _0)]
    PeerDisconnected(PeerHandle),
    /// Invoked when a peer address has been banned for violating the protocol
    #[display("peer address {} banned", _0)]
    PeerBanned(SocketAddr),
    /// Invoked when a piece passed its checksum verification
    #[display("piece {} verified", _0)]
    PieceVerified(PieceIndex),
    /// Invoked when a piece failed its checksum verification
    #[display("piece {} corrupted", _0)]
    PieceCorrupted(PieceIndex),
    /// Invoked when every piece of the torrent has been verified
    #[display("download completed")]
    DownloadComplete,
}

/// The aggregated transfer totals of the engine.
/// Totals include the contribution of peers that have already left and never decrease.
#[derive(Debug, Display, Copy, Clone, Default, PartialEq)]
#[display("downloaded {}, uploaded {}", downloaded, uploaded)]
pub struct TransferTotals {
    pub downloaded: u64,
    pub uploaded: u64,
}

/// The piece exchange engine of a single torrent.
///
/// The engine owns the piece data bookkeeping, the disk io worker, the piece assignments
/// and the exchange dispatcher. Peer connections are attached to it and driven until they
/// leave, fail or the engine is stopped. Peers that violate the exchange protocol are
/// disconnected and their address is temporarily banned.
#[derive(Debug, Clone)]
pub struct TorrentEngine {
    inner: Arc<InnerEngine>,
}

impl TorrentEngine {
    /// Create a new engine for a torrent with the given layout.
    ///
    /// # Arguments
    ///
    /// * `config` - The engine configuration values.
    /// * `piece_length` - The length in bytes of every piece except possibly the last one.
    /// * `total_length` - The total length in bytes of the torrent data.
    /// * `checksums` - The expected digest of each piece, indexed by piece.
    /// * `storage` - The backing storage of the torrent data.
    /// * `selector` - The strategy used to pick the next piece to download.
    pub fn new(
        config: EngineConfig,
        piece_length: usize,
        total_length: u64,
        checksums: Vec<Checksum>,
        storage: Arc<dyn Storage>,
        selector: Box<dyn PieceSelector>,
    ) -> Self {
        let data = Arc::new(TorrentData::new(piece_length, total_length, checksums));
        let data_worker = DataWorker::new(
            data.clone(),
            storage,
            Arc::new(Sha1Digester::default()),
            config.max_io_queue_size,
        );
        let assignments = Arc::new(Assignments::new(
            selector,
            data.total_pieces(),
            config.endgame,
        ));
        let (dispatcher, departures) = MessageDispatcher::new(config.dispatch_interval);
        let inner = Arc::new(InnerEngine {
            config,
            data,
            data_worker,
            assignments,
            dispatcher,
            peers: RwLock::new(HashMap::new()),
            banned: std::sync::Mutex::new(HashMap::new()),
            closed_transfers: std::sync::Mutex::new(TransferTotals::default()),
            callbacks: MultiThreadedCallback::new(),
            cancellation_token: CancellationToken::new(),
        });

        let main_loop = inner.clone();
        tokio::spawn(async move {
            main_loop.start(departures).await;
        });

        Self { inner }
    }

    /// Attach the given peer connection to the engine.
    ///
    /// # Returns
    ///
    /// Returns the handle of the attached peer, or an error when the engine is stopped or
    /// the peer address is banned.
    pub async fn attach_peer(&self, connection: Arc<dyn PeerConnection>) -> Result<PeerHandle> {
        if self.inner.cancellation_token.is_cancelled() {
            return Err(EngineError::Stopped);
        }

        let addr = connection.addr();
        if self.inner.is_banned(&addr) {
            debug!("Refusing banned peer address {}", addr);
            return Err(EngineError::Banned(addr));
        }

        let handle = connection.handle();
        let worker = Arc::new(PeerWorker::new(
            handle,
            self.inner.data.clone(),
            self.inner.data_worker.clone(),
            self.inner.assignments.clone(),
            self.inner.config.clone(),
        ));

        worker.announce_bitfield().await;
        self.inner
            .peers
            .write()
            .await
            .insert(handle, PeerEntry {
                addr,
                worker: worker.clone(),
            });
        self.inner
            .dispatcher
            .register(connection, worker.clone(), worker)
            .await;

        info!("Peer {} ({}) attached to the engine", handle, addr);
        self.inner.callbacks.invoke(EngineEvent::PeerConnected(handle));
        Ok(handle)
    }

    /// Detach the given peer from the engine, closing its connection.
    pub async fn detach_peer(&self, handle: PeerHandle) -> Result<()> {
        if !self.inner.peers.read().await.contains_key(&handle) {
            return Err(EngineError::UnknownPeer(handle));
        }

        self.inner.dispatcher.remove(handle).await;
        Ok(())
    }

    /// Get the number of peers attached to the engine.
    pub async fn total_peers(&self) -> usize {
        self.inner.peers.read().await.len()
    }

    /// Get the number of pieces that still need to be downloaded.
    pub async fn pieces_remaining(&self) -> usize {
        self.inner.data.pieces_remaining().await
    }

    /// Check if every piece of the torrent has been verified.
    pub async fn is_complete(&self) -> bool {
        self.inner.data.pieces_remaining().await == 0
    }

    /// Get a snapshot of the verified-piece bitfield of the torrent.
    pub async fn bitfield(&self) -> BitVec {
        self.inner.data.bitfield().read().await.as_bits().clone()
    }

    /// Get the aggregated transfer totals of the engine.
    pub async fn totals(&self) -> TransferTotals {
        let mut totals = *self
            .inner
            .closed_transfers
            .lock()
            .expect("expected the transfer lock to not be poisoned");

        for entry in self.inner.peers.read().await.values() {
            let (downloaded, uploaded) = entry.worker.transfer_totals().await;
            totals.downloaded += downloaded;
            totals.uploaded += uploaded;
        }

        totals
    }

    /// Stop the engine, closing every attached peer connection.
    pub async fn stop(&self) {
        debug!("Torrent engine is stopping");
        self.inner.cancellation_token.cancel();
        self.inner.dispatcher.stop().await;
        self.inner.peers.write().await.clear();
    }
}

impl Callback<EngineEvent> for TorrentEngine {
    fn subscribe(&self) -> Subscription<EngineEvent> {
        self.inner.callbacks.subscribe()
    }

    fn subscribe_with(&self, subscriber: Subscriber<EngineEvent>) {
        self.inner.callbacks.subscribe_with(subscriber)
    }
}

#[derive(Debug)]
struct PeerEntry {
    addr: SocketAddr,
    worker: Arc<PeerWorker>,
}

#[derive(Debug)]
struct InnerEngine {
    config: EngineConfig,
    data: Arc<TorrentData>,
    data_worker: DataWorker,
    assignments: Arc<Assignments>,
    dispatcher: MessageDispatcher,
    peers: RwLock<HashMap<PeerHandle, PeerEntry>>,
    /// The banned peer addresses with the instant at which the ban expires
    banned: std::sync::Mutex<HashMap<SocketAddr, Instant>>,
    /// The transfer totals of peers that have already left
    closed_transfers: std::sync::Mutex<TransferTotals>,
    callbacks: MultiThreadedCallback<EngineEvent>,
    cancellation_token: CancellationToken,
}

impl InnerEngine {
    async fn start(&self, mut departures: mpsc::UnboundedReceiver<PeerDeparture>) {
        let mut data_events = self.data_worker.subscribe();

        loop {
            select! {
                _ = self.cancellation_token.cancelled() => break,
                departure = departures.recv() => {
                    if let Some(departure) = departure {
                        self.on_departure(departure).await;
                    } else {
                        break;
                    }
                },
                event = data_events.recv() => {
                    if let Some(event) = event {
                        self.on_data_event(&event).await;
                    } else {
                        break;
                    }
                },
            }
        }
        debug!("Torrent engine main loop ended");
    }

    async fn on_data_event(&self, event: &DataWorkerEvent) {
        match event {
            DataWorkerEvent::PieceVerified(piece) => {
                self.assignments.complete(*piece);

                let workers: Vec<Arc<PeerWorker>> = self
                    .peers
                    .read()
                    .await
                    .values()
                    .map(|entry| entry.worker.clone())
                    .collect();
                for worker in workers {
                    worker.announce_piece(*piece).await;
                    worker.piece_completed(*piece).await;
                }
                self.dispatcher.notify_cycle();

                self.callbacks.invoke(EngineEvent::PieceVerified(*piece));
                if self.data.pieces_remaining().await == 0 {
                    info!("Torrent download completed");
                    self.callbacks.invoke(EngineEvent::DownloadComplete);
                }
            }
            DataWorkerEvent::PieceCorrupted(piece) => {
                self.callbacks.invoke(EngineEvent::PieceCorrupted(*piece));
            }
        }
    }

    async fn on_departure(&self, departure: PeerDeparture) {
        let entry = self.peers.write().await.remove(&departure.handle);
        let entry = match entry {
            Some(entry) => entry,
            None => return,
        };

        trace!("Cleaning up departed peer {}", departure.handle);
        self.assignments.unassign(departure.handle);
        self.assignments
            .remove_bitfield(&entry.worker.remote_bitfield().await);

        let (downloaded, uploaded) = entry.worker.transfer_totals().await;
        {
            let mut totals = self
                .closed_transfers
                .lock()
                .expect("expected the transfer lock to not be poisoned");
            totals.downloaded += downloaded;
            totals.uploaded += uploaded;
        }

        if let Some(reason) = departure.reason.as_ref() {
            if reason.is_protocol_violation() {
                warn!(
                    "Banning peer address {} for {:?}, {}",
                    entry.addr, self.config.ban_duration, reason
                );
                self.banned
                    .lock()
                    .expect("expected the ban lock to not be poisoned")
                    .insert(entry.addr, Instant::now() + self.config.ban_duration);
                self.callbacks.invoke(EngineEvent::PeerBanned(entry.addr));
            }
        }

        self.callbacks
            .invoke(EngineEvent::PeerDisconnected(departure.handle));
    }

    fn is_banned(&self, addr: &SocketAddr) -> bool {
        let mut banned = self
            .banned
            .lock()
            .expect("expected the ban lock to not be poisoned");
        let now = Instant::now();

        banned.retain(|_, until| *until > now);
        banned.contains_key(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::peer::tests::FakePeerConnection;
    use crate::engine::peer::{Message, Piece};
    use crate::engine::selector::{RarestFirstSelector, SequentialSelector};
    use crate::engine::storage::MemoryStorage;
    use crate::engine::MAX_BLOCK_SIZE;
    use crate::init_logger;
    use sha1::{Digest, Sha1};
    use std::time::Duration;
    use tokio::time;

    fn new_engine(
        config: EngineConfig,
        piece_length: usize,
        total_length: u64,
        checksums: Vec<Checksum>,
    ) -> (TorrentEngine, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new(total_length));
        let engine = TorrentEngine::new(
            config,
            piece_length,
            total_length,
            checksums,
            storage.clone(),
            Box::new(SequentialSelector),
        );

        (engine, storage)
    }

    async fn expect_event(
        events: &mut Subscription<EngineEvent>,
        expected: EngineEvent,
    ) -> EngineEvent {
        loop {
            let event = time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("expected an event within the timeout")
                .expect("expected the event stream to remain open");

            if *event == expected {
                return expected;
            }
        }
    }

    #[tokio::test]
    async fn test_engine_attach_peer() {
        init_logger!();
        let (engine, _storage) = new_engine(
            EngineConfig::default(),
            MAX_BLOCK_SIZE,
            MAX_BLOCK_SIZE as u64,
            vec![[0u8; 20]],
        );
        let connection = Arc::new(FakePeerConnection::new());
        let mut events = engine.subscribe();

        let handle = engine.attach_peer(connection).await.unwrap();

        expect_event(&mut events, EngineEvent::PeerConnected(handle)).await;
        assert_eq!(1, engine.total_peers().await);
    }

    #[tokio::test]
    async fn test_engine_detach_unknown_peer() {
        init_logger!();
        let (engine, _storage) = new_engine(
            EngineConfig::default(),
            MAX_BLOCK_SIZE,
            MAX_BLOCK_SIZE as u64,
            vec![[0u8; 20]],
        );
        let handle = PeerHandle::new();

        let result = engine.detach_peer(handle).await;

        assert_eq!(Err(EngineError::UnknownPeer(handle)), result);
    }

    #[tokio::test]
    async fn test_engine_attach_after_stop() {
        init_logger!();
        let (engine, _storage) = new_engine(
            EngineConfig::default(),
            MAX_BLOCK_SIZE,
            MAX_BLOCK_SIZE as u64,
            vec![[0u8; 20]],
        );

        engine.stop().await;
        let result = engine.attach_peer(Arc::new(FakePeerConnection::new())).await;

        assert_eq!(Err(EngineError::Stopped), result);
    }

    #[tokio::test]
    async fn test_engine_bans_protocol_violation() {
        init_logger!();
        let (engine, _storage) = new_engine(
            EngineConfig::default(),
            MAX_BLOCK_SIZE,
            MAX_BLOCK_SIZE as u64,
            vec![[0u8; 20]],
        );
        let connection = Arc::new(FakePeerConnection::new());
        let addr = connection.addr();
        let mut events = engine.subscribe();
        // a have for a piece beyond the torrent size is a protocol violation
        connection.push_inbound(Message::Have(5));

        let handle = engine.attach_peer(connection.clone()).await.unwrap();

        expect_event(&mut events, EngineEvent::PeerBanned(addr)).await;
        expect_event(&mut events, EngineEvent::PeerDisconnected(handle)).await;
        assert_eq!(true, connection.is_closed(), "expected the connection to be closed");
        assert_eq!(0, engine.total_peers().await);

        // a new connection from the banned address is refused
        let result = engine.attach_peer(Arc::new(FakePeerConnection::new())).await;
        assert_eq!(Err(EngineError::Banned(addr)), result);
    }

    #[tokio::test]
    async fn test_engine_downloads_torrent_from_seed() {
        init_logger!();
        let piece_length = MAX_BLOCK_SIZE * 2;
        let total_length = (piece_length + MAX_BLOCK_SIZE) as u64;
        let torrent_data: Vec<u8> = (0..total_length).map(|i| (i % 251) as u8).collect();
        let checksums: Vec<Checksum> = vec![
            Sha1::digest(&torrent_data[..piece_length]).into(),
            Sha1::digest(&torrent_data[piece_length..]).into(),
        ];
        let storage = Arc::new(MemoryStorage::new(total_length));
        let engine = TorrentEngine::new(
            EngineConfig::default(),
            piece_length,
            total_length,
            checksums,
            storage.clone(),
            Box::new(RarestFirstSelector::from_seed(42)),
        );
        let seed = Arc::new(FakePeerConnection::new());
        let mut events = engine.subscribe();
        let mut bits = BitVec::from_elem(8, false);
        bits.set(0, true);
        bits.set(1, true);
        seed.push_inbound(Message::Bitfield(bits));
        seed.push_inbound(Message::Unchoke);

        engine.attach_peer(seed.clone()).await.unwrap();

        // answer the block requests of the engine like a seeding peer would
        let serve = {
            let seed = seed.clone();
            let torrent_data = torrent_data.clone();
            tokio::spawn(async move {
                loop {
                    for message in seed.take_outbound() {
                        if let Message::Request(request) = message {
                            let offset = request.index * piece_length + request.begin;
                            seed.push_inbound(Message::Piece(Piece {
                                index: request.index,
                                begin: request.begin,
                                data: torrent_data[offset..offset + request.length].to_vec(),
                            }));
                        }
                    }
                    time::sleep(Duration::from_millis(2)).await;
                }
            })
        };

        expect_event(&mut events, EngineEvent::DownloadComplete).await;
        serve.abort();

        assert_eq!(true, engine.is_complete().await);
        assert_eq!(0, engine.pieces_remaining().await);
        assert_eq!(
            torrent_data,
            storage.read(0, total_length as usize).await.unwrap(),
            "expected the stored data to match the torrent data"
        );
        assert_eq!(total_length, engine.totals().await.downloaded);
    }
}
