use crate::engine::data::{DataError, Digester, TorrentData};
use crate::engine::peer::{BlockKey, PeerHandle, Request};
use crate::engine::storage::Storage;
use crate::engine::{EngineError, PieceIndex};
use derive_more::Display;
use fx_callback::{Callback, MultiThreadedCallback, Subscriber, Subscription};
use log::{debug, trace, warn};
use std::sync::Arc;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};

/// The events of the [DataWorker].
#[derive(Debug, Display, Clone, PartialEq)]
pub enum DataWorkerEvent {
    /// Invoked when a completed piece passed its checksum verification
    #[display("piece {} has been verified", _0)]
    PieceVerified(PieceIndex),
    /// Invoked when a completed piece failed its checksum verification
    #[display("piece {} is corrupted", _0)]
    PieceCorrupted(PieceIndex),
}

/// The outcome of a block write that was handed to the [DataWorker].
#[derive(Debug)]
pub struct BlockWrite {
    /// The peer from which the block data was received
    pub peer: PeerHandle,
    /// The block that was written
    pub key: BlockKey,
    /// Indicates if the write was rejected because the worker queue was full
    pub rejected: bool,
    /// The error that occurred while processing the write, if any
    pub error: Option<EngineError>,
}

impl BlockWrite {
    /// Check if the block data has been stored.
    pub fn is_success(&self) -> bool {
        !self.rejected && self.error.is_none()
    }
}

/// The outcome of a block read that was handed to the [DataWorker].
#[derive(Debug)]
pub struct BlockRead {
    /// The peer that requested the block
    pub peer: PeerHandle,
    /// The block that was read
    pub key: BlockKey,
    /// The block data, present when the read succeeded
    pub data: Option<Vec<u8>>,
    /// Indicates if the read was rejected because the worker queue was full
    pub rejected: bool,
    /// The error that occurred while processing the read, if any
    pub error: Option<EngineError>,
}

impl BlockRead {
    /// Check if the block data has been read.
    pub fn is_success(&self) -> bool {
        self.data.is_some()
    }
}

/// The asynchronous disk io worker of the engine.
///
/// It executes block reads and writes against the underlying [Storage] without blocking the
/// exchange loop, bounded by a maximum number of in-flight operations. Operations offered
/// beyond the bound are rejected immediately, the caller is expected to retry them on a
/// later cycle.
///
/// Block writes which complete a piece trigger the checksum verification of that piece.
#[derive(Debug, Clone)]
pub struct DataWorker {
    inner: Arc<InnerDataWorker>,
}

impl DataWorker {
    /// Create a new data worker for the given torrent data and storage.
    ///
    /// # Arguments
    ///
    /// * `data` - The block and verification bookkeeping of the torrent.
    /// * `storage` - The backing storage of the torrent data.
    /// * `digester` - The digest implementation used to verify completed pieces.
    /// * `max_queue_size` - The maximum number of in-flight io operations.
    pub fn new(
        data: Arc<TorrentData>,
        storage: Arc<dyn Storage>,
        digester: Arc<dyn Digester>,
        max_queue_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(InnerDataWorker {
                data,
                storage,
                digester,
                permits: Arc::new(Semaphore::new(max_queue_size)),
                callbacks: MultiThreadedCallback::new(),
            }),
        }
    }

    /// Offer the received block data for storage.
    ///
    /// # Returns
    ///
    /// Returns the receiver on which the [BlockWrite] outcome will be delivered.
    /// A rejected write settles immediately.
    pub fn write_block(
        &self,
        peer: PeerHandle,
        piece: PieceIndex,
        begin: usize,
        data: Vec<u8>,
    ) -> oneshot::Receiver<BlockWrite> {
        let key = BlockKey::new(piece, begin, data.len());
        let (tx, rx) = oneshot::channel();

        match self.inner.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    inner.process_write(permit, peer, key, data, tx).await;
                });
            }
            Err(_) => {
                trace!("Data worker rejected block write of {} for peer {}", key, peer);
                let _ = tx.send(BlockWrite {
                    peer,
                    key,
                    rejected: true,
                    error: None,
                });
            }
        }

        rx
    }

    /// Offer the given block request for reading.
    ///
    /// # Returns
    ///
    /// Returns the receiver on which the [BlockRead] outcome will be delivered.
    /// A rejected read settles immediately.
    pub fn read_block(&self, peer: PeerHandle, request: &Request) -> oneshot::Receiver<BlockRead> {
        let key = BlockKey::from(request);
        let (tx, rx) = oneshot::channel();

        match self.inner.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    inner.process_read(permit, peer, key, tx).await;
                });
            }
            Err(_) => {
                trace!("Data worker rejected block read of {} for peer {}", key, peer);
                let _ = tx.send(BlockRead {
                    peer,
                    key,
                    data: None,
                    rejected: true,
                    error: None,
                });
            }
        }

        rx
    }
}

impl Callback<DataWorkerEvent> for DataWorker {
    fn subscribe(&self) -> Subscription<DataWorkerEvent> {
        self.inner.callbacks.subscribe()
    }

    fn subscribe_with(&self, subscriber: Subscriber<DataWorkerEvent>) {
        self.inner.callbacks.subscribe_with(subscriber)
    }
}

#[derive(Debug)]
struct InnerDataWorker {
    data: Arc<TorrentData>,
    storage: Arc<dyn Storage>,
    digester: Arc<dyn Digester>,
    permits: Arc<Semaphore>,
    callbacks: MultiThreadedCallback<DataWorkerEvent>,
}

impl InnerDataWorker {
    async fn process_write(
        &self,
        _permit: OwnedSemaphorePermit,
        peer: PeerHandle,
        key: BlockKey,
        data: Vec<u8>,
        tx: oneshot::Sender<BlockWrite>,
    ) {
        let error = self.execute_write(&key, data).await.err();

        if let Some(err) = error.as_ref() {
            debug!("Data worker failed to write {} of peer {}, {}", key, peer, err);
        }

        let _ = tx.send(BlockWrite {
            peer,
            key,
            rejected: false,
            error,
        });
    }

    async fn execute_write(&self, key: &BlockKey, data: Vec<u8>) -> crate::engine::Result<()> {
        let mut chunk = self.data.chunk(key.piece)?.lock().await;
        let end = key
            .begin
            .checked_add(key.length)
            .ok_or(DataError::OutOfRange(chunk.len(), usize::MAX))?;

        if end > chunk.len() {
            return Err(DataError::OutOfRange(chunk.len(), end).into());
        }

        let chunk_offset = chunk.torrent_range().start;
        self.storage.write(chunk_offset + key.begin as u64, &data).await?;
        chunk.write_block(key.begin, key.length)?;
        trace!("Data worker stored {}", key);

        if chunk.is_complete() {
            let piece_data = self.storage.read(chunk_offset, chunk.len()).await?;
            let digest = self.digester.compute(&piece_data);

            if &digest == chunk.checksum() {
                self.data.bitfield().write().await.mark_verified(key.piece);
                debug!("Piece {} has been verified", key.piece);
                self.callbacks
                    .invoke(DataWorkerEvent::PieceVerified(key.piece));
            } else {
                warn!("Piece {} is corrupted, discarding its data", key.piece);
                chunk.reset();
                self.callbacks
                    .invoke(DataWorkerEvent::PieceCorrupted(key.piece));
            }
        }

        Ok(())
    }

    async fn process_read(
        &self,
        _permit: OwnedSemaphorePermit,
        peer: PeerHandle,
        key: BlockKey,
        tx: oneshot::Sender<BlockRead>,
    ) {
        match self.execute_read(&key).await {
            Ok(data) => {
                let _ = tx.send(BlockRead {
                    peer,
                    key,
                    data: Some(data),
                    rejected: false,
                    error: None,
                });
            }
            Err(err) => {
                debug!("Data worker failed to read {} of peer {}, {}", key, peer, err);
                let _ = tx.send(BlockRead {
                    peer,
                    key,
                    data: None,
                    rejected: false,
                    error: Some(err),
                });
            }
        }
    }

    async fn execute_read(&self, key: &BlockKey) -> crate::engine::Result<Vec<u8>> {
        let chunk = self.data.chunk(key.piece)?.lock().await;
        let end = key
            .begin
            .checked_add(key.length)
            .ok_or(DataError::OutOfRange(chunk.len(), usize::MAX))?;

        if end > chunk.len() {
            return Err(DataError::OutOfRange(chunk.len(), end).into());
        }

        let offset = chunk.torrent_range().start + key.begin as u64;
        drop(chunk);

        let data = self.storage.read(offset, key.length).await?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::data::Sha1Digester;
    use crate::engine::storage::MemoryStorage;
    use crate::engine::MAX_BLOCK_SIZE;
    use crate::init_logger;
    use sha1::{Digest, Sha1};

    fn new_worker(
        piece_length: usize,
        total_length: u64,
        checksums: Vec<[u8; 20]>,
        max_queue_size: usize,
    ) -> (DataWorker, Arc<TorrentData>) {
        let data = Arc::new(TorrentData::new(piece_length, total_length, checksums));
        let storage = Arc::new(MemoryStorage::new(total_length));
        let worker = DataWorker::new(
            data.clone(),
            storage,
            Arc::new(Sha1Digester::default()),
            max_queue_size,
        );

        (worker, data)
    }

    #[tokio::test]
    async fn test_data_worker_write_verifies_piece() {
        init_logger!();
        let piece_data = vec![7u8; MAX_BLOCK_SIZE];
        let checksum: [u8; 20] = Sha1::digest(&piece_data).into();
        let (worker, data) =
            new_worker(MAX_BLOCK_SIZE, MAX_BLOCK_SIZE as u64, vec![checksum], 4);
        let peer = PeerHandle::new();
        let mut events = worker.subscribe();

        let result = worker
            .write_block(peer, 0, 0, piece_data)
            .await
            .expect("expected the write outcome to be delivered");

        assert_eq!(true, result.is_success(), "expected the write to succeed");
        assert_eq!(false, result.rejected);

        let event = events.recv().await.expect("expected an event to be published");
        assert_eq!(DataWorkerEvent::PieceVerified(0), *event);
        assert_eq!(true, data.is_piece_verified(0).await);
    }

    #[tokio::test]
    async fn test_data_worker_corrupted_piece_is_discarded() {
        init_logger!();
        let piece_data = vec![9u8; MAX_BLOCK_SIZE];
        let (worker, data) =
            new_worker(MAX_BLOCK_SIZE, MAX_BLOCK_SIZE as u64, vec![[0u8; 20]], 4);
        let peer = PeerHandle::new();
        let mut events = worker.subscribe();

        let result = worker
            .write_block(peer, 0, 0, piece_data)
            .await
            .expect("expected the write outcome to be delivered");

        assert_eq!(true, result.is_success(), "expected the write itself to succeed");

        let event = events.recv().await.expect("expected an event to be published");
        assert_eq!(DataWorkerEvent::PieceCorrupted(0), *event);
        assert_eq!(false, data.is_piece_verified(0).await);

        let chunk = data.chunk(0).unwrap().lock().await;
        assert_eq!(
            true,
            chunk.is_empty(),
            "expected the corrupted chunk data to be discarded"
        );
    }

    #[tokio::test]
    async fn test_data_worker_rejects_when_queue_is_full() {
        init_logger!();
        let (worker, _data) = new_worker(MAX_BLOCK_SIZE, MAX_BLOCK_SIZE as u64, vec![[0u8; 20]], 0);
        let peer = PeerHandle::new();

        let result = worker
            .write_block(peer, 0, 0, vec![0u8; 512])
            .await
            .expect("expected the write outcome to be delivered");

        assert_eq!(true, result.rejected, "expected the write to be rejected");
        assert_eq!(None, result.error);
    }

    #[tokio::test]
    async fn test_data_worker_write_out_of_range() {
        init_logger!();
        let (worker, _data) = new_worker(MAX_BLOCK_SIZE, MAX_BLOCK_SIZE as u64, vec![[0u8; 20]], 4);
        let peer = PeerHandle::new();

        let result = worker
            .write_block(peer, 0, MAX_BLOCK_SIZE, vec![0u8; 512])
            .await
            .expect("expected the write outcome to be delivered");

        assert_eq!(false, result.is_success());
        assert_eq!(
            Some(EngineError::Data(DataError::OutOfRange(
                MAX_BLOCK_SIZE,
                MAX_BLOCK_SIZE + 512
            ))),
            result.error
        );
    }

    #[tokio::test]
    async fn test_data_worker_read_block() {
        init_logger!();
        let total_length = (MAX_BLOCK_SIZE * 2) as u64;
        let data = Arc::new(TorrentData::new(
            MAX_BLOCK_SIZE,
            total_length,
            vec![[0u8; 20]; 2],
        ));
        let storage = Arc::new(MemoryStorage::new(total_length));
        storage
            .write(MAX_BLOCK_SIZE as u64, &vec![3u8; 512])
            .await
            .unwrap();
        let worker = DataWorker::new(
            data,
            storage,
            Arc::new(Sha1Digester::default()),
            4,
        );
        let peer = PeerHandle::new();
        let request = Request {
            index: 1,
            begin: 0,
            length: 512,
        };

        let result = worker
            .read_block(peer, &request)
            .await
            .expect("expected the read outcome to be delivered");

        assert_eq!(true, result.is_success(), "expected the read to succeed");
        assert_eq!(Some(vec![3u8; 512]), result.data);
    }
}
