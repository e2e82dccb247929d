use async_trait::async_trait;
use std::fmt::Debug;
use std::io;
use std::io::SeekFrom;
use std::path::Path;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};

/// The result type of storage operations.
pub type StorageResult<T> = std::result::Result<T, Error>;

/// The storage specific errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Indicates that the requested byte range is out of the storage bounds
    #[error("the requested range {0}..{1} is out-of-bounds")]
    OutOfBounds(u64, u64),
    /// Indicates that an io error occurred
    #[error("an io error occurred, {0}")]
    Io(io::Error),
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::OutOfBounds(a, b), Error::OutOfBounds(c, d)) => a == c && b == d,
            (Error::Io(_), Error::Io(_)) => true,
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(error)
    }
}

/// The storage surface consumed by the engine.
///
/// The engine addresses the torrent data as one flat byte space; mapping these offsets
/// onto files is the responsibility of the storage implementation and out of scope for
/// the exchange engine itself.
#[async_trait]
pub trait Storage: Debug + Send + Sync {
    /// Read the given byte range from the storage.
    /// Bytes that have never been written are returned as `0`.
    ///
    /// # Arguments
    ///
    /// * `offset` - The offset within the torrent data to start reading from.
    /// * `length` - The number of bytes to read.
    ///
    /// # Returns
    ///
    /// Returns the requested bytes, or an error when the range is out of bounds.
    async fn read(&self, offset: u64, length: usize) -> StorageResult<Vec<u8>>;

    /// Write the given bytes to the storage at the given offset.
    async fn write(&self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Get the total length in bytes of the torrent data.
    fn total_len(&self) -> u64;
}

/// Fast in-memory storage of torrent data.
/// This storage type is not recommended for large torrents.
#[derive(Debug)]
pub struct MemoryStorage {
    data: RwLock<Vec<u8>>,
    total_len: u64,
}

impl MemoryStorage {
    pub fn new(total_len: u64) -> Self {
        Self {
            data: RwLock::new(Vec::new()),
            total_len,
        }
    }

    fn assert_in_bounds(&self, offset: u64, length: usize) -> StorageResult<u64> {
        let end = offset
            .checked_add(length as u64)
            .ok_or(Error::OutOfBounds(offset, u64::MAX))?;
        if end > self.total_len {
            return Err(Error::OutOfBounds(offset, end));
        }

        Ok(end)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, offset: u64, length: usize) -> StorageResult<Vec<u8>> {
        self.assert_in_bounds(offset, length)?;
        let data = self.data.read().await;

        let mut buffer = vec![0u8; length];
        let offset = offset as usize;
        // pad the buffer with zeros for the bytes that have never been written
        let available = data.len().saturating_sub(offset).min(length);
        if available > 0 {
            buffer[..available].copy_from_slice(&data[offset..offset + available]);
        }

        Ok(buffer)
    }

    async fn write(&self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        let end = self.assert_in_bounds(offset, bytes.len())? as usize;
        let mut data = self.data.write().await;

        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(bytes);

        Ok(())
    }

    fn total_len(&self) -> u64 {
        self.total_len
    }
}

/// Disk storage of the torrent data, backed by a single flat file.
#[derive(Debug)]
pub struct FileStorage {
    file: Mutex<File>,
    total_len: u64,
}

impl FileStorage {
    /// Open the storage file at the given path, creating it when it doesn't exist.
    /// The file is sized to the total torrent length, unwritten ranges read as zeros.
    pub async fn open<P: AsRef<Path>>(path: P, total_len: u64) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .await?;
        file.set_len(total_len).await?;

        Ok(Self {
            file: Mutex::new(file),
            total_len,
        })
    }

    fn assert_in_bounds(&self, offset: u64, length: usize) -> StorageResult<u64> {
        let end = offset
            .checked_add(length as u64)
            .ok_or(Error::OutOfBounds(offset, u64::MAX))?;
        if end > self.total_len {
            return Err(Error::OutOfBounds(offset, end));
        }

        Ok(end)
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn read(&self, offset: u64, length: usize) -> StorageResult<Vec<u8>> {
        self.assert_in_bounds(offset, length)?;
        let mut file = self.file.lock().await;
        let mut buffer = vec![0u8; length];

        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buffer).await?;

        Ok(buffer)
    }

    async fn write(&self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        self.assert_in_bounds(offset, bytes.len())?;
        let mut file = self.file.lock().await;

        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(bytes).await?;
        file.flush().await?;

        Ok(())
    }

    fn total_len(&self) -> u64 {
        self.total_len
    }
}
