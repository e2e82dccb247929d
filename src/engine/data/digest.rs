use sha1::{Digest, Sha1};
use std::fmt::Debug;

/// The expected digest of a single piece, supplied with the torrent metadata.
pub type Checksum = [u8; 20];

/// Computes the digest of piece data for integrity verification.
pub trait Digester: Debug + Send + Sync {
    /// Compute the digest of the given piece data.
    fn compute(&self, data: &[u8]) -> Checksum;
}

/// The default digester of the engine, computing SHA-1 digests as used by the
/// BitTorrent piece verification.
#[derive(Debug, Default)]
pub struct Sha1Digester;

impl Digester for Sha1Digester {
    fn compute(&self, data: &[u8]) -> Checksum {
        Sha1::digest(data).into()
    }
}
