pub use assignments::*;
pub use config::*;
pub use data_worker::*;
pub use dispatcher::*;
pub use errors::*;
pub use selector::*;
pub use session::*;
pub use storage::*;

mod assignments;
mod config;
pub mod data;
mod data_worker;
mod dispatcher;
mod errors;
pub mod peer;
mod selector;
mod session;
mod storage;

/// The alias type used to identify piece indexes.
pub type PieceIndex = usize;

/// The alias type used to identify block indexes within a piece.
pub type BlockIndex = usize;

/// The maximum size in bytes of a single block that can be requested from a peer.
pub const MAX_BLOCK_SIZE: usize = 16 * 1024; // 16 KiB
