use crate::engine::peer::{Message, PeerHandle, Result};
use async_trait::async_trait;
use std::fmt::Debug;
use std::net::SocketAddr;

/// The transport seam of a peer connection.
///
/// The engine drives connections through this trait only, which allows the exchange
/// logic to be tested against in-memory doubles.
#[async_trait]
pub trait PeerConnection: Debug + Send + Sync {
    /// The unique handle of this connection.
    fn handle(&self) -> PeerHandle;

    /// The remote socket address of the peer.
    fn addr(&self) -> SocketAddr;

    /// Check if the underlying transport has been closed.
    fn is_closed(&self) -> bool;

    /// Try to read the next message from the peer without waiting for one to arrive.
    ///
    /// # Returns
    ///
    /// Returns the next available message, [None] when no message is pending, or an
    /// error when the transport failed or a message couldn't be parsed.
    async fn read_message_now(&self) -> Result<Option<Message>>;

    /// Send the given message to the remote peer.
    async fn post_message(&self, message: Message) -> Result<()>;

    /// Close the underlying transport.
    ///
    /// Any message posted afterwards results in [crate::engine::peer::Error::Closed].
    async fn close(&self);
}
