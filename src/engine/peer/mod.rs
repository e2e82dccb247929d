pub use connection::*;
pub use errors::*;
pub use protocol::*;
pub use state::*;
pub use worker::*;

mod connection;
mod errors;
mod protocol;
mod state;
mod worker;

use fx_handle::Handle;

/// The unique identifier handle of a peer connection within the engine.
pub type PeerHandle = Handle;

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// An in-memory peer connection double.
    ///
    /// Inbound messages are injected through [FakePeerConnection::push_inbound] and
    /// outbound messages posted by the engine are captured for assertions.
    #[derive(Debug)]
    pub struct FakePeerConnection {
        handle: PeerHandle,
        addr: SocketAddr,
        inbound: Mutex<VecDeque<Message>>,
        outbound: Mutex<Vec<Message>>,
        closed: AtomicBool,
    }

    impl FakePeerConnection {
        pub fn new() -> Self {
            Self {
                handle: PeerHandle::new(),
                addr: ([127, 0, 0, 1], 6881).into(),
                inbound: Mutex::new(VecDeque::new()),
                outbound: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }
        }

        pub fn push_inbound(&self, message: Message) {
            self.inbound.lock().unwrap().push_back(message);
        }

        pub fn take_outbound(&self) -> Vec<Message> {
            std::mem::take(&mut *self.outbound.lock().unwrap())
        }
    }

    #[async_trait::async_trait]
    impl PeerConnection for FakePeerConnection {
        fn handle(&self) -> PeerHandle {
            self.handle
        }

        fn addr(&self) -> SocketAddr {
            self.addr
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Relaxed)
        }

        async fn read_message_now(&self) -> Result<Option<Message>> {
            if self.is_closed() {
                return Err(Error::Closed);
            }

            Ok(self.inbound.lock().unwrap().pop_front())
        }

        async fn post_message(&self, message: Message) -> Result<()> {
            if self.is_closed() {
                return Err(Error::Closed);
            }

            self.outbound.lock().unwrap().push(message);
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::Relaxed);
        }
    }
}
