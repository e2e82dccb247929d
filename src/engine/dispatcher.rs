use crate::engine::peer::{self, Message, PeerConnection, PeerHandle};
use async_trait::async_trait;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Consumes the messages received from a single peer connection.
#[async_trait]
pub trait MessageConsumer: Debug + Send + Sync {
    /// Consume the given message received from the peer.
    ///
    /// # Returns
    ///
    /// Returns an error when the message violates the protocol, which results in the
    /// removal of the peer from the dispatcher.
    async fn consume(&self, message: Message) -> peer::Result<()>;
}

/// Produces the messages to send to a single peer connection.
#[async_trait]
pub trait MessageProducer: Debug + Send + Sync {
    /// Produce the messages to send to the peer on this cycle.
    async fn produce(&self) -> peer::Result<Vec<Message>>;
}

/// The departure of a peer from the dispatcher.
#[derive(Debug)]
pub struct PeerDeparture {
    pub handle: PeerHandle,
    pub addr: SocketAddr,
    /// The error that caused the departure, [None] for a requested removal
    pub reason: Option<peer::Error>,
}

/// The exchange cycle driver of the engine.
///
/// It periodically drains the inbound messages of every registered peer into its consumer
/// and posts the messages offered by its producer. A peer that fails either phase is
/// closed, removed and reported as a departure.
#[derive(Debug, Clone)]
pub struct MessageDispatcher {
    inner: Arc<InnerDispatcher>,
}

impl MessageDispatcher {
    /// Create a new dispatcher which cycles at the given interval.
    ///
    /// # Returns
    ///
    /// Returns the dispatcher and the receiver on which peer departures are reported.
    pub fn new(interval: Duration) -> (Self, mpsc::UnboundedReceiver<PeerDeparture>) {
        let (departures, departures_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(InnerDispatcher {
            interval,
            peers: RwLock::new(HashMap::new()),
            departures,
            cycle_notify: Notify::new(),
            cancellation_token: CancellationToken::new(),
        });

        let main_loop = inner.clone();
        tokio::spawn(async move {
            main_loop.start().await;
        });

        (Self { inner }, departures_rx)
    }

    /// Register the given peer connection with its consumer and producer.
    pub async fn register(
        &self,
        connection: Arc<dyn PeerConnection>,
        consumer: Arc<dyn MessageConsumer>,
        producer: Arc<dyn MessageProducer>,
    ) {
        let handle = connection.handle();
        let mut peers = self.inner.peers.write().await;

        debug!("Dispatcher is registering peer {}", handle);
        peers.insert(
            handle,
            DispatcherEntry {
                connection,
                consumer,
                producer,
            },
        );
        self.inner.cycle_notify.notify_one();
    }

    /// Remove the given peer from the dispatcher.
    /// The underlying connection is closed and a departure without reason is reported.
    pub async fn remove(&self, handle: PeerHandle) {
        self.inner.remove_peer(handle, None).await;
    }

    /// Trigger an exchange cycle without waiting for the interval to elapse.
    pub fn notify_cycle(&self) {
        self.inner.cycle_notify.notify_one();
    }

    /// Get the number of registered peers.
    pub async fn total_peers(&self) -> usize {
        self.inner.peers.read().await.len()
    }

    /// Stop the dispatcher, closing every registered peer connection.
    pub async fn stop(&self) {
        self.inner.cancellation_token.cancel();

        let mut peers = self.inner.peers.write().await;
        for (_, entry) in peers.drain() {
            entry.connection.close().await;
        }
    }
}

#[derive(Debug)]
struct DispatcherEntry {
    connection: Arc<dyn PeerConnection>,
    consumer: Arc<dyn MessageConsumer>,
    producer: Arc<dyn MessageProducer>,
}

#[derive(Debug)]
struct InnerDispatcher {
    interval: Duration,
    peers: RwLock<HashMap<PeerHandle, DispatcherEntry>>,
    departures: mpsc::UnboundedSender<PeerDeparture>,
    cycle_notify: Notify,
    cancellation_token: CancellationToken,
}

impl InnerDispatcher {
    async fn start(&self) {
        loop {
            select! {
                _ = self.cancellation_token.cancelled() => break,
                _ = self.cycle_notify.notified() => self.run_cycle().await,
                _ = time::sleep(self.interval) => self.run_cycle().await,
            }
        }
        debug!("Dispatcher main loop ended");
    }

    async fn run_cycle(&self) {
        let entries: Vec<(PeerHandle, Arc<dyn PeerConnection>, Arc<dyn MessageConsumer>, Arc<dyn MessageProducer>)> = {
            let peers = self.peers.read().await;
            peers
                .iter()
                .map(|(handle, entry)| {
                    (
                        *handle,
                        entry.connection.clone(),
                        entry.consumer.clone(),
                        entry.producer.clone(),
                    )
                })
                .collect()
        };

        for (handle, connection, consumer, producer) in entries {
            if let Err(err) = Self::exchange(&connection, &consumer, &producer).await {
                warn!("Dispatcher is removing peer {}, {}", handle, err);
                self.remove_peer(handle, Some(err)).await;
            }
        }
    }

    /// Execute a single exchange cycle for one peer.
    /// At most one buffered inbound message is consumed per cycle, keeping a flooding
    /// peer from starving the rest of the swarm.
    async fn exchange(
        connection: &Arc<dyn PeerConnection>,
        consumer: &Arc<dyn MessageConsumer>,
        producer: &Arc<dyn MessageProducer>,
    ) -> peer::Result<()> {
        if let Some(message) = connection.read_message_now().await? {
            trace!("Dispatcher received {:?} from peer {}", message, connection.handle());
            consumer.consume(message).await?;
        }

        for message in producer.produce().await? {
            trace!("Dispatcher is sending {:?} to peer {}", message, connection.handle());
            connection.post_message(message).await?;
        }

        Ok(())
    }

    async fn remove_peer(&self, handle: PeerHandle, reason: Option<peer::Error>) {
        let entry = self.peers.write().await.remove(&handle);

        if let Some(entry) = entry {
            let addr = entry.connection.addr();
            entry.connection.close().await;

            let _ = self.departures.send(PeerDeparture {
                handle,
                addr,
                reason,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::peer::tests::FakePeerConnection;
    use crate::engine::peer::Error;
    use crate::init_logger;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct RecordingConsumer {
        messages: Mutex<Vec<Message>>,
        fail_with: Mutex<Option<Error>>,
    }

    impl RecordingConsumer {
        fn received(&self) -> Vec<Message> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageConsumer for RecordingConsumer {
        async fn consume(&self, message: Message) -> peer::Result<()> {
            if let Some(err) = self.fail_with.lock().unwrap().take() {
                return Err(err);
            }

            self.messages.lock().unwrap().push(message);
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct QueueProducer {
        queue: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl MessageProducer for QueueProducer {
        async fn produce(&self) -> peer::Result<Vec<Message>> {
            Ok(std::mem::take(&mut *self.queue.lock().unwrap()))
        }
    }

    #[tokio::test]
    async fn test_dispatcher_consumes_inbound_messages() {
        init_logger!();
        let (dispatcher, _departures) = MessageDispatcher::new(Duration::from_millis(1));
        let connection = Arc::new(FakePeerConnection::new());
        let consumer = Arc::new(RecordingConsumer::default());
        let producer = Arc::new(QueueProducer::default());
        connection.push_inbound(Message::Unchoke);
        connection.push_inbound(Message::Have(3));

        dispatcher
            .register(connection.clone(), consumer.clone(), producer)
            .await;
        time::sleep(Duration::from_millis(50)).await;

        assert_eq!(vec![Message::Unchoke, Message::Have(3)], consumer.received());
    }

    #[tokio::test]
    async fn test_dispatcher_posts_produced_messages() {
        init_logger!();
        let (dispatcher, _departures) = MessageDispatcher::new(Duration::from_millis(1));
        let connection = Arc::new(FakePeerConnection::new());
        let consumer = Arc::new(RecordingConsumer::default());
        let producer = Arc::new(QueueProducer::default());
        producer
            .queue
            .lock()
            .unwrap()
            .push(Message::Interested);

        dispatcher
            .register(connection.clone(), consumer, producer)
            .await;
        time::sleep(Duration::from_millis(50)).await;

        assert_eq!(vec![Message::Interested], connection.take_outbound());
    }

    #[tokio::test]
    async fn test_dispatcher_removes_peer_on_violation() {
        init_logger!();
        let (dispatcher, mut departures) = MessageDispatcher::new(Duration::from_millis(1));
        let connection = Arc::new(FakePeerConnection::new());
        let consumer = Arc::new(RecordingConsumer::default());
        let producer = Arc::new(QueueProducer::default());
        let expected_handle = connection.handle();
        *consumer.fail_with.lock().unwrap() = Some(Error::InvalidPiece(13));
        connection.push_inbound(Message::Have(13));

        dispatcher
            .register(connection.clone(), consumer, producer)
            .await;

        let departure = time::timeout(Duration::from_secs(5), departures.recv())
            .await
            .expect("expected a departure within the timeout")
            .expect("expected a departure to be reported");

        assert_eq!(expected_handle, departure.handle);
        assert_eq!(Some(Error::InvalidPiece(13)), departure.reason);
        assert_eq!(true, connection.is_closed(), "expected the connection to be closed");
        assert_eq!(0, dispatcher.total_peers().await);
    }

    #[tokio::test]
    async fn test_dispatcher_remove_reports_departure_without_reason() {
        init_logger!();
        let (dispatcher, mut departures) = MessageDispatcher::new(Duration::from_millis(100));
        let connection = Arc::new(FakePeerConnection::new());
        let handle = connection.handle();

        dispatcher
            .register(
                connection,
                Arc::new(RecordingConsumer::default()),
                Arc::new(QueueProducer::default()),
            )
            .await;
        dispatcher.remove(handle).await;

        let departure = time::timeout(Duration::from_secs(5), departures.recv())
            .await
            .expect("expected a departure within the timeout")
            .expect("expected a departure to be reported");

        assert_eq!(handle, departure.handle);
        assert_eq!(None, departure.reason);
    }
}
