use std::time::Duration;

pub(crate) const DEFAULT_MAX_PENDING_REQUESTS: usize = 4;
pub(crate) const DEFAULT_MAX_IO_QUEUE_SIZE: usize = 64;
pub(crate) const DEFAULT_UPLOADS_PER_CYCLE: usize = 3;
pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_DISPATCH_INTERVAL: Duration = Duration::from_millis(1);
pub(crate) const DEFAULT_BAN_DURATION: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// The exchange engine configuration values.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// The maximum number of outstanding block requests per peer
    pub max_pending_requests: usize,
    /// The maximum number of in-flight io operations of the data worker
    pub max_io_queue_size: usize,
    /// The maximum number of block uploads served to a peer within a single cycle
    pub uploads_per_cycle: usize,
    /// The duration after which an unanswered block request is considered stalled
    pub request_timeout: Duration,
    /// The interval at which the dispatcher drives the peer exchange cycles
    pub dispatch_interval: Duration,
    /// The duration for which a misbehaving peer address is banned
    pub ban_duration: Duration,
    /// The idle duration after which a keep alive message is sent to a peer
    pub keep_alive_interval: Duration,
    /// Allow duplicate piece assignments once no unassigned candidate is left
    pub endgame: bool,
}

impl EngineConfig {
    /// Create a new engine configuration builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::builder()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    max_pending_requests: Option<usize>,
    max_io_queue_size: Option<usize>,
    uploads_per_cycle: Option<usize>,
    request_timeout: Option<Duration>,
    dispatch_interval: Option<Duration>,
    ban_duration: Option<Duration>,
    keep_alive_interval: Option<Duration>,
    endgame: Option<bool>,
}

impl EngineConfigBuilder {
    /// Create a new engine configuration builder.
    pub fn builder() -> Self {
        Self::default()
    }

    /// Set the maximum number of outstanding block requests per peer.
    pub fn max_pending_requests(&mut self, limit: usize) -> &mut Self {
        self.max_pending_requests = Some(limit);
        self
    }

    /// Set the maximum number of in-flight io operations of the data worker.
    pub fn max_io_queue_size(&mut self, limit: usize) -> &mut Self {
        self.max_io_queue_size = Some(limit);
        self
    }

    /// Set the maximum number of block uploads served to a peer within a single cycle.
    pub fn uploads_per_cycle(&mut self, limit: usize) -> &mut Self {
        self.uploads_per_cycle = Some(limit);
        self
    }

    /// Set the duration after which an unanswered block request is considered stalled.
    pub fn request_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the interval at which the dispatcher drives the peer exchange cycles.
    pub fn dispatch_interval(&mut self, interval: Duration) -> &mut Self {
        self.dispatch_interval = Some(interval);
        self
    }

    /// Set the duration for which a misbehaving peer address is banned.
    pub fn ban_duration(&mut self, duration: Duration) -> &mut Self {
        self.ban_duration = Some(duration);
        self
    }

    /// Set the idle duration after which a keep alive message is sent to a peer.
    pub fn keep_alive_interval(&mut self, interval: Duration) -> &mut Self {
        self.keep_alive_interval = Some(interval);
        self
    }

    /// Allow duplicate piece assignments once no unassigned candidate is left.
    pub fn endgame(&mut self, endgame: bool) -> &mut Self {
        self.endgame = Some(endgame);
        self
    }

    /// Build the engine configuration.
    pub fn build(&mut self) -> EngineConfig {
        EngineConfig {
            max_pending_requests: self
                .max_pending_requests
                .take()
                .unwrap_or(DEFAULT_MAX_PENDING_REQUESTS),
            max_io_queue_size: self
                .max_io_queue_size
                .take()
                .unwrap_or(DEFAULT_MAX_IO_QUEUE_SIZE),
            uploads_per_cycle: self
                .uploads_per_cycle
                .take()
                .unwrap_or(DEFAULT_UPLOADS_PER_CYCLE),
            request_timeout: self.request_timeout.take().unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            dispatch_interval: self
                .dispatch_interval
                .take()
                .unwrap_or(DEFAULT_DISPATCH_INTERVAL),
            ban_duration: self.ban_duration.take().unwrap_or(DEFAULT_BAN_DURATION),
            keep_alive_interval: self
                .keep_alive_interval
                .take()
                .unwrap_or(DEFAULT_KEEP_ALIVE_INTERVAL),
            endgame: self.endgame.take().unwrap_or(false),
        }
    }
}
