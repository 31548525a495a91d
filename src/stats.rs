use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Per-connection byte accounting
///
/// Counters are lock-free; the I/O driver adds from completion context
/// and the broker's status task reads concurrently.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
    started_at: OnceLock<Instant>,
    completed_at: OnceLock<Instant>,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_recv(&self, bytes: u64) {
        self.bytes_recv.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_recv(&self) -> u64 {
        self.bytes_recv.load(Ordering::Relaxed)
    }

    /// Marks the start of I/O; later calls are ignored.
    pub fn mark_started(&self) {
        let _ = self.started_at.set(Instant::now());
    }

    /// Marks the end of I/O; later calls are ignored.
    pub fn mark_completed(&self) {
        let _ = self.completed_at.set(Instant::now());
    }

    /// Wall-clock time between start and completion, when both were marked.
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at.get(), self.completed_at.get()) {
            (Some(start), Some(end)) => Some(end.duration_since(*start)),
            _ => None,
        }
    }
}

/// Media-stream frame accounting
#[derive(Debug, Default)]
pub struct StreamStats {
    successful_frames: AtomicU64,
    dropped_frames: AtomicU64,
    duplicate_frames: AtomicU64,
    retry_attempts: AtomicU64,
    error_frames: AtomicU64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_succeeded(&self) {
        self.successful_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_duplicated(&self) {
        self.duplicate_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry_attempted(&self) {
        self.retry_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_errored(&self) {
        self.error_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn successful_frames(&self) -> u64 {
        self.successful_frames.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn duplicate_frames(&self) -> u64 {
        self.duplicate_frames.load(Ordering::Relaxed)
    }

    pub fn retry_attempts(&self) -> u64 {
        self.retry_attempts.load(Ordering::Relaxed)
    }

    pub fn error_frames(&self) -> u64 {
        self.error_frames.load(Ordering::Relaxed)
    }
}

/// Process-wide aggregation across all connections
///
/// The exit code is a logical OR over connection outcomes: zero only
/// when no connection failed.
#[derive(Debug, Default)]
pub struct RunStats {
    connections_completed: AtomicU64,
    connections_failed_network: AtomicU64,
    connections_failed_protocol: AtomicU64,
    total_bytes_sent: AtomicU64,
    total_bytes_recv: AtomicU64,
    successful_frames: AtomicU64,
    dropped_frames: AtomicU64,
    duplicate_frames: AtomicU64,
    retry_attempts: AtomicU64,
    error_frames: AtomicU64,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, stats: &ConnectionStats) {
        self.connections_completed.fetch_add(1, Ordering::Relaxed);
        self.absorb_bytes(stats);
    }

    pub fn record_network_failure(&self, stats: &ConnectionStats) {
        self.connections_failed_network.fetch_add(1, Ordering::Relaxed);
        self.absorb_bytes(stats);
    }

    pub fn record_protocol_failure(&self, stats: &ConnectionStats) {
        self.connections_failed_protocol.fetch_add(1, Ordering::Relaxed);
        self.absorb_bytes(stats);
    }

    fn absorb_bytes(&self, stats: &ConnectionStats) {
        self.total_bytes_sent
            .fetch_add(stats.bytes_sent(), Ordering::Relaxed);
        self.total_bytes_recv
            .fetch_add(stats.bytes_recv(), Ordering::Relaxed);
    }

    /// Folds one finished stream's frame counters into the run totals.
    pub fn absorb_frames(&self, stream: &StreamStats) {
        self.successful_frames
            .fetch_add(stream.successful_frames(), Ordering::Relaxed);
        self.dropped_frames
            .fetch_add(stream.dropped_frames(), Ordering::Relaxed);
        self.duplicate_frames
            .fetch_add(stream.duplicate_frames(), Ordering::Relaxed);
        self.retry_attempts
            .fetch_add(stream.retry_attempts(), Ordering::Relaxed);
        self.error_frames
            .fetch_add(stream.error_frames(), Ordering::Relaxed);
    }

    pub fn successful_frames(&self) -> u64 {
        self.successful_frames.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn duplicate_frames(&self) -> u64 {
        self.duplicate_frames.load(Ordering::Relaxed)
    }

    pub fn retry_attempts(&self) -> u64 {
        self.retry_attempts.load(Ordering::Relaxed)
    }

    pub fn error_frames(&self) -> u64 {
        self.error_frames.load(Ordering::Relaxed)
    }

    pub fn connections_completed(&self) -> u64 {
        self.connections_completed.load(Ordering::Relaxed)
    }

    pub fn connections_failed(&self) -> u64 {
        self.connections_failed_network.load(Ordering::Relaxed)
            + self.connections_failed_protocol.load(Ordering::Relaxed)
    }

    pub fn protocol_failures(&self) -> u64 {
        self.connections_failed_protocol.load(Ordering::Relaxed)
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent.load(Ordering::Relaxed)
    }

    pub fn total_bytes_recv(&self) -> u64 {
        self.total_bytes_recv.load(Ordering::Relaxed)
    }

    /// Process exit code: 0 on a clean run, 1 if any connection failed.
    pub fn exit_code(&self) -> i32 {
        if self.connections_failed() == 0 {
            0
        } else {
            1
        }
    }

    /// One status row: completed, failed, bytes out, bytes in.
    pub fn status_row(&self) -> String {
        format!(
            "{},{},{},{}",
            self.connections_completed(),
            self.connections_failed(),
            self.total_bytes_sent(),
            self.total_bytes_recv()
        )
    }
}
