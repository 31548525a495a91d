use crate::net::Endpoint;
use crate::{PumpError, Result};
use rand::Rng;
use std::time::Duration;
use tracing::warn;

/// Transport protocol selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// I/O pattern selector
///
/// The TCP patterns decide which peer pushes bytes and which pulls them;
/// `MediaStream` is the UDP frame-paced sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    Push,
    Pull,
    PushPull,
    Duplex,
    MediaStream,
}

/// Which side of the run this process plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Byte verification mode
///
/// `Data` compares every received byte against the shared pattern;
/// `Connection` only verifies that connections complete their transfer
/// contract, sending from one shared buffer and discarding receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    Data,
    Connection,
}

/// Media-stream loss handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Missing frames are counted as dropped
    NoResends,
    /// A missing frame is requested again exactly once before dropping
    ResendOnce,
}

/// A configuration value that is either fixed or drawn uniformly from an
/// inclusive `[low, high]` range, once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueRange {
    low: u64,
    high: u64,
}

impl ValueRange {
    pub fn fixed(value: u64) -> Self {
        Self {
            low: value,
            high: value,
        }
    }

    /// An inclusive range; `low` maps to the low bound and `high` to the
    /// high bound.
    pub fn spread(low: u64, high: u64) -> Result<Self> {
        if low > high {
            return Err(PumpError::Config(format!(
                "range low bound {low} exceeds high bound {high}"
            )));
        }
        Ok(Self { low, high })
    }

    pub fn is_fixed(&self) -> bool {
        self.low == self.high
    }

    pub fn low(&self) -> u64 {
        self.low
    }

    pub fn high(&self) -> u64 {
        self.high
    }

    /// Draws a value: the fixed value, or a uniform sample from the range.
    pub fn draw(&self) -> u64 {
        if self.is_fixed() {
            self.low
        } else {
            rand::thread_rng().gen_range(self.low..=self.high)
        }
    }
}

/// UDP media-stream sub-configuration
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Stream bandwidth; truncated down to a byte boundary
    pub bits_per_second: u64,
    /// Frames sent per second
    pub frames_per_second: u64,
    /// Client-side delivery buffer depth in seconds
    pub buffer_depth_seconds: u64,
    /// Total stream duration in seconds
    pub stream_length_seconds: u64,
    /// Loss handling
    pub codec: Codec,
}

impl MediaConfig {
    /// Datagram size for one frame, header included.
    pub fn frame_size(&self) -> u64 {
        self.bits_per_second / (8 * self.frames_per_second)
    }

    /// Pattern bytes carried per frame.
    pub fn payload_len(&self) -> usize {
        (self.frame_size() as usize).saturating_sub(crate::media::wire::HEADER_LEN)
    }

    /// Total frames scheduled over the stream lifetime.
    pub fn total_frames(&self) -> u64 {
        self.stream_length_seconds * self.frames_per_second
    }

    /// Delivery window capacity in frames.
    pub fn window_frames(&self) -> usize {
        (self.buffer_depth_seconds * self.frames_per_second) as usize
    }

    /// Interval between frames.
    pub fn frame_period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.frames_per_second)
    }
}

/// Socket option flags applied by the socket factory
///
/// `non_blocking_io` and `handle_inline_iocp` are accepted for
/// configuration compatibility and echoed in logs; completion-port
/// tuning has no equivalent on this platform.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionFlags {
    pub keepalive: bool,
    pub loopback_fast_path: bool,
    pub max_recv_buf: bool,
    pub non_blocking_io: bool,
    pub handle_inline_iocp: bool,
}

/// Immutable run configuration, shared by reference across every
/// component. All validation happens in [`Config::validate`] before the
/// broker is instantiated; nothing mutates the configuration afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub protocol: Protocol,
    pub pattern: PatternKind,
    /// Well-known port used when addresses carry port 0
    pub port: u16,
    /// Addresses a server listens on
    pub listen_addresses: Vec<Endpoint>,
    /// Addresses a client connects to, used round-robin
    pub target_addresses: Vec<Endpoint>,
    /// Local addresses a client binds to, used round-robin
    pub bind_addresses: Vec<std::net::IpAddr>,
    /// Client local port range; (0, 0) means ephemeral
    pub local_port_range: (u16, u16),
    /// Per-IO buffer size in bytes
    pub buffer_size: ValueRange,
    /// Per-connection transfer size in bytes
    pub transfer_size: ValueRange,
    /// Per-connection send rate in bytes/sec; 0 disables pacing
    pub rate_limit: ValueRange,
    /// Rate limiter granularity
    pub rate_limit_period_ms: u64,
    /// Maximum concurrently established connections (client)
    pub connection_limit: u32,
    /// Maximum concurrent connection attempts (client)
    pub throttle_limit: u32,
    /// Connection batches to run; `u64::MAX` means unbounded
    pub iterations: u64,
    /// Server connections to serve before exiting; `u64::MAX` means run forever
    pub server_exit_limit: u64,
    /// Receive tasks kept in flight per receiving direction
    pub pre_post_recvs: u32,
    pub verify: VerifyMode,
    /// Send every payload from one shared read-only buffer
    pub use_shared_buffer: bool,
    /// PushPull phase sizes
    pub push_bytes: u64,
    pub pull_bytes: u64,
    /// Optional wall-clock cap on the whole run
    pub time_limit: Option<Duration>,
    /// Period between status sink updates
    pub status_period: Duration,
    pub media: Option<MediaConfig>,
    pub options: OptionFlags,
}

pub const DEFAULT_PORT: u16 = 4444;
pub const DEFAULT_BUFFER_SIZE: u64 = 0x10000;
pub const DEFAULT_TRANSFER_SIZE: u64 = 0x4000_0000;
pub const DEFAULT_CONNECTION_LIMIT: u32 = 8;
pub const DEFAULT_THROTTLE_LIMIT: u32 = 1000;
pub const DEFAULT_PUSHPULL_BYTES: u64 = 0x100000;
pub const DEFAULT_RATE_PERIOD_MS: u64 = 100;

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::Client,
            protocol: Protocol::Tcp,
            pattern: PatternKind::Push,
            port: DEFAULT_PORT,
            listen_addresses: Vec::new(),
            target_addresses: Vec::new(),
            bind_addresses: Vec::new(),
            local_port_range: (0, 0),
            buffer_size: ValueRange::fixed(DEFAULT_BUFFER_SIZE),
            transfer_size: ValueRange::fixed(DEFAULT_TRANSFER_SIZE),
            rate_limit: ValueRange::fixed(0),
            rate_limit_period_ms: DEFAULT_RATE_PERIOD_MS,
            connection_limit: DEFAULT_CONNECTION_LIMIT,
            throttle_limit: DEFAULT_THROTTLE_LIMIT,
            iterations: 1,
            server_exit_limit: u64::MAX,
            pre_post_recvs: 1,
            verify: VerifyMode::Data,
            use_shared_buffer: false,
            push_bytes: DEFAULT_PUSHPULL_BYTES,
            pull_bytes: DEFAULT_PUSHPULL_BYTES,
            time_limit: None,
            status_period: Duration::from_secs(5),
            media: None,
            options: OptionFlags::default(),
        }
    }
}

impl Config {
    /// Validates the assembled configuration.
    ///
    /// Must be called before the broker is constructed; the broker only
    /// accepts a validated configuration, so limits cannot change after
    /// they have been consumed.
    pub fn validate(&mut self) -> Result<()> {
        match self.role {
            Role::Client if self.target_addresses.is_empty() => {
                return Err(PumpError::Config("client requires target addresses".into()));
            }
            Role::Server if self.listen_addresses.is_empty() => {
                return Err(PumpError::Config("server requires listen addresses".into()));
            }
            _ => {}
        }

        match (self.protocol, self.pattern) {
            (Protocol::Udp, p) if p != PatternKind::MediaStream => {
                return Err(PumpError::Config(
                    "UDP supports only the media-stream pattern".into(),
                ));
            }
            (Protocol::Tcp, PatternKind::MediaStream) => {
                return Err(PumpError::Config(
                    "the media-stream pattern requires UDP".into(),
                ));
            }
            _ => {}
        }

        if self.connection_limit == 0 {
            return Err(PumpError::Config("connection limit must be nonzero".into()));
        }
        if self.pre_post_recvs == 0 {
            return Err(PumpError::Config("pre-post-recv depth must be nonzero".into()));
        }
        // With more than one receive outstanding, a mismatch could not be
        // attributed to a stream offset.
        if self.protocol == Protocol::Tcp
            && self.verify == VerifyMode::Data
            && self.pre_post_recvs > 1
        {
            return Err(PumpError::Config(
                "data verification cannot be combined with pre-post-recvs > 1".into(),
            ));
        }
        if self.verify == VerifyMode::Connection {
            self.use_shared_buffer = true;
        }

        if self.buffer_size.low() == 0 {
            return Err(PumpError::Config("buffer size must be nonzero".into()));
        }

        if self.rate_limit.high() > 0 && self.protocol != Protocol::Tcp {
            return Err(PumpError::Config("rate limiting applies only to TCP".into()));
        }
        if self.rate_limit_period_ms == 0 {
            return Err(PumpError::Config("rate limit period must be nonzero".into()));
        }

        if self.pattern == PatternKind::PushPull && (self.push_bytes == 0 || self.pull_bytes == 0) {
            return Err(PumpError::Config(
                "push/pull phase sizes must be nonzero".into(),
            ));
        }

        if self.protocol == Protocol::Udp {
            let media = self
                .media
                .as_mut()
                .ok_or_else(|| PumpError::Config("UDP requires a media-stream config".into()))?;
            // Bandwidth must align on a byte boundary.
            media.bits_per_second -= media.bits_per_second % 8;
            if media.bits_per_second == 0 {
                return Err(PumpError::Config("bits-per-second is required".into()));
            }
            if media.frames_per_second == 0 {
                return Err(PumpError::Config("frame rate is required".into()));
            }
            if media.stream_length_seconds == 0 {
                return Err(PumpError::Config("stream length is required".into()));
            }
            match self.role {
                Role::Client if media.buffer_depth_seconds == 0 => {
                    return Err(PumpError::Config(
                        "buffer depth is required on the client".into(),
                    ));
                }
                Role::Server if media.buffer_depth_seconds != 0 => {
                    // Depth only shapes the client's delivery window.
                    warn!(
                        depth = media.buffer_depth_seconds,
                        "buffer depth is ignored on the server"
                    );
                }
                _ => {}
            }
            if media.payload_len() == 0 {
                return Err(PumpError::Config(format!(
                    "frame size {} does not exceed the datagram header",
                    media.frame_size()
                )));
            }
        } else if self.media.is_some() {
            return Err(PumpError::Config(
                "media-stream settings require UDP".into(),
            ));
        }

        if self.local_port_range.0 > self.local_port_range.1 {
            return Err(PumpError::Config(format!(
                "local port range {}..{} is inverted",
                self.local_port_range.0, self.local_port_range.1
            )));
        }

        Ok(())
    }

    /// Largest buffer any connection may draw.
    pub fn max_buffer_size(&self) -> usize {
        self.buffer_size.high() as usize
    }

    /// Whether received bytes are compared against the pattern.
    pub fn verifies_data(&self) -> bool {
        self.verify == VerifyMode::Data
    }
}
