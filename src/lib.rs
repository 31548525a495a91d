use crate::media::wire::WireError;
use crate::pattern::machine::ProtocolViolation;
use thiserror::Error;

/// Error types for the netpump library
#[derive(Error, Debug)]
pub enum PumpError {
    /// Platform errors on connect/accept/send/recv
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Received bytes diverged from the expected pattern, byte
    /// accounting violated the configured transfer contract, or a
    /// media-stream datagram could not be decoded
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// Configuration errors, surfaced at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Timeout errors
    #[error("timeout: {0}")]
    Timeout(String),
}

impl PumpError {
    /// True when this error counts against the protocol-failure column
    /// rather than the network-failure column.
    pub fn is_protocol(&self) -> bool {
        matches!(self, PumpError::Protocol(_))
    }

    /// Short classification used in connection result records.
    pub fn class(&self) -> &'static str {
        match self {
            PumpError::Network(e) => match e.kind() {
                std::io::ErrorKind::ConnectionAborted => "aborted",
                std::io::ErrorKind::ConnectionReset => "reset",
                std::io::ErrorKind::ConnectionRefused => "refused",
                std::io::ErrorKind::OutOfMemory => "out-of-memory",
                _ => "network",
            },
            PumpError::Protocol(_) => "protocol",
            PumpError::Config(_) => "config",
            PumpError::Timeout(_) => "timeout",
        }
    }
}

impl From<WireError> for PumpError {
    fn from(err: WireError) -> Self {
        PumpError::Protocol(ProtocolViolation::MalformedDatagram(err))
    }
}

/// Result type for the netpump library
pub type Result<T> = std::result::Result<T, PumpError>;

pub mod broker;
pub mod config;
pub mod connection;
pub mod media;
pub mod net;
pub mod pattern;
pub mod rate;
pub mod sinks;
pub mod stats;

// Re-export main types for convenience
pub use broker::{Broker, WaitOutcome};
pub use config::{Codec, Config, MediaConfig, PatternKind, Protocol, Role, ValueRange, VerifyMode};
pub use net::{Endpoint, SocketFactory};
pub use pattern::{PatternBuffer, PatternMachine};
pub use rate::RateLimiter;
pub use sinks::{LogSink, Sinks};
pub use stats::{ConnectionStats, RunStats, StreamStats};

/// Aborts the process on a broken internal invariant.
///
/// Counter underflows in the broker, pattern transitions out of a
/// terminal state, and completions on closed connections are never
/// recoverable; continuing would corrupt accounting silently.
#[macro_export]
macro_rules! fatal_invariant {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        std::process::abort()
    }};
}
