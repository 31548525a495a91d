use crate::{PumpError, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// An append-only message sink
///
/// The core treats sinks as thread-safe and externally serialized; it
/// never formats beyond a single canonical line per message.
pub trait LogSink: Send + Sync {
    fn log_message(&self, text: &str);

    /// Whether this sink expects CSV rows rather than prose.
    fn is_csv(&self) -> bool {
        false
    }
}

/// Routes messages into the process-wide tracing subscriber.
pub struct TracingSink {
    name: &'static str,
}

impl TracingSink {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl LogSink for TracingSink {
    fn log_message(&self, text: &str) {
        info!(sink = self.name, "{}", text);
    }
}

/// Line-oriented CSV file sink; the header is written on creation.
pub struct CsvFileSink {
    writer: Mutex<BufWriter<File>>,
}

impl CsvFileSink {
    pub fn create(path: &Path, header: &str) -> Result<Self> {
        let file = File::create(path)
            .map_err(|e| PumpError::Config(format!("cannot create {}: {e}", path.display())))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{header}")
            .map_err(|e| PumpError::Config(format!("cannot write {}: {e}", path.display())))?;
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }
}

impl LogSink for CsvFileSink {
    fn log_message(&self, text: &str) {
        let mut writer = self.writer.lock().expect("csv sink lock poisoned");
        // A lost row is better than a crashed run; flush keeps rows
        // observable while the run is still in flight.
        let _ = writeln!(writer, "{text}");
        let _ = writer.flush();
    }

    fn is_csv(&self) -> bool {
        true
    }
}

/// Discards everything.
pub struct NullSink;

impl LogSink for NullSink {
    fn log_message(&self, _text: &str) {}
}

/// The four named sinks every run carries
#[derive(Clone)]
pub struct Sinks {
    pub connection: Arc<dyn LogSink>,
    pub error: Arc<dyn LogSink>,
    pub status: Arc<dyn LogSink>,
    pub jitter: Arc<dyn LogSink>,
}

impl Sinks {
    /// All four sinks routed to the tracing subscriber.
    pub fn tracing() -> Self {
        Self {
            connection: Arc::new(TracingSink::new("connection")),
            error: Arc::new(TracingSink::new("error")),
            status: Arc::new(TracingSink::new("status")),
            jitter: Arc::new(TracingSink::new("jitter")),
        }
    }

    /// Everything discarded; used by tests that only assert counters.
    pub fn null() -> Self {
        let null: Arc<dyn LogSink> = Arc::new(NullSink);
        Self {
            connection: null.clone(),
            error: null.clone(),
            status: null.clone(),
            jitter: null,
        }
    }

    pub const JITTER_HEADER: &'static str = "Sequence,SenderQpc,SenderQpf,ReceiverQpc,ReceiverQpf";
    pub const STATUS_HEADER: &'static str = "Completed,Failed,BytesSent,BytesRecv";
}

/// One jitter row per delivered frame.
pub fn jitter_row(
    sequence: u64,
    sender_qpc: u64,
    sender_qpf: u64,
    receiver_qpc: u64,
    receiver_qpf: u64,
) -> String {
    format!("{sequence},{sender_qpc},{sender_qpf},{receiver_qpc},{receiver_qpf}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_sink_writes_header_then_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jitter.csv");
        let sink = CsvFileSink::create(&path, Sinks::JITTER_HEADER).unwrap();
        assert!(sink.is_csv());

        sink.log_message(&jitter_row(0, 100, 1_000_000_000, 150, 1_000_000_000));
        sink.log_message(&jitter_row(1, 200, 1_000_000_000, 260, 1_000_000_000));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], Sinks::JITTER_HEADER);
        assert_eq!(lines[1], "0,100,1000000000,150,1000000000");
    }

    #[test]
    fn tracing_sinks_are_not_csv() {
        let sinks = Sinks::tracing();
        assert!(!sinks.jitter.is_csv());
        assert!(!sinks.status.is_csv());
    }
}
