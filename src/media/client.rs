use crate::config::Config;
use crate::media::clock::MonotonicClock;
use crate::media::window::{Delivery, DeliveryWindow, Insert, ReceivedFrame};
use crate::media::wire::{self, Datagram};
use crate::net::Endpoint;
use crate::pattern::{PatternBuffer, PatternMachine, ProtocolViolation, Verdict};
use crate::sinks::{jitter_row, Sinks};
use crate::stats::{ConnectionStats, StreamStats};
use crate::{PumpError, Result};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Announces this client to the server; the connection state machine's
/// "connect" step for a media stream.
pub async fn announce(socket: &UdpSocket, target: Endpoint, stats: &ConnectionStats) -> Result<()> {
    let sent = socket.send_to(&wire::encode_start(), target.addr()).await?;
    stats.record_sent(sent as u64);
    Ok(())
}

/// Runs the receive side of one media stream to completion.
///
/// Incoming frames buffer into the ordered-delivery window; a delivery
/// clock ticks once per frame period, classifying every position as
/// delivered, errored, or dropped, and emitting one jitter row per
/// verified frame. Resend requests follow the configured codec.
#[allow(clippy::too_many_arguments)]
pub async fn run_stream(
    socket: &UdpSocket,
    target: Endpoint,
    config: &Config,
    pattern: &PatternBuffer,
    conn_stats: &ConnectionStats,
    stream_stats: &StreamStats,
    sinks: &Sinks,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let media = config
        .media
        .as_ref()
        .expect("validated config carries media settings");
    let clock = MonotonicClock::global();
    let mut machine = PatternMachine::for_connection(config, 0);
    let mut window = DeliveryWindow::new(media.window_frames(), media.codec);
    let mut highest_seen: Option<u64> = None;
    let mut recv_buf = vec![0u8; media.frame_size() as usize + wire::HEADER_LEN];

    // Let half the window fill before the first delivery tick, the same
    // half the resend look-ahead spans.
    let prime = media.frame_period() * (media.window_frames() as u32 / 2).max(1);
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + prime,
        media.frame_period(),
    );

    loop {
        tokio::select! {
            received = socket.recv_from(&mut recv_buf) => {
                let (len, from) = received?;
                if from != target.addr() {
                    debug!(%from, "datagram from an unexpected peer");
                    continue;
                }
                conn_stats.record_recv(len as u64);
                match wire::decode(&recv_buf[..len]) {
                    Ok(Datagram::Frame { header, payload }) => {
                        let sequence = header.sequence;
                        highest_seen = Some(highest_seen.map_or(sequence, |h| h.max(sequence)));
                        let frame = ReceivedFrame {
                            header,
                            payload,
                            receiver_qpc: clock.ticks(),
                        };
                        match window.insert(frame) {
                            Insert::Buffered => {}
                            Insert::Late => stream_stats.frame_duplicated(),
                            Insert::Overflow => {
                                warn!(sequence, "frame beyond the delivery window");
                            }
                        }
                    }
                    Ok(other) => debug!(?other, "unexpected control datagram at the client"),
                    Err(e) => warn!(error = %e, "malformed datagram"),
                }
            }
            _ = ticker.tick() => {
                for (low, high) in window.resend_ranges(highest_seen) {
                    socket
                        .send_to(&wire::encode_resend_request(low, high), target.addr())
                        .await?;
                    stream_stats.retry_attempted();
                }

                let advanced = match window.tick() {
                    Delivery::Delivered(frame) => {
                        deliver(frame, config, pattern, clock, stream_stats, sinks);
                        true
                    }
                    Delivery::Missing => {
                        stream_stats.frame_dropped();
                        true
                    }
                    Delivery::Deferred { request } => {
                        if let Some(sequence) = request {
                            socket
                                .send_to(&wire::encode_resend_request(sequence, sequence), target.addr())
                                .await?;
                            stream_stats.retry_attempted();
                        }
                        false
                    }
                };
                if advanced {
                    if let Some(Verdict::Done) = machine.frame_advanced() {
                        break;
                    }
                }
            }
            _ = shutdown.recv() => {
                debug!("stream cancelled");
                return Err(PumpError::Network(std::io::ErrorKind::Interrupted.into()));
            }
        }
    }

    // Corrupt frames never abort a running stream, but they still make
    // the connection a protocol failure.
    let corrupt = stream_stats.error_frames();
    if corrupt > 0 {
        return Err(PumpError::Protocol(ProtocolViolation::CorruptFrames {
            count: corrupt,
        }));
    }
    Ok(())
}

fn deliver(
    frame: ReceivedFrame,
    config: &Config,
    pattern: &PatternBuffer,
    clock: &MonotonicClock,
    stream_stats: &StreamStats,
    sinks: &Sinks,
) {
    if config.verifies_data() {
        if let Err(violation) =
            PatternMachine::verify_frame(pattern, frame.header.sequence, &frame.payload)
        {
            // A corrupt frame does not abort the stream.
            warn!(sequence = frame.header.sequence, %violation, "frame failed verification");
            stream_stats.frame_errored();
            return;
        }
    }
    stream_stats.frame_succeeded();
    sinks.jitter.log_message(&jitter_row(
        frame.header.sequence,
        frame.header.sender_qpc,
        frame.header.sender_qpf,
        frame.receiver_qpc,
        clock.frequency(),
    ));
}
