use crate::config::{Config, PatternKind};
use crate::pattern::{Direction, IoTask, PatternBuffer, PatternMachine, ProtocolViolation, Verdict};
use crate::rate::{Gate, RateLimiter};
use crate::stats::ConnectionStats;
use crate::{PumpError, Result};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::debug;

/// How long the close path waits for the peer's EOF before giving up on
/// the excess-byte check.
const CLOSE_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Drives one TCP connection's pattern to a terminal verdict.
///
/// The pattern decides every task; this loop only moves bytes, feeds
/// completions back, and enforces verification. Duplex runs its two
/// directions concurrently over split halves; everything else is
/// strictly sequential.
pub(crate) async fn drive_tcp(
    stream: TcpStream,
    machine: PatternMachine,
    config: &Config,
    pattern: &Arc<PatternBuffer>,
    stats: &Arc<ConnectionStats>,
    limiter: RateLimiter,
    shutdown: &broadcast::Sender<()>,
) -> Result<()> {
    let excess = excess_violation(&machine);
    let (rd, wr) = stream.into_split();
    let (verdict, rd, wr) = if config.pattern == PatternKind::Duplex {
        drive_duplex(rd, wr, machine, config, pattern, stats, limiter, shutdown).await
    } else {
        drive_sequential(rd, wr, machine, config, pattern, stats, limiter, shutdown).await
    };
    finish(verdict, rd, wr, excess).await
}

/// The violation reported if bytes arrive after the contract is met: a
/// send-only pattern must see silence; a receiving one must not
/// overshoot its total.
fn excess_violation(machine: &PatternMachine) -> ProtocolViolation {
    let (_, receives) = machine.directions();
    if receives {
        ProtocolViolation::TooManyBytes {
            expected: machine.contracted(Direction::Recv),
        }
    } else {
        ProtocolViolation::WrongDirection
    }
}

fn draw_len(config: &Config) -> usize {
    config.buffer_size.draw() as usize
}

#[allow(clippy::too_many_arguments)]
async fn drive_sequential(
    mut rd: OwnedReadHalf,
    mut wr: OwnedWriteHalf,
    mut machine: PatternMachine,
    config: &Config,
    pattern: &Arc<PatternBuffer>,
    stats: &Arc<ConnectionStats>,
    mut limiter: RateLimiter,
    shutdown: &broadcast::Sender<()>,
) -> (Verdict, OwnedReadHalf, OwnedWriteHalf) {
    let mut shutdown_rx = shutdown.subscribe();
    let mut recv_buf = vec![0u8; config.max_buffer_size()];

    let verdict = loop {
        let direction = machine.active_direction();
        let task = match machine.next_task(direction, draw_len(config)) {
            Verdict::Continue(task) => task,
            terminal => break terminal,
        };

        let moved = match task.direction {
            Direction::Send => {
                send_task(&mut wr, &task, config, pattern, &mut limiter, &mut shutdown_rx).await
            }
            Direction::Recv => {
                let want = task.len.min(recv_buf.len());
                recv_task(&mut rd, &mut recv_buf[..want], &mut shutdown_rx).await
            }
        };

        match moved {
            Ok(n) => {
                if task.direction == Direction::Recv && n > 0 && config.verifies_data() {
                    if let Err(local) = pattern.verify(&recv_buf[..n], task.offset) {
                        break machine.fail_protocol(ProtocolViolation::PatternMismatch {
                            stream_offset: task.offset + local as u64,
                        });
                    }
                }
                if n > 0 {
                    match task.direction {
                        Direction::Send => stats.record_sent(n as u64),
                        Direction::Recv => stats.record_recv(n as u64),
                    }
                }
                if let Some(terminal) = machine.complete(task.direction, n) {
                    break terminal;
                }
            }
            Err(kind) => break machine.fail_network(kind),
        }
    };

    (verdict, rd, wr)
}

/// Sends one task's window, honoring the rate limiter. Returns the bytes
/// moved or the error kind.
async fn send_task(
    wr: &mut OwnedWriteHalf,
    task: &IoTask,
    config: &Config,
    pattern: &Arc<PatternBuffer>,
    limiter: &mut RateLimiter,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> std::result::Result<usize, std::io::ErrorKind> {
    // A shared send buffer always reads from the pattern's start.
    let offset = if config.use_shared_buffer { 0 } else { task.offset };
    let window = pattern.send_window(offset, task.len);

    loop {
        match limiter.schedule(window.len() as u64, Instant::now()) {
            Gate::Now => break,
            Gate::At(at) => tokio::select! {
                _ = tokio::time::sleep_until(at.into()) => {}
                _ = shutdown_rx.recv() => return Err(std::io::ErrorKind::Interrupted),
            },
        }
    }

    tokio::select! {
        written = wr.write_all(window) => match written {
            Ok(()) => Ok(window.len()),
            Err(e) => Err(e.kind()),
        },
        _ = shutdown_rx.recv() => Err(std::io::ErrorKind::Interrupted),
    }
}

async fn recv_task(
    rd: &mut OwnedReadHalf,
    buf: &mut [u8],
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> std::result::Result<usize, std::io::ErrorKind> {
    tokio::select! {
        read = rd.read(buf) => read.map_err(|e| e.kind()),
        _ = shutdown_rx.recv() => Err(std::io::ErrorKind::Interrupted),
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive_duplex(
    mut rd: OwnedReadHalf,
    mut wr: OwnedWriteHalf,
    machine: PatternMachine,
    config: &Config,
    pattern: &Arc<PatternBuffer>,
    stats: &Arc<ConnectionStats>,
    mut limiter: RateLimiter,
    shutdown: &broadcast::Sender<()>,
) -> (Verdict, OwnedReadHalf, OwnedWriteHalf) {
    // The per-connection lock: held across pattern mutation only, never
    // across I/O.
    let machine = Arc::new(Mutex::new(machine));

    let send_machine = machine.clone();
    let mut send_shutdown = shutdown.subscribe();
    let send_half = async {
        let mut observed = None;
        loop {
            let task = {
                let mut m = send_machine.lock().expect("pattern lock poisoned");
                if m.is_terminal() || m.direction_done(Direction::Send) {
                    break;
                }
                match m.next_task(Direction::Send, draw_len(config)) {
                    Verdict::Continue(task) => task,
                    terminal => {
                        observed = Some(terminal);
                        break;
                    }
                }
            };

            let moved =
                send_task(&mut wr, &task, config, pattern, &mut limiter, &mut send_shutdown).await;

            let mut m = send_machine.lock().expect("pattern lock poisoned");
            if m.is_terminal() {
                // The other direction already closed the pattern; this
                // completion has nowhere to go.
                break;
            }
            match moved {
                Ok(n) => {
                    stats.record_sent(n as u64);
                    if let Some(terminal) = m.complete(Direction::Send, n) {
                        observed = Some(terminal);
                        break;
                    }
                }
                Err(kind) => {
                    observed = Some(m.fail_network(kind));
                    break;
                }
            }
        }
        (observed, wr)
    };

    let recv_machine = machine.clone();
    let mut recv_shutdown = shutdown.subscribe();
    let recv_half = async {
        let mut recv_buf = vec![0u8; config.max_buffer_size()];
        let mut observed = None;
        loop {
            let task = {
                let mut m = recv_machine.lock().expect("pattern lock poisoned");
                if m.is_terminal() || m.direction_done(Direction::Recv) {
                    break;
                }
                match m.next_task(Direction::Recv, draw_len(config)) {
                    Verdict::Continue(task) => task,
                    terminal => {
                        observed = Some(terminal);
                        break;
                    }
                }
            };

            let moved = recv_task(&mut rd, &mut recv_buf[..task.len], &mut recv_shutdown).await;

            let verified = match &moved {
                Ok(n) if *n > 0 && config.verifies_data() => {
                    pattern.verify(&recv_buf[..*n], task.offset)
                }
                _ => Ok(()),
            };

            let mut m = recv_machine.lock().expect("pattern lock poisoned");
            if m.is_terminal() {
                break;
            }
            match moved {
                Ok(n) => {
                    if let Err(local) = verified {
                        observed = Some(m.fail_protocol(ProtocolViolation::PatternMismatch {
                            stream_offset: task.offset + local as u64,
                        }));
                        break;
                    }
                    if n > 0 {
                        stats.record_recv(n as u64);
                    }
                    if let Some(terminal) = m.complete(Direction::Recv, n) {
                        observed = Some(terminal);
                        break;
                    }
                }
                Err(kind) => {
                    observed = Some(m.fail_network(kind));
                    break;
                }
            }
        }
        (observed, rd)
    };

    let ((send_observed, wr), (recv_observed, rd)) = tokio::join!(send_half, recv_half);

    let verdict = send_observed.or(recv_observed).unwrap_or_else(|| {
        let mut m = machine.lock().expect("pattern lock poisoned");
        if m.is_terminal() {
            debug!("both duplex halves deferred to an observed terminal");
            Verdict::Done
        } else {
            // Nothing to move in either direction.
            m.finish_idle()
        }
    });

    (verdict, rd, wr)
}

/// Maps the terminal verdict to the connection result, closing the
/// stream gracefully and checking for bytes past the contract.
async fn finish(
    verdict: Verdict,
    mut rd: OwnedReadHalf,
    mut wr: OwnedWriteHalf,
    excess: ProtocolViolation,
) -> Result<()> {
    match verdict {
        Verdict::Done => {
            let _ = wr.shutdown().await;
            let mut tail = [0u8; 4096];
            match timeout(CLOSE_DRAIN_TIMEOUT, rd.read(&mut tail)).await {
                // EOF, a peer that lingers, or a teardown race all close clean.
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => Ok(()),
                Ok(Ok(_)) => Err(PumpError::Protocol(excess)),
            }
        }
        Verdict::ErrorNetwork(kind) => Err(PumpError::Network(kind.into())),
        Verdict::ErrorProtocol(violation) => Err(PumpError::Protocol(violation)),
        Verdict::Continue(_) => unreachable!("terminal verdict expected"),
    }
}
