use crate::config::{Config, PatternKind, Role};
use crate::fatal_invariant;
use crate::pattern::PatternBuffer;
use thiserror::Error;

/// Direction of one I/O task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

impl Direction {
    fn flipped(self) -> Self {
        match self {
            Direction::Send => Direction::Recv,
            Direction::Recv => Direction::Send,
        }
    }
}

/// One unit of work produced by the pattern
///
/// `offset` is the stream offset within this connection and direction;
/// the pattern buffer window for the task starts there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoTask {
    pub direction: Direction,
    pub offset: u64,
    pub len: usize,
}

/// Byte-level contract violations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("received byte at stream offset {stream_offset} does not match the pattern")]
    PatternMismatch { stream_offset: u64 },

    #[error("peer moved more than the contracted {expected} bytes")]
    TooManyBytes { expected: u64 },

    #[error("bytes arrived against a one-way pattern direction")]
    WrongDirection,

    #[error("phase ended off its byte boundary at offset {offset}")]
    PhaseOvershoot { offset: u64 },

    #[error("datagram could not be decoded: {0}")]
    MalformedDatagram(crate::media::wire::WireError),

    #[error("{count} delivered frames failed verification")]
    CorruptFrames { count: u64 },
}

/// Outcome of asking the pattern what to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue(IoTask),
    Done,
    ErrorNetwork(std::io::ErrorKind),
    ErrorProtocol(ProtocolViolation),
}

/// Per-direction byte accounting: monotonically increasing stream
/// offsets, one task in flight, completions acknowledged in order.
#[derive(Debug, Clone, Copy)]
struct Flow {
    acked: u64,
    total: u64,
}

impl Flow {
    fn new(total: u64) -> Self {
        Self { acked: 0, total }
    }

    fn remaining(&self) -> u64 {
        self.total - self.acked
    }

    fn done(&self) -> bool {
        self.acked == self.total
    }
}

#[derive(Debug)]
enum MachineKind {
    /// Push and Pull: all bytes move one way
    OneWay { direction: Direction, flow: Flow },
    /// PushPull: strictly alternating send/recv phases
    Alternating {
        current: Direction,
        phase_remaining: u64,
        send_chunk: u64,
        recv_chunk: u64,
        moved: u64,
        total: u64,
    },
    /// Duplex: independent directions, each moving half the transfer
    Both { send: Flow, recv: Flow },
    /// UDP media stream: frame-indexed delivery accounting
    MediaStream {
        delivered: u64,
        total_frames: u64,
        payload_len: usize,
    },
}

enum Step {
    Task(IoTask),
    Terminal(Verdict),
    InFlight,
}

/// The per-connection I/O pattern generator
///
/// Repeatedly invoked, it yields the next task or a terminal verdict.
/// The terminal transition happens exactly once; asking a terminal
/// machine for more work is an invariant violation and aborts.
#[derive(Debug)]
pub struct PatternMachine {
    kind: MachineKind,
    terminal: Option<Verdict>,
}

impl PatternMachine {
    /// Builds the machine for one connection from the validated config
    /// and the transfer size drawn for this connection.
    pub fn for_connection(config: &Config, transfer: u64) -> Self {
        let kind = match (config.pattern, config.role) {
            // The client pushes; the server drains.
            (PatternKind::Push, Role::Client) | (PatternKind::Pull, Role::Server) => {
                MachineKind::OneWay {
                    direction: Direction::Send,
                    flow: Flow::new(transfer),
                }
            }
            (PatternKind::Push, Role::Server) | (PatternKind::Pull, Role::Client) => {
                MachineKind::OneWay {
                    direction: Direction::Recv,
                    flow: Flow::new(transfer),
                }
            }
            (PatternKind::PushPull, role) => {
                // The push phase always runs first; the client is the
                // pushing side.
                let current = match role {
                    Role::Client => Direction::Send,
                    Role::Server => Direction::Recv,
                };
                let (send_chunk, recv_chunk) = match role {
                    Role::Client => (config.push_bytes, config.pull_bytes),
                    Role::Server => (config.pull_bytes, config.push_bytes),
                };
                MachineKind::Alternating {
                    current,
                    phase_remaining: config.push_bytes.min(transfer),
                    send_chunk,
                    recv_chunk,
                    moved: 0,
                    total: transfer,
                }
            }
            (PatternKind::Duplex, _) => {
                // Floor on both directions so the two peers of a
                // symmetric pair always agree on odd transfers.
                let half = transfer / 2;
                MachineKind::Both {
                    send: Flow::new(half),
                    recv: Flow::new(half),
                }
            }
            (PatternKind::MediaStream, _) => {
                let media = config
                    .media
                    .as_ref()
                    .expect("validated config carries media settings for MediaStream");
                MachineKind::MediaStream {
                    delivered: 0,
                    total_frames: media.total_frames(),
                    payload_len: media.payload_len(),
                }
            }
        };
        Self {
            kind,
            terminal: None,
        }
    }

    /// Whether this machine issues send tasks / recv tasks.
    pub fn directions(&self) -> (bool, bool) {
        match &self.kind {
            MachineKind::OneWay { direction, .. } => {
                (*direction == Direction::Send, *direction == Direction::Recv)
            }
            MachineKind::Alternating { .. } | MachineKind::Both { .. } => (true, true),
            MachineKind::MediaStream { .. } => (false, true),
        }
    }

    /// The direction a sequential driver should work next.
    pub fn active_direction(&self) -> Direction {
        match &self.kind {
            MachineKind::OneWay { direction, .. } => *direction,
            MachineKind::Alternating { current, .. } => *current,
            MachineKind::Both { .. } => Direction::Send,
            MachineKind::MediaStream { .. } => Direction::Recv,
        }
    }

    /// True once a direction has acknowledged all its bytes.
    pub fn direction_done(&self, direction: Direction) -> bool {
        match &self.kind {
            MachineKind::OneWay {
                direction: own,
                flow,
            } => *own != direction || flow.done(),
            MachineKind::Alternating { moved, total, .. } => moved == total,
            MachineKind::Both { send, recv } => match direction {
                Direction::Send => send.done(),
                Direction::Recv => recv.done(),
            },
            MachineKind::MediaStream {
                delivered,
                total_frames,
                ..
            } => direction == Direction::Send || delivered == total_frames,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    /// Yields the next task for `direction`, sized
    /// `min(remaining_in_phase, buffer_len)`.
    pub fn next_task(&mut self, direction: Direction, buffer_len: usize) -> Verdict {
        if self.terminal.is_some() {
            fatal_invariant!("task requested from a terminal pattern");
        }
        debug_assert!(buffer_len > 0);

        let step = match &self.kind {
            MachineKind::OneWay {
                direction: own,
                flow,
            } => {
                if *own != direction {
                    fatal_invariant!("one-way pattern asked for a task in the opposite direction");
                }
                if flow.done() {
                    Step::Terminal(Verdict::Done)
                } else {
                    Step::Task(IoTask {
                        direction,
                        offset: flow.acked,
                        len: flow.remaining().min(buffer_len as u64) as usize,
                    })
                }
            }
            MachineKind::Alternating {
                current,
                phase_remaining,
                moved,
                total,
                ..
            } => {
                if moved == total {
                    Step::Terminal(Verdict::Done)
                } else if *current != direction {
                    fatal_invariant!("push-pull pattern asked for a task outside the current phase");
                } else {
                    Step::Task(IoTask {
                        direction,
                        offset: *moved,
                        len: (*phase_remaining).min(buffer_len as u64) as usize,
                    })
                }
            }
            MachineKind::Both { send, recv } => {
                let flow = match direction {
                    Direction::Send => send,
                    Direction::Recv => recv,
                };
                if flow.done() {
                    // The driver stops asking for a finished direction.
                    fatal_invariant!("duplex pattern asked for a task on a finished direction");
                }
                Step::Task(IoTask {
                    direction,
                    offset: flow.acked,
                    len: flow.remaining().min(buffer_len as u64) as usize,
                })
            }
            MachineKind::MediaStream {
                delivered,
                total_frames,
                payload_len,
            } => {
                if delivered == total_frames {
                    Step::Terminal(Verdict::Done)
                } else {
                    Step::Task(IoTask {
                        direction: Direction::Recv,
                        offset: *delivered * *payload_len as u64,
                        len: *payload_len,
                    })
                }
            }
        };

        match step {
            Step::Task(task) => Verdict::Continue(task),
            Step::Terminal(verdict) => self.enter_terminal(verdict),
            Step::InFlight => unreachable!("next_task never stays in flight"),
        }
    }

    /// Acknowledges a completion of `bytes` on `direction`.
    ///
    /// Returns `None` while the pattern is still in flight, or the
    /// terminal verdict. A zero-byte completion before accounting is
    /// satisfied means the peer closed early.
    pub fn complete(&mut self, direction: Direction, bytes: usize) -> Option<Verdict> {
        if self.terminal.is_some() {
            fatal_invariant!("completion delivered to a terminal pattern");
        }

        if bytes == 0 {
            return Some(self.enter_terminal(Verdict::ErrorNetwork(
                std::io::ErrorKind::ConnectionAborted,
            )));
        }
        let bytes = bytes as u64;

        let step = match &mut self.kind {
            MachineKind::OneWay {
                direction: own,
                flow,
            } => {
                if *own != direction {
                    Step::Terminal(Verdict::ErrorProtocol(ProtocolViolation::WrongDirection))
                } else if bytes > flow.remaining() {
                    Step::Terminal(Verdict::ErrorProtocol(ProtocolViolation::TooManyBytes {
                        expected: flow.total,
                    }))
                } else {
                    flow.acked += bytes;
                    if flow.done() {
                        Step::Terminal(Verdict::Done)
                    } else {
                        Step::InFlight
                    }
                }
            }
            MachineKind::Alternating {
                current,
                phase_remaining,
                send_chunk,
                recv_chunk,
                moved,
                total,
            } => {
                if *current != direction {
                    Step::Terminal(Verdict::ErrorProtocol(ProtocolViolation::WrongDirection))
                } else if bytes > *phase_remaining {
                    Step::Terminal(Verdict::ErrorProtocol(ProtocolViolation::PhaseOvershoot {
                        offset: *moved + *phase_remaining,
                    }))
                } else {
                    *phase_remaining -= bytes;
                    *moved += bytes;
                    if moved == total {
                        Step::Terminal(Verdict::Done)
                    } else {
                        if *phase_remaining == 0 {
                            // Phase boundary reached exactly; flip direction.
                            *current = current.flipped();
                            let chunk = match *current {
                                Direction::Send => *send_chunk,
                                Direction::Recv => *recv_chunk,
                            };
                            *phase_remaining = chunk.min(*total - *moved);
                        }
                        Step::InFlight
                    }
                }
            }
            MachineKind::Both { send, recv } => {
                // This completion cannot change the other direction's state.
                let (flow, other_done) = match direction {
                    Direction::Send => (&mut *send, recv.done()),
                    Direction::Recv => (&mut *recv, send.done()),
                };
                if bytes > flow.remaining() {
                    Step::Terminal(Verdict::ErrorProtocol(ProtocolViolation::TooManyBytes {
                        expected: flow.total,
                    }))
                } else {
                    flow.acked += bytes;
                    if flow.done() && other_done {
                        Step::Terminal(Verdict::Done)
                    } else {
                        Step::InFlight
                    }
                }
            }
            MachineKind::MediaStream { .. } => {
                fatal_invariant!("media streams account frames, not byte completions");
            }
        };

        match step {
            Step::InFlight => None,
            Step::Terminal(verdict) => Some(self.enter_terminal(verdict)),
            Step::Task(_) => unreachable!("complete never yields a task"),
        }
    }

    /// Advances the media delivery pointer by one frame position,
    /// delivered or dropped alike. Returns the terminal verdict when the
    /// stream length is reached.
    pub fn frame_advanced(&mut self) -> Option<Verdict> {
        if self.terminal.is_some() {
            fatal_invariant!("frame advance delivered to a terminal pattern");
        }
        let finished = match &mut self.kind {
            MachineKind::MediaStream {
                delivered,
                total_frames,
                ..
            } => {
                *delivered += 1;
                *delivered == *total_frames
            }
            _ => fatal_invariant!("frame advance on a byte-stream pattern"),
        };
        if finished {
            Some(self.enter_terminal(Verdict::Done))
        } else {
            None
        }
    }

    /// Verifies one media frame payload against the pattern space.
    pub fn verify_frame(
        pattern: &PatternBuffer,
        sequence: u64,
        payload: &[u8],
    ) -> Result<(), ProtocolViolation> {
        let offset = sequence * payload.len() as u64;
        pattern
            .verify(payload, offset)
            .map_err(|local| ProtocolViolation::PatternMismatch {
                stream_offset: offset + local as u64,
            })
    }

    /// Records a protocol failure detected by the driver (a pattern
    /// mismatch, or excess bytes after the contract was met).
    pub fn fail_protocol(&mut self, violation: ProtocolViolation) -> Verdict {
        self.enter_terminal(Verdict::ErrorProtocol(violation))
    }

    /// Records a platform failure observed during I/O.
    pub fn fail_network(&mut self, kind: std::io::ErrorKind) -> Verdict {
        self.enter_terminal(Verdict::ErrorNetwork(kind))
    }

    /// Terminalizes a pattern that has no bytes to move at all, so no
    /// completion will ever arrive to finish it.
    pub fn finish_idle(&mut self) -> Verdict {
        self.enter_terminal(Verdict::Done)
    }

    /// Bytes contracted for the given direction.
    pub fn contracted(&self, direction: Direction) -> u64 {
        match &self.kind {
            MachineKind::OneWay {
                direction: own,
                flow,
            } => {
                if *own == direction {
                    flow.total
                } else {
                    0
                }
            }
            MachineKind::Alternating { total, .. } => *total,
            MachineKind::Both { send, recv } => match direction {
                Direction::Send => send.total,
                Direction::Recv => recv.total,
            },
            MachineKind::MediaStream {
                total_frames,
                payload_len,
                ..
            } => {
                if direction == Direction::Recv {
                    total_frames * *payload_len as u64
                } else {
                    0
                }
            }
        }
    }

    fn enter_terminal(&mut self, verdict: Verdict) -> Verdict {
        if self.terminal.is_some() {
            fatal_invariant!("pattern attempted a second terminal transition");
        }
        self.terminal = Some(verdict);
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, MediaConfig, PatternKind, Protocol, Role};

    fn config(pattern: PatternKind, role: Role) -> Config {
        Config {
            pattern,
            role,
            push_bytes: 100,
            pull_bytes: 50,
            ..Config::default()
        }
    }

    #[test]
    fn push_client_sends_exactly_the_transfer() {
        let mut machine =
            PatternMachine::for_connection(&config(PatternKind::Push, Role::Client), 1000);
        assert_eq!(machine.directions(), (true, false));

        let mut sent = 0u64;
        loop {
            match machine.next_task(Direction::Send, 256) {
                Verdict::Continue(task) => {
                    assert_eq!(task.direction, Direction::Send);
                    assert_eq!(task.offset, sent);
                    assert!(task.len <= 256);
                    sent += task.len as u64;
                    if machine.complete(Direction::Send, task.len) == Some(Verdict::Done) {
                        break;
                    }
                }
                other => panic!("unexpected verdict {other:?}"),
            }
        }
        assert_eq!(sent, 1000);
        assert!(machine.direction_done(Direction::Send));
        assert!(machine.is_terminal());
    }

    #[test]
    fn partial_completion_rerequests_the_remainder() {
        let mut machine =
            PatternMachine::for_connection(&config(PatternKind::Pull, Role::Client), 500);
        let task = match machine.next_task(Direction::Recv, 500) {
            Verdict::Continue(task) => task,
            other => panic!("unexpected verdict {other:?}"),
        };
        assert_eq!(task.len, 500);
        assert_eq!(machine.complete(Direction::Recv, 200), None);

        // The next task resumes exactly where the short read stopped.
        match machine.next_task(Direction::Recv, 500) {
            Verdict::Continue(task) => {
                assert_eq!(task.offset, 200);
                assert_eq!(task.len, 300);
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[test]
    fn pushpull_alternates_on_exact_phase_boundaries() {
        let mut machine =
            PatternMachine::for_connection(&config(PatternKind::PushPull, Role::Client), 300);
        // Client phase order: send 100, recv 50, send 100, recv 50.
        let mut phases = Vec::new();
        loop {
            let direction = machine.active_direction();
            let task = match machine.next_task(direction, 4096) {
                Verdict::Continue(task) => task,
                Verdict::Done => break,
                other => panic!("unexpected verdict {other:?}"),
            };
            phases.push((direction, task.len));
            if machine.complete(direction, task.len) == Some(Verdict::Done) {
                break;
            }
        }
        assert_eq!(
            phases,
            vec![
                (Direction::Send, 100),
                (Direction::Recv, 50),
                (Direction::Send, 100),
                (Direction::Recv, 50),
            ]
        );
    }

    #[test]
    fn pushpull_final_phase_is_clamped_to_the_transfer() {
        let mut machine =
            PatternMachine::for_connection(&config(PatternKind::PushPull, Role::Client), 120);
        // send 100, then recv only the remaining 20.
        let task = match machine.next_task(Direction::Send, 4096) {
            Verdict::Continue(task) => task,
            other => panic!("unexpected verdict {other:?}"),
        };
        assert_eq!(task.len, 100);
        assert_eq!(machine.complete(Direction::Send, 100), None);
        match machine.next_task(Direction::Recv, 4096) {
            Verdict::Continue(task) => assert_eq!(task.len, 20),
            other => panic!("unexpected verdict {other:?}"),
        }
        assert_eq!(machine.complete(Direction::Recv, 20), Some(Verdict::Done));
    }

    #[test]
    fn pushpull_server_mirrors_the_client() {
        let mut machine =
            PatternMachine::for_connection(&config(PatternKind::PushPull, Role::Server), 300);
        assert_eq!(machine.active_direction(), Direction::Recv);
        match machine.next_task(Direction::Recv, 4096) {
            Verdict::Continue(task) => assert_eq!(task.len, 100),
            other => panic!("unexpected verdict {other:?}"),
        }
        machine.complete(Direction::Recv, 100);
        assert_eq!(machine.active_direction(), Direction::Send);
    }

    #[test]
    fn duplex_directions_are_independent_halves() {
        let mut machine =
            PatternMachine::for_connection(&config(PatternKind::Duplex, Role::Client), 1001);
        // Floor on both sides: 500 each way.
        assert_eq!(machine.contracted(Direction::Send), 500);
        assert_eq!(machine.contracted(Direction::Recv), 500);

        match machine.next_task(Direction::Send, 4096) {
            Verdict::Continue(task) => assert_eq!(task.len, 500),
            other => panic!("unexpected verdict {other:?}"),
        }
        assert_eq!(machine.complete(Direction::Send, 500), None);
        assert!(machine.direction_done(Direction::Send));
        assert!(!machine.direction_done(Direction::Recv));

        match machine.next_task(Direction::Recv, 4096) {
            Verdict::Continue(task) => {
                assert_eq!(
                    machine.complete(Direction::Recv, task.len),
                    Some(Verdict::Done)
                );
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[test]
    fn zero_byte_completion_is_connection_aborted() {
        let mut machine =
            PatternMachine::for_connection(&config(PatternKind::Push, Role::Server), 1000);
        assert_eq!(
            machine.complete(Direction::Recv, 0),
            Some(Verdict::ErrorNetwork(std::io::ErrorKind::ConnectionAborted))
        );
    }

    #[test]
    fn excess_bytes_violate_the_contract() {
        let mut machine =
            PatternMachine::for_connection(&config(PatternKind::Push, Role::Server), 100);
        assert_eq!(
            machine.complete(Direction::Recv, 200),
            Some(Verdict::ErrorProtocol(ProtocolViolation::TooManyBytes {
                expected: 100
            }))
        );
    }

    #[test]
    fn wrong_direction_bytes_are_a_protocol_error() {
        let mut machine =
            PatternMachine::for_connection(&config(PatternKind::Push, Role::Client), 100);
        assert_eq!(
            machine.complete(Direction::Recv, 1),
            Some(Verdict::ErrorProtocol(ProtocolViolation::WrongDirection))
        );
    }

    #[test]
    fn media_stream_accounts_frames() {
        let mut config = config(PatternKind::MediaStream, Role::Client);
        config.protocol = Protocol::Udp;
        config.media = Some(MediaConfig {
            bits_per_second: 8000,
            frames_per_second: 10,
            buffer_depth_seconds: 1,
            stream_length_seconds: 1,
            codec: crate::config::Codec::NoResends,
        });
        let mut machine = PatternMachine::for_connection(&config, 0);

        for _ in 0..9 {
            assert_eq!(machine.frame_advanced(), None);
        }
        assert_eq!(machine.frame_advanced(), Some(Verdict::Done));
    }

    #[test]
    fn media_frame_verification_maps_sequence_to_offset() {
        let pattern = PatternBuffer::sized(4096);
        let mut payload = vec![0u8; 72];
        pattern.fill(5 * 72, &mut payload);
        assert!(PatternMachine::verify_frame(&pattern, 5, &payload).is_ok());

        payload[3] ^= 0x80;
        assert_eq!(
            PatternMachine::verify_frame(&pattern, 5, &payload),
            Err(ProtocolViolation::PatternMismatch {
                stream_offset: 5 * 72 + 3
            })
        );
    }
}
