use netpump::config::{Config, PatternKind, Role, ValueRange};
use netpump::pattern::{Direction, PatternMachine, Verdict};
use netpump::rate::{Gate, RateLimiter};
use netpump::PatternBuffer;
use proptest::prelude::*;
use std::collections::HashMap;
use std::time::Instant;

fn machine_config(pattern: PatternKind, push_bytes: u64, pull_bytes: u64) -> Config {
    Config {
        pattern,
        role: Role::Client,
        push_bytes,
        pull_bytes,
        ..Config::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: a window copied out of the pattern verifies clean, and
    /// flipping any single byte is caught at exactly that offset.
    #[test]
    fn verification_catches_any_single_byte_corruption(
        len in 1usize..4096,
        offset in 0u64..1_000_000,
        pos_seed in any::<usize>(),
        flip in 1u8..=255,
    ) {
        let pattern = PatternBuffer::sized(8192);
        let mut window = vec![0u8; len];
        pattern.fill(offset, &mut window);
        prop_assert_eq!(pattern.verify(&window, offset), Ok(()));

        let pos = pos_seed % len;
        window[pos] ^= flip;
        prop_assert_eq!(pattern.verify(&window, offset), Err(pos));
    }

    /// Property: a push pattern accounts exactly the transfer, with
    /// monotonically increasing stream offsets, no matter how reads and
    /// writes fragment.
    #[test]
    fn push_accounting_is_exact_under_fragmentation(
        transfer in 1u64..1_000_000,
        mut chop in any::<u64>(),
    ) {
        let config = machine_config(PatternKind::Push, 0x100000, 0x100000);
        let mut machine = PatternMachine::for_connection(&config, transfer);
        let mut sent = 0u64;
        loop {
            // A deterministic ragged sequence of buffer sizes and
            // partial completions.
            chop = chop.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let buffer_len = (chop % 8192 + 1) as usize;
            let task = match machine.next_task(Direction::Send, buffer_len) {
                Verdict::Continue(task) => task,
                Verdict::Done => break,
                other => return Err(TestCaseError::fail(format!("verdict {other:?}"))),
            };
            prop_assert_eq!(task.offset, sent);
            prop_assert!(task.len <= buffer_len);

            let moved = (chop >> 32) as usize % task.len + 1;
            sent += moved as u64;
            if machine.complete(Direction::Send, moved) == Some(Verdict::Done) {
                break;
            }
        }
        prop_assert_eq!(sent, transfer);
    }

    /// Property: push-pull phases always end exactly on their configured
    /// boundaries (or the final clamp), and the directions strictly
    /// alternate.
    #[test]
    fn pushpull_phases_align_exactly(
        transfer in 1u64..500_000,
        push in 1u64..60_000,
        pull in 1u64..60_000,
    ) {
        let config = machine_config(PatternKind::PushPull, push, pull);
        let mut machine = PatternMachine::for_connection(&config, transfer);
        let mut moved = 0u64;
        let mut phases: Vec<(Direction, u64)> = Vec::new();

        loop {
            let direction = machine.active_direction();
            let task = match machine.next_task(direction, 0x10000) {
                Verdict::Continue(task) => task,
                Verdict::Done => break,
                other => return Err(TestCaseError::fail(format!("verdict {other:?}"))),
            };
            moved += task.len as u64;
            match phases.last_mut() {
                Some((last_direction, bytes)) if *last_direction == direction => {
                    *bytes += task.len as u64;
                }
                _ => phases.push((direction, task.len as u64)),
            }
            if machine.complete(direction, task.len) == Some(Verdict::Done) {
                break;
            }
        }

        prop_assert_eq!(moved, transfer);
        for (index, (direction, bytes)) in phases.iter().enumerate() {
            let expected_direction = if index % 2 == 0 { Direction::Send } else { Direction::Recv };
            prop_assert_eq!(*direction, expected_direction);
            let chunk = if *direction == Direction::Send { push } else { pull };
            if index + 1 < phases.len() {
                prop_assert_eq!(*bytes, chunk.min(transfer));
            } else {
                prop_assert!(*bytes <= chunk);
            }
        }
    }

    /// Property: duplex always contracts the same floor half in each
    /// direction, so symmetric peers agree byte-for-byte.
    #[test]
    fn duplex_halves_are_symmetric(transfer in 0u64..10_000_000) {
        let config = machine_config(PatternKind::Duplex, 0x100000, 0x100000);
        let machine = PatternMachine::for_connection(&config, transfer);
        prop_assert_eq!(machine.contracted(Direction::Send), transfer / 2);
        prop_assert_eq!(machine.contracted(Direction::Recv), transfer / 2);
    }

    /// Property: within any single period the limiter admits at most the
    /// period budget, except for a lone oversized task.
    #[test]
    fn rate_limiter_bounds_bytes_per_period(
        bytes_per_second in 1_000u64..200_000,
        period_ms in 50u64..500,
        sizes in prop::collection::vec(1u64..16_384, 1..64),
    ) {
        let mut limiter = RateLimiter::new(bytes_per_second, period_ms);
        let budget = (bytes_per_second * period_ms / 1000).max(1);

        let mut now = Instant::now();
        // Every deferral lands on the next period boundary, so counting
        // deferrals indexes the period each admission fell into.
        let mut window = 0u32;
        let mut admitted: HashMap<u32, (u64, u32)> = HashMap::new();

        for size in sizes {
            loop {
                match limiter.schedule(size, now) {
                    Gate::Now => {
                        let entry = admitted.entry(window).or_default();
                        entry.0 += size;
                        entry.1 += 1;
                        break;
                    }
                    Gate::At(at) => {
                        prop_assert!(at > now);
                        now = at;
                        window += 1;
                    }
                }
            }
        }

        for (total, tasks) in admitted.values() {
            prop_assert!(
                *total <= budget || *tasks == 1,
                "window admitted {} bytes across {} tasks with budget {}",
                total, tasks, budget
            );
        }
    }

    /// Property: ranges draw inclusively and fixed values never vary.
    #[test]
    fn value_ranges_respect_their_bounds(low in 0u64..1000, span in 0u64..1000) {
        let range = ValueRange::spread(low, low + span).unwrap();
        for _ in 0..8 {
            let value = range.draw();
            prop_assert!(value >= low && value <= low + span);
        }
        prop_assert_eq!(range.is_fixed(), span == 0);
    }

    /// Property: media frames survive a real datagram socket intact and
    /// classify back to the same header and payload.
    #[test]
    fn wire_frames_survive_a_real_socket(
        payload in prop::collection::vec(any::<u8>(), 0..1200),
        sequence in 0u64..1_000_000,
    ) {
        use netpump::media::wire::{self, Datagram, FrameHeader};

        tokio_test::block_on(async {
            let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await
                .map_err(|e| TestCaseError::fail(format!("bind failed: {e}")))?;
            let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await
                .map_err(|e| TestCaseError::fail(format!("bind failed: {e}")))?;

            let header = FrameHeader {
                sequence,
                sender_qpc: sequence * 3,
                sender_qpf: 1_000_000_000,
                flags: 0,
            };
            let datagram = wire::encode_frame(&header, &payload)
                .map_err(|e| TestCaseError::fail(format!("encode failed: {e}")))?;
            sender
                .send_to(&datagram, receiver.local_addr().unwrap())
                .await
                .map_err(|e| TestCaseError::fail(format!("send failed: {e}")))?;

            let mut buf = vec![0u8; 2048];
            let (len, _) = receiver.recv_from(&mut buf).await
                .map_err(|e| TestCaseError::fail(format!("recv failed: {e}")))?;

            match wire::decode(&buf[..len]) {
                Ok(Datagram::Frame { header: decoded, payload: received }) => {
                    prop_assert_eq!(decoded, header);
                    prop_assert_eq!(&received[..], &payload[..]);
                }
                other => return Err(TestCaseError::fail(format!("decoded as {other:?}"))),
            }
            Ok(())
        })?;
    }
}
