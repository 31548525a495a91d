use netpump::config::{Codec, MediaConfig, PatternKind, Protocol, ValueRange};
use netpump::{Broker, Config, Role, Sinks, WaitOutcome};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT_LIMIT: Duration = Duration::from_secs(30);

fn server_config(pattern: PatternKind, transfer: u64, exit_limit: u64) -> Config {
    let mut config = Config {
        role: Role::Server,
        pattern,
        listen_addresses: vec!["127.0.0.1:0".parse().unwrap()],
        transfer_size: ValueRange::fixed(transfer),
        server_exit_limit: exit_limit,
        ..Config::default()
    };
    config.validate().unwrap();
    config
}

fn client_config(
    pattern: PatternKind,
    transfer: u64,
    target: netpump::Endpoint,
    connections: u32,
    iterations: u64,
) -> Config {
    let mut config = Config {
        role: Role::Client,
        pattern,
        target_addresses: vec![target],
        transfer_size: ValueRange::fixed(transfer),
        connection_limit: connections,
        iterations,
        ..Config::default()
    };
    config.validate().unwrap();
    config
}

async fn start_pair(
    server: Config,
    client: impl FnOnce(netpump::Endpoint) -> Config,
) -> (Arc<Broker>, Arc<Broker>) {
    let server = Broker::start(Arc::new(server), Sinks::null()).await.unwrap();
    let target = server.local_endpoints()[0];
    let client = Broker::start(Arc::new(client(target)), Sinks::null())
        .await
        .unwrap();
    (server, client)
}

#[tokio::test]
async fn tcp_push_single_connection() {
    let transfer = 1_048_576;
    let (server, client) = start_pair(
        server_config(PatternKind::Push, transfer, 1),
        |target| client_config(PatternKind::Push, transfer, target, 1, 1),
    )
    .await;

    assert_eq!(client.wait(Some(WAIT_LIMIT)).await, WaitOutcome::Done);
    assert_eq!(server.wait(Some(WAIT_LIMIT)).await, WaitOutcome::Done);

    let client_stats = client.run_stats();
    let server_stats = server.run_stats();
    assert_eq!(client_stats.connections_completed(), 1);
    assert_eq!(client_stats.total_bytes_sent(), transfer);
    assert_eq!(server_stats.total_bytes_recv(), transfer);
    assert_eq!(client.exit_code(), 0);
    assert_eq!(server.exit_code(), 0);
}

#[tokio::test]
async fn tcp_pull_reverses_the_byte_flow() {
    let transfer = 262_144;
    let (server, client) = start_pair(
        server_config(PatternKind::Pull, transfer, 1),
        |target| client_config(PatternKind::Pull, transfer, target, 1, 1),
    )
    .await;

    assert_eq!(client.wait(Some(WAIT_LIMIT)).await, WaitOutcome::Done);
    assert_eq!(server.wait(Some(WAIT_LIMIT)).await, WaitOutcome::Done);

    assert_eq!(client.run_stats().total_bytes_recv(), transfer);
    assert_eq!(server.run_stats().total_bytes_sent(), transfer);
    assert_eq!(client.exit_code(), 0);
}

#[tokio::test]
async fn tcp_pushpull_alternates_to_completion() {
    let transfer = 300_000;
    let mut server = server_config(PatternKind::PushPull, transfer, 1);
    server.push_bytes = 0x10000;
    server.pull_bytes = 0x8000;
    server.validate().unwrap();
    let (server, client) = start_pair(server, |target| {
        let mut config = client_config(PatternKind::PushPull, transfer, target, 1, 1);
        config.push_bytes = 0x10000;
        config.pull_bytes = 0x8000;
        config.validate().unwrap();
        config
    })
    .await;

    assert_eq!(client.wait(Some(WAIT_LIMIT)).await, WaitOutcome::Done);
    assert_eq!(server.wait(Some(WAIT_LIMIT)).await, WaitOutcome::Done);

    let client_stats = client.run_stats();
    // Both directions together account for the whole transfer.
    assert_eq!(
        client_stats.total_bytes_sent() + client_stats.total_bytes_recv(),
        transfer
    );
    assert_eq!(client.exit_code(), 0);
    assert_eq!(server.exit_code(), 0);
}

#[tokio::test]
async fn tcp_duplex_eight_concurrent_connections() {
    let transfer = 131_072;
    let connections = 8;
    let (server, client) = start_pair(
        server_config(PatternKind::Duplex, transfer, connections as u64),
        |target| client_config(PatternKind::Duplex, transfer, target, connections, 1),
    )
    .await;

    assert_eq!(client.wait(Some(WAIT_LIMIT)).await, WaitOutcome::Done);
    assert_eq!(server.wait(Some(WAIT_LIMIT)).await, WaitOutcome::Done);

    let client_stats = client.run_stats();
    assert_eq!(client_stats.connections_completed(), connections as u64);
    // Each connection moves half the transfer each way.
    let expected = connections as u64 * (transfer / 2);
    assert_eq!(client_stats.total_bytes_sent(), expected);
    assert_eq!(client_stats.total_bytes_recv(), expected);
    assert_eq!(client.exit_code(), 0);
    assert_eq!(server.exit_code(), 0);
}

#[tokio::test]
async fn transfer_mismatch_is_a_protocol_failure() {
    // The server expects one byte more than the client sends; the
    // client's close lands before the server's accounting is satisfied.
    let (server, client) = start_pair(
        server_config(PatternKind::Push, 1_048_577, 1),
        |target| client_config(PatternKind::Push, 1_048_576, target, 1, 1),
    )
    .await;

    assert_eq!(client.wait(Some(WAIT_LIMIT)).await, WaitOutcome::Done);
    assert_eq!(server.wait(Some(WAIT_LIMIT)).await, WaitOutcome::Done);

    assert_eq!(client.exit_code(), 0);
    assert_eq!(server.run_stats().connections_failed(), 1);
    assert_ne!(server.exit_code(), 0);
}

#[tokio::test]
async fn rate_limit_paces_the_transfer() {
    // 1 MiB at 256 KiB/s cannot finish in under ~3 seconds.
    let transfer = 1_048_576;
    let mut server = server_config(PatternKind::Push, transfer, 1);
    server.rate_limit = ValueRange::fixed(0);
    let started = Instant::now();
    let (server, client) = start_pair(server, |target| {
        let mut config = client_config(PatternKind::Push, transfer, target, 1, 1);
        config.rate_limit = ValueRange::fixed(262_144);
        config.rate_limit_period_ms = 100;
        config.validate().unwrap();
        config
    })
    .await;

    assert_eq!(client.wait(Some(WAIT_LIMIT)).await, WaitOutcome::Done);
    assert_eq!(server.wait(Some(WAIT_LIMIT)).await, WaitOutcome::Done);

    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(3000),
        "rate-limited transfer finished in {elapsed:?}"
    );
    assert_eq!(client.run_stats().total_bytes_sent(), transfer);
    assert_eq!(client.exit_code(), 0);
}

fn media_config() -> MediaConfig {
    MediaConfig {
        bits_per_second: 400_000,
        frames_per_second: 50,
        buffer_depth_seconds: 1,
        stream_length_seconds: 2,
        codec: Codec::NoResends,
    }
}

fn media_client_config(target: netpump::Endpoint, codec: Codec) -> Config {
    let mut config = Config {
        role: Role::Client,
        protocol: Protocol::Udp,
        pattern: PatternKind::MediaStream,
        target_addresses: vec![target],
        connection_limit: 1,
        iterations: 1,
        media: Some(MediaConfig {
            codec,
            ..media_config()
        }),
        ..Config::default()
    };
    config.validate().unwrap();
    config
}

#[tokio::test]
async fn udp_stream_without_loss_delivers_every_frame() {
    let mut server = Config {
        role: Role::Server,
        protocol: Protocol::Udp,
        pattern: PatternKind::MediaStream,
        listen_addresses: vec!["127.0.0.1:0".parse().unwrap()],
        server_exit_limit: 1,
        media: Some(MediaConfig {
            buffer_depth_seconds: 0,
            ..media_config()
        }),
        ..Config::default()
    };
    server.validate().unwrap();

    let jitter_dir = tempfile::tempdir().unwrap();
    let jitter_path = jitter_dir.path().join("jitter.csv");
    let mut sinks = Sinks::null();
    sinks.jitter = Arc::new(
        netpump::sinks::CsvFileSink::create(&jitter_path, Sinks::JITTER_HEADER).unwrap(),
    );

    let server = Broker::start(Arc::new(server), Sinks::null()).await.unwrap();
    let target = server.local_endpoints()[0];
    let client = Broker::start(
        Arc::new(media_client_config(target, Codec::NoResends)),
        sinks,
    )
    .await
    .unwrap();

    assert_eq!(client.wait(Some(WAIT_LIMIT)).await, WaitOutcome::Done);
    assert_eq!(server.wait(Some(WAIT_LIMIT)).await, WaitOutcome::Done);

    let total_frames = media_config().total_frames();
    let stats = client.run_stats();
    assert_eq!(stats.successful_frames(), total_frames);
    assert_eq!(stats.dropped_frames(), 0);
    assert_eq!(stats.duplicate_frames(), 0);
    assert_eq!(stats.error_frames(), 0);
    assert_eq!(client.exit_code(), 0);
    assert_eq!(server.exit_code(), 0);

    // One jitter row per delivered frame, plus the header.
    let rows = std::fs::read_to_string(&jitter_path).unwrap();
    assert_eq!(rows.lines().count() as u64, total_frames + 1);
}

/// A server that drops the first transmission of every 10th frame but
/// honors resend requests, forcing the client's resend-once path.
async fn lossy_media_server(media: MediaConfig) -> netpump::Endpoint {
    use netpump::media::wire::{self, Datagram, FrameHeader};

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let endpoint = netpump::Endpoint::from(socket.local_addr().unwrap());
    let pattern = netpump::PatternBuffer::for_max_buffer(media.payload_len());

    tokio::spawn(async move {
        let payload_len = media.payload_len();
        let mut buf = vec![0u8; 0x10000];

        // Wait for the start announcement.
        let peer = loop {
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            if wire::decode(&buf[..len]) == Ok(Datagram::Start) {
                break from;
            }
        };

        let send_frame = |sequence: u64, flags: u32| {
            let mut payload = vec![0u8; payload_len];
            pattern.fill(sequence * payload_len as u64, &mut payload);
            let header = FrameHeader {
                sequence,
                sender_qpc: 0,
                sender_qpf: 1,
                flags,
            };
            wire::encode_frame(&header, &payload).unwrap()
        };

        let mut ticker = tokio::time::interval(media.frame_period());
        let mut next = 0u64;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if next >= media.total_frames() {
                        break;
                    }
                    let sequence = next;
                    next += 1;
                    if sequence % 10 == 9 {
                        continue; // synthetic loss on first transit
                    }
                    let datagram = send_frame(sequence, 0);
                    let _ = socket.send_to(&datagram, peer).await;
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, _) = received.unwrap();
                    if let Ok(Datagram::ResendRequest { low, high }) = wire::decode(&buf[..len]) {
                        for sequence in low..=high.min(next.saturating_sub(1)) {
                            let datagram = send_frame(sequence, wire::flags::RESENT);
                            let _ = socket.send_to(&datagram, peer).await;
                        }
                    }
                }
            }
        }
        // Serve late resend requests for the stream tail.
        let linger = tokio::time::sleep(Duration::from_millis(700));
        tokio::pin!(linger);
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    let (len, _) = received.unwrap();
                    if let Ok(Datagram::ResendRequest { low, high }) = wire::decode(&buf[..len]) {
                        for sequence in low..=high.min(next.saturating_sub(1)) {
                            let datagram = send_frame(sequence, wire::flags::RESENT);
                            let _ = socket.send_to(&datagram, peer).await;
                        }
                    }
                }
                _ = &mut linger => break,
            }
        }
    });

    endpoint
}

#[tokio::test]
async fn udp_stream_resend_once_recovers_synthetic_loss() {
    let media = MediaConfig {
        codec: Codec::ResendOnce,
        ..media_config()
    };
    let target = lossy_media_server(media.clone()).await;
    let client = Broker::start(
        Arc::new(media_client_config(target, Codec::ResendOnce)),
        Sinks::null(),
    )
    .await
    .unwrap();

    assert_eq!(client.wait(Some(WAIT_LIMIT)).await, WaitOutcome::Done);

    let total_frames = media.total_frames();
    let stats = client.run_stats();
    // Every 10th frame needed a resend request.
    assert!(stats.retry_attempts() >= total_frames / 10);
    // Localhost resends land in time: nothing is lost for good.
    assert_eq!(stats.successful_frames(), total_frames);
    assert_eq!(stats.dropped_frames(), 0);
    assert_eq!(stats.error_frames(), 0);
}
