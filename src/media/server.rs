use crate::config::MediaConfig;
use crate::media::clock::MonotonicClock;
use crate::media::wire::{self, Datagram, FrameHeader};
use crate::net::{Endpoint, SocketFactory};
use crate::pattern::PatternBuffer;
use crate::stats::ConnectionStats;
use crate::Result;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// How long a finished stream keeps answering resend requests for its
/// tail frames before the task returns.
const RESEND_LINGER: std::time::Duration = std::time::Duration::from_millis(500);

/// One UDP socket shared by all server-side streams
///
/// A pump task classifies every received datagram: START announcements
/// from unknown peers queue for [`MediaListener::accept`]; resend
/// requests route to the stream that owns the peer. The socket itself is
/// shared for sending, so any number of streams pace frames through it.
pub struct MediaListener {
    socket: Arc<UdpSocket>,
    local: Endpoint,
    streams: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<(u64, u64)>>>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SocketAddr>>,
}

impl MediaListener {
    /// Binds the listen endpoint and starts the classification pump.
    /// The pump stops on the shutdown signal or when the listener is
    /// dropped.
    pub async fn bind(
        factory: &dyn SocketFactory,
        listen: Endpoint,
        shutdown: broadcast::Sender<()>,
    ) -> Result<Arc<Self>> {
        let socket = Arc::new(factory.listen_datagram(listen).await?);
        let local = Endpoint::from(socket.local_addr()?);
        info!(address = %local, "media-stream listener bound");

        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let listener = Arc::new(Self {
            socket: socket.clone(),
            local,
            streams: Mutex::new(HashMap::new()),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        });

        let pump = Arc::downgrade(&listener);
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; 0x10000];
            loop {
                let received = tokio::select! {
                    received = socket.recv_from(&mut buffer) => received,
                    _ = shutdown_rx.recv() => break,
                };
                let Some(listener) = pump.upgrade() else {
                    break;
                };
                match received {
                    Ok((len, from)) => listener.classify(&buffer[..len], from, &accept_tx),
                    Err(e) => {
                        warn!(error = %e, "media listener receive failed");
                    }
                }
            }
            debug!("media listener pump stopped");
        });

        Ok(listener)
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    fn classify(
        &self,
        datagram: &[u8],
        from: SocketAddr,
        accept_tx: &mpsc::UnboundedSender<SocketAddr>,
    ) {
        match wire::decode(datagram) {
            Ok(Datagram::Start) => {
                if self.streams.lock().expect("stream map lock").contains_key(&from) {
                    debug!(%from, "duplicate start announcement");
                } else {
                    let _ = accept_tx.send(from);
                }
            }
            Ok(Datagram::ResendRequest { low, high }) => {
                let streams = self.streams.lock().expect("stream map lock");
                match streams.get(&from) {
                    Some(resend_tx) => {
                        let _ = resend_tx.send((low, high));
                    }
                    None => debug!(%from, "resend request from unknown peer"),
                }
            }
            Ok(Datagram::Frame { .. }) => {
                debug!(%from, "unexpected data frame at the server");
            }
            Err(e) => {
                warn!(%from, error = %e, "malformed datagram");
            }
        }
    }

    /// Waits for the next client announcement and registers its resend
    /// channel. Returns `None` once the pump has stopped.
    pub async fn accept(&self) -> Option<(SocketAddr, mpsc::UnboundedReceiver<(u64, u64)>)> {
        let peer = self.accept_rx.lock().await.recv().await?;
        let (resend_tx, resend_rx) = mpsc::unbounded_channel();
        self.streams
            .lock()
            .expect("stream map lock")
            .insert(peer, resend_tx);
        Some((peer, resend_rx))
    }

    /// Forgets a finished stream's peer.
    pub fn release(&self, peer: SocketAddr) {
        self.streams.lock().expect("stream map lock").remove(&peer);
    }
}

/// Paces the whole stream to one client: one frame per period, each
/// carrying pattern bytes at `sequence × payload_len`, answering resend
/// requests immediately and at most once per frame.
pub async fn stream_frames(
    socket: &UdpSocket,
    peer: SocketAddr,
    media: &MediaConfig,
    pattern: &PatternBuffer,
    stats: &ConnectionStats,
    mut resend_rx: mpsc::UnboundedReceiver<(u64, u64)>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let payload_len = media.payload_len();
    let total_frames = media.total_frames();
    let clock = MonotonicClock::global();
    let mut payload = vec![0u8; payload_len];
    let mut resent: HashSet<u64> = HashSet::new();

    let mut ticker = tokio::time::interval(media.frame_period());
    let mut next_sequence = 0u64;

    while next_sequence < total_frames {
        tokio::select! {
            _ = ticker.tick() => {
                let sequence = next_sequence;
                next_sequence += 1;
                send_frame(socket, peer, sequence, 0, payload_len, pattern, clock, &mut payload, stats).await?;
            }
            Some((low, high)) = resend_rx.recv() => {
                resend_range(
                    socket, peer, low, high, next_sequence, payload_len,
                    pattern, clock, &mut payload, &mut resent, stats,
                ).await?;
            }
            _ = shutdown.recv() => {
                debug!(%peer, "stream cancelled");
                return Ok(());
            }
        }
    }

    // The tail of the window may still be in flight; keep answering
    // resend requests briefly before tearing the stream down.
    let linger = tokio::time::sleep(RESEND_LINGER);
    tokio::pin!(linger);
    loop {
        tokio::select! {
            Some((low, high)) = resend_rx.recv() => {
                resend_range(
                    socket, peer, low, high, next_sequence, payload_len,
                    pattern, clock, &mut payload, &mut resent, stats,
                ).await?;
            }
            _ = &mut linger => break,
            _ = shutdown.recv() => break,
        }
    }

    info!(%peer, frames = total_frames, "stream complete");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn send_frame(
    socket: &UdpSocket,
    peer: SocketAddr,
    sequence: u64,
    flags: u32,
    payload_len: usize,
    pattern: &PatternBuffer,
    clock: &MonotonicClock,
    payload: &mut [u8],
    stats: &ConnectionStats,
) -> Result<()> {
    pattern.fill(sequence * payload_len as u64, payload);
    let header = FrameHeader {
        sequence,
        sender_qpc: clock.ticks(),
        sender_qpf: clock.frequency(),
        flags,
    };
    let datagram = wire::encode_frame(&header, payload)?;
    let sent = socket.send_to(&datagram, peer).await?;
    stats.record_sent(sent as u64);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn resend_range(
    socket: &UdpSocket,
    peer: SocketAddr,
    low: u64,
    high: u64,
    sent_up_to: u64,
    payload_len: usize,
    pattern: &PatternBuffer,
    clock: &MonotonicClock,
    payload: &mut [u8],
    resent: &mut HashSet<u64>,
    stats: &ConnectionStats,
) -> Result<()> {
    // Requests beyond what was sent are client confusion; clamp them.
    if sent_up_to == 0 {
        return Ok(());
    }
    let high = high.min(sent_up_to - 1);
    for sequence in low..=high {
        if !resent.insert(sequence) {
            continue;
        }
        send_frame(
            socket,
            peer,
            sequence,
            wire::flags::RESENT,
            payload_len,
            pattern,
            clock,
            payload,
            stats,
        )
        .await?;
    }
    Ok(())
}
