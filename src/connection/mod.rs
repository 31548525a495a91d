mod driver;

use crate::broker::Broker;
use crate::config::{Config, Protocol};
use crate::media;
use crate::media::server::MediaListener;
use crate::net::{Endpoint, SocketFactory};
use crate::pattern::{PatternBuffer, PatternMachine};
use crate::rate::RateLimiter;
use crate::sinks::Sinks;
use crate::stats::{ConnectionStats, RunStats, StreamStats};
use crate::{PumpError, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, Instrument};

/// Lifecycle of one connection, driven front to back exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Initiated,
    Connecting,
    Accepting,
    Connected,
    InIo,
    Closed,
}

/// Shared view of one connection, held by the broker pool and by the
/// connection task; the broker scavenges slots whose task has closed.
#[derive(Debug)]
pub struct ConnectionSlot {
    pub id: u64,
    closed: AtomicBool,
    pub stats: Arc<ConnectionStats>,
    pub stream_stats: Arc<StreamStats>,
}

impl ConnectionSlot {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            closed: AtomicBool::new(false),
            stats: Arc::new(ConnectionStats::new()),
            stream_stats: Arc::new(StreamStats::new()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Everything a connection needs from its surroundings, constructed once
/// by the process entry point and shared by reference.
pub struct ConnCtx {
    pub config: Arc<Config>,
    pub factory: Arc<dyn SocketFactory>,
    pub pattern: Arc<PatternBuffer>,
    pub sinks: Sinks,
    pub run_stats: Arc<RunStats>,
    pub shutdown: broadcast::Sender<()>,
}

/// How this connection comes to exist.
pub(crate) enum Launch {
    Connect,
    AcceptTcp(Arc<TcpListener>),
    AcceptMedia(Arc<MediaListener>),
}

/// One logical end-to-end association plus its state machine.
///
/// The task sequences `Created → Initiated → Connecting/Accepting →
/// Connected → InIo → Closed`, notifies the broker exactly once on the
/// pending-to-active transition and exactly once at close, and emits a
/// single result record.
pub(crate) struct Connection {
    slot: Arc<ConnectionSlot>,
    ctx: Arc<ConnCtx>,
    broker: Weak<Broker>,
}

impl Connection {
    pub(crate) fn spawn(
        slot: Arc<ConnectionSlot>,
        ctx: Arc<ConnCtx>,
        broker: Weak<Broker>,
        launch: Launch,
    ) {
        let id = slot.id;
        let connection = Self { slot, ctx, broker };
        let span = tracing::info_span!("connection", id);
        tokio::spawn(async move { connection.run(launch).await }.instrument(span));
    }

    async fn run(self, launch: Launch) {
        let mut was_active = false;
        let mut endpoints = None;
        debug!(state = ?Lifecycle::Created, "connection starting");

        let outcome = self.execute(launch, &mut was_active, &mut endpoints).await;

        self.slot.stats.mark_completed();
        self.slot.close();
        if let Some(broker) = self.broker.upgrade() {
            broker.closing(was_active);
        }
        self.report(endpoints, outcome);
    }

    async fn execute(
        &self,
        launch: Launch,
        was_active: &mut bool,
        endpoints: &mut Option<(SocketAddr, SocketAddr)>,
    ) -> Result<()> {
        let config = &self.ctx.config;
        debug!(state = ?Lifecycle::Initiated, "creating socket");
        match launch {
            Launch::Connect => match config.protocol {
                Protocol::Tcp => self.connect_tcp(was_active, endpoints).await,
                Protocol::Udp => self.connect_media(was_active, endpoints).await,
            },
            Launch::AcceptTcp(listener) => self.accept_tcp(listener, was_active, endpoints).await,
            Launch::AcceptMedia(listener) => {
                self.accept_media(listener, was_active, endpoints).await
            }
        }
    }

    /// The next target endpoint, round-robin over the configured set.
    fn pick_target(&self) -> Endpoint {
        let targets = &self.ctx.config.target_addresses;
        let target = targets[self.slot.id as usize % targets.len()];
        if target.port() == 0 {
            target.with_port(self.ctx.config.port)
        } else {
            target
        }
    }

    async fn connect_tcp(
        &self,
        was_active: &mut bool,
        endpoints: &mut Option<(SocketAddr, SocketAddr)>,
    ) -> Result<()> {
        let target = self.pick_target();
        debug!(state = ?Lifecycle::Connecting, %target, "connecting");
        let mut shutdown_rx = self.ctx.shutdown.subscribe();
        let stream = tokio::select! {
            stream = self.ctx.factory.connect_stream(target) => stream?,
            _ = shutdown_rx.recv() => {
                return Err(PumpError::Network(std::io::ErrorKind::Interrupted.into()));
            }
        };
        *endpoints = Some((stream.local_addr()?, stream.peer_addr()?));
        self.now_active(was_active);
        self.drive_tcp_pattern(stream).await
    }

    async fn accept_tcp(
        &self,
        listener: Arc<TcpListener>,
        was_active: &mut bool,
        endpoints: &mut Option<(SocketAddr, SocketAddr)>,
    ) -> Result<()> {
        debug!(state = ?Lifecycle::Accepting, "awaiting peer");
        let mut shutdown_rx = self.ctx.shutdown.subscribe();
        let (stream, remote) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown_rx.recv() => {
                return Err(PumpError::Network(std::io::ErrorKind::Interrupted.into()));
            }
        };
        *endpoints = Some((stream.local_addr()?, remote));
        self.now_active(was_active);
        self.drive_tcp_pattern(stream).await
    }

    async fn drive_tcp_pattern(&self, stream: tokio::net::TcpStream) -> Result<()> {
        let config = &self.ctx.config;
        debug!(state = ?Lifecycle::InIo, "pattern attached");
        self.slot.stats.mark_started();

        let transfer = config.transfer_size.draw();
        let machine = PatternMachine::for_connection(config, transfer);
        // Pacing shapes the sending side; the pattern decides which
        // directions actually send.
        let limiter = if config.rate_limit.high() == 0 {
            RateLimiter::disabled()
        } else {
            RateLimiter::new(config.rate_limit.draw(), config.rate_limit_period_ms)
        };

        driver::drive_tcp(
            stream,
            machine,
            config,
            &self.ctx.pattern,
            &self.slot.stats,
            limiter,
            &self.ctx.shutdown,
        )
        .await
    }

    async fn connect_media(
        &self,
        was_active: &mut bool,
        endpoints: &mut Option<(SocketAddr, SocketAddr)>,
    ) -> Result<()> {
        let target = self.pick_target();
        debug!(state = ?Lifecycle::Connecting, %target, "announcing stream");
        let socket = self.ctx.factory.bind_datagram(target).await?;
        media::client::announce(&socket, target, &self.slot.stats).await?;
        *endpoints = Some((socket.local_addr()?, target.addr()));
        self.now_active(was_active);

        debug!(state = ?Lifecycle::InIo, "stream running");
        self.slot.stats.mark_started();
        media::client::run_stream(
            &socket,
            target,
            &self.ctx.config,
            &self.ctx.pattern,
            &self.slot.stats,
            &self.slot.stream_stats,
            &self.ctx.sinks,
            self.ctx.shutdown.subscribe(),
        )
        .await
    }

    async fn accept_media(
        &self,
        listener: Arc<MediaListener>,
        was_active: &mut bool,
        endpoints: &mut Option<(SocketAddr, SocketAddr)>,
    ) -> Result<()> {
        debug!(state = ?Lifecycle::Accepting, "awaiting stream announcement");
        let mut shutdown_rx = self.ctx.shutdown.subscribe();
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown_rx.recv() => None,
        };
        let Some((peer, resend_rx)) = accepted else {
            return Err(PumpError::Network(std::io::ErrorKind::Interrupted.into()));
        };
        *endpoints = Some((listener.local_endpoint().addr(), peer));
        self.now_active(was_active);

        debug!(state = ?Lifecycle::InIo, %peer, "stream running");
        self.slot.stats.mark_started();
        let media_config = self
            .ctx
            .config
            .media
            .as_ref()
            .expect("validated config carries media settings");
        let result = media::server::stream_frames(
            &listener.socket(),
            peer,
            media_config,
            &self.ctx.pattern,
            &self.slot.stats,
            resend_rx,
            self.ctx.shutdown.subscribe(),
        )
        .await;
        listener.release(peer);
        result
    }

    /// The pending-to-active transition, reported to the broker exactly
    /// once.
    fn now_active(&self, was_active: &mut bool) {
        debug!(state = ?Lifecycle::Connected, "established");
        if let Some(broker) = self.broker.upgrade() {
            broker.initiating_io();
        }
        *was_active = true;
    }

    /// Emits the single per-connection result record.
    fn report(&self, endpoints: Option<(SocketAddr, SocketAddr)>, outcome: Result<()>) {
        let stats = &self.slot.stats;
        if self.ctx.config.protocol == Protocol::Udp {
            self.ctx.run_stats.absorb_frames(&self.slot.stream_stats);
        }
        let (local, remote) = match endpoints {
            Some((local, remote)) => (local.to_string(), remote.to_string()),
            None => ("-".into(), "-".into()),
        };
        let duration_ms = stats
            .duration()
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        debug!(state = ?Lifecycle::Closed, "connection closed");

        match &outcome {
            Ok(()) => {
                self.ctx.run_stats.record_success(stats);
                info!(
                    local = %local,
                    remote = %remote,
                    bytes_sent = stats.bytes_sent(),
                    bytes_recv = stats.bytes_recv(),
                    duration_ms,
                    "connection complete"
                );
            }
            Err(e) if e.is_protocol() => {
                self.ctx.run_stats.record_protocol_failure(stats);
                error!(remote = %remote, error = %e, "protocol failure");
                self.ctx
                    .sinks
                    .error
                    .log_message(&format!("connection {}: {e}", self.slot.id));
            }
            Err(e) => {
                self.ctx.run_stats.record_network_failure(stats);
                error!(remote = %remote, error = %e, "network failure");
                self.ctx
                    .sinks
                    .error
                    .log_message(&format!("connection {}: {e}", self.slot.id));
            }
        }

        let result_class = match &outcome {
            Ok(()) => "ok".to_string(),
            Err(e) => e.class().to_string(),
        };
        self.ctx.sinks.connection.log_message(&format!(
            "{},{},{},{},{},{},{}",
            self.slot.id,
            local,
            remote,
            stats.bytes_sent(),
            stats.bytes_recv(),
            duration_ms,
            result_class
        ));
    }
}
