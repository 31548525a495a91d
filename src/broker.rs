use crate::config::{Config, Protocol, Role};
use crate::connection::{ConnCtx, Connection, ConnectionSlot, Launch};
use crate::fatal_invariant;
use crate::media::server::MediaListener;
use crate::net::{NetSocketFactory, SocketFactory};
use crate::pattern::PatternBuffer;
use crate::sinks::Sinks;
use crate::stats::RunStats;
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

/// Scavenge-and-refill cadence.
const WAKEUP_INTERVAL: Duration = Duration::from_millis(500);

/// What ended a [`Broker::wait`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// All connections drained and the work count reached zero
    Done,
    /// Cancellation was signalled before the work drained
    Cancelled,
    /// The caller's timeout elapsed first
    TimedOut,
    /// An internal event channel died; cannot happen while the broker lives
    Failed,
}

#[derive(Debug)]
struct BrokerState {
    total_remaining: u64,
    pending: u32,
    active: u32,
    pool: Vec<Arc<ConnectionSlot>>,
    next_id: u64,
}

/// The process-wide connection controller
///
/// Maintains the configured concurrency: an initial burst of connection
/// attempts, then a periodic wake-up that drops closed connections from
/// the pool, refills up to the pending limit, and signals the done event
/// once the work count and both counters reach zero. Counter updates
/// arrive from connections via [`Broker::initiating_io`] and
/// [`Broker::closing`]; underflow on either is an unrecoverable
/// invariant violation.
pub struct Broker {
    ctx: Arc<ConnCtx>,
    state: Mutex<BrokerState>,
    pending_limit: u64,
    throttle_limit: u32,
    done_tx: watch::Sender<bool>,
    cancelled: AtomicBool,
    tcp_listeners: Vec<Arc<TcpListener>>,
    media_listener: Option<Arc<MediaListener>>,
}

impl Broker {
    /// Builds the run context, binds any listeners, performs the initial
    /// burst, and starts the periodic tasks.
    ///
    /// The configuration must already be validated; the broker consumes
    /// limits as-is and never re-defaults them.
    pub async fn start(config: Arc<Config>, sinks: Sinks) -> Result<Arc<Self>> {
        let (shutdown, _) = broadcast::channel(8);
        let ctx = Arc::new(ConnCtx {
            factory: Arc::new(NetSocketFactory::new(&config)),
            pattern: Arc::new(PatternBuffer::for_max_buffer(config.max_buffer_size())),
            sinks,
            run_stats: Arc::new(RunStats::new()),
            shutdown,
            config,
        });
        let config = &ctx.config;

        let total_remaining = match config.role {
            Role::Server => config.server_exit_limit,
            Role::Client => {
                if config.iterations == u64::MAX {
                    u64::MAX
                } else {
                    config.iterations.saturating_mul(config.connection_limit as u64)
                }
            }
        };
        // The pending limit can never exceed the remaining work.
        let pending_limit = (config.connection_limit as u64).min(total_remaining);
        let throttle_limit = match (config.role, config.throttle_limit) {
            (Role::Server, _) => u32::MAX,
            (Role::Client, 0) => u32::MAX,
            (Role::Client, limit) => limit,
        };

        let mut tcp_listeners = Vec::new();
        let mut media_listener = None;
        if config.role == Role::Server {
            match config.protocol {
                Protocol::Tcp => {
                    for listen in &config.listen_addresses {
                        let backlog = pending_limit.min(1024) as u32;
                        let listener = ctx.factory.listen_stream(*listen, backlog).await?;
                        info!(address = %listener.local_addr()?, "listening");
                        tcp_listeners.push(Arc::new(listener));
                    }
                }
                Protocol::Udp => {
                    let listen = config.listen_addresses[0];
                    media_listener = Some(
                        MediaListener::bind(ctx.factory.as_ref(), listen, ctx.shutdown.clone())
                            .await?,
                    );
                }
            }
        }

        let (done_tx, _) = watch::channel(false);
        let broker = Arc::new(Self {
            ctx,
            state: Mutex::new(BrokerState {
                total_remaining,
                pending: 0,
                active: 0,
                pool: Vec::new(),
                next_id: 0,
            }),
            pending_limit,
            throttle_limit,
            done_tx,
            cancelled: AtomicBool::new(false),
            tcp_listeners,
            media_listener,
        });

        info!(
            total_remaining,
            pending_limit, "broker starting"
        );

        {
            let mut state = broker.state.lock().expect("broker lock poisoned");
            broker.refill(&mut state);
        }

        broker.start_wakeup_task();
        broker.start_status_task();
        broker.start_time_limit_task();

        Ok(broker)
    }

    /// Catches the pool up to the expected number of pending attempts.
    /// Must run under the broker lock.
    fn refill(self: &Arc<Self>, state: &mut BrokerState) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let config = &self.ctx.config;
        while (state.pending as u64) < self.pending_limit && state.total_remaining > 0 {
            if config.role == Role::Client {
                // Total concurrency is bounded for outgoing connections
                // only; a server accepts whatever arrives.
                if state.pending + state.active >= config.connection_limit {
                    break;
                }
                if state.pending >= self.throttle_limit {
                    break;
                }
            }

            let id = state.next_id;
            state.next_id += 1;
            let slot = Arc::new(ConnectionSlot::new(id));
            state.pool.push(slot.clone());

            let launch = match (config.role, config.protocol) {
                (Role::Client, _) => Launch::Connect,
                (Role::Server, Protocol::Tcp) => {
                    let listener = self.tcp_listeners[id as usize % self.tcp_listeners.len()].clone();
                    Launch::AcceptTcp(listener)
                }
                (Role::Server, Protocol::Udp) => Launch::AcceptMedia(
                    self.media_listener
                        .as_ref()
                        .expect("server UDP broker binds a media listener")
                        .clone(),
                ),
            };
            Connection::spawn(slot, self.ctx.clone(), Arc::downgrade(self), launch);
            state.pending += 1;
            state.total_remaining -= 1;
        }
    }

    /// A connection finished establishing and is about to pump I/O.
    pub(crate) fn initiating_io(&self) {
        let mut state = self.state.lock().expect("broker lock poisoned");
        if state.pending == 0 {
            fatal_invariant!(
                active = state.active,
                "initiating_io: pending counter would underflow"
            );
        }
        state.pending -= 1;
        state.active += 1;
    }

    /// A connection closed; `was_active` tells which counter it held.
    pub(crate) fn closing(&self, was_active: bool) {
        let mut state = self.state.lock().expect("broker lock poisoned");
        if was_active {
            if state.active == 0 {
                fatal_invariant!(
                    pending = state.pending,
                    "closing: active counter would underflow"
                );
            }
            state.active -= 1;
        } else {
            if state.pending == 0 {
                fatal_invariant!(
                    active = state.active,
                    "closing: pending counter would underflow"
                );
            }
            state.pending -= 1;
        }
    }

    /// One periodic wake-up: scavenge, check for completion, refill.
    /// Returns true once the done event has been signalled.
    fn on_wakeup(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock().expect("broker lock poisoned");
        state.pool.retain(|slot| !slot.is_closed());

        let drained = state.total_remaining == 0 && state.pending == 0 && state.active == 0;
        let cancelled_and_idle = self.cancelled.load(Ordering::SeqCst)
            && state.pending == 0
            && state.active == 0;
        if drained || cancelled_and_idle {
            debug!("work drained; signalling done");
            let _ = self.done_tx.send(true);
            return true;
        }

        self.refill(&mut state);
        false
    }

    fn start_wakeup_task(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WAKEUP_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(broker) = weak.upgrade() else { break };
                if broker.on_wakeup() {
                    break;
                }
            }
        });
    }

    fn start_status_task(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.ctx.config.status_period;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(broker) = weak.upgrade() else { break };
                broker
                    .ctx
                    .sinks
                    .status
                    .log_message(&broker.ctx.run_stats.status_row());
                if *broker.done_tx.borrow() {
                    break;
                }
            }
        });
    }

    fn start_time_limit_task(self: &Arc<Self>) {
        let Some(limit) = self.ctx.config.time_limit else {
            return;
        };
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            if let Some(broker) = weak.upgrade() {
                info!(seconds = limit.as_secs(), "time limit reached");
                broker.cancel();
            }
        });
    }

    /// Signals cancellation: refills stop, sockets close, connections
    /// drain through their normal error paths.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            info!("cancellation requested");
            let _ = self.ctx.shutdown.send(());
        }
    }

    /// Blocks until the done event, the cancel event, or the timeout.
    pub async fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        let mut done_rx = self.done_tx.subscribe();
        let mut cancel_rx = self.ctx.shutdown.subscribe();

        let wait_events = async {
            tokio::select! {
                changed = done_rx.wait_for(|done| *done) => match changed {
                    Ok(_) => WaitOutcome::Done,
                    Err(_) => WaitOutcome::Failed,
                },
                _ = cancel_rx.recv() => WaitOutcome::Cancelled,
            }
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait_events)
                .await
                .unwrap_or(WaitOutcome::TimedOut),
            None => wait_events.await,
        }
    }

    pub fn run_stats(&self) -> Arc<RunStats> {
        self.ctx.run_stats.clone()
    }

    /// Aggregate exit code over every connection result.
    pub fn exit_code(&self) -> i32 {
        self.ctx.run_stats.exit_code()
    }

    /// Current (pending, active) counters; test observability.
    pub fn counters(&self) -> (u32, u32) {
        let state = self.state.lock().expect("broker lock poisoned");
        (state.pending, state.active)
    }

    /// Listener endpoints a server broker actually bound.
    pub fn local_endpoints(&self) -> Vec<crate::net::Endpoint> {
        let mut endpoints: Vec<crate::net::Endpoint> = self
            .tcp_listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .map(crate::net::Endpoint::from)
            .collect();
        if let Some(media) = &self.media_listener {
            endpoints.push(media.local_endpoint());
        }
        endpoints
    }
}
