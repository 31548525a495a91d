use crate::config::{Config, OptionFlags};
use crate::net::Endpoint;
use crate::Result;
use async_trait::async_trait;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, warn};

/// Receive buffer applied when the max-recv-buf option is set.
const MAX_RECV_BUF_BYTES: usize = 0x400000;

/// How sockets are created, optioned, bound, and connected
///
/// The connection state machine only talks to this trait; tests swap in
/// factories that fail or misbehave on demand.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    /// Creates a bound stream socket and connects it to `target`.
    async fn connect_stream(&self, target: Endpoint) -> Result<TcpStream>;

    /// Creates a listening stream socket on `listen`.
    async fn listen_stream(&self, listen: Endpoint, backlog: u32) -> Result<TcpListener>;

    /// Creates a bound datagram socket appropriate for reaching `peer`.
    async fn bind_datagram(&self, peer: Endpoint) -> Result<UdpSocket>;

    /// Creates a datagram socket bound exactly on `listen`.
    async fn listen_datagram(&self, listen: Endpoint) -> Result<UdpSocket>;
}

/// The production factory: socket2 sockets with the configured options
/// applied before bind, converted into tokio sockets.
///
/// Client binds rotate round-robin across the configured bind addresses
/// and walk the configured local port range; option setters are
/// idempotent, so re-applying them on a retried bind is harmless.
pub struct NetSocketFactory {
    options: OptionFlags,
    bind_addresses: Vec<IpAddr>,
    local_port_range: (u16, u16),
    next_bind: AtomicUsize,
    next_port: AtomicUsize,
}

impl NetSocketFactory {
    pub fn new(config: &Config) -> Self {
        if config.options.loopback_fast_path {
            // Completion-port loopback acceleration has no equivalent here.
            warn!("loopback fast path is not supported on this platform; ignored");
        }
        Self {
            options: config.options,
            bind_addresses: config.bind_addresses.clone(),
            local_port_range: config.local_port_range,
            next_bind: AtomicUsize::new(0),
            next_port: AtomicUsize::new(0),
        }
    }

    fn apply_pre_bind_options(&self, socket: &Socket) -> std::io::Result<()> {
        socket.set_reuse_address(true)?;
        if self.options.keepalive {
            socket.set_keepalive(true)?;
        }
        if self.options.max_recv_buf {
            socket.set_recv_buffer_size(MAX_RECV_BUF_BYTES)?;
        }
        Ok(())
    }

    /// Local address for the next outgoing socket: the next configured
    /// bind address (family-matched to the target) and the next port in
    /// the configured range.
    fn next_local_addr(&self, target: Endpoint, port: u16) -> SocketAddr {
        let candidates: Vec<&IpAddr> = self
            .bind_addresses
            .iter()
            .filter(|ip| ip.is_ipv6() == target.is_ipv6())
            .collect();
        let ip = if candidates.is_empty() {
            if target.is_ipv6() {
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            } else {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            }
        } else {
            let index = self.next_bind.fetch_add(1, Ordering::Relaxed);
            *candidates[index % candidates.len()]
        };
        SocketAddr::new(ip, port)
    }

    fn next_local_port(&self) -> u16 {
        let (low, high) = self.local_port_range;
        if low == 0 {
            return 0;
        }
        let span = (high - low) as usize + 1;
        let index = self.next_port.fetch_add(1, Ordering::Relaxed);
        low + (index % span) as u16
    }

    fn new_socket(&self, target: Endpoint, kind: Type) -> std::io::Result<Socket> {
        let domain = if target.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let proto = match kind {
            t if t == Type::STREAM => SockProtocol::TCP,
            _ => SockProtocol::UDP,
        };
        let socket = Socket::new(domain, kind, Some(proto))?;
        self.apply_pre_bind_options(&socket)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    fn bind_walking_ports(&self, socket: &Socket, target: Endpoint) -> std::io::Result<SocketAddr> {
        let (low, high) = self.local_port_range;
        // One attempt per port in the range, or a single ephemeral bind.
        let attempts = if low == 0 { 1 } else { (high - low) as usize + 1 };
        let mut last_err = None;
        for _ in 0..attempts {
            let local = self.next_local_addr(target, self.next_local_port());
            match socket.bind(&local.into()) {
                Ok(()) => return Ok(local),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| std::io::ErrorKind::AddrInUse.into()))
    }
}

#[async_trait]
impl SocketFactory for NetSocketFactory {
    async fn connect_stream(&self, target: Endpoint) -> Result<TcpStream> {
        let socket = self.new_socket(target, Type::STREAM)?;
        let local = self.bind_walking_ports(&socket, target)?;
        debug!(%local, %target, "bound outgoing socket");

        let socket = tokio::net::TcpSocket::from_std_stream(socket.into());
        let stream = socket.connect(target.addr()).await?;
        Ok(stream)
    }

    async fn listen_stream(&self, listen: Endpoint, backlog: u32) -> Result<TcpListener> {
        let socket = self.new_socket(listen, Type::STREAM)?;
        socket.bind(&listen.addr().into())?;
        socket.listen(backlog as i32)?;
        let listener = TcpListener::from_std(socket.into())?;
        Ok(listener)
    }

    async fn bind_datagram(&self, peer: Endpoint) -> Result<UdpSocket> {
        let socket = self.new_socket(peer, Type::DGRAM)?;
        let local = self.bind_walking_ports(&socket, peer)?;
        debug!(%local, "bound datagram socket");
        let socket = UdpSocket::from_std(socket.into())?;
        Ok(socket)
    }

    async fn listen_datagram(&self, listen: Endpoint) -> Result<UdpSocket> {
        let socket = self.new_socket(listen, Type::DGRAM)?;
        socket.bind(&listen.addr().into())?;
        let socket = UdpSocket::from_std(socket.into())?;
        Ok(socket)
    }
}
