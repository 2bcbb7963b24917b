use std::fmt::{Display, Formatter};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use mio::Waker;
use rustc_hash::FxHashMap;
use tracing::{debug, info};
use crate::config::TcpDatagramConfig;
use crate::error::{Result, TransportError};
use crate::framing::{FrameMagic, Handshake};
use crate::multiplexer::{LoopContext, Multiplexer, Registration};
use crate::provider::{DefaultSocketProvider, SocketProvider};
use crate::registry::{ConnectionRegistry, OutboundConnection, WriteError};
use crate::socket_options::{OptionValue, SocketOptionId, SocketOptions};

/// The settings that can be changed after creating the socket
struct Settings {
    frame_magic: FrameMagic,
    listen_backlog: i32,
    socket_options: SocketOptions,
    so_timeout: Option<Duration>,
    /// options that are stored for the caller's benefit but have no effect
    other_options: FxHashMap<SocketOptionId, OptionValue>,
}

/// A datagram socket on top of TCP: packets are sent over lazily created per-peer connections,
///  and received through a single listening socket that accepts connections from all peers.
///
/// Like a UDP socket, this socket gives no guarantees of delivery, and problems with individual
///  peers are not reported to the caller. A connection that fails is dropped (together with the
///  packet that was being sent), and the next packet to the same peer opens a new connection.
///
/// `send()` may be called concurrently from any number of threads, sends to different peers
///  not contending at all. `receive()` can be called from several threads as well, but only one
///  of them is actually receiving at any time.
pub struct TcpDatagramSocket {
    provider: Arc<dyn SocketProvider>,
    default_bind_addr: SocketAddr,
    connect_timeout: Option<Duration>,
    max_packet_len: usize,
    tolerate_zero_probe: bool,

    settings: RwLock<Settings>,
    advance_frequency: AtomicUsize,

    /// the bound address; the lock serializes binding
    local_addr: Mutex<Option<SocketAddr>>,
    closing: AtomicBool,

    registry: ConnectionRegistry,
    registrations: Sender<Registration>,
    waker: Waker,
    multiplexer: Mutex<Multiplexer>,
}

impl TcpDatagramSocket {
    pub fn new(config: TcpDatagramConfig) -> anyhow::Result<TcpDatagramSocket> {
        Self::with_provider(config, Arc::new(DefaultSocketProvider))
    }

    pub fn with_provider(config: TcpDatagramConfig, provider: Arc<dyn SocketProvider>) -> anyhow::Result<TcpDatagramSocket> {
        config.validate()?;
        let so_timeout = config.effective_so_timeout();

        let (registrations, registration_receiver) = channel();
        let (multiplexer, waker) = Multiplexer::new(
            provider.open_poll()?,
            registration_receiver,
            config.poll_capacity,
            config.initial_body_buffer_size,
            config.protocol_warning_interval,
        )?;

        Ok(TcpDatagramSocket {
            provider,
            default_bind_addr: config.default_bind_addr,
            connect_timeout: config.connect_timeout,
            max_packet_len: config.max_packet_len,
            tolerate_zero_probe: config.tolerate_zero_probe,
            settings: RwLock::new(Settings {
                frame_magic: config.frame_magic,
                listen_backlog: config.listen_backlog,
                socket_options: config.socket_options,
                so_timeout,
                other_options: FxHashMap::default(),
            }),
            advance_frequency: AtomicUsize::new(config.advance_frequency.max(1)),
            local_addr: Mutex::new(None),
            closing: AtomicBool::new(false),
            registry: ConnectionRegistry::default(),
            registrations,
            waker,
            multiplexer: Mutex::new(multiplexer),
        })
    }

    /// Open the listening socket that receives packets from all peers
    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        let mut local_addr = self.local_addr.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if local_addr.is_some() {
            return Err(TransportError::AlreadyBound);
        }

        let (listener, socket_options) = {
            let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
            let listener = self.provider.open_listener(addr, settings.listen_backlog, &settings.socket_options)
                .map_err(TransportError::Bind)?;
            (listener, settings.socket_options.clone())
        };
        let bound_addr = listener.local_addr().map_err(TransportError::Bind)?;

        // the receiving side owns the multiplexer's receiver for as long as this socket exists
        self.registrations.send(Registration::Listener(listener, socket_options))
            .map_err(|_| TransportError::Closed)?;
        self.waker.wake()?;

        *local_addr = Some(bound_addr);
        info!("bound to {:?}", bound_addr);
        Ok(())
    }

    /// bind to the default address if the socket is not bound yet
    fn ensure_bound(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        match self.bind(self.default_bind_addr) {
            Ok(()) | Err(TransportError::AlreadyBound) => {}
            Err(e) => return Err(e),
        }
        self.local_addr().ok_or(TransportError::Closed)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_bound(&self) -> bool {
        self.local_addr().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Send a packet to a peer's listening address, connecting to the peer if necessary.
    ///
    /// Failure to connect or to write the packet is not reported: the packet is dropped, as it
    ///  would be by a UDP socket. Packets that can not be represented in the configured frame
    ///  format however are rejected with an error.
    pub fn send(&self, packet: &[u8], to: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let local_addr = self.ensure_bound()?;
        let frame_magic = self.frame_magic();

        let conn = match self.registry.ensure_connection(to, || self.connect(to, local_addr.port(), frame_magic)) {
            Ok(conn) => conn,
            Err(e) => {
                debug!("error connecting to {:?} - dropping packet: {}", to, e);
                return Ok(());
            }
        };

        if self.is_closed() {
            // close() drained the registry before we registered this connection
            self.discard(&conn);
            return Err(TransportError::Closed);
        }

        match conn.write_packet(&frame_magic, packet) {
            Ok(()) => Ok(()),
            Err(WriteError::Encode(e)) => Err(e),
            Err(WriteError::Io(e)) => {
                debug!("error sending to {:?} - dropping packet and connection: {}", to, e);
                self.discard(&conn);
                Ok(())
            }
        }
    }

    fn connect(&self, to: SocketAddr, return_port: u16, frame_magic: FrameMagic) -> io::Result<OutboundConnection> {
        let socket_options = self.settings.read().unwrap_or_else(PoisonError::into_inner)
            .socket_options
            .clone();
        let stream = self.provider.open_stream(to, &socket_options, self.connect_timeout)?;
        debug!("opened connection to {:?}", to);

        OutboundConnection::new(to, stream, Handshake { frame_magic, return_port })
    }

    fn discard(&self, conn: &Arc<OutboundConnection>) {
        self.registry.remove(conn);
        conn.shutdown();
    }

    /// Wait for the next packet from any peer, copying it to `buf` and returning its length and
    ///  the sender's address. Packets longer than `buf` are truncated.
    ///
    /// Fails with `Timeout` if SO_TIMEOUT is set and no packet arrives in time, and with `Closed`
    ///  if the socket is closed, including while waiting.
    pub fn receive(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.ensure_bound()?;

        let (frame_magic, timeout) = {
            let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
            (settings.frame_magic, settings.so_timeout.filter(|t| !t.is_zero()))
        };
        let ctx = LoopContext {
            frame_magic,
            max_packet_len: self.max_packet_len,
            tolerate_zero_probe: self.tolerate_zero_probe,
            advance_frequency: self.advance_frequency(),
            registry: &self.registry,
            closing: &self.closing,
        };

        self.multiplexer.lock().unwrap_or_else(PoisonError::into_inner)
            .receive(buf, &ctx, timeout)
    }

    /// Close the socket and all its connections. A thread blocked in `receive()` returns with
    ///  `Closed`.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        for conn in self.registry.drain() {
            conn.shutdown();
        }

        if let Err(e) = self.waker.wake() {
            debug!("error waking the receive loop: {}", e);
        }
        // this waits for a concurrent receive() to return
        self.multiplexer.lock().unwrap_or_else(PoisonError::into_inner)
            .close();

        info!("closed {}", self);
    }

    pub fn frame_magic(&self) -> FrameMagic {
        self.settings.read().unwrap_or_else(PoisonError::into_inner).frame_magic
    }

    /// Configure the frame magic. All peers must use the same frame magic, see
    ///  [crate::framing::FrameVariant] for the trade-offs between masks.
    pub fn set_frame_magic(&self, magic: u32, mask: u32) -> Result<()> {
        self.update_unbound(|settings| settings.frame_magic = FrameMagic::new(magic, mask))
    }

    pub fn advance_frequency(&self) -> usize {
        self.advance_frequency.load(Ordering::Relaxed)
    }

    /// The number of packets read consecutively from a single connection before moving on to
    ///  other connections, at least 1
    pub fn set_advance_frequency(&self, advance_frequency: usize) {
        self.advance_frequency.store(advance_frequency.max(1), Ordering::Relaxed);
    }

    pub fn set_listen_backlog(&self, backlog: i32) -> Result<()> {
        self.update_unbound(|settings| settings.listen_backlog = backlog)
    }

    /// Add TCP options for all sockets opened by this socket
    pub fn set_socket_options(&self, options: &SocketOptions) -> Result<()> {
        self.update_unbound(|settings| settings.socket_options.merge(options))
    }

    fn update_unbound(&self, f: impl FnOnce(&mut Settings)) -> Result<()> {
        // binding holds this lock for its entire duration
        let local_addr = self.local_addr.lock().unwrap_or_else(PoisonError::into_inner);
        if local_addr.is_some() {
            return Err(TransportError::AlreadyBound);
        }
        f(&mut self.settings.write().unwrap_or_else(PoisonError::into_inner));
        Ok(())
    }

    pub fn set_option(&self, id: SocketOptionId, value: OptionValue) -> Result<()> {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        match (id, value) {
            (SocketOptionId::SoTimeout, OptionValue::Timeout(timeout)) => settings.so_timeout = timeout,
            (SocketOptionId::SoTimeout, _) => return Err(TransportError::InvalidOption("SO_TIMEOUT")),
            (SocketOptionId::SoBindAddr, _) => return Err(TransportError::Unsupported("setting SO_BINDADDR - use bind()")),
            (id, value) => {
                settings.other_options.insert(id, value);
            }
        }
        Ok(())
    }

    pub fn get_option(&self, id: SocketOptionId) -> Option<OptionValue> {
        match id {
            SocketOptionId::SoTimeout => Some(OptionValue::Timeout(self.settings.read().unwrap_or_else(PoisonError::into_inner).so_timeout)),
            SocketOptionId::SoBindAddr => Some(OptionValue::Addr(self.local_addr())),
            id => self.settings.read().unwrap_or_else(PoisonError::into_inner)
                .other_options
                .get(&id)
                .cloned(),
        }
    }

    pub fn set_time_to_live(&self, _ttl: u32) -> Result<()> {
        Err(TransportError::Unsupported("time to live"))
    }

    pub fn time_to_live(&self) -> Result<u32> {
        Err(TransportError::Unsupported("time to live"))
    }

    pub fn join_group(&self, _group: IpAddr) -> Result<()> {
        Err(TransportError::Unsupported("multicast"))
    }

    pub fn leave_group(&self, _group: IpAddr) -> Result<()> {
        Err(TransportError::Unsupported("multicast"))
    }
}

impl Display for TcpDatagramSocket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.local_addr() {
            Some(addr) => write!(f, "TcpDatagramSocket{{bind={}}}", addr),
            None => write!(f, "TcpDatagramSocket{{bind=unbound}}"),
        }
    }
}

impl Drop for TcpDatagramSocket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::thread;
    use std::time::Instant;
    use rstest::rstest;

    const MAGIC: u32 = 0xCAFE_BABE;
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn bound_socket(mask: u32) -> TcpDatagramSocket {
        let socket = TcpDatagramSocket::new(TcpDatagramConfig {
            frame_magic: FrameMagic::new(MAGIC, mask),
            so_timeout: Some(TIMEOUT),
            ..Default::default()
        }).unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        socket
    }

    fn addr(socket: &TcpDatagramSocket) -> SocketAddr {
        socket.local_addr().unwrap()
    }

    fn receive(socket: &TcpDatagramSocket) -> (Vec<u8>, SocketAddr) {
        let mut buf = [0u8; 1024];
        let (len, sender) = socket.receive(&mut buf).unwrap();
        (buf[..len].to_vec(), sender)
    }

    /// a packet starting with the frame magic
    fn packet(payload: &[u8]) -> Vec<u8> {
        let mut result = MAGIC.to_be_bytes().to_vec();
        result.extend_from_slice(payload);
        result
    }

    #[rstest]
    #[case::short(FrameMagic::MASK_SHORT)]
    #[case::trint(FrameMagic::MASK_TRINT)]
    #[case::trint_counter(FrameMagic::MASK_TRINT_COUNTER)]
    #[case::full(FrameMagic::MASK_FULL)]
    #[case::fallback(0)]
    fn test_ping_pong(#[case] mask: u32) {
        let a = bound_socket(mask);
        let b = bound_socket(mask);

        a.send(&packet(b"PING"), addr(&b)).unwrap();
        let (received, sender) = receive(&b);
        assert_eq!(received, packet(b"PING"));
        assert_eq!(sender, addr(&a));

        b.send(&packet(b"PONG"), sender).unwrap();
        assert_eq!(receive(&a), (packet(b"PONG"), addr(&b)));

        // both directions reuse their connections
        for i in 0..20u8 {
            a.send(&packet(&[i]), addr(&b)).unwrap();
        }
        for i in 0..20u8 {
            assert_eq!(receive(&b), (packet(&[i]), addr(&a)));
        }
        assert_eq!(a.registry.len(), 1);
        assert_eq!(b.registry.len(), 1);
    }

    #[test]
    fn test_concurrent_peers() {
        let receiver = bound_socket(FrameMagic::MASK_TRINT_COUNTER);
        let a = bound_socket(FrameMagic::MASK_TRINT_COUNTER);
        let b = bound_socket(FrameMagic::MASK_TRINT_COUNTER);
        let to = addr(&receiver);

        thread::scope(|s| {
            s.spawn(|| for _ in 0..50 { a.send(&packet(b"a"), to).unwrap() });
            s.spawn(|| for _ in 0..50 { b.send(&packet(b"b"), to).unwrap() });
        });

        let mut from_a = 0;
        let mut from_b = 0;
        for _ in 0..100 {
            let (received, sender) = receive(&receiver);
            if sender == addr(&a) {
                assert_eq!(received, packet(b"a"));
                from_a += 1;
            }
            else {
                assert_eq!(sender, addr(&b));
                assert_eq!(received, packet(b"b"));
                from_b += 1;
            }
        }
        assert_eq!((from_a, from_b), (50, 50));
    }

    #[test]
    fn test_concurrent_senders_share_connection() {
        let receiver = bound_socket(FrameMagic::MASK_TRINT_COUNTER);
        let sender = bound_socket(FrameMagic::MASK_TRINT_COUNTER);
        let to = addr(&receiver);

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| for _ in 0..25 { sender.send(&packet(b"x"), to).unwrap() });
            }
        });
        for _ in 0..100 {
            assert_eq!(receive(&receiver), (packet(b"x"), addr(&sender)));
        }
        assert_eq!(sender.registry.len(), 1);
    }

    #[test]
    fn test_truncation() {
        let a = bound_socket(0);
        let b = bound_socket(0);
        a.send(b"0123456789", addr(&b)).unwrap();
        a.send(b"abc", addr(&b)).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(b.receive(&mut buf).unwrap(), (4, addr(&a)));
        assert_eq!(&buf, b"0123");
        assert_eq!(b.receive(&mut buf).unwrap(), (3, addr(&a)));
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn test_lazy_bind() {
        let receiver = bound_socket(0);
        let sender = TcpDatagramSocket::new(TcpDatagramConfig::default()).unwrap();
        assert!(!sender.is_bound());

        sender.send(b"hello", addr(&receiver)).unwrap();
        assert!(sender.is_bound());

        let (received, from) = receive(&receiver);
        assert_eq!(received, b"hello");
        assert_eq!(from.port(), addr(&sender).port());
    }

    #[test]
    fn test_timeout() {
        let socket = bound_socket(0);
        socket.set_option(SocketOptionId::SoTimeout, OptionValue::Timeout(Some(Duration::from_millis(100)))).unwrap();

        let start = Instant::now();
        let result = socket.receive(&mut [0u8; 16]);
        assert!(matches!(result, Err(TransportError::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(100));

        // the socket is still usable
        let peer = bound_socket(0);
        peer.send(b"late", addr(&socket)).unwrap();
        socket.set_option(SocketOptionId::SoTimeout, OptionValue::Timeout(Some(TIMEOUT))).unwrap();
        assert_eq!(receive(&socket), (b"late".to_vec(), addr(&peer)));
    }

    #[test]
    fn test_close_unblocks_receive() {
        let socket = Arc::new(bound_socket(0));
        socket.set_option(SocketOptionId::SoTimeout, OptionValue::Timeout(None)).unwrap();

        let receiving = {
            let socket = socket.clone();
            thread::spawn(move || socket.receive(&mut [0u8; 16]))
        };
        thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        socket.close();
        let result = receiving.join().unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(start.elapsed() < Duration::from_secs(2));

        socket.close();
        assert!(socket.is_closed());
    }

    #[test]
    fn test_closed_socket() {
        let a = bound_socket(0);
        let b = bound_socket(0);
        a.send(b"x", addr(&b)).unwrap();
        receive(&b);

        a.close();
        assert!(a.registry.is_empty());
        assert!(matches!(a.send(b"x", addr(&b)), Err(TransportError::Closed)));
        assert!(matches!(a.receive(&mut [0u8; 16]), Err(TransportError::Closed)));
        assert!(matches!(a.bind("127.0.0.1:0".parse().unwrap()), Err(TransportError::Closed)));
    }

    #[test]
    fn test_corrupted_stream_reconnects() {
        let a = bound_socket(FrameMagic::MASK_TRINT_COUNTER);
        let b = bound_socket(FrameMagic::MASK_TRINT_COUNTER);

        b.send(&packet(b"1"), addr(&a)).unwrap();
        assert_eq!(receive(&a), (packet(b"1"), addr(&b)));
        assert_eq!(b.registry.len(), 1);

        // a connection impersonating `a`, with a broken packet counter
        let mut rogue = std::net::TcpStream::connect(addr(&b)).unwrap();
        let mut wire = Vec::new();
        Handshake { frame_magic: b.frame_magic(), return_port: addr(&a).port() }.ser(&mut wire);
        b.frame_magic().encode_prefix(&packet(b"2"), 3, &mut wire).unwrap();
        wire.extend_from_slice(b"2");
        rogue.write_all(&wire).unwrap();

        b.set_option(SocketOptionId::SoTimeout, OptionValue::Timeout(Some(Duration::from_millis(200)))).unwrap();
        assert!(matches!(b.receive(&mut [0u8; 16]), Err(TransportError::Timeout)));
        assert!(b.registry.is_empty());

        b.send(&packet(b"3"), addr(&a)).unwrap();
        assert_eq!(receive(&a), (packet(b"3"), addr(&b)));
    }

    #[test]
    fn test_send_to_unreachable_peer() {
        let socket = bound_socket(0);
        let unreachable = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        socket.send(b"lost", unreachable).unwrap();
        assert!(socket.registry.is_empty());
    }

    #[test]
    fn test_encode_error_is_reported() {
        let a = bound_socket(FrameMagic::MASK_SHORT);
        let b = bound_socket(FrameMagic::MASK_SHORT);

        assert!(matches!(a.send(&vec![0u8; 70_000], addr(&b)), Err(TransportError::PacketTooLarge { len: 70_000, max: 0xFFFF })));
        assert!(matches!(a.send(&[1, 2], addr(&b)), Err(TransportError::PacketTooShort { len: 2 })));

        a.send(&packet(b"ok"), addr(&b)).unwrap();
        assert_eq!(receive(&b), (packet(b"ok"), addr(&a)));
    }

    #[test]
    fn test_mismatched_frame_magic() {
        let a = bound_socket(FrameMagic::MASK_FULL);
        let b = bound_socket(FrameMagic::MASK_TRINT);
        b.set_option(SocketOptionId::SoTimeout, OptionValue::Timeout(Some(Duration::from_millis(200)))).unwrap();

        a.send(&packet(b"x"), addr(&b)).unwrap();
        assert!(matches!(b.receive(&mut [0u8; 16]), Err(TransportError::Timeout)));
    }

    #[test]
    fn test_already_bound() {
        let socket = bound_socket(0);
        assert!(matches!(socket.bind("127.0.0.1:0".parse().unwrap()), Err(TransportError::AlreadyBound)));
        assert!(matches!(socket.set_frame_magic(1, FrameMagic::MASK_FULL), Err(TransportError::AlreadyBound)));
        assert!(matches!(socket.set_listen_backlog(5), Err(TransportError::AlreadyBound)));
        assert!(matches!(socket.set_socket_options(&SocketOptions::default()), Err(TransportError::AlreadyBound)));
    }

    #[test]
    fn test_bind_failure() {
        let socket = bound_socket(0);
        let other = TcpDatagramSocket::new(TcpDatagramConfig::default()).unwrap();
        assert!(matches!(other.bind(addr(&socket)), Err(TransportError::Bind(_))));
        assert!(!other.is_bound());
    }

    #[test]
    fn test_settings_before_bind() {
        let socket = TcpDatagramSocket::new(TcpDatagramConfig::default()).unwrap();
        socket.set_frame_magic(0x1234_5678, FrameMagic::MASK_SHORT).unwrap();
        socket.set_listen_backlog(10).unwrap();
        socket.set_socket_options(&SocketOptions { keepalive: Some(true), ..Default::default() }).unwrap();
        assert_eq!(socket.frame_magic(), FrameMagic::new(0x1234_0000, FrameMagic::MASK_SHORT));

        socket.set_advance_frequency(0);
        assert_eq!(socket.advance_frequency(), 1);
        socket.set_advance_frequency(8);
        assert_eq!(socket.advance_frequency(), 8);
    }

    #[test]
    fn test_options() {
        let socket = TcpDatagramSocket::new(TcpDatagramConfig::default()).unwrap();
        assert_eq!(socket.get_option(SocketOptionId::SoBindAddr), Some(OptionValue::Addr(None)));
        assert_eq!(socket.get_option(SocketOptionId::SoTimeout), Some(OptionValue::Timeout(None)));
        assert_eq!(socket.get_option(SocketOptionId::SoRcvBuf), None);

        socket.set_option(SocketOptionId::SoTimeout, OptionValue::Timeout(Some(Duration::from_secs(3)))).unwrap();
        socket.set_option(SocketOptionId::SoRcvBuf, OptionValue::Size(65536)).unwrap();
        assert_eq!(socket.get_option(SocketOptionId::SoTimeout), Some(OptionValue::Timeout(Some(Duration::from_secs(3)))));
        assert_eq!(socket.get_option(SocketOptionId::SoRcvBuf), Some(OptionValue::Size(65536)));

        assert!(matches!(socket.set_option(SocketOptionId::SoTimeout, OptionValue::Flag(true)), Err(TransportError::InvalidOption(_))));
        assert!(matches!(socket.set_option(SocketOptionId::SoBindAddr, OptionValue::Addr(None)), Err(TransportError::Unsupported(_))));

        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_eq!(socket.get_option(SocketOptionId::SoBindAddr), Some(OptionValue::Addr(socket.local_addr())));
    }

    #[test]
    fn test_unsupported() {
        let socket = TcpDatagramSocket::new(TcpDatagramConfig::default()).unwrap();
        let group: IpAddr = "239.1.2.3".parse().unwrap();
        assert!(matches!(socket.set_time_to_live(5), Err(TransportError::Unsupported(_))));
        assert!(matches!(socket.time_to_live(), Err(TransportError::Unsupported(_))));
        assert!(matches!(socket.join_group(group), Err(TransportError::Unsupported(_))));
        assert!(matches!(socket.leave_group(group), Err(TransportError::Unsupported(_))));
    }

    #[test]
    fn test_display() {
        let socket = TcpDatagramSocket::new(TcpDatagramConfig::default()).unwrap();
        assert_eq!(socket.to_string(), "TcpDatagramSocket{bind=unbound}");
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_eq!(socket.to_string(), format!("TcpDatagramSocket{{bind=127.0.0.1:{}}}", addr(&socket).port()));
    }

    #[test]
    fn test_invalid_config() {
        assert!(TcpDatagramSocket::new(TcpDatagramConfig { advance_frequency: 0, ..Default::default() }).is_err());
    }
}
