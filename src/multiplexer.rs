use std::collections::VecDeque;
use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use rustc_hash::FxHashMap;
use socket2::SockRef;
use tracing::{debug, error, info, trace, warn};
use crate::error::TransportError;
use crate::framing::FrameMagic;
use crate::inbound::{InboundState, ReadContext, ReadOutcome, Teardown};
use crate::log_throttle::LogThrottle;
use crate::registry::ConnectionRegistry;
use crate::socket_options::SocketOptions;

const WAKER_TOKEN: Token = Token(0);
const LISTENER_TOKEN: Token = Token(1);
const FIRST_CONNECTION_TOKEN: usize = 2;

/// how long to wait before retrying to accept after a failure that leaves connections in the
///  backlog, e.g. running out of file descriptors
const ACCEPT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Requests from other threads that must be executed by the thread running the receive loop
pub enum Registration {
    /// the listener, together with the options to apply to the connections it accepts
    Listener(TcpListener, SocketOptions),
}

/// Per-call settings of the receive loop that belong to the transport rather than the loop
pub struct LoopContext<'a> {
    pub frame_magic: FrameMagic,
    pub max_packet_len: usize,
    pub tolerate_zero_probe: bool,
    pub advance_frequency: usize,
    pub registry: &'a ConnectionRegistry,
    pub closing: &'a AtomicBool,
}

impl LoopContext<'_> {
    fn read_context(&self) -> ReadContext {
        ReadContext {
            frame_magic: self.frame_magic,
            max_packet_len: self.max_packet_len,
            tolerate_zero_probe: self.tolerate_zero_probe,
            registry: self.registry,
        }
    }
}

struct InboundConnection {
    stream: TcpStream,
    remote_addr: SocketAddr,
    state: InboundState,
    /// `true` while the connection is in the ready queue or is the current connection, i.e.
    ///  until a read would block
    queued: bool,
}

/// The receive side of the transport: a single poll loop serving the listener and all accepted
///  connections.
///
/// Readiness is edge-triggered, so a connection that was reported readable stays in the ready
///  queue until reading from it would block. The queue survives between calls to `receive()`,
///  which returns as soon as a single packet is complete.
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    registrations: Receiver<Registration>,

    listener: Option<TcpListener>,
    connections: FxHashMap<Token, InboundConnection>,
    next_token: usize,

    ready: VecDeque<Token>,
    /// the connection the last packet was read from, and the number of packets consecutively
    ///  read from it
    current: Option<(Token, usize)>,
    /// set when a connection was moved to the back of the ready queue: other connections may
    ///  have become readable in the meantime, so readiness must be polled before going on
    poll_due: bool,
    /// accepting failed with connections left in the backlog, which produces no new readiness
    ///  event
    accept_pending: bool,

    socket_options: SocketOptions,
    initial_body_buffer_size: usize,
    log_throttle: LogThrottle,
}

impl Multiplexer {
    /// Create a multiplexer for `poll`, returning it together with the waker for interrupting a
    ///  blocked `receive()`
    pub fn new(
        poll: Poll,
        registrations: Receiver<Registration>,
        poll_capacity: usize,
        initial_body_buffer_size: usize,
        protocol_warning_interval: Duration,
    ) -> io::Result<(Multiplexer, Waker)> {
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let multiplexer = Multiplexer {
            poll,
            events: Events::with_capacity(poll_capacity),
            registrations,
            listener: None,
            connections: FxHashMap::default(),
            next_token: FIRST_CONNECTION_TOKEN,
            ready: VecDeque::new(),
            current: None,
            poll_due: false,
            accept_pending: false,
            socket_options: SocketOptions::default(),
            initial_body_buffer_size,
            log_throttle: LogThrottle::new(protocol_warning_interval),
        };
        Ok((multiplexer, waker))
    }

    pub fn num_connections(&self) -> usize {
        self.connections.len()
    }

    /// Block until the next packet is complete, copying it to `buf`. Fails with `Timeout` if
    ///  `timeout` passes without a packet, and with `Closed` once the transport is closing.
    pub fn receive(&mut self, buf: &mut [u8], ctx: &LoopContext, timeout: Option<Duration>) -> Result<(usize, SocketAddr), TransportError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if ctx.closing.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            self.drain_registrations();
            if self.accept_pending {
                self.accept_all();
            }
            if self.poll_due {
                self.poll_due = false;
                self.poll_events(Some(Duration::ZERO))?;
            }

            if let Some(received) = self.read_ready(buf, ctx) {
                return Ok(received);
            }

            let mut poll_timeout = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TransportError::Timeout);
                    }
                    Some(deadline - now)
                }
            };
            if self.accept_pending {
                poll_timeout = Some(poll_timeout.map_or(ACCEPT_RETRY_INTERVAL, |t| t.min(ACCEPT_RETRY_INTERVAL)));
            }

            self.poll_events(poll_timeout)?;
        }
    }

    /// Wait for readiness events and dispatch them, accepting connections and queueing readable
    ///  connections
    fn poll_events(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(e) => {
                error!("error polling for readiness: {}", e);
                return Err(e.into());
            }
        }

        let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
        for token in tokens {
            match token {
                WAKER_TOKEN => trace!("woken up"),
                LISTENER_TOKEN => self.accept_all(),
                token => self.mark_ready(token),
            }
        }
        Ok(())
    }

    fn mark_ready(&mut self, token: Token) {
        if let Some(conn) = self.connections.get_mut(&token) {
            if !conn.queued {
                conn.queued = true;
                self.ready.push_back(token);
            }
        }
    }

    /// Read from ready connections until a packet is complete or there are no more ready
    ///  connections
    fn read_ready(&mut self, buf: &mut [u8], ctx: &LoopContext) -> Option<(usize, SocketAddr)> {
        let read_ctx = ctx.read_context();

        loop {
            let (token, num_consecutive) = match self.current {
                Some(current) => current,
                None => (self.ready.pop_front()?, 0),
            };

            let Some(conn) = self.connections.get_mut(&token) else {
                self.current = None;
                continue;
            };

            match conn.state.on_read(&mut conn.stream, buf, &read_ctx) {
                ReadOutcome::Packet(len) => {
                    let sender = conn.state.peer_addr().unwrap_or(conn.remote_addr);
                    trace!("received packet of length {} from {:?}", len, sender);

                    let num_consecutive = num_consecutive + 1;
                    if num_consecutive >= ctx.advance_frequency {
                        self.current = None;
                        self.ready.push_back(token);
                        self.poll_due = true;
                    }
                    else {
                        self.current = Some((token, num_consecutive));
                    }
                    return Some((len, sender));
                }
                ReadOutcome::WouldBlock => {
                    conn.queued = false;
                    self.current = None;
                }
                ReadOutcome::Teardown(reason) => {
                    self.current = None;
                    self.teardown(token, reason, ctx.registry);
                }
            }
        }
    }

    fn teardown(&mut self, token: Token, reason: Teardown, registry: &ConnectionRegistry) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        self.ready.retain(|t| *t != token);

        if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
            debug!("error deregistering inbound connection from {:?}: {}", conn.remote_addr, e);
        }

        let peer_addr = conn.state.peer_addr();
        match &reason {
            Teardown::EndOfStream => debug!("inbound connection from {:?} ({:?}) closed by peer after {} packets", conn.remote_addr, peer_addr, conn.state.rx_count()),
            Teardown::Io(e) => debug!("I/O error on inbound connection from {:?} ({:?}) in state {:?}: {}", conn.remote_addr, peer_addr, conn.state.state(), e),
            Teardown::Violation { .. } => {
                if self.log_throttle.should_log(conn.remote_addr.ip(), Instant::now()) {
                    warn!("rejecting inbound connection from {:?}: {:?} - misconfigured peer or not a peer at all", conn.remote_addr, reason);
                }
            }
            Teardown::Corrupted(_) => info!("closing inbound connection from {:?} ({:?}): {:?}", conn.remote_addr, peer_addr, reason),
        }

        // the peer either went away or is out of sync, so our connection to it is likely
        //  broken as well: drop it, and let the next send reconnect
        let outbound = conn.state.take_outbound()
            .or_else(|| peer_addr.and_then(|addr| registry.get(&addr)));
        if let Some(outbound) = outbound {
            if registry.remove(&outbound) {
                debug!("removed outbound connection to {:?}", outbound.peer_addr());
            }
            outbound.shutdown();
        }
    }

    fn drain_registrations(&mut self) {
        while let Ok(registration) = self.registrations.try_recv() {
            match registration {
                Registration::Listener(mut listener, socket_options) => {
                    if let Err(e) = self.poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE) {
                        error!("error registering listener: {}", e);
                        continue;
                    }
                    self.listener = Some(listener);
                    self.socket_options = socket_options;
                    self.accept_all();
                }
            }
        }
    }

    fn accept_all(&mut self) {
        loop {
            let Some(listener) = &self.listener else {
                return;
            };

            let (mut stream, remote_addr) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.accept_pending = false;
                    return;
                }
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted) => {
                    debug!("transient error accepting connection: {}", e);
                    continue;
                }
                Err(e) => {
                    if !self.accept_pending {
                        error!("error accepting connection - retrying in {:?}: {}", ACCEPT_RETRY_INTERVAL, e);
                    }
                    self.accept_pending = true;
                    return;
                }
            };

            if let Err(e) = self.socket_options.apply_to_stream(&SockRef::from(&stream)) {
                debug!("error applying socket options to connection from {:?} - dropping it: {}", remote_addr, e);
                continue;
            }

            let token = Token(self.next_token);
            self.next_token += 1;
            if let Err(e) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
                debug!("error registering connection from {:?} - dropping it: {}", remote_addr, e);
                continue;
            }

            self.connections.insert(token, InboundConnection {
                stream,
                remote_addr,
                state: InboundState::new(remote_addr.ip(), self.initial_body_buffer_size),
                queued: true,
            });
            // data may have arrived before registration
            self.ready.push_back(token);
            debug!("accepted connection from {:?} - {} inbound connections", remote_addr, self.num_connections());
        }
    }

    /// Close all accepted connections and the listener
    pub fn close(&mut self) {
        self.ready.clear();
        self.current = None;
        self.poll_due = false;
        self.accept_pending = false;

        for (_, mut conn) in self.connections.drain() {
            if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
                debug!("error deregistering inbound connection from {:?}: {}", conn.remote_addr, e);
            }
            if let Err(e) = conn.stream.shutdown(std::net::Shutdown::Both) {
                debug!("error shutting down inbound connection from {:?}: {}", conn.remote_addr, e);
            }
        }

        // a listener may still be in flight from a concurrent bind
        while let Ok(Registration::Listener(listener, _)) = self.registrations.try_recv() {
            drop(listener);
        }
        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = self.poll.registry().deregister(&mut listener) {
                debug!("error deregistering listener: {}", e);
            }
        }
        debug!("closed multiplexer");
    }
}
