//! The receiving side of a single accepted connection: a resumable parser that is fed from a
//!  non-blocking socket and turns the byte stream back into packets.

use std::fmt::{Debug, Formatter};
use std::io;
use std::io::{ErrorKind, Read};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, trace};
use crate::framing::{FrameMagic, HEADER_SIZE, PROTOCOL_MAGIC};
use crate::registry::{ConnectionRegistry, OutboundConnection};

/// The parse states of an inbound connection. The handshake states are passed exactly once, in
///  declaration order, after which the connection alternates between `AwaitingHeader` and
///  `AwaitingBody`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseState {
    AwaitingTransportMagic,
    AwaitingFrameMagic,
    AwaitingFrameMask,
    AwaitingReturnPort,
    AwaitingHeader,
    AwaitingBody,
}

/// Why an inbound connection has to be torn down
pub enum Teardown {
    EndOfStream,
    /// the peer does not speak our protocol, or is configured differently
    Violation { state: ParseState, value: u32 },
    /// the stream is out of sync: what should be a frame header is something else
    Corrupted(String),
    Io(io::Error),
}

impl Debug for Teardown {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Teardown::EndOfStream => write!(f, "end of stream"),
            Teardown::Violation { state, value } => write!(f, "unexpected protocol header {:#010x} in state {:?}", value, state),
            Teardown::Corrupted(msg) => write!(f, "corrupted stream: {}", msg),
            Teardown::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

#[derive(Debug)]
pub enum ReadOutcome {
    /// a packet was completed and copied to the destination buffer, with the given length
    Packet(usize),
    /// all available data was consumed without completing a packet
    WouldBlock,
    Teardown(Teardown),
}

/// Settings shared by all inbound connections of a transport
pub struct ReadContext<'a> {
    pub frame_magic: FrameMagic,
    pub max_packet_len: usize,
    pub tolerate_zero_probe: bool,
    pub registry: &'a ConnectionRegistry,
}

pub struct InboundState {
    remote_ip: IpAddr,
    state: ParseState,

    head: [u8; HEADER_SIZE],
    head_pos: usize,

    /// scratch buffer for packet bodies that can not be read into the caller's buffer in one go
    body: Vec<u8>,
    body_pos: usize,
    packet_len: usize,
    /// the packet's first bytes as restored from the frame header, if the frame variant
    ///  overlays the packet
    restored_prefix: Option<[u8; HEADER_SIZE]>,

    rx_count: u32,
    /// the peer's address for sending it packets, i.e. with its listening port
    peer_addr: Option<SocketAddr>,
    /// the outbound connection to the same peer that was registered when the handshake completed
    outbound: Option<Arc<OutboundConnection>>,
}

impl InboundState {
    pub fn new(remote_ip: IpAddr, initial_body_capacity: usize) -> InboundState {
        InboundState {
            remote_ip,
            state: ParseState::AwaitingTransportMagic,
            head: [0; HEADER_SIZE],
            head_pos: 0,
            body: Vec::with_capacity(initial_body_capacity),
            body_pos: 0,
            packet_len: 0,
            restored_prefix: None,
            rx_count: 0,
            peer_addr: None,
            outbound: None,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn rx_count(&self) -> u32 {
        self.rx_count
    }

    pub fn take_outbound(&mut self) -> Option<Arc<OutboundConnection>> {
        self.outbound.take()
    }

    /// Consume data from `stream` until either a packet is complete, the stream would block, or
    ///  the connection turns out to be broken.
    ///
    /// If `dst` is big enough for the packet, the body is read into it directly. Otherwise (or if
    ///  the body arrives in several chunks), it is collected in the connection's scratch buffer and
    ///  copied to `dst` on completion, truncated to `dst`'s length.
    pub fn on_read<R: Read>(&mut self, stream: &mut R, dst: &mut [u8], ctx: &ReadContext) -> ReadOutcome {
        loop {
            if self.state == ParseState::AwaitingBody {
                return self.read_body(stream, dst);
            }

            let value = match self.read_word(stream) {
                Ok(Some(value)) => value,
                Ok(None) => return ReadOutcome::WouldBlock,
                Err(teardown) => return ReadOutcome::Teardown(teardown),
            };

            let violation = ReadOutcome::Teardown(Teardown::Violation { state: self.state, value });
            match self.state {
                ParseState::AwaitingTransportMagic => {
                    if value == PROTOCOL_MAGIC {
                        self.state = ParseState::AwaitingFrameMagic;
                    }
                    else if value == 0 && ctx.tolerate_zero_probe {
                        // keep waiting for the magic: a plain TCP client may monitor our port
                        //  by sending zeros
                        trace!("ignoring zero probe from {}", self.remote_ip);
                    }
                    else {
                        return violation;
                    }
                }
                ParseState::AwaitingFrameMagic => {
                    if value != ctx.frame_magic.magic() {
                        return violation;
                    }
                    self.state = ParseState::AwaitingFrameMask;
                }
                ParseState::AwaitingFrameMask => {
                    if value != ctx.frame_magic.mask() {
                        return violation;
                    }
                    self.state = ParseState::AwaitingReturnPort;
                }
                ParseState::AwaitingReturnPort => {
                    let Ok(port) = u16::try_from(value) else {
                        return violation;
                    };
                    let peer_addr = SocketAddr::new(self.remote_ip, port);
                    debug!("handshake complete for inbound connection from {:?}", peer_addr);
                    self.peer_addr = Some(peer_addr);
                    self.outbound = ctx.registry.get(&peer_addr);
                    self.state = ParseState::AwaitingHeader;
                }
                ParseState::AwaitingHeader => {
                    if let Err(teardown) = self.on_header(ctx) {
                        return ReadOutcome::Teardown(teardown);
                    }
                }
                ParseState::AwaitingBody => unreachable!("handled before reading a word"),
            }
        }
    }

    fn on_header(&mut self, ctx: &ReadContext) -> Result<(), Teardown> {
        let header = ctx.frame_magic.decode_header(self.head);

        if let Some(counter) = header.counter {
            let expected = (self.rx_count & 0x0F) as u8;
            if counter != expected {
                return Err(Teardown::Corrupted(format!(
                    "packet counter {} where {} was expected at packet {}, last packet length {}",
                    counter, expected, self.rx_count, self.packet_len,
                )));
            }
        }

        if header.packet_len > ctx.max_packet_len {
            return Err(Teardown::Corrupted(format!(
                "packet length {} exceeds the maximum of {} at packet {}",
                header.packet_len, ctx.max_packet_len, self.rx_count,
            )));
        }
        if header.restored_prefix.is_some() && header.packet_len < HEADER_SIZE {
            return Err(Teardown::Corrupted(format!(
                "packet length {} is too short to hold the frame magic at packet {}",
                header.packet_len, self.rx_count,
            )));
        }

        self.rx_count = self.rx_count.wrapping_add(1);
        self.packet_len = header.packet_len;
        self.restored_prefix = header.restored_prefix;
        self.body_pos = 0;
        self.state = ParseState::AwaitingBody;
        Ok(())
    }

    fn read_body<R: Read>(&mut self, stream: &mut R, dst: &mut [u8]) -> ReadOutcome {
        let packet_len = self.packet_len;

        if self.body_pos == 0 {
            if dst.len() >= packet_len {
                return self.read_body_direct(stream, &mut dst[..packet_len]);
            }

            self.prepare_scratch();
        }

        match fill(stream, &mut self.body[..packet_len], &mut self.body_pos) {
            Ok(true) => {
                let num_copied = packet_len.min(dst.len());
                dst[..num_copied].copy_from_slice(&self.body[..num_copied]);
                self.finish_packet();
                ReadOutcome::Packet(num_copied)
            }
            Ok(false) => ReadOutcome::WouldBlock,
            Err(teardown) => ReadOutcome::Teardown(teardown),
        }
    }

    /// the zero-copy path: read the body straight into the caller's buffer
    fn read_body_direct<R: Read>(&mut self, stream: &mut R, target: &mut [u8]) -> ReadOutcome {
        let mut pos = 0;
        if let Some(prefix) = self.restored_prefix {
            target[..HEADER_SIZE].copy_from_slice(&prefix);
            pos = HEADER_SIZE;
        }

        match fill(stream, target, &mut pos) {
            Ok(true) => {
                self.finish_packet();
                ReadOutcome::Packet(target.len())
            }
            Ok(false) => {
                // the caller's buffer will be used for some other connection's packet next, so
                //  move what we have to our own buffer
                self.prepare_scratch();
                self.body[..pos].copy_from_slice(&target[..pos]);
                self.body_pos = pos;
                ReadOutcome::WouldBlock
            }
            Err(teardown) => ReadOutcome::Teardown(teardown),
        }
    }

    fn prepare_scratch(&mut self) {
        self.body.clear();
        self.body.resize(self.packet_len, 0);

        self.body_pos = 0;
        if let Some(prefix) = self.restored_prefix {
            self.body[..HEADER_SIZE].copy_from_slice(&prefix);
            self.body_pos = HEADER_SIZE;
        }
    }

    fn finish_packet(&mut self) {
        self.body_pos = 0;
        self.state = ParseState::AwaitingHeader;
    }

    /// read the next 4 byte word into the header buffer, returning `None` if it is incomplete
    fn read_word<R: Read>(&mut self, stream: &mut R) -> Result<Option<u32>, Teardown> {
        if !fill(stream, &mut self.head, &mut self.head_pos)? {
            return Ok(None);
        }
        self.head_pos = 0;
        Ok(Some(u32::from_be_bytes(self.head)))
    }
}

/// Read from `stream` until `buf` is filled starting at `pos`, returning `false` if the stream
///  would block first
fn fill<R: Read>(stream: &mut R, buf: &mut [u8], pos: &mut usize) -> Result<bool, Teardown> {
    while *pos < buf.len() {
        match stream.read(&mut buf[*pos..]) {
            Ok(0) => return Err(Teardown::EndOfStream),
            Ok(n) => *pos += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(Teardown::Io(e)),
        }
    }
    Ok(true)
}
