//! Wire format of the TCP based datagram transport.
//!
//! ## Handshake
//!
//! Every outbound connection starts with a fixed 16 byte handshake, all numbers in network byte
//!  order (BE):
//!
//! ```ascii
//!  0: transport protocol magic (u32) - always 0x0DDF00DA
//!  4: frame magic (u32) - the configured frame magic, already masked
//!  8: frame mask (u32) - the configured frame mask
//! 12: return port (u32) - the sender's *listening* port
//! ```
//!
//! The receiver can not use the connection's remote address to identify the sender since that
//!  has an ephemeral port. It combines the remote IP address with the return port instead, which
//!  is the address the sender receives packets on.
//!
//! ## Frames
//!
//! After the handshake, the connection carries one frame per packet. The layout depends on the
//!  frame mask, see [FrameVariant]. The point of the masked variants is that the application's
//!  packets start with a well-known magic anyway: the bits covered by the mask carry no
//!  information, so they are replaced by the packet length on the wire and restored on the
//!  receiving side, saving the length prefix.

use bytes::BufMut;
use crate::error::TransportError;

/// Identifies peers speaking this protocol, so we don't try to act on garbage (e.g. allocating
///  a negative or gigabyte sized packet) coming from some unrelated client
pub const PROTOCOL_MAGIC: u32 = 0x0DDF_00DA;

/// Number of bytes read per handshake field, and the size of every frame header as read by the
///  receiver
pub const HEADER_SIZE: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameVariant {
    /// 16 bit length in the first two bytes of the packet
    Short,
    /// 24 bit length in the first three bytes of the packet
    Trint,
    /// 24 bit length plus a 4 bit rolling packet counter in the high nibble of the fourth byte,
    ///  for detecting a corrupted / desynchronized stream
    TrintCounter,
    /// 32 bit length replacing the first four bytes of the packet
    Full,
    /// 32 bit length written in front of the unmodified packet - used if the mask does not
    ///  match one of the other variants
    Fallback,
}

impl FrameVariant {
    pub fn max_packet_len(self) -> usize {
        match self {
            FrameVariant::Short => 0xFFFF,
            FrameVariant::Trint | FrameVariant::TrintCounter => 0xFF_FFFF,
            FrameVariant::Full | FrameVariant::Fallback => u32::MAX as usize,
        }
    }

    /// `true` if the frame header overlays the packet's first bytes, i.e. the magic is stripped
    ///  by the sender and restored by the receiver
    pub fn overlays_packet(self) -> bool {
        self != FrameVariant::Fallback
    }
}

/// The decoded 4 byte frame header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub packet_len: usize,
    /// the sender's rolling packet counter (4 bits), for [FrameVariant::TrintCounter] only
    pub counter: Option<u8>,
    /// the packet's original first four bytes, for variants that overlay the packet
    pub restored_prefix: Option<[u8; HEADER_SIZE]>,
}

/// The packet magic and the mask identifying which of its bits are significant. This is
///  configured once per transport, and it must be identical for all peers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FrameMagic {
    magic: u32,
    mask: u32,
}

impl FrameMagic {
    pub const MASK_SHORT: u32 = 0xFFFF_0000;
    pub const MASK_TRINT: u32 = 0xFFFF_FF00;
    pub const MASK_TRINT_COUNTER: u32 = 0xFFFF_FFF0;
    pub const MASK_FULL: u32 = 0xFFFF_FFFF;

    pub fn new(magic: u32, mask: u32) -> FrameMagic {
        FrameMagic {
            magic: magic & mask,
            mask,
        }
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn variant(&self) -> FrameVariant {
        match self.mask {
            Self::MASK_SHORT => FrameVariant::Short,
            Self::MASK_TRINT => FrameVariant::Trint,
            Self::MASK_TRINT_COUNTER => FrameVariant::TrintCounter,
            Self::MASK_FULL => FrameVariant::Full,
            _ => FrameVariant::Fallback,
        }
    }

    /// Write a packet's frame header to `buf`, returning the number of bytes at the start of
    ///  `packet` that are covered by the header and must not be sent.
    ///
    /// `tx_count` is the number of packets previously sent on the connection.
    pub fn encode_prefix(&self, packet: &[u8], tx_count: u32, buf: &mut impl BufMut) -> Result<usize, TransportError> {
        let variant = self.variant();
        let len = packet.len();
        if len > variant.max_packet_len() {
            return Err(TransportError::PacketTooLarge { len, max: variant.max_packet_len() });
        }
        let len_u32 = len as u32;

        if !variant.overlays_packet() {
            buf.put_u32(len_u32);
            return Ok(0);
        }

        if len < HEADER_SIZE {
            return Err(TransportError::PacketTooShort { len });
        }
        let original = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);

        let header = match variant {
            FrameVariant::Short => (len_u32 << 16) | (original & 0x0000_FFFF),
            FrameVariant::Trint => (len_u32 << 8) | (original & 0x0000_00FF),
            FrameVariant::TrintCounter => (len_u32 << 8) | ((tx_count & 0x0F) << 4) | (original & 0x0000_000F),
            FrameVariant::Full | FrameVariant::Fallback => len_u32,
        };
        buf.put_u32(header);
        Ok(HEADER_SIZE)
    }

    pub fn decode_header(&self, raw: [u8; HEADER_SIZE]) -> FrameHeader {
        let header = u32::from_be_bytes(raw);
        let variant = self.variant();

        let (packet_len, counter) = match variant {
            FrameVariant::Short => (header >> 16, None),
            FrameVariant::Trint => (header >> 8, None),
            FrameVariant::TrintCounter => (header >> 8, Some(((header & 0xF0) >> 4) as u8)),
            FrameVariant::Full | FrameVariant::Fallback => (header, None),
        };

        let restored_prefix = variant.overlays_packet()
            .then(|| (self.magic | (!self.mask & header)).to_be_bytes());

        FrameHeader {
            packet_len: packet_len as usize,
            counter,
            restored_prefix,
        }
    }

    /// The number of bytes following the 4 byte header on the wire for a packet of `packet_len`
    pub fn body_len_on_wire(&self, packet_len: usize) -> usize {
        if self.variant().overlays_packet() {
            packet_len.saturating_sub(HEADER_SIZE)
        }
        else {
            packet_len
        }
    }
}


/// The connection handshake sent once per outbound connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub frame_magic: FrameMagic,
    pub return_port: u16,
}

impl Handshake {
    pub const SERIALIZED_LEN: usize = 4 * HEADER_SIZE;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(PROTOCOL_MAGIC);
        buf.put_u32(self.frame_magic.magic());
        buf.put_u32(self.frame_magic.mask());
        buf.put_u32(self.return_port.into());
    }
}
