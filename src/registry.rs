use std::io;
use std::io::{BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use crate::error::TransportError;
use crate::framing::{FrameMagic, Handshake, HEADER_SIZE};

/// The result of a failed attempt at writing a packet
#[derive(Debug)]
pub enum WriteError {
    /// the packet can not be represented in the configured frame format; the connection is
    ///  still usable
    Encode(TransportError),
    /// the connection is broken
    Io(io::Error),
}

/// A lazily created, outbound-only TCP connection to a peer's listening socket.
pub struct OutboundConnection {
    peer_addr: SocketAddr,
    /// a second handle to the socket, for shutting it down without waiting for a send that may
    ///  be blocked in the sink
    control: TcpStream,
    sink: Mutex<OutboundSink>,
}

struct OutboundSink {
    writer: BufWriter<TcpStream>,
    /// number of packets sent, wrapping
    tx_count: u32,
}

impl OutboundConnection {
    /// Wrap a freshly connected stream, queueing the handshake. The handshake is not flushed
    ///  here but goes out together with the first packet.
    pub fn new(peer_addr: SocketAddr, stream: TcpStream, handshake: Handshake) -> io::Result<OutboundConnection> {
        let control = stream.try_clone()?;

        let mut handshake_buf = [0u8; Handshake::SERIALIZED_LEN];
        handshake.ser(&mut handshake_buf.as_mut_slice());

        let mut writer = BufWriter::new(stream);
        writer.write_all(&handshake_buf)?;

        Ok(OutboundConnection {
            peer_addr,
            control,
            sink: Mutex::new(OutboundSink {
                writer,
                tx_count: 0,
            }),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn tx_count(&self) -> u32 {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner).tx_count
    }

    /// Write a single packet as a frame, flushing it to the socket.
    pub fn write_packet(&self, frame_magic: &FrameMagic, packet: &[u8]) -> Result<(), WriteError> {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);

        let mut prefix = [0u8; HEADER_SIZE];
        let mut prefix_buf = prefix.as_mut_slice();
        let consumed = frame_magic.encode_prefix(packet, sink.tx_count, &mut prefix_buf)
            .map_err(WriteError::Encode)?;
        let prefix_len = HEADER_SIZE - prefix_buf.len();

        trace!("writing packet of length {} to {:?}", packet.len(), self.peer_addr);
        sink.writer.write_all(&prefix[..prefix_len]).map_err(WriteError::Io)?;
        sink.writer.write_all(&packet[consumed..]).map_err(WriteError::Io)?;
        sink.writer.flush().map_err(WriteError::Io)?;

        sink.tx_count = sink.tx_count.wrapping_add(1);
        Ok(())
    }

    pub fn shutdown(&self) {
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            // the socket may well be broken already, that is why it is shut down
            debug!("error shutting down connection to {:?}: {}", self.peer_addr, e);
        }
    }
}


/// The outbound connections by peer address.
///
/// Sending is the hot path, while connections are created rarely, so this is a map behind a
///  read-write lock: lookups take the read lock only.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<FxHashMap<SocketAddr, Arc<OutboundConnection>>>,
}

impl ConnectionRegistry {
    pub fn get(&self, peer_addr: &SocketAddr) -> Option<Arc<OutboundConnection>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
            .get(peer_addr)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the connection registered for `peer_addr`, creating it with `connect` if there is
    ///  none. Concurrent callers may both create a connection; the first one to register wins,
    ///  and the other one is shut down.
    pub fn ensure_connection(&self, peer_addr: SocketAddr, connect: impl FnOnce() -> io::Result<OutboundConnection>) -> io::Result<Arc<OutboundConnection>> {
        if let Some(conn) = self.get(&peer_addr) {
            return Ok(conn);
        }

        let conn = Arc::new(connect()?);
        let registered = self.insert_if_absent(conn.clone());
        if !Arc::ptr_eq(&registered, &conn) {
            debug!("concurrently created connection to {:?} - discarding the redundant one", peer_addr);
            conn.shutdown();
        }
        Ok(registered)
    }

    /// Register `conn` unless there is a connection for its peer already, returning the
    ///  registered connection
    pub fn insert_if_absent(&self, conn: Arc<OutboundConnection>) -> Arc<OutboundConnection> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
            .entry(conn.peer_addr())
            .or_insert(conn)
            .clone()
    }

    /// Remove `conn` if it is still the registered connection for its peer. A connection that
    ///  replaced it in the meantime stays registered.
    pub fn remove(&self, conn: &Arc<OutboundConnection>) -> bool {
        let mut connections = self.connections.write().unwrap_or_else(PoisonError::into_inner);
        match connections.get(&conn.peer_addr()) {
            Some(registered) if Arc::ptr_eq(registered, conn) => {
                connections.remove(&conn.peer_addr());
                true
            }
            _ => false,
        }
    }

    /// Remove all connections, returning them
    pub fn drain(&self) -> Vec<Arc<OutboundConnection>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, conn)| conn)
            .collect()
    }
}
