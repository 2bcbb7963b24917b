use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use mio::Poll;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::debug;
use crate::socket_options::SocketOptions;

/// The backlog that is used if none (or a non-positive one) is configured
pub const DEFAULT_BACKLOG: i32 = 128;

/// This is the factory abstraction for raw sockets, separating the transport's logic from how
///  sockets are created. A provider can e.g. wrap sockets for instrumentation or restrict the
///  addresses that may be used.
pub trait SocketProvider: Send + Sync + 'static {
    /// Create a non-blocking listening socket bound to `addr`, with `options` applied before
    ///  binding.
    fn open_listener(&self, addr: SocketAddr, backlog: i32, options: &SocketOptions) -> io::Result<mio::net::TcpListener>;

    /// Create a blocking stream socket connected to `addr`, with `options` applied before
    ///  connecting.
    fn open_stream(&self, addr: SocketAddr, options: &SocketOptions, connect_timeout: Option<Duration>) -> io::Result<std::net::TcpStream>;

    fn open_poll(&self) -> io::Result<Poll> {
        Poll::new()
    }
}

/// Plain TCP sockets created through `socket2`
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSocketProvider;

impl SocketProvider for DefaultSocketProvider {
    fn open_listener(&self, addr: SocketAddr, backlog: i32, options: &SocketOptions) -> io::Result<mio::net::TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        options.apply_to_listener(&SockRef::from(&socket))?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let backlog = if backlog > 0 { backlog } else { DEFAULT_BACKLOG };
        socket.listen(backlog)?;

        debug!("opened listener on {:?} with backlog {}", socket.local_addr()?.as_socket(), backlog);
        Ok(mio::net::TcpListener::from_std(socket.into()))
    }

    fn open_stream(&self, addr: SocketAddr, options: &SocketOptions, connect_timeout: Option<Duration>) -> io::Result<std::net::TcpStream> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        options.apply_to_stream(&SockRef::from(&socket))?;

        match connect_timeout {
            Some(timeout) if !timeout.is_zero() => socket.connect_timeout(&addr.into(), timeout)?,
            _ => socket.connect(&addr.into())?,
        }
        Ok(socket.into())
    }
}
