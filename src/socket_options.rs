use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use socket2::SockRef;
use tracing::trace;

/// The TCP level option bag that is copied into every socket the transport creates: the
///  listening socket, accepted connections and outbound connections.
///
/// Every field is optional, `None` meaning "leave the OS default alone". This allows merging
///  option sets on top of each other, later settings taking precedence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SocketOptions {
    pub tcp_nodelay: Option<bool>,
    /// `Some(Duration::ZERO)` means 'reset on close', which is what a packet transport wants:
    ///  unsent data of a dropped connection is as good as lost anyway
    pub linger: Option<Option<Duration>>,
    pub recv_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
    pub keepalive: Option<bool>,
    pub reuse_address: Option<bool>,
}

impl SocketOptions {
    /// The defaults for the per-peer TCP connections: no Nagle delay, and no lingering on close
    pub fn transport_defaults() -> SocketOptions {
        SocketOptions {
            tcp_nodelay: Some(true),
            linger: Some(Some(Duration::ZERO)),
            ..Default::default()
        }
    }

    /// Add all options that are set in `other`, overriding previous values
    pub fn merge(&mut self, other: &SocketOptions) {
        fn pick<T: Clone>(target: &mut Option<T>, source: &Option<T>) {
            if source.is_some() {
                *target = source.clone();
            }
        }

        pick(&mut self.tcp_nodelay, &other.tcp_nodelay);
        pick(&mut self.linger, &other.linger);
        pick(&mut self.recv_buffer_size, &other.recv_buffer_size);
        pick(&mut self.send_buffer_size, &other.send_buffer_size);
        pick(&mut self.keepalive, &other.keepalive);
        pick(&mut self.reuse_address, &other.reuse_address);
    }

    /// Apply the subset of options that makes sense for a listening socket. This must happen
    ///  before the socket is bound.
    pub fn apply_to_listener(&self, socket: &SockRef) -> io::Result<()> {
        if let Some(reuse) = self.reuse_address {
            socket.set_reuse_address(reuse)?;
        }
        // accepted sockets inherit the receive buffer size, and it has to be set before
        //  listen() to affect the TCP window scale
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        Ok(())
    }

    /// Apply all options to a stream socket, either accepted or about to be connected
    pub fn apply_to_stream(&self, socket: &SockRef) -> io::Result<()> {
        trace!("applying socket options {:?}", self);

        if let Some(nodelay) = self.tcp_nodelay {
            socket.set_nodelay(nodelay)?;
        }
        if let Some(linger) = self.linger {
            socket.set_linger(linger)?;
        }
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(keepalive) = self.keepalive {
            socket.set_keepalive(keepalive)?;
        }
        Ok(())
    }
}


/// Identifies an option for [crate::tcp_datagram_socket::TcpDatagramSocket::set_option] and
///  [crate::tcp_datagram_socket::TcpDatagramSocket::get_option], mirroring the options a
///  datagram socket exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketOptionId {
    /// receive timeout; `None` or zero waits forever
    SoTimeout,
    /// the bound local address, read only
    SoBindAddr,
    SoRcvBuf,
    SoSndBuf,
    SoReuseAddr,
    SoBroadcast,
    IpTos,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OptionValue {
    Timeout(Option<Duration>),
    Addr(Option<SocketAddr>),
    Size(usize),
    Flag(bool),
    Int(i32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_transport_defaults() {
        let options = SocketOptions::transport_defaults();
        assert_eq!(options.tcp_nodelay, Some(true));
        assert_eq!(options.linger, Some(Some(Duration::ZERO)));
        assert_eq!(options.recv_buffer_size, None);
    }

    #[rstest]
    #[case::empty_onto_defaults(SocketOptions::transport_defaults(), SocketOptions::default(), SocketOptions::transport_defaults())]
    #[case::override_nodelay(
        SocketOptions::transport_defaults(),
        SocketOptions { tcp_nodelay: Some(false), ..Default::default() },
        SocketOptions { tcp_nodelay: Some(false), linger: Some(Some(Duration::ZERO)), ..Default::default() },
    )]
    #[case::add_buffers(
        SocketOptions::default(),
        SocketOptions { recv_buffer_size: Some(1024), send_buffer_size: Some(2048), ..Default::default() },
        SocketOptions { recv_buffer_size: Some(1024), send_buffer_size: Some(2048), ..Default::default() },
    )]
    #[case::disable_linger(
        SocketOptions::transport_defaults(),
        SocketOptions { linger: Some(None), ..Default::default() },
        SocketOptions { tcp_nodelay: Some(true), linger: Some(None), ..Default::default() },
    )]
    fn test_merge(#[case] mut base: SocketOptions, #[case] other: SocketOptions, #[case] expected: SocketOptions) {
        base.merge(&other);
        assert_eq!(base, expected);
    }

    #[test]
    fn test_apply_to_stream() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let options = SocketOptions {
            tcp_nodelay: Some(true),
            keepalive: Some(true),
            ..Default::default()
        };
        options.apply_to_stream(&SockRef::from(&stream)).unwrap();

        assert!(stream.nodelay().unwrap());
        assert!(SockRef::from(&stream).keepalive().unwrap());
    }
}
