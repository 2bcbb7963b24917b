use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use anyhow::bail;
use crate::framing::{FrameMagic, HEADER_SIZE};
use crate::socket_options::SocketOptions;

pub struct TcpDatagramConfig {
    /// The address that is bound lazily if the socket is used for sending or receiving without
    ///  an explicit call to `bind()`
    pub default_bind_addr: SocketAddr,

    /// The listen backlog of the accepting socket, <= 0 for the OS default
    pub listen_backlog: i32,

    /// The number of packets that are read consecutively from a single peer connection before
    ///  the receive loop advances to the next ready connection.
    ///
    /// A high value optimizes for throughput (and for latency when communicating with a small
    ///  number of peers), a low value for latency with a large number of busy peers.
    pub advance_frequency: usize,

    /// SO_TIMEOUT: maximum time `receive()` blocks, `None` (or zero) to block indefinitely
    pub so_timeout: Option<Duration>,

    /// Every peer must be configured with the same frame magic, otherwise connections are
    ///  rejected during the handshake
    pub frame_magic: FrameMagic,

    /// options applied to the listening socket and all per-peer connections
    pub socket_options: SocketOptions,

    pub connect_timeout: Option<Duration>,

    /// Incoming frames announcing a longer packet are treated as stream corruption. This
    ///  protects against allocating absurd amounts of memory based on garbage received from a
    ///  broken peer.
    pub max_packet_len: usize,

    /// Inbound connections that send nothing but zero bytes are kept open silently rather than
    ///  being rejected as a protocol violation. This allows plain TCP health checks on the
    ///  transport's port.
    pub tolerate_zero_probe: bool,

    /// minimum interval between two protocol warnings for the same peer
    pub protocol_warning_interval: Duration,

    /// the maximum number of readiness events processed per poll
    pub poll_capacity: usize,

    /// initial size of the per-connection scratch buffer for packet bodies that can not be read
    ///  into the caller's buffer directly
    pub initial_body_buffer_size: usize,
}

impl Default for TcpDatagramConfig {
    fn default() -> Self {
        TcpDatagramConfig {
            default_bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            listen_backlog: 0,
            advance_frequency: 32,
            so_timeout: None,
            frame_magic: FrameMagic::default(),
            socket_options: SocketOptions::transport_defaults(),
            connect_timeout: None,
            max_packet_len: 16*1024*1024,
            tolerate_zero_probe: true,
            protocol_warning_interval: Duration::from_secs(10),
            poll_capacity: 1024,
            initial_body_buffer_size: 2048,
        }
    }
}

impl TcpDatagramConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.advance_frequency == 0 {
            bail!("advance frequency must be at least 1");
        }
        if self.poll_capacity == 0 {
            bail!("poll capacity must be at least 1");
        }
        if self.frame_magic.variant().overlays_packet() && self.max_packet_len < HEADER_SIZE {
            bail!("maximum packet length {} is too small to hold the frame magic", self.max_packet_len);
        }
        if self.max_packet_len == 0 {
            bail!("maximum packet length must not be 0");
        }
        if let Some(timeout) = self.connect_timeout {
            if timeout.is_zero() {
                bail!("connect timeout must be positive - use None for the OS default");
            }
        }
        Ok(())
    }

    /// SO_TIMEOUT with zero normalized to 'no timeout'
    pub fn effective_so_timeout(&self) -> Option<Duration> {
        self.so_timeout.filter(|t| !t.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        TcpDatagramConfig::default().validate().unwrap();
    }

    #[rstest]
    #[case::advance_frequency(TcpDatagramConfig { advance_frequency: 0, ..Default::default() })]
    #[case::poll_capacity(TcpDatagramConfig { poll_capacity: 0, ..Default::default() })]
    #[case::max_packet_len(TcpDatagramConfig { max_packet_len: 0, ..Default::default() })]
    #[case::max_packet_len_short(TcpDatagramConfig { max_packet_len: 3, frame_magic: FrameMagic::new(1, FrameMagic::MASK_SHORT), ..Default::default() })]
    #[case::connect_timeout(TcpDatagramConfig { connect_timeout: Some(Duration::ZERO), ..Default::default() })]
    fn test_invalid(#[case] config: TcpDatagramConfig) {
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case(None, None)]
    #[case(Some(Duration::ZERO), None)]
    #[case(Some(Duration::from_millis(5)), Some(Duration::from_millis(5)))]
    fn test_effective_so_timeout(#[case] so_timeout: Option<Duration>, #[case] expected: Option<Duration>) {
        let config = TcpDatagramConfig { so_timeout, ..Default::default() };
        assert_eq!(config.effective_so_timeout(), expected);
    }
}
