pub mod async_transport;
pub mod config;
pub mod error;
pub mod framing;
mod inbound;
mod log_throttle;
mod multiplexer;
pub mod provider;
pub mod registry;
pub mod socket_options;
pub mod tcp_datagram_socket;
