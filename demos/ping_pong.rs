use clap::Parser;
use clap_derive::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::anyhow;
use tracing::{info, warn, Level};
use tcpdatagram::async_transport::{AsyncTcpDatagramTransport, MessageHandler, Transport};
use tcpdatagram::config::TcpDatagramConfig;
use tcpdatagram::framing::FrameMagic;
use tcpdatagram::tcp_datagram_socket::TcpDatagramSocket;

const MAGIC: u32 = 0x5049_4E47;

/// Exchanges PING / PONG packets between two processes. Without `--peer`, the process answers
///  every PING it receives; with `--peer`, it sends PINGs and measures round trip times.
#[derive(Parser)]
struct Args {
    bind_address: String,

    #[clap(long)]
    peer: Option<String>,

    #[clap(long, default_value_t = 10)]
    count: usize,

    /// frame mask, e.g. 0xFFFFFFF0 for the length + packet counter framing
    #[clap(long, default_value = "0xFFFFFFF0")]
    mask: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

fn packet(kind: &[u8; 4], seq: u32) -> Vec<u8> {
    let mut result = MAGIC.to_be_bytes().to_vec();
    result.extend_from_slice(kind);
    result.extend_from_slice(&seq.to_be_bytes());
    result
}

struct Ponger {
    transport: AsyncTcpDatagramTransport,
}

#[async_trait::async_trait]
impl MessageHandler for Ponger {
    async fn handle_message(&self, buf: &[u8], sender: SocketAddr) {
        if buf.len() != 12 || &buf[4..8] != b"PING" {
            warn!("unexpected packet from {:?}: {:?}", sender, buf);
            return;
        }
        let seq = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if let Err(e) = self.transport.send(sender, &packet(b"PONG", seq)).await {
            warn!("error answering {:?}: {}", sender, e);
        }
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let mask = u32::from_str_radix(args.mask.trim_start_matches("0x"), 16)?;
    let socket = Arc::new(TcpDatagramSocket::new(TcpDatagramConfig {
        frame_magic: FrameMagic::new(MAGIC, mask),
        so_timeout: Some(Duration::from_secs(2)),
        ..Default::default()
    })?);
    socket.bind(args.bind_address.parse()?)?;
    info!("listening on {}", socket);

    match args.peer {
        None => {
            let transport = AsyncTcpDatagramTransport::new(socket.clone(), 1024);
            let ponger = Ponger {
                transport: AsyncTcpDatagramTransport::new(socket, 1024),
            };
            transport.recv_loop(Arc::new(ponger)).await
        }
        Some(peer) => {
            let peer: SocketAddr = peer.parse()?;
            tokio::task::spawn_blocking(move || ping(&socket, peer, args.count)).await?
        }
    }
}

fn ping(socket: &TcpDatagramSocket, peer: SocketAddr, count: usize) -> anyhow::Result<()> {
    let mut buf = [0u8; 64];
    for seq in 0..count as u32 {
        let start = Instant::now();
        socket.send(&packet(b"PING", seq), peer)?;

        let (len, sender) = socket.receive(&mut buf)?;
        if sender != peer || len != 12 || &buf[4..8] != b"PONG" {
            return Err(anyhow!("unexpected packet from {:?}: {:?}", sender, &buf[..len]));
        }
        info!("PONG #{} from {:?} after {:?}", seq, sender, start.elapsed());
    }
    socket.close();
    Ok(())
}
