use std::net::SocketAddr;
use std::sync::Arc;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use crate::error::TransportError;
use crate::tcp_datagram_socket::TcpDatagramSocket;

/// The seam between the messaging layer and the way messages travel between nodes
#[async_trait::async_trait]
pub trait Transport : Sync + Send {
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()>;

    async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()>;

    fn cancel_recv_loop(&self);
}

/// This trait decouples the transport of messages from their handling once they are received.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait MessageHandler : Sync + Send {
    async fn handle_message(&self, buf: &[u8], sender: SocketAddr);
}

/// Makes a [TcpDatagramSocket] available to async code. The socket's blocking operations run on
///  tokio's blocking thread pool.
pub struct AsyncTcpDatagramTransport {
    socket: Arc<TcpDatagramSocket>,
    max_message_size: usize,
    /// number of received messages buffered between the receiving thread and the handler
    queue_capacity: usize,
}

impl AsyncTcpDatagramTransport {
    pub fn new(socket: Arc<TcpDatagramSocket>, max_message_size: usize) -> AsyncTcpDatagramTransport {
        AsyncTcpDatagramTransport {
            socket,
            max_message_size,
            queue_capacity: 1024,
        }
    }

    pub fn socket(&self) -> &Arc<TcpDatagramSocket> {
        &self.socket
    }
}

#[async_trait::async_trait]
impl Transport for AsyncTcpDatagramTransport {
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        let socket = self.socket.clone();
        let buf = buf.to_vec();
        tokio::task::spawn_blocking(move || socket.send(&buf, to)).await??;
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        let (sender, mut receiver) = mpsc::channel::<(Vec<u8>, SocketAddr)>(self.queue_capacity);

        let socket = self.socket.clone();
        let max_message_size = self.max_message_size;
        let receiving = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; max_message_size];
            loop {
                match socket.receive(&mut buf) {
                    Ok((len, from)) => {
                        if sender.blocking_send((buf[..len].to_vec(), from)).is_err() {
                            return Ok(());
                        }
                    }
                    Err(TransportError::Timeout) => {}
                    Err(TransportError::Closed) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        });

        trace!("starting TCP datagram receive loop on {}", self.socket);
        while let Some((buf, from)) = receiver.recv().await {
            handler.handle_message(&buf, from).await;
        }
        debug!("receive loop on {} finished", self.socket);

        receiving.await??;
        Ok(())
    }

    /// The receive loop can only be stopped by closing the socket, so this transport can not be
    ///  used afterwards
    fn cancel_recv_loop(&self) {
        self.socket.close();
    }
}
