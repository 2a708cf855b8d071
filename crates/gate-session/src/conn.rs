//! In-process connection backed by channels.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use gate_core::{Conn, GateError};
use tokio::sync::{Mutex, mpsc, watch};

/// Connection whose peer is a pair of channels.
///
/// Lets agents run without sockets, for in-process clients and tests.
pub struct MemoryConn {
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    outbound: mpsc::UnboundedSender<Vec<Bytes>>,
    shutdown: watch::Sender<bool>,
    local: SocketAddr,
    remote: SocketAddr,
}

/// The peer side of a [`MemoryConn`].
pub struct MemoryPeer {
    /// Frames sent to the agent.
    pub tx: mpsc::UnboundedSender<Bytes>,
    /// Messages written by the agent.
    pub rx: mpsc::UnboundedReceiver<Vec<Bytes>>,
    shutdown: watch::Receiver<bool>,
}

impl MemoryConn {
    /// Create a connection and its peer.
    #[must_use]
    pub fn pair(local: SocketAddr, remote: SocketAddr) -> (Arc<Self>, MemoryPeer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let conn = Arc::new(Self {
            inbound: Mutex::new(in_rx),
            outbound: out_tx,
            shutdown,
            local,
            remote,
        });
        let peer = MemoryPeer {
            tx: in_tx,
            rx: out_rx,
            shutdown: shutdown_rx,
        };
        (conn, peer)
    }

    fn is_shut(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl MemoryPeer {
    /// Whether the agent side closed the connection.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[async_trait]
impl Conn for MemoryConn {
    async fn read_msg(&self) -> Result<Bytes, GateError> {
        let mut shutdown = self.shutdown.subscribe();
        if self.is_shut() {
            return Err(GateError::Transport("connection closed".to_string()));
        }
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            msg = inbound.recv() => {
                msg.ok_or_else(|| GateError::Transport("peer hung up".to_string()))
            }
            _ = shutdown.changed() => {
                Err(GateError::Transport("connection closed".to_string()))
            }
        }
    }

    fn write_msg(&self, frames: Vec<Bytes>) -> Result<(), GateError> {
        if self.is_shut() {
            return Err(GateError::Transport("connection closed".to_string()));
        }
        self.outbound
            .send(frames)
            .map_err(|_| GateError::Transport("peer hung up".to_string()))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn network(&self) -> &'static str {
        "memory"
    }

    fn close(&self) {
        self.shutdown.send_replace(true);
    }

    fn destroy(&self) {
        self.shutdown.send_replace(true);
    }
}
