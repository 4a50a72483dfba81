//! TCP receiver hub.
//!
//! Every accepted connection becomes a receiver. The socket is framed with
//! [`ChannelCodec`] and split into a writer task, fed through a bounded
//! queue, and a reader task that dispatches inbound messages to the
//! handler registered for their channel.
//!
//! A receiver whose queue fills up is disconnected rather than left
//! running with missing tiles.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use tilecast_core::codec::{ChannelCodec, ChannelMessage};
use tilecast_core::error::TilecastError;
use tilecast_core::hub::{MessageHandler, ReceiverHub, ReceiverId};

/// Outbound messages buffered per receiver before it is disconnected.
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

struct Peer {
    tx: mpsc::Sender<ChannelMessage>,
    writer: AbortHandle,
    reader: AbortHandle,
}

impl Peer {
    fn abort(&self) {
        self.writer.abort();
        self.reader.abort();
    }
}

struct Shared {
    peers: RwLock<HashMap<ReceiverId, Peer>>,
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    next_id: AtomicU64,
    queue_depth: usize,
    connected: watch::Sender<usize>,
}

pub struct TcpReceiverHub {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    acceptor: AbortHandle,
}

impl TcpReceiverHub {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, TilecastError> {
        Self::bind_with_depth(addr, DEFAULT_QUEUE_DEPTH).await
    }

    pub async fn bind_with_depth(addr: impl ToSocketAddrs, queue_depth: usize) -> Result<Self, TilecastError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            peers: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            queue_depth: queue_depth.max(1),
            connected: watch::channel(0).0,
        });

        let acceptor = tokio::spawn(accept_loop(listener, Arc::clone(&shared))).abort_handle();
        info!(%local_addr, "receiver hub listening");
        Ok(Self {
            shared,
            local_addr,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Route inbound messages on `channel` to `handler`, replacing any
    /// previous handler for it.
    pub fn register_handler(&self, channel: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(channel.into(), handler);
    }

    /// Wait until at least `count` receivers are connected. Returns
    /// `false` if `timeout` elapses first.
    pub async fn wait_for_receivers(&self, count: usize, timeout: Duration) -> bool {
        let mut rx = self.shared.connected.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n >= count))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

impl Drop for TcpReceiverHub {
    fn drop(&mut self) {
        self.acceptor.abort();
        let peers: Vec<Peer> = self
            .shared
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, p)| p)
            .collect();
        for peer in peers {
            peer.abort();
        }
    }
}

impl ReceiverHub for TcpReceiverHub {
    fn receivers(&self) -> Vec<ReceiverId> {
        let mut ids: Vec<ReceiverId> = self
            .shared
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    fn send(&self, receiver: ReceiverId, channel: &str, payload: Bytes) -> Result<(), TilecastError> {
        let result = {
            let peers = self.shared.peers.read().unwrap_or_else(|e| e.into_inner());
            let peer = peers
                .get(&receiver)
                .ok_or_else(|| TilecastError::Transport(format!("{receiver} not connected")))?;
            peer.tx.try_send(ChannelMessage::new(channel, payload))
        };
        match result {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // The read guard is released; removal takes the write lock.
                if self.shared.remove(receiver) {
                    warn!(receiver = %receiver, depth = self.shared.queue_depth, "send queue full, disconnecting");
                }
                Err(TilecastError::Transport(format!("{receiver} disconnected: send queue full")))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TilecastError::ChannelClosed),
        }
    }
}

// ── Connection tasks ─────────────────────────────────────────────

impl Shared {
    fn handler(&self, channel: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(channel)
            .cloned()
    }

    fn remove(&self, receiver: ReceiverId) -> bool {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let removed = peers.remove(&receiver);
        self.connected.send_replace(peers.len());
        if let Some(peer) = &removed {
            peer.abort();
        }
        removed.is_some()
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => attach(stream, addr, &shared),
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn attach(stream: TcpStream, addr: SocketAddr, shared: &Arc<Shared>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%addr, error = %e, "set_nodelay failed");
    }
    let id = ReceiverId(shared.next_id.fetch_add(1, Ordering::Relaxed));
    let (mut net_writer, mut net_reader) = Framed::new(stream, ChannelCodec).split();
    let (tx, mut rx) = mpsc::channel::<ChannelMessage>(shared.queue_depth);

    // Writer task: queue -> network. Ends when the peer entry is dropped.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = net_writer.send(message).await {
                debug!(receiver = %id, error = %e, "write failed");
                break;
            }
        }
    })
    .abort_handle();

    // Registered before the reader runs so its removal cannot be lost.
    let mut peers = shared.peers.write().unwrap_or_else(|e| e.into_inner());

    // Reader task: network -> handlers.
    let reader_shared = Arc::clone(shared);
    let reader = tokio::spawn(async move {
        while let Some(result) = net_reader.next().await {
            match result {
                Ok(message) => match reader_shared.handler(&message.channel) {
                    Some(handler) => handler.on_message(&message.channel, id, &message.payload),
                    None => debug!(receiver = %id, channel = %message.channel, "no handler for channel"),
                },
                Err(e) => {
                    warn!(receiver = %id, error = %e, "read failed");
                    break;
                }
            }
        }
        if reader_shared.remove(id) {
            info!(receiver = %id, "receiver disconnected");
        }
    })
    .abort_handle();

    peers.insert(id, Peer { tx, writer, reader });
    shared.connected.send_replace(peers.len());
    drop(peers);
    info!(receiver = %id, %addr, "receiver connected");
}
