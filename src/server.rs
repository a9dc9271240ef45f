//! Server side: acceptor, per-connection state, and [`ServerRpc`].
//!
//! The acceptor admits connections and spawns one driver task per socket.
//! Each driver owns the connection's entire state: the request currently
//! being received and the ordered queue of replies still to write. A
//! completed request is handed to the upper layer as a [`ServerRpc`];
//! calling [`ServerRpc::send_reply`] routes the reply back to the owning
//! connection, which frames it with the request's nonce and writes it out
//! with the same partial-write resumption the client uses. Replies to one
//! connection go out in `send_reply` order.
//!
//! Connection teardown (peer close, I/O error, oversized frame) drops any
//! queued replies; a [`ServerRpc`] that was already handed out notices the
//! dead connection in `send_reply` and quietly drops the reply.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::Interest;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::buffer::Buffer;
use crate::error::{Result, TransportError};
use crate::protocol::{IncomingMessage, OutboundFrame, Progress};

/// Table of live connection driver tasks, keyed by an id private to the
/// transport instance. Entries remove themselves when a driver exits;
/// dropping the owning transport aborts whatever is left.
pub(crate) type ConnectionTable = Arc<Mutex<HashMap<u64, JoinHandle<()>>>>;

/// A request received from a client, waiting for the upper layer to reply.
pub struct ServerRpc {
    nonce: u64,
    request: Buffer,
    peer: SocketAddr,
    reply_tx: mpsc::UnboundedSender<ReplyCommand>,
}

impl ServerRpc {
    /// The nonce the client assigned to this RPC. It is echoed in the
    /// reply header automatically.
    #[inline]
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// The request payload.
    #[inline]
    pub fn request(&self) -> &Buffer {
        &self.request
    }

    /// Take ownership of the request payload.
    pub fn into_request(self) -> Buffer {
        self.request
    }

    /// Address of the client that sent the request.
    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Queue `reply` for transmission on the connection the request
    /// arrived on. If that connection has since closed, the reply is
    /// dropped; there is nowhere to send it.
    pub fn send_reply(self, reply: Buffer) {
        let nonce = self.nonce;
        if self
            .reply_tx
            .send(ReplyCommand {
                nonce,
                payload: reply,
            })
            .is_err()
        {
            tracing::debug!(nonce, "dropping reply: connection closed");
        }
    }
}

impl std::fmt::Debug for ServerRpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRpc")
            .field("nonce", &self.nonce)
            .field("request_len", &self.request.len())
            .field("peer", &self.peer)
            .finish()
    }
}

/// A reply headed back to its connection's driver.
struct ReplyCommand {
    nonce: u64,
    payload: Buffer,
}

/// Accept connections until the listener is torn down.
///
/// Accept failures are logged and never fatal to the listener.
pub(crate) fn spawn_acceptor(
    listener: TcpListener,
    incoming: mpsc::UnboundedSender<ServerRpc>,
    connections: ConnectionTable,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ids = AtomicU64::new(0);
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::warn!(%peer, "failed to set TCP_NODELAY: {e}");
                    }
                    let id = ids.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(%peer, id, "accepted connection");
                    spawn_connection(id, stream, peer, incoming.clone(), connections.clone());
                }
                Err(e) => {
                    // Transient conditions (e.g. the peer aborting between
                    // SYN and accept) show up here; the listener stays up.
                    tracing::warn!("accept failed: {e}");
                }
            }
        }
    })
}

fn spawn_connection(
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    incoming: mpsc::UnboundedSender<ServerRpc>,
    connections: ConnectionTable,
) {
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let driver = ConnectionDriver {
        stream,
        peer,
        message: None,
        waiting_to_reply: VecDeque::new(),
        reply_rx,
        reply_tx,
        incoming,
    };

    let table = connections.clone();
    let handle = tokio::spawn(async move {
        driver.run().await;
        table.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    });
    connections
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(id, handle);
}

/// Owns one accepted connection's state; runs as one task.
struct ConnectionDriver {
    stream: TcpStream,
    peer: SocketAddr,
    /// The request currently being received, if any.
    message: Option<IncomingMessage>,
    /// Replies still to write; the front frame may be partially sent.
    waiting_to_reply: VecDeque<OutboundFrame>,
    reply_rx: mpsc::UnboundedReceiver<ReplyCommand>,
    /// Cloned into every [`ServerRpc`] surfaced from this connection.
    reply_tx: mpsc::UnboundedSender<ReplyCommand>,
    /// Completed requests flow to the transport through this channel.
    incoming: mpsc::UnboundedSender<ServerRpc>,
}

impl ConnectionDriver {
    async fn run(mut self) {
        match self.serve().await {
            Ok(()) => tracing::debug!(peer = %self.peer, "connection finished"),
            Err(TransportError::PeerClosed) => {
                tracing::debug!(peer = %self.peer, "connection closed by peer");
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer, "connection torn down: {e}");
            }
        }
        // Dropping the driver drops queued replies and closes the reply
        // channel, turning any later send_reply into a no-op.
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let interest = if self.waiting_to_reply.is_empty() {
                Interest::READABLE
            } else {
                Interest::READABLE | Interest::WRITABLE
            };

            tokio::select! {
                cmd = self.reply_rx.recv() => {
                    match cmd {
                        // Unreachable while self.reply_tx is held, but a
                        // closed channel just means nothing more to write.
                        None => return Ok(()),
                        Some(reply) => self.queue_reply(reply)?,
                    }
                }
                ready = self.stream.ready(interest) => {
                    let ready = ready?;
                    if ready.is_readable() {
                        if !self.on_readable()? {
                            return Ok(());
                        }
                    }
                    if ready.is_writable() {
                        self.on_writable()?;
                    }
                }
            }
        }
    }

    /// Frame a reply and queue it, trying an inline write first when the
    /// queue is idle so an unloaded connection answers without waiting for
    /// a writability event.
    fn queue_reply(&mut self, reply: ReplyCommand) -> Result<()> {
        let mut frame = OutboundFrame::new(reply.nonce, reply.payload);
        if self.waiting_to_reply.is_empty()
            && frame.write_some(&self.stream).map_err(TransportError::Io)? == 0
        {
            return Ok(());
        }
        self.waiting_to_reply.push_back(frame);
        Ok(())
    }

    /// Read request bytes. Returns `false` when the transport side is gone
    /// and the connection should wind down.
    fn on_readable(&mut self) -> Result<bool> {
        loop {
            let msg = self.message.get_or_insert_with(IncomingMessage::new);
            match msg.advance(&self.stream)? {
                Progress::Incomplete => return Ok(true),
                Progress::HeaderReady(_) => {
                    // A fresh request lands in its own payload buffer.
                    msg.attach_sink(Some(Buffer::new()));
                }
                Progress::Complete => {
                    let Some(done) = self.message.take() else {
                        return Ok(true);
                    };
                    if done.is_oversized() {
                        return Err(done.oversize_violation());
                    }
                    let (header, payload) = done.take();
                    let rpc = ServerRpc {
                        nonce: header.nonce,
                        request: payload.unwrap_or_default(),
                        peer: self.peer,
                        reply_tx: self.reply_tx.clone(),
                    };
                    if self.incoming.send(rpc).is_err() {
                        // The transport was dropped; no one will ever
                        // reply on this connection.
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Write queued replies until the socket pushes back or the queue is
    /// empty.
    fn on_writable(&mut self) -> Result<()> {
        loop {
            match self.waiting_to_reply.front_mut() {
                None => return Ok(()),
                Some(front) => {
                    if front.write_some(&self.stream).map_err(TransportError::Io)? > 0 {
                        return Ok(());
                    }
                }
            }
            self.waiting_to_reply.pop_front();
        }
    }
}
