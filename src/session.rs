//! Client sessions: request queue, in-flight correlation, response reader.
//!
//! A [`Session`] is a cheaply cloneable handle to one server connection.
//! [`Session::call`] assigns a nonce, hands the request to the session's
//! driver task, and returns an [`RpcHandle`] that resolves to the reply.
//! Many RPCs may be outstanding at once; requests go out in submission
//! order while responses complete in whatever order the server produces
//! them, paired back to their callers by nonce.
//!
//! All connection state lives in a single driver task. The loop waits on
//! exactly two things: the command channel and socket readiness, asking
//! for writability only while a request frame still has unsent bytes.
//! Progress through partially transferred frames is checkpointed in byte
//! counters ([`IncomingMessage`], [`OutboundFrame`]), so a handler can
//! always return to the loop mid-frame and resume on the next event.
//!
//! A fatal error (connect failure, I/O error, peer close, protocol
//! violation) poisons the session permanently: every queued and in-flight
//! RPC fails with the underlying reason, and later calls fail
//! synchronously. There is no reconnection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::buffer::Buffer;
use crate::error::{Result, TransportError};
use crate::protocol::{IncomingMessage, OutboundFrame, Progress};

/// Commands from session handles to the driver task.
enum Command {
    Call {
        nonce: u64,
        request: Buffer,
        reply_tx: oneshot::Sender<Result<Buffer>>,
    },
    Cancel {
        nonce: u64,
    },
}

/// A client's handle to one server connection.
///
/// Cloning is cheap; all clones share the connection, the nonce counter
/// and the poisoned state. The connection is opened lazily by the first
/// [`Session::call`]. Dropping every clone (and every outstanding
/// [`RpcHandle`]) shuts the driver task down and closes the socket.
#[derive(Clone)]
pub struct Session {
    cmd_tx: mpsc::UnboundedSender<Command>,
    serial: Arc<AtomicU64>,
    poison: Arc<Mutex<Option<String>>>,
    addr: Arc<str>,
}

impl Session {
    /// Create a session for `host:port` and spawn its driver task.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn open(host: &str, port: u16) -> Session {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let poison = Arc::new(Mutex::new(None));
        let addr: Arc<str> = format!("{host}:{port}").into();

        let driver = SessionDriver {
            addr: addr.to_string(),
            stream: None,
            cmd_rx,
            waiting_to_send: VecDeque::new(),
            waiting_for_response: VecDeque::new(),
            current: None,
            message: None,
            poison: poison.clone(),
        };
        tokio::spawn(driver.run());

        Session {
            cmd_tx,
            serial: Arc::new(AtomicU64::new(1)),
            poison,
            addr,
        }
    }

    /// Submit an RPC. The request bytes are transmitted in `call` order;
    /// the reply arrives through the returned handle.
    ///
    /// Fails synchronously if the session has been poisoned by an earlier
    /// fatal error.
    pub fn call(&self, request: Buffer) -> Result<RpcHandle> {
        if let Some(reason) = self.error_info() {
            return Err(TransportError::SessionPoisoned(reason));
        }

        let nonce = self.serial.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Call {
                nonce,
                request,
                reply_tx,
            })
            .map_err(|_| {
                TransportError::SessionPoisoned("session driver terminated".into())
            })?;

        Ok(RpcHandle {
            nonce,
            reply_rx,
            cancel_tx: self.cmd_tx.clone(),
        })
    }

    /// Why the session became unusable, if it has.
    pub fn error_info(&self) -> Option<String> {
        self.poison
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The `host:port` this session connects to.
    pub fn server_addr(&self) -> &str {
        &self.addr
    }
}

/// One outstanding RPC.
///
/// Resolves exactly once: either the reply buffer or an error, never both.
pub struct RpcHandle {
    nonce: u64,
    reply_rx: oneshot::Receiver<Result<Buffer>>,
    cancel_tx: mpsc::UnboundedSender<Command>,
}

impl RpcHandle {
    /// The nonce assigned to this RPC.
    #[inline]
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Wait for the reply.
    pub async fn response(self) -> Result<Buffer> {
        match self.reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::SessionPoisoned(
                "session driver terminated".into(),
            )),
        }
    }

    /// Withdraw the RPC. If its request is already partially on the wire
    /// the connection is closed, since the stream cannot be re-framed
    /// mid-message; otherwise the RPC detaches cleanly and a late response
    /// carrying its nonce is drained and discarded.
    pub fn cancel(self) {
        let _ = self.cancel_tx.send(Command::Cancel { nonce: self.nonce });
    }
}

/// A request queued for transmission (front may be partially written).
struct PendingRpc {
    nonce: u64,
    frame: OutboundFrame,
    reply_tx: oneshot::Sender<Result<Buffer>>,
}

/// A request fully transmitted, awaiting its response.
struct AwaitingRpc {
    nonce: u64,
    reply_tx: oneshot::Sender<Result<Buffer>>,
}

/// Owns all per-connection state; runs as one task.
struct SessionDriver {
    addr: String,
    /// `None` before the first call and after teardown.
    stream: Option<TcpStream>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    waiting_to_send: VecDeque<PendingRpc>,
    waiting_for_response: VecDeque<AwaitingRpc>,
    /// The RPC whose response body is currently being read.
    current: Option<AwaitingRpc>,
    /// Reader state for the response currently arriving.
    message: Option<IncomingMessage>,
    poison: Arc<Mutex<Option<String>>>,
}

impl SessionDriver {
    async fn run(mut self) {
        let reason = match self.serve().await {
            // Every handle was dropped; nothing left to observe a result.
            Ok(()) => return,
            Err(reason) => reason,
        };
        self.shutdown(&reason);

        // Fail submissions that raced with the teardown, until the last
        // handle goes away.
        while let Some(cmd) = self.cmd_rx.recv().await {
            if let Command::Call { reply_tx, .. } = cmd {
                let _ = reply_tx.send(Err(reason.clone()));
            }
        }
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let interest = if self.waiting_to_send.is_empty() {
                Interest::READABLE
            } else {
                Interest::READABLE | Interest::WRITABLE
            };

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None => return Ok(()),
                        Some(Command::Call { nonce, request, reply_tx }) => {
                            self.submit(nonce, request, reply_tx).await?;
                        }
                        Some(Command::Cancel { nonce }) => self.cancel(nonce)?,
                    }
                }
                ready = ready_or_pending(self.stream.as_ref(), interest) => {
                    let ready = ready?;
                    if ready.is_readable() {
                        self.on_readable()?;
                    }
                    if ready.is_writable() {
                        self.on_writable()?;
                    }
                }
            }
        }
    }

    /// Connect on first use, queue the request, and try an inline write if
    /// the queue was idle.
    async fn submit(
        &mut self,
        nonce: u64,
        request: Buffer,
        reply_tx: oneshot::Sender<Result<Buffer>>,
    ) -> Result<()> {
        if let Err(e) = self.ensure_connected().await {
            let _ = reply_tx.send(Err(e.clone()));
            return Err(e);
        }

        let was_idle = self.waiting_to_send.is_empty();
        self.waiting_to_send.push_back(PendingRpc {
            nonce,
            frame: OutboundFrame::new(nonce, request),
            reply_tx,
        });
        if was_idle {
            self.on_writable()?;
        }
        Ok(())
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = TcpStream::connect(self.addr.as_str())
            .await
            .map_err(|source| TransportError::Connect {
                addr: self.addr.clone(),
                source,
            })?;
        stream.set_nodelay(true).map_err(TransportError::Io)?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Drain the send queue. Each fully written request moves to
    /// `waiting_for_response`; a partial write leaves the frame at the
    /// front to resume on the next writability event.
    fn on_writable(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_ref() else {
            return Ok(());
        };
        loop {
            match self.waiting_to_send.front_mut() {
                None => return Ok(()),
                Some(front) => {
                    if front.frame.write_some(stream).map_err(TransportError::Io)? > 0 {
                        return Ok(());
                    }
                }
            }
            if let Some(sent) = self.waiting_to_send.pop_front() {
                self.waiting_for_response.push_back(AwaitingRpc {
                    nonce: sent.nonce,
                    reply_tx: sent.reply_tx,
                });
            }
        }
    }

    /// Drive the response reader while bytes are available. Completed
    /// responses resolve their RPC; unmatched nonces are drained and
    /// discarded without disturbing the session.
    fn on_readable(&mut self) -> Result<()> {
        loop {
            let Some(stream) = self.stream.as_ref() else {
                return Ok(());
            };
            let msg = self.message.get_or_insert_with(IncomingMessage::new);
            match msg.advance(stream)? {
                Progress::Incomplete => return Ok(()),
                Progress::HeaderReady(header) => {
                    let sink = Self::claim_reply(
                        &mut self.waiting_for_response,
                        &mut self.current,
                        header.nonce,
                    );
                    if sink.is_none() {
                        tracing::debug!(
                            nonce = header.nonce,
                            "discarding response with unknown nonce"
                        );
                    }
                    msg.attach_sink(sink);
                }
                Progress::Complete => {
                    let Some(done) = self.message.take() else {
                        return Ok(());
                    };
                    if done.is_oversized() {
                        return Err(done.oversize_violation());
                    }
                    let (header, payload) = done.take();
                    if let Some(rpc) = self.current.take() {
                        debug_assert_eq!(rpc.nonce, header.nonce);
                        let _ = rpc.reply_tx.send(Ok(payload.unwrap_or_default()));
                    }
                }
            }
        }
    }

    /// Detach the RPC matching `nonce` from the response queue and make it
    /// current, handing back a fresh reply buffer for the reader. `None`
    /// means no such RPC and the body should be discarded.
    fn claim_reply(
        waiting: &mut VecDeque<AwaitingRpc>,
        current: &mut Option<AwaitingRpc>,
        nonce: u64,
    ) -> Option<Buffer> {
        let pos = waiting.iter().position(|rpc| rpc.nonce == nonce)?;
        let rpc = waiting.remove(pos)?;
        *current = Some(rpc);
        Some(Buffer::new())
    }

    fn cancel(&mut self, nonce: u64) -> Result<()> {
        if let Some(pos) = self.waiting_to_send.iter().position(|r| r.nonce == nonce) {
            let front_started = self
                .waiting_to_send
                .front()
                .map(|r| r.frame.started())
                .unwrap_or(false);
            if pos == 0 && front_started {
                // Part of the request is already on the wire; the peer
                // would misparse whatever followed.
                if let Some(rpc) = self.waiting_to_send.pop_front() {
                    let _ = rpc.reply_tx.send(Err(TransportError::Canceled));
                }
                return Err(TransportError::Protocol(
                    "request cancelled mid-transmission".into(),
                ));
            }
            if let Some(rpc) = self.waiting_to_send.remove(pos) {
                let _ = rpc.reply_tx.send(Err(TransportError::Canceled));
            }
            return Ok(());
        }

        if self.current.as_ref().map(|r| r.nonce) == Some(nonce) {
            if let Some(rpc) = self.current.take() {
                let _ = rpc.reply_tx.send(Err(TransportError::Canceled));
            }
            // Keep draining the body so the stream stays framed.
            if let Some(msg) = self.message.as_mut() {
                msg.abandon_sink();
            }
            return Ok(());
        }

        if let Some(pos) = self
            .waiting_for_response
            .iter()
            .position(|r| r.nonce == nonce)
        {
            if let Some(rpc) = self.waiting_for_response.remove(pos) {
                let _ = rpc.reply_tx.send(Err(TransportError::Canceled));
            }
        }
        Ok(())
    }

    /// Record the failure, fail every RPC bound to this session, and drop
    /// the socket. The session is unusable from here on.
    fn shutdown(&mut self, reason: &TransportError) {
        {
            let mut slot = self.poison.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
        tracing::debug!(addr = %self.addr, error = %reason, "session torn down");

        for rpc in self.waiting_to_send.drain(..) {
            let _ = rpc.reply_tx.send(Err(reason.clone()));
        }
        for rpc in self.waiting_for_response.drain(..) {
            let _ = rpc.reply_tx.send(Err(reason.clone()));
        }
        if let Some(rpc) = self.current.take() {
            let _ = rpc.reply_tx.send(Err(reason.clone()));
        }
        self.message = None;
        self.stream = None;
    }
}

/// Readiness on a connected stream, or never for a session that has no
/// socket yet (commands are the only thing that can wake it).
async fn ready_or_pending(
    stream: Option<&TcpStream>,
    interest: Interest,
) -> std::io::Result<tokio::io::Ready> {
    match stream {
        Some(stream) => stream.ready(interest).await,
        None => std::future::pending().await,
    }
}
