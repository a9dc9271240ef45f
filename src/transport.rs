//! Transport facade.
//!
//! A [`TcpTransport`] ties the pieces together for one process: it owns
//! the listen socket and the table of accepted connections (when built
//! with [`TcpTransport::bind`]), hands out client [`Session`]s, and
//! surfaces completed requests through [`TcpTransport::try_server_recv`].
//! A client-only instance skips the listener entirely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, TransportError};
use crate::locator::ServiceLocator;
use crate::server::{spawn_acceptor, ConnectionTable, ServerRpc};
use crate::session::Session;

/// Listen backlog for the server socket.
const LISTEN_BACKLOG: u32 = 128;

/// A kernel-TCP transport instance.
///
/// Dropping the transport stops the acceptor and tears down every
/// accepted connection; sessions handed out by [`TcpTransport::get_session`]
/// are independently owned and survive it.
pub struct TcpTransport {
    /// Locator this instance serves, with the kernel-assigned port filled
    /// in. Empty for a client-only instance.
    locator_string: String,
    listening: bool,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerRpc>>,
    accept_task: Option<JoinHandle<()>>,
    connections: ConnectionTable,
}

impl TcpTransport {
    /// Build a transport that only originates connections. `server_recv`
    /// on such an instance reports [`TransportError::NoListeningTransport`].
    pub fn client_only() -> Self {
        let (_tx, rx) = mpsc::unbounded_channel();
        Self {
            locator_string: String::new(),
            listening: false,
            incoming_rx: tokio::sync::Mutex::new(rx),
            accept_task: None,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open the listen socket described by `locator` and start accepting.
    ///
    /// `host` and `port` are required; `port=0` lets the kernel pick, and
    /// the advertised locator is rewritten with the actual port either
    /// way. Must be called from within a tokio runtime.
    pub async fn bind(locator: &ServiceLocator) -> Result<Self> {
        if !locator.is_tcp() {
            return Err(TransportError::BadLocator(format!(
                "unsupported protocol {:?}",
                locator.protocol()
            )));
        }
        let host = locator.host()?;
        let port = locator.port()?;

        let listener = Self::listen(host, port).await?;
        let local = listener.local_addr().map_err(TransportError::Io)?;
        let locator_string = format!("tcp:host={host},port={}", local.port());
        tracing::debug!(locator = %locator_string, "listening");

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let connections: ConnectionTable = Arc::new(Mutex::new(HashMap::new()));
        let accept_task = spawn_acceptor(listener, incoming_tx, connections.clone());

        Ok(Self {
            locator_string,
            listening: true,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            accept_task: Some(accept_task),
            connections,
        })
    }

    async fn listen(host: &str, port: u16) -> Result<TcpListener> {
        let mut last_err = None;
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| TransportError::BadLocator(format!("cannot resolve {host:?}: {e}")))?;
        for addr in addrs {
            let bound = (|| {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.set_reuseaddr(true)?;
                socket.bind(addr)?;
                socket.listen(LISTEN_BACKLOG)
            })();
            match bound {
                Ok(listener) => return Ok(listener),
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) => Err(TransportError::Io(e)),
            None => Err(TransportError::BadLocator(format!(
                "{host:?} resolved to no addresses"
            ))),
        }
    }

    /// The locator this instance serves, with the real port filled in.
    /// Empty for a client-only instance.
    pub fn service_locator(&self) -> &str {
        &self.locator_string
    }

    /// Open a session to the server named by `locator`. The connection
    /// itself is established lazily by the session's first call.
    pub fn get_session(&self, locator: &ServiceLocator) -> Result<Session> {
        if !locator.is_tcp() {
            return Err(TransportError::BadLocator(format!(
                "unsupported protocol {:?}",
                locator.protocol()
            )));
        }
        let host = locator.host()?;
        let port = locator.port()?;
        Ok(Session::open(host, port))
    }

    /// Poll for a completed request without blocking. `Ok(None)` means no
    /// request has finished arriving yet.
    pub fn try_server_recv(&self) -> Result<Option<ServerRpc>> {
        if !self.listening {
            return Err(TransportError::NoListeningTransport);
        }
        let Ok(mut rx) = self.incoming_rx.try_lock() else {
            // A concurrent server_recv holds the receiver; treat it as
            // nothing available right now.
            return Ok(None);
        };
        match rx.try_recv() {
            Ok(rpc) => Ok(Some(rpc)),
            Err(_) => Ok(None),
        }
    }

    /// Wait for the next completed request.
    pub async fn server_recv(&self) -> Result<ServerRpc> {
        if !self.listening {
            return Err(TransportError::NoListeningTransport);
        }
        let mut rx = self.incoming_rx.lock().await;
        rx.recv().await.ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "acceptor terminated",
            ))
        })
    }

    /// Memory registration is meaningless for a kernel-socket transport.
    pub fn register_memory(&self, _region: &[u8]) {}
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        for (_, task) in self
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
        {
            task.abort();
        }
    }
}
