//! Explicit transport registry.
//!
//! The registry maps protocol tokens to transport factories and fronts
//! the two process-wide operations: opening a session for a locator and
//! receiving the next request from whichever transports are listening.
//! Factories are registered by the program entry point at startup and
//! instantiated by a single [`TransportRegistry::initialize`] call;
//! nothing here runs from global initializers.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Result, TransportError};
use crate::locator::{ServiceLocator, TCP_PROTOCOLS};
use crate::server::ServerRpc;
use crate::session::Session;
use crate::transport::TcpTransport;

/// Future returned by a transport factory.
type FactoryFuture = Pin<Box<dyn Future<Output = Result<TcpTransport>> + Send>>;

/// Constructor closure registered for a set of protocol tokens. `Some`
/// carries the local locator the instance should listen on; `None` asks
/// for a client-only instance.
type FactoryFn = Box<dyn Fn(Option<ServiceLocator>) -> FactoryFuture + Send + Sync>;

struct Factory {
    protocols: Vec<&'static str>,
    create: FactoryFn,
}

struct RegistryEntry {
    protocols: Vec<&'static str>,
    transport: Arc<TcpTransport>,
    listening: bool,
}

/// Maps protocol tokens to transports; built once at startup.
#[derive(Default)]
pub struct TransportRegistry {
    factories: Vec<Factory>,
    entries: Vec<RegistryEntry>,
    initialized: bool,
    /// Round-robin cursor over the listening transports.
    next_to_listen: AtomicUsize,
}

impl TransportRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for the given protocol tokens. The closure
    /// receives the local locator to listen on, or `None` when the
    /// transport should only originate connections.
    pub fn register_factory<F, Fut>(&mut self, protocols: &[&'static str], create: F)
    where
        F: Fn(Option<ServiceLocator>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TcpTransport>> + Send + 'static,
    {
        self.factories.push(Factory {
            protocols: protocols.to_vec(),
            create: Box::new(move |local| Box::pin(create(local))),
        });
    }

    /// Register the kernel TCP transport factory under its protocol
    /// tokens (`tcp`, `kernelTcp`).
    pub fn register_kernel_tcp(&mut self) {
        self.register_factory(TCP_PROTOCOLS, |local| async move {
            match local {
                Some(locator) => TcpTransport::bind(&locator).await,
                None => Ok(TcpTransport::client_only()),
            }
        });
    }

    /// Instantiate every registered factory. Each factory is offered the
    /// first locator in `locator_list` whose protocol it serves and that
    /// instance will accept requests; factories matching no locator build
    /// client-only instances. An empty list instantiates everything
    /// client-only.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub async fn initialize(&mut self, locator_list: &str) -> Result<()> {
        assert!(!self.initialized, "registry already initialized");

        let locators = if locator_list.trim().is_empty() {
            Vec::new()
        } else {
            ServiceLocator::parse_list(locator_list)?
        };

        for factory in &self.factories {
            let local = locators
                .iter()
                .find(|l| factory.protocols.iter().any(|p| *p == l.protocol()))
                .cloned();
            let listening = local.is_some();
            let transport = (factory.create)(local).await?;
            self.entries.push(RegistryEntry {
                protocols: factory.protocols.clone(),
                transport: Arc::new(transport),
                listening,
            });
        }
        self.initialized = true;
        Ok(())
    }

    /// The locator strings of all listening transports.
    pub fn listening_locators(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.listening)
            .map(|e| e.transport.service_locator().to_string())
            .collect()
    }

    /// Open a session for a `;`-separated list of locator alternatives,
    /// tried in order against every transport registered for their
    /// protocol.
    pub fn get_session(&self, locator_list: &str) -> Result<Session> {
        let locators = ServiceLocator::parse_list(locator_list)?;
        for locator in &locators {
            for entry in &self.entries {
                if !entry.protocols.iter().any(|p| *p == locator.protocol()) {
                    continue;
                }
                match entry.transport.get_session(locator) {
                    Ok(session) => return Ok(session),
                    Err(e) => {
                        tracing::debug!(%locator, "transport refused to open session: {e}");
                    }
                }
            }
        }
        Err(TransportError::BadLocator(format!(
            "no transport for {locator_list:?}"
        )))
    }

    /// Poll every listening transport once, in round-robin order.
    pub fn try_server_recv(&self) -> Result<Option<ServerRpc>> {
        let listening: Vec<&RegistryEntry> =
            self.entries.iter().filter(|e| e.listening).collect();
        if listening.is_empty() {
            return Err(TransportError::NoListeningTransport);
        }
        for _ in 0..listening.len() {
            let i = self.next_to_listen.fetch_add(1, Ordering::Relaxed) % listening.len();
            if let Some(rpc) = listening[i].transport.try_server_recv()? {
                return Ok(Some(rpc));
            }
        }
        Ok(None)
    }

    /// Wait for the next request from any listening transport.
    pub async fn server_recv(&self) -> Result<ServerRpc> {
        let listening: Vec<&RegistryEntry> =
            self.entries.iter().filter(|e| e.listening).collect();
        if listening.is_empty() {
            return Err(TransportError::NoListeningTransport);
        }
        if listening.len() == 1 {
            return listening[0].transport.server_recv().await;
        }
        // Several listeners: poll round-robin, yielding between sweeps.
        loop {
            if let Some(rpc) = self.try_server_recv()? {
                return Ok(rpc);
            }
            tokio::task::yield_now().await;
        }
    }
}
