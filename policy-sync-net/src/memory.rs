//! In-memory transport
//!
//! A [`MemoryNetwork`] connects channels inside one process through bounded
//! tokio mpsc queues. Endpoints can be severed and restored to simulate
//! unreachable participants.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

use crate::protocol::Envelope;
use crate::traits::{ChannelListener, Connector, Endpoint, HeartbeatChannel, RecvMode};
use crate::{ChannelError, Result};

/// Buffered envelopes per direction
const CHANNEL_DEPTH: usize = 64;

/// Pending inbound connections per listener
const ACCEPT_BACKLOG: usize = 16;

#[derive(Default)]
struct NetState {
    listeners: HashMap<Endpoint, mpsc::Sender<MemoryChannel>>,
    severed: HashMap<Endpoint, Arc<AtomicBool>>,
}

/// A process-local network of named endpoints
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetState>>,
}

impl core::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryNetwork")
            .field("listeners", &state.listeners.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flag(state: &mut NetState, endpoint: &Endpoint) -> Arc<AtomicBool> {
        state
            .severed
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    /// Register a listener under `endpoint`, replacing any previous one
    pub fn listen(&self, endpoint: impl Into<Endpoint>) -> MemoryListener {
        let endpoint = endpoint.into();
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let mut state = self.lock();
        Self::flag(&mut state, &endpoint);
        state.listeners.insert(endpoint.clone(), tx);
        MemoryListener {
            endpoint,
            incoming: tokio::sync::Mutex::new(rx),
        }
    }

    /// Make every channel to `endpoint` fail, and refuse new connections
    pub fn sever(&self, endpoint: &Endpoint) {
        let mut state = self.lock();
        Self::flag(&mut state, endpoint).store(true, Ordering::SeqCst);
    }

    /// Undo [`sever`](Self::sever); channels opened earlier stay broken
    pub fn restore(&self, endpoint: &Endpoint) {
        let mut state = self.lock();
        state
            .severed
            .insert(endpoint.clone(), Arc::new(AtomicBool::new(false)));
    }

    /// A connected channel pair, without going through a listener
    pub fn pair(endpoint: impl Into<Endpoint>) -> (MemoryChannel, MemoryChannel) {
        let endpoint = endpoint.into();
        let severed = Arc::new(AtomicBool::new(false));
        Self::link(endpoint, severed)
    }

    fn link(endpoint: Endpoint, severed: Arc<AtomicBool>) -> (MemoryChannel, MemoryChannel) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_DEPTH);
        let client = MemoryChannel {
            endpoint: endpoint.clone(),
            tx: a_tx,
            rx: b_rx,
            severed: severed.clone(),
        };
        let server = MemoryChannel {
            endpoint: Endpoint::new(format!("peer-of-{endpoint}")),
            tx: b_tx,
            rx: a_rx,
            severed,
        };
        (client, server)
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn HeartbeatChannel>> {
        let (listener, severed) = {
            let mut state = self.lock();
            let severed = Self::flag(&mut state, endpoint);
            let listener = state.listeners.get(endpoint).cloned();
            (listener, severed)
        };
        if severed.load(Ordering::SeqCst) {
            return Err(ChannelError::unreachable(endpoint.as_str(), "endpoint severed"));
        }
        let listener = listener.ok_or_else(|| ChannelError::NoListener(endpoint.to_string()))?;

        let (client, server) = Self::link(endpoint.clone(), severed);
        listener
            .try_send(server)
            .map_err(|_| ChannelError::unreachable(endpoint.as_str(), "listener not accepting"))?;
        tracing::debug!(%endpoint, "memory channel connected");
        Ok(Box::new(client))
    }
}

/// One side of an in-memory duplex channel
#[derive(Debug)]
pub struct MemoryChannel {
    endpoint: Endpoint,
    tx: mpsc::Sender<Envelope>,
    rx: mpsc::Receiver<Envelope>,
    severed: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn check_link(&self) -> Result<()> {
        if self.severed.load(Ordering::SeqCst) {
            return Err(ChannelError::unreachable(self.endpoint.as_str(), "endpoint severed"));
        }
        Ok(())
    }
}

#[async_trait]
impl HeartbeatChannel for MemoryChannel {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        self.check_link()?;
        self.tx.try_send(envelope.clone()).map_err(|e| match e {
            TrySendError::Full(_) => {
                ChannelError::unreachable(self.endpoint.as_str(), "peer backlog full")
            }
            TrySendError::Closed(_) => ChannelError::Closed(self.endpoint.to_string()),
        })
    }

    async fn recv(&mut self, mode: RecvMode) -> Result<Option<Envelope>> {
        self.check_link()?;
        match mode {
            RecvMode::NonBlocking => match self.rx.try_recv() {
                Ok(env) => Ok(Some(env)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => {
                    Err(ChannelError::Closed(self.endpoint.to_string()))
                }
            },
            RecvMode::Timeout(wait) => match tokio::time::timeout(wait, self.rx.recv()).await {
                Ok(Some(env)) => Ok(Some(env)),
                Ok(None) => Err(ChannelError::Closed(self.endpoint.to_string())),
                Err(_) => Ok(None),
            },
        }
    }
}

/// Accepts channels opened to one endpoint of a [`MemoryNetwork`]
#[derive(Debug)]
pub struct MemoryListener {
    endpoint: Endpoint,
    incoming: tokio::sync::Mutex<mpsc::Receiver<MemoryChannel>>,
}

#[async_trait]
impl ChannelListener for MemoryListener {
    fn local_endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn accept(&self) -> Result<Box<dyn HeartbeatChannel>> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(channel) => Ok(Box::new(channel)),
            None => Err(ChannelError::Closed(self.endpoint.to_string())),
        }
    }
}
