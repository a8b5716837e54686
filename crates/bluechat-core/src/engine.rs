//! Connection engine
//!
//! Mediates one connection attempt at a time. `listen` and `dial` each start a
//! session task and hand back an [`EventStream`]; the task owns the transport
//! for the lifetime of the session and the engine keeps the exclusive
//! [`ConnectionHandle`] so `send` and `release` can reach it.
//!
//! Every way a session can end (failure, explicit `release`, or the consumer
//! dropping its stream) releases that session's handle exactly once. Handles
//! are tagged with a generation so a finished session can never tear down the
//! one that replaced it.

use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::capability::{ServerSocket, Socket, SocketFactory};
use crate::config::EngineConfig;
use crate::discovery::DiscoveryController;
use crate::errors::{BluechatError, Result};
use crate::lock_unpoisoned;
use crate::stream::{send_text, MessageStream, StreamEnd};
use crate::types::{ConnectionEvent, Message, PeerDevice, REASON_CONNECTION_FAILED, REASON_SERVER_CLOSED};

// ----------------------------------------------------------------------------
// Handle State
// ----------------------------------------------------------------------------

/// What the engine is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    Listening,
    Connecting,
    Connected,
}

/// Exclusive ownership of the open transport
#[derive(Default)]
struct ConnectionHandle {
    server: Option<Arc<dyn ServerSocket>>,
    socket: Option<Arc<dyn Socket>>,
    task: Option<AbortHandle>,
}

impl ConnectionHandle {
    fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
        if let Some(server) = self.server.take() {
            server.close();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn is_open(&self) -> bool {
        self.server.is_some() || self.socket.is_some() || self.task.is_some()
    }
}

struct HandleSlot {
    generation: u64,
    phase: EnginePhase,
    handle: ConnectionHandle,
}

struct EngineInner {
    factory: Arc<dyn SocketFactory>,
    discovery: DiscoveryController,
    config: EngineConfig,
    slot: StdMutex<HandleSlot>,
}

// ----------------------------------------------------------------------------
// Connection Engine
// ----------------------------------------------------------------------------

/// Owns at most one live transport and produces its event sequence
#[derive(Clone)]
pub struct ConnectionEngine {
    inner: Arc<EngineInner>,
}

impl ConnectionEngine {
    pub fn new(
        factory: Arc<dyn SocketFactory>,
        discovery: DiscoveryController,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                factory,
                discovery,
                config,
                slot: StdMutex::new(HandleSlot {
                    generation: 0,
                    phase: EnginePhase::Idle,
                    handle: ConnectionHandle::default(),
                }),
            }),
        })
    }

    pub fn discovery(&self) -> &DiscoveryController {
        &self.inner.discovery
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn phase(&self) -> EnginePhase {
        lock_unpoisoned(&self.inner.slot).phase
    }

    /// Whether a connected socket is currently held
    pub fn is_connected(&self) -> bool {
        lock_unpoisoned(&self.inner.slot)
            .handle
            .socket
            .as_ref()
            .is_some_and(|socket| socket.is_connected())
    }

    /// Accept inbound connections on the chat service, one session at a time.
    ///
    /// Must be called from within a tokio runtime.
    pub fn listen(&self) -> EventStream {
        self.start_session(EnginePhase::Listening, |session| async move {
            session.run_server().await;
            session.finish();
        })
    }

    /// Connect to `device` on the chat service.
    ///
    /// Discovery is stopped before the connect attempt starts. Must be called
    /// from within a tokio runtime.
    pub fn dial(&self, device: PeerDevice) -> EventStream {
        self.start_session(EnginePhase::Connecting, |session| async move {
            session.run_client(device).await;
            session.finish();
        })
    }

    /// Write `text` to the live socket. `None` when nothing was sent.
    pub async fn send(&self, text: &str) -> Option<Message> {
        let socket = lock_unpoisoned(&self.inner.slot).handle.socket.clone();
        match socket {
            Some(socket) => send_text(socket.as_ref(), text).await,
            None => {
                debug!("Not sending: no live connection");
                None
            }
        }
    }

    /// Close whatever is open. Always safe, including when idle.
    pub fn release(&self) {
        let mut slot = lock_unpoisoned(&self.inner.slot);
        if slot.handle.is_open() {
            info!("Releasing connection (generation {})", slot.generation);
        }
        slot.handle.close();
        slot.phase = EnginePhase::Idle;
    }

    fn start_session<F, Fut>(&self, phase: EnginePhase, run: F) -> EventStream
    where
        F: FnOnce(Session) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let generation = {
            let mut slot = lock_unpoisoned(&self.inner.slot);
            if slot.handle.is_open() {
                debug!("Tearing down generation {} for a new session", slot.generation);
            }
            slot.handle.close();
            slot.generation += 1;
            slot.phase = phase;
            slot.generation
        };

        let (events, receiver) = mpsc::channel(self.inner.config.event_buffer_size);
        let session = Session {
            engine: self.clone(),
            generation,
            events,
        };

        let task = tokio::spawn(run(session));

        {
            let mut slot = lock_unpoisoned(&self.inner.slot);
            if slot.generation == generation && slot.phase != EnginePhase::Idle {
                slot.handle.task = Some(task.abort_handle());
            }
        }

        EventStream {
            receiver,
            _guard: ReleaseGuard {
                engine: self.clone(),
                generation,
            },
        }
    }

    /// Release only if `generation` still owns the handle
    fn release_generation(&self, generation: u64) {
        let mut slot = lock_unpoisoned(&self.inner.slot);
        if slot.generation != generation || slot.phase == EnginePhase::Idle {
            return;
        }
        debug!("Session {} finished, releasing", generation);
        slot.handle.close();
        slot.phase = EnginePhase::Idle;
    }

    /// Store a transport for `generation`. Returns false if the session was
    /// superseded or released in the meantime, in which case the caller must
    /// drop the transport.
    fn adopt_server(&self, generation: u64, server: Arc<dyn ServerSocket>) -> bool {
        let mut slot = lock_unpoisoned(&self.inner.slot);
        if slot.generation != generation || slot.phase == EnginePhase::Idle {
            return false;
        }
        slot.handle.server = Some(server);
        true
    }

    fn adopt_socket(&self, generation: u64, socket: Arc<dyn Socket>) -> bool {
        let mut slot = lock_unpoisoned(&self.inner.slot);
        if slot.generation != generation || slot.phase == EnginePhase::Idle {
            return false;
        }
        slot.handle.socket = Some(socket);
        slot.phase = EnginePhase::Connected;
        true
    }

    /// Forget a finished socket so the accept loop can take the next one
    fn discard_socket(&self, generation: u64, next_phase: EnginePhase) {
        let mut slot = lock_unpoisoned(&self.inner.slot);
        if slot.generation != generation || slot.phase == EnginePhase::Idle {
            return;
        }
        if let Some(socket) = slot.handle.socket.take() {
            socket.close();
        }
        slot.phase = next_phase;
    }
}

// ----------------------------------------------------------------------------
// Session Tasks
// ----------------------------------------------------------------------------

struct Session {
    engine: ConnectionEngine,
    generation: u64,
    events: mpsc::Sender<ConnectionEvent>,
}

impl Session {
    async fn emit(&self, event: ConnectionEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    async fn preflight(&self) -> Result<()> {
        self.engine.discovery().ensure_radio_ready().await
    }

    /// Release the handle while the event sender is still alive, so a
    /// consumer that sees the sequence end also sees the engine idle.
    fn finish(self) {
        self.engine.release_generation(self.generation);
    }

    async fn run_server(&self) {
        if let Err(e) = self.preflight().await {
            warn!("Cannot listen: {}", e);
            self.emit(ConnectionEvent::failed(e.to_string())).await;
            return;
        }

        let config = self.engine.config();
        let server = match self.engine.inner.factory.listen(&config.service).await {
            Ok(server) => server,
            Err(e) => {
                warn!("Failed to open listening endpoint: {}", e);
                self.emit(ConnectionEvent::failed(REASON_SERVER_CLOSED)).await;
                return;
            }
        };
        if !self.engine.adopt_server(self.generation, server.clone()) {
            server.close();
            return;
        }
        info!("Listening for {}", config.service);

        loop {
            let socket = match server.accept().await {
                Ok(socket) => socket,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    self.emit(ConnectionEvent::failed(REASON_SERVER_CLOSED)).await;
                    return;
                }
            };

            info!("Accepted connection from {}", socket.peer_address());
            if !self.engine.adopt_socket(self.generation, socket.clone()) {
                socket.close();
                return;
            }
            if !self.emit(ConnectionEvent::Established).await {
                return;
            }

            let stream = MessageStream::new(socket, config.read_chunk_size);
            if stream.run(&self.events).await == StreamEnd::ConsumerGone {
                return;
            }

            self.engine.discard_socket(self.generation, EnginePhase::Listening);
            debug!("Session ended, waiting for the next connection");
        }
    }

    async fn run_client(&self, device: PeerDevice) {
        if let Err(e) = self.preflight().await {
            warn!("Cannot dial {}: {}", device, e);
            self.emit(ConnectionEvent::failed(e.to_string())).await;
            return;
        }

        // Scanning slows connection setup down; it must be off before connect
        self.engine.discovery().stop_discovery().await;

        let config = self.engine.config();
        info!("Connecting to {}", device);
        let attempt = self.engine.inner.factory.connect(&device.address, &config.service);
        let connected = match config.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(result) => result,
                Err(_) => Err(BluechatError::connect_failed(
                    device.address.clone(),
                    format!("timed out after {:?}", limit),
                )),
            },
            None => attempt.await,
        };

        let socket = match connected {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Connection to {} failed: {}", device, e);
                self.emit(ConnectionEvent::failed(REASON_CONNECTION_FAILED)).await;
                return;
            }
        };

        if !self.engine.adopt_socket(self.generation, socket.clone()) {
            socket.close();
            return;
        }
        info!("Connected to {}", device);
        if !self.emit(ConnectionEvent::Established).await {
            return;
        }

        MessageStream::new(socket, config.read_chunk_size)
            .run(&self.events)
            .await;
    }
}

// ----------------------------------------------------------------------------
// Event Stream
// ----------------------------------------------------------------------------

/// Events of one listen or dial sequence.
///
/// The sequence ends when the session fails terminally or is released.
/// Dropping the stream cancels the session and releases its transport.
pub struct EventStream {
    receiver: mpsc::Receiver<ConnectionEvent>,
    _guard: ReleaseGuard,
}

impl EventStream {
    /// Next event, or `None` once the sequence has ended
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.receiver.recv().await
    }
}

impl Stream for EventStream {
    type Item = ConnectionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

struct ReleaseGuard {
    engine: ConnectionEngine,
    generation: u64,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.engine.release_generation(self.generation);
    }
}
