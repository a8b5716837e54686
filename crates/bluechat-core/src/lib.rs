//! BlueChat Core
//!
//! Connection and messaging engine for two-peer chat over a short-range radio
//! link. One peer listens on a well-known service, the other dials it, and
//! both exchange unframed UTF-8 text over the resulting byte stream.
//!
//! ## Architecture
//!
//! - [`registry`] - discovered and bonded devices, published as snapshots
//! - [`discovery`] - scan lifecycle feeding the registry
//! - [`engine`] - listen/dial sessions, the single live connection handle
//! - [`stream`] - chunked read loop and best-effort send
//! - [`capability`] - radio and socket traits injected into the engine
//! - [`memory`] - in-memory radio medium for tests and demos
//!
//! ## Usage
//!
//! ```rust,no_run
//! use bluechat_core::{
//!     memory::MemoryAir, ConnectionEngine, ConnectionEvent, DeviceRegistry,
//!     DiscoveryController, EngineConfig,
//! };
//!
//! # async fn example() -> bluechat_core::Result<()> {
//! let air = MemoryAir::new();
//! let radio = air.radio("00:11:22:33:44:55", "desk");
//! let config = EngineConfig::default();
//! let discovery = DiscoveryController::new(radio.clone(), DeviceRegistry::new(), config.clone());
//! let engine = ConnectionEngine::new(radio, discovery, config)?;
//!
//! let mut events = engine.listen();
//! while let Some(event) = events.next_event().await {
//!     if let ConnectionEvent::TransferSucceeded(message) = event {
//!         println!("peer: {}", message.text);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod capability;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod errors;
pub mod memory;
pub mod registry;
pub mod stream;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use capability::{FoundDevices, IoSocket, RadioAdapter, ServerSocket, Socket, SocketFactory};
pub use config::EngineConfig;
pub use discovery::{DiscoveryController, DiscoveryPhase};
pub use engine::{ConnectionEngine, EnginePhase, EventStream};
pub use errors::{BluechatError, BluechatResult, Result};
pub use registry::{DeviceRegistry, RegistrySnapshot};
pub use stream::{MessageStream, StreamEnd};
pub use types::{
    ConnectionEvent, DiscoveredRecord, Message, MessageSender, PeerDevice, ServiceRecord,
    CHAT_SERVICE_NAME, CHAT_SERVICE_UUID, READ_CHUNK_SIZE,
};

// A panic while holding one of these locks leaves plain data behind, never a
// broken invariant, so the guard is recovered instead of propagating.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
