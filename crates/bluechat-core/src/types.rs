//! Core types for BlueChat
//!
//! Peer devices, chat messages and the connection event protocol shared by
//! the engine and its coordinator.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Service Identity
// ----------------------------------------------------------------------------

/// Well-known UUID of the chat service (the serial port profile UUID)
pub const CHAT_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// SDP name registered for the chat service
pub const CHAT_SERVICE_NAME: &str = "chat_service";

/// Capacity of one inbound read
pub const READ_CHUNK_SIZE: usize = 1024;

/// Failure reason when the listening endpoint stops accepting
pub const REASON_SERVER_CLOSED: &str = "Server closed";

/// Failure reason when an outbound connect attempt fails
pub const REASON_CONNECTION_FAILED: &str = "Connection failed";

/// Failure reason when an established link drops
pub const REASON_CONNECTION_LOST: &str = "Connection lost";

/// Service record both peers agree on. There is no handshake beyond it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub uuid: Uuid,
    pub name: String,
}

impl Default for ServiceRecord {
    fn default() -> Self {
        Self {
            uuid: CHAT_SERVICE_UUID,
            name: CHAT_SERVICE_NAME.to_string(),
        }
    }
}

impl fmt::Display for ServiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.uuid)
    }
}

// ----------------------------------------------------------------------------
// Peer Devices
// ----------------------------------------------------------------------------

/// A discoverable or bonded remote endpoint.
///
/// Two devices are the same device when their addresses match; the name is
/// informational and may change between sightings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDevice {
    pub name: Option<String>,
    pub address: String,
}

impl PeerDevice {
    pub fn new<A: Into<String>>(name: Option<String>, address: A) -> Self {
        Self {
            name,
            address: address.into(),
        }
    }

    /// Device with a known name
    pub fn named<N: Into<String>, A: Into<String>>(name: N, address: A) -> Self {
        Self::new(Some(name.into()), address)
    }

    /// Name for display, falling back to the address
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

impl PartialEq for PeerDevice {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for PeerDevice {}

impl Hash for PeerDevice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for PeerDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} [{}]", name, self.address),
            None => write!(f, "[{}]", self.address),
        }
    }
}

/// Raw record delivered by a radio while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredRecord {
    pub name: Option<String>,
    pub address: String,
    /// Signal strength, when the platform reports it
    pub rssi: Option<i16>,
}

impl DiscoveredRecord {
    pub fn new<A: Into<String>>(name: Option<String>, address: A) -> Self {
        Self {
            name,
            address: address.into(),
            rssi: None,
        }
    }
}

impl From<DiscoveredRecord> for PeerDevice {
    fn from(record: DiscoveredRecord) -> Self {
        PeerDevice {
            name: record.name,
            address: record.address,
        }
    }
}

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageSender {
    /// Written on this device and delivered to the transport
    Local,
    /// Received from the connected peer
    Remote,
    /// Produced by the application, e.g. a rendered failure
    System,
}

/// One chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
    pub sender: MessageSender,
}

impl Message {
    pub fn new<T: Into<String>>(text: T, sender: MessageSender) -> Self {
        Self {
            text: text.into(),
            sender,
        }
    }

    pub fn local<T: Into<String>>(text: T) -> Self {
        Self::new(text, MessageSender::Local)
    }

    pub fn remote<T: Into<String>>(text: T) -> Self {
        Self::new(text, MessageSender::Remote)
    }

    pub fn system<T: Into<String>>(text: T) -> Self {
        Self::new(text, MessageSender::System)
    }

    pub fn is_from_local_user(&self) -> bool {
        self.sender == MessageSender::Local
    }
}

// ----------------------------------------------------------------------------
// Connection Events
// ----------------------------------------------------------------------------

/// Lifecycle events produced by a listen or dial sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A transport is open and the message stream is running
    Established,
    /// A chunk arrived from the peer
    TransferSucceeded(Message),
    /// Setup or link failure; the reason is user-presentable
    Failed(String),
}

impl ConnectionEvent {
    pub fn failed<T: Into<String>>(reason: T) -> Self {
        ConnectionEvent::Failed(reason.into())
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ConnectionEvent::Failed(_))
    }
}
