//! BLE Transport Abstraction
//!
//! The link session talks to the radio only through [`BleTransport`], which
//! is handed in at construction time. Platform backends and the simulated
//! peer implement it.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No BLE stack is reachable from this environment
    #[error("Bluetooth API unavailable")]
    Unsupported,

    /// The user dismissed the device chooser
    #[error("Device selection cancelled")]
    Cancelled,

    #[error("{0} not found")]
    NotFound(String),

    #[error("GATT error: {0}")]
    Gatt(String),

    #[error("Not connected")]
    NotConnected,
}

/// Remote device picked during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandle {
    /// Backend-specific identifier (address, path ...)
    pub id: String,
    pub name: String,
}

/// Role of a resolved characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Tactile,
    Mode,
    Status,
}

/// A resolved characteristic on the connected peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub kind: EndpointKind,
    pub uuid: String,
}

/// Asynchronous happenings on the link, delivered on the channel passed to
/// [`BleTransport::connect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Value pushed by a subscribed characteristic
    Notification { uuid: String, data: Vec<u8> },
    /// Link dropped without the session asking for it
    Disconnected,
}

/// Capability to reach one pin display over BLE
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Whether a BLE stack exists at all
    fn is_available(&self) -> bool;

    /// Find a peer whose advertised name starts with `name_prefix`
    async fn request_device(&self, name_prefix: &str) -> Result<PeerHandle, TransportError>;

    /// Open a GATT session; link events go to `events` until disconnect
    async fn connect(
        &self,
        peer: &PeerHandle,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError>;

    /// Look up a characteristic inside a service on the connected peer
    async fn resolve_endpoint(
        &self,
        service_uuid: &str,
        kind: EndpointKind,
        char_uuid: &str,
    ) -> Result<Endpoint, TransportError>;

    /// Enable notifications on a resolved endpoint
    async fn subscribe(&self, endpoint: &Endpoint) -> Result<(), TransportError>;

    /// Write a value; completes when the transport reports the outcome
    async fn write(&self, endpoint: &Endpoint, payload: &[u8]) -> Result<(), TransportError>;

    /// Close the GATT session if still linked
    async fn disconnect(&self);

    fn is_linked(&self) -> bool;
}
