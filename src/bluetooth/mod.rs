pub mod bluer_radio;
pub mod decoder;
pub mod registry;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::RadioError;
use crate::models::PeripheralId;

pub use bluer_radio::BluerRadio;

/// Buffer size of the radio event channel.
pub const RADIO_EVENT_BUFFER_SIZE: usize = 64;

/// One exposed GATT characteristic, as seen during capability negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub notify: bool,
    pub read: bool,
}

/// Events pushed by the radio stack.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    Advertisement {
        id: PeripheralId,
        name: Option<String>,
        rssi: Option<i16>,
        connectable: bool,
    },
    Notification {
        peripheral: PeripheralId,
        wire_id: Uuid,
        value: Vec<u8>,
    },
    Disconnected(PeripheralId),
    PoweredChanged(bool),
}

/// Operations the session needs from the underlying radio adapter
///
/// The session never reaches a global adapter: it is handed one `Radio` at
/// construction. Advertisements, notifications, link loss and power changes
/// arrive as [`RadioEvent`]s on a channel the caller wires to
/// [`SessionManager::run`](crate::session::SessionManager::run).
#[async_trait]
pub trait Radio: Send + Sync {
    async fn is_powered(&self) -> Result<bool, RadioError>;

    /// Ask the platform for scan/connect permissions, returning whether they are granted.
    async fn request_permissions(&self) -> Result<bool, RadioError>;

    async fn start_discovery(&self) -> Result<(), RadioError>;

    async fn stop_discovery(&self) -> Result<(), RadioError>;

    /// Establish the link. Callers bound this with their own timeout.
    async fn connect(&self, peripheral: &PeripheralId) -> Result<(), RadioError>;

    /// Tear down the link (or abort a pending one) and drop its subscriptions.
    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<(), RadioError>;

    /// Enumerate every characteristic the connected peripheral exposes.
    async fn characteristics(
        &self,
        peripheral: &PeripheralId,
    ) -> Result<Vec<CharacteristicInfo>, RadioError>;

    async fn read(&self, peripheral: &PeripheralId, wire_id: Uuid) -> Result<Vec<u8>, RadioError>;

    /// Start forwarding value changes as [`RadioEvent::Notification`].
    async fn subscribe(&self, peripheral: &PeripheralId, wire_id: Uuid) -> Result<(), RadioError>;
}
