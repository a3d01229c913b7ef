use std::collections::BTreeMap;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::DecodeError;
use crate::models::{Channel, ChannelSet, PeripheralDescriptor, PeripheralId, Reading};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Observable aggregate of the probe session.
///
/// Only the session manager writes it; consumers get clones through
/// [`SessionManager::snapshot`](super::SessionManager::snapshot) or a
/// `watch` receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub radio_enabled: bool,
    pub scan_state: ScanState,
    /// First-seen order within the current scan round.
    pub discovered: Vec<PeripheralDescriptor>,
    pub connection_state: ConnectionState,
    /// Target while connecting, the linked peripheral while connected.
    pub connected_peripheral: Option<PeripheralDescriptor>,
    pub confirmed_channels: ChannelSet,
    pub last_reading: Option<Reading>,
    /// Receipt time of the latest decoded value per channel.
    pub freshness: BTreeMap<Channel, OffsetDateTime>,
}

impl SessionState {
    pub fn new(radio_enabled: bool) -> Self {
        SessionState {
            radio_enabled,
            scan_state: ScanState::Idle,
            discovered: Vec::new(),
            connection_state: ConnectionState::Disconnected,
            connected_peripheral: None,
            confirmed_channels: ChannelSet::new(),
            last_reading: None,
            freshness: BTreeMap::new(),
        }
    }

    pub fn discovered_peripheral(&self, id: &PeripheralId) -> Option<&PeripheralDescriptor> {
        self.discovered.iter().find(|d| &d.id == id)
    }

    /// Whether `id` is the peripheral being connected to or already linked.
    pub fn targets(&self, id: &PeripheralId) -> bool {
        self.connected_peripheral.as_ref().map(|d| &d.id) == Some(id)
    }

    /// Drop everything tied to the current link.
    pub(crate) fn clear_connection(&mut self) {
        self.connection_state = ConnectionState::Disconnected;
        self.connected_peripheral = None;
        self.confirmed_channels.clear();
        self.last_reading = None;
        self.freshness.clear();
    }
}

/// Discrete notifications published alongside state changes.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ScanStarted,
    /// Emitted for both explicit stops and timeouts.
    ScanStopped,
    PeripheralDiscovered(PeripheralDescriptor),
    ConnectionStateChanged(ConnectionState),
    /// The link dropped without the caller asking for it.
    ConnectionLost(PeripheralId),
    ReadingUpdated(Reading),
    RadioEnabledChanged(bool),
    DecodeFailed {
        peripheral: PeripheralId,
        wire_id: Uuid,
        error: DecodeError,
    },
}
