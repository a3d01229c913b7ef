mod connection;
mod scan;
pub mod state;

use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::bluetooth::{Radio, RadioEvent};
use crate::config::SessionConfig;
use crate::error::{ConnectFailure, SessionError};

pub use connection::{ChannelAccess, ReadStrategy};
pub use state::{ConnectionState, ScanState, SessionEvent, SessionState};

use connection::ConnectionHandle;

/// Capacity of the session event broadcast.
const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Everything mutable, guarded by a single lock.
struct Machine {
    state: SessionState,
    scan_round: u64,
    scan_timer: Option<JoinHandle<()>>,
    /// Bumped on every connect attempt and every forced teardown.
    attempt: u64,
    /// Fires with the reason a pending connect was abandoned.
    cancel_connect: Option<oneshot::Sender<ConnectFailure>>,
    link: Option<ConnectionHandle>,
}

struct Inner {
    radio: Arc<dyn Radio>,
    config: SessionConfig,
    machine: Mutex<Machine>,
    state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

/// Scan controller, connection manager and the observable state they share
///
/// A cheap clonable handle. Commands (`start_scan`, `connect`, ...) are
/// methods on it; radio events are fed in through [`SessionManager::run`] or
/// [`SessionManager::handle_event`]. Every transition happens under one lock
/// and is published to a `watch` snapshot and a `broadcast` event stream.
/// Overlapping requests are rejected, never queued.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Build a session around an already opened radio
    ///
    /// The adapter's current power state seeds `radio_enabled`; later
    /// changes arrive as [`RadioEvent::PoweredChanged`].
    pub async fn new(radio: Arc<dyn Radio>, config: SessionConfig) -> Result<Self, SessionError> {
        let radio_enabled = radio.is_powered().await?;
        info!("Bluetooth adapter powered: {}", radio_enabled);

        let state = SessionState::new(radio_enabled);
        let (state_tx, _) = watch::channel(state.clone());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(SessionManager {
            inner: Arc::new(Inner {
                radio,
                config,
                machine: Mutex::new(Machine {
                    state,
                    scan_round: 0,
                    scan_timer: None,
                    attempt: 0,
                    cancel_connect: None,
                    link: None,
                }),
                state_tx,
                events,
            }),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Current state of the session.
    pub fn snapshot(&self) -> SessionState {
        self.machine().state.clone()
    }

    /// Receiver that observes every published state change.
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Drain radio events until the radio side hangs up.
    pub async fn run(self, mut events: mpsc::Receiver<RadioEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("Radio event channel closed");
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(&self, events: mpsc::Receiver<RadioEvent>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(events))
    }

    /// Apply one radio event to the session.
    pub async fn handle_event(&self, event: RadioEvent) {
        match event {
            RadioEvent::Advertisement {
                id,
                name,
                rssi,
                connectable,
            } => self.on_advertisement(id, name, rssi, connectable),
            RadioEvent::Notification {
                peripheral,
                wire_id,
                value,
            } => {
                self.accept_value(&peripheral, wire_id, &value);
            }
            RadioEvent::Disconnected(peripheral) => self.on_link_lost(peripheral).await,
            RadioEvent::PoweredChanged(powered) => self.on_power_changed(powered).await,
        }
    }

    async fn on_power_changed(&self, powered: bool) {
        if powered {
            self.transition(|m, events| {
                if !m.state.radio_enabled {
                    m.state.radio_enabled = true;
                    events.push(SessionEvent::RadioEnabledChanged(true));
                }
            });
            info!("Bluetooth adapter powered on");
            return;
        }

        // Hard reset: nothing is negotiated with a radio that is already off.
        let peer = self.transition(|m, events| {
            if m.state.radio_enabled {
                m.state.radio_enabled = false;
                events.push(SessionEvent::RadioEnabledChanged(false));
            }
            scan::end_scan_round(m, events);
            m.state.discovered.clear();

            if m.state.connection_state == ConnectionState::Disconnected {
                return None;
            }
            let peer = m.state.connected_peripheral.as_ref().map(|d| d.id.clone());
            m.attempt += 1;
            m.cancel_connect = None;
            m.link = None;
            m.state.clear_connection();
            events.push(SessionEvent::ConnectionStateChanged(
                ConnectionState::Disconnected,
            ));
            peer
        });
        warn!("Bluetooth adapter powered off, session reset");

        // Release backend resources; failures are expected with the adapter down.
        if let Err(e) = self.inner.radio.stop_discovery().await {
            debug!("Stopping discovery after power loss: {}", e);
        }
        if let Some(peer) = peer {
            if let Err(e) = self.inner.radio.disconnect(&peer).await {
                debug!("Dropping link to {} after power loss: {}", peer, e);
            }
        }
    }

    fn machine(&self) -> MutexGuard<'_, Machine> {
        self.inner
            .machine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one state transition under the lock, then publish what changed.
    fn transition<T>(&self, f: impl FnOnce(&mut Machine, &mut Vec<SessionEvent>) -> T) -> T {
        let mut machine = self.machine();
        let mut events = Vec::new();
        let result = f(&mut machine, &mut events);

        self.inner.state_tx.send_if_modified(|published| {
            if *published != machine.state {
                *published = machine.state.clone();
                true
            } else {
                false
            }
        });
        for event in events {
            // No subscribers is fine.
            let _ = self.inner.events.send(event);
        }
        result
    }
}
