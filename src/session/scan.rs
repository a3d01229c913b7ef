use log::{debug, error, info, warn};
use tokio::time::sleep;

use super::{Machine, ScanState, SessionEvent, SessionManager};
use crate::error::SessionError;
use crate::models::{PeripheralDescriptor, PeripheralId};
use crate::utils::matches_name_filter;

/// Close the current scan round, if any, aborting its timer.
///
/// Returns whether a scan was running, so the caller knows to stop discovery
/// on the radio once the lock is released.
pub(super) fn end_scan_round(m: &mut Machine, events: &mut Vec<SessionEvent>) -> bool {
    if let Some(timer) = m.scan_timer.take() {
        timer.abort();
    }
    if m.state.scan_state != ScanState::Scanning {
        return false;
    }
    m.state.scan_state = ScanState::Idle;
    events.push(SessionEvent::ScanStopped);
    true
}

impl SessionManager {
    /// Start a fresh scan round
    ///
    /// Clears the discovered list and arms the scan timeout. Calling this
    /// while already scanning changes nothing and keeps the running timeout.
    pub async fn start_scan(&self) -> Result<ScanState, SessionError> {
        {
            let m = self.machine();
            check_can_scan(m.state.radio_enabled, m.state.connection_state)?;
            if m.state.scan_state == ScanState::Scanning {
                debug!("Scan already running");
                return Ok(ScanState::Scanning);
            }
        }

        if !self.inner.radio.request_permissions().await? {
            warn!("Bluetooth permissions not granted, cannot scan");
            return Err(SessionError::PermissionDenied);
        }

        let round = self.transition(|m, events| -> Result<Option<u64>, SessionError> {
            check_can_scan(m.state.radio_enabled, m.state.connection_state)?;
            if m.state.scan_state == ScanState::Scanning {
                return Ok(None);
            }
            m.scan_round += 1;
            m.state.scan_state = ScanState::Scanning;
            m.state.discovered.clear();
            events.push(SessionEvent::ScanStarted);
            Ok(Some(m.scan_round))
        })?;
        let Some(round) = round else {
            return Ok(ScanState::Scanning);
        };

        if let Err(e) = self.inner.radio.start_discovery().await {
            error!("Failed to start scan: {}", e);
            self.transition(|m, events| {
                if m.scan_round == round {
                    end_scan_round(m, events);
                }
            });
            return Err(e.into());
        }

        let timeout = self.inner.config.scan_timeout;
        let this = self.clone();
        let timer = tokio::spawn(async move {
            sleep(timeout).await;
            if this.finish_scan(Some(round)).await {
                info!("Scan stopped automatically after {:?}", timeout);
            }
        });

        let still_current = self.transition(|m, _| {
            if m.scan_round == round && m.state.scan_state == ScanState::Scanning {
                m.scan_timer = Some(timer);
                true
            } else {
                timer.abort();
                false
            }
        });

        if !still_current {
            // A connect or power loss ended the round while discovery was starting.
            if let Err(e) = self.inner.radio.stop_discovery().await {
                warn!("Failed to stop superseded scan: {}", e);
            }
            return Ok(ScanState::Idle);
        }

        info!("Scan started ({:?} window)", timeout);
        Ok(ScanState::Scanning)
    }

    /// Stop scanning; a no-op when already idle.
    pub async fn stop_scan(&self) -> Result<ScanState, SessionError> {
        if self.finish_scan(None).await {
            info!("Scan stopped");
        }
        Ok(ScanState::Idle)
    }

    /// End the running round. `timer_round` is set when the timeout fires,
    /// so a stale timer cannot stop a later round.
    async fn finish_scan(&self, timer_round: Option<u64>) -> bool {
        let stopped = self.transition(|m, events| match timer_round {
            Some(round) => {
                if round != m.scan_round || m.state.scan_state != ScanState::Scanning {
                    return false;
                }
                // Detach rather than abort: this runs on the timer task itself.
                m.scan_timer.take();
                end_scan_round(m, events)
            }
            None => end_scan_round(m, events),
        });

        if stopped {
            if let Err(e) = self.inner.radio.stop_discovery().await {
                warn!("Failed to stop discovery: {}", e);
            }
        }
        stopped
    }

    pub(super) fn on_advertisement(
        &self,
        id: PeripheralId,
        name: Option<String>,
        rssi: Option<i16>,
        connectable: bool,
    ) {
        let filter = self.inner.config.name_filter.as_deref();
        self.transition(|m, events| {
            if m.state.scan_state != ScanState::Scanning {
                debug!("Ignoring advertisement from {} outside a scan", id);
                return;
            }

            if let Some(existing) = m.state.discovered.iter_mut().find(|d| d.id == id) {
                if rssi.is_some() {
                    existing.rssi = rssi;
                }
                return;
            }

            if !matches_name_filter(filter, name.as_deref()) {
                return;
            }

            let descriptor = PeripheralDescriptor {
                id,
                name,
                rssi,
                connectable,
            };
            debug!(
                "Found device: {} ({}) rssi={:?}",
                descriptor.display_name(),
                descriptor.id,
                descriptor.rssi
            );
            m.state.discovered.push(descriptor.clone());
            events.push(SessionEvent::PeripheralDiscovered(descriptor));
        });
    }
}

fn check_can_scan(
    radio_enabled: bool,
    connection: super::ConnectionState,
) -> Result<(), SessionError> {
    if !radio_enabled {
        return Err(SessionError::AdapterDisabled);
    }
    if connection == super::ConnectionState::Connecting {
        return Err(SessionError::AlreadyConnecting);
    }
    Ok(())
}
