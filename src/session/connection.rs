use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tokio::time::timeout;
use uuid::Uuid;

use super::{scan, ConnectionState, SessionEvent, SessionManager};
use crate::bluetooth::{decoder, registry, CharacteristicInfo};
use crate::error::{ConnectFailure, DecodeError, RadioError, SessionError};
use crate::models::{Channel, ChannelSet, PeripheralDescriptor, PeripheralId, Reading};

/// How values of one channel reach the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
    /// Value-change notifications pushed by the probe.
    Notify,
    /// Explicit reads.
    Poll,
}

/// What negotiation learned about one confirmed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelAccess {
    pub strategy: ReadStrategy,
    pub readable: bool,
}

/// The single live link and the channels confirmed on it.
pub(crate) struct ConnectionHandle {
    pub(crate) peripheral: PeripheralDescriptor,
    pub(crate) channels: BTreeMap<Channel, ChannelAccess>,
}

/// Intersect what the peripheral exposes with the channel registry.
///
/// Characteristics that are neither readable nor notifiable carry no data
/// and are left out. A channel exposed twice keeps notification support if
/// either copy has it.
pub fn negotiate(exposed: &[CharacteristicInfo]) -> BTreeMap<Channel, ChannelAccess> {
    let mut confirmed: BTreeMap<Channel, ChannelAccess> = BTreeMap::new();
    for info in exposed {
        let Some(spec) = registry::resolve(info.uuid) else {
            continue;
        };
        if !info.notify && !info.read {
            debug!("{} is exposed without read or notify, skipping", spec.channel);
            continue;
        }
        let access = confirmed.entry(spec.channel).or_insert(ChannelAccess {
            strategy: ReadStrategy::Poll,
            readable: false,
        });
        if info.notify {
            access.strategy = ReadStrategy::Notify;
        }
        access.readable |= info.read;
    }
    confirmed
}

impl SessionManager {
    /// Connect to one probe and negotiate its channels
    ///
    /// Stops a running scan first, then links with the configured timeout
    /// and enumerates the exposed characteristics. Only one connection may
    /// exist; failures leave the session `Disconnected` and are not retried.
    ///
    /// # Returns
    /// The confirmed-present channel set
    pub async fn connect(
        &self,
        peripheral: impl Into<PeripheralDescriptor>,
    ) -> Result<ChannelSet, SessionError> {
        let requested = peripheral.into();

        let (attempt, cancelled, was_scanning, descriptor) = self.transition(|m, events| {
            if !m.state.radio_enabled {
                return Err(SessionError::AdapterDisabled);
            }
            match m.state.connection_state {
                ConnectionState::Connecting => return Err(SessionError::AlreadyConnecting),
                ConnectionState::Connected => {
                    let current = m
                        .state
                        .connected_peripheral
                        .as_ref()
                        .map(|d| d.id.clone())
                        .unwrap_or_else(|| requested.id.clone());
                    return Err(SessionError::AlreadyConnected(current));
                }
                ConnectionState::Disconnected => {}
            }

            let descriptor = m
                .state
                .discovered_peripheral(&requested.id)
                .cloned()
                .unwrap_or(requested);

            // The radio must not scan while it links.
            let was_scanning = scan::end_scan_round(m, events);

            m.attempt += 1;
            let (cancel_tx, cancel_rx) = oneshot::channel();
            m.cancel_connect = Some(cancel_tx);
            m.state.connection_state = ConnectionState::Connecting;
            m.state.connected_peripheral = Some(descriptor.clone());
            events.push(SessionEvent::ConnectionStateChanged(
                ConnectionState::Connecting,
            ));
            Ok((m.attempt, cancel_rx, was_scanning, descriptor))
        })?;

        let id = descriptor.id.clone();
        if was_scanning {
            if let Err(e) = self.inner.radio.stop_discovery().await {
                warn!("Failed to stop scan before connecting: {}", e);
            }
        }

        info!("Connecting to {} ({})", descriptor.display_name(), id);
        // Cancellation wins over a link that completed in the same poll.
        let outcome = tokio::select! {
            biased;
            reason = cancelled => Err(reason.unwrap_or(ConnectFailure::Cancelled)),
            result = self.establish(&id) => result,
        };

        match outcome {
            Ok(channels) => {
                let confirmed: ChannelSet = channels.keys().copied().collect();
                let promoted = self.transition(|m, events| {
                    if m.attempt != attempt
                        || m.state.connection_state != ConnectionState::Connecting
                    {
                        return false;
                    }
                    m.cancel_connect = None;
                    m.state.connection_state = ConnectionState::Connected;
                    m.state.confirmed_channels = confirmed.clone();
                    m.link = Some(ConnectionHandle {
                        peripheral: descriptor.clone(),
                        channels,
                    });
                    events.push(SessionEvent::ConnectionStateChanged(
                        ConnectionState::Connected,
                    ));
                    true
                });

                if !promoted {
                    // Cancelled while the link was coming up; do not keep it.
                    if let Err(e) = self.inner.radio.disconnect(&id).await {
                        debug!("Dropping superseded link to {}: {}", id, e);
                    }
                    return Err(SessionError::ConnectionFailed {
                        peripheral: id,
                        cause: ConnectFailure::Cancelled,
                    });
                }

                if confirmed.is_empty() {
                    warn!("{} exposes none of the known soil channels", id);
                }
                info!(
                    "Connected to {}: channels {:?}",
                    descriptor.display_name(),
                    confirmed
                );
                Ok(confirmed)
            }
            Err(cause) => {
                let owned = self.transition(|m, events| {
                    if m.attempt != attempt
                        || m.state.connection_state != ConnectionState::Connecting
                    {
                        return false;
                    }
                    m.cancel_connect = None;
                    m.state.clear_connection();
                    events.push(SessionEvent::ConnectionStateChanged(
                        ConnectionState::Disconnected,
                    ));
                    true
                });

                // Abort a half-open link; the canceller already tore down otherwise.
                if owned {
                    if let Err(e) = self.inner.radio.disconnect(&id).await {
                        debug!("Cleanup after failed connect to {}: {}", id, e);
                    }
                }
                error!("Connection to {} failed: {}", id, cause);
                Err(SessionError::ConnectionFailed {
                    peripheral: id,
                    cause,
                })
            }
        }
    }

    /// Link and negotiate, each step bounded by its own timeout.
    async fn establish(
        &self,
        id: &PeripheralId,
    ) -> Result<BTreeMap<Channel, ChannelAccess>, ConnectFailure> {
        let config = &self.inner.config;

        timeout(config.connect_timeout, self.inner.radio.connect(id))
            .await
            .map_err(|_| ConnectFailure::Timeout(config.connect_timeout))??;

        let exposed = timeout(
            config.negotiation_timeout,
            self.inner.radio.characteristics(id),
        )
        .await
        .map_err(|_| ConnectFailure::Timeout(config.negotiation_timeout))??;

        debug!("{} exposes {} characteristics", id, exposed.len());
        Ok(negotiate(&exposed))
    }

    /// Tear down the connection or cancel the pending attempt
    ///
    /// Always ends `Disconnected`; a failing radio teardown is only logged.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let peer = self.transition(|m, events| {
            if m.state.connection_state == ConnectionState::Disconnected {
                return Err(SessionError::NotConnected);
            }
            let peer = m.state.connected_peripheral.as_ref().map(|d| d.id.clone());
            m.attempt += 1;
            if let Some(cancel) = m.cancel_connect.take() {
                let _ = cancel.send(ConnectFailure::Cancelled);
            }
            m.link = None;
            m.state.clear_connection();
            events.push(SessionEvent::ConnectionStateChanged(
                ConnectionState::Disconnected,
            ));
            Ok(peer)
        })?;

        if let Some(peer) = peer {
            info!("Disconnecting from {}", peer);
            match self.inner.radio.disconnect(&peer).await {
                Ok(()) => info!("Disconnected from {}", peer),
                Err(e) => warn!("Teardown of {} reported an error: {}", peer, e),
            }
        }
        Ok(())
    }

    /// Start receiving values for every confirmed channel
    ///
    /// Notifying channels are subscribed; read-only channels, and channels
    /// whose subscription fails, are read once right away and are served by
    /// [`refresh_reading`](Self::refresh_reading) afterwards.
    ///
    /// # Returns
    /// Channels that are subscribed or answered the initial read
    pub async fn read_or_subscribe(&self) -> Result<ChannelSet, SessionError> {
        let (peer, channels) = self.link_snapshot()?;
        let mut live = ChannelSet::new();
        let mut polled = Vec::new();

        for (channel, access) in channels {
            match access.strategy {
                ReadStrategy::Notify => {
                    match self.inner.radio.subscribe(&peer, channel.wire_id()).await {
                        Ok(()) => {
                            debug!("Subscribed to {} on {}", channel, peer);
                            live.insert(channel);
                        }
                        Err(e) if access.readable => {
                            warn!("Subscribe to {} failed ({}), polling instead", channel, e);
                            self.demote_to_poll(&peer, channel);
                            polled.push(channel);
                        }
                        Err(e) => warn!("Subscribe to {} failed: {}", channel, e),
                    }
                }
                ReadStrategy::Poll => polled.push(channel),
            }
        }

        for channel in polled {
            if self.read_channel(&peer, channel).await?.is_some() {
                live.insert(channel);
            }
        }

        info!("{} live channels on {}", live.len(), peer);
        Ok(live)
    }

    /// Explicitly read every readable confirmed channel
    ///
    /// The result holds only the channels decoded in this cycle; a channel
    /// whose read or decode failed is absent even if an earlier value exists.
    ///
    /// # Returns
    /// The fresh reading, or `NoChannelsDecoded` if nothing decoded this cycle
    pub async fn refresh_reading(&self) -> Result<Reading, SessionError> {
        let (peer, channels) = self.link_snapshot()?;
        let mut payloads = Vec::new();

        for (channel, access) in channels {
            if !access.readable {
                continue;
            }
            if let Some(value) = self.read_raw(&peer, channel).await? {
                payloads.push((channel, value));
            }
        }

        let received = OffsetDateTime::now_utc();
        let result = self.transition(|m, events| {
            let Some(link) = m.link.as_ref().filter(|l| l.peripheral.id == peer) else {
                return Err(SessionError::NotConnected);
            };
            let values: BTreeMap<Channel, f64> = payloads
                .iter()
                .filter_map(|(channel, data)| {
                    decode_for_link(link, &peer, channel.wire_id(), data, events)
                })
                .collect();
            if values.is_empty() {
                return Err(SessionError::NoChannelsDecoded);
            }

            for channel in values.keys() {
                m.state.freshness.insert(*channel, received);
            }
            let reading = Reading::new(values, received);
            m.state.last_reading = Some(reading.clone());
            events.push(SessionEvent::ReadingUpdated(reading.clone()));
            Ok(reading)
        });

        if let Err(SessionError::NoChannelsDecoded) = result {
            warn!("No channel decoded while refreshing {}", peer);
        }
        result
    }

    /// One explicit read merged into the current reading.
    /// `Ok(None)` when the read failed, `Ok(Some(decoded))` otherwise.
    async fn read_channel(
        &self,
        peer: &PeripheralId,
        channel: Channel,
    ) -> Result<Option<bool>, SessionError> {
        Ok(self
            .read_raw(peer, channel)
            .await?
            .map(|value| self.accept_value(peer, channel.wire_id(), &value)))
    }

    /// Read one channel's raw payload. A vanished link is handled as link loss.
    async fn read_raw(
        &self,
        peer: &PeripheralId,
        channel: Channel,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        match self.inner.radio.read(peer, channel.wire_id()).await {
            Ok(value) => Ok(Some(value)),
            Err(RadioError::NotConnected(_)) => {
                self.on_link_lost(peer.clone()).await;
                Err(SessionError::NotConnected)
            }
            Err(e) => {
                warn!("Failed to read {} from {}: {}", channel, peer, e);
                Ok(None)
            }
        }
    }

    fn link_snapshot(&self) -> Result<(PeripheralId, BTreeMap<Channel, ChannelAccess>), SessionError> {
        let m = self.machine();
        if !m.state.radio_enabled {
            return Err(SessionError::AdapterDisabled);
        }
        match (&m.state.connection_state, &m.link) {
            (ConnectionState::Connected, Some(link)) => {
                Ok((link.peripheral.id.clone(), link.channels.clone()))
            }
            _ => Err(SessionError::NotConnected),
        }
    }

    fn demote_to_poll(&self, peer: &PeripheralId, channel: Channel) {
        self.transition(|m, _| {
            if let Some(link) = m.link.as_mut().filter(|l| &l.peripheral.id == peer) {
                if let Some(access) = link.channels.get_mut(&channel) {
                    access.strategy = ReadStrategy::Poll;
                }
            }
        });
    }

    /// Decode one pushed payload and merge it into the current reading
    ///
    /// Failures are reported as events and never affect other channels.
    pub(super) fn accept_value(&self, peer: &PeripheralId, wire_id: Uuid, data: &[u8]) -> bool {
        let received = OffsetDateTime::now_utc();
        self.transition(|m, events| {
            let Some(link) = m.link.as_ref().filter(|l| &l.peripheral.id == peer) else {
                debug!("Ignoring stale value for {} from {}", wire_id, peer);
                return false;
            };
            let Some((channel, value)) = decode_for_link(link, peer, wire_id, data, events) else {
                return false;
            };

            let reading = match &m.state.last_reading {
                Some(previous) => previous.with_value(channel, value, received),
                None => Reading::new(BTreeMap::from([(channel, value)]), received),
            };
            m.state.freshness.insert(channel, received);
            m.state.last_reading = Some(reading.clone());
            events.push(SessionEvent::ReadingUpdated(reading));
            true
        })
    }

    /// The probe dropped the link on its own.
    ///
    /// While connecting, the pending attempt is abandoned and `connect`
    /// reports `LinkLost`; once connected, `ConnectionLost` is emitted.
    pub(super) async fn on_link_lost(&self, peer: PeripheralId) {
        let was = self.transition(|m, events| {
            let state = m.state.connection_state;
            if !m.state.targets(&peer) || state == ConnectionState::Disconnected {
                return None;
            }
            m.attempt += 1;
            if let Some(cancel) = m.cancel_connect.take() {
                let _ = cancel.send(ConnectFailure::LinkLost);
            }
            m.link = None;
            m.state.clear_connection();
            events.push(SessionEvent::ConnectionStateChanged(
                ConnectionState::Disconnected,
            ));
            if state == ConnectionState::Connected {
                events.push(SessionEvent::ConnectionLost(peer.clone()));
            }
            Some(state)
        });

        match was {
            None => {
                debug!("Disconnect event for {} does not match the session", peer);
                return;
            }
            Some(ConnectionState::Connecting) => {
                warn!("Link to {} dropped while connecting", peer)
            }
            Some(_) => warn!("Lost connection to {}", peer),
        }

        // Drop whatever the backend still holds for the dead link.
        if let Err(e) = self.inner.radio.disconnect(&peer).await {
            debug!("Cleanup after losing {}: {}", peer, e);
        }
    }
}

/// Decode a payload against the channels confirmed on `link`.
///
/// Payloads for channels not confirmed on this link count as unknown.
fn decode_for_link(
    link: &ConnectionHandle,
    peer: &PeripheralId,
    wire_id: Uuid,
    data: &[u8],
    events: &mut Vec<SessionEvent>,
) -> Option<(Channel, f64)> {
    let decoded = match registry::resolve(wire_id) {
        Some(spec) if link.channels.contains_key(&spec.channel) => {
            decoder::decode(spec.channel, data).map(|value| (spec.channel, value))
        }
        _ => Err(DecodeError::UnknownChannel(wire_id)),
    };

    match decoded {
        Ok((channel, value)) => {
            debug!("{} = {} {}", channel, value, channel.unit());
            Some((channel, value))
        }
        Err(error) => {
            warn!("Dropping payload {:02X?} from {}: {}", data, peer, error);
            events.push(SessionEvent::DecodeFailed {
                peripheral: peer.clone(),
                wire_id,
                error,
            });
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(channel: Channel, notify: bool, read: bool) -> CharacteristicInfo {
        CharacteristicInfo {
            uuid: channel.wire_id(),
            notify,
            read,
        }
    }

    #[test]
    fn negotiation_keeps_only_registry_channels() {
        let exposed = vec![
            info(Channel::ElectricalConductivity, true, true),
            info(Channel::SoilMoisture, false, true),
            CharacteristicInfo {
                uuid: registry::SOIL_SENSOR_SERVICE_UUID,
                notify: true,
                read: true,
            },
        ];
        let confirmed = negotiate(&exposed);

        assert_eq!(
            confirmed.keys().copied().collect::<Vec<_>>(),
            vec![Channel::ElectricalConductivity, Channel::SoilMoisture]
        );
        assert_eq!(
            confirmed[&Channel::ElectricalConductivity].strategy,
            ReadStrategy::Notify
        );
        assert_eq!(confirmed[&Channel::SoilMoisture].strategy, ReadStrategy::Poll);
    }

    #[test]
    fn negotiation_skips_inaccessible_characteristics() {
        let confirmed = negotiate(&[info(Channel::Nitrogen, false, false)]);
        assert!(confirmed.is_empty());
    }

    #[test]
    fn duplicate_exposure_merges_capabilities() {
        let confirmed = negotiate(&[info(Channel::Ph, false, true), info(Channel::Ph, true, false)]);
        assert_eq!(
            confirmed[&Channel::Ph],
            ChannelAccess {
                strategy: ReadStrategy::Notify,
                readable: true,
            }
        );
    }
}
