/// BlueZ-backed radio for the soil probe session
use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{AdapterEvent, AdapterProperty, DeviceEvent, DeviceProperty, ErrorKind};
use futures_util::{pin_mut, StreamExt};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bluetooth::{CharacteristicInfo, Radio, RadioEvent};
use crate::error::RadioError;
use crate::models::PeripheralId;

impl From<bluer::Error> for RadioError {
    fn from(e: bluer::Error) -> Self {
        match e.kind {
            ErrorKind::NotReady => RadioError::PoweredOff,
            ErrorKind::NotAuthorized | ErrorKind::NotPermitted => RadioError::PermissionDenied,
            _ => RadioError::Stack(e.to_string()),
        }
    }
}

/// Radio adapter reached through the BlueZ daemon
///
/// Owns the D-Bus session and the background tasks that turn BlueZ
/// streams (discovery, link state, notifications, adapter power) into
/// [`RadioEvent`]s.
pub struct BluerRadio {
    _session: bluer::Session,
    adapter: bluer::Adapter,
    events: mpsc::Sender<RadioEvent>,
    discovery: Mutex<Option<JoinHandle<()>>>,
    links: Mutex<HashMap<PeripheralId, Vec<JoinHandle<()>>>>,
    power_watch: JoinHandle<()>,
}

impl BluerRadio {
    /// Open a BlueZ session on the named adapter, or the default one
    ///
    /// # Arguments
    /// * `adapter_name` - Adapter such as `hci0`; `None` for the default adapter
    /// * `events` - Where unsolicited radio events are delivered
    pub async fn new(
        adapter_name: Option<&str>,
        events: mpsc::Sender<RadioEvent>,
    ) -> Result<Self, RadioError> {
        let session = match bluer::Session::new().await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to create Bluetooth session: {}", e);
                return Err(e.into());
            }
        };

        let adapter = match adapter_name {
            Some(name) => session.adapter(name),
            None => session.default_adapter().await,
        };
        let adapter = match adapter {
            Ok(adapter) => adapter,
            Err(e) => {
                error!("Failed to get Bluetooth adapter: {}", e);
                return Err(e.into());
            }
        };
        info!("Using Bluetooth adapter {}", adapter.name());

        let power_watch = tokio::spawn(watch_power(adapter.clone(), events.clone()));

        Ok(BluerRadio {
            _session: session,
            adapter,
            events,
            discovery: Mutex::new(None),
            links: Mutex::new(HashMap::new()),
            power_watch,
        })
    }

    fn device(&self, peripheral: &PeripheralId) -> Result<bluer::Device, RadioError> {
        let address: bluer::Address = peripheral
            .as_str()
            .parse()
            .map_err(|_| RadioError::PeripheralNotFound(peripheral.clone()))?;
        Ok(self.adapter.device(address)?)
    }

    async fn find_characteristic(
        &self,
        peripheral: &PeripheralId,
        wire_id: Uuid,
    ) -> Result<Characteristic, RadioError> {
        let device = self.device(peripheral)?;
        for service in device.services().await? {
            for characteristic in service.characteristics().await? {
                if characteristic.uuid().await? == wire_id {
                    return Ok(characteristic);
                }
            }
        }
        Err(RadioError::CharacteristicNotFound(wire_id))
    }

    fn track(&self, peripheral: &PeripheralId, task: JoinHandle<()>) {
        if let Ok(mut links) = self.links.lock() {
            links.entry(peripheral.clone()).or_default().push(task);
        }
    }

    fn drop_link_tasks(&self, peripheral: &PeripheralId) {
        let tasks = self
            .links
            .lock()
            .ok()
            .and_then(|mut links| links.remove(peripheral));
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
    }
}

impl Drop for BluerRadio {
    fn drop(&mut self) {
        self.power_watch.abort();
        if let Ok(mut discovery) = self.discovery.lock() {
            if let Some(task) = discovery.take() {
                task.abort();
            }
        }
        if let Ok(mut links) = self.links.lock() {
            for task in links.drain().flat_map(|(_, tasks)| tasks) {
                task.abort();
            }
        }
    }
}

/// Forward adapter power changes until the receiver goes away
async fn watch_power(adapter: bluer::Adapter, tx: mpsc::Sender<RadioEvent>) {
    let stream = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to watch adapter events: {}", e);
            return;
        }
    };
    pin_mut!(stream);
    while let Some(event) = stream.next().await {
        if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
            info!("Adapter {} powered: {}", adapter.name(), powered);
            if tx.send(RadioEvent::PoweredChanged(powered)).await.is_err() {
                break;
            }
        }
    }
}

/// Build an advertisement event from the device's current properties
async fn advertisement(
    adapter: &bluer::Adapter,
    address: bluer::Address,
) -> Result<RadioEvent, bluer::Error> {
    let device = adapter.device(address)?;
    Ok(RadioEvent::Advertisement {
        id: PeripheralId::new(address.to_string().to_uppercase()),
        name: device.name().await?,
        rssi: device.rssi().await?,
        // BlueZ only surfaces LE devices it is willing to connect to.
        connectable: true,
    })
}

#[async_trait]
impl Radio for BluerRadio {
    async fn is_powered(&self) -> Result<bool, RadioError> {
        Ok(self.adapter.is_powered().await?)
    }

    async fn request_permissions(&self) -> Result<bool, RadioError> {
        // BlueZ access is governed by D-Bus policy; denials surface as
        // NotAuthorized on the first adapter call instead.
        Ok(true)
    }

    async fn start_discovery(&self) -> Result<(), RadioError> {
        // Configure discovery filter for Low Energy devices only
        let filter = bluer::DiscoveryFilter {
            transport: bluer::DiscoveryTransport::Le,
            duplicate_data: true, // RSSI refreshes arrive as repeat advertisements
            ..Default::default()
        };

        // Apply the discovery filter (warn if it fails, but continue)
        if let Err(e) = self.adapter.set_discovery_filter(filter).await {
            warn!("Failed to set discovery filter: {}", e);
        }

        let stream = match self.adapter.discover_devices_with_changes().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start device discovery: {}", e);
                return Err(e.into());
            }
        };

        let adapter = self.adapter.clone();
        let tx = self.events.clone();
        let task = tokio::spawn(async move {
            pin_mut!(stream);
            while let Some(event) = stream.next().await {
                match event {
                    AdapterEvent::DeviceAdded(address) => {
                        match advertisement(&adapter, address).await {
                            Ok(event) => {
                                if tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => debug!("Failed to read properties of {}: {}", address, e),
                        }
                    }
                    other => debug!("Discovery event: {:?}", other),
                }
            }
        });

        // Dropping the previous stream ends its discovery session
        if let Ok(mut discovery) = self.discovery.lock() {
            if let Some(previous) = discovery.replace(task) {
                previous.abort();
            }
        }
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), RadioError> {
        if let Ok(mut discovery) = self.discovery.lock() {
            if let Some(task) = discovery.take() {
                task.abort();
            }
        }
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId) -> Result<(), RadioError> {
        let device = self.device(peripheral)?;
        if !device.is_connected().await? {
            device.connect().await?;
        }

        // Link loss watcher: the session hears about drops without polling
        let id = peripheral.clone();
        let tx = self.events.clone();
        let watcher = tokio::spawn(async move {
            let stream = match device.events().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to watch link state of {}: {}", id, e);
                    return;
                }
            };
            pin_mut!(stream);
            while let Some(event) = stream.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    let _ = tx.send(RadioEvent::Disconnected(id.clone())).await;
                    break;
                }
            }
        });
        self.track(peripheral, watcher);
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<(), RadioError> {
        self.drop_link_tasks(peripheral);
        let device = self.device(peripheral)?;
        device.disconnect().await?;
        Ok(())
    }

    async fn characteristics(
        &self,
        peripheral: &PeripheralId,
    ) -> Result<Vec<CharacteristicInfo>, RadioError> {
        let device = self.device(peripheral)?;
        let mut found = Vec::new();
        for service in device.services().await? {
            for characteristic in service.characteristics().await? {
                let flags = characteristic.flags().await?;
                found.push(CharacteristicInfo {
                    uuid: characteristic.uuid().await?,
                    notify: flags.notify || flags.indicate,
                    read: flags.read,
                });
            }
        }
        Ok(found)
    }

    async fn read(&self, peripheral: &PeripheralId, wire_id: Uuid) -> Result<Vec<u8>, RadioError> {
        let characteristic = self.find_characteristic(peripheral, wire_id).await?;
        Ok(characteristic.read().await?)
    }

    async fn subscribe(&self, peripheral: &PeripheralId, wire_id: Uuid) -> Result<(), RadioError> {
        let characteristic = self.find_characteristic(peripheral, wire_id).await?;
        let id = peripheral.clone();
        let tx = self.events.clone();
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let stream = match characteristic.notify().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(RadioError::from(e)));
                    return;
                }
            };
            pin_mut!(stream);
            while let Some(value) = stream.next().await {
                let event = RadioEvent::Notification {
                    peripheral: id.clone(),
                    wire_id,
                    value,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            debug!("Notification stream for {} on {} ended", wire_id, id);
        });
        self.track(peripheral, task);

        ready_rx
            .await
            .map_err(|_| RadioError::Stack("notification task ended early".into()))?
    }
}
