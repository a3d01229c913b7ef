use std::collections::BTreeMap;
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Logical soil/environment measurement carried by one GATT characteristic.
///
/// Declaration order is the registry order and also the `Ord` used by
/// [`ChannelSet`] and [`Reading`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    Nitrogen,
    Phosphorus,
    Potassium,
    Ph,
    ElectricalConductivity,
    SoilMoisture,
    SoilTemperature,
    AmbientTemperature,
    Humidity,
}

impl Channel {
    /// Field name used by the backend submission collaborator.
    pub fn key(self) -> &'static str {
        match self {
            Channel::Nitrogen => "nitrogen",
            Channel::Phosphorus => "phosphorus",
            Channel::Potassium => "potassium",
            Channel::Ph => "pH",
            Channel::ElectricalConductivity => "ec",
            Channel::SoilMoisture => "soilMoisture",
            Channel::SoilTemperature => "soilTemperature",
            Channel::AmbientTemperature => "temperature",
            Channel::Humidity => "humidity",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Channel::Nitrogen | Channel::Phosphorus | Channel::Potassium => "mg/kg",
            Channel::Ph => "pH",
            Channel::ElectricalConductivity => "µS/cm",
            Channel::SoilMoisture => "%",
            Channel::SoilTemperature | Channel::AmbientTemperature => "°C",
            Channel::Humidity => "%RH",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Channels confirmed present on one connected peripheral.
pub type ChannelSet = std::collections::BTreeSet<Channel>;

/// Opaque, stable device identifier (a Bluetooth address on BlueZ).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        PeripheralId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        PeripheralId::new(id)
    }
}

/// Snapshot of one advertising peripheral as seen during the current scan round.
#[derive(Debug, Clone, PartialEq)]
pub struct PeripheralDescriptor {
    pub id: PeripheralId,
    pub name: Option<String>,
    /// Advisory only; replaced on every repeat advertisement.
    pub rssi: Option<i16>,
    pub connectable: bool,
}

impl PeripheralDescriptor {
    /// Descriptor for a peripheral known only by identifier.
    pub fn bare(id: PeripheralId) -> Self {
        PeripheralDescriptor {
            id,
            name: None,
            rssi: None,
            connectable: true,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown Device")
    }
}

impl From<PeripheralId> for PeripheralDescriptor {
    fn from(id: PeripheralId) -> Self {
        PeripheralDescriptor::bare(id)
    }
}

/// Timestamped set of successfully decoded channel values.
///
/// Only channels that actually decoded are present; there are no defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    values: BTreeMap<Channel, f64>,
    timestamp: OffsetDateTime,
}

impl Reading {
    pub fn new(values: BTreeMap<Channel, f64>, timestamp: OffsetDateTime) -> Self {
        Reading { values, timestamp }
    }

    /// A new reading holding this one's values plus `channel = value`.
    pub fn with_value(&self, channel: Channel, value: f64, timestamp: OffsetDateTime) -> Self {
        let mut values = self.values.clone();
        values.insert(channel, value);
        Reading { values, timestamp }
    }

    pub fn get(&self, channel: Channel) -> Option<f64> {
        self.values.get(&channel).copied()
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.values.contains_key(&channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.values.keys().copied()
    }

    pub fn values(&self) -> &BTreeMap<Channel, f64> {
        &self.values
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

/// Latitude/longitude pair supplied by an external location collaborator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// What the coordinator hands to the backend submission collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub reading: Reading,
    pub device_id: PeripheralId,
    pub location: Option<GeoPoint>,
}

impl Submission {
    pub fn new(reading: Reading, device_id: PeripheralId, location: Option<GeoPoint>) -> Self {
        Submission {
            reading,
            device_id,
            location,
        }
    }

    /// Key/value pairs in the shape the backend's submit call expects.
    ///
    /// Measurement values are rendered as strings, absent channels are omitted.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        let mut fields: Vec<(&'static str, String)> = self
            .reading
            .values()
            .iter()
            .map(|(channel, value)| (channel.key(), value.to_string()))
            .collect();

        let reading_time = self
            .reading
            .timestamp()
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.reading.timestamp().to_string());
        fields.push(("reading_time", reading_time));
        fields.push(("device_id", self.device_id.to_string()));

        if let Some(location) = self.location {
            fields.push(("latitude", location.latitude.to_string()));
            fields.push(("longitude", location.longitude.to_string()));
        }

        fields
    }
}
