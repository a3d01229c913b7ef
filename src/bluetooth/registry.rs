/// Channel registry: the probe's fixed GATT characteristic layout
use uuid::Uuid;

use crate::models::Channel;

/// Primary service advertised by the soil probe firmware.
pub const SOIL_SENSOR_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// Environmental Sensing service (0x181A).
pub const ENVIRONMENTAL_SENSING_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000181a_0000_1000_8000_00805f9b34fb);

/// How the two payload bytes of a channel become a physical value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeRule {
    /// Signed 16-bit little-endian integer, read literally.
    RawI16,
    /// Signed 16-bit little-endian integer at 0.01-unit resolution.
    CentiI16,
}

impl DecodeRule {
    /// Number of payload bytes the rule consumes.
    pub fn width(self) -> usize {
        2
    }
}

/// One registry row: channel, wire identifier, decode rule and accepted range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSpec {
    pub channel: Channel,
    pub wire_id: Uuid,
    pub rule: DecodeRule,
    pub min: f64,
    pub max: f64,
}

/// 16-bit SIG-style identifier expanded onto the Bluetooth base UUID.
const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

const fn row(channel: Channel, short: u16, rule: DecodeRule, min: f64, max: f64) -> ChannelSpec {
    ChannelSpec {
        channel,
        wire_id: sig_uuid(short),
        rule,
        min,
        max,
    }
}

static REGISTRY: [ChannelSpec; 9] = [
    row(Channel::Nitrogen, 0x2C08, DecodeRule::RawI16, 0.0, 1999.0),
    row(Channel::Phosphorus, 0x2C09, DecodeRule::RawI16, 0.0, 1999.0),
    row(Channel::Potassium, 0x2C10, DecodeRule::RawI16, 0.0, 1999.0),
    row(Channel::Ph, 0x2C07, DecodeRule::RawI16, 0.0, 14.0),
    row(Channel::ElectricalConductivity, 0x2C06, DecodeRule::RawI16, 0.0, 20000.0),
    row(Channel::SoilMoisture, 0x2C15, DecodeRule::RawI16, 0.0, 100.0),
    row(Channel::SoilTemperature, 0x2C14, DecodeRule::CentiI16, -40.0, 85.0),
    row(Channel::AmbientTemperature, 0x2A6E, DecodeRule::CentiI16, -40.0, 85.0),
    row(Channel::Humidity, 0x2A6F, DecodeRule::CentiI16, 0.0, 100.0),
];

/// Look up the channel for a wire identifier.
pub fn resolve(wire_id: Uuid) -> Option<&'static ChannelSpec> {
    REGISTRY.iter().find(|spec| spec.wire_id == wire_id)
}

/// All known channels in registry order.
pub fn all() -> &'static [ChannelSpec] {
    &REGISTRY
}

impl Channel {
    /// The registry row for this channel.
    pub fn spec(self) -> &'static ChannelSpec {
        // Declaration order of `Channel` matches the registry rows.
        &REGISTRY[self as usize]
    }

    pub fn wire_id(self) -> Uuid {
        self.spec().wire_id
    }

    pub fn rule(self) -> DecodeRule {
        self.spec().rule
    }
}
