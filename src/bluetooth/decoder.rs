/// Payload decoding for soil probe characteristics
use uuid::Uuid;

use crate::bluetooth::registry::{self, DecodeRule};
use crate::error::DecodeError;
use crate::models::Channel;

/// Decode a raw characteristic payload for a known channel
///
/// Every channel carries a signed 16-bit little-endian integer in its first
/// two bytes; trailing bytes are ignored. Nutrient, pH, EC and moisture
/// channels report integer units as-is, temperature and humidity channels
/// are fixed-point at 0.01 resolution.
///
/// # Arguments
/// * `channel` - Channel the payload arrived on
/// * `data` - Raw characteristic value
///
/// # Returns
/// The physical value, or why the payload was rejected
pub fn decode(channel: Channel, data: &[u8]) -> Result<f64, DecodeError> {
    let spec = channel.spec();
    let needed = spec.rule.width();
    if data.len() < needed {
        return Err(DecodeError::InsufficientData {
            channel,
            needed,
            got: data.len(),
        });
    }

    let raw = i16::from_le_bytes([data[0], data[1]]) as f64;
    let value = match spec.rule {
        DecodeRule::RawI16 => raw,
        DecodeRule::CentiI16 => raw / 100.0,
    };

    if !value.is_finite() || value < spec.min || value > spec.max {
        return Err(DecodeError::MalformedPayload { channel, value });
    }

    Ok(value)
}

/// Decode a payload addressed by wire identifier
///
/// Unrecognised identifiers are never guessed at.
pub fn decode_wire(wire_id: Uuid, data: &[u8]) -> Result<(Channel, f64), DecodeError> {
    let spec = registry::resolve(wire_id).ok_or(DecodeError::UnknownChannel(wire_id))?;
    decode(spec.channel, data).map(|value| (spec.channel, value))
}
