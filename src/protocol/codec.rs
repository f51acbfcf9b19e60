/// Progressor wire format: command frames and notification decoding
use bluer::Uuid;

use crate::error::ProtocolError;
use crate::models::{Command, ResponseEnvelope, ResponseType, WeightSample};

// Progressor GATT layout
pub const PROGRESSOR_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x7e4e1701_1ea6_40c9_9dcc_13d34ffead57);
pub const DATA_CHAR_UUID: Uuid = Uuid::from_u128(0x7e4e1702_1ea6_40c9_9dcc_13d34ffead57); // notify
pub const CTRL_POINT_CHAR_UUID: Uuid =
    Uuid::from_u128(0x7e4e1703_1ea6_40c9_9dcc_13d34ffead57); // write

pub const TARGET_NAME: &str = "Progressor";

const HEADER_LEN: usize = 2; // response type + length byte
const SLOT_LEN: usize = 8; // f32 weight + u32 microseconds
const MICROS_PER_SEC: f64 = 1_000_000.0;

/// Build the control point frame for a command
pub fn encode_command(cmd: Command) -> Vec<u8> {
    vec![cmd.opcode()]
}

/// Decode a notification from the data characteristic
///
/// Every notification has the following structure:
/// - Byte 0: Response type (0 = command response, 1 = weight, 2 = RFD peak,
///   3 = RFD peak series, 4 = low power warning)
/// - Byte 1: Payload length (not relied upon, the BLE frame length is used)
/// - Bytes 2..: Payload
///
/// Weight measurements pack one or more 8-byte slots into the payload:
/// - Bytes 0-3: Weight in kg (little-endian f32)
/// - Bytes 4-7: Device timestamp in microseconds (little-endian u32)
///
/// # Arguments
/// * `data` - Raw bytes received from the data characteristic
///
/// # Returns
/// The decoded envelope, or a `ProtocolError` the caller should log and drop
pub fn decode_notification(data: &[u8]) -> Result<ResponseEnvelope, ProtocolError> {
    let (&tag, _) = data
        .split_first()
        .ok_or_else(|| ProtocolError::MalformedPayload("empty notification".to_string()))?;

    let response_type =
        ResponseType::from_byte(tag).ok_or(ProtocolError::UnknownResponseType(tag))?;

    // Command responses and RFD records may legitimately stop after the tag
    let payload = data.get(HEADER_LEN..).unwrap_or_default();

    match response_type {
        ResponseType::CommandResponse => Ok(ResponseEnvelope::CommandResponse(payload.to_vec())),
        ResponseType::WeightMeasurement => {
            decode_weight_samples(data).map(ResponseEnvelope::WeightMeasurement)
        }
        ResponseType::RfdPeak => Ok(ResponseEnvelope::RfdPeak(payload.to_vec())),
        ResponseType::RfdPeakSeries => Ok(ResponseEnvelope::RfdPeakSeries(payload.to_vec())),
        ResponseType::LowPowerWarning => Ok(ResponseEnvelope::LowPowerWarning),
    }
}

fn decode_weight_samples(data: &[u8]) -> Result<Vec<WeightSample>, ProtocolError> {
    if data.len() < HEADER_LEN || (data.len() - HEADER_LEN) % SLOT_LEN != 0 {
        return Err(ProtocolError::MalformedPayload(format!(
            "weight measurement of {} bytes is not a header plus whole {}-byte slots",
            data.len(),
            SLOT_LEN
        )));
    }

    Ok(data[HEADER_LEN..]
        .chunks_exact(SLOT_LEN)
        .map(decode_slot)
        .collect())
}

fn decode_slot(slot: &[u8]) -> WeightSample {
    let weight = f32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]);
    let micros = u32::from_le_bytes([slot[4], slot[5], slot[6], slot[7]]);
    WeightSample {
        timestamp: micros as f64 / MICROS_PER_SEC,
        weight,
    }
}

#[cfg(test)]
pub(crate) fn encode_weight_notification(samples: &[(f32, u32)]) -> Vec<u8> {
    let mut data = vec![1, (samples.len() * SLOT_LEN) as u8];
    for (weight, micros) in samples {
        data.extend_from_slice(&weight.to_le_bytes());
        data.extend_from_slice(&micros.to_le_bytes());
    }
    data
}
