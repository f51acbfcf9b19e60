/// Correlation of command responses with the command awaiting them
use crate::error::ProtocolError;
use crate::models::{Command, InterpretedResponse, ResponseEnvelope, WeightSample};
use crate::protocol::codec::{decode_notification, encode_command};

/// What a single notification turned into
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Samples(Vec<WeightSample>),
    Response(InterpretedResponse),
    LowPowerWarning,
    /// RFD records are decoded but not used by the measurement flow
    Ignored(&'static str),
}

/// Tracks the one command that may be outstanding at a time
#[derive(Debug, Default)]
pub struct ResponseCorrelator {
    pending: Option<Command>,
}

impl ResponseCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Option<Command> {
        self.pending
    }

    /// Mark `cmd` as pending and return the frame to write to the control point.
    ///
    /// Any command already pending is forgotten; its response, if it arrives
    /// late, is interpreted under `cmd`.
    pub fn issue(&mut self, cmd: Command) -> Vec<u8> {
        self.pending = Some(cmd);
        encode_command(cmd)
    }

    /// Interpret a command response payload under the pending command.
    ///
    /// The pending slot is left as is; the next `issue` replaces it.
    pub fn on_command_response(
        &self,
        payload: &[u8],
    ) -> Result<InterpretedResponse, ProtocolError> {
        interpret(self.pending, payload)
    }
}

fn interpret(
    pending: Option<Command>,
    payload: &[u8],
) -> Result<InterpretedResponse, ProtocolError> {
    match pending {
        Some(Command::GetAppVersion) => std::str::from_utf8(payload)
            .map(|version| InterpretedResponse::AppVersion(version.to_string()))
            .map_err(|e| ProtocolError::EncodingError(e.to_string())),
        Some(Command::GetBatteryVoltage) => match payload {
            [a, b, c, d, ..] => Ok(InterpretedResponse::BatteryVoltage(u32::from_le_bytes([
                *a, *b, *c, *d,
            ]))),
            _ => Err(ProtocolError::MalformedPayload(format!(
                "battery voltage needs 4 bytes, got {}",
                payload.len()
            ))),
        },
        // An empty or garbled crash log means there is nothing to report
        Some(Command::GetErrorInformation) => Ok(InterpretedResponse::ErrorInformation(
            std::str::from_utf8(payload)
                .ok()
                .filter(|log| !log.is_empty())
                .map(str::to_string),
        )),
        _ => Err(ProtocolError::UnsolicitedResponse { len: payload.len() }),
    }
}

/// Decode a raw notification and decide where it goes.
///
/// Pure: nothing is mutated, so an error here leaves both the pending
/// command and the measurement series untouched.
pub fn route(pending: Option<Command>, data: &[u8]) -> Result<Routed, ProtocolError> {
    match decode_notification(data)? {
        ResponseEnvelope::WeightMeasurement(samples) => Ok(Routed::Samples(samples)),
        ResponseEnvelope::CommandResponse(payload) => {
            interpret(pending, &payload).map(Routed::Response)
        }
        ResponseEnvelope::LowPowerWarning => Ok(Routed::LowPowerWarning),
        ResponseEnvelope::RfdPeak(_) => Ok(Routed::Ignored("RFD peak")),
        ResponseEnvelope::RfdPeakSeries(_) => Ok(Routed::Ignored("RFD peak series")),
    }
}
