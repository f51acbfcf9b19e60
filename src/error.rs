use thiserror::Error;

use crate::session::Phase;

/// Recoverable errors raised while decoding or interpreting a notification
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("unknown response type: {0}")]
    UnknownResponseType(u8),

    #[error("response is not valid UTF-8: {0}")]
    EncodingError(String),

    #[error("unsolicited command response ({len} bytes)")]
    UnsolicitedResponse { len: usize },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Bluetooth adapter error: {0}")]
    Adapter(String),

    #[error("Scan error: {0}")]
    Scan(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(String),

    #[error("Subscribe error: {0}")]
    Subscribe(String),

    #[error("Write error: {0}")]
    Write(String),

    #[error("Device disconnected")]
    Disconnected,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("no device named {prefix}* found within {timeout_secs:.1}s")]
    DeviceNotFound { prefix: String, timeout_secs: f64 },

    #[error("{phase:?} failed: {source}")]
    Transport {
        phase: Phase,
        #[source]
        source: TransportError,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}
