pub mod codec;
pub mod correlator;

pub use codec::{decode_notification, encode_command};
pub use correlator::{route, ResponseCorrelator, Routed};
