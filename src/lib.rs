//! Client for the Tindeq Progressor force gauge
//!
//! Discovers the device over Bluetooth LE, queries its firmware version,
//! battery voltage and crash log, then streams weight samples for a fixed
//! window and summarises the steady part of the pull.

pub mod aggregator;
pub mod bluetooth;
pub mod config;
pub mod error;
pub mod models;
pub mod protocol;
pub mod session;
pub mod utils;
