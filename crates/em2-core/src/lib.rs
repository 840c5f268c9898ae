//! Core types for the ALBA Em2 electrometer client.
//!
//! This crate holds the pieces shared by any consumer of the Em2 client:
//! the error taxonomy, firmware version handling with its derived quirk
//! flags, connection configuration, and the enums describing trigger,
//! acquisition and synchronization modes.

pub mod config;
pub mod error;
pub mod firmware;
pub mod types;

pub use config::{Em2Config, PrepareRequest};
pub use error::{Em2Error, Em2Result};
pub use firmware::{FirmwareVersion, QuirkFlags};
pub use types::{
    AcquisitionMode, AcquisitionState, SynchronizationMode, TriggerMode, CHANNEL_MAX, CHANNEL_MIN,
    TIMING_CHANNEL_KEY,
};

/// Wire key for a measurement channel (`CHAN01`..`CHAN04`).
pub fn channel_key(nb: u8) -> String {
    format!("CHAN{nb:02}")
}
