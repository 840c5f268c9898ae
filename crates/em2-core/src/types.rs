//! Shared enums for trigger, acquisition and synchronization modes.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::Em2Error;

/// Lowest measurement channel number.
pub const CHANNEL_MIN: u8 = 1;
/// Highest measurement channel number.
pub const CHANNEL_MAX: u8 = 4;
/// Synthetic channel carrying the integration time, one entry per point.
pub const TIMING_CHANNEL_KEY: &str = "CHAN00";

/// Instrument trigger mode (`TRIG:MODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerMode {
    /// The caller issues discrete software triggers.
    Software,
    /// An external signal triggers each point.
    Hardware,
    /// An external signal gates the acquisition duration.
    Gate,
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let wire = match self {
            TriggerMode::Software => "SOFTWARE",
            TriggerMode::Hardware => "HARDWARE",
            TriggerMode::Gate => "GATE",
        };
        write!(f, "{wire}")
    }
}

impl FromStr for TriggerMode {
    type Err = Em2Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "SOFTWARE" => Ok(TriggerMode::Software),
            "HARDWARE" => Ok(TriggerMode::Hardware),
            "GATE" => Ok(TriggerMode::Gate),
            _ => Err(Em2Error::parse(s, "unknown trigger mode")),
        }
    }
}

/// Instrument acquisition mode (`ACQU:MODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcquisitionMode {
    /// Averaged current per trigger.
    Current,
    /// Integrated charge per trigger.
    Charge,
    /// Continuous fast-buffer acquisition; data arrives on the streaming
    /// port only.
    FastBuffer,
}

impl AcquisitionMode {
    /// Whether this mode delivers data exclusively over the streaming port.
    pub fn requires_streaming(self) -> bool {
        matches!(self, AcquisitionMode::FastBuffer)
    }
}

impl fmt::Display for AcquisitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let wire = match self {
            AcquisitionMode::Current => "CURRENT",
            AcquisitionMode::Charge => "CHARGE",
            AcquisitionMode::FastBuffer => "FAST_BUFFER",
        };
        write!(f, "{wire}")
    }
}

impl FromStr for AcquisitionMode {
    type Err = Em2Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "CURRENT" => Ok(AcquisitionMode::Current),
            "CHARGE" => Ok(AcquisitionMode::Charge),
            "FAST_BUFFER" => Ok(AcquisitionMode::FastBuffer),
            _ => Err(Em2Error::parse(s, "unknown acquisition mode")),
        }
    }
}

/// How the surrounding acquisition framework synchronizes points.
///
/// Mirrors the counter/timer synchronization kinds of the control system
/// this client serves; the `*Start` kinds exist in that framework but are
/// not supported by the electrometer controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum SynchronizationMode {
    /// One software trigger per point.
    SoftwareTrigger,
    /// Software-gated acquisition.
    SoftwareGate,
    /// One hardware trigger per point.
    HardwareTrigger,
    /// Hardware-gated acquisition.
    HardwareGate,
    /// Single software start for the whole scan (unsupported).
    SoftwareStart,
    /// Single hardware start for the whole scan (unsupported).
    HardwareStart,
}

impl SynchronizationMode {
    /// Whether this is one of the unsupported Start-type kinds.
    pub fn is_start_type(self) -> bool {
        matches!(
            self,
            SynchronizationMode::SoftwareStart | SynchronizationMode::HardwareStart
        )
    }

    /// Whether the controller should issue software triggers itself.
    pub fn uses_software_trigger(self) -> bool {
        matches!(
            self,
            SynchronizationMode::SoftwareTrigger | SynchronizationMode::SoftwareGate
        )
    }

    /// The device trigger mode this synchronization kind maps to.
    ///
    /// Returns a configuration error for the Start-type kinds.
    pub fn trigger_mode(self) -> Result<TriggerMode, Em2Error> {
        match self {
            SynchronizationMode::SoftwareTrigger | SynchronizationMode::SoftwareGate => {
                Ok(TriggerMode::Software)
            }
            SynchronizationMode::HardwareTrigger => Ok(TriggerMode::Hardware),
            SynchronizationMode::HardwareGate => Ok(TriggerMode::Gate),
            SynchronizationMode::SoftwareStart | SynchronizationMode::HardwareStart => Err(
                Em2Error::Configuration("the Start synchronization is not allowed yet".into()),
            ),
        }
    }
}

/// Coarse instrument state derived by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// Ready to configure or start.
    Idle,
    /// An acquisition is in flight and points are still outstanding.
    Busy,
    /// The instrument reported an error or unknown hardware state.
    Fault,
}
