//! Connection and acquisition configuration.

use serde::Deserialize;

use crate::error::{Em2Error, Em2Result};
use crate::types::SynchronizationMode;

/// Default SCPI control port.
pub const DEFAULT_CONTROL_PORT: u16 = 5025;
/// Default fast-buffer streaming port.
pub const DEFAULT_STREAM_PORT: u16 = 22003;

/// Minimum supported integration time in seconds (0.1 ms).
pub const MIN_INTEGRATION_TIME: f64 = 1e-4;

/// Connection settings for one Em2 device.
#[derive(Debug, Clone, Deserialize)]
pub struct Em2Config {
    /// Hostname or IP address of the electrometer.
    pub host: String,

    /// SCPI control port (default: 5025).
    #[serde(default = "default_control_port")]
    pub port: u16,

    /// Fast-buffer streaming port (default: 22003).
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_stream_port() -> u16 {
    DEFAULT_STREAM_PORT
}

impl Em2Config {
    /// Configuration with default ports.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_CONTROL_PORT,
            stream_port: DEFAULT_STREAM_PORT,
        }
    }
}

/// One acquisition configuration, validated by the controller before any
/// device command is issued.
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    /// Integration time per point, in seconds.
    pub integration_time: f64,
    /// Points expected per start.
    pub repetitions: usize,
    /// Latency between points, in seconds (not used by this device).
    pub latency: f64,
    /// Number of starts the scan will issue.
    pub nb_starts: usize,
    /// How the framework synchronizes points.
    pub synchronization: SynchronizationMode,
}

impl PrepareRequest {
    /// Check the request against the supported envelope.
    ///
    /// Streaming-specific constraints are checked by the controller, which
    /// knows the configured acquisition mode and the firmware capability.
    pub fn validate(&self) -> Em2Result<()> {
        if self.integration_time < MIN_INTEGRATION_TIME {
            return Err(Em2Error::Configuration(
                "the minimum integration time is 0.1 ms".into(),
            ));
        }
        if self.synchronization.is_start_type() {
            return Err(Em2Error::Configuration(
                "the Start synchronization is not allowed yet".into(),
            ));
        }
        Ok(())
    }

    /// Total points the device must be armed for.
    pub fn total_points(&self) -> usize {
        self.repetitions * self.nb_starts
    }
}
