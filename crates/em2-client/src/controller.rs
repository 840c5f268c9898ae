//! Scan-level synchronization on top of the [`Em2`] facade.
//!
//! The controller drives the prepare/start/poll/read cycle an acquisition
//! framework expects: it validates the requested timing envelope, arms the
//! device for a whole scan, issues software triggers when the
//! synchronization kind calls for them, and folds the device's hardware
//! state words into the coarse Idle/Busy/Fault view. Read-out is
//! incremental; points fetched while polling are buffered until the caller
//! collects them.

use std::mem;

use em2_core::{
    AcquisitionState, Em2Error, Em2Result, PrepareRequest, SynchronizationMode, TIMING_CHANNEL_KEY,
};

use crate::client::Em2;
use crate::codec::ChannelData;

/// Hardware state words the controller knows how to interpret.
const KNOWN_HW_STATES: [&str; 4] = ["ON", "ACQUIRING", "RUNNING", "FAULT"];

/// Synchronization state machine for one Em2.
pub struct Em2Controller {
    em2: Em2,
    synchronization: SynchronizationMode,
    use_sw_trigger: bool,
    started: bool,
    aborted: bool,
    nb_points_expected_per_start: usize,
    nb_points_read_per_start: usize,
    nb_points_fetched: usize,
    acq_time: f64,
    pending: ChannelData,
    status: String,
}

impl Em2Controller {
    /// Controller over an already-configured client.
    pub fn new(em2: Em2) -> Self {
        Self {
            em2,
            synchronization: SynchronizationMode::SoftwareTrigger,
            use_sw_trigger: true,
            started: false,
            aborted: false,
            nb_points_expected_per_start: 0,
            nb_points_read_per_start: 0,
            nb_points_fetched: 0,
            acq_time: 0.0,
            pending: ChannelData::new(),
            status: String::new(),
        }
    }

    /// The underlying client.
    pub fn client(&self) -> &Em2 {
        &self.em2
    }

    /// The underlying client, mutably.
    pub fn client_mut(&mut self) -> &mut Em2 {
        &mut self.em2
    }

    /// Human-readable summary of the last polled state.
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Validate `request` and configure the device for the scan.
    ///
    /// A still-running acquisition from a previous scan is stopped first.
    /// Fails without touching the device when the envelope is invalid or
    /// when the configured mode needs streaming the firmware cannot do.
    pub async fn prepare(&mut self, request: &PrepareRequest) -> Em2Result<()> {
        request.validate()?;
        let trigger_mode = request.synchronization.trigger_mode()?;

        let mode = self.em2.acquisition_mode().await?;
        if mode.requires_streaming() {
            if !self.em2.quirks().await?.streaming_supported {
                return Err(Em2Error::Configuration(
                    "the fast buffer mode needs firmware 2.2.0 or later".into(),
                ));
            }
            if request.synchronization == SynchronizationMode::HardwareGate {
                return Err(Em2Error::Configuration(
                    "the fast buffer mode does not support gated synchronization".into(),
                ));
            }
        }

        self.clean_variables().await?;
        self.synchronization = request.synchronization;
        self.use_sw_trigger = request.synchronization.uses_software_trigger();
        self.nb_points_expected_per_start = request.repetitions;
        self.acq_time = request.integration_time;

        self.em2.set_acquisition_time(request.integration_time).await?;
        self.em2.set_trigger_mode(trigger_mode).await?;
        self.em2.set_nb_points(request.total_points()).await?;
        // Timestamps would show up as an extra column; the timing channel is
        // synthesized locally instead.
        self.em2.set_timestamp_data(false).await?;
        Ok(())
    }

    /// Begin (or continue into) one start of the scan.
    ///
    /// The device is armed once for the whole scan on the first call;
    /// subsequent calls only reset the per-start bookkeeping. With
    /// software synchronization each call also issues one trigger.
    pub async fn start(&mut self) -> Em2Result<()> {
        self.nb_points_read_per_start = 0;
        if !self.started {
            self.em2.start_acquisition(false).await?;
            self.started = true;
            self.aborted = false;
        }
        if self.use_sw_trigger {
            self.em2.software_trigger().await?;
        }
        Ok(())
    }

    /// Poll the device and fold its state word into Idle/Busy/Fault.
    ///
    /// While Busy this also drains newly acquired points into the pending
    /// buffer, so a finished acquisition is never reported Idle with data
    /// still unread on the device. A poll that had to drain still reports
    /// Busy and resolves Idle on the next call.
    pub async fn poll_state(&mut self) -> Em2Result<AcquisitionState> {
        let hw_state = self.em2.acquisition_state().await?;
        if hw_state == "FAULT" || !KNOWN_HW_STATES.contains(&hw_state.as_str()) {
            self.status = format!("hardware state {hw_state}");
            return Ok(AcquisitionState::Fault);
        }
        if self.aborted || !self.started {
            self.status = format!("hardware state {hw_state}, not acquiring");
            return Ok(AcquisitionState::Idle);
        }
        let complete = self.start_complete();
        if hw_state == "ON" && !complete {
            // The device finished before we drained its buffer; catch up
            // rather than reporting Busy forever.
            tracing::warn!(
                "device idle with {} of {} points read; draining",
                self.nb_points_read_per_start,
                self.nb_points_expected_per_start
            );
            self.fetch_new_points().await?;
        }
        self.status = format!(
            "hardware state {hw_state}, {} of {} points read",
            self.nb_points_read_per_start, self.nb_points_expected_per_start
        );
        if complete {
            Ok(AcquisitionState::Idle)
        } else {
            Ok(AcquisitionState::Busy)
        }
    }

    /// Collect the points fetched since the previous call.
    ///
    /// Includes the synthetic timing channel (`CHAN00`), one integration
    /// time entry per point.
    pub async fn read_new_points(&mut self) -> Em2Result<ChannelData> {
        if self.started && !self.aborted {
            self.fetch_new_points().await?;
        }
        Ok(mem::take(&mut self.pending))
    }

    /// Stop the acquisition. Idempotent.
    pub async fn abort(&mut self) -> Em2Result<()> {
        if !self.aborted {
            self.aborted = true;
            if self.started {
                self.started = false;
                self.em2.stop_acquisition().await?;
            }
        }
        Ok(())
    }

    fn start_complete(&self) -> bool {
        self.nb_points_read_per_start >= self.nb_points_expected_per_start
    }

    async fn fetch_new_points(&mut self) -> Em2Result<()> {
        let ready = self.em2.nb_points_ready().await?;
        if ready < self.nb_points_fetched {
            return Err(Em2Error::DataLoss(format!(
                "device reports {ready} points but {} were already read",
                self.nb_points_fetched
            )));
        }
        let delta = ready - self.nb_points_fetched;
        if delta == 0 {
            return Ok(());
        }
        let data = self.em2.read(self.nb_points_fetched, Some(delta)).await?;
        for (channel, mut values) in data {
            self.pending.entry(channel).or_default().append(&mut values);
        }
        self.pending
            .entry(TIMING_CHANNEL_KEY.to_string())
            .or_default()
            .extend(std::iter::repeat(self.acq_time).take(delta));
        self.nb_points_fetched += delta;
        self.nb_points_read_per_start += delta;
        Ok(())
    }

    async fn clean_variables(&mut self) -> Em2Result<()> {
        let hw_state = self.em2.acquisition_state().await?;
        if hw_state == "ACQUIRING" || hw_state == "RUNNING" {
            tracing::info!("stopping a still-running acquisition before configuring");
            self.em2.stop_acquisition().await?;
        }
        self.started = false;
        self.aborted = false;
        self.nb_points_expected_per_start = 0;
        self.nb_points_read_per_start = 0;
        self.nb_points_fetched = 0;
        self.pending.clear();
        self.status.clear();
        Ok(())
    }
}
