//! Acquisition facade for one Em2 device.
//!
//! `Em2` wraps the control channel with typed getters/setters, owns the
//! streaming receiver, and hides the firmware quirks: read indices,
//! long-acquisition rescaling and the choice of data path (control query
//! vs. stream) are all resolved here so callers see one uniform
//! `nb_points_ready`/`read` API.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut em2 = Em2::new(Em2Config::new("electproto38"));
//! em2.set_acquisition_time(1.0).await?;
//! em2.set_nb_points(10).await?;
//! em2.start_acquisition(true).await?;
//! let data = em2.read(0, None).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use evalexpr::{eval_number_with_context, ContextWithMutableVariables, HashMapContext, Value};

use em2_core::{
    channel_key, AcquisitionMode, Em2Config, Em2Error, Em2Result, FirmwareVersion, QuirkFlags,
    TriggerMode, CHANNEL_MAX, CHANNEL_MIN,
};

use crate::codec::{
    check_error_sentinel, format_bool, parse_acquisition_state, parse_bool, parse_f64,
    parse_float_list, parse_measurement_reply, parse_usize, ChannelData,
};
use crate::scpi::{ScpiExchange, ScpiTransport};
use crate::stream::StreamReceiver;

/// Formula text meaning "no transform".
const IDENTITY_FORMULA: &str = "value";

// Sampling chain behind the accumulator-overflow firmware bug: 200 kHz raw
// rate, 64x oversampling, overflow after 8192 samples.
const ADC_RAW_SAMPLING_RATE: f64 = 200e3;
const ADC_OVERSAMPLING_FACTOR: f64 = 64.0;
const NB_SAMPLES_WITHOUT_OVERFLOW: f64 = 8192.0;

/// Client for one Em2 electrometer.
pub struct Em2 {
    config: Em2Config,
    link: Arc<dyn ScpiExchange>,
    receiver: StreamReceiver,
    firmware: Option<FirmwareVersion>,
    quirks: Option<QuirkFlags>,
    formulas: HashMap<u8, String>,
}

impl Em2 {
    /// Client over TCP for both channels; nothing is connected until the
    /// first command.
    pub fn new(config: Em2Config) -> Self {
        let link = Arc::new(ScpiTransport::new(config.host.clone(), config.port));
        let receiver = StreamReceiver::new(config.host.clone(), config.stream_port);
        Self::with_parts(config, link, receiver)
    }

    /// Client over an injected control link (used by tests).
    pub fn with_link(config: Em2Config, link: Arc<dyn ScpiExchange>) -> Self {
        let receiver = StreamReceiver::new(config.host.clone(), config.stream_port);
        Self::with_parts(config, link, receiver)
    }

    /// Client over injected control link and stream receiver.
    pub fn with_parts(
        config: Em2Config,
        link: Arc<dyn ScpiExchange>,
        receiver: StreamReceiver,
    ) -> Self {
        let formulas = (CHANNEL_MIN..=CHANNEL_MAX)
            .map(|nb| (nb, IDENTITY_FORMULA.to_string()))
            .collect();
        Self {
            config,
            link,
            receiver,
            firmware: None,
            quirks: None,
            formulas,
        }
    }

    /// Connection settings this client was built with.
    pub fn config(&self) -> &Em2Config {
        &self.config
    }

    // =========================================================================
    // Command primitives
    // =========================================================================

    /// Send several commands in one exchange; replies come back in order
    /// and are not checked for the error sentinel.
    pub async fn commands(&self, cmds: &[String]) -> Em2Result<Vec<String>> {
        self.link.exchange(cmds).await
    }

    /// Send one command and return its reply, raising on an `ERROR:` reply.
    pub async fn command(&self, cmd: &str) -> Em2Result<String> {
        let cmds = [cmd.to_string()];
        let mut replies = self.link.exchange(&cmds).await?;
        check_error_sentinel(replies.remove(0))
    }

    // =========================================================================
    // Identity and quirks
    // =========================================================================

    /// Full identification string (`*idn?`).
    pub async fn idn(&self) -> Em2Result<String> {
        self.command("*idn?").await
    }

    /// Firmware version, fetched once and cached for the session.
    pub async fn software_version(&mut self) -> Em2Result<FirmwareVersion> {
        if let Some(version) = self.firmware {
            return Ok(version);
        }
        let version = FirmwareVersion::from_idn(&self.idn().await?)?;
        tracing::info!("Em2 firmware version {version}");
        self.firmware = Some(version);
        Ok(version)
    }

    /// Firmware workarounds applying to this session, computed once.
    pub async fn quirks(&mut self) -> Em2Result<QuirkFlags> {
        if let Some(quirks) = self.quirks {
            return Ok(quirks);
        }
        let quirks = QuirkFlags::for_version(self.software_version().await?);
        self.quirks = Some(quirks);
        Ok(quirks)
    }

    // =========================================================================
    // Acquisition settings
    // =========================================================================

    /// Integration time per point, in seconds (the wire speaks ms).
    pub async fn acquisition_time(&self) -> Em2Result<f64> {
        Ok(parse_f64(&self.command("ACQU:TIME?").await?)? * 1e-3)
    }

    /// Set the integration time per point, in seconds.
    pub async fn set_acquisition_time(&self, seconds: f64) -> Em2Result<()> {
        self.command(&format!("ACQU:TIME {}", seconds * 1e3)).await?;
        Ok(())
    }

    /// Number of triggers the device is armed for.
    pub async fn nb_points(&self) -> Em2Result<usize> {
        parse_usize(&self.command("ACQU:NTRIG?").await?)
    }

    /// Arm the device for `nb` triggers.
    pub async fn set_nb_points(&self, nb: usize) -> Em2Result<()> {
        self.command(&format!("ACQU:NTRIG {nb}")).await?;
        Ok(())
    }

    /// Hardware acquisition state word (`ON`, `ACQUIRING`, `RUNNING`, ...).
    pub async fn acquisition_state(&self) -> Em2Result<String> {
        parse_acquisition_state(&self.command("ACQU:STAT?").await?)
    }

    /// Acquisition mode.
    pub async fn acquisition_mode(&self) -> Em2Result<AcquisitionMode> {
        self.command("ACQU:MODE?").await?.parse()
    }

    /// Set the acquisition mode.
    pub async fn set_acquisition_mode(&self, mode: AcquisitionMode) -> Em2Result<()> {
        self.command(&format!("ACQU:MODE {mode}")).await?;
        Ok(())
    }

    /// Whether the configured mode delivers data over the stream only.
    pub async fn streaming_required(&self) -> Em2Result<bool> {
        Ok(self.acquisition_mode().await?.requires_streaming())
    }

    /// Whether the device timestamps points.
    pub async fn timestamp_data(&self) -> Em2Result<bool> {
        Ok(parse_bool(&self.command("TMST?").await?))
    }

    /// Enable/disable point timestamping.
    pub async fn set_timestamp_data(&self, enabled: bool) -> Em2Result<()> {
        self.command(&format!("TMST {}", format_bool(enabled))).await?;
        Ok(())
    }

    // =========================================================================
    // Trigger settings
    // =========================================================================

    /// Trigger mode.
    pub async fn trigger_mode(&self) -> Em2Result<TriggerMode> {
        self.command("TRIG:MODE?").await?.parse()
    }

    /// Set the trigger mode.
    pub async fn set_trigger_mode(&self, mode: TriggerMode) -> Em2Result<()> {
        self.command(&format!("TRIG:MODE {mode}")).await?;
        Ok(())
    }

    /// External trigger input line.
    pub async fn trigger_input(&self) -> Em2Result<String> {
        self.command("TRIG:INPU?").await
    }

    /// Select the external trigger input line.
    pub async fn set_trigger_input(&self, input: &str) -> Em2Result<()> {
        self.command(&format!("TRIG:INPU {input}")).await?;
        Ok(())
    }

    /// Trigger delay in seconds.
    pub async fn trigger_delay(&self) -> Em2Result<f64> {
        Ok(parse_f64(&self.command("TRIG:DELA?").await?)? * 1e-3)
    }

    /// Set the trigger delay in seconds.
    pub async fn set_trigger_delay(&self, seconds: f64) -> Em2Result<()> {
        self.command(&format!("TRIG:DELA {}", seconds * 1e3)).await?;
        Ok(())
    }

    /// Trigger polarity.
    pub async fn trigger_polarity(&self) -> Em2Result<String> {
        self.command("TRIG:POLA?").await
    }

    /// Set the trigger polarity.
    pub async fn set_trigger_polarity(&self, polarity: &str) -> Em2Result<()> {
        self.command(&format!("TRIG:POLA {polarity}")).await?;
        Ok(())
    }

    /// Precise-trigger flag.
    pub async fn trigger_precision(&self) -> Em2Result<bool> {
        Ok(parse_bool(&self.command("TRIG:PREC?").await?))
    }

    /// Set the precise-trigger flag.
    pub async fn set_trigger_precision(&self, enabled: bool) -> Em2Result<()> {
        self.command(&format!("TRIG:PREC {}", format_bool(enabled)))
            .await?;
        Ok(())
    }

    /// Issue one software trigger.
    pub async fn software_trigger(&self) -> Em2Result<()> {
        self.command("TRIG:SWSE True").await?;
        Ok(())
    }

    // =========================================================================
    // Channels
    // =========================================================================

    /// Handle for channel `nb` (1..=4).
    pub fn channel(&self, nb: u8) -> Em2Result<Channel<'_>> {
        if !(CHANNEL_MIN..=CHANNEL_MAX).contains(&nb) {
            return Err(Em2Error::Configuration(format!(
                "channel {nb} out of range {CHANNEL_MIN}..={CHANNEL_MAX}"
            )));
        }
        Ok(Channel { em2: self, nb })
    }

    /// Post-processing formula for channel `nb`.
    pub fn formula(&self, nb: u8) -> Em2Result<&str> {
        self.formulas
            .get(&nb)
            .map(String::as_str)
            .ok_or_else(|| Em2Error::Configuration(format!("channel {nb} has no formula")))
    }

    /// Set the post-processing formula for channel `nb`.
    ///
    /// The expression is evaluated per sample with the raw sample bound to
    /// `value` (e.g. `"(value / 10) * 1e-6"`); `"value"` is the identity.
    /// Takes effect on the next read.
    pub fn set_formula(&mut self, nb: u8, formula: impl Into<String>) -> Em2Result<()> {
        if !(CHANNEL_MIN..=CHANNEL_MAX).contains(&nb) {
            return Err(Em2Error::Configuration(format!(
                "channel {nb} out of range {CHANNEL_MIN}..={CHANNEL_MAX}"
            )));
        }
        self.formulas.insert(nb, formula.into());
        Ok(())
    }

    // =========================================================================
    // Acquisition control and data retrieval
    // =========================================================================

    /// Start an acquisition, optionally with an embedded software trigger.
    ///
    /// When the configured mode needs the stream and the firmware supports
    /// it, the receiver is started *before* the device so the first frames
    /// cannot be lost.
    pub async fn start_acquisition(&mut self, soft_trigger: bool) -> Em2Result<()> {
        if self.streaming_required().await? && self.quirks().await?.streaming_supported {
            self.receiver.start().await;
        }
        let cmd = if soft_trigger {
            "ACQU:START SWTRIG"
        } else {
            "ACQU:START"
        };
        self.command(cmd).await?;
        Ok(())
    }

    /// Stop the acquisition and, if active, the stream receiver.
    pub async fn stop_acquisition(&mut self) -> Em2Result<()> {
        self.command("ACQU:STOP True").await?;
        if self.receiver.running() {
            self.receiver.stop().await;
        }
        Ok(())
    }

    /// Points acquired and ready to be read.
    ///
    /// Sourced from the stream receiver while it is active, else polled
    /// over the control channel.
    pub async fn nb_points_ready(&self) -> Em2Result<usize> {
        if self.receiver.running() {
            Ok(self.receiver.nb_points_received()? as usize)
        } else {
            parse_usize(&self.command("ACQU:NDAT?").await?)
        }
    }

    /// Read `nb_points` (all available when `None`) starting at
    /// `start_position`, as per-channel sample vectors with quirk
    /// corrections and formulas applied.
    pub async fn read(
        &mut self,
        start_position: usize,
        nb_points: Option<usize>,
    ) -> Em2Result<ChannelData> {
        let mut data = if self.receiver.running() {
            self.receiver.read(start_position as u64, nb_points)?
        } else {
            self.read_via_scpi(start_position, nb_points).await?
        };
        self.apply_formulas(&mut data)?;
        Ok(data)
    }

    async fn read_via_scpi(
        &mut self,
        start_position: usize,
        nb_points: Option<usize>,
    ) -> Em2Result<ChannelData> {
        let quirks = self.quirks().await?;
        let mut wire_start = start_position as i64;
        if quirks.read_index_off_by_one {
            // Pre-2.0.1 firmware counts buffer positions from 1; position 0
            // goes out as -1 on purpose.
            wire_start -= 1;
        }
        let mut cmd = format!("ACQU:MEAS? {wire_start}");
        if let Some(nb) = nb_points {
            cmd.push_str(&format!(",{nb}"));
        }
        let mut data = parse_measurement_reply(&self.command(&cmd).await?)?;
        if quirks.long_acquisition_scale_bug {
            let factor = long_acquisition_scale_factor(self.acquisition_time().await?);
            if factor != 1.0 {
                for values in data.values_mut() {
                    for value in values.iter_mut() {
                        *value *= factor;
                    }
                }
            }
        }
        Ok(data)
    }

    fn apply_formulas(&self, data: &mut ChannelData) -> Em2Result<()> {
        let mut context = HashMapContext::new();
        for (nb, formula) in &self.formulas {
            if formula.eq_ignore_ascii_case(IDENTITY_FORMULA) {
                continue;
            }
            let Some(values) = data.get_mut(&channel_key(*nb)) else {
                continue;
            };
            for value in values.iter_mut() {
                context
                    .set_value(IDENTITY_FORMULA.into(), Value::Float(*value))
                    .map_err(|e| Em2Error::Formula(e.to_string()))?;
                *value = eval_number_with_context(formula, &context)
                    .map_err(|e| Em2Error::Formula(format!("{formula:?}: {e}")))?;
            }
        }
        Ok(())
    }
}

/// Scale factor compensating the accumulator-overflow firmware bug.
///
/// The accumulator overflows every 8192 effective samples (2.62 s at the
/// 3.125 kHz effective rate); each doubling of the overflow count costs one
/// accumulator bit, so the retrieved values must be scaled back up by the
/// smallest power of two strictly greater than the overflow count.
fn long_acquisition_scale_factor(acquisition_time: f64) -> f64 {
    let sampling_rate = ADC_RAW_SAMPLING_RATE / ADC_OVERSAMPLING_FACTOR;
    let accumulator_overflow_time = NB_SAMPLES_WITHOUT_OVERFLOW / sampling_rate;
    let nb_overflows = (acquisition_time / accumulator_overflow_time) as u64;
    if nb_overflows > 0 {
        let nb_bits_lost = u64::BITS - nb_overflows.leading_zeros();
        (1u64 << nb_bits_lost) as f64
    } else {
        1.0
    }
}

/// Handle for one measurement channel.
pub struct Channel<'a> {
    em2: &'a Em2,
    nb: u8,
}

impl Channel<'_> {
    fn key(&self) -> String {
        channel_key(self.nb)
    }

    /// Input range setting.
    pub async fn range(&self) -> Em2Result<String> {
        self.em2.command(&format!("{}:CABO:RANGE?", self.key())).await
    }

    /// Set the input range.
    pub async fn set_range(&self, range: &str) -> Em2Result<()> {
        self.em2
            .command(&format!("{}:CABO:RANGE {range}", self.key()))
            .await?;
        Ok(())
    }

    /// Digital inversion flag.
    pub async fn inversion(&self) -> Em2Result<bool> {
        Ok(self.em2.command(&format!("{}:CABO:INVE?", self.key())).await? == "On")
    }

    /// Set the digital inversion flag.
    pub async fn set_inversion(&self, inverted: bool) -> Em2Result<()> {
        let word = if inverted { "On" } else { "Off" };
        self.em2
            .command(&format!("{}:CABO:INVE {word}", self.key()))
            .await?;
        Ok(())
    }

    /// Instantaneous current reading.
    pub async fn instant_current(&self) -> Em2Result<f64> {
        parse_f64(&self.em2.command(&format!("{}:INSC?", self.key())).await?)
    }

    /// Instantaneous voltage reading.
    pub async fn instant_voltage(&self) -> Em2Result<f64> {
        parse_f64(&self.em2.command(&format!("{}:INSV?", self.key())).await?)
    }

    /// Buffered current samples.
    pub async fn current_buffer(&self) -> Em2Result<Vec<f64>> {
        parse_float_list(&self.em2.command(&format!("{}:CURR?", self.key())).await?)
    }

    /// Buffered voltage samples.
    pub async fn voltage_buffer(&self) -> Em2Result<Vec<f64>> {
        parse_float_list(&self.em2.command(&format!("{}:VOLT?", self.key())).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scpi::MockEm2Device;

    fn client(version: &str) -> Em2 {
        Em2::with_link(
            Em2Config::new("mock"),
            Arc::new(MockEm2Device::with_version(version)),
        )
    }

    #[tokio::test]
    async fn acquisition_time_round_trips_in_seconds() {
        let em2 = client("2.2.1");
        em2.set_acquisition_time(1.5).await.unwrap();
        let time = em2.acquisition_time().await.unwrap();
        assert!((time - 1.5).abs() < 1e-3);
    }

    #[tokio::test]
    async fn protocol_errors_surface_the_instrument_text() {
        let em2 = client("2.2.1");
        let err = em2.command("NOT:A:COMMAND 1").await.unwrap_err();
        assert!(matches!(err, Em2Error::Protocol(m) if m.contains("NOT:A:COMMAND")));
    }

    #[tokio::test]
    async fn software_version_is_fetched_once() {
        let mock = Arc::new(MockEm2Device::with_version("2.0.0"));
        let mut em2 = Em2::with_link(Em2Config::new("mock"), Arc::clone(&mock) as Arc<dyn ScpiExchange>);
        let v1 = em2.software_version().await.unwrap();
        let v2 = em2.software_version().await.unwrap();
        assert_eq!(v1, FirmwareVersion::new(2, 0, 0));
        assert_eq!(v1, v2);
        let idn_queries = mock.log().iter().filter(|c| *c == "*idn?").count();
        assert_eq!(idn_queries, 1);
    }

    #[tokio::test]
    async fn read_applies_the_off_by_one_start_on_old_firmware() {
        let mock = Arc::new(MockEm2Device::with_version("2.0.0"));
        let mut em2 = Em2::with_link(Em2Config::new("mock"), Arc::clone(&mock) as Arc<dyn ScpiExchange>);
        em2.set_acquisition_time(1.0).await.unwrap();
        mock.produce_points(3);

        let data = em2.read(1, Some(2)).await.unwrap();
        assert_eq!(data["CHAN01"], vec![2.0, 3.0]);
        assert!(mock.log().iter().any(|c| c == "ACQU:MEAS? 0,2"));
    }

    #[tokio::test]
    async fn read_uses_plain_indices_on_recent_firmware() {
        let mock = Arc::new(MockEm2Device::with_version("2.2.1"));
        let mut em2 = Em2::with_link(Em2Config::new("mock"), Arc::clone(&mock) as Arc<dyn ScpiExchange>);
        mock.produce_points(2);

        let data = em2.read(0, None).await.unwrap();
        assert_eq!(data["CHAN02"], vec![1.0, 2.0]);
        assert!(mock.log().iter().any(|c| c == "ACQU:MEAS? 0"));
    }

    #[tokio::test]
    async fn long_acquisitions_are_rescaled_on_buggy_firmware() {
        // 6.0 s of acquisition crosses the 2.62 s overflow period twice;
        // two overflows lose two bits, so samples scale by 4.
        let mock = Arc::new(MockEm2Device::with_version("2.0.0"));
        let mut em2 = Em2::with_link(Em2Config::new("mock"), Arc::clone(&mock) as Arc<dyn ScpiExchange>);
        em2.set_acquisition_time(6.0).await.unwrap();
        mock.produce_points(2);

        let data = em2.read(0, Some(2)).await.unwrap();
        assert_eq!(data["CHAN01"], vec![4.0, 8.0]);
    }

    #[tokio::test]
    async fn short_acquisitions_pass_through_unscaled() {
        let mock = Arc::new(MockEm2Device::with_version("2.0.0"));
        let mut em2 = Em2::with_link(Em2Config::new("mock"), Arc::clone(&mock) as Arc<dyn ScpiExchange>);
        em2.set_acquisition_time(1.0).await.unwrap();
        mock.produce_points(2);

        let data = em2.read(0, Some(2)).await.unwrap();
        assert_eq!(data["CHAN01"], vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn no_rescaling_on_fixed_firmware() {
        let mock = Arc::new(MockEm2Device::with_version("2.1.0"));
        let mut em2 = Em2::with_link(Em2Config::new("mock"), Arc::clone(&mock) as Arc<dyn ScpiExchange>);
        em2.set_acquisition_time(6.0).await.unwrap();
        mock.produce_points(1);

        let data = em2.read(0, Some(1)).await.unwrap();
        assert_eq!(data["CHAN01"], vec![1.0]);
    }

    #[test]
    fn scale_factor_matches_the_firmware_accumulator() {
        assert_eq!(long_acquisition_scale_factor(1.0), 1.0);
        assert_eq!(long_acquisition_scale_factor(2.7), 2.0);
        assert_eq!(long_acquisition_scale_factor(6.0), 4.0);
        assert_eq!(long_acquisition_scale_factor(11.0), 8.0);
    }

    #[tokio::test]
    async fn formulas_transform_samples_per_channel() {
        let mock = Arc::new(MockEm2Device::with_version("2.2.1"));
        let mut em2 = Em2::with_link(Em2Config::new("mock"), Arc::clone(&mock) as Arc<dyn ScpiExchange>);
        em2.set_formula(1, "(value * 2) + 1").unwrap();
        mock.produce_points(2);

        let data = em2.read(0, None).await.unwrap();
        assert_eq!(data["CHAN01"], vec![3.0, 5.0]);
        // Other channels keep the identity default.
        assert_eq!(data["CHAN02"], vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn bad_formula_raises_a_formula_error() {
        let mock = Arc::new(MockEm2Device::with_version("2.2.1"));
        let mut em2 = Em2::with_link(Em2Config::new("mock"), Arc::clone(&mock) as Arc<dyn ScpiExchange>);
        em2.set_formula(1, "value +* 2").unwrap();
        mock.produce_points(1);

        assert!(matches!(
            em2.read(0, None).await,
            Err(Em2Error::Formula(_))
        ));
    }

    #[tokio::test]
    async fn channel_accessors_speak_the_channel_prefix() {
        let em2 = client("2.2.1");
        let chan = em2.channel(2).unwrap();
        chan.set_range("1mA").await.unwrap();
        assert_eq!(chan.range().await.unwrap(), "1mA");
        chan.set_inversion(true).await.unwrap();
        assert!(chan.inversion().await.unwrap());
        let current = chan.instant_current().await.unwrap();
        assert!((current - 2e-6).abs() < 1e-12);
        let voltage = chan.instant_voltage().await.unwrap();
        assert!((voltage - 2e-3).abs() < 1e-9);
        assert!(em2.channel(5).is_err());
        assert!(em2.channel(0).is_err());
    }
}
