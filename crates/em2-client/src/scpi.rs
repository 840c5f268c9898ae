//! SCPI over TCP for the Em2 control channel.
//!
//! The control channel is a single persistent duplex connection carrying
//! newline-delimited commands with strict request-N/reply-N correlation.
//! The transport opens lazily on the first exchange and drops the socket on
//! any I/O error so the next exchange reconnects; failed commands are never
//! retried here.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use em2_core::{channel_key, Em2Error, Em2Result, CHANNEL_MAX, CHANNEL_MIN};

/// One batched command/reply exchange on the control channel.
///
/// Implemented by the real TCP transport and by [`MockEm2Device`], so the
/// facade can be exercised without hardware (mock injection seam).
#[async_trait]
pub trait ScpiExchange: Send + Sync {
    /// Send `cmds` as newline-terminated lines and return one trimmed reply
    /// line per command, in request order.
    async fn exchange(&self, cmds: &[String]) -> Em2Result<Vec<String>>;
}

/// Persistent line-based TCP transport for the control channel.
pub struct ScpiTransport {
    host: String,
    port: u16,
    stream: Mutex<Option<BufReader<TcpStream>>>,
}

impl ScpiTransport {
    /// Create a transport; no connection is made until the first exchange.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Em2Result<BufReader<TcpStream>> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;
        tracing::info!("connected to Em2 at {}:{}", self.host, self.port);
        Ok(BufReader::new(stream))
    }

    async fn exchange_inner(
        &self,
        stream: &mut BufReader<TcpStream>,
        cmds: &[String],
    ) -> Em2Result<Vec<String>> {
        let mut payload = String::new();
        for cmd in cmds {
            payload.push_str(cmd);
            payload.push('\n');
        }
        stream.get_mut().write_all(payload.as_bytes()).await?;
        stream.get_mut().flush().await?;

        let mut replies = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            let mut line = String::new();
            let n = stream.read_line(&mut line).await?;
            if n == 0 {
                return Err(Em2Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("connection closed while waiting for reply to {cmd:?}"),
                )));
            }
            replies.push(line.trim().to_string());
        }
        Ok(replies)
    }
}

#[async_trait]
impl ScpiExchange for ScpiTransport {
    async fn exchange(&self, cmds: &[String]) -> Em2Result<Vec<String>> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        tracing::debug!("-> {:?}", cmds);
        let stream = guard.as_mut().ok_or_else(|| {
            Em2Error::Transport(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "control connection unavailable",
            ))
        })?;
        let result = self.exchange_inner(stream, cmds).await;
        if result.is_err() {
            // Drop the socket; the next exchange reconnects.
            *guard = None;
        }
        if let Ok(replies) = &result {
            tracing::debug!("<- {:?}", replies);
        }
        result
    }
}

// =============================================================================
// Mock instrument
// =============================================================================

/// Mock Em2 for testing without hardware.
///
/// Keeps a generic settings map plus enough acquisition state to exercise
/// the facade and the controller: `ACQU:START` arms it, each `TRIG:SWSE`
/// produces one point, `ACQU:MEAS?` replays the buffer in the firmware's
/// reply format (honoring the pre-2.0.1 one-based read index).
pub struct MockEm2Device {
    state: SyncMutex<MockState>,
}

struct MockState {
    version: String,
    settings: HashMap<String, String>,
    started: bool,
    nb_points_produced: usize,
    forced_state: Option<String>,
    log: Vec<String>,
}

impl MockEm2Device {
    /// Mock with recent firmware (streaming-capable).
    pub fn new() -> Self {
        Self::with_version("2.2.1")
    }

    /// Mock reporting the given firmware version in `*idn?`.
    pub fn with_version(version: &str) -> Self {
        let mut settings = HashMap::new();
        for (key, value) in [
            ("ACQU:MODE", "CURRENT"),
            ("ACQU:TIME", "1000"),
            ("ACQU:NTRIG", "1"),
            ("TMST", "False"),
            ("TRIG:MODE", "SOFTWARE"),
            ("TRIG:INPU", "DIO_1"),
            ("TRIG:POLA", "NORMAL"),
            ("TRIG:DELA", "0"),
            ("TRIG:PREC", "False"),
        ] {
            settings.insert(key.to_string(), value.to_string());
        }
        for nb in CHANNEL_MIN..=CHANNEL_MAX {
            settings.insert(format!("{}:CABO:RANGE", channel_key(nb)), "AUTO".into());
            settings.insert(format!("{}:CABO:INVE", channel_key(nb)), "Off".into());
        }
        Self {
            state: SyncMutex::new(MockState {
                version: version.to_string(),
                settings,
                started: false,
                nb_points_produced: 0,
                forced_state: None,
                log: Vec::new(),
            }),
        }
    }

    /// Append `n` acquired points, as an external trigger source would.
    pub fn produce_points(&self, n: usize) {
        self.state.lock().nb_points_produced += n;
    }

    /// Force the `ACQU:STAT?` reply (pass `None` to restore simulation).
    pub fn force_state(&self, state: Option<&str>) {
        self.state.lock().forced_state = state.map(str::to_string);
    }

    /// Every command the mock has processed, in order.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    fn handle(state: &mut MockState, cmd: &str) -> String {
        state.log.push(cmd.to_string());
        match cmd {
            "*idn?" | "*IDN?" => {
                return format!("ALBASYNCHROTRON,Electrometer2,000000001,{}", state.version)
            }
            "ACQU:STAT?" => return Self::acquisition_state(state),
            "ACQU:NDAT?" => return state.nb_points_produced.to_string(),
            "ACQU:START" | "ACQU:START SWTRIG" => {
                state.started = true;
                state.nb_points_produced = 0;
                if cmd.ends_with("SWTRIG") {
                    state.nb_points_produced += 1;
                }
                return "ACK".into();
            }
            "ACQU:STOP True" => {
                state.started = false;
                return "ACK".into();
            }
            "TRIG:SWSE True" => {
                if state.started {
                    state.nb_points_produced += 1;
                }
                return "ACK".into();
            }
            _ => {}
        }
        if let Some(key) = cmd.strip_suffix('?') {
            return match state.settings.get(key) {
                Some(value) => value.clone(),
                None => Self::instant_value(key)
                    .unwrap_or_else(|| format!("ERROR: Unknown query: {key}")),
            };
        }
        if let Some(args) = cmd.strip_prefix("ACQU:MEAS? ") {
            return Self::measurement_reply(state, args);
        }
        match cmd.rsplit_once(' ') {
            Some((key, value)) if state.settings.contains_key(key) => {
                state.settings.insert(key.to_string(), value.to_string());
                "ACK".into()
            }
            _ => format!("ERROR: Unknown command: {cmd}"),
        }
    }

    fn acquisition_state(state: &MockState) -> String {
        if let Some(forced) = &state.forced_state {
            return forced.clone();
        }
        let ntrig: usize = state
            .settings
            .get("ACQU:NTRIG")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if state.started && state.nb_points_produced < ntrig {
            "STATE_ACQUIRING".into()
        } else {
            "STATE_ON".into()
        }
    }

    fn instant_value(key: &str) -> Option<String> {
        for nb in CHANNEL_MIN..=CHANNEL_MAX {
            if key == format!("{}:INSC", channel_key(nb)) {
                return Some(format!("{:e}", f64::from(nb) * 1e-6));
            }
            if key == format!("{}:INSV", channel_key(nb)) {
                return Some(format!("{:e}", f64::from(nb) * 1e-3));
            }
            if key == format!("{}:CURR", channel_key(nb)) || key == format!("{}:VOLT", channel_key(nb)) {
                return Some("[]".into());
            }
        }
        None
    }

    /// Sample for point `index` (0-based): `index + 1` on every channel.
    fn sample(index: usize) -> f64 {
        (index + 1) as f64
    }

    fn measurement_reply(state: &MockState, args: &str) -> String {
        let old_read_index = state
            .version
            .parse::<em2_core::FirmwareVersion>()
            .map(|v| em2_core::QuirkFlags::for_version(v).read_index_off_by_one)
            .unwrap_or(false);
        let mut parts = args.splitn(2, ',');
        let wire_start: i64 = match parts.next().unwrap_or("").trim().parse() {
            Ok(v) => v,
            Err(_) => return format!("ERROR: Bad read position: {args}"),
        };
        // Pre-2.0.1 firmware counts positions from 1: position N on the
        // wire addresses buffer slot N+1.
        let start = if old_read_index {
            wire_start + 1
        } else {
            wire_start
        };
        let available = state.nb_points_produced as i64;
        let nb = match parts.next() {
            None => available - start,
            Some(text) => match text.trim().parse::<i64>() {
                Ok(v) => v,
                Err(_) => return format!("ERROR: Bad read count: {args}"),
            },
        };
        if start < 0 || nb < 0 || start + nb > available {
            return format!("ERROR: Read out of range: {args}");
        }
        let mut entries = Vec::new();
        for key in super::codec::measurement_channel_keys() {
            let values: Vec<String> = (start..start + nb)
                .map(|i| format!("{:?}", Self::sample(i as usize)))
                .collect();
            entries.push(format!("['{}', [{}]]", key, values.join(", ")));
        }
        format!("[{}]", entries.join(", "))
    }
}

impl Default for MockEm2Device {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScpiExchange for MockEm2Device {
    async fn exchange(&self, cmds: &[String]) -> Em2Result<Vec<String>> {
        let mut state = self.state.lock();
        Ok(cmds
            .iter()
            .map(|cmd| Self::handle(&mut state, cmd))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn one(mock: &MockEm2Device, cmd: &str) -> String {
        mock.exchange(&[cmd.to_string()]).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn mock_identifies_with_configured_version() {
        let mock = MockEm2Device::with_version("2.0.0");
        let idn = one(&mock, "*idn?").await;
        assert!(idn.ends_with(",2.0.0"));
    }

    #[tokio::test]
    async fn mock_settings_round_trip() {
        let mock = MockEm2Device::new();
        assert_eq!(one(&mock, "ACQU:TIME 2000").await, "ACK");
        assert_eq!(one(&mock, "ACQU:TIME?").await, "2000");
        assert!(one(&mock, "BOGUS:CMD 1").await.starts_with("ERROR:"));
    }

    #[tokio::test]
    async fn mock_produces_one_point_per_software_trigger() {
        let mock = MockEm2Device::new();
        one(&mock, "ACQU:NTRIG 2").await;
        one(&mock, "ACQU:START").await;
        assert_eq!(one(&mock, "ACQU:STAT?").await, "STATE_ACQUIRING");
        one(&mock, "TRIG:SWSE True").await;
        one(&mock, "TRIG:SWSE True").await;
        assert_eq!(one(&mock, "ACQU:NDAT?").await, "2");
        assert_eq!(one(&mock, "ACQU:STAT?").await, "STATE_ON");
    }

    #[tokio::test]
    async fn transport_correlates_batched_replies() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    break;
                }
                let reply = format!("reply to {}\n", line.trim());
                if reader.get_mut().write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let transport = ScpiTransport::new(addr.ip().to_string(), addr.port());
        let replies = transport
            .exchange(&["ACQU:TIME?".into(), "ACQU:NTRIG?".into()])
            .await
            .unwrap();
        assert_eq!(replies, vec!["reply to ACQU:TIME?", "reply to ACQU:NTRIG?"]);
    }
}
