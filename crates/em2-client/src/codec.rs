//! Encoding and decoding of SCPI command payloads.
//!
//! Replies from the Em2 are single text lines. Scalar payloads are plain
//! numbers or `True`/`False` words; buffered measurements come back as a
//! bracketed list of `(channel, [values...])` pairs, which
//! [`parse_measurement_reply`] decodes into per-channel sample vectors.

use std::collections::HashMap;

use em2_core::{channel_key, Em2Error, Em2Result, CHANNEL_MAX, CHANNEL_MIN};

/// Per-channel sample vectors keyed by wire channel name (`CHAN01`..).
pub type ChannelData = HashMap<String, Vec<f64>>;

/// Error sentinel prefix used by the instrument.
pub const ERROR_SENTINEL: &str = "ERROR:";

/// Check a reply line for the instrument's error sentinel.
///
/// An `ERROR:` reply raises [`Em2Error::Protocol`] carrying the text after
/// the first space; anything else passes through untouched.
pub fn check_error_sentinel(reply: String) -> Em2Result<String> {
    if reply.starts_with(ERROR_SENTINEL) {
        let message = reply
            .splitn(2, ' ')
            .last()
            .unwrap_or(reply.as_str())
            .to_string();
        return Err(Em2Error::Protocol(message));
    }
    Ok(reply)
}

/// Parse a scalar float reply.
pub fn parse_f64(reply: &str) -> Em2Result<f64> {
    reply
        .trim()
        .parse()
        .map_err(|_| Em2Error::parse(reply, "expected a float"))
}

/// Parse a scalar integer reply.
pub fn parse_usize(reply: &str) -> Em2Result<usize> {
    reply
        .trim()
        .parse()
        .map_err(|_| Em2Error::parse(reply, "expected an integer"))
}

/// Parse a `True`/`False` word (the device capitalizes; compare lowercase).
pub fn parse_bool(reply: &str) -> bool {
    reply.trim().to_lowercase() == "true"
}

/// Format a boolean the way the device expects it.
pub fn format_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// Extract the state word from an `ACQU:STAT?` reply (`STATE_ON` -> `ON`).
pub fn parse_acquisition_state(reply: &str) -> Em2Result<String> {
    reply
        .splitn(2, '_')
        .nth(1)
        .map(str::to_string)
        .ok_or_else(|| Em2Error::parse(reply, "expected a STATE_<name> word"))
}

/// Parse a bracketed list of floats, e.g. `[1.0, 2.5, -3e-6]`.
pub fn parse_float_list(reply: &str) -> Em2Result<Vec<f64>> {
    let inner = reply
        .trim()
        .strip_prefix(['[', '('])
        .and_then(|s| s.strip_suffix([']', ')']))
        .ok_or_else(|| Em2Error::parse(reply, "expected a bracketed list"))?
        .trim();
    if inner.is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|item| {
            item.trim()
                .parse()
                .map_err(|_| Em2Error::parse(reply, format!("invalid float {:?}", item.trim())))
        })
        .collect()
}

/// Decode an `ACQU:MEAS?` reply into per-channel samples.
///
/// The device answers with a list of `(channel, values)` pairs rendered as
/// text, e.g. `[['CHAN01', [1.0, 2.0]], ['CHAN02', [0.5, 0.5]], ...]`;
/// bracket style and quote style both vary across firmware, so the parser
/// accepts `[`/`(` pairs and single or double quotes interchangeably.
pub fn parse_measurement_reply(reply: &str) -> Em2Result<ChannelData> {
    let mut parser = ReplyParser::new(reply);
    let mut data = ChannelData::new();
    parser.expect_open()?;
    parser.skip_ws();
    if !parser.try_close() {
        loop {
            parser.expect_open()?;
            let channel = parser.quoted_string()?;
            parser.expect(',')?;
            parser.skip_ws();
            parser.expect_open()?;
            let mut values = Vec::new();
            parser.skip_ws();
            if !parser.try_close() {
                loop {
                    values.push(parser.number()?);
                    parser.skip_ws();
                    if parser.try_close() {
                        break;
                    }
                    parser.expect(',')?;
                }
            }
            parser.skip_ws();
            if !parser.try_close() {
                return Err(parser.error("unterminated channel entry"));
            }
            data.insert(channel, values);
            parser.skip_ws();
            if parser.try_close() {
                break;
            }
            parser.expect(',')?;
            parser.skip_ws();
        }
    }
    Ok(data)
}

/// Minimal recursive-descent reader over a measurement reply line.
struct ReplyParser<'a> {
    source: &'a str,
    rest: &'a str,
}

impl<'a> ReplyParser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            rest: source.trim(),
        }
    }

    fn error(&self, detail: impl Into<String>) -> Em2Error {
        Em2Error::parse(self.source, detail)
    }

    fn skip_ws(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn peek(&self) -> Option<char> {
        self.rest.chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.rest = &self.rest[c.len_utf8()..];
        Some(c)
    }

    fn expect(&mut self, wanted: char) -> Em2Result<()> {
        self.skip_ws();
        match self.bump() {
            Some(c) if c == wanted => Ok(()),
            other => Err(self.error(format!("expected {wanted:?}, found {other:?}"))),
        }
    }

    /// Consume `[` or `(`.
    fn expect_open(&mut self) -> Em2Result<()> {
        self.skip_ws();
        match self.bump() {
            Some('[') | Some('(') => Ok(()),
            other => Err(self.error(format!("expected an opening bracket, found {other:?}"))),
        }
    }

    /// Consume `]` or `)` if present.
    fn try_close(&mut self) -> bool {
        self.skip_ws();
        if matches!(self.peek(), Some(']') | Some(')')) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn quoted_string(&mut self) -> Em2Result<String> {
        self.skip_ws();
        let quote = match self.bump() {
            Some(q @ ('\'' | '"')) => q,
            other => return Err(self.error(format!("expected a quote, found {other:?}"))),
        };
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok(out),
                Some(c) => out.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn number(&mut self) -> Em2Result<f64> {
        self.skip_ws();
        let end = self
            .rest
            .find(|c: char| !matches!(c, '0'..='9' | '+' | '-' | '.' | 'e' | 'E'))
            .unwrap_or(self.rest.len());
        let (text, rest) = self.rest.split_at(end);
        self.rest = rest;
        text.parse()
            .map_err(|_| self.error(format!("invalid float {text:?}")))
    }
}

/// Wire keys of the four measurement channels, in order.
pub fn measurement_channel_keys() -> Vec<String> {
    (CHANNEL_MIN..=CHANNEL_MAX).map(channel_key).collect()
}
