//! Error types for the Em2 acquisition client.
//!
//! A single `thiserror` enum covers the whole taxonomy so that callers can
//! match on the failure class: transport failures are never retried
//! internally, protocol errors carry the instrument's own message, and
//! streaming data loss is fatal to the current acquisition.

use thiserror::Error;

/// Convenience alias for results using the client error type.
pub type Em2Result<T> = std::result::Result<T, Em2Error>;

/// Primary error type for the Em2 acquisition client.
///
/// # Error categories
///
/// 1. **Configuration** — the caller asked for an invalid or unsupported
///    combination; raised before any device command is sent.
/// 2. **Transport / Protocol / Parse** — control-channel failures: socket
///    I/O, an explicit `ERROR:` reply, or a reply we could not decode.
/// 3. **DataLoss / Stream** — streaming-channel failures; `DataLoss` is
///    fatal to the current acquisition (stop and restart), `Stream` is the
///    deferred worker error surfaced on the next point-count query.
#[derive(Error, Debug)]
pub enum Em2Error {
    /// Control-socket I/O failure. The session may be re-opened by the
    /// caller; the client does not retry.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The instrument replied with an `ERROR:` sentinel; the payload is the
    /// instrument's own error text.
    #[error("instrument error: {0}")]
    Protocol(String),

    /// A reply arrived but its payload could not be decoded.
    #[error("failed to parse reply {reply:?}: {detail}")]
    Parse {
        /// The offending reply line.
        reply: String,
        /// What went wrong while decoding it.
        detail: String,
    },

    /// Invalid or unsupported acquisition configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The streaming receiver detected a dropped frame, a read away from
    /// the queue front, or an over-read. Not recoverable mid-acquisition.
    #[error("data loss: {0}")]
    DataLoss(String),

    /// Deferred error recorded by the streaming worker (malformed payload
    /// or stream-transport failure).
    #[error("error in streaming worker: {0}")]
    Stream(String),

    /// A per-channel formula failed to parse or evaluate.
    #[error("formula error: {0}")]
    Formula(String),
}

impl Em2Error {
    /// Build a parse error for `reply`.
    pub fn parse(reply: impl Into<String>, detail: impl Into<String>) -> Self {
        Em2Error::Parse {
            reply: reply.into(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_instrument_text() {
        let err = Em2Error::Protocol("CHAN05 out of range".into());
        assert_eq!(format!("{err}"), "instrument error: CHAN05 out of range");
    }

    #[test]
    fn parse_error_names_the_reply() {
        let err = Em2Error::parse("bogus", "invalid float literal");
        let msg = format!("{err}");
        assert!(msg.contains("bogus") && msg.contains("invalid float literal"));
    }
}
