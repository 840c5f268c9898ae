//! Firmware version handling and the quirk flags derived from it.
//!
//! The Em2 identifies its software version in the last comma-separated
//! field of the `*idn?` reply. Several firmware ranges ship known defects
//! that the client must compensate for; each workaround is gated by a
//! boolean derived once per session from the version triple.

use std::fmt;
use std::str::FromStr;

use crate::error::Em2Error;

/// Instrument firmware version as an ordered (major, minor, patch) triple.
///
/// Missing components default to 0, so `"2.0"` parses as `2.0.0` and
/// compares lexicographically like any other triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch version.
    pub patch: u32,
}

impl FirmwareVersion {
    /// Build a version from its components.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Extract the version from a full `*idn?` reply
    /// (e.g. `"ALBASYNCHROTRON,Electrometer2,000000001,2.0.04"`).
    pub fn from_idn(idn: &str) -> Result<Self, Em2Error> {
        let field = idn
            .rsplit(',')
            .next()
            .ok_or_else(|| Em2Error::parse(idn, "empty identification reply"))?;
        field.trim().parse()
    }
}

impl FromStr for FirmwareVersion {
    type Err = Em2Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let mut component = |name: &str| -> Result<u32, Em2Error> {
            match parts.next() {
                None => Ok(0),
                Some(text) => text
                    .trim()
                    .parse()
                    .map_err(|_| Em2Error::parse(s, format!("invalid {name} version component"))),
            }
        };
        let major = component("major")?;
        let minor = component("minor")?;
        let patch = component("patch")?;
        Ok(Self::new(major, minor, patch))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Firmware-version-derived behavioral workarounds.
///
/// Computed once per session; the firmware cannot change while the
/// connection is up, so the flags are never re-queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuirkFlags {
    /// Firmware ≤ 2.0.0 counts buffer positions from 1, so every read start
    /// index must be shifted down by one on the wire.
    pub read_index_off_by_one: bool,
    /// Firmware in [1.3.5, 2.1.0) loses accumulator bits on long
    /// acquisitions; retrieved samples must be rescaled.
    pub long_acquisition_scale_bug: bool,
    /// Firmware ≥ 2.2.0 can push fast-buffer data over the streaming port.
    pub streaming_supported: bool,
}

impl QuirkFlags {
    /// Derive the flags for `version`.
    pub fn for_version(version: FirmwareVersion) -> Self {
        Self {
            read_index_off_by_one: version <= FirmwareVersion::new(2, 0, 0),
            long_acquisition_scale_bug: version >= FirmwareVersion::new(1, 3, 5)
                && version < FirmwareVersion::new(2, 1, 0),
            streaming_supported: version >= FirmwareVersion::new(2, 2, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quirks(major: u32, minor: u32, patch: u32) -> QuirkFlags {
        QuirkFlags::for_version(FirmwareVersion::new(major, minor, patch))
    }

    #[test]
    fn parses_partial_versions_with_zero_padding() {
        let v: FirmwareVersion = "2.0".parse().unwrap();
        assert_eq!(v, FirmwareVersion::new(2, 0, 0));
        let v: FirmwareVersion = "1".parse().unwrap();
        assert_eq!(v, FirmwareVersion::new(1, 0, 0));
    }

    #[test]
    fn parses_version_from_idn_reply() {
        let v = FirmwareVersion::from_idn("ALBA,Electrometer2,000000001, 2.2.1").unwrap();
        assert_eq!(v, FirmwareVersion::new(2, 2, 1));
    }

    #[test]
    fn rejects_garbage_version_components() {
        assert!("2.x.1".parse::<FirmwareVersion>().is_err());
        assert!(FirmwareVersion::from_idn("ALBA,Electrometer2,1,fw-unknown").is_err());
    }

    #[test]
    fn read_index_quirk_covers_firmware_up_to_2_0_0() {
        assert!(quirks(1, 9, 9).read_index_off_by_one);
        assert!(quirks(2, 0, 0).read_index_off_by_one);
        assert!(!quirks(2, 0, 1).read_index_off_by_one);
        assert!(!quirks(2, 1, 0).read_index_off_by_one);
    }

    #[test]
    fn scaling_quirk_covers_1_3_5_up_to_2_1_0() {
        assert!(!quirks(1, 3, 4).long_acquisition_scale_bug);
        assert!(quirks(1, 3, 5).long_acquisition_scale_bug);
        assert!(quirks(2, 0, 99).long_acquisition_scale_bug);
        assert!(!quirks(2, 1, 0).long_acquisition_scale_bug);
    }

    #[test]
    fn streaming_needs_firmware_2_2_0() {
        assert!(!quirks(2, 1, 9).streaming_supported);
        assert!(quirks(2, 2, 0).streaming_supported);
        assert!(quirks(3, 0, 0).streaming_supported);
    }
}
