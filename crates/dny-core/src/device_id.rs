//! Device identifier normalization.
//!
//! A device is identified by a 32-bit physical ID carried in every framed
//! message. The canonical text form is 8 uppercase hex digits, left
//! zero-padded. Business systems are permitted to submit the identifier as
//! decimal, bare hex, or `0x`-prefixed hex; [`DeviceId::parse`] accepts all
//! three and canonicalizes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A 32-bit device identifier with a canonical 8-hex-uppercase text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u32);

impl DeviceId {
    pub const fn from_physical(physical_id: u32) -> Self {
        DeviceId(physical_id)
    }

    pub const fn physical(self) -> u32 {
        self.0
    }

    /// Parse a device identifier in any accepted form.
    ///
    /// Decimal is tried first, then hex with or without a `0x` prefix.
    /// Anything else (empty, overlong, non-alphanumeric, > u32) is rejected.
    pub fn parse(s: &str) -> Result<Self, BadDeviceId> {
        let s = s.trim();
        if s.is_empty() {
            return Err(BadDeviceId::new(s));
        }
        if let Ok(v) = s.parse::<u32>() {
            return Ok(DeviceId(v));
        }
        let hex = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if hex.is_empty() || hex.len() > 8 {
            return Err(BadDeviceId::new(s));
        }
        u32::from_str_radix(hex, 16)
            .map(DeviceId)
            .map_err(|_| BadDeviceId::new(s))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = BadDeviceId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceId::parse(s)
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DeviceId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// The submitted identifier is not a device ID in any accepted form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("bad device id: {input:?}")]
pub struct BadDeviceId {
    pub input: String,
}

impl BadDeviceId {
    fn new(input: &str) -> Self {
        BadDeviceId {
            input: input.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_is_zero_padded_uppercase_hex() {
        assert_eq!(DeviceId::from_physical(0x04A2_28CD).to_string(), "04A228CD");
        assert_eq!(DeviceId::from_physical(0xAB).to_string(), "000000AB");
        assert_eq!(DeviceId::from_physical(0).to_string(), "00000000");
    }

    #[test]
    fn parses_eight_hex() {
        assert_eq!(
            DeviceId::parse("04A228CD").unwrap(),
            DeviceId::from_physical(0x04A2_28CD)
        );
        // Lowercase is accepted, canonical form stays uppercase.
        assert_eq!(DeviceId::parse("04a228cd").unwrap().to_string(), "04A228CD");
    }

    #[test]
    fn parses_six_hex() {
        assert_eq!(
            DeviceId::parse("A228CD").unwrap(),
            DeviceId::from_physical(0x00A2_28CD)
        );
    }

    #[test]
    fn parses_decimal_before_hex() {
        // "1234" is 1234 decimal, not 0x1234.
        assert_eq!(DeviceId::parse("1234").unwrap(), DeviceId::from_physical(1234));
        assert_eq!(
            DeviceId::parse("77867213").unwrap(),
            DeviceId::from_physical(77_867_213)
        );
    }

    #[test]
    fn parses_0x_prefix() {
        assert_eq!(
            DeviceId::parse("0x04A228CD").unwrap(),
            DeviceId::from_physical(0x04A2_28CD)
        );
        assert_eq!(
            DeviceId::parse("0X1f").unwrap(),
            DeviceId::from_physical(0x1F)
        );
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "  ", "xyz", "0x", "123456789AB", "-1", "04A228CD0", "89:AB"] {
            assert!(DeviceId::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn rejects_decimal_overflow_that_is_not_hex() {
        // Larger than u32 in decimal and 10 digits long, so not hex either.
        assert!(DeviceId::parse("99999999999").is_err());
    }

    #[test]
    fn decimal_overflow_falls_back_to_hex_when_plausible() {
        // 8 digits, > u32 as decimal is impossible here, but "4294967296"
        // (2^32) is 10 digits and rejected; an 8-digit all-digit string that
        // overflows decimal cannot exist, so hex fallback only applies to
        // strings with hex letters.
        assert_eq!(
            DeviceId::parse("99999999").unwrap(),
            DeviceId::from_physical(99_999_999)
        );
    }

    #[test]
    fn serde_round_trips_canonical_string() {
        let id = DeviceId::from_physical(0x04A2_28CD);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"04A228CD\"");
        let back: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn serde_accepts_decimal_input() {
        let back: DeviceId = serde_json::from_str("\"1234\"").unwrap();
        assert_eq!(back, DeviceId::from_physical(1234));
    }
}
