//! MQTT quality-of-service levels.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

use crate::error::CoreError;

/// MQTT delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // MQTT spec names
pub enum QoS {
    /// At most once (fire and forget).
    #[default]
    AtMostOnce = 0,
    /// At least once (acknowledged with PUBACK).
    AtLeastOnce = 1,
    /// Exactly once (PUBREC/PUBREL/PUBCOMP handshake).
    ExactlyOnce = 2,
}

impl QoS {
    /// Upper-case name used in logs and diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            QoS::AtMostOnce => "ZERO",
            QoS::AtLeastOnce => "ONE",
            QoS::ExactlyOnce => "TWO",
        }
    }

    /// Numeric level as sent on the wire.
    pub fn level(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for QoS {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(CoreError::InvalidQos(other)),
        }
    }
}

impl FromStr for QoS {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zero" | "ZERO" | "Zero" | "0" => Ok(QoS::AtMostOnce),
            "one" | "ONE" | "One" | "1" => Ok(QoS::AtLeastOnce),
            "two" | "TWO" | "Two" | "2" => Ok(QoS::ExactlyOnce),
            other => Err(CoreError::InvalidValue {
                what: "qos",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts either an integer level or one of the textual spellings.
impl<'de> Deserialize<'de> for QoS {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Level(u8),
            Name(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Level(level) => QoS::try_from(level).map_err(serde::de::Error::custom),
            Repr::Name(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_from_level() {
        assert_eq!(QoS::try_from(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(QoS::try_from(2).unwrap(), QoS::ExactlyOnce);
        assert_eq!(QoS::try_from(3), Err(CoreError::InvalidQos(3)));
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("Zero".parse::<QoS>().unwrap(), QoS::AtMostOnce);
        assert_eq!("ONE".parse::<QoS>().unwrap(), QoS::AtLeastOnce);
        assert_eq!("2".parse::<QoS>().unwrap(), QoS::ExactlyOnce);
        assert!("three".parse::<QoS>().is_err());
    }

    #[test]
    fn test_deserialize_number_or_name() {
        #[derive(Deserialize)]
        struct Holder {
            qos: QoS,
        }

        let h: Holder = toml::from_str("qos = 1").unwrap();
        assert_eq!(h.qos, QoS::AtLeastOnce);
        let h: Holder = toml::from_str("qos = \"two\"").unwrap();
        assert_eq!(h.qos, QoS::ExactlyOnce);
        assert!(toml::from_str::<Holder>("qos = 7").is_err());
    }

    #[test]
    fn test_ordering_caps_qos() {
        assert_eq!(QoS::ExactlyOnce.min(QoS::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(QoS::AtLeastOnce.as_str(), "ONE");
    }
}
