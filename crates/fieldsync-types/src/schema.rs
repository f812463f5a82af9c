//! Static field schema: every tunable key with its type, valid domain and
//! default value.

use std::fmt;
use std::str::FromStr;

use crate::{ConfigValue, ValidationError, ValidationReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConfigKey {
    HeartbeatInterval,
    CoordinatorTimeout,
    TaskTimeout,
    MaxRetries,
    EnableAutonomousMode,
    EnableTaskExecution,
}

impl ConfigKey {
    pub const ALL: &'static [ConfigKey] = &[
        ConfigKey::HeartbeatInterval,
        ConfigKey::CoordinatorTimeout,
        ConfigKey::TaskTimeout,
        ConfigKey::MaxRetries,
        ConfigKey::EnableAutonomousMode,
        ConfigKey::EnableTaskExecution,
    ];

    /// Wire name of the key.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::HeartbeatInterval => "heartbeatInterval",
            ConfigKey::CoordinatorTimeout => "coordinatorTimeout",
            ConfigKey::TaskTimeout => "taskTimeout",
            ConfigKey::MaxRetries => "maxRetries",
            ConfigKey::EnableAutonomousMode => "enableAutonomousMode",
            ConfigKey::EnableTaskExecution => "enableTaskExecution",
        }
    }

    pub fn spec(&self) -> FieldSpec {
        match self {
            ConfigKey::HeartbeatInterval => FieldSpec::millis(10_000, 600_000, 30_000),
            ConfigKey::CoordinatorTimeout => FieldSpec::millis(60_000, 1_800_000, 300_000),
            ConfigKey::TaskTimeout => FieldSpec::millis(30_000, 1_200_000, 120_000),
            ConfigKey::MaxRetries => FieldSpec {
                kind: ValueKind::Int,
                domain: Domain::IntRange { lo: 0, hi: 10 },
                default: ConfigValue::Int(3),
            },
            ConfigKey::EnableAutonomousMode => FieldSpec::flag(false),
            ConfigKey::EnableTaskExecution => FieldSpec::flag(true),
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKey::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ValidationError::new(s, ValidationReason::UnknownKey))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    UInt,
    Int,
    Bool,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValueKind::UInt => "uint",
            ValueKind::Int => "int",
            ValueKind::Bool => "bool",
        })
    }
}

/// Closed domain of a field. Ranges are inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// Duration in milliseconds; bounds render as `Nmin`, `Ns` or `Nms`.
    MillisRange { lo: u64, hi: u64 },
    IntRange { lo: i64, hi: i64 },
    Flag,
}

impl Domain {
    /// `true` when `value` lies inside the domain. A value of another type
    /// is never inside.
    pub fn contains(&self, value: &ConfigValue) -> bool {
        match (self, value) {
            (Domain::MillisRange { lo, hi }, ConfigValue::UInt(v)) => (*lo..=*hi).contains(v),
            (Domain::IntRange { lo, hi }, ConfigValue::Int(v)) => (*lo..=*hi).contains(v),
            (Domain::Flag, ConfigValue::Bool(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::MillisRange { lo, hi } => {
                write!(f, "{}-{}", human_millis(*lo), human_millis(*hi))
            }
            Domain::IntRange { lo, hi } => write!(f, "{lo}-{hi}"),
            Domain::Flag => f.write_str("true|false"),
        }
    }
}

fn human_millis(ms: u64) -> String {
    if ms != 0 && ms % 60_000 == 0 {
        format!("{}min", ms / 60_000)
    } else if ms != 0 && ms % 1_000 == 0 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{ms}ms")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub kind: ValueKind,
    pub domain: Domain,
    pub default: ConfigValue,
}

impl FieldSpec {
    const fn millis(lo: u64, hi: u64, default: u64) -> Self {
        FieldSpec {
            kind: ValueKind::UInt,
            domain: Domain::MillisRange { lo, hi },
            default: ConfigValue::UInt(default),
        }
    }

    const fn flag(default: bool) -> Self {
        FieldSpec { kind: ValueKind::Bool, domain: Domain::Flag, default: ConfigValue::Bool(default) }
    }

    pub fn admits(&self, value: &ConfigValue) -> bool {
        value.kind() == self.kind && self.domain.contains(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for key in ConfigKey::ALL {
            assert_eq!(key.as_str().parse::<ConfigKey>().unwrap(), *key);
        }
        let err = "heartbeat_interval".parse::<ConfigKey>().unwrap_err();
        assert_eq!(err.reason, ValidationReason::UnknownKey);
    }

    #[test]
    fn millis_bounds_render_in_largest_whole_unit() {
        assert_eq!(ConfigKey::HeartbeatInterval.spec().domain.to_string(), "10s-10min");
        assert_eq!(ConfigKey::CoordinatorTimeout.spec().domain.to_string(), "1min-30min");
        assert_eq!(ConfigKey::TaskTimeout.spec().domain.to_string(), "30s-20min");
        assert_eq!(ConfigKey::MaxRetries.spec().domain.to_string(), "0-10");
        assert_eq!(human_millis(1_500), "1500ms");
    }

    #[test]
    fn domains_are_inclusive() {
        let domain = ConfigKey::HeartbeatInterval.spec().domain;
        assert!(domain.contains(&ConfigValue::UInt(10_000)));
        assert!(domain.contains(&ConfigValue::UInt(600_000)));
        assert!(!domain.contains(&ConfigValue::UInt(9_999)));
        assert!(!domain.contains(&ConfigValue::UInt(600_001)));
    }

    #[test]
    fn flags_only_admit_booleans() {
        let spec = ConfigKey::EnableAutonomousMode.spec();
        assert!(spec.admits(&ConfigValue::Bool(true)));
        assert!(!spec.admits(&ConfigValue::UInt(1)));
        assert!(!spec.admits(&ConfigValue::Int(0)));
    }

    #[test]
    fn key_serializes_as_wire_name() {
        for key in ConfigKey::ALL {
            // serde's camelCase renaming must agree with `as_str`.
            let rendered = format!("{key:?}");
            let mut chars = rendered.chars();
            let first = chars.next().unwrap().to_ascii_lowercase();
            assert_eq!(format!("{first}{}", chars.as_str()), key.as_str());
        }
    }
}
