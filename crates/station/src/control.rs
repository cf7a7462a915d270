//! The four switched outputs as a closed set, and the `0`/`1` status parsing
//! shared by the HTTP and MQTT surfaces.

use serde::Serialize;
use std::fmt;

use crate::error::ControlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Control {
    Power,
    Light,
    Relay1,
    Relay2,
}

impl Control {
    pub const ALL: [Control; 4] = [Self::Power, Self::Light, Self::Relay1, Self::Relay2];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Power => "power",
            Self::Light => "light",
            Self::Relay1 => "relay1",
            Self::Relay2 => "relay2",
        }
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts exactly `"0"` or `"1"`, surrounding whitespace ignored.
pub fn parse_status(raw: &str) -> Result<bool, ControlError> {
    match raw.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err(ControlError::InvalidStatus(raw.to_string())),
    }
}

/// Maps an integer command value to a level; anything but 0 or 1 is `None`.
pub fn level_from_int(value: i64) -> Option<bool> {
    match value {
        1 => Some(true),
        0 => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binary_status() {
        assert_eq!(parse_status("1"), Ok(true));
        assert_eq!(parse_status("0"), Ok(false));
        assert_eq!(parse_status(" 1\n"), Ok(true));
    }

    #[test]
    fn rejects_everything_else() {
        for raw in ["", "2", "on", "true", "-1", "01"] {
            assert_eq!(
                parse_status(raw),
                Err(ControlError::InvalidStatus(raw.to_string())),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn int_levels() {
        assert_eq!(level_from_int(1), Some(true));
        assert_eq!(level_from_int(0), Some(false));
        assert_eq!(level_from_int(2), None);
        assert_eq!(level_from_int(-1), None);
    }

    #[test]
    fn display_is_lowercase_name() {
        let names: Vec<String> = Control::ALL.iter().map(|c| c.to_string()).collect();
        assert_eq!(names, ["power", "light", "relay1", "relay2"]);
    }
}
