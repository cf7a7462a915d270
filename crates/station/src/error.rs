//! Typed errors for the control surface, the remote command decoder and the
//! bounded payload encoder.
//!
//! Startup and I/O plumbing use `anyhow`; these enums cover the failures a
//! caller is expected to branch on.

use std::fmt;

use crate::control::Control;

// ---------------------------------------------------------------------------
// Control surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// The requested status was not `0` or `1` (or was missing).
    InvalidStatus(String),
    /// Light and relay requests are refused while the emergency lockout is
    /// latched.
    BlockedByEmergency(Control),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidStatus(raw) => {
                write!(f, "invalid status '{raw}', use 0 (off) or 1 (on)")
            }
            Self::BlockedByEmergency(control) => {
                write!(f, "emergency mode, cannot control {control}")
            }
        }
    }
}

impl std::error::Error for ControlError {}

// ---------------------------------------------------------------------------
// Remote commands
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum CommandError {
    /// Payload is not JSON or does not match the command shape.
    Malformed(serde_json::Error),
    /// A recognised field carried something other than 0 or 1.
    InvalidValue { field: &'static str, value: i64 },
    /// No recognised control field was present.
    Empty,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed command: {e}"),
            Self::InvalidValue { field, value } => {
                write!(f, "{field} must be 0 or 1, got {value}")
            }
            Self::Empty => write!(f, "command carries no control field"),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Malformed(e) => Some(e),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Payload encoding
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum EncodeError {
    Serialize(serde_json::Error),
    /// Encoded payload does not fit the buffer it is destined for.
    Overflow { len: usize, capacity: usize },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialize(e) => write!(f, "payload serialization failed: {e}"),
            Self::Overflow { len, capacity } => {
                write!(f, "payload of {len} bytes exceeds capacity {capacity}")
            }
        }
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Serialize(e) => Some(e),
            Self::Overflow { .. } => None,
        }
    }
}
