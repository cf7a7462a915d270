//! JSON bodies exchanged with the broker.
//!
//! Outbound messages share one envelope, `{"id", "version", "params"}`, with
//! every property wrapped as `{"value": ..}`. Encoding is bounded: a body
//! larger than its destination buffer is an error and nothing is sent.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::alert::{AlertNotice, Notice, Severity};
use crate::control::{level_from_int, Control};
use crate::error::{CommandError, EncodeError};
use crate::state::WorkstationStatus;

/// Buffer size for property uploads and alert events.
pub const PROPERTY_CAPACITY: usize = 512;
/// Buffer size for the emergency power-off event.
pub const EMERGENCY_CAPACITY: usize = 256;

const VERSION: &str = "1.0";

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct Envelope<P> {
    id: String,
    version: &'static str,
    params: P,
}

#[derive(Debug, Serialize, PartialEq)]
struct Value<T> {
    value: T,
}

fn v<T>(value: T) -> Value<T> {
    Value { value }
}

fn round_to(value: f32, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (f64::from(value) * factor).round() / factor
}

fn level(on: bool) -> u8 {
    u8::from(on)
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct FullParams {
    current_temperature: Value<f64>,
    flame_scope: Value<f64>,
    heat_scope: Value<f64>,
    light_lux_value: Value<f64>,
    relative_humidity: Value<f64>,
    smoke_scope: Value<f64>,
    light_status: Value<u8>,
    power_status: Value<u8>,
    relay_num1_status: Value<u8>,
    relay_num2_status: Value<u8>,
    #[serde(rename = "username")]
    username: Value<String>,
}

impl From<&WorkstationStatus> for FullParams {
    fn from(s: &WorkstationStatus) -> Self {
        Self {
            current_temperature: v(round_to(s.temperature, 2)),
            flame_scope: v(round_to(s.flame_scope, 1)),
            heat_scope: v(round_to(s.heat_scope, 1)),
            light_lux_value: v(round_to(s.light_intensity, 1)),
            relative_humidity: v(round_to(s.humidity, 1)),
            smoke_scope: v(round_to(s.smoke_scope, 1)),
            light_status: v(level(s.light)),
            power_status: v(level(s.power)),
            relay_num1_status: v(level(s.relay1)),
            relay_num2_status: v(level(s.relay2)),
            username: v(s.cur_username.clone()),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ReducedParams {
    current_temperature: Value<f64>,
    relative_humidity: Value<f64>,
    smoke_scope: Value<f64>,
}

impl From<&WorkstationStatus> for ReducedParams {
    fn from(s: &WorkstationStatus) -> Self {
        Self {
            current_temperature: v(round_to(s.temperature, 2)),
            relative_humidity: v(round_to(s.humidity, 1)),
            smoke_scope: v(round_to(s.smoke_scope, 1)),
        }
    }
}

#[derive(Serialize)]
struct PowerOffBody<'a> {
    reason: &'a str,
    username: &'a str,
}

#[derive(Serialize)]
enum EventParams<'a> {
    AlertEmergency(Value<&'a AlertNotice>),
    AlertWarning(Value<&'a AlertNotice>),
    EmergencyPowerOff(Value<PowerOffBody<'a>>),
}

/// Serialize `body` and refuse it if it exceeds `capacity` bytes.
pub fn encode_bounded<T: Serialize>(body: &T, capacity: usize) -> Result<Vec<u8>, EncodeError> {
    let bytes = serde_json::to_vec(body).map_err(EncodeError::Serialize)?;
    if bytes.len() > capacity {
        return Err(EncodeError::Overflow {
            len: bytes.len(),
            capacity,
        });
    }
    Ok(bytes)
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Stamps each outbound envelope with a process-wide increasing id.
#[derive(Debug, Default)]
pub struct PayloadEncoder {
    next_id: AtomicU64,
}

impl PayloadEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn envelope<P>(&self, params: P) -> Envelope<P> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Envelope {
            id: id.to_string(),
            version: VERSION,
            params,
        }
    }

    pub fn full(&self, status: &WorkstationStatus) -> Result<Vec<u8>, EncodeError> {
        encode_bounded(&self.envelope(FullParams::from(status)), PROPERTY_CAPACITY)
    }

    pub fn reduced(&self, status: &WorkstationStatus) -> Result<Vec<u8>, EncodeError> {
        encode_bounded(&self.envelope(ReducedParams::from(status)), PROPERTY_CAPACITY)
    }

    pub fn notice(&self, notice: &Notice) -> Result<Vec<u8>, EncodeError> {
        match notice {
            Notice::Alert(alert) => {
                let params = match alert.severity {
                    Severity::Emergency => EventParams::AlertEmergency(v(alert)),
                    Severity::Warning => EventParams::AlertWarning(v(alert)),
                };
                encode_bounded(&self.envelope(params), PROPERTY_CAPACITY)
            }
            Notice::EmergencyPowerOff { reason, username } => {
                let params = EventParams::EmergencyPowerOff(v(PowerOffBody { reason, username }));
                encode_bounded(&self.envelope(params), EMERGENCY_CAPACITY)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Remote commands
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RawCommand {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    params: RawParams,
}

#[derive(Default, Deserialize)]
struct RawParams {
    #[serde(rename = "LightStatus")]
    light: Option<i64>,
    #[serde(rename = "PowerStatus")]
    power: Option<i64>,
    #[serde(rename = "RelayNum1Status")]
    relay1: Option<i64>,
    #[serde(rename = "RelayNum2Status")]
    relay2: Option<i64>,
}

/// A validated remote command: every field is known to be 0 or 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand {
    pub id: String,
    /// In application order: light, power, relay 1, relay 2.
    pub changes: Vec<(Control, bool)>,
}

pub fn decode_command(bytes: &[u8]) -> Result<ControlCommand, CommandError> {
    let raw: RawCommand = serde_json::from_slice(bytes).map_err(CommandError::Malformed)?;

    let id = match raw.id {
        Some(serde_json::Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => String::new(),
    };

    let fields = [
        (Control::Light, "LightStatus", raw.params.light),
        (Control::Power, "PowerStatus", raw.params.power),
        (Control::Relay1, "RelayNum1Status", raw.params.relay1),
        (Control::Relay2, "RelayNum2Status", raw.params.relay2),
    ];

    let mut changes = Vec::with_capacity(fields.len());
    for (control, field, value) in fields {
        let Some(value) = value else { continue };
        let on = level_from_int(value).ok_or(CommandError::InvalidValue { field, value })?;
        changes.push((control, on));
    }

    if changes.is_empty() {
        return Err(CommandError::Empty);
    }
    Ok(ControlCommand { id, changes })
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct CommandReply {
    pub id: String,
    pub code: u16,
    pub msg: String,
}

impl CommandReply {
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        encode_bounded(self, PROPERTY_CAPACITY)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
