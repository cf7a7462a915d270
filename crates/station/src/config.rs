//! TOML config file loading and validation for thresholds, timing, MQTT
//! topics and pin assignments.
//!
//! Every section carries the reference defaults, so an empty (or missing)
//! file yields a runnable configuration.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// When false, emergency-band alerts are reported but never latch the
    /// lockout. Bench use only.
    pub auto_power_off: bool,
    pub thresholds: Thresholds,
    pub auto_control: AutoControl,
    pub timing: Timing,
    pub mqtt: MqttSettings,
    pub outputs: OutputPins,
    pub keys: Vec<KeyEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub emergency: EmergencyThresholds,
    pub warning: WarningThresholds,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmergencyThresholds {
    pub flame: f32,
    pub smoke: f32,
    pub temperature: f32,
    pub heat: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WarningThresholds {
    pub flame: f32,
    pub smoke: f32,
    pub temperature_high: f32,
    pub temperature_low: f32,
    pub humidity_high: f32,
    pub humidity_low: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoControl {
    /// Light turns on while `light_intensity` is below this.
    pub light_on_below: f32,
    /// Relay 1 (extraction fan) turns on while `smoke_scope` is above this.
    pub relay1_on_above: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub sample_period_ms: u64,
    pub key_tick_ms: u64,
    pub debounce_ticks: u16,
    pub long_press_ticks: u16,
    pub full_upload_every: u32,
    pub reduced_upload_every: u32,
    pub display_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub client_id: String,
    pub topic_prefix: String,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputPins {
    pub power: u8,
    pub light: u8,
    pub relay1: u8,
    pub relay2: u8,
    /// Many relay boards are active-low.
    pub active_low: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyEntry {
    pub id: u8,
    pub gpio: u8,
    /// Whether recognised events are queued for the key-action task.
    #[serde(default)]
    pub deliver: bool,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_power_off: true,
            thresholds: Thresholds::default(),
            auto_control: AutoControl::default(),
            timing: Timing::default(),
            mqtt: MqttSettings::default(),
            outputs: OutputPins::default(),
            keys: default_keys(),
        }
    }
}

impl Default for EmergencyThresholds {
    fn default() -> Self {
        Self {
            flame: 70.0,
            smoke: 95.0,
            temperature: 50.0,
            heat: 80.0,
        }
    }
}

impl Default for WarningThresholds {
    fn default() -> Self {
        Self {
            flame: 70.0,
            smoke: 90.0,
            temperature_high: 35.0,
            temperature_low: 10.0,
            humidity_high: 65.0,
            humidity_low: 20.0,
        }
    }
}

impl Default for AutoControl {
    fn default() -> Self {
        Self {
            light_on_below: 30.0,
            relay1_on_above: 50.0,
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            sample_period_ms: 5_000,
            key_tick_ms: 10,
            debounce_ticks: 2,
            long_press_ticks: 50,
            full_upload_every: 12,
            reduced_upload_every: 6,
            display_timeout_ms: 100,
        }
    }
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            client_id: "workstation-station".to_string(),
            topic_prefix: "station/ws-01".to_string(),
            keep_alive_secs: 10,
            username: None,
            password: None,
        }
    }
}

impl Default for OutputPins {
    fn default() -> Self {
        Self {
            power: 5,
            light: 6,
            relay1: 13,
            relay2: 19,
            active_low: false,
        }
    }
}

/// Four keys; 3 and 4 are wired but reserved, so their events are not queued.
fn default_keys() -> Vec<KeyEntry> {
    vec![
        KeyEntry { id: 1, gpio: 21, deliver: true },
        KeyEntry { id: 2, gpio: 22, deliver: true },
        KeyEntry { id: 3, gpio: 23, deliver: false },
        KeyEntry { id: 4, gpio: 25, deliver: false },
    ]
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_thresholds(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_mqtt(&mut errors);
        self.validate_pins(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_thresholds(&self, errors: &mut Vec<String>) {
        let e = &self.thresholds.emergency;
        let w = &self.thresholds.warning;
        let a = &self.auto_control;

        let percentages = [
            ("thresholds.emergency.flame", e.flame),
            ("thresholds.emergency.smoke", e.smoke),
            ("thresholds.emergency.heat", e.heat),
            ("thresholds.warning.flame", w.flame),
            ("thresholds.warning.smoke", w.smoke),
            ("thresholds.warning.humidity_high", w.humidity_high),
            ("thresholds.warning.humidity_low", w.humidity_low),
            ("auto_control.light_on_below", a.light_on_below),
            ("auto_control.relay1_on_above", a.relay1_on_above),
        ];
        for (name, value) in percentages {
            if !(0.0..=100.0).contains(&value) {
                errors.push(format!("{name} {value} out of range [0, 100]"));
            }
        }

        if w.temperature_low >= w.temperature_high {
            errors.push(format!(
                "thresholds.warning: temperature_low ({}) must be below temperature_high ({})",
                w.temperature_low, w.temperature_high
            ));
        }
        if w.humidity_low >= w.humidity_high {
            errors.push(format!(
                "thresholds.warning: humidity_low ({}) must be below humidity_high ({})",
                w.humidity_low, w.humidity_high
            ));
        }
        if w.temperature_high > e.temperature {
            errors.push(format!(
                "thresholds: warning temperature_high ({}) exceeds emergency temperature ({})",
                w.temperature_high, e.temperature
            ));
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let t = &self.timing;

        let positives = [
            ("sample_period_ms", t.sample_period_ms),
            ("key_tick_ms", t.key_tick_ms),
            ("display_timeout_ms", t.display_timeout_ms),
            ("debounce_ticks", u64::from(t.debounce_ticks)),
            ("long_press_ticks", u64::from(t.long_press_ticks)),
            ("full_upload_every", u64::from(t.full_upload_every)),
            ("reduced_upload_every", u64::from(t.reduced_upload_every)),
        ];
        for (name, value) in positives {
            if value == 0 {
                errors.push(format!("timing.{name} must be positive, got 0"));
            }
        }

        if t.long_press_ticks <= t.debounce_ticks {
            errors.push(format!(
                "timing: long_press_ticks ({}) must exceed debounce_ticks ({})",
                t.long_press_ticks, t.debounce_ticks
            ));
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        if self.mqtt.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".to_string());
        }
        let prefix = self.mqtt.topic_prefix.trim();
        if prefix.is_empty() {
            errors.push("mqtt.topic_prefix is empty".to_string());
        } else if prefix.contains(['+', '#']) || prefix.ends_with('/') {
            errors.push(format!(
                "mqtt.topic_prefix '{prefix}' must not contain wildcards or a trailing '/'"
            ));
        }
    }

    fn validate_pins(&self, errors: &mut Vec<String>) {
        let mut seen_pins: HashSet<u8> = HashSet::new();
        let mut seen_ids: HashSet<u8> = HashSet::new();

        let o = &self.outputs;
        let outputs = [
            ("outputs.power", o.power),
            ("outputs.light", o.light),
            ("outputs.relay1", o.relay1),
            ("outputs.relay2", o.relay2),
        ];
        for (name, pin) in outputs {
            check_pin(name, pin, &mut seen_pins, errors);
        }

        if self.keys.is_empty() {
            errors.push("keys: at least one key must be configured".to_string());
        }
        for (i, k) in self.keys.iter().enumerate() {
            let ctx = format!("keys[{i}] (id {})", k.id);
            if k.id == 0 {
                errors.push(format!("{ctx}: id must be positive"));
            } else if !seen_ids.insert(k.id) {
                errors.push(format!("{ctx}: duplicate key id"));
            }
            check_pin(&ctx, k.gpio, &mut seen_pins, errors);
        }
    }
}

fn check_pin(ctx: &str, pin: u8, seen: &mut HashSet<u8>, errors: &mut Vec<String>) {
    if !VALID_GPIO_PINS.contains(&pin) {
        errors.push(format!(
            "{ctx}: gpio {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
        ));
    } else if !seen.insert(pin) {
        errors.push(format!("{ctx}: gpio {pin} is already in use"));
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file is not an
/// error: the reference defaults are used instead.
pub fn load(path: &str) -> Result<Config> {
    let config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "config file not found, using defaults");
        Config::default()
    };
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
