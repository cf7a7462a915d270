//! Threshold rules over the sensor record, evaluated in a fixed order.
//!
//! The emergency band stops at the first breach; the warning band reports
//! every match. Both bands are plain rule lists run by the same evaluator, so
//! adding a sensor is one more `Rule` entry.

use serde::Serialize;

use crate::config::Config;
use crate::state::WorkstationStatus;

// ---------------------------------------------------------------------------
// Alert classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    None,
    FireEmergency,
    SmokeEmergency,
    TempEmergency,
    HeatEmergency,
    FireWarning,
    SmokeWarning,
    TempHighWarning,
    TempLowWarning,
    HumidityHighWarning,
    HumidityLowWarning,
}

impl AlertType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::FireEmergency => "FIRE_EMERGENCY",
            Self::SmokeEmergency => "SMOKE_EMERGENCY",
            Self::TempEmergency => "TEMP_EMERGENCY",
            Self::HeatEmergency => "HEAT_EMERGENCY",
            Self::FireWarning => "FIRE_WARNING",
            Self::SmokeWarning => "SMOKE_WARNING",
            Self::TempHighWarning => "TEMP_HIGH_WARNING",
            Self::TempLowWarning => "TEMP_LOW_WARNING",
            Self::HumidityHighWarning => "HUMIDITY_HIGH_WARNING",
            Self::HumidityLowWarning => "HUMIDITY_LOW_WARNING",
        }
    }

    pub fn is_emergency(self) -> bool {
        matches!(
            self,
            Self::FireEmergency | Self::SmokeEmergency | Self::TempEmergency | Self::HeatEmergency
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Emergency,
    Warning,
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensor {
    Flame,
    Smoke,
    Temperature,
    Heat,
    Humidity,
}

impl Sensor {
    pub fn read(self, status: &WorkstationStatus) -> f32 {
        match self {
            Self::Flame => status.flame_scope,
            Self::Smoke => status.smoke_scope,
            Self::Temperature => status.temperature,
            Self::Heat => status.heat_scope,
            Self::Humidity => status.humidity,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Flame => "Fire",
            Self::Smoke => "Smoke",
            Self::Temperature => "Temperature",
            Self::Heat => "Heat",
            Self::Humidity => "Humidity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Check {
    /// Strictly greater than the threshold.
    Above(f32),
    /// Strictly between zero and the threshold. Zero and the `-1` unsampled
    /// marker never match.
    BelowPositive(f32),
}

impl Check {
    fn matches(self, value: f32) -> bool {
        match self {
            Self::Above(t) => value > t,
            Self::BelowPositive(t) => value > 0.0 && value < t,
        }
    }

    fn threshold(self) -> f32 {
        match self {
            Self::Above(t) | Self::BelowPositive(t) => t,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rule {
    pub alert: AlertType,
    pub sensor: Sensor,
    pub check: Check,
}

impl Rule {
    const fn new(alert: AlertType, sensor: Sensor, check: Check) -> Self {
        Self { alert, sensor, check }
    }

    fn fire(&self, status: &WorkstationStatus) -> Option<Trigger> {
        let value = self.sensor.read(status);
        self.check.matches(value).then(|| Trigger {
            alert: self.alert,
            sensor: self.sensor,
            value,
            threshold: self.check.threshold(),
        })
    }
}

/// A rule that matched, with the reading that tripped it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trigger {
    pub alert: AlertType,
    pub sensor: Sensor,
    pub value: f32,
    pub threshold: f32,
}

impl Trigger {
    /// Human-readable lockout reason, e.g.
    /// `Fire emergency: 75.0% (threshold: 70.0%)`.
    pub fn reason(&self) -> String {
        let label = self.sensor.label();
        match self.sensor {
            Sensor::Temperature => format!(
                "{label} emergency: {:.2} C (threshold: {:.1} C)",
                self.value, self.threshold
            ),
            _ => format!(
                "{label} emergency: {:.1}% (threshold: {:.1}%)",
                self.value, self.threshold
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Verdict {
    pub emergency: Option<Trigger>,
    pub warnings: Vec<Trigger>,
}

impl Verdict {
    /// The alert a caller sees: the emergency if any, otherwise the first
    /// warning in evaluation order.
    pub fn alert(&self) -> AlertType {
        self.emergency
            .as_ref()
            .or_else(|| self.warnings.first())
            .map_or(AlertType::None, |t| t.alert)
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    emergency: Vec<Rule>,
    warning: Vec<Rule>,
    auto_power_off: bool,
}

impl AnomalyDetector {
    pub fn from_config(config: &Config) -> Self {
        let e = &config.thresholds.emergency;
        let w = &config.thresholds.warning;

        let emergency = vec![
            Rule::new(AlertType::FireEmergency, Sensor::Flame, Check::Above(e.flame)),
            Rule::new(AlertType::SmokeEmergency, Sensor::Smoke, Check::Above(e.smoke)),
            Rule::new(AlertType::TempEmergency, Sensor::Temperature, Check::Above(e.temperature)),
            Rule::new(AlertType::HeatEmergency, Sensor::Heat, Check::Above(e.heat)),
        ];

        let warning = vec![
            Rule::new(AlertType::FireWarning, Sensor::Flame, Check::Above(w.flame)),
            Rule::new(AlertType::SmokeWarning, Sensor::Smoke, Check::Above(w.smoke)),
            Rule::new(
                AlertType::TempHighWarning,
                Sensor::Temperature,
                Check::Above(w.temperature_high),
            ),
            Rule::new(
                AlertType::TempLowWarning,
                Sensor::Temperature,
                Check::BelowPositive(w.temperature_low),
            ),
            Rule::new(
                AlertType::HumidityHighWarning,
                Sensor::Humidity,
                Check::Above(w.humidity_high),
            ),
            Rule::new(
                AlertType::HumidityLowWarning,
                Sensor::Humidity,
                Check::BelowPositive(w.humidity_low),
            ),
        ];

        Self {
            emergency,
            warning,
            auto_power_off: config.auto_power_off,
        }
    }

    pub fn auto_power_off(&self) -> bool {
        self.auto_power_off
    }

    /// Pure evaluation. Warnings are only collected when no emergency rule
    /// matched.
    pub fn evaluate(&self, status: &WorkstationStatus) -> Verdict {
        if let Some(trigger) = first_match(&self.emergency, status) {
            return Verdict {
                emergency: Some(trigger),
                warnings: Vec::new(),
            };
        }
        Verdict {
            emergency: None,
            warnings: all_matches(&self.warning, status),
        }
    }
}

fn first_match(rules: &[Rule], status: &WorkstationStatus) -> Option<Trigger> {
    rules.iter().find_map(|r| r.fire(status))
}

fn all_matches(rules: &[Rule], status: &WorkstationStatus) -> Vec<Trigger> {
    rules.iter().filter_map(|r| r.fire(status)).collect()
}

// ---------------------------------------------------------------------------
// Outbound notices
// ---------------------------------------------------------------------------

/// Alert body with the environment at the moment of detection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertNotice {
    pub alert_type: AlertType,
    pub severity: Severity,
    pub sensor_value: f32,
    pub threshold: f32,
    pub username: String,
    pub temperature: f32,
    pub humidity: f32,
    pub flame_scope: f32,
    pub smoke_scope: f32,
}

impl AlertNotice {
    pub fn new(trigger: &Trigger, severity: Severity, status: &WorkstationStatus) -> Self {
        Self {
            alert_type: trigger.alert,
            severity,
            sensor_value: trigger.value,
            threshold: trigger.threshold,
            username: status.cur_username.clone(),
            temperature: status.temperature,
            humidity: status.humidity,
            flame_scope: status.flame_scope,
            smoke_scope: status.smoke_scope,
        }
    }
}

/// Events produced by the store for the uplink.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Alert(AlertNotice),
    EmergencyPowerOff { reason: String, username: String },
}

/// Result of one detector pass applied to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub alert: AlertType,
    /// Ready to publish, in order. Empty when the uplink was down.
    pub notices: Vec<Notice>,
    /// True when this pass latched the emergency lockout.
    pub locked_out: bool,
}

impl Detection {
    pub fn none() -> Self {
        Self {
            alert: AlertType::None,
            notices: Vec::new(),
            locked_out: false,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
