//! Simulated workstation environment for development without sensors.
//!
//! Each channel is a mean-reverting random walk toward the scenario's target,
//! so readings drift coherently instead of jumping between samples. Scenarios
//! that breach thresholds start from calm values and ramp toward them.

use std::fmt;

use crate::state::{AnalogChannel, Diagnostics, SensorSnapshot};

/// Full-scale count of the 12-bit converter the diagnostics mimic.
const ADC_FULL_SCALE: f64 = 4095.0;
const ADC_VREF: f64 = 3.3;

/// Produces one calibrated snapshot per sampling tick.
pub trait SensorSource: Send {
    fn sample(&mut self) -> SensorSnapshot;
}

// ---------------------------------------------------------------------------
// Gaussian approximation
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Office conditions. No rule should fire.
    Calm,
    /// Smoke hovering around the warning threshold; drives the fan relay.
    Smoky,
    /// Flame, heat and temperature climb until the lockout latches.
    Fire,
    /// Cold, dry and dim: low-temperature and low-humidity warnings.
    Cold,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "smoky" => Self::Smoky,
            "fire" => Self::Fire,
            "cold" => Self::Cold,
            _ => Self::Calm, // default
        }
    }

    /// (temperature, humidity, flame, smoke, heat, light) targets.
    fn targets(self) -> [f64; 6] {
        match self {
            Self::Calm => [24.0, 45.0, 2.0, 5.0, 20.0, 60.0],
            Self::Smoky => [26.0, 50.0, 5.0, 90.0, 30.0, 55.0],
            Self::Fire => [58.0, 30.0, 90.0, 80.0, 88.0, 85.0],
            Self::Cold => [7.0, 15.0, 1.0, 3.0, 5.0, 20.0],
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Calm => write!(f, "calm"),
            Self::Smoky => write!(f, "smoky"),
            Self::Fire => write!(f, "fire"),
            Self::Cold => write!(f, "cold"),
        }
    }
}

// ---------------------------------------------------------------------------
// Channel walk
// ---------------------------------------------------------------------------

struct Channel {
    value: f64,
    target: f64,
    walk_sigma: f64,
    reversion: f64,
    min: f64,
    max: f64,
}

impl Channel {
    fn step(&mut self) -> f32 {
        let pull = self.reversion * (self.target - self.value);
        let walk = gaussian(0.0, self.walk_sigma);
        self.value = (self.value + pull + walk).clamp(self.min, self.max);
        self.value as f32
    }
}

/// Raw count and pin voltage for a percentage-scaled analog channel.
fn analog(percent: f32) -> AnalogChannel {
    let frac = (f64::from(percent) / 100.0).clamp(0.0, 1.0);
    let raw = (frac * ADC_FULL_SCALE).round();
    AnalogChannel {
        raw: raw as i32,
        voltage: (raw / ADC_FULL_SCALE * ADC_VREF) as f32,
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct EnvironmentSim {
    temperature: Channel,
    humidity: Channel,
    flame: Channel,
    smoke: Channel,
    heat: Channel,
    light: Channel,
    presence_prob: f32,
}

impl EnvironmentSim {
    pub fn new(scenario: Scenario) -> Self {
        let calm = Scenario::Calm.targets();
        let target = scenario.targets();
        let pct = |i: usize, sigma: f64| Channel {
            value: calm[i],
            target: target[i],
            walk_sigma: sigma,
            reversion: 0.15,
            min: 0.0,
            max: 100.0,
        };

        Self {
            temperature: Channel {
                min: -20.0,
                max: 85.0,
                ..pct(0, 0.3)
            },
            humidity: pct(1, 1.0),
            flame: pct(2, 1.5),
            smoke: pct(3, 1.5),
            heat: pct(4, 1.0),
            light: pct(5, 2.0),
            presence_prob: 0.8,
        }
    }
}

impl SensorSource for EnvironmentSim {
    fn sample(&mut self) -> SensorSnapshot {
        let flame_scope = self.flame.step();
        let smoke_scope = self.smoke.step();
        let heat_scope = self.heat.step();
        let light_intensity = self.light.step();

        SensorSnapshot {
            temperature: self.temperature.step(),
            humidity: self.humidity.step(),
            flame_scope,
            smoke_scope,
            heat_scope,
            light_intensity,
            human_presence: fastrand::f32() < self.presence_prob,
            diagnostics: Diagnostics {
                heat: analog(heat_scope),
                light: analog(light_intensity),
                flame: analog(flame_scope),
                smoke: analog(smoke_scope),
            },
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AnomalyDetector;
    use crate::config::Config;
    use crate::state::WorkstationStatus;

    fn settle(sim: &mut EnvironmentSim, n: usize) -> SensorSnapshot {
        let mut last = sim.sample();
        for _ in 1..n {
            last = sim.sample();
        }
        last
    }

    #[test]
    fn percent_channels_stay_in_range() {
        for scenario in [Scenario::Calm, Scenario::Smoky, Scenario::Fire, Scenario::Cold] {
            let mut sim = EnvironmentSim::new(scenario);
            for _ in 0..300 {
                let s = sim.sample();
                for v in [s.humidity, s.flame_scope, s.smoke_scope, s.heat_scope, s.light_intensity] {
                    assert!((0.0..=100.0).contains(&v), "{scenario}: {v} out of range");
                }
            }
        }
    }

    #[test]
    fn fire_scenario_eventually_trips_emergency() {
        let detector = AnomalyDetector::from_config(&Config::default());
        let mut sim = EnvironmentSim::new(Scenario::Fire);
        let s = settle(&mut sim, 100);
        let status = WorkstationStatus {
            temperature: s.temperature,
            humidity: s.humidity,
            flame_scope: s.flame_scope,
            smoke_scope: s.smoke_scope,
            heat_scope: s.heat_scope,
            ..WorkstationStatus::default()
        };
        assert!(detector.evaluate(&status).alert().is_emergency());
    }

    #[test]
    fn calm_scenario_stays_quiet() {
        let detector = AnomalyDetector::from_config(&Config::default());
        let mut sim = EnvironmentSim::new(Scenario::Calm);
        for _ in 0..100 {
            let s = sim.sample();
            let status = WorkstationStatus {
                temperature: s.temperature,
                humidity: s.humidity,
                flame_scope: s.flame_scope,
                smoke_scope: s.smoke_scope,
                heat_scope: s.heat_scope,
                ..WorkstationStatus::default()
            };
            assert!(!detector.evaluate(&status).alert().is_emergency());
        }
    }

    #[test]
    fn diagnostics_follow_percentages() {
        assert_eq!(analog(0.0), AnalogChannel { raw: 0, voltage: 0.0 });
        let full = analog(100.0);
        assert_eq!(full.raw, 4095);
        assert!((full.voltage - 3.3).abs() < 1e-5);
        assert_eq!(analog(150.0).raw, 4095);
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("calm"), Scenario::Calm);
        assert_eq!(Scenario::from_str_lossy("SMOKY"), Scenario::Smoky);
        assert_eq!(Scenario::from_str_lossy("Fire"), Scenario::Fire);
        assert_eq!(Scenario::from_str_lossy("cold"), Scenario::Cold);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Calm);
    }

    #[test]
    fn scenario_display() {
        assert_eq!(Scenario::Smoky.to_string(), "smoky");
        assert_eq!(Scenario::Cold.to_string(), "cold");
    }
}
