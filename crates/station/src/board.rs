//! Output relays and key inputs. The `gpio` feature gates the real rppal
//! driver; without it, mock implementations log state changes.

use anyhow::Result;
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::debug;
#[cfg(feature = "gpio")]
use tracing::warn;
#[cfg(not(feature = "gpio"))]
use tracing::info;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, OutputPin};

use crate::config::{KeyEntry, OutputPins};
use crate::control::Control;
use crate::keys::KeyInput;
use crate::state::Outputs;

fn pin_map(pins: &OutputPins) -> [(Control, u8); 4] {
    [
        (Control::Power, pins.power),
        (Control::Light, pins.light),
        (Control::Relay1, pins.relay1),
        (Control::Relay2, pins.relay2),
    ]
}

// ---------------------------------------------------------------------------
// Real GPIO output board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct OutputBoard {
    pins: HashMap<Control, OutputPin>,
    active_low: bool,
}

#[cfg(feature = "gpio")]
impl OutputBoard {
    pub fn new(config: &OutputPins) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        for (control, pin_num) in pin_map(config) {
            let mut pin = gpio.get(pin_num)?.into_output();
            // Off at startup.
            if config.active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }
            pins.insert(control, pin);
        }

        Ok(Self {
            pins,
            active_low: config.active_low,
        })
    }

    pub fn set(&mut self, control: Control, on: bool) {
        let Some(pin) = self.pins.get_mut(&control) else {
            warn!(%control, "output not wired");
            return;
        };
        // active-low: LOW = ON
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        debug!(%control, on, "output driven");
    }
}

// ---------------------------------------------------------------------------
// Mock output board (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct OutputBoard {
    pub(crate) levels: HashMap<Control, bool>,
}

#[cfg(not(feature = "gpio"))]
impl OutputBoard {
    pub fn new(config: &OutputPins) -> Result<Self> {
        let mut levels = HashMap::new();
        for (control, pin_num) in pin_map(config) {
            debug!(%control, gpio = pin_num, "[mock-gpio] output registered (not wired)");
            levels.insert(control, false);
        }
        info!("[mock-gpio] output board initialised (no hardware)");
        Ok(Self { levels })
    }

    pub fn set(&mut self, control: Control, on: bool) {
        if let Some(level) = self.levels.get_mut(&control) {
            if *level != on {
                info!(%control, on, "[mock-gpio] output set");
            }
            *level = on;
        }
    }
}

impl OutputBoard {
    pub fn apply(&mut self, outputs: Outputs) {
        for control in Control::ALL {
            self.set(control, outputs.level(control));
        }
    }
}

/// Mirror the store's output levels onto the board until the store is gone.
pub async fn run_output_driver(mut board: OutputBoard, mut rx: watch::Receiver<Outputs>) {
    loop {
        let outputs = *rx.borrow_and_update();
        board.apply(outputs);
        debug!(any_on = outputs.any_on(), "outputs applied");
        if rx.changed().await.is_err() {
            debug!("output channel closed");
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Key inputs
// ---------------------------------------------------------------------------

/// Key lines with pull-ups; an unwired key reads high (released).
#[cfg(feature = "gpio")]
pub struct KeyPins {
    pins: HashMap<u8, InputPin>,
}

#[cfg(feature = "gpio")]
impl KeyPins {
    pub fn new(keys: &[KeyEntry]) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();
        for key in keys {
            pins.insert(key.id, gpio.get(key.gpio)?.into_input_pullup());
        }
        Ok(Self { pins })
    }
}

#[cfg(feature = "gpio")]
impl KeyInput for KeyPins {
    fn level(&mut self, key: u8) -> bool {
        self.pins.get(&key).map_or(true, |pin| pin.is_high())
    }
}

#[cfg(not(feature = "gpio"))]
pub struct KeyPins {
    pub(crate) levels: HashMap<u8, bool>,
}

#[cfg(not(feature = "gpio"))]
impl KeyPins {
    pub fn new(keys: &[KeyEntry]) -> Result<Self> {
        let levels = keys
            .iter()
            .inspect(|k| debug!(key = k.id, gpio = k.gpio, "[mock-gpio] key registered (not wired)"))
            .map(|k| (k.id, true))
            .collect();
        Ok(Self { levels })
    }
}

#[cfg(not(feature = "gpio"))]
impl KeyInput for KeyPins {
    fn level(&mut self, key: u8) -> bool {
        self.levels.get(&key).copied().unwrap_or(true)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
