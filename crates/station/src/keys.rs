//! Local key recognition: debounce, short press and long press.
//!
//! Each key runs a four-state machine sampled once per tick. The transition
//! table lives in [`transition`] as a pure function; `KeyContext::step`
//! applies its counter and latch effects. Recognised presses go to an injected
//! [`KeyEventHandler`], which by default queues them for the key-action task.

use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{KeyEntry, Timing};
use crate::control::Control;
use crate::state::StateStore;

// ---------------------------------------------------------------------------
// Per-key state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyState {
    #[default]
    Idle,
    Debounce,
    Pressed,
    LongActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressKind {
    Short,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPress {
    pub key: u8,
    pub kind: PressKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyTiming {
    pub debounce_ticks: u16,
    pub long_press_ticks: u16,
}

impl From<&Timing> for KeyTiming {
    fn from(t: &Timing) -> Self {
        Self {
            debounce_ticks: t.debounce_ticks,
            long_press_ticks: t.long_press_ticks,
        }
    }
}

/// Counter and latch side effect of one table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Effect {
    Keep,
    Reset,
    ResetClearLatch,
    ClearLatch,
    /// Entering long-press: emit `Long` unless already latched, then latch.
    LatchLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Step {
    next: KeyState,
    effect: Effect,
    short: bool,
}

const fn step(next: KeyState, effect: Effect) -> Step {
    Step { next, effect, short: false }
}

fn transition(state: KeyState, pressed: bool, ticks: u16, timing: &KeyTiming) -> Step {
    use KeyState::*;

    match (state, pressed) {
        (Idle, true) => step(Debounce, Effect::ResetClearLatch),
        (Idle, false) => step(Idle, Effect::Reset),

        (Debounce, true) if ticks >= timing.debounce_ticks => step(Pressed, Effect::ResetClearLatch),
        (Debounce, true) => step(Debounce, Effect::Keep),
        // Released before debounce completed: noise.
        (Debounce, false) => step(Idle, Effect::Reset),

        (Pressed, false) => Step { next: Idle, effect: Effect::Reset, short: true },
        (Pressed, true) if ticks >= timing.long_press_ticks => step(LongActive, Effect::LatchLong),
        (Pressed, true) => step(Pressed, Effect::Keep),

        (LongActive, false) => step(Idle, Effect::ClearLatch),
        (LongActive, true) => step(LongActive, Effect::Reset),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyContext {
    pub state: KeyState,
    pub is_pressed: bool,
    pub state_duration_ticks: u16,
    pub long_press_latched: bool,
}

impl KeyContext {
    /// Advance one tick with the current (already active-low decoded) level.
    pub fn step(&mut self, pressed: bool, timing: &KeyTiming) -> Option<PressKind> {
        self.is_pressed = pressed;
        let row = transition(self.state, pressed, self.state_duration_ticks, timing);

        let mut event = row.short.then_some(PressKind::Short);
        match row.effect {
            Effect::Keep => {}
            Effect::Reset => self.state_duration_ticks = 0,
            Effect::ResetClearLatch => {
                self.state_duration_ticks = 0;
                self.long_press_latched = false;
            }
            Effect::ClearLatch => self.long_press_latched = false,
            Effect::LatchLong => {
                if !self.long_press_latched {
                    event = Some(PressKind::Long);
                }
                self.long_press_latched = true;
            }
        }

        self.state = row.next;
        self.state_duration_ticks = self.state_duration_ticks.saturating_add(1);
        event
    }
}

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Raw key levels. Keys are active-low: `false` (logic 0) means pressed.
pub trait KeyInput: Send {
    fn level(&mut self, key: u8) -> bool;
}

pub trait KeyEventHandler: Send {
    fn on_press(&self, press: KeyPress);
}

/// Queues presses of delivering keys without blocking the tick.
pub struct QueueHandler {
    tx: mpsc::Sender<KeyPress>,
    deliver: HashSet<u8>,
}

impl QueueHandler {
    pub fn new(tx: mpsc::Sender<KeyPress>, keys: &[KeyEntry]) -> Self {
        let deliver = keys.iter().filter(|k| k.deliver).map(|k| k.id).collect();
        Self { tx, deliver }
    }
}

impl KeyEventHandler for QueueHandler {
    fn on_press(&self, press: KeyPress) {
        if !self.deliver.contains(&press.key) {
            debug!(key = press.key, kind = ?press.kind, "key not delivered");
            return;
        }
        if let Err(e) = self.tx.try_send(press) {
            debug!(key = press.key, kind = ?press.kind, error = %e, "key queue full, press dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// Recognizer
// ---------------------------------------------------------------------------

pub struct KeyRecognizer<I, H> {
    keys: Vec<(u8, KeyContext)>,
    timing: KeyTiming,
    input: I,
    handler: H,
}

impl<I: KeyInput, H: KeyEventHandler> KeyRecognizer<I, H> {
    pub fn new(key_ids: impl IntoIterator<Item = u8>, timing: KeyTiming, input: I, handler: H) -> Self {
        let keys = key_ids.into_iter().map(|id| (id, KeyContext::default())).collect();
        Self { keys, timing, input, handler }
    }

    /// Sample every key once and dispatch whatever completed on this tick.
    pub fn tick(&mut self) {
        for (id, ctx) in &mut self.keys {
            let pressed = !self.input.level(*id);
            if let Some(kind) = ctx.step(pressed, &self.timing) {
                debug!(key = *id, ?kind, "key press recognised");
                self.handler.on_press(KeyPress { key: *id, kind });
            }
        }
    }

    #[cfg(test)]
    pub fn context(&self, key: u8) -> Option<&KeyContext> {
        self.keys.iter().find(|(id, _)| *id == key).map(|(_, ctx)| ctx)
    }
}

/// Drive the recognizer from a fixed-period interval. Never returns.
pub async fn run_recognizer<I, H>(mut recognizer: KeyRecognizer<I, H>, period: Duration)
where
    I: KeyInput + 'static,
    H: KeyEventHandler + 'static,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        recognizer.tick();
    }
}

// ---------------------------------------------------------------------------
// Key actions
// ---------------------------------------------------------------------------

/// Which output a press toggles. Keys without a mapping are ignored.
pub fn action_for(press: KeyPress) -> Option<Control> {
    match (press.key, press.kind) {
        (1, PressKind::Short) => Some(Control::Light),
        (1, PressKind::Long) => Some(Control::Power),
        (2, PressKind::Short) => Some(Control::Relay1),
        (2, PressKind::Long) => Some(Control::Relay2),
        _ => None,
    }
}

/// Toggle the mapped output through the normal control surface.
pub async fn handle_press(store: &StateStore, press: KeyPress) {
    let Some(control) = action_for(press) else {
        debug!(key = press.key, kind = ?press.kind, "no action mapped");
        return;
    };

    match store.toggle(control).await {
        Ok(on) => info!(key = press.key, %control, on, "key toggled output"),
        Err(e) => warn!(key = press.key, %control, error = %e, "key action rejected"),
    }
}

pub async fn run_actions(store: StateStore, mut rx: mpsc::Receiver<KeyPress>) {
    while let Some(press) = rx.recv().await {
        handle_press(&store, press).await;
    }
    debug!("key queue closed");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    const TIMING: KeyTiming = KeyTiming {
        debounce_ticks: 2,
        long_press_ticks: 50,
    };

    /// Feed `levels` (true = pressed) and collect the events.
    fn run(levels: impl IntoIterator<Item = bool>) -> (KeyContext, Vec<PressKind>) {
        let mut ctx = KeyContext::default();
        let events = levels
            .into_iter()
            .filter_map(|p| ctx.step(p, &TIMING))
            .collect();
        (ctx, events)
    }

    fn held(n: usize) -> impl Iterator<Item = bool> {
        std::iter::repeat(true).take(n)
    }

    fn released(n: usize) -> impl Iterator<Item = bool> {
        std::iter::repeat(false).take(n)
    }

    // -- State machine --------------------------------------------------------

    #[test]
    fn bounce_shorter_than_debounce_is_noise() {
        let (ctx, events) = run([true, true, false, true, false]);
        assert!(events.is_empty());
        assert_eq!(ctx.state, KeyState::Idle);
    }

    #[test]
    fn three_pressed_samples_reach_pressed() {
        let (ctx, _) = run(held(2));
        assert_eq!(ctx.state, KeyState::Debounce);
        let (ctx, _) = run(held(3));
        assert_eq!(ctx.state, KeyState::Pressed);
    }

    #[test]
    fn short_press_emits_on_release() {
        let (ctx, events) = run(held(10).chain(released(1)));
        assert_eq!(events, [PressKind::Short]);
        assert_eq!(ctx.state, KeyState::Idle);
    }

    #[test]
    fn long_press_fires_once_and_no_short_on_release() {
        let (ctx, events) = run(held(300).chain(released(3)));
        assert_eq!(events, [PressKind::Long]);
        assert_eq!(ctx.state, KeyState::Idle);
        assert!(!ctx.long_press_latched);
    }

    #[test]
    fn long_press_boundary() {
        // 3 samples to Pressed, then the counter must reach 50 while held.
        let (ctx, events) = run(held(52));
        assert!(events.is_empty());
        assert_eq!(ctx.state, KeyState::Pressed);

        let (ctx, events) = run(held(53));
        assert_eq!(events, [PressKind::Long]);
        assert_eq!(ctx.state, KeyState::LongActive);
        assert!(ctx.long_press_latched);
    }

    #[test]
    fn two_separate_presses_give_two_events() {
        let (_, events) = run(held(5).chain(released(5)).chain(held(60)).chain(released(1)));
        assert_eq!(events, [PressKind::Short, PressKind::Long]);
    }

    #[test]
    fn holding_past_long_press_keeps_counter_small() {
        let (ctx, _) = run(held(500));
        assert_eq!(ctx.state, KeyState::LongActive);
        assert_eq!(ctx.state_duration_ticks, 1);
    }

    // -- Recognizer & handler -------------------------------------------------

    #[derive(Default)]
    struct FakeInput {
        low: HashMap<u8, bool>,
    }

    impl KeyInput for Arc<Mutex<FakeInput>> {
        fn level(&mut self, key: u8) -> bool {
            !self.lock().unwrap().low.get(&key).copied().unwrap_or(false)
        }
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<KeyPress>>>);

    impl KeyEventHandler for Recorder {
        fn on_press(&self, press: KeyPress) {
            self.0.lock().unwrap().push(press);
        }
    }

    #[test]
    fn recognizer_reads_active_low_and_tracks_keys_independently() {
        let input = Arc::new(Mutex::new(FakeInput::default()));
        let recorder = Recorder::default();
        let mut rec = KeyRecognizer::new([1, 2], TIMING, input.clone(), recorder.clone());

        input.lock().unwrap().low.insert(2, true);
        for _ in 0..5 {
            rec.tick();
        }
        assert_eq!(rec.context(1).unwrap().state, KeyState::Idle);
        assert_eq!(rec.context(2).unwrap().state, KeyState::Pressed);

        input.lock().unwrap().low.insert(2, false);
        rec.tick();
        assert_eq!(
            *recorder.0.lock().unwrap(),
            [KeyPress { key: 2, kind: PressKind::Short }]
        );
    }

    #[tokio::test]
    async fn queue_handler_filters_undelivered_keys() {
        let (tx, mut rx) = mpsc::channel(4);
        let handler = QueueHandler::new(tx, &crate::config::Config::default().keys);

        handler.on_press(KeyPress { key: 3, kind: PressKind::Short });
        handler.on_press(KeyPress { key: 1, kind: PressKind::Long });

        assert_eq!(rx.recv().await, Some(KeyPress { key: 1, kind: PressKind::Long }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn queue_handler_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let handler = QueueHandler::new(tx, &crate::config::Config::default().keys);
        for _ in 0..3 {
            handler.on_press(KeyPress { key: 1, kind: PressKind::Short });
        }
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    // -- Actions --------------------------------------------------------------

    #[test]
    fn action_mapping() {
        let p = |key, kind| action_for(KeyPress { key, kind });
        assert_eq!(p(1, PressKind::Short), Some(Control::Light));
        assert_eq!(p(1, PressKind::Long), Some(Control::Power));
        assert_eq!(p(2, PressKind::Short), Some(Control::Relay1));
        assert_eq!(p(2, PressKind::Long), Some(Control::Relay2));
        assert_eq!(p(3, PressKind::Short), None);
    }

    #[tokio::test]
    async fn key_actions_toggle_outputs() {
        let store = StateStore::new();
        handle_press(&store, KeyPress { key: 1, kind: PressKind::Long }).await;
        assert!(store.snapshot().await.status.power);

        handle_press(&store, KeyPress { key: 2, kind: PressKind::Short }).await;
        assert!(store.snapshot().await.status.relay1);
        handle_press(&store, KeyPress { key: 2, kind: PressKind::Short }).await;
        assert!(!store.snapshot().await.status.relay1);
    }

    #[tokio::test]
    async fn key_actions_respect_lockout() {
        let store = StateStore::new();
        store.emergency_power_off("test").await;
        handle_press(&store, KeyPress { key: 1, kind: PressKind::Short }).await;
        assert!(!store.snapshot().await.status.light);
    }
}
