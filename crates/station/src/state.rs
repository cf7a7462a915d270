//! The shared workstation record and the store that guards it.
//!
//! Sampling, keys, card events, HTTP and MQTT all mutate the same record.
//! `StateStore` wraps it in a single `RwLock`; every named operation holds the
//! write lock for its whole duration, and readers take a cloned snapshot, so
//! nobody ever observes a half-applied mutation.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::alert::{AlertNotice, AnomalyDetector, Detection, Notice, Severity};
use crate::config::AutoControl;
use crate::control::Control;
use crate::error::ControlError;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

/// Username while no card is authenticated and no override is active.
pub const NO_USER: &str = "null";
/// Username for a card that is present but carries no readable name.
pub const UNKNOWN_USER: &str = "UNKNOWN";
/// Username assigned when power is switched on without a card.
pub const ADMIN_USER: &str = "0000000001";
/// Sensor value before the first sample arrives.
pub const UNSAMPLED: f32 = -1.0;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Raw ADC count and derived voltage for one analog channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AnalogChannel {
    pub raw: i32,
    pub voltage: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    pub heat: AnalogChannel,
    pub light: AnalogChannel,
    pub flame: AnalogChannel,
    pub smoke: AnalogChannel,
}

/// One sampling tick's worth of calibrated readings, produced outside the
/// core by a `SensorSource`.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSnapshot {
    pub temperature: f32,
    pub humidity: f32,
    pub flame_scope: f32,
    pub smoke_scope: f32,
    pub heat_scope: f32,
    pub light_intensity: f32,
    pub human_presence: bool,
    pub diagnostics: Diagnostics,
}

/// The four switched outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Outputs {
    pub power: bool,
    pub light: bool,
    pub relay1: bool,
    pub relay2: bool,
}

impl Outputs {
    pub fn any_on(&self) -> bool {
        self.power || self.light || self.relay1 || self.relay2
    }

    pub fn level(&self, control: Control) -> bool {
        match control {
            Control::Power => self.power,
            Control::Light => self.light,
            Control::Relay1 => self.relay1,
            Control::Relay2 => self.relay2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkstationStatus {
    pub workstation_code: String,
    pub cur_username: String,
    pub power: bool,
    pub light: bool,
    pub relay1: bool,
    pub relay2: bool,
    pub light_intensity: f32,
    pub smoke_scope: f32,
    pub flame_scope: f32,
    pub heat_scope: f32,
    pub humidity: f32,
    pub temperature: f32,
    pub human_presence: bool,
    pub diagnostics: Diagnostics,
}

impl Default for WorkstationStatus {
    fn default() -> Self {
        Self {
            workstation_code: String::new(),
            cur_username: NO_USER.to_string(),
            power: false,
            light: false,
            relay1: false,
            relay2: false,
            light_intensity: UNSAMPLED,
            smoke_scope: UNSAMPLED,
            flame_scope: UNSAMPLED,
            heat_scope: UNSAMPLED,
            humidity: UNSAMPLED,
            temperature: UNSAMPLED,
            human_presence: false,
            diagnostics: Diagnostics::default(),
        }
    }
}

impl WorkstationStatus {
    /// True while a card user or the administrative override holds the
    /// workstation.
    pub fn has_user(&self) -> bool {
        self.cur_username != NO_USER
    }

    pub fn outputs(&self) -> Outputs {
        Outputs {
            power: self.power,
            light: self.light,
            relay1: self.relay1,
            relay2: self.relay2,
        }
    }

    fn all_off(&mut self) {
        self.power = false;
        self.light = false;
        self.relay1 = false;
        self.relay2 = false;
    }

    fn apply_sample(&mut self, s: &SensorSnapshot) {
        self.temperature = s.temperature;
        self.humidity = s.humidity;
        self.flame_scope = s.flame_scope;
        self.smoke_scope = s.smoke_scope;
        self.heat_scope = s.heat_scope;
        self.light_intensity = s.light_intensity;
        self.human_presence = s.human_presence;
        self.diagnostics = s.diagnostics;
    }
}

/// Emergency latch. Left only by a power-on: `set_power(true)` from any
/// surface, or a card re-auth.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Lockout {
    Normal,
    Emergency {
        reason: String,
        #[serde(with = "time::serde::rfc3339")]
        since: OffsetDateTime,
    },
}

impl Lockout {
    pub fn is_latched(&self) -> bool {
        matches!(self, Self::Emergency { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StationEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Control,
    Card,
    Alert,
    Emergency,
    Uplink,
    System,
}

/// Point-in-time copy handed to readers.
#[derive(Debug, Clone, Serialize)]
pub struct StationSnapshot {
    pub status: WorkstationStatus,
    pub lockout: Lockout,
    pub card_present: bool,
    pub uplink_connected: bool,
    pub upload_pending: bool,
}

/// What the upload scheduler needs from one tick, taken atomically.
#[derive(Debug, Clone)]
pub struct UploadContext {
    pub force: bool,
    pub uplink_connected: bool,
    pub status: WorkstationStatus,
}

// ---------------------------------------------------------------------------
// JSON response (what the status API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    #[serde(flatten)]
    pub snapshot: StationSnapshot,
    pub events: Vec<StationEvent>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct Inner {
    started_at: Instant,
    status: WorkstationStatus,
    lockout: Lockout,
    card_present: bool,
    force_upload: bool,
    uplink_connected: bool,
    events: VecDeque<StationEvent>,
}

#[derive(Clone)]
pub struct StateStore {
    inner: Arc<RwLock<Inner>>,
    outputs_tx: Arc<watch::Sender<Outputs>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let (outputs_tx, _) = watch::channel(Outputs::default());
        let mut inner = Inner {
            started_at: Instant::now(),
            status: WorkstationStatus::default(),
            lockout: Lockout::Normal,
            card_present: false,
            force_upload: false,
            uplink_connected: false,
            events: VecDeque::with_capacity(MAX_EVENTS),
        };
        inner.push_event(EventKind::System, "station started".to_string());

        Self {
            inner: Arc::new(RwLock::new(inner)),
            outputs_tx: Arc::new(outputs_tx),
        }
    }

    /// Receiver that sees the output levels after every mutation.
    pub fn subscribe_outputs(&self) -> watch::Receiver<Outputs> {
        self.outputs_tx.subscribe()
    }

    // -- Readers ------------------------------------------------------------

    pub async fn snapshot(&self) -> StationSnapshot {
        self.inner.read().await.snapshot()
    }

    pub async fn status_report(&self) -> StatusResponse {
        let inner = self.inner.read().await;
        StatusResponse {
            uptime_secs: inner.started_at.elapsed().as_secs(),
            snapshot: inner.snapshot(),
            events: inner.events.iter().rev().cloned().collect(),
        }
    }

    // -- Control surface ----------------------------------------------------

    /// Dispatch a binary control request. Every accepted request asks for a
    /// forced upload on the next sampling tick.
    pub async fn set_output(&self, control: Control, on: bool) -> Result<(), ControlError> {
        let mut inner = self.inner.write().await;
        self.apply_output(&mut inner, control, on)
    }

    /// Flip one output under a single write guard. Returns the new level.
    pub async fn toggle(&self, control: Control) -> Result<bool, ControlError> {
        let mut inner = self.inner.write().await;
        let on = !inner.status.outputs().level(control);
        self.apply_output(&mut inner, control, on)?;
        Ok(on)
    }

    /// Power on clears the lockout and, with nobody logged in, hands the
    /// workstation to the administrative user. Power off drops every output
    /// and releases only the administrative user; a card user stays.
    pub async fn set_power(&self, on: bool) {
        let mut inner = self.inner.write().await;
        self.apply_power(&mut inner, on);
    }

    pub async fn set_light(&self, on: bool) -> Result<(), ControlError> {
        self.set_output(Control::Light, on).await
    }

    pub async fn set_relay1(&self, on: bool) -> Result<(), ControlError> {
        self.set_output(Control::Relay1, on).await
    }

    pub async fn set_relay2(&self, on: bool) -> Result<(), ControlError> {
        self.set_output(Control::Relay2, on).await
    }

    fn apply_output(&self, inner: &mut Inner, control: Control, on: bool) -> Result<(), ControlError> {
        match control {
            Control::Power => {
                self.apply_power(inner, on);
                Ok(())
            }
            Control::Light => self.apply_switch(inner, control, on, |s| &mut s.light),
            Control::Relay1 => self.apply_switch(inner, control, on, |s| &mut s.relay1),
            Control::Relay2 => self.apply_switch(inner, control, on, |s| &mut s.relay2),
        }
    }

    fn apply_power(&self, inner: &mut Inner, on: bool) {
        if on {
            if inner.lockout.is_latched() {
                warn!("clearing emergency lockout for power on");
                inner.lockout = Lockout::Normal;
                inner.push_event(EventKind::Emergency, "lockout cleared by power on".to_string());
            }
            if !inner.status.has_user() {
                inner.status.cur_username = ADMIN_USER.to_string();
                info!(username = ADMIN_USER, "power on by administrator");
            }
            inner.status.power = true;
        } else {
            inner.status.all_off();
            if inner.status.cur_username == ADMIN_USER {
                inner.status.cur_username = NO_USER.to_string();
            }
        }

        inner.force_upload = true;
        inner.push_event(EventKind::Control, format!("power set {}", on_off(on)));
        info!(on, "power set");
        self.publish_outputs(inner);
    }

    fn apply_switch(
        &self,
        inner: &mut Inner,
        control: Control,
        on: bool,
        field: fn(&mut WorkstationStatus) -> &mut bool,
    ) -> Result<(), ControlError> {
        if inner.lockout.is_latched() {
            warn!(%control, "request blocked by emergency lockout");
            return Err(ControlError::BlockedByEmergency(control));
        }

        if !inner.status.power {
            warn!(%control, on, "switching output while workstation power is off");
        }
        *field(&mut inner.status) = on;

        inner.force_upload = true;
        inner.push_event(EventKind::Control, format!("{control} set {}", on_off(on)));
        info!(%control, on, "output set");
        self.publish_outputs(inner);
        Ok(())
    }

    // -- Card presence ------------------------------------------------------

    /// A card authenticated: power only, every other output off. Re-auth also
    /// clears a latched lockout.
    pub async fn on_card_present(&self, username: &str) {
        let mut inner = self.inner.write().await;

        if inner.lockout.is_latched() {
            warn!(username, "clearing emergency lockout on card re-auth");
            inner.lockout = Lockout::Normal;
            inner.push_event(EventKind::Emergency, "lockout cleared by card".to_string());
        }

        inner.card_present = true;
        inner.status.cur_username = username.to_string();
        inner.status.light = false;
        inner.status.relay1 = false;
        inner.status.relay2 = false;
        inner.status.power = true;
        inner.force_upload = true;

        inner.push_event(EventKind::Card, format!("card present: {username}"));
        info!(username, "card present, power enabled");
        self.publish_outputs(&inner);
    }

    pub async fn on_card_removed(&self) {
        let mut inner = self.inner.write().await;

        let previous = std::mem::replace(&mut inner.status.cur_username, NO_USER.to_string());
        inner.card_present = false;
        inner.status.all_off();
        inner.force_upload = true;

        inner.push_event(EventKind::Card, format!("card removed: {previous}"));
        info!(username = %previous, "card removed, outputs off");
        self.publish_outputs(&inner);
    }

    // -- Sampling cycle -----------------------------------------------------

    pub async fn record_sample(&self, snapshot: &SensorSnapshot) {
        let mut inner = self.inner.write().await;
        inner.status.apply_sample(snapshot);
        debug!(
            temperature = snapshot.temperature,
            humidity = snapshot.humidity,
            flame = snapshot.flame_scope,
            smoke = snapshot.smoke_scope,
            heat = snapshot.heat_scope,
            light = snapshot.light_intensity,
            presence = snapshot.human_presence,
            "sample recorded"
        );
    }

    /// Run the detector against the current record and apply its side
    /// effects. Notices are only produced while the uplink is connected.
    pub async fn detect(&self, detector: &AnomalyDetector) -> Detection {
        let mut inner = self.inner.write().await;

        if inner.lockout.is_latched() {
            debug!("emergency lockout latched, skipping anomaly detection");
            return Detection::none();
        }

        let verdict = detector.evaluate(&inner.status);
        let mut notices = Vec::new();

        if let Some(trigger) = verdict.emergency {
            error!(
                alert = trigger.alert.as_str(),
                value = trigger.value,
                threshold = trigger.threshold,
                "emergency threshold breached"
            );

            let mut locked_out = false;
            if detector.auto_power_off() {
                notices.extend(self.enter_lockout(&mut inner, &trigger.reason()));
                locked_out = true;
            } else {
                warn!("auto power-off disabled, only alerting");
                inner.push_event(EventKind::Alert, trigger.reason());
            }

            if inner.uplink_connected {
                notices.push(Notice::Alert(AlertNotice::new(
                    &trigger,
                    Severity::Emergency,
                    &inner.status,
                )));
            } else {
                warn!(alert = trigger.alert.as_str(), "uplink down, emergency alert dropped");
            }

            return Detection {
                alert: trigger.alert,
                notices,
                locked_out,
            };
        }

        for trigger in &verdict.warnings {
            warn!(
                alert = trigger.alert.as_str(),
                value = trigger.value,
                threshold = trigger.threshold,
                "warning threshold crossed"
            );
            if inner.uplink_connected {
                notices.push(Notice::Alert(AlertNotice::new(
                    trigger,
                    Severity::Warning,
                    &inner.status,
                )));
            } else {
                warn!(alert = trigger.alert.as_str(), "uplink down, warning alert dropped");
            }
            inner.force_upload = true;
            inner.push_event(EventKind::Alert, trigger.alert.as_str().to_string());
        }

        Detection {
            alert: verdict.alert(),
            notices,
            locked_out: false,
        }
    }

    /// Externally requested emergency power off. Returns the one-shot
    /// power-off notice when this call entered the lockout.
    pub async fn emergency_power_off(&self, reason: &str) -> Option<Notice> {
        let mut inner = self.inner.write().await;
        self.enter_lockout(&mut inner, reason)
    }

    /// Light follows darkness and relay 1 follows smoke, but only while
    /// powered and not latched. Runs after manual requests, so it wins.
    pub async fn apply_auto_control(&self, auto: &AutoControl) {
        let mut inner = self.inner.write().await;

        if !inner.status.power || inner.lockout.is_latched() {
            debug!(
                power = inner.status.power,
                latched = inner.lockout.is_latched(),
                "auto control skipped"
            );
            return;
        }

        let light = inner.status.light_intensity < auto.light_on_below;
        let relay1 = inner.status.smoke_scope > auto.relay1_on_above;
        debug!(
            light,
            relay1,
            light_intensity = inner.status.light_intensity,
            smoke = inner.status.smoke_scope,
            "auto control applied"
        );

        inner.status.light = light;
        inner.status.relay1 = relay1;
        self.publish_outputs(&inner);
    }

    // -- Upload flag & uplink -----------------------------------------------

    /// Ask for a full upload on the next sampling tick.
    pub async fn request_upload(&self) {
        self.inner.write().await.force_upload = true;
    }

    /// Consume the force-upload flag and copy the record in one step.
    pub async fn take_upload_request(&self) -> UploadContext {
        let mut inner = self.inner.write().await;
        let force = std::mem::take(&mut inner.force_upload);
        UploadContext {
            force,
            uplink_connected: inner.uplink_connected,
            status: inner.status.clone(),
        }
    }

    pub async fn set_uplink_connected(&self, connected: bool) {
        let mut inner = self.inner.write().await;
        if inner.uplink_connected != connected {
            inner.uplink_connected = connected;
            let detail = if connected { "uplink connected" } else { "uplink disconnected" };
            inner.push_event(EventKind::Uplink, detail.to_string());
        }
    }

    pub async fn record_system(&self, detail: String) {
        self.inner.write().await.push_event(EventKind::System, detail);
    }

    // -- Internal -----------------------------------------------------------

    fn enter_lockout(&self, inner: &mut Inner, reason: &str) -> Option<Notice> {
        error!(reason, "EMERGENCY POWER OFF");
        inner.status.all_off();
        self.publish_outputs(inner);

        if inner.lockout.is_latched() {
            return None;
        }

        inner.lockout = Lockout::Emergency {
            reason: reason.to_string(),
            since: OffsetDateTime::now_utc(),
        };
        inner.push_event(EventKind::Emergency, reason.to_string());

        if inner.uplink_connected {
            Some(Notice::EmergencyPowerOff {
                reason: reason.to_string(),
                username: inner.status.cur_username.clone(),
            })
        } else {
            warn!("uplink down, emergency power-off event dropped");
            None
        }
    }

    fn publish_outputs(&self, inner: &Inner) {
        self.outputs_tx.send_if_modified(|current| {
            let next = inner.status.outputs();
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

impl Inner {
    fn snapshot(&self) -> StationSnapshot {
        StationSnapshot {
            status: self.status.clone(),
            lockout: self.lockout.clone(),
            card_present: self.card_present,
            uplink_connected: self.uplink_connected,
            upload_pending: self.force_upload,
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(StationEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertType;
    use crate::config::Config;

    fn calm_sample() -> SensorSnapshot {
        SensorSnapshot {
            temperature: 24.0,
            humidity: 50.0,
            flame_scope: 0.0,
            smoke_scope: 0.0,
            heat_scope: 10.0,
            light_intensity: 60.0,
            human_presence: true,
            diagnostics: Diagnostics::default(),
        }
    }

    fn detector() -> AnomalyDetector {
        AnomalyDetector::from_config(&Config::default())
    }

    async fn all_on(store: &StateStore) {
        store.set_power(true).await;
        store.set_light(true).await.unwrap();
        store.set_relay1(true).await.unwrap();
        store.set_relay2(true).await.unwrap();
    }

    // -- Boot state -----------------------------------------------------------

    #[tokio::test]
    async fn boots_with_outputs_off_and_unsampled_sensors() {
        let snap = StateStore::new().snapshot().await;
        assert_eq!(snap.status.cur_username, NO_USER);
        assert!(!snap.status.outputs().any_on());
        assert_eq!(snap.status.temperature, UNSAMPLED);
        assert_eq!(snap.status.smoke_scope, UNSAMPLED);
        assert_eq!(snap.lockout, Lockout::Normal);
    }

    // -- set_power ------------------------------------------------------------

    #[tokio::test]
    async fn power_on_without_user_assigns_admin() {
        let store = StateStore::new();
        store.set_power(true).await;
        let snap = store.snapshot().await;
        assert!(snap.status.power);
        assert_eq!(snap.status.cur_username, ADMIN_USER);
        assert!(snap.upload_pending);
    }

    #[tokio::test]
    async fn power_off_drives_every_output_low() {
        let store = StateStore::new();
        all_on(&store).await;
        store.set_power(false).await;
        assert!(!store.snapshot().await.status.outputs().any_on());
    }

    #[tokio::test]
    async fn power_off_releases_admin_but_keeps_card_user() {
        let store = StateStore::new();
        store.set_power(true).await;
        store.set_power(false).await;
        assert_eq!(store.snapshot().await.status.cur_username, NO_USER);

        store.on_card_present("alice").await;
        store.set_power(false).await;
        let snap = store.snapshot().await;
        assert_eq!(snap.status.cur_username, "alice");
        assert!(!snap.status.power);
    }

    #[tokio::test]
    async fn power_on_keeps_card_user() {
        let store = StateStore::new();
        store.on_card_present("bob").await;
        store.set_power(false).await;
        store.set_power(true).await;
        assert_eq!(store.snapshot().await.status.cur_username, "bob");
    }

    // -- Switches -------------------------------------------------------------

    #[tokio::test]
    async fn light_can_be_set_while_unpowered() {
        let store = StateStore::new();
        store.set_light(true).await.unwrap();
        let snap = store.snapshot().await;
        assert!(snap.status.light);
        assert!(!snap.status.power);
    }

    #[tokio::test]
    async fn switches_blocked_during_lockout() {
        let store = StateStore::new();
        store.emergency_power_off("test").await;

        assert_eq!(
            store.set_light(true).await,
            Err(ControlError::BlockedByEmergency(Control::Light))
        );
        assert_eq!(
            store.set_relay1(true).await,
            Err(ControlError::BlockedByEmergency(Control::Relay1))
        );
        assert_eq!(
            store.set_relay2(false).await,
            Err(ControlError::BlockedByEmergency(Control::Relay2))
        );
        assert!(!store.snapshot().await.status.outputs().any_on());
    }

    #[tokio::test]
    async fn toggle_flips_and_forces_upload() {
        let store = StateStore::new();
        assert_eq!(store.toggle(Control::Relay1).await, Ok(true));
        let snap = store.snapshot().await;
        assert!(snap.status.relay1);
        assert!(snap.upload_pending);

        assert_eq!(store.toggle(Control::Relay1).await, Ok(false));
        assert!(!store.snapshot().await.status.relay1);
    }

    #[tokio::test]
    async fn toggle_power_clears_lockout_but_switches_stay_blocked() {
        let store = StateStore::new();
        store.emergency_power_off("test").await;
        assert_eq!(
            store.toggle(Control::Light).await,
            Err(ControlError::BlockedByEmergency(Control::Light))
        );
        assert_eq!(store.toggle(Control::Power).await, Ok(true));
        assert!(!store.snapshot().await.lockout.is_latched());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_toggles_are_not_lost() {
        let store = StateStore::new();
        let handles: Vec<_> = (0..9)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.toggle(Control::Light).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        // Odd number of flips from off.
        assert!(store.snapshot().await.status.light);
    }

    // -- Lockout --------------------------------------------------------------

    #[tokio::test]
    async fn emergency_power_off_latches_and_notifies_once() {
        let store = StateStore::new();
        store.set_uplink_connected(true).await;
        store.on_card_present("carol").await;
        all_on(&store).await;

        let first = store.emergency_power_off("manual").await;
        match first {
            Some(Notice::EmergencyPowerOff { reason, username }) => {
                assert_eq!(reason, "manual");
                assert_eq!(username, "carol");
            }
            other => panic!("expected power-off notice, got {other:?}"),
        }
        assert!(store.emergency_power_off("again").await.is_none());

        let snap = store.snapshot().await;
        assert!(snap.lockout.is_latched());
        assert!(!snap.status.outputs().any_on());
    }

    #[tokio::test]
    async fn lockout_without_uplink_produces_no_notice() {
        let store = StateStore::new();
        assert!(store.emergency_power_off("offline").await.is_none());
        assert!(store.snapshot().await.lockout.is_latched());
    }

    #[tokio::test]
    async fn power_on_clears_lockout() {
        let store = StateStore::new();
        store.emergency_power_off("test").await;
        store.set_power(true).await;

        let snap = store.snapshot().await;
        assert_eq!(snap.lockout, Lockout::Normal);
        assert!(snap.status.power);
        store.set_light(true).await.unwrap();
    }

    // -- Card -----------------------------------------------------------------

    #[tokio::test]
    async fn card_present_enables_power_only() {
        let store = StateStore::new();
        store.set_light(true).await.unwrap();
        store.set_relay2(true).await.unwrap();

        store.on_card_present("dave").await;
        let snap = store.snapshot().await;
        assert!(snap.card_present);
        assert_eq!(snap.status.cur_username, "dave");
        assert_eq!(
            snap.status.outputs(),
            Outputs { power: true, light: false, relay1: false, relay2: false }
        );
        assert!(snap.upload_pending);
    }

    #[tokio::test]
    async fn card_removed_then_present_starts_clean() {
        let store = StateStore::new();
        store.on_card_present("zed").await;
        all_on(&store).await;

        store.on_card_removed().await;
        let removed = store.snapshot().await;
        assert_eq!(removed.status.cur_username, NO_USER);
        assert!(!removed.status.outputs().any_on());
        assert!(!removed.card_present);

        store.on_card_present("A").await;
        let snap = store.snapshot().await;
        assert_eq!(snap.status.cur_username, "A");
        assert_eq!(
            snap.status.outputs(),
            Outputs { power: true, light: false, relay1: false, relay2: false }
        );
    }

    #[tokio::test]
    async fn card_reauth_clears_lockout() {
        let store = StateStore::new();
        store.emergency_power_off("test").await;
        store.on_card_present("erin").await;
        let snap = store.snapshot().await;
        assert!(!snap.lockout.is_latched());
        assert!(snap.status.power);
    }

    // -- Detection ------------------------------------------------------------

    #[tokio::test]
    async fn high_temperature_sets_warning_and_force_flag() {
        let store = StateStore::new();
        let mut sample = calm_sample();
        sample.temperature = 36.0;
        store.record_sample(&sample).await;

        let detection = store.detect(&detector()).await;
        assert_eq!(detection.alert, AlertType::TempHighWarning);
        assert!(!detection.locked_out);

        let snap = store.snapshot().await;
        assert!(snap.upload_pending);
        assert!(!snap.lockout.is_latched());
    }

    #[tokio::test]
    async fn flame_emergency_latches_and_queues_one_power_off_event() {
        let store = StateStore::new();
        store.set_uplink_connected(true).await;
        all_on(&store).await;
        let mut sample = calm_sample();
        sample.flame_scope = 75.0;
        store.record_sample(&sample).await;

        let detection = store.detect(&detector()).await;
        assert_eq!(detection.alert, AlertType::FireEmergency);
        assert!(detection.locked_out);

        let power_offs = detection
            .notices
            .iter()
            .filter(|n| matches!(n, Notice::EmergencyPowerOff { .. }))
            .count();
        assert_eq!(power_offs, 1);

        let snap = store.snapshot().await;
        assert!(snap.lockout.is_latched());
        assert!(!snap.status.outputs().any_on());
    }

    #[tokio::test]
    async fn latched_detector_is_inert() {
        let store = StateStore::new();
        store.set_uplink_connected(true).await;
        let mut sample = calm_sample();
        sample.flame_scope = 90.0;
        sample.smoke_scope = 99.0;
        store.record_sample(&sample).await;
        store.detect(&detector()).await;
        // Drain the flag so a repeat would be visible.
        store.take_upload_request().await;

        for _ in 0..3 {
            let detection = store.detect(&detector()).await;
            assert_eq!(detection.alert, AlertType::None);
            assert!(detection.notices.is_empty());
        }
        assert!(!store.snapshot().await.upload_pending);
    }

    #[tokio::test]
    async fn warnings_without_uplink_still_force_upload() {
        let store = StateStore::new();
        let mut sample = calm_sample();
        sample.humidity = 80.0;
        store.record_sample(&sample).await;

        let detection = store.detect(&detector()).await;
        assert_eq!(detection.alert, AlertType::HumidityHighWarning);
        assert!(detection.notices.is_empty());
        assert!(store.snapshot().await.upload_pending);
    }

    #[tokio::test]
    async fn emergency_without_auto_power_off_does_not_latch() {
        let mut cfg = Config::default();
        cfg.auto_power_off = false;
        let store = StateStore::new();
        let mut sample = calm_sample();
        sample.heat_scope = 90.0;
        store.record_sample(&sample).await;

        let detection = store.detect(&AnomalyDetector::from_config(&cfg)).await;
        assert_eq!(detection.alert, AlertType::HeatEmergency);
        assert!(!detection.locked_out);
        assert!(!store.snapshot().await.lockout.is_latched());
    }

    // -- Auto control ---------------------------------------------------------

    #[tokio::test]
    async fn auto_control_follows_light_and_smoke() {
        let store = StateStore::new();
        store.set_power(true).await;
        let mut sample = calm_sample();
        sample.light_intensity = 10.0;
        sample.smoke_scope = 60.0;
        store.record_sample(&sample).await;

        store.apply_auto_control(&AutoControl::default()).await;
        let status = store.snapshot().await.status;
        assert!(status.light);
        assert!(status.relay1);

        sample.light_intensity = 80.0;
        sample.smoke_scope = 5.0;
        store.record_sample(&sample).await;
        store.apply_auto_control(&AutoControl::default()).await;
        let status = store.snapshot().await.status;
        assert!(!status.light);
        assert!(!status.relay1);
    }

    #[tokio::test]
    async fn auto_control_overrides_manual_setting() {
        let store = StateStore::new();
        store.set_power(true).await;
        store.record_sample(&calm_sample()).await;
        store.set_light(true).await.unwrap();

        store.apply_auto_control(&AutoControl::default()).await;
        assert!(!store.snapshot().await.status.light);
    }

    #[tokio::test]
    async fn auto_control_skipped_while_unpowered() {
        let store = StateStore::new();
        let mut sample = calm_sample();
        sample.light_intensity = 5.0;
        store.record_sample(&sample).await;

        store.apply_auto_control(&AutoControl::default()).await;
        assert!(!store.snapshot().await.status.light);
    }

    // -- Upload context & outputs ---------------------------------------------

    #[tokio::test]
    async fn take_upload_request_clears_flag() {
        let store = StateStore::new();
        store.request_upload().await;
        assert!(store.take_upload_request().await.force);
        assert!(!store.take_upload_request().await.force);
    }

    #[tokio::test]
    async fn outputs_watch_follows_mutations() {
        let store = StateStore::new();
        let mut rx = store.subscribe_outputs();
        store.on_card_present("fay").await;
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().power);

        store.emergency_power_off("test").await;
        rx.changed().await.unwrap();
        assert!(!rx.borrow().any_on());
    }

    #[tokio::test]
    async fn event_log_is_bounded() {
        let store = StateStore::new();
        for i in 0..(MAX_EVENTS + 20) {
            store.record_system(format!("event {i}")).await;
        }
        let report = store.status_report().await;
        assert_eq!(report.events.len(), MAX_EVENTS);
        assert_eq!(report.events[0].detail, format!("event {}", MAX_EVENTS + 19));
    }
}
