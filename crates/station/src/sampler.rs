//! The periodic sampling cycle: sample, record, detect, auto-control,
//! display, schedule, publish.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::alert::{AlertType, AnomalyDetector};
use crate::config::AutoControl;
use crate::mqtt::Uplink;
use crate::sim::SensorSource;
use crate::state::{StateStore, WorkstationStatus};
use crate::upload::{UploadKind, UploadScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub alert: AlertType,
    /// The lockout latched this tick; display and upload were skipped.
    pub skipped: bool,
    pub upload: Option<UploadKind>,
    /// False when an upload was due but the uplink was down.
    pub sent: bool,
}

pub struct Sampler<S> {
    source: S,
    store: StateStore,
    detector: AnomalyDetector,
    auto: AutoControl,
    scheduler: UploadScheduler,
    uplink: Arc<Uplink>,
    display_tx: watch::Sender<Option<WorkstationStatus>>,
}

impl<S: SensorSource> Sampler<S> {
    pub fn new(
        source: S,
        store: StateStore,
        detector: AnomalyDetector,
        auto: AutoControl,
        scheduler: UploadScheduler,
        uplink: Arc<Uplink>,
        display_tx: watch::Sender<Option<WorkstationStatus>>,
    ) -> Self {
        Self {
            source,
            store,
            detector,
            auto,
            scheduler,
            uplink,
            display_tx,
        }
    }

    pub async fn cycle(&mut self) -> CycleReport {
        let snapshot = self.source.sample();
        self.store.record_sample(&snapshot).await;

        let detection = self.store.detect(&self.detector).await;
        for notice in &detection.notices {
            self.uplink.send_notice(notice);
        }

        self.store.apply_auto_control(&self.auto).await;

        if detection.locked_out {
            info!(
                alert = detection.alert.as_str(),
                emergency = detection.alert.is_emergency(),
                "lockout entered, skipping display and upload"
            );
            return CycleReport {
                alert: detection.alert,
                skipped: true,
                upload: None,
                sent: false,
            };
        }

        let ctx = self.store.take_upload_request().await;
        self.display_tx.send_replace(Some(ctx.status.clone()));

        let upload = self.scheduler.tick(ctx.force, ctx.status.has_user());
        let sent = match upload {
            Some(kind) if ctx.uplink_connected => {
                self.uplink.send_upload(kind, &ctx.status);
                true
            }
            Some(kind) => {
                warn!(?kind, "uplink down, upload dropped");
                false
            }
            None => false,
        };

        debug!(
            alert = detection.alert.as_str(),
            force = ctx.force,
            upload = ?upload,
            sent,
            "sampling cycle complete"
        );

        CycleReport {
            alert: detection.alert,
            skipped: false,
            upload,
            sent,
        }
    }
}

/// Run the cycle on a fixed period forever.
pub async fn run<S: SensorSource>(mut sampler: Sampler<S>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        sampler.cycle().await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
