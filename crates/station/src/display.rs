//! Local status display. The sampling cycle publishes a snapshot each tick
//! through a `watch` channel; the display task renders whatever is newest.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::state::WorkstationStatus;

pub trait Display: Send {
    fn render(&mut self, status: &WorkstationStatus);
}

/// Text lines the way a small panel would show them.
pub fn status_lines(s: &WorkstationStatus) -> [String; 4] {
    let flag = |on: bool| if on { "ON" } else { "--" };
    [
        format!("User: {}", s.cur_username),
        format!("T {:.1}C  H {:.1}%", s.temperature, s.humidity),
        format!("Smoke {:.1}%  Flame {:.1}%", s.smoke_scope, s.flame_scope),
        format!(
            "P:{} L:{} R1:{} R2:{}",
            flag(s.power),
            flag(s.light),
            flag(s.relay1),
            flag(s.relay2)
        ),
    ]
}

/// Renders to the log at info level.
#[derive(Debug, Default)]
pub struct LogDisplay;

impl Display for LogDisplay {
    fn render(&mut self, status: &WorkstationStatus) {
        let [user, climate, air, outputs] = status_lines(status);
        info!(target: "display", "{user} | {climate} | {air} | {outputs}");
    }
}

/// Wait (bounded) for the next snapshot and render it. Runs until the
/// sampling side drops its sender.
pub async fn run_display<D: Display>(
    mut display: D,
    mut rx: watch::Receiver<Option<WorkstationStatus>>,
    wait: Duration,
) {
    loop {
        match timeout(wait, rx.changed()).await {
            Ok(Ok(())) => {
                let latest = rx.borrow_and_update().clone();
                if let Some(status) = latest {
                    display.render(&status);
                }
            }
            Ok(Err(_)) => {
                debug!("display channel closed");
                break;
            }
            // Nothing new within the window.
            Err(_) => {}
        }
    }
}
