//! Card-presence boundary. A reader adapter pushes `CardEvent`s; the consumer
//! turns them into store operations.

use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::state::{StateStore, NO_USER, UNKNOWN_USER};

/// Username bytes stored on the card.
pub const USERNAME_MAX_BYTES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardEvent {
    /// Card authenticated; `raw` is the username block as read.
    Present { raw: Vec<u8> },
    Removed,
}

/// NUL-terminated, at most ten bytes. Empty or a literal `"null"` would
/// collide with the no-user sentinel, so both become `"UNKNOWN"`.
pub fn normalize_username(raw: &[u8]) -> String {
    let end = raw
        .iter()
        .take(USERNAME_MAX_BYTES)
        .position(|b| *b == 0)
        .unwrap_or_else(|| raw.len().min(USERNAME_MAX_BYTES));

    let name = String::from_utf8_lossy(&raw[..end]);
    if name.is_empty() || name == NO_USER {
        UNKNOWN_USER.to_string()
    } else {
        name.into_owned()
    }
}

pub async fn apply(store: &StateStore, event: CardEvent) {
    match event {
        CardEvent::Present { raw } => {
            let username = normalize_username(&raw);
            store.on_card_present(&username).await;
        }
        CardEvent::Removed => store.on_card_removed().await,
    }
}

pub async fn run_consumer(store: StateStore, mut rx: mpsc::Receiver<CardEvent>) {
    while let Some(event) = rx.recv().await {
        apply(&store, event).await;
    }
    debug!("card channel closed");
}

/// Development reader: presents `username` shortly after startup. With a
/// `hold`, the card is lifted again after that long; otherwise it stays on
/// the reader. No card at all when unset.
pub async fn run_sim_reader(
    username: Option<String>,
    hold: Option<Duration>,
    tx: mpsc::Sender<CardEvent>,
) {
    let Some(username) = username else {
        debug!("no simulated card configured");
        return;
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    info!(%username, "simulated card placed on reader");
    let raw = username.into_bytes();
    if tx.send(CardEvent::Present { raw }).await.is_err() {
        debug!("card channel closed before simulated card was read");
        return;
    }

    let Some(hold) = hold else {
        return;
    };
    tokio::time::sleep(hold).await;
    info!(held_ms = hold.as_millis() as u64, "simulated card lifted from reader");
    if tx.send(CardEvent::Removed).await.is_err() {
        debug!("card channel closed before simulated removal");
    }
}
