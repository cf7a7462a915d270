use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::alert::Notice;
use crate::error::{CommandError, ControlError};
use crate::payload::{decode_command, CommandReply, PayloadEncoder};
use crate::state::{StateStore, WorkstationStatus};
use crate::upload::UploadKind;

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Topic layout under a per-station prefix, e.g. `station/ws-01`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub property_post: String,
    pub event_post: String,
    pub property_set: String,
    pub set_reply: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self {
            property_post: format!("{prefix}/property/post"),
            event_post: format!("{prefix}/event/post"),
            property_set: format!("{prefix}/property/set"),
            set_reply: format!("{prefix}/property/set_reply"),
        }
    }

    pub fn is_command(&self, topic: &str) -> bool {
        topic == self.property_set
    }
}

// ---------------------------------------------------------------------------
// Outbound queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Hand a message to the publisher without waiting. A full queue drops it.
pub fn enqueue(tx: &mpsc::Sender<Outbound>, topic: &str, payload: Vec<u8>) {
    let len = payload.len();
    if let Err(e) = tx.try_send(Outbound {
        topic: topic.to_string(),
        payload,
    }) {
        warn!(topic, len, error = %e, "outbound queue full, message dropped");
    }
}

/// Drain the outbound queue into the client.
pub async fn run_publisher(client: AsyncClient, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(msg) = rx.recv().await {
        let len = msg.payload.len();
        match client
            .publish(msg.topic.as_str(), QoS::AtLeastOnce, false, msg.payload)
            .await
        {
            Ok(()) => debug!(topic = %msg.topic, len, "published"),
            Err(e) => warn!(topic = %msg.topic, error = %e, "publish failed"),
        }
    }
    debug!("outbound queue closed");
}

// ---------------------------------------------------------------------------
// Remote commands
// ---------------------------------------------------------------------------

/// Decode and apply one remote command. Every field is attempted; the reply
/// code reports the worst outcome.
pub async fn handle_command(store: &StateStore, payload: &[u8]) -> CommandReply {
    let cmd = match decode_command(payload) {
        Ok(cmd) => cmd,
        Err(e) => {
            warn!(error = %e, "remote command rejected");
            let id = match &e {
                CommandError::Malformed(_) => String::new(),
                _ => peek_id(payload),
            };
            return CommandReply {
                id,
                code: 400,
                msg: e.to_string(),
            };
        }
    };

    let mut blocked = Vec::new();
    for (control, on) in &cmd.changes {
        match store.set_output(*control, *on).await {
            Ok(()) => info!(id = %cmd.id, %control, on, "remote command applied"),
            Err(ControlError::BlockedByEmergency(c)) => blocked.push(c.to_string()),
            Err(e) => {
                warn!(id = %cmd.id, %control, error = %e, "remote command field failed");
            }
        }
    }

    if blocked.is_empty() {
        CommandReply {
            id: cmd.id,
            code: 200,
            msg: "success".to_string(),
        }
    } else {
        warn!(id = %cmd.id, blocked = ?blocked, "remote command blocked by emergency lockout");
        CommandReply {
            id: cmd.id,
            code: 409,
            msg: format!("emergency mode, cannot control {}", blocked.join(", ")),
        }
    }
}

/// Best-effort id extraction for replies to commands that parsed as JSON.
fn peek_id(payload: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| match v.get("id") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
            None => None,
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Poll the connection forever: track the uplink flag, (re)subscribe on every
/// ConnAck and answer commands on the set topic.
pub async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    store: StateStore,
    topics: Arc<Topics>,
    outbound: mpsc::Sender<Outbound>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if !topics.is_command(&p.topic) {
                    debug!(topic = %p.topic, "unhandled topic");
                    continue;
                }

                let reply = handle_command(&store, &p.payload).await;
                match reply.encode() {
                    Ok(bytes) => enqueue(&outbound, &topics.set_reply, bytes),
                    Err(e) => error!(error = %e, "command reply encode failed"),
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                store.set_uplink_connected(true).await;
                // Resync the cloud copy after every (re)connect.
                store.request_upload().await;
                if let Err(e) = client
                    .subscribe(topics.property_set.as_str(), QoS::AtLeastOnce)
                    .await
                {
                    warn!(error = %e, "subscribe failed");
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                store.set_uplink_connected(false).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt error, reconnecting");
                store.set_uplink_connected(false).await;
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Uplink (sampling-cycle side)
// ---------------------------------------------------------------------------

/// Encodes uploads and notices and hands them to the publisher.
pub struct Uplink {
    topics: Arc<Topics>,
    encoder: PayloadEncoder,
    tx: mpsc::Sender<Outbound>,
}

impl Uplink {
    pub fn new(topics: Arc<Topics>, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            topics,
            encoder: PayloadEncoder::new(),
            tx,
        }
    }

    pub fn send_upload(&self, kind: UploadKind, status: &WorkstationStatus) {
        let encoded = match kind {
            UploadKind::Full => self.encoder.full(status),
            UploadKind::Reduced => self.encoder.reduced(status),
        };
        match encoded {
            Ok(bytes) => {
                debug!(?kind, len = bytes.len(), "property upload queued");
                enqueue(&self.tx, &self.topics.property_post, bytes);
            }
            Err(e) => error!(?kind, error = %e, "property upload not sent"),
        }
    }

    pub fn send_notice(&self, notice: &Notice) {
        match self.encoder.notice(notice) {
            Ok(bytes) => enqueue(&self.tx, &self.topics.event_post, bytes),
            Err(e) => error!(error = %e, "event not sent"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
