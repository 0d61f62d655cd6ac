// Message broadcaster: batching, priority ordering, and hand-off to the
// work queue.
//
// Queued messages accumulate in two batches. The priority batch (priority
// <= 2) flushes instantly for priority 1 or `immediate`; the regular batch
// flushes at the configured size, on `immediate`, or once a second has
// passed since the last flush. A flush merges both batches, drops expired
// entries, sorts by (priority, created_at), and submits fixed-size chunks
// to the queue worker. A failing chunk is re-queued with capped exponential
// backoff until its attempt budget is spent.

use chrono::{DateTime, Utc};
use fanline_common::protocol::ws::ServerFrame;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::channels::ChannelDirectory;
use crate::metrics;
use crate::registry::ConnectionRegistry;

/// How often the background ticker checks for an overdue flush.
const FLUSH_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy)]
pub struct BroadcastConfig {
    pub batch_size: usize,
    pub batch_max_delay: Duration,
    pub max_attempts: u32,
    pub backoff_cap: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_max_delay: Duration::from_secs(1),
            max_attempts: 3,
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// A unit of broadcast work. References its channel by name only, so
/// messages can be queued before the channel exists.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub id: String,
    pub channel: String,
    pub payload: Value,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl OutboundMessage {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at < now)
    }
}

struct Batches {
    priority: Vec<OutboundMessage>,
    regular: Vec<OutboundMessage>,
    last_flush: Instant,
}

struct Inner {
    directory: Arc<ChannelDirectory>,
    registry: ConnectionRegistry,
    config: BroadcastConfig,
    batches: Mutex<Batches>,
    queue: mpsc::UnboundedSender<Vec<OutboundMessage>>,
}

#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

enum UnitDisposition {
    Empty,
    Delivered { sent: usize },
    Failed,
}

impl Broadcaster {
    /// Build the broadcaster and spawn its queue worker.
    pub fn spawn(
        directory: Arc<ChannelDirectory>,
        registry: ConnectionRegistry,
        config: BroadcastConfig,
    ) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            directory,
            registry,
            config,
            batches: Mutex::new(Batches {
                priority: Vec::new(),
                regular: Vec::new(),
                last_flush: Instant::now(),
            }),
            queue,
        });

        tokio::spawn(run_worker(Arc::clone(&inner), receiver));

        Self { inner }
    }

    /// Queue a message for broadcast. Returns the assigned message id, or
    /// `None` when `expires_at` has already passed (the message is dropped
    /// silently, never dispatched).
    pub async fn queue_message(
        &self,
        channel: &str,
        payload: Value,
        priority: u8,
        expires_at: Option<DateTime<Utc>>,
        immediate: bool,
    ) -> Option<String> {
        let now = Utc::now();
        if expires_at.is_some_and(|deadline| deadline < now) {
            metrics::record_broadcast_outcome("expired", 1);
            return None;
        }

        let message = OutboundMessage {
            id: Uuid::new_v4().simple().to_string(),
            channel: channel.to_string(),
            payload,
            priority: priority.clamp(1, 5),
            created_at: now,
            expires_at,
            attempts: 0,
        };
        let message_id = message.id.clone();
        let clamped_priority = message.priority;
        metrics::record_broadcast_outcome("queued", 1);

        let mut guard = self.inner.batches.lock().await;
        if clamped_priority <= 2 {
            guard.priority.push(message);
            if immediate || clamped_priority == 1 {
                flush_locked(&self.inner, &mut guard);
            }
        } else {
            guard.regular.push(message);
            let overdue = guard.last_flush.elapsed() >= self.inner.config.batch_max_delay;
            if guard.regular.len() >= self.inner.config.batch_size || immediate || overdue {
                flush_locked(&self.inner, &mut guard);
            }
        }
        update_queue_depth(&guard);

        Some(message_id)
    }

    /// Flush when the oldest queued message has waited past the max delay.
    /// Driven by the background ticker so low-traffic batches still drain.
    pub async fn flush_due(&self) {
        let mut guard = self.inner.batches.lock().await;
        let pending = !guard.priority.is_empty() || !guard.regular.is_empty();
        if pending && guard.last_flush.elapsed() >= self.inner.config.batch_max_delay {
            flush_locked(&self.inner, &mut guard);
            update_queue_depth(&guard);
        }
    }

    /// Force a flush of both batches.
    pub async fn flush(&self) {
        let mut guard = self.inner.batches.lock().await;
        flush_locked(&self.inner, &mut guard);
        update_queue_depth(&guard);
    }

    pub fn spawn_flush_ticker(&self) -> JoinHandle<()> {
        let broadcaster = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_TICK);
            loop {
                ticker.tick().await;
                broadcaster.flush_due().await;
            }
        })
    }

    /// Immediate-send primitive for system and presence notifications that
    /// must not be delayed or reordered relative to their trigger. Returns
    /// the number of subscribers reached.
    pub async fn broadcast(&self, channel: &str, frame: ServerFrame) -> usize {
        let subscribers = self.inner.directory.subscribers_of(channel).await;
        let mut sent = 0;
        for connection_id in subscribers {
            if self.inner.registry.send_to(connection_id, frame.clone()).await {
                sent += 1;
            }
        }
        sent
    }
}

/// Merge, expire, sort, and chunk both batches onto the work queue.
fn flush_locked(inner: &Inner, batches: &mut Batches) {
    let now = Utc::now();
    let mut messages =
        Vec::with_capacity(batches.priority.len() + batches.regular.len());
    messages.append(&mut batches.priority);
    messages.append(&mut batches.regular);
    batches.last_flush = Instant::now();

    let before = messages.len();
    messages.retain(|message| !message.is_expired(now));
    let expired = before - messages.len();
    if expired > 0 {
        metrics::record_broadcast_outcome("expired", expired as u64);
    }
    if messages.is_empty() {
        return;
    }

    // Lower priority value first; FIFO within equal priority.
    messages.sort_by(|a, b| {
        a.priority.cmp(&b.priority).then_with(|| a.created_at.cmp(&b.created_at))
    });

    for chunk in messages.chunks(inner.config.batch_size) {
        let _ = inner.queue.send(chunk.to_vec());
    }
}

fn update_queue_depth(batches: &Batches) {
    metrics::set_broadcast_queue_depth((batches.priority.len() + batches.regular.len()) as i64);
}

async fn run_worker(inner: Arc<Inner>, mut receiver: mpsc::UnboundedReceiver<Vec<OutboundMessage>>) {
    while let Some(mut unit) = receiver.recv().await {
        match attempt_delivery(&inner, &mut unit).await {
            UnitDisposition::Empty => {}
            UnitDisposition::Delivered { sent } => {
                metrics::record_broadcast_outcome("dispatched", unit.len() as u64);
                debug!(messages = unit.len(), sent, "broadcast unit delivered");
            }
            UnitDisposition::Failed => {
                let attempts = unit.iter().map(|message| message.attempts).max().unwrap_or(0);
                if attempts >= inner.config.max_attempts {
                    for message in &unit {
                        error!(
                            message_id = %message.id,
                            channel = %message.channel,
                            attempts = message.attempts,
                            "dropping broadcast message after delivery retries"
                        );
                    }
                    metrics::record_broadcast_outcome("dropped", unit.len() as u64);
                } else {
                    let delay = backoff_delay(attempts, inner.config.backoff_cap);
                    metrics::record_delivery_retry();
                    warn!(
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "broadcast delivery failed, retrying unit"
                    );
                    let queue = inner.queue.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = queue.send(unit);
                    });
                }
            }
        }
    }
}

/// Execute one unit of work: re-check expiry, charge an attempt, and push
/// every message to its channel's subscribers. Any failed send fails the
/// whole unit.
async fn attempt_delivery(inner: &Inner, unit: &mut Vec<OutboundMessage>) -> UnitDisposition {
    let now = Utc::now();
    let before = unit.len();
    unit.retain(|message| !message.is_expired(now));
    let expired = before - unit.len();
    if expired > 0 {
        metrics::record_broadcast_outcome("expired", expired as u64);
    }
    if unit.is_empty() {
        return UnitDisposition::Empty;
    }

    for message in unit.iter_mut() {
        message.attempts += 1;
    }

    let mut sent = 0;
    let mut failed = false;
    for message in unit.iter() {
        let frame = ServerFrame::Message {
            data: message.payload.clone(),
            message_id: message.id.clone(),
            timestamp: message.created_at.timestamp(),
            recovery_id: None,
        };
        for connection_id in inner.directory.subscribers_of(&message.channel).await {
            if inner.registry.send_to(connection_id, frame.clone()).await {
                sent += 1;
            } else {
                failed = true;
            }
        }
    }

    if failed {
        UnitDisposition::Failed
    } else {
        UnitDisposition::Delivered { sent }
    }
}

fn backoff_delay(attempts: u32, cap: Duration) -> Duration {
    let exponential = Duration::from_secs(2u64.saturating_pow(attempts.min(31)));
    exponential.min(cap)
}
