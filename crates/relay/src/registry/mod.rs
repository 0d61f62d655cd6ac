// Connection registry: the single source of truth for live connections.
//
// Admission caps, per-connection throttle windows, outbound senders, and
// lifecycle state all live here. Every mutating operation takes the write
// lock for exactly one map operation; nothing is awaited while a guard is
// held.

use chrono::{DateTime, Utc};
use fanline_common::protocol::ws::ServerFrame;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

pub type ConnectionId = Uuid;

const THROTTLE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Subscribed,
    Reconnecting,
    Error,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub global: usize,
    pub per_ip: usize,
    pub per_user: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self { global: 1000, per_ip: 5, per_user: 3 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub messages_per_second: u32,
    pub bytes_per_second: u64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self { messages_per_second: 100, bytes_per_second: 1_048_576 }
    }
}

/// Which admission cap turned a connection away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRejection {
    GlobalLimit,
    IpLimit,
    UserLimit,
}

impl AdmissionRejection {
    /// Reason string carried in the `connection_rejected` frame. All cap
    /// rejections share one wire reason; the variant is for logs.
    pub const fn reason(self) -> &'static str {
        "connection_limit_exceeded"
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::GlobalLimit => "global_limit",
            Self::IpLimit => "ip_limit",
            Self::UserLimit => "user_limit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Allowed,
    Denied(DenialKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialKind {
    MessageRateExceeded,
    BandwidthExceeded,
}

impl DenialKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MessageRateExceeded => "message_rate_exceeded",
            Self::BandwidthExceeded => "bandwidth_exceeded",
        }
    }
}

#[derive(Debug)]
struct ThrottleWindow {
    messages: u32,
    bytes: u64,
    window_started_at: Instant,
}

impl ThrottleWindow {
    fn new() -> Self {
        Self { messages: 0, bytes: 0, window_started_at: Instant::now() }
    }
}

#[derive(Debug)]
struct ConnectionRecord {
    ip: IpAddr,
    user_id: Option<String>,
    state: ConnectionState,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    message_count: u64,
    bytes_received: u64,
    throttle: ThrottleWindow,
    outbound: Option<mpsc::UnboundedSender<ServerFrame>>,
}

#[derive(Debug, Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionRecord>,
    per_ip: HashMap<IpAddr, usize>,
    per_user: HashMap<String, usize>,
}

/// Record handed back from [`ConnectionRegistry::remove`] so the caller can
/// finish cleanup elsewhere (channel memberships live in the directory).
#[derive(Debug, Clone)]
pub struct RemovedConnection {
    pub ip: IpAddr,
    pub user_id: Option<String>,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    state: Arc<RwLock<RegistryState>>,
    limits: ConnectionLimits,
    rate: RateLimits,
}

impl ConnectionRegistry {
    pub fn new(limits: ConnectionLimits, rate: RateLimits) -> Self {
        Self { state: Arc::new(RwLock::new(RegistryState::default())), limits, rate }
    }

    /// Admit a new connection, enforcing the global, per-IP, and per-user
    /// caps in that order. Check and insert happen in one critical section
    /// so concurrent admissions cannot oversubscribe a cap.
    pub async fn register(
        &self,
        ip: IpAddr,
        user_id: Option<String>,
    ) -> Result<ConnectionId, AdmissionRejection> {
        let mut guard = self.state.write().await;

        if guard.connections.len() >= self.limits.global {
            return Err(AdmissionRejection::GlobalLimit);
        }
        if guard.per_ip.get(&ip).copied().unwrap_or(0) >= self.limits.per_ip {
            return Err(AdmissionRejection::IpLimit);
        }
        if let Some(user) = &user_id {
            if guard.per_user.get(user).copied().unwrap_or(0) >= self.limits.per_user {
                return Err(AdmissionRejection::UserLimit);
            }
        }

        let connection_id = Uuid::new_v4();
        let now = Utc::now();
        guard.connections.insert(
            connection_id,
            ConnectionRecord {
                ip,
                user_id: user_id.clone(),
                state: ConnectionState::Connecting,
                connected_at: now,
                last_activity: now,
                message_count: 0,
                bytes_received: 0,
                throttle: ThrottleWindow::new(),
                outbound: None,
            },
        );
        *guard.per_ip.entry(ip).or_insert(0) += 1;
        if let Some(user) = user_id {
            *guard.per_user.entry(user).or_insert(0) += 1;
        }

        Ok(connection_id)
    }

    /// Drop a connection record and release its cap counters. Idempotent:
    /// removing an unknown connection is a no-op.
    pub async fn remove(&self, connection_id: ConnectionId) -> Option<RemovedConnection> {
        let mut guard = self.state.write().await;
        let record = guard.connections.remove(&connection_id)?;

        if let Some(count) = guard.per_ip.get_mut(&record.ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                guard.per_ip.remove(&record.ip);
            }
        }
        if let Some(user) = &record.user_id {
            if let Some(count) = guard.per_user.get_mut(user) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    guard.per_user.remove(user);
                }
            }
        }

        Some(RemovedConnection { ip: record.ip, user_id: record.user_id })
    }

    /// Record an inbound frame: bumps lifetime counters and last activity.
    pub async fn note_inbound(&self, connection_id: ConnectionId, bytes: u64) {
        let mut guard = self.state.write().await;
        if let Some(record) = guard.connections.get_mut(&connection_id) {
            record.message_count += 1;
            record.bytes_received += bytes;
            record.last_activity = Utc::now();
        }
    }

    pub async fn record_activity(&self, connection_id: ConnectionId) {
        let mut guard = self.state.write().await;
        if let Some(record) = guard.connections.get_mut(&connection_id) {
            record.last_activity = Utc::now();
        }
    }

    /// Fixed-window admission check: the window resets one second after it
    /// started, then the message counter and byte counter are charged in
    /// that order.
    pub async fn admit_frame(
        &self,
        connection_id: ConnectionId,
        message_bytes: u64,
    ) -> ThrottleDecision {
        let mut guard = self.state.write().await;
        let Some(record) = guard.connections.get_mut(&connection_id) else {
            // Connection already torn down; the frame is going nowhere.
            return ThrottleDecision::Allowed;
        };

        let now = Instant::now();
        if now.duration_since(record.throttle.window_started_at) >= THROTTLE_WINDOW {
            record.throttle.messages = 0;
            record.throttle.bytes = 0;
            record.throttle.window_started_at = now;
        }

        record.throttle.messages += 1;
        if record.throttle.messages > self.rate.messages_per_second {
            return ThrottleDecision::Denied(DenialKind::MessageRateExceeded);
        }

        record.throttle.bytes += message_bytes;
        if record.throttle.bytes > self.rate.bytes_per_second {
            return ThrottleDecision::Denied(DenialKind::BandwidthExceeded);
        }

        ThrottleDecision::Allowed
    }

    pub async fn attach_outbound(
        &self,
        connection_id: ConnectionId,
        sender: mpsc::UnboundedSender<ServerFrame>,
    ) -> bool {
        let mut guard = self.state.write().await;
        match guard.connections.get_mut(&connection_id) {
            Some(record) => {
                record.outbound = Some(sender);
                true
            }
            None => false,
        }
    }

    /// Push a frame onto a connection's outbound queue. Returns false when
    /// the connection is gone or its receiver has been dropped.
    pub async fn send_to(&self, connection_id: ConnectionId, frame: ServerFrame) -> bool {
        let sender = {
            let guard = self.state.read().await;
            guard.connections.get(&connection_id).and_then(|record| record.outbound.clone())
        };
        match sender {
            Some(sender) => sender.send(frame).is_ok(),
            None => false,
        }
    }

    pub async fn set_state(&self, connection_id: ConnectionId, state: ConnectionState) -> bool {
        let mut guard = self.state.write().await;
        match guard.connections.get_mut(&connection_id) {
            Some(record) => {
                record.state = state;
                true
            }
            None => false,
        }
    }

    pub async fn state_of(&self, connection_id: ConnectionId) -> Option<ConnectionState> {
        self.state.read().await.connections.get(&connection_id).map(|record| record.state)
    }

    pub async fn user_of(&self, connection_id: ConnectionId) -> Option<String> {
        self.state
            .read()
            .await
            .connections
            .get(&connection_id)
            .and_then(|record| record.user_id.clone())
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn connection_stats(&self, connection_id: ConnectionId) -> Option<ConnectionStats> {
        let guard = self.state.read().await;
        let record = guard.connections.get(&connection_id)?;
        let window_elapsed = record.throttle.window_started_at.elapsed();
        let reset_in_ms =
            THROTTLE_WINDOW.saturating_sub(window_elapsed).as_millis().min(u128::from(u64::MAX))
                as u64;

        Some(ConnectionStats {
            connection_id: connection_id.to_string(),
            ip: record.ip.to_string(),
            user_id: record.user_id.clone(),
            state: record.state,
            connected_at: record.connected_at.to_rfc3339(),
            uptime_seconds: (Utc::now() - record.connected_at).num_seconds().max(0),
            message_count: record.message_count,
            bytes_received: record.bytes_received,
            throttle: ThrottleStats {
                messages_used: record.throttle.messages,
                messages_limit: self.rate.messages_per_second,
                messages_remaining: self
                    .rate
                    .messages_per_second
                    .saturating_sub(record.throttle.messages),
                bytes_used: record.throttle.bytes,
                bytes_limit: self.rate.bytes_per_second,
                bytes_remaining: self.rate.bytes_per_second.saturating_sub(record.throttle.bytes),
                reset_in_ms,
            },
        })
    }

    pub async fn global_stats(&self) -> GlobalStats {
        let guard = self.state.read().await;
        GlobalStats {
            total_connections: guard.connections.len(),
            connections_by_ip: guard
                .per_ip
                .iter()
                .map(|(ip, count)| (ip.to_string(), *count))
                .collect(),
            connections_by_user: guard.per_user.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub connection_id: String,
    pub ip: String,
    pub user_id: Option<String>,
    pub state: ConnectionState,
    pub connected_at: String,
    pub uptime_seconds: i64,
    pub message_count: u64,
    pub bytes_received: u64,
    pub throttle: ThrottleStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThrottleStats {
    pub messages_used: u32,
    pub messages_limit: u32,
    pub messages_remaining: u32,
    pub bytes_used: u64,
    pub bytes_limit: u64,
    pub bytes_remaining: u64,
    pub reset_in_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalStats {
    pub total_connections: usize,
    pub connections_by_ip: HashMap<String, usize>,
    pub connections_by_user: HashMap<String, usize>,
}
