// Violation tracking and temporary IP bans.
//
// Per-connection window checks live on the registry; this guard owns the
// escalation path: repeated denials within the ban window get the source IP
// banned, and banned IPs are turned away before a connection is registered.
// Counters are process-local by design.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct GuardState {
    violations: HashMap<IpAddr, Vec<DateTime<Utc>>>,
    bans: HashMap<IpAddr, DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationOutcome {
    Recorded { count: usize },
    Banned,
}

#[derive(Clone)]
pub struct ThrottleGuard {
    state: Arc<RwLock<GuardState>>,
    ban_duration: Duration,
    max_violations: usize,
}

impl ThrottleGuard {
    pub fn new(ban_duration_secs: u64, max_violations: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(GuardState::default())),
            ban_duration: Duration::seconds(ban_duration_secs as i64),
            max_violations: max_violations.max(1),
        }
    }

    /// Whether admission attempts from this IP must be rejected outright.
    /// Expired bans are pruned on the way through.
    pub async fn is_banned(&self, ip: IpAddr) -> bool {
        let mut guard = self.state.write().await;
        match guard.bans.get(&ip) {
            Some(expires_at) if *expires_at > Utc::now() => true,
            Some(_) => {
                guard.bans.remove(&ip);
                false
            }
            None => false,
        }
    }

    /// Record a throttle violation. Violations older than the ban window
    /// are forgotten; reaching the threshold bans the IP for the same
    /// window.
    pub async fn record_violation(&self, ip: IpAddr) -> ViolationOutcome {
        self.record_violation_at(ip, Utc::now()).await
    }

    async fn record_violation_at(&self, ip: IpAddr, at: DateTime<Utc>) -> ViolationOutcome {
        let mut guard = self.state.write().await;
        let cutoff = at - self.ban_duration;
        let entries = guard.violations.entry(ip).or_default();
        entries.retain(|recorded_at| *recorded_at > cutoff);
        entries.push(at);

        if entries.len() >= self.max_violations {
            entries.clear();
            guard.bans.insert(ip, at + self.ban_duration);
            ViolationOutcome::Banned
        } else {
            ViolationOutcome::Recorded { count: entries.len() }
        }
    }
}
