use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

pub struct RelayMetrics {
    ws_duration_count: Mutex<HashMap<String, u64>>,
    ws_duration_sum_ms: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    ws_rate_total: Mutex<HashMap<String, u64>>,
    connections_current: AtomicI64,
    connections_rejected_total: Mutex<HashMap<String, u64>>,
    throttle_violations_total: AtomicU64,
    ip_bans_total: AtomicU64,
    broadcast_queue_depth: AtomicI64,
    broadcast_messages_total: Mutex<HashMap<String, u64>>,
    delivery_retries_total: AtomicU64,
}

const BROADCAST_STATES: [&str; 4] = ["queued", "dispatched", "expired", "dropped"];
static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

impl Default for RelayMetrics {
    fn default() -> Self {
        let mut broadcast_messages_total = HashMap::new();
        for state in BROADCAST_STATES {
            broadcast_messages_total.insert(state.to_string(), 0);
        }

        Self {
            ws_duration_count: Mutex::new(HashMap::new()),
            ws_duration_sum_ms: Mutex::new(HashMap::new()),
            ws_errors_total: Mutex::new(HashMap::new()),
            ws_rate_total: Mutex::new(HashMap::new()),
            connections_current: AtomicI64::new(0),
            connections_rejected_total: Mutex::new(HashMap::new()),
            throttle_violations_total: AtomicU64::new(0),
            ip_bans_total: AtomicU64::new(0),
            broadcast_queue_depth: AtomicI64::new(0),
            broadcast_messages_total: Mutex::new(broadcast_messages_total),
            delivery_retries_total: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_ws_request(endpoint: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_request(endpoint, is_error, latency_ms);
    }
}

pub fn connection_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.connection_opened();
    }
}

pub fn connection_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.connection_closed();
    }
}

pub fn record_rejection(reason: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_rejection(reason);
    }
}

pub fn record_throttle_violation() {
    if let Some(metrics) = global_metrics() {
        metrics.record_throttle_violation();
    }
}

pub fn record_ip_ban() {
    if let Some(metrics) = global_metrics() {
        metrics.record_ip_ban();
    }
}

pub fn set_broadcast_queue_depth(depth: i64) {
    if let Some(metrics) = global_metrics() {
        metrics.set_broadcast_queue_depth(depth);
    }
}

pub fn record_broadcast_outcome(state: &str, count: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_broadcast_outcome(state, count);
    }
}

pub fn record_delivery_retry() {
    if let Some(metrics) = global_metrics() {
        metrics.record_delivery_retry();
    }
}

pub fn render_global() -> String {
    global_metrics().map(|metrics| metrics.render_prometheus()).unwrap_or_default()
}

impl RelayMetrics {
    pub fn record_ws_request(&self, endpoint: &str, is_error: bool, latency_ms: u64) {
        increment_label_counter(&self.ws_rate_total, endpoint, 1);
        increment_label_counter(&self.ws_duration_sum_ms, endpoint, latency_ms);
        increment_label_counter(&self.ws_duration_count, endpoint, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, endpoint, 1);
        }
    }

    pub fn connection_opened(&self) {
        self.connections_current.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_closed(&self) {
        self.connections_current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn record_rejection(&self, reason: &str) {
        increment_label_counter(&self.connections_rejected_total, reason, 1);
    }

    pub fn record_throttle_violation(&self) {
        self.throttle_violations_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_ip_ban(&self) {
        self.ip_bans_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_broadcast_queue_depth(&self, depth: i64) {
        self.broadcast_queue_depth.store(depth.max(0), Ordering::SeqCst);
    }

    pub fn record_broadcast_outcome(&self, state: &str, count: u64) {
        increment_label_counter(&self.broadcast_messages_total, state, count);
    }

    pub fn record_delivery_retry(&self) {
        self.delivery_retries_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_ws_rate_total Total websocket frames by command.\n");
        output.push_str("# TYPE relay_ws_rate_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_rate_total", &self.ws_rate_total);

        output.push_str("# HELP relay_ws_errors_total Total websocket frame errors by command.\n");
        output.push_str("# TYPE relay_ws_errors_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_errors_total", &self.ws_errors_total);

        output.push_str("# HELP relay_ws_duration_ms_sum Sum of frame handling latency in milliseconds by command.\n");
        output.push_str("# TYPE relay_ws_duration_ms_sum counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_duration_ms_sum",
            &self.ws_duration_sum_ms,
        );

        output.push_str(
            "# HELP relay_ws_duration_ms_count Count of frame latency samples by command.\n",
        );
        output.push_str("# TYPE relay_ws_duration_ms_count counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_duration_ms_count",
            &self.ws_duration_count,
        );

        output.push_str("# HELP relay_connections_current Currently registered connections.\n");
        output.push_str("# TYPE relay_connections_current gauge\n");
        output.push_str(&format!(
            "relay_connections_current {}\n",
            self.connections_current.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP relay_connections_rejected_total Rejected connections by reason.\n");
        output.push_str("# TYPE relay_connections_rejected_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_connections_rejected_total",
            &self.connections_rejected_total,
        );

        output.push_str("# HELP relay_throttle_violations_total Total throttle violations.\n");
        output.push_str("# TYPE relay_throttle_violations_total counter\n");
        output.push_str(&format!(
            "relay_throttle_violations_total {}\n",
            self.throttle_violations_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP relay_ip_bans_total Total temporary IP bans issued.\n");
        output.push_str("# TYPE relay_ip_bans_total counter\n");
        output.push_str(&format!(
            "relay_ip_bans_total {}\n",
            self.ip_bans_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP relay_broadcast_queue_depth Messages waiting in batches.\n");
        output.push_str("# TYPE relay_broadcast_queue_depth gauge\n");
        output.push_str(&format!(
            "relay_broadcast_queue_depth {}\n",
            self.broadcast_queue_depth.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP relay_broadcast_messages_total Broadcast messages by outcome.\n");
        output.push_str("# TYPE relay_broadcast_messages_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_broadcast_messages_total",
            &self.broadcast_messages_total,
        );

        output.push_str("# HELP relay_delivery_retries_total Total delivery unit retries.\n");
        output.push_str("# TYPE relay_delivery_retries_total counter\n");
        output.push_str(&format!(
            "relay_delivery_retries_total {}\n",
            self.delivery_retries_total.load(Ordering::SeqCst)
        ));

        output
    }
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, amount: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(amount);
}

fn append_label_counter_lines(output: &mut String, name: &str, map: &Mutex<HashMap<String, u64>>) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    for (label, value) in entries {
        output.push_str(&format!("{name}{{label=\"{label}\"}} {value}\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::RelayMetrics;

    #[test]
    fn ws_requests_accumulate_by_command() {
        let metrics = RelayMetrics::default();
        metrics.record_ws_request("subscribe", false, 5);
        metrics.record_ws_request("subscribe", true, 7);
        metrics.record_ws_request("ping", false, 1);

        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("relay_ws_rate_total{label=\"subscribe\"} 2"));
        assert!(rendered.contains("relay_ws_errors_total{label=\"subscribe\"} 1"));
        assert!(rendered.contains("relay_ws_duration_ms_sum{label=\"subscribe\"} 12"));
        assert!(rendered.contains("relay_ws_rate_total{label=\"ping\"} 1"));
    }

    #[test]
    fn connection_gauge_tracks_open_and_close() {
        let metrics = RelayMetrics::default();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();

        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("relay_connections_current 1"));
    }

    #[test]
    fn broadcast_outcomes_start_at_zero() {
        let metrics = RelayMetrics::default();
        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("relay_broadcast_messages_total{label=\"dispatched\"} 0"));

        metrics.record_broadcast_outcome("dispatched", 3);
        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("relay_broadcast_messages_total{label=\"dispatched\"} 3"));
    }
}
