use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

/// Process-wide relay counters, rendered in Prometheus text format.
#[derive(Default)]
pub struct RelayMetrics {
    connections_opened_total: AtomicU64,
    connections_closed_total: AtomicU64,
    active_connections: AtomicI64,
    active_sessions: AtomicI64,
    frames_received_total: Mutex<HashMap<String, u64>>,
    frames_dropped_total: AtomicU64,
    heartbeat_timeouts_total: AtomicU64,
    persist_failures_total: Mutex<HashMap<String, u64>>,
    content_saves_total: AtomicU64,
}

const PERSIST_OPERATIONS: [&str; 3] = ["bind_state", "write_state", "save_content"];
static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

pub fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_connection_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.record_connection_opened();
    }
}

pub fn record_connection_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.record_connection_closed();
    }
}

pub fn set_active_sessions(count: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.set_active_sessions(count);
    }
}

pub fn record_frame_received(message_type: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_frame_received(message_type);
    }
}

pub fn record_frame_dropped() {
    if let Some(metrics) = global_metrics() {
        metrics.frames_dropped_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn record_heartbeat_timeout() {
    if let Some(metrics) = global_metrics() {
        metrics.heartbeat_timeouts_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn record_persist_failure(operation: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_persist_failure(operation);
    }
}

pub fn record_content_saved() {
    if let Some(metrics) = global_metrics() {
        metrics.content_saves_total.fetch_add(1, Ordering::SeqCst);
    }
}

impl RelayMetrics {
    pub fn record_connection_opened(&self) {
        self.connections_opened_total.fetch_add(1, Ordering::SeqCst);
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed_total.fetch_add(1, Ordering::SeqCst);
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn set_active_sessions(&self, count: usize) {
        self.active_sessions.store(count as i64, Ordering::SeqCst);
    }

    pub fn record_frame_received(&self, message_type: &str) {
        increment_label_counter(&self.frames_received_total, message_type, 1);
    }

    pub fn record_persist_failure(&self, operation: &str) {
        let normalized = operation.trim().to_ascii_lowercase();
        let label = if PERSIST_OPERATIONS.contains(&normalized.as_str()) {
            normalized
        } else {
            "unknown".to_string()
        };
        increment_label_counter(&self.persist_failures_total, &label, 1);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP cosync_connections_opened_total WebSocket connections accepted.\n");
        output.push_str("# TYPE cosync_connections_opened_total counter\n");
        output.push_str(&format!(
            "cosync_connections_opened_total {}\n",
            self.connections_opened_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP cosync_connections_closed_total WebSocket connections closed.\n");
        output.push_str("# TYPE cosync_connections_closed_total counter\n");
        output.push_str(&format!(
            "cosync_connections_closed_total {}\n",
            self.connections_closed_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP cosync_active_connections Currently open connections.\n");
        output.push_str("# TYPE cosync_active_connections gauge\n");
        output.push_str(&format!(
            "cosync_active_connections {}\n",
            self.active_connections.load(Ordering::SeqCst).max(0)
        ));

        output.push_str("# HELP cosync_active_sessions Documents with at least one connection.\n");
        output.push_str("# TYPE cosync_active_sessions gauge\n");
        output.push_str(&format!(
            "cosync_active_sessions {}\n",
            self.active_sessions.load(Ordering::SeqCst).max(0)
        ));

        output.push_str("# HELP cosync_frames_received_total Inbound frames by message type.\n");
        output.push_str("# TYPE cosync_frames_received_total counter\n");
        append_label_lines(
            &mut output,
            "cosync_frames_received_total",
            "type",
            &self.frames_received_total,
        );

        output.push_str("# HELP cosync_frames_dropped_total Malformed inbound frames dropped.\n");
        output.push_str("# TYPE cosync_frames_dropped_total counter\n");
        output.push_str(&format!(
            "cosync_frames_dropped_total {}\n",
            self.frames_dropped_total.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP cosync_heartbeat_timeouts_total Connections closed for a missed pong.\n",
        );
        output.push_str("# TYPE cosync_heartbeat_timeouts_total counter\n");
        output.push_str(&format!(
            "cosync_heartbeat_timeouts_total {}\n",
            self.heartbeat_timeouts_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP cosync_persist_failures_total Failed persistence calls.\n");
        output.push_str("# TYPE cosync_persist_failures_total counter\n");
        append_label_lines(
            &mut output,
            "cosync_persist_failures_total",
            "operation",
            &self.persist_failures_total,
        );

        output.push_str("# HELP cosync_content_saves_total Debounced content saves completed.\n");
        output.push_str("# TYPE cosync_content_saves_total counter\n");
        output.push_str(&format!(
            "cosync_content_saves_total {}\n",
            self.content_saves_total.load(Ordering::SeqCst)
        ));

        output
    }
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_label_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::RelayMetrics;

    #[test]
    fn render_prometheus_includes_connection_and_persistence_metrics() {
        let metrics = RelayMetrics::default();
        metrics.record_connection_opened();
        metrics.record_connection_opened();
        metrics.record_connection_closed();
        metrics.set_active_sessions(1);
        metrics.record_frame_received("sync");
        metrics.record_frame_received("sync");
        metrics.record_frame_received("awareness");
        metrics.record_persist_failure("write_state");
        metrics.record_persist_failure("not-an-operation");

        let rendered = metrics.render_prometheus();

        assert!(rendered.contains("cosync_connections_opened_total 2"));
        assert!(rendered.contains("cosync_connections_closed_total 1"));
        assert!(rendered.contains("cosync_active_connections 1"));
        assert!(rendered.contains("cosync_active_sessions 1"));
        assert!(rendered.contains("cosync_frames_received_total{type=\"sync\"} 2"));
        assert!(rendered.contains("cosync_frames_received_total{type=\"awareness\"} 1"));
        assert!(rendered.contains("cosync_frames_dropped_total 0"));
        assert!(rendered.contains("cosync_persist_failures_total{operation=\"write_state\"} 1"));
        assert!(rendered.contains("cosync_persist_failures_total{operation=\"unknown\"} 1"));
    }

    #[test]
    fn label_values_are_escaped() {
        let metrics = RelayMetrics::default();
        metrics.record_frame_received("we\"ird");
        assert!(metrics.render_prometheus().contains("type=\"we\\\"ird\""));
    }
}
