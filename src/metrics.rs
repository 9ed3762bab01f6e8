//! Client-side metrics in Prometheus text format (RED: Rate, Errors, Duration).

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bounds of the duration histogram buckets in seconds. +Inf is the count.
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Buckets are stored non-cumulative and summed at render time.
#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let secs = duration.as_secs_f64();
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct OperationMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    duration: DurationHistogram,
}

/// Counters for one connection (or several, if shared). Lock-free apart from
/// the first insert of each operation name.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    operations: DashMap<&'static str, OperationMetrics>,
    /// Envelopes that could not be decoded.
    pub decode_errors: AtomicU64,
    /// Responses whose message id had no pending request (late or unsolicited).
    pub dropped_responses: AtomicU64,
    pub abandons: AtomicU64,
    pub connections: AtomicU64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_op<F: FnOnce(&OperationMetrics)>(&self, op: &'static str, f: F) {
        if let Some(m) = self.operations.get(op) {
            f(m.value());
            return;
        }
        f(self.operations.entry(op).or_default().value());
    }

    #[inline]
    pub fn inc_request(&self, op: &'static str) {
        self.with_op(op, |m| {
            m.requests.fetch_add(1, Ordering::Relaxed);
        });
    }

    #[inline]
    pub fn inc_error(&self, op: &'static str) {
        self.with_op(op, |m| {
            m.errors.fetch_add(1, Ordering::Relaxed);
        });
    }

    #[inline]
    pub fn inc_timeout(&self, op: &'static str) {
        self.with_op(op, |m| {
            m.timeouts.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn observe_duration(&self, op: &'static str, duration: Duration) {
        self.with_op(op, |m| m.duration.observe(duration));
    }

    #[inline]
    pub fn inc_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_dropped_response(&self) {
        self.dropped_responses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_abandon(&self) {
        self.abandons.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self, op: &str) -> u64 {
        self.operations
            .get(op)
            .map(|m| m.requests.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn errors(&self, op: &str) -> u64 {
        self.operations
            .get(op)
            .map(|m| m.errors.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn timeouts(&self, op: &str) -> u64 {
        self.operations
            .get(op)
            .map(|m| m.timeouts.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Prometheus exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut ops: Vec<&'static str> = self.operations.iter().map(|e| *e.key()).collect();
        ops.sort_unstable();

        out.push_str("# HELP ldapmux_connections_total Connections opened.\n");
        out.push_str("# TYPE ldapmux_connections_total counter\n");
        out.push_str(&format!(
            "ldapmux_connections_total {}\n",
            self.connections.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldapmux_decode_errors_total Envelopes that failed to decode.\n");
        out.push_str("# TYPE ldapmux_decode_errors_total counter\n");
        out.push_str(&format!(
            "ldapmux_decode_errors_total {}\n",
            self.decode_errors.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldapmux_dropped_responses_total Responses with no pending request.\n");
        out.push_str("# TYPE ldapmux_dropped_responses_total counter\n");
        out.push_str(&format!(
            "ldapmux_dropped_responses_total {}\n",
            self.dropped_responses.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldapmux_abandons_total Abandon requests sent.\n");
        out.push_str("# TYPE ldapmux_abandons_total counter\n");
        out.push_str(&format!(
            "ldapmux_abandons_total {}\n",
            self.abandons.load(Ordering::Relaxed)
        ));

        let counters: [(&str, &str, fn(&OperationMetrics) -> &AtomicU64); 3] = [
            ("ldapmux_requests_total", "Requests sent by operation.", |m| &m.requests),
            ("ldapmux_errors_total", "Failed requests by operation.", |m| &m.errors),
            ("ldapmux_timeouts_total", "Requests that timed out by operation.", |m| &m.timeouts),
        ];
        for (name, help, field) in counters {
            out.push_str(&format!("# HELP {} {}\n", name, help));
            out.push_str(&format!("# TYPE {} counter\n", name));
            for op in &ops {
                if let Some(m) = self.operations.get(op) {
                    out.push_str(&format!(
                        "{}{{op=\"{}\"}} {}\n",
                        name,
                        op,
                        field(m.value()).load(Ordering::Relaxed)
                    ));
                }
            }
        }

        out.push_str("# HELP ldapmux_request_duration_seconds Request duration in seconds by operation.\n");
        out.push_str("# TYPE ldapmux_request_duration_seconds histogram\n");
        for op in &ops {
            let Some(m) = self.operations.get(op) else {
                continue;
            };
            let hist = &m.duration;
            let count = hist.count.load(Ordering::Relaxed);
            let mut cum = 0u64;
            for (i, &le) in DURATION_BUCKETS.iter().enumerate() {
                cum += hist.buckets[i].load(Ordering::Relaxed);
                out.push_str(&format!(
                    "ldapmux_request_duration_seconds_bucket{{op=\"{}\",le=\"{}\"}} {}\n",
                    op, le, cum
                ));
            }
            out.push_str(&format!(
                "ldapmux_request_duration_seconds_bucket{{op=\"{}\",le=\"+Inf\"}} {}\n",
                op, count
            ));
            let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            out.push_str(&format!(
                "ldapmux_request_duration_seconds_sum{{op=\"{}\"}} {}\n",
                op, sum_secs
            ));
            out.push_str(&format!(
                "ldapmux_request_duration_seconds_count{{op=\"{}\"}} {}\n",
                op, count
            ));
        }

        out
    }
}
