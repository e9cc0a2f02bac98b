//! Telemetry aggregation for the gateway.
//!
//! The [`Aggregator`] keeps running counters, per-key error counts and
//! per-key method/service statistics for one reporting window. A window
//! closes on the periodic timer, when the cached event count reaches the
//! configured threshold, or at shutdown; each flush serializes the collected
//! categories with the selected formatter, hands them to the
//! [`TelemetrySink`], and resets the window. The `websocket_connections`
//! gauge survives flushes.
//!
//! Recording is best-effort and never blocks request processing: sink
//! failures are the sink's problem, and every record operation only takes a
//! short-lived mutex.

mod format;
mod parse;
mod stats;

pub use format::TelemetryFormat;
pub use stats::{LatencySummary, MethodStats, MetricData};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use parse::{classify, MetricClass};

/// Sentinel event name for API-level errors; bumps the per-API error count.
pub const API_ERROR_EVENT: &str = "AppGw_ApiError";

/// Sentinel event name for external-service errors.
pub const SERVICE_ERROR_EVENT: &str = "AppGw_ExternalServiceError";

/// Receives serialized telemetry reports.
///
/// Implementations must not block; delivery failures are discarded.
pub trait TelemetrySink: Send + Sync {
    fn send(&self, marker: &str, payload: &str);
}

/// Aggregator settings.
#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    pub reporting_interval: Duration,
    pub cache_threshold: u32,
    pub format: TelemetryFormat,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            reporting_interval: Duration::from_secs(60),
            cache_threshold: 25,
            format: TelemetryFormat::Json,
        }
    }
}

/// Per-window aggregation state, reset at every flush.
#[derive(Debug, Default)]
pub(crate) struct Window {
    pub(crate) total_calls: u64,
    pub(crate) successful_calls: u64,
    pub(crate) failed_calls: u64,
    pub(crate) api_error_counts: BTreeMap<String, u32>,
    pub(crate) external_service_error_counts: BTreeMap<String, u32>,
    pub(crate) api_method_stats: BTreeMap<String, MethodStats>,
    pub(crate) service_method_stats: BTreeMap<String, MethodStats>,
    pub(crate) metrics_cache: BTreeMap<String, MetricData>,
    pub(crate) cached_event_count: u32,
}

impl Window {
    fn has_data(&self) -> bool {
        self.total_calls != 0
            || self.successful_calls != 0
            || self.failed_calls != 0
            || !self.api_error_counts.is_empty()
            || !self.external_service_error_counts.is_empty()
            || !self.api_method_stats.is_empty()
            || !self.service_method_stats.is_empty()
            || !self.metrics_cache.is_empty()
    }
}

/// Thread-safe telemetry aggregator shared across the gateway.
pub struct Aggregator {
    window: Mutex<Window>,
    websocket_connections: AtomicI64,
    sink: Arc<dyn TelemetrySink>,
    options: TelemetryOptions,
}

impl Aggregator {
    pub fn new(sink: Arc<dyn TelemetrySink>, options: TelemetryOptions) -> Arc<Self> {
        Arc::new(Self {
            window: Mutex::new(Window::default()),
            websocket_connections: AtomicI64::new(0),
            sink,
            options,
        })
    }

    // ── Gauge and call counters ──────────────────────────────────────────

    pub fn connection_opened(&self) {
        self.websocket_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.websocket_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn call_received(&self) {
        self.window.lock().unwrap().total_calls += 1;
    }

    pub fn call_completed(&self, success: bool) {
        let mut window = self.window.lock().unwrap();
        if success {
            window.successful_calls += 1;
        } else {
            window.failed_calls += 1;
        }
    }

    // ── Record operations ────────────────────────────────────────────────

    /// Record a named event.
    ///
    /// The two sentinel names bump the corresponding per-key error count and
    /// forward the raw event to the sink immediately; any other name only
    /// bumps the cached event count, which can trigger a threshold flush.
    pub fn record_event(&self, name: &str, json_data: &str) {
        match name {
            API_ERROR_EVENT => {
                self.bump_error_count(name, json_data, "api");
                self.sink.send(name, json_data);
            }
            SERVICE_ERROR_EVENT => {
                self.bump_error_count(name, json_data, "service");
                self.sink.send(name, json_data);
            }
            _ => {
                let should_flush = {
                    let mut window = self.window.lock().unwrap();
                    window.cached_event_count += 1;
                    window.cached_event_count >= self.options.cache_threshold
                };
                if should_flush {
                    trace!(event = name, "event cache threshold reached");
                    self.flush();
                }
            }
        }
    }

    fn bump_error_count(&self, name: &str, json_data: &str, field: &str) {
        let Some(key) = serde_json::from_str::<serde_json::Value>(json_data)
            .ok()
            .and_then(|value| value.get(field).and_then(|v| v.as_str()).map(String::from))
        else {
            warn!(event = name, "error event without '{field}' field, not counted");
            return;
        };
        let mut window = self.window.lock().unwrap();
        let counts = if field == "api" {
            &mut window.api_error_counts
        } else {
            &mut window.external_service_error_counts
        };
        *counts.entry(key).or_insert(0) += 1;
    }

    /// Record a metric sample.
    ///
    /// Structured names (see the pattern order in the parser) route to the
    /// per-key method/service statistics; anything else lands in the generic
    /// metric cache under its full name.
    pub fn record_metric(&self, name: &str, value: f64, unit: &str) {
        let mut window = self.window.lock().unwrap();
        match classify(name) {
            MetricClass::ApiMethod { key, success } => {
                let stats = window.api_method_stats.entry(key).or_default();
                if success {
                    stats.record_success(value);
                } else {
                    stats.record_error(value);
                }
            }
            MetricClass::ServiceMethod { key, success } => {
                let stats = window.service_method_stats.entry(key).or_default();
                if success {
                    stats.record_success(value);
                } else {
                    stats.record_error(value);
                }
            }
            MetricClass::ApiLatency { key } => {
                window
                    .api_method_stats
                    .entry(key)
                    .or_default()
                    .record_latency(value);
            }
            MetricClass::ServiceLatency { key } => {
                window
                    .service_method_stats
                    .entry(key)
                    .or_default()
                    .record_latency(value);
            }
            MetricClass::Generic => {
                window
                    .metrics_cache
                    .entry(name.to_owned())
                    .and_modify(|data| data.record(value))
                    .or_insert_with(|| MetricData::new(value, unit));
            }
        }
    }

    // ── Flushing ─────────────────────────────────────────────────────────

    /// Close the current window: serialize and transmit every non-empty
    /// category, then reset per-window state. An empty window produces no
    /// outgoing messages. The connection gauge is reported but never reset.
    pub fn flush(&self) {
        let (window, has_data) = {
            let mut guard = self.window.lock().unwrap();
            let has_data = guard.has_data();
            (std::mem::take(&mut *guard), has_data)
        };
        if !has_data {
            return;
        }

        let gauge = self.websocket_connections.load(Ordering::Relaxed);
        let fmt = self.options.format;
        debug!(format = %fmt, "flushing telemetry window");

        self.sink
            .send("AppGw_Counters", &format::counters(fmt, gauge, &window));
        if !window.api_error_counts.is_empty() {
            self.sink.send(
                "AppGw_ApiErrors",
                &format::error_counts(fmt, "api", &window.api_error_counts),
            );
        }
        if !window.external_service_error_counts.is_empty() {
            self.sink.send(
                "AppGw_ServiceErrors",
                &format::error_counts(fmt, "service", &window.external_service_error_counts),
            );
        }
        if !window.api_method_stats.is_empty() {
            self.sink.send(
                "AppGw_ApiMethodStats",
                &format::method_stats(fmt, &window.api_method_stats),
            );
        }
        if !window.service_method_stats.is_empty() {
            self.sink.send(
                "AppGw_ServiceMethodStats",
                &format::method_stats(fmt, &window.service_method_stats),
            );
        }
        if !window.metrics_cache.is_empty() {
            self.sink
                .send("AppGw_Metrics", &format::metrics(fmt, &window.metrics_cache));
        }
    }

    /// Start the periodic flush task. Cancelling the token performs a final
    /// flush before the task exits.
    pub fn spawn_flush_task(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let aggregator = self.clone();
        let period = self.options.reporting_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately; skip it.
            interval.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        aggregator.flush();
                        break;
                    }
                    _ = interval.tick() => aggregator.flush(),
                }
            }
        })
    }

    // ── Introspection ────────────────────────────────────────────────────

    pub fn websocket_connections(&self) -> i64 {
        self.websocket_connections.load(Ordering::Relaxed)
    }

    /// `(total, successful, failed)` call counters of the open window.
    pub fn call_counters(&self) -> (u64, u64, u64) {
        let window = self.window.lock().unwrap();
        (
            window.total_calls,
            window.successful_calls,
            window.failed_calls,
        )
    }

    pub fn api_method_stats(&self, key: &str) -> Option<MethodStats> {
        self.window.lock().unwrap().api_method_stats.get(key).cloned()
    }

    pub fn service_method_stats(&self, key: &str) -> Option<MethodStats> {
        self.window
            .lock()
            .unwrap()
            .service_method_stats
            .get(key)
            .cloned()
    }

    pub fn api_error_count(&self, api: &str) -> u32 {
        self.window
            .lock()
            .unwrap()
            .api_error_counts
            .get(api)
            .copied()
            .unwrap_or(0)
    }

    pub fn service_error_count(&self, service: &str) -> u32 {
        self.window
            .lock()
            .unwrap()
            .external_service_error_counts
            .get(service)
            .copied()
            .unwrap_or(0)
    }

    pub fn metric(&self, name: &str) -> Option<MetricData> {
        self.window.lock().unwrap().metrics_cache.get(name).cloned()
    }

    pub fn cached_event_count(&self) -> u32 {
        self.window.lock().unwrap().cached_event_count
    }
}
