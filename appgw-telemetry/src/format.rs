//! Report formatters.
//!
//! Two value-equivalent output formats, selected at runtime: `Json` is
//! human-readable with named fields, `Compact` carries the same values
//! comma-separated, rendering arrays of records as `(v1,v2,…),(…)`. In both
//! formats a number equal to its integer truncation is emitted as an
//! integer, anything else with two decimals.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::stats::{LatencySummary, MethodStats, MetricData};
use crate::Window;

/// Wire format for flushed reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryFormat {
    #[default]
    Json,
    Compact,
}

impl std::str::FromStr for TelemetryFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "json" => Ok(TelemetryFormat::Json),
            "compact" => Ok(TelemetryFormat::Compact),
            other => Err(format!("unknown telemetry format '{other}'")),
        }
    }
}

impl std::fmt::Display for TelemetryFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TelemetryFormat::Json => write!(f, "json"),
            TelemetryFormat::Compact => write!(f, "compact"),
        }
    }
}

pub(crate) fn counters(format: TelemetryFormat, gauge: i64, window: &Window) -> String {
    match format {
        TelemetryFormat::Json => json!({
            "websocket_connections": gauge,
            "total_calls": window.total_calls,
            "successful_calls": window.successful_calls,
            "failed_calls": window.failed_calls,
        })
        .to_string(),
        TelemetryFormat::Compact => format!(
            "{gauge},{},{},{}",
            window.total_calls, window.successful_calls, window.failed_calls
        ),
    }
}

pub(crate) fn error_counts(
    format: TelemetryFormat,
    field: &str,
    counts: &BTreeMap<String, u32>,
) -> String {
    match format {
        TelemetryFormat::Json => {
            let entries: Vec<Value> = counts
                .iter()
                .map(|(name, count)| json!({ field: name, "count": count }))
                .collect();
            Value::Array(entries).to_string()
        }
        TelemetryFormat::Compact => counts
            .iter()
            .map(|(name, count)| format!("({name},{count})"))
            .collect::<Vec<_>>()
            .join(","),
    }
}

pub(crate) fn method_stats(format: TelemetryFormat, stats: &BTreeMap<String, MethodStats>) -> String {
    match format {
        TelemetryFormat::Json => {
            let entries: Vec<Value> = stats
                .iter()
                .map(|(key, stat)| {
                    json!({
                        "key": key,
                        "success_count": stat.success_count,
                        "error_count": stat.error_count,
                        "success_latency": latency_value(&stat.success_latency),
                        "error_latency": latency_value(&stat.error_latency),
                    })
                })
                .collect();
            Value::Array(entries).to_string()
        }
        TelemetryFormat::Compact => stats
            .iter()
            .map(|(key, stat)| {
                format!(
                    "({key},{},{},{},{},{},{},{},{})",
                    stat.success_count,
                    stat.error_count,
                    number_str(stat.success_latency.total),
                    number_str(stat.success_latency.min),
                    number_str(stat.success_latency.max),
                    number_str(stat.error_latency.total),
                    number_str(stat.error_latency.min),
                    number_str(stat.error_latency.max),
                )
            })
            .collect::<Vec<_>>()
            .join(","),
    }
}

pub(crate) fn metrics(format: TelemetryFormat, cache: &BTreeMap<String, MetricData>) -> String {
    match format {
        TelemetryFormat::Json => {
            let entries: Vec<Value> = cache
                .iter()
                .map(|(name, data)| {
                    json!({
                        "name": name,
                        "sum": number(data.sum),
                        "min": number(data.min),
                        "max": number(data.max),
                        "count": data.count,
                        "unit": data.unit,
                    })
                })
                .collect();
            Value::Array(entries).to_string()
        }
        TelemetryFormat::Compact => cache
            .iter()
            .map(|(name, data)| {
                format!(
                    "({name},{},{},{},{},{})",
                    number_str(data.sum),
                    number_str(data.min),
                    number_str(data.max),
                    data.count,
                    data.unit,
                )
            })
            .collect::<Vec<_>>()
            .join(","),
    }
}

fn latency_value(latency: &LatencySummary) -> Value {
    json!({
        "total": number(latency.total),
        "min": number(latency.min),
        "max": number(latency.max),
    })
}

/// JSON number following the integer-when-representable rule.
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.is_finite() && value.abs() < 9e15 {
        Value::from(value as i64)
    } else {
        Value::from((value * 100.0).round() / 100.0)
    }
}

/// Compact rendering of the same rule.
fn number_str(value: f64) -> String {
    if value.fract() == 0.0 && value.is_finite() && value.abs() < 9e15 {
        format!("{}", value as i64)
    } else {
        format!("{value:.2}")
    }
}
