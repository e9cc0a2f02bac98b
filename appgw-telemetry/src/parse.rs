//! Structured metric name parsing.
//!
//! Metric names produced by the gateway and its plugins follow literal
//! patterns, all starting with `AppGw_PluginName_<P>_` and ending in
//! `_split`. Patterns are tried in a fixed order (API method, then service
//! method, then API latency, then service latency) and the first full match
//! wins; a name that satisfies none of them is treated as a generic metric.

/// Classification result for one metric name.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum MetricClass {
    /// `AppGw_PluginName_<P>_MethodName_<M>_{Success|Error}_split`
    ApiMethod { key: String, success: bool },
    /// `AppGw_PluginName_<P>_ServiceName_<S>_{Success|Error}_split`
    ServiceMethod { key: String, success: bool },
    /// `AppGw_PluginName_<P>_ApiName_<A>_ApiLatency_split`
    ApiLatency { key: String },
    /// `AppGw_PluginName_<P>_ServiceName_<S>_ServiceLatency_split`
    ServiceLatency { key: String },
    Generic,
}

const PREFIX: &str = "AppGw_PluginName_";
const SUFFIX: &str = "_split";

pub(crate) fn classify(name: &str) -> MetricClass {
    let Some(body) = name
        .strip_prefix(PREFIX)
        .and_then(|rest| rest.strip_suffix(SUFFIX))
    else {
        return MetricClass::Generic;
    };

    if let Some((plugin, rest)) = split_marker(body, "_MethodName_") {
        if let Some(method) = outcome_name(rest, "_Success") {
            return MetricClass::ApiMethod {
                key: stat_key(plugin, method),
                success: true,
            };
        }
        if let Some(method) = outcome_name(rest, "_Error") {
            return MetricClass::ApiMethod {
                key: stat_key(plugin, method),
                success: false,
            };
        }
    }

    if let Some((plugin, rest)) = split_marker(body, "_ServiceName_") {
        if let Some(service) = outcome_name(rest, "_Success") {
            return MetricClass::ServiceMethod {
                key: stat_key(plugin, service),
                success: true,
            };
        }
        if let Some(service) = outcome_name(rest, "_Error") {
            return MetricClass::ServiceMethod {
                key: stat_key(plugin, service),
                success: false,
            };
        }
    }

    if let Some((plugin, rest)) = split_marker(body, "_ApiName_") {
        if let Some(api) = outcome_name(rest, "_ApiLatency") {
            return MetricClass::ApiLatency {
                key: stat_key(plugin, api),
            };
        }
    }

    if let Some((plugin, rest)) = split_marker(body, "_ServiceName_") {
        if let Some(service) = outcome_name(rest, "_ServiceLatency") {
            return MetricClass::ServiceLatency {
                key: stat_key(plugin, service),
            };
        }
    }

    MetricClass::Generic
}

/// Split `body` around a marker that must occur exactly once, with non-empty
/// text on both sides. A repeated marker makes the name ambiguous for this
/// pattern.
fn split_marker<'a>(body: &'a str, marker: &str) -> Option<(&'a str, &'a str)> {
    let mut occurrences = body.match_indices(marker);
    let (index, _) = occurrences.next()?;
    if occurrences.next().is_some() {
        return None;
    }
    let plugin = &body[..index];
    let rest = &body[index + marker.len()..];
    (!plugin.is_empty() && !rest.is_empty()).then_some((plugin, rest))
}

fn outcome_name<'a>(rest: &'a str, suffix: &str) -> Option<&'a str> {
    rest.strip_suffix(suffix).filter(|name| !name.is_empty())
}

fn stat_key(plugin: &str, name: &str) -> String {
    format!("{plugin}|{name}")
}
