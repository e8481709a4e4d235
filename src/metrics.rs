use std::collections::HashMap;

use crate::cache::CacheEntry;

pub const MESSAGES_RECEIVED: &str = "whatsapp_messages_received_total";
pub const TASKS_DISPATCHED: &str = "prospecting_tasks_dispatched_total";
pub const LEADS_SAVED: &str = "prospecting_leads_saved_total";
pub const TOOL_CALLS: &str = "agent_tool_calls_total";

/// Parse the unlabelled samples of a Prometheus text exposition.
///
/// Only `name value` lines are kept, where the name is made of word
/// characters and the value is a plain non-negative decimal. Comments, blank
/// lines and labelled series are skipped.
pub fn parse_metrics(text: &str) -> HashMap<String, f64> {
    let mut metrics = HashMap::new();
    for line in text.lines() {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(name), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        if !is_metric_name(name) || !is_plain_decimal(value) {
            continue;
        }
        if let Ok(v) = value.parse::<f64>() {
            metrics.insert(name.to_string(), v);
        }
    }
    metrics
}

fn is_metric_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_plain_decimal(s: &str) -> bool {
    let (int, frac) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };
    !int.is_empty() && int.bytes().all(|b| b.is_ascii_digit()) && frac.bytes().all(|b| b.is_ascii_digit())
}

/// The four counters shown on the monitoring screen. Missing series read 0.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DashboardMetrics {
    pub messages_received: f64,
    pub tasks_dispatched: f64,
    pub leads_saved: f64,
    pub tool_calls: f64,
}

impl DashboardMetrics {
    pub fn from_text(text: &str) -> Self {
        let m = parse_metrics(text);
        let get = |name: &str| m.get(name).copied().unwrap_or(0.0);
        Self {
            messages_received: get(MESSAGES_RECEIVED),
            tasks_dispatched: get(TASKS_DISPATCHED),
            leads_saved: get(LEADS_SAVED),
            tool_calls: get(TOOL_CALLS),
        }
    }

    /// Read the counters from a cached `/metrics` entry. An entry without a
    /// text value reads as all zeros.
    pub fn from_entry(entry: &CacheEntry) -> Self {
        entry
            .value
            .as_ref()
            .and_then(|v| v.as_str())
            .map(Self::from_text)
            .unwrap_or_default()
    }
}
