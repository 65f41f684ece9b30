//! Topic names and subscription filters.
//!
//! Topics are slash-delimited (`devices/opcua1/nodes/ns=2;s=Pump`). Filters
//! may use `+` for exactly one level and a trailing `#` for "this level and
//! everything below". Wildcards only ever appear in filters; stored and
//! published topics are exact strings.

/// Heartbeat topics, in cascade order.
pub const TIMER_1S: &str = "timers/1s";
pub const TIMER_5S: &str = "timers/5s";
pub const TIMER_15S: &str = "timers/15s";
pub const TIMER_1M: &str = "timers/1m";
pub const TIMER_1H: &str = "timers/1h";

/// Prefix shared by every heartbeat topic.
pub const TIMERS_PREFIX: &str = "timers/";

/// Filter matching the whole namespace.
pub const ALL_TOPICS: &str = "#";

/// Topic under which an acquisition worker republishes a node value.
pub fn device_node_topic(source_id: &str, node: &str) -> String {
    format!("devices/{source_id}/nodes/{node}")
}

/// Whether `topic` is a heartbeat (cadence) signal.
pub fn is_cadence_topic(topic: &str) -> bool {
    topic.starts_with(TIMERS_PREFIX)
}

/// Check whether `topic` matches subscription `filter`.
///
/// - `#` matches the parent level and every level below it
///   (`devices/#` matches `devices` and `devices/a/b`).
/// - `+` matches exactly one level.
/// - Any other level must be equal.
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate a subscription filter: `#` only as the last level, wildcards
/// never mixed with other characters inside a level.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == last,
        "+" => true,
        other => !other.contains('#') && !other.contains('+'),
    })
}
