//! Builders for the QMP commands the migration run issues.

use super::protocol::Request;
use serde_json::json;

pub const POSTCOPY_RAM: &str = "postcopy-ram";

pub fn qmp_capabilities() -> Request {
    Request::new("qmp_capabilities")
}

pub fn set_capability(capability: &str, state: bool) -> Request {
    Request::new("migrate-set-capabilities").with_arguments(json!({
        "capabilities": [{ "capability": capability, "state": state }]
    }))
}

/// Legacy bandwidth cap, bytes per second.
pub fn set_speed(bytes_per_sec: u64) -> Request {
    Request::new("migrate_set_speed").with_arguments(json!({ "value": bytes_per_sec }))
}

/// Legacy downtime limit, in seconds.
pub fn set_downtime(seconds: f64) -> Request {
    Request::new("migrate_set_downtime").with_arguments(json!({ "value": seconds }))
}

/// Bandwidth cap and downtime limit via `migrate-set-parameters`.
pub fn set_parameters(max_bandwidth: u64, downtime_limit_ms: u64) -> Request {
    Request::new("migrate-set-parameters").with_arguments(json!({
        "max-bandwidth": max_bandwidth,
        "downtime-limit": downtime_limit_ms,
    }))
}

pub fn migrate(uri: &str) -> Request {
    Request::new("migrate").with_arguments(json!({ "uri": uri }))
}

pub fn start_postcopy() -> Request {
    Request::new("migrate-start-postcopy")
}

pub fn query_migrate() -> Request {
    Request::new("query-migrate")
}

pub fn quit() -> Request {
    Request::new("quit")
}

/// `downtime-limit` only takes whole milliseconds; round up so a tiny
/// non-zero limit never becomes "no limit at all".
pub fn downtime_limit_ms(seconds: f64) -> u64 {
    (seconds * 1000.0).ceil() as u64
}
