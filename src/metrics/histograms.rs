//! Histogram helpers (durations in milliseconds)

use super::labels;
use ::metrics::histogram;

/// Time from dialing to the connection becoming idle
pub fn connect_duration(duration_ms: u64) {
    histogram!(labels::CONNECT_DURATION).record(duration_ms as f64);
}

/// Time spent in the authentication exchange
pub fn auth_duration(mechanism: &'static str, duration_ms: u64) {
    histogram!(labels::AUTH_DURATION, "mechanism" => mechanism).record(duration_ms as f64);
}

/// Time from sending a query to ReadyForQuery
pub fn query_duration(duration_ms: u64) {
    histogram!(labels::QUERY_DURATION).record(duration_ms as f64);
}
