//! Counter helpers

use super::labels;
use ::metrics::counter;

/// A connect sequence started
pub fn connection_attempted() {
    counter!(labels::CONNECTIONS_ATTEMPTED).increment(1);
}

/// A connection reached the idle state
pub fn connection_established(tls: bool) {
    counter!(labels::CONNECTIONS_ESTABLISHED, "tls" => if tls { "true" } else { "false" })
        .increment(1);
}

/// A connection failed; `category` is [`crate::Error::category`]
pub fn connection_failed(category: &'static str) {
    counter!(labels::CONNECTIONS_FAILED, "category" => category).increment(1);
}

/// Outcome of TLS negotiation
pub fn tls_negotiated(outcome: &'static str) {
    counter!(labels::TLS_NEGOTIATIONS, "outcome" => outcome).increment(1);
}

/// Authentication started with a mechanism
pub fn auth_attempted(mechanism: &'static str) {
    counter!(labels::AUTH_ATTEMPTED, "mechanism" => mechanism).increment(1);
}

/// Authentication succeeded
pub fn auth_successful(mechanism: &'static str) {
    counter!(labels::AUTH_SUCCESSFUL, "mechanism" => mechanism).increment(1);
}

/// Authentication failed
pub fn auth_failed(mechanism: &'static str, reason: &'static str) {
    counter!(labels::AUTH_FAILED, "mechanism" => mechanism, "reason" => reason).increment(1);
}

/// A query finished with `status`
pub fn query_completed(status: &'static str) {
    counter!(labels::QUERIES_COMPLETED, "status" => status).increment(1);
}

/// A probe run finished with `outcome`
pub fn probe_completed(outcome: &'static str) {
    counter!(labels::PROBES_COMPLETED, "outcome" => outcome).increment(1);
}
