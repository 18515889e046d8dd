//! Metric names and label values

/// Connection attempts (TCP + TLS + startup)
pub const CONNECTIONS_ATTEMPTED: &str = "dsql_probe_connections_attempted_total";
/// Connections that finished startup
pub const CONNECTIONS_ESTABLISHED: &str = "dsql_probe_connections_established_total";
/// Connections that failed before becoming idle
pub const CONNECTIONS_FAILED: &str = "dsql_probe_connections_failed_total";
/// SSLRequest outcomes
pub const TLS_NEGOTIATIONS: &str = "dsql_probe_tls_negotiations_total";
/// Authentication attempts
pub const AUTH_ATTEMPTED: &str = "dsql_probe_auth_attempted_total";
/// Successful authentications
pub const AUTH_SUCCESSFUL: &str = "dsql_probe_auth_successful_total";
/// Failed authentications
pub const AUTH_FAILED: &str = "dsql_probe_auth_failed_total";
/// Completed queries
pub const QUERIES_COMPLETED: &str = "dsql_probe_queries_completed_total";
/// Probe runs by outcome
pub const PROBES_COMPLETED: &str = "dsql_probe_runs_total";

/// Connect duration in milliseconds
pub const CONNECT_DURATION: &str = "dsql_probe_connect_duration_ms";
/// Authentication duration in milliseconds
pub const AUTH_DURATION: &str = "dsql_probe_auth_duration_ms";
/// Query duration in milliseconds
pub const QUERY_DURATION: &str = "dsql_probe_query_duration_ms";

/// Cleartext password mechanism
pub const MECHANISM_CLEARTEXT: &str = "cleartext";
/// SCRAM-SHA-256 mechanism
pub const MECHANISM_SCRAM: &str = "scram-sha-256";
/// Server accepted the connection without a password exchange
pub const MECHANISM_TRUST: &str = "trust";

/// Success outcome
pub const STATUS_OK: &str = "ok";
/// Failure outcome
pub const STATUS_ERROR: &str = "error";

/// Server answered `S`
pub const TLS_ACCEPTED: &str = "accepted";
/// Server answered `N`
pub const TLS_DECLINED: &str = "declined";
/// SSLRequest never sent
pub const TLS_SKIPPED: &str = "skipped";
