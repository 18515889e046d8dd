//! The connectivity probe: connect, ask the server who we are, disconnect.

use crate::config::ProbeConfig;
use crate::connection::{Connection, Row};
use crate::report::ConnectionReport;
use crate::Error;
use std::time::Instant;
use thiserror::Error;
use tracing::Instrument;

/// The one query the probe runs.
///
/// DSQL does not implement the peer address/port or TLS introspection
/// functions, so the query sticks to what every Postgres-compatible server has.
pub const CONNECTION_INFO_QUERY: &str =
    "SELECT current_database() as database, current_user as user, version() as server_version";

/// Probe failure, tagged with the stage that failed
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Bad or missing configuration; nothing was sent over the network
    #[error("Configuration Error: {0}")]
    Configuration(#[source] Error),

    /// TCP, TLS or authentication failed
    #[error("Connection Error: {0}")]
    Connection(#[source] Error),

    /// The query failed on an established connection
    #[error("Query Error: {0}")]
    Query(#[source] Error),
}

impl ProbeError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Configuration(_) => 2,
            Self::Connection(_) => 3,
            Self::Query(_) => 4,
        }
    }

    /// Underlying library error
    pub fn inner(&self) -> &Error {
        match self {
            Self::Configuration(e) | Self::Connection(e) | Self::Query(e) => e,
        }
    }

    /// Troubleshooting text for the operator
    pub fn hint(&self) -> String {
        match self {
            Self::Configuration(_) => {
                let mut hint = String::from("Required environment variables:\n");
                for (var, about) in crate::config::REQUIRED_VARS {
                    hint.push_str(&format!("- {}: {}\n", var, about));
                }
                hint.push_str(&format!(
                    "- {}: SSL mode (require, prefer, allow, disable; default require)",
                    crate::config::SSLMODE_VAR
                ));
                hint
            }
            Self::Connection(e) => {
                let mut hint = String::from(
                    "Troubleshooting tips:\n\
                     - Ensure the SSH or SSM tunnel is active\n\
                     - Verify the tunnel forwards PGHOSTADDR:5432 to the cluster endpoint\n\
                     - Check that the auth token is valid and not expired",
                );
                if matches!(e, Error::Tls { .. }) {
                    hint.push_str(
                        "\n- Check that HOSTNAME is the cluster endpoint the certificate was issued for",
                    );
                }
                hint
            }
            Self::Query(_) => String::from(
                "The connection worked but the query failed; check the user's permissions",
            ),
        }
    }
}

impl From<Error> for ProbeError {
    /// Classify an error by its kind when the stage is not otherwise known
    fn from(e: Error) -> Self {
        match e {
            e if e.is_config() => Self::Configuration(e),
            e @ (Error::Sql(_) | Error::QueryTimeout(_)) => Self::Query(e),
            e => Self::Connection(e),
        }
    }
}

/// Session facts returned by [`CONNECTION_INFO_QUERY`]
#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionInfo {
    database: String,
    user: String,
    server_version: String,
}

impl SessionInfo {
    fn from_row(row: &Row) -> crate::Result<Self> {
        let column = |name: &str| {
            row.get(name).map(str::to_string).ok_or_else(|| {
                Error::Protocol(format!("query result has no value for column '{}'", name))
            })
        };

        Ok(Self {
            database: column("database")?,
            user: column("user")?,
            server_version: column("server_version")?,
        })
    }
}

/// Run the probe once.
///
/// The connection, once established, is closed exactly once whether the
/// query succeeds or not. A failure to close cleanly after a successful
/// query is logged and does not fail the probe.
pub async fn run(config: &ProbeConfig) -> Result<ConnectionReport, ProbeError> {
    let endpoint = config.endpoint();
    let span = tracing::info_span!(
        "probe",
        addr = %endpoint.addr,
        sni = %endpoint.server_name
    );

    async {
        let start = Instant::now();
        let result = run_inner(config).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(ProbeError::Configuration(_)) => "configuration_error",
            Err(ProbeError::Connection(_)) => "connection_error",
            Err(ProbeError::Query(_)) => "query_error",
        };
        crate::metrics::counters::probe_completed(outcome);
        tracing::debug!(outcome, elapsed_ms = start.elapsed().as_millis() as u64, "probe finished");

        result
    }
    .instrument(span)
    .await
}

async fn run_inner(config: &ProbeConfig) -> Result<ConnectionReport, ProbeError> {
    let endpoint = config.endpoint();
    let tls_config = config.to_tls_config().map_err(ProbeError::Configuration)?;
    let conn_config = config.to_connection_config();

    tracing::info!(
        "connecting to {} via tunnel {}",
        endpoint.server_name,
        endpoint.addr
    );

    let mut conn = Connection::connect(&endpoint, &conn_config, tls_config.as_ref())
        .await
        .map_err(|e| match e {
            e if e.is_config() => ProbeError::Configuration(e),
            e => ProbeError::Connection(e),
        })?;

    tracing::info!(tls = conn.is_tls(), "connection established");
    let tls = conn.is_tls();

    let queried = conn
        .query_one(CONNECTION_INFO_QUERY)
        .await
        .and_then(|row| SessionInfo::from_row(&row));

    let closed = conn.close().await;

    let info = queried.map_err(ProbeError::Query)?;
    if let Err(e) = closed {
        tracing::warn!("connection did not close cleanly: {}", e);
    }

    Ok(ConnectionReport {
        database: info.database,
        user: info.user,
        server_version: info.server_version,
        tunnel_addr: config.tunnel_addr(),
        port: endpoint.addr.port(),
        hostname: endpoint.server_name,
        tls,
        sslmode: config.sslmode(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorFields;

    #[test]
    fn test_query_is_exact() {
        assert_eq!(
            CONNECTION_INFO_QUERY,
            "SELECT current_database() as database, current_user as user, version() as server_version"
        );
    }

    #[test]
    fn test_query_avoids_unsupported_functions() {
        for name in ["inet_server_addr", "inet_server_port", "ssl_is_used"] {
            assert!(!CONNECTION_INFO_QUERY.contains(name));
        }
    }

    #[test]
    fn test_exit_codes_are_distinct_and_nonzero() {
        let codes = [
            ProbeError::Configuration(Error::MissingEnv("HOSTNAME")).exit_code(),
            ProbeError::Connection(Error::ConnectionClosed).exit_code(),
            ProbeError::Query(Error::Sql(ErrorFields::default())).exit_code(),
        ];
        assert_eq!(codes, [2, 3, 4]);
    }

    #[test]
    fn test_from_error_classification() {
        assert!(matches!(
            ProbeError::from(Error::MissingEnv("PGPASSWORD")),
            ProbeError::Configuration(_)
        ));
        assert!(matches!(
            ProbeError::from(Error::Sql(ErrorFields::default())),
            ProbeError::Query(_)
        ));
        assert!(matches!(
            ProbeError::from(Error::ConnectionClosed),
            ProbeError::Connection(_)
        ));
    }

    #[test]
    fn test_display_includes_stage_and_cause() {
        let err = ProbeError::Configuration(Error::MissingEnv("PGHOSTADDR"));
        assert_eq!(
            err.to_string(),
            "Configuration Error: required environment variable PGHOSTADDR is not set"
        );
    }

    #[test]
    fn test_configuration_hint_lists_variables() {
        let hint = ProbeError::Configuration(Error::MissingEnv("HOSTNAME")).hint();
        for var in ["HOSTNAME", "PGHOSTADDR", "PGPASSWORD", "PGSSLMODE"] {
            assert!(hint.contains(var), "hint missing {}", var);
        }
    }

    #[test]
    fn test_tls_failure_hint_mentions_hostname() {
        let err = ProbeError::Connection(Error::Tls {
            server_name: "db.example".into(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "bad cert"),
        });
        assert!(err.hint().contains("HOSTNAME"));
    }
}
