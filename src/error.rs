//! Error types

use crate::connection::SslMode;
use crate::protocol::ErrorFields;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Library error
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// Required environment variable is unset or empty
    #[error("required environment variable {0} is not set")]
    MissingEnv(&'static str),

    /// Environment variable holds an unusable value
    #[error("invalid {var}: {reason}")]
    InvalidEnv {
        /// Variable name
        var: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// I/O error on an established connection
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The connect sequence (TCP, TLS, startup) did not finish in time
    #[error("timed out after {}s connecting to {addr}", .timeout.as_secs_f32())]
    ConnectTimeout {
        /// Address being dialed
        addr: SocketAddr,
        /// Configured bound
        timeout: Duration,
    },

    /// Nothing is listening at the dialed address
    #[error("connection to {addr} refused: {source}")]
    ConnectRefused {
        /// Address being dialed
        addr: SocketAddr,
        /// Underlying socket error
        #[source]
        source: io::Error,
    },

    /// TCP connect failed for another reason
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Address being dialed
        addr: SocketAddr,
        /// Underlying socket error
        #[source]
        source: io::Error,
    },

    /// TLS handshake failed
    #[error("TLS handshake with {server_name} failed: {source}")]
    Tls {
        /// Name sent as SNI and verified against the certificate
        server_name: String,
        /// Underlying handshake error
        #[source]
        source: io::Error,
    },

    /// Server answered SSLRequest with `N` while TLS was required
    #[error("server does not support TLS (sslmode={0})")]
    TlsRejected(SslMode),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Unexpected or malformed protocol traffic
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server closed the connection
    #[error("connection closed by server")]
    ConnectionClosed,

    /// Connection is not idle
    #[error("connection busy: {0}")]
    ConnectionBusy(String),

    /// Invalid state transition
    #[error("invalid connection state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Server rejected the query
    #[error("server error: {0}")]
    Sql(ErrorFields),

    /// Query did not complete in time
    #[error("query timed out after {}s", .0.as_secs_f32())]
    QueryTimeout(Duration),
}

impl Error {
    /// Short category label, used for logs and metrics
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::MissingEnv(_) | Self::InvalidEnv { .. } => "config",
            Self::Io(_) => "io",
            Self::ConnectTimeout { .. } => "timeout",
            Self::ConnectRefused { .. } => "refused",
            Self::Connect { .. } => "connect",
            Self::Tls { .. } | Self::TlsRejected(_) => "tls",
            Self::Authentication(_) => "authentication",
            Self::Protocol(_) | Self::InvalidState { .. } => "protocol",
            Self::ConnectionClosed => "closed",
            Self::ConnectionBusy(_) => "busy",
            Self::Sql(_) => "sql",
            Self::QueryTimeout(_) => "query_timeout",
        }
    }

    /// Whether this error comes from configuration rather than the network
    pub fn is_config(&self) -> bool {
        self.category() == "config"
    }

    /// SQLSTATE of a server-reported error
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::Sql(fields) => fields.sqlstate(),
            _ => None,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
