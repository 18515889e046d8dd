//! Connection management
//!
//! This module handles:
//! * Dialing a numeric address while presenting a separate TLS server name
//! * Connection lifecycle (TLS negotiation, startup, auth, query, terminate)
//! * State machine enforcement
//! * TLS configuration and certificate verification

mod conn;
mod endpoint;
mod state;
mod tls;
mod transport;

pub use conn::{Connection, ConnectionConfig, ConnectionConfigBuilder, Row, DEFAULT_CONNECT_TIMEOUT};
pub use endpoint::Endpoint;
pub use state::ConnectionState;
pub use tls::{parse_server_name, SslMode, TlsConfig, TlsConfigBuilder};
pub use transport::Transport;
