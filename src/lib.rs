//! dsql-probe: check that an AWS DSQL cluster is reachable through a local tunnel.
//!
//! DSQL routes TLS connections by SNI. When the TCP connection goes to a
//! loopback tunnel, a stock client sends the tunnel address (or nothing) as
//! the server name and the handshake is rejected. This crate keeps the two
//! apart: the socket dials `PGHOSTADDR`, while `HOSTNAME` is presented as SNI
//! and is the name the server certificate is checked against.
//!
//! The Postgres side is a minimal wire-protocol client: SSLRequest
//! negotiation, startup, cleartext and SCRAM-SHA-256 authentication, the
//! simple query flow, and Terminate.
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> Result<(), dsql_probe::ProbeError> {
//! use dsql_probe::{probe, ProbeConfig};
//!
//! let config = ProbeConfig::from_env()?;
//! let report = probe::run(&config).await?;
//! println!("{}", report);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod probe;
pub mod protocol;
pub mod report;

pub use config::{ProbeConfig, ProbeConfigBuilder, Secret};
pub use connection::{Endpoint, SslMode};
pub use error::{Error, Result};
pub use probe::{ProbeError, CONNECTION_INFO_QUERY};
pub use report::ConnectionReport;
