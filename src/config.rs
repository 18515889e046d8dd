//! Probe configuration read from the process environment.
//!
//! Two values that look alike are kept strictly apart: `HOSTNAME` is the
//! identity asserted over TLS and `PGHOSTADDR` is the address the socket
//! dials. Neither is ever substituted for the other.

use crate::connection::{
    parse_server_name, ConnectionConfig, Endpoint, SslMode, TlsConfig, DEFAULT_CONNECT_TIMEOUT,
};
use crate::{Error, Result};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// DSQL endpoint name, sent as SNI
pub const HOSTNAME_VAR: &str = "HOSTNAME";
/// Tunnel address the TCP connection goes to
pub const HOSTADDR_VAR: &str = "PGHOSTADDR";
/// Auth token used as the password
pub const PASSWORD_VAR: &str = "PGPASSWORD";
/// TLS mode
pub const SSLMODE_VAR: &str = "PGSSLMODE";
/// Database name override
pub const DATABASE_VAR: &str = "PGDATABASE";
/// User name override
pub const USER_VAR: &str = "PGUSER";
/// Connect timeout in whole seconds
pub const CONNECT_TIMEOUT_VAR: &str = "PGCONNECT_TIMEOUT";
/// PEM bundle of trusted CAs
pub const SSLROOTCERT_VAR: &str = "PGSSLROOTCERT";

/// Required variables with a short description, in the order they are checked
pub const REQUIRED_VARS: [(&str, &str); 3] = [
    (HOSTNAME_VAR, "DSQL cluster private DNS endpoint"),
    (HOSTADDR_VAR, "tunnel address, usually 127.0.0.1"),
    (PASSWORD_VAR, "generated auth token"),
];

/// Postgres port on the tunnel
pub const DEFAULT_PORT: u16 = 5432;
/// Database provisioned on every DSQL cluster
pub const DEFAULT_DATABASE: &str = "postgres";
/// Admin role provisioned on every DSQL cluster
pub const DEFAULT_USER: &str = "admin";
/// `application_name` reported to the server
pub const APPLICATION_NAME: &str = "dsql-probe";

const MAX_HOSTNAME_LEN: usize = 253;

/// A credential that never shows up in Debug output
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a credential
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw credential
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Validated probe configuration
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    hostname: String,
    tunnel_addr: IpAddr,
    port: u16,
    token: Secret,
    sslmode: SslMode,
    database: String,
    user: String,
    connect_timeout: Duration,
    sslrootcert: Option<PathBuf>,
    accept_invalid_certs: bool,
}

impl ProbeConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through an arbitrary variable lookup.
    ///
    /// Unset and empty variables are treated the same.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let required = |name: &'static str| get(name).ok_or(Error::MissingEnv(name));

        let hostname = required(HOSTNAME_VAR)?;
        let hostaddr = required(HOSTADDR_VAR)?;
        let token = required(PASSWORD_VAR)?;

        let hostname = validate_hostname(&hostname).map_err(|reason| Error::InvalidEnv {
            var: HOSTNAME_VAR,
            reason,
        })?;

        let tunnel_addr = hostaddr
            .parse::<IpAddr>()
            .map_err(|_| Error::InvalidEnv {
                var: HOSTADDR_VAR,
                reason: format!("'{}' is not a numeric IP address", hostaddr),
            })?;

        let sslmode = match get(SSLMODE_VAR) {
            None => SslMode::default(),
            Some(mode) => mode.parse::<SslMode>().map_err(|_| Error::InvalidEnv {
                var: SSLMODE_VAR,
                reason: format!(
                    "'{}' is not one of require, prefer, allow, disable",
                    mode
                ),
            })?,
        };

        let connect_timeout = match get(CONNECT_TIMEOUT_VAR) {
            None => DEFAULT_CONNECT_TIMEOUT,
            Some(secs) => secs
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|&s| s > 0)
                .map(Duration::from_secs)
                .ok_or_else(|| Error::InvalidEnv {
                    var: CONNECT_TIMEOUT_VAR,
                    reason: format!("'{}' is not a positive number of seconds", secs),
                })?,
        };

        let config = Self {
            hostname,
            tunnel_addr,
            port: DEFAULT_PORT,
            token: Secret::new(token),
            sslmode,
            database: get(DATABASE_VAR).unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            user: get(USER_VAR).unwrap_or_else(|| DEFAULT_USER.to_string()),
            connect_timeout,
            sslrootcert: get(SSLROOTCERT_VAR).map(PathBuf::from),
            accept_invalid_certs: false,
        };

        tracing::debug!(
            hostname = %config.hostname,
            tunnel = %config.tunnel_addr,
            sslmode = %config.sslmode,
            "configuration loaded"
        );

        Ok(config)
    }

    /// Build a configuration in code
    pub fn builder(
        hostname: impl Into<String>,
        tunnel_addr: IpAddr,
        token: impl Into<String>,
    ) -> ProbeConfigBuilder {
        ProbeConfigBuilder {
            hostname: hostname.into(),
            tunnel_addr,
            token: token.into(),
            port: DEFAULT_PORT,
            sslmode: SslMode::default(),
            database: DEFAULT_DATABASE.to_string(),
            user: DEFAULT_USER.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            sslrootcert: None,
            accept_invalid_certs: false,
        }
    }

    /// Replace the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Skip certificate verification
    pub fn with_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// DSQL endpoint name
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Tunnel address
    pub fn tunnel_addr(&self) -> IpAddr {
        self.tunnel_addr
    }

    /// Tunnel port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Auth token
    pub fn token(&self) -> &Secret {
        &self.token
    }

    /// TLS mode
    pub fn sslmode(&self) -> SslMode {
        self.sslmode
    }

    /// Database name
    pub fn database(&self) -> &str {
        &self.database
    }

    /// User name
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Connect timeout
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Custom CA bundle
    pub fn sslrootcert(&self) -> Option<&Path> {
        self.sslrootcert.as_deref()
    }

    /// Whether certificate verification is skipped
    pub fn accept_invalid_certs(&self) -> bool {
        self.accept_invalid_certs
    }

    /// TCP destination and TLS name for this configuration
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(
            SocketAddr::new(self.tunnel_addr, self.port),
            self.hostname.clone(),
        )
    }

    /// Connection settings; the query shares the connect timeout
    pub fn to_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::builder(&self.database, &self.user)
            .password(self.token.expose())
            .sslmode(self.sslmode)
            .connect_timeout(self.connect_timeout)
            .query_timeout(self.connect_timeout)
            .application_name(APPLICATION_NAME)
            .param("client_encoding", "UTF8")
            .build()
    }

    /// TLS settings, or `None` when the mode never negotiates TLS
    pub fn to_tls_config(&self) -> Result<Option<TlsConfig>> {
        if !self.sslmode.requests_tls() {
            return Ok(None);
        }

        let mut builder = TlsConfig::builder().danger_accept_invalid_certs(self.accept_invalid_certs);
        if let Some(path) = &self.sslrootcert {
            builder = builder.ca_cert_path(path);
        }
        builder.build().map(Some)
    }
}

/// Builder for [`ProbeConfig`]
#[derive(Debug, Clone)]
pub struct ProbeConfigBuilder {
    hostname: String,
    tunnel_addr: IpAddr,
    token: String,
    port: u16,
    sslmode: SslMode,
    database: String,
    user: String,
    connect_timeout: Duration,
    sslrootcert: Option<PathBuf>,
    accept_invalid_certs: bool,
}

impl ProbeConfigBuilder {
    /// Tunnel port (default 5432)
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// TLS mode (default require)
    pub fn sslmode(mut self, mode: SslMode) -> Self {
        self.sslmode = mode;
        self
    }

    /// Database name (default postgres)
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// User name (default admin)
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Connect timeout (default 30s)
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Trust only the CAs in this PEM file
    pub fn sslrootcert(mut self, path: impl Into<PathBuf>) -> Self {
        self.sslrootcert = Some(path.into());
        self
    }

    /// Skip certificate verification
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<ProbeConfig> {
        let hostname = validate_hostname(&self.hostname).map_err(Error::Config)?;
        if self.token.is_empty() {
            return Err(Error::Config("token must not be empty".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::Config("connect timeout must be positive".into()));
        }

        Ok(ProbeConfig {
            hostname,
            tunnel_addr: self.tunnel_addr,
            port: self.port,
            token: Secret::new(self.token),
            sslmode: self.sslmode,
            database: self.database,
            user: self.user,
            connect_timeout: self.connect_timeout,
            sslrootcert: self.sslrootcert,
            accept_invalid_certs: self.accept_invalid_certs,
        })
    }
}

/// Check a DSQL hostname and return it without a trailing dot
fn validate_hostname(hostname: &str) -> std::result::Result<String, String> {
    let trimmed = hostname.trim_end_matches('.');

    if trimmed.is_empty() {
        return Err("hostname is empty".to_string());
    }
    if trimmed.len() > MAX_HOSTNAME_LEN {
        return Err(format!(
            "hostname is {} characters, the limit is {}",
            trimmed.len(),
            MAX_HOSTNAME_LEN
        ));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(format!("invalid hostname format: '{}'", hostname));
    }
    if trimmed.parse::<IpAddr>().is_ok() {
        return Err(format!(
            "'{}' is an IP address; HOSTNAME must be the DSQL endpoint name",
            hostname
        ));
    }
    parse_server_name(trimmed).map_err(|e| e.to_string())?;

    Ok(trimmed.to_string())
}
