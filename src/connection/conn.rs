//! Core connection type

use super::endpoint::Endpoint;
use super::state::ConnectionState;
use super::tls::{parse_server_name, SslMode, TlsConfig};
use super::transport::Transport;
use crate::auth::{scram, ScramClient};
use crate::protocol::constants::PROTOCOL_VERSION;
use crate::protocol::{
    decode_message, encode_message, AuthenticationMessage, BackendMessage, ErrorFields,
    FieldDescription, FrontendMessage,
};
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// Default bound on the connect sequence
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection configuration
///
/// Use `ConnectionConfig::builder()` to set credentials, timeouts and the TLS mode.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Database name
    pub database: String,
    /// Username
    pub user: String,
    /// Password or token (optional)
    pub password: Option<String>,
    /// Additional startup parameters, sent in order
    pub params: Vec<(String, String)>,
    /// Bound on TCP connect, TLS handshake and startup together
    pub connect_timeout: Duration,
    /// Bound on a single query round trip (default: unlimited)
    pub query_timeout: Option<Duration>,
    /// Application name for Postgres logs
    pub application_name: Option<String>,
    /// SSL/TLS mode
    pub sslmode: SslMode,
}

impl ConnectionConfig {
    /// Create a builder
    ///
    /// # Examples
    ///
    /// ```
    /// use dsql_probe::connection::{ConnectionConfig, SslMode};
    /// use std::time::Duration;
    ///
    /// let config = ConnectionConfig::builder("postgres", "admin")
    ///     .password("token")
    ///     .connect_timeout(Duration::from_secs(10))
    ///     .sslmode(SslMode::Require)
    ///     .build();
    /// assert_eq!(config.user, "admin");
    /// ```
    pub fn builder(
        database: impl Into<String>,
        user: impl Into<String>,
    ) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder {
            database: database.into(),
            user: user.into(),
            password: None,
            params: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            query_timeout: None,
            application_name: None,
            sslmode: SslMode::default(),
        }
    }

    /// Startup parameters in the order they are sent
    fn startup_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("user".to_string(), self.user.clone()),
            ("database".to_string(), self.database.clone()),
        ];

        if let Some(app_name) = &self.application_name {
            params.push(("application_name".to_string(), app_name.clone()));
        }

        for (k, v) in &self.params {
            params.push((k.clone(), v.clone()));
        }

        params
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("params", &self.params)
            .field("connect_timeout", &self.connect_timeout)
            .field("query_timeout", &self.query_timeout)
            .field("application_name", &self.application_name)
            .field("sslmode", &self.sslmode)
            .finish()
    }
}

/// Builder for [`ConnectionConfig`]
#[derive(Clone)]
pub struct ConnectionConfigBuilder {
    database: String,
    user: String,
    password: Option<String>,
    params: Vec<(String, String)>,
    connect_timeout: Duration,
    query_timeout: Option<Duration>,
    application_name: Option<String>,
    sslmode: SslMode,
}

impl ConnectionConfigBuilder {
    /// Set the password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Add a startup parameter
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Set the connect timeout
    ///
    /// Default: 30 seconds. Covers TCP connect, TLS handshake and
    /// authentication as one deadline.
    pub fn connect_timeout(mut self, duration: Duration) -> Self {
        self.connect_timeout = duration;
        self
    }

    /// Set the per-query timeout
    ///
    /// Default: None (unlimited)
    pub fn query_timeout(mut self, duration: Duration) -> Self {
        self.query_timeout = Some(duration);
        self
    }

    /// Set application name for Postgres logs
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Set SSL/TLS mode
    pub fn sslmode(mut self, mode: SslMode) -> Self {
        self.sslmode = mode;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ConnectionConfig {
        ConnectionConfig {
            database: self.database,
            user: self.user,
            password: self.password,
            params: self.params,
            connect_timeout: self.connect_timeout,
            query_timeout: self.query_timeout,
            application_name: self.application_name,
            sslmode: self.sslmode,
        }
    }
}

impl std::fmt::Debug for ConnectionConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfigBuilder")
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("sslmode", &self.sslmode)
            .finish_non_exhaustive()
    }
}

/// A single result row in text format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Option<String>>,
}

impl Row {
    fn from_wire(fields: &[FieldDescription], values: Vec<Option<bytes::Bytes>>) -> Result<Self> {
        if fields.len() != values.len() {
            return Err(Error::Protocol(format!(
                "row has {} values but {} columns were described",
                values.len(),
                fields.len()
            )));
        }

        let values = values
            .into_iter()
            .map(|v| {
                v.map(|b| {
                    String::from_utf8(b.to_vec())
                        .map_err(|_| Error::Protocol("non UTF-8 text value in row".into()))
                })
                .transpose()
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            columns: fields.iter().map(|f| f.name.clone()).collect(),
            values,
        })
    }

    /// Value of the named column; `None` if the column is absent or NULL
    pub fn get(&self, column: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values[idx].as_deref()
    }

    /// Column names in result order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

/// Postgres connection
pub struct Connection {
    transport: Option<Transport>,
    state: ConnectionState,
    read_buf: BytesMut,
    process_id: Option<i32>,
    parameters: HashMap<String, String>,
    query_timeout: Option<Duration>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.transport)
            .field("state", &self.state)
            .field("process_id", &self.process_id)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create connection from transport
    pub fn new(transport: Transport) -> Self {
        Self {
            transport: Some(transport),
            state: ConnectionState::Initial,
            read_buf: BytesMut::with_capacity(8192),
            process_id: None,
            parameters: HashMap::new(),
            query_timeout: None,
        }
    }

    /// Dial `endpoint.addr`, negotiate TLS for `endpoint.server_name` and authenticate.
    ///
    /// The whole sequence is bounded by `config.connect_timeout`. On any
    /// failure the socket is dropped before returning.
    pub async fn connect(
        endpoint: &Endpoint,
        config: &ConnectionConfig,
        tls_config: Option<&TlsConfig>,
    ) -> Result<Self> {
        let start = Instant::now();
        crate::metrics::counters::connection_attempted();

        let attempt = async {
            let transport = Transport::connect_tcp(endpoint.addr).await?;
            let peer = transport.peer_addr()?;
            tracing::debug!(addr = %endpoint.addr, %peer, "TCP connection established");

            let mut conn = Connection::new(transport);
            conn.query_timeout = config.query_timeout;
            conn.startup(config, tls_config, &endpoint.server_name)
                .await?;
            Ok(conn)
        };

        let result = match tokio::time::timeout(config.connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectTimeout {
                addr: endpoint.addr,
                timeout: config.connect_timeout,
            }),
        };

        match &result {
            Ok(conn) => {
                crate::metrics::counters::connection_established(conn.is_tls());
                crate::metrics::histograms::connect_duration(start.elapsed().as_millis() as u64);
            }
            Err(e) => crate::metrics::counters::connection_failed(e.category()),
        }

        result
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the session is TLS-encrypted
    pub fn is_tls(&self) -> bool {
        self.transport.as_ref().is_some_and(Transport::is_tls)
    }

    /// Backend process ID reported during startup
    pub fn backend_pid(&self) -> Option<i32> {
        self.process_id
    }

    /// Value of a ParameterStatus reported by the server (e.g. `server_version`)
    pub fn server_parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Negotiate TLS upgrade with the server via the SSLRequest protocol.
    ///
    /// Sends the 8-byte SSLRequest message and reads the server's single-byte
    /// response. On `S` the transport is upgraded to TLS with `server_name` as
    /// SNI. On `N` the connection stays in plaintext unless `sslmode` requires TLS.
    async fn negotiate_tls(
        &mut self,
        tls_config: &TlsConfig,
        server_name: &str,
        sslmode: SslMode,
    ) -> Result<()> {
        let server_name = parse_server_name(server_name)?;
        self.state.transition(ConnectionState::NegotiatingTls)?;

        self.send_message(&FrontendMessage::SslRequest).await?;

        let transport = self.transport.as_mut().ok_or(Error::ConnectionClosed)?;
        let n = transport.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }

        let response = self.read_buf[0];
        self.read_buf.advance(1);

        match response {
            b'S' => {
                // Anything already buffered arrived before the handshake and
                // was not protected by it.
                if !self.read_buf.is_empty() {
                    return Err(Error::Protocol(
                        "server sent unencrypted data after accepting TLS".into(),
                    ));
                }

                crate::metrics::counters::tls_negotiated(crate::metrics::labels::TLS_ACCEPTED);
                tracing::debug!(server_name = ?server_name, "server accepted TLS, upgrading connection");

                let transport = self.transport.take().ok_or(Error::ConnectionClosed)?;
                self.transport = Some(transport.upgrade_to_tls(tls_config, server_name).await?);
                tracing::info!("TLS connection established");
                Ok(())
            }
            b'N' => {
                crate::metrics::counters::tls_negotiated(crate::metrics::labels::TLS_DECLINED);
                if sslmode.requires_tls() {
                    tracing::debug!("server rejected TLS");
                    return Err(Error::TlsRejected(sslmode));
                }
                tracing::warn!(%sslmode, "server does not support TLS, continuing without encryption");
                Ok(())
            }
            b'E' => Err(Error::Protocol(
                "server answered SSLRequest with an error; it may not speak protocol 3.0".into(),
            )),
            other => Err(Error::Protocol(format!(
                "unexpected SSLRequest response byte: 0x{:02X}",
                other
            ))),
        }
    }

    /// Perform TLS negotiation, startup and authentication
    pub async fn startup(
        &mut self,
        config: &ConnectionConfig,
        tls_config: Option<&TlsConfig>,
        server_name: &str,
    ) -> Result<()> {
        async {
            if config.sslmode.requests_tls() {
                let tls = tls_config.ok_or_else(|| {
                    Error::Config(format!(
                        "sslmode={} requires TlsConfig but none was provided",
                        config.sslmode
                    ))
                })?;
                self.negotiate_tls(tls, server_name, config.sslmode).await?;
            } else {
                crate::metrics::counters::tls_negotiated(crate::metrics::labels::TLS_SKIPPED);
            }

            self.state.transition(ConnectionState::AwaitingAuth)?;

            let startup = FrontendMessage::Startup {
                version: PROTOCOL_VERSION,
                params: config.startup_params(),
            };
            self.send_message(&startup).await?;

            self.state.transition(ConnectionState::Authenticating)?;
            self.authenticate(config).await?;

            self.state.transition(ConnectionState::Idle)?;
            tracing::info!(tls = self.is_tls(), "startup complete");
            Ok(())
        }
        .instrument(tracing::info_span!(
            "startup",
            user = %config.user,
            database = %config.database,
            sslmode = %config.sslmode
        ))
        .await
    }

    /// Handle authentication
    async fn authenticate(&mut self, config: &ConnectionConfig) -> Result<()> {
        let auth_start = Instant::now();
        let mut auth_mechanism = crate::metrics::labels::MECHANISM_TRUST;

        loop {
            let msg = self.receive_message().await?;

            match msg {
                BackendMessage::Authentication(auth) => match auth {
                    AuthenticationMessage::Ok => {
                        tracing::debug!("authentication successful");
                        crate::metrics::counters::auth_successful(auth_mechanism);
                        crate::metrics::histograms::auth_duration(
                            auth_mechanism,
                            auth_start.elapsed().as_millis() as u64,
                        );
                        // ParameterStatus and BackendKeyData follow; keep reading until ReadyForQuery
                    }
                    AuthenticationMessage::CleartextPassword => {
                        auth_mechanism = crate::metrics::labels::MECHANISM_CLEARTEXT;
                        crate::metrics::counters::auth_attempted(auth_mechanism);

                        if !self.is_tls() {
                            tracing::warn!("server requested a cleartext password over an unencrypted connection");
                        }

                        let password = config
                            .password
                            .as_ref()
                            .ok_or_else(|| Error::Authentication("password required".into()))?;
                        self.send_message(&FrontendMessage::Password(password.clone()))
                            .await?;
                    }
                    AuthenticationMessage::Md5Password { .. } => {
                        crate::metrics::counters::auth_failed("md5", "unsupported");
                        return Err(Error::Authentication(
                            "MD5 authentication not supported. Use SCRAM-SHA-256 or cleartext password".into(),
                        ));
                    }
                    AuthenticationMessage::Sasl { mechanisms } => {
                        auth_mechanism = crate::metrics::labels::MECHANISM_SCRAM;
                        crate::metrics::counters::auth_attempted(auth_mechanism);
                        if let Err(e) = self.handle_sasl(&mechanisms, config).await {
                            crate::metrics::counters::auth_failed(auth_mechanism, "sasl");
                            return Err(e);
                        }
                    }
                    AuthenticationMessage::SaslContinue { .. } => {
                        return Err(Error::Protocol(
                            "unexpected SaslContinue outside of SASL flow".into(),
                        ));
                    }
                    AuthenticationMessage::SaslFinal { .. } => {
                        return Err(Error::Protocol(
                            "unexpected SaslFinal outside of SASL flow".into(),
                        ));
                    }
                },
                BackendMessage::BackendKeyData { process_id, .. } => {
                    self.process_id = Some(process_id);
                }
                BackendMessage::ParameterStatus { name, value } => {
                    tracing::debug!("parameter status: {} = {}", name, value);
                    self.parameters.insert(name, value);
                }
                BackendMessage::NoticeResponse(notice) => {
                    tracing::debug!("notice during startup: {}", notice);
                }
                BackendMessage::ReadyForQuery { .. } => {
                    break;
                }
                BackendMessage::ErrorResponse(err) => {
                    crate::metrics::counters::auth_failed(auth_mechanism, "server_error");
                    return Err(Error::Authentication(err.to_string()));
                }
                _ => {
                    return Err(Error::Protocol(format!(
                        "unexpected message during auth: {:?}",
                        msg
                    )));
                }
            }
        }

        Ok(())
    }

    /// Handle SASL authentication (SCRAM-SHA-256)
    async fn handle_sasl(&mut self, mechanisms: &[String], config: &ConnectionConfig) -> Result<()> {
        if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
            return Err(Error::Authentication(format!(
                "server does not support {}. Available: {}",
                scram::MECHANISM,
                mechanisms.join(", ")
            )));
        }

        let password = config.password.as_ref().ok_or_else(|| {
            Error::Authentication("password required for SCRAM authentication".into())
        })?;

        let scram = ScramClient::new(password.clone());
        tracing::debug!("initiating SCRAM-SHA-256 authentication");

        let msg = FrontendMessage::SaslInitialResponse {
            mechanism: scram::MECHANISM.to_string(),
            data: scram.client_first().into_bytes(),
        };
        self.send_message(&msg).await?;

        let server_first_data = match self.receive_message().await? {
            BackendMessage::Authentication(AuthenticationMessage::SaslContinue { data }) => data,
            BackendMessage::ErrorResponse(err) => {
                return Err(Error::Authentication(format!("SASL server error: {}", err)));
            }
            _ => {
                return Err(Error::Protocol(
                    "expected SaslContinue message during SASL authentication".into(),
                ));
            }
        };
        let server_first = String::from_utf8(server_first_data).map_err(|e| {
            Error::Authentication(format!("invalid UTF-8 in server first message: {}", e))
        })?;

        // Key derivation is CPU-bound; keep it off the runtime so the
        // connect deadline can still fire.
        let (scram, derived) = tokio::task::spawn_blocking(move || {
            let derived = scram.client_final(&server_first);
            (scram, derived)
        })
        .await
        .map_err(|e| Error::Authentication(format!("SCRAM key derivation aborted: {}", e)))?;
        let (client_final, scram_state) =
            derived.map_err(|e| Error::Authentication(format!("SCRAM error: {}", e)))?;

        let msg = FrontendMessage::SaslResponse {
            data: client_final.into_bytes(),
        };
        self.send_message(&msg).await?;

        let server_final_data = match self.receive_message().await? {
            BackendMessage::Authentication(AuthenticationMessage::SaslFinal { data }) => data,
            BackendMessage::ErrorResponse(err) => {
                return Err(Error::Authentication(format!("SASL server error: {}", err)));
            }
            _ => {
                return Err(Error::Protocol(
                    "expected SaslFinal message during SASL authentication".into(),
                ));
            }
        };
        let server_final = String::from_utf8(server_final_data).map_err(|e| {
            Error::Authentication(format!("invalid UTF-8 in server final message: {}", e))
        })?;

        scram
            .verify_server_final(&server_final, &scram_state)
            .map_err(|e| Error::Authentication(format!("SCRAM verification failed: {}", e)))?;

        tracing::debug!("SCRAM-SHA-256 authentication successful");
        Ok(())
    }

    /// Execute a simple query and return every backend message up to ReadyForQuery.
    ///
    /// A server ErrorResponse is returned as [`Error::Sql`] once the server
    /// is ready again, so the connection stays usable.
    pub async fn simple_query(&mut self, query: &str) -> Result<Vec<BackendMessage>> {
        if self.state != ConnectionState::Idle {
            return Err(Error::ConnectionBusy(format!(
                "connection in state: {}",
                self.state
            )));
        }

        self.state.transition(ConnectionState::QueryInProgress)?;
        self.send_message(&FrontendMessage::Query(query.to_string()))
            .await?;
        self.state.transition(ConnectionState::ReadingResults)?;

        let mut messages = Vec::new();
        let mut server_error: Option<ErrorFields> = None;

        loop {
            match self.receive_message().await? {
                BackendMessage::ErrorResponse(err) => {
                    tracing::debug!("query error response: {}", err);
                    server_error.get_or_insert(err);
                }
                BackendMessage::NoticeResponse(notice) => {
                    tracing::debug!("notice: {}", notice);
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                msg @ BackendMessage::ReadyForQuery { .. } => {
                    messages.push(msg);
                    break;
                }
                msg => messages.push(msg),
            }
        }

        self.state.transition(ConnectionState::Idle)?;

        match server_error {
            Some(err) => Err(Error::Sql(err)),
            None => Ok(messages),
        }
    }

    /// Execute a query expected to return at least one row and return the first.
    ///
    /// Bounded by the configured query timeout, if any.
    pub async fn query_one(&mut self, query: &str) -> Result<Row> {
        let start = Instant::now();
        let result = match self.query_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.query_one_inner(query)).await {
                Ok(result) => result,
                Err(_) => Err(Error::QueryTimeout(limit)),
            },
            None => self.query_one_inner(query).await,
        };

        crate::metrics::histograms::query_duration(start.elapsed().as_millis() as u64);
        crate::metrics::counters::query_completed(if result.is_ok() {
            crate::metrics::labels::STATUS_OK
        } else {
            crate::metrics::labels::STATUS_ERROR
        });

        result
    }

    async fn query_one_inner(&mut self, query: &str) -> Result<Row> {
        let messages = self.simple_query(query).await?;

        let mut fields = None;
        let mut first_row = None;
        let mut row_count = 0usize;

        for msg in messages {
            match msg {
                BackendMessage::RowDescription(desc) => fields = Some(desc),
                BackendMessage::DataRow(values) => {
                    row_count += 1;
                    if first_row.is_none() {
                        first_row = Some(values);
                    }
                }
                _ => {}
            }
        }

        if row_count > 1 {
            tracing::debug!(rows = row_count, "query returned more than one row, using the first");
        }

        match (fields, first_row) {
            (Some(fields), Some(values)) => Row::from_wire(&fields, values),
            (None, Some(_)) => Err(Error::Protocol(
                "DataRow received without RowDescription".into(),
            )),
            (_, None) => Err(Error::Protocol("query returned no rows".into())),
        }
    }

    fn transport_mut(&mut self) -> Result<&mut Transport> {
        self.transport.as_mut().ok_or(Error::ConnectionClosed)
    }

    /// Send a frontend message
    async fn send_message(&mut self, msg: &FrontendMessage) -> Result<()> {
        let buf = encode_message(msg);
        let transport = self.transport_mut()?;
        transport.write_all(&buf).await?;
        transport.flush().await?;
        Ok(())
    }

    /// Receive a backend message
    async fn receive_message(&mut self) -> Result<BackendMessage> {
        loop {
            match decode_message(&self.read_buf) {
                Ok(Some((msg, consumed))) => {
                    self.read_buf.advance(consumed);
                    return Ok(msg);
                }
                Ok(None) => {}
                Err(e) => return Err(Error::Protocol(format!("malformed backend message: {}", e))),
            }

            let transport = self.transport.as_mut().ok_or(Error::ConnectionClosed)?;
            let n = transport.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    /// Send Terminate and shut the stream down.
    ///
    /// Consumes the connection, so it can only happen once.
    pub async fn close(mut self) -> Result<()> {
        self.state.transition(ConnectionState::Closed)?;
        let terminate = self.send_message(&FrontendMessage::Terminate).await;

        if let Some(mut transport) = self.transport.take() {
            transport.shutdown().await?;
        }
        tracing::debug!("connection closed");
        terminate
    }
}
