//! In-process Postgres server for integration tests.
//!
//! Speaks just enough of the protocol to take a client through SSLRequest,
//! startup, cleartext authentication, one simple query and Terminate, and
//! records what the client sent along the way.

#![allow(dead_code)]

use bytes::{BufMut, BytesMut};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

const SSL_REQUEST_CODE: i32 = 80877103;

/// A throwaway CA and a server certificate it signed
pub struct Pki {
    ca_file: NamedTempFile,
    server_config: Arc<ServerConfig>,
}

impl Pki {
    /// CA plus a leaf certificate valid for `server_name`
    pub fn new(server_name: &str) -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "dsql-probe test CA");
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params = CertificateParams::new(vec![server_name.to_string()]).unwrap();
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, server_name);
        leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        let mut ca_file = NamedTempFile::new().unwrap();
        ca_file.write_all(ca_cert.pem().as_bytes()).unwrap();
        ca_file.flush().unwrap();

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let server_config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![leaf_cert.der().clone()], key)
        .unwrap();

        Self {
            ca_file,
            server_config: Arc::new(server_config),
        }
    }

    /// PEM file holding the CA certificate
    pub fn ca_path(&self) -> &Path {
        self.ca_file.path()
    }
}

/// Answer to SSLRequest
#[derive(Clone)]
pub enum TlsBehavior {
    /// `S`, then a TLS handshake with this config
    Accept(Arc<ServerConfig>),
    /// `N`
    Refuse,
}

impl TlsBehavior {
    pub fn accept(pki: &Pki) -> Self {
        Self::Accept(pki.server_config.clone())
    }
}

/// Answer to the query
#[derive(Clone)]
pub enum QueryBehavior {
    /// One row with these (column, value) pairs
    Row(Vec<(String, String)>),
    /// ErrorResponse with SQLSTATE and message
    Error { code: String, message: String },
}

impl QueryBehavior {
    pub fn session(database: &str, user: &str, version: &str) -> Self {
        Self::Row(vec![
            ("database".into(), database.into()),
            ("user".into(), user.into()),
            ("server_version".into(), version.into()),
        ])
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// How the mock server behaves for its single session
#[derive(Clone)]
pub struct Behavior {
    pub tls: TlsBehavior,
    pub password: String,
    pub query: QueryBehavior,
    /// Accept the socket and never answer
    pub silent: bool,
}

impl Behavior {
    pub fn new(tls: TlsBehavior) -> Self {
        Self {
            tls,
            password: "tok".into(),
            query: QueryBehavior::session("postgres", "admin", "PostgreSQL 16"),
            silent: false,
        }
    }

    pub fn query(mut self, query: QueryBehavior) -> Self {
        self.query = query;
        self
    }

    pub fn password(mut self, password: &str) -> Self {
        self.password = password.into();
        self
    }

    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::new(TlsBehavior::Refuse)
        }
    }
}

/// What the client sent
#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub connections: usize,
    pub ssl_requested: bool,
    pub tls: bool,
    pub handshake_failed: bool,
    pub sni: Option<String>,
    pub startup: Vec<(String, String)>,
    pub password: Option<String>,
    pub queries: Vec<String>,
    pub terminates: usize,
}

impl Captured {
    pub fn startup_param(&self, name: &str) -> Option<&str> {
        self.startup
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Mock server bound to an ephemeral loopback port
pub struct MockServer {
    pub addr: SocketAddr,
    captured: Arc<Mutex<Captured>>,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let captured = Arc::new(Mutex::new(Captured::default()));

        let shared = captured.clone();
        let handle = tokio::spawn(async move {
            let (socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            shared.lock().unwrap().connections += 1;

            if behavior.silent {
                let _socket = socket;
                tokio::time::sleep(Duration::from_secs(60)).await;
                return;
            }

            serve(socket, behavior, shared).await;
        });

        Self {
            addr,
            captured,
            handle,
        }
    }

    /// Wait for the session to end and return what was captured
    pub async fn finish(self) -> Captured {
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("mock server did not finish")
            .expect("mock server panicked");
        let captured = self.captured.lock().unwrap().clone();
        captured
    }
}

async fn serve(mut socket: tokio::net::TcpStream, behavior: Behavior, captured: Arc<Mutex<Captured>>) {
    let Some((code, body)) = read_untagged(&mut socket).await else {
        return;
    };

    if code != SSL_REQUEST_CODE {
        session_after_startup(socket, body, behavior, captured).await;
        return;
    }

    captured.lock().unwrap().ssl_requested = true;

    match behavior.tls.clone() {
        TlsBehavior::Accept(config) => {
            if socket.write_all(b"S").await.is_err() {
                return;
            }
            let tls = match TlsAcceptor::from(config).accept(socket).await {
                Ok(tls) => tls,
                Err(_) => {
                    captured.lock().unwrap().handshake_failed = true;
                    return;
                }
            };
            {
                let mut c = captured.lock().unwrap();
                c.tls = true;
                c.sni = tls.get_ref().1.server_name().map(str::to_string);
            }
            let mut tls = tls;
            let Some((_, body)) = read_untagged(&mut tls).await else {
                return;
            };
            session_after_startup(tls, body, behavior, captured).await;
        }
        TlsBehavior::Refuse => {
            if socket.write_all(b"N").await.is_err() {
                return;
            }
            let Some((_, body)) = read_untagged(&mut socket).await else {
                return;
            };
            session_after_startup(socket, body, behavior, captured).await;
        }
    }
}

async fn session_after_startup<S>(
    mut stream: S,
    startup_body: Vec<u8>,
    behavior: Behavior,
    captured: Arc<Mutex<Captured>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    captured.lock().unwrap().startup = parse_startup_params(&startup_body);

    // Cleartext password, as DSQL asks for
    if stream.write_all(&backend(b'R', &3i32.to_be_bytes())).await.is_err() {
        return;
    }
    let Some((tag, body)) = read_tagged(&mut stream).await else {
        return;
    };
    assert_eq!(tag, b'p', "expected password message");
    let password = cstr(&body);
    captured.lock().unwrap().password = Some(password.clone());

    if password != behavior.password {
        let _ = stream
            .write_all(&error_response("FATAL", "28P01", "password authentication failed for user \"admin\""))
            .await;
        return;
    }

    let mut hello = Vec::new();
    hello.extend(backend(b'R', &0i32.to_be_bytes()));
    hello.extend(parameter_status("server_version", "16.0"));
    hello.extend(parameter_status("client_encoding", "UTF8"));
    let mut key_data = Vec::new();
    key_data.extend(4242i32.to_be_bytes());
    key_data.extend(99i32.to_be_bytes());
    hello.extend(backend(b'K', &key_data));
    hello.extend(ready());
    if stream.write_all(&hello).await.is_err() {
        return;
    }

    while let Some((tag, body)) = read_tagged(&mut stream).await {
        match tag {
            b'Q' => {
                captured.lock().unwrap().queries.push(cstr(&body));
                let response = match &behavior.query {
                    QueryBehavior::Row(pairs) => {
                        let names: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
                        let values: Vec<&str> = pairs.iter().map(|(_, v)| v.as_str()).collect();
                        [
                            row_description(&names),
                            data_row(&values),
                            backend(b'C', b"SELECT 1\0"),
                            ready(),
                        ]
                        .concat()
                    }
                    QueryBehavior::Error { code, message } => {
                        [error_response("ERROR", code, message), ready()].concat()
                    }
                };
                if stream.write_all(&response).await.is_err() {
                    return;
                }
            }
            b'X' => {
                captured.lock().unwrap().terminates += 1;
            }
            _ => {}
        }
    }
}

/// Length-prefixed message without a tag (SSLRequest, StartupMessage)
async fn read_untagged<S: AsyncRead + Unpin>(stream: &mut S) -> Option<(i32, Vec<u8>)> {
    let len = stream.read_i32().await.ok()?;
    if !(8..=10_000).contains(&len) {
        return None;
    }
    let code = stream.read_i32().await.ok()?;
    let mut body = vec![0u8; len as usize - 8];
    stream.read_exact(&mut body).await.ok()?;
    Some((code, body))
}

async fn read_tagged<S: AsyncRead + Unpin>(stream: &mut S) -> Option<(u8, Vec<u8>)> {
    let tag = stream.read_u8().await.ok()?;
    let len = stream.read_i32().await.ok()?;
    if !(4..=1_000_000).contains(&len) {
        return None;
    }
    let mut body = vec![0u8; len as usize - 4];
    stream.read_exact(&mut body).await.ok()?;
    Some((tag, body))
}

fn parse_startup_params(body: &[u8]) -> Vec<(String, String)> {
    let mut parts = body
        .split(|&b| b == 0)
        .map(|s| String::from_utf8_lossy(s).into_owned());
    let mut params = Vec::new();
    while let (Some(k), Some(v)) = (parts.next(), parts.next()) {
        if k.is_empty() {
            break;
        }
        params.push((k, v));
    }
    params
}

fn cstr(body: &[u8]) -> String {
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    String::from_utf8_lossy(&body[..end]).into_owned()
}

pub fn backend(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(body.len() + 5);
    buf.put_u8(tag);
    buf.put_i32(body.len() as i32 + 4);
    buf.put_slice(body);
    buf.to_vec()
}

fn ready() -> Vec<u8> {
    backend(b'Z', b"I")
}

fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    body.extend_from_slice(value.as_bytes());
    body.push(0);
    backend(b'S', &body)
}

fn row_description(names: &[&str]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i16(names.len() as i16);
    for name in names {
        body.put_slice(name.as_bytes());
        body.put_u8(0);
        body.put_i32(0);
        body.put_i16(0);
        body.put_u32(25);
        body.put_i16(-1);
        body.put_i32(-1);
        body.put_i16(0);
    }
    backend(b'T', &body)
}

fn data_row(values: &[&str]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i16(values.len() as i16);
    for value in values {
        body.put_i32(value.len() as i32);
        body.put_slice(value.as_bytes());
    }
    backend(b'D', &body)
}

fn error_response(severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (field, value) in [(b'S', severity), (b'C', code), (b'M', message)] {
        body.push(field);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);
    backend(b'E', &body)
}
