//! SCRAM-SHA-256 client (RFC 5802 / RFC 7677), without channel binding.
//!
//! Postgres authenticates the user named in the startup packet, so the SASL
//! username is sent empty, as libpq does.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// SASL mechanism name
pub const MECHANISM: &str = "SCRAM-SHA-256";

/// GS2 header for "client does not support channel binding"
const GS2_HEADER: &str = "n,,";

const NONCE_LEN: usize = 24;

/// Largest PBKDF2 iteration count accepted from a server.
///
/// Postgres defaults to 4096. The count is chosen by the peer and the
/// derivation cost grows linearly with it.
pub const MAX_ITERATIONS: u32 = 100_000;

/// SCRAM exchange failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScramError {
    /// Server message is malformed or inconsistent with ours
    #[error("invalid server message: {0}")]
    InvalidServerMessage(String),
    /// Server reported an error in its final message (`e=...`)
    #[error("server rejected authentication: {0}")]
    ServerError(String),
    /// Server signature does not match; the server does not know the password
    #[error("server signature verification failed")]
    InvalidServerProof,
    /// Base64 decoding error
    #[error("invalid base64 in {0}")]
    Base64(&'static str),
}

/// State carried from the client-final message to server-final verification
#[derive(Clone, Debug)]
pub struct ScramState {
    auth_message: String,
    server_key: [u8; 32],
}

/// SCRAM-SHA-256 client
pub struct ScramClient {
    password: String,
    nonce: String,
    client_first_bare: String,
}

impl ScramClient {
    /// Create a client with a fresh random nonce
    pub fn new(password: impl Into<String>) -> Self {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();
        Self::with_nonce("", password, nonce)
    }

    fn with_nonce(username: &str, password: impl Into<String>, nonce: String) -> Self {
        let client_first_bare = format!("n={},r={}", saslname(username), nonce);
        Self {
            password: password.into(),
            nonce,
            client_first_bare,
        }
    }

    /// client-first-message
    pub fn client_first(&self) -> String {
        format!("{}{}", GS2_HEADER, self.client_first_bare)
    }

    /// Process server-first-message and build client-final-message
    pub fn client_final(&self, server_first: &str) -> Result<(String, ScramState), ScramError> {
        let server = parse_server_first(server_first)?;

        if server.nonce.len() <= self.nonce.len() || !server.nonce.starts_with(&self.nonce) {
            return Err(ScramError::InvalidServerMessage(
                "server nonce does not extend client nonce".to_string(),
            ));
        }

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2::<HmacSha256>(
            self.password.as_bytes(),
            &server.salt,
            server.iterations,
            &mut salted_password,
        )
        .map_err(|_| ScramError::InvalidServerMessage("key derivation failed".to_string()))?;

        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(client_key);

        let client_final_without_proof =
            format!("c={},r={}", BASE64.encode(GS2_HEADER), server.nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, client_final_without_proof
        );

        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let state = ScramState {
            auth_message,
            server_key: hmac(&salted_password, b"Server Key"),
        };

        Ok((
            format!("{},p={}", client_final_without_proof, BASE64.encode(proof)),
            state,
        ))
    }

    /// Verify server-final-message
    pub fn verify_server_final(
        &self,
        server_final: &str,
        state: &ScramState,
    ) -> Result<(), ScramError> {
        if let Some(err) = server_final.split(',').find_map(|a| a.strip_prefix("e=")) {
            return Err(ScramError::ServerError(err.to_string()));
        }

        let encoded = server_final
            .split(',')
            .find_map(|a| a.strip_prefix("v="))
            .ok_or_else(|| ScramError::InvalidServerMessage("missing 'v=' verifier".to_string()))?;
        let signature = BASE64
            .decode(encoded)
            .map_err(|_| ScramError::Base64("server signature"))?;

        let expected = hmac(&state.server_key, state.auth_message.as_bytes());
        if constant_time_eq(&signature, &expected) {
            Ok(())
        } else {
            Err(ScramError::InvalidServerProof)
        }
    }
}

struct ServerFirst<'a> {
    nonce: &'a str,
    salt: Vec<u8>,
    iterations: u32,
}

/// Parse `r=<nonce>,s=<salt>,i=<iterations>[,extensions]`
fn parse_server_first(msg: &str) -> Result<ServerFirst<'_>, ScramError> {
    let (mut nonce, mut salt, mut iterations) = (None, None, None);

    for attr in msg.split(',') {
        match attr.split_once('=') {
            Some(("r", v)) if !v.is_empty() => nonce = Some(v),
            Some(("s", v)) if !v.is_empty() => salt = Some(v),
            Some(("i", v)) if !v.is_empty() => iterations = Some(v),
            _ => {}
        }
    }

    let missing = |field: &str| {
        ScramError::InvalidServerMessage(format!("missing '{}' in server-first-message", field))
    };
    let nonce = nonce.ok_or_else(|| missing("r"))?;
    let salt = BASE64
        .decode(salt.ok_or_else(|| missing("s"))?)
        .map_err(|_| ScramError::Base64("salt"))?;
    let iterations = iterations
        .ok_or_else(|| missing("i"))?
        .parse::<u32>()
        .ok()
        .filter(|&i| i > 0)
        .ok_or_else(|| ScramError::InvalidServerMessage("invalid iteration count".to_string()))?;
    if iterations > MAX_ITERATIONS {
        return Err(ScramError::InvalidServerMessage(format!(
            "iteration count {} exceeds limit of {}",
            iterations, MAX_ITERATIONS
        )));
    }

    Ok(ServerFirst {
        nonce,
        salt,
        iterations,
    })
}

/// Escape a username per RFC 5802 `saslname`
fn saslname(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

fn hmac(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(msg);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
