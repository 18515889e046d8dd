//! Protocol message types

use bytes::Bytes;

/// Frontend message (client → server)
#[derive(Debug, Clone)]
pub enum FrontendMessage {
    /// Startup message
    Startup {
        /// Protocol version
        version: i32,
        /// Connection parameters
        params: Vec<(String, String)>,
    },

    /// SSLRequest message (TLS negotiation)
    SslRequest,

    /// Cleartext password message
    Password(String),

    /// SASL initial response message
    SaslInitialResponse {
        /// SASL mechanism name (e.g., "SCRAM-SHA-256")
        mechanism: String,
        /// SASL client first message data
        data: Vec<u8>,
    },

    /// SASL response message
    SaslResponse {
        /// SASL client final message data
        data: Vec<u8>,
    },

    /// Simple query
    Query(String),

    /// Terminate message
    Terminate,
}

/// Backend message (server → client)
#[derive(Debug, Clone)]
pub enum BackendMessage {
    /// Authentication request
    Authentication(AuthenticationMessage),

    /// Backend key data (for cancellation)
    BackendKeyData {
        /// Process ID
        process_id: i32,
        /// Secret key
        secret_key: i32,
    },

    /// Command complete
    CommandComplete(String),

    /// Data row
    DataRow(Vec<Option<Bytes>>),

    /// Response to an empty query string
    EmptyQueryResponse,

    /// Error response
    ErrorResponse(ErrorFields),

    /// Notice response
    NoticeResponse(ErrorFields),

    /// Parameter status
    ParameterStatus {
        /// Parameter name
        name: String,
        /// Parameter value
        value: String,
    },

    /// Ready for query
    ReadyForQuery {
        /// Transaction status
        status: u8,
    },

    /// Row description
    RowDescription(Vec<FieldDescription>),
}

/// Authentication message types
#[derive(Debug, Clone)]
pub enum AuthenticationMessage {
    /// Authentication OK
    Ok,

    /// Cleartext password required
    CleartextPassword,

    /// MD5 password required
    Md5Password {
        /// Salt for MD5 hash
        salt: [u8; 4],
    },

    /// SASL authentication mechanisms available
    Sasl {
        /// Mechanism names offered by the server
        mechanisms: Vec<String>,
    },

    /// SASL challenge (server-first-message)
    SaslContinue {
        /// Raw challenge data
        data: Vec<u8>,
    },

    /// SASL outcome (server-final-message)
    SaslFinal {
        /// Raw outcome data
        data: Vec<u8>,
    },
}

/// Field description (column metadata)
#[derive(Debug, Clone)]
pub struct FieldDescription {
    /// Column name
    pub name: String,
    /// Table OID (0 if not a table column)
    pub table_oid: i32,
    /// Column attribute number (0 if not a table column)
    pub column_attr: i16,
    /// Data type OID
    pub type_oid: u32,
    /// Data type size
    pub type_size: i16,
    /// Type modifier
    pub type_modifier: i32,
    /// Format code (0 = text, 1 = binary)
    pub format_code: i16,
}

/// Error/notice fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    /// Severity (ERROR, FATAL, WARNING, ...)
    pub severity: Option<String>,
    /// SQLSTATE code
    pub code: Option<String>,
    /// Human-readable message
    pub message: Option<String>,
    /// Additional detail
    pub detail: Option<String>,
    /// Hint
    pub hint: Option<String>,
    /// Position in query string
    pub position: Option<String>,
}

impl ErrorFields {
    /// SQLSTATE code, if the server sent one
    pub fn sqlstate(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref severity) = self.severity {
            write!(f, "{}: ", severity)?;
        }
        f.write_str(self.message.as_deref().unwrap_or("unknown server error"))?;
        if let Some(ref code) = self.code {
            write!(f, " ({})", code)?;
        }
        if let Some(ref detail) = self.detail {
            write!(f, "; detail: {}", detail)?;
        }
        if let Some(ref hint) = self.hint {
            write!(f, "; hint: {}", hint)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_fields_display() {
        let fields = ErrorFields {
            severity: Some("ERROR".into()),
            code: Some("42883".into()),
            message: Some("function inet_server_addr() does not exist".into()),
            ..Default::default()
        };
        assert_eq!(
            fields.to_string(),
            "ERROR: function inet_server_addr() does not exist (42883)"
        );
        assert_eq!(fields.sqlstate(), Some("42883"));
    }

    #[test]
    fn test_error_fields_display_with_hint() {
        let fields = ErrorFields {
            message: Some("password authentication failed".into()),
            hint: Some("token may have expired".into()),
            ..Default::default()
        };
        assert_eq!(
            fields.to_string(),
            "password authentication failed; hint: token may have expired"
        );
    }
}
