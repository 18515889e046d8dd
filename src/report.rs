//! Human and machine readable probe output

use crate::connection::SslMode;
use serde::Serialize;
use std::net::IpAddr;

/// What a successful probe learned about the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionReport {
    /// `current_database()`
    pub database: String,
    /// `current_user`
    pub user: String,
    /// `version()`
    pub server_version: String,
    /// Address the socket dialed
    pub tunnel_addr: IpAddr,
    /// Port the socket dialed
    pub port: u16,
    /// Name asserted over TLS
    pub hostname: String,
    /// Whether the session was encrypted
    pub tls: bool,
    /// Mode the session was opened with
    pub sslmode: SslMode,
}

impl ConnectionReport {
    /// Pretty-printed JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl std::fmt::Display for ConnectionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Connection Information:")?;
        writeln!(f, "======================")?;
        writeln!(f, "Database: {}", self.database)?;
        writeln!(f, "User: {}", self.user)?;
        writeln!(
            f,
            "Host: {} (via tunnel to {})",
            self.tunnel_addr, self.hostname
        )?;
        writeln!(f, "Port: {}", self.port)?;
        if self.tls {
            writeln!(f, "SSL Status: SSL connection (required by DSQL)")?;
        } else {
            writeln!(f, "SSL Status: no SSL (sslmode={})", self.sslmode)?;
        }
        write!(f, "Server Version: {}", self.server_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(tls: bool) -> ConnectionReport {
        ConnectionReport {
            database: "postgres".into(),
            user: "admin".into(),
            server_version: "PostgreSQL 16".into(),
            tunnel_addr: "127.0.0.1".parse().unwrap(),
            port: 5432,
            hostname: "db.example".into(),
            tls,
            sslmode: if tls { SslMode::Require } else { SslMode::Disable },
        }
    }

    #[test]
    fn test_text_layout() {
        let expected = "\
Connection Information:
======================
Database: postgres
User: admin
Host: 127.0.0.1 (via tunnel to db.example)
Port: 5432
SSL Status: SSL connection (required by DSQL)
Server Version: PostgreSQL 16";
        assert_eq!(report(true).to_string(), expected);
    }

    #[test]
    fn test_text_without_tls() {
        let text = report(false).to_string();
        assert!(text.contains("SSL Status: no SSL (sslmode=disable)"));
        assert!(!text.contains("required by DSQL"));
    }

    #[test]
    fn test_json() {
        let json = report(true).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["database"], "postgres");
        assert_eq!(value["tunnel_addr"], "127.0.0.1");
        assert_eq!(value["port"], 5432);
        assert_eq!(value["tls"], true);
        assert_eq!(value["sslmode"], "require");
    }
}
