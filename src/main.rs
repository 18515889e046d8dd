//! # dsql-probe
//!
//! Connects to a DSQL cluster through an existing SSH or SSM tunnel, prints
//! what the server reports about the session, and exits.
//!
//! Configuration comes from `HOSTNAME`, `PGHOSTADDR`, `PGPASSWORD` and
//! `PGSSLMODE`, plus the optional `PGDATABASE`, `PGUSER`,
//! `PGCONNECT_TIMEOUT` and `PGSSLROOTCERT`.

use clap::{Parser, ValueEnum};
use dsql_probe::{probe, ConnectionReport, ProbeConfig, ProbeError};
use std::io::{self, Write};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dsql-probe")]
#[command(about = "Check connectivity to an AWS DSQL cluster through a local tunnel")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Output format for the connection report
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Connect timeout in seconds (overrides PGCONNECT_TIMEOUT)
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    connect_timeout: Option<u64>,

    /// Accept any server certificate. Traffic can then be intercepted.
    #[arg(long)]
    danger_accept_invalid_certs: bool,

    /// Verbose logging (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn init_tracing(verbose: u8) {
    let default_directive = match verbose {
        0 => "dsql_probe=info",
        1 => "dsql_probe=debug",
        _ => "dsql_probe=trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let report = match run(&cli).await {
        Ok(report) => report,
        Err(err) => {
            eprintln!("{}", err);
            eprintln!();
            eprintln!("{}", err.hint());
            return ExitCode::from(err.exit_code());
        }
    };

    if let Err(e) = emit(&report, cli.format, &mut io::stdout().lock()) {
        eprintln!("Output Error: failed to write connection report: {}", e);
        return ExitCode::FAILURE;
    }

    tracing::info!("connection closed, DSQL connectivity check completed");
    ExitCode::SUCCESS
}

async fn run(cli: &Cli) -> Result<ConnectionReport, ProbeError> {
    let mut config = ProbeConfig::from_env()
        .map_err(ProbeError::Configuration)?
        .with_accept_invalid_certs(cli.danger_accept_invalid_certs);

    if let Some(secs) = cli.connect_timeout {
        config = config.with_connect_timeout(Duration::from_secs(secs));
    }

    tracing::info!(
        hostname = config.hostname(),
        tunnel = %config.endpoint().addr,
        sslmode = %config.sslmode(),
        "starting DSQL connectivity check"
    );

    probe::run(&config).await
}

/// Write the report to `out` in the requested format
fn emit(report: &ConnectionReport, format: OutputFormat, out: &mut impl Write) -> io::Result<()> {
    match format {
        OutputFormat::Text => writeln!(out, "{}", report)?,
        OutputFormat::Json => writeln!(out, "{}", report.to_json()?)?,
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use dsql_probe::SslMode;

    fn report() -> ConnectionReport {
        ConnectionReport {
            database: "postgres".into(),
            user: "admin".into(),
            server_version: "PostgreSQL 16".into(),
            tunnel_addr: "127.0.0.1".parse().unwrap(),
            port: 5432,
            hostname: "db.example".into(),
            tls: true,
            sslmode: SslMode::Require,
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["dsql-probe"]).unwrap();
        assert_eq!(cli.format, OutputFormat::Text);
        assert_eq!(cli.connect_timeout, None);
        assert!(!cli.danger_accept_invalid_certs);
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "dsql-probe",
            "--format",
            "json",
            "--connect-timeout",
            "5",
            "--danger-accept-invalid-certs",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.connect_timeout, Some(5));
        assert!(cli.danger_accept_invalid_certs);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_cli_rejects_zero_timeout() {
        assert!(Cli::try_parse_from(["dsql-probe", "--connect-timeout", "0"]).is_err());
    }

    #[test]
    fn test_emit_text() {
        let mut out = Vec::new();
        emit(&report(), OutputFormat::Text, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Host: 127.0.0.1 (via tunnel to db.example)"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_emit_json() {
        let mut out = Vec::new();
        emit(&report(), OutputFormat::Json, &mut out).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["hostname"], "db.example");
        assert_eq!(value["sslmode"], "require");
    }

    #[test]
    fn test_emit_write_failure_is_io_error() {
        for format in [OutputFormat::Text, OutputFormat::Json] {
            let err = emit(&report(), format, &mut BrokenPipe).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        }
    }
}
