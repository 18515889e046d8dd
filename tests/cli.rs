//! Exit codes and diagnostics of the `dsql-probe` binary

use std::process::{Command, Output};
use std::time::{Duration, Instant};

fn probe(env: &[(&str, &str)], args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_dsql-probe"))
        .env_clear()
        .envs(env.iter().copied())
        .args(args)
        .output()
        .expect("failed to run dsql-probe")
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_missing_hostname_exits_with_configuration_error() {
    let output = probe(&[("PGHOSTADDR", "127.0.0.1"), ("PGPASSWORD", "tok")], &[]);

    assert_eq!(output.status.code(), Some(2));
    let err = stderr(&output);
    assert!(err.contains("Configuration Error"), "stderr: {}", err);
    assert!(err.contains("HOSTNAME"), "stderr: {}", err);
    assert!(output.stdout.is_empty());
}

#[test]
fn test_each_missing_variable_is_named() {
    let all = [
        ("HOSTNAME", "db.example"),
        ("PGHOSTADDR", "127.0.0.1"),
        ("PGPASSWORD", "tok"),
    ];

    for (missing, _) in all {
        let env: Vec<_> = all.iter().copied().filter(|(k, _)| *k != missing).collect();
        let output = probe(&env, &[]);

        assert_eq!(output.status.code(), Some(2));
        let err = stderr(&output);
        assert!(
            err.contains(&format!("required environment variable {} is not set", missing)),
            "stderr: {}",
            err
        );
    }
}

#[test]
fn test_invalid_sslmode_is_rejected() {
    let output = probe(
        &[
            ("HOSTNAME", "db.example"),
            ("PGHOSTADDR", "127.0.0.1"),
            ("PGPASSWORD", "tok"),
            ("PGSSLMODE", "verify-full"),
        ],
        &[],
    );

    assert_eq!(output.status.code(), Some(2));
    let err = stderr(&output);
    assert!(err.contains("PGSSLMODE"), "stderr: {}", err);
    assert!(err.contains("verify-full"), "stderr: {}", err);
}

#[test]
fn test_unknown_flag_is_usage_error() {
    let output = probe(&[], &["--no-such-flag"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_unreachable_tunnel_exits_nonzero_within_timeout() {
    // Whatever answers on 127.0.0.1:5432 here (nothing, or a Postgres that
    // does not know this token or this name), the probe must give up.
    let start = Instant::now();
    let output = probe(
        &[
            ("HOSTNAME", "db.example"),
            ("PGHOSTADDR", "127.0.0.1"),
            ("PGPASSWORD", "tok"),
        ],
        &["--connect-timeout", "3"],
    );

    assert_eq!(output.status.code(), Some(3), "stderr: {}", stderr(&output));
    assert!(stderr(&output).contains("Troubleshooting tips"));
    assert!(start.elapsed() < Duration::from_secs(10));
}
