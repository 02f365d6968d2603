//! pgrok CLI - expose a local port at https://<subdomain>.<domain>

mod dashboard;
mod diagnostics;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{ArgAction, Parser};
use pgrok_client::{RelayConfig, Session, SessionError, SessionOptions, Subdomain};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use dashboard::Dashboard;
use diagnostics::DiagnosticBuffer;

/// pgrok - expose a local port through your own relay host
#[derive(Parser, Debug)]
#[command(name = "pgrok")]
#[command(about = "Expose a local port at https://<subdomain>.<domain> through a relay host")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(disable_version_flag = true, arg_required_else_help = true)]
struct Cli {
    /// Public subdomain (lowercase letters, digits and hyphens)
    subdomain: String,

    /// Local port to expose
    local_port: String,

    /// On exit, save the diagnostic log to a temp file and print it
    #[arg(long, visible_alias = "debug")]
    print_logs: bool,

    /// Config file (default: ~/.pgrok/config)
    #[arg(long, env = "PGROK_CONFIG")]
    config: Option<PathBuf>,

    /// Log level for stderr (trace, debug, info, warn, error); RUST_LOG wins
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Program run in place of ssh
    #[arg(long, env = "PGROK_SSH", hide = true)]
    ssh_program: Option<String>,

    /// Print version
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    let diagnostics = cli.print_logs.then(DiagnosticBuffer::default);
    if let Err(e) = init_logging(&cli.log_level, diagnostics.as_ref()) {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(cli, diagnostics).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log_level: &str, diagnostics: Option<&DiagnosticBuffer>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter);

    let buffered = diagnostics.map(|buffer| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(buffer.clone())
            .with_filter(LevelFilter::DEBUG)
    });

    tracing_subscriber::registry()
        .with(console)
        .with(buffered)
        .try_init()
        .context("Failed to install logger")?;

    Ok(())
}

/// Validate the arguments, then load the config; nothing is opened yet
fn prepare(cli: &Cli) -> Result<(SessionOptions, RelayConfig), SessionError> {
    let mut options = SessionOptions::from_args(&cli.subdomain, &cli.local_port)?;
    if let Some(program) = &cli.ssh_program {
        options = options.with_transport(program.clone(), Vec::<String>::new());
    }

    let path = RelayConfig::resolve_path(cli.config.as_deref())?;
    debug!("Loading config from {}", path.display());
    let relay = RelayConfig::load(&path)?;

    Ok((options, relay))
}

async fn run(cli: Cli, diagnostics: Option<DiagnosticBuffer>) -> Result<ExitCode> {
    let result = run_session(&cli).await;
    if let Err(e) = &result {
        debug!("Session failed: {:#}", e);
    }

    // Saved on failure too; a failed start is when the debug log matters most
    if let Some(buffer) = diagnostics {
        dump_diagnostics(&buffer, &log_name(&cli.subdomain));
    }

    result
}

async fn run_session(cli: &Cli) -> Result<ExitCode> {
    let (options, relay) = prepare(cli)?;
    let local_port = options.local_port;

    let mut session = Session::start(options, &relay)
        .await
        .context("Failed to start tunnel session")?;
    let dashboard = Dashboard::attach(&session, local_port);

    let exit_code = tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal, shutting down...");
            ExitCode::SUCCESS
        }
        _ = session.tunnel_exited() => {
            info!("Tunnel process ended");
            ExitCode::FAILURE
        }
    };

    session.shutdown();
    dashboard.release(&session.stats()).await;

    Ok(exit_code)
}

/// Subdomain used in the diagnostic file name, or a placeholder if it is invalid
fn log_name(subdomain: &str) -> String {
    Subdomain::parse(subdomain)
        .map(|subdomain| subdomain.to_string())
        .unwrap_or_else(|_| "invalid".to_string())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn dump_diagnostics(buffer: &DiagnosticBuffer, subdomain: &str) {
    println!();
    match buffer.save(subdomain) {
        Ok(path) => println!("Diagnostic log saved to {}", path.display()),
        Err(e) => eprintln!("Failed to save diagnostic log: {}", e),
    }
    for line in buffer.snapshot() {
        println!("{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_positionals_and_flags() {
        let cli = Cli::try_parse_from(["pgrok", "demo", "3000", "--debug"]).unwrap();
        assert_eq!(cli.subdomain, "demo");
        assert_eq!(cli.local_port, "3000");
        assert!(cli.print_logs);
        assert_eq!(cli.log_level, "warn");

        let cli = Cli::try_parse_from(["pgrok", "--print-logs", "api", "8080"]).unwrap();
        assert!(cli.print_logs);
    }

    #[test]
    fn test_version_and_help_kinds() {
        let version = Cli::try_parse_from(["pgrok", "-v"]).unwrap_err();
        assert_eq!(version.kind(), ErrorKind::DisplayVersion);

        let version = Cli::try_parse_from(["pgrok", "--version"]).unwrap_err();
        assert_eq!(version.kind(), ErrorKind::DisplayVersion);

        let help = Cli::try_parse_from(["pgrok", "-h"]).unwrap_err();
        assert_eq!(help.kind(), ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_missing_arguments_are_errors() {
        let none = Cli::try_parse_from(["pgrok"]).unwrap_err();
        assert_eq!(
            none.kind(),
            ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        );

        let one = Cli::try_parse_from(["pgrok", "demo"]).unwrap_err();
        assert_eq!(one.kind(), ErrorKind::MissingRequiredArgument);
    }

    fn cli_with_config(subdomain: &str, port: &str, config: &std::path::Path) -> Cli {
        Cli::try_parse_from([
            "pgrok",
            subdomain,
            port,
            "--config",
            config.to_str().unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn test_prepare_validates_before_loading_config() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("config");

        let err = prepare(&cli_with_config("Bad_Name", "3000", &missing)).unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));

        let err = prepare(&cli_with_config("demo", "0", &missing)).unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));

        let err = prepare(&cli_with_config("demo", "3000", &missing)).unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
        assert!(err.to_string().starts_with("Config file not found"));
    }

    #[test]
    fn test_log_name() {
        assert_eq!(log_name("demo"), "demo");
        assert_eq!(log_name("../etc"), "invalid");
    }

    #[tokio::test]
    async fn test_failed_start_still_saves_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let cli = cli_with_config("diag-start-failure", "3000", &dir.path().join("config"));

        let buffer = DiagnosticBuffer::default();
        buffer.push_line("DEBUG loading config");
        let before = chrono::Utc::now().timestamp();

        assert!(run(cli, Some(buffer)).await.is_err());

        let saved = std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                let name = path.file_name().unwrap().to_string_lossy().into_owned();
                name.strip_prefix("pgrok-diag-start-failure-")
                    .and_then(|rest| rest.strip_suffix(".log"))
                    .and_then(|ts| ts.parse::<i64>().ok())
                    .is_some_and(|ts| ts >= before)
            })
            .collect::<Vec<_>>();
        assert_eq!(saved.len(), 1);
        assert!(std::fs::read_to_string(&saved[0])
            .unwrap()
            .contains("DEBUG loading config"));

        for path in saved {
            std::fs::remove_file(path).unwrap();
        }
    }

    #[test]
    fn test_prepare_loads_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "PGROK_HOST=relay.example.com\nPGROK_DOMAIN=example.com\n")
            .unwrap();

        let (options, relay) = prepare(&cli_with_config("demo", "3000", &path)).unwrap();
        assert_eq!(options.local_port, 3000);
        assert_eq!(relay.destination(), "pgrok@relay.example.com");
        assert_eq!(relay.public_url(&options.subdomain), "https://demo.example.com");
    }
}
