//! Loggest runner binary
//!
//! Resolves test parameters from CLI arguments and the environment,
//! spawns a process-backed isolated context, and drives a single test
//! run to completion.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use loggest_common::TestParams;
use loggest_runner::context::ContextHost;
use loggest_runner::shims::ShimConfig;
use loggest_runner::controller::{RunController, RunnerConfig};
use loggest_runner::params;
use loggest_runner::process::{HostConfig, ProcessHost};
use loggest_runner::trap::{DiagnosticTrap, ErrorSink};

#[derive(Parser)]
#[command(name = "loggest-runner")]
#[command(about = "Loggest runner - isolated single-test execution")]
#[command(version)]
struct Cli {
    /// Test module to run (a trailing `.js` is stripped)
    #[arg(long)]
    test_name: Option<String>,

    /// Account email address override
    #[arg(long = "test-param-emailAddress")]
    test_param_email_address: Option<String>,

    /// Account password override
    #[arg(long = "test-param-password")]
    test_param_password: Option<String>,

    /// Account type override (e.g. imap, activesync)
    #[arg(long = "test-param-type")]
    test_param_type: Option<String>,

    /// Slow-server flag override (any non-empty value enables it)
    #[arg(long = "test-param-slow")]
    test_param_slow: Option<String>,

    /// Root of the persisted log tree
    #[arg(long, default_value = "test-logs")]
    log_root: PathBuf,

    /// Executable hosting the isolated context
    #[arg(long, default_value = "loggest-context")]
    context_command: PathBuf,

    /// Extra argument passed to the context command (repeatable)
    #[arg(long = "context-arg")]
    context_args: Vec<String>,

    /// Root under which per-test profile directories live
    #[arg(long, default_value = "test-profile")]
    profile_root: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    /// Lookup over the hyphenated argument names the resolver uses.
    fn arg_value(&self, key: &str) -> Option<String> {
        match key {
            "test-name" => self.test_name.clone(),
            "test-param-emailAddress" => self.test_param_email_address.clone(),
            "test-param-password" => self.test_param_password.clone(),
            "test-param-type" => self.test_param_type.clone(),
            "test-param-slow" => self.test_param_slow.clone(),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("loggest runner v{}", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(()) => std::process::exit(0),
        Err(e) if e.is_configuration() => {
            error!("configuration error: {e}");
            std::process::exit(2);
        }
        Err(e) => {
            error!("run failed: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> loggest_common::Result<()> {
    let test_id = params::resolve_test_name(|key| cli.arg_value(key))?;
    let resolved = params::resolve(
        TestParams::default(),
        |key| std::env::var(key).ok(),
        |key| cli.arg_value(key),
    );
    info!(
        %test_id,
        account_type = %resolved.account_type,
        slow = resolved.slow,
        defaults = resolved.used_defaults,
        "parameters resolved"
    );

    let host = Arc::new(ProcessHost::new(HostConfig {
        command: cli.context_command.clone(),
        args: cli.context_args.clone(),
        profile_root: cli.profile_root.clone(),
    }));

    let (sink, errors_rx) = ErrorSink::channel();
    let diagnostics = host
        .take_diagnostics()
        .ok_or_else(|| loggest_common::Error::Internal("diagnostic stream already taken".into()))?;
    let trap = DiagnosticTrap::install(diagnostics, sink.clone());

    let config = RunnerConfig {
        log_root: cli.log_root.clone(),
        shims: ShimConfig::default(),
    };
    let controller = RunController::new(host, config, sink, errors_rx);
    let outcome = controller.execute(&test_id, resolved).await;

    trap.uninstall().await;

    let outcome = outcome?;
    match &outcome.log_path {
        Some(path) => info!(
            test_id = %outcome.test_id,
            errors = outcome.errors.len(),
            log = %path.display(),
            "test run complete"
        ),
        None => info!(
            test_id = %outcome.test_id,
            errors = outcome.errors.len(),
            "test run complete (log not persisted)"
        ),
    }
    Ok(())
}
