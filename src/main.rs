use clap::Parser;
use stallguard::config::{self, StallguardConfig};
use stallguard::logging;
use stallguard::run::{self, RunOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Run a command under a bounded-join supervisor: wait for it in fixed
/// attempts, log a stack snapshot every time an attempt times out, and
/// escalate if it never finishes.
#[derive(Parser, Debug)]
#[command(name = "stallguard", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "stallguard.toml")]
    config: PathBuf,

    /// Per-attempt timeout in seconds (overrides config)
    #[arg(long)]
    timeout: Option<f64>,

    /// Escalate after this many attempts (overrides config)
    #[arg(long)]
    max_attempts: Option<u64>,

    /// Escalate after this many seconds (overrides config)
    #[arg(long)]
    max_elapsed: Option<f64>,

    /// Seconds to wait for the command after forwarding a shutdown signal
    #[arg(long, default_value_t = 10.0)]
    grace_secs: f64,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Command to supervise, after `--`
    #[arg(trailing_var_arg = true, required_unless_present = "dry_run")]
    command: Vec<String>,
}

/// Exit code for configuration and startup errors.
const EXIT_USAGE: u8 = 2;

fn resolve_config(cli: &Cli) -> Result<StallguardConfig, config::ConfigError> {
    let mut config = config::load(&cli.config)?;

    let level = if cli.verbose {
        "debug".to_string()
    } else if cli.quiet {
        "warn".to_string()
    } else {
        config.logging.level.clone()
    };
    if let Err(e) = logging::init(&level, None) {
        eprintln!("stallguard: failed to initialise logging: {e}");
    }

    config.apply_overrides(|key| std::env::var(key).ok());
    if let Some(timeout) = cli.timeout {
        config.supervise.timeout_secs = timeout;
    }
    if let Some(attempts) = cli.max_attempts {
        config.escalation.max_attempts = Some(attempts);
    }
    if let Some(elapsed) = cli.max_elapsed {
        config.escalation.max_elapsed_secs = Some(elapsed);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match resolve_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("stallguard: {e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };
    tracing::debug!(?cli, "parsed CLI arguments");

    if cli.dry_run {
        match toml::to_string_pretty(&config) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("stallguard: failed to render config: {e}");
                return ExitCode::from(EXIT_USAGE);
            }
        }
        return ExitCode::SUCCESS;
    }

    let grace = Duration::try_from_secs_f64(cli.grace_secs).unwrap_or(Duration::from_secs(10));
    let options = RunOptions {
        command: cli.command.clone(),
        grace,
    };

    match run::run(&config, options).await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("stallguard: {e}");
            ExitCode::from(EXIT_USAGE)
        }
    }
}
