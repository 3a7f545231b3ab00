/// CLI session: spawn a command, supervise it, relay shutdown signals.
use crate::config::StallguardConfig;
use crate::diagnostics::ProcfsIntrospector;
use crate::escalation::{EscalationReport, ProcessTerminator, Terminator};
use crate::signals::{ShutdownSignal, SignalHandler};
use crate::supervisor::{Supervision, Supervisor};
use crate::worker::{ProcessWorker, Worker};
use nix::sys::signal::Signal;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What to run and how long to wait for it after a shutdown request.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub command: Vec<String>,
    pub grace: Duration,
}

/// Errors that stop a run before or outside supervision.
#[derive(Debug)]
pub enum RunError {
    /// No command was given.
    EmptyCommand,
    /// Failed to spawn the supervised command.
    Spawn { program: String, source: std::io::Error },
    /// Failed to install signal handlers.
    Signals { source: std::io::Error },
    /// The blocking supervision task panicked or was aborted.
    Task { source: tokio::task::JoinError },
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::EmptyCommand => write!(f, "no command to supervise"),
            RunError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program, source)
            }
            RunError::Signals { source } => {
                write!(f, "failed to install signal handlers: {}", source)
            }
            RunError::Task { source } => write!(f, "supervision task failed: {}", source),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::EmptyCommand => None,
            RunError::Spawn { source, .. } => Some(source),
            RunError::Signals { source } => Some(source),
            RunError::Task { source } => Some(source),
        }
    }
}

/// Kills the child's process group before handing over to the process
/// terminator, so escalation never leaves an orphan behind.
struct ReapingTerminator {
    child: Arc<ProcessWorker>,
    inner: Arc<dyn Terminator>,
}

impl Terminator for ReapingTerminator {
    fn terminate(&self, report: &EscalationReport) {
        kill_group(&self.child);
        self.inner.terminate(report);
    }
}

fn kill_group(child: &ProcessWorker) {
    if let Err(e) = child.signal_group(Signal::SIGKILL) {
        tracing::warn!(job = %child.id(), error = %e, "failed to kill process group");
        if let Err(e) = child.kill() {
            tracing::warn!(job = %child.id(), error = %e, "failed to kill process");
        }
    }
}

/// Exit code a shell would report for `status`.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

/// Build the supervisor described by `config` for `child`.
pub fn build_supervisor(config: &StallguardConfig, child: Arc<ProcessWorker>) -> Supervisor {
    let terminator = ReapingTerminator {
        child,
        inner: Arc::new(ProcessTerminator::new(config.escalation_action())),
    };
    Supervisor::new(config.timeout())
        .with_introspector(Arc::new(ProcfsIntrospector::new()))
        .with_escalation(config.escalation_policy(), Arc::new(terminator))
}

/// Spawn the command and supervise it to completion.
///
/// Returns the exit code the CLI should report.
pub async fn run(config: &StallguardConfig, options: RunOptions) -> Result<i32, RunError> {
    let (program, args) = options.command.split_first().ok_or(RunError::EmptyCommand)?;

    let mut command = Command::new(program);
    command.args(args).process_group(0);
    let child = ProcessWorker::spawn(&mut command).map_err(|e| RunError::Spawn {
        program: program.clone(),
        source: e,
    })?;
    let child = Arc::new(child.with_poll_interval(config.poll_interval()));
    tracing::info!(job = %child.id(), pid = child.pid(), "supervising {program}");

    let mut signals = SignalHandler::install().map_err(|e| RunError::Signals { source: e })?;
    let cancel = CancellationToken::new();
    let supervisor = build_supervisor(config, Arc::clone(&child));

    let mut supervision = {
        let child = Arc::clone(&child);
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || supervisor.join(child.as_ref(), &cancel))
    };

    let mut first_signal: Option<ShutdownSignal> = None;
    let mut grace_deadline: Option<tokio::time::Instant> = None;

    let outcome = loop {
        let deadline = grace_deadline;
        let grace = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = &mut supervision => {
                break result.map_err(|e| RunError::Task { source: e })?;
            }
            sig = signals.recv() => {
                if first_signal.is_none() {
                    first_signal = Some(sig);
                    grace_deadline = Some(tokio::time::Instant::now() + options.grace);
                    tracing::info!(
                        job = %child.id(),
                        grace_secs = options.grace.as_secs_f64(),
                        "asking child to stop"
                    );
                    if let Err(e) = child.signal_group(Signal::SIGTERM) {
                        tracing::warn!(job = %child.id(), error = %e, "failed to signal process group");
                    }
                } else {
                    tracing::warn!(job = %child.id(), "second signal, killing child");
                    kill_group(&child);
                    cancel.cancel();
                }
            }
            _ = grace => {
                tracing::warn!(job = %child.id(), "child ignored stop request, killing it");
                grace_deadline = None;
                kill_group(&child);
                cancel.cancel();
            }
        }
    };

    Ok(finish(config, &child, outcome, first_signal))
}

fn finish(
    config: &StallguardConfig,
    child: &ProcessWorker,
    outcome: Supervision,
    first_signal: Option<ShutdownSignal>,
) -> i32 {
    match outcome {
        Supervision::Joined { attempts } => {
            let code = child.exit_status().map(exit_code).unwrap_or(0);
            tracing::info!(job = %child.id(), attempts, code, "child exited");
            code
        }
        Supervision::Cancelled { attempts } => {
            kill_group(child);
            reap(child);
            tracing::info!(job = %child.id(), attempts, "supervision cancelled");
            first_signal.map(ShutdownSignal::exit_code).unwrap_or(130)
        }
        Supervision::Escalated { attempts } => {
            kill_group(child);
            reap(child);
            tracing::error!(job = %child.id(), attempts, "supervision escalated");
            config.escalation.exit_code
        }
    }
}

fn reap(child: &ProcessWorker) {
    if let Err(e) = child.join_timeout(Duration::from_secs(1)) {
        tracing::warn!(job = %child.id(), error = %e, "failed to reap child");
    }
}
