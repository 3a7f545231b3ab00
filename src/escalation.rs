/// Escalation: what to do when a worker never finishes.
///
/// The default policy never escalates and the supervisor retries forever.
/// An armed policy fires once the attempt count or the total time spent
/// waiting crosses its limit, and the supervisor hands a report to a
/// [`Terminator`] that takes the hosting process down.
use crate::worker::{WorkerId, WorkerKind};
use nix::sys::signal::Signal;
use std::fmt;
use std::time::Duration;

/// Limits after which a stall is considered unrecoverable.
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationPolicy {
    /// Escalate once this many attempts have failed to observe completion.
    pub max_attempts: Option<u64>,
    /// Escalate once supervision has lasted this long.
    pub max_elapsed: Option<Duration>,
    /// Hold off while a debugger is attached.
    pub respect_debugger: bool,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::never()
    }
}

impl EscalationPolicy {
    /// Retry forever.
    pub fn never() -> Self {
        Self {
            max_attempts: None,
            max_elapsed: None,
            respect_debugger: true,
        }
    }

    pub fn after_attempts(attempts: u64) -> Self {
        Self {
            max_attempts: Some(attempts),
            ..Self::never()
        }
    }

    pub fn after_elapsed(elapsed: Duration) -> Self {
        Self {
            max_elapsed: Some(elapsed),
            ..Self::never()
        }
    }

    /// Whether any limit is configured.
    pub fn is_armed(&self) -> bool {
        self.max_attempts.is_some() || self.max_elapsed.is_some()
    }

    /// Check the limits after `attempts` failed attempts spanning `elapsed`.
    ///
    /// The attempt limit is checked first.
    pub fn evaluate(&self, attempts: u64, elapsed: Duration) -> Option<EscalationReason> {
        if let Some(limit) = self.max_attempts {
            if attempts >= limit {
                return Some(EscalationReason::Attempts { attempts, limit });
            }
        }
        if let Some(limit) = self.max_elapsed {
            if elapsed >= limit {
                return Some(EscalationReason::Elapsed { elapsed, limit });
            }
        }
        None
    }
}

/// Which limit fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationReason {
    Attempts { attempts: u64, limit: u64 },
    Elapsed { elapsed: Duration, limit: Duration },
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationReason::Attempts { attempts, limit } => {
                write!(f, "{attempts} join attempts failed (limit {limit})")
            }
            EscalationReason::Elapsed { elapsed, limit } => write!(
                f,
                "worker still running after {:.1}s (limit {:.1}s)",
                elapsed.as_secs_f64(),
                limit.as_secs_f64()
            ),
        }
    }
}

/// Everything a terminator is told about the stall.
#[derive(Debug, Clone)]
pub struct EscalationReport {
    pub worker: WorkerId,
    pub kind: WorkerKind,
    pub reason: EscalationReason,
    pub attempts: u64,
    pub elapsed: Duration,
}

impl fmt::Display for EscalationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} could not be joined: {}",
            self.kind, self.worker, self.reason
        )
    }
}

/// Takes the hosting process down once escalation fires.
///
/// Implementations normally do not return. If one does, the supervisor
/// stops retrying and reports the supervision as escalated.
pub trait Terminator: Send + Sync {
    fn terminate(&self, report: &EscalationReport);
}

/// How [`ProcessTerminator`] ends the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationAction {
    /// `abort()`: immediate, leaves a core dump where enabled.
    Abort,
    /// Raise SIGTERM on ourselves so installed handlers can clean up.
    Terminate,
    /// Exit with the given status code.
    Exit(i32),
}

/// Terminates the current process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessTerminator {
    action: EscalationAction,
}

impl ProcessTerminator {
    pub fn new(action: EscalationAction) -> Self {
        Self { action }
    }

    pub fn action(&self) -> EscalationAction {
        self.action
    }
}

impl Default for ProcessTerminator {
    fn default() -> Self {
        Self::new(EscalationAction::Abort)
    }
}

impl Terminator for ProcessTerminator {
    fn terminate(&self, report: &EscalationReport) {
        tracing::error!(
            job = %report.worker,
            action = ?self.action,
            "terminating process: {report}"
        );
        match self.action {
            EscalationAction::Abort => std::process::abort(),
            EscalationAction::Exit(code) => std::process::exit(code),
            EscalationAction::Terminate => {
                // With a SIGTERM handler installed this returns and the
                // handler's owner decides how to shut down.
                if let Err(e) = nix::sys::signal::raise(Signal::SIGTERM) {
                    tracing::error!(error = %e, "failed to raise SIGTERM, aborting");
                    std::process::abort();
                }
            }
        }
    }
}
