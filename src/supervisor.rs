/// Bounded join supervision.
///
/// A [`Supervisor`] waits for a worker in fixed-length attempts. Each attempt
/// that ends with the worker still running is logged as a warning together
/// with a diagnostic snapshot of the worker's stack, and the supervisor tries
/// again. It stops only when:
///
/// - the worker has finished (`Supervision::Joined`)
/// - the cancellation token fires (`Supervision::Cancelled`)
/// - the escalation policy fires and its terminator returns (`Supervision::Escalated`)
///
/// With the default policy and a token nobody cancels, only the first can
/// happen: a hung worker keeps the caller waiting, loudly, instead of being
/// silently abandoned.
use crate::debugger::{DebuggerProbe, TracerPidProbe};
use crate::diagnostics::{capture_stack, ProcfsIntrospector, StackIntrospect};
use crate::escalation::{EscalationPolicy, EscalationReport, ProcessTerminator, Terminator};
use crate::worker::{JoinError, Worker, WorkerId, WorkerKind};
use std::error::Error as _;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Result of a single bounded wait.
#[derive(Debug)]
pub enum AttemptOutcome {
    Finished,
    TimedOut,
    /// The wait itself failed. Retried like a timeout.
    Failed(JoinError),
}

/// One numbered join attempt.
#[derive(Debug)]
pub struct JoinAttempt {
    /// 1-based, strictly increasing within one supervision.
    pub number: u64,
    pub timeout: Duration,
    pub outcome: AttemptOutcome,
}

/// How a supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supervision {
    /// The worker terminated. `attempts` is 0 when it was already done.
    Joined { attempts: u64 },
    Cancelled { attempts: u64 },
    Escalated { attempts: u64 },
}

impl Supervision {
    pub fn is_joined(&self) -> bool {
        matches!(self, Supervision::Joined { .. })
    }

    pub fn attempts(&self) -> u64 {
        match self {
            Supervision::Joined { attempts }
            | Supervision::Cancelled { attempts }
            | Supervision::Escalated { attempts } => *attempts,
        }
    }
}

/// Waits for workers with a per-attempt timeout, diagnosing every stall.
///
/// Cheap to clone; collaborators are shared.
#[derive(Clone)]
pub struct Supervisor {
    timeout: Duration,
    introspector: Arc<dyn StackIntrospect>,
    debugger: Arc<dyn DebuggerProbe>,
    escalation: EscalationPolicy,
    terminator: Arc<dyn Terminator>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TIMEOUT)
    }
}

impl Supervisor {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Smallest accepted per-attempt timeout; shorter values are raised to it.
    pub const MIN_TIMEOUT: Duration = Duration::from_millis(1);

    /// Supervisor with procfs diagnostics, tracer-pid debugger detection and
    /// no escalation.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: timeout.max(Self::MIN_TIMEOUT),
            introspector: Arc::new(ProcfsIntrospector::new()),
            debugger: Arc::new(TracerPidProbe::new()),
            escalation: EscalationPolicy::never(),
            terminator: Arc::new(ProcessTerminator::default()),
        }
    }

    pub fn with_introspector(mut self, introspector: Arc<dyn StackIntrospect>) -> Self {
        self.introspector = introspector;
        self
    }

    pub fn with_debugger(mut self, debugger: Arc<dyn DebuggerProbe>) -> Self {
        self.debugger = debugger;
        self
    }

    pub fn with_escalation(
        mut self,
        policy: EscalationPolicy,
        terminator: Arc<dyn Terminator>,
    ) -> Self {
        self.escalation = policy;
        self.terminator = terminator;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn escalation(&self) -> &EscalationPolicy {
        &self.escalation
    }

    /// Run one bounded wait and classify it.
    pub fn attempt<W: Worker + ?Sized>(&self, worker: &W, number: u64) -> JoinAttempt {
        let outcome = match worker.join_timeout(self.timeout) {
            Ok(()) if !worker.is_alive() => AttemptOutcome::Finished,
            Ok(()) => AttemptOutcome::TimedOut,
            Err(e) => AttemptOutcome::Failed(e),
        };
        JoinAttempt {
            number,
            timeout: self.timeout,
            outcome,
        }
    }

    /// Wait for `worker` to finish, retrying until it does or `cancel` fires.
    ///
    /// Returns immediately, without logging, if the worker is already done.
    pub fn join<W: Worker + ?Sized>(&self, worker: &W, cancel: &CancellationToken) -> Supervision {
        if !worker.is_alive() {
            return Supervision::Joined { attempts: 0 };
        }

        let id = worker.id();
        let kind = worker.kind();
        let started = Instant::now();
        let mut attempts: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                tracing::info!(job = %id, attempts, "Supervision of {kind} {id} cancelled");
                return Supervision::Cancelled { attempts };
            }

            attempts += 1;
            tracing::info!(job = %id, "Attempting to join {kind} {id} (attempt {attempts})");

            let attempt = self.attempt(worker, attempts);
            match attempt.outcome {
                AttemptOutcome::Finished => {
                    tracing::info!(job = %id, attempts, "Successfully joined {kind} {id}");
                    return Supervision::Joined { attempts };
                }
                AttemptOutcome::TimedOut => {
                    self.report_stall(worker, &id, kind, attempt.number, attempt.timeout)
                }
                AttemptOutcome::Failed(e) => {
                    tracing::error!(
                        job = %id,
                        attempt = attempt.number,
                        "Error joining {kind} {id}: {}",
                        error_chain(&e)
                    );
                }
            }

            if let Some(reason) = self.escalation.evaluate(attempts, started.elapsed()) {
                if self.escalation.respect_debugger && self.debugger.is_attached() {
                    tracing::warn!(
                        job = %id,
                        "Escalation held off while a debugger is attached: {reason}"
                    );
                    continue;
                }
                let report = EscalationReport {
                    worker: id.clone(),
                    kind,
                    reason,
                    attempts,
                    elapsed: started.elapsed(),
                };
                tracing::error!(job = %id, attempts, "{report}, escalating");
                self.terminator.terminate(&report);
                return Supervision::Escalated { attempts };
            }
        }
    }

    fn report_stall<W: Worker + ?Sized>(
        &self,
        worker: &W,
        id: &WorkerId,
        kind: WorkerKind,
        number: u64,
        timeout: Duration,
    ) {
        let paused = if self.debugger.is_attached() {
            " (debugger attached, worker may be paused)"
        } else {
            ""
        };
        tracing::warn!(
            job = %id,
            attempt = number,
            "{kind} {id} did not join within {timeout:?} timeout{paused}"
        );

        // Captured right after the wait expired, never reused across attempts.
        let snapshot = capture_stack(self.introspector.as_ref(), id, worker.exec_id());
        tracing::warn!(job = %id, attempt = number, "{kind} {snapshot}");
    }
}

/// `err` followed by one `caused by:` line per source.
fn error_chain(err: &JoinError) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = write!(out, "\ncaused by: {cause}");
        source = cause.source();
    }
    out
}

/// Block until `worker` finishes, with the default collaborators.
///
/// Returns `true` once the worker has terminated. A worker that never
/// finishes keeps this call retrying indefinitely.
pub fn supervise<W: Worker + ?Sized>(worker: &W, timeout: Duration) -> bool {
    Supervisor::new(timeout)
        .join(worker, &CancellationToken::new())
        .is_joined()
}
