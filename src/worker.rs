/// Units of work a supervisor can wait on: OS threads and child processes.
///
/// The supervisor only observes a worker (liveness and bounded wait); the
/// caller keeps ownership and decides when to kill or reap it.
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::fmt;
use std::io;
use std::process::{Child, Command, ExitStatus};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Stable, human-readable identifier for a worker (its name, or its OS id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u32> for WorkerId {
    fn from(n: u32) -> Self {
        Self(n.to_string())
    }
}

/// Low-level execution identifier: a kernel thread id or a process id.
///
/// On Linux both live in the same namespace, so one type covers threads of
/// this process and child processes alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecId(pub i32);

impl fmt::Display for ExecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution id of the calling thread, where the platform exposes one.
pub fn current_exec_id() -> Option<ExecId> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        Some(ExecId(nix::unistd::gettid().as_raw()))
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        None
    }
}

/// What kind of unit a worker is. Used in log text only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Thread,
    Process,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Thread => f.write_str("Thread"),
            WorkerKind::Process => f.write_str("Process"),
        }
    }
}

/// Failure of the wait operation itself (as opposed to a timeout).
#[derive(Debug)]
pub enum JoinError {
    /// A lock guarding worker state was poisoned.
    Poisoned,
    /// The OS refused to report the worker's status.
    Wait { source: io::Error },
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Poisoned => write!(f, "worker state lock poisoned"),
            JoinError::Wait { source } => write!(f, "failed to wait on worker: {}", source),
        }
    }
}

impl std::error::Error for JoinError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JoinError::Poisoned => None,
            JoinError::Wait { source } => Some(source),
        }
    }
}

/// A unit of concurrent execution the supervisor can wait on.
pub trait Worker: Send + Sync {
    /// Identifier used to tag log lines and name background tasks.
    fn id(&self) -> WorkerId;

    fn kind(&self) -> WorkerKind;

    /// Identifier used for stack introspection, if known yet.
    fn exec_id(&self) -> Option<ExecId>;

    fn is_alive(&self) -> bool;

    /// Wait at most `timeout` for the worker to finish.
    ///
    /// Returning `Ok` says nothing about completion; callers re-check
    /// [`Worker::is_alive`] afterwards.
    fn join_timeout(&self, timeout: Duration) -> Result<(), JoinError>;
}

/// One-shot completion flag that can be waited on with a deadline.
#[derive(Debug, Default)]
struct Latch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    fn set(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        *done = true;
        self.cond.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_timeout(&self, timeout: Duration) -> Result<bool, JoinError> {
        let done = self.done.lock().map_err(|_| JoinError::Poisoned)?;
        let (done, _) = self
            .cond
            .wait_timeout_while(done, timeout, |done| !*done)
            .map_err(|_| JoinError::Poisoned)?;
        Ok(*done)
    }
}

/// Sets the latch when the worker closure returns or unwinds.
struct CompletionGuard(Arc<Latch>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.set();
    }
}

/// A named OS thread whose completion can be awaited with a timeout.
pub struct ThreadWorker<T> {
    id: WorkerId,
    exec: Arc<OnceLock<ExecId>>,
    latch: Arc<Latch>,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> ThreadWorker<T> {
    /// Spawn `f` on a new thread named `name`.
    pub fn spawn<F>(name: impl Into<String>, f: F) -> io::Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let name = name.into();
        let exec = Arc::new(OnceLock::new());
        let latch = Arc::new(Latch::default());

        let thread_exec = Arc::clone(&exec);
        let thread_latch = Arc::clone(&latch);
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let _guard = CompletionGuard(thread_latch);
            if let Some(id) = current_exec_id() {
                let _ = thread_exec.set(id);
            }
            f()
        })?;

        Ok(Self {
            id: WorkerId::new(name),
            exec,
            latch,
            handle,
        })
    }

    /// Collect the thread's result once it has finished.
    ///
    /// Returns `Err(self)` while the thread is still running, so the
    /// caller never blocks here.
    pub fn into_result(self) -> Result<thread::Result<T>, Self> {
        if self.latch.is_set() {
            Ok(self.handle.join())
        } else {
            Err(self)
        }
    }
}

impl<T: Send + 'static> Worker for ThreadWorker<T> {
    fn id(&self) -> WorkerId {
        self.id.clone()
    }

    fn kind(&self) -> WorkerKind {
        WorkerKind::Thread
    }

    fn exec_id(&self) -> Option<ExecId> {
        self.exec.get().copied()
    }

    fn is_alive(&self) -> bool {
        !self.latch.is_set()
    }

    fn join_timeout(&self, timeout: Duration) -> Result<(), JoinError> {
        self.latch.wait_timeout(timeout).map(|_| ())
    }
}

/// An OS child process, observed through non-blocking `try_wait` polls.
pub struct ProcessWorker {
    id: WorkerId,
    pid: u32,
    child: Mutex<Child>,
    status: OnceLock<ExitStatus>,
    poll_interval: Duration,
}

impl ProcessWorker {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

    /// Wrap an already spawned child, identified by `name`.
    pub fn new(name: impl Into<String>, child: Child) -> Self {
        Self {
            id: WorkerId::new(name),
            pid: child.id(),
            child: Mutex::new(child),
            status: OnceLock::new(),
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    /// Wrap a child identified only by its pid.
    pub fn from_child(child: Child) -> Self {
        let name = child.id().to_string();
        Self::new(name, child)
    }

    /// Spawn `command`, naming the worker after the program and pid.
    pub fn spawn(command: &mut Command) -> io::Result<Self> {
        let program = command.get_program().to_string_lossy().into_owned();
        let child = command.spawn()?;
        let name = format!("{}-{}", program, child.id());
        Ok(Self::new(name, child))
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit status, once the process has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status.get().copied()
    }

    /// Send `signal` to the process. No-op once it has been reaped.
    pub fn signal(&self, signal: Signal) -> nix::Result<()> {
        if self.exit_status().is_some() {
            return Ok(());
        }
        nix::sys::signal::kill(Pid::from_raw(self.pid as i32), signal)
    }

    /// Send `signal` to the process group led by this process.
    ///
    /// Only meaningful when the child was spawned with `process_group(0)`.
    pub fn signal_group(&self, signal: Signal) -> nix::Result<()> {
        if self.exit_status().is_some() {
            return Ok(());
        }
        nix::sys::signal::killpg(Pid::from_raw(self.pid as i32), signal)
    }

    /// Forcefully kill the process (SIGKILL).
    pub fn kill(&self) -> io::Result<()> {
        if self.exit_status().is_some() {
            return Ok(());
        }
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        child.kill()
    }

    fn try_reap(&self) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.status.get() {
            return Ok(Some(*status));
        }
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let status = child.try_wait()?;
        if let Some(status) = status {
            let _ = self.status.set(status);
        }
        Ok(status)
    }
}

impl Worker for ProcessWorker {
    fn id(&self) -> WorkerId {
        self.id.clone()
    }

    fn kind(&self) -> WorkerKind {
        WorkerKind::Process
    }

    fn exec_id(&self) -> Option<ExecId> {
        i32::try_from(self.pid).ok().map(ExecId)
    }

    fn is_alive(&self) -> bool {
        match self.try_reap() {
            Ok(status) => status.is_none(),
            Err(e) => {
                tracing::debug!(error = %e, pid = self.pid, "try_wait failed, assuming alive");
                true
            }
        }
    }

    fn join_timeout(&self, timeout: Duration) -> Result<(), JoinError> {
        // A timeout past the end of the clock means no deadline at all.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self
                .try_reap()
                .map_err(|e| JoinError::Wait { source: e })?
                .is_some()
            {
                return Ok(());
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    self.poll_interval.min(deadline - now)
                }
                None => self.poll_interval,
            };
            thread::sleep(pause);
        }
    }
}
