/// Debugger detection.
///
/// A worker paused on a breakpoint looks exactly like a hung worker, so the
/// supervisor asks a probe before reporting or escalating a stall.
use std::path::PathBuf;

pub trait DebuggerProbe: Send + Sync {
    /// Whether a debugger is attached to this process right now.
    fn is_attached(&self) -> bool;
}

/// Probe that never reports a debugger.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDebugger;

impl DebuggerProbe for NoDebugger {
    fn is_attached(&self) -> bool {
        false
    }
}

/// Reads `TracerPid` from `/proc/self/status` (Linux).
///
/// Any ptrace-based debugger (gdb, lldb, a debug adapter) shows up as a
/// non-zero tracer pid.
#[derive(Debug, Clone)]
pub struct TracerPidProbe {
    status_path: PathBuf,
}

impl Default for TracerPidProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl TracerPidProbe {
    pub fn new() -> Self {
        Self::with_status_path("/proc/self/status")
    }

    pub fn with_status_path(path: impl Into<PathBuf>) -> Self {
        Self {
            status_path: path.into(),
        }
    }

    /// Pid of the attached tracer, if any.
    pub fn tracer_pid(&self) -> Option<u32> {
        let text = std::fs::read_to_string(&self.status_path).ok()?;
        parse_tracer_pid(&text).filter(|pid| *pid != 0)
    }
}

impl DebuggerProbe for TracerPidProbe {
    fn is_attached(&self) -> bool {
        self.tracer_pid().is_some()
    }
}

fn parse_tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}
