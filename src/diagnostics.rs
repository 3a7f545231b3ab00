/// Stall diagnostics: snapshots of what a still-running worker is doing.
///
/// Introspectors map low-level execution ids to stack frames. Two sources are
/// provided: [`SpanStacks`], a tracing layer that tracks the entered span stack
/// of every thread, and [`ProcfsIntrospector`], which reads the kernel's view of
/// a thread or process from `/proc`. An id that is absent from the mapping is
/// an expected outcome and yields an unavailable [`Snapshot`].
use crate::worker::{current_exec_id, ExecId, WorkerId};
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// One entry of a rendered stack, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub label: String,
    /// Source location (`file:line`) when known.
    pub location: Option<String>,
}

impl Frame {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            location: None,
        }
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} ({})", self.label, location),
            None => f.write_str(&self.label),
        }
    }
}

/// Source of per-execution-context stack frames.
pub trait StackIntrospect: Send + Sync {
    /// Frames of every execution context currently visible.
    fn current_frames(&self) -> HashMap<ExecId, Vec<Frame>>;

    /// Frames of a single execution context, if visible.
    fn frames_of(&self, id: ExecId) -> Option<Vec<Frame>> {
        self.current_frames().remove(&id)
    }
}

/// Textual capture of a worker's execution state at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub worker: WorkerId,
    pub exec_id: Option<ExecId>,
    /// Rendered trace, or `None` when no introspector could see the worker.
    pub trace: Option<String>,
}

impl Snapshot {
    pub fn is_available(&self) -> bool {
        self.trace.is_some()
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.trace {
            Some(trace) => write!(f, "{} stack trace:\n{}", self.worker, trace),
            None => match self.exec_id {
                Some(exec) => write!(f, "{} (exec id {}) is not in current frames", self.worker, exec),
                None => write!(f, "{} has no execution id yet, no stack available", self.worker),
            },
        }
    }
}

/// Capture the current stack of `worker` from `introspector`.
///
/// Never fails: an unknown or exited execution context produces a snapshot
/// whose trace is `None`.
pub fn capture_stack(
    introspector: &dyn StackIntrospect,
    worker: &WorkerId,
    exec_id: Option<ExecId>,
) -> Snapshot {
    let trace = exec_id
        .and_then(|id| introspector.frames_of(id))
        .filter(|frames| !frames.is_empty())
        .map(|frames| render_frames(&frames));

    if trace.is_none() {
        tracing::debug!(job = %worker, exec_id = ?exec_id, "no stack frames available");
    }

    Snapshot {
        worker: worker.clone(),
        exec_id,
        trace,
    }
}

fn render_frames(frames: &[Frame]) -> String {
    let mut out = String::new();
    for (i, frame) in frames.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = write!(out, "  #{i} {frame}");
    }
    out
}

/// Several introspectors queried together; frames for the same id are
/// concatenated in chain order.
#[derive(Clone, Default)]
pub struct Chain {
    sources: Vec<Arc<dyn StackIntrospect>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: Arc<dyn StackIntrospect>) -> Self {
        self.sources.push(source);
        self
    }
}

impl StackIntrospect for Chain {
    fn current_frames(&self) -> HashMap<ExecId, Vec<Frame>> {
        let mut merged: HashMap<ExecId, Vec<Frame>> = HashMap::new();
        for source in &self.sources {
            for (id, frames) in source.current_frames() {
                merged.entry(id).or_default().extend(frames);
            }
        }
        merged
    }

    fn frames_of(&self, id: ExecId) -> Option<Vec<Frame>> {
        let mut found: Option<Vec<Frame>> = None;
        for source in &self.sources {
            if let Some(frames) = source.frames_of(id) {
                found.get_or_insert_with(Vec::new).extend(frames);
            }
        }
        found
    }
}

// --- Span stacks ---

/// Tracing layer recording which spans each OS thread is currently inside.
///
/// Cloning shares the underlying table, so one clone can be installed in the
/// subscriber and another handed to a supervisor.
#[derive(Clone, Default)]
pub struct SpanStacks {
    stacks: Arc<Mutex<HashMap<ExecId, Vec<(Id, Frame)>>>>,
}

impl SpanStacks {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, exec: ExecId, span: Id, frame: Frame) {
        let mut stacks = self.stacks.lock().unwrap_or_else(PoisonError::into_inner);
        stacks.entry(exec).or_default().push((span, frame));
    }

    fn pop(&self, exec: ExecId, span: &Id) {
        let mut stacks = self.stacks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stack) = stacks.get_mut(&exec) {
            if let Some(pos) = stack.iter().rposition(|(id, _)| id == span) {
                stack.remove(pos);
            }
            if stack.is_empty() {
                stacks.remove(&exec);
            }
        }
    }
}

impl StackIntrospect for SpanStacks {
    fn current_frames(&self) -> HashMap<ExecId, Vec<Frame>> {
        let stacks = self.stacks.lock().unwrap_or_else(PoisonError::into_inner);
        stacks
            .iter()
            .map(|(exec, stack)| (*exec, innermost_first(stack)))
            .collect()
    }

    fn frames_of(&self, id: ExecId) -> Option<Vec<Frame>> {
        let stacks = self.stacks.lock().unwrap_or_else(PoisonError::into_inner);
        stacks.get(&id).map(|stack| innermost_first(stack))
    }
}

fn innermost_first(stack: &[(Id, Frame)]) -> Vec<Frame> {
    stack.iter().rev().map(|(_, frame)| frame.clone()).collect()
}

/// Span fields rendered as `key=value` pairs, stored in span extensions.
struct SpanFields(String);

#[derive(Default)]
struct FieldWriter(String);

impl FieldWriter {
    fn separator(&mut self) {
        if !self.0.is_empty() {
            self.0.push(' ');
        }
    }
}

impl Visit for FieldWriter {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.separator();
        let _ = write!(self.0, "{}={}", field.name(), value);
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.separator();
        let _ = write!(self.0, "{}={:?}", field.name(), value);
    }
}

impl<S> Layer<S> for SpanStacks
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut writer = FieldWriter::default();
        attrs.record(&mut writer);
        span.extensions_mut().insert(SpanFields(writer.0));
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        if let Some(fields) = extensions.get_mut::<SpanFields>() {
            let mut writer = FieldWriter(std::mem::take(&mut fields.0));
            values.record(&mut writer);
            fields.0 = writer.0;
        }
    }

    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        let Some(exec) = current_exec_id() else {
            return;
        };
        let Some(span) = ctx.span(id) else {
            return;
        };
        let meta = span.metadata();
        let fields = span
            .extensions()
            .get::<SpanFields>()
            .map(|f| f.0.clone())
            .unwrap_or_default();

        let label = if fields.is_empty() {
            format!("{}::{}", meta.target(), meta.name())
        } else {
            format!("{}::{}{{{}}}", meta.target(), meta.name(), fields)
        };
        let mut frame = Frame::new(label);
        if let Some(file) = meta.file() {
            frame = match meta.line() {
                Some(line) => frame.at(format!("{file}:{line}")),
                None => frame.at(file),
            };
        }
        self.push(exec, id.clone(), frame);
    }

    fn on_exit(&self, id: &Id, _ctx: Context<'_, S>) {
        if let Some(exec) = current_exec_id() {
            self.pop(exec, id);
        }
    }
}

// --- procfs ---

/// Kernel-side view of threads and processes, read from `/proc`.
///
/// For an id it reports the scheduler state, wait channel, current syscall
/// and, when the kernel allows it, the kernel stack.
#[derive(Debug, Clone)]
pub struct ProcfsIntrospector {
    root: PathBuf,
}

impl Default for ProcfsIntrospector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcfsIntrospector {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read from an alternate procfs mount.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_dir(&self, id: ExecId) -> Option<PathBuf> {
        let task = self.root.join("self/task").join(id.0.to_string());
        if task.join("stat").exists() {
            return Some(task);
        }
        let process = self.root.join(id.0.to_string());
        process.join("stat").exists().then_some(process)
    }
}

impl StackIntrospect for ProcfsIntrospector {
    fn current_frames(&self) -> HashMap<ExecId, Vec<Frame>> {
        let entries = match std::fs::read_dir(self.root.join("self/task")) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(error = %e, root = %self.root.display(), "failed to list tasks");
                return HashMap::new();
            }
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
            .filter_map(|tid| {
                let id = ExecId(tid);
                self.frames_of(id).map(|frames| (id, frames))
            })
            .collect()
    }

    fn frames_of(&self, id: ExecId) -> Option<Vec<Frame>> {
        let dir = self.entry_dir(id)?;
        let stat = std::fs::read_to_string(dir.join("stat")).ok()?;
        let (comm, state) = parse_stat(&stat)?;

        let mut frames = vec![Frame::new(format!(
            "{comm} state={state} ({})",
            state_name(state)
        ))];

        if let Some(wchan) = read_trimmed(&dir.join("wchan")).filter(|w| !w.is_empty() && w != "0") {
            frames.push(Frame::new(format!("wchan {wchan}")));
        }
        if let Some(syscall) = read_trimmed(&dir.join("syscall")) {
            if let Some(first) = syscall.split_whitespace().next() {
                frames.push(Frame::new(format!("syscall {first}")));
            }
        }
        if let Some(stack) = read_trimmed(&dir.join("stack")) {
            frames.extend(stack.lines().filter_map(parse_kernel_frame));
        }

        Some(frames)
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

/// Extract `comm` and the state character from a `stat` line.
///
/// `comm` may itself contain spaces and parentheses, so the last `)` ends it.
fn parse_stat(stat: &str) -> Option<(&str, char)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    if close <= open {
        return None;
    }
    let comm = &stat[open + 1..close];
    let state = stat[close + 1..].trim_start().chars().next()?;
    Some((comm, state))
}

fn state_name(state: char) -> &'static str {
    match state {
        'R' => "running",
        'S' => "sleeping",
        'D' => "uninterruptible wait",
        'Z' => "zombie",
        'T' => "stopped",
        't' => "tracing stop",
        'X' | 'x' => "dead",
        'I' => "idle",
        'P' => "parked",
        _ => "unknown",
    }
}

/// `[<0>] futex_wait_queue+0x60/0xa0` -> `kernel futex_wait_queue+0x60/0xa0`
fn parse_kernel_frame(line: &str) -> Option<Frame> {
    let symbol = match line.find("] ") {
        Some(pos) => &line[pos + 2..],
        None => line,
    };
    let symbol = symbol.trim();
    (!symbol.is_empty()).then(|| Frame::new(format!("kernel {symbol}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{ThreadWorker, Worker};
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::tempdir;
    use tracing_subscriber::layer::SubscriberExt;

    struct Fixed(HashMap<ExecId, Vec<Frame>>);

    impl StackIntrospect for Fixed {
        fn current_frames(&self) -> HashMap<ExecId, Vec<Frame>> {
            self.0.clone()
        }
    }

    fn fixed(id: i32, labels: &[&str]) -> Fixed {
        let frames = labels.iter().map(|l| Frame::new(*l)).collect();
        Fixed(HashMap::from([(ExecId(id), frames)]))
    }

    #[test]
    fn test_capture_present_id_renders_trace() {
        let source = fixed(7, &["inner", "outer"]);
        let snap = capture_stack(&source, &WorkerId::from("w"), Some(ExecId(7)));
        assert!(snap.is_available());
        assert_eq!(snap.trace.as_deref(), Some("  #0 inner\n  #1 outer"));
        assert_eq!(snap.to_string(), "w stack trace:\n  #0 inner\n  #1 outer");
    }

    #[test]
    fn test_capture_missing_id_is_unavailable() {
        let source = fixed(7, &["inner"]);
        let snap = capture_stack(&source, &WorkerId::from("w"), Some(ExecId(8)));
        assert!(!snap.is_available());
        assert_eq!(snap.to_string(), "w (exec id 8) is not in current frames");
    }

    #[test]
    fn test_capture_without_exec_id_is_unavailable() {
        let source = fixed(7, &["inner"]);
        let snap = capture_stack(&source, &WorkerId::from("w"), None);
        assert!(!snap.is_available());
        assert!(snap.to_string().contains("no execution id"));
    }

    #[test]
    fn test_capture_empty_frames_is_unavailable() {
        let source = fixed(7, &[]);
        let snap = capture_stack(&source, &WorkerId::from("w"), Some(ExecId(7)));
        assert!(!snap.is_available());
    }

    #[test]
    fn test_frame_display_with_location() {
        let frame = Frame::new("app::load").at("src/app.rs:12");
        assert_eq!(frame.to_string(), "app::load (src/app.rs:12)");
    }

    #[test]
    fn test_chain_concatenates_sources() {
        let chain = Chain::new()
            .with(Arc::new(fixed(1, &["a"])))
            .with(Arc::new(fixed(1, &["b"])))
            .with(Arc::new(fixed(2, &["c"])));
        let frames = chain.frames_of(ExecId(1)).unwrap();
        assert_eq!(frames, vec![Frame::new("a"), Frame::new("b")]);
        assert!(chain.frames_of(ExecId(3)).is_none());
        assert_eq!(chain.current_frames().len(), 2);
    }

    #[test]
    fn test_parse_stat_handles_parens_in_comm() {
        let (comm, state) = parse_stat("1234 (weird) name)) S 1 1234 1234 0").unwrap();
        assert_eq!(comm, "weird) name)");
        assert_eq!(state, 'S');
        assert!(parse_stat("garbage").is_none());
    }

    #[test]
    fn test_parse_kernel_frame() {
        let frame = parse_kernel_frame("[<0>] futex_wait_queue+0x60/0xa0").unwrap();
        assert_eq!(frame.label, "kernel futex_wait_queue+0x60/0xa0");
        assert!(parse_kernel_frame("   ").is_none());
    }

    fn fake_task(root: &Path, rel: &str, stat: &str) -> PathBuf {
        let dir = root.join(rel);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("stat"), stat).unwrap();
        dir
    }

    #[test]
    fn test_procfs_reads_thread_state() {
        let root = tempdir().unwrap();
        let dir = fake_task(root.path(), "self/task/4242", "4242 (worker-1) S 1 2 3");
        std::fs::write(dir.join("wchan"), "futex_wait_queue").unwrap();
        std::fs::write(dir.join("syscall"), "202 0x7f 0x80 0x0").unwrap();
        std::fs::write(
            dir.join("stack"),
            "[<0>] futex_wait_queue+0x60/0xa0\n[<0>] do_syscall_64+0x5b/0x80\n",
        )
        .unwrap();

        let procfs = ProcfsIntrospector::with_root(root.path());
        let labels: Vec<String> = procfs
            .frames_of(ExecId(4242))
            .unwrap()
            .into_iter()
            .map(|f| f.label)
            .collect();
        assert_eq!(
            labels,
            vec![
                "worker-1 state=S (sleeping)",
                "wchan futex_wait_queue",
                "syscall 202",
                "kernel futex_wait_queue+0x60/0xa0",
                "kernel do_syscall_64+0x5b/0x80",
            ]
        );
    }

    #[test]
    fn test_procfs_falls_back_to_process_dir() {
        let root = tempdir().unwrap();
        let dir = fake_task(root.path(), "999", "999 (sleep) R 1");
        std::fs::write(dir.join("wchan"), "0").unwrap();

        let procfs = ProcfsIntrospector::with_root(root.path());
        let frames = procfs.frames_of(ExecId(999)).unwrap();
        assert_eq!(frames, vec![Frame::new("sleep state=R (running)")]);
    }

    #[test]
    fn test_procfs_missing_id_is_none() {
        let root = tempdir().unwrap();
        let procfs = ProcfsIntrospector::with_root(root.path());
        assert!(procfs.frames_of(ExecId(1)).is_none());
        assert!(procfs.current_frames().is_empty());
    }

    #[test]
    fn test_procfs_lists_own_tasks() {
        let root = tempdir().unwrap();
        fake_task(root.path(), "self/task/10", "10 (main) R 1");
        fake_task(root.path(), "self/task/11", "11 (helper) S 1");
        std::fs::create_dir_all(root.path().join("self/task/not-a-tid")).unwrap();

        let procfs = ProcfsIntrospector::with_root(root.path());
        let frames = procfs.current_frames();
        assert_eq!(frames.len(), 2);
        assert!(frames.contains_key(&ExecId(10)));
        assert!(frames.contains_key(&ExecId(11)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_procfs_sees_live_thread() {
        let (tx, rx) = mpsc::channel::<()>();
        let worker = ThreadWorker::spawn("procfs-live", move || {
            let _ = rx.recv();
        })
        .unwrap();
        while worker.exec_id().is_none() {
            std::thread::sleep(Duration::from_millis(1));
        }

        let snap = capture_stack(&ProcfsIntrospector::new(), &worker.id(), worker.exec_id());
        assert!(snap.is_available());
        assert!(snap.trace.unwrap().contains("procfs-live"));

        tx.send(()).unwrap();
        worker.join_timeout(Duration::from_secs(5)).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_span_stacks_track_entered_spans_per_thread() {
        let stacks = SpanStacks::new();
        let subscriber = tracing_subscriber::registry().with(stacks.clone());
        let dispatch = tracing::Dispatch::new(subscriber);

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let thread_dispatch = dispatch.clone();
        let handle = std::thread::spawn(move || {
            tracing::dispatcher::with_default(&thread_dispatch, || {
                let outer = tracing::info_span!("load_batch", batch = 3);
                let _outer = outer.enter();
                let inner = tracing::info_span!("decode");
                let _inner = inner.enter();
                entered_tx.send(current_exec_id().unwrap()).unwrap();
                let _ = release_rx.recv();
            });
        });

        let exec = entered_rx.recv().unwrap();
        let frames = stacks.frames_of(exec).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].label.ends_with("::decode"));
        assert!(frames[1].label.ends_with("::load_batch{batch=3}"));
        assert!(frames[1].location.as_deref().unwrap().contains("diagnostics.rs"));

        release_tx.send(()).unwrap();
        handle.join().unwrap();
        assert!(stacks.frames_of(exec).is_none());
        assert!(stacks.current_frames().is_empty());
    }
}
