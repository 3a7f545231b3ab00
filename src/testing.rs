//! Test doubles shared by the unit tests.
use crate::diagnostics::{Frame, StackIntrospect};
use crate::escalation::{EscalationReport, Terminator};
use crate::worker::{ExecId, JoinError, Worker, WorkerId, WorkerKind};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// Worker whose bounded wait returns immediately with scripted results.
pub struct ScriptedWorker {
    id: WorkerId,
    exec: Option<ExecId>,
    /// Becomes dead during this join call (1-based); `None` = never.
    finishes_on_join: Option<u64>,
    failing_joins: HashSet<u64>,
    joins: AtomicU64,
    on_join: Option<Box<dyn Fn(u64) + Send + Sync>>,
}

impl ScriptedWorker {
    pub fn new(id: &str) -> Self {
        Self {
            id: WorkerId::from(id),
            exec: Some(ExecId(4242)),
            finishes_on_join: None,
            failing_joins: HashSet::new(),
            joins: AtomicU64::new(0),
            on_join: None,
        }
    }

    pub fn finished(id: &str) -> Self {
        Self::new(id).finishes_on_join(0)
    }

    pub fn finishes_on_join(mut self, join: u64) -> Self {
        self.finishes_on_join = Some(join);
        self
    }

    pub fn failing_on_join(mut self, join: u64) -> Self {
        self.failing_joins.insert(join);
        self
    }

    pub fn with_exec(mut self, exec: Option<ExecId>) -> Self {
        self.exec = exec;
        self
    }

    pub fn on_join(mut self, hook: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.on_join = Some(Box::new(hook));
        self
    }

    pub fn joins(&self) -> u64 {
        self.joins.load(Ordering::SeqCst)
    }
}

impl Worker for ScriptedWorker {
    fn id(&self) -> WorkerId {
        self.id.clone()
    }

    fn kind(&self) -> WorkerKind {
        WorkerKind::Thread
    }

    fn exec_id(&self) -> Option<ExecId> {
        self.exec
    }

    fn is_alive(&self) -> bool {
        match self.finishes_on_join {
            Some(join) => self.joins() < join,
            None => true,
        }
    }

    fn join_timeout(&self, _timeout: Duration) -> Result<(), JoinError> {
        let join = self.joins.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = &self.on_join {
            hook(join);
        }
        if self.failing_joins.contains(&join) {
            let source = io::Error::new(io::ErrorKind::Other, "scripted wait failure");
            return Err(JoinError::Wait { source });
        }
        Ok(())
    }
}

/// Introspector with a fixed frame table.
pub struct FixedFrames(pub HashMap<ExecId, Vec<Frame>>);

impl FixedFrames {
    pub fn single(id: ExecId, labels: &[&str]) -> Self {
        let frames = labels.iter().map(|l| Frame::new(*l)).collect();
        Self(HashMap::from([(id, frames)]))
    }

    pub fn empty() -> Self {
        Self(HashMap::new())
    }
}

impl StackIntrospect for FixedFrames {
    fn current_frames(&self) -> HashMap<ExecId, Vec<Frame>> {
        self.0.clone()
    }
}

/// Terminator that records reports instead of ending the process.
#[derive(Default)]
pub struct RecordingTerminator {
    pub reports: Mutex<Vec<EscalationReport>>,
}

impl RecordingTerminator {
    pub fn count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, report: &EscalationReport) {
        self.reports.lock().unwrap().push(report.clone());
    }
}

#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub job: Option<String>,
    pub message: String,
}

/// Layer that keeps every event for later assertions.
#[derive(Clone, Default)]
pub struct CapturedEvents {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CapturedEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch(&self) -> tracing::Dispatch {
        tracing::Dispatch::new(tracing_subscriber::registry().with(self.clone()))
    }

    pub fn all(&self) -> Vec<CapturedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn at(&self, level: Level) -> Vec<CapturedEvent> {
        self.all().into_iter().filter(|e| e.level == level).collect()
    }

    pub fn containing(&self, level: Level, needle: &str) -> Vec<CapturedEvent> {
        self.at(level)
            .into_iter()
            .filter(|e| e.message.contains(needle))
            .collect()
    }
}

#[derive(Default)]
struct EventVisitor {
    job: Option<String>,
    message: String,
}

impl Visit for EventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "job" => self.job = Some(value.to_string()),
            "message" => self.message.push_str(value),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "job" => self.job = Some(format!("{value:?}")),
            "message" => {
                let _ = write!(self.message, "{value:?}");
            }
            _ => {}
        }
    }
}

impl<S: Subscriber> Layer<S> for CapturedEvents {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);
        self.events.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            job: visitor.job,
            message: visitor.message,
        });
    }
}
