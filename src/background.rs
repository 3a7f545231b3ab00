/// Fire-and-forget supervision on a background thread.
///
/// The thread is detached: nothing joins it on shutdown, so it never keeps
/// the process alive. The caller's tracing dispatcher is carried over so the
/// background supervisor logs to the same sink.
use crate::supervisor::Supervisor;
use crate::worker::Worker;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Handle to a background supervision thread.
///
/// Dropping it detaches the thread. The supervision result is not
/// reported back; use [`Supervisor::join`] when the caller needs it.
#[derive(Debug)]
pub struct SupervisionHandle {
    name: String,
    cancel: CancellationToken,
    thread: JoinHandle<()>,
}

impl SupervisionHandle {
    /// Thread name, `join_thread_<worker id>`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the background supervision has ended.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Ask the supervisor to stop before its next attempt.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Block until the background thread exits.
    pub fn wait(self) -> thread::Result<()> {
        self.thread.join()
    }
}

/// Name of the background thread supervising the worker with `id`.
pub fn thread_name(id: &str) -> String {
    format!("join_thread_{id}")
}

impl Supervisor {
    /// Supervise `worker` on a new background thread and return at once.
    ///
    /// The thread stops when the worker finishes, when `cancel` fires, or
    /// when escalation ends the supervision.
    pub fn spawn<W>(&self, worker: Arc<W>, cancel: CancellationToken) -> io::Result<SupervisionHandle>
    where
        W: Worker + ?Sized + 'static,
    {
        let name = thread_name(worker.id().as_str());
        let supervisor = self.clone();
        let token = cancel.clone();
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());

        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            tracing::dispatcher::with_default(&dispatch, || {
                let outcome = supervisor.join(worker.as_ref(), &token);
                tracing::debug!(job = %worker.id(), ?outcome, "background supervision ended");
            });
        })?;

        Ok(SupervisionHandle {
            name,
            cancel,
            thread,
        })
    }
}

/// Supervise `worker` in the background with the default collaborators.
pub fn supervise_async<W>(worker: Arc<W>, timeout: Duration) -> io::Result<SupervisionHandle>
where
    W: Worker + ?Sized + 'static,
{
    Supervisor::new(timeout).spawn(worker, CancellationToken::new())
}
