//! Bounded joins for threads and child processes.
//!
//! A [`Supervisor`] waits for a [`Worker`] in fixed-length attempts. Every
//! attempt that times out is logged together with a snapshot of the worker's
//! stack, and the supervisor tries again; it never quietly gives up on a hung
//! worker. An optional [`EscalationPolicy`] ends the process once a stall
//! has gone on for too long, and [`Supervisor::spawn`] runs the same loop on
//! a detached background thread.
//!
//! ```no_run
//! use std::time::Duration;
//! use stallguard::{supervise, ThreadWorker};
//!
//! let worker = ThreadWorker::spawn("loader", || {
//!     std::thread::sleep(Duration::from_secs(7));
//! })?;
//! assert!(supervise(&worker, Duration::from_secs(5)));
//! # Ok::<(), std::io::Error>(())
//! ```

pub mod background;
pub mod config;
pub mod debugger;
pub mod diagnostics;
pub mod escalation;
pub mod logging;
pub mod run;
pub mod signals;
pub mod supervisor;
pub mod worker;

#[cfg(test)]
mod testing;

pub use background::{supervise_async, SupervisionHandle};
pub use diagnostics::{capture_stack, Snapshot, SpanStacks, StackIntrospect};
pub use escalation::{EscalationPolicy, Terminator};
pub use supervisor::{supervise, Supervision, Supervisor};
pub use worker::{ProcessWorker, ThreadWorker, Worker, WorkerId};
