/// Signal handling for the CLI.
///
/// SIGINT (Ctrl-C) and SIGTERM are treated alike: the first asks the child to
/// stop, a second one (or the grace period running out) kills it.
use tokio::signal::unix::{signal, Signal, SignalKind};

pub struct SignalHandler {
    interrupt: Signal,
    terminate: Signal,
    received: u32,
}

/// Which signal arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    /// Conventional exit code for a process ended by this signal.
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownSignal::Interrupt => 130,
            ShutdownSignal::Terminate => 143,
        }
    }
}

impl SignalHandler {
    /// Register SIGINT and SIGTERM listeners. Must run inside a tokio runtime.
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            received: 0,
        })
    }

    /// Wait for the next shutdown signal.
    pub async fn recv(&mut self) -> ShutdownSignal {
        let sig = tokio::select! {
            _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
            _ = self.terminate.recv() => ShutdownSignal::Terminate,
        };
        self.received += 1;
        tracing::info!(signal = ?sig, count = self.received, "shutdown signal received");
        sig
    }

    /// Number of signals received so far.
    pub fn received(&self) -> u32 {
        self.received
    }
}
