//! Cooperative shutdown.
//!
//! The first SIGINT/SIGTERM flips the [`ShutdownFlag`]; the orchestrator checks
//! it between steps and phases and unwinds after the current call. Cleanup
//! callbacks run once, newest first. A second signal exits immediately.

use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exit code used when a second signal forces the process down.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Cloneable, idempotent shutdown request flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    token: CancellationToken,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Calling this more than once has no further effect.
    pub fn request(&self) {
        self.token.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub async fn requested(&self) {
        self.token.cancelled().await;
    }
}

type Cleanup = Box<dyn FnOnce() + Send>;

/// Owns the shutdown flag and the cleanup stack.
pub struct ShutdownController {
    flag: ShutdownFlag,
    cleanups: Mutex<Vec<(String, Cleanup)>>,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            flag: ShutdownFlag::new(),
            cleanups: Mutex::new(Vec::new()),
        }
    }

    pub fn flag(&self) -> ShutdownFlag {
        self.flag.clone()
    }

    /// Register a callback to run on shutdown.
    pub fn register_cleanup<F>(&self, name: &str, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut cleanups = self.cleanups.lock().unwrap_or_else(|e| e.into_inner());
        cleanups.push((name.to_string(), Box::new(f)));
    }

    /// Run registered cleanups in reverse registration order. Each runs at most once.
    pub fn run_cleanups(&self) {
        let drained: Vec<(String, Cleanup)> = {
            let mut cleanups = self.cleanups.lock().unwrap_or_else(|e| e.into_inner());
            cleanups.drain(..).collect()
        };
        for (name, cleanup) in drained.into_iter().rev() {
            info!(component = "shutdown", cleanup = %name, "running cleanup");
            cleanup();
        }
    }

    /// Request shutdown and run cleanups.
    pub fn trigger(&self) {
        if !self.flag.is_requested() {
            info!(component = "shutdown", "shutdown requested, finishing current step");
        }
        self.flag.request();
        self.run_cleanups();
    }

    /// Trap SIGINT (and SIGTERM on unix). The first signal triggers a graceful
    /// shutdown; the second exits with [`FORCED_EXIT_CODE`].
    pub fn install_signal_handlers(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            if wait_for_signal().await.is_err() {
                warn!(component = "shutdown", "failed to install signal handler");
                return;
            }
            controller.trigger();
            if wait_for_signal().await.is_ok() {
                warn!(component = "shutdown", "second signal received, exiting immediately");
                std::process::exit(FORCED_EXIT_CODE);
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
