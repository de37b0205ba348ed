//! Single-threaded cooperative executor.
//!
//! Every handler, child task, query fetch and subscriber delivery loop runs
//! on one [`Scheduler`]. In [`ExecutorMode::Dedicated`] the scheduler owns a
//! current-thread tokio runtime driven from its own OS thread, so tasks
//! interleave only at `.await` points no matter what runtime the caller
//! uses. Tasks spawned without suspending in between run in spawn order.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::EngineError;

/// Where scheduled tasks execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutorMode {
    /// Own thread running a current-thread runtime.
    #[default]
    Dedicated,
    /// The runtime that calls [`Scheduler::new`]. Cooperative only if that
    /// runtime is current-thread.
    Ambient,
}

/// Cloneable handle for spawning cooperative tasks.
#[derive(Clone)]
pub struct Scheduler {
    handle: Handle,
    mode: ExecutorMode,
    // Shared by every clone; the dedicated thread exits when the last clone
    // drops or `shutdown` is called.
    dedicated: Option<Arc<DedicatedThread>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

struct DedicatedThread {
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl DedicatedThread {
    fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for DedicatedThread {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Scheduler {
    /// Start a scheduler.
    ///
    /// # Arguments
    ///
    /// * `mode` - Dedicated thread or ambient runtime.
    /// * `thread_name` - OS thread name for [`ExecutorMode::Dedicated`].
    ///
    /// # Errors
    ///
    /// * [`EngineError::NoRuntime`] - `Ambient` requested outside a runtime.
    /// * [`EngineError::Scheduler`] - the thread or runtime failed to start.
    pub fn new(mode: ExecutorMode, thread_name: &str) -> Result<Self, EngineError> {
        match mode {
            ExecutorMode::Ambient => {
                let handle = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
                if handle.runtime_flavor() != RuntimeFlavor::CurrentThread {
                    tracing::warn!(
                        "ambient scheduler on a multi-thread runtime: tasks may run in parallel"
                    );
                }
                Ok(Self {
                    handle,
                    mode,
                    dedicated: None,
                })
            }
            ExecutorMode::Dedicated => Self::dedicated(thread_name),
        }
    }

    fn dedicated(thread_name: &str) -> Result<Self, EngineError> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let name = thread_name.to_owned();

        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(rt.handle().clone()));

                // Spawned tasks make progress only while this thread is
                // inside `block_on`.
                rt.block_on(async {
                    let _ = shutdown_rx.await;
                });
                tracing::debug!(thread = %name, "scheduler thread exiting");
                // Dropping `rt` cancels every task still parked on it.
            })?;

        let handle = ready_rx
            .recv()
            .map_err(|_| std::io::Error::other("scheduler thread exited during startup"))??;

        tracing::debug!(thread = thread_name, "dedicated scheduler started");
        Ok(Self {
            handle,
            mode: ExecutorMode::Dedicated,
            dedicated: Some(Arc::new(DedicatedThread {
                shutdown: Mutex::new(Some(shutdown_tx)),
            })),
        })
    }

    /// Spawn a task. Tasks start in spawn order.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Execution mode.
    pub fn mode(&self) -> ExecutorMode {
        self.mode
    }

    /// Stop the dedicated thread, dropping every task still running on it.
    ///
    /// No-op in ambient mode and when already stopped.
    pub fn shutdown(&self) {
        if let Some(thread) = &self.dedicated {
            thread.stop();
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
