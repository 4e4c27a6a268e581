//! Generic task runtime shared by the pipeline's long-running parts.
//!
//! # Component model
//!
//! A [`Component`] is any independently-runnable unit of the pipeline:
//! a producer, the commit consumer, the backup scheduler.
//! The coordinator constructs components with their shared state already
//! captured inside them, then hands them to [`spawn_components`].
//!
//! # TaskSetHandle
//!
//! [`spawn_components`] returns a [`TaskSetHandle`]. The components run
//! concurrently regardless of whether the handle is polled. The first
//! component error trips [`TaskSetHandle::failed`] but does not cancel the
//! siblings; the owner decides when to cancel (the coordinator writes its
//! final backup first) and then calls [`TaskSetHandle::join`].

use std::future::Future;
use std::pin::Pin;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::AppError;

// ── Component ─────────────────────────────────────────────────────────────────

/// A boxed, owned future returned by [`Component::run`].
pub type ComponentFuture = Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'static>>;

/// A self-contained, concurrently-runnable unit of the pipeline.
///
/// Implementors capture all shared state (registry handles, queue ends, …)
/// at construction time. [`Component::run`] is called once by
/// [`spawn_components`] and should run until `shutdown` is cancelled or the
/// component's own work is done. Exiting because of `shutdown` is `Ok(())`.
pub trait Component: Send + 'static {
    /// Stable identifier used in log messages.
    fn id(&self) -> &str;

    /// Consume the component and return its async run-loop as a boxed future.
    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture;
}

// ── TaskSetHandle ─────────────────────────────────────────────────────────────

/// Handle to a running set of components.
pub struct TaskSetHandle {
    inner: JoinHandle<Result<(), AppError>>,
    failed: CancellationToken,
}

impl TaskSetHandle {
    /// Cancelled as soon as any component returns `Err` or panics.
    pub fn failed(&self) -> CancellationToken {
        self.failed.clone()
    }

    /// Await all components and return the first error, if any.
    pub async fn join(self) -> Result<(), AppError> {
        match self.inner.await {
            Ok(r) => r,
            Err(e) => Err(AppError::Task(format!("task manager panicked: {e}"))),
        }
    }
}

// ── spawn_components ──────────────────────────────────────────────────────────

/// Spawn each [`Component`] as an independent Tokio task.
///
/// Behaviour on error:
/// - The first `Err` (or panic) is remembered and trips the handle's
///   `failed` token. Siblings keep running until `shutdown` is cancelled.
/// - The manager task drains every component and returns the first error.
/// - A component aborted through its `JoinHandle` counts as a clean exit.
pub fn spawn_components(
    components: Vec<Box<dyn Component>>,
    shutdown: CancellationToken,
) -> TaskSetHandle {
    let failed = CancellationToken::new();
    let failed_signal = failed.clone();

    let inner = tokio::spawn(async move {
        let mut set: JoinSet<Result<(), AppError>> = JoinSet::new();

        for component in components {
            let id = component.id().to_string();
            let shutdown = shutdown.clone();
            debug!(component = %id, "spawning component");
            set.spawn(async move {
                let res = component.run(shutdown).await;
                match &res {
                    Ok(()) => debug!(component = %id, "component exited"),
                    Err(e) => error!(component = %id, "component error: {e}"),
                }
                res
            });
        }

        let mut first_err: Option<AppError> = None;

        while let Some(res) = set.join_next().await {
            match res {
                Err(e) if e.is_cancelled() => {}
                // Component panicked.
                Err(e) => {
                    error!("component panicked: {e}");
                    failed_signal.cancel();
                    first_err.get_or_insert_with(|| AppError::Task(format!("component panicked: {e}")));
                }
                Ok(Err(e)) => {
                    failed_signal.cancel();
                    first_err.get_or_insert(e);
                }
                Ok(Ok(())) => {}
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    });

    TaskSetHandle { inner, failed }
}
