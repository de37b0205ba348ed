//! Cooperative tasks: handles, contexts and control primitives.
//!
//! A task is a future running on the [`Scheduler`] together with a
//! [`TaskHandle`] that owns its cancellation flag and its children. The
//! flag is only observed at suspension points: every primitive on
//! [`TaskContext`] that can wait first checks the flag and then races the
//! awaited value against cancellation, so a cancelled task resumes straight
//! into its cancellation branch while synchronous steps already underway
//! run to completion.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::command::CommandRef;
use crate::error::{CollaboratorError, TaskError};
use crate::event::Event;
use crate::scheduler::{Scheduler, panic_message};
use crate::subscription::EventHub;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// What started a task tree. Children inherit their parent's origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOrigin {
    /// A dispatched command.
    Command(CommandRef),
    /// A query fetch, by cache key.
    Query(String),
    /// Engine-internal work (intake loop, service roots, tests).
    Service,
}

/// Handle to one running cooperative routine.
///
/// Cancelling a handle cancels every descendant. Cheap to clone.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: TaskId,
    name: String,
    origin: TaskOrigin,
    token: CancellationToken,
    finished: AtomicBool,
    children: Mutex<Vec<TaskHandle>>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl TaskHandle {
    /// Create a root handle with no parent.
    pub fn root(name: impl Into<String>, origin: TaskOrigin) -> Self {
        Self::with_token(name.into(), origin, CancellationToken::new())
    }

    fn with_token(name: String, origin: TaskOrigin, token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: TaskId::next(),
                name,
                origin,
                token,
                finished: AtomicBool::new(false),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create and register a child that inherits this handle's origin.
    pub fn child(&self, name: impl Into<String>) -> Self {
        self.child_with_origin(name, self.inner.origin.clone())
    }

    /// Create and register a child with an explicit origin.
    pub fn child_with_origin(&self, name: impl Into<String>, origin: TaskOrigin) -> Self {
        let child = Self::with_token(name.into(), origin, self.inner.token.child_token());
        let mut children = self.inner.children.lock();
        children.retain(|c| !c.is_finished());
        children.push(child.clone());
        child
    }

    /// Task id.
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Task name, as given at spawn.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Origin of the task tree.
    pub fn origin(&self) -> &TaskOrigin {
        &self.inner.origin
    }

    /// Mark this task and all descendants cancelled.
    pub fn cancel(&self) {
        if !self.inner.token.is_cancelled() {
            tracing::debug!(task = %self.inner.id, name = %self.inner.name, "task cancelled");
        }
        self.inner.token.cancel();
    }

    /// Whether this task (or an ancestor) was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Whether the routine has terminated.
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    /// Children that have not terminated yet.
    pub fn children(&self) -> Vec<TaskHandle> {
        self.inner
            .children
            .lock()
            .iter()
            .filter(|c| !c.is_finished())
            .cloned()
            .collect()
    }

    /// Resolves once this handle is cancelled.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    pub(crate) fn mark_finished(&self) {
        self.inner.finished.store(true, Ordering::Release);
    }
}

/// A spawned task's eventual result.
///
/// Dropping a `TaskJoin` detaches the task; it keeps running until it
/// finishes or is cancelled through its handle.
pub struct TaskJoin<T> {
    handle: TaskHandle,
    join: JoinHandle<Result<T, TaskError>>,
}

impl<T> fmt::Debug for TaskJoin<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskJoin")
            .field("handle", &self.handle)
            .finish()
    }
}

impl<T: Send + 'static> TaskJoin<T> {
    /// Run `future` on `scheduler` as the routine behind `handle`.
    ///
    /// Panics inside the routine become [`TaskError::Panicked`].
    pub(crate) fn start<F>(scheduler: &Scheduler, handle: TaskHandle, future: F) -> Self
    where
        F: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let span = tracing::debug_span!("task", id = %handle.id(), name = %handle.name());
        let tracked = handle.clone();
        let join = scheduler.spawn(
            async move {
                let outcome = std::panic::AssertUnwindSafe(future).catch_unwind().await;
                tracked.mark_finished();
                match outcome {
                    Ok(result) => result,
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        tracing::error!(panic = %message, "task panicked");
                        Err(TaskError::Panicked(message))
                    }
                }
            }
            .instrument(span),
        );
        Self { handle, join }
    }
}

impl<T> TaskJoin<T> {
    /// Handle of the spawned task.
    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    /// Cancel the spawned task (and its descendants).
    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

impl<T> Future for TaskJoin<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.join).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The scheduler dropped the task before it finished.
            Poll::Ready(Err(e)) if e.is_cancelled() => Poll::Ready(Err(TaskError::Cancelled)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(TaskError::Panicked(e.to_string()))),
        }
    }
}

/// Execution context handed to every cooperative routine.
#[derive(Clone)]
pub struct TaskContext {
    handle: TaskHandle,
    scheduler: Scheduler,
    hub: EventHub,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl TaskContext {
    /// Context for the routine behind `handle`.
    pub fn new(handle: TaskHandle, scheduler: Scheduler, hub: EventHub) -> Self {
        Self {
            handle,
            scheduler,
            hub,
        }
    }

    /// This task's handle.
    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub(crate) fn hub(&self) -> &EventHub {
        &self.hub
    }

    /// Context for a new child task of this one.
    pub(crate) fn fork(&self, name: &str) -> TaskContext {
        TaskContext {
            handle: self.handle.child(name),
            scheduler: self.scheduler.clone(),
            hub: self.hub.clone(),
        }
    }

    /// Whether this task has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// `Err(TaskError::Cancelled)` once this task has been cancelled.
    pub fn check_cancelled(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Suspend on `future`, short-circuiting into cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Cancelled`] if the task is cancelled before or
    /// while waiting. `future` is dropped in that case.
    pub async fn suspend<F: Future>(&self, future: F) -> Result<F::Output, TaskError> {
        self.check_cancelled()?;
        tokio::select! {
            biased;
            _ = self.handle.cancelled() => Err(TaskError::Cancelled),
            out = future => Ok(out),
        }
    }

    /// Suspend on an external collaborator call.
    ///
    /// A collaborator rejection becomes [`TaskError::Collaborator`], except
    /// [`CollaboratorError::Cancelled`] which maps to [`TaskError::Cancelled`].
    pub async fn call<T, F>(&self, future: F) -> Result<T, TaskError>
    where
        F: Future<Output = Result<T, CollaboratorError>>,
    {
        Ok(self.suspend(future).await??)
    }

    /// Spawn a child task.
    ///
    /// `routine` receives the child's own context. The child is cancelled
    /// whenever this task is.
    pub fn spawn<T, F, Fut>(&self, name: &str, routine: F) -> TaskJoin<T>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let child = self.fork(name);
        let handle = child.handle.clone();
        TaskJoin::start(&self.scheduler, handle, routine(child))
    }

    /// Wait for every task. The first failure cancels the rest and is returned.
    ///
    /// Results are returned in the order of `joins`.
    ///
    /// # Errors
    ///
    /// The first error any task produced, or [`TaskError::Cancelled`] if this
    /// task was cancelled while waiting (every joined task is cancelled too).
    pub async fn join_all<T: Send + 'static>(
        &self,
        joins: Vec<TaskJoin<T>>,
    ) -> Result<Vec<T>, TaskError> {
        let handles: Vec<TaskHandle> = joins.iter().map(|j| j.handle.clone()).collect();
        let mut slots: Vec<Option<T>> = joins.iter().map(|_| None).collect();
        let mut pending: FuturesUnordered<_> = joins
            .into_iter()
            .enumerate()
            .map(|(index, join)| join.map(move |result| (index, result)))
            .collect();

        loop {
            let next = match self.suspend(pending.next()).await {
                Ok(next) => next,
                Err(cancelled) => {
                    cancel_all(&handles);
                    return Err(cancelled);
                }
            };
            match next {
                None => break,
                Some((index, Ok(value))) => slots[index] = Some(value),
                Some((index, Err(err))) => {
                    tracing::debug!(
                        failed = %handles[index].id(),
                        error = %err,
                        "join_all: child failed, cancelling siblings"
                    );
                    cancel_all(&handles);
                    return Err(err);
                }
            }
        }
        Ok(slots.into_iter().flatten().collect())
    }

    /// Wait for the first task to finish and cancel the others.
    ///
    /// # Returns
    ///
    /// The winner's index in `joins` and its value.
    ///
    /// # Errors
    ///
    /// * The winner's error, if the first task to finish failed.
    /// * [`TaskError::Cancelled`] if this task was cancelled while waiting.
    /// * [`TaskError::InvalidArguments`] if `joins` is empty.
    pub async fn race<T: Send + 'static>(
        &self,
        joins: Vec<TaskJoin<T>>,
    ) -> Result<(usize, T), TaskError> {
        if joins.is_empty() {
            return Err(TaskError::InvalidArguments(
                "race requires at least one task".to_owned(),
            ));
        }
        let handles: Vec<TaskHandle> = joins.iter().map(|j| j.handle.clone()).collect();
        let (outcome, winner, _losers) =
            match self.suspend(futures::future::select_all(joins)).await {
                Ok(done) => done,
                Err(cancelled) => {
                    cancel_all(&handles);
                    return Err(cancelled);
                }
            };
        for (index, handle) in handles.iter().enumerate() {
            if index != winner {
                handle.cancel();
            }
        }
        outcome.map(|value| (winner, value))
    }

    /// Race `join` against a timer task; the loser is cancelled.
    ///
    /// # Errors
    ///
    /// [`TaskError::TimedOut`] if the timer wins, otherwise whatever `join`
    /// produced.
    pub async fn timeout<T: Send + 'static>(
        &self,
        duration: Duration,
        join: TaskJoin<T>,
    ) -> Result<T, TaskError> {
        let timer = self.spawn("timer", move |cx| async move {
            cx.delay(duration).await?;
            Err::<T, _>(TaskError::TimedOut(duration))
        });
        let (_, value) = self.race(vec![join, timer]).await?;
        Ok(value)
    }

    /// Suspend until an event satisfying `predicate` is published.
    pub async fn wait_for_event<P>(&self, predicate: P) -> Result<Event, TaskError>
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.check_cancelled()?;
        let waiter = self.hub.wait_for(Arc::new(predicate));
        self.suspend(waiter)
            .await?
            .map_err(|_| TaskError::Internal("event hub dropped".to_owned()))
    }

    /// Suspend for `duration`.
    pub async fn delay(&self, duration: Duration) -> Result<(), TaskError> {
        self.suspend(tokio::time::sleep(duration)).await
    }

    /// Give other ready tasks a turn.
    pub async fn yield_now(&self) -> Result<(), TaskError> {
        self.suspend(tokio::task::yield_now()).await
    }
}

fn cancel_all(handles: &[TaskHandle]) {
    for handle in handles {
        handle.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::test_fixtures::*;
    use crate::scheduler::ExecutorMode;
    use crate::store::StateStore;
    use serde_json::json;

    fn root_context(name: &str) -> TaskContext {
        let scheduler = Scheduler::new(ExecutorMode::Dedicated, name).unwrap();
        let hub = EventHub::new(scheduler.clone());
        TaskContext::new(TaskHandle::root(name, TaskOrigin::Service), scheduler, hub)
    }

    #[tokio::test]
    async fn cancelling_parent_cascades_and_blocks_later_writes() {
        let cx = root_context("cascade");
        let store = StateStore::new(TestState::default());

        let children: Vec<TaskJoin<()>> = (0..4)
            .map(|i| {
                let store = store.clone();
                cx.spawn(&format!("child-{i}"), move |child| async move {
                    child.delay(Duration::from_secs(3600)).await?;
                    store.write::<CounterReducer>(&CounterAction::Increment)?;
                    Ok(())
                })
            })
            .collect();
        let handles: Vec<TaskHandle> = children.iter().map(|c| c.handle().clone()).collect();
        assert_eq!(cx.handle().children().len(), 4);

        cx.handle().cancel();
        for child in children {
            assert_eq!(child.await, Err(TaskError::Cancelled));
        }
        assert!(handles.iter().all(TaskHandle::is_cancelled));
        assert!(handles.iter().all(TaskHandle::is_finished));
        assert_eq!(store.version(), 0);
        assert!(cx.handle().children().is_empty());
    }

    #[tokio::test]
    async fn tasks_without_suspension_apply_writes_in_spawn_order() {
        let cx = root_context("order");
        let store = StateStore::new(TestState::default());
        let joins: Vec<TaskJoin<()>> = ["first", "second", "third"]
            .into_iter()
            .map(|label| {
                let store = store.clone();
                cx.spawn(label, move |_| async move {
                    store.write::<LogReducer>(&label.to_owned())?;
                    Ok(())
                })
            })
            .collect();
        cx.join_all(joins).await.unwrap();
        assert_eq!(store.read(|s| s.log.clone()), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn join_all_returns_values_in_input_order() {
        let cx = root_context("join-order");
        let slow = cx.spawn("slow", |c| async move {
            c.delay(Duration::from_millis(30)).await?;
            Ok(1)
        });
        let fast = cx.spawn("fast", |_| async { Ok(2) });
        assert_eq!(cx.join_all(vec![slow, fast]).await, Ok(vec![1, 2]));
    }

    #[tokio::test]
    async fn join_all_first_error_cancels_siblings() {
        let cx = root_context("join-fail");
        let sleeper = cx.spawn("sleeper", |c| async move {
            c.delay(Duration::from_secs(3600)).await?;
            Ok(0)
        });
        let sleeper_handle = sleeper.handle().clone();
        let failing = cx.spawn("failing", |_| async {
            Err::<i32, _>(TaskError::Domain("no such filter".into()))
        });

        let err = cx.join_all(vec![sleeper, failing]).await.unwrap_err();
        assert_eq!(err, TaskError::Domain("no such filter".into()));
        assert!(sleeper_handle.is_cancelled());
        assert!(!cx.is_cancelled());
    }

    #[tokio::test]
    async fn race_cancels_losers() {
        let cx = root_context("race");
        let slow = cx.spawn("slow", |c| async move {
            c.delay(Duration::from_secs(3600)).await?;
            Ok("slow")
        });
        let slow_handle = slow.handle().clone();
        let fast = cx.spawn("fast", |c| async move {
            c.yield_now().await?;
            Ok("fast")
        });
        let fast_handle = fast.handle().clone();

        assert_eq!(cx.race(vec![slow, fast]).await, Ok((1, "fast")));
        assert!(slow_handle.is_cancelled());
        assert!(!fast_handle.is_cancelled());
    }

    #[tokio::test]
    async fn race_of_nothing_is_invalid() {
        let cx = root_context("race-empty");
        let err = cx.race::<()>(Vec::new()).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn timeout_cancels_slow_task() {
        let cx = root_context("timeout");
        let slow = cx.spawn("slow", |c| async move {
            c.delay(Duration::from_secs(3600)).await?;
            Ok(())
        });
        let slow_handle = slow.handle().clone();
        let err = cx
            .timeout(Duration::from_millis(20), slow)
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::TimedOut(Duration::from_millis(20)));
        assert!(slow_handle.is_cancelled());
    }

    #[tokio::test]
    async fn timeout_passes_through_fast_result() {
        let cx = root_context("timeout-fast");
        let fast = cx.spawn("fast", |_| async { Ok(5) });
        assert_eq!(cx.timeout(Duration::from_secs(5), fast).await, Ok(5));
    }

    #[tokio::test]
    async fn wait_for_event_resumes_on_matching_event() {
        let cx = root_context("wait");
        let waiter = cx.spawn("waiter", |c| async move {
            c.wait_for_event(|e| e.event_type == "READY").await
        });
        // Let the waiter register before publishing.
        tokio::time::sleep(Duration::from_millis(20)).await;
        cx.hub().publish(Event::new("NOISE", json!({})));
        cx.hub().publish(Event::new("READY", json!({"ok": true})));
        let event = waiter.await.unwrap();
        assert_eq!(event.payload, json!({"ok": true}));
    }

    #[tokio::test]
    async fn suspend_on_cancelled_task_short_circuits() {
        let cx = root_context("short");
        cx.handle().cancel();
        let out = cx.suspend(async { 1 }).await;
        assert_eq!(out, Err(TaskError::Cancelled));
    }

    #[tokio::test]
    async fn call_maps_collaborator_errors() {
        let cx = root_context("call");
        let err = cx
            .call(async { Err::<(), _>(CollaboratorError::Unavailable("down".into())) })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TaskError::Collaborator(CollaboratorError::Unavailable("down".into()))
        );
        let cancelled = cx
            .call(async { Err::<(), _>(CollaboratorError::Cancelled) })
            .await
            .unwrap_err();
        assert!(cancelled.is_cancelled());
    }

    #[tokio::test]
    async fn panicking_child_becomes_error() {
        let cx = root_context("panic");
        let join = cx.spawn("boom", |_| async {
            if true {
                panic!("child exploded");
            }
            Ok(())
        });
        assert_eq!(join.await, Err(TaskError::Panicked("child exploded".into())));
    }

    #[test]
    fn child_inherits_origin() {
        let cause = CommandRef {
            command_type: "X".into(),
            correlation_id: "c".into(),
        };
        let root = TaskHandle::root("root", TaskOrigin::Command(cause.clone()));
        let child = root.child("child");
        assert_eq!(child.origin(), &TaskOrigin::Command(cause));
        assert_ne!(child.id(), root.id());
        root.cancel();
        assert!(child.is_cancelled());
    }
}
