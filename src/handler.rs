//! Command handlers and the facade they run against.
//!
//! A [`CommandHandler`] implements the behavior of one command type. The bus
//! decodes the command payload into the handler's typed command, spawns the
//! handler as a root task and hands it a [`HandlerContext`]: the only way a
//! handler touches the store, the query cache, the event hub or other
//! commands.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::bus::CommandBus;
use crate::command::{Command, CommandRef};
use crate::error::{CollaboratorError, TaskError};
use crate::event::{Event, EventKind};
use crate::query::{Query, QueryService};
use crate::reducer::SliceReducer;
use crate::selector::Selector;
use crate::store::StateStore;
use crate::task::{TaskContext, TaskJoin};

/// Behavior for one command type.
///
/// # Contract
///
/// - The handler should end by emitting exactly one terminal event (a
///   `*_SUCCESS`/`*_CHANGED`/`*_COMPLETED`, `*_FAILED`/`*_ERROR`, or
///   `*_CANCEL` type) through [`HandlerContext::emit`]. If it returns without
///   one, the bus emits a generic `COMMAND_FAILED` or `COMMAND_CANCELLED`.
/// - Returning `Err` is the same as not emitting a terminal event: the error
///   becomes the `COMMAND_FAILED` message.
#[async_trait]
pub trait CommandHandler<S>: Send + Sync + 'static
where
    S: Clone + Send + Sync + 'static,
{
    /// Command type this handler is registered under.
    const COMMAND_TYPE: &'static str;

    /// Typed command decoded from the payload.
    type Command: DeserializeOwned + Send + 'static;

    /// Run the command.
    ///
    /// # Arguments
    ///
    /// * `cx` - Facade bound to the engine and to this command's root task.
    /// * `command` - The decoded payload.
    async fn handle(&self, cx: HandlerContext<S>, command: Self::Command) -> Result<(), TaskError>;
}

/// Type-erased handler stored in the bus registry.
pub(crate) trait ErasedHandler<S>: Send + Sync {
    fn command_type(&self) -> &'static str;

    fn call(
        &self,
        cx: HandlerContext<S>,
        payload: Value,
    ) -> BoxFuture<'static, Result<(), TaskError>>;
}

/// Registry adapter for a concrete handler `H`.
struct TypedHandler<S, H> {
    inner: Arc<H>,
    _state: PhantomData<fn() -> S>,
}

impl<S, H> ErasedHandler<S> for TypedHandler<S, H>
where
    S: Clone + Send + Sync + 'static,
    H: CommandHandler<S>,
{
    fn command_type(&self) -> &'static str {
        H::COMMAND_TYPE
    }

    fn call(
        &self,
        cx: HandlerContext<S>,
        payload: Value,
    ) -> BoxFuture<'static, Result<(), TaskError>> {
        let handler = Arc::clone(&self.inner);
        Box::pin(async move {
            let command: H::Command = serde_json::from_value(payload).map_err(|e| {
                TaskError::InvalidArguments(format!("payload of {}: {e}", H::COMMAND_TYPE))
            })?;
            handler.handle(cx, command).await
        })
    }
}

pub(crate) fn erase<S, H>(handler: H) -> Box<dyn ErasedHandler<S>>
where
    S: Clone + Send + Sync + 'static,
    H: CommandHandler<S>,
{
    Box::new(TypedHandler {
        inner: Arc::new(handler),
        _state: PhantomData,
    })
}

enum SlotState {
    /// Nothing terminal yet; the sender resolves the dispatch.
    Open(oneshot::Sender<Event>),
    /// The handler emitted the terminal event.
    Emitted,
    /// The bus produced a fallback terminal event.
    Claimed,
}

/// Exactly-once gate for a command's terminal event.
pub(crate) struct TerminalSlot {
    state: Mutex<SlotState>,
}

impl TerminalSlot {
    pub(crate) fn new(reply: oneshot::Sender<Event>) -> Self {
        Self {
            state: Mutex::new(SlotState::Open(reply)),
        }
    }

    /// Take the slot for a bus-generated terminal event.
    ///
    /// Returns `false` if the handler already emitted one.
    pub(crate) fn claim(&self) -> bool {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, SlotState::Claimed) {
            SlotState::Open(_) => true,
            previous => {
                *state = previous;
                false
            }
        }
    }
}

/// Facade a handler (and each of its child tasks) runs against.
pub struct HandlerContext<S> {
    task: TaskContext,
    store: StateStore<S>,
    queries: QueryService,
    bus: CommandBus<S>,
    command: CommandRef,
    terminal: Arc<TerminalSlot>,
}

impl<S> Clone for HandlerContext<S> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
            store: self.store.clone(),
            queries: self.queries.clone(),
            bus: self.bus.clone(),
            command: self.command.clone(),
            terminal: Arc::clone(&self.terminal),
        }
    }
}

impl<S> fmt::Debug for HandlerContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("command", &self.command)
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

impl<S> HandlerContext<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        task: TaskContext,
        store: StateStore<S>,
        queries: QueryService,
        bus: CommandBus<S>,
        command: CommandRef,
        terminal: Arc<TerminalSlot>,
    ) -> Self {
        Self {
            task,
            store,
            queries,
            bus,
            command,
            terminal,
        }
    }

    /// The command being handled.
    pub fn command(&self) -> &CommandRef {
        &self.command
    }

    /// Correlation id of the command being handled.
    pub fn correlation_id(&self) -> &str {
        &self.command.correlation_id
    }

    /// Task primitives for this routine.
    pub fn task(&self) -> &TaskContext {
        &self.task
    }

    /// Whether this routine has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    /// Run a pure read against the current state tree.
    pub fn read<T>(&self, f: impl FnOnce(&S) -> T) -> T {
        self.store.read(f)
    }

    /// Read through a memoized selector.
    pub fn select<T: Send + Sync + 'static>(&self, selector: &Selector<S, T>) -> Arc<T> {
        self.store.select(selector)
    }

    /// Apply `action` through reducer `R`.
    ///
    /// # Errors
    ///
    /// * [`TaskError::Cancelled`] - this routine was cancelled; nothing is written.
    /// * [`TaskError::Internal`] - `R` does not own its slice.
    pub fn write<R>(&self, action: &R::Action) -> Result<(), TaskError>
    where
        R: SliceReducer<State = S>,
    {
        self.task.check_cancelled()?;
        self.store.write::<R>(action)?;
        Ok(())
    }

    /// Publish `event`, correlated with the command being handled.
    ///
    /// The first terminal-kind event for this command resolves its dispatch.
    /// A second terminal event is dropped, and so is a success or failure
    /// terminal from a cancelled routine. Events without a correlation id or
    /// cause inherit the command's.
    pub fn emit(&self, mut event: Event) {
        if event.correlation_id.is_none() {
            event.correlation_id = Some(self.command.correlation_id.clone());
        }
        if event.caused_by.is_none() {
            event.caused_by = Some(self.command.clone());
        }
        let hub = self.task.hub();
        let kind = event.kind();
        let own = event.correlation_id.as_deref() == Some(self.command.correlation_id.as_str());
        if !own || !kind.is_terminal() {
            hub.publish(event);
            return;
        }

        if self.task.is_cancelled() && kind != EventKind::Cancelled {
            tracing::warn!(
                event_type = %event.event_type,
                "outcome event from cancelled routine dropped"
            );
            return;
        }

        let mut state = self.terminal.state.lock();
        match std::mem::replace(&mut *state, SlotState::Emitted) {
            SlotState::Open(reply) => {
                hub.publish(event.clone());
                let _ = reply.send(event);
            }
            // Cancellation may still follow a bus-generated failure.
            SlotState::Claimed if kind == EventKind::Cancelled => {
                *state = SlotState::Claimed;
                hub.publish(event);
            }
            previous => {
                *state = previous;
                tracing::warn!(
                    event_type = %event.event_type,
                    "terminal event already produced for this command; dropped"
                );
            }
        }
    }

    /// Serialize an adjacently tagged domain event and [`emit`](Self::emit) it.
    ///
    /// # Errors
    ///
    /// [`TaskError::Internal`] if the value is not a tagged event.
    pub fn emit_typed<E: Serialize>(&self, event: &E) -> Result<(), TaskError> {
        let event = Event::from_typed(event).map_err(|e| TaskError::Internal(e.to_string()))?;
        self.emit(event);
        Ok(())
    }

    /// Run a cached query, suspending until it resolves.
    ///
    /// Cancelling this routine detaches it from the fetch; the fetch itself
    /// keeps running for other callers.
    pub async fn query<Q: Query>(&self, query: Q) -> Result<Q::Output, TaskError> {
        Ok(self.task.suspend(self.queries.query(query)).await??)
    }

    /// Evict cache entries whose key satisfies `predicate`.
    pub fn invalidate(&self, predicate: impl Fn(&str) -> bool) -> usize {
        self.queries.invalidate(predicate)
    }

    /// Dispatch a sub-command as a child of this routine and wait for its
    /// terminal event.
    ///
    /// The sub-command bypasses the intake queue, so it runs even under
    /// serial dispatch, and is cancelled along with this routine.
    pub async fn dispatch(&self, command: Command) -> Result<Event, TaskError> {
        let pending = self.bus.submit_nested(command, self.task.handle());
        self.task.suspend(pending).await
    }

    /// Spawn a child routine with its own facade.
    pub fn spawn<T, F, Fut>(&self, name: &str, routine: F) -> TaskJoin<T>
    where
        T: Send + 'static,
        F: FnOnce(HandlerContext<S>) -> Fut,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let child = Self {
            task: self.task.fork(name),
            ..self.clone()
        };
        let handle = child.task.handle().clone();
        let scheduler = child.task.scheduler().clone();
        TaskJoin::start(&scheduler, handle, routine(child))
    }

    /// See [`TaskContext::join_all`].
    pub async fn join_all<T: Send + 'static>(
        &self,
        joins: Vec<TaskJoin<T>>,
    ) -> Result<Vec<T>, TaskError> {
        self.task.join_all(joins).await
    }

    /// See [`TaskContext::call`].
    pub async fn call<T, F>(&self, future: F) -> Result<T, TaskError>
    where
        F: Future<Output = Result<T, CollaboratorError>>,
    {
        self.task.call(future).await
    }
}
