//! Command routing and terminal-event tracking.
//!
//! Every dispatched command becomes a root task whose outcome is exactly one
//! terminal event. Commands enter through an intake [`ActionChannel`]; a
//! handler dispatching a sub-command bypasses the intake and runs it as a
//! child of its own task.
//!
//! [`ActionChannel`]: crate::channel

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::json;
use tokio::sync::oneshot;
use tracing::Instrument;

use crate::channel::{ActionReceiver, ActionSender, ChannelStats, action_channel};
use crate::command::{Command, CommandRef, new_correlation_id, validate_correlation_id};
use crate::error::TaskError;
use crate::event::{COMMAND_CANCELLED, COMMAND_STARTED, CommandFailed, Event, FailureReason};
use crate::handler::{ErasedHandler, HandlerContext, TerminalSlot};
use crate::query::QueryService;
use crate::scheduler::Scheduler;
use crate::store::StateStore;
use crate::subscription::EventHub;
use crate::task::{TaskContext, TaskHandle, TaskJoin, TaskOrigin};

/// How the intake loop schedules commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Spawn every command as soon as it is taken from the intake.
    #[default]
    Concurrent,
    /// Run one command at a time, in submission order, each until it
    /// resolves.
    Serial,
}

pub(crate) type HandlerMap<S> = HashMap<String, Box<dyn ErasedHandler<S>>>;

/// Routes commands to handlers. Cheap to clone.
pub struct CommandBus<S> {
    inner: Arc<BusInner<S>>,
}

struct BusInner<S> {
    handlers: HandlerMap<S>,
    store: StateStore<S>,
    queries: QueryService,
    hub: EventHub,
    scheduler: Scheduler,
    mode: DispatchMode,
    handler_timeout: Option<Duration>,
    intake: ActionSender<Submission>,
    root: TaskHandle,
}

struct Submission {
    command: Command,
    handle: TaskHandle,
    reply: oneshot::Sender<Event>,
}

impl<S> Clone for CommandBus<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> fmt::Debug for CommandBus<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.inner.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("CommandBus")
            .field("handlers", &types)
            .field("mode", &self.inner.mode)
            .finish_non_exhaustive()
    }
}

impl<S> CommandBus<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Create the bus and start its intake loop on `scheduler`.
    pub(crate) fn new(
        handlers: HandlerMap<S>,
        store: StateStore<S>,
        queries: QueryService,
        hub: EventHub,
        scheduler: Scheduler,
        mode: DispatchMode,
        handler_timeout: Option<Duration>,
    ) -> Self {
        let (intake, rx) = action_channel();
        let bus = Self {
            inner: Arc::new(BusInner {
                handlers,
                store,
                queries,
                hub,
                scheduler: scheduler.clone(),
                mode,
                handler_timeout,
                intake,
                root: TaskHandle::root("command-bus", TaskOrigin::Service),
            }),
        };
        scheduler.spawn(intake_loop(Arc::downgrade(&bus.inner), rx));
        bus
    }

    /// Queue `command` and return a future of its terminal event.
    ///
    /// A correlation id is generated when the command carries none.
    pub fn submit(&self, command: Command) -> Dispatch {
        let (command, handle) = self.prepare(command, &self.inner.root);
        let (reply, rx) = oneshot::channel();
        let dispatch = Dispatch::new(&command, handle.clone(), rx);
        let submission = Submission {
            command,
            handle,
            reply,
        };
        if self.inner.intake.send(submission).is_err() {
            tracing::warn!(
                correlation_id = %dispatch.correlation_id,
                "intake closed; command dropped"
            );
        }
        dispatch
    }

    /// Submit `command` and wait for its terminal event.
    pub async fn dispatch(&self, command: Command) -> Event {
        self.submit(command).await
    }

    /// Run `command` immediately as a child of `parent`.
    pub(crate) fn submit_nested(&self, command: Command, parent: &TaskHandle) -> Dispatch {
        let (command, handle) = self.prepare(command, parent);
        let (reply, rx) = oneshot::channel();
        let dispatch = Dispatch::new(&command, handle.clone(), rx);
        let bus = self.clone();
        self.inner.scheduler.spawn(async move {
            bus.execute(Submission {
                command,
                handle,
                reply,
            })
            .await;
        });
        dispatch
    }

    /// Registered command types, sorted.
    pub fn command_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.inner.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Intake queue statistics.
    pub fn intake_stats(&self) -> ChannelStats {
        self.inner.intake.stats()
    }

    /// Cancel every running command. Later submissions fail with
    /// `engine_closed`.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
    }

    fn prepare(&self, mut command: Command, parent: &TaskHandle) -> (Command, TaskHandle) {
        let correlation_id = command
            .correlation_id
            .get_or_insert_with(new_correlation_id)
            .clone();
        let origin = TaskOrigin::Command(CommandRef {
            command_type: command.command_type.clone(),
            correlation_id,
        });
        let handle = parent.child_with_origin(command.command_type.clone(), origin);
        (command, handle)
    }

    async fn execute(&self, submission: Submission) {
        let Submission {
            command,
            handle,
            reply,
        } = submission;
        let span = tracing::info_span!(
            "command",
            command_type = %command.command_type,
            correlation_id = command.correlation_id.as_deref().unwrap_or(""),
            task = %handle.id(),
        );
        let event = self.run(command, handle).instrument(span).await;
        let _ = reply.send(event);
    }

    async fn run(&self, command: Command, handle: TaskHandle) -> Event {
        let correlation_id = command.correlation_id.clone();
        let cause = command.reference();
        let failed = |reason: FailureReason, message: String| {
            CommandFailed {
                command_type: command.command_type.clone(),
                reason,
                message,
            }
            .into_event(correlation_id.clone(), cause.clone())
        };

        if self.inner.root.is_cancelled() {
            handle.mark_finished();
            return self.conclude(failed(FailureReason::EngineClosed, "engine shut down".into()));
        }
        if let Err(message) = validate(&command) {
            tracing::warn!(%message, "command rejected by validation");
            handle.mark_finished();
            return self.conclude(failed(FailureReason::InvalidArguments, message));
        }
        let Some(handler) = self.inner.handlers.get(&command.command_type) else {
            tracing::warn!("no handler registered");
            handle.mark_finished();
            let message = format!("unknown command '{}'", command.command_type);
            return self.conclude(failed(FailureReason::UnknownCommand, message));
        };
        let Some(cause) = cause.clone() else {
            handle.mark_finished();
            return self.conclude(failed(
                FailureReason::InvalidArguments,
                "missing correlation id".into(),
            ));
        };
        if handle.is_cancelled() {
            handle.mark_finished();
            return self.conclude(cancelled(&cause));
        }

        self.inner.hub.publish(
            Event::new(COMMAND_STARTED, json!({ "commandType": cause.command_type }))
                .with_correlation_id(cause.correlation_id.clone())
                .with_caused_by(cause.clone()),
        );

        let (terminal_tx, mut terminal_rx) = oneshot::channel();
        let slot = Arc::new(TerminalSlot::new(terminal_tx));
        let cx = HandlerContext::new(
            TaskContext::new(
                handle.clone(),
                self.inner.scheduler.clone(),
                self.inner.hub.clone(),
            ),
            self.inner.store.clone(),
            self.inner.queries.clone(),
            self.clone(),
            cause.clone(),
            Arc::clone(&slot),
        );
        let mut join: TaskJoin<()> = TaskJoin::start(
            &self.inner.scheduler,
            handle.clone(),
            handler.call(cx, command.payload),
        );

        let limit = self.inner.handler_timeout;
        let timer = async move {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timer);

        let fallback = tokio::select! {
            biased;
            Ok(event) = &mut terminal_rx => {
                tracing::info!(event_type = %event.event_type, "command resolved");
                return event;
            }
            outcome = &mut join => match outcome {
                Ok(()) if handle.is_cancelled() => cancelled(&cause),
                Ok(()) => failed(
                    FailureReason::NoTerminalEvent,
                    format!(
                        "handler for '{}' returned without a terminal event",
                        cause.command_type
                    ),
                ),
                Err(TaskError::Cancelled) => cancelled(&cause),
                Err(TaskError::InvalidArguments(message)) => {
                    failed(FailureReason::InvalidArguments, message)
                }
                Err(TaskError::Panicked(message)) => failed(FailureReason::Panicked, message),
                Err(err @ TaskError::TimedOut(_)) => {
                    failed(FailureReason::TimedOut, err.to_string())
                }
                Err(err) => failed(FailureReason::HandlerError, err.to_string()),
            },
            () = &mut timer => {
                handle.cancel();
                let err = TaskError::TimedOut(limit.unwrap_or_default());
                failed(FailureReason::TimedOut, err.to_string())
            }
        };

        if slot.claim() {
            self.conclude(fallback)
        } else {
            // The handler emitted its terminal event as it finished.
            match terminal_rx.await {
                Ok(event) => event,
                Err(_) => self.conclude(fallback),
            }
        }
    }

    fn conclude(&self, event: Event) -> Event {
        tracing::info!(event_type = %event.event_type, "command resolved by bus");
        self.inner.hub.publish(event.clone());
        event
    }
}

fn cancelled(cause: &CommandRef) -> Event {
    Event::new(COMMAND_CANCELLED, json!({ "commandType": cause.command_type }))
        .with_correlation_id(cause.correlation_id.clone())
        .with_caused_by(cause.clone())
}

fn validate(command: &Command) -> Result<(), String> {
    if command.command_type.trim().is_empty() {
        return Err("command type must not be empty".to_owned());
    }
    if !command.payload.is_object() {
        return Err("command payload must be a JSON object".to_owned());
    }
    if let Some(id) = &command.correlation_id {
        validate_correlation_id(id)?;
    }
    Ok(())
}

async fn intake_loop<S>(bus: Weak<BusInner<S>>, mut rx: ActionReceiver<Submission>)
where
    S: Clone + Send + Sync + 'static,
{
    while let Some(submission) = rx.recv().await {
        let Some(inner) = bus.upgrade() else {
            break;
        };
        let bus = CommandBus { inner };
        match bus.inner.mode {
            DispatchMode::Concurrent => {
                let scheduler = bus.inner.scheduler.clone();
                scheduler.spawn(async move { bus.execute(submission).await });
            }
            DispatchMode::Serial => bus.execute(submission).await,
        }
    }
    tracing::debug!("command intake closed");
}

/// Future of a submitted command's terminal event.
///
/// Resolves to a `COMMAND_FAILED` (`engine_closed`) event if the engine
/// goes away before the command finishes. Dropping a `Dispatch` does not
/// cancel the command; use [`Dispatch::cancel`].
pub struct Dispatch {
    correlation_id: String,
    command_type: String,
    handle: TaskHandle,
    rx: oneshot::Receiver<Event>,
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("correlation_id", &self.correlation_id)
            .field("command_type", &self.command_type)
            .field("handle", &self.handle)
            .finish()
    }
}

impl Dispatch {
    fn new(command: &Command, handle: TaskHandle, rx: oneshot::Receiver<Event>) -> Self {
        Self {
            correlation_id: command.correlation_id.clone().unwrap_or_default(),
            command_type: command.command_type.clone(),
            handle,
            rx,
        }
    }

    /// Correlation id of the submitted command.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Root task of the command.
    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    /// Cancel the command, whether queued or running.
    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

impl Future for Dispatch {
    type Output = Event;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Event> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(event)) => Poll::Ready(event),
            Poll::Ready(Err(_)) => {
                let cause = CommandRef {
                    command_type: self.command_type.clone(),
                    correlation_id: self.correlation_id.clone(),
                };
                let event = CommandFailed {
                    command_type: self.command_type.clone(),
                    reason: FailureReason::EngineClosed,
                    message: "engine stopped before the command finished".to_owned(),
                }
                .into_event(Some(self.correlation_id.clone()), Some(cause));
                Poll::Ready(event)
            }
        }
    }
}
