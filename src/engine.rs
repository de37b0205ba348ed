//! Engine assembly: one store, one scheduler, one bus, one query cache.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::{CommandBus, Dispatch, DispatchMode, HandlerMap};
use crate::command::Command;
use crate::error::{EngineError, QueryError};
use crate::event::Event;
use crate::handler::{CommandHandler, ErasedHandler, erase};
use crate::query::{Query, QueryService};
use crate::scheduler::{ExecutorMode, Scheduler};
use crate::selector::Selector;
use crate::store::StateStore;
use crate::subscription::{EventHub, EventStream, Subscription};

/// Default OS thread name of the dedicated scheduler.
pub const DEFAULT_THREAD_NAME: &str = "taskfold-scheduler";

/// Engine tuning knobs.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use taskfold::{DispatchMode, EngineConfig};
///
/// let config = EngineConfig {
///     dispatch_mode: DispatchMode::Serial,
///     handler_timeout: Some(Duration::from_secs(30)),
///     ..EngineConfig::default()
/// };
/// assert_eq!(config.thread_name, "taskfold-scheduler");
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How commands taken from the intake are scheduled.
    ///
    /// Default: [`DispatchMode::Concurrent`].
    pub dispatch_mode: DispatchMode,

    /// Upper bound on a handler's run time. When the timer wins, the
    /// command's task tree is cancelled and the command fails with
    /// `timed_out`.
    ///
    /// Default: none.
    pub handler_timeout: Option<Duration>,

    /// Where tasks execute.
    ///
    /// Default: [`ExecutorMode::Dedicated`].
    pub executor: ExecutorMode,

    /// OS thread name for the dedicated scheduler.
    ///
    /// Default: `"taskfold-scheduler"`.
    pub thread_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_mode: DispatchMode::Concurrent,
            handler_timeout: None,
            executor: ExecutorMode::Dedicated,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }
}

/// Builder for [`Engine`].
///
/// # Examples
///
/// ```no_run
/// use taskfold::EngineBuilder;
///
/// #[derive(Clone, Default)]
/// struct AppState;
///
/// let engine = EngineBuilder::new(AppState).build()?;
/// # Ok::<(), taskfold::EngineError>(())
/// ```
pub struct EngineBuilder<S> {
    initial: S,
    config: EngineConfig,
    handlers: Vec<Box<dyn ErasedHandler<S>>>,
}

impl<S> EngineBuilder<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Start from the initial state tree and default configuration.
    pub fn new(initial: S) -> Self {
        Self {
            initial,
            config: EngineConfig::default(),
            handlers: Vec::new(),
        }
    }

    /// Register a handler under `H::COMMAND_TYPE`.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn handler<H: CommandHandler<S>>(mut self, handler: H) -> Self {
        self.handlers.push(erase(handler));
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the intake dispatch mode.
    pub fn dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.config.dispatch_mode = mode;
        self
    }

    /// Bound every handler's run time.
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.config.handler_timeout = Some(timeout);
        self
    }

    /// Choose where tasks execute.
    pub fn executor(mut self, mode: ExecutorMode) -> Self {
        self.config.executor = mode;
        self
    }

    /// Name the dedicated scheduler thread.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Start the scheduler and wire everything together.
    ///
    /// # Errors
    ///
    /// * [`EngineError::DuplicateHandler`] - two handlers share a command type.
    /// * [`EngineError::NoRuntime`] - ambient executor outside a runtime.
    /// * [`EngineError::Scheduler`] - the dedicated thread failed to start.
    pub fn build(self) -> Result<Engine<S>, EngineError> {
        let mut handlers: HandlerMap<S> = HandlerMap::new();
        for handler in self.handlers {
            let command_type = handler.command_type();
            if handlers.contains_key(command_type) {
                return Err(EngineError::DuplicateHandler(command_type.to_owned()));
            }
            handlers.insert(command_type.to_owned(), handler);
        }

        let scheduler = Scheduler::new(self.config.executor, &self.config.thread_name)?;
        let hub = EventHub::new(scheduler.clone());
        let store = StateStore::new(self.initial);
        let queries = QueryService::new(scheduler.clone(), hub.clone());
        let bus = CommandBus::new(
            handlers,
            store.clone(),
            queries.clone(),
            hub.clone(),
            scheduler.clone(),
            self.config.dispatch_mode,
            self.config.handler_timeout,
        );

        tracing::info!(
            handlers = bus.command_types().len(),
            mode = ?self.config.dispatch_mode,
            executor = ?self.config.executor,
            "engine started"
        );
        Ok(Engine {
            store,
            bus,
            queries,
            hub,
            scheduler,
        })
    }
}

/// The orchestration engine. Cheap to clone; clones share everything.
pub struct Engine<S> {
    store: StateStore<S>,
    bus: CommandBus<S>,
    queries: QueryService,
    hub: EventHub,
    scheduler: Scheduler,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            bus: self.bus.clone(),
            queries: self.queries.clone(),
            hub: self.hub.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<S> fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("bus", &self.bus)
            .field("queries", &self.queries)
            .field("events", &self.hub)
            .finish_non_exhaustive()
    }
}

impl<S> Engine<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Shorthand for [`EngineBuilder::new`].
    pub fn builder(initial: S) -> EngineBuilder<S> {
        EngineBuilder::new(initial)
    }

    /// Dispatch `command` and wait for its terminal event.
    ///
    /// Never fails: unknown commands, validation errors, handler errors and
    /// shutdown all resolve to a `COMMAND_FAILED` event.
    pub async fn dispatch(&self, command: Command) -> Event {
        self.bus.dispatch(command).await
    }

    /// Queue `command` and return its pending dispatch, which exposes the
    /// correlation id and a cancellable task handle.
    pub fn submit(&self, command: Command) -> Dispatch {
        self.bus.submit(command)
    }

    /// Run a cached query.
    ///
    /// # Errors
    ///
    /// See [`QueryService::query`].
    pub async fn query<Q: Query>(&self, query: Q) -> Result<Q::Output, QueryError> {
        self.queries.query(query).await
    }

    /// Evict cache entries whose key satisfies `predicate`.
    pub fn invalidate(&self, predicate: impl Fn(&str) -> bool) -> usize {
        self.queries.invalidate(predicate)
    }

    /// Invoke `callback`, in emission order, for every event satisfying
    /// `predicate`.
    pub fn subscribe_to_events<P, F>(&self, predicate: P, callback: F) -> Subscription
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.hub.subscribe(predicate, callback)
    }

    /// Matching events as a stream.
    pub fn subscribe_stream<P>(&self, predicate: P) -> EventStream
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.hub.subscribe_stream(predicate)
    }

    /// Run a pure read against the current state tree.
    pub fn read<T>(&self, f: impl FnOnce(&S) -> T) -> T {
        self.store.read(f)
    }

    /// Read through a memoized selector.
    pub fn select<T: Send + Sync + 'static>(&self, selector: &Selector<S, T>) -> Arc<T> {
        self.store.select(selector)
    }

    /// The state store.
    pub fn store(&self) -> &StateStore<S> {
        &self.store
    }

    /// The query cache.
    pub fn queries(&self) -> &QueryService {
        &self.queries
    }

    /// The command bus.
    pub fn bus(&self) -> &CommandBus<S> {
        &self.bus
    }

    /// Cancel running commands and fetches, then stop the dedicated
    /// scheduler thread.
    pub fn shutdown(&self) {
        tracing::info!("engine shutting down");
        self.bus.shutdown();
        self.queries.shutdown();
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::handler::HandlerContext;
    use crate::reducer::test_fixtures::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct Bump;

    #[async_trait]
    impl CommandHandler<TestState> for Bump {
        const COMMAND_TYPE: &'static str = "BUMP";
        type Command = serde_json::Value;

        async fn handle(
            &self,
            cx: HandlerContext<TestState>,
            _: serde_json::Value,
        ) -> Result<(), TaskError> {
            cx.write::<CounterReducer>(&CounterAction::Increment)?;
            cx.emit(Event::new("BUMP_SUCCESS", json!({})));
            Ok(())
        }
    }

    #[test]
    fn default_config_values() {
        let config = EngineConfig::default();
        assert_eq!(config.dispatch_mode, DispatchMode::Concurrent);
        assert_eq!(config.handler_timeout, None);
        assert_eq!(config.executor, ExecutorMode::Dedicated);
        assert_eq!(config.thread_name, DEFAULT_THREAD_NAME);
    }

    #[test]
    fn duplicate_handlers_are_rejected() {
        let err = EngineBuilder::new(TestState::default())
            .handler(Bump)
            .handler(Bump)
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateHandler(t) if t == "BUMP"));
    }

    #[tokio::test]
    async fn dispatch_and_select_through_engine() {
        let engine = Engine::builder(TestState::default())
            .handler(Bump)
            .thread_name("engine-test")
            .build()
            .unwrap();
        let counter = Selector::new("counter", |s: &TestState| s.counter);

        assert_eq!(engine.dispatch(Command::new("BUMP")).await.event_type, "BUMP_SUCCESS");
        assert_eq!(*engine.select(&counter), 1);
        assert_eq!(engine.bus().command_types(), vec!["BUMP"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn ambient_executor_runs_on_caller_runtime() {
        let engine = Engine::builder(TestState::default())
            .handler(Bump)
            .executor(ExecutorMode::Ambient)
            .build()
            .unwrap();
        engine.dispatch(Command::new("BUMP")).await;
        engine.dispatch(Command::new("BUMP")).await;
        assert_eq!(engine.read(|s| s.counter), 2);
    }

    #[tokio::test]
    async fn shutdown_resolves_pending_commands() {
        let engine = Engine::builder(TestState::default()).build().unwrap();
        engine.shutdown();
        let event = engine.dispatch(Command::new("BUMP")).await;
        assert_eq!(event.event_type, crate::event::COMMAND_FAILED);
    }
}
