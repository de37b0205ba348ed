//! Cooperative command/query orchestration over a reducer-backed state tree.
//!
//! Commands go through a [`CommandBus`] to typed [`CommandHandler`]s, each
//! running as a cancellable task tree on a single-threaded [`Scheduler`].
//! Handlers write the [`StateStore`] through [`SliceReducer`]s, read it
//! through memoized [`Selector`]s, fetch data through the single-flight
//! [`QueryService`], and report progress as correlated [`Event`]s.
//! [`Engine`] assembles all of it; [`dashboard`] is a complete domain built
//! on top.

mod bus;
mod channel;
mod command;
mod engine;
mod error;
mod event;
mod handler;
mod query;
mod reducer;
mod scheduler;
mod selector;
mod store;
mod subscription;
mod task;

pub mod dashboard;

pub use bus::{CommandBus, Dispatch, DispatchMode};
pub use channel::{ActionReceiver, ActionSender, ChannelClosed, ChannelStats, action_channel};
pub use command::{
    Command, CommandRef, MAX_CORRELATION_ID_LEN, new_correlation_id, validate_correlation_id,
};
pub use engine::{DEFAULT_THREAD_NAME, Engine, EngineBuilder, EngineConfig};
pub use error::{CollaboratorError, EngineError, QueryError, StoreError, TaskError};
pub use event::{
    COMMAND_CANCELLED, COMMAND_FAILED, COMMAND_STARTED, CommandFailed, Event, EventKind,
    FailureReason,
};
pub use handler::{CommandHandler, HandlerContext};
pub use query::{CacheStatus, Query, QueryDescriptor, QueryService, QueryStats};
pub use reducer::SliceReducer;
pub use scheduler::{ExecutorMode, Scheduler};
pub use selector::Selector;
pub use store::StateStore;
pub use subscription::{EventHub, EventPredicate, EventStream, Subscription};
pub use task::{TaskContext, TaskHandle, TaskId, TaskJoin, TaskOrigin};
