//! Crate-level error types for tasks, queries, the state store and engine setup.

use std::time::Duration;

/// Typed rejection from an external collaborator (backend access layer).
///
/// Collaborators are opaque async functions; this is the minimum taxonomy
/// a handler needs to decide between recovery and propagation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// The request was malformed from the collaborator's point of view.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The collaborator could not be reached or failed transiently.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The call was aborted because the calling task was cancelled.
    #[error("cancelled by caller")]
    Cancelled,
}

/// Error that terminates a cooperative task.
///
/// `Clone` because task outcomes are shared between every joiner of a
/// single-flight query and are copied into failure event payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task observed its cancellation flag at a suspension point.
    ///
    /// Cancellation is not a failure; callers should branch on
    /// [`TaskError::is_cancelled`] before treating the value as an error.
    #[error("task cancelled")]
    Cancelled,

    /// Input was structurally invalid.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// A handler precondition was violated.
    #[error("{0}")]
    Domain(String),

    /// An external call rejected.
    #[error(transparent)]
    Collaborator(CollaboratorError),

    /// A timer won the race against the substantive task.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// The task body panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Engine-internal failure (scheduler gone, cached type mismatch, ...).
    #[error("internal error: {0}")]
    Internal(String),
}

impl TaskError {
    /// Returns `true` for [`TaskError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

// A collaborator that reports cancellation is echoing our own cancellation
// back, so it maps onto the task's cancellation branch rather than an error.
impl From<CollaboratorError> for TaskError {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::Cancelled => TaskError::Cancelled,
            other => TaskError::Collaborator(other),
        }
    }
}

/// Error returned by [`QueryService::query`](crate::QueryService::query).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// The underlying fetch failed. Every caller attached to the same
    /// in-flight fetch receives an equal copy of this error.
    #[error(transparent)]
    Fetch(Box<TaskError>),

    /// A cached value exists under the key but has a different Rust type.
    #[error("cached value for key '{key}' has a different type")]
    TypeMismatch {
        /// The cache key that collided.
        key: String,
    },

    /// The query service (or its scheduler) has shut down.
    #[error("query service is shut down")]
    Closed,
}

impl From<QueryError> for TaskError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Fetch(inner) => *inner,
            other => TaskError::Internal(other.to_string()),
        }
    }
}

/// Error returned when writing to the [`StateStore`](crate::StateStore).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A second reducer type tried to write a slice already owned by another.
    #[error("slice '{slice}' is owned by reducer {owner}, refused write from {writer}")]
    SliceAliased {
        /// Slice name.
        slice: &'static str,
        /// Type name of the reducer that owns the slice.
        owner: &'static str,
        /// Type name of the reducer that attempted the write.
        writer: &'static str,
    },
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        TaskError::Internal(err.to_string())
    }
}

/// Error returned when building an [`Engine`](crate::Engine).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// `ExecutorMode::Ambient` was requested outside a tokio runtime.
    #[error("ambient executor requested but no tokio runtime is running")]
    NoRuntime,

    /// The dedicated scheduler thread or its runtime failed to start.
    #[error("failed to start scheduler: {0}")]
    Scheduler(#[from] std::io::Error),

    /// Two handlers were registered for the same command type.
    #[error("duplicate handler for command type '{0}'")]
    DuplicateHandler(String),
}
