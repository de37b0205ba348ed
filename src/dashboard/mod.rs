//! Dashboard attribute filters built on the engine.
//!
//! Three slices ([`catalog`], [`attribute_filter`], [`filter_context`]), the
//! cached backend reads in [`queries`], and the command handlers that tie
//! them together. [`register`] installs every handler on a builder.

use std::sync::Arc;

pub mod attribute_filter;
pub mod backend;
pub mod catalog;
pub mod filter_context;
pub mod init;
pub mod queries;
pub mod selection;

use crate::engine::EngineBuilder;
use attribute_filter::AttributeFiltersState;
use backend::AttributeFilterBackend;
use catalog::{CatalogState, LoadCatalogHandler};
use filter_context::{
    AddAttributeFilterHandler, ChangeAttributeFilterSelectionHandler, FilterContextState,
    MoveAttributeFilterHandler, RemoveAttributeFiltersHandler,
};
use init::{ConfigureAttributeFilterHandler, InitAttributeFilterHandler};
use selection::{
    ChangeSelectionHandler, ClearSelectionHandler, CommitSelectionHandler, InvertSelectionHandler,
    RevertSelectionHandler,
};

/// State tree of a dashboard.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashboardState {
    /// Preloaded catalog.
    pub catalog: CatalogState,
    /// Attribute filters by id.
    pub attribute_filters: AttributeFiltersState,
    /// Filters placed on the dashboard.
    pub filter_context: FilterContextState,
}

/// Register every dashboard handler on `builder`.
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use taskfold::dashboard::{self, DashboardState, backend::AttributeFilterBackend};
/// # fn demo(backend: Arc<dyn AttributeFilterBackend>) -> Result<(), taskfold::EngineError> {
/// let engine = dashboard::register(taskfold::Engine::builder(DashboardState::default()), backend)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub fn register(
    builder: EngineBuilder<DashboardState>,
    backend: Arc<dyn AttributeFilterBackend>,
) -> EngineBuilder<DashboardState> {
    builder
        .handler(LoadCatalogHandler::new(Arc::clone(&backend)))
        .handler(ConfigureAttributeFilterHandler)
        .handler(InitAttributeFilterHandler::new(backend))
        .handler(ChangeSelectionHandler)
        .handler(CommitSelectionHandler)
        .handler(RevertSelectionHandler)
        .handler(InvertSelectionHandler)
        .handler(ClearSelectionHandler)
        .handler(AddAttributeFilterHandler)
        .handler(RemoveAttributeFiltersHandler)
        .handler(MoveAttributeFilterHandler)
        .handler(ChangeAttributeFilterSelectionHandler)
}
