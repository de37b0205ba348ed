//! Preloaded attribute catalog and attribute resolution.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::DashboardState;
use super::backend::{AttributeFilterBackend, AttributeMetadata, Catalog};
use super::queries::{AttributeQuery, CatalogQuery};
use crate::error::TaskError;
use crate::handler::{CommandHandler, HandlerContext};
use crate::reducer::SliceReducer;

/// Catalog slice.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CatalogState {
    /// Catalog attributes, once loaded.
    pub catalog: Option<Arc<Catalog>>,
}

impl CatalogState {
    /// Preloaded attribute for `display_form`.
    pub fn find(&self, display_form: &str) -> Option<&AttributeMetadata> {
        self.catalog.as_ref()?.find(display_form)
    }
}

/// Mutations of [`CatalogState`].
#[derive(Debug, Clone)]
pub enum CatalogAction {
    /// Replace the catalog.
    Loaded(Arc<Catalog>),
    /// Forget the catalog.
    Clear,
}

/// Owns `catalog`.
pub struct CatalogReducer;

impl SliceReducer for CatalogReducer {
    type State = DashboardState;
    type Slice = CatalogState;
    type Action = CatalogAction;
    const SLICE: &'static str = "catalog";

    fn slice(state: &DashboardState) -> &CatalogState {
        &state.catalog
    }

    fn slice_mut(state: &mut DashboardState) -> &mut CatalogState {
        &mut state.catalog
    }

    fn reduce(_slice: CatalogState, action: &CatalogAction) -> CatalogState {
        match action {
            CatalogAction::Loaded(catalog) => CatalogState {
                catalog: Some(Arc::clone(catalog)),
            },
            CatalogAction::Clear => CatalogState::default(),
        }
    }
}

/// `CATALOG_LOAD` command type.
pub const CATALOG_LOAD: &str = "CATALOG_LOAD";

/// Events of `CATALOG_LOAD`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CatalogEvent {
    /// Load started.
    #[serde(rename = "CATALOG_LOAD_REQUESTED")]
    Requested,
    /// Catalog stored in the slice.
    #[serde(rename = "CATALOG_LOAD_SUCCESS", rename_all = "camelCase")]
    Success {
        /// Number of catalogued attributes.
        attribute_count: usize,
    },
    /// The backend rejected.
    #[serde(rename = "CATALOG_LOAD_FAILED")]
    Failed {
        /// Error text.
        message: String,
    },
    /// The command was cancelled.
    #[serde(rename = "CATALOG_LOAD_CANCEL")]
    Cancelled,
}

/// Loads the catalog through the query cache and stores it in the slice.
pub struct LoadCatalogHandler {
    backend: Arc<dyn AttributeFilterBackend>,
}

impl LoadCatalogHandler {
    /// Handler using `backend`.
    pub fn new(backend: Arc<dyn AttributeFilterBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl CommandHandler<DashboardState> for LoadCatalogHandler {
    const COMMAND_TYPE: &'static str = CATALOG_LOAD;
    type Command = serde_json::Value;

    async fn handle(
        &self,
        cx: HandlerContext<DashboardState>,
        _: serde_json::Value,
    ) -> Result<(), TaskError> {
        cx.emit_typed(&CatalogEvent::Requested)?;
        match cx.query(CatalogQuery::new(Arc::clone(&self.backend))).await {
            Ok(catalog) => {
                let attribute_count = catalog.attributes.len();
                cx.write::<CatalogReducer>(&CatalogAction::Loaded(catalog))?;
                cx.emit_typed(&CatalogEvent::Success { attribute_count })
            }
            Err(TaskError::Cancelled) => cx.emit_typed(&CatalogEvent::Cancelled),
            Err(err) => cx.emit_typed(&CatalogEvent::Failed {
                message: err.to_string(),
            }),
        }
    }
}

/// Resolve an attribute by display form.
///
/// Tries the preloaded catalog slice, then the cached catalog query, then a
/// cached live lookup. A failing catalog query is logged and skipped; a
/// failing live lookup is returned.
pub(crate) async fn resolve_attribute(
    cx: &HandlerContext<DashboardState>,
    backend: &Arc<dyn AttributeFilterBackend>,
    display_form: &str,
) -> Result<AttributeMetadata, TaskError> {
    if let Some(attribute) = cx.read(|s| s.catalog.find(display_form).cloned()) {
        tracing::trace!(display_form, "attribute resolved from preloaded catalog");
        return Ok(attribute);
    }

    match cx.query(CatalogQuery::new(Arc::clone(backend))).await {
        Ok(catalog) => {
            if let Some(attribute) = catalog.find(display_form) {
                tracing::trace!(display_form, "attribute resolved from catalog query");
                return Ok(attribute.clone());
            }
        }
        Err(TaskError::Cancelled) => return Err(TaskError::Cancelled),
        Err(err) => {
            tracing::debug!(
                display_form,
                error = %err,
                "catalog unavailable; falling back to live lookup"
            );
        }
    }

    cx.query(AttributeQuery::new(Arc::clone(backend), display_form))
        .await
}
