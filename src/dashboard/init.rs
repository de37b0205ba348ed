//! Attribute filter configuration and initialization.
//!
//! Initialization resolves the attribute, loads the first elements page and,
//! depending on the filter's setup, a few secondary reads. With hidden
//! elements the attribute is resolved and written before the page request
//! is issued; otherwise every read starts at once. All reads go through the
//! query cache, so concurrent initializations of filters on the same display
//! form share their backend calls.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::DashboardState;
use super::attribute_filter::{
    AttributeFilterAction, AttributeFilterConfig, AttributeFiltersReducer, InitResult, Selection,
    missing_keys,
};
use super::backend::{
    AttributeElement, AttributeFilterBackend, AttributeMetadata, ElementsPage, ElementsRequest,
};
use super::catalog::resolve_attribute;
use super::queries::ElementsQuery;
use crate::error::TaskError;
use crate::handler::{CommandHandler, HandlerContext};
use crate::task::TaskJoin;

/// `ATTRIBUTE_FILTER_CONFIGURE` command type.
pub const ATTRIBUTE_FILTER_CONFIGURE: &str = "ATTRIBUTE_FILTER_CONFIGURE";
/// `ATTRIBUTE_FILTER_INIT` command type.
pub const ATTRIBUTE_FILTER_INIT: &str = "ATTRIBUTE_FILTER_INIT";

/// Events of the configure and init commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum InitEvent {
    /// Filter registered (or reset).
    #[serde(rename = "ATTRIBUTE_FILTER_CONFIGURE_COMPLETED", rename_all = "camelCase")]
    Configured { filter_id: String },
    /// Initialization started.
    #[serde(rename = "ATTRIBUTE_FILTER_INIT_REQUESTED", rename_all = "camelCase")]
    Requested { filter_id: String },
    /// Everything loaded and written.
    #[serde(rename = "ATTRIBUTE_FILTER_INIT_SUCCESS", rename_all = "camelCase")]
    Success {
        filter_id: String,
        elements_count: usize,
        total_count: u64,
    },
    /// A read failed; the first error's text.
    #[serde(rename = "ATTRIBUTE_FILTER_INIT_ERROR", rename_all = "camelCase")]
    Error { filter_id: String, message: String },
    /// The command was cancelled.
    #[serde(rename = "ATTRIBUTE_FILTER_INIT_CANCEL", rename_all = "camelCase")]
    Cancelled { filter_id: String },
}

/// Registers or resets a filter. Payload: an [`AttributeFilterConfig`].
pub struct ConfigureAttributeFilterHandler;

#[async_trait]
impl CommandHandler<DashboardState> for ConfigureAttributeFilterHandler {
    const COMMAND_TYPE: &'static str = ATTRIBUTE_FILTER_CONFIGURE;
    type Command = AttributeFilterConfig;

    async fn handle(
        &self,
        cx: HandlerContext<DashboardState>,
        config: AttributeFilterConfig,
    ) -> Result<(), TaskError> {
        if config.filter_id.is_empty() {
            return Err(TaskError::InvalidArguments("filterId must not be empty".to_owned()));
        }
        let filter_id = config.filter_id.clone();
        cx.write::<AttributeFiltersReducer>(&AttributeFilterAction::Configure(config))?;
        cx.emit_typed(&InitEvent::Configured { filter_id })
    }
}

/// Payload of `ATTRIBUTE_FILTER_INIT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitAttributeFilter {
    /// Filter to initialize.
    pub filter_id: String,
}

/// Loads everything an attribute filter displays.
pub struct InitAttributeFilterHandler {
    backend: Arc<dyn AttributeFilterBackend>,
}

impl InitAttributeFilterHandler {
    /// Handler using `backend`.
    pub fn new(backend: Arc<dyn AttributeFilterBackend>) -> Self {
        Self { backend }
    }
}

/// One child read's result.
enum Loaded {
    Attribute(AttributeMetadata),
    Page(Arc<ElementsPage>),
    TotalWithoutFilters(u64),
    Irrelevant(Vec<String>),
    Selected(Vec<AttributeElement>),
}

#[derive(Default)]
struct Partial {
    attribute: Option<AttributeMetadata>,
    page: Option<Arc<ElementsPage>>,
    total_count_without_filters: Option<u64>,
    irrelevant_selection: Option<Vec<String>>,
    selected_elements: Option<Vec<AttributeElement>>,
}

impl Partial {
    fn absorb(&mut self, loaded: Vec<Loaded>) {
        for item in loaded {
            match item {
                Loaded::Attribute(a) => self.attribute = Some(a),
                Loaded::Page(p) => self.page = Some(p),
                Loaded::TotalWithoutFilters(n) => self.total_count_without_filters = Some(n),
                Loaded::Irrelevant(keys) => self.irrelevant_selection = Some(keys),
                Loaded::Selected(elements) => self.selected_elements = Some(elements),
            }
        }
    }

    fn finish(self) -> Result<InitResult, TaskError> {
        let (Some(attribute), Some(page)) = (self.attribute, self.page) else {
            return Err(TaskError::Internal(
                "initialization finished without attribute or page".to_owned(),
            ));
        };
        Ok(InitResult {
            attribute,
            page,
            total_count_without_filters: self.total_count_without_filters,
            irrelevant_selection: self.irrelevant_selection,
            selected_elements: self.selected_elements,
        })
    }
}

/// What the filter looked like when initialization began.
struct Plan {
    config: AttributeFilterConfig,
    working: Selection,
    committed: Selection,
}

impl InitAttributeFilterHandler {
    async fn load(
        &self,
        cx: &HandlerContext<DashboardState>,
        plan: &Plan,
    ) -> Result<InitResult, TaskError> {
        let config = &plan.config;
        let mut partial = Partial::default();
        let mut joins = Vec::new();

        if config.hidden_elements.is_empty() {
            joins.push(self.attribute_task(cx, config));
        } else {
            // The page request must not go out before the attribute is known.
            let attribute = cx.join_all(vec![self.attribute_task(cx, config)]).await?;
            partial.absorb(attribute);
            if let Some(attribute) = &partial.attribute {
                cx.write::<AttributeFiltersReducer>(&AttributeFilterAction::AttributeLoaded {
                    filter_id: config.filter_id.clone(),
                    attribute: attribute.clone(),
                })?;
            }
        }

        let page_request = ElementsRequest {
            excluded_keys: config.hidden_elements.clone(),
            ..ElementsRequest::page(config.display_form.clone(), 0, config.page_limit)
        }
        .limited_by(&config.limiting);
        joins.push(self.elements_task(cx, "elements-page", page_request, Loaded::Page));

        if !config.limiting.is_empty() {
            let request = ElementsRequest {
                excluded_keys: config.hidden_elements.clone(),
                include_total_count_without_filters: true,
                ..ElementsRequest::page(config.display_form.clone(), 0, 1)
            };
            joins.push(self.elements_task(cx, "total-count-without-filters", request, |page| {
                Loaded::TotalWithoutFilters(page.total_count)
            }));
        }

        if !plan.working.is_empty() && self.backend.capabilities().supports_irrelevant_elements {
            let keys = plan.working.keys.clone();
            let request = ElementsRequest {
                keys: Some(keys.clone()),
                ..ElementsRequest::page(config.display_form.clone(), 0, keys.len() as u64)
            }
            .limited_by(&config.limiting);
            joins.push(self.elements_task(cx, "irrelevant-selection", request, move |page| {
                Loaded::Irrelevant(missing_keys(&keys, &page.elements))
            }));
        }

        if !plan.committed.is_empty() {
            let keys = plan.committed.keys.clone();
            let request = ElementsRequest {
                keys: Some(keys.clone()),
                ..ElementsRequest::page(config.display_form.clone(), 0, keys.len() as u64)
            };
            joins.push(self.elements_task(cx, "selected-elements", request, |page| {
                Loaded::Selected(page.elements.clone())
            }));
        }

        tracing::debug!(
            filter_id = %config.filter_id,
            children = joins.len(),
            "attribute filter reads started"
        );
        partial.absorb(cx.join_all(joins).await?);
        partial.finish()
    }

    fn attribute_task(
        &self,
        cx: &HandlerContext<DashboardState>,
        config: &AttributeFilterConfig,
    ) -> TaskJoin<Loaded> {
        let backend = Arc::clone(&self.backend);
        let display_form = config.display_form.clone();
        cx.spawn("attribute", move |c| async move {
            resolve_attribute(&c, &backend, &display_form)
                .await
                .map(Loaded::Attribute)
        })
    }

    fn elements_task<F>(
        &self,
        cx: &HandlerContext<DashboardState>,
        name: &str,
        request: ElementsRequest,
        into: F,
    ) -> TaskJoin<Loaded>
    where
        F: FnOnce(Arc<ElementsPage>) -> Loaded + Send + 'static,
    {
        let query = ElementsQuery::new(Arc::clone(&self.backend), request);
        cx.spawn(name, move |c| async move { c.query(query).await.map(into) })
    }
}

#[async_trait]
impl CommandHandler<DashboardState> for InitAttributeFilterHandler {
    const COMMAND_TYPE: &'static str = ATTRIBUTE_FILTER_INIT;
    type Command = InitAttributeFilter;

    async fn handle(
        &self,
        cx: HandlerContext<DashboardState>,
        command: InitAttributeFilter,
    ) -> Result<(), TaskError> {
        let filter_id = command.filter_id;
        let plan = cx.read(|s| {
            s.attribute_filters.get(&filter_id).map(|f| Plan {
                config: f.config.clone(),
                working: f.working_selection.clone(),
                committed: f.committed_selection.clone(),
            })
        });
        let Some(plan) = plan else {
            return Err(TaskError::Domain(format!("unknown attribute filter '{filter_id}'")));
        };

        cx.emit_typed(&InitEvent::Requested {
            filter_id: filter_id.clone(),
        })?;

        let outcome = async {
            cx.write::<AttributeFiltersReducer>(&AttributeFilterAction::InitStarted {
                filter_id: filter_id.clone(),
            })?;
            let result = self.load(&cx, &plan).await?;
            let counts = (result.page.elements.len(), result.page.total_count);
            cx.write::<AttributeFiltersReducer>(&AttributeFilterAction::InitSucceeded {
                filter_id: filter_id.clone(),
                result: Box::new(result),
            })?;
            Ok::<_, TaskError>(counts)
        }
        .await;

        let failure = match outcome {
            Ok((elements_count, total_count)) => {
                tracing::debug!(
                    %filter_id,
                    elements_count,
                    total_count,
                    "attribute filter initialized"
                );
                return cx.emit_typed(&InitEvent::Success {
                    filter_id,
                    elements_count,
                    total_count,
                });
            }
            Err(TaskError::Cancelled) => return cx.emit_typed(&InitEvent::Cancelled { filter_id }),
            Err(err) => err,
        };

        let message = failure.to_string();
        tracing::warn!(%filter_id, error = %message, "attribute filter initialization failed");
        match cx.write::<AttributeFiltersReducer>(&AttributeFilterAction::InitFailed {
            filter_id: filter_id.clone(),
            message: message.clone(),
        }) {
            Err(TaskError::Cancelled) => cx.emit_typed(&InitEvent::Cancelled { filter_id }),
            Err(err) => Err(err),
            Ok(()) => cx.emit_typed(&InitEvent::Error { filter_id, message }),
        }
    }
}
