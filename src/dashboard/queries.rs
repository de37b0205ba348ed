//! Cached backend reads.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::backend::{
    AttributeFilterBackend, AttributeMetadata, Catalog, ElementsPage, ElementsRequest,
};
use crate::error::TaskError;
use crate::query::{Query, QueryDescriptor};
use crate::task::TaskContext;

/// Query type of [`CatalogQuery`].
pub const CATALOG_QUERY: &str = "catalog";
/// Query type of [`AttributeQuery`].
pub const ATTRIBUTE_QUERY: &str = "attribute";
/// Query type of [`ElementsQuery`].
pub const ELEMENTS_QUERY: &str = "elements";

/// The full attribute catalog.
pub struct CatalogQuery {
    backend: Arc<dyn AttributeFilterBackend>,
}

impl CatalogQuery {
    /// Catalog query against `backend`.
    pub fn new(backend: Arc<dyn AttributeFilterBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Query for CatalogQuery {
    type Output = Arc<Catalog>;

    fn descriptor(&self) -> QueryDescriptor {
        QueryDescriptor::new(CATALOG_QUERY)
    }

    async fn fetch(&self, cx: &TaskContext) -> Result<Arc<Catalog>, TaskError> {
        cx.call(self.backend.load_catalog()).await.map(Arc::new)
    }
}

/// One attribute, resolved live by display form.
pub struct AttributeQuery {
    backend: Arc<dyn AttributeFilterBackend>,
    display_form: String,
}

impl AttributeQuery {
    /// Attribute query for `display_form`.
    pub fn new(backend: Arc<dyn AttributeFilterBackend>, display_form: impl Into<String>) -> Self {
        Self {
            backend,
            display_form: display_form.into(),
        }
    }
}

#[async_trait]
impl Query for AttributeQuery {
    type Output = AttributeMetadata;

    fn descriptor(&self) -> QueryDescriptor {
        QueryDescriptor::new(ATTRIBUTE_QUERY)
            .with_part(json!(self.display_form))
    }

    async fn fetch(&self, cx: &TaskContext) -> Result<AttributeMetadata, TaskError> {
        cx.call(self.backend.load_attribute(&self.display_form))
            .await
    }
}

/// A page of elements. The whole request is part of the key.
pub struct ElementsQuery {
    backend: Arc<dyn AttributeFilterBackend>,
    request: ElementsRequest,
}

impl ElementsQuery {
    /// Elements query for `request`.
    pub fn new(backend: Arc<dyn AttributeFilterBackend>, request: ElementsRequest) -> Self {
        Self { backend, request }
    }
}

impl fmt::Debug for ElementsQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementsQuery")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Query for ElementsQuery {
    type Output = Arc<ElementsPage>;

    fn descriptor(&self) -> QueryDescriptor {
        QueryDescriptor::new(ELEMENTS_QUERY)
            .with_part(json!(self.request.display_form))
            .with_part(serde_json::to_value(&self.request).unwrap_or_default())
    }

    async fn fetch(&self, cx: &TaskContext) -> Result<Arc<ElementsPage>, TaskError> {
        cx.call(self.backend.load_elements(&self.request))
            .await
            .map(Arc::new)
    }
}

/// Cache-key predicate matching every query about `display_form`.
pub fn keys_for_display_form(display_form: &str) -> impl Fn(&str) -> bool + use<> {
    let attribute = QueryDescriptor::new(ATTRIBUTE_QUERY)
        .with_part(json!(display_form))
        .cache_key();
    let elements = QueryDescriptor::new(ELEMENTS_QUERY)
        .with_part(json!(display_form))
        .cache_key()
        + ":";
    move |key| key == attribute || key.starts_with(&elements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollaboratorError;
    use super::super::backend::BackendCapabilities;

    struct Unused;

    #[async_trait]
    impl AttributeFilterBackend for Unused {
        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities::default()
        }
        async fn load_catalog(&self) -> Result<Catalog, CollaboratorError> {
            Err(CollaboratorError::Unavailable("unused".into()))
        }
        async fn load_attribute(&self, _: &str) -> Result<AttributeMetadata, CollaboratorError> {
            Err(CollaboratorError::Unavailable("unused".into()))
        }
        async fn load_elements(
            &self,
            _: &ElementsRequest,
        ) -> Result<ElementsPage, CollaboratorError> {
            Err(CollaboratorError::Unavailable("unused".into()))
        }
    }

    fn backend() -> Arc<dyn AttributeFilterBackend> {
        Arc::new(Unused)
    }

    #[test]
    fn attribute_key_is_type_and_display_form() {
        let key = AttributeQuery::new(backend(), "label.region")
            .descriptor()
            .cache_key();
        assert_eq!(key, "attribute:label.region");
    }

    #[test]
    fn elements_key_depends_on_every_option() {
        let base = ElementsRequest::page("label.region", 0, 50);
        let a = ElementsQuery::new(backend(), base.clone())
            .descriptor()
            .cache_key();
        let b = ElementsQuery::new(backend(), base.clone())
            .descriptor()
            .cache_key();
        assert_eq!(a, b);

        let mut searched = base;
        searched.search = Some("east".into());
        let c = ElementsQuery::new(backend(), searched)
            .descriptor()
            .cache_key();
        assert_ne!(a, c);
        assert!(a.starts_with("elements:label.region:{"));
    }

    #[test]
    fn display_form_predicate_matches_its_queries_only() {
        let matches = keys_for_display_form("label.region");
        let elements = ElementsQuery::new(backend(), ElementsRequest::page("label.region", 0, 5))
            .descriptor()
            .cache_key();
        assert!(matches("attribute:label.region"));
        assert!(matches(&elements));
        assert!(!matches("attribute:label.regional"));
        assert!(!matches(CATALOG_QUERY));
    }

    #[test]
    fn display_form_with_separator_does_not_match_a_shorter_one() {
        let matches = keys_for_display_form("label");
        let nested = AttributeQuery::new(backend(), "label:region")
            .descriptor()
            .cache_key();
        assert_eq!(nested, r"attribute:label\:region");
        assert!(!matches(&nested));
        assert!(keys_for_display_form("label:region")(&nested));
    }
}
