//! Backend access layer as seen by the dashboard handlers.
//!
//! The backend is an external collaborator: every method is an opaque async
//! call that either returns data or rejects with a [`CollaboratorError`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;

/// Attribute metadata, addressed by one of its display forms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeMetadata {
    /// Display form identifier the attribute was resolved by.
    pub display_form: String,
    /// Attribute identifier.
    pub attribute: String,
    /// Human-readable title.
    pub title: String,
}

/// One attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeElement {
    /// Stable element key.
    pub key: String,
    /// Display title.
    pub title: String,
}

impl AttributeElement {
    /// Element with the given key and title.
    pub fn new(key: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
        }
    }
}

/// A page of elements plus the total matching the request's criteria.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementsPage {
    /// Elements on this page.
    pub elements: Vec<AttributeElement>,
    /// Elements matching the request, across all pages.
    pub total_count: u64,
    /// Offset the page starts at.
    pub offset: u64,
    /// Requested page size.
    pub limit: u64,
}

/// Attributes available to the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Catalog {
    /// Every catalog attribute, one entry per display form.
    pub attributes: Vec<AttributeMetadata>,
}

impl Catalog {
    /// Attribute addressed by `display_form`, if catalogued.
    pub fn find(&self, display_form: &str) -> Option<&AttributeMetadata> {
        self.attributes
            .iter()
            .find(|a| a.display_form == display_form)
    }
}

/// Optional backend features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendCapabilities {
    /// The backend can tell which selected elements are irrelevant under
    /// the current limiting criteria.
    pub supports_irrelevant_elements: bool,
}

/// Another attribute filter narrowing the elements of this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitingAttributeFilter {
    /// Display form of the parent filter.
    pub display_form: String,
    /// Parent filter's selected keys.
    pub keys: Vec<String>,
    /// Whether `keys` are excluded rather than included.
    #[serde(default)]
    pub negative: bool,
}

/// Relative date range narrowing the elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitingDateFilter {
    /// Date dataset identifier.
    pub data_set: String,
    /// Granularity, e.g. `"GDC.time.month"`.
    pub granularity: String,
    /// Range start, relative to now.
    pub from: i32,
    /// Range end, relative to now.
    pub to: i32,
}

/// Criteria that narrow which elements a filter offers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitingCriteria {
    /// Parent attribute filters.
    pub attribute_filters: Vec<LimitingAttributeFilter>,
    /// Measure identifiers; only elements with data for them are offered.
    pub measures: Vec<String>,
    /// Date ranges.
    pub date_filters: Vec<LimitingDateFilter>,
    /// Validation item identifiers.
    pub validation_items: Vec<String>,
}

impl LimitingCriteria {
    /// `true` when no criterion is set.
    pub fn is_empty(&self) -> bool {
        self.attribute_filters.is_empty()
            && self.measures.is_empty()
            && self.date_filters.is_empty()
            && self.validation_items.is_empty()
    }
}

/// Element loading options for [`AttributeFilterBackend::load_elements`].
///
/// Serializes deterministically, so the request itself is the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementsRequest {
    /// Display form whose elements are loaded.
    pub display_form: String,
    /// Page offset.
    pub offset: u64,
    /// Page size.
    pub limit: u64,
    /// Title substring search.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    /// Load only these keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
    /// Never return these keys.
    #[serde(default)]
    pub excluded_keys: Vec<String>,
    /// Parent attribute filters.
    #[serde(default)]
    pub limiting_attribute_filters: Vec<LimitingAttributeFilter>,
    /// Measures the elements must have data for.
    #[serde(default)]
    pub limiting_measures: Vec<String>,
    /// Date ranges.
    #[serde(default)]
    pub limiting_date_filters: Vec<LimitingDateFilter>,
    /// Validation items.
    #[serde(default)]
    pub limiting_validation_items: Vec<String>,
    /// Report the total ignoring every limiting criterion.
    #[serde(default)]
    pub include_total_count_without_filters: bool,
}

impl ElementsRequest {
    /// First page of `display_form` with no criteria.
    pub fn page(display_form: impl Into<String>, offset: u64, limit: u64) -> Self {
        Self {
            display_form: display_form.into(),
            offset,
            limit,
            ..Self::default()
        }
    }

    /// Apply `criteria` as the request's limiting criteria.
    pub fn limited_by(mut self, criteria: &LimitingCriteria) -> Self {
        self.limiting_attribute_filters = criteria.attribute_filters.clone();
        self.limiting_measures = criteria.measures.clone();
        self.limiting_date_filters = criteria.date_filters.clone();
        self.limiting_validation_items = criteria.validation_items.clone();
        self
    }
}

/// Opaque async access to attribute data.
#[async_trait]
pub trait AttributeFilterBackend: Send + Sync + 'static {
    /// Optional feature flags. Synchronous; capabilities are static.
    fn capabilities(&self) -> BackendCapabilities;

    /// Load the attribute catalog.
    async fn load_catalog(&self) -> Result<Catalog, CollaboratorError>;

    /// Resolve one attribute by display form.
    async fn load_attribute(
        &self,
        display_form: &str,
    ) -> Result<AttributeMetadata, CollaboratorError>;

    /// Load a page of elements.
    async fn load_elements(
        &self,
        request: &ElementsRequest,
    ) -> Result<ElementsPage, CollaboratorError>;
}
