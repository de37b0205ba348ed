//! Attribute filter slice: configuration, loaded data and selections.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::DashboardState;
use super::backend::{AttributeElement, AttributeMetadata, ElementsPage, LimitingCriteria};
use crate::reducer::SliceReducer;
use crate::selector::Selector;

/// Page size used when a configuration does not set one.
pub const DEFAULT_PAGE_LIMIT: u64 = 500;

fn default_page_limit() -> u64 {
    DEFAULT_PAGE_LIMIT
}

/// Selected element keys.
///
/// A negative selection lists the excluded keys, so an empty negative
/// selection means "everything".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    /// Element keys.
    #[serde(default)]
    pub keys: Vec<String>,
    /// Whether `keys` are excluded rather than included.
    #[serde(default)]
    pub negative: bool,
}

impl Default for Selection {
    fn default() -> Self {
        Self::all()
    }
}

impl Selection {
    /// Everything selected.
    pub fn all() -> Self {
        Self {
            keys: Vec::new(),
            negative: true,
        }
    }

    /// Exactly `keys` selected.
    pub fn only<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            negative: false,
        }
    }

    /// Same keys, opposite polarity.
    pub fn inverted(&self) -> Self {
        Self {
            keys: self.keys.clone(),
            negative: !self.negative,
        }
    }

    /// `true` when no keys are listed.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// How an attribute filter is set up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeFilterConfig {
    /// Filter identifier, unique in the slice.
    pub filter_id: String,
    /// Display form whose elements the filter offers.
    pub display_form: String,
    /// Keys never offered.
    #[serde(default)]
    pub hidden_elements: Vec<String>,
    /// Criteria narrowing the offered elements.
    #[serde(default)]
    pub limiting: LimitingCriteria,
    /// Initial (committed and working) selection.
    #[serde(default)]
    pub selection: Selection,
    /// Elements per page.
    #[serde(default = "default_page_limit")]
    pub page_limit: u64,
}

impl AttributeFilterConfig {
    /// Configuration with defaults for everything but the identity.
    pub fn new(filter_id: impl Into<String>, display_form: impl Into<String>) -> Self {
        Self {
            filter_id: filter_id.into(),
            display_form: display_form.into(),
            hidden_elements: Vec::new(),
            limiting: LimitingCriteria::default(),
            selection: Selection::all(),
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

/// Progress of the last initialization.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "error")]
pub enum InitStatus {
    /// Never initialized.
    #[default]
    Idle,
    /// Initialization running, or cancelled before it finished.
    Loading,
    /// Initialization succeeded.
    Loaded,
    /// Initialization failed with the given message.
    Failed(String),
}

/// Everything an initialization produces, applied in one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitResult {
    /// Resolved attribute.
    pub attribute: AttributeMetadata,
    /// First page of offered elements.
    pub page: Arc<ElementsPage>,
    /// Total ignoring limiting criteria, when criteria are set.
    pub total_count_without_filters: Option<u64>,
    /// Working-selection keys that no longer match the criteria, when the
    /// backend supports the check.
    pub irrelevant_selection: Option<Vec<String>>,
    /// Elements of the committed selection.
    pub selected_elements: Option<Vec<AttributeElement>>,
}

/// State of one attribute filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeFilter {
    /// Setup.
    pub config: AttributeFilterConfig,
    /// Resolved attribute.
    pub attribute: Option<AttributeMetadata>,
    /// Loaded elements.
    pub elements: Vec<AttributeElement>,
    /// Elements matching the criteria, across pages.
    pub total_count: Option<u64>,
    /// Elements ignoring the criteria.
    pub total_count_without_filters: Option<u64>,
    /// Elements of the committed selection.
    pub selected_elements: Vec<AttributeElement>,
    /// Working-selection keys that no longer match the criteria.
    pub irrelevant_selection: Vec<String>,
    /// Selection being edited.
    pub working_selection: Selection,
    /// Selection in effect.
    pub committed_selection: Selection,
    /// Last initialization.
    pub init_status: InitStatus,
}

impl AttributeFilter {
    fn configured(config: AttributeFilterConfig) -> Self {
        let selection = config.selection.clone();
        Self {
            config,
            attribute: None,
            elements: Vec::new(),
            total_count: None,
            total_count_without_filters: None,
            selected_elements: Vec::new(),
            irrelevant_selection: Vec::new(),
            working_selection: selection.clone(),
            committed_selection: selection,
            init_status: InitStatus::Idle,
        }
    }
}

/// Attribute filters slice, keyed by filter id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttributeFiltersState {
    /// Filters by id.
    pub filters: BTreeMap<String, AttributeFilter>,
}

impl AttributeFiltersState {
    /// Filter by id.
    pub fn get(&self, filter_id: &str) -> Option<&AttributeFilter> {
        self.filters.get(filter_id)
    }
}

/// Mutations of [`AttributeFiltersState`]. Actions for unknown ids are no-ops.
#[derive(Debug, Clone)]
pub enum AttributeFilterAction {
    /// Register or replace a filter.
    Configure(AttributeFilterConfig),
    /// Initialization began.
    InitStarted { filter_id: String },
    /// Attribute resolved ahead of the elements page.
    AttributeLoaded {
        filter_id: String,
        attribute: AttributeMetadata,
    },
    /// Initialization completed.
    InitSucceeded {
        filter_id: String,
        result: Box<InitResult>,
    },
    /// Initialization failed.
    InitFailed { filter_id: String, message: String },
    /// Replace the working selection.
    ChangeSelection {
        filter_id: String,
        selection: Selection,
    },
    /// Working selection becomes committed.
    CommitSelection { filter_id: String },
    /// Committed selection becomes working.
    RevertSelection { filter_id: String },
    /// Flip the working selection's polarity.
    InvertSelection { filter_id: String },
    /// Select everything.
    ClearSelection { filter_id: String },
}

impl AttributeFilterAction {
    fn filter_id(&self) -> &str {
        match self {
            Self::Configure(config) => &config.filter_id,
            Self::InitStarted { filter_id }
            | Self::AttributeLoaded { filter_id, .. }
            | Self::InitSucceeded { filter_id, .. }
            | Self::InitFailed { filter_id, .. }
            | Self::ChangeSelection { filter_id, .. }
            | Self::CommitSelection { filter_id }
            | Self::RevertSelection { filter_id }
            | Self::InvertSelection { filter_id }
            | Self::ClearSelection { filter_id } => filter_id,
        }
    }
}

/// Owns `attribute_filters`.
pub struct AttributeFiltersReducer;

impl SliceReducer for AttributeFiltersReducer {
    type State = DashboardState;
    type Slice = AttributeFiltersState;
    type Action = AttributeFilterAction;
    const SLICE: &'static str = "attribute_filters";

    fn slice(state: &DashboardState) -> &AttributeFiltersState {
        &state.attribute_filters
    }

    fn slice_mut(state: &mut DashboardState) -> &mut AttributeFiltersState {
        &mut state.attribute_filters
    }

    fn reduce(
        mut slice: AttributeFiltersState,
        action: &AttributeFilterAction,
    ) -> AttributeFiltersState {
        if let AttributeFilterAction::Configure(config) = action {
            slice
                .filters
                .insert(config.filter_id.clone(), AttributeFilter::configured(config.clone()));
            return slice;
        }
        let Some(filter) = slice.filters.get_mut(action.filter_id()) else {
            return slice;
        };
        match action {
            AttributeFilterAction::Configure(_) => {}
            AttributeFilterAction::InitStarted { .. } => filter.init_status = InitStatus::Loading,
            AttributeFilterAction::AttributeLoaded { attribute, .. } => {
                filter.attribute = Some(attribute.clone());
            }
            AttributeFilterAction::InitSucceeded { result, .. } => {
                filter.attribute = Some(result.attribute.clone());
                filter.elements = result.page.elements.clone();
                filter.total_count = Some(result.page.total_count);
                filter.total_count_without_filters = result.total_count_without_filters;
                filter.irrelevant_selection =
                    result.irrelevant_selection.clone().unwrap_or_default();
                filter.selected_elements = result.selected_elements.clone().unwrap_or_default();
                filter.init_status = InitStatus::Loaded;
            }
            AttributeFilterAction::InitFailed { message, .. } => {
                filter.init_status = InitStatus::Failed(message.clone());
            }
            AttributeFilterAction::ChangeSelection { selection, .. } => {
                filter.working_selection = selection.clone();
            }
            AttributeFilterAction::CommitSelection { .. } => {
                filter.committed_selection = filter.working_selection.clone();
            }
            AttributeFilterAction::RevertSelection { .. } => {
                filter.working_selection = filter.committed_selection.clone();
            }
            AttributeFilterAction::InvertSelection { .. } => {
                filter.working_selection = filter.working_selection.inverted();
            }
            AttributeFilterAction::ClearSelection { .. } => {
                filter.working_selection = Selection::all();
            }
        }
        slice
    }
}

/// Keys of `candidates` missing from `relevant`, in candidate order.
pub(crate) fn missing_keys(candidates: &[String], relevant: &[AttributeElement]) -> Vec<String> {
    let found: HashSet<&str> = relevant.iter().map(|e| e.key.as_str()).collect();
    candidates
        .iter()
        .filter(|k| !found.contains(k.as_str()))
        .cloned()
        .collect()
}

// Selectors. Each call builds a fresh selector with its own memo; hold on
// to it for change detection.

/// The whole filter.
pub fn select_attribute_filter(
    filter_id: &str,
) -> Selector<DashboardState, Option<AttributeFilter>> {
    let id = filter_id.to_owned();
    Selector::new("attribute_filter", move |s: &DashboardState| {
        s.attribute_filters.get(&id).cloned()
    })
}

/// Working selection.
pub fn select_working_selection(filter_id: &str) -> Selector<DashboardState, Option<Selection>> {
    select_attribute_filter(filter_id).map("working_selection", |f| {
        f.as_ref().map(|f| f.working_selection.clone())
    })
}

/// Committed selection.
pub fn select_committed_selection(filter_id: &str) -> Selector<DashboardState, Option<Selection>> {
    select_attribute_filter(filter_id).map("committed_selection", |f| {
        f.as_ref().map(|f| f.committed_selection.clone())
    })
}

/// Whether the working selection lists no keys. `true` for unknown filters.
pub fn select_is_working_selection_empty(filter_id: &str) -> Selector<DashboardState, bool> {
    select_attribute_filter(filter_id).map("is_working_selection_empty", |f| {
        f.as_ref().is_none_or(|f| f.working_selection.is_empty())
    })
}

/// Whether the working selection differs from the committed one.
pub fn select_is_working_selection_changed(filter_id: &str) -> Selector<DashboardState, bool> {
    select_attribute_filter(filter_id).map("is_working_selection_changed", |f| {
        f.as_ref()
            .is_some_and(|f| f.working_selection != f.committed_selection)
    })
}

/// Loaded elements.
pub fn select_elements(filter_id: &str) -> Selector<DashboardState, Vec<AttributeElement>> {
    select_attribute_filter(filter_id).map("elements", |f| {
        f.as_ref().map(|f| f.elements.clone()).unwrap_or_default()
    })
}

/// Total matching elements.
pub fn select_total_count(filter_id: &str) -> Selector<DashboardState, Option<u64>> {
    select_attribute_filter(filter_id).map("total_count", |f| {
        f.as_ref().and_then(|f| f.total_count)
    })
}

/// Total elements ignoring limiting criteria.
pub fn select_total_count_without_filters(
    filter_id: &str,
) -> Selector<DashboardState, Option<u64>> {
    select_attribute_filter(filter_id).map("total_count_without_filters", |f| {
        f.as_ref().and_then(|f| f.total_count_without_filters)
    })
}

/// Working-selection keys that no longer match the criteria.
pub fn select_irrelevant_selection(filter_id: &str) -> Selector<DashboardState, Vec<String>> {
    select_attribute_filter(filter_id).map("irrelevant_selection", |f| {
        f.as_ref()
            .map(|f| f.irrelevant_selection.clone())
            .unwrap_or_default()
    })
}

/// Initialization status. `None` for unknown filters.
pub fn select_init_status(filter_id: &str) -> Selector<DashboardState, Option<InitStatus>> {
    select_attribute_filter(filter_id).map("init_status", |f| {
        f.as_ref().map(|f| f.init_status.clone())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured(selection: Selection) -> AttributeFiltersState {
        let mut config = AttributeFilterConfig::new("f1", "label.region");
        config.selection = selection;
        AttributeFiltersReducer::reduce(
            AttributeFiltersState::default(),
            &AttributeFilterAction::Configure(config),
        )
    }

    fn id() -> String {
        "f1".to_owned()
    }

    #[test]
    fn configure_seeds_both_selections() {
        let slice = configured(Selection::only(["east"]));
        let filter = slice.get("f1").unwrap();
        assert_eq!(filter.working_selection, Selection::only(["east"]));
        assert_eq!(filter.committed_selection, Selection::only(["east"]));
        assert_eq!(filter.init_status, InitStatus::Idle);
    }

    #[test]
    fn change_commit_revert_cycle() {
        let slice = configured(Selection::all());
        let slice = AttributeFiltersReducer::reduce(
            slice,
            &AttributeFilterAction::ChangeSelection {
                filter_id: id(),
                selection: Selection::only(["west"]),
            },
        );
        let filter = slice.get("f1").unwrap();
        assert_eq!(filter.committed_selection, Selection::all());

        let commit = AttributeFilterAction::CommitSelection { filter_id: id() };
        let committed = AttributeFiltersReducer::reduce(slice.clone(), &commit);
        assert_eq!(
            committed.get("f1").unwrap().committed_selection,
            Selection::only(["west"])
        );

        let revert = AttributeFilterAction::RevertSelection { filter_id: id() };
        let reverted = AttributeFiltersReducer::reduce(slice, &revert);
        assert_eq!(reverted.get("f1").unwrap().working_selection, Selection::all());
    }

    #[test]
    fn invert_and_clear() {
        let slice = configured(Selection::only(["a", "b"]));
        let invert = AttributeFilterAction::InvertSelection { filter_id: id() };
        let inverted = AttributeFiltersReducer::reduce(slice, &invert);
        let working = &inverted.get("f1").unwrap().working_selection;
        assert!(working.negative);
        assert_eq!(working.keys, vec!["a", "b"]);

        let clear = AttributeFilterAction::ClearSelection { filter_id: id() };
        let cleared = AttributeFiltersReducer::reduce(inverted, &clear);
        assert_eq!(cleared.get("f1").unwrap().working_selection, Selection::all());
    }

    #[test]
    fn unknown_filter_actions_are_no_ops() {
        let slice = configured(Selection::all());
        let after = AttributeFiltersReducer::reduce(
            slice.clone(),
            &AttributeFilterAction::CommitSelection {
                filter_id: "missing".into(),
            },
        );
        assert_eq!(after, slice);
    }

    #[test]
    fn reducer_is_deterministic() {
        let slice = configured(Selection::only(["a"]));
        let action = AttributeFilterAction::InitFailed {
            filter_id: id(),
            message: "down".into(),
        };
        assert_eq!(
            AttributeFiltersReducer::reduce(slice.clone(), &action),
            AttributeFiltersReducer::reduce(slice, &action)
        );
    }

    #[test]
    fn missing_keys_keeps_candidate_order() {
        let relevant = vec![AttributeElement::new("b", "B")];
        let keys = vec!["c".to_owned(), "b".to_owned(), "a".to_owned()];
        assert_eq!(missing_keys(&keys, &relevant), vec!["c", "a"]);
    }

    #[test]
    fn selectors_derive_from_the_slice() {
        let state = Arc::new(DashboardState {
            attribute_filters: configured(Selection::only(["a"])),
            ..DashboardState::default()
        });
        assert_eq!(
            *select_working_selection("f1").select(&state),
            Some(Selection::only(["a"]))
        );
        assert!(!*select_is_working_selection_empty("f1").select(&state));
        assert!(!*select_is_working_selection_changed("f1").select(&state));
        assert!(*select_is_working_selection_empty("missing").select(&state));
        assert_eq!(*select_init_status("f1").select(&state), Some(InitStatus::Idle));
        assert!(select_elements("f1").select(&state).is_empty());
    }

    #[test]
    fn config_defaults_from_json() {
        let json = serde_json::json!({ "filterId": "f1", "displayForm": "label.region" });
        let config: AttributeFilterConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config, AttributeFilterConfig::new("f1", "label.region"));
    }
}
