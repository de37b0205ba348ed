//! Dashboard filter context: the ordered list of attribute filters.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::DashboardState;
use super::attribute_filter::Selection;
use crate::error::TaskError;
use crate::handler::{CommandHandler, HandlerContext};
use crate::reducer::SliceReducer;
use crate::selector::Selector;

/// `FILTER_CONTEXT_ADD_ATTRIBUTE_FILTER` command type.
pub const FILTER_CONTEXT_ADD_ATTRIBUTE_FILTER: &str = "FILTER_CONTEXT_ADD_ATTRIBUTE_FILTER";
/// `FILTER_CONTEXT_REMOVE_ATTRIBUTE_FILTERS` command type.
pub const FILTER_CONTEXT_REMOVE_ATTRIBUTE_FILTERS: &str = "FILTER_CONTEXT_REMOVE_ATTRIBUTE_FILTERS";
/// `FILTER_CONTEXT_MOVE_ATTRIBUTE_FILTER` command type.
pub const FILTER_CONTEXT_MOVE_ATTRIBUTE_FILTER: &str = "FILTER_CONTEXT_MOVE_ATTRIBUTE_FILTER";
/// `FILTER_CONTEXT_CHANGE_ATTRIBUTE_FILTER_SELECTION` command type.
pub const FILTER_CONTEXT_CHANGE_ATTRIBUTE_FILTER_SELECTION: &str =
    "FILTER_CONTEXT_CHANGE_ATTRIBUTE_FILTER_SELECTION";

/// One attribute filter placed on the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterContextItem {
    /// Identifier unique within the filter context.
    pub local_id: String,
    /// Display form the filter is on. Unique within the filter context.
    pub display_form: String,
    /// Optional custom title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Selection in effect.
    pub selection: Selection,
}

/// Filter context slice.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterContextState {
    /// Filters in display order.
    pub items: Vec<FilterContextItem>,
}

impl FilterContextState {
    /// Position of the filter with `local_id`.
    pub fn position(&self, local_id: &str) -> Option<usize> {
        self.items.iter().position(|i| i.local_id == local_id)
    }

    /// Filter with `local_id`.
    pub fn get(&self, local_id: &str) -> Option<&FilterContextItem> {
        self.items.iter().find(|i| i.local_id == local_id)
    }
}

/// Mutations of [`FilterContextState`]. Indexes are already validated.
#[derive(Debug, Clone)]
pub enum FilterContextAction {
    /// Insert at `index`, or append when `None`.
    Add {
        item: FilterContextItem,
        index: Option<usize>,
    },
    /// Drop every listed filter.
    Remove { local_ids: Vec<String> },
    /// Move to `index`, or to the end when `None`.
    Move {
        local_id: String,
        index: Option<usize>,
    },
    /// Replace a filter's selection.
    ChangeSelection {
        local_id: String,
        selection: Selection,
    },
}

/// Owns `filter_context`.
pub struct FilterContextReducer;

impl SliceReducer for FilterContextReducer {
    type State = DashboardState;
    type Slice = FilterContextState;
    type Action = FilterContextAction;
    const SLICE: &'static str = "filter_context";

    fn slice(state: &DashboardState) -> &FilterContextState {
        &state.filter_context
    }

    fn slice_mut(state: &mut DashboardState) -> &mut FilterContextState {
        &mut state.filter_context
    }

    fn reduce(mut slice: FilterContextState, action: &FilterContextAction) -> FilterContextState {
        match action {
            FilterContextAction::Add { item, index } => {
                let at = index.unwrap_or(slice.items.len()).min(slice.items.len());
                slice.items.insert(at, item.clone());
            }
            FilterContextAction::Remove { local_ids } => {
                slice.items.retain(|i| !local_ids.contains(&i.local_id));
            }
            FilterContextAction::Move { local_id, index } => {
                if let Some(from) = slice.position(local_id) {
                    let item = slice.items.remove(from);
                    let to = index.unwrap_or(slice.items.len()).min(slice.items.len());
                    slice.items.insert(to, item);
                }
            }
            FilterContextAction::ChangeSelection { local_id, selection } => {
                if let Some(item) = slice.items.iter_mut().find(|i| &i.local_id == local_id) {
                    item.selection = selection.clone();
                }
            }
        }
        slice
    }
}

/// Events of the filter context commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FilterContextEvent {
    /// A filter was inserted at `index`.
    #[serde(rename = "FILTER_CONTEXT_ATTRIBUTE_FILTER_ADDED", rename_all = "camelCase")]
    AttributeFilterAdded { filter: FilterContextItem, index: usize },
    /// The listed filters were removed.
    #[serde(rename = "FILTER_CONTEXT_ATTRIBUTE_FILTERS_REMOVED", rename_all = "camelCase")]
    AttributeFiltersRemoved { removed: Vec<FilterContextItem> },
    /// A filter changed position.
    #[serde(rename = "FILTER_CONTEXT_ATTRIBUTE_FILTER_MOVED", rename_all = "camelCase")]
    AttributeFilterMoved {
        local_id: String,
        from_index: usize,
        to_index: usize,
    },
    /// A filter's selection was replaced.
    #[serde(rename = "FILTER_CONTEXT_ATTRIBUTE_FILTER_SELECTION_UPDATED", rename_all = "camelCase")]
    AttributeFilterSelectionUpdated { local_id: String, selection: Selection },
    /// Terminal event after every successful change.
    #[serde(rename = "FILTER_CONTEXT_CHANGED", rename_all = "camelCase")]
    Changed { items: Vec<FilterContextItem> },
    /// Terminal event when a command targets filters that do not exist.
    #[serde(rename = "FILTER_CONTEXT_CHANGE_FAILED", rename_all = "camelCase")]
    ChangeFailed { missing_local_ids: Vec<String> },
}

/// Resolve a signed index: `-1` means "at the end", otherwise `0..=max`.
fn resolve_index(index: i64, max: usize) -> Result<Option<usize>, TaskError> {
    if index == -1 {
        return Ok(None);
    }
    match usize::try_from(index) {
        Ok(i) if i <= max => Ok(Some(i)),
        _ => Err(TaskError::InvalidArguments(format!(
            "index {index} out of range; expected -1 or 0..={max}"
        ))),
    }
}

fn emit_changed(cx: &HandlerContext<DashboardState>) -> Result<(), TaskError> {
    let items = cx.read(|s| s.filter_context.items.clone());
    cx.emit_typed(&FilterContextEvent::Changed { items })
}

fn fail_missing(
    cx: &HandlerContext<DashboardState>,
    missing_local_ids: Vec<String>,
) -> Result<(), TaskError> {
    tracing::debug!(?missing_local_ids, "filter context change targets unknown filters");
    cx.emit_typed(&FilterContextEvent::ChangeFailed { missing_local_ids })
}

/// Payload of `FILTER_CONTEXT_ADD_ATTRIBUTE_FILTER`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddAttributeFilter {
    /// Display form to filter on.
    pub display_form: String,
    /// Insert position; `-1` appends.
    pub index: i64,
    /// Identifier to use; generated when absent.
    #[serde(default)]
    pub local_id: Option<String>,
    /// Initial selection; everything when absent.
    #[serde(default)]
    pub initial_selection: Option<Selection>,
    /// Optional custom title.
    #[serde(default)]
    pub title: Option<String>,
}

/// Adds a filter at a position.
pub struct AddAttributeFilterHandler;

#[async_trait]
impl CommandHandler<DashboardState> for AddAttributeFilterHandler {
    const COMMAND_TYPE: &'static str = FILTER_CONTEXT_ADD_ATTRIBUTE_FILTER;
    type Command = AddAttributeFilter;

    async fn handle(
        &self,
        cx: HandlerContext<DashboardState>,
        command: AddAttributeFilter,
    ) -> Result<(), TaskError> {
        let (len, duplicate) = cx.read(|s| {
            let items = &s.filter_context.items;
            (
                items.len(),
                items.iter().any(|i| i.display_form == command.display_form),
            )
        });
        if duplicate {
            return Err(TaskError::InvalidArguments(format!(
                "filter on display form '{}' already exists",
                command.display_form
            )));
        }
        let index = resolve_index(command.index, len)?;

        // A selection listing no keys cannot be positive.
        let selection = match command.initial_selection {
            Some(s) if !s.is_empty() => s,
            _ => Selection::all(),
        };
        let local_id = command
            .local_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        if cx.read(|s| s.filter_context.get(&local_id).is_some()) {
            return Err(TaskError::InvalidArguments(format!(
                "local id '{local_id}' already in use"
            )));
        }
        let item = FilterContextItem {
            local_id,
            display_form: command.display_form,
            title: command.title,
            selection,
        };

        cx.write::<FilterContextReducer>(&FilterContextAction::Add {
            item: item.clone(),
            index,
        })?;
        cx.emit_typed(&FilterContextEvent::AttributeFilterAdded {
            filter: item,
            index: index.unwrap_or(len),
        })?;
        emit_changed(&cx)
    }
}

/// Payload of `FILTER_CONTEXT_REMOVE_ATTRIBUTE_FILTERS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveAttributeFilters {
    /// Filters to remove.
    pub filter_local_ids: Vec<String>,
}

/// Removes filters. Nothing is removed if any id is unknown.
pub struct RemoveAttributeFiltersHandler;

#[async_trait]
impl CommandHandler<DashboardState> for RemoveAttributeFiltersHandler {
    const COMMAND_TYPE: &'static str = FILTER_CONTEXT_REMOVE_ATTRIBUTE_FILTERS;
    type Command = RemoveAttributeFilters;

    async fn handle(
        &self,
        cx: HandlerContext<DashboardState>,
        command: RemoveAttributeFilters,
    ) -> Result<(), TaskError> {
        let (removed, missing): (Vec<_>, Vec<_>) = cx.read(|s| {
            let mut removed = Vec::new();
            let mut missing = Vec::new();
            for id in &command.filter_local_ids {
                match s.filter_context.get(id) {
                    Some(item) => removed.push(item.clone()),
                    None => missing.push(id.clone()),
                }
            }
            (removed, missing)
        });
        if !missing.is_empty() {
            return fail_missing(&cx, missing);
        }

        cx.write::<FilterContextReducer>(&FilterContextAction::Remove {
            local_ids: command.filter_local_ids,
        })?;
        cx.emit_typed(&FilterContextEvent::AttributeFiltersRemoved { removed })?;
        emit_changed(&cx)
    }
}

/// Payload of `FILTER_CONTEXT_MOVE_ATTRIBUTE_FILTER`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveAttributeFilter {
    /// Filter to move.
    pub filter_local_id: String,
    /// Target position; `-1` moves to the end.
    pub index: i64,
}

/// Moves a filter to another position.
pub struct MoveAttributeFilterHandler;

#[async_trait]
impl CommandHandler<DashboardState> for MoveAttributeFilterHandler {
    const COMMAND_TYPE: &'static str = FILTER_CONTEXT_MOVE_ATTRIBUTE_FILTER;
    type Command = MoveAttributeFilter;

    async fn handle(
        &self,
        cx: HandlerContext<DashboardState>,
        command: MoveAttributeFilter,
    ) -> Result<(), TaskError> {
        let (from, len) = cx.read(|s| {
            (
                s.filter_context.position(&command.filter_local_id),
                s.filter_context.items.len(),
            )
        });
        let Some(from_index) = from else {
            return fail_missing(&cx, vec![command.filter_local_id]);
        };
        let index = resolve_index(command.index, len - 1)?;

        cx.write::<FilterContextReducer>(&FilterContextAction::Move {
            local_id: command.filter_local_id.clone(),
            index,
        })?;
        cx.emit_typed(&FilterContextEvent::AttributeFilterMoved {
            local_id: command.filter_local_id,
            from_index,
            to_index: index.unwrap_or(len - 1),
        })?;
        emit_changed(&cx)
    }
}

/// Payload of `FILTER_CONTEXT_CHANGE_ATTRIBUTE_FILTER_SELECTION`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeAttributeFilterSelection {
    /// Target filter.
    pub filter_local_id: String,
    /// New selection.
    pub selection: Selection,
}

/// Replaces a filter's selection.
pub struct ChangeAttributeFilterSelectionHandler;

#[async_trait]
impl CommandHandler<DashboardState> for ChangeAttributeFilterSelectionHandler {
    const COMMAND_TYPE: &'static str = FILTER_CONTEXT_CHANGE_ATTRIBUTE_FILTER_SELECTION;
    type Command = ChangeAttributeFilterSelection;

    async fn handle(
        &self,
        cx: HandlerContext<DashboardState>,
        command: ChangeAttributeFilterSelection,
    ) -> Result<(), TaskError> {
        if cx.read(|s| s.filter_context.get(&command.filter_local_id).is_none()) {
            return fail_missing(&cx, vec![command.filter_local_id]);
        }
        cx.write::<FilterContextReducer>(&FilterContextAction::ChangeSelection {
            local_id: command.filter_local_id.clone(),
            selection: command.selection.clone(),
        })?;
        cx.emit_typed(&FilterContextEvent::AttributeFilterSelectionUpdated {
            local_id: command.filter_local_id,
            selection: command.selection,
        })?;
        emit_changed(&cx)
    }
}

/// Filter context items in display order.
pub fn select_filter_context_items() -> Selector<DashboardState, Vec<FilterContextItem>> {
    Selector::new("filter_context_items", |s: &DashboardState| s.filter_context.items.clone())
}

/// One filter context item by local id.
pub fn select_filter_context_item(
    local_id: &str,
) -> Selector<DashboardState, Option<FilterContextItem>> {
    let id = local_id.to_owned();
    Selector::new("filter_context_item", move |s: &DashboardState| {
        s.filter_context.get(&id).cloned()
    })
}
