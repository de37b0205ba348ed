//! Working/committed selection commands of an attribute filter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::DashboardState;
use super::attribute_filter::{AttributeFilterAction, AttributeFiltersReducer, Selection};
use crate::error::TaskError;
use crate::handler::{CommandHandler, HandlerContext};

/// `ATTRIBUTE_FILTER_CHANGE_SELECTION` command type.
pub const ATTRIBUTE_FILTER_CHANGE_SELECTION: &str = "ATTRIBUTE_FILTER_CHANGE_SELECTION";
/// `ATTRIBUTE_FILTER_COMMIT_SELECTION` command type.
pub const ATTRIBUTE_FILTER_COMMIT_SELECTION: &str = "ATTRIBUTE_FILTER_COMMIT_SELECTION";
/// `ATTRIBUTE_FILTER_REVERT_SELECTION` command type.
pub const ATTRIBUTE_FILTER_REVERT_SELECTION: &str = "ATTRIBUTE_FILTER_REVERT_SELECTION";
/// `ATTRIBUTE_FILTER_INVERT_SELECTION` command type.
pub const ATTRIBUTE_FILTER_INVERT_SELECTION: &str = "ATTRIBUTE_FILTER_INVERT_SELECTION";
/// `ATTRIBUTE_FILTER_CLEAR_SELECTION` command type.
pub const ATTRIBUTE_FILTER_CLEAR_SELECTION: &str = "ATTRIBUTE_FILTER_CLEAR_SELECTION";

/// Events of the selection commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SelectionEvent {
    /// The working selection became the committed one.
    #[serde(rename = "ATTRIBUTE_FILTER_SELECTION_COMMITTED", rename_all = "camelCase")]
    Committed {
        filter_id: String,
        selection: Selection,
    },
    /// Terminal event of every selection command.
    #[serde(rename = "ATTRIBUTE_FILTER_SELECTION_CHANGED", rename_all = "camelCase")]
    Changed {
        filter_id: String,
        working_selection: Selection,
        committed_selection: Selection,
    },
}

/// Payload naming just the filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterRef {
    /// Target filter.
    pub filter_id: String,
}

/// Payload of `ATTRIBUTE_FILTER_CHANGE_SELECTION`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSelection {
    /// Target filter.
    pub filter_id: String,
    /// New working selection.
    pub selection: Selection,
}

/// Apply `action` to an existing filter and emit the resulting selections.
fn apply(
    cx: &HandlerContext<DashboardState>,
    filter_id: String,
    action: AttributeFilterAction,
) -> Result<(), TaskError> {
    if cx.read(|s| s.attribute_filters.get(&filter_id).is_none()) {
        return Err(TaskError::Domain(format!("unknown attribute filter '{filter_id}'")));
    }
    let commit = matches!(action, AttributeFilterAction::CommitSelection { .. });
    cx.write::<AttributeFiltersReducer>(&action)?;

    let (working_selection, committed_selection) = cx.read(|s| {
        s.attribute_filters
            .get(&filter_id)
            .map(|f| (f.working_selection.clone(), f.committed_selection.clone()))
            .unwrap_or_default()
    });
    if commit {
        cx.emit_typed(&SelectionEvent::Committed {
            filter_id: filter_id.clone(),
            selection: committed_selection.clone(),
        })?;
    }
    cx.emit_typed(&SelectionEvent::Changed {
        filter_id,
        working_selection,
        committed_selection,
    })
}

/// Replaces the working selection.
pub struct ChangeSelectionHandler;

#[async_trait]
impl CommandHandler<DashboardState> for ChangeSelectionHandler {
    const COMMAND_TYPE: &'static str = ATTRIBUTE_FILTER_CHANGE_SELECTION;
    type Command = ChangeSelection;

    async fn handle(
        &self,
        cx: HandlerContext<DashboardState>,
        command: ChangeSelection,
    ) -> Result<(), TaskError> {
        let action = AttributeFilterAction::ChangeSelection {
            filter_id: command.filter_id.clone(),
            selection: command.selection,
        };
        apply(&cx, command.filter_id, action)
    }
}

/// Makes the working selection the committed one.
pub struct CommitSelectionHandler;

#[async_trait]
impl CommandHandler<DashboardState> for CommitSelectionHandler {
    const COMMAND_TYPE: &'static str = ATTRIBUTE_FILTER_COMMIT_SELECTION;
    type Command = FilterRef;

    async fn handle(
        &self,
        cx: HandlerContext<DashboardState>,
        command: FilterRef,
    ) -> Result<(), TaskError> {
        let action = AttributeFilterAction::CommitSelection {
            filter_id: command.filter_id.clone(),
        };
        apply(&cx, command.filter_id, action)
    }
}

/// Discards working changes.
pub struct RevertSelectionHandler;

#[async_trait]
impl CommandHandler<DashboardState> for RevertSelectionHandler {
    const COMMAND_TYPE: &'static str = ATTRIBUTE_FILTER_REVERT_SELECTION;
    type Command = FilterRef;

    async fn handle(
        &self,
        cx: HandlerContext<DashboardState>,
        command: FilterRef,
    ) -> Result<(), TaskError> {
        let action = AttributeFilterAction::RevertSelection {
            filter_id: command.filter_id.clone(),
        };
        apply(&cx, command.filter_id, action)
    }
}

/// Flips the working selection between inclusive and exclusive.
pub struct InvertSelectionHandler;

#[async_trait]
impl CommandHandler<DashboardState> for InvertSelectionHandler {
    const COMMAND_TYPE: &'static str = ATTRIBUTE_FILTER_INVERT_SELECTION;
    type Command = FilterRef;

    async fn handle(
        &self,
        cx: HandlerContext<DashboardState>,
        command: FilterRef,
    ) -> Result<(), TaskError> {
        let action = AttributeFilterAction::InvertSelection {
            filter_id: command.filter_id.clone(),
        };
        apply(&cx, command.filter_id, action)
    }
}

/// Selects everything.
pub struct ClearSelectionHandler;

#[async_trait]
impl CommandHandler<DashboardState> for ClearSelectionHandler {
    const COMMAND_TYPE: &'static str = ATTRIBUTE_FILTER_CLEAR_SELECTION;
    type Command = FilterRef;

    async fn handle(
        &self,
        cx: HandlerContext<DashboardState>,
        command: FilterRef,
    ) -> Result<(), TaskError> {
        let action = AttributeFilterAction::ClearSelection {
            filter_id: command.filter_id.clone(),
        };
        apply(&cx, command.filter_id, action)
    }
}
