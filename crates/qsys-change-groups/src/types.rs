//! Outcome records returned by change group operations

use qsys_core::ControlValue;
use serde::Serialize;

/// One entry in a poll result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    pub name: String,
    pub value: ControlValue,
    pub string: String,
    /// False only for unchanged members included on request
    pub changed: bool,
    /// Value at the previous poll; absent on a member's first poll
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<ControlValue>,
}

/// A member that could not be read during a poll
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlError {
    pub name: String,
    pub message: String,
}

/// Result of polling a group
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOutcome {
    pub group_id: String,
    pub changes: Vec<ChangeEntry>,
    /// Members that actually changed, even when unchanged ones are listed
    pub change_count: usize,
    pub has_changes: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ControlError>,
}

impl PollOutcome {
    pub fn empty(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            changes: Vec::new(),
            change_count: 0,
            has_changes: false,
            errors: Vec::new(),
        }
    }

    pub(crate) fn new(
        group_id: impl Into<String>,
        changes: Vec<ChangeEntry>,
        errors: Vec<ControlError>,
    ) -> Self {
        let change_count = changes.iter().filter(|c| c.changed).count();
        Self {
            group_id: group_id.into(),
            changes,
            change_count,
            has_changes: change_count > 0,
            errors,
        }
    }
}

/// Result of `create`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOutcome {
    pub group_id: String,
    /// False when the group already existed
    pub created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// A name rejected by `add_controls`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidControl {
    pub name: String,
    pub reason: String,
}

/// Result of `add_controls`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddControlsOutcome {
    pub group_id: String,
    pub requested: usize,
    pub added: usize,
    pub total_members: usize,
    pub invalid_controls: Vec<InvalidControl>,
    /// Already members, or repeated within the request
    pub skipped_controls: Vec<String>,
}

/// Result of `remove_controls`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveControlsOutcome {
    pub group_id: String,
    pub removed: usize,
    pub not_present: Vec<String>,
    pub total_members: usize,
}

/// Result of `clear`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearOutcome {
    pub group_id: String,
    pub removed: usize,
}

/// Result of `destroy`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyOutcome {
    pub group_id: String,
    pub members: usize,
    pub auto_poll_cancelled: bool,
    pub cached_events_dropped: usize,
}

/// One line of `list`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub id: String,
    pub control_count: usize,
    pub has_auto_poll: bool,
    pub poll_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_poll_ms: Option<u64>,
}
