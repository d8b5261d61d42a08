use serde::{Deserialize, Serialize};

/// Pipeline states. A file's current folder is its state at folder
/// granularity; some adjacent states share a folder and transition
/// logically without a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Inbox,
    NeedsAction,
    ActionProcessing,
    Plans,
    PendingApproval,
    ApprovalReview,
    Approved,
    Rejected,
    ExecutionPending,
    Executing,
    Executed,
    Done,
    Failed,
    Retry,
    DeadLetter,
    Archived,
}

impl WorkflowState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::NeedsAction => "needs_action",
            Self::ActionProcessing => "action_processing",
            Self::Plans => "plans",
            Self::PendingApproval => "pending_approval",
            Self::ApprovalReview => "approval_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::ExecutionPending => "execution_pending",
            Self::Executing => "executing",
            Self::Executed => "executed",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Retry => "retry",
            Self::DeadLetter => "dead_letter",
            Self::Archived => "archived",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "inbox" => Ok(Self::Inbox),
            "needs_action" => Ok(Self::NeedsAction),
            "action_processing" => Ok(Self::ActionProcessing),
            "plans" => Ok(Self::Plans),
            "pending_approval" => Ok(Self::PendingApproval),
            "approval_review" => Ok(Self::ApprovalReview),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "execution_pending" => Ok(Self::ExecutionPending),
            "executing" => Ok(Self::Executing),
            "executed" => Ok(Self::Executed),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "retry" => Ok(Self::Retry),
            "dead_letter" => Ok(Self::DeadLetter),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown workflow state `{other}`")),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Archived | Self::DeadLetter)
    }

    /// Vault folder backing this state.
    pub fn folder(self) -> &'static str {
        match self {
            Self::Inbox => "Inbox",
            Self::NeedsAction | Self::ActionProcessing => "Needs_Action",
            Self::Plans => "Plans",
            Self::PendingApproval | Self::ApprovalReview => "Pending_Approval",
            Self::Approved | Self::ExecutionPending | Self::Executing => "Approved",
            Self::Executed | Self::Done => "Done",
            Self::Rejected => "Rejected",
            Self::Failed => "Failed",
            Self::Retry => "Retry",
            Self::DeadLetter => "Dead_Letter",
            Self::Archived => "Archived",
        }
    }

    pub fn from_folder(folder: &str) -> Option<Self> {
        match folder {
            "Inbox" => Some(Self::Inbox),
            "Needs_Action" => Some(Self::NeedsAction),
            "Plans" => Some(Self::Plans),
            "Pending_Approval" => Some(Self::PendingApproval),
            "Approved" => Some(Self::Approved),
            "Done" => Some(Self::Done),
            "Rejected" => Some(Self::Rejected),
            "Failed" => Some(Self::Failed),
            "Retry" => Some(Self::Retry),
            "Dead_Letter" => Some(Self::DeadLetter),
            "Archived" => Some(Self::Archived),
            _ => None,
        }
    }

    pub fn valid_targets(self) -> &'static [WorkflowState] {
        use WorkflowState::*;
        match self {
            Inbox => &[NeedsAction, Failed],
            NeedsAction => &[ActionProcessing, Failed],
            ActionProcessing => &[Plans, Failed, Retry],
            Plans => &[PendingApproval, ExecutionPending, Failed],
            PendingApproval => &[ApprovalReview, Failed],
            ApprovalReview => &[Approved, Rejected, Failed],
            Approved => &[Executing, Failed],
            ExecutionPending => &[Executing, Failed],
            Executing => &[Executed, Failed, Retry],
            Executed => &[Done, Failed],
            Done => &[Archived],
            Rejected => &[Archived, DeadLetter],
            Failed => &[Retry, DeadLetter],
            Retry => &[NeedsAction, Plans, Executing, DeadLetter],
            DeadLetter => &[],
            Archived => &[],
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn is_valid_transition(from: WorkflowState, to: WorkflowState) -> bool {
    from.valid_targets().contains(&to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_edges_are_valid() {
        use WorkflowState::*;
        let path = [
            (Inbox, NeedsAction),
            (NeedsAction, ActionProcessing),
            (ActionProcessing, Plans),
            (Plans, PendingApproval),
            (PendingApproval, ApprovalReview),
            (ApprovalReview, Approved),
            (Approved, Executing),
            (Executing, Executed),
            (Executed, Done),
            (Done, Archived),
        ];
        for (from, to) in path {
            assert!(is_valid_transition(from, to), "{from} -> {to}");
        }
    }

    #[test]
    fn terminal_states_have_no_exits_except_done_archival() {
        assert!(WorkflowState::DeadLetter.valid_targets().is_empty());
        assert!(WorkflowState::Archived.valid_targets().is_empty());
        assert_eq!(
            WorkflowState::Done.valid_targets(),
            &[WorkflowState::Archived]
        );
    }

    #[test]
    fn skipping_approval_is_invalid() {
        assert!(!is_valid_transition(
            WorkflowState::PendingApproval,
            WorkflowState::Approved
        ));
        assert!(!is_valid_transition(
            WorkflowState::Inbox,
            WorkflowState::Done
        ));
    }

    #[test]
    fn states_round_trip_through_strings() {
        for state in [
            WorkflowState::Inbox,
            WorkflowState::ActionProcessing,
            WorkflowState::DeadLetter,
        ] {
            assert_eq!(WorkflowState::parse(state.as_str()), Ok(state));
        }
        assert!(WorkflowState::parse("bogus").is_err());
    }

    #[test]
    fn every_folder_maps_back_to_a_state() {
        for folder in crate::vault::PIPELINE_FOLDERS {
            if folder == "Inbox" {
                continue;
            }
            let state = WorkflowState::from_folder(folder);
            assert!(state.is_some(), "folder {folder} has no state");
        }
    }
}
