//! Error types for wish-market

use thiserror::Error;

/// Coarse classification of a [`MarketError`].
///
/// The protocol layer maps these onto status codes; nothing should ever
/// match on the rendered error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Unauthorized,
    Invalid,
    Internal,
}

#[derive(Error, Debug)]
pub enum MarketError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Claim not found: {0}")]
    ClaimNotFound(String),

    #[error("Proposal not found: {0}")]
    ProposalNotFound(String),

    #[error("Submission not found: {0}")]
    SubmissionNotFound(String),

    #[error("Contract not found: {0}")]
    ContractNotFound(String),

    #[error("Task {task_id} is already claimed by another agent")]
    TaskTaken { task_id: String },

    #[error("Task {task_id} cannot be claimed while {status}")]
    TaskUnavailable { task_id: String, status: String },

    #[error("Claim {claim_id} is not active (status: {status})")]
    ClaimNotActive { claim_id: String, status: String },

    #[error("Claim {0} has expired")]
    ClaimExpired(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Cannot publish proposal {proposal_id}: task {task_id} has no approved submission")]
    PublishBlocked { proposal_id: String, task_id: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Funding provider error: {0}")]
    Funding(String),

    #[error("Ingestion error: {0}")]
    Ingestion(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MarketError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MarketError::TaskNotFound(_)
            | MarketError::ClaimNotFound(_)
            | MarketError::ProposalNotFound(_)
            | MarketError::SubmissionNotFound(_)
            | MarketError::ContractNotFound(_) => ErrorKind::NotFound,

            MarketError::TaskTaken { .. }
            | MarketError::TaskUnavailable { .. }
            | MarketError::ClaimNotActive { .. }
            | MarketError::ClaimExpired(_)
            | MarketError::Conflict(_)
            | MarketError::PublishBlocked { .. } => ErrorKind::Conflict,

            MarketError::Unauthorized(_) => ErrorKind::Unauthorized,

            MarketError::InvalidInput(_) | MarketError::Config(_) => ErrorKind::Invalid,

            MarketError::Funding(_)
            | MarketError::Ingestion(_)
            | MarketError::Database(_)
            | MarketError::Json(_)
            | MarketError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(MarketError::TaskNotFound("t".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            MarketError::TaskTaken { task_id: "t".into() }.kind(),
            ErrorKind::Conflict
        );
        assert_eq!(MarketError::ClaimExpired("c".into()).kind(), ErrorKind::Conflict);
        assert_eq!(MarketError::Unauthorized("nope".into()).kind(), ErrorKind::Unauthorized);
        assert!(MarketError::PublishBlocked {
            proposal_id: "p".into(),
            task_id: "t".into()
        }
        .is_conflict());
    }

    #[test]
    fn test_publish_blocked_names_task() {
        let err = MarketError::PublishBlocked {
            proposal_id: "p-1".into(),
            task_id: "task-7".into(),
        };
        assert!(err.to_string().contains("task-7"));
    }
}
