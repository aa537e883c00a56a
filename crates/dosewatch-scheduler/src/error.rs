use thiserror::Error;

/// Errors that can occur within the scheduling engine.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Malformed recurrence or duration input. Never persisted.
    #[error("Invalid reminder: {0}")]
    InvalidSpec(String),

    /// No reminder (or adherence record) with the given ID is visible to the caller.
    #[error("Not found: {id}")]
    NotFound { id: String },

    /// Another instance holds the claim on this trigger. Callers skip it.
    #[error("Trigger {trigger_id} is claimed by another worker")]
    ClaimConflict { trigger_id: String },

    /// Requested status change is not allowed from the current state.
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Stored JSON column (schedule, rules) could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchedulerError {
    /// Short error code string sent to clients in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::InvalidSpec(_) => "INVALID_SPEC",
            SchedulerError::NotFound { .. } => "NOT_FOUND",
            SchedulerError::ClaimConflict { .. } => "CLAIM_CONFLICT",
            SchedulerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
