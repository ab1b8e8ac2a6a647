//! Error types for ai3 operations.
//!
//! Defines error types for all major subsystems:
//! - Planning (prompt decomposition into a task graph)
//! - Routing (candidate selection)
//! - Provider execution (backend API interactions)
//! - Verification (artifact quality judgement)
//! - Journal persistence
//! - Run-level outcomes surfaced to the interface layer

use thiserror::Error;

/// Errors that can occur while planning a task graph.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Planner output failed schema validation: {0}")]
    Schema(String),

    #[error("Planner output contains a dependency cycle: {0}")]
    Cycle(String),

    #[error("Planner LLM call failed: {0}")]
    UpstreamLlm(String),
}

/// Errors that can occur while routing a task to a model.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("No candidate model for task '{task_id}': {reason}")]
    NoCandidate { task_id: String, reason: String },
}

/// Errors returned by provider adapters.
///
/// Adapters normalize every provider-specific failure shape into one of
/// these variants so the scheduler can treat failure as data.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Transient provider error: {0}")]
    Transient(String),

    #[error("Permanent provider error: {0}")]
    Permanent(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Provider call timed out after {0} ms")]
    Timeout(u64),
}

impl ProviderError {
    /// Whether the adapter-level retry loop may re-attempt this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::RateLimited(_) | ProviderError::Timeout(_)
        )
    }

    /// Whether the error rules out every future attempt against the same
    /// binding (fallback skips repair and rebinds immediately).
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProviderError::Permanent(_))
    }

    /// Whether the error is fatal to the whole run (no fallback).
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProviderError::AuthFailed(_))
    }
}

/// Errors that can occur inside the verifier itself.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Verifier rubric call failed: {0}")]
    InternalRubric(String),
}

/// Errors that can occur while persisting or replaying run traces.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Run trace '{0}' not found")]
    TraceNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Run-level errors surfaced to the CLI and HTTP interface.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Planning failed: {0}")]
    Plan(#[from] PlanError),

    #[error("All candidates failed: {summary}")]
    AllCandidatesFailed { summary: String },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run timed out")]
    Timeout,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),
}

impl RunError {
    /// Stable identifier used in HTTP error bodies and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::Plan(_) => "plan_error",
            RunError::AllCandidatesFailed { .. } => "all_candidates_failed",
            RunError::Cancelled => "cancelled",
            RunError::Timeout => "timeout",
            RunError::Configuration(_) => "configuration",
            RunError::Journal(_) => "internal",
        }
    }

    /// Process exit code for the CLI surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Plan(_) => 1,
            RunError::AllCandidatesFailed { .. } => 2,
            RunError::Cancelled | RunError::Timeout => 3,
            RunError::Configuration(_) => 4,
            RunError::Journal(_) => 2,
        }
    }
}
