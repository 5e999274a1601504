use futures::future::BoxFuture;
use thiserror::Error;

use crate::dao::models::{
    AttemptStatusEntity, SaveAnswerRequest, StartedAttemptEntity, SubmitResultEntity,
};

/// Result alias for assessment server operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Abstraction over the assessment server consumed by the session engine.
///
/// Every operation is expected to be idempotent on the server side: the engine cannot tell a
/// lost request from a lost response and will replay calls whose acknowledgment never arrived.
pub trait AssessmentApi: Send + Sync {
    /// Open (or resume) the caller's attempt for `assessment_id`.
    fn start_attempt(&self, assessment_id: &str)
    -> BoxFuture<'static, ApiResult<StartedAttemptEntity>>;
    /// Persist the selection for one question of an attempt.
    fn save_answer(
        &self,
        attempt_id: &str,
        answer: SaveAnswerRequest,
    ) -> BoxFuture<'static, ApiResult<()>>;
    /// Fetch the server's view of the attempt clock.
    fn get_attempt_status(
        &self,
        attempt_id: &str,
    ) -> BoxFuture<'static, ApiResult<AttemptStatusEntity>>;
    /// Terminal call; a repeat against an already submitted attempt returns the original result.
    fn submit_attempt(
        &self,
        attempt_id: &str,
        auto_submit: bool,
    ) -> BoxFuture<'static, ApiResult<SubmitResultEntity>>;
}

/// Failures surfaced by an [`AssessmentApi`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The student has no access window for this assessment.
    #[error("not eligible to take this assessment")]
    NotEligible,
    /// A terminal attempt exists and retakes are disallowed.
    #[error("assessment already completed")]
    AlreadyCompleted,
    /// The server's own deadline for the attempt has passed.
    #[error("attempt deadline has passed")]
    AttemptExpired,
    /// The server could not be reached.
    #[error("server unreachable: {0}")]
    Unreachable(String),
    /// The request did not complete within its time budget.
    #[error("request timed out")]
    Timeout,
    /// The server answered with an unexpected status.
    #[error("unexpected server status {status} for `{path}`")]
    Status {
        /// Request path relative to the API base.
        path: String,
        /// Numeric HTTP status.
        status: u16,
    },
    /// The response body could not be decoded.
    #[error("failed to decode response for `{path}`: {message}")]
    Decode {
        /// Request path relative to the API base.
        path: String,
        /// Decoder message.
        message: String,
    },
}

impl ApiError {
    /// Whether the server's answer is ground truth that ends the local session.
    pub fn is_authoritative(&self) -> bool {
        matches!(
            self,
            ApiError::NotEligible | ApiError::AlreadyCompleted | ApiError::AttemptExpired
        )
    }
}
