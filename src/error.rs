use std::fmt;

use thiserror::Error;

use crate::{
    dao::api::ApiError,
    state::{
        AbortError, ApplyError, AttemptStatus, PlanError, answers::SelectionError,
    },
};

/// The four kinds every engine failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network trouble; retried locally and shown as a non-blocking indicator.
    TransientIo,
    /// The server's deadline or records end the session.
    AuthoritativeRejection,
    /// The terminal call keeps failing.
    TerminalCall,
    /// The student asked for something the session cannot do right now.
    InputHazard,
}

/// Why an explicit submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitRejection {
    /// The device is offline; answers may not have reached the server.
    Offline,
    /// At least one answer has not been confirmed by the server.
    SavePending,
    /// Answers are being re-sent after a connectivity gap.
    Reconciling,
    /// The attempt is already being submitted.
    AlreadyFinalizing,
}

impl fmt::Display for SubmitRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SubmitRejection::Offline => "you are offline; reconnect before submitting",
            SubmitRejection::SavePending => {
                "some answers are not saved yet; wait for them to sync before submitting"
            }
            SubmitRejection::Reconciling => "answers are being re-synced; try again in a moment",
            SubmitRejection::AlreadyFinalizing => "the attempt is already being submitted",
        };
        f.write_str(reason)
    }
}

/// Errors returned by the session engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The attempt has not been started.
    #[error("session has not started")]
    NotStarted,
    /// The attempt no longer accepts changes.
    #[error("attempt is closed ({0:?})")]
    Finalized(AttemptStatus),
    /// Navigation or selection targeted a question that does not exist.
    #[error("question {index} is out of range (assessment has {count} questions)")]
    QuestionOutOfRange {
        /// Requested position.
        index: usize,
        /// Number of questions.
        count: usize,
    },
    /// The selection edit was refused.
    #[error("invalid selection: {0}")]
    InvalidSelection(#[from] SelectionError),
    /// Explicit submission refused, with the reason shown to the student.
    #[error("cannot submit: {0}")]
    SubmitRejected(SubmitRejection),
    /// The server ended or refused the attempt.
    #[error("attempt rejected by server: {0}")]
    Rejected(#[source] ApiError),
    /// The server could not be reached for an operation that needs it.
    #[error("server unavailable: {0}")]
    Unavailable(#[source] ApiError),
    /// The terminal call keeps failing; the student should contact support.
    #[error("submission could not be confirmed; contact support")]
    TerminalCallStalled,
    /// Operation cannot be performed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The controller task is gone.
    #[error("session engine stopped")]
    EngineStopped,
}

impl SessionError {
    /// Attribute the error to one of the four failure kinds.
    pub fn kind(&self) -> FailureKind {
        match self {
            SessionError::Unavailable(_) | SessionError::EngineStopped => FailureKind::TransientIo,
            SessionError::Rejected(_) => FailureKind::AuthoritativeRejection,
            SessionError::TerminalCallStalled => FailureKind::TerminalCall,
            SessionError::NotStarted
            | SessionError::Finalized(_)
            | SessionError::QuestionOutOfRange { .. }
            | SessionError::InvalidSelection(_)
            | SessionError::SubmitRejected(_)
            | SessionError::InvalidState(_) => FailureKind::InputHazard,
        }
    }
}

impl From<ApiError> for SessionError {
    fn from(err: ApiError) -> Self {
        if err.is_authoritative() {
            SessionError::Rejected(err)
        } else {
            SessionError::Unavailable(err)
        }
    }
}

impl From<PlanError> for SessionError {
    fn from(err: PlanError) -> Self {
        SessionError::InvalidState(err.to_string())
    }
}

impl From<ApplyError> for SessionError {
    fn from(err: ApplyError) -> Self {
        SessionError::InvalidState(err.to_string())
    }
}

impl From<AbortError> for SessionError {
    fn from(err: AbortError) -> Self {
        SessionError::InvalidState(err.to_string())
    }
}
