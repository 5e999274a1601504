use std::time::SystemTime;

use serde::Serialize;

use crate::{dao::models::SubmitResultEntity, state::AttemptStatus};

/// Observable view of a session, published after every serialized mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Server-assigned attempt identifier, once started.
    pub attempt_id: Option<String>,
    /// Lifecycle status.
    pub status: AttemptStatus,
    /// Number of applied status transitions.
    pub version: usize,
    /// Countdown value.
    pub remaining_seconds: u64,
    /// Displayed question.
    pub current_question_index: usize,
    /// Number of questions in the assessment.
    pub question_count: usize,
    /// Selection of the displayed question.
    pub selection: Vec<usize>,
    /// Questions with an acknowledged save, ascending.
    pub answered: Vec<usize>,
    /// Some answer exhausted its retries and awaits reconciliation.
    pub pending_save: bool,
    /// Connectivity as last reported by the platform.
    pub online: bool,
    /// Visibility as last reported by the platform.
    pub visible: bool,
    /// Flag of the terminal call once finalization began.
    pub auto_submit: Option<bool>,
    /// The terminal call has been issued and has not resolved yet.
    pub terminal_call_pending: bool,
    /// The terminal call keeps failing; the student should contact support.
    pub support_required: bool,
    /// RFC 3339 timestamp of the last acknowledged save.
    pub last_saved_at: Option<String>,
    /// Server result of the terminal call.
    pub result: Option<SubmitResultEntity>,
}

impl SessionSnapshot {
    /// Snapshot of a session that has not started.
    pub fn not_started() -> Self {
        Self {
            attempt_id: None,
            status: AttemptStatus::NotStarted,
            version: 0,
            remaining_seconds: 0,
            current_question_index: 0,
            question_count: 0,
            selection: Vec::new(),
            answered: Vec::new(),
            pending_save: false,
            online: true,
            visible: true,
            auto_submit: None,
            terminal_call_pending: false,
            support_required: false,
            last_saved_at: None,
            result: None,
        }
    }

    /// Whether the attempt reached a terminal status.
    pub fn is_closed(&self) -> bool {
        self.status.is_terminal()
    }

    /// Closed, with no terminal call left in flight.
    pub fn is_final(&self) -> bool {
        self.is_closed() && !self.terminal_call_pending
    }
}

/// Format a save acknowledgment time for [`SessionSnapshot::last_saved_at`].
pub fn saved_at(time: SystemTime) -> String {
    super::format_system_time(time)
}
