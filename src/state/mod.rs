/// Selection of the displayed question.
pub mod answers;
/// Assessment definition fetched at start.
pub mod question;
/// Attempt lifecycle and its transitions.
pub mod state_machine;

use std::collections::BTreeSet;

pub use self::state_machine::{
    AbortError, ApplyError, AttemptEvent, AttemptStateMachine, AttemptStatus, FinalizeReason,
    InvalidTransition, Plan, PlanError, PlanId,
};

/// Mutable root entity of one session, owned exclusively by the controller.
#[derive(Debug, Default)]
pub struct SessionAttempt {
    /// Opaque identifier assigned by the server at start.
    pub attempt_id: Option<String>,
    /// Lifecycle of the attempt.
    pub machine: AttemptStateMachine,
    /// Time left, mirrored from the clock.
    pub remaining_seconds: u64,
    /// Displayed question.
    pub current_question_index: usize,
    /// Questions with at least one acknowledged save.
    pub answered: BTreeSet<usize>,
    /// Most recent save of some question exhausted its retries unconfirmed.
    pub pending_save: bool,
}

impl SessionAttempt {
    /// Current lifecycle status.
    pub fn status(&self) -> AttemptStatus {
        self.machine.status()
    }

    /// Record the countdown value. Ignored once the attempt is terminal.
    pub fn set_remaining(&mut self, seconds: u64) {
        if !self.status().is_terminal() {
            self.remaining_seconds = seconds;
        }
    }

    /// Record an acknowledged save. Ignored once the attempt is terminal.
    pub fn mark_answered(&mut self, question_index: usize) -> bool {
        if self.status().is_terminal() {
            return false;
        }
        self.answered.insert(question_index)
    }
}
