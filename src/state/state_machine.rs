use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle status of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// No attempt has been opened yet.
    NotStarted,
    /// The student is answering and the clock is running.
    InProgress,
    /// Outstanding saves are being replayed after a connectivity gap.
    Reconciling,
    /// Saves are draining ahead of the single terminal call.
    Finalizing,
    /// The server accepted the terminal call.
    Submitted,
    /// The server closed the attempt on its own deadline.
    Expired,
}

impl AttemptStatus {
    /// Statuses that accept no further mutation.
    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptStatus::Submitted | AttemptStatus::Expired)
    }

    /// Statuses in which the student may still work on answers.
    pub fn is_active(self) -> bool {
        matches!(self, AttemptStatus::InProgress | AttemptStatus::Reconciling)
    }
}

/// Why the attempt is being finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeReason {
    /// The countdown reached zero.
    Deadline,
    /// The student pressed submit.
    UserSubmit,
}

/// Events that can be applied to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptEvent {
    /// The server opened (or resumed) the attempt.
    Start,
    /// Replay of outstanding saves began after reconnecting.
    BeginReconcile,
    /// No replay is in flight any more.
    Reconciled,
    /// Move into the drain-then-submit protocol.
    Finalize(FinalizeReason),
    /// The terminal call was accepted.
    Submitted,
    /// The server reported its deadline as passed.
    ServerExpired,
    /// The server reported a terminal attempt that already exists.
    ServerCompleted,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The status the machine was in when the invalid event was received.
    pub from: AttemptStatus,
    /// The event that cannot be applied from this status.
    pub event: AttemptEvent,
}

/// Errors that can occur when planning a state machine transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// A transition is already pending and must be applied or aborted.
    #[error("a transition is already pending")]
    AlreadyPending,
    /// The requested transition is not valid from the current status.
    #[error(transparent)]
    InvalidTransition(InvalidTransition),
}

/// Errors that can occur when applying a planned state machine transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// No transition is currently pending.
    #[error("no transition is pending")]
    NoPending,
    /// Plan ID does not match the pending plan.
    #[error("plan {got} does not match pending plan {expected}")]
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
    },
    /// Status changed since the plan was created.
    #[error("status changed during transition (expected {expected:?}, got {actual:?})")]
    StatusMismatch {
        /// Status when plan was created.
        expected: AttemptStatus,
        /// Current status.
        actual: AttemptStatus,
    },
}

/// Errors that can occur when aborting a planned state machine transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortError {
    /// No transition is currently pending.
    #[error("no transition is pending")]
    NoPending,
    /// Plan ID does not match the pending plan.
    #[error("plan {got} does not match pending plan {expected}")]
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
    },
}

/// Unique identifier for a planned state transition.
pub type PlanId = Uuid;

/// A planned transition that has been validated but not yet applied.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Unique identifier for this plan.
    pub id: PlanId,
    /// Status the machine is currently in.
    pub from: AttemptStatus,
    /// Status the machine will transition to.
    pub to: AttemptStatus,
    /// Event that triggered this transition.
    pub event: AttemptEvent,
}

/// State machine for one attempt.
///
/// Transitions that wait on I/O (opening the attempt) are planned first and applied or
/// aborted once the server answers; every other transition is applied directly.
#[derive(Debug, Clone)]
pub struct AttemptStateMachine {
    status: AttemptStatus,
    version: usize,
    pending: Option<Plan>,
}

impl Default for AttemptStateMachine {
    fn default() -> Self {
        Self {
            status: AttemptStatus::NotStarted,
            version: 0,
            pending: None,
        }
    }
}

impl AttemptStateMachine {
    /// Create a new state machine in the not-started status.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect the current status.
    pub fn status(&self) -> AttemptStatus {
        self.status
    }

    /// Number of applied transitions.
    pub fn version(&self) -> usize {
        self.version
    }

    /// Target status of a planned but not yet applied transition.
    pub fn pending(&self) -> Option<AttemptStatus> {
        self.pending.as_ref().map(|plan| plan.to)
    }

    /// Validate `event` against the current status and park it as the pending plan.
    pub fn plan(&mut self, event: AttemptEvent) -> Result<Plan, PlanError> {
        if self.pending.is_some() {
            return Err(PlanError::AlreadyPending);
        }

        let next = self
            .compute_transition(event)
            .map_err(PlanError::InvalidTransition)?;

        let plan = Plan {
            id: Uuid::new_v4(),
            from: self.status,
            to: next,
            event,
        };

        self.pending = Some(plan.clone());

        Ok(plan)
    }

    /// Apply a planned transition, returning the new status.
    pub fn apply(&mut self, plan_id: PlanId) -> Result<AttemptStatus, ApplyError> {
        let plan = self.pending.take().ok_or(ApplyError::NoPending)?;

        if plan.id != plan_id {
            let expected_plan_id = plan.id;
            self.pending = Some(plan);
            return Err(ApplyError::IdMismatch {
                expected: expected_plan_id,
                got: plan_id,
            });
        }

        if self.status != plan.from {
            return Err(ApplyError::StatusMismatch {
                expected: plan.from,
                actual: self.status,
            });
        }

        self.status = plan.to;
        self.version += 1;

        Ok(self.status)
    }

    /// Abort a planned transition without applying it.
    pub fn abort(&mut self, plan_id: PlanId) -> Result<(), AbortError> {
        let plan = self.pending.as_ref().ok_or(AbortError::NoPending)?;

        if plan.id != plan_id {
            return Err(AbortError::IdMismatch {
                expected: plan.id,
                got: plan_id,
            });
        }

        self.pending = None;
        Ok(())
    }

    /// Plan and apply in one step for transitions with no I/O in between.
    pub fn transition(&mut self, event: AttemptEvent) -> Result<AttemptStatus, PlanError> {
        let plan = self.plan(event)?;
        self.pending = None;
        self.status = plan.to;
        self.version += 1;
        Ok(self.status)
    }

    fn compute_transition(&self, event: AttemptEvent) -> Result<AttemptStatus, InvalidTransition> {
        use AttemptEvent as E;
        use AttemptStatus as S;

        let next = match (self.status, event) {
            (S::NotStarted, E::Start) => S::InProgress,
            (S::NotStarted, E::ServerCompleted) => S::Submitted,
            (S::InProgress, E::BeginReconcile) => S::Reconciling,
            (S::Reconciling, E::Reconciled) => S::InProgress,
            (S::InProgress, E::Finalize(_)) => S::Finalizing,
            // The deadline cannot be held back by a replay in flight.
            (S::Reconciling, E::Finalize(FinalizeReason::Deadline)) => S::Finalizing,
            (S::Finalizing, E::Submitted) => S::Submitted,
            (S::InProgress | S::Reconciling | S::Finalizing, E::ServerExpired) => S::Expired,
            (S::InProgress | S::Reconciling | S::Finalizing, E::ServerCompleted) => S::Submitted,
            (from, event) => return Err(InvalidTransition { from, event }),
        };

        Ok(next)
    }
}
