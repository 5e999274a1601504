use std::sync::Arc;

use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::{
    config::SubmitPolicy,
    dao::{
        api::{ApiError, AssessmentApi},
        models::SubmitResultEntity,
    },
};

/// Progress of the finalize protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalizeStage {
    /// Finalization has not begun.
    #[default]
    Idle,
    /// Waiting for outstanding saves before the terminal call.
    Draining,
    /// The terminal call has been issued; the flag is frozen.
    Submitting,
    /// The terminal call resolved.
    Done,
}

/// Guards the single terminal call of an attempt.
#[derive(Debug, Default)]
pub struct SubmissionFinalizer {
    stage: FinalizeStage,
    auto_submit: bool,
}

impl SubmissionFinalizer {
    /// Create an idle finalizer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stage.
    pub fn stage(&self) -> FinalizeStage {
        self.stage
    }

    /// Flag the terminal call carries (or will carry).
    pub fn auto_submit(&self) -> bool {
        self.auto_submit
    }

    /// Enter the drain stage. Returns false when finalization was already under way.
    ///
    /// A deadline arriving while a user submission is still draining upgrades the flag.
    pub fn begin(&mut self, auto_submit: bool) -> bool {
        match self.stage {
            FinalizeStage::Idle => {
                self.stage = FinalizeStage::Draining;
                self.auto_submit = auto_submit;
                true
            }
            FinalizeStage::Draining => {
                self.auto_submit |= auto_submit;
                false
            }
            FinalizeStage::Submitting | FinalizeStage::Done => false,
        }
    }

    /// Claim the right to issue the terminal call. Succeeds exactly once per attempt.
    pub fn claim_terminal_call(&mut self) -> Option<bool> {
        match self.stage {
            FinalizeStage::Idle | FinalizeStage::Draining => {
                self.stage = FinalizeStage::Submitting;
                Some(self.auto_submit)
            }
            FinalizeStage::Submitting | FinalizeStage::Done => None,
        }
    }

    /// Record that the terminal call resolved.
    pub fn finish(&mut self) {
        self.stage = FinalizeStage::Done;
    }
}

/// Issue the terminal call, retrying transient failures with exponential backoff.
///
/// Transient failures are retried without limit; `on_stall` runs once after
/// `support_after_failures` consecutive failures so the student can be told to contact
/// support. Only an authoritative rejection ends the loop without a result.
pub async fn submit<F>(
    api: Arc<dyn AssessmentApi>,
    attempt_id: String,
    auto_submit: bool,
    policy: SubmitPolicy,
    on_stall: F,
) -> Result<SubmitResultEntity, ApiError>
where
    F: FnOnce() + Send,
{
    let mut on_stall = Some(on_stall);
    let mut delay = policy.backoff.initial_delay;
    let mut failures: u32 = 0;

    loop {
        let call = api.submit_attempt(&attempt_id, auto_submit);
        let err = match timeout(policy.request_timeout, call).await {
            Ok(Ok(result)) => {
                info!(
                    attempt_id = %attempt_id,
                    auto_submit,
                    answered = result.answered_count,
                    "attempt submitted"
                );
                return Ok(result);
            }
            Ok(Err(err)) if err.is_authoritative() => {
                warn!(attempt_id = %attempt_id, error = %err, "terminal call rejected");
                return Err(err);
            }
            Ok(Err(err)) => err,
            Err(_) => ApiError::Timeout,
        };

        failures += 1;
        warn!(
            attempt_id = %attempt_id,
            failures,
            error = %err,
            "terminal call failed; retrying"
        );
        if failures >= policy.support_after_failures {
            if let Some(stall) = on_stall.take() {
                error!(
                    attempt_id = %attempt_id,
                    failures, "terminal call keeps failing; support required"
                );
                stall();
            }
        }

        sleep(delay).await;
        delay = policy.backoff.next(delay);
    }
}
