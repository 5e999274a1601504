//! Answer persistence with bounded retries and last-write-wins per question.
//!
//! At most one delivery per question is on the wire at any time. A newer save for a question
//! whose delivery is still running replaces the queued payload; the running delivery notices
//! the newer generation before its next attempt and stops, and the newest payload is sent as
//! soon as the wire is free. The server therefore never receives an older payload after a
//! newer one, and a stale acknowledgment is never reported as success.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use indexmap::IndexMap;
use tokio::{task::AbortHandle, time::{sleep, timeout}};
use tracing::{debug, warn};

use crate::{
    config::RetryPolicy,
    dao::{
        api::{ApiError, AssessmentApi},
        models::SaveAnswerRequest,
    },
};

/// One answer on its way to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSave {
    /// Question key on the server.
    pub question_id: String,
    /// Question position, used for the answered set.
    pub question_index: usize,
    /// Selected choices, ascending.
    pub selected_choice_indices: Vec<usize>,
    /// Accumulated viewing time.
    pub time_spent_seconds: u64,
    /// Attempts made so far by the current delivery.
    pub attempt_count: u32,
    /// Monotonic sequence number assigned by the queue.
    pub generation: u64,
}

impl PendingSave {
    /// Build a save that has not been sequenced yet.
    pub fn new(
        question_id: impl Into<String>,
        question_index: usize,
        selected_choice_indices: Vec<usize>,
        time_spent_seconds: u64,
    ) -> Self {
        Self {
            question_id: question_id.into(),
            question_index,
            selected_choice_indices,
            time_spent_seconds,
            attempt_count: 0,
            generation: 0,
        }
    }

    fn request(&self) -> SaveAnswerRequest {
        SaveAnswerRequest {
            question_id: self.question_id.clone(),
            selected_choice_indices: self.selected_choice_indices.clone(),
            time_spent_seconds: self.time_spent_seconds,
        }
    }
}

/// How a delivery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The server acknowledged the payload.
    Acknowledged,
    /// Every attempt in the budget failed transiently.
    Exhausted,
    /// A newer save for the same question arrived; this one stopped early.
    Superseded,
    /// The server refused with an authoritative rejection.
    Rejected(ApiError),
}

impl SaveOutcome {
    /// The boolean contract of a save: true only once acknowledged.
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, SaveOutcome::Acknowledged)
    }
}

/// Result of a delivery, routed back to the queue owner.
#[derive(Debug, Clone)]
pub struct SaveReport {
    /// The delivered save, with its final attempt count.
    pub save: PendingSave,
    /// How it ended.
    pub outcome: SaveOutcome,
}

/// What the queue owner must do after a delivery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The newest payload for the question is persisted.
    Acknowledged {
        /// Question position.
        question_index: usize,
    },
    /// The newest payload exhausted its budget and stays pending.
    Exhausted {
        /// Question position.
        question_index: usize,
    },
    /// The report was stale; the newest payload must be delivered next.
    Dispatch(PendingSave),
    /// The server ended the attempt.
    Rejected(ApiError),
    /// Nothing to do (unknown question or already settled).
    Ignored,
}

#[derive(Debug)]
struct SaveSlot {
    latest: PendingSave,
    latest_generation: Arc<AtomicU64>,
    in_flight: Option<u64>,
    abort: Option<AbortHandle>,
    acknowledged: Option<u64>,
    exhausted: bool,
}

impl SaveSlot {
    fn is_settled(&self) -> bool {
        self.acknowledged == Some(self.latest.generation)
    }
}

/// Per-question registry of the newest save and its delivery state.
#[derive(Debug, Default)]
pub struct SaveQueue {
    slots: IndexMap<String, SaveSlot>,
    sequence: u64,
}

impl SaveQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `save` as the newest payload for its question.
    ///
    /// Returns the save to deliver now, or `None` when a delivery for the question is already
    /// running (the newest payload follows once it ends).
    pub fn enqueue(&mut self, mut save: PendingSave) -> Option<PendingSave> {
        self.sequence += 1;
        save.generation = self.sequence;
        save.attempt_count = 0;

        let slot = self
            .slots
            .entry(save.question_id.clone())
            .or_insert_with(|| SaveSlot {
                latest: save.clone(),
                latest_generation: Arc::new(AtomicU64::new(0)),
                in_flight: None,
                abort: None,
                acknowledged: None,
                exhausted: false,
            });

        slot.latest = save.clone();
        slot.latest_generation.store(save.generation, Ordering::SeqCst);

        if slot.in_flight.is_some() {
            debug!(
                question_id = %save.question_id,
                generation = save.generation,
                "save queued behind running delivery"
            );
            return None;
        }

        slot.in_flight = Some(save.generation);
        Some(save)
    }

    /// Shared handle a delivery polls to detect that it has been superseded.
    pub fn generation_handle(&self, question_id: &str) -> Option<Arc<AtomicU64>> {
        self.slots
            .get(question_id)
            .map(|slot| slot.latest_generation.clone())
    }

    /// Remember the task running the delivery so it can be cancelled.
    pub fn attach(&mut self, question_id: &str, abort: AbortHandle) {
        if let Some(slot) = self.slots.get_mut(question_id) {
            slot.abort = Some(abort);
        }
    }

    /// Keep a save that was not handed to the wire (e.g. while offline) as pending.
    pub fn park(&mut self, question_id: &str) {
        if let Some(slot) = self.slots.get_mut(question_id) {
            slot.in_flight = None;
            slot.abort = None;
            if !slot.is_settled() {
                slot.exhausted = true;
            }
        }
    }

    /// Fold a finished delivery back into the queue.
    pub fn complete(&mut self, report: SaveReport) -> Completion {
        let Some(slot) = self.slots.get_mut(&report.save.question_id) else {
            return Completion::Ignored;
        };
        if slot.in_flight != Some(report.save.generation) {
            return Completion::Ignored;
        }
        slot.in_flight = None;
        slot.abort = None;

        let current = report.save.generation == slot.latest.generation;
        match (current, report.outcome) {
            (_, SaveOutcome::Rejected(err)) => Completion::Rejected(err),
            (true, SaveOutcome::Acknowledged) => {
                slot.acknowledged = Some(report.save.generation);
                slot.exhausted = false;
                Completion::Acknowledged {
                    question_index: report.save.question_index,
                }
            }
            (true, SaveOutcome::Exhausted | SaveOutcome::Superseded) => {
                slot.exhausted = true;
                Completion::Exhausted {
                    question_index: report.save.question_index,
                }
            }
            (false, outcome) => {
                debug!(
                    question_id = %report.save.question_id,
                    stale = report.save.generation,
                    latest = slot.latest.generation,
                    ?outcome,
                    "discarding stale save result"
                );
                slot.in_flight = Some(slot.latest.generation);
                Completion::Dispatch(slot.latest.clone())
            }
        }
    }

    /// Hand out every pending save that has no delivery running.
    pub fn take_pending(&mut self) -> Vec<PendingSave> {
        self.slots
            .values_mut()
            .filter(|slot| slot.in_flight.is_none() && slot.exhausted)
            .map(|slot| {
                slot.in_flight = Some(slot.latest.generation);
                slot.latest.clone()
            })
            .collect()
    }

    /// Cancel the running deliveries of unacknowledged saves and hand out every
    /// unacknowledged payload again, so it can be resent under another policy.
    ///
    /// Restarted payloads get a fresh generation: reports from the cancelled deliveries are
    /// discarded, and a delivery that escaped cancellation stops before its next attempt.
    pub fn restart_unacknowledged(&mut self) -> Vec<PendingSave> {
        let mut restarted = Vec::new();
        for slot in self.slots.values_mut().filter(|slot| !slot.is_settled()) {
            if let Some(abort) = slot.abort.take() {
                abort.abort();
            }
            self.sequence += 1;
            slot.latest.generation = self.sequence;
            slot.latest.attempt_count = 0;
            slot.latest_generation.store(self.sequence, Ordering::SeqCst);
            slot.in_flight = Some(self.sequence);
            restarted.push(slot.latest.clone());
        }
        restarted
    }

    /// Whether some question's newest save exhausted its budget unconfirmed.
    pub fn has_pending(&self) -> bool {
        self.slots.values().any(|slot| slot.exhausted)
    }

    /// Number of deliveries running.
    pub fn in_flight(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.in_flight.is_some())
            .count()
    }

    /// Number of questions whose newest payload is not acknowledged.
    pub fn unacknowledged(&self) -> usize {
        self.slots.values().filter(|slot| !slot.is_settled()).count()
    }

    /// Cancel every running delivery.
    pub fn abort_all(&mut self) {
        for slot in self.slots.values_mut() {
            if let Some(abort) = slot.abort.take() {
                abort.abort();
            }
            slot.in_flight = None;
        }
    }
}

/// Deliver one save, retrying transient failures with linear backoff.
///
/// Stops early when `latest_generation` moves past the save's own generation.
pub async fn save(
    api: Arc<dyn AssessmentApi>,
    attempt_id: String,
    mut pending: PendingSave,
    policy: RetryPolicy,
    latest_generation: Arc<AtomicU64>,
) -> SaveReport {
    for attempt in 1..=policy.max_attempts {
        if latest_generation.load(Ordering::SeqCst) != pending.generation {
            return SaveReport {
                save: pending,
                outcome: SaveOutcome::Superseded,
            };
        }

        pending.attempt_count = attempt;
        let call = api.save_answer(&attempt_id, pending.request());
        match timeout(policy.request_timeout, call).await {
            Ok(Ok(())) => {
                debug!(
                    attempt_id = %attempt_id,
                    question_id = %pending.question_id,
                    attempt,
                    "answer saved"
                );
                return SaveReport {
                    save: pending,
                    outcome: SaveOutcome::Acknowledged,
                };
            }
            Ok(Err(err)) if err.is_authoritative() => {
                warn!(
                    attempt_id = %attempt_id,
                    question_id = %pending.question_id,
                    error = %err,
                    "server rejected answer"
                );
                return SaveReport {
                    save: pending,
                    outcome: SaveOutcome::Rejected(err),
                };
            }
            Ok(Err(err)) => {
                warn!(
                    question_id = %pending.question_id,
                    attempt,
                    error = %err,
                    "answer save attempt failed"
                );
            }
            Err(_) => {
                warn!(
                    question_id = %pending.question_id,
                    attempt,
                    "answer save attempt timed out"
                );
            }
        }

        if attempt < policy.max_attempts {
            sleep(policy.backoff(attempt)).await;
        }
    }

    SaveReport {
        save: pending,
        outcome: SaveOutcome::Exhausted,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dao::memory::{ApiCall, AssessmentFixture, InMemoryAssessmentApi};

    fn answer(question: usize, selected: Vec<usize>) -> PendingSave {
        PendingSave::new(format!("q{}", question + 1), question, selected, 3)
    }

    fn report(save: PendingSave, outcome: SaveOutcome) -> SaveReport {
        SaveReport { save, outcome }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_step: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn newer_save_waits_behind_running_delivery() {
        let mut queue = SaveQueue::new();
        let first = queue.enqueue(answer(0, vec![1])).unwrap();
        assert!(queue.enqueue(answer(0, vec![2])).is_none());
        assert_eq!(queue.in_flight(), 1);

        let next = queue.complete(report(first, SaveOutcome::Acknowledged));
        let Completion::Dispatch(next) = next else {
            panic!("expected the newest payload to be dispatched, got {next:?}");
        };
        assert_eq!(next.selected_choice_indices, vec![2]);

        let done = queue.complete(report(next, SaveOutcome::Acknowledged));
        assert_eq!(done, Completion::Acknowledged { question_index: 0 });
        assert_eq!(queue.unacknowledged(), 0);
    }

    #[test]
    fn stale_acknowledgment_is_not_success() {
        let mut queue = SaveQueue::new();
        let first = queue.enqueue(answer(0, vec![1])).unwrap();
        queue.enqueue(answer(0, vec![3]));

        let completion = queue.complete(report(first, SaveOutcome::Acknowledged));
        assert!(matches!(completion, Completion::Dispatch(_)));
        assert_eq!(queue.unacknowledged(), 1);
    }

    #[test]
    fn exhausted_save_stays_pending_until_replayed() {
        let mut queue = SaveQueue::new();
        let save = queue.enqueue(answer(1, vec![0])).unwrap();

        let completion = queue.complete(report(save, SaveOutcome::Exhausted));
        assert_eq!(completion, Completion::Exhausted { question_index: 1 });
        assert!(queue.has_pending());

        let replay = queue.take_pending();
        assert_eq!(replay.len(), 1);
        assert!(queue.take_pending().is_empty());
        assert!(queue.has_pending());

        queue.complete(report(replay[0].clone(), SaveOutcome::Acknowledged));
        assert!(!queue.has_pending());
    }

    #[test]
    fn parked_save_is_pending() {
        let mut queue = SaveQueue::new();
        let save = queue.enqueue(answer(0, vec![2])).unwrap();
        queue.park(&save.question_id);

        assert!(queue.has_pending());
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.restart_unacknowledged().len(), 1);
    }

    #[test]
    fn restart_discards_reports_of_the_running_delivery() {
        let mut queue = SaveQueue::new();
        let running = queue.enqueue(answer(0, vec![1])).unwrap();
        let done = queue.enqueue(answer(1, vec![0])).unwrap();
        queue.complete(report(done, SaveOutcome::Acknowledged));
        let latest = queue.generation_handle("q1").unwrap();

        let restarted = queue.restart_unacknowledged();
        assert_eq!(restarted.len(), 1);
        assert_eq!(restarted[0].selected_choice_indices, vec![1]);
        assert!(restarted[0].generation > running.generation);
        assert_eq!(latest.load(Ordering::SeqCst), restarted[0].generation);
        assert_eq!(queue.in_flight(), 1);

        assert_eq!(
            queue.complete(report(running, SaveOutcome::Acknowledged)),
            Completion::Ignored
        );
        assert_eq!(queue.in_flight(), 1);
        assert_eq!(
            queue.complete(report(restarted[0].clone(), SaveOutcome::Acknowledged)),
            Completion::Acknowledged { question_index: 0 }
        );
        assert_eq!(queue.unacknowledged(), 0);
    }

    #[test]
    fn questions_are_independent() {
        let mut queue = SaveQueue::new();
        let a = queue.enqueue(answer(0, vec![1])).unwrap();
        let b = queue.enqueue(answer(1, vec![2])).unwrap();
        assert_eq!(queue.in_flight(), 2);

        assert_eq!(
            queue.complete(report(b, SaveOutcome::Acknowledged)),
            Completion::Acknowledged { question_index: 1 }
        );
        assert_eq!(
            queue.complete(report(a, SaveOutcome::Exhausted)),
            Completion::Exhausted { question_index: 0 }
        );
    }

    #[test]
    fn unknown_report_is_ignored() {
        let mut queue = SaveQueue::new();
        let completion = queue.complete(report(answer(4, vec![0]), SaveOutcome::Acknowledged));
        assert_eq!(completion, Completion::Ignored);
    }

    async fn started() -> (InMemoryAssessmentApi, String) {
        let api = InMemoryAssessmentApi::new()
            .with_assessment("quiz", AssessmentFixture::sample(3, Duration::from_secs(600)));
        let attempt = api.start_attempt("quiz").await.unwrap();
        (api, attempt.attempt_id)
    }

    #[tokio::test(start_paused = true)]
    async fn save_retries_then_exhausts() {
        let (api, attempt_id) = started().await;
        api.set_offline(true);

        let mut queue = SaveQueue::new();
        let pending = queue.enqueue(answer(0, vec![1])).unwrap();
        let handle = queue.generation_handle("q1").unwrap();

        let begun = tokio::time::Instant::now();
        let report = save(Arc::new(api.clone()), attempt_id.clone(), pending, policy(), handle).await;

        assert_eq!(report.outcome, SaveOutcome::Exhausted);
        assert_eq!(report.save.attempt_count, 3);
        assert_eq!(begun.elapsed(), Duration::from_secs(3));
        assert_eq!(api.save_calls(&attempt_id, "q1"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_acknowledgment_is_replayed_harmlessly() {
        let (api, attempt_id) = started().await;
        api.lose_next_acks(1);

        let mut queue = SaveQueue::new();
        let pending = queue.enqueue(answer(0, vec![2])).unwrap();
        let handle = queue.generation_handle("q1").unwrap();
        let report = save(Arc::new(api.clone()), attempt_id.clone(), pending, policy(), handle).await;

        assert!(report.outcome.is_acknowledged());
        assert_eq!(report.save.attempt_count, 2);
        assert_eq!(
            api.persisted_answer(&attempt_id, "q1").unwrap().selected,
            vec![2]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_delivery_stops_before_next_attempt() {
        let (api, attempt_id) = started().await;
        api.set_offline(true);

        let mut queue = SaveQueue::new();
        let pending = queue.enqueue(answer(0, vec![1])).unwrap();
        let handle = queue.generation_handle("q1").unwrap();
        let task = tokio::spawn(save(
            Arc::new(api.clone()),
            attempt_id.clone(),
            pending,
            policy(),
            handle,
        ));

        tokio::time::sleep(Duration::from_millis(500)).await;
        queue.enqueue(answer(0, vec![3]));

        let report = task.await.unwrap();
        assert_eq!(report.outcome, SaveOutcome::Superseded);
        assert_eq!(report.save.attempt_count, 1);
        assert_eq!(
            api.calls()
                .iter()
                .filter(|call| matches!(call, ApiCall::Save { .. }))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_attempt_is_rejected_without_retry() {
        let (api, attempt_id) = started().await;
        api.expire_attempt(&attempt_id);

        let mut queue = SaveQueue::new();
        let pending = queue.enqueue(answer(0, vec![1])).unwrap();
        let handle = queue.generation_handle("q1").unwrap();
        let report = save(Arc::new(api.clone()), attempt_id.clone(), pending, policy(), handle).await;

        assert_eq!(report.outcome, SaveOutcome::Rejected(ApiError::AttemptExpired));
        assert_eq!(api.save_calls(&attempt_id, "q1"), 1);
    }
}
