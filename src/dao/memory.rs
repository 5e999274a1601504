//! In-process assessment server used by the demo binary and the engine's tests.
//!
//! The simulation keeps its own deadline per attempt, stores answers idempotently per
//! `(attempt, question)` and journals every call it receives, including calls that fail
//! because the simulated network is down.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime},
};

use futures::future::BoxFuture;
use tokio::time::{Instant, sleep};
use uuid::Uuid;

use crate::{
    dao::{
        api::{ApiError, ApiResult, AssessmentApi},
        models::{
            AttemptStatusEntity, Cardinality, QuestionEntity, SaveAnswerRequest,
            StartedAttemptEntity, SubmitResultEntity,
        },
    },
    dto::snapshot::saved_at,
};

/// Assessment served by the simulation.
#[derive(Debug, Clone)]
pub struct AssessmentFixture {
    /// Ordered questions.
    pub questions: Vec<QuestionEntity>,
    /// Length of the access window granted to each attempt.
    pub duration: Duration,
    /// How long after the deadline late saves are still accepted.
    pub grace: Duration,
    /// Whether the caller may take the assessment at all.
    pub eligible: bool,
    /// Whether a new attempt may be opened after a submitted one.
    pub retake_allowed: bool,
}

impl AssessmentFixture {
    /// Build a fixture of `question_count` four-choice questions; every third one is multi-select.
    pub fn sample(question_count: usize, duration: Duration) -> Self {
        let questions = (0..question_count)
            .map(|index| QuestionEntity {
                id: format!("q{}", index + 1),
                marks: 1,
                cardinality: if index % 3 == 2 {
                    Cardinality::Multiple
                } else {
                    Cardinality::Single
                },
                choices: ["A", "B", "C", "D"].map(String::from).to_vec(),
            })
            .collect();

        Self {
            questions,
            duration,
            grace: Duration::from_secs(5),
            eligible: true,
            retake_allowed: false,
        }
    }
}

/// One call received by the simulated server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    /// `startAttempt`.
    Start {
        /// Assessment requested.
        assessment_id: String,
    },
    /// `saveAnswer`.
    Save {
        /// Target attempt.
        attempt_id: String,
        /// Target question.
        question_id: String,
        /// Selected choices carried by the call.
        selected: Vec<usize>,
    },
    /// `getAttemptStatus`.
    Status {
        /// Target attempt.
        attempt_id: String,
    },
    /// `submitAttempt`.
    Submit {
        /// Target attempt.
        attempt_id: String,
        /// Flag carried by the call.
        auto_submit: bool,
    },
}

/// Answer persisted for one question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAnswer {
    /// Persisted selection.
    pub selected: Vec<usize>,
    /// Persisted time accounting.
    pub time_spent_seconds: u64,
}

#[derive(Debug)]
struct AttemptRecord {
    assessment_id: String,
    questions: Vec<QuestionEntity>,
    deadline: Instant,
    grace: Duration,
    answers: HashMap<String, StoredAnswer>,
    result: Option<SubmitResultEntity>,
    last_saved_at: Option<SystemTime>,
}

impl AttemptRecord {
    fn remaining_seconds(&self) -> u64 {
        self.deadline
            .saturating_duration_since(Instant::now())
            .as_secs()
    }

    fn is_open(&self) -> bool {
        self.result.is_none() && self.remaining_seconds() > 0
    }

    fn accepts_saves(&self) -> bool {
        Instant::now() < self.deadline + self.grace
    }
}

#[derive(Debug, Default)]
struct ServerState {
    assessments: HashMap<String, AssessmentFixture>,
    attempts: HashMap<String, AttemptRecord>,
    offline: bool,
    lost_acks: u32,
    failing_submits: u32,
    save_latency: Duration,
    journal: Vec<ApiCall>,
}

/// Simulated assessment server with fault injection.
#[derive(Clone, Default)]
pub struct InMemoryAssessmentApi {
    state: Arc<Mutex<ServerState>>,
}

impl InMemoryAssessmentApi {
    /// Create an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an assessment.
    pub fn with_assessment(self, assessment_id: impl Into<String>, fixture: AssessmentFixture) -> Self {
        self.lock().assessments.insert(assessment_id.into(), fixture);
        self
    }

    /// Make every subsequent call fail as unreachable (or succeed again).
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Persist the next `count` saves but drop their acknowledgments.
    pub fn lose_next_acks(&self, count: u32) {
        self.lock().lost_acks = count;
    }

    /// Fail the next `count` terminal calls with a transient error.
    pub fn fail_next_submits(&self, count: u32) {
        self.lock().failing_submits = count;
    }

    /// Delay every save by `latency` before it reaches the store.
    pub fn set_save_latency(&self, latency: Duration) {
        self.lock().save_latency = latency;
    }

    /// Close an attempt on the server side right now, without grace.
    pub fn expire_attempt(&self, attempt_id: &str) {
        if let Some(record) = self.lock().attempts.get_mut(attempt_id) {
            record.deadline = Instant::now();
            record.grace = Duration::ZERO;
        }
    }

    /// Selection persisted for `question_id`, if any.
    pub fn persisted_answer(&self, attempt_id: &str, question_id: &str) -> Option<StoredAnswer> {
        self.lock()
            .attempts
            .get(attempt_id)
            .and_then(|record| record.answers.get(question_id).cloned())
    }

    /// Every call received so far, in arrival order.
    pub fn calls(&self) -> Vec<ApiCall> {
        self.lock().journal.clone()
    }

    /// Number of terminal calls received for `attempt_id`.
    pub fn submit_calls(&self, attempt_id: &str) -> usize {
        self.lock()
            .journal
            .iter()
            .filter(|call| matches!(call, ApiCall::Submit { attempt_id: id, .. } if id == attempt_id))
            .count()
    }

    /// Number of saves received for `question_id` of `attempt_id`.
    pub fn save_calls(&self, attempt_id: &str, question_id: &str) -> usize {
        self.lock()
            .journal
            .iter()
            .filter(|call| {
                matches!(
                    call,
                    ApiCall::Save { attempt_id: a, question_id: q, .. }
                        if a == attempt_id && q == question_id
                )
            })
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn receive(&self, call: ApiCall) -> ApiResult<MutexGuard<'_, ServerState>> {
        let mut guard = self.lock();
        guard.journal.push(call);
        if guard.offline {
            return Err(ApiError::Unreachable("simulated network outage".into()));
        }
        Ok(guard)
    }
}

impl AssessmentApi for InMemoryAssessmentApi {
    fn start_attempt(
        &self,
        assessment_id: &str,
    ) -> BoxFuture<'static, ApiResult<StartedAttemptEntity>> {
        let api = self.clone();
        let assessment_id = assessment_id.to_string();
        Box::pin(async move {
            let mut guard = api.receive(ApiCall::Start {
                assessment_id: assessment_id.clone(),
            })?;
            let state = &mut *guard;

            let fixture = state
                .assessments
                .get(&assessment_id)
                .ok_or(ApiError::NotEligible)?;
            if !fixture.eligible {
                return Err(ApiError::NotEligible);
            }

            let mut completed = false;
            for (attempt_id, record) in &state.attempts {
                if record.assessment_id != assessment_id {
                    continue;
                }
                if record.is_open() {
                    return Ok(StartedAttemptEntity {
                        attempt_id: attempt_id.clone(),
                        remaining_seconds: record.remaining_seconds(),
                        questions: record.questions.clone(),
                    });
                }
                completed = true;
            }
            if completed && !fixture.retake_allowed {
                return Err(ApiError::AlreadyCompleted);
            }

            let attempt_id = Uuid::new_v4().to_string();
            let record = AttemptRecord {
                assessment_id,
                questions: fixture.questions.clone(),
                deadline: Instant::now() + fixture.duration,
                grace: fixture.grace,
                answers: HashMap::new(),
                result: None,
                last_saved_at: None,
            };
            let started = StartedAttemptEntity {
                attempt_id: attempt_id.clone(),
                remaining_seconds: record.remaining_seconds(),
                questions: record.questions.clone(),
            };
            state.attempts.insert(attempt_id, record);
            Ok(started)
        })
    }

    fn save_answer(
        &self,
        attempt_id: &str,
        answer: SaveAnswerRequest,
    ) -> BoxFuture<'static, ApiResult<()>> {
        let api = self.clone();
        let attempt_id = attempt_id.to_string();
        Box::pin(async move {
            let latency = api.lock().save_latency;
            if !latency.is_zero() {
                sleep(latency).await;
            }

            let mut guard = api.receive(ApiCall::Save {
                attempt_id: attempt_id.clone(),
                question_id: answer.question_id.clone(),
                selected: answer.selected_choice_indices.clone(),
            })?;
            let state = &mut *guard;

            let record = state
                .attempts
                .get_mut(&attempt_id)
                .ok_or(ApiError::AttemptExpired)?;
            if record.result.is_some() {
                return Err(ApiError::AlreadyCompleted);
            }
            if !record.accepts_saves() {
                return Err(ApiError::AttemptExpired);
            }

            record.answers.insert(
                answer.question_id,
                StoredAnswer {
                    selected: answer.selected_choice_indices,
                    time_spent_seconds: answer.time_spent_seconds,
                },
            );
            record.last_saved_at = Some(SystemTime::now());

            if state.lost_acks > 0 {
                state.lost_acks -= 1;
                return Err(ApiError::Unreachable("acknowledgment lost".into()));
            }
            Ok(())
        })
    }

    fn get_attempt_status(
        &self,
        attempt_id: &str,
    ) -> BoxFuture<'static, ApiResult<AttemptStatusEntity>> {
        let api = self.clone();
        let attempt_id = attempt_id.to_string();
        Box::pin(async move {
            let guard = api.receive(ApiCall::Status {
                attempt_id: attempt_id.clone(),
            })?;
            let record = guard
                .attempts
                .get(&attempt_id)
                .ok_or(ApiError::AttemptExpired)?;

            Ok(AttemptStatusEntity {
                remaining_seconds: record.remaining_seconds(),
                can_continue: record.is_open(),
                last_saved_at: record.last_saved_at.map(saved_at),
            })
        })
    }

    fn submit_attempt(
        &self,
        attempt_id: &str,
        auto_submit: bool,
    ) -> BoxFuture<'static, ApiResult<SubmitResultEntity>> {
        let api = self.clone();
        let attempt_id = attempt_id.to_string();
        Box::pin(async move {
            let mut guard = api.receive(ApiCall::Submit {
                attempt_id: attempt_id.clone(),
                auto_submit,
            })?;
            let state = &mut *guard;

            if state.failing_submits > 0 {
                state.failing_submits -= 1;
                return Err(ApiError::Status {
                    path: format!("attempts/{attempt_id}/submit"),
                    status: 503,
                });
            }

            let record = state
                .attempts
                .get_mut(&attempt_id)
                .ok_or(ApiError::NotEligible)?;
            if let Some(result) = &record.result {
                return Ok(result.clone());
            }

            let result = SubmitResultEntity {
                attempt_id,
                auto_submit,
                answered_count: u32::try_from(record.answers.len()).unwrap_or(u32::MAX),
                submitted_at: Some(saved_at(SystemTime::now())),
            };
            record.result = Some(result.clone());
            Ok(result)
        })
    }
}
