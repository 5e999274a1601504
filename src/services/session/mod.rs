//! Session controller: the single owner of an attempt's state.
//!
//! Every trigger (student input, clock ticks, periodic flushes, platform signals and the
//! completion of background I/O) is turned into a command and funneled through one
//! mailbox. The controller task handles commands one at a time, so mutations of the attempt are
//! serialized while saves, status fetches and the terminal call run concurrently as detached
//! tasks that report back through the same mailbox.
//!
//! Consumers drive the session through a cloneable [`SessionHandle`] and observe it through a
//! `watch` channel of [`SessionSnapshot`]s published after every command.

use std::{sync::Arc, time::SystemTime};

use tokio::{
    sync::{mpsc, oneshot, watch},
    task::AbortHandle,
    time::{Duration, Instant, sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    config::EngineConfig,
    dao::{
        api::{ApiError, ApiResult, AssessmentApi},
        models::{AttemptStatusEntity, StartedAttemptEntity, SubmitResultEntity},
    },
    dto::snapshot::{SessionSnapshot, saved_at},
    error::{SessionError, SubmitRejection},
    services::{
        clock::{Clock, ClockTick, Ticker},
        finalizer::{self, FinalizeStage, SubmissionFinalizer},
        network::{NetworkMonitor, NetworkSignal, Trigger},
        save_queue::{self, Completion, PendingSave, SaveQueue, SaveReport},
    },
    state::{
        AttemptEvent, AttemptStatus, FinalizeReason, PlanId, SessionAttempt,
        answers::AnswerStore, question::AssessmentDefinition,
    },
};

#[cfg(test)]
mod tests;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Navigation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Navigation {
    /// The following question; stays put on the last one.
    Next,
    /// The preceding question; stays put on the first one.
    Previous,
    /// An explicit position.
    Jump(usize),
}

#[derive(Debug)]
enum Command {
    Start {
        assessment_id: String,
        reply: Reply<SessionSnapshot>,
    },
    Started {
        plan_id: PlanId,
        result: ApiResult<StartedAttemptEntity>,
    },
    Select {
        question_index: usize,
        choices: Vec<usize>,
        reply: Reply<Vec<usize>>,
    },
    Navigate {
        target: Navigation,
        reply: Reply<usize>,
    },
    Submit {
        reply: Reply<()>,
    },
    Signal(NetworkSignal),
    Tick,
    Flush,
    SaveFinished(SaveReport),
    StatusFetched(ApiResult<AttemptStatusEntity>),
    ReconcileRetry,
    SubmitFinished(ApiResult<SubmitResultEntity>),
    SubmitStalled,
    Shutdown,
}

/// Cloneable front door to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Spawn the controller task for a new session and return its handle.
    ///
    /// The controller keeps running while a handle, a running timer or a background call is
    /// alive: an attempt whose handles were all dropped still reaches its deadline and submits.
    pub fn spawn(api: Arc<dyn AssessmentApi>, config: EngineConfig) -> Self {
        let (commands, mailbox) = mpsc::unbounded_channel();
        let (snapshots_tx, snapshots) = watch::channel(SessionSnapshot::not_started());

        let controller = SessionController {
            api,
            config,
            mailbox: commands.downgrade(),
            finalize_mailbox: None,
            attempt: SessionAttempt::default(),
            definition: AssessmentDefinition::default(),
            answers: None,
            queue: SaveQueue::new(),
            monitor: NetworkMonitor::new(),
            clock: Clock::new(),
            clock_ticker: None,
            flush_ticker: None,
            finalizer: SubmissionFinalizer::new(),
            start_reply: None,
            reconcile_in_flight: false,
            reconcile_delay: None,
            support_required: false,
            last_saved_at: None,
            result: None,
            snapshots: snapshots_tx,
        };
        tokio::spawn(controller.run(mailbox));

        Self {
            commands,
            snapshots,
        }
    }

    /// Open (or resume) the attempt for `assessment_id`.
    pub async fn start(&self, assessment_id: impl Into<String>) -> Result<SessionSnapshot, SessionError> {
        let assessment_id = assessment_id.into();
        self.request(|reply| Command::Start {
            assessment_id,
            reply,
        })
        .await
    }

    /// Edit the selection of the displayed question; returns the resulting selection.
    pub async fn select(
        &self,
        question_index: usize,
        choices: impl Into<Vec<usize>>,
    ) -> Result<Vec<usize>, SessionError> {
        let choices = choices.into();
        self.request(|reply| Command::Select {
            question_index,
            choices,
            reply,
        })
        .await
    }

    /// Move to the next question; returns the displayed index.
    pub async fn next(&self) -> Result<usize, SessionError> {
        self.navigate(Navigation::Next).await
    }

    /// Move to the previous question; returns the displayed index.
    pub async fn previous(&self) -> Result<usize, SessionError> {
        self.navigate(Navigation::Previous).await
    }

    /// Move to question `index`; returns the displayed index.
    pub async fn jump(&self, index: usize) -> Result<usize, SessionError> {
        self.navigate(Navigation::Jump(index)).await
    }

    /// Navigate without waiting on any save.
    pub async fn navigate(&self, target: Navigation) -> Result<usize, SessionError> {
        self.request(|reply| Command::Navigate { target, reply }).await
    }

    /// Submit explicitly. Resolves once finalization has begun; follow the snapshots (or
    /// [`SessionHandle::wait_until_closed`]) for the outcome of the terminal call.
    pub async fn submit(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Submit { reply }).await
    }

    /// Feed a platform connectivity or visibility signal.
    pub fn signal(&self, signal: NetworkSignal) -> Result<(), SessionError> {
        self.commands
            .send(Command::Signal(signal))
            .map_err(|_| SessionError::EngineStopped)
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Subscribe to snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until the attempt is closed and its terminal call, if any, has resolved.
    ///
    /// Fails with [`SessionError::TerminalCallStalled`] as soon as the terminal call has failed
    /// often enough that the student should contact support; the engine keeps retrying.
    pub async fn wait_until_closed(&self) -> Result<SessionSnapshot, SessionError> {
        let mut snapshots = self.snapshots.clone();
        let snapshot = snapshots
            .wait_for(|snapshot| snapshot.is_final() || snapshot.support_required)
            .await
            .map_err(|_| SessionError::EngineStopped)?
            .clone();
        if snapshot.is_final() {
            Ok(snapshot)
        } else {
            Err(SessionError::TerminalCallStalled)
        }
    }

    /// Stop the controller. Pending local work is abandoned.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SessionError::EngineStopped)?;
        response.await.map_err(|_| SessionError::EngineStopped)?
    }
}

struct SessionController {
    api: Arc<dyn AssessmentApi>,
    config: EngineConfig,
    mailbox: mpsc::WeakUnboundedSender<Command>,
    /// Strong sender held from the start of finalization until the terminal call resolves.
    finalize_mailbox: Option<mpsc::UnboundedSender<Command>>,
    attempt: SessionAttempt,
    definition: AssessmentDefinition,
    answers: Option<AnswerStore>,
    queue: SaveQueue,
    monitor: NetworkMonitor,
    clock: Clock,
    clock_ticker: Option<Ticker>,
    flush_ticker: Option<Ticker>,
    finalizer: SubmissionFinalizer,
    start_reply: Option<Reply<SessionSnapshot>>,
    reconcile_in_flight: bool,
    reconcile_delay: Option<Duration>,
    support_required: bool,
    last_saved_at: Option<String>,
    result: Option<SubmitResultEntity>,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl SessionController {
    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = mailbox.recv().await {
            if matches!(command, Command::Shutdown) {
                info!("session shutting down");
                break;
            }
            self.handle(command);
            self.publish();
        }

        self.queue.abort_all();
        self.stop_tickers();
        debug!("session controller stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Start {
                assessment_id,
                reply,
            } => self.start(assessment_id, reply),
            Command::Started { plan_id, result } => self.on_started(plan_id, result),
            Command::Select {
                question_index,
                choices,
                reply,
            } => {
                let _ = reply.send(self.select(question_index, &choices));
            }
            Command::Navigate { target, reply } => {
                let _ = reply.send(self.navigate(target));
            }
            Command::Submit { reply } => {
                let _ = reply.send(self.submit());
            }
            Command::Signal(signal) => self.on_signal(signal),
            Command::Tick => self.on_tick(),
            Command::Flush => self.on_flush(),
            Command::SaveFinished(report) => self.on_save_finished(report),
            Command::StatusFetched(result) => self.on_status_fetched(result),
            Command::ReconcileRetry => self.reconcile(),
            Command::SubmitFinished(result) => self.on_submit_finished(result),
            Command::SubmitStalled => {
                if self.finalizer.stage() == FinalizeStage::Submitting {
                    self.support_required = true;
                }
            }
            Command::Shutdown => {}
        }
    }

    fn start(&mut self, assessment_id: String, reply: Reply<SessionSnapshot>) {
        let status = self.attempt.status();
        if status != AttemptStatus::NotStarted || self.attempt.machine.pending().is_some() {
            let err = if status.is_terminal() {
                SessionError::Finalized(status)
            } else {
                SessionError::InvalidState("session already started".into())
            };
            let _ = reply.send(Err(err));
            return;
        }

        let plan_id = match self.attempt.machine.plan(AttemptEvent::Start) {
            Ok(plan) => plan.id,
            Err(err) => {
                let _ = reply.send(Err(err.into()));
                return;
            }
        };

        info!(%assessment_id, "starting attempt");
        let api = self.api.clone();
        let budget = self.config.save.request_timeout;
        let spawned = self.spawn_task(async move {
            let result = timeout(budget, api.start_attempt(&assessment_id))
                .await
                .unwrap_or(Err(ApiError::Timeout));
            Command::Started { plan_id, result }
        });

        if spawned.is_some() {
            self.start_reply = Some(reply);
        } else {
            let _ = self.attempt.machine.abort(plan_id);
            let _ = reply.send(Err(SessionError::EngineStopped));
        }
    }

    fn on_started(&mut self, plan_id: PlanId, result: ApiResult<StartedAttemptEntity>) {
        let outcome = match result {
            Ok(started) => self.begin_attempt(plan_id, started),
            Err(err) => {
                if let Err(abort_err) = self.attempt.machine.abort(plan_id) {
                    warn!(error = %abort_err, "failed to abort start plan");
                }
                if err == ApiError::AlreadyCompleted {
                    info!("attempt already submitted on the server");
                    if let Err(invalid) = self.attempt.machine.transition(AttemptEvent::ServerCompleted)
                    {
                        warn!(error = %invalid, "failed to record completed attempt");
                    }
                } else {
                    warn!(error = %err, "failed to start attempt");
                }
                Err(err.into())
            }
        };

        if let Some(reply) = self.start_reply.take() {
            let _ = reply.send(outcome);
        }
    }

    fn begin_attempt(
        &mut self,
        plan_id: PlanId,
        started: StartedAttemptEntity,
    ) -> Result<SessionSnapshot, SessionError> {
        self.attempt.machine.apply(plan_id)?;

        self.definition = AssessmentDefinition::from(started.questions);
        self.answers = Some(AnswerStore::new(0, Instant::now()));
        self.attempt.current_question_index = 0;
        self.attempt.set_remaining(started.remaining_seconds);
        self.clock.start(started.remaining_seconds);
        info!(
            attempt_id = %started.attempt_id,
            remaining_seconds = started.remaining_seconds,
            questions = self.definition.len(),
            total_marks = self.definition.total_marks(),
            "attempt in progress"
        );
        self.attempt.attempt_id = Some(started.attempt_id);

        if started.remaining_seconds == 0 {
            self.on_deadline();
        } else {
            self.start_tickers();
        }
        Ok(self.snapshot())
    }

    fn select(&mut self, question_index: usize, choices: &[usize]) -> Result<Vec<usize>, SessionError> {
        self.ensure_active()?;
        let question = self
            .definition
            .get(question_index)
            .ok_or(SessionError::QuestionOutOfRange {
                index: question_index,
                count: self.definition.len(),
            })?;
        let answers = self.answers.as_mut().ok_or(SessionError::NotStarted)?;
        Ok(answers.set_selection(question_index, choices, question)?)
    }

    fn navigate(&mut self, target: Navigation) -> Result<usize, SessionError> {
        self.ensure_active()?;
        let current = self.attempt.current_question_index;
        let count = self.definition.len();
        let index = match target {
            Navigation::Next => (current + 1).min(count.saturating_sub(1)),
            Navigation::Previous => current.saturating_sub(1),
            Navigation::Jump(index) => index,
        };
        if index >= count {
            return Err(SessionError::QuestionOutOfRange { index, count });
        }
        if index == current {
            return Ok(current);
        }

        self.flush_current();
        if let Some(answers) = self.answers.as_mut() {
            answers.open(index, Instant::now());
        }
        self.attempt.current_question_index = index;
        debug!(from = current, to = index, "question changed");
        Ok(index)
    }

    fn submit(&mut self) -> Result<(), SessionError> {
        match self.attempt.status() {
            AttemptStatus::InProgress => {}
            AttemptStatus::NotStarted => return Err(SessionError::NotStarted),
            AttemptStatus::Reconciling => {
                return Err(SessionError::SubmitRejected(SubmitRejection::Reconciling));
            }
            AttemptStatus::Finalizing => {
                return Err(SessionError::SubmitRejected(SubmitRejection::AlreadyFinalizing));
            }
            status @ (AttemptStatus::Submitted | AttemptStatus::Expired) => {
                return Err(SessionError::Finalized(status));
            }
        }
        if !self.monitor.is_online() {
            return Err(SessionError::SubmitRejected(SubmitRejection::Offline));
        }
        if self.queue.has_pending() {
            return Err(SessionError::SubmitRejected(SubmitRejection::SavePending));
        }

        self.attempt
            .machine
            .transition(AttemptEvent::Finalize(FinalizeReason::UserSubmit))?;
        self.hold_mailbox();
        self.finalizer.begin(false);
        info!("submission requested; draining answers");
        self.start_drain();
        Ok(())
    }

    fn on_signal(&mut self, signal: NetworkSignal) {
        match self.monitor.observe(signal) {
            Some(Trigger::Reconcile) => {
                self.reconcile_delay = None;
                self.reconcile();
            }
            Some(Trigger::Flush) => self.flush_current(),
            Some(Trigger::UnloadFlush) => {
                info!("page unloading; flushing current answer");
                self.flush_current();
            }
            None => {}
        }
    }

    fn on_tick(&mut self) {
        match self.clock.tick() {
            ClockTick::Running(remaining) => self.attempt.set_remaining(remaining),
            ClockTick::Expired => self.on_deadline(),
            ClockTick::Idle => {}
        }
    }

    fn on_flush(&mut self) {
        if !self.attempt.status().is_active() {
            return;
        }
        self.flush_current();
        if self.monitor.is_online() {
            self.replay_pending();
        }
    }

    /// The local countdown reached zero.
    fn on_deadline(&mut self) {
        if self.attempt.status().is_active() {
            self.hold_mailbox();
        }
        self.clock.stop();
        self.attempt.set_remaining(0);
        if let Some(ticker) = self.clock_ticker.take() {
            ticker.stop();
        }

        match self.attempt.status() {
            status if status.is_active() => {
                info!("deadline reached; submitting automatically");
                if let Err(err) = self
                    .attempt
                    .machine
                    .transition(AttemptEvent::Finalize(FinalizeReason::Deadline))
                {
                    warn!(error = %err, "failed to enter finalization at deadline");
                    return;
                }
                self.finalizer.begin(true);
                self.start_drain();
            }
            AttemptStatus::Finalizing => {
                if self.finalizer.stage() == FinalizeStage::Draining {
                    info!("deadline reached while draining; submission becomes automatic");
                }
                self.finalizer.begin(true);
            }
            _ => {}
        }
    }

    fn start_drain(&mut self) {
        if let Some(ticker) = self.flush_ticker.take() {
            ticker.stop();
        }
        for save in self.queue.restart_unacknowledged() {
            self.deliver(save);
        }
        self.flush_current();
        debug!(in_flight = self.queue.in_flight(), "draining answers");
        self.maybe_submit();
    }

    fn maybe_submit(&mut self) {
        if self.attempt.status() != AttemptStatus::Finalizing
            || self.finalizer.stage() != FinalizeStage::Draining
            || self.queue.in_flight() > 0
        {
            return;
        }
        let unconfirmed = self.queue.unacknowledged();
        if unconfirmed > 0 {
            warn!(unconfirmed, "submitting with unconfirmed answers");
        }
        self.issue_terminal_call();
    }

    fn issue_terminal_call(&mut self) {
        let Some(attempt_id) = self.attempt.attempt_id.clone() else {
            return;
        };
        let Some(tx) = self.mailbox.upgrade() else {
            warn!("session mailbox closed; terminal call not issued");
            return;
        };
        let Some(auto_submit) = self.finalizer.claim_terminal_call() else {
            return;
        };

        info!(%attempt_id, auto_submit, "issuing terminal call");
        let api = self.api.clone();
        let policy = self.config.submit;
        let stalled = tx.clone();
        tokio::spawn(async move {
            let result = finalizer::submit(api, attempt_id, auto_submit, policy, move || {
                let _ = stalled.send(Command::SubmitStalled);
            })
            .await;
            let _ = tx.send(Command::SubmitFinished(result));
        });
    }

    fn on_submit_finished(&mut self, result: ApiResult<SubmitResultEntity>) {
        self.finalizer.finish();
        match result {
            Ok(result) => {
                self.stop_tickers();
                self.clock.stop();
                if self.attempt.status() == AttemptStatus::Finalizing {
                    if let Err(err) = self.attempt.machine.transition(AttemptEvent::Submitted) {
                        warn!(error = %err, "failed to record submission");
                    }
                }
                info!(
                    attempt_id = %result.attempt_id,
                    auto_submit = result.auto_submit,
                    status = ?self.attempt.status(),
                    "attempt closed"
                );
                self.support_required = false;
                self.result = Some(result);
            }
            Err(err) => self.on_rejected(err),
        }
        self.finalize_mailbox = None;
    }

    fn on_save_finished(&mut self, report: SaveReport) {
        match self.queue.complete(report) {
            Completion::Acknowledged { question_index } => {
                if self.attempt.mark_answered(question_index) {
                    debug!(question_index, "question answered");
                }
                self.last_saved_at = Some(saved_at(SystemTime::now()));
            }
            Completion::Exhausted { question_index } => {
                warn!(question_index, "answer not confirmed; kept pending");
            }
            Completion::Dispatch(save) => self.deliver(save),
            Completion::Rejected(err) => self.on_rejected(err),
            Completion::Ignored => {}
        }
        self.settle();
    }

    fn reconcile(&mut self) {
        if self.reconcile_in_flight
            || !self.monitor.is_online()
            || !self.attempt.status().is_active()
        {
            return;
        }
        let Some(attempt_id) = self.attempt.attempt_id.clone() else {
            return;
        };

        debug!(%attempt_id, "fetching attempt status");
        let api = self.api.clone();
        let budget = self.config.save.request_timeout;
        self.reconcile_in_flight = self
            .spawn_task(async move {
                let result = timeout(budget, api.get_attempt_status(&attempt_id))
                    .await
                    .unwrap_or(Err(ApiError::Timeout));
                Command::StatusFetched(result)
            })
            .is_some();
    }

    fn on_status_fetched(&mut self, result: ApiResult<AttemptStatusEntity>) {
        self.reconcile_in_flight = false;
        if !self.attempt.status().is_active() {
            return;
        }

        match result {
            Ok(status) => {
                self.reconcile_delay = None;
                if !status.can_continue || status.remaining_seconds == 0 {
                    self.on_server_expired();
                    return;
                }
                self.clock.resync(status.remaining_seconds);
                self.attempt.set_remaining(self.clock.remaining());
                if self.last_saved_at.is_none() {
                    self.last_saved_at = status.last_saved_at;
                }
                self.replay_pending();
            }
            Err(err) if err.is_authoritative() => self.on_rejected(err),
            Err(err) => {
                if !self.monitor.is_online() {
                    return;
                }
                let policy = self.config.reconcile;
                let delay = self
                    .reconcile_delay
                    .map_or(policy.initial_delay, |current| policy.next(current));
                self.reconcile_delay = Some(delay);
                warn!(error = %err, retry_in = ?delay, "status fetch failed; retrying");
                self.spawn_task(async move {
                    sleep(delay).await;
                    Command::ReconcileRetry
                });
            }
        }
    }

    fn replay_pending(&mut self) {
        let pending = self.queue.take_pending();
        if pending.is_empty() {
            return;
        }
        if self.attempt.status() == AttemptStatus::InProgress {
            if let Err(err) = self.attempt.machine.transition(AttemptEvent::BeginReconcile) {
                warn!(error = %err, "failed to enter reconciliation");
            }
        }
        info!(count = pending.len(), "replaying unconfirmed answers");
        for save in pending {
            self.deliver(save);
        }
        self.settle();
    }

    fn settle(&mut self) {
        if self.attempt.status() == AttemptStatus::Reconciling && self.queue.in_flight() == 0 {
            if let Err(err) = self.attempt.machine.transition(AttemptEvent::Reconciled) {
                warn!(error = %err, "failed to leave reconciliation");
            } else {
                info!(pending = self.queue.has_pending(), "reconciliation finished");
            }
        }
        self.maybe_submit();
    }

    fn on_rejected(&mut self, err: ApiError) {
        match err {
            ApiError::AlreadyCompleted => self.on_server_completed(),
            ApiError::AttemptExpired | ApiError::NotEligible => self.on_server_expired(),
            other => warn!(error = %other, "unexpected non-authoritative rejection"),
        }
    }

    /// The server's deadline passed: close locally and record the attempt with one terminal call.
    fn on_server_expired(&mut self) {
        let status = self.attempt.status();
        if status.is_terminal() || status == AttemptStatus::NotStarted {
            return;
        }
        warn!(?status, "server reports the attempt as expired");

        self.queue.abort_all();
        self.clock.stop();
        self.stop_tickers();
        self.attempt.set_remaining(0);
        if let Err(err) = self.attempt.machine.transition(AttemptEvent::ServerExpired) {
            warn!(error = %err, "failed to record server expiry");
            return;
        }
        self.hold_mailbox();
        self.finalizer.begin(true);
        self.issue_terminal_call();
    }

    fn on_server_completed(&mut self) {
        let status = self.attempt.status();
        if status.is_terminal() || status == AttemptStatus::NotStarted {
            return;
        }
        info!(?status, "server reports the attempt as already submitted");

        self.queue.abort_all();
        self.clock.stop();
        self.stop_tickers();
        if let Err(err) = self.attempt.machine.transition(AttemptEvent::ServerCompleted) {
            warn!(error = %err, "failed to record completed attempt");
        }
        if self.finalizer.stage() != FinalizeStage::Idle {
            self.finalizer.finish();
        }
        self.finalize_mailbox = None;
    }

    /// Capture the displayed answer if it changed and hand it to the queue.
    fn flush_current(&mut self) {
        if !self.accepts_saves() {
            return;
        }
        let Some(captured) = self
            .answers
            .as_mut()
            .and_then(|answers| answers.take_unsaved(Instant::now()))
        else {
            return;
        };
        let Some(question) = self.definition.get(captured.question_index) else {
            return;
        };

        let save = PendingSave::new(
            question.id.clone(),
            captured.question_index,
            captured.selected,
            captured.time_spent_seconds,
        );
        if let Some(save) = self.queue.enqueue(save) {
            self.deliver(save);
        }
    }

    fn deliver(&mut self, save: PendingSave) {
        let finalizing = self.attempt.status() == AttemptStatus::Finalizing;
        if !self.accepts_saves() || (!finalizing && !self.monitor.is_online()) {
            debug!(question_id = %save.question_id, "answer kept pending");
            self.queue.park(&save.question_id);
            return;
        }
        let (Some(attempt_id), Some(latest)) = (
            self.attempt.attempt_id.clone(),
            self.queue.generation_handle(&save.question_id),
        ) else {
            self.queue.park(&save.question_id);
            return;
        };

        let policy = if finalizing {
            self.config.drain
        } else {
            self.config.save
        };
        let question_id = save.question_id.clone();
        let api = self.api.clone();
        let spawned = self.spawn_task(async move {
            Command::SaveFinished(save_queue::save(api, attempt_id, save, policy, latest).await)
        });
        match spawned {
            Some(abort) => self.queue.attach(&question_id, abort),
            None => self.queue.park(&question_id),
        }
    }

    fn accepts_saves(&self) -> bool {
        let status = self.attempt.status();
        status.is_active()
            || (status == AttemptStatus::Finalizing
                && self.finalizer.stage() == FinalizeStage::Draining)
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        match self.attempt.status() {
            status if status.is_active() => Ok(()),
            AttemptStatus::NotStarted => Err(SessionError::NotStarted),
            status => Err(SessionError::Finalized(status)),
        }
    }

    /// Keep the mailbox open until the terminal call resolves, even if every handle is gone.
    fn hold_mailbox(&mut self) {
        if self.finalize_mailbox.is_none() {
            self.finalize_mailbox = self.mailbox.upgrade();
        }
    }

    fn start_tickers(&mut self) {
        let Some(tx) = self.mailbox.upgrade() else {
            return;
        };
        self.clock_ticker = Some(Ticker::spawn(self.config.tick_interval, tx.clone(), || {
            Command::Tick
        }));
        self.flush_ticker = Some(Ticker::spawn(self.config.flush_interval, tx, || {
            Command::Flush
        }));
    }

    fn stop_tickers(&mut self) {
        for ticker in [self.clock_ticker.take(), self.flush_ticker.take()]
            .into_iter()
            .flatten()
        {
            ticker.stop();
        }
    }

    /// Run `task` detached and route the command it resolves to back into the mailbox.
    fn spawn_task<F>(&self, task: F) -> Option<AbortHandle>
    where
        F: Future<Output = Command> + Send + 'static,
    {
        let tx = self.mailbox.upgrade()?;
        let handle = tokio::spawn(async move {
            let command = task.await;
            let _ = tx.send(command);
        });
        Some(handle.abort_handle())
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            attempt_id: self.attempt.attempt_id.clone(),
            status: self.attempt.status(),
            version: self.attempt.machine.version(),
            remaining_seconds: self.attempt.remaining_seconds,
            current_question_index: self.attempt.current_question_index,
            question_count: self.definition.len(),
            selection: self
                .answers
                .as_ref()
                .map(AnswerStore::selection)
                .unwrap_or_default(),
            answered: self.attempt.answered.iter().copied().collect(),
            pending_save: self.attempt.pending_save,
            online: self.monitor.is_online(),
            visible: self.monitor.is_visible(),
            auto_submit: (self.finalizer.stage() != FinalizeStage::Idle)
                .then(|| self.finalizer.auto_submit()),
            terminal_call_pending: self.finalizer.stage() == FinalizeStage::Submitting,
            support_required: self.support_required,
            last_saved_at: self.last_saved_at.clone(),
            result: self.result.clone(),
        }
    }

    fn publish(&mut self) {
        self.attempt.pending_save = self.queue.has_pending();
        let snapshot = self.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}
