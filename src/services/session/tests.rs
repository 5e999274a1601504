use std::{sync::Arc, time::Duration};

use tokio::time::{Instant, sleep};

use super::SessionHandle;
use crate::{
    config::EngineConfig,
    dao::{
        api::ApiError,
        memory::{ApiCall, AssessmentFixture, InMemoryAssessmentApi},
    },
    error::{SessionError, SubmitRejection},
    services::network::NetworkSignal,
    state::{AttemptStatus, answers::SelectionError},
};

const QUIZ: &str = "quiz";

fn server(question_count: usize, duration_secs: u64) -> InMemoryAssessmentApi {
    InMemoryAssessmentApi::new().with_assessment(
        QUIZ,
        AssessmentFixture::sample(question_count, Duration::from_secs(duration_secs)),
    )
}

async fn started(api: &InMemoryAssessmentApi, config: EngineConfig) -> (SessionHandle, String) {
    let handle = SessionHandle::spawn(Arc::new(api.clone()), config);
    let snapshot = handle.start(QUIZ).await.unwrap();
    (handle, snapshot.attempt_id.unwrap())
}

async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

fn saves_of(api: &InMemoryAssessmentApi, question: &str) -> Vec<Vec<usize>> {
    api.calls()
        .into_iter()
        .filter_map(|call| match call {
            ApiCall::Save {
                question_id,
                selected,
                ..
            } if question_id == question => Some(selected),
            _ => None,
        })
        .collect()
}

/// Poke a closed session with every flush trigger and check nothing is saved after the
/// terminal call.
async fn assert_no_save_after_submit(handle: &SessionHandle, api: &InMemoryAssessmentApi) {
    handle.signal(NetworkSignal::Hidden).unwrap();
    handle.signal(NetworkSignal::Visible).unwrap();
    handle.signal(NetworkSignal::Unloading).unwrap();
    sleep(EngineConfig::default().flush_interval * 2).await;

    let calls = api.calls();
    let submit = calls
        .iter()
        .position(|call| matches!(call, ApiCall::Submit { .. }))
        .unwrap();
    assert!(
        calls[submit..]
            .iter()
            .all(|call| !matches!(call, ApiCall::Save { .. })),
        "save issued after the terminal call: {calls:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn start_opens_attempt_and_counts_down() {
    let api = server(3, 600);
    let (handle, _) = started(&api, EngineConfig::default()).await;

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.status, AttemptStatus::InProgress);
    assert_eq!(snapshot.remaining_seconds, 600);
    assert_eq!(snapshot.question_count, 3);
    assert_eq!(snapshot.current_question_index, 0);

    sleep(Duration::from_millis(10_500)).await;
    assert_eq!(handle.snapshot().remaining_seconds, 590);
}

#[tokio::test(start_paused = true)]
async fn reload_resumes_the_open_attempt() {
    let api = server(3, 600);
    let (first, attempt_id) = started(&api, EngineConfig::default()).await;
    first.select(0, [2]).await.unwrap();
    first.next().await.unwrap();
    settle().await;
    first.shutdown();

    sleep(Duration::from_secs(20)).await;
    let (second, resumed) = started(&api, EngineConfig::default()).await;

    assert_eq!(resumed, attempt_id);
    assert_eq!(second.snapshot().remaining_seconds, 579);
    assert!(matches!(
        second.start(QUIZ).await,
        Err(SessionError::InvalidState(_))
    ));
    assert_eq!(
        api.persisted_answer(&attempt_id, "q1").unwrap().selected,
        vec![2]
    );
}

#[tokio::test(start_paused = true)]
async fn invalid_input_is_refused_without_side_effects() {
    let api = server(3, 600);
    let handle = SessionHandle::spawn(Arc::new(api.clone()), EngineConfig::default());
    assert_eq!(handle.next().await, Err(SessionError::NotStarted));
    assert_eq!(handle.submit().await, Err(SessionError::NotStarted));

    handle.start(QUIZ).await.unwrap();
    assert_eq!(handle.previous().await, Ok(0));
    assert_eq!(
        handle.jump(7).await,
        Err(SessionError::QuestionOutOfRange { index: 7, count: 3 })
    );
    assert!(matches!(
        handle.select(1, [0]).await,
        Err(SessionError::InvalidSelection(
            SelectionError::NotDisplayed { .. }
        ))
    ));
    assert!(matches!(
        handle.select(0, [9]).await,
        Err(SessionError::InvalidSelection(SelectionError::InvalidChoice {
            choice: 9,
            available: 4
        }))
    ));
    assert_eq!(handle.jump(2).await, Ok(2));
    assert_eq!(handle.next().await, Ok(2));

    settle().await;
    assert!(
        api.calls()
            .iter()
            .all(|call| !matches!(call, ApiCall::Save { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn navigation_never_waits_for_saves() {
    let api = server(4, 600);
    let (handle, _) = started(&api, EngineConfig::default()).await;
    api.set_save_latency(Duration::from_secs(30));

    let begun = Instant::now();
    for index in 0..3 {
        handle.select(index, [1]).await.unwrap();
        assert_eq!(handle.next().await, Ok(index + 1));
    }
    assert_eq!(begun.elapsed(), Duration::ZERO);

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.current_question_index, 3);
    assert!(snapshot.answered.is_empty());

    handle.jump(0).await.unwrap();
    assert_eq!(handle.snapshot().selection, vec![1]);
}

#[tokio::test(start_paused = true)]
async fn newest_selection_wins_over_slow_saves() {
    let api = server(3, 600);
    let (handle, attempt_id) = started(&api, EngineConfig::default()).await;
    api.set_save_latency(Duration::from_secs(1));

    handle.select(0, [0]).await.unwrap();
    handle.next().await.unwrap();
    handle.previous().await.unwrap();
    assert_eq!(handle.snapshot().selection, vec![0]);
    handle.select(0, [2]).await.unwrap();
    handle.next().await.unwrap();

    sleep(Duration::from_secs(5)).await;

    assert_eq!(saves_of(&api, "q1"), vec![vec![0], vec![2]]);
    assert_eq!(
        api.persisted_answer(&attempt_id, "q1").unwrap().selected,
        vec![2]
    );
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.answered, vec![0]);
    assert!(!snapshot.pending_save);
}

#[tokio::test(start_paused = true)]
async fn lost_acknowledgment_is_replayed_without_double_counting() {
    let api = server(3, 600);
    let (handle, attempt_id) = started(&api, EngineConfig::default()).await;
    api.lose_next_acks(1);

    handle.select(0, [1]).await.unwrap();
    handle.next().await.unwrap();
    sleep(Duration::from_secs(3)).await;

    assert_eq!(api.save_calls(&attempt_id, "q1"), 2);
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.answered, vec![0]);
    assert!(!snapshot.pending_save);
    assert!(snapshot.last_saved_at.is_some());

    handle.submit().await.unwrap();
    let closed = handle.wait_until_closed().await.unwrap();
    assert_eq!(closed.status, AttemptStatus::Submitted);
    assert_eq!(closed.auto_submit, Some(false));
    assert_eq!(closed.result.unwrap().answered_count, 1);
}

#[tokio::test(start_paused = true)]
async fn connectivity_gap_keeps_answer_pending_until_reconciled() {
    let api = server(3, 600);
    let (handle, attempt_id) = started(&api, EngineConfig::default()).await;

    handle.select(0, [1]).await.unwrap();
    api.set_offline(true);
    handle.signal(NetworkSignal::ConnectivityLost).unwrap();
    handle.next().await.unwrap();
    let dropped = handle.snapshot();
    assert!(dropped.pending_save);
    assert!(!dropped.online);

    sleep(Duration::from_millis(15_500)).await;
    let during = handle.snapshot();
    assert!(during.pending_save);
    assert_eq!(during.status, AttemptStatus::InProgress);
    assert_eq!(during.remaining_seconds, 585);
    assert_eq!(
        handle.submit().await,
        Err(SessionError::SubmitRejected(SubmitRejection::Offline))
    );

    api.set_offline(false);
    handle.signal(NetworkSignal::ConnectivityRestored).unwrap();
    settle().await;

    let after = handle.snapshot();
    assert!(!after.pending_save);
    assert!(after.online);
    assert_eq!(after.status, AttemptStatus::InProgress);
    assert_eq!(after.version, 3);
    assert_eq!(after.answered, vec![0]);
    // The server's truncated view of the remaining time is lower and wins.
    assert_eq!(after.remaining_seconds, 584);
    assert_eq!(api.save_calls(&attempt_id, "q1"), 1);
    assert_eq!(
        api.persisted_answer(&attempt_id, "q1").unwrap().selected,
        vec![1]
    );
}

#[tokio::test(start_paused = true)]
async fn submit_is_refused_while_an_answer_is_pending() {
    let api = server(3, 600);
    let (handle, attempt_id) = started(&api, EngineConfig::default()).await;
    api.set_offline(true);

    handle.select(0, [2]).await.unwrap();
    handle.next().await.unwrap();
    sleep(Duration::from_secs(5)).await;

    assert!(handle.snapshot().pending_save);
    assert_eq!(
        handle.submit().await,
        Err(SessionError::SubmitRejected(SubmitRejection::SavePending))
    );
    assert_eq!(api.submit_calls(&attempt_id), 0);

    // The periodic flush replays the pending answer once the server is reachable.
    api.set_offline(false);
    sleep(Duration::from_secs(30)).await;
    let snapshot = handle.snapshot();
    assert!(!snapshot.pending_save);
    assert_eq!(snapshot.status, AttemptStatus::InProgress);
    assert_eq!(snapshot.answered, vec![0]);

    handle.submit().await.unwrap();
    let closed = handle.wait_until_closed().await.unwrap();
    assert_eq!(closed.result.unwrap().answered_count, 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_during_user_submit_calls_submit_once_with_auto_flag() {
    let api = server(3, 5);
    let (handle, attempt_id) = started(&api, EngineConfig::default()).await;
    handle.select(0, [1]).await.unwrap();
    api.set_save_latency(Duration::from_secs(2));

    sleep(Duration::from_millis(4_500)).await;
    handle.submit().await.unwrap();
    let draining = handle.snapshot();
    assert_eq!(draining.status, AttemptStatus::Finalizing);
    assert_eq!(draining.auto_submit, Some(false));
    assert_eq!(
        handle.submit().await,
        Err(SessionError::SubmitRejected(SubmitRejection::AlreadyFinalizing))
    );

    let closed = handle.wait_until_closed().await.unwrap();
    assert_eq!(closed.status, AttemptStatus::Submitted);
    assert_eq!(closed.auto_submit, Some(true));
    assert_eq!(closed.remaining_seconds, 0);
    assert!(closed.result.unwrap().auto_submit);
    assert_eq!(
        api.persisted_answer(&attempt_id, "q1").unwrap().selected,
        vec![1]
    );

    assert_eq!(
        handle.select(0, [2]).await,
        Err(SessionError::Finalized(AttemptStatus::Submitted))
    );
    sleep(Duration::from_secs(10)).await;
    assert_eq!(api.submit_calls(&attempt_id), 1);
    assert!(matches!(
        api.calls().last(),
        Some(ApiCall::Submit {
            auto_submit: true,
            ..
        })
    ));
    assert_no_save_after_submit(&handle, &api).await;
}

#[tokio::test(start_paused = true)]
async fn deadline_supersedes_permanently_failing_save() {
    let api = server(3, 10);
    let (handle, attempt_id) = started(&api, EngineConfig::default()).await;
    api.set_offline(true);

    handle.select(0, [3]).await.unwrap();
    handle.next().await.unwrap();
    sleep(Duration::from_millis(9_500)).await;
    let before = handle.snapshot();
    assert!(before.pending_save);
    assert_eq!(before.status, AttemptStatus::InProgress);

    sleep(Duration::from_secs(1)).await;
    let after = handle.snapshot();
    assert_eq!(after.status, AttemptStatus::Finalizing);
    assert_eq!(after.auto_submit, Some(true));
    assert_eq!(after.remaining_seconds, 0);
    assert!(api.calls().iter().any(|call| matches!(
        call,
        ApiCall::Submit {
            auto_submit: true,
            ..
        }
    )));

    api.set_offline(false);
    let closed = handle.wait_until_closed().await.unwrap();
    assert_eq!(closed.status, AttemptStatus::Submitted);
    assert!(closed.result.unwrap().auto_submit);
    assert!(api.persisted_answer(&attempt_id, "q1").is_none());
}

#[tokio::test(start_paused = true)]
async fn deadline_drains_last_selection_of_exhausted_question() {
    let api = server(3, 600);
    let config = EngineConfig {
        flush_interval: Duration::from_secs(3_600),
        ..EngineConfig::default()
    };
    let (handle, attempt_id) = started(&api, config).await;

    handle.jump(2).await.unwrap();
    handle.select(2, [0]).await.unwrap();
    api.set_offline(true);
    handle.signal(NetworkSignal::Hidden).unwrap();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(api.save_calls(&attempt_id, "q3"), 3);
    assert!(handle.snapshot().pending_save);

    assert_eq!(handle.select(2, [2]).await, Ok(vec![0, 2]));
    api.set_offline(false);
    sleep(Duration::from_secs(600)).await;

    let closed = handle.wait_until_closed().await.unwrap();
    assert_eq!(closed.status, AttemptStatus::Submitted);
    assert_eq!(closed.auto_submit, Some(true));
    assert_eq!(closed.answered, vec![2]);

    let calls = api.calls();
    let drain = calls
        .iter()
        .rposition(|call| matches!(call, ApiCall::Save { question_id, .. } if question_id == "q3"))
        .unwrap();
    let submit = calls
        .iter()
        .position(|call| matches!(call, ApiCall::Submit { .. }))
        .unwrap();
    assert!(drain < submit);
    assert_eq!(saves_of(&api, "q3").last(), Some(&vec![0, 2]));
    assert_eq!(
        api.persisted_answer(&attempt_id, "q3").unwrap().selected,
        vec![0, 2]
    );
}

#[tokio::test(start_paused = true)]
async fn server_expiry_on_reconnect_closes_attempt() {
    let api = server(3, 600);
    let (handle, attempt_id) = started(&api, EngineConfig::default()).await;

    handle.select(0, [1]).await.unwrap();
    handle.signal(NetworkSignal::ConnectivityLost).unwrap();
    handle.next().await.unwrap();
    api.expire_attempt(&attempt_id);
    sleep(Duration::from_secs(2)).await;
    handle.signal(NetworkSignal::ConnectivityRestored).unwrap();

    let closed = handle.wait_until_closed().await.unwrap();
    assert_eq!(closed.status, AttemptStatus::Expired);
    assert_eq!(closed.remaining_seconds, 0);
    assert_eq!(closed.auto_submit, Some(true));
    assert!(closed.result.unwrap().auto_submit);
    assert_eq!(api.submit_calls(&attempt_id), 1);
    assert_eq!(api.save_calls(&attempt_id, "q1"), 0);
    assert_eq!(
        handle.next().await,
        Err(SessionError::Finalized(AttemptStatus::Expired))
    );
    assert_no_save_after_submit(&handle, &api).await;
    assert_eq!(api.submit_calls(&attempt_id), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_terminal_call_asks_for_support_and_keeps_retrying() {
    let api = server(3, 600);
    let mut config = EngineConfig::default();
    config.submit.support_after_failures = 2;
    let (handle, attempt_id) = started(&api, config).await;
    api.fail_next_submits(4);

    handle.submit().await.unwrap();
    assert_eq!(
        handle.wait_until_closed().await,
        Err(SessionError::TerminalCallStalled)
    );
    let stalled = handle.snapshot();
    assert!(stalled.support_required);
    assert_eq!(stalled.status, AttemptStatus::Finalizing);

    sleep(Duration::from_secs(30)).await;
    let closed = handle.snapshot();
    assert_eq!(closed.status, AttemptStatus::Submitted);
    assert!(!closed.support_required);
    assert_eq!(api.submit_calls(&attempt_id), 5);
}

#[tokio::test(start_paused = true)]
async fn start_after_submission_reports_completed_attempt() {
    let api = server(2, 600);
    let (first, _) = started(&api, EngineConfig::default()).await;
    first.submit().await.unwrap();
    first.wait_until_closed().await.unwrap();

    let second = SessionHandle::spawn(Arc::new(api.clone()), EngineConfig::default());
    assert_eq!(
        second.start(QUIZ).await.unwrap_err(),
        SessionError::Rejected(ApiError::AlreadyCompleted)
    );
    assert_eq!(second.snapshot().status, AttemptStatus::Submitted);
    assert!(second.wait_until_closed().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn unloading_flushes_the_displayed_answer() {
    let api = server(3, 600);
    let (handle, attempt_id) = started(&api, EngineConfig::default()).await;

    handle.select(0, [3]).await.unwrap();
    sleep(Duration::from_secs(4)).await;
    handle.signal(NetworkSignal::Unloading).unwrap();
    settle().await;

    let stored = api.persisted_answer(&attempt_id, "q1").unwrap();
    assert_eq!(stored.selected, vec![3]);
    assert_eq!(stored.time_spent_seconds, 4);
}

#[tokio::test(start_paused = true)]
async fn abandoned_session_still_submits_at_deadline() {
    let api = server(2, 5);
    let (handle, attempt_id) = started(&api, EngineConfig::default()).await;
    handle.select(0, [1]).await.unwrap();
    drop(handle);

    sleep(Duration::from_secs(7)).await;
    assert_eq!(api.submit_calls(&attempt_id), 1);
    assert_eq!(
        api.persisted_answer(&attempt_id, "q1").unwrap().selected,
        vec![1]
    );
}

#[tokio::test(start_paused = true)]
async fn abandoned_session_submits_after_slow_drain_save() {
    let api = server(2, 5);
    let (handle, attempt_id) = started(&api, EngineConfig::default()).await;
    handle.select(0, [2]).await.unwrap();
    api.set_save_latency(Duration::from_secs(1));
    drop(handle);

    sleep(Duration::from_secs(60)).await;
    assert_eq!(api.submit_calls(&attempt_id), 1);
    assert_eq!(
        api.persisted_answer(&attempt_id, "q1").unwrap().selected,
        vec![2]
    );
    let calls = api.calls();
    assert!(matches!(
        calls.last(),
        Some(ApiCall::Submit {
            auto_submit: true,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn deadline_resends_in_flight_answer_with_drain_budget() {
    let begun = Instant::now();
    let api = server(3, 10);
    let (handle, attempt_id) = started(&api, EngineConfig::default()).await;
    handle.select(0, [1]).await.unwrap();
    api.set_save_latency(Duration::from_secs(60));

    sleep(Duration::from_secs(8)).await;
    handle.next().await.unwrap();

    let closed = handle.wait_until_closed().await.unwrap();
    // Deadline at 10 s, then two drain attempts of 3 s with a 250 ms pause.
    assert!(begun.elapsed() < Duration::from_secs(17), "closed after {:?}", begun.elapsed());
    assert_eq!(closed.status, AttemptStatus::Submitted);
    assert_eq!(closed.auto_submit, Some(true));
    assert!(saves_of(&api, "q1").is_empty());
    assert!(api.persisted_answer(&attempt_id, "q1").is_none());
    assert_eq!(api.submit_calls(&attempt_id), 1);
}
