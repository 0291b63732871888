
use std::time::Duration;

use depot::job::{JobError, JobState};
use depot::settings::SchedulerConfig;
use depot::state::StateError;
use tokio_util::sync::CancellationToken;

use test_helpers::*;

fn short_timeouts() -> SchedulerConfig {
    SchedulerConfig {
        waiting_timeout_ms: 150,
        heartbeat_timeout_ms: 200,
        ..Default::default()
    }
}

#[depot::test]
async fn ack_then_complete_success() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;
        state.job_create(vec![build_job("a")]).await.unwrap();

        let running = start_next(&state, &runner("r1")).await;
        assert_eq!(running.state, JobState::Running);
        assert!(running.ack_time_ms.is_some());

        let done = state
            .job_complete("a", Ok(Some(b"artifact".to_vec())))
            .await
            .unwrap();
        assert_eq!(done.state, JobState::Success);
        assert_eq!(done.result.as_deref(), Some(&b"artifact"[..]));
        assert!(done.complete_time_ms.is_some());

        let stored = state.job_by_id("a", None).await.unwrap();
        assert_eq!(stored, done);
    });
}

#[depot::test]
async fn complete_with_error_records_it() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;
        state.job_create(vec![build_job("a")]).await.unwrap();
        start_next(&state, &runner("r1")).await;

        let done = state
            .job_complete("a", Err(JobError::new("build", "exit status 2")))
            .await
            .unwrap();
        assert_eq!(done.state, JobState::Error);
        assert_eq!(done.error.unwrap().message, "exit status 2");
    });
}

#[depot::test]
async fn transitions_from_wrong_state_are_rejected() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;
        state.job_create(vec![build_job("a")]).await.unwrap();

        let err = state.job_ack("a", true).await.expect_err("not waiting");
        assert!(matches!(err, StateError::FailedPrecondition(_)), "{err:?}");
        let err = state.job_complete("a", Ok(None)).await.expect_err("not running");
        assert!(matches!(err, StateError::FailedPrecondition(_)), "{err:?}");
        let err = state.job_ack("missing", true).await.expect_err("unknown");
        assert!(matches!(err, StateError::NotFound(_)), "{err:?}");
        let err = state.job_heartbeat("missing").await.expect_err("unknown");
        assert!(matches!(err, StateError::NotFound(_)), "{err:?}");
    });
}

#[depot::test]
async fn cancel_queued_job_fails_it_immediately() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;
        state.job_create(vec![build_job("a")]).await.unwrap();

        let job = state.job_cancel("a", false).await.unwrap();
        assert_eq!(job.state, JobState::Error);
        assert!(job.cancel_time_ms.is_some());
        assert_eq!(job.error.unwrap().code, "canceled");

        // cancelling again is a no-op
        let again = state.job_cancel("a", true).await.unwrap();
        assert_eq!(again.state, JobState::Error);
    });
}

#[depot::test]
async fn cancel_running_job_needs_force() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;
        state.job_create(vec![build_job("a")]).await.unwrap();
        start_next(&state, &runner("r1")).await;

        let flagged = state.job_cancel("a", false).await.unwrap();
        assert_eq!(flagged.state, JobState::Running);
        assert!(flagged.cancel_time_ms.is_some());

        let forced = state.job_cancel("a", true).await.unwrap();
        assert_eq!(forced.state, JobState::Error);
        assert_eq!(
            forced.cancel_time_ms, flagged.cancel_time_ms,
            "first cancel time is kept"
        );
    });
}

#[depot::test]
async fn nack_of_cancelled_waiting_job_fails_it() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;
        state.job_create(vec![build_job("a")]).await.unwrap();
        state
            .job_assign_for_runner(&runner("r1"), &CancellationToken::new())
            .await
            .unwrap();

        state.job_cancel("a", false).await.unwrap();
        let job = state.job_ack("a", false).await.unwrap();
        assert_eq!(job.state, JobState::Error);
    });
}

#[depot::test]
async fn waiting_job_times_out_back_to_queue() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state_with(short_timeouts()).await;
        state.job_create(vec![build_job("a")]).await.unwrap();
        state
            .job_assign_for_runner(&runner("r1"), &CancellationToken::new())
            .await
            .unwrap();

        let job = wait_for_job_state(&state, "a", JobState::Queued, 3000).await;
        assert!(job.assigned_runner.is_none());

        // and it can be assigned again
        let again = state
            .job_assign_for_runner(&runner("r2"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.id, "a");
    });
}

#[depot::test]
async fn acked_job_does_not_hit_the_waiting_timeout() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state_with(short_timeouts()).await;
        state.job_create(vec![build_job("a")]).await.unwrap();
        start_next(&state, &runner("r1")).await;

        // keep it alive past both timeouts
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            state.job_heartbeat("a").await.unwrap();
        }
        let job = state.job_by_id("a", None).await.unwrap();
        assert_eq!(job.state, JobState::Running);
    });
}

#[depot::test]
async fn missed_heartbeat_fails_the_job() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state_with(short_timeouts()).await;
        state.job_create(vec![deploy_job("d1"), deploy_job("d2")]).await.unwrap();
        start_next(&state, &runner("r1")).await;

        let job = wait_for_job_state(&state, "d1", JobState::Error, 3000).await;
        assert_eq!(job.error.unwrap().code, "heartbeat");

        // the app hold is released with it
        let next = state
            .job_assign_for_runner(&runner("r2"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(next.id, "d2");
    });
}

#[depot::test]
async fn queued_job_expires() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;
        let mut j = build_job("a");
        j.expire_time_ms = Some(now_ms() + 100);
        state.job_create(vec![j, build_job("b")]).await.unwrap();

        let job = wait_for_job_state(&state, "a", JobState::Error, 3000).await;
        assert_eq!(job.error.unwrap().code, "expired");
        assert_eq!(
            state.job_by_id("b", None).await.unwrap().state,
            JobState::Queued
        );
    });
}

#[depot::test]
async fn expiry_can_be_moved_or_cleared() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;
        let mut j = build_job("a");
        j.expire_time_ms = Some(now_ms() + 100);
        state.job_create(vec![j]).await.unwrap();

        let updated = state.job_update_expiry("a", None).await.unwrap();
        assert!(updated.expire_time_ms.is_none());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(
            state.job_by_id("a", None).await.unwrap().state,
            JobState::Queued
        );
        assert!(!state.job_expire("a").await.unwrap());

        state
            .job_update_expiry("a", Some(now_ms() - 1))
            .await
            .unwrap();
        wait_for_job_state(&state, "a", JobState::Error, 3000).await;

        let err = state
            .job_update_expiry("a", None)
            .await
            .expect_err("finished");
        assert!(matches!(err, StateError::FailedPrecondition(_)), "{err:?}");
    });
}

#[depot::test]
async fn running_job_collects_output_until_it_finishes() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;
        state.job_create(vec![build_job("a")]).await.unwrap();
        assert!(state.job_output("a").is_none());

        start_next(&state, &runner("r1")).await;
        let out = state.job_output("a").expect("buffer opened on start");
        out.append(now_ms(), "step 1");
        out.append(now_ms(), "step 2");

        state.job_complete("a", Ok(None)).await.unwrap();
        assert!(out.is_closed());
        let lines: Vec<String> = out.read_from(0).into_iter().map(|l| l.line).collect();
        assert_eq!(lines, vec!["step 1", "step 2"]);
    });
}

#[depot::test]
async fn watch_on_job_fires_on_change() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;
        state.job_create(vec![build_job("a")]).await.unwrap();

        let mut ws = depot::memdb::WatchSet::new();
        let job = state.job_by_id("a", Some(&mut ws)).await.unwrap();
        assert_eq!(job.state, JobState::Queued);

        let s = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            s.job_cancel("a", false).await.unwrap();
        });
        assert!(ws.wait_timeout(Duration::from_secs(5)).await);
        assert_eq!(
            state.job_by_id("a", None).await.unwrap().state,
            JobState::Error
        );
    });
}
