
use std::collections::BTreeMap;
use std::time::Duration;

use depot::job::{JobState, TargetRunner};
use depot::runner::{AdoptionState, Runner, RunnerKind};
use depot::state::StateError;
use tokio_util::sync::CancellationToken;

use test_helpers::*;

#[depot::test]
async fn assigns_in_queue_order() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;
        state
            .job_create(vec![build_job("a"), build_job("b")])
            .await
            .unwrap();

        let r = runner("r1");
        let cancel = CancellationToken::new();
        let first = state.job_assign_for_runner(&r, &cancel).await.unwrap();
        assert_eq!(first.id, "a");
        assert_eq!(first.state, JobState::Waiting);
        assert_eq!(first.assigned_runner.as_deref(), Some("r1"));
        assert!(first.assign_time_ms.is_some());

        let second = state.job_assign_for_runner(&r, &cancel).await.unwrap();
        assert_eq!(second.id, "b");
    });
}

#[depot::test]
async fn targeted_jobs_go_to_matching_runners_first() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;

        let mut by_label = build_job("labels");
        by_label.target_runner =
            TargetRunner::Labels(BTreeMap::from([("os".to_string(), "linux".to_string())]));
        let mut by_id = build_job("by-id");
        by_id.target_runner = TargetRunner::Id("r2".to_string());
        state
            .job_create(vec![build_job("any"), by_label, by_id])
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let r2 = runner("r2").with_labels(&[("os", "linux")]);
        // id match beats label match beats any, regardless of queue time
        let j = state.job_assign_for_runner(&r2, &cancel).await.unwrap();
        assert_eq!(j.id, "by-id");
        let j = state.job_assign_for_runner(&r2, &cancel).await.unwrap();
        assert_eq!(j.id, "labels");
        let j = state.job_assign_for_runner(&r2, &cancel).await.unwrap();
        assert_eq!(j.id, "any");
    });
}

#[depot::test]
async fn runner_only_sees_jobs_it_matches() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;

        let mut for_r2 = build_job("for-r2");
        for_r2.target_runner = TargetRunner::Id("r2".to_string());
        let mut windows = build_job("windows");
        windows.target_runner =
            TargetRunner::Labels(BTreeMap::from([("os".to_string(), "windows".to_string())]));
        state.job_create(vec![for_r2, windows]).await.unwrap();

        let r1 = runner("r1").with_labels(&[("os", "linux")]);
        assert!(state.job_peek_for_runner(&r1).await.unwrap().is_none());

        let mut only_id = runner("r3");
        only_id.by_id_only = true;
        state.job_create(vec![build_job("any")]).await.unwrap();
        assert!(state.job_peek_for_runner(&only_id).await.unwrap().is_none());
        assert_eq!(
            state.job_peek_for_runner(&r1).await.unwrap().unwrap().id,
            "any"
        );
    });
}

#[depot::test]
async fn rejected_runner_is_refused() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;
        let mut r = Runner::new("bad", RunnerKind::Remote);
        r.adoption_state = AdoptionState::Rejected;

        let err = state
            .job_assign_for_runner(&r, &CancellationToken::new())
            .await
            .expect_err("rejected");
        assert!(matches!(err, StateError::PermissionDenied(_)), "{err:?}");
        let err = state.job_peek_for_runner(&r).await.expect_err("rejected");
        assert!(matches!(err, StateError::PermissionDenied(_)), "{err:?}");
    });
}

#[depot::test]
async fn peek_does_not_assign() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;
        state.job_create(vec![build_job("a")]).await.unwrap();

        let r = runner("r1");
        let peeked = state.job_peek_for_runner(&r).await.unwrap().unwrap();
        assert_eq!(peeked.id, "a");
        assert_eq!(peeked.state, JobState::Queued);
        assert_eq!(
            state.job_by_id("a", None).await.unwrap().state,
            JobState::Queued
        );
    });
}

#[depot::test]
async fn dependency_blocks_until_success() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;
        state
            .job_create(vec![build_job("a"), build_job("b").with_depends_on(&["a"])])
            .await
            .unwrap();

        let r = runner("r1");
        let a = start_next(&state, &r).await;
        assert_eq!(a.id, "a");
        assert!(
            state.job_peek_for_runner(&r).await.unwrap().is_none(),
            "b is blocked while a runs"
        );

        state.job_complete("a", Ok(None)).await.unwrap();
        let b = state
            .job_assign_for_runner(&r, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(b.id, "b");
    });
}

#[depot::test]
async fn deploys_to_the_same_app_run_one_at_a_time() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;
        let mut other_ws = deploy_job("d3");
        other_ws.workspace = "staging".to_string();
        state
            .job_create(vec![deploy_job("d1"), deploy_job("d2"), other_ws, build_job("b1")])
            .await
            .unwrap();

        let r1 = runner("r1");
        let r2 = runner("r2");
        let cancel = CancellationToken::new();

        let d1 = state.job_assign_for_runner(&r1, &cancel).await.unwrap();
        assert_eq!(d1.id, "d1");
        // d2 is held back; the other workspace and the build are not
        let next = state.job_assign_for_runner(&r2, &cancel).await.unwrap();
        assert_eq!(next.id, "d3");
        let next = state.job_assign_for_runner(&r2, &cancel).await.unwrap();
        assert_eq!(next.id, "b1");
        assert!(state.job_peek_for_runner(&r2).await.unwrap().is_none());

        state.job_ack("d1", true).await.unwrap();
        state.job_complete("d1", Ok(None)).await.unwrap();
        let d2 = state.job_assign_for_runner(&r2, &cancel).await.unwrap();
        assert_eq!(d2.id, "d2");
    });
}

#[depot::test]
async fn nack_releases_the_app_hold() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;
        state
            .job_create(vec![deploy_job("d1"), deploy_job("d2")])
            .await
            .unwrap();
        let r = runner("r1");
        let cancel = CancellationToken::new();

        let d1 = state.job_assign_for_runner(&r, &cancel).await.unwrap();
        assert_eq!(d1.id, "d1");
        assert!(state.job_peek_for_runner(&r).await.unwrap().is_none());

        let back = state.job_ack("d1", false).await.unwrap();
        assert_eq!(back.state, JobState::Queued);
        let again = state.job_assign_for_runner(&r, &cancel).await.unwrap();
        assert_eq!(again.id, "d1", "nacked job keeps its queue position");
    });
}

#[depot::test]
async fn waiting_assign_wakes_on_new_job() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;
        let r = runner("r1");
        let cancel = CancellationToken::new();

        let waiter = {
            let state = state.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { state.job_assign_for_runner(&r, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        state.job_create(vec![build_job("late")]).await.unwrap();
        let job = waiter.await.unwrap().unwrap();
        assert_eq!(job.id, "late");
    });
}

#[depot::test]
async fn waiting_assign_can_be_cancelled() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;
        let r = runner("r1");
        let cancel = CancellationToken::new();

        let waiter = {
            let state = state.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { state.job_assign_for_runner(&r, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let err = waiter.await.unwrap().expect_err("cancelled");
        assert!(matches!(err, StateError::Canceled(_)), "{err:?}");
    });
}

#[depot::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_runners_never_share_a_job() {
    with_timeout!(20000, {
        let (_tmp, state) = open_temp_state().await;
        let jobs: Vec<_> = (0..20).map(|i| build_job(&format!("j{i:02}"))).collect();
        state.job_create(jobs).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..4 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                let r = runner(&format!("r{n}"));
                let cancel = CancellationToken::new();
                let mut got = Vec::new();
                for _ in 0..5 {
                    got.push(state.job_assign_for_runner(&r, &cancel).await.unwrap().id);
                }
                got
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 20);
    });
}

#[depot::test]
async fn assignable_reflects_known_runners() {
    with_timeout!(10000, {
        let (_tmp, state) = open_temp_state().await;
        let mut job = build_job("a");
        job.target_runner = TargetRunner::Id("r9".to_string());
        assert!(!state.job_is_assignable(&job));

        state.runner_create(runner("r9")).await.unwrap();
        assert!(state.job_is_assignable(&job));
    });
}
