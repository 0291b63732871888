
use depot::codec::Stored;
use depot::job::{JobError, JobState, PipelineStepRef};
use depot::operation::{Build, Status};
use depot::pipeline::{PipelineRun, PipelineRunState};
use depot::settings::SchedulerConfig;
use depot::state::{ConfigScope, ConfigVar, JobFilter, OperationRef};
use depot::task::{Task, TaskState};
use tokio_util::sync::CancellationToken;

use test_helpers::*;

fn build(component: &str) -> Build {
    Build {
        id: String::new(),
        application: app(),
        workspace: "default".to_string(),
        sequence: 0,
        status: Status::running(now_ms()),
        component: component.to_string(),
        job_id: String::new(),
    }
}

#[depot::test]
async fn index_is_rebuilt_from_durable_state() {
    with_timeout!(20000, {
        let (tmp, state) = open_temp_state().await;
        state
            .job_create(vec![deploy_job("d1"), deploy_job("d2"), build_job("a"), build_job("b")])
            .await
            .unwrap();
        state.job_cancel("b", false).await.unwrap();
        // d1 holds the app across the restart
        let d1 = start_next(&state, &runner("r1")).await;
        assert_eq!(d1.id, "d1");
        let r = state.runner_create(runner("r1")).await.unwrap();
        let before = state.job_list(&JobFilter::default()).await.unwrap();

        let state = reopen_state(&tmp, state, SchedulerConfig::default()).await;

        let after = state.job_list(&JobFilter::default()).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(state.runner_get("r1").unwrap(), r);

        let next = state
            .job_assign_for_runner(&runner("r2"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(next.id, "a");
        assert!(
            state.job_peek_for_runner(&runner("r2")).await.unwrap().is_none(),
            "d2 is still blocked by the running deploy"
        );
        assert!(state.job_output("d1").is_some());
    });
}

#[depot::test]
async fn rebuild_twice_gives_the_same_index() {
    with_timeout!(20000, {
        let (tmp, state) = open_temp_state().await;
        state
            .job_create(vec![build_job("a"), build_job("b").with_depends_on(&["a"])])
            .await
            .unwrap();
        state.operation_put(false, build("web")).await.unwrap();

        let state = reopen_state(&tmp, state, SchedulerConfig::default()).await;
        let once = state.job_list(&JobFilter::default()).await.unwrap();
        let state = reopen_state(&tmp, state, SchedulerConfig::default()).await;
        let twice = state.job_list(&JobFilter::default()).await.unwrap();
        assert_eq!(once, twice);

        let b = state
            .operation_get::<Build>(&OperationRef::Sequence {
                application: app(),
                number: 1,
            })
            .await
            .unwrap();
        assert_eq!(b.component, "web");
    });
}

#[depot::test]
async fn sequences_continue_after_restart() {
    with_timeout!(20000, {
        let (tmp, state) = open_temp_state().await;
        let first = state.job_create(vec![build_job("a")]).await.unwrap().remove(0);
        state.operation_put(false, build("web")).await.unwrap();
        state.operation_put(false, build("web")).await.unwrap();

        let state = reopen_state(&tmp, state, SchedulerConfig::default()).await;

        let second = state.job_create(vec![build_job("b")]).await.unwrap().remove(0);
        assert!(second.queue_seq > first.queue_seq);
        let third = state.operation_put(false, build("web")).await.unwrap();
        assert_eq!(third.sequence, 3);
    });
}

#[depot::test]
async fn waiting_job_times_out_after_restart() {
    with_timeout!(20000, {
        let cfg = SchedulerConfig {
            waiting_timeout_ms: 300,
            ..Default::default()
        };
        let (tmp, state) = open_temp_state_with(cfg.clone()).await;
        state.job_create(vec![build_job("a")]).await.unwrap();
        state
            .job_assign_for_runner(&runner("r1"), &CancellationToken::new())
            .await
            .unwrap();

        let state = reopen_state(&tmp, state, cfg).await;
        assert_eq!(
            state.job_by_id("a", None).await.unwrap().state,
            JobState::Waiting
        );
        wait_for_job_state(&state, "a", JobState::Queued, 5000).await;
    });
}

#[depot::test]
async fn running_job_gets_a_fresh_heartbeat_window_after_restart() {
    with_timeout!(20000, {
        let cfg = SchedulerConfig {
            heartbeat_timeout_ms: 300,
            ..Default::default()
        };
        let (tmp, state) = open_temp_state_with(cfg.clone()).await;
        state.job_create(vec![build_job("a")]).await.unwrap();
        start_next(&state, &runner("r1")).await;

        let state = reopen_state(&tmp, state, cfg).await;
        assert_eq!(
            state.job_by_id("a", None).await.unwrap().state,
            JobState::Running
        );
        let job = wait_for_job_state(&state, "a", JobState::Error, 5000).await;
        assert_eq!(job.error.unwrap().code, "heartbeat");
    });
}

#[depot::test]
async fn expiry_survives_restart() {
    with_timeout!(20000, {
        let (tmp, state) = open_temp_state().await;
        let mut j = build_job("a");
        j.expire_time_ms = Some(now_ms() + 400);
        state.job_create(vec![j]).await.unwrap();

        let state = reopen_state(&tmp, state, SchedulerConfig::default()).await;
        let job = wait_for_job_state(&state, "a", JobState::Error, 5000).await;
        assert_eq!(job.error.unwrap().code, "expired");
    });
}

#[depot::test]
async fn legacy_config_is_migrated_on_open() {
    with_timeout!(20000, {
        let (tmp, state) = open_temp_state().await;
        let var = ConfigVar::new(ConfigScope::Global, "Region", "us-east");
        {
            let mut txn = state.txn().await;
            txn.put_raw("config/global/region".to_string(), var.to_stored().unwrap());
            txn.commit().await.unwrap();
        }

        let state = reopen_state(&tmp, state, SchedulerConfig::default()).await;

        assert!(raw_get(state.db(), "config/global/region").await.is_none());
        assert!(raw_get(state.db(), "config_v2/global/region").await.is_some());
        let vars = state.config_get(&ConfigScope::Global).await.unwrap();
        assert_eq!(vars, vec![var]);

        // a second open has nothing left to migrate
        let state = reopen_state(&tmp, state, SchedulerConfig::default()).await;
        assert_eq!(count_with_prefix(state.db(), "config_v2/").await, 1);
    });
}

#[depot::test]
async fn tasks_and_pipeline_runs_catch_up_on_open() {
    with_timeout!(20000, {
        let (tmp, state) = open_temp_state_unobserved().await;
        state
            .task_put(&Task::new("t1", "start", "run", "stop"))
            .await
            .unwrap();
        state
            .pipeline_run_put(&PipelineRun::new("run1", "p1", &["s-build", "s-deploy"]))
            .await
            .unwrap();

        let mut step = build_job("s-build");
        step.pipeline = Some(PipelineStepRef {
            run_id: "run1".to_string(),
            step: "build".to_string(),
        });
        let mut jobs = vec![step];
        for id in ["start", "run", "stop"] {
            let mut j = build_job(id);
            j.task = Some("t1".to_string());
            jobs.push(j);
        }
        state.job_create(jobs).await.unwrap();

        let r = runner("r1");
        assert_eq!(start_next(&state, &r).await.id, "s-build");
        assert_eq!(start_next(&state, &r).await.id, "start");
        state
            .job_complete("start", Err(JobError::new("launch", "no capacity")))
            .await
            .unwrap();

        // nothing moved the outer records along
        assert_eq!(state.task_get("t1").await.unwrap().state, TaskState::Pending);
        assert_eq!(
            state.pipeline_run_get("run1").await.unwrap().state,
            PipelineRunState::Pending
        );

        let state = reopen_state(&tmp, state, SchedulerConfig::default()).await;

        assert_eq!(state.task_get("t1").await.unwrap().state, TaskState::Error);
        let run = state.pipeline_run_get("run1").await.unwrap();
        assert_eq!(run.state, PipelineRunState::Running);
        assert_eq!(run.jobs.get("s-build"), Some(&JobState::Running));
        assert_eq!(run.jobs.get("s-deploy"), Some(&JobState::Queued));
    });
}
