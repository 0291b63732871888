use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use depot::job::{ApplicationRef, Job, Operation, OperationKind, TargetRunner};
use depot::runner::{Runner, RunnerKind};
use depot::settings::{AppConfig, Backend, DatabaseConfig};
use depot::state::{State, StateError};
use tokio_util::sync::CancellationToken;

async fn open_temp_state(flush_interval_ms: Option<u64>) -> (tempfile::TempDir, Arc<State>) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let cfg = AppConfig {
        database: DatabaseConfig {
            backend: Backend::Fs,
            path: tmp.path().to_string_lossy().to_string(),
            flush_interval_ms,
        },
        ..Default::default()
    };
    let state = State::open(&cfg).await.expect("open state");
    (tmp, state)
}

fn job(producer: usize, i: usize) -> Job {
    Job::new(
        format!("p{producer}-{i}"),
        Operation::new(OperationKind::Build),
        ApplicationRef::new("bench", format!("app{}", i % 8)),
        "default",
        TargetRunner::Any,
    )
}

async fn measure_create_throughput(flush_ms: u64, producers: usize, jobs_per_producer: usize) -> f64 {
    let (_tmp, state) = open_temp_state(Some(flush_ms)).await;
    let start = Instant::now();

    let mut handles = vec![];
    for producer in 0..producers {
        let state = Arc::clone(&state);
        handles.push(tokio::spawn(async move {
            for i in 0..jobs_per_producer {
                state
                    .job_create(vec![job(producer, i)])
                    .await
                    .expect("create");
            }
        }));
    }
    for handle in handles {
        handle.await.expect("producer task");
    }

    state.close().await.expect("close");
    let elapsed = start.elapsed();
    (producers * jobs_per_producer) as f64 / elapsed.as_secs_f64()
}

/// Runners assign, ack and complete until every seeded job is done.
async fn measure_run_throughput(flush_ms: u64, runners: usize, total_jobs: usize) -> f64 {
    let (_tmp, state) = open_temp_state(Some(flush_ms)).await;
    let seed: Vec<Job> = (0..total_jobs).map(|i| job(0, i)).collect();
    state.job_create(seed).await.expect("seed");

    let start = Instant::now();
    let processed = Arc::new(AtomicUsize::new(0));
    let done = CancellationToken::new();

    let mut handles = vec![];
    for n in 0..runners {
        let state = Arc::clone(&state);
        let processed = Arc::clone(&processed);
        let done = done.clone();
        handles.push(tokio::spawn(async move {
            let runner = Runner::new(format!("runner-{n}"), RunnerKind::Remote);
            loop {
                let job = match state.job_assign_for_runner(&runner, &done).await {
                    Ok(job) => job,
                    Err(StateError::Canceled(_)) => break,
                    Err(e) => panic!("assign: {e}"),
                };
                state.job_ack(&job.id, true).await.expect("ack");
                state.job_complete(&job.id, Ok(None)).await.expect("complete");
                if processed.fetch_add(1, Ordering::Relaxed) + 1 >= total_jobs {
                    done.cancel();
                }
            }
        }));
    }
    for handle in handles {
        handle.await.expect("runner task");
    }

    let elapsed = start.elapsed();
    state.close().await.expect("close");
    total_jobs as f64 / elapsed.as_secs_f64()
}

#[tokio::main]
async fn main() {
    println!("\n========================================");
    println!("Depot Job Throughput Benchmark");
    println!("========================================\n");

    println!("Testing with 50ms flush interval\n");

    println!("--- Create Throughput ---");
    let c1 = measure_create_throughput(50, 1, 50).await;
    println!("  1 producer  x 50  jobs: {:.0} jobs/sec", c1);
    let c4 = measure_create_throughput(50, 4, 50).await;
    println!("  4 producers x 50  jobs: {:.0} jobs/sec ({:.1}x)", c4, c4 / c1);
    let c8 = measure_create_throughput(50, 8, 25).await;
    println!("  8 producers x 25  jobs: {:.0} jobs/sec ({:.1}x)\n", c8, c8 / c1);

    println!("--- Assign/Ack/Complete Throughput ---");
    let r1 = measure_run_throughput(50, 1, 100).await;
    println!("  1 runner  x 100 jobs: {:.0} jobs/sec", r1);
    let r4 = measure_run_throughput(50, 4, 100).await;
    println!("  4 runners x 100 jobs: {:.0} jobs/sec ({:.1}x)", r4, r4 / r1);
    let r8 = measure_run_throughput(50, 8, 200).await;
    println!("  8 runners x 200 jobs: {:.0} jobs/sec ({:.1}x)\n", r8, r8 / r1);
}
