//! Scheduler services against PostgreSQL.
//!
//! Run with: `cargo test -p gantry-tests --test store_tests --features integration`

#![cfg(feature = "integration")]

use gantry_core::Status;
use gantry_scheduler::ConcurrencySpec;
use gantry_tests::{
    DYNAMIC_MATRIX, PIPELINE, RunFixture, SINGLE, TestContext, finish_job, job_named, jobs_of,
    runner,
};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_concurrent_dispatch_claims_job_once() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    ctx.runs()
        .create_run(RunFixture::manual(1), SINGLE.as_bytes(), None)
        .await
        .expect("Failed to create run");

    let (first, second) = (ctx.dispatcher(), ctx.dispatcher());
    let linux = runner(1, &["linux"]);
    let (a, b) = tokio::join!(
        first.create_task_for_runner(&linux),
        second.create_task_for_runner(&linux)
    );

    let claimed = [a.expect("dispatch failed"), b.expect("dispatch failed")];
    assert_eq!(claimed.iter().filter(|c| c.is_some()).count(), 1);
}

#[tokio::test]
async fn test_dispatch_issues_usable_token() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let run = ctx
        .runs()
        .create_run(RunFixture::manual(1), PIPELINE.as_bytes(), None)
        .await
        .expect("Failed to create run");

    let dispatcher = ctx.dispatcher();
    assert!(
        dispatcher
            .create_task_for_runner(&runner(1, &["windows"]))
            .await
            .expect("dispatch failed")
            .is_none()
    );

    let assigned = dispatcher
        .create_task_for_runner(&runner(1, &["linux", "x64"]))
        .await
        .expect("dispatch failed")
        .expect("no job claimed");
    assert_eq!(assigned.job.name, "build");
    assert_eq!(assigned.job.run_id, run.id);
    assert_eq!(assigned.steps.len(), 2);

    let token = assigned.task.token.clone().expect("token not returned");
    let task = dispatcher
        .running_task_by_token(&token)
        .await
        .expect("token lookup failed");
    assert_eq!(task.id, assigned.task.id);
}

#[tokio::test]
async fn test_queue_behind_holds_newer_run() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let spec = ConcurrencySpec {
        group: Some("deploy".to_string()),
        cancel_in_progress: Some(false),
    };
    let runs = ctx.runs();
    let older = runs
        .create_run(RunFixture::manual(1), SINGLE.as_bytes(), Some(&spec))
        .await
        .expect("Failed to create run");
    let newer = runs
        .create_run(RunFixture::manual(1), SINGLE.as_bytes(), Some(&spec))
        .await
        .expect("Failed to create run");

    let dispatcher = ctx.dispatcher();
    let linux = runner(1, &["linux"]);
    let first = dispatcher
        .create_task_for_runner(&linux)
        .await
        .expect("dispatch failed")
        .expect("no job claimed");
    assert_eq!(first.job.run_id, older.id);
    assert!(
        dispatcher
            .create_task_for_runner(&linux)
            .await
            .expect("dispatch failed")
            .is_none()
    );

    finish_job(&ctx.db, first.job.id, Status::Success, &[])
        .await
        .expect("Failed to finish job");

    let second = dispatcher
        .create_task_for_runner(&linux)
        .await
        .expect("dispatch failed")
        .expect("no job claimed");
    assert_eq!(second.job.run_id, newer.id);
}

#[tokio::test]
async fn test_reconcile_unblocks_next_job() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let run = ctx
        .runs()
        .create_run(RunFixture::manual(1), PIPELINE.as_bytes(), None)
        .await
        .expect("Failed to create run");

    let build = ctx
        .dispatcher()
        .create_task_for_runner(&runner(1, &["linux"]))
        .await
        .expect("dispatch failed")
        .expect("no job claimed");
    finish_job(&ctx.db, build.job.id, Status::Failure, &[])
        .await
        .expect("Failed to finish job");

    let emitter = ctx.emitter();
    assert_eq!(emitter.check_jobs_of_run(run.id).await.expect("reconcile failed"), 2);

    let statuses: Vec<(String, Status)> = jobs_of(&ctx.db, run.id)
        .await
        .expect("Failed to list jobs")
        .into_iter()
        .map(|j| (j.name, j.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("build".to_string(), Status::Failure),
            ("test".to_string(), Status::Skipped),
            ("deploy".to_string(), Status::Skipped),
        ]
    );
}

#[tokio::test]
async fn test_matrix_expansion_replaces_job() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let run = ctx
        .runs()
        .create_run(RunFixture::manual(1), DYNAMIC_MATRIX.as_bytes(), None)
        .await
        .expect("Failed to create run");

    let setup = ctx
        .dispatcher()
        .create_task_for_runner(&runner(1, &["linux"]))
        .await
        .expect("dispatch failed")
        .expect("no job claimed");
    assert_eq!(setup.job.name, "setup");
    finish_job(&ctx.db, setup.job.id, Status::Success, &[("x", "[1,2,3]")])
        .await
        .expect("Failed to finish job");

    let emitter = ctx.emitter();
    emitter.push(run.id).await;
    assert_eq!(emitter.drain().await.expect("reconcile failed"), 1);

    let names: Vec<String> = jobs_of(&ctx.db, run.id)
        .await
        .expect("Failed to list jobs")
        .into_iter()
        .map(|j| j.name)
        .collect();
    assert_eq!(names, vec!["setup", "job (1)", "job (2)", "job (3)"]);

    let expanded = job_named(&ctx.db, run.id, "job (2)")
        .await
        .expect("expanded job missing");
    assert_eq!(expanded.status, Status::Waiting);
    assert_eq!(expanded.needs, vec!["setup"]);
}
