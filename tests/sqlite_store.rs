//! Durability tests for the SQLite state store.

use prospector_core::orchestrator::{
    JobStatus, Phase, PhaseJob, PipelineRun, PipelineStatus, RunConfig, SearchCriteria,
};
use prospector_core::store::{SqliteStore, StateStore};
use prospector_core::types::{ProjectId, UserId};
use prospector_core::Error;
use tempfile::TempDir;

fn run_for(project: &str) -> PipelineRun {
    PipelineRun::new(
        ProjectId::from_string(project).unwrap(),
        UserId::from_string("user-1").unwrap(),
        RunConfig {
            goal: "find warehouse operators".to_string(),
            search_criteria: SearchCriteria {
                keywords: vec!["cold storage".to_string()],
                locations: vec!["Hamburg".to_string()],
                ..Default::default()
            },
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_rows_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.db");

    let (run_id, job_id) = {
        let store = SqliteStore::open(&path).unwrap();
        let mut run = store.insert_run(run_for("proj-1")).await.unwrap();
        let job = store.insert_job(PhaseJob::new(&run, Phase::Search)).await.unwrap();
        run.set_handle(Phase::Search, job.id.clone());
        store.update_run(&run).await.unwrap();

        let mut running = job.clone();
        running.status = JobStatus::Running;
        running.iteration = 3;
        store.update_job(&running).await.unwrap();
        (run.id, job.id)
    };

    let store = SqliteStore::open(&path).unwrap();
    let run = store.get_run(&run_id).await.unwrap();
    assert_eq!(run.version, 2);
    assert_eq!(run.search_job.as_ref(), Some(&job_id));
    assert_eq!(run.config.search_criteria.locations, vec!["Hamburg".to_string()]);
    assert_eq!(run.current_phase, Some(Phase::Search));

    let job = store.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.iteration, 3);
    assert_eq!(job.version, 2);

    let running = store.runs_with_status(PipelineStatus::Running).await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, run_id);
}

#[tokio::test]
async fn test_stale_writer_loses_after_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.db");

    let stale = {
        let store = SqliteStore::open(&path).unwrap();
        store.insert_run(run_for("proj-2")).await.unwrap()
    };

    let store = SqliteStore::open(&path).unwrap();
    let mut fresh = store.get_run(&stale.id).await.unwrap();
    fresh.current_phase = Some(Phase::Analysis);
    store.update_run(&fresh).await.unwrap();

    let mut late = stale.clone();
    late.status = PipelineStatus::Failed;
    let err = store.update_run(&late).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "got {err:?}");

    let stored = store.get_run(&stale.id).await.unwrap();
    assert_eq!(stored.status, PipelineStatus::Running);
    assert_eq!(stored.current_phase, Some(Phase::Analysis));
}

#[tokio::test]
async fn test_project_history_is_newest_first() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&dir.path().join("state.db")).unwrap();

    let first = store.insert_run(run_for("proj-3")).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = store.insert_run(run_for("proj-3")).await.unwrap();
    store.insert_run(run_for("other")).await.unwrap();

    let runs = store
        .runs_for_project(&ProjectId::from_string("proj-3").unwrap())
        .await
        .unwrap();
    let ids: Vec<_> = runs.iter().map(|r| r.id.clone()).collect();
    assert_eq!(ids, vec![second.id, first.id]);
}
