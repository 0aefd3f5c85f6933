//! Assertions over job records and checkpoints.

use crate::checkpoint::CheckpointStore;
use crate::core::{Job, JobStatus};

/// Asserts that `stages_completed` is a prefix of the plan and that the
/// record satisfies its structural invariants.
///
/// # Panics
///
/// Panics if the record is inconsistent.
pub fn assert_progress_is_prefix(job: &Job) {
    let done = job.stages_completed.len();
    assert!(
        done <= job.stage_plan.len() && job.stage_plan[..done] == job.stages_completed[..],
        "stages_completed {:?} is not a prefix of {:?}",
        job.stages_completed,
        job.stage_plan
    );
    if let Err(err) = job.check_invariants() {
        panic!("job record is inconsistent: {err}");
    }
}

/// Asserts that the job completed every planned stage.
///
/// # Panics
///
/// Panics if the job is not completed.
pub fn assert_job_completed(job: &Job) {
    assert_eq!(job.status, JobStatus::Completed, "job error: {:?}", job.error);
    assert_eq!(job.stages_completed, job.stage_plan);
    assert!(job.current_stage.is_none());
    assert!(job.error.is_none());
}

/// Asserts that each completed stage has exactly one checkpoint in the
/// job's current generation.
///
/// # Panics
///
/// Panics on a missing or duplicated checkpoint.
pub async fn assert_one_checkpoint_per_stage(checkpoints: &CheckpointStore, job: &Job) {
    let all = checkpoints
        .load_all(&job.key.job_id)
        .await
        .expect("checkpoints load");
    for stage in &job.stages_completed {
        let count = all
            .iter()
            .filter(|cp| &cp.stage == stage && cp.generation == job.generation)
            .count();
        assert_eq!(count, 1, "stage '{stage}' has {count} checkpoints in generation {}", job.generation);
    }
}
