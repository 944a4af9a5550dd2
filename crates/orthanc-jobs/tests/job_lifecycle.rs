use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use orthanc_jobs::{Job, JobState, JobsRegistry, StepResult, StopReason};
use serde_json::json;

/// Fails its first `fail_count` steps with `Retry(100ms)`, then succeeds.
struct FlakyJob {
    calls: Arc<AtomicUsize>,
    fail_count: usize,
}

impl Job for FlakyJob {
    fn type_name(&self) -> &'static str {
        "FlakyJob"
    }

    fn step(&mut self) -> StepResult {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_count {
            StepResult::Retry(Duration::from_millis(100))
        } else {
            StepResult::Success
        }
    }

    fn stop(&mut self, _reason: StopReason) {}
    fn reset(&mut self) {}
    fn serialize(&self) -> serde_json::Value {
        json!({"Type": "FlakyJob"})
    }
    fn progress(&self) -> f32 {
        0.0
    }
    fn public_content(&self) -> serde_json::Value {
        json!({})
    }
}

/// spec.md scenario 6: a job's step returns `Retry(100ms)` at t0. The retry
/// sweeper must not promote it at t0+50ms but must promote it to Pending by
/// t0+150ms; a subsequent Success step then transitions it to Success.
#[test]
fn retry_deadline_is_honored_before_promotion() {
    let registry = JobsRegistry::new(10);
    let calls = Arc::new(AtomicUsize::new(0));
    let job = Box::new(FlakyJob { calls: Arc::clone(&calls), fail_count: 1 });

    let id = registry.submit(job, 0);

    let mut guard = registry.acquire_next(Duration::from_millis(10)).expect("job should be pending");
    guard.run(|| true);
    drop(guard);

    assert_eq!(registry.get(id).unwrap().0, JobState::Retry);

    std::thread::sleep(Duration::from_millis(50));
    registry.sweep_retries();
    assert_eq!(
        registry.get(id).unwrap().0,
        JobState::Retry,
        "must not promote before the deadline"
    );

    std::thread::sleep(Duration::from_millis(100));
    registry.sweep_retries();
    assert_eq!(
        registry.get(id).unwrap().0,
        JobState::Pending,
        "must promote once the deadline has passed"
    );

    let mut guard = registry.acquire_next(Duration::from_millis(10)).expect("job should be pending again");
    guard.run(|| true);
    drop(guard);

    assert_eq!(registry.get(id).unwrap().0, JobState::Success);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

struct ImmediateJob {
    result: StepResult_,
}

enum StepResult_ {
    Success,
    Failure,
}

impl Job for ImmediateJob {
    fn type_name(&self) -> &'static str {
        "ImmediateJob"
    }
    fn step(&mut self) -> StepResult {
        match self.result {
            StepResult_::Success => StepResult::Success,
            StepResult_::Failure => StepResult::Failure(orthanc_jobs::JobError::InexistentItem("x".into())),
        }
    }
    fn stop(&mut self, _reason: StopReason) {}
    fn reset(&mut self) {}
    fn serialize(&self) -> serde_json::Value {
        json!({"Type": "ImmediateJob"})
    }
    fn progress(&self) -> f32 {
        1.0
    }
    fn public_content(&self) -> serde_json::Value {
        json!({})
    }
}

#[test]
fn completed_history_is_bounded_by_max_completed_jobs() {
    let registry = JobsRegistry::new(2);
    let mut ids = Vec::new();
    for _ in 0..5 {
        let id = registry.submit(Box::new(ImmediateJob { result: StepResult_::Success }), 0);
        ids.push(id);
        let mut guard = registry.acquire_next(Duration::from_millis(10)).expect("job should be pending");
        guard.run(|| true);
        drop(guard);
    }

    let survivors: Vec<_> = ids.iter().filter(|id| registry.get(**id).is_some()).collect();
    assert_eq!(survivors.len(), 2, "only the last maxCompletedJobs handles should remain");
    assert!(registry.get(ids[3]).is_some());
    assert!(registry.get(ids[4]).is_some());
    assert!(registry.get(ids[0]).is_none());
}

#[test]
fn priority_change_moves_job_ahead_of_queue() {
    let registry = JobsRegistry::new(10);
    let low = registry.submit(Box::new(ImmediateJob { result: StepResult_::Success }), 0);
    let _high = registry.submit(Box::new(ImmediateJob { result: StepResult_::Success }), 5);

    registry.set_priority(low, 10).unwrap();

    let guard = registry.acquire_next(Duration::from_millis(10)).expect("a job should be pending");
    assert_eq!(guard.id(), low);
}
