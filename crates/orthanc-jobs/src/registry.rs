use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::error::JobError;
use crate::job::{Job, JobUnserializers, StepResult, StopReason};

/// spec.md §4.F's state diagram, verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Success,
    Failure,
    Retry,
    Paused,
}

impl JobState {
    fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "Pending",
            JobState::Running => "Running",
            JobState::Success => "Success",
            JobState::Failure => "Failure",
            JobState::Retry => "Retry",
            JobState::Paused => "Paused",
        }
    }
}

/// Per-job advisory flags a caller can set at any time regardless of which
/// container currently owns the handle. Checked by the worker only at step
/// boundaries (spec.md §5 "Cancellation and timeouts").
#[derive(Default)]
struct JobControl {
    cancel: AtomicBool,
    pause: AtomicBool,
}

/// A handle's full bookkeeping: identity, scheduling state, accumulated
/// runtime, and the boxed job itself.
pub struct JobHandle {
    pub id: Uuid,
    pub priority: i64,
    pub type_name: String,
    pub state: JobState,
    pub runtime: Duration,
    pub created_at: DateTime<Utc>,
    pub last_change_at: DateTime<Utc>,
    pub retry_deadline: Option<Instant>,
    pub last_error: Option<String>,
    last_snapshot: serde_json::Value,
    job: Box<dyn Job>,
}

impl JobHandle {
    fn touch(&mut self, state: JobState) {
        self.state = state;
        self.last_change_at = Utc::now();
    }
}

/// One entry of the pending max-heap. Larger `priority` pops first; among
/// equal priorities the most recently enqueued (`seq`) pops first — spec.md
/// §5's "Jobs of equal priority are de-queued in LIFO order after a
/// priority change triggers heap rebuild."
#[derive(PartialEq, Eq)]
struct PendingEntry {
    priority: i64,
    seq: u64,
    id: Uuid,
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority.cmp(&other.priority).then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    by_id: HashMap<Uuid, JobHandle>,
    controls: HashMap<Uuid, Arc<JobControl>>,
    pending_heap: BinaryHeap<PendingEntry>,
    retry_set: Vec<(Uuid, Instant)>,
    completed: VecDeque<Uuid>,
    next_seq: u64,
}

/// Named, priority-ordered job set with state machine, persistence, and
/// bounded history retention (spec.md §4.F). `Mutex` + `Condvar` rather than
/// an async channel, since spec.md §5 mandates explicit-lock, condvar-wait
/// scheduling, not cooperative yielding.
pub struct JobsRegistry {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    terminal: Condvar,
    max_completed: usize,
}

/// Returned by `acquire_next`; owns the job exclusively while `Running`.
/// Its `Drop` commits the final state transition under the registry mutex —
/// "capture the handle in a scoped guard whose destruction commits the
/// final state transition" (spec.md §4.G).
pub struct RunningGuard<'a> {
    registry: &'a JobsRegistry,
    id: Uuid,
    control: Arc<JobControl>,
    handle: Option<JobHandle>,
    started: Instant,
    shutdown: bool,
}

/// What happened to the handle during the guard's lifetime, recorded so
/// `Drop` knows which container to file it into.
enum Outcome {
    Terminal,
    Shutdown,
}

impl JobsRegistry {
    pub fn new(max_completed: usize) -> Arc<Self> {
        Arc::new(JobsRegistry {
            inner: Mutex::new(Inner {
                by_id: HashMap::new(),
                controls: HashMap::new(),
                pending_heap: BinaryHeap::new(),
                retry_set: Vec::new(),
                completed: VecDeque::new(),
                next_seq: 0,
            }),
            not_empty: Condvar::new(),
            terminal: Condvar::new(),
            max_completed: max_completed.max(1),
        })
    }

    /// Add a new job in the `Pending` state, returning its id.
    pub fn submit(&self, job: Box<dyn Job>, priority: i64) -> Uuid {
        let id = Uuid::new_v4();
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let now = Utc::now();
        let type_name = job.type_name().to_string();
        let handle = JobHandle {
            id,
            priority,
            type_name,
            state: JobState::Pending,
            runtime: Duration::ZERO,
            created_at: now,
            last_change_at: now,
            retry_deadline: None,
            last_error: None,
            last_snapshot: serde_json::Value::Null,
            job,
        };
        inner.by_id.insert(id, handle);
        inner.controls.insert(id, Arc::new(JobControl::default()));
        inner.pending_heap.push(PendingEntry { priority, seq, id });
        drop(inner);
        self.not_empty.notify_one();
        id
    }

    /// Change a pending job's priority, rebuilding the heap so the new
    /// priority takes effect immediately (spec.md §4.F "priority changes in
    /// Pending rebuild the heap").
    pub fn set_priority(&self, id: Uuid, priority: i64) -> Result<(), JobError> {
        let mut inner = self.inner.lock().unwrap();
        let handle = inner
            .by_id
            .get_mut(&id)
            .ok_or_else(|| JobError::InexistentItem(id.to_string()))?;
        if handle.state != JobState::Pending {
            return Ok(());
        }
        handle.priority = priority;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.pending_heap.retain(|e| e.id != id);
        inner.pending_heap.push(PendingEntry { priority, seq, id });
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Request cancellation. Advisory: observed by the owning worker at the
    /// next step boundary if the job is `Running`; immediate if `Pending`
    /// or `Retry`.
    pub fn cancel(&self, id: Uuid) -> Result<(), JobError> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner
            .by_id
            .get(&id)
            .ok_or_else(|| JobError::InexistentItem(id.to_string()))?
            .state;
        match state {
            JobState::Running => {
                if let Some(control) = inner.controls.get(&id) {
                    control.cancel.store(true, Ordering::SeqCst);
                }
            }
            JobState::Pending | JobState::Retry => {
                inner.pending_heap.retain(|e| e.id != id);
                inner.retry_set.retain(|(rid, _)| *rid != id);
                let handle = inner.by_id.get_mut(&id).unwrap();
                handle.touch(JobState::Failure);
                handle.last_error = Some("canceled".to_string());
                Self::push_completed(&mut inner, id, self.max_completed);
                drop(inner);
                self.terminal.notify_all();
            }
            JobState::Paused | JobState::Success | JobState::Failure => {}
        }
        Ok(())
    }

    /// Request pause; only meaningful while the job is `Running`.
    pub fn pause(&self, id: Uuid) -> Result<(), JobError> {
        let inner = self.inner.lock().unwrap();
        if let Some(control) = inner.controls.get(&id) {
            control.pause.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(JobError::InexistentItem(id.to_string()))
        }
    }

    pub fn resume(&self, id: Uuid) -> Result<(), JobError> {
        let mut inner = self.inner.lock().unwrap();
        let handle = inner
            .by_id
            .get_mut(&id)
            .ok_or_else(|| JobError::InexistentItem(id.to_string()))?;
        if handle.state != JobState::Paused {
            return Ok(());
        }
        handle.touch(JobState::Pending);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let priority = handle.priority;
        if let Some(control) = inner.controls.get(&id) {
            control.pause.store(false, Ordering::SeqCst);
        }
        inner.pending_heap.push(PendingEntry { priority, seq, id });
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Resubmit a `Failure` job: `job.reset()` is called and it re-enters
    /// `Pending` (spec.md §4.F diagram; only legal from `Failure`).
    pub fn resubmit(&self, id: Uuid) -> Result<(), JobError> {
        let mut inner = self.inner.lock().unwrap();
        let handle = inner
            .by_id
            .get_mut(&id)
            .ok_or_else(|| JobError::InexistentItem(id.to_string()))?;
        if handle.state != JobState::Failure {
            return Err(JobError::BadSequenceOfCalls(id.to_string()));
        }
        handle.job.reset();
        handle.last_error = None;
        handle.touch(JobState::Pending);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let priority = handle.priority;
        inner.completed.retain(|cid| *cid != id);
        inner.pending_heap.push(PendingEntry { priority, seq, id });
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Block until `id` reaches a terminal state, or return
    /// `InexistentItem` if it has already fallen off the bounded history
    /// (spec.md §4.F "SubmitAndWait").
    pub fn submit_and_wait(&self, job: Box<dyn Job>, priority: i64) -> Result<JobState, JobError> {
        let id = self.submit(job, priority);
        let mut inner = self.inner.lock().unwrap();
        loop {
            match inner.by_id.get(&id) {
                None => return Err(JobError::InexistentItem(id.to_string())),
                Some(handle) if matches!(handle.state, JobState::Success | JobState::Failure) => {
                    return Ok(handle.state);
                }
                _ => {
                    inner = self.terminal.wait(inner).unwrap();
                }
            }
        }
    }

    /// Move every handle in `retry_set` whose deadline has passed back into
    /// the pending heap. Called by the retry-sweeper thread.
    pub fn sweep_retries(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let due: Vec<Uuid> = inner
            .retry_set
            .iter()
            .filter(|(_, deadline)| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        if due.is_empty() {
            return;
        }
        inner.retry_set.retain(|(id, _)| !due.contains(id));
        for id in due {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let handle = inner.by_id.get_mut(&id).unwrap();
            handle.touch(JobState::Pending);
            handle.retry_deadline = None;
            let priority = handle.priority;
            inner.pending_heap.push(PendingEntry { priority, seq, id });
        }
        drop(inner);
        self.not_empty.notify_all();
    }

    /// Wait up to `wakeup` for a pending job and, if one is available,
    /// remove it from the heap and return ownership via a `RunningGuard`
    /// (the registry mutex is released for the whole time the guard runs
    /// `step()` in a loop). Returns `None` on timeout so the caller (the
    /// engine's worker loop) can recheck its shutdown flag between waits
    /// rather than blocking indefinitely.
    pub fn acquire_next(&self, wakeup: Duration) -> Option<RunningGuard<'_>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending_heap.is_empty() {
            let (guard, _timeout) = self.not_empty.wait_timeout(inner, wakeup).unwrap();
            inner = guard;
        }
        let entry = inner.pending_heap.pop()?;
        let mut handle = inner.by_id.remove(&entry.id).expect("pending handle must exist");
        handle.touch(JobState::Running);
        let control = Arc::clone(inner.controls.get(&entry.id).expect("control must exist"));
        Some(RunningGuard {
            registry: self,
            id: entry.id,
            control,
            handle: Some(handle),
            started: Instant::now(),
            shutdown: false,
        })
    }

    fn push_completed(inner: &mut Inner, id: Uuid, max_completed: usize) {
        inner.completed.push_back(id);
        while inner.completed.len() > max_completed {
            if let Some(evicted) = inner.completed.pop_front() {
                inner.by_id.remove(&evicted);
                inner.controls.remove(&evicted);
            }
        }
    }

    fn commit(&self, id: Uuid, mut handle: JobHandle, outcome: Outcome, elapsed: Duration) {
        let mut inner = self.inner.lock().unwrap();
        handle.runtime += elapsed;
        match outcome {
            Outcome::Shutdown => {
                // Stays "Running" in memory without being owned by a worker
                // or sitting in any queue — it resumes from its last
                // persisted snapshot when the process is restarted (spec.md
                // §5 "Cancellation and timeouts").
                inner.by_id.insert(id, handle);
            }
            Outcome::Terminal => {
                let terminal = matches!(
                    handle.state,
                    JobState::Success | JobState::Failure | JobState::Paused | JobState::Retry
                );
                debug_assert!(terminal, "RunningGuard committed a non-terminal state");
                match handle.state {
                    JobState::Retry => {
                        let deadline = handle.retry_deadline.expect("Retry state carries a deadline");
                        inner.by_id.insert(id, handle);
                        inner.retry_set.push((id, deadline));
                    }
                    JobState::Paused => {
                        inner.by_id.insert(id, handle);
                    }
                    JobState::Success | JobState::Failure => {
                        inner.by_id.insert(id, handle);
                        Self::push_completed(&mut inner, id, self.max_completed);
                    }
                    _ => unreachable!(),
                }
            }
        }
        drop(inner);
        self.terminal.notify_all();
    }

    pub fn get(&self, id: Uuid) -> Option<(JobState, f32, serde_json::Value)> {
        let inner = self.inner.lock().unwrap();
        inner.by_id.get(&id).map(|h| (h.state, h.job.progress(), h.job.public_content()))
    }

    /// Produce the JSON shape in spec.md §6: `{Type, Jobs:{id:{...}}}`.
    /// Running jobs embed `last_snapshot` rather than live state, per
    /// spec.md §4.F "Persistence".
    pub fn serialize(&self) -> serde_json::Value {
        let inner = self.inner.lock().unwrap();
        let mut jobs = serde_json::Map::new();
        for (id, handle) in inner.by_id.iter() {
            let job_snapshot = if handle.state == JobState::Running {
                handle.last_snapshot.clone()
            } else {
                handle.job.serialize()
            };
            jobs.insert(
                id.to_string(),
                json!({
                    "State": handle.state.as_str(),
                    "Priority": handle.priority,
                    "CreationTime": handle.created_at.to_rfc3339(),
                    "LastChangeTime": handle.last_change_at.to_rfc3339(),
                    "Runtime": handle.runtime.as_millis(),
                    "Job": job_snapshot,
                }),
            );
        }
        json!({ "Type": "JobsRegistry", "Jobs": jobs })
    }

    /// Rebuild pending jobs from a persisted document. Unknown job types
    /// (no registered unserializer recognizes them) are skipped with a
    /// `tracing::warn!` (spec.md §9).
    pub fn deserialize(&self, doc: &serde_json::Value, unserializers: &JobUnserializers) {
        let Some(jobs) = doc.get("Jobs").and_then(|v| v.as_object()) else {
            return;
        };
        for (id_str, entry) in jobs {
            let Some(type_name) = entry.get("Job").and_then(|j| j.get("Type")).and_then(|t| t.as_str()) else {
                tracing::warn!(id = %id_str, "persisted job has no Job.Type, skipping");
                continue;
            };
            let Some(job_value) = entry.get("Job") else { continue };
            let Some(job) = unserializers.unserialize(type_name, job_value) else {
                tracing::warn!(id = %id_str, %type_name, "no unserializer recognizes this job type, dropping");
                continue;
            };
            let priority = entry.get("Priority").and_then(|v| v.as_i64()).unwrap_or(0);
            let id = id_str.parse().unwrap_or_else(|_| Uuid::new_v4());
            let mut inner = self.inner.lock().unwrap();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let now = Utc::now();
            let handle = JobHandle {
                id,
                priority,
                type_name: type_name.to_string(),
                state: JobState::Pending,
                runtime: Duration::ZERO,
                created_at: now,
                last_change_at: now,
                retry_deadline: None,
                last_error: None,
                last_snapshot: serde_json::Value::Null,
                job,
            };
            inner.by_id.insert(id, handle);
            inner.controls.insert(id, Arc::new(JobControl::default()));
            inner.pending_heap.push(PendingEntry { priority, seq, id });
        }
    }
}

impl RunningGuard<'_> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Repeat `step()` until a terminal code, until cancel/pause is
    /// observed at a step boundary, or until `still_running` returns false
    /// (engine shutdown) — spec.md §4.G engine worker loop, item 3.
    pub fn run(&mut self, still_running: impl Fn() -> bool) {
        let handle = self.handle.as_mut().expect("guard still owns its handle while running");
        loop {
            if self.control.cancel.load(Ordering::SeqCst) {
                handle.job.stop(StopReason::Canceled);
                handle.touch(JobState::Failure);
                handle.last_error = Some("canceled".to_string());
                return;
            }
            if self.control.pause.load(Ordering::SeqCst) {
                handle.job.stop(StopReason::Paused);
                handle.touch(JobState::Paused);
                return;
            }
            if !still_running() {
                self.shutdown = true;
                return;
            }
            match handle.job.step() {
                StepResult::Continue => {
                    handle.last_snapshot = handle.job.serialize();
                    continue;
                }
                StepResult::Success => {
                    handle.touch(JobState::Success);
                    return;
                }
                StepResult::Failure(err) => {
                    handle.touch(JobState::Failure);
                    handle.last_error = Some(err.to_string());
                    return;
                }
                StepResult::Retry(timeout) => {
                    handle.retry_deadline = Some(Instant::now() + timeout);
                    handle.touch(JobState::Retry);
                    return;
                }
            }
        }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let elapsed = self.started.elapsed();
            let outcome = if self.shutdown { Outcome::Shutdown } else { Outcome::Terminal };
            self.registry.commit(self.id, handle, outcome, elapsed);
        }
    }
}
