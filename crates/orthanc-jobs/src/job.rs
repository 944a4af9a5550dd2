use std::time::Duration;

use crate::error::JobError;

/// What a single call to `Job::step` accomplished. The engine's worker loop
/// repeats `step()` in the same thread until this is anything but
/// `Continue` (spec.md §4.G, engine worker loop item 3).
pub enum StepResult {
    Continue,
    Success,
    Failure(JobError),
    Retry(Duration),
}

/// Why a job is leaving the `Running` state ahead of a terminal `step()`
/// result. Handed to `Job::stop` before the transition is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Canceled,
    Paused,
}

/// An abstract unit of long-running server work (spec.md §4.F). Object-safe
/// so the registry can hold a heterogeneous `Box<dyn Job>` per handle.
pub trait Job: Send {
    /// The type name under which this job serializes and is looked up again
    /// at deserialization time (spec.md §9 "unserializers keyed by job type
    /// name").
    fn type_name(&self) -> &'static str;

    /// Advance the job by one unit of work. Exceptions/errors the job
    /// itself encounters are caught at this boundary and converted to
    /// `StepResult::Failure` by the caller, never propagated as a panic.
    fn step(&mut self) -> StepResult;

    /// Best-effort cleanup invoked before a `Canceled` or `Paused`
    /// transition. Errors during `stop` are logged and swallowed by the
    /// caller (spec.md §7 "stop(reason) is best-effort").
    fn stop(&mut self, reason: StopReason);

    /// Reset internal progress so the job can run again from the top.
    /// Called by the registry when a `Failure` job is resubmitted.
    fn reset(&mut self);

    /// A JSON snapshot of enough internal state to resume this job later.
    /// For a `Running` job the registry calls this only at step boundaries
    /// (spec.md §4.F "Persistence" — "Running jobs serialize the last
    /// snapshot embedded in their last reported status").
    fn serialize(&self) -> serde_json::Value;

    /// Fraction of work completed, in `[0, 1]`.
    fn progress(&self) -> f32;

    /// The subset of state exposed to external callers (e.g. a REST status
    /// endpoint, out of scope here, or a CLI `jobs` command).
    fn public_content(&self) -> serde_json::Value;
}

/// A table of deserializers keyed by job type name, tried in registration
/// order — spec.md §9's "Dynamic dispatch to plugins" note, generalized to
/// job types: "if none recognizes a serialized job, the job is dropped with
/// a warning." Frozen after construction; there is no runtime registration.
pub struct JobUnserializers {
    entries: Vec<(&'static str, fn(&serde_json::Value) -> Option<Box<dyn Job>>)>,
}

impl JobUnserializers {
    pub fn new() -> Self {
        JobUnserializers { entries: Vec::new() }
    }

    pub fn register(mut self, type_name: &'static str, f: fn(&serde_json::Value) -> Option<Box<dyn Job>>) -> Self {
        self.entries.push((type_name, f));
        self
    }

    /// Try every registered unserializer in registration order against
    /// `type_name`'s matching entries; the first successful parse wins.
    pub fn unserialize(&self, type_name: &str, value: &serde_json::Value) -> Option<Box<dyn Job>> {
        for (name, f) in &self.entries {
            if *name == type_name {
                if let Some(job) = f(value) {
                    return Some(job);
                }
            }
        }
        None
    }
}

impl Default for JobUnserializers {
    fn default() -> Self {
        Self::new()
    }
}
