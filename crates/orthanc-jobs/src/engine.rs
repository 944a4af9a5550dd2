use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::registry::JobsRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Setup,
    Running,
    Stopping,
    Done,
}

/// Owns the worker and retry-sweep threads that drain a `JobsRegistry`
/// (spec.md §4.G). Explicit `std::thread`, not an async runtime: spec.md §5
/// requires non-cooperative scheduling, so each worker blocks the OS thread
/// it owns rather than yielding to a reactor.
pub struct JobsEngine {
    registry: Arc<JobsRegistry>,
    state: Mutex<EngineState>,
    is_running: Arc<AtomicBool>,
    wakeup: Duration,
    retry_sweep_interval: Duration,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl JobsEngine {
    pub fn new(registry: Arc<JobsRegistry>, wakeup: Duration, retry_sweep_interval: Duration) -> Arc<Self> {
        Arc::new(JobsEngine {
            registry,
            state: Mutex::new(EngineState::Setup),
            is_running: Arc::new(AtomicBool::new(false)),
            wakeup,
            retry_sweep_interval,
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Spawn `workers` worker threads plus one retry-sweep thread. Only the
    /// first call takes effect — spec.md §4.G "CalledOnce guard: a second
    /// Start is a no-op, not an error."
    pub fn start(self: &Arc<Self>, workers: usize) {
        let mut state = self.state.lock().unwrap();
        if *state != EngineState::Setup {
            return;
        }
        *state = EngineState::Running;
        drop(state);

        self.is_running.store(true, Ordering::SeqCst);
        let mut threads = self.threads.lock().unwrap();

        for worker_idx in 0..workers.max(1) {
            let registry = Arc::clone(&self.registry);
            let is_running = Arc::clone(&self.is_running);
            let wakeup = self.wakeup;
            let handle = std::thread::Builder::new()
                .name(format!("orthanc-job-worker-{worker_idx}"))
                .spawn(move || worker_loop(registry, is_running, wakeup))
                .expect("failed to spawn job worker thread");
            threads.push(handle);
        }

        let registry = Arc::clone(&self.registry);
        let is_running = Arc::clone(&self.is_running);
        let sweep_interval = self.retry_sweep_interval;
        let sweep_handle = std::thread::Builder::new()
            .name("orthanc-job-retry-sweep".to_string())
            .spawn(move || retry_sweep_loop(registry, is_running, sweep_interval))
            .expect("failed to spawn retry-sweep thread");
        threads.push(sweep_handle);
    }

    /// Signal every worker to stop at its next step boundary and join all
    /// threads. Jobs mid-`step()` finish that call, then their
    /// `RunningGuard` observes the flag and leaves the job `Running` in
    /// memory rather than forcing a terminal transition.
    pub fn stop(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != EngineState::Running {
                return;
            }
            *state = EngineState::Stopping;
        }
        self.is_running.store(false, Ordering::SeqCst);
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        *self.state.lock().unwrap() = EngineState::Done;
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

fn worker_loop(registry: Arc<JobsRegistry>, is_running: Arc<AtomicBool>, wakeup: Duration) {
    while is_running.load(Ordering::SeqCst) {
        let Some(mut guard) = registry.acquire_next(wakeup) else {
            continue;
        };
        guard.run(|| is_running.load(Ordering::SeqCst));
    }
}

fn retry_sweep_loop(registry: Arc<JobsRegistry>, is_running: Arc<AtomicBool>, interval: Duration) {
    while is_running.load(Ordering::SeqCst) {
        std::thread::sleep(interval);
        registry.sweep_retries();
    }
}
