//! The validation engine: work queue, scan dispatcher, worker pool, and
//! the coordinator state that ties them together.
//!
//! One process-wide mutex guards the queues, counters, and latched
//! pending/finished flags; the condition variable doubles as the
//! wait-for-disjunction primitive (workers sleep until "work pending OR
//! terminate"). Terminate and stopping are mirrored in atomics so decode
//! loops can poll them without touching the lock. The lock is held only
//! for O(1) operations, batch splices, and — deliberately — decoder
//! opens: one reader initiates a file at a time, which measurably helps
//! both rotational and solid-state storage; the bulk of each file is then
//! read outside the lock, in parallel.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::decoder::{Decoder, DecoderFactory};
use crate::error::DecodeError;
use crate::models::{FileRecord, Outcome, ValidationEvent};
use crate::report::Report;
use crate::scanner::scan_folder;
use crate::stream::{display_path, OpenMode};

/// Upper bound on the worker pool, whatever the machine reports.
pub const MAX_WORKERS: usize = 64;

/// Progress denominator for streams that do not declare a total.
const DEFAULT_TOTAL_UNITS: u64 = 0xFF_FFFF;

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Worker count override; defaults to the logical CPU count. Set 1 to
    /// reproduce single-threaded runs when debugging.
    pub jobs: Option<usize>,
    /// Force streaming reads even with multiple workers.
    pub unbuffered: bool,
}

pub fn default_jobs() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Per-worker progress fractions, published without a lock. Each slot has
/// exactly one writer (its worker); readers tolerate stale values.
pub struct ProgressTracker {
    fractions: Vec<AtomicU32>,
}

impl ProgressTracker {
    fn new(workers: usize) -> Self {
        ProgressTracker { fractions: (0..workers).map(|_| AtomicU32::new(0)).collect() }
    }

    pub fn workers(&self) -> usize {
        self.fractions.len()
    }

    /// Fraction of the current file worker `index` has read, in `0..=1`.
    pub fn fraction(&self, index: usize) -> f32 {
        self.fractions[index].load(Ordering::Relaxed) as f32 / 1000.0
    }

    fn set(&self, index: usize, fraction: f32) {
        let permille = (fraction.clamp(0.0, 1.0) * 1000.0) as u32;
        self.fractions[index].store(permille, Ordering::Relaxed);
    }
}

/// Everything guarded by the engine lock.
struct Shared {
    work_queue: VecDeque<PathBuf>,
    scan_queue: VecDeque<PathBuf>,
    total_to_process: usize,
    processed: usize,
    /// Latched "work pending" flag: raised on enqueue, lowered by the
    /// worker that observes an empty queue. All waiters are released on a
    /// raise.
    pending: bool,
    /// Per-worker idle flags: raised while a worker holds no file.
    finished: Vec<bool>,
    scan_running: bool,
    passed: Vec<String>,
    failed: BTreeMap<String, Vec<String>>,
    run_started: Option<Instant>,
}

struct Inner {
    shared: Mutex<Shared>,
    cond: Condvar,
    terminate: AtomicBool,
    stopping: AtomicBool,
    factory: DecoderFactory,
    progress: Arc<ProgressTracker>,
    events: Sender<ValidationEvent>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send(&self, event: ValidationEvent) {
        let _ = self.events.send(event);
    }

    /// Runs only when every worker's finished flag is raised and both
    /// queues are drained with no scan outstanding: assembles the report,
    /// resets the run state, and clears cancellation.
    fn maybe_finalize(&self, shared: &mut Shared) {
        if !shared.finished.iter().all(|f| *f)
            || !shared.work_queue.is_empty()
            || !shared.scan_queue.is_empty()
            || shared.scan_running
        {
            return;
        }
        let elapsed = shared.run_started.take().map(|t| t.elapsed()).unwrap_or_default();
        let passed = std::mem::take(&mut shared.passed);
        let failed = std::mem::take(&mut shared.failed);
        let scanned = shared.processed;
        shared.processed = 0;
        shared.total_to_process = 0;
        shared.pending = false;
        self.stopping.store(false, Ordering::Release);

        let report = Report::from_run(passed, failed, scanned, elapsed);
        info!(scanned, failed = report.failed.len(), "run finished");
        self.send(ValidationEvent::Status("Ready".to_string()));
        self.send(ValidationEvent::RunFinished(report));
    }
}

/// The coordinator: owns the worker pool and the scan dispatcher, accepts
/// paths, and reports through the event channel handed to [`Validator::new`].
pub struct Validator {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Validator {
    /// Spawns the worker pool and the scan dispatcher. Thread-creation
    /// failure is fatal for the caller; already-spawned threads are shut
    /// down before the error is returned.
    pub fn new(config: &Config, events: Sender<ValidationEvent>) -> io::Result<Self> {
        let jobs = config.jobs.unwrap_or_else(default_jobs).clamp(1, MAX_WORKERS);
        // With several workers contending on one disk, buffering whole
        // files pays once per file instead of seeking constantly.
        let mode = if jobs >= 2 && !config.unbuffered {
            OpenMode::Buffered
        } else {
            OpenMode::Direct
        };
        let progress = Arc::new(ProgressTracker::new(jobs));
        let inner = Arc::new(Inner {
            shared: Mutex::new(Shared {
                work_queue: VecDeque::new(),
                scan_queue: VecDeque::new(),
                total_to_process: 0,
                processed: 0,
                pending: false,
                finished: vec![true; jobs],
                scan_running: false,
                passed: Vec::new(),
                failed: BTreeMap::new(),
                run_started: None,
            }),
            cond: Condvar::new(),
            terminate: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            factory: DecoderFactory::new(mode),
            progress,
            events,
        });

        let mut validator =
            Validator { inner: Arc::clone(&inner), workers: Vec::with_capacity(jobs), dispatcher: None };
        for index in 0..jobs {
            let inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("decode-{index}"))
                .spawn(move || worker_loop(inner, index));
            match handle {
                Ok(handle) => validator.workers.push(handle),
                Err(err) => {
                    validator.shutdown_threads();
                    return Err(err);
                }
            }
        }
        let dispatcher = thread::Builder::new()
            .name("scan-dispatch".to_string())
            .spawn({
                let inner = Arc::clone(&inner);
                move || dispatcher_loop(inner)
            });
        match dispatcher {
            Ok(handle) => validator.dispatcher = Some(handle),
            Err(err) => {
                validator.shutdown_threads();
                return Err(err);
            }
        }
        info!(jobs, ?mode, "validator started");
        Ok(validator)
    }

    pub fn worker_count(&self) -> usize {
        self.inner.progress.workers()
    }

    pub fn progress(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.inner.progress)
    }

    /// Accepts one path: directories go to the scan dispatcher, supported
    /// files straight into the work queue. Rejected while cancellation is
    /// active; unsupported files are silently skipped. Does not wake the
    /// workers — call [`Validator::start_run`] (or use
    /// [`Validator::submit`]) once a batch is in.
    pub fn add_path(&self, path: &Path) -> bool {
        if self.inner.stopping.load(Ordering::Acquire) {
            debug!(path = %path.display(), "rejected while stopping");
            return false;
        }
        if path.is_dir() {
            let mut shared = self.inner.lock();
            shared.scan_queue.push_back(path.to_path_buf());
            self.inner.cond.notify_all();
            true
        } else if self.inner.factory.is_supported(path) {
            let total = {
                let mut shared = self.inner.lock();
                shared.work_queue.push_back(path.to_path_buf());
                shared.total_to_process += 1;
                shared.total_to_process
            };
            self.inner.send(ValidationEvent::TotalChanged(total));
            true
        } else {
            debug!(path = %path.display(), "unsupported type skipped");
            false
        }
    }

    /// Raises the pending signal, releasing every idle worker. Starting a
    /// run while all workers are idle also starts the run timer.
    pub fn start_run(&self) {
        let mut shared = self.inner.lock();
        if shared.finished.iter().all(|f| *f) {
            shared.run_started = Some(Instant::now());
        }
        shared.pending = true;
        self.inner.cond.notify_all();
        drop(shared);
        self.inner.send(ValidationEvent::Status("Running".to_string()));
    }

    /// Batch ingestion: queue everything, then wake the workers — unless a
    /// directory went to the dispatcher, in which case the dispatcher
    /// raises the signal itself once its splice is in.
    pub fn submit<I>(&self, paths: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut queued_scan = false;
        for path in paths {
            if path.is_dir() {
                queued_scan |= self.add_path(&path);
            } else {
                self.add_path(&path);
            }
        }
        if !queued_scan {
            self.start_run();
        }
    }

    /// User-initiated cancellation: drains both queues and disables
    /// further enqueue until the engine settles. A no-op while idle;
    /// repeated calls during a run cause exactly one transition. In-flight
    /// workers finish their current file.
    pub fn cancel(&self) {
        let mut shared = self.inner.lock();
        let idle = shared.finished.iter().all(|f| *f)
            && shared.work_queue.is_empty()
            && shared.scan_queue.is_empty()
            && !shared.scan_running;
        if idle {
            debug!("cancel ignored, engine idle");
            return;
        }
        if !self.inner.stopping.swap(true, Ordering::AcqRel) {
            self.inner.send(ValidationEvent::StatusTransient("Stopping...".to_string()));
        }
        shared.work_queue.clear();
        shared.scan_queue.clear();
        // Workers break on the stopping flag without observing the empty
        // queue, so the pending latch is lowered here.
        shared.pending = false;
        self.inner.cond.notify_all();
        // If nothing was actually in flight the run ends here.
        self.inner.maybe_finalize(&mut shared);
    }

    fn shutdown_threads(&mut self) {
        self.inner.terminate.store(true, Ordering::Release);
        self.inner.cond.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }

    /// Raises the terminate signal and joins every thread.
    pub fn shutdown(mut self) {
        self.shutdown_threads();
    }
}

impl Drop for Validator {
    fn drop(&mut self) {
        self.shutdown_threads();
    }
}

fn worker_loop(inner: Arc<Inner>, index: usize) {
    loop {
        // Sleep until work is pending or the engine is terminating.
        {
            let mut shared = inner.lock();
            while !shared.pending && !inner.terminate.load(Ordering::Acquire) {
                shared = inner.cond.wait(shared).unwrap_or_else(|p| p.into_inner());
            }
            if inner.terminate.load(Ordering::Acquire) {
                return;
            }
            shared.finished[index] = false;
        }

        loop {
            if inner.terminate.load(Ordering::Acquire) || inner.stopping.load(Ordering::Acquire) {
                break;
            }
            // Pop and open under the lock; see the module docs for why the
            // open is serialized.
            let opened = {
                let mut shared = inner.lock();
                match shared.work_queue.pop_front() {
                    Some(path) => {
                        let decoder = inner.factory.open(&path);
                        Some((path, decoder))
                    }
                    None => {
                        shared.pending = false;
                        None
                    }
                }
            };
            let Some((path, decoder)) = opened else { break };

            let shown = display_path(&path);
            let result = match decoder {
                Ok(mut decoder) => drain_file(decoder.as_mut(), index, &inner),
                Err(err) => Err(err),
            };
            let record = match result {
                Ok(()) => FileRecord { path: shown, outcome: Outcome::Passed },
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "file failed validation");
                    FileRecord { path: shown, outcome: Outcome::Failed { error: err.to_string() } }
                }
            };

            {
                let mut shared = inner.lock();
                shared.processed += 1;
                match &record.outcome {
                    Outcome::Passed => shared.passed.push(record.path.clone()),
                    Outcome::Failed { error } => shared
                        .failed
                        .entry(record.path.clone())
                        .or_default()
                        .push(error.clone()),
                }
            }
            inner.send(ValidationEvent::FileFinished(record));
        }

        inner.progress.set(index, 0.0);
        let mut shared = inner.lock();
        shared.finished[index] = true;
        inner.maybe_finalize(&mut shared);
    }
}

/// Streams one open file to completion, publishing this worker's
/// progress fraction after each unit. Termination (not cancellation)
/// aborts mid-file.
fn drain_file(decoder: &mut dyn Decoder, index: usize, inner: &Inner) -> Result<(), DecodeError> {
    let declared = decoder.total_units();
    let denominator = if declared == 0 { DEFAULT_TOTAL_UNITS } else { declared };
    let mut consumed: u64 = 0;
    loop {
        if inner.terminate.load(Ordering::Relaxed) {
            return Ok(());
        }
        match decoder.step()? {
            0 => return Ok(()),
            units => {
                consumed += units;
                inner.progress.set(index, consumed as f32 / denominator as f32);
            }
        }
    }
}

fn dispatcher_loop(inner: Arc<Inner>) {
    // Paths accumulate across queued folders and splice into the work
    // queue in one batch once the scan queue drains.
    let mut batch: Vec<PathBuf> = Vec::new();
    loop {
        let dir = {
            let mut shared = inner.lock();
            loop {
                if inner.terminate.load(Ordering::Acquire) {
                    return;
                }
                if let Some(dir) = shared.scan_queue.pop_front() {
                    shared.scan_running = true;
                    break dir;
                }
                shared = inner.cond.wait(shared).unwrap_or_else(|p| p.into_inner());
            }
        };

        inner.send(ValidationEvent::ScanStarted(dir.clone()));
        inner.send(ValidationEvent::StatusTransient(
            "Searching for supported files...".to_string(),
        ));
        let cancelled = || {
            inner.stopping.load(Ordering::Relaxed) || inner.terminate.load(Ordering::Relaxed)
        };
        scan_folder(&dir, &inner.factory, &cancelled, &mut |path| batch.push(path));
        debug!(dir = %dir.display(), found = batch.len(), "scan complete");
        inner.send(ValidationEvent::ScanFinished(dir));

        let mut shared = inner.lock();
        shared.scan_running = false;
        if inner.stopping.load(Ordering::Acquire) {
            // Cancelled mid-scan: the accumulated list is discarded.
            batch.clear();
            inner.maybe_finalize(&mut shared);
        } else if shared.scan_queue.is_empty() {
            let spliced = batch.len();
            shared.work_queue.extend(batch.drain(..));
            shared.total_to_process += spliced;
            // Published before the workers wake so the total is never
            // behind a finished-file notification.
            inner.send(ValidationEvent::TotalChanged(shared.total_to_process));
            inner.send(ValidationEvent::Status("Running".to_string()));
            if shared.finished.iter().all(|f| *f) {
                shared.run_started = Some(Instant::now());
            }
            shared.pending = true;
            inner.cond.notify_all();
        }
        // More folders queued: keep accumulating before waking workers.
    }
}
