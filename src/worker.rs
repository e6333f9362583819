//! Background scan worker
//!
//! Owns the pipeline on one thread and consumes a bounded frame queue.
//! Callers push frames, pause / resume automatic scanning, arm a one-shot
//! manual scan and read [`DebugSnapshot`]s; none of these wait on pipeline
//! work.
//!
//! States: `Stopped -> Idle <-> Processing -> Idle`, with `Paused` in place
//! of `Idle` while automatic frames are suppressed. The manual flag is a
//! latch consumed by the very next dequeued frame, paused or not.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::capture::Frame;
use crate::config::WorkerSettings;
use crate::error::ScanError;
use crate::pipeline::{ScanOptions, ScanPipeline, ScanReport};
use crate::shared::{DebugSnapshot, FrameCounters, LogRing, WorkerState};

/// Mutable worker state; every change republishes the snapshot
struct WorkerInner {
    state: WorkerState,
    counters: FrameCounters,
    report: Option<ScanReport>,
    logs: LogRing,
}

struct Shared {
    running: AtomicBool,
    paused: AtomicBool,
    manual: AtomicBool,
    inner: Mutex<WorkerInner>,
    snapshot: RwLock<Arc<DebugSnapshot>>,
}

impl Shared {
    /// Apply `f` and publish a fresh snapshot
    fn update(&self, f: impl FnOnce(&mut WorkerInner)) {
        let mut inner = self.inner.lock();
        f(&mut inner);
        let snapshot = DebugSnapshot {
            state: inner.state.clone(),
            paused: self.paused.load(Ordering::SeqCst),
            manual_pending: self.manual.load(Ordering::SeqCst),
            counters: inner.counters,
            report: inner.report.clone(),
            logs: inner.logs.lines(),
        };
        *self.snapshot.write() = Arc::new(snapshot);
    }

    fn log(&self, message: impl Into<String>) {
        let message = message.into();
        debug!("{}", message);
        self.update(|inner| inner.logs.push(message));
    }

    /// State to rest in between passes
    fn resting_state(&self) -> WorkerState {
        if !self.running.load(Ordering::SeqCst) {
            WorkerState::Stopped
        } else if self.paused.load(Ordering::SeqCst) {
            WorkerState::Paused
        } else {
            WorkerState::Idle
        }
    }

    fn settle(&self) {
        let state = self.resting_state();
        self.update(|inner| {
            if !matches!(inner.state, WorkerState::Processing(_)) {
                inner.state = state;
            }
        });
    }
}

/// Enqueue `frame`, pushing the oldest frame out of a full queue
///
/// Returns the number of frames dropped to make room.
pub fn enqueue_latest(tx: &Sender<Frame>, rx: &Receiver<Frame>, frame: Frame) -> u64 {
    let mut dropped = 0;
    let mut frame = frame;
    loop {
        match tx.try_send(frame) {
            Ok(()) => return dropped,
            Err(TrySendError::Full(back)) => {
                if rx.try_recv().is_ok() {
                    dropped += 1;
                }
                frame = back;
            }
            Err(TrySendError::Disconnected(_)) => return dropped + 1,
        }
    }
}

/// Background scan loop around a [`ScanPipeline`]
pub struct ScanWorker {
    pipeline: Arc<ScanPipeline>,
    options: Arc<RwLock<ScanOptions>>,
    settings: WorkerSettings,
    shared: Arc<Shared>,
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ScanWorker {
    pub fn new(pipeline: Arc<ScanPipeline>, options: ScanOptions, settings: WorkerSettings) -> Self {
        let (tx, rx) = bounded(settings.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            manual: AtomicBool::new(false),
            inner: Mutex::new(WorkerInner {
                state: WorkerState::Stopped,
                counters: FrameCounters::default(),
                report: None,
                logs: LogRing::new(settings.log_capacity),
            }),
            snapshot: RwLock::new(Arc::new(DebugSnapshot::default())),
        });

        Self {
            pipeline,
            options: Arc::new(RwLock::new(options)),
            settings,
            shared,
            tx,
            rx,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the worker thread; no-op when already running
    pub fn start(&self) -> Result<(), ScanError> {
        let mut handle = self.handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Scan worker already running");
            return Ok(());
        }
        if let Some(finished) = handle.take() {
            let _ = finished.join();
        }

        self.shared.running.store(true, Ordering::SeqCst);
        let state = self.shared.resting_state();
        self.shared.update(|inner| inner.state = state);

        let pipeline = self.pipeline.clone();
        let options = self.options.clone();
        let shared = self.shared.clone();
        let rx = self.rx.clone();
        let poll = Duration::from_millis(self.settings.poll_interval_ms.max(1));

        let spawned = std::thread::Builder::new()
            .name("scan-worker".into())
            .spawn(move || run_loop(pipeline, options, shared, rx, poll));
        match spawned {
            Ok(h) => {
                *handle = Some(h);
                self.shared.log("Worker started");
                info!("Scan worker started");
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.update(|inner| inner.state = WorkerState::Stopped);
                Err(ScanError::Io(e))
            }
        }
    }

    /// Signal the loop to exit and join it
    ///
    /// A pass in flight is abandoned at its next stage boundary and
    /// publishes nothing.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("Scan worker thread panicked");
            }
            self.shared.log("Worker stopped");
            info!("Scan worker stopped");
        }
        while self.rx.try_recv().is_ok() {}
        self.shared.update(|inner| inner.state = WorkerState::Stopped);
    }

    /// Discard automatically pushed frames until `resume`
    pub fn pause(&self) {
        if !self.shared.paused.swap(true, Ordering::SeqCst) {
            self.shared.log("Paused");
        }
        self.shared.settle();
    }

    pub fn resume(&self) {
        if self.shared.paused.swap(false, Ordering::SeqCst) {
            self.shared.log("Resumed");
        }
        self.shared.settle();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Options used for every pass from now on
    pub fn set_options(&self, options: ScanOptions) {
        *self.options.write() = options;
    }

    /// Arm the one-shot manual scan
    pub fn trigger_manual_scan(&self) {
        self.shared.manual.store(true, Ordering::SeqCst);
        self.shared.log("Manual scan armed");
    }

    /// Decode and enqueue a frame
    ///
    /// Returns `false` when the frame was discarded (worker stopped, or
    /// paused with no manual scan armed).
    pub fn push_frame(&self, bytes: &[u8]) -> Result<bool, ScanError> {
        match Frame::decode(bytes) {
            Ok(frame) => Ok(self.push_decoded(frame)),
            Err(e) => {
                self.reject(&e);
                Err(e)
            }
        }
    }

    /// [`push_frame`](Self::push_frame) for base64 / data-URL payloads
    pub fn push_frame_base64(&self, payload: &str) -> Result<bool, ScanError> {
        match Frame::decode_base64(payload) {
            Ok(frame) => Ok(self.push_decoded(frame)),
            Err(e) => {
                self.reject(&e);
                Err(e)
            }
        }
    }

    fn reject(&self, e: &ScanError) {
        warn!("Rejected frame: {}", e);
        let line = format!("Rejected frame: {}", e);
        self.shared.update(|inner| {
            inner.counters.received += 1;
            inner.counters.decode_errors += 1;
            inner.logs.push(line);
        });
    }

    /// Enqueue an already decoded frame
    pub fn push_decoded(&self, frame: Frame) -> bool {
        let accept = self.is_running()
            && (!self.shared.paused.load(Ordering::SeqCst) || self.shared.manual.load(Ordering::SeqCst));

        let dropped = if accept {
            enqueue_latest(&self.tx, &self.rx, frame)
        } else {
            1
        };
        self.shared.update(|inner| {
            inner.counters.received += 1;
            inner.counters.dropped += dropped;
        });
        accept
    }

    /// Latest published snapshot
    pub fn get_debug_snapshot(&self) -> Arc<DebugSnapshot> {
        self.shared.snapshot.read().clone()
    }
}

impl Drop for ScanWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    pipeline: Arc<ScanPipeline>,
    options: Arc<RwLock<ScanOptions>>,
    shared: Arc<Shared>,
    rx: Receiver<Frame>,
    poll: Duration,
) {
    while shared.running.load(Ordering::SeqCst) {
        let frame = match rx.recv_timeout(poll) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let manual = shared.manual.swap(false, Ordering::SeqCst);
        if shared.paused.load(Ordering::SeqCst) && !manual {
            shared.update(|inner| inner.counters.dropped += 1);
            continue;
        }

        let label = if manual { "manual scan" } else { "auto scan" };
        shared.update(|inner| {
            inner.state = WorkerState::Processing(label.to_string());
            inner.logs.push(format!("Processing frame ({})", label));
        });

        let scan_options = options.read().clone();
        let should_stop = || !shared.running.load(Ordering::SeqCst);
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            pipeline.run_pass(&frame, &scan_options, &should_stop, &mut |report: ScanReport| {
                let line = match (&report.name, &report.set_code) {
                    (Some(name), Some(code)) => {
                        format!("Matched {} ({}) in {} ms", name, code, report.elapsed_ms)
                    }
                    _ => format!("No card matched ({} ms)", report.elapsed_ms),
                };
                shared.update(|inner| {
                    inner.counters.processed += 1;
                    inner.report = Some(report);
                    inner.logs.push(line);
                });
            })
        }));
        if outcome.is_err() {
            error!("Scan pass panicked; frame skipped");
            shared.update(|inner| inner.logs.push("Scan pass failed".to_string()));
        }

        let state = shared.resting_state();
        shared.update(|inner| inner.state = state);
    }
    debug!("Scan worker loop exited");
}
