//! The capture loop.
//!
//! Every cycle each due camera is moved into one task on either the
//! concurrent lane or the serial lane. The task polls the drop folder, captures
//! if that produced nothing, runs the pipeline, and sends the camera back over
//! a long-lived results channel. Tasks that miss the batch timeout are
//! abandoned: their camera stays out of its slot until the late report arrives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::camera::{Camera, CaptureOutcome};
use crate::ingest::DropFolder;
use crate::pipeline::Pipeline;
use crate::pool::WorkerPool;
use crate::watchdog::Watchdog;

pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_secs(1);
pub const DEFAULT_QUIET_WINDOW: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_BUSY_THRESHOLD: Duration = Duration::from_millis(100);

/// Process-wide stop flag, set from the signal handler.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep up to `duration`; returns early (true) on shutdown.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_triggered() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerSettings {
    pub batch_timeout: Duration,
    pub idle_sleep: Duration,
    /// Minimum time between drop-folder sweeps.
    pub quiet_window: Duration,
    /// Cycles that predicted for less than this are idle.
    pub busy_threshold: Duration,
    /// Put every camera on the serial lane.
    pub sync: bool,
    pub once: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            idle_sleep: DEFAULT_IDLE_SLEEP,
            quiet_window: DEFAULT_QUIET_WINDOW,
            busy_threshold: DEFAULT_BUSY_THRESHOLD,
            sync: false,
            once: false,
        }
    }
}

/// What one camera task did.
#[derive(Clone, Debug, Default)]
pub struct TaskOutcome {
    pub frames: usize,
    /// A drop-folder upload was processed.
    pub polled: bool,
    pub prediction_time: Duration,
    pub summary: String,
}

struct TaskReport {
    cycle: u64,
    slot: usize,
    camera: Camera,
    outcome: TaskOutcome,
}

#[derive(Clone, Debug, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub dispatched: usize,
    pub completed: usize,
    pub abandoned: usize,
    pub frames: usize,
    pub prediction_time: Duration,
    pub elapsed: Duration,
    pub polled: bool,
    pub summaries: Vec<String>,
}

impl CycleReport {
    pub fn line(&self) -> String {
        let verb = if self.polled { "Reading" } else { "Snapshoting" };
        let mut summaries = self.summaries.clone();
        summaries.sort();
        format!(
            "{} {}.. completed in {:.2}s, spent {:.2}s predicting",
            verb,
            summaries.join(","),
            self.elapsed.as_secs_f64(),
            self.prediction_time.as_secs_f64()
        )
    }
}

/// Poll, then capture if the poll produced nothing, then process.
pub fn run_task(pipeline: &Pipeline, camera: &mut Camera, poll: bool, capture: bool) -> TaskOutcome {
    let now = Instant::now();
    let mut outcome = TaskOutcome::default();
    let mut status = None;
    if poll {
        match camera.poll(now) {
            CaptureOutcome::Frame(frame) => {
                outcome.polled = true;
                return absorb(outcome, pipeline.process(camera, frame, now));
            }
            other => status = Some(other),
        }
    }
    if capture {
        match camera.capture(now) {
            CaptureOutcome::Frame(frame) => {
                return absorb(outcome, pipeline.process(camera, frame, now));
            }
            other => status = Some(other),
        }
    }
    let detail = match status {
        Some(CaptureOutcome::Skipped(remaining)) => format!("skip={}", remaining + 1),
        Some(CaptureOutcome::Duplicate) => "dup".to_string(),
        Some(CaptureOutcome::Failed(err)) => err,
        Some(CaptureOutcome::Idle) | Some(CaptureOutcome::Frame(_)) | None => {
            camera.state.last_error.clone().unwrap_or_default()
        }
    };
    outcome.summary = format!("{}=[{}]", camera.name(), detail);
    outcome
}

fn absorb(mut outcome: TaskOutcome, summary: crate::pipeline::CycleSummary) -> TaskOutcome {
    outcome.frames = 1;
    outcome.prediction_time = summary.prediction_time;
    outcome.summary = summary.line();
    outcome
}

pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    slots: Vec<Option<Camera>>,
    names: Vec<String>,
    concurrent: WorkerPool,
    serial: WorkerPool,
    results_tx: Sender<TaskReport>,
    results_rx: Receiver<TaskReport>,
    in_flight: usize,
    settings: SchedulerSettings,
    cycle: u64,
    last_sweep: Option<Instant>,
    sweeping: Arc<AtomicBool>,
    watchdog: Option<Watchdog>,
}

impl Scheduler {
    pub fn new(cameras: Vec<Camera>, pipeline: Arc<Pipeline>, settings: SchedulerSettings) -> Result<Self> {
        let concurrent_count = if settings.sync {
            0
        } else {
            cameras.iter().filter(|c| c.settings.concurrent).count()
        };
        log::info!(
            "configured {} cameras, {} concurrent workers",
            cameras.len(),
            concurrent_count.max(1)
        );
        let concurrent = WorkerPool::new("capture", concurrent_count)?;
        let serial = WorkerPool::new("serial", 1)?;
        let (results_tx, results_rx) = mpsc::channel();
        let names = cameras.iter().map(|c| c.name().to_string()).collect();
        Ok(Self {
            pipeline,
            slots: cameras.into_iter().map(Some).collect(),
            names,
            concurrent,
            serial,
            results_tx,
            results_rx,
            in_flight: 0,
            settings,
            cycle: 0,
            last_sweep: None,
            sweeping: Arc::new(AtomicBool::new(false)),
            watchdog: None,
        })
    }

    pub fn with_watchdog(mut self, watchdog: Option<Watchdog>) -> Self {
        self.watchdog = watchdog;
        self
    }

    /// Cameras currently in their slots.
    pub fn cameras(&self) -> impl Iterator<Item = &Camera> {
        self.slots.iter().flatten()
    }

    pub fn camera(&self, name: &str) -> Option<&Camera> {
        self.cameras().find(|c| c.name() == name)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Run cycles until shutdown (or once).
    pub fn run(&mut self, shutdown: &Shutdown) -> Result<()> {
        while !shutdown.is_triggered() {
            let report = self.run_cycle();
            if report.frames > 0 {
                log::debug!("{}", report.line());
            }
            if self.settings.once {
                break;
            }
            if report.prediction_time < self.settings.busy_threshold {
                let quiet = self
                    .last_sweep
                    .map_or(true, |last| last.elapsed() > self.settings.quiet_window);
                if quiet {
                    self.start_sweep();
                } else {
                    shutdown.sleep(self.settings.idle_sleep);
                }
            }
        }
        Ok(())
    }

    /// Dispatch one task per due camera and collect reports until the batch timeout.
    pub fn run_cycle(&mut self) -> CycleReport {
        self.cycle += 1;
        let started = Instant::now();
        let mut report = CycleReport {
            cycle: self.cycle,
            ..CycleReport::default()
        };
        self.drain_late();

        for slot in 0..self.slots.len() {
            let Some(camera) = self.slots[slot].as_ref() else {
                log::debug!("{} still busy from an earlier cycle", self.names[slot]);
                continue;
            };
            let poll = camera.has_drop_folder();
            let capture = camera.has_active_source()
                && camera.state.is_due(started, camera.settings.interval);
            if !poll && !capture {
                continue;
            }
            let Some(camera) = self.slots[slot].take() else {
                continue;
            };
            if self.dispatch(slot, camera, poll, capture) {
                report.dispatched += 1;
            }
        }

        let deadline = started + self.settings.batch_timeout;
        while report.completed < report.dispatched {
            let wait = deadline.saturating_duration_since(Instant::now());
            match self.results_rx.recv_timeout(wait) {
                Ok(task) => {
                    let current = task.cycle == self.cycle;
                    let outcome = self.restore(task);
                    match outcome {
                        Some(outcome) if current => {
                            report.completed += 1;
                            report.frames += outcome.frames;
                            report.polled |= outcome.polled;
                            report.prediction_time += outcome.prediction_time;
                            report.summaries.push(outcome.summary);
                        }
                        _ => {}
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        report.abandoned = report.dispatched - report.completed;
        if report.abandoned > 0 {
            log::warn!(
                "cycle {}: {} camera tasks did not finish within {:?}",
                self.cycle,
                report.abandoned,
                self.settings.batch_timeout
            );
        }
        report.elapsed = started.elapsed();

        if let Some(watchdog) = &self.watchdog {
            if let Err(err) = watchdog.ping() {
                log::warn!("watchdog ping failed: {:#}", err);
            }
        }
        report
    }

    fn dispatch(&mut self, slot: usize, camera: Camera, poll: bool, capture: bool) -> bool {
        let pipeline = Arc::clone(&self.pipeline);
        let tx = self.results_tx.clone();
        let cycle = self.cycle;
        let lane = if camera.settings.concurrent && !self.settings.sync {
            &self.concurrent
        } else {
            &self.serial
        };
        // Handed back to the slot if the job never reaches a worker.
        let cell = Arc::new(Mutex::new(Some(camera)));
        let task_cell = Arc::clone(&cell);
        let queued = lane.execute(move || {
            let taken = task_cell.lock().ok().and_then(|mut c| c.take());
            let Some(mut camera) = taken else {
                return;
            };
            let outcome = run_task(&pipeline, &mut camera, poll, capture);
            let _ = tx.send(TaskReport {
                cycle,
                slot,
                camera,
                outcome,
            });
        });
        match queued {
            Ok(()) => {
                self.in_flight += 1;
                true
            }
            Err(err) => {
                log::error!("{}: could not queue capture: {:#}", self.names[slot], err);
                self.slots[slot] = cell.lock().ok().and_then(|mut c| c.take());
                false
            }
        }
    }

    /// Put the camera back in its slot; outcomes of earlier cycles are dropped.
    fn restore(&mut self, task: TaskReport) -> Option<TaskOutcome> {
        self.in_flight = self.in_flight.saturating_sub(1);
        let late = task.cycle != self.cycle;
        if late {
            log::info!(
                "{}: late report from cycle {} discarded",
                task.camera.name(),
                task.cycle
            );
        }
        self.slots[task.slot] = Some(task.camera);
        (!late).then_some(task.outcome)
    }

    fn drain_late(&mut self) {
        while let Ok(task) = self.results_rx.try_recv() {
            self.restore(task);
        }
    }

    fn start_sweep(&mut self) {
        self.last_sweep = Some(Instant::now());
        if self.sweeping.swap(true, Ordering::SeqCst) {
            return;
        }
        let folders: Vec<DropFolder> = self
            .cameras()
            .filter_map(|c| c.settings.drop_folder.clone())
            .collect();
        if folders.is_empty() {
            self.sweeping.store(false, Ordering::SeqCst);
            return;
        }
        let sweeping = Arc::clone(&self.sweeping);
        log::debug!("cleaning up {} drop folders", folders.len());
        std::thread::spawn(move || {
            for folder in folders {
                match folder.sweep() {
                    Ok(removed) if removed > 0 => {
                        log::info!("removed {} stale files under {}", removed, folder.root().display())
                    }
                    Ok(_) => {}
                    Err(err) => log::warn!("cleanup of {} failed: {:#}", folder.root().display(), err),
                }
            }
            sweeping.store(false, Ordering::SeqCst);
        });
    }

    /// Wait up to the batch timeout for in-flight tasks, then stop the pools.
    pub fn close(mut self) {
        let deadline = Instant::now() + self.settings.batch_timeout;
        while self.in_flight > 0 {
            let wait = deadline.saturating_duration_since(Instant::now());
            match self.results_rx.recv_timeout(wait) {
                Ok(task) => {
                    self.restore(task);
                }
                Err(_) => break,
            }
        }
        if self.in_flight > 0 {
            log::warn!("{} camera tasks still running at shutdown", self.in_flight);
        }
        let grace = Duration::from_secs(1);
        let detached = self.concurrent.close(grace) + self.serial.close(grace);
        if detached > 0 {
            log::warn!("detached {} busy workers", detached);
        }
    }
}
