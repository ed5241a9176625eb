//! Request dispatcher
//!
//! The [`Dispatcher`] runs a provisioned [`Schedule`] for one request. Each
//! physical device has one worker thread draining its own queue; a task is
//! queued on the device it was provisioned to once all of its parents have
//! finished.
//!
//! On the first failure no further task is launched. Tasks already in flight
//! drain, tasks never launched are reported as cancelled, and the request
//! fails with the first error.

mod report;
mod worker;

pub use report::{RunReport, TaskRecord, TaskState};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::runtime::context::ExecutionContext;
use crate::runtime::dag::{DagError, Schedule, TaskIndex};
use crate::runtime::device::{DeviceId, DeviceManagerMap};
use crate::runtime::executor::ExecutionError;
use crate::runtime::trace::{TraceEvent, TraceLevel};

use worker::{Completion, DeviceWorker, Job, JobFailure};

fn default_thread_name_prefix() -> String {
    "nnrt-device".to_string()
}

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Worker threads are named `{prefix}-{device id}`.
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
    /// Bound of each device queue; unbounded when absent.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: default_thread_name_prefix(),
            queue_capacity: None,
        }
    }
}

/// Dispatcher statistics, accumulated over every request.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Total tasks queued on a device.
    pub tasks_scheduled: AtomicUsize,
    /// Total tasks finished.
    pub tasks_completed: AtomicUsize,
    /// Total tasks failed.
    pub tasks_failed: AtomicUsize,
    /// Total tasks cancelled.
    pub tasks_cancelled: AtomicUsize,
    /// Total execution time in microseconds.
    pub total_exec_time_us: AtomicUsize,
    /// Peak number of tasks in flight within one request.
    pub peak_parallelism: AtomicUsize,
}

impl DispatchStats {
    /// Record a queued task.
    #[inline]
    pub fn record_scheduled(&self) {
        self.tasks_scheduled.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a finished task.
    #[inline]
    pub fn record_completed(
        &self,
        duration_us: usize,
    ) {
        self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        self.total_exec_time_us
            .fetch_add(duration_us, Ordering::SeqCst);
    }

    /// Record a failed task.
    #[inline]
    pub fn record_failed(
        &self,
        duration_us: usize,
    ) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        self.total_exec_time_us
            .fetch_add(duration_us, Ordering::SeqCst);
    }

    /// Record cancelled tasks.
    #[inline]
    pub fn record_cancelled(
        &self,
        count: usize,
    ) {
        self.tasks_cancelled.fetch_add(count, Ordering::SeqCst);
    }

    /// Update parallelism.
    #[inline]
    pub fn update_parallelism(
        &self,
        current: usize,
    ) {
        loop {
            let peak = self.peak_parallelism.load(Ordering::SeqCst);
            if current <= peak {
                break;
            }
            if self
                .peak_parallelism
                .compare_exchange(peak, current, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
    }
}

/// Errors raised while dispatching a request.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A task has no physical device
    #[error("task `{0}` has not been provisioned")]
    NotProvisioned(String),
    /// A task was provisioned to a device this dispatcher does not drive
    #[error("task `{task}` is placed on unknown device {device}")]
    UnknownDevice { task: String, device: DeviceId },
    /// The schedule is not a DAG
    #[error(transparent)]
    Dag(#[from] DagError),
    /// A task failed; the report holds every task's final state
    #[error("task `{task}` failed: {source}")]
    TaskFailed {
        task: String,
        #[source]
        source: ExecutionError,
        report: Box<RunReport>,
    },
    /// A task panicked; the report holds every task's final state
    #[error("task `{task}` panicked: {message}")]
    TaskPanicked {
        task: String,
        message: String,
        report: Box<RunReport>,
    },
    /// A device worker stopped accepting jobs
    #[error("worker of device {device} is gone")]
    WorkerLost {
        device: DeviceId,
        report: Box<RunReport>,
    },
    /// A worker thread could not be spawned
    #[error("failed to spawn worker of device {device}: {message}")]
    Spawn { device: DeviceId, message: String },
}

impl DispatchError {
    /// Report of the failed request, when tasks were dispatched.
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            DispatchError::TaskFailed { report, .. }
            | DispatchError::TaskPanicked { report, .. }
            | DispatchError::WorkerLost { report, .. } => Some(report),
            _ => None,
        }
    }
}

/// First failure seen by a request.
enum Failure {
    Task { index: TaskIndex, source: ExecutionError },
    Panic { index: TaskIndex, message: String },
    Worker { device: DeviceId },
}

/// Dispatches provisioned schedules onto per-device workers.
#[derive(Debug)]
pub struct Dispatcher {
    /// Configuration.
    config: DispatcherConfig,
    /// One worker per device.
    workers: BTreeMap<DeviceId, DeviceWorker>,
    /// Statistics.
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    /// Spawn one worker per device with the default configuration.
    pub fn new(devices: &DeviceManagerMap) -> Result<Self, DispatchError> {
        Self::with_config(devices, DispatcherConfig::default())
    }

    /// Spawn one worker per device.
    pub fn with_config(
        devices: &DeviceManagerMap,
        config: DispatcherConfig,
    ) -> Result<Self, DispatchError> {
        let mut workers = BTreeMap::new();
        for (&id, device) in devices {
            let worker = DeviceWorker::spawn(
                Arc::clone(device),
                &config.thread_name_prefix,
                config.queue_capacity,
            )
            .map_err(|err| DispatchError::Spawn {
                device: id,
                message: err.to_string(),
            })?;
            workers.insert(id, worker);
        }
        info!(workers = workers.len(), "dispatcher started");

        Ok(Self {
            config,
            workers,
            stats: Arc::new(DispatchStats::default()),
        })
    }

    /// Get configuration.
    #[inline]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Get statistics.
    #[inline]
    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Get the number of workers.
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Check if the dispatcher accepts requests.
    #[inline]
    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Run every task of `schedule` for the request in `ctx`.
    pub fn run(
        &self,
        schedule: &Schedule,
        ctx: Arc<ExecutionContext>,
    ) -> Result<RunReport, DispatchError> {
        for task in schedule.tasks() {
            let device = *task
                .devices()
                .first()
                .ok_or_else(|| DispatchError::NotProvisioned(task.name.clone()))?;
            if !self.workers.contains_key(&device) {
                return Err(DispatchError::UnknownDevice {
                    task: task.name.clone(),
                    device,
                });
            }
        }
        schedule.topological_order()?;

        debug!(schedule = %schedule.function_name, tasks = schedule.len(), "dispatching request");

        let mut run = RequestRun::new(schedule, ctx, &self.stats);
        let (done_tx, done_rx) = channel::unbounded::<Completion>();

        for index in schedule.roots() {
            run.launch(index, &self.workers, &done_tx);
        }

        while run.in_flight > 0 {
            let Ok(completion) = done_rx.recv() else {
                break;
            };
            run.in_flight -= 1;
            let index = completion.index;
            run.records[index].elapsed_us = Some(completion.elapsed_us);
            run.emit_request_event(index);

            match completion.result {
                Ok(()) => {
                    run.records[index].state = TaskState::Finished;
                    self.stats
                        .record_completed(completion.elapsed_us as usize);
                    if run.failure.is_some() {
                        continue;
                    }
                    for &child in schedule.tasks()[index].children() {
                        run.pending[child] -= 1;
                        if run.pending[child] == 0 {
                            run.launch(child, &self.workers, &done_tx);
                        }
                    }
                }
                Err(failure) => {
                    run.records[index].state = TaskState::Failed;
                    self.stats.record_failed(completion.elapsed_us as usize);
                    warn!(task = %run.records[index].name, "task failed");
                    if run.failure.is_none() {
                        run.failure = Some(match failure {
                            JobFailure::Execution(source) => Failure::Task { index, source },
                            JobFailure::Panicked(message) => Failure::Panic { index, message },
                        });
                    }
                }
            }
        }

        run.finish()
    }

    /// Stop every worker after draining queued jobs.
    pub fn shutdown(&mut self) {
        for worker in self.workers.values_mut() {
            worker.shutdown();
        }
        self.workers.clear();
        info!("dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.is_running() {
            self.shutdown();
        }
    }
}

/// Bookkeeping of one request.
struct RequestRun<'a> {
    schedule: &'a Schedule,
    ctx: Arc<ExecutionContext>,
    stats: &'a DispatchStats,
    /// Unfinished parents per task
    pending: Vec<usize>,
    records: Vec<TaskRecord>,
    /// Trace start timestamps per task
    started_at: Vec<u64>,
    in_flight: usize,
    failure: Option<Failure>,
}

impl<'a> RequestRun<'a> {
    fn new(
        schedule: &'a Schedule,
        ctx: Arc<ExecutionContext>,
        stats: &'a DispatchStats,
    ) -> Self {
        let records = schedule
            .tasks()
            .iter()
            .map(|task| TaskRecord {
                name: task.name.clone(),
                device: task.devices().first().copied(),
                state: TaskState::Waiting,
                elapsed_us: None,
            })
            .collect();
        Self {
            schedule,
            ctx,
            stats,
            pending: schedule.tasks().iter().map(|t| t.parents().len()).collect(),
            records,
            started_at: vec![0; schedule.len()],
            in_flight: 0,
            failure: None,
        }
    }

    fn launch(
        &mut self,
        index: TaskIndex,
        workers: &BTreeMap<DeviceId, DeviceWorker>,
        done: &channel::Sender<Completion>,
    ) {
        let task = &self.schedule.tasks()[index];
        let Some(device) = task.devices().first().copied() else {
            return;
        };
        let Some(worker) = workers.get(&device) else {
            return;
        };

        if let Some(sink) = self.ctx.trace() {
            self.started_at[index] = sink.now_micros();
        }

        let job = Job {
            index,
            task: task.name.clone(),
            ctx: Arc::clone(&self.ctx),
            done: done.clone(),
        };
        if worker.submit(job).is_err() {
            self.records[index].state = TaskState::Failed;
            if self.failure.is_none() {
                self.failure = Some(Failure::Worker { device });
            }
            return;
        }

        self.records[index].state = TaskState::Running;
        self.in_flight += 1;
        self.stats.record_scheduled();
        self.stats.update_parallelism(self.in_flight);
    }

    /// Record a request-level event spanning the task's time in the dispatcher.
    fn emit_request_event(
        &self,
        index: TaskIndex,
    ) {
        let Some(sink) = self.ctx.trace() else {
            return;
        };
        if !sink.should_log(TraceLevel::REQUEST) {
            return;
        }
        let record = &self.records[index];
        sink.log_event(TraceEvent::complete(
            record.name.clone(),
            self.started_at[index],
            sink.now_micros(),
            record.device.unwrap_or_default(),
        ));
    }

    fn finish(mut self) -> Result<RunReport, DispatchError> {
        let mut cancelled = 0;
        for record in &mut self.records {
            if !record.state.is_terminal() {
                record.state = TaskState::Cancelled;
                cancelled += 1;
            }
        }
        self.stats.record_cancelled(cancelled);

        let report = RunReport::new(self.schedule.function_name.clone(), self.records);
        match self.failure {
            None => {
                debug!(schedule = %report.schedule, "request finished");
                Ok(report)
            }
            Some(Failure::Task { index, source }) => Err(DispatchError::TaskFailed {
                task: report.tasks()[index].name.clone(),
                source,
                report: Box::new(report),
            }),
            Some(Failure::Panic { index, message }) => Err(DispatchError::TaskPanicked {
                task: report.tasks()[index].name.clone(),
                message,
                report: Box::new(report),
            }),
            Some(Failure::Worker { device }) => Err(DispatchError::WorkerLost {
                device,
                report: Box::new(report),
            }),
        }
    }
}

#[cfg(test)]
mod tests;
