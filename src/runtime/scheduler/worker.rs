//! Device workers
//!
//! One thread per physical device drains that device's job queue, so a
//! device never runs two artifacts at once.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, trace};

use crate::runtime::context::ExecutionContext;
use crate::runtime::dag::TaskIndex;
use crate::runtime::device::{DeviceId, DeviceManager};
use crate::runtime::executor::ExecutionError;

/// Why a job did not succeed.
#[derive(Debug)]
pub(super) enum JobFailure {
    /// The device reported an error
    Execution(ExecutionError),
    /// The artifact panicked
    Panicked(String),
}

/// Result of one job, sent back to the dispatching request.
#[derive(Debug)]
pub(super) struct Completion {
    pub index: TaskIndex,
    pub elapsed_us: u64,
    pub result: Result<(), JobFailure>,
}

/// One task of one request, queued on a device.
pub(super) struct Job {
    pub index: TaskIndex,
    pub task: String,
    pub ctx: Arc<ExecutionContext>,
    pub done: Sender<Completion>,
}

/// Queue and thread of one device.
#[derive(Debug)]
pub(super) struct DeviceWorker {
    device: DeviceId,
    sender: Option<Sender<Job>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DeviceWorker {
    /// Spawn the worker thread of `device`.
    pub(super) fn spawn(
        device: Arc<dyn DeviceManager>,
        thread_name_prefix: &str,
        queue_capacity: Option<usize>,
    ) -> std::io::Result<Self> {
        let (sender, receiver) = match queue_capacity {
            Some(capacity) => channel::bounded(capacity),
            None => channel::unbounded(),
        };
        let id = device.id();
        let handle = thread::Builder::new()
            .name(format!("{}-{}", thread_name_prefix, id))
            .spawn(move || Self::worker_loop(device, receiver))?;

        Ok(Self {
            device: id,
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Queue `job`; gives it back if the worker is gone.
    pub(super) fn submit(
        &self,
        job: Job,
    ) -> Result<(), Job> {
        match &self.sender {
            Some(sender) => sender.send(job).map_err(|err| err.into_inner()),
            None => Err(job),
        }
    }

    /// Close the queue and wait for the thread to drain it.
    pub(super) fn shutdown(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                debug!(device = self.device, "device worker exited by panic");
            }
        }
    }

    fn worker_loop(
        device: Arc<dyn DeviceManager>,
        receiver: Receiver<Job>,
    ) {
        debug!(device = device.id(), "device worker started");

        for job in receiver.iter() {
            trace!(device = device.id(), task = %job.task, "running task");
            let start = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| device.run(&job.task, &job.ctx)));
            let result = match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(JobFailure::Execution(err)),
                Err(payload) => Err(JobFailure::Panicked(panic_message(payload))),
            };

            let completion = Completion {
                index: job.index,
                elapsed_us: start.elapsed().as_micros() as u64,
                result,
            };
            // The request may have given up on this job already.
            let _ = job.done.send(completion);
        }

        debug!(device = device.id(), "device worker stopped");
    }
}

impl Drop for DeviceWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "task panicked".to_string()
}
