//! Bounded worker pool that runs queued conversions off the request thread.
//!
//! Capacity policy: `workers` jobs run at once and up to `queue_depth` more
//! wait in the channel. A submission that would exceed `workers +
//! queue_depth` in-flight jobs is rejected with a capacity error before any
//! job record exists.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{error, info, warn};

use crate::error::{ConvertError, ConvertResult};
use crate::models::{Inputs, JobId, Limits, Params};
use crate::pipeline::Pipeline;
use crate::registry::{JobHandle, JobRegistry};

struct Slots {
    in_flight: AtomicUsize,
    capacity: usize,
}

/// One reserved place in the pool; released when dropped.
pub struct Slot {
    slots: Arc<Slots>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.slots.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Work {
    handle: JobHandle,
    params: Params,
    inputs: Inputs,
    _slot: Slot,
}

pub struct Scheduler {
    registry: Arc<JobRegistry>,
    channel: Option<SyncSender<Work>>,
    slots: Arc<Slots>,
    limits: Limits,
    workers: Vec<JoinHandle<()>>,
}

/// Seed for a job's Ken-Burns path and jitter when the caller supplied none.
pub fn seed_for(id: JobId) -> u64 {
    let (hi, lo) = id.as_u64_pair();
    hi ^ lo
}

impl Scheduler {
    /// Starts `workers` conversion threads. Fails if any of them cannot be
    /// spawned.
    pub fn new(
        registry: Arc<JobRegistry>,
        pipeline: Arc<Pipeline>,
        workers: usize,
        queue_depth: usize,
    ) -> io::Result<Self> {
        let workers = workers.max(1);
        let capacity = workers + queue_depth;
        let limits = *pipeline.limits();
        let (tx, rx) = mpsc::sync_channel(capacity);
        let rx = Arc::new(Mutex::new(rx));

        let handles = spawn_workers(workers, |index| {
            let rx = rx.clone();
            let pipeline = pipeline.clone();
            thread::Builder::new()
                .name(format!("convert-worker-{index}"))
                .spawn(move || processor(index, rx, pipeline))
        })
        .inspect_err(|err| error!("failed to spawn conversion worker: {err}"))?;

        Ok(Self {
            registry,
            channel: Some(tx),
            slots: Arc::new(Slots {
                in_flight: AtomicUsize::new(0),
                capacity,
            }),
            limits,
            workers: handles,
        })
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.slots.in_flight.load(Ordering::Acquire)
    }

    /// Claims a place in the pool, or fails with a capacity error when every
    /// worker is busy and the queue is full.
    pub fn reserve(&self) -> ConvertResult<Slot> {
        let capacity = self.slots.capacity;
        self.slots
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .map_err(|n| {
                ConvertError::capacity(format!("{n} conversions already running or queued"))
            })?;
        Ok(Slot {
            slots: self.slots.clone(),
        })
    }

    /// Validates, reserves capacity and queues the job.
    pub fn submit(&self, params: Params, inputs: Inputs) -> ConvertResult<JobId> {
        params.validate(&self.limits)?;
        params.validate_input_count(inputs.len(), &self.limits)?;
        let slot = self.reserve()?;
        self.submit_reserved(slot, params, inputs)
    }

    /// Queues a job on a slot reserved earlier, for callers that reserve
    /// before fetching their inputs.
    pub fn submit_reserved(
        &self,
        slot: Slot,
        params: Params,
        inputs: Inputs,
    ) -> ConvertResult<JobId> {
        params.validate(&self.limits)?;
        params.validate_input_count(inputs.len(), &self.limits)?;

        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| ConvertError::capacity("scheduler is shut down"))?;

        let handle = self.registry.create(params.clone());
        let id = handle.id();

        let work = Work {
            handle,
            params,
            inputs,
            _slot: slot,
        };

        if let Err(mpsc::SendError(work)) = channel.send(work) {
            self.registry.remove(id);
            work.handle.fail("scheduler is shut down");
            return Err(ConvertError::capacity("scheduler is shut down"));
        }

        info!(job_id = %id, "job queued");
        Ok(id)
    }

    /// Stops accepting work and waits for running and queued jobs to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        drop(self.channel.take());
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("conversion worker panicked during shutdown");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawns `count` workers, stopping at the first failure. Workers already
/// started exit on their own once the channel sender is dropped.
fn spawn_workers<F>(count: usize, spawn: F) -> io::Result<Vec<JoinHandle<()>>>
where
    F: FnMut(usize) -> io::Result<JoinHandle<()>>,
{
    (0..count).map(spawn).collect()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

fn process_job(work: Work, pipeline: &Pipeline) {
    let Work {
        mut handle,
        params,
        inputs,
        _slot,
    } = work;
    let id = handle.id();
    let seed = params.seed.unwrap_or_else(|| seed_for(id));

    handle.start();
    info!(job_id = %id, mode = ?params.mode, format = ?params.format, "conversion started");

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        pipeline.run(&params, &inputs, seed, &mut handle)
    }));

    match result {
        Ok(Ok(artifact)) => {
            info!(
                job_id = %id,
                frames = artifact.frame_count,
                bytes = artifact.bytes.len(),
                "conversion complete"
            );
            handle.complete(artifact);
        }
        Ok(Err(err)) => {
            warn!(job_id = %id, "conversion ended with error: {err}");
            handle.fail(err.to_string());
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(job_id = %id, "conversion panicked: {message}");
            handle.fail(format!("internal error: {message}"));
        }
    }
}

fn processor(index: usize, rx: Arc<Mutex<Receiver<Work>>>, pipeline: Arc<Pipeline>) {
    info!(worker = index, "starting conversion worker");

    loop {
        let next = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
        match next {
            Ok(work) => process_job(work, &pipeline),
            Err(_) => {
                info!(worker = index, "conversion worker shutdown");
                return;
            }
        }
    }
}
