//! Job records keyed by id.
//!
//! The registry map is only locked to insert, look up or remove a job. Each
//! job sits behind its own lock and has exactly one writer: the
//! [`JobHandle`] returned by [`JobRegistry::create`], which the scheduler
//! hands to the worker that runs the job. Everyone else gets read-only
//! snapshots through [`JobRegistry::status`] and [`JobRegistry::output`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ConvertError, ConvertResult};
use crate::models::{Artifact, Job, JobId, JobStatus, Outcome, Params, State};
use crate::progress::{ProgressSink, ProgressUpdate, MAX_RUNNING_PERCENT};

type JobCell = Arc<RwLock<Job>>;

#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, JobCell>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, id: JobId) -> Option<JobCell> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Registers a queued job and returns its only writer.
    pub fn create(&self, params: Params) -> JobHandle {
        let id = Uuid::new_v4();
        let cell = Arc::new(RwLock::new(Job::new(id, params)));
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, cell.clone());
        JobHandle { id, cell }
    }

    pub fn status(&self, id: JobId) -> ConvertResult<JobStatus> {
        let cell = self.get(id).ok_or(ConvertError::NotFound)?;
        let job = cell.read().unwrap_or_else(PoisonError::into_inner);
        Ok(job.status())
    }

    pub fn output(&self, id: JobId) -> ConvertResult<Arc<Artifact>> {
        let cell = self.get(id).ok_or(ConvertError::NotFound)?;
        let job = cell.read().unwrap_or_else(PoisonError::into_inner);
        match (&job.state, &job.outcome) {
            (State::Done, Some(Outcome::Output(artifact))) => Ok(artifact.clone()),
            _ => Err(ConvertError::NotReady),
        }
    }

    pub fn list(&self) -> Vec<JobStatus> {
        let cells: Vec<JobCell> = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut statuses: Vec<JobStatus> = cells
            .iter()
            .map(|cell| cell.read().unwrap_or_else(PoisonError::into_inner).status())
            .collect();
        statuses.sort_by_key(|s| s.created_at);
        statuses
    }

    pub fn remove(&self, id: JobId) -> bool {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Drops terminal jobs that finished more than `ttl` ago.
    pub fn expire(&self, ttl: Duration) -> Vec<JobId> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<JobId> = jobs
            .iter()
            .filter(|(_, cell)| {
                let job = cell.read().unwrap_or_else(PoisonError::into_inner);
                job.completed_at.is_some_and(|at| at.elapsed() > ttl)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            jobs.remove(id);
            info!(job_id = %id, "job expired");
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive write access to one job. Not `Clone`: whoever holds it is the
/// job's single writer, and the terminal transitions consume it.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    cell: JobCell,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    fn update<F: FnOnce(&mut Job)>(&self, f: F) {
        let mut job = self.cell.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut job)
    }

    fn advance(job: &mut Job, next: State) -> bool {
        if !job.state.can_advance_to(next) {
            warn!(job_id = %job.id, from = ?job.state, to = ?next, "ignoring illegal state transition");
            return false;
        }
        job.state = next;
        true
    }

    pub fn start(&self) {
        self.update(|job| {
            if Self::advance(job, State::Running) {
                job.started_at = Some(Utc::now());
                job.progress = 0.0;
                job.eta_seconds = None;
            }
        });
    }

    /// Progress never moves backwards and stays below 100 until done.
    pub fn report(&self, update: ProgressUpdate) {
        self.update(|job| {
            if job.state != State::Running {
                return;
            }
            job.progress = job.progress.max(update.percent.min(MAX_RUNNING_PERCENT));
            job.eta_seconds = update.eta_seconds;
        });
    }

    pub fn complete(self, artifact: Artifact) {
        self.update(|job| {
            if Self::advance(job, State::Done) {
                job.progress = 100.0;
                job.eta_seconds = None;
                job.completed_at = Some(Instant::now());
                job.outcome = Some(Outcome::Output(Arc::new(artifact)));
            }
        });
    }

    pub fn fail(self, message: impl Into<String>) {
        let message = message.into();
        self.update(|job| {
            if Self::advance(job, State::Error) {
                job.eta_seconds = None;
                job.completed_at = Some(Instant::now());
                job.outcome = Some(Outcome::Failed(message));
            }
        });
    }
}

impl ProgressSink for JobHandle {
    fn report(&mut self, update: ProgressUpdate) {
        JobHandle::report(self, update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Format;

    fn artifact() -> Artifact {
        Artifact {
            format: Format::Gif,
            bytes: b"GIF89a".to_vec(),
            frame_count: 1,
            width: 1,
            height: 1,
        }
    }

    fn update(percent: f64) -> ProgressUpdate {
        ProgressUpdate {
            percent,
            eta_seconds: Some(1.0),
        }
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let registry = JobRegistry::new();
        let id = Uuid::new_v4();
        assert!(matches!(registry.status(id), Err(ConvertError::NotFound)));
        assert!(matches!(registry.output(id), Err(ConvertError::NotFound)));
    }

    #[test]
    fn output_is_not_ready_until_done() {
        let registry = JobRegistry::new();
        let handle = registry.create(Params::default());
        let id = handle.id();
        assert_eq!(registry.status(id).unwrap().state, State::Queued);
        assert!(matches!(registry.output(id), Err(ConvertError::NotReady)));

        handle.start();
        assert!(matches!(registry.output(id), Err(ConvertError::NotReady)));

        handle.complete(artifact());
        assert_eq!(registry.output(id).unwrap().bytes, b"GIF89a");
    }

    #[test]
    fn progress_is_monotonic_and_capped_until_done() {
        let registry = JobRegistry::new();
        let handle = registry.create(Params::default());
        let id = handle.id();

        handle.report(update(50.0));
        assert_eq!(registry.status(id).unwrap().progress, 0.0);

        handle.start();
        handle.report(update(40.0));
        handle.report(update(20.0));
        assert_eq!(registry.status(id).unwrap().progress, 40.0);
        handle.report(update(100.0));
        let status = registry.status(id).unwrap();
        assert!(status.progress < 100.0);
        assert_eq!(status.eta, Some(1.0));

        handle.complete(artifact());
        let status = registry.status(id).unwrap();
        assert_eq!(status.state, State::Done);
        assert_eq!(status.progress, 100.0);
        assert_eq!(status.eta, None);
    }

    #[test]
    fn polling_a_finished_job_is_idempotent() {
        let registry = JobRegistry::new();
        let handle = registry.create(Params::default());
        let id = handle.id();
        handle.start();
        handle.complete(artifact());

        let first = registry.status(id).unwrap();
        for _ in 0..5 {
            assert_eq!(registry.status(id).unwrap(), first);
        }
        assert_eq!(first.state, State::Done);
        assert_eq!(first.progress, 100.0);
        assert_eq!(first.eta, None);
    }

    #[test]
    fn failure_is_terminal_with_message() {
        let registry = JobRegistry::new();
        let handle = registry.create(Params::default());
        let id = handle.id();
        handle.start();
        handle.fail("encoding error: ffmpeg exited");
        let status = registry.status(id).unwrap();
        assert_eq!(status.state, State::Error);
        assert_eq!(status.error.as_deref(), Some("encoding error: ffmpeg exited"));
        assert!(matches!(registry.output(id), Err(ConvertError::NotReady)));
    }

    #[test]
    fn expire_only_drops_old_terminal_jobs() {
        let registry = JobRegistry::new();
        let running = registry.create(Params::default());
        running.start();
        let done = registry.create(Params::default());
        let done_id = done.id();
        done.start();
        done.complete(artifact());

        assert!(registry.expire(Duration::from_secs(3600)).is_empty());
        std::thread::sleep(Duration::from_millis(5));
        let expired = registry.expire(Duration::ZERO);
        assert_eq!(expired, vec![done_id]);
        assert_eq!(registry.len(), 1);
        assert!(registry.status(running.id()).is_ok());
        assert!(matches!(registry.output(done_id), Err(ConvertError::NotFound)));
    }

    #[test]
    fn ids_are_unique() {
        let registry = JobRegistry::new();
        let ids: std::collections::HashSet<JobId> =
            (0..100).map(|_| registry.create(Params::default()).id()).collect();
        assert_eq!(ids.len(), 100);
        assert_eq!(registry.len(), 100);
    }
}
