//! jobs::memory
//!
//! In-memory job substrate for deterministic testing.
//!
//! Stores submitted jobs in a vector and lets tests flip job states to
//! simulate out-of-order result arrival. Clones share state.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::traits::{Job, JobError, JobSpec, JobState, JobSubstrate};

/// In-memory substrate.
#[derive(Debug, Clone, Default)]
pub struct InMemorySubstrate {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: Vec<Job>,
    fail_submit: Option<JobError>,
}

impl InMemorySubstrate {
    /// Create an empty substrate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a job in a given state, bypassing `submit`.
    pub fn seed(&self, job: Job) {
        self.inner.lock().unwrap().jobs.push(job);
    }

    /// Flip the state of every job with this name and refs key.
    pub fn set_state(&self, name: &str, refs_key: &str, state: JobState) {
        let mut inner = self.inner.lock().unwrap();
        for job in &mut inner.jobs {
            if job.name == name && job.refs.key() == refs_key {
                job.state = state;
            }
        }
    }

    /// Make the next submissions fail with `error`.
    pub fn fail_submissions(&self, error: JobError) {
        self.inner.lock().unwrap().fail_submit = Some(error);
    }

    /// Stop failing submissions.
    pub fn accept_submissions(&self) {
        self.inner.lock().unwrap().fail_submit = None;
    }

    /// Names of all submitted jobs, in call order.
    pub fn submitted_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .iter()
            .map(|j| j.name.clone())
            .collect()
    }
}

#[async_trait]
impl JobSubstrate for InMemorySubstrate {
    async fn submit(&self, spec: &JobSpec) -> Result<(), JobError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(e) = &inner.fail_submit {
            return Err(e.clone());
        }
        inner.jobs.push(Job {
            name: spec.name.clone(),
            queue_key: spec.queue_key.clone(),
            refs: spec.refs.clone(),
            state: JobState::Triggered,
        });
        Ok(())
    }

    async fn jobs(&self) -> Result<Vec<Job>, JobError> {
        Ok(self.inner.lock().unwrap().jobs.clone())
    }

    async fn abort(&self, name: &str, refs_key: &str) -> Result<(), JobError> {
        let mut inner = self.inner.lock().unwrap();
        for job in &mut inner.jobs {
            if job.name == name && job.refs.key() == refs_key && job.state.is_active() {
                job.state = JobState::Aborted;
            }
        }
        Ok(())
    }
}
