//! Teams - worker pools that run container jobs.
//!
//! A function or duty bound to a team has its job handed to that team when
//! the container reaches it; unbound slots continue on whichever thread is
//! already driving the container.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::types::Result;

/// Unit of work assigned to a team.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Executes jobs.
pub trait Team: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn assign_job(&self, job: Job);

    /// Stop accepting jobs and wait up to `timeout` for running ones.
    fn stop(&self, _timeout: Duration) {}
}

/// Runs every job inline on the assigning thread.
#[derive(Debug, Clone, Default)]
pub struct PassiveTeam {
    name: String,
}

impl PassiveTeam {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Team for PassiveTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn assign_job(&self, job: Job) {
        job();
    }
}

/// Job queued on a worker pool. Runs on the dropping thread if the pool
/// shuts down before starting it.
struct PendingJob {
    team: String,
    job: Option<Job>,
}

impl PendingJob {
    fn run(mut self) {
        if let Some(job) = self.job.take() {
            job();
        }
    }
}

impl Drop for PendingJob {
    fn drop(&mut self) {
        if let Some(job) = self.job.take() {
            tracing::warn!("team_job_inline: team={}, reason=shutdown", self.team);
            job();
        }
    }
}

/// Fixed-size pool of named worker threads.
pub struct WorkerTeam {
    name: String,
    size: usize,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    stopped: AtomicBool,
}

impl WorkerTeam {
    pub fn new(name: impl Into<String>, size: usize) -> Result<Self> {
        let name = name.into();
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(size.max(1))
            .thread_name(format!("{}-worker", name))
            .enable_time()
            .build()?;
        tracing::debug!("team_started: team={}, size={}", name, size);
        Ok(Self {
            name,
            size,
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Team for WorkerTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn assign_job(&self, job: Job) {
        if self.is_stopped() {
            // Run on the caller so the job's container still completes.
            tracing::warn!("team_job_inline: team={}, reason=stopped", self.name);
            job();
            return;
        }
        let pending = PendingJob {
            team: self.name.clone(),
            job: Some(job),
        };
        // Detached; completion is observed through the container.
        drop(self.handle.spawn_blocking(move || pending.run()));
    }

    fn stop(&self, timeout: Duration) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_timeout(timeout);
        }
        tracing::debug!("team_stopped: team={}", self.name);
    }
}

impl Drop for WorkerTeam {
    fn drop(&mut self) {
        // May run on one of this team's own threads; never block here.
        let runtime = self
            .runtime
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for WorkerTeam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerTeam")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Handle for running work off the current team, available from function
/// and duty contexts.
#[derive(Debug, Clone)]
pub struct Executor {
    team: Arc<dyn Team>,
}

impl Executor {
    pub(crate) fn new(team: Arc<dyn Team>) -> Self {
        Self { team }
    }

    /// Run `work` on the executor's team.
    pub fn execute<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.team.assign_job(Box::new(work));
    }

    pub fn team_name(&self) -> &str {
        self.team.name()
    }
}
