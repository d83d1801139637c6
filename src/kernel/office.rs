//! Office - the running form of linked metadata.
//!
//! An office owns its teams, its executor and the timer runtime that drives
//! asynchronous flow timeouts. Processes are started through a
//! [`FunctionManager`]. Nothing is global: closing the office stops every
//! runtime it created.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;

use super::driver;
use super::escalation::{Escalation, EscalationKind, ProcessCancelled};
use super::flow::FlowState;
use super::governance::GovernanceMetaData;
use super::metadata::{
    FunctionIndex, GovernanceIndex, ManagedFunctionMetaData, ManagedObjectIndex, OfficeMetaData,
    TeamIndex, TeamSource,
};
use super::object::ManagedObjectMetaData;
use super::observer::KernelEvent;
use super::process::{ProcessCompletion, ProcessState};
use super::team::{Executor, Job, Team, WorkerTeam};
use super::thread::ThreadState;
use crate::types::{Error, ProcessId, Result};

pub(crate) struct OfficeRuntime {
    meta: OfficeMetaData,
    teams: Vec<Arc<dyn Team>>,
    executor: Arc<dyn Team>,
    timer_handle: Handle,
    timers: Mutex<Option<Runtime>>,
    open: AtomicBool,
    object_keys: AtomicU64,
    active_processes: AtomicUsize,
    processes: Mutex<Vec<Weak<ProcessState>>>,
}

impl OfficeRuntime {
    pub(crate) fn meta(&self) -> &OfficeMetaData {
        &self.meta
    }

    pub(crate) fn function(&self, index: FunctionIndex) -> &ManagedFunctionMetaData {
        &self.meta.functions[index.0]
    }

    pub(crate) fn object(&self, index: ManagedObjectIndex) -> &ManagedObjectMetaData {
        &self.meta.objects[index.0]
    }

    pub(crate) fn governance_meta(&self, index: GovernanceIndex) -> &GovernanceMetaData {
        &self.meta.governances[index.0]
    }

    pub(crate) fn emit(&self, event: KernelEvent) {
        self.meta.observer.on_event(&event);
    }

    pub(crate) fn next_object_key(&self) -> u64 {
        self.object_keys.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn executor(&self) -> Executor {
        Executor::new(Arc::clone(&self.executor))
    }

    pub(crate) fn assign(&self, team: TeamIndex, job: Job) {
        match self.teams.get(team.0) {
            Some(team) => team.assign_job(job),
            None => tracing::error!("team_missing: team={}", team.0),
        }
    }

    /// Run `on_timeout` on the executor after `timeout` unless the returned
    /// sender is dropped first.
    pub(crate) fn schedule_timeout(
        &self,
        timeout: Duration,
        on_timeout: Job,
    ) -> Option<oneshot::Sender<()>> {
        if !self.open.load(Ordering::SeqCst) {
            return None;
        }
        let (cancel, cancelled) = oneshot::channel::<()>();
        let executor = Arc::clone(&self.executor);
        self.timer_handle.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => executor.assign_job(on_timeout),
                _ = cancelled => {}
            }
        });
        Some(cancel)
    }

    pub(crate) fn process_completed(&self) {
        self.active_processes.fetch_sub(1, Ordering::SeqCst);
    }

    fn track_process(&self, process: &Arc<ProcessState>) {
        let mut processes = self.processes.lock().unwrap_or_else(PoisonError::into_inner);
        processes.retain(|process| process.strong_count() > 0);
        processes.push(Arc::downgrade(process));
    }

    /// Terminate every process still running, so each completion callback
    /// fires with a cancellation.
    fn cancel_processes(&self) {
        let processes: Vec<Arc<ProcessState>> = self
            .processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .filter_map(|process| process.upgrade())
            .collect();
        for process in processes {
            tracing::debug!("process_cancelled: process={}, reason=office closed", process.id());
            let cancelled = Escalation::framework(
                ProcessCancelled {
                    reason: format!("office '{}' closed", self.meta.name),
                },
                EscalationKind::Cancelled,
            );
            driver::isolated(|| process.terminate(self, cancelled));
        }
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel_processes();
        let timeout = self.meta.shutdown_timeout;
        let timers = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timers) = timers {
            timers.shutdown_timeout(timeout);
        }
        for team in &self.teams {
            team.stop(timeout);
        }
        self.executor.stop(timeout);
        tracing::info!(
            "office_closed: office={}, active_processes={}",
            self.meta.name,
            self.active_processes.load(Ordering::SeqCst)
        );
    }
}

impl Drop for OfficeRuntime {
    fn drop(&mut self) {
        let timers = self
            .timers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timers) = timers {
            timers.shutdown_background();
        }
    }
}

/// A running office.
pub struct Office {
    runtime: Arc<OfficeRuntime>,
}

impl Office {
    /// Start the teams, executor and timers of linked metadata.
    pub fn open(meta: OfficeMetaData) -> Result<Self> {
        let teams = meta
            .teams
            .iter()
            .map(|team| match &team.source {
                TeamSource::Workers(size) => {
                    Ok(Arc::new(WorkerTeam::new(team.name.clone(), *size)?) as Arc<dyn Team>)
                }
                TeamSource::Custom(custom) => Ok(Arc::clone(custom)),
            })
            .collect::<Result<Vec<_>>>()?;
        let executor: Arc<dyn Team> = Arc::new(WorkerTeam::new(
            format!("{}-executor", meta.name),
            meta.executor_threads,
        )?);
        let timers = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("{}-timer", meta.name))
            .enable_time()
            .build()?;

        tracing::info!(
            "office_opened: office={}, functions={}, teams={}, manual_governance={}",
            meta.name,
            meta.functions.len(),
            teams.len(),
            meta.manual_governance
        );
        Ok(Self {
            runtime: Arc::new(OfficeRuntime {
                timer_handle: timers.handle().clone(),
                timers: Mutex::new(Some(timers)),
                meta,
                teams,
                executor,
                open: AtomicBool::new(true),
                object_keys: AtomicU64::new(0),
                active_processes: AtomicUsize::new(0),
                processes: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.runtime.meta.name
    }

    pub fn metadata(&self) -> &OfficeMetaData {
        &self.runtime.meta
    }

    pub fn is_open(&self) -> bool {
        self.runtime.open.load(Ordering::SeqCst)
    }

    pub fn active_processes(&self) -> usize {
        self.runtime.active_processes.load(Ordering::SeqCst)
    }

    pub fn function_manager(&self, name: &str) -> Result<FunctionManager> {
        let function = self
            .runtime
            .meta
            .function_index(name)
            .ok_or_else(|| Error::not_found(format!("function '{}'", name)))?;
        Ok(FunctionManager {
            office: Arc::clone(&self.runtime),
            function,
        })
    }

    /// Stop accepting processes, cancel those still running and shut down
    /// teams, executor and timers, waiting up to the configured shutdown
    /// timeout. Must not be called from a team thread.
    ///
    /// Every process still running is terminated with a
    /// [`ProcessCancelled`] escalation; its completion callback still fires.
    pub fn close(self) {
        self.runtime.close();
    }
}

impl fmt::Debug for Office {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Office")
            .field("name", &self.runtime.meta.name)
            .field("open", &self.is_open())
            .field("active_processes", &self.active_processes())
            .finish()
    }
}

/// Starts processes of one function.
#[derive(Clone)]
pub struct FunctionManager {
    office: Arc<OfficeRuntime>,
    function: FunctionIndex,
}

impl FunctionManager {
    pub fn function_name(&self) -> &str {
        &self.office.function(self.function).name
    }

    /// Start a process running the function with `parameter`.
    ///
    /// Work without a team runs on the calling thread, so `callback` may be
    /// invoked before this returns.
    pub fn invoke_process<F>(&self, parameter: Value, callback: F) -> Result<ProcessId>
    where
        F: FnOnce(ProcessCompletion) + Send + 'static,
    {
        if !self.office.open.load(Ordering::SeqCst) {
            return Err(Error::cancelled(format!(
                "office '{}' is closed",
                self.office.meta.name
            )));
        }
        let name = self.function_name().to_string();
        let process = ProcessState::new(name.clone(), Some(Box::new(callback)));
        let process_id = process.id().clone();
        self.office.active_processes.fetch_add(1, Ordering::SeqCst);
        self.office.track_process(&process);

        tracing::info!("process_started: process={}, function={}", process_id, name);
        self.office.emit(KernelEvent::ProcessStarted {
            process: process_id.clone(),
            function: name,
        });

        let _process = tracing::debug_span!("process", process = %process_id).entered();
        let thread = ThreadState::new(&self.office, process);
        let flow = FlowState::new(thread, None, None, None, true);
        driver::isolated(|| flow.begin(&self.office, self.function, parameter));
        Ok(process_id)
    }

    /// Start a process and block until it completes or `timeout` elapses.
    pub fn invoke_process_and_wait(
        &self,
        parameter: Value,
        timeout: Duration,
    ) -> Result<ProcessCompletion> {
        let (tx, rx) = mpsc::channel();
        let process_id = self.invoke_process(parameter, move |completion| {
            let _ = tx.send(completion);
        })?;
        rx.recv_timeout(timeout).map_err(|_| {
            Error::timeout(format!(
                "process {} did not complete within {:?}",
                process_id, timeout
            ))
        })
    }
}

impl fmt::Debug for FunctionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionManager")
            .field("function", &self.function_name())
            .finish()
    }
}
