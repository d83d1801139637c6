//! Process state - one invocation of a function manager.
//!
//! A process owns the process-scoped objects and counts its thread states.
//! When the last thread completes, process objects are recycled and the
//! completion callback receives a [`ProcessCompletion`].
//!
//! Lifecycle:
//! ```text
//! NEW → RUNNING → COMPLETE
//!          └→ TERMINATING → COMPLETE
//! ```

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::escalation::Escalation;
use super::flow::AsynchronousFlow;
use super::object::ObjectScopeState;
use super::observer::KernelEvent;
use super::office::OfficeRuntime;
use super::recovery::with_recovery;
use super::types::{ManagedObjectScope, ProcessStatus};
use crate::types::ProcessId;

/// Receives the completion of a process exactly once.
pub type ProcessCallback = Box<dyn FnOnce(ProcessCompletion) + Send + 'static>;

/// Final report of a process.
#[derive(Debug, Clone)]
pub struct ProcessCompletion {
    pub process_id: ProcessId,
    pub function: String,
    /// Return value of the invoked flow, or the escalation that terminated it.
    pub outcome: Result<Value, Escalation>,
    /// Recycle and disregard failures; these never abort teardown.
    pub cleanup_escalations: Vec<Escalation>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ProcessCompletion {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn escalation(&self) -> Option<&Escalation> {
        self.outcome.as_ref().err()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }
}

struct ProcessInner {
    status: ProcessStatus,
    active_threads: usize,
    result: Option<Value>,
    failure: Option<Escalation>,
    cleanup: Vec<Escalation>,
    callback: Option<ProcessCallback>,
}

pub(crate) struct ProcessState {
    id: ProcessId,
    function: String,
    objects: ObjectScopeState,
    started_at: DateTime<Utc>,
    inner: Mutex<ProcessInner>,
    /// Unsettled flows keep their parked containers, and so this process,
    /// alive until settled or cancelled.
    asynchronous_flows: Mutex<Vec<AsynchronousFlow>>,
}

impl ProcessState {
    pub(crate) fn new(function: impl Into<String>, callback: Option<ProcessCallback>) -> Arc<Self> {
        Arc::new(Self {
            id: ProcessId::new(),
            function: function.into(),
            objects: ObjectScopeState::new(ManagedObjectScope::Process),
            started_at: Utc::now(),
            inner: Mutex::new(ProcessInner {
                status: ProcessStatus::New,
                active_threads: 0,
                result: None,
                failure: None,
                cleanup: Vec::new(),
                callback,
            }),
            asynchronous_flows: Mutex::new(Vec::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ProcessInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> &ProcessId {
        &self.id
    }

    pub(crate) fn objects(&self) -> &ObjectScopeState {
        &self.objects
    }

    pub(crate) fn status(&self) -> ProcessStatus {
        self.lock().status
    }

    pub(crate) fn is_terminating(&self) -> bool {
        self.status() == ProcessStatus::Terminating
    }

    pub(crate) fn thread_started(&self) {
        let mut inner = self.lock();
        if inner.status == ProcessStatus::New {
            inner.status = ProcessStatus::Running;
        }
        inner.active_threads += 1;
    }

    pub(crate) fn record_result(&self, value: Value) {
        self.lock().result.get_or_insert(value);
    }

    pub(crate) fn record_cleanup(&self, cleanup: Vec<Escalation>) {
        if !cleanup.is_empty() {
            self.lock().cleanup.extend(cleanup);
        }
    }

    /// Track an asynchronous flow so termination can cancel it.
    pub(crate) fn track_asynchronous_flow(&self, flow: &AsynchronousFlow) {
        {
            let mut flows = self
                .asynchronous_flows
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            flows.retain(|flow| !flow.is_settled());
            flows.push(flow.clone());
        }
        if self.is_terminating() {
            flow.cancel("process terminated");
        }
    }

    /// Fail the process and cancel its outstanding asynchronous flows.
    pub(crate) fn terminate(&self, office: &OfficeRuntime, escalation: Escalation) {
        {
            let mut inner = self.lock();
            if inner.failure.is_none() {
                inner.failure = Some(escalation.clone());
            }
            if !inner.status.can_transition_to(ProcessStatus::Terminating) {
                return;
            }
            inner.status = ProcessStatus::Terminating;
        }
        tracing::warn!(
            "process_terminating: process={}, escalation={}",
            self.id,
            escalation
        );
        office.emit(KernelEvent::EscalationRaised {
            kind: escalation.kind(),
            source: escalation.source().to_string(),
            cause: escalation.cause().to_string(),
        });

        let flows: Vec<AsynchronousFlow> = self
            .asynchronous_flows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for flow in flows {
            flow.cancel("process terminated");
        }
    }

    pub(crate) fn thread_completed(&self, office: &OfficeRuntime) {
        {
            let mut inner = self.lock();
            inner.active_threads = inner.active_threads.saturating_sub(1);
            if inner.active_threads > 0 {
                return;
            }
        }

        let cleanup = self.objects.unload(office);
        let (completion, callback) = {
            let mut inner = self.lock();
            inner.cleanup.extend(cleanup);
            inner.status = ProcessStatus::Complete;
            let outcome = match inner.failure.take() {
                Some(failure) => Err(failure),
                None => Ok(inner.result.take().unwrap_or_default()),
            };
            let completion = ProcessCompletion {
                process_id: self.id.clone(),
                function: self.function.clone(),
                outcome,
                cleanup_escalations: std::mem::take(&mut inner.cleanup),
                started_at: self.started_at,
                completed_at: Utc::now(),
            };
            (completion, inner.callback.take())
        };

        tracing::info!(
            "process_completed: process={}, function={}, success={}, cleanup={}, duration_ms={}",
            self.id,
            self.function,
            completion.is_success(),
            completion.cleanup_escalations.len(),
            completion.duration().num_milliseconds()
        );
        office.emit(KernelEvent::ProcessCompleted {
            process: self.id.clone(),
            success: completion.is_success(),
        });
        office.process_completed();

        if let Some(callback) = callback {
            let operation = format!("completion callback of process {}", self.id);
            if let Err(err) = with_recovery(
                || {
                    callback(completion);
                    Ok(())
                },
                &operation,
            ) {
                tracing::error!("process_callback_failed: process={}, error={}", self.id, err);
            }
        }
    }
}

impl fmt::Debug for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessState")
            .field("id", &self.id)
            .field("function", &self.function)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_starts_running_on_first_thread() {
        let process = ProcessState::new("task", None);
        assert_eq!(process.status(), ProcessStatus::New);
        process.thread_started();
        assert_eq!(process.status(), ProcessStatus::Running);
        assert!(!process.is_terminating());
    }

    #[test]
    fn test_first_result_wins() {
        let process = ProcessState::new("task", None);
        process.record_result(Value::from(1));
        process.record_result(Value::from(2));
        assert_eq!(process.lock().result, Some(Value::from(1)));
    }
}
