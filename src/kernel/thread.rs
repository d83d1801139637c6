//! Thread state - one line of execution within a process.
//!
//! A thread state owns the thread-scoped objects and the governance
//! containers. It completes when its last active flow completes, at which
//! point governance is concluded, thread-scoped objects are recycled and the
//! process is notified.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::escalation::{Escalation, EscalationKind, EscalationSource};
use super::governance::{self, ThreadGovernance};
use super::object::ObjectScopeState;
use super::office::OfficeRuntime;
use super::process::ProcessState;
use super::types::ManagedObjectScope;

pub(crate) struct ThreadState {
    process: Arc<ProcessState>,
    objects: ObjectScopeState,
    governance: ThreadGovernance,
    active_flows: AtomicUsize,
}

impl ThreadState {
    /// Create a thread state and count it against its process.
    pub(crate) fn new(office: &OfficeRuntime, process: Arc<ProcessState>) -> Arc<Self> {
        process.thread_started();
        Arc::new(Self {
            process,
            objects: ObjectScopeState::new(ManagedObjectScope::Thread),
            governance: ThreadGovernance::new(office.meta().governances.len()),
            active_flows: AtomicUsize::new(0),
        })
    }

    pub(crate) fn process(&self) -> &Arc<ProcessState> {
        &self.process
    }

    pub(crate) fn objects(&self) -> &ObjectScopeState {
        &self.objects
    }

    pub(crate) fn governance(&self) -> &ThreadGovernance {
        &self.governance
    }

    pub(crate) fn flow_started(&self) {
        self.active_flows.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn flow_completed(&self, office: &Arc<OfficeRuntime>) {
        if self.active_flows.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.close(office);
        }
    }

    fn close(&self, office: &Arc<OfficeRuntime>) {
        let mut failures = Vec::new();
        for index in self.governance.active() {
            if office.meta().manual_governance {
                tracing::debug!(
                    "governance_cleared: governance={}, process={}",
                    office.governance_meta(index).name,
                    self.process.id()
                );
                self.governance.clear(index);
                continue;
            }
            if let Err(cause) = governance::enforce(office, self, index) {
                failures.push(Escalation::new(
                    cause,
                    EscalationKind::GovernanceFailure,
                    EscalationSource::Governance {
                        governance: office.governance_meta(index).name.clone(),
                    },
                ));
            }
        }

        let cleanup = self.objects.unload(office);
        self.process.record_cleanup(cleanup);
        for failure in failures {
            tracing::error!(
                "thread_governance_failed: process={}, escalation={}",
                self.process.id(),
                failure
            );
            self.process.terminate(office, failure);
        }
        tracing::debug!("thread_completed: process={}", self.process.id());
        self.process.thread_completed(office);
    }
}

impl fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadState")
            .field("process", &self.process.id())
            .field("active_flows", &self.active_flows.load(Ordering::SeqCst))
            .finish()
    }
}
