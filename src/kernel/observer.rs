//! Execution observation hooks.
//!
//! Every kernel step is logged through `tracing`. Offices can additionally
//! register an [`ExecutionObserver`] to receive structured [`KernelEvent`]s,
//! which is how traces are asserted in tests and collected by the CLI.

use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use super::escalation::EscalationKind;
use super::types::{AdministrationPhase, FlowStrategy, ManagedObjectScope};
use crate::types::ProcessId;

/// Structured kernel event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum KernelEvent {
    ProcessStarted {
        process: ProcessId,
        function: String,
    },
    ObjectBound {
        object: String,
        scope: ManagedObjectScope,
    },
    DutyExecuted {
        function: String,
        duty: String,
        phase: AdministrationPhase,
    },
    FunctionExecuted {
        function: String,
    },
    FlowInstigated {
        target: String,
        strategy: FlowStrategy,
    },
    GovernanceActivated {
        governance: String,
    },
    GovernanceEnforced {
        governance: String,
        extensions: usize,
    },
    GovernanceDisregarded {
        governance: String,
        extensions: usize,
    },
    ObjectRecycled {
        object: String,
        scope: ManagedObjectScope,
    },
    EscalationRaised {
        kind: EscalationKind,
        source: String,
        cause: String,
    },
    EscalationHandled {
        handler: String,
    },
    ProcessCompleted {
        process: ProcessId,
        success: bool,
    },
}

impl KernelEvent {
    /// Compact `kind:name` label, e.g. `duty:preTask`.
    pub fn label(&self) -> String {
        match self {
            KernelEvent::ProcessStarted { function, .. } => format!("process:{}", function),
            KernelEvent::ObjectBound { object, .. } => format!("bind:{}", object),
            KernelEvent::DutyExecuted { duty, .. } => format!("duty:{}", duty),
            KernelEvent::FunctionExecuted { function } => format!("function:{}", function),
            KernelEvent::FlowInstigated { target, .. } => format!("flow:{}", target),
            KernelEvent::GovernanceActivated { governance } => format!("activate:{}", governance),
            KernelEvent::GovernanceEnforced { governance, .. } => format!("enforce:{}", governance),
            KernelEvent::GovernanceDisregarded { governance, .. } => {
                format!("disregard:{}", governance)
            }
            KernelEvent::ObjectRecycled { object, .. } => format!("recycle:{}", object),
            KernelEvent::EscalationRaised { kind, .. } => format!("escalation:{}", kind),
            KernelEvent::EscalationHandled { handler } => format!("handled:{}", handler),
            KernelEvent::ProcessCompleted { success, .. } => {
                format!("complete:{}", if *success { "ok" } else { "failed" })
            }
        }
    }
}

/// Receives kernel events. Called on the thread performing the step.
pub trait ExecutionObserver: Send + Sync + fmt::Debug {
    fn on_event(&self, event: &KernelEvent);
}

/// Observer that discards every event.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {
    fn on_event(&self, _event: &KernelEvent) {}
}

/// Observer that records events in arrival order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<KernelEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<KernelEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Event labels in arrival order.
    pub fn trace(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(KernelEvent::label)
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl ExecutionObserver for RecordingObserver {
    fn on_event(&self, event: &KernelEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
