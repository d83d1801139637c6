//! Flows and asynchronous flows.
//!
//! A flow is a chain of function containers (linked by `next`) executing in
//! one thread state. Each flow settles exactly once: its callback, if any,
//! receives the outcome, and a sequential flow additionally releases its
//! invoker's slot. Escalations leaving a flow are routed here.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use super::container::ManagedFunctionContainer;
use super::escalation::{Escalation, EscalationKind, EscalationSource, ProcessCancelled};
use super::metadata::FunctionIndex;
use super::observer::KernelEvent;
use super::office::OfficeRuntime;
use super::recovery::with_recovery;
use super::thread::ThreadState;
use super::types::FlowStrategy;
use crate::types::{BoxError, FlowId};

/// Outcome delivered to a flow callback.
pub type FlowOutcome = Result<Value, Escalation>;

/// Invoked exactly once with the outcome of the flow it was registered with.
/// An error returned here is itself escalated.
pub type FlowCallback = Box<dyn FnOnce(FlowOutcome) -> Result<(), BoxError> + Send + 'static>;

/// Linked flow declaration of a function or duty.
#[derive(Debug, Clone)]
pub(crate) struct FlowMetaData {
    pub(crate) target: FunctionIndex,
    pub(crate) target_name: String,
    pub(crate) strategy: FlowStrategy,
}

/// Flow requested by a slot, instigated once the slot returns.
pub(crate) struct FlowRequest {
    pub(crate) meta: FlowMetaData,
    pub(crate) argument: Value,
    pub(crate) callback: Option<FlowCallback>,
}

/// Slot of a container holding a sequential flow's invoker.
#[derive(Clone)]
pub(crate) struct Invoker {
    pub(crate) container: Arc<ManagedFunctionContainer>,
    pub(crate) generation: u64,
}

/// Runtime state of one flow.
pub(crate) struct FlowState {
    id: FlowId,
    thread: Arc<ThreadState>,
    callback: Mutex<Option<FlowCallback>>,
    invoker: Option<Invoker>,
    handling: Option<Escalation>,
    process_result: bool,
    finished: AtomicBool,
}

impl FlowState {
    /// Create a flow and count it against its thread.
    pub(crate) fn new(
        thread: Arc<ThreadState>,
        callback: Option<FlowCallback>,
        invoker: Option<Invoker>,
        handling: Option<Escalation>,
        process_result: bool,
    ) -> Arc<Self> {
        thread.flow_started();
        Arc::new(Self {
            id: FlowId::new(),
            thread,
            callback: Mutex::new(callback),
            invoker,
            handling,
            process_result,
            finished: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> &FlowId {
        &self.id
    }

    pub(crate) fn thread(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    /// Escalation being handled, for flows started by an escalation procedure.
    pub(crate) fn handling(&self) -> Option<&Escalation> {
        self.handling.as_ref()
    }

    fn has_callback(&self) -> bool {
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run the first function of the flow.
    pub(crate) fn begin(
        self: &Arc<Self>,
        office: &Arc<OfficeRuntime>,
        function: FunctionIndex,
        parameter: Value,
    ) {
        if self.thread.process().is_terminating() {
            let cancelled = Escalation::framework(
                ProcessCancelled {
                    reason: "process terminated before flow started".to_string(),
                },
                EscalationKind::Cancelled,
            );
            self.complete(office, Err(cancelled));
            return;
        }
        tracing::debug!(
            "flow_started: flow={}, function={}, process={}",
            self.id,
            office.function(function).name,
            self.thread.process().id()
        );
        let container = ManagedFunctionContainer::new(
            Arc::clone(office),
            Arc::clone(self),
            function,
            parameter,
        );
        container.run(None);
    }

    /// Settle the flow: run its callback, release its invoker and leave the thread.
    pub(crate) fn complete(self: &Arc<Self>, office: &Arc<OfficeRuntime>, outcome: FlowOutcome) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        if let (true, Ok(value)) = (self.process_result, &outcome) {
            self.thread.process().record_result(value.clone());
        }

        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let unconsumed = match callback {
            Some(callback) => {
                let operation = format!("callback of flow {}", self.id);
                with_recovery(|| callback(outcome), &operation)
                    .err()
                    .map(|cause| {
                        tracing::debug!("flow_callback_failed: flow={}, error={}", self.id, cause);
                        Escalation::new(
                            cause,
                            EscalationKind::FlowFailure,
                            EscalationSource::Framework,
                        )
                    })
            }
            None => outcome.err(),
        };

        match (&self.invoker, unconsumed) {
            (Some(invoker), failure) => invoker
                .container
                .sequential_flow_completed(invoker.generation, failure),
            (None, Some(failure)) if failure.kind() != EscalationKind::Cancelled => {
                route_to_office(office, &self.thread, failure, false)
            }
            (None, Some(failure)) => {
                tracing::debug!("escalation_discarded: flow={}, escalation={}", self.id, failure)
            }
            (None, None) => {}
        }
        self.thread.flow_completed(office);
    }

    /// Leave the thread without settling; a handler flow has taken over.
    fn retire(&self, office: &Arc<OfficeRuntime>) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.thread.flow_completed(office);
        }
    }

    /// Route an escalation raised by `failed` in this flow.
    ///
    /// Offered to this flow's callback, then the failing function's
    /// procedure, then the sequential invoker, then the office procedure and
    /// finally the framework handler.
    pub(crate) fn escalate(
        self: &Arc<Self>,
        office: &Arc<OfficeRuntime>,
        failed: FunctionIndex,
        escalation: Escalation,
    ) {
        if escalation.kind() == EscalationKind::Cancelled
            || self.thread.process().is_terminating()
        {
            self.complete(office, Err(escalation));
            return;
        }
        if self.has_callback() {
            self.complete(office, Err(escalation));
            return;
        }
        if let Some(handler) = office.function(failed).escalation_procedure.claim(&escalation) {
            let flow = FlowState::new(
                Arc::clone(&self.thread),
                None,
                self.invoker.clone(),
                Some(escalation),
                self.process_result,
            );
            announce_handler(office, handler);
            self.retire(office);
            flow.begin(office, handler, Value::Null);
            return;
        }
        if self.invoker.is_some() {
            self.complete(office, Err(escalation));
            return;
        }
        route_to_office(office, &self.thread, escalation, self.process_result);
        self.retire(office);
    }
}

impl fmt::Debug for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowState")
            .field("id", &self.id)
            .field("sequential", &self.invoker.is_some())
            .field("finished", &self.finished.load(Ordering::SeqCst))
            .finish()
    }
}

fn announce_handler(office: &OfficeRuntime, handler: FunctionIndex) {
    let name = &office.function(handler).name;
    tracing::debug!("escalation_handled: handler={}", name);
    office.emit(KernelEvent::EscalationHandled {
        handler: name.clone(),
    });
}

/// Offer an escalation to the office procedure, falling back to the
/// framework handler which terminates the process.
pub(crate) fn route_to_office(
    office: &Arc<OfficeRuntime>,
    thread: &Arc<ThreadState>,
    escalation: Escalation,
    process_result: bool,
) {
    let process = thread.process();
    if process.is_terminating() {
        tracing::debug!(
            "escalation_discarded: process={}, escalation={}",
            process.id(),
            escalation
        );
        return;
    }
    match office.meta().escalation_procedure.claim(&escalation) {
        Some(handler) => {
            let flow = FlowState::new(
                Arc::clone(thread),
                None,
                None,
                Some(escalation),
                process_result,
            );
            announce_handler(office, handler);
            flow.begin(office, handler, Value::Null);
        }
        None => {
            tracing::error!(
                "escalation_unhandled: process={}, escalation={}",
                process.id(),
                escalation
            );
            process.terminate(office, escalation);
        }
    }
}

// =============================================================================
// Asynchronous flow
// =============================================================================

pub(crate) enum Settlement {
    Complete(Option<Value>),
    Fail(BoxError),
    TimedOut(Duration),
    Cancelled(String),
}

struct AsyncFlowShared {
    id: FlowId,
    generation: u64,
    settled: AtomicBool,
    container: Mutex<Option<Arc<ManagedFunctionContainer>>>,
    timer: Mutex<Option<oneshot::Sender<()>>>,
}

/// Holds the creating slot open until settled by `complete`, `fail`,
/// timeout or process cancellation. Only the first settlement takes effect.
#[derive(Clone)]
pub struct AsynchronousFlow {
    shared: Arc<AsyncFlowShared>,
}

impl AsynchronousFlow {
    pub(crate) fn new(container: Arc<ManagedFunctionContainer>, generation: u64) -> Self {
        Self {
            shared: Arc::new(AsyncFlowShared {
                id: FlowId::new(),
                generation,
                settled: AtomicBool::new(false),
                container: Mutex::new(Some(container)),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &FlowId {
        &self.shared.id
    }

    pub fn is_settled(&self) -> bool {
        self.shared.settled.load(Ordering::SeqCst)
    }

    /// Release the slot. From a function body, `Some(value)` replaces the
    /// function's return value. Returns `false` if already settled.
    pub fn complete(&self, value: Option<Value>) -> bool {
        self.settle(Settlement::Complete(value))
    }

    /// Fail the slot with `error`. Returns `false` if already settled.
    pub fn fail(&self, error: impl Into<BoxError>) -> bool {
        self.settle(Settlement::Fail(error.into()))
    }

    pub(crate) fn cancel(&self, reason: &str) -> bool {
        self.settle(Settlement::Cancelled(reason.to_string()))
    }

    fn settle(&self, settlement: Settlement) -> bool {
        if self.shared.settled.swap(true, Ordering::SeqCst) {
            return false;
        }
        // Dropping the sender cancels a pending timeout.
        drop(
            self.shared
                .timer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let container = self
            .shared
            .container
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(container) = container {
            container.asynchronous_flow_settled(self.shared.generation, settlement);
        }
        true
    }

    pub(crate) fn arm_timeout(&self, office: &OfficeRuntime, timeout: Duration) {
        let flow = self.clone();
        let cancel = office.schedule_timeout(
            timeout,
            Box::new(move || {
                if flow.settle(Settlement::TimedOut(timeout)) {
                    tracing::debug!("asynchronous_flow_timed_out: flow={}", flow.id());
                }
            }),
        );
        if let Some(cancel) = cancel {
            if !self.is_settled() {
                *self.shared.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancel);
            }
        }
    }
}

impl fmt::Debug for AsynchronousFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsynchronousFlow")
            .field("id", &self.shared.id)
            .field("settled", &self.is_settled())
            .finish()
    }
}
