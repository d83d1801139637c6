//! Managed function container - the per-invocation state machine.
//!
//! A container binds the function's objects, runs its pre duties, body and
//! post duties one slot at a time, then unloads its function-scoped objects.
//! A slot is held open while asynchronous flows or sequential flows it
//! created are outstanding; the thread that settles the last of them resumes
//! the container. User code never runs while the container lock is held.

use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::Span;

use super::administration::AdministrationContext;
use super::driver;
use super::escalation::{
    AsynchronousFlowTimeout, Escalation, EscalationKind, EscalationSource, ProcessCancelled,
};
use super::flow::{
    AsynchronousFlow, FlowCallback, FlowMetaData, FlowOutcome, FlowRequest, FlowState, Invoker,
    Settlement,
};
use super::governance::{self, GovernanceManager};
use super::metadata::{
    FunctionIndex, GovernanceIndex, ManagedFunctionMetaData, ManagedObjectIndex, TeamIndex,
};
use super::object::{bind_object, downcast_instance, ObjectScopeState};
use super::observer::KernelEvent;
use super::office::OfficeRuntime;
use super::process::ProcessState;
use super::recovery::with_recovery;
use super::team::Executor;
use super::thread::ThreadState;
use super::types::{AdministrationPhase, ContainerState, FlowStrategy, ManagedObjectScope};
use crate::types::{BoxError, Error, ProcessId, Result};

/// Function body.
pub trait ManagedFunction: Send + Sync + 'static {
    fn execute(&self, ctx: &mut FunctionContext<'_>) -> std::result::Result<Value, BoxError>;
}

impl<F> ManagedFunction for F
where
    F: Fn(&mut FunctionContext<'_>) -> std::result::Result<Value, BoxError> + Send + Sync + 'static,
{
    fn execute(&self, ctx: &mut FunctionContext<'_>) -> std::result::Result<Value, BoxError> {
        self(ctx)
    }
}

enum Step {
    Advance(ContainerState),
    Escalate(Escalation),
    Suspend,
}

type SlotOutcome = (std::result::Result<Option<Value>, Escalation>, Vec<FlowRequest>);

/// Barrier of the slot currently executing.
#[derive(Default)]
struct SlotBarrier {
    generation: u64,
    /// User code has been invoked for the current state.
    started: bool,
    /// User code is executing right now.
    running: bool,
    /// The driving thread has left; the last settlement resumes.
    suspended: bool,
    pending_async: usize,
    sequential: VecDeque<FlowRequest>,
    sequential_active: bool,
    failure: Option<Escalation>,
    value: Option<Value>,
}

impl SlotBarrier {
    fn take_resume(&mut self) -> bool {
        let ready =
            self.suspended && !self.running && self.pending_async == 0 && !self.sequential_active;
        if ready {
            self.suspended = false;
        }
        ready
    }
}

struct ContainerInner {
    state: ContainerState,
    parameter: Value,
    return_value: Value,
    escalation: Option<Escalation>,
    slot: SlotBarrier,
}

pub(crate) struct ManagedFunctionContainer {
    office: Arc<OfficeRuntime>,
    flow: Arc<FlowState>,
    function: FunctionIndex,
    objects: ObjectScopeState,
    span: Span,
    inner: Mutex<ContainerInner>,
}

impl ManagedFunctionContainer {
    pub(crate) fn new(
        office: Arc<OfficeRuntime>,
        flow: Arc<FlowState>,
        function: FunctionIndex,
        parameter: Value,
    ) -> Arc<Self> {
        let span = tracing::debug_span!(
            "managed_function",
            function = %office.function(function).name,
            process = %flow.thread().process().id(),
            flow = %flow.id()
        );
        Arc::new(Self {
            office,
            flow,
            function,
            objects: ObjectScopeState::new(ManagedObjectScope::Function),
            span,
            inner: Mutex::new(ContainerInner {
                state: ContainerState::Created,
                parameter,
                return_value: Value::Null,
                escalation: None,
                slot: SlotBarrier::default(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ContainerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn meta(&self) -> &ManagedFunctionMetaData {
        self.office.function(self.function)
    }

    fn process(&self) -> &Arc<ProcessState> {
        self.flow.thread().process()
    }

    pub(crate) fn state(&self) -> ContainerState {
        self.lock().state
    }

    /// Queue the container on this thread's driver.
    pub(crate) fn run(self: &Arc<Self>, current_team: Option<TeamIndex>) {
        let container = Arc::clone(self);
        driver::schedule(Box::new(move || container.drive(current_team)));
    }

    /// Drive the container until it completes, suspends or is handed to a team.
    fn drive(self: &Arc<Self>, current_team: Option<TeamIndex>) {
        let _entered = self.span.enter();
        loop {
            let state = self.state();
            let step = match state {
                ContainerState::Created => self.bind_objects(),
                ContainerState::ObjectsBound => Step::Advance(self.first_slot()),
                ContainerState::PreAdministration(_)
                | ContainerState::Executing
                | ContainerState::PostAdministration(_) => {
                    match self.run_slot(state, current_team) {
                        Some(step) => step,
                        None => return,
                    }
                }
                ContainerState::Escalated => {
                    self.disregard_governance();
                    Step::Advance(ContainerState::UnloadingObjects)
                }
                ContainerState::UnloadingObjects => {
                    let cleanup = self.objects.unload(&self.office);
                    self.process().record_cleanup(cleanup);
                    Step::Advance(ContainerState::Complete)
                }
                ContainerState::Complete => {
                    self.finish();
                    return;
                }
            };

            match step {
                Step::Advance(ContainerState::UnloadingObjects)
                    if state != ContainerState::Escalated =>
                {
                    match self.enforce_governance() {
                        Ok(()) => self.transition(ContainerState::UnloadingObjects),
                        Err(escalation) => self.escalate(escalation),
                    }
                }
                Step::Advance(next) => self.transition(next),
                Step::Escalate(escalation) => self.escalate(escalation),
                Step::Suspend => return,
            }
        }
    }

    fn resume(self: &Arc<Self>) {
        tracing::trace!("container_resumed: function={}", self.meta().name);
        self.run(None);
    }

    fn transition(&self, next: ContainerState) {
        let mut inner = self.lock();
        debug_assert!(
            inner.state.can_transition_to(next),
            "invalid container transition {} -> {}",
            inner.state,
            next
        );
        tracing::trace!(
            "container_transition: function={}, from={}, to={}",
            self.meta().name,
            inner.state,
            next
        );
        inner.state = next;
    }

    fn raise(&self, cause: BoxError, kind: EscalationKind, source: EscalationSource) -> Escalation {
        Escalation::raised(cause, kind, source, Some(self.function))
    }

    fn escalate(&self, escalation: Escalation) {
        tracing::debug!(
            "function_escalated: function={}, escalation={}",
            self.meta().name,
            escalation
        );
        self.office.emit(KernelEvent::EscalationRaised {
            kind: escalation.kind(),
            source: escalation.source().to_string(),
            cause: escalation.cause().to_string(),
        });
        let abandoned = {
            let mut inner = self.lock();
            debug_assert!(inner.state.can_transition_to(ContainerState::Escalated));
            inner.state = ContainerState::Escalated;
            let generation = inner.slot.generation + 1;
            let abandoned = std::mem::take(&mut inner.slot.sequential);
            // Later settlements of this slot's asynchronous flows are ignored.
            inner.slot = SlotBarrier {
                generation,
                ..SlotBarrier::default()
            };
            inner.escalation = Some(escalation.clone());
            abandoned
        };
        abandon(abandoned, &escalation);
    }

    fn cancellation(&self) -> Option<Escalation> {
        self.process().is_terminating().then(|| {
            self.raise(
                Box::new(ProcessCancelled {
                    reason: "process terminated".to_string(),
                }),
                EscalationKind::Cancelled,
                EscalationSource::Function {
                    function: self.meta().name.clone(),
                },
            )
        })
    }

    fn bind_objects(&self) -> Step {
        if let Some(cancelled) = self.cancellation() {
            return Step::Escalate(cancelled);
        }
        for index in &self.meta().required_objects {
            let bound = bind_object(&self.office, &self.objects, self.flow.thread(), *index);
            if let Err(cause) = bound {
                return Step::Escalate(self.raise(
                    cause,
                    EscalationKind::ObjectResolution,
                    EscalationSource::ManagedObject {
                        object: self.office.object(*index).name.clone(),
                    },
                ));
            }
        }
        Step::Advance(ContainerState::ObjectsBound)
    }

    fn first_slot(&self) -> ContainerState {
        if self.meta().pre_administration.is_empty() {
            ContainerState::Executing
        } else {
            ContainerState::PreAdministration(0)
        }
    }

    fn next_slot(&self, state: ContainerState) -> ContainerState {
        let meta = self.meta();
        match state {
            ContainerState::PreAdministration(i) if i + 1 < meta.pre_administration.len() => {
                ContainerState::PreAdministration(i + 1)
            }
            ContainerState::PreAdministration(_) => ContainerState::Executing,
            ContainerState::Executing if !meta.post_administration.is_empty() => {
                ContainerState::PostAdministration(0)
            }
            ContainerState::PostAdministration(i) if i + 1 < meta.post_administration.len() => {
                ContainerState::PostAdministration(i + 1)
            }
            _ => ContainerState::UnloadingObjects,
        }
    }

    fn slot_team(&self, state: ContainerState) -> Option<TeamIndex> {
        let meta = self.meta();
        match state {
            ContainerState::PreAdministration(i) => meta.pre_administration.get(i)?.team,
            ContainerState::PostAdministration(i) => meta.post_administration.get(i)?.team,
            _ => meta.team,
        }
    }

    fn slot_source(&self, state: ContainerState) -> (EscalationKind, EscalationSource) {
        let meta = self.meta();
        let duty = match state {
            ContainerState::PreAdministration(i) => meta.pre_administration.get(i),
            ContainerState::PostAdministration(i) => meta.post_administration.get(i),
            _ => None,
        };
        match duty {
            Some(duty) => (
                EscalationKind::DutyFailure,
                EscalationSource::Duty {
                    function: meta.name.clone(),
                    duty: duty.name.clone(),
                    phase: duty.phase,
                },
            ),
            None => (
                EscalationKind::FunctionFailure,
                EscalationSource::Function {
                    function: meta.name.clone(),
                },
            ),
        }
    }

    /// Start (if not yet started) and conclude the current slot.
    /// `None` when the container was handed to another team.
    fn run_slot(
        self: &Arc<Self>,
        state: ContainerState,
        current_team: Option<TeamIndex>,
    ) -> Option<Step> {
        if !self.lock().slot.started {
            if let Some(cancelled) = self.cancellation() {
                return Some(Step::Escalate(cancelled));
            }
            if let Some(team) = self.slot_team(state).filter(|team| Some(*team) != current_team) {
                tracing::trace!(
                    "container_handoff: function={}, state={}, team={}",
                    self.meta().name,
                    state,
                    team.get()
                );
                let container = Arc::clone(self);
                self.office
                    .assign(team, Box::new(move || container.run(Some(team))));
                return None;
            }
            self.invoke_slot(state);
        }
        Some(self.conclude_slot(state))
    }

    fn invoke_slot(self: &Arc<Self>, state: ContainerState) {
        let (generation, parameter) = {
            let mut inner = self.lock();
            let generation = inner.slot.generation + 1;
            inner.slot = SlotBarrier {
                generation,
                started: true,
                running: true,
                ..SlotBarrier::default()
            };
            let parameter = (state == ContainerState::Executing).then(|| inner.parameter.clone());
            (generation, parameter)
        };

        let (outcome, requests) = match state {
            ContainerState::PreAdministration(i) => {
                self.administer(AdministrationPhase::Pre, i, generation)
            }
            ContainerState::PostAdministration(i) => {
                self.administer(AdministrationPhase::Post, i, generation)
            }
            _ => self.execute(generation, parameter.unwrap_or_default()),
        };

        let mut instigate = Vec::new();
        let mut abandoned = Vec::new();
        let failure = {
            let mut inner = self.lock();
            inner.slot.running = false;
            match outcome {
                Ok(value) => {
                    if let Some(value) = value {
                        inner.return_value = value;
                    }
                    for request in requests {
                        if request.meta.strategy == FlowStrategy::Sequential {
                            inner.slot.sequential.push_back(request);
                        } else {
                            instigate.push(request);
                        }
                    }
                    None
                }
                Err(escalation) => {
                    // A failed slot does not wait for its asynchronous flows.
                    inner.slot.pending_async = 0;
                    inner.slot.failure = Some(escalation.clone());
                    abandoned = requests;
                    Some(escalation)
                }
            }
        };
        if let Some(escalation) = failure {
            abandon(abandoned, &escalation);
        }
        for request in instigate {
            self.instigate(request, generation);
        }
    }

    fn conclude_slot(self: &Arc<Self>, state: ContainerState) -> Step {
        let mut start = None;
        let mut abandoned = VecDeque::new();
        let (step, generation) = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let slot = &mut inner.slot;
            let waiting_sequential = !slot.sequential.is_empty() && slot.failure.is_none();
            let step = if slot.pending_async > 0 || slot.sequential_active || waiting_sequential {
                if waiting_sequential && !slot.sequential_active {
                    start = slot.sequential.pop_front();
                    slot.sequential_active = start.is_some();
                }
                slot.suspended = true;
                Step::Suspend
            } else if let Some(failure) = slot.failure.take() {
                abandoned = std::mem::take(&mut slot.sequential);
                Step::Escalate(failure)
            } else {
                if let Some(value) = slot.value.take() {
                    inner.return_value = value;
                }
                slot.started = false;
                Step::Advance(self.next_slot(state))
            };
            (step, slot.generation)
        };

        if let Step::Escalate(escalation) = &step {
            abandon(abandoned, escalation);
        }
        if let Some(request) = start {
            self.instigate(request, generation);
        }
        step
    }

    fn administer(
        self: &Arc<Self>,
        phase: AdministrationPhase,
        index: usize,
        generation: u64,
    ) -> SlotOutcome {
        let meta = self.meta();
        let duty = &meta.administration(phase)[index];

        let mut extensions = Vec::with_capacity(duty.objects.len());
        for object_index in &duty.objects {
            let object = self.office.object(*object_index);
            let extension =
                bind_object(&self.office, &self.objects, self.flow.thread(), *object_index)
                    .and_then(|container| container.extension(object, duty.extension));
            match extension {
                Ok(extension) => extensions.push(extension),
                Err(cause) => {
                    let escalation = self.raise(
                        cause,
                        EscalationKind::ObjectResolution,
                        EscalationSource::ManagedObject {
                            object: object.name.clone(),
                        },
                    );
                    return (Err(escalation), Vec::new());
                }
            }
        }

        let timeout = duty
            .asynchronous_flow_timeout
            .or(meta.asynchronous_flow_timeout)
            .or(self.office.meta().asynchronous_flow_timeout);
        let slot = SlotContext::new(self, generation, &duty.flows, timeout);
        let mut ctx = AdministrationContext::new(slot, duty);
        let operation = format!("{} duty '{}' of '{}'", phase, duty.name, meta.name);
        let result = {
            let _duty = tracing::debug_span!("duty", duty = %duty.name, phase = %phase).entered();
            with_recovery(|| duty.duty.administer(&extensions, &mut ctx), &operation)
        };

        tracing::debug!(
            "duty_executed: function={}, duty={}, phase={}, success={}",
            meta.name,
            duty.name,
            phase,
            result.is_ok()
        );
        self.office.emit(KernelEvent::DutyExecuted {
            function: meta.name.clone(),
            duty: duty.name.clone(),
            phase,
        });

        let requests = ctx.into_slot().into_requests();
        let outcome = result.map(|()| None).map_err(|cause| {
            let (kind, source) = self.slot_source(match phase {
                AdministrationPhase::Pre => ContainerState::PreAdministration(index),
                AdministrationPhase::Post => ContainerState::PostAdministration(index),
            });
            self.raise(cause, kind, source)
        });
        (outcome, requests)
    }

    fn execute(self: &Arc<Self>, generation: u64, parameter: Value) -> SlotOutcome {
        let meta = self.meta();
        let timeout = meta
            .asynchronous_flow_timeout
            .or(self.office.meta().asynchronous_flow_timeout);
        let mut ctx = FunctionContext {
            slot: SlotContext::new(self, generation, &meta.flows, timeout),
            parameter,
            objects: &meta.objects,
        };
        let operation = format!("function '{}'", meta.name);
        let result = with_recovery(|| meta.body.execute(&mut ctx), &operation);

        tracing::debug!(
            "function_executed: function={}, success={}",
            meta.name,
            result.is_ok()
        );
        self.office.emit(KernelEvent::FunctionExecuted {
            function: meta.name.clone(),
        });

        let requests = ctx.slot.into_requests();
        let outcome = result.map(Some).map_err(|cause| {
            self.raise(
                cause,
                EscalationKind::FunctionFailure,
                EscalationSource::Function {
                    function: meta.name.clone(),
                },
            )
        });
        (outcome, requests)
    }

    fn instigate(self: &Arc<Self>, request: FlowRequest, generation: u64) {
        let FlowRequest {
            meta,
            argument,
            callback,
        } = request;
        tracing::debug!(
            "flow_instigated: function={}, target={}, strategy={:?}",
            self.meta().name,
            meta.target_name,
            meta.strategy
        );
        self.office.emit(KernelEvent::FlowInstigated {
            target: meta.target_name.clone(),
            strategy: meta.strategy,
        });

        let thread = match meta.strategy {
            FlowStrategy::Spawn => ThreadState::new(&self.office, Arc::clone(self.process())),
            FlowStrategy::Sequential | FlowStrategy::Parallel => Arc::clone(self.flow.thread()),
        };
        let invoker = (meta.strategy == FlowStrategy::Sequential).then(|| Invoker {
            container: Arc::clone(self),
            generation,
        });
        let flow = FlowState::new(thread, callback, invoker, None, false);
        flow.begin(&self.office, meta.target, argument);
    }

    fn register_asynchronous_flow(
        self: &Arc<Self>,
        generation: u64,
        timeout: Option<Duration>,
    ) -> AsynchronousFlow {
        {
            let mut inner = self.lock();
            if inner.slot.generation == generation {
                inner.slot.pending_async += 1;
            }
        }
        let flow = AsynchronousFlow::new(Arc::clone(self), generation);
        tracing::debug!(
            "asynchronous_flow_created: function={}, flow={}, timeout={:?}",
            self.meta().name,
            flow.id(),
            timeout
        );
        if let Some(timeout) = timeout {
            flow.arm_timeout(&self.office, timeout);
        }
        self.process().track_asynchronous_flow(&flow);
        flow
    }

    pub(crate) fn asynchronous_flow_settled(
        self: &Arc<Self>,
        generation: u64,
        settlement: Settlement,
    ) {
        let resume = {
            let mut inner = self.lock();
            if inner.slot.generation != generation || inner.slot.pending_async == 0 {
                tracing::trace!(
                    "asynchronous_flow_ignored: function={}, generation={}",
                    self.meta().name,
                    generation
                );
                return;
            }
            inner.slot.pending_async -= 1;
            let state = inner.state;
            let (kind, source) = self.slot_source(state);
            match settlement {
                Settlement::Complete(value) => {
                    if state == ContainerState::Executing {
                        if let Some(value) = value {
                            inner.slot.value = Some(value);
                        }
                    }
                }
                Settlement::Fail(cause) => {
                    let escalation = self.raise(cause, kind, source);
                    inner.slot.failure.get_or_insert(escalation);
                }
                Settlement::TimedOut(timeout) => {
                    let escalation = self.raise(
                        Box::new(AsynchronousFlowTimeout { timeout }),
                        EscalationKind::AsynchronousFlowTimeout,
                        source,
                    );
                    inner.slot.failure.get_or_insert(escalation);
                }
                Settlement::Cancelled(reason) => {
                    let escalation = self.raise(
                        Box::new(ProcessCancelled { reason }),
                        EscalationKind::Cancelled,
                        source,
                    );
                    inner.slot.failure.get_or_insert(escalation);
                }
            }
            inner.slot.take_resume()
        };
        if resume {
            self.resume();
        }
    }

    pub(crate) fn sequential_flow_completed(
        self: &Arc<Self>,
        generation: u64,
        failure: Option<Escalation>,
    ) {
        let (start, resume) = {
            let mut inner = self.lock();
            let slot = &mut inner.slot;
            if slot.generation != generation || !slot.sequential_active {
                return;
            }
            slot.sequential_active = false;
            if let Some(failure) = failure {
                slot.failure.get_or_insert(failure);
            }
            let next = if slot.failure.is_none() {
                slot.sequential.pop_front()
            } else {
                None
            };
            match next {
                Some(next) => {
                    slot.sequential_active = true;
                    (Some(next), false)
                }
                None => (None, slot.take_resume()),
            }
        };
        if let Some(request) = start {
            self.instigate(request, generation);
        } else if resume {
            self.resume();
        }
    }

    /// Enforce (or, in manual mode, release) governance still holding
    /// function-scoped objects before they are unloaded.
    fn enforce_governance(&self) -> std::result::Result<(), Escalation> {
        let keys = self.function_object_keys();
        if keys.is_empty() {
            return Ok(());
        }
        let thread = self.flow.thread();
        for index in thread.governance().active_registering(&keys) {
            if self.office.meta().manual_governance {
                self.release_governance(index, &keys);
                continue;
            }
            governance::enforce(&self.office, thread, index).map_err(|cause| {
                self.raise(
                    cause,
                    EscalationKind::GovernanceFailure,
                    EscalationSource::Governance {
                        governance: self.office.governance_meta(index).name.clone(),
                    },
                )
            })?;
        }
        Ok(())
    }

    /// Disregard (or, in manual mode, release) governance still holding
    /// function-scoped objects of an escalated container.
    fn disregard_governance(&self) {
        let keys = self.function_object_keys();
        if keys.is_empty() {
            return;
        }
        let thread = self.flow.thread();
        for index in thread.governance().active_registering(&keys) {
            if self.office.meta().manual_governance {
                self.release_governance(index, &keys);
                continue;
            }
            if let Err(cause) = governance::disregard(&self.office, thread, index) {
                let name = self.office.governance_meta(index).name.clone();
                tracing::warn!("governance_disregard_failed: governance={}, error={}", name, cause);
                self.process().record_cleanup(vec![Escalation::new(
                    cause,
                    EscalationKind::CleanupFailure,
                    EscalationSource::Governance { governance: name },
                )]);
            }
        }
    }

    fn release_governance(&self, index: GovernanceIndex, keys: &HashSet<u64>) {
        tracing::debug!(
            "governance_released: function={}, governance={}",
            self.meta().name,
            self.office.governance_meta(index).name
        );
        self.flow.thread().governance().deregister(index, keys);
    }

    fn function_object_keys(&self) -> HashSet<u64> {
        self.objects
            .bound()
            .iter()
            .map(|container| container.key())
            .collect()
    }

    fn finish(self: &Arc<Self>) {
        let (escalation, value) = {
            let mut inner = self.lock();
            (
                inner.escalation.take(),
                std::mem::take(&mut inner.return_value),
            )
        };
        match (escalation, self.meta().next) {
            (Some(escalation), _) => self.flow.escalate(&self.office, self.function, escalation),
            (None, Some(next)) => {
                tracing::debug!(
                    "next_function: function={}, next={}",
                    self.meta().name,
                    self.office.function(next).name
                );
                ManagedFunctionContainer::new(
                    Arc::clone(&self.office),
                    Arc::clone(&self.flow),
                    next,
                    value,
                )
                .run(None);
            }
            (None, None) => self.flow.complete(&self.office, Ok(value)),
        }
    }
}

impl fmt::Debug for ManagedFunctionContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedFunctionContainer")
            .field("function", &self.meta().name)
            .field("state", &self.state())
            .field("flow", &self.flow.id())
            .finish()
    }
}

/// Settle the callbacks of flows that will never be instigated.
fn abandon(requests: impl IntoIterator<Item = FlowRequest>, escalation: &Escalation) {
    for request in requests {
        if let Some(callback) = request.callback {
            let operation = format!("callback of abandoned flow to '{}'", request.meta.target_name);
            if let Err(err) = with_recovery(|| callback(Err(escalation.clone())), &operation) {
                tracing::warn!(
                    "abandoned_flow_callback_failed: target={}, error={}",
                    request.meta.target_name,
                    err
                );
            }
        }
    }
}

// =============================================================================
// Contexts
// =============================================================================

/// Capabilities shared by function and duty contexts.
pub(crate) struct SlotContext<'a> {
    container: &'a Arc<ManagedFunctionContainer>,
    generation: u64,
    flows: &'a [FlowMetaData],
    timeout: Option<Duration>,
    requests: Vec<FlowRequest>,
}

impl<'a> SlotContext<'a> {
    fn new(
        container: &'a Arc<ManagedFunctionContainer>,
        generation: u64,
        flows: &'a [FlowMetaData],
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            container,
            generation,
            flows,
            timeout,
            requests: Vec::new(),
        }
    }

    pub(crate) fn into_requests(self) -> Vec<FlowRequest> {
        self.requests
    }

    pub(crate) fn function_name(&self) -> &str {
        &self.container.meta().name
    }

    pub(crate) fn process_id(&self) -> &ProcessId {
        self.container.process().id()
    }

    pub(crate) fn escalation(&self) -> Option<&Escalation> {
        self.container.flow.handling()
    }

    pub(crate) fn span(&self) -> &Span {
        &self.container.span
    }

    pub(crate) fn executor(&self) -> Executor {
        self.container.office.executor()
    }

    pub(crate) fn governance_manager(&self, index: GovernanceIndex) -> GovernanceManager<'_> {
        GovernanceManager::new(
            &self.container.office,
            self.container.flow.thread(),
            &self.container.objects,
            index,
        )
    }

    pub(crate) fn invoke_flow(
        &mut self,
        index: usize,
        argument: Value,
        callback: Option<FlowCallback>,
    ) -> Result<()> {
        let meta = self.flows.get(index).ok_or_else(|| {
            Error::not_found(format!(
                "flow {} of '{}' ({} declared)",
                index,
                self.container.meta().name,
                self.flows.len()
            ))
        })?;
        self.requests.push(FlowRequest {
            meta: meta.clone(),
            argument,
            callback,
        });
        Ok(())
    }

    pub(crate) fn create_asynchronous_flow(&mut self) -> AsynchronousFlow {
        self.container
            .register_asynchronous_flow(self.generation, self.timeout)
    }

    fn object<T: Any + Send + Sync>(
        &self,
        index: ManagedObjectIndex,
    ) -> std::result::Result<Arc<T>, BoxError> {
        let container = bind_object(
            &self.container.office,
            &self.container.objects,
            self.container.flow.thread(),
            index,
        )?;
        downcast_instance::<T>(container.instance(), &self.container.office.object(index).name)
    }
}

/// Context handed to a function body.
pub struct FunctionContext<'a> {
    slot: SlotContext<'a>,
    parameter: Value,
    objects: &'a [ManagedObjectIndex],
}

impl fmt::Debug for FunctionContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionContext")
            .field("function", &self.function_name())
            .field("parameter", &self.parameter)
            .finish()
    }
}

impl<'a> FunctionContext<'a> {
    pub fn function_name(&self) -> &str {
        self.slot.function_name()
    }

    pub fn process_id(&self) -> &ProcessId {
        self.slot.process_id()
    }

    /// Argument of the flow, or the previous function's return value.
    pub fn parameter(&self) -> &Value {
        &self.parameter
    }

    pub fn parameter_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.parameter.clone())?)
    }

    /// Object declared at `index` on this function.
    pub fn object<T: Any + Send + Sync>(
        &self,
        index: usize,
    ) -> std::result::Result<Arc<T>, BoxError> {
        let object = self.objects.get(index).ok_or_else(|| {
            Box::new(Error::not_found(format!(
                "object {} of function '{}' ({} declared)",
                index,
                self.function_name(),
                self.objects.len()
            ))) as BoxError
        })?;
        self.slot.object(*object)
    }

    /// Escalation being handled, when this function is an escalation handler.
    pub fn escalation(&self) -> Option<&Escalation> {
        self.slot.escalation()
    }

    /// Invoke the flow declared at `index` on this function.
    pub fn invoke_flow(&mut self, index: usize, argument: Value) -> Result<()> {
        self.slot.invoke_flow(index, argument, None)
    }

    /// Invoke the flow declared at `index`, reporting its outcome to `callback`.
    pub fn invoke_flow_with_callback<F>(
        &mut self,
        index: usize,
        argument: Value,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(FlowOutcome) -> std::result::Result<(), BoxError> + Send + 'static,
    {
        self.slot.invoke_flow(index, argument, Some(Box::new(callback)))
    }

    /// Hold this function open until the returned flow is settled.
    pub fn create_asynchronous_flow(&mut self) -> AsynchronousFlow {
        self.slot.create_asynchronous_flow()
    }

    pub fn executor(&self) -> Executor {
        self.slot.executor()
    }

    pub fn span(&self) -> &Span {
        self.slot.span()
    }
}
