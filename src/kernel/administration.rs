//! Administration duties run before and after a function body.
//!
//! Duties receive the extensions of their declared objects and an
//! [`AdministrationContext`] for governance, flows and asynchronous flows.
//! Pre duties run in declaration order; the chain stops at the first duty
//! that fails.

use std::any::TypeId;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::Span;

use super::container::SlotContext;
use super::escalation::Escalation;
use super::flow::{AsynchronousFlow, FlowOutcome, FlowMetaData};
use super::governance::GovernanceManager;
use super::metadata::{GovernanceIndex, ManagedObjectIndex, TeamIndex};
use super::object::Extension;
use super::team::Executor;
use super::types::AdministrationPhase;
use crate::types::{BoxError, Error, ProcessId, Result};

/// Administration logic around a function.
pub trait Duty: Send + Sync + 'static {
    fn administer(
        &self,
        extensions: &[Extension],
        ctx: &mut AdministrationContext<'_>,
    ) -> std::result::Result<(), BoxError>;
}

impl<F> Duty for F
where
    F: Fn(&[Extension], &mut AdministrationContext<'_>) -> std::result::Result<(), BoxError>
        + Send
        + Sync
        + 'static,
{
    fn administer(
        &self,
        extensions: &[Extension],
        ctx: &mut AdministrationContext<'_>,
    ) -> std::result::Result<(), BoxError> {
        self(extensions, ctx)
    }
}

/// Linked duty metadata.
pub(crate) struct AdministrationMetaData {
    pub(crate) name: String,
    pub(crate) phase: AdministrationPhase,
    pub(crate) duty: Arc<dyn Duty>,
    pub(crate) objects: Vec<ManagedObjectIndex>,
    pub(crate) extension: Option<(TypeId, &'static str)>,
    pub(crate) governances: Vec<GovernanceIndex>,
    pub(crate) flows: Vec<FlowMetaData>,
    pub(crate) team: Option<TeamIndex>,
    pub(crate) asynchronous_flow_timeout: Option<Duration>,
}

impl fmt::Debug for AdministrationMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdministrationMetaData")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("objects", &self.objects)
            .field("extension", &self.extension.map(|(_, name)| name))
            .field("governances", &self.governances)
            .field("flows", &self.flows)
            .field("team", &self.team)
            .finish()
    }
}

/// Context handed to a duty.
pub struct AdministrationContext<'a> {
    slot: SlotContext<'a>,
    duty: &'a AdministrationMetaData,
}

impl fmt::Debug for AdministrationContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdministrationContext")
            .field("duty", &self.duty.name)
            .field("phase", &self.duty.phase)
            .field("function", &self.function_name())
            .finish()
    }
}

impl<'a> AdministrationContext<'a> {
    pub(crate) fn new(slot: SlotContext<'a>, duty: &'a AdministrationMetaData) -> Self {
        Self { slot, duty }
    }

    pub(crate) fn into_slot(self) -> SlotContext<'a> {
        self.slot
    }

    pub fn duty_name(&self) -> &str {
        &self.duty.name
    }

    pub fn phase(&self) -> AdministrationPhase {
        self.duty.phase
    }

    pub fn function_name(&self) -> &str {
        self.slot.function_name()
    }

    pub fn process_id(&self) -> &ProcessId {
        self.slot.process_id()
    }

    /// Escalation being handled, when administering a handler function.
    pub fn escalation(&self) -> Option<&Escalation> {
        self.slot.escalation()
    }

    /// Governance declared at `index` on this duty.
    pub fn governance(&self, index: usize) -> Result<GovernanceManager<'_>> {
        let governance = self.duty.governances.get(index).ok_or_else(|| {
            Error::not_found(format!(
                "governance {} of duty '{}' ({} declared)",
                index,
                self.duty.name,
                self.duty.governances.len()
            ))
        })?;
        Ok(self.slot.governance_manager(*governance))
    }

    /// Invoke the flow declared at `index` on this duty.
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

    /// Hold this duty open until the returned flow is settled.
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
