//! Governance - a unit of work over a set of managed objects.
//!
//! Each thread state owns one governance container per office governance.
//! Activation registers every already-bound object mapped to the governance;
//! objects bound later in the same thread register as they bind. Enforce and
//! disregard operate on a snapshot of the registrations taken at call time,
//! then return the container to `Inactive`.

use std::any::TypeId;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::escalation::GovernanceFailure;
use super::metadata::{GovernanceIndex, ManagedObjectIndex};
use super::object::{Extension, ManagedObjectContainer, ObjectScopeState};
use super::observer::KernelEvent;
use super::office::OfficeRuntime;
use super::recovery::with_recovery;
use super::thread::ThreadState;
use super::types::GovernanceState;
use crate::types::{BoxError, Error};

/// User-supplied governance logic, e.g. commit/rollback of a transaction.
pub trait Governance: Send + Sync + 'static {
    /// Apply the unit of work to the registered extensions.
    fn enforce(&self, extensions: &[Extension]) -> Result<(), BoxError>;

    /// Abandon the unit of work.
    fn disregard(&self, extensions: &[Extension]) -> Result<(), BoxError>;
}

/// Linked governance metadata.
pub(crate) struct GovernanceMetaData {
    pub(crate) index: GovernanceIndex,
    pub(crate) name: String,
    pub(crate) extension_type: TypeId,
    pub(crate) extension_name: &'static str,
    pub(crate) governance: Arc<dyn Governance>,
}

impl fmt::Debug for GovernanceMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GovernanceMetaData")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("extension", &self.extension_name)
            .finish()
    }
}

struct Registration {
    key: u64,
    object: ManagedObjectIndex,
    extension: Extension,
}

struct GovernanceContainer {
    state: GovernanceState,
    registered: Vec<Registration>,
}

impl GovernanceContainer {
    fn transition(&mut self, to: GovernanceState) -> Result<(), Error> {
        if !self.state.can_transition_to(to) {
            return Err(Error::state_transition(format!(
                "governance cannot move from {:?} to {:?}",
                self.state, to
            )));
        }
        self.state = to;
        Ok(())
    }
}

/// Governance containers of one thread state.
pub(crate) struct ThreadGovernance {
    containers: Mutex<Vec<GovernanceContainer>>,
}

impl ThreadGovernance {
    pub(crate) fn new(count: usize) -> Self {
        let containers = (0..count)
            .map(|_| GovernanceContainer {
                state: GovernanceState::Inactive,
                registered: Vec::new(),
            })
            .collect();
        Self {
            containers: Mutex::new(containers),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<GovernanceContainer>> {
        self.containers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self, index: GovernanceIndex) -> GovernanceState {
        self.lock()
            .get(index.0)
            .map(|container| container.state)
            .unwrap_or(GovernanceState::Inactive)
    }

    pub(crate) fn is_active(&self, index: GovernanceIndex) -> bool {
        self.state(index) == GovernanceState::Active
    }

    /// Active governances, in office declaration order.
    pub(crate) fn active(&self) -> Vec<GovernanceIndex> {
        self.lock()
            .iter()
            .enumerate()
            .filter(|(_, container)| container.state == GovernanceState::Active)
            .map(|(index, _)| GovernanceIndex(index))
            .collect()
    }

    /// Active governances holding a registration for any of `keys`.
    pub(crate) fn active_registering(&self, keys: &HashSet<u64>) -> Vec<GovernanceIndex> {
        self.lock()
            .iter()
            .enumerate()
            .filter(|(_, container)| {
                container.state == GovernanceState::Active
                    && container.registered.iter().any(|r| keys.contains(&r.key))
            })
            .map(|(index, _)| GovernanceIndex(index))
            .collect()
    }

    fn is_registered(&self, index: GovernanceIndex, key: u64) -> bool {
        self.lock()
            .get(index.0)
            .map(|container| container.registered.iter().any(|r| r.key == key))
            .unwrap_or(false)
    }

    /// Returns `true` if this call moved the container to `Active`.
    fn activate(&self, index: GovernanceIndex) -> Result<bool, Error> {
        let mut containers = self.lock();
        let container = containers
            .get_mut(index.0)
            .ok_or_else(|| Error::not_found(format!("governance {}", index.0)))?;
        if container.state == GovernanceState::Active {
            return Ok(false);
        }
        container.transition(GovernanceState::Active)?;
        Ok(true)
    }

    fn register(
        &self,
        index: GovernanceIndex,
        object: ManagedObjectIndex,
        key: u64,
        extension: Extension,
    ) {
        let mut containers = self.lock();
        if let Some(container) = containers.get_mut(index.0) {
            if container.state == GovernanceState::Active
                && !container.registered.iter().any(|r| r.key == key)
            {
                container.registered.push(Registration {
                    key,
                    object,
                    extension,
                });
            }
        }
    }

    /// Move to `to` and snapshot the registrations. `None` if not active.
    fn begin(&self, index: GovernanceIndex, to: GovernanceState) -> Option<Vec<Extension>> {
        let mut containers = self.lock();
        let container = containers.get_mut(index.0)?;
        container.transition(to).ok()?;
        Some(
            container
                .registered
                .iter()
                .map(|r| r.extension.clone())
                .collect(),
        )
    }

    fn finish(&self, index: GovernanceIndex) {
        let mut containers = self.lock();
        if let Some(container) = containers.get_mut(index.0) {
            container.registered.clear();
            container.state = GovernanceState::Inactive;
        }
    }

    /// Drop registrations for `keys` without invoking governance logic.
    pub(crate) fn deregister(&self, index: GovernanceIndex, keys: &HashSet<u64>) {
        let mut containers = self.lock();
        if let Some(container) = containers.get_mut(index.0) {
            container.registered.retain(|r| !keys.contains(&r.key));
        }
    }

    /// Return to `Inactive` without invoking governance logic.
    pub(crate) fn clear(&self, index: GovernanceIndex) {
        self.finish(index);
    }

    #[cfg(test)]
    fn registered_objects(&self, index: GovernanceIndex) -> Vec<ManagedObjectIndex> {
        self.lock()
            .get(index.0)
            .map(|container| container.registered.iter().map(|r| r.object).collect())
            .unwrap_or_default()
    }
}

fn register(
    office: &OfficeRuntime,
    thread: &ThreadState,
    index: GovernanceIndex,
    container: &ManagedObjectContainer,
) -> Result<(), BoxError> {
    if thread.governance().is_registered(index, container.key()) {
        return Ok(());
    }
    let governance = office.governance_meta(index);
    let object = office.object(container.index());
    let extension = container.extension(
        object,
        Some((governance.extension_type, governance.extension_name)),
    )?;
    thread
        .governance()
        .register(index, container.index(), container.key(), extension);
    Ok(())
}

/// Register a newly bound object with each active governance it is mapped to.
pub(crate) fn register_bound_object(
    office: &OfficeRuntime,
    thread: &ThreadState,
    container: &ManagedObjectContainer,
) -> Result<(), BoxError> {
    for index in &office.object(container.index()).governances {
        if thread.governance().is_active(*index) {
            register(office, thread, *index, container)?;
        }
    }
    Ok(())
}

/// Activate a governance and register every already-bound mapped object
/// visible from the calling function.
pub(crate) fn activate(
    office: &OfficeRuntime,
    thread: &ThreadState,
    function_scope: &ObjectScopeState,
    index: GovernanceIndex,
) -> Result<(), BoxError> {
    if !thread.governance().activate(index)? {
        return Ok(());
    }
    let meta = office.governance_meta(index);
    tracing::debug!(
        "governance_activated: governance={}, process={}",
        meta.name,
        thread.process().id()
    );
    office.emit(KernelEvent::GovernanceActivated {
        governance: meta.name.clone(),
    });

    let bound = function_scope
        .bound()
        .into_iter()
        .chain(thread.objects().bound())
        .chain(thread.process().objects().bound());
    for container in bound {
        if office.object(container.index()).governances.contains(&index) {
            register(office, thread, index, &container)?;
        }
    }
    Ok(())
}

/// Enforce an active governance. Returns `Ok(false)` if it was not active.
pub(crate) fn enforce(
    office: &OfficeRuntime,
    thread: &ThreadState,
    index: GovernanceIndex,
) -> Result<bool, BoxError> {
    complete(office, thread, index, GovernanceState::Enforced)
}

/// Disregard an active governance. Returns `Ok(false)` if it was not active.
pub(crate) fn disregard(
    office: &OfficeRuntime,
    thread: &ThreadState,
    index: GovernanceIndex,
) -> Result<bool, BoxError> {
    complete(office, thread, index, GovernanceState::Disregarded)
}

fn complete(
    office: &OfficeRuntime,
    thread: &ThreadState,
    index: GovernanceIndex,
    to: GovernanceState,
) -> Result<bool, BoxError> {
    let Some(extensions) = thread.governance().begin(index, to) else {
        return Ok(false);
    };
    let meta = office.governance_meta(index);
    let (action, operation) = match to {
        GovernanceState::Enforced => ("enforce", format!("enforce '{}'", meta.name)),
        _ => ("disregard", format!("disregard '{}'", meta.name)),
    };
    let result = with_recovery(
        || match to {
            GovernanceState::Enforced => meta.governance.enforce(&extensions),
            _ => meta.governance.disregard(&extensions),
        },
        &operation,
    );
    thread.governance().finish(index);

    tracing::debug!(
        "governance_completed: governance={}, action={}, extensions={}, success={}",
        meta.name,
        action,
        extensions.len(),
        result.is_ok()
    );
    office.emit(match to {
        GovernanceState::Enforced => KernelEvent::GovernanceEnforced {
            governance: meta.name.clone(),
            extensions: extensions.len(),
        },
        _ => KernelEvent::GovernanceDisregarded {
            governance: meta.name.clone(),
            extensions: extensions.len(),
        },
    });

    result.map(|_| true).map_err(|source| {
        Box::new(GovernanceFailure {
            governance: meta.name.clone(),
            action,
            source,
        }) as BoxError
    })
}

/// Governance handle available to administration duties.
pub struct GovernanceManager<'a> {
    office: &'a OfficeRuntime,
    thread: &'a ThreadState,
    function_scope: &'a ObjectScopeState,
    index: GovernanceIndex,
}

impl fmt::Debug for GovernanceManager<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GovernanceManager")
            .field("governance", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl<'a> GovernanceManager<'a> {
    pub(crate) fn new(
        office: &'a OfficeRuntime,
        thread: &'a ThreadState,
        function_scope: &'a ObjectScopeState,
        index: GovernanceIndex,
    ) -> Self {
        Self {
            office,
            thread,
            function_scope,
            index,
        }
    }

    pub fn name(&self) -> &str {
        &self.office.governance_meta(self.index).name
    }

    pub fn state(&self) -> GovernanceState {
        self.thread.governance().state(self.index)
    }

    pub fn is_active(&self) -> bool {
        self.thread.governance().is_active(self.index)
    }

    /// Activate the governance. Activating an active governance is a no-op.
    pub fn activate(&self) -> Result<(), BoxError> {
        activate(self.office, self.thread, self.function_scope, self.index)
    }

    /// Enforce over the objects registered so far.
    pub fn enforce(&self) -> Result<(), BoxError> {
        enforce(self.office, self.thread, self.index).map(|_| ())
    }

    /// Disregard over the objects registered so far.
    pub fn disregard(&self) -> Result<(), BoxError> {
        disregard(self.office, self.thread, self.index).map(|_| ())
    }
}
