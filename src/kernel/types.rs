//! Kernel types: scopes, container/governance/process state machines, flow strategies.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scope owning a managed object binding. Ordered from narrowest to widest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagedObjectScope {
    Function,
    Thread,
    Process,
}

impl ManagedObjectScope {
    /// Whether an object of this scope may depend on an object of `dependency` scope.
    ///
    /// A dependency must live at least as long as its dependent.
    pub fn may_depend_on(self, dependency: ManagedObjectScope) -> bool {
        dependency >= self
    }
}

impl fmt::Display for ManagedObjectScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ManagedObjectScope::Function => "function",
            ManagedObjectScope::Thread => "thread",
            ManagedObjectScope::Process => "process",
        };
        f.write_str(s)
    }
}

/// Phase an administration duty runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdministrationPhase {
    Pre,
    Post,
}

impl fmt::Display for AdministrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdministrationPhase::Pre => f.write_str("pre"),
            AdministrationPhase::Post => f.write_str("post"),
        }
    }
}

/// How an invoked flow relates to its invoker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStrategy {
    /// Invoker's slot is held until the flow (and its `next` chain) completes.
    Sequential,
    /// Runs in the invoker's thread state; the invoker does not wait.
    Parallel,
    /// Runs in a new thread state of the same process.
    Spawn,
}

/// Managed function container state.
///
/// State transitions:
/// ```text
/// CREATED → OBJECTS_BOUND → PRE_ADMIN[i] → EXECUTING → POST_ADMIN[i] → UNLOADING → COMPLETE
///    └──────────────┴──────────────┴─────────────┴─────────→ ESCALATED ──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    ObjectsBound,
    PreAdministration(usize),
    Executing,
    PostAdministration(usize),
    Escalated,
    UnloadingObjects,
    Complete,
}

impl ContainerState {
    /// Check if this is a terminal state.
    pub fn is_terminal(self) -> bool {
        self == ContainerState::Complete
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: ContainerState) -> bool {
        use ContainerState::*;
        match (self, to) {
            (Created, ObjectsBound) => true,
            (ObjectsBound, PreAdministration(0)) => true,
            (ObjectsBound, Executing) => true,
            (PreAdministration(i), PreAdministration(j)) => j == i + 1,
            (PreAdministration(_), Executing) => true,
            (Executing, PostAdministration(0)) => true,
            (Executing, UnloadingObjects) => true,
            (PostAdministration(i), PostAdministration(j)) => j == i + 1,
            (PostAdministration(_), UnloadingObjects) => true,
            // Escalation from any live state
            (
                Created | ObjectsBound | PreAdministration(_) | Executing | PostAdministration(_),
                Escalated,
            ) => true,
            (Escalated, UnloadingObjects) => true,
            (UnloadingObjects, Complete) => true,
            // COMPLETE is terminal
            (Complete, _) => false,
            _ => false,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Created => f.write_str("CREATED"),
            ContainerState::ObjectsBound => f.write_str("OBJECTS_BOUND"),
            ContainerState::PreAdministration(i) => write!(f, "PRE_ADMIN[{}]", i),
            ContainerState::Executing => f.write_str("EXECUTING"),
            ContainerState::PostAdministration(i) => write!(f, "POST_ADMIN[{}]", i),
            ContainerState::Escalated => f.write_str("ESCALATED"),
            ContainerState::UnloadingObjects => f.write_str("UNLOADING_OBJECTS"),
            ContainerState::Complete => f.write_str("COMPLETE"),
        }
    }
}

/// Governance lifecycle.
///
/// ```text
/// INACTIVE → ACTIVE → {ENFORCED | DISREGARDED} → INACTIVE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernanceState {
    Inactive,
    Active,
    Enforced,
    Disregarded,
}

impl GovernanceState {
    /// Check if transition is valid.
    pub fn can_transition_to(self, to: GovernanceState) -> bool {
        use GovernanceState::*;
        matches!(
            (self, to),
            (Inactive, Active)
                | (Active, Enforced)
                | (Active, Disregarded)
                // Silent clear on scope close (manual governance)
                | (Active, Inactive)
                | (Enforced, Inactive)
                | (Disregarded, Inactive)
        )
    }
}

/// Process lifecycle.
///
/// ```text
/// NEW → RUNNING → {COMPLETE | TERMINATING → COMPLETE}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    New,
    Running,
    /// An escalation reached the framework handler; remaining work is cancelled.
    Terminating,
    Complete,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        self == ProcessStatus::Complete
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: ProcessStatus) -> bool {
        use ProcessStatus::*;
        matches!(
            (self, to),
            (New, Running) | (Running, Terminating) | (Running, Complete) | (Terminating, Complete)
        )
    }
}
