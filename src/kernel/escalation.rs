//! Escalations - the kernel's failure propagation unit.
//!
//! An [`Escalation`] wraps the failing cause together with the node that
//! raised it. Escalations are offered, in order, to the flow callback of the
//! failing flow, the failing function's own [`EscalationProcedure`], the
//! invoker of a nested sequential flow, the office procedure and finally the
//! framework handler, which terminates the process.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::type_name;
use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

use super::metadata::FunctionIndex;
use super::types::AdministrationPhase;
use crate::types::{BoxError, EscalationId};

/// Shared failure cause.
pub type EscalationCause = Arc<dyn StdError + Send + Sync + 'static>;

/// Classification of an escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    /// A managed object could not be bound or an extension not extracted.
    ObjectResolution,
    /// Administration logic failed.
    DutyFailure,
    /// Function body failed.
    FunctionFailure,
    /// An invoked flow failed and nothing nearer consumed it.
    FlowFailure,
    /// An asynchronous flow was not settled before its timeout.
    AsynchronousFlowTimeout,
    /// Governance enforcement or disregard failed.
    GovernanceFailure,
    /// A recycle callback failed. Never aborts teardown.
    CleanupFailure,
    /// Work abandoned because its process was terminated.
    Cancelled,
}

impl fmt::Display for EscalationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EscalationKind::ObjectResolution => "object_resolution",
            EscalationKind::DutyFailure => "duty_failure",
            EscalationKind::FunctionFailure => "function_failure",
            EscalationKind::FlowFailure => "flow_failure",
            EscalationKind::AsynchronousFlowTimeout => "asynchronous_flow_timeout",
            EscalationKind::GovernanceFailure => "governance_failure",
            EscalationKind::CleanupFailure => "cleanup_failure",
            EscalationKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Node that raised an escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscalationSource {
    Function {
        function: String,
    },
    Duty {
        function: String,
        duty: String,
        phase: AdministrationPhase,
    },
    ManagedObject {
        object: String,
    },
    Governance {
        governance: String,
    },
    Framework,
}

impl fmt::Display for EscalationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationSource::Function { function } => write!(f, "function '{}'", function),
            EscalationSource::Duty {
                function,
                duty,
                phase,
            } => write!(f, "{} duty '{}' of function '{}'", phase, duty, function),
            EscalationSource::ManagedObject { object } => write!(f, "managed object '{}'", object),
            EscalationSource::Governance { governance } => {
                write!(f, "governance '{}'", governance)
            }
            EscalationSource::Framework => f.write_str("framework"),
        }
    }
}

#[derive(Debug)]
struct EscalationInner {
    id: EscalationId,
    cause: EscalationCause,
    kind: EscalationKind,
    source: EscalationSource,
    origin: Option<FunctionIndex>,
    /// Handlers this instance was routed to, or that re-raised it.
    excluded: Mutex<Vec<FunctionIndex>>,
    raised_at: DateTime<Utc>,
}

/// A raised failure travelling towards its handler.
///
/// Cloning is cheap and preserves identity: every clone reports the same
/// [`id`](Escalation::id).
#[derive(Clone)]
pub struct Escalation {
    inner: Arc<EscalationInner>,
}

impl Escalation {
    /// Create an escalation from a boxed cause. A cause that already is an
    /// escalation is passed through, keeping its identity.
    pub fn new(cause: BoxError, kind: EscalationKind, source: EscalationSource) -> Self {
        Self::raised(cause, kind, source, None)
    }

    pub(crate) fn raised(
        cause: BoxError,
        kind: EscalationKind,
        source: EscalationSource,
        origin: Option<FunctionIndex>,
    ) -> Self {
        match cause.downcast::<Escalation>() {
            Ok(existing) => {
                // Re-raised: the raising function may not handle it again.
                if let Some(function) = origin {
                    existing.exclude(function);
                }
                *existing
            }
            Err(cause) => Self {
                inner: Arc::new(EscalationInner {
                    id: EscalationId::new(),
                    cause: Arc::from(cause),
                    kind,
                    source,
                    origin,
                    excluded: Mutex::new(Vec::new()),
                    raised_at: Utc::now(),
                }),
            },
        }
    }

    pub(crate) fn framework(
        cause: impl StdError + Send + Sync + 'static,
        kind: EscalationKind,
    ) -> Self {
        Self::new(Box::new(cause), kind, EscalationSource::Framework)
    }

    pub fn id(&self) -> &EscalationId {
        &self.inner.id
    }

    pub fn kind(&self) -> EscalationKind {
        self.inner.kind
    }

    pub fn source(&self) -> &EscalationSource {
        &self.inner.source
    }

    pub fn cause(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.inner.cause
    }

    pub fn raised_at(&self) -> DateTime<Utc> {
        self.inner.raised_at
    }

    /// Function whose body or duty raised this escalation.
    pub(crate) fn origin(&self) -> Option<FunctionIndex> {
        self.inner.origin
    }

    /// Never offer this instance to `handler` again.
    pub(crate) fn exclude(&self, handler: FunctionIndex) {
        let mut excluded = self
            .inner
            .excluded
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !excluded.contains(&handler) {
            excluded.push(handler);
        }
    }

    /// Whether `handler` raised, re-raised or already handled this instance.
    pub(crate) fn is_excluded(&self, handler: FunctionIndex) -> bool {
        self.inner.origin == Some(handler)
            || self
                .inner
                .excluded
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&handler)
    }

    /// Whether the cause is of type `E`.
    pub fn is<E: StdError + 'static>(&self) -> bool {
        self.cause().is::<E>()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.cause().downcast_ref::<E>()
    }

    /// Whether both handles refer to the same raised escalation.
    pub fn same_instance(&self, other: &Escalation) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Escalation")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("cause", &self.inner.cause.to_string())
            .finish()
    }
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} escalation from {}: {}",
            self.inner.kind, self.inner.source, self.inner.cause
        )
    }
}

impl StdError for Escalation {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.inner.cause)
    }
}

// =============================================================================
// Kernel-raised causes
// =============================================================================

/// Raised when an asynchronous flow is not settled within its timeout.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("asynchronous flow timed out after {timeout:?}")]
pub struct AsynchronousFlowTimeout {
    pub timeout: Duration,
}

/// Raised when a managed object source fails to supply its object.
#[derive(Error, Debug)]
#[error("failed to bind managed object '{object}'")]
pub struct ObjectResolutionFailure {
    pub object: String,
    #[source]
    pub source: BoxError,
}

/// Raised when an extension interface cannot be extracted from a bound object.
#[derive(Error, Debug)]
#[error("failed to extract extension '{extension}' from managed object '{object}'")]
pub struct ExtensionExtractionFailure {
    pub object: String,
    pub extension: &'static str,
    #[source]
    pub source: BoxError,
}

/// Raised when a governance fails to enforce or disregard.
#[derive(Error, Debug)]
#[error("governance '{governance}' failed to {action}")]
pub struct GovernanceFailure {
    pub governance: String,
    pub action: &'static str,
    #[source]
    pub source: BoxError,
}

/// Raised when a recycle callback fails.
#[derive(Error, Debug)]
#[error("failed to recycle managed object '{object}'")]
pub struct RecycleFailure {
    pub object: String,
    #[source]
    pub source: BoxError,
}

/// Delivered to callbacks of work abandoned by a terminated process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("process cancelled: {reason}")]
pub struct ProcessCancelled {
    pub reason: String,
}

/// User code panicked.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("panic in {operation}: {message}")]
pub struct PanicEscalation {
    pub operation: String,
    pub message: String,
}

// =============================================================================
// Escalation procedure
// =============================================================================

/// Escalation type handled by a procedure entry.
#[derive(Clone, Copy)]
pub struct EscalationType {
    name: &'static str,
    matcher: fn(&Escalation) -> bool,
}

fn cause_is<E: StdError + 'static>(escalation: &Escalation) -> bool {
    escalation.is::<E>()
}

fn matches_any(_: &Escalation) -> bool {
    true
}

impl EscalationType {
    /// Matches escalations whose cause is of type `E`.
    pub fn of<E: StdError + 'static>() -> Self {
        Self {
            name: type_name::<E>(),
            matcher: cause_is::<E>,
        }
    }

    /// Matches every escalation.
    pub fn any() -> Self {
        Self {
            name: "any",
            matcher: matches_any,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn matches(&self, escalation: &Escalation) -> bool {
        (self.matcher)(escalation)
    }
}

impl fmt::Debug for EscalationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EscalationType").field(&self.name).finish()
    }
}

/// One `(escalation type, handler)` entry.
#[derive(Debug, Clone)]
pub struct EscalationFlow {
    pub escalation_type: EscalationType,
    pub handler: FunctionIndex,
}

/// Ordered escalation handlers, consulted top-down by first assignable match.
#[derive(Debug, Clone, Default)]
pub struct EscalationProcedure {
    flows: Vec<EscalationFlow>,
}

impl EscalationProcedure {
    pub fn new(flows: Vec<EscalationFlow>) -> Self {
        Self { flows }
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn flows(&self) -> &[EscalationFlow] {
        &self.flows
    }

    /// Select the handler for an escalation.
    ///
    /// The function (or owner of the duty) that raised the escalation, and
    /// any handler this instance was already routed to or re-raised by, is
    /// never selected for it.
    pub fn select(&self, escalation: &Escalation) -> Option<FunctionIndex> {
        self.flows
            .iter()
            .filter(|flow| !escalation.is_excluded(flow.handler))
            .find(|flow| flow.escalation_type.matches(escalation))
            .map(|flow| flow.handler)
    }

    /// Select a handler and exclude it from later selection for the same
    /// escalation instance.
    pub(crate) fn claim(&self, escalation: &Escalation) -> Option<FunctionIndex> {
        let handler = self.select(escalation)?;
        escalation.exclude(handler);
        Some(handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Error, Debug)]
    #[error("database unavailable")]
    struct DatabaseError;

    #[derive(Error, Debug)]
    #[error("bad input")]
    struct InputError;

    fn escalation(cause: BoxError, origin: Option<usize>) -> Escalation {
        Escalation::raised(
            cause,
            EscalationKind::FunctionFailure,
            EscalationSource::Function {
                function: "task".to_string(),
            },
            origin.map(FunctionIndex),
        )
    }

    #[test]
    fn test_escalation_type_matches_cause() {
        let esc = escalation(Box::new(DatabaseError), None);
        assert!(EscalationType::of::<DatabaseError>().matches(&esc));
        assert!(!EscalationType::of::<InputError>().matches(&esc));
        assert!(EscalationType::any().matches(&esc));
        assert!(esc.downcast_ref::<DatabaseError>().is_some());
    }

    #[test]
    fn test_procedure_first_match_wins() {
        let procedure = EscalationProcedure::new(vec![
            EscalationFlow {
                escalation_type: EscalationType::any(),
                handler: FunctionIndex(1),
            },
            EscalationFlow {
                escalation_type: EscalationType::of::<DatabaseError>(),
                handler: FunctionIndex(2),
            },
        ]);
        let esc = escalation(Box::new(DatabaseError), None);
        assert_eq!(procedure.select(&esc), Some(FunctionIndex(1)));
    }

    #[test]
    fn test_procedure_skips_raising_function() {
        let procedure = EscalationProcedure::new(vec![
            EscalationFlow {
                escalation_type: EscalationType::of::<DatabaseError>(),
                handler: FunctionIndex(3),
            },
            EscalationFlow {
                escalation_type: EscalationType::any(),
                handler: FunctionIndex(4),
            },
        ]);
        let esc = escalation(Box::new(DatabaseError), Some(3));
        assert_eq!(procedure.select(&esc), Some(FunctionIndex(4)));

        let only_self = EscalationProcedure::new(vec![EscalationFlow {
            escalation_type: EscalationType::of::<DatabaseError>(),
            handler: FunctionIndex(3),
        }]);
        assert_eq!(only_self.select(&esc), None);
    }

    #[test]
    fn test_claimed_handler_not_selected_again() {
        let procedure = EscalationProcedure::new(vec![
            EscalationFlow {
                escalation_type: EscalationType::of::<DatabaseError>(),
                handler: FunctionIndex(5),
            },
            EscalationFlow {
                escalation_type: EscalationType::any(),
                handler: FunctionIndex(6),
            },
        ]);
        let esc = escalation(Box::new(DatabaseError), Some(0));
        assert_eq!(procedure.claim(&esc), Some(FunctionIndex(5)));

        // The handler re-raises the instance it was given.
        let reraised = Escalation::raised(
            Box::new(esc.clone()),
            EscalationKind::FunctionFailure,
            EscalationSource::Function {
                function: "handler".to_string(),
            },
            Some(FunctionIndex(5)),
        );
        assert!(reraised.same_instance(&esc));
        assert_eq!(procedure.claim(&reraised), Some(FunctionIndex(6)));
        assert_eq!(procedure.claim(&reraised), None);
    }

    #[test]
    fn test_reraising_function_is_excluded() {
        let procedure = EscalationProcedure::new(vec![EscalationFlow {
            escalation_type: EscalationType::any(),
            handler: FunctionIndex(2),
        }]);
        let esc = escalation(Box::new(InputError), Some(1));
        let reraised = Escalation::raised(
            Box::new(esc),
            EscalationKind::FunctionFailure,
            EscalationSource::Function {
                function: "relay".to_string(),
            },
            Some(FunctionIndex(2)),
        );
        assert_eq!(procedure.select(&reraised), None);
    }

    #[test]
    fn test_escalation_passthrough_preserves_identity() {
        let original = escalation(Box::new(InputError), None);
        let rewrapped = Escalation::new(
            Box::new(original.clone()),
            EscalationKind::FlowFailure,
            EscalationSource::Framework,
        );
        assert!(rewrapped.same_instance(&original));
        assert_eq!(rewrapped.kind(), EscalationKind::FunctionFailure);
    }

    #[test]
    fn test_display_names_source() {
        let esc = Escalation::raised(
            Box::new(InputError),
            EscalationKind::DutyFailure,
            EscalationSource::Duty {
                function: "task".to_string(),
                duty: "preTask".to_string(),
                phase: AdministrationPhase::Pre,
            },
            None,
        );
        assert_eq!(
            esc.to_string(),
            "duty_failure escalation from pre duty 'preTask' of function 'task': bad input"
        );
    }
}
