//! Kernel - managed function execution.
//!
//! An office is declared through [`OfficeBuilder`], linked into an
//! index-resolved [`OfficeMetaData`] and opened as an [`Office`]. Each
//! invocation of a [`FunctionManager`] starts a process whose flows run
//! managed function containers:
//!
//! ```text
//!   FunctionManager ──▶ Process ──▶ Thread ──▶ Flow ──▶ Container ──next──▶ Container
//!                          │           │                   │
//!                    process objects  thread objects    function objects
//!                                     governance        pre duties · body · post duties
//! ```
//!
//! Subsystems are plain structs shared through `Arc`; there is no global
//! state and no actor. Containers hold their own lock only between user
//! calls, so duties, bodies, callbacks and governance may re-enter the
//! kernel freely. Containers are started and resumed through a per-thread
//! continuation queue, never by nested calls.

mod administration;
mod container;
mod driver;
mod escalation;
mod flow;
mod governance;
mod metadata;
mod object;
mod observer;
mod office;
mod process;
mod recovery;
mod team;
mod thread;
mod types;

pub use administration::{AdministrationContext, Duty};
pub use container::{FunctionContext, ManagedFunction};
pub use escalation::{
    AsynchronousFlowTimeout, Escalation, EscalationCause, EscalationFlow, EscalationKind,
    EscalationProcedure, EscalationSource, EscalationType, ExtensionExtractionFailure,
    GovernanceFailure, ObjectResolutionFailure, PanicEscalation, ProcessCancelled, RecycleFailure,
};
pub use flow::{AsynchronousFlow, FlowCallback, FlowOutcome};
pub use governance::{Governance, GovernanceManager};
pub use metadata::{
    DutyBuilder, FunctionBuilder, FunctionIndex, GovernanceIndex, ManagedObjectBuilder,
    ManagedObjectIndex, OfficeBuilder, OfficeMetaData, TeamIndex,
};
pub use object::{Extension, ManagedObjectInstance, ObjectDependencies};
pub use observer::{ExecutionObserver, KernelEvent, NoopObserver, RecordingObserver};
pub use office::{FunctionManager, Office};
pub use process::{ProcessCallback, ProcessCompletion};
pub use recovery::with_recovery;
pub use team::{Executor, Job, PassiveTeam, Team, WorkerTeam};
pub use types::{
    AdministrationPhase, ContainerState, FlowStrategy, GovernanceState, ManagedObjectScope,
    ProcessStatus,
};
