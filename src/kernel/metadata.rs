//! Office metadata: the builder API and the linked, index-resolved arena.
//!
//! Offices are declared by name through [`OfficeBuilder`] and linked once
//! into [`OfficeMetaData`]. Linking resolves every name to an index and
//! rejects unresolved references, scope violations, dependency cycles and
//! mismatched `next` type tags, so the runtime never looks anything up by
//! name.

use std::any::{type_name, Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::administration::{AdministrationContext, AdministrationMetaData, Duty};
use super::container::{FunctionContext, ManagedFunction};
use super::escalation::{EscalationFlow, EscalationProcedure, EscalationType};
use super::flow::FlowMetaData;
use super::governance::{Governance, GovernanceMetaData};
use super::object::{
    downcast_instance, Extension, ExtensionExtractor, ManagedObjectInstance,
    ManagedObjectMetaData, ObjectDependencies, ObjectSourceFn, RecycleFn,
};
use super::observer::{ExecutionObserver, NoopObserver};
use super::office::Office;
use super::team::Team;
use super::types::{AdministrationPhase, FlowStrategy, ManagedObjectScope};
use crate::types::{BoxError, Error, KernelConfig, Result};

macro_rules! define_index {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub(crate) usize);

        impl $name {
            pub fn get(self) -> usize {
                self.0
            }
        }
    };
}

define_index!(
    /// Position of a function in the linked office.
    FunctionIndex
);
define_index!(
    /// Position of a managed object in the linked office.
    ManagedObjectIndex
);
define_index!(
    /// Position of a governance in the linked office.
    GovernanceIndex
);
define_index!(
    /// Position of a team in the linked office.
    TeamIndex
);

// =============================================================================
// Linked metadata
// =============================================================================

pub(crate) enum TeamSource {
    Workers(usize),
    Custom(Arc<dyn Team>),
}

pub(crate) struct TeamMetaData {
    pub(crate) name: String,
    pub(crate) source: TeamSource,
}

/// Linked function metadata.
pub(crate) struct ManagedFunctionMetaData {
    pub(crate) index: FunctionIndex,
    pub(crate) name: String,
    pub(crate) body: Arc<dyn ManagedFunction>,
    /// Objects visible to the body, in declaration order.
    pub(crate) objects: Vec<ManagedObjectIndex>,
    /// Body objects followed by duty objects, deduplicated; the bind order.
    pub(crate) required_objects: Vec<ManagedObjectIndex>,
    pub(crate) pre_administration: Vec<AdministrationMetaData>,
    pub(crate) post_administration: Vec<AdministrationMetaData>,
    pub(crate) flows: Vec<FlowMetaData>,
    pub(crate) next: Option<FunctionIndex>,
    pub(crate) team: Option<TeamIndex>,
    pub(crate) escalation_procedure: EscalationProcedure,
    pub(crate) parameter_type: Option<String>,
    pub(crate) return_type: Option<String>,
    pub(crate) asynchronous_flow_timeout: Option<Duration>,
}

impl ManagedFunctionMetaData {
    pub(crate) fn administration(&self, phase: AdministrationPhase) -> &[AdministrationMetaData] {
        match phase {
            AdministrationPhase::Pre => &self.pre_administration,
            AdministrationPhase::Post => &self.post_administration,
        }
    }
}

impl fmt::Debug for ManagedFunctionMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedFunctionMetaData")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("objects", &self.objects)
            .field("pre_administration", &self.pre_administration.len())
            .field("post_administration", &self.post_administration.len())
            .field("flows", &self.flows)
            .field("next", &self.next)
            .field("team", &self.team)
            .finish()
    }
}

/// Linked, immutable description of an office.
pub struct OfficeMetaData {
    pub(crate) name: String,
    pub(crate) functions: Vec<ManagedFunctionMetaData>,
    pub(crate) function_names: HashMap<String, FunctionIndex>,
    pub(crate) objects: Vec<ManagedObjectMetaData>,
    pub(crate) governances: Vec<GovernanceMetaData>,
    pub(crate) teams: Vec<TeamMetaData>,
    pub(crate) escalation_procedure: EscalationProcedure,
    pub(crate) manual_governance: bool,
    pub(crate) asynchronous_flow_timeout: Option<Duration>,
    pub(crate) executor_threads: usize,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) observer: Arc<dyn ExecutionObserver>,
}

impl OfficeMetaData {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function_index(&self, name: &str) -> Option<FunctionIndex> {
        self.function_names.get(name).copied()
    }

    pub fn function_names(&self) -> Vec<&str> {
        self.functions.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn object_names(&self) -> Vec<&str> {
        self.objects.iter().map(|o| o.name.as_str()).collect()
    }

    pub fn is_manual_governance(&self) -> bool {
        self.manual_governance
    }
}

impl fmt::Debug for OfficeMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfficeMetaData")
            .field("name", &self.name)
            .field("functions", &self.functions)
            .field("objects", &self.objects)
            .field("governances", &self.governances)
            .field("manual_governance", &self.manual_governance)
            .finish()
    }
}

// =============================================================================
// Builder specs
// =============================================================================

struct ManagedObjectSpec {
    name: String,
    scope: ManagedObjectScope,
    object_type: TypeId,
    object_type_name: &'static str,
    source: ObjectSourceFn,
    extensions: HashMap<TypeId, ExtensionExtractor>,
    recycle: Option<RecycleFn>,
    dependencies: Vec<String>,
    governances: Vec<String>,
}

struct GovernanceSpec {
    name: String,
    extension_type: TypeId,
    extension_name: &'static str,
    governance: Arc<dyn Governance>,
}

struct DutySpec {
    name: String,
    duty: Arc<dyn Duty>,
    objects: Vec<String>,
    extension: Option<(TypeId, &'static str)>,
    governances: Vec<String>,
    flows: Vec<(String, FlowStrategy)>,
    team: Option<String>,
    asynchronous_flow_timeout: Option<Duration>,
}

struct FunctionSpec {
    name: String,
    body: Arc<dyn ManagedFunction>,
    objects: Vec<String>,
    next: Option<String>,
    flows: Vec<(String, FlowStrategy)>,
    team: Option<String>,
    escalations: Vec<(EscalationType, String)>,
    parameter_type: Option<String>,
    return_type: Option<String>,
    pre: Vec<DutySpec>,
    post: Vec<DutySpec>,
    asynchronous_flow_timeout: Option<Duration>,
}

// =============================================================================
// Builders
// =============================================================================

/// Declares an office by name.
///
/// # Example
/// ```
/// use office_kernel::kernel::OfficeBuilder;
/// use serde_json::json;
///
/// let mut office = OfficeBuilder::new("demo");
/// office.function("hello", |_ctx| Ok(json!("hello")));
/// let metadata = office.link().unwrap();
/// assert_eq!(metadata.function_names(), vec!["hello"]);
/// ```
pub struct OfficeBuilder {
    name: String,
    functions: Vec<FunctionSpec>,
    objects: Vec<ManagedObjectSpec>,
    governances: Vec<GovernanceSpec>,
    teams: Vec<TeamMetaData>,
    escalations: Vec<(EscalationType, String)>,
    manual_governance: bool,
    asynchronous_flow_timeout: Option<Duration>,
    executor_threads: usize,
    shutdown_timeout: Duration,
    observer: Option<Arc<dyn ExecutionObserver>>,
}

impl OfficeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(name, &KernelConfig::default())
    }

    /// Start from configuration: teams, governance mode, timeouts and executor.
    pub fn from_config(name: impl Into<String>, config: &KernelConfig) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
            objects: Vec::new(),
            governances: Vec::new(),
            teams: config
                .teams
                .iter()
                .map(|team| TeamMetaData {
                    name: team.name.clone(),
                    source: TeamSource::Workers(team.size),
                })
                .collect(),
            escalations: Vec::new(),
            manual_governance: config.governance.manual,
            asynchronous_flow_timeout: config.asynchronous_flow.default_timeout,
            executor_threads: config.executor.threads,
            shutdown_timeout: config.shutdown.timeout,
            observer: None,
        }
    }

    /// Declare a worker team of `size` threads.
    pub fn team(&mut self, name: impl Into<String>, size: usize) -> &mut Self {
        self.teams.push(TeamMetaData {
            name: name.into(),
            source: TeamSource::Workers(size),
        });
        self
    }

    /// Declare a team backed by a custom [`Team`] implementation.
    pub fn custom_team(&mut self, name: impl Into<String>, team: Arc<dyn Team>) -> &mut Self {
        self.teams.push(TeamMetaData {
            name: name.into(),
            source: TeamSource::Custom(team),
        });
        self
    }

    /// Declare a managed object of type `T` supplied by `source`.
    pub fn managed_object<T, F>(
        &mut self,
        name: impl Into<String>,
        scope: ManagedObjectScope,
        source: F,
    ) -> ManagedObjectBuilder<'_, T>
    where
        T: Any + Send + Sync,
        F: Fn(&ObjectDependencies<'_>) -> std::result::Result<T, BoxError> + Send + Sync + 'static,
    {
        let source = object_source(move |dependencies| {
            source(dependencies).map(|object| Arc::new(object) as ManagedObjectInstance)
        });
        self.objects.push(ManagedObjectSpec {
            name: name.into(),
            scope,
            object_type: TypeId::of::<T>(),
            object_type_name: type_name::<T>(),
            source,
            extensions: HashMap::new(),
            recycle: None,
            dependencies: Vec::new(),
            governances: Vec::new(),
        });
        let last = self.objects.len() - 1;
        ManagedObjectBuilder {
            spec: &mut self.objects[last],
            _object: std::marker::PhantomData,
        }
    }

    /// Declare a governance over extension type `E`.
    pub fn governance<E, G>(&mut self, name: impl Into<String>, governance: G) -> &mut Self
    where
        E: Any + Send + Sync,
        G: Governance,
    {
        self.governances.push(GovernanceSpec {
            name: name.into(),
            extension_type: TypeId::of::<E>(),
            extension_name: type_name::<E>(),
            governance: Arc::new(governance),
        });
        self
    }

    /// Declare a function.
    pub fn function<F>(&mut self, name: impl Into<String>, body: F) -> FunctionBuilder<'_>
    where
        F: Fn(&mut FunctionContext<'_>) -> std::result::Result<Value, BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.managed_function(name, Arc::new(body))
    }

    /// Declare a function from a [`ManagedFunction`] implementation.
    pub fn managed_function(
        &mut self,
        name: impl Into<String>,
        body: Arc<dyn ManagedFunction>,
    ) -> FunctionBuilder<'_> {
        self.functions.push(FunctionSpec {
            name: name.into(),
            body,
            objects: Vec::new(),
            next: None,
            flows: Vec::new(),
            team: None,
            escalations: Vec::new(),
            parameter_type: None,
            return_type: None,
            pre: Vec::new(),
            post: Vec::new(),
            asynchronous_flow_timeout: None,
        });
        let last = self.functions.len() - 1;
        FunctionBuilder {
            spec: &mut self.functions[last],
        }
    }

    /// Office-level handler for escalations whose cause is `E`.
    pub fn escalation<E: StdError + 'static>(&mut self, handler: impl Into<String>) -> &mut Self {
        self.escalation_type(EscalationType::of::<E>(), handler)
    }

    pub fn escalation_type(
        &mut self,
        escalation_type: EscalationType,
        handler: impl Into<String>,
    ) -> &mut Self {
        self.escalations.push((escalation_type, handler.into()));
        self
    }

    /// Never enforce governance implicitly; duties must enforce or disregard.
    pub fn manual_governance(&mut self, manual: bool) -> &mut Self {
        self.manual_governance = manual;
        self
    }

    /// Default timeout for asynchronous flows whose slot configures none.
    pub fn asynchronous_flow_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.asynchronous_flow_timeout = Some(timeout);
        self
    }

    pub fn executor_threads(&mut self, threads: usize) -> &mut Self {
        self.executor_threads = threads;
        self
    }

    pub fn observer(&mut self, observer: Arc<dyn ExecutionObserver>) -> &mut Self {
        self.observer = Some(observer);
        self
    }

    /// Link and open the office.
    pub fn open(self) -> Result<Office> {
        Office::open(self.link()?)
    }

    /// Resolve all names into an index-based [`OfficeMetaData`].
    pub fn link(self) -> Result<OfficeMetaData> {
        let function_names = unique_names("function", self.functions.iter().map(|f| &f.name))?;
        let object_names = unique_names("managed object", self.objects.iter().map(|o| &o.name))?;
        let governance_names =
            unique_names("governance", self.governances.iter().map(|g| &g.name))?;
        let team_names = unique_names("team", self.teams.iter().map(|t| &t.name))?;
        if self.executor_threads == 0 {
            return Err(Error::configuration("executor must have at least one thread"));
        }

        let functions_by_name: HashMap<String, FunctionIndex> = function_names
            .into_iter()
            .map(|(name, index)| (name, FunctionIndex(index)))
            .collect();
        let objects_by_name: HashMap<String, ManagedObjectIndex> = object_names
            .into_iter()
            .map(|(name, index)| (name, ManagedObjectIndex(index)))
            .collect();
        let governances_by_name: HashMap<String, GovernanceIndex> = governance_names
            .into_iter()
            .map(|(name, index)| (name, GovernanceIndex(index)))
            .collect();
        let teams_by_name: HashMap<String, TeamIndex> = team_names
            .into_iter()
            .map(|(name, index)| (name, TeamIndex(index)))
            .collect();
        let resolver = Resolver {
            functions: &functions_by_name,
            objects: &objects_by_name,
            governances: &governances_by_name,
            teams: &teams_by_name,
        };

        let governances: Vec<GovernanceMetaData> = self
            .governances
            .into_iter()
            .enumerate()
            .map(|(index, spec)| GovernanceMetaData {
                index: GovernanceIndex(index),
                name: spec.name,
                extension_type: spec.extension_type,
                extension_name: spec.extension_name,
                governance: spec.governance,
            })
            .collect();

        let objects = link_objects(self.objects, &resolver, &governances)?;

        let escalation_procedure = resolver.procedure(&self.escalations, "office")?;
        let mut functions = Vec::with_capacity(self.functions.len());
        for (index, spec) in self.functions.into_iter().enumerate() {
            functions.push(link_function(FunctionIndex(index), spec, &resolver, &objects)?);
        }
        check_next_types(&functions)?;

        tracing::debug!(
            "office_linked: office={}, functions={}, objects={}, governances={}, teams={}",
            self.name,
            functions.len(),
            objects.len(),
            governances.len(),
            self.teams.len()
        );

        Ok(OfficeMetaData {
            name: self.name,
            functions,
            function_names: functions_by_name,
            objects,
            governances,
            teams: self.teams,
            escalation_procedure,
            manual_governance: self.manual_governance,
            asynchronous_flow_timeout: self.asynchronous_flow_timeout,
            executor_threads: self.executor_threads,
            shutdown_timeout: self.shutdown_timeout,
            observer: self.observer.unwrap_or_else(|| Arc::new(NoopObserver)),
        })
    }
}

/// Declares a managed object's extensions, recycling, governance and dependencies.
pub struct ManagedObjectBuilder<'a, T> {
    spec: &'a mut ManagedObjectSpec,
    _object: std::marker::PhantomData<fn() -> T>,
}

impl<'a, T: Any + Send + Sync> ManagedObjectBuilder<'a, T> {
    /// Register an extractor for extension interface `E`.
    pub fn extension<E, F>(&mut self, extract: F) -> &mut Self
    where
        E: Any + Send + Sync,
        F: Fn(&Arc<T>) -> std::result::Result<E, BoxError> + Send + Sync + 'static,
    {
        let object = self.spec.name.clone();
        let extractor = extension_extractor(move |instance| {
            let typed = downcast_instance::<T>(instance, &object)?;
            extract(&typed).map(Extension::new)
        });
        self.spec.extensions.insert(TypeId::of::<E>(), extractor);
        self
    }

    /// Callback run once when the object's scope closes.
    pub fn recycle<F>(&mut self, recycle: F) -> &mut Self
    where
        F: Fn(&T) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        let object = self.spec.name.clone();
        self.spec.recycle = Some(recycle_fn(move |instance| {
            let typed = downcast_instance::<T>(instance, &object)?;
            recycle(&typed)
        }));
        self
    }

    /// Map the object to a governance.
    pub fn governance(&mut self, name: impl Into<String>) -> &mut Self {
        self.spec.governances.push(name.into());
        self
    }

    /// Declare a dependency, bound before this object.
    pub fn depends_on(&mut self, name: impl Into<String>) -> &mut Self {
        self.spec.dependencies.push(name.into());
        self
    }
}

/// Declares a function's objects, flows, duties and escalation handling.
pub struct FunctionBuilder<'a> {
    spec: &'a mut FunctionSpec,
}

impl<'a> FunctionBuilder<'a> {
    /// Object visible to the body as `ctx.object(i)`, `i` in declaration order.
    pub fn object(&mut self, name: impl Into<String>) -> &mut Self {
        self.spec.objects.push(name.into());
        self
    }

    /// Function run in the same flow after this one, receiving its return value.
    pub fn next(&mut self, name: impl Into<String>) -> &mut Self {
        self.spec.next = Some(name.into());
        self
    }

    /// Flow invocable by the body as `ctx.invoke_flow(i, ..)`.
    pub fn flow(&mut self, target: impl Into<String>, strategy: FlowStrategy) -> &mut Self {
        self.spec.flows.push((target.into(), strategy));
        self
    }

    pub fn team(&mut self, name: impl Into<String>) -> &mut Self {
        self.spec.team = Some(name.into());
        self
    }

    /// Function-level handler for escalations whose cause is `E`.
    pub fn escalation<E: StdError + 'static>(&mut self, handler: impl Into<String>) -> &mut Self {
        self.escalation_type(EscalationType::of::<E>(), handler)
    }

    pub fn escalation_type(
        &mut self,
        escalation_type: EscalationType,
        handler: impl Into<String>,
    ) -> &mut Self {
        self.spec.escalations.push((escalation_type, handler.into()));
        self
    }

    pub fn parameter_type(&mut self, tag: impl Into<String>) -> &mut Self {
        self.spec.parameter_type = Some(tag.into());
        self
    }

    pub fn return_type(&mut self, tag: impl Into<String>) -> &mut Self {
        self.spec.return_type = Some(tag.into());
        self
    }

    pub fn asynchronous_flow_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.spec.asynchronous_flow_timeout = Some(timeout);
        self
    }

    /// Append a duty to the pre-administration chain.
    pub fn pre_duty<F>(&mut self, name: impl Into<String>, duty: F) -> DutyBuilder<'_>
    where
        F: Fn(&[Extension], &mut AdministrationContext<'_>) -> std::result::Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.administration(AdministrationPhase::Pre, name.into(), Arc::new(duty))
    }

    /// Append a duty to the post-administration chain.
    pub fn post_duty<F>(&mut self, name: impl Into<String>, duty: F) -> DutyBuilder<'_>
    where
        F: Fn(&[Extension], &mut AdministrationContext<'_>) -> std::result::Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.administration(AdministrationPhase::Post, name.into(), Arc::new(duty))
    }

    /// Append a [`Duty`] implementation to a chain.
    pub fn administration(
        &mut self,
        phase: AdministrationPhase,
        name: impl Into<String>,
        duty: Arc<dyn Duty>,
    ) -> DutyBuilder<'_> {
        let chain = match phase {
            AdministrationPhase::Pre => &mut self.spec.pre,
            AdministrationPhase::Post => &mut self.spec.post,
        };
        chain.push(DutySpec {
            name: name.into(),
            duty,
            objects: Vec::new(),
            extension: None,
            governances: Vec::new(),
            flows: Vec::new(),
            team: None,
            asynchronous_flow_timeout: None,
        });
        let last = chain.len() - 1;
        DutyBuilder {
            spec: &mut chain[last],
        }
    }
}

/// Declares a duty's objects, extension interface, governance and flows.
pub struct DutyBuilder<'a> {
    spec: &'a mut DutySpec,
}

impl<'a> DutyBuilder<'a> {
    /// Object whose extension is passed to the duty, in declaration order.
    pub fn object(&mut self, name: impl Into<String>) -> &mut Self {
        self.spec.objects.push(name.into());
        self
    }

    /// Extension interface extracted from each object. Without it the duty
    /// receives the objects themselves.
    pub fn extension<E: Any + Send + Sync>(&mut self) -> &mut Self {
        self.spec.extension = Some((TypeId::of::<E>(), type_name::<E>()));
        self
    }

    /// Governance reachable as `ctx.governance(i)`.
    pub fn governance(&mut self, name: impl Into<String>) -> &mut Self {
        self.spec.governances.push(name.into());
        self
    }

    pub fn flow(&mut self, target: impl Into<String>, strategy: FlowStrategy) -> &mut Self {
        self.spec.flows.push((target.into(), strategy));
        self
    }

    pub fn team(&mut self, name: impl Into<String>) -> &mut Self {
        self.spec.team = Some(name.into());
        self
    }

    pub fn asynchronous_flow_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.spec.asynchronous_flow_timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for OfficeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfficeBuilder")
            .field("name", &self.name)
            .field("functions", &self.functions.iter().map(|s| &s.name).collect::<Vec<_>>())
            .field("objects", &self.objects.iter().map(|s| &s.name).collect::<Vec<_>>())
            .field("manual_governance", &self.manual_governance)
            .finish()
    }
}

impl<T> fmt::Debug for ManagedObjectBuilder<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObjectBuilder")
            .field("name", &self.spec.name)
            .field("scope", &self.spec.scope)
            .field("object_type", &self.spec.object_type_name)
            .finish()
    }
}

impl fmt::Debug for FunctionBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionBuilder")
            .field("name", &self.spec.name)
            .field("objects", &self.spec.objects)
            .field("next", &self.spec.next)
            .finish()
    }
}

impl fmt::Debug for DutyBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DutyBuilder")
            .field("name", &self.spec.name)
            .field("objects", &self.spec.objects)
            .finish()
    }
}

// =============================================================================
// Linking
// =============================================================================

fn object_source<F>(source: F) -> ObjectSourceFn
where
    F: Fn(&ObjectDependencies<'_>) -> std::result::Result<ManagedObjectInstance, BoxError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(source)
}

fn extension_extractor<F>(extract: F) -> ExtensionExtractor
where
    F: Fn(&ManagedObjectInstance) -> std::result::Result<Extension, BoxError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(extract)
}

fn recycle_fn<F>(recycle: F) -> RecycleFn
where
    F: Fn(&ManagedObjectInstance) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
{
    Arc::new(recycle)
}

fn unique_names<'a>(
    kind: &str,
    names: impl Iterator<Item = &'a String>,
) -> Result<HashMap<String, usize>> {
    let mut resolved = HashMap::new();
    for (index, name) in names.enumerate() {
        if name.is_empty() {
            return Err(Error::configuration(format!("{} name is required", kind)));
        }
        if resolved.insert(name.clone(), index).is_some() {
            return Err(Error::configuration(format!("duplicate {} '{}'", kind, name)));
        }
    }
    Ok(resolved)
}

struct Resolver<'a> {
    functions: &'a HashMap<String, FunctionIndex>,
    objects: &'a HashMap<String, ManagedObjectIndex>,
    governances: &'a HashMap<String, GovernanceIndex>,
    teams: &'a HashMap<String, TeamIndex>,
}

impl Resolver<'_> {
    fn function(&self, name: &str, referrer: &str) -> Result<FunctionIndex> {
        self.functions.get(name).copied().ok_or_else(|| {
            Error::configuration(format!("unknown function '{}' referenced by {}", name, referrer))
        })
    }

    fn object(&self, name: &str, referrer: &str) -> Result<ManagedObjectIndex> {
        self.objects.get(name).copied().ok_or_else(|| {
            Error::configuration(format!(
                "unknown managed object '{}' referenced by {}",
                name, referrer
            ))
        })
    }

    fn governance(&self, name: &str, referrer: &str) -> Result<GovernanceIndex> {
        self.governances.get(name).copied().ok_or_else(|| {
            Error::configuration(format!(
                "unknown governance '{}' referenced by {}",
                name, referrer
            ))
        })
    }

    fn team(&self, name: Option<&String>, referrer: &str) -> Result<Option<TeamIndex>> {
        name.map(|name| {
            self.teams.get(name).copied().ok_or_else(|| {
                Error::configuration(format!("unknown team '{}' referenced by {}", name, referrer))
            })
        })
        .transpose()
    }

    fn flows(&self, flows: &[(String, FlowStrategy)], referrer: &str) -> Result<Vec<FlowMetaData>> {
        flows
            .iter()
            .map(|(target, strategy)| {
                Ok(FlowMetaData {
                    target: self.function(target, referrer)?,
                    target_name: target.clone(),
                    strategy: *strategy,
                })
            })
            .collect()
    }

    fn procedure(
        &self,
        escalations: &[(EscalationType, String)],
        referrer: &str,
    ) -> Result<EscalationProcedure> {
        let flows = escalations
            .iter()
            .map(|(escalation_type, handler)| {
                Ok(EscalationFlow {
                    escalation_type: *escalation_type,
                    handler: self.function(handler, &format!("{} escalation procedure", referrer))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(EscalationProcedure::new(flows))
    }
}

fn link_objects(
    specs: Vec<ManagedObjectSpec>,
    resolver: &Resolver<'_>,
    governances: &[GovernanceMetaData],
) -> Result<Vec<ManagedObjectMetaData>> {
    let scopes: Vec<ManagedObjectScope> = specs.iter().map(|spec| spec.scope).collect();
    let mut objects = Vec::with_capacity(specs.len());
    for (index, spec) in specs.into_iter().enumerate() {
        let referrer = format!("managed object '{}'", spec.name);
        let dependencies = spec
            .dependencies
            .iter()
            .map(|name| resolver.object(name, &referrer))
            .collect::<Result<Vec<_>>>()?;
        for (name, dependency) in spec.dependencies.iter().zip(&dependencies) {
            let dependency_scope = scopes[dependency.0];
            if !spec.scope.may_depend_on(dependency_scope) {
                return Err(Error::configuration(format!(
                    "{}-scoped {} cannot depend on {}-scoped '{}'",
                    spec.scope, referrer, dependency_scope, name
                )));
            }
        }
        let mapped = spec
            .governances
            .iter()
            .map(|name| resolver.governance(name, &referrer))
            .collect::<Result<Vec<_>>>()?;
        for governance in &mapped {
            let meta = &governances[governance.0];
            if meta.extension_type != spec.object_type
                && !spec.extensions.contains_key(&meta.extension_type)
            {
                return Err(Error::configuration(format!(
                    "{} provides no extension '{}' required by governance '{}'",
                    referrer, meta.extension_name, meta.name
                )));
            }
        }

        let mut extensions = spec.extensions;
        // Governance over the object type itself receives the raw object.
        if !extensions.contains_key(&spec.object_type) {
            let object_type_name = spec.object_type_name;
            extensions.insert(
                spec.object_type,
                extension_extractor(move |instance| {
                    Ok(Extension::from_instance(instance, object_type_name))
                }),
            );
        }

        objects.push(ManagedObjectMetaData {
            index: ManagedObjectIndex(index),
            name: spec.name,
            scope: spec.scope,
            object_type: spec.object_type_name,
            source: spec.source,
            extensions,
            recycle: spec.recycle,
            dependencies,
            governances: mapped,
        });
    }
    check_dependency_cycles(&objects)?;
    Ok(objects)
}

fn check_dependency_cycles(objects: &[ManagedObjectMetaData]) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Visiting,
        Done,
    }

    fn visit(objects: &[ManagedObjectMetaData], marks: &mut [Mark], index: usize) -> Result<()> {
        match marks[index] {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                return Err(Error::configuration(format!(
                    "managed object dependency cycle through '{}'",
                    objects[index].name
                )))
            }
            Mark::Unvisited => {}
        }
        marks[index] = Mark::Visiting;
        for dependency in &objects[index].dependencies {
            visit(objects, marks, dependency.0)?;
        }
        marks[index] = Mark::Done;
        Ok(())
    }

    let mut marks = vec![Mark::Unvisited; objects.len()];
    for index in 0..objects.len() {
        visit(objects, &mut marks, index)?;
    }
    Ok(())
}

fn link_duty(
    phase: AdministrationPhase,
    spec: DutySpec,
    function: &str,
    resolver: &Resolver<'_>,
    objects: &[ManagedObjectMetaData],
) -> Result<AdministrationMetaData> {
    let referrer = format!("{} duty '{}' of function '{}'", phase, spec.name, function);
    let duty_objects = spec
        .objects
        .iter()
        .map(|name| resolver.object(name, &referrer))
        .collect::<Result<Vec<_>>>()?;
    if let Some((type_id, extension_name)) = spec.extension {
        for object in &duty_objects {
            let meta = &objects[object.0];
            if !meta.extensions.contains_key(&type_id) {
                return Err(Error::configuration(format!(
                    "managed object '{}' provides no extension '{}' required by {}",
                    meta.name, extension_name, referrer
                )));
            }
        }
    }
    Ok(AdministrationMetaData {
        name: spec.name,
        phase,
        duty: spec.duty,
        objects: duty_objects,
        extension: spec.extension,
        governances: spec
            .governances
            .iter()
            .map(|name| resolver.governance(name, &referrer))
            .collect::<Result<Vec<_>>>()?,
        flows: resolver.flows(&spec.flows, &referrer)?,
        team: resolver.team(spec.team.as_ref(), &referrer)?,
        asynchronous_flow_timeout: spec.asynchronous_flow_timeout,
    })
}

fn link_function(
    index: FunctionIndex,
    spec: FunctionSpec,
    resolver: &Resolver<'_>,
    objects: &[ManagedObjectMetaData],
) -> Result<ManagedFunctionMetaData> {
    let referrer = format!("function '{}'", spec.name);
    let body_objects = spec
        .objects
        .iter()
        .map(|name| resolver.object(name, &referrer))
        .collect::<Result<Vec<_>>>()?;

    let pre_administration = spec
        .pre
        .into_iter()
        .map(|duty| link_duty(AdministrationPhase::Pre, duty, &spec.name, resolver, objects))
        .collect::<Result<Vec<_>>>()?;
    let post_administration = spec
        .post
        .into_iter()
        .map(|duty| link_duty(AdministrationPhase::Post, duty, &spec.name, resolver, objects))
        .collect::<Result<Vec<_>>>()?;

    let mut seen = HashSet::new();
    let required_objects = body_objects
        .iter()
        .chain(pre_administration.iter().flat_map(|duty| duty.objects.iter()))
        .chain(post_administration.iter().flat_map(|duty| duty.objects.iter()))
        .copied()
        .filter(|object| seen.insert(*object))
        .collect();

    Ok(ManagedFunctionMetaData {
        index,
        body: spec.body,
        objects: body_objects,
        required_objects,
        pre_administration,
        post_administration,
        flows: resolver.flows(&spec.flows, &referrer)?,
        next: spec
            .next
            .as_deref()
            .map(|name| resolver.function(name, &referrer))
            .transpose()?,
        team: resolver.team(spec.team.as_ref(), &referrer)?,
        escalation_procedure: resolver.procedure(&spec.escalations, &referrer)?,
        parameter_type: spec.parameter_type,
        return_type: spec.return_type,
        asynchronous_flow_timeout: spec.asynchronous_flow_timeout,
        name: spec.name,
    })
}

fn check_next_types(functions: &[ManagedFunctionMetaData]) -> Result<()> {
    for function in functions {
        let Some(next) = function.next else { continue };
        let next = &functions[next.0];
        if let (Some(returned), Some(expected)) = (&function.return_type, &next.parameter_type) {
            if returned != expected {
                return Err(Error::configuration(format!(
                    "function '{}' returns '{}' but next function '{}' expects '{}'",
                    function.name, returned, next.name, expected
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct Connection;

    #[derive(Debug)]
    struct Transaction;

    struct NoopGovernance;

    impl Governance for NoopGovernance {
        fn enforce(&self, _extensions: &[Extension]) -> std::result::Result<(), BoxError> {
            Ok(())
        }

        fn disregard(&self, _extensions: &[Extension]) -> std::result::Result<(), BoxError> {
            Ok(())
        }
    }

    fn noop(_ctx: &mut FunctionContext<'_>) -> std::result::Result<Value, BoxError> {
        Ok(Value::Null)
    }

    #[test]
    fn test_link_resolves_names() {
        let mut office = OfficeBuilder::new("office");
        office.managed_object("conn", ManagedObjectScope::Thread, |_| Ok(Connection));
        office
            .function("task", noop)
            .object("conn")
            .next("after")
            .flow("after", FlowStrategy::Parallel)
            .pre_duty("preTask", |_, _| Ok(()))
            .object("conn");
        office.function("after", |ctx| Ok(ctx.parameter().clone()));

        let metadata = office.link().unwrap();
        let task = &metadata.functions[0];
        assert_eq!(task.next, Some(FunctionIndex(1)));
        assert_eq!(task.objects, vec![ManagedObjectIndex(0)]);
        assert_eq!(task.required_objects, vec![ManagedObjectIndex(0)]);
        assert_eq!(task.flows[0].target, FunctionIndex(1));
        assert_eq!(metadata.function_index("after"), Some(FunctionIndex(1)));
    }

    #[test]
    fn test_link_rejects_unknown_governance() {
        let mut office = OfficeBuilder::new("office");
        office.managed_object("conn", ManagedObjectScope::Thread, |_| Ok(Connection));
        office
            .function("task", noop)
            .pre_duty("begin", |_, _| Ok(()))
            .governance("tx");
        let err = office.link().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("unknown governance 'tx'"));
    }

    #[test]
    fn test_link_rejects_unknown_flow_target() {
        let mut office = OfficeBuilder::new("office");
        office.function("task", noop).flow("missing", FlowStrategy::Sequential);
        assert!(office.link().unwrap_err().is_configuration());
    }

    #[test]
    fn test_link_rejects_missing_extension() {
        let mut office = OfficeBuilder::new("office");
        office.managed_object("conn", ManagedObjectScope::Thread, |_| Ok(Connection));
        office
            .function("task", noop)
            .pre_duty("begin", |_, _| Ok(()))
            .object("conn")
            .extension::<Transaction>();
        let err = office.link().unwrap_err();
        assert!(err.to_string().contains("provides no extension"));
    }

    #[test]
    fn test_link_rejects_governance_without_extension() {
        let mut office = OfficeBuilder::new("office");
        office.governance::<Transaction, _>("tx", NoopGovernance);
        office
            .managed_object("conn", ManagedObjectScope::Thread, |_| Ok(Connection))
            .governance("tx");
        assert!(office.link().unwrap_err().is_configuration());

        let mut office = OfficeBuilder::new("office");
        office.governance::<Transaction, _>("tx", NoopGovernance);
        office
            .managed_object("conn", ManagedObjectScope::Thread, |_| Ok(Connection))
            .extension(|_conn: &Arc<Connection>| Ok(Transaction))
            .governance("tx");
        assert!(office.link().is_ok());
    }

    #[test]
    fn test_link_rejects_scope_violation() {
        let mut office = OfficeBuilder::new("office");
        office.managed_object("request", ManagedObjectScope::Function, |_| Ok(json!({})));
        office
            .managed_object("pool", ManagedObjectScope::Process, |_| Ok(Connection))
            .depends_on("request");
        let err = office.link().unwrap_err();
        assert!(err.to_string().contains("cannot depend on"));
    }

    #[test]
    fn test_link_rejects_dependency_cycle() {
        let mut office = OfficeBuilder::new("office");
        office
            .managed_object("a", ManagedObjectScope::Thread, |_| Ok(Connection))
            .depends_on("b");
        office
            .managed_object("b", ManagedObjectScope::Thread, |_| Ok(Connection))
            .depends_on("a");
        let err = office.link().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_link_rejects_next_type_mismatch() {
        let mut office = OfficeBuilder::new("office");
        office.function("first", noop).return_type("order").next("second");
        office.function("second", noop).parameter_type("invoice");
        let err = office.link().unwrap_err();
        assert!(err.to_string().contains("expects 'invoice'"));
    }

    #[test]
    fn test_link_rejects_duplicates_and_unknown_team() {
        let mut office = OfficeBuilder::new("office");
        office.function("task", noop);
        office.function("task", noop);
        assert!(office.link().unwrap_err().to_string().contains("duplicate function"));

        let mut office = OfficeBuilder::new("office");
        office.function("task", noop).team("io");
        assert!(office.link().unwrap_err().to_string().contains("unknown team 'io'"));
    }

    #[test]
    fn test_required_objects_include_duty_objects_once() {
        let mut office = OfficeBuilder::new("office");
        office.managed_object("a", ManagedObjectScope::Function, |_| Ok(Connection));
        office.managed_object("b", ManagedObjectScope::Function, |_| Ok(Connection));
        let mut task = office.function("task", noop);
        task.object("a");
        task.pre_duty("d1", |_, _| Ok(())).object("b").object("a");
        task.post_duty("d2", |_, _| Ok(())).object("b");

        let metadata = office.link().unwrap();
        assert_eq!(
            metadata.functions[0].required_objects,
            vec![ManagedObjectIndex(0), ManagedObjectIndex(1)]
        );
    }
}
