//! Managed objects: metadata, extension extraction, binding and recycling.
//!
//! A managed object is bound lazily the first time a function or duty needs
//! it, inside the scope (function, thread or process) its metadata names.
//! Binding is idempotent per scope instance and dependencies are bound first.
//! When the scope closes, bound objects are recycled exactly once in reverse
//! bind order.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::escalation::{
    Escalation, EscalationKind, EscalationSource, ExtensionExtractionFailure,
    ObjectResolutionFailure, RecycleFailure,
};
use super::governance;
use super::metadata::{GovernanceIndex, ManagedObjectIndex};
use super::observer::KernelEvent;
use super::office::OfficeRuntime;
use super::recovery::with_recovery;
use super::thread::ThreadState;
use super::types::ManagedObjectScope;
use crate::types::{BoxError, Error};

/// A bound managed object.
pub type ManagedObjectInstance = Arc<dyn Any + Send + Sync>;

pub(crate) type ObjectSourceFn =
    Arc<dyn Fn(&ObjectDependencies<'_>) -> Result<ManagedObjectInstance, BoxError> + Send + Sync>;
pub(crate) type ExtensionExtractor =
    Arc<dyn Fn(&ManagedObjectInstance) -> Result<Extension, BoxError> + Send + Sync>;
pub(crate) type RecycleFn =
    Arc<dyn Fn(&ManagedObjectInstance) -> Result<(), BoxError> + Send + Sync>;

/// Typed view of a managed object handed to duties and governance.
#[derive(Clone)]
pub struct Extension {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl Extension {
    pub fn new<E: Any + Send + Sync>(value: E) -> Self {
        Self {
            type_name: type_name::<E>(),
            value: Arc::new(value),
        }
    }

    /// Expose the object itself when no extension interface is requested.
    pub(crate) fn from_instance(
        instance: &ManagedObjectInstance,
        object_type: &'static str,
    ) -> Self {
        Self {
            type_name: object_type,
            value: Arc::clone(instance),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        self.value.downcast_ref::<E>()
    }

    pub fn is<E: Any>(&self) -> bool {
        self.value.is::<E>()
    }
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Extension").field(&self.type_name).finish()
    }
}

pub(crate) fn downcast_instance<T: Any + Send + Sync>(
    instance: &ManagedObjectInstance,
    object: &str,
) -> Result<Arc<T>, BoxError> {
    Arc::clone(instance).downcast::<T>().map_err(|_| {
        Box::new(Error::validation(format!(
            "managed object '{}' is not a {}",
            object,
            type_name::<T>()
        ))) as BoxError
    })
}

/// Already-bound dependencies handed to a managed object source.
pub struct ObjectDependencies<'a> {
    object: &'a str,
    dependencies: &'a [Arc<ManagedObjectContainer>],
}

impl fmt::Debug for ObjectDependencies<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDependencies")
            .field("object", &self.object)
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}

impl<'a> ObjectDependencies<'a> {
    pub(crate) fn new(object: &'a str, dependencies: &'a [Arc<ManagedObjectContainer>]) -> Self {
        Self {
            object,
            dependencies,
        }
    }

    /// Name of the object being sourced.
    pub fn object(&self) -> &str {
        self.object
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Dependency by declaration position.
    pub fn dependency<T: Any + Send + Sync>(&self, index: usize) -> Result<Arc<T>, BoxError> {
        let container = self.dependencies.get(index).ok_or_else(|| {
            Box::new(Error::not_found(format!(
                "dependency {} of managed object '{}'",
                index, self.object
            ))) as BoxError
        })?;
        downcast_instance(&container.instance, self.object)
    }
}

/// Linked managed object metadata.
pub(crate) struct ManagedObjectMetaData {
    pub(crate) index: ManagedObjectIndex,
    pub(crate) name: String,
    pub(crate) scope: ManagedObjectScope,
    pub(crate) object_type: &'static str,
    pub(crate) source: ObjectSourceFn,
    pub(crate) extensions: HashMap<TypeId, ExtensionExtractor>,
    pub(crate) recycle: Option<RecycleFn>,
    pub(crate) dependencies: Vec<ManagedObjectIndex>,
    pub(crate) governances: Vec<GovernanceIndex>,
}

impl fmt::Debug for ManagedObjectMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObjectMetaData")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("object_type", &self.object_type)
            .field("dependencies", &self.dependencies)
            .field("governances", &self.governances)
            .finish()
    }
}

/// Runtime wrapper of one bound object within one scope instance.
pub(crate) struct ManagedObjectContainer {
    key: u64,
    index: ManagedObjectIndex,
    instance: ManagedObjectInstance,
    recycled: AtomicBool,
}

impl ManagedObjectContainer {
    pub(crate) fn key(&self) -> u64 {
        self.key
    }

    pub(crate) fn index(&self) -> ManagedObjectIndex {
        self.index
    }

    pub(crate) fn instance(&self) -> &ManagedObjectInstance {
        &self.instance
    }

    /// Extract an extension interface, or the raw object when `extension` is `None`.
    pub(crate) fn extension(
        &self,
        meta: &ManagedObjectMetaData,
        extension: Option<(TypeId, &'static str)>,
    ) -> Result<Extension, BoxError> {
        let Some((type_id, extension_name)) = extension else {
            return Ok(Extension::from_instance(&self.instance, meta.object_type));
        };
        let extractor = meta.extensions.get(&type_id).ok_or_else(|| {
            Box::new(ExtensionExtractionFailure {
                object: meta.name.clone(),
                extension: extension_name,
                source: Box::new(Error::not_found("no extractor registered")),
            }) as BoxError
        })?;
        let operation = format!("extension '{}' of '{}'", extension_name, meta.name);
        with_recovery(|| extractor(&self.instance), &operation).map_err(|source| {
            Box::new(ExtensionExtractionFailure {
                object: meta.name.clone(),
                extension: extension_name,
                source,
            }) as BoxError
        })
    }

    /// Recycle the object. Runs at most once; a failure is returned as a
    /// cleanup escalation.
    pub(crate) fn recycle(
        &self,
        meta: &ManagedObjectMetaData,
        office: &OfficeRuntime,
    ) -> Option<Escalation> {
        if self.recycled.swap(true, Ordering::SeqCst) {
            return None;
        }
        let failure = meta.recycle.as_ref().and_then(|recycle| {
            let operation = format!("recycle '{}'", meta.name);
            with_recovery(|| recycle(&self.instance), &operation).err()
        });
        office.emit(KernelEvent::ObjectRecycled {
            object: meta.name.clone(),
            scope: meta.scope,
        });
        failure.map(|source| {
            tracing::warn!(
                "object_recycle_failed: object={}, error={}",
                meta.name,
                source
            );
            Escalation::new(
                Box::new(RecycleFailure {
                    object: meta.name.clone(),
                    source,
                }),
                EscalationKind::CleanupFailure,
                EscalationSource::ManagedObject {
                    object: meta.name.clone(),
                },
            )
        })
    }
}

impl fmt::Debug for ManagedObjectContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObjectContainer")
            .field("key", &self.key)
            .field("index", &self.index)
            .field("recycled", &self.recycled.load(Ordering::SeqCst))
            .finish()
    }
}

#[derive(Default)]
struct ScopeSlots {
    bound: HashMap<ManagedObjectIndex, Arc<ManagedObjectContainer>>,
    order: Vec<ManagedObjectIndex>,
    unloaded: bool,
}

/// Objects bound within one scope instance.
pub(crate) struct ObjectScopeState {
    scope: ManagedObjectScope,
    slots: Mutex<ScopeSlots>,
}

impl ObjectScopeState {
    pub(crate) fn new(scope: ManagedObjectScope) -> Self {
        Self {
            scope,
            slots: Mutex::new(ScopeSlots::default()),
        }
    }

    pub(crate) fn get(&self, index: ManagedObjectIndex) -> Option<Arc<ManagedObjectContainer>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bound
            .get(&index)
            .cloned()
    }

    /// Bound objects in bind order.
    pub(crate) fn bound(&self) -> Vec<Arc<ManagedObjectContainer>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .order
            .iter()
            .filter_map(|index| slots.bound.get(index).cloned())
            .collect()
    }

    /// Return the bound object, creating it under the scope lock if absent.
    /// The flag is `true` when this call bound it.
    fn bind_or_get<F>(
        &self,
        index: ManagedObjectIndex,
        create: F,
    ) -> Result<(Arc<ManagedObjectContainer>, bool), BoxError>
    where
        F: FnOnce() -> Result<Arc<ManagedObjectContainer>, BoxError>,
    {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slots.bound.get(&index) {
            return Ok((Arc::clone(existing), false));
        }
        if slots.unloaded {
            return Err(Box::new(Error::cancelled(format!(
                "{} scope already unloaded",
                self.scope
            ))));
        }
        let container = create()?;
        slots.bound.insert(index, Arc::clone(&container));
        slots.order.push(index);
        Ok((container, true))
    }

    /// Recycle every bound object in reverse bind order and close the scope.
    pub(crate) fn unload(&self, office: &OfficeRuntime) -> Vec<Escalation> {
        let containers: Vec<Arc<ManagedObjectContainer>> = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.unloaded = true;
            let order = std::mem::take(&mut slots.order);
            let mut bound = std::mem::take(&mut slots.bound);
            order
                .iter()
                .rev()
                .filter_map(|index| bound.remove(index))
                .collect()
        };
        containers
            .iter()
            .filter_map(|container| container.recycle(office.object(container.index), office))
            .collect()
    }
}

/// Bind a managed object (and, first, its dependencies) into its scope.
///
/// Newly bound objects are registered with any active governance of the
/// thread they are mapped to.
pub(crate) fn bind_object(
    office: &OfficeRuntime,
    function_scope: &ObjectScopeState,
    thread: &ThreadState,
    index: ManagedObjectIndex,
) -> Result<Arc<ManagedObjectContainer>, BoxError> {
    let meta = office.object(index);
    let scope = match meta.scope {
        ManagedObjectScope::Function => function_scope,
        ManagedObjectScope::Thread => thread.objects(),
        ManagedObjectScope::Process => thread.process().objects(),
    };
    if let Some(existing) = scope.get(index) {
        return Ok(existing);
    }

    let dependencies = meta
        .dependencies
        .iter()
        .map(|dependency| bind_object(office, function_scope, thread, *dependency))
        .collect::<Result<Vec<_>, _>>()?;

    let (container, newly_bound) = scope.bind_or_get(index, || {
        let operation = format!("source '{}'", meta.name);
        let instance = with_recovery(
            || (meta.source)(&ObjectDependencies::new(&meta.name, &dependencies)),
            &operation,
        )
        .map_err(|source| {
            Box::new(ObjectResolutionFailure {
                object: meta.name.clone(),
                source,
            }) as BoxError
        })?;
        Ok(Arc::new(ManagedObjectContainer {
            key: office.next_object_key(),
            index,
            instance,
            recycled: AtomicBool::new(false),
        }))
    })?;

    if newly_bound {
        tracing::debug!(
            "object_bound: object={}, scope={}, process={}",
            meta.name,
            meta.scope,
            thread.process().id()
        );
        office.emit(KernelEvent::ObjectBound {
            object: meta.name.clone(),
            scope: meta.scope,
        });
        governance::register_bound_object(office, thread, &container)?;
    }
    Ok(container)
}
