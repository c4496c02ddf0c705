//! Identity-preserving map from embedded host values to script wrappers.
//!
//! Embedding the same host object twice yields the same script value for as
//! long as the wrapper is alive. The registry holds a strong reference to
//! the host value until the runtime reports the wrapper unreachable
//! ([`EmbeddingRegistry::finalize`]) or the registry is disposed.
//!
//! The two stores (objects and types) are created lazily on first use.
//! Creation for a given key is coalesced: the shard lock is only held to
//! insert an empty slot, and the wrapper itself is created under the slot's
//! own lock, so concurrent requests for different keys never wait on each
//! other.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::trace;

use crate::host::{HostDelegate, HostObjectRef, HostTypeRef, type_address};
use crate::runtime::{
    EmbeddingKind, ExternalData, NativeError, NativeResult, ScriptRuntime, ScriptValue,
};
use crate::shard::ShardedMap;
use crate::value::HostValue;

/// Identity of an embedded host value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EmbeddedObjectKey {
    pub kind: EmbeddingKind,
    pub address: usize,
}

impl EmbeddedObjectKey {
    /// Key for an embeddable host value, `None` for primitives.
    #[must_use]
    pub fn of(value: &HostValue) -> Option<Self> {
        let (kind, address) = match value {
            HostValue::Object(object) => (EmbeddingKind::Object, object.address()),
            HostValue::Delegate(delegate) => (EmbeddingKind::Delegate, delegate.address()),
            HostValue::Type(host_type) => (EmbeddingKind::Type, type_address(host_type)),
            _ => return None,
        };
        Some(Self { kind, address })
    }
}

/// One live embedding.
struct Embedding {
    generation: u64,
    host: Mutex<Option<HostValue>>,
    wrapper: Mutex<Option<ScriptValue>>,
}

impl Embedding {
    fn new(generation: u64, host: HostValue) -> Self {
        Self {
            generation,
            host: Mutex::new(Some(host)),
            wrapper: Mutex::new(None),
        }
    }

    /// Release the host reference and forget the wrapper.
    fn release(&self) {
        self.host.lock().take();
        self.wrapper.lock().take();
    }
}

type Store = ShardedMap<EmbeddedObjectKey, Arc<Embedding>>;

/// Per-engine identity registry.
pub struct EmbeddingRegistry {
    objects: OnceLock<Store>,
    types: OnceLock<Store>,
    next_generation: AtomicU64,
    disposed: AtomicBool,
}

impl Default for EmbeddingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EmbeddingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingRegistry")
            .field("objects", &self.object_count())
            .field("types", &self.type_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl EmbeddingRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: OnceLock::new(),
            types: OnceLock::new(),
            next_generation: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
        }
    }

    fn store(&self, kind: EmbeddingKind) -> &Store {
        match kind {
            EmbeddingKind::Type => self.types.get_or_init(ShardedMap::new),
            EmbeddingKind::Object | EmbeddingKind::Delegate => {
                self.objects.get_or_init(ShardedMap::new)
            }
        }
    }

    fn existing_store(&self, kind: EmbeddingKind) -> Option<&Store> {
        match kind {
            EmbeddingKind::Type => self.types.get(),
            EmbeddingKind::Object | EmbeddingKind::Delegate => self.objects.get(),
        }
    }

    pub fn get_or_create_object_wrapper(
        &self,
        runtime: &mut dyn ScriptRuntime,
        object: &HostObjectRef,
    ) -> NativeResult<ScriptValue> {
        self.get_or_create(runtime, HostValue::Object(object.clone()))
    }

    pub fn get_or_create_delegate_wrapper(
        &self,
        runtime: &mut dyn ScriptRuntime,
        delegate: &HostDelegate,
    ) -> NativeResult<ScriptValue> {
        self.get_or_create(runtime, HostValue::Delegate(delegate.clone()))
    }

    pub fn get_or_create_type_wrapper(
        &self,
        runtime: &mut dyn ScriptRuntime,
        host_type: &HostTypeRef,
    ) -> NativeResult<ScriptValue> {
        self.get_or_create(runtime, HostValue::Type(HostTypeRef::clone(host_type)))
    }

    /// Return the wrapper for `host`, creating it at most once per key.
    pub fn get_or_create(
        &self,
        runtime: &mut dyn ScriptRuntime,
        host: HostValue,
    ) -> NativeResult<ScriptValue> {
        if self.is_disposed() {
            return Err(NativeError::InvalidUsage(
                "embedding registry has been disposed".to_string(),
            ));
        }
        let key = EmbeddedObjectKey::of(&host).ok_or_else(|| {
            NativeError::InvalidUsage(format!(
                "{} values are marshaled directly and cannot be embedded",
                host.variant_name()
            ))
        })?;
        let store = self.store(key.kind);
        let embedding = store.get_or_insert_with(key, || {
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            Arc::new(Embedding::new(generation, host))
        });

        let mut wrapper = embedding.wrapper.lock();
        if let Some(existing) = *wrapper {
            return Ok(existing);
        }
        let data = ExternalData {
            kind: key.kind,
            key: key.address,
            generation: embedding.generation,
        };
        match runtime.create_external_object(data) {
            Ok(created) => {
                *wrapper = Some(created);
                trace!(?key, generation = embedding.generation, "created script wrapper");
                Ok(created)
            }
            Err(err) => {
                drop(wrapper);
                store.remove_if(&key, |current| Arc::ptr_eq(current, &embedding));
                Err(err)
            }
        }
    }

    /// Host value behind external data, if the embedding is still live.
    #[must_use]
    pub fn lookup(&self, data: ExternalData) -> Option<HostValue> {
        let key = EmbeddedObjectKey {
            kind: data.kind,
            address: data.key,
        };
        let embedding = self.existing_store(data.kind)?.get(&key)?;
        if embedding.generation != data.generation {
            return None;
        }
        let host = embedding.host.lock().clone();
        host
    }

    /// Evict the embedding the runtime found unreachable. Finalizations for
    /// an older generation of the same key are ignored.
    pub fn finalize(&self, data: ExternalData) -> bool {
        let key = EmbeddedObjectKey {
            kind: data.kind,
            address: data.key,
        };
        let Some(store) = self.existing_store(data.kind) else {
            return false;
        };
        match store.remove_if(&key, |embedding| embedding.generation == data.generation) {
            Some(embedding) => {
                embedding.release();
                trace!(?key, generation = data.generation, "evicted script wrapper");
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.get().map_or(0, ShardedMap::len)
    }

    #[must_use]
    pub fn type_count(&self) -> usize {
        self.types.get().map_or(0, ShardedMap::len)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.object_count() + self.type_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Release every host reference and clear both stores. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut released = 0usize;
        for store in [self.objects.get(), self.types.get()].into_iter().flatten() {
            for (_, embedding) in store.drain() {
                embedding.release();
                released += 1;
            }
        }
        tracing::debug!(released, "embedding registry disposed");
    }
}
