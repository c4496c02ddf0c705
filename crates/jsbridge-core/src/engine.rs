//! Script engine façade.
//!
//! [`ScriptEngine`] is the host-facing surface. Every operation validates its
//! arguments on the calling thread, then runs as one task on the engine's
//! [`ScriptDispatcher`]; the task marshals values through the [`ValueCodec`]
//! and translates runtime failures with [`ErrorTranslator`] before they
//! leave the worker thread.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::backend::{BackendCoordinator, BackendLease};
use crate::codec::ValueCodec;
use crate::config::EngineSettings;
use crate::dispatcher::ScriptDispatcher;
use crate::error::{Error, ErrorTranslator, Result};
use crate::host::HostTypeRef;
use crate::member::{DispatchTarget, MemberDispatcher, ReflectionPolicy};
use crate::path::{PropertyPath, PropertyPathResolver};
use crate::registry::EmbeddingRegistry;
use crate::runtime::{
    BackendInfo, ExternalData, ExternalDispatch, InterruptHandle, MemberRequest, NativeError,
    NativeResult, RuntimeFactory, RuntimeLimits, ScriptRuntime, ScriptValue, ScriptValueType,
};
use crate::value::{FromHostValue, HostValue};

/// Document name used when the caller does not supply one.
pub const DEFAULT_DOCUMENT_NAME: &str = "Script Document";

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").unwrap());

fn validate_identifier(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::usage(format!("{kind} name must not be empty")));
    }
    if !IDENTIFIER.is_match(name) {
        return Err(Error::usage(format!(
            "'{name}' is not a valid script identifier for a {}",
            kind.to_lowercase()
        )));
    }
    Ok(())
}

fn parse_path(path: &str) -> Result<PropertyPath> {
    PropertyPath::parse(path).map_err(|e| Error::usage(e.to_string()))
}

fn document_name(name: &str) -> String {
    if name.trim().is_empty() {
        DEFAULT_DOCUMENT_NAME.to_string()
    } else {
        name.to_string()
    }
}

// ---------------------------------------------------------------------------
// Worker-side state
// ---------------------------------------------------------------------------

/// Routes member accesses on external objects back to host values.
struct HostBridge {
    codec: ValueCodec,
    members: MemberDispatcher,
}

impl ExternalDispatch for HostBridge {
    fn dispatch(
        &self,
        runtime: &mut dyn ScriptRuntime,
        target: ExternalData,
        request: MemberRequest<'_>,
    ) -> NativeResult<ScriptValue> {
        let host = self.codec.registry().lookup(target).ok_or_else(|| {
            NativeError::InvalidUsage("embedded host value has been released".to_string())
        })?;
        let target = DispatchTarget::from_host(host).ok_or_else(|| {
            NativeError::InvalidUsage("external object does not wrap a host value".to_string())
        })?;
        let args = self.codec.to_host_args(runtime, request.args)?;
        let result = self
            .members
            .invoke(&target, request.name, request.kind, args)?;
        self.codec.to_script(runtime, &result)
    }

    fn finalize(&self, data: ExternalData) {
        self.codec.registry().finalize(data);
    }
}

/// Owned by the dispatcher thread.
struct EngineCore {
    runtime: Box<dyn ScriptRuntime>,
    codec: ValueCodec,
}

impl EngineCore {
    /// Run `f` against the runtime and translate its failure. Handles the
    /// host dropped since the previous task are unpinned first.
    fn run<T>(
        &mut self,
        f: impl FnOnce(&mut dyn ScriptRuntime, &ValueCodec) -> NativeResult<T>,
    ) -> Result<T> {
        self.codec.release_dropped(self.runtime.as_mut());
        let result = f(self.runtime.as_mut(), &self.codec)
            .map_err(|err| ErrorTranslator::translate(self.runtime.as_mut(), err));
        self.runtime.task_completed();
        result
    }

    fn collect(&mut self) {
        self.codec.release_dropped(self.runtime.as_mut());
        self.runtime.collect_garbage();
    }
}

/// Global variable `name` as an object, if it holds one.
fn root_object(
    runtime: &mut dyn ScriptRuntime,
    global: ScriptValue,
    name: &str,
) -> NativeResult<Option<ScriptValue>> {
    if !runtime.has_property(global, name)? {
        return Ok(None);
    }
    let value = runtime.get_property(global, name)?;
    Ok((!runtime.value_type(value)?.is_primitive()).then_some(value))
}

// ---------------------------------------------------------------------------
// Precompiled scripts
// ---------------------------------------------------------------------------

/// A parsed script plus the backend cache buffer produced for it.
///
/// Only the engine backend that produced it can run it.
#[derive(Clone, PartialEq, Eq)]
pub struct PrecompiledScript {
    engine_name: String,
    document_name: String,
    code: String,
    cached_data: Vec<u8>,
}

impl PrecompiledScript {
    #[must_use]
    pub fn engine_name(&self) -> &str {
        &self.engine_name
    }

    #[must_use]
    pub fn document_name(&self) -> &str {
        &self.document_name
    }

    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    #[must_use]
    pub fn cached_data(&self) -> &[u8] {
        &self.cached_data
    }
}

impl fmt::Debug for PrecompiledScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrecompiledScript")
            .field("engine_name", &self.engine_name)
            .field("document_name", &self.document_name)
            .field("code_len", &self.code.len())
            .field("cached_len", &self.cached_data.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`ScriptEngine`].
pub struct ScriptEngineBuilder {
    factory: Box<dyn RuntimeFactory>,
    settings: EngineSettings,
    coordinator: Option<Arc<BackendCoordinator>>,
}

impl fmt::Debug for ScriptEngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptEngineBuilder")
            .field("backend", &self.factory.backend())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ScriptEngineBuilder {
    pub fn new(factory: impl RuntimeFactory) -> Self {
        Self {
            factory: Box::new(factory),
            settings: EngineSettings::default(),
            coordinator: None,
        }
    }

    #[must_use]
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Share backend conflict rules with other engines. Without one the
    /// engine gets a private coordinator.
    #[must_use]
    pub fn coordinator(mut self, coordinator: Arc<BackendCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Start the dispatcher thread and create the runtime on it.
    pub fn build(self) -> Result<ScriptEngine> {
        let Self {
            factory,
            settings,
            coordinator,
        } = self;
        settings.validate()?;

        let backend = factory.backend();
        let coordinator = coordinator.unwrap_or_default();
        let lease = coordinator.acquire(&backend.kind)?;

        let registry = Arc::new(EmbeddingRegistry::new());
        let codec = ValueCodec::new(Arc::clone(&registry));
        let policy = ReflectionPolicy::new(settings.allow_reflection);
        let limits = RuntimeLimits {
            max_stack_size: settings.max_stack_size,
        };

        let dispatcher = {
            let _creating = coordinator.creation_guard();
            ScriptDispatcher::start(&settings.thread_name, settings.max_stack_size, move || {
                let mut runtime = factory
                    .create(limits)
                    .map_err(|err| Error::EngineLoad(err.to_string()))?;
                let members = MemberDispatcher::new(policy, runtime.calling_convention());
                runtime.set_external_dispatch(Arc::new(HostBridge {
                    codec: codec.clone(),
                    members,
                }));
                Ok(EngineCore { runtime, codec })
            })?
        };
        let (interrupt, supports_precompilation) = dispatcher.invoke(|core: &mut EngineCore| {
            (
                core.runtime.interrupt_handle(),
                core.runtime.supports_script_precompilation(),
            )
        })?;

        info!(
            engine = %backend.name,
            version = %backend.version,
            thread = %settings.thread_name,
            "script engine created"
        );
        Ok(ScriptEngine {
            dispatcher,
            registry,
            interrupt,
            backend,
            settings,
            supports_precompilation,
            lease: Mutex::new(Some(lease)),
            disposed: AtomicBool::new(false),
        })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// A script engine instance bound to one dispatcher thread.
///
/// All methods may be called from any thread; operations are serialized in
/// submission order. Dropping the engine disposes it.
pub struct ScriptEngine {
    dispatcher: ScriptDispatcher<EngineCore>,
    registry: Arc<EmbeddingRegistry>,
    interrupt: Arc<dyn InterruptHandle>,
    backend: BackendInfo,
    settings: EngineSettings,
    supports_precompilation: bool,
    lease: Mutex<Option<BackendLease>>,
    disposed: AtomicBool,
}

impl fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("backend", &self.backend)
            .field("dispatcher", &self.dispatcher)
            .field("embedded", &self.registry.len())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl ScriptEngine {
    pub fn builder(factory: impl RuntimeFactory) -> ScriptEngineBuilder {
        ScriptEngineBuilder::new(factory)
    }

    /// Engine with default settings and a private coordinator.
    pub fn new(factory: impl RuntimeFactory) -> Result<Self> {
        ScriptEngineBuilder::new(factory).build()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.backend.name
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.backend.version
    }

    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    #[must_use]
    pub fn supports_script_precompilation(&self) -> bool {
        self.supports_precompilation
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Number of host values currently embedded in the runtime.
    #[must_use]
    pub fn embedded_count(&self) -> usize {
        self.registry.len()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }

    fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn ScriptRuntime, &ValueCodec) -> NativeResult<T> + Send + 'static,
    {
        self.ensure_live()?;
        self.dispatcher
            .invoke_fallible(move |core: &mut EngineCore| core.run(f))
    }

    // ── scripts ──────────────────────────────────────────────

    /// Evaluate an expression and return its value.
    pub fn evaluate(&self, expression: &str) -> Result<HostValue> {
        self.evaluate_with_name(expression, DEFAULT_DOCUMENT_NAME)
    }

    pub fn evaluate_with_name(&self, expression: &str, document: &str) -> Result<HostValue> {
        let code = expression.to_string();
        let document = document_name(document);
        self.run(move |rt, codec| {
            let value = rt.run_script(&code, &document)?;
            codec.to_host(rt, value)
        })
    }

    pub fn evaluate_as<T: FromHostValue>(&self, expression: &str) -> Result<T> {
        T::from_host_value(self.evaluate(expression)?)
    }

    pub fn execute(&self, code: &str) -> Result<()> {
        self.execute_with_name(code, DEFAULT_DOCUMENT_NAME)
    }

    pub fn execute_with_name(&self, code: &str, document: &str) -> Result<()> {
        let code = code.to_string();
        let document = document_name(document);
        self.run(move |rt, _| rt.run_script(&code, &document).map(drop))
    }

    /// Parse `code` once so it can be run repeatedly without reparsing.
    pub fn precompile(&self, code: &str) -> Result<PrecompiledScript> {
        self.precompile_with_name(code, DEFAULT_DOCUMENT_NAME)
    }

    pub fn precompile_with_name(&self, code: &str, document: &str) -> Result<PrecompiledScript> {
        if !self.supports_precompilation {
            return Err(Error::usage(format!(
                "The {} engine does not support script precompilation",
                self.backend.name
            )));
        }
        let engine_name = self.backend.name.clone();
        let code = code.to_string();
        let document = document_name(document);
        self.run(move |rt, _| {
            let cached_data = rt.serialize_script(&code, &document)?;
            Ok(PrecompiledScript {
                engine_name,
                document_name: document,
                code,
                cached_data,
            })
        })
    }

    pub fn execute_precompiled(&self, script: &PrecompiledScript) -> Result<()> {
        if script.engine_name != self.backend.name {
            return Err(Error::usage(format!(
                "Script was precompiled by the {} engine and cannot run in the {} engine",
                script.engine_name, self.backend.name
            )));
        }
        let script = script.clone();
        self.run(move |rt, _| {
            rt.run_serialized_script(&script.code, &script.cached_data, &script.document_name)
                .map(drop)
        })
    }

    // ── functions ────────────────────────────────────────────

    /// Call the global function `name` with `this` bound to the global object.
    pub fn call_function(&self, name: &str, args: &[HostValue]) -> Result<HostValue> {
        validate_identifier("Function", name)?;
        let name = name.to_string();
        let args = args.to_vec();
        self.run(move |rt, codec| {
            let global = rt.global_object()?;
            if !rt.has_property(global, &name)? {
                return Err(NativeError::MissingVariable(name));
            }
            let function = rt.get_property(global, &name)?;
            if rt.value_type(function)? != ScriptValueType::Function {
                return Err(NativeError::TypeMismatch(format!(
                    "Variable '{name}' is not a function"
                )));
            }
            let args = codec.to_script_args(rt, &args)?;
            let result = rt.call_function(function, global, &args)?;
            codec.to_host(rt, result)
        })
    }

    pub fn call_function_as<T: FromHostValue>(&self, name: &str, args: &[HostValue]) -> Result<T> {
        T::from_host_value(self.call_function(name, args)?)
    }

    // ── variables ────────────────────────────────────────────

    /// `false` for missing variables and for variables holding `undefined`.
    pub fn has_variable(&self, name: &str) -> Result<bool> {
        validate_identifier("Variable", name)?;
        let name = name.to_string();
        self.run(move |rt, _| {
            let global = rt.global_object()?;
            if !rt.has_property(global, &name)? {
                return Ok(false);
            }
            let value = rt.get_property(global, &name)?;
            Ok(rt.value_type(value)? != ScriptValueType::Undefined)
        })
    }

    /// Value of a global variable. A variable holding `undefined` yields
    /// `Undefined`; one that was never defined is a Runtime error.
    pub fn get_variable_value(&self, name: &str) -> Result<HostValue> {
        validate_identifier("Variable", name)?;
        let name = name.to_string();
        self.run(move |rt, codec| {
            let global = rt.global_object()?;
            if !rt.has_property(global, &name)? {
                return Err(NativeError::MissingVariable(name));
            }
            let value = rt.get_property(global, &name)?;
            codec.to_host(rt, value)
        })
    }

    pub fn get_variable_value_as<T: FromHostValue>(&self, name: &str) -> Result<T> {
        T::from_host_value(self.get_variable_value(name)?)
    }

    pub fn set_variable_value(&self, name: &str, value: impl Into<HostValue>) -> Result<()> {
        validate_identifier("Variable", name)?;
        let name = name.to_string();
        let value = value.into();
        self.run(move |rt, codec| {
            let global = rt.global_object()?;
            let value = codec.to_script(rt, &value)?;
            rt.set_property(global, &name, value)
        })
    }

    /// Delete a global variable. Removing a missing variable is a no-op.
    pub fn remove_variable(&self, name: &str) -> Result<()> {
        validate_identifier("Variable", name)?;
        let name = name.to_string();
        self.run(move |rt, _| {
            let global = rt.global_object()?;
            rt.delete_property(global, &name).map(drop)
        })
    }

    // ── properties ───────────────────────────────────────────

    /// Whether `path` resolves under the global object `root`.
    pub fn has_property(&self, root: &str, path: &str) -> Result<bool> {
        validate_identifier("Variable", root)?;
        let path = parse_path(path)?;
        let root = root.to_string();
        self.run(move |rt, _| {
            let global = rt.global_object()?;
            match root_object(rt, global, &root)? {
                Some(object) => PropertyPathResolver::has(rt, object, &path),
                None => Ok(false),
            }
        })
    }

    pub fn get_property_value(&self, root: &str, path: &str) -> Result<HostValue> {
        validate_identifier("Variable", root)?;
        let path = parse_path(path)?;
        let root = root.to_string();
        self.run(move |rt, codec| {
            let global = rt.global_object()?;
            let object = root_object(rt, global, &root)?
                .ok_or_else(|| NativeError::MissingVariable(root.clone()))?;
            let value = PropertyPathResolver::get(rt, object, &root, &path)?;
            codec.to_host(rt, value)
        })
    }

    pub fn get_property_value_as<T: FromHostValue>(&self, root: &str, path: &str) -> Result<T> {
        T::from_host_value(self.get_property_value(root, path)?)
    }

    /// Assign `path` under `root`, creating the root and any missing
    /// intermediate objects.
    pub fn set_property_value(
        &self,
        root: &str,
        path: &str,
        value: impl Into<HostValue>,
    ) -> Result<()> {
        validate_identifier("Variable", root)?;
        let path = parse_path(path)?;
        let root = root.to_string();
        let value = value.into();
        self.run(move |rt, codec| {
            let global = rt.global_object()?;
            let object = if let Some(object) = root_object(rt, global, &root)? {
                object
            } else {
                let existing = if rt.has_property(global, &root)? {
                    Some(rt.get_property(global, &root)?)
                } else {
                    None
                };
                if let Some(existing) = existing {
                    let kind = rt.value_type(existing)?;
                    if !matches!(kind, ScriptValueType::Undefined | ScriptValueType::Null) {
                        return Err(NativeError::TypeMismatch(format!(
                            "Cannot create property '{path}' on primitive variable '{root}'"
                        )));
                    }
                }
                let created = rt.create_object()?;
                rt.set_property(global, &root, created)?;
                created
            };
            let value = codec.to_script(rt, &value)?;
            PropertyPathResolver::set(rt, object, &root, &path, value)
        })
    }

    /// Delete the final segment of `path`. The root and every intermediate
    /// segment must exist.
    pub fn remove_property(&self, root: &str, path: &str) -> Result<()> {
        validate_identifier("Variable", root)?;
        let path = parse_path(path)?;
        let root = root.to_string();
        self.run(move |rt, _| {
            let global = rt.global_object()?;
            let object = root_object(rt, global, &root)?
                .ok_or_else(|| NativeError::MissingVariable(root.clone()))?;
            PropertyPathResolver::remove(rt, object, &root, &path)
        })
    }

    // ── embedding ────────────────────────────────────────────

    /// Expose a host object or delegate to script as global `name`.
    pub fn embed_host_object(&self, name: &str, value: impl Into<HostValue>) -> Result<()> {
        validate_identifier("Variable", name)?;
        let value = value.into();
        if !matches!(value, HostValue::Object(_) | HostValue::Delegate(_)) {
            return Err(Error::usage(format!(
                "{} values cannot be embedded; use set_variable_value instead",
                value.variant_name()
            )));
        }
        self.embed(name, value)
    }

    /// Expose a host type to script as global `name`, with its static
    /// members and constructor.
    pub fn embed_host_type(&self, name: &str, host_type: &HostTypeRef) -> Result<()> {
        validate_identifier("Variable", name)?;
        self.embed(name, HostValue::Type(HostTypeRef::clone(host_type)))
    }

    fn embed(&self, name: &str, value: HostValue) -> Result<()> {
        let name = name.to_string();
        self.run(move |rt, codec| {
            let global = rt.global_object()?;
            let wrapper = codec.to_script(rt, &value)?;
            rt.set_property(global, &name, wrapper)
        })
    }

    // ── lifetime ─────────────────────────────────────────────

    /// Abort the running script, if any. Delivered directly to the
    /// runtime, not through the task queue.
    pub fn interrupt(&self) -> Result<()> {
        self.ensure_live()?;
        debug!(engine = %self.backend.name, "interrupt requested");
        self.interrupt.interrupt();
        Ok(())
    }

    /// Run a full collection. Unreachable embedded wrappers are finalized
    /// and evicted from the registry.
    pub fn collect_garbage(&self) -> Result<()> {
        self.ensure_live()?;
        self.dispatcher.invoke(EngineCore::collect)
    }

    /// Stop the dispatcher thread and release every embedded host value.
    /// Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.settings.collect_garbage_on_dispose {
            if let Err(err) = self.dispatcher.invoke(EngineCore::collect) {
                warn!(error = %err, "final collection failed");
            }
        }
        self.dispatcher.dispose();
        self.registry.dispose();
        drop(self.lease.lock().take());
        debug!(engine = %self.backend.name, "script engine disposed");
    }
}

impl Drop for ScriptEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::memory::MemoryRuntimeFactory;

    /// Memory runtime reported under another backend identity.
    struct Renamed {
        name: &'static str,
        kind: &'static str,
        available: bool,
    }

    impl RuntimeFactory for Renamed {
        fn backend(&self) -> BackendInfo {
            BackendInfo {
                name: self.name.to_string(),
                version: "0.0.0".to_string(),
                kind: self.kind.to_string(),
            }
        }

        fn create(&self, limits: RuntimeLimits) -> NativeResult<Box<dyn ScriptRuntime>> {
            if !self.available {
                return Err(NativeError::EngineFailure("backend unavailable".to_string()));
            }
            MemoryRuntimeFactory::new().create(limits)
        }
    }

    fn engine() -> ScriptEngine {
        ScriptEngine::new(MemoryRuntimeFactory::new()).unwrap()
    }

    // ── validation ───────────────────────────────────────────

    #[test]
    fn identifiers_are_validated_before_dispatch() {
        let engine = engine();
        for bad in ["", "1abc", "a-b", "a.b", "has space"] {
            let err = engine.set_variable_value(bad, 1).unwrap_err();
            assert_eq!(err.category(), ErrorCategory::Usage, "{bad:?}");
        }
        assert!(engine.set_variable_value("$ok_1", 1).is_ok());
    }

    #[test]
    fn malformed_paths_are_usage_errors() {
        let engine = engine();
        for bad in ["", "a..b", ".a", "a."] {
            let err = engine.get_property_value("shop", bad).unwrap_err();
            assert_eq!(err.category(), ErrorCategory::Usage, "{bad:?}");
        }
    }

    #[test]
    fn primitives_cannot_be_embedded() {
        let engine = engine();
        let err = engine.embed_host_object("n", 5).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Usage);
        assert!(err.to_string().contains("Int"));
    }

    #[test]
    fn invalid_settings_fail_the_build() {
        let settings = EngineSettings {
            max_stack_size: 1024,
            ..EngineSettings::default()
        };
        let err = ScriptEngine::builder(MemoryRuntimeFactory::new())
            .settings(settings)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    // ── variables ────────────────────────────────────────────

    #[test]
    fn variables_round_trip() {
        let engine = engine();
        engine.set_variable_value("greeting", "hello").unwrap();
        assert!(engine.has_variable("greeting").unwrap());
        assert_eq!(
            engine.get_variable_value_as::<String>("greeting").unwrap(),
            "hello"
        );
        engine.remove_variable("greeting").unwrap();
        assert!(!engine.has_variable("greeting").unwrap());
        let err = engine.get_variable_value("greeting").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Runtime);
        engine.remove_variable("greeting").unwrap();
    }

    #[test]
    fn calling_a_non_function_is_a_runtime_error() {
        let engine = engine();
        engine.set_variable_value("x", 3).unwrap();
        let err = engine.call_function("x", &[]).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Runtime);
        let err = engine.call_function("nope", &[]).unwrap_err();
        assert!(err.to_string().contains("'nope' does not exist"));
    }

    #[test]
    fn property_on_primitive_root_is_rejected() {
        let engine = engine();
        engine.set_variable_value("count", 1).unwrap();
        let err = engine.set_property_value("count", "a.b", 2).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Runtime);
        assert!(!engine.has_property("count", "a").unwrap());
    }

    // ── backends ─────────────────────────────────────────────

    #[test]
    fn reports_backend_identity() {
        let engine = engine();
        assert_eq!(engine.name(), "jsbridge memory runtime");
        assert!(!engine.version().is_empty());
        assert!(engine.supports_script_precompilation());
    }

    #[test]
    fn conflicting_backends_are_refused() {
        let coordinator = Arc::new(BackendCoordinator::new().with_conflict("memory", "legacy"));
        let first = ScriptEngine::builder(MemoryRuntimeFactory::new())
            .coordinator(Arc::clone(&coordinator))
            .build()
            .unwrap();
        let legacy = Renamed {
            name: "legacy",
            kind: "legacy",
            available: true,
        };
        let err = ScriptEngine::builder(legacy)
            .coordinator(Arc::clone(&coordinator))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::EngineLoad(_)));

        first.dispose();
        assert_eq!(coordinator.active_count("memory"), 0);
        let legacy = Renamed {
            name: "legacy",
            kind: "legacy",
            available: true,
        };
        assert!(
            ScriptEngine::builder(legacy)
                .coordinator(coordinator)
                .build()
                .is_ok()
        );
    }

    #[test]
    fn factory_failure_is_engine_load() {
        let broken = Renamed {
            name: "broken",
            kind: "broken",
            available: false,
        };
        let coordinator = Arc::new(BackendCoordinator::new());
        let err = ScriptEngine::builder(broken)
            .coordinator(Arc::clone(&coordinator))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::EngineLoad(ref m) if m.contains("backend unavailable")));
        assert_eq!(coordinator.active_count("broken"), 0);
    }

    #[test]
    fn precompiled_scripts_are_bound_to_their_engine() {
        let engine = engine();
        let script = engine.precompile("var ran = true;").unwrap();
        assert_eq!(script.engine_name(), engine.name());
        assert_eq!(script.document_name(), DEFAULT_DOCUMENT_NAME);

        let other = ScriptEngine::new(Renamed {
            name: "other",
            kind: "memory",
            available: true,
        })
        .unwrap();
        let err = other.execute_precompiled(&script).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Usage);
        assert!(!other.has_variable("ran").unwrap());
    }

    // ── lifetime ─────────────────────────────────────────────

    #[test]
    fn disposed_engine_rejects_operations() {
        let engine = engine();
        engine.dispose();
        engine.dispose();
        assert!(engine.is_disposed());
        assert!(matches!(engine.evaluate("1"), Err(Error::Disposed)));
        assert!(matches!(engine.interrupt(), Err(Error::Disposed)));
        assert!(matches!(engine.collect_garbage(), Err(Error::Disposed)));
    }

    #[test]
    fn dispose_with_final_collection() {
        let settings = EngineSettings {
            collect_garbage_on_dispose: true,
            ..EngineSettings::default()
        };
        let engine = ScriptEngine::builder(MemoryRuntimeFactory::new())
            .settings(settings)
            .build()
            .unwrap();
        engine.execute("var o = {};").unwrap();
        engine.dispose();
        assert!(engine.is_disposed());
    }
}
