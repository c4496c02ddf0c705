//! Contract of the script-runtime collaborator.
//!
//! Concrete runtimes (a native JavaScript engine reached through a C-style
//! boundary, or the in-process [`MemoryRuntime`](crate::memory::MemoryRuntime))
//! implement [`ScriptRuntime`]. The marshaling layer only ever talks to a
//! runtime through this trait, and only from the dispatcher thread.
//!
//! The reverse direction, script code touching an embedded host value, goes
//! through [`ExternalDispatch`]: the runtime hands every member access on an
//! external object back to the host and reports unreachable external objects
//! through [`ExternalDispatch::finalize`].

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Reserved member name a runtime uses when a wrapper itself is called or
/// constructed (`sum(1, 2)`, `new Point(1, 2)`).
pub const DEFAULT_MEMBER_NAME: &str = "[default]";

/// Opaque handle into the script runtime.
///
/// The runtime owns the value behind the handle. The marshaling layer never
/// frees it; it may only pin and unpin it with
/// [`ScriptRuntime::add_ref`] / [`ScriptRuntime::release`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptValue(u64);

impl ScriptValue {
    /// Wrap a raw runtime token.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw runtime token.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptValue({:#x})", self.0)
    }
}

/// Type tag of a script value as reported by the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScriptValueType {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Object,
    Function,
    Array,
    Error,
}

impl ScriptValueType {
    /// Whether the runtime marshals this type directly rather than through
    /// its object conversion facility.
    #[must_use]
    pub fn is_primitive(self) -> bool {
        matches!(
            self,
            Self::Undefined | Self::Null | Self::Boolean | Self::Number | Self::String
        )
    }
}

/// Which registry bucket an external object belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EmbeddingKind {
    /// A host object instance.
    Object,
    /// A host type's static surface.
    Type,
    /// A host delegate (callable).
    Delegate,
}

/// Data a runtime stores inside an external object and hands back on
/// dispatch and finalization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExternalData {
    pub kind: EmbeddingKind,
    /// Identity of the host value (allocation address).
    pub key: usize,
    /// Registry generation; stale finalizations are ignored.
    pub generation: u64,
}

/// How a runtime reports an access to an external object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InvokeKind {
    GetProperty,
    SetProperty,
    Call,
    Construct,
}

/// A single member access reported by the runtime.
#[derive(Clone, Copy, Debug)]
pub struct MemberRequest<'a> {
    pub name: &'a str,
    pub kind: InvokeKind,
    pub args: &'a [ScriptValue],
}

/// Argument conventions of a backend's native-function ABI.
///
/// Some runtimes pass the `this` value as a leading argument when they call
/// back into the host. The member dispatcher strips it according to these
/// flags instead of guessing per call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallingConvention {
    /// A called delegate wrapper receives `this` as its first argument.
    pub delegate_receives_this: bool,
    /// A constructed type wrapper receives the new `this` as its first argument.
    pub constructor_receives_this: bool,
}

impl CallingConvention {
    /// IDispatch-style backends: delegate invocations carry `this`, constructors do not.
    pub const DISPATCH: Self = Self {
        delegate_receives_this: true,
        constructor_receives_this: false,
    };

    /// Native-function backends: constructors carry the new `this`, delegate calls do not.
    pub const NATIVE_FUNCTION: Self = Self {
        delegate_receives_this: false,
        constructor_receives_this: true,
    };
}

impl Default for CallingConvention {
    fn default() -> Self {
        Self::NATIVE_FUNCTION
    }
}

/// Source position attached to a native error.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceLocation {
    pub document_name: String,
    pub line: u32,
    pub column: u32,
    pub source_fragment: String,
}

/// Raw error vocabulary of a runtime and of the host callbacks it drives.
///
/// Never crosses into host code: the engine façade always runs it through
/// [`ErrorTranslator`](crate::error::ErrorTranslator) first.
#[derive(Clone, Debug, Error)]
pub enum NativeError {
    #[error("Syntax error: {message}")]
    Syntax {
        message: String,
        location: SourceLocation,
    },

    #[error("Script threw an exception")]
    Exception {
        exception: ScriptValue,
        location: Option<SourceLocation>,
    },

    #[error("Script execution was interrupted")]
    Interrupted,

    #[error("Script engine failure: {0}")]
    EngineFailure(String),

    #[error("Invalid usage of the script runtime: {0}")]
    InvalidUsage(String),

    #[error("Object doesn't support property or method '{name}'")]
    MissingMember { target: String, name: String },

    #[error("Property '{path}' of object '{owner}' does not exist")]
    MissingProperty { owner: String, path: String },

    #[error("Variable '{0}' does not exist")]
    MissingVariable(String),

    #[error("{0}")]
    TypeMismatch(String),

    #[error("{0}")]
    Host(String),
}

/// Result type for runtime-level operations.
pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Host callback surface installed into a runtime.
///
/// `dispatch` is only called on the dispatcher thread. `finalize` may be
/// called from a runtime-internal collector thread.
pub trait ExternalDispatch: Send + Sync {
    /// Resolve a member access on an external object.
    fn dispatch(
        &self,
        runtime: &mut dyn ScriptRuntime,
        target: ExternalData,
        request: MemberRequest<'_>,
    ) -> NativeResult<ScriptValue>;

    /// The runtime found the external object unreachable.
    fn finalize(&self, data: ExternalData);
}

/// Cross-thread handle used to abort a running script.
pub trait InterruptHandle: Send + Sync {
    fn interrupt(&self);
}

/// Identity of a runtime backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendInfo {
    /// Human-readable engine name (`memory`, `chakra-jsrt`, ...).
    pub name: String,
    pub version: String,
    /// Coordination key used by [`BackendCoordinator`](crate::backend::BackendCoordinator).
    pub kind: String,
}

/// Resources granted to a runtime by the engine that creates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeLimits {
    /// Stack size of the dispatcher thread the runtime runs on.
    pub max_stack_size: usize,
}

/// Creates runtimes on the dispatcher thread.
pub trait RuntimeFactory: Send + 'static {
    fn backend(&self) -> BackendInfo;

    /// Called exactly once, on the thread that will own the runtime.
    fn create(&self, limits: RuntimeLimits) -> NativeResult<Box<dyn ScriptRuntime>>;
}

/// The primitives the marshaling layer consumes from a script runtime.
///
/// Implementations are thread-affine: every method is called from the
/// dispatcher thread that created the runtime.
pub trait ScriptRuntime {
    fn calling_convention(&self) -> CallingConvention;

    // ── primitive values ─────────────────────────────────────

    fn undefined(&mut self) -> ScriptValue;
    fn null(&mut self) -> ScriptValue;
    fn boolean(&mut self, value: bool) -> ScriptValue;
    fn number(&mut self, value: f64) -> ScriptValue;
    fn string(&mut self, value: &str) -> ScriptValue;

    fn value_type(&self, value: ScriptValue) -> NativeResult<ScriptValueType>;
    fn to_boolean(&mut self, value: ScriptValue) -> NativeResult<bool>;
    fn to_number(&mut self, value: ScriptValue) -> NativeResult<f64>;
    fn to_string_value(&mut self, value: ScriptValue) -> NativeResult<String>;

    // ── objects ──────────────────────────────────────────────

    fn convert_to_object(&mut self, value: ScriptValue) -> NativeResult<ScriptValue>;
    fn create_object(&mut self) -> NativeResult<ScriptValue>;

    /// Create an object whose member accesses are routed to the installed
    /// [`ExternalDispatch`] and whose collection is reported through
    /// [`ExternalDispatch::finalize`].
    fn create_external_object(&mut self, data: ExternalData) -> NativeResult<ScriptValue>;
    fn external_data(&self, value: ScriptValue) -> Option<ExternalData>;
    fn global_object(&mut self) -> NativeResult<ScriptValue>;

    fn get_property(&mut self, object: ScriptValue, name: &str) -> NativeResult<ScriptValue>;
    fn set_property(
        &mut self,
        object: ScriptValue,
        name: &str,
        value: ScriptValue,
    ) -> NativeResult<()>;
    fn delete_property(&mut self, object: ScriptValue, name: &str) -> NativeResult<bool>;
    fn has_property(&mut self, object: ScriptValue, name: &str) -> NativeResult<bool>;
    fn property_names(&mut self, object: ScriptValue) -> NativeResult<Vec<String>>;

    // ── execution ────────────────────────────────────────────

    fn call_function(
        &mut self,
        function: ScriptValue,
        this: ScriptValue,
        args: &[ScriptValue],
    ) -> NativeResult<ScriptValue>;
    fn construct(
        &mut self,
        constructor: ScriptValue,
        args: &[ScriptValue],
    ) -> NativeResult<ScriptValue>;
    fn run_script(&mut self, code: &str, document_name: &str) -> NativeResult<ScriptValue>;

    fn supports_script_precompilation(&self) -> bool;
    /// Parse `code` and return a backend-specific cache buffer.
    fn serialize_script(&mut self, code: &str, document_name: &str) -> NativeResult<Vec<u8>>;
    fn run_serialized_script(
        &mut self,
        code: &str,
        buffer: &[u8],
        document_name: &str,
    ) -> NativeResult<ScriptValue>;

    // ── lifetime ─────────────────────────────────────────────

    fn set_external_dispatch(&mut self, dispatch: Arc<dyn ExternalDispatch>);
    fn interrupt_handle(&self) -> Arc<dyn InterruptHandle>;
    fn collect_garbage(&mut self);
    fn add_ref(&mut self, value: ScriptValue);
    fn release(&mut self, value: ScriptValue);

    /// Called after every engine task. No script is running and every
    /// handle the host keeps has been pinned, so the runtime may reclaim
    /// the rest.
    fn task_completed(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_value_raw_roundtrip() {
        let value = ScriptValue::from_raw(0xdead_beef);
        assert_eq!(value.raw(), 0xdead_beef);
        assert_eq!(format!("{value:?}"), "ScriptValue(0xdeadbeef)");
    }

    #[test]
    fn primitive_type_tags() {
        assert!(ScriptValueType::Undefined.is_primitive());
        assert!(ScriptValueType::String.is_primitive());
        assert!(!ScriptValueType::Object.is_primitive());
        assert!(!ScriptValueType::Function.is_primitive());
        assert!(!ScriptValueType::Error.is_primitive());
    }

    #[test]
    fn calling_convention_presets_differ() {
        assert!(CallingConvention::DISPATCH.delegate_receives_this);
        assert!(!CallingConvention::DISPATCH.constructor_receives_this);
        assert!(!CallingConvention::NATIVE_FUNCTION.delegate_receives_this);
        assert!(CallingConvention::NATIVE_FUNCTION.constructor_receives_this);
        assert_eq!(CallingConvention::default(), CallingConvention::NATIVE_FUNCTION);
    }

    #[test]
    fn native_error_messages() {
        let err = NativeError::MissingMember {
            target: "Point".to_string(),
            name: "GetType".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Object doesn't support property or method 'GetType'"
        );
        let err = NativeError::MissingProperty {
            owner: "shop".to_string(),
            path: "products.missing".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Property 'products.missing' of object 'shop' does not exist"
        );
    }
}
