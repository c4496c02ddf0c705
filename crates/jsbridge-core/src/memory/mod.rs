//! In-process reference runtime.
//!
//! [`MemoryRuntime`] implements [`ScriptRuntime`] with a small tree-walking
//! interpreter for a JavaScript subset: functions and closures, objects,
//! arrays, `if`/`while`/`for`, `try`/`catch`/`finally`, `throw`, `new`, and
//! the usual operators. It exists so the marshaling layer can be exercised
//! without a native engine, and it follows the same contract a native
//! backend does: opaque handles, external objects dispatched back to the
//! host, finalization on collection, cooperative interruption.
//!
//! Number and string handles stay valid until the end of the engine task
//! that produced them ([`ScriptRuntime::task_completed`]). Object handles
//! stay valid while their object is alive. Either kind outlives both when
//! pinned with [`ScriptRuntime::add_ref`]. A collection runs whenever a task
//! ends with the heap past twice its size after the previous collection.

mod ast;
mod heap;
mod interp;
mod lexer;
mod parser;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use self::heap::{ErrorKind, Heap, NativeFunction, ObjectId, ObjectKind, Value};
use self::interp::{Exec, Frame, truthy};
use self::lexer::source_line;
use self::parser::parse_program;
use crate::dispatcher::DEFAULT_STACK_SIZE;
use crate::runtime::{
    BackendInfo, CallingConvention, EmbeddingKind, ExternalData, ExternalDispatch,
    InterruptHandle, InvokeKind, MemberRequest, NativeError, NativeResult, RuntimeFactory,
    RuntimeLimits, ScriptRuntime, ScriptValue, ScriptValueType, SourceLocation,
};

/// Backend kind reported by [`MemoryRuntimeFactory`].
pub const BACKEND_KIND: &str = "memory";

/// Script call depth at which a `RangeError` is thrown.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;

/// Thread stack reserved for each level of statement or expression nesting.
pub const STACK_PER_NESTING_LEVEL: usize = 32 * 1024;

/// Heap size below which ending a task never triggers a collection.
const MIN_COLLECTION_THRESHOLD: usize = 4096;

/// Nesting levels a thread with `stack_size` bytes of stack can afford.
#[must_use]
pub fn nesting_budget(stack_size: usize) -> usize {
    (stack_size / STACK_PER_NESTING_LEVEL).max(8)
}

const UNDEFINED_TOKEN: u64 = 1;
const NULL_TOKEN: u64 = 2;
const TRUE_TOKEN: u64 = 3;
const FALSE_TOKEN: u64 = 4;
const FIRST_DYNAMIC_TOKEN: u64 = 5;

const PRECOMPILED_MAGIC: &[u8; 5] = b"JSBM\x01";

#[derive(Debug, Default)]
struct InterruptFlag(AtomicBool);

impl InterruptFlag {
    /// Consume a pending request.
    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl InterruptHandle for InterruptFlag {
    fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// FNV-1a over the script text.
fn fingerprint(code: &str) -> [u8; 13] {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in code.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    let mut out = [0_u8; 13];
    out[..5].copy_from_slice(PRECOMPILED_MAGIC);
    out[5..].copy_from_slice(&hash.to_le_bytes());
    out
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Undefined => "undefined",
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::Str(_) => "string",
        Value::Object(_) => "object",
    }
}

pub struct MemoryRuntime {
    heap: Heap,
    global: ObjectId,
    handles: HashMap<u64, Value>,
    object_tokens: HashMap<ObjectId, u64>,
    pins: HashMap<u64, usize>,
    next_token: u64,
    dispatch: Option<Arc<dyn ExternalDispatch>>,
    interrupt: Arc<InterruptFlag>,
    convention: CallingConvention,
    frames: Vec<Frame>,
    max_call_depth: usize,
    nesting: usize,
    max_nesting: usize,
    /// Arrays being joined by `object_to_string`, outermost first.
    joining: Vec<ObjectId>,
    next_collection: usize,
    completion: Value,
}

impl fmt::Debug for MemoryRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRuntime")
            .field("live_objects", &self.heap.live())
            .field("handles", &self.handles.len())
            .field("pinned", &self.pins.len())
            .field("max_nesting", &self.max_nesting)
            .field("convention", &self.convention)
            .field("has_dispatch", &self.dispatch.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRuntime {
    #[must_use]
    pub fn new() -> Self {
        let mut heap = Heap::default();
        let global = heap.alloc(ObjectKind::Ordinary);
        let natives = [
            NativeFunction::Object,
            NativeFunction::String,
            NativeFunction::Number,
            NativeFunction::Boolean,
        ]
        .into_iter()
        .chain(ErrorKind::ALL.map(NativeFunction::Error));
        for native in natives {
            let function = heap.alloc(ObjectKind::Native(native));
            heap.set(global, native.name(), Value::Object(function));
        }
        heap.set(global, "NaN", Value::Number(f64::NAN));
        heap.set(global, "Infinity", Value::Number(f64::INFINITY));

        let handles = HashMap::from([
            (UNDEFINED_TOKEN, Value::Undefined),
            (NULL_TOKEN, Value::Null),
            (TRUE_TOKEN, Value::Bool(true)),
            (FALSE_TOKEN, Value::Bool(false)),
        ]);
        Self {
            heap,
            global,
            handles,
            object_tokens: HashMap::new(),
            pins: HashMap::new(),
            next_token: FIRST_DYNAMIC_TOKEN,
            dispatch: None,
            interrupt: Arc::new(InterruptFlag::default()),
            convention: CallingConvention::default(),
            frames: Vec::new(),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            nesting: 0,
            max_nesting: nesting_budget(DEFAULT_STACK_SIZE),
            joining: Vec::new(),
            next_collection: MIN_COLLECTION_THRESHOLD,
            completion: Value::Undefined,
        }
    }

    #[must_use]
    pub fn with_calling_convention(mut self, convention: CallingConvention) -> Self {
        self.convention = convention;
        self
    }

    #[must_use]
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth.max(1);
        self
    }

    /// Bound parsing and evaluation nesting by the stack of the thread that
    /// will run this runtime.
    #[must_use]
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.max_nesting = nesting_budget(stack_size);
        self
    }

    /// Number of live heap objects.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.heap.live()
    }

    /// Number of issued handles, the four constant ones included.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Number of distinct handles pinned with `add_ref`.
    #[must_use]
    pub fn pinned_count(&self) -> usize {
        self.pins.len()
    }

    // ── handles ──────────────────────────────────────────────

    fn handle_for(&mut self, value: Value) -> ScriptValue {
        let token = match &value {
            Value::Undefined => return ScriptValue::from_raw(UNDEFINED_TOKEN),
            Value::Null => return ScriptValue::from_raw(NULL_TOKEN),
            Value::Bool(true) => return ScriptValue::from_raw(TRUE_TOKEN),
            Value::Bool(false) => return ScriptValue::from_raw(FALSE_TOKEN),
            Value::Object(id) => {
                if let Some(token) = self.object_tokens.get(id) {
                    return ScriptValue::from_raw(*token);
                }
                let token = self.next_token;
                self.object_tokens.insert(*id, token);
                token
            }
            Value::Number(_) | Value::Str(_) => self.next_token,
        };
        self.next_token += 1;
        self.handles.insert(token, value);
        ScriptValue::from_raw(token)
    }

    fn resolve(&self, handle: ScriptValue) -> NativeResult<Value> {
        self.handles.get(&handle.raw()).cloned().ok_or_else(|| {
            NativeError::InvalidUsage(format!("unknown or collected script value {handle:?}"))
        })
    }

    fn resolve_object(&self, handle: ScriptValue) -> NativeResult<ObjectId> {
        match self.resolve(handle)? {
            Value::Object(id) => Ok(id),
            other => Err(NativeError::TypeMismatch(format!(
                "expected an object, got {}",
                type_name(&other)
            ))),
        }
    }

    /// Start of a host-initiated entry; requests made while idle are dropped.
    fn enter(&mut self) {
        if self.frames.is_empty() {
            self.interrupt.clear();
        }
    }

    fn finish(&mut self, result: Exec<Value>) -> NativeResult<ScriptValue> {
        match result {
            Ok(value) => Ok(self.handle_for(value)),
            Err(abort) => Err(self.native_error(abort)),
        }
    }

    fn query_external(&mut self, data: ExternalData, name: &str) -> NativeResult<bool> {
        let Some(dispatch) = self.dispatch.clone() else {
            return Ok(false);
        };
        let request = MemberRequest {
            name,
            kind: InvokeKind::GetProperty,
            args: &[],
        };
        match dispatch.dispatch(self, data, request) {
            Ok(_) => Ok(true),
            Err(NativeError::MissingMember { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn syntax_error(code: &str, document_name: &str, error: lexer::SyntaxError) -> NativeError {
        NativeError::Syntax {
            message: error.message,
            location: SourceLocation {
                document_name: document_name.to_string(),
                line: error.pos.line,
                column: error.pos.column,
                source_fragment: source_line(code, error.pos.line),
            },
        }
    }
}

impl ScriptRuntime for MemoryRuntime {
    fn calling_convention(&self) -> CallingConvention {
        self.convention
    }

    fn undefined(&mut self) -> ScriptValue {
        self.handle_for(Value::Undefined)
    }

    fn null(&mut self) -> ScriptValue {
        self.handle_for(Value::Null)
    }

    fn boolean(&mut self, value: bool) -> ScriptValue {
        self.handle_for(Value::Bool(value))
    }

    fn number(&mut self, value: f64) -> ScriptValue {
        self.handle_for(Value::Number(value))
    }

    fn string(&mut self, value: &str) -> ScriptValue {
        self.handle_for(Value::string(value))
    }

    fn value_type(&self, value: ScriptValue) -> NativeResult<ScriptValueType> {
        Ok(match self.resolve(value)? {
            Value::Undefined => ScriptValueType::Undefined,
            Value::Null => ScriptValueType::Null,
            Value::Bool(_) => ScriptValueType::Boolean,
            Value::Number(_) => ScriptValueType::Number,
            Value::Str(_) => ScriptValueType::String,
            Value::Object(id) => match self.heap.kind(id) {
                Some(ObjectKind::Function { .. } | ObjectKind::Native(_)) => {
                    ScriptValueType::Function
                }
                Some(ObjectKind::External(data)) if data.kind == EmbeddingKind::Object => {
                    ScriptValueType::Object
                }
                Some(ObjectKind::External(_)) => ScriptValueType::Function,
                Some(ObjectKind::Array(_)) => ScriptValueType::Array,
                Some(ObjectKind::Error) => ScriptValueType::Error,
                Some(ObjectKind::Ordinary | ObjectKind::Scope { .. }) => ScriptValueType::Object,
                None => {
                    return Err(NativeError::InvalidUsage(format!(
                        "script value {value:?} refers to a collected object"
                    )));
                }
            },
        })
    }

    fn to_boolean(&mut self, value: ScriptValue) -> NativeResult<bool> {
        Ok(truthy(&self.resolve(value)?))
    }

    fn to_number(&mut self, value: ScriptValue) -> NativeResult<f64> {
        let value = self.resolve(value)?;
        self.to_number_value(&value)
            .map_err(|abort| self.native_error(abort))
    }

    fn to_string_value(&mut self, value: ScriptValue) -> NativeResult<String> {
        let value = self.resolve(value)?;
        self.display(&value).map_err(|abort| self.native_error(abort))
    }

    fn convert_to_object(&mut self, value: ScriptValue) -> NativeResult<ScriptValue> {
        match self.resolve(value)? {
            Value::Object(_) => Ok(value),
            Value::Undefined | Value::Null => Err(NativeError::TypeMismatch(
                "Cannot convert undefined or null to object".to_string(),
            )),
            primitive => {
                let id = self.heap.alloc(ObjectKind::Ordinary);
                self.heap.set(id, "value", primitive);
                Ok(self.handle_for(Value::Object(id)))
            }
        }
    }

    fn create_object(&mut self) -> NativeResult<ScriptValue> {
        let id = self.heap.alloc(ObjectKind::Ordinary);
        Ok(self.handle_for(Value::Object(id)))
    }

    fn create_external_object(&mut self, data: ExternalData) -> NativeResult<ScriptValue> {
        let id = self.heap.alloc(ObjectKind::External(data));
        Ok(self.handle_for(Value::Object(id)))
    }

    fn external_data(&self, value: ScriptValue) -> Option<ExternalData> {
        match self.resolve(value).ok()? {
            Value::Object(id) => match self.heap.kind(id)? {
                ObjectKind::External(data) => Some(*data),
                _ => None,
            },
            _ => None,
        }
    }

    fn global_object(&mut self) -> NativeResult<ScriptValue> {
        Ok(self.handle_for(Value::Object(self.global)))
    }

    fn get_property(&mut self, object: ScriptValue, name: &str) -> NativeResult<ScriptValue> {
        let object = self.resolve(object)?;
        let result = self.get_member(&object, name);
        self.finish(result)
    }

    fn set_property(
        &mut self,
        object: ScriptValue,
        name: &str,
        value: ScriptValue,
    ) -> NativeResult<()> {
        let object = self.resolve(object)?;
        let value = self.resolve(value)?;
        self.set_member(&object, name, value)
            .map_err(|abort| self.native_error(abort))
    }

    fn delete_property(&mut self, object: ScriptValue, name: &str) -> NativeResult<bool> {
        let id = self.resolve_object(object)?;
        let existed = self.heap.has(id, name);
        Ok(self.delete_own(id, name) && existed)
    }

    fn has_property(&mut self, object: ScriptValue, name: &str) -> NativeResult<bool> {
        let id = match self.resolve(object)? {
            Value::Object(id) => id,
            Value::Str(_) => return Ok(name == "length"),
            _ => return Ok(false),
        };
        match self.heap.kind(id) {
            Some(ObjectKind::External(data)) => {
                let data = *data;
                self.query_external(data, name)
            }
            Some(ObjectKind::Array(elements)) => Ok(name == "length"
                || name
                    .parse::<usize>()
                    .is_ok_and(|index| index < elements.len())
                || self.heap.has(id, name)),
            _ => Ok(self.heap.has(id, name)),
        }
    }

    fn property_names(&mut self, object: ScriptValue) -> NativeResult<Vec<String>> {
        let id = self.resolve_object(object)?;
        let mut names: Vec<String> = match self.heap.kind(id) {
            Some(ObjectKind::Array(elements)) => {
                (0..elements.len()).map(|i| i.to_string()).collect()
            }
            Some(ObjectKind::External(_)) => return Ok(Vec::new()),
            _ => Vec::new(),
        };
        names.extend(self.heap.keys(id));
        Ok(names)
    }

    fn call_function(
        &mut self,
        function: ScriptValue,
        this: ScriptValue,
        args: &[ScriptValue],
    ) -> NativeResult<ScriptValue> {
        let function = self.resolve(function)?;
        let this = self.resolve(this)?;
        let args = args
            .iter()
            .map(|arg| self.resolve(*arg))
            .collect::<NativeResult<Vec<_>>>()?;
        self.enter();
        let result = self.call_value(&function, this, args);
        self.finish(result)
    }

    fn construct(
        &mut self,
        constructor: ScriptValue,
        args: &[ScriptValue],
    ) -> NativeResult<ScriptValue> {
        let constructor = self.resolve(constructor)?;
        let args = args
            .iter()
            .map(|arg| self.resolve(*arg))
            .collect::<NativeResult<Vec<_>>>()?;
        self.enter();
        let result = self.construct_value(&constructor, args);
        self.finish(result)
    }

    fn run_script(&mut self, code: &str, document_name: &str) -> NativeResult<ScriptValue> {
        let program = parse_program(code, document_name, self.max_nesting)
            .map_err(|err| Self::syntax_error(code, document_name, err))?;
        self.enter();
        let result = self.run_program(&program, document_name);
        self.finish(result)
    }

    fn supports_script_precompilation(&self) -> bool {
        true
    }

    fn serialize_script(&mut self, code: &str, document_name: &str) -> NativeResult<Vec<u8>> {
        parse_program(code, document_name, self.max_nesting)
            .map_err(|err| Self::syntax_error(code, document_name, err))?;
        Ok(fingerprint(code).to_vec())
    }

    fn run_serialized_script(
        &mut self,
        code: &str,
        buffer: &[u8],
        document_name: &str,
    ) -> NativeResult<ScriptValue> {
        if buffer != fingerprint(code) {
            return Err(NativeError::InvalidUsage(
                "precompiled buffer does not match the script source".to_string(),
            ));
        }
        self.run_script(code, document_name)
    }

    fn set_external_dispatch(&mut self, dispatch: Arc<dyn ExternalDispatch>) {
        self.dispatch = Some(dispatch);
    }

    fn interrupt_handle(&self) -> Arc<dyn InterruptHandle> {
        Arc::clone(&self.interrupt) as Arc<dyn InterruptHandle>
    }

    fn collect_garbage(&mut self) {
        let pinned_roots: Vec<ObjectId> = self
            .pins
            .keys()
            .filter_map(|token| self.handles.get(token))
            .filter_map(Value::as_object)
            .collect();
        let sweep = self
            .heap
            .collect(std::iter::once(self.global).chain(pinned_roots));

        let heap = &self.heap;
        let pins = &self.pins;
        self.handles.retain(|token, value| {
            *token < FIRST_DYNAMIC_TOKEN
                || pins.contains_key(token)
                || value
                    .as_object()
                    .is_some_and(|id| heap.object(id).is_some())
        });
        self.object_tokens
            .retain(|id, _| heap.object(*id).is_some());

        tracing::trace!(
            freed = sweep.freed,
            finalized = sweep.finalized.len(),
            live = self.heap.live(),
            "memory runtime collection"
        );
        self.next_collection = (self.heap.live() * 2).max(MIN_COLLECTION_THRESHOLD);
        if let Some(dispatch) = &self.dispatch {
            for data in sweep.finalized {
                dispatch.finalize(data);
            }
        }
    }

    fn task_completed(&mut self) {
        let pins = &self.pins;
        self.handles.retain(|token, value| {
            *token < FIRST_DYNAMIC_TOKEN || value.as_object().is_some() || pins.contains_key(token)
        });
        if self.heap.live() >= self.next_collection {
            self.collect_garbage();
        }
    }

    fn add_ref(&mut self, value: ScriptValue) {
        if value.raw() >= FIRST_DYNAMIC_TOKEN {
            *self.pins.entry(value.raw()).or_insert(0) += 1;
        }
    }

    fn release(&mut self, value: ScriptValue) {
        if let Some(count) = self.pins.get_mut(&value.raw()) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(&value.raw());
            }
        }
    }
}

/// Creates [`MemoryRuntime`]s for [`ScriptEngine`](crate::ScriptEngine).
#[derive(Debug, Clone, Copy)]
pub struct MemoryRuntimeFactory {
    convention: CallingConvention,
    max_call_depth: usize,
}

impl Default for MemoryRuntimeFactory {
    fn default() -> Self {
        Self {
            convention: CallingConvention::default(),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

impl MemoryRuntimeFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_calling_convention(mut self, convention: CallingConvention) -> Self {
        self.convention = convention;
        self
    }

    #[must_use]
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }
}

impl RuntimeFactory for MemoryRuntimeFactory {
    fn backend(&self) -> BackendInfo {
        BackendInfo {
            name: "jsbridge memory runtime".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            kind: BACKEND_KIND.to_string(),
        }
    }

    fn create(&self, limits: RuntimeLimits) -> NativeResult<Box<dyn ScriptRuntime>> {
        Ok(Box::new(
            MemoryRuntime::new()
                .with_calling_convention(self.convention)
                .with_max_call_depth(self.max_call_depth)
                .with_stack_size(limits.max_stack_size),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn run(rt: &mut MemoryRuntime, code: &str) -> ScriptValue {
        rt.run_script(code, "test.js").unwrap()
    }

    fn run_number(code: &str) -> f64 {
        let mut rt = MemoryRuntime::new();
        let value = run(&mut rt, code);
        rt.to_number(value).unwrap()
    }

    fn run_string(code: &str) -> String {
        let mut rt = MemoryRuntime::new();
        let value = run(&mut rt, code);
        rt.to_string_value(value).unwrap()
    }

    fn thrown_name(rt: &mut MemoryRuntime, err: NativeError) -> String {
        let NativeError::Exception { exception, .. } = err else {
            panic!("expected a script exception, got {err:?}");
        };
        let name = rt.get_property(exception, "name").unwrap();
        rt.to_string_value(name).unwrap()
    }

    /// Host side that answers `answer`, echoes call arity and records
    /// finalization.
    #[derive(Default)]
    struct RecordingDispatch {
        finalized: Mutex<Vec<ExternalData>>,
        calls: Mutex<Vec<(String, InvokeKind, usize)>>,
    }

    impl ExternalDispatch for RecordingDispatch {
        fn dispatch(
            &self,
            runtime: &mut dyn ScriptRuntime,
            _target: ExternalData,
            request: MemberRequest<'_>,
        ) -> NativeResult<ScriptValue> {
            self.calls
                .lock()
                .push((request.name.to_string(), request.kind, request.args.len()));
            match (request.name, request.kind) {
                ("answer", InvokeKind::GetProperty) => Ok(runtime.number(42.0)),
                ("ToString", InvokeKind::Call) => Ok(runtime.string("[external]")),
                (_, InvokeKind::Call | InvokeKind::Construct) => {
                    Ok(runtime.number(request.args.len() as f64))
                }
                (name, _) => Err(NativeError::MissingMember {
                    target: "External".to_string(),
                    name: name.to_string(),
                }),
            }
        }

        fn finalize(&self, data: ExternalData) {
            self.finalized.lock().push(data);
        }
    }

    fn external(kind: EmbeddingKind, key: usize) -> ExternalData {
        ExternalData {
            kind,
            key,
            generation: 1,
        }
    }

    fn with_external(
        convention: CallingConvention,
        kind: EmbeddingKind,
    ) -> (MemoryRuntime, Arc<RecordingDispatch>) {
        let dispatch = Arc::new(RecordingDispatch::default());
        let mut rt = MemoryRuntime::new().with_calling_convention(convention);
        rt.set_external_dispatch(Arc::clone(&dispatch) as Arc<dyn ExternalDispatch>);
        let ext = rt.create_external_object(external(kind, 1)).unwrap();
        let global = rt.global_object().unwrap();
        rt.set_property(global, "ext", ext).unwrap();
        (rt, dispatch)
    }

    // ── evaluation ───────────────────────────────────────────

    #[test]
    fn functions_and_arithmetic() {
        assert_eq!(run_number("function add(a, b) { return a + b; } add(7, 9)"), 16.0);
        assert_eq!(run_number("var x = 10; x -= 3; x * 2 % 5"), 4.0);
        assert_eq!(run_number("(1 + 2) * 3 / 2"), 4.5);
    }

    #[test]
    fn strings_concatenate() {
        assert_eq!(run_string("'a' + 1 + 2"), "a12");
        assert_eq!(run_string("1 + 2 + 'a'"), "3a");
        assert_eq!(run_string("'abc'.length + ''"), "3");
        assert_eq!(run_string("[1, null, 'x'] + ''"), "1,,x");
    }

    #[test]
    fn closures_capture_scope() {
        let code = "
            function counter() {
                var n = 0;
                return function () { n++; return n; };
            }
            var next = counter();
            next(); next();
            next()
        ";
        assert_eq!(run_number(code), 3.0);
    }

    #[test]
    fn loops_with_break_and_continue() {
        let code = "
            var total = 0;
            for (var i = 0; i < 10; i++) {
                if (i % 2 == 0) continue;
                if (i > 7) break;
                total += i;
            }
            var j = 0;
            while (j < 3) { j = j + 1 }
            total + j
        ";
        assert_eq!(run_number(code), 19.0);
    }

    #[test]
    fn objects_and_arrays() {
        let code = "
            var shop = { products: { item: { price: 12 } }, tags: ['a', 'b'] };
            shop.products.item.price += shop.tags.length;
            shop.tags[5] = 'z';
            shop.products['item'].price + shop.tags.length
        ";
        assert_eq!(run_number(code), 20.0);
    }

    #[test]
    fn equality_and_typeof() {
        assert_eq!(
            run_string("(1 == '1') + ',' + (1 === '1') + ',' + (null == undefined)"),
            "true,false,true"
        );
        assert_eq!(
            run_string("typeof missing + typeof {} + typeof function () {}"),
            "undefinedobjectfunction"
        );
    }

    #[test]
    fn constructors_bind_this() {
        let code = "
            function Point(x, y) { this.x = x; this.y = y; }
            var p = new Point(3, 4);
            p.x * p.y
        ";
        assert_eq!(run_number(code), 12.0);
    }

    #[test]
    fn completion_value_is_last_expression() {
        let mut rt = MemoryRuntime::new();
        let value = run(&mut rt, "var y = 5;");
        assert_eq!(rt.value_type(value).unwrap(), ScriptValueType::Undefined);
        let value = run(&mut rt, "y; var z = 1;");
        assert_eq!(rt.to_number(value).unwrap(), 5.0);
    }

    #[test]
    fn try_catch_finally() {
        let code = "
            var log = '';
            try { null.x; } catch (e) { log += e.name; } finally { log += '!'; }
            log
        ";
        assert_eq!(run_string(code), "TypeError!");
    }

    #[test]
    fn array_join_skips_cycles_and_bounds_depth() {
        assert_eq!(run_string("var c = [1]; c[1] = c; c[2] = 3; String(c)"), "1,,3");

        let mut rt = MemoryRuntime::new().with_stack_size(512 * 1024);
        let err = rt
            .run_script(
                "var a = []; for (var i = 0; i < 100; i++) { a = [a]; } String(a)",
                "test.js",
            )
            .unwrap_err();
        assert_eq!(thrown_name(&mut rt, err), "RangeError");
    }

    // ── errors ───────────────────────────────────────────────

    #[test]
    fn syntax_error_carries_location() {
        let mut rt = MemoryRuntime::new();
        let err = rt.run_script("var a = 1;\nvar b = (2 + ;", "bad.js").unwrap_err();
        let NativeError::Syntax { location, .. } = err else {
            panic!("expected syntax error");
        };
        assert_eq!(location.document_name, "bad.js");
        assert_eq!(location.line, 2);
        assert_eq!(location.source_fragment, "var b = (2 + ;");
    }

    #[test]
    fn thrown_error_records_call_stack() {
        let mut rt = MemoryRuntime::new();
        let code = "function fail() {\n  throw new Error('boom');\n}\nfail();";
        let err = rt.run_script(code, "test.js").unwrap_err();
        let NativeError::Exception { exception, location } = err else {
            panic!("expected exception");
        };
        assert_eq!(location.unwrap().line, 2);
        let stack = rt.get_property(exception, "stack").unwrap();
        let stack = rt.to_string_value(stack).unwrap();
        assert!(stack.starts_with("Error: boom\n   at fail (test.js:2:"), "{stack}");
        assert!(stack.ends_with("   at Global code (test.js:4:1)"), "{stack}");
    }

    #[test]
    fn reference_error_for_undeclared() {
        let mut rt = MemoryRuntime::new();
        let err = rt.run_script("nope + 1", "test.js").unwrap_err();
        assert_eq!(thrown_name(&mut rt, err), "ReferenceError");
    }

    #[test]
    fn call_depth_is_bounded() {
        let mut rt = MemoryRuntime::new().with_max_call_depth(16);
        let err = rt
            .run_script("function r(n) { return r(n + 1); } r(0)", "test.js")
            .unwrap_err();
        assert_eq!(thrown_name(&mut rt, err), "RangeError");
    }

    #[test]
    fn nesting_is_bounded_by_stack_size() {
        let mut rt = MemoryRuntime::new().with_stack_size(512 * 1024);
        let deep = format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000));
        let err = rt.run_script(&deep, "deep.js").unwrap_err();
        assert!(matches!(
            err,
            NativeError::Syntax { ref message, .. } if message == "Script is nested too deeply"
        ));

        let mut rt = MemoryRuntime::new()
            .with_stack_size(512 * 1024)
            .with_max_call_depth(100_000);
        let caught = run(
            &mut rt,
            "function r(n) { return n == 0 ? 0 : 1 + r(n - 1); }
             var name; try { r(50); } catch (e) { name = e.name; } name",
        );
        assert_eq!(rt.to_string_value(caught).unwrap(), "RangeError");
        let value = run(&mut rt, "r(2)");
        assert_eq!(rt.to_number(value).unwrap(), 2.0);
    }

    #[test]
    fn invalid_array_lengths_throw_range_error() {
        for code in [
            "var a = []; a.length = 1e300;",
            "var a = []; a.length = -1;",
            "var a = []; a.length = 1.5;",
            "var a = []; a.length = 4294967296;",
            "var a = []; a.length = 1e9;",
            "var a = []; a[1e9] = 1;",
        ] {
            let mut rt = MemoryRuntime::new();
            let err = rt.run_script(code, "test.js").unwrap_err();
            assert_eq!(thrown_name(&mut rt, err), "RangeError", "{code}");
        }
        assert_eq!(run_number("var a = [1, 2, 3]; a.length = 1; a.length"), 1.0);
        assert_eq!(run_number("var a = []; a[4] = 7; a.length"), 5.0);
    }

    #[test]
    fn huge_indices_are_plain_properties() {
        assert_eq!(
            run_number("var a = []; a[1e15] = 1; a[4294967295] = 2; a[1e15] + a[4294967295]"),
            3.0
        );
        assert_eq!(run_number("var a = [1]; a[1e15] = 1; a.length"), 1.0);
    }

    #[test]
    fn interrupt_stops_running_loop() {
        let mut rt = MemoryRuntime::new();
        let handle = rt.interrupt_handle();
        let done = AtomicBool::new(false);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    handle.interrupt();
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
            });
            let err = rt.run_script("while (true) {}", "loop.js").unwrap_err();
            done.store(true, Ordering::SeqCst);
            assert!(matches!(err, NativeError::Interrupted));
        });
        let value = run(&mut rt, "1 + 1");
        assert_eq!(rt.to_number(value).unwrap(), 2.0);
    }

    #[test]
    fn idle_interrupt_is_discarded() {
        let mut rt = MemoryRuntime::new();
        rt.interrupt_handle().interrupt();
        let value = run(&mut rt, "for (var i = 0; i < 3; i++) {} i");
        assert_eq!(rt.to_number(value).unwrap(), 3.0);
    }

    // ── external objects ─────────────────────────────────────

    #[test]
    fn external_members_dispatch_to_host() {
        let (mut rt, dispatch) = with_external(CallingConvention::default(), EmbeddingKind::Object);
        let value = run(&mut rt, "ext.answer + 1");
        assert_eq!(rt.to_number(value).unwrap(), 43.0);
        let value = run(&mut rt, "ext.method(1, 2, 3)");
        assert_eq!(rt.to_number(value).unwrap(), 3.0);
        let value = run(&mut rt, "try { ext.missing } catch (e) { e.name + ': ' + e.message }");
        assert_eq!(
            rt.to_string_value(value).unwrap(),
            "TypeError: Object doesn't support property or method 'missing'"
        );
        let value = run(&mut rt, "'' + ext");
        assert_eq!(rt.to_string_value(value).unwrap(), "[external]");
        assert!(
            dispatch
                .calls
                .lock()
                .iter()
                .any(|(name, kind, _)| name == "method" && *kind == InvokeKind::Call)
        );
    }

    #[test]
    fn delegate_receives_this_per_convention() {
        let (mut rt, _) =
            with_external(CallingConvention::NATIVE_FUNCTION, EmbeddingKind::Delegate);
        let value = run(&mut rt, "ext(1, 2)");
        assert_eq!(rt.to_number(value).unwrap(), 2.0);

        let (mut rt, _) = with_external(CallingConvention::DISPATCH, EmbeddingKind::Delegate);
        let value = run(&mut rt, "ext(1, 2)");
        assert_eq!(rt.to_number(value).unwrap(), 3.0);
    }

    #[test]
    fn constructor_receives_this_per_convention() {
        let (mut rt, _) = with_external(CallingConvention::NATIVE_FUNCTION, EmbeddingKind::Type);
        let value = run(&mut rt, "new ext(1)");
        assert_eq!(rt.to_number(value).unwrap(), 2.0);

        let (mut rt, _) = with_external(CallingConvention::DISPATCH, EmbeddingKind::Type);
        let value = run(&mut rt, "new ext(1)");
        assert_eq!(rt.to_number(value).unwrap(), 1.0);
    }

    #[test]
    fn external_type_tags() {
        let mut rt = MemoryRuntime::new();
        let object = rt.create_external_object(external(EmbeddingKind::Object, 1)).unwrap();
        let delegate = rt.create_external_object(external(EmbeddingKind::Delegate, 2)).unwrap();
        assert_eq!(rt.value_type(object).unwrap(), ScriptValueType::Object);
        assert_eq!(rt.value_type(delegate).unwrap(), ScriptValueType::Function);
        assert_eq!(rt.external_data(delegate).unwrap().key, 2);
        let plain = rt.create_object().unwrap();
        assert!(rt.external_data(plain).is_none());
    }

    #[test]
    fn has_property_queries_external() {
        let (mut rt, _) = with_external(CallingConvention::default(), EmbeddingKind::Object);
        let global = rt.global_object().unwrap();
        let ext = rt.get_property(global, "ext").unwrap();
        assert!(rt.has_property(ext, "answer").unwrap());
        assert!(!rt.has_property(ext, "missing").unwrap());
        assert!(!rt.delete_property(ext, "answer").unwrap());
    }

    // ── collection ───────────────────────────────────────────

    #[test]
    fn unreachable_external_is_finalized() {
        let (mut rt, dispatch) = with_external(CallingConvention::default(), EmbeddingKind::Object);
        rt.collect_garbage();
        assert!(dispatch.finalized.lock().is_empty());

        let global = rt.global_object().unwrap();
        assert!(rt.delete_property(global, "ext").unwrap());
        rt.collect_garbage();
        assert_eq!(*dispatch.finalized.lock(), vec![external(EmbeddingKind::Object, 1)]);
    }

    #[test]
    fn pinned_handles_survive_collection() {
        let mut rt = MemoryRuntime::new();
        let pinned = rt.create_object().unwrap();
        let loose = rt.create_object().unwrap();
        rt.add_ref(pinned);
        rt.collect_garbage();
        assert_eq!(rt.value_type(pinned).unwrap(), ScriptValueType::Object);
        assert!(rt.value_type(loose).is_err());

        rt.release(pinned);
        rt.collect_garbage();
        assert!(rt.value_type(pinned).is_err());
    }

    #[test]
    fn reachable_objects_keep_their_handles() {
        let mut rt = MemoryRuntime::new();
        let value = run(&mut rt, "var keep = { n: 1 }; keep");
        rt.collect_garbage();
        let n = rt.get_property(value, "n").unwrap();
        assert_eq!(rt.to_number(n).unwrap(), 1.0);
    }

    #[test]
    fn finished_tasks_release_primitive_handles() {
        let mut rt = MemoryRuntime::new();
        let baseline = rt.handle_count();
        let kept = rt.number(7.0);
        rt.add_ref(kept);
        let object = run(&mut rt, "var keep = { n: 1 }; keep");
        for i in 0..10_000 {
            run(&mut rt, &format!("'item' + {i}"));
            rt.string("scratch");
            rt.task_completed();
        }
        assert_eq!(rt.handle_count(), baseline + 2);
        assert_eq!(rt.pinned_count(), 1);
        assert_eq!(rt.to_number(kept).unwrap(), 7.0);
        let n = rt.get_property(object, "n").unwrap();
        assert_eq!(rt.to_number(n).unwrap(), 1.0);
    }

    #[test]
    fn garbage_is_collected_past_the_allocation_threshold() {
        let mut rt = MemoryRuntime::new();
        for _ in 0..200 {
            run(&mut rt, "for (var i = 0; i < 100; i++) { var o = { n: i }; }");
            rt.task_completed();
        }
        assert!(rt.live_objects() < 2 * MIN_COLLECTION_THRESHOLD);
        assert!(rt.handle_count() < 2 * MIN_COLLECTION_THRESHOLD);
    }

    // ── precompilation ───────────────────────────────────────

    #[test]
    fn precompiled_buffer_must_match_source() {
        let mut rt = MemoryRuntime::new();
        let buffer = rt.serialize_script("6 * 7", "calc.js").unwrap();
        let value = rt.run_serialized_script("6 * 7", &buffer, "calc.js").unwrap();
        assert_eq!(rt.to_number(value).unwrap(), 42.0);
        assert!(matches!(
            rt.run_serialized_script("6 * 8", &buffer, "calc.js"),
            Err(NativeError::InvalidUsage(_))
        ));
        assert!(matches!(
            rt.serialize_script("6 *", "calc.js"),
            Err(NativeError::Syntax { .. })
        ));
    }

    #[test]
    fn factory_reports_backend() {
        let factory =
            MemoryRuntimeFactory::new().with_calling_convention(CallingConvention::DISPATCH);
        assert_eq!(factory.backend().kind, BACKEND_KIND);
        let rt = factory
            .create(RuntimeLimits {
                max_stack_size: DEFAULT_STACK_SIZE,
            })
            .unwrap();
        assert_eq!(rt.calling_convention(), CallingConvention::DISPATCH);
    }
}
