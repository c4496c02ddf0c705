//! Tree-walking evaluator for [`MemoryRuntime`].

use std::fmt::Write as _;
use std::rc::Rc;

use super::MemoryRuntime;
use super::ast::{
    BinaryOp, Expr, ExprKind, FunctionDef, LogicalOp, Name, Program, Stmt, StmtKind,
    UnaryOp,
};
use super::heap::{ErrorKind, NativeFunction, ObjectId, ObjectKind, Value};
use super::lexer::{Pos, source_line};
use crate::runtime::{
    DEFAULT_MEMBER_NAME, ExternalData, InvokeKind, MemberRequest, NativeError, ScriptValue,
    SourceLocation,
};

/// Abrupt termination of evaluation.
#[derive(Debug)]
pub(super) enum Abort {
    Throw {
        value: Value,
        location: Option<SourceLocation>,
    },
    Interrupted,
    Fatal(String),
}

pub(super) type Exec<T> = Result<T, Abort>;

enum Completion {
    Normal,
    Return(Value),
    Break,
    Continue,
}

struct Context {
    scope: ObjectId,
    this: Value,
}

/// One activation on the script call stack.
#[derive(Debug)]
pub(super) struct Frame {
    function: Rc<str>,
    document: Rc<str>,
    source: Rc<str>,
    pos: Pos,
}

enum Reference {
    Variable(Name),
    Property(Value, String),
}

pub(super) fn truthy(value: &Value) -> bool {
    match value {
        Value::Undefined | Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => *n != 0.0 && !n.is_nan(),
        Value::Str(s) => !s.is_empty(),
        Value::Object(_) => true,
    }
}

pub(super) fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        format!("{n}")
    }
}

fn string_to_number(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return u64::from_str_radix(hex, 16).map_or(f64::NAN, |v| v as f64);
    }
    if trimmed
        .chars()
        .any(|c| c.is_alphabetic() && c != 'e' && c != 'E')
    {
        return f64::NAN;
    }
    trimmed.parse().unwrap_or(f64::NAN)
}

/// Elements an array may hold densely; larger lengths and indices throw
/// `RangeError`.
pub(super) const MAX_DENSE_LENGTH: usize = 1 << 24;

/// Canonical array index (`"3"`, not `"03"` or `"+3"`) below `2^32 - 1`.
/// Anything else is an ordinary property name.
fn array_index(name: &str) -> Option<usize> {
    let index: u32 = name.parse().ok()?;
    (index != u32::MAX && index.to_string() == name).then_some(index as usize)
}

fn strict_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Object(x), Value::Object(y)) => x == y,
        _ => false,
    }
}

impl MemoryRuntime {
    // ── programs and functions ───────────────────────────────

    pub(super) fn run_program(&mut self, program: &Program, document: &str) -> Exec<Value> {
        let global = self.global;
        self.completion = Value::Undefined;
        self.frames.push(Frame {
            function: Rc::from("Global code"),
            document: Rc::from(document),
            source: Rc::clone(&program.source),
            pos: Pos::START,
        });
        self.hoist(&program.body, global);
        let context = Context {
            scope: global,
            this: Value::Object(global),
        };
        let result = self.exec_block(&program.body, &context);
        self.frames.pop();
        result?;
        Ok(std::mem::replace(&mut self.completion, Value::Undefined))
    }

    fn hoist(&mut self, body: &[Stmt], scope: ObjectId) {
        for stmt in body {
            self.hoist_stmt(stmt, scope);
        }
    }

    fn hoist_stmt(&mut self, stmt: &Stmt, scope: ObjectId) {
        match &stmt.kind {
            StmtKind::Var(declarations) => {
                for (name, _) in declarations {
                    if !self.heap.has(scope, name) {
                        self.heap.set(scope, name, Value::Undefined);
                    }
                }
            }
            StmtKind::Function(def) => {
                if let Some(name) = &def.name {
                    let function = self.make_function(def, scope);
                    self.heap.set(scope, name, function);
                }
            }
            StmtKind::If {
                then, otherwise, ..
            } => {
                self.hoist_stmt(then, scope);
                if let Some(otherwise) = otherwise {
                    self.hoist_stmt(otherwise, scope);
                }
            }
            StmtKind::While { body, .. } => self.hoist_stmt(body, scope),
            StmtKind::For { init, body, .. } => {
                if let Some(init) = init {
                    self.hoist_stmt(init, scope);
                }
                self.hoist_stmt(body, scope);
            }
            StmtKind::Try {
                block,
                handler,
                finalizer,
            } => {
                self.hoist(block, scope);
                if let Some((_, handler)) = handler {
                    self.hoist(handler, scope);
                }
                if let Some(finalizer) = finalizer {
                    self.hoist(finalizer, scope);
                }
            }
            StmtKind::Block(body) => self.hoist(body, scope),
            _ => {}
        }
    }

    fn make_function(&mut self, def: &Rc<FunctionDef>, scope: ObjectId) -> Value {
        Value::Object(self.heap.alloc(ObjectKind::Function {
            def: Rc::clone(def),
            scope,
        }))
    }

    fn call_script(
        &mut self,
        def: Rc<FunctionDef>,
        scope: ObjectId,
        this: Value,
        args: Vec<Value>,
    ) -> Exec<Value> {
        if self.frames.len() >= self.max_call_depth {
            return Err(self.throw(ErrorKind::RangeError, "Out of stack space"));
        }
        self.check_interrupt()?;

        let activation = self.heap.alloc(ObjectKind::Scope { parent: scope });
        let mut args = args.into_iter();
        for param in &def.params {
            let value = args.next().unwrap_or(Value::Undefined);
            self.heap.set(activation, param, value);
        }
        self.hoist(&def.body, activation);

        let this = match this {
            Value::Undefined | Value::Null => Value::Object(self.global),
            other => other,
        };
        self.frames.push(Frame {
            function: Rc::from(def.display_name()),
            document: Rc::clone(&def.document),
            source: Rc::clone(&def.source),
            pos: def.pos,
        });
        let saved = std::mem::replace(&mut self.completion, Value::Undefined);
        let context = Context {
            scope: activation,
            this,
        };
        let result = self.exec_block(&def.body, &context);
        self.completion = saved;
        self.frames.pop();

        match result? {
            Completion::Return(value) => Ok(value),
            _ => Ok(Value::Undefined),
        }
    }

    pub(super) fn call_value(
        &mut self,
        function: &Value,
        this: Value,
        mut args: Vec<Value>,
    ) -> Exec<Value> {
        let Some(id) = function.as_object() else {
            return Err(self.throw(ErrorKind::TypeError, "Function expected"));
        };
        match self.heap.kind(id) {
            Some(ObjectKind::Function { def, scope }) => {
                let (def, scope) = (Rc::clone(def), *scope);
                self.call_script(def, scope, this, args)
            }
            Some(ObjectKind::Native(native)) => {
                let native = *native;
                self.call_native(native, args)
            }
            Some(ObjectKind::External(data)) => {
                let data = *data;
                if self.convention.delegate_receives_this {
                    args.insert(0, this);
                }
                self.dispatch(data, DEFAULT_MEMBER_NAME, InvokeKind::Call, &args)
            }
            _ => Err(self.throw(ErrorKind::TypeError, "Function expected")),
        }
    }

    pub(super) fn construct_value(
        &mut self,
        function: &Value,
        mut args: Vec<Value>,
    ) -> Exec<Value> {
        let Some(id) = function.as_object() else {
            return Err(self.throw(ErrorKind::TypeError, "Object doesn't support this action"));
        };
        match self.heap.kind(id) {
            Some(ObjectKind::Function { def, scope }) => {
                let (def, scope) = (Rc::clone(def), *scope);
                let instance = Value::Object(self.heap.alloc(ObjectKind::Ordinary));
                let result = self.call_script(def, scope, instance.clone(), args)?;
                Ok(if matches!(result, Value::Object(_)) {
                    result
                } else {
                    instance
                })
            }
            Some(ObjectKind::Native(native)) => {
                let native = *native;
                self.call_native(native, args)
            }
            Some(ObjectKind::External(data)) => {
                let data = *data;
                if self.convention.constructor_receives_this {
                    let placeholder = self.heap.alloc(ObjectKind::Ordinary);
                    args.insert(0, Value::Object(placeholder));
                }
                self.dispatch(data, DEFAULT_MEMBER_NAME, InvokeKind::Construct, &args)
            }
            _ => Err(self.throw(ErrorKind::TypeError, "Object doesn't support this action")),
        }
    }

    fn call_native(&mut self, native: NativeFunction, args: Vec<Value>) -> Exec<Value> {
        let supplied = !args.is_empty();
        let first = args.into_iter().next().unwrap_or(Value::Undefined);
        Ok(match native {
            NativeFunction::Object => match first {
                Value::Object(_) => first,
                _ => Value::Object(self.heap.alloc(ObjectKind::Ordinary)),
            },
            NativeFunction::String if !supplied => Value::string(""),
            NativeFunction::String => Value::string(&self.display(&first)?),
            NativeFunction::Number if !supplied => Value::Number(0.0),
            NativeFunction::Number => Value::Number(self.to_number_value(&first)?),
            NativeFunction::Boolean => Value::Bool(truthy(&first)),
            NativeFunction::Error(kind) => {
                let message = match first {
                    Value::Undefined => String::new(),
                    other => self.display(&other)?,
                };
                self.create_error(kind, &message)
            }
        })
    }

    // ── errors and interruption ──────────────────────────────

    pub(super) fn create_error(&mut self, kind: ErrorKind, message: &str) -> Value {
        let id = self.heap.alloc(ObjectKind::Error);
        let name = kind.name();
        let mut stack = if message.is_empty() {
            name.to_string()
        } else {
            format!("{name}: {message}")
        };
        for frame in self.frames.iter().rev() {
            let _ = write!(
                stack,
                "\n   at {} ({}:{}:{})",
                frame.function, frame.document, frame.pos.line, frame.pos.column
            );
        }
        self.heap.set(id, "name", Value::string(name));
        self.heap.set(id, "message", Value::string(message));
        self.heap.set(id, "stack", Value::string(&stack));
        Value::Object(id)
    }

    pub(super) fn throw(&mut self, kind: ErrorKind, message: impl AsRef<str>) -> Abort {
        let value = self.create_error(kind, message.as_ref());
        Abort::Throw {
            value,
            location: self.location(),
        }
    }

    fn location(&self) -> Option<SourceLocation> {
        self.frames.last().map(|frame| SourceLocation {
            document_name: frame.document.to_string(),
            line: frame.pos.line,
            column: frame.pos.column,
            source_fragment: source_line(&frame.source, frame.pos.line),
        })
    }

    fn mark(&mut self, pos: Pos) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pos = pos;
        }
    }

    fn check_interrupt(&self) -> Exec<()> {
        if self.interrupt.take() {
            Err(Abort::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Map a host-side failure into script control flow.
    fn abort_from_native(&mut self, error: NativeError) -> Abort {
        let message = error.to_string();
        match error {
            NativeError::Exception {
                exception,
                location,
            } => match self.resolve(exception) {
                Ok(value) => Abort::Throw {
                    value,
                    location: location.or_else(|| self.location()),
                },
                Err(err) => Abort::Fatal(err.to_string()),
            },
            NativeError::Interrupted => Abort::Interrupted,
            NativeError::EngineFailure(message) => Abort::Fatal(message),
            NativeError::Syntax { message, .. } => self.throw(ErrorKind::SyntaxError, message),
            NativeError::MissingMember { .. } | NativeError::TypeMismatch(_) => {
                self.throw(ErrorKind::TypeError, message)
            }
            NativeError::MissingProperty { .. } | NativeError::MissingVariable(_) => {
                self.throw(ErrorKind::ReferenceError, message)
            }
            NativeError::InvalidUsage(_) | NativeError::Host(_) => {
                self.throw(ErrorKind::Error, message)
            }
        }
    }

    /// Map an abort leaving the runtime into the native error contract.
    pub(super) fn native_error(&mut self, abort: Abort) -> NativeError {
        match abort {
            Abort::Throw { value, location } => NativeError::Exception {
                exception: self.handle_for(value),
                location,
            },
            Abort::Interrupted => NativeError::Interrupted,
            Abort::Fatal(message) => NativeError::EngineFailure(message),
        }
    }

    // ── external objects ─────────────────────────────────────

    pub(super) fn dispatch(
        &mut self,
        data: ExternalData,
        name: &str,
        kind: InvokeKind,
        args: &[Value],
    ) -> Exec<Value> {
        let Some(dispatch) = self.dispatch.clone() else {
            return Err(self.throw(
                ErrorKind::TypeError,
                "Host object is not connected to a dispatcher",
            ));
        };
        let handles: Vec<ScriptValue> = args.iter().map(|a| self.handle_for(a.clone())).collect();
        let request = MemberRequest {
            name,
            kind,
            args: &handles,
        };
        match dispatch.dispatch(self, data, request) {
            Ok(result) => self
                .resolve(result)
                .map_err(|err| Abort::Fatal(err.to_string())),
            Err(err) => Err(self.abort_from_native(err)),
        }
    }

    // ── property access ──────────────────────────────────────

    pub(super) fn get_member(&mut self, object: &Value, name: &str) -> Exec<Value> {
        let id = match object {
            Value::Undefined | Value::Null => {
                return Err(self.throw(
                    ErrorKind::TypeError,
                    format!("Unable to get property '{name}' of undefined or null reference"),
                ));
            }
            Value::Str(s) if name == "length" => {
                return Ok(Value::Number(s.chars().count() as f64));
            }
            Value::Object(id) => *id,
            _ => return Ok(Value::Undefined),
        };
        match self.heap.kind(id) {
            Some(ObjectKind::External(data)) => {
                let data = *data;
                self.dispatch(data, name, InvokeKind::GetProperty, &[])
            }
            Some(ObjectKind::Array(elements)) => {
                if name == "length" {
                    return Ok(Value::Number(elements.len() as f64));
                }
                if let Some(index) = array_index(name) {
                    return Ok(elements.get(index).cloned().unwrap_or(Value::Undefined));
                }
                Ok(self.heap.get(id, name).unwrap_or(Value::Undefined))
            }
            _ => Ok(self.heap.get(id, name).unwrap_or(Value::Undefined)),
        }
    }

    pub(super) fn set_member(&mut self, object: &Value, name: &str, value: Value) -> Exec<()> {
        let id = match object {
            Value::Undefined | Value::Null => {
                return Err(self.throw(
                    ErrorKind::TypeError,
                    format!("Unable to set property '{name}' of undefined or null reference"),
                ));
            }
            Value::Object(id) => *id,
            _ => return Ok(()),
        };
        if let Some(ObjectKind::External(data)) = self.heap.kind(id) {
            let data = *data;
            self.dispatch(data, name, InvokeKind::SetProperty, &[value])?;
            return Ok(());
        }
        if matches!(self.heap.kind(id), Some(ObjectKind::Array(_))) {
            if name == "length" {
                let length = self.to_number_value(&value)?;
                let length = self.dense_length(length)?;
                if let Some(elements) = self.array_mut(id) {
                    elements.resize(length, Value::Undefined);
                }
                return Ok(());
            }
            if let Some(index) = array_index(name) {
                self.dense_length(index as f64 + 1.0)?;
                if let Some(elements) = self.array_mut(id) {
                    if index >= elements.len() {
                        elements.resize(index + 1, Value::Undefined);
                    }
                    elements[index] = value;
                }
                return Ok(());
            }
        }
        self.heap.set(id, name, value);
        Ok(())
    }

    fn dense_length(&mut self, length: f64) -> Exec<usize> {
        if !(0.0..4_294_967_296.0).contains(&length) || length.fract() != 0.0 {
            return Err(self.throw(ErrorKind::RangeError, "Invalid array length"));
        }
        if length > MAX_DENSE_LENGTH as f64 {
            return Err(self.throw(
                ErrorKind::RangeError,
                format!("Array length {length} is above the {MAX_DENSE_LENGTH} element limit"),
            ));
        }
        Ok(length as usize)
    }

    fn array_mut(&mut self, id: ObjectId) -> Option<&mut Vec<Value>> {
        match self.heap.object_mut(id).map(|o| &mut o.kind) {
            Some(ObjectKind::Array(elements)) => Some(elements),
            _ => None,
        }
    }

    fn property_key(&mut self, key: &Value) -> Exec<String> {
        self.display(key)
    }

    fn lookup(&self, scope: ObjectId, name: &str) -> Option<Value> {
        self.defining_scope(scope, name)
            .and_then(|id| self.heap.get(id, name))
    }

    fn defining_scope(&self, scope: ObjectId, name: &str) -> Option<ObjectId> {
        let mut current = Some(scope);
        while let Some(id) = current {
            if self.heap.has(id, name) {
                return Some(id);
            }
            current = match self.heap.kind(id) {
                Some(ObjectKind::Scope { parent }) => Some(*parent),
                _ => None,
            };
        }
        None
    }

    fn assign_variable(&mut self, scope: ObjectId, name: &str, value: Value) {
        let target = self.defining_scope(scope, name).unwrap_or(self.global);
        self.heap.set(target, name, value);
    }

    fn reference(&mut self, target: &Expr, context: &Context) -> Exec<Reference> {
        match &target.kind {
            ExprKind::Ident(name) => Ok(Reference::Variable(Rc::clone(name))),
            ExprKind::Member(object, name) => {
                let object = self.eval(object, context)?;
                Ok(Reference::Property(object, name.to_string()))
            }
            ExprKind::Index(object, key) => {
                let object = self.eval(object, context)?;
                let key = self.eval(key, context)?;
                let key = self.property_key(&key)?;
                Ok(Reference::Property(object, key))
            }
            _ => Err(self.throw(
                ErrorKind::ReferenceError,
                "Invalid left-hand side in assignment",
            )),
        }
    }

    fn read_reference(&mut self, reference: &Reference, context: &Context) -> Exec<Value> {
        match reference {
            Reference::Variable(name) => match self.lookup(context.scope, name) {
                Some(value) => Ok(value),
                None => Err(self.throw(
                    ErrorKind::ReferenceError,
                    format!("'{name}' is not defined"),
                )),
            },
            Reference::Property(object, name) => self.get_member(object, name),
        }
    }

    fn write_reference(
        &mut self,
        reference: &Reference,
        value: Value,
        context: &Context,
    ) -> Exec<()> {
        match reference {
            Reference::Variable(name) => {
                self.assign_variable(context.scope, name, value);
                Ok(())
            }
            Reference::Property(object, name) => self.set_member(object, name, value),
        }
    }

    // ── conversions ──────────────────────────────────────────

    pub(super) fn display(&mut self, value: &Value) -> Exec<String> {
        Ok(match value {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => number_to_string(*n),
            Value::Str(s) => s.to_string(),
            Value::Object(id) => return self.object_to_string(*id),
        })
    }

    fn join_elements(&mut self, elements: &[Value]) -> Exec<String> {
        let mut parts = Vec::with_capacity(elements.len());
        for element in elements {
            parts.push(match element {
                Value::Undefined | Value::Null => String::new(),
                other => self.display(other)?,
            });
        }
        Ok(parts.join(","))
    }

    fn object_to_string(&mut self, id: ObjectId) -> Exec<String> {
        match self.heap.kind(id) {
            Some(ObjectKind::Array(_)) if self.joining.contains(&id) => Ok(String::new()),
            Some(ObjectKind::Array(elements)) => {
                let elements = elements.clone();
                self.nest()?;
                self.joining.push(id);
                let joined = self.join_elements(&elements);
                self.joining.pop();
                self.unnest();
                joined
            }
            Some(ObjectKind::Error) => {
                let name = self.heap.get(id, "name").unwrap_or(Value::string("Error"));
                let message = self.heap.get(id, "message").unwrap_or(Value::Undefined);
                let name = self.display(&name)?;
                let message = match message {
                    Value::Undefined => String::new(),
                    other => self.display(&other)?,
                };
                Ok(if message.is_empty() {
                    name
                } else {
                    format!("{name}: {message}")
                })
            }
            Some(ObjectKind::Function { def, .. }) => Ok(format!(
                "function {}() {{ [code] }}",
                def.name.as_deref().unwrap_or("")
            )),
            Some(ObjectKind::Native(native)) => {
                Ok(format!("function {}() {{ [native code] }}", native.name()))
            }
            Some(ObjectKind::External(data)) => {
                let data = *data;
                let text = self.dispatch(data, "ToString", InvokeKind::Call, &[])?;
                self.display(&text)
            }
            _ => Ok("[object Object]".to_string()),
        }
    }

    pub(super) fn to_number_value(&mut self, value: &Value) -> Exec<f64> {
        Ok(match value {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => *n,
            Value::Str(s) => string_to_number(s),
            Value::Object(_) => string_to_number(&self.display(value)?),
        })
    }

    fn to_primitive(&mut self, value: &Value) -> Exec<Value> {
        match value {
            Value::Object(_) => Ok(Value::string(&self.display(value)?)),
            other => Ok(other.clone()),
        }
    }

    fn type_of(&self, value: &Value) -> &'static str {
        match value {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Object(id) => {
                if self.heap.kind(*id).is_some_and(ObjectKind::is_callable) {
                    "function"
                } else {
                    "object"
                }
            }
        }
    }

    fn loose_equals(&mut self, a: &Value, b: &Value) -> Exec<bool> {
        Ok(match (a, b) {
            (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
            (Value::Undefined | Value::Null, _) | (_, Value::Undefined | Value::Null) => false,
            (Value::Number(x), Value::Str(s)) | (Value::Str(s), Value::Number(x)) => {
                *x == string_to_number(s)
            }
            (Value::Bool(x), other) | (other, Value::Bool(x)) => {
                let x = Value::Number(f64::from(u8::from(*x)));
                return self.loose_equals(&x, other);
            }
            (Value::Object(_), Value::Number(_) | Value::Str(_)) => {
                let a = self.to_primitive(a)?;
                return self.loose_equals(&a, b);
            }
            (Value::Number(_) | Value::Str(_), Value::Object(_)) => {
                let b = self.to_primitive(b)?;
                return self.loose_equals(a, &b);
            }
            _ => strict_equals(a, b),
        })
    }

    fn binary(&mut self, op: BinaryOp, a: &Value, b: &Value) -> Exec<Value> {
        let arithmetic = |f: fn(f64, f64) -> f64, rt: &mut Self| -> Exec<Value> {
            let x = rt.to_number_value(a)?;
            let y = rt.to_number_value(b)?;
            Ok(Value::Number(f(x, y)))
        };
        match op {
            BinaryOp::Add => {
                let a = self.to_primitive(a)?;
                let b = self.to_primitive(b)?;
                if matches!(a, Value::Str(_)) || matches!(b, Value::Str(_)) {
                    let mut text = self.display(&a)?;
                    text.push_str(&self.display(&b)?);
                    Ok(Value::string(&text))
                } else {
                    let x = self.to_number_value(&a)?;
                    let y = self.to_number_value(&b)?;
                    Ok(Value::Number(x + y))
                }
            }
            BinaryOp::Sub => arithmetic(|x, y| x - y, self),
            BinaryOp::Mul => arithmetic(|x, y| x * y, self),
            BinaryOp::Div => arithmetic(|x, y| x / y, self),
            BinaryOp::Mod => arithmetic(|x, y| x % y, self),
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
                let a = self.to_primitive(a)?;
                let b = self.to_primitive(b)?;
                let ordering = match (&a, &b) {
                    (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
                    _ => {
                        let x = self.to_number_value(&a)?;
                        let y = self.to_number_value(&b)?;
                        x.partial_cmp(&y)
                    }
                };
                let Some(ordering) = ordering else {
                    return Ok(Value::Bool(false));
                };
                Ok(Value::Bool(match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Gt => ordering.is_gt(),
                    BinaryOp::Le => ordering.is_le(),
                    _ => ordering.is_ge(),
                }))
            }
            BinaryOp::Eq => Ok(Value::Bool(self.loose_equals(a, b)?)),
            BinaryOp::Ne => Ok(Value::Bool(!self.loose_equals(a, b)?)),
            BinaryOp::StrictEq => Ok(Value::Bool(strict_equals(a, b))),
            BinaryOp::StrictNe => Ok(Value::Bool(!strict_equals(a, b))),
        }
    }

    // ── statements ───────────────────────────────────────────

    fn exec_block(&mut self, body: &[Stmt], context: &Context) -> Exec<Completion> {
        for stmt in body {
            match self.exec(stmt, context)? {
                Completion::Normal => {}
                abrupt => return Ok(abrupt),
            }
        }
        Ok(Completion::Normal)
    }

    /// Claim one level of the nesting budget; callers give it back with
    /// [`Self::unnest`] whether or not the nested step succeeded.
    fn nest(&mut self) -> Exec<()> {
        if self.nesting >= self.max_nesting {
            return Err(self.throw(ErrorKind::RangeError, "Out of stack space"));
        }
        self.nesting += 1;
        Ok(())
    }

    fn unnest(&mut self) {
        self.nesting -= 1;
    }

    fn exec(&mut self, stmt: &Stmt, context: &Context) -> Exec<Completion> {
        self.nest()?;
        let completion = self.exec_node(stmt, context);
        self.unnest();
        completion
    }

    fn exec_node(&mut self, stmt: &Stmt, context: &Context) -> Exec<Completion> {
        self.mark(stmt.pos);
        match &stmt.kind {
            StmtKind::Var(declarations) => {
                for (name, init) in declarations {
                    if let Some(init) = init {
                        let value = self.eval(init, context)?;
                        self.heap.set(context.scope, name, value);
                    }
                }
                Ok(Completion::Normal)
            }
            StmtKind::Function(_) | StmtKind::Empty => Ok(Completion::Normal),
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, context)?,
                    None => Value::Undefined,
                };
                Ok(Completion::Return(value))
            }
            StmtKind::If {
                test,
                then,
                otherwise,
            } => {
                let test = self.eval(test, context)?;
                if truthy(&test) {
                    self.exec(then, context)
                } else if let Some(otherwise) = otherwise {
                    self.exec(otherwise, context)
                } else {
                    Ok(Completion::Normal)
                }
            }
            StmtKind::While { test, body } => {
                loop {
                    self.check_interrupt()?;
                    let test = self.eval(test, context)?;
                    if !truthy(&test) {
                        break;
                    }
                    match self.exec(body, context)? {
                        Completion::Break => break,
                        Completion::Return(value) => return Ok(Completion::Return(value)),
                        Completion::Normal | Completion::Continue => {}
                    }
                }
                Ok(Completion::Normal)
            }
            StmtKind::For {
                init,
                test,
                update,
                body,
            } => {
                if let Some(init) = init {
                    self.exec(init, context)?;
                }
                loop {
                    self.check_interrupt()?;
                    if let Some(test) = test {
                        let test = self.eval(test, context)?;
                        if !truthy(&test) {
                            break;
                        }
                    }
                    match self.exec(body, context)? {
                        Completion::Break => break,
                        Completion::Return(value) => return Ok(Completion::Return(value)),
                        Completion::Normal | Completion::Continue => {}
                    }
                    if let Some(update) = update {
                        self.eval(update, context)?;
                    }
                }
                Ok(Completion::Normal)
            }
            StmtKind::Break => Ok(Completion::Break),
            StmtKind::Continue => Ok(Completion::Continue),
            StmtKind::Throw(expr) => {
                let value = self.eval(expr, context)?;
                self.mark(stmt.pos);
                Err(Abort::Throw {
                    value,
                    location: self.location(),
                })
            }
            StmtKind::Try {
                block,
                handler,
                finalizer,
            } => {
                let mut result = self.exec_block(block, context);
                if let Some((param, handler)) = handler {
                    if let Err(Abort::Throw { value, .. }) = result {
                        self.heap.set(context.scope, param, value);
                        result = self.exec_block(handler, context);
                    }
                }
                if let Some(finalizer) = finalizer {
                    match self.exec_block(finalizer, context)? {
                        Completion::Normal => {}
                        abrupt => return Ok(abrupt),
                    }
                }
                result
            }
            StmtKind::Block(body) => self.exec_block(body, context),
            StmtKind::Expr(expr) => {
                self.completion = self.eval(expr, context)?;
                Ok(Completion::Normal)
            }
        }
    }

    // ── expressions ──────────────────────────────────────────

    fn eval(&mut self, expr: &Expr, context: &Context) -> Exec<Value> {
        self.nest()?;
        let value = self.eval_node(expr, context);
        self.unnest();
        value
    }

    fn eval_node(&mut self, expr: &Expr, context: &Context) -> Exec<Value> {
        match &expr.kind {
            ExprKind::Number(n) => Ok(Value::Number(*n)),
            ExprKind::Str(s) => Ok(Value::Str(Rc::clone(s))),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Null => Ok(Value::Null),
            ExprKind::Undefined => Ok(Value::Undefined),
            ExprKind::This => Ok(context.this.clone()),
            ExprKind::Ident(name) => {
                self.read_reference(&Reference::Variable(Rc::clone(name)), context)
            }
            ExprKind::Array(elements) => {
                let mut values = Vec::with_capacity(elements.len());
                for element in elements {
                    values.push(self.eval(element, context)?);
                }
                Ok(Value::Object(self.heap.alloc(ObjectKind::Array(values))))
            }
            ExprKind::Object(properties) => {
                let id = self.heap.alloc(ObjectKind::Ordinary);
                for (key, value) in properties {
                    let value = self.eval(value, context)?;
                    self.heap.set(id, key, value);
                }
                Ok(Value::Object(id))
            }
            ExprKind::Function(def) => Ok(self.make_function(def, context.scope)),
            ExprKind::Member(object, name) => {
                let object = self.eval(object, context)?;
                self.get_member(&object, name)
            }
            ExprKind::Index(object, key) => {
                let object = self.eval(object, context)?;
                let key = self.eval(key, context)?;
                if let (Value::Object(id), Value::Number(n)) = (&object, &key) {
                    if *n >= 0.0 && *n < f64::from(u32::MAX) && n.fract() == 0.0 {
                        if let Some(ObjectKind::Array(elements)) = self.heap.kind(*id) {
                            let element = elements.get(*n as usize).cloned();
                            return Ok(element.unwrap_or(Value::Undefined));
                        }
                    }
                }
                let key = self.property_key(&key)?;
                self.get_member(&object, &key)
            }
            ExprKind::Call(callee, args) => self.eval_call(callee, args, expr.pos, context),
            ExprKind::New(callee, args) => {
                let constructor = self.eval(callee, context)?;
                let args = self.eval_args(args, context)?;
                self.mark(expr.pos);
                self.construct_value(&constructor, args)
            }
            ExprKind::Unary(op, operand) => self.eval_unary(*op, operand, context),
            ExprKind::Binary(op, left, right) => {
                let left = self.eval(left, context)?;
                let right = self.eval(right, context)?;
                self.binary(*op, &left, &right)
            }
            ExprKind::Logical(op, left, right) => {
                let left = self.eval(left, context)?;
                match (op, truthy(&left)) {
                    (LogicalOp::And, true) | (LogicalOp::Or, false) => self.eval(right, context),
                    _ => Ok(left),
                }
            }
            ExprKind::Assign(op, target, value) => {
                let reference = self.reference(target, context)?;
                let value = match op.binary() {
                    None => self.eval(value, context)?,
                    Some(binary) => {
                        let old = self.read_reference(&reference, context)?;
                        let rhs = self.eval(value, context)?;
                        self.binary(binary, &old, &rhs)?
                    }
                };
                self.write_reference(&reference, value.clone(), context)?;
                Ok(value)
            }
            ExprKind::Update {
                increment,
                prefix,
                target,
            } => {
                let reference = self.reference(target, context)?;
                let old = self.read_reference(&reference, context)?;
                let old = self.to_number_value(&old)?;
                let new = if *increment { old + 1.0 } else { old - 1.0 };
                self.write_reference(&reference, Value::Number(new), context)?;
                Ok(Value::Number(if *prefix { new } else { old }))
            }
            ExprKind::Conditional(test, then, otherwise) => {
                let test = self.eval(test, context)?;
                if truthy(&test) {
                    self.eval(then, context)
                } else {
                    self.eval(otherwise, context)
                }
            }
        }
    }

    fn eval_args(&mut self, args: &[Expr], context: &Context) -> Exec<Vec<Value>> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg, context)?);
        }
        Ok(values)
    }

    fn eval_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        pos: Pos,
        context: &Context,
    ) -> Exec<Value> {
        let (object, name) = match &callee.kind {
            ExprKind::Member(object, name) => (self.eval(object, context)?, name.to_string()),
            ExprKind::Index(object, key) => {
                let object = self.eval(object, context)?;
                let key = self.eval(key, context)?;
                (object, self.property_key(&key)?)
            }
            _ => {
                let function = self.eval(callee, context)?;
                let args = self.eval_args(args, context)?;
                self.mark(pos);
                return self.call_value(&function, Value::Undefined, args);
            }
        };
        let args = self.eval_args(args, context)?;
        self.mark(pos);
        self.call_method(&object, &name, args)
    }

    fn call_method(&mut self, object: &Value, name: &str, args: Vec<Value>) -> Exec<Value> {
        let kind = object.as_object().and_then(|id| self.heap.kind(id));
        if let Some(ObjectKind::External(data)) = kind {
            let data = *data;
            return self.dispatch(data, name, InvokeKind::Call, &args);
        }
        let function = self.get_member(object, name)?;
        let callable = function
            .as_object()
            .and_then(|id| self.heap.kind(id))
            .is_some_and(ObjectKind::is_callable);
        if !callable {
            return Err(self.throw(
                ErrorKind::TypeError,
                format!("Object doesn't support property or method '{name}'"),
            ));
        }
        self.call_value(&function, object.clone(), args)
    }

    fn eval_unary(&mut self, op: UnaryOp, operand: &Expr, context: &Context) -> Exec<Value> {
        match op {
            UnaryOp::Typeof => {
                if let ExprKind::Ident(name) = &operand.kind {
                    if self.lookup(context.scope, name).is_none() {
                        return Ok(Value::string("undefined"));
                    }
                }
                let value = self.eval(operand, context)?;
                Ok(Value::string(self.type_of(&value)))
            }
            UnaryOp::Delete => {
                let reference = match &operand.kind {
                    ExprKind::Ident(_) | ExprKind::Member(..) | ExprKind::Index(..) => {
                        self.reference(operand, context)?
                    }
                    _ => {
                        self.eval(operand, context)?;
                        return Ok(Value::Bool(true));
                    }
                };
                Ok(Value::Bool(self.delete_reference(&reference, context)))
            }
            _ => {
                let value = self.eval(operand, context)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!truthy(&value)),
                    UnaryOp::Neg => Value::Number(-self.to_number_value(&value)?),
                    UnaryOp::Plus => Value::Number(self.to_number_value(&value)?),
                    _ => Value::Undefined,
                })
            }
        }
    }

    fn delete_reference(&mut self, reference: &Reference, context: &Context) -> bool {
        match reference {
            Reference::Variable(name) => {
                if let Some(scope) = self.defining_scope(context.scope, name) {
                    self.heap.delete(scope, name);
                }
                true
            }
            Reference::Property(object, name) => {
                object.as_object().is_none_or(|id| self.delete_own(id, name))
            }
        }
    }

    /// Remove an own property; external objects refuse.
    pub(super) fn delete_own(&mut self, id: ObjectId, name: &str) -> bool {
        if matches!(self.heap.kind(id), Some(ObjectKind::External(_))) {
            return false;
        }
        if let (Some(index), Some(elements)) = (array_index(name), self.array_mut(id)) {
            if let Some(slot) = elements.get_mut(index) {
                *slot = Value::Undefined;
            }
            return true;
        }
        self.heap.delete(id, name);
        true
    }
}
