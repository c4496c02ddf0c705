//! Host object model.
//!
//! Script code sees host objects through member tables built once per type
//! with [`HostTypeBuilder`]. A [`HostType`] owns type-erased accessors and
//! method overloads; a [`HostObjectRef`] pairs an `Arc`-held instance with
//! its type; a [`HostDelegate`] is a host callable.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use thiserror::Error;

use crate::value::{FromHostValue, HostValue};

/// Failure raised by host member code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// The member ran and failed.
    #[error("{0}")]
    Failed(String),
    /// Arguments or receiver did not fit the member.
    #[error("{0}")]
    InvalidArgument(String),
}

impl HostError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

impl From<crate::error::Error> for HostError {
    fn from(err: crate::error::Error) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

pub type HostResult<T> = std::result::Result<T, HostError>;

/// Shared handle to a built host type.
pub type HostTypeRef = Arc<HostType>;

pub(crate) type GetFn = Arc<dyn Fn(Option<&dyn Any>) -> HostResult<HostValue> + Send + Sync>;
pub(crate) type SetFn = Arc<dyn Fn(Option<&dyn Any>, HostValue) -> HostResult<()> + Send + Sync>;
pub(crate) type CallFn =
    Arc<dyn Fn(Option<&dyn Any>, &[HostValue]) -> HostResult<HostValue> + Send + Sync>;
type DelegateFn = Arc<dyn Fn(&[HostValue]) -> HostResult<HostValue> + Send + Sync>;

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    Field,
    Property,
    MethodGroup,
    Constructor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberScope {
    Instance,
    Static,
}

/// Expected shape of one method parameter, used for overload selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Any,
    Bool,
    Number,
    Integer,
    String,
    Object,
}

impl ParamKind {
    /// 2 for an exact match, 1 for a convertible one, `None` if the
    /// argument cannot bind.
    #[must_use]
    pub fn match_score(self, arg: &HostValue) -> Option<u8> {
        match (self, arg) {
            (Self::Any, _) => Some(1),
            (Self::Bool, HostValue::Bool(_)) => Some(2),
            (Self::Number, HostValue::Float(_) | HostValue::Double(_)) => Some(2),
            (Self::Number, HostValue::Int(_) | HostValue::Long(_)) => Some(1),
            (Self::Integer, HostValue::Int(_) | HostValue::Long(_)) => Some(2),
            (Self::Integer, HostValue::Float(_) | HostValue::Double(_)) => {
                arg.coerce_i64().map(|_| 1)
            }
            (Self::String, HostValue::String(_)) => Some(2),
            (
                Self::Object,
                HostValue::Object(_)
                | HostValue::Type(_)
                | HostValue::Delegate(_)
                | HostValue::Script(_),
            ) => Some(2),
            (Self::Object, HostValue::Null) => Some(1),
            _ => None,
        }
    }
}

/// Parameter list of one overload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    Fixed(Vec<ParamKind>),
    Variadic,
}

impl Signature {
    #[must_use]
    pub fn accepts_count(&self, count: usize) -> bool {
        match self {
            Self::Fixed(params) => params.len() == count,
            Self::Variadic => true,
        }
    }

    /// Binding score for `args`, or `None` when the overload cannot bind.
    #[must_use]
    pub fn score(&self, args: &[HostValue]) -> Option<u32> {
        match self {
            Self::Variadic => Some(0),
            Self::Fixed(params) if params.len() == args.len() => params
                .iter()
                .zip(args)
                .try_fold(0u32, |acc, (param, arg)| {
                    param.match_score(arg).map(|s| acc + u32::from(s))
                }),
            Self::Fixed(_) => None,
        }
    }
}

/// Public description of one member, independent of its implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberDescriptor {
    pub name: String,
    pub kind: MemberKind,
    pub scope: MemberScope,
    /// Overload signatures for method groups and constructors.
    pub signatures: Vec<Signature>,
    pub readable: bool,
    pub writable: bool,
    /// Introspection-only; hidden unless reflection is allowed.
    pub reflective: bool,
    /// Supplied by the dispatcher rather than by the type.
    pub builtin: bool,
}

impl MemberDescriptor {
    fn accessor(name: &str, kind: MemberKind, scope: MemberScope, writable: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            scope,
            signatures: Vec::new(),
            readable: true,
            writable,
            reflective: false,
            builtin: false,
        }
    }

    fn callable(name: &str, kind: MemberKind, scope: MemberScope, overloads: &[Overload]) -> Self {
        Self {
            name: name.to_string(),
            kind,
            scope,
            signatures: overloads.iter().map(|o| o.signature.clone()).collect(),
            readable: kind == MemberKind::MethodGroup,
            writable: false,
            reflective: false,
            builtin: false,
        }
    }

    fn builtin(name: &str, scope: MemberScope, arity: usize, reflective: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: MemberKind::MethodGroup,
            scope,
            signatures: vec![Signature::Fixed(vec![ParamKind::Any; arity])],
            readable: true,
            writable: false,
            reflective,
            builtin: true,
        }
    }
}

/// Built-in instance members every host object exposes.
pub const BUILTIN_INSTANCE_MEMBERS: &[(&str, usize, bool)] = &[
    ("ToString", 0, false),
    ("Equals", 1, false),
    ("GetHashCode", 0, true),
    ("GetType", 0, true),
];

/// Built-in static members every host type exposes.
pub const BUILTIN_STATIC_MEMBERS: &[(&str, usize, bool)] = &[
    ("ToString", 0, false),
    ("Equals", 1, false),
    ("ReferenceEquals", 2, true),
];

// ---------------------------------------------------------------------------
// Implementations
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub(crate) struct Accessor {
    pub(crate) get: GetFn,
    pub(crate) set: Option<SetFn>,
}

#[derive(Clone)]
pub(crate) struct Overload {
    pub(crate) signature: Signature,
    pub(crate) call: CallFn,
}

/// Pick the best-scoring overload for `args`; ties go to the first declared.
pub(crate) fn select_overload<'a>(
    overloads: &'a [Overload],
    args: &[HostValue],
) -> Option<&'a Overload> {
    let mut best: Option<(&Overload, u32)> = None;
    for overload in overloads {
        if let Some(score) = overload.signature.score(args) {
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((overload, score));
            }
        }
    }
    best.map(|(overload, _)| overload)
}

#[derive(Clone, Default)]
pub(crate) struct MemberSet {
    pub(crate) fields: BTreeMap<String, Accessor>,
    pub(crate) properties: BTreeMap<String, Accessor>,
    pub(crate) methods: BTreeMap<String, Vec<Overload>>,
}

impl MemberSet {
    fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
            || self.properties.contains_key(name)
            || self.methods.contains_key(name)
    }
}

/// A host type: name plus member tables.
pub struct HostType {
    name: String,
    instance_type: TypeId,
    pub(crate) instance: MemberSet,
    pub(crate) statics: MemberSet,
    pub(crate) constructors: Vec<Overload>,
    descriptors: Vec<MemberDescriptor>,
}

impl HostType {
    /// Start describing the host type `T` under the script-visible `name`.
    pub fn builder<T: Any + Send + Sync>(name: impl Into<String>) -> HostTypeBuilder<T> {
        HostTypeBuilder::new(name)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every member, declared and built-in, regardless of policy.
    #[must_use]
    pub fn members(&self) -> &[MemberDescriptor] {
        &self.descriptors
    }

    #[must_use]
    pub fn member(&self, scope: MemberScope, name: &str) -> Option<&MemberDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.scope == scope && d.name == name && d.kind != MemberKind::Constructor)
    }

    #[must_use]
    pub fn has_constructor(&self) -> bool {
        !self.constructors.is_empty()
    }

    #[must_use]
    pub fn is_instance_of<T: Any>(&self) -> bool {
        self.instance_type == TypeId::of::<T>()
    }
}

impl fmt::Debug for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostType")
            .field("name", &self.name)
            .field("members", &self.descriptors.len())
            .finish_non_exhaustive()
    }
}

fn receiver<'a, T: Any>(recv: Option<&'a dyn Any>, type_name: &str) -> HostResult<&'a T> {
    recv.and_then(|any| any.downcast_ref::<T>()).ok_or_else(|| {
        HostError::invalid_argument(format!("receiver is not a {type_name} instance"))
    })
}

/// Builder for [`HostType`].
///
/// Instance members receive `&T`; host types needing mutation from script
/// use interior mutability.
pub struct HostTypeBuilder<T> {
    name: String,
    instance: MemberSet,
    statics: MemberSet,
    constructors: Vec<Overload>,
    reflective: BTreeSet<String>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> HostTypeBuilder<T> {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: MemberSet::default(),
            statics: MemberSet::default(),
            constructors: Vec::new(),
            reflective: BTreeSet::new(),
            _marker: PhantomData,
        }
    }

    fn instance_get<G>(&self, get: G) -> GetFn
    where
        G: Fn(&T) -> HostResult<HostValue> + Send + Sync + 'static,
    {
        let type_name = self.name.clone();
        Arc::new(move |recv| get(receiver::<T>(recv, &type_name)?))
    }

    fn instance_set<S>(&self, set: S) -> SetFn
    where
        S: Fn(&T, HostValue) -> HostResult<()> + Send + Sync + 'static,
    {
        let type_name = self.name.clone();
        Arc::new(move |recv, value| set(receiver::<T>(recv, &type_name)?, value))
    }

    /// Read/write field.
    pub fn field<G, S>(mut self, name: &str, get: G, set: S) -> Self
    where
        G: Fn(&T) -> HostValue + Send + Sync + 'static,
        S: Fn(&T, HostValue) -> HostResult<()> + Send + Sync + 'static,
    {
        let accessor = Accessor {
            get: self.instance_get(move |this| Ok(get(this))),
            set: Some(self.instance_set(set)),
        };
        self.instance.fields.insert(name.to_string(), accessor);
        self
    }

    pub fn readonly_field<G>(mut self, name: &str, get: G) -> Self
    where
        G: Fn(&T) -> HostValue + Send + Sync + 'static,
    {
        let accessor = Accessor {
            get: self.instance_get(move |this| Ok(get(this))),
            set: None,
        };
        self.instance.fields.insert(name.to_string(), accessor);
        self
    }

    /// Read/write property; getters may fail.
    pub fn property<G, S>(mut self, name: &str, get: G, set: S) -> Self
    where
        G: Fn(&T) -> HostResult<HostValue> + Send + Sync + 'static,
        S: Fn(&T, HostValue) -> HostResult<()> + Send + Sync + 'static,
    {
        let accessor = Accessor {
            get: self.instance_get(get),
            set: Some(self.instance_set(set)),
        };
        self.instance.properties.insert(name.to_string(), accessor);
        self
    }

    pub fn readonly_property<G>(mut self, name: &str, get: G) -> Self
    where
        G: Fn(&T) -> HostResult<HostValue> + Send + Sync + 'static,
    {
        let accessor = Accessor {
            get: self.instance_get(get),
            set: None,
        };
        self.instance.properties.insert(name.to_string(), accessor);
        self
    }

    /// Adds an overload to the instance method group `name`.
    pub fn method<F>(mut self, name: &str, params: &[ParamKind], f: F) -> Self
    where
        F: Fn(&T, &[HostValue]) -> HostResult<HostValue> + Send + Sync + 'static,
    {
        let overload = self.instance_overload(Signature::Fixed(params.to_vec()), f);
        self.instance
            .methods
            .entry(name.to_string())
            .or_default()
            .push(overload);
        self
    }

    pub fn variadic_method<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&T, &[HostValue]) -> HostResult<HostValue> + Send + Sync + 'static,
    {
        let overload = self.instance_overload(Signature::Variadic, f);
        self.instance
            .methods
            .entry(name.to_string())
            .or_default()
            .push(overload);
        self
    }

    fn instance_overload<F>(&self, signature: Signature, f: F) -> Overload
    where
        F: Fn(&T, &[HostValue]) -> HostResult<HostValue> + Send + Sync + 'static,
    {
        let type_name = self.name.clone();
        Overload {
            signature,
            call: Arc::new(move |recv, args| f(receiver::<T>(recv, &type_name)?, args)),
        }
    }

    pub fn static_field<G, S>(mut self, name: &str, get: G, set: S) -> Self
    where
        G: Fn() -> HostValue + Send + Sync + 'static,
        S: Fn(HostValue) -> HostResult<()> + Send + Sync + 'static,
    {
        let accessor = Accessor {
            get: Arc::new(move |_| Ok(get())),
            set: Some(Arc::new(move |_, value| set(value))),
        };
        self.statics.fields.insert(name.to_string(), accessor);
        self
    }

    /// Read-only static property.
    pub fn static_property<G>(mut self, name: &str, get: G) -> Self
    where
        G: Fn() -> HostResult<HostValue> + Send + Sync + 'static,
    {
        let accessor = Accessor {
            get: Arc::new(move |_| get()),
            set: None,
        };
        self.statics.properties.insert(name.to_string(), accessor);
        self
    }

    pub fn static_method<F>(mut self, name: &str, params: &[ParamKind], f: F) -> Self
    where
        F: Fn(&[HostValue]) -> HostResult<HostValue> + Send + Sync + 'static,
    {
        let overload = Overload {
            signature: Signature::Fixed(params.to_vec()),
            call: Arc::new(move |_, args| f(args)),
        };
        self.statics
            .methods
            .entry(name.to_string())
            .or_default()
            .push(overload);
        self
    }

    /// Adds a constructor overload. It must return the new object.
    pub fn constructor<F>(mut self, params: &[ParamKind], f: F) -> Self
    where
        F: Fn(&[HostValue]) -> HostResult<HostValue> + Send + Sync + 'static,
    {
        self.constructors.push(Overload {
            signature: Signature::Fixed(params.to_vec()),
            call: Arc::new(move |_, args| f(args)),
        });
        self
    }

    /// Mark a declared member as introspection-only.
    pub fn reflective(mut self, name: &str) -> Self {
        self.reflective.insert(name.to_string());
        self
    }

    pub fn build(self) -> HostTypeRef {
        let mut descriptors = Vec::new();
        for (scope, set) in [
            (MemberScope::Instance, &self.instance),
            (MemberScope::Static, &self.statics),
        ] {
            for (name, accessor) in &set.fields {
                descriptors.push(MemberDescriptor::accessor(
                    name,
                    MemberKind::Field,
                    scope,
                    accessor.set.is_some(),
                ));
            }
            for (name, accessor) in &set.properties {
                descriptors.push(MemberDescriptor::accessor(
                    name,
                    MemberKind::Property,
                    scope,
                    accessor.set.is_some(),
                ));
            }
            for (name, overloads) in &set.methods {
                descriptors.push(MemberDescriptor::callable(
                    name,
                    MemberKind::MethodGroup,
                    scope,
                    overloads,
                ));
            }
        }
        for descriptor in &mut descriptors {
            descriptor.reflective = self.reflective.contains(&descriptor.name);
        }

        for &(name, arity, reflective) in BUILTIN_INSTANCE_MEMBERS {
            if !self.instance.contains(name) {
                descriptors.push(MemberDescriptor::builtin(
                    name,
                    MemberScope::Instance,
                    arity,
                    reflective,
                ));
            }
        }
        for &(name, arity, reflective) in BUILTIN_STATIC_MEMBERS {
            if !self.statics.contains(name) {
                descriptors.push(MemberDescriptor::builtin(
                    name,
                    MemberScope::Static,
                    arity,
                    reflective,
                ));
            }
        }
        if !self.constructors.is_empty() {
            descriptors.push(MemberDescriptor::callable(
                &self.name,
                MemberKind::Constructor,
                MemberScope::Static,
                &self.constructors,
            ));
        }

        Arc::new(HostType {
            name: self.name,
            instance_type: TypeId::of::<T>(),
            instance: self.instance,
            statics: self.statics,
            constructors: self.constructors,
            descriptors,
        })
    }
}

// ---------------------------------------------------------------------------
// Instances and delegates
// ---------------------------------------------------------------------------

/// A host object instance exposed to script.
#[derive(Clone)]
pub struct HostObjectRef {
    instance: Arc<dyn Any + Send + Sync>,
    host_type: HostTypeRef,
}

impl HostObjectRef {
    pub fn new<T: Any + Send + Sync>(value: T, host_type: &HostTypeRef) -> Self {
        Self::from_arc(Arc::new(value), host_type)
    }

    /// Share an existing allocation; embedding the same `Arc` twice yields
    /// the same script wrapper.
    pub fn from_arc<T: Any + Send + Sync>(instance: Arc<T>, host_type: &HostTypeRef) -> Self {
        debug_assert!(
            host_type.is_instance_of::<T>(),
            "host type {} does not describe this instance",
            host_type.name()
        );
        Self {
            instance,
            host_type: Arc::clone(host_type),
        }
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.instance.downcast_ref::<T>()
    }

    #[must_use]
    pub fn host_type(&self) -> &HostTypeRef {
        &self.host_type
    }

    pub(crate) fn instance(&self) -> &dyn Any {
        &*self.instance
    }

    /// Allocation address of the instance; the identity used for embedding.
    #[must_use]
    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.instance).cast::<()>() as usize
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl fmt::Debug for HostObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostObject({} @ {:#x})", self.host_type.name(), self.address())
    }
}

/// Identity address of a host type.
#[must_use]
pub fn type_address(host_type: &HostTypeRef) -> usize {
    Arc::as_ptr(host_type) as usize
}

/// A host callable exposed to script as a function.
#[derive(Clone)]
pub struct HostDelegate {
    function: DelegateFn,
    arity: Option<usize>,
    name: Arc<str>,
}

impl HostDelegate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[HostValue]) -> HostResult<HostValue> + Send + Sync + 'static,
    {
        Self {
            function: Arc::new(f),
            arity: None,
            name: Arc::from("delegate"),
        }
    }

    /// A delegate that rejects calls with any other argument count.
    pub fn with_arity<F>(arity: usize, f: F) -> Self
    where
        F: Fn(&[HostValue]) -> HostResult<HostValue> + Send + Sync + 'static,
    {
        Self {
            arity: Some(arity),
            ..Self::new(f)
        }
    }

    pub fn from_fn1<A, R, F>(f: F) -> Self
    where
        A: FromHostValue,
        R: Into<HostValue>,
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        Self::with_arity(1, move |args| {
            let a = A::from_host_value(args[0].clone())?;
            Ok(f(a).into())
        })
    }

    pub fn from_fn2<A, B, R, F>(f: F) -> Self
    where
        A: FromHostValue,
        B: FromHostValue,
        R: Into<HostValue>,
        F: Fn(A, B) -> R + Send + Sync + 'static,
    {
        Self::with_arity(2, move |args| {
            let a = A::from_host_value(args[0].clone())?;
            let b = B::from_host_value(args[1].clone())?;
            Ok(f(a, b).into())
        })
    }

    #[must_use]
    pub fn named(mut self, name: &str) -> Self {
        self.name = Arc::from(name);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn arity(&self) -> Option<usize> {
        self.arity
    }

    pub fn invoke(&self, args: &[HostValue]) -> HostResult<HostValue> {
        if let Some(arity) = self.arity {
            if args.len() != arity {
                return Err(HostError::invalid_argument(format!(
                    "{} expects {arity} argument(s), got {}",
                    self.name,
                    args.len()
                )));
            }
        }
        (self.function)(args)
    }

    #[must_use]
    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.function).cast::<()>() as usize
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl fmt::Debug for HostDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDelegate")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}
