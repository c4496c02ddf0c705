//! Member dispatch for embedded host values.
//!
//! Script code reaches host members by name. [`MemberDispatcher`] resolves
//! the name against the target's member table, filtered by the engine's
//! [`ReflectionPolicy`], and performs the get, set, call or construct.
//! Member tables are built once per host type and cached.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::host::{
    Accessor, HostDelegate, HostError, HostObjectRef, HostType, HostTypeRef, MemberDescriptor,
    MemberScope, MemberSet, Overload, select_overload, type_address,
};
use crate::runtime::{CallingConvention, DEFAULT_MEMBER_NAME, InvokeKind, NativeError, NativeResult};
use crate::shard::ShardedMap;
use crate::value::HostValue;

/// Target of a member access.
#[derive(Debug, Clone)]
pub enum DispatchTarget {
    Instance(HostObjectRef),
    Static(HostTypeRef),
    Delegate(HostDelegate),
}

impl DispatchTarget {
    /// Convert an embedded host value into a dispatch target.
    #[must_use]
    pub fn from_host(value: HostValue) -> Option<Self> {
        match value {
            HostValue::Object(object) => Some(Self::Instance(object)),
            HostValue::Type(host_type) => Some(Self::Static(host_type)),
            HostValue::Delegate(delegate) => Some(Self::Delegate(delegate)),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Instance(object) => object.host_type().name().to_string(),
            Self::Static(host_type) => format!("type {}", host_type.name()),
            Self::Delegate(delegate) => delegate.name().to_string(),
        }
    }
}

/// Which members script code may see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectionPolicy {
    allow_reflection: bool,
}

impl ReflectionPolicy {
    #[must_use]
    pub fn new(allow_reflection: bool) -> Self {
        Self { allow_reflection }
    }

    #[must_use]
    pub fn allow_reflection(&self) -> bool {
        self.allow_reflection
    }

    #[must_use]
    pub fn permits(&self, descriptor: &MemberDescriptor) -> bool {
        self.allow_reflection || !descriptor.reflective
    }
}

impl Default for ReflectionPolicy {
    fn default() -> Self {
        Self::new(false)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Builtin {
    ToString,
    Equals,
    GetHashCode,
    GetType,
    ReferenceEquals,
}

impl Builtin {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "ToString" => Self::ToString,
            "Equals" => Self::Equals,
            "GetHashCode" => Self::GetHashCode,
            "GetType" => Self::GetType,
            "ReferenceEquals" => Self::ReferenceEquals,
            _ => return None,
        })
    }
}

#[derive(Clone)]
enum Member {
    Property(Accessor),
    Field(Accessor),
    Methods(Vec<Overload>),
    Builtin(Builtin),
}

/// Policy-filtered member table for one scope of one type.
#[derive(Clone, Default)]
struct ScopeTable {
    members: BTreeMap<String, Member>,
}

impl ScopeTable {
    fn build(
        host_type: &HostType,
        scope: MemberScope,
        set: &MemberSet,
        policy: &ReflectionPolicy,
    ) -> Self {
        let visible = |name: &str| {
            host_type
                .member(scope, name)
                .is_some_and(|descriptor| policy.permits(descriptor))
        };
        let mut members = BTreeMap::new();
        // Properties win over fields of the same name.
        for (name, accessor) in &set.fields {
            if visible(name) {
                members.insert(name.clone(), Member::Field(accessor.clone()));
            }
        }
        for (name, accessor) in &set.properties {
            if visible(name) {
                members.insert(name.clone(), Member::Property(accessor.clone()));
            }
        }
        for (name, overloads) in &set.methods {
            if visible(name) && !members.contains_key(name) {
                members.insert(name.clone(), Member::Methods(overloads.clone()));
            }
        }
        for descriptor in host_type.members() {
            if descriptor.builtin && descriptor.scope == scope && policy.permits(descriptor) {
                if let Some(builtin) = Builtin::parse(&descriptor.name) {
                    members
                        .entry(descriptor.name.clone())
                        .or_insert(Member::Builtin(builtin));
                }
            }
        }
        Self { members }
    }
}

struct TypeTable {
    // Keeps the type alive so its address stays a unique cache key.
    _host_type: HostTypeRef,
    instance: ScopeTable,
    statics: ScopeTable,
}

/// Resolves member accesses on embedded host values.
pub struct MemberDispatcher {
    policy: ReflectionPolicy,
    convention: CallingConvention,
    tables: ShardedMap<usize, Arc<TypeTable>>,
}

impl std::fmt::Debug for MemberDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberDispatcher")
            .field("policy", &self.policy)
            .field("convention", &self.convention)
            .field("cached_types", &self.tables.len())
            .finish()
    }
}

impl MemberDispatcher {
    #[must_use]
    pub fn new(policy: ReflectionPolicy, convention: CallingConvention) -> Self {
        Self {
            policy,
            convention,
            tables: ShardedMap::with_shards(16),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &ReflectionPolicy {
        &self.policy
    }

    fn table(&self, host_type: &HostTypeRef) -> Arc<TypeTable> {
        self.tables.get_or_insert_with(type_address(host_type), || {
            Arc::new(TypeTable {
                _host_type: HostTypeRef::clone(host_type),
                instance: ScopeTable::build(
                    host_type,
                    MemberScope::Instance,
                    &host_type.instance,
                    &self.policy,
                ),
                statics: ScopeTable::build(
                    host_type,
                    MemberScope::Static,
                    &host_type.statics,
                    &self.policy,
                ),
            })
        })
    }

    /// Members of `host_type` visible under this dispatcher's policy.
    #[must_use]
    pub fn visible_members(&self, host_type: &HostTypeRef) -> Vec<MemberDescriptor> {
        host_type
            .members()
            .iter()
            .filter(|descriptor| self.policy.permits(descriptor))
            .cloned()
            .collect()
    }

    /// Perform one member access. `args` are already converted to host
    /// values and may carry a leading `this` placeholder per the backend's
    /// calling convention.
    pub fn invoke(
        &self,
        target: &DispatchTarget,
        name: &str,
        kind: InvokeKind,
        mut args: Vec<HostValue>,
    ) -> NativeResult<HostValue> {
        match target {
            DispatchTarget::Delegate(delegate) => {
                if name != DEFAULT_MEMBER_NAME {
                    return Err(missing(target, name));
                }
                match kind {
                    InvokeKind::Call | InvokeKind::Construct => {
                        if self.convention.delegate_receives_this && !args.is_empty() {
                            args.remove(0);
                        }
                        delegate.invoke(&args).map_err(host_error)
                    }
                    InvokeKind::GetProperty | InvokeKind::SetProperty => {
                        Err(missing(target, name))
                    }
                }
            }
            DispatchTarget::Instance(object) => {
                if name == DEFAULT_MEMBER_NAME {
                    return Err(NativeError::TypeMismatch(format!(
                        "{} object is not a function",
                        object.host_type().name()
                    )));
                }
                let table = self.table(object.host_type());
                let member = table
                    .instance
                    .members
                    .get(name)
                    .ok_or_else(|| missing(target, name))?;
                self.invoke_member(target, Some(object), member, name, kind, args)
            }
            DispatchTarget::Static(host_type) => {
                if name == DEFAULT_MEMBER_NAME {
                    return match kind {
                        InvokeKind::Construct => self.construct(host_type, args),
                        _ => Err(NativeError::TypeMismatch(format!(
                            "type {} must be invoked with new",
                            host_type.name()
                        ))),
                    };
                }
                let table = self.table(host_type);
                let member = table
                    .statics
                    .members
                    .get(name)
                    .ok_or_else(|| missing(target, name))?;
                self.invoke_member(target, None, member, name, kind, args)
            }
        }
    }

    fn construct(
        &self,
        host_type: &HostTypeRef,
        mut args: Vec<HostValue>,
    ) -> NativeResult<HostValue> {
        if self.convention.constructor_receives_this && !args.is_empty() {
            args.remove(0);
        }
        if !host_type.has_constructor() {
            return Err(NativeError::TypeMismatch(format!(
                "type {} has no constructor",
                host_type.name()
            )));
        }
        let overload = select_overload(&host_type.constructors, &args).ok_or_else(|| {
            NativeError::TypeMismatch(format!(
                "no constructor of {} accepts {} argument(s) of the given types",
                host_type.name(),
                args.len()
            ))
        })?;
        (overload.call)(None, &args).map_err(host_error)
    }

    fn invoke_member(
        &self,
        target: &DispatchTarget,
        receiver: Option<&HostObjectRef>,
        member: &Member,
        name: &str,
        kind: InvokeKind,
        args: Vec<HostValue>,
    ) -> NativeResult<HostValue> {
        let recv = receiver.map(HostObjectRef::instance);
        match (member, kind) {
            (Member::Property(accessor) | Member::Field(accessor), InvokeKind::GetProperty) => {
                (accessor.get)(recv).map_err(host_error)
            }
            (Member::Property(accessor) | Member::Field(accessor), InvokeKind::SetProperty) => {
                let setter = accessor.set.as_ref().ok_or_else(|| {
                    NativeError::TypeMismatch(format!("member '{name}' is read-only"))
                })?;
                let value = args.into_iter().next().unwrap_or_default();
                setter(recv, value).map_err(host_error)?;
                Ok(HostValue::Undefined)
            }
            (Member::Property(accessor) | Member::Field(accessor), InvokeKind::Call) => {
                // A member holding a delegate is callable in place.
                match (accessor.get)(recv).map_err(host_error)? {
                    HostValue::Delegate(delegate) => delegate.invoke(&args).map_err(host_error),
                    _ => Err(NativeError::TypeMismatch(format!(
                        "member '{name}' is not a method"
                    ))),
                }
            }
            (Member::Methods(overloads), InvokeKind::Call) => {
                call_overloads(overloads, receiver, name, &args)
            }
            (Member::Methods(overloads), InvokeKind::GetProperty) => {
                let overloads = overloads.clone();
                let receiver = receiver.cloned();
                let method = name.to_string();
                let bound = HostDelegate::new(move |args| {
                    call_overloads(&overloads, receiver.as_ref(), &method, args)
                        .map_err(|err| HostError::failed(err.to_string()))
                })
                .named(name);
                Ok(HostValue::Delegate(bound))
            }
            (Member::Builtin(builtin), InvokeKind::Call) => {
                call_builtin(*builtin, target, &args)
            }
            (Member::Builtin(builtin), InvokeKind::GetProperty) => {
                let builtin = *builtin;
                let target = target.clone();
                let bound = HostDelegate::new(move |args| {
                    call_builtin(builtin, &target, args)
                        .map_err(|err| HostError::failed(err.to_string()))
                })
                .named(name);
                Ok(HostValue::Delegate(bound))
            }
            (Member::Methods(_) | Member::Builtin(_), InvokeKind::SetProperty) => Err(
                NativeError::TypeMismatch(format!("method '{name}' cannot be assigned")),
            ),
            (_, InvokeKind::Construct) => Err(NativeError::TypeMismatch(format!(
                "member '{name}' is not a constructor"
            ))),
        }
    }
}

fn call_overloads(
    overloads: &[Overload],
    receiver: Option<&HostObjectRef>,
    name: &str,
    args: &[HostValue],
) -> NativeResult<HostValue> {
    let overload = select_overload(overloads, args).ok_or_else(|| {
        NativeError::TypeMismatch(format!(
            "no overload of '{name}' accepts {} argument(s) of the given types",
            args.len()
        ))
    })?;
    (overload.call)(receiver.map(HostObjectRef::instance), args).map_err(host_error)
}

fn call_builtin(
    builtin: Builtin,
    target: &DispatchTarget,
    args: &[HostValue],
) -> NativeResult<HostValue> {
    let identity = |value: &HostValue| -> Option<usize> {
        match value {
            HostValue::Object(object) => Some(object.address()),
            HostValue::Type(host_type) => Some(type_address(host_type)),
            HostValue::Delegate(delegate) => Some(delegate.address()),
            _ => None,
        }
    };
    let own = match target {
        DispatchTarget::Instance(object) => object.address(),
        DispatchTarget::Static(host_type) => type_address(host_type),
        DispatchTarget::Delegate(delegate) => delegate.address(),
    };
    match builtin {
        Builtin::ToString => Ok(HostValue::String(match target {
            DispatchTarget::Instance(object) => object.host_type().name().to_string(),
            DispatchTarget::Static(host_type) => host_type.name().to_string(),
            DispatchTarget::Delegate(delegate) => delegate.name().to_string(),
        })),
        Builtin::Equals => {
            let other = args.first().and_then(identity);
            Ok(HostValue::Bool(other == Some(own)))
        }
        Builtin::GetHashCode => {
            let mut hasher = DefaultHasher::new();
            own.hash(&mut hasher);
            Ok(HostValue::Int(hasher.finish() as i32))
        }
        Builtin::GetType => match target {
            DispatchTarget::Instance(object) => {
                Ok(HostValue::Type(HostTypeRef::clone(object.host_type())))
            }
            _ => Err(missing(target, "GetType")),
        },
        Builtin::ReferenceEquals => {
            let a = args.first().and_then(identity);
            let b = args.get(1).and_then(identity);
            Ok(HostValue::Bool(a.is_some() && a == b))
        }
    }
}

fn missing(target: &DispatchTarget, name: &str) -> NativeError {
    NativeError::MissingMember {
        target: target.describe(),
        name: name.to_string(),
    }
}

fn host_error(err: HostError) -> NativeError {
    match err {
        HostError::Failed(message) => NativeError::Host(message),
        HostError::InvalidArgument(message) => NativeError::TypeMismatch(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostType, MemberKind, ParamKind};
    use std::sync::Mutex;

    struct Point {
        x: Mutex<f64>,
        y: f64,
    }

    fn point_type() -> HostTypeRef {
        HostType::builder::<Point>("Point")
            .field(
                "X",
                |p: &Point| HostValue::Double(*p.x.lock().unwrap()),
                |p: &Point, v| {
                    *p.x.lock().unwrap() = v
                        .coerce_f64()
                        .ok_or_else(|| HostError::invalid_argument("X must be a number"))?;
                    Ok(())
                },
            )
            .readonly_property("Y", |p: &Point| Ok(HostValue::Double(p.y)))
            .method("Offset", &[ParamKind::Number], |p: &Point, args| {
                let dx = args[0].coerce_f64().unwrap_or(0.0);
                Ok(HostValue::Double(*p.x.lock().unwrap() + dx))
            })
            .method("Offset", &[ParamKind::Number, ParamKind::Number], |p: &Point, args| {
                let dx = args[0].coerce_f64().unwrap_or(0.0);
                let dy = args[1].coerce_f64().unwrap_or(0.0);
                Ok(HostValue::Double(*p.x.lock().unwrap() + dx + p.y + dy))
            })
            .method("Fail", &[], |_p: &Point, _args| Err(HostError::failed("boom")))
            .static_method("Origin", &[], |_args| Ok(HostValue::from("origin")))
            .constructor(&[ParamKind::Number, ParamKind::Number], |args| {
                Ok(HostValue::Double(
                    args[0].coerce_f64().unwrap_or(0.0) + args[1].coerce_f64().unwrap_or(0.0),
                ))
            })
            .build()
    }

    fn point(ty: &HostTypeRef) -> DispatchTarget {
        DispatchTarget::Instance(HostObjectRef::new(
            Point {
                x: Mutex::new(1.0),
                y: 2.0,
            },
            ty,
        ))
    }

    fn dispatcher(allow_reflection: bool) -> MemberDispatcher {
        MemberDispatcher::new(
            ReflectionPolicy::new(allow_reflection),
            CallingConvention::NATIVE_FUNCTION,
        )
    }

    // ── get / set ────────────────────────────────────────────

    #[test]
    fn get_and_set_field() {
        let ty = point_type();
        let target = point(&ty);
        let d = dispatcher(false);
        d.invoke(&target, "X", InvokeKind::SetProperty, vec![HostValue::Int(5)])
            .unwrap();
        let x = d.invoke(&target, "X", InvokeKind::GetProperty, vec![]).unwrap();
        assert_eq!(x, HostValue::Double(5.0));
    }

    #[test]
    fn set_readonly_property_fails() {
        let ty = point_type();
        let err = dispatcher(false)
            .invoke(&point(&ty), "Y", InvokeKind::SetProperty, vec![HostValue::Int(1)])
            .unwrap_err();
        assert!(matches!(err, NativeError::TypeMismatch(msg) if msg.contains("read-only")));
    }

    #[test]
    fn unknown_member_is_missing() {
        let ty = point_type();
        let err = dispatcher(false)
            .invoke(&point(&ty), "Z", InvokeKind::GetProperty, vec![])
            .unwrap_err();
        assert!(matches!(err, NativeError::MissingMember { ref name, .. } if name == "Z"));
    }

    // ── methods ──────────────────────────────────────────────

    #[test]
    fn call_picks_overload_by_arity() {
        let ty = point_type();
        let target = point(&ty);
        let d = dispatcher(false);
        let one = d
            .invoke(&target, "Offset", InvokeKind::Call, vec![HostValue::Double(1.5)])
            .unwrap();
        assert_eq!(one, HostValue::Double(2.5));
        let two = d
            .invoke(
                &target,
                "Offset",
                InvokeKind::Call,
                vec![HostValue::Int(1), HostValue::Int(1)],
            )
            .unwrap();
        assert_eq!(two, HostValue::Double(5.0));
    }

    #[test]
    fn call_with_unbindable_args_is_type_mismatch() {
        let ty = point_type();
        let err = dispatcher(false)
            .invoke(&point(&ty), "Offset", InvokeKind::Call, vec![HostValue::from("x")])
            .unwrap_err();
        assert!(matches!(err, NativeError::TypeMismatch(_)));
    }

    #[test]
    fn get_method_returns_bound_delegate() {
        let ty = point_type();
        let bound = dispatcher(false)
            .invoke(&point(&ty), "Offset", InvokeKind::GetProperty, vec![])
            .unwrap();
        let HostValue::Delegate(delegate) = bound else {
            panic!("expected delegate, got {bound:?}");
        };
        assert_eq!(
            delegate.invoke(&[HostValue::Double(2.0)]).unwrap(),
            HostValue::Double(3.0)
        );
    }

    #[test]
    fn host_failure_maps_to_host_error() {
        let ty = point_type();
        let err = dispatcher(false)
            .invoke(&point(&ty), "Fail", InvokeKind::Call, vec![])
            .unwrap_err();
        assert!(matches!(err, NativeError::Host(msg) if msg == "boom"));
    }

    // ── statics and construction ─────────────────────────────

    #[test]
    fn static_method_and_constructor() {
        let ty = point_type();
        let target = DispatchTarget::Static(HostTypeRef::clone(&ty));
        let d = dispatcher(false);
        assert_eq!(
            d.invoke(&target, "Origin", InvokeKind::Call, vec![]).unwrap(),
            HostValue::from("origin")
        );
        // Native-function convention: leading `this` placeholder is stripped.
        let built = d
            .invoke(
                &target,
                DEFAULT_MEMBER_NAME,
                InvokeKind::Construct,
                vec![HostValue::Undefined, HostValue::Int(3), HostValue::Int(4)],
            )
            .unwrap();
        assert_eq!(built, HostValue::Double(7.0));
    }

    #[test]
    fn calling_type_without_new_fails() {
        let ty = point_type();
        let err = dispatcher(false)
            .invoke(
                &DispatchTarget::Static(ty),
                DEFAULT_MEMBER_NAME,
                InvokeKind::Call,
                vec![],
            )
            .unwrap_err();
        assert!(matches!(err, NativeError::TypeMismatch(_)));
    }

    #[test]
    fn delegate_this_stripped_under_dispatch_convention() {
        let add = HostDelegate::from_fn2(|a: i32, b: i32| a + b);
        let target = DispatchTarget::Delegate(add);
        let d = MemberDispatcher::new(ReflectionPolicy::default(), CallingConvention::DISPATCH);
        let sum = d
            .invoke(
                &target,
                DEFAULT_MEMBER_NAME,
                InvokeKind::Call,
                vec![HostValue::Null, HostValue::Int(7), HostValue::Int(9)],
            )
            .unwrap();
        assert_eq!(sum, HostValue::Int(16));
    }

    // ── reflection policy ────────────────────────────────────

    #[test]
    fn reflection_members_hidden_by_default() {
        let ty = point_type();
        let target = point(&ty);
        let err = dispatcher(false)
            .invoke(&target, "GetType", InvokeKind::Call, vec![])
            .unwrap_err();
        assert!(matches!(err, NativeError::MissingMember { .. }));

        let visible = dispatcher(false).visible_members(&ty);
        assert!(!visible.iter().any(|m| m.name == "GetType"));
        assert!(visible.iter().any(|m| m.name == "ToString"));
    }

    #[test]
    fn reflection_members_available_when_allowed() {
        let ty = point_type();
        let target = point(&ty);
        let result = dispatcher(true)
            .invoke(&target, "GetType", InvokeKind::Call, vec![])
            .unwrap();
        assert!(matches!(result, HostValue::Type(t) if t.name() == "Point"));
    }

    #[test]
    fn equals_compares_identity() {
        let ty = point_type();
        let target = point(&ty);
        let DispatchTarget::Instance(object) = &target else {
            unreachable!()
        };
        let d = dispatcher(false);
        let same = d
            .invoke(&target, "Equals", InvokeKind::Call, vec![HostValue::Object(object.clone())])
            .unwrap();
        assert_eq!(same, HostValue::Bool(true));
        let other = point(&ty);
        let DispatchTarget::Instance(other) = other else {
            unreachable!()
        };
        let different = d
            .invoke(&target, "Equals", InvokeKind::Call, vec![HostValue::Object(other)])
            .unwrap();
        assert_eq!(different, HostValue::Bool(false));
    }

    #[test]
    fn table_is_cached_per_type() {
        let ty = point_type();
        let d = dispatcher(false);
        d.invoke(&point(&ty), "X", InvokeKind::GetProperty, vec![]).unwrap();
        d.invoke(&point(&ty), "Y", InvokeKind::GetProperty, vec![]).unwrap();
        assert_eq!(d.tables.len(), 1);
        let descriptor = ty.member(MemberScope::Instance, "Offset").unwrap();
        assert_eq!(descriptor.kind, MemberKind::MethodGroup);
    }
}
