//! Host-side value model.

use std::fmt;
use std::sync::Arc;

use crossbeam::channel::Sender;

use crate::error::{Error, Result};
use crate::host::{HostDelegate, HostObjectRef, HostTypeRef};
use crate::runtime::ScriptValue;

/// A value on the host side of the boundary.
///
/// Numeric variants compare by numeric value, so `Int(3) == Double(3.0)`;
/// the codec narrows script numbers and this keeps round trips comparable.
/// Objects, types and delegates compare by identity.
#[derive(Clone, Default)]
pub enum HostValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Object(HostObjectRef),
    Type(HostTypeRef),
    Delegate(HostDelegate),
    /// A script value that has no host representation. Only meaningful to
    /// the engine that produced it.
    Script(ScriptRef),
}

/// Pinned handle to a script value held by the host.
///
/// The value stays alive in its runtime until the last clone is dropped;
/// the unpin is then queued back to the owning engine and applied before
/// its next task.
#[derive(Clone)]
pub struct ScriptRef(Arc<Pin>);

struct Pin {
    value: ScriptValue,
    unpin: Sender<ScriptValue>,
}

impl Drop for Pin {
    fn drop(&mut self) {
        // The engine may already be gone.
        let _ = self.unpin.send(self.value);
    }
}

impl ScriptRef {
    /// Wrap a handle that the caller has already pinned with `add_ref`.
    pub(crate) fn pinned(value: ScriptValue, unpin: Sender<ScriptValue>) -> Self {
        Self(Arc::new(Pin { value, unpin }))
    }

    #[must_use]
    pub fn value(&self) -> ScriptValue {
        self.0.value
    }

    /// Whether this handle was issued by the engine owning `unpin`.
    pub(crate) fn issued_by(&self, unpin: &Sender<ScriptValue>) -> bool {
        self.0.unpin.same_channel(unpin)
    }
}

impl PartialEq for ScriptRef {
    fn eq(&self, other: &Self) -> bool {
        self.value() == other.value() && self.0.unpin.same_channel(&other.0.unpin)
    }
}

impl fmt::Debug for ScriptRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value().fmt(f)
    }
}

impl HostValue {
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Undefined => "Undefined",
            Self::Null => "Null",
            Self::Bool(_) => "Bool",
            Self::Int(_) => "Int",
            Self::Long(_) => "Long",
            Self::Float(_) => "Float",
            Self::Double(_) => "Double",
            Self::String(_) => "String",
            Self::Object(_) => "Object",
            Self::Type(_) => "Type",
            Self::Delegate(_) => "Delegate",
            Self::Script(_) => "Script",
        }
    }

    #[must_use]
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Self::Undefined
                | Self::Null
                | Self::Bool(_)
                | Self::Int(_)
                | Self::Long(_)
                | Self::Float(_)
                | Self::Double(_)
                | Self::String(_)
        )
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Int(_) | Self::Long(_) | Self::Float(_) | Self::Double(_)
        )
    }

    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    #[must_use]
    pub fn coerce_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(f64::from(*i)),
            Self::Long(l) => Some(*l as f64),
            Self::Float(f) => Some(f64::from(*f)),
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    #[must_use]
    pub fn coerce_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(i64::from(*i)),
            Self::Long(l) => Some(*l),
            Self::Float(_) | Self::Double(_) => {
                let f = self.coerce_f64()?;
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                    Some(f as i64)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn coerce_i32(&self) -> Option<i32> {
        self.coerce_i64().and_then(|l| i32::try_from(l).ok())
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_object(&self) -> Option<&HostObjectRef> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Long(a), Self::Long(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a.ptr_eq(b),
            (Self::Type(a), Self::Type(b)) => std::sync::Arc::ptr_eq(a, b),
            (Self::Delegate(a), Self::Delegate(b)) => a.ptr_eq(b),
            (Self::Script(a), Self::Script(b)) => a == b,
            (a, b) if a.is_numeric() && b.is_numeric() => a.coerce_f64() == b.coerce_f64(),
            _ => false,
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Bool(b) => b.fmt(f),
            Self::Int(i) => write!(f, "{i}i32"),
            Self::Long(l) => write!(f, "{l}i64"),
            Self::Float(x) => write!(f, "{x}f32"),
            Self::Double(x) => write!(f, "{x}f64"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Object(o) => o.fmt(f),
            Self::Type(t) => write!(f, "HostType({})", t.name()),
            Self::Delegate(d) => d.fmt(f),
            Self::Script(v) => v.fmt(f),
        }
    }
}

// ── conversions into HostValue ───────────────────────────────

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for HostValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<i64> for HostValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<u32> for HostValue {
    fn from(value: u32) -> Self {
        Self::Long(i64::from(value))
    }
}

impl From<f32> for HostValue {
    fn from(value: f32) -> Self {
        Self::Float(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<HostObjectRef> for HostValue {
    fn from(value: HostObjectRef) -> Self {
        Self::Object(value)
    }
}

impl From<HostTypeRef> for HostValue {
    fn from(value: HostTypeRef) -> Self {
        Self::Type(value)
    }
}

impl From<HostDelegate> for HostValue {
    fn from(value: HostDelegate) -> Self {
        Self::Delegate(value)
    }
}

impl From<ScriptRef> for HostValue {
    fn from(value: ScriptRef) -> Self {
        Self::Script(value)
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

// ── typed extraction ─────────────────────────────────────────

/// Typed extraction used by `evaluate_as`, `call_function_as` and the
/// typed delegate constructors.
pub trait FromHostValue: Sized {
    fn from_host_value(value: HostValue) -> Result<Self>;
}

fn mismatch(value: &HostValue, target: &str) -> Error {
    Error::usage(format!(
        "Cannot convert {} value {value:?} to {target}",
        value.variant_name()
    ))
}

impl FromHostValue for HostValue {
    fn from_host_value(value: HostValue) -> Result<Self> {
        Ok(value)
    }
}

impl FromHostValue for bool {
    fn from_host_value(value: HostValue) -> Result<Self> {
        value.as_bool().ok_or_else(|| mismatch(&value, "bool"))
    }
}

impl FromHostValue for i32 {
    fn from_host_value(value: HostValue) -> Result<Self> {
        value.coerce_i32().ok_or_else(|| mismatch(&value, "i32"))
    }
}

impl FromHostValue for i64 {
    fn from_host_value(value: HostValue) -> Result<Self> {
        value.coerce_i64().ok_or_else(|| mismatch(&value, "i64"))
    }
}

impl FromHostValue for f64 {
    fn from_host_value(value: HostValue) -> Result<Self> {
        value.coerce_f64().ok_or_else(|| mismatch(&value, "f64"))
    }
}

impl FromHostValue for f32 {
    fn from_host_value(value: HostValue) -> Result<Self> {
        match value {
            HostValue::Float(f) => Ok(f),
            ref other => other
                .coerce_f64()
                .map(|d| d as f32)
                .ok_or_else(|| mismatch(other, "f32")),
        }
    }
}

impl FromHostValue for String {
    fn from_host_value(value: HostValue) -> Result<Self> {
        match value {
            HostValue::String(s) => Ok(s),
            other => Err(mismatch(&other, "String")),
        }
    }
}

impl FromHostValue for HostObjectRef {
    fn from_host_value(value: HostValue) -> Result<Self> {
        match value {
            HostValue::Object(o) => Ok(o),
            other => Err(mismatch(&other, "host object")),
        }
    }
}

impl FromHostValue for HostTypeRef {
    fn from_host_value(value: HostValue) -> Result<Self> {
        match value {
            HostValue::Type(t) => Ok(t),
            other => Err(mismatch(&other, "host type")),
        }
    }
}

impl FromHostValue for HostDelegate {
    fn from_host_value(value: HostValue) -> Result<Self> {
        match value {
            HostValue::Delegate(d) => Ok(d),
            other => Err(mismatch(&other, "host delegate")),
        }
    }
}

impl<T: FromHostValue> FromHostValue for Option<T> {
    fn from_host_value(value: HostValue) -> Result<Self> {
        match value {
            HostValue::Undefined | HostValue::Null => Ok(None),
            other => T::from_host_value(other).map(Some),
        }
    }
}
