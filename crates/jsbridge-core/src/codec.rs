//! Bidirectional value conversion between host and script.
//!
//! Primitives map directly. Host objects, types and delegates become
//! external script objects through the [`EmbeddingRegistry`], and external
//! objects coming back unwrap to the original host value. Anything else on
//! the script side stays an opaque [`HostValue::Script`] handle, pinned in
//! the runtime until the host drops it.
//!
//! Script numbers are narrowed: integral values in the exact-integer range
//! come back as `Int` or `Long`, non-integral values that survive a
//! round trip through `f32` come back as `Float`, everything else as
//! `Double`.

use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};

use crate::registry::EmbeddingRegistry;
use crate::runtime::{NativeError, NativeResult, ScriptRuntime, ScriptValue, ScriptValueType};
use crate::value::{HostValue, ScriptRef};

/// Largest integer a double represents exactly (2^53 - 1).
pub const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Narrow a script number to the smallest host numeric variant that holds
/// it exactly.
#[must_use]
pub fn narrow_number(value: f64) -> HostValue {
    if !value.is_finite() {
        return HostValue::Double(value);
    }
    if value.fract() == 0.0 {
        if value.abs() <= MAX_SAFE_INTEGER {
            let long = value as i64;
            return i32::try_from(long).map_or(HostValue::Long(long), HostValue::Int);
        }
        return HostValue::Double(value);
    }
    let narrowed = value as f32;
    if f64::from(narrowed) == value {
        HostValue::Float(narrowed)
    } else {
        HostValue::Double(value)
    }
}

/// Converts values across the boundary for one engine.
#[derive(Debug, Clone)]
pub struct ValueCodec {
    registry: Arc<EmbeddingRegistry>,
    unpin: Sender<ScriptValue>,
    unpinned: Receiver<ScriptValue>,
}

impl ValueCodec {
    #[must_use]
    pub fn new(registry: Arc<EmbeddingRegistry>) -> Self {
        let (unpin, unpinned) = channel::unbounded();
        Self {
            registry,
            unpin,
            unpinned,
        }
    }

    /// Apply the unpins of every [`ScriptRef`] the host has dropped since
    /// the last call. Runs on the runtime's thread.
    pub fn release_dropped(&self, runtime: &mut dyn ScriptRuntime) -> usize {
        let mut released = 0;
        for value in self.unpinned.try_iter() {
            runtime.release(value);
            released += 1;
        }
        released
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<EmbeddingRegistry> {
        &self.registry
    }

    pub fn to_script(
        &self,
        runtime: &mut dyn ScriptRuntime,
        value: &HostValue,
    ) -> NativeResult<ScriptValue> {
        Ok(match value {
            HostValue::Undefined => runtime.undefined(),
            HostValue::Null => runtime.null(),
            HostValue::Bool(b) => runtime.boolean(*b),
            HostValue::Int(i) => runtime.number(f64::from(*i)),
            HostValue::Long(l) => runtime.number(*l as f64),
            HostValue::Float(f) => runtime.number(f64::from(*f)),
            HostValue::Double(d) => runtime.number(*d),
            HostValue::String(s) => runtime.string(s),
            HostValue::Script(handle) => {
                if !handle.issued_by(&self.unpin) {
                    return Err(NativeError::InvalidUsage(
                        "script value belongs to a different engine".to_string(),
                    ));
                }
                handle.value()
            }
            HostValue::Object(_) | HostValue::Type(_) | HostValue::Delegate(_) => {
                self.registry.get_or_create(runtime, value.clone())?
            }
        })
    }

    pub fn to_host(
        &self,
        runtime: &mut dyn ScriptRuntime,
        value: ScriptValue,
    ) -> NativeResult<HostValue> {
        Ok(match runtime.value_type(value)? {
            ScriptValueType::Undefined => HostValue::Undefined,
            ScriptValueType::Null => HostValue::Null,
            ScriptValueType::Boolean => HostValue::Bool(runtime.to_boolean(value)?),
            ScriptValueType::Number => narrow_number(runtime.to_number(value)?),
            ScriptValueType::String => HostValue::String(runtime.to_string_value(value)?),
            ScriptValueType::Object
            | ScriptValueType::Function
            | ScriptValueType::Array
            | ScriptValueType::Error => {
                let object = runtime.convert_to_object(value)?;
                match runtime
                    .external_data(object)
                    .and_then(|data| self.registry.lookup(data))
                {
                    Some(host) => host,
                    None => {
                        runtime.add_ref(object);
                        HostValue::Script(ScriptRef::pinned(object, self.unpin.clone()))
                    }
                }
            }
        })
    }

    pub fn to_script_args(
        &self,
        runtime: &mut dyn ScriptRuntime,
        values: &[HostValue],
    ) -> NativeResult<Vec<ScriptValue>> {
        values.iter().map(|v| self.to_script(runtime, v)).collect()
    }

    pub fn to_host_args(
        &self,
        runtime: &mut dyn ScriptRuntime,
        values: &[ScriptValue],
    ) -> NativeResult<Vec<HostValue>> {
        values.iter().map(|v| self.to_host(runtime, *v)).collect()
    }
}
