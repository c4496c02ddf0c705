//! Dotted property paths (`products.item.price`) resolved against a root
//! script object.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::runtime::{NativeError, NativeResult, ScriptRuntime, ScriptValue, ScriptValueType};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("property path is empty")]
    Empty,
    #[error("property path '{path}' has an empty segment at position {position}")]
    EmptySegment { path: String, position: usize },
}

/// A parsed, non-empty property path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyPath {
    segments: Vec<String>,
}

impl PropertyPath {
    pub fn parse(path: &str) -> Result<Self, PathError> {
        if path.is_empty() {
            return Err(PathError::Empty);
        }
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if let Some(position) = segments.iter().position(String::is_empty) {
            return Err(PathError::EmptySegment {
                path: path.to_string(),
                position,
            });
        }
        Ok(Self { segments })
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    #[must_use]
    pub fn is_simple(&self) -> bool {
        self.segments.len() == 1
    }

    /// Every segment but the last.
    #[must_use]
    pub fn parents(&self) -> &[String] {
        &self.segments[..self.segments.len() - 1]
    }

    #[must_use]
    pub fn last(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    /// The first `len` segments joined with dots.
    #[must_use]
    pub fn prefix(&self, len: usize) -> String {
        self.segments[..len.min(self.segments.len())].join(".")
    }
}

impl FromStr for PropertyPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

fn is_object(runtime: &dyn ScriptRuntime, value: ScriptValue) -> NativeResult<bool> {
    Ok(!runtime.value_type(value)?.is_primitive())
}

fn is_absent(runtime: &dyn ScriptRuntime, value: ScriptValue) -> NativeResult<bool> {
    Ok(matches!(
        runtime.value_type(value)?,
        ScriptValueType::Undefined | ScriptValueType::Null
    ))
}

enum Walk {
    Parent(ScriptValue),
    Missing { depth: usize },
}

/// Resolves [`PropertyPath`]s against a root object.
///
/// `root_name` is only used in error messages.
pub struct PropertyPathResolver;

impl PropertyPathResolver {
    fn walk(
        runtime: &mut dyn ScriptRuntime,
        root: ScriptValue,
        path: &PropertyPath,
    ) -> NativeResult<Walk> {
        let mut current = root;
        for (index, segment) in path.parents().iter().enumerate() {
            if !runtime.has_property(current, segment)? {
                return Ok(Walk::Missing { depth: index + 1 });
            }
            let next = runtime.get_property(current, segment)?;
            if !is_object(runtime, next)? {
                return Ok(Walk::Missing { depth: index + 1 });
            }
            current = next;
        }
        Ok(Walk::Parent(current))
    }

    /// `false` when any segment is missing or the final value is undefined.
    pub fn has(
        runtime: &mut dyn ScriptRuntime,
        root: ScriptValue,
        path: &PropertyPath,
    ) -> NativeResult<bool> {
        let Walk::Parent(parent) = Self::walk(runtime, root, path)? else {
            return Ok(false);
        };
        if !runtime.has_property(parent, path.last())? {
            return Ok(false);
        }
        let value = runtime.get_property(parent, path.last())?;
        Ok(runtime.value_type(value)? != ScriptValueType::Undefined)
    }

    /// Value of the final segment. Missing intermediates are an error.
    pub fn get(
        runtime: &mut dyn ScriptRuntime,
        root: ScriptValue,
        root_name: &str,
        path: &PropertyPath,
    ) -> NativeResult<ScriptValue> {
        match Self::walk(runtime, root, path)? {
            Walk::Parent(parent) => runtime.get_property(parent, path.last()),
            Walk::Missing { depth } => Err(NativeError::MissingProperty {
                owner: root_name.to_string(),
                path: path.prefix(depth),
            }),
        }
    }

    /// Assign the final segment, creating empty objects for missing or
    /// undefined intermediates. A primitive intermediate is an error.
    pub fn set(
        runtime: &mut dyn ScriptRuntime,
        root: ScriptValue,
        root_name: &str,
        path: &PropertyPath,
        value: ScriptValue,
    ) -> NativeResult<()> {
        let mut current = root;
        for (index, segment) in path.parents().iter().enumerate() {
            let existing = if runtime.has_property(current, segment)? {
                Some(runtime.get_property(current, segment)?)
            } else {
                None
            };
            current = match existing {
                Some(next) if is_object(runtime, next)? => next,
                Some(next) if !is_absent(runtime, next)? => {
                    return Err(NativeError::TypeMismatch(format!(
                        "Cannot create property '{}' on primitive value '{}' \
                         of object '{root_name}'",
                        path.segments()[index + 1],
                        path.prefix(index + 1),
                    )));
                }
                _ => {
                    let created = runtime.create_object()?;
                    runtime.set_property(current, segment, created)?;
                    created
                }
            };
        }
        runtime.set_property(current, path.last(), value)
    }

    /// Delete the final segment. Missing intermediates are an error; a
    /// missing final segment is not.
    pub fn remove(
        runtime: &mut dyn ScriptRuntime,
        root: ScriptValue,
        root_name: &str,
        path: &PropertyPath,
    ) -> NativeResult<()> {
        match Self::walk(runtime, root, path)? {
            Walk::Parent(parent) => {
                runtime.delete_property(parent, path.last())?;
                Ok(())
            }
            Walk::Missing { depth } => Err(NativeError::MissingProperty {
                owner: root_name.to_string(),
                path: path.prefix(depth),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRuntime;
    use proptest::prelude::*;

    fn runtime_with(script: &str) -> (MemoryRuntime, ScriptValue) {
        let mut rt = MemoryRuntime::new();
        rt.run_script(script, "test").unwrap();
        let global = rt.global_object().unwrap();
        let root = rt.get_property(global, "shop").unwrap();
        (rt, root)
    }

    fn path(text: &str) -> PropertyPath {
        PropertyPath::parse(text).unwrap()
    }

    // ── parsing ──────────────────────────────────────────────

    #[test]
    fn parse_splits_segments() {
        let p = path("products.item.price");
        assert_eq!(p.segments(), ["products", "item", "price"]);
        assert_eq!(p.parents(), ["products", "item"]);
        assert_eq!(p.last(), "price");
        assert_eq!(p.prefix(2), "products.item");
        assert_eq!(p.to_string(), "products.item.price");
        assert!(!p.is_simple());
    }

    #[test]
    fn parse_rejects_empty_segments() {
        assert_eq!(PropertyPath::parse(""), Err(PathError::Empty));
        assert!(matches!(
            PropertyPath::parse("a..b"),
            Err(PathError::EmptySegment { position: 1, .. })
        ));
        assert!(PropertyPath::parse(".a").is_err());
        assert!(PropertyPath::parse("a.").is_err());
    }

    proptest! {
        #[test]
        fn parse_display_roundtrip(
            segments in prop::collection::vec("[A-Za-z_][A-Za-z0-9_]{0,6}", 1..5)
        ) {
            let text = segments.join(".");
            let parsed: PropertyPath = text.parse().unwrap();
            prop_assert_eq!(parsed.segments(), segments.as_slice());
            prop_assert_eq!(parsed.to_string(), text);
        }
    }

    // ── get / has ────────────────────────────────────────────

    #[test]
    fn get_nested_value() {
        let (mut rt, root) = runtime_with("var shop = { products: { item: { price: 12 } } };");
        let price = path("products.item.price");
        let value = PropertyPathResolver::get(&mut rt, root, "shop", &price).unwrap();
        assert_eq!(rt.to_number(value).unwrap(), 12.0);
    }

    #[test]
    fn get_missing_intermediate_names_prefix() {
        let (mut rt, root) = runtime_with("var shop = { products: {} };");
        let err = PropertyPathResolver::get(&mut rt, root, "shop", &path("products.missing.price"))
            .unwrap_err();
        match err {
            NativeError::MissingProperty { owner, path } => {
                assert_eq!(owner, "shop");
                assert_eq!(path, "products.missing");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn has_treats_undefined_as_absent() {
        let (mut rt, root) = runtime_with("var shop = { a: { b: undefined, c: 0 } };");
        assert!(!PropertyPathResolver::has(&mut rt, root, &path("a.b")).unwrap());
        assert!(PropertyPathResolver::has(&mut rt, root, &path("a.c")).unwrap());
        assert!(!PropertyPathResolver::has(&mut rt, root, &path("a.d")).unwrap());
        assert!(!PropertyPathResolver::has(&mut rt, root, &path("x.y.z")).unwrap());
    }

    // ── set ──────────────────────────────────────────────────

    #[test]
    fn set_auto_vivifies_intermediates() {
        let (mut rt, root) = runtime_with("var shop = {};");
        let price = rt.number(9.5);
        let target = path("products.item.price");
        PropertyPathResolver::set(&mut rt, root, "shop", &target, price).unwrap();
        let value = PropertyPathResolver::get(&mut rt, root, "shop", &target).unwrap();
        assert_eq!(rt.to_number(value).unwrap(), 9.5);
    }

    #[test]
    fn set_replaces_undefined_intermediate() {
        let (mut rt, root) = runtime_with("var shop = { products: undefined };");
        let v = rt.number(1.0);
        PropertyPathResolver::set(&mut rt, root, "shop", &path("products.count"), v).unwrap();
        assert!(PropertyPathResolver::has(&mut rt, root, &path("products.count")).unwrap());
    }

    #[test]
    fn set_through_primitive_fails() {
        let (mut rt, root) = runtime_with("var shop = { products: 5 };");
        let v = rt.number(1.0);
        let err = PropertyPathResolver::set(&mut rt, root, "shop", &path("products.count"), v)
            .unwrap_err();
        assert!(matches!(err, NativeError::TypeMismatch(_)));
    }

    // ── remove ───────────────────────────────────────────────

    #[test]
    fn remove_final_segment() {
        let (mut rt, root) = runtime_with("var shop = { a: { b: 1 } };");
        PropertyPathResolver::remove(&mut rt, root, "shop", &path("a.b")).unwrap();
        assert!(!PropertyPathResolver::has(&mut rt, root, &path("a.b")).unwrap());
        // Removing an absent final segment is not an error.
        PropertyPathResolver::remove(&mut rt, root, "shop", &path("a.b")).unwrap();
    }

    #[test]
    fn remove_missing_intermediate_fails() {
        let (mut rt, root) = runtime_with("var shop = {};");
        let err = PropertyPathResolver::remove(&mut rt, root, "shop", &path("a.b")).unwrap_err();
        assert!(matches!(err, NativeError::MissingProperty { .. }));
    }
}
