//! Object heap with mark-sweep collection.

use std::rc::Rc;

use super::ast::FunctionDef;
use crate::runtime::ExternalData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ObjectId(u32);

impl ObjectId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Object(ObjectId),
}

impl Value {
    pub(crate) fn string(s: &str) -> Self {
        Self::Str(Rc::from(s))
    }

    pub(crate) fn as_object(&self) -> Option<ObjectId> {
        match self {
            Self::Object(id) => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorKind {
    Error,
    TypeError,
    RangeError,
    ReferenceError,
    SyntaxError,
}

impl ErrorKind {
    pub(crate) const ALL: [Self; 5] = [
        Self::Error,
        Self::TypeError,
        Self::RangeError,
        Self::ReferenceError,
        Self::SyntaxError,
    ];

    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::TypeError => "TypeError",
            Self::RangeError => "RangeError",
            Self::ReferenceError => "ReferenceError",
            Self::SyntaxError => "SyntaxError",
        }
    }
}

/// Built-in callables installed on the global object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NativeFunction {
    Object,
    String,
    Number,
    Boolean,
    Error(ErrorKind),
}

impl NativeFunction {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Object => "Object",
            Self::String => "String",
            Self::Number => "Number",
            Self::Boolean => "Boolean",
            Self::Error(kind) => kind.name(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum ObjectKind {
    Ordinary,
    Array(Vec<Value>),
    Function { def: Rc<FunctionDef>, scope: ObjectId },
    Native(NativeFunction),
    External(ExternalData),
    Error,
    /// Activation record of a script function call.
    Scope { parent: ObjectId },
}

impl ObjectKind {
    pub(crate) fn is_callable(&self) -> bool {
        match self {
            Self::Function { .. } | Self::Native(_) => true,
            Self::External(data) => data.kind != crate::runtime::EmbeddingKind::Object,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub(crate) struct HeapObject {
    pub(crate) kind: ObjectKind,
    properties: Vec<(Rc<str>, Value)>,
    marked: bool,
}

impl HeapObject {
    pub(crate) fn get(&self, name: &str) -> Option<&Value> {
        self.properties
            .iter()
            .find(|(key, _)| &**key == name)
            .map(|(_, value)| value)
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(|(key, _)| &**key)
    }
}

/// Result of a collection.
#[derive(Debug, Default)]
pub(crate) struct Sweep {
    pub(crate) freed: usize,
    pub(crate) finalized: Vec<ExternalData>,
}

#[derive(Debug, Default)]
pub(crate) struct Heap {
    slots: Vec<Option<HeapObject>>,
    free: Vec<u32>,
    live: usize,
}

impl Heap {
    pub(crate) fn alloc(&mut self, kind: ObjectKind) -> ObjectId {
        let object = HeapObject {
            kind,
            properties: Vec::new(),
            marked: false,
        };
        self.live += 1;
        if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(object);
            return ObjectId(index);
        }
        self.slots.push(Some(object));
        ObjectId((self.slots.len() - 1) as u32)
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }

    pub(crate) fn object(&self, id: ObjectId) -> Option<&HeapObject> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn object_mut(&mut self, id: ObjectId) -> Option<&mut HeapObject> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub(crate) fn kind(&self, id: ObjectId) -> Option<&ObjectKind> {
        self.object(id).map(|o| &o.kind)
    }

    pub(crate) fn get(&self, id: ObjectId, name: &str) -> Option<Value> {
        self.object(id).and_then(|o| o.get(name)).cloned()
    }

    pub(crate) fn has(&self, id: ObjectId, name: &str) -> bool {
        self.object(id).is_some_and(|o| o.get(name).is_some())
    }

    pub(crate) fn set(&mut self, id: ObjectId, name: &str, value: Value) {
        let Some(object) = self.object_mut(id) else {
            return;
        };
        if let Some(slot) = object
            .properties
            .iter_mut()
            .find(|(key, _)| &**key == name)
        {
            slot.1 = value;
        } else {
            object.properties.push((Rc::from(name), value));
        }
    }

    pub(crate) fn delete(&mut self, id: ObjectId, name: &str) -> bool {
        let Some(object) = self.object_mut(id) else {
            return false;
        };
        let before = object.properties.len();
        object.properties.retain(|(key, _)| &**key != name);
        object.properties.len() != before
    }

    pub(crate) fn keys(&self, id: ObjectId) -> Vec<String> {
        self.object(id)
            .map(|o| o.keys().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Mark from `roots`, free everything unreached. External objects that
    /// die are reported so the host can drop its side.
    pub(crate) fn collect(&mut self, roots: impl IntoIterator<Item = ObjectId>) -> Sweep {
        let mut stack: Vec<ObjectId> = roots.into_iter().collect();
        while let Some(id) = stack.pop() {
            let Some(object) = self.slots.get_mut(id.index()).and_then(Option::as_mut) else {
                continue;
            };
            if object.marked {
                continue;
            }
            object.marked = true;
            stack.extend(object.properties.iter().filter_map(|(_, v)| v.as_object()));
            match &object.kind {
                ObjectKind::Array(elements) => {
                    stack.extend(elements.iter().filter_map(Value::as_object));
                }
                ObjectKind::Function { scope, .. } => stack.push(*scope),
                ObjectKind::Scope { parent } => stack.push(*parent),
                _ => {}
            }
        }

        let mut sweep = Sweep::default();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(object) = slot else {
                continue;
            };
            if object.marked {
                object.marked = false;
                continue;
            }
            if let ObjectKind::External(data) = object.kind {
                sweep.finalized.push(data);
            }
            *slot = None;
            self.free.push(index as u32);
            sweep.freed += 1;
        }
        self.live -= sweep.freed;
        sweep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::EmbeddingKind;

    #[test]
    fn properties_keep_insertion_order() {
        let mut heap = Heap::default();
        let id = heap.alloc(ObjectKind::Ordinary);
        heap.set(id, "b", Value::Number(1.0));
        heap.set(id, "a", Value::Number(2.0));
        heap.set(id, "b", Value::Number(3.0));
        assert_eq!(heap.keys(id), ["b", "a"]);
        assert_eq!(heap.get(id, "b"), Some(Value::Number(3.0)));
        assert!(heap.delete(id, "b"));
        assert!(!heap.delete(id, "b"));
        assert!(!heap.has(id, "b"));
    }

    #[test]
    fn collect_frees_unreachable_and_reports_externals() {
        let mut heap = Heap::default();
        let root = heap.alloc(ObjectKind::Ordinary);
        let kept = heap.alloc(ObjectKind::Array(Vec::new()));
        let data = ExternalData {
            kind: EmbeddingKind::Object,
            key: 7,
            generation: 1,
        };
        let external = heap.alloc(ObjectKind::External(data));
        heap.set(root, "kept", Value::Object(kept));
        if let Some(ObjectKind::Array(elements)) = heap.object_mut(kept).map(|o| &mut o.kind) {
            elements.push(Value::Object(external));
        }
        let garbage = heap.alloc(ObjectKind::External(ExternalData { key: 8, ..data }));

        let sweep = heap.collect([root]);
        assert_eq!(sweep.freed, 1);
        assert_eq!(sweep.finalized[0].key, 8);
        assert!(heap.object(garbage).is_none());
        assert_eq!(heap.live(), 3);

        heap.delete(root, "kept");
        let sweep = heap.collect([root]);
        assert_eq!(sweep.freed, 2);
        assert_eq!(sweep.finalized, vec![data]);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::default();
        let root = heap.alloc(ObjectKind::Ordinary);
        let dead = heap.alloc(ObjectKind::Ordinary);
        heap.collect([root]);
        let reused = heap.alloc(ObjectKind::Ordinary);
        assert_eq!(reused, dead);
    }

    #[test]
    fn cycles_are_collected() {
        let mut heap = Heap::default();
        let root = heap.alloc(ObjectKind::Ordinary);
        let a = heap.alloc(ObjectKind::Ordinary);
        let b = heap.alloc(ObjectKind::Ordinary);
        heap.set(a, "b", Value::Object(b));
        heap.set(b, "a", Value::Object(a));
        assert_eq!(heap.collect([root]).freed, 2);
    }
}
