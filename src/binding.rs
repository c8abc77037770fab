//! Input bindings: the forward-pointer-before-value-exists model
//!
//! A binding is an explicit tagged value, never a nullable sentinel. Lazy
//! references carry no value of their own; they dereference through the
//! result store once the producer is Done.

use std::sync::Arc;

use serde_json::Value;

/// Position of a task within its enclosing workflow (registration order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Unresolved pointer to another task's future output
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LazyOutputRef {
    pub producer: NodeId,
    pub slot: Arc<str>,
}

/// A concrete input binding on a task instance
#[derive(Debug, Clone)]
pub enum Binding {
    /// Literal value, fixed at graph construction
    Literal(Value),
    /// Lazy reference to another task's output slot
    Ref(LazyOutputRef),
    /// One of the enclosing workflow's own input slots
    Input(Arc<str>),
}

impl Binding {
    pub fn literal(value: impl Into<Value>) -> Self {
        Binding::Literal(value.into())
    }

    pub fn input(name: &str) -> Self {
        Binding::Input(name.into())
    }
}

impl From<LazyOutputRef> for Binding {
    fn from(reference: LazyOutputRef) -> Self {
        Binding::Ref(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn literal_binding_from_json() {
        match Binding::literal(json!([1, 2, 3])) {
            Binding::Literal(v) => assert_eq!(v, json!([1, 2, 3])),
            _ => panic!("expected literal"),
        }
    }

    #[test]
    fn ref_binding_from_lazy_ref() {
        let r = LazyOutputRef {
            producer: NodeId(2),
            slot: "out".into(),
        };
        match Binding::from(r.clone()) {
            Binding::Ref(inner) => assert_eq!(inner, r),
            _ => panic!("expected ref"),
        }
    }
}
