use std::collections::BTreeMap;
use std::sync::Arc;

use crate::foundation::error::{FramegraphError, FramegraphResult};
use crate::ops::OperationKind;

/// Name-keyed table of operation kinds consulted by the graph builder.
///
/// Iteration order is by name, so dumps and error listings are stable.
#[derive(Clone, Debug)]
pub struct OperationRegistry {
    kinds: BTreeMap<String, Arc<OperationKind>>,
}

impl OperationRegistry {
    /// Registry without any kinds.
    pub fn empty() -> Self {
        Self {
            kinds: BTreeMap::new(),
        }
    }

    /// Registry pre-populated with the built-in kinds.
    pub fn with_builtins() -> Self {
        let mut reg = Self::empty();
        for kind in super::builtins::all() {
            reg.kinds.insert(kind.name.to_string(), Arc::new(kind));
        }
        reg
    }

    /// Add a kind. Names must be unique and arity must be at least one.
    pub fn register(&mut self, kind: OperationKind) -> FramegraphResult<()> {
        if kind.arity == 0 {
            return Err(FramegraphError::validation(format!(
                "operation kind '{}' must take at least one input",
                kind.name
            )));
        }
        if self.kinds.contains_key(kind.name.as_ref()) {
            return Err(FramegraphError::validation(format!(
                "operation kind '{}' is already registered",
                kind.name
            )));
        }
        tracing::debug!(kind = %kind.name, arity = kind.arity, "registered operation kind");
        self.kinds.insert(kind.name.to_string(), Arc::new(kind));
        Ok(())
    }

    /// Look up a kind by name.
    pub fn get(&self, name: &str) -> Option<Arc<OperationKind>> {
        self.kinds.get(name).cloned()
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
