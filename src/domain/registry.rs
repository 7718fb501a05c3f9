// Process-wide table of custom operators
//
// Indices are handed out in registration order and never change, so a
// `CustomOperator` stored in one model means the same thing in any other.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, OnceLock};

/// Custom operators the evaluator and both lowerings understand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Sum,
    Avg,
    Count,
    Min,
    Max,
    Abs,
    Pow,
    IfThenElse,
    NAryIf,
    ElementOf,
    NotElementOf,
    At,
}

const BUILTINS: [(&str, Builtin); 12] = [
    ("sum", Builtin::Sum),
    ("avg", Builtin::Avg),
    ("count", Builtin::Count),
    ("min", Builtin::Min),
    ("max", Builtin::Max),
    ("abs", Builtin::Abs),
    ("pow", Builtin::Pow),
    ("if_then_else", Builtin::IfThenElse),
    ("n_ary_if", Builtin::NAryIf),
    ("element_of", Builtin::ElementOf),
    ("not_element_of", Builtin::NotElementOf),
    ("at", Builtin::At),
];

impl Builtin {
    pub fn name(&self) -> &'static str {
        BUILTINS[*self as usize].0
    }

    /// Whether a `collection(k)` node may appear among the operands
    pub fn accepts_collection(&self) -> bool {
        matches!(
            self,
            Builtin::Count
                | Builtin::Sum
                | Builtin::Avg
                | Builtin::Min
                | Builtin::Max
                | Builtin::ElementOf
                | Builtin::NotElementOf
                | Builtin::At
        )
    }
}

struct Registry {
    names: Vec<String>,
    indices: HashMap<String, u32>,
}

impl Registry {
    fn seeded() -> Self {
        let mut registry = Registry {
            names: Vec::new(),
            indices: HashMap::new(),
        };
        for (name, _) in BUILTINS {
            registry.insert(name);
        }
        registry
    }

    fn insert(&mut self, name: &str) -> u32 {
        if let Some(&index) = self.indices.get(name) {
            return index;
        }
        let index = self.names.len() as u32;
        self.names.push(name.to_string());
        self.indices.insert(name.to_string(), index);
        index
    }
}

fn registry() -> MutexGuard<'static, Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY
        .get_or_init(|| Mutex::new(Registry::seeded()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to a registered custom operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CustomOperator(u32);

impl CustomOperator {
    /// Look up `name`, registering it on first use
    pub fn named(name: &str) -> Self {
        Self(registry().insert(name))
    }

    pub fn builtin(builtin: Builtin) -> Self {
        // builtins are seeded first, in declaration order
        Self(builtin as u32)
    }

    pub fn index(&self) -> u32 {
        self.0
    }

    pub fn name(&self) -> String {
        registry()
            .names
            .get(self.0 as usize)
            .cloned()
            .unwrap_or_else(|| format!("custom#{}", self.0))
    }

    pub fn as_builtin(&self) -> Option<Builtin> {
        BUILTINS.get(self.0 as usize).map(|(_, builtin)| *builtin)
    }
}

impl From<Builtin> for CustomOperator {
    fn from(builtin: Builtin) -> Self {
        Self::builtin(builtin)
    }
}

impl fmt::Display for CustomOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_builtin() {
            Some(builtin) => write!(f, "{}", builtin.name()),
            None => write!(f, "{}", self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_have_their_declaration_index() {
        for (position, (name, builtin)) in BUILTINS.iter().enumerate() {
            let op = CustomOperator::named(name);
            assert_eq!(op.index() as usize, position);
            assert_eq!(op.as_builtin(), Some(*builtin));
            assert_eq!(CustomOperator::builtin(*builtin), op);
        }
    }

    #[test]
    fn user_operators_are_stable() {
        let first = CustomOperator::named("registry_test_hypot");
        let second = CustomOperator::named("registry_test_hypot");
        assert_eq!(first, second);
        assert!(first.as_builtin().is_none());
        assert_eq!(first.to_string(), "registry_test_hypot");
    }
}
