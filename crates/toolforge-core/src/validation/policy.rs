//! Import policy gate: deny wins, unknown modules are denied.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::syntax::SourceIndex;
use crate::domain::ValidationFault;

pub const STANDARD_ALLOWED: &[&str] = &[
    "__future__",
    "json",
    "re",
    "math",
    "datetime",
    "typing",
    "dataclasses",
    "collections",
    "itertools",
    "functools",
    "string",
    "statistics",
    "decimal",
    "fractions",
];

pub const STANDARD_DENIED: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "ctypes",
    "multiprocessing",
    "threading",
    "importlib",
    "builtins",
    "shutil",
    "pickle",
];

pub const STANDARD_NETWORK: &[&str] = &["socket", "http", "urllib", "requests", "httpx"];

/// Verdict for one imported module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleVerdict {
    Allowed,
    Denied { reason: String },
}

impl ModuleVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ModuleVerdict::Allowed)
    }
}

/// Module allow/deny sets.
///
/// Network modules are refused unless `network_enabled`, in which case they
/// join the allow set. The deny set still wins over them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationPolicy {
    pub allowed: BTreeSet<String>,
    pub denied: BTreeSet<String>,
    pub network_modules: BTreeSet<String>,
    pub network_enabled: bool,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

impl ValidationPolicy {
    pub fn standard() -> Self {
        Self {
            allowed: set(STANDARD_ALLOWED),
            denied: set(STANDARD_DENIED),
            network_modules: set(STANDARD_NETWORK),
            network_enabled: false,
        }
    }

    pub fn with_network(mut self, enabled: bool) -> Self {
        self.network_enabled = enabled;
        self
    }

    /// Evaluate a dotted module path against the sets.
    ///
    /// The top-level package decides: `os.path` is judged as `os`. An entry
    /// naming the full dotted path is honored too.
    pub fn evaluate(&self, module: &str) -> ModuleVerdict {
        if module.starts_with('.') {
            return ModuleVerdict::Denied {
                reason: "relative import".to_string(),
            };
        }
        let root = module.split('.').next().unwrap_or(module);
        let listed = |s: &BTreeSet<String>| s.contains(root) || s.contains(module);
        let network = listed(&self.network_modules);

        if listed(&self.denied) {
            return ModuleVerdict::Denied {
                reason: format!("{root} is denied"),
            };
        }
        if network {
            return if self.network_enabled {
                ModuleVerdict::Allowed
            } else {
                ModuleVerdict::Denied {
                    reason: format!("{root} requires network access"),
                }
            };
        }
        if listed(&self.allowed) {
            return ModuleVerdict::Allowed;
        }
        ModuleVerdict::Denied {
            reason: format!("{root} is not on the allow list"),
        }
    }
}

/// Gate 2: every import must resolve to an allowed module.
pub fn check(index: &SourceIndex, policy: &ValidationPolicy) -> Result<(), ValidationFault> {
    let mut offending: Vec<String> = Vec::new();
    for import in &index.imports {
        if !policy.evaluate(&import.module).is_allowed() && !offending.contains(&import.module) {
            offending.push(import.module.clone());
        }
    }
    if offending.is_empty() {
        Ok(())
    } else {
        Err(ValidationFault::Policy { offending })
    }
}
