//! # Sheet Value Precedence
//!
//! A partial order over sheet status values. An automatic CRM-originated
//! update never overwrites a sheet value that outranks it.
//!
//! ```text
//!   rule: "Успешно" outranks ["У курера"]
//!
//!   sheet shows "Успешно", CRM reports "У курера"  →  suppressed
//!   sheet shows "У курера", CRM reports "Успешно"  →  written
//!   sheet shows "Отказ",   CRM reports "У курера"  →  written (unordered)
//! ```
//!
//! Rules compose transitively: `A > B` and `B > C` implies `A > C`.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// One configured ordering rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecedenceRule {
    /// The higher-ranked sheet value.
    pub status: String,

    /// Values it outranks.
    #[serde(default)]
    pub outranks: Vec<String>,
}

/// Default rules: a sale marked successful is not demoted back to "with courier".
pub fn default_rules() -> Vec<PrecedenceRule> {
    vec![PrecedenceRule {
        status: "Успешно".to_string(),
        outranks: vec!["У курера".to_string()],
    }]
}

/// Transitively closed precedence relation.
#[derive(Debug, Clone, Default)]
pub struct PrecedenceTable {
    below: HashMap<String, HashSet<String>>,
}

impl PrecedenceTable {
    /// Builds the closure of `rules`. A rule set in which some value ends up
    /// outranking itself is rejected.
    pub fn new(rules: &[PrecedenceRule]) -> CoreResult<Self> {
        let mut direct: HashMap<&str, Vec<&str>> = HashMap::new();
        for rule in rules {
            direct
                .entry(rule.status.as_str())
                .or_default()
                .extend(rule.outranks.iter().map(String::as_str));
        }

        let mut below = HashMap::new();
        for &start in direct.keys() {
            let mut reached: HashSet<String> = HashSet::new();
            let mut stack: Vec<&str> = direct[start].clone();
            while let Some(next) = stack.pop() {
                if next == start {
                    return Err(CoreError::PrecedenceCycle(start.to_string()));
                }
                if reached.insert(next.to_string()) {
                    if let Some(children) = direct.get(next) {
                        stack.extend(children.iter().copied());
                    }
                }
            }
            below.insert(start.to_string(), reached);
        }

        Ok(PrecedenceTable { below })
    }

    /// Whether `higher` strictly outranks `lower`.
    pub fn outranks(&self, higher: &str, lower: &str) -> bool {
        self.below
            .get(higher)
            .map(|set| set.contains(lower))
            .unwrap_or(false)
    }

    /// Whether an automatic update to `incoming` must leave `current` alone.
    pub fn suppresses(&self, current: Option<&str>, incoming: &str) -> bool {
        match current {
            Some(current) if !current.is_empty() && current != incoming => {
                self.outranks(current, incoming)
            }
            _ => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
