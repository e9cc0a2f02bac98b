//! Declarative method resolution.
//!
//! The table maps each client-visible method to a routing rule: either an
//! in-process call on the common handler or a JSON-RPC dispatch to a plugin
//! callsign, optionally carrying an event name for subscription rules. Loaded
//! once at startup and shared immutably behind an `Arc`; there is no runtime
//! reload path.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

use crate::error::GatewayError;

/// One rule entry as it appears in the configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleDef {
    pub method: String,
    pub alias: String,
    #[serde(default)]
    pub direct: bool,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub permission_group: Option<String>,
    #[serde(default)]
    pub include_context: bool,
    #[serde(default)]
    pub additional_context: BTreeMap<String, String>,
}

/// Where a resolved method is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    /// In-process call on the common handler, addressed by alias.
    Direct,
    /// JSON-RPC call on the internal bus, alias is the plugin callsign.
    Rpc,
}

/// A parsed, immutable resolution rule.
#[derive(Debug, Clone)]
pub struct ResolutionRule {
    pub method: String,
    pub alias: String,
    pub target: RouteTarget,
    pub event: Option<String>,
    pub permission_group: Option<String>,
    pub include_context: bool,
    pub additional_context: BTreeMap<String, String>,
}

/// Read-mostly table of method → routing rule.
#[derive(Debug, Default)]
pub struct ResolutionTable {
    rules: HashMap<String, ResolutionRule>,
}

impl ResolutionTable {
    /// Build the table from configuration entries.
    ///
    /// Method keys are unique and case-sensitive; a duplicate or an empty
    /// method/alias is a load error.
    pub fn from_rules(defs: Vec<RuleDef>) -> Result<Self, GatewayError> {
        let mut rules = HashMap::with_capacity(defs.len());
        for def in defs {
            if def.method.is_empty() {
                return Err(GatewayError::IllegalState(
                    "resolution rule with empty method".into(),
                ));
            }
            if def.alias.is_empty() {
                return Err(GatewayError::IllegalState(format!(
                    "resolution rule '{}' has an empty alias",
                    def.method
                )));
            }
            let rule = ResolutionRule {
                method: def.method.clone(),
                alias: def.alias,
                target: if def.direct {
                    RouteTarget::Direct
                } else {
                    RouteTarget::Rpc
                },
                event: def.event,
                permission_group: def.permission_group,
                include_context: def.include_context,
                additional_context: def.additional_context,
            };
            if rules.insert(def.method.clone(), rule).is_some() {
                return Err(GatewayError::IllegalState(format!(
                    "duplicate resolution rule for method '{}'",
                    def.method
                )));
            }
        }
        Ok(Self { rules })
    }

    pub fn resolve(&self, method: &str) -> Option<&ResolutionRule> {
        self.rules.get(method)
    }

    pub fn resolve_alias(&self, method: &str) -> Option<&str> {
        self.resolve(method).map(|r| r.alias.as_str())
    }

    pub fn is_direct_call(&self, method: &str) -> bool {
        self.resolve(method)
            .map(|r| r.target == RouteTarget::Direct)
            .unwrap_or(false)
    }

    pub fn event_for(&self, method: &str) -> Option<&str> {
        self.resolve(method).and_then(|r| r.event.as_deref())
    }

    pub fn permission_group(&self, method: &str) -> Option<&str> {
        self.resolve(method)
            .and_then(|r| r.permission_group.as_deref())
    }

    pub fn include_context(&self, method: &str) -> bool {
        self.resolve(method)
            .map(|r| r.include_context)
            .unwrap_or(false)
    }

    pub fn additional_context(&self, method: &str) -> BTreeMap<String, String> {
        self.resolve(method)
            .map(|r| r.additional_context.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
