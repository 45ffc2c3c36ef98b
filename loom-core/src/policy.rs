//! Capability policy: who may invoke whom, and which resources are granted.
//!
//! Policy evaluation never raises. Denial is surfaced as a decision record;
//! the caller decides whether that is a warning or a failure.

use crate::names::{normalize_slug, pattern_matches};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One `from → to` rule with the actions it allows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyRule {
    #[serde(default = "wildcard")]
    pub from: String,
    #[serde(default = "wildcard")]
    pub to: String,
    #[serde(default)]
    pub allow: Vec<String>,
}

fn wildcard() -> String {
    "*".to_string()
}

/// A resource grant: plain on/off or a constrained form (e.g. a domain
/// allowlist for `net`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ResourceGrant {
    Enabled(bool),
    Constrained {
        #[serde(default)]
        domains: Vec<String>,
    },
}

/// The policy file: rules plus resource grants. Read-only during a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityPolicy {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceGrant>,
}

/// How the decision was reached: no policy configured, or a rule walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    None,
    Policy,
}

/// The record written into call receipts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub action: String,
    pub from: String,
    pub to: String,
    pub allowed: bool,
    pub matched_rule: Option<PolicyRule>,
    pub mode: PolicyMode,
}

impl CapabilityPolicy {
    /// First matching rule wins; a match must also allow the requested
    /// action. No rules at all means "no policy configured": always allowed.
    pub fn check(&self, from_name: &str, to_name: &str, action: &str) -> PolicyDecision {
        let from = normalize_slug(from_name);
        let to = normalize_slug(to_name);
        if self.rules.is_empty() {
            return PolicyDecision {
                action: action.to_string(),
                from,
                to,
                allowed: true,
                matched_rule: None,
                mode: PolicyMode::None,
            };
        }
        for rule in &self.rules {
            if pattern_matches(&rule.from, &from)
                && pattern_matches(&rule.to, &to)
                && rule.allow.iter().any(|a| a == action)
            {
                return PolicyDecision {
                    action: action.to_string(),
                    from,
                    to,
                    allowed: true,
                    matched_rule: Some(rule.clone()),
                    mode: PolicyMode::Policy,
                };
            }
        }
        PolicyDecision {
            action: action.to_string(),
            from,
            to,
            allowed: false,
            matched_rule: None,
            mode: PolicyMode::Policy,
        }
    }

    /// Domain allowlist for a constrained resource, lowercased.
    pub fn allowed_domains(&self, resource: &str) -> Vec<String> {
        match self.resources.get(resource) {
            Some(ResourceGrant::Constrained { domains }) => {
                domains.iter().map(|d| d.to_lowercase()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Capability names granted by the resource table (`true` grants and
    /// constrained grants both count), used as the overlay expander's
    /// granted set when none is supplied explicitly.
    pub fn granted_capabilities(&self) -> Vec<String> {
        self.resources
            .iter()
            .filter(|(_, grant)| !matches!(grant, ResourceGrant::Enabled(false)))
            .map(|(name, _)| name.clone())
            .collect()
    }
}
