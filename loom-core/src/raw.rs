//! Author-level program model: the JSON a program arrives as, before overlay
//! expansion and lowering. Verbs are free strings here; `args` is an open
//! key/value bag so overlays can rewrite it.

use crate::ast::{Lineage, ModuleTest};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub type RawArgs = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawProgram {
    #[serde(default)]
    pub modules: Vec<RawModule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawModule {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub flow: Vec<RawStep>,
    #[serde(default)]
    pub tests: Vec<ModuleTest>,
}

/// One authored step. `branches` carries `Choose` arms and `block` a `Repeat`
/// body; both nest `RawStep`s, so expansion and lowering recurse through them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawStep {
    pub verb: String,
    #[serde(default)]
    pub args: RawArgs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branches: Option<Vec<RawBranch>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<RawBlock>,
    /// Attached by the overlay expander; absent in authored input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineage: Option<Lineage>,
}

impl RawStep {
    pub fn new(verb: impl Into<String>) -> Self {
        RawStep {
            verb: verb.into(),
            args: RawArgs::new(),
            branches: None,
            block: None,
            lineage: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBranch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<serde_json::Value>,
    #[serde(default)]
    pub otherwise: bool,
    #[serde(default)]
    pub steps: Vec<RawStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBlock {
    #[serde(default)]
    pub steps: Vec<RawStep>,
}

impl RawProgram {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn module(&self, name: &str) -> Option<&RawModule> {
        self.modules.iter().find(|m| m.name == name)
    }
}

impl RawModule {
    /// `sha256:<hex>` over the module's canonical JSON. Key order is stable
    /// because `args` is a sorted map, so the hash is reproducible.
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        format!("sha256:{:x}", digest)
    }
}
