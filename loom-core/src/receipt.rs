//! Deterministic run receipts.
//!
//! Both engines build the same receipt shape incrementally. Everything in it
//! is deterministic except the `module`/`run` metadata blocks and envelope
//! latencies, which `parity_view` masks before engine comparison.

use crate::ast::Lineage;
use crate::policy::PolicyDecision;
use crate::resilience::Envelope;
use crate::value::{Env, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Interpreter,
    Vm,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Interpreter => write!(f, "interpreter"),
            EngineKind::Vm => write!(f, "vm"),
        }
    }
}

/// One probed predicate inside a `Choose` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateProbe {
    pub expr: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionKind {
    When,
    Otherwise,
}

/// The branch a `Choose` settled on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub branch: usize,
    pub kind: SelectionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputSource {
    Caller,
    Default,
    Missing,
}

/// How one callee input was satisfied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedInput {
    pub value: Value,
    pub source: InputSource,
}

/// Event-specific step payload. Flattened into the step record next to the
/// lineage fields, discriminated by `event`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StepDetail {
    Make {
        name: String,
        value: Value,
    },
    Show {
        value: Value,
    },
    Return {
        value: Value,
    },
    #[serde(rename_all = "camelCase")]
    Choose {
        predicate_trace: Vec<PredicateProbe>,
        selected: Option<Selection>,
    },
    #[serde(rename_all = "camelCase")]
    Call {
        module: String,
        inputs: BTreeMap<String, Value>,
        inputs_resolved: BTreeMap<String, ResolvedInput>,
        policy: PolicyDecision,
        envelope: Envelope,
    },
    Fetch {
        url: String,
        status: u16,
        bytes: usize,
        truncated: bool,
    },
    Parse {
        op: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub verb: String,
    #[serde(flatten)]
    pub lineage: Lineage,
    #[serde(flatten)]
    pub detail: StepDetail,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEdge {
    pub from: String,
    pub to: String,
    pub at_step: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AskRecord {
    pub name: String,
    pub value: Value,
}

/// Volatile: identifies the module text that ran, not how it behaved.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModuleMeta {
    pub name: String,
    pub hash: Option<String>,
}

/// Volatile: per-run identifiers.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMeta {
    pub id: String,
    pub overlays_loaded: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub engine: EngineKind,
    pub logs: Vec<String>,
    pub steps: Vec<StepRecord>,
    pub call_graph: Vec<CallEdge>,
    pub ask: Vec<AskRecord>,
    pub env: Env,
    pub module: ModuleMeta,
    pub run: RunMeta,
}

impl Receipt {
    pub fn new(engine: EngineKind) -> Self {
        Receipt {
            engine,
            logs: Vec::new(),
            steps: Vec::new(),
            call_graph: Vec::new(),
            ask: Vec::new(),
            env: Env::new(),
            module: ModuleMeta::default(),
            run: RunMeta {
                id: uuid::Uuid::new_v4().to_string(),
                overlays_loaded: Vec::new(),
            },
        }
    }

    pub fn push_step(&mut self, verb: &str, lineage: Lineage, detail: StepDetail) {
        self.steps.push(StepRecord {
            verb: verb.to_string(),
            lineage,
            detail,
        });
    }

    pub fn log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
    }

    pub fn record_ask(&mut self, name: &str, value: Value) {
        self.ask.push(AskRecord {
            name: name.to_string(),
            value,
        });
    }

    pub fn record_edge(&mut self, from: &str, to: &str, at_step: usize) {
        self.call_graph.push(CallEdge {
            from: from.to_string(),
            to: to.to_string(),
            at_step,
        });
    }

    /// The receipt with volatile content masked: `engine`, `module`, and
    /// `run` removed, envelope latencies zeroed. Two engines agree exactly
    /// on this view or parity is broken.
    pub fn parity_view(&self) -> serde_json::Value {
        let mut v = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = v.as_object_mut() {
            obj.remove("engine");
            obj.remove("module");
            obj.remove("run");
        }
        mask_latency(&mut v);
        v
    }
}

fn mask_latency(v: &mut serde_json::Value) {
    match v {
        serde_json::Value::Object(map) => {
            if let Some(lat) = map.get_mut("latencyMs") {
                *lat = serde_json::json!(0);
            }
            for child in map.values_mut() {
                mask_latency(child);
            }
        }
        serde_json::Value::Array(items) => {
            for child in items.iter_mut() {
                mask_latency(child);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_records_flatten_event_and_lineage() {
        let mut r = Receipt::new(EngineKind::Interpreter);
        r.push_step(
            "Make",
            Lineage::passthrough("set"),
            StepDetail::Make {
                name: "x".to_string(),
                value: Value::Int(1),
            },
        );
        let v = serde_json::to_value(&r.steps[0]).unwrap();
        assert_eq!(v["event"], "make");
        assert_eq!(v["verb"], "Make");
        assert_eq!(v["rawVerb"], "set");
        assert_eq!(v["mappedVerb"], "set");
        assert_eq!(v["capabilityCheck"], "n/a");
        assert_eq!(v["name"], "x");
        assert_eq!(v["value"], 1);
    }

    #[test]
    fn parity_view_drops_volatile_blocks() {
        let mut a = Receipt::new(EngineKind::Interpreter);
        let mut b = Receipt::new(EngineKind::Vm);
        a.module.hash = Some("sha256:aaa".to_string());
        b.module.hash = Some("sha256:bbb".to_string());
        a.log("hello");
        b.log("hello");
        assert_eq!(a.parity_view(), b.parity_view());
    }

    #[test]
    fn choose_steps_use_camel_case_fields() {
        let detail = StepDetail::Choose {
            predicate_trace: vec![PredicateProbe {
                expr: "x > 1".to_string(),
                value: Value::Bool(false),
            }],
            selected: None,
        };
        let v = serde_json::to_value(&detail).unwrap();
        assert!(v.get("predicateTrace").is_some());
        assert_eq!(v["selected"], serde_json::Value::Null);
    }
}
