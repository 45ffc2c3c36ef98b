//! Run orchestration: expand, lower, register, execute, verify.
//!
//! This is the seam hosts use. Engine-level errors come back as structured
//! outcomes carrying the partial receipt, never as a bare `Err` from a run.

use crate::calls::{ExecContext, Registry};
use crate::errors::EngineError;
use crate::fetch::FixtureFetcher;
use crate::lower::lower_module;
use crate::overlay::{self, ExpandOptions};
use crate::policy::CapabilityPolicy;
use crate::raw::RawProgram;
use crate::receipt::{EngineKind, Receipt};
use crate::resilience::ResilienceContext;
use crate::value::{values_equal, Env, Value};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Directory holding `verbs.<name>.json` packs. `None` skips expansion;
    /// the program must then use canonical verbs only.
    pub overlay_dir: Option<PathBuf>,
    pub overlay_names: Vec<String>,
    pub no_unknown_verbs: bool,
    pub enforce_capabilities: bool,
    pub policy: CapabilityPolicy,
    /// Capabilities granted to the expander. Defaults to the policy's
    /// resource grants.
    pub granted_capabilities: Option<Vec<String>>,
    /// Root for `fixture://` URLs.
    pub fixture_root: PathBuf,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            overlay_dir: None,
            overlay_names: Vec::new(),
            no_unknown_verbs: false,
            enforce_capabilities: false,
            policy: CapabilityPolicy::default(),
            granted_capabilities: None,
            fixture_root: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Error,
}

/// What one run produced. `reason` is set only on error; the receipt is
/// always present, partial if the run failed midway.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub status: RunStatus,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub warnings: Vec<String>,
    pub receipt: Receipt,
}

/// A program after expansion and lowering, ready to run any of its modules.
pub struct Prepared {
    ctx: ExecContext,
    warnings: Vec<String>,
    overlays_loaded: Vec<String>,
}

/// Expand and lower every module of a program against the run options.
/// Strict expansion failures surface here, before anything executes.
pub fn prepare(program: &RawProgram, options: &RunOptions) -> Result<Prepared, EngineError> {
    let mut warnings = Vec::new();
    let mut overlays_loaded = Vec::new();
    let mut registry = Registry::new();

    let overlays = match &options.overlay_dir {
        Some(dir) => {
            let map = overlay::load_overlays(dir, &options.overlay_names)?;
            overlays_loaded.push("core".to_string());
            overlays_loaded.extend(options.overlay_names.iter().cloned());
            Some(map)
        }
        None => None,
    };
    let expand_opts = ExpandOptions {
        no_unknown_verbs: options.no_unknown_verbs,
        enforce_capabilities: options.enforce_capabilities,
        granted_capabilities: options
            .granted_capabilities
            .clone()
            .unwrap_or_else(|| options.policy.granted_capabilities()),
    };

    for raw in &program.modules {
        let expanded = match &overlays {
            Some(map) => {
                let (expanded, mut warns) = overlay::expand_module(raw, map, &expand_opts)?;
                warnings.append(&mut warns);
                expanded
            }
            None => raw.clone(),
        };
        registry.insert(lower_module(&expanded)?);
    }
    info!(
        modules = program.modules.len(),
        overlays = overlays_loaded.len(),
        "program prepared"
    );

    let ctx = ExecContext {
        registry: Arc::new(registry),
        policy: Arc::new(options.policy.clone()),
        resilience: Arc::new(ResilienceContext::new()),
        fetcher: Arc::new(FixtureFetcher::new(options.fixture_root.clone())),
        enforce_capabilities: options.enforce_capabilities,
    };
    Ok(Prepared {
        ctx,
        warnings,
        overlays_loaded,
    })
}

pub fn prepare_json(text: &str, options: &RunOptions) -> Result<Prepared, EngineError> {
    let program =
        RawProgram::from_json(text).map_err(|e| EngineError::BadProgram(e.to_string()))?;
    prepare(&program, options)
}

impl Prepared {
    pub fn context(&self) -> &ExecContext {
        &self.ctx
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn module_names(&self) -> Vec<String> {
        self.ctx.registry.modules().map(|m| m.name.clone()).collect()
    }

    /// Run one module on the chosen engine.
    pub fn run(&self, module: &str, inputs: Env, engine: EngineKind) -> RunOutcome {
        self.run_in(&self.ctx, module, inputs, engine)
    }

    fn run_in(
        &self,
        ctx: &ExecContext,
        module: &str,
        inputs: Env,
        engine: EngineKind,
    ) -> RunOutcome {
        let Some(target) = ctx.registry.resolve(module) else {
            let mut receipt = Receipt::new(engine);
            receipt.run.overlays_loaded = self.overlays_loaded.clone();
            return RunOutcome {
                status: RunStatus::Error,
                value: Value::Null,
                reason: Some(format!("module not found: {}", module)),
                warnings: self.warnings.clone(),
                receipt,
            };
        };
        let (result, mut receipt) = match engine {
            EngineKind::Interpreter => crate::interp::run_module(ctx, target, inputs),
            EngineKind::Vm => crate::vm::run_module(ctx, target, inputs),
        };
        receipt.run.overlays_loaded = self.overlays_loaded.clone();
        match result {
            Ok(value) => RunOutcome {
                status: RunStatus::Ok,
                value,
                reason: None,
                warnings: self.warnings.clone(),
                receipt,
            },
            Err(err) => RunOutcome {
                status: RunStatus::Error,
                value: Value::Null,
                reason: Some(err.to_string()),
                warnings: self.warnings.clone(),
                receipt,
            },
        }
    }

    /// Run both engines on the same module and inputs and compare
    /// everything deterministic. Each engine gets a fresh resilience
    /// context so cross-run breaker and cache state cannot leak between
    /// the two runs being compared.
    pub fn verify(&self, module: &str, inputs: Env) -> ParityReport {
        let mut fresh = |engine| {
            let ctx = ExecContext {
                resilience: Arc::new(ResilienceContext::new()),
                ..self.ctx.clone()
            };
            self.run_in(&ctx, module, inputs.clone(), engine)
        };
        let interp = fresh(EngineKind::Interpreter);
        let vm = fresh(EngineKind::Vm);

        let mut mismatches = Vec::new();
        if interp.status != vm.status {
            mismatches.push(format!(
                "status: interpreter={:?} vm={:?}",
                interp.status, vm.status
            ));
        }
        if !values_equal(&interp.value, &vm.value) {
            mismatches.push(format!("value: interpreter={} vm={}", interp.value, vm.value));
        }
        if interp.reason != vm.reason {
            mismatches.push(format!(
                "reason: interpreter={:?} vm={:?}",
                interp.reason, vm.reason
            ));
        }
        let a = interp.receipt.parity_view();
        let b = vm.receipt.parity_view();
        if a != b {
            for key in ["logs", "steps", "callGraph", "ask", "env"] {
                if a.get(key) != b.get(key) {
                    mismatches.push(format!("receipt.{} differs", key));
                }
            }
        }
        ParityReport {
            matches: mismatches.is_empty(),
            mismatches,
            interpreter: interp,
            vm,
        }
    }

    /// Execute a module's embedded tests, each in a fresh activation.
    pub fn run_tests(&self, module: &str, engine: EngineKind) -> Vec<TestReport> {
        let Some(target) = self.ctx.registry.resolve(module) else {
            return vec![TestReport {
                module: module.to_string(),
                name: "<resolve>".to_string(),
                passed: false,
                expected: None,
                actual: Value::Null,
                reason: Some(format!("module not found: {}", module)),
            }];
        };
        let tests = target.tests.clone();
        let module_name = target.name.clone();
        tests
            .iter()
            .enumerate()
            .map(|(i, test)| {
                let inputs: Env = test
                    .inputs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let outcome = self.run(&module_name, inputs, engine);
                let name = test
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("test[{}]", i));
                let passed = outcome.status == RunStatus::Ok
                    && match &test.expected {
                        Some(expected) => values_equal(&outcome.value, expected),
                        None => true,
                    };
                TestReport {
                    module: module_name.clone(),
                    name,
                    passed,
                    expected: test.expected.clone(),
                    actual: outcome.value,
                    reason: outcome.reason,
                }
            })
            .collect()
    }
}

#[derive(Debug, Serialize)]
pub struct ParityReport {
    pub matches: bool,
    pub mismatches: Vec<String>,
    pub interpreter: RunOutcome,
    pub vm: RunOutcome,
}

#[derive(Debug, Serialize)]
pub struct TestReport {
    pub module: String,
    pub name: String,
    pub passed: bool,
    pub expected: Option<Value>,
    pub actual: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROGRAM: &str = r#"{
        "modules": [{
            "name": "Doubler",
            "inputs": ["n"],
            "flow": [
                {"verb": "Ask", "args": {"store": "n",
                    "default": {"type": "Number", "value": 1}}},
                {"verb": "Return", "args": {"expr":
                    {"type": "Binary", "op": "*",
                     "left": {"type": "Identifier", "name": "n"},
                     "right": {"type": "Number", "value": 2}}}}
            ],
            "tests": [
                {"name": "doubles", "inputs": {"n": 4}, "expected": 8},
                {"name": "defaults", "inputs": {}, "expected": 2}
            ]
        }]
    }"#;

    #[test]
    fn runs_a_module_on_both_engines() {
        let prepared = prepare_json(PROGRAM, &RunOptions::default()).unwrap();
        for engine in [EngineKind::Interpreter, EngineKind::Vm] {
            let mut inputs = Env::new();
            inputs.insert("n".to_string(), Value::Int(5));
            let out = prepared.run("Doubler", inputs, engine);
            assert_eq!(out.status, RunStatus::Ok);
            assert!(values_equal(&out.value, &Value::Int(10)));
        }
    }

    #[test]
    fn verify_reports_parity() {
        let prepared = prepare_json(PROGRAM, &RunOptions::default()).unwrap();
        let report = prepared.verify("Doubler", Env::new());
        assert!(report.matches, "mismatches: {:?}", report.mismatches);
    }

    #[test]
    fn embedded_tests_run_and_judge() {
        let prepared = prepare_json(PROGRAM, &RunOptions::default()).unwrap();
        let reports = prepared.run_tests("Doubler", EngineKind::Interpreter);
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.passed), "{:?}", reports);
    }

    #[test]
    fn unknown_entry_module_is_a_structured_error() {
        let prepared = prepare_json(PROGRAM, &RunOptions::default()).unwrap();
        let out = prepared.run("Ghost", Env::new(), EngineKind::Vm);
        assert_eq!(out.status, RunStatus::Error);
        assert!(out.reason.unwrap().contains("module not found"));
    }
}
