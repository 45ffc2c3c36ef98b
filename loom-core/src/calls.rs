//! Cross-module call machinery shared by both engines: module resolution,
//! the capability policy check, envelope-wrapped child activations, and the
//! fetch-shaped call path.
//!
//! Keeping this in one place is what makes engine parity structural: the
//! interpreter and the VM only differ in how they reach a `Call`, never in
//! what the call does.

use crate::ast::{Expr, FetchSpec, Module, UrlSpec};
use crate::errors::{EngineError, RuntimeError};
use crate::eval::eval;
use crate::fetch::{self, Fetcher, FixtureFetcher, DEFAULT_MAX_BYTES, DEFAULT_TIMEOUT};
use crate::names::normalize_slug;
use crate::policy::CapabilityPolicy;
use crate::receipt::{AskRecord, InputSource, Receipt, ResolvedInput, StepDetail};
use crate::resilience::{GuardOptions, ResilienceContext};
use crate::value::{Env, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Lowered modules, resolvable by exact name or by normalized slug.
#[derive(Debug, Default)]
pub struct Registry {
    modules: Vec<Module>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, module: Module) {
        self.modules.push(module);
    }

    pub fn resolve(&self, target: &str) -> Option<&Module> {
        self.modules
            .iter()
            .find(|m| m.name == target)
            .or_else(|| {
                let slug = normalize_slug(target);
                self.modules.iter().find(|m| normalize_slug(&m.name) == slug)
            })
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.iter()
    }
}

/// Everything an activation needs besides its own environment. Cheap to
/// clone; shared between parent and child activations so breaker and cache
/// state is process-wide.
#[derive(Clone)]
pub struct ExecContext {
    pub registry: Arc<Registry>,
    pub policy: Arc<CapabilityPolicy>,
    pub resilience: Arc<ResilienceContext>,
    pub fetcher: Arc<dyn Fetcher>,
    pub enforce_capabilities: bool,
}

impl ExecContext {
    pub fn new(registry: Registry) -> Self {
        ExecContext {
            registry: Arc::new(registry),
            policy: Arc::new(CapabilityPolicy::default()),
            resilience: Arc::new(ResilienceContext::new()),
            fetcher: Arc::new(FixtureFetcher::new(".")),
            enforce_capabilities: false,
        }
    }
}

/// Cross-module calls are deterministic, so the guard carries no retry
/// budget; an engine error in the callee is not something a retry can fix.
fn module_guard_options() -> GuardOptions {
    GuardOptions {
        retry_budget: 0,
        ..GuardOptions::default()
    }
}

/// A child activation run by whichever engine owns the caller: returns the
/// callee's result value plus its ask records.
pub type RunChild<'a> =
    &'a mut dyn FnMut(&Module, Env) -> Result<(Value, Vec<AskRecord>), EngineError>;

/// Execute a module-shaped `Call`. Records the call-graph edge, consults
/// policy, runs the callee inside the resilience contract, merges the result
/// binding, and returns the step detail for the engine to record.
#[allow(clippy::too_many_arguments)]
pub fn module_call(
    ctx: &ExecContext,
    caller: &str,
    env: &mut Env,
    receipt: &mut Receipt,
    target: &str,
    inputs: &BTreeMap<String, Expr>,
    result: &Option<String>,
    run_child: RunChild<'_>,
) -> Result<StepDetail, EngineError> {
    // The edge is recorded before the step exists; atStep is the index the
    // call step will occupy.
    receipt.record_edge(caller, target, receipt.steps.len());

    let mut call_inputs = BTreeMap::new();
    for (name, expr) in inputs {
        call_inputs.insert(name.clone(), eval(expr, env)?);
    }

    let decision = ctx.policy.check(caller, target, "Call");
    if !decision.allowed {
        if ctx.enforce_capabilities {
            return Err(RuntimeError::CallDenied {
                module: target.to_string(),
            }
            .into());
        }
        warn!(caller, target, "call denied by policy, continuing unenforced");
    }

    let callee = ctx.registry.resolve(target);
    let key = normalize_slug(target);
    let mut child_asks: Vec<AskRecord> = Vec::new();
    let envelope = {
        let mut primary = || -> Result<Value, String> {
            let module = callee.ok_or_else(|| format!("module not found: {}", target))?;
            let mut child_env = Env::new();
            for (name, value) in &call_inputs {
                child_env.insert(name.clone(), value.clone());
            }
            let (value, asks) = run_child(module, child_env).map_err(|e| e.to_string())?;
            child_asks = asks;
            Ok(value)
        };
        ctx.resilience
            .guarded_call(&key, &module_guard_options(), &mut primary, None)
    };
    debug!(caller, target, status = ?envelope.status, "call completed");

    let mut inputs_resolved: BTreeMap<String, ResolvedInput> = call_inputs
        .iter()
        .map(|(name, value)| {
            (
                name.clone(),
                ResolvedInput {
                    value: value.clone(),
                    source: InputSource::Caller,
                },
            )
        })
        .collect();
    for ask in &child_asks {
        if inputs_resolved.contains_key(&ask.name) {
            continue;
        }
        let source = if matches!(ask.value, Value::Null) {
            InputSource::Missing
        } else {
            InputSource::Default
        };
        inputs_resolved.insert(
            ask.name.clone(),
            ResolvedInput {
                value: ask.value.clone(),
                source,
            },
        );
    }

    if let Some(binding) = result {
        env.insert(binding.clone(), envelope.value.clone());
    }

    Ok(StepDetail::Call {
        module: target.to_string(),
        inputs: call_inputs,
        inputs_resolved,
        policy: decision,
        envelope,
    })
}

/// Execute an op-shaped `Call`. `xml.firstTitle` is the only built-in:
/// resolve the source text, extract the first entry title, bind it into
/// `into`, and record a parse step. Missing sources read as empty text.
pub fn builtin_call(
    env: &mut Env,
    op: &str,
    from_expr: &Option<Expr>,
    from: &Option<String>,
    into: &Option<String>,
) -> Result<StepDetail, EngineError> {
    if op != "xml.firstTitle" {
        return Err(RuntimeError::UnknownCallOp(op.to_string()).into());
    }
    let source = if let Some(expr) = from_expr {
        eval(expr, env)?
    } else if let Some(name) = from {
        env.get(name).cloned().unwrap_or(Value::Null)
    } else {
        Value::Null
    };
    let text = match source {
        Value::Str(s) => s,
        other => other.to_string(),
    };
    let title = crate::xml::first_title(&text);
    debug!(op, bytes = text.len(), "builtin call");
    if let Some(name) = into {
        env.insert(name.clone(), Value::Str(title));
    }
    Ok(StepDetail::Parse { op: op.to_string() })
}

/// Execute a fetch-shaped `Call`: resolve the URL, enforce capabilities,
/// fetch through the resilience contract, bind the sinks, and return the
/// step detail.
pub fn fetch_call(
    ctx: &ExecContext,
    env: &mut Env,
    url: &UrlSpec,
    spec: &FetchSpec,
) -> Result<StepDetail, EngineError> {
    let url = match url {
        UrlSpec::Expr(expr) => eval(expr, env)?.to_string(),
        UrlSpec::Template(template) => fetch::interpolate_url(template, env),
    };
    if ctx.enforce_capabilities {
        fetch::enforce_url(&url, &ctx.policy)?;
    }

    let timeout = spec
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_TIMEOUT);
    let max_bytes = spec.max_bytes.unwrap_or(DEFAULT_MAX_BYTES);

    let mut response = None;
    let envelope = {
        let mut primary = || -> Result<Value, String> {
            let resp = ctx
                .fetcher
                .fetch(&url, timeout, max_bytes)
                .map_err(|e| e.to_string())?;
            let text = String::from_utf8_lossy(&resp.body).into_owned();
            response = Some(resp);
            Ok(Value::Str(text))
        };
        ctx.resilience
            .guarded_call(&url, &GuardOptions::default(), &mut primary, None)
    };

    if let Some(name) = &spec.into {
        env.insert(name.clone(), envelope.value.clone());
    }
    if let Some(name) = &spec.into_bytes {
        let n = response.as_ref().map(|r| r.body.len()).unwrap_or(0);
        env.insert(name.clone(), Value::Int(n as i64));
    }
    if let Some(name) = &spec.into_status {
        let status = response.as_ref().map(|r| r.status).unwrap_or(0);
        env.insert(name.clone(), Value::Int(status as i64));
    }
    if let Some(name) = &spec.into_type {
        let ctype = response
            .as_ref()
            .map(|r| r.content_type.clone())
            .unwrap_or_default();
        env.insert(name.clone(), Value::Str(ctype));
    }

    Ok(match response {
        Some(resp) => StepDetail::Fetch {
            url: resp.url,
            status: resp.status,
            bytes: resp.body.len(),
            truncated: resp.truncated,
        },
        None => StepDetail::Fetch {
            url,
            status: 0,
            bytes: 0,
            truncated: false,
        },
    })
}
