//! Tree-walking statement executor.

use crate::ast::{Branch, CallTarget, Module, Stmt, StmtKind};
use crate::calls::{self, ExecContext};
use crate::errors::{EngineError, RuntimeError, TypeError};
use crate::eval::eval;
use crate::receipt::{
    EngineKind, ModuleMeta, PredicateProbe, Receipt, Selection, SelectionKind, StepDetail,
};
use crate::value::{Env, Value};
use tracing::debug;

enum Flow {
    Continue,
    Returned(Value),
}

/// Run one module activation to completion. The receipt is returned even
/// when the run fails, carrying everything recorded up to the error.
pub fn run_module(
    ctx: &ExecContext,
    module: &Module,
    inputs: Env,
) -> (Result<Value, EngineError>, Receipt) {
    let mut interp = Interpreter {
        ctx,
        module,
        env: inputs,
        receipt: Receipt::new(EngineKind::Interpreter),
    };
    interp.receipt.module = ModuleMeta {
        name: module.name.clone(),
        hash: module.hash.clone(),
    };
    debug!(module = %module.name, "interpreter activation");
    let outcome = interp.exec_block(module.flow.as_slice());
    interp.receipt.env = interp.env.clone();
    let result = outcome.map(|flow| match flow {
        Flow::Returned(v) => v,
        Flow::Continue => Value::Null,
    });
    (result, interp.receipt)
}

struct Interpreter<'a> {
    ctx: &'a ExecContext,
    module: &'a Module,
    env: Env,
    receipt: Receipt,
}

impl<'a> Interpreter<'a> {
    fn exec_block(&mut self, stmts: &[Stmt]) -> Result<Flow, EngineError> {
        for stmt in stmts {
            if let Flow::Returned(v) = self.exec_stmt(stmt)? {
                return Ok(Flow::Returned(v));
            }
        }
        Ok(Flow::Continue)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Flow, EngineError> {
        let lineage = stmt.lineage.clone();
        match &stmt.kind {
            StmtKind::Make { name, expr } => {
                let value = eval(expr, &self.env)?;
                self.env.insert(name.clone(), value.clone());
                self.receipt.push_step(
                    "Make",
                    lineage,
                    StepDetail::Make {
                        name: name.clone(),
                        value,
                    },
                );
                Ok(Flow::Continue)
            }
            StmtKind::Show { expr } => {
                let value = eval(expr, &self.env)?;
                self.receipt.log(value.to_string());
                self.receipt
                    .push_step("Show", lineage, StepDetail::Show { value });
                Ok(Flow::Continue)
            }
            StmtKind::Return { expr } => {
                let value = eval(expr, &self.env)?;
                self.receipt.push_step(
                    "Return",
                    lineage,
                    StepDetail::Return {
                        value: value.clone(),
                    },
                );
                Ok(Flow::Returned(value))
            }
            StmtKind::Ask {
                name,
                prompt: _,
                default,
            } => {
                // An existing binding answers the ask, unless it is Null or
                // empty text; then the default expression does.
                let existing = self.env.get(name).filter(|v| {
                    !matches!(v, Value::Null) && !matches!(v, Value::Str(s) if s.is_empty())
                });
                let value = match (existing, default) {
                    (Some(v), _) => v.clone(),
                    (None, Some(expr)) => eval(expr, &self.env)?,
                    (None, None) => Value::Null,
                };
                self.env.insert(name.clone(), value.clone());
                self.receipt.record_ask(name, value);
                Ok(Flow::Continue)
            }
            StmtKind::Choose { branches } => self.exec_choose(branches, lineage),
            StmtKind::Repeat {
                binding,
                iterable,
                body,
            } => {
                let items = eval(iterable, &self.env)?.materialize()?;
                for item in items {
                    self.env.insert(binding.clone(), item);
                    if let Flow::Returned(v) = self.exec_block(body)? {
                        return Ok(Flow::Returned(v));
                    }
                }
                Ok(Flow::Continue)
            }
            StmtKind::Call { target } => {
                let detail = match target {
                    CallTarget::Module {
                        module,
                        inputs,
                        result,
                    } => {
                        let ctx = self.ctx;
                        let mut run_child = |callee: &Module, child_env: Env| {
                            let (result, child_receipt) = run_module(ctx, callee, child_env);
                            Ok((result?, child_receipt.ask))
                        };
                        calls::module_call(
                            self.ctx,
                            &self.module.name,
                            &mut self.env,
                            &mut self.receipt,
                            module,
                            inputs,
                            result,
                            &mut run_child,
                        )?
                    }
                    CallTarget::Fetch { url, spec } => {
                        calls::fetch_call(self.ctx, &mut self.env, url, spec)?
                    }
                    CallTarget::Builtin {
                        op,
                        from_expr,
                        from,
                        into,
                    } => calls::builtin_call(&mut self.env, op, from_expr, from, into)?,
                };
                self.receipt.push_step("Call", lineage, detail);
                Ok(Flow::Continue)
            }
            StmtKind::Unsupported { verb } => {
                Err(RuntimeError::UnsupportedVerb(verb.clone()).into())
            }
        }
    }

    /// Probe predicates in declaration order and run at most one body. One
    /// choose step is recorded per statement, before the selected body runs.
    fn exec_choose(
        &mut self,
        branches: &[Branch],
        lineage: crate::ast::Lineage,
    ) -> Result<Flow, EngineError> {
        let mut trace = Vec::new();
        let mut selected = None;
        let mut otherwise_at = None;
        for (index, branch) in branches.iter().enumerate() {
            let Some(predicate) = &branch.predicate else {
                if otherwise_at.is_none() {
                    otherwise_at = Some(index);
                }
                continue;
            };
            let value = eval(predicate, &self.env)?;
            let Value::Bool(matched) = value else {
                return Err(TypeError::BooleanOperand {
                    op: "when".to_string(),
                    found: value.type_name(),
                }
                .into());
            };
            trace.push(PredicateProbe {
                expr: predicate.to_string(),
                value: Value::Bool(matched),
            });
            if matched {
                selected = Some(Selection {
                    branch: index,
                    kind: SelectionKind::When,
                });
                break;
            }
        }
        if selected.is_none() {
            if let Some(index) = otherwise_at {
                selected = Some(Selection {
                    branch: index,
                    kind: SelectionKind::Otherwise,
                });
            }
        }
        let body_at = selected.as_ref().map(|s| s.branch);
        self.receipt.push_step(
            "Choose",
            lineage,
            StepDetail::Choose {
                predicate_trace: trace,
                selected,
            },
        );
        match body_at {
            Some(index) => self.exec_block(&branches[index].body),
            None => Ok(Flow::Continue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::Registry;
    use crate::lower::lower_module;
    use crate::raw::RawProgram;
    use crate::value::values_equal;

    fn run_flow(flow: &str) -> (Result<Value, EngineError>, Receipt) {
        run_flow_with_inputs(flow, Env::new())
    }

    fn run_flow_with_inputs(flow: &str, inputs: Env) -> (Result<Value, EngineError>, Receipt) {
        let json = format!(r#"{{"modules":[{{"name":"M","flow":{}}}]}}"#, flow);
        let program = RawProgram::from_json(&json).unwrap();
        let module = lower_module(&program.modules[0]).unwrap();
        let ctx = ExecContext::new(Registry::new());
        run_module(&ctx, &module, inputs)
    }

    #[test]
    fn make_show_return_pipeline() {
        let (result, receipt) = run_flow(
            r#"[
              {"verb":"Make","args":{"name":"x","expr":{"type":"Number","value":2}}},
              {"verb":"Show","args":{"expr":{"type":"Binary","op":"*",
                  "left":{"type":"Identifier","name":"x"},
                  "right":{"type":"Number","value":3}}}},
              {"verb":"Return","args":{"expr":{"type":"Identifier","name":"x"}}}
            ]"#,
        );
        assert!(values_equal(&result.unwrap(), &Value::Int(2)));
        assert_eq!(receipt.logs, vec!["6"]);
        assert_eq!(receipt.steps.len(), 3);
        assert!(values_equal(receipt.env.get("x").unwrap(), &Value::Int(2)));
    }

    #[test]
    fn choose_records_one_step_with_trace_and_selection() {
        let (result, receipt) = run_flow(
            r#"[{"verb":"Choose","branches":[
                {"when":{"type":"Boolean","value":false},"steps":[]},
                {"when":{"type":"Boolean","value":false},"steps":[]},
                {"otherwise":true,"steps":[
                    {"verb":"Return","args":{"expr":{"type":"String","value":"fallback"}}}]}
            ]}]"#,
        );
        assert!(values_equal(&result.unwrap(), &Value::Str("fallback".into())));
        let choose_steps: Vec<_> = receipt
            .steps
            .iter()
            .filter(|s| matches!(s.detail, StepDetail::Choose { .. }))
            .collect();
        assert_eq!(choose_steps.len(), 1);
        match &choose_steps[0].detail {
            StepDetail::Choose {
                predicate_trace,
                selected,
            } => {
                assert_eq!(predicate_trace.len(), 2);
                let sel = selected.as_ref().unwrap();
                assert_eq!(sel.branch, 2);
                assert_eq!(sel.kind, SelectionKind::Otherwise);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn choose_with_no_match_and_no_otherwise_selects_nothing() {
        let (result, receipt) = run_flow(
            r#"[{"verb":"Choose","branches":[
                {"when":{"type":"Boolean","value":false},"steps":[]}
            ]}]"#,
        );
        assert!(values_equal(&result.unwrap(), &Value::Null));
        match &receipt.steps[0].detail {
            StepDetail::Choose { selected, .. } => assert!(selected.is_none()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn repeat_visits_inclusive_and_exclusive_bounds() {
        let flow = |inclusive: bool| {
            format!(
                r#"[{{"verb":"Repeat","args":{{"iterator":"i",
                    "iterable":{{"type":"Range","inclusive":{},
                        "start":{{"type":"Number","value":1}},
                        "end":{{"type":"Number","value":5}}}}}},
                    "block":{{"steps":[{{"verb":"Show","args":{{"expr":{{"type":"Identifier","name":"i"}}}}}}]}}}}]"#,
                inclusive
            )
        };
        let (_, receipt) = run_flow(&flow(true));
        assert_eq!(receipt.logs, vec!["1", "2", "3", "4", "5"]);
        let (_, receipt) = run_flow(&flow(false));
        assert_eq!(receipt.logs, vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn return_inside_repeat_exits_the_run() {
        let (result, receipt) = run_flow(
            r#"[{"verb":"Repeat","args":{"iterator":"i",
                "iterable":{"type":"Range","inclusive":true,
                    "start":{"type":"Number","value":1},
                    "end":{"type":"Number","value":10}}},
                "block":{"steps":[
                    {"verb":"Return","args":{"expr":{"type":"Identifier","name":"i"}}}]}},
              {"verb":"Show","args":{"expr":{"type":"String","value":"unreached"}}}]"#,
        );
        assert!(values_equal(&result.unwrap(), &Value::Int(1)));
        assert!(receipt.logs.is_empty());
    }

    #[test]
    fn ask_prefers_bound_input_over_default() {
        let flow = r#"[
            {"verb":"Ask","args":{"store":"who","default":{"type":"String","value":"world"}}},
            {"verb":"Return","args":{"expr":{"type":"Identifier","name":"who"}}}
        ]"#;

        let (result, receipt) = run_flow(flow);
        assert!(values_equal(&result.unwrap(), &Value::Str("world".into())));
        assert_eq!(receipt.ask.len(), 1);

        let mut inputs = Env::new();
        inputs.insert("who".to_string(), Value::Str("ada".into()));
        let (result, _) = run_flow_with_inputs(flow, inputs);
        assert!(values_equal(&result.unwrap(), &Value::Str("ada".into())));

        // empty text counts as absent
        let mut inputs = Env::new();
        inputs.insert("who".to_string(), Value::Str(String::new()));
        let (result, _) = run_flow_with_inputs(flow, inputs);
        assert!(values_equal(&result.unwrap(), &Value::Str("world".into())));
    }

    #[test]
    fn errors_keep_the_partial_receipt() {
        let (result, receipt) = run_flow(
            r#"[
              {"verb":"Show","args":{"expr":{"type":"String","value":"before"}}},
              {"verb":"Show","args":{"expr":{"type":"Identifier","name":"missing"}}}
            ]"#,
        );
        assert!(matches!(
            result,
            Err(EngineError::Runtime(RuntimeError::UndefinedIdentifier(_)))
        ));
        assert_eq!(receipt.logs, vec!["before"]);
        assert_eq!(receipt.steps.len(), 1);
    }
}
