//! Lowering: expanded raw steps → the typed statement tree.
//!
//! Author JSON is forgiving about argument key names (`name`/`target`/`var`
//! for a `Make` binding and so on); lowering folds those synonyms into one
//! canonical shape, so neither engine ever touches loose JSON again.

use crate::ast::{
    Branch, CallTarget, Expr, FetchSpec, Lineage, Module, Stmt, StmtKind, UrlSpec,
};
use crate::errors::{EngineError, RuntimeError};
use crate::raw::{RawArgs, RawBranch, RawModule, RawStep};
use std::collections::BTreeMap;

pub fn lower_module(raw: &RawModule) -> Result<Module, EngineError> {
    Ok(Module {
        name: raw.name.clone(),
        inputs: raw.inputs.clone(),
        flow: lower_steps(&raw.flow)?,
        tests: raw.tests.clone(),
        hash: Some(raw.content_hash()),
    })
}

pub fn lower_steps(steps: &[RawStep]) -> Result<Vec<Stmt>, EngineError> {
    steps.iter().map(lower_step).collect()
}

fn malformed(msg: impl Into<String>) -> EngineError {
    RuntimeError::MalformedStatement(msg.into()).into()
}

fn string_arg(args: &RawArgs, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| args.get(*k))
        .and_then(|v| v.as_str().map(str::to_string))
}

/// Parse an expression argument. Scalar JSON doubles as a literal node, so
/// `{"expr": 3}` and `{"expr": {"type":"Number","value":3}}` agree.
fn expr_from_json(v: &serde_json::Value, context: &str) -> Result<Expr, EngineError> {
    match v {
        serde_json::Value::Object(_) => serde_json::from_value(v.clone())
            .map_err(|e| malformed(format!("{}: bad expression node: {}", context, e))),
        serde_json::Value::String(s) => Ok(Expr::String { value: s.clone() }),
        serde_json::Value::Number(n) => Ok(Expr::Number { value: n.clone() }),
        serde_json::Value::Bool(b) => Ok(Expr::Boolean { value: *b }),
        other => Err(malformed(format!(
            "{}: expected an expression, found {}",
            context, other
        ))),
    }
}

fn expr_arg(args: &RawArgs, keys: &[&str], context: &str) -> Result<Option<Expr>, EngineError> {
    match keys.iter().find_map(|k| args.get(*k)) {
        Some(v) => Ok(Some(expr_from_json(v, context)?)),
        None => Ok(None),
    }
}

fn lower_step(step: &RawStep) -> Result<Stmt, EngineError> {
    let lineage = step
        .lineage
        .clone()
        .unwrap_or_else(|| Lineage::passthrough(&step.verb));
    let args = &step.args;
    let kind = match step.verb.as_str() {
        "Make" => {
            let name = string_arg(args, &["name", "target", "var", "id", "key", "binding", "lhs"])
                .ok_or_else(|| malformed("Make: missing 'name'"))?;
            let expr = expr_arg(args, &["expr", "value", "to", "rhs", "with", "is"], "Make")?
                .ok_or_else(|| malformed("Make: missing 'expr'"))?;
            StmtKind::Make { name, expr }
        }
        "Show" => {
            let expr = expr_arg(args, &["expr", "text", "value"], "Show")?
                .ok_or_else(|| malformed("Show: missing 'expr'"))?;
            StmtKind::Show { expr }
        }
        "Return" => {
            let expr = expr_arg(args, &["expr", "value"], "Return")?
                .ok_or_else(|| malformed("Return: missing 'expr'"))?;
            StmtKind::Return { expr }
        }
        "Ask" => {
            let name = string_arg(args, &["store", "name", "var", "target", "key"])
                .ok_or_else(|| malformed("Ask: missing 'store'"))?;
            let prompt = string_arg(args, &["text", "prompt"]);
            let default = expr_arg(args, &["default", "expr"], "Ask")?;
            StmtKind::Ask {
                name,
                prompt,
                default,
            }
        }
        "Choose" => StmtKind::Choose {
            branches: lower_branches(step)?,
        },
        "Repeat" => {
            let binding = string_arg(args, &["iterator", "iter", "var", "it"])
                .ok_or_else(|| malformed("Repeat: missing 'iterator'"))?;
            let iterable = expr_arg(args, &["iterable", "in", "over"], "Repeat")?
                .ok_or_else(|| malformed("Repeat: missing 'iterable'"))?;
            StmtKind::Repeat {
                binding,
                iterable,
                body: lower_repeat_body(step)?,
            }
        }
        "Call" => StmtKind::Call {
            target: lower_call_target(args)?,
        },
        other => StmtKind::Unsupported {
            verb: other.to_string(),
        },
    };
    Ok(Stmt { kind, lineage })
}

fn lower_branches(step: &RawStep) -> Result<Vec<Branch>, EngineError> {
    let owned: Vec<RawBranch>;
    let raw_branches: &[RawBranch] = if let Some(b) = step.branches.as_deref() {
        b
    } else if let Some(v) = step.args.get("branches") {
        owned = serde_json::from_value(v.clone())
            .map_err(|e| malformed(format!("Choose: bad branches: {}", e)))?;
        &owned
    } else {
        return Err(malformed("Choose: missing branches"));
    };

    let mut branches = Vec::with_capacity(raw_branches.len());
    for rb in raw_branches {
        let predicate = match (&rb.when, rb.otherwise) {
            (Some(node), _) => Some(expr_from_json(node, "Choose")?),
            (None, true) => None,
            (None, false) => return Err(malformed("Choose: branch needs 'when' or 'otherwise'")),
        };
        branches.push(Branch {
            predicate,
            body: lower_steps(&rb.steps)?,
        });
    }
    Ok(branches)
}

fn lower_repeat_body(step: &RawStep) -> Result<Vec<Stmt>, EngineError> {
    if let Some(block) = &step.block {
        return lower_steps(&block.steps);
    }
    if let Some(v) = step.args.get("block") {
        let block: crate::raw::RawBlock = serde_json::from_value(v.clone())
            .map_err(|e| malformed(format!("Repeat: bad block: {}", e)))?;
        return lower_steps(&block.steps);
    }
    if let Some(v) = step.args.get("steps") {
        let steps: Vec<RawStep> = serde_json::from_value(v.clone())
            .map_err(|e| malformed(format!("Repeat: bad steps: {}", e)))?;
        return lower_steps(&steps);
    }
    Err(malformed("Repeat: missing body"))
}

fn lower_call_target(args: &RawArgs) -> Result<CallTarget, EngineError> {
    // An `op` argument makes the call a built-in data operation; it excludes
    // both the url and module shapes.
    if let Some(op) = string_arg(args, &["op"]) {
        return Ok(CallTarget::Builtin {
            op,
            from_expr: expr_arg(args, &["fromExpr"], "Call op")?,
            from: string_arg(args, &["from"]),
            into: string_arg(args, &["into"]),
        });
    }

    // URL-shaped calls take precedence over module calls, mirroring the
    // author-level shorthand where `fetch` maps onto `Call` with a url
    // argument.
    if let Some(url_node) = args.get("url").or_else(|| args.get("http")) {
        let url = match url_node {
            serde_json::Value::String(s) => UrlSpec::Template(s.clone()),
            other => UrlSpec::Expr(expr_from_json(other, "Call url")?),
        };
        let timeout_ms = args
            .get("timeoutMs")
            .and_then(|v| v.as_u64())
            .or_else(|| {
                args.get("timeout")
                    .and_then(|v| v.as_f64())
                    .map(|secs| (secs * 1000.0) as u64)
            });
        let max_bytes = args
            .get("maxBytes")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize);
        return Ok(CallTarget::Fetch {
            url,
            spec: FetchSpec {
                timeout_ms,
                max_bytes,
                into: string_arg(args, &["into"]),
                into_bytes: string_arg(args, &["intoBytes"]),
                into_status: string_arg(args, &["intoStatus"]),
                into_type: string_arg(args, &["intoType"]),
            },
        });
    }

    let module = string_arg(args, &["module"])
        .ok_or_else(|| malformed("Call: missing 'module' or 'url'"))?;
    let mut inputs = BTreeMap::new();
    if let Some(v) = args.get("inputs") {
        let map = v
            .as_object()
            .ok_or_else(|| malformed("Call: 'inputs' must be an object"))?;
        for (name, node) in map {
            inputs.insert(name.clone(), expr_from_json(node, "Call input")?);
        }
    }
    Ok(CallTarget::Module {
        module,
        inputs,
        result: string_arg(args, &["result", "into"]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::RawProgram;

    fn lower_flow(flow_json: &str) -> Result<Vec<Stmt>, EngineError> {
        let json = format!(r#"{{"modules":[{{"name":"M","flow":{}}}]}}"#, flow_json);
        let p = RawProgram::from_json(&json).unwrap();
        lower_steps(&p.modules[0].flow)
    }

    #[test]
    fn make_accepts_key_synonyms_and_literal_values() {
        let stmts = lower_flow(r#"[{"verb":"Make","args":{"target":"x","value":5}}]"#).unwrap();
        match &stmts[0].kind {
            StmtKind::Make { name, expr } => {
                assert_eq!(name, "x");
                assert!(matches!(expr, Expr::Number { .. }));
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn make_without_binding_is_malformed() {
        let err = lower_flow(r#"[{"verb":"Make","args":{"value":5}}]"#).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Runtime(RuntimeError::MalformedStatement(ref m)) if m.contains("Make")
        ));
    }

    #[test]
    fn choose_lowers_when_and_otherwise_branches() {
        let stmts = lower_flow(
            r#"[{"verb":"Choose","branches":[
                {"when":{"type":"Boolean","value":false},"steps":[]},
                {"otherwise":true,"steps":[{"verb":"Show","args":{"expr":"hi"}}]}
            ]}]"#,
        )
        .unwrap();
        match &stmts[0].kind {
            StmtKind::Choose { branches } => {
                assert!(branches[0].predicate.is_some());
                assert!(branches[1].predicate.is_none());
                assert_eq!(branches[1].body.len(), 1);
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn branch_without_when_or_otherwise_is_malformed() {
        assert!(lower_flow(r#"[{"verb":"Choose","branches":[{"steps":[]}]}]"#).is_err());
    }

    #[test]
    fn repeat_accepts_block_and_in_synonym() {
        let stmts = lower_flow(
            r#"[{"verb":"Repeat","args":{
                "iterator":"i",
                "in":{"type":"Range","inclusive":true,
                      "start":{"type":"Number","value":1},
                      "end":{"type":"Number","value":3}}},
                "block":{"steps":[{"verb":"Show","args":{"expr":{"type":"Identifier","name":"i"}}}]}}]"#,
        )
        .unwrap();
        match &stmts[0].kind {
            StmtKind::Repeat { binding, body, .. } => {
                assert_eq!(binding, "i");
                assert_eq!(body.len(), 1);
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn call_splits_module_and_fetch_shapes() {
        let stmts = lower_flow(
            r#"[
              {"verb":"Call","args":{"module":"Greeter",
                "inputs":{"who":{"type":"String","value":"ada"}},"result":"greeting"}},
              {"verb":"Call","args":{"url":"fixture://feed.xml","into":"body","maxBytes":64}}
            ]"#,
        )
        .unwrap();
        match &stmts[0].kind {
            StmtKind::Call {
                target: CallTarget::Module {
                    module,
                    inputs,
                    result,
                },
            } => {
                assert_eq!(module, "Greeter");
                assert!(inputs.contains_key("who"));
                assert_eq!(result.as_deref(), Some("greeting"));
            }
            other => panic!("unexpected kind: {:?}", other),
        }
        match &stmts[1].kind {
            StmtKind::Call {
                target: CallTarget::Fetch { url, spec },
            } => {
                assert!(matches!(url, UrlSpec::Template(t) if t == "fixture://feed.xml"));
                assert_eq!(spec.max_bytes, Some(64));
                assert_eq!(spec.into.as_deref(), Some("body"));
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn call_with_op_lowers_to_a_builtin() {
        let stmts = lower_flow(
            r#"[{"verb":"Call","args":{
                "op":"xml.firstTitle","from":"body","into":"title"}}]"#,
        )
        .unwrap();
        match &stmts[0].kind {
            StmtKind::Call {
                target:
                    CallTarget::Builtin {
                        op,
                        from_expr,
                        from,
                        into,
                    },
            } => {
                assert_eq!(op, "xml.firstTitle");
                assert!(from_expr.is_none());
                assert_eq!(from.as_deref(), Some("body"));
                assert_eq!(into.as_deref(), Some("title"));
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn unmapped_verbs_lower_to_unsupported() {
        let stmts = lower_flow(r#"[{"verb":"Mystery","args":{}}]"#).unwrap();
        assert!(matches!(
            stmts[0].kind,
            StmtKind::Unsupported { ref verb } if verb == "Mystery"
        ));
    }
}
