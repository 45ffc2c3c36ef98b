//! Shared expression evaluator.
//!
//! The tree-walking interpreter uses it directly; the bytecode compiler
//! mirrors its semantics instruction-by-instruction, so any change here must
//! be reflected in `crate::compile`.

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::errors::{EngineError, RuntimeError, TypeError};
use crate::value::{self, Env, Value};

/// Evaluate `expr` against an activation environment.
pub fn eval(expr: &Expr, env: &Env) -> Result<Value, EngineError> {
    match expr {
        Expr::Number { value } => Ok(Expr::literal_value(value)),
        Expr::String { value } => Ok(Value::Str(value.clone())),
        Expr::Boolean { value } => Ok(Value::Bool(*value)),
        Expr::Identifier { name } => env
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UndefinedIdentifier(name.clone()).into()),
        Expr::Unary { op, expr } => {
            let v = eval(expr, env)?;
            apply_unary(*op, v).map_err(Into::into)
        }
        Expr::Binary { op, left, right } => match op {
            // Strict boolean logic with short-circuit: the left operand is
            // type-checked before the right is evaluated at all.
            BinaryOp::And => {
                let l = expect_bool(*op, eval(left, env)?)?;
                if !l {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(expect_bool(*op, eval(right, env)?)?))
            }
            BinaryOp::Or => {
                let l = expect_bool(*op, eval(left, env)?)?;
                if l {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(expect_bool(*op, eval(right, env)?)?))
            }
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                let l = eval(left, env)?;
                let r = eval(right, env)?;
                value::arithmetic(op.symbol(), &l, &r).map_err(Into::into)
            }
            _ => {
                let l = eval(left, env)?;
                let r = eval(right, env)?;
                value::compare(op.symbol(), &l, &r)
                    .map(Value::Bool)
                    .map_err(Into::into)
            }
        },
        Expr::Range {
            start,
            end,
            inclusive,
        } => {
            let s = eval(start, env)?.as_range_bound()?;
            let e = eval(end, env)?.as_range_bound()?;
            Ok(Value::Range {
                start: s,
                end: e,
                inclusive: *inclusive,
            })
        }
    }
}

/// `not` requires a boolean; `+`/`-` require a number and preserve its
/// integer/float variant.
pub fn apply_unary(op: UnaryOp, v: Value) -> Result<Value, TypeError> {
    match (op, v) {
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Not, other) => Err(TypeError::BooleanOperand {
            op: "not".to_string(),
            found: other.type_name(),
        }),
        (UnaryOp::Plus, v @ (Value::Int(_) | Value::Float(_))) => Ok(v),
        (UnaryOp::Neg, Value::Int(i)) => Ok(Value::Int(-i)),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (op, other) => Err(TypeError::UnaryOperand {
            op: op.symbol().to_string(),
            found: other.type_name(),
        }),
    }
}

/// Boolean operand check shared with the VM's `And`/`Or` instructions.
pub fn expect_bool(op: BinaryOp, v: Value) -> Result<bool, EngineError> {
    match v {
        Value::Bool(b) => Ok(b),
        other => Err(TypeError::BooleanOperand {
            op: op.symbol().to_string(),
            found: other.type_name(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::values_equal;

    fn e(json: &str) -> Expr {
        serde_json::from_str(json).unwrap()
    }

    fn run(json: &str) -> Result<Value, EngineError> {
        eval(&e(json), &Env::new())
    }

    #[test]
    fn truthiness_is_strict() {
        // `1 and true` is a type error, not a coercion.
        let err = run(
            r#"{"type":"Binary","op":"and",
                "left":{"type":"Number","value":1},
                "right":{"type":"Boolean","value":true}}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Type(TypeError::BooleanOperand { .. })
        ));
    }

    #[test]
    fn and_short_circuits_past_a_bad_right_operand() {
        // false and <undefined> → false, the right side is never touched.
        let v = run(
            r#"{"type":"Binary","op":"and",
                "left":{"type":"Boolean","value":false},
                "right":{"type":"Identifier","name":"missing"}}"#,
        )
        .unwrap();
        assert!(values_equal(&v, &Value::Bool(false)));
    }

    #[test]
    fn or_short_circuits_on_true() {
        let v = run(
            r#"{"type":"Binary","op":"or",
                "left":{"type":"Boolean","value":true},
                "right":{"type":"Identifier","name":"missing"}}"#,
        )
        .unwrap();
        assert!(values_equal(&v, &Value::Bool(true)));
    }

    #[test]
    fn short_circuit_still_checks_the_left_type() {
        let err = run(
            r#"{"type":"Binary","op":"or",
                "left":{"type":"Number","value":0},
                "right":{"type":"Boolean","value":true}}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Type(TypeError::BooleanOperand { .. })
        ));
    }

    #[test]
    fn undefined_identifier_is_a_runtime_error() {
        let err = run(r#"{"type":"Identifier","name":"nope"}"#).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Runtime(RuntimeError::UndefinedIdentifier(name)) if name == "nope"
        ));
    }

    #[test]
    fn negation_preserves_the_numeric_variant() {
        let v = run(r#"{"type":"Unary","op":"-","expr":{"type":"Number","value":3}}"#).unwrap();
        assert!(matches!(v, Value::Int(-3)));
        let v = run(r#"{"type":"Unary","op":"-","expr":{"type":"Number","value":2.5}}"#).unwrap();
        assert!(matches!(v, Value::Float(f) if f == -2.5));
    }

    #[test]
    fn ranges_evaluate_lazily() {
        let v = run(
            r#"{"type":"Range","inclusive":false,
                "start":{"type":"Number","value":1},
                "end":{"type":"Number","value":4}}"#,
        )
        .unwrap();
        assert!(matches!(
            v,
            Value::Range {
                start: 1,
                end: 4,
                inclusive: false
            }
        ));
    }

    #[test]
    fn range_bounds_must_be_integral() {
        let err = run(
            r#"{"type":"Range","inclusive":true,
                "start":{"type":"Number","value":1.5},
                "end":{"type":"Number","value":4}}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Runtime(RuntimeError::BadRangeBound { .. })
        ));
    }
}
