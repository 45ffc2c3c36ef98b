//! Runtime values shared by both execution engines.

use crate::errors::{RuntimeError, TypeError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Per-activation environment: name → value, ordered for deterministic
/// receipts.
pub type Env = BTreeMap<String, Value>;

/// A value flowing through an activation. `Range` is a lazy description and
/// only becomes a list when a `Repeat` (or explicit materialization)
/// consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Range { start: i64, end: i64, inclusive: bool },
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "text",
            Value::List(_) => "list",
            Value::Range { .. } => "range",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Integer view used by range bounds. Floats are accepted only when
    /// integral.
    pub fn as_range_bound(&self) -> Result<i64, RuntimeError> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Float(f) if f.fract() == 0.0 => Ok(*f as i64),
            other => Err(RuntimeError::BadRangeBound {
                found: other.type_name(),
            }),
        }
    }

    /// Expand a `Range` into its element sequence. Descending bounds step by
    /// -1, with the inclusivity rule applied to the lower bound.
    pub fn materialize(&self) -> Result<Vec<Value>, RuntimeError> {
        match self {
            Value::List(items) => Ok(items.clone()),
            Value::Range {
                start,
                end,
                inclusive,
            } => {
                // The endpoint check happens before the step so bounds at
                // i64::MIN/MAX never overflow.
                let mut out = Vec::new();
                let mut i = *start;
                if start <= end {
                    while i < *end || (*inclusive && i == *end) {
                        out.push(Value::Int(i));
                        match i.checked_add(1) {
                            Some(next) => i = next,
                            None => break,
                        }
                    }
                } else {
                    while i > *end || (*inclusive && i == *end) {
                        out.push(Value::Int(i));
                        match i.checked_sub(1) {
                            Some(next) => i = next,
                            None => break,
                        }
                    }
                }
                Ok(out)
            }
            other => Err(RuntimeError::NotIterable {
                found: other.type_name(),
            }),
        }
    }
}

// ── Operator semantics ────────────────────────────────────────

/// `+ - * /` over numbers; `+` additionally concatenates two text values.
/// Mixed text/number `+` is a type error. `/` always yields a float.
pub fn arithmetic(op: &str, left: &Value, right: &Value) -> Result<Value, TypeError> {
    if op == "+" {
        if let (Value::Str(a), Value::Str(b)) = (left, right) {
            let mut s = a.clone();
            s.push_str(b);
            return Ok(Value::Str(s));
        }
    }
    // Integer `+ - *` stay on i64: the f64 route rounds past 2^53. Overflow
    // widens the result to a float instead of wrapping.
    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        let exact = match op {
            "+" => Some(a.checked_add(*b)),
            "-" => Some(a.checked_sub(*b)),
            "*" => Some(a.checked_mul(*b)),
            _ => None,
        };
        if let Some(r) = exact {
            return Ok(match r {
                Some(i) => Value::Int(i),
                None => Value::Float(fold_f64(op, *a as f64, *b as f64)),
            });
        }
    }
    let (a, b) = match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(TypeError::Arithmetic {
                op: op.to_string(),
                left: left.type_name(),
                right: right.type_name(),
            })
        }
    };
    match op {
        "/" => {
            if b == 0.0 {
                Err(TypeError::DivisionByZero)
            } else {
                Ok(Value::Float(a / b))
            }
        }
        "+" | "-" | "*" => Ok(Value::Float(fold_f64(op, a, b))),
        other => Err(TypeError::UnsupportedOperator {
            op: other.to_string(),
        }),
    }
}

fn fold_f64(op: &str, a: f64, b: f64) -> f64 {
    match op {
        "+" => a + b,
        "-" => a - b,
        _ => a * b,
    }
}

/// Equality is total; numeric variants compare numerically.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::List(a), Value::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (
            Value::Range {
                start: a,
                end: b,
                inclusive: c,
            },
            Value::Range {
                start: x,
                end: y,
                inclusive: z,
            },
        ) => a == x && b == y && c == z,
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

/// Ordering comparisons are defined for numeric pairs and text pairs.
pub fn compare(op: &str, left: &Value, right: &Value) -> Result<bool, TypeError> {
    match op {
        "==" => return Ok(values_equal(left, right)),
        "!=" => return Ok(!values_equal(left, right)),
        _ => {}
    }
    let ord = if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        a.partial_cmp(&b)
    } else if let (Value::Str(a), Value::Str(b)) = (left, right) {
        Some(a.cmp(b))
    } else {
        return Err(TypeError::Comparison {
            op: op.to_string(),
            left: left.type_name(),
            right: right.type_name(),
        });
    };
    let ord = ord.ok_or_else(|| TypeError::Comparison {
        op: op.to_string(),
        left: left.type_name(),
        right: right.type_name(),
    })?;
    Ok(match op {
        "<" => ord.is_lt(),
        "<=" => ord.is_le(),
        ">" => ord.is_gt(),
        ">=" => ord.is_ge(),
        other => {
            return Err(TypeError::UnsupportedOperator {
                op: other.to_string(),
            })
        }
    })
}

/// Plain rendering used for `Show` log lines and `{name}` interpolation:
/// text without quotes, `Null` as the empty string.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Range {
                start,
                end,
                inclusive,
            } => {
                if *inclusive {
                    write!(f, "{}..{}", start, end)
                } else {
                    write!(f, "{}..<{}", start, end)
                }
            }
        }
    }
}
