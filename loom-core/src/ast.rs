//! Canonical typed AST: the closed statement/expression sum types both
//! engines dispatch on. Produced by lowering an expanded raw module
//! (`crate::lower`), never hand-built by callers.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ─── Expressions ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    #[serde(rename = "+")]
    Plus,
    #[serde(rename = "-")]
    Neg,
    #[serde(rename = "not")]
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Sub,
    #[serde(rename = "*")]
    Mul,
    #[serde(rename = "/")]
    Div,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "and")]
    And,
    #[serde(rename = "or")]
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }

    /// Binding power, used only for minimal-paren rendering.
    fn power(&self) -> u8 {
        match self {
            BinaryOp::Or => 10,
            BinaryOp::And => 20,
            BinaryOp::Eq | BinaryOp::Ne => 30,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 40,
            BinaryOp::Add | BinaryOp::Sub => 50,
            BinaryOp::Mul | BinaryOp::Div => 60,
        }
    }
}

impl UnaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::Plus => "+",
            UnaryOp::Neg => "-",
            UnaryOp::Not => "not",
        }
    }
}

/// Expression node, deserialized from the canonical `{"type": ...}` form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Expr {
    Number { value: serde_json::Number },
    String { value: String },
    #[serde(alias = "Bool")]
    Boolean { value: bool },
    Identifier { name: String },
    Unary { op: UnaryOp, expr: Box<Expr> },
    #[serde(alias = "BinaryExpr")]
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Range {
        start: Box<Expr>,
        end: Box<Expr>,
        #[serde(default)]
        inclusive: bool,
    },
}

impl Expr {
    pub fn literal_value(n: &serde_json::Number) -> Value {
        if let Some(i) = n.as_i64() {
            Value::Int(i)
        } else {
            Value::Float(n.as_f64().unwrap_or(0.0))
        }
    }

    fn fmt_with_power(&self, f: &mut fmt::Formatter<'_>, min_power: u8) -> fmt::Result {
        match self {
            Expr::Number { value } => write!(f, "{}", value),
            Expr::String { value } => write!(f, "\"{}\"", value),
            Expr::Boolean { value } => write!(f, "{}", value),
            Expr::Identifier { name } => write!(f, "{}", name),
            Expr::Unary { op, expr } => {
                match op {
                    UnaryOp::Not => write!(f, "not ")?,
                    other => write!(f, "{}", other.symbol())?,
                }
                expr.fmt_with_power(f, 100)
            }
            Expr::Binary { op, left, right } => {
                let power = op.power();
                let parens = power < min_power;
                if parens {
                    write!(f, "(")?;
                }
                left.fmt_with_power(f, power)?;
                write!(f, " {} ", op.symbol())?;
                right.fmt_with_power(f, power + 1)?;
                if parens {
                    write!(f, ")")?;
                }
                Ok(())
            }
            Expr::Range {
                start,
                end,
                inclusive,
            } => {
                start.fmt_with_power(f, 46)?;
                write!(f, "{}", if *inclusive { ".." } else { "..<" })?;
                end.fmt_with_power(f, 46)
            }
        }
    }
}

/// Source-like rendering, shared by both engines for predicate traces.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with_power(f, 0)
    }
}

// ─── Statements ───────────────────────────────────────────────

/// Lineage attached by the overlay expander to every statement, however
/// deeply nested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Lineage {
    pub raw_verb: String,
    pub mapped_verb: Option<String>,
    pub overlay_domain: Option<String>,
    pub overlay_version: Option<String>,
    pub capability_check: String,
}

impl Lineage {
    /// Verb was already canonical; no overlay involved.
    pub fn passthrough(verb: &str) -> Self {
        Lineage {
            raw_verb: verb.to_string(),
            mapped_verb: Some(verb.to_string()),
            overlay_domain: None,
            overlay_version: None,
            capability_check: "n/a".to_string(),
        }
    }

    /// Verb had no mapping and was emitted unchanged under lenient options.
    pub fn unknown(verb: &str) -> Self {
        Lineage {
            raw_verb: verb.to_string(),
            mapped_verb: None,
            overlay_domain: None,
            overlay_version: None,
            capability_check: "n/a".to_string(),
        }
    }
}

/// One `Choose` branch. `predicate: None` marks the `otherwise` branch.
#[derive(Debug, Clone)]
pub struct Branch {
    pub predicate: Option<Expr>,
    pub body: Vec<Stmt>,
}

/// URL argument of a fetch-shaped `Call`: an expression node or a template
/// string with `{name}` placeholders.
#[derive(Debug, Clone)]
pub enum UrlSpec {
    Expr(Expr),
    Template(String),
}

/// Fetch-shaped `Call` arguments.
#[derive(Debug, Clone, Default)]
pub struct FetchSpec {
    pub timeout_ms: Option<u64>,
    pub max_bytes: Option<usize>,
    pub into: Option<String>,
    pub into_bytes: Option<String>,
    pub into_status: Option<String>,
    pub into_type: Option<String>,
}

/// What a `Call` statement targets.
#[derive(Debug, Clone)]
pub enum CallTarget {
    /// Cross-module invocation.
    Module {
        module: String,
        inputs: BTreeMap<String, Expr>,
        result: Option<String>,
    },
    /// Network-shaped operation routed through the resilience contract.
    Fetch { url: UrlSpec, spec: FetchSpec },
    /// Built-in data operation (`args.op`), evaluated in-process. Source
    /// text comes from `from_expr` or the binding named by `from`.
    Builtin {
        op: String,
        from_expr: Option<Expr>,
        from: Option<String>,
        into: Option<String>,
    },
}

/// The canonical verb set. Every engine must handle every variant; the
/// compiler enforces this through exhaustive matching.
#[derive(Debug, Clone)]
pub enum StmtKind {
    Make {
        name: String,
        expr: Expr,
    },
    Show {
        expr: Expr,
    },
    Return {
        expr: Expr,
    },
    Ask {
        name: String,
        prompt: Option<String>,
        default: Option<Expr>,
    },
    Choose {
        branches: Vec<Branch>,
    },
    Repeat {
        binding: String,
        iterable: Expr,
        body: Vec<Stmt>,
    },
    Call {
        target: CallTarget,
    },
    /// An unmapped verb kept under lenient expansion. Fails only if
    /// execution actually reaches it.
    Unsupported {
        verb: String,
    },
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub lineage: Lineage,
}

impl StmtKind {
    pub fn verb(&self) -> &'static str {
        match self {
            StmtKind::Make { .. } => "Make",
            StmtKind::Show { .. } => "Show",
            StmtKind::Return { .. } => "Return",
            StmtKind::Ask { .. } => "Ask",
            StmtKind::Choose { .. } => "Choose",
            StmtKind::Repeat { .. } => "Repeat",
            StmtKind::Call { .. } => "Call",
            StmtKind::Unsupported { .. } => "Unsupported",
        }
    }
}

// ─── Module ───────────────────────────────────────────────────

/// One embedded module test: inputs plus the expected return value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleTest {
    pub name: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    pub expected: Option<Value>,
}

/// A fully canonical module: expanded, lowered, ready for either engine.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub inputs: Vec<String>,
    pub flow: Vec<Stmt>,
    pub tests: Vec<ModuleTest>,
    /// `sha256:<hex>` of the module's canonical JSON, for receipt metadata.
    pub hash: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Expr {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn renders_minimal_parens() {
        let e = parse(
            r#"{"type":"Binary","op":">",
                "left":{"type":"Binary","op":"+",
                    "left":{"type":"Number","value":1},
                    "right":{"type":"Binary","op":"*",
                        "left":{"type":"Number","value":2},
                        "right":{"type":"Number","value":3}}},
                "right":{"type":"Number","value":6}}"#,
        );
        assert_eq!(e.to_string(), "1 + 2 * 3 > 6");
    }

    #[test]
    fn renders_not_and_or() {
        let e = parse(
            r#"{"type":"Binary","op":"or",
                "left":{"type":"Unary","op":"not","expr":{"type":"Boolean","value":false}},
                "right":{"type":"Boolean","value":false}}"#,
        );
        assert_eq!(e.to_string(), "not false or false");
    }

    #[test]
    fn parenthesizes_lower_power_children() {
        let e = parse(
            r#"{"type":"Binary","op":"*",
                "left":{"type":"Binary","op":"+",
                    "left":{"type":"Number","value":1},
                    "right":{"type":"Number","value":2}},
                "right":{"type":"Number","value":3}}"#,
        );
        assert_eq!(e.to_string(), "(1 + 2) * 3");
    }

    #[test]
    fn renders_ranges() {
        let e = parse(
            r#"{"type":"Range","inclusive":true,
                "start":{"type":"Number","value":1},
                "end":{"type":"Number","value":5}}"#,
        );
        assert_eq!(e.to_string(), "1..5");
    }
}
