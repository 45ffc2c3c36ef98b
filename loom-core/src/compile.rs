//! Bytecode compiler: lowers the typed statement tree into the flat
//! instruction sequence executed by `crate::vm`.
//!
//! The compiled semantics must match the tree-walker exactly, including
//! short-circuit evaluation, probe order, and step/log emission order.

use crate::ast::{
    Branch, CallTarget, Expr, Lineage, Module, Stmt, StmtKind, BinaryOp, UnaryOp,
};
use crate::receipt::SelectionKind;
use crate::value::Value;

/// One VM instruction. Instructions that record receipt steps carry the
/// lineage of the statement they were compiled from.
#[derive(Debug, Clone)]
pub enum Op {
    PushConst(Value),
    Load(String),
    /// Pop value, bind `name`. Used for loop variables; records no step.
    Bind(String),
    Unary(UnaryOp),
    /// Non-short-circuit arithmetic or comparison.
    Binary(BinaryOp),
    /// Type-check the top of stack as boolean for `op`.
    CheckBool(BinaryOp),
    /// Peek a boolean: for `and` jump on false, for `or` jump on true,
    /// keeping the deciding value; otherwise pop and continue.
    ShortCircuit { op: BinaryOp, target: usize },
    /// Pop end then start, push a lazy range.
    BuildRange { inclusive: bool },

    /// Pop value, bind, record a make step.
    Make { name: String, lineage: Lineage },
    /// Pop value, log its rendering, record a show step.
    Show { lineage: Lineage },
    /// Pop value, record a return step, halt with the value.
    Return { lineage: Lineage },

    /// If `name` is bound to a usable answer, record it and jump past the
    /// default code; otherwise fall through into it.
    AskCheck { name: String, target: usize },
    /// Pop the default value, bind it, record the ask.
    AskBind { name: String },

    /// Open a pending choose record.
    ChooseBegin { lineage: Lineage },
    /// Pop a predicate result (must be boolean), append it to the pending
    /// trace, jump to `target` when false.
    ChooseProbe { expr: String, target: usize },
    /// Settle the pending choose on `branch` and flush its step, ahead of
    /// the branch body.
    ChooseSelect { branch: usize, kind: SelectionKind },
    /// Close the pending choose, flushing a no-selection step if no branch
    /// was settled.
    ChooseEnd,

    /// Pop an iterable, materialize it into cursor `id`.
    IterInit { id: u32 },
    /// Push the cursor's next element, or jump to `target` when exhausted.
    IterNext { id: u32, target: usize },

    Jump(usize),

    /// A whole cross-module or fetch call; shares `crate::calls` with the
    /// interpreter.
    Call { target: CallTarget, lineage: Lineage },

    /// An unmapped verb that survived lenient expansion; fails if reached.
    Fail { verb: String },
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub ops: Vec<Op>,
}

pub fn compile_module(module: &Module) -> Program {
    let mut c = Compiler::default();
    c.compile_block(&module.flow);
    Program { ops: c.ops }
}

#[derive(Default)]
struct Compiler {
    ops: Vec<Op>,
    next_cursor: u32,
}

impl Compiler {
    fn emit(&mut self, op: Op) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }

    fn here(&self) -> usize {
        self.ops.len()
    }

    fn patch(&mut self, at: usize, target: usize) {
        match &mut self.ops[at] {
            Op::ShortCircuit { target: t, .. }
            | Op::AskCheck { target: t, .. }
            | Op::ChooseProbe { target: t, .. }
            | Op::IterNext { target: t, .. }
            | Op::Jump(t) => *t = target,
            other => unreachable!("patching non-jump op {:?}", other),
        }
    }

    fn compile_block(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.compile_stmt(stmt);
        }
    }

    fn compile_stmt(&mut self, stmt: &Stmt) {
        let lineage = stmt.lineage.clone();
        match &stmt.kind {
            StmtKind::Make { name, expr } => {
                self.compile_expr(expr);
                self.emit(Op::Make {
                    name: name.clone(),
                    lineage,
                });
            }
            StmtKind::Show { expr } => {
                self.compile_expr(expr);
                self.emit(Op::Show { lineage });
            }
            StmtKind::Return { expr } => {
                self.compile_expr(expr);
                self.emit(Op::Return { lineage });
            }
            StmtKind::Ask {
                name,
                prompt: _,
                default,
            } => {
                let check = self.emit(Op::AskCheck {
                    name: name.clone(),
                    target: 0,
                });
                match default {
                    Some(expr) => self.compile_expr(expr),
                    None => {
                        self.emit(Op::PushConst(Value::Null));
                    }
                }
                self.emit(Op::AskBind { name: name.clone() });
                let after = self.here();
                self.patch(check, after);
            }
            StmtKind::Choose { branches } => self.compile_choose(branches, lineage),
            StmtKind::Repeat {
                binding,
                iterable,
                body,
            } => {
                let id = self.next_cursor;
                self.next_cursor += 1;
                self.compile_expr(iterable);
                self.emit(Op::IterInit { id });
                let head = self.here();
                let next = self.emit(Op::IterNext { id, target: 0 });
                self.emit(Op::Bind(binding.clone()));
                self.compile_block(body);
                self.emit(Op::Jump(head));
                let exit = self.here();
                self.patch(next, exit);
            }
            StmtKind::Call { target } => {
                self.emit(Op::Call {
                    target: target.clone(),
                    lineage,
                });
            }
            StmtKind::Unsupported { verb } => {
                self.emit(Op::Fail { verb: verb.clone() });
            }
        }
    }

    /// Predicates compile in declaration order; each probe falls through to
    /// its body via a `ChooseSelect` or jumps to the next branch. The
    /// `otherwise` body compiles last with no probe. Every settled body
    /// jumps over the rest to a shared end.
    fn compile_choose(&mut self, branches: &[Branch], lineage: Lineage) {
        self.emit(Op::ChooseBegin { lineage });
        let mut end_jumps = Vec::new();
        let mut otherwise: Option<(usize, &Branch)> = None;
        for (index, branch) in branches.iter().enumerate() {
            let Some(predicate) = &branch.predicate else {
                if otherwise.is_none() {
                    otherwise = Some((index, branch));
                }
                continue;
            };
            self.compile_expr(predicate);
            let probe = self.emit(Op::ChooseProbe {
                expr: predicate.to_string(),
                target: 0,
            });
            self.emit(Op::ChooseSelect {
                branch: index,
                kind: SelectionKind::When,
            });
            self.compile_block(&branch.body);
            end_jumps.push(self.emit(Op::Jump(0)));
            let next = self.here();
            self.patch(probe, next);
        }
        if let Some((index, branch)) = otherwise {
            self.emit(Op::ChooseSelect {
                branch: index,
                kind: SelectionKind::Otherwise,
            });
            self.compile_block(&branch.body);
        }
        self.emit(Op::ChooseEnd);
        let end = self.here();
        for at in end_jumps {
            self.patch(at, end - 1);
        }
    }

    fn compile_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Number { value } => {
                self.emit(Op::PushConst(Expr::literal_value(value)));
            }
            Expr::String { value } => {
                self.emit(Op::PushConst(Value::Str(value.clone())));
            }
            Expr::Boolean { value } => {
                self.emit(Op::PushConst(Value::Bool(*value)));
            }
            Expr::Identifier { name } => {
                self.emit(Op::Load(name.clone()));
            }
            Expr::Unary { op, expr } => {
                self.compile_expr(expr);
                self.emit(Op::Unary(*op));
            }
            Expr::Binary { op, left, right } => match op {
                BinaryOp::And | BinaryOp::Or => {
                    self.compile_expr(left);
                    self.emit(Op::CheckBool(*op));
                    let short = self.emit(Op::ShortCircuit { op: *op, target: 0 });
                    self.compile_expr(right);
                    self.emit(Op::CheckBool(*op));
                    let after = self.here();
                    self.patch(short, after);
                }
                _ => {
                    self.compile_expr(left);
                    self.compile_expr(right);
                    self.emit(Op::Binary(*op));
                }
            },
            Expr::Range {
                start,
                end,
                inclusive,
            } => {
                self.compile_expr(start);
                self.compile_expr(end);
                self.emit(Op::BuildRange {
                    inclusive: *inclusive,
                });
            }
        }
    }
}
