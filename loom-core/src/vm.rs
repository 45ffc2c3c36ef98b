//! Stack machine executing compiled programs.
//!
//! Behavioral parity with the tree-walker is the contract: same result,
//! same environment, same logs, same steps, same call-graph edges.

use crate::ast::{CallTarget, Module};
use crate::calls::{self, ExecContext};
use crate::compile::{compile_module, Op, Program};
use crate::errors::{EngineError, RuntimeError, TypeError};
use crate::eval::apply_unary;
use crate::receipt::{
    EngineKind, ModuleMeta, PredicateProbe, Receipt, Selection, StepDetail,
};
use crate::value::{self, Env, Value};
use crate::ast::{BinaryOp, Lineage};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Compile and run one module activation on the VM.
pub fn run_module(
    ctx: &ExecContext,
    module: &Module,
    inputs: Env,
) -> (Result<Value, EngineError>, Receipt) {
    let program = compile_module(module);
    run_program(ctx, module, &program, inputs)
}

pub fn run_program(
    ctx: &ExecContext,
    module: &Module,
    program: &Program,
    inputs: Env,
) -> (Result<Value, EngineError>, Receipt) {
    let mut vm = Vm {
        ctx,
        module,
        env: inputs,
        receipt: Receipt::new(EngineKind::Vm),
        stack: Vec::new(),
        cursors: HashMap::new(),
        pending: Vec::new(),
    };
    vm.receipt.module = ModuleMeta {
        name: module.name.clone(),
        hash: module.hash.clone(),
    };
    debug!(module = %module.name, ops = program.ops.len(), "vm activation");
    let result = vm.execute(program);
    vm.receipt.env = vm.env.clone();
    (result, vm.receipt)
}

struct PendingChoose {
    lineage: Lineage,
    trace: Vec<PredicateProbe>,
    flushed: bool,
}

struct Vm<'a> {
    ctx: &'a ExecContext,
    module: &'a Module,
    env: Env,
    receipt: Receipt,
    stack: Vec<Value>,
    cursors: HashMap<u32, VecDeque<Value>>,
    pending: Vec<PendingChoose>,
}

impl<'a> Vm<'a> {
    fn pop(&mut self) -> Result<Value, EngineError> {
        self.stack.pop().ok_or_else(|| {
            RuntimeError::StackUnderflow {
                expected: 1,
                found: 0,
            }
            .into()
        })
    }

    fn peek_bool(&self, op: &str) -> Result<bool, EngineError> {
        match self.stack.last() {
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(TypeError::BooleanOperand {
                op: op.to_string(),
                found: other.type_name(),
            }
            .into()),
            None => Err(RuntimeError::StackUnderflow {
                expected: 1,
                found: 0,
            }
            .into()),
        }
    }

    fn jump(&mut self, pc: &mut usize, target: usize, len: usize) -> Result<(), EngineError> {
        if target > len {
            return Err(RuntimeError::BadJump { target, len }.into());
        }
        *pc = target;
        Ok(())
    }

    fn pending_mut(&mut self) -> Result<&mut PendingChoose, EngineError> {
        self.pending.last_mut().ok_or_else(|| {
            RuntimeError::MalformedStatement("choose instruction outside a choose".into()).into()
        })
    }

    fn flush_choose(&mut self, selected: Option<Selection>) -> Result<(), EngineError> {
        let pending = self.pending_mut()?;
        let trace = std::mem::take(&mut pending.trace);
        let lineage = pending.lineage.clone();
        pending.flushed = true;
        self.receipt.push_step(
            "Choose",
            lineage,
            StepDetail::Choose {
                predicate_trace: trace,
                selected,
            },
        );
        Ok(())
    }

    fn execute(&mut self, program: &Program) -> Result<Value, EngineError> {
        let len = program.ops.len();
        let mut pc = 0usize;
        while pc < len {
            let op = &program.ops[pc];
            pc += 1;
            match op {
                Op::PushConst(v) => self.stack.push(v.clone()),
                Op::Load(name) => {
                    let v = self
                        .env
                        .get(name)
                        .cloned()
                        .ok_or_else(|| RuntimeError::UndefinedIdentifier(name.clone()))?;
                    self.stack.push(v);
                }
                Op::Bind(name) => {
                    let v = self.pop()?;
                    self.env.insert(name.clone(), v);
                }
                Op::Unary(unary) => {
                    let v = self.pop()?;
                    self.stack.push(apply_unary(*unary, v)?);
                }
                Op::Binary(binary) => {
                    let right = self.pop()?;
                    let left = self.pop()?;
                    let v = match binary {
                        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                            value::arithmetic(binary.symbol(), &left, &right)?
                        }
                        BinaryOp::And | BinaryOp::Or => {
                            return Err(RuntimeError::MalformedStatement(
                                "boolean operator compiled without jumps".into(),
                            )
                            .into())
                        }
                        _ => Value::Bool(value::compare(binary.symbol(), &left, &right)?),
                    };
                    self.stack.push(v);
                }
                Op::CheckBool(binary) => {
                    self.peek_bool(binary.symbol())?;
                }
                Op::ShortCircuit { op: binary, target } => {
                    let b = self.peek_bool(binary.symbol())?;
                    let decided = match binary {
                        BinaryOp::And => !b,
                        _ => b,
                    };
                    if decided {
                        // the deciding operand stays as the result
                        self.jump(&mut pc, *target, len)?;
                    } else {
                        self.pop()?;
                    }
                }
                Op::BuildRange { inclusive } => {
                    let end = self.pop()?.as_range_bound()?;
                    let start = self.pop()?.as_range_bound()?;
                    self.stack.push(Value::Range {
                        start,
                        end,
                        inclusive: *inclusive,
                    });
                }
                Op::Make { name, lineage } => {
                    let value = self.pop()?;
                    self.env.insert(name.clone(), value.clone());
                    self.receipt.push_step(
                        "Make",
                        lineage.clone(),
                        StepDetail::Make {
                            name: name.clone(),
                            value,
                        },
                    );
                }
                Op::Show { lineage } => {
                    let value = self.pop()?;
                    self.receipt.log(value.to_string());
                    self.receipt
                        .push_step("Show", lineage.clone(), StepDetail::Show { value });
                }
                Op::Return { lineage } => {
                    let value = self.pop()?;
                    self.receipt.push_step(
                        "Return",
                        lineage.clone(),
                        StepDetail::Return {
                            value: value.clone(),
                        },
                    );
                    return Ok(value);
                }
                Op::AskCheck { name, target } => {
                    let existing = self.env.get(name).filter(|v| {
                        !matches!(v, Value::Null) && !matches!(v, Value::Str(s) if s.is_empty())
                    });
                    if let Some(v) = existing {
                        let v = v.clone();
                        self.receipt.record_ask(name, v);
                        self.jump(&mut pc, *target, len)?;
                    }
                }
                Op::AskBind { name } => {
                    let value = self.pop()?;
                    self.env.insert(name.clone(), value.clone());
                    self.receipt.record_ask(name, value);
                }
                Op::ChooseBegin { lineage } => {
                    self.pending.push(PendingChoose {
                        lineage: lineage.clone(),
                        trace: Vec::new(),
                        flushed: false,
                    });
                }
                Op::ChooseProbe { expr, target } => {
                    let value = self.pop()?;
                    let Value::Bool(matched) = value else {
                        return Err(TypeError::BooleanOperand {
                            op: "when".to_string(),
                            found: value.type_name(),
                        }
                        .into());
                    };
                    self.pending_mut()?.trace.push(PredicateProbe {
                        expr: expr.clone(),
                        value: Value::Bool(matched),
                    });
                    if !matched {
                        self.jump(&mut pc, *target, len)?;
                    }
                }
                Op::ChooseSelect { branch, kind } => {
                    self.flush_choose(Some(Selection {
                        branch: *branch,
                        kind: *kind,
                    }))?;
                }
                Op::ChooseEnd => {
                    let flushed = self.pending_mut()?.flushed;
                    if !flushed {
                        self.flush_choose(None)?;
                    }
                    self.pending.pop();
                }
                Op::IterInit { id } => {
                    let items = self.pop()?.materialize()?;
                    self.cursors.insert(*id, VecDeque::from(items));
                }
                Op::IterNext { id, target } => {
                    let cursor = self
                        .cursors
                        .get_mut(id)
                        .ok_or(RuntimeError::UnknownCursor(*id))?;
                    match cursor.pop_front() {
                        Some(v) => self.stack.push(v),
                        None => {
                            self.cursors.remove(id);
                            let t = *target;
                            self.jump(&mut pc, t, len)?;
                        }
                    }
                }
                Op::Jump(target) => {
                    self.jump(&mut pc, *target, len)?;
                }
                Op::Call { target, lineage } => {
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
                    self.receipt.push_step("Call", lineage.clone(), detail);
                }
                Op::Fail { verb } => {
                    return Err(RuntimeError::UnsupportedVerb(verb.clone()).into());
                }
            }
        }
        Ok(Value::Null)
    }
}
