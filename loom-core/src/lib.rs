//! Loom execution core.
//!
//! A program arrives as author-level JSON ([`raw`]), is rewritten into the
//! canonical verb set by the overlay expander ([`overlay`]), lowered into a
//! typed statement tree ([`lower`], [`ast`]), and then executed by either of
//! two engines: the tree-walking interpreter ([`interp`]) or the bytecode
//! compiler plus stack machine ([`compile`], [`vm`]). Both engines produce
//! the same deterministic receipt ([`receipt`]) for the same module and
//! inputs; [`runner`] exposes that parity as a checkable report.
//!
//! Cross-module calls go through the capability policy ([`policy`]) and the
//! resilience contract ([`resilience`]), which totalizes invocation failure
//! into call envelopes.

pub mod ast;
pub mod calls;
pub mod compile;
pub mod errors;
pub mod eval;
pub mod fetch;
pub mod interp;
pub mod lower;
pub mod names;
pub mod overlay;
pub mod policy;
pub mod raw;
pub mod receipt;
pub mod resilience;
pub mod runner;
pub mod value;
pub mod vm;
pub mod xml;

pub use calls::{ExecContext, Registry};
pub use errors::{EngineError, ExpandError, RuntimeError, TypeError};
pub use receipt::{EngineKind, Receipt};
pub use resilience::{Envelope, GuardOptions, ResilienceContext};
pub use runner::{prepare, prepare_json, ParityReport, Prepared, RunOptions, RunOutcome, RunStatus};
pub use value::{Env, Value};
