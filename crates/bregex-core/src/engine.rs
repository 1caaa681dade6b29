//! Core functions for compiling and matching regex patterns.
pub mod ast;
pub mod charclass;
pub mod compiler;
pub mod encoding;
pub mod evaluator;
pub mod instruction;
pub mod optimize;
pub mod parser;
pub mod search;
pub mod search_plan;
pub mod setup;
pub mod stack;

use log::debug;
use thiserror::Error;

use crate::{
    engine::{
        compiler::{compile, Program},
        encoding::{CaseFoldTable, Encoding},
        optimize::optimize,
        parser::parse,
        search_plan::SearchPlan,
        setup::{setup, SetupEnv},
    },
    options::OptionFlags,
};

pub use compiler::CompileError;
pub use evaluator::EvalError;
pub use parser::ParseError;

/// Unified error type for parse, compile, and evaluation stages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegexError {
    /// Parsing failed.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Compilation failed.
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// Runtime matching failed.
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Trait for checked addition used to avoid overflow.
pub trait SafeAdd: Sized {
    fn safe_add(&self, n: &Self) -> Option<Self>;
}

/// `SafeAdd` implementation for `usize`.
impl SafeAdd for usize {
    fn safe_add(&self, n: &Self) -> Option<Self> {
        self.checked_add(*n)
    }
}

/// Adds `src` into `dst` using checked arithmetic.
///
/// Returns the error produced by `f` when the operation overflows.
pub fn safe_add<T, F, E>(dst: &mut T, src: &T, f: F) -> Result<(), E>
where
    T: SafeAdd,
    F: Fn() -> E,
{
    if let Some(n) = dst.safe_add(src) {
        *dst = n;
        Ok(())
    } else {
        Err(f())
    }
}

/// A compiled program together with its search plan.
///
/// Immutable once built; searches share it through an `Arc`.
#[derive(Debug)]
pub struct CompiledPattern {
    pub program: Program,
    pub plan: SearchPlan,
}

/// Parse, set up, compile and optimize a pattern.
pub fn compile_pattern(
    pattern: &[u8],
    options: OptionFlags,
    enc: Encoding,
    case_table: Option<&CaseFoldTable>,
) -> Result<CompiledPattern, RegexError> {
    let mut parsed = parse(pattern, options, enc)?;
    let env = SetupEnv {
        enc,
        case_table,
        backrefs: &parsed.backrefs,
    };
    setup(&mut parsed.root, options, &env)?;

    let program = compile(&parsed.root, parsed.num_mem, options, enc, case_table)?;
    let plan = SearchPlan::build(optimize(&parsed.root, options, enc, case_table), enc);
    debug!(
        "compiled {:?}: {} instructions, {} groups, mode {:?}, anchor {:?}",
        String::from_utf8_lossy(pattern),
        program.code.len(),
        program.num_mem,
        plan.mode,
        plan.anchor,
    );
    Ok(CompiledPattern { program, plan })
}
