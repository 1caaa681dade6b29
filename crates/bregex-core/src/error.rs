//! このライブラリで使用するエラーの型

pub use crate::engine::{CompileError, EvalError, ParseError, RegexError};
