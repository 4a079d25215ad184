//! Error kinds the compiler core must distinguish and report (§7).
//!
//! Propagation policy is fail-fast: every compilation step returns
//! `CompileResult<T>`; on failure the error carries a source span so the
//! caller can format `category + span + message`. No partial
//! `Prototype` is ever handed to the analyzer or graph builder -- a
//! `CodeGenerator::compile_function` call either returns a fully built
//! function or an error, never a half-built one.

use lava_ast::Span;
use lava_bytecode::{BuilderError, PoolError, RegisterError};
use thiserror::Error;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CompileError {
    #[error("{span:?}: closure captures more than the maximum number of upvalues")]
    UpvalueOverflow { span: Span },

    #[error("{span:?}: temporary register pool exhausted")]
    RegisterOverflow { span: Span },

    #[error("{span:?}: constant table exceeds the maximum literal table size")]
    TooManyLiterals { span: Span },

    #[error("function table is full, no more prototypes can be registered")]
    TooManyPrototypes,

    #[error("{span:?}: function body exceeds the maximum code length")]
    FunctionTooLong { span: Span },

    #[error("function `{name}` is declared more than once")]
    FunctionNameRedefine { name: String },

    #[error("{span:?}: reference to undefined local `{name}`")]
    LocalVariableNotExisted { name: String, span: Span },

    #[error("{span:?}: `break` used outside of a loop")]
    InvalidBreak { span: Span },

    #[error("{span:?}: `continue` used outside of a loop")]
    InvalidContinue { span: Span },

    /// Internal inconsistency discovered during graph construction (a
    /// break outside a loop the bytecode builder should have rejected, a
    /// mismatched loop terminator, ...). Per §7 this is a fatal
    /// verification failure, not a user-facing diagnostic -- it should
    /// never actually occur against bytecode this crate itself produced.
    #[error("internal compiler error: {message}")]
    Internal { message: String },
}

impl From<BuilderError> for CompileError {
    fn from(e: BuilderError) -> Self {
        match e {
            BuilderError::FunctionTooLong => CompileError::FunctionTooLong { span: Span::default() },
            BuilderError::UpvalueOverflow => CompileError::UpvalueOverflow { span: Span::default() },
            BuilderError::Register(RegisterError::Overflow) => {
                CompileError::RegisterOverflow { span: Span::default() }
            }
            BuilderError::Register(RegisterError::UnbalancedScope) => CompileError::Internal {
                message: "register scope stack unbalanced".to_string(),
            },
            BuilderError::Pool(PoolError::TooManyLiterals) => {
                CompileError::TooManyLiterals { span: Span::default() }
            }
        }
    }
}
