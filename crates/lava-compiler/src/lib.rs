#![warn(rust_2018_idioms)]

//! AST -> bytecode codegen (§4.1/C), bytecode liveness & loop analysis
//! (§4.2/D), and sea-of-nodes HIR graph construction (§4.3-4.4/E,F) for
//! the lavascript compiler core.

pub mod analysis;
pub mod codegen;
pub mod error;
pub mod hir;

pub use codegen::{compile_function, compile_script, CodeGenerator};
pub use error::{CompileError, CompileResult};
pub use hir::{build_function, build_function_osr, Graph, NodeId, NodeKind};
