#![warn(rust_2018_idioms)]

//! Register-based bytecode model for the lavascript compiler core (§4.1).
//!
//! This crate owns the instruction encoding, the constant pool, the
//! register allocator, and the [`BytecodeBuilder`] that assembles them
//! into an immutable [`Prototype`]. It has no dependency on the AST or
//! the HIR graph: everything here is the bit-exact wire contract the
//! bytecode liveness analysis and the HIR graph builder in
//! `lava-compiler` decode against.

pub mod builder;
pub mod constants;
pub mod encoding;
pub mod module;
pub mod opcode;
pub mod pool;
pub mod prototype;
pub mod register;
pub mod upvalue;

pub use builder::{BuilderError, BytecodeBuilder, Label};
pub use constants::MAX_PROTOTYPE_SIZE;
pub use encoding::SourceInfo;
pub use module::{CompiledModule, ModuleError};
pub use opcode::{InstructionType, Opcode};
pub use pool::{ConstantPool, PoolError, SsoRef};
pub use prototype::Prototype;
pub use register::{RegisterAllocator, RegisterError};
pub use upvalue::UpvalueState;
