//! The compiled, immutable form of a function (§3.1).

use serde::Serialize;

use crate::encoding::SourceInfo;
use crate::pool::ConstantPool;

/// A compiled function: bytecode plus the constant/upvalue tables it
/// references. All fields are immutable once built; construct one only
/// through [`crate::builder::BytecodeBuilder::finish`].
#[derive(Debug)]
pub struct Prototype {
    pub proto_string: String,
    pub argument_size: u8,
    pub max_local_var_size: u8,
    pub constants: ConstantPool,
    /// Append-only table of encoded upvalue slots (§3.1, §6).
    pub upvalues: Vec<u32>,
    /// Sequence of 32-bit instruction words; type-H instructions occupy two.
    pub code: Vec<u32>,
    pub source_info: Vec<SourceInfo>,
    pub reg_offset: Vec<u8>,
}

impl Prototype {
    /// `code.len() == source_info.len() == reg_offset.len()` (§3.1 invariant).
    pub fn check_parallel_arrays_invariant(&self) -> bool {
        self.code.len() == self.source_info.len() && self.code.len() == self.reg_offset.len()
    }

    /// Dump the wire shape as JSON, for tooling/debugging -- never consulted
    /// by `encode`/`decode`, which stay on the binary word stream (§4.1/§6).
    pub fn to_debug_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&PrototypeDump {
            proto_string: &self.proto_string,
            argument_size: self.argument_size,
            max_local_var_size: self.max_local_var_size,
            reals: self.constants.reals(),
            strings: self.constants.strings(),
            sso_strings: self.constants.sso_strings(),
            upvalues: &self.upvalues,
            code: &self.code,
        })
    }
}

#[derive(Serialize)]
struct PrototypeDump<'a> {
    proto_string: &'a str,
    argument_size: u8,
    max_local_var_size: u8,
    reals: &'a [f64],
    strings: &'a [String],
    sso_strings: &'a [String],
    upvalues: &'a [u32],
    code: &'a [u32],
}
