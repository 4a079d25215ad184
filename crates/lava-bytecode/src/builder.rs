//! Bytecode builder (§4.1): code buffer + constant interning + register
//! allocation + jump-label patching, finalised into an immutable
//! [`crate::prototype::Prototype`].

use thiserror::Error;

use crate::constants::{INITIAL_CODE_BUFFER_SIZE, MAX_CODE_LENGTH, MAX_UPVALUE_SIZE};
use crate::encoding::{self, SourceInfo};
use crate::opcode::{InstructionType, Opcode};
use crate::pool::{ConstantPool, PoolError, SsoRef};
use crate::prototype::Prototype;
use crate::register::{RegisterAllocator, RegisterError};
use crate::upvalue::{self, UpvalueState};

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum BuilderError {
    #[error("function code buffer exceeds the maximum code length")]
    FunctionTooLong,
    #[error("upvalue table exceeds the maximum upvalue table size")]
    UpvalueOverflow,
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// A forward-jump patch site: which word to rewrite, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label {
    index: usize,
    ty: InstructionType,
}

impl Label {
    /// Patch this label's target field to `target` (a PC / word index).
    pub fn patch(&self, builder: &mut BytecodeBuilder, target: u16) {
        let word = builder.code[self.index];
        match self.ty {
            InstructionType::B => {
                builder.code[self.index] = (word & 0x0000_FFFF) | ((target as u32) << 16);
            }
            InstructionType::G => {
                builder.code[self.index] = (word & 0xFFFF_00FF) | ((target as u32) << 8);
            }
            InstructionType::H => {
                builder.code[self.index + 1] = target as u32;
            }
            other => panic!("instruction type {other:?} has no patchable target field"),
        }
    }
}

pub struct BytecodeBuilder {
    code: Vec<u32>,
    source_info: Vec<SourceInfo>,
    reg_offset: Vec<u8>,
    constants: ConstantPool,
    upvalues: Vec<u32>,
    registers: RegisterAllocator,
    max_local_var_size: u8,
    argument_size: u8,
    proto_string: String,
}

impl BytecodeBuilder {
    pub fn new(proto_string: impl Into<String>, argument_size: u8) -> Self {
        let mut registers = RegisterAllocator::new();
        // arguments occupy the low registers as a permanently reserved scope
        let _ = registers.reserve(argument_size);
        Self {
            code: Vec::with_capacity(INITIAL_CODE_BUFFER_SIZE),
            source_info: Vec::with_capacity(INITIAL_CODE_BUFFER_SIZE),
            reg_offset: Vec::with_capacity(INITIAL_CODE_BUFFER_SIZE),
            constants: ConstantPool::new(),
            upvalues: Vec::new(),
            registers,
            max_local_var_size: argument_size,
            argument_size,
            proto_string: proto_string.into(),
        }
    }

    pub fn code_buffer_size(&self) -> usize {
        self.code.len()
    }

    pub fn current_pc(&self) -> u16 {
        self.code.len() as u16
    }

    pub fn constants(&mut self) -> &mut ConstantPool {
        &mut self.constants
    }

    pub fn registers(&mut self) -> &mut RegisterAllocator {
        &mut self.registers
    }

    pub fn note_local_reserved(&mut self, count: u8) {
        let frontier = self.registers.current_base();
        if frontier > self.max_local_var_size {
            self.max_local_var_size = frontier;
        }
        let _ = count;
    }

    /// Append a 32-bit-slot upvalue descriptor; append-only, bounded by
    /// `kMaxUpValueSize`.
    pub fn add_upvalue(&mut self, state: UpvalueState, index: u16) -> Result<u16, BuilderError> {
        if self.upvalues.len() >= MAX_UPVALUE_SIZE {
            return Err(BuilderError::UpvalueOverflow);
        }
        let slot_index = self.upvalues.len() as u16;
        self.upvalues.push(upvalue::encode_slot(state, index));
        Ok(slot_index)
    }

    fn push_word(&mut self, word: u32, si: SourceInfo) -> Result<usize, BuilderError> {
        if self.code.len() >= MAX_CODE_LENGTH {
            return Err(BuilderError::FunctionTooLong);
        }
        let idx = self.code.len();
        self.code.push(word);
        self.source_info.push(si);
        self.reg_offset.push(self.registers.current_base());
        Ok(idx)
    }

    pub fn emit_x(&mut self, op: Opcode, si: SourceInfo) -> Result<(), BuilderError> {
        self.push_word(encoding::pack_x(op), si)?;
        Ok(())
    }

    pub fn emit_f(&mut self, op: Opcode, a: u8, si: SourceInfo) -> Result<(), BuilderError> {
        self.push_word(encoding::pack_f(op, a), si)?;
        Ok(())
    }

    pub fn emit_e(&mut self, op: Opcode, a: u8, b: u8, si: SourceInfo) -> Result<(), BuilderError> {
        self.push_word(encoding::pack_e(op, a, b), si)?;
        Ok(())
    }

    pub fn emit_d(
        &mut self,
        op: Opcode,
        a: u8,
        b: u8,
        c: u8,
        si: SourceInfo,
    ) -> Result<(), BuilderError> {
        self.push_word(encoding::pack_d(op, a, b, c), si)?;
        Ok(())
    }

    pub fn emit_b(&mut self, op: Opcode, a: u8, b: u16, si: SourceInfo) -> Result<(), BuilderError> {
        self.push_word(encoding::pack_b(op, a, b), si)?;
        Ok(())
    }

    pub fn emit_c(&mut self, op: Opcode, a: u16, b: u8, si: SourceInfo) -> Result<(), BuilderError> {
        self.push_word(encoding::pack_c(op, a, b), si)?;
        Ok(())
    }

    /// Emit a type-G instruction returning a [`Label`] for later patching.
    pub fn emit_g_label(&mut self, op: Opcode, si: SourceInfo) -> Result<Label, BuilderError> {
        let idx = self.push_word(encoding::pack_g(op, 0), si)?;
        Ok(Label {
            index: idx,
            ty: InstructionType::G,
        })
    }

    /// Emit a type-B instruction (test register in `a`) returning a
    /// [`Label`] whose 16-bit `b` field is the patchable target.
    pub fn emit_b_label(&mut self, op: Opcode, a: u8, si: SourceInfo) -> Result<Label, BuilderError> {
        let idx = self.push_word(encoding::pack_b(op, a, 0), si)?;
        Ok(Label {
            index: idx,
            ty: InstructionType::B,
        })
    }

    /// Emit a type-H (two-word) instruction, returning a [`Label`] whose
    /// trailing word is the patchable target.
    pub fn emit_h_label(
        &mut self,
        op: Opcode,
        a: u8,
        b: u8,
        c: u8,
        si: SourceInfo,
    ) -> Result<Label, BuilderError> {
        let idx = self.push_word(encoding::pack_h_head(op, a, b, c), si)?;
        self.push_word(0, si)?;
        Ok(Label {
            index: idx,
            ty: InstructionType::H,
        })
    }

    pub fn add_sso(&mut self, s: &str) -> Result<SsoRef, BuilderError> {
        Ok(self.constants.add_sso(s)?)
    }

    pub fn finish(self) -> Prototype {
        Prototype {
            proto_string: self.proto_string,
            argument_size: self.argument_size,
            max_local_var_size: self.max_local_var_size,
            constants: self.constants,
            upvalues: self.upvalues,
            code: self.code,
            source_info: self.source_info,
            reg_offset: self.reg_offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn si() -> SourceInfo {
        SourceInfo::new(0, 1)
    }

    #[test]
    fn emit_keeps_parallel_arrays_in_sync() {
        let mut b = BytecodeBuilder::new("f", 0);
        b.emit_x(Opcode::RetNull, si()).unwrap();
        b.emit_f(Opcode::ConstTrue, 0, si()).unwrap();
        assert_eq!(b.code.len(), b.source_info.len());
        assert_eq!(b.code.len(), b.reg_offset.len());
    }

    #[test]
    fn label_patch_b_writes_upper_16_bits() {
        let mut b = BytecodeBuilder::new("f", 0);
        let label = b.emit_b_label(Opcode::Jmpf, 3, si()).unwrap();
        label.patch(&mut b, 42);
        let (a, target) = encoding::unpack_b(b.code[0]);
        assert_eq!((a, target), (3, 42));
    }

    #[test]
    fn label_patch_g_writes_bits_8_23() {
        let mut b = BytecodeBuilder::new("f", 0);
        let label = b.emit_g_label(Opcode::Jmp, si()).unwrap();
        label.patch(&mut b, 7000);
        assert_eq!(encoding::unpack_g(b.code[0]), 7000);
    }

    #[test]
    fn label_patch_h_writes_trailing_word() {
        let mut b = BytecodeBuilder::new("f", 0);
        let label = b.emit_h_label(Opcode::Fstart, 1, 2, 3, si()).unwrap();
        label.patch(&mut b, 99);
        assert_eq!(b.code[1], 99);
    }

    #[test]
    fn code_buffer_respects_hard_ceiling() {
        let mut b = BytecodeBuilder::new("f", 0);
        b.code = vec![0; crate::constants::MAX_CODE_LENGTH];
        b.source_info = vec![si(); crate::constants::MAX_CODE_LENGTH];
        b.reg_offset = vec![0; crate::constants::MAX_CODE_LENGTH];
        assert_eq!(
            b.emit_x(Opcode::RetNull, si()),
            Err(BuilderError::FunctionTooLong)
        );
    }

    #[test]
    fn upvalue_overflow_is_reported() {
        let mut b = BytecodeBuilder::new("f", 0);
        b.upvalues = vec![0; MAX_UPVALUE_SIZE];
        assert_eq!(
            b.add_upvalue(UpvalueState::Embed, 0),
            Err(BuilderError::UpvalueOverflow)
        );
    }

    #[test]
    fn finish_builds_consistent_prototype() {
        let mut b = BytecodeBuilder::new("f", 1);
        b.emit_x(Opcode::RetNull, si()).unwrap();
        let proto = b.finish();
        assert_eq!(proto.code.len(), proto.source_info.len());
        assert_eq!(proto.code.len(), proto.reg_offset.len());
        assert_eq!(proto.argument_size, 1);
    }
}
