//! Shared instruction decode used by both the liveness analyzer and the
//! HIR graph builder, so they agree bit-for-bit on the same bytecode
//! (§6).

use lava_bytecode::encoding::{unpack_b, unpack_c, unpack_d, unpack_e, unpack_f, unpack_g, unpack_h_head};
use lava_bytecode::opcode::InstructionType;
use lava_bytecode::Opcode;

#[derive(Debug, Clone, Copy)]
pub struct Decoded {
    pub op: Opcode,
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub trailing: Option<u32>,
    /// Number of 32-bit words this instruction occupies (2 for type H).
    pub width: usize,
}

pub fn decode(code: &[u32], pc: usize) -> Decoded {
    let word = code[pc];
    let op = Opcode::from_u8((word & 0xFF) as u8).expect("invalid opcode in compiled bytecode");
    match op.instruction_type() {
        InstructionType::X => Decoded { op, a: 0, b: 0, c: 0, trailing: None, width: 1 },
        InstructionType::F => Decoded { op, a: unpack_f(word) as u32, b: 0, c: 0, trailing: None, width: 1 },
        InstructionType::G => Decoded { op, a: unpack_g(word) as u32, b: 0, c: 0, trailing: None, width: 1 },
        InstructionType::E => {
            let (a, b) = unpack_e(word);
            Decoded { op, a: a as u32, b: b as u32, c: 0, trailing: None, width: 1 }
        }
        InstructionType::D => {
            let (a, b, c) = unpack_d(word);
            Decoded { op, a: a as u32, b: b as u32, c: c as u32, trailing: None, width: 1 }
        }
        InstructionType::B => {
            let (a, b) = unpack_b(word);
            Decoded { op, a: a as u32, b: b as u32, c: 0, trailing: None, width: 1 }
        }
        InstructionType::C => {
            let (a, b) = unpack_c(word);
            Decoded { op, a: a as u32, b: b as u32, c: 0, trailing: None, width: 1 }
        }
        InstructionType::H => {
            let (a, b, c) = unpack_h_head(word);
            let trailing = code[pc + 1];
            Decoded { op, a: a as u32, b: b as u32, c: c as u32, trailing: Some(trailing), width: 2 }
        }
    }
}
