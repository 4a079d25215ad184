//! Bytecode -> HIR graph construction (§4.3).
//!
//! Walks a [`Prototype`]'s code buffer in program order, maintaining a
//! value stack that mirrors the interpreter's register file. Branch and
//! loop translation consult the liveness analysis (§4.2) to know which
//! stack slots need a φ at a merge or loop header, exactly as §4.3
//! specifies -- φ placement is never decided ad hoc during the walk.
//!
//! Graph-construction failures are all "fatal internal inconsistency"
//! per §7 (the bytecode is assumed well-formed, having come from this
//! crate's own builder), so they are reported as
//! [`CompileError::Internal`] rather than a separate error type.

use rustc_hash::FxHashMap;

use lava_bytecode::constants::TOTAL_REGISTER_SIZE;
use lava_bytecode::{Opcode, Prototype};

use crate::analysis::BytecodeAnalyze;
use crate::error::{CompileError, CompileResult};

use crate::analysis::decode::decode;
use super::node::{BinaryKind, Graph, MergeKind, NodeId, NodeKind, UnaryKind};

struct LoopBuild {
    pending_breaks: Vec<NodeId>,
    pending_continues: Vec<NodeId>,
    phi_patches: Vec<(u8, NodeId)>,
}

struct BuildExit {
    jmp_target: Option<u16>,
    terminated: bool,
    loop_end: bool,
}

pub struct GraphBuilder<'p> {
    proto: &'p Prototype,
    analyze: BytecodeAnalyze<'p>,
    graph: Graph,
    stack: Vec<Option<NodeId>>,
    cur_region: NodeId,
    cur_effect: NodeId,
    loops: Vec<LoopBuild>,
    pending_logic: FxHashMap<u16, (u8, NodeId, BinaryKind)>,
}

pub fn build_function(proto: &Prototype) -> CompileResult<Graph> {
    let analyze = BytecodeAnalyze::new(proto);
    let mut b = GraphBuilder {
        proto,
        analyze,
        graph: Graph::new(),
        stack: vec![None; TOTAL_REGISTER_SIZE],
        cur_region: 0,
        cur_effect: 0,
        loops: Vec::new(),
        pending_logic: FxHashMap::default(),
    };
    b.run()?;
    Ok(b.graph)
}

/// §4.3's OSR entry: `osr_header_pc` names an `Fstart`/`Fevrstart`
/// instruction mid-function. The graph starts with `OsrStart` instead
/// of `Start`; every register live at that point is reloaded with an
/// `OsrLoad`, the loop containing the OSR point is built first, then
/// each enclosing loop's remaining body is peeled bottom-up (no fresh
/// header -- OSR never reconstructs an enclosing loop's own back edge,
/// only the one pass still owed before its exit test) until the
/// outermost one's exit, which deoptimises back to the interpreter.
pub fn build_function_osr(proto: &Prototype, osr_header_pc: u16) -> CompileResult<Graph> {
    let analyze = BytecodeAnalyze::new(proto);
    let header = decode(&proto.code, osr_header_pc as usize);
    if !matches!(header.op, Opcode::Fstart | Opcode::Fevrstart) {
        return Err(CompileError::Internal {
            message: "OSR entry point must name a loop header instruction".to_string(),
        });
    }
    let body_pc = osr_header_pc + header.width as u16;
    analyze.lookup_loop_header(body_pc).ok_or_else(|| CompileError::Internal {
        message: "OSR entry point is not a recognized loop header".to_string(),
    })?;
    let enclosing = analyze.enclosing_loop_headers(body_pc);
    let live = analyze.live_registers_at(body_pc);

    let mut graph = Graph::new();
    graph.get_mut(graph.start).kind = NodeKind::OsrStart;
    let entry = graph.new_node(NodeKind::Region, vec![]);
    graph.add_control_edge(graph.start, entry);
    let init_barrier = graph.new_node(NodeKind::InitBarrier, vec![]);

    let mut stack = vec![None; TOTAL_REGISTER_SIZE];
    for reg in live.iter_set() {
        let load = graph.new_node(NodeKind::OsrLoad(reg), vec![]);
        graph.get_mut(load).pin = Some(entry);
        stack[reg as usize] = Some(load);
    }

    let mut b = GraphBuilder {
        proto,
        analyze,
        graph,
        stack,
        cur_region: entry,
        cur_effect: init_barrier,
        loops: Vec::new(),
        pending_logic: FxHashMap::default(),
    };

    let mut pc = osr_header_pc as usize;
    b.build_loop(&mut pc)?;

    for level in enclosing {
        let exit = b.build_region(&mut pc, proto.code.len())?;
        if !exit.loop_end {
            return Err(CompileError::Internal {
                message: "OSR-enclosing loop prefix fell off the end without its own terminator"
                    .to_string(),
            });
        }
        let end_d = decode(&b.proto.code, pc);
        // loop headers are always H-encoded (width 2 words).
        let header_pc = level.start_pc as usize - 2;
        let own_header = decode(&b.proto.code, header_pc);
        let lhs_reg = own_header.a as u8;
        let rhs_reg = own_header.b as u8;
        let cmp_tag = own_header.c as u8;
        let is_infinite = own_header.op == Opcode::Fevrstart;

        let after_region = b.graph.new_node(NodeKind::Region, vec![]);
        if end_d.op == Opcode::Feend {
            let iter = b.stack_val(lhs_reg)?;
            let itr_next = b.graph.new_node(NodeKind::ItrNext, vec![iter]);
            let loop_exit = b.graph.new_node(NodeKind::LoopExit, vec![itr_next]);
            b.graph.add_control_edge(b.cur_region, loop_exit);
            b.graph.add_control_edge(loop_exit, after_region);
        } else if !is_infinite {
            let lhs = b.stack_val(lhs_reg)?;
            let rhs = b.stack_val(rhs_reg)?;
            let kind = cmp_tag_to_kind(cmp_tag);
            let cmp = b.graph.new_node(NodeKind::Binary(kind), vec![lhs, rhs]);
            let loop_exit = b.graph.new_node(NodeKind::LoopExit, vec![cmp]);
            b.graph.add_control_edge(b.cur_region, loop_exit);
            b.graph.add_control_edge(loop_exit, after_region);
        } else {
            b.graph.add_control_edge(b.cur_region, after_region);
        }
        pc += end_d.width;
        b.cur_region = after_region;
    }

    let trap = b.graph.new_node(NodeKind::Trap, vec![]);
    b.graph.add_control_edge(b.cur_region, trap);
    let end = b.graph.end;
    b.graph.add_control_edge(trap, end);

    Ok(b.graph)
}

impl<'p> GraphBuilder<'p> {
    fn run(&mut self) -> CompileResult<()> {
        let entry = self.graph.new_node(NodeKind::Region, vec![]);
        self.graph.add_control_edge(self.graph.start, entry);
        self.cur_region = entry;

        let init_barrier = self.graph.new_node(NodeKind::InitBarrier, vec![]);
        self.cur_effect = init_barrier;

        for i in 0..self.proto.argument_size {
            let arg = self.graph.new_node(NodeKind::Arg(i), vec![]);
            self.stack[i as usize] = Some(arg);
        }

        let len = self.proto.code.len();
        let mut pc = 0usize;
        let exit = self.build_region(&mut pc, len)?;
        if exit.loop_end {
            return Err(CompileError::Internal {
                message: "loop terminator encountered outside any loop scope".to_string(),
            });
        }
        Ok(())
    }

    fn stack_val(&self, reg: u8) -> CompileResult<NodeId> {
        self.stack[reg as usize].ok_or_else(|| CompileError::Internal {
            message: format!("register {reg} read before it was defined"),
        })
    }

    fn const_float(&mut self, v: f64) -> NodeId {
        self.graph.new_node(NodeKind::Float64(v.to_bits()), vec![])
    }

    /// Main instruction dispatch, shared by the function body, `if`
    /// branches, and loop bodies. Stops early (without consuming the
    /// instruction) on a loop terminator, mirroring the liveness
    /// analyser's `scan` so both passes agree on block boundaries.
    fn build_region(&mut self, pc: &mut usize, stop: usize) -> CompileResult<BuildExit> {
        let mut terminated = false;
        let mut jmp_target = None;

        while *pc < stop {
            let d = decode(&self.proto.code, *pc);
            if d.op.is_loop_terminator() {
                return Ok(BuildExit {
                    jmp_target,
                    terminated,
                    loop_end: true,
                });
            }

            if let Some((dest, left, kind)) = self.pending_logic.remove(&(*pc as u16)) {
                if !terminated {
                    let right = self.stack_val(dest)?;
                    let node = self.graph.new_node(NodeKind::Binary(kind), vec![left, right]);
                    self.stack[dest as usize] = Some(node);
                }
            }

            if terminated {
                *pc += d.width;
                continue;
            }

            match d.op {
                Opcode::Load0 => {
                    let n = self.const_float(0.0);
                    self.stack[d.a as usize] = Some(n);
                    *pc += d.width;
                }
                Opcode::Load1 => {
                    let n = self.const_float(1.0);
                    self.stack[d.a as usize] = Some(n);
                    *pc += d.width;
                }
                Opcode::LoadNeg1 => {
                    let n = self.const_float(-1.0);
                    self.stack[d.a as usize] = Some(n);
                    *pc += d.width;
                }
                Opcode::ConstR => {
                    let v = self.proto.constants.real(d.b as u16).ok_or_else(|| {
                        CompileError::Internal { message: "ConstR index out of range".to_string() }
                    })?;
                    let n = self.const_float(v);
                    self.stack[d.a as usize] = Some(n);
                    *pc += d.width;
                }
                Opcode::ConstStr => {
                    let s = self.proto.constants.string(d.b as u16).ok_or_else(|| {
                        CompileError::Internal { message: "ConstStr index out of range".to_string() }
                    })?;
                    let n = self.graph.new_node(NodeKind::LString(s.to_string()), vec![]);
                    self.stack[d.a as usize] = Some(n);
                    *pc += d.width;
                }
                Opcode::ConstSso => {
                    let n = self.graph.new_node(NodeKind::SString(d.b), vec![]);
                    self.stack[d.a as usize] = Some(n);
                    *pc += d.width;
                }
                Opcode::ConstTrue => {
                    let n = self.graph.new_node(NodeKind::Boolean(true), vec![]);
                    self.stack[d.a as usize] = Some(n);
                    *pc += d.width;
                }
                Opcode::ConstFalse => {
                    let n = self.graph.new_node(NodeKind::Boolean(false), vec![]);
                    self.stack[d.a as usize] = Some(n);
                    *pc += d.width;
                }
                Opcode::ConstNull => {
                    let n = self.graph.new_node(NodeKind::Nil, vec![]);
                    self.stack[d.a as usize] = Some(n);
                    *pc += d.width;
                }
                Opcode::Move => {
                    let v = self.stack[d.b as usize];
                    self.stack[d.a as usize] = v;
                    *pc += d.width;
                }
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod
                | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge | Opcode::Eq | Opcode::Ne => {
                    let lhs = self.stack_val(d.b as u8)?;
                    let rhs = self.stack_val(d.c as u8)?;
                    let kind = binary_kind(d.op);
                    let n = self.graph.new_node(NodeKind::Binary(kind), vec![lhs, rhs]);
                    self.stack[d.a as usize] = Some(n);
                    *pc += d.width;
                }
                Opcode::Neg | Opcode::Not => {
                    let src = self.stack_val(d.b as u8)?;
                    let kind = if d.op == Opcode::Neg { UnaryKind::Neg } else { UnaryKind::Not };
                    let n = self.graph.new_node(NodeKind::Unary(kind), vec![src]);
                    self.stack[d.a as usize] = Some(n);
                    *pc += d.width;
                }
                Opcode::And | Opcode::Or => {
                    let left = self.stack_val(d.a as u8)?;
                    let kind = if d.op == Opcode::And { BinaryKind::And } else { BinaryKind::Or };
                    self.pending_logic.insert(d.b as u16, (d.a as u8, left, kind));
                    *pc += d.width;
                }
                Opcode::Jmp => {
                    jmp_target = Some(d.a as u16);
                    *pc += d.width;
                }
                Opcode::Jmpf => {
                    self.build_if(pc)?;
                }
                Opcode::Fstart | Opcode::Fevrstart => {
                    self.build_loop(pc)?;
                }
                Opcode::Gget => {
                    let name = self.proto.constants.string(d.b as u16).ok_or_else(|| {
                        CompileError::Internal { message: "Gget name index out of range".to_string() }
                    })?;
                    let n = self.graph.new_node(NodeKind::GlobalGet(name.to_string()), vec![]);
                    self.stack[d.a as usize] = Some(n);
                    *pc += d.width;
                }
                Opcode::Gset => {
                    let name = self.proto.constants.string(d.a as u16).ok_or_else(|| {
                        CompileError::Internal { message: "Gset name index out of range".to_string() }
                    })?;
                    let value = self.stack_val(d.b as u8)?;
                    let write = self.graph.new_node(NodeKind::GlobalSet(name.to_string()), vec![value]);
                    self.graph.get_mut(write).effect_prev = Some(self.cur_effect);
                    self.graph.get_mut(write).pin = Some(self.cur_region);
                    self.cur_effect = write;
                    *pc += d.width;
                }
                Opcode::Uvget => {
                    let n = self.graph.new_node(NodeKind::GlobalGet(format!("$upvalue{}", d.b)), vec![]);
                    self.stack[d.a as usize] = Some(n);
                    *pc += d.width;
                }
                Opcode::Uvset => {
                    let value = self.stack_val(d.b as u8)?;
                    let write = self
                        .graph
                        .new_node(NodeKind::GlobalSet(format!("$upvalue{}", d.a)), vec![value]);
                    self.graph.get_mut(write).effect_prev = Some(self.cur_effect);
                    self.cur_effect = write;
                    *pc += d.width;
                }
                Opcode::Closure => {
                    let n = self.graph.new_node(NodeKind::Closure(d.b as u16), vec![]);
                    self.graph.get_mut(n).pin = Some(self.cur_region);
                    self.stack[d.a as usize] = Some(n);
                    *pc += d.width;
                }
                Opcode::Call => {
                    let callee = self.stack_val(d.b as u8)?;
                    let argc = d.c as u8;
                    let mut operands = vec![callee];
                    for i in 0..argc {
                        operands.push(self.stack_val(d.b as u8 + 1 + i)?);
                    }
                    let tail_call = {
                        let next_pc = *pc + d.width;
                        next_pc < stop && {
                            let peek = decode(&self.proto.code, next_pc);
                            peek.op == Opcode::Ret && peek.a as u8 == d.a as u8
                        }
                    };
                    let n = self.graph.new_node(NodeKind::Call { tail_call }, operands);
                    self.stack[d.a as usize] = Some(n);
                    *pc += d.width;
                }
                Opcode::Ret => {
                    let v = self.stack_val(d.a as u8)?;
                    self.close_with_return(v);
                    terminated = true;
                    *pc += d.width;
                }
                Opcode::RetNull => {
                    let v = self.graph.new_node(NodeKind::Nil, vec![]);
                    self.close_with_return(v);
                    terminated = true;
                    *pc += d.width;
                }
                Opcode::Brk | Opcode::Cont => {
                    let jump = self.graph.new_node(NodeKind::Jump, vec![]);
                    self.graph.add_control_edge(self.cur_region, jump);
                    let ctx = self.loops.last_mut().ok_or_else(|| CompileError::Internal {
                        message: "break/continue outside any loop during graph construction".to_string(),
                    })?;
                    if d.op == Opcode::Brk {
                        ctx.pending_breaks.push(jump);
                    } else {
                        ctx.pending_continues.push(jump);
                    }
                    terminated = true;
                    *pc += d.width;
                }
                Opcode::Fend1 | Opcode::Fend2 | Opcode::Feend | Opcode::Fevrend => unreachable!(
                    "loop terminators are intercepted above before this match"
                ),
                Opcode::Tern => {
                    return Err(CompileError::Internal {
                        message: "TERN is representable but never emitted by this codegen".to_string(),
                    })
                }
            }
        }

        Ok(BuildExit { jmp_target, terminated, loop_end: false })
    }

    fn close_with_return(&mut self, value: NodeId) {
        let ret = self.graph.new_node(NodeKind::Return, vec![value]);
        self.graph.add_control_edge(self.cur_region, ret);
        let success = self.graph.new_node(NodeKind::Success, vec![]);
        self.graph.add_control_edge(ret, success);
        let end = self.graph.end;
        self.graph.add_control_edge(success, end);
    }

    /// §4.3's branch translation: `If`/`IfTrue`/`IfFalse` regions, a
    /// trailing `JMP` (if present) signals an `else` arm, φ inserted at
    /// the merge for every slot that diverges between branches.
    fn build_if(&mut self, pc: &mut usize) -> CompileResult<()> {
        let d = decode(&self.proto.code, *pc);
        debug_assert_eq!(d.op, Opcode::Jmpf);
        let cond = self.stack_val(d.a as u8)?;
        let false_target = d.b as u16;

        let if_node = self.graph.new_node(NodeKind::If, vec![cond]);
        self.graph.add_control_edge(self.cur_region, if_node);
        let true_region = self.graph.new_node(NodeKind::IfTrue, vec![]);
        let false_region = self.graph.new_node(NodeKind::IfFalse, vec![]);
        self.graph.add_control_edge(if_node, true_region);
        self.graph.add_control_edge(if_node, false_region);

        *pc += d.width;

        let entry_stack = self.stack.clone();
        self.cur_region = true_region;
        let true_exit = self.build_region(pc, false_target as usize)?;
        let true_stack = self.stack.clone();
        let true_tail = self.cur_region;

        let merge = self.graph.new_node(NodeKind::Merge(MergeKind::IfMerge), vec![]);

        let (false_stack, false_tail, false_terminated) = match true_exit.jmp_target {
            Some(merge_pc) => {
                self.stack = entry_stack;
                self.cur_region = false_region;
                *pc = false_target as usize;
                let false_exit = self.build_region(pc, merge_pc as usize)?;
                let fs = self.stack.clone();
                let ft = self.cur_region;
                *pc = merge_pc as usize;
                (fs, ft, false_exit.terminated)
            }
            None => {
                *pc = false_target as usize;
                (entry_stack, false_region, false)
            }
        };

        if !true_exit.terminated {
            self.graph.add_control_edge(true_tail, merge);
        }
        if !false_terminated {
            self.graph.add_control_edge(false_tail, merge);
        }

        for reg in 0..TOTAL_REGISTER_SIZE {
            match (true_stack[reg], false_stack[reg]) {
                (Some(t), Some(f)) if t != f => {
                    let phi = self.graph.new_node(NodeKind::Phi, vec![t, f]);
                    self.graph.get_mut(phi).pin = Some(merge);
                    self.stack[reg] = Some(phi);
                }
                (Some(t), Some(_)) => self.stack[reg] = Some(t),
                (Some(t), None) if !true_exit.terminated && false_terminated => self.stack[reg] = Some(t),
                (None, Some(f)) if !false_terminated && true_exit.terminated => self.stack[reg] = Some(f),
                _ => {}
            }
        }

        self.cur_region = merge;
        Ok(())
    }

    /// §4.3's loop translation: `GenerateLoopPhi` before the body,
    /// `PatchLoopPhi` plus the exit test after it. `FEVRSTART`/`FEVREND`
    /// loops get an unconditional `Loop` region with no synthetic guard
    /// (Open Question 1's resolution).
    fn build_loop(&mut self, pc: &mut usize) -> CompileResult<()> {
        let header = decode(&self.proto.code, *pc);
        debug_assert!(matches!(header.op, Opcode::Fstart | Opcode::Fevrstart));
        let is_infinite = header.op == Opcode::Fevrstart;
        let lhs_reg = header.a as u8;
        let rhs_reg = header.b as u8;
        let cmp_tag = header.c as u8;
        *pc += header.width;

        let loop_region = self.graph.new_node(NodeKind::Loop, vec![]);
        self.graph.add_control_edge(self.cur_region, loop_region);

        let effect_start = self.graph.new_node(NodeKind::LoopEffectStart, vec![]);
        self.graph.get_mut(effect_start).effect_prev = Some(self.cur_effect);

        let loop_header_pc = *pc as u16;
        let modified = self
            .analyze
            .lookup_loop_header(loop_header_pc)
            .map(|info| info.modified.regs);

        let mut phi_patches = Vec::new();
        if let Some(regs) = modified {
            for reg in regs.iter_set() {
                if let Some(old) = self.stack[reg as usize] {
                    let phi = self.graph.new_node(NodeKind::Phi, vec![old]);
                    self.graph.get_mut(phi).pin = Some(loop_region);
                    self.stack[reg as usize] = Some(phi);
                    phi_patches.push((reg, phi));
                }
            }
        }

        self.loops.push(LoopBuild {
            pending_breaks: Vec::new(),
            pending_continues: Vec::new(),
            phi_patches,
        });

        let saved_region = self.cur_region;
        self.cur_region = loop_region;
        let saved_effect = self.cur_effect;
        self.cur_effect = effect_start;

        let len = self.proto.code.len();
        let exit = self.build_region(pc, len)?;
        if !exit.loop_end {
            return Err(CompileError::Internal {
                message: "loop body fell off the end of the function without a terminator".to_string(),
            });
        }
        let end_d = decode(&self.proto.code, *pc);

        let ctx = self.loops.pop().expect("pushed above");
        if !exit.terminated {
            self.graph.add_control_edge(self.cur_region, loop_region);
            for (reg, phi) in &ctx.phi_patches {
                if let Some(cur) = self.stack[*reg as usize] {
                    self.graph.push_operand(*phi, cur);
                }
            }
        }

        if self.cur_effect != effect_start {
            self.graph.get_mut(effect_start).effect_prev = Some(self.cur_effect);
        }

        *pc += end_d.width;
        let _ = saved_region;

        let after_region = self.graph.new_node(NodeKind::Region, vec![]);
        if end_d.op == Opcode::Feend {
            // FEEND (for-each): exit test is `ItrNext(iter)`, not a comparison.
            let iter = self.stack_val(lhs_reg)?;
            let itr_next = self.graph.new_node(NodeKind::ItrNext, vec![iter]);
            let loop_exit = self.graph.new_node(NodeKind::LoopExit, vec![itr_next]);
            self.graph.add_control_edge(loop_region, loop_exit);
            self.graph.add_control_edge(loop_exit, after_region);
        } else if !is_infinite {
            let lhs = self.stack_val(lhs_reg)?;
            let rhs = self.stack_val(rhs_reg)?;
            let kind = cmp_tag_to_kind(cmp_tag);
            let cmp = self.graph.new_node(NodeKind::Binary(kind), vec![lhs, rhs]);
            let loop_exit = self.graph.new_node(NodeKind::LoopExit, vec![cmp]);
            self.graph.add_control_edge(loop_region, loop_exit);
            self.graph.add_control_edge(loop_exit, after_region);
        }

        for jump in ctx.pending_breaks {
            self.graph.add_control_edge(jump, after_region);
        }
        for jump in ctx.pending_continues {
            self.graph.add_control_edge(jump, loop_region);
        }

        self.cur_region = after_region;
        self.cur_effect = effect_start;
        let _ = saved_effect;
        Ok(())
    }
}

fn binary_kind(op: Opcode) -> BinaryKind {
    match op {
        Opcode::Add => BinaryKind::Add,
        Opcode::Sub => BinaryKind::Sub,
        Opcode::Mul => BinaryKind::Mul,
        Opcode::Div => BinaryKind::Div,
        Opcode::Mod => BinaryKind::Mod,
        Opcode::Lt => BinaryKind::Lt,
        Opcode::Le => BinaryKind::Le,
        Opcode::Gt => BinaryKind::Gt,
        Opcode::Ge => BinaryKind::Ge,
        Opcode::Eq => BinaryKind::Eq,
        Opcode::Ne => BinaryKind::Ne,
        other => unreachable!("{other:?} is not a binary opcode"),
    }
}

fn cmp_tag_to_kind(tag: u8) -> BinaryKind {
    match tag {
        0 => BinaryKind::Lt,
        1 => BinaryKind::Le,
        2 => BinaryKind::Gt,
        3 => BinaryKind::Ge,
        4 => BinaryKind::Eq,
        _ => BinaryKind::Ne,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lava_bytecode::builder::BytecodeBuilder;
    use lava_bytecode::SourceInfo;

    fn si() -> SourceInfo {
        SourceInfo::new(0, 0)
    }

    fn find(graph: &Graph, mut pred: impl FnMut(&NodeKind) -> bool) -> NodeId {
        (0..graph.len() as u32)
            .find(|&id| pred(&graph.get(id).kind))
            .expect("expected node not found in graph")
    }

    #[test]
    fn returning_a_constant_wires_float_into_return() {
        let mut b = BytecodeBuilder::new("f", 0);
        b.emit_f(Opcode::Load1, 0, si()).unwrap();
        b.emit_f(Opcode::Ret, 0, si()).unwrap();
        let proto = b.finish();
        let graph = build_function(&proto).unwrap();

        let one = find(&graph, |k| matches!(k, NodeKind::Float64(bits) if *bits == 1.0f64.to_bits()));
        let ret = find(&graph, |k| matches!(k, NodeKind::Return));
        assert_eq!(graph.get(ret).operands, vec![one]);
    }

    #[test]
    fn empty_function_returns_nil() {
        let mut b = BytecodeBuilder::new("f", 0);
        b.emit_x(Opcode::RetNull, si()).unwrap();
        let proto = b.finish();
        let graph = build_function(&proto).unwrap();

        let nil = find(&graph, |k| matches!(k, NodeKind::Nil));
        let ret = find(&graph, |k| matches!(k, NodeKind::Return));
        assert_eq!(graph.get(ret).operands, vec![nil]);
    }

    #[test]
    fn if_else_inserts_phi_for_divergent_register() {
        let mut b = BytecodeBuilder::new("f", 1);
        let jmpf = b.emit_b_label(Opcode::Jmpf, 0, si()).unwrap();
        b.emit_f(Opcode::Load1, 1, si()).unwrap();
        let jmp = b.emit_g_label(Opcode::Jmp, si()).unwrap();
        let false_pc = b.current_pc();
        b.emit_f(Opcode::Load0, 1, si()).unwrap();
        let merge_pc = b.current_pc();
        jmpf.patch(&mut b, false_pc);
        jmp.patch(&mut b, merge_pc);
        b.emit_f(Opcode::Ret, 1, si()).unwrap();
        let proto = b.finish();
        let graph = build_function(&proto).unwrap();

        let phi = find(&graph, |k| matches!(k, NodeKind::Phi));
        assert_eq!(graph.get(phi).operands.len(), 2);
        let merge = find(&graph, |k| matches!(k, NodeKind::Merge(MergeKind::IfMerge)));
        assert_eq!(graph.get(phi).pin, Some(merge));
    }

    #[test]
    fn if_without_else_does_not_phi_an_untouched_register() {
        let mut b = BytecodeBuilder::new("f", 1);
        b.emit_f(Opcode::Load0, 1, si()).unwrap(); // reg1 untouched by the then-branch
        let jmpf = b.emit_b_label(Opcode::Jmpf, 0, si()).unwrap();
        let false_pc = b.current_pc();
        jmpf.patch(&mut b, false_pc);
        b.emit_f(Opcode::Ret, 1, si()).unwrap();
        let proto = b.finish();
        let graph = build_function(&proto).unwrap();

        assert!(!(0..graph.len() as u32).any(|id| matches!(graph.get(id).kind, NodeKind::Phi)));
    }

    #[test]
    fn comparison_loop_builds_loop_exit_and_phi_for_outer_register() {
        // s = 0; i = 0; bound = 1; while (i < bound) { s = s + i }
        let mut b = BytecodeBuilder::new("f", 0);
        b.emit_f(Opcode::Load0, 0, si()).unwrap(); // reg0 = s
        b.emit_f(Opcode::Load0, 1, si()).unwrap(); // reg1 = i (induction)
        b.emit_f(Opcode::Load1, 2, si()).unwrap(); // reg2 = bound
        let loop_start = b.current_pc();
        let fstart = b.emit_h_label(Opcode::Fstart, 1, 2, 0, si()).unwrap();
        b.emit_d(Opcode::Add, 0, 0, 1, si()).unwrap(); // s = s + i
        let fend = b.emit_h_label(Opcode::Fend1, 1, 2, 0, si()).unwrap();
        let after = b.current_pc();
        fstart.patch(&mut b, after);
        fend.patch(&mut b, loop_start);
        b.emit_f(Opcode::Ret, 0, si()).unwrap();
        let proto = b.finish();
        let graph = build_function(&proto).unwrap();

        find(&graph, |k| matches!(k, NodeKind::Loop));
        let exit = find(&graph, |k| matches!(k, NodeKind::LoopExit));
        let cmp = graph.get(exit).operands[0];
        assert!(matches!(graph.get(cmp).kind, NodeKind::Binary(BinaryKind::Lt)));

        let loop_region = find(&graph, |k| matches!(k, NodeKind::Loop));
        let phi = find(&graph, |k| matches!(k, NodeKind::Phi));
        assert_eq!(graph.get(phi).pin, Some(loop_region));
        // the phi for `s` merges the pre-loop value with the post-body value.
        assert_eq!(graph.get(phi).operands.len(), 2);
    }

    #[test]
    fn for_each_loop_uses_itr_next_instead_of_a_comparison() {
        let mut b = BytecodeBuilder::new("f", 0);
        b.emit_f(Opcode::Load0, 0, si()).unwrap(); // reg0 stands in for the iterator
        let fstart = b.emit_h_label(Opcode::Fstart, 0, 0, 0, si()).unwrap();
        let body_start = b.current_pc();
        let feend = b.emit_h_label(Opcode::Feend, 0, 0, 0, si()).unwrap();
        feend.patch(&mut b, body_start);
        let after = b.current_pc();
        fstart.patch(&mut b, after);
        b.emit_x(Opcode::RetNull, si()).unwrap();
        let proto = b.finish();
        let graph = build_function(&proto).unwrap();

        let itr_next = find(&graph, |k| matches!(k, NodeKind::ItrNext));
        // the iterator register is advanced each pass, so the loop header
        // phi's for it; the seed value is the pre-loop constant.
        let iter = graph.get(itr_next).operands[0];
        assert!(matches!(graph.get(iter).kind, NodeKind::Phi));
        let seed = graph.get(iter).operands[0];
        assert!(matches!(graph.get(seed).kind, NodeKind::Float64(bits) if bits == 0.0f64.to_bits()));
        let exit = find(&graph, |k| matches!(k, NodeKind::LoopExit));
        assert_eq!(graph.get(exit).operands, vec![itr_next]);
    }

    #[test]
    fn break_inside_loop_edges_to_the_after_region() {
        let mut b = BytecodeBuilder::new("f", 0);
        b.emit_f(Opcode::Load0, 0, si()).unwrap();
        b.emit_f(Opcode::Load1, 1, si()).unwrap();
        let loop_start = b.current_pc();
        let fstart = b.emit_h_label(Opcode::Fstart, 0, 1, 0, si()).unwrap();
        let brk = b.emit_g_label(Opcode::Brk, si()).unwrap();
        let fend = b.emit_h_label(Opcode::Fend1, 0, 1, 0, si()).unwrap();
        let after = b.current_pc();
        brk.patch(&mut b, after);
        fstart.patch(&mut b, after);
        fend.patch(&mut b, loop_start);
        b.emit_x(Opcode::RetNull, si()).unwrap();
        let proto = b.finish();
        let graph = build_function(&proto).unwrap();

        let jump = find(&graph, |k| matches!(k, NodeKind::Jump));
        let target = graph.get(jump).control_succs[0];
        assert!(matches!(graph.get(target).kind, NodeKind::Region));
    }

    #[test]
    fn closure_opcode_allocates_a_pinned_closure_node() {
        let mut b = BytecodeBuilder::new("f", 0);
        b.emit_b(Opcode::Closure, 0, 7, si()).unwrap();
        b.emit_f(Opcode::Ret, 0, si()).unwrap();
        let proto = b.finish();
        let graph = build_function(&proto).unwrap();

        let closure = find(&graph, |k| matches!(k, NodeKind::Closure(7)));
        assert!(graph.get(closure).pin.is_some());
    }

    #[test]
    fn osr_entry_at_a_single_loop_reloads_live_registers_and_deopts_at_exit() {
        let mut b = BytecodeBuilder::new("f", 0);
        b.emit_f(Opcode::Load0, 0, si()).unwrap(); // reg0 = s
        b.emit_f(Opcode::Load0, 1, si()).unwrap(); // reg1 = i (induction)
        b.emit_f(Opcode::Load1, 2, si()).unwrap(); // reg2 = bound
        let header_pc = b.current_pc();
        let fstart = b.emit_h_label(Opcode::Fstart, 1, 2, 0, si()).unwrap();
        b.emit_d(Opcode::Add, 0, 0, 1, si()).unwrap();
        let fend = b.emit_h_label(Opcode::Fend1, 1, 2, 0, si()).unwrap();
        let after = b.current_pc();
        fstart.patch(&mut b, after);
        fend.patch(&mut b, header_pc);
        b.emit_f(Opcode::Ret, 0, si()).unwrap();
        let proto = b.finish();

        let graph = build_function_osr(&proto, header_pc).unwrap();

        assert_eq!(graph.get(graph.start).kind, NodeKind::OsrStart);
        let loaded: std::collections::HashSet<u8> = (0..graph.len() as u32)
            .filter_map(|id| match graph.get(id).kind {
                NodeKind::OsrLoad(reg) => Some(reg),
                _ => None,
            })
            .collect();
        assert!(loaded.is_superset(&[0u8, 1, 2].into_iter().collect()));

        find(&graph, |k| matches!(k, NodeKind::Loop));
        find(&graph, |k| matches!(k, NodeKind::LoopExit));
        let trap = find(&graph, |k| matches!(k, NodeKind::Trap));
        assert!(graph.get(trap).control_succs.contains(&graph.end));
    }

    #[test]
    fn osr_entry_at_a_nested_loop_peels_the_enclosing_loop_bottom_up() {
        let mut b = BytecodeBuilder::new("f", 0);
        b.emit_f(Opcode::Load0, 0, si()).unwrap(); // reg0 = s
        b.emit_f(Opcode::Load0, 1, si()).unwrap(); // reg1 = i (outer induction)
        b.emit_f(Opcode::Load1, 2, si()).unwrap(); // reg2 = outer bound
        b.emit_f(Opcode::Load0, 3, si()).unwrap(); // reg3 = j (inner induction)
        b.emit_f(Opcode::Load1, 4, si()).unwrap(); // reg4 = inner bound
        let outer_header_pc = b.current_pc();
        let outer_fstart = b.emit_h_label(Opcode::Fstart, 1, 2, 0, si()).unwrap();
        let inner_header_pc = b.current_pc();
        let inner_fstart = b.emit_h_label(Opcode::Fstart, 3, 4, 0, si()).unwrap();
        b.emit_d(Opcode::Add, 0, 0, 3, si()).unwrap();
        let inner_fend = b.emit_h_label(Opcode::Fend1, 3, 4, 0, si()).unwrap();
        let after_inner = b.current_pc();
        inner_fstart.patch(&mut b, after_inner);
        inner_fend.patch(&mut b, inner_header_pc);
        b.emit_d(Opcode::Add, 0, 0, 1, si()).unwrap(); // remainder of the outer body
        let outer_fend = b.emit_h_label(Opcode::Fend1, 1, 2, 0, si()).unwrap();
        let after_outer = b.current_pc();
        outer_fstart.patch(&mut b, after_outer);
        outer_fend.patch(&mut b, outer_header_pc);
        b.emit_f(Opcode::Ret, 0, si()).unwrap();
        let proto = b.finish();

        let graph = build_function_osr(&proto, inner_header_pc).unwrap();

        assert_eq!(graph.get(graph.start).kind, NodeKind::OsrStart);
        // only the inner loop gets a fresh header; the outer loop is peeled.
        let loop_count = (0..graph.len() as u32)
            .filter(|&id| matches!(graph.get(id).kind, NodeKind::Loop))
            .count();
        assert_eq!(loop_count, 1);
        let exit_count = (0..graph.len() as u32)
            .filter(|&id| matches!(graph.get(id).kind, NodeKind::LoopExit))
            .count();
        assert_eq!(exit_count, 2);
        let trap = find(&graph, |k| matches!(k, NodeKind::Trap));
        assert!(graph.get(trap).control_succs.contains(&graph.end));
    }

    #[test]
    fn osr_entry_must_name_a_loop_header() {
        let mut b = BytecodeBuilder::new("f", 0);
        b.emit_f(Opcode::Load0, 0, si()).unwrap();
        b.emit_f(Opcode::Ret, 0, si()).unwrap();
        let proto = b.finish();

        assert!(build_function_osr(&proto, 0).is_err());
    }

    #[test]
    fn tail_call_is_detected_when_ret_immediately_follows() {
        let mut b = BytecodeBuilder::new("f", 1);
        b.emit_d(Opcode::Call, 0, 0, 0, si()).unwrap();
        b.emit_f(Opcode::Ret, 0, si()).unwrap();
        let proto = b.finish();
        let graph = build_function(&proto).unwrap();

        let call = find(&graph, |k| matches!(k, NodeKind::Call { tail_call: true }));
        assert!(matches!(graph.get(call).kind, NodeKind::Call { tail_call: true }));
    }
}
