//! Bytecode liveness / loop analysis (§4.2).
//!
//! A single forward traversal over a finished [`Prototype`]'s code
//! buffer, populating two PC-indexed maps: which registers each basic
//! block defines, and which registers/upvalues/globals each loop
//! mutates. This is the precondition for correct φ-node placement
//! during HIR graph construction (§4.3) -- the graph builder never
//! recomputes liveness itself, it only consults these maps.

mod bitset;
pub mod decode;

pub use bitset::Bitset256;
pub use decode::{decode, Decoded};
use lava_bytecode::{Opcode, Prototype};
use rustc_hash::{FxHashMap, FxHashSet};

/// Local variable definitions visible in one lexical basic block, chained
/// to its enclosing scope.
#[derive(Debug, Clone)]
pub struct BasicBlockVariable {
    pub parent: Option<usize>,
    pub defined: Bitset256,
    pub start_pc: u16,
    pub end_pc: u16,
}

/// Registers, upvalues, and globals mutated anywhere in a loop body whose
/// defining scope lies outside the loop -- exactly the set that needs a
/// φ at the loop header (§3.3's invariant).
#[derive(Debug, Clone, Default)]
pub struct LoopModifiedVar {
    pub regs: Bitset256,
    pub upvalues: FxHashSet<u16>,
    globals_seen: FxHashSet<String>,
    pub globals: Vec<String>,
}

impl LoopModifiedVar {
    fn record_global(&mut self, name: String) {
        if self.globals_seen.insert(name.clone()) {
            self.globals.push(name);
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopHeaderInfo {
    pub parent: Option<usize>,
    pub bb: usize,
    pub start_pc: u16,
    pub end_pc: u16,
    pub modified: LoopModifiedVar,
}

impl LoopHeaderInfo {
    pub fn enclosed_bb(&self, analyze: &BytecodeAnalyze<'_>) -> Option<usize> {
        analyze.bb_arena[self.bb].parent
    }
}

/// Internal scan-loop exit reason.
enum ScanExit {
    /// Reached the requested stop PC.
    Boundary,
    /// Hit a loop-terminator opcode (Fend1/Fend2/Feend/Fevrend); the PC
    /// cursor is left pointing *at* it, unconsumed.
    LoopEnd,
}

pub struct BytecodeAnalyze<'p> {
    proto: &'p Prototype,
    max_local_var_size: u8,
    bb_arena: Vec<BasicBlockVariable>,
    bb_by_pc: FxHashMap<u16, usize>,
    loop_arena: Vec<LoopHeaderInfo>,
    loop_by_pc: FxHashMap<u16, usize>,
    bb_stack: Vec<usize>,
    loop_stack: Vec<usize>,
}

impl<'p> BytecodeAnalyze<'p> {
    pub fn new(proto: &'p Prototype) -> Self {
        let mut me = Self {
            proto,
            max_local_var_size: proto.max_local_var_size,
            bb_arena: Vec::new(),
            bb_by_pc: FxHashMap::default(),
            loop_arena: Vec::new(),
            loop_by_pc: FxHashMap::default(),
            bb_stack: Vec::new(),
            loop_stack: Vec::new(),
        };
        me.build();
        me
    }

    pub fn lookup_basic_block(&self, pc: u16) -> Option<&BasicBlockVariable> {
        self.bb_by_pc.get(&pc).map(|&i| &self.bb_arena[i])
    }

    pub fn lookup_loop_header(&self, pc: u16) -> Option<&LoopHeaderInfo> {
        self.loop_by_pc.get(&pc).map(|&i| &self.loop_arena[i])
    }

    /// Registers defined in `pc`'s basic block or any enclosing one --
    /// the slots an OSR entry at `pc` must reload from the interpreter
    /// frame (§4.3's OSR entry).
    pub fn live_registers_at(&self, pc: u16) -> Bitset256 {
        let mut live = Bitset256::new();
        let Some(&start_idx) = self.bb_by_pc.get(&pc) else {
            return live;
        };
        let mut idx = Some(start_idx);
        while let Some(i) = idx {
            for reg in self.bb_arena[i].defined.iter_set() {
                live.set(reg);
            }
            idx = self.bb_arena[i].parent;
        }
        live
    }

    /// The chain of loop headers strictly enclosing `pc`'s own loop,
    /// innermost first -- the order OSR peeling must walk (§4.3's
    /// "peels the remaining prefix of each enclosing loop, bottom-up").
    pub fn enclosing_loop_headers(&self, pc: u16) -> Vec<LoopHeaderInfo> {
        let mut out = Vec::new();
        let mut idx = self.loop_by_pc.get(&pc).and_then(|&i| self.loop_arena[i].parent);
        while let Some(i) = idx {
            out.push(self.loop_arena[i].clone());
            idx = self.loop_arena[i].parent;
        }
        out
    }

    fn is_local(&self, reg: u8) -> bool {
        (reg as usize) < self.max_local_var_size as usize
    }

    fn push_bb(&mut self, start: u16) -> usize {
        let parent = self.bb_stack.last().copied();
        let idx = self.bb_arena.len();
        self.bb_arena.push(BasicBlockVariable {
            parent,
            defined: Bitset256::new(),
            start_pc: start,
            end_pc: start,
        });
        self.bb_by_pc.insert(start, idx);
        self.bb_stack.push(idx);
        idx
    }

    fn pop_bb(&mut self, end: u16) {
        let idx = self.bb_stack.pop().expect("unbalanced basic-block scope");
        self.bb_arena[idx].end_pc = end;
    }

    fn push_loop(&mut self, bb: usize, start: u16) -> usize {
        let parent = self.loop_stack.last().copied();
        let idx = self.loop_arena.len();
        self.loop_arena.push(LoopHeaderInfo {
            parent,
            bb,
            start_pc: start,
            end_pc: start,
            modified: LoopModifiedVar::default(),
        });
        self.loop_by_pc.insert(start, idx);
        self.loop_stack.push(idx);
        idx
    }

    fn pop_loop(&mut self, end: u16) {
        let idx = self.loop_stack.pop().expect("unbalanced loop scope");
        self.loop_arena[idx].end_pc = end;
    }

    fn is_alive(&self, mut bb_idx: usize, reg: u8) -> bool {
        loop {
            if self.bb_arena[bb_idx].defined.get(reg) {
                return true;
            }
            match self.bb_arena[bb_idx].parent {
                Some(p) => bb_idx = p,
                None => return false,
            }
        }
    }

    /// §4.2's `kill(reg)` rule: the single source of truth for whether a
    /// register write stays local to this block or forces a loop φ.
    fn kill(&mut self, reg: u8) {
        let cur = *self.bb_stack.last().expect("scan outside a basic block");
        if self.bb_arena[cur].defined.get(reg) || !self.is_alive(cur, reg) {
            self.bb_arena[cur].defined.set(reg);
        } else if let Some(&loop_idx) = self.loop_stack.last() {
            if let Some(enclosed) = self.loop_arena[loop_idx].enclosed_bb(self) {
                if self.is_alive(enclosed, reg) {
                    self.loop_arena[loop_idx].modified.regs.set(reg);
                }
            }
        }
    }

    fn build(&mut self) {
        self.push_bb(0);
        let mut pc = 0usize;
        let stop = self.proto.code.len();
        let _ = self.scan(&mut pc, stop);
        self.pop_bb(stop as u16);
    }

    fn scan(&mut self, pc: &mut usize, stop: usize) -> (ScanExit, Option<u16>) {
        let mut merge_target = None;
        while *pc < stop {
            let d = decode(&self.proto.code, *pc);
            match d.op {
                Opcode::Load0
                | Opcode::Load1
                | Opcode::LoadNeg1
                | Opcode::ConstTrue
                | Opcode::ConstFalse
                | Opcode::ConstNull
                | Opcode::ConstR
                | Opcode::ConstStr
                | Opcode::ConstSso
                | Opcode::Move
                | Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::Neg
                | Opcode::Lt
                | Opcode::Le
                | Opcode::Gt
                | Opcode::Ge
                | Opcode::Eq
                | Opcode::Ne
                | Opcode::Not
                | Opcode::Call
                | Opcode::Gget
                | Opcode::Uvget
                | Opcode::Closure => {
                    self.kill(d.a as u8);
                    *pc += d.width;
                }
                Opcode::And | Opcode::Or | Opcode::Tern => {
                    let reg = d.a as u8;
                    if self.is_local(reg) {
                        self.kill(reg);
                    }
                    *pc = d.b as usize;
                }
                Opcode::Jmp => {
                    merge_target = Some(d.a as u16);
                    *pc += d.width;
                }
                Opcode::Jmpf => {
                    self.build_if(pc);
                }
                Opcode::Fstart | Opcode::Fevrstart => {
                    self.build_loop(pc);
                }
                Opcode::Gset => {
                    if self.loop_stack.last().is_some() {
                        if let Some(name) = self.proto.constants.string(d.a as u16) {
                            let name = name.to_string();
                            let loop_idx = *self.loop_stack.last().unwrap();
                            self.loop_arena[loop_idx].modified.record_global(name);
                        }
                    }
                    *pc += d.width;
                }
                Opcode::Uvset => {
                    if let Some(&loop_idx) = self.loop_stack.last() {
                        self.loop_arena[loop_idx].modified.upvalues.insert(d.a as u16);
                    }
                    *pc += d.width;
                }
                Opcode::Ret | Opcode::RetNull | Opcode::Brk | Opcode::Cont => {
                    *pc += d.width;
                }
                Opcode::Fend1 | Opcode::Fend2 | Opcode::Feend | Opcode::Fevrend => {
                    return (ScanExit::LoopEnd, merge_target);
                }
            }
        }
        (ScanExit::Boundary, merge_target)
    }

    /// `JMPF` translation (§4.2): a nested scope for the true branch,
    /// optionally followed by an else scope up to the merge point.
    fn build_if(&mut self, pc: &mut usize) {
        let d = decode(&self.proto.code, *pc);
        debug_assert_eq!(d.op, Opcode::Jmpf);
        let false_target = d.b as u16;
        *pc += d.width;

        self.push_bb(*pc as u16);
        let (exit, merge) = self.scan(pc, false_target as usize);
        self.pop_bb(*pc as u16);
        debug_assert!(matches!(exit, ScanExit::Boundary), "if-body must not straddle a loop end");

        match merge {
            Some(merge_pc) => {
                self.push_bb(false_target);
                let (exit, _) = self.scan(pc, merge_pc as usize);
                self.pop_bb(*pc as u16);
                debug_assert!(matches!(exit, ScanExit::Boundary));
                *pc = merge_pc as usize;
            }
            None => {
                *pc = false_target as usize;
            }
        }
    }

    /// Loop translation pre-pass (§4.2/§4.3): push a loop scope, scan the
    /// body until its terminator, record whether the induction register
    /// needs re-killing.
    fn build_loop(&mut self, pc: &mut usize) {
        let d = decode(&self.proto.code, *pc);
        debug_assert!(matches!(d.op, Opcode::Fstart | Opcode::Fevrstart));
        let induction_reg = d.a as u8;
        self.kill(induction_reg);
        *pc += d.width;

        let bb = self.push_bb(*pc as u16);
        let loop_idx = self.push_loop(bb, *pc as u16);

        let (exit, _) = self.scan(pc, self.proto.code.len());
        debug_assert!(matches!(exit, ScanExit::LoopEnd), "well-formed loop must end in an Fend*");

        let end_d = decode(&self.proto.code, *pc);
        if end_d.op != Opcode::Fend1 {
            // induction variable mutated on a non-trivial path out of the
            // loop body; force a φ for it too.
            self.kill(induction_reg);
        }
        *pc += end_d.width;

        self.pop_loop(*pc as u16);
        self.pop_bb(*pc as u16);
        let _ = loop_idx;
    }
}
