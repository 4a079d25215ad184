//! Sea-of-nodes graph storage (§3.4, §4.4, §9 Design Notes).
//!
//! Nodes live in a per-graph arena and are referenced by index
//! (`NodeId`), never by pointer -- the arena owns everything, edges are
//! non-owning ids. This follows the Design Notes' recommendation of a
//! flat tagged-variant `Node` over the source's deep `Node <- Expr <-
//! PhiNode <- Phi` inheritance chain: one struct, one kind-specific
//! payload enum, `IsWriteEffect`/`IsControlFlow`-style capability checks
//! as plain methods instead of virtual dispatch.

use rustc_hash::FxHashMap;

pub type NodeId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryKind {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Float64,
    Boolean,
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    Hard,
    Soft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    IfMerge,
    LoopMerge,
}

/// §4.4's node catalogue. Everything the builder in this crate actually
/// constructs is exercised by a test; the remaining variants (typed
/// lowering forms, guards, checkpoints) exist only so later lowering
/// passes have somewhere to land -- per §4.4, "added by later lowering;
/// not produced by the initial builder but must be representable".
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    // --- control flow -----------------------------------------------
    Start,
    End,
    Region,
    If,
    IfTrue,
    IfFalse,
    Merge(MergeKind),
    Loop,
    LoopExit,
    LoopHeader,
    Jump,
    Return,
    Success,
    Fail,
    Trap,
    OsrStart,
    OsrEnd,
    InlineStart,
    InlineEnd,

    // --- pure expressions --------------------------------------------
    Arg(u8),
    Float64(u64), // f64::to_bits, so GVN hashing/equality is exact
    Boolean(bool),
    LString(String),
    SString(u32),
    Nil,
    Unary(UnaryKind),
    Binary(BinaryKind),
    Ternary,
    Phi,
    Projection(u32),
    /// For-each loop step (§4.3's `FEEND` exit test): advances the
    /// iterator in its sole operand and yields a has-next boolean;
    /// `Projection(itr_next, 0/1)` extracts the key/value pair.
    ItrNext,
    /// Closure allocation naming an entry in the script's flat function
    /// table (§6 `Closure` opcode). Never GVN'd: two textually identical
    /// closure literals still allocate distinct closure objects.
    Closure(u16),
    /// OSR entry value: reloads register `index` from the interpreter
    /// frame (§4.3's OSR entry). Pinned to the `OsrStart` region.
    OsrLoad(u8),

    // --- typed lowering forms (representable, not builder-produced) --
    Float64Negate,
    Float64Arithmetic(BinaryKind),
    Float64Bitwise(BinaryKind),
    Float64Compare(BinaryKind),
    StringCompare(BinaryKind),
    SStringEq,
    SStringNe,
    BooleanNot,
    BooleanLogic(BinaryKind),
    Box(TypeKind),
    Unbox(TypeKind),
    CastToBoolean,
    TestType(TypeKind),
    Guard,
    Checkpoint,
    StackSlot(u16),

    // --- calls ---------------------------------------------------------
    Call { tail_call: bool },

    // --- memory / effect -----------------------------------------------
    GlobalGet(String),
    GlobalSet(String),
    WriteEffect,
    ReadEffect,
    EffectBarrier(BarrierKind),
    EffectMerge,
    LoopEffectStart,
    InitBarrier,
    EmptyWriteEffect,
    BranchStartEffect,
}

impl NodeKind {
    pub fn is_write_effect(&self) -> bool {
        matches!(
            self,
            NodeKind::GlobalSet(_)
                | NodeKind::WriteEffect
                | NodeKind::EffectBarrier(_)
                | NodeKind::EffectMerge
                | NodeKind::LoopEffectStart
                | NodeKind::InitBarrier
                | NodeKind::EmptyWriteEffect
                | NodeKind::BranchStartEffect
        )
    }

    pub fn is_effect_barrier(&self) -> bool {
        matches!(self, NodeKind::EffectBarrier(_))
    }

    pub fn is_init_barrier(&self) -> bool {
        matches!(self, NodeKind::InitBarrier)
    }

    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            NodeKind::Start
                | NodeKind::End
                | NodeKind::Region
                | NodeKind::If
                | NodeKind::IfTrue
                | NodeKind::IfFalse
                | NodeKind::Merge(_)
                | NodeKind::Loop
                | NodeKind::LoopExit
                | NodeKind::LoopHeader
                | NodeKind::Jump
                | NodeKind::Return
                | NodeKind::Success
                | NodeKind::Fail
                | NodeKind::Trap
                | NodeKind::OsrStart
                | NodeKind::OsrEnd
                | NodeKind::InlineStart
                | NodeKind::InlineEnd
        )
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Data-edge operands, in order.
    pub operands: Vec<NodeId>,
    /// Reverse references: nodes that use this one as an operand.
    /// Simplified from the Design Notes' recommended intrusive
    /// prev/next ref-list primitive (O(1) unlink) to a plain `Vec`
    /// rebuilt by `replace` -- documented in DESIGN.md.
    pub uses: Vec<NodeId>,
    /// Control-flow predecessors (only meaningful for control nodes).
    pub control_preds: Vec<NodeId>,
    pub control_succs: Vec<NodeId>,
    /// For a `WriteEffect`-family node: the previous write in the chain
    /// (the chain is reverse-linked, newest points to oldest).
    pub effect_prev: Option<NodeId>,
    /// For a side-effecting expression node: the region it is pinned to.
    pub pin: Option<NodeId>,
}

impl Node {
    fn new(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            operands: Vec::new(),
            uses: Vec::new(),
            control_preds: Vec::new(),
            control_succs: Vec::new(),
            effect_prev: None,
            pin: None,
        }
    }
}

/// Owns every node produced while building one function's graph.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    gvn: FxHashMap<(u8, u64, u64), NodeId>,
    pub start: NodeId,
    pub end: NodeId,
}

impl Graph {
    pub fn new() -> Self {
        let mut g = Self::default();
        g.start = g.push_raw(NodeKind::Start);
        g.end = g.push_raw(NodeKind::End);
        g
    }

    fn push_raw(&mut self, kind: NodeKind) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.nodes.push(Node::new(id, kind));
        id
    }

    /// Intern a pure, side-effect-free node. Literals and `Arg` reads
    /// are GVN-hashed by value so two identical literals collapse to
    /// one node (§8's round-trip law).
    pub fn new_node(&mut self, kind: NodeKind, operands: Vec<NodeId>) -> NodeId {
        if let Some(key) = gvn_key(&kind, &operands) {
            if let Some(&existing) = self.gvn.get(&key) {
                return existing;
            }
            let id = self.push_raw(kind);
            self.nodes[id as usize].operands = operands.clone();
            for &op in &operands {
                self.nodes[op as usize].uses.push(id);
            }
            self.gvn.insert(key, id);
            return id;
        }
        let id = self.push_raw(kind);
        self.nodes[id as usize].operands = operands.clone();
        for &op in &operands {
            self.nodes[op as usize].uses.push(id);
        }
        id
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id as usize]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_control_edge(&mut self, from: NodeId, to: NodeId) {
        self.nodes[from as usize].control_succs.push(to);
        self.nodes[to as usize].control_preds.push(from);
    }

    pub fn set_operand(&mut self, node: NodeId, index: usize, value: NodeId) {
        let old = self.nodes[node as usize].operands[index];
        self.nodes[node as usize].operands[index] = value;
        if let Some(pos) = self.nodes[old as usize].uses.iter().position(|&u| u == node) {
            self.nodes[old as usize].uses.remove(pos);
        }
        self.nodes[value as usize].uses.push(node);
    }

    pub fn push_operand(&mut self, node: NodeId, value: NodeId) {
        self.nodes[node as usize].operands.push(value);
        self.nodes[value as usize].uses.push(node);
    }

    /// `IsIdentical(a, b) <=> a.id == b.id` (§4.4).
    pub fn is_identical(a: NodeId, b: NodeId) -> bool {
        a == b
    }

    /// Rewrite every current use-site of `old` to point at `new`,
    /// merge the use lists, and clear `old`'s operands so it becomes
    /// unreferenced (§4.4, §8 invariant 7).
    pub fn replace(&mut self, old: NodeId, new: NodeId) {
        let users = std::mem::take(&mut self.nodes[old as usize].uses);
        for &user in &users {
            for i in 0..self.nodes[user as usize].operands.len() {
                if self.nodes[user as usize].operands[i] == old {
                    self.nodes[user as usize].operands[i] = new;
                }
            }
            self.nodes[new as usize].uses.push(user);
        }
        self.nodes[old as usize].operands.clear();
    }

    /// Walk a `WriteEffect`-family node backward to the nearest barrier
    /// (§9: corrected `EffectMerge::NextBarrier` semantics -- the
    /// source's version has an empty loop body and never advances).
    pub fn next_barrier(&self, mut write: NodeId) -> Option<NodeId> {
        loop {
            let node = &self.nodes[write as usize];
            if node.kind.is_effect_barrier() || node.kind.is_init_barrier() {
                return Some(write);
            }
            write = node.effect_prev?;
        }
    }
}

fn gvn_key(kind: &NodeKind, operands: &[NodeId]) -> Option<(u8, u64, u64)> {
    let op_hash = operands.iter().fold(0u64, |acc, &o| acc.wrapping_mul(31).wrapping_add(o as u64));
    match kind {
        NodeKind::Arg(i) => Some((0, *i as u64, 0)),
        NodeKind::Float64(bits) => Some((1, *bits, 0)),
        NodeKind::Boolean(b) => Some((2, *b as u64, 0)),
        NodeKind::Nil => Some((3, 0, 0)),
        NodeKind::SString(r) => Some((4, *r as u64, 0)),
        NodeKind::Unary(k) => Some((5, *k as u64, op_hash)),
        NodeKind::Binary(k) => Some((6, *k as u64, op_hash)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_float64_literals_collapse_via_gvn() {
        let mut g = Graph::new();
        let a = g.new_node(NodeKind::Float64(1.5f64.to_bits()), vec![]);
        let b = g.new_node(NodeKind::Float64(1.5f64.to_bits()), vec![]);
        assert!(Graph::is_identical(a, b));
    }

    #[test]
    fn distinct_float64_literals_are_not_identical() {
        let mut g = Graph::new();
        let a = g.new_node(NodeKind::Float64(1.0f64.to_bits()), vec![]);
        let b = g.new_node(NodeKind::Float64(2.0f64.to_bits()), vec![]);
        assert!(!Graph::is_identical(a, b));
    }

    #[test]
    fn replace_rewrites_every_user_and_empties_old_operands() {
        let mut g = Graph::new();
        let lit = g.new_node(NodeKind::Float64(3.0f64.to_bits()), vec![]);
        let neg = g.new_node(NodeKind::Unary(UnaryKind::Neg), vec![lit]);
        let new_lit = g.new_node(NodeKind::Float64(4.0f64.to_bits()), vec![]);
        g.replace(lit, new_lit);
        assert_eq!(g.get(neg).operands, vec![new_lit]);
        assert!(g.get(lit).uses.is_empty());
        assert!(g.get(lit).operands.is_empty());
    }

    #[test]
    fn next_barrier_walks_past_plain_writes() {
        let mut g = Graph::new();
        let barrier = g.push_raw(NodeKind::InitBarrier);
        let w1 = g.push_raw(NodeKind::WriteEffect);
        g.get_mut(w1).effect_prev = Some(barrier);
        let w2 = g.push_raw(NodeKind::WriteEffect);
        g.get_mut(w2).effect_prev = Some(w1);
        assert_eq!(g.next_barrier(w2), Some(barrier));
    }
}
