//! AST -> bytecode codegen (§4.1/C).
//!
//! A straightforward recursive-descent walk over [`lava_ast`]. Expression
//! compilation returns an [`ExprResult`] -- a literal that has not yet
//! been written to a register, or a register that already holds a live
//! value -- so constant-fold-free paths (e.g. passing a literal straight
//! into a call argument slot) still only cost one `Const*` emit instead
//! of two.
//!
//! Loop lowering is deliberately restricted to shapes the liveness
//! analyser (§4.2) can traverse without ambiguity: a `for` whose
//! condition is a simple comparison compiles to `FSTART`/body/`FEND1`
//! with no bytecode test inside the body; a `for` with no condition
//! compiles to `FEVRSTART`/body/`FEVREND`, escapable only via `break`.
//! Neither shape ever needs a `JMPF` whose false-edge straddles the loop
//! terminator, which the analyser does not attempt to disambiguate.
//!
//! Nested function literals ([`Expression::FuncExpr`]) push a fresh
//! [`FuncState`] onto `CodeGenerator`'s state stack; free identifiers
//! resolve outward through that stack one frame at a time, embedding a
//! parent register directly (`UpvalueState::Embed`) or chaining through
//! an already-captured upvalue of the intervening frame
//! (`UpvalueState::Detach`), the same two-case resolution the upvalue
//! slot encoding exists to represent (§3.1, §6).

use lava_ast::{BinaryOp, Expression, Function, LogicalOp, Script, Span, Statement, UnaryOp};
use lava_bytecode::encoding::SourceInfo;
use lava_bytecode::pool::PoolError;
use lava_bytecode::register::RegisterError;
use lava_bytecode::upvalue::UpvalueState;
use lava_bytecode::{BytecodeBuilder, Label, Opcode, Prototype, MAX_PROTOTYPE_SIZE};
use rustc_hash::FxHashMap;

use crate::error::{CompileError, CompileResult};

/// Small strings (by byte length) are interned via the SSO stand-in;
/// longer ones go in the long-string table. The real threshold is an
/// object-layer concern (out of scope); this is codegen's own
/// approximation of it.
const SSO_MAX_LEN: usize = 8;

/// The outcome of compiling an expression: either a value that has not
/// been written anywhere yet (a literal) or a register already holding
/// it. Deferring materialisation lets call/assign sites skip a
/// load-then-move round trip for the common case of a literal operand.
#[derive(Debug, Clone, Copy)]
enum ExprResult {
    Reg(u8),
    Float(f64),
    Bool(bool),
    Null,
}

impl ExprResult {
    fn into_register(self, cg: &mut CodeGenerator, span: Span) -> CompileResult<u8> {
        match self {
            ExprResult::Reg(r) => Ok(r),
            ExprResult::Float(f) => cg.materialize_number(f, span),
            ExprResult::Bool(true) => cg.emit_f_to_temp(Opcode::ConstTrue, span),
            ExprResult::Bool(false) => cg.emit_f_to_temp(Opcode::ConstFalse, span),
            ExprResult::Null => cg.emit_f_to_temp(Opcode::ConstNull, span),
        }
    }
}

struct LoopCtx {
    break_labels: Vec<Label>,
    continue_labels: Vec<Label>,
}

/// Where a resolved identifier lives relative to the function currently
/// being compiled.
enum VarLoc {
    Local(u8),
    Upvalue(u16),
    Global,
}

/// Per-function compilation state: one frame per nested [`FuncExpr`]
/// (plus one for the outermost function being compiled). `upvalue_names`
/// runs parallel to the builder's own upvalue table so a name already
/// captured by this frame is never captured twice.
struct FuncState {
    builder: BytecodeBuilder,
    scopes: Vec<FxHashMap<String, u8>>,
    loops: Vec<LoopCtx>,
    upvalue_names: Vec<String>,
}

impl FuncState {
    fn new(name: &str, argument_size: u8) -> Self {
        Self {
            builder: BytecodeBuilder::new(name, argument_size),
            scopes: Vec::new(),
            loops: Vec::new(),
            upvalue_names: Vec::new(),
        }
    }

    fn resolve_local(&self, name: &str) -> Option<u8> {
        self.scopes.iter().rev().find_map(|s| s.get(name).copied())
    }

    fn is_local_reg(&self, reg: u8) -> bool {
        self.scopes.iter().any(|s| s.values().any(|&r| r == reg))
    }
}

pub struct CodeGenerator {
    states: Vec<FuncState>,
    /// Finished prototypes, in the order their compilation completed;
    /// this is the script's flat function table. A `Closure` instruction
    /// names an entry here by index.
    prototypes: Vec<Prototype>,
}

/// Compile every top-level function in `script` into one flat function
/// table, depth-first: a function's own `Prototype` is appended only
/// after every closure nested inside it has already been compiled and
/// appended, so a `Closure` instruction's table index is always valid by
/// the time it is emitted.
pub fn compile_script(script: &Script) -> CompileResult<Vec<Prototype>> {
    if script.functions.len() > MAX_PROTOTYPE_SIZE {
        return Err(CompileError::TooManyPrototypes);
    }
    let mut seen = FxHashMap::default();
    for f in &script.functions {
        if let Some(name) = &f.name {
            if seen.insert(name.clone(), ()).is_some() {
                return Err(CompileError::FunctionNameRedefine { name: name.clone() });
            }
        }
    }

    let mut cg = CodeGenerator {
        states: Vec::new(),
        prototypes: Vec::new(),
    };
    for f in &script.functions {
        let proto = cg.compile_function_body(f)?;
        cg.prototypes.push(proto);
        if cg.prototypes.len() > MAX_PROTOTYPE_SIZE {
            return Err(CompileError::TooManyPrototypes);
        }
    }
    Ok(cg.prototypes)
}

/// Compile a single, standalone function (no enclosing scope, so any
/// free identifier that isn't a local resolves as a global). Used
/// directly by callers that only need one function's bytecode, and by
/// [`compile_script`] for each top-level entry.
pub fn compile_function(func: &Function) -> CompileResult<Prototype> {
    let mut cg = CodeGenerator {
        states: Vec::new(),
        prototypes: Vec::new(),
    };
    cg.compile_function_body(func)
}

impl CodeGenerator {
    fn state(&mut self) -> &mut FuncState {
        self.states.last_mut().expect("no active function state")
    }

    fn state_ref(&self) -> &FuncState {
        self.states.last().expect("no active function state")
    }

    /// Push a new frame, compile `func`'s body into it, finish the
    /// `Prototype`, and append it to the flat function table. Returns
    /// the table index at which the finished prototype now lives.
    fn compile_function_body(&mut self, func: &Function) -> CompileResult<Prototype> {
        self.states
            .push(FuncState::new(func.name.as_deref().unwrap_or("<anonymous>"), func.params.len() as u8));
        self.push_scope();
        for (i, name) in func.params.iter().enumerate() {
            self.state().scopes.last_mut().unwrap().insert(name.clone(), i as u8);
        }
        let mut terminated = false;
        for stmt in &func.body {
            terminated = self.compile_statement(stmt)?;
        }
        self.pop_scope();
        if !terminated {
            self.state().builder.emit_x(Opcode::RetNull, si(func.span))?;
        }
        let state = self.states.pop().expect("pushed above");
        Ok(state.builder.finish())
    }

    /// Compile `func` as a nested closure of the function currently being
    /// compiled, register it in the flat function table, and return its
    /// table index plus the registers/upvalue slots its `Closure`
    /// instruction must capture.
    fn compile_closure(&mut self, func: &Function, _span: Span) -> CompileResult<u16> {
        let proto = self.compile_function_body(func)?;
        let index = self.prototypes.len();
        if index >= MAX_PROTOTYPE_SIZE {
            return Err(CompileError::TooManyPrototypes);
        }
        self.prototypes.push(proto);
        u16::try_from(index).map_err(|_| CompileError::TooManyPrototypes)
    }

    fn push_scope(&mut self) {
        self.state().scopes.push(FxHashMap::default());
    }

    fn pop_scope(&mut self) {
        let scope = self.state().scopes.pop().expect("unbalanced lexical scope");
        let mut regs: Vec<u8> = scope.values().copied().collect();
        regs.sort_unstable_by(|a, b| b.cmp(a));
        for r in regs {
            self.state().builder.registers().drop_reg(r);
        }
    }

    fn declare_local(&mut self, name: &str, span: Span) -> CompileResult<u8> {
        let reg = self.grab(span)?;
        // Registers 0..max_local_var_size are reserved for locals (§3.1,
        // §3.2); record this one so the bound reflects every local ever
        // declared, not just the function's argument registers.
        self.state().builder.note_local_reserved(1);
        self.state().scopes.last_mut().unwrap().insert(name.to_string(), reg);
        Ok(reg)
    }

    fn is_local_reg(&self, reg: u8) -> bool {
        self.state_ref().is_local_reg(reg)
    }

    fn maybe_drop(&mut self, reg: u8) {
        if !self.is_local_reg(reg) {
            self.state().builder.registers().drop_reg(reg);
        }
    }

    fn grab(&mut self, span: Span) -> CompileResult<u8> {
        self.state().builder.registers().grab().map_err(|e| register_error(e, span))
    }

    fn emit_f_to_temp(&mut self, op: Opcode, span: Span) -> CompileResult<u8> {
        let reg = self.grab(span)?;
        self.state().builder.emit_f(op, reg, si(span))?;
        Ok(reg)
    }

    fn materialize_number(&mut self, value: f64, span: Span) -> CompileResult<u8> {
        let reg = self.grab(span)?;
        if value == 0.0 && value.is_sign_positive() {
            self.state().builder.emit_f(Opcode::Load0, reg, si(span))?;
        } else if value == 1.0 {
            self.state().builder.emit_f(Opcode::Load1, reg, si(span))?;
        } else if value == -1.0 {
            self.state().builder.emit_f(Opcode::LoadNeg1, reg, si(span))?;
        } else {
            let idx = self
                .state()
                .builder
                .constants()
                .add_real(value)
                .map_err(|e| pool_error(e, span))?;
            self.state().builder.emit_b(Opcode::ConstR, reg, idx, si(span))?;
        }
        Ok(reg)
    }

    fn intern_global_name(&mut self, name: &str, span: Span) -> CompileResult<u16> {
        self.state()
            .builder
            .constants()
            .add_string(name)
            .map_err(|e| pool_error(e, span))
    }

    /// Resolve `name` against the current frame's locals, then walk
    /// outward through enclosing frames for an upvalue capture, falling
    /// back to a global binding if neither finds it. An unresolved bare
    /// identifier is always a valid global, on read or assignment -- this
    /// generator has no member/index assignment target, so the
    /// `LocalVariableNotExisted` diagnostic (raised for those elsewhere)
    /// never applies here.
    fn resolve_variable(&mut self, name: &str, span: Span) -> CompileResult<VarLoc> {
        if let Some(reg) = self.state_ref().resolve_local(name) {
            return Ok(VarLoc::Local(reg));
        }
        if let Some(idx) = self.resolve_upvalue(self.states.len() - 1, name, span)? {
            return Ok(VarLoc::Upvalue(idx));
        }
        Ok(VarLoc::Global)
    }

    /// Classic nested-closure upvalue resolution: a name found as a
    /// local in the immediate parent frame is captured by embedding that
    /// register directly; a name found further out is captured by
    /// chaining through the parent's own (possibly freshly-created)
    /// upvalue slot for it.
    fn resolve_upvalue(&mut self, level: usize, name: &str, span: Span) -> CompileResult<Option<u16>> {
        if level == 0 {
            return Ok(None);
        }
        let parent = level - 1;
        if let Some(reg) = self.states[parent].resolve_local(name) {
            return self.capture_upvalue(level, name, UpvalueState::Embed, reg as u16, span).map(Some);
        }
        if let Some(parent_idx) = self.resolve_upvalue(parent, name, span)? {
            return self.capture_upvalue(level, name, UpvalueState::Detach, parent_idx, span).map(Some);
        }
        Ok(None)
    }

    fn capture_upvalue(
        &mut self,
        level: usize,
        name: &str,
        state: UpvalueState,
        index: u16,
        span: Span,
    ) -> CompileResult<u16> {
        if let Some(pos) = self.states[level].upvalue_names.iter().position(|n| n == name) {
            return Ok(pos as u16);
        }
        let idx = self.states[level]
            .builder
            .add_upvalue(state, index)
            .map_err(|e| match e {
                lava_bytecode::BuilderError::UpvalueOverflow => CompileError::UpvalueOverflow { span },
                other => CompileError::from(other),
            })?;
        self.states[level].upvalue_names.push(name.to_string());
        Ok(idx)
    }

    /// Compiles one statement; returns whether it unconditionally transfers
    /// control away (return/break/continue, or a block/if that always does),
    /// so callers can skip emitting dead fallthrough code after it.
    fn compile_statement(&mut self, stmt: &Statement) -> CompileResult<bool> {
        match stmt {
            Statement::VarDecl { name, init, span } => {
                let value_reg = match init {
                    Some(e) => {
                        let res = self.compile_expr(e)?;
                        Some(res.into_register(self, *span)?)
                    }
                    None => None,
                };
                let local_reg = self.declare_local(name, *span)?;
                if let Some(v) = value_reg {
                    if v != local_reg {
                        self.state().builder.emit_e(Opcode::Move, local_reg, v, si(*span))?;
                        self.maybe_drop(v);
                    }
                }
                Ok(false)
            }
            Statement::Expr(e) => {
                let res = self.compile_expr(e)?;
                if let ExprResult::Reg(r) = res {
                    self.maybe_drop(r);
                }
                Ok(false)
            }
            Statement::Block(stmts) => {
                self.push_scope();
                let mut terminated = false;
                for s in stmts {
                    terminated = self.compile_statement(s)?;
                }
                self.pop_scope();
                Ok(terminated)
            }
            Statement::Return(expr, span) => {
                match expr {
                    Some(e) => {
                        let reg = self.compile_expr(e)?.into_register(self, *span)?;
                        self.state().builder.emit_f(Opcode::Ret, reg, si(*span))?;
                    }
                    None => {
                        self.state().builder.emit_x(Opcode::RetNull, si(*span))?;
                    }
                }
                Ok(true)
            }
            Statement::If {
                cond,
                then_branch,
                else_branch,
                span,
            } => self.compile_if(cond, then_branch, else_branch.as_deref(), *span),
            Statement::For {
                init,
                cond,
                step,
                body,
                span,
            } => {
                self.compile_for(init.as_deref(), cond.as_ref(), step.as_ref(), body, *span)?;
                Ok(false)
            }
            Statement::Break(span) => {
                let label = self.state().builder.emit_g_label(Opcode::Brk, si(*span))?;
                self.state()
                    .loops
                    .last_mut()
                    .ok_or(CompileError::InvalidBreak { span: *span })?
                    .break_labels
                    .push(label);
                Ok(true)
            }
            Statement::Continue(span) => {
                let label = self.state().builder.emit_g_label(Opcode::Cont, si(*span))?;
                self.state()
                    .loops
                    .last_mut()
                    .ok_or(CompileError::InvalidContinue { span: *span })?
                    .continue_labels
                    .push(label);
                Ok(true)
            }
        }
    }

    /// `JMPF` with a trailing unconditional `JMP` when there is an else
    /// branch (so the liveness analyser can discover the merge point);
    /// no trailing jump when there isn't (the false edge falls straight
    /// through to the merge).
    fn compile_if(
        &mut self,
        cond: &Expression,
        then_branch: &[Statement],
        else_branch: Option<&[Statement]>,
        span: Span,
    ) -> CompileResult<bool> {
        let cond_reg = self.compile_expr(cond)?.into_register(self, span)?;
        self.maybe_drop(cond_reg);
        let jmpf = self.state().builder.emit_b_label(Opcode::Jmpf, cond_reg, si(span))?;

        self.push_scope();
        let mut then_terminated = false;
        for s in then_branch {
            then_terminated = self.compile_statement(s)?;
        }
        self.pop_scope();

        let terminated = match else_branch {
            Some(else_stmts) => {
                let jmp = self.state().builder.emit_g_label(Opcode::Jmp, si(span))?;
                let false_pc = self.state().builder.current_pc();
                jmpf.patch(&mut self.state().builder, false_pc);

                self.push_scope();
                let mut else_terminated = false;
                for s in else_stmts {
                    else_terminated = self.compile_statement(s)?;
                }
                self.pop_scope();

                let merge_pc = self.state().builder.current_pc();
                jmp.patch(&mut self.state().builder, merge_pc);
                then_terminated && else_terminated
            }
            None => {
                let false_pc = self.state().builder.current_pc();
                jmpf.patch(&mut self.state().builder, false_pc);
                false
            }
        };
        Ok(terminated)
    }

    fn compile_for(
        &mut self,
        init: Option<&Statement>,
        cond: Option<&Expression>,
        step: Option<&Expression>,
        body: &[Statement],
        span: Span,
    ) -> CompileResult<()> {
        self.push_scope();
        if let Some(init) = init {
            self.compile_statement(init)?;
        }

        let simple_cmp = match cond {
            Some(Expression::Binary { op, left, right, .. }) if is_comparison(*op) => {
                Some((*op, left.as_ref(), right.as_ref()))
            }
            Some(_) => {
                return Err(CompileError::Internal {
                    message: "for-loop condition must be a simple comparison or omitted".to_string(),
                })
            }
            None => None,
        };

        let (fstart, fend_op) = match simple_cmp {
            Some((op, left, right)) => {
                let lhs_reg = self.compile_expr(left)?.into_register(self, span)?;
                let rhs_reg = self.compile_expr(right)?.into_register(self, span)?;
                let label =
                    self.state()
                        .builder
                        .emit_h_label(Opcode::Fstart, lhs_reg, rhs_reg, cmp_tag(op), si(span))?;
                (ForHeader::Compare { label, lhs_reg, rhs_reg, op }, Opcode::Fend1)
            }
            None => {
                let label = self.state().builder.emit_h_label(Opcode::Fevrstart, 0, 0, 0, si(span))?;
                (ForHeader::Infinite { label }, Opcode::Fevrend)
            }
        };

        let body_start = self.state().builder.current_pc();
        self.state().loops.push(LoopCtx {
            break_labels: Vec::new(),
            continue_labels: Vec::new(),
        });

        self.push_scope();
        for s in body {
            self.compile_statement(s)?;
        }
        self.pop_scope();

        let continue_pc = self.state().builder.current_pc();
        if let Some(step) = step {
            let res = self.compile_expr(step)?;
            if let ExprResult::Reg(r) = res {
                self.maybe_drop(r);
            }
        }

        let fend_label = match &fstart {
            ForHeader::Compare { lhs_reg, rhs_reg, op, .. } => {
                self.state()
                    .builder
                    .emit_h_label(fend_op, *lhs_reg, *rhs_reg, cmp_tag(*op), si(span))?
            }
            ForHeader::Infinite { .. } => self.state().builder.emit_h_label(fend_op, 0, 0, 0, si(span))?,
        };
        fend_label.patch(&mut self.state().builder, body_start);

        let after_pc = self.state().builder.current_pc();
        match fstart {
            ForHeader::Compare { label, .. } => label.patch(&mut self.state().builder, after_pc),
            ForHeader::Infinite { label } => label.patch(&mut self.state().builder, after_pc),
        }

        let ctx = self.state().loops.pop().expect("pushed above");
        for l in ctx.break_labels {
            l.patch(&mut self.state().builder, after_pc);
        }
        for l in ctx.continue_labels {
            l.patch(&mut self.state().builder, continue_pc);
        }

        self.pop_scope();
        Ok(())
    }

    fn compile_expr(&mut self, expr: &Expression) -> CompileResult<ExprResult> {
        match expr {
            Expression::Int(i, _) => Ok(ExprResult::Float(*i as f64)),
            Expression::Float(f, _) => Ok(ExprResult::Float(*f)),
            Expression::Bool(b, _) => Ok(ExprResult::Bool(*b)),
            Expression::Null(_) => Ok(ExprResult::Null),
            Expression::Str(s, span) => {
                let reg = self.grab(*span)?;
                if s.len() <= SSO_MAX_LEN {
                    let sso = self.state().builder.add_sso(s)?;
                    self.state().builder.emit_b(Opcode::ConstSso, reg, sso.0 as u16, si(*span))?;
                } else {
                    let idx = self
                        .state()
                        .builder
                        .constants()
                        .add_string(s)
                        .map_err(|e| pool_error(e, *span))?;
                    self.state().builder.emit_b(Opcode::ConstStr, reg, idx, si(*span))?;
                }
                Ok(ExprResult::Reg(reg))
            }
            Expression::Identifier(name, span) => match self.resolve_variable(name, *span)? {
                VarLoc::Local(reg) => Ok(ExprResult::Reg(reg)),
                VarLoc::Upvalue(idx) => {
                    let reg = self.grab(*span)?;
                    self.state().builder.emit_b(Opcode::Uvget, reg, idx, si(*span))?;
                    Ok(ExprResult::Reg(reg))
                }
                VarLoc::Global => {
                    let idx = self.intern_global_name(name, *span)?;
                    let reg = self.grab(*span)?;
                    self.state().builder.emit_b(Opcode::Gget, reg, idx, si(*span))?;
                    Ok(ExprResult::Reg(reg))
                }
            },
            Expression::Binary { op, left, right, span } => {
                let lhs = self.compile_expr(left)?.into_register(self, *span)?;
                let rhs = self.compile_expr(right)?.into_register(self, *span)?;
                let dest = self.grab(*span)?;
                self.state().builder.emit_d(binary_opcode(*op), dest, lhs, rhs, si(*span))?;
                self.maybe_drop(lhs);
                self.maybe_drop(rhs);
                Ok(ExprResult::Reg(dest))
            }
            Expression::Logical { op, left, right, span } => self.compile_logical(*op, left, right, *span),
            Expression::Unary { op, operand, span } => {
                let src = self.compile_expr(operand)?.into_register(self, *span)?;
                let dest = self.grab(*span)?;
                let opcode = match op {
                    UnaryOp::Neg => Opcode::Neg,
                    UnaryOp::Not => Opcode::Not,
                };
                self.state().builder.emit_e(opcode, dest, src, si(*span))?;
                self.maybe_drop(src);
                Ok(ExprResult::Reg(dest))
            }
            Expression::Assign { name, value, span } => {
                let v = self.compile_expr(value)?.into_register(self, *span)?;
                match self.resolve_variable(name, *span)? {
                    VarLoc::Local(local_reg) => {
                        if v != local_reg {
                            self.state().builder.emit_e(Opcode::Move, local_reg, v, si(*span))?;
                            self.maybe_drop(v);
                        }
                        Ok(ExprResult::Reg(local_reg))
                    }
                    VarLoc::Upvalue(idx) => {
                        self.state().builder.emit_c(Opcode::Uvset, idx, v, si(*span))?;
                        Ok(ExprResult::Reg(v))
                    }
                    VarLoc::Global => {
                        let idx = self.intern_global_name(name, *span)?;
                        self.state().builder.emit_c(Opcode::Gset, idx, v, si(*span))?;
                        Ok(ExprResult::Reg(v))
                    }
                }
            }
            Expression::Call { callee, args, span } => self.compile_call(callee, args, *span),
            Expression::FuncExpr(func, span) => {
                let index = self.compile_closure(func, *span)?;
                let dest = self.grab(*span)?;
                self.state().builder.emit_b(Opcode::Closure, dest, index, si(*span))?;
                Ok(ExprResult::Reg(dest))
            }
        }
    }

    /// `AND`/`OR` short-circuit: the left operand's register becomes the
    /// result slot; on short-circuit the jump skips straight past the
    /// right operand, leaving the left value as the final result.
    fn compile_logical(
        &mut self,
        op: LogicalOp,
        left: &Expression,
        right: &Expression,
        span: Span,
    ) -> CompileResult<ExprResult> {
        let left_reg = self.compile_expr(left)?.into_register(self, span)?;
        let opcode = match op {
            LogicalOp::And => Opcode::And,
            LogicalOp::Or => Opcode::Or,
        };
        let label = self.state().builder.emit_b_label(opcode, left_reg, si(span))?;

        let right_reg = self.compile_expr(right)?.into_register(self, span)?;
        if right_reg != left_reg {
            self.state().builder.emit_e(Opcode::Move, left_reg, right_reg, si(span))?;
            self.maybe_drop(right_reg);
        }

        let merge_pc = self.state().builder.current_pc();
        label.patch(&mut self.state().builder, merge_pc);
        Ok(ExprResult::Reg(left_reg))
    }

    fn compile_call(&mut self, callee: &Expression, args: &[Expression], span: Span) -> CompileResult<ExprResult> {
        let frame_base = self
            .state()
            .builder
            .registers()
            .reserve(1 + args.len() as u8)
            .map_err(|e| register_error(e, span))?;

        let callee_reg = self.compile_expr(callee)?.into_register(self, span)?;
        if callee_reg != frame_base {
            self.state().builder.emit_e(Opcode::Move, frame_base, callee_reg, si(span))?;
        }
        for (i, arg) in args.iter().enumerate() {
            let arg_reg = self.compile_expr(arg)?.into_register(self, span)?;
            let slot = frame_base + 1 + i as u8;
            if arg_reg != slot {
                self.state().builder.emit_e(Opcode::Move, slot, arg_reg, si(span))?;
            }
        }

        // Reclaim the whole call frame (callee + argument slots) *before*
        // grabbing the result register, so the result is allocated fresh
        // off the now-restored frontier/free-list and cannot be handed out
        // again to a sibling temporary (e.g. a second call on the other
        // side of a `+`) before this one's value is consumed.
        self.state().builder.registers().leave().map_err(|e| register_error(e, span))?;
        let dest = self.grab(span)?;
        self.state()
            .builder
            .emit_d(Opcode::Call, dest, frame_base, args.len() as u8, si(span))?;
        Ok(ExprResult::Reg(dest))
    }
}

enum ForHeader {
    Compare {
        label: Label,
        lhs_reg: u8,
        rhs_reg: u8,
        op: BinaryOp,
    },
    Infinite {
        label: Label,
    },
}

fn is_comparison(op: BinaryOp) -> bool {
    matches!(
        op,
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne
    )
}

/// Generalises §4.3's "`FEND1` exit condition is always `LT`" to carry
/// the actual comparison operator in the otherwise-unused `c` field,
/// since this surface language's `for` supports all six comparisons,
/// not only `<`.
fn cmp_tag(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::Lt => 0,
        BinaryOp::Le => 1,
        BinaryOp::Gt => 2,
        BinaryOp::Ge => 3,
        BinaryOp::Eq => 4,
        BinaryOp::Ne => 5,
        _ => unreachable!("cmp_tag called with a non-comparison operator"),
    }
}

fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Sub,
        BinaryOp::Mul => Opcode::Mul,
        BinaryOp::Div => Opcode::Div,
        BinaryOp::Mod => Opcode::Mod,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Le => Opcode::Le,
        BinaryOp::Gt => Opcode::Gt,
        BinaryOp::Ge => Opcode::Ge,
        BinaryOp::Eq => Opcode::Eq,
        BinaryOp::Ne => Opcode::Ne,
    }
}

fn si(span: Span) -> SourceInfo {
    SourceInfo::new(span.start, span.end)
}

fn register_error(e: RegisterError, span: Span) -> CompileError {
    match e {
        RegisterError::Overflow => CompileError::RegisterOverflow { span },
        RegisterError::UnbalancedScope => CompileError::Internal {
            message: "register scope stack unbalanced".to_string(),
        },
    }
}

fn pool_error(_e: PoolError, span: Span) -> CompileError {
    CompileError::TooManyLiterals { span }
}
