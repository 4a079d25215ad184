//! Full-pipeline scenarios: AST -> bytecode codegen -> liveness analysis
//! -> HIR graph construction, exercised only through the crate's public
//! surface (no reaching into `codegen`'s private `CodeGenerator` state).

use lava_ast::{BinaryOp as B, Expression as E, Function, LogicalOp as L, Script, Span, Statement as S};
use lava_compiler::analysis::BytecodeAnalyze;
use lava_compiler::{build_function, compile_function, compile_script, CompileError, NodeKind};

fn sp() -> Span {
    Span::new(0, 1)
}

fn func(body: Vec<S>) -> Function {
    Function {
        name: Some("f".to_string()),
        params: Vec::new(),
        body,
        span: sp(),
    }
}

fn find(graph: &lava_compiler::Graph, mut pred: impl FnMut(&NodeKind) -> bool) -> lava_compiler::NodeId {
    (0..graph.len() as u32)
        .find(|&id| pred(&graph.get(id).kind))
        .expect("expected node not found in graph")
}

#[test]
fn empty_function_compiles_and_builds_a_trivial_graph() {
    let proto = compile_function(&func(Vec::new())).unwrap();
    let graph = build_function(&proto).unwrap();

    let nil = find(&graph, |k| matches!(k, NodeKind::Nil));
    let ret = find(&graph, |k| matches!(k, NodeKind::Return));
    assert_eq!(graph.get(ret).operands, vec![nil]);
}

#[test]
fn arithmetic_return_feeds_a_binary_add_into_return() {
    let body = vec![S::Return(
        Some(E::Binary {
            op: B::Add,
            left: Box::new(E::Int(1, sp())),
            right: Box::new(E::Int(2, sp())),
            span: sp(),
        }),
        sp(),
    )];
    let proto = compile_function(&func(body)).unwrap();
    let graph = build_function(&proto).unwrap();

    let add = find(&graph, |k| matches!(k, NodeKind::Binary(lava_compiler::hir::BinaryKind::Add)));
    let ret = find(&graph, |k| matches!(k, NodeKind::Return));
    assert_eq!(graph.get(ret).operands, vec![add]);
}

#[test]
fn short_circuit_and_builds_a_graph_with_a_logical_and() {
    let body = vec![S::Return(
        Some(E::Logical {
            op: L::And,
            left: Box::new(E::Identifier("a".to_string(), sp())),
            right: Box::new(E::Identifier("b".to_string(), sp())),
            span: sp(),
        }),
        sp(),
    )];
    let mut f = func(body);
    f.params = vec!["a".to_string(), "b".to_string()];
    let proto = compile_function(&f).unwrap();
    let graph = build_function(&proto).unwrap();

    let and = find(&graph, |k| matches!(k, NodeKind::Binary(lava_compiler::hir::BinaryKind::And)));
    let ret = find(&graph, |k| matches!(k, NodeKind::Return));
    assert_eq!(graph.get(ret).operands, vec![and]);
}

#[test]
fn for_loop_with_induction_builds_a_phi_and_a_loop_exit() {
    let body = vec![
        S::For {
            init: Some(Box::new(S::VarDecl {
                name: "i".to_string(),
                init: Some(E::Int(0, sp())),
                span: sp(),
            })),
            cond: Some(E::Binary {
                op: B::Lt,
                left: Box::new(E::Identifier("i".to_string(), sp())),
                right: Box::new(E::Int(10, sp())),
                span: sp(),
            }),
            step: Some(E::Assign {
                name: "i".to_string(),
                value: Box::new(E::Binary {
                    op: B::Add,
                    left: Box::new(E::Identifier("i".to_string(), sp())),
                    right: Box::new(E::Int(1, sp())),
                    span: sp(),
                }),
                span: sp(),
            }),
            body: Vec::new(),
            span: sp(),
        },
        S::Return(None, sp()),
    ];
    let proto = compile_function(&func(body)).unwrap();
    let graph = build_function(&proto).unwrap();

    find(&graph, |k| matches!(k, NodeKind::Loop));
    find(&graph, |k| matches!(k, NodeKind::LoopExit));
    find(&graph, |k| matches!(k, NodeKind::Phi));
}

#[test]
fn break_inside_a_nested_loop_compiles_and_builds_without_error() {
    let inner = S::For {
        init: Some(Box::new(S::VarDecl {
            name: "j".to_string(),
            init: Some(E::Int(0, sp())),
            span: sp(),
        })),
        cond: Some(E::Binary {
            op: B::Lt,
            left: Box::new(E::Identifier("j".to_string(), sp())),
            right: Box::new(E::Int(5, sp())),
            span: sp(),
        }),
        step: Some(E::Assign {
            name: "j".to_string(),
            value: Box::new(E::Binary {
                op: B::Add,
                left: Box::new(E::Identifier("j".to_string(), sp())),
                right: Box::new(E::Int(1, sp())),
                span: sp(),
            }),
            span: sp(),
        }),
        body: vec![S::Break(sp())],
        span: sp(),
    };
    let outer = S::For {
        init: Some(Box::new(S::VarDecl {
            name: "i".to_string(),
            init: Some(E::Int(0, sp())),
            span: sp(),
        })),
        cond: Some(E::Binary {
            op: B::Lt,
            left: Box::new(E::Identifier("i".to_string(), sp())),
            right: Box::new(E::Int(5, sp())),
            span: sp(),
        }),
        step: Some(E::Assign {
            name: "i".to_string(),
            value: Box::new(E::Binary {
                op: B::Add,
                left: Box::new(E::Identifier("i".to_string(), sp())),
                right: Box::new(E::Int(1, sp())),
                span: sp(),
            }),
            span: sp(),
        }),
        body: vec![inner],
        span: sp(),
    };
    let proto = compile_function(&func(vec![outer, S::Return(None, sp())])).unwrap();
    let graph = build_function(&proto).unwrap();

    let loop_count = (0..graph.len() as u32).filter(|&id| matches!(graph.get(id).kind, NodeKind::Loop)).count();
    assert_eq!(loop_count, 2);
    find(&graph, |k| matches!(k, NodeKind::Jump));
}

#[test]
fn global_store_inside_a_loop_is_recorded_as_loop_modified() {
    let body = vec![
        S::For {
            init: Some(Box::new(S::VarDecl {
                name: "i".to_string(),
                init: Some(E::Int(0, sp())),
                span: sp(),
            })),
            cond: Some(E::Binary {
                op: B::Lt,
                left: Box::new(E::Identifier("i".to_string(), sp())),
                right: Box::new(E::Int(10, sp())),
                span: sp(),
            }),
            step: Some(E::Assign {
                name: "i".to_string(),
                value: Box::new(E::Binary {
                    op: B::Add,
                    left: Box::new(E::Identifier("i".to_string(), sp())),
                    right: Box::new(E::Int(1, sp())),
                    span: sp(),
                }),
                span: sp(),
            }),
            body: vec![S::Expr(E::Assign {
                name: "total".to_string(),
                value: Box::new(E::Identifier("i".to_string(), sp())),
                span: sp(),
            })],
            span: sp(),
        },
        S::Return(None, sp()),
    ];
    let proto = compile_function(&func(body)).unwrap();
    let analyze = BytecodeAnalyze::new(&proto);

    let loop_header_pc = proto
        .code
        .iter()
        .enumerate()
        .find(|(_, w)| (*w & 0xFF) as u8 == lava_bytecode::Opcode::Fstart.to_u8())
        .map(|(i, _)| i as u16 + 2)
        .unwrap();
    let header = analyze.lookup_loop_header(loop_header_pc).unwrap();
    assert!(header.modified.globals.contains(&"total".to_string()));
}

#[test]
fn closure_capturing_an_outer_local_compiles_through_compile_script() {
    let inner = Function {
        name: None,
        params: Vec::new(),
        body: vec![S::Return(Some(E::Identifier("x".to_string(), sp())), sp())],
        span: sp(),
    };
    let mut outer = func(vec![
        S::VarDecl {
            name: "g".to_string(),
            init: Some(E::FuncExpr(Box::new(inner), sp())),
            span: sp(),
        },
        S::Return(Some(E::Identifier("g".to_string(), sp())), sp()),
    ]);
    outer.name = Some("outer".to_string());
    outer.params = vec!["x".to_string()];

    let script = Script { functions: vec![outer] };
    let protos = compile_script(&script).unwrap();
    // the nested closure is appended before its owning top-level function.
    assert_eq!(protos.len(), 2);

    let outer_graph = build_function(&protos[1]).unwrap();
    find(&outer_graph, |k| matches!(k, NodeKind::Closure(0)));
}

#[test]
fn duplicate_top_level_names_are_rejected_before_any_codegen_runs() {
    let script = Script {
        functions: vec![func(Vec::new()), func(Vec::new())],
    };
    let err = compile_script(&script).unwrap_err();
    assert!(matches!(err, CompileError::FunctionNameRedefine { .. }));
}
