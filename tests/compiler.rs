//! Generator-level checks: static stack accounting, declaration plumbing,
//! and compile-time diagnostics.

mod common;

use common::AstBuilder;
use phpvm::ast::*;
use phpvm::{compile, CompileError};

#[test]
fn max_stack_is_computed_and_bounded() {
    let mut b = AstBuilder::new();
    // echo (1 + 2) * (3 + 4);
    let lhs = b.bin(BinaryOp::Add, Expr::Int(1), Expr::Int(2));
    let rhs = b.bin(BinaryOp::Add, Expr::Int(3), Expr::Int(4));
    let product = b.bin(BinaryOp::Mul, lhs, rhs);
    let echo = b.echo(vec![product]);
    let program = b.program(vec![echo]);
    let unit = compile(&program).expect("compiles");
    let max = unit.main.body.max_stack;
    assert!(max >= 2, "two operands are live at the multiply");
    assert!(max <= 8, "depth accounting should stay tight, got {}", max);
}

#[test]
fn functions_are_collected_with_bodies() {
    let mut b = AstBuilder::new();
    let x = b.v("x");
    let doubled = b.bin(BinaryOp::Add, x.clone(), x);
    let p = b.param("x");
    let decl = b.function("twice", vec![p], vec![Stmt::Return(Some(doubled))]);
    let program = b.program(vec![decl]);
    let unit = compile(&program).expect("compiles");
    assert_eq!(unit.functions.len(), 1);
    let func = &unit.functions[0];
    assert_eq!(func.name, "twice");
    assert_eq!(func.min_arity, 1);
    assert_eq!(func.max_arity, 1);
    assert!(!func.body.bytecode.is_empty());
}

#[test]
fn exception_table_orders_inner_entries_first() {
    let mut b = AstBuilder::new();
    let boom = b.str_lit("boom");
    let exc = b.new_object("Exception", vec![boom]);
    let inner = Stmt::Try {
        body: vec![Stmt::Throw(exc)],
        catches: vec![CatchClause {
            type_name: b.id("Exception"),
            variable: None,
            body: vec![],
        }],
        finally: None,
    };
    let outer = Stmt::Try {
        body: vec![inner],
        catches: vec![CatchClause {
            type_name: b.id("Exception"),
            variable: None,
            body: vec![],
        }],
        finally: None,
    };
    let program = b.program(vec![outer]);
    let unit = compile(&program).expect("compiles");
    let table = &unit.main.body.exception_table;
    assert_eq!(table.len(), 2);
    // The inner range nests inside the outer and precedes it.
    assert!(table[0].start >= table[1].start);
    assert!(table[0].end <= table[1].end);
}

#[test]
fn finally_entries_carry_the_finally_offset() {
    let mut b = AstBuilder::new();
    let x = b.str_lit("x");
    let echo = b.echo(vec![x]);
    let stmt = Stmt::Try {
        body: vec![],
        catches: vec![],
        finally: Some(vec![echo]),
    };
    let program = b.program(vec![stmt]);
    let unit = compile(&program).expect("compiles");
    let table = &unit.main.body.exception_table;
    assert_eq!(table.len(), 1);
    assert!(table[0].handler.is_none());
    assert!(table[0].finally.is_some());
}

#[test]
fn break_outside_loop_is_rejected() {
    let b = AstBuilder::new();
    let program = b.program(vec![Stmt::Break(1)]);
    assert!(matches!(
        compile(&program),
        Err(CompileError::BreakOutsideLoop)
    ));
}

#[test]
fn this_outside_method_is_rejected() {
    let mut b = AstBuilder::new();
    let this = b.v("this");
    let echo = b.echo(vec![this]);
    let program = b.program(vec![echo]);
    assert!(matches!(
        compile(&program),
        Err(CompileError::ThisOutsideMethod)
    ));
}

#[test]
fn non_literal_parameter_default_is_rejected() {
    let mut b = AstBuilder::new();
    let default = b.call("rand", vec![]);
    let mut p = b.param("x");
    p.default = Some(default);
    let decl = b.function("f", vec![p], vec![]);
    let program = b.program(vec![decl]);
    assert!(matches!(
        compile(&program),
        Err(CompileError::NonLiteralDefault)
    ));
}

#[test]
fn top_level_variables_use_global_slots() {
    let mut b = AstBuilder::new();
    let assign = b.assign_var("x", Expr::Int(1));
    let x = b.v("x");
    let echo = b.echo(vec![x]);
    let program = b.program(vec![assign, echo]);
    let unit = compile(&program).expect("compiles");
    assert_eq!(unit.global_names, vec!["x".to_string()]);
}

#[test]
fn class_declarations_reach_the_unit() {
    let mut b = AstBuilder::new();
    let m = b.method("hello", vec![], vec![Stmt::Return(Some(Expr::Int(1)))]);
    let class = b.class("Greeter", None, vec![], vec![m]);
    let program = b.program(vec![class]);
    let unit = compile(&program).expect("compiles");
    assert_eq!(unit.classes.len(), 1);
    assert_eq!(unit.classes[0].name, "Greeter");
    assert_eq!(unit.classes[0].methods.len(), 1);
}
