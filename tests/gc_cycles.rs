//! Cycle collection and destructor semantics, end to end.

mod common;

use common::{run_ok, AstBuilder};
use phpvm::ast::*;
use phpvm::{compile, Vm, VmOptions};
use std::sync::Arc;

/// `$a = new stdClass; $b = new stdClass; $a->x = $b; $b->x = $a;
/// unset($a); unset($b); echo gc_collect_cycles();`
#[test]
fn two_object_cycle_is_reclaimed() {
    let mut b = AstBuilder::new();
    let new_a = b.new_object("stdClass", vec![]);
    let assign_a = b.assign_var("a", new_a);
    let new_b = b.new_object("stdClass", vec![]);
    let assign_b = b.assign_var("b", new_b);
    let a_x = {
        let a = b.v("a");
        b.prop(a, "x")
    };
    let bv = b.v("b");
    let link_ab = Stmt::Expression(b.assign(a_x, bv));
    let b_x = {
        let bv = b.v("b");
        b.prop(bv, "x")
    };
    let av = b.v("a");
    let link_ba = Stmt::Expression(b.assign(b_x, av));
    let unset_a = Stmt::Unset(vec![b.v("a")]);
    let unset_b = Stmt::Unset(vec![b.v("b")]);
    let collect = b.call("gc_collect_cycles", vec![]);
    let echo = b.echo(vec![collect]);
    let program = b.program(vec![
        assign_a, assign_b, link_ab, link_ba, unset_a, unset_b, echo,
    ]);
    assert_eq!(run_ok(&program), "2");
}

/// Live object count returns to the pre-allocation baseline after the
/// cycle is collected.
#[test]
fn live_count_returns_to_baseline() {
    let mut b = AstBuilder::new();
    let new_a = b.new_object("stdClass", vec![]);
    let assign_a = b.assign_var("a", new_a);
    let new_b = b.new_object("stdClass", vec![]);
    let assign_b = b.assign_var("b", new_b);
    let a_x = {
        let a = b.v("a");
        b.prop(a, "x")
    };
    let bv = b.v("b");
    let link_ab = Stmt::Expression(b.assign(a_x, bv));
    let b_x = {
        let bv = b.v("b");
        b.prop(bv, "x")
    };
    let av = b.v("a");
    let link_ba = Stmt::Expression(b.assign(b_x, av));
    let unset_a = Stmt::Unset(vec![b.v("a")]);
    let unset_b = Stmt::Unset(vec![b.v("b")]);
    let program = b.program(vec![assign_a, assign_b, link_ab, link_ba, unset_a, unset_b]);

    let unit = Arc::new(compile(&program).expect("compiles"));
    let mut vm = Vm::new(Vec::new());
    vm.execute(&unit).expect("runs");
    let before = vm.live_boxes();
    assert!(before >= 2, "cycle should still be resident");
    let freed = vm.run_cycle_collection();
    assert_eq!(freed, 2);
    assert_eq!(vm.live_boxes(), before - 2);
}

/// Destructors in a collected cycle run exactly once per box, before the
/// sweep frees them.
#[test]
fn cycle_destructors_run_exactly_once() {
    let mut b = AstBuilder::new();
    let d = b.str_lit("D");
    let echo_d = b.echo(vec![d]);
    let dtor = b.method("__destruct", vec![], vec![echo_d]);
    let next = b.public_prop("next", None);
    let class = b.class("Node", None, vec![next], vec![dtor]);

    let new_a = b.new_object("Node", vec![]);
    let assign_a = b.assign_var("a", new_a);
    let new_b = b.new_object("Node", vec![]);
    let assign_b = b.assign_var("b", new_b);
    let a_next = {
        let a = b.v("a");
        b.prop(a, "next")
    };
    let bv = b.v("b");
    let link_ab = Stmt::Expression(b.assign(a_next, bv));
    let b_next = {
        let bv = b.v("b");
        b.prop(bv, "next")
    };
    let av = b.v("a");
    let link_ba = Stmt::Expression(b.assign(b_next, av));
    let unset_a = Stmt::Unset(vec![b.v("a")]);
    let unset_b = Stmt::Unset(vec![b.v("b")]);
    let collect = b.call("gc_collect_cycles", vec![]);
    let echo = b.echo(vec![collect]);
    let program = b.program(vec![
        class, assign_a, assign_b, link_ab, link_ba, unset_a, unset_b, echo,
    ]);
    assert_eq!(run_ok(&program), "DD2");
}

/// Acyclic release frees immediately and runs the destructor at the
/// release point, before later statements.
#[test]
fn acyclic_release_is_immediate() {
    let mut b = AstBuilder::new();
    let d = b.str_lit("D");
    let echo_d = b.echo(vec![d]);
    let dtor = b.method("__destruct", vec![], vec![echo_d]);
    let class = b.class("Tracer", None, vec![], vec![dtor]);
    let obj = b.new_object("Tracer", vec![]);
    let assign = b.assign_var("t", obj);
    let clear = b.assign_var("t", Expr::Null);
    let x = b.str_lit("x");
    let echo_x = b.echo(vec![x]);
    let program = b.program(vec![class, assign, clear, echo_x]);
    assert_eq!(run_ok(&program), "Dx");
}

/// A destructor that stores `$this` resurrects the box; the destructor
/// still fires exactly once.
#[test]
fn destructor_resurrection_is_tolerated() {
    let mut b = AstBuilder::new();
    // class Phoenix { public static $keep;
    //   function __destruct(){ self::$keep = $this; echo "D"; } }
    let keep_target = Expr::StaticPropertyAccess {
        class: b.id("self"),
        property: b.vid("keep"),
    };
    let this = b.v("this");
    let store = Stmt::Expression(b.assign(keep_target, this));
    let d = b.str_lit("D");
    let echo_d = b.echo(vec![d]);
    let dtor = b.method("__destruct", vec![], vec![store, echo_d]);
    let keep_prop = PropertyDecl {
        name: b.vid("keep"),
        visibility: Visibility::Public,
        is_static: true,
        readonly: false,
        type_hint: None,
        default: None,
        attributes: Vec::new(),
    };
    let class = b.class("Phoenix", None, vec![keep_prop], vec![dtor]);

    let obj = b.new_object("Phoenix", vec![]);
    let assign = b.assign_var("p", obj);
    let unset = Stmt::Unset(vec![b.v("p")]);
    let x = b.str_lit("x");
    let echo_x = b.echo(vec![x]);
    let survivor = Expr::Instanceof {
        expr: Box::new(Expr::StaticPropertyAccess {
            class: b.id("Phoenix"),
            property: b.vid("keep"),
        }),
        class: b.id("Phoenix"),
    };
    let cast = Expr::Cast {
        kind: CastKind::Int,
        expr: Box::new(survivor),
    };
    let echo_alive = b.echo(vec![cast]);
    let program = b.program(vec![class, assign, unset, echo_x, echo_alive]);
    assert_eq!(run_ok(&program), "Dx1");
}

/// Safepoints trigger collections once the roots buffer passes the
/// threshold; cyclic garbage does not accumulate across a loop.
#[test]
fn safepoint_collections_bound_cyclic_garbage() {
    let mut b = AstBuilder::new();
    let init = b.assign_var("i", Expr::Int(0));
    let i1 = b.v("i");
    let cond = b.bin(BinaryOp::LessThan, i1, Expr::Int(200));
    let new_a = b.new_object("stdClass", vec![]);
    let assign_a = b.assign_var("a", new_a);
    let a_x = {
        let a = b.v("a");
        b.prop(a, "x")
    };
    let av = b.v("a");
    let self_link = Stmt::Expression(b.assign(a_x, av));
    let unset_a = Stmt::Unset(vec![b.v("a")]);
    let i2 = b.v("i");
    let inc = Stmt::Expression(Expr::Unary {
        op: UnaryOp::PreInc,
        operand: Box::new(i2),
    });
    let while_loop = Stmt::While {
        condition: cond,
        body: vec![assign_a, self_link, unset_a, inc],
    };
    let program = b.program(vec![init, while_loop]);

    let unit = Arc::new(compile(&program).expect("compiles"));
    let mut vm = Vm::with_options(
        Vec::new(),
        VmOptions {
            gc_threshold: 16,
            ..VmOptions::default()
        },
    );
    vm.execute(&unit).expect("runs");
    assert!(
        vm.heap.stats.collections > 0,
        "threshold crossings should have triggered collections"
    );
    let freed_in_cycles = vm.heap.stats.cycle_boxes_freed;
    let final_sweep = vm.run_cycle_collection();
    assert_eq!(
        freed_in_cycles as usize + final_sweep,
        200,
        "every self-cycle is eventually reclaimed"
    );
}
