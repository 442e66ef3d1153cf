//! End-to-end execution tests.
//!
//! Programs are assembled against the AST contract (the parser lives
//! outside this crate) and checked by their observable output.

mod common;

use common::{run_ok, AstBuilder};
use phpvm::ast::*;
use phpvm::EngineError;

/// `function f($n){ if($n<=1) return 1; return $n*f($n-1); } echo f(5);`
#[test]
fn factorial_via_recursion() {
    let mut b = AstBuilder::new();
    let n = b.v("n");
    let cond = b.bin(BinaryOp::LessEqual, n, Expr::Int(1));
    let n2 = b.v("n");
    let n_minus_1 = b.bin(BinaryOp::Sub, n2, Expr::Int(1));
    let rec = b.call("f", vec![n_minus_1]);
    let n3 = b.v("n");
    let product = b.bin(BinaryOp::Mul, n3, rec);
    let p_n = b.param("n");
    let f = b.function(
        "f",
        vec![p_n],
        vec![
            Stmt::If {
                condition: cond,
                then_branch: vec![Stmt::Return(Some(Expr::Int(1)))],
                else_branch: None,
            },
            Stmt::Return(Some(product)),
        ],
    );
    let call = b.call("f", vec![Expr::Int(5)]);
    let echo = b.echo(vec![call]);
    let program = b.program(vec![f, echo]);
    assert_eq!(run_ok(&program), "120");
}

/// `$a = ["b"=>2, "a"=>1]; foreach($a as $k=>$v){ echo "$k=$v;"; }`
#[test]
fn array_insertion_order_survives_foreach() {
    let mut b = AstBuilder::new();
    let key_b = b.str_lit("b");
    let key_a = b.str_lit("a");
    let init = Expr::ArrayInit(vec![
        ArrayElement {
            key: Some(key_b),
            value: Expr::Int(2),
        },
        ArrayElement {
            key: Some(key_a),
            value: Expr::Int(1),
        },
    ]);
    let assign = b.assign_var("a", init);
    let k = b.v("k");
    let eq = b.str_lit("=");
    let v = b.v("v");
    let semi = b.str_lit(";");
    let echo = b.echo(vec![Expr::Interpolation(vec![k, eq, v, semi])]);
    let iterable = b.v("a");
    let foreach = Stmt::Foreach {
        iterable,
        key: Some(b.vid("k")),
        value: b.vid("v"),
        body: vec![echo],
    };
    let program = b.program(vec![assign, foreach]);
    assert_eq!(run_ok(&program), "b=2;a=1;");
}

/// foreach iterates the snapshot taken at `foreach_init`; appending during
/// iteration neither extends nor disturbs the sequence.
#[test]
fn foreach_iterates_the_snapshot() {
    let mut b = AstBuilder::new();
    let init = Expr::ArrayInit(vec![
        ArrayElement { key: None, value: Expr::Int(1) },
        ArrayElement { key: None, value: Expr::Int(2) },
        ArrayElement { key: None, value: Expr::Int(3) },
    ]);
    let assign = b.assign_var("a", init);
    let target = Expr::ArrayAccess {
        target: Box::new(b.v("a")),
        index: None,
    };
    let append = Stmt::Expression(b.assign(target, Expr::Int(99)));
    let v = b.v("v");
    let echo = b.echo(vec![v]);
    let iterable = b.v("a");
    let foreach = Stmt::Foreach {
        iterable,
        key: None,
        value: b.vid("v"),
        body: vec![append, echo],
    };
    let len = b.v("a");
    let count = b.call("count", vec![len]);
    let echo_count = b.echo(vec![count]);
    let program = b.program(vec![assign, foreach, echo_count]);
    assert_eq!(run_ok(&program), "1236");
}

/// `try { throw new RuntimeException("oops"); } catch (LogicException $e)
/// { echo "L"; } catch (RuntimeException $e) { echo "R"; } finally {
/// echo "F"; }`
#[test]
fn catch_matches_by_type_and_finally_runs() {
    let mut b = AstBuilder::new();
    let oops = b.str_lit("oops");
    let exc = b.new_object("RuntimeException", vec![oops]);
    let l = b.str_lit("L");
    let echo_l = b.echo(vec![l]);
    let r = b.str_lit("R");
    let echo_r = b.echo(vec![r]);
    let f = b.str_lit("F");
    let echo_f = b.echo(vec![f]);
    let stmt = Stmt::Try {
        body: vec![Stmt::Throw(exc)],
        catches: vec![
            CatchClause {
                type_name: b.id("LogicException"),
                variable: Some(b.vid("e")),
                body: vec![echo_l],
            },
            CatchClause {
                type_name: b.id("RuntimeException"),
                variable: Some(b.vid("e")),
                body: vec![echo_r],
            },
        ],
        finally: Some(vec![echo_f]),
    };
    let program = b.program(vec![stmt]);
    assert_eq!(run_ok(&program), "RF");
}

/// `$x=1; $f=function() use ($x){...}; $g=function() use (&$x){...};
/// $x=2; echo $f(),",",$g();`
#[test]
fn closure_capture_by_value_vs_by_reference() {
    let mut b = AstBuilder::new();
    let one = b.assign_var("x", Expr::Int(1));
    let ret_x = Stmt::Return(Some(b.v("x")));
    let f_closure = Expr::Closure {
        params: vec![],
        captures: vec![Capture {
            name: b.vid("x"),
            by_ref: false,
        }],
        body: vec![ret_x.clone()],
        is_static: false,
    };
    let assign_f = b.assign_var("f", f_closure);
    let g_closure = Expr::Closure {
        params: vec![],
        captures: vec![Capture {
            name: b.vid("x"),
            by_ref: true,
        }],
        body: vec![ret_x],
        is_static: false,
    };
    let assign_g = b.assign_var("g", g_closure);
    let two = b.assign_var("x", Expr::Int(2));
    let call_f = b.call_var("f", vec![]);
    let comma = b.str_lit(",");
    let call_g = b.call_var("g", vec![]);
    let echo = b.echo(vec![call_f, comma, call_g]);
    let program = b.program(vec![one, assign_f, assign_g, two, echo]);
    assert_eq!(run_ok(&program), "1,2");
}

/// `try { $x = intdiv(1,0); } catch (DivisionByZeroError $e) { echo "ok"; }`
#[test]
fn intdiv_by_zero_raises_division_by_zero_error() {
    let mut b = AstBuilder::new();
    let call = b.call("intdiv", vec![Expr::Int(1), Expr::Int(0)]);
    let assign = b.assign_var("x", call);
    let ok = b.str_lit("ok");
    let echo = b.echo(vec![ok]);
    let stmt = Stmt::Try {
        body: vec![assign],
        catches: vec![CatchClause {
            type_name: b.id("DivisionByZeroError"),
            variable: Some(b.vid("e")),
            body: vec![echo],
        }],
        finally: None,
    };
    let program = b.program(vec![stmt]);
    assert_eq!(run_ok(&program), "ok");
}

/// Division by zero with `/` and modulo by zero both raise.
#[test]
fn slash_division_by_zero_raises() {
    let mut b = AstBuilder::new();
    let div = b.bin(BinaryOp::Div, Expr::Int(1), Expr::Int(0));
    let echo_div = b.echo(vec![div]);
    let caught = b.str_lit("caught");
    let echo = b.echo(vec![caught]);
    let msg = b.v("e");
    let get_msg = b.method_call(msg, "getMessage", vec![]);
    let echo_msg = b.echo(vec![get_msg]);
    let stmt = Stmt::Try {
        body: vec![echo_div],
        catches: vec![CatchClause {
            type_name: b.id("DivisionByZeroError"),
            variable: Some(b.vid("e")),
            body: vec![echo, echo_msg],
        }],
        finally: None,
    };
    let program = b.program(vec![stmt]);
    assert_eq!(run_ok(&program), "caughtDivision by zero");
}

/// An inner handler wins over an outer one: innermost-entry dispatch.
#[test]
fn innermost_try_entry_catches_first() {
    let mut b = AstBuilder::new();
    let boom = b.str_lit("boom");
    let exc = b.new_object("Exception", vec![boom]);
    let inner_txt = b.str_lit("inner");
    let echo_inner = b.echo(vec![inner_txt]);
    let inner = Stmt::Try {
        body: vec![Stmt::Throw(exc)],
        catches: vec![CatchClause {
            type_name: b.id("Exception"),
            variable: None,
            body: vec![echo_inner],
        }],
        finally: None,
    };
    let outer_txt = b.str_lit("outer");
    let echo_outer = b.echo(vec![outer_txt]);
    let outer = Stmt::Try {
        body: vec![inner],
        catches: vec![CatchClause {
            type_name: b.id("Exception"),
            variable: None,
            body: vec![echo_outer],
        }],
        finally: None,
    };
    let program = b.program(vec![outer]);
    assert_eq!(run_ok(&program), "inner");
}

/// A `return` inside try still runs the finally block first.
#[test]
fn finally_runs_before_return() {
    let mut b = AstBuilder::new();
    let t = b.str_lit("t");
    let f = b.str_lit("F");
    let echo_f = b.echo(vec![f]);
    let body = vec![Stmt::Try {
        body: vec![Stmt::Return(Some(t))],
        catches: vec![],
        finally: Some(vec![echo_f]),
    }];
    let decl = b.function("f", vec![], body);
    let call = b.call("f", vec![]);
    let echo = b.echo(vec![call]);
    let program = b.program(vec![decl, echo]);
    assert_eq!(run_ok(&program), "Ft");
}

/// A `return` inside finally replaces a pending exception.
#[test]
fn return_in_finally_replaces_pending_exception() {
    let mut b = AstBuilder::new();
    let x = b.str_lit("x");
    let exc = b.new_object("Exception", vec![x]);
    let r = b.str_lit("R");
    let body = vec![Stmt::Try {
        body: vec![Stmt::Throw(exc)],
        catches: vec![],
        finally: Some(vec![Stmt::Return(Some(r))]),
    }];
    let decl = b.function("g", vec![], body);
    let call = b.call("g", vec![]);
    let echo = b.echo(vec![call]);
    let program = b.program(vec![decl, echo]);
    assert_eq!(run_ok(&program), "R");
}

/// Uncaught exceptions terminate with class and message in the report.
#[test]
fn uncaught_exception_reports_class_and_message() {
    let mut b = AstBuilder::new();
    let msg = b.str_lit("boom");
    let exc = b.new_object("RuntimeException", vec![msg]);
    let program = b.program(vec![Stmt::Throw(exc)]);
    match phpvm::run(&program) {
        Err(EngineError::Uncaught { class, message, .. }) => {
            assert_eq!(class, "RuntimeException");
            assert_eq!(message, "boom");
        }
        other => panic!("expected uncaught report, got {:?}", other.map(|_| ())),
    }
}

/// Numeric-string keys collapse onto integer slots; leading zeros do not.
#[test]
fn numeric_string_keys_canonicalize() {
    let mut b = AstBuilder::new();
    let k5 = b.str_lit("5");
    let init = Expr::ArrayInit(vec![ArrayElement {
        key: Some(k5),
        value: Expr::Int(1),
    }]);
    let assign = b.assign_var("a", init);
    // $a[5] = 2 overwrites the "5" slot; $a["05"] = 3 is a new slot.
    let idx_int = Expr::ArrayAccess {
        target: Box::new(b.v("a")),
        index: Some(Box::new(Expr::Int(5))),
    };
    let w1 = Stmt::Expression(b.assign(idx_int, Expr::Int(2)));
    let k05 = b.str_lit("05");
    let idx_str = Expr::ArrayAccess {
        target: Box::new(b.v("a")),
        index: Some(Box::new(k05)),
    };
    let w2 = Stmt::Expression(b.assign(idx_str, Expr::Int(3)));
    let arg = b.v("a");
    let count = b.call("count", vec![arg]);
    let echo_count = b.echo(vec![count]);
    let read = Expr::ArrayAccess {
        target: Box::new(b.v("a")),
        index: Some(Box::new(Expr::Int(5))),
    };
    let echo_five = b.echo(vec![read]);
    let program = b.program(vec![assign, w1, w2, echo_count, echo_five]);
    assert_eq!(run_ok(&program), "22");
}

/// Objects: constructor args, property access, method dispatch through the
/// inline cache, and `parent::__construct`.
#[test]
fn classes_with_inheritance_and_methods() {
    let mut b = AstBuilder::new();

    // class Animal { public $name; function __construct($name) {
    //   $this->name = $name; } function speak() { return "..."; } }
    let this_name = {
        let this = b.v("this");
        b.prop(this, "name")
    };
    let arg = b.v("name");
    let ctor_assign = Stmt::Expression(b.assign(this_name, arg));
    let p_name = b.param("name");
    let ctor = b.method("__construct", vec![p_name], vec![ctor_assign]);
    let dots = b.str_lit("...");
    let speak = b.method("speak", vec![], vec![Stmt::Return(Some(dots))]);
    let prop_name = b.public_prop("name", None);
    let animal = b.class("Animal", None, vec![prop_name], vec![ctor, speak]);

    // class Dog extends Animal { function speak() {
    //   return $this->name . " says woof"; } }
    let this_name2 = {
        let this = b.v("this");
        b.prop(this, "name")
    };
    let says = b.str_lit(" says woof");
    let concat = b.bin(BinaryOp::Concat, this_name2, says);
    let speak2 = b.method("speak", vec![], vec![Stmt::Return(Some(concat))]);
    let dog = b.class("Dog", Some("Animal"), vec![], vec![speak2]);

    let rex = b.str_lit("Rex");
    let new_dog = b.new_object("Dog", vec![rex]);
    let assign = b.assign_var("d", new_dog);
    let target = b.v("d");
    let call = b.method_call(target, "speak", vec![]);
    let echo = b.echo(vec![call]);

    let program = b.program(vec![animal, dog, assign, echo]);
    assert_eq!(run_ok(&program), "Rex says woof");
}

/// `__get` fires only for undefined properties.
#[test]
fn magic_get_covers_undefined_properties() {
    let mut b = AstBuilder::new();
    let magic_prefix = b.str_lit("magic:");
    let name_param = b.v("prop");
    let concat = b.bin(BinaryOp::Concat, magic_prefix, name_param);
    let p_prop = b.param("prop");
    let get = b.method("__get", vec![p_prop], vec![Stmt::Return(Some(concat))]);
    let real_default = b.str_lit("real");
    let real = b.public_prop("known", Some(real_default));
    let class = b.class("Box", None, vec![real], vec![get]);

    let new_box = b.new_object("Box", vec![]);
    let assign = b.assign_var("b", new_box);
    let t1 = b.v("b");
    let known = b.prop(t1, "known");
    let t2 = b.v("b");
    let unknown = b.prop(t2, "mystery");
    let comma = b.str_lit(",");
    let echo = b.echo(vec![known, comma, unknown]);
    let program = b.program(vec![class, assign, echo]);
    assert_eq!(run_ok(&program), "real,magic:mystery");
}

/// By-reference parameters write through to the caller's variable.
#[test]
fn by_reference_parameters() {
    let mut b = AstBuilder::new();
    let x1 = b.v("x");
    let sum = b.bin(BinaryOp::Add, x1, Expr::Int(1));
    let x2 = b.v("x");
    let assign_back = Stmt::Expression(b.assign(x2, sum));
    let p = b.param_by_ref("x");
    let decl = b.function("bump", vec![p], vec![assign_back]);
    let init = b.assign_var("y", Expr::Int(5));
    let y = b.v("y");
    let call = Stmt::Expression(b.call("bump", vec![y]));
    let y2 = b.v("y");
    let echo = b.echo(vec![y2]);
    let program = b.program(vec![decl, init, call, echo]);
    assert_eq!(run_ok(&program), "6");
}

/// The pipe operator feeds the left value as the single argument.
#[test]
fn pipe_lowers_to_a_one_argument_call() {
    let mut b = AstBuilder::new();
    // "hello" |> 'strlen'
    let hello = b.str_lit("hello");
    let strlen = b.str_lit("strlen");
    let piped = b.bin(BinaryOp::Pipe, hello, strlen);
    let echo1 = b.echo(vec![piped]);
    // 5 |> fn($x) => $x * 2
    let x = b.v("x");
    let double = b.bin(BinaryOp::Mul, x, Expr::Int(2));
    let p_x = b.param("x");
    let arrow = Expr::ArrowFunction {
        params: vec![p_x],
        body: Box::new(double),
    };
    let piped2 = b.bin(BinaryOp::Pipe, Expr::Int(5), arrow);
    let echo2 = b.echo(vec![piped2]);
    let program = b.program(vec![echo1, echo2]);
    assert_eq!(run_ok(&program), "510");
}

/// Arrow functions capture by value automatically.
#[test]
fn arrow_functions_capture_free_variables() {
    let mut b = AstBuilder::new();
    let init = b.assign_var("base", Expr::Int(10));
    let base = b.v("base");
    let n = b.v("n");
    let sum = b.bin(BinaryOp::Add, base, n);
    let p_n = b.param("n");
    let arrow = Expr::ArrowFunction {
        params: vec![p_n],
        body: Box::new(sum),
    };
    let assign_f = b.assign_var("f", arrow);
    let call = b.call_var("f", vec![Expr::Int(5)]);
    let echo = b.echo(vec![call]);
    let program = b.program(vec![init, assign_f, echo]);
    assert_eq!(run_ok(&program), "15");
}

/// Integer overflow promotes to float instead of wrapping.
#[test]
fn integer_overflow_promotes_to_float() {
    let mut b = AstBuilder::new();
    let max = b.int(i64::MAX);
    let sum = b.bin(BinaryOp::Add, max, Expr::Int(1));
    let is_float = b.call("is_numeric", vec![sum.clone()]);
    let echo1 = b.echo(vec![is_float]);
    let cast = Expr::Cast {
        kind: CastKind::Bool,
        expr: Box::new(b.bin(BinaryOp::GreaterThan, sum, Expr::Int(0))),
    };
    let echo2 = b.echo(vec![cast]);
    let program = b.program(vec![echo1, echo2]);
    assert_eq!(run_ok(&program), "11");
}

/// `json_decode` objects land as stdClass by default and as associative
/// arrays when `$assoc` is truthy.
#[test]
fn json_decode_assoc_parameter() {
    let mut b = AstBuilder::new();
    let doc = r#"{"a":1,"b":2}"#;

    let d1 = b.str_lit(doc);
    let decoded = b.call("json_decode", vec![d1]);
    let assign_o = b.assign_var("o", decoded);
    let is_std = Expr::Instanceof {
        expr: Box::new(b.v("o")),
        class: b.id("stdClass"),
    };
    let cast = Expr::Cast {
        kind: CastKind::Int,
        expr: Box::new(is_std),
    };
    let echo_std = b.echo(vec![cast]);
    let o = b.v("o");
    let prop_a = b.prop(o, "a");
    let echo_a = b.echo(vec![prop_a]);

    let d2 = b.str_lit(doc);
    let decoded_assoc = b.call("json_decode", vec![d2, Expr::Bool(true)]);
    let assign_a = b.assign_var("arr", decoded_assoc);
    let arr = b.v("arr");
    let count = b.call("count", vec![arr]);
    let echo_count = b.echo(vec![count]);
    let key_b = b.str_lit("b");
    let read_b = Expr::ArrayAccess {
        target: Box::new(b.v("arr")),
        index: Some(Box::new(key_b)),
    };
    let echo_b = b.echo(vec![read_b]);

    let program = b.program(vec![assign_o, echo_std, echo_a, assign_a, echo_count, echo_b]);
    assert_eq!(run_ok(&program), "1122");
}

/// JSON round trip: decoding then re-encoding a canonical document is the
/// identity.
#[test]
fn json_round_trip() {
    let mut b = AstBuilder::new();
    let doc = r#"{"a":1,"b":[1,2,"x"],"c":null}"#;
    let s = b.str_lit(doc);
    let decoded = b.call("json_decode", vec![s]);
    let encoded = b.call("json_encode", vec![decoded]);
    let echo = b.echo(vec![encoded]);
    let program = b.program(vec![echo]);
    assert_eq!(run_ok(&program), doc);
}

/// switch dispatches through the jump table, with PHP fallthrough.
#[test]
fn switch_with_table_and_fallthrough() {
    let mut b = AstBuilder::new();
    let one = b.str_lit("one");
    let echo_one = b.echo(vec![one]);
    let two = b.str_lit("two");
    let echo_two = b.echo(vec![two]);
    let other = b.str_lit("other");
    let echo_other = b.echo(vec![other]);
    let subject = b.v("n");
    let init = b.assign_var("n", Expr::Int(1));
    let switch = Stmt::Switch {
        subject,
        cases: vec![
            SwitchCase {
                value: Expr::Int(1),
                body: vec![echo_one], // falls through into case 2
            },
            SwitchCase {
                value: Expr::Int(2),
                body: vec![echo_two, Stmt::Break(1)],
            },
        ],
        default: Some(vec![echo_other]),
    };
    let program = b.program(vec![init, switch]);
    assert_eq!(run_ok(&program), "onetwo");
}

/// while/break/continue bookkeeping.
#[test]
fn loops_with_break_and_continue() {
    let mut b = AstBuilder::new();
    let init = b.assign_var("i", Expr::Int(0));
    let i1 = b.v("i");
    let cond = b.bin(BinaryOp::LessThan, i1, Expr::Int(10));
    let i2 = b.v("i");
    let inc = Stmt::Expression(Expr::Unary {
        op: UnaryOp::PreInc,
        operand: Box::new(i2),
    });
    let i3 = b.v("i");
    let is_three = b.bin(BinaryOp::Equal, i3, Expr::Int(3));
    let skip = Stmt::If {
        condition: is_three,
        then_branch: vec![Stmt::Continue(1)],
        else_branch: None,
    };
    let i4 = b.v("i");
    let is_six = b.bin(BinaryOp::Equal, i4, Expr::Int(6));
    let stop = Stmt::If {
        condition: is_six,
        then_branch: vec![Stmt::Break(1)],
        else_branch: None,
    };
    let i5 = b.v("i");
    let echo = b.echo(vec![i5]);
    let while_loop = Stmt::While {
        condition: cond,
        body: vec![inc, skip, stop, echo],
    };
    let program = b.program(vec![init, while_loop]);
    assert_eq!(run_ok(&program), "1245");
}

/// Strict identity: strings by content, objects by box.
#[test]
fn identity_semantics() {
    let mut b = AstBuilder::new();
    let s1 = b.str_lit("abc");
    let s2 = b.str_lit("abc");
    let ident = b.bin(BinaryOp::Identical, s1, s2);
    let cast1 = Expr::Cast {
        kind: CastKind::Int,
        expr: Box::new(ident),
    };
    let echo1 = b.echo(vec![cast1]);

    let o1 = b.new_object("stdClass", vec![]);
    let assign1 = b.assign_var("o1", o1);
    let o2 = b.new_object("stdClass", vec![]);
    let assign2 = b.assign_var("o2", o2);
    let ov1 = b.v("o1");
    let ov2 = b.v("o2");
    let obj_ident = b.bin(BinaryOp::Identical, ov1, ov2);
    let cast2 = Expr::Cast {
        kind: CastKind::Int,
        expr: Box::new(obj_ident),
    };
    let echo2 = b.echo(vec![cast2]);
    let ov3 = b.v("o1");
    let ov4 = b.v("o1");
    let same_ident = b.bin(BinaryOp::Identical, ov3, ov4);
    let cast3 = Expr::Cast {
        kind: CastKind::Int,
        expr: Box::new(same_ident),
    };
    let echo3 = b.echo(vec![cast3]);

    let program = b.program(vec![echo1, assign1, assign2, echo2, echo3]);
    assert_eq!(run_ok(&program), "101");
}

/// Loose equality juggles numeric strings.
#[test]
fn loose_equality_type_juggling() {
    let mut b = AstBuilder::new();
    let s = b.str_lit("42");
    let eq = b.bin(BinaryOp::Equal, s, Expr::Int(42));
    let c1 = Expr::Cast {
        kind: CastKind::Int,
        expr: Box::new(eq),
    };
    let echo1 = b.echo(vec![c1]);
    let s2 = b.str_lit("abc");
    let neq = b.bin(BinaryOp::Equal, s2, Expr::Int(0));
    let c2 = Expr::Cast {
        kind: CastKind::Int,
        expr: Box::new(neq),
    };
    let echo2 = b.echo(vec![c2]);
    let program = b.program(vec![echo1, echo2]);
    // PHP 8: "42" == 42 but "abc" != 0.
    assert_eq!(run_ok(&program), "10");
}
