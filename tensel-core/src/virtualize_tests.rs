//! Tests for virtual-array inlining and cleanup.

use crate::array::{ArrayId, ArrayRegistry};
use crate::indexing::{fresh_symbol, AxisIndex};
use crate::llir::{BinOp, Expr, Precision, Stmt};
use crate::memory::{HostedKind, MemoryMode};
use crate::virtualize::{
    cleanup_virtual, PROV_ESCAPING, PROV_INLINE_MISMATCH, PROV_UNTRACED,
};
use crate::{optimize, OptimizeSettings, Proc};

fn writes_to(stmt: &Stmt, a: ArrayId) -> usize {
    match stmt {
        Stmt::Seq(items) => items.iter().map(|i| writes_to(i, a)).sum(),
        Stmt::For { body, .. } => writes_to(body, a),
        Stmt::ZeroOut(x) if *x == a => 1,
        Stmt::Set { array, value, .. } => {
            (*array == a) as usize + expr_writes_to(value, a)
        }
        Stmt::SetLocal(_, value) => expr_writes_to(value, a),
        _ => 0,
    }
}

fn expr_writes_to(e: &Expr, a: ArrayId) -> usize {
    match e {
        Expr::Binop(_, l, r) => expr_writes_to(l, a) + expr_writes_to(r, a),
        Expr::Unop(_, x) => expr_writes_to(x, a),
        Expr::LocalScope { body, .. } => writes_to(body, a),
        _ => 0,
    }
}

fn find_set_value<'a>(stmt: &'a Stmt, a: ArrayId) -> Option<&'a Expr> {
    match stmt {
        Stmt::Seq(items) => items.iter().find_map(|i| find_set_value(i, a)),
        Stmt::For { body, .. } => find_set_value(body, a),
        Stmt::Set { array, value, .. } if *array == a => Some(value),
        _ => None,
    }
}

/// `t1 = 0; t1 = 3.0; t2 = t1 + 1` with `t1` eligible: after optimization
/// no write to `t1` remains and `t2` is the folded constant.
#[test]
fn scalar_chain_inlines_and_folds() {
    let mut arrays = ArrayRegistry::new();
    let t1 = arrays.declare("t1", Precision::Single, vec![]);
    let t2 = arrays.declare_with_mode(
        "t2",
        Precision::Single,
        vec![],
        MemoryMode::Hosted(HostedKind::Changed),
    );
    let body = Stmt::Seq(vec![
        Stmt::ZeroOut(t1),
        Stmt::Set {
            array: t1,
            idcs: vec![],
            value: Expr::Const(3.0),
        },
        Stmt::Set {
            array: t2,
            idcs: vec![],
            value: Expr::binop(BinOp::Add, Expr::Get(t1, vec![]), Expr::Const(1.0)),
        },
    ]);
    let proc = Proc::new("scalar_chain", arrays, body);
    let optimized = optimize(OptimizeSettings::default(), proc).unwrap();

    assert_eq!(optimized.proc.arrays.get(t1).mode(), Some(MemoryMode::Virtual));
    assert_eq!(writes_to(&optimized.proc.body, t1), 0);
    assert_eq!(find_set_value(&optimized.proc.body, t2), Some(&Expr::Const(4.0)));
}

/// Before simplification, the consumer holds a local scope that zeroes the
/// local and then sets it, in program order.
#[test]
fn inlined_scope_replays_in_program_order() {
    let mut arrays = ArrayRegistry::new();
    let t1 = arrays.declare("t1", Precision::Single, vec![]);
    let t2 = arrays.declare_with_mode(
        "t2",
        Precision::Single,
        vec![],
        MemoryMode::Hosted(HostedKind::Changed),
    );
    let body = Stmt::Seq(vec![
        Stmt::ZeroOut(t1),
        Stmt::Set {
            array: t1,
            idcs: vec![],
            value: Expr::Const(3.0),
        },
        Stmt::Set {
            array: t2,
            idcs: vec![],
            value: Expr::Get(t1, vec![]),
        },
    ]);
    let proc = Proc::new("replay_order", arrays, body);
    let virtualized = proc.trace(OptimizeSettings::default()).unwrap().virtualize().unwrap();

    let value = find_set_value(&virtualized.proc.body, t2).expect("t2 write");
    let Expr::LocalScope { id, body, .. } = value else {
        panic!("expected a local scope, got {:?}", value);
    };
    assert_eq!(id.array, t1);
    let Stmt::Seq(stmts) = body.as_ref() else {
        panic!("expected a statement sequence");
    };
    assert_eq!(
        stmts.as_slice(),
        &[
            Stmt::SetLocal(*id, Expr::Const(0.0)),
            Stmt::SetLocal(*id, Expr::Const(3.0)),
        ]
    );
}

#[test]
fn loop_computation_inlines_per_element() {
    let mut arrays = ArrayRegistry::new();
    let t1 = arrays.declare("t1", Precision::Single, vec![3]);
    let t2 = arrays.declare_with_mode(
        "t2",
        Precision::Single,
        vec![3],
        MemoryMode::Hosted(HostedKind::Changed),
    );
    let (i, j) = (fresh_symbol(), fresh_symbol());
    let body = Stmt::Seq(vec![
        Stmt::For {
            index: i,
            from: 0,
            to: 2,
            body: Box::new(Stmt::Set {
                array: t1,
                idcs: vec![AxisIndex::Iter(i)],
                value: Expr::Const(2.0),
            }),
            trace_it: true,
        },
        Stmt::For {
            index: j,
            from: 0,
            to: 2,
            body: Box::new(Stmt::Set {
                array: t2,
                idcs: vec![AxisIndex::Iter(j)],
                value: Expr::binop(
                    BinOp::Mul,
                    Expr::Get(t1, vec![AxisIndex::Iter(j)]),
                    Expr::Const(10.0),
                ),
            }),
            trace_it: true,
        },
    ]);
    let proc = Proc::new("loop_inline", arrays, body);
    let optimized = optimize(OptimizeSettings::default(), proc).unwrap();

    assert_eq!(optimized.proc.arrays.get(t1).mode(), Some(MemoryMode::Virtual));
    assert_eq!(writes_to(&optimized.proc.body, t1), 0);
    // t2 survives with its loop; its value folded to the product.
    assert_eq!(find_set_value(&optimized.proc.body, t2), Some(&Expr::Const(20.0)));
}

#[test]
fn untraced_loop_disqualifies_the_array() {
    let mut arrays = ArrayRegistry::new();
    let t1 = arrays.declare("t1", Precision::Single, vec![3]);
    let t2 = arrays.declare("t2", Precision::Single, vec![3]);
    let (i, j) = (fresh_symbol(), fresh_symbol());
    let body = Stmt::Seq(vec![
        Stmt::For {
            index: i,
            from: 0,
            to: 2,
            body: Box::new(Stmt::Set {
                array: t1,
                idcs: vec![AxisIndex::Iter(i)],
                value: Expr::Const(2.0),
            }),
            trace_it: false,
        },
        // Only position 0 is read: the untraced loop binds its start, so
        // further positions would look unwritten to the tracer.
        Stmt::For {
            index: j,
            from: 0,
            to: 0,
            body: Box::new(Stmt::Set {
                array: t2,
                idcs: vec![AxisIndex::Iter(j)],
                value: Expr::Get(t1, vec![AxisIndex::Iter(j)]),
            }),
            trace_it: true,
        },
    ]);
    let proc = Proc::new("untraced", arrays, body);
    let optimized = optimize(OptimizeSettings::default(), proc).unwrap();
    let decl = optimized.proc.arrays.get(t1);
    assert_eq!(decl.mode(), Some(MemoryMode::Materialized));
    assert_eq!(decl.mode_provenance(), Some(PROV_UNTRACED));
}

#[test]
fn escaping_iterator_disqualifies_the_array() {
    let mut arrays = ArrayRegistry::new();
    let x = arrays.declare("x", Precision::Single, vec![2]);
    let a = arrays.declare("a", Precision::Single, vec![]);
    let b = arrays.declare("b", Precision::Single, vec![]);
    let j = fresh_symbol();
    let body = Stmt::Seq(vec![
        Stmt::For {
            index: j,
            from: 0,
            to: 1,
            body: Box::new(Stmt::Seq(vec![
                Stmt::Set {
                    array: x,
                    idcs: vec![AxisIndex::Iter(j)],
                    value: Expr::Const(1.0),
                },
                // A scalar write whose value depends on the enclosing loop.
                Stmt::Set {
                    array: a,
                    idcs: vec![],
                    value: Expr::Get(x, vec![AxisIndex::Iter(j)]),
                },
            ])),
            trace_it: true,
        },
        Stmt::Set {
            array: b,
            idcs: vec![],
            value: Expr::Get(a, vec![]),
        },
    ]);
    let proc = Proc::new("escaping", arrays, body);
    let optimized = optimize(OptimizeSettings::default(), proc).unwrap();
    let decl = optimized.proc.arrays.get(a);
    assert_eq!(decl.mode(), Some(MemoryMode::Materialized));
    assert_eq!(decl.mode_provenance(), Some(PROV_ESCAPING));
}

#[test]
fn call_site_index_mismatch_disqualifies_the_array() {
    let mut arrays = ArrayRegistry::new();
    let a = arrays.declare("a", Precision::Single, vec![1]);
    let c = arrays.declare("c", Precision::Single, vec![1]);
    let j = fresh_symbol();
    let body = Stmt::Seq(vec![
        Stmt::Set {
            array: a,
            idcs: vec![AxisIndex::Fixed(0)],
            value: Expr::Const(5.0),
        },
        Stmt::For {
            index: j,
            from: 0,
            to: 0,
            body: Box::new(Stmt::Set {
                array: c,
                idcs: vec![AxisIndex::Iter(j)],
                value: Expr::Get(a, vec![AxisIndex::Iter(j)]),
            }),
            trace_it: true,
        },
    ]);
    let proc = Proc::new("mismatch", arrays, body);
    let optimized = optimize(OptimizeSettings::default(), proc).unwrap();
    let decl = optimized.proc.arrays.get(a);
    assert_eq!(decl.mode(), Some(MemoryMode::Materialized));
    assert_eq!(decl.mode_provenance(), Some(PROV_INLINE_MISMATCH));
    // The consumer still reads the materialized array.
    assert_eq!(writes_to(&optimized.proc.body, a), 1);
}

#[test]
fn user_forced_virtual_failing_acceptance_raises() {
    let mut arrays = ArrayRegistry::new();
    let t1 = arrays.declare_with_mode("t1", Precision::Single, vec![3], MemoryMode::Virtual);
    let t2 = arrays.declare("t2", Precision::Single, vec![3]);
    let i = fresh_symbol();
    // An untraced definition loop cannot be accepted.
    let body = Stmt::Seq(vec![
        Stmt::For {
            index: i,
            from: 0,
            to: 2,
            body: Box::new(Stmt::Set {
                array: t1,
                idcs: vec![AxisIndex::Iter(i)],
                value: Expr::Const(2.0),
            }),
            trace_it: false,
        },
        Stmt::Set {
            array: t2,
            idcs: vec![AxisIndex::Fixed(0)],
            value: Expr::Get(t1, vec![AxisIndex::Fixed(0)]),
        },
    ]);
    let proc = Proc::new("forced", arrays, body);
    assert!(optimize(OptimizeSettings::default(), proc).is_err());
}

#[test]
fn cleanup_rejects_surviving_virtual_reads() {
    let mut arrays = ArrayRegistry::new();
    let a = arrays.declare_with_mode("a", Precision::Single, vec![], MemoryMode::Virtual);
    let b = arrays.declare("b", Precision::Single, vec![]);
    let body = Stmt::Set {
        array: b,
        idcs: vec![],
        value: Expr::Get(a, vec![]),
    };
    assert!(cleanup_virtual(&arrays, body).is_err());
}

#[test]
fn cleanup_reverts_scopes_of_materialized_arrays() {
    use crate::llir::fresh_scope_id;
    let mut arrays = ArrayRegistry::new();
    let a = arrays.declare_with_mode("a", Precision::Single, vec![], MemoryMode::Materialized);
    let b = arrays.declare("b", Precision::Single, vec![]);
    let scope = fresh_scope_id(a);
    let body = Stmt::Set {
        array: b,
        idcs: vec![],
        value: Expr::LocalScope {
            id: scope,
            prec: Precision::Single,
            body: Box::new(Stmt::SetLocal(scope, Expr::Const(1.0))),
            orig_indices: vec![],
        },
    };
    let (cleaned, _) = cleanup_virtual(&arrays, body).unwrap();
    assert_eq!(find_set_value(&cleaned, b), Some(&Expr::Get(a, vec![])));
}
