//! Tests for the usage-analysis pass.

use crate::array::ArrayRegistry;
use crate::indexing::{fresh_symbol, AxisIndex};
use crate::llir::{BinOp, Expr, Precision, Stmt};
use crate::memory::{HostedKind, MemoryMode};
use crate::trace::{visit_program, Visits};
use crate::OptimizeSettings;

fn registry() -> ArrayRegistry {
    ArrayRegistry::new()
}

fn get(a: crate::array::ArrayId, idcs: Vec<AxisIndex>) -> Expr {
    Expr::Get(a, idcs)
}

#[test]
fn zero_out_before_any_mention_marks_zero_initialized() {
    let mut arrays = registry();
    let a = arrays.declare("a", Precision::Single, vec![]);
    let body = Stmt::Seq(vec![
        Stmt::ZeroOut(a),
        Stmt::Set {
            array: a,
            idcs: vec![],
            value: Expr::Const(1.0),
        },
    ]);
    let store = visit_program(&OptimizeSettings::default(), &mut arrays, &body).unwrap();
    let traced = store.get(a).unwrap();
    assert!(traced.zero_initialized);
    assert!(traced.zeroed_out);
    assert!(!traced.read_only);
}

#[test]
fn zero_out_after_write_is_not_zero_initialization() {
    let mut arrays = registry();
    let a = arrays.declare("a", Precision::Single, vec![]);
    let body = Stmt::Seq(vec![
        Stmt::Set {
            array: a,
            idcs: vec![],
            value: Expr::Const(1.0),
        },
        Stmt::ZeroOut(a),
    ]);
    let store = visit_program(&OptimizeSettings::default(), &mut arrays, &body).unwrap();
    let traced = store.get(a).unwrap();
    assert!(!traced.zero_initialized);
    assert!(traced.zeroed_out);
}

#[test]
fn traced_loops_enumerate_positions() {
    let mut arrays = registry();
    let a = arrays.declare("a", Precision::Single, vec![4]);
    let i = fresh_symbol();
    let body = Stmt::For {
        index: i,
        from: 0,
        to: 3,
        body: Box::new(Stmt::Set {
            array: a,
            idcs: vec![AxisIndex::Iter(i)],
            value: Expr::Const(2.0),
        }),
        trace_it: true,
    };
    let store = visit_program(&OptimizeSettings::default(), &mut arrays, &body).unwrap();
    let traced = store.get(a).unwrap();
    assert_eq!(traced.assignments.len(), 4);
    assert!(traced.assignments.contains(&vec![3]));
    assert_eq!(store.loop_to_array.get(&i), Some(&a));
}

#[test]
fn untraced_loop_binds_start_only() {
    let mut arrays = registry();
    let a = arrays.declare("a", Precision::Single, vec![4]);
    let i = fresh_symbol();
    let body = Stmt::For {
        index: i,
        from: 0,
        to: 3,
        body: Box::new(Stmt::Set {
            array: a,
            idcs: vec![AxisIndex::Iter(i)],
            value: Expr::Const(2.0),
        }),
        trace_it: false,
    };
    let store = visit_program(&OptimizeSettings::default(), &mut arrays, &body).unwrap();
    assert_eq!(store.get(a).unwrap().assignments.len(), 1);
}

#[test]
fn recurrent_read_forces_hosted_non_virtual() {
    let mut arrays = registry();
    let a = arrays.declare("a", Precision::Single, vec![3]);
    let i = fresh_symbol();
    // a[i] is read, then written from the read: a recurrence.
    let body = Stmt::For {
        index: i,
        from: 0,
        to: 2,
        body: Box::new(Stmt::Set {
            array: a,
            idcs: vec![AxisIndex::Iter(i)],
            value: Expr::binop(BinOp::Add, get(a, vec![AxisIndex::Iter(i)]), Expr::Const(1.0)),
        }),
        trace_it: true,
    };
    let store = visit_program(&OptimizeSettings::default(), &mut arrays, &body).unwrap();
    let traced = store.get(a).unwrap();
    assert!(traced.read_before_write);
    assert!(traced.has_recurrence());
    assert_eq!(
        arrays.get(a).mode(),
        Some(MemoryMode::Hosted(HostedKind::Changed))
    );
}

#[test]
fn user_declared_virtual_recurrence_raises() {
    let mut arrays = registry();
    let a = arrays.declare_with_mode("a", Precision::Single, vec![3], MemoryMode::Virtual);
    let i = fresh_symbol();
    let body = Stmt::For {
        index: i,
        from: 0,
        to: 2,
        body: Box::new(Stmt::Set {
            array: a,
            idcs: vec![AxisIndex::Iter(i)],
            value: Expr::binop(BinOp::Add, get(a, vec![AxisIndex::Iter(i)]), Expr::Const(1.0)),
        }),
        trace_it: true,
    };
    assert!(visit_program(&OptimizeSettings::default(), &mut arrays, &body).is_err());
}

#[test]
fn visits_accumulate_and_exceeding_bound_forces_materialization() {
    let mut arrays = registry();
    let a = arrays.declare("a", Precision::Single, vec![]);
    let b = arrays.declare("b", Precision::Single, vec![]);
    let reads = Expr::binop(
        BinOp::Add,
        Expr::binop(BinOp::Add, get(a, vec![]), get(a, vec![])),
        Expr::binop(BinOp::Add, get(a, vec![]), get(a, vec![])),
    );
    let body = Stmt::Seq(vec![
        Stmt::Set {
            array: a,
            idcs: vec![],
            value: Expr::Const(1.0),
        },
        Stmt::Set {
            array: b,
            idcs: vec![],
            value: reads,
        },
    ]);
    let store = visit_program(&OptimizeSettings::default(), &mut arrays, &body).unwrap();
    assert_eq!(store.get(a).unwrap().accesses[&vec![]], Visits::Visits(4));
    // Four visits exceed the default bound of three.
    assert_eq!(arrays.get(a).mode(), Some(MemoryMode::Materialized));
    assert!(arrays.get(b).mode().is_none());
}

#[test]
fn pure_inputs_are_read_only() {
    let mut arrays = registry();
    let a = arrays.declare("input", Precision::Single, vec![]);
    let b = arrays.declare("out", Precision::Single, vec![]);
    let body = Stmt::Set {
        array: b,
        idcs: vec![],
        value: get(a, vec![]),
    };
    let store = visit_program(&OptimizeSettings::default(), &mut arrays, &body).unwrap();
    let traced = store.get(a).unwrap();
    assert!(traced.read_only);
    // A read with no preceding write also counts as recurrent, keeping the
    // input out of virtualization and on the host.
    assert!(traced.read_before_write);
    assert!(arrays.get(a).mode().unwrap().is_hosted());
}

#[test]
fn two_arrays_sharing_a_loop_iterator_is_rejected() {
    let mut arrays = registry();
    let a = arrays.declare("a", Precision::Single, vec![2]);
    let b = arrays.declare("b", Precision::Single, vec![2]);
    let i = fresh_symbol();
    let body = Stmt::For {
        index: i,
        from: 0,
        to: 1,
        body: Box::new(Stmt::Seq(vec![
            Stmt::Set {
                array: a,
                idcs: vec![AxisIndex::Iter(i)],
                value: Expr::Const(1.0),
            },
            Stmt::Set {
                array: b,
                idcs: vec![AxisIndex::Iter(i)],
                value: Expr::Const(2.0),
            },
        ])),
        trace_it: true,
    };
    assert!(visit_program(&OptimizeSettings::default(), &mut arrays, &body).is_err());
}

#[test]
fn long_traced_loops_enumerate_up_to_the_bound() {
    let mut arrays = registry();
    let a = arrays.declare("a", Precision::Single, vec![100]);
    let i = fresh_symbol();
    let body = Stmt::For {
        index: i,
        from: 0,
        to: 99,
        body: Box::new(Stmt::Set {
            array: a,
            idcs: vec![AxisIndex::Iter(i)],
            value: Expr::Const(0.5),
        }),
        trace_it: true,
    };
    let settings = OptimizeSettings {
        max_tracing_dim: 5,
        ..OptimizeSettings::default()
    };
    let store = visit_program(&settings, &mut arrays, &body).unwrap();
    assert_eq!(store.get(a).unwrap().assignments.len(), 5);
}
