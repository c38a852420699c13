//! Tests for row/shape inference and projection derivation.

use crate::indexing::{fresh_symbol, AxisIndex, StaticSymbol};
use crate::row::{AxisKind, Constraint, Dim, Row, RowConstraint, RowEnv, RowId, RowTail, ShapeId};
use crate::shape::{ComposeKind, Logic, ShapeEnv, TransposeKind, UpdateStep};

fn row_id() -> RowId {
    RowId {
        shape: ShapeId(0),
        kind: AxisKind::Output,
    }
}

// =============================================================================
// Row solver
// =============================================================================

#[test]
fn total_elems_solves_single_variable() {
    let mut env = RowEnv::new();
    let v = env.fresh_dim_var(None);
    let row = Row::new(vec![Dim::sized(2), v, Dim::sized(5)], RowTail::Closed, row_id());
    let residual = env
        .solve(
            vec![Constraint::RowConstr {
                row: row.clone(),
                constr: RowConstraint::TotalElems(30),
            }],
            false,
        )
        .unwrap();
    assert!(residual.is_empty());
    assert_eq!(env.subst_row(&row).concrete_dims(), Some(vec![2, 3, 5]));
}

#[test]
fn total_elems_conflict_is_shape_error() {
    let mut env = RowEnv::new();
    let v = env.fresh_dim_var(None);
    let row = Row::new(vec![Dim::sized(2), v, Dim::sized(5)], RowTail::Closed, row_id());
    let result = env.solve(
        vec![Constraint::RowConstr {
            row,
            constr: RowConstraint::TotalElems(31),
        }],
        false,
    );
    assert!(result.is_err());
}

#[test]
fn labeled_dims_with_equal_labels_must_agree() {
    let mut env = RowEnv::new();
    let result = env.solve(
        vec![Constraint::DimEq {
            d1: Dim::labeled(2, "hidden"),
            d2: Dim::labeled(3, "hidden"),
        }],
        false,
    );
    assert!(result.is_err());
}

#[test]
fn labeled_dims_with_distinct_labels_must_agree_on_size() {
    let mut env = RowEnv::new();
    let result = env.solve(
        vec![Constraint::DimEq {
            d1: Dim::labeled(4, "rows"),
            d2: Dim::labeled(4, "cols"),
        }],
        false,
    );
    assert!(result.is_err());
}

#[test]
fn broadcast_allows_dimension_one() {
    let mut env = RowEnv::new();
    let ok = env.solve(
        vec![Constraint::DimIneq {
            cur: Dim::sized(4),
            subr: Dim::sized(1),
        }],
        false,
    );
    assert!(ok.is_ok());
    let bad = env.solve(
        vec![Constraint::DimIneq {
            cur: Dim::sized(4),
            subr: Dim::sized(3),
        }],
        false,
    );
    assert!(bad.is_err());
}

#[test]
fn supertype_one_forces_subtype_one() {
    let mut env = RowEnv::new();
    let v = env.fresh_dim_var(None);
    env.solve(
        vec![Constraint::DimIneq {
            cur: Dim::sized(1),
            subr: v.clone(),
        }],
        false,
    )
    .unwrap();
    assert_eq!(env.subst_dim(&v).size(), Some(1));
}

#[test]
fn row_var_occurs_check_is_rejected() {
    let mut env = RowEnv::new();
    let v = env.fresh_row_var();
    let short = Row::new(vec![], RowTail::Open(v), row_id());
    let long = Row::new(vec![Dim::sized(2)], RowTail::Open(v), row_id());
    let result = env.solve(
        vec![Constraint::RowEq {
            r1: long,
            r2: short,
        }],
        false,
    );
    assert!(result.is_err());
}

// =============================================================================
// Scenario: pointwise add with broadcast
// =============================================================================

#[test]
fn pointwise_add_with_broadcast() {
    let mut env = ShapeEnv::new();
    let t1 = env.make_shape("t1", &[], &[], &[3]);
    let t2 = env.make_shape("t2", &[2], &[], &[3]);
    let sum = env.unknown_shape("sum");
    let update = UpdateStep {
        shape: sum,
        logic: Logic::Broadcast(ComposeKind::Pointwise, t1, t2),
    };
    env.propagate_shapes(&update).unwrap();
    env.finish_inference().unwrap();

    let result = env.shape(sum);
    assert_eq!(result.batch.concrete_dims(), Some(vec![2]));
    assert_eq!(result.input.concrete_dims(), Some(vec![]));
    assert_eq!(result.output.concrete_dims(), Some(vec![3]));

    let projections = env.derive_projections(&update).unwrap();
    assert_eq!(projections.product_space, vec![2, 3]);
    let (b, o) = (projections.product_iterators[0], projections.product_iterators[1]);
    assert_eq!(projections.lhs, vec![AxisIndex::Iter(b), AxisIndex::Iter(o)]);
    assert_eq!(projections.rhs[0], vec![AxisIndex::Fixed(0), AxisIndex::Iter(o)]);
    assert_eq!(projections.rhs[1], vec![AxisIndex::Iter(b), AxisIndex::Iter(o)]);

    let lhs_dims = env.shape(sum).physical_dims().unwrap();
    let rhs_dims = vec![
        env.broadcast_dims(t1, sum).unwrap(),
        env.broadcast_dims(t2, sum).unwrap(),
    ];
    assert_eq!(rhs_dims[0], vec![1, 3]);
    projections.validate(&lhs_dims, &rhs_dims).unwrap();
}

/// Re-running propagation on a finished system produces no new constraints.
#[test]
fn finished_system_round_trips() {
    let mut env = ShapeEnv::new();
    let t1 = env.make_shape("t1", &[], &[], &[3]);
    let t2 = env.make_shape("t2", &[2], &[], &[3]);
    let sum = env.unknown_shape("sum");
    let update = UpdateStep {
        shape: sum,
        logic: Logic::Broadcast(ComposeKind::Pointwise, t1, t2),
    };
    env.propagate_shapes(&update).unwrap();
    env.finish_inference().unwrap();
    assert_eq!(env.propagate_shapes(&update).unwrap(), 0);
}

#[test]
fn incompatible_pointwise_dims_error() {
    let mut env = ShapeEnv::new();
    let t1 = env.make_shape("t1", &[], &[], &[2]);
    let t2 = env.make_shape("t2", &[], &[], &[3]);
    let sum = env.unknown_shape("sum");
    let update = UpdateStep {
        shape: sum,
        logic: Logic::Broadcast(ComposeKind::Pointwise, t1, t2),
    };
    let propagated = env.propagate_shapes(&update).and_then(|_| env.finish_inference());
    assert!(propagated.is_err());
}

// =============================================================================
// Scenario: matmul via compose
// =============================================================================

#[test]
fn matmul_compose_projections() {
    let mut env = ShapeEnv::new();
    let w = env.make_shape("w", &[], &[3], &[2]);
    let x = env.make_shape("x", &[], &[4], &[3]);
    let y = env.unknown_shape("y");
    let update = UpdateStep {
        shape: y,
        logic: Logic::Broadcast(ComposeKind::Compose, w, x),
    };
    env.propagate_shapes(&update).unwrap();
    env.finish_inference().unwrap();

    let result = env.shape(y);
    assert_eq!(result.input.concrete_dims(), Some(vec![4]));
    assert_eq!(result.output.concrete_dims(), Some(vec![2]));

    let projections = env.derive_projections(&update).unwrap();
    assert_eq!(projections.product_space, vec![2, 3, 4]);
    let (r, h, c) = (
        projections.product_iterators[0],
        projections.product_iterators[1],
        projections.product_iterators[2],
    );
    assert_eq!(projections.lhs, vec![AxisIndex::Iter(r), AxisIndex::Iter(c)]);
    assert_eq!(projections.rhs[0], vec![AxisIndex::Iter(r), AxisIndex::Iter(h)]);
    assert_eq!(projections.rhs[1], vec![AxisIndex::Iter(h), AxisIndex::Iter(c)]);

    projections
        .validate(&[2, 4], &[vec![2, 3], vec![3, 4]])
        .unwrap();
}

#[test]
fn compose_middle_dim_mismatch_is_error() {
    let mut env = ShapeEnv::new();
    let w = env.make_shape("w", &[], &[3], &[2]);
    let x = env.make_shape("x", &[], &[4], &[5]);
    let y = env.unknown_shape("y");
    let update = UpdateStep {
        shape: y,
        logic: Logic::Broadcast(ComposeKind::Compose, w, x),
    };
    let outcome = env.propagate_shapes(&update).and_then(|_| env.finish_inference());
    assert!(outcome.is_err());
}

// =============================================================================
// Einsum, transpose, permutation, batch slice
// =============================================================================

#[test]
fn einsum_contraction_infers_result() {
    let mut env = ShapeEnv::new();
    let a = env.make_shape("a", &[], &[], &[2, 3]);
    let b = env.make_shape("b", &[], &[], &[3, 4]);
    let c = env.unknown_shape("c");
    let update = UpdateStep {
        shape: c,
        logic: Logic::Broadcast(ComposeKind::Einsum("i j; j k => i k".into()), a, b),
    };
    env.propagate_shapes(&update).unwrap();
    env.finish_inference().unwrap();
    assert_eq!(env.shape(c).output.concrete_dims(), Some(vec![2, 4]));

    let projections = env.derive_projections(&update).unwrap();
    assert_eq!(projections.product_space, vec![2, 4, 3]);
    let (i, k, j) = (
        projections.product_iterators[0],
        projections.product_iterators[1],
        projections.product_iterators[2],
    );
    assert_eq!(projections.lhs, vec![AxisIndex::Iter(i), AxisIndex::Iter(k)]);
    assert_eq!(projections.rhs[0], vec![AxisIndex::Iter(i), AxisIndex::Iter(j)]);
    assert_eq!(projections.rhs[1], vec![AxisIndex::Iter(j), AxisIndex::Iter(k)]);
}

#[test]
fn transpose_swaps_input_and_output() {
    let mut env = ShapeEnv::new();
    let w = env.make_shape("w", &[], &[3], &[2]);
    let t = env.unknown_shape("t");
    let update = UpdateStep {
        shape: t,
        logic: Logic::Transpose(TransposeKind::Transpose, w),
    };
    env.propagate_shapes(&update).unwrap();
    env.finish_inference().unwrap();
    assert_eq!(env.shape(t).input.concrete_dims(), Some(vec![2]));
    assert_eq!(env.shape(t).output.concrete_dims(), Some(vec![3]));
}

#[test]
fn permutation_reorders_axes() {
    let mut env = ShapeEnv::new();
    let a = env.make_shape("a", &[], &[], &[2, 3]);
    let p = env.unknown_shape("p");
    let update = UpdateStep {
        shape: p,
        logic: Logic::Transpose(TransposeKind::Permute("i j => j i".into()), a),
    };
    env.propagate_shapes(&update).unwrap();
    env.finish_inference().unwrap();
    assert_eq!(env.shape(p).output.concrete_dims(), Some(vec![3, 2]));
}

#[test]
fn batch_slice_drops_leading_batch_axis() {
    let mut env = ShapeEnv::new();
    let full = env.make_shape("full", &[5], &[], &[3]);
    let slice = env.unknown_shape("slice");
    let sym = StaticSymbol(fresh_symbol());
    let update = UpdateStep {
        shape: slice,
        logic: Logic::Transpose(TransposeKind::BatchSlice(sym), full),
    };
    env.propagate_shapes(&update).unwrap();
    env.finish_inference().unwrap();
    assert_eq!(env.shape(slice).batch.concrete_dims(), Some(vec![]));
    assert_eq!(env.shape(slice).output.concrete_dims(), Some(vec![3]));

    env.bind_static(sym, 2);
    let projections = env.derive_projections(&update).unwrap();
    assert_eq!(projections.product_space, vec![3]);
    let o = projections.product_iterators[0];
    assert_eq!(projections.lhs, vec![AxisIndex::Iter(o)]);
    // The sliced batch axis is pinned to the staged index.
    assert_eq!(projections.rhs[0], vec![AxisIndex::Fixed(2), AxisIndex::Iter(o)]);
}

/// After finishing, every row of every touched shape is concrete.
#[test]
fn finish_leaves_no_variables() {
    let mut env = ShapeEnv::new();
    let a = env.make_shape("a", &[], &[], &[4]);
    let b = env.unknown_shape("b");
    let c = env.unknown_shape("c");
    let u1 = UpdateStep {
        shape: b,
        logic: Logic::Transpose(TransposeKind::Pointwise, a),
    };
    let u2 = UpdateStep {
        shape: c,
        logic: Logic::Broadcast(ComposeKind::Pointwise, a, b),
    };
    env.propagate_shapes(&u1).unwrap();
    env.propagate_shapes(&u2).unwrap();
    env.finish_inference().unwrap();
    for id in [a, b, c] {
        assert!(env.shape(id).physical_dims().is_ok());
    }
}
