//! Tests for the algebraic simplifier.

use crate::array::ArrayId;
use crate::indexing::AxisIndex;
use crate::llir::{fresh_scope_id, BinOp, Expr, Precision, Stmt, UnOp};
use crate::simplify::simplify;
use crate::OptimizeSettings;

fn settings() -> OptimizeSettings {
    OptimizeSettings::default()
}

fn opaque() -> Expr {
    Expr::Get(ArrayId(0), vec![])
}

/// Wrap an expression into a statement, simplify, and unwrap.
fn simp(e: Expr) -> Expr {
    simp_with(&settings(), e)
}

fn simp_with(settings: &OptimizeSettings, e: Expr) -> Expr {
    let out = simplify(
        settings,
        Stmt::Set {
            array: ArrayId(9),
            idcs: vec![],
            value: e,
        },
    );
    match out {
        Stmt::Set { value, .. } => value,
        other => panic!("unexpected statement {:?}", other),
    }
}

#[test]
fn argument_projections() {
    let x = opaque();
    assert_eq!(simp(Expr::binop(BinOp::Arg1, x.clone(), Expr::Const(7.0))), x);
    assert_eq!(simp(Expr::binop(BinOp::Arg2, Expr::Const(7.0), x.clone())), x);
}

#[test]
fn constant_folding_uses_the_interpreter() {
    assert_eq!(
        simp(Expr::binop(BinOp::Add, Expr::Const(2.0), Expr::Const(0.5))),
        Expr::Const(2.5)
    );
    assert_eq!(
        simp(Expr::binop(BinOp::ToPowOf, Expr::Const(2.0), Expr::Const(10.0))),
        Expr::Const(1024.0)
    );
    assert_eq!(simp(Expr::unop(UnOp::Relu, Expr::Const(-3.0))), Expr::Const(0.0));
}

#[test]
fn additive_and_multiplicative_identities() {
    let x = opaque();
    assert_eq!(simp(Expr::binop(BinOp::Add, x.clone(), Expr::Const(0.0))), x);
    assert_eq!(simp(Expr::binop(BinOp::Add, Expr::Const(0.0), x.clone())), x);
    assert_eq!(simp(Expr::binop(BinOp::Sub, x.clone(), Expr::Const(0.0))), x);
    assert_eq!(simp(Expr::binop(BinOp::Mul, x.clone(), Expr::Const(1.0))), x);
    assert_eq!(simp(Expr::binop(BinOp::Mul, Expr::Const(1.0), x.clone())), x);
    assert_eq!(simp(Expr::binop(BinOp::Div, x.clone(), Expr::Const(1.0))), x);
}

#[test]
fn absorbing_zero() {
    let x = opaque();
    assert_eq!(simp(Expr::binop(BinOp::Mul, x.clone(), Expr::Const(0.0))), Expr::Const(0.0));
    assert_eq!(simp(Expr::binop(BinOp::Mul, Expr::Const(0.0), x.clone())), Expr::Const(0.0));
    assert_eq!(simp(Expr::binop(BinOp::Div, Expr::Const(0.0), x)), Expr::Const(0.0));
}

#[test]
fn constants_pull_together() {
    let x = opaque();
    let nested = Expr::binop(
        BinOp::Add,
        Expr::Const(2.0),
        Expr::binop(BinOp::Add, Expr::Const(3.0), x.clone()),
    );
    assert_eq!(simp(nested), Expr::binop(BinOp::Add, Expr::Const(5.0), x.clone()));

    let muls = Expr::binop(
        BinOp::Mul,
        Expr::binop(BinOp::Mul, x.clone(), Expr::Const(4.0)),
        Expr::Const(0.5),
    );
    assert_eq!(simp(muls), Expr::binop(BinOp::Mul, Expr::Const(2.0), x));
}

#[test]
fn identity_unop_vanishes() {
    let x = opaque();
    assert_eq!(simp(Expr::unop(UnOp::Identity, x.clone())), x);
}

#[test]
fn integer_power_unrolls_to_products() {
    let x = opaque();
    let cube = simp(Expr::binop(BinOp::ToPowOf, x.clone(), Expr::Const(3.0)));
    assert_eq!(
        cube,
        Expr::binop(BinOp::Mul, x.clone(), Expr::binop(BinOp::Mul, x.clone(), x.clone()))
    );

    let recip = simp(Expr::binop(BinOp::ToPowOf, x.clone(), Expr::Const(-2.0)));
    assert_eq!(
        recip,
        Expr::binop(
            BinOp::Div,
            Expr::Const(1.0),
            Expr::binop(BinOp::Mul, x.clone(), x.clone())
        )
    );

    assert_eq!(
        simp(Expr::binop(BinOp::ToPowOf, x.clone(), Expr::Const(0.0))),
        Expr::Const(1.0)
    );
}

#[test]
fn power_unrolling_respects_the_flag() {
    let off = OptimizeSettings {
        unroll_integer_pow: false,
        ..OptimizeSettings::default()
    };
    let x = opaque();
    let pow = Expr::binop(BinOp::ToPowOf, x.clone(), Expr::Const(3.0));
    assert_eq!(simp_with(&off, pow.clone()), pow);
}

#[test]
fn fractional_exponent_stays() {
    let x = opaque();
    let pow = Expr::binop(BinOp::ToPowOf, x.clone(), Expr::Const(0.5));
    assert_eq!(simp(pow.clone()), pow);
}

#[test]
fn embedded_fixed_index_becomes_constant() {
    assert_eq!(simp(Expr::EmbedIndex(AxisIndex::Fixed(4))), Expr::Const(4.0));
}

#[test]
fn single_write_scope_collapses() {
    let scope = fresh_scope_id(ArrayId(1));
    let e = Expr::LocalScope {
        id: scope,
        prec: Precision::Single,
        body: Box::new(Stmt::Seq(vec![
            Stmt::Comment("init".into()),
            Stmt::SetLocal(scope, Expr::Const(3.0)),
        ])),
        orig_indices: vec![],
    };
    assert_eq!(simp(e), Expr::Const(3.0));
}

#[test]
fn double_write_scope_substitutes() {
    let scope = fresh_scope_id(ArrayId(1));
    let e = Expr::LocalScope {
        id: scope,
        prec: Precision::Single,
        body: Box::new(Stmt::Seq(vec![
            Stmt::SetLocal(scope, Expr::Const(0.0)),
            Stmt::SetLocal(
                scope,
                Expr::binop(BinOp::Add, Expr::GetLocal(scope), Expr::Const(2.0)),
            ),
        ])),
        orig_indices: vec![],
    };
    assert_eq!(simp(e), Expr::Const(2.0));
}

/// Structural idempotence on a composite tree.
#[test]
fn simplify_is_idempotent() {
    let x = opaque();
    let scope = fresh_scope_id(ArrayId(1));
    let tree = Stmt::Seq(vec![
        Stmt::Set {
            array: ArrayId(2),
            idcs: vec![],
            value: Expr::binop(
                BinOp::Add,
                Expr::binop(BinOp::ToPowOf, x.clone(), Expr::Const(3.0)),
                Expr::binop(BinOp::Mul, Expr::Const(0.0), x.clone()),
            ),
        },
        Stmt::Set {
            array: ArrayId(3),
            idcs: vec![],
            value: Expr::LocalScope {
                id: scope,
                prec: Precision::Single,
                body: Box::new(Stmt::SetLocal(scope, x.clone())),
                orig_indices: vec![],
            },
        },
    ]);
    let once = simplify(&settings(), tree);
    let twice = simplify(&settings(), once.clone());
    assert_eq!(once, twice);
}
