//! Algebraic simplification of the loop IR.
//!
//! Rewrites run bottom-up and the whole tree is re-simplified until it
//! stops changing (structural equality). All rules commute with semantics
//! under IEEE approximation; constant folding goes through the op
//! interpreters in `llir`.

use crate::indexing::AxisIndex;
use crate::llir::{BinOp, Expr, Precision, ScopeId, Stmt, UnOp};
use crate::OptimizeSettings;

/// Exponents beyond this stay as `ToPowOf` calls.
const MAX_POW_UNROLL: f64 = 32.0;

/// Simplify to a fixed point.
pub fn simplify(settings: &OptimizeSettings, body: Stmt) -> Stmt {
    let mut cur = body;
    loop {
        let next = simplify_stmt(settings, cur.clone());
        if next == cur {
            return next;
        }
        cur = next;
    }
}

fn simplify_stmt(settings: &OptimizeSettings, s: Stmt) -> Stmt {
    match s {
        Stmt::Noop | Stmt::Comment(_) | Stmt::ZeroOut(_) | Stmt::StagedCallback { .. } => s,
        Stmt::Seq(items) => Stmt::seq(items.into_iter().map(|i| simplify_stmt(settings, i)).collect()),
        Stmt::For {
            index,
            from,
            to,
            body,
            trace_it,
        } => {
            let body = simplify_stmt(settings, *body);
            if matches!(body, Stmt::Noop) {
                return Stmt::Noop;
            }
            Stmt::For {
                index,
                from,
                to,
                body: Box::new(body),
                trace_it,
            }
        }
        Stmt::Set { array, idcs, value } => Stmt::Set {
            array,
            idcs,
            value: simplify_expr(settings, value),
        },
        Stmt::SetLocal(id, value) => Stmt::SetLocal(id, simplify_expr(settings, value)),
    }
}

fn simplify_expr(settings: &OptimizeSettings, e: Expr) -> Expr {
    // Children first, then the node's own rules.
    let e = match e {
        Expr::Binop(op, l, r) => Expr::Binop(
            op,
            Box::new(simplify_expr(settings, *l)),
            Box::new(simplify_expr(settings, *r)),
        ),
        Expr::Unop(op, x) => Expr::Unop(op, Box::new(simplify_expr(settings, *x))),
        Expr::LocalScope {
            id,
            prec,
            body,
            orig_indices,
        } => Expr::LocalScope {
            id,
            prec,
            body: Box::new(simplify_stmt(settings, *body)),
            orig_indices,
        },
        other => other,
    };
    rewrite(settings, e)
}

fn rewrite(settings: &OptimizeSettings, e: Expr) -> Expr {
    use BinOp::*;
    use Expr::{Binop, Const, Unop};
    match e {
        // Argument projections.
        Binop(Arg1, a, _) => *a,
        Binop(Arg2, _, b) => *b,

        // Constant folding through the interpreter.
        Binop(op, l, r) => match (*l, *r) {
            (Const(a), Const(b)) => Const(op.eval(a, b)),

            // Identities.
            (x, Const(c)) if c == 0.0 && matches!(op, Add | Sub) => x,
            (Const(c), x) if c == 0.0 && op == Add => x,
            (x, Const(c)) if c == 1.0 && matches!(op, Mul | Div) => x,
            (Const(c), x) if c == 1.0 && op == Mul => x,

            // Absorbers. Scope bodies are pure, so dropping the other side
            // is sound.
            (_, Const(c)) if c == 0.0 && op == Mul => Const(0.0),
            (Const(c), _) if c == 0.0 && matches!(op, Mul | Div) => Const(0.0),

            // Pull constants together.
            (Const(a), Binop(Add, m, x)) if op == Add => match (*m, *x) {
                (Const(b), x) | (x, Const(b)) => Expr::binop(Add, Const(a + b), x),
                (m, x) => Expr::binop(Add, Const(a), Expr::binop(Add, m, x)),
            },
            (Binop(Add, m, x), Const(a)) if op == Add => match (*m, *x) {
                (Const(b), x) | (x, Const(b)) => Expr::binop(Add, Const(a + b), x),
                (m, x) => Expr::binop(Add, Expr::binop(Add, m, x), Const(a)),
            },
            (Const(a), Binop(Mul, m, x)) if op == Mul => match (*m, *x) {
                (Const(b), x) | (x, Const(b)) => Expr::binop(Mul, Const(a * b), x),
                (m, x) => Expr::binop(Mul, Const(a), Expr::binop(Mul, m, x)),
            },
            (Binop(Mul, m, x), Const(a)) if op == Mul => match (*m, *x) {
                (Const(b), x) | (x, Const(b)) => Expr::binop(Mul, Const(a * b), x),
                (m, x) => Expr::binop(Mul, Expr::binop(Mul, m, x), Const(a)),
            },
            (Binop(Sub, x, c1), Const(b)) if op == Sub => match (*x, *c1) {
                (x, Const(a)) => Expr::binop(Sub, x, Const(a + b)),
                (x, c1) => Expr::binop(Sub, Expr::binop(Sub, x, c1), Const(b)),
            },
            (Binop(Div, x, c1), Const(b)) if op == Div => match (*x, *c1) {
                (x, Const(a)) => Expr::binop(Div, x, Const(a * b)),
                (x, c1) => Expr::binop(Div, Expr::binop(Div, x, c1), Const(b)),
            },

            // Integer-power unrolling.
            (x, Const(c))
                if op == ToPowOf
                    && settings.unroll_integer_pow
                    && c.fract() == 0.0
                    && c.abs() <= MAX_POW_UNROLL =>
            {
                unroll_pow(x, c as i64)
            }

            (l, r) => Expr::binop(op, l, r),
        },

        Unop(UnOp::Identity, x) => *x,
        Unop(op, x) => match *x {
            Const(c) => Const(op.eval(c)),
            x => Expr::unop(op, x),
        },

        Expr::EmbedIndex(AxisIndex::Fixed(i)) => Const(i as f64),

        Expr::LocalScope {
            id,
            prec,
            body,
            orig_indices,
        } => collapse_scope(id, prec, *body, orig_indices),

        other => other,
    }
}

/// `x ** n` as a nested product (or its reciprocal for negative `n`).
fn unroll_pow(x: Expr, n: i64) -> Expr {
    let positive = |n: i64| -> Expr {
        let mut acc = x.clone();
        for _ in 1..n {
            acc = Expr::binop(BinOp::Mul, x.clone(), acc);
        }
        acc
    };
    match n {
        0 => Expr::Const(1.0),
        n if n > 0 => positive(n),
        n => Expr::binop(BinOp::Div, Expr::Const(1.0), positive(-n)),
    }
}

/// A scope whose body is one or two writes to its own local collapses to
/// the written value.
fn collapse_scope(id: ScopeId, prec: Precision, body: Stmt, orig_indices: Vec<AxisIndex>) -> Expr {
    let stmts: Vec<Stmt> = match body {
        Stmt::Seq(items) => items,
        s => vec![s],
    };
    let essential: Vec<&Stmt> = stmts
        .iter()
        .filter(|s| !matches!(s, Stmt::Comment(_) | Stmt::Noop))
        .collect();
    match essential.as_slice() {
        [Stmt::SetLocal(sid, v)] if *sid == id => v.clone(),
        [Stmt::SetLocal(s1, v1), Stmt::SetLocal(s2, v2)] if *s1 == id && *s2 == id => {
            subst_local(v2.clone(), id, v1)
        }
        _ => Expr::LocalScope {
            id,
            prec,
            body: Box::new(Stmt::seq(stmts)),
            orig_indices,
        },
    }
}

/// Replace `GetLocal(id)` with a value.
fn subst_local(e: Expr, id: ScopeId, value: &Expr) -> Expr {
    match e {
        Expr::GetLocal(sid) if sid == id => value.clone(),
        Expr::Binop(op, l, r) => Expr::Binop(
            op,
            Box::new(subst_local(*l, id, value)),
            Box::new(subst_local(*r, id, value)),
        ),
        Expr::Unop(op, x) => Expr::Unop(op, Box::new(subst_local(*x, id, value))),
        other => other,
    }
}
