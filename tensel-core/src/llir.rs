//! The low-level loop IR.
//!
//! Assignment-style statements over arrays and scalar value expressions.
//! The tree is what every optimization pass consumes and produces; comments
//! survive all passes so the emitted text stays navigable.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

use crate::array::ArrayId;
use crate::indexing::{AxisIndex, Symbol};

// =============================================================================
// Precision
// =============================================================================

/// Element precision of an array. Lowering picks the emitted element type
/// accordingly; local scopes inherit the precision of their source array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Precision {
    Byte,
    Half,
    Single,
    Double,
}

impl Precision {
    pub fn size_in_bytes(self) -> usize {
        match self {
            Precision::Byte => 1,
            Precision::Half => 2,
            Precision::Single => 4,
            Precision::Double => 8,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Precision::Byte => "byte",
            Precision::Half => "half",
            Precision::Single => "single",
            Precision::Double => "double",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// Scope ids
// =============================================================================

/// Identifies a local scalar scope introduced by inlining. Globally unique
/// within the process; lives only within one compilation of an IR fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId {
    /// The array whose computation this scope replays.
    pub array: ArrayId,
    pub id: u32,
}

static NEXT_SCOPE: AtomicU32 = AtomicU32::new(0);

pub fn fresh_scope_id(array: ArrayId) -> ScopeId {
    ScopeId {
        array,
        id: NEXT_SCOPE.fetch_add(1, Ordering::Relaxed),
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.id)
    }
}

// =============================================================================
// Operators
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    /// Projection onto the first argument.
    Arg1,
    /// Projection onto the second argument.
    Arg2,
    Add,
    Sub,
    Mul,
    Div,
    ToPowOf,
    /// `if a > 0 then b else 0`, the gradient gate of relu.
    ReluGate,
}

impl BinOp {
    /// The interpreter used by constant folding.
    pub fn eval(self, a: f64, b: f64) -> f64 {
        match self {
            BinOp::Arg1 => a,
            BinOp::Arg2 => b,
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
            BinOp::ToPowOf => a.powf(b),
            BinOp::ReluGate => {
                if a > 0.0 {
                    b
                } else {
                    0.0
                }
            }
        }
    }

    /// The neutral element for accumulation, if the op has one.
    pub fn neutral(self) -> Option<f64> {
        match self {
            BinOp::Add | BinOp::Sub => Some(0.0),
            BinOp::Mul | BinOp::Div => Some(1.0),
            _ => None,
        }
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Arg1 => "-|",
            BinOp::Arg2 => "|-",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::ToPowOf => "**",
            BinOp::ReluGate => "-?^",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Identity,
    Relu,
    Neg,
}

impl UnOp {
    pub fn eval(self, x: f64) -> f64 {
        match self {
            UnOp::Identity => x,
            UnOp::Relu => x.max(0.0),
            UnOp::Neg => -x,
        }
    }
}

impl fmt::Display for UnOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnOp::Identity => "id",
            UnOp::Relu => "relu",
            UnOp::Neg => "neg",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Statements and expressions
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Noop,
    Seq(Vec<Stmt>),
    For {
        index: Symbol,
        from: i64,
        to: i64,
        body: Box<Stmt>,
        /// Whether the usage tracer enumerates this loop's positions.
        trace_it: bool,
    },
    ZeroOut(ArrayId),
    Set {
        array: ArrayId,
        idcs: Vec<AxisIndex>,
        value: Expr,
    },
    SetLocal(ScopeId, Expr),
    Comment(String),
    /// An opaque host callback staged into the program by the caller.
    /// Inlining candidates must not contain one.
    StagedCallback { name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(f64),
    Get(ArrayId, Vec<AxisIndex>),
    GetLocal(ScopeId),
    /// A backend-provided global, e.g. the PRNG state.
    GetGlobal {
        ident: String,
        idcs: Option<Vec<AxisIndex>>,
    },
    /// An axis index embedded as a value.
    EmbedIndex(AxisIndex),
    Binop(BinOp, Box<Expr>, Box<Expr>),
    Unop(UnOp, Box<Expr>),
    /// A single-use scalar block replaying a virtual array's computation.
    /// `orig_indices` are the indices of the read this scope replaced.
    LocalScope {
        id: ScopeId,
        prec: Precision,
        body: Box<Stmt>,
        orig_indices: Vec<AxisIndex>,
    },
}

impl Stmt {
    /// Sequence statements, flattening nested sequences and dropping noops.
    pub fn seq(stmts: Vec<Stmt>) -> Stmt {
        let mut flat = Vec::with_capacity(stmts.len());
        for s in stmts {
            match s {
                Stmt::Noop => {}
                Stmt::Seq(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Stmt::Noop,
            1 => flat.into_iter().next().unwrap(),
            _ => Stmt::Seq(flat),
        }
    }
}

impl Expr {
    pub fn binop(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binop(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn unop(op: UnOp, x: Expr) -> Expr {
        Expr::Unop(op, Box::new(x))
    }
}
