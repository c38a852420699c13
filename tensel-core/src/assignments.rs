//! The assignment tree handed to the middle-end by the surface/autodiff
//! layer, and its lowering to the loop IR.
//!
//! An accumulation `lhs =(accum) op(rhs1, rhs2)` lowers to nested `For`
//! loops over the product iterators of its projections, with a single `Set`
//! innermost combining the previous value of the lhs (when the accumulation
//! is not a plain overwrite) with the computed scalar. Degenerate axes are
//! already `Fixed(0)` in the projections, so they never become loops.

use crate::array::{ArrayId, ArrayRegistry};
use crate::error::Result;
use crate::indexing::{fresh_labeled_symbol, AxisIndex, Projections, Symbol};
use crate::llir::{BinOp, Expr, Stmt, UnOp};
use crate::shape::InitOp;
use crate::{bail_unsupported, err_unsupported};

// =============================================================================
// The assignment tree
// =============================================================================

#[derive(Debug, Clone)]
pub enum Asgns {
    Seq(Vec<Asgns>),
    Comment(String),
    /// `lhs =(accum) op(rhs1, rhs2)` over the given iteration space.
    AccumBinop {
        /// Reset the lhs to the accumulation's neutral element first.
        initialize_neutral: bool,
        accum: BinOp,
        op: BinOp,
        lhs: ArrayId,
        rhs1: ArrayId,
        rhs2: ArrayId,
        projections: Projections,
    },
    /// `lhs =(accum) op(rhs)` over the given iteration space.
    AccumUnop {
        initialize_neutral: bool,
        accum: BinOp,
        op: UnOp,
        lhs: ArrayId,
        rhs: ArrayId,
        projections: Projections,
    },
    /// Populate a terminal array from its initializer.
    Fetch { array: ArrayId, fetch: InitOp },
}

// =============================================================================
// Lowering
// =============================================================================

/// Lower an assignment tree to the loop IR.
pub fn lower(arrays: &ArrayRegistry, asgns: &Asgns) -> Result<Stmt> {
    let lowerer = Lowerer { arrays };
    lowerer.lower(asgns)
}

struct Lowerer<'a> {
    arrays: &'a ArrayRegistry,
}

impl Lowerer<'_> {
    fn lower(&self, asgns: &Asgns) -> Result<Stmt> {
        match asgns {
            Asgns::Seq(items) => {
                let lowered: Result<Vec<Stmt>> = items.iter().map(|a| self.lower(a)).collect();
                Ok(Stmt::seq(lowered?))
            }
            Asgns::Comment(text) => Ok(Stmt::Comment(text.clone())),
            Asgns::AccumBinop {
                initialize_neutral,
                accum,
                op,
                lhs,
                rhs1,
                rhs2,
                projections,
            } => {
                let rhs = Expr::binop(
                    *op,
                    Expr::Get(*rhs1, projections.rhs[0].clone()),
                    Expr::Get(*rhs2, projections.rhs[1].clone()),
                );
                self.lower_accum(*initialize_neutral, *accum, *lhs, rhs, projections)
            }
            Asgns::AccumUnop {
                initialize_neutral,
                accum,
                op,
                lhs,
                rhs,
                projections,
            } => {
                let rhs = Expr::unop(*op, Expr::Get(*rhs, projections.rhs[0].clone()));
                self.lower_accum(*initialize_neutral, *accum, *lhs, rhs, projections)
            }
            Asgns::Fetch { array, fetch } => self.lower_fetch(*array, fetch),
        }
    }

    fn lower_accum(
        &self,
        initialize_neutral: bool,
        accum: BinOp,
        lhs: ArrayId,
        rhs: Expr,
        projections: &Projections,
    ) -> Result<Stmt> {
        let mut stmts = vec![Stmt::Comment(projections.debug_label.clone())];
        if initialize_neutral {
            stmts.push(self.lower_initialize(accum, lhs, projections)?);
        }
        let value = match accum {
            // A plain overwrite of the previous value.
            BinOp::Arg2 => rhs,
            accum => Expr::binop(accum, Expr::Get(lhs, projections.lhs.clone()), rhs),
        };
        let innermost = Stmt::Set {
            array: lhs,
            idcs: projections.lhs.clone(),
            value,
        };
        stmts.push(loop_nest(
            &projections.product_iterators,
            &projections.product_space,
            innermost,
        ));
        Ok(Stmt::seq(stmts))
    }

    fn lower_initialize(&self, accum: BinOp, lhs: ArrayId, projections: &Projections) -> Result<Stmt> {
        let neutral = accum.neutral().ok_or_else(|| {
            err_unsupported!(
                "accumulation {} has no neutral element to initialize {} with",
                accum,
                self.arrays.get(lhs).label
            )
        })?;
        if neutral == 0.0 {
            return Ok(Stmt::ZeroOut(lhs));
        }
        // Non-zero neutral: loop over the lhs positions explicitly.
        let innermost = Stmt::Set {
            array: lhs,
            idcs: projections.lhs.clone(),
            value: Expr::Const(neutral),
        };
        let lhs_iters: Vec<usize> = projections
            .product_iterators
            .iter()
            .enumerate()
            .filter(|(_, s)| projections.lhs.contains(&AxisIndex::Iter(**s)))
            .map(|(i, _)| i)
            .collect();
        let iters: Vec<Symbol> = lhs_iters.iter().map(|&i| projections.product_iterators[i]).collect();
        let space: Vec<usize> = lhs_iters.iter().map(|&i| projections.product_space[i]).collect();
        Ok(loop_nest(&iters, &space, innermost))
    }

    fn lower_fetch(&self, array: ArrayId, fetch: &InitOp) -> Result<Stmt> {
        let decl = self.arrays.get(array);
        let dims = &decl.dims;
        // Fresh iterators over the array's own dims; size-1 axes stay fixed.
        let mut iters = vec![];
        let mut space = vec![];
        let idcs: Vec<AxisIndex> = dims
            .iter()
            .enumerate()
            .map(|(axis, &d)| {
                if d == 1 {
                    AxisIndex::Fixed(0)
                } else {
                    let sym = fresh_labeled_symbol(&format!("{}_ax{}", decl.label, axis));
                    iters.push(sym);
                    space.push(d);
                    AxisIndex::Iter(sym)
                }
            })
            .collect();
        let value = match fetch {
            InitOp::ConstantFill { values, strict } => {
                if *strict && values.len() != decl.num_elems() {
                    bail_unsupported!(
                        "strict fill of {} needs {} values, got {}",
                        decl.label,
                        decl.num_elems(),
                        values.len()
                    );
                }
                match values.as_slice() {
                    [v] => Expr::Const(*v),
                    // Multiple literals live in a host-side table the
                    // backend binds by name.
                    _ => Expr::GetGlobal {
                        ident: format!("fill_{}", decl.label),
                        idcs: Some(idcs.clone()),
                    },
                }
            }
            InitOp::RangeOverOffsets => offset_of(&idcs, dims),
            InitOp::FileMapped { path, .. } => Expr::GetGlobal {
                ident: format!("mmap_{}", path.display()),
                idcs: Some(idcs.clone()),
            },
            InitOp::StandardUniform => Expr::GetGlobal {
                ident: "uniform".to_string(),
                idcs: None,
            },
        };
        let innermost = Stmt::Set {
            array,
            idcs,
            value,
        };
        Ok(Stmt::seq(vec![
            Stmt::Comment(format!("init {}", decl.label)),
            loop_nest(&iters, &space, innermost),
        ]))
    }
}

/// Wrap a statement in `For` loops, outermost iterator first. Lowered loops
/// are always traced.
pub fn loop_nest(iterators: &[Symbol], space: &[usize], innermost: Stmt) -> Stmt {
    debug_assert_eq!(iterators.len(), space.len());
    let mut body = innermost;
    for (sym, dim) in iterators.iter().zip(space.iter()).rev() {
        body = Stmt::For {
            index: *sym,
            from: 0,
            to: *dim as i64 - 1,
            body: Box::new(body),
            trace_it: true,
        };
    }
    body
}

/// The linear offset of a cell, as an index expression over the iterators.
fn offset_of(idcs: &[AxisIndex], dims: &[usize]) -> Expr {
    let mut offset = Expr::Const(0.0);
    for (idx, &dim) in idcs.iter().zip(dims.iter()) {
        offset = Expr::binop(
            BinOp::Add,
            Expr::binop(BinOp::Mul, offset, Expr::Const(dim as f64)),
            Expr::EmbedIndex(*idx),
        );
    }
    offset
}
