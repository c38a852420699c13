//! Rows of dimensions and the row-polymorphic inference environment.
//!
//! A row is an ordered list of dims with a trailing openness marker: an open
//! row can be extended leftward with more axes during broadcasting, a closed
//! row cannot. The subtyping order is broadcast-shaped: on ground dims,
//! `n >= m` iff `n = m` or `m = 1`; on ground rows, `q >= r` iff `q` has at
//! least as many axes and every trailing-aligned dim pair satisfies the dim
//! rule.
//!
//! The environment maps dim and row variables to either a solution or a
//! bounds record (variables above, variables below, and a running least
//! upper bound). Solving a variable re-emits the stored bounds as fresh
//! inequalities, so transitive consequences are never lost.

use std::collections::HashMap;
use std::fmt;

use log::debug;
use serde::Serialize;

use crate::error::Result;
use crate::indexing::ProjId;
use crate::{bail_shape, bail_shape_trace, IdSource};

// =============================================================================
// Identifiers
// =============================================================================

/// Identifies a shape across the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ShapeId(pub u32);

impl From<u32> for ShapeId {
    fn from(id: u32) -> Self {
        ShapeId(id)
    }
}

/// The three rows composing a shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AxisKind {
    Batch,
    Input,
    Output,
}

/// Identity of a row: which shape it belongs to, and which of the three
/// rows it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RowId {
    pub shape: ShapeId,
    pub kind: AxisKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DimVarId(pub u32);

impl From<u32> for DimVarId {
    fn from(id: u32) -> Self {
        DimVarId(id)
    }
}

impl fmt::Display for DimVarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowVarId(pub u32);

impl From<u32> for RowVarId {
    fn from(id: u32) -> Self {
        RowVarId(id)
    }
}

impl fmt::Display for RowVarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

// =============================================================================
// Dims and rows
// =============================================================================

/// One axis: an inference variable or a concrete size. A concrete dim may
/// carry a display label and, during projection derivation, the projection
/// equivalence class it belongs to.
///
/// Invariant: two concrete dims with identical labels must have identical
/// sizes.
#[derive(Debug, Clone, PartialEq)]
pub enum Dim {
    Var {
        id: DimVarId,
        label: Option<String>,
    },
    Sized {
        size: usize,
        label: Option<String>,
        proj: Option<ProjId>,
    },
}

impl Dim {
    pub fn sized(size: usize) -> Dim {
        Dim::Sized {
            size,
            label: None,
            proj: None,
        }
    }

    pub fn labeled(size: usize, label: &str) -> Dim {
        Dim::Sized {
            size,
            label: Some(label.to_string()),
            proj: None,
        }
    }

    pub fn size(&self) -> Option<usize> {
        match self {
            Dim::Sized { size, .. } => Some(*size),
            Dim::Var { .. } => None,
        }
    }

    pub fn is_var(&self) -> bool {
        matches!(self, Dim::Var { .. })
    }

    /// Same dim with a projection class attached.
    pub fn with_proj(&self, proj: ProjId) -> Dim {
        match self {
            Dim::Sized { size, label, .. } => Dim::Sized {
                size: *size,
                label: label.clone(),
                proj: Some(proj),
            },
            var => var.clone(),
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Var { id, label: Some(l) } => write!(f, "?{}_{}", id, l),
            Dim::Var { id, label: None } => write!(f, "?{}", id),
            Dim::Sized { size, label: Some(l), .. } => write!(f, "{}={}", l, size),
            Dim::Sized { size, label: None, .. } => write!(f, "{}", size),
        }
    }
}

/// Trailing openness of a row. Open rows extend leftward under broadcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowTail {
    Open(RowVarId),
    Closed,
}

/// Element-count constraint on a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowConstraint {
    Unconstrained,
    TotalElems(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Known axes, outermost first. The tail extension, if any, prepends.
    pub dims: Vec<Dim>,
    pub tail: RowTail,
    pub id: RowId,
    pub constr: RowConstraint,
}

impl Row {
    pub fn new(dims: Vec<Dim>, tail: RowTail, id: RowId) -> Row {
        Row {
            dims,
            tail,
            id,
            constr: RowConstraint::Unconstrained,
        }
    }

    /// Concrete sizes of all axes, or `None` if any variable remains.
    pub fn concrete_dims(&self) -> Option<Vec<usize>> {
        if matches!(self.tail, RowTail::Open(_)) {
            return None;
        }
        self.dims.iter().map(|d| d.size()).collect()
    }

    pub fn is_concrete(&self) -> bool {
        self.concrete_dims().is_some()
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let RowTail::Open(v) = self.tail {
            write!(f, "..{} ", v)?;
        }
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

/// A partial row standing for what a row variable expands to.
#[derive(Debug, Clone, PartialEq)]
pub struct RowExt {
    pub dims: Vec<Dim>,
    pub tail: RowTail,
}

// =============================================================================
// Constraints
// =============================================================================

/// The constraint vocabulary emitted by shape logic. `cur` is always the
/// super-tensor side (cannot shrink), `subr` the sub-tensor side (may be
/// broadcast).
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    DimEq { d1: Dim, d2: Dim },
    RowEq { r1: Row, r2: Row },
    DimIneq { cur: Dim, subr: Dim },
    RowIneq { cur: Row, subr: Row },
    RowConstr { row: Row, constr: RowConstraint },
    TerminalDim(Dim),
    TerminalRow(Row),
}

// =============================================================================
// Environment entries
// =============================================================================

#[derive(Debug, Clone)]
enum DimEntry {
    Solved(Dim),
    Bounds {
        /// Variables known to be >= this one.
        cur: Vec<DimVarId>,
        /// Variables known to be <= this one.
        subr: Vec<DimVarId>,
        /// Tightest concrete upper bound seen so far.
        lub: Option<usize>,
    },
}

#[derive(Debug, Clone)]
enum RowEntry {
    Solved(RowExt),
    Bounds {
        cur: Vec<RowVarId>,
        subr: Vec<RowVarId>,
        /// Dimension-wise tightest upper bound on the extension.
        lub: Option<Vec<Dim>>,
        /// A row that mentioned this variable, for error traces.
        exemplar: RowId,
    },
}

/// The shape-inference environment: transitive bounds, solutions, and the
/// template cache for repeated row extensions. Owned by the session and
/// reset at the boundary of a compilation unit.
#[derive(Debug, Default)]
pub struct RowEnv {
    dim_env: HashMap<DimVarId, DimEntry>,
    row_env: HashMap<RowVarId, RowEntry>,
    dim_vars: IdSource<DimVarId>,
    row_vars: IdSource<RowVarId>,
    /// Keyed by (row var, length delta): the extension minted the first
    /// time that variable had to grow by that many axes.
    template_cache: HashMap<(RowVarId, usize), RowExt>,
}

impl RowEnv {
    pub fn new() -> RowEnv {
        RowEnv::default()
    }

    /// Drop all solutions and bounds. Variable counters keep running so ids
    /// stay unique within the process.
    pub fn reset(&mut self) {
        self.dim_env.clear();
        self.row_env.clear();
        self.template_cache.clear();
    }

    pub fn fresh_dim_var(&mut self, label: Option<&str>) -> Dim {
        Dim::Var {
            id: self.dim_vars.next_id(),
            label: label.map(str::to_string),
        }
    }

    pub fn fresh_row_var(&mut self) -> RowVarId {
        self.row_vars.next_id()
    }

    // -------------------------------------------------------------------------
    // Substitution
    // -------------------------------------------------------------------------

    /// Resolve a dim through the current solutions.
    pub fn subst_dim(&self, d: &Dim) -> Dim {
        let mut cur = d.clone();
        let mut depth = 0;
        while let Dim::Var { id, .. } = cur {
            match self.dim_env.get(&id) {
                Some(DimEntry::Solved(next)) => cur = next.clone(),
                _ => break,
            }
            depth += 1;
            assert!(depth < 512, "cycle in dim substitution");
        }
        cur
    }

    /// Resolve a row through the current solutions: splice solved tail
    /// extensions and resolve every dim.
    pub fn subst_row(&self, r: &Row) -> Row {
        let mut dims: Vec<Dim> = r.dims.clone();
        let mut tail = r.tail;
        let mut depth = 0;
        while let RowTail::Open(v) = tail {
            match self.row_env.get(&v) {
                Some(RowEntry::Solved(ext)) => {
                    let mut prefix = ext.dims.clone();
                    prefix.extend(dims);
                    dims = prefix;
                    tail = ext.tail;
                }
                _ => break,
            }
            depth += 1;
            assert!(depth < 512, "cycle in row substitution");
        }
        let dims = dims.iter().map(|d| self.subst_dim(d)).collect();
        Row {
            dims,
            tail,
            id: r.id,
            constr: r.constr,
        }
    }

    // -------------------------------------------------------------------------
    // Solving variables
    // -------------------------------------------------------------------------

    fn solve_dim_var(&mut self, v: DimVarId, d: Dim, out: &mut Vec<Constraint>) -> Result<()> {
        if let Dim::Var { id, .. } = &d {
            if *id == v {
                return Ok(());
            }
        }
        debug!("solve {} := {}", v, d);
        let old = self.dim_env.insert(v, DimEntry::Solved(d.clone()));
        if let Some(DimEntry::Bounds { cur, subr, lub }) = old {
            if let Some(l) = lub {
                out.push(Constraint::DimIneq {
                    cur: Dim::sized(l),
                    subr: d.clone(),
                });
            }
            for c in cur {
                out.push(Constraint::DimIneq {
                    cur: Dim::Var { id: c, label: None },
                    subr: d.clone(),
                });
            }
            for s in subr {
                out.push(Constraint::DimIneq {
                    cur: d.clone(),
                    subr: Dim::Var { id: s, label: None },
                });
            }
        }
        Ok(())
    }

    fn solve_row_var(&mut self, v: RowVarId, ext: RowExt, out: &mut Vec<Constraint>) -> Result<()> {
        if ext.tail == RowTail::Open(v) {
            if ext.dims.is_empty() {
                return Ok(());
            }
            bail_shape!("row variable {} occurs in its own extension (infinite axes)", v);
        }
        debug!("solve {} := {:?}", v, ext);
        let old = self.row_env.insert(v, RowEntry::Solved(ext.clone()));
        if let Some(RowEntry::Bounds { cur, subr, lub, exemplar }) = old {
            let as_row = |tail: RowTail, dims: Vec<Dim>| Row {
                dims,
                tail,
                id: exemplar,
                constr: RowConstraint::Unconstrained,
            };
            let solved = as_row(ext.tail, ext.dims.clone());
            if let Some(l) = lub {
                out.push(Constraint::RowIneq {
                    cur: as_row(RowTail::Closed, l),
                    subr: solved.clone(),
                });
            }
            for c in cur {
                out.push(Constraint::RowIneq {
                    cur: as_row(RowTail::Open(c), vec![]),
                    subr: solved.clone(),
                });
            }
            for s in subr {
                out.push(Constraint::RowIneq {
                    cur: solved.clone(),
                    subr: as_row(RowTail::Open(s), vec![]),
                });
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Equalities
    // -------------------------------------------------------------------------

    pub fn unify_dim(&mut self, d1: &Dim, d2: &Dim, out: &mut Vec<Constraint>) -> Result<()> {
        let a = self.subst_dim(d1);
        let b = self.subst_dim(d2);
        match (&a, &b) {
            (Dim::Var { id: v, .. }, Dim::Var { id: w, .. }) if v == w => Ok(()),
            (Dim::Var { id: v, .. }, _) => self.solve_dim_var(*v, b.clone(), out),
            (_, Dim::Var { id: w, .. }) => self.solve_dim_var(*w, a.clone(), out),
            (
                Dim::Sized { size: sa, label: la, .. },
                Dim::Sized { size: sb, label: lb, .. },
            ) => {
                if sa != sb {
                    if la.is_some() && la == lb {
                        bail_shape_trace!(
                            [a, b],
                            "dims labeled '{}' have different sizes {} and {}",
                            la.as_deref().unwrap(),
                            sa,
                            sb
                        );
                    }
                    bail_shape_trace!([a, b], "dimension mismatch: {} vs {}", sa, sb);
                }
                if let (Some(la), Some(lb)) = (la, lb) {
                    if la != lb {
                        bail_shape_trace!([a, b], "dimension label mismatch: '{}' vs '{}'", la, lb);
                    }
                }
                Ok(())
            }
        }
    }

    pub fn unify_row(&mut self, r1: &Row, r2: &Row, out: &mut Vec<Constraint>) -> Result<()> {
        let a = self.subst_row(r1);
        let b = self.subst_row(r2);
        let (la, lb) = (a.dims.len(), b.dims.len());
        let aligned = la.min(lb);
        for i in 0..aligned {
            out.push(Constraint::DimEq {
                d1: a.dims[la - aligned + i].clone(),
                d2: b.dims[lb - aligned + i].clone(),
            });
        }
        if la == lb {
            match (a.tail, b.tail) {
                (RowTail::Closed, RowTail::Closed) => Ok(()),
                (RowTail::Open(v), RowTail::Closed) | (RowTail::Closed, RowTail::Open(v)) => {
                    self.solve_row_var(
                        v,
                        RowExt {
                            dims: vec![],
                            tail: RowTail::Closed,
                        },
                        out,
                    )
                }
                (RowTail::Open(v), RowTail::Open(w)) => {
                    if v == w {
                        Ok(())
                    } else {
                        self.solve_row_var(
                            v,
                            RowExt {
                                dims: vec![],
                                tail: RowTail::Open(w),
                            },
                            out,
                        )
                    }
                }
            }
        } else {
            let (longer, shorter) = if la > lb { (&a, &b) } else { (&b, &a) };
            let delta = longer.dims.len() - shorter.dims.len();
            match shorter.tail {
                RowTail::Closed => bail_shape_trace!(
                    [a, b],
                    "axis count mismatch: {} axes vs {} axes on a closed row",
                    longer.dims.len(),
                    shorter.dims.len()
                ),
                RowTail::Open(v) => {
                    if longer.tail == RowTail::Open(v) {
                        bail_shape_trace!([a, b], "row variable {} occurs on both sides (infinite axes)", v);
                    }
                    self.solve_row_var(
                        v,
                        RowExt {
                            dims: longer.dims[..delta].to_vec(),
                            tail: longer.tail,
                        },
                        out,
                    )
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Inequalities
    // -------------------------------------------------------------------------

    pub fn dim_ineq(&mut self, cur: &Dim, subr: &Dim, out: &mut Vec<Constraint>) -> Result<()> {
        let c = self.subst_dim(cur);
        let s = self.subst_dim(subr);
        match (&c, &s) {
            (
                Dim::Sized { size: a, label: la, .. },
                Dim::Sized { size: b, label: lb, .. },
            ) => {
                if a != b && *b != 1 {
                    bail_shape_trace!([c, s], "dimension {} cannot broadcast to {}", b, a);
                }
                if a == b {
                    if let (Some(la), Some(lb)) = (la, lb) {
                        if la != lb {
                            bail_shape_trace!([c, s], "dimension label mismatch: '{}' vs '{}'", la, lb);
                        }
                    }
                }
                Ok(())
            }
            // A size-1 supertype forces the subtype to 1.
            (Dim::Sized { size: 1, .. }, Dim::Var { id: w, .. }) => {
                self.solve_dim_var(*w, Dim::sized(1), out)
            }
            // An upper bound: record or tighten the LUB.
            (Dim::Sized { size, .. }, Dim::Var { id: w, .. }) => {
                self.tighten_dim_lub(*w, *size);
                Ok(())
            }
            // 1 is below everything.
            (Dim::Var { .. }, Dim::Sized { size: 1, .. }) => Ok(()),
            // n >= s with s != 1 forces n = s.
            (Dim::Var { id: v, .. }, Dim::Sized { .. }) => self.solve_dim_var(*v, s.clone(), out),
            (Dim::Var { id: v, .. }, Dim::Var { id: w, .. }) => {
                if v == w {
                    return Ok(());
                }
                self.record_dim_bound(*v, *w, out)
            }
        }
    }

    /// Record `v >= w` between two unsolved variables. Crossed bounds force
    /// equality.
    fn record_dim_bound(&mut self, v: DimVarId, w: DimVarId, out: &mut Vec<Constraint>) -> Result<()> {
        let crossed = match self.dim_env.get(&v) {
            Some(DimEntry::Bounds { cur, .. }) => cur.contains(&w),
            _ => false,
        };
        if crossed {
            out.push(Constraint::DimEq {
                d1: Dim::Var { id: v, label: None },
                d2: Dim::Var { id: w, label: None },
            });
            return Ok(());
        }
        let v_lub = match self.dim_env.entry(v).or_insert_with(|| DimEntry::Bounds {
            cur: vec![],
            subr: vec![],
            lub: None,
        }) {
            DimEntry::Bounds { subr, lub, .. } => {
                if !subr.contains(&w) {
                    subr.push(w);
                }
                *lub
            }
            DimEntry::Solved(_) => unreachable!("bound recorded on solved dim var"),
        };
        if let DimEntry::Bounds { cur, .. } = self.dim_env.entry(w).or_insert_with(|| DimEntry::Bounds {
            cur: vec![],
            subr: vec![],
            lub: None,
        }) {
            if !cur.contains(&v) {
                cur.push(v);
            }
        }
        // w <= v <= lub(v), so v's bound carries over.
        if let Some(l) = v_lub {
            self.tighten_dim_lub(w, l);
        }
        Ok(())
    }

    /// Tighten the upper bound of a variable. Two distinct non-1 upper
    /// bounds cross: only 1 remains below both.
    fn tighten_dim_lub(&mut self, v: DimVarId, bound: usize) {
        match self.dim_env.entry(v).or_insert_with(|| DimEntry::Bounds {
            cur: vec![],
            subr: vec![],
            lub: None,
        }) {
            DimEntry::Bounds { lub, .. } => {
                *lub = Some(match *lub {
                    None => bound,
                    Some(old) if old == bound => old,
                    Some(_) => 1,
                });
            }
            DimEntry::Solved(_) => unreachable!("lub tightened on solved dim var"),
        }
    }

    pub fn row_ineq(&mut self, cur: &Row, subr: &Row, out: &mut Vec<Constraint>) -> Result<()> {
        let c = self.subst_row(cur);
        let s = self.subst_row(subr);
        let (lc, ls) = (c.dims.len(), s.dims.len());
        if lc >= ls {
            for i in 0..ls {
                out.push(Constraint::DimIneq {
                    cur: c.dims[lc - ls + i].clone(),
                    subr: s.dims[i].clone(),
                });
            }
            match s.tail {
                RowTail::Closed => Ok(()),
                RowTail::Open(v) => {
                    let extra = &c.dims[..lc - ls];
                    if !extra.is_empty() {
                        self.merge_row_lub(v, extra, s.id);
                    }
                    if let RowTail::Open(u) = c.tail {
                        self.record_row_bound(u, v, c.id, out)?;
                    }
                    Ok(())
                }
            }
        } else {
            // The supertype must have at least as many axes: grow it.
            match c.tail {
                RowTail::Closed => bail_shape_trace!(
                    [c, s],
                    "axis count mismatch: closed row has {} axes, subtype needs {}",
                    lc,
                    ls
                ),
                RowTail::Open(v) => {
                    let ext = self.row_template(v, ls - lc);
                    self.solve_row_var(v, ext, out)?;
                    out.push(Constraint::RowIneq { cur: c, subr: s });
                    Ok(())
                }
            }
        }
    }

    /// The extension minted for growing `v` by `delta` axes, cached so the
    /// same extension is not re-invented by a second constraint.
    fn row_template(&mut self, v: RowVarId, delta: usize) -> RowExt {
        if let Some(ext) = self.template_cache.get(&(v, delta)) {
            return ext.clone();
        }
        let dims = (0..delta).map(|_| self.fresh_dim_var(None)).collect();
        let ext = RowExt {
            dims,
            tail: RowTail::Open(self.fresh_row_var()),
        };
        self.template_cache.insert((v, delta), ext.clone());
        ext
    }

    fn record_row_bound(&mut self, u: RowVarId, v: RowVarId, exemplar: RowId, out: &mut Vec<Constraint>) -> Result<()> {
        if u == v {
            return Ok(());
        }
        let crossed = match self.row_env.get(&u) {
            Some(RowEntry::Bounds { cur, .. }) => cur.contains(&v),
            _ => false,
        };
        if crossed {
            let as_row = |tail| Row {
                dims: vec![],
                tail,
                id: exemplar,
                constr: RowConstraint::Unconstrained,
            };
            out.push(Constraint::RowEq {
                r1: as_row(RowTail::Open(u)),
                r2: as_row(RowTail::Open(v)),
            });
            return Ok(());
        }
        match self.row_env.entry(u).or_insert_with(|| RowEntry::Bounds {
            cur: vec![],
            subr: vec![],
            lub: None,
            exemplar,
        }) {
            RowEntry::Bounds { subr, .. } => {
                if !subr.contains(&v) {
                    subr.push(v);
                }
            }
            RowEntry::Solved(_) => unreachable!("bound recorded on solved row var"),
        }
        match self.row_env.entry(v).or_insert_with(|| RowEntry::Bounds {
            cur: vec![],
            subr: vec![],
            lub: None,
            exemplar,
        }) {
            RowEntry::Bounds { cur, .. } => {
                if !cur.contains(&u) {
                    cur.push(u);
                }
            }
            RowEntry::Solved(_) => unreachable!("bound recorded on solved row var"),
        }
        Ok(())
    }

    /// Merge an upper-bound extension into a row variable's LUB,
    /// dimension-wise with trailing alignment. Distinct non-1 bounds on the
    /// same axis cross to 1; the shorter bound wins on length.
    fn merge_row_lub(&mut self, v: RowVarId, bound: &[Dim], exemplar: RowId) {
        match self.row_env.entry(v).or_insert_with(|| RowEntry::Bounds {
            cur: vec![],
            subr: vec![],
            lub: None,
            exemplar,
        }) {
            RowEntry::Bounds { lub, .. } => {
                *lub = Some(match lub.take() {
                    None => bound.to_vec(),
                    Some(old) => {
                        let keep = old.len().min(bound.len());
                        let old_off = old.len() - keep;
                        let bound_off = bound.len() - keep;
                        (0..keep)
                            .map(|i| {
                                let a = &old[old_off + i];
                                let b = &bound[bound_off + i];
                                match (a.size(), b.size()) {
                                    (Some(x), Some(y)) if x == y => a.clone(),
                                    (Some(_), Some(_)) => Dim::sized(1),
                                    (Some(_), None) => a.clone(),
                                    _ => b.clone(),
                                }
                            })
                            .collect()
                    }
                });
            }
            RowEntry::Solved(_) => unreachable!("lub merged on solved row var"),
        }
    }

    // -------------------------------------------------------------------------
    // Row element-count constraints
    // -------------------------------------------------------------------------

    /// Try to discharge a `TotalElems` constraint. Returns `false` when it
    /// must be deferred (open row or more than one unknown).
    pub fn row_total_elems(&mut self, row: &Row, total: usize, out: &mut Vec<Constraint>) -> Result<bool> {
        let r = self.subst_row(row);
        if matches!(r.tail, RowTail::Open(_)) {
            return Ok(false);
        }
        let mut product: usize = 1;
        let mut unknown: Option<DimVarId> = None;
        for d in &r.dims {
            match d {
                Dim::Sized { size, .. } => product *= size,
                Dim::Var { id, .. } => {
                    if unknown.is_some() {
                        return Ok(false);
                    }
                    unknown = Some(*id);
                }
            }
        }
        match unknown {
            None => {
                if product != total {
                    bail_shape_trace!([r], "row has {} elements, constrained to {}", product, total);
                }
                Ok(true)
            }
            Some(v) => {
                if product == 0 || total % product != 0 || total / product == 0 {
                    bail_shape_trace!(
                        [r],
                        "cannot divide {} elements among known dims of product {}",
                        total,
                        product
                    );
                }
                self.solve_dim_var(v, Dim::sized(total / product), out)?;
                Ok(true)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Terminal closing
    // -------------------------------------------------------------------------

    /// Close a dim variable at its LUB, or at the neutral dim 1.
    pub fn close_dim(&mut self, d: &Dim, out: &mut Vec<Constraint>) -> Result<()> {
        if let Dim::Var { id, .. } = self.subst_dim(d) {
            let at = match self.dim_env.get(&id) {
                Some(DimEntry::Bounds { lub: Some(l), .. }) => *l,
                _ => 1,
            };
            self.solve_dim_var(id, Dim::sized(at), out)?;
        }
        Ok(())
    }

    /// Close a row variable at its LUB extension, or at the empty extension.
    pub fn close_row(&mut self, r: &Row, out: &mut Vec<Constraint>) -> Result<()> {
        let row = self.subst_row(r);
        if let RowTail::Open(v) = row.tail {
            let dims = match self.row_env.get(&v) {
                Some(RowEntry::Bounds { lub: Some(l), .. }) => l.clone(),
                _ => vec![],
            };
            self.solve_row_var(
                v,
                RowExt {
                    dims,
                    tail: RowTail::Closed,
                },
                out,
            )?;
        }
        // Re-substitute so dims gained from the LUB extension close too.
        let row = self.subst_row(&row);
        for d in &row.dims {
            self.close_dim(d, out)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // The solver loop
    // -------------------------------------------------------------------------

    /// Reduce constraints until only deferred row constraints (and, outside
    /// the finishing round, terminal markers) remain. Returns the residue.
    pub fn solve(&mut self, constraints: Vec<Constraint>, finishing: bool) -> Result<Vec<Constraint>> {
        let mut work = constraints;
        let mut stuck: Vec<Constraint> = vec![];
        while !work.is_empty() {
            let mut emitted: Vec<Constraint> = vec![];
            for c in std::mem::take(&mut work) {
                match c {
                    Constraint::DimEq { d1, d2 } => self.unify_dim(&d1, &d2, &mut emitted)?,
                    Constraint::RowEq { r1, r2 } => self.unify_row(&r1, &r2, &mut emitted)?,
                    Constraint::DimIneq { cur, subr } => self.dim_ineq(&cur, &subr, &mut emitted)?,
                    Constraint::RowIneq { cur, subr } => self.row_ineq(&cur, &subr, &mut emitted)?,
                    Constraint::RowConstr { row, constr } => match constr {
                        RowConstraint::Unconstrained => {}
                        RowConstraint::TotalElems(n) => {
                            if !self.row_total_elems(&row, n, &mut emitted)? {
                                let open_tail = match self.subst_row(&row).tail {
                                    RowTail::Open(v) => Some(v),
                                    RowTail::Closed => None,
                                };
                                match (finishing, open_tail) {
                                    // At finishing time an open constrained
                                    // row closes with one absorbing axis.
                                    (true, Some(v)) => {
                                        let dim = self.fresh_dim_var(None);
                                        self.solve_row_var(
                                            v,
                                            RowExt {
                                                dims: vec![dim],
                                                tail: RowTail::Closed,
                                            },
                                            &mut emitted,
                                        )?;
                                        emitted.push(Constraint::RowConstr { row, constr });
                                    }
                                    _ => stuck.push(Constraint::RowConstr { row, constr }),
                                }
                            }
                        }
                    },
                    Constraint::TerminalDim(d) => {
                        if finishing {
                            self.close_dim(&d, &mut emitted)?;
                        } else if self.subst_dim(&d).is_var() {
                            stuck.push(Constraint::TerminalDim(d));
                        }
                    }
                    Constraint::TerminalRow(r) => {
                        if finishing {
                            self.close_row(&r, &mut emitted)?;
                        } else if !self.subst_row(&r).is_concrete() {
                            stuck.push(Constraint::TerminalRow(r));
                        }
                    }
                }
            }
            if !emitted.is_empty() {
                // Progress was made: retry deferred constraints too.
                work = emitted;
                work.append(&mut stuck);
            }
        }
        Ok(stuck)
    }

    /// Close every variable still unsolved anywhere in the environment, at
    /// its LUB or the neutral value. Returns ground-check constraints that
    /// the caller must run through `solve` once more.
    pub fn close_all(&mut self) -> Result<Vec<Constraint>> {
        let mut out = vec![];
        let dim_vars: Vec<DimVarId> = self
            .dim_env
            .iter()
            .filter_map(|(v, e)| match e {
                DimEntry::Bounds { .. } => Some(*v),
                DimEntry::Solved(_) => None,
            })
            .collect();
        for v in dim_vars {
            self.close_dim(&Dim::Var { id: v, label: None }, &mut out)?;
        }
        let row_vars: Vec<(RowVarId, RowId)> = self
            .row_env
            .iter()
            .filter_map(|(v, e)| match e {
                RowEntry::Bounds { exemplar, .. } => Some((*v, *exemplar)),
                RowEntry::Solved(_) => None,
            })
            .collect();
        for (v, exemplar) in row_vars {
            let row = Row {
                dims: vec![],
                tail: RowTail::Open(v),
                id: exemplar,
                constr: RowConstraint::Unconstrained,
            };
            self.close_row(&row, &mut out)?;
        }
        Ok(out)
    }
}
