//! Shapes, per-operation shape logic, and projection derivation.
//!
//! A shape is three rows: batch, input, output; the physical axis order
//! used for indexing is batch ++ output ++ input. Each operation carries a
//! declarative `Logic` describing how its shape relates to its operands;
//! `propagate_shapes` turns the logic into constraints and feeds the row
//! solver, `finish_inference` closes the system, and `derive_projections`
//! re-runs constraint generation with projection-tagged dims to obtain the
//! iteration space and per-operand index functions.

use std::collections::HashMap;
use std::path::PathBuf;

use log::debug;

use crate::array::ArrayId;
use crate::einsum::{parse_einsum, parse_permutation, AxesSpec, AxisLabel};
use crate::error::Result;
use crate::indexing::{fresh_labeled_symbol, AxisIndex, ProjId, Projections, StaticSymbol, Symbol};
use crate::llir::Precision;
use crate::row::{AxisKind, Constraint, Dim, Row, RowConstraint, RowEnv, RowId, RowTail, ShapeId};
use crate::{bail_shape, bail_shape_trace, err_shape, err_shape_trace, IdArena, IdSource};

// =============================================================================
// Shapes
// =============================================================================

#[derive(Debug, Clone)]
pub struct Shape {
    pub id: ShapeId,
    pub batch: Row,
    pub input: Row,
    pub output: Row,
    pub debug_label: String,
    /// Back-reference to the array this shape describes, if any.
    pub array: Option<ArrayId>,
}

impl Shape {
    pub fn row(&self, kind: AxisKind) -> &Row {
        match kind {
            AxisKind::Batch => &self.batch,
            AxisKind::Input => &self.input,
            AxisKind::Output => &self.output,
        }
    }

    fn row_mut(&mut self, kind: AxisKind) -> &mut Row {
        match kind {
            AxisKind::Batch => &mut self.batch,
            AxisKind::Input => &mut self.input,
            AxisKind::Output => &mut self.output,
        }
    }

    /// Concrete dims in physical order (batch ++ output ++ input), after
    /// inference has finished.
    pub fn physical_dims(&self) -> Result<Vec<usize>> {
        let mut dims = vec![];
        for kind in [AxisKind::Batch, AxisKind::Output, AxisKind::Input] {
            let row = self.row(kind);
            let row_dims = row.concrete_dims().ok_or_else(|| {
                err_shape_trace!([row], "shape '{}' still has variables", self.debug_label)
            })?;
            dims.extend(row_dims);
        }
        Ok(dims)
    }
}

/// The order the three rows contribute to the physical index space.
pub const PHYSICAL_KINDS: [AxisKind; 3] = [AxisKind::Batch, AxisKind::Output, AxisKind::Input];

// =============================================================================
// Shape logic
// =============================================================================

/// Terminal fetch operations. The initializer runs when the array's
/// contents are first demanded.
#[derive(Debug, Clone, PartialEq)]
pub enum InitOp {
    /// Fill from a literal list of values, cycled. With `strict`, the value
    /// count must equal the element count, which constrains the batch row.
    ConstantFill { values: Vec<f64>, strict: bool },
    /// Fill with the index offset of each cell.
    RangeOverOffsets,
    /// Memory-map a file of the given precision; its length constrains the
    /// batch row.
    FileMapped { path: PathBuf, prec: Precision },
    /// Sample from the uniform distribution on [0, 1).
    StandardUniform,
}

/// How a unary operation's shape relates to its operand's.
#[derive(Debug, Clone, PartialEq)]
pub enum TransposeKind {
    /// Same axes, broadcast allowed.
    Pointwise,
    /// Swap input and output rows.
    Transpose,
    /// Arbitrary axis permutation given as an einsum-style spec.
    Permute(String),
    /// Select one batch position; the index is bound at staging time.
    BatchSlice(StaticSymbol),
}

/// How a binary operation's shape relates to its operands'.
#[derive(Debug, Clone, PartialEq)]
pub enum ComposeKind {
    /// Same axes everywhere, broadcast allowed.
    Pointwise,
    /// Inner product: the first operand's input row feeds the second
    /// operand's output row.
    Compose,
    /// General axis alignment and contraction.
    Einsum(String),
}

/// The declarative shape spec of one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Logic {
    Terminal(InitOp),
    Transpose(TransposeKind, ShapeId),
    Broadcast(ComposeKind, ShapeId, ShapeId),
}

/// One inference step: a shape and the logic that determines it.
#[derive(Debug, Clone)]
pub struct UpdateStep {
    pub shape: ShapeId,
    pub logic: Logic,
}

// =============================================================================
// Shape environment
// =============================================================================

/// Owns the shapes and the row-inference state for one compilation unit.
#[derive(Debug, Default)]
pub struct ShapeEnv {
    shapes: IdArena<ShapeId, Shape>,
    pub row_env: RowEnv,
    /// Constraints deferred by propagation, consumed by the finishing round.
    pending: Vec<Constraint>,
    static_bindings: HashMap<Symbol, i64>,
}

impl ShapeEnv {
    pub fn new() -> ShapeEnv {
        ShapeEnv::default()
    }

    pub fn shape(&self, id: ShapeId) -> &Shape {
        self.shapes.get(id).expect("unknown shape id")
    }

    pub fn set_array(&mut self, id: ShapeId, array: ArrayId) {
        self.shapes.get_mut(id).expect("unknown shape id").array = Some(array);
    }

    /// Bind the staging-time value of a static symbol.
    pub fn bind_static(&mut self, sym: StaticSymbol, value: i64) {
        self.static_bindings.insert(sym.0, value);
    }

    /// A shape with the given concrete rows; `None` leaves a row fully
    /// unknown (no axes, open tail).
    pub fn make_shape_spec(
        &mut self,
        label: &str,
        batch: Option<&[usize]>,
        input: Option<&[usize]>,
        output: Option<&[usize]>,
    ) -> ShapeId {
        let id = self.shapes.alloc_id();
        let mut mk = |kind: AxisKind, dims: Option<&[usize]>| {
            let row_id = RowId { shape: id, kind };
            match dims {
                Some(ds) => Row::new(ds.iter().map(|d| Dim::sized(*d)).collect(), RowTail::Closed, row_id),
                None => Row::new(vec![], RowTail::Open(self.row_env.fresh_row_var()), row_id),
            }
        };
        let shape = Shape {
            id,
            batch: mk(AxisKind::Batch, batch),
            input: mk(AxisKind::Input, input),
            output: mk(AxisKind::Output, output),
            debug_label: label.to_string(),
            array: None,
        };
        self.shapes.insert(id, shape);
        id
    }

    /// A fully concrete shape.
    pub fn make_shape(&mut self, label: &str, batch: &[usize], input: &[usize], output: &[usize]) -> ShapeId {
        self.make_shape_spec(label, Some(batch), Some(input), Some(output))
    }

    /// A fully unknown shape, to be determined by inference.
    pub fn unknown_shape(&mut self, label: &str) -> ShapeId {
        self.make_shape_spec(label, None, None, None)
    }

    /// The dims of an operand as seen by an operation on `result`: each row
    /// is padded with leading dimension-1 axes up to the result's row
    /// length, matching the `Fixed(0)` padding of the operand's index
    /// vector. Total element count is unchanged.
    pub fn broadcast_dims(&self, operand: ShapeId, result: ShapeId) -> Result<Vec<usize>> {
        let op = self.shape(operand);
        let res = self.shape(result);
        let mut dims = vec![];
        for kind in PHYSICAL_KINDS {
            let own = op.row(kind).concrete_dims().ok_or_else(|| {
                err_shape_trace!([op.row(kind)], "operand '{}' not fully inferred", op.debug_label)
            })?;
            let target = res.row(kind).concrete_dims().ok_or_else(|| {
                err_shape_trace!([res.row(kind)], "result '{}' not fully inferred", res.debug_label)
            })?;
            let pad = target.len().saturating_sub(own.len());
            dims.extend(std::iter::repeat(1).take(pad));
            dims.extend(own);
        }
        Ok(dims)
    }

    // -------------------------------------------------------------------------
    // Inference entry points
    // -------------------------------------------------------------------------

    /// Propagate the constraints of one update into the environment.
    /// Returns how many constraints had to be deferred; a finished system
    /// defers none.
    pub fn propagate_shapes(&mut self, update: &UpdateStep) -> Result<usize> {
        debug!("propagate {:?} for shape {:?}", update.logic, update.shape);
        let constraints = self.constraints_for(update, None)?;
        let residual = self.row_env.solve(constraints, false)?;
        let deferred = residual.len();
        self.pending.extend(residual);
        Ok(deferred)
    }

    /// Run the solver a second time, close every remaining variable at its
    /// LUB or neutral value, write the solutions back into the shapes, and
    /// reset the environment. After this no shape contains a variable.
    pub fn finish_inference(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        let residual = self.row_env.solve(pending, false)?;
        let mut leftover = self.row_env.solve(residual, true)?;
        leftover.extend(self.row_env.close_all()?);
        // Rows never mentioned by a terminal still need closing: every row
        // of every shape is driven to its LUB or neutral value.
        let ids: Vec<ShapeId> = self.shapes.iter().map(|(id, _)| *id).collect();
        for id in ids {
            for kind in PHYSICAL_KINDS {
                let row = self.shape(id).row(kind).clone();
                self.row_env.close_row(&row, &mut leftover)?;
            }
        }
        let leftover = self.row_env.solve(leftover, true)?;
        if !leftover.is_empty() {
            bail_shape!("constraints remain unsolvable after closing: {:?}", leftover);
        }
        for (_, shape) in self.shapes.iter_mut() {
            for kind in PHYSICAL_KINDS {
                let solved = self.row_env.subst_row(shape.row(kind));
                if !solved.is_concrete() {
                    bail_shape_trace!(
                        [solved],
                        "shape '{}' not determined by inference",
                        shape.debug_label
                    );
                }
                *shape.row_mut(kind) = solved;
            }
        }
        self.row_env.reset();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Constraint generation
    // -------------------------------------------------------------------------

    /// Generate the constraints of one update. With a projection context,
    /// every axis occurrence of the involved shapes is tagged with a fresh
    /// projection id and the context records sizes, labels, fixed indices,
    /// and the product-space ordering.
    fn constraints_for(&mut self, update: &UpdateStep, mut proj: Option<&mut ProjCtx>) -> Result<Vec<Constraint>> {
        let mut out = vec![];
        let cur = self.tag_shape(update.shape, proj.as_deref_mut())?;
        match &update.logic {
            Logic::Terminal(init) => {
                for row in [&cur.batch, &cur.input, &cur.output] {
                    out.push(Constraint::TerminalRow(row.clone()));
                }
                match init {
                    InitOp::ConstantFill { values, strict } => {
                        if *strict {
                            let n = self.batch_elems_for(&cur, values.len())?;
                            out.push(Constraint::RowConstr {
                                row: cur.batch.clone(),
                                constr: RowConstraint::TotalElems(n),
                            });
                        }
                    }
                    InitOp::FileMapped { path, prec } => {
                        let bytes = std::fs::metadata(path)
                            .map_err(|e| crate::error::CompilerError::Io {
                                name: path.display().to_string(),
                                source: e,
                            })?
                            .len() as usize;
                        let elem = prec.size_in_bytes();
                        if bytes % elem != 0 {
                            bail_shape!(
                                "file {} has {} bytes, not a multiple of element size {}",
                                path.display(),
                                bytes,
                                elem
                            );
                        }
                        let n = self.batch_elems_for(&cur, bytes / elem)?;
                        out.push(Constraint::RowConstr {
                            row: cur.batch.clone(),
                            constr: RowConstraint::TotalElems(n),
                        });
                    }
                    InitOp::RangeOverOffsets | InitOp::StandardUniform => {}
                }
                if let Some(ctx) = proj {
                    ctx.order_physical();
                }
            }
            Logic::Transpose(kind, sub_id) => {
                let sub = self.tag_shape(*sub_id, proj.as_deref_mut())?;
                match kind {
                    TransposeKind::Pointwise => {
                        for k in PHYSICAL_KINDS {
                            out.push(Constraint::RowIneq {
                                cur: cur.row(k).clone(),
                                subr: sub.row(k).clone(),
                            });
                        }
                    }
                    TransposeKind::Transpose => {
                        out.push(Constraint::RowIneq {
                            cur: cur.batch.clone(),
                            subr: sub.batch.clone(),
                        });
                        out.push(Constraint::RowIneq {
                            cur: cur.input.clone(),
                            subr: sub.output.clone(),
                        });
                        out.push(Constraint::RowIneq {
                            cur: cur.output.clone(),
                            subr: sub.input.clone(),
                        });
                    }
                    TransposeKind::Permute(spec) => {
                        let (src, dst) = parse_permutation(spec)?;
                        let mut labels = LabelVars::default();
                        for k in PHYSICAL_KINDS {
                            let src_tmpl =
                                self.template_row(&src, k, sub.row(k).id, &mut labels, proj.as_deref_mut(), false);
                            let dst_tmpl =
                                self.template_row(&dst, k, cur.row(k).id, &mut labels, proj.as_deref_mut(), false);
                            out.push(Constraint::RowEq {
                                r1: sub.row(k).clone(),
                                r2: src_tmpl,
                            });
                            out.push(Constraint::RowEq {
                                r1: cur.row(k).clone(),
                                r2: dst_tmpl,
                            });
                        }
                    }
                    TransposeKind::BatchSlice(sym) => {
                        let slice_dim = self.row_env.fresh_dim_var(Some("slice"));
                        if let (Some(ctx), Dim::Var { id, .. }) = (proj.as_deref_mut(), &slice_dim) {
                            let at = *self.static_bindings.get(&sym.0).ok_or_else(|| {
                                err_shape!("static symbol {} not bound at projection time", sym)
                            })?;
                            ctx.fixed.insert(ProjKey::Var(*id), at);
                        }
                        let mut dims = vec![slice_dim];
                        dims.extend(cur.batch.dims.iter().cloned());
                        out.push(Constraint::RowEq {
                            r1: sub.batch.clone(),
                            r2: Row::new(dims, cur.batch.tail, cur.batch.id),
                        });
                        out.push(Constraint::RowEq {
                            r1: cur.input.clone(),
                            r2: sub.input.clone(),
                        });
                        out.push(Constraint::RowEq {
                            r1: cur.output.clone(),
                            r2: sub.output.clone(),
                        });
                    }
                }
                if let Some(ctx) = proj {
                    ctx.order_physical();
                }
            }
            Logic::Broadcast(kind, s1_id, s2_id) => {
                let s1 = self.tag_shape(*s1_id, proj.as_deref_mut())?;
                let s2 = self.tag_shape(*s2_id, proj.as_deref_mut())?;
                match kind {
                    ComposeKind::Pointwise => {
                        for k in PHYSICAL_KINDS {
                            for sub in [&s1, &s2] {
                                out.push(Constraint::RowIneq {
                                    cur: cur.row(k).clone(),
                                    subr: sub.row(k).clone(),
                                });
                            }
                        }
                        if let Some(ctx) = proj {
                            ctx.order_physical();
                        }
                    }
                    ComposeKind::Compose => {
                        for sub in [&s1, &s2] {
                            out.push(Constraint::RowIneq {
                                cur: cur.batch.clone(),
                                subr: sub.batch.clone(),
                            });
                        }
                        out.push(Constraint::RowEq {
                            r1: cur.output.clone(),
                            r2: s1.output.clone(),
                        });
                        out.push(Constraint::RowEq {
                            r1: cur.input.clone(),
                            r2: s2.input.clone(),
                        });
                        out.push(Constraint::RowEq {
                            r1: s1.input.clone(),
                            r2: s2.output.clone(),
                        });
                        if let Some(ctx) = proj {
                            // Loop order: batch, result output, contracted,
                            // result input.
                            ctx.order.extend(ctx.roles[0].batch.iter().map(|(p, _)| *p));
                            ctx.order.extend(ctx.roles[0].output.iter().map(|(p, _)| *p));
                            ctx.order.extend(ctx.roles[1].input.iter().map(|(p, _)| *p));
                            ctx.order.extend(ctx.roles[0].input.iter().map(|(p, _)| *p));
                        }
                    }
                    ComposeKind::Einsum(spec) => {
                        let parsed = parse_einsum(spec)?;
                        if parsed.operands.len() != 2 {
                            bail_shape!(
                                "einsum '{}' has {} operand sections, binary broadcast needs 2",
                                spec,
                                parsed.operands.len()
                            );
                        }
                        let mut labels = LabelVars::default();
                        let generative = self.is_generative(update.shape);
                        for (role, (section, shape)) in
                            [(&parsed.result, &cur), (&parsed.operands[0], &s1), (&parsed.operands[1], &s2)]
                                .into_iter()
                                .enumerate()
                        {
                            let gen = generative && role == 0;
                            for k in PHYSICAL_KINDS {
                                let tmpl =
                                    self.template_row(section, k, shape.row(k).id, &mut labels, proj.as_deref_mut(), gen);
                                out.push(Constraint::RowEq {
                                    r1: shape.row(k).clone(),
                                    r2: tmpl,
                                });
                            }
                        }
                        if let Some(ctx) = proj {
                            ctx.order_physical();
                            for role in 1..ctx.roles.len() {
                                let role_projs: Vec<ProjId> = PHYSICAL_KINDS
                                    .iter()
                                    .flat_map(|k| ctx.roles[role].kind(*k).iter().map(|(p, _)| *p))
                                    .collect();
                                ctx.order.extend(role_projs);
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Elements the batch row must hold so the whole tensor has `total`
    /// elements: divide out the solved non-batch dims.
    fn batch_elems_for(&self, cur: &Shape, total: usize) -> Result<usize> {
        let mut divisor = 1usize;
        for row in [&cur.input, &cur.output] {
            let solved = self.row_env.subst_row(row);
            match solved.concrete_dims() {
                Some(dims) => divisor *= dims.iter().product::<usize>(),
                None => bail_shape_trace!(
                    [solved],
                    "total-element constraint on '{}' needs the non-batch rows solved first",
                    cur.debug_label
                ),
            }
        }
        if divisor == 0 || total % divisor != 0 {
            bail_shape!(
                "'{}': {} elements do not divide into non-batch size {}",
                cur.debug_label,
                total,
                divisor
            );
        }
        Ok(total / divisor)
    }

    /// Whether a shape has no prior information at all: einsum treats such
    /// result rows as generative, collapsing fixed-0 axes to dimension 1.
    fn is_generative(&self, id: ShapeId) -> bool {
        let shape = self.shape(id);
        PHYSICAL_KINDS.iter().all(|k| {
            let row = self.row_env.subst_row(shape.row(*k));
            row.dims.is_empty() && matches!(row.tail, RowTail::Open(_))
        })
    }

    /// A copy of the shape with, in projection mode, every concrete dim
    /// tagged by a fresh projection id registered in the context.
    fn tag_shape(&mut self, id: ShapeId, proj: Option<&mut ProjCtx>) -> Result<Shape> {
        let shape = self.shape(id).clone();
        let Some(ctx) = proj else {
            return Ok(shape);
        };
        let mut tagged = shape;
        let mut role = RoleProjs::default();
        for kind in PHYSICAL_KINDS {
            let row = tagged.row_mut(kind);
            if !row.is_concrete() {
                bail_shape_trace!(
                    [row.clone()],
                    "projections requested before '{}' was fully inferred",
                    tagged.debug_label
                );
            }
            for dim in &mut row.dims {
                let p = ctx.ids.next_id();
                let size = dim.size().expect("concrete row");
                ctx.sizes.insert(p, size);
                if let Dim::Sized { label: Some(l), .. } = dim {
                    ctx.labels.entry(p).or_insert_with(|| l.clone());
                }
                ctx.iterated.push(ProjKey::Proj(p));
                role.kind_mut(kind).push((p, size));
                *dim = dim.with_proj(p);
            }
        }
        ctx.roles.push(role);
        Ok(tagged)
    }

    /// Build a template row from spec labels. Shared labels share one dim
    /// variable; numeric labels fix the axis index instead. In generative
    /// mode a fixed-0 axis collapses to dimension 1.
    fn template_row(
        &mut self,
        section: &AxesSpec,
        kind: AxisKind,
        id: RowId,
        labels: &mut LabelVars,
        mut proj: Option<&mut ProjCtx>,
        generative: bool,
    ) -> Row {
        let axes = match kind {
            AxisKind::Batch => &section.batch,
            AxisKind::Input => &section.input,
            AxisKind::Output => &section.output,
        };
        let dims = axes
            .iter()
            .map(|axis| match axis {
                AxisLabel::Label(name) => labels
                    .vars
                    .entry(name.clone())
                    .or_insert_with(|| self.row_env.fresh_dim_var(Some(name)))
                    .clone(),
                AxisLabel::Fixed(i) => {
                    if generative && *i == 0 {
                        return Dim::sized(1);
                    }
                    let var = self.row_env.fresh_dim_var(Some("fixed"));
                    if let (Some(ctx), Dim::Var { id, .. }) = (proj.as_deref_mut(), &var) {
                        ctx.fixed.insert(ProjKey::Var(*id), *i);
                    }
                    var
                }
            })
            .collect();
        Row::new(dims, RowTail::Closed, id)
    }
}

#[derive(Default)]
struct LabelVars {
    vars: HashMap<String, Dim>,
}

// =============================================================================
// Projection inference
// =============================================================================

/// A node of the projection union-find: a tagged concrete axis or a dim
/// variable that links axes across operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProjKey {
    Proj(ProjId),
    Var(crate::row::DimVarId),
}

/// Equations extracted from the constraints of one update.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjEquation {
    Eq(ProjKey, ProjKey),
    Iterated(ProjKey),
}

/// Working state of one projection derivation.
#[derive(Default)]
struct ProjCtx {
    ids: IdSource<ProjId>,
    sizes: HashMap<ProjId, usize>,
    labels: HashMap<ProjId, String>,
    fixed: HashMap<ProjKey, i64>,
    iterated: Vec<ProjKey>,
    /// Physical-order (proj, size) lists per role; role 0 is the result.
    roles: Vec<RoleProjs>,
    /// Projection ids in product-space loop order (pre-union, may repeat).
    order: Vec<ProjId>,
}

impl ProjCtx {
    /// Default loop order: the result's physical axes.
    fn order_physical(&mut self) {
        let role = &self.roles[0];
        self.order.extend(role.batch.iter().map(|(p, _)| *p));
        self.order.extend(role.output.iter().map(|(p, _)| *p));
        self.order.extend(role.input.iter().map(|(p, _)| *p));
    }
}

#[derive(Debug, Clone, Default)]
struct RoleProjs {
    batch: Vec<(ProjId, usize)>,
    output: Vec<(ProjId, usize)>,
    input: Vec<(ProjId, usize)>,
}

impl RoleProjs {
    fn kind(&self, kind: AxisKind) -> &Vec<(ProjId, usize)> {
        match kind {
            AxisKind::Batch => &self.batch,
            AxisKind::Output => &self.output,
            AxisKind::Input => &self.input,
        }
    }

    fn kind_mut(&mut self, kind: AxisKind) -> &mut Vec<(ProjId, usize)> {
        match kind {
            AxisKind::Batch => &mut self.batch,
            AxisKind::Output => &mut self.output,
            AxisKind::Input => &mut self.input,
        }
    }
}

/// Dense union-find over projection keys.
#[derive(Debug, Default)]
struct UnionFind {
    parent: Vec<usize>,
    index: HashMap<ProjKey, usize>,
}

impl UnionFind {
    fn node(&mut self, key: ProjKey) -> usize {
        if let Some(&i) = self.index.get(&key) {
            return i;
        }
        let i = self.parent.len();
        self.parent.push(i);
        self.index.insert(key, i);
        i
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: ProjKey, b: ProjKey) {
        let (ra, rb) = (self.node(a), self.node(b));
        let (ra, rb) = (self.find(ra), self.find(rb));
        if ra != rb {
            self.parent[rb] = ra;
        }
    }

    fn class_of(&mut self, key: ProjKey) -> usize {
        let i = self.node(key);
        self.find(i)
    }
}

fn dim_key(d: &Dim) -> Option<ProjKey> {
    match d {
        Dim::Sized { proj: Some(p), .. } => Some(ProjKey::Proj(*p)),
        Dim::Var { id, .. } => Some(ProjKey::Var(*id)),
        Dim::Sized { proj: None, .. } => None,
    }
}

/// Walk the constraints and extract projection equations: every aligned dim
/// pair equates its projections; every tagged axis is iterated.
pub fn get_proj_equations(constraints: &[Constraint], iterated: &[ProjKey]) -> Vec<ProjEquation> {
    fn pair(d1: &Dim, d2: &Dim, out: &mut Vec<ProjEquation>) {
        if let (Some(k1), Some(k2)) = (dim_key(d1), dim_key(d2)) {
            out.push(ProjEquation::Eq(k1, k2));
        }
    }
    fn rows(r1: &Row, r2: &Row, out: &mut Vec<ProjEquation>) {
        let (l1, l2) = (r1.dims.len(), r2.dims.len());
        let aligned = l1.min(l2);
        for i in 0..aligned {
            pair(&r1.dims[l1 - aligned + i], &r2.dims[l2 - aligned + i], out);
        }
    }
    let mut out: Vec<ProjEquation> = iterated.iter().map(|k| ProjEquation::Iterated(*k)).collect();
    for c in constraints {
        match c {
            Constraint::DimEq { d1, d2 } => pair(d1, d2, &mut out),
            Constraint::DimIneq { cur, subr } => pair(cur, subr, &mut out),
            Constraint::RowEq { r1, r2 } => rows(r1, r2, &mut out),
            Constraint::RowIneq { cur, subr } => rows(cur, subr, &mut out),
            Constraint::RowConstr { .. } | Constraint::TerminalDim(_) | Constraint::TerminalRow(_) => {}
        }
    }
    out
}

/// The solved projection environment of one operation instance.
pub struct ProjEnv {
    uf: UnionFind,
    /// Iterator assigned to each product class, keyed by class root.
    iterators: HashMap<usize, Symbol>,
    /// Product dim of each iterated class.
    product_dim: HashMap<usize, usize>,
    /// Classes pinned to a fixed index instead of iterated.
    non_product: HashMap<usize, i64>,
}

impl ProjEnv {
    /// The index an axis contributes: `Fixed(0)` for size-1 axes, the
    /// class's fixed index when pinned, its iterator otherwise.
    pub fn proj_index(&mut self, proj: ProjId, size: usize) -> AxisIndex {
        if size == 1 {
            return AxisIndex::Fixed(0);
        }
        let class = self.uf.class_of(ProjKey::Proj(proj));
        if let Some(at) = self.non_product.get(&class) {
            return AxisIndex::Fixed(*at);
        }
        match self.iterators.get(&class) {
            Some(sym) => AxisIndex::Iter(*sym),
            // A size>1 axis nobody iterates: pinned to its first entry.
            None => AxisIndex::Fixed(0),
        }
    }
}

/// Solve the projection equations with a union-find: equated projections
/// share a class, classes with a concrete index become non-product, the
/// rest receive a fresh iterator and a product dimension.
fn solve_proj_equations(equations: &[ProjEquation], ctx: &ProjCtx) -> Result<ProjEnv> {
    let mut uf = UnionFind::default();
    for eq in equations {
        match eq {
            ProjEquation::Eq(a, b) => uf.union(*a, *b),
            ProjEquation::Iterated(k) => {
                uf.node(*k);
            }
        }
    }

    // Per-class facts: the effective dim (conflicting non-1 sizes are a
    // shape error) and the fixed index, if any.
    let mut class_dim: HashMap<usize, usize> = HashMap::new();
    for (p, size) in &ctx.sizes {
        let class = uf.class_of(ProjKey::Proj(*p));
        let entry = class_dim.entry(class).or_insert(1);
        if *size != 1 {
            if *entry != 1 && *entry != *size {
                bail_shape!(
                    "projection class mixes dimensions {} and {} (projection {})",
                    entry,
                    size,
                    p
                );
            }
            *entry = *size;
        }
    }
    let mut non_product: HashMap<usize, i64> = HashMap::new();
    for (key, at) in &ctx.fixed {
        let class = uf.class_of(*key);
        if let Some(prev) = non_product.insert(class, *at) {
            if prev != *at {
                bail_shape!("projection class pinned to both index {} and {}", prev, at);
            }
        }
        if let Some(dim) = class_dim.get(&class) {
            if *at < 0 || *at >= *dim as i64 {
                bail_shape!("fixed index {} out of range for dimension {}", at, dim);
            }
        }
    }

    Ok(ProjEnv {
        uf,
        iterators: HashMap::new(),
        product_dim: class_dim,
        non_product,
    })
}

impl ShapeEnv {
    /// Derive the iteration space and index functions of one operation
    /// instance. Shapes must be finished.
    pub fn derive_projections(&mut self, update: &UpdateStep) -> Result<Projections> {
        let mut ctx = ProjCtx::default();
        let constraints = self.constraints_for(update, Some(&mut ctx))?;
        let equations = get_proj_equations(&constraints, &ctx.iterated);
        let mut env = solve_proj_equations(&equations, &ctx)?;

        // Assign iterators to product classes in loop order.
        let mut product_space = vec![];
        let mut product_iterators = vec![];
        let mut seen = std::collections::HashSet::new();
        for p in &ctx.order {
            let class = env.uf.class_of(ProjKey::Proj(*p));
            if !seen.insert(class) || env.non_product.contains_key(&class) {
                continue;
            }
            let dim = env.product_dim.get(&class).copied().unwrap_or(1);
            if dim == 1 {
                continue;
            }
            let sym = match ctx.labels.get(p) {
                Some(l) => fresh_labeled_symbol(l),
                None => fresh_labeled_symbol(&format!("{}", p)),
            };
            env.iterators.insert(class, sym);
            product_space.push(dim);
            product_iterators.push(sym);
        }

        let result = &ctx.roles[0];
        let lhs: Vec<AxisIndex> = PHYSICAL_KINDS
            .iter()
            .flat_map(|k| result.kind(*k).iter().map(|(p, s)| env.proj_index(*p, *s)).collect::<Vec<_>>())
            .collect();
        let result_lens: HashMap<AxisKind, usize> =
            PHYSICAL_KINDS.iter().map(|k| (*k, result.kind(*k).len())).collect();

        let mut rhs = vec![];
        for role in &ctx.roles[1..] {
            let mut idcs = vec![];
            for k in PHYSICAL_KINDS {
                let own = role.kind(k);
                let pad = result_lens[&k].saturating_sub(own.len());
                idcs.extend(std::iter::repeat(AxisIndex::Fixed(0)).take(pad));
                idcs.extend(own.iter().map(|(p, s)| env.proj_index(*p, *s)));
            }
            rhs.push(idcs);
        }

        let debug_label = self.shape(update.shape).debug_label.clone();
        let projections = Projections {
            product_space,
            product_iterators,
            lhs,
            rhs,
            debug_label,
        };
        debug!("projections {:?}", projections);
        Ok(projections)
    }
}
