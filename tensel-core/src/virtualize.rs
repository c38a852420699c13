//! Virtual-array inlining and the cleanup pass.
//!
//! An array is virtual when it is never materialized: every read of it is
//! replaced by a local scope replaying its defining computation as scalars.
//! The pass walks the program in order, records each array's defining
//! fragments (acceptance-checked), and rewrites eligible reads into
//! `LocalScope` expressions. Cleanup then removes the dead writes of the
//! arrays that stayed virtual and reverts the scopes of arrays that did
//! not.
//!
//! Every rejection stamps a numeric provenance code on the array's memory
//! mode so the responsible check can be found from a log line.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::array::{ArrayId, ArrayRegistry};
use crate::error::Result;
use crate::indexing::{fresh_symbol, AxisIndex, Symbol};
use crate::llir::{fresh_scope_id, Expr, ScopeId, Stmt};
use crate::memory::MemoryMode;
use crate::trace::TracedStore;
use crate::{bail_analysis, bail_virtual};

/// Provenance codes for virtualization rejections.
pub const PROV_MULTI_IDCS: u8 = 130;
pub const PROV_NON_LINEAR: u8 = 131;
pub const PROV_ESCAPING: u8 = 132;
pub const PROV_UNTRACED: u8 = 133;
pub const PROV_STAGED: u8 = 134;
pub const PROV_INLINE_MISMATCH: u8 = 135;
/// Stamped when an array survives every check and becomes virtual.
pub const PROV_CONFIRMED: u8 = 139;
/// A read of a dead virtual array found during cleanup.
pub const PROV_DEAD_READ: u8 = 140;

#[derive(Debug, Clone, Copy, Default)]
pub struct VirtualizeStats {
    pub inlined_reads: u32,
    pub rejections: u32,
    pub confirmed_virtual: u32,
    pub removed_writes: u32,
}

// =============================================================================
// Virtualization
// =============================================================================

/// Rewrite reads of eligible arrays into replayed scalar computations.
pub fn virtual_program(
    arrays: &mut ArrayRegistry,
    store: &mut TracedStore,
    body: Stmt,
) -> Result<(Stmt, VirtualizeStats)> {
    let mut v = Virtualizer {
        arrays: &mut *arrays,
        store: &mut *store,
        stats: VirtualizeStats::default(),
        process_for: HashSet::new(),
    };
    let out = v.stmt(body)?;
    let mut stats = v.stats;
    // Arrays that kept their candidacy and have accepted computations are
    // now virtual; their writes fall to cleanup.
    let with_computations: Vec<ArrayId> = store
        .iter()
        .filter(|(_, t)| !t.computations.is_empty() && !t.read_only)
        .map(|(id, _)| *id)
        .collect();
    for id in with_computations {
        let decl = arrays.get_mut(id);
        if decl.virtual_candidate() {
            decl.confirm_virtual(PROV_CONFIRMED);
            stats.confirmed_virtual += 1;
        }
    }
    debug!(
        "virtualize: {} reads inlined, {} rejections, {} arrays virtual",
        stats.inlined_reads, stats.rejections, stats.confirmed_virtual
    );
    Ok((out, stats))
}

struct Virtualizer<'a> {
    arrays: &'a mut ArrayRegistry,
    store: &'a mut TracedStore,
    stats: VirtualizeStats,
    /// Arrays whose defining loop nest we are currently inside.
    process_for: HashSet<ArrayId>,
}

/// Replay state of one inline site.
struct Replay {
    array: ArrayId,
    scope: ScopeId,
    canonical: Option<Vec<AxisIndex>>,
    /// Old iterator -> index at the call site (or a fresh loop iterator).
    subst: HashMap<Symbol, AxisIndex>,
    /// Scope ids minted afresh so each replay stays single-use.
    scopes: HashMap<ScopeId, ScopeId>,
}

impl Virtualizer<'_> {
    fn stmt(&mut self, s: Stmt) -> Result<Stmt> {
        match s {
            Stmt::Noop | Stmt::Comment(_) | Stmt::StagedCallback { .. } => Ok(s),
            Stmt::Seq(items) => {
                let out: Result<Vec<Stmt>> = items.into_iter().map(|i| self.stmt(i)).collect();
                Ok(Stmt::Seq(out?))
            }
            Stmt::For {
                index,
                from,
                to,
                body,
                trace_it,
            } => {
                let owner = self.store.loop_to_array.get(&index).copied();
                match owner {
                    Some(a) if !self.process_for.contains(&a) => {
                        self.process_for.insert(a);
                        let new_body = self.stmt(*body);
                        self.process_for.remove(&a);
                        let rebuilt = Stmt::For {
                            index,
                            from,
                            to,
                            body: Box::new(new_body?),
                            trace_it,
                        };
                        if self.arrays.get(a).virtual_candidate() {
                            if let Err(code) = self.process_computation(a, &rebuilt) {
                                self.reject(a, code)?;
                            }
                        }
                        Ok(rebuilt)
                    }
                    _ => {
                        let new_body = self.stmt(*body)?;
                        Ok(Stmt::For {
                            index,
                            from,
                            to,
                            body: Box::new(new_body),
                            trace_it,
                        })
                    }
                }
            }
            Stmt::ZeroOut(a) => {
                if !self.process_for.contains(&a) && self.arrays.get(a).virtual_candidate() {
                    if let Err(code) = self.process_computation(a, &Stmt::ZeroOut(a)) {
                        self.reject(a, code)?;
                    }
                }
                Ok(Stmt::ZeroOut(a))
            }
            Stmt::Set { array, idcs, value } => {
                let value = self.expr(value)?;
                let scalar_write = idcs.iter().all(|i| i.iterator().is_none());
                let rebuilt = Stmt::Set { array, idcs, value };
                if scalar_write
                    && !self.process_for.contains(&array)
                    && self.arrays.get(array).virtual_candidate()
                {
                    if let Err(code) = self.process_computation(array, &rebuilt) {
                        self.reject(array, code)?;
                    }
                }
                Ok(rebuilt)
            }
            Stmt::SetLocal(id, value) => Ok(Stmt::SetLocal(id, self.expr(value)?)),
        }
    }

    fn expr(&mut self, e: Expr) -> Result<Expr> {
        match e {
            Expr::Const(_) | Expr::GetLocal(_) | Expr::GetGlobal { .. } | Expr::EmbedIndex(_) => Ok(e),
            Expr::Get(a, idcs) => {
                if self.eligible(a) {
                    if let Some(inlined) = self.inline(a, &idcs)? {
                        self.stats.inlined_reads += 1;
                        return Ok(inlined);
                    }
                }
                Ok(Expr::Get(a, idcs))
            }
            Expr::Binop(op, l, r) => Ok(Expr::Binop(op, Box::new(self.expr(*l)?), Box::new(self.expr(*r)?))),
            Expr::Unop(op, x) => Ok(Expr::Unop(op, Box::new(self.expr(*x)?))),
            Expr::LocalScope {
                id,
                prec,
                body,
                orig_indices,
            } => Ok(Expr::LocalScope {
                id,
                prec,
                body: Box::new(self.stmt(*body)?),
                orig_indices,
            }),
        }
    }

    fn eligible(&self, a: ArrayId) -> bool {
        self.arrays.get(a).virtual_candidate()
            && self
                .store
                .get(a)
                .map_or(false, |t| !t.computations.is_empty() && !t.read_only)
    }

    fn reject(&mut self, a: ArrayId, code: u8) -> Result<()> {
        self.stats.rejections += 1;
        debug!("array {}: not virtual [provenance {}]", a, code);
        self.arrays.get_mut(a).force_mode(MemoryMode::Materialized, code)
    }

    // -------------------------------------------------------------------------
    // Acceptance
    // -------------------------------------------------------------------------

    /// Check one defining fragment of `a` and record it. The error value is
    /// the provenance code of the failed check.
    fn process_computation(&mut self, a: ArrayId, fragment: &Stmt) -> std::result::Result<(), u8> {
        let mut canonical: Option<Vec<AxisIndex>> = None;
        collect_writes(a, fragment, &mut canonical)?;
        if let Some(traced) = self.store.get(a) {
            for (prev, _) in &traced.computations {
                if let (Some(prev), Some(cur)) = (prev.as_ref(), canonical.as_ref()) {
                    if prev != cur {
                        return Err(PROV_MULTI_IDCS);
                    }
                }
            }
        }
        let params: HashSet<Symbol> = canonical
            .iter()
            .flatten()
            .filter_map(AxisIndex::iterator)
            .collect();
        if let Some(canon) = &canonical {
            let iters: Vec<Symbol> = canon.iter().filter_map(AxisIndex::iterator).collect();
            if iters.len() != params.len() {
                return Err(PROV_NON_LINEAR);
            }
        }
        let mut bound = vec![];
        check_scoped(fragment, &mut bound, &params)?;
        self.store.get_mut(a).computations.push((canonical, fragment.clone()));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Inlining
    // -------------------------------------------------------------------------

    /// Replace a read of `a` with a local scope replaying its computations.
    /// Returns `None` (after stamping the mode) when the call-site indices
    /// cannot be unified with the canonical tuple.
    fn inline(&mut self, a: ArrayId, call_idcs: &[AxisIndex]) -> Result<Option<Expr>> {
        let computations = self
            .store
            .get(a)
            .map(|t| t.computations.clone())
            .unwrap_or_default();
        let canonical = computations.iter().find_map(|(c, _)| c.clone());
        let mut subst = HashMap::new();
        if let Some(canon) = &canonical {
            if canon.len() != call_idcs.len() {
                self.reject(a, PROV_INLINE_MISMATCH)?;
                return Ok(None);
            }
            for (c, call) in canon.iter().zip(call_idcs.iter()) {
                match (c, call) {
                    (AxisIndex::Iter(s), idx) => {
                        subst.insert(*s, *idx);
                    }
                    (AxisIndex::Fixed(k), AxisIndex::Fixed(m)) if k == m => {}
                    _ => {
                        self.reject(a, PROV_INLINE_MISMATCH)?;
                        return Ok(None);
                    }
                }
            }
        }
        let scope = fresh_scope_id(a);
        let prec = self.arrays.get(a).prec;
        let mut replay = Replay {
            array: a,
            scope,
            canonical,
            subst,
            scopes: HashMap::new(),
        };
        let mut body = Vec::with_capacity(computations.len());
        for (_, comp) in &computations {
            body.push(self.replay_stmt(&mut replay, comp)?);
        }
        Ok(Some(Expr::LocalScope {
            id: scope,
            prec,
            body: Box::new(Stmt::seq(body)),
            orig_indices: call_idcs.to_vec(),
        }))
    }

    fn replay_stmt(&mut self, replay: &mut Replay, s: &Stmt) -> Result<Stmt> {
        match s {
            Stmt::Noop | Stmt::Comment(_) => Ok(s.clone()),
            Stmt::StagedCallback { name } => {
                bail_virtual!(PROV_STAGED, "staged callback '{}' in an accepted computation", name)
            }
            Stmt::Seq(items) => {
                let out: Result<Vec<Stmt>> = items.iter().map(|i| self.replay_stmt(replay, i)).collect();
                Ok(Stmt::Seq(out?))
            }
            Stmt::For {
                index,
                from,
                to,
                body,
                trace_it,
            } => {
                // A loop over a canonical iterator is pinned by the call
                // site: the index is already substituted, the loop
                // disappears. Other loops (reductions) stay, with fresh
                // symbols to avoid capture across inline sites.
                if replay.subst.contains_key(index) {
                    return self.replay_stmt(replay, body);
                }
                let fresh = fresh_symbol();
                replay.subst.insert(*index, AxisIndex::Iter(fresh));
                let new_body = self.replay_stmt(replay, body);
                replay.subst.remove(index);
                Ok(Stmt::For {
                    index: fresh,
                    from: *from,
                    to: *to,
                    body: Box::new(new_body?),
                    trace_it: *trace_it,
                })
            }
            Stmt::ZeroOut(x) if *x == replay.array => {
                Ok(Stmt::SetLocal(replay.scope, Expr::Const(0.0)))
            }
            Stmt::ZeroOut(x) => Ok(Stmt::ZeroOut(*x)),
            Stmt::Set { array, idcs, value } if *array == replay.array => {
                if replay.canonical.as_deref() != Some(idcs.as_slice()) {
                    bail_virtual!(
                        PROV_MULTI_IDCS,
                        "write to {} departs from its canonical index tuple",
                        array
                    );
                }
                let value = self.replay_expr(replay, value)?;
                Ok(Stmt::SetLocal(replay.scope, value))
            }
            Stmt::Set { array, idcs, value } => {
                let idcs = subst_idcs(&replay.subst, idcs);
                let value = self.replay_expr(replay, value)?;
                Ok(Stmt::Set {
                    array: *array,
                    idcs,
                    value,
                })
            }
            Stmt::SetLocal(sid, value) => {
                let sid = replay.scopes.get(sid).copied().unwrap_or(*sid);
                let value = self.replay_expr(replay, value)?;
                Ok(Stmt::SetLocal(sid, value))
            }
        }
    }

    fn replay_expr(&mut self, replay: &mut Replay, e: &Expr) -> Result<Expr> {
        match e {
            Expr::Const(_) => Ok(e.clone()),
            Expr::Get(x, idcs) if *x == replay.array => {
                if replay.canonical.as_deref() != Some(idcs.as_slice()) {
                    bail_virtual!(
                        PROV_MULTI_IDCS,
                        "read of {} inside its own computation departs from the canonical tuple",
                        x
                    );
                }
                Ok(Expr::GetLocal(replay.scope))
            }
            Expr::Get(x, idcs) => {
                let idcs = subst_idcs(&replay.subst, idcs);
                if self.eligible(*x) {
                    if let Some(inlined) = self.inline(*x, &idcs)? {
                        self.stats.inlined_reads += 1;
                        return Ok(inlined);
                    }
                }
                Ok(Expr::Get(*x, idcs))
            }
            Expr::GetLocal(sid) => Ok(Expr::GetLocal(replay.scopes.get(sid).copied().unwrap_or(*sid))),
            Expr::GetGlobal { ident, idcs } => Ok(Expr::GetGlobal {
                ident: ident.clone(),
                idcs: idcs.as_ref().map(|i| subst_idcs(&replay.subst, i)),
            }),
            Expr::EmbedIndex(idx) => Ok(Expr::EmbedIndex(subst_idx(&replay.subst, idx))),
            Expr::Binop(op, l, r) => Ok(Expr::Binop(
                *op,
                Box::new(self.replay_expr(replay, l)?),
                Box::new(self.replay_expr(replay, r)?),
            )),
            Expr::Unop(op, x) => Ok(Expr::Unop(*op, Box::new(self.replay_expr(replay, x)?))),
            Expr::LocalScope {
                id,
                prec,
                body,
                orig_indices,
            } => {
                let fresh = fresh_scope_id(id.array);
                replay.scopes.insert(*id, fresh);
                let new_body = self.replay_stmt(replay, body)?;
                Ok(Expr::LocalScope {
                    id: fresh,
                    prec: *prec,
                    body: Box::new(new_body),
                    orig_indices: subst_idcs(&replay.subst, orig_indices),
                })
            }
        }
    }
}

fn subst_idx(subst: &HashMap<Symbol, AxisIndex>, idx: &AxisIndex) -> AxisIndex {
    match idx {
        AxisIndex::Iter(s) => subst.get(s).copied().unwrap_or(*idx),
        AxisIndex::Fixed(_) => *idx,
    }
}

fn subst_idcs(subst: &HashMap<Symbol, AxisIndex>, idcs: &[AxisIndex]) -> Vec<AxisIndex> {
    idcs.iter().map(|i| subst_idx(subst, i)).collect()
}

/// Collect the canonical write tuple of `a` within a fragment, rejecting
/// untraced loops, staged callbacks, and diverging write tuples.
fn collect_writes(
    a: ArrayId,
    s: &Stmt,
    canonical: &mut Option<Vec<AxisIndex>>,
) -> std::result::Result<(), u8> {
    match s {
        Stmt::Noop | Stmt::Comment(_) | Stmt::ZeroOut(_) | Stmt::SetLocal(..) => Ok(()),
        Stmt::StagedCallback { .. } => Err(PROV_STAGED),
        Stmt::Seq(items) => items.iter().try_for_each(|i| collect_writes(a, i, canonical)),
        Stmt::For { body, trace_it, .. } => {
            if !trace_it {
                return Err(PROV_UNTRACED);
            }
            collect_writes(a, body, canonical)
        }
        Stmt::Set { array, idcs, .. } => {
            if *array == a {
                match canonical {
                    Some(c) if c != idcs => return Err(PROV_MULTI_IDCS),
                    Some(_) => {}
                    None => *canonical = Some(idcs.clone()),
                }
            }
            Ok(())
        }
    }
}

/// Every iterator used anywhere in the fragment must be bound by an
/// enclosing `For` inside it, or be one of the canonical parameters.
fn check_scoped(
    s: &Stmt,
    bound: &mut Vec<Symbol>,
    params: &HashSet<Symbol>,
) -> std::result::Result<(), u8> {
    let check_idcs = |idcs: &[AxisIndex], bound: &Vec<Symbol>| {
        for idx in idcs {
            if let AxisIndex::Iter(sym) = idx {
                if !bound.contains(sym) && !params.contains(sym) {
                    return Err(PROV_ESCAPING);
                }
            }
        }
        Ok(())
    };
    fn check_expr(
        e: &Expr,
        bound: &mut Vec<Symbol>,
        params: &HashSet<Symbol>,
        check_idcs: &impl Fn(&[AxisIndex], &Vec<Symbol>) -> std::result::Result<(), u8>,
    ) -> std::result::Result<(), u8> {
        match e {
            Expr::Const(_) | Expr::GetLocal(_) => Ok(()),
            Expr::Get(_, idcs) => check_idcs(idcs, bound),
            Expr::GetGlobal { idcs, .. } => match idcs {
                Some(idcs) => check_idcs(idcs, bound),
                None => Ok(()),
            },
            Expr::EmbedIndex(idx) => check_idcs(std::slice::from_ref(idx), bound),
            Expr::Binop(_, l, r) => {
                check_expr(l, bound, params, check_idcs)?;
                check_expr(r, bound, params, check_idcs)
            }
            Expr::Unop(_, x) => check_expr(x, bound, params, check_idcs),
            Expr::LocalScope { body, .. } => check_scoped_inner(body, bound, params, check_idcs),
        }
    }
    fn check_scoped_inner(
        s: &Stmt,
        bound: &mut Vec<Symbol>,
        params: &HashSet<Symbol>,
        check_idcs: &impl Fn(&[AxisIndex], &Vec<Symbol>) -> std::result::Result<(), u8>,
    ) -> std::result::Result<(), u8> {
        match s {
            Stmt::Noop | Stmt::Comment(_) | Stmt::ZeroOut(_) | Stmt::StagedCallback { .. } => Ok(()),
            Stmt::Seq(items) => items
                .iter()
                .try_for_each(|i| check_scoped_inner(i, bound, params, check_idcs)),
            Stmt::For { index, body, .. } => {
                bound.push(*index);
                let r = check_scoped_inner(body, bound, params, check_idcs);
                bound.pop();
                r
            }
            Stmt::Set { idcs, value, .. } => {
                check_idcs(idcs, bound)?;
                check_expr(value, bound, params, check_idcs)
            }
            Stmt::SetLocal(_, value) => check_expr(value, bound, params, check_idcs),
        }
    }
    check_scoped_inner(s, bound, params, &check_idcs)
}

// =============================================================================
// Cleanup
// =============================================================================

/// Remove the writes of arrays that became virtual, revert the scopes of
/// arrays that did not, and verify no read of a virtual array survives.
pub fn cleanup_virtual(arrays: &ArrayRegistry, body: Stmt) -> Result<(Stmt, u32)> {
    let mut cleanup = Cleanup {
        arrays,
        bound: vec![],
        removed: 0,
    };
    let out = cleanup.stmt(body)?;
    debug!("cleanup: {} dead writes removed", cleanup.removed);
    Ok((out, cleanup.removed))
}

struct Cleanup<'a> {
    arrays: &'a ArrayRegistry,
    bound: Vec<Symbol>,
    removed: u32,
}

impl Cleanup<'_> {
    fn is_virtual(&self, a: ArrayId) -> bool {
        matches!(self.arrays.get(a).mode(), Some(MemoryMode::Virtual))
    }

    fn check_idcs(&self, idcs: &[AxisIndex]) -> Result<()> {
        for idx in idcs {
            if let AxisIndex::Iter(sym) = idx {
                if !self.bound.contains(sym) {
                    bail_analysis!("iterator {} is out of scope after cleanup", sym);
                }
            }
        }
        Ok(())
    }

    fn stmt(&mut self, s: Stmt) -> Result<Stmt> {
        match s {
            Stmt::Noop | Stmt::Comment(_) | Stmt::StagedCallback { .. } => Ok(s),
            Stmt::Seq(items) => {
                let out: Result<Vec<Stmt>> = items.into_iter().map(|i| self.stmt(i)).collect();
                Ok(Stmt::seq(out?))
            }
            Stmt::For {
                index,
                from,
                to,
                body,
                trace_it,
            } => {
                self.bound.push(index);
                let new_body = self.stmt(*body);
                self.bound.pop();
                let new_body = new_body?;
                if matches!(new_body, Stmt::Noop) {
                    return Ok(Stmt::Noop);
                }
                Ok(Stmt::For {
                    index,
                    from,
                    to,
                    body: Box::new(new_body),
                    trace_it,
                })
            }
            Stmt::ZeroOut(a) => {
                if self.is_virtual(a) {
                    self.removed += 1;
                    Ok(Stmt::Noop)
                } else {
                    Ok(Stmt::ZeroOut(a))
                }
            }
            Stmt::Set { array, idcs, value } => {
                if self.is_virtual(array) {
                    self.removed += 1;
                    return Ok(Stmt::Noop);
                }
                self.check_idcs(&idcs)?;
                Ok(Stmt::Set {
                    array,
                    idcs,
                    value: self.expr(value)?,
                })
            }
            Stmt::SetLocal(id, value) => Ok(Stmt::SetLocal(id, self.expr(value)?)),
        }
    }

    fn expr(&mut self, e: Expr) -> Result<Expr> {
        match e {
            Expr::Const(_) | Expr::GetLocal(_) | Expr::GetGlobal { .. } => Ok(e),
            Expr::EmbedIndex(idx) => {
                self.check_idcs(std::slice::from_ref(&idx))?;
                Ok(Expr::EmbedIndex(idx))
            }
            Expr::Get(a, idcs) => {
                if self.is_virtual(a) {
                    bail_virtual!(
                        PROV_DEAD_READ,
                        "read of virtual array {} survived virtualization",
                        a
                    );
                }
                self.check_idcs(&idcs)?;
                Ok(Expr::Get(a, idcs))
            }
            Expr::Binop(op, l, r) => Ok(Expr::Binop(op, Box::new(self.expr(*l)?), Box::new(self.expr(*r)?))),
            Expr::Unop(op, x) => Ok(Expr::Unop(op, Box::new(self.expr(*x)?))),
            Expr::LocalScope {
                id,
                prec,
                body,
                orig_indices,
            } => {
                if self.is_virtual(id.array) {
                    Ok(Expr::LocalScope {
                        id,
                        prec,
                        body: Box::new(self.stmt(*body)?),
                        orig_indices,
                    })
                } else {
                    // The source array stayed materialized: the scope is
                    // redundant, read the array itself again.
                    self.expr(Expr::Get(id.array, orig_indices))
                }
            }
        }
    }
}
