//! Usage analysis over the loop IR.
//!
//! One pass enumerates the concrete access patterns of every array by
//! unrolling traced loops up to a bound, then derives per-array facts:
//! which positions are assigned, how often each position is read, whether a
//! read precedes any write at the same position within the update
//! (recurrence), and whether the array is only ever read.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use log::debug;
use serde::Serialize;

use crate::array::{ArrayId, ArrayRegistry};
use crate::error::Result;
use crate::indexing::{AxisIndex, Symbol};
use crate::llir::{Expr, Stmt};
use crate::memory::{HostedKind, MemoryMode};
use crate::{bail_analysis, err_analysis, OptimizeSettings};

/// Provenance codes stamped when tracing forces an array non-virtual.
pub const PROV_MAX_VISITS: u8 = 136;
pub const PROV_RECURRENT: u8 = 137;

// =============================================================================
// Traced records
// =============================================================================

/// How often one position of an array was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visits {
    Visits(usize),
    /// Read before any write at that position within the current update.
    Recurrent,
}

/// Everything the analysis learned about one array.
#[derive(Debug, Clone, Default)]
pub struct TracedArray {
    /// The accepted defining fragments, with their canonical write index
    /// tuple. Appended by the inliner in program order.
    pub computations: Vec<(Option<Vec<AxisIndex>>, Stmt)>,
    /// Concrete index vectors that were assigned.
    pub assignments: HashSet<Vec<i64>>,
    /// Concrete index vectors that were read, with their visit counts.
    pub accesses: HashMap<Vec<i64>, Visits>,
    /// The first mention was a zero-fill.
    pub zero_initialized: bool,
    /// Some zero-fill exists.
    pub zeroed_out: bool,
    pub read_before_write: bool,
    pub read_only: bool,
}

impl TracedArray {
    pub fn max_visits(&self) -> usize {
        self.accesses
            .values()
            .map(|v| match v {
                Visits::Visits(n) => *n,
                Visits::Recurrent => 0,
            })
            .max()
            .unwrap_or(0)
    }

    pub fn has_recurrence(&self) -> bool {
        self.accesses.values().any(|v| matches!(v, Visits::Recurrent))
    }
}

/// The per-array analysis table of one optimization run.
#[derive(Debug, Default)]
pub struct TracedStore {
    arrays: IndexMap<ArrayId, TracedArray>,
    /// Each for-loop iterator belongs to the single array whose writes it
    /// indexes.
    pub loop_to_array: HashMap<Symbol, ArrayId>,
}

impl TracedStore {
    pub fn get(&self, id: ArrayId) -> Option<&TracedArray> {
        self.arrays.get(&id)
    }

    pub fn get_mut(&mut self, id: ArrayId) -> &mut TracedArray {
        self.arrays.entry(id).or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ArrayId, &TracedArray)> {
        self.arrays.iter()
    }

    pub fn read_only(&self, id: ArrayId) -> bool {
        self.get(id).map(|t| t.read_only).unwrap_or(false)
    }

    /// Summaries for external tooling.
    pub fn report(&self, registry: &ArrayRegistry) -> Vec<ArrayReport> {
        self.arrays
            .iter()
            .map(|(id, t)| {
                let decl = registry.get(*id);
                ArrayReport {
                    label: decl.label.clone(),
                    dims: decl.dims.clone(),
                    mode: decl.mode().map(|m| m.to_string()),
                    provenance: decl.mode_provenance(),
                    zero_initialized: t.zero_initialized,
                    read_only: t.read_only,
                    read_before_write: t.read_before_write,
                }
            })
            .collect()
    }
}

/// What the backend needs to know per array.
#[derive(Debug, Clone, Serialize)]
pub struct ArrayReport {
    pub label: String,
    pub dims: Vec<usize>,
    pub mode: Option<String>,
    pub provenance: Option<u8>,
    pub zero_initialized: bool,
    pub read_only: bool,
    pub read_before_write: bool,
}

// =============================================================================
// The walk
// =============================================================================

/// Trace a program: populate a fresh store and force memory modes where the
/// facts demand it.
pub fn visit_program(
    settings: &OptimizeSettings,
    arrays: &mut ArrayRegistry,
    body: &Stmt,
) -> Result<TracedStore> {
    let mut tracer = Tracer {
        settings,
        store: TracedStore::default(),
        env: HashMap::new(),
    };
    tracer.stmt(body)?;
    let mut store = tracer.store;

    let ids: Vec<ArrayId> = store.arrays.keys().copied().collect();
    for id in ids {
        let traced = store.arrays.get_mut(&id).expect("traced record");
        traced.read_only = traced.assignments.is_empty() && !traced.zeroed_out;
        let recurrent = traced.has_recurrence();
        if recurrent {
            traced.read_before_write = true;
        }
        let visits = traced.max_visits();
        let decl = arrays.get_mut(id);
        if visits > settings.max_visits {
            debug!(
                "array {} ({}): {} visits exceed the bound {}",
                id, decl.label, visits, settings.max_visits
            );
            decl.force_mode(MemoryMode::Materialized, PROV_MAX_VISITS)?;
        }
        if recurrent {
            // A recurrent array cannot be recomputed scalar-wise and its
            // previous state must survive between updates.
            decl.force_mode(MemoryMode::Hosted(HostedKind::Changed), PROV_RECURRENT)?;
        }
    }
    Ok(store)
}

struct Tracer<'a> {
    settings: &'a OptimizeSettings,
    store: TracedStore,
    /// Concrete value of each bound iterator.
    env: HashMap<Symbol, i64>,
}

impl Tracer<'_> {
    fn stmt(&mut self, s: &Stmt) -> Result<()> {
        match s {
            Stmt::Noop | Stmt::Comment(_) | Stmt::StagedCallback { .. } => Ok(()),
            Stmt::Seq(items) => {
                for item in items {
                    self.stmt(item)?;
                }
                Ok(())
            }
            Stmt::For {
                index,
                from,
                to,
                body,
                trace_it,
            } => {
                if *trace_it {
                    let extent = (to - from + 1).max(0);
                    let bound = extent.min(self.settings.max_tracing_dim as i64);
                    for at in *from..*from + bound {
                        self.env.insert(*index, at);
                        self.stmt(body)?;
                    }
                } else {
                    // Untraced: one symbolic pass at the starting value.
                    self.env.insert(*index, *from);
                    self.stmt(body)?;
                }
                self.env.remove(index);
                Ok(())
            }
            Stmt::ZeroOut(a) => {
                let rec = self.store.get_mut(*a);
                if rec.assignments.is_empty() && rec.accesses.is_empty() {
                    rec.zero_initialized = true;
                }
                rec.zeroed_out = true;
                Ok(())
            }
            Stmt::Set { array, idcs, value } => {
                self.expr(value)?;
                let at = self.resolve(idcs)?;
                self.store.get_mut(*array).assignments.insert(at);
                for idx in idcs {
                    if let AxisIndex::Iter(sym) = idx {
                        match self.store.loop_to_array.insert(*sym, *array) {
                            Some(prev) if prev != *array => bail_analysis!(
                                "arrays {} and {} write through the same loop iterator {}",
                                prev,
                                array,
                                sym
                            ),
                            _ => {}
                        }
                    }
                }
                Ok(())
            }
            Stmt::SetLocal(_, value) => self.expr(value),
        }
    }

    fn expr(&mut self, e: &Expr) -> Result<()> {
        match e {
            Expr::Const(_) | Expr::GetLocal(_) | Expr::GetGlobal { .. } | Expr::EmbedIndex(_) => Ok(()),
            Expr::Get(a, idcs) => {
                let at = self.resolve(idcs)?;
                let rec = self.store.get_mut(*a);
                let fresh = !rec.assignments.contains(&at) && !rec.zeroed_out;
                let entry = rec.accesses.entry(at).or_insert(Visits::Visits(0));
                *entry = match (*entry, fresh) {
                    (_, true) => Visits::Recurrent,
                    (Visits::Recurrent, _) => Visits::Recurrent,
                    (Visits::Visits(n), false) => Visits::Visits(n + 1),
                };
                Ok(())
            }
            Expr::Binop(_, l, r) => {
                self.expr(l)?;
                self.expr(r)
            }
            Expr::Unop(_, x) => self.expr(x),
            Expr::LocalScope { body, .. } => self.stmt(body),
        }
    }

    fn resolve(&self, idcs: &[AxisIndex]) -> Result<Vec<i64>> {
        idcs.iter()
            .map(|idx| match idx {
                AxisIndex::Fixed(i) => Ok(*i),
                AxisIndex::Iter(sym) => self
                    .env
                    .get(sym)
                    .copied()
                    .ok_or_else(|| err_analysis!("iterator {} read outside its loop", sym)),
            })
            .collect()
    }
}
