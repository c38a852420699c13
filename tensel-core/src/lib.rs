//! Middle-end compiler for array computations.
//!
//! The input is an assignment-style tensor program (typically a forward +
//! backward pass) whose shapes are resolved by row-polymorphic inference;
//! the output is an optimized loop IR plus a per-array analysis table, both
//! consumed by the C and CUDA text emitters downstream.
//!
//! The pipeline uses a typestate pattern: each struct represents a stage,
//! methods consume `self` and return the next stage, enforcing the pass
//! order trace -> virtualize -> cleanup -> simplify:
//!
//!   let optimized = proc.trace(settings)?
//!       .virtualize()?
//!       .cleanup()?
//!       .simplify();
//!
//! or equivalently `optimize(settings, proc)`. `compile` additionally
//! finalizes memory modes and computes the storage classes the backends
//! allocate from.

pub mod array;
pub mod assignments;
pub mod diags;
pub mod einsum;
pub mod error;
pub mod indexing;
pub mod llir;
pub mod memory;
pub mod row;
pub mod shape;
pub mod simplify;
pub mod trace;
pub mod virtualize;

#[cfg(test)]
mod shape_tests;

#[cfg(test)]
mod trace_tests;

#[cfg(test)]
mod virtualize_tests;

#[cfg(test)]
mod simplify_tests;


use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::marker::PhantomData;

use indexmap::IndexMap;

use array::{ArrayId, ArrayRegistry};
use error::Result;
use indexing::{AxisIndex, Symbol};
use llir::{Expr, Stmt};
use memory::{storage_class, GpuMode, HostedKind, MemoryMode, ParallelIndexing, StorageClass};
use trace::TracedStore;
use virtualize::VirtualizeStats;

// =============================================================================
// Generic ID allocation
// =============================================================================

/// Generic counter for generating unique IDs.
///
/// The ID type must implement `From<u32>` to convert the raw counter value.
#[derive(Debug, Clone)]
pub struct IdSource<Id> {
    next_id: u32,
    _phantom: PhantomData<Id>,
}

impl<Id: From<u32>> IdSource<Id> {
    pub fn new() -> Self {
        IdSource {
            next_id: 0,
            _phantom: PhantomData,
        }
    }

    pub fn next_id(&mut self) -> Id {
        let id = Id::from(self.next_id);
        self.next_id += 1;
        id
    }
}

impl<Id: From<u32>> Default for IdSource<Id> {
    fn default() -> Self {
        Self::new()
    }
}

/// Arena that allocates IDs and stores associated items.
///
/// Combines ID generation with storage, ensuring each item gets a unique ID.
/// Uses IndexMap for deterministic iteration order (insertion order).
#[derive(Debug, Clone)]
pub struct IdArena<Id, T> {
    source: IdSource<Id>,
    items: IndexMap<Id, T>,
}

impl<Id: From<u32> + Copy + Eq + Hash, T> IdArena<Id, T> {
    pub fn new() -> Self {
        IdArena {
            source: IdSource::new(),
            items: IndexMap::new(),
        }
    }

    /// Allocate a new ID and store the item.
    pub fn alloc(&mut self, item: T) -> Id {
        let id = self.source.next_id();
        self.items.insert(id, item);
        id
    }

    /// Allocate a new ID without storing anything yet.
    /// Use `insert` later to store the item.
    pub fn alloc_id(&mut self) -> Id {
        self.source.next_id()
    }

    /// Insert an item with a pre-allocated ID.
    /// Panics if the ID is already in use.
    pub fn insert(&mut self, id: Id, item: T) {
        let old = self.items.insert(id, item);
        assert!(old.is_none(), "IdArena::insert called with duplicate ID");
    }

    /// Get an item by ID.
    pub fn get(&self, id: Id) -> Option<&T> {
        self.items.get(&id)
    }

    /// Get a mutable reference to an item by ID.
    pub fn get_mut(&mut self, id: Id) -> Option<&mut T> {
        self.items.get_mut(&id)
    }

    /// Iterate over all (id, item) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&Id, &T)> {
        self.items.iter()
    }

    /// Iterate mutably over all (id, item) pairs.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Id, &mut T)> {
        self.items.iter_mut()
    }

    /// Iterate over all items (without IDs).
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    /// Number of items in the arena.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<Id: From<u32> + Copy + Eq + Hash, T> Default for IdArena<Id, T> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Tunables of the optimization pipeline, owned by the compilation session.
#[derive(Debug, Clone, Copy)]
pub struct OptimizeSettings {
    /// Positions read more often than this force the array non-virtual.
    pub max_visits: usize,
    /// Traced loops enumerate at most this many iterations.
    pub max_tracing_dim: usize,
    /// Unfold `x ** c` for integer `c` into products.
    pub unroll_integer_pow: bool,
}

impl Default for OptimizeSettings {
    fn default() -> Self {
        OptimizeSettings {
            max_visits: 3,
            max_tracing_dim: 5,
            unroll_integer_pow: true,
        }
    }
}

// =============================================================================
// Procedures and the pass pipeline
// =============================================================================

/// One compilation unit: a lowered statement tree plus its arrays. The
/// optional task/sample iterators name the dedicated block and thread axes
/// the GPU classifier keys on.
#[derive(Debug)]
pub struct Proc {
    pub name: String,
    pub body: Stmt,
    pub arrays: ArrayRegistry,
    pub task_iterator: Option<Symbol>,
    pub sample_iterator: Option<Symbol>,
}

impl Proc {
    pub fn new(name: &str, arrays: ArrayRegistry, body: Stmt) -> Proc {
        Proc {
            name: name.to_string(),
            body,
            arrays,
            task_iterator: None,
            sample_iterator: None,
        }
    }

    /// Run usage analysis, entering the optimization pipeline.
    pub fn trace(mut self, settings: OptimizeSettings) -> Result<Traced> {
        let store = trace::visit_program(&settings, &mut self.arrays, &self.body)?;
        Ok(Traced {
            settings,
            proc: self,
            store,
        })
    }
}

/// Usage analysis has run.
pub struct Traced {
    pub settings: OptimizeSettings,
    pub proc: Proc,
    pub store: TracedStore,
}

impl Traced {
    /// Inline eligible arrays into their consumers.
    pub fn virtualize(mut self) -> Result<Virtualized> {
        let (body, stats) =
            virtualize::virtual_program(&mut self.proc.arrays, &mut self.store, self.proc.body)?;
        self.proc.body = body;
        Ok(Virtualized {
            settings: self.settings,
            proc: self.proc,
            store: self.store,
            stats,
        })
    }
}

/// Reads of virtual arrays have been replaced by replayed computations.
pub struct Virtualized {
    pub settings: OptimizeSettings,
    pub proc: Proc,
    pub store: TracedStore,
    pub stats: VirtualizeStats,
}

impl Virtualized {
    /// Remove the dead writes of virtual arrays.
    pub fn cleanup(mut self) -> Result<Cleaned> {
        let (body, removed) = virtualize::cleanup_virtual(&self.proc.arrays, self.proc.body)?;
        self.proc.body = body;
        self.stats.removed_writes = removed;
        Ok(Cleaned {
            settings: self.settings,
            proc: self.proc,
            store: self.store,
            stats: self.stats,
        })
    }
}

/// Dead writes are gone.
pub struct Cleaned {
    pub settings: OptimizeSettings,
    pub proc: Proc,
    pub store: TracedStore,
    pub stats: VirtualizeStats,
}

impl Cleaned {
    /// Algebraic simplification to a fixed point.
    pub fn simplify(mut self) -> Optimized {
        self.proc.body = simplify::simplify(&self.settings, self.proc.body);
        Optimized {
            proc: self.proc,
            store: self.store,
            stats: self.stats,
        }
    }
}

/// The optimized program and its analysis table.
pub struct Optimized {
    pub proc: Proc,
    pub store: TracedStore,
    pub stats: VirtualizeStats,
}

/// Run the full pipeline: trace, virtualize, cleanup, simplify. Errors
/// propagate; partial results are not returned.
pub fn optimize(settings: OptimizeSettings, proc: Proc) -> Result<Optimized> {
    Ok(proc.trace(settings)?.virtualize()?.cleanup()?.simplify())
}

// =============================================================================
// Compilation: final memory modes and storage classes
// =============================================================================

/// Provenance for the hosted promotion applied by `compile`.
pub const PROV_HOSTED_PROMOTION: u8 = 138;

/// A compiled routine: the optimized program plus the storage decisions the
/// backend allocates from.
pub struct Compiled {
    pub name: String,
    pub optimized: Optimized,
    pub storage: IndexMap<ArrayId, StorageClass>,
    pub gpu_modes: IndexMap<ArrayId, GpuMode>,
}

/// Optimize and finalize memory modes: arrays that ended non-virtual but
/// device-only become hosted so the context can observe them, storage
/// classes and GPU sub-modes are computed for the backend.
pub fn compile(name: &str, settings: OptimizeSettings, proc: Proc) -> Result<Compiled> {
    let mut optimized = optimize(settings, proc)?;

    for decl in optimized.proc.arrays.iter_mut() {
        let read_only = optimized.store.read_only(decl.id);
        let promote = match decl.mode() {
            None => true,
            Some(MemoryMode::Materialized) => decl.mode_provenance() != Some(memory::PROV_DECLARED),
            _ => false,
        };
        if promote {
            let kind = if read_only {
                HostedKind::Constant
            } else {
                HostedKind::Changed
            };
            decl.force_mode(MemoryMode::Hosted(kind), PROV_HOSTED_PROMOTION)?;
        }
    }

    check_hosted_constant_writes(&optimized.proc)?;

    let write_iters = collect_write_iterators(&optimized.proc.body);
    let mut storage = IndexMap::new();
    let mut gpu_modes = IndexMap::new();
    for decl in optimized.proc.arrays.iter() {
        let read_only = optimized.store.read_only(decl.id);
        storage.insert(decl.id, storage_class(decl.mode_with_provenance(), read_only));
        let mode = decl.mode().unwrap_or(MemoryMode::Materialized);
        if mode.is_materialized() {
            let empty = HashSet::new();
            let iters = write_iters.get(&decl.id).unwrap_or(&empty);
            let indexing = |axis: Option<Symbol>| match axis {
                None => ParallelIndexing::Absent,
                Some(sym) if iters.contains(&sym) => ParallelIndexing::Indexed,
                Some(_) => ParallelIndexing::NotIndexed,
            };
            gpu_modes.insert(
                decl.id,
                memory::gpu_mode(
                    &decl.label,
                    indexing(optimized.proc.task_iterator),
                    indexing(optimized.proc.sample_iterator),
                    mode.is_hosted(),
                    read_only,
                    read_only,
                ),
            );
        }
    }

    Ok(Compiled {
        name: name.to_string(),
        optimized,
        storage,
        gpu_modes,
    })
}

/// Device code must not rewrite an array pinned hosted-constant.
fn check_hosted_constant_writes(proc: &Proc) -> Result<()> {
    fn targets(s: &Stmt, out: &mut Vec<ArrayId>) {
        match s {
            Stmt::Seq(items) => items.iter().for_each(|i| targets(i, out)),
            Stmt::For { body, .. } => targets(body, out),
            Stmt::ZeroOut(a) => out.push(*a),
            Stmt::Set { array, value, .. } => {
                out.push(*array);
                expr_targets(value, out);
            }
            Stmt::SetLocal(_, value) => expr_targets(value, out),
            Stmt::Noop | Stmt::Comment(_) | Stmt::StagedCallback { .. } => {}
        }
    }
    fn expr_targets(e: &Expr, out: &mut Vec<ArrayId>) {
        match e {
            Expr::Binop(_, l, r) => {
                expr_targets(l, out);
                expr_targets(r, out);
            }
            Expr::Unop(_, x) => expr_targets(x, out),
            Expr::LocalScope { body, .. } => targets(body, out),
            _ => {}
        }
    }
    let mut written = vec![];
    targets(&proc.body, &mut written);
    for id in written {
        if proc.arrays.get(id).mode() == Some(MemoryMode::Hosted(HostedKind::Constant)) {
            return Err(crate::err_analysis!(
                "array {} is hosted-constant but the routine writes it",
                proc.arrays.get(id).label
            ));
        }
    }
    Ok(())
}

/// Which loop iterators index the writes of each array, in the final IR.
fn collect_write_iterators(body: &Stmt) -> HashMap<ArrayId, HashSet<Symbol>> {
    fn stmt(s: &Stmt, out: &mut HashMap<ArrayId, HashSet<Symbol>>) {
        match s {
            Stmt::Seq(items) => items.iter().for_each(|i| stmt(i, out)),
            Stmt::For { body, .. } => stmt(body, out),
            Stmt::Set { array, idcs, value } => {
                let entry = out.entry(*array).or_default();
                entry.extend(idcs.iter().filter_map(AxisIndex::iterator));
                expr(value, out);
            }
            Stmt::SetLocal(_, value) => expr(value, out),
            Stmt::ZeroOut(_) | Stmt::Noop | Stmt::Comment(_) | Stmt::StagedCallback { .. } => {}
        }
    }
    fn expr(e: &Expr, out: &mut HashMap<ArrayId, HashSet<Symbol>>) {
        match e {
            Expr::Binop(_, l, r) => {
                expr(l, out);
                expr(r, out);
            }
            Expr::Unop(_, x) => expr(x, out),
            Expr::LocalScope { body, .. } => stmt(body, out),
            _ => {}
        }
    }
    let mut out = HashMap::new();
    stmt(body, &mut out);
    out
}
