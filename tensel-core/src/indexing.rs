//! Symbols, axis indices, and per-operation projection records.
//!
//! Symbols are process-unique: the counter behind [`fresh_symbol`] is an
//! atomic that is never reset, so iterators minted by different compilation
//! units can never collide. Everything else in this module is plain data.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};

use serde::Serialize;

use crate::error::Result;
use crate::{bail_analysis, err_analysis};

// =============================================================================
// Symbols
// =============================================================================

/// A process-unique identifier, used for loop iterators and static bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Symbol(pub u32);

static NEXT_SYMBOL: AtomicU32 = AtomicU32::new(0);

fn symbol_labels() -> &'static Mutex<HashMap<u32, String>> {
    static LABELS: OnceLock<Mutex<HashMap<u32, String>>> = OnceLock::new();
    LABELS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Mint a fresh symbol. Monotonic across the whole process run.
pub fn fresh_symbol() -> Symbol {
    Symbol(NEXT_SYMBOL.fetch_add(1, Ordering::Relaxed))
}

/// Mint a fresh symbol and record a display label for it.
pub fn fresh_labeled_symbol(label: &str) -> Symbol {
    let sym = fresh_symbol();
    symbol_labels().lock().unwrap().insert(sym.0, label.to_string());
    sym
}

impl Symbol {
    /// The display label recorded at creation, if any.
    pub fn label(&self) -> Option<String> {
        symbol_labels().lock().unwrap().get(&self.0).cloned()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.label() {
            Some(label) => write!(f, "i{}_{}", self.0, label),
            None => write!(f, "i{}", self.0),
        }
    }
}

/// A symbol whose integer value is supplied late, at compilation staging
/// time, e.g. the batch position selected by a slicing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StaticSymbol(pub Symbol);

impl fmt::Display for StaticSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "static({})", self.0)
    }
}

// =============================================================================
// Axis indices
// =============================================================================

/// One position of an index vector: a loop iterator or a fixed integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AxisIndex {
    Fixed(i64),
    Iter(Symbol),
}

impl AxisIndex {
    pub fn iterator(&self) -> Option<Symbol> {
        match self {
            AxisIndex::Iter(s) => Some(*s),
            AxisIndex::Fixed(_) => None,
        }
    }
}

impl fmt::Display for AxisIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisIndex::Fixed(i) => write!(f, "{}", i),
            AxisIndex::Iter(s) => write!(f, "{}", s),
        }
    }
}

// =============================================================================
// Projection ids
// =============================================================================

/// Identifies a projection equivalence class during projection inference.
/// Only meaningful within a single derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProjId(pub u32);

impl From<u32> for ProjId {
    fn from(id: u32) -> Self {
        ProjId(id)
    }
}

impl fmt::Display for ProjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

// =============================================================================
// Projections
// =============================================================================

/// The iteration space of one operation instance: the product of axis sizes
/// being looped over, the loop iterators, and the index function for the
/// result and each operand. Degenerate (size-1) axes use `Fixed(0)` rather
/// than an iterator; operand index vectors are padded to the result's rank.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Projections {
    /// Concrete sizes of the iterated axes, loop order.
    pub product_space: Vec<usize>,
    /// One iterator symbol per product-space axis.
    pub product_iterators: Vec<Symbol>,
    /// Index vector of the result array.
    pub lhs: Vec<AxisIndex>,
    /// Index vector of each input operand.
    pub rhs: Vec<Vec<AxisIndex>>,
    /// Originating operation label, carried into IR comments.
    pub debug_label: String,
}

impl Projections {
    /// Check that every product-space position lands inside the given dims:
    /// each fixed index is in range, each iterator ranges over exactly the
    /// paired dimension, and dim-1 axes are indexed as `Fixed(0)`.
    pub fn validate(&self, lhs_dims: &[usize], rhs_dims: &[Vec<usize>]) -> Result<()> {
        if self.product_space.len() != self.product_iterators.len() {
            bail_analysis!(
                "projections '{}': {} product dims vs {} iterators",
                self.debug_label,
                self.product_space.len(),
                self.product_iterators.len()
            );
        }
        let extent: HashMap<Symbol, usize> = self
            .product_iterators
            .iter()
            .copied()
            .zip(self.product_space.iter().copied())
            .collect();
        self.validate_operand("lhs", &self.lhs, lhs_dims, &extent)?;
        for (n, (idcs, dims)) in self.rhs.iter().zip(rhs_dims.iter()).enumerate() {
            self.validate_operand(&format!("rhs{}", n + 1), idcs, dims, &extent)?;
        }
        Ok(())
    }

    fn validate_operand(
        &self,
        which: &str,
        idcs: &[AxisIndex],
        dims: &[usize],
        extent: &HashMap<Symbol, usize>,
    ) -> Result<()> {
        // Operand dims align with the trailing entries of the index vector;
        // leading entries index broadcast padding and must be Fixed(0).
        if dims.len() > idcs.len() {
            bail_analysis!(
                "projections '{}': {} has {} dims but only {} indices",
                self.debug_label,
                which,
                dims.len(),
                idcs.len()
            );
        }
        let pad = idcs.len() - dims.len();
        for (pos, idx) in idcs.iter().enumerate() {
            let dim = if pos < pad { 1 } else { dims[pos - pad] };
            match idx {
                AxisIndex::Fixed(i) => {
                    if *i < 0 || *i >= dim as i64 {
                        bail_analysis!(
                            "projections '{}': {} axis {} has fixed index {} out of range 0..{}",
                            self.debug_label,
                            which,
                            pos,
                            i,
                            dim
                        );
                    }
                }
                AxisIndex::Iter(s) => {
                    let ext = extent.get(s).copied().ok_or_else(|| {
                        err_analysis!(
                            "projections '{}': {} axis {} uses unknown iterator {}",
                            self.debug_label,
                            which,
                            pos,
                            s
                        )
                    })?;
                    if ext != dim {
                        bail_analysis!(
                            "projections '{}': {} axis {} iterates {} over dim {}",
                            self.debug_label,
                            which,
                            pos,
                            ext,
                            dim
                        );
                    }
                }
            }
        }
        Ok(())
    }
}
