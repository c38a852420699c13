//! The array registry.
//!
//! Arrays are the values the IR reads and writes. Each carries a precision,
//! concrete dims (resolved by shape inference before lowering), and a
//! memory-mode stamp. Mode changes are monotonic: once an array is
//! non-virtual no pass may flip it back, and a user-declared mode can only
//! be contradicted by raising.

use std::fmt;

use indexmap::IndexMap;
use serde::Serialize;

use crate::error::Result;
use crate::llir::Precision;
use crate::memory::{MemoryMode, PROV_DECLARED};
use crate::row::ShapeId;
use crate::{bail_virtual, IdSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ArrayId(pub u32);

impl From<u32> for ArrayId {
    fn from(id: u32) -> Self {
        ArrayId(id)
    }
}

impl fmt::Display for ArrayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Array {
    pub id: ArrayId,
    pub label: String,
    pub prec: Precision,
    pub dims: Vec<usize>,
    /// Which shape produced the dims, when shape inference was involved.
    pub shape: Option<ShapeId>,
    mode: Option<(MemoryMode, u8)>,
}

impl Array {
    pub fn mode(&self) -> Option<MemoryMode> {
        self.mode.map(|(m, _)| m)
    }

    pub fn mode_provenance(&self) -> Option<u8> {
        self.mode.map(|(_, p)| p)
    }

    pub fn mode_with_provenance(&self) -> Option<(MemoryMode, u8)> {
        self.mode
    }

    pub fn declared_mode(&self) -> Option<MemoryMode> {
        match self.mode {
            Some((m, PROV_DECLARED)) => Some(m),
            _ => None,
        }
    }

    /// Not yet ruled out as virtual.
    pub fn virtual_candidate(&self) -> bool {
        match self.mode {
            None | Some((MemoryMode::Virtual, _)) => true,
            Some(_) => false,
        }
    }

    pub fn num_elems(&self) -> usize {
        self.dims.iter().product()
    }

    /// Record that this array cannot be virtual, stamping the provenance of
    /// the check that decided it. Raises if the user pinned it virtual.
    pub fn force_mode(&mut self, mode: MemoryMode, provenance: u8) -> Result<()> {
        debug_assert!(!mode.is_virtual());
        match self.mode {
            Some((MemoryMode::Virtual, PROV_DECLARED)) => {
                bail_virtual!(
                    provenance,
                    "array {} ({}) was declared virtual but fails virtualization",
                    self.id,
                    self.label
                )
            }
            // Already pinned by the user or already forced: first stamp wins.
            Some((m, _)) if !m.is_virtual() => Ok(()),
            _ => {
                log::debug!(
                    "array {} ({}): mode {} [provenance {}]",
                    self.id,
                    self.label,
                    mode,
                    provenance
                );
                self.mode = Some((mode, provenance));
                Ok(())
            }
        }
    }

    /// Mark the array virtual after the inliner accepted all its
    /// computations. A no-op if a non-virtual mode is already stamped.
    pub fn confirm_virtual(&mut self, provenance: u8) {
        if self.virtual_candidate() && self.mode.is_none() {
            self.mode = Some((MemoryMode::Virtual, provenance));
        }
    }
}

/// Registry of all arrays of one procedure, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ArrayRegistry {
    items: IndexMap<ArrayId, Array>,
    ids: IdSource<ArrayId>,
}

impl ArrayRegistry {
    pub fn new() -> ArrayRegistry {
        ArrayRegistry::default()
    }

    pub fn declare(&mut self, label: &str, prec: Precision, dims: Vec<usize>) -> ArrayId {
        let id = self.ids.next_id();
        self.items.insert(
            id,
            Array {
                id,
                label: label.to_string(),
                prec,
                dims,
                shape: None,
                mode: None,
            },
        );
        id
    }

    /// Declare with a user-pinned memory mode.
    pub fn declare_with_mode(
        &mut self,
        label: &str,
        prec: Precision,
        dims: Vec<usize>,
        mode: MemoryMode,
    ) -> ArrayId {
        let id = self.declare(label, prec, dims);
        self.items[&id].mode = Some((mode, PROV_DECLARED));
        id
    }

    pub fn get(&self, id: ArrayId) -> &Array {
        &self.items[&id]
    }

    pub fn get_mut(&mut self, id: ArrayId) -> &mut Array {
        &mut self.items[&id]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Array> {
        self.items.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Array> {
        self.items.values_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
