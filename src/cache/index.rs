//! Spatial Index
//!
//! Grid cell -> ids of the entries quantized into that cell. Lookups scan
//! the 3x3 neighborhood of the query cell so entries just across a cell
//! boundary are still found.

use std::collections::HashMap;

use super::quantize::GridCell;

/// Stable id of an entry inside a `CacheStore`
pub type EntryId = u64;

/// Cell -> entry ids, in insertion order
#[derive(Debug, Default, Clone)]
pub struct SpatialIndex {
    cells: HashMap<GridCell, Vec<EntryId>>,
}

impl SpatialIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(id, cell)` pairs
    pub fn rebuild<I>(items: I) -> Self
    where
        I: IntoIterator<Item = (EntryId, GridCell)>,
    {
        let mut index = Self::new();
        for (id, cell) in items {
            index.insert(cell, id);
        }
        index
    }

    pub fn insert(&mut self, cell: GridCell, id: EntryId) {
        self.cells.entry(cell).or_default().push(id);
    }

    /// Remove an id; empty cells are dropped
    pub fn remove(&mut self, cell: GridCell, id: EntryId) -> bool {
        let Some(ids) = self.cells.get_mut(&cell) else {
            return false;
        };
        let before = ids.len();
        ids.retain(|&i| i != id);
        let removed = ids.len() != before;
        if ids.is_empty() {
            self.cells.remove(&cell);
        }
        removed
    }

    /// Ids stored in a single cell
    pub fn cell(&self, cell: &GridCell) -> &[EntryId] {
        self.cells.get(cell).map(Vec::as_slice).unwrap_or_default()
    }

    /// Ids in the 3x3 neighborhood of `cell`
    pub fn candidates(&self, cell: GridCell) -> impl Iterator<Item = EntryId> + '_ {
        cell.neighbors()
            .into_iter()
            .flat_map(move |c| self.cell(&c).iter().copied())
    }

    /// Cells holding more than `max` ids
    pub fn overfull(&self, max: usize) -> Vec<GridCell> {
        self.cells
            .iter()
            .filter(|(_, ids)| ids.len() > max)
            .map(|(cell, _)| *cell)
            .collect()
    }

    /// Number of non-empty cells
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Number of indexed ids
    pub fn len(&self) -> usize {
        self.cells.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }
}
