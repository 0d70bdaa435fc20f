//! Fixed-capacity cell array backing the receive window.

use core::ops::{Index, IndexMut};

use crate::data::unit::Unit;
use crate::rcv::pos::Pos;

/// Occupancy state of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum CellState {
    /// Nothing here; the unit slot is vacant.
    #[default]
    Empty,
    /// Holds a deliverable packet.
    Avail,
    /// Consumed by an out-of-order read; slot reserved until the head sweeps past.
    Read,
    /// Abandoned by the retransmission logic; slot reserved until the head sweeps past.
    Dropped,
}

/// One cell: an optional pool unit plus its occupancy state.
///
/// `Empty` cells never hold a unit; `Avail` cells always do. `Read` and
/// `Dropped` cells have already returned their unit to the pool and only
/// reserve the slot.
#[derive(Debug, Default)]
pub(crate) struct Cell {
    pub unit: Option<Unit>,
    pub state: CellState,
}

/// The indexed container itself. No hashing, no linking, no resizing.
#[derive(Debug)]
pub(crate) struct CellArray {
    cells: Vec<Cell>,
}

impl CellArray {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut cells = Vec::with_capacity(capacity);
        cells.resize_with(capacity, Cell::default);
        Self { cells }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.cells.len()
    }
}

impl Index<Pos> for CellArray {
    type Output = Cell;

    #[inline]
    fn index(&self, pos: Pos) -> &Cell {
        &self.cells[pos.0]
    }
}

impl IndexMut<Pos> for CellArray {
    #[inline]
    fn index_mut(&mut self, pos: Pos) -> &mut Cell {
        &mut self.cells[pos.0]
    }
}
