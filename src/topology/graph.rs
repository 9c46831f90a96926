//! `GraphTopology`: a mutable-then-frozen sparse boolean relation.
//!
//! Stores the connectivity of entities of type A to entities of type B
//! (cell-to-node, node-to-cell, ...) in compressed-row form. A table is
//! built in one of three ways:
//!
//! 1. incrementally via [`GraphTopology::push`] (amortized geometric
//!    growth, duplicate-tolerant), frozen by [`GraphTopology::finalize`];
//! 2. in two passes via [`GraphTopology::make_i`] /
//!    [`GraphTopology::add_columns_in_row`] / [`GraphTopology::make_j`] /
//!    [`GraphTopology::add_connection`] / [`GraphTopology::shift_up_i`],
//!    the preferred path when row degrees are known up front;
//! 3. in bulk from pre-assembled arrays ([`GraphTopology::set_ij`],
//!    [`GraphTopology::make_from_list`], [`GraphTopology::from_nested`]).
//!
//! After the freeze the table is read-only; [`GraphTopology::sort_rows`]
//! must run before any per-row query ([`GraphTopology::row`],
//! [`GraphTopology::row_size`], [`GraphTopology::index`]). Violations of
//! the build protocol are programming errors and are debug-asserted, not
//! reported through `MeshHaloError`.

use std::fmt;

use crate::debug_invariants::DebugInvariants;
use crate::halo_error::MeshHaloError;
use crate::topology::counts::EntityCounts;

/// Rank-independent global entity id. Column entries of a relation are
/// either dense local indices or `Gid`s, depending on
/// [`GraphTopology::is_global_id`].
pub type Gid = i64;

/// Placeholder for an unassigned column slot; compacted out by
/// [`GraphTopology::finalize`].
pub const INVALID_GID: Gid = -1;

/// One `(from, to)` entry of a connection list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Connection {
    pub from: usize,
    pub to: Gid,
}

impl Connection {
    pub fn new(from: usize, to: Gid) -> Self {
        Self { from, to }
    }
}

#[derive(Clone, Default)]
pub struct GraphTopology {
    /// COO row array, present only after [`GraphTopology::build_row`].
    row: Vec<usize>,
    col: Vec<Gid>,
    cpr_row: Vec<usize>,
    /// Per-row staging storage during the push phase.
    build: Option<Vec<Vec<Gid>>>,
    finalized: bool,
    sorted: bool,
    global_id: bool,
    local: EntityCounts,
    real: EntityCounts,
    global: EntityCounts,
}

impl GraphTopology {
    /// Empty table; populate with [`Self::push`] after
    /// [`Self::with_row_capacity`], or use a bulk constructor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with `rows` rows, each pre-reserving `conns_per_row` column
    /// slots for the push phase.
    pub fn with_row_capacity(rows: usize, conns_per_row: usize) -> Self {
        let build = (0..rows)
            .map(|_| Vec::with_capacity(conns_per_row))
            .collect();
        Self {
            build: Some(build),
            ..Self::default()
        }
    }

    /// Build from parallel COO arrays. Duplicates are kept; rows come out
    /// in `row`/`col` order.
    pub fn from_coo(row: &[usize], col: &[Gid], n_rows: usize) -> Self {
        assert_eq!(row.len(), col.len());
        let mut counts = vec![0usize; n_rows + 1];
        for &r in row {
            counts[r + 1] += 1;
        }
        for r in 0..n_rows {
            counts[r + 1] += counts[r];
        }
        let mut cols = vec![INVALID_GID; col.len()];
        let mut cursor = counts.clone();
        for (&r, &c) in row.iter().zip(col) {
            cols[cursor[r]] = c;
            cursor[r] += 1;
        }
        Self::from_csr(counts, cols)
    }

    /// Build from a vector-of-vectors connectivity.
    pub fn from_nested(data: &[Vec<Gid>]) -> Self {
        let mut cpr = Vec::with_capacity(data.len() + 1);
        cpr.push(0);
        let mut col = Vec::new();
        for r in data {
            col.extend_from_slice(r);
            cpr.push(col.len());
        }
        Self::from_csr(cpr, col)
    }

    /// One entry per row, column given by the partition assignment.
    pub fn from_partition_array(partition: &[usize]) -> Self {
        let cpr = (0..=partition.len()).collect();
        let col = partition.iter().map(|&p| p as Gid).collect();
        Self::from_csr(cpr, col)
    }

    /// Build from a sorted, duplicate-free connection list.
    pub fn make_from_list(n_rows: usize, list: &[Connection]) -> Self {
        debug_assert!(list.windows(2).all(|w| w[0] < w[1]), "list must be sorted and duplicate-free");
        let mut cpr = vec![0usize; n_rows + 1];
        for c in list {
            cpr[c.from + 1] += 1;
        }
        for r in 0..n_rows {
            cpr[r + 1] += cpr[r];
        }
        let col = list.iter().map(|c| c.to).collect();
        let mut g = Self::from_csr(cpr, col);
        g.sorted = true;
        g
    }

    fn from_csr(cpr_row: Vec<usize>, col: Vec<Gid>) -> Self {
        let mut g = Self {
            cpr_row,
            col,
            finalized: true,
            ..Self::default()
        };
        g.refresh_counts();
        g.debug_assert_invariants();
        g
    }

    /// Registers column `j` in row `i` and returns the slot within the
    /// row. Returns the existing slot if the connection is already
    /// present. Returns `None` once the table is frozen (a programming
    /// error, debug-asserted).
    pub fn push(&mut self, i: usize, j: Gid) -> Option<usize> {
        debug_assert!(!self.finalized, "push after finalize");
        if self.finalized {
            return None;
        }
        let build = self
            .build
            .get_or_insert_with(Vec::new);
        if i >= build.len() {
            build.resize_with(i + 1, Vec::new);
        }
        let row = &mut build[i];
        if let Some(slot) = row.iter().position(|&c| c == j) {
            return Some(slot);
        }
        row.push(j);
        Some(row.len() - 1)
    }

    /// Pre-size the frozen arrays: `cpr_row[0] = 0`, `cpr_row[rows] = nnz`,
    /// columns filled with [`INVALID_GID`]. The caller fills the interior
    /// offsets and columns through [`Self::cpr_row_mut`]/[`Self::col_mut`],
    /// then calls [`Self::finalize`] to compact unused slots.
    pub fn set_dims(&mut self, rows: usize, nnz: usize) {
        debug_assert!(!self.finalized, "set_dims after finalize");
        self.cpr_row = vec![0; rows + 1];
        self.cpr_row[rows] = nnz;
        self.col = vec![INVALID_GID; nnz];
        self.build = None;
    }

    // Two-pass bulk construction. Pass one counts the degree of every
    // row; pass two writes the columns with `cpr_row[r]` as a moving
    // cursor, restored by `shift_up_i`.

    pub fn make_i(&mut self, n_rows: usize) {
        debug_assert!(!self.finalized, "make_i after finalize");
        self.cpr_row = vec![0; n_rows + 1];
        self.build = None;
    }

    pub fn add_a_column_in_row(&mut self, r: usize) {
        self.cpr_row[r + 1] += 1;
    }

    pub fn add_columns_in_row(&mut self, r: usize, n_cols: usize) {
        self.cpr_row[r + 1] += n_cols;
    }

    pub fn make_j(&mut self) {
        let n_rows = self.cpr_row.len() - 1;
        for r in 0..n_rows {
            self.cpr_row[r + 1] += self.cpr_row[r];
        }
        self.col = vec![INVALID_GID; self.cpr_row[n_rows]];
    }

    pub fn add_connection(&mut self, r: usize, c: Gid) {
        self.col[self.cpr_row[r]] = c;
        self.cpr_row[r] += 1;
    }

    pub fn add_connections(&mut self, r: usize, cols: &[Gid]) {
        for &c in cols {
            self.add_connection(r, c);
        }
    }

    /// Restore the offsets consumed as cursors by
    /// [`Self::add_connection`] and freeze the table.
    pub fn shift_up_i(&mut self) {
        debug_assert!(!self.finalized, "shift_up_i after finalize");
        for r in (1..self.cpr_row.len()).rev() {
            self.cpr_row[r] = self.cpr_row[r - 1];
        }
        self.cpr_row[0] = 0;
        // the last cursor ran to nnz, so the shifted tail is already right
        *self.cpr_row.last_mut().unwrap() = self.col.len();
        self.finalized = true;
        self.refresh_counts();
        self.debug_assert_invariants();
    }

    /// Replace the frozen arrays wholesale.
    pub fn set_ij(&mut self, cpr_row: Vec<usize>, col: Vec<Gid>) {
        debug_assert_eq!(*cpr_row.last().unwrap_or(&0), col.len());
        self.cpr_row = cpr_row;
        self.col = col;
        self.build = None;
        self.finalized = true;
        self.sorted = false;
        self.refresh_counts();
        self.debug_assert_invariants();
    }

    /// Freeze the table. Compacts [`INVALID_GID`] placeholders out of the
    /// column array (push-phase staging is flattened first). May be
    /// called only once; a second call is a logic error.
    pub fn finalize(&mut self) {
        debug_assert!(!self.finalized, "finalize called twice");
        if self.finalized {
            return;
        }
        if let Some(build) = self.build.take() {
            let mut cpr = Vec::with_capacity(build.len() + 1);
            cpr.push(0);
            let mut col = Vec::with_capacity(build.iter().map(Vec::len).sum());
            for row in &build {
                col.extend(row.iter().copied().filter(|&c| c != INVALID_GID));
                cpr.push(col.len());
            }
            self.cpr_row = cpr;
            self.col = col;
        } else if !self.cpr_row.is_empty() {
            // compact placeholder slots left by set_dims-style fills
            let n_rows = self.cpr_row.len() - 1;
            let mut col = Vec::with_capacity(self.col.len());
            let mut cpr = Vec::with_capacity(n_rows + 1);
            cpr.push(0);
            for r in 0..n_rows {
                let (b, e) = (self.cpr_row[r], self.cpr_row[r + 1]);
                col.extend(self.col[b..e].iter().copied().filter(|&c| c != INVALID_GID));
                cpr.push(col.len());
            }
            self.cpr_row = cpr;
            self.col = col;
        }
        self.finalized = true;
        self.refresh_counts();
        self.debug_assert_invariants();
    }

    fn refresh_counts(&mut self) {
        let rows = self.n_rows();
        let cols = if self.global_id {
            0
        } else {
            self.col.iter().map(|&c| c + 1).max().unwrap_or(0).max(0) as usize
        };
        self.local = EntityCounts::new(rows, cols, self.col.len());
        self.real = self.local;
    }

    /// Sort the column indices within each row ascending. Required before
    /// any [`Self::row`]/[`Self::row_size`]/[`Self::index`] query.
    pub fn sort_rows(&mut self) {
        debug_assert!(self.finalized, "sort_rows before finalize");
        let n_rows = self.n_rows();
        for r in 0..n_rows {
            let (b, e) = (self.cpr_row[r], self.cpr_row[r + 1]);
            self.col[b..e].sort_unstable();
        }
        self.sorted = true;
    }

    /// Slot of the connection `(i, j)` within the column array, or `None`
    /// if absent. Requires sorted rows.
    pub fn index(&self, i: usize, j: Gid) -> Option<usize> {
        debug_assert!(self.sorted, "index on unsorted rows");
        let (b, e) = (self.cpr_row[i], self.cpr_row[i + 1]);
        self.col[b..e].binary_search(&j).ok().map(|k| b + k)
    }

    /// Number of column entries in row `i`. Requires sorted rows.
    pub fn row_size(&self, i: usize) -> usize {
        debug_assert!(self.sorted, "row_size on unsorted rows");
        self.cpr_row[i + 1] - self.cpr_row[i]
    }

    /// Column entries of row `i`. Requires sorted rows.
    pub fn row(&self, i: usize) -> &[Gid] {
        debug_assert!(self.sorted, "row on unsorted rows");
        self.cols_of(i)
    }

    /// Column entries of row `i` without the sortedness requirement.
    /// For algorithms that only need set membership per row.
    pub(crate) fn cols_of(&self, i: usize) -> &[Gid] {
        &self.col[self.cpr_row[i]..self.cpr_row[i + 1]]
    }

    /// Number of type-B entities (maximum column index + 1). Meaningless
    /// for global-id columns.
    pub fn width(&self) -> usize {
        debug_assert!(self.finalized, "width before finalize");
        debug_assert!(!self.global_id, "width of a global-id table");
        self.local.cols
    }

    pub fn n_rows(&self) -> usize {
        self.cpr_row.len().saturating_sub(1)
    }

    pub fn nnz(&self) -> usize {
        self.col.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub fn set_sorted(&mut self, sorted: bool) {
        self.sorted = sorted;
    }

    /// Whether column entries are global ids rather than local indices.
    pub fn is_global_id(&self) -> bool {
        self.global_id
    }

    pub fn set_global_id(&mut self, global: bool) {
        self.global_id = global;
        if self.finalized {
            self.refresh_counts();
        }
    }

    pub fn local(&self) -> EntityCounts {
        self.local
    }

    pub fn real(&self) -> EntityCounts {
        self.real
    }

    pub fn global(&self) -> EntityCounts {
        self.global
    }

    pub fn set_global_counts(&mut self, counts: EntityCounts) {
        self.global = counts;
    }

    pub fn cpr_row_slice(&self) -> &[usize] {
        &self.cpr_row
    }

    pub fn col_slice(&self) -> &[Gid] {
        &self.col
    }

    pub fn cpr_row_mut(&mut self) -> &mut [usize] {
        &mut self.cpr_row
    }

    pub fn col_mut(&mut self) -> &mut [Gid] {
        &mut self.col
    }

    /// Build the COO row array from the compressed offsets.
    pub fn build_row(&mut self) {
        debug_assert!(self.finalized, "build_row before finalize");
        self.row = Vec::with_capacity(self.nnz());
        for r in 0..self.n_rows() {
            for _ in self.cpr_row[r]..self.cpr_row[r + 1] {
                self.row.push(r);
            }
        }
    }

    /// COO row array; empty unless [`Self::build_row`] has run.
    pub fn row_array(&self) -> &[usize] {
        &self.row
    }

    /// Apply a row permutation: old row `i` moves to `perm[i]`.
    pub fn reorder_rows(&mut self, perm: &[usize]) {
        debug_assert!(self.finalized, "reorder_rows before finalize");
        debug_assert_eq!(perm.len(), self.n_rows());
        let n_rows = self.n_rows();
        let mut sizes = vec![0usize; n_rows + 1];
        for old in 0..n_rows {
            sizes[perm[old] + 1] = self.cpr_row[old + 1] - self.cpr_row[old];
        }
        for r in 0..n_rows {
            sizes[r + 1] += sizes[r];
        }
        let mut col = vec![INVALID_GID; self.col.len()];
        for old in 0..n_rows {
            let new = perm[old];
            let (b, e) = (self.cpr_row[old], self.cpr_row[old + 1]);
            col[sizes[new]..sizes[new] + (e - b)].copy_from_slice(&self.col[b..e]);
        }
        self.cpr_row = sizes;
        self.col = col;
        self.row.clear();
        self.debug_assert_invariants();
    }

    /// Remap local column indices: old column `c` becomes `perm[c]`.
    pub fn reorder_cols(&mut self, perm: &[usize]) {
        debug_assert!(!self.global_id, "reorder_cols on a global-id table");
        for c in &mut self.col {
            if *c != INVALID_GID {
                *c = perm[*c as usize] as Gid;
            }
        }
        self.sorted = false;
    }

    /// Shrink the logical row count to `new_rows`, dropping the tail.
    pub fn reset_row_size(&mut self, new_rows: usize) {
        debug_assert!(self.finalized, "reset_row_size before finalize");
        debug_assert!(new_rows <= self.n_rows());
        let nnz = self.cpr_row[new_rows];
        self.cpr_row.truncate(new_rows + 1);
        self.col.truncate(nnz);
        self.row.clear();
        self.refresh_counts();
    }

    /// Append received ghost rows to a frozen relation without disturbing
    /// existing row indices. `counts[k]` is the column count of appended
    /// row `k`; `cols` is the concatenation of their column lists. The
    /// `real` counts keep describing the owned prefix.
    pub fn add_ghost_layer(&mut self, counts: &[usize], cols: &[Gid]) {
        debug_assert!(self.finalized, "add_ghost_layer before finalize");
        debug_assert_eq!(counts.iter().sum::<usize>(), cols.len());
        let mut offset = *self.cpr_row.last().unwrap();
        for &n in counts {
            offset += n;
            self.cpr_row.push(offset);
        }
        self.col.extend_from_slice(cols);
        self.row.clear();
        self.sorted = false;
        self.local.rows += counts.len();
        self.local.nnz += cols.len();
        if !self.global_id {
            self.local.cols = self
                .local
                .cols
                .max(cols.iter().map(|&c| c + 1).max().unwrap_or(0).max(0) as usize);
        }
        self.debug_assert_invariants();
    }

    pub fn swap(&mut self, other: &mut Self) {
        std::mem::swap(self, other);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

impl DebugInvariants for GraphTopology {
    fn validate_invariants(&self) -> Result<(), MeshHaloError> {
        if !self.finalized {
            return Ok(());
        }
        let ok = self.cpr_row.first() == Some(&0)
            && self.cpr_row.last() == Some(&self.col.len())
            && self.cpr_row.windows(2).all(|w| w[0] <= w[1]);
        if ok {
            Ok(())
        } else {
            Err(MeshHaloError::CorruptTable(
                "compressed row offsets are inconsistent",
            ))
        }
    }
}

impl fmt::Debug for GraphTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphTopology")
            .field("rows", &self.n_rows())
            .field("nnz", &self.nnz())
            .field("finalized", &self.finalized)
            .field("sorted", &self.sorted)
            .field("global_id", &self.global_id)
            .finish()
    }
}

impl fmt::Display for GraphTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in 0..self.n_rows() {
            write!(f, "{r:4}:")?;
            for &c in self.cols_of(r) {
                write!(f, " {c}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_table() -> GraphTopology {
        let mut g = GraphTopology::with_row_capacity(3, 2);
        g.push(0, 5);
        g.push(0, 2);
        g.push(1, 7);
        g.push(2, 2);
        g.push(2, 0);
        g.push(2, 9);
        g
    }

    #[test]
    fn push_finalize_sort_query() {
        let mut g = push_table();
        g.finalize();
        g.sort_rows();
        assert_eq!(g.n_rows(), 3);
        assert_eq!(g.nnz(), 6);
        assert_eq!(g.row(0), &[2, 5]);
        assert_eq!(g.row(2), &[0, 2, 9]);
        assert_eq!(g.row_size(1), 1);
        assert!(g.index(0, 5).is_some());
        assert!(g.index(1, 5).is_none());
    }

    #[test]
    fn push_dedups_within_row() {
        let mut g = GraphTopology::with_row_capacity(1, 4);
        let a = g.push(0, 3).unwrap();
        let b = g.push(0, 3).unwrap();
        assert_eq!(a, b);
        g.finalize();
        assert_eq!(g.nnz(), 1);
    }

    #[test]
    fn push_after_finalize_fails() {
        let mut g = push_table();
        g.finalize();
        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| g.push(0, 1)));
        if cfg!(debug_assertions) {
            assert!(r.is_err());
        } else {
            assert_eq!(r.unwrap(), None);
        }
    }

    #[test]
    fn two_pass_matches_push() {
        let mut a = push_table();
        a.finalize();
        a.sort_rows();

        let mut b = GraphTopology::new();
        b.make_i(3);
        b.add_columns_in_row(0, 2);
        b.add_a_column_in_row(1);
        b.add_columns_in_row(2, 3);
        b.make_j();
        b.add_connections(0, &[5, 2]);
        b.add_connection(1, 7);
        b.add_connections(2, &[2, 0, 9]);
        b.shift_up_i();
        b.sort_rows();

        assert_eq!(a.cpr_row_slice(), b.cpr_row_slice());
        assert_eq!(a.col_slice(), b.col_slice());
    }

    #[test]
    fn make_from_list_is_sorted() {
        let list = [
            Connection::new(0, 1),
            Connection::new(0, 4),
            Connection::new(2, 3),
        ];
        let g = GraphTopology::make_from_list(3, &list);
        assert!(g.is_sorted());
        assert_eq!(g.row(0), &[1, 4]);
        assert_eq!(g.row_size(1), 0);
        assert_eq!(g.row(2), &[3]);
    }

    #[test]
    fn finalize_compacts_placeholders() {
        let mut g = GraphTopology::new();
        g.set_dims(2, 4);
        g.cpr_row_mut()[1] = 2;
        g.col_mut()[0] = 8;
        g.col_mut()[2] = 3;
        g.finalize();
        assert_eq!(g.nnz(), 2);
        assert_eq!(g.cols_of(0), &[8]);
        assert_eq!(g.cols_of(1), &[3]);
    }

    #[test]
    fn ghost_rows_append_at_tail() {
        let mut g = GraphTopology::from_nested(&[vec![0, 1], vec![1, 2]]);
        let real = g.real();
        g.add_ghost_layer(&[3, 1], &[2, 3, 4, 0]);
        assert_eq!(g.n_rows(), 4);
        assert_eq!(g.cols_of(2), &[2, 3, 4]);
        assert_eq!(g.cols_of(3), &[0]);
        assert_eq!(g.real(), real);
        assert_eq!(g.local().rows, 4);
    }

    #[test]
    fn reorder_rows_moves_lists() {
        let mut g = GraphTopology::from_nested(&[vec![1], vec![2, 3], vec![4]]);
        // old 0 -> 2, old 1 -> 0, old 2 -> 1
        g.reorder_rows(&[2, 0, 1]);
        assert_eq!(g.cols_of(0), &[2, 3]);
        assert_eq!(g.cols_of(1), &[4]);
        assert_eq!(g.cols_of(2), &[1]);
    }

    #[test]
    fn partition_array_one_col_per_row() {
        let g = GraphTopology::from_partition_array(&[1, 0, 1]);
        assert_eq!(g.n_rows(), 3);
        assert_eq!(g.cols_of(0), &[1]);
        assert_eq!(g.cols_of(1), &[0]);
    }

    #[test]
    fn coo_constructor_buckets_by_row() {
        let g = GraphTopology::from_coo(&[2, 0, 2, 1], &[5, 1, 3, 2], 3);
        assert_eq!(g.cols_of(0), &[1]);
        assert_eq!(g.cols_of(1), &[2]);
        assert_eq!(g.cols_of(2), &[5, 3]);
    }

    #[test]
    fn build_row_expands_offsets() {
        let mut g = GraphTopology::from_nested(&[vec![1, 2], vec![], vec![3]]);
        g.build_row();
        assert_eq!(g.row_array(), &[0, 0, 2]);
    }

    #[test]
    fn reorder_cols_remaps_local_indices() {
        let mut g = GraphTopology::from_nested(&[vec![0, 2], vec![1]]);
        g.reorder_cols(&[2, 0, 1]);
        assert_eq!(g.cols_of(0), &[2, 1]);
        assert_eq!(g.cols_of(1), &[0]);
    }

    #[test]
    fn reset_row_size_drops_the_tail() {
        let mut g = GraphTopology::from_nested(&[vec![1], vec![2, 3], vec![4]]);
        g.reset_row_size(2);
        assert_eq!(g.n_rows(), 2);
        assert_eq!(g.nnz(), 3);
        assert_eq!(g.local().rows, 2);
    }
}
