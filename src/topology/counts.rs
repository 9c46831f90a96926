//! Row/column/nonzero bookkeeping for a sparse relation.
//!
//! Every relation tracks three scopes: `local` (everything this rank
//! holds, ghost rows included), `real` (the owned prefix, ghosts
//! excluded) and `global` (mesh-wide totals, lazily filled by the
//! distribution layer and zero until then).

/// Row, column and nonzero counts of a relation at one scope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EntityCounts {
    pub rows: usize,
    pub cols: usize,
    pub nnz: usize,
}

impl EntityCounts {
    pub fn new(rows: usize, cols: usize, nnz: usize) -> Self {
        Self { rows, cols, nnz }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_zero() {
        let c = EntityCounts::default();
        assert_eq!(c, EntityCounts::new(0, 0, 0));
    }
}
