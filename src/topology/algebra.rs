//! Boolean algebra over [`GraphTopology`]: transpose and product.
//!
//! Both return new owned tables and never alias their inputs. Column
//! entries must be dense local indices (not global ids).

use crate::topology::graph::{Gid, GraphTopology};

/// Transpose a relation by a counting-sort pass, O(nnz).
///
/// The result has `A.width()` rows; within each result row the column
/// indices come out ascending, so the table is born sorted.
pub fn transpose(a: &GraphTopology) -> GraphTopology {
    debug_assert!(a.is_finalized(), "transpose before finalize");
    debug_assert!(!a.is_global_id(), "transpose of a global-id table");
    let n_rows = a.n_rows();
    let width = a.width();

    let mut cpr = vec![0usize; width + 1];
    for r in 0..n_rows {
        for &c in a.cols_of(r) {
            cpr[c as usize + 1] += 1;
        }
    }
    for r in 0..width {
        cpr[r + 1] += cpr[r];
    }
    let mut col = vec![0 as Gid; a.nnz()];
    let mut cursor = cpr.clone();
    for r in 0..n_rows {
        for &c in a.cols_of(r) {
            col[cursor[c as usize]] = r as Gid;
            cursor[c as usize] += 1;
        }
    }
    let mut at = GraphTopology::new();
    at.set_ij(cpr, col);
    at.set_sorted(true);
    at
}

/// Transpose a one-entry-per-row assignment (`v[i]` is the single column
/// of row `i`), e.g. a partition vector.
pub fn transpose_vec(v: &[Gid]) -> GraphTopology {
    let width = v.iter().map(|&c| c + 1).max().unwrap_or(0).max(0) as usize;
    let mut cpr = vec![0usize; width + 1];
    for &c in v {
        cpr[c as usize + 1] += 1;
    }
    for r in 0..width {
        cpr[r + 1] += cpr[r];
    }
    let mut col = vec![0 as Gid; v.len()];
    let mut cursor = cpr.clone();
    for (i, &c) in v.iter().enumerate() {
        col[cursor[c as usize]] = i as Gid;
        cursor[c as usize] += 1;
    }
    let mut at = GraphTopology::new();
    at.set_ij(cpr, col);
    at.set_sorted(true);
    at
}

/// Boolean matrix product `C = A * B`: row `i` of `C` is the
/// de-duplicated union of `B`'s rows named by row `i` of `A`. Used to
/// derive e.g. cell-to-cell adjacency from cell-to-face and
/// face-to-cell.
pub fn mult(a: &GraphTopology, b: &GraphTopology) -> GraphTopology {
    debug_assert!(a.is_finalized() && b.is_finalized(), "mult before finalize");
    debug_assert!(!a.is_global_id() && !b.is_global_id());
    debug_assert!(a.width() <= b.n_rows(), "inner dimensions disagree");
    let n_rows = a.n_rows();
    let width = b.width();

    // marker[c] == r+1 records that column c already entered row r
    let mut marker = vec![0usize; width];

    let mut c = GraphTopology::new();
    c.make_i(n_rows);
    for r in 0..n_rows {
        for &k in a.cols_of(r) {
            for &j in b.cols_of(k as usize) {
                if marker[j as usize] != r + 1 {
                    marker[j as usize] = r + 1;
                    c.add_a_column_in_row(r);
                }
            }
        }
    }
    c.make_j();
    marker.iter_mut().for_each(|m| *m = 0);
    for r in 0..n_rows {
        for &k in a.cols_of(r) {
            for &j in b.cols_of(k as usize) {
                if marker[j as usize] != r + 1 {
                    marker[j as usize] = r + 1;
                    c.add_connection(r, j);
                }
            }
        }
    }
    c.shift_up_i();
    c
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(g: &GraphTopology) -> Vec<Vec<Gid>> {
        (0..g.n_rows())
            .map(|r| {
                let mut v = g.cols_of(r).to_vec();
                v.sort_unstable();
                v
            })
            .collect()
    }

    #[test]
    fn transpose_swaps_axes() {
        let a = GraphTopology::from_nested(&[vec![0, 2], vec![1], vec![0]]);
        let at = transpose(&a);
        assert_eq!(at.n_rows(), 3);
        assert_eq!(rows(&at), vec![vec![0, 2], vec![1], vec![0]]);
    }

    #[test]
    fn transpose_twice_is_identity() {
        let a = GraphTopology::from_nested(&[vec![3, 1], vec![], vec![2, 0, 1]]);
        let att = transpose(&transpose(&a));
        assert_eq!(rows(&att), rows(&a));
    }

    #[test]
    fn transpose_vec_buckets_rows() {
        let at = transpose_vec(&[1, 0, 1, 1]);
        assert_eq!(rows(&at), vec![vec![1], vec![0, 2, 3]]);
    }

    #[test]
    fn product_unions_rows() {
        // cell2face: two cells sharing face 1
        let c2f = GraphTopology::from_nested(&[vec![0, 1], vec![1, 2]]);
        let f2c = transpose(&c2f);
        let c2c = mult(&c2f, &f2c);
        assert_eq!(rows(&c2c), vec![vec![0, 1], vec![0, 1]]);
    }

    #[test]
    fn product_dedups() {
        let a = GraphTopology::from_nested(&[vec![0, 1]]);
        let b = GraphTopology::from_nested(&[vec![4], vec![4]]);
        let c = mult(&a, &b);
        assert_eq!(c.nnz(), 1);
        assert_eq!(c.cols_of(0), &[4]);
    }
}
