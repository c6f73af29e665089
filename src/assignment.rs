//! Optimal linear assignment (Kuhn–Munkres with potentials).
//!
//! Solves min-cost assignment on a dense `rows × cols` matrix in O(n²m), assigning
//! exactly `min(rows, cols)` pairs. Rectangular inputs with more rows than columns
//! are solved on the transpose.

use nalgebra::DMatrix;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AssignmentError {
    #[error("cost matrix has a non-finite entry at ({row}, {col})")]
    NonFinite { row: usize, col: usize },
}

/// Minimum-cost assignment. Returns `(row, col)` pairs sorted by row.
pub fn min_cost_assignment(cost: &DMatrix<f64>) -> Result<Vec<(usize, usize)>, AssignmentError> {
    let (rows, cols) = cost.shape();
    if rows == 0 || cols == 0 {
        return Ok(Vec::new());
    }
    for col in 0..cols {
        for row in 0..rows {
            if !cost[(row, col)].is_finite() {
                return Err(AssignmentError::NonFinite { row, col });
            }
        }
    }

    if rows > cols {
        let mut pairs: Vec<(usize, usize)> = solve_wide(&cost.transpose())
            .into_iter()
            .map(|(c, r)| (r, c))
            .collect();
        pairs.sort_unstable();
        return Ok(pairs);
    }
    Ok(solve_wide(cost))
}

/// Maximum-weight assignment, solved as min-cost on the negated matrix.
pub fn max_weight_assignment(
    weights: &DMatrix<f64>,
) -> Result<Vec<(usize, usize)>, AssignmentError> {
    min_cost_assignment(&weights.map(|w| -w))
}

/// Requires `rows <= cols`. Indices in the potentials are 1-based; slot 0 is the
/// virtual column used to grow each augmenting path.
fn solve_wide(cost: &DMatrix<f64>) -> Vec<(usize, usize)> {
    let (n, m) = cost.shape();
    debug_assert!(n <= m);

    let mut u = vec![0.0_f64; n + 1];
    let mut v = vec![0.0_f64; m + 1];
    // owner[j] = 1-based row matched to column j (0 = free)
    let mut owner = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        owner[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];

        loop {
            used[j0] = true;
            let i0 = owner[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;

            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let reduced = cost[(i0 - 1, j - 1)] - u[i0] - v[j];
                if reduced < minv[j] {
                    minv[j] = reduced;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }

            for j in 0..=m {
                if used[j] {
                    u[owner[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }

            j0 = j1;
            if owner[j0] == 0 {
                break;
            }
        }

        // Flip the augmenting path back to the virtual column.
        loop {
            let j1 = way[j0];
            owner[j0] = owner[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut pairs: Vec<(usize, usize)> = (1..=m)
        .filter(|&j| owner[j] != 0)
        .map(|j| (owner[j] - 1, j - 1))
        .collect();
    pairs.sort_unstable();
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total(cost: &DMatrix<f64>, pairs: &[(usize, usize)]) -> f64 {
        pairs.iter().map(|&(r, c)| cost[(r, c)]).sum()
    }

    /// Exhaustive optimum over injective row→column maps (rows <= cols).
    fn brute_force_min(cost: &DMatrix<f64>) -> f64 {
        fn go(cost: &DMatrix<f64>, row: usize, used: &mut Vec<bool>) -> f64 {
            if row == cost.nrows() {
                return 0.0;
            }
            let mut best = f64::INFINITY;
            for col in 0..cost.ncols() {
                if used[col] {
                    continue;
                }
                used[col] = true;
                best = best.min(cost[(row, col)] + go(cost, row + 1, used));
                used[col] = false;
            }
            best
        }
        go(cost, 0, &mut vec![false; cost.ncols()])
    }

    #[test]
    fn beats_greedy_on_classic_trap() {
        // Greedy takes (0,0)=1 then is forced into (1,1)=100.
        let cost = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 100.0]);
        let pairs = min_cost_assignment(&cost).unwrap();
        assert_eq!(pairs, vec![(0, 1), (1, 0)]);
        assert_eq!(total(&cost, &pairs), 4.0);
    }

    #[test]
    fn matches_brute_force_on_fixed_matrices() {
        let cases = [
            DMatrix::from_row_slice(
                3,
                3,
                &[4.0, 1.0, 3.0, 2.0, 0.0, 5.0, 3.0, 2.0, 2.0],
            ),
            DMatrix::from_row_slice(
                3,
                4,
                &[9.0, 2.0, 7.0, 8.0, 6.0, 4.0, 3.0, 7.0, 5.0, 8.0, 1.0, 8.0],
            ),
            DMatrix::from_row_slice(
                4,
                4,
                &[
                    -0.9, -0.01, -0.5, -0.3, -0.2, -0.8, -0.1, -0.4, -0.7, -0.6, -0.95, -0.05,
                    -0.33, -0.66, -0.25, -0.99,
                ],
            ),
        ];
        for cost in cases {
            let pairs = min_cost_assignment(&cost).unwrap();
            assert_eq!(pairs.len(), cost.nrows().min(cost.ncols()));
            assert!((total(&cost, &pairs) - brute_force_min(&cost)).abs() < 1e-9);
        }
    }

    #[test]
    fn tall_matrix_assigns_every_column_once() {
        let cost = DMatrix::from_row_slice(3, 2, &[5.0, 1.0, 1.0, 5.0, 0.5, 0.5]);
        let pairs = min_cost_assignment(&cost).unwrap();
        assert_eq!(pairs.len(), 2);
        let mut cols: Vec<_> = pairs.iter().map(|p| p.1).collect();
        cols.sort_unstable();
        assert_eq!(cols, vec![0, 1]);
        assert!((total(&cost, &pairs) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn max_weight_prefers_larger_total() {
        let weights = DMatrix::from_row_slice(2, 3, &[0.9, 0.8, 0.01, 0.85, 0.1, 0.01]);
        let pairs = max_weight_assignment(&weights).unwrap();
        assert_eq!(pairs, vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn empty_and_non_finite_inputs() {
        assert!(min_cost_assignment(&DMatrix::zeros(0, 3)).unwrap().is_empty());
        let bad = DMatrix::from_row_slice(1, 2, &[0.0, f64::NAN]);
        assert_eq!(
            min_cost_assignment(&bad),
            Err(AssignmentError::NonFinite { row: 0, col: 1 })
        );
    }
}
