//! Classical multidimensional scaling into two dimensions.
//!
//! Pipeline: square the distances, double-center, eigendecompose the
//! centred matrix, and scale the top two eigenvectors by √λ. The
//! eigensolver is a cyclic Jacobi rotation scheme for real symmetric
//! matrices, which is ample at the expected problem sizes (≤ 1000×1000).
//! Eigenvector signs are arbitrary, so coordinates are valid up to
//! reflection about each axis.

use crate::error::{Error, Result};
use ndarray::{Array1, Array2, Axis};

const MAX_JACOBI_SWEEPS: usize = 100;
const SYMMETRY_TOLERANCE: f64 = 1e-9;

/// A 2D embedding plus the eigenvalues that produced it.
#[derive(Debug, Clone)]
pub struct MdsEmbedding {
    /// One (x, y) coordinate per input row.
    pub coords: Vec<[f64; 2]>,
    /// The two largest eigenvalues of the double-centred matrix.
    pub eigenvalues: [f64; 2],
}

/// Classical MDS of a symmetric distance matrix with zero diagonal.
///
/// Degenerate spectra degrade gracefully: a non-positive second
/// eigenvalue zeroes the y axis, a non-positive first eigenvalue zeroes
/// everything. Non-square or non-symmetric input and eigensolver
/// non-convergence are `NumericFailure`s.
pub fn classical_mds(distances: &Array2<f64>) -> Result<MdsEmbedding> {
    let n = distances.nrows();
    if distances.ncols() != n {
        return Err(Error::numeric(format!(
            "distance matrix must be square, got {}x{}",
            n,
            distances.ncols()
        )));
    }
    for i in 0..n {
        for j in (i + 1)..n {
            let diff = (distances[[i, j]] - distances[[j, i]]).abs();
            if diff > SYMMETRY_TOLERANCE * (1.0 + distances[[i, j]].abs()) {
                return Err(Error::numeric(format!(
                    "distance matrix not symmetric at ({i},{j}): {} vs {}",
                    distances[[i, j]],
                    distances[[j, i]]
                )));
            }
        }
    }

    let centred = double_center(distances);
    let (eigenvalues, eigenvectors) = jacobi_eigen(centred)?;

    // Eigenpairs sorted by eigenvalue, descending
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| eigenvalues[b].total_cmp(&eigenvalues[a]));

    let (lambda1, lambda2) = match order.as_slice() {
        [] => (0.0, 0.0),
        [first] => (eigenvalues[*first], 0.0),
        [first, second, ..] => (eigenvalues[*first], eigenvalues[*second]),
    };

    let mut coords = vec![[0.0f64; 2]; n];
    if lambda1 > 0.0 {
        let scale1 = lambda1.sqrt();
        for (i, row) in coords.iter_mut().enumerate() {
            row[0] = eigenvectors[[i, order[0]]] * scale1;
        }
        if lambda2 > 0.0 {
            let scale2 = lambda2.sqrt();
            for (i, row) in coords.iter_mut().enumerate() {
                row[1] = eigenvectors[[i, order[1]]] * scale2;
            }
        }
    }

    Ok(MdsEmbedding {
        coords,
        eigenvalues: [lambda1, lambda2],
    })
}

/// B = −½ (D² − rowMean·𝟏ᵀ − 𝟏·colMeanᵀ + totalMean)
fn double_center(distances: &Array2<f64>) -> Array2<f64> {
    let n = distances.nrows();
    let squared = distances.mapv(|x| x * x);
    let row_means = squared
        .mean_axis(Axis(1))
        .unwrap_or_else(|| Array1::zeros(n));
    let col_means = squared
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(n));
    let total_mean = if n == 0 {
        0.0
    } else {
        squared.sum() / (n * n) as f64
    };

    Array2::from_shape_fn((n, n), |(i, j)| {
        -0.5 * (squared[[i, j]] - row_means[i] - col_means[j] + total_mean)
    })
}

/// Cyclic Jacobi eigendecomposition of a real symmetric matrix.
///
/// Returns the eigenvalues (diagonal after convergence) and the matrix
/// whose columns are the corresponding eigenvectors.
fn jacobi_eigen(mut a: Array2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
    let n = a.nrows();
    let mut v = Array2::eye(n);
    if n < 2 {
        return Ok((a.diag().to_owned(), v));
    }

    let frobenius: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let threshold = (frobenius * 1e-14).max(f64::MIN_POSITIVE);

    for _sweep in 0..MAX_JACOBI_SWEEPS {
        let off: f64 = {
            let mut sum = 0.0;
            for p in 0..n {
                for q in (p + 1)..n {
                    sum += a[[p, q]] * a[[p, q]];
                }
            }
            (2.0 * sum).sqrt()
        };
        if off <= threshold {
            return Ok((a.diag().to_owned(), v));
        }

        for p in 0..(n - 1) {
            for q in (p + 1)..n {
                let apq = a[[p, q]];
                if apq == 0.0 {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                // A ← Jᵀ A J for the (p,q) rotation
                for i in 0..n {
                    let aip = a[[i, p]];
                    let aiq = a[[i, q]];
                    a[[i, p]] = c * aip - s * aiq;
                    a[[i, q]] = s * aip + c * aiq;
                }
                for i in 0..n {
                    let api = a[[p, i]];
                    let aqi = a[[q, i]];
                    a[[p, i]] = c * api - s * aqi;
                    a[[q, i]] = s * api + c * aqi;
                }
                // V ← V J accumulates eigenvectors
                for i in 0..n {
                    let vip = v[[i, p]];
                    let viq = v[[i, q]];
                    v[[i, p]] = c * vip - s * viq;
                    v[[i, q]] = s * vip + c * viq;
                }
            }
        }
    }

    Err(Error::numeric(format!(
        "Jacobi eigendecomposition did not converge within {MAX_JACOBI_SWEEPS} sweeps"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;
    use ndarray::array;

    fn euclidean(a: [f64; 2], b: [f64; 2]) -> f64 {
        ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
    }

    #[test]
    fn jacobi_on_known_matrix() {
        // Eigenvalues of [[2,1],[1,2]] are 3 and 1
        let (vals, vecs) = jacobi_eigen(array![[2.0, 1.0], [1.0, 2.0]]).unwrap();
        let mut sorted: Vec<f64> = vals.to_vec();
        sorted.sort_by(f64::total_cmp);
        assert!(approx_eq!(f64, sorted[0], 1.0, epsilon = 1e-12));
        assert!(approx_eq!(f64, sorted[1], 3.0, epsilon = 1e-12));
        // Columns are unit vectors
        for col in 0..2 {
            let norm: f64 = (0..2).map(|i| vecs[[i, col]] * vecs[[i, col]]).sum();
            assert!(approx_eq!(f64, norm, 1.0, epsilon = 1e-12));
        }
    }

    #[test]
    fn equilateral_triangle_preserves_unit_distances() {
        let d = array![[0.0, 1.0, 1.0], [1.0, 0.0, 1.0], [1.0, 1.0, 0.0]];
        let embedding = classical_mds(&d).unwrap();
        for i in 0..3 {
            for j in (i + 1)..3 {
                let dist = euclidean(embedding.coords[i], embedding.coords[j]);
                assert!(
                    approx_eq!(f64, dist, 1.0, epsilon = 1e-9),
                    "pair ({i},{j}) embedded at distance {dist}"
                );
            }
        }
    }

    #[test]
    fn embedded_point_cloud_round_trips() {
        // A genuinely 2D cloud: its Euclidean distance matrix must be
        // reproduced exactly (up to rotation/reflection)
        let points: Vec<[f64; 2]> = vec![
            [0.0, 0.0],
            [3.0, 0.0],
            [0.0, 4.0],
            [3.0, 4.0],
            [1.5, 2.0],
        ];
        let n = points.len();
        let d = Array2::from_shape_fn((n, n), |(i, j)| euclidean(points[i], points[j]));
        let embedding = classical_mds(&d).unwrap();
        for i in 0..n {
            for j in 0..n {
                let dist = euclidean(embedding.coords[i], embedding.coords[j]);
                assert!(
                    approx_eq!(f64, dist, d[[i, j]], epsilon = 1e-9),
                    "pair ({i},{j}): embedded {dist}, expected {}",
                    d[[i, j]]
                );
            }
        }
    }

    #[test]
    fn collinear_points_zero_second_axis() {
        // Three points on a line have rank-1 structure
        let d = array![[0.0, 1.0, 2.0], [1.0, 0.0, 1.0], [2.0, 1.0, 0.0]];
        let embedding = classical_mds(&d).unwrap();
        assert!(embedding.eigenvalues[1].abs() < 1e-9);
        for row in &embedding.coords {
            assert!(row[1].abs() < 1e-6);
        }
        let dist = euclidean(embedding.coords[0], embedding.coords[2]);
        assert!(approx_eq!(f64, dist, 2.0, epsilon = 1e-9));
    }

    #[test]
    fn non_symmetric_input_is_rejected() {
        let d = array![[0.0, 1.0], [2.0, 0.0]];
        let err = classical_mds(&d).unwrap_err();
        assert!(matches!(err, Error::NumericFailure { .. }));
    }

    #[test]
    fn non_square_input_is_rejected() {
        let d = Array2::<f64>::zeros((2, 3));
        assert!(classical_mds(&d).is_err());
    }
}
