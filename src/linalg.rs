//! Symmetric eigen-decomposition is in principle already provided for `ndarray` via the
//! `ndarray-linalg` crate. However, that crate uses LAPACK/BLAS for high-performance
//! implementations, which carries several dependencies. The matrices decomposed here are
//! feature-count sized (a handful of rows), so the classic cyclic Jacobi iteration is
//! reimplemented instead.

use ndarray::prelude::*;

/// Eigen-decomposition of a symmetric matrix by cyclic Jacobi rotations.
///
/// Returns the eigenvalues in ascending order and the matching eigenvectors as the columns of
/// the returned matrix.
pub(crate) fn jacobi_eigen(m: ArrayView2<f32>) -> (Vec<f32>, Array2<f32>) {
    let n = m.dim().0;
    let mut a = m.to_owned();
    let mut v = Array2::eye(n);

    for _sweep in 0..64 {
        let mut off = 0.0f32;
        for p in 0..n {
            for q in (p + 1)..n {
                off += a[[p, q]] * a[[p, q]];
            }
        }
        if off <= 1e-18 * n as f32 {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                if a[[p, q]].abs() <= 1e-20 {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * a[[p, q]]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = (t * t + 1.0).sqrt().recip();
                let s = t * c;

                for k in 0..n {
                    let akp = a[[k, p]];
                    let akq = a[[k, q]];
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[[p, k]];
                    let aqk = a[[q, k]];
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    // Sort the eigenpairs ascending.
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| {
        a[[i, i]]
            .partial_cmp(&a[[j, j]])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let values: Vec<f32> = order.iter().map(|&i| a[[i, i]]).collect();
    let mut vectors = Array2::zeros((n, n));
    for (to, &from) in order.iter().enumerate() {
        vectors.column_mut(to).assign(&v.column(from));
    }
    return (values, vectors);
}
