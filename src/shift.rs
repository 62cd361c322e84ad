//! The iterative drivers: plain mean shift towards a mode, and subspace-constrained mean
//! shift towards a local density ridge.

use ndarray::prelude::*;

use crate::density::weighted_mean;
use crate::error::{ErrorKind, MsError};
use crate::kernels::{Kernel, KernelConfig};
use crate::linalg::jacobi_eigen;
use crate::spatial::Spatial;

/// Converge `q` onto the mode uphill from it: iterate [`weighted_mean`] until the squared
/// step drops below `epsilon^2` or `iter_cap` iterations have run. A step with no exemplar in
/// kernel support terminates at the current position.
pub(crate) fn mode(
    spatial: &dyn Spatial,
    kernel: &dyn Kernel,
    config: &KernelConfig,
    quality: f32,
    epsilon: f32,
    iter_cap: u32,
    q: &mut [f32],
) {
    let eps_sq = epsilon * epsilon;
    let mut scratch = vec![0.0f32; q.len()];
    for _ in 0..iter_cap {
        match weighted_mean(spatial, kernel, config, quality, q, &mut scratch) {
            Some(step_sq) if step_sq >= eps_sq => {}
            _ => break,
        }
    }
}

/// Project `q` onto the local density ridge of dimension `degrees` by subspace-constrained
/// mean shift.
///
/// Every iteration assembles the gradient and Hessian of the log density from the kernel's
/// radial profile, eigen-decomposes the Hessian and restricts the mean-shift update to the
/// span of the `F - degrees` eigenvectors with the most negative eigenvalues. With
/// `always_hessian` false the eigenbasis is computed once at the seed and reused - cheaper,
/// but only correct where the ridge is close to flat.
///
/// Kernels whose radial profile carries no curvature (uniform) leave the Hessian empty; the
/// constraint subspace is then arbitrary and the projection is not meaningful.
#[allow(clippy::too_many_arguments)]
pub(crate) fn manifold(
    spatial: &dyn Spatial,
    kernel: &dyn Kernel,
    config: &KernelConfig,
    degrees: usize,
    quality: f32,
    epsilon: f32,
    iter_cap: u32,
    always_hessian: bool,
    q: &mut [f32],
) -> Result<(), MsError> {
    let feats = spatial.features();
    if kernel.profile(config, feats, 0.0).is_none() {
        return Err(MsError::new(
            ErrorKind::ConfigError,
            format!(
                "kernel `{}` has no radial profile to build the ridge Hessian from",
                kernel.name()
            ),
        ));
    }
    if degrees >= feats {
        return Err(MsError::new(
            ErrorKind::ParameterError,
            format!("ridge dimension {degrees} must be below the feature count {feats}"),
        ));
    }

    let keep = feats - degrees;
    let eps_sq = epsilon * epsilon;

    let mut delta = vec![0.0f32; feats];
    let mut mean = vec![0.0f32; feats];
    let mut grad = vec![0.0f32; feats];
    let mut update = vec![0.0f32; feats];
    let mut projected = vec![0.0f32; feats];
    let mut hess = Array2::<f32>::zeros((feats, feats));
    let mut basis: Option<Array2<f32>> = None;

    for iter in 0..iter_cap {
        let mut den = 0.0f32;
        mean.fill(0.0);
        grad.fill(0.0);
        hess.fill(0.0);

        spatial.query(q, kernel, config, quality, &mut |_, pos, w| {
            let mut r2 = 0.0f32;
            for (d, (a, b)) in delta.iter_mut().zip(q.iter().zip(pos)) {
                *d = a - b;
                r2 += *d * *d;
            }
            let Some((f, f1, f2)) = kernel.profile(config, feats, r2) else {
                return;
            };
            if f <= 0.0 && f1 == 0.0 && f2 == 0.0 {
                return;
            }
            den += w * f;
            for (m, &x) in mean.iter_mut().zip(pos) {
                *m += w * f * x;
            }
            for j in 0..feats {
                grad[j] += 2.0 * w * f1 * delta[j];
                hess[[j, j]] += 2.0 * w * f1;
                for k in 0..feats {
                    hess[[j, k]] += 4.0 * w * f2 * delta[j] * delta[k];
                }
            }
        });

        if den <= 0.0 {
            // No support here; terminal, like the plain driver.
            return Ok(());
        }

        // Hessian of the log density; normalisation constants cancel.
        for j in 0..feats {
            for k in 0..feats {
                hess[[j, k]] = hess[[j, k]] / den - grad[j] * grad[k] / (den * den);
            }
        }

        if always_hessian || iter == 0 {
            let (_, vectors) = jacobi_eigen(hess.view());
            basis = Some(vectors.slice(s![.., ..keep]).to_owned());
        }
        let basis = basis.as_ref().expect("set on the first iteration");

        // Project the mean-shift update onto the constrained subspace.
        for (u, (&m, &x)) in update.iter_mut().zip(mean.iter().zip(q.iter())) {
            *u = m / den - x;
        }
        let mut step_sq = 0.0f32;
        projected.fill(0.0);
        for col in 0..keep {
            let dot: f32 = (0..feats).map(|j| basis[[j, col]] * update[j]).sum();
            for j in 0..feats {
                projected[j] += dot * basis[[j, col]];
            }
        }
        for (x, p) in q.iter_mut().zip(&projected) {
            *x += p;
            step_sq += p * p;
        }
        kernel.offset(config, q);

        if step_sq < eps_sq {
            break;
        }
    }
    return Ok(());
}
