//! Density evaluation primitives shared by the façade, the mean-shift drivers and the
//! clusterer: total weight, normalising constant, probability, leave-one-out negative log
//! likelihood and the weighted-mean step.

use crate::data::DataMatrix;
use crate::kernels::{Kernel, KernelConfig};
use crate::spatial::Spatial;

/// Total weight of the dataset, including the weight scale.
pub(crate) fn total_weight(dm: &DataMatrix) -> f32 {
    let mut fv = vec![0.0; dm.features()];
    return (0..dm.exemplars()).map(|i| dm.fv_into(i, &mut fv)).sum();
}

/// The constant Z that turns the raw kernel sum into a density over the unscaled space:
/// Z = W * prod_j(1 / mult[j]) * integral of the kernel.
pub(crate) fn normalising(
    dm: &DataMatrix,
    kernel: &dyn Kernel,
    config: &KernelConfig,
    weight: f32,
) -> f32 {
    let mult_prod: f32 = dm.mult().iter().product();
    return weight * kernel.norm(config, dm.features()) / mult_prod;
}

/// KDE density at `q` (in scaled space), using the spatial to prune the kernel sum.
pub(crate) fn prob(
    spatial: &dyn Spatial,
    kernel: &dyn Kernel,
    config: &KernelConfig,
    q: &[f32],
    norm: f32,
    quality: f32,
) -> f32 {
    let feats = spatial.features();
    let mut delta = vec![0.0f32; feats];
    let mut acc = 0.0f32;
    spatial.query(q, kernel, config, quality, &mut |_, pos, w| {
        for (d, (a, b)) in delta.iter_mut().zip(q.iter().zip(pos)) {
            *d = a - b;
        }
        acc += w * kernel.weight(config, feats, &delta);
    });
    return acc / norm;
}

/// Leave-one-out negative log likelihood, weight averaged over the exemplars.
///
/// The self term is excluded inside the visitor rather than subtracted afterwards, so the
/// result stays exact when the remaining probability is many orders of magnitude below the
/// self contribution. `limit` floors every per-exemplar probability before the log.
pub(crate) fn loo_nll(
    spatial: &dyn Spatial,
    kernel: &dyn Kernel,
    config: &KernelConfig,
    norm: f32,
    quality: f32,
    limit: f32,
    weight: f32,
) -> f32 {
    let feats = spatial.features();
    let mut delta = vec![0.0f32; feats];
    let mut nll = 0.0f32;

    for j in 0..spatial.exemplars() {
        let q = spatial.position(j).to_vec();
        let mut acc = 0.0f32;
        spatial.query(&q, kernel, config, quality, &mut |i, pos, w| {
            if i == j {
                return;
            }
            for (d, (a, b)) in delta.iter_mut().zip(q.iter().zip(pos)) {
                *d = a - b;
            }
            acc += w * kernel.weight(config, feats, &delta);
        });
        let p = (acc / norm).max(limit);
        nll -= spatial.weight(j) * p.ln();
    }

    return nll / weight.max(1e-6);
}

/// One mean-shift step: replace `q` with the kernel-weighted mean of the exemplars around it
/// and return the squared step length. `None` when no exemplar is inside the kernel support,
/// which the drivers treat as a terminal state at the current `q`.
pub(crate) fn weighted_mean(
    spatial: &dyn Spatial,
    kernel: &dyn Kernel,
    config: &KernelConfig,
    quality: f32,
    q: &mut [f32],
    scratch: &mut [f32],
) -> Option<f32> {
    let feats = spatial.features();
    let mut delta = vec![0.0f32; feats];
    let mut den = 0.0f32;
    scratch.fill(0.0);

    spatial.query(q, kernel, config, quality, &mut |_, pos, w| {
        for (d, (a, b)) in delta.iter_mut().zip(q.iter().zip(pos)) {
            *d = a - b;
        }
        let k = w * kernel.weight(config, feats, &delta);
        if k > 0.0 {
            den += k;
            for (s, &x) in scratch.iter_mut().zip(pos) {
                *s += k * x;
            }
        }
    });

    if den <= 0.0 {
        return None;
    }

    for s in scratch.iter_mut() {
        *s /= den;
    }
    kernel.offset(config, scratch);

    let step_sq: f32 = q
        .iter()
        .zip(scratch.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum();
    q.copy_from_slice(scratch);
    return Some(step_sq);
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::prelude::*;

    use super::*;
    use crate::data::{DataMatrix, DimType};
    use crate::kernels::by_name;
    use crate::spatial::SpatialKind;

    fn single_point() -> DataMatrix {
        let data = array![[2.0f32, 3.0]];
        let mut dm = DataMatrix::new();
        dm.set(data.view().into_dyn(), &[DimType::Data, DimType::Feature], None)
            .unwrap();
        return dm;
    }

    #[test]
    fn uniform_single_exemplar() {
        let dm = single_point();
        let spatial = SpatialKind::KdTree.build(&dm);
        let (kernel, _) = by_name("uniform").unwrap();
        let config = kernel.config_new(2, "").unwrap();

        let w = total_weight(&dm);
        assert_relative_eq!(w, 1.0);
        let norm = normalising(&dm, kernel, &config, w);

        // A single uniform kernel of radius 1: density 1/pi inside, 0 outside.
        let p = prob(spatial.as_ref(), kernel, &config, &[2.0, 3.0], norm, 1.0);
        assert_relative_eq!(p, 1.0 / std::f32::consts::PI, epsilon = 1e-6);
        let p = prob(spatial.as_ref(), kernel, &config, &[5.0, 5.0], norm, 1.0);
        assert_relative_eq!(p, 0.0);
    }

    #[test]
    fn gaussian_mass_on_grid() {
        // Two weighted exemplars; quadrature over a wide grid should give unit mass.
        let joined = array![[0.0f32, 0.5, 1.0], [1.5, 2.0, 3.0]];
        let mut dm = DataMatrix::new();
        dm.set(
            joined.view().into_dyn(),
            &[DimType::Data, DimType::Feature],
            Some(2),
        )
        .unwrap();

        let spatial = SpatialKind::BruteForce.build(&dm);
        let (kernel, _) = by_name("gaussian").unwrap();
        let config = kernel.config_new(2, "").unwrap();
        let w = total_weight(&dm);
        assert_relative_eq!(w, 4.0);
        let norm = normalising(&dm, kernel, &config, w);

        let steps = 160;
        let span = 16.0f32;
        let cell = span / steps as f32;
        let mut mass = 0.0f64;
        for i in 0..steps {
            for j in 0..steps {
                let q = [
                    -span / 2.0 + 1.0 + (i as f32 + 0.5) * cell,
                    -span / 2.0 + 1.0 + (j as f32 + 0.5) * cell,
                ];
                mass +=
                    prob(spatial.as_ref(), kernel, &config, &q, norm, 1.0) as f64;
            }
        }
        mass *= (cell * cell) as f64;
        assert_relative_eq!(mass, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn scaled_density_keeps_unit_mass() {
        // One exemplar with anisotropic scale: the density is over the unscaled space.
        let dm = {
            let data = array![[0.0f32]];
            let mut dm = DataMatrix::new();
            dm.set(data.view().into_dyn(), &[DimType::Data, DimType::Feature], None)
                .unwrap();
            dm.set_scale(&[4.0], 1.0).unwrap();
            dm
        };
        let spatial = SpatialKind::BruteForce.build(&dm);
        let (kernel, _) = by_name("uniform").unwrap();
        let config = kernel.config_new(1, "").unwrap();
        let norm = normalising(&dm, kernel, &config, total_weight(&dm));

        // Support is |x * 4| < 1, i.e. a quarter of the unit interval each side.
        let inside = prob(spatial.as_ref(), kernel, &config, &[0.5], norm, 1.0);
        assert_relative_eq!(inside, 2.0, epsilon = 1e-5);
        let outside = prob(spatial.as_ref(), kernel, &config, &[1.5], norm, 1.0);
        assert_relative_eq!(outside, 0.0);
    }

    #[test]
    fn weighted_mean_steps_towards_the_data() {
        let data = array![[0.0f32, 0.0], [0.2, 0.0], [0.4, 0.0]];
        let mut dm = DataMatrix::new();
        dm.set(data.view().into_dyn(), &[DimType::Data, DimType::Feature], None)
            .unwrap();
        let spatial = SpatialKind::KdTree.build(&dm);
        let (kernel, _) = by_name("gaussian").unwrap();
        let config = kernel.config_new(2, "").unwrap();

        let mut q = [1.0f32, 0.5];
        let mut scratch = [0.0f32; 2];
        let step =
            weighted_mean(spatial.as_ref(), kernel, &config, 0.9, &mut q, &mut scratch).unwrap();
        assert!(step > 0.0);
        assert!(q[0] < 1.0 && q[1] < 0.5);
    }

    #[test]
    fn empty_kernel_is_terminal() {
        let dm = single_point();
        let spatial = SpatialKind::KdTree.build(&dm);
        let (kernel, _) = by_name("uniform").unwrap();
        let config = kernel.config_new(2, "").unwrap();

        let mut q = [50.0f32, 50.0];
        let mut scratch = [0.0f32; 2];
        assert!(
            weighted_mean(spatial.as_ref(), kernel, &config, 1.0, &mut q, &mut scratch).is_none()
        );
        assert_eq!(q, [50.0, 50.0]);
    }

    #[test]
    fn loo_nll_applies_the_floor() {
        // Two isolated exemplars with a finite kernel: the leave-one-out density is 0, so
        // the floor drives the whole result.
        let data = array![[0.0f32, 0.0], [10.0, 10.0]];
        let mut dm = DataMatrix::new();
        dm.set(data.view().into_dyn(), &[DimType::Data, DimType::Feature], None)
            .unwrap();
        let spatial = SpatialKind::KdTree.build(&dm);
        let (kernel, _) = by_name("uniform").unwrap();
        let config = kernel.config_new(2, "").unwrap();
        let w = total_weight(&dm);
        let norm = normalising(&dm, kernel, &config, w);

        let limit = 1e-16f32;
        let nll = loo_nll(spatial.as_ref(), kernel, &config, norm, 1.0, limit, w);
        assert_relative_eq!(nll, -limit.ln(), epsilon = 1e-3);
    }

    #[test]
    fn spatial_kind_does_not_change_prob() {
        let data = Array2::from_shape_fn((40, 2), |(i, j)| {
            ((i * 13 + j * 7) % 17) as f32 / 4.0
        });
        let mut dm = DataMatrix::new();
        dm.set(data.view().into_dyn(), &[DimType::Data, DimType::Feature], None)
            .unwrap();
        let (kernel, _) = by_name("gaussian").unwrap();
        let config = kernel.config_new(2, "").unwrap();
        let w = total_weight(&dm);
        let norm = normalising(&dm, kernel, &config, w);

        let brute = SpatialKind::BruteForce.build(&dm);
        let tree = SpatialKind::KdTree.build(&dm);
        for q in [[0.0f32, 0.0], [1.2, 2.3], [4.0, 0.5]] {
            let a = prob(brute.as_ref(), kernel, &config, &q, norm, 0.999);
            let b = prob(tree.as_ref(), kernel, &config, &q, norm, 0.999);
            assert_relative_eq!(a, b, epsilon = 1e-5);
        }
    }
}
