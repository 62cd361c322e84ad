use crate::data::DataMatrix;

/// General trait to customize the selection of the scalar bandwidth factor $c$.
///
/// The factor is combined with the per-feature standard deviation to produce the scale
/// (inverse bandwidth) vector: `mult[i] = 1 / (sd[i] * c)`.
pub trait Bandwidth {
    fn factor(weight: f32, features: usize) -> f32;
}

/// Select the scalar bandwidth factor according to Scott's rule.
///
/// Scott's rule calculates the scalar bandwidth factor according to
/// \\[ c = W^{-\frac{1}{d+4}}, \\]
/// where $d$ is the number of features and $W$ the total weight of the dataset.
pub struct ScottBandwidth {}

impl Bandwidth for ScottBandwidth {
    fn factor(weight: f32, features: usize) -> f32 {
        return weight.powf(-((features as f32 + 4.0).recip()));
    }
}

/// Select the scalar bandwidth factor according to Silverman's rule of thumb.
///
/// Silverman's rule of thumb calculates the scalar bandwidth factor according to
/// \\[ c = \left(\frac{d+2}{4} \\, W\right)^{-\frac{1}{d+4}}, \\]
/// where $d$ is the number of features and $W$ the total weight of the dataset.
pub struct SilvermanBandwidth {}

impl Bandwidth for SilvermanBandwidth {
    fn factor(weight: f32, features: usize) -> f32 {
        return (0.25 * weight * (features as f32 + 2.0)).powf(-((features as f32 + 4.0).recip()));
    }
}

/// Weighted mean and standard deviation of every feature in a single pass, plus the total
/// weight. Values are in the scaled space the [`DataMatrix`] presents.
///
/// Uses the weighted Welford recurrence, so one walk over the exemplars suffices and large
/// offsets do not cancel catastrophically.
pub(crate) fn weighted_stats(dm: &DataMatrix) -> (Vec<f32>, Vec<f32>, f32) {
    let feats = dm.features();
    let mut mean = vec![0.0f32; feats];
    let mut var = vec![0.0f32; feats];
    let mut fv = vec![0.0f32; feats];

    let mut total = 0.0f32;
    for i in 0..dm.exemplars() {
        let w = dm.fv_into(i, &mut fv);
        let new_total = total + w;
        for j in 0..feats {
            let delta = fv[j] - mean[j];
            let r = delta * w / new_total;
            mean[j] += r;
            var[j] += total * delta * r;
        }
        total = new_total;
    }

    // Safety floor, for when every weight is 0.
    let denom = total.max(1e-6);
    for v in var.iter_mut() {
        *v = (*v / denom).sqrt();
    }

    return (mean, var, total);
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::prelude::*;

    use super::{Bandwidth, ScottBandwidth, SilvermanBandwidth, weighted_stats};
    use crate::data::{DataMatrix, DimType};

    fn matrix(data: ArrayView2<'_, f32>, weights: Option<&[f32]>) -> DataMatrix {
        let mut dm = DataMatrix::new();
        match weights {
            None => {
                dm.set(data.into_dyn(), &[DimType::Data, DimType::Feature], None)
                    .unwrap();
            }
            Some(w) => {
                let mut joined = Array2::zeros((data.dim().0, data.dim().1 + 1));
                joined.slice_mut(s![.., ..data.dim().1]).assign(&data);
                for (i, &wi) in w.iter().enumerate() {
                    joined[[i, data.dim().1]] = wi;
                }
                dm.set(
                    joined.view().into_dyn(),
                    &[DimType::Data, DimType::Feature],
                    Some(data.dim().1),
                )
                .unwrap();
            }
        }
        return dm;
    }

    #[test]
    fn stats_match_two_pass() {
        let data = array![
            [0.5634880f32, 2.0],
            [0.4459816, -1.0],
            [0.7438671, 0.5],
            [0.1234567, 1.5]
        ];
        let w = [0.25f32, 1.5, 0.75, 1.0];
        let dm = matrix(data.view(), Some(&w));

        let (mean, sd, total) = weighted_stats(&dm);

        let wsum: f32 = w.iter().sum();
        assert_relative_eq!(total, wsum, epsilon = 1e-5);
        for j in 0..2 {
            let m: f32 = data
                .index_axis(Axis(1), j)
                .iter()
                .zip(&w)
                .map(|(x, wi)| x * wi)
                .sum::<f32>()
                / wsum;
            let v: f32 = data
                .index_axis(Axis(1), j)
                .iter()
                .zip(&w)
                .map(|(x, wi)| wi * (x - m) * (x - m))
                .sum::<f32>()
                / wsum;
            assert_relative_eq!(mean[j], m, epsilon = 1e-5);
            assert_relative_eq!(sd[j], v.sqrt(), epsilon = 1e-5);
        }
    }

    #[test]
    fn scott_factor() {
        assert_relative_eq!(
            ScottBandwidth::factor(100.0, 2),
            100.0f32.powf(-1.0 / 6.0),
            epsilon = 1e-6
        );
    }

    #[test]
    fn silverman_factor() {
        assert_relative_eq!(
            SilvermanBandwidth::factor(100.0, 2),
            100.0f32.powf(-1.0 / 6.0),
            epsilon = 1e-6
        );
        assert_relative_eq!(
            SilvermanBandwidth::factor(64.0, 4),
            (64.0f32 * 1.5).powf(-1.0 / 8.0),
            epsilon = 1e-6
        );
    }
}
