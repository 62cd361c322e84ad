use ndarray::prelude::*;
use num_traits::ToPrimitive;

use crate::error::{ErrorKind, MsError};

/// Meaning of one axis of the backing array.
///
/// `Data` axes enumerate exemplars, `Feature` axes span the per-exemplar feature vector and
/// `Dual` axes do both: their index selects an exemplar *and* is prepended to the feature
/// vector as a coordinate. The classic use of `Dual` is an image, where the pixel grid both
/// enumerates the samples and contributes the pixel position as two extra features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimType {
    Data,
    Feature,
    Dual,
}

/// Element types accepted by [`DataMatrix::set`].
///
/// Implementations convert the caller's element kind into the `f32` the rest of the pipeline
/// runs on, so everything past the initial copy is kind-agnostic.
pub trait DataValue: Copy {
    fn as_f32(self) -> f32;
}

impl DataValue for bool {
    fn as_f32(self) -> f32 {
        return if self { 1.0 } else { 0.0 };
    }
}

macro_rules! impl_data_value {
    ($($t:ty),+) => {
        $(impl DataValue for $t {
            fn as_f32(self) -> f32 {
                return self.to_f32().unwrap_or(f32::NAN);
            }
        })+
    };
}

impl_data_value!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// Presents an N-dimensional numeric array as a flat sequence of weighted feature vectors.
///
/// The view is configured by tagging every axis of the input with a [`DimType`]; exemplars are
/// unrolled in row major order over the `Data`/`Dual` axes, feature vectors over the `Dual`
/// axes followed by the `Feature` axes. One feature slot may be designated as the weight
/// channel, in which case its value replaces the default weight of 1 and the slot is removed
/// from the presented feature vector. Each feature `i` is presented multiplied by `mult[i]`,
/// the per-feature inverse bandwidth.
pub struct DataMatrix {
    flat: Vec<f32>,
    shape: Vec<usize>,
    dim_types: Vec<DimType>,
    weight_index: Option<usize>,
    mult: Vec<f32>,
    weight_scale: f32,
    feats: usize,
    exemplars: usize,
    // Decomposition plan: (length, stride, row-major divisor) per Data/Dual axis in axis
    // order, which of those are dual, and the flat offsets of the Feature-axes combinations.
    exemplar_axes: Vec<(usize, usize, usize)>,
    dual_slots: Vec<usize>,
    feat_offsets: Vec<usize>,
    prefix: Option<Vec<f32>>,
}

impl Default for DataMatrix {
    fn default() -> Self {
        return Self::new();
    }
}

impl DataMatrix {
    /// An empty view with no exemplars and no features.
    pub fn new() -> Self {
        return Self {
            flat: Vec::new(),
            shape: Vec::new(),
            dim_types: Vec::new(),
            weight_index: None,
            mult: Vec::new(),
            weight_scale: 1.0,
            feats: 0,
            exemplars: 0,
            exemplar_axes: Vec::new(),
            dual_slots: Vec::new(),
            feat_offsets: Vec::new(),
            prefix: None,
        };
    }

    /// Record a new backing array, converting its elements to `f32` and rebuilding the
    /// unrolling plan. Resets the scale to 1 in every feature and the weight scale to 1.
    ///
    /// `weight_index` addresses the feature vector *before* the weight channel is removed,
    /// so dual slots can serve as weights too.
    pub fn set<T: DataValue>(
        &mut self,
        array: ArrayViewD<'_, T>,
        dim_types: &[DimType],
        weight_index: Option<usize>,
    ) -> Result<(), MsError> {
        if dim_types.len() != array.ndim() {
            return Err(MsError::new(
                ErrorKind::ShapeError,
                format!(
                    "expected {} dimension types for an array of rank {}, found {}",
                    array.ndim(),
                    array.ndim(),
                    dim_types.len()
                ),
            ));
        }

        let shape = array.shape().to_vec();

        // Row major strides of the converted copy.
        let mut strides = vec![1usize; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }

        let mut exemplar_axes = Vec::new();
        let mut dual_slots = Vec::new();
        let mut feature_axes = Vec::new();
        for (i, dt) in dim_types.iter().enumerate() {
            match dt {
                DimType::Data => exemplar_axes.push((shape[i], strides[i], 1)),
                DimType::Dual => {
                    dual_slots.push(exemplar_axes.len());
                    exemplar_axes.push((shape[i], strides[i], 1));
                }
                DimType::Feature => feature_axes.push((shape[i], strides[i])),
            }
        }
        // Row major divisors so an exemplar index decomposes in one forward pass.
        let mut div = 1usize;
        for axis in exemplar_axes.iter_mut().rev() {
            axis.2 = div;
            div *= axis.0;
        }

        // Offsets of every Feature-axes combination, row major.
        let mut feat_offsets = vec![0usize];
        if feature_axes.is_empty() {
            feat_offsets.clear();
        } else {
            for &(len, stride) in &feature_axes {
                let mut next = Vec::with_capacity(feat_offsets.len() * len);
                for &base in &feat_offsets {
                    for j in 0..len {
                        next.push(base + j * stride);
                    }
                }
                feat_offsets = next;
            }
        }

        let raw_feats = dual_slots.len() + feat_offsets.len();
        if let Some(w) = weight_index
            && w >= raw_feats
        {
            return Err(MsError::new(
                ErrorKind::ShapeError,
                format!("weight index {w} out of range for a feature vector of length {raw_feats}"),
            ));
        }
        let feats = raw_feats - usize::from(weight_index.is_some());
        if feats == 0 {
            return Err(MsError::new(
                ErrorKind::ShapeError,
                "the dimension types leave no features in the feature vector",
            ));
        }

        self.flat = array.iter().map(|v| v.as_f32()).collect();
        self.shape = shape;
        self.dim_types = dim_types.to_vec();
        self.weight_index = weight_index;
        self.mult = vec![1.0; feats];
        self.weight_scale = 1.0;
        self.feats = feats;
        self.exemplars = exemplar_axes.iter().map(|&(len, _, _)| len).product();
        self.exemplar_axes = exemplar_axes;
        self.dual_slots = dual_slots;
        self.feat_offsets = feat_offsets;
        self.prefix = None;
        return Ok(());
    }

    /// Number of exemplars in the unrolled view.
    pub fn exemplars(&self) -> usize {
        return self.exemplars;
    }

    /// Length of the presented (post weight removal) feature vector.
    pub fn features(&self) -> usize {
        return self.feats;
    }

    /// Shape of the backing array.
    pub fn shape(&self) -> &[usize] {
        return &self.shape;
    }

    /// The dimension type of every axis of the backing array.
    pub fn dim_types(&self) -> &[DimType] {
        return &self.dim_types;
    }

    /// Index of the weight channel in the pre-removal feature vector, if one was configured.
    pub fn weight_index(&self) -> Option<usize> {
        return self.weight_index;
    }

    /// The per-feature scale (inverse bandwidth).
    pub fn mult(&self) -> &[f32] {
        return &self.mult;
    }

    /// The global multiplier applied to every exemplar weight.
    pub fn weight_scale(&self) -> f32 {
        return self.weight_scale;
    }

    /// Replace the per-feature scale and the weight scale.
    pub fn set_scale(&mut self, mult: &[f32], weight_scale: f32) -> Result<(), MsError> {
        if mult.len() != self.feats {
            return Err(MsError::new(
                ErrorKind::ShapeError,
                format!(
                    "scale vector must have one entry per feature (expected {}, found {})",
                    self.feats,
                    mult.len()
                ),
            ));
        }
        if mult.iter().any(|&m| !(m > 0.0)) || !(weight_scale > 0.0) {
            return Err(MsError::new(
                ErrorKind::ParameterError,
                "scale entries and the weight scale must be positive",
            ));
        }
        self.mult.copy_from_slice(mult);
        self.weight_scale = weight_scale;
        self.prefix = None;
        return Ok(());
    }

    /// Replace only the weight scale.
    pub fn set_weight_scale(&mut self, weight_scale: f32) -> Result<(), MsError> {
        if !(weight_scale > 0.0) {
            return Err(MsError::new(
                ErrorKind::ParameterError,
                "the weight scale must be positive",
            ));
        }
        self.weight_scale = weight_scale;
        self.prefix = None;
        return Ok(());
    }

    /// Materialise the scaled feature vector of exemplar `i` into `out` (length
    /// [`features`](Self::features)) and return its weight.
    pub fn fv_into(&self, i: usize, out: &mut [f32]) -> f32 {
        let mut base = 0usize;
        let mut weight = 1.0f32;
        let mut pos = 0usize;
        let mut slot = 0usize;

        // Decompose the exemplar index over the Data/Dual axes, row major; dual axes emit
        // their index as the leading feature slots.
        let mut duals = self.dual_slots.iter().peekable();
        for (k, &(len, stride, div)) in self.exemplar_axes.iter().enumerate() {
            let idx = (i / div) % len;
            base += idx * stride;
            if duals.peek() == Some(&&k) {
                duals.next();
                if self.weight_index == Some(slot) {
                    weight = idx as f32;
                } else {
                    out[pos] = idx as f32 * self.mult[pos];
                    pos += 1;
                }
                slot += 1;
            }
        }

        for &off in &self.feat_offsets {
            let v = self.flat[base + off];
            if self.weight_index == Some(slot) {
                weight = v;
            } else {
                out[pos] = v * self.mult[pos];
                pos += 1;
            }
            slot += 1;
        }

        return weight * self.weight_scale;
    }

    /// Convenience wrapper around [`fv_into`](Self::fv_into) that allocates.
    pub fn fv(&self, i: usize) -> (Vec<f32>, f32) {
        let mut out = vec![0.0; self.feats];
        let w = self.fv_into(i, &mut out);
        return (out, w);
    }

    /// Weighted discrete draw of an exemplar index.
    ///
    /// The cumulative weight table is built lazily on first use and dropped whenever the data
    /// or the scale changes.
    #[cfg(feature = "sample")]
    pub(crate) fn draw(&mut self, rng: &mut impl rand::Rng) -> usize {
        if self.prefix.is_none() {
            let mut scratch = vec![0.0; self.feats];
            let mut acc = 0.0f32;
            let mut prefix = Vec::with_capacity(self.exemplars);
            for i in 0..self.exemplars {
                acc += self.fv_into(i, &mut scratch);
                prefix.push(acc);
            }
            self.prefix = Some(prefix);
        }

        let prefix = self.prefix.as_ref().unwrap();
        let total = *prefix.last().unwrap_or(&0.0);
        let u = rng.random::<f32>() * total;
        let ind = prefix.partition_point(|&acc| acc <= u);
        return ind.min(self.exemplars.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::prelude::*;

    use super::{DataMatrix, DimType};
    use crate::error::ErrorKind;

    #[test]
    fn plain_matrix() {
        let data = array![[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let mut dm = DataMatrix::new();
        dm.set(data.view().into_dyn(), &[DimType::Data, DimType::Feature], None)
            .unwrap();

        assert_eq!(dm.exemplars(), 3);
        assert_eq!(dm.features(), 2);

        let (fv, w) = dm.fv(1);
        assert_relative_eq!(fv[0], 3.0);
        assert_relative_eq!(fv[1], 4.0);
        assert_relative_eq!(w, 1.0);
    }

    #[test]
    fn scaled_features() {
        let data = array![[1.0f32, 2.0], [3.0, 4.0]];
        let mut dm = DataMatrix::new();
        dm.set(data.view().into_dyn(), &[DimType::Data, DimType::Feature], None)
            .unwrap();
        dm.set_scale(&[2.0, 0.5], 3.0).unwrap();

        let (fv, w) = dm.fv(0);
        assert_relative_eq!(fv[0], 2.0);
        assert_relative_eq!(fv[1], 1.0);
        assert_relative_eq!(w, 3.0);
    }

    #[test]
    fn weight_channel() {
        let data = array![[1.0f32, 2.0, 0.25], [3.0, 4.0, 0.75]];
        let mut dm = DataMatrix::new();
        dm.set(data.view().into_dyn(), &[DimType::Data, DimType::Feature], Some(2))
            .unwrap();

        assert_eq!(dm.features(), 2);
        let (fv, w) = dm.fv(1);
        assert_eq!(fv.len(), 2);
        assert_relative_eq!(fv[1], 4.0);
        assert_relative_eq!(w, 0.75);
    }

    #[test]
    fn dual_axis_contributes_position() {
        // A 2x3 "image": the dual axis index becomes the leading feature.
        let data = array![[10.0f32, 11.0, 12.0], [20.0, 21.0, 22.0]];
        let mut dm = DataMatrix::new();
        dm.set(data.view().into_dyn(), &[DimType::Dual, DimType::Feature], None)
            .unwrap();

        assert_eq!(dm.exemplars(), 2);
        assert_eq!(dm.features(), 4);

        let (fv, _) = dm.fv(1);
        assert_relative_eq!(fv[0], 1.0);
        assert_relative_eq!(fv[1], 20.0);
        assert_relative_eq!(fv[3], 22.0);
    }

    #[test]
    fn dual_only_image() {
        // Both axes dual: every pixel is an exemplar with its own position as features.
        let data = array![[0.0f32, 1.0], [2.0, 3.0]];
        let mut dm = DataMatrix::new();
        dm.set(data.view().into_dyn(), &[DimType::Dual, DimType::Dual], None)
            .unwrap();

        assert_eq!(dm.exemplars(), 4);
        assert_eq!(dm.features(), 2);
        let (fv, _) = dm.fv(3);
        assert_relative_eq!(fv[0], 1.0);
        assert_relative_eq!(fv[1], 1.0);
    }

    #[test]
    fn integer_input_converts() {
        let data = array![[1u8, 2], [3, 4]];
        let mut dm = DataMatrix::new();
        dm.set(data.view().into_dyn(), &[DimType::Data, DimType::Feature], None)
            .unwrap();
        let (fv, _) = dm.fv(1);
        assert_relative_eq!(fv[0], 3.0);
    }

    #[test]
    fn shape_errors() {
        let data = array![[1.0f32, 2.0], [3.0, 4.0]];
        let mut dm = DataMatrix::new();

        let err = dm
            .set(data.view().into_dyn(), &[DimType::Data], None)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ShapeError);

        let err = dm
            .set(
                data.view().into_dyn(),
                &[DimType::Data, DimType::Feature],
                Some(7),
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ShapeError);

        dm.set(data.view().into_dyn(), &[DimType::Data, DimType::Feature], None)
            .unwrap();
        let err = dm.set_scale(&[1.0], 1.0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ShapeError);
        let err = dm.set_scale(&[1.0, -1.0], 1.0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParameterError);
    }

    #[cfg(feature = "sample")]
    #[test]
    fn weighted_draw_is_deterministic() {
        use crate::rng::index_rng;

        let data = array![[0.0f32, 1.0], [1.0, 10.0], [2.0, 1.0]];
        let mut dm = DataMatrix::new();
        dm.set(data.view().into_dyn(), &[DimType::Data, DimType::Feature], Some(1))
            .unwrap();

        let mut a = Vec::new();
        for i in 0..32 {
            let mut rng = index_rng(&[7, 0, i]);
            a.push(dm.draw(&mut rng));
        }
        let mut b = Vec::new();
        for i in 0..32 {
            let mut rng = index_rng(&[7, 0, i]);
            b.push(dm.draw(&mut rng));
        }
        assert_eq!(a, b);
        // The heavy middle exemplar should dominate.
        assert!(a.iter().filter(|&&i| i == 1).count() > 16);
    }
}
