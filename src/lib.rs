#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, doc(auto_cfg))]
#![allow(clippy::needless_return)]

//! `mean_shift` provides kernel density estimation with interchangeable kernels and weighed
//! data points, together with the query algorithms that share the density estimate: mean
//! shift mode seeking, clustering by converging every exemplar, projection onto local
//! density ridges (subspace constrained mean shift) and deterministic sampling, including
//! sampling from products of several estimates.
//!
//! Given a dataset $X = {x_1, \cdots, x_n}$ with weights $w_i$, the underlying probability
//! density function is estimated as a sum of *kernel* functions $K$ centered at the points of
//! the original dataset:
//! \\[ f(x) = \frac{1}{Z} \sum_{i=1}^n w_i \\, K\left(s \odot (\bm{x} - \bm{x}_i)\right), \\]
//! where $s$ is the per-feature scale vector (an inverse bandwidth, see
//! [`set_scale`](MeanShift::set_scale)) and $Z$ the constant making $f$ integrate to one.
//! All queries - density, modes, clusters, ridges, draws - run against the same estimate and
//! share its acceleration structures.
//!
//! The estimator views its data through a [`DataMatrix`]: any numeric array becomes a flat
//! sequence of weighted feature vectors by tagging each axis as [`Data`](DimType::Data),
//! [`Feature`](DimType::Feature) or [`Dual`](DimType::Dual), so an image can contribute its
//! pixel grid as features without being copied into a point list by hand.
//!
//! Everything is single threaded and deterministic: sampling is driven entirely by
//! caller-supplied index tuples, never by a global generator.

use std::sync::Arc;

use ndarray::prelude::*;

pub use balls::BallsKind;
pub use bandwidth::{Bandwidth, ScottBandwidth, SilvermanBandwidth};
pub use data::{DataMatrix, DataValue, DimType};
pub use error::{ErrorKind, MsError};
pub use kernels::{Kernel, KernelConfig};
#[cfg(feature = "sample")]
pub use sample::MultParams;
pub use spatial::SpatialKind;

use crate::balls::Balls;
use crate::spatial::Spatial;

mod balls;
mod bandwidth;
mod cluster;
mod data;
mod density;
mod error;
mod kernels;
mod linalg;
#[cfg(feature = "sample")]
mod rng;
#[cfg(feature = "sample")]
mod sample;
mod shift;
mod spatial;

/// Kernel density estimation, mean shift and clustering over one shared density estimate.
///
/// The estimator owns a [`DataMatrix`], a kernel with its configuration, and lazily built
/// acceleration structures (a spatial index for kernel sums, a balls index for cluster
/// identity). Every setter that changes the density drops the affected caches, so queries
/// always observe a consistent estimate.
///
/// Note that some kernels take the number of features into account when they are configured
/// (`fisher`, `composite`), so set the kernel after the data.
pub struct MeanShift {
    dm: DataMatrix,
    kernel: &'static dyn Kernel,
    config: Arc<KernelConfig>,
    kernel_name: Option<String>,
    spatial_kind: SpatialKind,
    balls_kind: BallsKind,
    spatial: Option<Box<dyn Spatial>>,
    balls: Option<Box<dyn Balls>>,
    weight: Option<f32>,
    norm: Option<f32>,
    /// For kernel types with an infinite domain, the fraction of probability mass kept in
    /// support - 0 for the fastest, 1 for the most exact. Ignored by finite kernels.
    pub quality: f32,
    /// Convergence threshold: iteration stops once the squared step drops below
    /// `epsilon * epsilon`.
    pub epsilon: f32,
    /// Hard limit on mean-shift iterations.
    pub iter_cap: u32,
    /// Trajectories closer than this during clustering are assumed to share a destination
    /// and collapsed.
    pub ident_dist: f32,
    /// How close two converged positions have to be to name the same cluster.
    pub merge_range: f32,
    /// Mean-shift iterations between convergence/collision checks while clustering; a
    /// runtime tradeoff only.
    pub merge_check_step: u32,
}

impl Default for MeanShift {
    fn default() -> Self {
        return Self::new();
    }
}

impl MeanShift {
    /// A fresh estimator with no data, the uniform kernel, a k-d tree spatial and a hash
    /// grid for cluster centres.
    pub fn new() -> Self {
        let (kernel, _) = kernels::by_name("uniform").expect("uniform kernel is registered");
        return Self {
            dm: DataMatrix::new(),
            kernel,
            config: Arc::new(KernelConfig::Plain),
            kernel_name: None,
            spatial_kind: SpatialKind::KdTree,
            balls_kind: BallsKind::Hash,
            spatial: None,
            balls: None,
            weight: None,
            norm: None,
            quality: 0.5,
            epsilon: 1e-3,
            iter_cap: 1024,
            ident_dist: 0.0,
            merge_range: 0.5,
            merge_check_step: 4,
        };
    }

    fn invalidate(&mut self) {
        self.spatial = None;
        self.balls = None;
        self.weight = None;
        self.norm = None;
    }

    /// Build whatever lazy state the read paths need.
    fn prepare(&mut self) {
        if self.spatial.is_none() {
            self.spatial = Some(self.spatial_kind.build(&self.dm));
        }
        if self.weight.is_none() {
            self.weight = Some(density::total_weight(&self.dm));
        }
        if self.norm.is_none() {
            self.norm = Some(density::normalising(
                &self.dm,
                self.kernel,
                &self.config,
                self.weight.expect("just prepared"),
            ));
        }
    }

    fn check_features(&self, found: usize) -> Result<(), MsError> {
        if found != self.dm.features() {
            return Err(MsError::new(
                ErrorKind::ShapeError,
                format!(
                    "input vector length {found} does not match the {} features of the data",
                    self.dm.features()
                ),
            ));
        }
        return Ok(());
    }

    /// Shape of the per-exemplar outputs: the non-feature axes of the backing array.
    fn exemplar_shape(&self) -> Vec<usize> {
        return self
            .dm
            .shape()
            .iter()
            .zip(self.dm.dim_types())
            .filter(|(_, dt)| **dt != DimType::Feature)
            .map(|(&s, _)| s)
            .collect();
    }
}

// Kernel, spatial and balls management.
impl MeanShift {
    /// The names of every registered kernel.
    pub fn kernels() -> Vec<&'static str> {
        return kernels::KERNELS.iter().map(|k| k.name()).collect();
    }

    /// The names of every registered spatial acceleration structure.
    pub fn spatials() -> Vec<&'static str> {
        return SpatialKind::ALL.iter().map(|k| k.name()).collect();
    }

    /// The names of every registered cluster-centre (balls) structure.
    pub fn balls() -> Vec<&'static str> {
        return BallsKind::ALL.iter().map(|k| k.name()).collect();
    }

    /// Human readable description of a kernel, spatial or balls name.
    pub fn info(name: &str) -> Result<&'static str, MsError> {
        if let Some(kernel) = kernels::KERNELS.iter().find(|k| k.name() == name) {
            return Ok(kernel.description());
        }
        if let Ok(kind) = SpatialKind::by_name(name) {
            return Ok(kind.description());
        }
        if let Ok(kind) = BallsKind::by_name(name) {
            return Ok(kind.description());
        }
        return Err(MsError::new(
            ErrorKind::UnknownName,
            format!("`{name}` does not name a registered kernel, spatial or balls structure"),
        ));
    }

    /// The parameter template of a kernel, or `None` for kernels without configuration.
    pub fn info_config(name: &str) -> Result<Option<&'static str>, MsError> {
        return kernels::KERNELS
            .iter()
            .find(|k| k.name() == name)
            .map(|k| k.configuration())
            .ok_or_else(|| {
                MsError::new(
                    ErrorKind::UnknownName,
                    format!("`{name}` does not name a registered kernel"),
                )
            });
    }

    /// The specification string of the current kernel, parameters included.
    pub fn get_kernel(&self) -> &str {
        return self.kernel_name.as_deref().unwrap_or(self.kernel.name());
    }

    /// Set the kernel from a specification string, e.g. `"gaussian"` or `"fisher(48.0)"`.
    pub fn set_kernel(&mut self, spec: &str) -> Result<(), MsError> {
        let (kernel, suffix) = kernels::by_name(spec)?;
        let config = kernel.config_new(self.dm.features(), suffix)?;
        self.kernel = kernel;
        self.config = config;
        self.kernel_name = kernel.configuration().map(|_| spec.to_string());
        self.invalidate();
        return Ok(());
    }

    /// Share the kernel of another estimator, configuration handle included.
    ///
    /// Much cheaper than [`set_kernel`](Self::set_kernel) when many estimators use the same
    /// configured kernel, as precomputed tables are shared rather than rebuilt.
    pub fn copy_kernel(&mut self, other: &MeanShift) {
        self.kernel = other.kernel;
        self.config = Arc::clone(&other.config);
        self.kernel_name = other.kernel_name.clone();
        self.norm = None;
    }

    /// The name of the current spatial structure.
    pub fn get_spatial(&self) -> &'static str {
        return self.spatial_kind.name();
    }

    /// Set the spatial structure by name; it is rebuilt lazily on the next query.
    pub fn set_spatial(&mut self, name: &str) -> Result<(), MsError> {
        self.spatial_kind = SpatialKind::by_name(name)?;
        self.spatial = None;
        return Ok(());
    }

    /// The name of the current balls structure.
    pub fn get_balls(&self) -> &'static str {
        return self.balls_kind.name();
    }

    /// Set the balls structure by name; any existing clustering is dropped.
    pub fn set_balls(&mut self, name: &str) -> Result<(), MsError> {
        self.balls_kind = BallsKind::by_name(name)?;
        self.balls = None;
        return Ok(());
    }
}

// Data access and scaling.
impl MeanShift {
    /// Set the backing data: any numeric array plus one [`DimType`] per axis, optionally
    /// naming one feature slot as the weight channel. Resets the scale and drops every
    /// cache.
    pub fn set_data<T: DataValue>(
        &mut self,
        array: ArrayViewD<'_, T>,
        dim_types: &[DimType],
        weight_index: Option<usize>,
    ) -> Result<(), MsError> {
        self.dm.set(array, dim_types, weight_index)?;
        self.invalidate();
        return Ok(());
    }

    /// The dimension type of every axis of the backing array.
    pub fn dim_types(&self) -> &[DimType] {
        return self.dm.dim_types();
    }

    /// Index of the weight channel, if one was configured.
    pub fn weight_index(&self) -> Option<usize> {
        return self.dm.weight_index();
    }

    /// Number of exemplars in the estimate.
    pub fn exemplars(&self) -> usize {
        return self.dm.exemplars();
    }

    /// Number of features per exemplar.
    pub fn features(&self) -> usize {
        return self.dm.features();
    }

    /// The per-feature scale vector (inverse bandwidth).
    pub fn scale(&self) -> &[f32] {
        return self.dm.mult();
    }

    /// The multiplier applied to every exemplar weight.
    pub fn weight_scale(&self) -> f32 {
        return self.dm.weight_scale();
    }

    /// Set the per-feature scale and the weight scale. Drops every cache.
    pub fn set_scale(&mut self, mult: &[f32], weight_scale: f32) -> Result<(), MsError> {
        self.dm.set_scale(mult, weight_scale)?;
        self.invalidate();
        return Ok(());
    }

    /// Set only the weight scale. Drops every cache.
    pub fn set_weight_scale(&mut self, weight_scale: f32) -> Result<(), MsError> {
        self.dm.set_weight_scale(weight_scale)?;
        self.invalidate();
        return Ok(());
    }

    /// Total weight of the data, cached lazily.
    pub fn weight(&mut self) -> f32 {
        if self.weight.is_none() {
            self.weight = Some(density::total_weight(&self.dm));
        }
        return self.weight.expect("just computed");
    }

    /// Per-feature mean and standard deviation of the data, in unscaled units.
    pub fn stats(&self) -> (Array1<f32>, Array1<f32>) {
        let (mut mean, mut sd, _) = bandwidth::weighted_stats(&self.dm);
        for (j, &m) in self.dm.mult().iter().enumerate() {
            mean[j] /= m;
            sd[j] /= m;
        }
        return (Array1::from_vec(mean), Array1::from_vec(sd));
    }

    fn set_scale_rule<B: Bandwidth>(&mut self) -> Result<(), MsError> {
        let feats = self.dm.features();
        // Work from unit scale so the deviations are in raw units.
        self.dm.set_scale(&vec![1.0; feats], self.dm.weight_scale())?;
        let (_, sd, weight) = bandwidth::weighted_stats(&self.dm);
        let factor = B::factor(weight, feats);
        let mult: Vec<f32> = sd.iter().map(|&s| (s.max(1e-6) * factor).recip()).collect();
        self.dm.set_scale(&mult, self.dm.weight_scale())?;
        self.invalidate();
        return Ok(());
    }

    /// Set the scale with Silverman's rule of thumb applied per feature.
    ///
    /// The rule assumes Gaussian kernels over roughly Gaussian data; treat the result as a
    /// starting point, not an answer.
    pub fn scale_silverman(&mut self) -> Result<(), MsError> {
        return self.set_scale_rule::<SilvermanBandwidth>();
    }

    /// Set the scale with Scott's rule applied per feature. Same caveats as
    /// [`scale_silverman`](Self::scale_silverman).
    pub fn scale_scott(&mut self) -> Result<(), MsError> {
        return self.set_scale_rule::<ScottBandwidth>();
    }
}

// Density queries.
impl MeanShift {
    /// Density of the estimate at a point. Can legitimately be zero.
    pub fn prob(&mut self, q: &[f32]) -> Result<f32, MsError> {
        self.check_features(q.len())?;
        self.prepare();
        let spatial = self.spatial.as_deref().expect("prepared");
        let scaled: Vec<f32> = q.iter().zip(self.dm.mult()).map(|(&x, &m)| x * m).collect();
        return Ok(density::prob(
            spatial,
            self.kernel,
            &self.config,
            &scaled,
            self.norm.expect("prepared"),
            self.quality,
        ));
    }

    /// Density at every row of a matrix of points.
    pub fn probs(&mut self, x: ArrayView2<'_, f32>) -> Result<Array1<f32>, MsError> {
        self.check_features(x.dim().1)?;
        self.prepare();
        let spatial = self.spatial.as_deref().expect("prepared");
        let norm = self.norm.expect("prepared");
        let mut out = Array1::zeros(x.dim().0);
        let mut scaled = vec![0.0f32; x.dim().1];
        for (row, o) in x.rows().into_iter().zip(out.iter_mut()) {
            for (s, (&v, &m)) in scaled.iter_mut().zip(row.iter().zip(self.dm.mult())) {
                *s = v * m;
            }
            *o = density::prob(spatial, self.kernel, &self.config, &scaled, norm, self.quality);
        }
        return Ok(out);
    }

    /// Leave-one-out negative log likelihood of the estimate, for model comparison between
    /// kernels or scales. `limit` floors each per-exemplar probability so isolated outliers
    /// cannot dominate; 1e-16 is a reasonable default.
    pub fn loo_nll(&mut self, limit: f32) -> Result<f32, MsError> {
        if !(limit > 0.0) {
            return Err(MsError::new(
                ErrorKind::ParameterError,
                "the probability floor must be positive",
            ));
        }
        self.prepare();
        let spatial = self.spatial.as_deref().expect("prepared");
        return Ok(density::loo_nll(
            spatial,
            self.kernel,
            &self.config,
            self.norm.expect("prepared"),
            self.quality,
            limit,
            self.weight.expect("prepared"),
        ));
    }
}

// Mode seeking and ridge projection.
impl MeanShift {
    fn scaled_query(&self, q: &[f32]) -> Vec<f32> {
        return q.iter().zip(self.dm.mult()).map(|(&x, &m)| x * m).collect();
    }

    fn unscale_in_place(&self, q: &mut [f32]) {
        for (x, &m) in q.iter_mut().zip(self.dm.mult()) {
            *x /= m;
        }
    }

    /// The mode reached by mean shift from `q`: the maximum of the density uphill of it.
    pub fn mode(&mut self, q: &[f32]) -> Result<Array1<f32>, MsError> {
        self.check_features(q.len())?;
        self.prepare();
        let spatial = self.spatial.as_deref().expect("prepared");
        let mut pos = self.scaled_query(q);
        shift::mode(
            spatial,
            self.kernel,
            &self.config,
            self.quality,
            self.epsilon,
            self.iter_cap,
            &mut pos,
        );
        self.unscale_in_place(&mut pos);
        return Ok(Array1::from_vec(pos));
    }

    /// The mode of every row of a matrix of points.
    pub fn modes(&mut self, x: ArrayView2<'_, f32>) -> Result<Array2<f32>, MsError> {
        self.check_features(x.dim().1)?;
        self.prepare();
        let spatial = self.spatial.as_deref().expect("prepared");
        let mut out = Array2::zeros(x.raw_dim());
        let mut pos = vec![0.0f32; x.dim().1];
        for (row, mut o) in x.rows().into_iter().zip(out.rows_mut()) {
            for (p, (&v, &m)) in pos.iter_mut().zip(row.iter().zip(self.dm.mult())) {
                *p = v * m;
            }
            shift::mode(
                spatial,
                self.kernel,
                &self.config,
                self.quality,
                self.epsilon,
                self.iter_cap,
                &mut pos,
            );
            for (o, (&p, &m)) in o.iter_mut().zip(pos.iter().zip(self.dm.mult())) {
                *o = p / m;
            }
        }
        return Ok(out);
    }

    /// The mode of every exemplar of the data, shaped like the backing array without its
    /// feature axes plus a trailing feature axis.
    ///
    /// The output contains heavy duplication by construction; prefer
    /// [`cluster`](Self::cluster) unless the per-exemplar trajectory endpoints are needed.
    pub fn modes_data(&mut self) -> Result<ArrayD<f32>, MsError> {
        self.prepare();
        let spatial = self.spatial.as_deref().expect("prepared");
        let feats = self.dm.features();
        let mut flat = Array2::zeros((self.dm.exemplars(), feats));

        let mut pos = vec![0.0f32; feats];
        for (i, mut row) in flat.rows_mut().into_iter().enumerate() {
            self.dm.fv_into(i, &mut pos);
            shift::mode(
                spatial,
                self.kernel,
                &self.config,
                self.quality,
                self.epsilon,
                self.iter_cap,
                &mut pos,
            );
            for (o, (&p, &m)) in row.iter_mut().zip(pos.iter().zip(self.dm.mult())) {
                *o = p / m;
            }
        }

        let mut shape = self.exemplar_shape();
        shape.push(feats);
        return Ok(flat
            .into_shape_with_order(IxDyn(&shape))
            .expect("shape matches the exemplar count"));
    }

    /// Project `q` onto the local density ridge of dimension `degrees` with subspace
    /// constrained mean shift.
    ///
    /// With `always_hessian` the curvature is re-estimated every iteration (correct); without
    /// it the eigenbasis of the starting point is reused, which is faster but only right for
    /// data that is already close to the ridge.
    pub fn manifold(
        &mut self,
        q: &[f32],
        degrees: usize,
        always_hessian: bool,
    ) -> Result<Array1<f32>, MsError> {
        self.check_features(q.len())?;
        self.prepare();
        let spatial = self.spatial.as_deref().expect("prepared");
        let mut pos = self.scaled_query(q);
        shift::manifold(
            spatial,
            self.kernel,
            &self.config,
            degrees,
            self.quality,
            self.epsilon,
            self.iter_cap,
            always_hessian,
            &mut pos,
        )?;
        self.unscale_in_place(&mut pos);
        return Ok(Array1::from_vec(pos));
    }

    /// [`manifold`](Self::manifold) applied to every row of a matrix of points.
    pub fn manifolds(
        &mut self,
        x: ArrayView2<'_, f32>,
        degrees: usize,
        always_hessian: bool,
    ) -> Result<Array2<f32>, MsError> {
        self.check_features(x.dim().1)?;
        self.prepare();
        let spatial = self.spatial.as_deref().expect("prepared");
        let mut out = Array2::zeros(x.raw_dim());
        let mut pos = vec![0.0f32; x.dim().1];
        for (row, mut o) in x.rows().into_iter().zip(out.rows_mut()) {
            for (p, (&v, &m)) in pos.iter_mut().zip(row.iter().zip(self.dm.mult())) {
                *p = v * m;
            }
            shift::manifold(
                spatial,
                self.kernel,
                &self.config,
                degrees,
                self.quality,
                self.epsilon,
                self.iter_cap,
                always_hessian,
                &mut pos,
            )?;
            for (o, (&p, &m)) in o.iter_mut().zip(pos.iter().zip(self.dm.mult())) {
                *o = p / m;
            }
        }
        return Ok(out);
    }

    /// [`manifold`](Self::manifold) applied to every exemplar of the data, shaped like
    /// [`modes_data`](Self::modes_data).
    pub fn manifolds_data(
        &mut self,
        degrees: usize,
        always_hessian: bool,
    ) -> Result<ArrayD<f32>, MsError> {
        self.prepare();
        let spatial = self.spatial.as_deref().expect("prepared");
        let feats = self.dm.features();
        let mut flat = Array2::zeros((self.dm.exemplars(), feats));

        let mut pos = vec![0.0f32; feats];
        for (i, mut row) in flat.rows_mut().into_iter().enumerate() {
            self.dm.fv_into(i, &mut pos);
            shift::manifold(
                spatial,
                self.kernel,
                &self.config,
                degrees,
                self.quality,
                self.epsilon,
                self.iter_cap,
                always_hessian,
                &mut pos,
            )?;
            for (o, (&p, &m)) in row.iter_mut().zip(pos.iter().zip(self.dm.mult())) {
                *o = p / m;
            }
        }

        let mut shape = self.exemplar_shape();
        shape.push(feats);
        return Ok(flat
            .into_shape_with_order(IxDyn(&shape))
            .expect("shape matches the exemplar count"));
    }
}

// Clustering.
impl MeanShift {
    /// Cluster the exemplars: run mean shift from every one and merge the converged
    /// positions through the balls structure.
    ///
    /// Returns the modes (one row per cluster, unscaled) and the cluster id of every
    /// exemplar, shaped like the backing array without its feature axes. Ids are only stable
    /// until the next call.
    pub fn cluster(&mut self) -> Result<(Array2<f32>, ArrayD<i32>), MsError> {
        self.prepare();
        let spatial = self.spatial.as_deref().expect("prepared");
        let feats = self.dm.features();

        let mut balls = self.balls_kind.build(feats, self.merge_range);
        let mut assignments = vec![-1i32; self.dm.exemplars()];
        cluster::cluster(
            spatial,
            self.kernel,
            &self.config,
            balls.as_mut(),
            &mut assignments,
            self.quality,
            self.epsilon,
            self.iter_cap,
            self.ident_dist,
            self.merge_range,
            self.merge_check_step,
        );

        let mut modes = Array2::zeros((balls.count(), feats));
        for id in 0..balls.count() {
            for (j, (&p, &m)) in balls.pos(id).iter().zip(self.dm.mult()).enumerate() {
                modes[[id, j]] = p / m;
            }
        }
        self.balls = Some(balls);

        let index = ArrayD::from_shape_vec(IxDyn(&self.exemplar_shape()), assignments)
            .expect("shape matches the exemplar count");
        return Ok((modes, index));
    }

    /// Cluster id of a query point against the clustering of the last
    /// [`cluster`](Self::cluster) call, or -1 when its mode is not within
    /// [`merge_range`](Self::merge_range) of any cluster.
    pub fn assign_cluster(&mut self, q: &[f32]) -> Result<i32, MsError> {
        self.check_features(q.len())?;
        if self.balls.is_none() {
            return Err(MsError::new(
                ErrorKind::StateError,
                "cluster must run before assign_cluster",
            ));
        }
        self.prepare();
        let spatial = self.spatial.as_deref().expect("prepared");
        let balls = self.balls.as_deref().expect("checked above");
        let mut pos = self.scaled_query(q);
        return Ok(cluster::assign_cluster(
            spatial,
            self.kernel,
            &self.config,
            balls,
            &mut pos,
            self.quality,
            self.epsilon,
            self.iter_cap,
            self.merge_range,
            self.merge_check_step,
        ));
    }

    /// [`assign_cluster`](Self::assign_cluster) for every row of a matrix of points.
    pub fn assign_clusters(&mut self, x: ArrayView2<'_, f32>) -> Result<Array1<i32>, MsError> {
        self.check_features(x.dim().1)?;
        if self.balls.is_none() {
            return Err(MsError::new(
                ErrorKind::StateError,
                "cluster must run before assign_clusters",
            ));
        }
        self.prepare();
        let spatial = self.spatial.as_deref().expect("prepared");
        let balls = self.balls.as_deref().expect("checked above");
        let mut out = Array1::zeros(x.dim().0);
        let mut pos = vec![0.0f32; x.dim().1];
        for (row, o) in x.rows().into_iter().zip(out.iter_mut()) {
            for (p, (&v, &m)) in pos.iter_mut().zip(row.iter().zip(self.dm.mult())) {
                *p = v * m;
            }
            *o = cluster::assign_cluster(
                spatial,
                self.kernel,
                &self.config,
                balls,
                &mut pos,
                self.quality,
                self.epsilon,
                self.iter_cap,
                self.merge_range,
                self.merge_check_step,
            );
        }
        return Ok(out);
    }
}

// Deterministic sampling.
#[cfg(feature = "sample")]
impl MeanShift {
    /// One draw from the estimate, fully determined by the three index words. Iterate the
    /// last word for a sequence.
    pub fn draw(&mut self, index: [u32; 3]) -> Array1<f32> {
        let mut out = vec![0.0f32; self.dm.features()];
        sample::draw(&mut self.dm, self.kernel, &self.config, &index, &mut out);
        return Array1::from_vec(out);
    }

    /// `n` draws from the estimate, one row each; row `i` equals
    /// [`draw`](Self::draw) with index `[index[0], index[1], i]`.
    pub fn draws(&mut self, n: usize, index: [u32; 2]) -> Array2<f32> {
        let feats = self.dm.features();
        let mut out = Array2::zeros((n, feats));
        let mut row = vec![0.0f32; feats];
        for i in 0..n {
            sample::draw(
                &mut self.dm,
                self.kernel,
                &self.config,
                &[index[0], index[1], i as u32],
                &mut row,
            );
            out.row_mut(i).as_slice_mut().expect("standard layout").copy_from_slice(&row);
        }
        return out;
    }

    /// `n` bootstrap draws: like [`draws`](Self::draws) with a Dirac kernel, so every row is
    /// one of the exemplars, picked by weight.
    pub fn bootstrap(&mut self, n: usize, index: [u32; 3]) -> Array2<f32> {
        return sample::bootstrap(&mut self.dm, &index, n);
    }

    /// Draw `n` points from the product of the given estimates' densities.
    ///
    /// The product of mixtures is itself a mixture with one component per combination of the
    /// terms' exemplars; a Gibbs sampler walks that grid one slot at a time instead of
    /// enumerating it. Gaussian kernels use closed-form conditionals and draws; any other
    /// kernel falls back to Monte-Carlo integration (`params.mci`) and Metropolis-Hastings
    /// for the emitted point (`params.mh`). A single term degenerates to
    /// [`draws`](Self::draws).
    pub fn mult(
        terms: &mut [&mut MeanShift],
        n: usize,
        params: &MultParams,
    ) -> Result<Array2<f32>, MsError> {
        if terms.is_empty() {
            return Err(MsError::new(
                ErrorKind::ParameterError,
                "need at least one estimate to multiply",
            ));
        }
        if params.gibbs < 1 || params.mci < 1 || params.mh < 1 {
            return Err(MsError::new(
                ErrorKind::ParameterError,
                "gibbs, mci and mh counts must all be at least 1",
            ));
        }
        if params.fake > 2 {
            return Err(MsError::new(
                ErrorKind::ParameterError,
                "fake must be 0 (draw), 1 (mode) or 2 (centre average)",
            ));
        }
        let feats = terms[0].features();
        for term in terms.iter() {
            if term.features() != feats {
                return Err(MsError::new(
                    ErrorKind::ShapeError,
                    "every multiplied estimate must have the same number of features",
                ));
            }
            if term.exemplars() == 0 {
                return Err(MsError::new(
                    ErrorKind::StateError,
                    "every multiplied estimate needs data",
                ));
            }
        }

        if terms.len() == 1 {
            return Ok(terms[0].draws(n, params.rng));
        }

        let flattened: Vec<sample::MultTerm<'_>> = terms
            .iter()
            .map(|term| {
                let e = term.exemplars();
                let mut centres = Array2::zeros((e, feats));
                let mut weights = vec![0.0f32; e];
                let mut fv = vec![0.0f32; feats];
                for i in 0..e {
                    weights[i] = term.dm.fv_into(i, &mut fv);
                    for (j, &m) in term.dm.mult().iter().enumerate() {
                        centres[[i, j]] = fv[j] / m;
                    }
                }
                sample::MultTerm {
                    kernel: term.kernel,
                    config: term.config.as_ref(),
                    centres,
                    weights,
                    mult: term.dm.mult().to_vec(),
                }
            })
            .collect();

        return Ok(sample::mult_draws(&flattened, n, params));
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::prelude::*;

    use super::*;

    fn line_estimator() -> MeanShift {
        let data = array![[0.0f32], [1.0], [2.0], [3.0]];
        let mut ms = MeanShift::new();
        ms.set_data(data.view().into_dyn(), &[DimType::Data, DimType::Feature], None)
            .unwrap();
        ms.set_kernel("gaussian").unwrap();
        return ms;
    }

    #[test]
    fn registries_and_info() {
        assert!(MeanShift::kernels().contains(&"gaussian"));
        assert!(MeanShift::spatials().contains(&"kd_tree"));
        assert!(MeanShift::balls().contains(&"hash"));

        assert!(MeanShift::info("fisher").unwrap().contains("directional"));
        assert!(MeanShift::info("kd_tree").is_ok());
        assert!(MeanShift::info("hash").is_ok());
        assert_eq!(
            MeanShift::info("nope").unwrap_err().kind,
            ErrorKind::UnknownName
        );

        assert!(MeanShift::info_config("gaussian").unwrap().is_none());
        assert!(MeanShift::info_config("fisher").unwrap().is_some());
    }

    #[test]
    fn kernel_name_round_trip() {
        let data = Array2::from_shape_fn((8, 3), |(i, j)| ((i + j) % 5) as f32);
        let mut ms = MeanShift::new();
        ms.set_data(data.view().into_dyn(), &[DimType::Data, DimType::Feature], None)
            .unwrap();

        assert_eq!(ms.get_kernel(), "uniform");
        ms.set_kernel("gaussian").unwrap();
        assert_eq!(ms.get_kernel(), "gaussian");
        ms.set_kernel("fisher(12.5)").unwrap();
        assert_eq!(ms.get_kernel(), "fisher(12.5)");

        assert_eq!(
            ms.set_kernel("warp").unwrap_err().kind,
            ErrorKind::UnknownName
        );
        assert_eq!(
            ms.set_kernel("fisher(x)").unwrap_err().kind,
            ErrorKind::ConfigError
        );
    }

    #[test]
    fn copy_kernel_shares_the_config() {
        let mut a = line_estimator();
        a.set_kernel("cauchy").unwrap();
        let mut b = line_estimator();
        b.copy_kernel(&a);
        assert_eq!(b.get_kernel(), "cauchy");
        // Both estimates now agree everywhere.
        assert_relative_eq!(
            a.prob(&[0.7]).unwrap(),
            b.prob(&[0.7]).unwrap(),
            epsilon = 1e-6
        );
    }

    #[test]
    fn cache_coherence_across_setters() {
        let mut ms = line_estimator();
        let before = ms.prob(&[1.5]).unwrap();

        // An invalidating setter followed by the same configuration must reproduce the
        // result of a fresh estimator.
        ms.set_scale(&[2.0], 1.0).unwrap();
        let scaled = ms.prob(&[1.5]).unwrap();
        assert!((scaled - before).abs() > 1e-6);

        ms.set_scale(&[1.0], 1.0).unwrap();
        assert_relative_eq!(ms.prob(&[1.5]).unwrap(), before, epsilon = 1e-6);

        let mut fresh = line_estimator();
        assert_relative_eq!(fresh.prob(&[1.5]).unwrap(), before, epsilon = 1e-6);
    }

    #[test]
    fn spatial_swap_is_invisible() {
        let mut ms = line_estimator();
        ms.quality = 0.999;
        let p = ms.prob(&[1.2]).unwrap();
        let m = ms.mode(&[1.2]).unwrap();

        ms.set_spatial("brute_force").unwrap();
        assert_eq!(ms.get_spatial(), "brute_force");
        assert_relative_eq!(ms.prob(&[1.2]).unwrap(), p, epsilon = 1e-6);
        assert_relative_eq!(ms.mode(&[1.2]).unwrap()[0], m[0], epsilon = 1e-5);
    }

    #[test]
    fn stats_and_weight_respect_the_weight_channel() {
        let data = array![[0.0f32, 1.0], [4.0, 3.0]];
        let mut ms = MeanShift::new();
        ms.set_data(
            data.view().into_dyn(),
            &[DimType::Data, DimType::Feature],
            Some(1),
        )
        .unwrap();

        assert_eq!(ms.features(), 1);
        assert_relative_eq!(ms.weight(), 4.0);
        let (mean, sd) = ms.stats();
        // Weighted mean 3, weighted sd sqrt(3).
        assert_relative_eq!(mean[0], 3.0, epsilon = 1e-5);
        assert_relative_eq!(sd[0], 3.0f32.sqrt(), epsilon = 1e-5);
    }

    #[test]
    fn silverman_matches_the_closed_form() {
        // sd 1 per feature by construction: points at +-1 in both features.
        let data = array![[1.0f32, -1.0], [-1.0, 1.0], [1.0, 1.0], [-1.0, -1.0]];
        let mut ms = MeanShift::new();
        ms.set_data(data.view().into_dyn(), &[DimType::Data, DimType::Feature], None)
            .unwrap();

        ms.scale_silverman().unwrap();
        let c = (4.0f32 * (2.0 + 2.0) / 4.0).powf(-1.0 / 6.0);
        for &m in ms.scale() {
            assert_relative_eq!(m, c.recip(), epsilon = 1e-5);
        }

        ms.scale_scott().unwrap();
        let c = 4.0f32.powf(-1.0 / 6.0);
        for &m in ms.scale() {
            assert_relative_eq!(m, c.recip(), epsilon = 1e-5);
        }
    }

    #[test]
    fn cluster_shapes_follow_the_data_axes() {
        // A 4x5 grid of dual axes: 20 exemplars of 2 features each.
        let data = Array2::from_shape_fn((4, 5), |(i, j)| (i * 5 + j) as f32);
        let mut ms = MeanShift::new();
        ms.set_data(data.view().into_dyn(), &[DimType::Dual, DimType::Dual], None)
            .unwrap();
        ms.set_kernel("gaussian").unwrap();
        ms.merge_range = 5.0;

        let (modes, index) = ms.cluster().unwrap();
        assert_eq!(index.shape(), &[4, 5]);
        assert_eq!(modes.dim().1, 2);
        assert!(index.iter().all(|&c| c >= 0 && (c as usize) < modes.dim().0));

        let shaped = ms.modes_data().unwrap();
        assert_eq!(shaped.shape(), &[4, 5, 2]);
    }

    #[test]
    fn assign_cluster_needs_a_clustering() {
        let mut ms = line_estimator();
        assert_eq!(
            ms.assign_cluster(&[0.5]).unwrap_err().kind,
            ErrorKind::StateError
        );

        ms.merge_range = 0.5;
        ms.cluster().unwrap();
        let id = ms.assign_cluster(&[1.4]).unwrap();
        assert!(id >= 0);
        assert_eq!(ms.assign_cluster(&[500.0]).unwrap(), -1);

        let ids = ms
            .assign_clusters(array![[1.4f32], [500.0]].view())
            .unwrap();
        assert_eq!(ids[0], id);
        assert_eq!(ids[1], -1);
    }

    #[test]
    fn shape_mismatches_are_rejected() {
        let mut ms = line_estimator();
        assert_eq!(
            ms.prob(&[1.0, 2.0]).unwrap_err().kind,
            ErrorKind::ShapeError
        );
        assert_eq!(ms.mode(&[]).unwrap_err().kind, ErrorKind::ShapeError);
        assert_eq!(
            ms.probs(array![[1.0f32, 2.0]].view()).unwrap_err().kind,
            ErrorKind::ShapeError
        );
    }

    #[cfg(feature = "sample")]
    #[test]
    fn draws_match_single_draws() {
        let mut ms = line_estimator();
        let all = ms.draws(4, [5, 6]);
        for i in 0..4 {
            let one = ms.draw([5, 6, i as u32]);
            assert_eq!(all.row(i), one.view());
        }
    }

    #[cfg(feature = "sample")]
    #[test]
    fn mult_with_one_term_is_a_plain_draw() {
        let mut ms = line_estimator();
        let expect = ms.draws(6, [3, 9]);

        let mut ms2 = line_estimator();
        let params = MultParams {
            rng: [3, 9],
            ..Default::default()
        };
        let got = MeanShift::mult(&mut [&mut ms2], 6, &params).unwrap();
        assert_eq!(got, expect);
    }

    #[cfg(feature = "sample")]
    #[test]
    fn mult_validates_its_parameters() {
        let mut a = line_estimator();
        let mut b = line_estimator();

        let params = MultParams {
            gibbs: 0,
            ..Default::default()
        };
        assert_eq!(
            MeanShift::mult(&mut [&mut a, &mut b], 1, &params)
                .unwrap_err()
                .kind,
            ErrorKind::ParameterError
        );

        let params = MultParams {
            fake: 3,
            ..Default::default()
        };
        assert_eq!(
            MeanShift::mult(&mut [&mut a, &mut b], 1, &params)
                .unwrap_err()
                .kind,
            ErrorKind::ParameterError
        );

        assert_eq!(
            MeanShift::mult(&mut [], 1, &MultParams::default())
                .unwrap_err()
                .kind,
            ErrorKind::ParameterError
        );
    }

    #[cfg(feature = "sample")]
    #[test]
    fn product_of_gaussian_estimates_tightens() {
        // Scenario: the product of two identical KDEs has less spread than either term.
        let data = array![[0.0f32], [0.1], [-0.1]];
        let mut a = MeanShift::new();
        a.set_data(data.view().into_dyn(), &[DimType::Data, DimType::Feature], None)
            .unwrap();
        a.set_kernel("gaussian").unwrap();
        let mut b = MeanShift::new();
        b.set_data(data.view().into_dyn(), &[DimType::Data, DimType::Feature], None)
            .unwrap();
        b.set_kernel("gaussian").unwrap();

        let n = 3000;
        let single = a.draws(n, [1, 1]);
        let params = MultParams {
            rng: [1, 1],
            ..Default::default()
        };
        let product = MeanShift::mult(&mut [&mut a, &mut b], n, &params).unwrap();

        let var = |m: &Array2<f32>| {
            let mean: f32 = m.iter().sum::<f32>() / n as f32;
            m.iter().map(|&x| (x - mean) * (x - mean)).sum::<f32>() / n as f32
        };
        let v_single = var(&single);
        let v_product = var(&product);
        // Product of two unit-bandwidth kernels behaves like one of bandwidth 1/sqrt(2).
        assert_relative_eq!(v_product / v_single, 0.5, epsilon = 0.1);
    }
}
