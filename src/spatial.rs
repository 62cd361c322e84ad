//! Spatial acceleration structures for the weighted kernel sums.
//!
//! A spatial snapshots the scaled exemplars of a [`DataMatrix`] and answers range queries
//! around arbitrary points: every exemplar whose kernel value at the query can be nonzero
//! (finite kernels) or above the quality-derived cutoff (infinite kernels) is visited.
//! Over-enumeration is allowed, dropping a contributing exemplar is not. The façade rebuilds
//! the spatial whenever the data or the scale changes.

use ndarray::prelude::*;

use crate::data::DataMatrix;
use crate::error::{ErrorKind, MsError};
use crate::kernels::{Kernel, KernelConfig};

pub trait Spatial {
    fn exemplars(&self) -> usize;
    fn features(&self) -> usize;
    fn position(&self, i: usize) -> &[f32];
    fn weight(&self, i: usize) -> f32;

    /// Visit `(index, position, weight)` of every exemplar that can contribute at `q` for the
    /// given kernel and quality. Visitation order is unspecified.
    fn query(
        &self,
        q: &[f32],
        kernel: &dyn Kernel,
        config: &KernelConfig,
        quality: f32,
        visit: &mut dyn FnMut(usize, &[f32], f32),
    );
}

fn dist_sq(a: &[f32], b: &[f32]) -> f32 {
    return a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
}

/// Snapshot shared by every spatial variant.
struct Snapshot {
    positions: Array2<f32>,
    weights: Vec<f32>,
}

impl Snapshot {
    fn build(dm: &DataMatrix) -> Self {
        let (e, f) = (dm.exemplars(), dm.features());
        let mut positions = Array2::zeros((e, f));
        let mut weights = vec![0.0; e];
        let mut fv = vec![0.0; f];
        for i in 0..e {
            weights[i] = dm.fv_into(i, &mut fv);
            positions.row_mut(i).as_slice_mut().unwrap().copy_from_slice(&fv);
        }
        return Self { positions, weights };
    }

    fn row(&self, i: usize) -> &[f32] {
        return self.positions.row(i).to_slice().unwrap();
    }
}

/// No acceleration at all; visits every exemplar.
pub struct BruteForce {
    snap: Snapshot,
}

impl BruteForce {
    fn build(dm: &DataMatrix) -> Self {
        return Self {
            snap: Snapshot::build(dm),
        };
    }
}

impl Spatial for BruteForce {
    fn exemplars(&self) -> usize {
        return self.snap.weights.len();
    }

    fn features(&self) -> usize {
        return self.snap.positions.dim().1;
    }

    fn position(&self, i: usize) -> &[f32] {
        return self.snap.row(i);
    }

    fn weight(&self, i: usize) -> f32 {
        return self.snap.weights[i];
    }

    fn query(
        &self,
        _q: &[f32],
        _kernel: &dyn Kernel,
        _config: &KernelConfig,
        _quality: f32,
        visit: &mut dyn FnMut(usize, &[f32], f32),
    ) {
        for i in 0..self.snap.weights.len() {
            visit(i, self.snap.row(i), self.snap.weights[i]);
        }
    }
}

const LEAF_SIZE: usize = 8;

struct KdNode {
    lo: Vec<f32>,
    hi: Vec<f32>,
    start: usize,
    end: usize,
    // Index of the left child in the arena; the right child follows the whole left subtree.
    children: Option<(usize, usize)>,
}

/// Axis-aligned k-d tree with median splits; prunes boxes against the kernel range.
pub struct KdTree {
    snap: Snapshot,
    order: Vec<usize>,
    nodes: Vec<KdNode>,
}

impl KdTree {
    fn build(dm: &DataMatrix) -> Self {
        let snap = Snapshot::build(dm);
        let e = snap.weights.len();
        let mut order: Vec<usize> = (0..e).collect();
        let mut nodes = Vec::new();
        if e > 0 {
            Self::split(&snap, &mut order, 0, e, &mut nodes);
        }
        return Self { snap, order, nodes };
    }

    fn bounds(snap: &Snapshot, order: &[usize], start: usize, end: usize) -> (Vec<f32>, Vec<f32>) {
        let f = snap.positions.dim().1;
        let mut lo = vec![f32::INFINITY; f];
        let mut hi = vec![f32::NEG_INFINITY; f];
        for &i in &order[start..end] {
            for (j, &v) in snap.row(i).iter().enumerate() {
                lo[j] = lo[j].min(v);
                hi[j] = hi[j].max(v);
            }
        }
        return (lo, hi);
    }

    fn split(
        snap: &Snapshot,
        order: &mut [usize],
        start: usize,
        end: usize,
        nodes: &mut Vec<KdNode>,
    ) -> usize {
        let (lo, hi) = Self::bounds(snap, order, start, end);
        let this = nodes.len();
        nodes.push(KdNode {
            lo,
            hi,
            start,
            end,
            children: None,
        });

        if end - start > LEAF_SIZE {
            // Split on the widest axis at the median.
            let node = &nodes[this];
            let axis = (0..snap.positions.dim().1)
                .max_by(|&a, &b| {
                    let wa = node.hi[a] - node.lo[a];
                    let wb = node.hi[b] - node.lo[b];
                    wa.partial_cmp(&wb).unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or(0);
            if nodes[this].hi[axis] > nodes[this].lo[axis] {
                let mid = (end - start) / 2;
                order[start..end].select_nth_unstable_by(mid, |&a, &b| {
                    snap.positions[[a, axis]]
                        .partial_cmp(&snap.positions[[b, axis]])
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                let left = Self::split(snap, order, start, start + mid, nodes);
                let right = Self::split(snap, order, start + mid, end, nodes);
                nodes[this].children = Some((left, right));
            }
        }
        return this;
    }

    fn min_dist_sq(node: &KdNode, q: &[f32]) -> f32 {
        let mut acc = 0.0f32;
        for (j, &x) in q.iter().enumerate() {
            let d = (node.lo[j] - x).max(x - node.hi[j]).max(0.0);
            acc += d * d;
        }
        return acc;
    }
}

impl Spatial for KdTree {
    fn exemplars(&self) -> usize {
        return self.snap.weights.len();
    }

    fn features(&self) -> usize {
        return self.snap.positions.dim().1;
    }

    fn position(&self, i: usize) -> &[f32] {
        return self.snap.row(i);
    }

    fn weight(&self, i: usize) -> f32 {
        return self.snap.weights[i];
    }

    fn query(
        &self,
        q: &[f32],
        kernel: &dyn Kernel,
        config: &KernelConfig,
        quality: f32,
        visit: &mut dyn FnMut(usize, &[f32], f32),
    ) {
        if self.nodes.is_empty() {
            return;
        }
        let range = kernel.range(config, self.features(), quality);
        let range_sq = range * range;

        let mut stack = vec![0usize];
        while let Some(at) = stack.pop() {
            let node = &self.nodes[at];
            if Self::min_dist_sq(node, q) > range_sq {
                continue;
            }
            match node.children {
                Some((left, right)) => {
                    stack.push(right);
                    stack.push(left);
                }
                None => {
                    for &i in &self.order[node.start..node.end] {
                        let pos = self.snap.row(i);
                        if dist_sq(pos, q) <= range_sq {
                            visit(i, pos, self.snap.weights[i]);
                        }
                    }
                }
            }
        }
    }
}

/// The registered spatial variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialKind {
    BruteForce,
    KdTree,
}

impl SpatialKind {
    pub(crate) const ALL: [SpatialKind; 2] = [SpatialKind::BruteForce, SpatialKind::KdTree];

    pub fn name(&self) -> &'static str {
        return match self {
            SpatialKind::BruteForce => "brute_force",
            SpatialKind::KdTree => "kd_tree",
        };
    }

    pub fn description(&self) -> &'static str {
        return match self {
            SpatialKind::BruteForce => {
                "Visits every exemplar for every query; no build cost, no pruning."
            }
            SpatialKind::KdTree => {
                "Median-split k-d tree; prunes bounding boxes against the kernel range."
            }
        };
    }

    pub(crate) fn by_name(name: &str) -> Result<SpatialKind, MsError> {
        return Self::ALL
            .into_iter()
            .find(|k| k.name() == name)
            .ok_or_else(|| {
                MsError::new(
                    ErrorKind::UnknownName,
                    format!("`{name}` does not name a registered spatial structure"),
                )
            });
    }

    pub(crate) fn build(&self, dm: &DataMatrix) -> Box<dyn Spatial> {
        return match self {
            SpatialKind::BruteForce => Box::new(BruteForce::build(dm)),
            SpatialKind::KdTree => Box::new(KdTree::build(dm)),
        };
    }
}
