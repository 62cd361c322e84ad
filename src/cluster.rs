//! Clustering by converging every exemplar and merging the trajectories.

use log::debug;

use crate::balls::Balls;
use crate::density::weighted_mean;
use crate::kernels::{Kernel, KernelConfig};
use crate::spatial::Spatial;

fn dist_sq(a: &[f32], b: &[f32]) -> f32 {
    return a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
}

struct Live {
    exemplar: usize,
    pos: Vec<f32>,
    iters: u32,
    done: bool,
    /// Exemplars whose trajectories collapsed into this one; they share its assignment.
    followers: Vec<usize>,
}

/// Run mean shift from every exemplar, merging converged trajectories through `balls`.
///
/// Writes one cluster id per exemplar into `assignments`; ball ids double as cluster ids, so
/// the caller reads the modes straight out of the balls structure. Trajectories are advanced
/// `merge_check_step` iterations at a time; between blocks, pairs of live trajectories within
/// `ident_dist` of each other are collapsed (the later one into the earlier) because they
/// share a destination. Converged or capped trajectories join the nearest existing ball
/// within `merge_range`, or found a new one.
#[allow(clippy::too_many_arguments)]
pub(crate) fn cluster(
    spatial: &dyn Spatial,
    kernel: &dyn Kernel,
    config: &KernelConfig,
    balls: &mut dyn Balls,
    assignments: &mut [i32],
    quality: f32,
    epsilon: f32,
    iter_cap: u32,
    ident_dist: f32,
    merge_range: f32,
    merge_check_step: u32,
) {
    let feats = spatial.features();
    let eps_sq = epsilon * epsilon;
    let ident_sq = ident_dist * ident_dist;
    let step = merge_check_step.max(1);

    let mut live: Vec<Live> = (0..spatial.exemplars())
        .map(|i| Live {
            exemplar: i,
            pos: spatial.position(i).to_vec(),
            iters: 0,
            done: false,
            followers: Vec::new(),
        })
        .collect();

    let mut scratch = vec![0.0f32; feats];
    let mut round = 0u32;
    while !live.is_empty() {
        round += 1;

        // Advance every live trajectory by one block.
        for point in live.iter_mut() {
            for _ in 0..step {
                if point.iters >= iter_cap {
                    point.done = true;
                    break;
                }
                point.iters += 1;
                match weighted_mean(
                    spatial,
                    kernel,
                    config,
                    quality,
                    &mut point.pos,
                    &mut scratch,
                ) {
                    Some(step_sq) if step_sq >= eps_sq => {}
                    _ => {
                        point.done = true;
                        break;
                    }
                }
            }
            if point.iters >= iter_cap {
                point.done = true;
            }
        }

        // Collapse trajectories that have met; they share a destination.
        let mut i = 0;
        while i < live.len() {
            let mut j = i + 1;
            while j < live.len() {
                if dist_sq(&live[i].pos, &live[j].pos) <= ident_sq {
                    let absorbed = live.swap_remove(j);
                    live[i].followers.push(absorbed.exemplar);
                    live[i].followers.extend(absorbed.followers);
                    live[i].done |= absorbed.done;
                } else {
                    j += 1;
                }
            }
            i += 1;
        }

        // Retire everything that converged or hit the cap.
        let mut i = 0;
        while i < live.len() {
            if !live[i].done {
                i += 1;
                continue;
            }
            let point = live.swap_remove(i);
            let id = match balls.nearest_within(&point.pos, merge_range) {
                Some(id) => id,
                None => balls.add(&point.pos),
            };
            assignments[point.exemplar] = id as i32;
            for follower in point.followers {
                assignments[follower] = id as i32;
            }
        }

        debug!(
            "clustering round {round}: {} trajectories live, {} clusters",
            live.len(),
            balls.count()
        );
    }
}

/// Converge a query point and resolve it against an existing clustering.
///
/// The trajectory is checked against the balls every `merge_check_step` iterations, so a
/// query that wanders into an existing cluster's merge range resolves early. Returns -1 when
/// the converged point is not within `merge_range` of any ball, which usually means the query
/// is outside the support of the data.
#[allow(clippy::too_many_arguments)]
pub(crate) fn assign_cluster(
    spatial: &dyn Spatial,
    kernel: &dyn Kernel,
    config: &KernelConfig,
    balls: &dyn Balls,
    q: &mut [f32],
    quality: f32,
    epsilon: f32,
    iter_cap: u32,
    merge_range: f32,
    merge_check_step: u32,
) -> i32 {
    let eps_sq = epsilon * epsilon;
    let step = merge_check_step.max(1);
    let mut scratch = vec![0.0f32; q.len()];

    let mut iters = 0u32;
    loop {
        if let Some(id) = balls.nearest_within(q, merge_range) {
            return id as i32;
        }
        if iters >= iter_cap {
            return -1;
        }
        for _ in 0..step {
            if iters >= iter_cap {
                break;
            }
            iters += 1;
            match weighted_mean(spatial, kernel, config, quality, q, &mut scratch) {
                Some(step_sq) if step_sq >= eps_sq => {}
                _ => {
                    return match balls.nearest_within(q, merge_range) {
                        Some(id) => id as i32,
                        None => -1,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::prelude::*;

    use super::{assign_cluster, cluster};
    use crate::balls::BallsKind;
    use crate::data::{DataMatrix, DimType};
    use crate::kernels::by_name;
    use crate::spatial::SpatialKind;

    /// Three blobs of 100 points around (0,0), (10,0) and (0,10); deterministic scatter.
    fn blobs() -> (DataMatrix, Vec<usize>) {
        let centres = [(0.0f32, 0.0f32), (10.0, 0.0), (0.0, 10.0)];
        let mut rows = Vec::new();
        let mut truth = Vec::new();
        for (c, &(cx, cy)) in centres.iter().enumerate() {
            for i in 0..100 {
                let t = i as f32 * 0.61803;
                let r = 0.9 * (0.5 + 0.5 * (t * 3.7).sin());
                rows.push([cx + r * t.cos(), cy + r * t.sin()]);
                truth.push(c);
            }
        }
        let data = Array2::from_shape_fn((rows.len(), 2), |(i, j)| rows[i][j]);
        let mut dm = DataMatrix::new();
        dm.set(data.view().into_dyn(), &[DimType::Data, DimType::Feature], None)
            .unwrap();
        return (dm, truth);
    }

    #[test]
    fn three_blobs_three_clusters() {
        let (dm, truth) = blobs();
        let spatial = SpatialKind::KdTree.build(&dm);
        let (kernel, _) = by_name("gaussian").unwrap();
        let config = kernel.config_new(2, "").unwrap();

        for balls_kind in BallsKind::ALL {
            let mut balls = balls_kind.build(2, 0.5);
            let mut assignments = vec![-1i32; dm.exemplars()];
            cluster(
                spatial.as_ref(),
                kernel,
                &config,
                balls.as_mut(),
                &mut assignments,
                0.9,
                1e-3,
                1024,
                0.0,
                0.5,
                4,
            );

            assert_eq!(balls.count(), 3, "expected exactly three modes");
            assert!(assignments.iter().all(|&a| a >= 0));

            // The assignment must match the ground truth up to a relabelling.
            let mut label_of = [None::<i32>; 3];
            for (i, &t) in truth.iter().enumerate() {
                match label_of[t] {
                    None => label_of[t] = Some(assignments[i]),
                    Some(l) => assert_eq!(assignments[i], l, "exemplar {i} switched blob"),
                }
            }
            let mut labels: Vec<i32> = label_of.iter().map(|l| l.unwrap()).collect();
            labels.sort_unstable();
            labels.dedup();
            assert_eq!(labels.len(), 3);

            // Modes sit on the blob centres.
            for c in [(0.0f32, 0.0f32), (10.0, 0.0), (0.0, 10.0)] {
                let near = (0..balls.count()).any(|id| {
                    let p = balls.pos(id);
                    (p[0] - c.0).powi(2) + (p[1] - c.1).powi(2) < 1.0
                });
                assert!(near, "no mode near {c:?}");
            }
        }
    }

    #[test]
    fn trajectory_collapse_shares_the_destination() {
        let (dm, _) = blobs();
        let spatial = SpatialKind::KdTree.build(&dm);
        let (kernel, _) = by_name("gaussian").unwrap();
        let config = kernel.config_new(2, "").unwrap();

        let mut balls = BallsKind::Hash.build(2, 0.5);
        let mut assignments = vec![-1i32; dm.exemplars()];
        // A generous ident_dist collapses whole blobs early; the clustering must not change.
        cluster(
            spatial.as_ref(),
            kernel,
            &config,
            balls.as_mut(),
            &mut assignments,
            0.9,
            1e-3,
            1024,
            0.25,
            0.5,
            4,
        );
        assert_eq!(balls.count(), 3);
        assert!(assignments.iter().all(|&a| a >= 0));
    }

    #[test]
    fn assign_cluster_matches_and_rejects() {
        let (dm, truth) = blobs();
        let spatial = SpatialKind::KdTree.build(&dm);
        let (kernel, _) = by_name("gaussian").unwrap();
        let config = kernel.config_new(2, "").unwrap();

        let mut balls = BallsKind::Hash.build(2, 0.5);
        let mut assignments = vec![-1i32; dm.exemplars()];
        cluster(
            spatial.as_ref(),
            kernel,
            &config,
            balls.as_mut(),
            &mut assignments,
            0.9,
            1e-3,
            1024,
            0.0,
            0.5,
            4,
        );

        // A point near the second blob resolves to the same cluster as its members.
        let member = truth.iter().position(|&t| t == 1).unwrap();
        let mut q = [10.3f32, 0.2];
        let id = assign_cluster(
            spatial.as_ref(),
            kernel,
            &config,
            balls.as_ref(),
            &mut q,
            0.9,
            1e-3,
            1024,
            0.5,
            4,
        );
        assert_eq!(id, assignments[member]);

        // Far away from everything: no support, no cluster.
        let mut q = [60.0f32, -40.0];
        let id = assign_cluster(
            spatial.as_ref(),
            kernel,
            &config,
            balls.as_ref(),
            &mut q,
            0.9,
            1e-3,
            1024,
            0.5,
            4,
        );
        assert_eq!(id, -1);
    }
}
