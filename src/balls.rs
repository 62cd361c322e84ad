//! Cluster-centre bookkeeping.
//!
//! A balls structure stores the mode of every cluster found so far and answers "is there an
//! existing cluster within the merge range of this point?". Ball ids are assigned in
//! insertion order and double as cluster ids; every variant must return identical results,
//! they only differ in query cost.

use std::collections::HashMap;

use crate::error::{ErrorKind, MsError};

pub trait Balls {
    fn dims(&self) -> usize;
    fn count(&self) -> usize;
    fn pos(&self, id: usize) -> &[f32];

    /// Append a ball, returning its id.
    fn add(&mut self, p: &[f32]) -> usize;

    /// Id of the nearest stored ball within distance `r` of `p`; ties break towards the
    /// smaller id.
    fn nearest_within(&self, p: &[f32], r: f32) -> Option<usize>;
}

fn dist_sq(a: &[f32], b: &[f32]) -> f32 {
    return a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
}

fn nearest_of(
    candidates: impl Iterator<Item = usize>,
    flat: &[f32],
    dims: usize,
    p: &[f32],
    r: f32,
) -> Option<usize> {
    let mut best: Option<(f32, usize)> = None;
    for id in candidates {
        let d = dist_sq(&flat[id * dims..(id + 1) * dims], p);
        if d <= r * r
            && best.is_none_or(|(bd, bid)| d < bd || (d == bd && id < bid))
        {
            best = Some((d, id));
        }
    }
    return best.map(|(_, id)| id);
}

/// Flat list of balls with linear scans; exact and trivially correct.
pub struct BallsList {
    dims: usize,
    flat: Vec<f32>,
}

impl BallsList {
    fn new(dims: usize) -> Self {
        return Self {
            dims,
            flat: Vec::new(),
        };
    }
}

impl Balls for BallsList {
    fn dims(&self) -> usize {
        return self.dims;
    }

    fn count(&self) -> usize {
        return self.flat.len() / self.dims;
    }

    fn pos(&self, id: usize) -> &[f32] {
        return &self.flat[id * self.dims..(id + 1) * self.dims];
    }

    fn add(&mut self, p: &[f32]) -> usize {
        self.flat.extend_from_slice(p);
        return self.count() - 1;
    }

    fn nearest_within(&self, p: &[f32], r: f32) -> Option<usize> {
        return nearest_of(0..self.count(), &self.flat, self.dims, p, r);
    }
}

/// Hash grid with cells the size of the merge range; queries probe the neighbouring cells.
pub struct BallsHash {
    dims: usize,
    cell: f32,
    flat: Vec<f32>,
    grid: HashMap<Vec<i64>, Vec<usize>>,
}

impl BallsHash {
    fn new(dims: usize, merge_range: f32) -> Self {
        return Self {
            dims,
            cell: merge_range.max(1e-6),
            flat: Vec::new(),
            grid: HashMap::new(),
        };
    }

    fn key(&self, p: &[f32]) -> Vec<i64> {
        return p.iter().map(|&x| (x / self.cell).floor() as i64).collect();
    }

    fn probe(
        &self,
        key: &[i64],
        reach: i64,
        axis: usize,
        scratch: &mut Vec<i64>,
        out: &mut Vec<usize>,
    ) {
        if axis == self.dims {
            if let Some(ids) = self.grid.get(scratch.as_slice()) {
                out.extend_from_slice(ids);
            }
            return;
        }
        for d in -reach..=reach {
            scratch.push(key[axis] + d);
            self.probe(key, reach, axis + 1, scratch, out);
            scratch.pop();
        }
    }
}

impl Balls for BallsHash {
    fn dims(&self) -> usize {
        return self.dims;
    }

    fn count(&self) -> usize {
        return self.flat.len() / self.dims;
    }

    fn pos(&self, id: usize) -> &[f32] {
        return &self.flat[id * self.dims..(id + 1) * self.dims];
    }

    fn add(&mut self, p: &[f32]) -> usize {
        self.flat.extend_from_slice(p);
        let id = self.count() - 1;
        let key = self.key(p);
        self.grid.entry(key).or_default().push(id);
        return id;
    }

    fn nearest_within(&self, p: &[f32], r: f32) -> Option<usize> {
        let key = self.key(p);
        let reach = (r / self.cell).ceil() as i64;
        let mut candidates = Vec::new();
        let mut scratch = Vec::with_capacity(self.dims);
        self.probe(&key, reach, 0, &mut scratch, &mut candidates);
        return nearest_of(candidates.into_iter(), &self.flat, self.dims, p, r);
    }
}

/// The registered balls variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BallsKind {
    List,
    Hash,
}

impl BallsKind {
    pub(crate) const ALL: [BallsKind; 2] = [BallsKind::List, BallsKind::Hash];

    pub fn name(&self) -> &'static str {
        return match self {
            BallsKind::List => "list",
            BallsKind::Hash => "hash",
        };
    }

    pub fn description(&self) -> &'static str {
        return match self {
            BallsKind::List => "Linear scan over every stored cluster centre.",
            BallsKind::Hash => "Hash grid with merge-range sized cells; probes neighbour cells only.",
        };
    }

    pub(crate) fn by_name(name: &str) -> Result<BallsKind, MsError> {
        return Self::ALL
            .into_iter()
            .find(|k| k.name() == name)
            .ok_or_else(|| {
                MsError::new(
                    ErrorKind::UnknownName,
                    format!("`{name}` does not name a registered balls structure"),
                )
            });
    }

    pub(crate) fn build(&self, dims: usize, merge_range: f32) -> Box<dyn Balls> {
        return match self {
            BallsKind::List => Box::new(BallsList::new(dims)),
            BallsKind::Hash => Box::new(BallsHash::new(dims, merge_range)),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::{Balls, BallsKind};

    fn fill(balls: &mut dyn Balls) {
        balls.add(&[0.0, 0.0]);
        balls.add(&[1.0, 0.0]);
        balls.add(&[5.0, 5.0]);
        balls.add(&[1.0, 0.0]); // Duplicate of id 1; ties must go to the smaller id.
    }

    #[test]
    fn variants_agree() {
        for kind in BallsKind::ALL {
            let mut balls = kind.build(2, 0.75);
            fill(balls.as_mut());

            assert_eq!(balls.count(), 4);
            assert_eq!(balls.dims(), 2);
            assert_eq!(balls.pos(2), &[5.0, 5.0]);

            assert_eq!(balls.nearest_within(&[0.1, 0.1], 0.75), Some(0));
            assert_eq!(balls.nearest_within(&[1.1, 0.0], 0.75), Some(1));
            assert_eq!(balls.nearest_within(&[3.0, 3.0], 0.75), None);
            // Exactly between two balls: smaller id wins.
            assert_eq!(balls.nearest_within(&[0.5, 0.0], 0.75), Some(0));
        }
    }

    #[test]
    fn hash_probes_past_its_cell() {
        let mut balls = BallsKind::Hash.build(2, 0.5);
        balls.add(&[0.0, 0.0]);
        // Query with a radius larger than the cell size still finds the ball.
        assert_eq!(balls.nearest_within(&[1.2, 0.0], 1.5), Some(0));
    }
}
