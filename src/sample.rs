//! Deterministic sampling: draws from one KDE, bootstrap draws, and draws from products of
//! several KDEs via Gibbs sampling over the implicit grand mixture.

use log::trace;
use ndarray::prelude::*;
use rand::Rng;
use rand_distr::StandardNormal;
use rand_pcg::Pcg64Mcg;

use crate::data::DataMatrix;
use crate::kernels::{Kernel, KernelConfig};
use crate::rng::index_rng;

/// Draw one point from the KDE: pick an exemplar by weight, add a kernel draw, map back to
/// the unscaled space. Fully determined by the three index words.
pub(crate) fn draw(
    dm: &mut DataMatrix,
    kernel: &dyn Kernel,
    config: &KernelConfig,
    index: &[u32; 3],
    out: &mut [f32],
) {
    let feats = dm.features();
    let mut rng = index_rng(index);
    let picked = dm.draw(&mut rng);

    let mut delta = vec![0.0f32; feats];
    kernel.draw(config, feats, &mut rng, &mut delta);

    let mut fv = vec![0.0f32; feats];
    dm.fv_into(picked, &mut fv);
    for (o, (&x, &d)) in out.iter_mut().zip(fv.iter().zip(&delta)) {
        *o = x + d;
    }
    kernel.offset(config, out);
    for (o, &m) in out.iter_mut().zip(dm.mult()) {
        *o /= m;
    }
}

/// Bootstrap draw: the kernel is replaced by a Dirac delta, so every row is an exemplar of
/// the dataset, picked by weight. Keyed by four index words, one stream per row.
pub(crate) fn bootstrap(dm: &mut DataMatrix, index: &[u32; 3], rows: usize) -> Array2<f32> {
    let feats = dm.features();
    let mut out = Array2::zeros((rows, feats));
    let mut fv = vec![0.0f32; feats];
    for row in 0..rows {
        let mut rng = index_rng(&[index[0], index[1], index[2], row as u32]);
        let picked = dm.draw(&mut rng);
        dm.fv_into(picked, &mut fv);
        for (j, o) in out.row_mut(row).iter_mut().enumerate() {
            *o = fv[j] / dm.mult()[j];
        }
    }
    return out;
}

/// One multiplicand of the product sampler, flattened out of its estimator: exemplar centres
/// in unscaled space, weights, and the scale that maps offsets into kernel space.
pub(crate) struct MultTerm<'a> {
    pub kernel: &'a dyn Kernel,
    pub config: &'a KernelConfig,
    pub centres: Array2<f32>,
    pub weights: Vec<f32>,
    pub mult: Vec<f32>,
}

impl MultTerm<'_> {
    /// Kernel value of component `i` at the unscaled point `x`.
    fn component_weight(&self, i: usize, x: &[f32], delta: &mut [f32]) -> f32 {
        let c = self.centres.row(i);
        for (j, d) in delta.iter_mut().enumerate() {
            *d = (x[j] - c[j]) * self.mult[j];
        }
        return self.kernel.weight(self.config, delta.len(), delta);
    }

    /// Draw from component `i`, in unscaled space.
    fn component_draw(&self, i: usize, rng: &mut Pcg64Mcg, out: &mut [f32]) {
        let feats = self.mult.len();
        let mut delta = vec![0.0f32; feats];
        self.kernel.draw(self.config, feats, rng, &mut delta);
        let c = self.centres.row(i);
        for (j, o) in out.iter_mut().enumerate() {
            *o = (c[j] * self.mult[j] + delta[j]) / self.mult[j];
        }
        // Map back onto the kernel's manifold in scaled space.
        let mut scaled: Vec<f32> = out.iter().zip(&self.mult).map(|(&x, &m)| x * m).collect();
        self.kernel.offset(self.config, &mut scaled);
        for (o, (&s, &m)) in out.iter_mut().zip(scaled.iter().zip(&self.mult)) {
            *o = s / m;
        }
    }

    /// Weighted draw of a component index.
    fn pick_component(&self, rng: &mut Pcg64Mcg) -> usize {
        let total: f32 = self.weights.iter().sum();
        let mut u = rng.random::<f32>() * total;
        for (i, &w) in self.weights.iter().enumerate() {
            u -= w;
            if u <= 0.0 {
                return i;
            }
        }
        return self.weights.len() - 1;
    }
}

/// Tuning knobs of the product sampler, with the rng stream words.
pub struct MultParams {
    pub rng: [u32; 2],
    /// Full Gibbs passes over the assignment vector before each emitted draw.
    pub gibbs: u32,
    /// Samples per Monte-Carlo integral when no closed form is available.
    pub mci: u32,
    /// Metropolis-Hastings proposals (per term) for the final draw when no closed form is
    /// available.
    pub mh: u32,
    /// 0 = correct draw, 1 = mode of the selected product component, 2 = average of the
    /// selected centres. 1 and 2 are diagnostics, not draws.
    pub fake: u8,
}

impl Default for MultParams {
    fn default() -> Self {
        return Self {
            rng: [0, 0],
            gibbs: 16,
            mci: 64,
            mh: 8,
            fake: 0,
        };
    }
}

/// Draw `rows` points from the product of the term KDEs.
///
/// The product of T mixtures is a mixture over the product grid of their components; the
/// grid is never enumerated. Instead a Gibbs sampler resamples one term's component at a
/// time, conditioned on the others: exactly for Gaussian kernels, by Monte-Carlo integration
/// otherwise. The sampler cannot fail: a state in which every candidate has weight zero is
/// kept unchanged.
pub(crate) fn mult_draws(terms: &[MultTerm<'_>], rows: usize, params: &MultParams) -> Array2<f32> {
    let feats = terms[0].mult.len();
    let exact = terms.iter().all(|t| t.kernel.exact_product());
    let mut out = Array2::zeros((rows, feats));

    for row in 0..rows {
        let mut rng = index_rng(&[params.rng[0], params.rng[1], row as u32, 0]);

        // Independent start: a weighted component per term.
        let mut state: Vec<usize> = terms.iter().map(|t| t.pick_component(&mut rng)).collect();

        for _pass in 0..params.gibbs {
            for t in 0..terms.len() {
                resample_slot(terms, &mut state, t, exact, params.mci, &mut rng);
            }
        }

        let mut x = out.row_mut(row);
        let x = x.as_slice_mut().expect("standard layout row");
        emit(terms, &state, exact, params, &mut rng, x);
    }
    return out;
}

/// Resample the component of slot `t` conditioned on every other slot.
fn resample_slot(
    terms: &[MultTerm<'_>],
    state: &mut [usize],
    t: usize,
    exact: bool,
    mci: u32,
    rng: &mut Pcg64Mcg,
) {
    let feats = terms[0].mult.len();
    let n = terms[t].weights.len();

    if exact {
        // Gaussian kernels: the integral of the product has a closed form. Per axis j the
        // component of term s is a Gaussian with precision mult[j]^2 around its centre, so
        // with K_j the precision-weighted sum of the other centres and L_j the total
        // precision, candidate i scores
        //   ln w_i = ln weight_i - 1/2 sum_j (l_j c_ij^2 - (K_j + l_j c_ij)^2 / L_j).
        let mut k = vec![0.0f64; feats];
        let mut total_precision = vec![0.0f64; feats];
        for (s, term) in terms.iter().enumerate() {
            for j in 0..feats {
                let l = (term.mult[j] as f64).powi(2);
                total_precision[j] += l;
                if s != t {
                    k[j] += l * term.centres[[state[s], j]] as f64;
                }
            }
        }

        let mut scores = Vec::with_capacity(n);
        let mut best = f64::NEG_INFINITY;
        for i in 0..n {
            let mut ln_w = (terms[t].weights[i].max(f32::MIN_POSITIVE) as f64).ln();
            for j in 0..feats {
                let l = (terms[t].mult[j] as f64).powi(2);
                let c = terms[t].centres[[i, j]] as f64;
                let joint = k[j] + l * c;
                ln_w -= 0.5 * (l * c * c - joint * joint / total_precision[j]);
            }
            best = best.max(ln_w);
            scores.push(ln_w);
        }

        let mut acc = 0.0f64;
        let weights: Vec<f64> = scores
            .iter()
            .map(|&s| {
                acc += (s - best).exp();
                acc
            })
            .collect();
        let u = rng.random::<f64>() * acc;
        state[t] = weights.partition_point(|&w| w <= u).min(n - 1);
        return;
    }

    // General kernels: estimate the integral of the product by sampling from candidate i's
    // kernel and averaging the product of the other terms there.
    let mut sample = vec![0.0f32; feats];
    let mut delta = vec![0.0f32; feats];
    let mut weights = Vec::with_capacity(n);
    let mut acc = 0.0f64;
    for i in 0..n {
        let mut integral = 0.0f64;
        for _ in 0..mci {
            terms[t].component_draw(i, rng, &mut sample);
            let mut product = 1.0f32;
            for (s, term) in terms.iter().enumerate() {
                if s == t {
                    continue;
                }
                product *= term.component_weight(state[s], &sample, &mut delta);
                if product == 0.0 {
                    break;
                }
            }
            integral += product as f64;
        }
        acc += terms[t].weights[i] as f64 * integral / mci as f64;
        weights.push(acc);
    }

    if acc <= 0.0 {
        // Nothing overlaps the other slots; keep the current assignment.
        trace!("product sampler: slot {t} has no overlapping candidate, state kept");
        return;
    }
    let u = rng.random::<f64>() * acc;
    state[t] = weights.partition_point(|&w| w <= u).min(n - 1);
}

/// Emit the output point for the selected product component.
fn emit(
    terms: &[MultTerm<'_>],
    state: &[usize],
    exact: bool,
    params: &MultParams,
    rng: &mut Pcg64Mcg,
    x: &mut [f32],
) {
    let feats = terms[0].mult.len();

    if params.fake == 2 {
        for (j, o) in x.iter_mut().enumerate() {
            *o = terms
                .iter()
                .zip(state)
                .map(|(term, &i)| term.centres[[i, j]])
                .sum::<f32>()
                / terms.len() as f32;
        }
        return;
    }

    // Precision-weighted mean of the selected centres; for Gaussian kernels this is the mean
    // and mode of the product component.
    let mut mean = vec![0.0f64; feats];
    let mut precision = vec![0.0f64; feats];
    for (term, &i) in terms.iter().zip(state) {
        for j in 0..feats {
            let l = (term.mult[j] as f64).powi(2);
            mean[j] += l * term.centres[[i, j]] as f64;
            precision[j] += l;
        }
    }
    for j in 0..feats {
        mean[j] /= precision[j];
    }

    if params.fake == 1 {
        for (o, &m) in x.iter_mut().zip(&mean) {
            *o = m as f32;
        }
        return;
    }

    if exact {
        for j in 0..feats {
            let z: f64 = rng.sample(StandardNormal);
            x[j] = (mean[j] + z / precision[j].sqrt()) as f32;
        }
        return;
    }

    // Metropolis-Hastings over the product, proposing from one term's kernel at a time.
    // Proposing from term s cancels its own factor, leaving the ratio of the others.
    let mut delta = vec![0.0f32; feats];
    for (o, &m) in x.iter_mut().zip(&mean) {
        *o = m as f32;
    }
    let mut proposal = vec![0.0f32; feats];
    let total = params.mh * terms.len() as u32;
    for p in 0..total {
        let s = p as usize % terms.len();
        terms[s].component_draw(state[s], rng, &mut proposal);
        let cur = others_product(terms, state, s, x, &mut delta);
        let new = others_product(terms, state, s, &proposal, &mut delta);
        let accept = if cur <= 0.0 {
            new > 0.0
        } else {
            rng.random::<f32>() < new / cur
        };
        if accept {
            x.copy_from_slice(&proposal);
        }
    }
}

/// Product of every term's selected component at `x`, skipping term `skip`.
fn others_product(
    terms: &[MultTerm<'_>],
    state: &[usize],
    skip: usize,
    x: &[f32],
    delta: &mut [f32],
) -> f32 {
    let mut product = 1.0f32;
    for (s, term) in terms.iter().enumerate() {
        if s == skip {
            continue;
        }
        product *= term.component_weight(state[s], x, delta);
        if product == 0.0 {
            break;
        }
    }
    return product;
}
