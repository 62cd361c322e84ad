//! The kernel family.
//!
//! Every kernel is a unit-bandwidth radial (or directional) profile placed on each exemplar in
//! the scaled space of the [`DataMatrix`](crate::data::DataMatrix). Kernels are stateless
//! singletons implementing [`Kernel`]; parameterised kernels carry their parameters in a
//! shared [`KernelConfig`] handle so copies between estimators are cheap and precomputed
//! tables are never duplicated.

use std::sync::Arc;

use statrs::distribution::{ChiSquared, ContinuousCDF};
use statrs::function::gamma::{gamma, ln_gamma};

use crate::error::{ErrorKind, MsError};

#[cfg(feature = "sample")]
use rand::Rng;
#[cfg(feature = "sample")]
use rand_distr::StandardNormal;
#[cfg(feature = "sample")]
use rand_pcg::Pcg64Mcg;

/// Configuration shared between estimators that use the same kernel.
///
/// Only the kernel that produced a configuration may interpret it; everyone else just clones
/// the `Arc` handle.
#[derive(Debug)]
pub enum KernelConfig {
    /// Parameterless kernels.
    Plain,
    /// Concentration and precomputed normalisation of the directional kernel.
    Fisher(FisherConfig),
    /// Per-segment child kernels of the composite kernel.
    Composite(CompositeConfig),
}

#[derive(Debug)]
pub struct FisherConfig {
    pub alpha: f32,
    /// ln of the surface integral of the unit kernel, precomputed at configuration time.
    ln_norm: f64,
}

#[derive(Debug)]
pub struct CompositeConfig {
    parts: Vec<CompositePart>,
}

#[derive(Debug)]
struct CompositePart {
    kernel: &'static dyn Kernel,
    config: Arc<KernelConfig>,
    dims: usize,
}

/// The capability set every kernel supplies.
///
/// `weight` is the unnormalised kernel value at an offset in scaled space, `norm` its integral
/// over that space, `range` the support radius used for spatial pruning at a given `quality`
/// (the fraction of probability mass kept in support for kernels with infinite tails).
/// `profile` exposes the radial profile `k(delta) = f(|delta|^2)` together with its first two
/// derivatives for the ridge follower; kernels without a radial profile return `None`.
pub trait Kernel: Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;

    /// Parameter template, for kernels that take configuration.
    fn configuration(&self) -> Option<&'static str> {
        return None;
    }

    fn config_verify(&self, dims: usize, params: &str) -> Result<(), MsError> {
        return self.config_new(dims, params).map(|_| ());
    }

    fn config_new(&self, dims: usize, params: &str) -> Result<Arc<KernelConfig>, MsError> {
        let _ = dims;
        if params.is_empty() {
            return Ok(Arc::new(KernelConfig::Plain));
        }
        return Err(MsError::new(
            ErrorKind::ConfigError,
            format!("kernel `{}` takes no parameters, found `{params}`", self.name()),
        ));
    }

    fn range(&self, config: &KernelConfig, dims: usize, quality: f32) -> f32;

    fn weight(&self, config: &KernelConfig, dims: usize, delta: &[f32]) -> f32;

    fn norm(&self, config: &KernelConfig, dims: usize) -> f32;

    /// `(f, f', f'')` of the radial profile at squared radius `r2`, or `None` when the kernel
    /// does not factor through `|delta|^2`.
    fn profile(&self, config: &KernelConfig, dims: usize, r2: f32) -> Option<(f32, f32, f32)>;

    /// Rewrite a proposed position for kernels whose domain is not the flat space; the
    /// directional kernel renormalises onto the unit sphere. The default is the identity.
    fn offset(&self, config: &KernelConfig, target: &mut [f32]) {
        let _ = (config, target);
    }

    /// Whether products of this kernel admit the closed-form treatment in the product
    /// sampler; everything else goes through Monte-Carlo integration there.
    fn exact_product(&self) -> bool {
        return false;
    }

    /// Deterministic sample from the unit kernel at the origin.
    #[cfg(feature = "sample")]
    fn draw(&self, config: &KernelConfig, dims: usize, rng: &mut Pcg64Mcg, out: &mut [f32]);
}

impl std::fmt::Debug for dyn Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn r2(delta: &[f32]) -> f32 {
    return delta.iter().map(|d| d * d).sum();
}

/// Volume of the unit ball in `dims` dimensions.
fn unit_ball_volume(dims: usize) -> f64 {
    let d = dims as f64;
    return std::f64::consts::PI.powf(d / 2.0) / gamma(d / 2.0 + 1.0);
}

/// Radius containing mass `quality` of a unit isotropic Gaussian in `dims` dimensions.
fn gaussian_mass_radius(dims: usize, quality: f32) -> f32 {
    if quality >= 1.0 {
        return f32::INFINITY;
    }
    if quality <= 0.0 {
        return 0.0;
    }
    let chi2 = ChiSquared::new(dims as f64).expect("dims is at least 1");
    return chi2.inverse_cdf(quality as f64).sqrt() as f32;
}

#[cfg(feature = "sample")]
fn draw_unit_sphere(dims: usize, rng: &mut Pcg64Mcg, out: &mut [f32]) {
    loop {
        let mut len2 = 0.0f32;
        for o in out[..dims].iter_mut() {
            let v: f32 = rng.sample(StandardNormal);
            *o = v;
            len2 += v * v;
        }
        if len2 > 1e-12 {
            let inv = len2.sqrt().recip();
            for o in out[..dims].iter_mut() {
                *o *= inv;
            }
            return;
        }
    }
}

// ---------------------------------------------------------------------------------------------

/// Flat kernel over the unit ball.
pub struct Uniform {}

impl Kernel for Uniform {
    fn name(&self) -> &'static str {
        return "uniform";
    }

    fn description(&self) -> &'static str {
        return "Flat kernel over the unit hypersphere; fast and crude.";
    }

    fn range(&self, _config: &KernelConfig, _dims: usize, _quality: f32) -> f32 {
        return 1.0;
    }

    fn weight(&self, _config: &KernelConfig, _dims: usize, delta: &[f32]) -> f32 {
        return if r2(delta) < 1.0 { 1.0 } else { 0.0 };
    }

    fn norm(&self, _config: &KernelConfig, dims: usize) -> f32 {
        return unit_ball_volume(dims) as f32;
    }

    fn profile(&self, _config: &KernelConfig, _dims: usize, r2: f32) -> Option<(f32, f32, f32)> {
        return Some((if r2 < 1.0 { 1.0 } else { 0.0 }, 0.0, 0.0));
    }

    #[cfg(feature = "sample")]
    fn draw(&self, _config: &KernelConfig, dims: usize, rng: &mut Pcg64Mcg, out: &mut [f32]) {
        draw_unit_sphere(dims, rng, out);
        let r = rng.random::<f32>().powf((dims as f32).recip());
        for o in out[..dims].iter_mut() {
            *o *= r;
        }
    }
}

/// Linear falloff kernel over the unit ball.
pub struct Triangular {}

impl Kernel for Triangular {
    fn name(&self) -> &'static str {
        return "triangular";
    }

    fn description(&self) -> &'static str {
        return "Linear falloff from the centre to the edge of the unit hypersphere.";
    }

    fn range(&self, _config: &KernelConfig, _dims: usize, _quality: f32) -> f32 {
        return 1.0;
    }

    fn weight(&self, _config: &KernelConfig, _dims: usize, delta: &[f32]) -> f32 {
        return (1.0 - r2(delta).sqrt()).max(0.0);
    }

    fn norm(&self, _config: &KernelConfig, dims: usize) -> f32 {
        return (unit_ball_volume(dims) / (dims as f64 + 1.0)) as f32;
    }

    fn profile(&self, _config: &KernelConfig, _dims: usize, r2: f32) -> Option<(f32, f32, f32)> {
        if r2 >= 1.0 {
            return Some((0.0, 0.0, 0.0));
        }
        // f(s) = 1 - sqrt(s); the derivatives blow up at the centre, so clamp.
        let s = r2.max(1e-8);
        let root = s.sqrt();
        return Some((1.0 - root, -0.5 / root, 0.25 / (s * root)));
    }

    #[cfg(feature = "sample")]
    fn draw(&self, _config: &KernelConfig, dims: usize, rng: &mut Pcg64Mcg, out: &mut [f32]) {
        // Rejection against the radial density r^(d-1) * (1 - r).
        let r = loop {
            let r = rng.random::<f32>().powf((dims as f32).recip());
            if rng.random::<f32>() < 1.0 - r {
                break r;
            }
        };
        draw_unit_sphere(dims, rng, out);
        for o in out[..dims].iter_mut() {
            *o *= r;
        }
    }
}

/// Epanechnikov (parabolic) kernel, the mean-square-error optimal choice.
pub struct Epanechnikov {}

impl Kernel for Epanechnikov {
    fn name(&self) -> &'static str {
        return "epanechnikov";
    }

    fn description(&self) -> &'static str {
        return "Parabolic falloff over the unit hypersphere; optimal in the mean squared error sense.";
    }

    fn range(&self, _config: &KernelConfig, _dims: usize, _quality: f32) -> f32 {
        return 1.0;
    }

    fn weight(&self, _config: &KernelConfig, _dims: usize, delta: &[f32]) -> f32 {
        return (1.0 - r2(delta)).max(0.0);
    }

    fn norm(&self, _config: &KernelConfig, dims: usize) -> f32 {
        return (2.0 * unit_ball_volume(dims) / (dims as f64 + 2.0)) as f32;
    }

    fn profile(&self, _config: &KernelConfig, _dims: usize, r2: f32) -> Option<(f32, f32, f32)> {
        if r2 >= 1.0 {
            return Some((0.0, 0.0, 0.0));
        }
        return Some((1.0 - r2, -1.0, 0.0));
    }

    #[cfg(feature = "sample")]
    fn draw(&self, _config: &KernelConfig, dims: usize, rng: &mut Pcg64Mcg, out: &mut [f32]) {
        let r = loop {
            let r = rng.random::<f32>().powf((dims as f32).recip());
            if rng.random::<f32>() < 1.0 - r * r {
                break r;
            }
        };
        draw_unit_sphere(dims, rng, out);
        for o in out[..dims].iter_mut() {
            *o *= r;
        }
    }
}

/// Isotropic Gaussian kernel.
pub struct Gaussian {}

impl Kernel for Gaussian {
    fn name(&self) -> &'static str {
        return "gaussian";
    }

    fn description(&self) -> &'static str {
        return "Isotropic unit-variance Gaussian; infinite support truncated by the quality parameter.";
    }

    fn range(&self, _config: &KernelConfig, dims: usize, quality: f32) -> f32 {
        return gaussian_mass_radius(dims, quality);
    }

    fn weight(&self, _config: &KernelConfig, _dims: usize, delta: &[f32]) -> f32 {
        return (-0.5 * r2(delta)).exp();
    }

    fn norm(&self, _config: &KernelConfig, dims: usize) -> f32 {
        return (2.0 * std::f64::consts::PI).powf(dims as f64 / 2.0) as f32;
    }

    fn profile(&self, _config: &KernelConfig, _dims: usize, r2: f32) -> Option<(f32, f32, f32)> {
        let f = (-0.5 * r2).exp();
        return Some((f, -0.5 * f, 0.25 * f));
    }

    fn exact_product(&self) -> bool {
        return true;
    }

    #[cfg(feature = "sample")]
    fn draw(&self, _config: &KernelConfig, dims: usize, rng: &mut Pcg64Mcg, out: &mut [f32]) {
        for o in out[..dims].iter_mut() {
            *o = rng.sample(StandardNormal);
        }
    }
}

/// Cauchy (Student-t with one degree of freedom) kernel; very heavy tails.
pub struct Cauchy {}

impl Kernel for Cauchy {
    fn name(&self) -> &'static str {
        return "cauchy";
    }

    fn description(&self) -> &'static str {
        return "Multivariate Cauchy profile; heavy tails make it robust to outliers but expensive to prune.";
    }

    fn range(&self, _config: &KernelConfig, _dims: usize, quality: f32) -> f32 {
        if quality >= 1.0 {
            return f32::INFINITY;
        }
        // Half-Cauchy quantile applied radially; the radial tail only thins with dimension,
        // so this keeps at least the requested mass in support.
        return (std::f32::consts::FRAC_PI_2 * quality.max(0.0)).tan();
    }

    fn weight(&self, _config: &KernelConfig, dims: usize, delta: &[f32]) -> f32 {
        return (1.0 + r2(delta)).powf(-(dims as f32 + 1.0) / 2.0);
    }

    fn norm(&self, _config: &KernelConfig, dims: usize) -> f32 {
        let d = dims as f64;
        return (std::f64::consts::PI.powf((d + 1.0) / 2.0) / gamma((d + 1.0) / 2.0)) as f32;
    }

    fn profile(&self, _config: &KernelConfig, dims: usize, r2: f32) -> Option<(f32, f32, f32)> {
        let e = (dims as f32 + 1.0) / 2.0;
        let b = 1.0 + r2;
        let f = b.powf(-e);
        let f1 = -e * b.powf(-e - 1.0);
        let f2 = e * (e + 1.0) * b.powf(-e - 2.0);
        return Some((f, f1, f2));
    }

    #[cfg(feature = "sample")]
    fn draw(&self, _config: &KernelConfig, dims: usize, rng: &mut Pcg64Mcg, out: &mut [f32]) {
        // A multivariate t with one degree of freedom is a Gaussian divided by an
        // independent |standard normal|.
        let g: f32 = loop {
            let g: f32 = rng.sample(StandardNormal);
            if g.abs() > 1e-12 {
                break g.abs();
            }
        };
        for o in out[..dims].iter_mut() {
            let v: f32 = rng.sample(StandardNormal);
            *o = v / g;
        }
    }
}

/// von Mises-Fisher kernel for directional data.
///
/// Feature vectors are treated as unit vectors; the concentration `alpha` plays the role of
/// the inverse bandwidth. Mean-shift updates are renormalised back onto the sphere by
/// [`Kernel::offset`].
pub struct Fisher {}

impl Fisher {
    fn alpha(config: &KernelConfig) -> f32 {
        return match config {
            KernelConfig::Fisher(f) => f.alpha,
            _ => 1.0,
        };
    }
}

impl Kernel for Fisher {
    fn name(&self) -> &'static str {
        return "fisher";
    }

    fn description(&self) -> &'static str {
        return "von Mises-Fisher kernel over unit vectors, parameterised by a concentration; use for directional data.";
    }

    fn configuration(&self) -> Option<&'static str> {
        return Some("(alpha) - concentration of the distribution, larger is tighter");
    }

    fn config_new(&self, dims: usize, params: &str) -> Result<Arc<KernelConfig>, MsError> {
        let inner = params
            .strip_prefix('(')
            .and_then(|p| p.strip_suffix(')'))
            .ok_or_else(|| {
                MsError::new(
                    ErrorKind::ConfigError,
                    format!("fisher kernel expects `fisher(alpha)`, found parameters `{params}`"),
                )
            })?;
        let alpha: f32 = inner.trim().parse().map_err(|_| {
            MsError::new(
                ErrorKind::ConfigError,
                format!("fisher concentration `{inner}` is not a number"),
            )
        })?;
        if !(alpha > 0.0) || !alpha.is_finite() {
            return Err(MsError::new(
                ErrorKind::ConfigError,
                "fisher concentration must be positive and finite",
            ));
        }
        return Ok(Arc::new(KernelConfig::Fisher(FisherConfig {
            alpha,
            ln_norm: fisher_ln_norm(dims.max(2), alpha as f64),
        })));
    }

    fn range(&self, config: &KernelConfig, dims: usize, quality: f32) -> f32 {
        let alpha = Self::alpha(config);
        // Gaussian approximation with variance 1/alpha, capped at the longest chord of the
        // unit sphere.
        return (gaussian_mass_radius(dims, quality) / alpha.sqrt()).min(2.0);
    }

    fn weight(&self, config: &KernelConfig, _dims: usize, delta: &[f32]) -> f32 {
        // For unit vectors, dot(q, x) = 1 - |q - x|^2 / 2; peak normalised at delta = 0.
        return (-0.5 * Self::alpha(config) * r2(delta)).exp();
    }

    fn norm(&self, config: &KernelConfig, _dims: usize) -> f32 {
        return match config {
            KernelConfig::Fisher(f) => f.ln_norm.exp() as f32,
            _ => 1.0,
        };
    }

    fn profile(&self, config: &KernelConfig, _dims: usize, r2: f32) -> Option<(f32, f32, f32)> {
        let a = Self::alpha(config);
        let f = (-0.5 * a * r2).exp();
        return Some((f, -0.5 * a * f, 0.25 * a * a * f));
    }

    fn offset(&self, _config: &KernelConfig, target: &mut [f32]) {
        let len = r2(target).sqrt();
        if len > 1e-12 {
            for t in target.iter_mut() {
                *t /= len;
            }
        }
    }

    #[cfg(feature = "sample")]
    fn draw(&self, config: &KernelConfig, dims: usize, rng: &mut Pcg64Mcg, out: &mut [f32]) {
        // Tangent-space draw; the caller maps it back onto the sphere via offset().
        let sd = Self::alpha(config).sqrt().recip();
        for o in out[..dims].iter_mut() {
            let v: f32 = rng.sample(StandardNormal);
            *o = v * sd;
        }
    }
}

/// ln of the surface integral of exp(alpha * (dot - 1)) over the unit sphere in `dims`
/// dimensions: -alpha + (dims/2) ln(2 pi) + ln I_nu(alpha) - nu ln(alpha), nu = dims/2 - 1.
fn fisher_ln_norm(dims: usize, alpha: f64) -> f64 {
    let nu = dims as f64 / 2.0 - 1.0;
    return -alpha + (dims as f64 / 2.0) * (2.0 * std::f64::consts::PI).ln()
        + ln_bessel_i(nu, alpha)
        - nu * alpha.ln();
}

/// ln I_nu(x) by the ascending series, summed in log space.
fn ln_bessel_i(nu: f64, x: f64) -> f64 {
    let lh = (x / 2.0).ln();
    let mut ln_term = nu * lh - ln_gamma(nu + 1.0);
    let mut ln_sum = ln_term;
    for m in 1..1024 {
        let m = m as f64;
        ln_term += 2.0 * lh - m.ln() - (m + nu).ln();
        let hi = ln_sum.max(ln_term);
        ln_sum = hi + ((ln_sum - hi).exp() + (ln_term - hi).exp()).ln();
        if ln_term < ln_sum - 34.0 && m > x / 2.0 {
            break;
        }
    }
    return ln_sum;
}

/// Kernel that factorises the feature vector into segments, each with its own child kernel.
///
/// Configured as `composite(n:kernel,m:kernel,...)` where the segment lengths must sum to the
/// number of features, e.g. `composite(2:gaussian,1:fisher(8.0))`.
pub struct Composite {}

impl Composite {
    fn parts(config: &KernelConfig) -> &[CompositePart] {
        return match config {
            KernelConfig::Composite(c) => &c.parts,
            _ => &[],
        };
    }
}

impl Kernel for Composite {
    fn name(&self) -> &'static str {
        return "composite";
    }

    fn description(&self) -> &'static str {
        return "Product of child kernels over disjoint segments of the feature vector; mix flat and directional features.";
    }

    fn configuration(&self) -> Option<&'static str> {
        return Some("(n:kernel,m:kernel,...) - segment lengths with their child kernels, summing to the feature count");
    }

    fn config_new(&self, dims: usize, params: &str) -> Result<Arc<KernelConfig>, MsError> {
        let inner = params
            .strip_prefix('(')
            .and_then(|p| p.strip_suffix(')'))
            .ok_or_else(|| {
                MsError::new(
                    ErrorKind::ConfigError,
                    format!("composite kernel expects `composite(n:kernel,...)`, found `{params}`"),
                )
            })?;

        let mut parts = Vec::new();
        let mut covered = 0usize;
        for item in split_top_level(inner) {
            let (count, spec) = item.split_once(':').ok_or_else(|| {
                MsError::new(
                    ErrorKind::ConfigError,
                    format!("composite segment `{item}` is missing its `length:` prefix"),
                )
            })?;
            let count: usize = count.trim().parse().map_err(|_| {
                MsError::new(
                    ErrorKind::ConfigError,
                    format!("composite segment length `{count}` is not a positive integer"),
                )
            })?;
            if count == 0 {
                return Err(MsError::new(
                    ErrorKind::ConfigError,
                    "composite segment lengths must be at least 1",
                ));
            }
            let (kernel, suffix) = by_name(spec.trim())?;
            if kernel.name() == self.name() {
                return Err(MsError::new(
                    ErrorKind::ConfigError,
                    "composite kernels cannot nest",
                ));
            }
            let config = kernel.config_new(count, suffix)?;
            parts.push(CompositePart {
                kernel,
                config,
                dims: count,
            });
            covered += count;
        }
        if parts.is_empty() || covered != dims {
            return Err(MsError::new(
                ErrorKind::ConfigError,
                format!("composite segments cover {covered} features, the data has {dims}"),
            ));
        }
        return Ok(Arc::new(KernelConfig::Composite(CompositeConfig { parts })));
    }

    fn range(&self, config: &KernelConfig, _dims: usize, quality: f32) -> f32 {
        // Past sqrt(sum of squared child ranges) at least one child is outside its support,
        // which zeroes the product.
        let sum: f32 = Self::parts(config)
            .iter()
            .map(|p| {
                let r = p.kernel.range(&p.config, p.dims, quality);
                r * r
            })
            .sum();
        return sum.sqrt();
    }

    fn weight(&self, config: &KernelConfig, _dims: usize, delta: &[f32]) -> f32 {
        let mut w = 1.0f32;
        let mut at = 0usize;
        for part in Self::parts(config) {
            w *= part.kernel.weight(&part.config, part.dims, &delta[at..at + part.dims]);
            if w == 0.0 {
                return 0.0;
            }
            at += part.dims;
        }
        return w;
    }

    fn norm(&self, config: &KernelConfig, _dims: usize) -> f32 {
        return Self::parts(config)
            .iter()
            .map(|p| p.kernel.norm(&p.config, p.dims))
            .product();
    }

    fn profile(&self, _config: &KernelConfig, _dims: usize, _r2: f32) -> Option<(f32, f32, f32)> {
        // The product of segment profiles does not factor through the full squared radius.
        return None;
    }

    fn offset(&self, config: &KernelConfig, target: &mut [f32]) {
        let mut at = 0usize;
        for part in Self::parts(config) {
            part.kernel.offset(&part.config, &mut target[at..at + part.dims]);
            at += part.dims;
        }
    }

    #[cfg(feature = "sample")]
    fn draw(&self, config: &KernelConfig, _dims: usize, rng: &mut Pcg64Mcg, out: &mut [f32]) {
        let mut at = 0usize;
        for part in Self::parts(config) {
            part.kernel.draw(&part.config, part.dims, rng, &mut out[at..at + part.dims]);
            at += part.dims;
        }
    }
}

/// Split on commas that are not inside parentheses.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    return out;
}

// ---------------------------------------------------------------------------------------------

static UNIFORM: Uniform = Uniform {};
static TRIANGULAR: Triangular = Triangular {};
static EPANECHNIKOV: Epanechnikov = Epanechnikov {};
static GAUSSIAN: Gaussian = Gaussian {};
static CAUCHY: Cauchy = Cauchy {};
static FISHER: Fisher = Fisher {};
static COMPOSITE: Composite = Composite {};

/// The closed kernel registry.
pub(crate) static KERNELS: [&'static dyn Kernel; 7] = [
    &UNIFORM,
    &TRIANGULAR,
    &EPANECHNIKOV,
    &GAUSSIAN,
    &CAUCHY,
    &FISHER,
    &COMPOSITE,
];

/// Resolve a kernel specification string into a kernel and its parameter suffix.
///
/// Parameterless kernels match their name exactly; parameterised kernels match
/// `name(...suffix...)`, with the parenthesis checked here and the suffix interpreted by the
/// kernel's own configuration parser. The longest matching registered name wins.
pub(crate) fn by_name(spec: &str) -> Result<(&'static dyn Kernel, &str), MsError> {
    let mut best: Option<(&'static dyn Kernel, &str)> = None;
    for &kernel in KERNELS.iter() {
        let name = kernel.name();
        let matches = spec == name
            || (spec.len() > name.len()
                && spec.starts_with(name)
                && spec[name.len()..].starts_with('('));
        if matches
            && best.is_none_or(|(b, _)| b.name().len() < name.len())
        {
            best = Some((kernel, &spec[name.len()..]));
        }
    }
    return best.ok_or_else(|| {
        MsError::new(
            ErrorKind::UnknownName,
            format!("`{spec}` does not name a registered kernel"),
        )
    });
}
