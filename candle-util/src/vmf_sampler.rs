//! Sampling from the von Mises-Fisher distribution on the unit hypersphere.
//!
//! A draw z ~ vMF(μ, κ) on S^{d-1} is built in three steps:
//!
//! ```text
//! ω  ~ p(ω | κ) ∝ exp(κ ω) (1 - ω²)^{(d-3)/2}      (rejection sampling, Wood 1994)
//! v  ~ Uniform(S^{d-2})
//! z' = [ω ; sqrt(1 - ω²) v]                          (centred on the pole e₁)
//! z  = z' - 2 w (wᵀz') / ‖w‖²,   w = e₁ - μ         (Householder reflection e₁ ↦ μ)
//! ```
//!
//! Gradients reach μ through the reflection. The accepted ω is treated as
//! a constant: accept/reject is not reparameterizable, and dropping that
//! path trades a small bias for a low-variance estimator (the usual
//! reparameterization-trick compromise for S-VAEs).
//!
//! # References
//! - Wood (1994) "Simulation of the von Mises Fisher distribution"
//! - Davidson et al. (2018) "Hyperspherical Variational Auto-Encoders"

use candle_core::{bail, DType, Device, Result, Tensor};
use log::warn;
use rand::Rng;
use rand_distr::{Beta, Distribution, StandardNormal};

/// Rounds of partial re-proposal before the sampler gives up
pub const MAX_REJECTION_ROUNDS: usize = 10_000;

/// Added under sqrt(1 - ω²) so rounding never yields a negative radicand
const RADIUS_EPS: f64 = 1e-10;

/// Below this ‖e₁ - μ‖² the Householder reflection is the identity
const MIN_REFLECTION_NORM2: f64 = 1e-12;

/// L2 normalize a tensor along the specified dimension.
pub fn l2_normalize_dim(x: &Tensor, dim: usize) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(dim)?.sqrt()?;
    let norm_safe = (norm + 1e-8)?; // Avoid division by zero
    x.broadcast_div(&norm_safe)
}

/// Copy an `n x 1` (or any shape) concentration tensor to the host
pub fn kappa_to_vec(kappa: &Tensor) -> Result<Vec<f64>> {
    kappa.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()
}

/// Envelope constants (a, b, d) of Wood's sampler
///
/// `b = (-2κ + c) / (d - 1)` is computed as `(d - 1) / (2κ + c)`, which is
/// the same number without the cancellation at large κ.
fn wood_envelope(m1: f64, kappa: f64) -> (f64, f64, f64) {
    let c = (4.0 * kappa * kappa + m1 * m1).sqrt();
    let b = m1 / (2.0 * kappa + c);
    let a = (m1 + 2.0 * kappa + c) / 4.0;
    let d = 4.0 * a * b / (1.0 + b) - m1 * m1.ln();
    (a, b, d)
}

/// Draw the polar component ω of a vMF sample for each concentration.
///
/// Only rejected entries are re-proposed in each round. If `max_rounds` is
/// exhausted, the last proposals of the unaccepted entries are returned
/// and a warning is logged; this only happens at extreme κ.
///
/// * `dim` - ambient dimension d of the sphere S^{d-1} (d ≥ 2)
/// * `kappa` - one concentration per draw
/// * `max_rounds` - cap on the number of proposal rounds
/// * `rng` - random number generator
pub fn sample_omega_with_rng<R>(
    dim: usize,
    kappa: &[f64],
    max_rounds: usize,
    rng: &mut R,
) -> Result<Vec<f64>>
where
    R: Rng + ?Sized,
{
    if dim < 2 {
        bail!("vMF sampling needs dimension >= 2, got {}", dim);
    }

    let m1 = (dim - 1) as f64;
    let beta = match Beta::new(m1 / 2.0, m1 / 2.0) {
        Ok(beta) => beta,
        Err(e) => bail!("Beta proposal for dim {}: {}", dim, e),
    };

    let envelopes: Vec<(f64, f64, f64)> = kappa.iter().map(|&k| wood_envelope(m1, k)).collect();

    let mut omega = vec![0.0; kappa.len()];
    let mut pending: Vec<usize> = (0..kappa.len()).collect();
    let mut rounds = 0;

    while !pending.is_empty() && rounds < max_rounds {
        rounds += 1;
        pending.retain(|&i| {
            let (a, b, d) = envelopes[i];
            let eps: f64 = beta.sample(&mut *rng);
            let u: f64 = rng.random();

            let denom = 1.0 - (1.0 - b) * eps;
            omega[i] = (1.0 - (1.0 + b) * eps) / denom;

            let t = 2.0 * a * b / denom;
            let accepted = m1 * t.ln() - t + d >= u.ln();
            !accepted
        });
    }

    if !pending.is_empty() {
        let stuck: Vec<f64> = pending.iter().take(8).map(|&i| kappa[i]).collect();
        warn!(
            "vMF rejection sampler stopped after {} rounds (dim={}): {} of {} draws unaccepted, kappa = {:?}",
            rounds,
            dim,
            pending.len(),
            kappa.len(),
            stuck
        );
    }

    Ok(omega)
}

/// Draw the polar component ω for each row of `kappa_n1`.
///
/// Returns an `n x 1` constant tensor on the device of `kappa_n1`.
pub fn sample_omega(dim: usize, kappa_n1: &Tensor) -> Result<Tensor> {
    let kappa = kappa_to_vec(kappa_n1)?;
    let omega = sample_omega_with_rng(dim, &kappa, MAX_REJECTION_ROUNDS, &mut rand::rng())?;
    Tensor::from_vec(omega, (kappa.len(), 1), kappa_n1.device())?.to_dtype(kappa_n1.dtype())
}

/// Reflect every row of `zprime_nk` across the hyperplane orthogonal to
/// `w = e₁ - μ`, which maps the pole e₁ onto μ.
///
/// `z' - 2 w (wᵀz') / ‖w‖²` is orthogonal for any nonzero `w`. Rows with
/// `‖w‖² < MIN_REFLECTION_NORM2` have μ at the pole and are left as is.
///
/// * `zprime_nk` - pole-centred samples (n x d)
/// * `mu_nk` - unit mean directions (n x d, or 1 x d for a shared mean)
pub fn householder_reflect(zprime_nk: &Tensor, mu_nk: &Tensor) -> Result<Tensor> {
    let dd = mu_nk.dim(1)?;
    let mut pole = vec![0f32; dd];
    pole[0] = 1.0;
    let e1 = Tensor::from_vec(pole, (1, dd), mu_nk.device())?.to_dtype(mu_nk.dtype())?;

    let w = e1.broadcast_sub(mu_nk)?;
    let w_norm2 = w.sqr()?.sum_keepdim(1)?;

    let reflect = w_norm2.ge(MIN_REFLECTION_NORM2)?;
    let ones = w_norm2.ones_like()?;
    let denom = reflect.where_cond(&w_norm2, &ones)?;
    let scale = (reflect.to_dtype(w.dtype())? * 2.0)?.div(&denom)?;

    let proj_n1 = zprime_nk.broadcast_mul(&w)?.sum_keepdim(1)?;
    let coef_n1 = proj_n1.broadcast_mul(&scale)?;
    zprime_nk.broadcast_sub(&w.broadcast_mul(&coef_n1)?)
}

/// Reparameterized vMF sample, one per row of `mu_nk`.
///
/// * `mu_nk` - unit mean directions (n x d)
/// * `kappa_n1` - concentrations (n x 1)
/// * `rng` - random number generator for ω and the tangential noise
pub fn sample_z_with_rng<R>(mu_nk: &Tensor, kappa_n1: &Tensor, rng: &mut R) -> Result<Tensor>
where
    R: Rng + ?Sized,
{
    let (nn, dd) = mu_nk.dims2()?;
    let kappa = kappa_to_vec(kappa_n1)?;
    if kappa.len() != nn {
        bail!(
            "expected one concentration per mean direction: {} vs {}",
            kappa.len(),
            nn
        );
    }

    let omega = sample_omega_with_rng(dd, &kappa, MAX_REJECTION_ROUNDS, rng)?;

    let mut zprime = Vec::with_capacity(nn * dd);
    let mut v = vec![0f64; dd - 1];
    for &w in omega.iter() {
        for vj in v.iter_mut() {
            *vj = rng.sample(StandardNormal);
        }
        let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt().max(1e-12);
        let radius = (1.0 - w * w + RADIUS_EPS).sqrt();

        zprime.push(w);
        zprime.extend(v.iter().map(|x| radius * x / norm));
    }

    let zprime_nk = Tensor::from_vec(zprime, (nn, dd), mu_nk.device())?.to_dtype(mu_nk.dtype())?;
    householder_reflect(&zprime_nk, mu_nk)
}

/// Reparameterized vMF sample z ~ vMF(μ, κ), one per row of `mu_nk`.
pub fn sample_z(mu_nk: &Tensor, kappa_n1: &Tensor) -> Result<Tensor> {
    sample_z_with_rng(mu_nk, kappa_n1, &mut rand::rng())
}

/// Uniform samples on S^{d-1}: normalized standard normal rows (n x d)
pub fn sample_hyperspherical_uniform(nn: usize, dd: usize, device: &Device) -> Result<Tensor> {
    let x_nd = Tensor::randn(0f32, 1f32, (nn, dd), device)?;
    l2_normalize_dim(&x_nd, 1)
}

/// Uniform samples on S^{d-1} drawn from a caller-supplied generator
pub fn sample_hyperspherical_uniform_with_rng<R>(
    nn: usize,
    dd: usize,
    device: &Device,
    rng: &mut R,
) -> Result<Tensor>
where
    R: Rng + ?Sized,
{
    let x: Vec<f32> = (0..nn * dd).map(|_| rng.sample(StandardNormal)).collect();
    let x_nd = Tensor::from_vec(x, (nn, dd), device)?;
    l2_normalize_dim(&x_nd, 1)
}
