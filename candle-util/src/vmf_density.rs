//! Entropies, divergences and log densities on the unit hypersphere.
//!
//! # Model
//! ```text
//! p(x | μ, κ) = C_d(κ) exp(κ μᵀx)
//! log C_d(κ)  = (d/2 - 1) log κ - (d/2) log 2π - log I_{d/2-1}(κ)
//! H[vMF]      = -κ A_d(κ) - log C_d(κ),       A_d(κ) = I_{d/2}(κ) / I_{d/2-1}(κ)
//! H[HU]       = (d/2) log π + log 2 - log Γ(d/2)
//! KL(vMF‖HU)  = H[HU] - H[vMF]
//! ```
//!
//! The tensor versions are differentiable in κ:
//! `d/dκ H = -κ + κ A² + (d - 1) A` and `d/dκ log C = -A`.

use crate::special_functions::{
    apply_on_host, besseli_ratio, host_map, log_besseli, map_cpu_storage,
};
use candle_core::{CpuStorage, CustomOp1, Layout, Result, Shape, Tensor};
use special::Gamma;

/// Entropy of the uniform distribution on S^{d-1}, i.e. the log surface area.
pub fn hyperspherical_uniform_entropy(dim: usize) -> f64 {
    let d = dim as f64;
    (d / 2.0) * std::f64::consts::PI.ln() + std::f64::consts::LN_2 - Gamma::ln_gamma(d / 2.0).0
}

/// Compute the log normalizer for the von Mises-Fisher distribution.
///
/// ```text
/// log C_d(κ) = (d/2 - 1) * log(κ) - (d/2) * log(2π) - log I_{d/2-1}(κ)
/// ```
/// At κ = 0 this is the uniform density, `-H[HU]`.
pub fn vmf_log_normalizer(dim: usize, kappa: f64) -> f64 {
    if kappa <= 0.0 {
        return -hyperspherical_uniform_entropy(dim);
    }
    let d = dim as f64;
    let v = d / 2.0 - 1.0;
    v * kappa.ln() - (d / 2.0) * std::f64::consts::TAU.ln() - log_besseli(v, kappa)
}

/// Differential entropy of vMF(μ, κ) on S^{d-1}; independent of μ.
pub fn vmf_entropy(dim: usize, kappa: f64) -> f64 {
    if kappa <= 0.0 {
        return hyperspherical_uniform_entropy(dim);
    }
    let v = dim as f64 / 2.0 - 1.0;
    -kappa * besseli_ratio(v, kappa) - vmf_log_normalizer(dim, kappa)
}

/// KL(vMF(μ, κ) ‖ HU(S^{d-1})); zero at κ = 0 and increasing in κ.
pub fn kl_divergence(dim: usize, kappa: f64) -> f64 {
    hyperspherical_uniform_entropy(dim) - vmf_entropy(dim, kappa)
}

fn vmf_entropy_grad(dim: usize, kappa: f64) -> f64 {
    if kappa <= 0.0 {
        return 0.0;
    }
    let a = besseli_ratio(dim as f64 / 2.0 - 1.0, kappa);
    -kappa + kappa * a * a + (dim as f64 - 1.0) * a
}

fn vmf_log_normalizer_grad(dim: usize, kappa: f64) -> f64 {
    -besseli_ratio(dim as f64 / 2.0 - 1.0, kappa.max(0.0))
}

#[derive(Clone, Copy, Debug)]
enum VmfKind {
    Entropy,
    LogNormalizer,
}

#[derive(Clone, Copy, Debug)]
struct VmfOp {
    dim: usize,
    kind: VmfKind,
}

impl CustomOp1 for VmfOp {
    fn name(&self) -> &'static str {
        match self.kind {
            VmfKind::Entropy => "vmf-entropy",
            VmfKind::LogNormalizer => "vmf-log-normalizer",
        }
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        match self.kind {
            VmfKind::Entropy => map_cpu_storage(storage, layout, |k| vmf_entropy(self.dim, k)),
            VmfKind::LogNormalizer => {
                map_cpu_storage(storage, layout, |k| vmf_log_normalizer(self.dim, k))
            }
        }
    }

    fn bwd(&self, kappa: &Tensor, _res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        let slope = match self.kind {
            VmfKind::Entropy => host_map(kappa, |k| vmf_entropy_grad(self.dim, k))?,
            VmfKind::LogNormalizer => host_map(kappa, |k| vmf_log_normalizer_grad(self.dim, k))?,
        };
        Ok(Some(grad_res.mul(&slope)?))
    }
}

/// vMF entropy for every element of `kappa`, same shape.
pub fn vmf_entropy_t(dim: usize, kappa: &Tensor) -> Result<Tensor> {
    apply_on_host(
        kappa,
        VmfOp {
            dim,
            kind: VmfKind::Entropy,
        },
    )
}

/// vMF log normalizer log C_d(κ) for every element of `kappa`, same shape.
pub fn vmf_log_normalizer_t(dim: usize, kappa: &Tensor) -> Result<Tensor> {
    apply_on_host(
        kappa,
        VmfOp {
            dim,
            kind: VmfKind::LogNormalizer,
        },
    )
}

/// KL(vMF ‖ HU) for every element of `kappa`, same shape.
pub fn kl_divergence_t(dim: usize, kappa: &Tensor) -> Result<Tensor> {
    let hue = hyperspherical_uniform_entropy(dim);
    vmf_entropy_t(dim, kappa)?.affine(-1.0, hue)
}

/// vMF log density of each row of `x_nd`
///
/// * `x_nd` - unit vectors (n x d)
/// * `mu` - mean directions, `n x d` or a shared `1 x d`
/// * `kappa` - concentrations, `n x 1` or a shared `1 x 1`
///
/// Returns a `(n,)` tensor.
pub fn log_vmf_density(x_nd: &Tensor, mu: &Tensor, kappa: &Tensor) -> Result<Tensor> {
    let dd = x_nd.dim(1)?;
    let kappa_n = kappa.flatten_all()?;
    let cos_n = x_nd.broadcast_mul(mu)?.sum(1)?;
    let log_norm_n = vmf_log_normalizer_t(dd, &kappa_n)?;
    cos_n.broadcast_mul(&kappa_n)?.broadcast_add(&log_norm_n)
}

/// Gaussian log density with unit variance, summed over columns
///
/// log N(x; μ, I) = -‖x - μ‖²/2 - (D/2) log 2π
pub fn log_gaussian(x_nd: &Tensor, mu_nd: &Tensor) -> Result<Tensor> {
    let dd = x_nd.dim(1)? as f64;
    let half_log_2pi = 0.5 * std::f64::consts::TAU.ln();
    x_nd.broadcast_sub(mu_nd)?
        .sqr()?
        .sum(1)?
        .affine(-0.5, -dd * half_log_2pi)
}

/// Gaussian log density with diagonal variance, summed over columns
///
/// * `sigma2` - variances broadcastable to `x_nd` (`n x 1` for a shared
///   scalar per sample, `n x D` for a full diagonal)
pub fn log_gaussian_var(x_nd: &Tensor, mu_nd: &Tensor, sigma2: &Tensor) -> Result<Tensor> {
    let ln_2pi = std::f64::consts::TAU.ln();
    let sq_nd = x_nd.broadcast_sub(mu_nd)?.sqr()?;
    let scaled_nd = sq_nd.broadcast_div(sigma2)?;
    let log_var_nd = sigma2.log()?.broadcast_as(scaled_nd.shape())?;
    ((scaled_nd + log_var_nd)? + ln_2pi)?.sum(1)? * (-0.5)
}

/// log Σ exp(x) along `dim` with the running maximum factored out
pub fn log_sum_exp(x: &Tensor, dim: usize) -> Result<Tensor> {
    let max = x.max_keepdim(dim)?.detach();
    let shifted = x.broadcast_sub(&max)?;
    shifted.exp()?.sum_keepdim(dim)?.log()?.add(&max)?.squeeze(dim)
}
