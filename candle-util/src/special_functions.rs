//! Modified Bessel functions of the first kind.
//!
//! Everything is evaluated in `f64` on the host. The tensor wrappers are
//! candle custom ops carrying analytic gradients in `kappa`, so they can sit
//! inside a loss. With `R_ν(κ) = I_{ν+1}(κ) / I_ν(κ)`:
//!
//! ```text
//! d/dκ e^{-κ} I_ν(κ) = e^{-κ} I_ν(κ) (R_ν + ν/κ - 1)
//! d/dκ log I_ν(κ)    = R_ν + ν/κ
//! d/dκ R_ν(κ)        = 1 - R_ν² - (2ν + 1) R_ν / κ
//! ```
//!
//! # References
//! - Abramowitz & Stegun (1964), 9.6.10 (ascending series) and 9.7.1
//!   (large argument expansion)

use candle_core::{bail, CpuStorage, CustomOp1, DType, Device, Layout, Result, Shape, Tensor};
use special::Gamma;

/// Partial sums are pulled back by 10^280 before they overflow
const RESCALE_EXPONENT: i32 = 280;

const MAX_SERIES_TERMS: usize = 10_000_000;

const MAX_ASYMPTOTIC_TERMS: usize = 64;

fn ln_gamma(x: f64) -> f64 {
    Gamma::ln_gamma(x).0
}

/// The large argument expansion is used once `x` dominates `ν²`
#[inline]
fn use_asymptotic(nu: f64, x: f64) -> bool {
    x > 30.0 && x > 2.0 * nu * nu
}

/// log I_ν(x) by the ascending series
///
/// I_ν(x) = (x/2)^ν Σ_j (x²/4)^j / (j! Γ(ν + j + 1))
///
/// All terms are positive, so the only hazard is overflow of the partial
/// sum for large `x`, handled by rescaling into `log_scale`.
fn log_besseli_series(nu: f64, x: f64) -> f64 {
    let q = 0.25 * x * x;
    let rescale = 10f64.powi(RESCALE_EXPONENT);
    let log_rescale = RESCALE_EXPONENT as f64 * std::f64::consts::LN_10;

    let mut term = 1.0;
    let mut sum = 1.0;
    let mut log_scale = 0.0;

    for j in 1..MAX_SERIES_TERMS {
        let jf = j as f64;
        term *= q / (jf * (nu + jf));
        sum += term;

        let past_peak = jf * (nu + jf) > q;
        if past_peak && term <= f64::EPSILON * sum {
            break;
        }

        if sum > rescale {
            sum /= rescale;
            term /= rescale;
            log_scale += log_rescale;
        }
    }

    nu * (0.5 * x).ln() - ln_gamma(nu + 1.0) + log_scale + sum.ln()
}

/// log(e^{-x} I_ν(x)) by the Hankel expansion
///
/// e^{-x} I_ν(x) ≈ (2πx)^{-1/2} Σ_j (-1)^j a_j(ν) / x^j
///
/// Terminates exactly for half-integer orders.
fn log_besseli_scaled_asymptotic(nu: f64, x: f64) -> f64 {
    let mu = 4.0 * nu * nu;

    let mut term = 1.0_f64;
    let mut sum = 1.0_f64;

    for j in 1..MAX_ASYMPTOTIC_TERMS {
        let jf = j as f64;
        let odd = 2.0 * jf - 1.0;
        let next = -term * (mu - odd * odd) / (8.0 * jf * x);
        if next.abs() >= term.abs() {
            break;
        }
        term = next;
        sum += term;
        if term.abs() <= f64::EPSILON * sum.abs() {
            break;
        }
    }

    sum.ln() - 0.5 * (std::f64::consts::TAU * x).ln()
}

/// Logarithm of the modified Bessel function of the first kind, log I_ν(x)
///
/// * `nu` - order (ν ≥ 0)
/// * `x` - argument (x ≥ 0)
pub fn log_besseli(nu: f64, x: f64) -> f64 {
    debug_assert!(nu >= 0.0, "negative Bessel order {}", nu);

    if x <= 0.0 {
        return if nu == 0.0 { 0.0 } else { f64::NEG_INFINITY };
    }

    if use_asymptotic(nu, x) {
        x + log_besseli_scaled_asymptotic(nu, x)
    } else {
        log_besseli_series(nu, x)
    }
}

/// Exponentially scaled modified Bessel function, e^{-x} I_ν(x)
///
/// * `nu` - order (ν ≥ 0)
/// * `x` - argument (x ≥ 0)
pub fn besseli_scaled(nu: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return if nu == 0.0 { 1.0 } else { 0.0 };
    }

    if use_asymptotic(nu, x) {
        log_besseli_scaled_asymptotic(nu, x).exp()
    } else {
        (log_besseli_series(nu, x) - x).exp()
    }
}

/// Ratio of consecutive orders, R_ν(x) = I_{ν+1}(x) / I_ν(x)
///
/// This is the mean resultant length A_d(κ) of a VMF distribution with
/// ν = d/2 - 1.
pub fn besseli_ratio(nu: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    (log_besseli(nu + 1.0, x) - log_besseli(nu, x)).exp()
}

fn besseli_scaled_grad(nu: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return match nu {
            n if n == 0.0 => -1.0,
            n if n < 1.0 => f64::INFINITY,
            n if n == 1.0 => 0.5,
            _ => 0.0,
        };
    }
    besseli_scaled(nu, x) * (besseli_ratio(nu, x) + nu / x - 1.0)
}

fn log_besseli_grad(nu: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return if nu == 0.0 { 0.0 } else { f64::INFINITY };
    }
    besseli_ratio(nu, x) + nu / x
}

fn besseli_ratio_grad(nu: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 1.0 / (2.0 * nu + 2.0);
    }
    let r = besseli_ratio(nu, x);
    1.0 - r * r - (2.0 * nu + 1.0) * r / x
}

/////////////////////////////////////
// host-side element-wise plumbing //
/////////////////////////////////////

/// Element-wise map of a contiguous f32/f64 CPU storage, computed in f64
pub(crate) fn map_cpu_storage<F>(
    storage: &CpuStorage,
    layout: &Layout,
    f: F,
) -> Result<(CpuStorage, Shape)>
where
    F: Fn(f64) -> f64,
{
    let (start, end) = match layout.contiguous_offsets() {
        Some(offsets) => offsets,
        None => bail!("host op expects a contiguous input"),
    };

    let out = match storage {
        CpuStorage::F32(vs) => {
            CpuStorage::F32(vs[start..end].iter().map(|&v| f(v as f64) as f32).collect())
        }
        CpuStorage::F64(vs) => CpuStorage::F64(vs[start..end].iter().map(|&v| f(v)).collect()),
        _ => bail!("host op supports f32 and f64 only"),
    };

    Ok((out, layout.shape().clone()))
}

/// Element-wise map without gradient tracking, keeping dtype and device
pub(crate) fn host_map<F>(x: &Tensor, f: F) -> Result<Tensor>
where
    F: Fn(f64) -> f64,
{
    let values: Vec<f64> = x
        .to_dtype(DType::F64)?
        .flatten_all()?
        .to_vec1::<f64>()?
        .into_iter()
        .map(f)
        .collect();
    Tensor::from_vec(values, x.shape(), x.device())?.to_dtype(x.dtype())
}

/// Run a host op on the CPU and move the result back to the input device
pub(crate) fn apply_on_host<C>(x: &Tensor, op: C) -> Result<Tensor>
where
    C: CustomOp1 + Send + Sync + 'static,
{
    let device = x.device().clone();
    x.to_device(&Device::Cpu)?
        .contiguous()?
        .apply_op1(op)?
        .to_device(&device)
}

#[derive(Clone, Copy, Debug)]
enum BesselKind {
    Scaled,
    Log,
    Ratio,
}

#[derive(Clone, Copy, Debug)]
struct BesselOp {
    order: f64,
    kind: BesselKind,
}

impl BesselOp {
    fn value(&self, x: f64) -> f64 {
        match self.kind {
            BesselKind::Scaled => besseli_scaled(self.order, x),
            BesselKind::Log => log_besseli(self.order, x),
            BesselKind::Ratio => besseli_ratio(self.order, x),
        }
    }

    fn derivative(&self, x: f64) -> f64 {
        match self.kind {
            BesselKind::Scaled => besseli_scaled_grad(self.order, x),
            BesselKind::Log => log_besseli_grad(self.order, x),
            BesselKind::Ratio => besseli_ratio_grad(self.order, x),
        }
    }
}

impl CustomOp1 for BesselOp {
    fn name(&self) -> &'static str {
        match self.kind {
            BesselKind::Scaled => "besseli-scaled",
            BesselKind::Log => "log-besseli",
            BesselKind::Ratio => "besseli-ratio",
        }
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        map_cpu_storage(storage, layout, |x| self.value(x))
    }

    fn bwd(&self, kappa: &Tensor, _res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        let slope = host_map(kappa, |x| self.derivative(x))?;
        Ok(Some(grad_res.mul(&slope)?))
    }
}

/// e^{-κ} I_ν(κ) element-wise, differentiable in κ
pub fn besseli_scaled_t(nu: f64, kappa: &Tensor) -> Result<Tensor> {
    apply_on_host(
        kappa,
        BesselOp {
            order: nu,
            kind: BesselKind::Scaled,
        },
    )
}

/// log I_ν(κ) element-wise, differentiable in κ
pub fn log_besseli_t(nu: f64, kappa: &Tensor) -> Result<Tensor> {
    apply_on_host(
        kappa,
        BesselOp {
            order: nu,
            kind: BesselKind::Log,
        },
    )
}

/// I_{ν+1}(κ) / I_ν(κ) element-wise, differentiable in κ
pub fn besseli_ratio_t(nu: f64, kappa: &Tensor) -> Result<Tensor> {
    apply_on_host(
        kappa,
        BesselOp {
            order: nu,
            kind: BesselKind::Ratio,
        },
    )
}
