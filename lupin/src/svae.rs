//! Hyperspherical variational autoencoder.
//!
//! The encoder maps x to a hidden vector h, two linear heads turn h into
//! the parameters of q(z|x) = vMF(μ(x), κ(x)) on S^{k-1}, and the decoder
//! maps a reparameterized draw z back to data space.
//!
//! Two priors are supported:
//! - hyperspherical uniform (fixed, log p(z) = -H_U)
//! - a learnable vMF(μ₀, κ₀), the "two caps" model; normal samples are
//!   pulled toward +μ₀ and labelled anomalies toward -μ₀.

use candle_util::candle_core::{bail, DType, Device, IndexOp, Result, Tensor, Var};
use candle_util::candle_loss_functions::{mse_loss, softplus};
use candle_util::candle_model_traits::{DecoderModuleT, EncoderModuleT, KeyEncoderT};
use candle_util::candle_nn::{self, AdamW, Linear, Module, Optimizer, ParamsAdamW, VarBuilder};
use candle_util::vmf_density::*;
use candle_util::vmf_sampler::*;
use nalgebra::DMatrix;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// ln κ₀ is kept within ±6.9, i.e. κ₀ ≤ ~1000
pub const MAX_LN_KAPPA: f64 = 6.9;

/// Label of anomalous examples in semi-supervised training
pub const ANOMALY_LABEL: u32 = 1;

const MIN_SIGMA2: f64 = 1e-6;
const MIN_SINGULAR_VALUE: f64 = 1e-300;

/// How the decoder output is read
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecoderVariant {
    /// `D` outputs, unit-variance Gaussian likelihood
    Unit,
    /// `D + 1` outputs, the last one is a per-sample variance
    ScalarSigma,
}

/// Learnable vMF prior vMF(μ₀, κ₀)
pub struct VmfPrior {
    /// unnormalized mean direction (1 x k)
    mu_raw: Var,
    /// ln κ₀ (1 x 1)
    ln_kappa: Var,
}

impl VmfPrior {
    /// Random unit mean direction with concentration `init_kappa`
    pub fn new(zdim: usize, init_kappa: f64, device: &Device, dtype: DType) -> Result<Self> {
        if init_kappa <= 0.0 {
            bail!("prior concentration must be positive, got {}", init_kappa);
        }
        let mu = sample_hyperspherical_uniform(1, zdim, device)?.to_dtype(dtype)?;
        let ln_kappa = Tensor::new(&[[init_kappa.ln() as f32]], device)?.to_dtype(dtype)?;
        Ok(Self {
            mu_raw: Var::from_tensor(&mu)?,
            ln_kappa: Var::from_tensor(&ln_kappa)?,
        })
    }

    /// unit mean direction (1 x k)
    pub fn mean(&self) -> Result<Tensor> {
        l2_normalize_dim(self.mu_raw.as_tensor(), 1)
    }

    /// κ₀ = exp(clamp(ln κ₀)) (1 x 1)
    pub fn kappa(&self) -> Result<Tensor> {
        self.ln_kappa
            .as_tensor()
            .clamp(-MAX_LN_KAPPA, MAX_LN_KAPPA)?
            .exp()
    }

    pub fn vars(&self) -> Vec<Var> {
        vec![self.mu_raw.clone(), self.ln_kappa.clone()]
    }

    fn set_mean(&self, direction: &Tensor) -> Result<()> {
        let zdim = self.mu_raw.dim(1)?;
        let v = direction
            .detach()
            .reshape((1, zdim))?
            .to_dtype(self.mu_raw.dtype())?
            .to_device(self.mu_raw.device())?;
        self.mu_raw.set(&l2_normalize_dim(&v, 1)?)
    }

    /// `nn` draws from vMF(sign · μ₀, κ₀)
    fn sample(&self, nn: usize, sign: f64) -> Result<Tensor> {
        let zdim = self.mu_raw.dim(1)?;
        let mu_nk = (self.mean()? * sign)?.broadcast_as((nn, zdim))?.contiguous()?;
        let kappa_n1 = self.kappa()?.broadcast_as((nn, 1))?.contiguous()?;
        sample_z(&mu_nk, &kappa_n1)
    }
}

pub enum LatentPrior {
    Uniform,
    Vmf(VmfPrior),
}

/// Gradient-ascent settings for `closest_z` and `manifold_z`
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LatentRefinementConfig {
    pub num_steps: usize,
    pub learning_rate: f64,
}

impl Default for LatentRefinementConfig {
    fn default() -> Self {
        Self {
            num_steps: 100,
            learning_rate: 1e-2,
        }
    }
}

impl LatentRefinementConfig {
    pub fn new(num_steps: usize, learning_rate: f64) -> Self {
        Self {
            num_steps,
            learning_rate,
        }
    }
}

pub struct Svae<Enc, Dec>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
{
    encoder: Enc,
    decoder: Dec,
    z_mean: Linear,
    z_kappa: Linear,
    zdim: usize,
    hue: f64,
    variant: DecoderVariant,
    prior: LatentPrior,
}

impl<Enc, Dec> Svae<Enc, Dec>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
{
    /// S-VAE with a hyperspherical uniform prior
    ///
    /// Creates `{vs}.z_mean` and `{vs}.z_kappa` linear heads on top of the
    /// encoder.
    ///
    /// * `encoder` - `x (n x D) -> h (n x H)`
    /// * `decoder` - `z (n x k) -> D` outputs (`D + 1` for `ScalarSigma`)
    /// * `zdim` - latent dimension k (> 3)
    pub fn new(
        encoder: Enc,
        decoder: Dec,
        zdim: usize,
        variant: DecoderVariant,
        vs: VarBuilder,
    ) -> Result<Self> {
        if zdim <= 3 {
            bail!("latent dimension must be greater than 3, got {}", zdim);
        }
        if decoder.dim_latent() != zdim {
            bail!(
                "decoder takes {} latent dimensions, but zdim = {}",
                decoder.dim_latent(),
                zdim
            );
        }
        let expected = match variant {
            DecoderVariant::Unit => encoder.dim_obs(),
            DecoderVariant::ScalarSigma => encoder.dim_obs() + 1,
        };
        if decoder.dim_output() != expected {
            bail!(
                "{:?} decoder must emit {} outputs for {} features, found {}",
                variant,
                expected,
                encoder.dim_obs(),
                decoder.dim_output()
            );
        }

        let nh = encoder.dim_hidden();
        let z_mean = candle_nn::linear(nh, zdim, vs.pp("z_mean"))?;
        let z_kappa = candle_nn::linear(nh, 1, vs.pp("z_kappa"))?;

        Ok(Self {
            encoder,
            decoder,
            z_mean,
            z_kappa,
            zdim,
            hue: hyperspherical_uniform_entropy(zdim),
            variant,
            prior: LatentPrior::Uniform,
        })
    }

    /// S-VAE with a learnable vMF prior
    ///
    /// The prior parameters are not part of `vs`; hand `prior_vars()` to
    /// the optimizer alongside the variable map.
    pub fn two_caps(
        encoder: Enc,
        decoder: Dec,
        zdim: usize,
        variant: DecoderVariant,
        prior_kappa: f64,
        vs: VarBuilder,
    ) -> Result<Self> {
        let (device, dtype) = (vs.device().clone(), vs.dtype());
        let mut model = Self::new(encoder, decoder, zdim, variant, vs)?;
        model.prior = LatentPrior::Vmf(VmfPrior::new(zdim, prior_kappa, &device, dtype)?);
        Ok(model)
    }

    pub fn zdim(&self) -> usize {
        self.zdim
    }

    /// entropy of the hyperspherical uniform on S^{k-1}
    pub fn hue(&self) -> f64 {
        self.hue
    }

    pub fn variant(&self) -> DecoderVariant {
        self.variant
    }

    pub fn prior(&self) -> &LatentPrior {
        &self.prior
    }

    pub fn encoder(&self) -> &Enc {
        &self.encoder
    }

    pub fn decoder(&self) -> &Dec {
        &self.decoder
    }

    /// Trainable prior parameters (empty for the uniform prior)
    pub fn prior_vars(&self) -> Vec<Var> {
        match &self.prior {
            LatentPrior::Uniform => vec![],
            LatentPrior::Vmf(p) => p.vars(),
        }
    }

    /// Point the prior mean at `normalize(direction)`
    pub fn set_normal_direction(&mut self, direction: &Tensor) -> Result<()> {
        match &self.prior {
            LatentPrior::Vmf(p) => p.set_mean(direction),
            LatentPrior::Uniform => bail!("the uniform prior has no direction to set"),
        }
    }

    /// Posterior parameters of q(z|x)
    ///
    /// # Returns `(mu_nk, kappa_n1)` with unit rows in `mu_nk` and `kappa > 1`
    pub fn zparams(&self, x_nd: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let h_nh = self.encoder.forward_t(x_nd, train)?;
        let mu_nk = l2_normalize_dim(&self.z_mean.forward(&h_nh)?, 1)?;
        let kappa_n1 = (softplus(&self.z_kappa.forward(&h_nh)?)? + 1.0)?;
        Ok((mu_nk, kappa_n1))
    }

    /// Mean direction μ(x) only
    pub fn mean_direction(&self, x_nd: &Tensor, train: bool) -> Result<Tensor> {
        let h_nh = self.encoder.forward_t(x_nd, train)?;
        l2_normalize_dim(&self.z_mean.forward(&h_nh)?, 1)
    }

    /// Reconstruction and, for `ScalarSigma`, the variance column
    pub fn decode(&self, z_nk: &Tensor) -> Result<(Tensor, Option<Tensor>)> {
        let out = self.decoder.forward(z_nk)?;
        match self.variant {
            DecoderVariant::Unit => Ok((out, None)),
            DecoderVariant::ScalarSigma => {
                let dd = out.dim(1)? - 1;
                let xhat_nd = out.narrow(1, 0, dd)?;
                let sigma2_n1 = (softplus(&out.narrow(1, dd, 1)?)? + MIN_SIGMA2)?;
                Ok((xhat_nd, Some(sigma2_n1)))
            }
        }
    }

    /// log p(x|z) for each row, `(n,)`
    pub fn log_likelihood(&self, x_nd: &Tensor, z_nk: &Tensor) -> Result<Tensor> {
        match self.decode(z_nk)? {
            (xhat_nd, None) => log_gaussian(x_nd, &xhat_nd),
            (xhat_nd, Some(sigma2_n1)) => log_gaussian_var(x_nd, &xhat_nd, &sigma2_n1),
        }
    }

    /// log p(z) for each row, `(n,)`
    pub fn log_prior(&self, z_nk: &Tensor) -> Result<Tensor> {
        match &self.prior {
            LatentPrior::Uniform => {
                let nn = z_nk.dim(0)?;
                Tensor::ones(nn, z_nk.dtype(), z_nk.device())? * (-self.hue)
            }
            LatentPrior::Vmf(p) => log_vmf_density(z_nk, &p.mean()?, &p.kappa()?),
        }
    }

    /// Mean squared error (`Unit`) or mean negative log-likelihood
    /// (`ScalarSigma`)
    pub fn reconstruction_error(&self, x_nd: &Tensor, z_nk: &Tensor) -> Result<Tensor> {
        match self.decode(z_nk)? {
            (xhat_nd, None) => mse_loss(x_nd, &xhat_nd),
            (xhat_nd, Some(sigma2_n1)) => log_gaussian_var(x_nd, &xhat_nd, &sigma2_n1)?
                .mean_all()?
                .neg(),
        }
    }

    /// `nn` draws from the prior
    pub fn sample_prior(&self, nn: usize, device: &Device, dtype: DType) -> Result<Tensor> {
        match &self.prior {
            LatentPrior::Uniform => {
                sample_hyperspherical_uniform(nn, self.zdim, device)?.to_dtype(dtype)
            }
            LatentPrior::Vmf(p) => p.sample(nn, 1.0),
        }
    }

    /// Reconstruction error + β · KL(q(z|x) ‖ p(z)), averaged over rows
    ///
    /// The KL term is exact for the uniform prior. For the vMF prior it is
    /// the one-sample estimate -H[q] - log p(z).
    pub fn elbo_loss(&self, x_nd: &Tensor, beta: f64) -> Result<Tensor> {
        let (mu_nk, kappa_n1) = self.zparams(x_nd, true)?;
        let z_nk = sample_z(&mu_nk, &kappa_n1)?;
        let recon = self.reconstruction_error(x_nd, &z_nk)?;

        let kl = match &self.prior {
            LatentPrior::Uniform => kl_divergence_t(self.zdim, &kappa_n1)?.mean_all()?,
            LatentPrior::Vmf(_) => {
                let neg_entropy_n = vmf_entropy_t(self.zdim, &kappa_n1.flatten_all()?)?.neg()?;
                (neg_entropy_n - self.log_prior(&z_nk)?)?.mean_all()?
            }
        };
        recon + (kl * beta)?
    }

    /// Reconstruction error + β · distance(q samples, prior samples)
    ///
    /// * `distance` - e.g. `|a, b| mmd_imq(a, b, 2.0)`
    pub fn wasserstein_loss<D>(&self, x_nd: &Tensor, beta: f64, distance: &D) -> Result<Tensor>
    where
        D: Fn(&Tensor, &Tensor) -> Result<Tensor>,
    {
        let (mu_nk, kappa_n1) = self.zparams(x_nd, true)?;
        let z_nk = sample_z(&mu_nk, &kappa_n1)?;
        let recon = self.reconstruction_error(x_nd, &z_nk)?;

        let nn = z_nk.dim(0)?;
        let zprior_nk = self.sample_prior(nn, z_nk.device(), z_nk.dtype())?;
        recon + (distance(&z_nk, &zprior_nk)? * beta)?
    }

    /// Wasserstein loss with normal rows matched to vMF(+μ₀, κ₀) and
    /// anomalies (label 1) matched to vMF(-μ₀, κ₀)
    ///
    /// Each group is resampled with replacement to the batch size. The
    /// normal term is weighted by `alpha`, the anomaly term by `1 - alpha`.
    /// Without anomalies in the batch this is `wasserstein_loss`.
    pub fn semi_supervised_wasserstein_loss<D>(
        &self,
        x_nd: &Tensor,
        labels: &[u32],
        beta: f64,
        distance: &D,
        alpha: f64,
    ) -> Result<Tensor>
    where
        D: Fn(&Tensor, &Tensor) -> Result<Tensor>,
    {
        let prior = match &self.prior {
            LatentPrior::Vmf(p) => p,
            LatentPrior::Uniform => {
                bail!("semi-supervised training needs the learnable vMF prior")
            }
        };

        let nn = x_nd.dim(0)?;
        if labels.len() != nn {
            bail!("{} labels for {} rows", labels.len(), nn);
        }

        let (anomalous, normal): (Vec<usize>, Vec<usize>) =
            (0..nn).partition(|&i| labels[i] == ANOMALY_LABEL);

        if anomalous.is_empty() {
            return self.wasserstein_loss(x_nd, beta, distance);
        }

        let (mu_nk, kappa_n1) = self.zparams(x_nd, true)?;
        let z_nk = sample_z(&mu_nk, &kappa_n1)?;
        let recon = self.reconstruction_error(x_nd, &z_nk)?;

        let mut rng = rand::rng();
        let mut resample = |group: &[usize]| -> Result<Tensor> {
            let idx: Vec<u32> = (0..nn)
                .map(|_| group[rng.random_range(0..group.len())] as u32)
                .collect();
            z_nk.index_select(&Tensor::from_vec(idx, nn, z_nk.device())?, 0)
        };

        let anomaly_term = distance(&resample(&anomalous)?, &prior.sample(nn, -1.0)?)?;
        let divergence = if normal.is_empty() {
            (anomaly_term * (1.0 - alpha))?
        } else {
            let normal_term = distance(&resample(&normal)?, &prior.sample(nn, 1.0)?)?;
            ((normal_term * alpha)? + (anomaly_term * (1.0 - alpha))?)?
        };

        recon + (divergence * beta)?
    }

    /// Importance-weighted log marginal likelihood with `num_samples`
    /// draws from q(z|x)
    ///
    /// log Σ_s exp(log p(x|z_s) + log p(z_s) - log q(z_s|x))
    ///
    /// Not divided by the number of samples. Returns `(n,)`.
    pub fn log_px(&self, x_nd: &Tensor, num_samples: usize) -> Result<Tensor> {
        if num_samples == 0 {
            bail!("need at least one importance sample");
        }
        let (mu_nk, kappa_n1) = self.zparams(x_nd, false)?;

        let log_w = (0..num_samples)
            .map(|_| {
                let z_nk = sample_z(&mu_nk, &kappa_n1)?;
                let llik_n = self.log_likelihood(x_nd, &z_nk)?;
                let log_prior_n = self.log_prior(&z_nk)?;
                let log_q_n = log_vmf_density(&z_nk, &mu_nk, &kappa_n1)?;
                (llik_n + log_prior_n)? - log_q_n
            })
            .collect::<Result<Vec<_>>>()?;

        log_sum_exp(&Tensor::stack(&log_w, 1)?, 1)
    }

    /// log p(μ(x)) + 2 Σ log s_i over the singular values of the encoder
    /// Jacobian dμ/dx
    ///
    /// Singular values are floored at `MIN_SINGULAR_VALUE`, so a rank
    /// deficient Jacobian gives a large negative but finite value.
    ///
    /// * `x_1d` - a single instance (1 x D)
    pub fn log_pz_jacobian_encoder(&self, x_1d: &Tensor) -> Result<f64> {
        check_single_instance(x_1d)?;
        let x = Var::from_tensor(&x_1d.detach())?;
        let mu_1k = self.mean_direction(x.as_tensor(), false)?;

        let jacobian = jacobian_rows(&mu_1k, x.as_tensor())?;
        let log_det = sum_log_singular_values(&jacobian);

        let log_prior = scalar_f64(&self.log_prior(&mu_1k.detach())?)?;
        Ok(log_prior + 2.0 * log_det)
    }

    /// log p(μ(x)) - 2 Σ log s_i over the singular values of the decoder
    /// Jacobian d x̂/dz evaluated at z = μ(x)
    ///
    /// * `x_1d` - a single instance (1 x D)
    pub fn log_pz_jacobian_decoder(&self, x_1d: &Tensor) -> Result<f64> {
        check_single_instance(x_1d)?;
        let mu_1k = self.mean_direction(x_1d, false)?.detach();
        let z = Var::from_tensor(&mu_1k)?;
        let (xhat_1d, _) = self.decode(z.as_tensor())?;

        let jacobian = jacobian_rows(&xhat_1d, z.as_tensor())?;
        let log_det = sum_log_singular_values(&jacobian);

        let log_prior = scalar_f64(&self.log_prior(&mu_1k)?)?;
        Ok(log_prior - 2.0 * log_det)
    }

    /// Maximize log p(x|z) + log p(z) over z on the sphere starting from μ(x)
    pub fn closest_z(&self, x_nd: &Tensor, config: &LatentRefinementConfig) -> Result<Tensor> {
        self.refine_latent(x_nd, config, true)
    }

    /// Maximize log p(x|z) over z on the sphere starting from μ(x)
    pub fn manifold_z(&self, x_nd: &Tensor, config: &LatentRefinementConfig) -> Result<Tensor> {
        self.refine_latent(x_nd, config, false)
    }

    fn refine_latent(
        &self,
        x_nd: &Tensor,
        config: &LatentRefinementConfig,
        with_prior: bool,
    ) -> Result<Tensor> {
        let x_nd = x_nd.detach();
        let z = Var::from_tensor(&self.mean_direction(&x_nd, false)?.detach())?;

        let mut adam = AdamW::new(
            vec![z.clone()],
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;

        for _ in 0..config.num_steps {
            let z_nk = l2_normalize_dim(z.as_tensor(), 1)?;
            let mut objective_n = self.log_likelihood(&x_nd, &z_nk)?;
            if with_prior {
                objective_n = (objective_n + self.log_prior(&z_nk)?)?;
            }
            adam.backward_step(&objective_n.sum_all()?.neg()?)?;
            z.set(&l2_normalize_dim(z.as_tensor(), 1)?)?;
        }

        Ok(z.as_tensor().detach())
    }
}

impl<Enc, Dec> KeyEncoderT for Svae<Enc, Dec>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
{
    fn encode_keys(&self, keys_nd: &Tensor) -> Result<Tensor> {
        self.mean_direction(keys_nd, false)
    }
}

fn check_single_instance(x: &Tensor) -> Result<()> {
    let nn = x.dim(0)?;
    if nn != 1 {
        bail!(
            "Jacobian densities are defined for a single instance, got a batch of {}",
            nn
        );
    }
    Ok(())
}

fn scalar_f64(x: &Tensor) -> Result<f64> {
    x.flatten_all()?
        .to_dtype(DType::F64)?
        .to_device(&Device::Cpu)?
        .i(0)?
        .to_scalar::<f64>()
}

/// Jacobian d y / d x of a `1 x p` output with respect to a `1 x q` input,
/// one backward pass per output coordinate
fn jacobian_rows(y_1p: &Tensor, x_1q: &Tensor) -> Result<DMatrix<f64>> {
    let pp = y_1p.dim(1)?;
    let qq = x_1q.dim(1)?;
    let mut entries = Vec::with_capacity(pp * qq);

    for j in 0..pp {
        let grads = y_1p.i((0, j))?.backward()?;
        match grads.get(x_1q) {
            Some(g) => entries.extend(
                g.flatten_all()?
                    .to_dtype(DType::F64)?
                    .to_device(&Device::Cpu)?
                    .to_vec1::<f64>()?,
            ),
            None => entries.extend(std::iter::repeat(0.0).take(qq)),
        }
    }
    Ok(DMatrix::from_row_slice(pp, qq, &entries))
}

/// Σ log s_i over all singular values
fn sum_log_singular_values(jacobian: &DMatrix<f64>) -> f64 {
    jacobian
        .singular_values()
        .iter()
        .map(|s| s.max(MIN_SINGULAR_VALUE).ln())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_util::candle_aux_layers::{MlpDecoder, MlpEncoder};
    use candle_util::candle_loss_functions::mmd_imq;
    use candle_util::candle_nn::VarMap;

    const NFEAT: usize = 12;
    const ZDIM: usize = 5;

    fn build(
        varmap: &VarMap,
        variant: DecoderVariant,
        two_caps: bool,
    ) -> Result<Svae<MlpEncoder, MlpDecoder>> {
        let dev = Device::Cpu;
        let vs = VarBuilder::from_varmap(varmap, DType::F32, &dev);
        let nout = match variant {
            DecoderVariant::Unit => NFEAT,
            DecoderVariant::ScalarSigma => NFEAT + 1,
        };
        let enc = MlpEncoder::new(NFEAT, &[16], vs.pp("enc"))?;
        let dec = MlpDecoder::new(ZDIM, &[16], nout, vs.pp("dec"))?;
        if two_caps {
            Svae::two_caps(enc, dec, ZDIM, variant, 10.0, vs.pp("svae"))
        } else {
            Svae::new(enc, dec, ZDIM, variant, vs.pp("svae"))
        }
    }

    fn data(nn: usize) -> Result<Tensor> {
        Tensor::randn(0f32, 1f32, (nn, NFEAT), &Device::Cpu)
    }

    fn mmd(a: &Tensor, b: &Tensor) -> Result<Tensor> {
        mmd_imq(a, b, 2.0)
    }

    /// h = x
    struct IdentityEncoder(usize);

    impl EncoderModuleT for IdentityEncoder {
        fn forward_t(&self, x_nd: &Tensor, _train: bool) -> Result<Tensor> {
            Ok(x_nd.clone())
        }

        fn dim_obs(&self) -> usize {
            self.0
        }

        fn dim_hidden(&self) -> usize {
            self.0
        }
    }

    /// Two-cap model whose posterior is vMF(μ₀, κ) for every input and
    /// whose decoder output does not depend on z
    fn pinned_two_caps(
        mu0: &[f32],
        kappa: f64,
    ) -> Result<(VarMap, Svae<IdentityEncoder, MlpDecoder>)> {
        let dev = Device::Cpu;
        let mut varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let dec = MlpDecoder::new(ZDIM, &[], NFEAT, vs.pp("dec"))?;
        let mut model = Svae::two_caps(
            IdentityEncoder(NFEAT),
            dec,
            ZDIM,
            DecoderVariant::Unit,
            kappa,
            vs.pp("svae"),
        )?;

        // softplus(b) + 1 = κ
        let y = kappa - 1.0;
        let kappa_bias = (y + (-(-y).exp()).ln_1p()) as f32;
        let mu0 = Tensor::new(mu0, &dev)?;
        let zeros = |shape: (usize, usize)| Tensor::zeros(shape, DType::F32, &dev);
        varmap.set_one("svae.z_mean.weight", zeros((ZDIM, NFEAT))?)?;
        varmap.set_one("svae.z_mean.bias", &mu0)?;
        varmap.set_one("svae.z_kappa.weight", zeros((1, NFEAT))?)?;
        varmap.set_one("svae.z_kappa.bias", Tensor::new(&[kappa_bias], &dev)?)?;
        varmap.set_one("dec.fc.0.weight", zeros((NFEAT, ZDIM))?)?;
        model.set_normal_direction(&mu0)?;
        Ok((varmap, model))
    }

    #[test]
    fn test_rejects_small_latent_dimension() -> Result<()> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let enc = MlpEncoder::new(NFEAT, &[8], vs.pp("enc"))?;
        let dec = MlpDecoder::new(3, &[], NFEAT, vs.pp("dec"))?;
        let err = Svae::new(enc, dec, 3, DecoderVariant::Unit, vs.pp("svae"));
        assert!(err.is_err());
        Ok(())
    }

    #[test]
    fn test_rejects_wrong_decoder_width() -> Result<()> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let enc = MlpEncoder::new(NFEAT, &[8], vs.pp("enc"))?;
        let dec = MlpDecoder::new(ZDIM, &[], NFEAT, vs.pp("dec"))?;
        let err = Svae::new(enc, dec, ZDIM, DecoderVariant::ScalarSigma, vs.pp("svae"));
        assert!(err.is_err());
        Ok(())
    }

    #[test]
    fn test_zparams() -> Result<()> {
        let varmap = VarMap::new();
        let model = build(&varmap, DecoderVariant::Unit, false)?;
        let (mu, kappa) = model.zparams(&data(7)?, false)?;
        assert_eq!(mu.dims(), &[7, ZDIM]);
        assert_eq!(kappa.dims(), &[7, 1]);

        let norms: Vec<f32> = mu.sqr()?.sum(1)?.sqrt()?.to_vec1()?;
        for r in norms {
            assert_abs_diff_eq!(r, 1.0, epsilon = 1e-5);
        }
        let kappa: Vec<f32> = kappa.flatten_all()?.to_vec1()?;
        assert!(kappa.iter().all(|&k| k > 1.0));
        assert_abs_diff_eq!(model.hue(), hyperspherical_uniform_entropy(ZDIM));
        Ok(())
    }

    #[test]
    fn test_scalar_sigma_decoder() -> Result<()> {
        let varmap = VarMap::new();
        let model = build(&varmap, DecoderVariant::ScalarSigma, false)?;
        let z = sample_hyperspherical_uniform(4, ZDIM, &Device::Cpu)?;
        let (xhat, sigma2) = model.decode(&z)?;
        assert_eq!(xhat.dims(), &[4, NFEAT]);
        let sigma2: Vec<f32> = sigma2.expect("variance column").flatten_all()?.to_vec1()?;
        assert!(sigma2.iter().all(|&s| s > 0.0));

        let llik = model.log_likelihood(&data(4)?, &z)?;
        assert_eq!(llik.dims(), &[4]);
        Ok(())
    }

    #[test]
    fn test_losses_are_finite_and_differentiable() -> Result<()> {
        let varmap = VarMap::new();
        let model = build(&varmap, DecoderVariant::Unit, true)?;
        let x = data(16)?;

        let elbo = model.elbo_loss(&x, 1.0)?;
        let wass = model.wasserstein_loss(&x, 1.0, &mmd)?;
        for loss in [elbo, wass] {
            let v: f32 = loss.to_scalar()?;
            assert!(v.is_finite());
            let grads = loss.backward()?;
            let touched = varmap
                .all_vars()
                .iter()
                .filter(|v| grads.get(v.as_tensor()).is_some())
                .count();
            assert!(touched > 0);
        }
        Ok(())
    }

    #[test]
    fn test_semi_supervised_loss() -> Result<()> {
        let varmap = VarMap::new();
        let model = build(&varmap, DecoderVariant::ScalarSigma, true)?;
        let x = data(10)?;
        let labels = [0, 0, 1, 0, 0, 0, 1, 0, 0, 0];
        let loss: f32 = model
            .semi_supervised_wasserstein_loss(&x, &labels, 1.0, &mmd, 0.5)?
            .to_scalar()?;
        assert!(loss.is_finite());

        // no anomalies: plain Wasserstein loss
        let loss: f32 = model
            .semi_supervised_wasserstein_loss(&x, &[0; 10], 1.0, &mmd, 0.5)?
            .to_scalar()?;
        assert!(loss.is_finite());

        assert!(model
            .semi_supervised_wasserstein_loss(&x, &[0; 3], 1.0, &mmd, 0.5)
            .is_err());

        let uniform_varmap = VarMap::new();
        let uniform = build(&uniform_varmap, DecoderVariant::Unit, false)?;
        assert!(uniform
            .semi_supervised_wasserstein_loss(&x, &labels, 1.0, &mmd, 0.5)
            .is_err());
        Ok(())
    }

    #[test]
    fn test_anomalies_are_pulled_to_the_opposite_cap() -> Result<()> {
        // posterior and prior both concentrated at +μ₀
        let (_varmap, model) = pinned_two_caps(&[0.6, 0.8, 0., 0., 0.], 900.0)?;
        let x = data(32)?;

        let as_normal: f32 = model
            .semi_supervised_wasserstein_loss(&x, &[0; 32], 1.0, &mmd, 0.5)?
            .to_scalar()?;
        let as_anomaly: f32 = model
            .semi_supervised_wasserstein_loss(&x, &[ANOMALY_LABEL; 32], 1.0, &mmd, 0.5)?
            .to_scalar()?;

        // same reconstruction; only the anomaly term sees -μ₀
        assert!(
            as_anomaly > as_normal + 0.3,
            "normal {} vs anomaly {}",
            as_normal,
            as_anomaly
        );
        Ok(())
    }

    #[test]
    fn test_log_px_sums_importance_weights() -> Result<()> {
        // q(z|x) = p(z) and p(x|z) is constant in z: every importance
        // weight is the same, so log Σ_s w_s = log w + ln S
        let (_varmap, model) = pinned_two_caps(&[0., 0., 1., 0., 0.], 10.0)?;
        let x = data(3)?;

        let lp1: Vec<f32> = model.log_px(&x, 1)?.to_vec1()?;
        let lp16: Vec<f32> = model.log_px(&x, 16)?.to_vec1()?;
        for (a, b) in lp1.iter().zip(lp16.iter()) {
            assert_abs_diff_eq!(b - a, 16f32.ln(), epsilon = 1e-3);
        }
        Ok(())
    }

    #[test]
    fn test_log_px() -> Result<()> {
        let varmap = VarMap::new();
        let model = build(&varmap, DecoderVariant::Unit, false)?;
        let x = data(6)?;
        let lp1: Vec<f32> = model.log_px(&x, 1)?.to_vec1()?;
        let lp8: Vec<f32> = model.log_px(&x, 8)?.to_vec1()?;
        assert_eq!(lp8.len(), 6);
        assert!(lp1.iter().chain(lp8.iter()).all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn test_jacobian_densities() -> Result<()> {
        let varmap = VarMap::new();
        let model = build(&varmap, DecoderVariant::Unit, true)?;
        let x = data(3)?;
        assert!(model.log_pz_jacobian_encoder(&x).is_err());
        assert!(model.log_pz_jacobian_decoder(&x).is_err());

        let x1 = x.narrow(0, 0, 1)?;
        assert!(model.log_pz_jacobian_encoder(&x1)?.is_finite());
        assert!(model.log_pz_jacobian_decoder(&x1)?.is_finite());
        Ok(())
    }

    #[test]
    fn test_singular_values_of_a_scaling() {
        let j = DMatrix::from_row_slice(2, 3, &[2.0, 0.0, 0.0, 0.0, 0.5, 0.0]);
        assert_abs_diff_eq!(sum_log_singular_values(&j), 0.0, epsilon = 1e-12);

        // the smallest singular value counts, floored when it vanishes
        let j = DMatrix::from_row_slice(2, 2, &[3.0, 0.0, 0.0, 0.0]);
        let expected = 3f64.ln() + MIN_SINGULAR_VALUE.ln();
        assert_abs_diff_eq!(sum_log_singular_values(&j), expected, epsilon = 1e-9);
    }

    #[test]
    fn test_encoder_jacobian_of_a_linear_map() -> Result<()> {
        // μ(x) = normalize(y), y = (x, c): with |y| = r the Jacobian
        // (I - μμᵀ) [I; 0] / r has singular values 1/r (D - 1 times) and
        // c / r², so Σ log s = ln c - (D + 1) ln r
        let dev = Device::Cpu;
        let nfeat = ZDIM - 1;
        let c = 4f64;

        let mut varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let dec = MlpDecoder::new(ZDIM, &[], nfeat, vs.pp("dec"))?;
        let model = Svae::new(
            IdentityEncoder(nfeat),
            dec,
            ZDIM,
            DecoderVariant::Unit,
            vs.pp("svae"),
        )?;

        let mut weight = vec![0f32; ZDIM * nfeat];
        for i in 0..nfeat {
            weight[i * nfeat + i] = 1.0;
        }
        let mut bias = vec![0f32; ZDIM];
        bias[ZDIM - 1] = c as f32;
        let weight = Tensor::from_vec(weight, (ZDIM, nfeat), &dev)?;
        varmap.set_one("svae.z_mean.weight", weight)?;
        varmap.set_one("svae.z_mean.bias", Tensor::from_vec(bias, ZDIM, &dev)?)?;

        // |x| = 3, so r = 5
        let x = Tensor::new(&[[1f32, 2., 2., 0.]], &dev)?;
        let r = 5f64;
        let log_det = c.ln() - (nfeat as f64 + 1.0) * r.ln();
        let expected = -model.hue() + 2.0 * log_det;

        let value = model.log_pz_jacobian_encoder(&x)?;
        assert_abs_diff_eq!(value, expected, epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn test_refinement_improves_reconstruction() -> Result<()> {
        let varmap = VarMap::new();
        let model = build(&varmap, DecoderVariant::Unit, true)?;
        let x = data(4)?;
        let config = LatentRefinementConfig::new(100, 0.01);

        let z0 = model.mean_direction(&x, false)?;
        let z1 = model.manifold_z(&x, &config)?;
        let z2 = model.closest_z(&x, &config)?;
        assert_eq!(z1.dims(), &[4, ZDIM]);

        let norms: Vec<f32> = z2.sqr()?.sum(1)?.sqrt()?.to_vec1()?;
        for r in norms {
            assert_abs_diff_eq!(r, 1.0, epsilon = 1e-4);
        }

        let before: f32 = model.log_likelihood(&x, &z0)?.sum_all()?.to_scalar()?;
        let after: f32 = model.log_likelihood(&x, &z1)?.sum_all()?.to_scalar()?;
        assert!(after >= before - 1e-3, "{} < {}", after, before);
        Ok(())
    }

    #[test]
    fn test_set_normal_direction() -> Result<()> {
        let varmap = VarMap::new();
        let mut model = build(&varmap, DecoderVariant::Unit, true)?;
        let v = Tensor::new(&[3f32, 0., 4., 0., 0.], &Device::Cpu)?;
        model.set_normal_direction(&v)?;

        let LatentPrior::Vmf(prior) = model.prior() else {
            panic!("expected a vMF prior");
        };
        let mean: Vec<f32> = prior.mean()?.flatten_all()?.to_vec1()?;
        assert_abs_diff_eq!(mean[0], 0.6, epsilon = 1e-5);
        assert_abs_diff_eq!(mean[2], 0.8, epsilon = 1e-5);
        assert_eq!(model.prior_vars().len(), 2);

        let uniform_varmap = VarMap::new();
        let mut uniform = build(&uniform_varmap, DecoderVariant::Unit, false)?;
        assert!(uniform.set_normal_direction(&v).is_err());
        Ok(())
    }
}
