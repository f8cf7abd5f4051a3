use candle_core::{Result, Tensor};

/// Mean squared reconstruction error over every element
///
/// * `x_nd` - data tensor (observed data)
/// * `hat_nd` - reconstruction
///
pub fn mse_loss(x_nd: &Tensor, hat_nd: &Tensor) -> Result<Tensor> {
    x_nd.sub(hat_nd)?.sqr()?.mean_all()
}

/// Softplus log(1 + exp(x)) without overflow
///
/// softplus(x) = max(x, 0) + log(1 + exp(-|x|))
///
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    x.relu()?.add(&tail)
}

/// Inverse multiquadric kernel between unit rows
///
/// k(x, y) = c / (c + ‖x - y‖²) = c / (c + 2 - 2 cos(x, y))
///
/// * `x_nk` - unit vectors (n x k)
/// * `y_mk` - unit vectors (m x k)
///
/// Returns the `n x m` kernel matrix.
pub fn imq_kernel_cosine(x_nk: &Tensor, y_mk: &Tensor, c: f64) -> Result<Tensor> {
    let cos_nm = x_nk.matmul(&y_mk.t()?)?;
    cos_nm.affine(-2.0, 2.0 + c)?.recip()? * c
}

/// Maximum mean discrepancy between two samples on the sphere with the
/// inverse multiquadric kernel (biased V-statistic)
///
/// MMD² = mean k(x, x') + mean k(y, y') - 2 mean k(x, y)
///
/// * `x_nk` - first sample, e.g. encoded latents
/// * `y_mk` - second sample, e.g. draws from the prior
/// * `c` - kernel scale
///
pub fn mmd_imq(x_nk: &Tensor, y_mk: &Tensor, c: f64) -> Result<Tensor> {
    let kxx = imq_kernel_cosine(x_nk, x_nk, c)?.mean_all()?;
    let kyy = imq_kernel_cosine(y_mk, y_mk, c)?.mean_all()?;
    let kxy = imq_kernel_cosine(x_nk, y_mk, c)?.mean_all()?;
    (kxx + kyy)? - (kxy * 2.0)?
}

/// Triplet-style margin loss averaged over a batch
///
/// loss(i) = max(0, neg(i) - pos(i) + α)
///
/// * `pos_n` - similarity to the nearest correctly labelled neighbour
/// * `neg_n` - similarity to the nearest wrongly labelled neighbour
/// * `alpha` - margin
///
pub fn margin_loss(pos_n: &Tensor, neg_n: &Tensor, alpha: f64) -> Result<Tensor> {
    ((neg_n - pos_n)? + alpha)?.relu()?.mean_all()
}
