use crate::vmf_sampler::l2_normalize_dim;
use candle_core::{Result, Tensor};

pub trait EncoderModuleT {
    /// An encoder that maps data to a hidden representation
    ///
    /// # Arguments
    /// * `x_nd` - input data (n x d)
    /// * `train` - whether to use dropout/batchnorm or not
    ///
    /// # Returns `h_nh` - hidden representation (n x h)
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<Tensor>;

    fn dim_obs(&self) -> usize;

    fn dim_hidden(&self) -> usize;
}

pub trait DecoderModuleT {
    /// A decoder that spits out reconstruction (n x dim_output)
    fn forward(&self, z_nk: &Tensor) -> Result<Tensor>;

    fn dim_latent(&self) -> usize;

    fn dim_output(&self) -> usize;
}

/// Projects raw keys onto the unit hypersphere where a memory compares them
pub trait KeyEncoderT {
    /// * `keys_nd` - raw keys (n x d)
    ///
    /// # Returns unit rows (n x e)
    fn encode_keys(&self, keys_nd: &Tensor) -> Result<Tensor>;

    /// Representative of a raw key as written into a memory slot
    fn canonical_key(&self, key_nd: &Tensor) -> Result<Tensor> {
        Ok(key_nd.clone())
    }
}

/// Identity embedding followed by row normalization
#[derive(Clone, Copy, Debug, Default)]
pub struct L2KeyEncoder;

impl KeyEncoderT for L2KeyEncoder {
    fn encode_keys(&self, keys_nd: &Tensor) -> Result<Tensor> {
        l2_normalize_dim(keys_nd, 1)
    }

    fn canonical_key(&self, key_nd: &Tensor) -> Result<Tensor> {
        l2_normalize_dim(key_nd, 1)
    }
}

/// Any differentiable map followed by row normalization
pub struct FnKeyEncoder<F>(pub F);

impl<F> KeyEncoderT for FnKeyEncoder<F>
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    fn encode_keys(&self, keys_nd: &Tensor) -> Result<Tensor> {
        l2_normalize_dim(&(self.0)(keys_nd)?, 1)
    }
}

impl<T> KeyEncoderT for &T
where
    T: KeyEncoderT + ?Sized,
{
    fn encode_keys(&self, keys_nd: &Tensor) -> Result<Tensor> {
        (**self).encode_keys(keys_nd)
    }

    fn canonical_key(&self, key_nd: &Tensor) -> Result<Tensor> {
        (**self).canonical_key(key_nd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn test_key_encoders_return_unit_rows() -> Result<()> {
        let keys = Tensor::new(&[[3f32, 4.], [0., -2.]], &Device::Cpu)?;

        let scaled = FnKeyEncoder(|x: &Tensor| x * 10.0);
        for out in [L2KeyEncoder.encode_keys(&keys)?, scaled.encode_keys(&keys)?] {
            let rows: Vec<Vec<f32>> = out.to_vec2()?;
            assert_abs_diff_eq!(rows[0][0], 0.6, epsilon = 1e-6);
            assert_abs_diff_eq!(rows[0][1], 0.8, epsilon = 1e-6);
            assert_abs_diff_eq!(rows[1][1], -1.0, epsilon = 1e-6);
        }

        // raw keys are stored as given unless the encoder normalizes them
        let stored: Vec<Vec<f32>> = scaled.canonical_key(&keys)?.to_vec2()?;
        assert_abs_diff_eq!(stored[0][1], 4.0);
        let stored: Vec<Vec<f32>> = (&L2KeyEncoder).canonical_key(&keys)?.to_vec2()?;
        assert_abs_diff_eq!(stored[0][1], 0.8, epsilon = 1e-6);
        Ok(())
    }
}
