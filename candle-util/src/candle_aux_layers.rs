use crate::candle_model_traits::{DecoderModuleT, EncoderModuleT};
use candle_core::{Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};

/// build a stack of alternating `M` and `A` layers
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Activation>>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Stack `dims[0] -> dims[1] -> ...` linear layers; the last layer gets
/// `last_act` (or nothing), every other one `act`.
fn linear_stack(
    dims: &[usize],
    act: Activation,
    last_act: Option<Activation>,
    vs: VarBuilder,
) -> Result<StackLayers<Linear>> {
    let mut fc = StackLayers::<Linear>::new();
    let nlayers = dims.len().saturating_sub(1);
    for j in 0..nlayers {
        let layer = candle_nn::linear(dims[j], dims[j + 1], vs.pp(format!("fc.{}", j)))?;
        match (j + 1 == nlayers, last_act) {
            (true, None) => fc.push(layer),
            (true, Some(a)) => fc.push_with_act(layer, a),
            (false, _) => fc.push_with_act(layer, act),
        }
    }
    Ok(fc)
}

/// Fully connected encoder `x -> h`
pub struct MlpEncoder {
    n_features: usize,
    n_hidden: usize,
    fc: StackLayers<Linear>,
}

impl MlpEncoder {
    /// Will create a new encoder with these variables:
    ///
    /// * `{vs}.fc.{}.weight` where {} is the layer index
    ///
    /// * `n_features` - input dimension
    /// * `layers` - hidden widths; the last one is the output width
    pub fn new(n_features: usize, layers: &[usize], vs: VarBuilder) -> Result<Self> {
        if layers.is_empty() {
            candle_core::bail!("encoder needs at least one layer");
        }
        let mut dims = vec![n_features];
        dims.extend_from_slice(layers);
        let fc = linear_stack(&dims, Activation::Relu, Some(Activation::Relu), vs)?;
        Ok(Self {
            n_features,
            n_hidden: layers[layers.len() - 1],
            fc,
        })
    }
}

impl EncoderModuleT for MlpEncoder {
    fn forward_t(&self, x_nd: &Tensor, _train: bool) -> Result<Tensor> {
        self.fc.forward(x_nd)
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_hidden(&self) -> usize {
        self.n_hidden
    }
}

/// Fully connected decoder `z -> xhat` with a linear output layer
pub struct MlpDecoder {
    n_latent: usize,
    n_output: usize,
    fc: StackLayers<Linear>,
}

impl MlpDecoder {
    /// Will create a new decoder with these variables:
    ///
    /// * `{vs}.fc.{}.weight` where {} is the layer index
    ///
    /// * `n_latent` - latent dimension
    /// * `layers` - hidden widths (may be empty)
    /// * `n_output` - output width (`D`, or `D + 1` with a variance output)
    pub fn new(n_latent: usize, layers: &[usize], n_output: usize, vs: VarBuilder) -> Result<Self> {
        let mut dims = vec![n_latent];
        dims.extend_from_slice(layers);
        dims.push(n_output);
        let fc = linear_stack(&dims, Activation::Relu, None, vs)?;
        Ok(Self {
            n_latent,
            n_output,
            fc,
        })
    }
}

impl DecoderModuleT for MlpDecoder {
    fn forward(&self, z_nk: &Tensor) -> Result<Tensor> {
        self.fc.forward(z_nk)
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }

    fn dim_output(&self) -> usize {
        self.n_output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_mlp_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let enc = MlpEncoder::new(10, &[16, 8], vs.pp("enc"))?;
        let dec = MlpDecoder::new(4, &[8], 11, vs.pp("dec"))?;

        let x = Tensor::randn(0f32, 1f32, (5, 10), &device)?;
        let h = enc.forward_t(&x, true)?;
        assert_eq!(h.dims(), &[5, 8]);
        assert_eq!(enc.dim_hidden(), 8);

        let z = Tensor::randn(0f32, 1f32, (5, 4), &device)?;
        let y = dec.forward(&z)?;
        assert_eq!(y.dims(), &[5, 11]);

        assert_eq!(varmap.all_vars().len(), 8);
        Ok(())
    }
}
