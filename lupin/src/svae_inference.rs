use crate::svae::Svae;

use candle_util::candle_core::{DType, Device, Tensor};
use candle_util::candle_loss_functions::mmd_imq;
use candle_util::candle_model_traits::{DecoderModuleT, EncoderModuleT};
use candle_util::candle_nn::{AdamW, Optimizer, VarMap};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SvaeObjective {
    /// reconstruction + β KL
    Elbo,
    /// reconstruction + β MMD to the prior
    Wasserstein,
    /// reconstruction + β MMD to ±μ₀ by label
    SemiSupervised,
}

pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub num_epochs: usize,
    /// weight of the divergence term
    pub beta: f64,
    /// weight of the normal group in semi-supervised training
    pub alpha: f64,
    /// scale c of the inverse multiquadric kernel
    pub kernel_scale: f64,
    pub device: Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            batch_size: 100,
            num_epochs: 100,
            beta: 1.0,
            alpha: 0.5,
            kernel_scale: 2.0,
            device: Device::Cpu,
            verbose: false,
            show_progress: true,
        }
    }
}

/// Train the encoder, decoder and prior of an S-VAE on shuffled minibatches
///
/// * `model` - the model; its prior parameters are optimized too
/// * `variable_map` - parameters of encoder, decoder and heads
/// * `x_nd` - data (n x D)
/// * `labels` - one label per row, required by `SemiSupervised`
///
/// Returns the mean minibatch loss of every epoch.
pub fn train_svae<Enc, Dec>(
    model: &Svae<Enc, Dec>,
    variable_map: &VarMap,
    x_nd: &Tensor,
    labels: Option<&[u32]>,
    objective: SvaeObjective,
    train_config: &TrainConfig,
) -> anyhow::Result<Vec<f32>>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
{
    let nn = x_nd.dim(0)?;
    if nn == 0 || train_config.batch_size == 0 {
        anyhow::bail!("empty data or zero batch size");
    }
    if let Some(labels) = labels {
        if labels.len() != nn {
            anyhow::bail!("{} labels for {} rows", labels.len(), nn);
        }
    } else if objective == SvaeObjective::SemiSupervised {
        anyhow::bail!("semi-supervised training needs labels");
    }

    let x_nd = x_nd.to_device(&train_config.device)?;

    let mut params = variable_map.all_vars();
    params.extend(model.prior_vars());
    let mut adam = AdamW::new_lr(params, train_config.learning_rate.into())?;

    let kernel_scale = train_config.kernel_scale;
    let distance = |a: &Tensor, b: &Tensor| mmd_imq(a, b, kernel_scale);

    let pb = ProgressBar::new(train_config.num_epochs as u64);
    if !train_config.show_progress || train_config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut rng = rand::rng();
    let mut order: Vec<u32> = (0..nn as u32).collect();
    let mut loss_trace = vec![];

    for epoch in 0..train_config.num_epochs {
        order.shuffle(&mut rng);
        let mut loss_tot = 0f32;
        let mut num_minibatches = 0;

        for batch in order.chunks(train_config.batch_size) {
            let idx = Tensor::from_slice(batch, batch.len(), &train_config.device)?;
            let x_bd = x_nd.index_select(&idx, 0)?;

            let loss = match objective {
                SvaeObjective::Elbo => model.elbo_loss(&x_bd, train_config.beta)?,
                SvaeObjective::Wasserstein => {
                    model.wasserstein_loss(&x_bd, train_config.beta, &distance)?
                }
                SvaeObjective::SemiSupervised => {
                    let labels = labels.ok_or(anyhow::anyhow!("labels"))?;
                    let labels_b: Vec<u32> = batch.iter().map(|&i| labels[i as usize]).collect();
                    model.semi_supervised_wasserstein_loss(
                        &x_bd,
                        &labels_b,
                        train_config.beta,
                        &distance,
                        train_config.alpha,
                    )?
                }
            };

            adam.backward_step(&loss)?;
            loss_tot += loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            num_minibatches += 1;
        }

        loss_trace.push(loss_tot / num_minibatches as f32);
        pb.inc(1);

        if train_config.verbose {
            info!(
                "[{}] loss: {}",
                epoch + 1,
                loss_trace.last().ok_or(anyhow::anyhow!("loss"))?
            );
        }
    }
    pb.finish_and_clear();
    Ok(loss_trace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svae::DecoderVariant;
    use candle_util::candle_aux_layers::{MlpDecoder, MlpEncoder};
    use candle_util::candle_nn::VarBuilder;

    #[test]
    fn test_training_reduces_loss() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

        // rank-2 data in 10 dimensions
        let h = Tensor::randn(0f32, 1f32, (200, 2), &dev)?;
        let w = Tensor::randn(0f32, 1f32, (2, 10), &dev)?;
        let x = h.matmul(&w)?;

        let enc = MlpEncoder::new(10, &[32], vs.pp("enc"))?;
        let dec = MlpDecoder::new(4, &[32], 10, vs.pp("dec"))?;
        let model = Svae::new(enc, dec, 4, DecoderVariant::Unit, vs.pp("svae"))?;

        let config = TrainConfig {
            learning_rate: 1e-2,
            batch_size: 50,
            num_epochs: 30,
            show_progress: false,
            ..Default::default()
        };

        let trace = train_svae(&model, &varmap, &x, None, SvaeObjective::Wasserstein, &config)?;
        assert_eq!(trace.len(), 30);
        assert!(trace.iter().all(|v| v.is_finite()));

        let head: f32 = trace[..5].iter().sum::<f32>() / 5.0;
        let tail: f32 = trace[25..].iter().sum::<f32>() / 5.0;
        assert!(tail < head, "{} -> {}", head, tail);
        Ok(())
    }

    #[test]
    fn test_semi_supervised_needs_labels() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let enc = MlpEncoder::new(6, &[8], vs.pp("enc"))?;
        let dec = MlpDecoder::new(4, &[], 6, vs.pp("dec"))?;
        let model = Svae::two_caps(enc, dec, 4, DecoderVariant::Unit, 5.0, vs.pp("svae"))?;

        let x = Tensor::randn(0f32, 1f32, (20, 6), &dev)?;
        let config = TrainConfig {
            num_epochs: 2,
            batch_size: 8,
            show_progress: false,
            ..Default::default()
        };
        let unlabelled = train_svae(
            &model,
            &varmap,
            &x,
            None,
            SvaeObjective::SemiSupervised,
            &config,
        );
        assert!(unlabelled.is_err());

        let mut labels = vec![0u32; 20];
        labels[3] = 1;
        labels[11] = 1;
        let trace = train_svae(
            &model,
            &varmap,
            &x,
            Some(&labels),
            SvaeObjective::SemiSupervised,
            &config,
        )?;
        assert_eq!(trace.len(), 2);
        Ok(())
    }
}
