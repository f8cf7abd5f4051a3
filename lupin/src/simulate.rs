use candle_util::candle_aux_layers::{MlpDecoder, MlpEncoder};
use candle_util::candle_core::{DType, Device, Tensor};
use candle_util::candle_inverse_map::InverseMapSolver;
use candle_util::candle_nn::{VarBuilder, VarMap};
use clap::{Args, ValueEnum};
use log::info;
use lupin::knn_memory::{KnnMemory, MemoryConfig};
use lupin::svae::{DecoderVariant, Svae, ANOMALY_LABEL};
use lupin::svae_inference::{train_svae, SvaeObjective, TrainConfig};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::Serialize;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum Objective {
    Elbo,
    Wasserstein,
    SemiSupervised,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum Variant {
    Unit,
    ScalarSigma,
}

impl From<Objective> for SvaeObjective {
    fn from(o: Objective) -> Self {
        match o {
            Objective::Elbo => SvaeObjective::Elbo,
            Objective::Wasserstein => SvaeObjective::Wasserstein,
            Objective::SemiSupervised => SvaeObjective::SemiSupervised,
        }
    }
}

impl From<Variant> for DecoderVariant {
    fn from(v: Variant) -> Self {
        match v {
            Variant::Unit => DecoderVariant::Unit,
            Variant::ScalarSigma => DecoderVariant::ScalarSigma,
        }
    }
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[arg(
        long,
        default_value_t = 20,
        help = "Number of features",
        long_help = "Number of features (columns) of the simulated data."
    )]
    features: usize,

    #[arg(
        long,
        default_value_t = 3,
        help = "Rank of the normal population",
        long_help = "Normal samples lie near a random subspace of this rank.\n\
		     x = W h + noise, h ~ N(0, I)"
    )]
    rank: usize,

    #[arg(
        long,
        default_value_t = 0.1,
        help = "Noise standard deviation"
    )]
    noise: f32,

    #[arg(
        long,
        default_value_t = 3.0,
        help = "Anomaly shift",
        long_help = "Anomalies are normal samples shifted by this distance\n\
		     along a random direction."
    )]
    anomaly_shift: f32,

    #[arg(long, default_value_t = 1000, help = "Normal training samples")]
    n_normal: usize,

    #[arg(
        long,
        default_value_t = 50,
        help = "Anomalous training samples",
        long_help = "Anomalous training samples.\n\
		     Only `n_labelled` of them carry a label; the rest are\n\
		     unlabelled contamination of the training data."
    )]
    n_anomaly: usize,

    #[arg(long, default_value_t = 10, help = "Labelled anomalies")]
    n_labelled: usize,

    #[arg(
        long,
        default_value_t = 50,
        help = "Labelled normal samples written to the memory"
    )]
    n_labelled_normal: usize,

    #[arg(long, default_value_t = 500, help = "Normal test samples")]
    n_test_normal: usize,

    #[arg(long, default_value_t = 50, help = "Anomalous test samples")]
    n_test_anomaly: usize,

    #[arg(long, default_value_t = 8, help = "Latent dimension (> 3)")]
    zdim: usize,

    #[arg(
        long,
        short = 'e',
        value_delimiter(','),
        default_values_t = vec![64, 32],
        help = "Encoder layers",
        long_help = "Encoder layers (comma-separated).\n\
		     Example: 64,32"
    )]
    encoder_layers: Vec<usize>,

    #[arg(
        long,
        short = 'd',
        value_delimiter(','),
        default_values_t = vec![32, 64],
        help = "Decoder layers",
        long_help = "Decoder hidden layers (comma-separated).\n\
		     Example: 32,64"
    )]
    decoder_layers: Vec<usize>,

    #[arg(
        long,
        value_enum,
        default_value = "unit",
        help = "Decoder variant",
        long_help = "unit: unit-variance Gaussian decoder\n\
		     scalarsigma: the decoder also emits a per-sample variance"
    )]
    variant: Variant,

    #[arg(
        long,
        value_enum,
        default_value = "semisupervised",
        help = "Training objective",
        long_help = "elbo: reconstruction + KL\n\
		     wasserstein: reconstruction + MMD to the prior\n\
		     semisupervised: reconstruction + MMD, anomalies matched to the antipodal cap"
    )]
    objective: Objective,

    #[arg(long, default_value_t = 10.0, help = "Initial prior concentration")]
    prior_kappa: f64,

    #[arg(long, default_value_t = 1.0, help = "Weight of the divergence term")]
    beta: f64,

    #[arg(
        long,
        default_value_t = 0.5,
        help = "Weight of the normal group in semi-supervised training"
    )]
    alpha: f64,

    #[arg(long, short = 'i', default_value_t = 100, help = "Number of training epochs")]
    epochs: usize,

    #[arg(long, default_value_t = 100, help = "Minibatch size")]
    minibatch_size: usize,

    #[arg(long, default_value_t = 1e-3, help = "Learning rate")]
    learning_rate: f32,

    #[arg(long, default_value_t = 200, help = "Memory slots")]
    memory_size: usize,

    #[arg(long, default_value_t = 16, help = "Neighbours consulted per query")]
    knn: usize,

    #[arg(long, default_value_t = 0.1, help = "Margin of the memory loss")]
    margin: f64,

    #[arg(long, default_value_t = 3, help = "Passes of labelled data through the memory")]
    memory_epochs: usize,

    #[arg(
        long,
        default_value_t = 100,
        help = "Steps of the inverse map",
        long_help = "Maximum gradient steps when moving a memory key\n\
		     so that its embedding reaches a target direction."
    )]
    inverse_map_iter: usize,

    #[arg(long, default_value_t = 10.0, help = "Concentration of the memory vMF mixture")]
    query_kappa: f64,

    #[arg(long, default_value_t = 10, help = "Importance samples for log p(x)")]
    importance_samples: usize,

    #[arg(long, default_value_t = 42, help = "Random seed")]
    seed: u64,

    #[arg(long, short, help = "Output JSON file (default: stdout)")]
    out: Option<Box<str>>,

    #[arg(
        long,
        value_enum,
        default_value = "cpu",
        help = "Candle device",
        long_help = "Candle device to use for computation.\n\
		     Options: cpu, cuda, metal."
    )]
    device: ComputeDevice,

    #[arg(long, default_value_t = 0, help = "A device for cuda or metal")]
    device_no: usize,

    #[arg(long, short, help = "Verbosity")]
    verbose: bool,
}

struct SyntheticData {
    x_train: Vec<f32>,
    truth_train: Vec<u32>,
    observed_train: Vec<u32>,
    x_test: Vec<f32>,
    truth_test: Vec<u32>,
}

impl SyntheticData {
    fn generate(args: &SimulateArgs, rng: &mut StdRng) -> Self {
        let (dd, rr) = (args.features, args.rank);
        let loading: Vec<f32> = (0..dd * rr).map(|_| rng.sample(StandardNormal)).collect();

        let mut shift: Vec<f32> = (0..dd).map(|_| rng.sample(StandardNormal)).collect();
        let norm = shift.iter().map(|s| s * s).sum::<f32>().sqrt().max(1e-8);
        shift.iter_mut().for_each(|s| *s *= args.anomaly_shift / norm);

        let mut draw = |nn: usize, anomalous: bool, out: &mut Vec<f32>| {
            for _ in 0..nn {
                let h: Vec<f32> = (0..rr).map(|_| rng.sample(StandardNormal)).collect();
                for j in 0..dd {
                    let signal: f32 = (0..rr).map(|r| loading[j * rr + r] * h[r]).sum();
                    let eps: f32 = rng.sample(StandardNormal);
                    let offset = if anomalous { shift[j] } else { 0.0 };
                    out.push(signal + offset + args.noise * eps);
                }
            }
        };

        let mut x_train = Vec::with_capacity((args.n_normal + args.n_anomaly) * dd);
        draw(args.n_normal, false, &mut x_train);
        draw(args.n_anomaly, true, &mut x_train);

        let mut x_test = Vec::with_capacity((args.n_test_normal + args.n_test_anomaly) * dd);
        draw(args.n_test_normal, false, &mut x_test);
        draw(args.n_test_anomaly, true, &mut x_test);

        let truth = |n0: usize, n1: usize| -> Vec<u32> {
            std::iter::repeat(0)
                .take(n0)
                .chain(std::iter::repeat(ANOMALY_LABEL).take(n1))
                .collect()
        };

        let truth_train = truth(args.n_normal, args.n_anomaly);
        let nlab = args.n_labelled.min(args.n_anomaly);
        let observed_train = truth(args.n_normal + args.n_anomaly - nlab, nlab);

        Self {
            x_train,
            truth_train,
            observed_train,
            x_test,
            truth_test: truth(args.n_test_normal, args.n_test_anomaly),
        }
    }
}

#[derive(Serialize)]
struct ScoreSummary {
    auc: f64,
    mean_normal: f64,
    mean_anomaly: f64,
}

impl ScoreSummary {
    fn new(scores: &[f32], labels: &[u32]) -> Self {
        let mean_of = |target: u32| -> f64 {
            let sel: Vec<f64> = scores
                .iter()
                .zip(labels.iter())
                .filter(|(_, &y)| y == target)
                .map(|(&s, _)| s as f64)
                .collect();
            if sel.is_empty() {
                f64::NAN
            } else {
                sel.iter().sum::<f64>() / sel.len() as f64
            }
        };
        Self {
            auc: roc_auc(scores, labels),
            mean_normal: mean_of(0),
            mean_anomaly: mean_of(ANOMALY_LABEL),
        }
    }
}

#[derive(Serialize)]
struct SimulationSummary {
    n_train: usize,
    n_train_anomaly: usize,
    n_labelled_anomaly: usize,
    n_test: usize,
    final_loss: Option<f32>,
    memory_loss: Vec<f32>,
    memory_score: ScoreSummary,
    memory_probability: ScoreSummary,
    neg_log_px: ScoreSummary,
}

/// Area under the ROC curve with average ranks for ties
///
/// 0.5 when either class is missing.
pub fn roc_auc(scores: &[f32], labels: &[u32]) -> f64 {
    let nn = scores.len();
    let npos = labels.iter().filter(|&&y| y == ANOMALY_LABEL).count();
    let nneg = nn - npos;
    if npos == 0 || nneg == 0 {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..nn).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0f64; nn];
    let mut i = 0;
    while i < nn {
        let mut j = i;
        while j + 1 < nn && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &o in order[i..=j].iter() {
            ranks[o] = rank;
        }
        i = j + 1;
    }

    let rank_sum: f64 = (0..nn)
        .filter(|&i| labels[i] == ANOMALY_LABEL)
        .map(|i| ranks[i])
        .sum();
    let (np, nq) = (npos as f64, nneg as f64);
    (rank_sum - np * (np + 1.0) / 2.0) / (np * nq)
}

pub fn run_simulate(args: &SimulateArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    if args.features == 0 || args.rank == 0 {
        anyhow::bail!("need at least one feature and rank one");
    }

    let dev = match args.device {
        ComputeDevice::Metal => Device::new_metal(args.device_no)?,
        ComputeDevice::Cuda => Device::new_cuda(args.device_no)?,
        _ => Device::Cpu,
    };

    // 1. simulate normal and shifted populations
    let mut rng = StdRng::seed_from_u64(args.seed);
    let data = SyntheticData::generate(args, &mut rng);
    let dd = args.features;
    let ntrain = data.truth_train.len();
    let ntest = data.truth_test.len();

    let x_train = Tensor::from_slice(&data.x_train, (ntrain, dd), &dev)?;
    let x_test = Tensor::from_slice(&data.x_test, (ntest, dd), &dev)?;
    info!(
        "simulated {} training ({} anomalies) and {} test samples",
        ntrain, args.n_anomaly, ntest
    );

    // 2. train the model
    let variant: DecoderVariant = args.variant.into();
    let nout = match variant {
        DecoderVariant::Unit => dd,
        DecoderVariant::ScalarSigma => dd + 1,
    };

    let parameters = VarMap::new();
    let param_builder = VarBuilder::from_varmap(&parameters, DType::F32, &dev);
    let encoder = MlpEncoder::new(dd, &args.encoder_layers, param_builder.pp("enc"))?;
    let decoder = MlpDecoder::new(args.zdim, &args.decoder_layers, nout, param_builder.pp("dec"))?;
    let model = Svae::two_caps(
        encoder,
        decoder,
        args.zdim,
        variant,
        args.prior_kappa,
        param_builder.pp("svae"),
    )?;

    let train_config = TrainConfig {
        learning_rate: args.learning_rate,
        batch_size: args.minibatch_size,
        num_epochs: args.epochs,
        beta: args.beta,
        alpha: args.alpha,
        kernel_scale: 2.0,
        device: dev.clone(),
        verbose: args.verbose,
        show_progress: true,
    };

    let loss_trace = train_svae(
        &model,
        &parameters,
        &x_train,
        Some(&data.observed_train),
        args.objective.into(),
        &train_config,
    )?;
    info!("trained for {} epochs", loss_trace.len());

    // 3. write labelled examples into the memory
    let labelled_anomalies: Vec<usize> = (0..ntrain)
        .filter(|&i| data.observed_train[i] == ANOMALY_LABEL)
        .collect();
    let unlabelled: Vec<usize> = (0..ntrain)
        .filter(|&i| data.observed_train[i] != ANOMALY_LABEL)
        .collect();
    let nnorm = args.n_labelled_normal.min(unlabelled.len());
    let labelled_normals: Vec<usize> = sample(&mut rng, unlabelled.len(), nnorm)
        .into_iter()
        .map(|i| unlabelled[i])
        .collect();

    let mem_rows: Vec<u32> = labelled_anomalies
        .iter()
        .chain(labelled_normals.iter())
        .map(|&i| i as u32)
        .collect();
    let mem_labels: Vec<u32> = mem_rows
        .iter()
        .map(|&i| data.observed_train[i as usize])
        .collect();
    let mem_keys = x_train.index_select(&Tensor::from_slice(&mem_rows, mem_rows.len(), &dev)?, 0)?;

    let memory_config = MemoryConfig::new(args.memory_size, args.knn, 2, args.margin);
    let mut memory = KnnMemory::new(&model, dd, memory_config, &dev)?
        .with_solver(InverseMapSolver::new(args.inverse_map_iter, 0.01, 1e-3));

    let mut memory_loss = vec![];
    if !mem_rows.is_empty() {
        for epoch in 0..args.memory_epochs {
            let loss = memory.train_query(&mem_keys, &mem_labels)?;
            let loss = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            info!("[memory {}] margin loss: {}", epoch + 1, loss);
            memory_loss.push(loss);
        }
    }

    // 4. score the test set
    let memory_score = memory.query(&x_test)?.anomaly_scores;
    let memory_probability = memory.probabilistic_query(&x_test, args.query_kappa)?;
    let neg_log_px: Vec<f32> = model
        .log_px(&x_test, args.importance_samples)?
        .neg()?
        .to_dtype(DType::F32)?
        .to_vec1()?;

    let summary = SimulationSummary {
        n_train: ntrain,
        n_train_anomaly: data.truth_train.iter().filter(|&&y| y == ANOMALY_LABEL).count(),
        n_labelled_anomaly: labelled_anomalies.len(),
        n_test: ntest,
        final_loss: loss_trace.last().copied(),
        memory_loss,
        memory_score: ScoreSummary::new(&memory_score, &data.truth_test),
        memory_probability: ScoreSummary::new(&memory_probability, &data.truth_test),
        neg_log_px: ScoreSummary::new(&neg_log_px, &data.truth_test),
    };

    let json = serde_json::to_string_pretty(&summary)?;
    match args.out.as_deref() {
        Some(path) => {
            std::fs::write(path, json)?;
            info!("wrote {}", path);
        }
        None => println!("{}", json),
    }
    Ok(())
}
