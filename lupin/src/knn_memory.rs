//! Fixed-capacity key-value memory with k-nearest-neighbour lookup.
//!
//! Slots hold a key in input space (`M`), an integer label (`V`) and an
//! age (`A`). Keys are compared on the unit sphere after the key encoder;
//! training queries produce a margin loss against the current contents
//! and then write into the memory, either by moving the matching slot
//! toward the query or by overwriting the oldest slot.

use candle_util::candle_core::{bail, DType, Device, Result, Tensor};
use candle_util::candle_inverse_map::InverseMapSolver;
use candle_util::candle_loss_functions::margin_loss;
use candle_util::candle_model_traits::KeyEncoderT;
use candle_util::vmf_sampler::{l2_normalize_dim, sample_hyperspherical_uniform};
use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::svae::ANOMALY_LABEL;

/// Ties between equally old slots are broken by U(0, AGE_JITTER)
const AGE_JITTER: f64 = 0.5;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// number of slots
    pub memory_size: usize,
    /// neighbours consulted per query
    pub k: usize,
    /// labels are drawn from `0..label_count` at initialization
    pub label_count: u32,
    /// margin of the training loss
    pub alpha: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            memory_size: 1000,
            k: 256,
            label_count: 2,
            alpha: 0.1,
        }
    }
}

impl MemoryConfig {
    pub fn new(memory_size: usize, k: usize, label_count: u32, alpha: f64) -> Self {
        Self {
            memory_size,
            k,
            label_count,
            alpha,
        }
    }
}

pub struct KnnQueryOutput {
    /// label of the nearest slot
    pub labels: Vec<u32>,
    /// softmax mass of anomaly-labelled slots among the k nearest
    pub anomaly_scores: Vec<f32>,
    /// cosine similarity to the nearest slot
    pub similarities: Vec<f32>,
}

pub struct KnnMemory<E>
where
    E: KeyEncoderT,
{
    encoder: E,
    keys_md: Tensor,
    values: Vec<u32>,
    ages: Vec<u32>,
    config: MemoryConfig,
    solver: InverseMapSolver,
}

impl<E> KnnMemory<E>
where
    E: KeyEncoderT,
{
    /// Memory with random unit keys, random labels and zero ages
    ///
    /// * `encoder` - maps raw keys onto the sphere where they are compared
    /// * `key_dim` - dimension of the raw keys
    pub fn new(encoder: E, key_dim: usize, config: MemoryConfig, device: &Device) -> Result<Self> {
        if config.k == 0 || config.k > config.memory_size {
            bail!(
                "need 0 < k <= memory size, got k = {} with {} slots",
                config.k,
                config.memory_size
            );
        }
        if config.label_count == 0 {
            bail!("label count must be positive");
        }

        let keys_md = sample_hyperspherical_uniform(config.memory_size, key_dim, device)?;
        let mut rng = rand::rng();
        let values = (0..config.memory_size)
            .map(|_| rng.random_range(0..config.label_count))
            .collect();

        Ok(Self {
            encoder,
            keys_md,
            values,
            ages: vec![0; config.memory_size],
            config,
            solver: InverseMapSolver::default(),
        })
    }

    /// Replace the solver used to move keys in input space
    pub fn with_solver(mut self, solver: InverseMapSolver) -> Self {
        self.solver = solver;
        self
    }

    pub fn keys(&self) -> &Tensor {
        &self.keys_md
    }

    pub fn values(&self) -> &[u32] {
        &self.values
    }

    pub fn ages(&self) -> &[u32] {
        &self.ages
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    fn check_keys(&self, keys_nd: &Tensor) -> Result<usize> {
        let (nn, dd) = keys_nd.dims2()?;
        let key_dim = self.keys_md.dim(1)?;
        if dd != key_dim {
            bail!("keys have {} columns, memory stores {}", dd, key_dim);
        }
        Ok(nn)
    }

    /// Cosine similarities between encoded queries and slots (n x m)
    fn similarity(&self, keys_nd: &Tensor) -> Result<Tensor> {
        let q_ne = self.encoder.encode_keys(keys_nd)?;
        let m_me = self.encoder.encode_keys(&self.keys_md)?;
        q_ne.matmul(&m_me.t()?)
    }

    /// Nearest labels, similarities and soft anomaly scores
    pub fn query(&self, keys_nd: &Tensor) -> Result<KnnQueryOutput> {
        self.check_keys(keys_nd)?;
        let sim_nm = to_host(&self.similarity(keys_nd)?)?;
        let kk = self.config.k;

        let mut out = KnnQueryOutput {
            labels: Vec::with_capacity(sim_nm.len()),
            anomaly_scores: Vec::with_capacity(sim_nm.len()),
            similarities: Vec::with_capacity(sim_nm.len()),
        };

        for sim in sim_nm.iter() {
            let ranking = rank_descending(sim);
            let top = &ranking[..kk];
            out.labels.push(self.values[top[0]]);
            out.similarities.push(sim[top[0]]);

            let smax = sim[top[0]];
            let weights: Vec<f32> = top.iter().map(|&j| (sim[j] - smax).exp()).collect();
            let total: f32 = weights.iter().sum();
            let anomalous: f32 = top
                .iter()
                .zip(weights.iter())
                .filter(|(&j, _)| self.values[j] == ANOMALY_LABEL)
                .map(|(_, w)| w)
                .sum();
            out.anomaly_scores.push(anomalous / total);
        }
        Ok(out)
    }

    /// Anomaly probability from a vMF mixture over the k nearest slots
    ///
    /// p_S = mean over slots s in S of exp(κ cos(q, s)), then
    /// p_A / (p_A + p_N). Returns 0 without anomalous neighbours and 1
    /// without normal ones.
    pub fn probabilistic_query(&self, keys_nd: &Tensor, kappa: f64) -> Result<Vec<f32>> {
        self.check_keys(keys_nd)?;
        let sim_nm = to_host(&self.similarity(keys_nd)?)?;
        let kk = self.config.k;

        Ok(sim_nm
            .iter()
            .map(|sim| {
                let ranking = rank_descending(sim);
                let (anomalous, normal): (Vec<f64>, Vec<f64>) = ranking[..kk]
                    .iter()
                    .map(|&j| (self.values[j], kappa * sim[j] as f64))
                    .fold((vec![], vec![]), |(mut a, mut n), (label, s)| {
                        if label == ANOMALY_LABEL {
                            a.push(s);
                        } else {
                            n.push(s);
                        }
                        (a, n)
                    });

                match (anomalous.is_empty(), normal.is_empty()) {
                    (true, _) => 0.0,
                    (false, true) => 1.0,
                    (false, false) => {
                        let log_pa = log_mean_exp(&anomalous);
                        let log_pn = log_mean_exp(&normal);
                        (1.0 / (1.0 + (log_pn - log_pa).exp())) as f32
                    }
                }
            })
            .collect())
    }

    /// Margin loss of a labelled batch against the current memory, then
    /// write the batch into the memory
    ///
    /// loss = mean max(0, sim(q, wrong) - sim(q, right) + α), where
    /// `right` / `wrong` are the most similar slots with the same /
    /// a different label among the k nearest (or anywhere, if none of the
    /// k nearest qualifies). The loss is differentiable through the key
    /// encoder.
    ///
    /// An empty batch is an error and leaves the memory untouched.
    ///
    /// * `keys_nd` - raw keys (n x d)
    /// * `labels` - one label per key
    pub fn train_query(&mut self, keys_nd: &Tensor, labels: &[u32]) -> Result<Tensor> {
        let nn = self.check_keys(keys_nd)?;
        if nn == 0 {
            bail!("empty training batch");
        }
        if labels.len() != nn {
            bail!("{} labels for {} keys", labels.len(), nn);
        }

        let sim_nm = self.similarity(keys_nd)?;
        let sim_host = to_host(&sim_nm)?;
        let kk = self.config.k;

        let mut positive = Vec::with_capacity(nn);
        let mut negative = Vec::with_capacity(nn);
        let mut nearest = Vec::with_capacity(nn);

        for (i, sim) in sim_host.iter().enumerate() {
            let ranking = rank_descending(sim);
            let label = labels[i];

            let pos = first_with(&ranking, kk, |j| self.values[j] == label);
            let neg = first_with(&ranking, kk, |j| self.values[j] != label);
            match (pos, neg) {
                (Some(p), Some(q)) => {
                    positive.push(p as u32);
                    negative.push(q as u32);
                }
                (None, _) => bail!("no memory slot carries label {}", label),
                (_, None) => bail!("every memory slot carries label {}", label),
            }
            nearest.push(ranking[0]);
        }

        let device = sim_nm.device();
        let pos_n = sim_nm
            .gather(&Tensor::from_vec(positive, (nn, 1), device)?, 1)?
            .squeeze(1)?;
        let neg_n = sim_nm
            .gather(&Tensor::from_vec(negative, (nn, 1), device)?, 1)?
            .squeeze(1)?;
        let loss = margin_loss(&pos_n, &neg_n, self.config.alpha)?;

        self.update(&keys_nd.detach(), labels, &nearest)?;
        Ok(loss)
    }

    /// Age every slot, then move or overwrite one slot per example
    fn update(&mut self, keys_nd: &Tensor, labels: &[u32], nearest: &[usize]) -> Result<()> {
        for age in self.ages.iter_mut() {
            *age += 1;
        }

        for (i, (&label, &top)) in labels.iter().zip(nearest.iter()).enumerate() {
            let key_1d = keys_nd.narrow(0, i, 1)?;
            if self.values[top] == label && label != ANOMALY_LABEL {
                self.move_slot(top, &key_1d)?;
            } else {
                let slot = self.oldest_slot();
                self.write_slot(slot, &key_1d, label)?;
            }
        }
        Ok(())
    }

    /// Move slot `j` so that its embedding becomes
    /// normalize(embed(query) + embed(slot))
    fn move_slot(&mut self, j: usize, key_1d: &Tensor) -> Result<()> {
        let old_1d = self.keys_md.narrow(0, j, 1)?;
        let q_1e = self.encoder.encode_keys(key_1d)?.detach();
        let m_1e = self.encoder.encode_keys(&old_1d)?.detach();
        let target = l2_normalize_dim(&(q_1e + m_1e)?, 1)?;

        let encoder = &self.encoder;
        let out = self
            .solver
            .solve(|c| encoder.encode_keys(c), &old_1d, &target)?;
        if !out.converged {
            debug!(
                "slot {} moved with residual {:.4e} after {} steps",
                j, out.residual, out.iterations
            );
        }

        let moved = self.encoder.canonical_key(&out.solution)?;
        self.set_key(j, &moved)?;
        self.ages[j] = 0;
        Ok(())
    }

    fn write_slot(&mut self, j: usize, key_1d: &Tensor, label: u32) -> Result<()> {
        let key = self.encoder.canonical_key(key_1d)?;
        self.set_key(j, &key)?;
        self.values[j] = label;
        self.ages[j] = 0;
        Ok(())
    }

    fn set_key(&mut self, j: usize, key_1d: &Tensor) -> Result<()> {
        let dd = self.keys_md.dim(1)?;
        let key_1d = key_1d
            .detach()
            .reshape((1, dd))?
            .to_dtype(self.keys_md.dtype())?
            .to_device(self.keys_md.device())?;
        self.keys_md = self.keys_md.slice_assign(&[j..j + 1, 0..dd], &key_1d)?;
        Ok(())
    }

    /// arg max of age + U(0, 0.5)
    fn oldest_slot(&self) -> usize {
        let mut rng = rand::rng();
        let mut best = (0, f64::NEG_INFINITY);
        for (j, &age) in self.ages.iter().enumerate() {
            let score = age as f64 + rng.random_range(0.0..AGE_JITTER);
            if score > best.1 {
                best = (j, score);
            }
        }
        best.0
    }

    /// Overwrite the oldest slot with `key` and `label`
    ///
    /// Ages every slot by one first, as a training write does, so that
    /// consecutive inserts land in different slots. Returns the slot index.
    pub fn insert(&mut self, key: &Tensor, label: u32) -> Result<usize> {
        let dd = self.keys_md.dim(1)?;
        let key_1d = key.reshape((1, dd))?;
        for age in self.ages.iter_mut() {
            *age += 1;
        }
        let slot = self.oldest_slot();
        self.write_slot(slot, &key_1d, label)?;
        Ok(slot)
    }
}

fn to_host(sim_nm: &Tensor) -> Result<Vec<Vec<f32>>> {
    sim_nm
        .detach()
        .to_dtype(DType::F32)?
        .to_device(&Device::Cpu)?
        .to_vec2::<f32>()
}

/// slot indices from most to least similar
fn rank_descending(sim: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..sim.len()).collect();
    order.sort_by(|&a, &b| sim[b].total_cmp(&sim[a]));
    order
}

/// First qualifying slot among the `kk` nearest, else anywhere
fn first_with<F>(ranking: &[usize], kk: usize, pred: F) -> Option<usize>
where
    F: Fn(usize) -> bool,
{
    ranking[..kk]
        .iter()
        .chain(ranking[kk..].iter())
        .copied()
        .find(|&j| pred(j))
}

fn log_mean_exp(x: &[f64]) -> f64 {
    let xmax = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = x.iter().map(|v| (v - xmax).exp()).sum::<f64>() / x.len() as f64;
    xmax + mean.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_util::candle_model_traits::L2KeyEncoder;

    fn memory(m: usize, d: usize, k: usize) -> Result<KnnMemory<L2KeyEncoder>> {
        KnnMemory::new(
            L2KeyEncoder,
            d,
            MemoryConfig::new(m, k, 2, 0.1),
            &Device::Cpu,
        )
    }

    #[test]
    fn test_invalid_neighbourhood() {
        assert!(memory(10, 4, 11).is_err());
        assert!(memory(10, 4, 0).is_err());
    }

    #[test]
    fn test_initial_state() -> Result<()> {
        let mem = memory(50, 6, 5)?;
        assert_eq!(mem.keys().dims(), &[50, 6]);
        assert_eq!(mem.values().len(), 50);
        assert!(mem.values().iter().all(|&v| v < 2));
        assert!(mem.ages().iter().all(|&a| a == 0));

        let norms: Vec<f32> = mem.keys().sqr()?.sum(1)?.sqrt()?.to_vec1()?;
        for r in norms {
            assert_abs_diff_eq!(r, 1.0, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_stored_key_is_its_own_neighbour() -> Result<()> {
        let mem = memory(30, 8, 5)?;
        let stored = mem.keys().narrow(0, 7, 1)?;
        let out = mem.query(&stored)?;
        assert_eq!(out.labels[0], mem.values()[7]);
        assert_abs_diff_eq!(out.similarities[0], 1.0, epsilon = 1e-5);
        assert!((0.0..=1.0).contains(&out.anomaly_scores[0]));
        Ok(())
    }

    #[test]
    fn test_empty_batch_leaves_memory_alone() -> Result<()> {
        let mut mem = memory(12, 4, 3)?;
        let keys = Tensor::zeros((0, 4), DType::F32, &Device::Cpu)?;
        assert!(mem.train_query(&keys, &[]).is_err());
        assert!(mem.ages().iter().all(|&a| a == 0));
        Ok(())
    }

    #[test]
    fn test_probabilistic_query_boundaries() -> Result<()> {
        let mut mem = memory(6, 3, 6)?;
        let key = Tensor::new(&[[1f32, 0., 0.]], &Device::Cpu)?;

        for _ in 0..6 {
            mem.insert(&key, 0)?;
        }
        assert_eq!(mem.probabilistic_query(&key, 10.0)?, vec![0.0]);

        for _ in 0..6 {
            mem.insert(&key, ANOMALY_LABEL)?;
        }
        assert_eq!(mem.probabilistic_query(&key, 10.0)?, vec![1.0]);
        Ok(())
    }

    #[test]
    fn test_probabilistic_query_prefers_closer_class() -> Result<()> {
        let mut mem = memory(4, 3, 4)?;
        let dev = Device::Cpu;
        mem.insert(&Tensor::new(&[[1f32, 0., 0.]], &dev)?, ANOMALY_LABEL)?;
        mem.insert(&Tensor::new(&[[0.9f32, 0.1, 0.]], &dev)?, ANOMALY_LABEL)?;
        mem.insert(&Tensor::new(&[[0f32, 1., 0.]], &dev)?, 0)?;
        mem.insert(&Tensor::new(&[[0f32, 0., 1.]], &dev)?, 0)?;

        let near_anomaly = Tensor::new(&[[1f32, 0.05, 0.]], &dev)?;
        let score = mem.probabilistic_query(&near_anomaly, 5.0)?[0];
        assert!(score > 0.9, "{}", score);
        Ok(())
    }

    #[test]
    fn test_writes_reset_ages() -> Result<()> {
        let mut mem = memory(5, 3, 2)?;
        let dev = Device::Cpu;
        for j in 0..5u32 {
            let key = Tensor::new(&[[1f32, j as f32, 0.5]], &dev)?;
            mem.insert(&key, j % 2)?;
        }
        let mut sorted = mem.ages().to_vec();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4]);

        let before = mem.ages().to_vec();
        let keys = Tensor::new(&[[1f32, 0., 0.], [0., 1., 0.]], &dev)?;
        mem.train_query(&keys, &[0, 1])?;

        let mut touched = 0;
        for (&a, &b) in mem.ages().iter().zip(before.iter()) {
            if a == 0 {
                touched += 1;
            } else {
                assert_eq!(a, b + 1);
            }
        }
        assert!((1..=2).contains(&touched));

        let slot = mem.insert(&Tensor::new(&[0f32, 0., 2.], &dev)?, 1)?;
        assert_eq!(mem.ages()[slot], 0);
        assert_eq!(mem.values()[slot], 1);

        let stored: Vec<f32> = mem.keys().narrow(0, slot, 1)?.flatten_all()?.to_vec1()?;
        assert_abs_diff_eq!(stored[2], 1.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_log_mean_exp() {
        assert_abs_diff_eq!(log_mean_exp(&[0.0, 0.0]), 0.0, epsilon = 1e-12);
        let v = log_mean_exp(&[1000.0, 1000.0 + 2f64.ln()]);
        assert_abs_diff_eq!(v, 1000.0 + 1.5f64.ln(), epsilon = 1e-9);
    }
}
