use log::{debug, info};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView3, Axis, parallel::prelude::*, s};
use rand::{Rng, RngCore, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};

use super::{Bottleneck, Codebook, Metrics, Model, Parameter, StepOutput};
use crate::{
    Batch, MlErr, Result, diagnostics::softmax, mulaw::mu_encode, source::FEATURES,
};

const EMBED: usize = 0;
const BIAS: usize = 1;
const COND: usize = 2;
const ENC: usize = 3;

const CODES: &str = "codebook.codes";

/// Shape options of a `LinearPredictor`.
#[derive(Debug, Clone, Copy)]
pub struct LinearPredictorConfig {
    pub n_quant: usize,
    pub channels: usize,
    pub bottleneck: Bottleneck,
    pub n_codes: usize,
    pub free_nats: f32,
    pub seed: u64,
}

impl Default for LinearPredictorConfig {
    fn default() -> Self {
        Self {
            n_quant: 256,
            channels: FEATURES,
            bottleneck: Bottleneck::None,
            n_codes: 64,
            free_nats: 0.0,
            seed: 0,
        }
    }
}

/// A next sample classifier over mu-law classes.
///
/// The logits for sample `t + 1` are the sum of a per class embedding of sample `t`, a bias and
/// a linear map of the conditioning frame covering `t`. With a bottleneck the conditioning frame
/// is first encoded by a square linear map and, for the vector quantized kinds, snapped to the
/// nearest code with a straight-through gradient.
#[derive(Debug, Clone)]
pub struct LinearPredictor {
    n_quant: usize,
    channels: usize,
    bottleneck: Bottleneck,
    free_nats: f32,
    anneal_weight: f32,
    n_replicas: usize,
    params: Vec<Parameter>,
    codebook: Option<Codebook>,
    cache: Option<Cache>,
    objective: Metrics,
    encoder: Metrics,
}

#[derive(Debug, Clone)]
struct Cache {
    inputs: Array2<usize>,
    mel: Array3<f32>,
    z: Array3<f32>,
    cond: Array3<f32>,
    probs: Array3<f32>,
    target: Array2<usize>,
    kl_active: bool,
}

impl LinearPredictor {
    /// Creates a new randomly initialized `LinearPredictor`.
    ///
    /// # Arguments
    /// * `config` - The shape options, `seed` drives the initialization.
    ///
    /// # Returns
    /// The model or an error if the shape options are degenerate.
    pub fn new(config: LinearPredictorConfig) -> Result<Self> {
        let LinearPredictorConfig {
            n_quant: q,
            channels: m,
            bottleneck,
            n_codes,
            free_nats,
            seed,
        } = config;

        if q < 2 {
            return Err(MlErr::SizeMismatch {
                what: "quantization classes",
                got: q,
                expected: 2,
            });
        }

        if m == 0 || (bottleneck.has_codebook() && n_codes == 0) {
            return Err(MlErr::Unsupported("empty conditioning or codebook"));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let normal =
            Normal::<f32>::new(0.0, 0.01).map_err(|_| MlErr::Unsupported("normal initializer"))?;
        let mut sample = |len: usize| -> Vec<f32> {
            (0..len).map(|_| normal.sample(&mut rng)).collect()
        };

        let mut params = vec![
            Parameter::new("embed.weight", vec![q, q], sample(q * q))?,
            Parameter::new("out.bias", vec![q], vec![0.0; q])?,
            Parameter::new("cond.weight", vec![q, m], sample(q * m))?,
        ];

        if bottleneck != Bottleneck::None {
            let mut enc = sample(m * m);
            (0..m).for_each(|i| enc[i * m + i] += 1.0);
            params.push(Parameter::new("enc.weight", vec![m, m], enc)?);
        }

        Ok(Self {
            n_quant: q,
            channels: m,
            bottleneck,
            free_nats,
            anneal_weight: 0.0,
            n_replicas: 0,
            params,
            codebook: bottleneck
                .has_codebook()
                .then(|| Codebook::new(n_codes, m)),
            cache: None,
            objective: Metrics::new(),
            encoder: Metrics::new(),
        })
    }

    pub fn codebook(&self) -> Option<&Codebook> {
        self.codebook.as_ref()
    }

    fn check_mel(&self, mel: ArrayView3<f32>) -> Result<()> {
        let (_, channels, frames) = mel.dim();
        if channels != self.channels {
            return Err(MlErr::SizeMismatch {
                what: "conditioning channels",
                got: channels,
                expected: self.channels,
            });
        }

        if frames == 0 {
            return Err(MlErr::SizeMismatch {
                what: "conditioning frames",
                got: 0,
                expected: 1,
            });
        }

        Ok(())
    }

    fn encode(&self, mel: ArrayView3<f32>) -> Array3<f32> {
        let Some(enc) = self.params.get(ENC) else {
            return mel.to_owned();
        };

        let m = self.channels;
        let w = enc.value();
        let (b, _, f) = mel.dim();

        Array3::from_shape_fn((b, m, f), |(bi, i, fi)| {
            (0..m).map(|j| w[i * m + j] * mel[[bi, j, fi]]).sum()
        })
    }

    fn condition(&mut self, z: &Array3<f32>, train: bool) -> Array3<f32> {
        let Some(codebook) = self.codebook.as_mut() else {
            return z.clone();
        };

        let mut cond = z.clone();
        for (bi, item) in z.axis_iter(Axis(0)).enumerate() {
            for (fi, frame) in item.axis_iter(Axis(1)).enumerate() {
                let code = if train {
                    codebook.quantize(frame)
                } else {
                    codebook.nearest(frame)
                };
                cond.slice_mut(s![bi, .., fi])
                    .assign(&codebook.codes().row(code));
            }
        }

        cond
    }

    fn logits_at(&self, cond: ArrayView1<f32>, prev: usize) -> Array1<f32> {
        let (q, m) = (self.n_quant, self.channels);
        let embed = self.params[EMBED].value();
        let bias = self.params[BIAS].value();
        let weight = self.params[COND].value();

        Array1::from_shape_fn(q, |qi| {
            let c: f32 = (0..m).map(|mi| weight[qi * m + mi] * cond[mi]).sum();
            embed[qi * q + prev] + bias[qi] + c
        })
    }

    fn gradients(&self) -> Result<Vec<Vec<f32>>> {
        let cache = self
            .cache
            .as_ref()
            .ok_or(MlErr::Unsupported("backward before run"))?;

        let (q, m) = (self.n_quant, self.channels);
        let (b, _, n) = cache.probs.dim();
        let frames = cache.cond.dim().2;
        let samples = n + 1;
        let scale = 1.0 / (b * n) as f32;
        let weight = self.params[COND].value();

        let mut d_embed = vec![0.0; q * q];
        let mut d_bias = vec![0.0; q];
        let mut d_cond = vec![0.0; q * m];
        let mut d_z = Array3::<f32>::zeros(cache.z.dim());

        for bi in 0..b {
            for ni in 0..n {
                let frame = ni * frames / samples;
                let prev = cache.inputs[[bi, ni]];
                let target = cache.target[[bi, ni]];

                for qi in 0..q {
                    let hit = if qi == target { 1.0 } else { 0.0 };
                    let d = (cache.probs[[bi, qi, ni]] - hit) * scale;

                    d_embed[qi * q + prev] += d;
                    d_bias[qi] += d;
                    for mi in 0..m {
                        d_cond[qi * m + mi] += d * cache.cond[[bi, mi, frame]];
                        d_z[[bi, mi, frame]] += weight[qi * m + mi] * d;
                    }
                }
            }
        }

        let mut grads = vec![d_embed, d_bias, d_cond];

        if self.params.get(ENC).is_some() {
            if cache.kl_active {
                let k = self.anneal_weight / cache.z.len() as f32;
                d_z.zip_mut_with(&cache.z, |d, z| *d += k * z);
            }

            let mut d_enc = vec![0.0; m * m];
            for ((bi, i, fi), dz) in d_z.indexed_iter() {
                for j in 0..m {
                    d_enc[i * m + j] += dz * cache.mel[[bi, j, fi]];
                }
            }
            grads.push(d_enc);
        }

        Ok(grads)
    }

    fn sample_class(probs: &[f32], rng: &mut dyn RngCore) -> usize {
        let mut u: f32 = rng.random();

        for (class, p) in probs.iter().enumerate() {
            if u < *p {
                return class;
            }
            u -= p;
        }

        probs.len().saturating_sub(1)
    }
}

fn argmax(values: ArrayView1<f32>) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
            if v > best.1 { (i, v) } else { best }
        })
        .0
}

impl Model for LinearPredictor {
    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    fn run(&mut self, batch: &Batch) -> Result<StepOutput> {
        let (b, t) = batch.wav.dim();
        if t < 2 {
            return Err(MlErr::SizeMismatch {
                what: "samples per item",
                got: t,
                expected: 2,
            });
        }
        self.check_mel(batch.mel.view())?;

        let q = self.n_quant;
        let n = t - 1;
        let frames = batch.mel.dim().2;

        let inputs = batch.wav.mapv(|x| mu_encode(x, q));
        let z = self.encode(batch.mel.view());
        let cond = self.condition(&z, true);

        let mut logits = Array3::zeros((b, q, n));
        logits
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(bi, mut item)| {
                for ni in 0..n {
                    let frame = ni * frames / t;
                    let lane = self.logits_at(cond.slice(s![bi, .., frame]), inputs[[bi, ni]]);
                    item.column_mut(ni).assign(&lane);
                }
            });

        let target = inputs.slice(s![.., 1..]).to_owned();
        let probs = softmax(logits.view());

        let ce = -target
            .indexed_iter()
            .map(|((bi, ni), &c)| probs[[bi, c, ni]].max(1e-12).ln())
            .sum::<f32>()
            / (b * n) as f32;

        self.objective = Metrics::from([("ce".to_string(), ce)]);
        let mut loss = ce;
        let mut kl_active = false;

        if self.bottleneck == Bottleneck::Vae {
            let kl = 0.5 * z.mapv(|v| v * v).mean().unwrap_or(0.0);
            kl_active = self.anneal_weight > 0.0 && kl > self.free_nats;
            if kl_active {
                loss += self.anneal_weight * (kl - self.free_nats);
            }
            self.objective.insert("kl".to_string(), kl);
        }

        self.encoder.clear();
        if self.bottleneck != Bottleneck::None {
            let rms = z.mapv(|v| v * v).mean().unwrap_or(0.0).sqrt();
            self.encoder.insert("z_rms".to_string(), rms);
        }
        if let Some(codebook) = &self.codebook {
            self.encoder
                .insert("code_usage".to_string(), codebook.usage_fraction());
        }

        self.cache = Some(Cache {
            inputs,
            mel: batch.mel.clone(),
            z,
            cond,
            probs,
            target: target.clone(),
            kl_active,
        });

        Ok(StepOutput {
            logits,
            target,
            loss,
        })
    }

    fn backward(&mut self) -> Result<()> {
        let grads = self.gradients()?;

        for (param, grad) in self.params.iter_mut().zip(grads) {
            param
                .grad_mut()
                .iter_mut()
                .zip(grad)
                .for_each(|(acc, g)| *acc += g);
        }

        Ok(())
    }

    fn bottleneck(&self) -> Bottleneck {
        self.bottleneck
    }

    fn n_quant(&self) -> usize {
        self.n_quant
    }

    fn objective_metrics(&self) -> Metrics {
        self.objective.clone()
    }

    fn encoder_metrics(&self) -> Metrics {
        self.encoder.clone()
    }

    fn set_anneal_weight(&mut self, weight: f32) {
        self.anneal_weight = weight;
    }

    fn anneal_weight(&self) -> f32 {
        self.anneal_weight
    }

    fn free_nats(&self) -> f32 {
        self.free_nats
    }

    fn init_codebook(&mut self, batches: &[Batch]) -> Result<()> {
        if self.codebook.is_none() {
            return Ok(());
        }

        for batch in batches {
            self.check_mel(batch.mel.view())?;
        }

        let encoded: Vec<_> = batches.iter().map(|b| self.encode(b.mel.view())).collect();

        if let Some(codebook) = self.codebook.as_mut() {
            let seeded = codebook.init(encoded.iter().map(|z| z.view()));
            debug!(
                "seeded {seeded} of {} code(s) from {} batch(es)",
                codebook.len(),
                batches.len()
            );
        }

        Ok(())
    }

    fn update_codebook(&mut self, rng: &mut dyn RngCore) {
        if let Some(codebook) = self.codebook.as_mut() {
            let replaced = codebook.refresh(rng);
            info!("replaced {replaced} unused code(s)");
        }
    }

    fn buffers(&self) -> Vec<Parameter> {
        let Some(codebook) = &self.codebook else {
            return Vec::new();
        };

        let codes = codebook.codes();
        let values = codes.iter().copied().collect();
        Parameter::new(CODES, vec![codes.nrows(), codes.ncols()], values)
            .map(|p| vec![p])
            .unwrap_or_default()
    }

    fn load_buffers(&mut self, buffers: &[Parameter]) -> Result<()> {
        let Some(codebook) = self.codebook.as_mut() else {
            return Ok(());
        };

        let stored = buffers
            .iter()
            .find(|b| b.name() == CODES)
            .ok_or_else(|| MlErr::UnknownParameter {
                name: CODES.to_string(),
            })?;

        codebook.restore(stored.value())
    }

    fn set_n_replicas(&mut self, n: usize) {
        self.n_replicas = n;
    }

    fn infer(&mut self, batch: &Batch, rng: &mut dyn RngCore) -> Result<Array3<usize>> {
        let (b, t) = batch.wav.dim();
        self.check_mel(batch.mel.view())?;

        let q = self.n_quant;
        let frames = batch.mel.dim().2;
        let inputs = batch.wav.mapv(|x| mu_encode(x, q));
        let z = self.encode(batch.mel.view());
        let cond = self.condition(&z, false);

        let mut out = Array3::zeros((b, self.n_replicas + 1, t));

        for bi in 0..b {
            out[[bi, 0, 0]] = inputs[[bi, 0]];
            for ti in 0..t.saturating_sub(1) {
                let frame = ti * frames / t;
                let logits = self.logits_at(cond.slice(s![bi, .., frame]), inputs[[bi, ti]]);
                out[[bi, 0, ti + 1]] = argmax(logits.view());
            }

            for r in 1..=self.n_replicas {
                let mut prev = inputs[[bi, 0]];
                out[[bi, r, 0]] = prev;

                for ti in 0..t.saturating_sub(1) {
                    let frame = ti * frames / t;
                    let mut probs = self.logits_at(cond.slice(s![bi, .., frame]), prev);
                    let max = probs.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
                    probs.mapv_inplace(|x| (x - max).exp());
                    probs /= probs.sum();

                    prev = Self::sample_class(probs.as_slice().unwrap_or_default(), rng);
                    out[[bi, r, ti + 1]] = prev;
                }
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use rand::rngs::StdRng;

    use super::*;
    use crate::{
        RunPosition,
        source::{BatchSource, HOP, InMemorySource, ShardSpec, SyntheticSpec},
    };

    fn batch() -> Batch {
        InMemorySource::synthetic(SyntheticSpec {
            batches: 1,
            batch_size: NonZeroUsize::new(2).unwrap(),
            window: HOP * 2,
            epochs: 1,
            sample_rate: 8_000,
            seed: 3,
        })
        .unwrap()
        .shard(ShardSpec::single(), RunPosition::default())
        .next()
        .unwrap()
        .unwrap()
    }

    fn model(bottleneck: Bottleneck) -> LinearPredictor {
        LinearPredictor::new(LinearPredictorConfig {
            n_quant: 8,
            bottleneck,
            n_codes: 4,
            seed: 11,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn analytic_gradient_matches_finite_differences() {
        let batch = batch();
        let mut m = model(Bottleneck::Vae);
        m.set_anneal_weight(0.5);

        m.zero_grad();
        m.run(&batch).unwrap();
        m.backward().unwrap();
        let analytic: Vec<Vec<f32>> = m.parameters().iter().map(|p| p.grad().to_vec()).collect();

        let eps = 1e-2;
        for (pi, idx) in [(EMBED, 3), (BIAS, 1), (COND, 5), (ENC, 2)] {
            let mut plus = m.clone();
            plus.parameters_mut()[pi].value_mut()[idx] += eps;
            let mut minus = m.clone();
            minus.parameters_mut()[pi].value_mut()[idx] -= eps;

            let numeric =
                (plus.run(&batch).unwrap().loss - minus.run(&batch).unwrap().loss) / (2.0 * eps);
            assert!(
                (numeric - analytic[pi][idx]).abs() < 2e-3,
                "param {pi}[{idx}]: numeric {numeric}, analytic {}",
                analytic[pi][idx]
            );
        }
    }

    #[test]
    fn gradient_steps_lower_the_loss() {
        let batch = batch();
        let mut m = model(Bottleneck::None);
        let first = m.run(&batch).unwrap().loss;

        for _ in 0..30 {
            m.zero_grad();
            m.run(&batch).unwrap();
            m.backward().unwrap();
            for p in m.parameters_mut() {
                let (value, grad) = p.value_and_grad();
                value.iter_mut().zip(grad).for_each(|(w, g)| *w -= 0.5 * g);
            }
        }

        assert!(m.run(&batch).unwrap().loss < first);
    }

    #[test]
    fn backward_needs_a_forward_pass() {
        assert!(model(Bottleneck::None).backward().is_err());
    }

    #[test]
    fn inference_emits_reconstruction_and_variants() {
        let batch = batch();
        let mut m = model(Bottleneck::None);
        m.set_n_replicas(2);

        let mut rng = StdRng::seed_from_u64(0);
        let out = m.infer(&batch, &mut rng).unwrap();

        assert_eq!(out.dim(), (2, 3, HOP * 2));
        assert_eq!(out[[0, 0, 0]], mu_encode(batch.wav[[0, 0]], 8));
        assert!(out.iter().all(|&c| c < 8));
    }

    #[test]
    fn codebook_is_seeded_and_refreshed() {
        let batch = batch();
        let mut m = model(Bottleneck::VqvaeEma);

        m.init_codebook(std::slice::from_ref(&batch)).unwrap();
        assert!(m.codebook().unwrap().codes().iter().any(|&c| c != 0.0));

        m.run(&batch).unwrap();
        assert!(m.encoder_metrics().contains_key("code_usage"));
        m.update_codebook(&mut StdRng::seed_from_u64(1));
        assert_eq!(m.codebook().unwrap().usage_fraction(), 0.0);
    }

    #[test]
    fn codebook_travels_through_buffers() {
        let batch = batch();
        let mut trained = model(Bottleneck::Vqvae);
        trained.init_codebook(std::slice::from_ref(&batch)).unwrap();

        let buffers = trained.buffers();
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].shape(), &[4, FEATURES]);

        let mut fresh = model(Bottleneck::Vqvae);
        assert!(fresh.codebook().unwrap().codes().iter().all(|&c| c == 0.0));
        assert!(fresh.load_buffers(&[]).is_err());

        fresh.load_buffers(&buffers).unwrap();
        assert_eq!(fresh.codebook().unwrap().codes(), trained.codebook().unwrap().codes());
    }

    #[test]
    fn models_without_codebook_have_no_buffers() {
        let mut m = model(Bottleneck::Vae);
        assert!(m.buffers().is_empty());
        assert!(m.load_buffers(&[]).is_ok());
    }
}
