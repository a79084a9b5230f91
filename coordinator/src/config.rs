use std::{
    fmt::{self, Display},
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use machine_learning::{
    Device,
    model::{Bottleneck, LinearPredictor, LinearPredictorConfig},
    optimization::{Adam, GradientDescent, Optimizer},
    source::{BatchSource, FEATURES, HOP, InMemorySource, SyntheticSpec, load_wav_dir},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    error::{Result, TrainErr},
    schedule::ScheduleTable,
};

/// The compute backend a run executes on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Hardware {
    /// Host memory only, batches are used in place.
    #[default]
    #[serde(rename = "CPU")]
    Cpu,
    /// A single accelerator.
    #[serde(rename = "GPU")]
    Gpu,
    /// A pool of accelerators, one replica each.
    #[serde(rename = "TPU")]
    Tpu,
    /// The replicated path with a single replica.
    #[serde(rename = "TPU-single")]
    TpuSingle,
}

impl Hardware {
    /// Whether the run goes through the replicated backend.
    pub fn is_replicated(self) -> bool {
        matches!(self, Hardware::Tpu | Hardware::TpuSingle)
    }

    /// The device a replica of the given rank places its batches on.
    pub fn device(self, rank: usize) -> Device {
        match self {
            Hardware::Cpu => Device::Host,
            Hardware::Gpu => Device::Accelerator(0),
            Hardware::Tpu | Hardware::TpuSingle => Device::Accelerator(rank),
        }
    }
}

impl Display for Hardware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Hardware::Cpu => "CPU",
            Hardware::Gpu => "GPU",
            Hardware::Tpu => "TPU",
            Hardware::TpuSingle => "TPU-single",
        })
    }
}

impl FromStr for Hardware {
    type Err = TrainErr;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CPU" => Ok(Hardware::Cpu),
            "GPU" => Ok(Hardware::Gpu),
            "TPU" => Ok(Hardware::Tpu),
            "TPU-single" => Ok(Hardware::TpuSingle),
            other => Err(TrainErr::Config(format!("unknown hardware '{other}'"))),
        }
    }
}

/// The optimization algorithm of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    GradientDescent,
    #[default]
    Adam,
}

impl OptimizerKind {
    /// Builds the optimizer with a starting learning rate.
    pub fn build(self, learning_rate: f32) -> Box<dyn Optimizer> {
        match self {
            OptimizerKind::GradientDescent => Box::new(GradientDescent::new(learning_rate)),
            OptimizerKind::Adam => Box::new(Adam::with_learning_rate(learning_rate)),
        }
    }
}

/// Shape options of the model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOpts {
    pub n_quant: usize,
    pub bottleneck: Bottleneck,
    pub n_codes: usize,
    pub free_nats: f32,
}

impl Default for ModelOpts {
    fn default() -> Self {
        Self {
            n_quant: 256,
            bottleneck: Bottleneck::None,
            n_codes: 64,
            free_nats: 0.0,
        }
    }
}

impl ModelOpts {
    /// Builds a freshly initialized model.
    ///
    /// # Errors
    /// A `Config` error if the shape options are degenerate.
    pub fn build(&self, seed: u64) -> Result<LinearPredictor> {
        LinearPredictor::new(LinearPredictorConfig {
            n_quant: self.n_quant,
            channels: FEATURES,
            bottleneck: self.bottleneck,
            n_codes: self.n_codes,
            free_nats: self.free_nats,
            seed,
        })
        .map_err(|e| TrainErr::Config(e.to_string()))
    }
}

/// Where the batches come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataOpts {
    /// A directory of `.wav` files, synthetic tones are used when unset.
    pub data_dir: Option<PathBuf>,
    pub batch_size: NonZeroUsize,
    pub window: usize,
    pub epochs: usize,
    pub synthetic_batches: usize,
    pub sample_rate: u32,
}

impl Default for DataOpts {
    fn default() -> Self {
        Self {
            data_dir: None,
            batch_size: NonZeroUsize::MIN.saturating_add(7),
            window: HOP * 16,
            epochs: 1,
            synthetic_batches: 64,
            sample_rate: 16_000,
        }
    }
}

impl DataOpts {
    /// Opens the batch source.
    ///
    /// # Errors
    /// A `Transfer` error if the data can't be read.
    pub fn open(&self, seed: u64) -> Result<Arc<dyn BatchSource>> {
        let source = match &self.data_dir {
            Some(dir) => load_wav_dir(dir, self.window, self.batch_size, self.epochs),
            None => InMemorySource::synthetic(SyntheticSpec {
                batches: self.synthetic_batches,
                batch_size: self.batch_size,
                window: self.window,
                epochs: self.epochs,
                sample_rate: self.sample_rate,
                seed,
            }),
        }
        .map_err(TrainErr::Transfer)?;

        Ok(Arc::new(source))
    }
}

/// The hyperparameters of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hparams {
    pub hw: Hardware,
    pub num_replicas: NonZeroUsize,
    pub save_interval: NonZeroUsize,
    pub progress_interval: NonZeroUsize,
    pub skip_loop_body: bool,
    pub learning_rate_steps: Vec<u64>,
    pub learning_rate_rates: Vec<f32>,
    pub bn_anneal_weight_steps: Vec<u64>,
    pub bn_anneal_weight_vals: Vec<f32>,
    /// Checkpoint path template, `{}` is replaced by the global step.
    pub ckpt_template: String,
    /// The checkpoint to resume from.
    pub ckpt_file: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub codebook_warmup_batches: usize,
    pub codebook_refresh_step: u64,
    pub seed: u64,
    pub optimizer: OptimizerKind,
    pub model: ModelOpts,
    pub data: DataOpts,
}

impl Default for Hparams {
    fn default() -> Self {
        Self {
            hw: Hardware::Cpu,
            num_replicas: NonZeroUsize::MIN,
            save_interval: NonZeroUsize::MIN.saturating_add(999),
            progress_interval: NonZeroUsize::MIN.saturating_add(9),
            skip_loop_body: false,
            learning_rate_steps: vec![0],
            learning_rate_rates: vec![1e-3],
            bn_anneal_weight_steps: vec![0],
            bn_anneal_weight_vals: vec![1.0],
            ckpt_template: "ckpt.{}.safetensors".to_string(),
            ckpt_file: None,
            log_dir: None,
            codebook_warmup_batches: 10,
            codebook_refresh_step: 10_000,
            seed: 0,
            optimizer: OptimizerKind::Adam,
            model: ModelOpts::default(),
            data: DataOpts::default(),
        }
    }
}

impl Hparams {
    /// Loads and validates the hyperparameters in a JSON file, unset fields take their default.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let hparams: Self = read_json(path)?;
        hparams.validate()?;
        Ok(hparams)
    }

    /// Checks every precondition a run relies on.
    ///
    /// # Errors
    /// A `Config` error naming the first violated one.
    pub fn validate(&self) -> Result<()> {
        self.learning_rate_schedule()?;
        self.anneal_schedule()?;

        if !self.ckpt_template.contains("{}") {
            return Err(TrainErr::Config(format!(
                "checkpoint template '{}' has no '{{}}' placeholder",
                self.ckpt_template
            )));
        }

        if self.hw == Hardware::TpuSingle && self.num_replicas.get() != 1 {
            return Err(TrainErr::Config(format!(
                "{} runs a single replica, got num_replicas = {}",
                self.hw, self.num_replicas
            )));
        }

        if self.model.bottleneck.has_codebook() && self.codebook_warmup_batches == 0 {
            return Err(TrainErr::Config(
                "a codebook needs at least one warm-up batch".to_string(),
            ));
        }

        Ok(())
    }

    /// How many replicas the run spawns.
    pub fn replicas(&self) -> NonZeroUsize {
        match self.hw {
            Hardware::Tpu => self.num_replicas,
            _ => NonZeroUsize::MIN,
        }
    }

    pub fn learning_rate_schedule(&self) -> Result<ScheduleTable<f32>> {
        Ok(ScheduleTable::seeded(
            &self.learning_rate_steps,
            &self.learning_rate_rates,
        )?)
    }

    /// The anneal weight schedule, only variational bottlenecks have one.
    pub fn anneal_schedule(&self) -> Result<Option<ScheduleTable<f32>>> {
        if self.model.bottleneck != Bottleneck::Vae {
            return Ok(None);
        }

        Ok(Some(ScheduleTable::seeded(
            &self.bn_anneal_weight_steps,
            &self.bn_anneal_weight_vals,
        )?))
    }

    /// Combines the hyperparameters stored in a checkpoint with the live ones.
    ///
    /// Model, data and schedule fields come from `stored`, run control fields from `self`.
    pub fn merge_checkpoint(&self, stored: &Hparams) -> Hparams {
        Hparams {
            hw: self.hw,
            num_replicas: self.num_replicas,
            save_interval: self.save_interval,
            progress_interval: self.progress_interval,
            skip_loop_body: self.skip_loop_body,
            ckpt_template: self.ckpt_template.clone(),
            ckpt_file: self.ckpt_file.clone(),
            log_dir: self.log_dir.clone(),
            ..stored.clone()
        }
    }
}

/// The options of an inference run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceOpts {
    pub ckpt_file: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub n_replicas: usize,
    /// Where to write each batch's input tensors, `{}` is replaced by the batch number.
    #[serde(default)]
    pub data_write_tmpl: Option<String>,
    #[serde(default)]
    pub hwtype: Hardware,
    #[serde(default)]
    pub data: DataOpts,
    #[serde(default)]
    pub seed: u64,
}

impl InferenceOpts {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        read_json(path)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .map_err(|e| TrainErr::Config(format!("cannot read '{}': {e}", path.display())))?;

    serde_json::from_str(&content)
        .map_err(|e| TrainErr::Config(format!("invalid JSON in '{}': {e}", path.display())))
}
