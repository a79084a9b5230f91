use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use hound::{SampleFormat, WavSpec, WavWriter};
use log::{debug, info};
use machine_learning::{
    Batch, RunPosition, model::Model, mulaw::decode_signal, source::BatchSource,
};
use ndarray::s;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use safetensors::{Dtype, tensor::TensorView};

use crate::{
    backend::ExecutionBackend,
    checkpoint::CheckpointStore,
    config::InferenceOpts,
    error::{Result, TrainErr},
};

/// What an inference pass wrote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceSummary {
    pub batches: usize,
    /// Input snapshots, one per batch when a template is configured.
    pub snapshots: Vec<PathBuf>,
    /// Every waveform written, originals and samples.
    pub outputs: Vec<PathBuf>,
}

/// Runs a trained model over a dataset, writing a reconstruction conditioned on the true
/// previous samples and `n_replicas` freely sampled variants of every input.
pub struct InferenceCoordinator<B, M> {
    opts: InferenceOpts,
    backend: B,
    model: M,
    source: Arc<dyn BatchSource>,
    rng: ChaCha8Rng,
}

impl<B, M> InferenceCoordinator<B, M>
where
    B: ExecutionBackend + Sync,
    M: Model,
{
    /// Loads the checkpoint parameters and buffers into `model` and prepares the output
    /// directory.
    ///
    /// # Errors
    /// * `Checkpoint` - The checkpoint is missing, unreadable or doesn't fit the model.
    /// * `Io` - The output directory can't be created.
    pub fn initialize(
        opts: InferenceOpts,
        backend: B,
        mut model: M,
        source: Arc<dyn BatchSource>,
        store: &dyn CheckpointStore,
    ) -> Result<Self> {
        let record = store
            .load(Some(&opts.ckpt_file))?
            .ok_or_else(|| TrainErr::checkpoint(&opts.ckpt_file, "no checkpoint found"))?;

        model
            .load_parameters(&record.params)
            .and_then(|_| model.load_buffers(&record.buffers))
            .map_err(|e| TrainErr::checkpoint(&opts.ckpt_file, e))?;
        model.set_n_replicas(opts.n_replicas);
        fs::create_dir_all(&opts.output_dir)?;

        let mut rng = ChaCha8Rng::seed_from_u64(opts.seed);
        rng.set_stream(backend.rank() as u64);

        info!(
            rank = backend.rank();
            "loaded {}, writing {} samples per input to {}",
            opts.ckpt_file.display(),
            opts.n_replicas,
            opts.output_dir.display()
        );

        Ok(Self {
            opts,
            backend,
            model,
            source,
            rng,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Runs inference over every batch of this replica's shard.
    ///
    /// Outputs are named `<stem>.orig.wav` for the reconstruction and `<stem>.rep<k>.wav` for
    /// the k-th sample, `<stem>` being the input file's stem.
    pub async fn run(&mut self) -> Result<InferenceSummary> {
        let sample_rate = self.source.sample_rate();
        let n_quant = self.model.n_quant();
        let mut loader = self
            .backend
            .iterate_batches(&*self.source, RunPosition::default());
        let mut summary = InferenceSummary::default();

        while let Some(batch) = loader.next_batch().await? {
            if let Some(tmpl) = &self.opts.data_write_tmpl {
                let path = PathBuf::from(tmpl.replace("{}", &summary.batches.to_string()));
                write_snapshot(&path, &batch)?;
                summary.snapshots.push(path);
            }

            let classes = self
                .model
                .infer(&batch, &mut self.rng)
                .map_err(TrainErr::Model)?;

            for (item, input) in batch.paths.iter().enumerate() {
                let stem = input
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| format!("item{item}"));

                for variant in 0..classes.dim().1 {
                    let tag = match variant {
                        0 => "orig".to_string(),
                        k => format!("rep{}", k - 1),
                    };

                    let path = self.opts.output_dir.join(format!("{stem}.{tag}.wav"));
                    let row = classes.slice(s![item, variant, ..]).to_vec();
                    write_wav(&path, &decode_signal(&row, n_quant), sample_rate)?;
                    summary.outputs.push(path);
                }
            }

            summary.batches += 1;
            debug!(rank = self.backend.rank(); "inference batch {} done", summary.batches);
        }

        self.backend.finish().await;
        info!(
            rank = self.backend.rank();
            "wrote {} waveforms over {} batches",
            summary.outputs.len(),
            summary.batches
        );

        Ok(summary)
    }
}

/// Dumps the input tensors of `batch` as a safetensors file.
fn write_snapshot(path: &Path, batch: &Batch) -> Result<()> {
    let mel: Vec<f32> = batch.mel.iter().copied().collect();
    let wav: Vec<f32> = batch.wav.iter().copied().collect();
    let voice: Vec<u32> = batch.voice.iter().copied().collect();
    let jitter: Vec<u32> = batch.jitter.iter().copied().collect();

    let entries: [(&str, Dtype, &[usize], &[u8]); 4] = [
        ("mel", Dtype::F32, batch.mel.shape(), bytemuck::cast_slice(&mel)),
        ("wav", Dtype::F32, batch.wav.shape(), bytemuck::cast_slice(&wav)),
        ("voice", Dtype::U32, batch.voice.shape(), bytemuck::cast_slice(&voice)),
        ("jitter", Dtype::U32, batch.jitter.shape(), bytemuck::cast_slice(&jitter)),
    ];

    let tensors = entries
        .into_iter()
        .map(|(name, dtype, shape, data)| {
            TensorView::new(dtype, shape.to_vec(), data)
                .map(|view| (name, view))
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
        })
        .collect::<io::Result<Vec<_>>>()?;

    let metadata = HashMap::from([(
        "position".to_string(),
        format!("{}:{}", batch.position.epoch, batch.position.batch),
    )]);

    let bytes = safetensors::serialize(tensors, &Some(metadata))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }

    fs::write(path, bytes)?;
    Ok(())
}

/// Writes a mono 16 bit PCM waveform.
fn write_wav(path: &Path, signal: &[f32], sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec).map_err(audio_err)?;
    for &x in signal {
        let sample = (x.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
        writer.write_sample(sample).map_err(audio_err)?;
    }

    writer.finalize().map_err(audio_err)
}

fn audio_err(e: hound::Error) -> TrainErr {
    match e {
        hound::Error::IoError(e) => TrainErr::Io(e),
        other => TrainErr::Io(io::Error::other(other)),
    }
}
