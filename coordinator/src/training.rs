use std::{path::PathBuf, sync::Arc};

use log::{debug, info, warn};
use machine_learning::{
    Batch, MlErr, RunPosition,
    diagnostics::avg_prob_target,
    model::{Bottleneck, Model, StepOutput},
    optimization::Optimizer,
    source::{BatchSource, ShardSpec},
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::{
    backend::ExecutionBackend,
    checkpoint::{CheckpointPath, CheckpointRecord, CheckpointStore, RngState},
    config::Hparams,
    error::{Result, TrainErr},
    probe::ProgressProbe,
    reduce::Combine,
    report::{MetricSnapshot, Reporter},
    schedule::ScheduleTable,
};

/// Where a coordinator is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Running,
    Checkpointing,
    Reporting,
    Terminated,
}

/// What one replica did over a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainSummary {
    pub rank: usize,
    /// Batches pulled from the loader, skipped ones included.
    pub batches: usize,
    pub optim_step: u64,
    pub last_position: Option<RunPosition>,
    pub last_global_step: Option<u64>,
    /// Checkpoint paths in save order. Only the master actually writes them.
    pub saved: Vec<PathBuf>,
    pub reports: usize,
    pub last_loss: Option<f32>,
}

/// The collaborators a `TrainingCoordinator` drives.
pub struct TrainingParts<B, M> {
    pub backend: B,
    pub model: M,
    pub source: Arc<dyn BatchSource>,
    pub store: Arc<dyn CheckpointStore>,
    pub reporter: Arc<Reporter>,
}

/// Drives one replica of a training run: checkpoint cadence, schedule application, optimizer
/// steps and progress reporting, over the batches its backend hands out.
pub struct TrainingCoordinator<B, M> {
    hparams: Hparams,
    backend: B,
    model: M,
    optimizer: Box<dyn Optimizer>,
    source: Arc<dyn BatchSource>,
    store: Arc<dyn CheckpointStore>,
    reporter: Arc<Reporter>,
    ckpt_path: CheckpointPath,
    lr_schedule: ScheduleTable<f32>,
    anneal_schedule: Option<ScheduleTable<f32>>,
    rng: ChaCha8Rng,
    start: RunPosition,
    optim_step: u64,
    phase: Phase,
}

impl<B, M> TrainingCoordinator<B, M>
where
    B: ExecutionBackend + Sync,
    M: Model,
{
    /// Prepares a replica for training, resuming from `hparams.ckpt_file` when it is set.
    ///
    /// On resume the stored hyperparameters are merged under the live run control fields, and
    /// the parameters, model buffers, optimizer state, random stream and position are restored.
    /// The learning rate (and the anneal weight of variational bottlenecks) are then resolved at
    /// the starting global step, so a resumed run sees the same values an uninterrupted one
    /// would. Codebook bottlenecks of a fresh run are seeded from the first warm-up batches, a
    /// resumed run keeps the stored codebook.
    ///
    /// # Arguments
    /// * `hparams` - The live hyperparameters.
    /// * `parts` - The backend, model, data, store and reporter of this replica.
    ///
    /// # Returns
    /// A coordinator ready to `run`.
    ///
    /// # Errors
    /// * `Config` - Invalid hyperparameters, a schedule that doesn't cover the start or a
    ///   checkpoint written with a different number of replicas.
    /// * `Checkpoint` - The checkpoint can't be read or doesn't fit the model.
    /// * `Transfer` - The warm-up batches can't be produced.
    pub fn initialize(hparams: Hparams, parts: TrainingParts<B, M>) -> Result<Self> {
        let TrainingParts {
            backend,
            mut model,
            source,
            store,
            reporter,
        } = parts;

        hparams.validate()?;
        let rank = backend.rank();

        let record = store.load(hparams.ckpt_file.as_deref())?;
        let hparams = match &record {
            Some(record) => {
                let (stored, live) = (record.hparams.replicas(), hparams.replicas());
                if stored != live {
                    return Err(TrainErr::Config(format!(
                        "the checkpoint was written by {stored} replica(s) but this run has \
                         {live}, changing the replica count needs a fresh run"
                    )));
                }

                let merged = hparams.merge_checkpoint(&record.hparams);
                merged.validate()?;
                merged
            }
            None => hparams,
        };

        let lr_schedule = hparams.learning_rate_schedule()?;
        let anneal_schedule = hparams.anneal_schedule()?;
        let mut optimizer = hparams.optimizer.build(0.0);

        let resumed = record.is_some();
        let (start, optim_step, mut rng) = match record {
            Some(record) => {
                let ckpt_file = hparams.ckpt_file.clone().unwrap_or_default();
                let mismatch = |e: MlErr| TrainErr::checkpoint(&ckpt_file, e);
                model.load_parameters(&record.params).map_err(mismatch)?;
                model.load_buffers(&record.buffers).map_err(mismatch)?;
                optimizer.load_state(&record.optimizer).map_err(mismatch)?;

                info!(
                    rank = rank;
                    "resuming at epoch {} batch {}, optimizer step {}",
                    record.position.epoch, record.position.batch, record.optim_step
                );
                (record.position, record.optim_step, record.rng.restore())
            }
            None => (RunPosition::default(), 0, ChaCha8Rng::seed_from_u64(hparams.seed)),
        };

        if rank != 0 {
            rng.set_stream(rank as u64);
        }

        let gstep = start.global_step(source.batches_per_epoch());
        optimizer.set_learning_rate(lr_schedule.resolve(gstep)?);
        if let Some(table) = &anneal_schedule {
            model.set_anneal_weight(table.resolve(gstep)?);
        }

        if backend.is_master() {
            match serde_json::to_string_pretty(&hparams) {
                Ok(json) => info!("hyperparameters:\n{json}"),
                Err(e) => warn!("could not print the hyperparameters: {e}"),
            }
        }

        if model.bottleneck().has_codebook() && !resumed {
            // every replica seeds from the same unsharded batches so the codebooks agree
            let warmup = source
                .shard(ShardSpec::single(), RunPosition::default())
                .take(hparams.codebook_warmup_batches)
                .collect::<machine_learning::Result<Vec<Batch>>>()
                .map_err(TrainErr::Transfer)?;

            model.init_codebook(&warmup).map_err(TrainErr::Model)?;
            info!(rank = rank; "codebook seeded from {} batches", warmup.len());
        }

        let ckpt_path = CheckpointPath::new(hparams.ckpt_template.clone(), backend.is_master())?;

        Ok(Self {
            hparams,
            backend,
            model,
            optimizer,
            source,
            store,
            reporter,
            ckpt_path,
            lr_schedule,
            anneal_schedule,
            rng,
            start,
            optim_step,
            phase: Phase::Initializing,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn hparams(&self) -> &Hparams {
        &self.hparams
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn learning_rate(&self) -> f32 {
        self.optimizer.learning_rate()
    }

    /// The position the next `run` starts at.
    pub fn start(&self) -> RunPosition {
        self.start
    }

    pub fn optim_step(&self) -> u64 {
        self.optim_step
    }

    /// Trains over every remaining batch of this replica's shard.
    ///
    /// A checkpoint is saved before the batch whenever the count of batches seen in this pass
    /// is a nonzero multiple of `save_interval`. Progress is reported every `progress_interval`
    /// batches; on a replicated backend the report is a collective every replica takes part in.
    ///
    /// # Returns
    /// A summary of the pass.
    ///
    /// # Errors
    /// The first fatal error, after which the coordinator is terminated.
    pub async fn run(&mut self) -> Result<TrainSummary> {
        let rank = self.backend.rank();
        let result = self.train_loop(rank).await;

        self.phase = Phase::Terminated;
        self.backend.finish().await;

        match &result {
            Ok(summary) => info!(
                rank = rank;
                "training done after {} batches, optimizer step {}",
                summary.batches, summary.optim_step
            ),
            Err(e) => warn!(rank = rank; "training stopped: {e}"),
        }

        result
    }

    async fn train_loop(&mut self, rank: usize) -> Result<TrainSummary> {
        self.phase = Phase::Running;

        let batches_per_epoch = self.source.batches_per_epoch();
        let save_interval = self.hparams.save_interval.get();
        let progress_interval = self.hparams.progress_interval.get();

        let mut summary = TrainSummary {
            rank,
            optim_step: self.optim_step,
            ..Default::default()
        };

        info!(
            rank = rank, replicas = self.backend.num_replicas();
            "starting at epoch {} batch {}",
            self.start.epoch, self.start.batch
        );

        let mut loader = self.backend.iterate_batches(&*self.source, self.start);
        let mut batch_num = 0;

        while let Some(batch) = loader.next_batch().await? {
            let position = batch.position;
            let gstep = position.global_step(batches_per_epoch);
            let index = batch_num;
            batch_num += 1;

            if index % save_interval == 0 && index != 0 {
                self.phase = Phase::Checkpointing;
                summary.saved.push(self.save_checkpoint(position, gstep)?);
                self.phase = Phase::Running;
            }

            summary.batches += 1;
            summary.last_position = Some(position);
            summary.last_global_step = Some(gstep);

            if self.hparams.skip_loop_body {
                continue;
            }

            let reporting = index % progress_interval == 0;
            summary.last_loss = Some(self.train_step(&batch, gstep, reporting).await?);
            if reporting {
                summary.reports += 1;
            }
        }

        summary.optim_step = self.optim_step;
        Ok(summary)
    }

    async fn train_step(&mut self, batch: &Batch, gstep: u64, reporting: bool) -> Result<f32> {
        let rank = self.backend.rank();

        // breakpoints are matched against every step of the lock-step round so all replicas
        // apply them together, a direct backend's round is just `gstep`
        let n = self.backend.num_replicas() as u64;
        let first = gstep - batch.position.batch as u64 % n;
        let round = first..first + n;

        if let Some(lr) = self.lr_schedule.within(round.clone()) {
            self.optimizer.set_learning_rate(lr);
            info!(rank = rank, step = gstep; "learning rate now {lr}");
        }

        if let Some(weight) = self
            .anneal_schedule
            .as_ref()
            .and_then(|t| t.within(round.clone()))
        {
            self.model.set_anneal_weight(weight);
            info!(rank = rank, step = gstep; "anneal weight now {weight}");
        }

        self.model.zero_grad();
        let out = self.model.run(batch).map_err(TrainErr::Model)?;
        self.model.backward().map_err(TrainErr::Model)?;

        let probe = reporting.then(|| ProgressProbe::capture(self.model.parameters()));

        self.backend
            .step_optimizer(self.optimizer.as_mut(), self.model.parameters_mut())
            .await?;
        self.optim_step += 1;

        if self.model.bottleneck() == Bottleneck::VqvaeEma
            && round.contains(&self.hparams.codebook_refresh_step)
        {
            self.model.update_codebook(&mut self.rng);
            if n > 1 {
                self.share_buffers().await?;
            }
            info!(rank = rank, step = gstep; "codebook refreshed");
        }

        if let Some(probe) = probe {
            self.phase = Phase::Reporting;
            self.report(probe, &out, batch.position, gstep).await?;
            self.phase = Phase::Running;
        }

        Ok(out.loss)
    }

    /// Replaces every replica's model buffers with the master's.
    async fn share_buffers(&mut self) -> Result<()> {
        let mut buffers = self.model.buffers();
        let local: Vec<f32> = buffers.iter().flat_map(|b| b.value().iter().copied()).collect();

        let shared = self.backend.reduce(Combine::Root, &local).await;
        if shared.len() != local.len() {
            return Err(TrainErr::Model(MlErr::SizeMismatch {
                what: "shared buffers",
                got: shared.len(),
                expected: local.len(),
            }));
        }

        let mut rest = shared.as_slice();
        for buffer in &mut buffers {
            let (head, tail) = rest.split_at(buffer.len());
            buffer.value_mut().copy_from_slice(head);
            rest = tail;
        }

        self.model.load_buffers(&buffers).map_err(TrainErr::Model)
    }

    async fn report(
        &mut self,
        probe: ProgressProbe,
        out: &StepOutput,
        position: RunPosition,
        gstep: u64,
    ) -> Result<()> {
        let ratio = probe.finish(self.model.parameters());
        let tprb = avg_prob_target(out.logits.view(), out.target.view()).map_err(TrainErr::Model)?;

        let reduced = self
            .backend
            .reduce(Combine::Mean, &[out.loss, tprb])
            .await;

        let mut snapshot = MetricSnapshot::new();
        snapshot.insert("optim_step", self.optim_step as f64);
        snapshot.insert("gstep", gstep as f64);
        snapshot.insert("epoch", position.epoch as f64);
        snapshot.insert("step", position.batch as f64);
        snapshot.insert("loss", out.loss);
        snapshot.insert("lrate", self.optimizer.learning_rate());
        snapshot.insert("loss_r", reduced[0]);
        snapshot.insert("tprb_r", reduced[1]);
        snapshot.insert("uwr_min", ratio.min);
        snapshot.insert("uwr_max", ratio.max);
        snapshot.merge(&self.model.objective_metrics());

        match self.model.bottleneck() {
            Bottleneck::None => {}
            Bottleneck::Vae => {
                snapshot.insert("free_nats", self.model.free_nats());
                snapshot.insert("anneal_weight", self.model.anneal_weight());
                snapshot.merge(&self.model.encoder_metrics());
            }
            _ => snapshot.merge(&self.model.encoder_metrics()),
        }

        debug!(rank = self.backend.rank(), step = gstep; "scheduling report");
        let reporter = Arc::clone(&self.reporter);
        let rank = self.backend.rank();
        self.backend
            .schedule_deferred_report(Box::new(move || reporter.report(&snapshot, rank)));

        Ok(())
    }

    /// Writes the state of the run as of the start of `position`.
    ///
    /// Replicas other than the master only compute the path.
    fn save_checkpoint(&self, position: RunPosition, gstep: u64) -> Result<PathBuf> {
        let path = self.ckpt_path.for_step(gstep);
        if !self.ckpt_path.is_writer() {
            return Ok(path);
        }

        let record = CheckpointRecord {
            params: self.model.parameters().to_vec(),
            buffers: self.model.buffers(),
            optimizer: self.optimizer.state(),
            rng: RngState::capture(&self.rng),
            position,
            optim_step: self.optim_step,
            hparams: self.hparams.clone(),
        };

        let written = self.store.save(&path, &record)?;
        info!(step = gstep; "saved checkpoint {}", written.display());
        Ok(written)
    }
}
