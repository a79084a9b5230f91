use std::{
    collections::BTreeMap,
    num::NonZeroUsize,
    path::Path,
    sync::Arc,
};

use coordinator::{
    CheckpointStore, DirectBackend, FileCheckpointStore, Hardware, Hparams, ReplicatedBackend,
    TrainErr, TrainingCoordinator, TrainingParts, launch,
    config::{DataOpts, ModelOpts, OptimizerKind},
    reduce,
    report::{MetricsSink, ReportErr, Reporter},
};
use machine_learning::{
    Batch, Device, RunPosition,
    model::{Bottleneck, LinearPredictor, Model, Parameter, StepOutput},
    source::HOP,
};
use rand::RngCore;
use ndarray::{Array2, Array3};
use parking_lot::Mutex;

fn hparams(dir: &Path, batches: usize) -> Hparams {
    Hparams {
        save_interval: NonZeroUsize::new(50).unwrap(),
        progress_interval: NonZeroUsize::new(25).unwrap(),
        ckpt_template: dir.join("ckpt.{}.safetensors").display().to_string(),
        optimizer: OptimizerKind::Adam,
        seed: 7,
        model: ModelOpts {
            n_quant: 16,
            ..Default::default()
        },
        data: DataOpts {
            batch_size: NonZeroUsize::MIN,
            window: HOP * 2,
            synthetic_batches: batches,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn parts<M: Model>(hparams: &Hparams, model: M) -> TrainingParts<DirectBackend, M> {
    TrainingParts {
        backend: DirectBackend::new(Device::Host),
        model,
        source: hparams.data.open(hparams.seed).unwrap(),
        store: Arc::new(FileCheckpointStore::new()),
        reporter: Arc::new(Reporter::new(None)),
    }
}

fn direct(hparams: Hparams) -> TrainingCoordinator<DirectBackend, LinearPredictor> {
    let parts = parts(&hparams, hparams.model.build(hparams.seed).unwrap());
    TrainingCoordinator::initialize(hparams, parts).unwrap()
}

#[tokio::test]
async fn saves_every_interval_but_never_at_the_first_batch() {
    let dir = tempfile::tempdir().unwrap();
    let summary = direct(hparams(dir.path(), 120)).run().await.unwrap();

    assert_eq!(summary.batches, 120);
    assert_eq!(summary.optim_step, 120);
    assert_eq!(
        summary.saved,
        vec![
            dir.path().join("ckpt.50.safetensors"),
            dir.path().join("ckpt.100.safetensors"),
        ]
    );
    assert!(!dir.path().join("ckpt.0.safetensors").exists());

    let store = FileCheckpointStore::new();
    for (path, batch) in summary.saved.iter().zip([50, 100]) {
        let record = store.load(Some(path)).unwrap().unwrap();
        assert_eq!(record.position, RunPosition::new(0, batch));
        assert_eq!(record.optim_step, batch as u64);
    }
}

#[tokio::test]
async fn skipping_the_loop_body_still_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let hparams = Hparams {
        skip_loop_body: true,
        ..hparams(dir.path(), 120)
    };

    let summary = direct(hparams).run().await.unwrap();

    assert_eq!(summary.batches, 120);
    assert_eq!(summary.optim_step, 0);
    assert_eq!(summary.reports, 0);
    assert_eq!(summary.last_global_step, Some(119));
    assert_eq!(summary.saved.len(), 2);

    let record = FileCheckpointStore::new()
        .load(Some(&summary.saved[1]))
        .unwrap()
        .unwrap();
    assert_eq!(record.optim_step, 0);
}

#[tokio::test]
async fn resumed_run_matches_uninterrupted_run() {
    let dir = tempfile::tempdir().unwrap();
    let base = Hparams {
        save_interval: NonZeroUsize::new(10).unwrap(),
        progress_interval: NonZeroUsize::new(4).unwrap(),
        learning_rate_steps: vec![0, 15, 25],
        learning_rate_rates: vec![0.01, 0.005, 0.001],
        ..hparams(dir.path(), 30)
    };

    let mut full = direct(base.clone());
    let full_summary = full.run().await.unwrap();
    assert_eq!(full.learning_rate(), 0.001);

    let mut resumed = direct(Hparams {
        ckpt_file: Some(dir.path().join("ckpt.20.safetensors")),
        ..base
    });
    assert_eq!(resumed.start(), RunPosition::new(0, 20));
    assert_eq!(resumed.optim_step(), 20);
    // the breakpoint at 15 was passed before the save
    assert_eq!(resumed.learning_rate(), 0.005);

    let resumed_summary = resumed.run().await.unwrap();
    assert_eq!(resumed_summary.batches, 10);
    assert_eq!(resumed_summary.last_global_step, full_summary.last_global_step);
    assert_eq!(resumed_summary.optim_step, full_summary.optim_step);
    assert_eq!(resumed.learning_rate(), 0.001);

    for (a, b) in full
        .model()
        .parameters()
        .iter()
        .zip(resumed.model().parameters())
    {
        assert_eq!(a.name(), b.name());
        assert_eq!(a.value(), b.value(), "'{}' diverged after resume", a.name());
    }
}

#[tokio::test]
async fn resuming_never_revisits_a_global_step() {
    let dir = tempfile::tempdir().unwrap();
    let base = Hparams {
        save_interval: NonZeroUsize::new(4).unwrap(),
        skip_loop_body: true,
        data: DataOpts {
            epochs: 3,
            batch_size: NonZeroUsize::MIN,
            window: HOP * 2,
            synthetic_batches: 5,
            ..Default::default()
        },
        ..hparams(dir.path(), 5)
    };

    let first = direct(base.clone()).run().await.unwrap();
    // 15 batches over 3 epochs, saves before batch numbers 4, 8 and 12
    assert_eq!(first.saved.len(), 3);
    let last_saved = first.saved.last().unwrap().clone();
    assert_eq!(last_saved, dir.path().join("ckpt.12.safetensors"));

    let mut resumed = direct(Hparams {
        ckpt_file: Some(last_saved),
        ..base
    });
    assert_eq!(resumed.start(), RunPosition::new(2, 2));

    let summary = resumed.run().await.unwrap();
    assert_eq!(summary.batches, 3);
    assert_eq!(summary.last_global_step, Some(14));
}

/// A model with a fixed loss, for checking what the reductions see.
struct FixedLoss {
    loss: f32,
    params: Vec<Parameter>,
}

impl FixedLoss {
    fn new(loss: f32) -> Self {
        Self {
            loss,
            params: vec![Parameter::new("w", vec![2], vec![1.0, -1.0]).unwrap()],
        }
    }
}

impl Model for FixedLoss {
    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    fn run(&mut self, _batch: &Batch) -> machine_learning::Result<StepOutput> {
        Ok(StepOutput {
            logits: Array3::zeros((1, 2, 1)),
            target: Array2::zeros((1, 1)),
            loss: self.loss,
        })
    }

    fn backward(&mut self) -> machine_learning::Result<()> {
        Ok(())
    }
}

type Recorded = Arc<Mutex<Vec<(String, BTreeMap<String, f64>, u64)>>>;

struct RecordingSink(Recorded);

impl MetricsSink for RecordingSink {
    fn add_scalars(
        &mut self,
        group: &str,
        scalars: &BTreeMap<String, f64>,
        step: u64,
    ) -> Result<(), ReportErr> {
        self.0.lock().push((group.to_string(), scalars.clone(), step));
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replicas_report_the_mean_loss() {
    let dir = tempfile::tempdir().unwrap();
    let hparams = Hparams {
        hw: Hardware::Tpu,
        num_replicas: NonZeroUsize::new(2).unwrap(),
        progress_interval: NonZeroUsize::MIN,
        optimizer: OptimizerKind::GradientDescent,
        ..hparams(dir.path(), 4)
    };
    let source = hparams.data.open(hparams.seed).unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new());
    let recorded = Recorded::default();

    let tasks: Vec<_> = reduce::group(hparams.replicas())
        .into_iter()
        .zip([0.4, 0.6])
        .map(|(handle, loss)| {
            let rank = handle.rank();
            let sink = (rank == 0).then(|| {
                Box::new(RecordingSink(Arc::clone(&recorded))) as Box<dyn MetricsSink>
            });
            let parts = TrainingParts {
                backend: ReplicatedBackend::new(handle, hparams.hw.device(rank)),
                model: FixedLoss::new(loss),
                source: Arc::clone(&source),
                store: Arc::clone(&store),
                reporter: Arc::new(Reporter::new(sink)),
            };
            let hparams = hparams.clone();

            tokio::spawn(async move {
                TrainingCoordinator::initialize(hparams, parts)?.run().await
            })
        })
        .collect();

    for task in tasks {
        let summary = task.await.unwrap().unwrap();
        // 4 batches split over 2 replicas
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.reports, 2);
    }

    let recorded = recorded.lock();
    let metrics: Vec<_> = recorded.iter().filter(|(g, _, _)| g == "metrics").collect();
    assert_eq!(metrics.iter().map(|(_, _, s)| *s).collect::<Vec<_>>(), vec![1, 2]);

    for (_, scalars, _) in metrics {
        assert!((scalars["loss_r"] - 0.5).abs() < 1e-6);
        assert!((scalars["tprb_r"] - 0.5).abs() < 1e-6);
    }

    let uwr = recorded.iter().find(|(g, _, _)| g == "uwr").unwrap();
    assert_eq!(uwr.1["uwr_min"], 0.0);
    assert_eq!(uwr.1["uwr_max"], 0.0);
}

#[tokio::test]
async fn unseeded_schedule_fails_before_training() {
    let dir = tempfile::tempdir().unwrap();
    let hparams = Hparams {
        learning_rate_steps: vec![100],
        learning_rate_rates: vec![0.1],
        ..hparams(dir.path(), 4)
    };

    let parts = parts(&hparams, hparams.model.build(hparams.seed).unwrap());

    assert!(matches!(
        TrainingCoordinator::initialize(hparams, parts),
        Err(TrainErr::Config(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resuming_on_another_replica_count_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let replicated = Hparams {
        hw: Hardware::Tpu,
        num_replicas: NonZeroUsize::new(2).unwrap(),
        save_interval: NonZeroUsize::new(2).unwrap(),
        ..hparams(dir.path(), 8)
    };

    let summaries = launch::train(replicated).await.unwrap();
    // the master saves before its third batch, global step 4
    let ckpt = dir.path().join("ckpt.4.safetensors");
    assert_eq!(summaries[0].saved, vec![ckpt.clone()]);

    let single = Hparams {
        ckpt_file: Some(ckpt),
        ..hparams(dir.path(), 8)
    };
    let parts = parts(&single, single.model.build(single.seed).unwrap());

    assert!(matches!(
        TrainingCoordinator::initialize(single, parts),
        Err(TrainErr::Config(_))
    ));
}

fn vq(n_codes: usize) -> ModelOpts {
    ModelOpts {
        n_quant: 16,
        bottleneck: Bottleneck::VqvaeEma,
        n_codes,
        ..Default::default()
    }
}

#[tokio::test]
async fn resuming_keeps_the_stored_codebook() {
    let dir = tempfile::tempdir().unwrap();
    let base = Hparams {
        save_interval: NonZeroUsize::new(4).unwrap(),
        codebook_refresh_step: 1,
        model: vq(8),
        ..hparams(dir.path(), 6)
    };

    direct(base.clone()).run().await.unwrap();

    let ckpt = dir.path().join("ckpt.4.safetensors");
    let record = FileCheckpointStore::new().load(Some(&ckpt)).unwrap().unwrap();
    assert_eq!(record.buffers.len(), 1);
    assert!(record.buffers[0].value().iter().any(|&c| c != 0.0));

    let resumed = direct(Hparams {
        ckpt_file: Some(ckpt),
        ..base
    });
    let codes = resumed.model().codebook().unwrap().codes();
    assert_eq!(codes.as_slice().unwrap(), record.buffers[0].value());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replicas_share_the_refreshed_codebook() {
    let dir = tempfile::tempdir().unwrap();
    let hparams = Hparams {
        hw: Hardware::Tpu,
        num_replicas: NonZeroUsize::new(2).unwrap(),
        codebook_refresh_step: 2,
        model: vq(8),
        ..hparams(dir.path(), 6)
    };
    let source = hparams.data.open(hparams.seed).unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new());

    let tasks: Vec<_> = reduce::group(hparams.replicas())
        .into_iter()
        .map(|handle| {
            let rank = handle.rank();
            let parts = TrainingParts {
                backend: ReplicatedBackend::new(handle, hparams.hw.device(rank)),
                model: hparams.model.build(hparams.seed).unwrap(),
                source: Arc::clone(&source),
                store: Arc::clone(&store),
                reporter: Arc::new(Reporter::new(None)),
            };
            let hparams = hparams.clone();

            tokio::spawn(async move {
                let mut coord = TrainingCoordinator::initialize(hparams, parts)?;
                coord.run().await?;
                Ok::<_, TrainErr>(coord)
            })
        })
        .collect();

    let mut coords = Vec::new();
    for task in tasks {
        coords.push(task.await.unwrap().unwrap());
    }

    let (a, b) = (coords[0].model(), coords[1].model());
    assert_eq!(a.codebook().unwrap().codes(), b.codebook().unwrap().codes());
    for (pa, pb) in a.parameters().iter().zip(b.parameters()) {
        assert_eq!(pa.value(), pb.value(), "'{}' diverged across replicas", pa.name());
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Call {
    Step(usize),
    Anneal(f32),
    Refresh,
}

type Calls = Arc<Mutex<Vec<Call>>>;

/// A model that logs what the coordinator asks of it.
struct Recording {
    bottleneck: Bottleneck,
    params: Vec<Parameter>,
    calls: Calls,
}

impl Model for Recording {
    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    fn run(&mut self, batch: &Batch) -> machine_learning::Result<StepOutput> {
        self.calls.lock().push(Call::Step(batch.position.batch));
        Ok(StepOutput {
            logits: Array3::zeros((1, 2, 1)),
            target: Array2::zeros((1, 1)),
            loss: 1.0,
        })
    }

    fn backward(&mut self) -> machine_learning::Result<()> {
        Ok(())
    }

    fn bottleneck(&self) -> Bottleneck {
        self.bottleneck
    }

    fn set_anneal_weight(&mut self, weight: f32) {
        self.calls.lock().push(Call::Anneal(weight));
    }

    fn update_codebook(&mut self, _rng: &mut dyn RngCore) {
        self.calls.lock().push(Call::Refresh);
    }
}

fn recording(hparams: Hparams) -> (TrainingCoordinator<DirectBackend, Recording>, Calls) {
    let calls = Calls::default();
    let model = Recording {
        bottleneck: hparams.model.bottleneck,
        params: vec![Parameter::new("w", vec![2], vec![1.0, -1.0]).unwrap()],
        calls: Arc::clone(&calls),
    };

    let parts = parts(&hparams, model);
    (TrainingCoordinator::initialize(hparams, parts).unwrap(), calls)
}

#[tokio::test]
async fn codebook_refresh_fires_once_at_its_step() {
    let dir = tempfile::tempdir().unwrap();
    let base = Hparams {
        save_interval: NonZeroUsize::new(4).unwrap(),
        codebook_refresh_step: 3,
        model: vq(4),
        ..hparams(dir.path(), 6)
    };

    let (mut coord, calls) = recording(base.clone());
    coord.run().await.unwrap();

    let calls = calls.lock().clone();
    let refreshes: Vec<_> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| **c == Call::Refresh)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(refreshes.len(), 1);
    assert_eq!(calls[refreshes[0] - 1], Call::Step(3));

    // a run resumed past the refresh step never refreshes
    let (mut resumed, calls) = recording(Hparams {
        ckpt_file: Some(dir.path().join("ckpt.4.safetensors")),
        ..base
    });
    resumed.run().await.unwrap();

    let calls = calls.lock();
    assert_eq!(calls.first(), Some(&Call::Step(4)));
    assert!(!calls.contains(&Call::Refresh));
}

#[tokio::test]
async fn anneal_weight_follows_its_schedule_across_a_resume() {
    use Call::{Anneal, Step};

    let dir = tempfile::tempdir().unwrap();
    let base = Hparams {
        save_interval: NonZeroUsize::new(4).unwrap(),
        bn_anneal_weight_steps: vec![0, 2, 5],
        bn_anneal_weight_vals: vec![0.0, 0.5, 1.0],
        model: ModelOpts {
            n_quant: 16,
            bottleneck: Bottleneck::Vae,
            ..Default::default()
        },
        ..hparams(dir.path(), 8)
    };

    let (mut coord, calls) = recording(base.clone());
    assert_eq!(*calls.lock(), vec![Anneal(0.0)]);

    coord.run().await.unwrap();
    assert_eq!(
        *calls.lock(),
        vec![
            Anneal(0.0),
            Anneal(0.0),
            Step(0),
            Step(1),
            Anneal(0.5),
            Step(2),
            Step(3),
            Step(4),
            Anneal(1.0),
            Step(5),
            Step(6),
            Step(7),
        ]
    );

    // resolved at the restored step, then the next breakpoint applies as usual
    let (mut resumed, calls) = recording(Hparams {
        ckpt_file: Some(dir.path().join("ckpt.4.safetensors")),
        ..base
    });
    assert_eq!(*calls.lock(), vec![Anneal(0.5)]);

    resumed.run().await.unwrap();
    assert_eq!(
        *calls.lock(),
        vec![Anneal(0.5), Step(4), Anneal(1.0), Step(5), Step(6), Step(7)]
    );
}
