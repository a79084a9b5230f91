use std::{io, num::NonZeroUsize, sync::Arc};

use log::{error, info};
use tokio::task::JoinSet;

use crate::{
    backend::{DirectBackend, ReplicatedBackend},
    checkpoint::{CheckpointStore, FileCheckpointStore},
    config::{Hparams, InferenceOpts},
    error::{Result, TrainErr},
    inference::{InferenceCoordinator, InferenceSummary},
    reduce,
    report::Reporter,
    training::{TrainSummary, TrainingCoordinator, TrainingParts},
};

/// Runs a whole training job, one coordinator per replica.
///
/// Replicated hardware spawns a task per replica sharing a reduction group, everything else
/// runs a single coordinator on a direct backend. Only the master writes checkpoints and
/// metrics.
///
/// # Returns
/// The summary of every replica, in rank order.
///
/// # Errors
/// The first error any replica stops with. The remaining replicas are aborted, since they would
/// wait forever on the next reduction.
pub async fn train(hparams: Hparams) -> Result<Vec<TrainSummary>> {
    hparams.validate()?;

    let source = hparams.data.open(hparams.seed)?;
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new());

    if !hparams.hw.is_replicated() {
        info!("training on {}", hparams.hw);
        let parts = TrainingParts {
            backend: DirectBackend::new(hparams.hw.device(0)),
            model: hparams.model.build(hparams.seed)?,
            source,
            store,
            reporter: Arc::new(Reporter::open(hparams.log_dir.as_deref(), true)),
        };

        let summary = TrainingCoordinator::initialize(hparams, parts)?.run().await?;
        return Ok(vec![summary]);
    }

    let replicas = hparams.replicas();
    info!("training on {} with {replicas} replicas", hparams.hw);

    let mut tasks = JoinSet::new();
    for handle in reduce::group(replicas) {
        let hparams = hparams.clone();
        let source = Arc::clone(&source);
        let store = Arc::clone(&store);

        tasks.spawn(async move {
            let rank = handle.rank();
            let parts = TrainingParts {
                backend: ReplicatedBackend::new(handle, hparams.hw.device(rank)),
                model: hparams.model.build(hparams.seed)?,
                source,
                store,
                reporter: Arc::new(Reporter::open(hparams.log_dir.as_deref(), rank == 0)),
            };

            TrainingCoordinator::initialize(hparams, parts)?.run().await
        });
    }

    let mut summaries = Vec::with_capacity(replicas.get());
    while let Some(joined) = tasks.join_next().await {
        match joined.map_err(|e| TrainErr::Io(io::Error::other(e)))? {
            Ok(summary) => summaries.push(summary),
            Err(e) => {
                error!("replica failed, stopping the run: {e}");
                tasks.abort_all();
                return Err(e);
            }
        }
    }

    summaries.sort_by_key(|s| s.rank);
    Ok(summaries)
}

/// Runs inference with a trained checkpoint on a single replica.
///
/// # Errors
/// Any error from loading the checkpoint, reading the data or writing the outputs.
pub async fn infer(opts: InferenceOpts) -> Result<InferenceSummary> {
    let source = opts.data.open(opts.seed)?;
    let store = FileCheckpointStore::new();

    let record = store
        .load(Some(&opts.ckpt_file))?
        .ok_or_else(|| TrainErr::checkpoint(&opts.ckpt_file, "no checkpoint found"))?;
    let model = record.hparams.model.build(record.hparams.seed)?;
    let device = opts.hwtype.device(0);

    info!("inference on {}", opts.hwtype);
    if opts.hwtype.is_replicated() {
        let handle = reduce::group(NonZeroUsize::MIN).remove(0);
        let backend = ReplicatedBackend::new(handle, device);
        InferenceCoordinator::initialize(opts, backend, model, source, &store)?
            .run()
            .await
    } else {
        let backend = DirectBackend::new(device);
        InferenceCoordinator::initialize(opts, backend, model, source, &store)?
            .run()
            .await
    }
}
