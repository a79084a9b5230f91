use log::warn;
use machine_learning::{
    Device, RunPosition,
    model::Parameter,
    optimization::Optimizer,
    source::{BatchSource, ShardSpec},
};
use tokio::{sync::mpsc, task::JoinHandle};

use super::{DeferredReport, ExecutionBackend};
use crate::{
    error::{Result, TrainErr},
    loader::{DeviceLoader, PREFETCH},
    reduce::{Combine, ReplicaHandle},
};

/// One replica of a lock-step group, each owning a device and a shard of the batches.
///
/// Gradients are mean reduced across the group before every optimizer step, and reports are
/// queued to a reporter thread so they never hold up the next step.
pub struct ReplicatedBackend {
    handle: ReplicaHandle,
    shard: ShardSpec,
    device: Device,
    reports: Option<mpsc::UnboundedSender<DeferredReport>>,
    reporter: Option<JoinHandle<()>>,
}

impl ReplicatedBackend {
    /// Creates a new `ReplicatedBackend`.
    ///
    /// Must be called from within a tokio runtime, the reporter thread starts right away.
    ///
    /// # Arguments
    /// * `handle` - This replica's endpoint into the reduction group.
    /// * `device` - Where this replica's batches are placed.
    ///
    /// # Returns
    /// A new `ReplicatedBackend` instance.
    pub fn new(handle: ReplicaHandle, device: Device) -> Self {
        let shard = ShardSpec::new(handle.rank(), handle.size());
        let (tx, mut rx) = mpsc::unbounded_channel::<DeferredReport>();

        let reporter = tokio::task::spawn_blocking(move || {
            while let Some(report) = rx.blocking_recv() {
                report();
            }
        });

        Self {
            handle,
            shard,
            device,
            reports: Some(tx),
            reporter: Some(reporter),
        }
    }
}

impl ExecutionBackend for ReplicatedBackend {
    fn rank(&self) -> usize {
        self.handle.rank()
    }

    fn num_replicas(&self) -> usize {
        self.handle.size().get()
    }

    fn device(&self) -> Device {
        self.device
    }

    fn shard(&self) -> ShardSpec {
        self.shard
    }

    fn iterate_batches(&self, source: &dyn BatchSource, start: RunPosition) -> DeviceLoader {
        DeviceLoader::parallel(source.shard(self.shard, start), self.device, PREFETCH)
    }

    async fn reduce(&self, combine: Combine, local: &[f32]) -> Vec<f32> {
        self.handle.reduce(combine, local).await
    }

    async fn step_optimizer(
        &self,
        optimizer: &mut dyn Optimizer,
        params: &mut [Parameter],
    ) -> Result<()> {
        let flat: Vec<f32> = params.iter().flat_map(|p| p.grad().iter().copied()).collect();
        let mean = self.handle.reduce(Combine::Mean, &flat).await;

        let mut offset = 0;
        for param in params.iter_mut() {
            let len = param.len();
            param.grad_mut().copy_from_slice(&mean[offset..offset + len]);
            offset += len;
        }

        optimizer.step(params).map_err(TrainErr::Model)
    }

    fn schedule_deferred_report(&self, report: DeferredReport) {
        let Some(tx) = &self.reports else {
            report();
            return;
        };

        if let Err(mpsc::error::SendError(report)) = tx.send(report) {
            warn!(rank = self.rank(); "reporter is gone, reporting inline");
            report();
        }
    }

    async fn finish(&mut self) {
        self.reports.take();

        if let Some(reporter) = self.reporter.take() {
            if let Err(e) = reporter.await {
                warn!(rank = self.rank(); "reporter stopped abnormally: {e}");
            }
        }
    }
}
