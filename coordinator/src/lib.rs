pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod inference;
pub mod launch;
pub mod loader;
pub mod probe;
pub mod reduce;
pub mod report;
pub mod schedule;
pub mod training;

pub use backend::{DirectBackend, ExecutionBackend, ReplicatedBackend};
pub use checkpoint::{CheckpointRecord, CheckpointStore, FileCheckpointStore};
pub use config::{Hardware, Hparams, InferenceOpts};
pub use error::{Result, TrainErr};
pub use inference::{InferenceCoordinator, InferenceSummary};
pub use training::{Phase, TrainSummary, TrainingCoordinator, TrainingParts};
