use std::{
    collections::HashMap,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use log::debug;
use machine_learning::model::Parameter;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};
use serde::{Serialize, de::DeserializeOwned};

use super::{CheckpointRecord, CheckpointStore};
use crate::error::{Result, TrainErr};

const FORMAT: &str = "coordinator-ckpt-2";

/// Stores each checkpoint as a single safetensors file.
///
/// Parameters and model buffers are F32 tensors, the rest of the record lives as JSON in the file metadata. Writes
/// go to `<path>.tmp` first and are renamed over `<path>`, so an interrupted save never damages
/// an existing checkpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileCheckpointStore;

impl FileCheckpointStore {
    pub fn new() -> Self {
        Self
    }

    fn encode(path: &Path, record: &CheckpointRecord) -> Result<Vec<u8>> {
        let fail = |e: &dyn std::fmt::Display| TrainErr::checkpoint(path, e);

        if let Some(clash) = record
            .buffers
            .iter()
            .find(|b| record.params.iter().any(|p| p.name() == b.name()))
        {
            return Err(TrainErr::checkpoint(
                path,
                format!("'{}' is both a parameter and a buffer", clash.name()),
            ));
        }

        let tensors = record
            .params
            .iter()
            .chain(&record.buffers)
            .map(|p| {
                TensorView::new(Dtype::F32, p.shape().to_vec(), bytemuck::cast_slice(p.value()))
                    .map(|view| (p.name().to_string(), view))
                    .map_err(|e| fail(&e))
            })
            .collect::<Result<Vec<_>>>()?;

        let order: Vec<&str> = record.params.iter().map(Parameter::name).collect();
        let buffer_order: Vec<&str> = record.buffers.iter().map(Parameter::name).collect();

        let metadata = HashMap::from([
            ("format".to_string(), FORMAT.to_string()),
            ("param_order".to_string(), to_json(path, &order)?),
            ("buffer_order".to_string(), to_json(path, &buffer_order)?),
            ("position".to_string(), to_json(path, &record.position)?),
            ("optim_step".to_string(), record.optim_step.to_string()),
            ("optimizer".to_string(), to_json(path, &record.optimizer)?),
            ("rng".to_string(), to_json(path, &record.rng)?),
            ("hparams".to_string(), to_json(path, &record.hparams)?),
        ]);

        safetensors::serialize(tensors, &Some(metadata)).map_err(|e| fail(&e))
    }

    fn decode(path: &Path, bytes: &[u8]) -> Result<CheckpointRecord> {
        let fail = |e: &dyn std::fmt::Display| TrainErr::checkpoint(path, e);

        let (_, header) = SafeTensors::read_metadata(bytes).map_err(|e| fail(&e))?;
        let metadata = header
            .metadata()
            .as_ref()
            .ok_or_else(|| TrainErr::checkpoint(path, "missing metadata"))?;

        let field = |key: &str| -> Result<&str> {
            metadata
                .get(key)
                .map(String::as_str)
                .ok_or_else(|| TrainErr::checkpoint(path, format!("missing '{key}'")))
        };

        if field("format")? != FORMAT {
            return Err(TrainErr::checkpoint(path, "unknown checkpoint format"));
        }

        let tensors = SafeTensors::deserialize(bytes).map_err(|e| fail(&e))?;
        let read = |key: &str| -> Result<Vec<Parameter>> {
            let order: Vec<String> = from_json(path, field(key)?)?;
            order
                .iter()
                .map(|name| {
                    let view = tensors.tensor(name).map_err(|e| fail(&e))?;
                    if view.dtype() != Dtype::F32 {
                        return Err(TrainErr::checkpoint(path, format!("'{name}' isn't F32")));
                    }

                    let values = view
                        .data()
                        .chunks_exact(size_of::<f32>())
                        .map(bytemuck::pod_read_unaligned::<f32>)
                        .collect();

                    Parameter::new(name.clone(), view.shape().to_vec(), values)
                        .map_err(|e| fail(&e))
                })
                .collect()
        };

        Ok(CheckpointRecord {
            params: read("param_order")?,
            buffers: read("buffer_order")?,
            optimizer: from_json(path, field("optimizer")?)?,
            rng: from_json(path, field("rng")?)?,
            position: from_json(path, field("position")?)?,
            optim_step: field("optim_step")?
                .parse()
                .map_err(|e| fail(&e))?,
            hparams: from_json(path, field("hparams")?)?,
        })
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, path: Option<&Path>) -> Result<Option<CheckpointRecord>> {
        let Some(path) = path else {
            return Ok(None);
        };

        let bytes = fs::read(path).map_err(|e| TrainErr::checkpoint(path, e))?;
        let record = Self::decode(path, &bytes)?;
        debug!(
            "loaded checkpoint {} at epoch {} batch {}",
            path.display(),
            record.position.epoch,
            record.position.batch
        );

        Ok(Some(record))
    }

    fn save(&self, path: &Path, record: &CheckpointRecord) -> Result<PathBuf> {
        let bytes = Self::encode(path, record)?;

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| TrainErr::checkpoint(path, e))?;
        }

        let mut tmp = OsString::from(path.as_os_str());
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, bytes).map_err(|e| TrainErr::checkpoint(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| TrainErr::checkpoint(path, e))?;

        Ok(path.to_path_buf())
    }
}

fn to_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| TrainErr::checkpoint(path, e))
}

fn from_json<T: DeserializeOwned>(path: &Path, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| TrainErr::checkpoint(path, e))
}
