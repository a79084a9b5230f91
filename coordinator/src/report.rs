use std::{
    collections::BTreeMap,
    error::Error,
    fmt::{self, Display},
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use log::{info, warn};
use machine_learning::model::Metrics;
use parking_lot::Mutex;
use serde::Serialize;

/// The scalar groups sent to the sink on every report, keyed by optimizer step.
pub const GROUPS: [(&str, [&str; 2]); 2] = [
    ("metrics", ["loss_r", "tprb_r"]),
    ("uwr", ["uwr_min", "uwr_max"]),
];

/// Named scalars captured once per reporting interval on every replica.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSnapshot {
    values: BTreeMap<String, f64>,
}

impl MetricSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<f64>) {
        self.values.insert(name.into(), value.into());
    }

    /// Adds every model reported metric.
    pub fn merge(&mut self, metrics: &Metrics) {
        for (name, value) in metrics {
            self.insert(name.clone(), *value);
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn values(&self) -> &BTreeMap<String, f64> {
        &self.values
    }

    /// The scalars of `names` that are present.
    pub fn group(&self, names: &[&str]) -> BTreeMap<String, f64> {
        names
            .iter()
            .filter_map(|&n| self.get(n).map(|v| (n.to_string(), v)))
            .collect()
    }
}

impl Display for MetricSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.values {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{name}: {value:.5}")?;
        }
        Ok(())
    }
}

/// A sink couldn't take a report.
#[derive(Debug)]
pub enum ReportErr {
    Io(io::Error),
    Encode(serde_json::Error),
}

impl Display for ReportErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportErr::Io(e) => write!(f, "metrics sink io error: {e}"),
            ReportErr::Encode(e) => write!(f, "failed to encode metrics: {e}"),
        }
    }
}

impl Error for ReportErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReportErr::Io(e) => Some(e),
            ReportErr::Encode(e) => Some(e),
        }
    }
}

impl From<io::Error> for ReportErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ReportErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Encode(value)
    }
}

/// A dashboard backend taking groups of scalars.
pub trait MetricsSink: Send {
    fn add_scalars(
        &mut self,
        group: &str,
        scalars: &BTreeMap<String, f64>,
        step: u64,
    ) -> Result<(), ReportErr>;
}

/// Appends one JSON object per group to `<log_dir>/metrics.jsonl`.
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

#[derive(Serialize)]
struct Line<'a> {
    group: &'a str,
    step: u64,
    scalars: &'a BTreeMap<String, f64>,
}

impl JsonlSink {
    pub const FILE_NAME: &'static str = "metrics.jsonl";

    /// Opens the sink, creating `log_dir` when missing.
    pub fn create(log_dir: &Path) -> Result<Self, ReportErr> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join(Self::FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonlSink {
    fn add_scalars(
        &mut self,
        group: &str,
        scalars: &BTreeMap<String, f64>,
        step: u64,
    ) -> Result<(), ReportErr> {
        serde_json::to_writer(
            &mut self.writer,
            &Line {
                group,
                step,
                scalars,
            },
        )?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Prints snapshots and forwards them to an optional sink. Sink failures are logged and
/// swallowed, a report never fails the run.
pub struct Reporter {
    sink: Mutex<Option<Box<dyn MetricsSink>>>,
}

impl Reporter {
    pub fn new(sink: Option<Box<dyn MetricsSink>>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    /// Opens a `JsonlSink` under `log_dir` when this replica is the master.
    ///
    /// # Arguments
    /// * `log_dir` - Where metrics go, no sink is opened when unset.
    /// * `is_master` - Only the master replica writes metrics.
    pub fn open(log_dir: Option<&Path>, is_master: bool) -> Self {
        let sink = match log_dir {
            Some(dir) if is_master => match JsonlSink::create(dir) {
                Ok(sink) => {
                    info!("writing metrics to {}", sink.path().display());
                    Some(Box::new(sink) as Box<dyn MetricsSink>)
                }
                Err(e) => {
                    warn!("could not create metrics sink in {}: {e}", dir.display());
                    None
                }
            },
            _ => None,
        };

        Self::new(sink)
    }

    pub fn has_sink(&self) -> bool {
        self.sink.lock().is_some()
    }

    pub fn report(&self, snapshot: &MetricSnapshot, rank: usize) {
        info!(rank = rank; "{snapshot}");

        let mut sink = self.sink.lock();
        let Some(sink) = sink.as_mut() else {
            return;
        };

        let step = snapshot.get("optim_step").unwrap_or(0.0) as u64;
        for (group, names) in GROUPS {
            if let Err(e) = sink.add_scalars(group, &snapshot.group(&names), step) {
                warn!(rank = rank; "dropping '{group}' metrics at step {step}: {e}");
            }
        }
    }
}
