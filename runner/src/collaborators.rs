//! Narrow interfaces to everything the runner does not implement itself:
//! the reconstruction mathematics, center of rotation detection, image stack
//! persistence and probing the execution environment.

pub mod exec;
pub mod stack;

use crate::{
    partition::SliceRange,
    request::{Algorithm, IndexSelector, ProcessingStep},
};
use ndarray::Array3;
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    env, io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

pub use exec::{ExecCorDetector, ExecReconstructor};
pub use stack::RawStackWriter;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Failed to spawn {exec:?}: {source}")]
    Spawn { exec: PathBuf, source: io::Error },
    #[error("{exec:?} did not finish within {timeout:?}")]
    Timeout { exec: PathBuf, timeout: Duration },
    #[error("{exec:?} exited unsuccessfully (status {status:?})")]
    Failed { exec: PathBuf, status: Option<i32> },
    #[error("Failed to deserialize collaborator output")]
    Deserialize(#[from] serde_yaml::Error),
    #[error("Unexpected collaborator output: {0}")]
    Output(String),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

/// Everything one reconstruction step needs to process one work unit
#[derive(Serialize, Clone, Debug)]
pub struct UnitInput<'a> {
    pub algorithm: Algorithm,
    pub data_path: &'a Path,
    pub angles: Option<&'a IndexSelector>,
    pub slices: SliceRange,
    pub cor: f64,
    pub downsample: u32,
    // only set for filtered backprojection
    pub filter_cutoff: Option<f64>,
    // solver knobs for the iterative family
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<&'a BTreeMap<String, Value>>,
    pub preprocess: &'a [ProcessingStep],
    pub postprocess: &'a [ProcessingStep],
    pub use_accelerator: bool,
}

/// Reconstructed slab, indexed as (slice, row, column)
#[derive(Clone, Debug)]
pub struct Reconstruction {
    pub volume: Array3<f32>,
    pub metadata: BTreeMap<String, serde_yaml::Value>,
}

/// Pure function of its input, possibly slow and resource intensive
pub trait Reconstructor {
    fn reconstruct(&self, input: &UnitInput<'_>) -> Result<Reconstruction, CollaboratorError>;
}

pub trait CorDetector {
    fn detect(&self, data_path: &Path) -> Result<f64, CollaboratorError>;
}

/// Persists one slab, must be safe to call once per unit
pub trait StackWriter {
    /// write `volume` as consecutive images starting at `start_index`, returns the written files
    fn write_stack(
        &self,
        volume: &Array3<f32>,
        prefix: &Path,
        start_index: u32,
    ) -> Result<Vec<PathBuf>, CollaboratorError>;
}

/// Read only view of the execution environment
pub trait EnvironmentProbe {
    /// raw host identity, e.g. the content of `NERSC_HOST`
    fn host(&self) -> Option<String>;
    fn has_accelerator(&self) -> bool;
}

/// Probe for the machine this process runs on
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemProbe;

impl EnvironmentProbe for SystemProbe {
    fn host(&self) -> Option<String> {
        env::var("NERSC_HOST").ok().filter(|host| !host.is_empty())
    }

    fn has_accelerator(&self) -> bool {
        let visible = env::var("CUDA_VISIBLE_DEVICES")
            .map(|devices| {
                let devices = devices.trim();
                !devices.is_empty() && devices != "-1" && devices != "NoDevFiles"
            })
            .unwrap_or(false);

        visible || Path::new("/dev/nvidia0").exists()
    }
}

/// Probe with injected answers
#[derive(Clone, Debug, Default)]
pub struct StaticProbe {
    pub host: Option<String>,
    pub accelerator: bool,
}

impl EnvironmentProbe for StaticProbe {
    fn host(&self) -> Option<String> {
        self.host.clone()
    }

    fn has_accelerator(&self) -> bool {
        self.accelerator
    }
}

/// primitve way to retrieve the tmp dir from the environment with default to /tmp
pub(crate) fn get_tmp_dir() -> PathBuf {
    env::var("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or(PathBuf::from("/tmp"))
}
