use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fmt,
    path::{Component, Path, PathBuf},
};
use thiserror::Error;

use crate::partition::SliceRange;

#[derive(Error, Debug, PartialEq)]
pub enum RequestError {
    #[error("Request contains neither `recon` nor `svmbir_settings`, unable to select an algorithm")]
    MissingSettings,
    #[error("Required field `{0}` is empty")]
    EmptyField(&'static str),
    #[error("Request name `{0}` must be a single path component")]
    InvalidName(String),
    #[error("start_slice ({start}) must not exceed stop_slice ({stop})")]
    InvalidSliceRange { start: u32, stop: u32 },
    #[error("proj_downsample must be at least 1")]
    InvalidDownsample,
    #[error("Field `{0}` must be a finite number")]
    NonFinite(&'static str),
}

/// Reconstruction families, each tied to its own partitioning policy
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// filtered backprojection (astra), processed in sequential chunks
    Astra,
    /// model based iterative reconstruction (svmbir), partitioned over ranks
    Svmbir,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Astra => f.write_str("astra"),
            Self::Svmbir => f.write_str("svmbir"),
        }
    }
}

/// Selects a subset of projection angles, absent means all of them
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum IndexSelector {
    // listed first, a struct would also accept a plain sequence
    List(Vec<u32>),
    Range {
        start: u32,
        stop: u32,
        #[serde(default = "default_step")]
        step: u32,
    },
}

fn default_step() -> u32 {
    1
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DataSettings {
    pub data_path: PathBuf,
    pub name: String,
    pub output_path: PathBuf,
    pub start_slice: u32,
    pub stop_slice: u32,
    #[serde(default)]
    pub angles_ind: Option<IndexSelector>,
    #[serde(default = "default_downsample")]
    pub proj_downsample: u32,
}

fn default_downsample() -> u32 {
    1
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FbpSettings {
    // None means "detect before partitioning"
    #[serde(rename = "COR", default)]
    pub cor: Option<f64>,
    /// frequency cutoff of the reconstruction filter
    pub fc: f64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct IterativeSettings {
    #[serde(rename = "COR", default)]
    pub cor: Option<f64>,
    // solver specific knobs, forwarded untouched to the reconstructor
    #[serde(flatten)]
    pub options: BTreeMap<String, Value>,
}

/// One named pre- or postprocessing step
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProcessingStep {
    pub name: String,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

/// The record a client submits; immutable once it has been encoded
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ReconstructionRequest {
    pub data: DataSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recon: Option<FbpSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub svmbir_settings: Option<IterativeSettings>,
    #[serde(default)]
    pub preprocess: Vec<ProcessingStep>,
    #[serde(default)]
    pub postprocess: Vec<ProcessingStep>,
}

impl ReconstructionRequest {
    /// detect the family by which optional settings block is populated,
    /// `svmbir_settings` takes precedence
    pub fn algorithm(&self) -> Result<Algorithm, RequestError> {
        match (&self.svmbir_settings, &self.recon) {
            (Some(_), _) => Ok(Algorithm::Svmbir),
            (None, Some(_)) => Ok(Algorithm::Astra),
            (None, None) => Err(RequestError::MissingSettings),
        }
    }

    /// center of rotation of the selected family, `None` if it must be detected
    pub fn cor(&self) -> Option<f64> {
        match (&self.svmbir_settings, &self.recon) {
            (Some(settings), _) => settings.cor,
            (None, Some(settings)) => settings.cor,
            (None, None) => None,
        }
    }

    pub fn slices(&self) -> SliceRange {
        SliceRange::new(self.data.start_slice, self.data.stop_slice)
    }

    /// Check the fields a decoded request must carry before anything is run
    pub fn validate(&self) -> Result<Algorithm, RequestError> {
        let algorithm = self.algorithm()?;
        let data = &self.data;

        if data.name.is_empty() {
            return Err(RequestError::EmptyField("data.name"));
        }
        let mut components = Path::new(&data.name).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(RequestError::InvalidName(data.name.clone()));
        }
        if data.data_path.as_os_str().is_empty() {
            return Err(RequestError::EmptyField("data.data_path"));
        }
        if data.output_path.as_os_str().is_empty() {
            return Err(RequestError::EmptyField("data.output_path"));
        }
        if data.start_slice > data.stop_slice {
            return Err(RequestError::InvalidSliceRange {
                start: data.start_slice,
                stop: data.stop_slice,
            });
        }
        if data.proj_downsample == 0 {
            return Err(RequestError::InvalidDownsample);
        }
        if let Some(recon) = &self.recon {
            if !recon.fc.is_finite() {
                return Err(RequestError::NonFinite("recon.fc"));
            }
        }
        if matches!(self.cor(), Some(cor) if !cor.is_finite()) {
            return Err(RequestError::NonFinite("COR"));
        }

        Ok(algorithm)
    }

    /// `{output_path}/configs`
    pub fn configs_dir(&self) -> PathBuf {
        self.data.output_path.join("configs")
    }

    /// `{output_path}/configs/config_{name}.sh`
    pub fn script_path(&self) -> PathBuf {
        self.configs_dir()
            .join(format!("config_{}.sh", self.data.name))
    }

    /// `{output_path}/configs/config_{name}.enc`
    pub fn encoded_path(&self) -> PathBuf {
        self.configs_dir()
            .join(format!("config_{}.enc", self.data.name))
    }

    /// `{output_path}/{name}`
    pub fn output_dir(&self) -> PathBuf {
        self.data.output_path.join(&self.data.name)
    }

    /// `{output_path}/{name}/{name}`, the stack writer appends the index suffix
    pub fn output_prefix(&self) -> PathBuf {
        self.output_dir().join(&self.data.name)
    }
}
