use crate::{partition::DEFAULT_CHUNK_SIZE, script::Host};
use http::Uri;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{self, Error},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Config failed preflight checks, see log for details")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub script: ScriptConfig,
    #[serde(default)]
    pub partition: PartitionConfig,
    // external reconstruction step, only needed on the batch host
    pub reconstructor: Option<ExecConfig>,
    // external center of rotation finder, only needed if a request leaves COR unset
    pub cor_finder: Option<ExecConfig>,
    #[serde(default)]
    pub remote: RemoteConfig,
}

/// Identity of the execution environment, injected instead of probed where possible
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub host: Option<Host>,
    pub user: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ScriptConfig {
    // command the trailing line of each batch script invokes
    #[serde(default = "default_runner")]
    pub runner: String,
    // prefix starting one process per rank for rank partitioned runs
    #[serde(default = "default_launcher")]
    pub launcher: String,
    // directory with templates overriding the built-in ones by file name
    pub templates: Option<PathBuf>,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            runner: default_runner(),
            launcher: default_launcher(),
            templates: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PartitionConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

/// An external executable with fixed parameters
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExecConfig {
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
    // in seconds
    #[serde(default = "default_exec_timeout")]
    pub timeout: u64,
}

impl ExecConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    #[serde(with = "http_serde::uri", default = "default_endpoint")]
    pub endpoint: Uri,
    #[serde(default = "default_system")]
    pub system: String,
    // all durations in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            system: default_system(),
            request_timeout: default_request_timeout(),
            poll_interval: default_poll_interval(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }
}

impl RunnerConfig {
    /// load the config from `path`, a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(serde_yaml::from_str(&content)?),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!(path = ?path, "No config file found, using defaults");

                Ok(Self::default())
            }
            Err(source) => Err(ConfigErrors::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Validate the config, logging every problem instead of stopping at the first one
    pub fn preflight_checks(&self) -> Result<(), ConfigErrors> {
        let mut contains_error = false;

        if self.partition.chunk_size == 0 {
            error!("partition.chunk_size cannot be 0");
            contains_error = true;
        }

        if self.script.runner.trim().is_empty() {
            error!("script.runner must name the command invoked by batch scripts");
            contains_error = true;
        }

        if let Some(ref templates) = self.script.templates {
            if !templates.is_dir() {
                error!(
                    "script.templates ({}) is not a directory",
                    templates.to_string_lossy()
                );
                contains_error = true;
            }
        }

        for (name, exec) in [
            ("reconstructor", &self.reconstructor),
            ("cor_finder", &self.cor_finder),
        ] {
            let Some(exec) = exec else { continue };

            match check_executable(&exec.exec) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "{name}.exec ({}) is not executable",
                        exec.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if {name}.exec ({}) is an executable: {e}",
                        exec.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
            }

            if exec.timeout == 0 {
                error!("{name}.timeout cannot be 0");
                contains_error = true;
            }
        }

        if self.remote.max_attempts == 0 {
            error!("remote.max_attempts cannot be 0, no status could ever be observed");
            contains_error = true;
        }

        if self.remote.request_timeout == 0 {
            warn!("remote.request_timeout is 0, every remote call will time out immediately");
        }

        if contains_error {
            Err(ConfigErrors::Preflight)
        } else {
            Ok(())
        }
    }
}

fn default_runner() -> String {
    String::from("shifter tomobatch-runner")
}

fn default_launcher() -> String {
    String::from("srun")
}

fn default_chunk_size() -> u32 {
    DEFAULT_CHUNK_SIZE
}

fn default_exec_timeout() -> u64 {
    6 * 60 * 60
}

fn default_endpoint() -> Uri {
    Uri::from_static("https://api.nersc.gov/api/v1.2")
}

fn default_system() -> String {
    String::from("perlmutter")
}

fn default_request_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    15
}

fn default_max_attempts() -> u32 {
    240
}

#[cfg(test)]
mod config_test;
