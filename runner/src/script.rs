//! Turns a request into a submittable batch script.

use crate::{
    codec::{self, CodecError, EncodedRequest},
    collaborators::{CollaboratorError, CorDetector, EnvironmentProbe},
    config::ScriptConfig,
    request::{Algorithm, ReconstructionRequest, RequestError},
};
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    fmt, fs, io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tracing::{debug, info};

const USERNAME_PLACEHOLDER: &str = "<username>";

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Unsupported environment `{0}`, only cori and perlmutter have templates")]
    UnsupportedEnvironment(String),
    #[error("Failed to read template {path:?}: {source}")]
    Template { path: PathBuf, source: io::Error },
    #[error("Failed to write {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("Invalid request: {0}")]
    Request(#[from] RequestError),
    #[error("Failed to encode request: {0}")]
    Codec(#[from] CodecError),
    #[error("Failed to detect center of rotation: {0}")]
    CorDetection(#[source] CollaboratorError),
}

/// Hosts with a set of batch templates
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Host {
    Cori,
    Perlmutter,
}

impl Host {
    /// match a raw host identity, e.g. the content of `NERSC_HOST`
    pub fn detect(identity: &str) -> Result<Self, ScriptError> {
        let lowered = identity.trim().to_lowercase();

        if lowered.contains("perlmutter") {
            Ok(Self::Perlmutter)
        } else if lowered.contains("cori") {
            Ok(Self::Cori)
        } else {
            Err(ScriptError::UnsupportedEnvironment(identity.trim().to_owned()))
        }
    }

    /// ask the probe for the host identity, unknown or missing identities are fatal
    pub fn probe(probe: &dyn EnvironmentProbe) -> Result<Self, ScriptError> {
        match probe.host() {
            Some(identity) => Self::detect(&identity),
            None => Err(ScriptError::UnsupportedEnvironment(String::from(
                "<no host identity>",
            ))),
        }
    }
}

impl FromStr for Host {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::detect(s)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cori => f.write_str("cori"),
            Self::Perlmutter => f.write_str("perlmutter"),
        }
    }
}

/// file name of the template for `algorithm` on `host`
pub fn template_name(algorithm: Algorithm, host: Host) -> String {
    format!("{algorithm}_template_job-{host}.txt")
}

fn builtin_template(algorithm: Algorithm, host: Host) -> &'static str {
    match (algorithm, host) {
        (Algorithm::Astra, Host::Cori) => include_str!("../templates/astra_template_job-cori.txt"),
        (Algorithm::Astra, Host::Perlmutter) => {
            include_str!("../templates/astra_template_job-perlmutter.txt")
        }
        (Algorithm::Svmbir, Host::Cori) => {
            include_str!("../templates/svmbir_template_job-cori.txt")
        }
        (Algorithm::Svmbir, Host::Perlmutter) => {
            include_str!("../templates/svmbir_template_job-perlmutter.txt")
        }
    }
}

/// A filled in template, not yet written anywhere
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchScript {
    pub algorithm: Algorithm,
    pub host: Host,
    pub text: String,
    pub encoded: EncodedRequest,
}

/// Fills templates for one host and user
#[derive(Clone)]
pub struct ScriptBuilder<'a> {
    config: &'a ScriptConfig,
    host: Host,
    user: String,
    detector: Option<&'a (dyn CorDetector + Sync)>,
}

impl<'a> ScriptBuilder<'a> {
    pub fn new(config: &'a ScriptConfig, host: Host, user: impl Into<String>) -> Self {
        Self {
            config,
            host,
            user: user.into(),
            detector: None,
        }
    }

    /// resolve a missing COR of rank partitioned requests while building
    pub fn with_detector(mut self, detector: &'a (dyn CorDetector + Sync)) -> Self {
        self.detector = Some(detector);
        self
    }

    /// resolve the host through `probe`, fails for anything but the supported hosts
    pub fn from_probe(
        config: &'a ScriptConfig,
        probe: &dyn EnvironmentProbe,
        user: impl Into<String>,
    ) -> Result<Self, ScriptError> {
        Ok(Self::new(config, Host::probe(probe)?, user))
    }

    pub fn host(&self) -> Host {
        self.host
    }

    fn template(&self, algorithm: Algorithm) -> Result<Cow<'static, str>, ScriptError> {
        if let Some(ref directory) = self.config.templates {
            let path = directory.join(template_name(algorithm, self.host));

            if path.is_file() {
                debug!(path = ?path, "Using template override");

                return fs::read_to_string(&path)
                    .map(Cow::Owned)
                    .map_err(|source| ScriptError::Template { path, source });
            }
        }

        Ok(Cow::Borrowed(builtin_template(algorithm, self.host)))
    }

    /// the trailing line starting the runner with the encoded request
    fn invocation(&self, algorithm: Algorithm, encoded: &EncodedRequest) -> String {
        let runner = self.config.runner.trim();

        match algorithm {
            Algorithm::Astra => format!("{runner} run {encoded}"),
            Algorithm::Svmbir => format!("{} {runner} run {encoded}", self.config.launcher.trim()),
        }
    }

    /// Every rank of a rank partitioned run starts from the same encoded
    /// request, so a COR left unset is detected once here instead of once per
    /// rank. Chunked runs have a single controller and detect on their own.
    fn resolve_cor<'r>(
        &self,
        algorithm: Algorithm,
        request: &'r ReconstructionRequest,
    ) -> Result<Cow<'r, ReconstructionRequest>, ScriptError> {
        match (algorithm, request.cor(), self.detector) {
            (Algorithm::Svmbir, None, Some(detector)) => {
                let cor = detector
                    .detect(&request.data.data_path)
                    .map_err(ScriptError::CorDetection)?;
                info!(cor, "Resolved center of rotation for all ranks");

                let mut resolved = request.clone();
                if let Some(settings) = resolved.svmbir_settings.as_mut() {
                    settings.cor = Some(cor);
                }

                Ok(Cow::Owned(resolved))
            }
            _ => Ok(Cow::Borrowed(request)),
        }
    }

    /// Build the script text for `request`, deterministic for identical input
    pub fn build(&self, request: &ReconstructionRequest) -> Result<BatchScript, ScriptError> {
        let algorithm = request.validate()?;
        let request = self.resolve_cor(algorithm, request)?;
        let encoded = codec::encode(request.as_ref())?;

        let mut text = self.template(algorithm)?.replace(USERNAME_PLACEHOLDER, &self.user);
        if !text.ends_with('\n') {
            text.push('\n');
        }
        text.push('\n');
        text.push_str(&self.invocation(algorithm, &encoded));
        text.push('\n');

        Ok(BatchScript {
            algorithm,
            host: self.host,
            text,
            encoded,
        })
    }
}

fn write(path: &Path, content: &str) -> Result<(), ScriptError> {
    fs::write(path, content).map_err(|source| ScriptError::Write {
        path: path.to_path_buf(),
        source,
    })
}

impl BatchScript {
    /// Write script and encoded request to the configs directory of `request`.
    /// Re-running for the same request name overwrites the previous files.
    pub fn persist(&self, request: &ReconstructionRequest) -> Result<PathBuf, ScriptError> {
        let configs = request.configs_dir();
        fs::create_dir_all(&configs).map_err(|source| ScriptError::Write {
            path: configs.clone(),
            source,
        })?;

        let script_path = request.script_path();
        write(&script_path, &self.text)?;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755)).map_err(
            |source| ScriptError::Write {
                path: script_path.clone(),
                source,
            },
        )?;

        write(&request.encoded_path(), &format!("{}\n", self.encoded))?;

        info!(
            path = ?script_path,
            algorithm = %self.algorithm,
            host = %self.host,
            "Wrote batch script"
        );

        Ok(script_path)
    }
}
