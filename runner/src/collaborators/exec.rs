use super::{
    get_tmp_dir, CollaboratorError, CorDetector, Reconstruction, Reconstructor, UnitInput,
};
use crate::config::ExecConfig;
use itertools::Itertools;
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    process::{self, Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, warn};
use tracing_unwrap::OptionExt;
use wait_timeout::ChildExt;

/// Reply a reconstructor prints on stdout
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct ReconstructorReply {
    shape: [usize; 3],
    #[serde(default)]
    metadata: BTreeMap<String, serde_yaml::Value>,
}

/// Job description a reconstructor receives on stdin
#[derive(Serialize)]
struct UnitJob<'a> {
    #[serde(flatten)]
    input: &'a UnitInput<'a>,
    // raw little endian f32 voxels are expected here
    volume_path: &'a Path,
}

/// Reconstruction step delegated to an external executable
#[derive(Debug, Clone)]
pub struct ExecReconstructor {
    config: ExecConfig,
    scratch: PathBuf,
}

/// Center of rotation finder delegated to an external executable
#[derive(Debug, Clone)]
pub struct ExecCorDetector {
    config: ExecConfig,
}

/// Feed `input` to the stdin of `child` and wait for it, killing it once
/// `timeout` is exceeded. Returns everything the child wrote to stdout.
fn wait_for(
    mut child: Child,
    exec: &Path,
    timeout: Duration,
    input: &[u8],
) -> Result<String, CollaboratorError> {
    let start = Instant::now();

    // stdout is drained concurrently, a child blocked on a full pipe would never exit
    let mut stdout = child
        .stdout
        .take()
        .expect_or_log("stdout of collaborator was not piped");
    let reader = thread::spawn(move || {
        let mut output = String::new();
        stdout.read_to_string(&mut output).map(|_| output)
    });

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(error) = stdin.write_all(input) {
            // a child that exits without reading its input is judged by its exit status
            warn!(exec = ?exec, error = ?error, "Failed to write collaborator input");
        }
        // closing stdin marks the end of the input
        drop(stdin);
    }

    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            warn!(exec = ?exec, "Collaborator ran into timeout, killing it");

            if let Err(error) = child.kill() {
                error!(error = ?error, "Failed to kill collaborator");
            }
            // reap the killed process, the reader ends once the pipe closes
            let _ = child.wait();

            return Err(CollaboratorError::Timeout {
                exec: exec.to_path_buf(),
                timeout,
            });
        }
    };

    debug!(
        exec = ?exec,
        elapsed = ?start.elapsed(),
        success = status.success(),
        "Collaborator finished"
    );

    if !status.success() {
        return Err(CollaboratorError::Failed {
            exec: exec.to_path_buf(),
            status: status.code(),
        });
    }

    reader
        .join()
        .map_err(|_| CollaboratorError::Output(String::from("stdout reader panicked")))?
        .map_err(CollaboratorError::from)
}

impl ExecReconstructor {
    pub fn new(config: ExecConfig) -> Self {
        Self {
            config,
            scratch: get_tmp_dir(),
        }
    }

    /// place scratch volumes somewhere else than `$TMPDIR`
    pub fn with_scratch(mut self, scratch: PathBuf) -> Self {
        self.scratch = scratch;
        self
    }

    fn scratch_path(&self, input: &UnitInput<'_>) -> PathBuf {
        self.scratch.join(format!(
            "tomobatch-{}-{}-{}.raw",
            process::id(),
            input.slices.start,
            input.slices.stop
        ))
    }

    fn run(&self, input: &UnitInput<'_>, volume_path: &Path) -> Result<Reconstruction, CollaboratorError> {
        let job = serde_json::to_vec(&UnitJob { input, volume_path })
            .map_err(|error| CollaboratorError::Output(error.to_string()))?;

        debug!(
            exec = ?self.config.exec,
            params = %self.config.params.iter().join(" "),
            "Spawning reconstructor"
        );
        let child = Command::new(&self.config.exec)
            .args(self.config.params.iter())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // progress output of long reconstructions ends up in the batch log
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| CollaboratorError::Spawn {
                exec: self.config.exec.clone(),
                source,
            })?;

        let output = wait_for(child, &self.config.exec, self.config.timeout(), &job)?;
        let reply: ReconstructorReply = serde_yaml::from_str(&output)?;

        let [slices, rows, columns] = reply.shape;
        if slices != input.slices.len() as usize {
            return Err(CollaboratorError::Output(format!(
                "expected {} slices, reconstructor returned {slices}",
                input.slices.len()
            )));
        }

        let bytes = fs::read(volume_path)?;
        let expected = slices * rows * columns * 4;
        if bytes.len() != expected {
            return Err(CollaboratorError::Output(format!(
                "volume file holds {} bytes, shape {:?} needs {expected}",
                bytes.len(),
                reply.shape
            )));
        }

        let voxels = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        let volume = Array3::from_shape_vec((slices, rows, columns), voxels)
            .map_err(|error| CollaboratorError::Output(error.to_string()))?;

        Ok(Reconstruction {
            volume,
            metadata: reply.metadata,
        })
    }
}

impl Reconstructor for ExecReconstructor {
    #[tracing::instrument(level = "debug", skip(self, input), fields(slices = %input.slices))]
    fn reconstruct(&self, input: &UnitInput<'_>) -> Result<Reconstruction, CollaboratorError> {
        let volume_path = self.scratch_path(input);
        let result = self.run(input, &volume_path);

        if volume_path.exists() {
            if let Err(error) = fs::remove_file(&volume_path) {
                warn!(error = ?error, path = ?volume_path, "Failed to remove scratch volume");
            }
        }

        result
    }
}

impl ExecCorDetector {
    pub fn new(config: ExecConfig) -> Self {
        Self { config }
    }
}

impl CorDetector for ExecCorDetector {
    #[tracing::instrument(level = "debug", skip(self))]
    fn detect(&self, data_path: &Path) -> Result<f64, CollaboratorError> {
        let child = Command::new(&self.config.exec)
            .args(self.config.params.iter())
            .arg(data_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| CollaboratorError::Spawn {
                exec: self.config.exec.clone(),
                source,
            })?;

        let output = wait_for(child, &self.config.exec, self.config.timeout(), &[])?;

        match output.trim().parse::<f64>() {
            Ok(cor) if cor.is_finite() => Ok(cor),
            Ok(cor) => Err(CollaboratorError::Output(format!(
                "center of rotation must be finite, got {cor}"
            ))),
            Err(error) => Err(CollaboratorError::Output(format!(
                "failed to parse center of rotation {:?}: {error}",
                output.trim()
            ))),
        }
    }
}
