//! Batch side of a request: resolve missing parameters, partition the slice
//! range and reconstruct unit by unit, persisting each unit before the next.

use crate::{
    collaborators::{
        CollaboratorError, CorDetector, EnvironmentProbe, Reconstructor, StackWriter, UnitInput,
    },
    partition::{PartitionError, Partitioner, WorkUnit, WorkUnits},
    request::{Algorithm, ReconstructionRequest, RequestError},
};
use ndarray::Axis;
use rayon::{prelude::*, ThreadPoolBuilder};
use std::{
    fmt, fs, io,
    path::PathBuf,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// rank/size variable pairs exported by the launchers we know, checked in order
const RANK_VARIABLES: [(&str, &str); 3] = [
    ("OMPI_COMM_WORLD_RANK", "OMPI_COMM_WORLD_SIZE"),
    ("PMI_RANK", "PMI_SIZE"),
    ("SLURM_PROCID", "SLURM_NTASKS"),
];

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Invalid request: {0}")]
    Request(#[from] RequestError),
    #[error("Invalid partitioning: {0}")]
    Partition(#[from] PartitionError),
    #[error("A {role} cannot run a {algorithm} request")]
    RoleMismatch { role: Role, algorithm: Algorithm },
    #[error("Center of rotation is unset and no detector is configured")]
    NoCorDetector,
    #[error("Failed to detect center of rotation: {0}")]
    CorDetection(#[source] CollaboratorError),
    #[error("Failed to reconstruct {unit}: {source}")]
    Unit {
        unit: WorkUnit,
        source: CollaboratorError,
    },
    #[error("Failed to persist {unit}: {source}")]
    Persist {
        unit: WorkUnit,
        source: CollaboratorError,
    },
    #[error("Failed to create output directory {path:?}: {source}")]
    OutputDirectory { path: PathBuf, source: io::Error },
    #[error("Failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Which share of the work this process is responsible for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// sole controller iterating all chunks in order
    Controller,
    /// one of `size` independent processes
    Rank { rank: u32, size: u32 },
    /// all `size` ranks on a local thread pool, for runs without a launcher
    LocalRanks(u32),
}

impl Role {
    /// role of a process started by the batch script for `algorithm`
    pub fn for_algorithm(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Astra => Self::Controller,
            Algorithm::Svmbir => Self::from_env(),
        }
    }

    /// rank and size as exported by the process launcher, a single rank otherwise
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        for (rank_variable, size_variable) in RANK_VARIABLES {
            let rank = lookup(rank_variable).and_then(|value| value.trim().parse().ok());
            let size = lookup(size_variable).and_then(|value| value.trim().parse().ok());

            if let (Some(rank), Some(size)) = (rank, size) {
                debug!(rank, size, source = rank_variable, "Detected rank from launcher");

                return Self::Rank { rank, size };
            }
        }

        warn!("No launcher rank found in environment, running as single rank");
        Self::Rank { rank: 0, size: 1 }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Controller => f.write_str("chunk controller"),
            Self::Rank { rank, size } => write!(f, "rank {rank} of {size}"),
            Self::LocalRanks(size) => write!(f, "local pool of {size} ranks"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnitReport {
    pub unit: WorkUnit,
    pub rank: Option<u32>,
    pub files: usize,
    pub elapsed: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunReport {
    pub algorithm: Algorithm,
    pub cor: f64,
    pub use_accelerator: bool,
    pub units: Vec<UnitReport>,
    pub elapsed: Duration,
}

/// Per run values shared by every unit
struct UnitContext<'a> {
    request: &'a ReconstructionRequest,
    algorithm: Algorithm,
    cor: f64,
    use_accelerator: bool,
    prefix: PathBuf,
}

impl<'a> UnitContext<'a> {
    fn input(&self, unit: WorkUnit) -> UnitInput<'a> {
        let data = &self.request.data;

        UnitInput {
            algorithm: self.algorithm,
            data_path: &data.data_path,
            angles: data.angles_ind.as_ref(),
            slices: unit.slices(),
            cor: self.cor,
            downsample: data.proj_downsample,
            filter_cutoff: match self.algorithm {
                Algorithm::Astra => self.request.recon.as_ref().map(|recon| recon.fc),
                Algorithm::Svmbir => None,
            },
            options: match self.algorithm {
                Algorithm::Astra => None,
                Algorithm::Svmbir => self
                    .request
                    .svmbir_settings
                    .as_ref()
                    .map(|settings| &settings.options),
            },
            preprocess: &self.request.preprocess,
            postprocess: &self.request.postprocess,
            use_accelerator: self.use_accelerator,
        }
    }
}

/// reconstruct and persist `units` strictly in order, stopping at the first failure
fn process_units<R, W>(
    reconstructor: &R,
    writer: &W,
    context: &UnitContext<'_>,
    units: WorkUnits,
    rank: Option<u32>,
) -> Result<Vec<UnitReport>, RunError>
where
    R: Reconstructor + ?Sized,
    W: StackWriter + ?Sized,
{
    let total = units.len();
    let mut reports = Vec::with_capacity(total);

    for (position, unit) in units.enumerate() {
        info!(unit = %unit, rank = ?rank, "Starting reconstruction ({}/{total})", position + 1);
        let start = Instant::now();

        let reconstruction = reconstructor
            .reconstruct(&context.input(unit))
            .and_then(|reconstruction| {
                let slices = reconstruction.volume.len_of(Axis(0));

                if slices == unit.slices().len() as usize {
                    Ok(reconstruction)
                } else {
                    Err(CollaboratorError::Output(format!(
                        "expected {} slices, got {slices}",
                        unit.slices().len()
                    )))
                }
            })
            .map_err(|source| {
                error!(unit = %unit, error = %source, "Reconstruction failed, aborting run");

                RunError::Unit { unit, source }
            })?;

        let files = writer
            .write_stack(&reconstruction.volume, &context.prefix, unit.first())
            .map_err(|source| {
                error!(unit = %unit, error = %source, "Failed to persist unit, aborting run");

                RunError::Persist { unit, source }
            })?;

        let elapsed = start.elapsed();
        info!(
            unit = %unit,
            rank = ?rank,
            files = files.len(),
            elapsed = ?elapsed,
            "Finished reconstruction"
        );

        reports.push(UnitReport {
            unit,
            rank,
            files: files.len(),
            elapsed,
        });
    }

    Ok(reports)
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| String::from("<unknown host>"))
}

/// Drives the reconstruction of one decoded request
pub struct JobRunner<'a, R: ?Sized, W: ?Sized> {
    reconstructor: &'a R,
    writer: &'a W,
    detector: Option<&'a dyn CorDetector>,
    probe: &'a dyn EnvironmentProbe,
    chunk_size: u32,
}

impl<'a, R, W> JobRunner<'a, R, W>
where
    R: Reconstructor + Sync + ?Sized,
    W: StackWriter + Sync + ?Sized,
{
    pub fn new(
        reconstructor: &'a R,
        writer: &'a W,
        probe: &'a dyn EnvironmentProbe,
        chunk_size: u32,
    ) -> Self {
        Self {
            reconstructor,
            writer,
            detector: None,
            probe,
            chunk_size,
        }
    }

    pub fn with_detector(mut self, detector: &'a dyn CorDetector) -> Self {
        self.detector = Some(detector);
        self
    }

    /// the configured COR, or a single detection for the whole request
    fn resolve_cor(&self, request: &ReconstructionRequest) -> Result<f64, RunError> {
        if let Some(cor) = request.cor() {
            return Ok(cor);
        }

        let detector = self.detector.ok_or(RunError::NoCorDetector)?;
        let start = Instant::now();
        let cor = detector
            .detect(&request.data.data_path)
            .map_err(RunError::CorDetection)?;

        info!(cor, elapsed = ?start.elapsed(), "Detected center of rotation");

        Ok(cor)
    }

    /// Run every unit `role` is responsible for.
    ///
    /// Any unit failure aborts the run; units finished before it stay on disk
    /// and the rest can be re-run from scratch.
    ///
    /// A missing COR is detected once per call. Separately launched rank
    /// processes each call `run`, so they only share one detection when the
    /// script builder resolved the COR into the encoded request.
    #[instrument(skip_all, fields(name = %request.data.name, role = %role))]
    pub fn run(&self, request: &ReconstructionRequest, role: Role) -> Result<RunReport, RunError> {
        let start = Instant::now();
        let algorithm = request.validate()?;

        let partitioner = match (algorithm, role) {
            (Algorithm::Astra, Role::Controller) => Partitioner::chunked(self.chunk_size)?,
            (Algorithm::Svmbir, Role::Rank { rank, size }) => Partitioner::ranked(rank, size)?,
            (Algorithm::Svmbir, Role::LocalRanks(size)) => Partitioner::ranked(0, size)?,
            (algorithm, role) => return Err(RunError::RoleMismatch { role, algorithm }),
        };

        let use_accelerator = self.probe.has_accelerator();
        info!(
            algorithm = %algorithm,
            host = %hostname(),
            use_accelerator,
            slices = %request.slices(),
            "Starting run"
        );

        let cor = self.resolve_cor(request)?;

        let output_dir = request.output_dir();
        fs::create_dir_all(&output_dir).map_err(|source| RunError::OutputDirectory {
            path: output_dir.clone(),
            source,
        })?;

        let context = UnitContext {
            request,
            algorithm,
            cor,
            use_accelerator,
            prefix: request.output_prefix(),
        };
        let range = request.slices();

        if range.is_empty() {
            warn!(slices = %range, "Empty slice range, nothing to reconstruct");
        }

        let units = match (partitioner, role) {
            (Partitioner::Ranked { size, .. }, Role::LocalRanks(_)) => {
                let pool = ThreadPoolBuilder::new().num_threads(size as usize).build()?;
                let (reconstructor, writer) = (self.reconstructor, self.writer);
                let context = &context;

                let per_rank = pool.install(|| {
                    (0..size)
                        .into_par_iter()
                        .map(|rank| {
                            let units = Partitioner::ranked(rank, size)?.units(range);

                            process_units(reconstructor, writer, context, units, Some(rank))
                        })
                        .collect::<Result<Vec<_>, RunError>>()
                })?;

                per_rank.into_iter().flatten().collect()
            }
            (Partitioner::Ranked { rank, .. }, _) => process_units(
                self.reconstructor,
                self.writer,
                &context,
                partitioner.units(range),
                Some(rank),
            )?,
            (Partitioner::Chunked { .. }, _) => process_units(
                self.reconstructor,
                self.writer,
                &context,
                partitioner.units(range),
                None,
            )?,
        };

        let elapsed = start.elapsed();
        info!(units = units.len(), elapsed = ?elapsed, "Finished run");

        Ok(RunReport {
            algorithm,
            cor,
            use_accelerator,
            units,
            elapsed,
        })
    }
}

#[cfg(test)]
mod job_test;
