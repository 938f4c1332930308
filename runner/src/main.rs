use clap::{Args, Parser, Subcommand};
use std::{
    env, fs, io,
    path::{Path, PathBuf},
    process::ExitCode,
};
use thiserror::Error;
use tomobatch_runner::{
    codec::{self, CodecError},
    collaborators::{ExecCorDetector, ExecReconstructor, RawStackWriter, SystemProbe},
    config::{ConfigErrors, RunnerConfig},
    job::{JobRunner, Role, RunError},
    request::{ReconstructionRequest, RequestError},
    script::{Host, ScriptBuilder, ScriptError},
    service::{ServiceError, SubmissionService},
    tracker::{
        ApiError, Credentials, JobStatus, PollPolicy, RemoteJob, SuperfacilityClient, Tracker,
        TrackerError,
    },
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("Failed to read request file {path:?}: {source}")]
    ReadRequest { path: PathBuf, source: io::Error },
    #[error("Request is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid request: {0}")]
    Request(#[from] RequestError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("Failed to set up the API client: {0}")]
    Api(#[from] ApiError),
    #[error("No `{0}` configured")]
    MissingCollaborator(&'static str),
    #[error("No API token given, pass --token or set SFAPI_TOKEN")]
    MissingToken,
    #[error("No user configured and USER is unset")]
    UnknownUser,
    #[error("Job {0} failed")]
    JobFailed(String),
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
/// Build, submit and run tomographic reconstruction batch jobs
struct Cli {
    /// Runner config, defaults are used if the file does not exist
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "TOMOBATCH_CONFIG",
        default_value = "tomobatch.yaml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct TokenArgs {
    /// Bearer token for the compute API
    #[arg(long, env = "SFAPI_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

impl TokenArgs {
    fn credentials(self) -> Result<Credentials, CliError> {
        self.token
            .filter(|token| !token.trim().is_empty())
            .map(Credentials::new)
            .ok_or(CliError::MissingToken)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Reconstruct an encoded request, the entry point of every batch script
    Run {
        #[arg(value_name = "ENCODED", allow_hyphen_values = true)]
        encoded: String,

        /// Run all ranks of a rank partitioned request on a local thread pool
        #[arg(long, value_name = "N")]
        local_ranks: Option<u32>,
    },
    /// Build and persist the batch script of a request, prints the script path
    Build {
        #[arg(value_name = "REQUEST_FILE")]
        request: PathBuf,

        /// Target host, overrides config and environment
        #[arg(long)]
        host: Option<Host>,
    },
    /// Build, persist and submit the batch script of a request, prints the job id
    Submit {
        #[arg(value_name = "REQUEST_FILE")]
        request: PathBuf,

        /// Target host, overrides config and environment
        #[arg(long)]
        host: Option<Host>,

        #[command(flatten)]
        token: TokenArgs,

        /// Poll until the job finished
        #[arg(long)]
        wait: bool,
    },
    /// Query the status of a submitted job once
    Status {
        task_id: String,

        #[command(flatten)]
        token: TokenArgs,
    },
    /// Poll a submitted job until it finished
    Wait {
        task_id: String,

        #[command(flatten)]
        token: TokenArgs,
    },
    /// Print the transport encoding of a request file
    Encode {
        #[arg(value_name = "REQUEST_FILE")]
        request: PathBuf,
    },
    /// Print an encoded request as YAML
    Decode {
        #[arg(value_name = "ENCODED", allow_hyphen_values = true)]
        encoded: String,
    },
}

fn read_request(path: &Path) -> Result<ReconstructionRequest, CliError> {
    let content = fs::read_to_string(path).map_err(|source| CliError::ReadRequest {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(serde_yaml::from_str(&content)?)
}

/// explicit host first, then the config, then the environment probe
fn script_builder<'a>(
    config: &'a RunnerConfig,
    host: Option<Host>,
    detector: Option<&'a ExecCorDetector>,
) -> Result<ScriptBuilder<'a>, CliError> {
    let user = config
        .environment
        .user
        .clone()
        .or_else(|| env::var("USER").ok())
        .filter(|user| !user.is_empty())
        .ok_or(CliError::UnknownUser)?;

    let builder = match host.or(config.environment.host) {
        Some(host) => ScriptBuilder::new(&config.script, host, user),
        None => ScriptBuilder::from_probe(&config.script, &SystemProbe, user)?,
    };

    Ok(match detector {
        Some(detector) => builder.with_detector(detector),
        None => builder,
    })
}

fn finished(job: RemoteJob) -> Result<(), CliError> {
    println!("{} {}", job.job_id, job.status);

    match job.status {
        JobStatus::Failed => Err(CliError::JobFailed(job.job_id)),
        _ => Ok(()),
    }
}

fn run(config: &RunnerConfig, encoded: &str, local_ranks: Option<u32>) -> Result<(), CliError> {
    let request: ReconstructionRequest = codec::decode_str(encoded)?;
    let algorithm = request.validate()?;

    let role = match local_ranks {
        Some(size) => Role::LocalRanks(size),
        None => Role::for_algorithm(algorithm),
    };

    let reconstructor = config
        .reconstructor
        .clone()
        .map(ExecReconstructor::new)
        .ok_or(CliError::MissingCollaborator("reconstructor"))?;
    let detector = config.cor_finder.clone().map(ExecCorDetector::new);
    if detector.is_none() && request.cor().is_none() {
        warn!("Request leaves the center of rotation unset and no cor_finder is configured");
    }

    let probe = SystemProbe;
    let writer = RawStackWriter;
    let mut runner = JobRunner::new(&reconstructor, &writer, &probe, config.partition.chunk_size);
    if let Some(ref detector) = detector {
        runner = runner.with_detector(detector);
    }

    let report = runner.run(&request, role)?;
    info!(
        algorithm = %report.algorithm,
        cor = report.cor,
        units = report.units.len(),
        elapsed = ?report.elapsed,
        "Reconstruction complete"
    );

    Ok(())
}

fn execute(cli: Cli) -> Result<(), CliError> {
    let config = RunnerConfig::load(&cli.config)?;
    config.preflight_checks()?;

    match cli.command {
        Command::Run {
            encoded,
            local_ranks,
        } => run(&config, &encoded, local_ranks),
        Command::Build { request, host } => {
            let request = read_request(&request)?;
            let detector = config.cor_finder.clone().map(ExecCorDetector::new);
            let path = script_builder(&config, host, detector.as_ref())?
                .build(&request)?
                .persist(&request)?;

            println!("{}", path.display());
            Ok(())
        }
        Command::Submit {
            request,
            host,
            token,
            wait,
        } => {
            let credentials = token.credentials()?;
            let request = read_request(&request)?;
            let detector = config.cor_finder.clone().map(ExecCorDetector::new);
            let service = SubmissionService::new(
                script_builder(&config, host, detector.as_ref())?,
                Tracker::new(SuperfacilityClient::new(&config.remote)?),
                PollPolicy::from(&config.remote),
            );

            let job = service.submit(request, &credentials)?;
            if wait {
                finished(service.wait(&job.job_id, &credentials)?)
            } else {
                finished(job)
            }
        }
        Command::Status { task_id, token } => {
            let credentials = token.credentials()?;
            let tracker = Tracker::new(SuperfacilityClient::new(&config.remote)?);

            finished(tracker.poll(&RemoteJob::resume(task_id), &credentials))
        }
        Command::Wait { task_id, token } => {
            let credentials = token.credentials()?;
            let tracker = Tracker::new(SuperfacilityClient::new(&config.remote)?);

            finished(tracker.wait(
                RemoteJob::resume(task_id),
                &credentials,
                PollPolicy::from(&config.remote),
            )?)
        }
        Command::Encode { request } => {
            let request = read_request(&request)?;
            request.validate()?;

            println!("{}", codec::encode(&request)?);
            Ok(())
        }
        Command::Decode { encoded } => {
            let request: ReconstructionRequest = codec::decode_str(&encoded)?;

            print!("{}", serde_yaml::to_string(&request)?);
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    // stdout carries command output, diagnostics go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(error = %error, "Command failed");
            ExitCode::FAILURE
        }
    }
}
