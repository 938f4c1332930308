use super::{check_executable, ConfigErrors, ExecConfig, RunnerConfig};
use crate::{partition::DEFAULT_CHUNK_SIZE, script::Host};
use std::{fs, os::unix::fs::PermissionsExt, path::Path, time::Duration};
use tempfile::TempDir;

fn write_script(dir: &Path, name: &str, mode: u32) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    path
}

#[test]
pub fn missing_file_yields_defaults() {
    let dir = TempDir::new().unwrap();

    let config = RunnerConfig::load(&dir.path().join("absent.yaml")).unwrap();

    assert_eq!(config.partition.chunk_size, DEFAULT_CHUNK_SIZE);
    assert_eq!(config.script.launcher, "srun");
    assert_eq!(config.remote.system, "perlmutter");
    assert_eq!(config.remote.max_attempts, 240);
    assert_eq!(config.remote.poll_interval(), Duration::from_secs(15));
    assert!(config.reconstructor.is_none());
    assert!(config.preflight_checks().is_ok());
}

#[test]
pub fn parses_full_config() {
    let dir = TempDir::new().unwrap();
    let exec = write_script(dir.path(), "recon.sh", 0o755);
    let path = dir.path().join("config.yaml");
    fs::write(
        &path,
        format!(
            r#"
environment:
  host: cori
  user: alice
script:
  runner: tomobatch-runner
partition:
  chunk_size: 20
reconstructor:
  exec: {}
  params: ["--gpu"]
  timeout: 600
remote:
  endpoint: http://localhost:8080/api
  poll_interval: 1
"#,
            exec.display()
        ),
    )
    .unwrap();

    let config = RunnerConfig::load(&path).unwrap();

    assert_eq!(config.environment.host, Some(Host::Cori));
    assert_eq!(config.environment.user.as_deref(), Some("alice"));
    assert_eq!(config.script.runner, "tomobatch-runner");
    assert_eq!(config.script.launcher, "srun");
    assert_eq!(config.partition.chunk_size, 20);
    let reconstructor = config.reconstructor.as_ref().unwrap();
    assert_eq!(reconstructor.params, vec![String::from("--gpu")]);
    assert_eq!(reconstructor.timeout(), Duration::from_secs(600));
    assert_eq!(config.remote.endpoint.host(), Some("localhost"));
    assert_eq!(config.remote.endpoint.port_u16(), Some(8080));
    assert_eq!(config.remote.request_timeout, 30);
    assert!(config.preflight_checks().is_ok());
}

#[test]
pub fn unknown_keys_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.yaml");
    fs::write(&path, "partition:\n  chunk: 10\n").unwrap();

    assert!(matches!(
        RunnerConfig::load(&path),
        Err(ConfigErrors::Parse(_))
    ));
}

#[test]
pub fn zero_values_fail_preflight() {
    let mut config = RunnerConfig::default();
    config.partition.chunk_size = 0;
    assert!(matches!(
        config.preflight_checks(),
        Err(ConfigErrors::Preflight)
    ));

    let mut config = RunnerConfig::default();
    config.remote.max_attempts = 0;
    assert!(matches!(
        config.preflight_checks(),
        Err(ConfigErrors::Preflight)
    ));
}

#[test]
pub fn non_executable_collaborator_fails_preflight() {
    let dir = TempDir::new().unwrap();
    let exec = write_script(dir.path(), "finder.sh", 0o644);

    assert!(!check_executable(&exec).unwrap());
    assert!(matches!(
        check_executable(&dir.path().join("missing")),
        Err(ConfigErrors::FileNotFound(_))
    ));

    let config = RunnerConfig {
        cor_finder: Some(ExecConfig {
            exec,
            params: Vec::new(),
            timeout: 60,
        }),
        ..RunnerConfig::default()
    };
    assert!(matches!(
        config.preflight_checks(),
        Err(ConfigErrors::Preflight)
    ));
}
