use super::{JobRunner, Role, RunError};
use crate::{
    collaborators::{
        CollaboratorError, CorDetector, RawStackWriter, Reconstruction, Reconstructor,
        StaticProbe, UnitInput,
    },
    partition::{SliceRange, WorkUnit},
    request::{
        Algorithm, DataSettings, FbpSettings, IterativeSettings, ReconstructionRequest,
    },
};
use ndarray::Array3;
use parking_lot::Mutex;
use serde_json::json;
use std::{
    collections::BTreeMap,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq)]
struct Call {
    slices: SliceRange,
    cor: f64,
    filter_cutoff: Option<f64>,
    has_options: bool,
    use_accelerator: bool,
}

#[derive(Default)]
struct FakeReconstructor {
    calls: Mutex<Vec<Call>>,
    fail_at: Option<u32>,
    short_by_one: bool,
}

impl Reconstructor for FakeReconstructor {
    fn reconstruct(&self, input: &UnitInput<'_>) -> Result<Reconstruction, CollaboratorError> {
        self.calls.lock().push(Call {
            slices: input.slices,
            cor: input.cor,
            filter_cutoff: input.filter_cutoff,
            has_options: input.options.is_some(),
            use_accelerator: input.use_accelerator,
        });

        if self.fail_at == Some(input.slices.start) {
            return Err(CollaboratorError::Output(String::from("out of memory")));
        }

        let slices = input.slices.len() as usize - usize::from(self.short_by_one);

        Ok(Reconstruction {
            volume: Array3::from_elem((slices, 2, 2), input.slices.start as f32),
            metadata: BTreeMap::new(),
        })
    }
}

struct CountingDetector {
    calls: AtomicUsize,
    cor: f64,
}

impl CorDetector for CountingDetector {
    fn detect(&self, _data_path: &Path) -> Result<f64, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        Ok(self.cor)
    }
}

fn detector() -> CountingDetector {
    CountingDetector {
        calls: AtomicUsize::new(0),
        cor: 1234.5,
    }
}

fn astra_request(output: &Path, cor: Option<f64>) -> ReconstructionRequest {
    ReconstructionRequest {
        data: DataSettings {
            data_path: "/global/raw/sample.h5".into(),
            name: String::from("sample"),
            output_path: output.to_path_buf(),
            start_slice: 0,
            stop_slice: 120,
            angles_ind: None,
            proj_downsample: 2,
        },
        recon: Some(FbpSettings { cor, fc: 0.8 }),
        svmbir_settings: None,
        preprocess: Vec::new(),
        postprocess: Vec::new(),
    }
}

fn svmbir_request(output: &Path) -> ReconstructionRequest {
    let mut request = astra_request(output, None);
    request.recon = None;
    request.data.stop_slice = 10;
    request.svmbir_settings = Some(IterativeSettings {
        cor: Some(1100.0),
        options: serde_json::from_value(json!({ "sharpness": 1.5 })).unwrap(),
    });

    request
}

fn written(output: &Path) -> Vec<u32> {
    let mut indices: Vec<u32> = std::fs::read_dir(output.join("sample"))
        .unwrap()
        .map(|entry| {
            let name = entry.unwrap().file_name().into_string().unwrap();
            name["sample_".len()..name.len() - ".raw".len()].parse().unwrap()
        })
        .collect();
    indices.sort_unstable();

    indices
}

#[test]
pub fn detects_cor_once_for_all_chunks() {
    let dir = TempDir::new().unwrap();
    let reconstructor = FakeReconstructor::default();
    let detector = detector();
    let probe = StaticProbe {
        host: None,
        accelerator: true,
    };
    let runner = JobRunner::new(&reconstructor, &RawStackWriter, &probe, 50).with_detector(&detector);

    let report = runner
        .run(&astra_request(dir.path(), None), Role::Controller)
        .unwrap();

    assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.cor, 1234.5);
    assert!(report.use_accelerator);

    let calls = reconstructor.calls.lock();
    assert_eq!(
        calls.iter().map(|call| call.slices).collect::<Vec<_>>(),
        vec![
            SliceRange::new(0, 50),
            SliceRange::new(50, 100),
            SliceRange::new(100, 120)
        ]
    );
    assert!(calls
        .iter()
        .all(|call| call.cor == 1234.5 && call.filter_cutoff == Some(0.8) && call.use_accelerator));
    assert_eq!(
        report.units.iter().map(|unit| unit.files).collect::<Vec<_>>(),
        vec![50, 50, 20]
    );
    assert_eq!(written(dir.path()), (0..120).collect::<Vec<_>>());
}

#[test]
pub fn configured_cor_skips_detection() {
    let dir = TempDir::new().unwrap();
    let reconstructor = FakeReconstructor::default();
    let detector = detector();
    let probe = StaticProbe::default();
    let runner = JobRunner::new(&reconstructor, &RawStackWriter, &probe, 50).with_detector(&detector);

    let report = runner
        .run(&astra_request(dir.path(), Some(1280.0)), Role::Controller)
        .unwrap();

    assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
    assert_eq!(report.cor, 1280.0);
    assert!(!report.use_accelerator);
}

#[test]
pub fn missing_detector_is_an_error() {
    let dir = TempDir::new().unwrap();
    let reconstructor = FakeReconstructor::default();
    let probe = StaticProbe::default();
    let runner = JobRunner::new(&reconstructor, &RawStackWriter, &probe, 50);

    assert!(matches!(
        runner.run(&astra_request(dir.path(), None), Role::Controller),
        Err(RunError::NoCorDetector)
    ));
    assert!(reconstructor.calls.lock().is_empty());
}

#[test]
pub fn unit_failure_aborts_and_keeps_finished_units() {
    let dir = TempDir::new().unwrap();
    let reconstructor = FakeReconstructor {
        fail_at: Some(50),
        ..FakeReconstructor::default()
    };
    let probe = StaticProbe::default();
    let runner = JobRunner::new(&reconstructor, &RawStackWriter, &probe, 50);

    let result = runner.run(&astra_request(dir.path(), Some(1280.0)), Role::Controller);

    assert!(matches!(
        result,
        Err(RunError::Unit { unit: WorkUnit::Chunk(range), .. }) if range == SliceRange::new(50, 100)
    ));
    // the third chunk was never attempted
    assert_eq!(reconstructor.calls.lock().len(), 2);
    assert_eq!(written(dir.path()), (0..50).collect::<Vec<_>>());
}

#[test]
pub fn wrong_slice_count_fails_the_unit() {
    let dir = TempDir::new().unwrap();
    let reconstructor = FakeReconstructor {
        short_by_one: true,
        ..FakeReconstructor::default()
    };
    let probe = StaticProbe::default();
    let runner = JobRunner::new(&reconstructor, &RawStackWriter, &probe, 50);

    assert!(matches!(
        runner.run(&astra_request(dir.path(), Some(1280.0)), Role::Controller),
        Err(RunError::Unit { source: CollaboratorError::Output(_), .. })
    ));
}

#[test]
pub fn rank_processes_only_its_slices() {
    let dir = TempDir::new().unwrap();
    let reconstructor = FakeReconstructor::default();
    let probe = StaticProbe::default();
    let runner = JobRunner::new(&reconstructor, &RawStackWriter, &probe, 50);

    let report = runner
        .run(&svmbir_request(dir.path()), Role::Rank { rank: 1, size: 4 })
        .unwrap();

    assert_eq!(report.algorithm, Algorithm::Svmbir);
    assert_eq!(report.cor, 1100.0);
    assert_eq!(
        report.units.iter().map(|unit| unit.unit).collect::<Vec<_>>(),
        vec![WorkUnit::Slice(1), WorkUnit::Slice(5), WorkUnit::Slice(9)]
    );
    assert!(reconstructor
        .calls
        .lock()
        .iter()
        .all(|call| call.filter_cutoff.is_none() && call.has_options));
    assert_eq!(written(dir.path()), vec![1, 5, 9]);
}

#[test]
pub fn surplus_rank_terminates_cleanly() {
    let dir = TempDir::new().unwrap();
    let reconstructor = FakeReconstructor::default();
    let probe = StaticProbe::default();
    let runner = JobRunner::new(&reconstructor, &RawStackWriter, &probe, 50);

    let report = runner
        .run(&svmbir_request(dir.path()), Role::Rank { rank: 15, size: 16 })
        .unwrap();

    assert!(report.units.is_empty());
}

#[test]
pub fn local_ranks_cover_every_slice() {
    let dir = TempDir::new().unwrap();
    let reconstructor = FakeReconstructor::default();
    let probe = StaticProbe::default();
    let runner = JobRunner::new(&reconstructor, &RawStackWriter, &probe, 50);

    let report = runner
        .run(&svmbir_request(dir.path()), Role::LocalRanks(4))
        .unwrap();

    assert_eq!(report.units.len(), 10);
    assert_eq!(written(dir.path()), (0..10).collect::<Vec<_>>());
}

#[test]
pub fn local_ranks_detect_cor_once() {
    let dir = TempDir::new().unwrap();
    let reconstructor = FakeReconstructor::default();
    let probe = StaticProbe::default();
    let detector = detector();
    let runner = JobRunner::new(&reconstructor, &RawStackWriter, &probe, 50).with_detector(&detector);
    let mut request = svmbir_request(dir.path());
    if let Some(settings) = request.svmbir_settings.as_mut() {
        settings.cor = None;
    }

    let report = runner.run(&request, Role::LocalRanks(4)).unwrap();

    assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.cor, 1234.5);
    assert_eq!(report.units.len(), 10);
}

#[test]
pub fn regimes_never_mix() {
    let dir = TempDir::new().unwrap();
    let reconstructor = FakeReconstructor::default();
    let probe = StaticProbe::default();
    let runner = JobRunner::new(&reconstructor, &RawStackWriter, &probe, 50);

    assert!(matches!(
        runner.run(
            &astra_request(dir.path(), Some(1.0)),
            Role::Rank { rank: 0, size: 2 }
        ),
        Err(RunError::RoleMismatch {
            algorithm: Algorithm::Astra,
            ..
        })
    ));
    assert!(matches!(
        runner.run(&svmbir_request(dir.path()), Role::Controller),
        Err(RunError::RoleMismatch { .. })
    ));
}

#[test]
pub fn empty_range_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let reconstructor = FakeReconstructor::default();
    let probe = StaticProbe::default();
    let runner = JobRunner::new(&reconstructor, &RawStackWriter, &probe, 50);
    let mut request = astra_request(dir.path(), Some(1.0));
    request.data.start_slice = 60;
    request.data.stop_slice = 60;

    let report = runner.run(&request, Role::Controller).unwrap();

    assert!(report.units.is_empty());
    assert!(reconstructor.calls.lock().is_empty());
}

#[test]
pub fn rank_from_launcher_environment() {
    let lookup = |pairs: &'static [(&'static str, &'static str)]| {
        move |name: &str| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    };

    assert_eq!(
        Role::from_lookup(lookup(&[("SLURM_PROCID", "3"), ("SLURM_NTASKS", "8")])),
        Role::Rank { rank: 3, size: 8 }
    );
    assert_eq!(
        Role::from_lookup(lookup(&[
            ("SLURM_PROCID", "3"),
            ("SLURM_NTASKS", "8"),
            ("OMPI_COMM_WORLD_RANK", "5"),
            ("OMPI_COMM_WORLD_SIZE", "6"),
        ])),
        Role::Rank { rank: 5, size: 6 }
    );
    assert_eq!(
        Role::from_lookup(lookup(&[("PMI_RANK", "x"), ("PMI_SIZE", "2")])),
        Role::Rank { rank: 0, size: 1 }
    );
}
