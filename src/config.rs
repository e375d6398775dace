//! Validated, immutable run configuration.

use std::path::{Path, PathBuf};

use crate::anonymize::{KeepFlags, PatientMapping, RESERVED_CSV};
use crate::error::ConfigError;
use crate::extract::ImageFormat;
use crate::grouping::{DEFAULT_TOLERANCE, GroupingPolicy};
use crate::modality::Classifier;

/// Raw option values as they arrive from the command line.
#[derive(Clone, Debug)]
pub struct RunArgs {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub image_format: ImageFormat,
    pub group: bool,
    pub tolerance: Option<f64>,
    pub n_jobs: usize,
    pub mapping: Option<PathBuf>,
    pub keep: String,
    pub overwrite: bool,
    pub reset: bool,
    pub quiet: bool,
    pub rules: Option<PathBuf>,
}

impl RunArgs {
    /// Defaults of the command line for `input_dir`.
    pub fn new(input_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: PathBuf::from("exported_data"),
            image_format: ImageFormat::Png,
            group: false,
            tolerance: None,
            n_jobs: 1,
            mapping: None,
            keep: String::new(),
            overwrite: false,
            reset: false,
            quiet: false,
            rules: None,
        }
    }
}

#[derive(Debug)]
pub struct RunConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub image_format: ImageFormat,
    pub grouping: GroupingPolicy,
    pub n_jobs: usize,
    pub keep: KeepFlags,
    /// The mapping file the run was started with, if any.
    pub mapping_file: Option<PathBuf>,
    pub mapping: PatientMapping,
    pub classifier: Classifier,
    pub overwrite: bool,
    pub reset: bool,
    pub quiet: bool,
}

fn is_reserved(path: &Path) -> bool {
    path.file_name().is_some_and(|name| name == RESERVED_CSV)
}

/// Absolute form of `path`, with symlinks resolved when it exists.
fn resolved(path: &Path) -> PathBuf {
    path.canonicalize()
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// `--reset` empties the output directory, so nothing the run reads may
/// live inside it.
fn check_reset(args: &RunArgs) -> Result<(), ConfigError> {
    let output = resolved(&args.output_dir);
    let inputs = [Some(&args.input_dir), args.mapping.as_ref(), args.rules.as_ref()];
    match inputs.into_iter().flatten().find(|path| resolved(path).starts_with(&output)) {
        Some(path) => Err(ConfigError::ResetWouldDelete(path.clone())),
        None => Ok(()),
    }
}

impl RunConfig {
    pub fn from_args(args: RunArgs) -> Result<Self, ConfigError> {
        if !args.input_dir.is_dir() {
            return Err(ConfigError::MissingInput(args.input_dir));
        }
        if args.n_jobs == 0 {
            return Err(ConfigError::NoWorkers);
        }

        let grouping = match (args.group, args.tolerance) {
            (false, Some(_)) => return Err(ConfigError::ToleranceWithoutGroup),
            (false, None) => GroupingPolicy::ByFolder,
            (true, tolerance) => {
                let tolerance = tolerance.unwrap_or(DEFAULT_TOLERANCE);
                if !tolerance.is_finite() || tolerance < 0.0 {
                    return Err(ConfigError::InvalidTolerance(tolerance));
                }
                GroupingPolicy::ByTime { tolerance }
            }
        };

        if args.reset {
            check_reset(&args)?;
        }

        let keep = KeepFlags::parse(&args.keep)?;
        let mapping = match &args.mapping {
            Some(_) if keep.patient_key => return Err(ConfigError::MappingWithKeptKey),
            Some(path) if is_reserved(path) => {
                return Err(ConfigError::ReservedMapping(RESERVED_CSV.to_string()));
            }
            Some(path) => PatientMapping::load(path)?,
            None => PatientMapping::new(),
        };

        let classifier = match &args.rules {
            Some(path) => Classifier::from_rules_file(path)?,
            None => Classifier::default(),
        };

        Ok(Self {
            input_dir: args.input_dir,
            output_dir: args.output_dir,
            image_format: args.image_format,
            grouping,
            n_jobs: args.n_jobs,
            keep,
            mapping_file: args.mapping,
            mapping,
            classifier,
            overwrite: args.overwrite,
            reset: args.reset,
            quiet: args.quiet,
        })
    }

    /// Where the generated patient mapping is saved.
    pub fn reserved_csv(&self) -> PathBuf {
        self.output_dir.join(RESERVED_CSV)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn args(dir: &Path) -> RunArgs {
        RunArgs::new(dir)
    }

    #[test]
    fn defaults_group_by_folder() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig::from_args(args(dir.path())).unwrap();
        assert_eq!(config.grouping, GroupingPolicy::ByFolder);
        assert_eq!(config.n_jobs, 1);
        assert_eq!(config.image_format, ImageFormat::Png);
        assert!(config.mapping.is_empty());
        assert_eq!(config.reserved_csv(), PathBuf::from("exported_data").join(RESERVED_CSV));
    }

    #[test]
    fn group_uses_default_tolerance() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = args(dir.path());
        a.group = true;
        let config = RunConfig::from_args(a.clone()).unwrap();
        assert_eq!(config.grouping, GroupingPolicy::ByTime { tolerance: DEFAULT_TOLERANCE });

        a.tolerance = Some(0.0);
        let config = RunConfig::from_args(a).unwrap();
        assert_eq!(config.grouping, GroupingPolicy::ByTime { tolerance: 0.0 });
    }

    #[test]
    fn rejects_invalid_options() {
        let dir = tempfile::tempdir().unwrap();

        let missing = RunArgs::new(dir.path().join("nope"));
        assert!(matches!(RunConfig::from_args(missing), Err(ConfigError::MissingInput(_))));

        let mut a = args(dir.path());
        a.tolerance = Some(3.0);
        assert!(matches!(RunConfig::from_args(a), Err(ConfigError::ToleranceWithoutGroup)));

        let mut a = args(dir.path());
        a.group = true;
        a.tolerance = Some(-1.0);
        assert!(matches!(RunConfig::from_args(a.clone()), Err(ConfigError::InvalidTolerance(_))));
        a.tolerance = Some(f64::NAN);
        assert!(matches!(RunConfig::from_args(a), Err(ConfigError::InvalidTolerance(_))));

        let mut a = args(dir.path());
        a.n_jobs = 0;
        assert!(matches!(RunConfig::from_args(a), Err(ConfigError::NoWorkers)));

        let mut a = args(dir.path());
        a.keep = "pz".into();
        assert!(matches!(RunConfig::from_args(a), Err(ConfigError::UnknownKeepFlag('z'))));
    }

    #[test]
    fn mapping_rules() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("map.csv");
        fs::write(&csv, "patient_id,study_id\nP1,42\n").unwrap();

        let mut a = args(dir.path());
        a.mapping = Some(csv.clone());
        let config = RunConfig::from_args(a.clone()).unwrap();
        assert_eq!(config.mapping.study_id_for("P1"), "42");
        assert_eq!(config.mapping_file, Some(csv));

        a.keep = "p".into();
        assert!(matches!(RunConfig::from_args(a), Err(ConfigError::MappingWithKeptKey)));

        let mut a = args(dir.path());
        a.mapping = Some(dir.path().join(RESERVED_CSV));
        assert!(matches!(RunConfig::from_args(a), Err(ConfigError::ReservedMapping(_))));

        let mut a = args(dir.path());
        a.mapping = Some(dir.path().join("absent.csv"));
        assert!(matches!(RunConfig::from_args(a), Err(ConfigError::Mapping { .. })));
    }

    #[test]
    fn reset_never_covers_run_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let input = out.join("in");
        fs::create_dir_all(&input).unwrap();
        let csv = out.join("map.csv");
        fs::write(&csv, "patient_id,study_id\n").unwrap();
        let rejected = |a: RunArgs| match RunConfig::from_args(a) {
            Err(ConfigError::ResetWouldDelete(path)) => Some(path),
            _ => None,
        };

        let mut a = args(&input);
        a.output_dir = out.clone();
        assert!(RunConfig::from_args(a.clone()).is_ok());
        a.reset = true;
        assert_eq!(rejected(a.clone()), Some(input.clone()));

        a.output_dir = input.clone();
        assert_eq!(rejected(a.clone()), Some(input.clone()));

        // output nested in the input is fine
        a.output_dir = input.join("exported");
        assert!(RunConfig::from_args(a.clone()).is_ok());

        let elsewhere = dir.path().join("elsewhere");
        fs::create_dir_all(&elsewhere).unwrap();
        let mut a = args(&elsewhere);
        a.output_dir = out.clone();
        a.reset = true;
        a.mapping = Some(csv.clone());
        assert_eq!(rejected(a.clone()), Some(csv));
        a.mapping = None;
        assert!(RunConfig::from_args(a).is_ok());
    }

    #[test]
    fn unreadable_rules_are_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let rules = dir.path().join("rules.json");
        fs::write(&rules, "{not json").unwrap();
        let mut a = args(dir.path());
        a.rules = Some(rules);
        assert!(matches!(RunConfig::from_args(a), Err(ConfigError::Rules { .. })));
    }
}
