use std::path::PathBuf;

use thiserror::Error;

/// Why a single file could not become a [`crate::reader::DicomInstance`].
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("not a DICOM file: {0:?}")]
    NotDicom(PathBuf),

    #[error("corrupt DICOM header in {path:?}: {reason}")]
    CorruptHeader { path: PathBuf, reason: String },

    #[error("unsupported transfer syntax {uid} in {path:?}")]
    UnsupportedTransferSyntax { path: PathBuf, uid: String },

    #[error("no usable Modality in {0:?}")]
    MissingModality(PathBuf),

    #[error("cannot read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Invalid command line or unreadable run inputs. Always fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("input directory '{0}' does not exist")]
    MissingInput(PathBuf),

    #[error("'--tol' option can only be used when '--group' is set")]
    ToleranceWithoutGroup,

    #[error("tolerance must be a finite number of seconds >= 0, got {0}")]
    InvalidTolerance(f64),

    #[error("'--mapping' x '--keep p': are mutually excluding options")]
    MappingWithKeptKey,

    #[error("can't use reserved CSV file name: {0}")]
    ReservedMapping(String),

    #[error("unknown '--keep' flag '{0}' (expected any of p, n, d, D, g)")]
    UnknownKeepFlag(char),

    #[error("'--n_jobs' must be at least 1")]
    NoWorkers,

    #[error("'--reset' would delete {0:?}, which is inside the output directory")]
    ResetWouldDelete(PathBuf),

    #[error("cannot load mapping {path:?}: {reason}")]
    Mapping { path: PathBuf, reason: String },

    #[error("cannot load modality rules {path:?}: {reason}")]
    Rules { path: PathBuf, reason: String },
}

/// Failure of one folder's pipeline. Recorded by the orchestrator, never
/// propagated to sibling folders.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Read(#[from] ReadError),

    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot encode image {path:?}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("metadata serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("mapping CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("output directory race on {0:?} could not be resolved")]
    Concurrency(PathBuf),

    #[error("no usable DICOM instance in {0:?}")]
    EmptyFolder(PathBuf),

    #[error("cannot start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("invalid folder state transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Aggregate outcome of a batch in which some folders failed.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("{failed} of {total} DICOM folders failed")]
    PartialFailure { failed: usize, total: usize },
}
