//! Batch export of ophthalmic DICOM folders into anonymized images and
//! per-acquisition `metadata.json` documents.

pub mod anonymize;
pub mod batch;
pub mod config;
pub mod error;
pub mod extract;
pub mod grouping;
pub mod metadata;
pub mod modality;
pub mod reader;

pub use batch::{BatchSummary, run};
pub use config::{RunArgs, RunConfig};
pub use error::{BatchError, ConfigError, PipelineError, ReadError};
pub use extract::ImageFormat;
