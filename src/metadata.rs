//! The `metadata.json` document written next to each group's images.
//!
//! Building is pure: the same group, anonymized patient and extraction
//! report always serialize to the same bytes. Field order follows the
//! struct declarations.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use tracing::warn;

use crate::anonymize::AnonymizedPatient;
use crate::error::PipelineError;
use crate::extract::ExtractReport;
use crate::grouping::{AcquisitionGroup, TaggedInstance};
use crate::modality::{DeviceTags, Modality};

pub const METADATA_FILE: &str = "metadata.json";

/// Version of the metadata layout consumed downstream.
pub const PARSER_VERSION: [u32; 3] = [1, 5, 2];

const VOLUME_PROTOCOL: &str = "OCT ART Volume";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Serialize)]
pub struct Metadata {
    pub patient: AnonymizedPatient,
    pub exam: Exam,
    pub series: Series,
    pub group: GroupInfo,
    pub images: Images,
    pub parser_version: [u32; 3],
    pub tool_version: String,
}

#[derive(Debug, Serialize)]
pub struct Exam {
    pub manufacturer: Option<String>,
    pub scan_datetime: Option<String>,
    pub scanner_model: Option<String>,
    pub scanner_serial_number: Option<String>,
    pub scanner_software_version: Option<String>,
    pub scanner_last_calibration_date: String,
    pub source_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Series {
    pub laterality: Option<String>,
    pub fixation: String,
    pub anterior: bool,
    pub protocol: Option<String>,
    pub source_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GroupInfo {
    pub study_id: String,
    pub group_id: String,
    pub acquisition_datetime: Option<String>,
    pub modalities: Vec<Modality>,
}

#[derive(Debug, Serialize)]
pub struct Images {
    pub images: Vec<ImageEntry>,
}

#[derive(Debug, Serialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct Extent {
    pub width: f64,
    pub height: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<f64>,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct PhotoLocation {
    pub start: Point,
    pub end: Point,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_locations: Option<Vec<PhotoLocation>>,
}

#[derive(Debug, Serialize)]
pub struct ImageEntry {
    pub modality: Modality,
    pub modality_name: &'static str,
    /// Position of the instance inside its group.
    pub group: usize,
    pub size: Size,
    pub field_of_view: Option<f64>,
    pub source_id: String,
    pub source_file: String,
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions_mm: Option<Extent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolutions_mm: Option<Extent>,
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pixel_error: Option<String>,
}

fn first_of<T>(group: &AcquisitionGroup, f: impl Fn(&TaggedInstance) -> Option<T>) -> Option<T> {
    group.members.iter().find_map(|m| f(m))
}

fn first_device_text(
    group: &AcquisitionGroup,
    field: impl Fn(&DeviceTags) -> &String,
) -> Option<String> {
    first_of(group, |m| Some(field(&m.instance.device)).filter(|s| !s.is_empty()).cloned())
}

/// Where an entry's file came from, relative to the input root.
struct SourcePaths<'a> {
    input_root: &'a Path,
    patient_id: &'a str,
    study_id: &'a str,
}

impl SourcePaths<'_> {
    /// `/` separated. Export folders are often named after the patient, so
    /// a component equal to the patient id is written as the study id.
    fn relative(&self, path: &Path) -> String {
        let relative = path.strip_prefix(self.input_root).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .map(|c| if c == self.patient_id { self.study_id.into() } else { c })
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Physical extent and pixel size. 2D images use the top level spacing
/// (zero when absent); OCT volumes add a depth axis from the slice
/// thickness.
fn physical_extent(member: &TaggedInstance) -> (Option<Extent>, Option<Extent>) {
    let instance = &member.instance;
    let (columns, rows) = (f64::from(instance.columns), f64::from(instance.rows));
    if member.modality.is_2d_image() {
        let (row_spacing, column_spacing) = instance.geometry.spacing.unwrap_or((0.0, 0.0));
        let dimensions = Extent {
            width: columns * column_spacing,
            height: rows * row_spacing,
            depth: None,
        };
        let resolutions = Extent {
            width: column_spacing,
            height: row_spacing,
            depth: None,
        };
        return (Some(dimensions), Some(resolutions));
    }
    if member.modality != Modality::Oct {
        return (None, None);
    }
    let Some((row_spacing, column_spacing)) = instance.geometry.spacing else {
        return (None, None);
    };
    let thickness = instance.geometry.slice_thickness.unwrap_or(0.0);
    let frames = f64::from(instance.number_of_frames.saturating_sub(1));
    let dimensions = Extent {
        width: columns * column_spacing,
        height: rows * row_spacing,
        depth: Some(frames * thickness),
    };
    let resolutions = Extent {
        width: column_spacing,
        height: row_spacing,
        depth: Some(thickness),
    };
    (Some(dimensions), Some(resolutions))
}

fn contents(member: &TaggedInstance) -> Vec<Content> {
    if member.modality.is_2d_image() {
        return vec![Content { photo_locations: None }];
    }
    if member.modality != Modality::Oct {
        return Vec::new();
    }
    member
        .instance
        .photo_locations
        .iter()
        .map(|location| {
            let locations = match location {
                // stored as [y0, x0, y1, x1]
                Some([y0, x0, y1, x1]) => vec![PhotoLocation {
                    start: Point { x: *x0, y: *y0 },
                    end: Point { x: *x1, y: *y1 },
                }],
                None => {
                    warn!(file = %member.instance.path.display(), "empty photo_locations");
                    Vec::new()
                }
            };
            Content {
                photo_locations: Some(locations),
            }
        })
        .collect()
}

fn image_entry(
    position: usize,
    member: &TaggedInstance,
    report: &ExtractReport,
    sources: &SourcePaths,
) -> ImageEntry {
    let instance = &member.instance;
    let (dimensions_mm, resolutions_mm) = physical_extent(member);
    ImageEntry {
        modality: member.modality,
        modality_name: member.modality.description(),
        group: position,
        size: Size {
            width: instance.columns,
            height: instance.rows,
        },
        field_of_view: instance.device.field_of_view,
        source_id: format!("{}-{position}", member.modality.code()),
        source_file: sources.relative(&instance.path),
        files: report.files.get(&position).cloned().unwrap_or_default(),
        dimensions_mm,
        resolutions_mm,
        contents: contents(member),
        pixel_error: report.pixel_errors.get(&position).cloned(),
    }
}

/// Assembles the document for one group.
pub fn build_metadata(
    group: &AcquisitionGroup,
    patient: AnonymizedPatient,
    report: &ExtractReport,
    input_root: &Path,
) -> Metadata {
    let modalities = group.modalities();
    let acquisition_datetime = group.acquired.map(|at| at.format(DATETIME_FORMAT).to_string());
    let study_uid = first_of(group, |m| m.instance.study_uid.clone());

    let protocol = if group.members.len() > 1 && modalities.contains(&Modality::Oct) {
        Some(VOLUME_PROTOCOL.to_string())
    } else {
        first_device_text(group, |d| &d.series_description)
    };
    let sources = SourcePaths {
        input_root,
        patient_id: &group.patient_id,
        study_id: &patient.study_id,
    };
    let images = group
        .members
        .iter()
        .enumerate()
        .map(|(position, member)| image_entry(position, member, report, &sources))
        .collect();

    Metadata {
        exam: Exam {
            manufacturer: first_device_text(group, |d| &d.manufacturer),
            scan_datetime: acquisition_datetime.clone(),
            scanner_model: first_device_text(group, |d| &d.model),
            scanner_serial_number: first_of(group, |m| m.instance.serial_number.clone()),
            scanner_software_version: first_of(group, |m| m.instance.software_versions.clone()),
            scanner_last_calibration_date: String::new(),
            source_id: study_uid.clone(),
        },
        series: Series {
            laterality: first_of(group, |m| m.instance.laterality.clone()),
            fixation: first_of(group, |m| m.instance.fixation.clone()).unwrap_or_default(),
            anterior: group.members.iter().any(|m| m.modality.is_anterior()),
            protocol,
            source_id: study_uid,
        },
        group: GroupInfo {
            study_id: patient.study_id.clone(),
            group_id: group.id.clone(),
            acquisition_datetime,
            modalities,
        },
        images: Images { images },
        parser_version: PARSER_VERSION,
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        patient,
    }
}

/// Serializes with a 4-space indent.
pub fn to_json(metadata: &Metadata) -> Result<Vec<u8>, PipelineError> {
    let mut bytes = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut serializer = Serializer::with_formatter(&mut bytes, formatter);
    metadata.serialize(&mut serializer)?;
    Ok(bytes)
}

/// Writes `metadata.json` into `dir`.
pub fn write_metadata(dir: &Path, metadata: &Metadata) -> Result<PathBuf, PipelineError> {
    let path = dir.join(METADATA_FILE);
    let bytes = to_json(metadata)?;
    fs::write(&path, bytes).map_err(|e| PipelineError::io(&path, e))?;
    Ok(path)
}
