//! Reading DICOM files into normalized [`DicomInstance`] records, and
//! discovering the folders that hold them.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use dicom_core::Tag;
use dicom_core::value::{AsRange, DicomDateTime, PreciseDateTime};
use dicom_dictionary_std::tags;
use dicom_object::{FileMetaTable, InMemDicomObject, OpenFileOptions};
use dicom_pixeldata::PixelDecoder;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use image::DynamicImage;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::ReadError;
use crate::modality::DeviceTags;

/// Substituted when an instance carries no PatientID.
pub const MISSING_PATIENT: &str = "UNKNOWN_PATIENT";

const HORIZONTAL_FIELD_OF_VIEW: Tag = Tag(0x0022, 0x000C);
const OPHTHALMIC_FRAME_LOCATION_SEQUENCE: Tag = Tag(0x0022, 0x0031);
const REFERENCE_COORDINATES: Tag = Tag(0x0022, 0x0032);
const PIXEL_MEASURES_SEQUENCE: Tag = Tag(0x0028, 0x9110);
const SHARED_FUNCTIONAL_GROUPS_SEQUENCE: Tag = Tag(0x5200, 0x9229);
const PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE: Tag = Tag(0x5200, 0x9230);
const ANATOMIC_REGION_SEQUENCE: Tag = Tag(0x0008, 0x2218);
const CODE_MEANING: Tag = Tag(0x0008, 0x0104);
const IMAGE_LATERALITY: Tag = Tag(0x0020, 0x0062);
const LATERALITY: Tag = Tag(0x0020, 0x0060);

/// Decoded frames of an instance, or why there are none.
#[derive(Clone, Debug, Default)]
pub enum PixelPayload {
    Frames(Vec<DynamicImage>),
    #[default]
    Missing,
    Unusable(String),
}

impl PixelPayload {
    pub fn frames(&self) -> &[DynamicImage] {
        match self {
            PixelPayload::Frames(frames) => frames,
            _ => &[],
        }
    }

    /// Reason the payload cannot be exported, if any.
    pub fn problem(&self) -> Option<String> {
        match self {
            PixelPayload::Frames(frames) if frames.is_empty() => Some("no frames".into()),
            PixelPayload::Frames(_) => None,
            PixelPayload::Missing => Some("no pixel data".into()),
            PixelPayload::Unusable(reason) => Some(reason.clone()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PatientTags {
    pub id: String,
    pub family_name: Option<String>,
    pub given_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub sex: Option<String>,
}

/// Physical pixel sizes, when the header provides them.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PixelGeometry {
    /// (row spacing, column spacing) in mm.
    pub spacing: Option<(f64, f64)>,
    pub slice_thickness: Option<f64>,
}

/// One DICOM file, normalized for the downstream stages.
#[derive(Clone, Debug, Default)]
pub struct DicomInstance {
    pub path: PathBuf,
    /// Position of the file in its folder's natural order.
    pub index: usize,
    pub device: DeviceTags,
    pub patient: PatientTags,
    pub acquired: Option<NaiveDateTime>,
    pub study_uid: Option<String>,
    pub series_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub serial_number: Option<String>,
    pub software_versions: Option<String>,
    pub laterality: Option<String>,
    pub fixation: Option<String>,
    pub rows: u32,
    pub columns: u32,
    pub number_of_frames: u32,
    pub geometry: PixelGeometry,
    /// OCT only: `[y0, x0, y1, x1]` per frame, `None` when a frame has no
    /// location.
    pub photo_locations: Vec<Option<[f64; 4]>>,
    pub pixels: PixelPayload,
}

impl DicomInstance {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn text(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_matches(|c: char| c.is_whitespace() || c == '\0').to_string())
        .filter(|s| !s.is_empty())
}

fn float(obj: &InMemDicomObject, tag: Tag) -> Option<f64> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|e| e.to_float64().ok())
}

fn floats(obj: &InMemDicomObject, tag: Tag) -> Option<Vec<f64>> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|e| e.to_multi_float64().ok())
}

fn int(obj: &InMemDicomObject, tag: Tag) -> Option<u32> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|e| e.to_int::<u32>().ok())
}

fn first_item(obj: &InMemDicomObject, tag: Tag) -> Option<&InMemDicomObject> {
    items(obj, tag).and_then(|items| items.first())
}

fn items(obj: &InMemDicomObject, tag: Tag) -> Option<&[InMemDicomObject]> {
    obj.element_opt(tag).ok().flatten().and_then(|e| e.items())
}

/// Wall-clock time of a DT value. Missing components take their earliest
/// value, so `2024` is midnight on January 1st. A UTC offset is dropped.
fn local_datetime(value: &DicomDateTime) -> Option<NaiveDateTime> {
    match value.earliest().ok()? {
        PreciseDateTime::Naive(dt) => Some(dt),
        PreciseDateTime::TimeZone(dt) => Some(dt.naive_local()),
    }
}

fn date_and_time(obj: &InMemDicomObject, date: Tag, time: Tag) -> Option<NaiveDateTime> {
    let date = obj.element_opt(date).ok().flatten()?.to_date().ok()?.earliest().ok()?;
    let time = obj
        .element_opt(time)
        .ok()
        .flatten()
        .and_then(|e| e.to_time().ok())
        .and_then(|t| t.earliest().ok())
        .unwrap_or_default();
    Some(date.and_time(time))
}

fn acquisition_time(obj: &InMemDicomObject) -> Option<NaiveDateTime> {
    let datetime = obj
        .element_opt(tags::ACQUISITION_DATE_TIME)
        .ok()
        .flatten()
        .and_then(|e| e.to_datetime().ok())
        .and_then(|dt| local_datetime(&dt));
    datetime
        .or_else(|| date_and_time(obj, tags::ACQUISITION_DATE, tags::ACQUISITION_TIME))
        .or_else(|| date_and_time(obj, tags::CONTENT_DATE, tags::CONTENT_TIME))
}

fn patient_tags(obj: &InMemDicomObject) -> PatientTags {
    let name = text(obj, tags::PATIENT_NAME).unwrap_or_default();
    let mut parts = name.split('^').map(str::trim).map(|s| (!s.is_empty()).then(|| s.to_string()));
    PatientTags {
        id: text(obj, tags::PATIENT_ID).unwrap_or_else(|| MISSING_PATIENT.to_string()),
        family_name: parts.next().flatten(),
        given_name: parts.next().flatten(),
        birth_date: obj
            .element_opt(tags::PATIENT_BIRTH_DATE)
            .ok()
            .flatten()
            .and_then(|e| e.to_date().ok())
            .and_then(|d| d.to_naive_date().ok()),
        sex: text(obj, tags::PATIENT_SEX),
    }
}

fn pixel_geometry(obj: &InMemDicomObject, device: &DeviceTags) -> PixelGeometry {
    let spacing_of = |o: &InMemDicomObject| {
        floats(o, tags::PIXEL_SPACING)
            .filter(|v| v.len() >= 2)
            .map(|v| (v[0], v[1]))
    };
    if let Some(spacing) = spacing_of(obj) {
        return PixelGeometry {
            spacing: Some(spacing),
            slice_thickness: float(obj, tags::SLICE_THICKNESS),
        };
    }
    // Optopol stores the pixel measures per frame instead of shared.
    let groups = if device.manufacturer.to_ascii_uppercase().contains("OPTOPOL") {
        PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE
    } else {
        SHARED_FUNCTIONAL_GROUPS_SEQUENCE
    };
    let measures = first_item(obj, groups).and_then(|g| first_item(g, PIXEL_MEASURES_SEQUENCE));
    match measures {
        Some(m) => PixelGeometry {
            spacing: spacing_of(m),
            slice_thickness: float(m, tags::SLICE_THICKNESS),
        },
        None => PixelGeometry::default(),
    }
}

fn photo_locations(obj: &InMemDicomObject) -> Vec<Option<[f64; 4]>> {
    items(obj, PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE)
        .unwrap_or_default()
        .iter()
        .map(|frame| {
            first_item(frame, OPHTHALMIC_FRAME_LOCATION_SEQUENCE)
                .and_then(|loc| floats(loc, REFERENCE_COORDINATES))
                .filter(|c| c.len() >= 4)
                .map(|c| [c[0], c[1], c[2], c[3]])
        })
        .collect()
}

fn decode_pixels(obj: &dicom_object::DefaultDicomObject) -> PixelPayload {
    if obj.element_opt(tags::PIXEL_DATA).ok().flatten().is_none() {
        return PixelPayload::Missing;
    }
    let decoded = match obj.decode_pixel_data() {
        Ok(decoded) => decoded,
        Err(e) => return PixelPayload::Unusable(e.to_string()),
    };
    let frames: Result<Vec<_>, _> = (0..decoded.number_of_frames())
        .map(|frame| decoded.to_dynamic_image(frame))
        .collect();
    match frames {
        Ok(frames) => PixelPayload::Frames(frames),
        Err(e) => PixelPayload::Unusable(e.to_string()),
    }
}

/// Checks the preamble magic and the file meta group without parsing the
/// data set.
fn check_header(path: &Path) -> Result<(), ReadError> {
    let io = |source| ReadError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = BufReader::new(File::open(path).map_err(io)?);
    let mut preamble = [0u8; 132];
    if reader.read_exact(&mut preamble).is_err() || &preamble[128..132] != b"DICM" {
        return Err(ReadError::NotDicom(path.to_path_buf()));
    }
    reader.seek(SeekFrom::Start(128)).map_err(io)?;
    let meta = FileMetaTable::from_reader(&mut reader).map_err(|e| ReadError::CorruptHeader {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let uid = meta.transfer_syntax();
    match TransferSyntaxRegistry.get(uid) {
        Some(ts) if !ts.is_unsupported() => Ok(()),
        _ => Err(ReadError::UnsupportedTransferSyntax {
            path: path.to_path_buf(),
            uid: uid.to_string(),
        }),
    }
}

/// Reads one file. `index` is its position in the folder's file order.
pub fn read_instance(path: &Path, index: usize) -> Result<DicomInstance, ReadError> {
    check_header(path)?;
    let obj = OpenFileOptions::new()
        .open_file(path)
        .map_err(|e| ReadError::CorruptHeader {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let device = DeviceTags {
        modality: text(&obj, tags::MODALITY).unwrap_or_default(),
        manufacturer: text(&obj, tags::MANUFACTURER).unwrap_or_default(),
        model: text(&obj, tags::MANUFACTURER_MODEL_NAME).unwrap_or_default(),
        series_description: text(&obj, tags::SERIES_DESCRIPTION).unwrap_or_default(),
        field_of_view: float(&obj, HORIZONTAL_FIELD_OF_VIEW),
    };
    if device.modality.is_empty() {
        return Err(ReadError::MissingModality(path.to_path_buf()));
    }

    let pixels = decode_pixels(&obj);
    debug!(?path, modality = %device.modality, "read DICOM instance");

    Ok(DicomInstance {
        path: path.to_path_buf(),
        index,
        patient: patient_tags(&obj),
        acquired: acquisition_time(&obj),
        study_uid: text(&obj, tags::STUDY_INSTANCE_UID),
        series_uid: text(&obj, tags::SERIES_INSTANCE_UID),
        sop_instance_uid: text(&obj, tags::SOP_INSTANCE_UID),
        serial_number: text(&obj, tags::DEVICE_SERIAL_NUMBER),
        software_versions: text(&obj, tags::SOFTWARE_VERSIONS),
        laterality: text(&obj, IMAGE_LATERALITY).or_else(|| text(&obj, LATERALITY)),
        fixation: first_item(&obj, ANATOMIC_REGION_SEQUENCE)
            .and_then(|item| text(item, CODE_MEANING)),
        rows: int(&obj, tags::ROWS).unwrap_or(0),
        columns: int(&obj, tags::COLUMNS).unwrap_or(0),
        number_of_frames: int(&obj, tags::NUMBER_OF_FRAMES).unwrap_or(1).max(1),
        geometry: pixel_geometry(&obj, &device),
        photo_locations: photo_locations(&obj),
        device,
        pixels,
    })
}

fn is_dcm(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case("dcm"))
}

/// Compares strings treating runs of digits as numbers, so `img2` sorts
/// before `img10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a.as_bytes(), b.as_bytes());
    loop {
        match (a.first(), b.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let da = a.iter().take_while(|c| c.is_ascii_digit()).count();
                let db = b.iter().take_while(|c| c.is_ascii_digit()).count();
                let (na, nb) = (trim_zeros(&a[..da]), trim_zeros(&b[..db]));
                let ord = na.len().cmp(&nb.len()).then_with(|| na.cmp(nb)).then(da.cmp(&db));
                if ord != Ordering::Equal {
                    return ord;
                }
                a = &a[da..];
                b = &b[db..];
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(y);
                }
                a = &a[1..];
                b = &b[1..];
            }
        }
    }
}

fn trim_zeros(digits: &[u8]) -> &[u8] {
    let start = digits.iter().position(|&d| d != b'0').unwrap_or(digits.len());
    &digits[start..]
}

fn natural_sort(paths: &mut [PathBuf]) {
    paths.sort_by(|a, b| natural_cmp(&a.to_string_lossy(), &b.to_string_lossy()));
}

/// The `.dcm` files directly inside `folder`, in natural order.
pub fn list_dicom_files(folder: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let path = entry?.path();
        if path.is_file() && is_dcm(&path) {
            files.push(path);
        }
    }
    natural_sort(&mut files);
    Ok(files)
}

/// Folders found under an input root.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Discovery {
    /// Common ancestor used to derive output-relative folder keys.
    pub base: PathBuf,
    pub folders: Vec<PathBuf>,
}

/// Every folder under `root` holding at least one `.dcm` file.
pub fn discover_dicom_folders(root: &Path) -> Discovery {
    let folders: BTreeSet<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_dcm(e.path()))
        .filter_map(|e| e.path().parent().map(Path::to_path_buf))
        .collect();
    let mut folders: Vec<PathBuf> = folders.into_iter().collect();
    natural_sort(&mut folders);

    let base = match folders.as_slice() {
        [] => PathBuf::new(),
        [only] => only.parent().map(Path::to_path_buf).unwrap_or_default(),
        [first, rest @ ..] => rest.iter().fold(first.clone(), |acc, p| common_ancestor(&acc, p)),
    };
    Discovery { base, folders }
}

fn common_ancestor(a: &Path, b: &Path) -> PathBuf {
    a.components()
        .zip(b.components())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x)
        .collect()
}
