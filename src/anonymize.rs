//! Anonymization of patient-identifying fields and the persistent
//! patient -> study id mapping.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{ConfigError, PipelineError};
use crate::grouping::AcquisitionGroup;

/// File name of the mapping generated at the end of a run.
pub const RESERVED_CSV: &str = "patient_2_study_id.csv";

const CSV_HEADER: [&str; 2] = ["patient_id", "study_id"];

/// Which identifying categories survive anonymization (`--keep`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeepFlags {
    pub patient_key: bool,
    pub names: bool,
    pub date_of_birth: bool,
    pub year_of_birth: bool,
    pub gender: bool,
}

impl KeepFlags {
    /// Parses `p` (patient key), `n` (names), `d` (date of birth),
    /// `D` (year of birth only) and `g` (gender).
    pub fn parse(flags: &str) -> Result<Self, ConfigError> {
        let mut keep = KeepFlags::default();
        for c in flags.chars() {
            match c {
                'p' => keep.patient_key = true,
                'n' => keep.names = true,
                'd' => keep.date_of_birth = true,
                'D' => keep.year_of_birth = true,
                'g' => keep.gender = true,
                other => return Err(ConfigError::UnknownKeepFlag(other)),
            }
        }
        Ok(keep)
    }
}

/// 10 digit surrogate derived from the first 32 bits of SHA-256.
pub fn get_hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    format!("{prefix:010}")
}

#[derive(Debug, Default)]
struct MappingTable {
    by_patient: BTreeMap<String, String>,
    study_ids: HashSet<String>,
    /// Patients that came from the loaded file.
    loaded: BTreeSet<String>,
    /// Patients looked up during this run.
    seen: BTreeSet<String>,
}

impl MappingTable {
    fn insert(&mut self, patient: String, study: String) {
        self.study_ids.insert(study.clone());
        self.by_patient.insert(patient, study);
    }

    fn allocate(&self, patient: &str) -> String {
        let mut candidate = get_hash(patient);
        let mut salt = 0u32;
        while self.study_ids.contains(&candidate) {
            salt += 1;
            candidate = get_hash(&format!("{patient}#{salt}"));
        }
        candidate
    }
}

/// Real patient key -> anonymized study id, shared by all workers.
#[derive(Debug, Default)]
pub struct PatientMapping {
    table: Mutex<MappingTable>,
}

impl PatientMapping {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MappingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads a `patient_id,study_id` CSV. The header row is optional.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let err = |reason: String| ConfigError::Mapping {
            path: path.to_path_buf(),
            reason,
        };
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| err(e.to_string()))?;

        let mut table = MappingTable::default();
        for (line, record) in reader.records().enumerate() {
            let record = record.map_err(|e| err(e.to_string()))?;
            let (Some(patient), Some(study)) = (record.get(0), record.get(1)) else {
                return Err(err(format!("line {} needs two columns", line + 1)));
            };
            if line == 0 && patient == CSV_HEADER[0] && study == CSV_HEADER[1] {
                continue;
            }
            if patient.is_empty() || study.is_empty() {
                continue;
            }
            if let Some(previous) = table.by_patient.get(patient) {
                if previous != study {
                    return Err(err(format!("patient '{patient}' is mapped twice")));
                }
            }
            table.loaded.insert(patient.to_string());
            table.insert(patient.to_string(), study.to_string());
        }
        debug!(?path, patients = table.by_patient.len(), "loaded patient mapping");
        Ok(Self {
            table: Mutex::new(table),
        })
    }

    /// The study id of `patient`, allocating a fresh one on first sight.
    pub fn study_id_for(&self, patient: &str) -> String {
        let mut table = self.lock();
        table.seen.insert(patient.to_string());
        if let Some(study) = table.by_patient.get(patient) {
            return study.clone();
        }
        let study = table.allocate(patient);
        table.insert(patient.to_string(), study.clone());
        study
    }

    /// Patients seen this run that were absent from the loaded file.
    pub fn unmapped(&self) -> Vec<(String, String)> {
        let table = self.lock();
        table
            .seen
            .iter()
            .filter(|p| !table.loaded.contains(*p))
            .filter_map(|p| table.by_patient.get(p).map(|s| (p.clone(), s.clone())))
            .collect()
    }

    /// Every known row, sorted by patient id.
    pub fn rows(&self) -> Vec<(String, String)> {
        self.lock()
            .by_patient
            .iter()
            .map(|(p, s)| (p.clone(), s.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().by_patient.is_empty()
    }

    /// Writes the mapping to `path`. An identical existing file is left
    /// alone; a different one is kept as `<stem>_<n>.csv`.
    pub fn persist(&self, path: &Path) -> Result<PersistOutcome, PipelineError> {
        let io = |e| PipelineError::io(path, e);
        let mut bytes = Vec::new();
        {
            let mut writer = csv::Writer::from_writer(&mut bytes);
            writer.write_record(CSV_HEADER)?;
            for (patient, study) in self.rows() {
                writer.write_record([patient, study])?;
            }
            writer.flush().map_err(io)?;
        }

        if !path.exists() {
            fs::write(path, &bytes).map_err(io)?;
            return Ok(PersistOutcome::Created);
        }
        if fs::read(path).map_err(io)? == bytes {
            return Ok(PersistOutcome::Unchanged);
        }
        let mut version = 1;
        let backup = loop {
            let candidate = versioned_filename(path, version);
            if !candidate.exists() {
                break candidate;
            }
            version += 1;
        };
        fs::rename(path, &backup).map_err(io)?;
        fs::write(path, &bytes).map_err(io)?;
        Ok(PersistOutcome::Replaced { backup })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PersistOutcome {
    Created,
    Unchanged,
    Replaced { backup: PathBuf },
}

/// `dir/name.csv` -> `dir/name_<version>.csv`
pub fn versioned_filename(path: &Path, version: u32) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{version}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{version}"),
    };
    path.with_file_name(name)
}

/// Patient block of a group after anonymization.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnonymizedPatient {
    #[serde(rename = "patient_key")]
    pub study_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<String>,
    pub gender: Option<String>,
    pub source_id: Option<String>,
}

/// Derives the study id of the group's patient and strips every field
/// not selected by `keep`.
pub fn anonymize_group(
    group: &AcquisitionGroup,
    keep: KeepFlags,
    mapping: &PatientMapping,
) -> AnonymizedPatient {
    let study_id = if keep.patient_key {
        group.patient_id.clone()
    } else {
        mapping.study_id_for(&group.patient_id)
    };

    let patients = || group.members.iter().map(|m| &m.instance.patient);
    let first_name = patients().find_map(|p| p.given_name.clone());
    let last_name = patients().find_map(|p| p.family_name.clone());
    let birth_date = patients().find_map(|p| p.birth_date);
    let gender = patients().find_map(|p| p.sex.clone());

    let date_of_birth = if keep.year_of_birth {
        birth_date.map(|d| d.format("%Y-01-01").to_string())
    } else if keep.date_of_birth {
        birth_date.map(|d| d.format("%Y-%m-%d").to_string())
    } else {
        None
    };
    AnonymizedPatient {
        study_id,
        first_name: first_name.filter(|_| keep.names),
        last_name: last_name.filter(|_| keep.names),
        date_of_birth,
        gender: gender.filter(|_| keep.gender),
        source_id: group.members.iter().find_map(|m| m.instance.study_uid.clone()),
    }
}

/// Warns about each patient missing from a supplied mapping file.
pub fn report_unmapped(mapping: &PatientMapping, source: &Path) -> usize {
    let unmapped = mapping.unmapped();
    for (patient, study) in &unmapped {
        warn!("Missing map in {}: {patient} -> {study} (<- new hash created)", source.display());
    }
    unmapped.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::{GroupingPolicy, TaggedInstance, group_by_acquisition};
    use crate::modality::Modality;
    use crate::reader::{DicomInstance, PatientTags};
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn instance(patient: &str) -> TaggedInstance {
        TaggedInstance {
            instance: DicomInstance {
                patient: PatientTags {
                    id: patient.into(),
                    family_name: Some("Doe".into()),
                    given_name: Some("Jane".into()),
                    birth_date: NaiveDate::from_ymd_opt(1954, 7, 23),
                    sex: Some("F".into()),
                },
                study_uid: Some("1.2.3".into()),
                ..Default::default()
            },
            modality: Modality::ColourPhoto,
        }
    }

    fn anonymize(keep: &str, mapping: &PatientMapping) -> AnonymizedPatient {
        let instances = vec![instance("P1")];
        let groups = group_by_acquisition(&instances, "k", GroupingPolicy::ByFolder);
        anonymize_group(&groups[0], KeepFlags::parse(keep).unwrap(), mapping)
    }

    #[test]
    fn hash_is_ten_digits_and_stable() {
        let h = get_hash("bbff7a25-d32c-4192-9330-0bb01d49f746");
        assert_eq!(h.len(), 10);
        assert!(h.bytes().all(|b| b.is_ascii_digit()));
        assert_eq!(h, get_hash("bbff7a25-d32c-4192-9330-0bb01d49f746"));
        assert_ne!(h, get_hash("another patient"));
    }

    #[test]
    fn keep_flags() {
        let keep = KeepFlags::parse("pnDg").unwrap();
        assert!(keep.patient_key && keep.names && keep.year_of_birth && keep.gender);
        assert!(!keep.date_of_birth);
        assert_eq!(KeepFlags::parse("").unwrap(), KeepFlags::default());
        assert!(matches!(KeepFlags::parse("px"), Err(ConfigError::UnknownKeepFlag('x'))));
    }

    #[test]
    fn empty_keep_strips_everything() {
        let mapping = PatientMapping::new();
        let patient = anonymize("", &mapping);
        assert_eq!(patient.study_id, get_hash("P1"));
        assert_eq!(patient.first_name, None);
        assert_eq!(patient.last_name, None);
        assert_eq!(patient.date_of_birth, None);
        assert_eq!(patient.gender, None);
        let json = serde_json::to_string(&patient).unwrap();
        assert!(!json.contains("P1") && !json.contains("Doe") && !json.contains("1954"));
    }

    #[test]
    fn keeps_only_selected_fields() {
        let mapping = PatientMapping::new();
        let patient = anonymize("nd", &mapping);
        assert_eq!(patient.first_name.as_deref(), Some("Jane"));
        assert_eq!(patient.last_name.as_deref(), Some("Doe"));
        assert_eq!(patient.date_of_birth.as_deref(), Some("1954-07-23"));
        assert_eq!(patient.gender, None);

        let patient = anonymize("dDg", &mapping);
        assert_eq!(patient.date_of_birth.as_deref(), Some("1954-01-01"));
        assert_eq!(patient.gender.as_deref(), Some("F"));
        assert_eq!(patient.first_name, None);
    }

    #[test]
    fn kept_patient_key_bypasses_mapping() {
        let mapping = PatientMapping::new();
        let patient = anonymize("p", &mapping);
        assert_eq!(patient.study_id, "P1");
        assert!(mapping.is_empty());
    }

    #[test]
    fn loaded_mapping_wins_and_new_ids_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.csv");
        // P2 is pre-assigned the id P1 would hash to
        let csv = format!("patient_id,study_id\nP0,00123\nP2,{}\n", get_hash("P1"));
        fs::write(&path, csv).unwrap();

        let mapping = PatientMapping::load(&path).unwrap();
        assert_eq!(mapping.study_id_for("P0"), "00123");
        let fresh = mapping.study_id_for("P1");
        assert_ne!(fresh, get_hash("P1"));
        assert_eq!(fresh, get_hash("P1#1"));
        assert_eq!(mapping.study_id_for("P1"), fresh);
        assert_eq!(mapping.unmapped(), vec![("P1".to_string(), fresh)]);
    }

    #[test]
    fn headerless_mapping_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.csv");
        fs::write(&path, "bbff7a25,00123\n").unwrap();
        let mapping = PatientMapping::load(&path).unwrap();
        assert_eq!(mapping.study_id_for("bbff7a25"), "00123");
        assert!(mapping.unmapped().is_empty());
    }

    #[test]
    fn conflicting_mapping_rows_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.csv");
        fs::write(&path, "P1,1\nP1,2\n").unwrap();
        assert!(matches!(PatientMapping::load(&path), Err(ConfigError::Mapping { .. })));
    }

    #[test]
    fn same_patient_from_many_threads_gets_one_id() {
        let mapping = Arc::new(PatientMapping::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mapping = Arc::clone(&mapping);
                std::thread::spawn(move || mapping.study_id_for("shared"))
            })
            .collect();
        let ids: BTreeSet<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(mapping.rows().len(), 1);
    }

    #[test]
    fn persist_versions_changed_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RESERVED_CSV);

        let mapping = PatientMapping::new();
        mapping.study_id_for("A");
        assert_eq!(mapping.persist(&path).unwrap(), PersistOutcome::Created);
        assert_eq!(mapping.persist(&path).unwrap(), PersistOutcome::Unchanged);
        let first = fs::read_to_string(&path).unwrap();
        assert_eq!(first, format!("patient_id,study_id\nA,{}\n", get_hash("A")));

        fs::write(versioned_filename(&path, 1), "occupied").unwrap();
        mapping.study_id_for("B");
        let backup = dir.path().join("patient_2_study_id_2.csv");
        assert_eq!(
            mapping.persist(&path).unwrap(),
            PersistOutcome::Replaced { backup: backup.clone() }
        );
        assert_eq!(fs::read_to_string(backup).unwrap(), first);
        assert!(fs::read_to_string(&path).unwrap().contains("B,"));
    }

    #[test]
    fn versioned_names() {
        assert_eq!(
            versioned_filename(Path::new("/x/reserved.csv"), 3),
            PathBuf::from("/x/reserved_3.csv")
        );
    }
}
