//! Clustering a folder's instances into acquisition groups.
//!
//! Time grouping is single linkage over one dimension: instances are
//! scanned in time order and a new group starts whenever the gap to the
//! previous instance exceeds the tolerance, so a burst of captures each a
//! second apart stays together however long the burst is.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use sha2::{Digest, Sha256};

use crate::modality::Modality;
use crate::reader::DicomInstance;

/// Default tolerance in seconds when time grouping is enabled.
pub const DEFAULT_TOLERANCE: f64 = 2.0;

/// A classified instance, the unit every later stage works on.
#[derive(Clone, Debug)]
pub struct TaggedInstance {
    pub instance: DicomInstance,
    pub modality: Modality,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GroupingPolicy {
    /// Everything a patient has in the folder is one group.
    ByFolder,
    /// Chain instances whose acquisition times are at most `tolerance`
    /// seconds apart.
    ByTime { tolerance: f64 },
}

#[derive(Debug)]
pub struct AcquisitionGroup<'a> {
    pub id: String,
    pub patient_id: String,
    /// Earliest member timestamp; `None` for the undated group.
    pub acquired: Option<NaiveDateTime>,
    pub members: Vec<&'a TaggedInstance>,
}

impl AcquisitionGroup<'_> {
    /// Modalities of the members, de-duplicated and sorted by code.
    pub fn modalities(&self) -> Vec<Modality> {
        let mut modalities: Vec<Modality> = self.members.iter().map(|m| m.modality).collect();
        modalities.sort_by_key(|m| m.code());
        modalities.dedup();
        modalities
    }
}

fn gap_seconds(earlier: NaiveDateTime, later: NaiveDateTime) -> f64 {
    let delta = later - earlier;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1e6,
        None => delta.num_seconds() as f64,
    }
}

/// Splits time-sorted members wherever consecutive gaps exceed `tolerance`.
fn chain<'a>(sorted: Vec<&'a TaggedInstance>, tolerance: f64) -> Vec<Vec<&'a TaggedInstance>> {
    let mut chains: Vec<Vec<&TaggedInstance>> = Vec::new();
    let mut previous: Option<NaiveDateTime> = None;
    for member in sorted {
        let Some(at) = member.instance.acquired else {
            continue;
        };
        let split = previous.is_none_or(|prev| gap_seconds(prev, at) > tolerance);
        if split {
            chains.push(Vec::new());
        }
        if let Some(current) = chains.last_mut() {
            current.push(member);
        }
        previous = Some(at);
    }
    chains
}

/// Stable across re-runs and distinct across folders.
pub fn group_id(
    folder_key: &str,
    acquired: Option<NaiveDateTime>,
    members: &[&TaggedInstance],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(folder_key.as_bytes());
    for member in members {
        hasher.update(b"\0");
        hasher.update(member.instance.file_name().as_bytes());
    }
    let digest = hasher.finalize();
    let stamp = match acquired {
        Some(at) => at.format("%Y%m%dT%H%M%S").to_string(),
        None => "undated".to_string(),
    };
    format!(
        "{stamp}_{:02x}{:02x}{:02x}{:02x}",
        digest[0], digest[1], digest[2], digest[3]
    )
}

fn make_group<'a>(
    folder_key: &str,
    patient_id: &str,
    members: Vec<&'a TaggedInstance>,
) -> AcquisitionGroup<'a> {
    let acquired = members.iter().filter_map(|m| m.instance.acquired).min();
    AcquisitionGroup {
        id: group_id(folder_key, acquired, &members),
        patient_id: patient_id.to_string(),
        acquired,
        members,
    }
}

/// Groups the instances of one folder.
///
/// Output order is deterministic: patients by id, then groups by
/// representative time with the undated group last. Members are in time
/// order, ties broken by file order.
pub fn group_by_acquisition<'a>(
    instances: &'a [TaggedInstance],
    folder_key: &str,
    policy: GroupingPolicy,
) -> Vec<AcquisitionGroup<'a>> {
    let mut by_patient: BTreeMap<&str, Vec<&TaggedInstance>> = BTreeMap::new();
    for tagged in instances {
        by_patient
            .entry(tagged.instance.patient.id.as_str())
            .or_default()
            .push(tagged);
    }

    let mut groups = Vec::new();
    for (patient_id, mut members) in by_patient {
        members.sort_by_key(|m| m.instance.index);
        match policy {
            GroupingPolicy::ByFolder => groups.push(make_group(folder_key, patient_id, members)),
            GroupingPolicy::ByTime { tolerance } => {
                let (mut dated, undated): (Vec<_>, Vec<_>) =
                    members.into_iter().partition(|m| m.instance.acquired.is_some());
                dated.sort_by_key(|m| (m.instance.acquired, m.instance.index));
                for members in chain(dated, tolerance) {
                    groups.push(make_group(folder_key, patient_id, members));
                }
                if !undated.is_empty() {
                    groups.push(make_group(folder_key, patient_id, undated));
                }
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn at(hms: &str) -> Option<NaiveDateTime> {
        let text = format!("2024-03-01 {hms}");
        Some(NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f").unwrap())
    }

    fn tagged(index: usize, patient: &str, acquired: Option<NaiveDateTime>) -> TaggedInstance {
        let mut instance = DicomInstance {
            path: PathBuf::from(format!("/in/p/{index}.dcm")),
            index,
            acquired,
            ..Default::default()
        };
        instance.patient.id = patient.to_string();
        TaggedInstance {
            instance,
            modality: Modality::ColourPhoto,
        }
    }

    fn indices(group: &AcquisitionGroup) -> Vec<usize> {
        group.members.iter().map(|m| m.instance.index).collect()
    }

    fn by_time(tolerance: f64) -> GroupingPolicy {
        GroupingPolicy::ByTime { tolerance }
    }

    #[test]
    fn splits_on_gap_larger_than_tolerance() {
        let instances = vec![
            tagged(0, "P1", at("10:00:00")),
            tagged(1, "P1", at("10:00:02")),
            tagged(2, "P1", at("10:05:00")),
        ];
        let groups = group_by_acquisition(&instances, "P1/visit", by_time(5.0));
        assert_eq!(groups.len(), 2);
        assert_eq!(indices(&groups[0]), vec![0, 1]);
        assert_eq!(indices(&groups[1]), vec![2]);
        assert_eq!(groups[0].acquired, at("10:00:00"));
        assert!(groups[0].id.starts_with("20240301T100000_"));
    }

    #[test]
    fn chaining_is_transitive() {
        // each neighbour within 2s, ends 6s apart
        let instances = vec![
            tagged(0, "P1", at("10:00:00")),
            tagged(1, "P1", at("10:00:02")),
            tagged(2, "P1", at("10:00:04")),
            tagged(3, "P1", at("10:00:06")),
        ];
        let groups = group_by_acquisition(&instances, "k", by_time(2.0));
        assert_eq!(groups.len(), 1);
        assert_eq!(indices(&groups[0]), vec![0, 1, 2, 3]);
    }

    #[test]
    fn boundary_gap_equal_to_tolerance_co_groups() {
        let instances = vec![tagged(0, "P1", at("10:00:00")), tagged(1, "P1", at("10:00:02.5"))];
        assert_eq!(group_by_acquisition(&instances, "k", by_time(2.5)).len(), 1);
        assert_eq!(group_by_acquisition(&instances, "k", by_time(2.499)).len(), 2);
    }

    #[test]
    fn zero_tolerance_only_merges_identical_timestamps() {
        let instances = vec![
            tagged(0, "P1", at("10:00:00")),
            tagged(1, "P1", at("10:00:00")),
            tagged(2, "P1", at("10:00:00.001")),
        ];
        let groups = group_by_acquisition(&instances, "k", by_time(0.0));
        assert_eq!(groups.len(), 2);
        assert_eq!(indices(&groups[0]), vec![0, 1]);
    }

    #[test]
    fn sorts_by_time_then_file_order() {
        let instances = vec![
            tagged(0, "P1", at("10:00:01")),
            tagged(1, "P1", at("10:00:00")),
            tagged(2, "P1", at("10:00:01")),
        ];
        let groups = group_by_acquisition(&instances, "k", by_time(1.0));
        assert_eq!(indices(&groups[0]), vec![1, 0, 2]);
    }

    #[test]
    fn undated_instances_form_trailing_group() {
        let instances = vec![
            tagged(0, "P1", None),
            tagged(1, "P1", at("10:00:00")),
            tagged(2, "P1", None),
            tagged(3, "P1", at("11:00:00")),
        ];
        let groups = group_by_acquisition(&instances, "k", by_time(2.0));
        assert_eq!(groups.len(), 3);
        assert_eq!(indices(&groups[2]), vec![0, 2]);
        assert_eq!(groups[2].acquired, None);
        assert!(groups[2].id.starts_with("undated_"));
    }

    #[test]
    fn patients_never_share_a_group() {
        let instances = vec![
            tagged(0, "P2", at("10:00:00")),
            tagged(1, "P1", at("10:00:00")),
        ];
        let groups = group_by_acquisition(&instances, "k", by_time(10.0));
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].patient_id, "P1");
        assert_eq!(groups[1].patient_id, "P2");

        let folder = group_by_acquisition(&instances, "k", GroupingPolicy::ByFolder);
        assert_eq!(folder.len(), 2);
    }

    #[test]
    fn by_folder_keeps_file_order() {
        let instances = vec![
            tagged(0, "P1", at("12:00:00")),
            tagged(1, "P1", None),
            tagged(2, "P1", at("09:00:00")),
        ];
        let groups = group_by_acquisition(&instances, "k", GroupingPolicy::ByFolder);
        assert_eq!(groups.len(), 1);
        assert_eq!(indices(&groups[0]), vec![0, 1, 2]);
        assert_eq!(groups[0].acquired, at("09:00:00"));
    }

    #[test]
    fn ids_are_stable_and_folder_specific() {
        let instances = vec![tagged(0, "P1", at("10:00:00"))];
        let a = group_by_acquisition(&instances, "P1/left", by_time(2.0));
        let b = group_by_acquisition(&instances, "P1/left", by_time(2.0));
        let c = group_by_acquisition(&instances, "P1/right", by_time(2.0));
        assert_eq!(a[0].id, b[0].id);
        assert_ne!(a[0].id, c[0].id);
    }

    #[test]
    fn modalities_are_sorted_and_unique() {
        let mut instances = vec![
            tagged(0, "P1", at("10:00:00")),
            tagged(1, "P1", at("10:00:00")),
            tagged(2, "P1", at("10:00:00")),
        ];
        instances[0].modality = Modality::Unknown;
        instances[1].modality = Modality::SloInfrared;
        instances[2].modality = Modality::Oct;
        instances.push(tagged(3, "P1", at("10:00:00")));
        instances[3].modality = Modality::Unknown;
        let groups = group_by_acquisition(&instances, "k", GroupingPolicy::ByFolder);
        assert_eq!(
            groups[0].modalities(),
            vec![Modality::Oct, Modality::SloInfrared, Modality::Unknown]
        );
    }
}
