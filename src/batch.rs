//! Folder discovery, the per-folder pipeline and the parallel driver.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::anonymize::{PersistOutcome, anonymize_group, report_unmapped};
use crate::config::RunConfig;
use crate::error::{BatchError, PipelineError, ReadError};
use crate::extract::{ImageFormat, extract_group};
use crate::grouping::{TaggedInstance, group_by_acquisition};
use crate::metadata::{METADATA_FILE, build_metadata, write_metadata};
use crate::reader::{discover_dicom_folders, list_dicom_files, read_instance};

const REMOVE_ATTEMPTS: usize = 5;

/// Lifecycle of one input folder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FolderState {
    Pending,
    Processing,
    Done,
    Skipped,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FolderEvent {
    Start,
    Finish,
    Skip,
    Fail,
}

impl fmt::Display for FolderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for FolderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FolderState {
    pub fn on(self, event: FolderEvent) -> Result<FolderState, PipelineError> {
        use FolderEvent::*;
        use FolderState::*;

        match (self, event) {
            (Pending, Start) => Ok(Processing),
            (Processing, Finish) => Ok(Done),
            (Processing, Skip) => Ok(Skipped),
            (Processing, Fail) => Ok(Failed),
            (from, event) => Err(PipelineError::InvalidTransition {
                from: from.to_string(),
                event: event.to_string(),
            }),
        }
    }
}

#[derive(Debug, Default)]
struct TreeState {
    reset_done: bool,
}

/// The output directory. Every operation that creates or deletes
/// directories goes through the same lock.
#[derive(Debug)]
pub struct OutputTree {
    root: PathBuf,
    state: Mutex<TreeState>,
}

/// Removes `path` recursively. A tree that vanishes underneath us counts as
/// removed; other failures are retried.
fn remove_tree(path: &Path) -> Result<(), PipelineError> {
    for attempt in 1..=REMOVE_ATTEMPTS {
        match fs::remove_dir_all(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => debug!(?path, attempt, "removal failed: {e}"),
        }
    }
    Err(PipelineError::Concurrency(path.to_path_buf()))
}

fn remove_entry(path: &Path) -> Result<(), PipelineError> {
    if path.is_dir() {
        return remove_tree(path);
    }
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(PipelineError::io(path, e)),
        _ => Ok(()),
    }
}

/// Keeps a patient or group key from escaping its directory level.
fn dir_component(key: &str) -> String {
    key.replace(['/', '\\'], "_")
}

impl OutputTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(TreeState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TreeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `<root>/<study_id>/<group_id>`
    pub fn group_dir(&self, study_id: &str, group_id: &str) -> PathBuf {
        self.root.join(dir_component(study_id)).join(dir_component(group_id))
    }

    pub fn ensure_root(&self) -> Result<(), PipelineError> {
        let _guard = self.lock();
        fs::create_dir_all(&self.root).map_err(|e| PipelineError::io(&self.root, e))
    }

    /// Deletes and recreates the root. Only the first call does any work.
    pub fn reset(&self) -> Result<(), PipelineError> {
        let mut state = self.lock();
        if state.reset_done {
            return Ok(());
        }
        remove_tree(&self.root)?;
        fs::create_dir_all(&self.root).map_err(|e| PipelineError::io(&self.root, e))?;
        state.reset_done = true;
        info!(root = %self.root.display(), "output directory reset");
        Ok(())
    }

    /// Creates a group directory, emptying it first when `clear` is set.
    pub fn prepare_group(&self, dir: &Path, clear: bool) -> Result<(), PipelineError> {
        let _guard = self.lock();
        if clear && dir.is_dir() {
            let entries = fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| PipelineError::io(dir, e))?;
                remove_entry(&entry.path())?;
            }
        }
        fs::create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))
    }

    /// Removes empty directories below the root, deepest first.
    pub fn prune_empty(&self) -> Result<usize, PipelineError> {
        let _guard = self.lock();
        let mut removed = 0;
        let dirs = WalkDir::new(&self.root)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir());
        for dir in dirs {
            let is_empty = fs::read_dir(dir.path())
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if !is_empty {
                continue;
            }
            match fs::remove_dir(dir.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(PipelineError::io(dir.path(), e)),
            }
        }
        if removed > 0 {
            debug!(removed, "pruned empty output directories");
        }
        Ok(removed)
    }
}

/// A group directory is complete when it holds the metadata document
/// and at least one image of the requested format.
fn is_complete(dir: &Path, format: ImageFormat) -> bool {
    if !dir.join(METADATA_FILE).is_file() {
        return false;
    }
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    entries.filter_map(|e| e.ok()).any(|e| {
        e.path()
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(format.extension()))
    })
}

#[derive(Debug, PartialEq, Eq)]
pub enum FolderOutcome {
    Done { groups: usize, images: usize },
    Skipped,
}

/// `folder` relative to `base`, `/` separated.
pub fn folder_key(folder: &Path, base: &Path) -> String {
    let relative = folder.strip_prefix(base).unwrap_or(folder);
    let key = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if key.is_empty() { ".".to_string() } else { key }
}

fn read_folder(config: &RunConfig, folder: &Path) -> Result<Vec<TaggedInstance>, PipelineError> {
    let files = list_dicom_files(folder).map_err(|e| PipelineError::io(folder, e))?;
    let mut tagged = Vec::with_capacity(files.len());
    for (index, path) in files.iter().enumerate() {
        let instance = match read_instance(path, index) {
            Ok(instance) => instance,
            Err(e @ ReadError::Io { .. }) => return Err(e.into()),
            Err(e) => {
                warn!("skipping instance: {e}");
                continue;
            }
        };
        match config.classifier.classify(&instance.device) {
            Some(modality) => tagged.push(TaggedInstance { instance, modality }),
            None => warn!(?path, "skipping instance without modality"),
        }
    }
    if tagged.is_empty() {
        return Err(PipelineError::EmptyFolder(folder.to_path_buf()));
    }
    Ok(tagged)
}

/// Runs read, classify, group, anonymize, extract and write for one folder.
pub fn process_folder(
    config: &RunConfig,
    tree: &OutputTree,
    folder: &Path,
    base: &Path,
) -> Result<FolderOutcome, PipelineError> {
    let tagged = read_folder(config, folder)?;
    let key = folder_key(folder, base);
    let groups = group_by_acquisition(&tagged, &key, config.grouping);

    let plan: Vec<_> = groups
        .iter()
        .map(|group| {
            let patient = anonymize_group(group, config.keep, &config.mapping);
            let dir = tree.group_dir(&patient.study_id, &group.id);
            (group, patient, dir)
        })
        .collect();

    if !config.overwrite && plan.iter().all(|(_, _, dir)| is_complete(dir, config.image_format)) {
        return Ok(FolderOutcome::Skipped);
    }

    let mut images = 0;
    for (group, patient, dir) in plan {
        tree.prepare_group(&dir, config.overwrite)?;
        let report = extract_group(group, &dir, config.image_format, config.overwrite)?;
        images += report.written;
        let metadata = build_metadata(group, patient, &report, &config.input_dir);
        write_metadata(&dir, &metadata)?;
        debug!(dir = %dir.display(), members = group.members.len(), "group written");
    }
    Ok(FolderOutcome::Done {
        groups: groups.len(),
        images,
    })
}

#[derive(Debug)]
pub struct FolderFailure {
    pub folder: PathBuf,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<FolderFailure>,
    /// What happened to the generated mapping CSV, when one was saved.
    pub mapping: Option<PersistOutcome>,
}

impl BatchSummary {
    pub fn into_result(self) -> Result<Self, BatchError> {
        if self.failed > 0 {
            return Err(BatchError::PartialFailure {
                failed: self.failed,
                total: self.total,
            });
        }
        Ok(self)
    }
}

fn progress_bar(len: usize, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len as u64);
    let template = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})";
    if let Ok(style) = ProgressStyle::default_bar().template(template) {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar
}

fn run_folder(
    config: &RunConfig,
    tree: &OutputTree,
    folder: &Path,
    base: &Path,
) -> (FolderState, Option<String>) {
    let step = |state: FolderState, event| state.on(event).unwrap_or(FolderState::Failed);
    let state = step(FolderState::Pending, FolderEvent::Start);

    match process_folder(config, tree, folder, base) {
        Ok(FolderOutcome::Done { groups, images }) => {
            info!(folder = %folder.display(), groups, images, "processed");
            (step(state, FolderEvent::Finish), None)
        }
        Ok(FolderOutcome::Skipped) => {
            info!(folder = %folder.display(), "output already complete, skipping");
            (step(state, FolderEvent::Skip), None)
        }
        Err(e) => {
            error!(folder = %folder.display(), "failed: {e}");
            (step(state, FolderEvent::Fail), Some(e.to_string()))
        }
    }
}

fn save_mapping(config: &RunConfig) -> Result<Option<PersistOutcome>, PipelineError> {
    if config.keep.patient_key || config.mapping.is_empty() {
        return Ok(None);
    }
    if let Some(source) = &config.mapping_file {
        if report_unmapped(&config.mapping, source) == 0 {
            return Ok(None);
        }
    }
    let path = config.reserved_csv();
    let outcome = config.mapping.persist(&path)?;
    match &outcome {
        PersistOutcome::Created => info!(path = %path.display(), "patient mapping saved"),
        PersistOutcome::Unchanged => debug!(path = %path.display(), "patient mapping unchanged"),
        PersistOutcome::Replaced { backup } => {
            info!(path = %path.display(), backup = %backup.display(), "patient mapping updated")
        }
    }
    Ok(Some(outcome))
}

/// Processes every DICOM folder under the input directory.
///
/// Errors are returned only for failures of the run itself (output root,
/// worker pool, mapping CSV); failing folders are counted in the summary.
pub fn run(config: &RunConfig) -> Result<BatchSummary, PipelineError> {
    let discovery = discover_dicom_folders(&config.input_dir);
    let tree = OutputTree::new(&config.output_dir);
    if config.reset {
        tree.reset()?;
    } else {
        tree.ensure_root()?;
    }

    let mut summary = BatchSummary {
        total: discovery.folders.len(),
        ..Default::default()
    };
    if discovery.folders.is_empty() {
        warn!(input = %config.input_dir.display(), "no DICOM folders found");
        return Ok(summary);
    }
    info!(folders = summary.total, jobs = config.n_jobs, "processing DICOM folders");

    let pool = rayon::ThreadPoolBuilder::new().num_threads(config.n_jobs).build()?;
    let bar = progress_bar(summary.total, config.quiet);
    let outcomes: Vec<_> = pool.install(|| {
        discovery
            .folders
            .par_iter()
            .map(|folder| {
                let outcome = run_folder(config, &tree, folder, &discovery.base);
                bar.inc(1);
                (folder, outcome)
            })
            .collect()
    });
    bar.finish_and_clear();

    for (folder, (state, failure)) in outcomes {
        match state {
            FolderState::Done => summary.processed += 1,
            FolderState::Skipped => summary.skipped += 1,
            _ => {
                summary.failed += 1;
                summary.failures.push(FolderFailure {
                    folder: folder.clone(),
                    error: failure.unwrap_or_else(|| format!("ended in state {state}")),
                });
            }
        }
    }

    tree.prune_empty()?;
    summary.mapping = save_mapping(config)?;
    Ok(summary)
}
