//! Build run records under `<store>/builds/<run_id>/`.
//!
//! Every build gets a sortable run id and a `build-record.json` that is
//! rewritten as steps complete. Scratch space lives in `work/` beside the
//! record and is removed when the build ends.

use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const RECORD_FILENAME: &str = "build-record.json";
const WORK_DIRNAME: &str = "work";

const RUN_ID_SALT_BITS: u32 = 32;
static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

/// How a step's layer was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Layer reused from the store.
    Cached,
    /// Layer produced by executing the step.
    Built,
    /// Config-only change, no layer.
    Metadata,
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            StepOutcome::Cached => "CACHED",
            StepOutcome::Built => "BUILT",
            StepOutcome::Metadata => "META",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-based.
    pub index: usize,
    pub directive: String,
    pub cache_key: String,
    pub outcome: StepOutcome,
    /// `sha256:<hex>` of the layer blob; `None` for metadata-only steps.
    pub layer_digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub step: Option<usize>,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub run_id: String,
    pub status: RunStatus,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    pub recipe: String,
    pub tag: Option<String>,
    pub base_digest: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    pub failure: Option<FailureRecord>,
    pub manifest_digest: Option<String>,
}

/// A build run directory.
#[derive(Debug, Clone)]
pub struct BuildRun {
    pub run_id: String,
    pub dir: PathBuf,
}

impl BuildRun {
    /// Allocate a fresh run directory under `builds_dir`.
    pub fn allocate(builds_dir: &Path) -> Result<Self> {
        fs::create_dir_all(builds_dir)
            .with_context(|| format!("creating builds directory '{}'", builds_dir.display()))?;
        for _ in 0..32 {
            let run_id = generate_run_id()?;
            let dir = builds_dir.join(&run_id);
            if dir.exists() {
                continue;
            }
            fs::create_dir_all(&dir)
                .with_context(|| format!("creating build run directory '{}'", dir.display()))?;
            return Ok(Self { run_id, dir });
        }
        bail!(
            "failed allocating unique build run directory under '{}'",
            builds_dir.display()
        )
    }

    pub fn record_path(&self) -> PathBuf {
        record_path(&self.dir)
    }

    /// Scratch directory for this run.
    pub fn work_dir(&self) -> PathBuf {
        self.dir.join(WORK_DIRNAME)
    }

    pub fn write_record(&self, record: &BuildRecord) -> Result<()> {
        let path = self.record_path();
        write_json_atomic(&path, record)
            .with_context(|| format!("writing build record '{}'", path.display()))
    }

    /// Remove the scratch directory, keeping the record.
    pub fn cleanup_work(&self) -> Result<()> {
        let work = self.work_dir();
        if work.exists() {
            fs::remove_dir_all(&work)
                .with_context(|| format!("removing build work directory '{}'", work.display()))?;
        }
        Ok(())
    }
}

impl BuildRecord {
    pub fn started(run_id: &str, recipe: &str, tag: Option<String>) -> Result<Self> {
        Ok(Self {
            run_id: run_id.to_string(),
            status: RunStatus::Running,
            created_at_utc: now_utc_rfc3339()?,
            finished_at_utc: None,
            recipe: recipe.to_string(),
            tag,
            base_digest: None,
            steps: Vec::new(),
            failure: None,
            manifest_digest: None,
        })
    }

    pub fn finish_success(&mut self, manifest_digest: &str) -> Result<()> {
        self.status = RunStatus::Success;
        self.manifest_digest = Some(manifest_digest.to_string());
        self.finished_at_utc = Some(now_utc_rfc3339()?);
        Ok(())
    }

    pub fn finish_failed(&mut self, failure: FailureRecord) -> Result<()> {
        self.status = RunStatus::Failed;
        self.failure = Some(failure);
        self.finished_at_utc = Some(now_utc_rfc3339()?);
        Ok(())
    }
}

pub fn record_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RECORD_FILENAME)
}

/// Every readable record under `builds_dir`, newest first.
pub fn load_records(builds_dir: &Path) -> Result<Vec<BuildRecord>> {
    if !builds_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(builds_dir)
        .with_context(|| format!("reading builds directory '{}'", builds_dir.display()))?
    {
        let entry = entry
            .with_context(|| format!("iterating builds directory '{}'", builds_dir.display()))?;
        let run_dir = entry.path();
        if !run_dir.is_dir() {
            continue;
        }
        let Some(run_name) = run_dir.file_name().and_then(|part| part.to_str()) else {
            continue;
        };
        if run_name.starts_with('.') {
            continue;
        }
        let path = record_path(&run_dir);
        if !path.is_file() {
            continue;
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("reading build record '{}'", path.display()))?;
        let parsed: BuildRecord = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing build record '{}'", path.display()))?;
        runs.push(parsed);
    }
    runs.sort_by_key(|run| Reverse(run_sort_key(run)));
    Ok(runs)
}

pub fn latest_successful(builds_dir: &Path) -> Result<Option<BuildRecord>> {
    Ok(load_records(builds_dir)?
        .into_iter()
        .find(|run| run.status == RunStatus::Success))
}

/// Remove all but the newest `keep` finished runs. Running builds are left
/// alone. Returns the number removed.
pub fn prune_old_runs(builds_dir: &Path, keep: usize) -> Result<usize> {
    let runs = load_records(builds_dir)?;
    let mut removed = 0usize;
    for run in runs
        .into_iter()
        .filter(|run| run.status != RunStatus::Running)
        .skip(keep)
    {
        let path = builds_dir.join(&run.run_id);
        fs::remove_dir_all(&path)
            .with_context(|| format!("removing expired build run directory '{}'", path.display()))?;
        removed += 1;
    }
    Ok(removed)
}

// Run ids are base62 of a nanosecond timestamp; longer ids are newer.
fn run_sort_key(run: &BuildRecord) -> (usize, String) {
    (run.run_id.len(), run.run_id.clone())
}

pub fn generate_run_id() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX_EPOCH while generating build run id")?
        .as_nanos();
    let pid_component = (std::process::id() as u128 & 0xFFFF) << 16;
    let seq_component = (RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u128) & 0xFFFF;
    let entropy = (nanos << RUN_ID_SALT_BITS) | pid_component | seq_component;
    let mut id = base62_encode_u128(entropy);
    id = id.trim_start_matches('0').to_string();
    if id.is_empty() {
        id.push('0');
    }
    if id.len() > 22 {
        bail!("sortable build run id overflow while generating run identifier")
    }
    Ok(id)
}

fn base62_encode_u128(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut bytes = Vec::new();
    while value > 0 {
        let idx = (value % 62) as usize;
        bytes.push(ALPHABET[idx] as char);
        value /= 62;
    }
    bytes.iter().rev().collect()
}

fn now_utc_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("formatting current time")
}

/// Serialize to a sibling temp file, then rename over `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).context("serializing build record")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn finished_run(builds: &Path, status: RunStatus) -> BuildRun {
        let run = BuildRun::allocate(builds).unwrap();
        let mut record = BuildRecord::started(&run.run_id, "Containerfile", None).unwrap();
        match status {
            RunStatus::Success => record.finish_success(&format!("sha256:{}", "a".repeat(64))).unwrap(),
            RunStatus::Failed => record
                .finish_failed(FailureRecord {
                    step: Some(3),
                    kind: "StepExecutionFailure".into(),
                    message: "exit 1".into(),
                })
                .unwrap(),
            RunStatus::Running => {}
        }
        run.write_record(&record).unwrap();
        run
    }

    #[test]
    fn run_ids_sort_by_creation() {
        let a = generate_run_id().unwrap();
        let b = generate_run_id().unwrap();
        assert_ne!(a, b);
        assert!((a.len(), &a) < (b.len(), &b), "{a} !< {b}");
    }

    #[test]
    fn records_roundtrip_and_latest_success() {
        let tmp = TempDir::new().unwrap();
        let builds = tmp.path().join("builds");
        let ok = finished_run(&builds, RunStatus::Success);
        let failed = finished_run(&builds, RunStatus::Failed);

        let records = load_records(&builds).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].run_id, failed.run_id);
        assert_eq!(records[0].failure.as_ref().unwrap().step, Some(3));
        assert!(records[0].finished_at_utc.as_deref().unwrap().ends_with('Z'));

        let latest = latest_successful(&builds).unwrap().unwrap();
        assert_eq!(latest.run_id, ok.run_id);
    }

    #[test]
    fn prune_keeps_newest_and_running() {
        let tmp = TempDir::new().unwrap();
        let builds = tmp.path().join("builds");
        let oldest = finished_run(&builds, RunStatus::Success);
        let running = finished_run(&builds, RunStatus::Running);
        let newest = finished_run(&builds, RunStatus::Failed);

        assert_eq!(prune_old_runs(&builds, 1).unwrap(), 1);
        assert!(!oldest.dir.exists());
        assert!(running.dir.exists());
        assert!(newest.dir.exists());
    }

    #[test]
    fn work_dir_is_removed_but_record_kept() {
        let tmp = TempDir::new().unwrap();
        let run = finished_run(&tmp.path().join("builds"), RunStatus::Success);
        fs::create_dir_all(run.work_dir().join("rootfs")).unwrap();
        run.cleanup_work().unwrap();
        assert!(!run.work_dir().exists());
        assert!(run.record_path().is_file());
    }
}
