//! Build records for a container.
//!
//! Each CLI `build` leaves one JSON record under `<out_dir>/runs/<apex>/`
//! naming the payload it selected, the manifest version it stamped and the
//! artifact it produces. Once the executor returns, the record also holds the
//! last pipeline state the run completed.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::action::executor::ActionFailed;
use crate::config::BuildInput;
use crate::manifest;
use crate::pipeline::{BuildOutcome, BuildState};

const RECORD_EXTENSION: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Building,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub apex: String,
    /// Version written into the container manifest.
    pub version: i64,
    pub status: RunStatus,
    /// Last pipeline state whose actions all completed.
    pub reached: BuildState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_action: Option<String>,
    /// Signed container, or the compressed one when compression applies.
    pub artifact: PathBuf,
    pub compressed: bool,
    /// In-container paths of the selected payload.
    pub files: Vec<String>,
    pub started_at_utc: String,
    pub finished_at_utc: Option<String>,
}

impl RunRecord {
    pub fn planned(input: &BuildInput, outcome: &BuildOutcome, run_id: String) -> Result<Self> {
        Ok(Self {
            run_id,
            apex: input.apex.name.clone(),
            version: manifest::resolve_version(&input.product, &input.apex)?,
            status: RunStatus::Building,
            reached: BuildState::NotStarted,
            failed_action: None,
            artifact: outcome.artifact.path.clone(),
            compressed: outcome.artifact.compressed,
            files: outcome.selection.files.iter().map(|f| f.path()).collect(),
            started_at_utc: now_utc_compact(),
            finished_at_utc: None,
        })
    }

    /// Settle the record from what the executor returned.
    ///
    /// A failure carrying [`ActionFailed`] pins the run to the state before
    /// that action's stage; any other failure happened before the first action.
    pub fn finish<T>(&mut self, outcome: &BuildOutcome, result: &Result<T>) {
        match result {
            Ok(_) => {
                self.status = RunStatus::Succeeded;
                self.reached = outcome.final_state();
                self.failed_action = None;
            }
            Err(err) => {
                self.status = RunStatus::Failed;
                let rule = err.downcast_ref::<ActionFailed>().map(|f| f.rule.clone());
                self.reached = rule
                    .as_deref()
                    .map_or(BuildState::NotStarted, |rule| outcome.reached_before(rule));
                self.failed_action = rule;
            }
        }
        self.finished_at_utc = Some(now_utc_compact());
    }
}

/// The records of one container under an output directory.
pub struct RunLog {
    dir: PathBuf,
}

impl RunLog {
    pub fn new(out_dir: &Path, apex: &str) -> Self {
        Self {
            dir: out_dir.join("runs").join(apex),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", run_id, RECORD_EXTENSION))
    }

    /// `<UTC timestamp>-<seq>`, sortable and not yet used in this log.
    pub fn next_run_id(&self) -> String {
        let stamp = now_utc_compact();
        let mut seq = 0u32;
        loop {
            let id = format!("{}-{:03}", stamp, seq);
            if !self.record_path(&id).exists() {
                return id;
            }
            seq += 1;
        }
    }

    pub fn save(&self, record: &RunRecord) -> Result<()> {
        let path = self.record_path(&record.run_id);
        write_json_atomic(&path, record)
            .with_context(|| format!("writing run record '{}'", path.display()))
    }

    /// Every record in the log, oldest first.
    pub fn records(&self) -> Result<Vec<RunRecord>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("reading run log '{}'", self.dir.display()))?
        {
            let path = entry
                .with_context(|| format!("iterating run log '{}'", self.dir.display()))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let bytes =
                fs::read(&path).with_context(|| format!("reading run record '{}'", path.display()))?;
            let record: RunRecord = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing run record '{}'", path.display()))?;
            records.push(record);
        }
        records.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(records)
    }

    pub fn latest_success(&self) -> Result<Option<RunRecord>> {
        Ok(self
            .records()?
            .into_iter()
            .rev()
            .find(|r| r.status == RunStatus::Succeeded))
    }

    /// Delete all but the `keep` most recent records.
    pub fn prune(&self, keep: usize) -> Result<()> {
        let records = self.records()?;
        let expired = records.len().saturating_sub(keep);
        for record in &records[..expired] {
            let path = self.record_path(&record.run_id);
            tracing::debug!(run_id = %record.run_id, "pruning run record");
            fs::remove_file(&path)
                .with_context(|| format!("removing run record '{}'", path.display()))?;
        }
        Ok(())
    }
}

/// `YYYYMMDDTHHMMSSZ` for the current UTC time.
pub fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).context("serializing run record")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })
}
