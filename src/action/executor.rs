//! Local executor for an [`ActionGraph`].
//!
//! Runs actions in dependency order on the host. An action whose inputs and
//! definition hash to the same key as its last successful run is skipped.
//! A failing action has its declared outputs removed, so nothing downstream
//! ever sees a half-written stage.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{ActionGraph, BuildAction, Step};
use crate::{image, layout, manifest};

const LOCK_FILENAME: &str = ".apex-builder.lock";
const STAMP_DIR: &str = ".actions";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub ran: usize,
    pub skipped: usize,
}

/// Context on the error of a failed action; recover it with
/// `err.downcast_ref::<ActionFailed>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionFailed {
    pub rule: String,
}

impl fmt::Display for ActionFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action '{}' failed", self.rule)
    }
}

pub struct LocalExecutor {
    out_dir: PathBuf,
    force: bool,
}

impl LocalExecutor {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            force: false,
        }
    }

    /// Re-run every action even when its key is unchanged.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn execute(&self, graph: &ActionGraph) -> Result<ExecutionSummary> {
        fs::create_dir_all(&self.out_dir)
            .with_context(|| format!("creating output directory '{}'", self.out_dir.display()))?;
        let lock_path = self.out_dir.join(LOCK_FILENAME);
        let lock = File::create(&lock_path)
            .with_context(|| format!("creating lock file '{}'", lock_path.display()))?;
        lock.try_lock_exclusive().with_context(|| {
            format!(
                "output directory '{}' is locked by another build",
                self.out_dir.display()
            )
        })?;

        let mut summary = ExecutionSummary::default();
        for action in graph.ordered()? {
            if self.execute_action(action)? {
                summary.ran += 1;
            } else {
                summary.skipped += 1;
            }
        }
        tracing::info!(ran = summary.ran, skipped = summary.skipped, "build finished");
        Ok(summary)
    }

    /// Returns false when the action was up to date.
    fn execute_action(&self, action: &BuildAction) -> Result<bool> {
        for input in action.inputs.iter().chain(&action.validations) {
            if fs::symlink_metadata(input).is_err() {
                bail!(
                    "action '{}': missing input '{}'",
                    action.rule,
                    input.display()
                );
            }
        }

        let key = action_key(action)?;
        let stamp = self.stamp_path(action);
        if !self.force
            && action.outputs.iter().all(|o| fs::symlink_metadata(o).is_ok())
            && fs::read_to_string(&stamp).map(|s| s == key).unwrap_or(false)
        {
            tracing::debug!(rule = %action.rule, "up to date");
            return Ok(false);
        }

        tracing::info!(rule = %action.rule, "{}", action.description);
        if let Err(err) = action.steps.iter().try_for_each(run_step) {
            for output in &action.outputs {
                if let Err(cleanup) = remove_path(output) {
                    tracing::warn!(rule = %action.rule, "failed to clean up output: {:#}", cleanup);
                }
            }
            match fs::remove_file(&stamp) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    rule = %action.rule,
                    stamp = %stamp.display(),
                    "failed to remove stale stamp: {}",
                    e
                ),
            }
            return Err(err.context(ActionFailed {
                rule: action.rule.clone(),
            }));
        }

        if let Some(parent) = stamp.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&stamp, &key)?;
        Ok(true)
    }

    fn stamp_path(&self, action: &BuildAction) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(action.rule.as_bytes());
        for output in &action.outputs {
            hasher.update(output.to_string_lossy().as_bytes());
        }
        self.out_dir
            .join(STAMP_DIR)
            .join(format!("{:x}.key", hasher.finalize()))
    }
}

/// Hash of the action definition plus the current content of its inputs.
pub fn action_key(action: &BuildAction) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(action)?);
    for input in &action.inputs {
        hash_path(&mut hasher, input)?;
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn hash_path(hasher: &mut Sha256, path: &Path) -> Result<()> {
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking input '{}'", path.display()))?;
        hasher.update(entry.path().to_string_lossy().as_bytes());
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            hasher.update(target.to_string_lossy().as_bytes());
        } else if file_type.is_file() {
            let mut file = File::open(entry.path())
                .with_context(|| format!("opening input '{}'", entry.path().display()))?;
            io::copy(&mut file, hasher)?;
        }
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(_) => return Ok(()),
    };
    result.with_context(|| format!("removing '{}'", path.display()))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory '{}'", parent.display()))?;
    }
    Ok(())
}

fn run_step(step: &Step) -> Result<()> {
    match step {
        Step::MkDirs(dirs) => {
            for dir in dirs {
                fs::create_dir_all(dir)
                    .with_context(|| format!("creating directory '{}'", dir.display()))?;
            }
        }
        Step::RemoveAll(path) => remove_path(path)?,
        Step::Copy { src, dst } => {
            if !src.exists() {
                bail!("file not found: {}", src.display());
            }
            ensure_parent(dst)?;
            remove_path(dst)?;
            fs::copy(src, dst).with_context(|| {
                format!("copying '{}' to '{}'", src.display(), dst.display())
            })?;
        }
        Step::Symlink { target, link } => {
            ensure_parent(link)?;
            remove_path(link)?;
            std::os::unix::fs::symlink(target, link)
                .with_context(|| format!("creating symlink '{}'", link.display()))?;
        }
        Step::WriteFile { path, content } => {
            ensure_parent(path)?;
            fs::write(path, content)
                .with_context(|| format!("writing '{}'", path.display()))?;
        }
        Step::Append { input, output } => {
            let content = fs::read(input)
                .with_context(|| format!("reading '{}'", input.display()))?;
            append(output, &content)?;
        }
        Step::AppendText { content, output } => append(output, content.as_bytes())?,
        Step::Unzip { archive, dest } => {
            let file = File::open(archive)
                .with_context(|| format!("opening archive '{}'", archive.display()))?;
            let mut zip = zip::ZipArchive::new(file)
                .with_context(|| format!("reading archive '{}'", archive.display()))?;
            fs::create_dir_all(dest)?;
            zip.extract(dest)
                .with_context(|| format!("extracting '{}'", archive.display()))?;
        }
        Step::AppendZipListing {
            archive,
            dir,
            output,
        } => {
            let entries = layout::app_set_entries(archive, dir)?;
            append(output, entries.as_bytes())?;
        }
        Step::AugmentManifest {
            input,
            fields,
            output,
        } => {
            let json = fs::read_to_string(input)
                .with_context(|| format!("reading manifest '{}'", input.display()))?;
            ensure_parent(output)?;
            fs::write(output, manifest::augment(&json, fields)?)?;
        }
        Step::PatchManifestName {
            input,
            name,
            output,
        } => {
            let json = fs::read_to_string(input)
                .with_context(|| format!("reading manifest '{}'", input.display()))?;
            ensure_parent(output)?;
            fs::write(output, manifest::patch_name(&json, name)?)?;
        }
        Step::ConvertManifest { input, output } => {
            let json = fs::read_to_string(input)
                .with_context(|| format!("reading manifest '{}'", input.display()))?;
            ensure_parent(output)?;
            fs::write(output, manifest::encode_proto(&json)?)?;
        }
        Step::StripManifest { input, output } => {
            let json = fs::read_to_string(input)
                .with_context(|| format!("reading manifest '{}'", input.display()))?;
            ensure_parent(output)?;
            fs::write(output, manifest::strip_legacy(&json)?)?;
        }
        Step::CheckAllowedFiles {
            module,
            allowed,
            content,
            stamp,
        } => {
            let allowed_text = fs::read_to_string(allowed)
                .with_context(|| format!("reading allowed files '{}'", allowed.display()))?;
            let content_text = fs::read_to_string(content)
                .with_context(|| format!("reading content list '{}'", content.display()))?;
            layout::check_allowed_files(module, allowed, content, &allowed_text, &content_text)?;
            ensure_parent(stamp)?;
            fs::write(stamp, "")?;
        }
        Step::ListInstalledFiles { root, output } => {
            let listing = image::reports::installed_files(root)?;
            ensure_parent(output)?;
            fs::write(output, listing)?;
        }
        Step::Tool(cmd) => {
            cmd.run()?;
        }
    }
    Ok(())
}

fn append(output: &Path, content: &[u8]) -> Result<()> {
    ensure_parent(output)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(output)
        .with_context(|| format!("opening '{}' for append", output.display()))?;
    file.write_all(content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionSink;
    use crate::process::Cmd;
    use tempfile::TempDir;

    #[test]
    fn test_executes_in_order_and_skips_when_unchanged() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out");
        let src = temp.path().join("libfoo.so");
        fs::write(&src, "elf").unwrap();

        let image = out.join("image");
        let mut graph = ActionGraph::new();
        graph
            .register(
                BuildAction::new("stage", "stage image")
                    .input(&src)
                    .output(&image)
                    .step(Step::RemoveAll(image.clone()))
                    .step(Step::Copy {
                        src: src.clone(),
                        dst: image.join("lib64/libfoo.so"),
                    })
                    .step(Step::Symlink {
                        target: "libfoo.so".into(),
                        link: image.join("lib64/libfoo.so.1"),
                    }),
            )
            .unwrap();

        let exec = LocalExecutor::new(&out);
        let first = exec.execute(&graph).unwrap();
        assert_eq!(first, ExecutionSummary { ran: 1, skipped: 0 });
        assert_eq!(fs::read_to_string(image.join("lib64/libfoo.so")).unwrap(), "elf");
        assert_eq!(
            fs::read_link(image.join("lib64/libfoo.so.1")).unwrap(),
            PathBuf::from("libfoo.so")
        );

        let second = exec.execute(&graph).unwrap();
        assert_eq!(second, ExecutionSummary { ran: 0, skipped: 1 });

        fs::write(&src, "elf2").unwrap();
        let third = exec.execute(&graph).unwrap();
        assert_eq!(third.ran, 1);
    }

    #[test]
    fn test_failed_action_removes_outputs() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out");
        let partial = out.join("partial.txt");

        let mut graph = ActionGraph::new();
        graph
            .register(
                BuildAction::new("broken", "broken tool")
                    .output(&partial)
                    .step(Step::WriteFile {
                        path: partial.clone(),
                        content: "half".into(),
                    })
                    .step(Step::Tool(Cmd::new("false"))),
            )
            .unwrap();

        let err = LocalExecutor::new(&out).execute(&graph).unwrap_err();
        assert!(format!("{:#}", err).contains("action 'broken' failed"));
        assert_eq!(err.downcast_ref::<ActionFailed>().unwrap().rule, "broken");
        assert!(!partial.exists());
    }

    #[test]
    fn test_failed_rerun_clears_stamp() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out");
        let status = temp.path().join("status");
        let result = out.join("result.txt");
        fs::write(&status, "0").unwrap();

        let mut graph = ActionGraph::new();
        graph
            .register(
                BuildAction::new("check", "check status")
                    .input(&status)
                    .output(&result)
                    .step(Step::Copy {
                        src: status.clone(),
                        dst: result.clone(),
                    })
                    .step(Step::Tool(
                        Cmd::new("sh").arg("-c").arg_file_contents("exit ", &status),
                    )),
            )
            .unwrap();

        let exec = LocalExecutor::new(&out);
        exec.execute(&graph).unwrap();
        let stamp = exec.stamp_path(graph.find("check").unwrap());
        assert!(stamp.exists());

        fs::write(&status, "1").unwrap();
        assert!(exec.execute(&graph).is_err());
        assert!(!stamp.exists());
        assert!(!result.exists());
    }

    #[test]
    fn test_missing_input_fails_before_running() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out");
        let mut graph = ActionGraph::new();
        graph
            .register(
                BuildAction::new("copy", "copy")
                    .input(temp.path().join("absent"))
                    .output(out.join("x")),
            )
            .unwrap();

        let err = LocalExecutor::new(&out).execute(&graph).unwrap_err();
        assert!(err.to_string().contains("missing input"));
    }

    #[test]
    fn test_append_concatenates() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("base");
        let extra = temp.path().join("extra");
        fs::write(&base, "/ 1000 1000 0755\n").unwrap();
        fs::write(&extra, "/bin/foo 0 2000 0750\n").unwrap();

        run_step(&Step::Append {
            input: extra,
            output: base.clone(),
        })
        .unwrap();
        assert_eq!(
            fs::read_to_string(base).unwrap(),
            "/ 1000 1000 0755\n/bin/foo 0 2000 0750\n"
        );
    }
}
