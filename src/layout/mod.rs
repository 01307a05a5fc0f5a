//! Filesystem layout of the container image.
//!
//! Produces the canned fs config consumed by the packaging tool (ownership
//! and mode of every path), the content list checked against a declared
//! allow-list, and the SELinux file_contexts.

pub mod file_contexts;

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::action::{BuildAction, Step};
use crate::config::BuildInput;
use crate::error::ApexError;
use crate::paths::OutPaths;
use crate::selector::{FileClass, Selection};

const ROOT_ENTRY: &str = "/ 1000 1000 0755";
const DEFAULT_READ_ONLY: &[&str] = &["apex_manifest.json", "apex_manifest.pb"];
const ALLOWED_LIST_TOOL: &str = "system/apex/tools/update_allowed_list.sh";

fn read_only_line(path: &str) -> String {
    format!("/{} 1000 1000 0644\n", path)
}

fn executable_line(path: &str) -> String {
    format!("/{} 0 2000 0755\n", path)
}

/// Ownership and mode classes of every path in the image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsConfig {
    pub read_only: BTreeSet<String>,
    /// Executables and every directory.
    pub executable: BTreeSet<String>,
    /// App-set install dirs and the archives whose members land in them.
    pub app_sets: Vec<(String, PathBuf)>,
}

impl FsConfig {
    pub fn from_selection(selection: &Selection) -> Self {
        let mut config = FsConfig::default();
        config
            .read_only
            .extend(DEFAULT_READ_ONLY.iter().map(|s| s.to_string()));

        for file in &selection.files {
            if file.in_executable_dir() {
                config.executable.insert(file.path());
                config.read_only.extend(file.data_paths());
                config.executable.extend(file.symlink_paths());
            } else if file.class == FileClass::AppSet {
                config.read_only.insert(file.path());
                if let Some(archive) = &file.app_set_archive {
                    config
                        .app_sets
                        .push((file.install_dir.clone(), archive.clone()));
                }
            } else {
                config.read_only.insert(file.path());
            }

            let mut dir = file.install_dir.as_str();
            while !dir.is_empty() && config.executable.insert(dir.to_string()) {
                dir = dir.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("");
            }
        }
        config.app_sets.sort();
        config
    }

    /// Everything before the app-set member listings.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(ROOT_ENTRY);
        out.push('\n');
        for path in &self.read_only {
            out.push_str(&read_only_line(path));
        }
        for path in &self.executable {
            out.push_str(&executable_line(path));
        }
        out
    }
}

/// Fs config lines for an app-set dir and every member of its archive.
pub fn app_set_entries(archive: &Path, dir: &str) -> Result<String> {
    let file = File::open(archive)
        .with_context(|| format!("opening app set archive '{}'", archive.display()))?;
    let zip = zip::ZipArchive::new(file)
        .with_context(|| format!("reading app set archive '{}'", archive.display()))?;

    let mut out = executable_line(dir);
    for name in zip.file_names() {
        out.push_str(&read_only_line(&format!("{}/{}", dir, name)));
    }
    Ok(out)
}

/// Content list compared against the allow-list.
pub fn content_list(selection: &Selection, legacy_manifest: bool) -> String {
    let mut lines = vec!["./apex_manifest.pb".to_string()];
    if legacy_manifest {
        lines.push("./apex_manifest.json".to_string());
    }
    lines.extend(selection.files.iter().map(|f| format!("./{}", f.path())));
    lines.sort();
    lines.join("\n")
}

/// Lines of `content` inside changed regions against `allowed`.
fn changed_lines<'a>(content: &[&'a str], allowed: &[&str]) -> (bool, Vec<&'a str>) {
    let (n, m) = (content.len(), allowed.len());
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if content[i] == allowed[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    let mut differs = false;
    let mut changed = Vec::new();
    while i < n || j < m {
        if i < n && j < m && content[i] == allowed[j] {
            i += 1;
            j += 1;
        } else if j == m || (i < n && lcs[i + 1][j] >= lcs[i][j + 1]) {
            differs = true;
            changed.push(content[i]);
            i += 1;
        } else {
            differs = true;
            j += 1;
        }
    }
    (differs, changed)
}

/// Fail when the content list differs from the allow-list.
pub fn check_allowed_files(
    module: &str,
    allowed_path: &Path,
    content_path: &Path,
    allowed: &str,
    content: &str,
) -> Result<()> {
    let content_lines: Vec<&str> = content.lines().collect();
    let allowed_lines: Vec<&str> = allowed.lines().collect();
    let (differs, changed) = changed_lines(&content_lines, &allowed_lines);
    if !differs {
        return Ok(());
    }

    let mut message = format!(
        "New unexpected files were added to {}. To fix the build run following command:\n{} {} {}",
        module,
        ALLOWED_LIST_TOOL,
        allowed_path.display(),
        content_path.display()
    );
    for line in changed {
        message.push('\n');
        message.push_str(line);
    }
    Err(ApexError::drift(module, message).into())
}

/// Plan the layout actions of one container.
pub fn plan(input: &BuildInput, selection: &Selection, paths: &OutPaths) -> Result<Vec<BuildAction>> {
    let apex = &input.apex;
    let fs_config = FsConfig::from_selection(selection);
    let out = paths.canned_fs_config();

    let mut canned = BuildAction::new(
        "canned_fs_config",
        format!("generating canned fs config for {}", apex.name),
    )
    .output(&out)
    .step(Step::WriteFile {
        path: out.clone(),
        content: fs_config.render(),
    });
    for (dir, archive) in &fs_config.app_sets {
        canned = canned.input(archive).step(Step::AppendZipListing {
            archive: archive.clone(),
            dir: dir.clone(),
            output: out.clone(),
        });
    }
    // Entries appended last win over the generated defaults.
    if let Some(custom) = &apex.canned_fs_config {
        canned = canned.input(custom).step(Step::Append {
            input: custom.clone(),
            output: out.clone(),
        });
    }

    let mut actions = vec![file_contexts::plan(input, paths), canned];

    if let Some(allowed) = &apex.allowed_files {
        let content = paths.content_list();
        let stamp = paths.allowed_files_stamp();
        actions.push(
            BuildAction::new("content_list", format!("write {}", content.display()))
                .output(&content)
                .step(Step::WriteFile {
                    path: content.clone(),
                    content: content_list(selection, apex.needs_legacy_manifest()?),
                }),
        );
        actions.push(
            BuildAction::new("diff_apex_content", "diff apex image content")
                .input(&content)
                .input(allowed)
                .output(&stamp)
                .step(Step::CheckAllowedFiles {
                    module: apex.name.clone(),
                    allowed: allowed.clone(),
                    content: content.clone(),
                    stamp: stamp.clone(),
                }),
        );
    }
    Ok(actions)
}
