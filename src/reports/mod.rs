//! Side outputs of a container build: dependency info, notices, lint
//! report list, and the signing key entry for release tooling.

use anyhow::Result;
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::action::{BuildAction, Step};
use crate::config::BuildInput;
use crate::paths::OutPaths;
use crate::preflight::HostTools;
use crate::selector::{DepInfo, Selection};
use crate::sign::{self, SignedArtifact};

const NO_VERSION: &str = "(no version)";

fn dep_label(dep: &DepInfo) -> String {
    let mut label = format!(
        "{}(minSdkVersion:{})",
        dep.name,
        dep.min_sdk_version.as_deref().unwrap_or(NO_VERSION)
    );
    if dep.external {
        label.push_str(" (external)");
    }
    label
}

/// Full and flat dependency lists, in that order.
pub fn deps_info_lists(input: &BuildInput, selection: &Selection) -> (String, String) {
    let apex = &input.apex;
    let mut full = format!(
        "{}(minSdkVersion:{}):\n",
        apex.name,
        apex.min_sdk_version.as_deref().unwrap_or("current")
    );
    let mut flat = String::new();

    let mut deps: Vec<&DepInfo> = selection.deps_info.iter().collect();
    deps.sort_by(|a, b| a.name.cmp(&b.name));
    for dep in deps {
        let label = dep_label(dep);
        let from: Vec<&str> = dep.from.iter().map(String::as_str).collect();
        full.push_str(&format!("  {} <- {}\n", label, from.join(", ")));
        flat.push_str(&label);
        flat.push('\n');
    }
    (full, flat)
}

/// Notice files of packaged modules, deduplicated, in module order.
pub fn notice_files(input: &BuildInput, selection: &Selection) -> Vec<PathBuf> {
    let mut seen = BTreeSet::new();
    selection
        .module_names()
        .into_iter()
        .filter_map(|name| input.modules.get(name))
        .filter_map(|m| m.notice.clone())
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

/// Sorted lint report paths of packaged modules, one per line.
pub fn lint_report_list(input: &BuildInput, selection: &Selection) -> String {
    let reports: BTreeSet<String> = selection
        .module_names()
        .into_iter()
        .filter_map(|name| input.modules.get(name))
        .filter_map(|m| m.lint_report.as_ref())
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    let mut out = String::new();
    for report in reports {
        out.push_str(&report);
        out.push('\n');
    }
    out
}

/// The `apexkeys.txt` line for this container.
pub fn apexkeys_entry(input: &BuildInput, artifact: &SignedArtifact) -> Result<String> {
    let key = input.key()?;
    let cert = sign::resolve_certificate(input)?;
    Ok(format!(
        "name=\"{}{}\" public_key=\"{}\" private_key=\"{}\" container_certificate=\"{}\" container_private_key=\"{}\" partition=\"{}\"\n",
        input.apex.name,
        artifact.suffix,
        key.public_key.display(),
        key.private_key.display(),
        cert.pem.display(),
        cert.key.display(),
        input.apex.partition
    ))
}

/// Plan the notice bundle; `None` when no packaged module declares one.
pub fn plan_notice(
    input: &BuildInput,
    selection: &Selection,
    paths: &OutPaths,
    tools: &HostTools,
) -> Option<BuildAction> {
    let notices = notice_files(input, selection);
    if notices.is_empty() {
        tracing::warn!(apex = %input.apex.name, "no notice files; container ships without NOTICE.html.gz");
        return None;
    }

    let html = paths.notice_html();
    let gz = paths.notice_gz();
    let mut action = BuildAction::new("notice", format!("generate {}", gz.display()))
        .inputs(&notices)
        .output(&html)
        .output(&gz)
        .step(Step::RemoveAll(html.clone()));
    for notice in &notices {
        action = action.step(Step::Append {
            input: notice.clone(),
            output: html.clone(),
        });
    }
    Some(action.step(Step::Tool(
        tools
            .cmd("gzip")
            .arg("-9n")
            .arg("-c")
            .arg_path(&html)
            .stdout_to(&gz),
    )))
}

/// Plan dependency info, lint list and key entry outputs.
pub fn plan(
    input: &BuildInput,
    selection: &Selection,
    paths: &OutPaths,
    artifact: &SignedArtifact,
) -> Result<Vec<BuildAction>> {
    let (full, flat) = deps_info_lists(input, selection);
    let full_path = paths.deps_full_list();
    let flat_path = paths.deps_flat_list();
    let deps = BuildAction::new("deps_info", format!("{}-deps-info", input.apex.name))
        .output(&full_path)
        .output(&flat_path)
        .step(Step::WriteFile {
            path: full_path.clone(),
            content: full,
        })
        .step(Step::WriteFile {
            path: flat_path.clone(),
            content: flat,
        });

    let lint_path = paths.lint_reports();
    let lint = BuildAction::new("lint_reports", format!("write {}", lint_path.display()))
        .output(&lint_path)
        .step(Step::WriteFile {
            path: lint_path.clone(),
            content: lint_report_list(input, selection),
        });

    let keys_path = paths.apexkeys();
    let keys = BuildAction::new("apexkeys", format!("write {}", keys_path.display()))
        .output(&keys_path)
        .step(Step::WriteFile {
            path: keys_path.clone(),
            content: apexkeys_entry(input, artifact)?,
        });

    Ok(vec![deps, lint, keys])
}
