//! Reports computed from the staged image.
//!
//! None of these gate signing; they hang off the unsigned image only.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use crate::action::{BuildAction, Step};
use crate::paths::OutPaths;
use crate::preflight::HostTools;
use crate::selector::{FileClass, Selection};

/// `<size> ./<path>` for every regular file and symlink under `root`,
/// largest first.
pub fn installed_files(root: &Path) -> Result<String> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("walking '{}'", root.display()))?;
        let file_type = entry.file_type();
        if !file_type.is_file() && !file_type.is_symlink() {
            continue;
        }
        let size = fs::symlink_metadata(entry.path())
            .with_context(|| format!("reading metadata of '{}'", entry.path().display()))?
            .len();
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("'{}' is outside the image", entry.path().display()))?;
        entries.push((size, rel.to_string_lossy().into_owned()));
    }
    entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    let mut out = String::new();
    for (size, path) in entries {
        out.push_str(&format!("{} ./{}\n", size, path));
    }
    Ok(out)
}

pub fn plan(selection: &Selection, paths: &OutPaths, tools: &HostTools) -> Vec<BuildAction> {
    let image_dir = paths.image_dir();
    let unsigned = paths.unsigned();

    let using = paths.using_txt();
    let ndk_used_by = BuildAction::new("ndk_usedby_list", "coverage")
        .input(&unsigned)
        .input(&image_dir)
        .output(&using)
        .step(Step::Tool(
            tools
                .cmd("gen_ndk_usedby_apex.sh")
                .arg_path(&image_dir)
                .arg(tools.path("readelf"))
                .arg_path(&using),
        ));

    let backing = paths.backing_txt();
    let native_libs = selection
        .files
        .iter()
        .filter(|f| f.class == FileClass::NativeSharedLib)
        .map(|f| f.stem.clone());
    let ndk_backed_by = BuildAction::new(
        "ndk_backedby_list",
        "Generate API libraries backed by Apex",
    )
    .input(&unsigned)
    .output(&backing)
    .step(Step::Tool(
        tools
            .cmd("gen_ndk_backedby_apex.sh")
            .arg_path(&backing)
            .args(native_libs),
    ));

    let using_xml = paths.using_xml();
    let java_files: Vec<_> = selection
        .files
        .iter()
        .filter(|f| matches!(f.class, FileClass::JavaSharedLib | FileClass::App))
        .map(|f| f.built_file.clone())
        .collect();
    let mut java_cmd = tools
        .cmd("gen_java_usedby_apex.sh")
        .arg(tools.path("dexdeps"))
        .arg_path(&using_xml);
    for file in &java_files {
        java_cmd = java_cmd.arg_path(file);
    }
    let java_used_by = BuildAction::new("java_usedby_list", "Generate Java APIs used by Apex")
        .input(&unsigned)
        .inputs(java_files)
        .output(&using_xml)
        .step(Step::Tool(java_cmd));

    vec![ndk_used_by, ndk_backed_by, java_used_by]
}

/// installed-files list of the final artifact's image.
pub fn installed_files_action(paths: &OutPaths, artifact: &Path) -> BuildAction {
    let output = paths.installed_files();
    BuildAction::new("installed_files", format!("write {}", output.display()))
        .input(artifact)
        .input(paths.image_dir())
        .output(&output)
        .step(Step::ListInstalledFiles {
            root: paths.image_dir(),
            output,
        })
}
