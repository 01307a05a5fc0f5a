//! SELinux labels for the container image.

use std::path::PathBuf;

use crate::action::{BuildAction, Step};
use crate::config::BuildInput;
use crate::paths::OutPaths;

const SYSTEM_FILE: &str = "u:object_r:system_file:s0";
const VENDOR_FILE: &str = "u:object_r:vendor_file:s0";
const VENDOR_APEX_METADATA_FILE: &str = "u:object_r:vendor_apex_metadata_file:s0";

/// Declared file_contexts, or the per-container default under sepolicy.
pub fn source(input: &BuildInput) -> PathBuf {
    input.apex.file_contexts.clone().unwrap_or_else(|| {
        input
            .base_dir
            .join("system/sepolicy/apex")
            .join(format!("{}-file_contexts", input.apex.name))
    })
}

/// Labels forced onto the manifest and the image root.
pub fn forced_labels(vendor: bool) -> String {
    let (root, manifest) = if vendor {
        (VENDOR_FILE, VENDOR_APEX_METADATA_FILE)
    } else {
        (SYSTEM_FILE, SYSTEM_FILE)
    };
    format!("/apex_manifest\\.pb {}\n/ {}\n", manifest, root)
}

pub fn plan(input: &BuildInput, paths: &OutPaths) -> BuildAction {
    let src = source(input);
    let out = paths.file_contexts();

    let mut action = BuildAction::new("file_contexts", format!("generate {}", out.display()))
        .input(&src)
        .output(&out)
        .step(Step::RemoveAll(out.clone()))
        .step(Step::Append {
            input: src,
            output: out.clone(),
        })
        .step(Step::AppendText {
            content: "\n".to_string(),
            output: out.clone(),
        });
    if !input.apex.use_file_contexts_as_is {
        action = action.step(Step::AppendText {
            content: forced_labels(input.apex.vendor),
            output: out,
        });
    }
    action
}
