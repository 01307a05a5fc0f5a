//! Host tool resolution and preflight checks.
//!
//! Validates that the host has every tool a container build will invoke
//! before anything runs, so a missing tool is reported up front instead of
//! halfway through a build.
//!
//! # Example
//!
//! ```rust
//! use apex_builder::preflight::{check_required_tools, HostTools};
//!
//! let tools = HostTools::new(None);
//! if !tools.exists("apexer") {
//!     println!("apexer not on PATH");
//! }
//!
//! if let Err(e) = check_required_tools(&tools, &[("apexer", "apexer"), ("aapt2", "aapt2")]) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::config::{BuildInput, ImageVariant, PayloadFsType};
use crate::process::{self, Cmd};

/// Tools every container build invokes.
///
/// Each tuple is (command_name, providing_module).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("apexer", "apexer"),
    ("aapt2", "aapt2"),
    ("zip2zip", "zip2zip"),
    ("soong_zip", "soong_zip"),
    ("merge_zips", "merge_zips"),
    ("signapk", "signapk"),
    ("gen_ndk_usedby_apex.sh", "build/soong/scripts"),
    ("gen_ndk_backedby_apex.sh", "build/soong/scripts"),
    ("gen_java_usedby_apex.sh", "build/soong/scripts"),
    ("dexdeps", "dexdeps"),
    ("readelf", "llvm-readelf"),
];

/// Tools apexer spawns on its own, found through `APEXER_TOOL_PATH` or PATH.
pub const APEXER_HELPERS: &[(&str, &str)] = &[
    ("avbtool", "avbtool"),
    ("e2fsdroid", "e2fsprogs"),
    ("mke2fs", "e2fsprogs"),
    ("resize2fs", "e2fsprogs"),
    ("sefcontext_compile", "libselinux"),
    ("zipalign", "zipalign"),
];

/// Filesystem builders apexer needs for a payload type other than ext4.
fn payload_fs_tools(fs_type: PayloadFsType) -> &'static [(&'static str, &'static str)] {
    match fs_type {
        PayloadFsType::Ext4 => &[],
        PayloadFsType::F2fs => &[("make_f2fs", "f2fs-tools"), ("sload_f2fs", "f2fs-tools")],
        PayloadFsType::Erofs => &[("make_erofs", "erofs-utils")],
    }
}

/// Resolves tool names against an optional host tool directory, then PATH.
#[derive(Debug, Clone, Default)]
pub struct HostTools {
    dir: Option<PathBuf>,
}

impl HostTools {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    /// Program to invoke for `tool`.
    pub fn path(&self, tool: &str) -> String {
        self.dir
            .as_ref()
            .map(|d| d.join(tool))
            .filter(|p| p.is_file())
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| tool.to_string())
    }

    pub fn cmd(&self, tool: &str) -> Cmd {
        Cmd::new(self.path(tool))
    }

    pub fn exists(&self, tool: &str) -> bool {
        self.dir.as_ref().map(|d| d.join(tool).is_file()).unwrap_or(false)
            || process::exists(tool)
    }

    /// Search path handed to tools that spawn further tools.
    pub fn search_path(&self) -> Option<String> {
        self.dir.as_ref().map(|d| d.to_string_lossy().into_owned())
    }
}

/// Tools needed by one container build, on top of [`REQUIRED_TOOLS`].
pub fn tools_for(input: &BuildInput) -> Vec<(&'static str, &'static str)> {
    let mut tools = REQUIRED_TOOLS.to_vec();
    tools.extend_from_slice(APEXER_HELPERS);
    tools.extend_from_slice(payload_fs_tools(input.apex.payload_fs_type));
    match input.apex.image_variant {
        ImageVariant::Plain => {}
        ImageVariant::DedupCommonLibs => tools.push((
            "apexer_with_DCLA_preprocessing",
            "apexer_with_DCLA_preprocessing",
        )),
        ImageVariant::Trimmed => tools.push((
            "apexer_with_trim_preprocessing",
            "apexer_with_trim_preprocessing",
        )),
    }
    if crate::sign::should_compress(&input.product, &input.apex) {
        tools.push(("apex_compression_tool", "apex_compression_tool"));
    }
    tools.push(("gzip", "gzip"));
    tools
}

/// Check that specific tools are available.
///
/// Every missing tool is reported at once, with the module that provides it.
pub fn check_required_tools(host: &HostTools, tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !host.exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (provided by: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check every tool the build of `input` will invoke.
pub fn check_host_tools(input: &BuildInput) -> Result<()> {
    let host = HostTools::new(input.product.host_tool_dir.clone());
    check_required_tools(&host, &tools_for(input))
}
