//! Resolved module graph consumed by the file selector.
//!
//! The host build system resolves dependency edges; this module only holds
//! the result: one [`ModuleDecl`] per module, keyed by name, with its built
//! files per architecture and its outgoing library edges.

pub mod stubs;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ApexError;
pub use stubs::{resolve_link, LinkTarget, StubVersion};

/// Availability marker allowing a module in every container.
pub const AVAILABLE_ANY_APEX: &str = "//apex_available:anyapex";
/// Availability marker for modules that also ship in the base image.
pub const AVAILABLE_PLATFORM: &str = "//apex_available:platform";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    Arm64,
    Arm,
    X86_64,
    X86,
}

impl Arch {
    pub fn multilib(self) -> Multilib {
        match self {
            Arch::Arm64 | Arch::X86_64 => Multilib::Lib64,
            Arch::Arm | Arch::X86 => Multilib::Lib32,
        }
    }

    /// ABI name used inside bundles.
    pub fn abi(self) -> &'static str {
        match self {
            Arch::Arm64 => "arm64-v8a",
            Arch::Arm => "armeabi-v7a",
            Arch::X86_64 => "x86_64",
            Arch::X86 => "x86",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
            Arch::X86_64 => "x86_64",
            Arch::X86 => "x86",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Multilib {
    Lib32,
    Lib64,
}

impl Multilib {
    pub fn lib_dir(self) -> &'static str {
        match self {
            Multilib::Lib32 => "lib",
            Multilib::Lib64 => "lib64",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    CcLibrary,
    CcBinary,
    CcTest,
    ShBinary,
    JavaLibrary,
    App,
    AppSet,
    Prebuilt,
}

impl ModuleKind {
    /// Native modules have one variant per target architecture.
    pub fn is_native(self) -> bool {
        matches!(self, ModuleKind::CcLibrary | ModuleKind::CcBinary | ModuleKind::CcTest)
    }
}

/// An outgoing library edge, written `name` or `name@version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DepEdge {
    pub name: String,
    pub version: Option<StubVersion>,
}

impl FromStr for DepEdge {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, version) = match s.split_once('@') {
            Some((name, version)) => (name, Some(version.parse::<StubVersion>()?)),
            None => (s, None),
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(format!("empty module name in dependency '{}'", s));
        }
        Ok(Self {
            name: name.to_string(),
            version,
        })
    }
}

/// Edge kinds a native module can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepTag {
    Shared,
    Runtime,
    Static,
}

impl DepTag {
    pub fn property(self) -> &'static str {
        match self {
            DepTag::Shared => "shared_libs",
            DepTag::Runtime => "runtime_libs",
            DepTag::Static => "static_libs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFile {
    pub src: PathBuf,
    /// Path relative to the owning file's install dir.
    pub rel: String,
}

#[derive(Debug, Clone)]
pub struct ModuleDecl {
    pub name: String,
    pub kind: ModuleKind,
    pub srcs: BTreeMap<Arch, PathBuf>,
    pub src: Option<PathBuf>,
    pub stem: Option<String>,
    pub relative_install_path: Option<String>,
    pub sub_dir: Option<String>,
    pub shared_libs: Vec<DepEdge>,
    pub runtime_libs: Vec<DepEdge>,
    pub static_libs: Vec<DepEdge>,
    pub stubs_versions: Vec<StubVersion>,
    pub apex_available: Vec<String>,
    pub symlinks: Vec<String>,
    pub data: Vec<DataFile>,
    pub package_name: Option<String>,
    pub privileged: bool,
    pub min_sdk_version: Option<String>,
    /// Partition of the platform copy; defaults to the container's.
    pub partition: Option<String>,
    pub notice: Option<PathBuf>,
    pub lint_report: Option<PathBuf>,
    /// Zip of the extra APKs of an app set, unpacked next to the base APK.
    pub packed_additional_outputs: Option<PathBuf>,
}

impl ModuleDecl {
    pub fn new(name: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            name: name.into(),
            kind,
            srcs: BTreeMap::new(),
            src: None,
            stem: None,
            relative_install_path: None,
            sub_dir: None,
            shared_libs: Vec::new(),
            runtime_libs: Vec::new(),
            static_libs: Vec::new(),
            stubs_versions: Vec::new(),
            apex_available: Vec::new(),
            symlinks: Vec::new(),
            data: Vec::new(),
            package_name: None,
            privileged: false,
            min_sdk_version: None,
            partition: None,
            notice: None,
            lint_report: None,
            packed_additional_outputs: None,
        }
    }

    pub fn has_stubs(&self) -> bool {
        !self.stubs_versions.is_empty()
    }

    /// Output file name inside the container, before any ApexFile override.
    pub fn stem(&self) -> String {
        if let Some(stem) = &self.stem {
            return stem.clone();
        }
        match self.kind {
            ModuleKind::CcLibrary => format!("{}.so", self.name),
            ModuleKind::JavaLibrary => format!("{}.jar", self.name),
            ModuleKind::App | ModuleKind::AppSet => format!("{}.apk", self.name),
            ModuleKind::Prebuilt => self
                .src
                .as_deref()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.name.clone()),
            _ => self.name.clone(),
        }
    }

    pub fn is_available_for(&self, apex: &str) -> bool {
        self.apex_available
            .iter()
            .any(|a| a == apex || a == AVAILABLE_ANY_APEX)
    }

    pub fn available_to_platform(&self) -> bool {
        self.apex_available.is_empty() || self.apex_available.iter().any(|a| a == AVAILABLE_PLATFORM)
    }

    /// Outgoing library edges in declaration order.
    pub fn edges(&self) -> impl Iterator<Item = (DepTag, &DepEdge)> {
        self.shared_libs
            .iter()
            .map(|e| (DepTag::Shared, e))
            .chain(self.runtime_libs.iter().map(|e| (DepTag::Runtime, e)))
            .chain(self.static_libs.iter().map(|e| (DepTag::Static, e)))
    }

    /// Built artifact for `arch`, or the arch-independent source.
    pub fn built_file(&self, arch: Option<Arch>) -> Result<&Path> {
        if !self.srcs.is_empty() {
            let arch_name = arch.map(Arch::name).unwrap_or("common");
            return arch
                .and_then(|a| self.srcs.get(&a))
                .map(PathBuf::as_path)
                .ok_or_else(|| {
                    ApexError::config(
                        &self.name,
                        "srcs",
                        format!("unsupported architecture '{}' for a prebuilt source", arch_name),
                    )
                    .into()
                });
        }
        self.src.as_deref().ok_or_else(|| {
            ApexError::config(&self.name, "src", "no built file declared").into()
        })
    }
}

/// All modules reachable from a container, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ModuleGraph {
    modules: BTreeMap<String, ModuleDecl>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, module: ModuleDecl) {
        self.modules.insert(module.name.clone(), module);
    }

    pub fn get(&self, name: &str) -> Option<&ModuleDecl> {
        self.modules.get(name)
    }

    /// Look up `name`, attributing a missing module to the referencing property.
    pub fn require(&self, owner: &str, property: &str, name: &str) -> Result<&ModuleDecl> {
        self.modules.get(name).ok_or_else(|| {
            ApexError::config(owner, property, format!("depends on undefined module '{}'", name))
                .into()
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleDecl> {
        self.modules.values()
    }
}
