//! The file record placed into a container.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::graph::{DataFile, Multilib};

/// Kind of artifact, which drives install dir and permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileClass {
    NativeSharedLib,
    NativeExecutable,
    NativeTest,
    JavaSharedLib,
    App,
    AppSet,
    Etc,
    ShBinary,
}

impl fmt::Display for FileClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileClass::NativeSharedLib => "nativeSharedLib",
            FileClass::NativeExecutable => "nativeExecutable",
            FileClass::NativeTest => "nativeTest",
            FileClass::JavaSharedLib => "javaSharedLib",
            FileClass::App => "app",
            FileClass::AppSet => "appSet",
            FileClass::Etc => "etc",
            FileClass::ShBinary => "shBinary",
        };
        write!(f, "{}", s)
    }
}

/// How a module came to be reachable from the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Listed in the container declaration.
    DirectContent,
    /// Pulled in through a library edge and packaged.
    TransitiveRuntime,
    /// Stub library provided from outside; required, not packaged.
    TransitiveStubExternal,
    /// Stub library that is also direct content; linked as implementation.
    TransitiveStubInternal,
}

impl DependencyKind {
    pub fn is_transitive(self) -> bool {
        !matches!(self, DependencyKind::DirectContent)
    }

    pub fn is_external(self) -> bool {
        matches!(self, DependencyKind::TransitiveStubExternal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApexFile {
    pub built_file: PathBuf,
    pub install_dir: String,
    pub stem: String,
    pub class: FileClass,
    pub module_name: Option<String>,
    pub symlinks: Vec<String>,
    #[serde(skip)]
    pub data_files: Vec<DataFile>,
    pub transitive_dep: bool,
    pub available_to_platform: bool,
    pub is_jni_lib: bool,
    pub overridden_package_name: Option<String>,
    pub multilib: Option<Multilib>,
    pub partition: String,
    pub dependency_kind: DependencyKind,
    /// Store a symlink to the platform copy instead of the file.
    pub link_to_platform: bool,
    /// Extra APKs of an app set, unzipped next to the base APK.
    pub app_set_archive: Option<PathBuf>,
}

impl ApexFile {
    pub fn new(
        built_file: impl AsRef<Path>,
        install_dir: impl Into<String>,
        stem: impl Into<String>,
        class: FileClass,
    ) -> Self {
        Self {
            built_file: built_file.as_ref().to_path_buf(),
            install_dir: install_dir.into(),
            stem: stem.into(),
            class,
            module_name: None,
            symlinks: Vec::new(),
            data_files: Vec::new(),
            transitive_dep: false,
            available_to_platform: false,
            is_jni_lib: false,
            overridden_package_name: None,
            multilib: None,
            partition: "system".to_string(),
            dependency_kind: DependencyKind::DirectContent,
            link_to_platform: false,
            app_set_archive: None,
        }
    }

    /// Path relative to the container root.
    pub fn path(&self) -> String {
        join(&self.install_dir, &self.stem)
    }

    pub fn symlink_paths(&self) -> Vec<String> {
        self.symlinks
            .iter()
            .map(|s| join(&self.install_dir, s))
            .collect()
    }

    pub fn data_paths(&self) -> Vec<String> {
        self.data_files
            .iter()
            .map(|d| join(&self.install_dir, &d.rel))
            .collect()
    }

    /// Where the platform copy of this file lives on device.
    pub fn platform_path(&self) -> String {
        format!("/{}/{}", self.partition, self.path())
    }

    pub fn in_executable_dir(&self) -> bool {
        self.install_dir == "bin" || self.install_dir.starts_with("bin/")
    }

    /// Entries with the same key are the same file and collapse into one.
    pub(crate) fn dedup_key(&self) -> (String, PathBuf) {
        (self.path(), self.built_file.clone())
    }
}

pub(crate) fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}
