//! Output locations of one container build.

use std::path::{Path, PathBuf};

pub const APEX_SUFFIX: &str = ".apex";
pub const COMPRESSED_APEX_SUFFIX: &str = ".capex";
pub const FLATTENED_SUFFIX: &str = ".flattened";

/// Every intermediate and final path of one container, under `<out_dir>/<name>/`.
#[derive(Debug, Clone)]
pub struct OutPaths {
    name: String,
    root: PathBuf,
    install_root: PathBuf,
}

impl OutPaths {
    pub fn new(out_dir: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            root: out_dir.join(name),
            install_root: out_dir.join("install"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.root.join(format!("{}{}", self.name, suffix))
    }

    pub fn image_dir(&self) -> PathBuf {
        self.root.join("image.apex")
    }

    pub fn manifest_full(&self) -> PathBuf {
        self.root.join("apex_manifest_full.json")
    }

    pub fn manifest_pb(&self) -> PathBuf {
        self.root.join("apex_manifest.pb")
    }

    /// Stripped manifest for runtimes that predate the protobuf form.
    pub fn manifest_legacy(&self) -> PathBuf {
        self.root.join("apex_manifest.json")
    }

    pub fn file_contexts(&self) -> PathBuf {
        self.root.join("file_contexts")
    }

    pub fn canned_fs_config(&self) -> PathBuf {
        self.root.join("canned_fs_config")
    }

    pub fn content_list(&self) -> PathBuf {
        self.root.join("content.txt")
    }

    pub fn allowed_files_stamp(&self) -> PathBuf {
        self.root.join("allowed_files.stamp")
    }

    pub fn notice_html(&self) -> PathBuf {
        self.root.join("NOTICE.html")
    }

    pub fn notice_dir(&self) -> PathBuf {
        self.root.join("notice")
    }

    pub fn notice_gz(&self) -> PathBuf {
        self.notice_dir().join("NOTICE.html.gz")
    }

    pub fn unsigned(&self) -> PathBuf {
        self.file(".apex.unsigned")
    }

    pub fn proto(&self) -> PathBuf {
        self.file(".pb.apex")
    }

    pub fn bundle_config(&self) -> PathBuf {
        self.root.join("bundle_config.json")
    }

    pub fn bundle(&self) -> PathBuf {
        self.file(".apex-base.zip")
    }

    pub fn signed(&self) -> PathBuf {
        self.file(APEX_SUFFIX)
    }

    pub fn compressed_unsigned(&self) -> PathBuf {
        self.file(".capex.unsigned")
    }

    pub fn compressed(&self) -> PathBuf {
        self.file(COMPRESSED_APEX_SUFFIX)
    }

    pub fn using_txt(&self) -> PathBuf {
        self.file("_using.txt")
    }

    pub fn backing_txt(&self) -> PathBuf {
        self.file("_backing.txt")
    }

    pub fn using_xml(&self) -> PathBuf {
        self.file("_using.xml")
    }

    pub fn installed_files(&self) -> PathBuf {
        self.root.join(format!("installed-files-{}.txt", self.name))
    }

    pub fn deps_full_list(&self) -> PathBuf {
        self.root.join("depsinfo").join("fulllist.txt")
    }

    pub fn deps_flat_list(&self) -> PathBuf {
        self.root.join("depsinfo").join("flatlist.txt")
    }

    pub fn lint_reports(&self) -> PathBuf {
        self.root.join("lint-report-list.txt")
    }

    pub fn apexkeys(&self) -> PathBuf {
        self.root.join("apexkeys.txt")
    }

    /// Device-shaped tree that install actions populate.
    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    pub fn flattened_marker(&self) -> PathBuf {
        self.file(FLATTENED_SUFFIX)
    }
}
