//! TOML build description.
//!
//! One file describes the product policy, one container, its signing
//! material, and the already-resolved module graph it draws from. Relative
//! paths are resolved against the directory holding the file.
//!
//! ```toml
//! [product]
//! targets = ["arm64", "arm"]
//! compression_enabled = true
//!
//! [apex]
//! name = "com.android.foo"
//! key = "com.android.foo.key"
//! native_shared_libs = ["libfoo"]
//! binaries = ["foo"]
//!
//! [keys."com.android.foo.key"]
//! public_key = "keys/foo.avbpubkey"
//! private_key = "keys/foo.pem"
//!
//! [modules.libfoo]
//! kind = "cc_library"
//! srcs = { arm64 = "out/arm64/libfoo.so", arm = "out/arm/libfoo.so" }
//! shared_libs = ["libc@29"]
//! apex_available = ["com.android.foo"]
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ApexError;
use crate::graph::{Arch, DataFile, DepEdge, ModuleDecl, ModuleGraph, ModuleKind, StubVersion};

/// Environment variable that overrides the default manifest version.
pub const VERSION_OVERRIDE_ENV: &str = "OVERRIDE_APEX_MANIFEST_DEFAULT_VERSION";

fn default_true() -> bool {
    true
}

/// Product-wide policy shared by every container in a build.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProductConfig {
    /// Target architectures; the first one is primary.
    pub targets: Vec<Arch>,
    pub compression_enabled: bool,
    pub unbundled: bool,
    /// Install containers as directory trees instead of single files.
    pub flatten_apex: bool,
    pub platform_sdk_final: bool,
    pub platform_sdk_version: u32,
    pub platform_sdk_codename: String,
    pub api_fingerprint_file: Option<PathBuf>,
    pub default_cert_dir: PathBuf,
    pub default_certificate: String,
    /// Container name to `[certificates]` entry.
    pub certificate_overrides: BTreeMap<String, String>,
    /// App module name to the package name it is renamed to.
    pub package_name_overrides: BTreeMap<String, String>,
    pub host_tool_dir: Option<PathBuf>,
    pub manifest_version_override: Option<String>,
}

impl Default for ProductConfig {
    fn default() -> Self {
        Self {
            targets: vec![Arch::Arm64],
            compression_enabled: false,
            unbundled: false,
            flatten_apex: false,
            platform_sdk_final: true,
            platform_sdk_version: 34,
            platform_sdk_codename: "REL".to_string(),
            api_fingerprint_file: None,
            default_cert_dir: PathBuf::from("build/make/target/product/security"),
            default_certificate: "testkey".to_string(),
            certificate_overrides: BTreeMap::new(),
            package_name_overrides: BTreeMap::new(),
            host_tool_dir: None,
            manifest_version_override: None,
        }
    }
}

impl ProductConfig {
    pub fn primary_arch(&self) -> Arch {
        self.targets.first().copied().unwrap_or(Arch::Arm64)
    }

    /// Apply overrides taken from the process environment.
    ///
    /// `lookup` is injected so the library never reads globals itself.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(version) = lookup(VERSION_OVERRIDE_ENV).filter(|v| !v.is_empty()) {
            self.manifest_version_override = Some(version);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFsType {
    #[default]
    Ext4,
    F2fs,
    Erofs,
}

impl PayloadFsType {
    pub fn as_str(self) -> &'static str {
        match self {
            PayloadFsType::Ext4 => "ext4",
            PayloadFsType::F2fs => "f2fs",
            PayloadFsType::Erofs => "erofs",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageVariant {
    #[default]
    Plain,
    /// Byte-identical libraries shared across sibling containers are deduplicated.
    DedupCommonLibs,
    /// Named libraries are removed from the image after staging.
    Trimmed,
}

/// Native content lists that can be given per multilib selector.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NativeDeps {
    pub native_shared_libs: Vec<String>,
    pub jni_libs: Vec<String>,
    pub binaries: Vec<String>,
    pub tests: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MultilibDecl {
    pub first: NativeDeps,
    pub both: NativeDeps,
    pub lib32: NativeDeps,
    pub lib64: NativeDeps,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompatSymlink {
    /// Link path, relative to the install root.
    pub link: String,
    pub target: String,
}

/// One container declaration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApexDecl {
    pub name: String,
    /// Name presented in the manifest when it differs from `name`.
    #[serde(default)]
    pub apex_name: Option<String>,
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
    #[serde(default)]
    pub android_manifest: Option<PathBuf>,
    #[serde(default)]
    pub file_contexts: Option<PathBuf>,
    #[serde(default)]
    pub use_file_contexts_as_is: bool,
    #[serde(default)]
    pub canned_fs_config: Option<PathBuf>,
    #[serde(default)]
    pub allowed_files: Option<PathBuf>,
    pub key: String,
    #[serde(default)]
    pub certificate: Option<String>,

    #[serde(default)]
    pub native_shared_libs: Vec<String>,
    #[serde(default)]
    pub jni_libs: Vec<String>,
    #[serde(default)]
    pub binaries: Vec<String>,
    #[serde(default)]
    pub tests: Vec<String>,
    #[serde(default)]
    pub multilib: MultilibDecl,
    #[serde(default)]
    pub prebuilts: Vec<String>,
    #[serde(default)]
    pub sh_binaries: Vec<String>,
    #[serde(default)]
    pub java_libs: Vec<String>,
    #[serde(default)]
    pub apps: Vec<String>,
    #[serde(default)]
    pub app_sets: Vec<String>,

    #[serde(default)]
    pub min_sdk_version: Option<String>,
    #[serde(default)]
    pub variant_version: Option<String>,
    #[serde(default = "default_true")]
    pub updatable: bool,
    /// Link transitive platform libraries even though the container is updatable.
    #[serde(default)]
    pub force_link_to_system_lib: bool,
    #[serde(default = "default_true")]
    pub installable: bool,
    #[serde(default)]
    pub compressible: bool,
    /// Test containers are never compressed unless forced.
    #[serde(default)]
    pub test: bool,
    #[serde(default)]
    pub test_only_force_compression: bool,
    #[serde(default)]
    pub test_only_unsigned_payload: bool,
    #[serde(default)]
    pub generate_hashtree: Option<bool>,
    #[serde(default)]
    pub payload_fs_type: PayloadFsType,
    #[serde(default = "default_partition")]
    pub partition: String,
    /// Soc/vendor specific containers get vendor labels and no platform symlinks.
    #[serde(default)]
    pub vendor: bool,
    #[serde(default)]
    pub override_apk_package_name: Option<String>,
    #[serde(default)]
    pub logging_parent: Option<String>,
    #[serde(default)]
    pub compat_symlinks: Vec<CompatSymlink>,
    #[serde(default)]
    pub image_variant: ImageVariant,
    #[serde(default)]
    pub libs_to_trim: Vec<String>,
}

fn default_manifest() -> PathBuf {
    PathBuf::from("apex_manifest.json")
}

fn default_partition() -> String {
    "system".to_string()
}

impl ApexDecl {
    /// Name the container presents on device.
    pub fn manifest_name(&self) -> &str {
        self.apex_name.as_deref().unwrap_or(&self.name)
    }

    /// Numeric minimum SDK level; `None` when unset or `current`.
    pub fn min_sdk_level(&self) -> Result<Option<u32>> {
        match self.min_sdk_version.as_deref().map(str::trim) {
            None | Some("current") => Ok(None),
            Some(v) => v.parse::<u32>().map(Some).map_err(|_| {
                ApexError::config(
                    &self.name,
                    "min_sdk_version",
                    format!("expected an API level or 'current'; got '{}'", v),
                )
                .into()
            }),
        }
    }

    /// Containers targeting API 29 also carry the stripped JSON manifest.
    pub fn needs_legacy_manifest(&self) -> Result<bool> {
        Ok(self.min_sdk_level()? == Some(29))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyPair {
    pub public_key: PathBuf,
    pub private_key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertPair {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModuleToml {
    kind: ModuleKind,
    #[serde(default)]
    srcs: BTreeMap<Arch, PathBuf>,
    #[serde(default)]
    src: Option<PathBuf>,
    #[serde(default)]
    stem: Option<String>,
    #[serde(default)]
    relative_install_path: Option<String>,
    #[serde(default)]
    sub_dir: Option<String>,
    #[serde(default)]
    shared_libs: Vec<String>,
    #[serde(default)]
    runtime_libs: Vec<String>,
    #[serde(default)]
    static_libs: Vec<String>,
    #[serde(default)]
    stubs_versions: Vec<String>,
    #[serde(default)]
    apex_available: Vec<String>,
    #[serde(default)]
    symlinks: Vec<String>,
    #[serde(default)]
    data: Vec<String>,
    #[serde(default)]
    package_name: Option<String>,
    #[serde(default)]
    privileged: bool,
    #[serde(default)]
    min_sdk_version: Option<String>,
    #[serde(default)]
    partition: Option<String>,
    #[serde(default)]
    notice: Option<PathBuf>,
    #[serde(default)]
    lint_report: Option<PathBuf>,
    #[serde(default)]
    packed_additional_outputs: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildToml {
    #[serde(default)]
    product: ProductConfig,
    apex: ApexDecl,
    #[serde(default)]
    keys: BTreeMap<String, KeyPair>,
    #[serde(default)]
    certificates: BTreeMap<String, CertPair>,
    #[serde(default)]
    modules: BTreeMap<String, ModuleToml>,
}

/// Everything needed to plan one container build.
#[derive(Debug, Clone)]
pub struct BuildInput {
    pub product: ProductConfig,
    pub apex: ApexDecl,
    pub keys: BTreeMap<String, KeyPair>,
    pub certificates: BTreeMap<String, CertPair>,
    pub modules: ModuleGraph,
    /// Directory relative paths were resolved against.
    pub base_dir: PathBuf,
}

impl BuildInput {
    /// Signing key of the container.
    pub fn key(&self) -> Result<&KeyPair> {
        self.keys.get(&self.apex.key).ok_or_else(|| {
            ApexError::config(
                &self.apex.name,
                "key",
                format!("references undefined key '{}'", self.apex.key),
            )
            .into()
        })
    }
}

pub fn load_build_input(config_path: &Path) -> Result<BuildInput> {
    let text = fs::read_to_string(config_path)
        .with_context(|| format!("reading build config '{}'", config_path.display()))?;
    let base_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    parse_build_input(&text, &base_dir)
        .with_context(|| format!("loading build config '{}'", config_path.display()))
}

pub fn parse_build_input(text: &str, base_dir: &Path) -> Result<BuildInput> {
    let parsed: BuildToml = toml::from_str(text).context("parsing build config")?;

    let mut product = parsed.product;
    if product.targets.is_empty() {
        bail!(ApexError::config("product", "targets", "at least one target is required"));
    }
    resolve_opt(base_dir, &mut product.api_fingerprint_file);
    resolve_opt(base_dir, &mut product.host_tool_dir);
    product.default_cert_dir = resolve(base_dir, &product.default_cert_dir);

    let mut apex = parsed.apex;
    if apex.name.trim().is_empty() {
        bail!(ApexError::config("apex", "name", "must not be empty"));
    }
    if apex.image_variant == ImageVariant::Trimmed && apex.libs_to_trim.is_empty() {
        bail!(ApexError::config(
            &apex.name,
            "libs_to_trim",
            "a trimmed container must name at least one library"
        ));
    }
    if apex.test_only_force_compression && !apex.test {
        bail!(ApexError::config(
            &apex.name,
            "test_only_force_compression",
            "only allowed on test containers"
        ));
    }
    apex.min_sdk_level()?;
    apex.manifest = resolve(base_dir, &apex.manifest);
    resolve_opt(base_dir, &mut apex.android_manifest);
    resolve_opt(base_dir, &mut apex.file_contexts);
    resolve_opt(base_dir, &mut apex.canned_fs_config);
    resolve_opt(base_dir, &mut apex.allowed_files);

    let keys = parsed
        .keys
        .into_iter()
        .map(|(name, k)| {
            let pair = KeyPair {
                public_key: resolve(base_dir, &k.public_key),
                private_key: resolve(base_dir, &k.private_key),
            };
            (name, pair)
        })
        .collect();
    let certificates = parsed
        .certificates
        .into_iter()
        .map(|(name, c)| {
            let pair = CertPair {
                certificate: resolve(base_dir, &c.certificate),
                private_key: resolve(base_dir, &c.private_key),
            };
            (name, pair)
        })
        .collect();

    let mut modules = ModuleGraph::new();
    for (name, raw) in parsed.modules {
        modules.insert(module_from_toml(base_dir, name, raw)?);
    }

    let input = BuildInput {
        product,
        apex,
        keys,
        certificates,
        modules,
        base_dir: base_dir.to_path_buf(),
    };
    input.key()?;
    Ok(input)
}

fn module_from_toml(base_dir: &Path, name: String, raw: ModuleToml) -> Result<ModuleDecl> {
    let edges = |property: &str, list: Vec<String>| -> Result<Vec<DepEdge>> {
        list.iter()
            .map(|s| {
                s.parse::<DepEdge>()
                    .map_err(|e| anyhow::Error::from(ApexError::config(&name, property, e)))
            })
            .collect()
    };

    let shared_libs = edges("shared_libs", raw.shared_libs)?;
    let runtime_libs = edges("runtime_libs", raw.runtime_libs)?;
    let static_libs = edges("static_libs", raw.static_libs)?;

    let mut stubs_versions = raw
        .stubs_versions
        .iter()
        .map(|v| {
            v.parse::<StubVersion>()
                .map_err(|e| ApexError::config(&name, "stubs_versions", e))
        })
        .collect::<Result<Vec<_>, _>>()?;
    stubs_versions.sort();
    stubs_versions.dedup();

    let mut module = ModuleDecl::new(name, raw.kind);
    module.srcs = raw
        .srcs
        .into_iter()
        .map(|(arch, p)| (arch, resolve(base_dir, &p)))
        .collect();
    module.src = raw.src.map(|p| resolve(base_dir, &p));
    module.stem = raw.stem;
    module.relative_install_path = raw.relative_install_path;
    module.sub_dir = raw.sub_dir;
    module.shared_libs = shared_libs;
    module.runtime_libs = runtime_libs;
    module.static_libs = static_libs;
    module.stubs_versions = stubs_versions;
    module.apex_available = raw.apex_available;
    module.symlinks = raw.symlinks;
    module.data = raw
        .data
        .into_iter()
        .map(|rel| DataFile {
            src: resolve(base_dir, Path::new(&rel)),
            rel,
        })
        .collect();
    module.package_name = raw.package_name;
    module.privileged = raw.privileged;
    module.min_sdk_version = raw.min_sdk_version;
    module.partition = raw.partition;
    module.notice = raw.notice.map(|p| resolve(base_dir, &p));
    module.lint_report = raw.lint_report.map(|p| resolve(base_dir, &p));
    module.packed_additional_outputs = raw
        .packed_additional_outputs
        .map(|p| resolve(base_dir, &p));
    Ok(module)
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn resolve_opt(base_dir: &Path, path: &mut Option<PathBuf>) {
    if let Some(p) = path.as_mut() {
        *p = resolve(base_dir, p);
    }
}
