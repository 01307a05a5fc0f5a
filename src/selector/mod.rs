//! File selection: which files go into the container, and where.
//!
//! The selector walks the container's declared content and the library edges
//! reachable from it, resolving every edge once into a [`DependencyKind`].
//! Stub libraries that live outside the container stop the walk and are
//! recorded as required; everything else reachable is packaged.

pub mod apex_file;

use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;

use crate::config::{ApexDecl, BuildInput, NativeDeps};
use crate::error::ApexError;
use crate::graph::{resolve_link, Arch, DepTag, LinkTarget, ModuleDecl, ModuleGraph, ModuleKind};
use crate::registry::ModuleRegistry;
pub use apex_file::{ApexFile, DependencyKind, FileClass};

/// Resolution of one library edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkResolution {
    pub consumer: String,
    pub provider: String,
    pub arch: Arch,
    pub kind: DependencyKind,
    pub target: LinkTarget,
}

/// One reachable module and who pulls it in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepInfo {
    pub name: String,
    pub min_sdk_version: Option<String>,
    pub external: bool,
    pub from: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Selection {
    /// Sorted by in-container path, unique.
    pub files: Vec<ApexFile>,
    pub provide_native_libs: Vec<String>,
    pub require_native_libs: Vec<String>,
    pub links: Vec<LinkResolution>,
    pub deps_info: Vec<DepInfo>,
}

impl Selection {
    pub fn jni_libs(&self) -> Vec<String> {
        let mut libs: Vec<String> = Vec::new();
        for f in self.files.iter().filter(|f| f.is_jni_lib) {
            if !libs.contains(&f.stem) {
                libs.push(f.stem.clone());
            }
        }
        libs
    }

    pub fn file(&self, path: &str) -> Option<&ApexFile> {
        self.files.iter().find(|f| f.path() == path)
    }

    /// Names of packaged modules, sorted.
    pub fn module_names(&self) -> Vec<&str> {
        let set: BTreeSet<&str> = self
            .files
            .iter()
            .filter_map(|f| f.module_name.as_deref())
            .collect();
        set.into_iter().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NativeRole {
    Lib,
    Jni,
    Binary,
    Test,
}

impl NativeRole {
    fn property(self) -> &'static str {
        match self {
            NativeRole::Lib => "native_shared_libs",
            NativeRole::Jni => "jni_libs",
            NativeRole::Binary => "binaries",
            NativeRole::Test => "tests",
        }
    }
}

struct Walker<'a> {
    apex: &'a ApexDecl,
    graph: &'a ModuleGraph,
    link_to_system_lib: bool,
    /// Libraries listed as direct content, per arch.
    direct_libs: BTreeSet<(Arch, &'a str)>,
    files: Vec<ApexFile>,
    provide: Vec<String>,
    require: Vec<String>,
    links: Vec<LinkResolution>,
    deps: BTreeMap<String, DepInfo>,
}

/// Select the files of the container described by `input`.
pub fn select_files(input: &BuildInput, registry: &ModuleRegistry) -> Result<Selection> {
    let apex = &input.apex;
    let product = &input.product;

    let link_to_system_lib = !product.unbundled
        && apex.installable
        && !apex.vendor
        && (!apex.updatable || apex.force_link_to_system_lib);

    let native = native_content(apex, &product.targets);
    let mut walker = Walker {
        apex,
        graph: &input.modules,
        link_to_system_lib,
        direct_libs: native
            .iter()
            .filter(|(_, _, role)| matches!(role, NativeRole::Lib | NativeRole::Jni))
            .map(|(arch, name, _)| (*arch, name.as_str()))
            .collect(),
        files: Vec::new(),
        provide: Vec::new(),
        require: Vec::new(),
        links: Vec::new(),
        deps: BTreeMap::new(),
    };

    for (arch, name, role) in &native {
        walker.add_direct_native(*arch, name, *role)?;
    }
    walker.add_arch_independent(product.primary_arch(), &product.package_name_overrides)?;

    for file in &mut walker.files {
        file.link_to_platform =
            walker.link_to_system_lib && file.transitive_dep && file.available_to_platform;
    }
    let files = finalize(&apex.name, walker.files)?;
    for module in files.iter().filter_map(|f| f.module_name.as_deref()) {
        registry.record(module, &apex.name)?;
    }

    let mut provide = walker.provide;
    provide.sort();
    provide.dedup();
    let mut require: Vec<String> = walker
        .require
        .into_iter()
        .filter(|r| !provide.contains(r))
        .collect();
    require.sort();
    require.dedup();

    tracing::debug!(
        apex = %apex.name,
        files = files.len(),
        provide = provide.len(),
        require = require.len(),
        "selected container files"
    );

    Ok(Selection {
        files,
        provide_native_libs: provide,
        require_native_libs: require,
        links: walker.links,
        deps_info: walker.deps.into_values().collect(),
    })
}

/// Native content per target architecture, in declaration order.
fn native_content(apex: &ApexDecl, targets: &[Arch]) -> Vec<(Arch, String, NativeRole)> {
    let mut out = Vec::new();
    for (i, &arch) in targets.iter().enumerate() {
        let per_lib = match arch.multilib() {
            crate::graph::Multilib::Lib32 => &apex.multilib.lib32,
            crate::graph::Multilib::Lib64 => &apex.multilib.lib64,
        };
        let mut lists: Vec<&NativeDeps> = vec![&apex.multilib.both, per_lib];
        if i == 0 {
            lists.push(&apex.multilib.first);
        }

        let mut push = |names: &[String], role: NativeRole| {
            for name in names {
                out.push((arch, name.clone(), role));
            }
        };
        push(&apex.native_shared_libs, NativeRole::Lib);
        push(&apex.jni_libs, NativeRole::Jni);
        if i == 0 {
            push(&apex.binaries, NativeRole::Binary);
            push(&apex.tests, NativeRole::Test);
        }
        for deps in lists {
            push(&deps.native_shared_libs, NativeRole::Lib);
            push(&deps.jni_libs, NativeRole::Jni);
            push(&deps.binaries, NativeRole::Binary);
            push(&deps.tests, NativeRole::Test);
        }
    }
    out
}

impl<'a> Walker<'a> {
    fn check_available(&self, module: &ModuleDecl, via: &str) -> Result<()> {
        if module.is_available_for(&self.apex.name) {
            return Ok(());
        }
        Err(ApexError::config(
            &module.name,
            "apex_available",
            format!(
                "required by '{}' but does not list '{}' in apex_available",
                via, self.apex.name
            ),
        )
        .into())
    }

    fn note_dep(&mut self, module: &ModuleDecl, from: &str, external: bool) {
        let entry = self.deps.entry(module.name.clone()).or_insert_with(|| DepInfo {
            name: module.name.clone(),
            min_sdk_version: module.min_sdk_version.clone(),
            external,
            from: BTreeSet::new(),
        });
        entry.external = entry.external && external;
        entry.from.insert(from.to_string());
    }

    fn native_file(&self, module: &ModuleDecl, arch: Arch, class: FileClass) -> Result<ApexFile> {
        let built = module.built_file(Some(arch))?;
        let base_dir = match class {
            FileClass::NativeSharedLib => arch.multilib().lib_dir(),
            _ => "bin",
        };
        let install_dir = match &module.relative_install_path {
            Some(rel) if !rel.is_empty() => apex_file::join(base_dir, rel),
            _ => base_dir.to_string(),
        };
        let mut file = ApexFile::new(built, install_dir, module.stem(), class);
        file.module_name = Some(module.name.clone());
        file.multilib = Some(arch.multilib());
        file.symlinks = module.symlinks.clone();
        file.data_files = module.data.clone();
        file.available_to_platform = module.available_to_platform();
        file.partition = self.partition_of(module);
        Ok(file)
    }

    /// Partition the module's platform copy installs to.
    fn partition_of(&self, module: &ModuleDecl) -> String {
        module
            .partition
            .clone()
            .unwrap_or_else(|| self.apex.partition.clone())
    }

    fn add_direct_native(&mut self, arch: Arch, name: &str, role: NativeRole) -> Result<()> {
        let (apex, graph) = (self.apex, self.graph);
        let module = graph.require(&apex.name, role.property(), name)?;
        let class = match (role, module.kind) {
            (NativeRole::Lib | NativeRole::Jni, ModuleKind::CcLibrary) => FileClass::NativeSharedLib,
            (NativeRole::Binary, ModuleKind::CcBinary) => FileClass::NativeExecutable,
            (NativeRole::Test, ModuleKind::CcTest | ModuleKind::CcBinary) => FileClass::NativeTest,
            (_, kind) => {
                return Err(ApexError::config(
                    &apex.name,
                    role.property(),
                    format!("'{}' is a {:?} module, which cannot be listed here", name, kind),
                )
                .into())
            }
        };
        self.check_available(module, &apex.name)?;

        let mut file = self.native_file(module, arch, class)?;
        file.is_jni_lib = role == NativeRole::Jni;
        self.files.push(file);
        self.note_dep(module, &apex.name, false);

        if class == FileClass::NativeSharedLib && module.has_stubs() {
            self.provide.push(module.stem());
        }

        self.walk_transitive(arch, module)
    }

    fn walk_transitive(&mut self, arch: Arch, root: &'a ModuleDecl) -> Result<()> {
        let graph = self.graph;
        let mut queue: VecDeque<&'a ModuleDecl> = VecDeque::from([root]);
        let mut visited: BTreeSet<&'a str> = BTreeSet::from([root.name.as_str()]);

        while let Some(consumer) = queue.pop_front() {
            for (tag, edge) in consumer.edges() {
                let provider = graph.require(&consumer.name, tag.property(), &edge.name)?;
                let same_container = self.direct_libs.contains(&(arch, provider.name.as_str()));
                let target =
                    resolve_link(&consumer.name, tag.property(), edge, provider, same_container)?;

                if tag == DepTag::Static {
                    // Linked in; only its own shared deps matter.
                    if visited.insert(provider.name.as_str()) {
                        queue.push_back(provider);
                    }
                    continue;
                }

                let kind = match (provider.has_stubs(), same_container) {
                    (true, true) => DependencyKind::TransitiveStubInternal,
                    (true, false) => DependencyKind::TransitiveStubExternal,
                    (false, _) => DependencyKind::TransitiveRuntime,
                };
                self.links.push(LinkResolution {
                    consumer: consumer.name.clone(),
                    provider: provider.name.clone(),
                    arch,
                    kind,
                    target,
                });
                self.note_dep(provider, &consumer.name, kind.is_external());

                match kind {
                    DependencyKind::TransitiveStubExternal => {
                        self.require.push(provider.stem());
                    }
                    DependencyKind::TransitiveRuntime => {
                        if provider.kind != ModuleKind::CcLibrary {
                            return Err(ApexError::config(
                                &consumer.name,
                                tag.property(),
                                format!("'{}' is not a native library", provider.name),
                            )
                            .into());
                        }
                        self.check_available(provider, &consumer.name)?;
                        let mut file =
                            self.native_file(provider, arch, FileClass::NativeSharedLib)?;
                        file.transitive_dep = true;
                        file.dependency_kind = kind;
                        self.files.push(file);
                        if visited.insert(provider.name.as_str()) {
                            queue.push_back(provider);
                        }
                    }
                    DependencyKind::TransitiveStubInternal | DependencyKind::DirectContent => {}
                }
            }
        }
        Ok(())
    }

    fn add_arch_independent(
        &mut self,
        primary: Arch,
        package_overrides: &BTreeMap<String, String>,
    ) -> Result<()> {
        let apex = self.apex;
        let graph = self.graph;
        let groups = [
            (apex.prebuilts.as_slice(), "prebuilts", ModuleKind::Prebuilt),
            (apex.sh_binaries.as_slice(), "sh_binaries", ModuleKind::ShBinary),
            (apex.java_libs.as_slice(), "java_libs", ModuleKind::JavaLibrary),
            (apex.apps.as_slice(), "apps", ModuleKind::App),
            (apex.app_sets.as_slice(), "app_sets", ModuleKind::AppSet),
        ];

        for (names, property, expected) in groups {
            for name in names {
                let module = graph.require(&apex.name, property, name)?;
                if module.kind != expected {
                    return Err(ApexError::config(
                        &apex.name,
                        property,
                        format!("'{}' is a {:?} module, expected {:?}", name, module.kind, expected),
                    )
                    .into());
                }
                self.check_available(module, &apex.name)?;

                let arch = (!module.srcs.is_empty()).then_some(primary);
                let built = module.built_file(arch)?;
                let (install_dir, class) = match expected {
                    ModuleKind::Prebuilt => (
                        apex_file::join("etc", module.sub_dir.as_deref().unwrap_or("")),
                        FileClass::Etc,
                    ),
                    ModuleKind::ShBinary => (
                        apex_file::join("bin", module.sub_dir.as_deref().unwrap_or("")),
                        FileClass::ShBinary,
                    ),
                    ModuleKind::JavaLibrary => ("javalib".to_string(), FileClass::JavaSharedLib),
                    ModuleKind::App => {
                        let dir = if module.privileged { "priv-app" } else { "app" };
                        (format!("{}/{}", dir, module.name), FileClass::App)
                    }
                    _ => (format!("app/{}", module.name), FileClass::AppSet),
                };
                let install_dir = install_dir.trim_end_matches('/').to_string();

                let mut file = ApexFile::new(built, install_dir, module.stem(), class);
                file.module_name = Some(module.name.clone());
                file.symlinks = module.symlinks.clone();
                file.data_files = module.data.clone();
                file.available_to_platform = module.available_to_platform();
                file.partition = self.partition_of(module);
                if matches!(class, FileClass::App | FileClass::AppSet) {
                    file.overridden_package_name = package_overrides.get(&module.name).cloned();
                }
                if class == FileClass::AppSet {
                    file.app_set_archive = Some(module.packed_additional_outputs.clone().ok_or_else(
                        || {
                            ApexError::config(
                                &module.name,
                                "packed_additional_outputs",
                                "an app set needs its packed additional outputs",
                            )
                        },
                    )?);
                }
                self.files.push(file);
                self.note_dep(module, &apex.name, false);
            }
        }
        Ok(())
    }
}

/// Collapse duplicates, reject collisions, and sort by in-container path.
fn finalize(apex_name: &str, files: Vec<ApexFile>) -> Result<Vec<ApexFile>> {
    let mut by_key: BTreeMap<(String, PathBuf), ApexFile> = BTreeMap::new();
    for file in files {
        let key = file.dedup_key();
        match by_key.get_mut(&key) {
            Some(existing) => {
                existing.transitive_dep = existing.transitive_dep && file.transitive_dep;
                existing.link_to_platform = existing.link_to_platform && file.link_to_platform;
                existing.is_jni_lib = existing.is_jni_lib || file.is_jni_lib;
                if !file.transitive_dep {
                    existing.dependency_kind = DependencyKind::DirectContent;
                }
            }
            None => {
                by_key.insert(key, file);
            }
        }
    }

    let mut by_path: BTreeMap<String, ApexFile> = BTreeMap::new();
    for file in by_key.into_values() {
        let path = file.path();
        if let Some(other) = by_path.get(&path) {
            return Err(ApexError::config(
                apex_name,
                "contents",
                format!(
                    "'{}' and '{}' both install to '{}'",
                    other.built_file.display(),
                    file.built_file.display(),
                    path
                ),
            )
            .into());
        }
        by_path.insert(path, file);
    }
    Ok(by_path.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_build_input, BuildInput};
    use std::path::Path;

    const BASE: &str = r#"
        [product]
        targets = ["arm64", "arm"]

        [apex]
        name = "myapex"
        key = "myapex.key"
        native_shared_libs = ["mylib"]
        binaries = ["mybin"]

        [keys."myapex.key"]
        public_key = "testkey.avbpubkey"
        private_key = "testkey.pem"

        [modules.mylib]
        kind = "cc_library"
        srcs = { arm64 = "arm64/mylib.so", arm = "arm/mylib.so" }
        shared_libs = ["mylib2", "libfoo"]
        apex_available = ["myapex"]

        [modules.mylib2]
        kind = "cc_library"
        srcs = { arm64 = "arm64/mylib2.so", arm = "arm/mylib2.so" }
        apex_available = ["myapex", "//apex_available:platform"]

        [modules.libfoo]
        kind = "cc_library"
        srcs = { arm64 = "arm64/libfoo.so", arm = "arm/libfoo.so" }
        stubs_versions = ["1", "2", "3"]

        [modules.mybin]
        kind = "cc_binary"
        srcs = { arm64 = "arm64/mybin", arm = "arm/mybin" }
        shared_libs = ["libfoo@1"]
        symlinks = ["mybin_alias"]
        apex_available = ["myapex"]
    "#;

    fn input(text: &str) -> BuildInput {
        parse_build_input(text, Path::new("/src")).unwrap()
    }

    fn paths(sel: &Selection) -> Vec<String> {
        sel.files.iter().map(|f| f.path()).collect()
    }

    #[test]
    fn test_multilib_layout_and_order() {
        let sel = select_files(&input(BASE), &ModuleRegistry::new()).unwrap();
        assert_eq!(
            paths(&sel),
            vec![
                "bin/mybin",
                "lib/mylib.so",
                "lib/mylib2.so",
                "lib64/mylib.so",
                "lib64/mylib2.so",
            ]
        );
        let mylib2 = sel.file("lib64/mylib2.so").unwrap();
        assert!(mylib2.transitive_dep);
        assert_eq!(mylib2.dependency_kind, DependencyKind::TransitiveRuntime);
        assert_eq!(sel.file("bin/mybin").unwrap().multilib, Some(crate::graph::Multilib::Lib64));
    }

    #[test]
    fn test_external_stub_required_not_packaged() {
        let sel = select_files(&input(BASE), &ModuleRegistry::new()).unwrap();
        assert!(sel.file("lib64/libfoo.so").is_none());
        assert_eq!(sel.require_native_libs, vec!["libfoo.so"]);
        assert!(sel.provide_native_libs.is_empty());

        let from_lib = sel
            .links
            .iter()
            .find(|l| l.consumer == "mylib" && l.provider == "libfoo" && l.arch == Arch::Arm64)
            .unwrap();
        assert_eq!(from_lib.kind, DependencyKind::TransitiveStubExternal);
        assert_eq!(from_lib.target, LinkTarget::Stub(crate::graph::StubVersion::new(3)));

        let from_bin = sel.links.iter().find(|l| l.consumer == "mybin").unwrap();
        assert_eq!(from_bin.target, LinkTarget::Stub(crate::graph::StubVersion::new(1)));
    }

    #[test]
    fn test_internal_stub_links_implementation_and_is_provided() {
        let text = BASE
            .replace(r#"native_shared_libs = ["mylib"]"#, r#"native_shared_libs = ["mylib", "libfoo"]"#)
            .replace(
                "stubs_versions = [\"1\", \"2\", \"3\"]",
                "stubs_versions = [\"1\", \"2\", \"3\"]\napex_available = [\"myapex\"]",
            );
        let sel = select_files(&input(&text), &ModuleRegistry::new()).unwrap();

        assert!(sel.file("lib64/libfoo.so").is_some());
        assert_eq!(sel.provide_native_libs, vec!["libfoo.so"]);
        assert!(sel.require_native_libs.is_empty());
        for link in sel.links.iter().filter(|l| l.provider == "libfoo") {
            assert_eq!(link.kind, DependencyKind::TransitiveStubInternal);
            assert_eq!(link.target, LinkTarget::Implementation);
        }
    }

    #[test]
    fn test_stub_in_one_multilib_only_is_external_for_other_arch() {
        let text = BASE
            .replace(
                r#"binaries = ["mybin"]"#,
                "binaries = [\"mybin\"]\nmultilib = { lib64 = { native_shared_libs = [\"libfoo\"] } }",
            )
            .replace(
                "stubs_versions = [\"1\", \"2\", \"3\"]",
                "stubs_versions = [\"1\", \"2\", \"3\"]\napex_available = [\"myapex\"]",
            );
        let sel = select_files(&input(&text), &ModuleRegistry::new()).unwrap();

        assert!(sel.file("lib64/libfoo.so").is_some());
        assert!(sel.file("lib/libfoo.so").is_none());

        let link = |arch| {
            sel.links
                .iter()
                .find(|l| l.consumer == "mylib" && l.provider == "libfoo" && l.arch == arch)
                .unwrap()
        };
        assert_eq!(link(Arch::Arm64).kind, DependencyKind::TransitiveStubInternal);
        assert_eq!(link(Arch::Arm64).target, LinkTarget::Implementation);
        // Nothing under lib/ to link against, so the 32-bit side uses the stub.
        assert_eq!(link(Arch::Arm).kind, DependencyKind::TransitiveStubExternal);
        assert_eq!(
            link(Arch::Arm).target,
            LinkTarget::Stub(crate::graph::StubVersion::new(3))
        );

        assert_eq!(sel.provide_native_libs, vec!["libfoo.so"]);
        assert!(sel.require_native_libs.is_empty());
    }

    #[test]
    fn test_platform_path_uses_module_partition() {
        let text = BASE
            .replace("name = \"myapex\"", "name = \"myapex\"\nupdatable = false")
            .replace(
                "apex_available = [\"myapex\", \"//apex_available:platform\"]",
                "apex_available = [\"myapex\", \"//apex_available:platform\"]\npartition = \"vendor\"",
            );
        let sel = select_files(&input(&text), &ModuleRegistry::new()).unwrap();
        assert_eq!(
            sel.file("lib64/mylib2.so").unwrap().platform_path(),
            "/vendor/lib64/mylib2.so"
        );
        assert_eq!(
            sel.file("lib64/mylib.so").unwrap().platform_path(),
            "/system/lib64/mylib.so"
        );
    }

    #[test]
    fn test_symlink_optimization_flag() {
        let text = BASE.replace("name = \"myapex\"", "name = \"myapex\"\nupdatable = false");
        let sel = select_files(&input(&text), &ModuleRegistry::new()).unwrap();
        let mylib2 = sel.file("lib64/mylib2.so").unwrap();
        assert!(mylib2.link_to_platform);
        assert!(!sel.file("lib64/mylib.so").unwrap().link_to_platform);

        // Updatable containers always carry their own copies.
        let sel = select_files(&input(BASE), &ModuleRegistry::new()).unwrap();
        assert!(!sel.file("lib64/mylib2.so").unwrap().link_to_platform);
    }

    #[test]
    fn test_direct_and_transitive_dedup_to_direct() {
        let text = BASE.replace(
            r#"native_shared_libs = ["mylib"]"#,
            r#"native_shared_libs = ["mylib", "mylib2"]"#,
        );
        let sel = select_files(&input(&text), &ModuleRegistry::new()).unwrap();
        let mylib2 = sel.file("lib64/mylib2.so").unwrap();
        assert!(!mylib2.transitive_dep);
        assert_eq!(mylib2.dependency_kind, DependencyKind::DirectContent);
        assert_eq!(sel.files.iter().filter(|f| f.path() == "lib64/mylib2.so").count(), 1);
    }

    #[test]
    fn test_path_collision_is_fatal() {
        let text = format!(
            "{}\n{}",
            BASE.replace(r#"binaries = ["mybin"]"#, r#"binaries = ["mybin"]
        prebuilts = ["a", "b"]"#),
            r#"
        [modules.a]
        kind = "prebuilt"
        src = "one/init.rc"
        apex_available = ["myapex"]

        [modules.b]
        kind = "prebuilt"
        src = "two/init.rc"
        apex_available = ["myapex"]
        "#
        );
        let err = select_files(&input(&text), &ModuleRegistry::new()).unwrap_err();
        let apex_err = err.downcast_ref::<ApexError>().unwrap();
        assert!(matches!(apex_err, ApexError::Config { .. }));
        assert!(err.to_string().contains("both install to 'etc/init.rc'"));
    }

    #[test]
    fn test_unavailable_transitive_dep_attributed() {
        let text = BASE.replace(
            "apex_available = [\"myapex\", \"//apex_available:platform\"]",
            "apex_available = [\"//apex_available:platform\"]",
        );
        let err = select_files(&input(&text), &ModuleRegistry::new()).unwrap_err();
        assert!(err.to_string().starts_with("mylib2: property 'apex_available'"));
    }

    #[test]
    fn test_missing_pin_fails_selection() {
        let text = BASE.replace("libfoo@1", "libfoo@7");
        let err = select_files(&input(&text), &ModuleRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("requests stub version 7"));
    }

    #[test]
    fn test_registry_records_packaged_modules() {
        let registry = ModuleRegistry::new();
        select_files(&input(BASE), &registry).unwrap();
        registry.assert_packaged(["mylib", "mylib2", "mybin"]).unwrap();
        assert!(registry.assert_packaged(["libfoo"]).is_err());
    }

    #[test]
    fn test_deterministic() {
        let a = select_files(&input(BASE), &ModuleRegistry::new()).unwrap();
        let b = select_files(&input(BASE), &ModuleRegistry::new()).unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_deps_info_marks_external() {
        let sel = select_files(&input(BASE), &ModuleRegistry::new()).unwrap();
        let libfoo = sel.deps_info.iter().find(|d| d.name == "libfoo").unwrap();
        assert!(libfoo.external);
        assert!(libfoo.from.contains("mylib"));
        assert!(libfoo.from.contains("mybin"));
        let mylib = sel.deps_info.iter().find(|d| d.name == "mylib").unwrap();
        assert!(!mylib.external);
        assert!(mylib.from.contains("myapex"));
    }
}
