//! The container build pipeline.
//!
//! [`ApexBuilder`] walks one container through its stages in a fixed order,
//! registering each stage's actions with an [`ActionSink`]. Stages can be
//! driven one at a time or all at once with [`ApexBuilder::run`]; asking for
//! a stage out of order is an [`ApexError::StateTransition`].
//!
//! ```text
//! NotStarted → FilesStaged → ManifestReady → ImageUnsigned → ImageConverted
//!            → Bundled → Signed → [Compressed] → Installed
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::action::{ActionSink, BuildAction};
use crate::config::BuildInput;
use crate::error::ApexError;
use crate::image::{self, bundle};
use crate::install::{self, InstallPlan};
use crate::layout;
use crate::manifest;
use crate::paths::OutPaths;
use crate::preflight::HostTools;
use crate::registry::ModuleRegistry;
use crate::reports;
use crate::selector::{self, Selection};
use crate::sign::{self, SignedArtifact};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BuildState {
    NotStarted,
    FilesStaged,
    ManifestReady,
    ImageUnsigned,
    ImageConverted,
    Bundled,
    Signed,
    Compressed,
    Installed,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl BuildState {
    fn can_move_to(self, next: BuildState) -> bool {
        use BuildState::*;
        matches!(
            (self, next),
            (NotStarted, FilesStaged)
                | (FilesStaged, ManifestReady)
                | (ManifestReady, ImageUnsigned)
                | (ImageUnsigned, ImageConverted)
                | (ImageConverted, Bundled)
                | (Bundled, Signed)
                | (Signed, Compressed)
                | (Signed, Installed)
                | (Compressed, Installed)
        )
    }
}

/// What a finished pipeline produced.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub artifact: SignedArtifact,
    pub install: InstallPlan,
    pub selection: Selection,
    /// States passed through, in order.
    pub visited: Vec<BuildState>,
    /// Rule of each planned action to the state it completes.
    pub stages: BTreeMap<String, BuildState>,
}

impl BuildOutcome {
    pub fn final_state(&self) -> BuildState {
        self.visited.last().copied().unwrap_or(BuildState::NotStarted)
    }

    /// Last state fully behind a failure of the action `rule`.
    pub fn reached_before(&self, rule: &str) -> BuildState {
        let Some(&failed) = self.stages.get(rule) else {
            return BuildState::NotStarted;
        };
        self.visited
            .iter()
            .copied()
            .filter(|s| *s < failed)
            .max()
            .unwrap_or(BuildState::NotStarted)
    }
}

pub struct ApexBuilder<'a> {
    input: &'a BuildInput,
    paths: OutPaths,
    tools: HostTools,
    state: BuildState,
    selection: Option<Selection>,
    has_notice: bool,
    artifact: Option<SignedArtifact>,
    install: Option<InstallPlan>,
    visited: Vec<BuildState>,
    stages: BTreeMap<String, BuildState>,
}

impl<'a> ApexBuilder<'a> {
    pub fn new(input: &'a BuildInput, out_dir: &Path) -> Self {
        Self {
            input,
            paths: OutPaths::new(out_dir, &input.apex.name),
            tools: HostTools::new(input.product.host_tool_dir.clone()),
            state: BuildState::NotStarted,
            selection: None,
            has_notice: false,
            artifact: None,
            install: None,
            visited: Vec::new(),
            stages: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn paths(&self) -> &OutPaths {
        &self.paths
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    fn advance(&mut self, next: BuildState) -> Result<()> {
        self.expect_next(next)?;
        tracing::info!(apex = %self.input.apex.name, from = %self.state, to = %next, "stage complete");
        self.state = next;
        self.visited.push(next);
        Ok(())
    }

    fn register(
        &mut self,
        sink: &mut dyn ActionSink,
        stage: BuildState,
        actions: Vec<BuildAction>,
    ) -> Result<()> {
        for action in actions {
            self.stages.insert(action.rule.clone(), stage);
            sink.register(action)?;
        }
        Ok(())
    }

    /// Check the transition before planning, so a rejected stage registers nothing.
    fn expect_next(&self, next: BuildState) -> Result<()> {
        if self.state.can_move_to(next) {
            return Ok(());
        }
        Err(ApexError::StateTransition {
            module: self.input.apex.name.clone(),
            from: self.state.to_string(),
            to: next.to_string(),
        }
        .into())
    }

    fn selected(&self) -> Result<&Selection> {
        self.selection
            .as_ref()
            .ok_or_else(|| anyhow!("{}: files have not been selected", self.input.apex.name))
    }

    fn artifact(&self) -> Result<&SignedArtifact> {
        self.artifact
            .as_ref()
            .ok_or_else(|| anyhow!("{}: container has not been signed", self.input.apex.name))
    }

    /// Select the payload and plan its filesystem metadata and notices.
    pub fn stage_files(&mut self, registry: &ModuleRegistry, sink: &mut dyn ActionSink) -> Result<()> {
        self.expect_next(BuildState::FilesStaged)?;
        let selection = selector::select_files(self.input, registry)?;
        let mut actions = layout::plan(self.input, &selection, &self.paths)?;
        if let Some(notice) = reports::plan_notice(self.input, &selection, &self.paths, &self.tools) {
            self.has_notice = true;
            actions.push(notice);
        }
        self.register(sink, BuildState::FilesStaged, actions)?;
        self.selection = Some(selection);
        self.advance(BuildState::FilesStaged)
    }

    pub fn build_manifest(&mut self, sink: &mut dyn ActionSink) -> Result<()> {
        self.expect_next(BuildState::ManifestReady)?;
        let actions = manifest::plan(self.input, self.selected()?, &self.paths)?;
        self.register(sink, BuildState::ManifestReady, actions)?;
        self.advance(BuildState::ManifestReady)
    }

    /// Package the staged payload, plus the reports computed from it.
    pub fn assemble(&mut self, sink: &mut dyn ActionSink) -> Result<()> {
        self.expect_next(BuildState::ImageUnsigned)?;
        let selection = self.selected()?;
        let mut actions = vec![image::plan(
            self.input,
            selection,
            &self.paths,
            &self.tools,
            self.has_notice,
        )?];
        actions.extend(image::reports::plan(selection, &self.paths, &self.tools));
        self.register(sink, BuildState::ImageUnsigned, actions)?;
        self.advance(BuildState::ImageUnsigned)
    }

    pub fn convert(&mut self, sink: &mut dyn ActionSink) -> Result<()> {
        self.expect_next(BuildState::ImageConverted)?;
        let convert = image::proto_convert(&self.paths, &self.tools);
        self.register(sink, BuildState::ImageConverted, vec![convert])?;
        self.advance(BuildState::ImageConverted)
    }

    pub fn bundle(&mut self, sink: &mut dyn ActionSink) -> Result<()> {
        self.expect_next(BuildState::Bundled)?;
        let actions = bundle::plan(self.input, self.selected()?, &self.paths, &self.tools)?;
        self.register(sink, BuildState::Bundled, actions)?;
        self.advance(BuildState::Bundled)
    }

    /// Sign the container, compressing and re-signing it when that applies.
    pub fn sign(&mut self, sink: &mut dyn ActionSink) -> Result<()> {
        self.expect_next(BuildState::Signed)?;
        let (mut actions, artifact) = sign::plan(self.input, &self.paths, &self.tools)?;
        // Signing comes first; anything after it belongs to compression.
        let compression = actions.split_off(actions.len().min(1));
        self.register(sink, BuildState::Signed, actions)?;
        self.register(sink, BuildState::Compressed, compression)?;
        let compressed = artifact.compressed;
        self.artifact = Some(artifact);
        self.advance(BuildState::Signed)?;
        if compressed {
            self.advance(BuildState::Compressed)?;
        }
        Ok(())
    }

    /// Plan installation and the outputs that describe the final artifact.
    pub fn install(&mut self, sink: &mut dyn ActionSink) -> Result<()> {
        self.expect_next(BuildState::Installed)?;
        let selection = self.selected()?;
        let artifact = self.artifact()?;
        let (plan, mut actions) = install::plan(self.input, selection, &self.paths, artifact)?;
        actions.extend(reports::plan(self.input, selection, &self.paths, artifact)?);
        actions.push(image::reports::installed_files_action(&self.paths, &artifact.path));
        self.register(sink, BuildState::Installed, actions)?;
        self.install = Some(plan);
        self.advance(BuildState::Installed)
    }

    /// Drive every stage in order.
    pub fn run(mut self, registry: &ModuleRegistry, sink: &mut dyn ActionSink) -> Result<BuildOutcome> {
        self.stage_files(registry, sink)?;
        self.build_manifest(sink)?;
        self.assemble(sink)?;
        self.convert(sink)?;
        self.bundle(sink)?;
        self.sign(sink)?;
        self.install(sink)?;

        match (self.artifact, self.install, self.selection) {
            (Some(artifact), Some(install), Some(selection)) => Ok(BuildOutcome {
                artifact,
                install,
                selection,
                visited: self.visited,
                stages: self.stages,
            }),
            _ => Err(anyhow!("{}: pipeline finished incomplete", self.input.apex.name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::executor::{ActionFailed, LocalExecutor};
    use crate::action::ActionGraph;
    use crate::config::parse_build_input;
    use crate::manifest::proto::ApexManifest;
    use prost::Message;
    use std::fs;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
        [product]
        targets = ["arm64", "arm"]
        compression_enabled = true

        [apex]
        name = "com.android.foo"
        key = "foo.key"
        compressible = true
        native_shared_libs = ["libfoo"]
        binaries = ["foo"]

        [keys."foo.key"]
        public_key = "foo.avbpubkey"
        private_key = "foo.pem"

        [modules.libfoo]
        kind = "cc_library"
        srcs = { arm64 = "out/arm64/libfoo.so", arm = "out/arm/libfoo.so" }
        apex_available = ["com.android.foo"]

        [modules.foo]
        kind = "cc_binary"
        srcs = { arm64 = "out/arm64/foo", arm = "out/arm/foo" }
        apex_available = ["com.android.foo"]
    "#;

    fn subgraph(graph: &ActionGraph, rules: &[&str]) -> ActionGraph {
        let mut sub = ActionGraph::new();
        for rule in rules {
            sub.register(graph.find(rule).unwrap().clone()).unwrap();
        }
        sub
    }

    #[test]
    fn test_end_to_end_plan() {
        let temp = TempDir::new().unwrap();
        let base = temp.path();
        fs::write(
            base.join("apex_manifest.json"),
            r#"{"name": "com.android.foo", "version": 1}"#,
        )
        .unwrap();
        let input = parse_build_input(CONFIG, base).unwrap();
        let out = base.join("out");

        let registry = ModuleRegistry::new();
        let mut graph = ActionGraph::new();
        let outcome = ApexBuilder::new(&input, &out).run(&registry, &mut graph).unwrap();
        let paths = OutPaths::new(&out, "com.android.foo");

        assert!(outcome.artifact.compressed);
        assert_eq!(outcome.artifact.path, paths.compressed());
        assert!(graph.producer(&paths.unsigned()).is_some());
        assert!(graph.producer(&paths.signed()).is_some());
        assert!(graph.producer(&paths.compressed()).is_some());
        assert!(graph.ordered().is_ok());
        registry.assert_packaged(["libfoo", "foo"]).unwrap();

        let pure = subgraph(&graph, &["apex_manifest", "apex_manifest_pb", "canned_fs_config"]);
        LocalExecutor::new(&out).execute(&pure).unwrap();

        let pb = ApexManifest::decode(fs::read(paths.manifest_pb()).unwrap().as_slice()).unwrap();
        assert_eq!(pb.name, "com.android.foo");
        assert!(pb.provide_native_libs.is_empty());
        assert!(pb.require_native_libs.is_empty());

        assert_eq!(
            fs::read_to_string(paths.canned_fs_config()).unwrap(),
            "/ 1000 1000 0755\n\
             /apex_manifest.json 1000 1000 0644\n\
             /apex_manifest.pb 1000 1000 0644\n\
             /lib/libfoo.so 1000 1000 0644\n\
             /lib64/libfoo.so 1000 1000 0644\n\
             /bin 0 2000 0755\n\
             /bin/foo 0 2000 0755\n\
             /lib 0 2000 0755\n\
             /lib64 0 2000 0755\n"
        );
    }

    /// Shell stand-ins for the host tools, each writing the output it is asked for.
    const STUB_TOOLS: &[(&str, &str)] = &[
        ("apexer", r#"for a; do out=$a; done; echo unsigned > "$out""#),
        ("aapt2", r#"for a; do out=$a; done; echo proto > "$out""#),
        (
            "zip2zip",
            r#"while [ $# -gt 0 ]; do [ "$1" = -o ] && echo zip > "$2"; shift; done; exit 0"#,
        ),
        (
            "soong_zip",
            r#"while [ $# -gt 0 ]; do [ "$1" = -o ] && echo zip > "$2"; shift; done; exit 0"#,
        ),
        ("merge_zips", r#"echo bundle > "$1""#),
        (
            "signapk",
            r#"echo "$*" >> "$(dirname "$0")/signapk.log"
for a; do in=$out; out=$a; done
{ cat "$in"; echo signed; } > "$out""#,
        ),
        (
            "apex_compression_tool",
            r#"while [ $# -gt 0 ]; do case $1 in --input) in=$2;; --output) out=$2;; esac; shift; done
{ cat "$in"; echo compressed; } > "$out""#,
        ),
        ("gen_ndk_usedby_apex.sh", r#"for a; do out=$a; done; : > "$out""#),
        ("gen_ndk_backedby_apex.sh", r#": > "$1""#),
        ("gen_java_usedby_apex.sh", r#": > "$2""#),
    ];

    fn write_tool(dir: &Path, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// A source tree with every input the container build reads.
    fn source_tree(base: &Path) -> BuildInput {
        let tools = base.join("tools");
        fs::create_dir_all(&tools).unwrap();
        for (name, body) in STUB_TOOLS {
            write_tool(&tools, name, body);
        }

        let security = base.join("build/make/target/product/security");
        fs::create_dir_all(&security).unwrap();
        fs::write(security.join("testkey.x509.pem"), "pem").unwrap();
        fs::write(security.join("testkey.pk8"), "pk8").unwrap();
        let sepolicy = base.join("system/sepolicy/apex");
        fs::create_dir_all(&sepolicy).unwrap();
        fs::write(sepolicy.join("com.android.foo-file_contexts"), "(/.*)? u:object_r:system_file:s0").unwrap();
        fs::write(base.join("foo.avbpubkey"), "pub").unwrap();
        fs::write(base.join("foo.pem"), "priv").unwrap();
        fs::write(
            base.join("apex_manifest.json"),
            r#"{"name": "com.android.foo", "version": 1}"#,
        )
        .unwrap();
        for arch in ["arm64", "arm"] {
            let dir = base.join("out").join(arch);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("libfoo.so"), format!("libfoo {}", arch)).unwrap();
            fs::write(dir.join("foo"), format!("foo {}", arch)).unwrap();
        }

        let config = CONFIG.replace(
            "compression_enabled = true",
            "compression_enabled = true\nhost_tool_dir = \"tools\"",
        );
        parse_build_input(&config, base).unwrap()
    }

    #[test]
    fn test_full_build_signs_and_compresses_with_one_certificate() {
        let temp = TempDir::new().unwrap();
        let base = temp.path();
        let input = source_tree(base);
        let out = base.join("out");

        let mut graph = ActionGraph::new();
        let outcome = ApexBuilder::new(&input, &out)
            .run(&ModuleRegistry::new(), &mut graph)
            .unwrap();
        let summary = LocalExecutor::new(&out).execute(&graph).unwrap();
        assert_eq!(summary.ran, graph.len());
        assert_eq!(outcome.final_state(), BuildState::Installed);

        let paths = OutPaths::new(&out, "com.android.foo");
        assert_eq!(fs::read_to_string(paths.signed()).unwrap(), "unsigned\nsigned\n");
        assert_eq!(
            fs::read_to_string(paths.compressed()).unwrap(),
            "unsigned\nsigned\ncompressed\nsigned\n"
        );
        assert_eq!(
            fs::read_to_string(out.join("install/system/apex/com.android.foo.capex")).unwrap(),
            "unsigned\nsigned\ncompressed\nsigned\n"
        );
        assert_eq!(
            fs::read_to_string(paths.image_dir().join("lib/libfoo.so")).unwrap(),
            "libfoo arm"
        );

        let log = fs::read_to_string(base.join("tools/signapk.log")).unwrap();
        let calls: Vec<Vec<&str>> = log.lines().map(|l| l.split(' ').collect()).collect();
        assert_eq!(calls.len(), 2);
        let (first, second) = (&calls[0], &calls[1]);
        // Same flags and certificate pair, different input and output.
        assert_eq!(first[..first.len() - 2], second[..second.len() - 2]);
        assert!(first.contains(&base.join("build/make/target/product/security/testkey.x509.pem").to_str().unwrap()));
        assert_eq!(
            first[first.len() - 2..],
            [paths.unsigned().to_str().unwrap(), paths.signed().to_str().unwrap()]
        );
        assert_eq!(
            second[second.len() - 2..],
            [
                paths.compressed_unsigned().to_str().unwrap(),
                paths.compressed().to_str().unwrap()
            ]
        );
    }

    #[test]
    fn test_failed_compression_leaves_signed_container_only() {
        let temp = TempDir::new().unwrap();
        let base = temp.path();
        let input = source_tree(base);
        write_tool(
            &base.join("tools"),
            "apex_compression_tool",
            r#"while [ $# -gt 0 ]; do [ "$1" = --output ] && echo partial > "$2"; shift; done; exit 3"#,
        );
        let out = base.join("out");

        let mut graph = ActionGraph::new();
        let outcome = ApexBuilder::new(&input, &out)
            .run(&ModuleRegistry::new(), &mut graph)
            .unwrap();
        let err = LocalExecutor::new(&out).execute(&graph).unwrap_err();

        let failed = err.downcast_ref::<ActionFailed>().unwrap();
        assert_eq!(failed.rule, "compress_apex");
        assert_eq!(outcome.reached_before(&failed.rule), BuildState::Signed);

        let paths = OutPaths::new(&out, "com.android.foo");
        assert!(paths.signed().exists());
        assert!(!paths.compressed_unsigned().exists());
        assert!(!paths.compressed().exists());
        let log = fs::read_to_string(base.join("tools/signapk.log")).unwrap();
        assert_eq!(log.lines().count(), 1);
    }

    #[test]
    fn test_out_of_order_stage_rejected() {
        let temp = TempDir::new().unwrap();
        let input = parse_build_input(CONFIG, temp.path()).unwrap();
        let mut graph = ActionGraph::new();
        let mut builder = ApexBuilder::new(&input, &temp.path().join("out"));

        let err = builder.sign(&mut graph).unwrap_err();
        let apex_err = err.downcast_ref::<ApexError>().unwrap();
        assert!(matches!(
            apex_err,
            ApexError::StateTransition { from, to, .. } if from == "NotStarted" && to == "Signed"
        ));
        assert!(graph.is_empty());
        assert_eq!(builder.state(), BuildState::NotStarted);

        builder.stage_files(&ModuleRegistry::new(), &mut graph).unwrap();
        assert_eq!(builder.state(), BuildState::FilesStaged);
        assert!(builder.stage_files(&ModuleRegistry::new(), &mut graph).is_err());
    }
}
