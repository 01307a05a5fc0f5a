//! Declarative build actions.
//!
//! The pipeline never touches the filesystem or spawns tools directly while
//! planning. Each stage describes WHAT must happen as a [`BuildAction`]: an
//! ordered list of [`Step`]s with declared inputs and outputs. An
//! [`ActionSink`] receives the actions; the host scheduler decides when to
//! run them. [`ActionGraph`] is the in-memory sink used by the CLI and tests,
//! and [`executor::LocalExecutor`] runs it.
//!
//! # Example
//!
//! ```rust
//! use apex_builder::action::{ActionGraph, ActionSink, BuildAction, Step};
//! use apex_builder::process::Cmd;
//!
//! let mut graph = ActionGraph::new();
//! graph
//!     .register(
//!         BuildAction::new("sign", "sign myapex")
//!             .input("out/myapex.apex.unsigned")
//!             .output("out/myapex.apex")
//!             .step(Step::Tool(Cmd::new("signapk").arg("-a").arg("4096"))),
//!     )
//!     .unwrap();
//! assert_eq!(graph.len(), 1);
//! ```

pub mod executor;

use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::manifest::ManifestFields;
use crate::process::Cmd;

/// One unit of work inside an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    // ─────────────────────────────────────────────────────────────────────
    // Filesystem operations
    // ─────────────────────────────────────────────────────────────────────
    /// Create directories (create_dir_all).
    MkDirs(Vec<PathBuf>),

    /// Remove a file or directory tree if present.
    RemoveAll(PathBuf),

    /// Copy a file, replacing the destination.
    Copy { src: PathBuf, dst: PathBuf },

    /// Create a symlink, replacing the link if it exists.
    Symlink { target: String, link: PathBuf },

    /// Write a file with given content.
    WriteFile { path: PathBuf, content: String },

    /// Append the contents of `input` to `output`.
    Append { input: PathBuf, output: PathBuf },

    /// Append literal text to `output`.
    AppendText { content: String, output: PathBuf },

    /// Extract a zip archive into `dest`.
    Unzip { archive: PathBuf, dest: PathBuf },

    // ─────────────────────────────────────────────────────────────────────
    // Container metadata
    // ─────────────────────────────────────────────────────────────────────
    /// Append canned fs config entries for every member of an app-set archive.
    AppendZipListing {
        archive: PathBuf,
        dir: String,
        output: PathBuf,
    },

    /// Fill in the version and native-library lists of a base manifest.
    AugmentManifest {
        input: PathBuf,
        fields: ManifestFields,
        output: PathBuf,
    },

    /// Rewrite the `name` field of a manifest JSON document.
    PatchManifestName {
        input: PathBuf,
        name: String,
        output: PathBuf,
    },

    /// Encode a manifest JSON document as protobuf.
    ConvertManifest { input: PathBuf, output: PathBuf },

    /// Reduce a manifest JSON document to the fields old runtimes accept.
    StripManifest { input: PathBuf, output: PathBuf },

    /// Compare the content list against an allow-list, writing `stamp` on success.
    CheckAllowedFiles {
        module: String,
        allowed: PathBuf,
        content: PathBuf,
        stamp: PathBuf,
    },

    /// List every regular file and symlink under `root` with its size.
    ListInstalledFiles { root: PathBuf, output: PathBuf },

    // ─────────────────────────────────────────────────────────────────────
    // External tools
    // ─────────────────────────────────────────────────────────────────────
    /// Run an external tool.
    Tool(Cmd),
}

/// A cacheable unit of work with explicit file dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildAction {
    pub rule: String,
    pub description: String,
    pub steps: Vec<Step>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    /// Outputs of other actions that must succeed before this one counts as built.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub validations: Vec<PathBuf>,
}

impl BuildAction {
    pub fn new(rule: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            description: description.into(),
            steps: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            validations: Vec::new(),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        if let Step::Tool(cmd) = &step {
            self.inputs.extend(cmd.implicit_inputs());
        }
        self.steps.push(step);
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        for step in steps {
            self = self.step(step);
        }
        self
    }

    pub fn input(mut self, path: impl AsRef<Path>) -> Self {
        self.inputs.push(path.as_ref().to_path_buf());
        self
    }

    pub fn inputs<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.inputs
            .extend(paths.into_iter().map(|p| p.as_ref().to_path_buf()));
        self
    }

    pub fn output(mut self, path: impl AsRef<Path>) -> Self {
        self.outputs.push(path.as_ref().to_path_buf());
        self
    }

    pub fn validation(mut self, path: impl AsRef<Path>) -> Self {
        self.validations.push(path.as_ref().to_path_buf());
        self
    }

    /// Tools this action invokes.
    pub fn tools(&self) -> impl Iterator<Item = &Cmd> {
        self.steps.iter().filter_map(|s| match s {
            Step::Tool(cmd) => Some(cmd),
            _ => None,
        })
    }

    fn normalize(&mut self) {
        self.inputs.sort();
        self.inputs.dedup();
        self.validations.sort();
        self.validations.dedup();
    }
}

/// The action registration interface of the host scheduler.
pub trait ActionSink {
    fn register(&mut self, action: BuildAction) -> Result<()>;
}

/// In-memory action graph with single-producer outputs.
#[derive(Debug, Default, Serialize)]
pub struct ActionGraph {
    actions: Vec<BuildAction>,
    #[serde(skip)]
    producers: BTreeMap<PathBuf, usize>,
}

impl ActionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[BuildAction] {
        &self.actions
    }

    pub fn find(&self, rule: &str) -> Option<&BuildAction> {
        self.actions.iter().find(|a| a.rule == rule)
    }

    /// The action producing `output`, if any.
    pub fn producer(&self, output: &Path) -> Option<&BuildAction> {
        self.producers.get(output).map(|&i| &self.actions[i])
    }

    /// Actions in dependency order.
    ///
    /// Registration order is kept wherever the declared edges allow it.
    pub fn ordered(&self) -> Result<Vec<&BuildAction>> {
        let n = self.actions.len();
        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, action) in self.actions.iter().enumerate() {
            for path in action.inputs.iter().chain(&action.validations) {
                if let Some(&p) = self.producers.get(path) {
                    if p != i {
                        deps[i].push(p);
                    }
                }
            }
        }

        let mut done = vec![false; n];
        let mut order = Vec::with_capacity(n);
        while order.len() < n {
            let before = order.len();
            for i in 0..n {
                if !done[i] && deps[i].iter().all(|&d| done[d]) {
                    done[i] = true;
                    order.push(&self.actions[i]);
                }
            }
            if order.len() == before {
                let stuck: Vec<_> = (0..n)
                    .filter(|&i| !done[i])
                    .map(|i| self.actions[i].rule.as_str())
                    .collect();
                bail!("dependency cycle between actions: {}", stuck.join(", "));
            }
        }
        Ok(order)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl ActionSink for ActionGraph {
    fn register(&mut self, mut action: BuildAction) -> Result<()> {
        if action.outputs.is_empty() {
            bail!("action '{}' declares no outputs", action.rule);
        }
        let index = self.actions.len();
        for output in &action.outputs {
            if let Some(&other) = self.producers.get(output) {
                bail!(
                    "output '{}' is produced by both '{}' and '{}'",
                    output.display(),
                    self.actions[other].rule,
                    action.rule
                );
            }
        }
        for output in &action.outputs {
            self.producers.insert(output.clone(), index);
        }
        action.normalize();
        tracing::debug!(rule = %action.rule, outputs = action.outputs.len(), "registered action");
        self.actions.push(action);
        Ok(())
    }
}
