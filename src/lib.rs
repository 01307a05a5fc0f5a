//! Declarative build pipeline for APEX container images.
//!
//! Given a container declaration, the product policy and an already-resolved
//! module graph, this crate plans every action needed to turn the declared
//! content into a signed (and optionally compressed) container:
//!
//! - **File selection** - which built files go into the payload and where,
//!   including transitive native libraries and stub resolution
//! - **Manifest** - the JSON and protobuf runtime manifests
//! - **Layout** - canned fs config, file_contexts and the content allow-list
//! - **Image assembly** - staging plus the packaging tool, proto conversion
//!   and the app-bundle module
//! - **Signing** - container signing and compression
//! - **Install** - activated or flattened install trees
//!
//! # Architecture
//!
//! ```text
//! config (TOML) ──► selector ──► layout / manifest ──► image ──► sign ──► install
//!                      │                                  │
//!                      └── registry                       └── reports
//!
//! every stage ──► BuildAction ──► ActionSink (ActionGraph) ──► LocalExecutor
//! ```
//!
//! Planning only describes work as [`action::BuildAction`]s. It writes
//! nothing and spawns no tool until an executor runs the graph; the one
//! filesystem read it does is looking in `host_tool_dir` to resolve tool paths
//! (see [`preflight::HostTools`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use apex_builder::action::ActionGraph;
//! use apex_builder::config::load_build_input;
//! use apex_builder::pipeline::ApexBuilder;
//! use apex_builder::registry::ModuleRegistry;
//!
//! let input = load_build_input(Path::new("apex.toml"))?;
//! let mut graph = ActionGraph::new();
//! let outcome = ApexBuilder::new(&input, Path::new("out")).run(&ModuleRegistry::new(), &mut graph)?;
//! println!("{}", outcome.artifact.path.display());
//! ```

pub mod action;
pub mod config;
pub mod error;
pub mod graph;
pub mod image;
pub mod install;
pub mod layout;
pub mod manifest;
pub mod paths;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod registry;
pub mod reports;
pub mod runs;
pub mod selector;
pub mod sign;

pub use action::{ActionGraph, ActionSink, BuildAction, Step};
pub use config::{load_build_input, BuildInput};
pub use error::ApexError;
pub use pipeline::{ApexBuilder, BuildOutcome, BuildState};
