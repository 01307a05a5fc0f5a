//! Stub-version selection for native library edges.
//!
//! A library with stubs publishes numbered interface snapshots. Consumers
//! inside the same container link the implementation; consumers outside link
//! a stub, normally the highest one, unless the edge pins a version.

use anyhow::Result;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use super::{DepEdge, ModuleDecl};
use crate::error::ApexError;

/// API level used for the in-development `current` snapshot.
pub const FUTURE_API_LEVEL: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StubVersion(u32);

impl StubVersion {
    pub fn new(level: u32) -> Self {
        Self(level)
    }

    pub fn current() -> Self {
        Self(FUTURE_API_LEVEL)
    }

    pub fn level(self) -> u32 {
        self.0
    }
}

impl FromStr for StubVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "current" {
            return Ok(Self::current());
        }
        s.parse::<u32>()
            .map(Self)
            .map_err(|_| format!("invalid stub version '{}'", s))
    }
}

impl fmt::Display for StubVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == FUTURE_API_LEVEL {
            write!(f, "current")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Serialize for StubVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// What a consumer links against for one edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkTarget {
    Implementation,
    Stub(StubVersion),
}

/// Pick the link target of `edge` from `consumer` to `provider`.
///
/// `same_container` is true when the provider is packaged alongside the
/// consumer. A pinned version must exist among the provider's stubs even
/// when the pin ends up unused.
pub fn resolve_link(
    consumer: &str,
    property: &str,
    edge: &DepEdge,
    provider: &ModuleDecl,
    same_container: bool,
) -> Result<LinkTarget> {
    if let Some(pin) = edge.version {
        if !provider.has_stubs() {
            return Err(ApexError::config(
                consumer,
                property,
                format!(
                    "requests stub version {} of '{}', which has no stubs",
                    pin, provider.name
                ),
            )
            .into());
        }
        if !provider.stubs_versions.contains(&pin) {
            let available = provider
                .stubs_versions
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ApexError::config(
                consumer,
                property,
                format!(
                    "requests stub version {} of '{}', which only provides [{}]",
                    pin, provider.name, available
                ),
            )
            .into());
        }
    }

    if same_container || !provider.has_stubs() {
        return Ok(LinkTarget::Implementation);
    }

    match edge.version {
        Some(pin) => Ok(LinkTarget::Stub(pin)),
        None => Ok(provider
            .stubs_versions
            .iter()
            .max()
            .copied()
            .map(LinkTarget::Stub)
            .unwrap_or(LinkTarget::Implementation)),
    }
}
