//! Registry of modules packaged into at least one container.
//!
//! One registry lives for one build invocation and is passed to every file
//! selection. It only backs the consistency check in
//! [`ModuleRegistry::assert_packaged`]; nothing branches on it.

use anyhow::{anyhow, bail, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct ModuleRegistry {
    inner: Mutex<BTreeMap<String, BTreeSet<String>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `module` is packaged into `apex`.
    pub fn record(&self, module: &str, apex: &str) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| anyhow!("module registry lock poisoned: {}", e))?;
        inner
            .entry(module.to_string())
            .or_default()
            .insert(apex.to_string());
        Ok(())
    }

    pub fn containers_of(&self, module: &str) -> Result<Vec<String>> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| anyhow!("module registry lock poisoned: {}", e))?;
        Ok(inner
            .get(module)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Fail unless every named module was packaged somewhere.
    pub fn assert_packaged<'a>(&self, modules: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| anyhow!("module registry lock poisoned: {}", e))?;
        let missing: Vec<&str> = modules
            .into_iter()
            .filter(|m| !inner.contains_key(*m))
            .collect();
        if !missing.is_empty() {
            bail!(
                "modules expected in a container but not packaged: {}",
                missing.join(", ")
            );
        }
        Ok(())
    }

    /// Forget everything, for reuse across build invocations.
    pub fn reset(&self) -> Result<()> {
        self.inner
            .lock()
            .map_err(|e| anyhow!("module registry lock poisoned: {}", e))?
            .clear();
        Ok(())
    }
}
