use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::descriptor::ToolDescriptor;

/// Two archives in one kit resolved to the same normalized tool name.
/// Ambiguity is resolved by the user (remove or rename one archive), never
/// by picking a winner.
#[derive(Debug, Error)]
#[error(
    "kit `{kit}` provides tool `{name}` twice: {} and {}",
    .first.display(),
    .second.display()
)]
pub struct NameConflict {
    pub kit: String,
    pub name: String,
    pub first: PathBuf,
    pub second: PathBuf,
}

/// An archive that was found during a kit scan but yielded no descriptor.
/// Skipped archives do not fail the load; they are reported by `doctor`.
#[derive(Clone, Debug, Serialize)]
pub struct SkippedArchive {
    pub archive: PathBuf,
    pub reason: String,
}

/// A named collection of tools discovered together under one directory.
#[derive(Clone, Debug, Default)]
pub struct KitManifest {
    name: String,
    root: PathBuf,
    tools: BTreeMap<String, ToolDescriptor>,
    skipped: Vec<SkippedArchive>,
}

impl KitManifest {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            tools: BTreeMap::new(),
            skipped: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Adds a descriptor, enforcing the per-kit uniqueness invariant.
    pub fn insert(&mut self, descriptor: ToolDescriptor) -> Result<(), NameConflict> {
        if let Some(existing) = self.tools.get(&descriptor.name) {
            return Err(NameConflict {
                kit: self.name.clone(),
                name: descriptor.name.clone(),
                first: existing.archive_path.clone(),
                second: descriptor.archive_path,
            });
        }
        self.tools.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn record_skipped(&mut self, archive: impl Into<PathBuf>, reason: impl Into<String>) {
        self.skipped.push(SkippedArchive {
            archive: archive.into(),
            reason: reason.into(),
        });
    }

    pub fn get(&self, normalized_name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(normalized_name)
    }

    pub fn tools(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values()
    }

    pub fn skipped(&self) -> &[SkippedArchive] {
        &self.skipped
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// A kit directory with no valid archives is a valid empty kit, so kit
    /// directories can be populated incrementally.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
