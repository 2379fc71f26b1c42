use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::specifier::DependencySpecifier;

/// Normalizes a tool or package name: lowercase, with runs of `-`, `_` and
/// `.` collapsed to a single hyphen. Two names that normalize equally refer
/// to the same tool.
pub fn normalize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_separator = false;
    for ch in raw.trim().chars() {
        if matches!(ch, '-' | '_' | '.') {
            if !out.is_empty() {
                pending_separator = true;
            }
            continue;
        }
        if pending_separator {
            out.push('-');
            pending_separator = false;
        }
        out.extend(ch.to_lowercase());
    }
    out
}

/// How a tool is started inside its runtime. Exactly one method per tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryPoint {
    /// A console script installed into the runtime's bin directory.
    Console(String),
    /// An importable module run as `python -m <module>`.
    Module(String),
    /// A script file run by path inside the runtime.
    Script(String),
    /// A verbatim argv template, resolved against the runtime's bin dir.
    Argv(Vec<String>),
}

impl EntryPoint {
    pub fn kind(&self) -> &'static str {
        match self {
            EntryPoint::Console(_) => "console",
            EntryPoint::Module(_) => "module",
            EntryPoint::Script(_) => "script",
            EntryPoint::Argv(_) => "command",
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryPoint::Console(name) => write!(f, "console script `{name}`"),
            EntryPoint::Module(module) => write!(f, "module `{module}`"),
            EntryPoint::Script(path) => write!(f, "script `{path}`"),
            EntryPoint::Argv(argv) => write!(f, "command `{}`", argv.join(" ")),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Windows,
    Macos,
    Linux,
}

impl Platform {
    pub fn current() -> Option<Self> {
        if cfg!(target_os = "windows") {
            Some(Platform::Windows)
        } else if cfg!(target_os = "macos") {
            Some(Platform::Macos)
        } else if cfg!(target_os = "linux") {
            Some(Platform::Linux)
        } else {
            None
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "windows" | "win32" => Some(Platform::Windows),
            "macos" | "darwin" | "osx" => Some(Platform::Macos),
            "linux" => Some(Platform::Linux),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Platform::Windows => "windows",
            Platform::Macos => "macos",
            Platform::Linux => "linux",
        };
        f.write_str(label)
    }
}

/// Identity and requirements of one installable tool, read from its archive.
///
/// Descriptors are immutable: when the backing archive changes, the old
/// descriptor is discarded and a new one is extracted (the fingerprint makes
/// the change observable). Nothing mutates a descriptor in place.
#[derive(Clone, Debug)]
pub struct ToolDescriptor {
    /// Normalized unique key.
    pub name: String,
    /// Name exactly as declared in the archive metadata.
    pub display_name: String,
    pub version: String,
    pub summary: Option<String>,
    pub entry_point: EntryPoint,
    pub requirements: Vec<DependencySpecifier>,
    pub python_requirement: Option<String>,
    /// `None` means unrestricted.
    pub platforms: Option<BTreeSet<Platform>>,
    pub archive_path: PathBuf,
    /// SHA-256 of the archive bytes the descriptor was extracted from.
    pub fingerprint: String,
}

impl ToolDescriptor {
    /// Whether the tool may run on `platform`.
    pub fn supports(&self, platform: Platform) -> bool {
        match &self.platforms {
            None => true,
            Some(set) => set.contains(&platform),
        }
    }

    pub fn requirement_strings(&self) -> Vec<String> {
        self.requirements
            .iter()
            .map(|spec| spec.raw().to_string())
            .collect()
    }
}
