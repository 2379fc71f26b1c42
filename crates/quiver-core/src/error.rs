use std::path::PathBuf;

use thiserror::Error;

use quiver_domain::{NameConflict, SpecifierConflict};

/// The failure taxonomy surfaced to callers. Every variant names the
/// offending tool, archive, or specifier so nothing collapses into a
/// generic "operation failed".
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("archive {} is not a readable package archive: {reason}", .path.display())]
    MalformedArchive { path: PathBuf, reason: String },

    #[error("archive {} is missing required metadata field `{field}`", .path.display())]
    MissingMetadata { path: PathBuf, field: String },

    #[error("archive {} declares more than one entry-point method ({methods})", .path.display())]
    AmbiguousEntryPoint { path: PathBuf, methods: String },

    #[error(transparent)]
    NameConflict(#[from] NameConflict),

    #[error("provisioning failed for `{tool}`: {cause}")]
    ProvisioningFailed { tool: String, cause: String },

    #[error("environment for `{tool}` failed verification: {detail}")]
    VerificationFailed { tool: String, detail: String },

    #[error("dependency conflict for `{tool}`: {}", conflict_summary(.conflicts))]
    DependencyConflict {
        tool: String,
        conflicts: Vec<SpecifierConflict>,
    },

    #[error("tool `{name}` not found")]
    ToolNotFound { name: String },

    #[error("no environment installed for `{name}`")]
    EnvironmentNotFound { name: String },

    #[error("tool `{tool}` does not support this platform ({platform})")]
    PlatformUnsupported { tool: String, platform: String },

    #[error("{operation} for `{tool}` exceeded the {seconds}s bound")]
    Timeout {
        tool: String,
        operation: String,
        seconds: u64,
    },
}

impl CoreError {
    /// Stable machine-readable tag, carried in outcome details.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::MalformedArchive { .. } => "malformed_archive",
            CoreError::MissingMetadata { .. } => "missing_metadata",
            CoreError::AmbiguousEntryPoint { .. } => "ambiguous_entry_point",
            CoreError::NameConflict(_) => "name_conflict",
            CoreError::ProvisioningFailed { .. } => "provisioning_failed",
            CoreError::VerificationFailed { .. } => "verification_failed",
            CoreError::DependencyConflict { .. } => "dependency_conflict",
            CoreError::ToolNotFound { .. } => "tool_not_found",
            CoreError::EnvironmentNotFound { .. } => "environment_not_found",
            CoreError::PlatformUnsupported { .. } => "platform_unsupported",
            CoreError::Timeout { .. } => "timeout",
        }
    }
}

fn conflict_summary(conflicts: &[SpecifierConflict]) -> String {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{} (installed {})",
                conflict.specifier, conflict.installed
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}
