use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum CommandStatus {
    Ok,
    UserError,
    Failure,
}

/// Structured result of one orchestrator recipe: a status, a one-line
/// message, and machine-readable details. The CLI renders this either as a
/// JSON envelope or as human output; the engine never prints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: CommandStatus,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl ExecutionOutcome {
    pub fn success(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Ok,
            message: message.into(),
            details,
        }
    }

    pub fn failure(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Failure,
            message: message.into(),
            details,
        }
    }

    pub fn user_error(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::UserError,
            message: message.into(),
            details,
        }
    }

    /// Maps a typed engine error onto the outcome envelope, preserving the
    /// specific offender in `details`.
    pub fn from_error(err: &CoreError) -> Self {
        let mut details = json!({ "reason": err.kind() });
        match err {
            CoreError::MalformedArchive { path, .. }
            | CoreError::MissingMetadata { path, .. }
            | CoreError::AmbiguousEntryPoint { path, .. } => {
                details["archive"] = json!(path.display().to_string());
            }
            CoreError::NameConflict(conflict) => {
                details["kit"] = json!(conflict.kit);
                details["tool"] = json!(conflict.name);
                details["archives"] = json!([
                    conflict.first.display().to_string(),
                    conflict.second.display().to_string(),
                ]);
                details["hint"] = json!("remove or rename one of the archives");
            }
            CoreError::DependencyConflict { tool, conflicts } => {
                details["tool"] = json!(tool);
                details["conflicts"] = json!(conflicts);
            }
            CoreError::ToolNotFound { name } => {
                details["tool"] = json!(name);
                details["hint"] = json!("run `quiver list` to see available tools");
            }
            CoreError::EnvironmentNotFound { name } => {
                details["tool"] = json!(name);
                details["hint"] = json!(format!("run `quiver install {name}` first"));
            }
            CoreError::VerificationFailed { tool, detail } => {
                details["tool"] = json!(tool);
                details["detail"] = json!(detail);
                details["hint"] = json!(format!(
                    "run `quiver install {tool}` to rebuild the environment"
                ));
            }
            CoreError::ProvisioningFailed { tool, cause } => {
                details["tool"] = json!(tool);
                details["cause"] = json!(cause);
            }
            CoreError::PlatformUnsupported { tool, platform } => {
                details["tool"] = json!(tool);
                details["platform"] = json!(platform);
            }
            CoreError::Timeout {
                tool,
                operation,
                seconds,
            } => {
                details["tool"] = json!(tool);
                details["operation"] = json!(operation);
                details["timeout_secs"] = json!(seconds);
            }
        }
        let message = err.to_string();
        match err {
            CoreError::ProvisioningFailed { .. } | CoreError::Timeout { .. } => {
                Self::failure(message, details)
            }
            _ => Self::user_error(message, details),
        }
    }
}
