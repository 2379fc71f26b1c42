use std::collections::BTreeSet;

use anyhow::Result;
use serde_json::{json, Value};
use tracing::debug;

use quiver_domain::{normalize_name, reconcile, Platform, ReconciliationResult, ToolDescriptor};

use crate::config::Paths;
use crate::effects::SharedEffects;
use crate::error::CoreError;
use crate::outcome::ExecutionOutcome;
use crate::registry::{Registry, DEFAULT_KIT};
use crate::store::{EnsureMode, EnvStatus, EnvironmentStore};

/// Sequences extraction, reconciliation, provisioning and execution for the
/// commands the CLI exposes. Holds no mutable state of its own: everything
/// durable lives behind the store, everything discoverable behind the
/// registry.
pub struct Orchestrator {
    paths: Paths,
    registry: Registry,
    store: EnvironmentStore,
    effects: SharedEffects,
}

impl Orchestrator {
    pub fn new(paths: Paths, effects: SharedEffects) -> Result<Self> {
        let registry = Registry::new(paths.clone());
        let store = EnvironmentStore::new(paths.clone(), effects.clone())?;
        Ok(Self {
            paths,
            registry,
            store,
            effects,
        })
    }

    pub fn from_env(effects: SharedEffects) -> Result<Self> {
        Self::new(Paths::from_env()?, effects)
    }

    /// Installs (or repairs) a tool's environment. Conflicts fail with the
    /// offending specifiers and mutate nothing further.
    pub fn install(&self, name: &str) -> Result<ExecutionOutcome> {
        let descriptor = match self.resolve(name) {
            Resolved::Found(descriptor) => descriptor,
            Resolved::Outcome(outcome) => return Ok(outcome),
        };
        if let Some(outcome) = platform_gate(&descriptor) {
            return Ok(outcome);
        }
        match self.store.ensure(&descriptor, EnsureMode::Repair) {
            Ok(record) => Ok(ExecutionOutcome::success(
                format!(
                    "installed tool {} {}",
                    descriptor.name, descriptor.version
                ),
                json!({
                    "tool": descriptor.name,
                    "version": descriptor.version,
                    "status": record.status,
                    "entry_point": descriptor.entry_point.kind(),
                    "packages": record.installed_packages.len(),
                }),
            )),
            Err(err) => Ok(ExecutionOutcome::from_error(&err)),
        }
    }

    /// Runs a tool's entry point. Requires an existing environment: `run`
    /// never provisions from scratch, and a broken environment blocks
    /// unconditionally until an explicit reinstall.
    pub fn run(&self, name: &str, args: &[String]) -> Result<ExecutionOutcome> {
        let descriptor = match self.resolve(name) {
            Resolved::Found(descriptor) => descriptor,
            Resolved::Outcome(outcome) => return Ok(outcome),
        };
        if let Some(outcome) = platform_gate(&descriptor) {
            return Ok(outcome);
        }
        let record = match self.store.ensure(&descriptor, EnsureMode::Verify) {
            Ok(record) => record,
            Err(err) => return Ok(ExecutionOutcome::from_error(&err)),
        };
        debug!(tool = %descriptor.name, status = %record.status, "executing entry point");
        let runtime = self.store.runtime_handle(&descriptor.name);
        let output = match self
            .effects
            .executor()
            .execute(&runtime, &descriptor.entry_point, args)
        {
            Ok(output) => output,
            Err(err) => {
                return Ok(ExecutionOutcome::failure(
                    format!("failed to launch {}", descriptor.entry_point),
                    json!({
                        "tool": descriptor.name,
                        "error": err.to_string(),
                    }),
                ))
            }
        };
        let details = json!({
            "tool": descriptor.name,
            "exit_code": output.code,
            "entry_point": descriptor.entry_point.kind(),
            "passthrough": true,
        });
        if output.code == 0 {
            Ok(ExecutionOutcome::success(
                format!("{} exited successfully", descriptor.name),
                details,
            ))
        } else {
            Ok(ExecutionOutcome::failure(
                format!("{} exited with status {}", descriptor.name, output.code),
                details,
            ))
        }
    }

    /// Tears down a tool's environment. The source archive stays.
    pub fn uninstall(&self, name: &str) -> Result<ExecutionOutcome> {
        let Some(normalized) = valid_name(name) else {
            return Ok(invalid_name_outcome());
        };
        let record = self.store.load(&normalized)?;
        let runtime_present = self.store.runtime_handle(&normalized).root.exists();
        if record.status == EnvStatus::Absent && !runtime_present {
            return match self.registry.find_tool(&normalized) {
                Ok(Some(_)) => Ok(ExecutionOutcome::success(
                    format!("tool {normalized} is not installed"),
                    json!({ "tool": normalized, "status": EnvStatus::Absent }),
                )),
                Ok(None) => Ok(ExecutionOutcome::from_error(&CoreError::ToolNotFound {
                    name: normalized,
                })),
                Err(err) => Ok(ExecutionOutcome::from_error(&err)),
            };
        }
        match self.store.destroy(&normalized) {
            Ok(previous) => Ok(ExecutionOutcome::success(
                format!("uninstalled tool {normalized}"),
                json!({ "tool": normalized, "previous_status": previous }),
            )),
            Err(err) => Ok(ExecutionOutcome::failure(
                format!("could not uninstall {normalized}"),
                json!({ "tool": normalized, "error": err.to_string() }),
            )),
        }
    }

    /// Read-only detail view of one tool: descriptor, environment status,
    /// and reconciliation against the recorded snapshot.
    pub fn info(&self, name: &str) -> Result<ExecutionOutcome> {
        let descriptor = match self.resolve(name) {
            Resolved::Found(descriptor) => descriptor,
            Resolved::Outcome(outcome) => return Ok(outcome),
        };
        let record = self.store.refresh(&descriptor.name)?;
        let reconciliation = match record.status {
            EnvStatus::Ready | EnvStatus::Stale => Some(reconciliation_details(
                &reconcile(&descriptor.requirements, &record.installed_packages),
            )),
            _ => None,
        };
        let details = json!({
            "tool": descriptor.name,
            "display_name": descriptor.display_name,
            "version": descriptor.version,
            "summary": descriptor.summary,
            "entry_point": {
                "kind": descriptor.entry_point.kind(),
                "target": descriptor.entry_point.to_string(),
            },
            "requirements": descriptor.requirement_strings(),
            "requires_python": descriptor.python_requirement,
            "platforms": descriptor.platforms,
            "archive": descriptor.archive_path.display().to_string(),
            "fingerprint": descriptor.fingerprint,
            "environment": {
                "status": record.status,
                "last_verified_at": record.last_verified_at,
                "packages": record.installed_packages.len(),
            },
            "reconciliation": reconciliation,
        });
        Ok(ExecutionOutcome::success(
            format!("{} {}", descriptor.name, descriptor.version),
            details,
        ))
    }

    /// Lists every tool the registry knows, with environment status.
    pub fn list_tools(&self) -> Result<ExecutionOutcome> {
        let (kits, failures) = self.registry.load_all_lenient();
        let mut seen = BTreeSet::new();
        let mut rows = Vec::new();
        for kit in &kits {
            for descriptor in kit.tools() {
                if !seen.insert(descriptor.name.clone()) {
                    continue;
                }
                let status = self
                    .store
                    .refresh(&descriptor.name)
                    .map(|record| record.status)
                    .unwrap_or(EnvStatus::Absent);
                rows.push(json!({
                    "name": descriptor.name,
                    "version": descriptor.version,
                    "status": status,
                    "kit": kit.name(),
                    "summary": descriptor.summary,
                }));
            }
        }
        rows.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        let errors: Vec<Value> = failures
            .iter()
            .map(|(kit, err)| json!({ "kit": kit, "error": err.to_string() }))
            .collect();
        let message = if rows.is_empty() {
            "no tools available".to_string()
        } else {
            format!("{} tool(s) available", rows.len())
        };
        Ok(ExecutionOutcome::success(
            message,
            json!({ "tools": rows, "errors": errors }),
        ))
    }

    /// Read-only diagnostics over the whole installation. Never fails:
    /// every problem is aggregated into the report so diagnostics complete
    /// even when individual tools are broken.
    pub fn doctor(&self) -> Result<ExecutionOutcome> {
        let mut issues = 0usize;
        let platform = Platform::current();

        let (kits, failures) = self.registry.load_all_lenient();
        let mut kit_reports = Vec::new();
        for kit in &kits {
            issues += kit.skipped().len();
            kit_reports.push(json!({
                "kit": kit.name(),
                "tools": kit.len(),
                "skipped": kit.skipped(),
            }));
        }
        for (kit, err) in &failures {
            issues += 1;
            kit_reports.push(json!({
                "kit": kit,
                "error": err.to_string(),
                "reason": err.kind(),
            }));
        }

        let mut tool_reports = Vec::new();
        let mut registry_tools = BTreeSet::new();
        for kit in &kits {
            for descriptor in kit.tools() {
                if !registry_tools.insert(descriptor.name.clone()) {
                    continue;
                }
                let report = match self.store.refresh(&descriptor.name) {
                    Ok(record) => {
                        if record.status == EnvStatus::Broken {
                            issues += 1;
                        }
                        let reconciliation = match record.status {
                            EnvStatus::Ready | EnvStatus::Stale => {
                                let result =
                                    reconcile(&descriptor.requirements, &record.installed_packages);
                                if !result.is_satisfied() {
                                    issues += 1;
                                }
                                Some(reconciliation_details(&result))
                            }
                            _ => None,
                        };
                        json!({
                            "name": descriptor.name,
                            "version": descriptor.version,
                            "status": record.status,
                            "last_verified_at": record.last_verified_at,
                            "reconciliation": reconciliation,
                        })
                    }
                    Err(err) => {
                        issues += 1;
                        json!({
                            "name": descriptor.name,
                            "error": err.to_string(),
                        })
                    }
                };
                tool_reports.push(report);
            }
        }

        // Environments with no backing archive left in the registry.
        let mut orphans = Vec::new();
        for tool in self.store.known_tools()? {
            if !registry_tools.contains(&tool) {
                issues += 1;
                orphans.push(tool);
            }
        }

        let details = json!({
            "platform": platform.map(|p| p.to_string()),
            "kits": kit_reports,
            "tools": tool_reports,
            "orphaned_environments": orphans,
            "issues": issues,
        });
        Ok(ExecutionOutcome::success(
            format!("diagnostics complete: {issues} issue(s) found"),
            details,
        ))
    }

    /// Tears down every known environment. Idempotent: already-absent tools
    /// are no-ops, not errors.
    pub fn clean(&self) -> Result<ExecutionOutcome> {
        let mut removed = Vec::new();
        let mut failed = Vec::new();
        for tool in self.store.known_tools()? {
            match self.store.destroy(&tool) {
                Ok(_) => removed.push(tool),
                Err(err) => failed.push(json!({ "tool": tool, "error": err.to_string() })),
            }
        }
        let details = json!({ "removed": removed, "failed": failed });
        if failed.is_empty() {
            Ok(ExecutionOutcome::success(
                format!("cleaned {} environment(s)", removed.len()),
                details,
            ))
        } else {
            Ok(ExecutionOutcome::failure(
                "some environments could not be removed",
                details,
            ))
        }
    }

    pub fn list_kits(&self) -> Result<ExecutionOutcome> {
        let (kits, failures) = self.registry.load_all_lenient();
        let rows: Vec<Value> = kits
            .iter()
            .filter(|kit| kit.name() != DEFAULT_KIT || !kit.is_empty())
            .map(|kit| {
                json!({
                    "name": kit.name(),
                    "tools": kit.len(),
                    "skipped": kit.skipped().len(),
                })
            })
            .collect();
        let errors: Vec<Value> = failures
            .iter()
            .map(|(kit, err)| json!({ "kit": kit, "error": err.to_string() }))
            .collect();
        let message = if rows.is_empty() {
            "no kits available".to_string()
        } else {
            format!("{} kit(s) available", rows.len())
        };
        Ok(ExecutionOutcome::success(
            message,
            json!({ "kits": rows, "errors": errors }),
        ))
    }

    pub fn kit_info(&self, name: &str) -> Result<ExecutionOutcome> {
        let dir = if name == DEFAULT_KIT {
            self.paths.tools_dir()
        } else {
            self.paths.kits_dir().join(name)
        };
        if !dir.exists() {
            return Ok(ExecutionOutcome::user_error(
                format!("kit `{name}` not found"),
                json!({ "kit": name, "hint": "run `quiver kits` to see available kits" }),
            ));
        }
        let manifest = match self.registry.load_kit(name, &dir) {
            Ok(manifest) => manifest,
            Err(err) => return Ok(ExecutionOutcome::from_error(&err)),
        };
        let tools: Vec<Value> = manifest
            .tools()
            .map(|descriptor| {
                let status = self
                    .store
                    .refresh(&descriptor.name)
                    .map(|record| record.status)
                    .unwrap_or(EnvStatus::Absent);
                json!({
                    "name": descriptor.name,
                    "version": descriptor.version,
                    "status": status,
                })
            })
            .collect();
        Ok(ExecutionOutcome::success(
            format!("kit {} has {} tool(s)", name, manifest.len()),
            json!({
                "kit": name,
                "tools": tools,
                "skipped": manifest.skipped(),
            }),
        ))
    }

    fn resolve(&self, name: &str) -> Resolved {
        let Some(normalized) = valid_name(name) else {
            return Resolved::Outcome(invalid_name_outcome());
        };
        match self.registry.find_tool(&normalized) {
            Ok(Some(descriptor)) => Resolved::Found(descriptor),
            Ok(None) => Resolved::Outcome(ExecutionOutcome::from_error(
                &CoreError::ToolNotFound { name: normalized },
            )),
            // Registry errors (a kit conflict, say) surface with their own
            // envelope rather than aborting the command.
            Err(err) => Resolved::Outcome(ExecutionOutcome::from_error(&err)),
        }
    }
}

enum Resolved {
    Found(ToolDescriptor),
    Outcome(ExecutionOutcome),
}

fn valid_name(raw: &str) -> Option<String> {
    let normalized = normalize_name(raw);
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

fn invalid_name_outcome() -> ExecutionOutcome {
    ExecutionOutcome::user_error(
        "tool name must contain at least one alphanumeric character",
        json!({ "hint": "pass names like black or ruff" }),
    )
}

fn platform_gate(descriptor: &ToolDescriptor) -> Option<ExecutionOutcome> {
    let platform = Platform::current()?;
    if descriptor.supports(platform) {
        return None;
    }
    Some(ExecutionOutcome::from_error(
        &CoreError::PlatformUnsupported {
            tool: descriptor.name.clone(),
            platform: platform.to_string(),
        },
    ))
}

fn reconciliation_details(result: &ReconciliationResult) -> Value {
    match result {
        ReconciliationResult::Satisfied => json!({ "state": "satisfied" }),
        ReconciliationResult::NeedsInstall { missing } => json!({
            "state": "needs-install",
            "missing": missing.iter().map(|spec| spec.raw()).collect::<Vec<_>>(),
        }),
        ReconciliationResult::Conflicting { conflicts } => json!({
            "state": "conflicting",
            "conflicts": conflicts,
        }),
    }
}
