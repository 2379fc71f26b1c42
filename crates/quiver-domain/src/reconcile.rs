use std::collections::BTreeMap;
use std::str::FromStr;

use pep440_rs::Version;
use serde::Serialize;

use crate::descriptor::normalize_name;
use crate::specifier::DependencySpecifier;

/// Installed packages as reported by the runtime's installer, keyed by
/// normalized package name. Always taken from a snapshot, never assumed.
pub type InstalledPackages = BTreeMap<String, String>;

/// Builds an [`InstalledPackages`] map from raw (name, version) pairs,
/// normalizing names on the way in.
pub fn installed_from_pairs<I, S>(pairs: I) -> InstalledPackages
where
    I: IntoIterator<Item = (S, S)>,
    S: AsRef<str>,
{
    pairs
        .into_iter()
        .map(|(name, version)| {
            (
                normalize_name(name.as_ref()),
                version.as_ref().trim().to_string(),
            )
        })
        .collect()
}

/// One specifier whose installed counterpart violates it.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SpecifierConflict {
    pub specifier: String,
    pub package: String,
    pub installed: String,
    pub reason: String,
}

/// Outcome of comparing declared specifiers against an installed snapshot.
/// A pure value: recomputed on demand, never cached across calls that could
/// have changed environment state.
#[derive(Clone, Debug, PartialEq)]
pub enum ReconciliationResult {
    Satisfied,
    NeedsInstall { missing: Vec<DependencySpecifier> },
    Conflicting { conflicts: Vec<SpecifierConflict> },
}

impl ReconciliationResult {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, ReconciliationResult::Satisfied)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReconciliationResult::Satisfied => "satisfied",
            ReconciliationResult::NeedsInstall { .. } => "needs-install",
            ReconciliationResult::Conflicting { .. } => "conflicting",
        }
    }
}

/// Compares each declared specifier against the installed snapshot.
///
/// Missing packages classify as needs-install; a present package that
/// violates its constraint classifies as a conflict carrying the specifier
/// and the installed version. Any conflict makes the aggregate
/// `Conflicting`, which must reach the user; otherwise any missing package
/// makes it `NeedsInstall`, which is safe to resolve by installing.
pub fn reconcile(
    requirements: &[DependencySpecifier],
    installed: &InstalledPackages,
) -> ReconciliationResult {
    let mut missing = Vec::new();
    let mut conflicts = Vec::new();

    for spec in requirements {
        let Some(installed_version) = installed.get(spec.name()) else {
            missing.push(spec.clone());
            continue;
        };
        let Some(constraint) = spec.constraint() else {
            continue;
        };
        match Version::from_str(installed_version) {
            Ok(version) => {
                if !constraint.contains(&version) {
                    conflicts.push(SpecifierConflict {
                        specifier: spec.raw().to_string(),
                        package: spec.name().to_string(),
                        installed: installed_version.clone(),
                        reason: format!(
                            "installed version {installed_version} does not satisfy {constraint}"
                        ),
                    });
                }
            }
            Err(err) => {
                // An unreadable installed version is surfaced, not assumed
                // compatible.
                conflicts.push(SpecifierConflict {
                    specifier: spec.raw().to_string(),
                    package: spec.name().to_string(),
                    installed: installed_version.clone(),
                    reason: format!("installed version is not comparable: {err}"),
                });
            }
        }
    }

    if !conflicts.is_empty() {
        ReconciliationResult::Conflicting { conflicts }
    } else if !missing.is_empty() {
        ReconciliationResult::NeedsInstall { missing }
    } else {
        ReconciliationResult::Satisfied
    }
}
