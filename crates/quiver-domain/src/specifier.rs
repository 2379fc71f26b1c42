use std::fmt;
use std::str::FromStr;

use pep440_rs::VersionSpecifiers;
use pep508_rs::{Requirement, VersionOrUrl};
use thiserror::Error;

use crate::descriptor::normalize_name;

#[derive(Debug, Error)]
#[error("invalid dependency specifier `{raw}`: {reason}")]
pub struct SpecifierError {
    pub raw: String,
    pub reason: String,
}

/// One declared dependency: a package name plus an optional version
/// constraint. Parsing happens here; whether an installed version actually
/// satisfies the constraint is the reconciler's decision.
#[derive(Clone, Debug, PartialEq)]
pub struct DependencySpecifier {
    raw: String,
    name: String,
    constraint: Option<VersionSpecifiers>,
    marker: Option<String>,
}

impl DependencySpecifier {
    pub fn parse(raw: &str) -> Result<Self, SpecifierError> {
        let trimmed = raw.trim();
        let requirement = Requirement::from_str(trimmed).map_err(|err| SpecifierError {
            raw: trimmed.to_string(),
            reason: err.to_string(),
        })?;
        let constraint = match requirement.version_or_url {
            Some(VersionOrUrl::VersionSpecifier(specifiers)) => Some(specifiers),
            // Direct URL requirements carry no comparable constraint.
            Some(VersionOrUrl::Url(_)) | None => None,
        };
        let marker = requirement.marker.as_ref().map(ToString::to_string);
        Ok(Self {
            raw: trimmed.to_string(),
            name: normalize_name(&requirement.name.to_string()),
            constraint,
            marker,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Normalized package name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn constraint(&self) -> Option<&VersionSpecifiers> {
        self.constraint.as_ref()
    }

    pub fn marker(&self) -> Option<&str> {
        self.marker.as_deref()
    }

    /// True when the requirement only applies under an `extra == …` marker,
    /// i.e. it belongs to an optional feature set and is not installed by
    /// default.
    pub fn is_extra_gated(&self) -> bool {
        self.marker
            .as_deref()
            .is_some_and(|marker| marker.contains("extra"))
    }

    /// The requirement without its marker, as handed to the installer.
    pub fn install_spec(&self) -> String {
        match self.raw.split_once(';') {
            Some((head, _)) => head.trim().to_string(),
            None => self.raw.clone(),
        }
    }
}

impl fmt::Display for DependencySpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
