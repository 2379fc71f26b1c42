#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod descriptor;
pub mod fingerprint;
pub mod manifest;
pub mod reconcile;
pub mod specifier;

pub use descriptor::{normalize_name, EntryPoint, Platform, ToolDescriptor};
pub use fingerprint::archive_fingerprint;
pub use manifest::{KitManifest, NameConflict, SkippedArchive};
pub use reconcile::{
    installed_from_pairs, reconcile, InstalledPackages, ReconciliationResult, SpecifierConflict,
};
pub use specifier::{DependencySpecifier, SpecifierError};
