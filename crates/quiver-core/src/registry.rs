use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};
use walkdir::WalkDir;

use quiver_domain::{KitManifest, ToolDescriptor};

use crate::config::Paths;
use crate::error::CoreError;
use crate::extractor;

/// Name of the anonymous kit formed by loose archives in the tools dir.
pub const DEFAULT_KIT: &str = "tools";

const READ_ATTEMPTS: u32 = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Discovers archives on disk and assembles them into kit manifests. The
/// registry is read-only during normal operation; archives are added and
/// removed by the user, not by quiver.
pub struct Registry {
    paths: Paths,
}

impl Registry {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    /// Loads one kit directory. A normalized-name collision fails the whole
    /// load; archives whose metadata cannot be extracted are recorded as
    /// skipped (and surfaced by `doctor`), so a kit directory may be
    /// populated incrementally without breaking every command.
    pub fn load_kit(&self, name: &str, dir: &Path) -> Result<KitManifest, CoreError> {
        let mut manifest = KitManifest::new(name, dir);
        if !dir.exists() {
            return Ok(manifest);
        }
        for archive in sorted_wheel_paths(dir) {
            let bytes = match read_with_retry(&archive) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(archive = %archive.display(), error = %err, "unreadable archive skipped");
                    manifest.record_skipped(&archive, format!("unreadable: {err}"));
                    continue;
                }
            };
            match extractor::extract_bytes(&archive, &bytes) {
                Ok(descriptor) => manifest.insert(descriptor)?,
                Err(err) => {
                    warn!(archive = %archive.display(), error = %err, "invalid archive skipped");
                    manifest.record_skipped(&archive, err.to_string());
                }
            }
        }
        debug!(kit = name, tools = manifest.len(), "kit loaded");
        Ok(manifest)
    }

    /// All kits: the default loose-archive kit first, then named kit
    /// directories in sorted order.
    pub fn load_all(&self) -> Result<Vec<KitManifest>, CoreError> {
        let mut kits = vec![self.load_kit(DEFAULT_KIT, &self.paths.tools_dir())?];
        for (name, dir) in self.kit_dirs() {
            kits.push(self.load_kit(&name, &dir)?);
        }
        Ok(kits)
    }

    /// Like [`Registry::load_all`], but collects per-kit failures instead of
    /// stopping at the first. `doctor` needs the whole picture.
    pub fn load_all_lenient(&self) -> (Vec<KitManifest>, Vec<(String, CoreError)>) {
        let mut kits = Vec::new();
        let mut failures = Vec::new();
        match self.load_kit(DEFAULT_KIT, &self.paths.tools_dir()) {
            Ok(kit) => kits.push(kit),
            Err(err) => failures.push((DEFAULT_KIT.to_string(), err)),
        }
        for (name, dir) in self.kit_dirs() {
            match self.load_kit(&name, &dir) {
                Ok(kit) => kits.push(kit),
                Err(err) => failures.push((name, err)),
            }
        }
        (kits, failures)
    }

    /// Finds a tool by normalized name. Search order is deterministic:
    /// the default kit, then named kits sorted by name; the first match
    /// wins. Only duplicates inside one kit are errors.
    pub fn find_tool(&self, normalized_name: &str) -> Result<Option<ToolDescriptor>, CoreError> {
        for kit in self.load_all()? {
            if let Some(descriptor) = kit.get(normalized_name) {
                return Ok(Some(descriptor.clone()));
            }
        }
        Ok(None)
    }

    pub fn kit_names(&self) -> Vec<String> {
        self.kit_dirs().into_iter().map(|(name, _)| name).collect()
    }

    fn kit_dirs(&self) -> Vec<(String, PathBuf)> {
        let root = self.paths.kits_dir();
        let Ok(entries) = fs::read_dir(&root) else {
            return Vec::new();
        };
        let mut dirs: Vec<(String, PathBuf)> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| (name.to_string(), entry.path()))
            })
            .collect();
        dirs.sort();
        dirs
    }
}

fn sorted_wheel_paths(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("whl"))
        .collect()
}

/// Archive reads are retried a bounded number of times to ride out
/// transient I/O, then surfaced. Never an unbounded loop.
fn read_with_retry(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match fs::read(path) {
            Ok(bytes) => return Ok(bytes),
            Err(err) if attempt < READ_ATTEMPTS => {
                debug!(archive = %path.display(), attempt, error = %err, "archive read retry");
                std::thread::sleep(READ_RETRY_DELAY);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn write_wheel(dir: &Path, file_name: &str, dist_info: &str, name: &str, version: &str) {
        let metadata = format!(
            "Metadata-Version: 2.1\nName: {name}\nVersion: {version}\n\n"
        );
        let entry_points = format!("[console_scripts]\n{name} = {name}.cli:main\n");
        let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file(format!("{dist_info}/METADATA"), FileOptions::default())
            .expect("metadata entry");
        writer.write_all(metadata.as_bytes()).expect("metadata");
        writer
            .start_file(format!("{dist_info}/entry_points.txt"), FileOptions::default())
            .expect("entry points entry");
        writer
            .write_all(entry_points.as_bytes())
            .expect("entry points");
        let bytes = writer.finish().expect("finish").into_inner();
        fs::write(dir.join(file_name), bytes).expect("write wheel");
    }

    fn registry_at(home: &TempDir) -> Registry {
        Registry::new(Paths::at(home.path()))
    }

    #[test]
    fn empty_kit_directory_loads_as_empty_manifest() {
        let home = TempDir::new().expect("home");
        let registry = registry_at(&home);
        let kit_dir = home.path().join("kits").join("empty");
        fs::create_dir_all(&kit_dir).expect("kit dir");

        let manifest = registry.load_kit("empty", &kit_dir).expect("manifest");
        assert!(manifest.is_empty());
        assert!(manifest.skipped().is_empty());
    }

    #[test]
    fn loads_tools_and_finds_by_normalized_name() {
        let home = TempDir::new().expect("home");
        let tools = home.path().join("tools");
        fs::create_dir_all(&tools).expect("tools dir");
        write_wheel(
            &tools,
            "demo_tool-1.0-py3-none-any.whl",
            "demo_tool-1.0.dist-info",
            "Demo_Tool",
            "1.0",
        );
        let registry = registry_at(&home);

        let descriptor = registry
            .find_tool("demo-tool")
            .expect("lookup")
            .expect("found");
        assert_eq!(descriptor.display_name, "Demo_Tool");
        assert!(registry.find_tool("missing").expect("lookup").is_none());
    }

    #[test]
    fn name_collision_fails_the_whole_kit() {
        let home = TempDir::new().expect("home");
        let tools = home.path().join("tools");
        fs::create_dir_all(&tools).expect("tools dir");
        write_wheel(
            &tools,
            "demo_tool-1.0-py3-none-any.whl",
            "demo_tool-1.0.dist-info",
            "demo-tool",
            "1.0",
        );
        write_wheel(
            &tools,
            "demo.tool-2.0-py3-none-any.whl",
            "demo.tool-2.0.dist-info",
            "Demo.Tool",
            "2.0",
        );
        let registry = registry_at(&home);

        let err = registry
            .load_kit(DEFAULT_KIT, &tools)
            .expect_err("collision");
        let CoreError::NameConflict(conflict) = err else {
            panic!("expected NameConflict");
        };
        assert_eq!(conflict.name, "demo-tool");
        assert_ne!(conflict.first, conflict.second);
    }

    #[test]
    fn invalid_archive_is_skipped_not_fatal() {
        let home = TempDir::new().expect("home");
        let tools = home.path().join("tools");
        fs::create_dir_all(&tools).expect("tools dir");
        fs::write(tools.join("garbage-1.0-py3-none-any.whl"), b"not a zip")
            .expect("write garbage");
        write_wheel(
            &tools,
            "demo-1.0-py3-none-any.whl",
            "demo-1.0.dist-info",
            "demo",
            "1.0",
        );
        let registry = registry_at(&home);

        let manifest = registry
            .load_kit(DEFAULT_KIT, &tools)
            .expect("manifest despite garbage");
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.skipped().len(), 1);
        assert!(manifest.skipped()[0]
            .archive
            .ends_with("garbage-1.0-py3-none-any.whl"));
    }

    #[test]
    fn named_kits_enumerate_sorted() {
        let home = TempDir::new().expect("home");
        for kit in ["zeta", "alpha"] {
            fs::create_dir_all(home.path().join("kits").join(kit)).expect("kit dir");
        }
        let registry = registry_at(&home);
        assert_eq!(registry.kit_names(), vec!["alpha", "zeta"]);
    }
}
