use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

use toml_edit::{DocumentMut, Item};
use zip::ZipArchive;

use quiver_domain::{
    archive_fingerprint, normalize_name, DependencySpecifier, EntryPoint, Platform,
    ToolDescriptor,
};

use crate::error::CoreError;

/// Reads a tool descriptor out of a wheel archive. Metadata is read as
/// structured text only; nothing inside the archive is ever executed.
pub fn extract(path: &Path) -> Result<ToolDescriptor, CoreError> {
    let bytes = fs::read(path).map_err(|err| CoreError::MalformedArchive {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    extract_bytes(path, &bytes)
}

/// Same as [`extract`] for bytes the caller already read (the registry
/// reads archives itself so it can retry transient I/O).
pub fn extract_bytes(path: &Path, bytes: &[u8]) -> Result<ToolDescriptor, CoreError> {
    if path.extension().and_then(|ext| ext.to_str()) != Some("whl") {
        return Err(CoreError::MalformedArchive {
            path: path.to_path_buf(),
            reason: "not a .whl archive".into(),
        });
    }
    let fingerprint = archive_fingerprint(bytes);
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|err| CoreError::MalformedArchive {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;

    let metadata_name = locate_dist_info_file(&archive, "METADATA").ok_or_else(|| {
        CoreError::MissingMetadata {
            path: path.to_path_buf(),
            field: "METADATA".into(),
        }
    })?;
    let metadata = parse_metadata(&read_archive_file(path, &mut archive, &metadata_name)?);

    let display_name = metadata
        .first("Name")
        .ok_or_else(|| CoreError::MissingMetadata {
            path: path.to_path_buf(),
            field: "Name".into(),
        })?
        .to_string();
    let version = metadata
        .first("Version")
        .ok_or_else(|| CoreError::MissingMetadata {
            path: path.to_path_buf(),
            field: "Version".into(),
        })?
        .to_string();
    let name = normalize_name(&display_name);

    let mut requirements = Vec::new();
    for raw in metadata.all("Requires-Dist") {
        let spec =
            DependencySpecifier::parse(raw).map_err(|err| CoreError::MalformedArchive {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        // Extra-gated requirements belong to optional features.
        if !spec.is_extra_gated() {
            requirements.push(spec);
        }
    }

    let console_scripts = match locate_dist_info_file(&archive, "entry_points.txt") {
        Some(file) => {
            parse_console_scripts(&read_archive_file(path, &mut archive, &file)?)
        }
        None => BTreeMap::new(),
    };
    let launch = match locate_dist_info_file(&archive, "launch.toml") {
        Some(file) => Some(parse_launch(
            path,
            &read_archive_file(path, &mut archive, &file)?,
        )?),
        None => None,
    };

    let entry_point = resolve_entry_point(path, &name, &console_scripts, launch.as_ref())?;
    let platforms = match launch.as_ref().and_then(|launch| launch.platforms.clone()) {
        Some(set) => Some(set),
        None => platforms_from_wheel_tag(path),
    };

    Ok(ToolDescriptor {
        name,
        display_name,
        version,
        summary: metadata.first("Summary").map(ToString::to_string),
        entry_point,
        requirements,
        python_requirement: metadata.first("Requires-Python").map(ToString::to_string),
        platforms,
        archive_path: path.to_path_buf(),
        fingerprint,
    })
}

/// RFC 822 style headers from a wheel METADATA file, multi-valued keys
/// preserved in order. Parsing stops at the blank line before the long
/// description body.
struct MetadataHeaders {
    fields: BTreeMap<String, Vec<String>>,
}

impl MetadataHeaders {
    fn first(&self, key: &str) -> Option<&str> {
        self.fields
            .get(&key.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    fn all<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .get(&key.to_ascii_lowercase())
            .into_iter()
            .flatten()
            .map(String::as_str)
    }
}

fn parse_metadata(contents: &str) -> MetadataHeaders {
    let mut fields: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut current: Option<String> = None;
    for line in contents.lines() {
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Folded continuation of the previous header.
            if let Some(key) = &current {
                if let Some(values) = fields.get_mut(key) {
                    if let Some(last) = values.last_mut() {
                        last.push(' ');
                        last.push_str(line.trim());
                    }
                }
            }
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        fields
            .entry(key.clone())
            .or_default()
            .push(value.trim().to_string());
        current = Some(key);
    }
    MetadataHeaders { fields }
}

fn parse_console_scripts(contents: &str) -> BTreeMap<String, String> {
    let mut scripts = BTreeMap::new();
    let mut in_section = false;
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') {
            in_section = trimmed.eq_ignore_ascii_case("[console_scripts]");
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some((script, target)) = trimmed.split_once('=') {
            scripts
                .entry(script.trim().to_string())
                .or_insert_with(|| target.trim().to_string());
        }
    }
    scripts
}

/// Optional launch record in the dist-info directory, carrying the
/// non-console entry-point methods and platform restrictions.
struct LaunchRecord {
    module: Option<String>,
    script: Option<String>,
    command: Option<Vec<String>>,
    platforms: Option<BTreeSet<Platform>>,
}

fn parse_launch(path: &Path, contents: &str) -> Result<LaunchRecord, CoreError> {
    let doc: DocumentMut = contents
        .parse()
        .map_err(|err| CoreError::MalformedArchive {
            path: path.to_path_buf(),
            reason: format!("invalid launch.toml: {err}"),
        })?;
    let module = doc.get("module").and_then(Item::as_str).map(str::to_string);
    let script = doc.get("script").and_then(Item::as_str).map(str::to_string);
    let command = match doc.get("command") {
        Some(item) => {
            let array = item.as_array().ok_or_else(|| CoreError::MalformedArchive {
                path: path.to_path_buf(),
                reason: "launch.toml `command` must be an array of strings".into(),
            })?;
            let mut argv = Vec::with_capacity(array.len());
            for value in array.iter() {
                let text = value.as_str().ok_or_else(|| CoreError::MalformedArchive {
                    path: path.to_path_buf(),
                    reason: "launch.toml `command` must be an array of strings".into(),
                })?;
                argv.push(text.to_string());
            }
            Some(argv)
        }
        None => None,
    };
    let platforms = match doc.get("platforms") {
        Some(item) => {
            let array = item.as_array().ok_or_else(|| CoreError::MalformedArchive {
                path: path.to_path_buf(),
                reason: "launch.toml `platforms` must be an array".into(),
            })?;
            let mut set = BTreeSet::new();
            for value in array.iter() {
                let text = value.as_str().unwrap_or_default();
                let platform =
                    Platform::parse(text).ok_or_else(|| CoreError::MalformedArchive {
                        path: path.to_path_buf(),
                        reason: format!("unknown platform `{text}` in launch.toml"),
                    })?;
                set.insert(platform);
            }
            Some(set)
        }
        None => None,
    };
    Ok(LaunchRecord {
        module,
        script,
        command,
        platforms,
    })
}

fn resolve_entry_point(
    path: &Path,
    normalized_name: &str,
    console_scripts: &BTreeMap<String, String>,
    launch: Option<&LaunchRecord>,
) -> Result<EntryPoint, CoreError> {
    let mut methods: Vec<(&'static str, EntryPoint)> = Vec::new();
    if !console_scripts.is_empty() {
        // Prefer the script matching the tool name; fall back to the first
        // (BTreeMap order keeps this deterministic).
        let chosen = console_scripts
            .keys()
            .find(|script| normalize_name(script) == normalized_name)
            .or_else(|| console_scripts.keys().next())
            .expect("non-empty script map");
        methods.push(("console script", EntryPoint::Console(chosen.clone())));
    }
    if let Some(launch) = launch {
        if let Some(module) = &launch.module {
            methods.push(("module", EntryPoint::Module(module.clone())));
        }
        if let Some(script) = &launch.script {
            methods.push(("script", EntryPoint::Script(script.clone())));
        }
        if let Some(command) = &launch.command {
            methods.push(("command", EntryPoint::Argv(command.clone())));
        }
    }
    match methods.len() {
        0 => {
            // No declared method: fall back to the import-name convention.
            Ok(EntryPoint::Module(normalized_name.replace('-', "_")))
        }
        1 => Ok(methods.remove(0).1),
        _ => Err(CoreError::AmbiguousEntryPoint {
            path: path.to_path_buf(),
            methods: methods
                .iter()
                .map(|(label, _)| *label)
                .collect::<Vec<_>>()
                .join(", "),
        }),
    }
}

fn platforms_from_wheel_tag(path: &Path) -> Option<BTreeSet<Platform>> {
    let stem = path.file_stem()?.to_str()?;
    let tag = stem.rsplit('-').next()?;
    let mut set = BTreeSet::new();
    for sub in tag.split('.') {
        if sub == "any" {
            return None;
        }
        if sub.starts_with("win") {
            set.insert(Platform::Windows);
        } else if sub.starts_with("macosx") {
            set.insert(Platform::Macos);
        } else if sub.contains("linux") {
            set.insert(Platform::Linux);
        }
    }
    if set.is_empty() {
        None
    } else {
        Some(set)
    }
}

fn locate_dist_info_file<R: Read + std::io::Seek>(
    archive: &ZipArchive<R>,
    file: &str,
) -> Option<String> {
    let suffix = format!(".dist-info/{file}");
    let mut candidates: Vec<String> = archive
        .file_names()
        .filter(|name| name.ends_with(&suffix))
        .map(str::to_string)
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

fn read_archive_file(
    path: &Path,
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<String, CoreError> {
    let mut file = archive
        .by_name(name)
        .map_err(|err| CoreError::MalformedArchive {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|err| CoreError::MalformedArchive {
            path: path.to_path_buf(),
            reason: format!("unreadable {name}: {err}"),
        })?;
    Ok(contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn wheel_bytes(dist_info: &str, files: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in files {
            writer
                .start_file(format!("{dist_info}/{name}"), FileOptions::default())
                .expect("start file");
            writer.write_all(contents.as_bytes()).expect("write file");
        }
        writer.finish().expect("finish zip").into_inner()
    }

    fn metadata(name: &str, version: &str, requires: &[&str]) -> String {
        let mut out = format!(
            "Metadata-Version: 2.1\nName: {name}\nVersion: {version}\nSummary: Demo tool\n"
        );
        for spec in requires {
            out.push_str(&format!("Requires-Dist: {spec}\n"));
        }
        out.push_str("\nLong description follows.\n");
        out
    }

    #[test]
    fn extracts_descriptor_from_console_wheel() {
        let bytes = wheel_bytes(
            "demo_tool-1.2.0.dist-info",
            &[
                ("METADATA", &metadata("demo-tool", "1.2.0", &["click>=7.0"])),
                (
                    "entry_points.txt",
                    "[console_scripts]\ndemo-tool = demo_tool.cli:main\n",
                ),
            ],
        );
        let path = Path::new("demo_tool-1.2.0-py3-none-any.whl");
        let descriptor = extract_bytes(path, &bytes).expect("descriptor");
        assert_eq!(descriptor.name, "demo-tool");
        assert_eq!(descriptor.version, "1.2.0");
        assert_eq!(
            descriptor.entry_point,
            EntryPoint::Console("demo-tool".into())
        );
        assert_eq!(descriptor.requirements.len(), 1);
        assert_eq!(descriptor.requirements[0].name(), "click");
        assert!(descriptor.platforms.is_none());
        assert_eq!(descriptor.summary.as_deref(), Some("Demo tool"));
    }

    #[test]
    fn extraction_is_deterministic() {
        let bytes = wheel_bytes(
            "demo-1.0.dist-info",
            &[("METADATA", &metadata("demo", "1.0", &["requests>=2.0"]))],
        );
        let path = Path::new("demo-1.0-py3-none-any.whl");
        let first = extract_bytes(path, &bytes).expect("first");
        let second = extract_bytes(path, &bytes).expect("second");
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(first.name, second.name);
        assert_eq!(first.entry_point, second.entry_point);
        assert_eq!(first.requirement_strings(), second.requirement_strings());
    }

    #[test]
    fn missing_name_is_field_specific() {
        let bytes = wheel_bytes(
            "demo-1.0.dist-info",
            &[("METADATA", "Metadata-Version: 2.1\nVersion: 1.0\n\n")],
        );
        let err =
            extract_bytes(Path::new("demo-1.0-py3-none-any.whl"), &bytes).unwrap_err();
        let CoreError::MissingMetadata { field, .. } = err else {
            panic!("expected MissingMetadata, got {err}");
        };
        assert_eq!(field, "Name");
    }

    #[test]
    fn missing_metadata_file_is_reported() {
        let bytes = wheel_bytes("demo-1.0.dist-info", &[("RECORD", "")]);
        let err =
            extract_bytes(Path::new("demo-1.0-py3-none-any.whl"), &bytes).unwrap_err();
        assert!(matches!(err, CoreError::MissingMetadata { field, .. } if field == "METADATA"));
    }

    #[test]
    fn non_zip_bytes_are_malformed() {
        let err = extract_bytes(Path::new("demo-1.0-py3-none-any.whl"), b"not a zip")
            .unwrap_err();
        assert!(matches!(err, CoreError::MalformedArchive { .. }));
    }

    #[test]
    fn wrong_extension_is_malformed() {
        let err = extract_bytes(Path::new("demo-1.0.tar.gz"), b"").unwrap_err();
        assert!(matches!(err, CoreError::MalformedArchive { .. }));
    }

    #[test]
    fn console_plus_launch_module_is_ambiguous() {
        let bytes = wheel_bytes(
            "demo-1.0.dist-info",
            &[
                ("METADATA", &metadata("demo", "1.0", &[])),
                (
                    "entry_points.txt",
                    "[console_scripts]\ndemo = demo.cli:main\n",
                ),
                ("launch.toml", "module = \"demo.cli\"\n"),
            ],
        );
        let err =
            extract_bytes(Path::new("demo-1.0-py3-none-any.whl"), &bytes).unwrap_err();
        let CoreError::AmbiguousEntryPoint { methods, .. } = err else {
            panic!("expected AmbiguousEntryPoint");
        };
        assert!(methods.contains("console script"));
        assert!(methods.contains("module"));
    }

    #[test]
    fn launch_command_and_platforms_parse() {
        let bytes = wheel_bytes(
            "demo-1.0.dist-info",
            &[
                ("METADATA", &metadata("demo", "1.0", &[])),
                (
                    "launch.toml",
                    "command = [\"demo-server\", \"--serve\"]\nplatforms = [\"linux\", \"macos\"]\n",
                ),
            ],
        );
        let descriptor =
            extract_bytes(Path::new("demo-1.0-py3-none-any.whl"), &bytes).expect("descriptor");
        assert_eq!(
            descriptor.entry_point,
            EntryPoint::Argv(vec!["demo-server".into(), "--serve".into()])
        );
        let platforms = descriptor.platforms.expect("platforms");
        assert!(platforms.contains(&Platform::Linux));
        assert!(platforms.contains(&Platform::Macos));
        assert!(!platforms.contains(&Platform::Windows));
    }

    #[test]
    fn no_declared_method_falls_back_to_module() {
        let bytes = wheel_bytes(
            "demo_tool-1.0.dist-info",
            &[("METADATA", &metadata("demo-tool", "1.0", &[]))],
        );
        let descriptor = extract_bytes(Path::new("demo_tool-1.0-py3-none-any.whl"), &bytes)
            .expect("descriptor");
        assert_eq!(descriptor.entry_point, EntryPoint::Module("demo_tool".into()));
    }

    #[test]
    fn extra_gated_requirements_are_dropped() {
        let bytes = wheel_bytes(
            "demo-1.0.dist-info",
            &[(
                "METADATA",
                &metadata(
                    "demo",
                    "1.0",
                    &["click>=7.0", "pytest>=7; extra == \"dev\""],
                ),
            )],
        );
        let descriptor =
            extract_bytes(Path::new("demo-1.0-py3-none-any.whl"), &bytes).expect("descriptor");
        assert_eq!(descriptor.requirements.len(), 1);
        assert_eq!(descriptor.requirements[0].name(), "click");
    }

    #[test]
    fn platform_tag_restricts_descriptor() {
        let bytes = wheel_bytes(
            "demo-1.0.dist-info",
            &[("METADATA", &metadata("demo", "1.0", &[]))],
        );
        let descriptor = extract_bytes(
            Path::new("demo-1.0-cp311-cp311-manylinux_2_17_x86_64.whl"),
            &bytes,
        )
        .expect("descriptor");
        let platforms = descriptor.platforms.expect("platforms");
        assert_eq!(platforms.len(), 1);
        assert!(platforms.contains(&Platform::Linux));
    }
}
