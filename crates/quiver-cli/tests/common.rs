#![allow(dead_code)]

use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;

use assert_cmd::assert::Assert;
use serde_json::Value;
use zip::write::FileOptions;
use zip::ZipWriter;

pub fn parse_json(assert: &Assert) -> Value {
    serde_json::from_slice(&assert.get_output().stdout).expect("valid json")
}

/// Builds a minimal wheel: METADATA plus a console-script entry point.
pub fn write_wheel(dir: &Path, name: &str, version: &str, requires: &[&str]) {
    write_wheel_with(dir, name, version, requires, None);
}

/// Same, with an optional extra dist-info file (e.g. `launch.toml`).
pub fn write_wheel_with(
    dir: &Path,
    name: &str,
    version: &str,
    requires: &[&str],
    extra: Option<(&str, &str)>,
) {
    let underscored = name.replace('-', "_");
    let dist_info = format!("{underscored}-{version}.dist-info");
    let mut metadata = format!(
        "Metadata-Version: 2.1\nName: {name}\nVersion: {version}\nSummary: fixture tool\n"
    );
    for spec in requires {
        metadata.push_str(&format!("Requires-Dist: {spec}\n"));
    }
    metadata.push('\n');
    let entry_points = format!("[console_scripts]\n{name} = {underscored}.cli:main\n");

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
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
    if let Some((file, contents)) = extra {
        writer
            .start_file(format!("{dist_info}/{file}"), FileOptions::default())
            .expect("extra entry");
        writer.write_all(contents.as_bytes()).expect("extra file");
    }
    let bytes = writer.finish().expect("finish wheel").into_inner();

    fs::create_dir_all(dir).expect("wheel dir");
    fs::write(
        dir.join(format!("{underscored}-{version}-py3-none-any.whl")),
        bytes,
    )
    .expect("write wheel");
}
