use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use quiver_domain::{installed_from_pairs, EntryPoint, InstalledPackages};

use crate::config::Timeouts;
use crate::process::{run_command, run_command_passthrough, RunOutput};

/// Handle onto one tool's isolated runtime on disk.
#[derive(Clone, Debug)]
pub struct RuntimeHandle {
    pub tool: String,
    pub root: PathBuf,
}

impl RuntimeHandle {
    pub fn new(tool: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            root: root.into(),
        }
    }

    pub fn bin_dir(&self) -> PathBuf {
        if cfg!(windows) {
            self.root.join("Scripts")
        } else {
            self.root.join("bin")
        }
    }

    pub fn python_path(&self) -> PathBuf {
        if cfg!(windows) {
            self.bin_dir().join("python.exe")
        } else {
            self.bin_dir().join("python")
        }
    }

    pub fn exists(&self) -> bool {
        self.root.exists() && self.python_path().exists()
    }
}

/// Creates and destroys isolated runtimes. The store drives these; nothing
/// else touches runtime directories.
pub trait IsolationProvider: Send + Sync {
    fn create_runtime(&self, tool: &str, root: &Path) -> Result<RuntimeHandle>;
    fn destroy_runtime(&self, runtime: &RuntimeHandle) -> Result<()>;
    /// Cheap health probe: the runtime's interpreter answers at all.
    fn verify_runtime(&self, runtime: &RuntimeHandle) -> Result<()>;
}

/// Installs packages into a runtime and reports what is actually there.
/// The snapshot is the source of truth; install exit codes are not.
pub trait PackageInstaller: Send + Sync {
    fn install(&self, runtime: &RuntimeHandle, specifiers: &[String]) -> Result<()>;
    fn snapshot(&self, runtime: &RuntimeHandle) -> Result<InstalledPackages>;
}

/// Runs a tool's entry point inside its runtime.
pub trait EntryPointExecutor: Send + Sync {
    fn execute(
        &self,
        runtime: &RuntimeHandle,
        entry: &EntryPoint,
        args: &[String],
    ) -> Result<RunOutput>;
}

pub trait Effects: Send + Sync {
    fn isolation(&self) -> &dyn IsolationProvider;
    fn installer(&self) -> &dyn PackageInstaller;
    fn executor(&self) -> &dyn EntryPointExecutor;
}

pub type SharedEffects = Arc<dyn Effects>;

/// Production collaborators: `python -m venv` runtimes, the runtime's own
/// `pip` for installs and snapshots, subprocess execution for entry points.
pub struct SystemEffects {
    venv: Arc<VenvIsolation>,
    pip: Arc<PipInstaller>,
    executor: Arc<SystemExecutor>,
}

impl SystemEffects {
    pub fn new(timeouts: Timeouts) -> Self {
        Self {
            venv: Arc::new(VenvIsolation { timeouts }),
            pip: Arc::new(PipInstaller { timeouts }),
            executor: Arc::new(SystemExecutor),
        }
    }
}

impl Default for SystemEffects {
    fn default() -> Self {
        Self::new(Timeouts::from_env())
    }
}

impl Effects for SystemEffects {
    fn isolation(&self) -> &dyn IsolationProvider {
        self.venv.as_ref()
    }

    fn installer(&self) -> &dyn PackageInstaller {
        self.pip.as_ref()
    }

    fn executor(&self) -> &dyn EntryPointExecutor {
        self.executor.as_ref()
    }
}

fn host_interpreter() -> Result<PathBuf> {
    if let Some(explicit) = env::var_os("QUIVER_PYTHON") {
        return Ok(PathBuf::from(explicit));
    }
    which::which("python3")
        .or_else(|_| which::which("python"))
        .map_err(|_| anyhow!("no python interpreter found on PATH (set QUIVER_PYTHON)"))
}

struct VenvIsolation {
    timeouts: Timeouts,
}

impl IsolationProvider for VenvIsolation {
    fn create_runtime(&self, tool: &str, root: &Path) -> Result<RuntimeHandle> {
        let python = host_interpreter()?;
        if let Some(parent) = root.parent() {
            fs::create_dir_all(parent)?;
        }
        let output = run_command(
            &python.to_string_lossy(),
            &[
                "-m".to_string(),
                "venv".to_string(),
                root.to_string_lossy().to_string(),
            ],
            &[],
            Path::new("."),
            Some(self.timeouts.create),
        )?;
        if output.code != 0 {
            return Err(anyhow!(
                "venv creation exited with status {}: {}",
                output.code,
                output.stderr.trim()
            ));
        }
        let runtime = RuntimeHandle::new(tool, root);
        if !runtime.exists() {
            return Err(anyhow!(
                "venv reported success but {} is missing",
                runtime.python_path().display()
            ));
        }
        Ok(runtime)
    }

    fn destroy_runtime(&self, runtime: &RuntimeHandle) -> Result<()> {
        if runtime.root.exists() {
            fs::remove_dir_all(&runtime.root)
                .with_context(|| format!("removing {}", runtime.root.display()))?;
        }
        Ok(())
    }

    fn verify_runtime(&self, runtime: &RuntimeHandle) -> Result<()> {
        if !runtime.exists() {
            return Err(anyhow!(
                "runtime interpreter missing at {}",
                runtime.python_path().display()
            ));
        }
        let output = run_command(
            &runtime.python_path().to_string_lossy(),
            &["--version".to_string()],
            &[],
            Path::new("."),
            Some(self.timeouts.snapshot),
        )?;
        if output.code != 0 {
            return Err(anyhow!("runtime interpreter is not executable"));
        }
        Ok(())
    }
}

struct PipInstaller {
    timeouts: Timeouts,
}

impl PackageInstaller for PipInstaller {
    fn install(&self, runtime: &RuntimeHandle, specifiers: &[String]) -> Result<()> {
        if specifiers.is_empty() {
            return Ok(());
        }
        let mut args = vec![
            "-m".to_string(),
            "pip".to_string(),
            "install".to_string(),
            "--disable-pip-version-check".to_string(),
        ];
        args.extend(specifiers.iter().cloned());
        let output = run_command(
            &runtime.python_path().to_string_lossy(),
            &args,
            &[],
            Path::new("."),
            Some(self.timeouts.install),
        )?;
        if output.code != 0 {
            return Err(anyhow!(
                "pip install exited with status {}: {}",
                output.code,
                output.stderr.trim()
            ));
        }
        Ok(())
    }

    fn snapshot(&self, runtime: &RuntimeHandle) -> Result<InstalledPackages> {
        let output = run_command(
            &runtime.python_path().to_string_lossy(),
            &[
                "-m".to_string(),
                "pip".to_string(),
                "list".to_string(),
                "--format=freeze".to_string(),
                "--disable-pip-version-check".to_string(),
            ],
            &[],
            Path::new("."),
            Some(self.timeouts.snapshot),
        )?;
        if output.code != 0 {
            return Err(anyhow!(
                "pip list exited with status {}: {}",
                output.code,
                output.stderr.trim()
            ));
        }
        Ok(parse_freeze(&output.stdout))
    }
}

fn parse_freeze(stdout: &str) -> InstalledPackages {
    installed_from_pairs(stdout.lines().filter_map(|line| {
        let trimmed = line.trim();
        trimmed.split_once("==")
    }))
}

struct SystemExecutor;

impl EntryPointExecutor for SystemExecutor {
    fn execute(
        &self,
        runtime: &RuntimeHandle,
        entry: &EntryPoint,
        args: &[String],
    ) -> Result<RunOutput> {
        let bin_dir = runtime.bin_dir();
        let cwd = env::current_dir().unwrap_or_else(|_| runtime.root.clone());
        let envs = runtime_env(runtime)?;
        let (program, mut argv) = match entry {
            EntryPoint::Console(script) => {
                let program = resolve_in_bin(&bin_dir, script)
                    .ok_or_else(|| anyhow!("console script `{script}` not found in runtime"))?;
                (program, Vec::new())
            }
            EntryPoint::Module(module) => (
                runtime.python_path(),
                vec!["-m".to_string(), module.clone()],
            ),
            EntryPoint::Script(path) => {
                let resolved = if Path::new(path).is_absolute() {
                    PathBuf::from(path)
                } else {
                    runtime.root.join(path)
                };
                (runtime.python_path(), vec![resolved.to_string_lossy().to_string()])
            }
            EntryPoint::Argv(template) => {
                let mut template = template.iter();
                let head = template
                    .next()
                    .ok_or_else(|| anyhow!("empty command entry point"))?;
                let program =
                    resolve_in_bin(&bin_dir, head).unwrap_or_else(|| PathBuf::from(head));
                (program, template.cloned().collect())
            }
        };
        argv.extend(args.iter().cloned());
        run_command_passthrough(&program.to_string_lossy(), &argv, &envs, &cwd)
    }
}

fn resolve_in_bin(bin_dir: &Path, name: &str) -> Option<PathBuf> {
    let direct = bin_dir.join(name);
    if direct.exists() {
        return Some(direct);
    }
    if cfg!(windows) {
        let exe = bin_dir.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
    }
    None
}

fn runtime_env(runtime: &RuntimeHandle) -> Result<Vec<(String, String)>> {
    let mut paths = vec![runtime.bin_dir()];
    if let Some(existing) = env::var_os("PATH") {
        paths.extend(env::split_paths(&existing));
    }
    let path = env::join_paths(paths)
        .context("runtime bin dir produced an invalid PATH")?
        .to_string_lossy()
        .to_string();
    Ok(vec![
        ("PATH".to_string(), path),
        (
            "VIRTUAL_ENV".to_string(),
            runtime.root.to_string_lossy().to_string(),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_output_parses_into_normalized_map() {
        let snapshot = parse_freeze("click==8.1.7\nTyping_Extensions==4.9.0\nnot-a-pair\n");
        assert_eq!(snapshot.get("click").map(String::as_str), Some("8.1.7"));
        assert_eq!(
            snapshot.get("typing-extensions").map(String::as_str),
            Some("4.9.0")
        );
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn runtime_paths_follow_platform_layout() {
        let runtime = RuntimeHandle::new("demo", "/envs/demo");
        if cfg!(windows) {
            assert!(runtime.python_path().ends_with("python.exe"));
        } else {
            assert_eq!(runtime.bin_dir(), PathBuf::from("/envs/demo/bin"));
            assert_eq!(runtime.python_path(), PathBuf::from("/envs/demo/bin/python"));
        }
    }

    #[test]
    fn runtime_env_prefixes_bin_dir() {
        let runtime = RuntimeHandle::new("demo", "/envs/demo");
        let envs = runtime_env(&runtime).expect("env");
        let path = envs
            .iter()
            .find(|(key, _)| key == "PATH")
            .map(|(_, value)| value.clone())
            .expect("PATH present");
        assert!(path.starts_with(&runtime.bin_dir().to_string_lossy().to_string()));
    }
}
