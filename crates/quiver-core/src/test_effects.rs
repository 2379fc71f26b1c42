//! Substitutable collaborators for state-machine tests: success, partial
//! failure, and timeout without spawning a single real process.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};

use quiver_domain::{DependencySpecifier, EntryPoint, InstalledPackages};

use crate::effects::{
    Effects, EntryPointExecutor, IsolationProvider, PackageInstaller, RuntimeHandle,
};
use crate::process::{CommandTimeout, RunOutput};

#[derive(Clone, Debug, Default)]
pub struct FakeBehavior {
    pub fail_create: bool,
    pub timeout_create: bool,
    pub fail_install: bool,
    pub timeout_install: bool,
    /// Pretend the installer silently skipped this package (exit 0, package
    /// absent from the snapshot).
    pub drop_package: Option<String>,
    /// Install this version regardless of what the specifier asked for.
    pub version_override: Option<(String, String)>,
    pub create_delay_ms: u64,
    pub exit_code: i32,
}

#[derive(Default)]
pub struct FakeEffects {
    behavior: Mutex<FakeBehavior>,
    create_count: AtomicUsize,
    install_count: AtomicUsize,
    environments: Mutex<BTreeMap<String, InstalledPackages>>,
    executions: Mutex<Vec<(EntryPoint, Vec<String>)>>,
}

impl FakeEffects {
    pub fn with_behavior(behavior: FakeBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            ..Self::default()
        }
    }

    pub fn set_behavior(&self, behavior: FakeBehavior) {
        *self.behavior.lock().expect("behavior lock") = behavior;
    }

    fn behavior(&self) -> FakeBehavior {
        self.behavior.lock().expect("behavior lock").clone()
    }

    pub fn create_calls(&self) -> usize {
        self.create_count.load(Ordering::SeqCst)
    }

    pub fn install_calls(&self) -> usize {
        self.install_count.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> Vec<(EntryPoint, Vec<String>)> {
        self.executions.lock().expect("executions lock").clone()
    }
}

impl Effects for FakeEffects {
    fn isolation(&self) -> &dyn IsolationProvider {
        self
    }

    fn installer(&self) -> &dyn PackageInstaller {
        self
    }

    fn executor(&self) -> &dyn EntryPointExecutor {
        self
    }
}

impl IsolationProvider for FakeEffects {
    fn create_runtime(&self, tool: &str, root: &Path) -> Result<RuntimeHandle> {
        let behavior = self.behavior();
        if behavior.create_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(behavior.create_delay_ms));
        }
        if behavior.timeout_create {
            return Err(anyhow!(CommandTimeout {
                program: "python".into(),
                seconds: 120,
            }));
        }
        if behavior.fail_create {
            return Err(anyhow!("venv creation refused"));
        }
        self.create_count.fetch_add(1, Ordering::SeqCst);
        let runtime = RuntimeHandle::new(tool, root);
        let python = runtime.python_path();
        if let Some(parent) = python.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&python, b"")?;
        self.environments
            .lock()
            .expect("environments lock")
            .insert(tool.to_string(), InstalledPackages::new());
        Ok(runtime)
    }

    fn destroy_runtime(&self, runtime: &RuntimeHandle) -> Result<()> {
        if runtime.root.exists() {
            fs::remove_dir_all(&runtime.root)?;
        }
        self.environments
            .lock()
            .expect("environments lock")
            .remove(&runtime.tool);
        Ok(())
    }

    fn verify_runtime(&self, runtime: &RuntimeHandle) -> Result<()> {
        if runtime.exists() {
            Ok(())
        } else {
            Err(anyhow!("interpreter missing"))
        }
    }
}

impl PackageInstaller for FakeEffects {
    fn install(&self, runtime: &RuntimeHandle, specifiers: &[String]) -> Result<()> {
        let behavior = self.behavior();
        if behavior.timeout_install {
            return Err(anyhow!(CommandTimeout {
                program: "pip".into(),
                seconds: 600,
            }));
        }
        if behavior.fail_install {
            return Err(anyhow!("pip install exited with status 1"));
        }
        self.install_count.fetch_add(1, Ordering::SeqCst);
        let mut environments = self.environments.lock().expect("environments lock");
        let packages = environments.entry(runtime.tool.clone()).or_default();
        for spec in specifiers {
            // Archive paths install the tool package itself; irrelevant to
            // the declared requirements the store verifies.
            if spec.ends_with(".whl") {
                continue;
            }
            let Ok(parsed) = DependencySpecifier::parse(spec) else {
                continue;
            };
            if behavior.drop_package.as_deref() == Some(parsed.name()) {
                continue;
            }
            let version = match &behavior.version_override {
                Some((name, version)) if name == parsed.name() => version.clone(),
                _ => version_satisfying(&parsed),
            };
            packages.insert(parsed.name().to_string(), version);
        }
        Ok(())
    }

    fn snapshot(&self, runtime: &RuntimeHandle) -> Result<InstalledPackages> {
        if !runtime.exists() {
            return Err(anyhow!("no runtime at {}", runtime.root.display()));
        }
        Ok(self
            .environments
            .lock()
            .expect("environments lock")
            .get(&runtime.tool)
            .cloned()
            .unwrap_or_default())
    }
}

impl EntryPointExecutor for FakeEffects {
    fn execute(
        &self,
        _runtime: &RuntimeHandle,
        entry: &EntryPoint,
        args: &[String],
    ) -> Result<RunOutput> {
        self.executions
            .lock()
            .expect("executions lock")
            .push((entry.clone(), args.to_vec()));
        Ok(RunOutput {
            code: self.behavior().exit_code,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

/// A version that satisfies the specifier's own lower bound, so a plain
/// fake install reconciles clean.
fn version_satisfying(spec: &DependencySpecifier) -> String {
    match spec.constraint() {
        Some(constraint) => {
            let rendered = constraint.to_string();
            let first = rendered.split(',').next().unwrap_or(&rendered);
            let version = first.trim_start_matches(|ch: char| {
                matches!(ch, '>' | '<' | '=' | '~' | '!' | ' ')
            });
            if version.is_empty() {
                "1.0".to_string()
            } else {
                version.trim_end_matches(".*").to_string()
            }
        }
        None => "1.0".to_string(),
    }
}
