use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use fs4::FileExt;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use quiver_domain::{
    reconcile, DependencySpecifier, InstalledPackages, ReconciliationResult, ToolDescriptor,
};

use crate::config::Paths;
use crate::effects::{RuntimeHandle, SharedEffects};
use crate::error::CoreError;
use crate::process::CommandTimeout;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvStatus {
    Absent,
    Provisioning,
    Ready,
    Stale,
    Broken,
}

impl fmt::Display for EnvStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EnvStatus::Absent => "absent",
            EnvStatus::Provisioning => "provisioning",
            EnvStatus::Ready => "ready",
            EnvStatus::Stale => "stale",
            EnvStatus::Broken => "broken",
        };
        f.write_str(label)
    }
}

/// Durable state of one tool's isolated runtime, persisted as one JSON file
/// per tool. Owned by the store; every mutation happens under the tool's
/// advisory lock.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub tool_name: String,
    pub status: EnvStatus,
    #[serde(default)]
    pub installed_packages: InstalledPackages,
    /// Descriptor fingerprint at the last successful provisioning; a
    /// mismatch against the current descriptor means the archive changed
    /// underneath the environment.
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub last_verified_at: Option<String>,
    /// Bumped on every provisioning start so readers can tell generations
    /// apart.
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub writer_pid: Option<u32>,
}

impl EnvironmentRecord {
    pub fn absent(tool: &str) -> Self {
        Self {
            tool_name: tool.to_string(),
            status: EnvStatus::Absent,
            installed_packages: InstalledPackages::new(),
            fingerprint: None,
            last_verified_at: None,
            generation: 0,
            writer_pid: None,
        }
    }
}

/// What a caller is allowed to do when the environment is not usable as-is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureMode {
    /// Verify and refresh only: Absent fails with `EnvironmentNotFound`,
    /// Broken stays blocked. Used by `run`.
    Verify,
    /// May (re)provision from Absent and Broken. Used by explicit `install`.
    Repair,
}

/// Owns every environment record and runtime directory. `ensure` is the
/// sole mutating entry point, `destroy` the sole teardown; both hold the
/// tool's exclusive file lock for their whole duration, which is what makes
/// at-most-one-writer enforceable across processes.
pub struct EnvironmentStore {
    paths: Paths,
    effects: SharedEffects,
}

impl EnvironmentStore {
    pub fn new(paths: Paths, effects: SharedEffects) -> Result<Self> {
        paths.ensure_layout()?;
        Ok(Self { paths, effects })
    }

    pub fn runtime_handle(&self, tool: &str) -> RuntimeHandle {
        RuntimeHandle::new(tool, self.paths.runtime_dir(tool))
    }

    /// Lock-free read for reporting. May observe `Provisioning` mid-flight.
    pub fn load(&self, tool: &str) -> Result<EnvironmentRecord> {
        self.read_record(tool)
    }

    /// Read that opportunistically reverts an abandoned provisioning: if the
    /// record says `Provisioning` but the writer no longer holds the lock,
    /// the half-built runtime is removed and the record becomes `Absent`.
    /// This is the cancellation path: an interrupted writer never leaves
    /// `Ready` behind, and the next read observes `Absent`.
    pub fn refresh(&self, tool: &str) -> Result<EnvironmentRecord> {
        let record = self.read_record(tool)?;
        if record.status != EnvStatus::Provisioning {
            return Ok(record);
        }
        match self.try_lock(tool)? {
            Some(_lock) => {
                warn!(tool, "provisioning writer died; reverting to absent");
                self.teardown_runtime_dir(tool);
                self.clear_record(tool)?;
                Ok(EnvironmentRecord::absent(tool))
            }
            None => Ok(record),
        }
    }

    /// Drives the per-tool state machine until the environment is `Ready`
    /// (or fails with the specific reason). See `EnsureMode` for what each
    /// caller may do.
    pub fn ensure(
        &self,
        descriptor: &ToolDescriptor,
        mode: EnsureMode,
    ) -> Result<EnvironmentRecord, CoreError> {
        let tool = descriptor.name.clone();
        let _lock = self.lock(&tool).map_err(|err| CoreError::ProvisioningFailed {
            tool: tool.clone(),
            cause: format!("cannot lock environment: {err}"),
        })?;

        let mut record = self
            .read_record(&tool)
            .map_err(|err| CoreError::ProvisioningFailed {
                tool: tool.clone(),
                cause: format!("cannot read environment record: {err}"),
            })?;

        // We hold the lock, so a Provisioning record means its writer died
        // mid-flight. Revert before deciding anything else.
        if record.status == EnvStatus::Provisioning {
            warn!(tool = %tool, "reverting abandoned provisioning");
            self.teardown_runtime_dir(&tool);
            let generation = record.generation;
            record = EnvironmentRecord::absent(&tool);
            record.generation = generation;
            self.persist(&record).map_err(|err| CoreError::ProvisioningFailed {
                tool: tool.clone(),
                cause: err.to_string(),
            })?;
        }

        if record.status == EnvStatus::Ready
            && record.fingerprint.as_deref() != Some(descriptor.fingerprint.as_str())
        {
            info!(tool = %tool, "archive changed since last provisioning; environment is stale");
            record.status = EnvStatus::Stale;
            self.persist(&record).map_err(|err| CoreError::ProvisioningFailed {
                tool: tool.clone(),
                cause: err.to_string(),
            })?;
        }

        match record.status {
            EnvStatus::Ready => self.verify_ready(descriptor, record),
            EnvStatus::Stale => self.provision(descriptor, record, true),
            EnvStatus::Absent => match mode {
                EnsureMode::Verify => Err(CoreError::EnvironmentNotFound { name: tool }),
                EnsureMode::Repair => self.provision(descriptor, record, false),
            },
            EnvStatus::Broken => match mode {
                EnsureMode::Verify => Err(CoreError::VerificationFailed {
                    tool,
                    detail: "environment is marked broken and requires an explicit reinstall"
                        .into(),
                }),
                EnsureMode::Repair => {
                    // Explicit repair: throw the broken runtime away and
                    // start over.
                    self.teardown_runtime_dir(&tool);
                    record.fingerprint = None;
                    record.installed_packages.clear();
                    self.provision(descriptor, record, false)
                }
            },
            EnvStatus::Provisioning => Err(CoreError::ProvisioningFailed {
                tool,
                cause: "provisioning already in progress".into(),
            }),
        }
    }

    /// Tears the runtime down and deletes the record. Idempotent: absent
    /// environments are a no-op.
    pub fn destroy(&self, tool: &str) -> Result<EnvStatus> {
        let _lock = self.lock(tool)?;
        let record = self.read_record(tool)?;
        let runtime = self.runtime_handle(tool);
        if runtime.root.exists() {
            self.effects
                .isolation()
                .destroy_runtime(&runtime)
                .with_context(|| format!("tearing down runtime for {tool}"))?;
        }
        self.clear_record(tool)?;
        debug!(tool, previous = %record.status, "environment destroyed");
        Ok(record.status)
    }

    /// Every tool with any persisted trace: a record file or a runtime dir.
    pub fn known_tools(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        if let Ok(entries) = fs::read_dir(self.paths.state_dir()) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                    if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                        names.push(stem.to_string());
                    }
                }
            }
        }
        if let Ok(entries) = fs::read_dir(self.paths.envs_dir()) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    if let Some(name) = entry.file_name().to_str() {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn verify_ready(
        &self,
        descriptor: &ToolDescriptor,
        mut record: EnvironmentRecord,
    ) -> Result<EnvironmentRecord, CoreError> {
        let tool = descriptor.name.clone();
        let runtime = self.runtime_handle(&tool);
        let snapshot = match self.effects.installer().snapshot(&runtime) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.mark_broken(&mut record);
                return Err(self.collaborator_error(&tool, "environment snapshot", err));
            }
        };
        match reconcile(&descriptor.requirements, &snapshot) {
            ReconciliationResult::Satisfied => {
                record.installed_packages = snapshot;
                record.last_verified_at = timestamp();
                self.persist_best_effort(&record);
                Ok(record)
            }
            ReconciliationResult::NeedsInstall { missing } => {
                self.mark_broken(&mut record);
                Err(CoreError::VerificationFailed {
                    tool,
                    detail: format!(
                        "previously ready environment lost packages: {}",
                        join_specs(&missing)
                    ),
                })
            }
            ReconciliationResult::Conflicting { conflicts } => {
                self.mark_broken(&mut record);
                Err(CoreError::DependencyConflict { tool, conflicts })
            }
        }
    }

    fn provision(
        &self,
        descriptor: &ToolDescriptor,
        mut record: EnvironmentRecord,
        reuse: bool,
    ) -> Result<EnvironmentRecord, CoreError> {
        let tool = descriptor.name.clone();
        record.status = EnvStatus::Provisioning;
        record.generation += 1;
        record.writer_pid = Some(std::process::id());
        record.fingerprint = None;
        self.persist(&record)
            .map_err(|err| CoreError::ProvisioningFailed {
                tool: tool.clone(),
                cause: err.to_string(),
            })?;
        info!(tool = %tool, generation = record.generation, reuse, "provisioning environment");

        let runtime = self.prepare_runtime(descriptor, &mut record, reuse)?;

        let mut specifiers: Vec<String> = descriptor
            .requirements
            .iter()
            .map(DependencySpecifier::install_spec)
            .collect();
        specifiers.push(descriptor.archive_path.to_string_lossy().to_string());
        if let Err(err) = self.effects.installer().install(&runtime, &specifiers) {
            self.mark_broken(&mut record);
            return Err(match timeout_of(&err) {
                Some(seconds) => CoreError::Timeout {
                    tool,
                    operation: "package install".into(),
                    seconds,
                },
                None => CoreError::ProvisioningFailed {
                    tool,
                    cause: format!("package install failed: {err:#}"),
                },
            });
        }

        // The install's exit status is not trusted: the snapshot read back
        // from the runtime is the source of truth.
        let snapshot = match self.effects.installer().snapshot(&runtime) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.mark_broken(&mut record);
                return Err(self.collaborator_error(&tool, "post-install snapshot", err));
            }
        };
        match reconcile(&descriptor.requirements, &snapshot) {
            ReconciliationResult::Satisfied => {
                record.status = EnvStatus::Ready;
                record.installed_packages = snapshot;
                record.fingerprint = Some(descriptor.fingerprint.clone());
                record.last_verified_at = timestamp();
                record.writer_pid = None;
                self.persist(&record)
                    .map_err(|err| CoreError::ProvisioningFailed {
                        tool: tool.clone(),
                        cause: err.to_string(),
                    })?;
                info!(tool = %tool, packages = record.installed_packages.len(), "environment ready");
                Ok(record)
            }
            ReconciliationResult::NeedsInstall { missing } => {
                self.mark_broken(&mut record);
                Err(CoreError::VerificationFailed {
                    tool,
                    detail: format!(
                        "installer reported success but packages are missing: {}",
                        join_specs(&missing)
                    ),
                })
            }
            ReconciliationResult::Conflicting { conflicts } => {
                self.mark_broken(&mut record);
                Err(CoreError::DependencyConflict { tool, conflicts })
            }
        }
    }

    fn prepare_runtime(
        &self,
        descriptor: &ToolDescriptor,
        record: &mut EnvironmentRecord,
        reuse: bool,
    ) -> Result<RuntimeHandle, CoreError> {
        let tool = descriptor.name.clone();
        let runtime = self.runtime_handle(&tool);
        if reuse && runtime.exists() {
            match self.effects.isolation().verify_runtime(&runtime) {
                Ok(()) => return Ok(runtime),
                Err(err) => {
                    warn!(tool = %tool, error = %err, "existing runtime unusable; recreating");
                    let _ = self.effects.isolation().destroy_runtime(&runtime);
                }
            }
        }
        match self
            .effects
            .isolation()
            .create_runtime(&tool, &runtime.root)
        {
            Ok(runtime) => Ok(runtime),
            Err(err) => match timeout_of(&err) {
                Some(seconds) => {
                    self.mark_broken(record);
                    Err(CoreError::Timeout {
                        tool,
                        operation: "runtime creation".into(),
                        seconds,
                    })
                }
                None => {
                    // No partial state survives a failed creation.
                    self.teardown_runtime_dir(&tool);
                    if let Err(clear_err) = self.clear_record(&tool) {
                        warn!(tool = %tool, error = %clear_err, "could not clear record");
                    }
                    *record = EnvironmentRecord::absent(&tool);
                    Err(CoreError::ProvisioningFailed {
                        tool,
                        cause: format!("runtime creation failed: {err:#}"),
                    })
                }
            },
        }
    }

    fn collaborator_error(&self, tool: &str, operation: &str, err: anyhow::Error) -> CoreError {
        match timeout_of(&err) {
            Some(seconds) => CoreError::Timeout {
                tool: tool.to_string(),
                operation: operation.to_string(),
                seconds,
            },
            None => CoreError::VerificationFailed {
                tool: tool.to_string(),
                detail: format!("{operation} failed: {err:#}"),
            },
        }
    }

    fn mark_broken(&self, record: &mut EnvironmentRecord) {
        record.status = EnvStatus::Broken;
        record.writer_pid = None;
        self.persist_best_effort(record);
    }

    fn teardown_runtime_dir(&self, tool: &str) {
        let runtime = self.runtime_handle(tool);
        if runtime.root.exists() {
            if let Err(err) = self.effects.isolation().destroy_runtime(&runtime) {
                warn!(tool, error = %err, "could not remove partial runtime");
            }
        }
    }

    fn read_record(&self, tool: &str) -> Result<EnvironmentRecord> {
        let path = self.paths.record_path(tool);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(EnvironmentRecord::absent(tool));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        serde_json::from_str(&contents)
            .with_context(|| format!("invalid environment record at {}", path.display()))
    }

    fn persist(&self, record: &EnvironmentRecord) -> Result<()> {
        let path = self.paths.record_path(&record.tool_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut buf = serde_json::to_vec_pretty(record)?;
        buf.push(b'\n');
        // Atomic swap so lock-free readers never see a torn record.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &buf).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }

    fn persist_best_effort(&self, record: &EnvironmentRecord) {
        if let Err(err) = self.persist(record) {
            warn!(tool = %record.tool_name, error = %err, "could not persist record");
        }
    }

    fn clear_record(&self, tool: &str) -> Result<()> {
        let path = self.paths.record_path(tool);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }

    fn lock(&self, tool: &str) -> Result<ToolLock> {
        ToolLock::acquire(&self.paths.lock_path(tool))
    }

    fn try_lock(&self, tool: &str) -> Result<Option<ToolLock>> {
        ToolLock::try_acquire(&self.paths.lock_path(tool))
    }
}

/// Advisory exclusive lock keyed by tool name; held for the whole of any
/// mutation. Dropping the handle releases the lock.
#[derive(Debug)]
struct ToolLock {
    _file: File,
}

impl ToolLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = Self::open(path)?;
        file.lock_exclusive()
            .with_context(|| format!("locking {}", path.display()))?;
        Ok(Self { _file: file })
    }

    fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = Self::open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { _file: file })),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            #[cfg(windows)]
            Err(err) if matches!(err.raw_os_error(), Some(32 | 33)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn open(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))
    }
}

fn timestamp() -> Option<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).ok()
}

fn timeout_of(err: &anyhow::Error) -> Option<u64> {
    err.downcast_ref::<CommandTimeout>()
        .map(|timeout| timeout.seconds)
}

fn join_specs(specs: &[DependencySpecifier]) -> String {
    specs
        .iter()
        .map(|spec| spec.raw().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
