use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use dirs_next::home_dir;

pub const HOME_ENV: &str = "QUIVER_HOME";
pub const TOOLS_DIR_ENV: &str = "QUIVER_TOOLS_DIR";
pub const KITS_DIR_ENV: &str = "QUIVER_KITS_DIR";

const CREATE_TIMEOUT_ENV: &str = "QUIVER_CREATE_TIMEOUT_SECS";
const INSTALL_TIMEOUT_ENV: &str = "QUIVER_INSTALL_TIMEOUT_SECS";
const SNAPSHOT_TIMEOUT_ENV: &str = "QUIVER_SNAPSHOT_TIMEOUT_SECS";

/// On-disk layout. Everything mutable lives under one home directory:
/// archives under `tools/` and `kits/<name>/`, runtimes under `envs/`,
/// durable records under `state/`, advisory locks under `locks/`.
#[derive(Clone, Debug)]
pub struct Paths {
    home: PathBuf,
}

impl Paths {
    pub fn from_env() -> Result<Self> {
        if let Some(dir) = env::var_os(HOME_ENV) {
            return Ok(Self {
                home: PathBuf::from(dir),
            });
        }
        let home = home_dir().ok_or_else(|| anyhow!("home directory not found"))?;
        Ok(Self {
            home: home.join(".quiver"),
        })
    }

    pub fn at(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Loose archives forming the default kit.
    pub fn tools_dir(&self) -> PathBuf {
        env::var_os(TOOLS_DIR_ENV)
            .map_or_else(|| self.home.join("tools"), PathBuf::from)
    }

    /// Parent of named kit directories.
    pub fn kits_dir(&self) -> PathBuf {
        env::var_os(KITS_DIR_ENV)
            .map_or_else(|| self.home.join("kits"), PathBuf::from)
    }

    pub fn envs_dir(&self) -> PathBuf {
        self.home.join("envs")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.home.join("state")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.home.join("locks")
    }

    pub fn runtime_dir(&self, tool: &str) -> PathBuf {
        self.envs_dir().join(tool)
    }

    pub fn record_path(&self, tool: &str) -> PathBuf {
        self.state_dir().join(format!("{tool}.json"))
    }

    pub fn lock_path(&self, tool: &str) -> PathBuf {
        self.locks_dir().join(format!("{tool}.lock"))
    }

    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.envs_dir(),
            self.state_dir(),
            self.locks_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Bounds on the blocking collaborator calls. A hung external installer is
/// abandoned after the bound, never retried in a loop.
#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    pub create: Duration,
    pub install: Duration,
    pub snapshot: Duration,
}

impl Timeouts {
    pub fn from_env() -> Self {
        Self {
            create: seconds_from(CREATE_TIMEOUT_ENV, 120),
            install: seconds_from(INSTALL_TIMEOUT_ENV, 600),
            snapshot: seconds_from(SNAPSHOT_TIMEOUT_ENV, 60),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from_env()
    }
}

fn seconds_from(var: &str, default: u64) -> Duration {
    let secs = env::var(var)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default);
    Duration::from_secs(secs)
}
