use crate::errors::{AppError, AppResult};
use crate::results::cache::DEFAULT_CACHE_CAPACITY;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Where a running experiment's rows are kept until it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultsBacking {
    /// Held in the shared results cache and spilled as binary archives.
    Cache,
    /// Streamed to an append-only text data log.
    DataLog,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerSettings {
    pub cache_capacity: usize,
    pub continuous: bool,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub spill_dir: PathBuf,
    pub event_capacity: usize,
    pub results_backing: ResultsBacking,
    pub ledger: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::for_state_dir(&std::env::temp_dir().join("sweep-queue"))
    }
}

impl RunnerSettings {
    /// Settings with every directory placed under `state_dir`.
    pub fn for_state_dir(state_dir: &Path) -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            continuous: true,
            state_dir: state_dir.to_path_buf(),
            log_dir: state_dir.join("logs"),
            spill_dir: state_dir.join("spill"),
            event_capacity: 1024,
            results_backing: ResultsBacking::Cache,
            ledger: true,
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join("ledger.sqlite")
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path).map_err(|err| AppError::Io(format!("{}: {err}", path.display())))?;
        let settings: Self = serde_yaml::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads `path` when given and present, otherwise returns the defaults.
    pub fn load_or_default(path: Option<&Path>) -> AppResult<Self> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            Some(path) => {
                tracing::warn!(path = %path.display(), "settings file not found, using defaults");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.cache_capacity == 0 {
            return Err(AppError::InvalidInput("cacheCapacity must be at least 1".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(AppError::InvalidInput("eventCapacity must be at least 1".to_string()));
        }
        Ok(())
    }
}
