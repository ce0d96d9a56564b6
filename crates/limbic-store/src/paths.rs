use std::path::{Path, PathBuf};
use std::{env, fs};

use limbic_core::{Config, ConfigWarning};

use crate::error::Result;

/// Default base directory for all limbic storage.
pub fn default_base_dir() -> PathBuf {
    dirs_home().join(".limbic")
}

fn dirs_home() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Files under one data directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataLayout {
    base: PathBuf,
}

impl DataLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// `explicit` when given, otherwise `~/.limbic`.
    pub fn resolve(explicit: Option<PathBuf>) -> Self {
        Self::new(explicit.unwrap_or_else(default_base_dir))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn memory_db(&self) -> PathBuf {
        self.base.join("memory.db")
    }

    pub fn affect_db(&self) -> PathBuf {
        self.base.join("affect.db")
    }

    pub fn fallback_log(&self) -> PathBuf {
        self.base.join("fallback").join("turns.jsonl")
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.toml")
    }

    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.base)?;
        Ok(())
    }
}

/// Load and validate a TOML config. A missing file yields defaults; an
/// unreadable or unparseable one yields defaults plus a warning.
pub fn load_config(path: &Path) -> (Config, Vec<ConfigWarning>) {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return (Config::default(), Vec::new()),
        Err(e) => return (Config::default(), vec![file_warning(path, e.to_string())]),
    };
    match parse_config(&raw) {
        Ok(result) => result,
        Err(message) => (Config::default(), vec![file_warning(path, message)]),
    }
}

/// Parse TOML text into a validated config.
pub fn parse_config(raw: &str) -> std::result::Result<(Config, Vec<ConfigWarning>), String> {
    let config: Config = toml::from_str(raw).map_err(|e| e.to_string())?;
    Ok(config.validated())
}

fn file_warning(path: &Path, message: String) -> ConfigWarning {
    ConfigWarning {
        field: path.display().to_string(),
        message: format!("{message}; using defaults"),
    }
}
