//! Configuration for pipewright.
//!
//! Each setting is taken from the first layer that defines it:
//! 1. Environment variables (PIPEWRIGHT_HOME, PIPEWRIGHT_PIPELINES)
//! 2. `.pipewright/config.yaml`, found by walking up from the working directory
//! 3. Built-in defaults (`~/.pipewright`, `<home>/pipelines`)
//!
//! Relative paths in the config file resolve against the file's own
//! directory, not the working directory.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Process-wide configuration; a load error is kept as text so it can be
/// reported on every access.
static RESOLVED: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".pipewright";
const CONFIG_NAME: &str = "config.yaml";

const ENV_HOME: &str = "PIPEWRIGHT_HOME";
const ENV_PIPELINES: &str = "PIPEWRIGHT_PIPELINES";

/// On-disk layout of `.pipewright/config.yaml`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub paths: FilePaths,

    #[serde(default)]
    pub engine: FileEngine,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilePaths {
    pub home: Option<String>,
    pub pipelines: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileEngine {
    pub credential_ttl_seconds: Option<u64>,
    pub step_timeout_seconds: Option<u64>,
    pub http_timeout_ms: Option<u64>,
}

impl ConfigFile {
    /// Closest config file at or above `start`
    pub fn discover(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(CONFIG_DIR).join(CONFIG_NAME))
            .find(|candidate| candidate.is_file())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("Invalid config file: {}", path.display()))
    }
}

/// Engine tuning knobs
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub credential_ttl_seconds: u64,
    pub step_timeout_seconds: u64,
    pub http_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            credential_ttl_seconds: 300,
            step_timeout_seconds: 300,
            http_timeout_ms: 3000,
        }
    }
}

impl EngineSettings {
    fn layered(file: &FileEngine) -> Self {
        let base = Self::default();
        Self {
            credential_ttl_seconds: file.credential_ttl_seconds.unwrap_or(base.credential_ttl_seconds),
            step_timeout_seconds: file.step_timeout_seconds.unwrap_or(base.step_timeout_seconds),
            http_timeout_ms: file.http_timeout_ms.unwrap_or(base.http_timeout_ms),
        }
    }

    pub fn credential_ttl(&self) -> Duration {
        Duration::from_secs(self.credential_ttl_seconds)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

/// Fully resolved configuration; every path is absolute
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state directory
    pub home: PathBuf,

    /// Pipeline definitions directory
    pub pipelines: PathBuf,

    /// The config file that contributed, if any
    pub config_file: Option<PathBuf>,

    pub engine: EngineSettings,
}

impl ResolvedConfig {
    /// Merge the layers. `env` looks up an environment variable and
    /// `default_home` is used when neither env nor file set a home.
    fn resolve<F>(file: Option<(PathBuf, ConfigFile)>, env: F, default_home: PathBuf) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let (config_file, parsed) = match file {
            Some((path, parsed)) => (Some(path), parsed),
            None => (None, ConfigFile::default()),
        };
        let anchor = config_file
            .as_deref()
            .and_then(Path::parent)
            .unwrap_or(Path::new("."));

        let home = env(ENV_HOME)
            .map(PathBuf::from)
            .or_else(|| parsed.paths.home.as_deref().map(|p| anchored(anchor, p)))
            .unwrap_or(default_home);

        let pipelines = env(ENV_PIPELINES)
            .map(PathBuf::from)
            .or_else(|| parsed.paths.pipelines.as_deref().map(|p| anchored(anchor, p)))
            .unwrap_or_else(|| home.join("pipelines"));

        Self {
            home,
            pipelines,
            config_file,
            engine: EngineSettings::layered(&parsed.engine),
        }
    }

    /// Directory holding one subdirectory per execution
    pub fn executions_dir(&self) -> PathBuf {
        self.home.join("executions")
    }
}

fn anchored(anchor: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let joined = anchor.join(path);
    joined.canonicalize().unwrap_or(joined)
}

fn load() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);
    let cwd = std::env::current_dir().context("Failed to read current directory")?;

    let file = match ConfigFile::discover(&cwd) {
        Some(path) => {
            let parsed = ConfigFile::read(&path)?;
            Some((path, parsed))
        }
        None => None,
    };

    Ok(ResolvedConfig::resolve(file, |key| std::env::var(key).ok(), default_home))
}

/// The process-wide configuration, loaded on first use
pub fn config() -> Result<&'static ResolvedConfig> {
    match RESOLVED.get_or_init(|| load().map_err(|e| format!("{:#}", e))) {
        Ok(config) => Ok(config),
        Err(message) => anyhow::bail!("{}", message),
    }
}

/// Load again, ignoring the cached value
pub fn reload_config() -> Result<ResolvedConfig> {
    load()
}

/// `<home>/executions`
pub fn executions_dir() -> Result<PathBuf> {
    Ok(config()?.executions_dir())
}

pub fn pipelines_dir() -> Result<PathBuf> {
    Ok(config()?.pipelines.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_config(root: &Path, body: &str) -> PathBuf {
        let dir = root.join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_NAME);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_file_layer_overrides_defaults() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            temp.path(),
            "paths:\n  home: state\nengine:\n  http_timeout_ms: 1500\n",
        );
        let parsed = ConfigFile::read(&path).unwrap();

        let resolved = ResolvedConfig::resolve(Some((path.clone(), parsed)), no_env, PathBuf::from("/unused"));
        // Missing directories are not canonicalized
        let state = temp.path().join(CONFIG_DIR).join("state");
        assert_eq!(resolved.home, state);
        assert_eq!(resolved.pipelines, state.join("pipelines"));
        assert_eq!(resolved.config_file, Some(path));
        assert_eq!(resolved.engine.http_timeout(), Duration::from_millis(1500));
        assert_eq!(resolved.engine.step_timeout_seconds, 300);
    }

    #[test]
    fn test_env_layer_wins() {
        let file = ConfigFile {
            paths: FilePaths {
                home: Some("/from/file".to_string()),
                pipelines: Some("/from/file/pipes".to_string()),
            },
            ..Default::default()
        };
        let env = |key: &str| (key == ENV_HOME).then(|| "/from/env".to_string());

        let resolved = ResolvedConfig::resolve(Some((PathBuf::from("/p/.pipewright/config.yaml"), file)), env, PathBuf::from("/default"));
        assert_eq!(resolved.home, PathBuf::from("/from/env"));
        assert_eq!(resolved.pipelines, PathBuf::from("/from/file/pipes"));
    }

    #[test]
    fn test_defaults_without_file() {
        let resolved = ResolvedConfig::resolve(None, no_env, PathBuf::from("/test/.pipewright"));
        assert_eq!(resolved.pipelines, PathBuf::from("/test/.pipewright/pipelines"));
        assert_eq!(resolved.executions_dir(), PathBuf::from("/test/.pipewright/executions"));
        assert_eq!(resolved.engine, EngineSettings::default());
        assert!(resolved.config_file.is_none());
    }

    #[test]
    fn test_discover_walks_up() {
        let temp = TempDir::new().unwrap();
        let path = write_config(temp.path(), "version: \"1\"\n");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(ConfigFile::discover(&nested), Some(path));
    }

    #[test]
    fn test_absolute_paths_are_kept() {
        assert_eq!(anchored(Path::new("/base"), "/abs/dir"), PathBuf::from("/abs/dir"));
        assert_eq!(anchored(Path::new("/nonexistent-base"), "rel"), PathBuf::from("/nonexistent-base/rel"));
    }
}
