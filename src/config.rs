//! Configuration for revue.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (REVUE_HOME, REVUE_PIPELINES, REVUE_FABRIC_BIN)
//! 2. Config file (.revue/config.yaml)
//! 3. Defaults (~/.revue)
//!
//! Config file discovery:
//! - Searches current directory and parents for .revue/config.yaml
//! - `paths.home` is relative to the .revue/ directory, `paths.pipelines`
//!   to the project root (the parent of .revue/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::event_bus::DEFAULT_FINISHED_RETENTION;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub fabric: Option<FabricConfig>,
    #[serde(default)]
    pub stages: Option<StagesConfig>,
    #[serde(default)]
    pub bus: Option<BusConfig>,
    #[serde(default)]
    pub generators: Option<GeneratorsConfig>,
    #[serde(default)]
    pub cartographer: Option<CartographerConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .revue/)
    pub home: Option<String>,
    /// Pipeline definitions directory (relative to project root)
    pub pipelines: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FabricConfig {
    pub binary: Option<String>,
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StagesConfig {
    pub step_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    pub finished_retention: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorsConfig {
    pub bicep_url: Option<String>,
    pub terraform_url: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CartographerConfig {
    pub pattern: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Absolute path to revue home
    pub home: PathBuf,
    /// Directory holding `<name>.yaml` pipeline definitions
    pub pipelines: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub fabric: FabricSettings,
    pub stages: StageSettings,
    pub bus: BusSettings,
    pub generators: GeneratorSettings,
    /// Fabric pattern used to re-derive payloads from templates
    pub cartographer_pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FabricSettings {
    pub binary: String,
    pub stream: bool,
}

impl Default for FabricSettings {
    fn default() -> Self {
        Self {
            binary: "fabric".to_string(),
            stream: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageSettings {
    pub step_timeout_seconds: u64,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            step_timeout_seconds: 300,
        }
    }
}

impl StageSettings {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BusSettings {
    pub finished_retention: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            finished_retention: DEFAULT_FINISHED_RETENTION,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratorSettings {
    pub bicep_url: Option<String>,
    pub terraform_url: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            bicep_url: None,
            terraform_url: None,
            timeout_seconds: 120,
        }
    }
}

impl GeneratorSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl ResolvedConfig {
    /// Path of the definition file for a named pipeline
    pub fn pipeline_path(&self, name: &str) -> PathBuf {
        self.pipelines.join(format!("{}.yaml", name))
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".revue").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    load_config_from(find_config_file())
}

fn load_config_from(config_file: Option<PathBuf>) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".revue");

    let config = config_file.as_deref().map(load_config_file).transpose()?;

    let home = if let Ok(env_home) = std::env::var("REVUE_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(path), Some(home)) = (
        config_file.as_deref(),
        config.as_ref().and_then(|c| c.paths.home.as_deref()),
    ) {
        let revue_dir = path.parent().unwrap_or(Path::new("."));
        resolve_path(revue_dir, home)
    } else {
        default_home
    };

    let pipelines = if let Ok(env_pipelines) = std::env::var("REVUE_PIPELINES") {
        PathBuf::from(env_pipelines)
    } else if let (Some(path), Some(pipelines)) = (
        config_file.as_deref(),
        config.as_ref().and_then(|c| c.paths.pipelines.as_deref()),
    ) {
        // Project root is the parent of .revue/
        let base_dir = path
            .parent()
            .and_then(|p| p.parent())
            .unwrap_or(Path::new("."));
        resolve_path(base_dir, pipelines)
    } else {
        home.join("pipelines")
    };

    let mut fabric = FabricSettings::default();
    let mut stages = StageSettings::default();
    let mut bus = BusSettings::default();
    let mut generators = GeneratorSettings::default();
    let mut cartographer_pattern = None;

    if let Some(config) = config {
        if let Some(f) = config.fabric {
            fabric.binary = f.binary.unwrap_or(fabric.binary);
            fabric.stream = f.stream.unwrap_or(fabric.stream);
        }
        if let Some(s) = config.stages.and_then(|s| s.step_timeout_seconds) {
            stages.step_timeout_seconds = s;
        }
        if let Some(r) = config.bus.and_then(|b| b.finished_retention) {
            bus.finished_retention = r;
        }
        if let Some(g) = config.generators {
            generators.bicep_url = g.bicep_url;
            generators.terraform_url = g.terraform_url;
            generators.timeout_seconds = g.timeout_seconds.unwrap_or(generators.timeout_seconds);
        }
        cartographer_pattern = config.cartographer.and_then(|c| c.pattern);
    }

    if let Ok(binary) = std::env::var("REVUE_FABRIC_BIN") {
        fabric.binary = binary;
    }

    Ok(ResolvedConfig {
        home,
        pipelines,
        config_file,
        fabric,
        stages,
        bus,
        generators,
        cartographer_pattern,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the revue home directory
pub fn revue_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the pipeline definitions directory
pub fn pipelines_dir() -> Result<PathBuf> {
    Ok(config()?.pipelines.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(temp: &TempDir, body: &str) -> PathBuf {
        let revue_dir = temp.path().join(".revue");
        std::fs::create_dir_all(&revue_dir).unwrap();
        let config_path = revue_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", body).unwrap();
        config_path
    }

    #[test]
    fn test_default_config_without_file() {
        if std::env::var("REVUE_HOME").is_ok() || std::env::var("REVUE_PIPELINES").is_ok() {
            return;
        }
        let config = load_config_from(None).unwrap();

        let expected_home = dirs::home_dir().unwrap().join(".revue");
        assert_eq!(config.home, expected_home);
        assert_eq!(config.pipelines, expected_home.join("pipelines"));
        assert!(config.config_file.is_none());
        assert_eq!(config.stages.step_timeout_seconds, 300);
        assert_eq!(config.bus.finished_retention, DEFAULT_FINISHED_RETENTION);
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            &temp,
            r#"
version: "1.0"
paths:
  home: ./
  pipelines: ./pipelines
fabric:
  binary: /opt/fabric
  stream: false
stages:
  step_timeout_seconds: 45
bus:
  finished_retention: 8
generators:
  bicep_url: http://localhost:8080/bicep
cartographer:
  pattern: lz_cartographer
"#,
        );

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.paths.pipelines, Some("./pipelines".to_string()));
        assert_eq!(config.stages.unwrap().step_timeout_seconds, Some(45));
        assert_eq!(config.bus.unwrap().finished_retention, Some(8));
        let generators = config.generators.unwrap();
        assert_eq!(generators.bicep_url.as_deref(), Some("http://localhost:8080/bicep"));
        assert!(generators.terraform_url.is_none());
    }

    #[test]
    fn test_resolved_settings_from_file() {
        if std::env::var("REVUE_FABRIC_BIN").is_ok() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            &temp,
            r#"
version: "1.0"
fabric:
  stream: false
stages:
  step_timeout_seconds: 45
cartographer:
  pattern: lz_cartographer
"#,
        );

        let config = load_config_from(Some(config_path)).unwrap();
        assert_eq!(config.fabric.binary, "fabric");
        assert!(!config.fabric.stream);
        assert_eq!(config.stages.step_timeout(), Duration::from_secs(45));
        assert_eq!(config.generators.timeout_seconds, 120);
        assert_eq!(config.cartographer_pattern.as_deref(), Some("lz_cartographer"));
    }

    #[test]
    fn test_pipeline_path() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(&temp, "version: \"1.0\"\npaths:\n  pipelines: defs");
        if std::env::var("REVUE_PIPELINES").is_ok() {
            return;
        }

        let config = load_config_from(Some(config_path)).unwrap();
        assert!(config.pipelines.ends_with("defs"));
        assert_eq!(
            config.pipeline_path("landing_zone"),
            config.pipelines.join("landing_zone.yaml")
        );
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
