//! Layered configuration for navdex.
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. The user file `~/.config/navdex/config.toml`
//! 3. `./navdex.toml`, or the file passed with `--config`
//! 4. `NAVDEX_*` environment variables, with `__` between section and key
//!    (`NAVDEX_CACHE__ENABLED=false`, `NAVDEX_OUTPUT__FORMATS=json,js`)
//!
//! Command-line flags are applied on top by the CLI.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "NAVDEX";

/// Project configuration file, looked up in the working directory.
pub const PROJECT_CONFIG_FILE: &str = "navdex.toml";

/// Artifact format names accepted in `output.formats`.
pub const KNOWN_FORMATS: &[&str] = &["json", "js"];

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Complete navdex configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub input: InputConfig,
    pub output: OutputConfig,
    pub cache: CacheConfig,
    pub index: IndexConfig,
    pub retry: RetryConfig,
    pub watch: WatchConfig,
    pub log: LogConfig,
}

/// Where module inputs are read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// File name suffix of module input files
    pub suffix: String,
    /// Skip inputs ignored by `.gitignore`
    pub respect_gitignore: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            suffix: ".symbols.json".to_string(),
            respect_gitignore: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Artifact directory
    pub dir: PathBuf,
    /// Per-module artifact formats (`json`, `js`)
    pub formats: Vec<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("target/navdex"),
            formats: vec!["json".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Cache directory; defaults to `.navdex-cache` inside the output directory
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Longest re-export chain followed before reporting a cycle
    pub max_reexport_depth: usize,
    /// Concurrent module builds; unset means available parallelism
    pub jobs: Option<usize>,
    /// Include crate-internal and private symbols
    pub document_private_items: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_reexport_depth: 32,
            jobs: None,
            document_private_items: false,
        }
    }
}

/// Retry policy for input reads, cache reads and artifact writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 50,
            backoff_multiplier: 2.0,
            max_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Quiet period before a batch of changes triggers a rebuild
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load with the default sources, optionally replacing `./navdex.toml`
    /// with an explicit file.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut loader = ConfigLoader::new();
        if let Some(path) = explicit {
            loader = loader.with_file(path);
        }
        loader.load()
    }

    /// Check values that deserialization cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(unknown) = self
            .output
            .formats
            .iter()
            .find(|format| !KNOWN_FORMATS.contains(&format.trim().to_ascii_lowercase().as_str()))
        {
            return Err(ConfigError::Invalid(format!(
                "unknown output format {:?} (expected one of {:?})",
                unknown, KNOWN_FORMATS
            )));
        }
        if self.index.max_reexport_depth == 0 {
            return Err(ConfigError::Invalid(
                "index.max_reexport_depth must be at least 1".to_string(),
            ));
        }
        if self.index.jobs == Some(0) {
            return Err(ConfigError::Invalid("index.jobs must be at least 1".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.input.suffix.is_empty() {
            return Err(ConfigError::Invalid("input.suffix must not be empty".to_string()));
        }
        Ok(())
    }

    /// Render as TOML, in the layout accepted by configuration files.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Expand `~` and environment variables in configured paths.
    fn expand_paths(&mut self) {
        self.output.dir = expand_path(&self.output.dir);
        if let Some(dir) = &self.cache.dir {
            self.cache.dir = Some(expand_path(dir));
        }
    }
}

/// User configuration file, `~/.config/navdex/config.toml` on Linux.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("navdex").join("config.toml"))
}

/// Expand `~` and `$VAR` in a path. Unknown variables leave the path as is.
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.into_owned()),
        Err(_) => PathBuf::from(shellexpand::tilde(&raw).into_owned()),
    }
}

/// Builder for the configuration source stack.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    user_file: Option<PathBuf>,
    project_file: Option<PathBuf>,
    explicit_file: Option<PathBuf>,
    env_prefix: String,
    env_source: Option<HashMap<String, String>>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            user_file: user_config_path(),
            project_file: Some(PathBuf::from(PROJECT_CONFIG_FILE)),
            explicit_file: None,
            env_prefix: ENV_PREFIX.to_string(),
            env_source: None,
        }
    }

    /// Use `path` instead of `./navdex.toml`. The file must exist.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_file = Some(path.into());
        self
    }

    pub fn with_user_file(mut self, path: Option<PathBuf>) -> Self {
        self.user_file = path;
        self
    }

    pub fn with_project_file(mut self, path: Option<PathBuf>) -> Self {
        self.project_file = path;
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Read environment variables from `vars` instead of the process environment.
    pub fn with_env_source(mut self, vars: HashMap<String, String>) -> Self {
        self.env_source = Some(vars);
        self
    }

    pub fn load(&self) -> Result<Config, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(user) = &self.user_file {
            builder = builder.add_source(toml_file(user).required(false));
        }
        match (&self.explicit_file, &self.project_file) {
            (Some(explicit), _) => builder = builder.add_source(toml_file(explicit).required(true)),
            (None, Some(project)) => builder = builder.add_source(toml_file(project).required(false)),
            (None, None) => {}
        }

        builder = builder.add_source(
            Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("output.formats")
                .source(self.env_source.clone()),
        );

        let mut config: Config = builder.build()?.try_deserialize()?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }
}

fn toml_file(path: &Path) -> File<config::FileSourceFile, FileFormat> {
    File::new(&path.to_string_lossy(), FileFormat::Toml)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn isolated() -> ConfigLoader {
        ConfigLoader::new()
            .with_user_file(None)
            .with_project_file(None)
            .with_env_source(HashMap::new())
    }

    #[test]
    fn test_defaults() {
        let config = isolated().load().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.index.max_reexport_depth, 32);
        assert!(config.cache.enabled);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("custom.toml");
        fs::write(
            &file,
            r#"
[output]
dir = "site/nav"
formats = ["json", "js"]

[index]
jobs = 2
document_private_items = true
"#,
        )
        .unwrap();

        let config = isolated().with_file(&file).load().unwrap();
        assert_eq!(config.output.dir, PathBuf::from("site/nav"));
        assert_eq!(config.output.formats, vec!["json", "js"]);
        assert_eq!(config.index.jobs, Some(2));
        assert!(config.index.document_private_items);
        assert_eq!(config.index.max_reexport_depth, 32);
    }

    #[test]
    fn test_layer_precedence() {
        let dir = tempdir().unwrap();
        let user = dir.path().join("user.toml");
        let project = dir.path().join("navdex.toml");
        fs::write(&user, "[log]\nlevel = \"warn\"\n[cache]\nenabled = false\n").unwrap();
        fs::write(&project, "[log]\nlevel = \"debug\"\n").unwrap();

        let mut env = HashMap::new();
        env.insert("NAVDEX_RETRY__MAX_ATTEMPTS".to_string(), "5".to_string());
        env.insert("NAVDEX_OUTPUT__FORMATS".to_string(), "json,js".to_string());
        env.insert("NAVDEX_CACHE__ENABLED".to_string(), "true".to_string());

        let config = ConfigLoader::new()
            .with_user_file(Some(user))
            .with_project_file(Some(project))
            .with_env_source(env)
            .load()
            .unwrap();

        assert_eq!(config.log.level, "debug");
        assert!(config.cache.enabled);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.output.formats, vec!["json", "js"]);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempdir().unwrap();
        let result = isolated().with_file(dir.path().join("absent.toml")).load();
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.output.formats = vec!["html".to_string()];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.index.jobs = Some(0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_path() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path(Path::new("~/docs")), home.join("docs"));
        }
        assert_eq!(expand_path(Path::new("plain/dir")), PathBuf::from("plain/dir"));
    }

    #[test]
    fn test_to_toml_round_trips() {
        let mut config = Config::default();
        config.cache.dir = Some(PathBuf::from("/tmp/navdex-cache"));
        let rendered = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
