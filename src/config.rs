//! Configuration for pharos, read from `pharos.toml`.
//!
//! Settings are layered: defaults, then the file, then `PHAROS_*`
//! environment variables, then CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [connection]
//! endpoint = "127.0.0.1:9222"
//!
//! [settings]
//! throttling_method = "devtools"
//! load_failure_mode = "warn"
//! blocked_url_patterns = ["*.woff2"]
//!
//! [settings.screen_emulation]
//! mobile = false
//! width = 1350
//! height = 940
//!
//! [[artifacts]]
//! id = "DevtoolsLog"
//! gatherer = "DevtoolsLog"
//!
//! [[artifacts]]
//! id = "MainDocumentContent"
//! gatherer = "MainDocumentContent"
//! dependencies = { DevtoolsLog = "DevtoolsLog" }
//! ```
//!
//! Without any `[[artifacts]]` every built-in gatherer is collected.

use crate::errors::DefinitionError;
use crate::gather::{ArtifactDefinition, validate_definitions};
use crate::gatherers;
use anyhow::{Context, Result};
use pharos_common::{LoadFailureMode, Settings, ThrottlingMethod};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "pharos.toml";

/// Where the protocol endpoint lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSection {
    /// `host:port` of a pipe-framed protocol endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

fn default_endpoint() -> String {
    "127.0.0.1:9222".to_string()
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
        }
    }
}

/// One `[[artifacts]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub id: String,
    /// Name of a built-in gatherer.
    pub gatherer: String,
    /// Dependency key → id of the producing artifact.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
}

/// The complete pharos.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PharosToml {
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactEntry>,
}

impl PharosToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse pharos.toml")
    }

    /// Load `path` if it exists, otherwise the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize pharos.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// A starter file listing every built-in gatherer explicitly.
    pub fn starter() -> Self {
        let artifacts = gatherers::default_definitions()
            .into_iter()
            .map(|definition| ArtifactEntry {
                gatherer: definition.id.clone(),
                id: definition.id,
                dependencies: definition.dependencies,
            })
            .collect();
        Self {
            artifacts,
            ..Self::default()
        }
    }

    /// Instantiate the configured artifact definitions and validate them.
    pub fn build_definitions(&self) -> Result<Vec<ArtifactDefinition>, DefinitionError> {
        if self.artifacts.is_empty() {
            return Ok(gatherers::default_definitions());
        }

        let definitions = self
            .artifacts
            .iter()
            .map(|entry| -> Result<ArtifactDefinition, DefinitionError> {
                let mut definition =
                    ArtifactDefinition::new(entry.id.clone(), gatherers::create(&entry.gatherer)?);
                definition.dependencies = entry.dependencies.clone();
                Ok(definition)
            })
            .collect::<Result<Vec<_>, _>>()?;
        validate_definitions(&definitions)?;
        Ok(definitions)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let settings = &self.settings;

        if let Err(e) = self.build_definitions() {
            warnings.push(format!("Invalid artifacts: {e}"));
        }
        if settings.max_wait_for_fcp_ms > settings.max_wait_for_load_ms {
            warnings.push(format!(
                "max_wait_for_fcp_ms ({}) exceeds max_wait_for_load_ms ({}); the load limit wins",
                settings.max_wait_for_fcp_ms, settings.max_wait_for_load_ms
            ));
        }
        let screen = &settings.screen_emulation;
        if !screen.disabled && (screen.width == 0 || screen.height == 0) {
            warnings.push(format!(
                "Invalid screen emulation size {}x{}",
                screen.width, screen.height
            ));
        }
        if settings.throttling_method == ThrottlingMethod::Devtools
            && settings.throttling.cpu_slowdown_multiplier < 1.0
        {
            warnings.push(format!(
                "cpu_slowdown_multiplier {} is below 1 and would speed the page up",
                settings.throttling.cpu_slowdown_multiplier
            ));
        }
        if self.connection.endpoint.trim().is_empty() {
            warnings.push("connection.endpoint is empty".to_string());
        }
        warnings
    }
}

/// Read an environment override, parsing it with `FromStr`.
fn env_override<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid {name}: {e}")),
        Err(_) => Ok(None),
    }
}

/// Configuration merged from the file, the environment and the CLI.
#[derive(Debug, Clone)]
pub struct PharosConfig {
    /// Path the file was (or would be) read from.
    pub config_path: PathBuf,
    pub toml: PharosToml,
    /// CLI override for the endpoint.
    pub cli_endpoint: Option<String>,
    /// CLI override for the throttling method.
    pub cli_throttling_method: Option<ThrottlingMethod>,
    /// CLI override for the load failure mode.
    pub cli_load_failure_mode: Option<LoadFailureMode>,
}

impl PharosConfig {
    /// Load from `config_path`, or `./pharos.toml` when not given.
    pub fn new(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
        let toml = PharosToml::load_or_default(&config_path)?;
        Ok(Self {
            config_path,
            toml,
            cli_endpoint: None,
            cli_throttling_method: None,
            cli_load_failure_mode: None,
        })
    }

    /// Endpoint to connect to (CLI → env → file → default).
    pub fn endpoint(&self) -> String {
        self.cli_endpoint
            .clone()
            .or_else(|| std::env::var("PHAROS_CONNECT").ok())
            .unwrap_or_else(|| self.toml.connection.endpoint.clone())
    }

    /// Effective run settings (CLI → env → file → default).
    pub fn settings(&self) -> Result<Settings> {
        let mut settings = self.toml.settings.clone();

        if let Some(method) = env_override::<ThrottlingMethod>("PHAROS_THROTTLING_METHOD")? {
            settings.throttling_method = method;
        }
        if let Some(mode) = env_override::<LoadFailureMode>("PHAROS_LOAD_FAILURE_MODE")? {
            settings.load_failure_mode = mode;
        }
        if let Some(disable) = env_override::<bool>("PHAROS_DISABLE_STORAGE_RESET")? {
            settings.disable_storage_reset = disable;
        }
        if let Some(ms) = env_override::<u64>("PHAROS_MAX_WAIT_FOR_LOAD_MS")? {
            settings.max_wait_for_load_ms = ms;
        }

        if let Some(method) = self.cli_throttling_method {
            settings.throttling_method = method;
        }
        if let Some(mode) = self.cli_load_failure_mode {
            settings.load_failure_mode = mode;
        }
        Ok(settings)
    }

    pub fn build_definitions(&self) -> Result<Vec<ArtifactDefinition>, DefinitionError> {
        self.toml.build_definitions()
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.toml.validate();
        if let Err(e) = self.settings() {
            warnings.push(e.to_string());
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_pharos_toml_parse_empty() {
        let toml = PharosToml::parse("").unwrap();
        assert_eq!(toml.connection.endpoint, "127.0.0.1:9222");
        assert_eq!(toml.settings, Settings::default());
        assert!(toml.artifacts.is_empty());
    }

    #[test]
    fn test_pharos_toml_parse_settings_and_artifacts() {
        let toml = PharosToml::parse(
            r#"
[connection]
endpoint = "10.0.0.2:9333"

[settings]
throttling_method = "devtools"
skip_about_blank = true

[[artifacts]]
id = "log"
gatherer = "DevtoolsLog"

[[artifacts]]
id = "html"
gatherer = "MainDocumentContent"
dependencies = { DevtoolsLog = "log" }
"#,
        )
        .unwrap();

        assert_eq!(toml.connection.endpoint, "10.0.0.2:9333");
        assert_eq!(toml.settings.throttling_method, ThrottlingMethod::Devtools);
        assert!(toml.settings.skip_about_blank);
        assert_eq!(toml.artifacts[1].dependencies["DevtoolsLog"], "log");

        let definitions = toml.build_definitions().unwrap();
        assert_eq!(definitions.len(), 2);
        assert_eq!(definitions[1].id, "html");
    }

    #[test]
    fn test_pharos_toml_parse_invalid() {
        let err = PharosToml::parse("[settings]\nthrottling_method = \"warp\"").unwrap_err();
        assert!(err.to_string().contains("pharos.toml"));
    }

    #[test]
    fn test_build_definitions_defaults_to_builtins() {
        let definitions = PharosToml::default().build_definitions().unwrap();
        assert_eq!(definitions.len(), gatherers::BUILTIN_GATHERERS.len());
    }

    #[test]
    fn test_build_definitions_rejects_unknown_gatherer() {
        let mut toml = PharosToml::default();
        toml.artifacts.push(ArtifactEntry {
            id: "x".into(),
            gatherer: "Screenshot".into(),
            dependencies: BTreeMap::new(),
        });
        assert_eq!(
            toml.build_definitions().err(),
            Some(DefinitionError::UnknownGatherer("Screenshot".into()))
        );
    }

    #[test]
    fn test_build_definitions_rejects_forward_dependency() {
        let toml = PharosToml::parse(
            r#"
[[artifacts]]
id = "html"
gatherer = "MainDocumentContent"
dependencies = { DevtoolsLog = "log" }

[[artifacts]]
id = "log"
gatherer = "DevtoolsLog"
"#,
        )
        .unwrap();
        assert!(matches!(
            toml.build_definitions(),
            Err(DefinitionError::ForwardDependency { .. })
        ));
        assert_eq!(toml.validate().len(), 1);
    }

    #[test]
    fn test_validate_flags_bad_settings() {
        let mut toml = PharosToml::default();
        toml.settings.max_wait_for_fcp_ms = 90_000;
        toml.settings.screen_emulation.width = 0;
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("max_wait_for_fcp_ms"));
        assert!(warnings[1].contains("screen emulation"));
    }

    #[test]
    fn test_starter_round_trips_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        PharosToml::starter().save(&path).unwrap();
        let loaded = PharosToml::load(&path).unwrap();
        assert_eq!(loaded.artifacts.len(), gatherers::BUILTIN_GATHERERS.len());
        assert!(loaded.validate().is_empty());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let toml = PharosToml::load_or_default(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert!(toml.artifacts.is_empty());
    }

    #[test]
    fn test_settings_layering() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            "[settings]\nthrottling_method = \"provided\"\nload_failure_mode = \"warn\"\n",
        )
        .unwrap();

        let mut config = PharosConfig::new(Some(path)).unwrap();
        unsafe { std::env::set_var("PHAROS_THROTTLING_METHOD", "devtools") };
        let settings = config.settings().unwrap();
        assert_eq!(settings.throttling_method, ThrottlingMethod::Devtools);
        assert_eq!(settings.load_failure_mode, LoadFailureMode::Warn);

        config.cli_throttling_method = Some(ThrottlingMethod::Simulate);
        config.cli_load_failure_mode = Some(LoadFailureMode::Ignore);
        let settings = config.settings().unwrap();
        assert_eq!(settings.throttling_method, ThrottlingMethod::Simulate);
        assert_eq!(settings.load_failure_mode, LoadFailureMode::Ignore);

        unsafe { std::env::set_var("PHAROS_THROTTLING_METHOD", "warp") };
        assert!(config.settings().is_err());
        unsafe { std::env::remove_var("PHAROS_THROTTLING_METHOD") };
    }

    #[test]
    fn test_endpoint_priority() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let mut config = PharosConfig::new(Some(PathBuf::from("/nonexistent/pharos.toml"))).unwrap();
        unsafe { std::env::remove_var("PHAROS_CONNECT") };
        assert_eq!(config.endpoint(), "127.0.0.1:9222");

        unsafe { std::env::set_var("PHAROS_CONNECT", "10.1.1.1:9000") };
        assert_eq!(config.endpoint(), "10.1.1.1:9000");

        config.cli_endpoint = Some("localhost:1".into());
        assert_eq!(config.endpoint(), "localhost:1");
        unsafe { std::env::remove_var("PHAROS_CONNECT") };
    }
}
