//! Loading of `stackplan.yaml`.
//!
//! Reads the YAML file, then layers `.env` values and `STACKPLAN_*`
//! environment variables on top of it.

use crate::error::{ConfigError, Result, StackplanError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::StackConfig;

/// Environment variable holding the HTTP provider bearer token.
pub const PROVIDER_TOKEN_VAR: &str = "STACKPLAN_PROVIDER_TOKEN";

/// File names looked up, in order, when no config path is given.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["stackplan.yaml", "stackplan.yml"];

type Override = fn(&mut StackConfig, String);

/// Environment variables that replace a config value, with the field they set.
const OVERRIDES: &[(&str, &str, Override)] = &[
    ("STACKPLAN_PROJECT_NAME", "project.name", |c, v| c.project.name = v),
    ("STACKPLAN_PROJECT_ENVIRONMENT", "project.environment", |c, v| {
        c.project.environment = v;
    }),
    ("STACKPLAN_STATE_BUCKET", "state.bucket", |c, v| c.state.bucket = Some(v)),
    ("STACKPLAN_STATE_PREFIX", "state.prefix", |c, v| c.state.prefix = Some(v)),
    ("STACKPLAN_PROVIDER_ENDPOINT", "provider.endpoint", |c, v| {
        c.provider.endpoint = Some(v);
    }),
];

/// Reads stack configuration from disk.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Directory holding the config and its `.env`.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a parser rooted at the working directory.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Roots the parser at `path`, where `.env` is looked up.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Reads and parses a config file.
    ///
    /// # Errors
    ///
    /// Returns `FileNotFound` for a missing file and `ParseError` when it
    /// cannot be read or is not valid YAML for a stack.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Reading stack configuration {}", path.display());

        if !path.exists() {
            return Err(StackplanError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StackplanError::Config(ConfigError::ParseError {
                message: format!("cannot read config: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a stack from YAML text. `source` only labels error locations.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` with the line and column when known.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        let config: StackConfig = serde_yaml::from_str(content).map_err(|e| {
            let position = e
                .location()
                .map(|l| format!("line {}, column {}", l.line(), l.column()));
            let location = match (source, position) {
                (Some(p), Some(pos)) => Some(format!("{}: {pos}", p.display())),
                (Some(p), None) => Some(p.display().to_string()),
                (None, pos) => pos,
            };
            StackplanError::Config(ConfigError::ParseError {
                message: format!("invalid stack YAML: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed project {} with {} units",
            config.project.name,
            config.units.len()
        );
        Ok(config)
    }

    /// Reads a config file and applies the `STACKPLAN_*` overrides from the
    /// process environment.
    ///
    /// # Errors
    ///
    /// Same as [`ConfigParser::load_file`].
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok());
        Ok(config)
    }

    /// Applies every override that `lookup` returns a value for.
    pub fn apply_env_overrides(config: &mut StackConfig, lookup: impl Fn(&str) -> Option<String>) {
        for (var, field, set) in OVERRIDES {
            if let Some(value) = lookup(var) {
                debug!("{field} set from {var}");
                set(config, value);
            }
        }
    }

    /// Loads `.env` from the base path into the process environment.
    ///
    /// A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` if the file exists but is malformed.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if !env_path.exists() {
            debug!("No .env at {}", env_path.display());
            return Ok(());
        }

        info!("Reading environment file {}", env_path.display());
        dotenvy::from_path(&env_path).map_err(|e| {
            StackplanError::Config(ConfigError::ParseError {
                message: format!("invalid .env file: {e}"),
                location: Some(env_path.display().to_string()),
            })
        })?;

        Ok(())
    }

    /// Reads the HTTP provider token.
    ///
    /// # Errors
    ///
    /// Returns `MissingEnvVar` when `STACKPLAN_PROVIDER_TOKEN` is unset.
    pub fn get_provider_token() -> Result<String> {
        std::env::var(PROVIDER_TOKEN_VAR).map_err(|_| {
            StackplanError::Config(ConfigError::MissingEnvVar {
                name: String::from(PROVIDER_TOKEN_VAR),
            })
        })
    }
}

/// Walks up from `start_dir` until a directory holds one of
/// [`DEFAULT_CONFIG_FILES`].
///
/// # Errors
///
/// Returns `FileNotFound` naming `stackplan.yaml` in `start_dir` when the
/// filesystem root is reached.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();

    for dir in start.ancestors() {
        if let Some(found) = DEFAULT_CONFIG_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.exists())
        {
            info!("Using configuration {}", found.display());
            return Ok(found);
        }
    }

    Err(StackplanError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderKind, StateBackend};
    use std::collections::HashMap;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
units: []
";
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert!(config.units.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r"
project:
  name: n8n
  environment: prod

state:
  backend: s3
  bucket: stackplan-state
  prefix: n8n/prod/

provider:
  kind: http
  endpoint: https://provisioner.internal
  timeout_secs: 10

execution:
  max_parallel: 4
  replace_strategy: create_before_delete

guardrails:
  max_deletes: 2
  allow_replace: false

units:
  - name: network
    resources:
      - id: vpc
        kind: network
        attributes: { cidr: 10.0.0.0/16, max_azs: 2 }
";
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.provider.kind, ProviderKind::Http);
        assert_eq!(config.execution.max_parallel, 4);
        assert_eq!(config.guardrails.as_ref().and_then(|g| g.max_deletes), Some(2));
        assert_eq!(config.total_resources(), 1);
    }

    #[test]
    fn test_parse_error_has_location() {
        let err = ConfigParser::new()
            .parse_yaml("project: [unclosed", Some(Path::new("stackplan.yaml")))
            .unwrap_err();

        match err {
            StackplanError::Config(ConfigError::ParseError { location, .. }) => {
                assert!(location.unwrap().starts_with("stackplan.yaml"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConfigParser::new()
            .parse_yaml("project: { name: local }\nunits: []\n", None)
            .unwrap();
        let env = HashMap::from([
            ("STACKPLAN_PROJECT_NAME", "ci"),
            ("STACKPLAN_STATE_BUCKET", "ci-state"),
            ("STACKPLAN_PROVIDER_ENDPOINT", "http://localhost:9000"),
        ]);

        ConfigParser::apply_env_overrides(&mut config, |name| env.get(name).map(|v| (*v).to_string()));
        assert_eq!(config.project.name, "ci");
        assert_eq!(config.state.bucket.as_deref(), Some("ci-state"));
        assert_eq!(config.provider.endpoint.as_deref(), Some("http://localhost:9000"));
        assert!(config.state.prefix.is_none());
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stackplan.yaml"), "").unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("stackplan.yaml"));
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigParser::new().load_file("/nonexistent/stackplan.yaml").unwrap_err();
        assert!(matches!(err, StackplanError::Config(ConfigError::FileNotFound { .. })));
    }
}
