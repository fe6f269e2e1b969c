//! Configuration loading for the cadence daemon.
//!
//! YAML with `${VAR}` environment interpolation applied to the raw file before
//! parsing. Relative paths resolve against `base_dir`, which defaults to the
//! directory containing the config file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("{field}: environment variable ${{{var}}} is not set")]
    UnsetEnvVar { field: String, var: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

fn env_var_pattern() -> Regex {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap()
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for resolving relative paths. Defaults to the config file's
    /// directory.
    pub base_dir: Option<PathBuf>,
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub ductile: DuctileConfig,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "cadenced".to_string(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/cadenced.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: String,
    pub token: String,
    #[serde(with = "duration_str")]
    pub stream_poll_interval: Duration,
    #[serde(with = "duration_str")]
    pub stream_heartbeat_interval: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8090".to_string(),
            token: String::new(),
            stream_poll_interval: Duration::from_millis(700),
            stream_heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// Connection to the Ductile plugin gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DuctileConfig {
    pub base_url: String,
    pub token: String,
    /// Entries of the form `plugin/command`.
    pub allowlist: Vec<String>,
    /// Optional completion webhook.
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// One of `anthropic`, `openai`, `ollama`.
    pub provider: String,
    pub model: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: String::new(),
            model: String::new(),
            api_key: String::new(),
            base_url: None,
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub default_max_loops: u32,
    #[serde(with = "duration_str")]
    pub default_deadline: Duration,
    #[serde(with = "duration_str")]
    pub step_timeout: Duration,
    pub max_retry_per_step: u32,
    pub max_act_rounds: u32,
    pub queue_capacity: usize,
    #[serde(with = "duration_str")]
    pub enqueue_timeout: Duration,
    pub workspace_dir: PathBuf,
    pub save_loop_memory: bool,
    pub prompts: AgentPrompts,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_max_loops: 10,
            default_deadline: Duration::from_secs(5 * 60),
            step_timeout: Duration::from_secs(60),
            max_retry_per_step: 3,
            max_act_rounds: 6,
            queue_capacity: 100,
            enqueue_timeout: Duration::from_secs(2),
            workspace_dir: PathBuf::from("./data/workspaces"),
            save_loop_memory: false,
            prompts: AgentPrompts::default(),
        }
    }
}

/// Stage prompt templates. All four are required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentPrompts {
    pub frame: String,
    pub plan: String,
    pub act: String,
    pub reflect: String,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut cfg = Self::from_yaml(&raw)?;
        let base = match cfg.base_dir.take() {
            Some(dir) => dir,
            None => path.parent().unwrap_or(Path::new(".")).to_path_buf(),
        };
        cfg.resolve_paths(&base);
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse configuration from raw YAML, interpolating `${VAR}` references.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let interpolated = interpolate_env(raw);
        let cfg: Config = serde_yaml::from_str(&interpolated)?;
        Ok(cfg)
    }

    /// Resolve relative paths against the given base directory.
    pub fn resolve_paths(&mut self, base: &Path) {
        let base = base
            .canonicalize()
            .unwrap_or_else(|_| base.to_path_buf());
        if self.database.path.is_relative() {
            self.database.path = base.join(&self.database.path);
        }
        if self.agent.workspace_dir.is_relative() {
            self.agent.workspace_dir = base.join(&self.agent.workspace_dir);
        }
        self.base_dir = Some(base);
    }

    /// Validate the configuration, naming the offending field on failure.
    pub fn validate(&self) -> Result<()> {
        const LOG_LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];
        if !LOG_LEVELS.contains(&self.service.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "service.log_level must be one of: debug, info, warn, error (got {:?})",
                self.service.log_level
            )));
        }
        if self.api.token.is_empty() {
            return Err(ConfigError::Invalid("api.token is required".to_string()));
        }
        check_resolved("api.token", &self.api.token)?;
        if self.llm.provider.is_empty() {
            return Err(ConfigError::Invalid("llm.provider is required".to_string()));
        }
        // api_key required for remote providers, not for local ollama.
        if self.llm.provider != "ollama" {
            if self.llm.api_key.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "llm.api_key is required for provider {:?}",
                    self.llm.provider
                )));
            }
            check_resolved("llm.api_key", &self.llm.api_key)?;
        }
        if self.ductile.base_url.is_empty() {
            return Err(ConfigError::Invalid(
                "ductile.base_url is required".to_string(),
            ));
        }
        check_resolved("ductile.token", &self.ductile.token)?;
        for (field, value) in [
            ("agent.prompts.frame", &self.agent.prompts.frame),
            ("agent.prompts.plan", &self.agent.prompts.plan),
            ("agent.prompts.act", &self.agent.prompts.act),
            ("agent.prompts.reflect", &self.agent.prompts.reflect),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Invalid(format!("{field} is required")));
            }
        }
        if self.agent.default_max_loops == 0 {
            return Err(ConfigError::Invalid(
                "agent.default_max_loops must be positive".to_string(),
            ));
        }
        if self.agent.default_deadline.is_zero() {
            return Err(ConfigError::Invalid(
                "agent.default_deadline must be positive".to_string(),
            ));
        }
        if self.agent.step_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "agent.step_timeout must be positive".to_string(),
            ));
        }
        if self.agent.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "agent.queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reject values still carrying an unresolved `${VAR}` reference.
fn check_resolved(field: &str, value: &str) -> Result<()> {
    if let Some(caps) = env_var_pattern().captures(value) {
        return Err(ConfigError::UnsetEnvVar {
            field: field.to_string(),
            var: caps[1].to_string(),
        });
    }
    Ok(())
}

/// Replace `${VAR}` with the environment value; unset variables are left as-is
/// so validation can name them.
fn interpolate_env(input: &str) -> String {
    env_var_pattern()
        .replace_all(input, |caps: &regex::Captures<'_>| {
            match std::env::var(&caps[1]) {
                Ok(value) => value,
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Serde adapter for humane duration strings ("700ms", "5m").
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
api:
  token: "secret"
ductile:
  base_url: "http://localhost:9000"
llm:
  provider: "ollama"
  model: "llama3"
agent:
  prompts:
    frame: "frame {{ goal }}"
    plan: "plan"
    act: "act"
    reflect: "reflect"
"#
    }

    #[test]
    fn minimal_config_parses_and_validates() {
        let cfg = Config::from_yaml(minimal_yaml()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.service.log_level, "info");
        assert_eq!(cfg.api.listen, "127.0.0.1:8090");
        assert_eq!(cfg.agent.default_max_loops, 10);
        assert_eq!(cfg.agent.default_deadline, Duration::from_secs(300));
        assert_eq!(cfg.api.stream_poll_interval, Duration::from_millis(700));
        assert_eq!(cfg.llm.max_tokens, 4096);
    }

    #[test]
    fn duration_strings_parse() {
        let yaml = format!(
            "{}\n",
            minimal_yaml().replace(
                "agent:",
                "agent:\n  default_deadline: \"90s\"\n  step_timeout: \"2m\"\n  enqueue_timeout: \"0s\""
            )
        );
        let cfg = Config::from_yaml(&yaml).unwrap();
        assert_eq!(cfg.agent.default_deadline, Duration::from_secs(90));
        assert_eq!(cfg.agent.step_timeout, Duration::from_secs(120));
        assert_eq!(cfg.agent.enqueue_timeout, Duration::ZERO);
    }

    #[test]
    fn env_interpolation_substitutes_set_vars() {
        std::env::set_var("CADENCE_TEST_TOKEN", "from-env");
        let yaml = minimal_yaml().replace("\"secret\"", "\"${CADENCE_TEST_TOKEN}\"");
        let cfg = Config::from_yaml(&yaml).unwrap();
        assert_eq!(cfg.api.token, "from-env");
    }

    #[test]
    fn unset_env_var_is_named_in_error() {
        let yaml = minimal_yaml().replace("\"secret\"", "\"${CADENCE_DEFINITELY_UNSET_VAR}\"");
        let cfg = Config::from_yaml(&yaml).unwrap();
        let err = cfg.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("CADENCE_DEFINITELY_UNSET_VAR"), "{msg}");
        assert!(msg.contains("api.token"), "{msg}");
    }

    #[test]
    fn missing_prompt_is_rejected() {
        let yaml = minimal_yaml().replace("    reflect: \"reflect\"\n", "");
        let cfg = Config::from_yaml(&yaml).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("agent.prompts.reflect"));
    }

    #[test]
    fn api_key_required_for_remote_providers_only() {
        let yaml = minimal_yaml().replace("\"ollama\"", "\"anthropic\"");
        let cfg = Config::from_yaml(&yaml).unwrap();
        assert!(cfg.validate().is_err());

        let cfg = Config::from_yaml(minimal_yaml()).unwrap();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn load_resolves_relative_paths_against_config_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, minimal_yaml()).unwrap();

        let cfg = Config::load(&path).unwrap();
        assert!(cfg.database.path.is_absolute());
        assert!(cfg.agent.workspace_dir.is_absolute());
        assert!(cfg
            .database
            .path
            .starts_with(dir.path().canonicalize().unwrap()));
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let yaml = format!("service:\n  log_level: \"verbose\"\n{}", minimal_yaml());
        let cfg = Config::from_yaml(&yaml).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("service.log_level"));
    }
}
