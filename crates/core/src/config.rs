use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::{ApprovalChain, ChainError, RoleMap, Stage};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub approval: ApprovalConfig,
    pub escalation: EscalationConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Approval chain and role wiring. Stage names are validated against the
/// `Stage` vocabulary when the chain is built, so a typo fails at startup
/// rather than at approval time.
#[derive(Clone, Debug)]
pub struct ApprovalConfig {
    pub stages: Vec<String>,
    pub role_map: HashMap<String, String>,
    pub cross_hospital_entry_stage: Option<String>,
}

#[derive(Clone, Debug)]
pub struct EscalationConfig {
    pub sweep_interval_secs: u64,
    pub default_escalate_after_hours: i64,
    /// Empty means every chain stage except the last.
    pub escalatable_stages: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub sweep_interval_secs: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://wardflow.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            approval: ApprovalConfig {
                stages: vec!["level1".to_string(), "hod".to_string(), "cfo".to_string()],
                role_map: HashMap::from([
                    ("supervisor".to_string(), "level1".to_string()),
                    ("hod".to_string(), "hod".to_string()),
                    ("cfo".to_string(), "cfo".to_string()),
                ]),
                cross_hospital_entry_stage: None,
            },
            escalation: EscalationConfig {
                sweep_interval_secs: 900,
                default_escalate_after_hours: 24,
                escalatable_stages: Vec::new(),
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("wardflow.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// Builds the configured chain, including the cross-hospital entry
    /// stage when one is set.
    pub fn approval_chain(&self) -> Result<ApprovalChain, ConfigError> {
        let stages = self
            .approval
            .stages
            .iter()
            .map(|name| parse_stage(name))
            .collect::<Result<Vec<Stage>, ConfigError>>()?;
        let mut chain = ApprovalChain::new(stages)?;

        if let Some(entry) = &self.approval.cross_hospital_entry_stage {
            chain = chain.with_cross_hospital_entry(parse_stage(entry)?)?;
        }
        Ok(chain)
    }

    /// Builds the role map, refusing roles that point outside the chain.
    pub fn role_map(&self) -> Result<RoleMap, ConfigError> {
        let chain = self.approval_chain()?;
        let mut entries = Vec::with_capacity(self.approval.role_map.len());
        for (role, stage_name) in &self.approval.role_map {
            let stage = parse_stage(stage_name)?;
            if !chain.contains(stage) {
                return Err(ConfigError::Validation(format!(
                    "role `{role}` maps to stage `{stage_name}` which is not in the chain"
                )));
            }
            entries.push((role.clone(), stage));
        }
        Ok(RoleMap::new(entries))
    }

    /// Stage set the escalation sweep considers. Defaults to every chain
    /// stage except the last.
    pub fn sweep_stages(&self) -> Result<Vec<Stage>, ConfigError> {
        let chain = self.approval_chain()?;
        if self.escalation.escalatable_stages.is_empty() {
            return Ok(chain.escalatable_stages());
        }

        let mut stages = Vec::with_capacity(self.escalation.escalatable_stages.len());
        for name in &self.escalation.escalatable_stages {
            let stage = parse_stage(name)?;
            if !chain.contains(stage) {
                return Err(ConfigError::Validation(format!(
                    "escalatable stage `{name}` is not in the chain"
                )));
            }
            stages.push(stage);
        }
        Ok(stages)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(approval) = patch.approval {
            if let Some(stages) = approval.stages {
                self.approval.stages = stages;
            }
            if let Some(role_map) = approval.role_map {
                self.approval.role_map = role_map;
            }
            if let Some(entry) = approval.cross_hospital_entry_stage {
                self.approval.cross_hospital_entry_stage = Some(entry);
            }
        }

        if let Some(escalation) = patch.escalation {
            if let Some(interval) = escalation.sweep_interval_secs {
                self.escalation.sweep_interval_secs = interval;
            }
            if let Some(hours) = escalation.default_escalate_after_hours {
                self.escalation.default_escalate_after_hours = hours;
            }
            if let Some(stages) = escalation.escalatable_stages {
                self.escalation.escalatable_stages = stages;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("WARDFLOW_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("WARDFLOW_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("WARDFLOW_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("WARDFLOW_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("WARDFLOW_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("WARDFLOW_ESCALATION_SWEEP_INTERVAL_SECS") {
            self.escalation.sweep_interval_secs =
                parse_u64("WARDFLOW_ESCALATION_SWEEP_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("WARDFLOW_ESCALATION_DEFAULT_AFTER_HOURS") {
            self.escalation.default_escalate_after_hours =
                parse_i64("WARDFLOW_ESCALATION_DEFAULT_AFTER_HOURS", &value)?;
        }

        if let Some(value) = read_env("WARDFLOW_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("WARDFLOW_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("WARDFLOW_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("WARDFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("WARDFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("WARDFLOW_LOGGING_LEVEL").or_else(|| read_env("WARDFLOW_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("WARDFLOW_LOGGING_FORMAT").or_else(|| read_env("WARDFLOW_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(interval) = overrides.sweep_interval_secs {
            self.escalation.sweep_interval_secs = interval;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        self.role_map()?;
        self.sweep_stages()?;
        validate_escalation(&self.escalation)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn parse_stage(name: &str) -> Result<Stage, ConfigError> {
    Stage::parse(name).ok_or_else(|| ChainError::UnknownStage(name.to_string()).into())
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("wardflow.toml"), PathBuf::from("config/wardflow.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_escalation(escalation: &EscalationConfig) -> Result<(), ConfigError> {
    if escalation.sweep_interval_secs == 0 || escalation.sweep_interval_secs > 86_400 {
        return Err(ConfigError::Validation(
            "escalation.sweep_interval_secs must be in range 1..=86400".to_string(),
        ));
    }

    if escalation.default_escalate_after_hours <= 0 {
        return Err(ConfigError::Validation(
            "escalation.default_escalate_after_hours must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_i64(key: &str, value: &str) -> Result<i64, ConfigError> {
    value.parse::<i64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    approval: Option<ApprovalPatch>,
    escalation: Option<EscalationPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ApprovalPatch {
    stages: Option<Vec<String>>,
    role_map: Option<HashMap<String, String>>,
    cross_hospital_entry_stage: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EscalationPatch {
    sweep_interval_secs: Option<u64>,
    default_escalate_after_hours: Option<i64>,
    escalatable_stages: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
