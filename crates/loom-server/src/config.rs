//! Service configuration
//!
//! Resolution precedence: environment > project file
//! (`<projectPath>/.loom/config.json`) > user file
//! (`~/.config/loom/config.json`) > defaults. Duration fields accept
//! integer milliseconds or suffixed strings (`5m`, `24h`).

use std::path::Path;
use std::time::Duration;

use loom_domain::{
    derive_project_id, duration, validate, ChannelDescriptor, LoomError,
};
use loom_engine::{EngineConfig, WorkQueueConfig};
use serde::{Deserialize, Serialize};

/// Log verbosity threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    fn parse(s: &str) -> Result<Self, LoomError> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(LoomError::configuration(format!(
                "invalid log level {other:?}: expected DEBUG, INFO, WARN, or ERROR"
            ))),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    fn parse(s: &str) -> Result<Self, LoomError> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" => Ok(LogFormat::Text),
            other => Err(LoomError::configuration(format!(
                "invalid log format {other:?}: expected json or text"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            format: LogFormat::Text,
        }
    }
}

/// Fully resolved service configuration
#[derive(Debug, Clone)]
pub struct LoomConfig {
    pub nats_url: String,
    /// 16 lowercase hex channel namespace
    pub namespace: String,
    /// 16 lowercase hex project tag
    pub project_id: String,
    pub project_path: String,
    pub username: Option<String>,
    pub channels: Vec<ChannelDescriptor>,
    pub logging: LoggingConfig,
    pub work_queue: WorkQueueConfig,
}

/// The shape of a config file; every field optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigFile {
    pub nats_url: Option<String>,
    pub namespace: Option<String>,
    pub project_id: Option<String>,
    pub project_path: Option<String>,
    pub username: Option<String>,
    pub channels: Option<Vec<ChannelDescriptor>>,
    pub logging: Option<LoggingFile>,
    pub work_queue: Option<WorkQueueFile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingFile {
    pub level: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkQueueFile {
    #[serde(rename = "ackTimeoutMs", with = "duration::serde_opt_millis")]
    pub ack_timeout: Option<Duration>,
    #[serde(rename = "maxDeliveryAttempts")]
    pub max_delivery_attempts: Option<u32>,
    #[serde(rename = "deadLetterTTLMs", with = "duration::serde_opt_millis")]
    pub dead_letter_ttl: Option<Duration>,
}

/// Environment overrides, injected as a value so tests never touch
/// process environment
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub nats_url: Option<String>,
    pub namespace: Option<String>,
    pub project_id: Option<String>,
    pub project_path: Option<String>,
    pub username: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub ack_timeout: Option<String>,
    pub max_delivery_attempts: Option<String>,
    pub dead_letter_ttl: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        EnvOverrides {
            nats_url: var("LOOM_NATS_URL"),
            namespace: var("LOOM_NAMESPACE"),
            project_id: var("LOOM_PROJECT_ID"),
            project_path: var("LOOM_PROJECT_PATH"),
            username: var("LOOM_USERNAME"),
            log_level: var("LOOM_LOG_LEVEL"),
            log_format: var("LOOM_LOG_FORMAT"),
            ack_timeout: var("LOOM_ACK_TIMEOUT"),
            max_delivery_attempts: var("LOOM_MAX_DELIVERY_ATTEMPTS"),
            dead_letter_ttl: var("LOOM_DEAD_LETTER_TTL"),
        }
    }
}

impl LoomConfig {
    /// Resolve from the standard file locations and the process
    /// environment.
    pub fn resolve() -> Result<Self, LoomError> {
        let env = EnvOverrides::from_env();

        // The project path decides where the project file lives, so it is
        // resolved first from env alone (the project file cannot move
        // itself).
        let project_path = env
            .project_path
            .clone()
            .or_else(|| {
                std::env::current_dir()
                    .ok()
                    .map(|p| p.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| ".".to_string());

        let user_file = dirs::config_dir().map(|d| d.join("loom").join("config.json"));
        let project_file = Path::new(&project_path).join(".loom").join("config.json");

        Self::resolve_from(
            user_file.as_deref().and_then(load_file).transpose()?,
            load_file(&project_file).transpose()?,
            env,
            &project_path,
        )
    }

    /// Layer defaults, then the user file, then the project file, then
    /// environment overrides.
    pub fn resolve_from(
        user: Option<ConfigFile>,
        project: Option<ConfigFile>,
        env: EnvOverrides,
        default_project_path: &str,
    ) -> Result<Self, LoomError> {
        let mut file = ConfigFile::default();
        if let Some(user) = user {
            file.layer(user);
        }
        if let Some(project) = project {
            file.layer(project);
        }

        let project_path = env
            .project_path
            .or(file.project_path)
            .unwrap_or_else(|| default_project_path.to_string());

        let project_id = match env.project_id.or(file.project_id) {
            Some(id) => id,
            None => derive_project_id(&project_path),
        };
        if !validate::is_project_id(&project_id) {
            return Err(LoomError::configuration(format!(
                "projectId {project_id:?} must be 16 lowercase hex characters"
            )));
        }

        let namespace = env
            .namespace
            .or(file.namespace)
            .unwrap_or_else(|| project_id.clone());
        if !validate::is_project_id(&namespace) {
            return Err(LoomError::configuration(format!(
                "namespace {namespace:?} must be 16 lowercase hex characters"
            )));
        }

        let nats_url = env
            .nats_url
            .or(file.nats_url)
            .unwrap_or_else(|| "nats://localhost:4222".to_string());
        if !nats_url.starts_with("nats://") {
            return Err(LoomError::configuration(format!(
                "natsUrl {nats_url:?} must begin with nats://"
            )));
        }

        let logging_file = file.logging.unwrap_or_default();
        let logging = LoggingConfig {
            level: match env.log_level.or(logging_file.level) {
                Some(level) => LogLevel::parse(&level)?,
                None => LogLevel::Info,
            },
            format: match env.log_format.or(logging_file.format) {
                Some(format) => LogFormat::parse(&format)?,
                None => LogFormat::Text,
            },
        };

        let wq_file = file.work_queue.unwrap_or_default();
        let mut work_queue = WorkQueueConfig::default();
        if let Some(ack) = parse_env_duration(env.ack_timeout.as_deref())?.or(wq_file.ack_timeout) {
            work_queue.ack_timeout = ack;
        }
        if let Some(attempts) = parse_env_u32(env.max_delivery_attempts.as_deref())?
            .or(wq_file.max_delivery_attempts)
        {
            work_queue.max_delivery_attempts = attempts;
        }
        if let Some(ttl) =
            parse_env_duration(env.dead_letter_ttl.as_deref())?.or(wq_file.dead_letter_ttl)
        {
            work_queue.dead_letter_ttl = ttl;
        }

        let channels = file.channels.unwrap_or_default();
        for channel in &channels {
            channel.validate()?;
        }

        Ok(LoomConfig {
            nats_url,
            namespace,
            project_id,
            project_path,
            username: env.username.or(file.username),
            channels,
            logging,
            work_queue,
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::for_project(&self.project_id, &self.project_path);
        config.namespace = self.namespace.clone();
        config.nats_url = self.nats_url.clone();
        config.username = self.username.clone();
        config.channels = self.channels.clone();
        config.work_queue = self.work_queue.clone();
        config
    }
}

impl ConfigFile {
    /// Overlay `other` on top of `self`; present fields win.
    fn layer(&mut self, other: ConfigFile) {
        if other.nats_url.is_some() {
            self.nats_url = other.nats_url;
        }
        if other.namespace.is_some() {
            self.namespace = other.namespace;
        }
        if other.project_id.is_some() {
            self.project_id = other.project_id;
        }
        if other.project_path.is_some() {
            self.project_path = other.project_path;
        }
        if other.username.is_some() {
            self.username = other.username;
        }
        if other.channels.is_some() {
            self.channels = other.channels;
        }
        if let Some(logging) = other.logging {
            let base = self.logging.get_or_insert_with(Default::default);
            if logging.level.is_some() {
                base.level = logging.level;
            }
            if logging.format.is_some() {
                base.format = logging.format;
            }
        }
        if let Some(work_queue) = other.work_queue {
            let base = self.work_queue.get_or_insert_with(Default::default);
            if work_queue.ack_timeout.is_some() {
                base.ack_timeout = work_queue.ack_timeout;
            }
            if work_queue.max_delivery_attempts.is_some() {
                base.max_delivery_attempts = work_queue.max_delivery_attempts;
            }
            if work_queue.dead_letter_ttl.is_some() {
                base.dead_letter_ttl = work_queue.dead_letter_ttl;
            }
        }
    }
}

fn load_file(path: &Path) -> Option<Result<ConfigFile, LoomError>> {
    if !path.exists() {
        return None;
    }
    Some(
        std::fs::read_to_string(path)
            .map_err(|e| {
                LoomError::configuration(format!("cannot read {}: {e}", path.display()))
            })
            .and_then(|text| {
                serde_json::from_str(&text).map_err(|e| {
                    LoomError::configuration(format!("cannot parse {}: {e}", path.display()))
                })
            }),
    )
}

fn parse_env_duration(value: Option<&str>) -> Result<Option<Duration>, LoomError> {
    value
        .map(duration::parse_duration)
        .transpose()
        .map_err(|e| LoomError::configuration(e.to_string()))
}

fn parse_env_u32(value: Option<&str>) -> Result<Option<u32>, LoomError> {
    value
        .map(|v| {
            v.parse::<u32>()
                .map_err(|_| LoomError::configuration(format!("invalid integer {v:?}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve() {
        let config =
            LoomConfig::resolve_from(None, None, EnvOverrides::default(), "/some/project")
                .expect("resolve");
        assert_eq!(config.nats_url, "nats://localhost:4222");
        assert_eq!(config.project_id, derive_project_id("/some/project"));
        assert_eq!(config.namespace, config.project_id);
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.work_queue.ack_timeout, Duration::from_secs(300));
        assert_eq!(config.work_queue.max_delivery_attempts, 3);
        assert_eq!(
            config.work_queue.dead_letter_ttl,
            Duration::from_secs(604_800)
        );
    }

    #[test]
    fn test_project_file_overrides_user_file() {
        let user: ConfigFile = serde_json::from_str(
            r#"{"natsUrl":"nats://user:4222","logging":{"level":"DEBUG","format":"json"}}"#,
        )
        .expect("user file");
        let project: ConfigFile =
            serde_json::from_str(r#"{"natsUrl":"nats://project:4222"}"#).expect("project file");

        let config =
            LoomConfig::resolve_from(Some(user), Some(project), EnvOverrides::default(), "/p")
                .expect("resolve");
        assert_eq!(config.nats_url, "nats://project:4222");
        // Untouched user-file fields survive the overlay.
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_env_overrides_everything() {
        let project: ConfigFile =
            serde_json::from_str(r#"{"natsUrl":"nats://project:4222"}"#).expect("project file");
        let env = EnvOverrides {
            nats_url: Some("nats://env:4222".to_string()),
            log_level: Some("ERROR".to_string()),
            ack_timeout: Some("90s".to_string()),
            ..Default::default()
        };

        let config = LoomConfig::resolve_from(None, Some(project), env, "/p").expect("resolve");
        assert_eq!(config.nats_url, "nats://env:4222");
        assert_eq!(config.logging.level, LogLevel::Error);
        assert_eq!(config.work_queue.ack_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_work_queue_durations_accept_strings_and_millis() {
        let file: ConfigFile = serde_json::from_str(
            r#"{"workQueue":{"ackTimeoutMs":"5m","deadLetterTTLMs":86400000,"maxDeliveryAttempts":5}}"#,
        )
        .expect("file");
        let config =
            LoomConfig::resolve_from(None, Some(file), EnvOverrides::default(), "/p")
                .expect("resolve");
        assert_eq!(config.work_queue.ack_timeout, Duration::from_secs(300));
        assert_eq!(
            config.work_queue.dead_letter_ttl,
            Duration::from_secs(86_400)
        );
        assert_eq!(config.work_queue.max_delivery_attempts, 5);
    }

    #[test]
    fn test_invalid_values_are_configuration_errors() {
        let env = EnvOverrides {
            project_id: Some("NOT-HEX".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            LoomConfig::resolve_from(None, None, env, "/p"),
            Err(LoomError::Configuration { .. })
        ));

        let env = EnvOverrides {
            nats_url: Some("http://localhost".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            LoomConfig::resolve_from(None, None, env, "/p"),
            Err(LoomError::Configuration { .. })
        ));

        let env = EnvOverrides {
            log_level: Some("LOUD".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            LoomConfig::resolve_from(None, None, env, "/p"),
            Err(LoomError::Configuration { .. })
        ));
    }

    #[test]
    fn test_load_file_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");

        assert!(load_file(&path).is_none(), "missing file is not an error");

        std::fs::write(&path, r#"{"natsUrl":"nats://disk:4222"}"#).expect("write");
        let file = load_file(&path).expect("present").expect("parses");
        assert_eq!(file.nats_url.as_deref(), Some("nats://disk:4222"));

        std::fs::write(&path, "{nope").expect("write");
        let err = load_file(&path).expect("present").expect_err("parse error");
        assert!(matches!(err, LoomError::Configuration { .. }));
    }

    #[test]
    fn test_channel_descriptors_from_file() {
        let file: ConfigFile = serde_json::from_str(
            r#"{"channels":[{"name":"general","description":"chat"},{"name":"alerts","retention":{"maxMessages":100,"maxBytes":1048576,"maxAge":"1h"}}]}"#,
        )
        .expect("file");
        let config =
            LoomConfig::resolve_from(None, Some(file), EnvOverrides::default(), "/p")
                .expect("resolve");
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[1].retention.max_age, Duration::from_secs(3600));

        let bad: ConfigFile =
            serde_json::from_str(r#"{"channels":[{"name":"Bad Name"}]}"#).expect("file");
        assert!(LoomConfig::resolve_from(None, Some(bad), EnvOverrides::default(), "/p").is_err());
    }
}
