//! Configuration layer: typed settings with layered precedence (file → env →
//! CLI), plus the engine environment blob handed over by the bootstrap URL.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "raffica";
const DEFAULT_LISTEN: &str = "127.0.0.1:8787";
const DEFAULT_DATA_DIR: &str = ".";

/// Fallback poll cadence when the environment does not specify one.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;

/// Name of the bootstrap query parameter carrying the engine environment.
pub const ENV_QUERY_PARAM: &str = "env";

/// Command-line arguments for the Raffica binary.
#[derive(Debug, Parser)]
#[command(name = "raffica", version, about = "Raffica caching proxy")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "RAFFICA_CONFIG_FILE", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the caching proxy.
    Serve(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the proxy listen address.
    #[arg(long = "listen", value_name = "ADDR")]
    pub listen: Option<String>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Engine environment as a raw JSON object (the bootstrap `env` blob).
    #[arg(long = "env", value_name = "JSON")]
    pub env_json: Option<String>,

    /// Override the response store name.
    #[arg(long = "cache-name", value_name = "NAME")]
    pub cache_name: Option<String>,

    /// Override the policy stream URL.
    #[arg(long = "websocket-server-url", value_name = "URL")]
    pub websocket_server_url: Option<String>,

    /// Override the policy HTTP fallback URL.
    #[arg(long = "fallback-polling-server-url", value_name = "URL")]
    pub fallback_polling_server_url: Option<String>,

    /// Override the fallback poll cadence.
    #[arg(long = "fallback-polling-interval-ms", value_name = "MS")]
    pub fallback_polling_interval_ms: Option<u64>,

    /// Origins to always bypass (comma separated).
    #[arg(long = "ignore-origins", value_name = "ORIGINS", value_delimiter = ',')]
    pub ignore_origins: Option<Vec<String>>,

    /// Override the directory holding the policy database.
    #[arg(long = "data-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub data_dir: Option<PathBuf>,
}

/// The engine environment delivered by the bootstrap script.
///
/// On the worker platform this arrives as the JSON value of the `env` query
/// parameter of the bootstrap URL; the binary also accepts it through the
/// layered settings. Both required fields missing puts the engine in no-op
/// bypass mode rather than failing startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineEnv {
    pub cache_name: Option<String>,
    pub websocket_server_url: Option<String>,
    pub fallback_polling_server_url: Option<String>,
    pub fallback_polling_interval_ms: Option<u64>,
    pub ignore_origins: Vec<String>,
}

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("bootstrap query has no `{ENV_QUERY_PARAM}` parameter")]
    MissingParam,
    #[error("`{ENV_QUERY_PARAM}` parameter is not a valid JSON object: {0}")]
    Invalid(String),
    #[error("failed to parse bootstrap URL: {0}")]
    Url(#[from] url::ParseError),
}

impl EngineEnv {
    /// Whether both required fields are present.
    pub fn is_operational(&self) -> bool {
        self.cache_name.is_some() && self.websocket_server_url.is_some()
    }

    /// Parse the environment out of a bootstrap query string
    /// (`env=%7B...%7D`, with or without the leading `?`).
    pub fn from_query(query: &str) -> Result<Self, EnvError> {
        let query = query.strip_prefix('?').unwrap_or(query);
        let blob = url::form_urlencoded::parse(query.as_bytes())
            .find(|(name, _)| name == ENV_QUERY_PARAM)
            .map(|(_, value)| value.into_owned())
            .ok_or(EnvError::MissingParam)?;

        serde_json::from_str(&blob).map_err(|err| EnvError::Invalid(err.to_string()))
    }

    /// Parse the environment out of a full bootstrap URL.
    pub fn from_bootstrap_url(raw: &str) -> Result<Self, EnvError> {
        let url = Url::parse(raw)?;
        Self::from_query(url.query().unwrap_or(""))
    }
}

/// Fully-resolved deployment settings after precedence resolution.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub engine: EngineSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub env: EngineEnv,
    pub data_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Parse CLI arguments and load settings with the configured precedence.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let cli = CliArgs::parse();
    let settings = load(&cli)?;
    Ok((cli, settings))
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("RAFFICA").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    engine: RawEngineSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    listen: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEngineSettings {
    /// Raw environment blob; explicit fields below override its contents.
    env: Option<String>,
    cache_name: Option<String>,
    websocket_server_url: Option<String>,
    fallback_polling_server_url: Option<String>,
    fallback_polling_interval_ms: Option<u64>,
    ignore_origins: Option<Vec<String>>,
    data_dir: Option<PathBuf>,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(listen) = overrides.listen.as_ref() {
            self.server.listen = Some(listen.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(env_json) = overrides.env_json.as_ref() {
            self.engine.env = Some(env_json.clone());
        }
        if let Some(cache_name) = overrides.cache_name.as_ref() {
            self.engine.cache_name = Some(cache_name.clone());
        }
        if let Some(url) = overrides.websocket_server_url.as_ref() {
            self.engine.websocket_server_url = Some(url.clone());
        }
        if let Some(url) = overrides.fallback_polling_server_url.as_ref() {
            self.engine.fallback_polling_server_url = Some(url.clone());
        }
        if let Some(interval) = overrides.fallback_polling_interval_ms {
            self.engine.fallback_polling_interval_ms = Some(interval);
        }
        if let Some(origins) = overrides.ignore_origins.as_ref() {
            self.engine.ignore_origins = Some(origins.clone());
        }
        if let Some(dir) = overrides.data_dir.as_ref() {
            self.engine.data_dir = Some(dir.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        Ok(Self {
            server: build_server_settings(raw.server)?,
            logging: build_logging_settings(raw.logging)?,
            engine: build_engine_settings(raw.engine)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let listen = server.listen.as_deref().unwrap_or(DEFAULT_LISTEN);
    let listen = listen
        .parse::<SocketAddr>()
        .map_err(|err| LoadError::invalid("server.listen", format!("failed to parse: {err}")))?;
    Ok(ServerSettings { listen })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_engine_settings(engine: RawEngineSettings) -> Result<EngineSettings, LoadError> {
    let mut env = match engine.env.as_deref() {
        Some(blob) => serde_json::from_str::<EngineEnv>(blob)
            .map_err(|err| LoadError::invalid("engine.env", format!("failed to parse: {err}")))?,
        None => EngineEnv::default(),
    };

    if engine.cache_name.is_some() {
        env.cache_name = engine.cache_name;
    }
    if engine.websocket_server_url.is_some() {
        env.websocket_server_url = engine.websocket_server_url;
    }
    if engine.fallback_polling_server_url.is_some() {
        env.fallback_polling_server_url = engine.fallback_polling_server_url;
    }
    if engine.fallback_polling_interval_ms.is_some() {
        env.fallback_polling_interval_ms = engine.fallback_polling_interval_ms;
    }
    if let Some(origins) = engine.ignore_origins {
        env.ignore_origins = origins;
    }

    Ok(EngineSettings {
        env,
        data_dir: engine.data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parses_from_query_parameter() {
        let blob = r#"{"cacheName":"api-cache","websocketServerUrl":"wss://sync.example/ws","ignoreOrigins":["https://dev.example"]}"#;
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair(ENV_QUERY_PARAM, blob)
            .finish();

        let env = EngineEnv::from_query(&query).expect("env parses");
        assert_eq!(env.cache_name.as_deref(), Some("api-cache"));
        assert_eq!(
            env.websocket_server_url.as_deref(),
            Some("wss://sync.example/ws")
        );
        assert_eq!(env.ignore_origins, vec!["https://dev.example".to_string()]);
        assert!(env.is_operational());
    }

    #[test]
    fn env_parses_from_bootstrap_url() {
        let blob = r#"{"cacheName":"api-cache","websocketServerUrl":"wss://sync.example/ws"}"#;
        let url = format!(
            "https://app.example/worker.js?{}",
            url::form_urlencoded::Serializer::new(String::new())
                .append_pair(ENV_QUERY_PARAM, blob)
                .finish()
        );

        let env = EngineEnv::from_bootstrap_url(&url).expect("env parses");
        assert!(env.is_operational());
    }

    #[test]
    fn missing_env_parameter_is_reported() {
        assert!(matches!(
            EngineEnv::from_query("other=1"),
            Err(EnvError::MissingParam)
        ));
    }

    #[test]
    fn malformed_env_blob_is_reported() {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair(ENV_QUERY_PARAM, "{not json")
            .finish();
        assert!(matches!(
            EngineEnv::from_query(&query),
            Err(EnvError::Invalid(_))
        ));
    }

    #[test]
    fn partial_env_is_not_operational() {
        let env = EngineEnv {
            cache_name: Some("api-cache".to_string()),
            ..Default::default()
        };
        assert!(!env.is_operational());
    }

    #[test]
    fn default_settings_resolve() {
        let settings = Settings::from_raw(RawSettings::default()).expect("defaults resolve");
        assert_eq!(settings.server.listen.port(), 8787);
        assert!(matches!(settings.logging.format, LogFormat::Compact));
        assert!(!settings.engine.env.is_operational());
    }

    #[test]
    fn explicit_fields_override_the_env_blob() {
        let raw = RawSettings {
            engine: RawEngineSettings {
                env: Some(
                    r#"{"cacheName":"from-blob","websocketServerUrl":"wss://blob.example"}"#
                        .to_string(),
                ),
                cache_name: Some("from-field".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let settings = Settings::from_raw(raw).expect("settings resolve");
        assert_eq!(settings.engine.env.cache_name.as_deref(), Some("from-field"));
        assert_eq!(
            settings.engine.env.websocket_server_url.as_deref(),
            Some("wss://blob.example")
        );
    }

    #[test]
    fn invalid_listen_address_is_rejected() {
        let raw = RawSettings {
            server: RawServerSettings {
                listen: Some("not-an-addr".to_string()),
            },
            ..Default::default()
        };
        assert!(matches!(
            Settings::from_raw(raw),
            Err(LoadError::Invalid { key: "server.listen", .. })
        ));
    }
}
