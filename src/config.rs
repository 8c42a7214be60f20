//! Configuration management for the echo proxy.
//!
//! Settings come from an optional `config.yaml` and the process environment,
//! with the environment taking precedence. Keys are matched case-insensitively,
//! so `BACKEND_URL` populates [`Settings::backend_url`]. Nested keys use `__`,
//! e.g. `TELEMETRY__FORMAT=json`.

use serde::Deserialize;

/// Application configuration settings.
#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    /// The single endpoint every `/chat` request is forwarded to. Also the
    /// audience of the identity token. A missing value is reported per request.
    #[serde(default)]
    pub backend_url: Option<String>,
    /// The only origin browsers are allowed to read responses from.
    #[serde(default = "default_frontend_origin")]
    pub frontend_origin: String,
    /// Address the server binds to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port number the server will listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to a service account key file. When set, identity tokens are minted
    /// from it instead of the metadata server.
    #[serde(default)]
    pub google_application_credentials: Option<String>,
    /// Host of the instance metadata server.
    #[serde(default = "default_metadata_host")]
    pub gce_metadata_host: String,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LoggingFormat {
    Json,
    Pretty,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Logging and trace export settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Level for this crate's own events.
    pub level: LogLevel,
    /// Level for axum's internal events.
    pub axum_level: LogLevel,
    pub format: LoggingFormat,
    /// Export spans over OTLP. The exporter reads the standard
    /// `OTEL_EXPORTER_OTLP_*` variables for its endpoint.
    pub otlp_enabled: bool,
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            axum_level: LogLevel::Info,
            format: LoggingFormat::Pretty,
            otlp_enabled: false,
            service_name: "echo-proxy".to_string(),
        }
    }
}

#[cfg(test)]
impl Settings {
    /// Defaults for tests, with everything pointing nowhere unless overridden.
    pub fn for_test(backend_url: Option<&str>) -> Self {
        Self {
            backend_url: backend_url.map(str::to_string),
            frontend_origin: default_frontend_origin(),
            host: "127.0.0.1".to_string(),
            port: 0,
            google_application_credentials: None,
            gce_metadata_host: "127.0.0.1:1".to_string(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

fn default_frontend_origin() -> String {
    "https://oravec.io".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_metadata_host() -> String {
    "metadata.google.internal".to_string()
}

/// Loads configuration from `config.yaml` (if present) and the environment.
#[tracing::instrument]
pub fn load_config() -> anyhow::Result<Settings> {
    load_config_from(config::Environment::default())
}

/// Loads configuration with the given environment source layered over the
/// optional `config.yaml`.
pub fn load_config_from(env: config::Environment) -> anyhow::Result<Settings> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(env.separator("__"))
        .build()
        .map_err(|e| {
            tracing::error!("Failed to build configuration: {}", e);
            e
        })?;

    let settings = cfg.try_deserialize::<Settings>().map_err(|e| {
        tracing::error!("Failed to deserialize configuration: {}", e);
        e
    })?;

    Ok(settings)
}
