//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The file path defaults to `config.yaml` and can be set via the
//! `-f` flag or `FEDSQL_CONFIG`.
//!
//! ## Loading priority
//!
//! 1. **YAML config file** - base configuration
//! 2. **Environment variables** - `FEDSQL_`-prefixed variables override YAML
//!    values; nested fields use double underscores
//!    (`FEDSQL_AUTH__AUDIENCE=prod`)
//! 3. **Deployment contract variables** - `TENANT_CONFIG_DIR`, `REDIS_URL`,
//!    `JWKS_URL`, `JWT_AUDIENCE` and `OPA_URL` override their respective
//!    fields when set, so the gateway drops into existing deployments
//!    without a config file.

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Simple CLI args - just for specifying the config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "FEDSQL_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Directory scanned for one tenant configuration document per tenant
    pub tenant_config_dir: PathBuf,
    /// Redis connection string. When unset (or unreachable at startup) the
    /// gateway runs with cache and rate limiting disabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    /// Bearer token validation settings
    pub auth: AuthConfig,
    /// Upstream HTTP transport settings
    pub http: HttpConfig,
    /// OPA endpoint, reserved for the external policy path. Unused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opa_url: Option<String>,
    /// Enable the Prometheus scrape endpoint at `/metrics`
    pub enable_metrics: bool,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// JWKS endpoint of the identity provider. Empty selects dev mode with
    /// the static token map.
    pub jwks_url: String,
    /// Expected `aud` claim
    pub audience: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwks_url: String::new(),
            audience: "fedsql-dev".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    /// Per-request timeout for upstream connector calls (seconds)
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8002,
            tenant_config_dir: PathBuf::from("configs/tenants"),
            redis_url: Some("redis://localhost:6379/0".to_string()),
            auth: AuthConfig::default(),
            http: HttpConfig::default(),
            opa_url: None,
            enable_metrics: true,
            enable_otel_export: false,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    pub fn load(args: &Args) -> anyhow::Result<Config> {
        let figment = Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("FEDSQL_").split("__"));

        let mut config: Config = figment.extract()?;

        // Deployment contract variables shared with other runtimes take
        // precedence over both file and prefixed environment.
        if let Ok(dir) = std::env::var("TENANT_CONFIG_DIR") {
            config.tenant_config_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = Some(url);
        }
        if let Ok(url) = std::env::var("JWKS_URL") {
            config.auth.jwks_url = url;
        }
        if let Ok(audience) = std::env::var("JWT_AUDIENCE") {
            config.auth.audience = audience;
        }
        if let Ok(url) = std::env::var("OPA_URL") {
            config.opa_url = Some(url);
        }

        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
