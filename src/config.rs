//! Process configuration.
//!
//! A [`Configuration`] is built exactly once at startup from a [`BaseConfig`]
//! (usually a service config file), a free-form `custom` value and a handful of
//! process environment variables. It is read-only afterwards and shared by
//! `Arc` with every component that needs it.

use crate::error::{Error, Result};
use crate::remotes::{EndpointResolver, Remotes};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Environment variable overriding the bind address.
pub const ENV_ADDR: &str = "ADDR";
/// Environment variable overriding the bind port.
pub const ENV_PORT: &str = "PORT";
/// Environment variable selecting the environment tier.
pub const ENV_TIER: &str = "NODE_ENV";
/// Environment variable selecting the tier instance id.
pub const ENV_TIER_ID: &str = "NODE_ENV_ID";

const ROOT_PLACEHOLDER: &str = "__root";

/// Deployment tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Test,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Test => "test",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }

    /// Development and test tiers get introspection, the playground and full error detail.
    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development | Environment::Test)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            "staging" | "stage" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(Error::InvalidConfig(format!(
                "unknown environment tier `{other}`"
            ))),
        }
    }
}

/// CORS section of the base config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorsConfig {
    pub enabled: bool,
    #[serde(default)]
    pub origin: Vec<String>,
    #[serde(default = "default_cors_methods")]
    pub methods: Vec<String>,
    #[serde(
        default,
        rename = "preflightContinue",
        alias = "preflightcontinue"
    )]
    pub preflight_continue: bool,
    #[serde(
        default = "default_options_success_status",
        rename = "optionsSuccessStatus",
        alias = "optionssuccessstatus"
    )]
    pub options_success_status: u16,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            origin: Vec::new(),
            methods: default_cors_methods(),
            preflight_continue: false,
            options_success_status: default_options_success_status(),
        }
    }
}

fn default_cors_methods() -> Vec<String> {
    vec!["GET".to_string(), "POST".to_string()]
}

fn default_options_success_status() -> u16 {
    204
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultsConfig {
    pub addr: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathConfig {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewsConfig {
    #[serde(default = "default_views_engine")]
    pub engine: String,
    #[serde(default = "default_views_src")]
    pub src: String,
}

impl Default for ViewsConfig {
    fn default() -> Self {
        Self {
            engine: default_views_engine(),
            src: default_views_src(),
        }
    }
}

fn default_views_engine() -> String {
    "html".to_string()
}

fn default_views_src() -> String {
    format!("{ROOT_PLACEHOLDER}/views")
}

fn default_version() -> String {
    "0.0.0".to_string()
}

/// The service config file shape.
///
/// `defaults`, `cors`, `rest`, `graphql` and `remotes` are required; a file
/// missing any of them fails to deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub defaults: DefaultsConfig,
    pub cors: CorsConfig,
    pub rest: PathConfig,
    pub graphql: PathConfig,
    #[serde(default)]
    pub views: ViewsConfig,
    pub remotes: Remotes,
}

impl BaseConfig {
    /// Deserialize from an in-memory JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| Error::InvalidConfig(format!("malformed base config: {e}")))
    }

    /// Load a JSON, TOML or YAML file, picking the format from the extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        ::config::Config::builder()
            .add_source(::config::File::from(path))
            .build()
            .and_then(|cfg| cfg.try_deserialize::<BaseConfig>())
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))
    }
}

/// Values read from the process environment.
///
/// Empty strings count as unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub addr: Option<String>,
    pub port: Option<String>,
    pub env: Option<String>,
    pub env_id: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let read = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        Self {
            addr: read(ENV_ADDR),
            port: read(ENV_PORT),
            env: read(ENV_TIER),
            env_id: read(ENV_TIER_ID),
        }
    }
}

/// Loaded, immutable process configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
    app_id: String,
    app_name: String,
    app_version: String,
    started_at: DateTime<Utc>,
    server_addr: String,
    server_port: u16,
    env: Environment,
    env_id: u32,
    cors: CorsConfig,
    rest_path: String,
    graphql_path: String,
    views_path: String,
    views_engine: String,
    remotes: Remotes,
    custom: serde_json::Value,
}

impl Configuration {
    /// Build the configuration, layering `ADDR`, `PORT`, `NODE_ENV` and
    /// `NODE_ENV_ID` from the process environment over `base`.
    pub fn load(base: BaseConfig, custom: serde_json::Value) -> Result<Self> {
        Self::load_with_env(base, custom, EnvOverrides::from_env())
    }

    /// Same as [`Configuration::load`] with explicit environment values.
    pub fn load_with_env(
        base: BaseConfig,
        custom: serde_json::Value,
        overrides: EnvOverrides,
    ) -> Result<Self> {
        let started_at = Utc::now();
        let session_hash = format!("{:x}", started_at.timestamp_millis());

        let server_port = match overrides.port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|e| Error::InvalidConfig(format!("invalid {ENV_PORT} `{port}`: {e}")))?,
            None => base.defaults.port,
        };

        let env = match overrides.env {
            Some(env) => env.parse()?,
            None => Environment::Development,
        };

        let env_id = match overrides.env_id {
            Some(id) => id.parse::<u32>().map_err(|e| {
                Error::InvalidConfig(format!("invalid {ENV_TIER_ID} `{id}`: {e}"))
            })?,
            None => 1,
        };

        Ok(Self {
            app_id: base.id.unwrap_or_else(|| session_hash.clone()),
            app_name: base.name.unwrap_or(session_hash),
            app_version: base.version,
            started_at,
            server_addr: overrides.addr.unwrap_or(base.defaults.addr),
            server_port,
            env,
            env_id,
            cors: base.cors,
            rest_path: base.rest.path,
            graphql_path: base.graphql.path,
            views_path: expand_root(&base.views.src),
            views_engine: base.views.engine,
            remotes: base.remotes,
            custom,
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn app_version(&self) -> &str {
        &self.app_version
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    /// `host:port` string used for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server_addr, self.server_port)
    }

    pub fn env(&self) -> Environment {
        self.env
    }

    pub fn env_id(&self) -> u32 {
        self.env_id
    }

    pub fn is_development(&self) -> bool {
        self.env.is_development()
    }

    /// `{appName}:{env}-{envId}`
    pub fn server_key(&self) -> String {
        format!("{}:{}-{}", self.app_name, self.env, self.env_id)
    }

    pub fn cors(&self) -> &CorsConfig {
        &self.cors
    }

    pub fn rest_path(&self) -> &str {
        &self.rest_path
    }

    pub fn graphql_path(&self) -> &str {
        &self.graphql_path
    }

    pub fn views_path(&self) -> &str {
        &self.views_path
    }

    pub fn views_engine(&self) -> &str {
        &self.views_engine
    }

    pub fn remotes(&self) -> &Remotes {
        &self.remotes
    }

    pub fn custom(&self) -> &serde_json::Value {
        &self.custom
    }

    /// Deserialize one key of the custom bucket.
    pub fn custom_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.custom.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn endpoint_resolver(&self) -> EndpointResolver<'_> {
        EndpointResolver::new(&self.remotes, self.env, self.env_id)
    }

    /// Resolve a remote service URL for the current environment tier.
    pub fn endpoint(&self, name: &str) -> Result<&str> {
        self.endpoint_resolver().resolve(name)
    }
}

fn expand_root(src: &str) -> String {
    if !src.contains(ROOT_PLACEHOLDER) {
        return src.to_string();
    }
    let root = std::env::current_dir()
        .map(|dir| dir.display().to_string())
        .unwrap_or_else(|_| ".".to_string());
    src.replace(ROOT_PLACEHOLDER, &root)
}
