use crate::llm::{LlmSettings, Provider};
use clap::Parser;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `WIZARD_SERVER__PORT=8000`.
pub const ENV_PREFIX: &str = "WIZARD";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Require JWT authentication
    #[arg(long, env = "JWT_REQUIRED")]
    pub jwt_required: Option<bool>,

    /// Enable per-connection rate limiting
    #[arg(long, env = "RATE_LIMIT_ENABLED")]
    pub rate_limit_enabled: Option<bool>,

    /// Persistence provider: memory, postgres or surrealdb
    #[arg(long, env = "PERSISTENCE_PROVIDER")]
    pub persistence_provider: Option<String>,

    /// Database connection string
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Directory holding template YAML files
    #[arg(long, env = "TEMPLATES_DIR")]
    pub templates_dir: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub resilience: ResilienceConfig,
    pub persistence: PersistenceConfig,
    pub matching: MatchingConfig,
    pub embedding: EmbeddingConfig,
    pub sessions: SessionsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    pub jwt_required: bool,
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResilienceConfig {
    /// Upper bound for any single identity, store, embedding or completion call.
    pub service_timeout_secs: u64,
    pub rate_limit_enabled: bool,
    pub messages_per_second: f32,
    pub burst_size: f32,
}

impl ResilienceConfig {
    #[must_use]
    pub fn service_timeout(&self) -> Duration {
        Duration::from_secs(self.service_timeout_secs.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceConfig {
    pub provider: String,
    pub database_url: String,
    pub vector_dimension: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MatchingConfig {
    /// Minimum cosine similarity for a template to match.
    pub similarity_threshold: f32,
    pub templates_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `fastembed` (local) or `openai` (remote, uses the LLM endpoint).
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionsConfig {
    pub stale_after_hours: u64,
    pub cleanup_interval_secs: u64,
    pub history_token_budget: usize,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    /// Layering: defaults < config file < `WIZARD_*` env < CLI flags (and their env aliases).
    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder()
            .set_default("server.port", 3000)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("security.jwt_required", true)?
            .set_default("security.jwt_secret", "")?
            .set_default("resilience.service_timeout_secs", 30)?
            .set_default("resilience.rate_limit_enabled", true)?
            .set_default("resilience.messages_per_second", 2.0)?
            .set_default("resilience.burst_size", 5.0)?
            .set_default("persistence.provider", "memory")?
            .set_default("persistence.database_url", "")?
            .set_default("persistence.vector_dimension", 384)?
            .set_default("matching.similarity_threshold", 0.75)?
            .set_default("matching.templates_dir", "templates")?
            .set_default("embedding.provider", "fastembed")?
            .set_default("embedding.model", "bge-small-en-v1.5")?
            .set_default("sessions.stale_after_hours", 72)?
            .set_default("sessions.cleanup_interval_secs", 3600)?
            .set_default("sessions.history_token_budget", 3000)?;

        // Explicit file wins; otherwise pick up ./config.yaml when present.
        match &cli.config {
            Some(path) => {
                builder = builder.add_source(File::new(path, FileFormat::Yaml).required(true));
            }
            None if Path::new("config.yaml").exists() => {
                builder =
                    builder.add_source(File::new("config.yaml", FileFormat::Yaml).required(false));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(required) = cli.jwt_required {
            builder = builder.set_override("security.jwt_required", required)?;
        }
        if let Some(rl) = cli.rate_limit_enabled {
            builder = builder.set_override("resilience.rate_limit_enabled", rl)?;
        }
        if let Some(provider) = cli.persistence_provider {
            builder = builder.set_override("persistence.provider", provider)?;
        }
        if let Some(url) = cli.database_url {
            builder = builder.set_override("persistence.database_url", url)?;
        }
        if let Some(dir) = cli.templates_dir {
            builder = builder.set_override("matching.templates_dir", dir)?;
        }

        builder.build()?.try_deserialize()
    }

    /// Reject combinations the server cannot start with.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.security.jwt_required && self.security.jwt_secret.trim().is_empty() {
            return Err(config::ConfigError::Message(
                "security.jwt_secret must be set when security.jwt_required is true".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.matching.similarity_threshold) {
            return Err(config::ConfigError::Message(
                "matching.similarity_threshold must be within 0.0..=1.0".to_string(),
            ));
        }
        match self.persistence.provider.as_str() {
            "memory" => {}
            "postgres" | "surrealdb" if !self.persistence.database_url.trim().is_empty() => {}
            "postgres" | "surrealdb" => {
                return Err(config::ConfigError::Message(format!(
                    "persistence.database_url is required for provider {}",
                    self.persistence.provider
                )));
            }
            other => {
                return Err(config::ConfigError::Message(format!(
                    "unknown persistence provider: {other}"
                )));
            }
        }
        Ok(())
    }
}

pub fn load_llm_settings() -> Result<LlmSettings, String> {
    let base_url = std::env::var("LLM_BASE_URL")
        .map_err(|_| "Missing required env var: LLM_BASE_URL".to_string())?;
    if base_url.trim().is_empty() {
        return Err("LLM_BASE_URL cannot be empty".to_string());
    }

    let model = std::env::var("LLM_MODEL")
        .map_err(|_| "Missing required env var: LLM_MODEL".to_string())?;
    if model.trim().is_empty() {
        return Err("LLM_MODEL cannot be empty".to_string());
    }

    let api_key = std::env::var("LLM_API_KEY")
        .ok()
        .filter(|s| !s.trim().is_empty());

    let mut provider = Provider::detect_from_url(&base_url);
    if let Provider::AzureOpenAI {
        deployment_name,
        api_version,
    } = &mut provider
    {
        if let Ok(deployment) = std::env::var("AZURE_DEPLOYMENT_NAME") {
            *deployment_name = deployment;
        }
        if let Ok(version) = std::env::var("AZURE_API_VERSION") {
            *api_version = version;
        }
    }

    Ok(LlmSettings {
        base_url,
        api_key,
        model,
        provider,
    })
}
