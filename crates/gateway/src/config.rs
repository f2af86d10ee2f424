use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub health: HealthConfig,
    pub breaker: BreakerConfig,
    pub limits: LimitsConfig,
    pub auth: AuthConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub enable_cors: bool,
    pub cors_origins: Vec<String>,
    /// Deadline for buffered (non-streaming) proxied requests.
    pub request_timeout_unary_secs: u64,
    /// Deadline for streamed proxied requests.
    pub request_timeout_stream_secs: u64,
    /// How long shutdown waits for in-flight requests.
    pub drain_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelsConfig {
    /// Filesystem path mounted read-only into each engine container.
    pub root: String,
    /// Writable cache for engine-side downloads (mounted into containers).
    pub download_cache: String,
    pub transformer_image: String,
    pub quantized_image: String,
    /// When true, refuse to start anything whose image or weights would
    /// require a remote fetch.
    pub offline: bool,
    /// Private bridge network the engine containers attach to.
    pub network_name: String,
    pub docker_socket: String,
    /// Host port range scanned for free ports at start.
    pub port_range_start: u16,
    pub port_range_end: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    pub ttl_secs: u64,
    pub probe_interval_secs: u64,
    /// Interval while any owning model is still loading.
    pub loading_probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub history_len: usize,
    /// Upper bound on concurrent probes.
    pub worker_pool_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerConfig {
    pub enabled: bool,
    pub open_threshold: u32,
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// 0 disables request rate limiting.
    pub rate_rps: u32,
    pub rate_burst: u32,
    /// Use the sliding-window counter instead of the token bucket.
    pub sliding_window: bool,
    pub sliding_window_secs: u64,
    /// 0 disables the streaming concurrency cap.
    pub streaming_cap: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Shared secret between the gateway and engine containers.
    pub upstream_internal_key: String,
    /// Bearer token guarding /admin. Empty leaves admin open (dev only).
    pub admin_token: String,
    /// If set, an all-scope API key seeded at startup when absent, so a
    /// fresh deployment has one working credential.
    pub bootstrap_key: String,
    /// Accept any client token. Must stay off outside development.
    pub dev_bypass: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub database_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Redis URL for process-shared rate counters; empty uses the
    /// in-process fallback.
    pub redis_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    File { path: String },
}

impl GatewayConfig {
    /// Load configuration from gateway.toml and environment variables.
    /// Priority: env (`CORTEX_` prefix, `__` separator) > file > defaults.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = config::Config::try_from(&GatewayConfig::default())
            .context("Failed to serialize default configuration")?;

        let mut builder = config::Config::builder().add_source(defaults);

        let config_paths = vec![
            "/etc/cortex/gateway",
            "config/gateway",
            "crates/gateway/config/gateway",
        ];

        for path in config_paths {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CORTEX")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Reject configurations the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.server
            .bind_address
            .parse::<std::net::SocketAddr>()
            .context("Invalid bind_address")?;

        if self.models.root.is_empty() {
            anyhow::bail!("models.root must not be empty");
        }
        if self.models.transformer_image.is_empty() || self.models.quantized_image.is_empty() {
            anyhow::bail!("both engine image references must be configured");
        }
        if self.models.port_range_start >= self.models.port_range_end {
            anyhow::bail!(
                "models.port_range_start ({}) must be below port_range_end ({})",
                self.models.port_range_start,
                self.models.port_range_end
            );
        }
        if self.health.probe_interval_secs == 0 || self.health.loading_probe_interval_secs == 0 {
            anyhow::bail!("health probe intervals must be > 0");
        }
        if self.health.history_len == 0 {
            anyhow::bail!("health.history_len must be > 0");
        }
        if self.health.worker_pool_size == 0 {
            anyhow::bail!("health.worker_pool_size must be > 0");
        }
        if self.breaker.enabled && self.breaker.open_threshold == 0 {
            anyhow::bail!("breaker.open_threshold must be > 0 when the breaker is enabled");
        }
        if self.limits.rate_rps > 0 && self.limits.rate_burst == 0 {
            anyhow::bail!("limits.rate_burst must be > 0 when rate limiting is enabled");
        }

        // Production self-check: the development bypass must never reach a
        // production deployment.
        let env = std::env::var("CORTEX_ENV").unwrap_or_default();
        if env == "production" && self.auth.dev_bypass {
            anyhow::bail!("auth.dev_bypass is not permitted when CORTEX_ENV=production");
        }

        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_address: "0.0.0.0:8084".to_string(),
                enable_cors: false,
                cors_origins: vec!["http://localhost:3000".to_string()],
                request_timeout_unary_secs: 120,
                request_timeout_stream_secs: 600,
                drain_timeout_secs: 30,
            },
            models: ModelsConfig {
                root: "/var/lib/cortex/models".to_string(),
                download_cache: "/var/lib/cortex/hub-cache".to_string(),
                transformer_image: "vllm/vllm-openai:latest".to_string(),
                quantized_image: "ghcr.io/ggml-org/llama.cpp:server".to_string(),
                offline: false,
                network_name: "cortex-models".to_string(),
                docker_socket: "".to_string(),
                port_range_start: 30000,
                port_range_end: 30999,
            },
            health: HealthConfig {
                ttl_secs: 15,
                probe_interval_secs: 15,
                loading_probe_interval_secs: 3,
                probe_timeout_secs: 3,
                history_len: 60,
                worker_pool_size: 8,
            },
            breaker: BreakerConfig {
                enabled: false,
                open_threshold: 5,
                cooldown_secs: 30,
            },
            limits: LimitsConfig {
                rate_rps: 0,
                rate_burst: 0,
                sliding_window: false,
                sliding_window_secs: 10,
                streaming_cap: 0,
            },
            auth: AuthConfig {
                upstream_internal_key: "cortex-internal".to_string(),
                admin_token: "".to_string(),
                bootstrap_key: "".to_string(),
                dev_bypass: false,
            },
            store: StoreConfig {
                database_path: "data/cortex.db".to_string(),
            },
            cache: CacheConfig {
                redis_url: "".to_string(),
            },
            logging: LoggingConfig {
                level: "info,gateway=debug".to_string(),
                format: LogFormat::Pretty,
                output: LogOutput::Stdout,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        GatewayConfig::default().validate().unwrap();
    }

    #[test]
    fn test_bad_bind_address_rejected() {
        let mut config = GatewayConfig::default();
        config.server.bind_address = "nonsense".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let mut config = GatewayConfig::default();
        config.models.port_range_start = 31000;
        config.models.port_range_end = 30000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rate_limit_without_burst_rejected() {
        let mut config = GatewayConfig::default();
        config.limits.rate_rps = 10;
        config.limits.rate_burst = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enabled_breaker_needs_threshold() {
        let mut config = GatewayConfig::default();
        config.breaker.enabled = true;
        config.breaker.open_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dev_bypass_refused_in_production() {
        let mut config = GatewayConfig::default();
        config.auth.dev_bypass = true;

        std::env::set_var("CORTEX_ENV", "production");
        let result = config.validate();
        std::env::remove_var("CORTEX_ENV");

        assert!(result.is_err());
        // Outside production the flag is permitted.
        config.validate().unwrap();
    }
}
