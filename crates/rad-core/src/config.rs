use std::time::Duration;

use clap::Parser;

use rad_common::GatewayError;

/// Process configuration, merged CLI-over-environment. Secrets only ever
/// arrive through the environment; nothing is read from files in the tree.
#[derive(Debug, Clone, Parser)]
#[command(name = "rad-gateway", about = "Multi-tenant AI-provider gateway")]
pub struct GatewayConfig {
    #[arg(long, env = "RAD_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Production mode refuses to start without the internal bearer secret.
    #[arg(long, env = "RAD_PRODUCTION", default_value_t = false)]
    pub production: bool,

    /// Bearer secret for the admin event stream.
    #[arg(long, env = "RAD_ADMIN_TOKEN", hide_env_values = true)]
    pub admin_token: Option<String>,

    /// Distributed cache / rate-limit store. Absent → in-process fallbacks.
    #[arg(long, env = "RAD_REDIS_URL", hide_env_values = true)]
    pub redis_url: Option<String>,

    #[arg(long, env = "RAD_CACHE_PREFIX", default_value = "rad:")]
    pub cache_prefix: String,

    /// Streaming pipe capacity per request.
    #[arg(long, env = "RAD_STREAM_BUFFER", default_value_t = 100)]
    pub stream_buffer: usize,

    /// Concurrent active streams across the process; 0 = unlimited.
    #[arg(long, env = "RAD_MAX_STREAMS", default_value_t = 0)]
    pub max_streams: usize,

    #[arg(long, env = "RAD_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Whole-exchange deadline for non-streaming upstream calls. Streams
    /// are bounded by an idle guard between chunks, not a total deadline.
    #[arg(long, env = "RAD_UPSTREAM_TIMEOUT_SECS", default_value_t = 60)]
    pub upstream_timeout_secs: u64,

    /// Default per-principal admission rate when the key carries no policy.
    #[arg(long, env = "RAD_RATE_LIMIT_MAX", default_value_t = 60)]
    pub rate_limit_max: u64,

    #[arg(long, env = "RAD_RATE_LIMIT_WINDOW_SECS", default_value_t = 60)]
    pub rate_limit_window_secs: u64,

    /// Admin event hub subscriber cap.
    #[arg(long, env = "RAD_ADMIN_SUBSCRIBERS", default_value_t = 100)]
    pub admin_subscribers: usize,

    /// Fallback provider for models no routing rule matches.
    #[arg(long, env = "RAD_DEFAULT_PROVIDER")]
    pub default_provider: Option<String>,

    /// Seeds one caller key into the in-memory key store for local runs;
    /// real deployments plug a repository in instead.
    #[arg(long, env = "RAD_DEV_API_KEY", hide_env_values = true)]
    pub dev_api_key: Option<String>,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: Option<String>,

    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub gemini_api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL")]
    pub openai_base_url: Option<String>,

    #[arg(long, env = "ANTHROPIC_BASE_URL")]
    pub anthropic_base_url: Option<String>,

    #[arg(long, env = "GEMINI_BASE_URL")]
    pub gemini_base_url: Option<String>,
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.production && self.admin_token.as_deref().is_none_or(str::is_empty) {
            return Err(GatewayError::Internal(
                "RAD_ADMIN_TOKEN is required in production mode".to_string(),
            ));
        }
        if self.stream_buffer == 0 {
            return Err(GatewayError::Internal(
                "RAD_STREAM_BUFFER must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec!["rad-gateway"]
    }

    #[test]
    fn defaults_parse() {
        let config = GatewayConfig::try_parse_from(base_args()).unwrap();
        assert_eq!(config.stream_buffer, 100);
        assert_eq!(config.rate_limit_max, 60);
        assert!(!config.production);
        config.validate().unwrap();
    }

    #[test]
    fn production_requires_admin_token() {
        let config =
            GatewayConfig::try_parse_from(["rad-gateway", "--production"]).unwrap();
        assert!(config.validate().is_err());

        let config = GatewayConfig::try_parse_from([
            "rad-gateway",
            "--production",
            "--admin-token",
            "secret",
        ])
        .unwrap();
        config.validate().unwrap();
    }
}
