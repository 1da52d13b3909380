//! Worker configuration from environment variables

use std::time::Duration;

use anyhow::{Context, Result};

/// Host configuration
///
/// Orchestration is a feature flag: with `DESKFLOW_ORCHESTRATION=false` the
/// host starts no scheduler and the platform degrades to synchronous CRUD.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// PostgreSQL connection string (required)
    pub database_url: String,

    /// Whether the orchestration engine runs at all
    pub orchestration_enabled: bool,

    /// Worker pool size
    pub worker_count: usize,

    /// Dispatcher delivery timeout
    pub dispatch_timeout: Duration,

    /// Heartbeat TTL for stale-claim recovery (also the retry backoff base)
    pub heartbeat_ttl: Duration,

    /// LLM endpoint (chat-completions style)
    pub llm_api_url: String,
    pub llm_api_key: String,
    pub llm_model: String,

    /// RAG query endpoint; absent degrades retrieve_context to a no-op
    pub rag_api_url: Option<String>,

    /// Mail relay endpoint
    pub mail_api_url: String,
    pub mail_api_key: String,

    /// Ticket source endpoint
    pub ticket_api_url: String,
}

impl WorkerConfig {
    /// Load configuration from the environment
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL environment variable required")?;

        Ok(Self {
            database_url,
            orchestration_enabled: env_bool("DESKFLOW_ORCHESTRATION", true),
            worker_count: env_parse("DESKFLOW_WORKERS", 4)?,
            dispatch_timeout: Duration::from_millis(env_parse(
                "DESKFLOW_DISPATCH_TIMEOUT_MS",
                100,
            )?),
            heartbeat_ttl: Duration::from_secs(env_parse("DESKFLOW_HEARTBEAT_TTL_SECS", 90)?),
            llm_api_url: env_or("LLM_API_URL", "https://api.openai.com/v1/chat/completions"),
            llm_api_key: env_or("LLM_API_KEY", ""),
            llm_model: env_or("LLM_MODEL", "gpt-4o-mini"),
            rag_api_url: std::env::var("RAG_API_URL").ok().filter(|s| !s.is_empty()),
            mail_api_url: env_or("MAIL_API_URL", "http://localhost:8025/api/send"),
            mail_api_key: env_or("MAIL_API_KEY", ""),
            ticket_api_url: env_or("TICKET_API_URL", "http://localhost:8080/api/tickets"),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_bool_values() {
        std::env::set_var("DESKFLOW_TEST_BOOL", "true");
        assert!(env_bool("DESKFLOW_TEST_BOOL", false));

        std::env::set_var("DESKFLOW_TEST_BOOL", "0");
        assert!(!env_bool("DESKFLOW_TEST_BOOL", true));

        std::env::remove_var("DESKFLOW_TEST_BOOL");
        assert!(env_bool("DESKFLOW_TEST_BOOL", true));
        assert!(!env_bool("DESKFLOW_TEST_BOOL", false));
    }

    #[test]
    fn test_env_parse_default_and_override() {
        std::env::remove_var("DESKFLOW_TEST_NUM");
        assert_eq!(env_parse("DESKFLOW_TEST_NUM", 4usize).unwrap(), 4);

        std::env::set_var("DESKFLOW_TEST_NUM", "12");
        assert_eq!(env_parse("DESKFLOW_TEST_NUM", 4usize).unwrap(), 12);

        std::env::set_var("DESKFLOW_TEST_NUM", "not-a-number");
        assert!(env_parse("DESKFLOW_TEST_NUM", 4usize).is_err());
        std::env::remove_var("DESKFLOW_TEST_NUM");
    }
}
