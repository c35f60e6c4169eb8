// Worker configuration from the environment
//
// - DATABASE_URL: Postgres store (in-memory without it; dev only)
// - WORKER_QUEUES: comma-separated queue names (default: all three)
// - WORKER_ID_PREFIX: stable prefix for worker ids
// - BLOB_ROOT: filesystem blob store root (in-memory store without it)
// - LLM_API_URL / LLM_API_KEY / LLM_MODEL: OpenAI-compatible provider
//   (scripted fake without a URL; dev only)
// - HEALTH_ADDR: liveness/readiness listener (default 0.0.0.0:8081)

use tessera_durable::TaskQueue;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: Option<String>,
    pub queues: Vec<TaskQueue>,
    pub worker_id_prefix: String,
    pub blob_root: Option<String>,
    pub llm_api_url: Option<String>,
    pub llm_api_key: String,
    pub llm_model: String,
    pub health_addr: String,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let queues = std::env::var("WORKER_QUEUES")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .filter_map(|name| name.trim().parse().ok())
                    .collect::<Vec<TaskQueue>>()
            })
            .filter(|queues| !queues.is_empty())
            .unwrap_or_else(|| TaskQueue::ALL.to_vec());

        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            queues,
            worker_id_prefix: std::env::var("WORKER_ID_PREFIX")
                .unwrap_or_else(|_| "tessera".to_string()),
            blob_root: std::env::var("BLOB_ROOT").ok(),
            llm_api_url: std::env::var("LLM_API_URL").ok(),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or_default(),
            llm_model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            health_addr: std::env::var("HEALTH_ADDR").unwrap_or_else(|_| "0.0.0.0:8081".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_all_queues() {
        // Only valid when the env var is unset, which is the test default.
        if std::env::var("WORKER_QUEUES").is_err() {
            let config = WorkerConfig::from_env();
            assert_eq!(config.queues.len(), 3);
        }
    }
}
