// Skyshard - Distributed SQL query execution over partitioned sky catalogs
// Core library module

pub mod cli;
pub mod dispatch;
pub mod error;
pub mod merge;
pub mod proto;
pub mod query;
pub mod replica;
pub mod util;

pub use error::{Result, ShardError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Czar-side configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Config {
    /// Database holding per-query result tables
    pub result_db: String,
    /// SQL type of the provenance jobId column in result tables
    pub job_id_sql_type: String,
    /// Number of dispatch worker threads
    pub dispatch_threads: usize,
    /// Ceiling on per-task attempts before the user query is squashed
    pub max_job_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            result_db: "qresult".to_string(),
            job_id_sql_type: "INT(9)".to_string(),
            dispatch_threads: 4,
            max_job_attempts: 5,
        }
    }
}

impl Config {
    /// Load a configuration from a `file:<path>` locator, the form every
    /// tool accepts through `--config`.
    pub fn load(locator: &str) -> Result<Self> {
        let path = locator.strip_prefix("file:").ok_or_else(|| {
            ShardError::Configuration(format!("unsupported config locator: {}", locator))
        })?;
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| ShardError::Configuration(format!("bad config {}: {}", path, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config { dispatch_threads: 8, ..Config::default() };
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();
        let loaded = Config::load(&format!("file:{}", path.display())).unwrap();
        assert_eq!(loaded.dispatch_threads, 8);
        assert_eq!(loaded.result_db, "qresult");
    }

    #[test]
    fn test_config_bad_locator() {
        assert!(Config::load("http://example").is_err());
    }
}
