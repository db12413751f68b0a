// Replication-system configuration: the worker fleet, database families,
// and fan-out tuning. Workers are enumerated from configuration; there is
// no membership protocol.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    pub svc_host: String,
    pub svc_port: u16,
    pub enabled: bool,
    #[serde(default)]
    pub read_only: bool,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>, svc_host: impl Into<String>, svc_port: u16) -> Self {
        Self {
            name: name.into(),
            svc_host: svc_host.into(),
            svc_port,
            enabled: true,
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    pub is_partitioned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub family: String,
    pub tables: Vec<TableConfig>,
}

impl DatabaseConfig {
    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.iter().find(|t| t.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyConfig {
    pub name: String,
    pub replication_level: usize,
}

/// Read-mostly configuration of the replication control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub workers: Vec<WorkerConfig>,
    pub databases: Vec<DatabaseConfig>,
    pub families: Vec<FamilyConfig>,
    /// Ceiling on tables per worker request in SQL fan-out jobs
    pub max_tables_per_request: usize,
    /// Per-job wall-clock budget, seconds; zero disables the deadline
    pub job_deadline_sec: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            databases: Vec::new(),
            families: Vec::new(),
            max_tables_per_request: 10,
            job_deadline_sec: 0,
        }
    }
}

impl ReplicaConfig {
    /// Load from a `file:<path>` locator.
    pub fn load(locator: &str) -> Result<Self> {
        let path = locator.strip_prefix("file:").ok_or_else(|| {
            ShardError::Configuration(format!("unsupported config locator: {}", locator))
        })?;
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| ShardError::Configuration(format!("bad config {}: {}", path, e)))
    }

    pub fn worker(&self, name: &str) -> Option<&WorkerConfig> {
        self.workers.iter().find(|w| w.name == name)
    }

    pub fn database(&self, name: &str) -> Option<&DatabaseConfig> {
        self.databases.iter().find(|d| d.name == name)
    }

    pub fn family(&self, name: &str) -> Option<&FamilyConfig> {
        self.families.iter().find(|f| f.name == name)
    }

    pub fn family_databases(&self, family: &str) -> Vec<&DatabaseConfig> {
        self.databases.iter().filter(|d| d.family == family).collect()
    }

    /// Workers eligible for fan-out. With `all_workers` every configured
    /// worker participates; otherwise only enabled, writable ones.
    pub fn eligible_workers(&self, all_workers: bool) -> Vec<&WorkerConfig> {
        self.workers
            .iter()
            .filter(|w| all_workers || (w.enabled && !w.read_only))
            .collect()
    }
}
