use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use tessel_common::{MemoryCatalog, RelationKey, Schema, Type, WorkerId};
use tessel_engine::FlowControl;

/// A worker the coordinator knows about at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerEntry {
    pub id: WorkerId,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: Type,
}

/// A stored relation and the workers holding its partitions.
#[derive(Debug, Clone, Deserialize)]
pub struct RelationEntry {
    pub key: RelationKey,
    pub columns: Vec<ColumnEntry>,
    pub workers: Vec<WorkerId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub workers: Vec<WorkerEntry>,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: i64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub flow: FlowControl,
    #[serde(default = "default_allow_broadcast_fallback")]
    pub allow_broadcast_fallback: bool,
    #[serde(default)]
    pub relations: Vec<RelationEntry>,
}

fn default_prune_interval_secs() -> u64 {
    10
}

fn default_worker_timeout_secs() -> i64 {
    30
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_allow_broadcast_fallback() -> bool {
    true
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let config_file_path = std::env::var("TESSEL_COORDINATOR_CONFIG")
            .unwrap_or_else(|_| "config/coordinator.toml".to_string());
        Self::from_path(&config_file_path)
    }

    pub fn from_path(path: &str) -> Result<Self, config::ConfigError> {
        let s = config::Config::builder()
            .add_source(config::File::with_name(path).required(true))
            .add_source(config::Environment::with_prefix("TESSEL_COORDINATOR").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    /// Settings for an in-process cluster, used when no file is involved.
    pub fn local(workers: Vec<WorkerEntry>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            workers,
            prune_interval_secs: default_prune_interval_secs(),
            worker_timeout_secs: default_worker_timeout_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            flow: FlowControl::default(),
            allow_broadcast_fallback: default_allow_broadcast_fallback(),
            relations: Vec::new(),
        }
    }

    pub fn server_address(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// A catalog holding the configured relations.
    pub fn catalog(&self) -> MemoryCatalog {
        let catalog = MemoryCatalog::new();
        for relation in &self.relations {
            let schema = Schema::new(
                relation
                    .columns
                    .iter()
                    .map(|c| (c.name.clone(), c.column_type))
                    .collect(),
            );
            catalog.register_relation(relation.key.clone(), schema, relation.workers.iter().copied());
        }
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tessel_common::Catalog;

    #[test]
    fn reads_worker_table_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
host = "0.0.0.0"
port = 8001
worker_timeout_secs = 5

[[workers]]
id = 1
address = "10.0.0.1:9001"

[[workers]]
id = 2
address = "10.0.0.2:9001"

[[relations]]
key = {{ user = "public", program = "adhoc", relation = "edges" }}
columns = [{{ name = "src", type = "INT" }}, {{ name = "dst", type = "INT" }}]
workers = [1, 2]
"#
        )
        .unwrap();
        let settings = Settings::from_path(file.path().to_str().unwrap()).unwrap();
        assert_eq!(settings.workers.len(), 2);
        assert_eq!(settings.workers[1].id, 2);
        assert_eq!(settings.worker_timeout_secs, 5);
        assert_eq!(settings.prune_interval_secs, 10);
        assert!(settings.allow_broadcast_fallback);
        assert_eq!(settings.server_address().unwrap().port(), 8001);

        let catalog = settings.catalog();
        let edges = RelationKey::new("public", "adhoc", "edges");
        assert_eq!(
            catalog.schema(&edges).unwrap(),
            Schema::of(&[("src", Type::Int), ("dst", Type::Int)])
        );
        assert_eq!(catalog.workers_for_relation(&edges).map(|w| w.len()), Some(2));
    }
}
