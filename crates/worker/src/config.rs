use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tessel_common::WorkerId;
use tessel_engine::{BufferSettings, FlowControl};

/// Another worker this one talks to directly.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerEntry {
    pub id: WorkerId,
    pub address: String,
}

/// Contents of the worker catalog file.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub worker_id: WorkerId,
    pub listen_address: String,
    pub coordinator_address: String,
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
    #[serde(default)]
    pub flow: FlowControl,
    #[serde(default)]
    pub buffers: BufferSettings,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_shutdown_check_interval_ms")]
    pub shutdown_check_interval_ms: u64,
    #[serde(default = "default_executor_threads")]
    pub executor_threads: usize,
    #[serde(default = "default_idle_recheck_ms")]
    pub idle_recheck_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Consecutive shutdown checks that must find the coordinator
    /// unreachable before the worker gives up.
    #[serde(default = "default_coordinator_loss_checks")]
    pub coordinator_loss_checks: u32,
}

pub const CATALOG_FILE: &str = "worker.catalog.toml";

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_shutdown_check_interval_ms() -> u64 {
    1000
}

fn default_executor_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_idle_recheck_ms() -> u64 {
    100
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

fn default_coordinator_loss_checks() -> u32 {
    3
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let config_file_path =
            std::env::var("TESSEL_WORKER_CATALOG").unwrap_or_else(|_| CATALOG_FILE.to_string());
        Self::from_path(&config_file_path)
    }

    /// Reads `worker.catalog.toml` from a worker's working directory.
    pub fn from_working_dir(dir: &Path) -> Result<Self, config::ConfigError> {
        let path = dir.join(CATALOG_FILE);
        Self::from_path(&path.to_string_lossy())
    }

    pub fn from_path(path: &str) -> Result<Self, config::ConfigError> {
        let s = config::Config::builder()
            .add_source(config::File::with_name(path).required(true))
            .add_source(config::Environment::with_prefix("TESSEL_WORKER").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    /// Settings for a worker inside an in-process cluster.
    pub fn local(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            listen_address: format!("local:{worker_id}"),
            coordinator_address: "local:0".to_string(),
            peers: Vec::new(),
            flow: FlowControl::default(),
            buffers: BufferSettings::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_interval_ms: 200,
            shutdown_check_interval_ms: 200,
            executor_threads: 2,
            idle_recheck_ms: 20,
            drain_timeout_ms: 1000,
            coordinator_loss_checks: 10,
        }
    }

    pub fn listen_socket(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.listen_address.parse()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn shutdown_check_interval(&self) -> Duration {
        Duration::from_millis(self.shutdown_check_interval_ms)
    }

    pub fn idle_recheck(&self) -> Duration {
        Duration::from_millis(self.idle_recheck_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn catalog_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join(CATALOG_FILE)).unwrap();
        writeln!(
            file,
            r#"
worker_id = 3
listen_address = "127.0.0.1:9003"
coordinator_address = "127.0.0.1:9000"

[[peers]]
id = 1
address = "127.0.0.1:9001"

[buffers]
capacity = 50
recover_trigger = 10
"#
        )
        .unwrap();
        let settings = Settings::from_working_dir(dir.path()).unwrap();
        assert_eq!(settings.worker_id, 3);
        assert_eq!(settings.peers[0].address, "127.0.0.1:9001");
        assert_eq!(settings.buffers.capacity, 50);
        assert_eq!(settings.flow.high_watermark, 5 * 1024 * 1024);
        assert_eq!(settings.connect_timeout(), Duration::from_secs(3));
        assert_eq!(settings.listen_socket().unwrap().port(), 9003);
    }

    #[test]
    fn missing_catalog_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Settings::from_working_dir(dir.path()).is_err());
    }
}
