use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpindleConfig {
    pub host: String,
    pub port: u16,
    /// Public hostname of this spindle; pipelines are addressed as `did:web:<hostname>`.
    pub hostname: String,
    pub data_dir: PathBuf,
    /// Directory for per-workflow step logs.
    pub log_dir: PathBuf,
    /// DID of the spindle operator.
    pub owner: Option<String>,
    pub dev: bool,
    /// Upper bound on the wall-clock time of a single workflow.
    pub workflow_timeout_secs: u64,
}

impl SpindleConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("spindle.db")
    }

    #[must_use]
    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow_timeout_secs)
    }
}

impl Default for SpindleConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6555,
            hostname: "localhost:6555".to_string(),
            data_dir: PathBuf::from("./data"),
            log_dir: PathBuf::from("./data/logs"),
            owner: None,
            dev: false,
            workflow_timeout_secs: 5 * 60,
        }
    }
}
