use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KnotConfig {
    pub host: String,
    pub port: u16,
    /// Bind address of the internal API used by the SSH guard. Never expose this publicly.
    pub internal_host: String,
    pub internal_port: u16,
    /// Public hostname of this knot (e.g., "knot.example.com").
    /// Used to build immutable archive links.
    pub hostname: String,
    /// Directory holding repositories laid out as `<owner_did>/<name>`.
    pub scan_root: PathBuf,
    pub data_dir: PathBuf,
    /// DID of the knot operator, granted `server:owner` on startup.
    pub owner: Option<String>,
    /// Development mode: archive links use http instead of https.
    pub dev: bool,
    /// Message of the day shown to git clients by the SSH guard.
    pub motd_file: Option<PathBuf>,
}

impl KnotConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    pub fn internal_socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.internal_host, self.internal_port).parse()
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("knot.db")
    }

    #[must_use]
    pub fn scheme(&self) -> &'static str {
        if self.dev { "http" } else { "https" }
    }
}

impl Default for KnotConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5555,
            internal_host: "127.0.0.1".to_string(),
            internal_port: 5444,
            hostname: "localhost:5555".to_string(),
            scan_root: PathBuf::from("/home/git"),
            data_dir: PathBuf::from("./data"),
            owner: None,
            dev: false,
            motd_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_addresses() {
        let config = KnotConfig::default();
        assert_eq!(config.socket_addr().unwrap().port(), 5555);
        assert_eq!(config.internal_socket_addr().unwrap().port(), 5444);
        assert_eq!(config.db_path(), PathBuf::from("./data/knot.db"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: KnotConfig = toml::from_str(
            r#"
            hostname = "knot.example.com"
            dev = true
            "#,
        )
        .unwrap();
        assert_eq!(config.hostname, "knot.example.com");
        assert_eq!(config.scheme(), "http");
        assert_eq!(config.port, 5555);
    }
}
