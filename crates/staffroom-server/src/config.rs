use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;

use staffroom_gateway::hub::DEFAULT_QUEUE_CAPACITY;

/// Process configuration, read from `STAFFROOM_*` environment variables
/// after `.env` has been loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub outbound_queue: usize,
    /// `None` allows any origin.
    pub allowed_origins: Option<Vec<String>>,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let host = lookup("STAFFROOM_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port = match lookup("STAFFROOM_PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("STAFFROOM_PORT is not a port number: {raw}"))?,
            None => 8080,
        };
        let db_path = PathBuf::from(lookup("STAFFROOM_DB_PATH").unwrap_or_else(|| "staffroom.db".into()));
        let outbound_queue = match lookup("STAFFROOM_OUTBOUND_QUEUE") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("STAFFROOM_OUTBOUND_QUEUE is not a count: {raw}"))?,
            None => DEFAULT_QUEUE_CAPACITY,
        };
        if outbound_queue == 0 {
            anyhow::bail!("STAFFROOM_OUTBOUND_QUEUE must be at least 1");
        }
        let allowed_origins = parse_origins(&lookup("STAFFROOM_ALLOWED_ORIGINS").unwrap_or_else(|| "*".into()));

        Ok(Self {
            host,
            port,
            db_path,
            outbound_queue,
            allowed_origins,
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

fn parse_origins(raw: &str) -> Option<Vec<String>> {
    let origins: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(String::from)
        .collect();
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        None
    } else {
        Some(origins)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> anyhow::Result<ServerConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.db_path, PathBuf::from("staffroom.db"));
        assert_eq!(cfg.outbound_queue, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(cfg.allowed_origins, None);
        assert_eq!(cfg.addr().unwrap().port(), 8080);
    }

    #[test]
    fn overrides() {
        let cfg = config(&[
            ("STAFFROOM_HOST", "127.0.0.1"),
            ("STAFFROOM_PORT", "9000"),
            ("STAFFROOM_DB_PATH", "/tmp/chat.db"),
            ("STAFFROOM_OUTBOUND_QUEUE", "16"),
            ("STAFFROOM_ALLOWED_ORIGINS", "https://a.example, https://b.example"),
        ])
        .unwrap();
        assert_eq!(cfg.addr().unwrap().to_string(), "127.0.0.1:9000");
        assert_eq!(cfg.outbound_queue, 16);
        assert_eq!(
            cfg.allowed_origins,
            Some(vec!["https://a.example".to_string(), "https://b.example".to_string()])
        );
    }

    #[test]
    fn rejects_bad_numbers() {
        assert!(config(&[("STAFFROOM_PORT", "eighty")]).is_err());
        assert!(config(&[("STAFFROOM_OUTBOUND_QUEUE", "0")]).is_err());
    }
}
