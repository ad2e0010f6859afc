use std::path::PathBuf;
use std::time::Duration;

/// Server settings, read from `MEDBOOK_*` environment variables.
/// Unset or unparseable numbers fall back to the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub complete_interval: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "medbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            complete_interval: Duration::from_secs(60),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let num = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        Self {
            port: num("MEDBOOK_PORT")
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(d.port),
            bind: lookup("MEDBOOK_BIND").unwrap_or(d.bind),
            data_dir: lookup("MEDBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("MEDBOOK_PASSWORD").unwrap_or(d.password),
            max_connections: num("MEDBOOK_MAX_CONNECTIONS")
                .filter(|n| *n > 0)
                .map(|n| n as usize)
                .unwrap_or(d.max_connections),
            compact_threshold: num("MEDBOOK_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            complete_interval: num("MEDBOOK_COMPLETE_INTERVAL_SECS")
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.complete_interval),
            metrics_port: num("MEDBOOK_METRICS_PORT").and_then(|p| u16::try_from(p).ok()),
            tls_cert: lookup("MEDBOOK_TLS_CERT"),
            tls_key: lookup("MEDBOOK_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> ServerConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn empty_env_gives_defaults() {
        let cfg = from(&[]);
        assert_eq!(cfg, ServerConfig::default());
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5433");
    }

    #[test]
    fn overrides_are_read() {
        let cfg = from(&[
            ("MEDBOOK_PORT", "6000"),
            ("MEDBOOK_BIND", "127.0.0.1"),
            ("MEDBOOK_DATA_DIR", "/var/lib/medbook"),
            ("MEDBOOK_PASSWORD", "s3cret"),
            ("MEDBOOK_MAX_CONNECTIONS", "8"),
            ("MEDBOOK_COMPACT_THRESHOLD", "50"),
            ("MEDBOOK_COMPLETE_INTERVAL_SECS", "5"),
            ("MEDBOOK_METRICS_PORT", "9100"),
        ]);
        assert_eq!(cfg.listen_addr(), "127.0.0.1:6000");
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/medbook"));
        assert_eq!(cfg.password, "s3cret");
        assert_eq!(cfg.max_connections, 8);
        assert_eq!(cfg.compact_threshold, 50);
        assert_eq!(cfg.complete_interval, Duration::from_secs(5));
        assert_eq!(cfg.metrics_port, Some(9100));
    }

    #[test]
    fn malformed_numbers_fall_back() {
        let cfg = from(&[
            ("MEDBOOK_PORT", "99999"),
            ("MEDBOOK_MAX_CONNECTIONS", "lots"),
            ("MEDBOOK_COMPLETE_INTERVAL_SECS", "0"),
            ("MEDBOOK_METRICS_PORT", "-1"),
        ]);
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.complete_interval, Duration::from_secs(60));
        assert_eq!(cfg.metrics_port, None);
    }
}
