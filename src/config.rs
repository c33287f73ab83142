use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
///
/// | Env Var                              | Default   |
/// |--------------------------------------|-----------|
/// | `TOOLSYNC_BIND`                      | `0.0.0.0` |
/// | `TOOLSYNC_PORT`                      | `5433`    |
/// | `TOOLSYNC_DATA_DIR`                  | `./data`  |
/// | `TOOLSYNC_PASSWORD`                  | `toolsync`|
/// | `TOOLSYNC_ADMINS`                    | empty     |
/// | `TOOLSYNC_MAX_CONNECTIONS`           | `256`     |
/// | `TOOLSYNC_COMPACT_THRESHOLD`         | `1000`    |
/// | `TOOLSYNC_ACTIVATION_INTERVAL_SECS`  | `86400`   |
/// | `TOOLSYNC_METRICS_PORT`              | disabled  |
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    /// Session user names treated as admins even when not registered.
    pub admins: Vec<String>,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub activation_interval: Duration,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "toolsync".into(),
            admins: Vec::new(),
            max_connections: 256,
            compact_threshold: 1000,
            activation_interval: Duration::from_secs(86_400),
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let lookup = &lookup;

        Self {
            bind: lookup("TOOLSYNC_BIND").unwrap_or(defaults.bind),
            port: parsed(lookup, "TOOLSYNC_PORT").unwrap_or(defaults.port),
            data_dir: lookup("TOOLSYNC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("TOOLSYNC_PASSWORD").unwrap_or(defaults.password),
            admins: lookup("TOOLSYNC_ADMINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.admins),
            max_connections: parsed(lookup, "TOOLSYNC_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parsed(lookup, "TOOLSYNC_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            activation_interval: parsed(lookup, "TOOLSYNC_ACTIVATION_INTERVAL_SECS")
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.activation_interval),
            metrics_port: parsed(lookup, "TOOLSYNC_METRICS_PORT"),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("toolsync.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}
