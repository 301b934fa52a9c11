//! Configuration module.
//!
//! Service settings come from environment variables; the list of UPS targets
//! comes from a JSON file.

use crate::db::{
    ClickHouseConfig, DeviceOverrides, FetchProbes, HttpCredentials, SnmpCredentials, Target,
};
use crate::scheduler::{InsertPolicy, PollDefaults};

use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid {name} {value:?}, must be {expected}")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("no valid UPS targets found in {0}")]
    NoTargets(PathBuf),
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Max records waiting to be inserted (`CLICKHOUSE_QUEUE_LIMIT`, default 50)
    pub queue_limit: usize,
    /// Default fetch interval (`FETCH_INTERVAL` seconds, default 30)
    pub fetch_interval: Duration,
    /// Default fetch timeout (`FETCH_TIMEOUT` seconds, default 15)
    pub fetch_timeout: Duration,
    /// Log verbosity (`LOG_LEVEL`, default info)
    pub log_level: tracing::Level,
    pub clickhouse: ClickHouseConfig,
    /// Destination table (`CLICKHOUSE_TABLE`, default "apc_ups")
    pub table: String,
    /// Target list path (`TARGETS_FILE`, default "targets.json")
    pub targets_path: PathBuf,
    /// MIB passed to snmpbulkget (`SNMP_MIB_PATH`, default "./powernet.mib")
    pub mib_path: PathBuf,
    pub insert_batch_size: usize,
    pub insert_retries: u32,
    pub insert_retry_delay: Duration,
    pub insert_timeout: Duration,
    pub flush_interval: Duration,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &'static str| lookup(name).ok_or(ConfigError::Missing(name));
        let number = |name: &'static str, default: u64| -> Result<u64, ConfigError> {
            match lookup(name) {
                Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                    name,
                    value: raw,
                    expected: "a number",
                }),
                None => Ok(default),
            }
        };
        let positive = |name: &'static str, default: u64| -> Result<u64, ConfigError> {
            let value = number(name, default)?;
            if value == 0 {
                return Err(ConfigError::Invalid {
                    name,
                    value: value.to_string(),
                    expected: "greater than zero",
                });
            }
            Ok(value)
        };

        let log_level = match lookup("LOG_LEVEL") {
            Some(raw) => parse_log_level(&raw).ok_or(ConfigError::Invalid {
                name: "LOG_LEVEL",
                value: raw,
                expected: "10/debug, 20/info, 30/warning or 40/error",
            })?,
            None => tracing::Level::INFO,
        };

        Ok(Self {
            queue_limit: positive("CLICKHOUSE_QUEUE_LIMIT", 50)? as usize,
            fetch_interval: Duration::from_secs(positive("FETCH_INTERVAL", 30)?),
            fetch_timeout: Duration::from_secs(positive("FETCH_TIMEOUT", 15)?),
            log_level,
            clickhouse: ClickHouseConfig {
                url: required("CLICKHOUSE_URL")?,
                user: required("CLICKHOUSE_USER")?,
                password: required("CLICKHOUSE_PASS")?,
                database: required("CLICKHOUSE_DB")?,
            },
            table: lookup("CLICKHOUSE_TABLE").unwrap_or_else(|| "apc_ups".to_string()),
            targets_path: lookup("TARGETS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("targets.json")),
            mib_path: lookup("SNMP_MIB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./powernet.mib")),
            insert_batch_size: positive("INSERT_BATCH_SIZE", 100)? as usize,
            insert_retries: number("INSERT_RETRIES", 3)? as u32,
            insert_retry_delay: Duration::from_secs(number("INSERT_RETRY_DELAY", 2)?),
            insert_timeout: Duration::from_secs(positive("INSERT_TIMEOUT", 10)?),
            flush_interval: Duration::from_secs(positive("FLUSH_INTERVAL", 2)?),
        })
    }

    pub fn insert_policy(&self) -> InsertPolicy {
        InsertPolicy {
            table: self.table.clone(),
            batch_size: self.insert_batch_size,
            retries: self.insert_retries,
            retry_delay: self.insert_retry_delay,
            insert_timeout: self.insert_timeout,
            flush_interval: self.flush_interval,
        }
    }

    /// Pollers start within one second of each other.
    pub fn poll_defaults(&self) -> PollDefaults {
        PollDefaults {
            interval: self.fetch_interval,
            timeout: self.fetch_timeout,
            start_jitter: Duration::from_secs(1),
        }
    }

    /// Log filter: `RUST_LOG` when set, otherwise `LOG_LEVEL` for this crate.
    pub fn log_filter(&self, rust_log: Option<String>) -> String {
        match rust_log.filter(|directives| !directives.trim().is_empty()) {
            Some(directives) => directives,
            None => format!("upstrail={}", self.log_level).to_lowercase(),
        }
    }
}

/// Accepts the numeric levels (10 debug, 20 info, 30 warning, 40 error) or names.
fn parse_log_level(raw: &str) -> Option<tracing::Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" | "5" => Some(tracing::Level::TRACE),
        "debug" | "10" => Some(tracing::Level::DEBUG),
        "info" | "20" => Some(tracing::Level::INFO),
        "warn" | "warning" | "30" => Some(tracing::Level::WARN),
        "error" | "critical" | "40" | "50" => Some(tracing::Level::ERROR),
        _ => None,
    }
}

/// A number that may be written as a JSON number or a numeric string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Numeric {
    Int(u64),
    Text(String),
}

/// One entry of the target list, as written.
#[derive(Debug, Deserialize)]
struct TargetEntry {
    name: Option<String>,
    ip: Option<String>,
    sku: Option<String>,
    rated_va: Option<Numeric>,
    rated_watts: Option<Numeric>,
    snmp_version: Option<String>,
    snmp_community: Option<String>,
    snmp_username: Option<String>,
    snmp_password: Option<String>,
    port: Option<Numeric>,
    interval: Option<Numeric>,
    timeout: Option<Numeric>,
    fetch_probes: Option<String>,
    http_username: Option<String>,
    http_password: Option<String>,
    http_port: Option<Numeric>,
}

/// Load and validate the target list at `path`.
///
/// Invalid entries are logged and skipped; an empty result is an error.
pub fn load_targets(path: &Path) -> Result<Vec<Target>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let targets = parse_targets(&content).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    if targets.is_empty() {
        return Err(ConfigError::NoTargets(path.to_path_buf()));
    }
    Ok(targets)
}

fn parse_targets(content: &str) -> Result<Vec<Target>, serde_json::Error> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(content)?;
    let mut names = HashSet::new();
    let mut targets = Vec::with_capacity(entries.len());

    for (i, value) in entries.into_iter().enumerate() {
        let label = value
            .get("name")
            .and_then(|n| n.as_str())
            .map_or_else(|| format!("#{}", i), str::to_string);

        let entry: TargetEntry = match serde_json::from_value(value) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!("Failed to parse UPS target {}: {}", label, e);
                continue;
            }
        };

        match validate_target(entry) {
            Ok(target) if !names.insert(target.name.clone()) => {
                tracing::error!("Duplicate UPS target name {:?}, skipping", target.name);
            }
            Ok(target) => {
                tracing::debug!("Parsed UPS target {:?} at {}", target.name, target.address);
                targets.push(target);
            }
            Err(reason) => tracing::error!("Invalid UPS target {}: {}", label, reason),
        }
    }

    Ok(targets)
}

fn validate_target(entry: TargetEntry) -> Result<Target, String> {
    let name = non_empty(entry.name).ok_or("missing required key \"name\"")?;
    let address = non_empty(entry.ip).ok_or("missing required key \"ip\"")?;

    let version = entry
        .snmp_version
        .ok_or("missing required key \"snmp_version\"")?
        .to_ascii_lowercase();
    let snmp = match version.as_str() {
        "v2c" => SnmpCredentials::V2c {
            community: non_empty(entry.snmp_community).ok_or("missing snmp_community")?,
        },
        "v3" => match (non_empty(entry.snmp_username), non_empty(entry.snmp_password)) {
            (Some(username), Some(password)) => SnmpCredentials::V3 { username, password },
            _ => return Err("missing snmp_username/snmp_password".to_string()),
        },
        other => return Err(format!("invalid snmp_version {:?}", other)),
    };

    let fetch_probes = match entry.fetch_probes {
        Some(raw) => {
            FetchProbes::parse(&raw).ok_or_else(|| format!("invalid fetch_probes value {:?}", raw))?
        }
        None => FetchProbes::default(),
    };

    let http = match (non_empty(entry.http_username), non_empty(entry.http_password)) {
        (Some(username), Some(password)) => Some(HttpCredentials { username, password }),
        _ => None,
    };
    if matches!(fetch_probes, FetchProbes::Http | FetchProbes::Https) && http.is_none() {
        return Err("missing http_username/http_password".to_string());
    }

    let snmp_port = numeric(entry.port, "port")?.unwrap_or(161);
    let http_port = numeric(entry.http_port, "http_port")?
        .unwrap_or_else(|| u64::from(fetch_probes.default_http_port()));
    let interval = numeric(entry.interval, "interval")?;
    let timeout = numeric(entry.timeout, "timeout")?;
    if interval == Some(0) || timeout == Some(0) {
        return Err("interval and timeout must be greater than zero".to_string());
    }

    Ok(Target {
        name,
        address,
        overrides: DeviceOverrides {
            sku: non_empty(entry.sku),
            rated_va: bounded(numeric(entry.rated_va, "rated_va")?, "rated_va")?,
            rated_watts: bounded(numeric(entry.rated_watts, "rated_watts")?, "rated_watts")?,
        },
        snmp,
        snmp_port: port(snmp_port, "port")?,
        http,
        http_port: port(http_port, "http_port")?,
        fetch_probes,
        interval: interval.map(Duration::from_secs),
        timeout: timeout.map(Duration::from_secs),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn numeric(value: Option<Numeric>, key: &str) -> Result<Option<u64>, String> {
    match value {
        None => Ok(None),
        Some(Numeric::Int(n)) => Ok(Some(n)),
        Some(Numeric::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(Numeric::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| format!("invalid {} {:?}", key, s)),
    }
}

fn port(value: u64, key: &str) -> Result<u16, String> {
    u16::try_from(value).map_err(|_| format!("invalid {} {}", key, value))
}

fn bounded(value: Option<u64>, key: &str) -> Result<Option<u32>, String> {
    value
        .map(|v| u32::try_from(v).map_err(|_| format!("invalid {} {}", key, v)))
        .transpose()
}
