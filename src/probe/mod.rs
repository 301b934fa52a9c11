//! Probe module for fetching raw UPS telemetry.
//!
//! Supports SNMP (via net-snmp's `snmpbulkget`) and scraping the network
//! management card web UI over HTTP or HTTPS.

mod apc;
mod http;
mod snmp;

pub use apc::*;
pub use http::*;
pub use snmp::*;

use crate::db::{FetchProbes, HttpCredentials, SnmpCredentials, Target};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("failed to parse response: {0}")]
    Parse(String),
}

/// Raw name/value pairs as reported by a device.
///
/// Keys follow the MIB object names (`upsBasicIdentModel.0`,
/// `uioSensorStatusSensorName.1.1`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    fields: BTreeMap<String, String>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Value for `key`, treating empty strings as missing.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Iterate entries whose key starts with `prefix.`, yielding the index suffix.
    pub fn indexed<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.fields.iter().filter_map(move |(k, v)| {
            k.strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('.'))
                .map(|index| (index, v.as_str()))
        })
    }

    pub fn extend(&mut self, other: FieldMap) {
        self.fields.extend(other.fields);
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = FieldMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// A protocol client for one UPS model family.
///
/// Each poller owns its adapter, so implementations may keep per-device state
/// such as a web session.
#[async_trait]
pub trait ModelAdapter: Send {
    async fn fetch_snmp(
        &mut self,
        address: &str,
        port: u16,
        credentials: &SnmpCredentials,
        timeout: Duration,
    ) -> Result<FieldMap, ProbeError>;

    async fn fetch_http(
        &mut self,
        address: &str,
        credentials: &HttpCredentials,
        port: u16,
        use_tls: bool,
        timeout: Duration,
    ) -> Result<FieldMap, ProbeError>;
}

/// Run one fetch for `target` with the probe it is configured for.
///
/// Returns `Ok(None)` when probing is switched off for the target. The whole
/// fetch is bounded by `timeout`; on expiry the in-flight request is dropped.
pub async fn fetch_once(
    adapter: &mut dyn ModelAdapter,
    target: &Target,
    timeout: Duration,
) -> Result<Option<FieldMap>, ProbeError> {
    let fetch = async {
        match target.fetch_probes {
            FetchProbes::Off => Ok(None),
            FetchProbes::Snmp => adapter
                .fetch_snmp(&target.address, target.snmp_port, &target.snmp, timeout)
                .await
                .map(Some),
            FetchProbes::Http | FetchProbes::Https => match target.http.as_ref() {
                Some(credentials) => adapter
                    .fetch_http(
                        &target.address,
                        credentials,
                        target.http_port,
                        target.fetch_probes == FetchProbes::Https,
                        timeout,
                    )
                    .await
                    .map(Some),
                None => Err(ProbeError::Auth(
                    "no HTTP credentials configured".to_string(),
                )),
            },
        }
    };

    match tokio::time::timeout(timeout, fetch).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}
