//! Adapter for APC Smart-UPS devices with a network management card.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{FieldMap, ModelAdapter, NmcScraper, ProbeError, SnmpBulkGet};
use crate::db::{HttpCredentials, SnmpCredentials};

/// PowerNet-MIB identity, battery, input and output objects.
///
/// Split in two GETBULK requests to stay under the maximum packet size.
pub const UPS_OIDS: [&str; 2] = [
    ".1.3.6.1.4.1.318.1.1.1.1.2 .1.3.6.1.4.1.318.1.1.1.2.2 .1.3.6.1.4.1.318.1.1.1.2.3 .1.3.6.1.4.1.318.1.1.1.4.2 .1.3.6.1.4.1.318.1.1.1.1.1.1",
    ".1.3.6.1.4.1.318.1.1.1.3.3 .1.3.6.1.4.1.318.1.1.1.4.3 .1.3.6.1.4.1.318.1.1.1.12.1 .1.3.6.1.4.1.318.1.1.1.5.2",
];

/// Universal I/O sensor status table (external temperature/humidity probes).
pub const SENSOR_OIDS: [&str; 1] = [".1.3.6.1.4.1.318.1.1.25.1"];

const SENSOR_MARGIN: Duration = Duration::from_millis(250);

pub struct ApcAdapter {
    snmp: SnmpBulkGet,
    web: NmcScraper,
}

impl ApcAdapter {
    pub fn new(mib_path: impl Into<PathBuf>) -> Result<Self, ProbeError> {
        Self::with_snmp(SnmpBulkGet::new(mib_path))
    }

    fn with_snmp(snmp: SnmpBulkGet) -> Result<Self, ProbeError> {
        Ok(Self {
            snmp,
            web: NmcScraper::new()?,
        })
    }
}

#[async_trait]
impl ModelAdapter for ApcAdapter {
    async fn fetch_snmp(
        &mut self,
        address: &str,
        port: u16,
        credentials: &SnmpCredentials,
        timeout: Duration,
    ) -> Result<FieldMap, ProbeError> {
        let deadline = Instant::now() + timeout;
        let mut fields = self
            .snmp
            .fetch(address, port, credentials, timeout, &UPS_OIDS)
            .await?;

        // Sensor probes are optional hardware; their absence is not a failed cycle.
        // They only get what is left of the budget, minus a margin so the
        // caller's timeout never fires first.
        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .saturating_sub(SENSOR_MARGIN);
        if remaining.is_zero() {
            tracing::debug!("No time left for SNMP sensor data from {}", address);
            return Ok(fields);
        }

        let sensors = self
            .snmp
            .fetch(address, port, credentials, remaining, &SENSOR_OIDS);
        match tokio::time::timeout(remaining, sensors).await {
            Ok(Ok(sensors)) => fields.extend(sensors),
            Ok(Err(e)) => tracing::debug!("No SNMP sensor data from {}: {}", address, e),
            Err(_) => tracing::debug!(
                "SNMP sensor table from {} timed out after {:?}",
                address,
                remaining
            ),
        }

        Ok(fields)
    }

    async fn fetch_http(
        &mut self,
        address: &str,
        credentials: &HttpCredentials,
        port: u16,
        use_tls: bool,
        timeout: Duration,
    ) -> Result<FieldMap, ProbeError> {
        self.web
            .fetch(address, credentials, port, use_tls, timeout)
            .await
    }
}
