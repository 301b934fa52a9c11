//! SNMP probe implementation using net-snmp's `snmpbulkget`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use super::{FieldMap, ProbeError};
use crate::db::SnmpCredentials;

/// Runs `snmpbulkget` against a device and collects its `-Oqs` output.
#[derive(Debug, Clone)]
pub struct SnmpBulkGet {
    binary: String,
    mib_path: PathBuf,
}

impl SnmpBulkGet {
    pub fn new(mib_path: impl Into<PathBuf>) -> Self {
        Self {
            binary: "snmpbulkget".to_string(),
            mib_path: mib_path.into(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Fetch every OID batch into one field map.
    ///
    /// Batches are requested one at a time since a single GETBULK for all
    /// of them exceeds the maximum packet size.
    pub async fn fetch(
        &self,
        address: &str,
        port: u16,
        credentials: &SnmpCredentials,
        timeout: Duration,
        batches: &[&str],
    ) -> Result<FieldMap, ProbeError> {
        let mut fields = FieldMap::new();

        for batch in batches {
            let output = self
                .command(address, port, credentials, timeout, batch)
                .output()
                .await
                .map_err(|e| {
                    ProbeError::Unreachable(format!("failed to execute {}: {}", self.binary, e))
                })?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(classify_failure(&stderr, output.status.code(), timeout));
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            if parse_bulkget_output(&stdout, &mut fields) == 0 {
                return Err(ProbeError::Parse(format!(
                    "no values returned for OIDs {}",
                    batch
                )));
            }
        }

        Ok(fields)
    }

    fn command(
        &self,
        address: &str,
        port: u16,
        credentials: &SnmpCredentials,
        timeout: Duration,
        oids: &str,
    ) -> Command {
        let mut cmd = Command::new(&self.binary);
        match credentials {
            SnmpCredentials::V2c { community } => {
                cmd.args(["-v2c", "-c", community.as_str()]);
            }
            SnmpCredentials::V3 { username, password } => {
                cmd.args([
                    "-v3",
                    "-l",
                    "authNoPriv",
                    "-u",
                    username.as_str(),
                    "-A",
                    password.as_str(),
                ]);
            }
        }

        let timeout_secs = timeout.as_secs().max(1);
        cmd.args(["-t", timeout_secs.to_string().as_str(), "-r", "0"])
            .arg("-m")
            .arg(&self.mib_path)
            .arg("-Oqs")
            .arg(format!("{}:{}", address, port))
            .args(oids.split_whitespace())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Parse `-Oqs` lines (`<name> <value>`) into `fields`.
///
/// Returns the number of values parsed.
fn parse_bulkget_output(output: &str, fields: &mut FieldMap) -> usize {
    let mut parsed = 0;
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (name, value) = match line.split_once(' ') {
            Some((name, value)) => (name, value.trim()),
            None => (line, ""),
        };
        if value.starts_with("No Such") || value.starts_with("No more variables") {
            continue;
        }
        let value = value.trim_start_matches('"').trim_end_matches('"');
        fields.insert(name, value);
        parsed += 1;
    }
    parsed
}

fn classify_failure(stderr: &str, code: Option<i32>, timeout: Duration) -> ProbeError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("no response") {
        ProbeError::Timeout(timeout)
    } else if lower.contains("authentication")
        || lower.contains("unknown user")
        || lower.contains("authorization")
    {
        ProbeError::Auth(stderr.trim().to_string())
    } else {
        ProbeError::Unreachable(format!(
            "snmpbulkget exited with code {}: {}",
            code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
            stderr.trim()
        ))
    }
}
