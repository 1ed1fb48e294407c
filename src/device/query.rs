//! Host accelerator queries.
//!
//! Epistemic foundation:
//! - K_i: Two independent queries: every device, and devices running compute work
//! - B_i: Either query may fail → DeviceQuery error, fatal for the stage
//! - B_i: A host without GPUs makes the list query fail → empty list, so the
//!   lease reports ResourceUnavailable
//! - I^B: Only a point-in-time view; devices may change state right after

use crate::models::{DeviceConfig, Result, TiltflowError};
use async_trait::async_trait;
use regex::Regex;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, warn};

/// One accelerator visible on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accelerator {
    /// Numeric device index
    pub id: u32,
    /// Stable device UUID
    pub uuid: String,
    /// Product name
    pub name: String,
}

/// Source of accelerator state.
#[async_trait]
pub trait DeviceQuery: Send + Sync {
    /// Every accelerator on the host.
    async fn list_devices(&self) -> Result<Vec<Accelerator>>;

    /// Identifiers (UUID or numeric id) of accelerators bound to a compute process.
    async fn busy_devices(&self) -> Result<Vec<String>>;
}

/// `nvidia-smi` backed device query.
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    list_command: Vec<String>,
    busy_command: Vec<String>,
}

impl NvidiaSmi {
    pub fn new(list_command: Vec<String>, busy_command: Vec<String>) -> Self {
        Self {
            list_command,
            busy_command,
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(config.list_command.clone(), config.busy_command.clone())
    }

    /// Parse `nvidia-smi --list-gpus` output.
    ///
    /// Lines look like `GPU 0: NVIDIA A100-SXM4-40GB (UUID: GPU-5e7c...)`.
    pub fn parse_device_list(text: &str) -> Result<Vec<Accelerator>> {
        let re = Regex::new(r"^GPU\s+(\d+):\s*(.*?)\s*\(UUID:\s*([^)]+?)\s*\)")
            .map_err(|e| TiltflowError::Internal(format!("Invalid device regex: {e}")))?;

        let mut devices = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let caps = re.captures(line).ok_or_else(|| {
                TiltflowError::DeviceQuery(format!("Unrecognised device line: {line}"))
            })?;
            let id = caps[1].parse().map_err(|e| {
                TiltflowError::DeviceQuery(format!("Bad device index in '{line}': {e}"))
            })?;
            devices.push(Accelerator {
                id,
                name: caps[2].to_string(),
                uuid: caps[3].to_string(),
            });
        }
        Ok(devices)
    }

    /// Parse `nvidia-smi --query-compute-apps=gpu_uuid --format=csv` output.
    pub fn parse_busy_list(text: &str) -> Vec<String> {
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.eq_ignore_ascii_case("gpu_uuid"))
            .map(str::to_string)
            .collect()
    }
}

#[async_trait]
impl DeviceQuery for NvidiaSmi {
    async fn list_devices(&self) -> Result<Vec<Accelerator>> {
        let output = spawn_query(&self.list_command).await?;
        // nvidia-smi exits non-zero on a host without GPUs.
        if !output.status.success() && reports_no_devices(&output) {
            warn!(command = %self.list_command.join(" "), "No accelerators present");
            return Ok(Vec::new());
        }
        Self::parse_device_list(&checked_stdout(&self.list_command, output)?)
    }

    async fn busy_devices(&self) -> Result<Vec<String>> {
        let output = spawn_query(&self.busy_command).await?;
        Ok(Self::parse_busy_list(&checked_stdout(
            &self.busy_command,
            output,
        )?))
    }
}

const NO_DEVICES: &str = "No devices were found";

fn reports_no_devices(output: &Output) -> bool {
    [&output.stdout, &output.stderr]
        .iter()
        .any(|text| String::from_utf8_lossy(text).contains(NO_DEVICES))
}

async fn spawn_query(argv: &[String]) -> Result<Output> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| TiltflowError::DeviceQuery("Empty device query command".into()))?;

    Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| TiltflowError::DeviceQuery(format!("Failed to run {program}: {e}")))
}

fn checked_stdout(argv: &[String], output: Output) -> Result<String> {
    let program = argv.first().map(String::as_str).unwrap_or_default();
    if !output.status.success() {
        return Err(TiltflowError::DeviceQuery(format!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    debug!(command = %argv.join(" "), "Device query complete");
    Ok(stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = "GPU 0: NVIDIA A100-SXM4-40GB (UUID: GPU-aaaa-0000)\n\
                        GPU 1: NVIDIA A100-SXM4-40GB (UUID: GPU-bbbb-1111)\n";

    #[test]
    fn test_parse_device_list() {
        let devices = NvidiaSmi::parse_device_list(LIST).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].id, 1);
        assert_eq!(devices[1].uuid, "GPU-bbbb-1111");
        assert_eq!(devices[0].name, "NVIDIA A100-SXM4-40GB");
    }

    #[test]
    fn test_parse_device_list_rejects_garbage() {
        let err = NvidiaSmi::parse_device_list("No devices were found?").unwrap_err();
        assert!(matches!(err, TiltflowError::DeviceQuery(_)));
    }

    #[test]
    fn test_parse_busy_list_skips_header() {
        let busy = NvidiaSmi::parse_busy_list("gpu_uuid\nGPU-aaaa-0000\n\n");
        assert_eq!(busy, vec!["GPU-aaaa-0000".to_string()]);
        assert!(NvidiaSmi::parse_busy_list("gpu_uuid\n").is_empty());
    }

    #[tokio::test]
    async fn test_failing_query_command() {
        let query = NvidiaSmi::new(
            vec!["tiltflow-definitely-missing-binary".into()],
            vec!["tiltflow-definitely-missing-binary".into()],
        );
        assert!(matches!(
            query.list_devices().await,
            Err(TiltflowError::DeviceQuery(_))
        ));
    }

    fn shell(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn test_host_without_gpus() {
        let query = NvidiaSmi::new(
            shell("echo 'No devices were found'; exit 6"),
            shell("echo gpu_uuid"),
        );
        assert!(query.list_devices().await.unwrap().is_empty());

        let err = crate::device::LeaseManager::new(query)
            .acquire()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TiltflowError::ResourceUnavailable { total: 0, busy: 0 }
        ));

        let broken = NvidiaSmi::new(shell("echo 'driver mismatch' >&2; exit 9"), shell("true"));
        assert!(matches!(
            broken.list_devices().await,
            Err(TiltflowError::DeviceQuery(_))
        ));
    }
}
