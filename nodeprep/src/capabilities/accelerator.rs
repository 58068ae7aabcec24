//! Read-only accelerator presence probe.

use super::command::{CommandRunner, CommandSpec, EXIT_NOT_FOUND};
use crate::errors::ActionError;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

const QUERY_FIELDS: &str = "index,name,memory.total,memory.used,utilization.gpu,temperature.gpu";

/// One accelerator reported by the driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceleratorDevice {
    /// Driver index.
    pub index: u32,
    /// Marketing name.
    pub name: String,
    /// Total memory in MiB.
    pub memory_total_mib: u64,
    /// Used memory in MiB.
    pub memory_used_mib: u64,
    /// Core utilization in percent, when reported.
    pub utilization_pct: Option<f64>,
    /// Temperature in degrees Celsius, when reported.
    pub temperature_c: Option<f64>,
}

impl fmt::Display for AcceleratorDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} ({} MiB, {} MiB used)",
            self.index, self.name, self.memory_total_mib, self.memory_used_mib
        )
    }
}

/// Leading numeric token of a field such as `16376 MiB` or `0 %`.
fn leading_number(field: &str) -> Option<&str> {
    field.split_whitespace().next()
}

/// Decodes `nvidia-smi --format=csv,noheader` output.
///
/// Rows with fewer than six columns are skipped. Fields the driver reports
/// as `[N/A]` decode to `None` or zero.
#[must_use]
pub fn parse_device_csv(output: &str) -> Vec<AcceleratorDevice> {
    let mut devices = Vec::new();
    for (row, line) in output.lines().enumerate() {
        let cols: Vec<&str> = line.split(',').map(str::trim).collect();
        if cols.len() < 6 {
            if !line.trim().is_empty() {
                debug!(row, columns = cols.len(), "Skipping short nvidia-smi row");
            }
            continue;
        }

        let Ok(index) = cols[0].parse::<u32>() else {
            debug!(row, value = cols[0], "Skipping row with invalid index");
            continue;
        };
        let mib = |field: &str| {
            leading_number(field)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };
        let float = |field: &str| leading_number(field).and_then(|v| v.parse::<f64>().ok());

        devices.push(AcceleratorDevice {
            index,
            name: cols[1].to_string(),
            memory_total_mib: mib(cols[2]),
            memory_used_mib: mib(cols[3]),
            utilization_pct: float(cols[4]),
            temperature_c: float(cols[5]),
        });
    }
    devices
}

/// Reports which accelerators the installed driver can see.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AcceleratorProbe: Send + Sync {
    /// Returns the visible devices; empty when there are none.
    async fn query_presence(&self) -> Result<Vec<AcceleratorDevice>, ActionError>;
}

/// [`AcceleratorProbe`] backed by `nvidia-smi`.
#[derive(Clone)]
pub struct NvidiaSmiProbe {
    runner: Arc<dyn CommandRunner>,
}

impl NvidiaSmiProbe {
    /// Creates a probe running `nvidia-smi` through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl fmt::Debug for NvidiaSmiProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NvidiaSmiProbe").finish_non_exhaustive()
    }
}

#[async_trait]
impl AcceleratorProbe for NvidiaSmiProbe {
    async fn query_presence(&self) -> Result<Vec<AcceleratorDevice>, ActionError> {
        let spec = CommandSpec::new("nvidia-smi")
            .arg("--format=csv,noheader")
            .arg(format!("--query-gpu={QUERY_FIELDS}"));
        let output = self.runner.run(&spec).await?;

        if output.status == Some(EXIT_NOT_FOUND) {
            warn!("nvidia-smi not found; is the driver installed?");
            return Ok(Vec::new());
        }
        let combined = format!("{}{}", output.stdout, output.stderr).to_lowercase();
        if combined.contains("no devices") {
            debug!("nvidia-smi reported no devices");
            return Ok(Vec::new());
        }

        let stdout = output.into_result(&spec)?;
        Ok(parse_device_csv(&stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::command::{CommandOutput, MockCommandRunner};
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = "\
0, NVIDIA GeForce RTX 4080 SUPER, 16376 MiB, 1309 MiB, 0 %, 41
1, NVIDIA GeForce RTX 4080 SUPER, 16376 MiB, 13625 MiB, 87 %, 39
";

    #[test]
    fn test_parse_device_csv() {
        let devices = parse_device_csv(SAMPLE);
        assert_eq!(devices.len(), 2);
        assert_eq!(
            devices[1],
            AcceleratorDevice {
                index: 1,
                name: "NVIDIA GeForce RTX 4080 SUPER".into(),
                memory_total_mib: 16376,
                memory_used_mib: 13625,
                utilization_pct: Some(87.0),
                temperature_c: Some(39.0),
            }
        );
        assert_eq!(
            devices[0].to_string(),
            "#0 NVIDIA GeForce RTX 4080 SUPER (16376 MiB, 1309 MiB used)"
        );
    }

    #[test]
    fn test_parse_skips_short_rows_and_handles_na() {
        let devices = parse_device_csv("garbage\n0, Tesla T4, 15360 MiB, 0 MiB, [N/A], [N/A]\n");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].utilization_pct, None);
        assert_eq!(devices[0].temperature_c, None);
    }

    #[tokio::test]
    async fn test_query_presence_no_devices() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Ok(CommandOutput {
                status: Some(6),
                stdout: "No devices were found\n".into(),
                stderr: String::new(),
            })
        });
        let probe = NvidiaSmiProbe::new(Arc::new(runner));
        assert!(probe.query_presence().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_presence_driver_failure() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Ok(CommandOutput::failed(
                9,
                "NVIDIA-SMI has failed because it couldn't communicate with the NVIDIA driver",
            ))
        });
        let probe = NvidiaSmiProbe::new(Arc::new(runner));
        assert!(matches!(
            probe.query_presence().await,
            Err(ActionError::CommandFailed { code: Some(9), .. })
        ));
    }

    #[tokio::test]
    async fn test_query_presence_decodes() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.args.iter().any(|a| a.starts_with("--query-gpu=index,name")))
            .returning(|_| Ok(CommandOutput::ok(SAMPLE)));
        let probe = NvidiaSmiProbe::new(Arc::new(runner));
        assert_eq!(probe.query_presence().await.unwrap().len(), 2);
    }
}
