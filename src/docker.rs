//! Runtime driver: lifecycle commands against the container runtime CLI,
//! with all text parsing of its output isolated in the adapter functions at
//! the bottom of this file. The driver is stateless per call and never
//! retries; callers own retry policy.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::bot::ResourceLimits;
use crate::error::{Result, SupervisorError};

/// Port the injected health sidecar listens on inside the container.
pub const SIDECAR_PORT: u16 = 8080;

/// Container run state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
}

impl RunState {
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "created" => Some(RunState::Created),
            "running" => Some(RunState::Running),
            "paused" => Some(RunState::Paused),
            "restarting" => Some(RunState::Restarting),
            "exited" => Some(RunState::Exited),
            "dead" => Some(RunState::Dead),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Created => "created",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Restarting => "restarting",
            RunState::Exited => "exited",
            RunState::Dead => "dead",
        }
    }
}

/// Structured status for one container, parsed from runtime output.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeStatus {
    pub run_state: RunState,
    pub uptime_secs: Option<u64>,
    pub mem_mib: Option<f64>,
    pub cpu_percent: Option<f64>,
}

/// The runtime seam. Any runtime exposing an equivalent
/// create/start/stop/inspect/logs contract satisfies this interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container for `image` with explicit resource ceilings and
    /// the given environment. Returns the runtime-assigned container id.
    /// Does not start it.
    async fn create(
        &self,
        image: &str,
        name: &str,
        limits: &ResourceLimits,
        env: &[(String, String)],
        health_port: u16,
    ) -> Result<String>;

    async fn start(&self, container_id: &str) -> Result<()>;
    async fn stop(&self, container_id: &str) -> Result<()>;
    async fn restart(&self, container_id: &str) -> Result<()>;
    async fn remove(&self, container_id: &str) -> Result<()>;

    /// Structured status. Fails `NotFound` for an unknown id; never returns
    /// a zero-valued default.
    async fn inspect(&self, container_id: &str) -> Result<RuntimeStatus>;

    /// Most recent log lines, newest last.
    async fn logs(&self, container_id: &str, max_lines: usize) -> Result<Vec<String>>;
}

/// Production driver: shells out to the docker CLI with a per-operation
/// deadline.
pub struct DockerCli {
    bin: String,
    op_timeout: Duration,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>, op_timeout: Duration) -> Self {
        DockerCli {
            bin: bin.into(),
            op_timeout,
        }
    }

    /// Run one runtime invocation under the deadline. Non-zero exit maps to
    /// `Runtime` (or `NotFound` when the runtime reports an unknown id);
    /// deadline overrun kills the child and maps to `Timeout`.
    async fn run_op(&self, operation: &'static str, args: &[&str]) -> Result<CliOutput> {
        debug!(operation, ?args, "runtime invocation");
        let mut cmd = tokio::process::Command::new(&self.bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.op_timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| SupervisorError::Runtime {
                operation,
                message: format!("failed to invoke {}: {}", self.bin, e),
            })?,
            Err(_) => {
                return Err(SupervisorError::Timeout {
                    operation,
                    seconds: self.op_timeout.as_secs(),
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            if is_not_found(&stderr) {
                return Err(SupervisorError::NotFound(stderr.trim().to_string()));
            }
            return Err(SupervisorError::Runtime {
                operation,
                message: stderr.trim().to_string(),
            });
        }
        Ok(CliOutput { stdout, stderr })
    }
}

#[derive(Debug)]
struct CliOutput {
    stdout: String,
    stderr: String,
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create(
        &self,
        image: &str,
        name: &str,
        limits: &ResourceLimits,
        env: &[(String, String)],
        health_port: u16,
    ) -> Result<String> {
        let memory = format!("{}m", limits.memory_mib);
        let cpus = format!("{}", limits.cpus);
        let tmpfs = format!("/tmp:rw,size={}m", limits.storage_mib);
        let port_map = format!("127.0.0.1:{}:{}", health_port, SIDECAR_PORT);

        let mut args: Vec<String> = vec![
            "create".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--restart".to_string(),
            "unless-stopped".to_string(),
            "--memory".to_string(),
            memory.clone(),
            "--memory-swap".to_string(),
            memory,
            "--cpus".to_string(),
            cpus,
            // Script and dependencies are baked into the image; the root
            // filesystem stays read-only and scratch space is a bounded
            // tmpfs. No host path is ever mounted writable.
            "--read-only".to_string(),
            "--tmpfs".to_string(),
            tmpfs,
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "-p".to_string(),
            port_map,
        ];
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(image.to_string());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.run_op("create", &arg_refs).await?;
        let container_id = out.stdout.trim().to_string();
        if container_id.is_empty() {
            return Err(SupervisorError::Runtime {
                operation: "create",
                message: "runtime returned no container id".to_string(),
            });
        }
        Ok(container_id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.run_op("start", &["start", container_id]).await?;
        Ok(())
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        self.run_op("stop", &["stop", container_id]).await?;
        Ok(())
    }

    async fn restart(&self, container_id: &str) -> Result<()> {
        self.run_op("restart", &["restart", container_id]).await?;
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.run_op("remove", &["rm", "-f", container_id]).await?;
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<RuntimeStatus> {
        let out = self
            .run_op(
                "inspect",
                &[
                    "inspect",
                    container_id,
                    "--format",
                    "{{.State.Status}}|{{.State.StartedAt}}",
                ],
            )
            .await?;
        let (run_state, started_at) = parse_state_line(out.stdout.trim())?;
        let uptime_secs = match run_state {
            RunState::Running => started_at.map(|t| (Utc::now() - t).num_seconds().max(0) as u64),
            _ => None,
        };

        let (mem_mib, cpu_percent) = if run_state == RunState::Running {
            match self
                .run_op(
                    "inspect",
                    &[
                        "stats",
                        container_id,
                        "--no-stream",
                        "--format",
                        "{{.MemUsage}}|{{.CPUPerc}}",
                    ],
                )
                .await
            {
                Ok(stats) => match parse_stats_line(stats.stdout.trim()) {
                    Some((mem, cpu)) => (Some(mem), Some(cpu)),
                    None => {
                        warn!(container_id, line = %stats.stdout.trim(), "unparseable stats line");
                        (None, None)
                    }
                },
                // Usage is best-effort; a stats hiccup must not fail inspect.
                Err(e) => {
                    warn!(container_id, error = %e, "stats unavailable");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        Ok(RuntimeStatus {
            run_state,
            uptime_secs,
            mem_mib,
            cpu_percent,
        })
    }

    async fn logs(&self, container_id: &str, max_lines: usize) -> Result<Vec<String>> {
        let tail = max_lines.to_string();
        let out = self
            .run_op("logs", &["logs", "--tail", &tail, container_id])
            .await?;
        // docker logs writes the app's stderr stream to our stderr.
        let mut lines: Vec<String> = out
            .stdout
            .lines()
            .chain(out.stderr.lines())
            .map(|l| l.trim_end().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if lines.len() > max_lines {
            lines.drain(..lines.len() - max_lines);
        }
        Ok(lines)
    }
}

/// Check that the runtime binary exists and its daemon is answering.
pub async fn check_docker_available(bin: &str) -> std::result::Result<(), String> {
    let version = tokio::process::Command::new(bin)
        .arg("--version")
        .output()
        .await
        .map_err(|e| format!("{} command not found: {}", bin, e))?;
    if !version.status.success() {
        return Err(format!("{} command failed to execute", bin));
    }

    let info = tokio::process::Command::new(bin)
        .arg("info")
        .output()
        .await
        .map_err(|e| format!("failed to check {} daemon: {}", bin, e))?;
    if !info.status.success() {
        let error = String::from_utf8_lossy(&info.stderr);
        if error.contains("Cannot connect") || error.contains("Is the docker daemon running") {
            return Err(format!("{} daemon is not running", bin));
        }
        return Err(format!("{} daemon check failed: {}", bin, error.trim()));
    }
    Ok(())
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

/// Parse "<status>|<started-at>" from `inspect --format`.
/// Example: "running|2026-08-07T10:14:03.123456789Z".
fn parse_state_line(line: &str) -> Result<(RunState, Option<DateTime<Utc>>)> {
    let (status, started) = line
        .split_once('|')
        .ok_or_else(|| SupervisorError::Runtime {
            operation: "inspect",
            message: format!("unexpected inspect output: {:?}", line),
        })?;
    let run_state = RunState::from_str(status).ok_or_else(|| SupervisorError::Runtime {
        operation: "inspect",
        message: format!("unknown container state: {:?}", status),
    })?;
    let started_at = DateTime::parse_from_rfc3339(started.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc));
    Ok((run_state, started_at))
}

/// Parse "<mem used> / <mem limit>|<cpu%>" from `stats --format`.
/// Example: "12.55MiB / 256MiB|3.17%".
fn parse_stats_line(line: &str) -> Option<(f64, f64)> {
    let (mem_part, cpu_part) = line.split_once('|')?;
    let used = mem_part.split('/').next()?.trim();
    let mem_mib = parse_mem_value(used)?;
    let cpu_percent: f64 = cpu_part.trim().trim_end_matches('%').parse().ok()?;
    Some((mem_mib, cpu_percent))
}

/// Parse a docker memory value ("512KiB", "12.5MiB", "1.2GiB") into MiB.
fn parse_mem_value(value: &str) -> Option<f64> {
    let value = value.trim();
    let split = value.find(|c: char| c.is_ascii_alphabetic())?;
    let (number, unit) = value.split_at(split);
    let number: f64 = number.trim().parse().ok()?;
    match unit.trim() {
        "B" => Some(number / (1024.0 * 1024.0)),
        "KiB" | "KB" | "kB" => Some(number / 1024.0),
        "MiB" | "MB" => Some(number),
        "GiB" | "GB" => Some(number * 1024.0),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_running_state_line() {
        let (state, started) = parse_state_line("running|2026-08-07T10:14:03.123456789Z").unwrap();
        assert_eq!(state, RunState::Running);
        assert!(started.is_some());
    }

    #[test]
    fn parses_exited_state_line() {
        let (state, started) = parse_state_line("exited|0001-01-01T00:00:00Z").unwrap();
        assert_eq!(state, RunState::Exited);
        assert!(started.is_some());
    }

    #[test]
    fn rejects_garbage_state_line() {
        assert!(parse_state_line("").is_err());
        assert!(parse_state_line("no-pipe-here").is_err());
        assert!(parse_state_line("levitating|2026-01-01T00:00:00Z").is_err());
    }

    #[test]
    fn parses_stats_line_samples() {
        // Pinned to real `docker stats --no-stream --format` output.
        let (mem, cpu) = parse_stats_line("12.55MiB / 256MiB|3.17%").unwrap();
        assert!((mem - 12.55).abs() < 1e-9);
        assert!((cpu - 3.17).abs() < 1e-9);

        let (mem, cpu) = parse_stats_line("1.2GiB / 2GiB|0.00%").unwrap();
        assert!((mem - 1228.8).abs() < 1e-6);
        assert_eq!(cpu, 0.0);

        let (mem, _) = parse_stats_line("512KiB / 256MiB|0.05%").unwrap();
        assert!((mem - 0.5).abs() < 1e-9);
    }

    #[test]
    fn rejects_garbage_stats_line() {
        assert!(parse_stats_line("").is_none());
        assert!(parse_stats_line("-- / --|--").is_none());
        assert!(parse_stats_line("12.55MiB / 256MiB").is_none());
    }

    #[test]
    fn mem_value_units() {
        assert_eq!(parse_mem_value("256MiB"), Some(256.0));
        assert_eq!(parse_mem_value("1GiB"), Some(1024.0));
        assert_eq!(parse_mem_value("1024KiB"), Some(1.0));
        assert_eq!(parse_mem_value("nonsense"), None);
    }

    #[test]
    fn not_found_detection() {
        assert!(is_not_found("Error: No such container: abc123"));
        assert!(is_not_found("Error: No such object: abc123"));
        assert!(!is_not_found("Cannot connect to the Docker daemon"));
    }

    #[tokio::test]
    async fn deadline_overrun_maps_to_timeout() {
        // Stand an arbitrary slow binary in for the runtime CLI.
        let driver = DockerCli::new("sleep", Duration::from_millis(100));
        let err = driver.run_op("inspect", &["5"]).await.unwrap_err();
        match err {
            SupervisorError::Timeout { operation, .. } => assert_eq!(operation, "inspect"),
            other => panic!("expected Timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_binary_maps_to_runtime_error() {
        let driver = DockerCli::new("definitely-not-a-real-binary-zzz", Duration::from_secs(5));
        let err = driver.run_op("start", &["start", "abc"]).await.unwrap_err();
        match err {
            SupervisorError::Runtime { operation, .. } => assert_eq!(operation, "start"),
            other => panic!("expected Runtime, got {:?}", other),
        }
    }
}
