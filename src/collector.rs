//! Background status/metrics collector: polls the runtime for each active
//! registry record on a fixed cadence, refreshes observed state and usage,
//! and derives metrics snapshots.
//!
//! Message and error counts are heuristics. When the injected health
//! sidecar answers on the bot's health port its self-reported counters win;
//! otherwise counts fall back to log-line pattern matches. Neither is a
//! contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::bot::BotState;
use crate::docker::{ContainerRuntime, RunState};
use crate::error::Result;
use crate::registry::{ContainerRecord, Registry};

/// Log lines counted as handled messages.
const MESSAGE_PATTERNS: &[&str] = &["message", "update received", "handling update"];

/// Log lines counted as errors.
const ERROR_PATTERNS: &[&str] = &["error", "exception", "traceback", "critical"];

/// How many log lines each poll inspects.
const LOG_SAMPLE_LINES: usize = 200;

/// Deadline for one health-sidecar probe.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Derived, ephemeral view of one bot. Recomputed per poll, never stored.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub bot_id: String,
    pub state: BotState,
    pub uptime_secs: Option<u64>,
    pub mem_mib: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub message_count: u64,
    pub error_count: u64,
    /// True when counters came from the health sidecar rather than the
    /// log heuristic.
    pub from_sidecar: bool,
}

/// Fleet-wide rollup of per-bot snapshots.
#[derive(Debug, Clone, Default)]
pub struct AggregateMetrics {
    pub bots: usize,
    pub running: usize,
    pub total_messages: u64,
    pub total_errors: u64,
    pub total_mem_mib: f64,
}

pub fn aggregate(snapshots: &[MetricsSnapshot]) -> AggregateMetrics {
    let mut agg = AggregateMetrics {
        bots: snapshots.len(),
        ..Default::default()
    };
    for snap in snapshots {
        if snap.state == BotState::Running {
            agg.running += 1;
        }
        agg.total_messages += snap.message_count;
        agg.total_errors += snap.error_count;
        agg.total_mem_mib += snap.mem_mib.unwrap_or(0.0);
    }
    agg
}

/// What the injected sidecar reports on GET /health.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthReport {
    pub uptime_seconds: u64,
    pub message_count: u64,
    pub error_count: u64,
}

/// Probe the bot's health sidecar on the mapped host port.
pub async fn probe_health(http: &reqwest::Client, health_port: u16) -> Option<HealthReport> {
    let url = format!("http://127.0.0.1:{}/health", health_port);
    let response = http
        .get(&url)
        .timeout(HEALTH_PROBE_TIMEOUT)
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    response.json::<HealthReport>().await.ok()
}

fn matches_any(line: &str, patterns: &[&str]) -> bool {
    let lower = line.to_ascii_lowercase();
    patterns.iter().any(|p| lower.contains(p))
}

pub fn count_message_lines(lines: &[String]) -> u64 {
    lines
        .iter()
        .filter(|l| matches_any(l, MESSAGE_PATTERNS) && !matches_any(l, ERROR_PATTERNS))
        .count() as u64
}

pub fn count_error_lines(lines: &[String]) -> u64 {
    lines.iter().filter(|l| matches_any(l, ERROR_PATTERNS)).count() as u64
}

/// Compute the current snapshot for one record. Shared by the supervisor's
/// on-demand `metrics` and the background loop.
pub async fn snapshot_for(
    record: &ContainerRecord,
    runtime: &dyn ContainerRuntime,
    http: &reqwest::Client,
) -> Result<MetricsSnapshot> {
    let Some(container_id) = record.container_id.as_deref() else {
        // Nothing created yet; report the registry's view with no counters.
        return Ok(MetricsSnapshot {
            bot_id: record.bot_id.clone(),
            state: record.observed_state,
            uptime_secs: None,
            mem_mib: None,
            cpu_percent: None,
            message_count: 0,
            error_count: 0,
            from_sidecar: false,
        });
    };

    let status = runtime.inspect(container_id).await?;
    let logs = runtime.logs(container_id, LOG_SAMPLE_LINES).await?;

    let sidecar = if status.run_state == RunState::Running {
        probe_health(http, record.health_port).await
    } else {
        None
    };

    let (message_count, error_count, from_sidecar) = match &sidecar {
        Some(report) => (report.message_count, report.error_count, true),
        None => (count_message_lines(&logs), count_error_lines(&logs), false),
    };

    Ok(MetricsSnapshot {
        bot_id: record.bot_id.clone(),
        state: record.observed_state,
        uptime_secs: sidecar
            .as_ref()
            .map(|r| r.uptime_seconds)
            .or(status.uptime_secs),
        mem_mib: status.mem_mib.or(record.mem_usage_mib),
        cpu_percent: status.cpu_percent.or(record.cpu_usage_percent),
        message_count,
        error_count,
        from_sidecar,
    })
}

pub struct Collector {
    registry: Registry,
    runtime: Arc<dyn ContainerRuntime>,
    interval: Duration,
    failure_threshold: u32,
    build_deadline: chrono::Duration,
    failures: HashMap<String, u32>,
}

impl Collector {
    pub fn new(
        registry: Registry,
        runtime: Arc<dyn ContainerRuntime>,
        interval: Duration,
        failure_threshold: u32,
        build_timeout: Duration,
    ) -> Self {
        Collector {
            registry,
            runtime,
            interval,
            failure_threshold,
            build_deadline: chrono::Duration::seconds(build_timeout.as_secs() as i64),
            failures: HashMap::new(),
        }
    }

    /// Poll until `shutdown` flips. One pass per interval.
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) {
        info!(interval_secs = self.interval.as_secs(), "collector started");
        while !shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.poll_once().await {
                warn!(error = %e, "collector pass failed");
            }
            let mut remaining = self.interval;
            while remaining > Duration::ZERO && !shutdown.load(Ordering::SeqCst) {
                let step = remaining.min(Duration::from_millis(250));
                tokio::time::sleep(step).await;
                remaining -= step;
            }
        }
        info!("collector stopped");
    }

    /// One pass over every active record.
    pub async fn poll_once(&mut self) -> Result<()> {
        for record in self.registry.list_active()? {
            if let Err(e) = self.poll_bot(&record).await {
                warn!(bot_id = %record.bot_id, error = %e, "poll failed");
            }
        }
        Ok(())
    }

    async fn poll_bot(&mut self, record: &ContainerRecord) -> Result<()> {
        let Some(container_id) = record.container_id.as_deref() else {
            // No container yet. A deploy may be mid-build; give it until the
            // build deadline before declaring the record stuck.
            if record.observed_state == BotState::Building
                && Utc::now() - record.updated_at > self.build_deadline
            {
                self.registry
                    .set_error(&record.bot_id, "build did not complete")?;
            }
            return Ok(());
        };

        match self.runtime.inspect(container_id).await {
            Ok(status) => {
                self.failures.remove(&record.bot_id);
                self.registry
                    .set_usage(&record.bot_id, status.mem_mib, status.cpu_percent)?;
                self.apply_observation(record, status.run_state)?;
            }
            Err(e) => {
                // A single transient failure must not flap the record; only
                // a run of them flips observed state to error.
                let count = self.failures.entry(record.bot_id.clone()).or_insert(0);
                *count += 1;
                debug!(bot_id = %record.bot_id, failures = *count, error = %e, "inspect failed");
                if *count >= self.failure_threshold {
                    self.failures.remove(&record.bot_id);
                    self.registry
                        .set_error(&record.bot_id, &format!("status poll failed: {}", e))?;
                }
            }
        }
        Ok(())
    }

    /// Reconcile an observed runtime state into the registry. Desired state
    /// is never touched here.
    fn apply_observation(&mut self, record: &ContainerRecord, run_state: RunState) -> Result<()> {
        use crate::bot::DesiredState;

        debug!(bot_id = %record.bot_id, observed = run_state.as_str(), "runtime observation");
        match run_state {
            RunState::Running => {
                // A stop is in flight when observed is `stopping`; leave it
                // for the supervisor to finish.
                if record.observed_state != BotState::Stopping
                    && record.observed_state != BotState::Running
                {
                    self.registry.set_state(&record.bot_id, BotState::Running)?;
                }
            }
            RunState::Restarting => {
                if record.observed_state != BotState::Starting {
                    self.registry.set_state(&record.bot_id, BotState::Starting)?;
                }
            }
            RunState::Created | RunState::Paused => {}
            RunState::Exited | RunState::Dead => {
                if record.desired_state == DesiredState::Stopped {
                    if record.observed_state != BotState::Stopped {
                        self.registry.set_state(&record.bot_id, BotState::Stopped)?;
                    }
                } else {
                    // Desired running but the container is down: debounce the
                    // same way as failed polls before declaring it dead.
                    let count = self.failures.entry(record.bot_id.clone()).or_insert(0);
                    *count += 1;
                    if *count >= self.failure_threshold {
                        self.failures.remove(&record.bot_id);
                        self.registry
                            .set_error(&record.bot_id, "container exited unexpectedly")?;
                    }
                }
            }
        }
        Ok(())
    }
}
