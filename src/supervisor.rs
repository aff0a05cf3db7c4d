//! Supervisor façade: the single entry point the surrounding application
//! calls. Validates input, enforces quota and the lifecycle state machine,
//! serializes operations per bot id, delegates to the builder and runtime
//! driver, and keeps the registry and audit trail current.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use crate::bot::{
    container_name, health_port, sanitize_bot_id, token_shape_ok, Bot, BotState, ControlAction,
    DesiredState, Platform, ResourceLimits,
};
use crate::builder::ImageBuilder;
use crate::collector::{aggregate, snapshot_for, AggregateMetrics, MetricsSnapshot};
use crate::docker::ContainerRuntime;
use crate::error::{Result, SupervisorError};
use crate::registry::{ContainerRecord, DeploymentAttempt, Registry};

/// Environment variable the bot token is passed through as. The supervisor
/// never parses the token beyond the shape check.
const TOKEN_ENV: &str = "TELEGRAM_BOT_TOKEN";

/// A deploy request as accepted from the outside.
#[derive(Debug, Clone)]
pub struct DeploySpec {
    /// Caller-chosen identifier; generated when absent.
    pub id: Option<String>,
    pub name: String,
    pub platform: Platform,
    pub limits: ResourceLimits,
    pub token: String,
}

pub struct Supervisor {
    registry: Registry,
    runtime: Arc<dyn ContainerRuntime>,
    builder: ImageBuilder,
    http: reqwest::Client,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Supervisor {
    pub fn new(registry: Registry, runtime: Arc<dyn ContainerRuntime>, builder: ImageBuilder) -> Self {
        Supervisor {
            registry,
            runtime,
            builder,
            http: reqwest::Client::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Per-bot mutation lock: lifecycle operations for one bot id are
    /// serialized; operations on distinct bots proceed concurrently.
    async fn bot_lock(&self, bot_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(bot_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Build, create, and start a new bot. On return the bot is `running`,
    /// or the error has been recorded and the record left in `error`.
    pub async fn deploy(
        &self,
        tenant_id: &str,
        spec: DeploySpec,
        script: &[u8],
        manifest: Option<&[u8]>,
    ) -> Result<ContainerRecord> {
        // Validation precedes any registry mutation.
        if tenant_id.trim().is_empty() {
            return Err(SupervisorError::InvalidInput("tenant id is empty".to_string()));
        }
        if spec.name.trim().is_empty() {
            return Err(SupervisorError::InvalidInput("bot name is empty".to_string()));
        }
        if script.is_empty() {
            return Err(SupervisorError::InvalidInput("bot script is empty".to_string()));
        }
        if !token_shape_ok(&spec.token) {
            return Err(SupervisorError::InvalidInput(
                "bot token does not look like a Telegram token".to_string(),
            ));
        }
        spec.limits.validate().map_err(SupervisorError::InvalidInput)?;

        let bot_id = match &spec.id {
            Some(raw) => {
                let id = sanitize_bot_id(raw);
                if id.is_empty() {
                    return Err(SupervisorError::InvalidInput(format!(
                        "bot id '{}' has no usable characters",
                        raw
                    )));
                }
                id
            }
            None => Uuid::new_v4().to_string(),
        };

        let lock = self.bot_lock(&bot_id).await;
        let _guard = lock.lock().await;

        let bot = Bot {
            id: bot_id.clone(),
            tenant_id: tenant_id.to_string(),
            name: spec.name.clone(),
            platform: spec.platform,
            limits: spec.limits,
        };
        let port = health_port(&bot_id);
        self.registry.reserve(&bot, port)?;
        info!(bot_id = %bot_id, tenant = %tenant_id, "deploy accepted");

        let image = match self
            .builder
            .prepare(&bot_id, spec.platform, script, manifest)
            .await
        {
            Ok(image) => image,
            Err(e) => return self.fail_deploy(&bot_id, "building", e),
        };

        let env = vec![
            (TOKEN_ENV.to_string(), spec.token.clone()),
            ("BOT_NAME".to_string(), spec.name.clone()),
        ];
        let container_id = match self
            .runtime
            .create(image.as_str(), &container_name(&bot_id), &spec.limits, &env, port)
            .await
        {
            Ok(id) => id,
            Err(e) => return self.fail_deploy(&bot_id, "building", e),
        };
        self.registry.bind(&bot_id, &container_id)?;
        self.registry.set_state(&bot_id, BotState::Starting)?;

        if let Err(e) = self.runtime.start(&container_id).await {
            return self.fail_deploy(&bot_id, "starting", e);
        }
        self.registry.set_state(&bot_id, BotState::Running)?;
        self.registry
            .record_attempt(&bot_id, "deploy", "absent", "running", None)?;
        info!(bot_id = %bot_id, container_id = %container_id, "bot running");

        self.registry.get(&bot_id)
    }

    fn fail_deploy(
        &self,
        bot_id: &str,
        from: &str,
        cause: SupervisorError,
    ) -> Result<ContainerRecord> {
        error!(bot_id = %bot_id, error = %cause, "deploy failed");
        self.registry.set_error(bot_id, &cause.to_string())?;
        self.registry
            .record_attempt(bot_id, "deploy", from, "error", Some(&cause.to_string()))?;
        Err(cause)
    }

    /// Apply a lifecycle action to an existing bot.
    pub async fn control(&self, bot_id: &str, action: ControlAction) -> Result<()> {
        let lock = self.bot_lock(bot_id).await;
        let _guard = lock.lock().await;

        let record = self.registry.get(bot_id)?;
        let from = record.observed_state;
        if !from.permits(action) {
            let err = SupervisorError::InvalidTransition {
                from: from.as_str(),
                action: action.as_str(),
            };
            self.registry.record_attempt(
                bot_id,
                action.as_str(),
                from.as_str(),
                from.as_str(),
                Some(&err.to_string()),
            )?;
            return Err(err);
        }

        let outcome = self.apply_action(&record, action).await;
        match &outcome {
            Ok(to) => {
                self.registry
                    .record_attempt(bot_id, action.as_str(), from.as_str(), to, None)?;
                info!(bot_id = %bot_id, action = action.as_str(), to = %to, "control applied");
            }
            Err(e) => {
                // Remove of an already-released record must not resurrect it.
                if action != ControlAction::Remove {
                    self.registry.set_error(bot_id, &e.to_string())?;
                }
                self.registry.record_attempt(
                    bot_id,
                    action.as_str(),
                    from.as_str(),
                    "error",
                    Some(&e.to_string()),
                )?;
                error!(bot_id = %bot_id, action = action.as_str(), error = %e, "control failed");
            }
        }
        outcome.map(|_| ())
    }

    async fn apply_action(
        &self,
        record: &ContainerRecord,
        action: ControlAction,
    ) -> Result<&'static str> {
        let bot_id = record.bot_id.as_str();
        match action {
            ControlAction::Start => {
                let container_id = require_container(record)?;
                self.registry.set_state(bot_id, BotState::Starting)?;
                self.runtime.start(container_id).await?;
                self.registry.set_state(bot_id, BotState::Running)?;
                self.registry.set_desired(bot_id, DesiredState::Running)?;
                Ok("running")
            }
            ControlAction::Stop => {
                let container_id = require_container(record)?;
                self.registry.set_state(bot_id, BotState::Stopping)?;
                self.runtime.stop(container_id).await?;
                self.registry.set_state(bot_id, BotState::Stopped)?;
                self.registry.set_desired(bot_id, DesiredState::Stopped)?;
                Ok("stopped")
            }
            ControlAction::Restart => {
                let container_id = require_container(record)?;
                self.registry.set_state(bot_id, BotState::Starting)?;
                self.runtime.restart(container_id).await?;
                self.registry.set_state(bot_id, BotState::Running)?;
                self.registry.set_desired(bot_id, DesiredState::Running)?;
                Ok("running")
            }
            ControlAction::Remove => {
                if let Some(container_id) = record.container_id.as_deref() {
                    match self.runtime.remove(container_id).await {
                        // Already gone is fine; remove is idempotent.
                        Ok(()) | Err(SupervisorError::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                self.registry.release(bot_id)?;
                Ok("removed")
            }
        }
    }

    pub fn status(&self, bot_id: &str) -> Result<ContainerRecord> {
        self.registry.get(bot_id)
    }

    pub fn list(&self, tenant_id: &str) -> Result<Vec<ContainerRecord>> {
        self.registry.list_by_tenant(tenant_id)
    }

    /// Recent log lines. Empty when nothing has been created yet.
    pub async fn logs(&self, bot_id: &str, lines: usize) -> Result<Vec<String>> {
        let record = self.registry.get(bot_id)?;
        match record.container_id.as_deref() {
            Some(container_id) => self.runtime.logs(container_id, lines).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn metrics(&self, bot_id: &str) -> Result<MetricsSnapshot> {
        let record = self.registry.get(bot_id)?;
        snapshot_for(&record, self.runtime.as_ref(), &self.http).await
    }

    /// Per-bot snapshots for a tenant plus the fleet rollup. A bot whose
    /// snapshot fails is reported through its registry state instead of
    /// failing the whole call.
    pub async fn metrics_all(
        &self,
        tenant_id: &str,
    ) -> Result<(Vec<MetricsSnapshot>, AggregateMetrics)> {
        let mut snapshots = Vec::new();
        for record in self.registry.list_by_tenant(tenant_id)? {
            match snapshot_for(&record, self.runtime.as_ref(), &self.http).await {
                Ok(snap) => snapshots.push(snap),
                Err(e) => {
                    error!(bot_id = %record.bot_id, error = %e, "metrics snapshot failed");
                    snapshots.push(MetricsSnapshot {
                        bot_id: record.bot_id.clone(),
                        state: record.observed_state,
                        uptime_secs: None,
                        mem_mib: record.mem_usage_mib,
                        cpu_percent: record.cpu_usage_percent,
                        message_count: 0,
                        error_count: 0,
                        from_sidecar: false,
                    });
                }
            }
        }
        let agg = aggregate(&snapshots);
        Ok((snapshots, agg))
    }

    /// Audit trail for a bot, newest first. Survives removal.
    pub fn history(&self, bot_id: &str, limit: usize) -> Result<Vec<DeploymentAttempt>> {
        self.registry.attempts(bot_id, limit)
    }
}

fn require_container(record: &ContainerRecord) -> Result<&str> {
    record.container_id.as_deref().ok_or_else(|| SupervisorError::Runtime {
        operation: "start",
        message: format!("bot '{}' has no container; redeploy it", record.bot_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::testing::MockRuntime;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const TOKEN: &str = "123456789:AAH8x-_abcdefghijklmnopqrs";

    fn spec(id: &str) -> DeploySpec {
        DeploySpec {
            id: Some(id.to_string()),
            name: id.to_string(),
            platform: Platform::Linux,
            limits: ResourceLimits::default(),
            token: TOKEN.to_string(),
        }
    }

    fn supervisor_with(runtime: Arc<MockRuntime>, quota: u32) -> Supervisor {
        let registry = Registry::open_in_memory(quota).unwrap();
        // `true` stands in for the runtime CLI: every build succeeds.
        let builder = ImageBuilder::new("true", Duration::from_secs(5));
        Supervisor::new(registry, runtime, builder)
    }

    #[tokio::test]
    async fn deploy_leaves_bot_running() {
        let runtime = Arc::new(MockRuntime::default());
        let sup = supervisor_with(runtime.clone(), 3);

        let record = sup
            .deploy("t1", spec("weather"), b"print('hi')", None)
            .await
            .unwrap();
        assert_eq!(record.observed_state, BotState::Running);
        assert_eq!(record.desired_state, DesiredState::Running);
        assert!(record.container_id.is_some());
        assert_eq!(runtime.create_calls.load(Ordering::SeqCst), 1);

        let history = sup.history("weather", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, "deploy");
        assert!(history[0].error.is_none());
    }

    #[tokio::test]
    async fn deploy_with_empty_script_mutates_nothing() {
        let runtime = Arc::new(MockRuntime::default());
        let sup = supervisor_with(runtime.clone(), 3);

        let err = sup.deploy("t1", spec("weather"), b"", None).await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_input");
        assert_eq!(sup.status("weather").unwrap_err().error_code(), "not_found");
        assert_eq!(runtime.create_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn deploy_with_bad_token_is_rejected() {
        let sup = supervisor_with(Arc::new(MockRuntime::default()), 3);
        let mut bad = spec("weather");
        bad.token = "not-a-token".to_string();
        let err = sup.deploy("t1", bad, b"print('hi')", None).await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_input");
    }

    #[tokio::test]
    async fn fourth_bot_hits_quota() {
        let sup = supervisor_with(Arc::new(MockRuntime::default()), 3);
        for i in 0..3 {
            sup.deploy("t1", spec(&format!("bot-{}", i)), b"print('hi')", None)
                .await
                .unwrap();
        }
        let err = sup
            .deploy("t1", spec("bot-3"), b"print('hi')", None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "quota_exceeded");
        assert!(sup.list("t1").unwrap().len() <= 3);
    }

    #[tokio::test]
    async fn concurrent_deploys_of_one_id_create_once() {
        let runtime = Arc::new(MockRuntime::default());
        let sup = Arc::new(supervisor_with(runtime.clone(), 3));

        let a = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.deploy("t1", spec("weather"), b"print('hi')", None).await })
        };
        let b = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.deploy("t1", spec("weather"), b"print('hi')", None).await })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert!(a.is_ok() != b.is_ok(), "exactly one deploy must win");
        let loser = if a.is_err() { a } else { b };
        assert_eq!(loser.unwrap_err().error_code(), "invalid_input");
        assert_eq!(runtime.create_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn create_failure_leaves_error_not_building() {
        let runtime = Arc::new(MockRuntime {
            fail_create: true,
            ..Default::default()
        });
        let sup = supervisor_with(runtime, 3);

        let err = sup
            .deploy("t1", spec("weather"), b"print('hi')", None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "runtime_error");

        let record = sup.status("weather").unwrap();
        assert_eq!(record.observed_state, BotState::Error);
        assert!(record.last_error.as_deref().unwrap().contains("create"));
    }

    #[tokio::test]
    async fn start_failure_records_error_state_and_attempt() {
        let runtime = Arc::new(MockRuntime {
            fail_start: true,
            ..Default::default()
        });
        let sup = supervisor_with(runtime, 3);

        let err = sup
            .deploy("t1", spec("weather"), b"print('hi')", None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "runtime_error");
        assert_eq!(sup.status("weather").unwrap().observed_state, BotState::Error);

        let history = sup.history("weather", 10).unwrap();
        assert_eq!(history[0].to_state, "error");
        assert!(history[0].error.is_some());
    }

    #[tokio::test]
    async fn remove_while_running_is_invalid_transition() {
        let sup = supervisor_with(Arc::new(MockRuntime::default()), 3);
        sup.deploy("t1", spec("weather"), b"print('hi')", None)
            .await
            .unwrap();

        let err = sup.control("weather", ControlAction::Remove).await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_transition");
        // Still present and running.
        assert_eq!(sup.status("weather").unwrap().observed_state, BotState::Running);
    }

    #[tokio::test]
    async fn stop_then_start_round_trip() {
        let sup = supervisor_with(Arc::new(MockRuntime::default()), 3);
        sup.deploy("t1", spec("weather"), b"print('hi')", None)
            .await
            .unwrap();

        sup.control("weather", ControlAction::Stop).await.unwrap();
        let record = sup.status("weather").unwrap();
        assert_eq!(record.observed_state, BotState::Stopped);
        assert_eq!(record.desired_state, DesiredState::Stopped);

        sup.control("weather", ControlAction::Start).await.unwrap();
        let record = sup.status("weather").unwrap();
        assert_eq!(record.observed_state, BotState::Running);
        assert_eq!(record.desired_state, DesiredState::Running);
    }

    #[tokio::test]
    async fn stop_then_remove_releases_the_record() {
        let sup = supervisor_with(Arc::new(MockRuntime::default()), 3);
        sup.deploy("t1", spec("weather"), b"print('hi')", None)
            .await
            .unwrap();

        sup.control("weather", ControlAction::Stop).await.unwrap();
        sup.control("weather", ControlAction::Remove).await.unwrap();
        assert_eq!(sup.status("weather").unwrap_err().error_code(), "not_found");

        // Audit trail outlives the record.
        let history = sup.history("weather", 10).unwrap();
        assert!(history.iter().any(|a| a.action == "remove"));
    }

    #[tokio::test]
    async fn control_on_unknown_bot_is_not_found() {
        let sup = supervisor_with(Arc::new(MockRuntime::default()), 3);
        let err = sup.control("ghost", ControlAction::Stop).await.unwrap_err();
        assert_eq!(err.error_code(), "not_found");
    }

    #[tokio::test]
    async fn logs_before_first_create_are_empty() {
        let runtime = Arc::new(MockRuntime {
            fail_create: true,
            ..Default::default()
        });
        let sup = supervisor_with(runtime, 3);
        let _ = sup.deploy("t1", spec("weather"), b"print('hi')", None).await;

        // create failed, so no container was ever bound.
        let lines = sup.logs("weather", 50).await.unwrap();
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn metrics_all_rolls_up_the_fleet() {
        let runtime = Arc::new(MockRuntime::default());
        *runtime.inspect_state.lock().unwrap() = Some(MockRuntime::running_status());
        let sup = supervisor_with(runtime, 3);

        sup.deploy("t1", spec("a"), b"print('hi')", None).await.unwrap();
        sup.deploy("t1", spec("b"), b"print('hi')", None).await.unwrap();

        let (snapshots, agg) = sup.metrics_all("t1").await.unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(agg.bots, 2);
        assert_eq!(agg.running, 2);
    }

    #[tokio::test]
    async fn generated_ids_are_unique() {
        let sup = supervisor_with(Arc::new(MockRuntime::default()), 3);
        let mut anon = spec("ignored");
        anon.id = None;
        let a = sup
            .deploy("t1", anon.clone(), b"print('hi')", None)
            .await
            .unwrap();
        let b = sup.deploy("t1", anon, b"print('hi')", None).await.unwrap();
        assert_ne!(a.bot_id, b.bot_id);
    }
}
