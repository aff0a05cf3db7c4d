//! The registry is the authoritative, durable mapping from bot identity to
//! container identity and lifecycle state. All supervisor reads and writes
//! go through it; it survives process restarts.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};

use crate::bot::{Bot, BotState, DesiredState, Platform, ResourceLimits};
use crate::error::{Result, SupervisorError};

/// Per-bot state row held by the registry.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub bot_id: String,
    pub tenant_id: String,
    pub name: String,
    pub platform: Platform,
    pub limits: ResourceLimits,
    pub container_id: Option<String>,
    pub health_port: u16,
    pub desired_state: DesiredState,
    pub observed_state: BotState,
    pub last_error: Option<String>,
    pub mem_usage_mib: Option<f64>,
    pub cpu_usage_percent: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One audit row per deploy/control operation. Append-only.
#[derive(Debug, Clone)]
pub struct DeploymentAttempt {
    pub id: i64,
    pub bot_id: String,
    pub action: String,
    pub from_state: String,
    pub to_state: String,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Registry {
    conn: Arc<Mutex<Connection>>,
    quota: u32,
}

impl Registry {
    /// Open (or create) the registry database at `path`.
    pub fn open(path: &Path, quota: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn, quota)
    }

    /// In-memory registry; state dies with the process.
    #[cfg(test)]
    pub fn open_in_memory(quota: u32) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, quota)
    }

    fn from_connection(conn: Connection, quota: u32) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bots (
                bot_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                platform TEXT NOT NULL,
                memory_mib INTEGER NOT NULL,
                cpus REAL NOT NULL,
                storage_mib INTEGER NOT NULL,
                container_id TEXT,
                health_port INTEGER NOT NULL,
                desired_state TEXT NOT NULL,
                observed_state TEXT NOT NULL,
                last_error TEXT,
                mem_usage_mib REAL,
                cpu_usage_percent REAL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_bots_tenant ON bots(tenant_id);
            CREATE TABLE IF NOT EXISTS deployment_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bot_id TEXT NOT NULL,
                action TEXT NOT NULL,
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                error TEXT,
                at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attempts_bot ON deployment_attempts(bot_id, id);",
        )?;
        Ok(Registry {
            conn: Arc::new(Mutex::new(conn)),
            quota,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit a new bot for a tenant. Quota check and insert run in one
    /// transaction, so two concurrent reservations cannot both slip under
    /// the limit or claim the same identifier.
    pub fn reserve(&self, bot: &Bot, health_port: u16) -> Result<ContainerRecord> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let active: u32 = tx.query_row(
            "SELECT COUNT(*) FROM bots WHERE tenant_id = ?1",
            params![bot.tenant_id],
            |row| row.get(0),
        )?;
        if active >= self.quota {
            return Err(SupervisorError::QuotaExceeded {
                tenant: bot.tenant_id.clone(),
                limit: self.quota,
            });
        }

        let exists: Option<String> = tx
            .query_row(
                "SELECT bot_id FROM bots WHERE bot_id = ?1",
                params![bot.id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(SupervisorError::InvalidInput(format!(
                "bot '{}' already exists",
                bot.id
            )));
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO bots (bot_id, tenant_id, name, platform, memory_mib, cpus,
                storage_mib, container_id, health_port, desired_state, observed_state,
                last_error, mem_usage_mib, cpu_usage_percent, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, ?9, ?10, NULL, NULL, NULL, ?11, ?11)",
            params![
                bot.id,
                bot.tenant_id,
                bot.name,
                bot.platform.as_str(),
                bot.limits.memory_mib,
                bot.limits.cpus,
                bot.limits.storage_mib,
                health_port,
                DesiredState::Running.as_str(),
                BotState::Building.as_str(),
                now,
            ],
        )?;
        tx.commit()?;
        drop(conn);

        self.get(&bot.id)
    }

    /// Attach the runtime-assigned container id after a successful create.
    pub fn bind(&self, bot_id: &str, container_id: &str) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE bots SET container_id = ?2, updated_at = ?3 WHERE bot_id = ?1",
            params![bot_id, container_id, Utc::now().to_rfc3339()],
        )?;
        ensure_found(changed, bot_id)
    }

    /// Record a new observed state. Leaving `error` clears the retained
    /// message; entering it goes through `set_error` so a message is
    /// always attached.
    pub fn set_state(&self, bot_id: &str, observed: BotState) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE bots SET observed_state = ?2,
                last_error = CASE WHEN ?2 = 'error' THEN last_error ELSE NULL END,
                updated_at = ?3
             WHERE bot_id = ?1",
            params![bot_id, observed.as_str(), Utc::now().to_rfc3339()],
        )?;
        ensure_found(changed, bot_id)
    }

    /// Flip observed state to `error`, retaining the message for the next
    /// `status` query.
    pub fn set_error(&self, bot_id: &str, message: &str) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE bots SET observed_state = 'error', last_error = ?2, updated_at = ?3
             WHERE bot_id = ?1",
            params![bot_id, message, Utc::now().to_rfc3339()],
        )?;
        ensure_found(changed, bot_id)
    }

    pub fn set_desired(&self, bot_id: &str, desired: DesiredState) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE bots SET desired_state = ?2, updated_at = ?3 WHERE bot_id = ?1",
            params![bot_id, desired.as_str(), Utc::now().to_rfc3339()],
        )?;
        ensure_found(changed, bot_id)
    }

    /// Last-observed resource usage, refreshed by the collector.
    pub fn set_usage(&self, bot_id: &str, mem_mib: Option<f64>, cpu_percent: Option<f64>) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE bots SET mem_usage_mib = ?2, cpu_usage_percent = ?3, updated_at = ?4
             WHERE bot_id = ?1",
            params![bot_id, mem_mib, cpu_percent, Utc::now().to_rfc3339()],
        )?;
        ensure_found(changed, bot_id)
    }

    pub fn get(&self, bot_id: &str) -> Result<ContainerRecord> {
        self.conn()
            .query_row(
                &format!("{} WHERE bot_id = ?1", SELECT_RECORD),
                params![bot_id],
                row_to_record,
            )
            .optional()?
            .ok_or_else(|| SupervisorError::NotFound(bot_id.to_string()))
    }

    pub fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<ContainerRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE tenant_id = ?1 ORDER BY created_at",
            SELECT_RECORD
        ))?;
        let rows = stmt.query_map(params![tenant_id], row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Records the collector watches: everything not sitting idle in a
    /// terminal state with no interest in running.
    pub fn list_active(&self) -> Result<Vec<ContainerRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE desired_state = 'running' OR observed_state NOT IN ('stopped', 'error')
             ORDER BY created_at",
            SELECT_RECORD
        ))?;
        let rows = stmt.query_map([], row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete a bot's record. Only legal from a terminal state; the audit
    /// trail in `deployment_attempts` is kept.
    pub fn release(&self, bot_id: &str) -> Result<()> {
        let record = self.get(bot_id)?;
        if !record.observed_state.is_terminal() {
            return Err(SupervisorError::InvalidTransition {
                from: record.observed_state.as_str(),
                action: "remove",
            });
        }
        self.conn()
            .execute("DELETE FROM bots WHERE bot_id = ?1", params![bot_id])?;
        Ok(())
    }

    /// Append one audit row. Rows are never updated or deleted.
    pub fn record_attempt(
        &self,
        bot_id: &str,
        action: &str,
        from_state: &str,
        to_state: &str,
        error: Option<&str>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO deployment_attempts (bot_id, action, from_state, to_state, error, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![bot_id, action, from_state, to_state, error, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Most recent attempts for a bot, newest first.
    pub fn attempts(&self, bot_id: &str, limit: usize) -> Result<Vec<DeploymentAttempt>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, bot_id, action, from_state, to_state, error, at
             FROM deployment_attempts WHERE bot_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![bot_id, limit as i64], |row| {
            Ok(DeploymentAttempt {
                id: row.get(0)?,
                bot_id: row.get(1)?,
                action: row.get(2)?,
                from_state: row.get(3)?,
                to_state: row.get(4)?,
                error: row.get(5)?,
                at: parse_ts(row.get::<_, String>(6)?, 6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

const SELECT_RECORD: &str = "SELECT bot_id, tenant_id, name, platform, memory_mib, cpus,
    storage_mib, container_id, health_port, desired_state, observed_state,
    last_error, mem_usage_mib, cpu_usage_percent, created_at, updated_at FROM bots";

fn ensure_found(changed: usize, bot_id: &str) -> Result<()> {
    if changed == 0 {
        return Err(SupervisorError::NotFound(bot_id.to_string()));
    }
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContainerRecord> {
    let platform: String = row.get(3)?;
    let desired: String = row.get(9)?;
    let observed: String = row.get(10)?;
    Ok(ContainerRecord {
        bot_id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        platform: Platform::from_str(&platform)
            .ok_or_else(|| conversion_error(3, &platform))?,
        limits: ResourceLimits {
            memory_mib: row.get(4)?,
            cpus: row.get(5)?,
            storage_mib: row.get(6)?,
        },
        container_id: row.get(7)?,
        health_port: row.get::<_, i64>(8)? as u16,
        desired_state: DesiredState::from_str(&desired)
            .ok_or_else(|| conversion_error(9, &desired))?,
        observed_state: BotState::from_str(&observed)
            .ok_or_else(|| conversion_error(10, &observed))?,
        last_error: row.get(11)?,
        mem_usage_mib: row.get(12)?,
        cpu_usage_percent: row.get(13)?,
        created_at: parse_ts(row.get::<_, String>(14)?, 14)?,
        updated_at: parse_ts(row.get::<_, String>(15)?, 15)?,
    })
}

fn parse_ts(raw: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e))
        })
}

fn conversion_error(column: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        Type::Text,
        format!("unrecognized value: {:?}", value).into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DB_SEQ: AtomicUsize = AtomicUsize::new(0);

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!(
            "warden-registry-test-{}-{}.db",
            std::process::id(),
            DB_SEQ.fetch_add(1, Ordering::SeqCst)
        ))
    }

    fn sample_bot(id: &str, tenant: &str) -> Bot {
        Bot {
            id: id.to_string(),
            tenant_id: tenant.to_string(),
            name: id.to_string(),
            platform: Platform::Linux,
            limits: ResourceLimits::default(),
        }
    }

    #[test]
    fn reserve_and_get_round_trip() {
        let registry = Registry::open_in_memory(3).unwrap();
        let record = registry.reserve(&sample_bot("weather", "t1"), 8200).unwrap();
        assert_eq!(record.observed_state, BotState::Building);
        assert_eq!(record.desired_state, DesiredState::Running);
        assert_eq!(record.health_port, 8200);
        assert!(record.container_id.is_none());

        let fetched = registry.get("weather").unwrap();
        assert_eq!(fetched.tenant_id, "t1");
        assert_eq!(fetched.platform, Platform::Linux);
    }

    #[test]
    fn duplicate_reserve_is_rejected() {
        let registry = Registry::open_in_memory(3).unwrap();
        registry.reserve(&sample_bot("weather", "t1"), 8200).unwrap();
        let err = registry
            .reserve(&sample_bot("weather", "t1"), 8200)
            .unwrap_err();
        assert_eq!(err.error_code(), "invalid_input");
    }

    #[test]
    fn quota_is_enforced_at_reserve() {
        let registry = Registry::open_in_memory(3).unwrap();
        for i in 0..3 {
            registry
                .reserve(&sample_bot(&format!("bot-{}", i), "t1"), 8200)
                .unwrap();
        }
        let err = registry
            .reserve(&sample_bot("bot-3", "t1"), 8200)
            .unwrap_err();
        assert_eq!(err.error_code(), "quota_exceeded");

        // Another tenant is unaffected.
        registry.reserve(&sample_bot("other", "t2"), 8200).unwrap();
        assert!(registry.list_by_tenant("t1").unwrap().len() <= 3);
    }

    #[test]
    fn release_requires_terminal_state() {
        let registry = Registry::open_in_memory(3).unwrap();
        registry.reserve(&sample_bot("weather", "t1"), 8200).unwrap();

        let err = registry.release("weather").unwrap_err();
        assert_eq!(err.error_code(), "invalid_transition");

        registry.set_state("weather", BotState::Stopped).unwrap();
        registry.release("weather").unwrap();
        assert_eq!(registry.get("weather").unwrap_err().error_code(), "not_found");
    }

    #[test]
    fn mapping_survives_reopen() {
        let path = temp_db_path();
        {
            let registry = Registry::open(&path, 3).unwrap();
            let record = registry.reserve(&sample_bot("weather", "t1"), 8200).unwrap();
            registry.bind("weather", "cid-123").unwrap();
            registry.set_state("weather", BotState::Running).unwrap();
            assert!(record.container_id.is_none());
        }
        {
            let registry = Registry::open(&path, 3).unwrap();
            let record = registry.get("weather").unwrap();
            assert_eq!(record.container_id.as_deref(), Some("cid-123"));
            assert_eq!(record.observed_state, BotState::Running);
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn set_error_retains_message_until_next_good_state() {
        let registry = Registry::open_in_memory(3).unwrap();
        registry.reserve(&sample_bot("weather", "t1"), 8200).unwrap();

        registry.set_error("weather", "create blew up").unwrap();
        let record = registry.get("weather").unwrap();
        assert_eq!(record.observed_state, BotState::Error);
        assert_eq!(record.last_error.as_deref(), Some("create blew up"));

        registry.set_state("weather", BotState::Running).unwrap();
        let record = registry.get("weather").unwrap();
        assert!(record.last_error.is_none());
    }

    #[test]
    fn usage_updates_are_readable() {
        let registry = Registry::open_in_memory(3).unwrap();
        registry.reserve(&sample_bot("weather", "t1"), 8200).unwrap();
        registry.set_usage("weather", Some(42.5), Some(3.2)).unwrap();
        let record = registry.get("weather").unwrap();
        assert_eq!(record.mem_usage_mib, Some(42.5));
        assert_eq!(record.cpu_usage_percent, Some(3.2));
    }

    #[test]
    fn attempts_are_append_only_and_ordered() {
        let registry = Registry::open_in_memory(3).unwrap();
        registry.reserve(&sample_bot("weather", "t1"), 8200).unwrap();
        registry
            .record_attempt("weather", "deploy", "absent", "running", None)
            .unwrap();
        registry
            .record_attempt("weather", "stop", "running", "stopped", None)
            .unwrap();
        registry
            .record_attempt("weather", "start", "stopped", "error", Some("boom"))
            .unwrap();

        let attempts = registry.attempts("weather", 10).unwrap();
        assert_eq!(attempts.len(), 3);
        // Newest first.
        assert_eq!(attempts[0].action, "start");
        assert_eq!(attempts[0].error.as_deref(), Some("boom"));
        assert_eq!(attempts[2].action, "deploy");
        assert!(attempts[0].id > attempts[1].id);
    }

    #[test]
    fn attempts_survive_release() {
        let registry = Registry::open_in_memory(3).unwrap();
        registry.reserve(&sample_bot("weather", "t1"), 8200).unwrap();
        registry
            .record_attempt("weather", "deploy", "absent", "error", Some("boom"))
            .unwrap();
        registry.set_state("weather", BotState::Error).unwrap();
        registry.set_error("weather", "boom").unwrap();
        registry.release("weather").unwrap();
        assert_eq!(registry.attempts("weather", 10).unwrap().len(), 1);
    }

    #[test]
    fn list_active_excludes_parked_bots() {
        let registry = Registry::open_in_memory(5).unwrap();
        registry.reserve(&sample_bot("a", "t1"), 8200).unwrap();
        registry.reserve(&sample_bot("b", "t1"), 8201).unwrap();

        registry.set_state("b", BotState::Stopped).unwrap();
        registry.set_desired("b", DesiredState::Stopped).unwrap();

        let active: Vec<String> = registry
            .list_active()
            .unwrap()
            .into_iter()
            .map(|r| r.bot_id)
            .collect();
        assert!(active.contains(&"a".to_string()));
        assert!(!active.contains(&"b".to_string()));
    }

    #[test]
    fn set_state_on_unknown_bot_is_not_found() {
        let registry = Registry::open_in_memory(3).unwrap();
        let err = registry.set_state("ghost", BotState::Running).unwrap_err();
        assert_eq!(err.error_code(), "not_found");
    }
}
