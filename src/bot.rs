//! Data model for supervised bots: identity, platform targets, resource
//! limits, and the lifecycle state machine the supervisor enforces.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Prefix for supervised containers: "warden-bot-<id>".
pub const CONTAINER_PREFIX: &str = "warden-bot-";

/// Host port range for per-bot health sidecar mappings: 8192-9215.
pub const HEALTH_PORT_MIN: u16 = 8192;
pub const HEALTH_PORT_MAX: u16 = 9215;
pub const HEALTH_PORT_RANGE: u16 = HEALTH_PORT_MAX - HEALTH_PORT_MIN + 1;

/// Declared target platform. Closed set; each maps to a base image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Android,
    Windows,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Android => "android",
            Platform::Windows => "windows",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "linux" => Some(Platform::Linux),
            "android" => Some(Platform::Android),
            "windows" => Some(Platform::Windows),
            _ => None,
        }
    }

    /// Base image the builder starts from for this target.
    pub fn base_image(&self) -> &'static str {
        match self {
            Platform::Linux => "python:3.11-slim",
            Platform::Android => "python:3.11-alpine",
            Platform::Windows => "python:3.11-windowsservercore-ltsc2022",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource ceilings passed to the runtime at create time. Never unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mib: u64,
    pub cpus: f64,
    pub storage_mib: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits {
            memory_mib: 256,
            cpus: 0.5,
            storage_mib: 512,
        }
    }
}

impl ResourceLimits {
    /// Basic sanity bounds; the runtime enforces the actual ceilings.
    pub fn validate(&self) -> Result<(), String> {
        if self.memory_mib < 16 || self.memory_mib > 16384 {
            return Err(format!(
                "memory limit {} MiB outside supported range 16-16384",
                self.memory_mib
            ));
        }
        if !(self.cpus > 0.0 && self.cpus <= 8.0) {
            return Err(format!("cpu limit {} outside supported range (0, 8]", self.cpus));
        }
        if self.storage_mib < 16 || self.storage_mib > 65536 {
            return Err(format!(
                "storage limit {} MiB outside supported range 16-65536",
                self.storage_mib
            ));
        }
        Ok(())
    }
}

/// What the tenant wants the bot to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Running,
    Stopped,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Running => "running",
            DesiredState::Stopped => "stopped",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "running" => Some(DesiredState::Running),
            "stopped" => Some(DesiredState::Stopped),
            _ => None,
        }
    }
}

/// Observed lifecycle state:
/// absent -> building -> starting -> running <-> stopping -> stopped -> (removed),
/// with `error` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotState {
    Building,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl BotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotState::Building => "building",
            BotState::Starting => "starting",
            BotState::Running => "running",
            BotState::Stopping => "stopping",
            BotState::Stopped => "stopped",
            BotState::Error => "error",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "building" => Some(BotState::Building),
            "starting" => Some(BotState::Starting),
            "running" => Some(BotState::Running),
            "stopping" => Some(BotState::Stopping),
            "stopped" => Some(BotState::Stopped),
            "error" => Some(BotState::Error),
            _ => None,
        }
    }

    /// Terminal states are the only ones a record may be released from.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BotState::Stopped | BotState::Error)
    }

    /// Whether `action` is legal from this state. Transitional states
    /// (`building`, `starting`, `stopping`) accept only `stop` where a
    /// container already exists to act on.
    pub fn permits(&self, action: ControlAction) -> bool {
        match action {
            ControlAction::Start => matches!(self, BotState::Stopped | BotState::Error),
            ControlAction::Stop => matches!(self, BotState::Running | BotState::Starting),
            ControlAction::Restart => {
                matches!(self, BotState::Running | BotState::Stopped | BotState::Error)
            }
            ControlAction::Remove => self.is_terminal(),
        }
    }
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tenant-requested lifecycle actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Start,
    Stop,
    Restart,
    Remove,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Start => "start",
            ControlAction::Stop => "stop",
            ControlAction::Restart => "restart",
            ControlAction::Remove => "remove",
        }
    }
}

/// A tenant-owned bot as accepted by `deploy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub platform: Platform,
    pub limits: ResourceLimits,
}

/// Sanitize a caller-supplied identifier for use in container and image
/// names (docker allows [a-zA-Z0-9][a-zA-Z0-9_.-]*).
pub fn sanitize_bot_id(raw: &str) -> String {
    let safe: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    safe.trim_matches(|c| c == '-' || c == '_' || c == '.')
        .to_ascii_lowercase()
}

/// Container name for a bot: "warden-bot-<id>".
pub fn container_name(bot_id: &str) -> String {
    format!("{}{}", CONTAINER_PREFIX, bot_id)
}

/// Image tag for a bot's built image. Rebuilding replaces the prior image.
pub fn image_tag(bot_id: &str) -> String {
    format!("warden/{}:latest", bot_id)
}

/// Deterministic host port for a bot's health sidecar, hash-allocated in
/// [HEALTH_PORT_MIN, HEALTH_PORT_MAX].
pub fn health_port(bot_id: &str) -> u16 {
    let mut hasher = DefaultHasher::new();
    bot_id.hash(&mut hasher);
    let hash = hasher.finish() as u16;
    HEALTH_PORT_MIN + (hash % HEALTH_PORT_RANGE)
}

/// Basic shape check for a Telegram bot token: "<numeric id>:<secret>".
/// The supervisor never parses the token beyond this.
pub fn token_shape_ok(token: &str) -> bool {
    let Some((id, secret)) = token.split_once(':') else {
        return false;
    };
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    secret.len() >= 20
        && secret
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
