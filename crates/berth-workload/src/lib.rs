//! Shared vocabulary types for the berth control plane.
//!
//! These types cross the boundary between the orchestration core and its
//! collaborators (persistence, notification, transport). They carry no
//! behavior beyond construction and classification helpers; everything that
//! touches a live OS handle lives in `berth-agent`.

use chrono::{DateTime, Utc};

/// Stable workload identifier. Doubles as the per-workload directory name,
/// so it is restricted to filesystem-safe characters at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct WorkloadId(pub String);

impl WorkloadId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for WorkloadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Game family behind the game-process kind. The spawn command and the
/// graceful console shutdown string differ per family; the orchestration
/// logic does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameFamily {
    Fivem,
    Minecraft,
}

impl GameFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameFamily::Fivem => "fivem",
            GameFamily::Minecraft => "minecraft",
        }
    }
}

/// Base OS variant imported into the managed-VM hypervisor layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsVariant {
    Ubuntu,
    Debian,
}

impl OsVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsVariant::Ubuntu => "ubuntu",
            OsVariant::Debian => "debian",
        }
    }
}

/// Interpreter flavor for the interpreted-bot kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotFlavor {
    Node,
    Python,
}

impl BotFlavor {
    /// Interpreter binary probed for and used to spawn the bot.
    pub fn interpreter(&self) -> &'static str {
        match self {
            BotFlavor::Node => "node",
            BotFlavor::Python => "python3",
        }
    }

    pub fn entry_file(&self) -> &'static str {
        match self {
            BotFlavor::Node => "index.js",
            BotFlavor::Python => "main.py",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BotFlavor::Node => "node",
            BotFlavor::Python => "python",
        }
    }
}

/// Closed set of workload kinds. Selected once at the boundary; all
/// kind-specific behavior hangs off this tag through the agent's driver
/// dispatch rather than string comparisons at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkloadKind {
    Game { family: GameFamily },
    ManagedVm,
    Bot,
}

impl WorkloadKind {
    /// Port namespace this kind allocates from. Game families share one
    /// namespace; the VM management port has its own.
    pub fn port_namespace(&self) -> PortNamespace {
        match self {
            WorkloadKind::Game { .. } => PortNamespace::Game,
            WorkloadKind::ManagedVm => PortNamespace::Vm,
            WorkloadKind::Bot => PortNamespace::Bot,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Game { family: GameFamily::Fivem } => "game:fivem",
            WorkloadKind::Game { family: GameFamily::Minecraft } => "game:minecraft",
            WorkloadKind::ManagedVm => "managed_vm",
            WorkloadKind::Bot => "bot",
        }
    }
}

/// Namespaces over which primary ports must be unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortNamespace {
    Game,
    Vm,
    Bot,
}

/// Persisted workload status. This is the single source of truth for which
/// operations are currently legal; live handles never outlive a transition
/// out of Running/Stopping without a matching status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Installing,
    Error,
}

impl WorkloadStatus {
    /// Statuses that imply a live handle. Any record found in one of these
    /// on control-plane startup is forcibly reset to Stopped, since no
    /// handle can have survived the restart.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            WorkloadStatus::Starting | WorkloadStatus::Running | WorkloadStatus::Stopping
        )
    }
}

/// Flat bag of optional, typed, kind-specific configuration. The
/// orchestrator treats this opaquely; only the matching driver interprets
/// the fields it cares about.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WorkloadConfig {
    /// Interpreter flavor (bot kind).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavor: Option<BotFlavor>,
    /// Explicit interpreter path overriding the PATH lookup (bot kind).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_path: Option<String>,
    /// Base OS variant (managed-vm kind).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_variant: Option<OsVariant>,
    /// Generated remote-access credential (managed-vm kind). Overwritten
    /// only on confirmed provisioning/reinstall success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    /// JVM heap cap in MiB (minecraft family).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,
    /// Player capacity written into the generated config (game kinds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_players: Option<u32>,
    /// Upstream version/build string (game kinds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Persistent record describing one hosted workload. Live-only fields
/// (`pid`) are cleared on control-plane startup recovery and never trusted
/// across restarts.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WorkloadRecord {
    pub id: WorkloadId,
    pub tenant_id: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: WorkloadKind,
    pub status: WorkloadStatus,
    pub bind_address: String,
    pub port: u16,
    /// Secondary management port (managed-vm kind only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_port: Option<u16>,
    #[serde(default)]
    pub config: WorkloadConfig,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Live-only: OS process id of the tracked handle, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Which stream a console line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
    System,
}

/// One line in a workload's console ring.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConsoleLogEntry {
    pub at: DateTime<Utc>,
    pub stream: StreamKind,
    pub message: String,
}

impl ConsoleLogEntry {
    pub fn now(stream: StreamKind, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            stream,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workload_id_is_non_empty() {
        let id = WorkloadId::new();
        assert!(!id.0.is_empty());
    }

    #[test]
    fn live_statuses_are_exactly_the_transitional_ones() {
        assert!(WorkloadStatus::Starting.is_live());
        assert!(WorkloadStatus::Running.is_live());
        assert!(WorkloadStatus::Stopping.is_live());
        assert!(!WorkloadStatus::Stopped.is_live());
        assert!(!WorkloadStatus::Installing.is_live());
        assert!(!WorkloadStatus::Error.is_live());
    }

    #[test]
    fn record_round_trips_through_json() {
        let rec = WorkloadRecord {
            id: WorkloadId("w1".to_string()),
            tenant_id: "t1".to_string(),
            name: "Test".to_string(),
            kind: WorkloadKind::Game {
                family: GameFamily::Fivem,
            },
            status: WorkloadStatus::Stopped,
            bind_address: "0.0.0.0".to_string(),
            port: 30120,
            management_port: None,
            config: WorkloadConfig {
                max_players: Some(32),
                ..WorkloadConfig::default()
            },
            created_at: Utc::now(),
            expires_at: None,
            pid: None,
        };

        let json = serde_json::to_string(&rec).unwrap();
        let back: WorkloadRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn kind_namespaces_separate_games_from_vms() {
        let mc = WorkloadKind::Game {
            family: GameFamily::Minecraft,
        };
        let fm = WorkloadKind::Game {
            family: GameFamily::Fivem,
        };
        assert_eq!(mc.port_namespace(), fm.port_namespace());
        assert_ne!(mc.port_namespace(), WorkloadKind::ManagedVm.port_namespace());
    }
}
