use std::path::PathBuf;
use std::time::Duration;

use crate::support::{clamped_ms, env_string, env_u16, env_u64};

/// Operational knobs for the agent. Constructed once and passed by value
/// into the orchestrator; nothing in the core reads the environment after
/// startup, so tests can build isolated configs per case.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Root under which per-workload directories, caches and the record
    /// store live.
    pub data_root: PathBuf,
    /// Hypervisor CLI binary driving managed-vm instances (WSL-style).
    pub hypervisor_bin: String,
    /// Prefix for hypervisor instance names owned by this agent. Used by
    /// the orphan sweep to tell our instances from the user's own.
    pub instance_prefix: String,
    /// Base download URL for VM base images; `{variant}` is substituted.
    pub image_base_url: String,
    /// Lowest port handed out per namespace when the caller omits one.
    pub game_base_port: u16,
    pub vm_base_port: u16,
    pub bot_base_port: u16,
    /// Grace period between the graceful stop signal and the force kill.
    pub stop_grace: Duration,
    /// Upper bound on waiting for the stop phase during restart/delete.
    pub restart_wait: Duration,
    /// Per-workload console ring capacity.
    pub log_ring_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            hypervisor_bin: "wsl".to_string(),
            instance_prefix: "berth-".to_string(),
            image_base_url: "https://images.berth.dev/base/{variant}.tar.gz".to_string(),
            game_base_port: 30120,
            vm_base_port: 2200,
            bot_base_port: 0,
            stop_grace: Duration::from_secs(8),
            restart_wait: Duration::from_secs(30),
            log_ring_capacity: 500,
        }
    }
}

impl AgentConfig {
    /// Default config with `BERTH_*` environment overrides applied. Values
    /// are clamped to sane ranges rather than rejected.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(root) = env_string("BERTH_DATA_ROOT") {
            cfg.data_root = PathBuf::from(root);
        }
        if let Some(bin) = env_string("BERTH_HYPERVISOR_BIN") {
            cfg.hypervisor_bin = bin;
        }
        if let Some(url) = env_string("BERTH_IMAGE_BASE_URL") {
            cfg.image_base_url = url;
        }
        if let Some(p) = env_u16("BERTH_GAME_BASE_PORT") {
            cfg.game_base_port = p;
        }
        if let Some(p) = env_u16("BERTH_VM_BASE_PORT") {
            cfg.vm_base_port = p;
        }
        if let Some(p) = env_u16("BERTH_BOT_BASE_PORT") {
            cfg.bot_base_port = p;
        }
        cfg.stop_grace = clamped_ms("BERTH_STOP_GRACE_MS", 500, 120_000, 8_000);
        cfg.restart_wait = clamped_ms("BERTH_RESTART_WAIT_MS", 1_000, 10 * 60 * 1000, 30_000);
        if let Some(v) = env_u64("BERTH_LOG_MAX_LINES") {
            cfg.log_ring_capacity = v.clamp(100, 50_000) as usize;
        }
        cfg
    }

    /// Per-workload directory, scoped by id under the data root.
    pub fn workload_dir(&self, id: &str) -> PathBuf {
        self.data_root.join("workloads").join(id)
    }

    /// Shared base-image cache directory.
    pub fn image_cache_dir(&self) -> PathBuf {
        self.data_root.join("cache").join("images")
    }

    /// Hypervisor instance name for a workload id.
    pub fn instance_name(&self, id: &str) -> String {
        format!("{}{id}", self.instance_prefix)
    }
}
