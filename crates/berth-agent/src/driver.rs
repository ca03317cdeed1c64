//! Kind-specific behavior behind one interface.
//!
//! The workload kind is resolved to a driver exactly once, at the
//! orchestrator boundary; nothing downstream branches on the kind tag
//! again. Drivers are stateless and read everything they need from the
//! record and the agent wiring.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use berth_workload::{BotFlavor, WorkloadKind, WorkloadRecord, WorkloadStatus};

use crate::bot;
use crate::config::AgentConfig;
use crate::game;
use crate::hypervisor::Hypervisor;
use crate::log_ring::LogRing;
use crate::runtime::RuntimeDetector;
use crate::supervisor::{SessionSpec, SpawnSpec, StopProtocol};
use crate::vm;

/// Everything a provisioner may need, borrowed from the orchestrator.
pub struct ProvisionCtx<'a> {
    pub cfg: &'a AgentConfig,
    pub hypervisor: &'a Hypervisor,
    pub logs: &'a LogRing,
    pub record: &'a WorkloadRecord,
    pub dir: &'a Path,
}

/// Result of a successful provision run. `credential` is persisted by the
/// orchestrator only on confirmed success.
#[derive(Debug, Default)]
pub struct ProvisionOutcome {
    pub credential: Option<String>,
}

#[async_trait]
pub trait WorkloadDriver: Send + Sync {
    /// Whether provisioning runs as a background task after record
    /// creation (long-running, failure-prone) or inline.
    fn provisions_in_background(&self) -> bool;

    /// Status a failed background provision leaves behind. Bots stay
    /// Stopped because a plain start retries the install; everything else
    /// needs operator attention.
    fn provision_failure_status(&self) -> WorkloadStatus {
        WorkloadStatus::Error
    }

    /// Start preconditions: required binaries/runtimes present, required
    /// files present (regenerated when they can be). `Err` carries the
    /// operator-facing diagnostic.
    async fn preconditions(
        &self,
        record: &WorkloadRecord,
        dir: &Path,
        detector: &RuntimeDetector,
        cfg: &AgentConfig,
    ) -> Result<(), String>;

    /// Build the spawn spec for the tracked handle, including the
    /// kind-specific stop protocol.
    fn spawn_spec(
        &self,
        record: &WorkloadRecord,
        dir: &Path,
        cfg: &AgentConfig,
        hypervisor: &Hypervisor,
    ) -> SpawnSpec;

    async fn provision(&self, ctx: ProvisionCtx<'_>) -> anyhow::Result<ProvisionOutcome>;

    /// Tear down kind-owned resources outside the workload directory.
    async fn deprovision(&self, ctx: ProvisionCtx<'_>) -> anyhow::Result<()>;
}

pub fn driver_for(kind: WorkloadKind) -> &'static dyn WorkloadDriver {
    match kind {
        WorkloadKind::Game { .. } => &GameDriver,
        WorkloadKind::ManagedVm => &VmDriver,
        WorkloadKind::Bot => &BotDriver,
    }
}

fn family_of(record: &WorkloadRecord) -> berth_workload::GameFamily {
    match record.kind {
        WorkloadKind::Game { family } => family,
        // driver_for() only hands game records to this driver.
        _ => unreachable!("game driver invoked for non-game record"),
    }
}

fn flavor_of(record: &WorkloadRecord) -> BotFlavor {
    record.config.flavor.unwrap_or(BotFlavor::Node)
}

struct GameDriver;

#[async_trait]
impl WorkloadDriver for GameDriver {
    fn provisions_in_background(&self) -> bool {
        false
    }

    async fn preconditions(
        &self,
        record: &WorkloadRecord,
        dir: &Path,
        detector: &RuntimeDetector,
        _cfg: &AgentConfig,
    ) -> Result<(), String> {
        let family = family_of(record);
        let binary = game::required_binary(family);
        if detector.probe(binary).await.is_none() {
            return Err(format!(
                "required binary `{binary}` is not installed on this host"
            ));
        }

        let config_path = dir.join(game::config_file_name(family));
        if !config_path.exists() {
            game::ensure_layout(dir, family, record)
                .await
                .map_err(|e| format!("failed to regenerate config: {e:#}"))?;
        }
        Ok(())
    }

    fn spawn_spec(
        &self,
        record: &WorkloadRecord,
        dir: &Path,
        _cfg: &AgentConfig,
        _hypervisor: &Hypervisor,
    ) -> SpawnSpec {
        let family = family_of(record);
        let (command, args) = game::launch_invocation(family, record);
        SpawnSpec {
            command,
            args,
            env: Vec::new(),
            cwd: dir.to_path_buf(),
            stop: StopProtocol::ConsoleCommand(game::graceful_command(family).to_string()),
            session: None,
        }
    }

    async fn provision(&self, ctx: ProvisionCtx<'_>) -> anyhow::Result<ProvisionOutcome> {
        game::ensure_layout(ctx.dir, family_of(ctx.record), ctx.record).await?;
        Ok(ProvisionOutcome::default())
    }

    async fn deprovision(&self, _ctx: ProvisionCtx<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

struct VmDriver;

#[async_trait]
impl WorkloadDriver for VmDriver {
    fn provisions_in_background(&self) -> bool {
        true
    }

    async fn preconditions(
        &self,
        _record: &WorkloadRecord,
        _dir: &Path,
        detector: &RuntimeDetector,
        cfg: &AgentConfig,
    ) -> Result<(), String> {
        if detector.probe(&cfg.hypervisor_bin).await.is_none() {
            return Err(format!(
                "virtualization layer `{}` is not available on this host",
                cfg.hypervisor_bin
            ));
        }
        Ok(())
    }

    fn spawn_spec(
        &self,
        record: &WorkloadRecord,
        dir: &Path,
        cfg: &AgentConfig,
        hypervisor: &Hypervisor,
    ) -> SpawnSpec {
        let instance = cfg.instance_name(&record.id.0);
        let (command, args) = hypervisor.daemon_invocation(&instance);
        let (session_command, session_args) = hypervisor.session_invocation(&instance);
        SpawnSpec {
            command,
            args,
            env: Vec::new(),
            cwd: dir.to_path_buf(),
            stop: StopProtocol::Hypervisor { instance },
            session: Some(SessionSpec {
                command: session_command,
                args: session_args,
            }),
        }
    }

    async fn provision(&self, ctx: ProvisionCtx<'_>) -> anyhow::Result<ProvisionOutcome> {
        let credential =
            vm::provision(ctx.cfg, ctx.hypervisor, ctx.logs, ctx.record, ctx.dir).await?;
        Ok(ProvisionOutcome {
            credential: Some(credential),
        })
    }

    async fn deprovision(&self, ctx: ProvisionCtx<'_>) -> anyhow::Result<()> {
        let instance = ctx.cfg.instance_name(&ctx.record.id.0);
        vm::deprovision(ctx.hypervisor, &instance).await;
        Ok(())
    }
}

struct BotDriver;

#[async_trait]
impl WorkloadDriver for BotDriver {
    fn provisions_in_background(&self) -> bool {
        true
    }

    fn provision_failure_status(&self) -> WorkloadStatus {
        // Dependency install is retried by simply starting the bot again.
        WorkloadStatus::Stopped
    }

    async fn preconditions(
        &self,
        record: &WorkloadRecord,
        dir: &Path,
        detector: &RuntimeDetector,
        _cfg: &AgentConfig,
    ) -> Result<(), String> {
        let flavor = flavor_of(record);
        let interpreter = bot::interpreter(record, flavor);
        let present = if interpreter.contains('/') {
            PathBuf::from(&interpreter).exists()
        } else {
            detector.probe(&interpreter).await.is_some()
        };
        if !present {
            return Err(format!(
                "interpreter `{interpreter}` is not installed on this host"
            ));
        }

        // The skeleton is regenerable; user files are never overwritten.
        bot::scaffold(dir, flavor)
            .await
            .map_err(|e| format!("failed to restore project skeleton: {e:#}"))?;
        Ok(())
    }

    fn spawn_spec(
        &self,
        record: &WorkloadRecord,
        dir: &Path,
        _cfg: &AgentConfig,
        _hypervisor: &Hypervisor,
    ) -> SpawnSpec {
        let flavor = flavor_of(record);
        SpawnSpec {
            command: bot::interpreter(record, flavor),
            args: vec![flavor.entry_file().to_string()],
            env: Vec::new(),
            cwd: dir.to_path_buf(),
            stop: StopProtocol::Signal,
            session: None,
        }
    }

    async fn provision(&self, ctx: ProvisionCtx<'_>) -> anyhow::Result<ProvisionOutcome> {
        let flavor = flavor_of(ctx.record);
        bot::scaffold(ctx.dir, flavor).await?;
        ctx.logs
            .append(
                &ctx.record.id,
                berth_workload::StreamKind::System,
                "installing bot dependencies",
            )
            .await;
        bot::install_dependencies(ctx.dir, flavor).await?;
        Ok(ProvisionOutcome::default())
    }

    async fn deprovision(&self, _ctx: ProvisionCtx<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_workload::{GameFamily, WorkloadConfig, WorkloadId};
    use chrono::Utc;

    fn record(kind: WorkloadKind) -> WorkloadRecord {
        WorkloadRecord {
            id: WorkloadId("w1".to_string()),
            tenant_id: "t1".to_string(),
            name: "test".to_string(),
            kind,
            status: WorkloadStatus::Stopped,
            bind_address: "0.0.0.0".to_string(),
            port: 30120,
            management_port: None,
            config: WorkloadConfig::default(),
            created_at: Utc::now(),
            expires_at: None,
            pid: None,
        }
    }

    #[test]
    fn game_stop_protocol_is_console_command() {
        let cfg = AgentConfig::default();
        let hv = Hypervisor::new(&cfg);
        let rec = record(WorkloadKind::Game {
            family: GameFamily::Minecraft,
        });
        let spec = driver_for(rec.kind).spawn_spec(&rec, Path::new("/tmp"), &cfg, &hv);
        match spec.stop {
            StopProtocol::ConsoleCommand(cmd) => assert_eq!(cmd, "stop"),
            other => panic!("unexpected stop protocol: {other:?}"),
        }
        assert!(spec.session.is_none());
    }

    #[test]
    fn vm_spec_carries_session_and_hypervisor_stop() {
        let cfg = AgentConfig::default();
        let hv = Hypervisor::new(&cfg);
        let rec = record(WorkloadKind::ManagedVm);
        let spec = driver_for(rec.kind).spawn_spec(&rec, Path::new("/tmp"), &cfg, &hv);
        assert!(spec.session.is_some());
        match spec.stop {
            StopProtocol::Hypervisor { instance } => assert_eq!(instance, "berth-w1"),
            other => panic!("unexpected stop protocol: {other:?}"),
        }
    }

    #[test]
    fn bot_install_failure_leaves_stopped() {
        assert_eq!(
            driver_for(WorkloadKind::Bot).provision_failure_status(),
            WorkloadStatus::Stopped
        );
        assert_eq!(
            driver_for(WorkloadKind::ManagedVm).provision_failure_status(),
            WorkloadStatus::Error
        );
    }

    #[tokio::test]
    async fn missing_game_binary_fails_preconditions() {
        let cfg = AgentConfig::default();
        let detector = RuntimeDetector::new();
        let rec = record(WorkloadKind::Game {
            family: GameFamily::Fivem,
        });
        let tmp = tempfile::tempdir().unwrap();
        let err = driver_for(rec.kind)
            .preconditions(&rec, tmp.path(), &detector, &cfg)
            .await
            .unwrap_err();
        assert!(err.contains("FXServer"));
    }

    #[tokio::test]
    async fn bot_with_runtime_override_passes_preconditions() {
        let cfg = AgentConfig::default();
        let detector = RuntimeDetector::new();
        let mut rec = record(WorkloadKind::Bot);
        rec.config.runtime_path = Some("/bin/sh".to_string());
        let tmp = tempfile::tempdir().unwrap();
        driver_for(rec.kind)
            .preconditions(&rec, tmp.path(), &detector, &cfg)
            .await
            .unwrap();
        assert!(tmp.path().join("index.js").exists());
    }
}
