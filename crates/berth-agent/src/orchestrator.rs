//! Lifecycle orchestrator: the one place workload state transitions are
//! decided.
//!
//! Every operation follows the same shape: load the record, check the
//! status guard, persist the transitional status, do the work, persist the
//! outcome. Kind-specific behavior is resolved once per operation through
//! [`driver_for`]; background provisioning tasks always end in a status
//! write, success or failure, so no workload can be left in a transitional
//! status by a completed task.

use std::sync::Arc;
use std::time::Duration;

use berth_workload::{
    ConsoleLogEntry, OsVariant, StreamKind, WorkloadConfig, WorkloadId, WorkloadKind,
    WorkloadRecord, WorkloadStatus,
};
use chrono::{DateTime, Utc};

use crate::config::AgentConfig;
use crate::driver::{driver_for, ProvisionCtx};
use crate::error::LifecycleError;
use crate::events::{Bus, Event};
use crate::hypervisor::Hypervisor;
use crate::log_ring::LogRing;
use crate::port_alloc;
use crate::runtime::RuntimeDetector;
use crate::store::{MutableField, Store};
use crate::supervisor::Supervisor;
use crate::vm;

/// Creation-time parameters. Everything else on the record is derived or
/// assigned here.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub tenant_id: String,
    pub name: String,
    pub kind: WorkloadKind,
    /// `None` or `Some(0)` auto-assigns from the kind's base port.
    pub port: Option<u16>,
    pub bind_address: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub config: WorkloadConfig,
}

#[derive(Clone)]
pub struct Orchestrator {
    cfg: AgentConfig,
    store: Arc<dyn Store>,
    supervisor: Supervisor,
    logs: LogRing,
    bus: Bus,
    detector: RuntimeDetector,
    hypervisor: Hypervisor,
    /// Serializes port scan + record persist during create, so two
    /// concurrent creates cannot both pick the same free port.
    alloc_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Orchestrator {
    pub fn new(cfg: AgentConfig, store: Arc<dyn Store>) -> Self {
        let bus = Bus::default();
        let logs = LogRing::new(cfg.log_ring_capacity, bus.clone());
        let hypervisor = Hypervisor::new(&cfg);
        let supervisor = Supervisor::new(store.clone(), logs.clone(), bus.clone(), hypervisor.clone());
        Self {
            cfg,
            store,
            supervisor,
            logs,
            bus,
            detector: RuntimeDetector::new(),
            hypervisor,
            alloc_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn logs(&self) -> &LogRing {
        &self.logs
    }

    pub async fn get(&self, id: &WorkloadId) -> Result<WorkloadRecord, LifecycleError> {
        self.store
            .get(id)
            .await
            .map_err(LifecycleError::store)?
            .ok_or_else(|| LifecycleError::NotFound(id.clone()))
    }

    pub async fn list(&self) -> Result<Vec<WorkloadRecord>, LifecycleError> {
        self.store.list().await.map_err(LifecycleError::store)
    }

    async fn set_status(
        &self,
        id: &WorkloadId,
        status: WorkloadStatus,
        pid: Option<u32>,
    ) -> Result<(), LifecycleError> {
        self.store
            .update_status(id, status, pid)
            .await
            .map_err(LifecycleError::store)?;
        self.bus.publish(Event::StatusChanged {
            id: id.clone(),
            status,
        });
        Ok(())
    }

    /// Background-task variant: a failed write (workload deleted mid-task)
    /// is logged and swallowed.
    async fn set_status_lossy(&self, id: &WorkloadId, status: WorkloadStatus) {
        if let Err(e) = self.set_status(id, status, None).await {
            tracing::debug!(workload = %id, error = %e, "status update skipped");
        }
    }

    async fn system_line(&self, id: &WorkloadId, message: impl Into<String>) {
        self.logs.append(id, StreamKind::System, message).await;
    }

    /// Create the record, assign ports, lay down the workload directory and
    /// kick off provisioning. Heavy provisioners (managed-vm import, bot
    /// dependency install) run in the background and report through the
    /// Installing status; light ones complete inline and the workload is
    /// immediately startable.
    pub async fn create(&self, req: CreateRequest) -> Result<WorkloadRecord, LifecycleError> {
        let id = WorkloadId::new();
        let driver = driver_for(req.kind);

        let record = {
            // Ports stay unique per namespace only if no other create can
            // scan between our scan and our persist.
            let _alloc = self.alloc_lock.lock().await;

            let port =
                port_alloc::resolve_port(&self.cfg, self.store.as_ref(), req.kind, req.port)
                    .await?;
            // The record is not persisted yet, so scan above the primary
            // port rather than through the store.
            let management_port = match req.kind {
                WorkloadKind::ManagedVm => Some(
                    self.store
                        .next_available_port(req.kind.port_namespace(), port.saturating_add(1))
                        .await
                        .map_err(LifecycleError::store)?,
                ),
                _ => None,
            };

            let status = if driver.provisions_in_background() {
                WorkloadStatus::Installing
            } else {
                WorkloadStatus::Stopped
            };
            let record = WorkloadRecord {
                id: id.clone(),
                tenant_id: req.tenant_id,
                name: req.name,
                kind: req.kind,
                status,
                bind_address: req.bind_address.unwrap_or_else(|| "0.0.0.0".to_string()),
                port,
                management_port,
                config: req.config,
                created_at: Utc::now(),
                expires_at: req.expires_at,
                pid: None,
            };

            self.store
                .create(record.clone())
                .await
                .map_err(LifecycleError::store)?;
            record
        };
        let port = record.port;

        let dir = self.cfg.workload_dir(&id.0);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            // Undo the record so a broken data root does not leave ghosts.
            let _ = self.store.delete(&id).await;
            return Err(LifecycleError::Provision {
                id,
                reason: format!("create workload dir: {e}"),
            });
        }

        tracing::info!(workload = %id, kind = req.kind.as_str(), port, "workload created");

        if driver.provisions_in_background() {
            self.spawn_provision_task(record.clone());
        } else {
            let ctx = ProvisionCtx {
                cfg: &self.cfg,
                hypervisor: &self.hypervisor,
                logs: &self.logs,
                record: &record,
                dir: &dir,
            };
            if let Err(e) = driver.provision(ctx).await {
                let reason = format!("{e:#}");
                self.set_status(&id, WorkloadStatus::Error, None).await?;
                self.system_line(&id, format!("provisioning failed: {reason}"))
                    .await;
                return Err(LifecycleError::Provision { id, reason });
            }
        }

        self.get(&id).await
    }

    /// Run the kind's provisioner as a detached task. The task always ends
    /// in a status write: Stopped on success, the driver's failure status
    /// otherwise.
    fn spawn_provision_task(&self, record: WorkloadRecord) {
        let this = self.clone();
        tokio::spawn(async move {
            let id = record.id.clone();
            let driver = driver_for(record.kind);
            let dir = this.cfg.workload_dir(&id.0);
            let ctx = ProvisionCtx {
                cfg: &this.cfg,
                hypervisor: &this.hypervisor,
                logs: &this.logs,
                record: &record,
                dir: &dir,
            };

            match driver.provision(ctx).await {
                Ok(outcome) => {
                    if let Some(credential) = outcome.credential {
                        if let Err(e) = this
                            .store
                            .update_field(&id, MutableField::Credential(Some(credential)))
                            .await
                        {
                            tracing::warn!(workload = %id, error = %e, "credential write failed");
                        }
                    }
                    this.set_status_lossy(&id, WorkloadStatus::Stopped).await;
                    this.system_line(&id, "provisioning complete").await;
                }
                Err(e) => {
                    let status = driver.provision_failure_status();
                    this.set_status_lossy(&id, status).await;
                    this.system_line(&id, format!("provisioning failed: {e:#}"))
                        .await;
                    tracing::warn!(workload = %id, error = %e, "provisioning failed");
                }
            }
        });
    }

    /// Start the workload's tracked handle. Rejected while a transition or
    /// install is in flight; preconditions failing park the workload in
    /// Error with a diagnostic console line.
    pub async fn start(&self, id: &WorkloadId) -> Result<u32, LifecycleError> {
        let record = self.get(id).await?;
        match record.status {
            WorkloadStatus::Running
            | WorkloadStatus::Starting
            | WorkloadStatus::Stopping
            | WorkloadStatus::Installing => {
                return Err(LifecycleError::AlreadyInProgress {
                    id: id.clone(),
                    status: record.status,
                });
            }
            WorkloadStatus::Stopped | WorkloadStatus::Error => {}
        }

        let driver = driver_for(record.kind);
        let dir = self.cfg.workload_dir(&id.0);

        self.set_status(id, WorkloadStatus::Starting, None).await?;
        self.system_line(id, "starting").await;

        if let Err(reason) = driver
            .preconditions(&record, &dir, &self.detector, &self.cfg)
            .await
        {
            self.set_status(id, WorkloadStatus::Error, None).await?;
            self.system_line(id, format!("start failed: {reason}")).await;
            return Err(LifecycleError::Precondition {
                id: id.clone(),
                reason,
            });
        }

        let spec = driver.spawn_spec(&record, &dir, &self.cfg, &self.hypervisor);
        // The supervisor persists Running (or Error) and narrates.
        let pid = match self.supervisor.spawn(id, spec).await {
            Ok(pid) => pid,
            Err(e @ LifecycleError::AlreadyInProgress { .. }) => {
                // Lost a start race. The winner owns the handle; make sure
                // our earlier Starting write does not mask its Running.
                if let Some(pid) = self.supervisor.pid_of(id).await {
                    let _ = self.set_status(id, WorkloadStatus::Running, Some(pid)).await;
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        tracing::info!(workload = %id, pid, "workload started");
        Ok(pid)
    }

    /// Graceful stop, force kill after the grace period. Idempotent: a
    /// workload with no live handle is normalized to Stopped.
    pub async fn stop(&self, id: &WorkloadId) -> Result<(), LifecycleError> {
        let record = self.get(id).await?;

        if !self.supervisor.is_registered(id).await {
            if record.status != WorkloadStatus::Stopped {
                // Status said live but no handle exists; make the record
                // match reality.
                self.set_status(id, WorkloadStatus::Stopped, None).await?;
                self.system_line(id, "marked stopped (no live process)").await;
            }
            return Ok(());
        }

        self.set_status(id, WorkloadStatus::Stopping, record.pid).await?;
        self.system_line(id, "stopping").await;
        self.supervisor.stop(id, self.cfg.stop_grace).await;
        Ok(())
    }

    /// Stop, wait for the handle to be gone, start. The wait is bounded; a
    /// handle that survives both the grace period and the force kill fails
    /// the restart rather than racing a second spawn.
    pub async fn restart(&self, id: &WorkloadId) -> Result<u32, LifecycleError> {
        self.stop(id).await?;

        let deadline = tokio::time::Instant::now() + self.cfg.restart_wait;
        while self.supervisor.is_registered(id).await {
            if tokio::time::Instant::now() >= deadline {
                return Err(LifecycleError::Precondition {
                    id: id.clone(),
                    reason: "previous process did not exit within the restart window"
                        .to_string(),
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.start(id).await
    }

    /// Wipe and re-provision a managed VM from the base image of
    /// `new_variant`. Only valid for the managed-vm kind and only while no
    /// transition is in flight. Runs in the background; the existing
    /// credential survives a failed reinstall.
    pub async fn reinstall(
        &self,
        id: &WorkloadId,
        new_variant: OsVariant,
    ) -> Result<(), LifecycleError> {
        let record = self.get(id).await?;
        if record.kind != WorkloadKind::ManagedVm {
            return Err(LifecycleError::KindMismatch {
                kind: record.kind.as_str(),
                operation: "reinstall",
            });
        }
        if record.status.is_live() || record.status == WorkloadStatus::Installing {
            return Err(LifecycleError::AlreadyInProgress {
                id: id.clone(),
                status: record.status,
            });
        }

        self.set_status(id, WorkloadStatus::Installing, None).await?;

        let this = self.clone();
        tokio::spawn(async move {
            let id = record.id.clone();
            let dir = this.cfg.workload_dir(&id.0);
            match vm::reinstall(&this.cfg, &this.hypervisor, &this.logs, &record, &dir, new_variant)
                .await
            {
                Ok(credential) => {
                    let cred_write = this
                        .store
                        .update_field(&id, MutableField::Credential(Some(credential)))
                        .await;
                    let variant_write = this
                        .store
                        .update_field(&id, MutableField::OsVariant(new_variant))
                        .await;
                    if let Err(e) = cred_write.and(variant_write) {
                        tracing::warn!(workload = %id, error = %e, "reinstall record write failed");
                    }
                    this.set_status_lossy(&id, WorkloadStatus::Stopped).await;
                    this.system_line(&id, "reinstall complete").await;
                }
                Err(e) => {
                    this.set_status_lossy(&id, WorkloadStatus::Error).await;
                    this.system_line(&id, format!("reinstall failed: {e:#}")).await;
                    tracing::warn!(workload = %id, error = %e, "reinstall failed");
                }
            }
        });
        Ok(())
    }

    /// Remove the workload entirely: best-effort stop, kind teardown, the
    /// on-disk directory, the console ring, and the record last. Anything
    /// failing before the record delete leaves the workload visible and the
    /// delete retriable.
    pub async fn delete(&self, id: &WorkloadId) -> Result<(), LifecycleError> {
        let record = self.get(id).await?;

        if self.supervisor.is_registered(id).await {
            self.system_line(id, "stopping for delete").await;
            self.supervisor.stop(id, self.cfg.stop_grace).await;
        }

        let dir = self.cfg.workload_dir(&id.0);
        let driver = driver_for(record.kind);
        let ctx = ProvisionCtx {
            cfg: &self.cfg,
            hypervisor: &self.hypervisor,
            logs: &self.logs,
            record: &record,
            dir: &dir,
        };
        if let Err(e) = driver.deprovision(ctx).await {
            tracing::warn!(workload = %id, error = %e, "deprovision failed during delete");
        }

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(LifecycleError::Provision {
                    id: id.clone(),
                    reason: format!("remove workload dir: {e}"),
                });
            }
        }

        self.logs.remove(id).await;
        self.store.delete(id).await.map_err(LifecycleError::store)?;
        tracing::info!(workload = %id, "workload deleted");
        Ok(())
    }

    /// Forward one console command to the live handle. A command sent to a
    /// workload that is not running is dropped with a diagnostic line
    /// rather than failing the caller.
    pub async fn send_command(&self, id: &WorkloadId, text: &str) -> Result<(), LifecycleError> {
        self.get(id).await?;
        match self.supervisor.send_input(id, text).await {
            Ok(()) => Ok(()),
            Err(LifecycleError::NotRunning(_)) => {
                self.system_line(id, "command dropped: workload is not running")
                    .await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_logs(&self, id: &WorkloadId) -> Result<Vec<ConsoleLogEntry>, LifecycleError> {
        self.get(id).await?;
        Ok(self.logs.snapshot(id).await)
    }

    pub async fn clear_logs(&self, id: &WorkloadId) -> Result<(), LifecycleError> {
        self.get(id).await?;
        self.logs.clear(id).await;
        Ok(())
    }

    /// Startup recovery. No handle survives an agent restart, so any record
    /// claiming a live status is reset to Stopped with its pid cleared;
    /// interrupted installs land on the kind's failure status. Finishes
    /// with a sweep of hypervisor instances whose record no longer exists.
    pub async fn recover_on_startup(&self) -> Result<(), LifecycleError> {
        let records = self.list().await?;
        for rec in records {
            if rec.status.is_live() {
                self.set_status(&rec.id, WorkloadStatus::Stopped, None).await?;
                self.system_line(&rec.id, "control plane restarted, workload marked stopped")
                    .await;
                tracing::info!(workload = %rec.id, from = ?rec.status, "recovered to stopped");
            } else if rec.status == WorkloadStatus::Installing {
                let status = driver_for(rec.kind).provision_failure_status();
                self.set_status(&rec.id, status, None).await?;
                self.system_line(&rec.id, "provisioning interrupted by restart")
                    .await;
                tracing::info!(workload = %rec.id, to = ?status, "interrupted install recovered");
            }
        }

        match vm::sweep_orphans(&self.cfg, &self.hypervisor, self.store.as_ref()).await {
            Ok(removed) if !removed.is_empty() => {
                tracing::info!(count = removed.len(), "swept orphaned instances");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "orphan sweep failed"),
        }
        Ok(())
    }
}
