//! Persistence collaborator.
//!
//! The orchestration core consumes this interface; the production SQL
//! implementation lives with the transport layer. Two implementations ship
//! here: an in-memory store for tests and a directory-backed JSON store
//! (one atomically written `record.json` per workload) for single-node
//! deployments.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use berth_workload::{
    OsVariant, PortNamespace, WorkloadId, WorkloadRecord, WorkloadStatus,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Explicit allow-list of mutable record fields. Everything else is fixed
/// at creation time or owned by `update_status`.
#[derive(Debug, Clone)]
pub enum MutableField {
    Name(String),
    Credential(Option<String>),
    OsVariant(OsVariant),
}

fn apply_field(rec: &mut WorkloadRecord, field: MutableField) {
    match field {
        MutableField::Name(name) => rec.name = name,
        MutableField::Credential(cred) => rec.config.credential = cred,
        MutableField::OsVariant(v) => rec.config.os_variant = Some(v),
    }
}

fn next_port_from_records(records: &[WorkloadRecord], ns: PortNamespace, base: u16) -> u16 {
    let mut candidate = base;
    loop {
        let taken = records.iter().any(|r| {
            r.kind.port_namespace() == ns
                && (r.port == candidate || r.management_port == Some(candidate))
        });
        if !taken {
            return candidate;
        }
        candidate = candidate.saturating_add(1);
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, id: &WorkloadId) -> anyhow::Result<Option<WorkloadRecord>>;
    async fn list(&self) -> anyhow::Result<Vec<WorkloadRecord>>;
    async fn create(&self, record: WorkloadRecord) -> anyhow::Result<()>;
    /// Persist a status transition together with the live pid (or its
    /// clearing). The two always change together, hence one operation.
    async fn update_status(
        &self,
        id: &WorkloadId,
        status: WorkloadStatus,
        pid: Option<u32>,
    ) -> anyhow::Result<()>;
    async fn update_field(&self, id: &WorkloadId, field: MutableField) -> anyhow::Result<()>;
    async fn delete(&self, id: &WorkloadId) -> anyhow::Result<()>;
    /// Lowest free port >= `base` in the namespace, derived by scanning
    /// records rather than stored separately.
    async fn next_available_port(&self, ns: PortNamespace, base: u16) -> anyhow::Result<u16>;
}

/// In-memory store. The default for tests; also what the agent falls back
/// to when no data root is writable.
#[derive(Default, Clone)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<WorkloadId, WorkloadRecord>>>,
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, id: &WorkloadId) -> anyhow::Result<Option<WorkloadRecord>> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn list(&self) -> anyhow::Result<Vec<WorkloadRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn create(&self, record: WorkloadRecord) -> anyhow::Result<()> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.id) {
            anyhow::bail!("workload already exists: {}", record.id);
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn update_status(
        &self,
        id: &WorkloadId,
        status: WorkloadStatus,
        pid: Option<u32>,
    ) -> anyhow::Result<()> {
        let mut records = self.records.lock().await;
        let rec = records
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("unknown workload: {id}"))?;
        rec.status = status;
        rec.pid = pid;
        Ok(())
    }

    async fn update_field(&self, id: &WorkloadId, field: MutableField) -> anyhow::Result<()> {
        let mut records = self.records.lock().await;
        let rec = records
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("unknown workload: {id}"))?;
        apply_field(rec, field);
        Ok(())
    }

    async fn delete(&self, id: &WorkloadId) -> anyhow::Result<()> {
        self.records.lock().await.remove(id);
        Ok(())
    }

    async fn next_available_port(&self, ns: PortNamespace, base: u16) -> anyhow::Result<u16> {
        let records: Vec<WorkloadRecord> = self.records.lock().await.values().cloned().collect();
        Ok(next_port_from_records(&records, ns, base))
    }
}

/// Directory-backed store: `<root>/<id>/record.json`, written atomically
/// via a temp file + rename so a crash never leaves a torn record.
#[derive(Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn record_path(&self, id: &WorkloadId) -> PathBuf {
        self.root.join(&id.0).join("record.json")
    }

    async fn write_record(&self, record: &WorkloadRecord) -> anyhow::Result<()> {
        let path = self.record_path(&record.id);
        let dir = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("record path has no parent"))?;
        tokio::fs::create_dir_all(dir)
            .await
            .context("create record dir")?;

        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(record).context("serialize record")?;
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .context("create record temp file")?;
        f.write_all(&data).await.context("write record temp file")?;
        f.flush().await.ok();
        tokio::fs::rename(&tmp, &path)
            .await
            .context("persist record")?;
        Ok(())
    }

    async fn read_record(&self, id: &WorkloadId) -> anyhow::Result<Option<WorkloadRecord>> {
        let path = self.record_path(id);
        let raw = match tokio::fs::read(&path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("read record"),
        };
        let rec = serde_json::from_slice::<WorkloadRecord>(&raw).context("parse record")?;
        Ok(Some(rec))
    }
}

#[async_trait]
impl Store for DirStore {
    async fn get(&self, id: &WorkloadId) -> anyhow::Result<Option<WorkloadRecord>> {
        self.read_record(id).await
    }

    async fn list(&self) -> anyhow::Result<Vec<WorkloadRecord>> {
        let mut out = Vec::new();
        let mut dirs = match tokio::fs::read_dir(&self.root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e).context("read store root"),
        };
        while let Some(entry) = dirs.next_entry().await.context("iterate store root")? {
            let id = WorkloadId(entry.file_name().to_string_lossy().to_string());
            if let Some(rec) = self.read_record(&id).await? {
                out.push(rec);
            }
        }
        Ok(out)
    }

    async fn create(&self, record: WorkloadRecord) -> anyhow::Result<()> {
        if self.read_record(&record.id).await?.is_some() {
            anyhow::bail!("workload already exists: {}", record.id);
        }
        self.write_record(&record).await
    }

    async fn update_status(
        &self,
        id: &WorkloadId,
        status: WorkloadStatus,
        pid: Option<u32>,
    ) -> anyhow::Result<()> {
        let mut rec = self
            .read_record(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown workload: {id}"))?;
        rec.status = status;
        rec.pid = pid;
        self.write_record(&rec).await
    }

    async fn update_field(&self, id: &WorkloadId, field: MutableField) -> anyhow::Result<()> {
        let mut rec = self
            .read_record(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown workload: {id}"))?;
        apply_field(&mut rec, field);
        self.write_record(&rec).await
    }

    async fn delete(&self, id: &WorkloadId) -> anyhow::Result<()> {
        let dir = self.root.join(&id.0);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("remove record dir"),
        }
    }

    async fn next_available_port(&self, ns: PortNamespace, base: u16) -> anyhow::Result<u16> {
        let records = self.list().await?;
        Ok(next_port_from_records(&records, ns, base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_workload::{GameFamily, WorkloadConfig, WorkloadKind};
    use chrono::Utc;

    pub(crate) fn record(id: &str, kind: WorkloadKind, port: u16) -> WorkloadRecord {
        WorkloadRecord {
            id: WorkloadId(id.to_string()),
            tenant_id: "t1".to_string(),
            name: id.to_string(),
            kind,
            status: WorkloadStatus::Stopped,
            bind_address: "0.0.0.0".to_string(),
            port,
            management_port: None,
            config: WorkloadConfig::default(),
            created_at: Utc::now(),
            expires_at: None,
            pid: None,
        }
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::default();
        let rec = record(
            "w1",
            WorkloadKind::Game {
                family: GameFamily::Fivem,
            },
            30120,
        );
        store.create(rec.clone()).await.unwrap();

        let got = store.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(got, rec);

        store
            .update_status(&rec.id, WorkloadStatus::Running, Some(42))
            .await
            .unwrap();
        let got = store.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(got.status, WorkloadStatus::Running);
        assert_eq!(got.pid, Some(42));

        store.delete(&rec.id).await.unwrap();
        assert!(store.get(&rec.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = MemoryStore::default();
        let rec = record("w1", WorkloadKind::Bot, 0);
        store.create(rec.clone()).await.unwrap();
        assert!(store.create(rec).await.is_err());
    }

    #[tokio::test]
    async fn next_port_skips_taken_ports_in_namespace() {
        let store = MemoryStore::default();
        store
            .create(record(
                "a",
                WorkloadKind::Game {
                    family: GameFamily::Fivem,
                },
                30120,
            ))
            .await
            .unwrap();
        store
            .create(record(
                "b",
                WorkloadKind::Game {
                    family: GameFamily::Minecraft,
                },
                30121,
            ))
            .await
            .unwrap();
        // Different namespace: must not shadow the game range.
        store
            .create(record("c", WorkloadKind::ManagedVm, 30122))
            .await
            .unwrap();

        let port = store
            .next_available_port(PortNamespace::Game, 30120)
            .await
            .unwrap();
        assert_eq!(port, 30122);
    }

    #[tokio::test]
    async fn next_port_accounts_for_management_ports() {
        let store = MemoryStore::default();
        let mut rec = record("v1", WorkloadKind::ManagedVm, 2200);
        rec.management_port = Some(2201);
        store.create(rec).await.unwrap();

        let port = store
            .next_available_port(PortNamespace::Vm, 2200)
            .await
            .unwrap();
        assert_eq!(port, 2202);
    }

    #[tokio::test]
    async fn dir_store_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirStore::new(tmp.path().to_path_buf());
        let rec = record("w1", WorkloadKind::Bot, 0);
        store.create(rec.clone()).await.unwrap();
        store
            .update_field(&rec.id, MutableField::Name("renamed".to_string()))
            .await
            .unwrap();

        let reopened = DirStore::new(tmp.path().to_path_buf());
        let got = reopened.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(got.name, "renamed");
        assert_eq!(reopened.list().await.unwrap().len(), 1);
    }
}
