//! Process Supervisor: exclusive owner of the live-handle table.
//!
//! Every workload kind goes through the same attach procedure — register in
//! the handle map before any event can fire, capture output streams line by
//! line into the console ring, persist spawn/exit transitions through the
//! store and broadcast them on the bus. Kind-specific behavior is confined
//! to the [`StopProtocol`] and to spawn-command construction in the driver.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use berth_workload::{StreamKind, WorkloadId, WorkloadStatus};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

use crate::error::LifecycleError;
use crate::events::{Bus, Event};
use crate::hypervisor::Hypervisor;
use crate::log_ring::LogRing;
use crate::store::Store;

/// How a live workload is brought down. The one place behavior branches by
/// kind.
#[derive(Debug, Clone)]
pub enum StopProtocol {
    /// Write a graceful shutdown command to the process's stdin, then
    /// force-kill when the grace timer fires.
    ConsoleCommand(String),
    /// Terminate the interactive session, stop the instance at the
    /// virtualization layer, and only then kill the tracked daemon handle
    /// as a backstop.
    Hypervisor { instance: String },
    /// SIGTERM the process group, escalating to SIGKILL after the grace
    /// period. No stdin command protocol exists for this kind.
    Signal,
}

/// Secondary interactive session attached alongside the tracked handle
/// (managed-vm kind).
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub command: String,
    pub args: Vec<String>,
}

/// Everything needed to spawn and later stop one workload's handle.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub stop: StopProtocol,
    pub session: Option<SessionSpec>,
}

struct LiveEntry {
    pid: Option<u32>,
    pgid: Option<i32>,
    stdin: Option<ChildStdin>,
    session_stdin: Option<ChildStdin>,
    session_pgid: Option<i32>,
    stop: StopProtocol,
    stopping: bool,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Mutex<HashMap<WorkloadId, LiveEntry>>>,
    store: Arc<dyn Store>,
    logs: LogRing,
    bus: Bus,
    hypervisor: Hypervisor,
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the agent dies, the children must not outlive it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

fn kill_group(pgid: i32, signal: i32) {
    #[cfg(unix)]
    unsafe {
        libc::kill(-pgid, signal);
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, signal);
    }
}

fn build_command(command: &str, args: &[String], env: &[(String, String)], cwd: &Path) -> Command {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in env {
        cmd.env(k, v);
    }
    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                // New session, so the whole process tree can be signalled.
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    cmd
}

fn exit_description(status: std::process::ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return format!("killed by signal {sig}");
        }
    }
    format!("exit code {}", status.code().unwrap_or_default())
}

impl Supervisor {
    pub fn new(store: Arc<dyn Store>, logs: LogRing, bus: Bus, hypervisor: Hypervisor) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            store,
            logs,
            bus,
            hypervisor,
        }
    }

    /// Best-effort status persistence: a missing record (workload deleted
    /// while its handle was still winding down) is tolerated.
    async fn persist_status(&self, id: &WorkloadId, status: WorkloadStatus, pid: Option<u32>) {
        if let Err(e) = self.store.update_status(id, status, pid).await {
            tracing::debug!(workload = %id, error = %e, "status update skipped");
            return;
        }
        self.bus.publish(Event::StatusChanged {
            id: id.clone(),
            status,
        });
    }

    fn attach_stream<R>(&self, id: &WorkloadId, stream: R, kind: StreamKind)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let logs = self.logs.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    continue;
                }
                logs.append(&id, kind, line).await;
            }
        });
    }

    /// Spawn the tracked handle for a workload and run the uniform attach
    /// procedure. At most one live handle may exist per id; a second spawn
    /// for the same id fails without side effects on the existing one.
    pub async fn spawn(&self, id: &WorkloadId, spec: SpawnSpec) -> Result<u32, LifecycleError> {
        let mut child: Child;
        let pid = {
            // Registration and spawn happen under one lock so two racing
            // starts cannot both register.
            let mut inner = self.inner.lock().await;
            if inner.contains_key(id) {
                return Err(LifecycleError::AlreadyInProgress {
                    id: id.clone(),
                    status: WorkloadStatus::Running,
                });
            }

            let mut cmd = build_command(&spec.command, &spec.args, &spec.env, &spec.cwd);
            child = match cmd
                .spawn()
                .with_context(|| format!("spawn {} (cwd {})", spec.command, spec.cwd.display()))
            {
                Ok(c) => c,
                Err(e) => {
                    drop(inner);
                    let reason = crate::support::format_error_chain(&e);
                    self.persist_status(id, WorkloadStatus::Error, None).await;
                    self.logs
                        .append(id, StreamKind::System, format!("spawn failed: {reason}"))
                        .await;
                    return Err(LifecycleError::Precondition {
                        id: id.clone(),
                        reason,
                    });
                }
            };

            // Captured while the child is guaranteed unreaped; re-reading it
            // later can observe None for a fast-exiting process.
            let pid = child.id();
            let pgid = pid.map(|p| p as i32);
            inner.insert(
                id.clone(),
                LiveEntry {
                    pid,
                    pgid,
                    stdin: child.stdin.take(),
                    session_stdin: None,
                    session_pgid: None,
                    stop: spec.stop.clone(),
                    stopping: false,
                },
            );
            pid.unwrap_or_default()
        };

        if let Some(out) = child.stdout.take() {
            self.attach_stream(id, out, StreamKind::Stdout);
        }
        if let Some(err) = child.stderr.take() {
            self.attach_stream(id, err, StreamKind::Stderr);
        }

        if let Some(session) = &spec.session {
            self.attach_session(id, session).await;
        }

        self.persist_status(id, WorkloadStatus::Running, Some(pid))
            .await;
        self.logs
            .append(id, StreamKind::System, format!("process started (pid {pid})"))
            .await;

        // Exit watcher: deregister, persist, narrate. Runs for every kind.
        let this = self.clone();
        let id_owned = id.clone();
        tokio::spawn(async move {
            let res = child.wait().await;

            let (stopping, session_pgid) = {
                let mut inner = this.inner.lock().await;
                match inner.remove(&id_owned) {
                    Some(e) => (e.stopping, e.session_pgid),
                    None => (false, None),
                }
            };
            if let Some(spgid) = session_pgid {
                kill_group(spgid, libc::SIGKILL);
            }

            let line = match res {
                Ok(status) => {
                    if stopping {
                        format!("process stopped ({})", exit_description(status))
                    } else {
                        format!("process exited ({})", exit_description(status))
                    }
                }
                Err(e) => format!("process wait failed: {e}"),
            };

            this.persist_status(&id_owned, WorkloadStatus::Stopped, None)
                .await;
            this.logs.append(&id_owned, StreamKind::System, line).await;
        });

        Ok(pid)
    }

    /// Spawn the secondary interactive session handle (managed-vm kind) and
    /// wire its streams into the same ring as the tracked handle.
    async fn attach_session(&self, id: &WorkloadId, session: &SessionSpec) {
        let mut cmd = build_command(&session.command, &session.args, &[], Path::new("."));
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                // The tracked handle stays up; the console is degraded, not
                // the workload.
                self.logs
                    .append(
                        id,
                        StreamKind::System,
                        format!("console session unavailable: {e}"),
                    )
                    .await;
                return;
            }
        };

        if let Some(out) = child.stdout.take() {
            self.attach_stream(id, out, StreamKind::Stdout);
        }
        if let Some(err) = child.stderr.take() {
            self.attach_stream(id, err, StreamKind::Stderr);
        }

        let mut inner = self.inner.lock().await;
        if let Some(e) = inner.get_mut(id) {
            e.session_stdin = child.stdin.take();
            e.session_pgid = child.id().map(|p| p as i32);
        }
        drop(inner);

        // Session exit alone is not a workload exit; just let it go.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
    }

    pub async fn is_registered(&self, id: &WorkloadId) -> bool {
        self.inner.lock().await.contains_key(id)
    }

    /// Pid of the live handle, if one is registered.
    pub async fn pid_of(&self, id: &WorkloadId) -> Option<u32> {
        self.inner.lock().await.get(id).and_then(|e| e.pid)
    }

    pub async fn live_count(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Write one line of console input to the live handle. For managed-vm
    /// workloads input goes to the interactive session, not the daemon.
    /// Delivered input is echoed into the ring so the console trail shows
    /// what the operator sent.
    pub async fn send_input(&self, id: &WorkloadId, text: &str) -> Result<(), LifecycleError> {
        {
            let mut inner = self.inner.lock().await;
            let entry = inner
                .get_mut(id)
                .ok_or_else(|| LifecycleError::NotRunning(id.clone()))?;

            let stdin = entry
                .session_stdin
                .as_mut()
                .or(entry.stdin.as_mut())
                .ok_or_else(|| LifecycleError::NotRunning(id.clone()))?;

            let mut line = text.to_string();
            if !line.ends_with('\n') {
                line.push('\n');
            }
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|_| LifecycleError::NotRunning(id.clone()))?;
            stdin
                .flush()
                .await
                .map_err(|_| LifecycleError::NotRunning(id.clone()))?;
        }

        self.logs
            .append(id, StreamKind::System, format!("> {}", text.trim_end()))
            .await;
        Ok(())
    }

    /// Apply the kind-specific stop protocol and wait (bounded by `grace`)
    /// for the exit watcher to deregister the handle. The grace timer is
    /// cancelled by an observed exit. Returns `false` when no handle was
    /// registered.
    pub async fn stop(&self, id: &WorkloadId, grace: Duration) -> bool {
        let (protocol, pgid) = {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner.get_mut(id) else {
                return false;
            };
            entry.stopping = true;
            let protocol = entry.stop.clone();

            match &protocol {
                StopProtocol::ConsoleCommand(cmd) => {
                    if let Some(mut stdin) = entry.stdin.take() {
                        let mut line = cmd.clone();
                        if !line.ends_with('\n') {
                            line.push('\n');
                        }
                        let _ = stdin.write_all(line.as_bytes()).await;
                        let _ = stdin.flush().await;
                        // Dropping stdin gives the child EOF as well.
                    }
                }
                StopProtocol::Hypervisor { .. } => {
                    // Session first: no console must be left attached to an
                    // instance being stopped.
                    if let Some(spgid) = entry.session_pgid.take() {
                        kill_group(spgid, libc::SIGTERM);
                    }
                    entry.session_stdin = None;
                }
                StopProtocol::Signal => {
                    if let Some(pgid) = entry.pgid {
                        kill_group(pgid, libc::SIGTERM);
                    }
                }
            }

            (protocol, entry.pgid)
        };

        if let StopProtocol::Hypervisor { instance } = &protocol {
            // The daemon handle dying does not free the instance; stop it
            // at the virtualization layer explicitly.
            if let Err(e) = self.hypervisor.terminate(instance).await {
                self.logs
                    .append(
                        id,
                        StreamKind::System,
                        format!("hypervisor terminate failed: {e:#}"),
                    )
                    .await;
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if !self.is_registered(id).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Grace expired: force-kill the tracked handle (the backstop for
        // every protocol).
        if let Some(pgid) = pgid {
            self.logs
                .append(id, StreamKind::System, "grace period expired, force killing")
                .await;
            kill_group(pgid, libc::SIGKILL);
        }

        // The exit watcher still owns deregistration; give it a moment.
        let kill_deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.is_registered(id).await {
            if tokio::time::Instant::now() >= kill_deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::store::MemoryStore;
    use berth_workload::{WorkloadConfig, WorkloadKind, WorkloadRecord};
    use chrono::Utc;

    fn spec(cmd: &str, args: &[&str], stop: StopProtocol) -> SpawnSpec {
        SpawnSpec {
            command: cmd.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: Vec::new(),
            cwd: std::env::temp_dir(),
            stop,
            session: None,
        }
    }

    async fn harness() -> (Supervisor, Arc<MemoryStore>, LogRing, WorkloadId) {
        let store = Arc::new(MemoryStore::default());
        let bus = Bus::new(64);
        let logs = LogRing::new(500, bus.clone());
        let sup = Supervisor::new(
            store.clone(),
            logs.clone(),
            bus,
            Hypervisor::new(&AgentConfig::default()),
        );
        let id = WorkloadId::new();
        store
            .create(WorkloadRecord {
                id: id.clone(),
                tenant_id: "t1".to_string(),
                name: "test".to_string(),
                kind: WorkloadKind::Bot,
                status: WorkloadStatus::Starting,
                bind_address: "0.0.0.0".to_string(),
                port: 0,
                management_port: None,
                config: WorkloadConfig::default(),
                created_at: Utc::now(),
                expires_at: None,
                pid: None,
            })
            .await
            .unwrap();
        (sup, store, logs, id)
    }

    async fn wait_until<F, Fut>(mut cond: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if cond().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn spawn_registers_and_exit_deregisters() {
        let (sup, store, logs, id) = harness().await;
        let pid = sup
            .spawn(&id, spec("/bin/sh", &["-c", "exit 0"], StopProtocol::Signal))
            .await
            .unwrap();
        // Even for a process that exits immediately, the announced pid is
        // the one captured at spawn, never a placeholder zero.
        assert!(pid > 0);

        assert!(
            wait_until(
                || async { !sup.is_registered(&id).await },
                Duration::from_secs(5)
            )
            .await
        );
        let rec = store.get(&id).await.unwrap().unwrap();
        assert_eq!(rec.status, WorkloadStatus::Stopped);
        assert_eq!(rec.pid, None);
        let snap = logs.snapshot(&id).await;
        assert!(
            snap.iter()
                .any(|e| e.message == format!("process started (pid {pid})"))
        );
    }

    #[tokio::test]
    async fn double_spawn_is_rejected_with_one_live_handle() {
        let (sup, _store, _logs, id) = harness().await;
        sup.spawn(&id, spec("/bin/sleep", &["30"], StopProtocol::Signal))
            .await
            .unwrap();

        let err = sup
            .spawn(&id, spec("/bin/sleep", &["30"], StopProtocol::Signal))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyInProgress { .. }));
        assert_eq!(sup.live_count().await, 1);

        sup.stop(&id, Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn spawn_failure_persists_error_and_registers_nothing() {
        let (sup, store, logs, id) = harness().await;
        let err = sup
            .spawn(
                &id,
                spec("/berth/definitely/missing", &[], StopProtocol::Signal),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Precondition { .. }));
        assert!(!sup.is_registered(&id).await);

        let rec = store.get(&id).await.unwrap().unwrap();
        assert_eq!(rec.status, WorkloadStatus::Error);
        let snap = logs.snapshot(&id).await;
        assert!(snap.iter().any(|e| e.message.contains("spawn failed")));
    }

    #[tokio::test]
    async fn external_kill_is_observed_as_stop() {
        let (sup, store, logs, id) = harness().await;
        let pid = sup
            .spawn(&id, spec("/bin/sleep", &["30"], StopProtocol::Signal))
            .await
            .unwrap();

        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }

        assert!(
            wait_until(
                || async { !sup.is_registered(&id).await },
                Duration::from_secs(5)
            )
            .await
        );
        let rec = store.get(&id).await.unwrap().unwrap();
        assert_eq!(rec.status, WorkloadStatus::Stopped);
        assert_eq!(rec.pid, None);
        let snap = logs.snapshot(&id).await;
        assert!(snap.iter().any(|e| e.message.contains("signal")));
    }

    #[tokio::test]
    async fn stdout_lines_land_in_the_ring() {
        let (sup, _store, logs, id) = harness().await;
        sup.spawn(
            &id,
            spec(
                "/bin/sh",
                &["-c", "echo hello-out; echo hello-err >&2"],
                StopProtocol::Signal,
            ),
        )
        .await
        .unwrap();

        assert!(
            wait_until(
                || async {
                    let snap = logs.snapshot(&id).await;
                    snap.iter()
                        .any(|e| e.stream == StreamKind::Stdout && e.message == "hello-out")
                        && snap
                            .iter()
                            .any(|e| e.stream == StreamKind::Stderr && e.message == "hello-err")
                },
                Duration::from_secs(5)
            )
            .await
        );
    }

    #[tokio::test]
    async fn console_command_stop_exits_before_grace() {
        let (sup, store, _logs, id) = harness().await;
        sup.spawn(
            &id,
            spec(
                "/bin/sh",
                &["-c", "read cmd; exit 0"],
                StopProtocol::ConsoleCommand("quit".to_string()),
            ),
        )
        .await
        .unwrap();

        let started = tokio::time::Instant::now();
        assert!(sup.stop(&id, Duration::from_secs(10)).await);
        // Graceful path, nowhere near the 10s grace.
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!sup.is_registered(&id).await);
        let rec = store.get(&id).await.unwrap().unwrap();
        assert_eq!(rec.status, WorkloadStatus::Stopped);
    }

    #[tokio::test]
    async fn unresponsive_process_is_force_killed_after_grace() {
        let (sup, _store, logs, id) = harness().await;
        sup.spawn(
            &id,
            spec(
                "/bin/sleep",
                &["30"],
                StopProtocol::ConsoleCommand("quit".to_string()),
            ),
        )
        .await
        .unwrap();

        assert!(sup.stop(&id, Duration::from_millis(300)).await);
        assert!(!sup.is_registered(&id).await);
        let snap = logs.snapshot(&id).await;
        assert!(snap.iter().any(|e| e.message.contains("force killing")));
    }

    #[tokio::test]
    async fn stop_without_handle_reports_false() {
        let (sup, _store, _logs, id) = harness().await;
        assert!(!sup.stop(&id, Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn send_input_reaches_the_process() {
        let (sup, _store, logs, id) = harness().await;
        sup.spawn(
            &id,
            spec(
                "/bin/sh",
                &["-c", "read line; echo got:$line"],
                StopProtocol::Signal,
            ),
        )
        .await
        .unwrap();

        sup.send_input(&id, "hello").await.unwrap();

        assert!(
            wait_until(
                || async {
                    logs.snapshot(&id)
                        .await
                        .iter()
                        .any(|e| e.message == "got:hello")
                },
                Duration::from_secs(5)
            )
            .await
        );
    }

    #[tokio::test]
    async fn send_input_echoes_into_the_ring() {
        let (sup, _store, logs, id) = harness().await;
        sup.spawn(
            &id,
            spec("/bin/sh", &["-c", "read line; sleep 30"], StopProtocol::Signal),
        )
        .await
        .unwrap();

        sup.send_input(&id, "whitelist add player").await.unwrap();

        let snap = logs.snapshot(&id).await;
        assert!(
            snap.iter()
                .any(|e| e.stream == StreamKind::System
                    && e.message == "> whitelist add player"),
            "operator input missing from console trail"
        );

        sup.stop(&id, Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn send_input_to_unknown_id_is_not_running() {
        let (sup, _store, _logs, id) = harness().await;
        let err = sup.send_input(&id, "hi").await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotRunning(_)));
    }
}
