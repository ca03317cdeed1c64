//! Thin wrapper around the hypervisor CLI that backs the managed-vm kind.
//!
//! Every operation shells out to the configured binary (WSL-style calling
//! conventions: `--import`, `--terminate`, `--unregister`, `-d <name>`).
//! Killing the tracked daemon handle does not free the underlying instance,
//! which is why stop and delete go through [`Hypervisor::terminate`] and
//! [`Hypervisor::unregister`] explicitly.

use std::path::Path;
use std::process::Stdio;

use anyhow::Context;
use tokio::process::Command;

use crate::config::AgentConfig;

#[derive(Clone)]
pub struct Hypervisor {
    bin: String,
}

impl Hypervisor {
    pub fn new(cfg: &AgentConfig) -> Self {
        Self {
            bin: cfg.hypervisor_bin.clone(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.bin
    }

    /// Import a fresh instance from a base image tarball.
    pub async fn import(
        &self,
        name: &str,
        install_dir: &Path,
        image: &Path,
    ) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(install_dir)
            .await
            .context("create instance install dir")?;
        self.run(
            &[
                "--import",
                name,
                &install_dir.display().to_string(),
                &image.display().to_string(),
            ],
            "import instance",
        )
        .await
    }

    /// Stop the instance at the virtualization layer. Idempotent: a
    /// non-zero exit for an already-stopped instance is tolerated.
    pub async fn terminate(&self, name: &str) -> anyhow::Result<()> {
        match self.run(&["--terminate", name], "terminate instance").await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::debug!(instance = name, error = %e, "terminate returned non-zero");
                Ok(())
            }
        }
    }

    /// Remove the instance and its disk from the virtualization layer.
    pub async fn unregister(&self, name: &str) -> anyhow::Result<()> {
        self.run(&["--unregister", name], "unregister instance").await
    }

    /// Run one shell command inside the instance and fail on non-zero exit.
    pub async fn exec(&self, name: &str, script: &str) -> anyhow::Result<()> {
        self.run(
            &["-d", name, "--", "sh", "-c", script],
            "exec inside instance",
        )
        .await
    }

    /// Registered instance names, one per line of `--list --quiet`.
    pub async fn list_registered(&self) -> anyhow::Result<Vec<String>> {
        let out = Command::new(&self.bin)
            .args(["--list", "--quiet"])
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("spawn `{}` for list", self.bin))?;
        if !out.status.success() {
            anyhow::bail!(
                "`{} --list` failed (exit {})",
                self.bin,
                out.status.code().unwrap_or(-1)
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(|l| l.trim().trim_matches('\0').to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Command invocation for the tracked daemon handle: a keep-alive
    /// process whose lifetime pins the instance's session.
    pub fn daemon_invocation(&self, name: &str) -> (String, Vec<String>) {
        (
            self.bin.clone(),
            vec![
                "-d".to_string(),
                name.to_string(),
                "--".to_string(),
                "sleep".to_string(),
                "infinity".to_string(),
            ],
        )
    }

    /// Command invocation for the interactive console session handle.
    pub fn session_invocation(&self, name: &str) -> (String, Vec<String>) {
        (
            self.bin.clone(),
            vec!["-d".to_string(), name.to_string()],
        )
    }

    async fn run(&self, args: &[&str], label: &str) -> anyhow::Result<()> {
        let out = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("spawn `{}` for: {label}", self.bin))?;

        if out.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        anyhow::bail!(
            "`{}` failed (exit {}) during {label}: {}",
            self.bin,
            out.status.code().unwrap_or(-1),
            stderr.trim()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hv(bin: &str) -> Hypervisor {
        Hypervisor {
            bin: bin.to_string(),
        }
    }

    #[test]
    fn daemon_invocation_targets_the_instance() {
        let (cmd, args) = hv("wsl").daemon_invocation("berth-w1");
        assert_eq!(cmd, "wsl");
        assert_eq!(args[0], "-d");
        assert_eq!(args[1], "berth-w1");
    }

    #[tokio::test]
    async fn missing_binary_surfaces_as_error() {
        let err = hv("berth-definitely-missing-hypervisor")
            .unregister("x")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unregister instance"));
    }

    #[tokio::test]
    async fn exec_runs_through_a_shell() {
        // `true` exits zero regardless of the `-d`/`--` prefix args, so use
        // a shell stub standing in for the hypervisor binary.
        let tmp = tempfile::tempdir().unwrap();
        let stub = tmp.path().join("hv");
        tokio::fs::write(&stub, "#!/bin/sh\nexit 0\n").await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        hv(&stub.display().to_string())
            .exec("inst", "echo hi")
            .await
            .unwrap();
    }
}
