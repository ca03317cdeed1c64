//! Managed-VM kind: instance provisioning, reinstall and the orphan sweep.
//!
//! Provisioning imports a fresh instance from the shared base image, then
//! bootstraps it in-guest: package install, user creation with a generated
//! credential, remote-access daemon on the management port, hostname and
//! login banner. All of it runs in the background relative to record
//! creation; the orchestrator owns the resulting status transition.

use std::path::Path;

use anyhow::Context;
use berth_workload::{OsVariant, StreamKind, WorkloadId, WorkloadRecord};
use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::config::AgentConfig;
use crate::hypervisor::Hypervisor;
use crate::image;
use crate::log_ring::LogRing;

/// Guest account created for the tenant.
pub const GUEST_USER: &str = "admin";

pub fn generate_credential() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect()
}

/// In-guest bootstrap. Runs under `sh -c` inside the freshly imported
/// instance; idempotent so a retried provision does not trip over itself.
pub fn bootstrap_script(credential: &str, ssh_port: u16, hostname: &str) -> String {
    format!(
        r#"set -e
export DEBIAN_FRONTEND=noninteractive
apt-get update -qq
apt-get install -y -q openssh-server sudo curl htop
id -u {GUEST_USER} >/dev/null 2>&1 || useradd -m -s /bin/bash {GUEST_USER}
echo '{GUEST_USER}:{credential}' | chpasswd
usermod -aG sudo {GUEST_USER}
sed -i 's/^#\?Port .*/Port {ssh_port}/' /etc/ssh/sshd_config
sed -i 's/^#\?PasswordAuthentication .*/PasswordAuthentication yes/' /etc/ssh/sshd_config
echo '{hostname}' > /etc/hostname
hostname '{hostname}' 2>/dev/null || true
printf 'Welcome to %s\n' '{hostname}' > /etc/motd
service ssh restart 2>/dev/null || true
"#
    )
}

/// Import and bootstrap a fresh instance for `record`. Returns the
/// generated credential; the caller persists it only after this returns
/// success, so a failed run never overwrites the previous credential.
pub async fn provision(
    cfg: &AgentConfig,
    hypervisor: &Hypervisor,
    logs: &LogRing,
    record: &WorkloadRecord,
    dir: &Path,
) -> anyhow::Result<String> {
    let variant = record.config.os_variant.unwrap_or(OsVariant::Ubuntu);
    let instance = cfg.instance_name(&record.id.0);
    let ssh_port = record.management_port.unwrap_or(record.port);

    let image_path = image::ensure_base_image(cfg, variant, None, logs, &record.id)
        .await
        .context("ensure base image")?;

    logs.append(
        &record.id,
        StreamKind::System,
        format!("importing instance {instance} ({})", variant.as_str()),
    )
    .await;
    hypervisor
        .import(&instance, &dir.join("vm"), &image_path)
        .await
        .context("import instance")?;

    logs.append(&record.id, StreamKind::System, "running guest bootstrap")
        .await;
    let credential = generate_credential();
    let hostname = sanitize_hostname(&record.name);
    hypervisor
        .exec(&instance, &bootstrap_script(&credential, ssh_port, &hostname))
        .await
        .context("guest bootstrap")?;

    logs.append(
        &record.id,
        StreamKind::System,
        format!("instance ready, remote access on port {ssh_port} as {GUEST_USER}"),
    )
    .await;
    Ok(credential)
}

/// Destroy and recreate the instance from the base image of `new_variant`.
/// Same success contract as [`provision`].
pub async fn reinstall(
    cfg: &AgentConfig,
    hypervisor: &Hypervisor,
    logs: &LogRing,
    record: &WorkloadRecord,
    dir: &Path,
    new_variant: OsVariant,
) -> anyhow::Result<String> {
    let instance = cfg.instance_name(&record.id.0);

    logs.append(
        &record.id,
        StreamKind::System,
        format!("reinstalling as {}", new_variant.as_str()),
    )
    .await;
    // Destructive phase: bring the old instance down and drop it.
    hypervisor.terminate(&instance).await.ok();
    hypervisor
        .unregister(&instance)
        .await
        .context("unregister old instance")?;

    let mut fresh = record.clone();
    fresh.config.os_variant = Some(new_variant);
    provision(cfg, hypervisor, logs, &fresh, dir).await
}

/// Best-effort teardown used by delete: stop the instance and remove it
/// from the virtualization layer.
pub async fn deprovision(hypervisor: &Hypervisor, instance: &str) {
    let _ = hypervisor.terminate(instance).await;
    if let Err(e) = hypervisor.unregister(instance).await {
        tracing::warn!(instance, error = %e, "unregister failed during delete");
    }
}

/// Remove hypervisor instances that carry our prefix but have no matching
/// record. Covers the crash-while-provisioning-then-deleted race, where the
/// record disappears before the background import finished.
pub async fn sweep_orphans(
    cfg: &AgentConfig,
    hypervisor: &Hypervisor,
    store: &dyn crate::store::Store,
) -> anyhow::Result<Vec<String>> {
    let registered = match hypervisor.list_registered().await {
        Ok(v) => v,
        // No hypervisor on this host means no instances to leak.
        Err(_) => return Ok(Vec::new()),
    };

    let mut removed = Vec::new();
    for name in registered {
        let Some(id) = name.strip_prefix(&cfg.instance_prefix) else {
            continue;
        };
        let known = store
            .get(&WorkloadId(id.to_string()))
            .await
            .unwrap_or(None)
            .is_some();
        if known {
            continue;
        }
        tracing::info!(instance = %name, "sweeping orphaned instance");
        deprovision(hypervisor, &name).await;
        removed.push(name);
    }
    Ok(removed)
}

fn sanitize_hostname(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    out.truncate(63);
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "berth-vm".to_string()
    } else {
        trimmed.to_string()
    }
}
