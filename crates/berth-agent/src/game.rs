//! Game-process kind: generated config files and spawn/stop wiring for the
//! two supported game families. No download step happens here; server
//! binaries are host-installed and probed as a start precondition.

use std::path::Path;

use anyhow::Context;
use berth_workload::{GameFamily, WorkloadRecord};

/// Binary that must be present on the host before a start is accepted.
pub fn required_binary(family: GameFamily) -> &'static str {
    match family {
        GameFamily::Fivem => "FXServer",
        GameFamily::Minecraft => "java",
    }
}

/// Console command that asks the server to shut down cleanly.
pub fn graceful_command(family: GameFamily) -> &'static str {
    match family {
        GameFamily::Fivem => "quit",
        GameFamily::Minecraft => "stop",
    }
}

pub fn config_file_name(family: GameFamily) -> &'static str {
    match family {
        GameFamily::Fivem => "server.cfg",
        GameFamily::Minecraft => "server.properties",
    }
}

/// Render the generated config for a record. Deterministic, so a missing
/// file can be regenerated at start without losing anything the panel set.
pub fn render_config(family: GameFamily, record: &WorkloadRecord) -> String {
    let max_players = record.config.max_players.unwrap_or(32);
    match family {
        GameFamily::Fivem => {
            let mut out = String::new();
            out.push_str(&format!(
                "endpoint_add_tcp \"{}:{}\"\n",
                record.bind_address, record.port
            ));
            out.push_str(&format!(
                "endpoint_add_udp \"{}:{}\"\n",
                record.bind_address, record.port
            ));
            out.push_str(&format!("sv_hostname \"{}\"\n", record.name));
            out.push_str(&format!("sv_maxclients {max_players}\n"));
            out.push_str("sv_scriptHookAllowed 0\n");
            if let Some(version) = &record.config.version {
                out.push_str(&format!("# build {version}\n"));
            }
            out.push_str("ensure mapmanager\nensure chat\nensure sessionmanager\n");
            out
        }
        GameFamily::Minecraft => {
            let mut out = String::new();
            out.push_str(&format!("server-port={}\n", record.port));
            out.push_str(&format!("server-ip={}\n", record.bind_address));
            out.push_str(&format!("max-players={max_players}\n"));
            out.push_str(&format!("motd={}\n", record.name));
            out.push_str("level-name=worlds/world\nonline-mode=true\n");
            out
        }
    }
}

/// Create the per-workload layout and write the generated config file.
pub async fn ensure_layout(
    dir: &Path,
    family: GameFamily,
    record: &WorkloadRecord,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir.join("logs"))
        .await
        .context("create game instance layout")?;
    if family == GameFamily::Minecraft {
        tokio::fs::create_dir_all(dir.join("worlds"))
            .await
            .context("create worlds dir")?;
        // Accepting the EULA is part of record creation in this panel.
        tokio::fs::write(dir.join("eula.txt"), b"eula=true\n")
            .await
            .context("write eula.txt")?;
    }

    let config = render_config(family, record);
    tokio::fs::write(dir.join(config_file_name(family)), config.as_bytes())
        .await
        .context("write generated config")?;
    Ok(())
}

/// Spawn command and args for the family.
pub fn launch_invocation(family: GameFamily, record: &WorkloadRecord) -> (String, Vec<String>) {
    match family {
        GameFamily::Fivem => (
            "FXServer".to_string(),
            vec!["+exec".to_string(), "server.cfg".to_string()],
        ),
        GameFamily::Minecraft => {
            let memory_mb = record.config.memory_mb.unwrap_or(2048);
            (
                "java".to_string(),
                vec![
                    format!("-Xmx{memory_mb}M"),
                    "-jar".to_string(),
                    "server.jar".to_string(),
                    "nogui".to_string(),
                ],
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_workload::{
        WorkloadConfig, WorkloadId, WorkloadKind, WorkloadStatus,
    };
    use chrono::Utc;

    fn record(family: GameFamily) -> WorkloadRecord {
        WorkloadRecord {
            id: WorkloadId("g1".to_string()),
            tenant_id: "t1".to_string(),
            name: "Test".to_string(),
            kind: WorkloadKind::Game { family },
            status: WorkloadStatus::Stopped,
            bind_address: "0.0.0.0".to_string(),
            port: 30120,
            management_port: None,
            config: WorkloadConfig {
                max_players: Some(48),
                memory_mb: Some(4096),
                ..WorkloadConfig::default()
            },
            created_at: Utc::now(),
            expires_at: None,
            pid: None,
        }
    }

    #[test]
    fn fivem_config_carries_port_and_capacity() {
        let cfg = render_config(GameFamily::Fivem, &record(GameFamily::Fivem));
        assert!(cfg.contains("endpoint_add_tcp \"0.0.0.0:30120\""));
        assert!(cfg.contains("sv_maxclients 48"));
        assert!(cfg.contains("sv_hostname \"Test\""));
    }

    #[test]
    fn minecraft_config_carries_port_and_motd() {
        let mut rec = record(GameFamily::Minecraft);
        rec.port = 25565;
        let cfg = render_config(GameFamily::Minecraft, &rec);
        assert!(cfg.contains("server-port=25565"));
        assert!(cfg.contains("motd=Test"));
        assert!(cfg.contains("max-players=48"));
    }

    #[test]
    fn minecraft_launch_uses_configured_heap() {
        let (cmd, args) = launch_invocation(GameFamily::Minecraft, &record(GameFamily::Minecraft));
        assert_eq!(cmd, "java");
        assert!(args.contains(&"-Xmx4096M".to_string()));
    }

    #[tokio::test]
    async fn ensure_layout_writes_regenerable_config() {
        let tmp = tempfile::tempdir().unwrap();
        let rec = record(GameFamily::Fivem);
        ensure_layout(tmp.path(), GameFamily::Fivem, &rec)
            .await
            .unwrap();

        let path = tmp.path().join("server.cfg");
        assert!(path.exists());

        // Delete and regenerate: identical content.
        let original = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        ensure_layout(tmp.path(), GameFamily::Fivem, &rec)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
    }
}
