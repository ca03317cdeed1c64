//! Interpreted-bot kind: project scaffolding and dependency installation.
//!
//! Scaffolding writes a minimal runnable skeleton (entry script, dependency
//! manifest, credential placeholder). Dependency installation runs in the
//! background after record creation; its failure deliberately leaves the
//! workload in Stopped rather than Error, because the operator retries it
//! by simply starting the bot again.

use std::path::Path;
use std::process::Stdio;

use anyhow::Context;
use berth_workload::{BotFlavor, WorkloadRecord};

const NODE_ENTRY: &str = r#"require("dotenv").config();
const { Client, GatewayIntentBits } = require("discord.js");

const client = new Client({ intents: [GatewayIntentBits.Guilds] });

client.once("ready", () => {
  console.log(`logged in as ${client.user.tag}`);
});

client.login(process.env.BOT_TOKEN);
"#;

const NODE_MANIFEST: &str = r#"{
  "name": "berth-bot",
  "version": "1.0.0",
  "main": "index.js",
  "dependencies": {
    "discord.js": "^14",
    "dotenv": "^16"
  }
}
"#;

const PYTHON_ENTRY: &str = r#"import os

import discord
from dotenv import load_dotenv

load_dotenv()

intents = discord.Intents.default()
client = discord.Client(intents=intents)


@client.event
async def on_ready():
    print(f"logged in as {client.user}")


client.run(os.environ["BOT_TOKEN"])
"#;

const PYTHON_MANIFEST: &str = "discord.py>=2\npython-dotenv>=1\n";

/// Resolve the interpreter used to run the bot: an explicit override from
/// the config bag wins over the PATH lookup.
pub fn interpreter(record: &WorkloadRecord, flavor: BotFlavor) -> String {
    record
        .config
        .runtime_path
        .clone()
        .unwrap_or_else(|| flavor.interpreter().to_string())
}

/// Write the project skeleton. Existing files are left alone so a
/// re-provision never clobbers user code.
pub async fn scaffold(dir: &Path, flavor: BotFlavor) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .context("create bot project dir")?;

    let (entry, manifest_name, manifest) = match flavor {
        BotFlavor::Node => (NODE_ENTRY, "package.json", NODE_MANIFEST),
        BotFlavor::Python => (PYTHON_ENTRY, "requirements.txt", PYTHON_MANIFEST),
    };

    write_if_absent(&dir.join(flavor.entry_file()), entry).await?;
    write_if_absent(&dir.join(manifest_name), manifest).await?;
    write_if_absent(&dir.join(".env"), "BOT_TOKEN=paste-your-token-here\n").await?;
    Ok(())
}

async fn write_if_absent(path: &Path, content: &str) -> anyhow::Result<()> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(());
    }
    tokio::fs::write(path, content.as_bytes())
        .await
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Run the flavor's dependency installer inside the project directory.
pub async fn install_dependencies(dir: &Path, flavor: BotFlavor) -> anyhow::Result<()> {
    let (program, args): (&str, &[&str]) = match flavor {
        BotFlavor::Node => ("npm", &["install", "--omit=dev"]),
        BotFlavor::Python => ("pip3", &["install", "-r", "requirements.txt"]),
    };

    let out = tokio::process::Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("spawn {program} for dependency install"))?;

    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        anyhow::bail!(
            "{program} install failed (exit {}): {}",
            out.status.code().unwrap_or(-1),
            stderr.trim()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_workload::{
        WorkloadConfig, WorkloadId, WorkloadKind, WorkloadStatus,
    };
    use chrono::Utc;

    #[tokio::test]
    async fn scaffold_writes_entry_manifest_and_credential_placeholder() {
        let tmp = tempfile::tempdir().unwrap();
        scaffold(tmp.path(), BotFlavor::Node).await.unwrap();

        assert!(tmp.path().join("index.js").exists());
        assert!(tmp.path().join("package.json").exists());
        assert!(tmp.path().join(".env").exists());
    }

    #[tokio::test]
    async fn scaffold_never_clobbers_existing_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("main.py"), "print('mine')\n").unwrap();

        scaffold(tmp.path(), BotFlavor::Python).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("main.py")).unwrap(),
            "print('mine')\n"
        );
        assert!(tmp.path().join("requirements.txt").exists());
    }

    #[test]
    fn runtime_path_override_wins() {
        let rec = WorkloadRecord {
            id: WorkloadId("b1".to_string()),
            tenant_id: "t1".to_string(),
            name: "bot".to_string(),
            kind: WorkloadKind::Bot,
            status: WorkloadStatus::Stopped,
            bind_address: "0.0.0.0".to_string(),
            port: 0,
            management_port: None,
            config: WorkloadConfig {
                flavor: Some(BotFlavor::Node),
                runtime_path: Some("/opt/node/bin/node".to_string()),
                ..WorkloadConfig::default()
            },
            created_at: Utc::now(),
            expires_at: None,
            pid: None,
        };
        assert_eq!(interpreter(&rec, BotFlavor::Node), "/opt/node/bin/node");
    }
}
