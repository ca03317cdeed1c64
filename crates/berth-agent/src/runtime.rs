//! Host runtime probing.
//!
//! Workload preconditions depend on interpreters and binaries that may be
//! installed, removed or upgraded while the agent runs. A probe runs
//! `<tool> --version` and caches a positive result for the lifetime of the
//! detector; a negative result is never cached, so installing the missing
//! tool and retrying start just works. Absence is an expected condition,
//! not an error.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use tokio::sync::Mutex;

#[derive(Clone, Default)]
pub struct RuntimeDetector {
    cache: Arc<Mutex<HashMap<String, String>>>,
}

impl RuntimeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe for `tool` on PATH. Returns the first line of its version
    /// output, or `None` when the tool is missing or unresponsive.
    pub async fn probe(&self, tool: &str) -> Option<String> {
        {
            let cache = self.cache.lock().await;
            if let Some(v) = cache.get(tool) {
                return Some(v.clone());
            }
        }

        let version = run_version_probe(tool).await?;
        let mut cache = self.cache.lock().await;
        cache.insert(tool.to_string(), version.clone());
        Some(version)
    }
}

async fn run_version_probe(tool: &str) -> Option<String> {
    let out = tokio::process::Command::new(tool)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .ok()?;

    // Some tools print their version to stderr (java-style).
    let text = if out.stdout.is_empty() {
        String::from_utf8_lossy(&out.stderr).to_string()
    } else {
        String::from_utf8_lossy(&out.stdout).to_string()
    };

    let first = text.lines().next().unwrap_or("").trim();
    if first.is_empty() {
        // Present but silent is still present.
        return Some(tool.to_string());
    }
    Some(first.to_string())
}
