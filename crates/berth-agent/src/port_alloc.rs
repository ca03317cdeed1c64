use berth_workload::{PortNamespace, WorkloadKind};

use crate::config::AgentConfig;
use crate::error::LifecycleError;
use crate::store::Store;

pub fn base_port(cfg: &AgentConfig, ns: PortNamespace) -> u16 {
    match ns {
        PortNamespace::Game => cfg.game_base_port,
        PortNamespace::Vm => cfg.vm_base_port,
        PortNamespace::Bot => cfg.bot_base_port,
    }
}

/// Resolve the primary port for a new workload. `preferred == None` or `0`
/// auto-assigns the lowest free port at or above the kind's base port; an
/// explicit port is validated for uniqueness within its namespace.
pub async fn resolve_port(
    cfg: &AgentConfig,
    store: &dyn Store,
    kind: WorkloadKind,
    preferred: Option<u16>,
) -> Result<u16, LifecycleError> {
    let ns = kind.port_namespace();
    match preferred {
        None | Some(0) => store
            .next_available_port(ns, base_port(cfg, ns))
            .await
            .map_err(LifecycleError::store),
        Some(port) => {
            let records = store.list().await.map_err(LifecycleError::store)?;
            let taken = records.iter().any(|r| {
                r.kind.port_namespace() == ns
                    && (r.port == port || r.management_port == Some(port))
            });
            if taken {
                return Err(LifecycleError::PortInUse { port });
            }
            Ok(port)
        }
    }
}
