use berth_workload::WorkloadId;

/// Failure taxonomy for lifecycle operations. Synchronous guard failures
/// propagate as these variants; background provisioning failures are
/// converted to a status transition plus a diagnostic log line at the task
/// boundary and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// A required binary, runtime or config file is missing. Recoverable by
    /// operator action followed by a start retry.
    #[error("precondition failed for {id}: {reason}")]
    Precondition { id: WorkloadId, reason: String },

    /// Start while the workload is already running or starting. The record
    /// is left untouched.
    #[error("workload {id} is already {status:?}")]
    AlreadyInProgress {
        id: WorkloadId,
        status: berth_workload::WorkloadStatus,
    },

    /// Operation addressed an unknown workload id.
    #[error("unknown workload: {0}")]
    NotFound(WorkloadId),

    /// Input sent to a workload with no live input stream.
    #[error("workload {0} is not running")]
    NotRunning(WorkloadId),

    /// Operation is only valid for a different workload kind.
    #[error("operation not supported for kind {kind}: {operation}")]
    KindMismatch {
        kind: &'static str,
        operation: &'static str,
    },

    /// Requested port clashes with another record in the same namespace.
    #[error("port {port} is already in use in this namespace")]
    PortInUse { port: u16 },

    /// Persistence collaborator failure.
    #[error("store error: {0}")]
    Store(String),

    /// Synchronous provisioning failure (the background phases report via
    /// status transitions instead).
    #[error("provisioning failed for {id}: {reason}")]
    Provision { id: WorkloadId, reason: String },
}

impl LifecycleError {
    pub(crate) fn store(err: anyhow::Error) -> Self {
        Self::Store(crate::support::format_error_chain(&err))
    }
}
