//! Public API types for the allocation engine.

use serde::Serialize;

use rv_core::gpu::GpuType;

/// An immutable, fully-resolved user request: "N GPUs of some type for T
/// time, running this command".
#[derive(Debug, Clone)]
pub struct UserRequest {
    /// Total GPUs requested across all nodes.
    pub gpu_count: u32,
    /// Restrict strategies to a single hardware class, if set.
    pub gpu_type: Option<GpuType>,
    /// Requested walltime in seconds.
    pub total_time_secs: u64,
    /// The walltime as the scheduler formats it.
    pub total_time_formatted: String,
    /// Job name shown in the queue.
    pub job_name: String,
    /// Accounting allocation to bill.
    pub account: String,
    /// Cluster username.
    pub user: String,
    /// The command to run, if any (an allocation without a command idles).
    pub command: Option<String>,
    /// Remote working directory to `cd` into before the command.
    pub work_dir: Option<String>,
    /// Virtual environment to activate, if one was resolved.
    pub venv_path: Option<String>,
    /// Explicit memory request in GB; derived from the GPU spec otherwise.
    pub mem_gb: Option<u32>,
    /// Lower bound on per-GPU VRAM in GB (0 = no floor).
    pub vram_min_gb: u32,
    /// Notification endpoint the batch script POSTs lifecycle events to.
    pub notify_endpoint: Option<String>,
    /// Shared group cache to point HF_HOME at, if configured.
    pub shared_cache: Option<String>,
    /// Nodes to keep the job away from.
    pub exclude_nodes: Vec<String>,
}

/// How a strategy intends to get scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Plain submission at the full walltime.
    Direct,
    /// Full walltime fits inside the backfill window; expected to start
    /// immediately.
    Backfill,
    /// Runs in backfill-sized segments, resubmitting itself until the
    /// requested total elapsed time is reached.
    Checkpoint,
    /// A single MIG slice (free, effectively instant).
    Mig,
    /// The interactive partition's RTX 3090s.
    Interactive,
}

impl StrategyKind {
    /// Canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Direct => "direct",
            StrategyKind::Backfill => "backfill",
            StrategyKind::Checkpoint => "checkpoint",
            StrategyKind::Mig => "mig",
            StrategyKind::Interactive => "interactive",
        }
    }
}

/// Node topology of a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    /// Everything on one node.
    SingleNode,
    /// Split across two nodes.
    MultiNode,
}

/// Per-GPU-type outcome of the backfill probe, collapsed to one number.
#[derive(Debug, Clone, Copy)]
pub struct BackfillProbe {
    /// Type this probe describes.
    pub gpu_type: GpuType,
    /// Largest walltime (seconds) the scheduler would start immediately.
    /// Zero when nothing backfills.
    pub max_backfill_secs: u64,
    /// Every probed walltime was backfillable; no cliff was found.
    pub fully_backfillable: bool,
}

/// One concrete submission plan.
#[derive(Debug, Clone, Serialize)]
pub struct Strategy {
    /// Short unique id within a request (e.g. `a100_80-ckpt-2n`).
    pub id: String,
    /// Scheduling kind.
    pub kind: StrategyKind,
    /// Hardware class.
    pub gpu_type: GpuType,
    /// Partition to submit to.
    pub partition: String,
    /// Full gres selector (`gpu:a100:4`).
    pub gres: String,
    /// Walltime for this submission (one segment, for checkpoint kinds).
    pub walltime_secs: u64,
    /// `--time-min` floor, letting the scheduler start the job in a
    /// shorter-than-requested slot.
    pub time_min_secs: Option<u64>,
    /// GPUs requested per node.
    pub gpus_per_node: u32,
    /// Node count (1 or 2).
    pub nodes: u32,
    /// Topology of the allocation.
    pub topology: Topology,
    /// Whether the script carries the checkpoint-resubmit loop.
    pub checkpoint: bool,
    /// Estimated service-unit cost of the whole request on this strategy.
    pub estimated_su: f64,
    /// Estimated queue wait in seconds.
    pub estimated_wait_secs: u64,
    /// The walltime fits inside the probed backfill window.
    pub backfill_eligible: bool,
    /// Constraint feature tag, when the type needs one.
    pub constraint: Option<String>,
    /// Human-readable one-line description.
    pub label: String,
    /// Ranking score (higher is better).
    pub score: f64,
}

/// Lifecycle state of a submission, as the monitor tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubmissionState {
    /// Queued, waiting for the scheduler.
    Pending,
    /// Started on a node.
    Running,
    /// Finished with exit code 0 (possibly between two polls).
    Completed,
    /// Reached a terminal state other than completion.
    Failed,
    /// Cancelled locally because a sibling won.
    Cancelled,
}

impl SubmissionState {
    /// True once the submission can never run again.
    pub fn is_settled(self) -> bool {
        !matches!(self, SubmissionState::Pending | SubmissionState::Running)
    }
}

/// A strategy the scheduler accepted: the strategy plus its job id and the
/// live state the monitor maintains.
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    /// The plan this submission realizes.
    pub strategy: Strategy,
    /// Scheduler-assigned job id.
    pub job_id: u64,
    /// Last observed state.
    pub state: SubmissionState,
    /// Allocated nodes, once known.
    pub nodes: Vec<String>,
}

/// Post-win verification of what the scheduler actually allocated.
#[derive(Debug, Clone, Serialize)]
pub struct GresCheck {
    /// GPU label reported by the winning node.
    pub observed_label: String,
    /// GPU count reported by the winning node.
    pub observed_count: u32,
    /// Observed hardware does not match the strategy. A bare `a100` label
    /// is ambiguous between the 40 GB and 80 GB variants and does not count
    /// as a mismatch for either.
    pub mismatch: bool,
    /// Topology hazards worth surfacing (no InfiniBand for multi-node, no
    /// NVLink for multi-GPU).
    pub warnings: Vec<String>,
}

/// The allocator's result: a winner, the full submission set, and timing.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationOutcome {
    /// The submission that reached `RUNNING` (or completed between polls)
    /// first.
    pub winner: Submission,
    /// Every submission of the fan-out, with final states. At most one is
    /// `RUNNING`/`COMPLETED`; the rest are terminal or `CANCELLED`.
    pub submissions: Vec<Submission>,
    /// Wall time from first submission to winner detection, milliseconds.
    pub allocation_ms: u64,
    /// Hardware verification of the winner, when the node answered.
    pub verification: Option<GresCheck>,
}
