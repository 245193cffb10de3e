//! The static GPU hardware table.
//!
//! One `GpuSpec` per hardware class the cluster exposes. The numbers mirror
//! the cluster's published partition limits; they are configuration data and
//! never change at runtime.

use serde::{Deserialize, Serialize};

/// Hardware classes the cluster schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuType {
    /// A 10 GB multi-instance slice of an A100. Free on this cluster.
    Mig,
    /// Interactive-partition RTX 3090s.
    Rtx3090,
    A6000,
    A40,
    /// A100 with 40 GB of HBM.
    A100_40,
    /// A100 with 80 GB of HBM.
    A100_80,
    V100,
    H200,
}

/// Immutable per-type resource limits and accounting data.
#[derive(Debug, Clone, Serialize)]
pub struct GpuSpec {
    /// Hardware class this spec describes.
    pub gpu_type: GpuType,
    /// Partition jobs of this class are submitted to.
    pub partition: &'static str,
    /// Name used in the gres selector (`gpu:<gres_name>:<count>`).
    pub gres_name: &'static str,
    /// VRAM per GPU in GB.
    pub vram_gb: u32,
    /// Service units billed per GPU-hour.
    pub su_per_gpu_hour: f64,
    /// Most GPUs of this class one user may hold concurrently.
    pub max_per_user: u32,
    /// Most GPUs of this class a single job may request.
    pub max_per_job: u32,
    /// Hard walltime ceiling in seconds.
    pub max_walltime_secs: u64,
    /// GPUs installed per node.
    pub per_node: u32,
    /// Node memory in GB.
    pub node_mem_gb: u32,
    /// Constraint feature tag required to land on these nodes, if any.
    pub constraint: Option<&'static str>,
    /// Nodes have a high-bandwidth interconnect (InfiniBand).
    pub infiniband: bool,
    /// GPUs within a node are NVLink-connected.
    pub nvlink: bool,
}

const THREE_DAYS: u64 = 3 * 86400;

/// The full table, in ranking-iteration order.
pub static GPU_SPECS: &[GpuSpec] = &[
    GpuSpec {
        gpu_type: GpuType::Mig,
        partition: "gpu",
        gres_name: "a100_1g.10gb",
        vram_gb: 10,
        su_per_gpu_hour: 0.0,
        max_per_user: 4,
        max_per_job: 1,
        max_walltime_secs: THREE_DAYS,
        per_node: 8,
        node_mem_gb: 128,
        constraint: None,
        infiniband: false,
        nvlink: false,
    },
    GpuSpec {
        gpu_type: GpuType::Rtx3090,
        partition: "interactive",
        gres_name: "rtx3090",
        vram_gb: 24,
        su_per_gpu_hour: 0.5,
        max_per_user: 4,
        max_per_job: 2,
        max_walltime_secs: 12 * 3600,
        per_node: 2,
        node_mem_gb: 128,
        constraint: None,
        infiniband: false,
        nvlink: false,
    },
    GpuSpec {
        gpu_type: GpuType::A6000,
        partition: "gpu",
        gres_name: "a6000",
        vram_gb: 48,
        su_per_gpu_hour: 1.0,
        max_per_user: 16,
        max_per_job: 8,
        max_walltime_secs: THREE_DAYS,
        per_node: 8,
        node_mem_gb: 256,
        constraint: None,
        infiniband: false,
        nvlink: false,
    },
    GpuSpec {
        gpu_type: GpuType::A40,
        partition: "gpu",
        gres_name: "a40",
        vram_gb: 48,
        su_per_gpu_hour: 1.0,
        max_per_user: 8,
        max_per_job: 8,
        max_walltime_secs: THREE_DAYS,
        per_node: 8,
        node_mem_gb: 256,
        constraint: None,
        infiniband: false,
        nvlink: false,
    },
    GpuSpec {
        gpu_type: GpuType::A100_40,
        partition: "gpu",
        gres_name: "a100",
        vram_gb: 40,
        su_per_gpu_hour: 2.0,
        max_per_user: 8,
        max_per_job: 8,
        max_walltime_secs: THREE_DAYS,
        per_node: 8,
        node_mem_gb: 512,
        constraint: None,
        infiniband: true,
        nvlink: true,
    },
    GpuSpec {
        gpu_type: GpuType::A100_80,
        partition: "gpu",
        gres_name: "a100",
        vram_gb: 80,
        su_per_gpu_hour: 3.0,
        max_per_user: 8,
        max_per_job: 8,
        max_walltime_secs: THREE_DAYS,
        per_node: 8,
        node_mem_gb: 1024,
        constraint: Some("a100_80gb"),
        infiniband: true,
        nvlink: true,
    },
    GpuSpec {
        gpu_type: GpuType::V100,
        partition: "gpu",
        gres_name: "v100",
        vram_gb: 32,
        su_per_gpu_hour: 1.0,
        max_per_user: 8,
        max_per_job: 4,
        max_walltime_secs: THREE_DAYS,
        per_node: 4,
        node_mem_gb: 384,
        constraint: None,
        infiniband: false,
        nvlink: false,
    },
    GpuSpec {
        gpu_type: GpuType::H200,
        partition: "gpu",
        gres_name: "h200",
        vram_gb: 141,
        su_per_gpu_hour: 6.0,
        max_per_user: 4,
        max_per_job: 8,
        max_walltime_secs: THREE_DAYS,
        per_node: 8,
        node_mem_gb: 2048,
        constraint: Some("h200"),
        infiniband: true,
        nvlink: true,
    },
];

impl GpuType {
    /// The spec for this type.
    pub fn spec(self) -> &'static GpuSpec {
        GPU_SPECS
            .iter()
            .find(|s| s.gpu_type == self)
            .expect("every GpuType has a table entry")
    }

    /// Canonical name as used on the CLI and in config files.
    pub fn as_str(self) -> &'static str {
        match self {
            GpuType::Mig => "mig",
            GpuType::Rtx3090 => "rtx3090",
            GpuType::A6000 => "a6000",
            GpuType::A40 => "a40",
            GpuType::A100_40 => "a100_40",
            GpuType::A100_80 => "a100_80",
            GpuType::V100 => "v100",
            GpuType::H200 => "h200",
        }
    }

    /// Parses a user-supplied type name, accepting a few common aliases.
    pub fn parse(s: &str) -> Option<GpuType> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mig" | "a100_1g.10gb" => Some(GpuType::Mig),
            "rtx3090" | "3090" => Some(GpuType::Rtx3090),
            "a6000" => Some(GpuType::A6000),
            "a40" => Some(GpuType::A40),
            "a100_40" | "a100-40" | "a100" => Some(GpuType::A100_40),
            "a100_80" | "a100-80" => Some(GpuType::A100_80),
            "v100" => Some(GpuType::V100),
            "h200" => Some(GpuType::H200),
            _ => None,
        }
    }

    /// All types, table order.
    pub fn all() -> impl Iterator<Item = GpuType> {
        GPU_SPECS.iter().map(|s| s.gpu_type)
    }
}

impl std::fmt::Display for GpuType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
