use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(
    name = "rv",
    version,
    about = "Fan-out GPU allocation for a remote batch cluster"
)]
pub struct Cli {
    /// Machine-readable JSON output.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Allocation parameters shared by `run` and `up`.
#[derive(Debug, Clone, Args)]
pub struct AllocArgs {
    /// Number of GPUs.
    #[arg(short = 'g', long, default_value_t = 1)]
    pub gpus: u32,

    /// GPU type (mig, rtx3090, a6000, a40, a100_40, a100_80, v100, h200).
    /// All compatible types are raced when omitted.
    #[arg(long = "gpu-type")]
    pub gpu_type: Option<String>,

    /// Walltime (e.g. `4h`, `90m`, `1-00:00:00`).
    #[arg(short = 't', long)]
    pub time: Option<String>,

    /// Job name; defaults to the current directory name.
    #[arg(long)]
    pub name: Option<String>,

    /// Account to bill.
    #[arg(long)]
    pub account: Option<String>,

    /// Memory per node in GB (derived from the GPU spec when omitted).
    #[arg(long)]
    pub mem: Option<u32>,

    /// Minimum VRAM per GPU in GB.
    #[arg(long)]
    pub vram: Option<u32>,

    /// Remote working directory to run in.
    #[arg(long)]
    pub workdir: Option<String>,

    /// Virtual environment to activate on the cluster.
    #[arg(long)]
    pub venv: Option<String>,

    /// Node to keep the job away from (repeatable).
    #[arg(long = "exclude-node")]
    pub exclude_nodes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StreamArg {
    Out,
    Err,
    Both,
}

#[derive(Debug, Subcommand)]
pub enum EnvAction {
    /// Set a variable injected into every job.
    Set { key: String, value: String },
    /// Print one variable.
    Get { key: String },
    /// Remove a variable.
    Unset { key: String },
    /// List all variables.
    List,
}

#[derive(Debug, Subcommand)]
pub enum ForwardAction {
    /// Open a tunnel to a port on a job's node.
    Add {
        /// Local port to listen on.
        local_port: u16,
        /// Remote port (defaults to the local port).
        remote_port: Option<u16>,
        /// Job whose first node to tunnel to (defaults to your only
        /// running job).
        #[arg(long)]
        job: Option<u64>,
    },
    /// List live tunnels.
    List,
    /// Close the tunnel on a local port.
    Stop {
        /// Local port of the tunnel to close.
        local_port: u16,
    },
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// First-run setup: write ~/.rv/config.toml.
    Init,

    /// Allocate GPUs without a command and print the ssh target.
    Up {
        #[command(flatten)]
        alloc: AllocArgs,
    },

    /// Allocate GPUs, run a command, and stream its output.
    Run {
        #[command(flatten)]
        alloc: AllocArgs,

        /// Command to run on the allocation.
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// List your jobs.
    Ps,

    /// Cancel jobs by id (or everything with --all).
    Stop {
        job_ids: Vec<u64>,
        #[arg(long)]
        all: bool,
    },

    /// Open a shell on a job's first node.
    Ssh { job_id: Option<u64> },

    /// Tail a job's logs until it finishes.
    Logs {
        job_id: u64,
        #[arg(long, value_enum, default_value_t = StreamArg::Both)]
        stream: StreamArg,
        /// Keep progress-bar lines instead of scrubbing them.
        #[arg(long)]
        raw: bool,
        /// Only show one node's output (multi-node jobs).
        #[arg(long)]
        node: Option<u32>,
    },

    /// Cluster overview: free GPUs, your queue, fair-share.
    Status,

    /// Push the current directory to your scratch space.
    Sync {
        /// Delete remote files that no longer exist locally.
        #[arg(long)]
        delete: bool,
        /// Show what would transfer without transferring.
        #[arg(long)]
        dry_run: bool,
        /// Exclude pattern (repeatable).
        #[arg(long)]
        exclude: Vec<String>,
    },

    /// Manage ssh port-forward tunnels.
    Forward {
        #[command(subcommand)]
        action: ForwardAction,
    },

    /// Manage environment variables injected into every job.
    Env {
        #[command(subcommand)]
        action: EnvAction,
    },

    /// Allocation balances and the current burn estimate.
    Cost,

    /// Run a one-off command on the login node.
    Exec {
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Show the GPU hardware table.
    Gpu,

    /// Update rv itself.
    Upgrade,
}
