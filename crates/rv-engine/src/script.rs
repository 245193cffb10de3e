//! Batch-script synthesis.
//!
//! Three shapes share one preamble: `simple` (run the command, report the
//! exit code), `multi-node` (srun-wrapped with per-task distributed env),
//! and `checkpoint` (timeout-bounded segments that resubmit themselves until
//! the requested total elapsed time is reached).

use std::fmt::Write as _;

use crate::api::{Strategy, StrategyKind, Topology, UserRequest};

/// CPUs requested per GPU.
const CPUS_PER_GPU: u32 = 8;

/// Wind-down buffer a checkpoint segment reserves before the walltime wall.
const CHECKPOINT_BUFFER_SECS: u64 = 600;

/// Per-job ports are derived from the job id into this range.
const MASTER_PORT_BASE: u32 = 29500;
const MASTER_PORT_SPAN: u32 = 1000;

/// Everything the synthesizer needs beyond the strategy and request.
#[derive(Debug, Clone)]
pub struct ScriptContext<'a> {
    /// Remote scratch directory (logs, caches, checkpoints live under it).
    pub scratch_dir: &'a str,
    /// Environment modules to load.
    pub modules: &'a [String],
    /// Notification endpoint + shared secret, when notifications are on.
    pub notify: Option<NotifyContext<'a>>,
}

/// Notification wiring embedded into the script.
///
/// The secret is shared with the notification receiver; the script signs
/// every event payload with it.
#[derive(Debug, Clone)]
pub struct NotifyContext<'a> {
    /// URL the script POSTs lifecycle events to.
    pub endpoint: &'a str,
    /// HMAC-SHA256 secret.
    pub secret: &'a str,
}

/// Renders the batch script for one strategy.
pub fn render(strategy: &Strategy, req: &UserRequest, ctx: &ScriptContext<'_>) -> String {
    let mut s = String::with_capacity(4096);
    s.push_str("#!/bin/bash\n");
    directives(&mut s, strategy, req, ctx);
    preamble(&mut s, strategy, req, ctx);

    match (strategy.checkpoint, strategy.topology) {
        (true, _) => checkpoint_body(&mut s, strategy, req, ctx),
        (false, Topology::MultiNode) => multi_node_body(&mut s, strategy, req, ctx),
        (false, Topology::SingleNode) => simple_body(&mut s, req),
    }
    s
}

fn directives(s: &mut String, strategy: &Strategy, req: &UserRequest, ctx: &ScriptContext<'_>) {
    let spec = strategy.gpu_type.spec();
    let cpus = strategy.gpus_per_node * CPUS_PER_GPU;
    let mem_gb = req
        .mem_gb
        .unwrap_or_else(|| strategy.gpus_per_node * spec.node_mem_gb / spec.per_node);

    let _ = writeln!(s, "#SBATCH --job-name={}", req.job_name);
    let _ = writeln!(s, "#SBATCH --partition={}", strategy.partition);
    let _ = writeln!(s, "#SBATCH --gres={}", strategy.gres);
    let _ = writeln!(
        s,
        "#SBATCH --time={}",
        rv_core::timefmt::format_walltime(strategy.walltime_secs)
    );
    if let Some(floor) = strategy.time_min_secs {
        let _ = writeln!(
            s,
            "#SBATCH --time-min={}",
            rv_core::timefmt::format_walltime(floor)
        );
    }
    let _ = writeln!(s, "#SBATCH --account={}", req.account);
    let _ = writeln!(s, "#SBATCH --output={}/logs/%x-%j.out", ctx.scratch_dir);
    let _ = writeln!(s, "#SBATCH --error={}/logs/%x-%j.err", ctx.scratch_dir);
    if strategy.nodes > 1 {
        let _ = writeln!(s, "#SBATCH --nodes={}", strategy.nodes);
        let _ = writeln!(s, "#SBATCH --ntasks={}", strategy.nodes);
        let _ = writeln!(s, "#SBATCH --ntasks-per-node=1");
    }
    let _ = writeln!(s, "#SBATCH --cpus-per-task={cpus}");
    let _ = writeln!(s, "#SBATCH --mem={mem_gb}G");
    if let Some(feature) = &strategy.constraint {
        let _ = writeln!(s, "#SBATCH --constraint={feature}");
    }
    if !req.exclude_nodes.is_empty() {
        let _ = writeln!(s, "#SBATCH --exclude={}", req.exclude_nodes.join(","));
    }
}

fn preamble(s: &mut String, strategy: &Strategy, req: &UserRequest, ctx: &ScriptContext<'_>) {
    s.push('\n');
    for module in ctx.modules {
        let _ = writeln!(s, "module load {module}");
    }

    // Per-job env file: sourced once, then removed.
    s.push_str("\nENV_FILE=\"$HOME/.rv/env/${SLURM_JOB_ID}.env\"\n");
    s.push_str("if [ -f \"$ENV_FILE\" ]; then . \"$ENV_FILE\"; rm -f \"$ENV_FILE\"; fi\n");

    notify_helper(s, req, ctx);

    if let Some(venv) = &req.venv_path {
        let _ = writeln!(s, "\nsource {venv}/bin/activate");
    }

    let cpus = strategy.gpus_per_node * CPUS_PER_GPU;
    let scratch = ctx.scratch_dir;
    s.push('\n');
    let _ = writeln!(s, "export OMP_NUM_THREADS={cpus}");
    s.push_str("export TOKENIZERS_PARALLELISM=false\n");
    let _ = writeln!(
        s,
        "export MASTER_PORT=$(( {MASTER_PORT_BASE} + SLURM_JOB_ID % {MASTER_PORT_SPAN} ))"
    );
    let _ = writeln!(s, "export UV_CACHE_DIR={scratch}/.cache/uv");
    let _ = writeln!(s, "export PIP_CACHE_DIR={scratch}/.cache/pip");
    match &req.shared_cache {
        Some(shared) => {
            let _ = writeln!(s, "export HF_HOME={shared}");
        }
        None => {
            let _ = writeln!(s, "export HF_HOME={scratch}/.cache/huggingface");
        }
    }
    let _ = writeln!(s, "export VLLM_CACHE_DIR={scratch}/.cache/vllm");
    if strategy.checkpoint {
        // Checkpoint segments must share a directory across resubmissions,
        // so key it by job name rather than job id.
        let _ = writeln!(
            s,
            "export RV_CHECKPOINT_DIR={scratch}/checkpoints/${{SLURM_JOB_NAME}}"
        );
    } else {
        let _ = writeln!(
            s,
            "export RV_CHECKPOINT_DIR={scratch}/checkpoints/${{SLURM_JOB_ID}}"
        );
    }
    s.push_str("export CHECKPOINT_DIR=\"$RV_CHECKPOINT_DIR\"\n");
    s.push_str("mkdir -p \"$RV_CHECKPOINT_DIR\"\n");

    if let Some(dir) = &req.work_dir {
        let _ = writeln!(s, "\ncd {dir}");
    }

    s.push_str("\nrv_notify STARTED\n");
}

fn notify_helper(s: &mut String, req: &UserRequest, ctx: &ScriptContext<'_>) {
    let Some(notify) = &ctx.notify else {
        s.push_str("\nrv_notify() { :; }\n");
        return;
    };
    let endpoint = req.notify_endpoint.as_deref().unwrap_or(notify.endpoint);
    let _ = writeln!(
        s,
        r#"
rv_notify() {{
  local event="$1"
  local epoch; epoch=$(date +%s)
  local ts; ts=$(date -u +%Y-%m-%dT%H:%M:%SZ)
  local sig; sig=$(printf '%s' "{user}:${{SLURM_JOB_ID}}:${{event}}:${{epoch}}" \
    | openssl dgst -sha256 -hmac '{secret}' | awk '{{print $NF}}')
  curl -s -m 10 -H 'Content-Type: application/json' \
    -d "{{\"user\":\"{user}\",\"jobId\":\"${{SLURM_JOB_ID}}\",\"jobName\":\"{name}\",\"event\":\"${{event}}\",\"node\":\"$(hostname -s)\",\"ts\":\"${{ts}}\",\"epoch\":${{epoch}},\"sig\":\"${{sig}}\"}}" \
    '{endpoint}' >/dev/null 2>&1 || true
}}"#,
        user = req.user,
        name = req.job_name,
        secret = notify.secret,
        endpoint = endpoint,
    );
}

fn simple_body(s: &mut String, req: &UserRequest) {
    let command = match &req.command {
        Some(cmd) => inject_master_port(cmd),
        None => "sleep infinity".to_string(),
    };
    s.push('\n');
    let _ = writeln!(s, "{command}");
    s.push_str("rc=$?\n");
    epilogue(s);
}

fn epilogue(s: &mut String) {
    s.push_str("if [ $rc -eq 0 ]; then rv_notify COMPLETED; else rv_notify FAILED; fi\n");
    s.push_str("exit $rc\n");
}

/// Emits the NCCL/rendezvous setup shared by every multi-node shape.
fn multi_node_setup(s: &mut String, strategy: &Strategy) {
    let spec = strategy.gpu_type.spec();
    s.push('\n');
    s.push_str("nodes=( $(scontrol show hostnames \"$SLURM_JOB_NODELIST\") )\n");
    s.push_str("export MASTER_ADDR=${nodes[0]}\n");
    s.push_str("export NCCL_SOCKET_IFNAME=^lo,docker0\n");
    let _ = writeln!(
        s,
        "export NCCL_IB_DISABLE={}",
        if spec.infiniband { 0 } else { 1 }
    );
}

/// One srun invocation with the per-task distributed env set inside the
/// task context (not the batch body) and per-node output files.
fn srun_invocation(strategy: &Strategy, req: &UserRequest, ctx: &ScriptContext<'_>) -> String {
    let command = req
        .command
        .clone()
        .unwrap_or_else(|| "sleep infinity".to_string());
    let command = inject_multi_node_flags(&command, strategy.nodes);
    let escaped = command.replace('\'', r"'\''");
    format!(
        "srun --ntasks={n} --ntasks-per-node=1 \\\n  --output={scratch}/logs/%x-%j-node%n.out \\\n  --error={scratch}/logs/%x-%j-node%n.err \\\n  bash -c 'export RANK=$SLURM_PROCID; export WORLD_SIZE=$SLURM_NTASKS; export NODE_RANK=$SLURM_NODEID; {escaped}'",
        n = strategy.nodes,
        scratch = ctx.scratch_dir,
    )
}

fn multi_node_body(s: &mut String, strategy: &Strategy, req: &UserRequest, ctx: &ScriptContext<'_>) {
    multi_node_setup(s, strategy);
    let _ = writeln!(s, "{}", srun_invocation(strategy, req, ctx));
    s.push_str("rc=$?\n");
    epilogue(s);
}

fn checkpoint_body(s: &mut String, strategy: &Strategy, req: &UserRequest, ctx: &ScriptContext<'_>) {
    let run_line = if strategy.topology == Topology::MultiNode {
        multi_node_setup(s, strategy);
        format!("timeout ${{budget}}s {}", srun_invocation(strategy, req, ctx))
    } else {
        let command = match &req.command {
            Some(cmd) => inject_master_port(cmd),
            None => "sleep infinity".to_string(),
        };
        let escaped = command.replace('\'', r"'\''");
        format!("timeout ${{budget}}s bash -c '{escaped}'")
    };

    s.push('\n');
    // The actual walltime may be shorter than requested when --time-min let
    // the scheduler shrink the slot, so derive the budget from the
    // scheduler's own end time.
    s.push_str("if [ -n \"$SLURM_JOB_END_TIME\" ]; then\n");
    s.push_str("  remaining=$(( SLURM_JOB_END_TIME - $(date +%s) ))\n");
    s.push_str("else\n");
    let _ = writeln!(s, "  remaining={}", strategy.walltime_secs);
    s.push_str("fi\n");
    let _ = writeln!(s, "budget=$(( remaining - {CHECKPOINT_BUFFER_SECS} ))");
    s.push_str("[ \"$budget\" -lt 60 ] && budget=60\n");
    s.push('\n');
    s.push_str("export RV_TOTAL_ELAPSED=${RV_TOTAL_ELAPSED:-0}\n");
    s.push_str("SCRIPT_COPY=\"$RV_CHECKPOINT_DIR/restart.sh\"\n");
    s.push_str("[ -f \"$SCRIPT_COPY\" ] || cp \"$0\" \"$SCRIPT_COPY\"\n");
    s.push('\n');
    s.push_str("seg_start=$(date +%s)\n");
    let _ = writeln!(s, "{run_line}");
    s.push_str("rc=$?\n");
    s.push_str("seg_end=$(date +%s)\n");
    s.push_str("RV_TOTAL_ELAPSED=$(( RV_TOTAL_ELAPSED + seg_end - seg_start ))\n");
    s.push('\n');
    let _ = writeln!(
        s,
        "if [ $rc -ne 0 ] && [ $RV_TOTAL_ELAPSED -lt {total} ]; then",
        total = req.total_time_secs
    );
    s.push_str("  rv_notify RESUBMITTED\n");
    s.push_str(
        "  sbatch --export=ALL,RV_TOTAL_ELAPSED=$RV_TOTAL_ELAPSED \"$SCRIPT_COPY\"\n",
    );
    s.push_str("  exit 0\n");
    s.push_str("fi\n");
    epilogue(s);
}

/// Injects `--master-port` into single-node distributed launchers that did
/// not pin one themselves.
fn inject_master_port(command: &str) -> String {
    if command.contains("torchrun")
        && !command.contains("--master-port")
        && !command.contains("--master_port")
    {
        return command.replacen("torchrun", "torchrun --master-port=$MASTER_PORT", 1);
    }
    if command.contains("accelerate launch") && !command.contains("--main_process_port") {
        return command.replacen(
            "accelerate launch",
            "accelerate launch --main_process_port=$MASTER_PORT",
            1,
        );
    }
    command.to_string()
}

/// Injects rendezvous flags into a torchrun-like command unless already
/// present.
fn inject_multi_node_flags(command: &str, nodes: u32) -> String {
    if !command.contains("torchrun") {
        return command.to_string();
    }
    let mut flags = String::new();
    if !command.contains("--nnodes") {
        let _ = write!(flags, " --nnodes={nodes}");
    }
    if !command.contains("--node-rank") && !command.contains("--node_rank") {
        flags.push_str(" --node-rank=$NODE_RANK");
    }
    if !command.contains("--master-addr") && !command.contains("--master_addr") {
        flags.push_str(" --master-addr=$MASTER_ADDR");
    }
    if !command.contains("--master-port") && !command.contains("--master_port") {
        flags.push_str(" --master-port=$MASTER_PORT");
    }
    if flags.is_empty() {
        return command.to_string();
    }
    command.replacen("torchrun", &format!("torchrun{flags}"), 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rv_core::gpu::GpuType;

    fn request(command: Option<&str>) -> UserRequest {
        UserRequest {
            gpu_count: 4,
            gpu_type: None,
            total_time_secs: 24 * 3600,
            total_time_formatted: "1-00:00:00".to_string(),
            job_name: "train-llm".to_string(),
            account: "lab-acct".to_string(),
            user: "abc1de".to_string(),
            command: command.map(str::to_string),
            work_dir: Some("/scratch/abc1de/proj".to_string()),
            venv_path: Some("/scratch/abc1de/proj/.venv".to_string()),
            mem_gb: None,
            vram_min_gb: 0,
            notify_endpoint: None,
            shared_cache: None,
            exclude_nodes: Vec::new(),
        }
    }

    fn strategy(kind: StrategyKind, nodes: u32, walltime: u64) -> Strategy {
        let spec = GpuType::A100_80.spec();
        Strategy {
            id: "a100_80-test".to_string(),
            kind,
            gpu_type: spec.gpu_type,
            partition: spec.partition.to_string(),
            gres: format!("gpu:{}:{}", spec.gres_name, 4 / nodes),
            walltime_secs: walltime,
            time_min_secs: None,
            gpus_per_node: 4 / nodes,
            nodes,
            topology: if nodes > 1 {
                Topology::MultiNode
            } else {
                Topology::SingleNode
            },
            checkpoint: kind == StrategyKind::Checkpoint,
            estimated_su: 0.0,
            estimated_wait_secs: 30,
            backfill_eligible: true,
            constraint: spec.constraint.map(str::to_string),
            label: String::new(),
            score: 0.0,
        }
    }

    fn ctx<'a>(modules: &'a [String], notify: Option<NotifyContext<'a>>) -> ScriptContext<'a> {
        ScriptContext {
            scratch_dir: "/scratch/abc1de",
            modules,
            notify,
        }
    }

    #[test]
    fn simple_script_carries_directives_and_epilogue() {
        let req = request(Some("python train.py"));
        let modules = vec!["cuda".to_string()];
        let script = render(
            &strategy(StrategyKind::Direct, 1, 7200),
            &req,
            &ctx(&modules, None),
        );

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --job-name=train-llm"));
        assert!(script.contains("#SBATCH --partition=gpu"));
        assert!(script.contains("#SBATCH --gres=gpu:a100:4"));
        assert!(script.contains("#SBATCH --time=02:00:00"));
        assert!(script.contains("#SBATCH --constraint=a100_80gb"));
        assert!(script.contains("--output=/scratch/abc1de/logs/%x-%j.out"));
        assert!(script.contains("module load cuda"));
        assert!(script.contains("source /scratch/abc1de/proj/.venv/bin/activate"));
        assert!(script.contains("export OMP_NUM_THREADS=32"));
        assert!(script.contains("export MASTER_PORT=$(( 29500 + SLURM_JOB_ID % 1000 ))"));
        assert!(script.contains("cd /scratch/abc1de/proj"));
        assert!(script.contains("python train.py\nrc=$?"));
        assert!(script.contains("exit $rc"));
    }

    #[test]
    fn env_file_is_sourced_and_deleted_before_the_command() {
        let req = request(Some("python train.py"));
        let script = render(&strategy(StrategyKind::Direct, 1, 7200), &req, &ctx(&[], None));

        let source_at = script
            .find(".rv/env/${SLURM_JOB_ID}.env")
            .expect("env file path");
        assert!(script.contains("rm -f \"$ENV_FILE\""));
        let command_at = script.find("python train.py").expect("command");
        assert!(source_at < command_at);
    }

    #[test]
    fn time_min_floor_is_emitted_when_set() {
        let mut s = strategy(StrategyKind::Direct, 1, 7200);
        s.time_min_secs = Some(3600);
        let script = render(&s, &request(None), &ctx(&[], None));
        assert!(script.contains("#SBATCH --time-min=01:00:00"));
    }

    #[test]
    fn node_exclusions_are_emitted_when_set() {
        let mut req = request(None);
        req.exclude_nodes = vec!["udc-an3".to_string(), "udc-an4".to_string()];
        let script = render(&strategy(StrategyKind::Direct, 1, 7200), &req, &ctx(&[], None));
        assert!(script.contains("#SBATCH --exclude=udc-an3,udc-an4"));
    }

    #[test]
    fn multi_node_wraps_per_task_env_inside_srun() {
        let req = request(Some("torchrun train.py --epochs 3"));
        let script = render(
            &strategy(StrategyKind::Direct, 2, 7200),
            &req,
            &ctx(&[], None),
        );

        assert!(script.contains("#SBATCH --nodes=2"));
        assert!(script.contains("export MASTER_ADDR=${nodes[0]}"));
        // Per-task env is set inside the srun bash -c context.
        assert!(script.contains(
            "bash -c 'export RANK=$SLURM_PROCID; export WORLD_SIZE=$SLURM_NTASKS; export NODE_RANK=$SLURM_NODEID;"
        ));
        assert!(script.contains("--output=/scratch/abc1de/logs/%x-%j-node%n.out"));
        assert!(script.contains("--nnodes=2"));
        assert!(script.contains("--node-rank=$NODE_RANK"));
        assert!(script.contains("--master-addr=$MASTER_ADDR"));
        assert!(script.contains("--master-port=$MASTER_PORT"));
        // A100 nodes have InfiniBand.
        assert!(script.contains("export NCCL_IB_DISABLE=0"));
    }

    #[test]
    fn checkpoint_wraps_in_timeout_and_resubmits_under_total() {
        let req = request(Some("python train.py"));
        let script = render(
            &strategy(StrategyKind::Checkpoint, 1, 3 * 3600),
            &req,
            &ctx(&[], None),
        );

        assert!(script.contains("remaining=$(( SLURM_JOB_END_TIME - $(date +%s) ))"));
        assert!(script.contains("budget=$(( remaining - 600 ))"));
        assert!(script.contains("timeout ${budget}s bash -c 'python train.py'"));
        assert!(script.contains("RV_TOTAL_ELAPSED=$(( RV_TOTAL_ELAPSED + seg_end - seg_start ))"));
        assert!(script.contains(&format!(
            "if [ $rc -ne 0 ] && [ $RV_TOTAL_ELAPSED -lt {} ]; then",
            24 * 3600
        )));
        assert!(script.contains("sbatch --export=ALL,RV_TOTAL_ELAPSED=$RV_TOTAL_ELAPSED"));
        // Shared checkpoint dir across segments.
        assert!(script.contains("checkpoints/${SLURM_JOB_NAME}"));
    }

    #[test]
    fn checkpoint_multi_node_wraps_srun_in_the_timeout() {
        let req = request(Some("torchrun train.py"));
        let script = render(
            &strategy(StrategyKind::Checkpoint, 2, 3 * 3600),
            &req,
            &ctx(&[], None),
        );
        assert!(script.contains("export MASTER_ADDR=${nodes[0]}"));
        assert!(script.contains("timeout ${budget}s srun --ntasks=2"));
        assert!(script.contains("sbatch --export=ALL,RV_TOTAL_ELAPSED=$RV_TOTAL_ELAPSED"));
    }

    #[test]
    fn notify_helper_embeds_signed_payload() {
        let req = request(Some("python train.py"));
        let notify = NotifyContext {
            endpoint: "https://notify.example.com/hook",
            secret: "sekrit",
        };
        let script = render(
            &strategy(StrategyKind::Direct, 1, 7200),
            &req,
            &ctx(&[], Some(notify)),
        );

        assert!(script.contains("openssl dgst -sha256 -hmac 'sekrit'"));
        assert!(script.contains(r#""abc1de:${SLURM_JOB_ID}:${event}:${epoch}""#));
        assert!(script.contains(r#"\"jobName\":\"train-llm\""#));
        assert!(script.contains("https://notify.example.com/hook"));
        assert!(script.contains("rv_notify STARTED"));
        assert!(script.contains("rv_notify COMPLETED"));
        assert!(script.contains("rv_notify FAILED"));
    }

    #[test]
    fn notify_helper_is_a_noop_without_an_endpoint() {
        let script = render(
            &strategy(StrategyKind::Direct, 1, 7200),
            &request(None),
            &ctx(&[], None),
        );
        assert!(script.contains("rv_notify() { :; }"));
    }

    #[test]
    fn master_port_injection_targets_known_launchers() {
        assert_eq!(
            inject_master_port("torchrun train.py"),
            "torchrun --master-port=$MASTER_PORT train.py"
        );
        assert_eq!(
            inject_master_port("torchrun --master_port=1234 train.py"),
            "torchrun --master_port=1234 train.py"
        );
        assert_eq!(
            inject_master_port("accelerate launch train.py"),
            "accelerate launch --main_process_port=$MASTER_PORT train.py"
        );
        assert_eq!(inject_master_port("python train.py"), "python train.py");
    }

    #[test]
    fn multi_node_flag_injection_respects_existing_flags() {
        let cmd = inject_multi_node_flags("torchrun --nnodes=2 train.py", 2);
        assert_eq!(
            cmd,
            "torchrun --node-rank=$NODE_RANK --master-addr=$MASTER_ADDR --master-port=$MASTER_PORT --nnodes=2 train.py"
        );
        assert_eq!(
            inject_multi_node_flags("python train.py", 2),
            "python train.py"
        );
    }

    /// Pins the documented signature algorithm:
    /// `sig = hex(HMAC-SHA256(secret, "user:jobId:event:epoch"))`.
    #[test]
    fn notification_signature_contract() {
        use hmac::{Hmac, Mac as _};
        use sha2::Sha256;

        let mut mac = Hmac::<Sha256>::new_from_slice(b"sekrit").expect("hmac key");
        mac.update(b"abc1de:12345:COMPLETED:1700000000");
        let sig = hex::encode(mac.finalize().into_bytes());

        // Stable, externally-verifiable vector (openssl prints the same).
        assert_eq!(sig.len(), 64);
        assert_eq!(
            sig,
            "64a784531ef870afb1b1c7eefd910b2fd4e7e32c61400416d2b61d646cd8fa6a"
        );
    }
}
