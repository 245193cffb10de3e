use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context as _;
use serde_json::json;
use tracing::warn;

use rv_core::config::{self, Config};
use rv_core::gpu::{GPU_SPECS, GpuType};
use rv_core::sanitize::sanitize_branch;
use rv_core::stores::{EnvStore, ForwardsStore, RequestsStore, RecordedStrategy, RequestRecord, TunnelEntry};
use rv_core::timefmt::{format_walltime, parse_duration};
use rv_engine::allocator::{self, LiveJobs, MonitorConfig};
use rv_engine::api::{AllocationOutcome, UserRequest};
use rv_engine::script::{NotifyContext, ScriptContext};
use rv_engine::slurm::{Job, SchedulerApi as _, Slurm};
use rv_engine::tailer::{self, StreamSel, TailOptions, TailTarget};
use rv_engine::{RemoteExecutor, SyncOptions};

use crate::cli::{AllocArgs, Cli, Command, EnvAction, ForwardAction, StreamArg};
use crate::shutdown::spawn_ctrl_c_handler;

/// Environment modules loaded in every batch script.
const DEFAULT_MODULES: &[&str] = &["cuda"];

struct App {
    cfg: Config,
    remote: RemoteExecutor,
    slurm: Slurm,
}

impl App {
    fn new() -> anyhow::Result<Self> {
        let cfg = config::load_config()?;
        let remote = RemoteExecutor::new(&cfg.connection.host)?;
        let slurm = Slurm::new(remote.clone(), cfg.connection.user.clone());
        Ok(Self { cfg, remote, slurm })
    }

    fn scratch(&self) -> String {
        self.cfg.paths.scratch_for(&self.cfg.connection.user)
    }
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Command::Init => init().await,
        Command::Up { alloc } => up(cli.json, alloc).await,
        Command::Run { alloc, command } => run(cli.json, alloc, command).await,
        Command::Ps => ps(cli.json).await,
        Command::Stop { job_ids, all } => stop(job_ids, all).await,
        Command::Ssh { job_id } => ssh(job_id).await,
        Command::Logs {
            job_id,
            stream,
            raw,
            node,
        } => logs(job_id, stream, raw, node).await,
        Command::Status => status(cli.json).await,
        Command::Sync {
            delete,
            dry_run,
            exclude,
        } => sync(delete, dry_run, exclude).await,
        Command::Forward { action } => forward(cli.json, action).await,
        Command::Env { action } => env(cli.json, action),
        Command::Cost => cost(cli.json).await,
        Command::Exec { command } => exec(command).await,
        Command::Gpu => gpu(cli.json),
        Command::Upgrade => upgrade(),
    }
}

// --- allocation -------------------------------------------------------------

fn build_request(
    cfg: &Config,
    alloc: &AllocArgs,
    command: Option<String>,
) -> anyhow::Result<UserRequest> {
    let time_input = alloc
        .time
        .clone()
        .or_else(|| cfg.defaults.time.clone())
        .unwrap_or_else(|| "4h".to_string());
    let total_time_secs =
        parse_duration(&time_input).map_err(|e| anyhow::anyhow!("--time: {e}"))?;

    let gpu_type = match alloc.gpu_type.as_deref().or(cfg.defaults.gpu_type.as_deref()) {
        Some(raw) => Some(
            GpuType::parse(raw).with_context(|| format!("unknown GPU type: {raw}"))?,
        ),
        None => None,
    };

    let account = alloc
        .account
        .clone()
        .or_else(|| cfg.defaults.account.clone())
        .context("no account configured; pass --account or set defaults.account")?;

    let job_name = match &alloc.name {
        Some(name) => sanitize_branch(name),
        None => {
            let from_command = if cfg.defaults.ai_naming {
                command.as_deref().and_then(name_from_command)
            } else {
                None
            };
            match from_command {
                Some(name) => name,
                None => {
                    let cwd = std::env::current_dir().context("resolve current directory")?;
                    let base = cwd
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "job".to_string());
                    sanitize_branch(&base)
                }
            }
        }
    };

    let notify_endpoint = if cfg.notifications.enabled {
        cfg.notifications.endpoint.clone()
    } else {
        None
    };

    Ok(UserRequest {
        gpu_count: alloc.gpus,
        gpu_type,
        total_time_secs,
        total_time_formatted: format_walltime(total_time_secs),
        job_name,
        account,
        user: cfg.connection.user.clone(),
        command,
        work_dir: alloc.workdir.clone(),
        venv_path: alloc.venv.clone(),
        mem_gb: alloc.mem,
        vram_min_gb: alloc.vram.unwrap_or(0),
        notify_endpoint,
        shared_cache: cfg.cache.get("hf").cloned(),
        exclude_nodes: alloc.exclude_nodes.clone(),
    })
}

/// With `defaults.ai_naming`, jobs are named after the script they run
/// rather than the directory.
fn name_from_command(command: &str) -> Option<String> {
    let token = command
        .split_whitespace()
        .find(|t| t.ends_with(".py") || t.ends_with(".sh"))?;
    let stem = token.rsplit('/').next()?.trim_end_matches(".py").trim_end_matches(".sh");
    if stem.is_empty() {
        return None;
    }
    Some(sanitize_branch(stem))
}

async fn allocate(app: &App, req: &UserRequest) -> anyhow::Result<AllocationOutcome> {
    let env_vars: BTreeMap<String, String> = match EnvStore::load() {
        Ok(store) => store.vars().clone(),
        Err(err) => {
            warn!("env store unreadable, submitting without extra vars: {err:#}");
            BTreeMap::new()
        }
    };

    let scratch = app.scratch();
    let modules: Vec<String> = DEFAULT_MODULES.iter().map(|m| m.to_string()).collect();
    let notify = match (&app.cfg.notifications.endpoint, &app.cfg.notifications.token) {
        (Some(endpoint), Some(secret)) if app.cfg.notifications.enabled => Some(NotifyContext {
            endpoint: endpoint.as_str(),
            secret: secret.as_str(),
        }),
        _ => None,
    };
    let ctx = ScriptContext {
        scratch_dir: &scratch,
        modules: &modules,
        notify,
    };

    let live = LiveJobs::new();
    spawn_ctrl_c_handler(app.slurm.clone(), live.clone());

    let outcome = allocator::allocate(
        &app.slurm,
        req,
        &ctx,
        &env_vars,
        &MonitorConfig::default(),
        &live,
    )
    .await?;

    record_request(&outcome);
    Ok(outcome)
}

/// Best-effort request bookkeeping; failures only warn.
fn record_request(outcome: &AllocationOutcome) {
    let result = (|| -> anyhow::Result<()> {
        let mut store = RequestsStore::load()?;
        let (branch, commit, dirty) = git_metadata();
        store.add(RequestRecord {
            id: RequestsStore::next_id(),
            created_at: chrono::Utc::now().timestamp(),
            strategies: outcome
                .submissions
                .iter()
                .map(|sub| RecordedStrategy {
                    job_id: sub.job_id,
                    kind: sub.strategy.kind.as_str().to_string(),
                    gpu_type: sub.strategy.gpu_type.to_string(),
                    nodes: sub.strategy.nodes,
                })
                .collect(),
            branch,
            commit,
            dirty,
            snapshot_path: None,
        });
        store.persist()?;
        Ok(())
    })();
    if let Err(err) = result {
        warn!("failed to record request: {err:#}");
    }
}

fn git_metadata() -> (Option<String>, Option<String>, Option<bool>) {
    fn git(args: &[&str]) -> Option<String> {
        let out = std::process::Command::new("git").args(args).output().ok()?;
        if !out.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
    let branch = git(&["rev-parse", "--abbrev-ref", "HEAD"]);
    let commit = git(&["rev-parse", "--short", "HEAD"]);
    let dirty = git(&["status", "--porcelain"]).map(|s| !s.is_empty());
    (branch, commit, dirty)
}

fn print_outcome(outcome: &AllocationOutcome) {
    let winner = &outcome.winner;
    println!(
        "allocated job {} via {} in {:.1}s",
        winner.job_id,
        winner.strategy.label,
        outcome.allocation_ms as f64 / 1000.0
    );
    if !winner.nodes.is_empty() {
        println!("nodes: {}", winner.nodes.join(", "));
    }
    if let Some(check) = &outcome.verification {
        if check.mismatch {
            eprintln!(
                "warning: node reports {}x {} but the strategy asked for {}",
                check.observed_count,
                check.observed_label,
                winner.strategy.gpu_type
            );
        }
        for w in &check.warnings {
            eprintln!("warning: {w}");
        }
    }
}

async fn run(json: bool, alloc: AllocArgs, command: Vec<String>) -> anyhow::Result<i32> {
    let app = App::new()?;
    let req = build_request(&app.cfg, &alloc, Some(command.join(" ")))?;
    let outcome = allocate(&app, &req).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
    }

    let winner = &outcome.winner;
    let scratch = app.scratch();
    let target = TailTarget {
        job_id: winner.job_id,
        out_path: format!("{scratch}/logs/{}-{}.out", req.job_name, winner.job_id),
        err_path: format!("{scratch}/logs/{}-{}.err", req.job_name, winner.job_id),
    };
    let opts = TailOptions {
        node_count: winner.strategy.nodes,
        ..TailOptions::default()
    };
    let tail = tailer::tail(&app.remote, &app.slurm, &target, &opts).await?;
    if !json {
        println!("job {} finished: {}", winner.job_id, tail.final_state);
    }
    Ok(tail.exit_code)
}

async fn up(json: bool, alloc: AllocArgs) -> anyhow::Result<i32> {
    let app = App::new()?;
    let req = build_request(&app.cfg, &alloc, None)?;
    let outcome = allocate(&app, &req).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
        if let Some(node) = outcome.winner.nodes.first() {
            println!("connect with: rv ssh {} (node {node})", outcome.winner.job_id);
        }
    }
    Ok(0)
}

// --- queue management -------------------------------------------------------

async fn ps(json: bool) -> anyhow::Result<i32> {
    let app = App::new()?;
    let jobs = app.slurm.list_jobs().await?;

    if json {
        let rows: Vec<serde_json::Value> = jobs.iter().map(job_json).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(0);
    }

    if jobs.is_empty() {
        println!("no jobs in the queue");
        return Ok(0);
    }
    println!(
        "{:<10} {:<24} {:<10} {:>10} {:>12} {:<12} {}",
        "JOBID", "NAME", "STATE", "ELAPSED", "LIMIT", "PARTITION", "NODES"
    );
    for job in &jobs {
        println!(
            "{:<10} {:<24} {:<10} {:>10} {:>12} {:<12} {}",
            job.id,
            job.name,
            job.state.to_string(),
            job.elapsed,
            job.limit,
            job.partition,
            if job.nodes.is_empty() {
                job.reason.clone()
            } else {
                job.nodes.join(",")
            }
        );
    }
    Ok(0)
}

fn job_json(job: &Job) -> serde_json::Value {
    json!({
        "id": job.id,
        "name": job.name,
        "state": job.state.to_string(),
        "elapsed": job.elapsed,
        "elapsedSeconds": job.elapsed_secs,
        "limit": job.limit,
        "limitSeconds": job.limit_secs,
        "partition": job.partition,
        "gres": job.gres,
        "nodes": job.nodes,
        "reason": job.reason,
    })
}

async fn stop(job_ids: Vec<u64>, all: bool) -> anyhow::Result<i32> {
    let app = App::new()?;
    let ids = if all {
        app.slurm
            .list_jobs()
            .await?
            .iter()
            .map(|j| j.id)
            .collect()
    } else if job_ids.is_empty() {
        anyhow::bail!("pass job ids or --all");
    } else {
        job_ids
    };

    if ids.is_empty() {
        println!("nothing to cancel");
        return Ok(0);
    }
    app.slurm.cancel_many(&ids).await?;
    println!("cancelled {} job(s)", ids.len());
    Ok(0)
}

async fn ssh(job_id: Option<u64>) -> anyhow::Result<i32> {
    let app = App::new()?;
    let jobs = app.slurm.list_jobs().await?;
    let job = match job_id {
        Some(id) => jobs.iter().find(|j| j.id == id),
        None => jobs.iter().find(|j| !j.nodes.is_empty()),
    }
    .context("no running job to connect to")?;
    let node = job
        .nodes
        .first()
        .context("job has no allocated node yet")?;

    let code = app
        .remote
        .exec_interactive(&["ssh".to_string(), "-t".to_string(), node.clone()])
        .await?;
    Ok(code)
}

async fn logs(job_id: u64, stream: StreamArg, raw: bool, node: Option<u32>) -> anyhow::Result<i32> {
    let app = App::new()?;

    let jobs = app.slurm.list_jobs().await?;
    let (name, node_count) = match jobs.iter().find(|j| j.id == job_id) {
        Some(job) => (job.name.clone(), job.nodes.len().max(1) as u32),
        None => {
            let history = app.slurm.list_history("now-7days").await?;
            let rec = history
                .iter()
                .find(|r| r.id == job_id)
                .with_context(|| format!("job {job_id} not found in queue or history"))?;
            (rec.name.clone(), rec.nodes.len().max(1) as u32)
        }
    };

    let scratch = app.scratch();
    let target = TailTarget {
        job_id,
        out_path: format!("{scratch}/logs/{name}-{job_id}.out"),
        err_path: format!("{scratch}/logs/{name}-{job_id}.err"),
    };
    let opts = TailOptions {
        stream: match stream {
            StreamArg::Out => StreamSel::Out,
            StreamArg::Err => StreamSel::Err,
            StreamArg::Both => StreamSel::Both,
        },
        node_count,
        node_filter: node,
        raw,
        ..TailOptions::default()
    };
    let outcome = tailer::tail(&app.remote, &app.slurm, &target, &opts).await?;
    Ok(outcome.exit_code)
}

// --- cluster state ----------------------------------------------------------

async fn status(json: bool) -> anyhow::Result<i32> {
    let app = App::new()?;
    let state = app.slurm.get_system_state().await?;

    // Free GPUs by hardware label.
    let mut by_label: BTreeMap<String, (u32, u32)> = BTreeMap::new();
    for node in &state.nodes {
        let Some(label) = rv_engine::slurm::gres_gpu_label(&node.gres) else {
            continue;
        };
        let entry = by_label.entry(label).or_insert((0, 0));
        entry.0 += node.gpu_free;
        entry.1 += node.gpu_total;
    }

    if json {
        let gpus: serde_json::Value = by_label
            .iter()
            .map(|(label, (free, total))| (label.clone(), json!({"free": free, "total": total})))
            .collect::<serde_json::Map<String, serde_json::Value>>()
            .into();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "gpus": gpus,
                "running": state.running.len(),
                "pending": state.pending.len(),
                "fairshare": state.fairshare,
            }))?
        );
        return Ok(0);
    }

    println!("free GPUs (estimate):");
    for (label, (free, total)) in &by_label {
        println!("  {label:<14} {free:>4} / {total}");
    }
    println!(
        "your queue: {} running, {} pending",
        state.running.len(),
        state.pending.len()
    );
    println!("fair-share: {:.3}", state.fairshare);
    Ok(0)
}

async fn cost(json: bool) -> anyhow::Result<i32> {
    let app = App::new()?;
    let allocations = app.slurm.list_allocations().await;
    let running = app.slurm.list_jobs().await?;

    // SU burn rate of everything currently running.
    let mut burn_per_hour = 0.0;
    for job in running.iter().filter(|j| !j.nodes.is_empty()) {
        let count = rv_engine::slurm::gres_gpu_count(&job.gres) * job.nodes.len() as u32;
        let rate = rv_engine::slurm::gres_gpu_label(&job.gres)
            .and_then(|label| GPU_SPECS.iter().find(|s| s.gres_name == label))
            .map(|s| s.su_per_gpu_hour)
            .unwrap_or(1.0);
        burn_per_hour += rate * count as f64;
    }

    if json {
        let accounts: Vec<serde_json::Value> = allocations
            .iter()
            .map(|a| {
                json!({
                    "account": a.account,
                    "balance": a.balance,
                    "reserved": a.reserved,
                    "available": a.available,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "accounts": accounts,
                "burnPerHour": burn_per_hour,
            }))?
        );
        return Ok(0);
    }

    if allocations.is_empty() {
        println!("no allocation data available");
    }
    for a in &allocations {
        println!(
            "{:<20} {:>12.1} SU available ({:.1} reserved)",
            a.account, a.available, a.reserved
        );
    }
    println!("current burn: {burn_per_hour:.1} SU/hour");
    Ok(0)
}

// --- files and tunnels ------------------------------------------------------

async fn sync(delete: bool, dry_run: bool, exclude: Vec<String>) -> anyhow::Result<i32> {
    let app = App::new()?;
    let cwd = std::env::current_dir().context("resolve current directory")?;
    let dir_name = cwd
        .file_name()
        .map(|n| sanitize_branch(&n.to_string_lossy()))
        .unwrap_or_else(|| "project".to_string());
    let dest = format!("{}/sync/{dir_name}", app.scratch());

    let opts = SyncOptions {
        delete,
        dry_run,
        exclude,
        filters: vec![":- .gitignore".to_string()],
    };
    app.remote.push_stream(&cwd, &dest, &opts).await?;
    println!(
        "{} {} -> {dest}",
        if dry_run { "would sync" } else { "synced" },
        cwd.display()
    );
    Ok(0)
}

async fn forward(json: bool, action: ForwardAction) -> anyhow::Result<i32> {
    let app = App::new()?;
    match action {
        ForwardAction::List => {
            let store = ForwardsStore::load()?;
            if json {
                let rows: Vec<serde_json::Value> = store
                    .entries()
                    .iter()
                    .map(|t| {
                        json!({
                            "pid": t.pid,
                            "jobId": t.job_id,
                            "localPort": t.local_port,
                            "remotePort": t.remote_port,
                            "node": t.node,
                            "startedAt": t.started_at,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
                return Ok(0);
            }
            if store.entries().is_empty() {
                println!("no live tunnels");
            }
            for t in store.entries() {
                println!(
                    "localhost:{} -> {}:{} (job {}, pid {})",
                    t.local_port, t.node, t.remote_port, t.job_id, t.pid
                );
            }
            Ok(0)
        }
        ForwardAction::Stop { local_port } => {
            let mut store = ForwardsStore::load()?;
            let entry = store
                .remove_by_port(local_port)
                .with_context(|| format!("no tunnel on local port {local_port}"))?;
            unsafe {
                libc::kill(entry.pid as libc::pid_t, libc::SIGTERM);
            }
            store.persist()?;
            println!("closed tunnel on localhost:{local_port}");
            Ok(0)
        }
        ForwardAction::Add {
            local_port,
            remote_port,
            job,
        } => {
            let remote_port = remote_port.unwrap_or(local_port);
            let jobs = app.slurm.list_jobs().await?;
            let target = match job {
                Some(id) => jobs.iter().find(|j| j.id == id),
                None => jobs.iter().find(|j| !j.nodes.is_empty()),
            }
            .context("no running job to tunnel to")?;
            let node = target
                .nodes
                .first()
                .context("job has no allocated node yet")?
                .clone();

            let child = std::process::Command::new("ssh")
                .arg("-L")
                .arg(format!("{local_port}:{node}:{remote_port}"))
                .arg("-N")
                .arg(&app.cfg.connection.host)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn()
                .context("spawn ssh tunnel")?;

            let mut store = ForwardsStore::load()?;
            store.add(TunnelEntry {
                pid: child.id() as i32,
                job_id: target.id,
                local_port,
                remote_port,
                node: node.clone(),
                started_at: chrono::Utc::now().timestamp(),
            });
            store.persist()?;
            println!("tunnel: localhost:{local_port} -> {node}:{remote_port}");
            Ok(0)
        }
    }
}

// --- local state ------------------------------------------------------------

fn env(json: bool, action: EnvAction) -> anyhow::Result<i32> {
    let mut store = EnvStore::load()?;
    match action {
        EnvAction::Set { key, value } => {
            store.set(key.clone(), value);
            store.persist()?;
            println!("set {key}");
        }
        EnvAction::Get { key } => match store.get(&key) {
            Some(value) => println!("{value}"),
            None => anyhow::bail!("{key} is not set"),
        },
        EnvAction::Unset { key } => {
            if !store.unset(&key) {
                anyhow::bail!("{key} is not set");
            }
            store.persist()?;
            println!("unset {key}");
        }
        EnvAction::List => {
            if json {
                println!("{}", serde_json::to_string_pretty(&json!(store.vars()))?);
            } else if store.vars().is_empty() {
                println!("no variables set");
            } else {
                for (key, value) in store.vars() {
                    println!("{key}={value}");
                }
            }
        }
    }
    Ok(0)
}

// --- misc -------------------------------------------------------------------

async fn exec(command: Vec<String>) -> anyhow::Result<i32> {
    let app = App::new()?;
    let out = app
        .remote
        .exec(&command.join(" "), Some(Duration::from_secs(300)))
        .await?;
    print!("{out}");
    Ok(0)
}

fn gpu(json: bool) -> anyhow::Result<i32> {
    if json {
        println!("{}", serde_json::to_string_pretty(&GPU_SPECS)?);
        return Ok(0);
    }
    println!(
        "{:<10} {:<12} {:>6} {:>9} {:>9} {:>8} {:>12}",
        "TYPE", "PARTITION", "VRAM", "SU/GPU-H", "MAX/USER", "MAX/JOB", "MAX TIME"
    );
    for spec in GPU_SPECS {
        println!(
            "{:<10} {:<12} {:>4}GB {:>9.1} {:>9} {:>8} {:>12}",
            spec.gpu_type.to_string(),
            spec.partition,
            spec.vram_gb,
            spec.su_per_gpu_hour,
            spec.max_per_user,
            spec.max_per_job,
            format_walltime(spec.max_walltime_secs),
        );
    }
    Ok(0)
}

fn upgrade() -> anyhow::Result<i32> {
    println!("self-update is handled by the installer; re-run it to pick up a new release");
    Ok(0)
}

// --- init -------------------------------------------------------------------

fn prompt_line(prompt: &str) -> anyhow::Result<String> {
    use std::io::Write as _;
    let mut out = std::io::stdout();
    out.write_all(prompt.as_bytes())?;
    out.flush()?;

    let mut buf = String::new();
    std::io::stdin().read_line(&mut buf)?;
    Ok(buf.trim().to_string())
}

fn prompt_with_default(prompt: &str, default: &str) -> anyhow::Result<String> {
    let value = prompt_line(&format!("{prompt} [{default}]: "))?;
    Ok(if value.is_empty() {
        default.to_string()
    } else {
        value
    })
}

async fn init() -> anyhow::Result<i32> {
    let path = config::config_path()?;
    println!("First-run setup (saved to {}).", path.display());

    let mut cfg = config::load_config().unwrap_or_default();

    cfg.connection.host = prompt_with_default(
        "SSH host alias",
        if cfg.connection.host.is_empty() {
            "hpc"
        } else {
            &cfg.connection.host
        },
    )?;
    let hostname = prompt_line("Cluster hostname (e.g. login.hpc.example.edu): ")?;
    if !hostname.is_empty() {
        cfg.connection.hostname = hostname;
    }
    cfg.connection.user = prompt_with_default("Cluster username", &cfg.connection.user)?;
    if cfg.connection.user.is_empty() {
        anyhow::bail!("a cluster username is required");
    }
    let account = prompt_line("Default account (ENTER to skip): ")?;
    if !account.is_empty() {
        cfg.defaults.account = Some(account);
    }

    config::save_config(&cfg)?;
    println!("Wrote {}.", path.display());
    println!("Try: rv status");
    Ok(0)
}
