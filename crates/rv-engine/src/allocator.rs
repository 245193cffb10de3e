//! The allocation engine: probe the cluster, enumerate every viable
//! submission strategy, fan them out concurrently, race them through the
//! scheduler, pick the winner, cancel the losers.
//!
//! Phases: compatibility filter → backfill probe → strategy generation →
//! ranking → submission → monitoring → verification.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use rv_core::error::{Result, RvError};
use rv_core::gpu::{GPU_SPECS, GpuSpec, GpuType};
use rv_core::timefmt::format_walltime;

use crate::api::{
    AllocationOutcome, BackfillProbe, GresCheck, Strategy, StrategyKind, Submission,
    SubmissionState, Topology, UserRequest,
};
use crate::script::{self, ScriptContext};
use crate::slurm::{JobState, ProbeRequest, SchedulerApi, gres_gpu_count, gres_gpu_label};

/// Coarse probe walltime grid: 30 m, 1 h, 2 h, 2:59, 4 h, 6 h.
const PROBE_GRID: &[u64] = &[1800, 3600, 7200, 10740, 14400, 21600];

/// A probe counts as backfillable when the scheduler would start it within
/// this many seconds.
const BACKFILL_NOW_SECS: i64 = 300;

/// Refinement pass step between the two sides of a backfill cliff.
const REFINE_STEP_SECS: u64 = 900;

/// Most strategies a single request fans out.
const MAX_STRATEGIES: usize = 16;

/// Polling parameters for the monitor loop.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// First poll interval.
    pub initial_interval: Duration,
    /// Backoff multiplier applied after every poll.
    pub multiplier: f64,
    /// Interval ceiling.
    pub max_interval: Duration,
    /// Overall ceiling on the allocation wait.
    pub timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            multiplier: 1.5,
            max_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2 * 3600),
        }
    }
}

/// Job ids of submissions that are still live, shared with the Ctrl-C
/// handler so an interrupted fan-out can cancel everything it started.
#[derive(Debug, Clone, Default)]
pub struct LiveJobs(Arc<Mutex<Vec<u64>>>);

impl LiveJobs {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, job_id: u64) {
        self.lock().push(job_id);
    }

    fn remove(&self, job_id: u64) {
        self.lock().retain(|id| *id != job_id);
    }

    /// Snapshot of the currently live job ids.
    pub fn ids(&self) -> Vec<u64> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u64>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// --- phase 1: compatibility filter ------------------------------------------

/// GPU types whose specs admit the request at all.
pub fn compatible_types(req: &UserRequest) -> Vec<&'static GpuSpec> {
    GPU_SPECS
        .iter()
        .filter(|spec| {
            if let Some(wanted) = req.gpu_type {
                if spec.gpu_type != wanted {
                    return false;
                }
            }
            if spec.vram_gb < req.vram_min_gb {
                return false;
            }
            if req.gpu_count > spec.max_per_user {
                return false;
            }
            match spec.gpu_type {
                GpuType::Mig => req.gpu_count == 1,
                GpuType::Rtx3090 => req.gpu_count <= spec.max_per_job,
                _ => {
                    // Single-node feasible, or an even 2-node split.
                    req.gpu_count <= spec.max_per_job
                        || (req.gpu_count > 1
                            && req.gpu_count.div_ceil(2) <= spec.per_node
                            && req.gpu_count <= spec.max_per_user)
                }
            }
        })
        .collect()
}

/// Per-node GPU count and node count the request would actually use on this
/// spec.
fn placement(req: &UserRequest, spec: &GpuSpec) -> (u32, u32) {
    if req.gpu_count <= spec.max_per_job {
        (req.gpu_count, 1)
    } else {
        (req.gpu_count.div_ceil(2), 2)
    }
}

// --- phase 2: backfill probe ------------------------------------------------

/// Probes every compatible non-instant type across the coarse walltime grid
/// in one batched remote call, then refines any cliff at 15-minute steps in
/// a second batched call.
pub async fn probe_backfill<S: SchedulerApi>(
    sched: &S,
    req: &UserRequest,
    specs: &[&'static GpuSpec],
) -> Result<HashMap<GpuType, BackfillProbe>> {
    let mut keys: Vec<(GpuType, u64)> = Vec::new();
    let mut probes: Vec<ProbeRequest> = Vec::new();
    for spec in specs {
        if matches!(spec.gpu_type, GpuType::Mig | GpuType::Rtx3090) {
            continue;
        }
        let (per_node, nodes) = placement(req, spec);
        for &walltime in PROBE_GRID {
            if walltime > spec.max_walltime_secs {
                continue;
            }
            keys.push((spec.gpu_type, walltime));
            probes.push(probe_request(req, spec, per_node, nodes, walltime));
        }
    }
    if probes.is_empty() {
        return Ok(HashMap::new());
    }

    debug!(n = probes.len(), "coarse backfill probe");
    let results = sched.probe_batch(&probes).await?;

    // Group the grid results per type.
    let mut by_type: HashMap<GpuType, Vec<(u64, bool)>> = HashMap::new();
    for ((gpu_type, walltime), result) in keys.iter().zip(results.iter()) {
        let backfills = matches!(result, Some(secs) if *secs < BACKFILL_NOW_SECS);
        by_type
            .entry(*gpu_type)
            .or_default()
            .push((*walltime, backfills));
    }

    // Identify cliffs and build the refinement pass.
    let mut out: HashMap<GpuType, BackfillProbe> = HashMap::new();
    let mut refine_keys: Vec<(GpuType, u64)> = Vec::new();
    let mut refine_probes: Vec<ProbeRequest> = Vec::new();
    for spec in specs {
        let Some(grid) = by_type.get(&spec.gpu_type) else {
            continue;
        };
        let best_yes = grid.iter().filter(|(_, b)| *b).map(|(w, _)| *w).max();
        let worst_no = grid.iter().filter(|(_, b)| !*b).map(|(w, _)| *w).min();

        match (best_yes, worst_no) {
            (Some(lo), None) => {
                out.insert(
                    spec.gpu_type,
                    BackfillProbe {
                        gpu_type: spec.gpu_type,
                        max_backfill_secs: lo,
                        fully_backfillable: true,
                    },
                );
            }
            (None, _) => {
                out.insert(
                    spec.gpu_type,
                    BackfillProbe {
                        gpu_type: spec.gpu_type,
                        max_backfill_secs: 0,
                        fully_backfillable: false,
                    },
                );
            }
            (Some(lo), Some(hi)) if hi > lo => {
                let (per_node, nodes) = placement(req, spec);
                let mut w = lo + REFINE_STEP_SECS;
                while w < hi {
                    refine_keys.push((spec.gpu_type, w));
                    refine_probes.push(probe_request(req, spec, per_node, nodes, w));
                    w += REFINE_STEP_SECS;
                }
                out.insert(
                    spec.gpu_type,
                    BackfillProbe {
                        gpu_type: spec.gpu_type,
                        max_backfill_secs: lo,
                        fully_backfillable: false,
                    },
                );
            }
            (Some(lo), Some(_)) => {
                // A non-monotonic grid (backfills at a longer walltime than
                // it refuses); keep the largest success.
                out.insert(
                    spec.gpu_type,
                    BackfillProbe {
                        gpu_type: spec.gpu_type,
                        max_backfill_secs: lo,
                        fully_backfillable: false,
                    },
                );
            }
        }
    }

    if !refine_probes.is_empty() {
        debug!(n = refine_probes.len(), "cliff refinement probe");
        let results = sched.probe_batch(&refine_probes).await?;
        for ((gpu_type, walltime), result) in refine_keys.iter().zip(results.iter()) {
            let backfills = matches!(result, Some(secs) if *secs < BACKFILL_NOW_SECS);
            if backfills {
                if let Some(probe) = out.get_mut(gpu_type) {
                    probe.max_backfill_secs = probe.max_backfill_secs.max(*walltime);
                }
            }
        }
    }

    Ok(out)
}

fn probe_request(
    req: &UserRequest,
    spec: &GpuSpec,
    per_node: u32,
    nodes: u32,
    walltime_secs: u64,
) -> ProbeRequest {
    ProbeRequest {
        partition: spec.partition.to_string(),
        gres: format!("gpu:{}:{per_node}", spec.gres_name),
        nodes,
        walltime_secs,
        account: req.account.clone(),
        constraint: spec.constraint.map(str::to_string),
    }
}

// --- phase 3: strategy generation -------------------------------------------

/// Enumerates every concrete plan worth fanning out for this request.
pub fn generate_strategies(
    req: &UserRequest,
    specs: &[&'static GpuSpec],
    probes: &HashMap<GpuType, BackfillProbe>,
) -> Vec<Strategy> {
    let mut out = Vec::new();
    for spec in specs {
        match spec.gpu_type {
            GpuType::Mig => {
                if req.gpu_count == 1 && req.vram_min_gb <= 10 {
                    out.push(build_strategy(
                        req,
                        spec,
                        StrategyKind::Mig,
                        1,
                        1,
                        req.total_time_secs.min(spec.max_walltime_secs),
                        None,
                        true,
                        30,
                    ));
                }
            }
            GpuType::Rtx3090 => {
                if req.gpu_count <= 2
                    && req.total_time_secs <= spec.max_walltime_secs
                    && req.vram_min_gb <= spec.vram_gb
                {
                    out.push(build_strategy(
                        req,
                        spec,
                        StrategyKind::Interactive,
                        req.gpu_count,
                        1,
                        req.total_time_secs,
                        None,
                        true,
                        30,
                    ));
                }
            }
            _ => {
                let probe = probes.get(&spec.gpu_type);
                let ceiling = probe.map(|p| p.max_backfill_secs).unwrap_or(0);

                // Single-node variants.
                if req.gpu_count <= spec.max_per_job {
                    push_direct_and_checkpoint(
                        &mut out,
                        req,
                        spec,
                        probe,
                        ceiling,
                        req.gpu_count,
                        1,
                    );
                }

                // Even 2-node split for larger requests.
                if req.gpu_count >= 4
                    && req.gpu_count % 2 == 0
                    && req.gpu_count / 2 <= spec.per_node
                {
                    push_direct_and_checkpoint(
                        &mut out,
                        req,
                        spec,
                        probe,
                        ceiling,
                        req.gpu_count / 2,
                        2,
                    );
                }
            }
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn push_direct_and_checkpoint(
    out: &mut Vec<Strategy>,
    req: &UserRequest,
    spec: &GpuSpec,
    probe: Option<&BackfillProbe>,
    ceiling: u64,
    per_node: u32,
    nodes: u32,
) {
    if req.total_time_secs <= spec.max_walltime_secs {
        let eligible = ceiling > 0 && req.total_time_secs <= ceiling;
        let kind = if eligible {
            StrategyKind::Backfill
        } else {
            StrategyKind::Direct
        };
        // When a backfill ceiling exists below the full walltime, a
        // time-min floor lets the scheduler start the job in a shorter
        // slot.
        let time_min = if !eligible && ceiling > 0 {
            Some(ceiling)
        } else {
            None
        };
        let wait = estimate_wait(req.total_time_secs, probe, eligible);
        out.push(build_strategy(
            req,
            spec,
            kind,
            per_node,
            nodes,
            req.total_time_secs,
            time_min,
            eligible,
            wait,
        ));
    }

    if ceiling > 0 && req.total_time_secs > ceiling {
        out.push(build_strategy(
            req,
            spec,
            StrategyKind::Checkpoint,
            per_node,
            nodes,
            ceiling,
            None,
            true,
            30,
        ));
    }
}

/// 30 s for a backfill-eligible strategy; otherwise a rough queue estimate
/// scaled by how far the walltime overshoots the backfill ceiling, clamped
/// to a day; 3600 s when there is no probe data at all.
fn estimate_wait(walltime_secs: u64, probe: Option<&BackfillProbe>, eligible: bool) -> u64 {
    if eligible {
        return 30;
    }
    match probe {
        Some(p) if p.max_backfill_secs > 0 => {
            let est = 3600.0 * walltime_secs as f64 / p.max_backfill_secs as f64;
            (est as u64).min(86400)
        }
        _ => 3600,
    }
}

#[allow(clippy::too_many_arguments)]
fn build_strategy(
    req: &UserRequest,
    spec: &GpuSpec,
    kind: StrategyKind,
    gpus_per_node: u32,
    nodes: u32,
    walltime_secs: u64,
    time_min_secs: Option<u64>,
    backfill_eligible: bool,
    estimated_wait_secs: u64,
) -> Strategy {
    let topology = if nodes > 1 {
        Topology::MultiNode
    } else {
        Topology::SingleNode
    };
    let total_gpus = gpus_per_node * nodes;
    let estimated_su =
        spec.su_per_gpu_hour * total_gpus as f64 * (req.total_time_secs as f64 / 3600.0);
    let id = format!("{}-{}-{}n", spec.gpu_type, kind.as_str(), nodes);
    let label = format!(
        "{total_gpus}x {gpu_type} on {nodes} node{s}, {walltime} walltime ({kind})",
        gpu_type = spec.gpu_type,
        s = if nodes > 1 { "s" } else { "" },
        walltime = format_walltime(walltime_secs),
        kind = kind.as_str(),
    );

    Strategy {
        id,
        kind,
        gpu_type: spec.gpu_type,
        partition: spec.partition.to_string(),
        gres: format!("gpu:{}:{gpus_per_node}", spec.gres_name),
        walltime_secs,
        time_min_secs,
        gpus_per_node,
        nodes,
        topology,
        checkpoint: kind == StrategyKind::Checkpoint,
        estimated_su,
        estimated_wait_secs,
        backfill_eligible,
        constraint: spec.constraint.map(str::to_string),
        label,
        score: 0.0,
    }
}

// --- phase 4: ranking ---------------------------------------------------------

/// Scores, sorts, dominance-prunes (within a `(type, topology, checkpoint)`
/// bucket only; cross-type diversity is the point of the fan-out), and caps
/// the strategy list.
pub fn rank_strategies(mut strategies: Vec<Strategy>, req: &UserRequest) -> Vec<Strategy> {
    let max_su = strategies
        .iter()
        .map(|s| s.estimated_su)
        .fold(0.0_f64, f64::max);

    for s in &mut strategies {
        let mut score = 0.0;
        if s.backfill_eligible {
            score += 10_000.0;
        }
        score -= s.estimated_wait_secs as f64;
        if req.gpu_type == Some(s.gpu_type) {
            score += 500.0;
        }
        score += if max_su > 0.0 {
            2000.0 * (1.0 - s.estimated_su / max_su)
        } else {
            2000.0
        };
        if s.checkpoint {
            score -= 200.0;
        }
        match s.kind {
            StrategyKind::Mig => score += 1000.0,
            StrategyKind::Interactive => score += 300.0,
            _ => {}
        }
        s.score = score;
    }

    strategies.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Strategy> = Vec::new();
    for candidate in strategies {
        let dominated = kept.iter().any(|k| {
            k.gpu_type == candidate.gpu_type
                && k.topology == candidate.topology
                && k.checkpoint == candidate.checkpoint
                && k.estimated_wait_secs <= candidate.estimated_wait_secs
                && k.estimated_su <= candidate.estimated_su
        });
        if !dominated {
            kept.push(candidate);
        }
    }
    kept.truncate(MAX_STRATEGIES);
    kept
}

// --- phase 5: submission ------------------------------------------------------

/// Submits every strategy concurrently (all-settled; per-strategy failures
/// are absorbed) and returns the submissions that the scheduler accepted.
/// Fails only when nothing was accepted.
pub async fn submit_strategies<S: SchedulerApi>(
    sched: &S,
    strategies: Vec<Strategy>,
    scripts: Vec<String>,
    env_vars: &BTreeMap<String, String>,
    live: &LiveJobs,
) -> Result<Vec<Submission>> {
    let futures = strategies
        .into_iter()
        .zip(scripts.into_iter())
        .map(|(strategy, script)| async move {
            match sched.submit(&script).await {
                Ok(job_id) => {
                    if !env_vars.is_empty() {
                        if let Err(err) = sched.write_env_file(job_id, env_vars).await {
                            warn!(job_id, "env file write failed: {err}");
                        }
                    }
                    info!(job_id, strategy = %strategy.id, "submitted");
                    Some(Submission {
                        strategy,
                        job_id,
                        state: SubmissionState::Pending,
                        nodes: Vec::new(),
                    })
                }
                Err(err) => {
                    warn!(strategy = %strategy.id, "submission failed: {err}");
                    None
                }
            }
        });

    let submissions: Vec<Submission> = join_all(futures).await.into_iter().flatten().collect();
    if submissions.is_empty() {
        return Err(RvError::Allocator(
            "every submission failed".to_string(),
        ));
    }
    for sub in &submissions {
        live.add(sub.job_id);
    }
    Ok(submissions)
}

// --- phase 6: monitoring ------------------------------------------------------

/// Polls the live listing until one submission runs (or completes between
/// polls), cancels the rest, and returns the winner's index and the elapsed
/// allocation time in milliseconds.
///
/// Submissions that vanish from the listing are reconciled against the last
/// hour of accounting history: `COMPLETED` wins, other terminal states mark
/// the submission failed, and a missing record (accounting lag) leaves the
/// state untouched for the next tick.
pub async fn monitor_allocation<S: SchedulerApi>(
    sched: &S,
    submissions: &mut [Submission],
    cfg: &MonitorConfig,
    live: &LiveJobs,
) -> Result<(usize, u64)> {
    let started = Instant::now();
    let mut interval = cfg.initial_interval;

    loop {
        if started.elapsed() > cfg.timeout {
            return Err(RvError::Allocator("allocation timed out".to_string()));
        }

        let jobs = sched.list_jobs().await?;
        let by_id: HashMap<u64, &crate::slurm::Job> =
            jobs.iter().map(|j| (j.id, j)).collect();

        // Refresh present submissions.
        let mut vanished: Vec<usize> = Vec::new();
        for (idx, sub) in submissions.iter_mut().enumerate() {
            if sub.state.is_settled() {
                continue;
            }
            match by_id.get(&sub.job_id) {
                Some(job) => {
                    sub.nodes = job.nodes.clone();
                    sub.state = match job.state {
                        JobState::Pending | JobState::Suspended => SubmissionState::Pending,
                        JobState::Running | JobState::Completing => SubmissionState::Running,
                        JobState::Completed => SubmissionState::Completed,
                        JobState::Unknown => sub.state,
                        _ => SubmissionState::Failed,
                    };
                }
                None => vanished.push(idx),
            }
        }

        // Vanished-job reconciliation through accounting.
        if !vanished.is_empty() {
            let history = sched.list_history("now-1hour").await?;
            for idx in vanished {
                let sub = &mut submissions[idx];
                match history.iter().find(|r| r.id == sub.job_id) {
                    Some(rec) if rec.state == JobState::Completed => {
                        debug!(job_id = sub.job_id, "vanished job completed between polls");
                        sub.state = SubmissionState::Completed;
                        if sub.nodes.is_empty() {
                            sub.nodes = rec.nodes.clone();
                        }
                    }
                    Some(rec) if rec.state.is_terminal() => {
                        debug!(job_id = sub.job_id, state = %rec.state, "vanished job failed");
                        sub.state = SubmissionState::Failed;
                    }
                    // Accounting lag: keep the previous state and retry.
                    _ => {}
                }
            }
        }

        for sub in submissions.iter() {
            if sub.state.is_settled() {
                live.remove(sub.job_id);
            }
        }

        // Winner: the first submission observed running (or completed
        // between polls), lowest index within the snapshot.
        let winner = submissions.iter().position(|s| {
            matches!(
                s.state,
                SubmissionState::Running | SubmissionState::Completed
            )
        });

        if let Some(winner_idx) = winner {
            let loser_ids: Vec<u64> = submissions
                .iter()
                .enumerate()
                .filter(|(idx, s)| *idx != winner_idx && !s.state.is_settled())
                .map(|(_, s)| s.job_id)
                .collect();
            if !loser_ids.is_empty() {
                sched.cancel_many(&loser_ids).await?;
                for sub in submissions.iter_mut() {
                    if loser_ids.contains(&sub.job_id) {
                        sub.state = SubmissionState::Cancelled;
                        live.remove(sub.job_id);
                    }
                }
            }
            let elapsed_ms = started.elapsed().as_millis() as u64;
            info!(
                job_id = submissions[winner_idx].job_id,
                elapsed_ms, "allocation won"
            );
            return Ok((winner_idx, elapsed_ms));
        }

        if submissions.iter().all(|s| s.state.is_settled()) {
            return Err(RvError::Allocator(
                "all submissions reached terminal states without starting".to_string(),
            ));
        }

        tokio::time::sleep(interval).await;
        let next = interval.as_secs_f64() * cfg.multiplier;
        interval = Duration::from_secs_f64(next).min(cfg.max_interval);
    }
}

// --- phase 7: verification ----------------------------------------------------

/// Compares the winning node's gres against what the strategy asked for.
/// Best-effort: any query failure yields `None`.
pub async fn verify_allocation<S: SchedulerApi>(
    sched: &S,
    winner: &Submission,
) -> Option<GresCheck> {
    let node = winner.nodes.first()?;
    let gres = match sched.node_gres(node).await {
        Ok(g) => g,
        Err(err) => {
            warn!(%node, "verification query failed: {err}");
            return None;
        }
    };

    let observed_label = gres_gpu_label(&gres).unwrap_or_default();
    let observed_count = gres_gpu_count(&gres);
    let spec = winner.strategy.gpu_type.spec();

    // A bare `a100` is ambiguous between the 40 GB and 80 GB variants, so it
    // matches either; everything else must match the spec's gres name.
    let mismatch = !observed_label.is_empty() && observed_label != spec.gres_name;

    let mut warnings = Vec::new();
    if winner.strategy.nodes > 1 && !spec.infiniband {
        warnings.push(format!(
            "multi-node job on partition {} without a high-bandwidth interconnect",
            winner.strategy.partition
        ));
    }
    if winner.strategy.gpus_per_node > 1 && !spec.nvlink {
        warnings.push(format!(
            "multi-GPU job on {} nodes without NVLink",
            winner.strategy.gpu_type
        ));
    }

    Some(GresCheck {
        observed_label,
        observed_count,
        mismatch,
        warnings,
    })
}

// --- orchestration ------------------------------------------------------------

/// Runs the whole pipeline for one request and returns the winning
/// allocation.
pub async fn allocate<S: SchedulerApi>(
    sched: &S,
    req: &UserRequest,
    ctx: &ScriptContext<'_>,
    env_vars: &BTreeMap<String, String>,
    cfg: &MonitorConfig,
    live: &LiveJobs,
) -> Result<AllocationOutcome> {
    let specs = compatible_types(req);
    if specs.is_empty() {
        return Err(RvError::Allocator(format!(
            "no GPU type admits {} GPU(s) with a {} GB VRAM floor",
            req.gpu_count, req.vram_min_gb
        )));
    }

    let probes = probe_backfill(sched, req, &specs).await?;
    let strategies = rank_strategies(generate_strategies(req, &specs, &probes), req);
    if strategies.is_empty() {
        return Err(RvError::Allocator(
            "no viable submission strategy for this request".to_string(),
        ));
    }
    info!(n = strategies.len(), "fanning out strategies");

    let scripts: Vec<String> = strategies
        .iter()
        .map(|s| script::render(s, req, ctx))
        .collect();

    let mut submissions = submit_strategies(sched, strategies, scripts, env_vars, live).await?;
    let (winner_idx, allocation_ms) =
        monitor_allocation(sched, &mut submissions, cfg, live).await?;

    let winner = submissions[winner_idx].clone();
    let verification = verify_allocation(sched, &winner).await;

    Ok(AllocationOutcome {
        winner,
        submissions,
        allocation_ms,
        verification,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slurm::{Job, JobAccounting};
    use std::sync::Mutex as StdMutex;

    fn request(gpu_count: u32, gpu_type: Option<GpuType>, total_secs: u64) -> UserRequest {
        UserRequest {
            gpu_count,
            gpu_type,
            total_time_secs: total_secs,
            total_time_formatted: format_walltime(total_secs),
            job_name: "train".to_string(),
            account: "lab-acct".to_string(),
            user: "abc1de".to_string(),
            command: Some("python train.py".to_string()),
            work_dir: None,
            venv_path: None,
            mem_gb: None,
            vram_min_gb: 0,
            notify_endpoint: None,
            shared_cache: None,
            exclude_nodes: Vec::new(),
        }
    }

    fn live_job(id: u64, state: JobState, nodes: &str) -> Job {
        Job {
            id,
            name: "train".to_string(),
            state,
            elapsed: "0:10".to_string(),
            elapsed_secs: Some(10),
            limit: "02:00:00".to_string(),
            limit_secs: Some(7200),
            partition: "gpu".to_string(),
            gres: "gpu:a100:4".to_string(),
            nodes: crate::slurm::expand_nodelist(nodes),
            reason: String::new(),
        }
    }

    /// Scripted scheduler: each `list_jobs` pops the next snapshot; the
    /// last one repeats.
    #[derive(Default)]
    struct FakeScheduler {
        snapshots: StdMutex<Vec<Vec<Job>>>,
        history: StdMutex<Vec<JobAccounting>>,
        cancelled: StdMutex<Vec<Vec<u64>>>,
        submitted: StdMutex<Vec<String>>,
        probe_answers: StdMutex<Vec<Vec<Option<i64>>>>,
        node_gres: String,
    }

    impl SchedulerApi for FakeScheduler {
        async fn list_jobs(&self) -> Result<Vec<Job>> {
            let mut snaps = self.snapshots.lock().unwrap();
            if snaps.len() > 1 {
                Ok(snaps.remove(0))
            } else {
                Ok(snaps.first().cloned().unwrap_or_default())
            }
        }

        async fn list_history(&self, _since: &str) -> Result<Vec<JobAccounting>> {
            Ok(self.history.lock().unwrap().clone())
        }

        async fn submit(&self, script: &str) -> Result<u64> {
            let mut subs = self.submitted.lock().unwrap();
            subs.push(script.to_string());
            Ok(1000 + subs.len() as u64)
        }

        async fn cancel_many(&self, job_ids: &[u64]) -> Result<()> {
            self.cancelled.lock().unwrap().push(job_ids.to_vec());
            Ok(())
        }

        async fn probe_batch(&self, probes: &[ProbeRequest]) -> Result<Vec<Option<i64>>> {
            let mut answers = self.probe_answers.lock().unwrap();
            if answers.is_empty() {
                Ok(vec![None; probes.len()])
            } else {
                Ok(answers.remove(0))
            }
        }

        async fn write_env_file(
            &self,
            _job_id: u64,
            _vars: &BTreeMap<String, String>,
        ) -> Result<()> {
            Ok(())
        }

        async fn node_gres(&self, _node: &str) -> Result<String> {
            Ok(self.node_gres.clone())
        }
    }

    fn submission(idx: u64, spec: &'static GpuSpec) -> Submission {
        let req = request(4, None, 7200);
        Submission {
            strategy: build_strategy(
                &req,
                spec,
                StrategyKind::Direct,
                4,
                1,
                7200,
                None,
                false,
                600,
            ),
            job_id: idx,
            state: SubmissionState::Pending,
            nodes: Vec::new(),
        }
    }

    #[test]
    fn compatible_filter_four_gpus_untyped() {
        let req = request(4, None, 7200);
        let types: Vec<GpuType> = compatible_types(&req)
            .iter()
            .map(|s| s.gpu_type)
            .collect();
        assert_eq!(
            types,
            vec![
                GpuType::A6000,
                GpuType::A40,
                GpuType::A100_40,
                GpuType::A100_80,
                GpuType::V100,
                GpuType::H200,
            ]
        );
    }

    #[test]
    fn compatible_filter_honors_vram_floor_and_type() {
        let mut req = request(1, None, 3600);
        req.vram_min_gb = 50;
        let types: Vec<GpuType> = compatible_types(&req)
            .iter()
            .map(|s| s.gpu_type)
            .collect();
        assert_eq!(types, vec![GpuType::A100_80, GpuType::H200]);

        let req = request(4, Some(GpuType::A40), 7200);
        let types: Vec<GpuType> = compatible_types(&req)
            .iter()
            .map(|s| s.gpu_type)
            .collect();
        assert_eq!(types, vec![GpuType::A40]);
    }

    #[test]
    fn generated_strategies_hold_invariants() {
        let req = request(8, None, 24 * 3600);
        let specs = compatible_types(&req);
        let mut probes = HashMap::new();
        probes.insert(
            GpuType::A100_80,
            BackfillProbe {
                gpu_type: GpuType::A100_80,
                max_backfill_secs: 3 * 3600,
                fully_backfillable: false,
            },
        );
        let strategies = generate_strategies(&req, &specs, &probes);
        assert!(!strategies.is_empty());
        for s in &strategies {
            assert_eq!(s.gpus_per_node * s.nodes, req.gpu_count, "{}", s.id);
            assert!(
                s.walltime_secs <= s.gpu_type.spec().max_walltime_secs,
                "{}",
                s.id
            );
            match s.topology {
                Topology::SingleNode => assert_eq!(s.nodes, 1),
                Topology::MultiNode => assert_eq!(s.nodes, 2),
            }
        }

        // A 3-hour ceiling against a 24-hour request produces a checkpoint
        // variant with segment walltime equal to the ceiling.
        let ckpt: Vec<&Strategy> = strategies
            .iter()
            .filter(|s| s.checkpoint && s.gpu_type == GpuType::A100_80)
            .collect();
        assert!(!ckpt.is_empty());
        assert!(ckpt.iter().all(|s| s.walltime_secs == 3 * 3600));
    }

    #[test]
    fn mig_only_for_single_small_requests() {
        let req = request(1, None, 3600);
        let specs = compatible_types(&req);
        let strategies = generate_strategies(&req, &specs, &HashMap::new());
        assert!(strategies.iter().any(|s| s.kind == StrategyKind::Mig));

        let mut req = request(1, None, 3600);
        req.vram_min_gb = 11;
        let specs = compatible_types(&req);
        let strategies = generate_strategies(&req, &specs, &HashMap::new());
        assert!(strategies.iter().all(|s| s.kind != StrategyKind::Mig));
    }

    #[test]
    fn ranking_prefers_backfill_and_keeps_cross_type_diversity() {
        let req = request(4, None, 7200);
        let specs = compatible_types(&req);
        let mut probes = HashMap::new();
        probes.insert(
            GpuType::A100_80,
            BackfillProbe {
                gpu_type: GpuType::A100_80,
                max_backfill_secs: 4 * 3600,
                fully_backfillable: true,
            },
        );
        let ranked = rank_strategies(generate_strategies(&req, &specs, &probes), &req);

        // The backfill-eligible a100_80 direct strategy outranks everything.
        assert!(ranked[0].backfill_eligible);
        assert_eq!(ranked[0].gpu_type, GpuType::A100_80);

        // Other types survive pruning: diversity across types is the point.
        let distinct: std::collections::HashSet<GpuType> =
            ranked.iter().map(|s| s.gpu_type).collect();
        assert!(distinct.len() >= 4);
        assert!(ranked.len() <= 16);
    }

    #[test]
    fn dominance_prune_is_per_bucket() {
        let req = request(4, None, 7200);
        let spec_a100 = GpuType::A100_80.spec();
        let spec_v100 = GpuType::V100.spec();

        // Same bucket: the second is dominated (equal wait, higher SU rate
        // comes from the same spec, so craft SU by hand).
        let mut cheap = build_strategy(
            &req, spec_a100, StrategyKind::Direct, 4, 1, 7200, None, false, 600,
        );
        cheap.estimated_su = 10.0;
        let mut costly = cheap.clone();
        costly.id = "a100_80-direct-1n-b".to_string();
        costly.estimated_su = 20.0;

        // Different type, dominated on both axes, but never pruned.
        let mut other = build_strategy(
            &req, spec_v100, StrategyKind::Direct, 4, 1, 7200, None, false, 900,
        );
        other.estimated_su = 30.0;

        let ranked = rank_strategies(vec![cheap, costly, other], &req);
        assert_eq!(ranked.len(), 2);
        assert!(ranked.iter().any(|s| s.gpu_type == GpuType::V100));
        assert!(ranked.iter().any(|s| s.estimated_su == 10.0));
    }

    #[test]
    fn wait_estimates_follow_probe_data() {
        let probe = BackfillProbe {
            gpu_type: GpuType::A40,
            max_backfill_secs: 3600,
            fully_backfillable: false,
        };
        assert_eq!(estimate_wait(7200, Some(&probe), true), 30);
        assert_eq!(estimate_wait(7200, Some(&probe), false), 7200);
        // Clamped to a day.
        assert_eq!(estimate_wait(48 * 3600, Some(&probe), false), 86400);
        assert_eq!(estimate_wait(7200, None, false), 3600);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_finds_cliff_and_refines() {
        let req = request(4, Some(GpuType::A40), 6 * 3600);
        let specs = compatible_types(&req);
        assert_eq!(specs.len(), 1);

        let fake = FakeScheduler {
            // Grid {30m,1h,2h,2:59,4h,6h}: backfills through 2h, not after.
            probe_answers: StdMutex::new(vec![
                vec![Some(10), Some(10), Some(10), None, Some(100_000), None],
                // Refinement between 7200 and 10740 at 900 s steps:
                // 8100, 9000, 9900, 10620... -> 8100 and 9000 backfill.
                vec![Some(10), Some(10), None],
            ]),
            ..Default::default()
        };

        let probes = probe_backfill(&fake, &req, &specs).await.unwrap();
        let probe = probes.get(&GpuType::A40).unwrap();
        assert!(!probe.fully_backfillable);
        assert_eq!(probe.max_backfill_secs, 9000);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_all_backfillable_takes_largest() {
        let req = request(4, Some(GpuType::A40), 6 * 3600);
        let specs = compatible_types(&req);
        let fake = FakeScheduler {
            probe_answers: StdMutex::new(vec![vec![Some(5); 6]]),
            ..Default::default()
        };
        let probes = probe_backfill(&fake, &req, &specs).await.unwrap();
        let probe = probes.get(&GpuType::A40).unwrap();
        assert!(probe.fully_backfillable);
        assert_eq!(probe.max_backfill_secs, 21600);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_picks_first_running_and_cancels_losers() {
        let spec = GpuType::A100_80.spec();
        let mut subs = vec![submission(1, spec), submission(2, spec), submission(3, spec)];

        let fake = FakeScheduler {
            snapshots: StdMutex::new(vec![
                vec![
                    live_job(1, JobState::Pending, ""),
                    live_job(2, JobState::Pending, ""),
                    live_job(3, JobState::Pending, ""),
                ],
                vec![
                    live_job(1, JobState::Pending, ""),
                    live_job(2, JobState::Running, "udc-an[1-2]"),
                    live_job(3, JobState::Pending, ""),
                ],
            ]),
            ..Default::default()
        };

        let live = LiveJobs::new();
        let (winner, _ms) =
            monitor_allocation(&fake, &mut subs, &MonitorConfig::default(), &live)
                .await
                .unwrap();

        assert_eq!(winner, 1);
        assert_eq!(subs[1].state, SubmissionState::Running);
        assert_eq!(subs[1].nodes, vec!["udc-an1", "udc-an2"]);
        assert_eq!(subs[0].state, SubmissionState::Cancelled);
        assert_eq!(subs[2].state, SubmissionState::Cancelled);

        // One cancel call carrying both losers.
        let cancelled = fake.cancelled.lock().unwrap();
        assert_eq!(cancelled.as_slice(), &[vec![1, 3]]);
        assert!(live.ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_reconciles_vanished_winner() {
        let spec = GpuType::A100_80.spec();
        let mut subs = vec![submission(1, spec), submission(2, spec)];

        let fake = FakeScheduler {
            snapshots: StdMutex::new(vec![
                vec![
                    live_job(1, JobState::Pending, ""),
                    live_job(2, JobState::Pending, ""),
                ],
                // Job 1 vanishes; accounting says it completed.
                vec![live_job(2, JobState::Pending, "")],
            ]),
            history: StdMutex::new(vec![JobAccounting {
                id: 1,
                name: "train".to_string(),
                state: JobState::Completed,
                elapsed_secs: 4,
                exit_code: 0,
                partition: "gpu".to_string(),
                nodes: vec!["udc-an5".to_string()],
            }]),
            ..Default::default()
        };

        let live = LiveJobs::new();
        let (winner, ms) =
            monitor_allocation(&fake, &mut subs, &MonitorConfig::default(), &live)
                .await
                .unwrap();

        assert_eq!(winner, 0);
        assert_eq!(subs[0].state, SubmissionState::Completed);
        assert_eq!(subs[0].nodes, vec!["udc-an5"]);
        assert_eq!(subs[1].state, SubmissionState::Cancelled);
        assert_eq!(fake.cancelled.lock().unwrap().as_slice(), &[vec![2]]);
        // Paused-clock test: elapsed covers at least the first backoff tick.
        assert!(ms >= 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_leaves_lagging_vanished_jobs_pending() {
        let spec = GpuType::A100_80.spec();
        let mut subs = vec![submission(1, spec), submission(2, spec)];

        let fake = FakeScheduler {
            snapshots: StdMutex::new(vec![
                vec![
                    live_job(1, JobState::Pending, ""),
                    live_job(2, JobState::Pending, ""),
                ],
                // Job 1 vanishes with no accounting record yet.
                vec![live_job(2, JobState::Pending, "")],
                // Next tick it reappears running (listing hiccup).
                vec![
                    live_job(1, JobState::Running, "udc-an7"),
                    live_job(2, JobState::Pending, ""),
                ],
            ]),
            ..Default::default()
        };

        let live = LiveJobs::new();
        let (winner, _) =
            monitor_allocation(&fake, &mut subs, &MonitorConfig::default(), &live)
                .await
                .unwrap();
        assert_eq!(winner, 0);
        assert_eq!(subs[0].state, SubmissionState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_fails_when_all_submissions_die() {
        let spec = GpuType::A100_80.spec();
        let mut subs = vec![submission(1, spec), submission(2, spec)];

        let fake = FakeScheduler {
            snapshots: StdMutex::new(vec![vec![
                live_job(1, JobState::Failed, ""),
                live_job(2, JobState::Cancelled, ""),
            ]]),
            ..Default::default()
        };

        let live = LiveJobs::new();
        let err = monitor_allocation(&fake, &mut subs, &MonitorConfig::default(), &live)
            .await
            .unwrap_err();
        assert!(matches!(err, RvError::Allocator(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn verification_flags_mismatch_but_not_ambiguous_a100() {
        let spec = GpuType::A100_80.spec();
        let mut sub = submission(1, spec);
        sub.nodes = vec!["udc-an1".to_string()];

        let fake = FakeScheduler {
            node_gres: "gpu:a100:8".to_string(),
            ..Default::default()
        };
        let check = verify_allocation(&fake, &sub).await.unwrap();
        assert!(!check.mismatch);
        assert_eq!(check.observed_count, 8);

        let fake = FakeScheduler {
            node_gres: "gpu:v100:4".to_string(),
            ..Default::default()
        };
        let check = verify_allocation(&fake, &sub).await.unwrap();
        assert!(check.mismatch);
    }

    #[tokio::test(start_paused = true)]
    async fn submit_absorbs_partial_failures() {
        // FakeScheduler::submit always succeeds; simulate failure by a
        // scheduler wrapper that rejects a marked script.
        struct Flaky(FakeScheduler);
        impl SchedulerApi for Flaky {
            async fn list_jobs(&self) -> Result<Vec<Job>> {
                self.0.list_jobs().await
            }
            async fn list_history(&self, since: &str) -> Result<Vec<JobAccounting>> {
                self.0.list_history(since).await
            }
            async fn submit(&self, script: &str) -> Result<u64> {
                if script.contains("#FAIL") {
                    return Err(RvError::Parse("no submission acknowledgement".into()));
                }
                self.0.submit(script).await
            }
            async fn cancel_many(&self, ids: &[u64]) -> Result<()> {
                self.0.cancel_many(ids).await
            }
            async fn probe_batch(&self, probes: &[ProbeRequest]) -> Result<Vec<Option<i64>>> {
                self.0.probe_batch(probes).await
            }
            async fn write_env_file(
                &self,
                job_id: u64,
                vars: &BTreeMap<String, String>,
            ) -> Result<()> {
                self.0.write_env_file(job_id, vars).await
            }
            async fn node_gres(&self, node: &str) -> Result<String> {
                self.0.node_gres(node).await
            }
        }

        let req = request(4, None, 7200);
        let spec = GpuType::A100_80.spec();
        let strategies = vec![
            build_strategy(&req, spec, StrategyKind::Direct, 4, 1, 7200, None, false, 600),
            build_strategy(&req, spec, StrategyKind::Checkpoint, 4, 1, 3600, None, true, 30),
        ];
        let scripts = vec!["#FAIL".to_string(), "#!/bin/bash".to_string()];

        let flaky = Flaky(FakeScheduler::default());
        let live = LiveJobs::new();
        let subs = submit_strategies(&flaky, strategies, scripts, &BTreeMap::new(), &live)
            .await
            .unwrap();
        assert_eq!(subs.len(), 1);
        assert!(subs[0].strategy.checkpoint);
        assert_eq!(live.ids(), vec![subs[0].job_id]);
    }
}
