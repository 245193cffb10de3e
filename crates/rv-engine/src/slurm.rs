//! Typed adapter over the remote batch scheduler's CLI surface.
//!
//! Parsers are pure (text in, data out) and skip malformed rows rather than
//! failing the whole listing; the scheduler's textual output drifts between
//! versions and the tool has to stay usable against it. Primary-path parsing
//! failures (submission ack, empty batch sections) are fatal; auxiliary
//! queries (allocations, quotas, fair-share) fall back to defaults.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use rv_core::error::{Result, RvError};
use rv_core::timefmt::parse_elapsed;

use crate::remote::RemoteExecutor;

/// A live or historical job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum JobState {
    Pending,
    Running,
    Completing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    OutOfMemory,
    NodeFail,
    BootFail,
    Deadline,
    Preempted,
    Suspended,
    /// Anything the enum does not know; kept so new scheduler versions do
    /// not break the listing.
    Unknown,
}

impl JobState {
    /// True when the job can never run again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed
                | JobState::Failed
                | JobState::Cancelled
                | JobState::Timeout
                | JobState::OutOfMemory
                | JobState::NodeFail
                | JobState::BootFail
                | JobState::Deadline
                | JobState::Preempted
        )
    }

    /// True for states that are neither terminal nor firmly live
    /// (`COMPLETING`, `UNKNOWN`); the tailer resolves these through
    /// accounting.
    pub fn is_transitional(self) -> bool {
        matches!(self, JobState::Completing | JobState::Unknown)
    }
}

impl FromStr for JobState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // Accounting emits e.g. "CANCELLED by 123456"; the first word is the
        // state.
        let word = s.split_whitespace().next().unwrap_or("");
        Ok(match word {
            "PENDING" => JobState::Pending,
            "RUNNING" => JobState::Running,
            "COMPLETING" => JobState::Completing,
            "COMPLETED" => JobState::Completed,
            "FAILED" => JobState::Failed,
            "CANCELLED" => JobState::Cancelled,
            "TIMEOUT" => JobState::Timeout,
            "OUT_OF_MEMORY" => JobState::OutOfMemory,
            "NODE_FAIL" => JobState::NodeFail,
            "BOOT_FAIL" => JobState::BootFail,
            "DEADLINE" => JobState::Deadline,
            "PREEMPTED" => JobState::Preempted,
            "SUSPENDED" => JobState::Suspended,
            _ => JobState::Unknown,
        })
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Completing => "COMPLETING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
            JobState::Timeout => "TIMEOUT",
            JobState::OutOfMemory => "OUT_OF_MEMORY",
            JobState::NodeFail => "NODE_FAIL",
            JobState::BootFail => "BOOT_FAIL",
            JobState::Deadline => "DEADLINE",
            JobState::Preempted => "PREEMPTED",
            JobState::Suspended => "SUSPENDED",
            JobState::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// One row of the live listing.
#[derive(Debug, Clone)]
pub struct Job {
    /// Scheduler job id.
    pub id: u64,
    /// Job name.
    pub name: String,
    /// Current state.
    pub state: JobState,
    /// Elapsed time as printed.
    pub elapsed: String,
    /// Elapsed time in seconds, when parseable.
    pub elapsed_secs: Option<u64>,
    /// Time limit as printed.
    pub limit: String,
    /// Time limit in seconds, when parseable (`UNLIMITED` is `None`).
    pub limit_secs: Option<u64>,
    /// Partition the job sits in.
    pub partition: String,
    /// Requested gres string; empty when none.
    pub gres: String,
    /// Allocated nodes, expanded from range notation.
    pub nodes: Vec<String>,
    /// Free-form pending reason.
    pub reason: String,
}

/// One row of the accounting history.
#[derive(Debug, Clone)]
pub struct JobAccounting {
    /// Scheduler job id.
    pub id: u64,
    /// Job name.
    pub name: String,
    /// Terminal (or last known) state.
    pub state: JobState,
    /// Elapsed seconds.
    pub elapsed_secs: u64,
    /// Unified exit code (128 + signal when signal-terminated).
    pub exit_code: i32,
    /// Partition the job ran in.
    pub partition: String,
    /// Nodes the job ran on.
    pub nodes: Vec<String>,
}

/// Scheduler-reported node state, reduced to what the allocator cares
/// about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum NodeState {
    Idle,
    Mixed,
    Allocated,
    Draining,
    Down,
    Unknown,
}

/// One row of the node inventory.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Node name.
    pub name: String,
    /// Reduced node state.
    pub state: NodeState,
    /// Raw gres string.
    pub gres: String,
    /// Allocated/idle/other/total CPU counts.
    pub cpus: (u32, u32, u32, u32),
    /// Node memory in MB.
    pub mem_mb: u64,
    /// GPUs installed, from the gres string.
    pub gpu_total: u32,
    /// GPUs estimated free, inferred from the node state (a policy
    /// estimate: `mixed` counts half the GPUs as taken).
    pub gpu_free: u32,
}

/// One row of the accounting allocations table.
#[derive(Debug, Clone)]
pub struct AccountAllocation {
    /// Account name.
    pub account: String,
    /// Total balance in service units.
    pub balance: f64,
    /// Reserved service units.
    pub reserved: f64,
    /// Available service units.
    pub available: f64,
}

/// One row of the storage quota report.
#[derive(Debug, Clone)]
pub struct StorageQuota {
    /// Filesystem kind as printed (e.g. `home`, `scratch`).
    pub kind: String,
    /// Mount path.
    pub path: String,
    /// Quota size normalized to GB.
    pub size_gb: f64,
}

/// A dry-run probe: "if this were submitted now, when would it start?"
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    /// Partition to probe.
    pub partition: String,
    /// Gres selector for one node.
    pub gres: String,
    /// Node count.
    pub nodes: u32,
    /// Walltime in seconds.
    pub walltime_secs: u64,
    /// Account to bill.
    pub account: String,
    /// Constraint feature, when the type needs one.
    pub constraint: Option<String>,
}

// --- pure parsers -----------------------------------------------------------

/// Expands scheduler range notation (`pfx[1,3,5-7]`) into node names,
/// preserving zero padding.
pub fn expand_nodelist(list: &str) -> Vec<String> {
    let list = list.trim();
    if list.is_empty() || list == "(null)" {
        return Vec::new();
    }

    let mut out = Vec::new();
    for part in split_outside_brackets(list) {
        match part.split_once('[') {
            Some((prefix, rest)) if rest.ends_with(']') => {
                let inner = &rest[..rest.len() - 1];
                for seg in inner.split(',') {
                    match seg.split_once('-') {
                        Some((a, b)) => {
                            let width = a.len();
                            let (Ok(start), Ok(end)) = (a.parse::<u64>(), b.parse::<u64>())
                            else {
                                out.push(format!("{prefix}{seg}"));
                                continue;
                            };
                            for n in start..=end {
                                out.push(format!("{prefix}{n:0width$}"));
                            }
                        }
                        None => out.push(format!("{prefix}{seg}")),
                    }
                }
            }
            _ => out.push(part.to_string()),
        }
    }
    out
}

fn split_outside_brackets(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, ch) in s.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Parses the live listing: `id|name|state|elapsed|limit|partition|gres|nodelist|reason`.
pub fn parse_jobs(text: &str) -> Vec<Job> {
    let mut jobs = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // The reason field is free-form; keep any '|' it contains.
        let fields: Vec<&str> = line.splitn(9, '|').collect();
        if fields.len() < 8 {
            continue;
        }
        let Ok(id) = fields[0].parse::<u64>() else {
            continue;
        };
        let gres = match fields[6] {
            "(null)" | "N/A" => String::new(),
            g => g.to_string(),
        };
        jobs.push(Job {
            id,
            name: fields[1].to_string(),
            state: fields[2].parse().unwrap_or(JobState::Unknown),
            elapsed: fields[3].to_string(),
            elapsed_secs: parse_elapsed(fields[3]),
            limit: fields[4].to_string(),
            limit_secs: parse_elapsed(fields[4]),
            partition: fields[5].to_string(),
            gres,
            nodes: expand_nodelist(fields[7]),
            reason: fields.get(8).unwrap_or(&"").to_string(),
        });
    }
    jobs
}

/// Parses the node inventory: `name state gres cpus mem`, whitespace
/// separated, memory always last and cpus second-to-last.
pub fn parse_nodes(text: &str) -> Vec<NodeInfo> {
    let mut nodes = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 5 {
            continue;
        }
        let name = fields[0].to_string();
        let state = parse_node_state(fields[1]);
        let gres = fields[2].to_string();
        let Some(cpus) = parse_cpu_counts(fields[3]) else {
            continue;
        };
        let Ok(mem_mb) = fields[4].parse::<u64>() else {
            continue;
        };

        let gpu_total = gres_gpu_count(&gres);
        let gpu_free = match state {
            NodeState::Idle => gpu_total,
            // Policy estimate, not data: half of a mixed node's GPUs count
            // as taken.
            NodeState::Mixed => gpu_total - gpu_total.div_ceil(2),
            _ => 0,
        };

        nodes.push(NodeInfo {
            name,
            state,
            gres,
            cpus,
            mem_mb,
            gpu_total,
            gpu_free,
        });
    }
    nodes
}

fn parse_node_state(raw: &str) -> NodeState {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '*' | '~' | '#' | '$' | '@'))
        .collect();
    match cleaned.to_ascii_lowercase().as_str() {
        "idle" => NodeState::Idle,
        "mix" | "mixed" => NodeState::Mixed,
        "alloc" | "allocated" | "comp" | "completing" => NodeState::Allocated,
        "drain" | "drng" | "draining" | "drained" => NodeState::Draining,
        "down" | "fail" | "failing" => NodeState::Down,
        _ => NodeState::Unknown,
    }
}

fn parse_cpu_counts(raw: &str) -> Option<(u32, u32, u32, u32)> {
    let mut it = raw.split('/');
    let alloc = it.next()?.parse().ok()?;
    let idle = it.next()?.parse().ok()?;
    let other = it.next()?.parse().ok()?;
    let total = it.next()?.parse().ok()?;
    Some((alloc, idle, other, total))
}

/// GPU count from a gres string like `gpu:a100:8(S:0-1),tmpdisk:100000`.
pub fn gres_gpu_count(gres: &str) -> u32 {
    for seg in gres.split(',') {
        let seg = seg.trim();
        if !seg.starts_with("gpu") {
            continue;
        }
        let seg = match seg.find('(') {
            Some(idx) => &seg[..idx],
            None => seg,
        };
        if let Some(last) = seg.rsplit(':').next() {
            if let Ok(n) = last.parse::<u32>() {
                return n;
            }
        }
    }
    0
}

/// GPU label from a gres string (`gpu:a100:8` → `a100`).
pub fn gres_gpu_label(gres: &str) -> Option<String> {
    for seg in gres.split(',') {
        let seg = seg.trim();
        if !seg.starts_with("gpu:") {
            continue;
        }
        let seg = match seg.find('(') {
            Some(idx) => &seg[..idx],
            None => seg,
        };
        let parts: Vec<&str> = seg.split(':').collect();
        if parts.len() >= 3 {
            return Some(parts[1].to_string());
        }
        // `gpu:8` carries a count but no label.
    }
    None
}

/// Parses accounting history: `id|name|state|elapsed|exit|partition|nodes`.
/// Sub-job rows (`1234.batch`) are skipped.
pub fn parse_history(text: &str) -> Vec<JobAccounting> {
    let mut records = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.trim().splitn(7, '|').collect();
        if fields.len() < 7 {
            continue;
        }
        if fields[0].contains('.') {
            continue;
        }
        let Ok(id) = fields[0].parse::<u64>() else {
            continue;
        };
        records.push(JobAccounting {
            id,
            name: fields[1].to_string(),
            state: fields[2].parse().unwrap_or(JobState::Unknown),
            elapsed_secs: parse_elapsed(fields[3]).unwrap_or(0),
            exit_code: parse_exit_code(fields[4]),
            partition: fields[5].to_string(),
            nodes: expand_nodelist(fields[6]),
        });
    }
    records
}

/// Unifies the scheduler's `exit:signal` pair into one code (128 + signal
/// when a signal terminated the job).
fn parse_exit_code(raw: &str) -> i32 {
    let (code, signal) = match raw.split_once(':') {
        Some((c, s)) => (
            c.trim().parse::<i32>().unwrap_or(0),
            s.trim().parse::<i32>().unwrap_or(0),
        ),
        None => (raw.trim().parse::<i32>().unwrap_or(0), 0),
    };
    if signal > 0 { 128 + (signal & 0x7F) } else { code }
}

/// Extracts the job id from the submission acknowledgement. Fatal when the
/// line is absent: submission is a primary path.
pub fn parse_submit_ack(text: &str) -> Result<u64> {
    for line in text.lines() {
        if let Some(id) = line.trim().strip_prefix("Submitted batch job ") {
            return id
                .trim()
                .parse()
                .map_err(|_| RvError::Parse(format!("invalid job id in ack: {line:?}")));
        }
    }
    Err(RvError::Parse(format!(
        "no submission acknowledgement in: {:?}",
        text.trim()
    )))
}

fn probe_start_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"to start at (\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})")
            .expect("probe regex is valid")
    })
}

/// Extracts the estimated start time from a dry-run submission's output.
/// `None` when the scheduler did not emit one (the probe failed).
pub fn parse_probe_start(text: &str) -> Option<chrono::NaiveDateTime> {
    let caps = probe_start_re().captures(text)?;
    chrono::NaiveDateTime::parse_from_str(&caps[1], "%Y-%m-%dT%H:%M:%S").ok()
}

/// Parses the allocations table (`account balance reserved available`).
/// Best-effort: header and malformed rows are skipped.
pub fn parse_allocations(text: &str) -> Vec<AccountAllocation> {
    let mut rows = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            continue;
        }
        let (Ok(balance), Ok(reserved), Ok(available)) = (
            fields[1].parse::<f64>(),
            fields[2].parse::<f64>(),
            fields[3].parse::<f64>(),
        ) else {
            continue;
        };
        rows.push(AccountAllocation {
            account: fields[0].to_string(),
            balance,
            reserved,
            available,
        });
    }
    rows
}

fn quota_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*([A-Za-z][A-Za-z _/-]*?)\s+(/\S+)\s+([\d.]+)\s*([KMGT]B)\b")
            .expect("quota regex is valid")
    })
}

/// Parses the storage quota report. Best-effort; sizes normalize to GB.
pub fn parse_quotas(text: &str) -> Vec<StorageQuota> {
    let mut rows = Vec::new();
    for caps in quota_re().captures_iter(text) {
        let Ok(value) = caps[3].parse::<f64>() else {
            continue;
        };
        let size_gb = match &caps[4] {
            "KB" => value / 1e6,
            "MB" => value / 1e3,
            "GB" => value,
            "TB" => value * 1e3,
            _ => continue,
        };
        rows.push(StorageQuota {
            kind: caps[1].trim().to_string(),
            path: caps[2].to_string(),
            size_gb,
        });
    }
    rows
}

/// Extracts the user's fair-share factor (column 7, 0-based) from the share
/// report. Clamped to `[0, 1]`; `0.5` when the row or column is missing.
pub fn parse_fairshare(text: &str, user: &str) -> f64 {
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.get(1) != Some(&user) {
            continue;
        }
        if let Some(raw) = fields.get(7) {
            if let Ok(v) = raw.parse::<f64>() {
                return v.clamp(0.0, 1.0);
            }
        }
    }
    0.5
}

// --- scheduler seam ---------------------------------------------------------

/// The scheduler operations the allocator and tailer depend on. The live
/// implementation shells out through the remote executor; tests substitute
/// a fake.
pub trait SchedulerApi {
    /// Live jobs for the configured user.
    fn list_jobs(&self) -> impl std::future::Future<Output = Result<Vec<Job>>>;

    /// Accounting records since a scheduler time expression
    /// (e.g. `now-1hour`).
    fn list_history(
        &self,
        since: &str,
    ) -> impl std::future::Future<Output = Result<Vec<JobAccounting>>>;

    /// Submits a batch script, returning the assigned job id.
    fn submit(&self, script: &str) -> impl std::future::Future<Output = Result<u64>>;

    /// Cancels several jobs in one remote call.
    fn cancel_many(&self, job_ids: &[u64]) -> impl std::future::Future<Output = Result<()>>;

    /// Issues every probe in one remote round-trip. Each result is the
    /// estimated seconds until start, or `None` when the scheduler gave no
    /// estimate; ordering matches the input.
    fn probe_batch(
        &self,
        probes: &[ProbeRequest],
    ) -> impl std::future::Future<Output = Result<Vec<Option<i64>>>>;

    /// Writes the per-job env file the batch script sources and deletes.
    fn write_env_file(
        &self,
        job_id: u64,
        vars: &BTreeMap<String, String>,
    ) -> impl std::future::Future<Output = Result<()>>;

    /// The gres string of one node, for post-win verification.
    fn node_gres(&self, node: &str) -> impl std::future::Future<Output = Result<String>>;
}

/// A snapshot of cluster state for `rv status`, fetched in one round-trip.
#[derive(Debug, Clone)]
pub struct SystemState {
    /// Node inventory.
    pub nodes: Vec<NodeInfo>,
    /// The user's running jobs.
    pub running: Vec<Job>,
    /// The user's pending jobs.
    pub pending: Vec<Job>,
    /// Fair-share factor in `[0, 1]`.
    pub fairshare: f64,
}

/// The live scheduler adapter.
#[derive(Debug, Clone)]
pub struct Slurm {
    remote: RemoteExecutor,
    user: String,
}

const SQUEUE_FORMAT: &str = "%i|%j|%T|%M|%l|%P|%b|%N|%r";
const SACCT_FORMAT: &str = "JobID,JobName,State,Elapsed,ExitCode,Partition,NodeList";

impl Slurm {
    /// Creates an adapter for `user` over `remote`.
    pub fn new(remote: RemoteExecutor, user: String) -> Self {
        Self { remote, user }
    }

    /// The remote executor this adapter wraps.
    pub fn remote(&self) -> &RemoteExecutor {
        &self.remote
    }

    fn squeue_cmd(&self, extra: &str) -> String {
        format!(
            "squeue -u {user} -h {extra} -o '{SQUEUE_FORMAT}'",
            user = self.user
        )
    }

    /// Nodes + running + pending + fair-share in one batched remote call.
    pub async fn get_system_state(&self) -> Result<SystemState> {
        let cmds = vec![
            "sinfo -N -h -o '%N %t %G %C %m'".to_string(),
            self.squeue_cmd("-t RUNNING"),
            self.squeue_cmd("-t PENDING"),
            format!("sshare -u {user} -a 2>/dev/null", user = self.user),
        ];
        let outs = self.remote.exec_batch(&cmds).await?;
        Ok(SystemState {
            nodes: parse_nodes(&outs[0]),
            running: parse_jobs(&outs[1]),
            pending: parse_jobs(&outs[2]),
            fairshare: parse_fairshare(&outs[3], &self.user),
        })
    }

    /// Account balances, best-effort: parse failures yield an empty list.
    pub async fn list_allocations(&self) -> Vec<AccountAllocation> {
        match self.remote.exec("allocations 2>/dev/null", None).await {
            Ok(out) => parse_allocations(&out),
            Err(err) => {
                warn!("allocations query failed: {err}");
                Vec::new()
            }
        }
    }

    /// Storage quotas, best-effort.
    pub async fn list_quotas(&self) -> Vec<StorageQuota> {
        match self.remote.exec("hdquota 2>/dev/null", None).await {
            Ok(out) => parse_quotas(&out),
            Err(err) => {
                warn!("quota query failed: {err}");
                Vec::new()
            }
        }
    }

    /// Cancels one job.
    pub async fn cancel(&self, job_id: u64) -> Result<()> {
        self.remote
            .exec(&format!("scancel {job_id}"), None)
            .await
            .map(|_| ())
    }
}

impl SchedulerApi for Slurm {
    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let out = self.remote.exec(&self.squeue_cmd(""), None).await?;
        Ok(parse_jobs(&out))
    }

    async fn list_history(&self, since: &str) -> Result<Vec<JobAccounting>> {
        let cmd = format!(
            "sacct -u {user} -S {since} -n -P -o {SACCT_FORMAT}",
            user = self.user
        );
        let out = self.remote.exec(&cmd, None).await?;
        Ok(parse_history(&out))
    }

    async fn submit(&self, script: &str) -> Result<u64> {
        let path = format!(
            "/tmp/rv-{user}-{millis}.sh",
            user = self.user,
            millis = chrono::Utc::now().timestamp_millis()
        );
        self.remote.write_file(&path, script.as_bytes()).await?;
        let out = self
            .remote
            .exec(
                &format!("sbatch {path}; rc=$?; rm -f {path}; exit $rc"),
                Some(Duration::from_secs(60)),
            )
            .await?;
        let job_id = parse_submit_ack(&out)?;
        debug!(job_id, "submitted batch job");
        Ok(job_id)
    }

    async fn cancel_many(&self, job_ids: &[u64]) -> Result<()> {
        if job_ids.is_empty() {
            return Ok(());
        }
        let ids = job_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        self.remote
            .exec(&format!("scancel {ids}"), None)
            .await
            .map(|_| ())
    }

    async fn probe_batch(&self, probes: &[ProbeRequest]) -> Result<Vec<Option<i64>>> {
        let cmds: Vec<String> = probes
            .iter()
            .map(|p| {
                let constraint = match &p.constraint {
                    Some(f) => format!(" --constraint={f}"),
                    None => String::new(),
                };
                format!(
                    "sbatch --test-only --partition={partition} --gres={gres} \
                     --nodes={nodes} --account={account} -t {walltime}{constraint} \
                     --wrap true 2>&1",
                    partition = p.partition,
                    gres = p.gres,
                    nodes = p.nodes,
                    account = p.account,
                    walltime = rv_core::timefmt::format_walltime(p.walltime_secs),
                )
            })
            .collect();

        let outs = self.remote.exec_batch(&cmds).await?;
        let now = chrono::Local::now().naive_local();
        Ok(outs
            .iter()
            .map(|out| {
                parse_probe_start(out).map(|start| (start - now).num_seconds())
            })
            .collect())
    }

    async fn write_env_file(&self, job_id: u64, vars: &BTreeMap<String, String>) -> Result<()> {
        let mut body = String::new();
        for (key, value) in vars {
            // Single-quote values; embedded quotes become '\''.
            let escaped = value.replace('\'', r"'\''");
            body.push_str(&format!("export {key}='{escaped}'\n"));
        }
        self.remote
            .write_file(&format!(".rv/env/{job_id}.env"), body.as_bytes())
            .await
    }

    async fn node_gres(&self, node: &str) -> Result<String> {
        let out = self
            .remote
            .exec(&format!("sinfo -h -N -n {node} -o '%G'"), None)
            .await?;
        Ok(out.lines().next().unwrap_or("").trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_ranges_with_padding() {
        assert_eq!(
            expand_nodelist("pfx[1,3,5-7]"),
            vec!["pfx1", "pfx3", "pfx5", "pfx6", "pfx7"]
        );
        assert_eq!(
            expand_nodelist("udc-an[028-030]"),
            vec!["udc-an028", "udc-an029", "udc-an030"]
        );
        assert_eq!(
            expand_nodelist("udc-an[1-2],udc-ba3"),
            vec!["udc-an1", "udc-an2", "udc-ba3"]
        );
        assert_eq!(expand_nodelist(""), Vec::<String>::new());
        assert_eq!(expand_nodelist("(null)"), Vec::<String>::new());
    }

    #[test]
    fn parses_live_listing() {
        let text = "\
12345|train-llm|RUNNING|1:02:03|3-00:00:00|gpu|gpu:a100:4|udc-an[1,3]|None
12346|probe|PENDING|0:00|02:00:00|gpu|gpu:a6000:8|(null)|Priority
garbage line
12347|weird|WAT|0:05|UNLIMITED|gpu||udc-ba2|(Resources)
";
        let jobs = parse_jobs(text);
        assert_eq!(jobs.len(), 3);

        assert_eq!(jobs[0].id, 12345);
        assert_eq!(jobs[0].state, JobState::Running);
        assert_eq!(jobs[0].elapsed_secs, Some(3723));
        assert_eq!(jobs[0].nodes, vec!["udc-an1", "udc-an3"]);

        assert_eq!(jobs[1].state, JobState::Pending);
        assert_eq!(jobs[1].nodes, Vec::<String>::new());
        assert_eq!(jobs[1].reason, "Priority");

        assert_eq!(jobs[2].state, JobState::Unknown);
        assert_eq!(jobs[2].limit_secs, None);
        assert_eq!(jobs[2].gres, "");
    }

    #[test]
    fn parses_node_inventory() {
        let text = "\
udc-an28-1 idle gpu:a100:8(S:0-1),tmpdisk:100000 0/128/0/128 1024000
udc-an28-2 mix* gpu:a100:8 64/64/0/128 1024000
udc-an28-3 alloc gpu:rtx3090:2 128/0/0/128 256000
udc-an28-4 down~ gpu:v100:4 0/0/128/128 384000
header line without enough fields
";
        let nodes = parse_nodes(text);
        assert_eq!(nodes.len(), 4);

        assert_eq!(nodes[0].state, NodeState::Idle);
        assert_eq!(nodes[0].gpu_total, 8);
        assert_eq!(nodes[0].gpu_free, 8);

        assert_eq!(nodes[1].state, NodeState::Mixed);
        assert_eq!(nodes[1].gpu_free, 4);

        assert_eq!(nodes[2].state, NodeState::Allocated);
        assert_eq!(nodes[2].gpu_free, 0);

        assert_eq!(nodes[3].state, NodeState::Down);
        assert_eq!(nodes[3].cpus, (0, 0, 128, 128));
    }

    #[test]
    fn mixed_half_free_rounds_down() {
        let nodes = parse_nodes("n1 mix gpu:v100:3 0/8/0/8 64000");
        assert_eq!(nodes[0].gpu_total, 3);
        // ceil(3/2) = 2 allocated, 1 free.
        assert_eq!(nodes[0].gpu_free, 1);
    }

    #[test]
    fn parses_history_and_skips_substeps() {
        let text = "\
9001|train|COMPLETED|01:00:00|0:0|gpu|udc-an1
9001.batch|batch|COMPLETED|01:00:00|0:0|gpu|udc-an1
9002|train|FAILED|00:10:00|1:0|gpu|udc-an2
9003|train|CANCELLED by 123|00:00:05|0:9|gpu|udc-an3
";
        let records = parse_history(text);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].state, JobState::Completed);
        assert_eq!(records[0].exit_code, 0);
        assert_eq!(records[1].exit_code, 1);
        assert_eq!(records[2].state, JobState::Cancelled);
        assert_eq!(records[2].exit_code, 137);
    }

    #[test]
    fn submit_ack_parses_or_fails() {
        assert_eq!(
            parse_submit_ack("Submitted batch job 4242\n").unwrap(),
            4242
        );
        assert!(parse_submit_ack("sbatch: error: invalid partition\n").is_err());
    }

    #[test]
    fn probe_start_extraction() {
        let out = "sbatch: Job 77 to start at 2026-03-01T12:30:00 using 4 processors on nodes udc-an1";
        let ts = parse_probe_start(out).unwrap();
        assert_eq!(ts.format("%Y-%m-%dT%H:%M:%S").to_string(), "2026-03-01T12:30:00");
        assert!(parse_probe_start("sbatch: error: allocation failure").is_none());
    }

    #[test]
    fn parses_allocations_table() {
        let text = "\
Account          Balance    Reserved   Available
lab-acct         10000.0    250.0      9750.0
other-acct       500.0      0.0        500.0
";
        let rows = parse_allocations(text);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].account, "lab-acct");
        assert_eq!(rows[0].available, 9750.0);
    }

    #[test]
    fn parses_quotas() {
        let text = "\
home           /home/abc1de       50 GB  used 12 GB
scratch        /scratch/abc1de    10 TB  used 2 TB
";
        let rows = parse_quotas(text);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, "home");
        assert_eq!(rows[0].size_gb, 50.0);
        assert_eq!(rows[1].size_gb, 10000.0);
    }

    #[test]
    fn fairshare_defaults_and_clamps() {
        let text = "\
Account    User     RawShares  NormShares  RawUsage  EffectvUsage  Level  FairShare
lab-acct   abc1de   1          0.001       100       0.0002        1.0    0.874321
";
        assert_eq!(parse_fairshare(text, "abc1de"), 0.874321);
        assert_eq!(parse_fairshare(text, "nobody"), 0.5);
        assert_eq!(parse_fairshare("", "abc1de"), 0.5);

        let wild = "x abc1de a b c d e 7.5";
        assert_eq!(parse_fairshare(wild, "abc1de"), 1.0);
    }

    #[test]
    fn gres_helpers() {
        assert_eq!(gres_gpu_count("gpu:a100:8(S:0-1),tmpdisk:100000"), 8);
        assert_eq!(gres_gpu_count("gpu:4"), 4);
        assert_eq!(gres_gpu_count(""), 0);
        assert_eq!(gres_gpu_label("gpu:a100:8(S:0-1)").as_deref(), Some("a100"));
        assert_eq!(gres_gpu_label("gpu:4"), None);
    }
}
