//! Remote log tailing.
//!
//! Polls the job's log files in batched remote calls (`wc -l` for growth,
//! `tail | head` for the delta), streams new lines locally until the job
//! reaches a terminal state, then resolves the authoritative final state and
//! exit code through accounting.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use rv_core::error::Result;

use crate::remote::RemoteExecutor;
use crate::slurm::{JobAccounting, JobState, SchedulerApi};

/// Which stream(s) to tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSel {
    /// stdout only.
    Out,
    /// stderr only.
    Err,
    /// Both, interleaved with an `[stderr]` tag.
    Both,
}

/// Tailing options.
#[derive(Debug, Clone)]
pub struct TailOptions {
    /// Stream selection.
    pub stream: StreamSel,
    /// Node count of the allocation; above 1 the tailer follows per-node
    /// files.
    pub node_count: u32,
    /// Limit output to one node index.
    pub node_filter: Option<u32>,
    /// Keep progress-bar carriage-return lines instead of scrubbing them.
    pub raw: bool,
    /// Count lines but print nothing.
    pub silent: bool,
    /// Poll cadence.
    pub poll_interval: Duration,
    /// Polls with no per-node content before falling back to the
    /// sbatch-level files (preamble failures land there).
    pub preamble_fallback_polls: u32,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            stream: StreamSel::Both,
            node_count: 1,
            node_filter: None,
            raw: false,
            silent: false,
            poll_interval: Duration::from_secs(3),
            preamble_fallback_polls: 3,
        }
    }
}

/// The job and its sbatch-level log paths.
#[derive(Debug, Clone)]
pub struct TailTarget {
    /// Scheduler job id.
    pub job_id: u64,
    /// sbatch-level stdout path (with `%x-%j` already expanded).
    pub out_path: String,
    /// sbatch-level stderr path.
    pub err_path: String,
}

/// What the tail resolved to once the job ended.
#[derive(Debug, Clone, Copy)]
pub struct TailOutcome {
    /// Authoritative final state.
    pub final_state: JobState,
    /// Exit code; 0 for a completed job, 1 otherwise when the scheduler did
    /// not provide one.
    pub exit_code: i32,
}

#[derive(Debug, Clone)]
struct TrackedFile {
    path: String,
    node: Option<u32>,
    is_err: bool,
}

/// Follows the job's logs until it terminates, then returns the final state
/// and exit code.
pub async fn tail<S: SchedulerApi>(
    remote: &RemoteExecutor,
    sched: &S,
    target: &TailTarget,
    opts: &TailOptions,
) -> Result<TailOutcome> {
    let mut per_node_mode = opts.node_count > 1;
    let mut files = file_set(target, opts, per_node_mode);
    let mut counters: HashMap<String, u64> = HashMap::new();
    let mut empty_polls: u32 = 0;

    loop {
        let saw_content = poll_once(remote, &files, &mut counters, opts).await?;

        // Preamble-failure fallback: per-node files stay empty while the
        // sbatch-level stderr has output.
        if per_node_mode && !saw_content && counters.values().all(|c| *c == 0) {
            empty_polls += 1;
            if empty_polls >= opts.preamble_fallback_polls
                && sbatch_stderr_has_content(remote, target).await
            {
                debug!(job_id = target.job_id, "falling back to sbatch-level logs");
                per_node_mode = false;
                files = file_set(target, opts, false);
                counters.clear();
                continue;
            }
        }

        let jobs = sched.list_jobs().await?;
        let live = jobs.iter().find(|j| j.id == target.job_id);
        let done = match live {
            None => true,
            Some(job) => job.state.is_terminal(),
        };
        if done {
            // One final fetch to flush lines written right before exit.
            poll_once(remote, &files, &mut counters, opts).await?;

            let live_state = live.map(|j| j.state);
            let acct = if live_state.map(|s| s.is_terminal()).unwrap_or(false) {
                None
            } else {
                let history = sched.list_history("now-1hour").await.unwrap_or_default();
                history.into_iter().find(|r| r.id == target.job_id)
            };
            let (final_state, exit_code) = resolve_final(live_state, acct.as_ref());
            return Ok(TailOutcome {
                final_state,
                exit_code,
            });
        }

        tokio::time::sleep(opts.poll_interval).await;
    }
}

/// One wc + tail round: returns whether any tracked file grew.
async fn poll_once(
    remote: &RemoteExecutor,
    files: &[TrackedFile],
    counters: &mut HashMap<String, u64>,
    opts: &TailOptions,
) -> Result<bool> {
    let wc_cmds: Vec<String> = files
        .iter()
        .map(|f| format!("wc -l < {path} 2>/dev/null || echo 0", path = f.path))
        .collect();
    let counts_raw = remote.exec_batch(&wc_cmds).await?;

    let mut grown: Vec<(&TrackedFile, u64, u64)> = Vec::new();
    for (file, raw) in files.iter().zip(counts_raw.iter()) {
        let count = parse_count(raw);
        let prev = counters.get(&file.path).copied().unwrap_or(0);
        if count > prev {
            grown.push((file, prev, count - prev));
        }
    }
    if grown.is_empty() {
        return Ok(false);
    }

    let tail_cmds: Vec<String> = grown
        .iter()
        .map(|(file, prev, delta)| {
            format!(
                "tail -n +{from} {path} 2>/dev/null | head -n {delta}",
                from = prev + 1,
                path = file.path
            )
        })
        .collect();
    let chunks = remote.exec_batch(&tail_cmds).await?;

    for ((file, _, delta), chunk) in grown.iter().zip(chunks.iter()) {
        for line in chunk.lines() {
            if !opts.raw && is_progress_noise(line) {
                continue;
            }
            if opts.silent {
                continue;
            }
            let rendered = format_line(file.node, file.is_err && opts.stream == StreamSel::Both, line);
            if file.is_err {
                eprintln!("{rendered}");
            } else {
                println!("{rendered}");
            }
        }
        let entry = counters.entry(file.path.clone()).or_insert(0);
        *entry += delta;
    }
    Ok(true)
}

async fn sbatch_stderr_has_content(remote: &RemoteExecutor, target: &TailTarget) -> bool {
    let cmd = vec![format!(
        "wc -l < {path} 2>/dev/null || echo 0",
        path = target.err_path
    )];
    match remote.exec_batch(&cmd).await {
        Ok(out) => out.first().map(|s| parse_count(s) > 0).unwrap_or(false),
        Err(_) => false,
    }
}

fn file_set(target: &TailTarget, opts: &TailOptions, per_node: bool) -> Vec<TrackedFile> {
    let mut files = Vec::new();
    let want_out = matches!(opts.stream, StreamSel::Out | StreamSel::Both);
    let want_err = matches!(opts.stream, StreamSel::Err | StreamSel::Both);

    if per_node {
        for node in 0..opts.node_count {
            if let Some(only) = opts.node_filter {
                if node != only {
                    continue;
                }
            }
            if want_out {
                files.push(TrackedFile {
                    path: per_node_path(&target.out_path, node),
                    node: Some(node),
                    is_err: false,
                });
            }
            if want_err {
                files.push(TrackedFile {
                    path: per_node_path(&target.err_path, node),
                    node: Some(node),
                    is_err: true,
                });
            }
        }
    } else {
        if want_out {
            files.push(TrackedFile {
                path: target.out_path.clone(),
                node: None,
                is_err: false,
            });
        }
        if want_err {
            files.push(TrackedFile {
                path: target.err_path.clone(),
                node: None,
                is_err: true,
            });
        }
    }
    files
}

/// `logs/name-123.out` → `logs/name-123-node0.out`.
fn per_node_path(path: &str, node: u32) -> String {
    match path.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}-node{node}.{ext}"),
        None => format!("{path}-node{node}"),
    }
}

fn parse_count(raw: &str) -> u64 {
    raw.trim().lines().next().unwrap_or("0").trim().parse().unwrap_or(0)
}

fn progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{1,3}%\|.*\|").expect("progress regex is valid")
    })
}

/// Progress-bar noise: carriage-return repaints and `NN%|...|` bars.
fn is_progress_noise(line: &str) -> bool {
    line.contains('\r') || progress_re().is_match(line)
}

fn format_line(node: Option<u32>, stderr_tag: bool, line: &str) -> String {
    match (node, stderr_tag) {
        (Some(n), true) => format!("[node{n}] [stderr] {line}"),
        (Some(n), false) => format!("[node{n}] {line}"),
        (None, true) => format!("[stderr] {line}"),
        (None, false) => line.to_string(),
    }
}

/// Collapses the live and accounting views into the final `(state, code)`.
///
/// A terminal live state wins with default codes; otherwise accounting is
/// authoritative, and a still-transitional accounting state collapses to
/// `COMPLETED`/`FAILED` by exit code.
fn resolve_final(live: Option<JobState>, acct: Option<&JobAccounting>) -> (JobState, i32) {
    if let Some(state) = live {
        if state.is_terminal() {
            return (state, default_code(state));
        }
    }
    match acct {
        Some(rec) if rec.state.is_terminal() => (rec.state, rec.exit_code),
        Some(rec) => {
            if rec.exit_code == 0 {
                (JobState::Completed, 0)
            } else {
                (JobState::Failed, rec.exit_code)
            }
        }
        None => match live {
            Some(state) => (state, default_code(state)),
            None => (JobState::Unknown, 1),
        },
    }
}

fn default_code(state: JobState) -> i32 {
    if state == JobState::Completed { 0 } else { 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acct(state: JobState, exit_code: i32) -> JobAccounting {
        JobAccounting {
            id: 1,
            name: "train".to_string(),
            state,
            elapsed_secs: 60,
            exit_code,
            partition: "gpu".to_string(),
            nodes: Vec::new(),
        }
    }

    #[test]
    fn per_node_paths_suffix_before_extension() {
        assert_eq!(
            per_node_path("logs/train-123.out", 0),
            "logs/train-123-node0.out"
        );
        assert_eq!(per_node_path("logs/train-123", 2), "logs/train-123-node2");
    }

    #[test]
    fn progress_noise_is_scrubbed() {
        assert!(is_progress_noise("epoch 1:  45%|████      | 45/100"));
        assert!(is_progress_noise("downloading\rdownloading 50%"));
        assert!(!is_progress_noise("loss=0.231 step=4500"));
        assert!(!is_progress_noise("accuracy improved to 93%"));
    }

    #[test]
    fn line_prefixes() {
        assert_eq!(format_line(None, false, "hello"), "hello");
        assert_eq!(format_line(None, true, "oops"), "[stderr] oops");
        assert_eq!(format_line(Some(1), false, "x"), "[node1] x");
        assert_eq!(format_line(Some(0), true, "y"), "[node0] [stderr] y");
    }

    #[test]
    fn wc_output_parses_defensively() {
        assert_eq!(parse_count(" 42\n"), 42);
        assert_eq!(parse_count("0"), 0);
        assert_eq!(parse_count("wc: missing"), 0);
        assert_eq!(parse_count(""), 0);
    }

    #[test]
    fn file_set_honors_stream_and_node_filter() {
        let target = TailTarget {
            job_id: 1,
            out_path: "logs/t-1.out".to_string(),
            err_path: "logs/t-1.err".to_string(),
        };
        let mut opts = TailOptions {
            node_count: 2,
            ..TailOptions::default()
        };

        let files = file_set(&target, &opts, true);
        assert_eq!(files.len(), 4);

        opts.node_filter = Some(1);
        let files = file_set(&target, &opts, true);
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.path.contains("node1")));

        opts.stream = StreamSel::Out;
        let files = file_set(&target, &opts, false);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "logs/t-1.out");
    }

    #[test]
    fn final_state_resolution() {
        // Vanished with a completed accounting record: authoritative code.
        assert_eq!(
            resolve_final(None, Some(&acct(JobState::Completed, 0))),
            (JobState::Completed, 0)
        );
        // Failed with the job's own exit code propagated verbatim.
        assert_eq!(
            resolve_final(None, Some(&acct(JobState::Failed, 7))),
            (JobState::Failed, 7)
        );
        // Transitional accounting collapses by exit code.
        assert_eq!(
            resolve_final(Some(JobState::Completing), Some(&acct(JobState::Completing, 0))),
            (JobState::Completed, 0)
        );
        assert_eq!(
            resolve_final(Some(JobState::Completing), Some(&acct(JobState::Completing, 9))),
            (JobState::Failed, 9)
        );
        // Terminal live state wins with default codes.
        assert_eq!(
            resolve_final(Some(JobState::Timeout), None),
            (JobState::Timeout, 1)
        );
        // Nothing known at all.
        assert_eq!(resolve_final(None, None), (JobState::Unknown, 1));
    }
}
