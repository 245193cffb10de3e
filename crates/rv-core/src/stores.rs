//! Local JSON hint stores under `~/.rv/`.
//!
//! All three stores are rewritten atomically on every change and are hints,
//! not sources of truth: concurrent invocations are last-writer-wins.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::{ensure_rv_dir, rv_dir, write_private};

/// How long request records are kept before pruning.
const REQUEST_RETENTION_SECS: i64 = 7 * 86400;

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> anyhow::Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn persist_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    ensure_rv_dir()?;
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    write_private(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Signal-0 liveness probe. EPERM means the pid exists but belongs to
/// someone else, which still counts as alive.
fn pid_alive(pid: i32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

// --- env.json ---------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EnvFile {
    #[serde(default)]
    vars: BTreeMap<String, String>,
}

/// Environment variables injected into every submitted job.
#[derive(Debug)]
pub struct EnvStore {
    path: PathBuf,
    vars: BTreeMap<String, String>,
}

impl EnvStore {
    /// Loads `env.json`, treating a missing file as empty.
    pub fn load() -> anyhow::Result<Self> {
        let path = rv_dir()?.join("env.json");
        let file: EnvFile = load_json(&path)?;
        Ok(Self {
            path,
            vars: file.vars,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: String, value: String) {
        self.vars.insert(key, value);
    }

    /// Returns whether the key was present.
    pub fn unset(&mut self, key: &str) -> bool {
        self.vars.remove(key).is_some()
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn persist(&self) -> anyhow::Result<()> {
        persist_json(
            &self.path,
            &EnvFile {
                vars: self.vars.clone(),
            },
        )
    }
}

// --- forwards.json ----------------------------------------------------------

/// One live port-forward tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelEntry {
    pub pid: i32,
    pub job_id: u64,
    pub local_port: u16,
    pub remote_port: u16,
    pub node: String,
    /// Unix seconds.
    pub started_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ForwardsFile {
    #[serde(default)]
    forwards: Vec<TunnelEntry>,
}

/// Registry of ssh port-forward tunnels spawned by `rv forward`.
#[derive(Debug)]
pub struct ForwardsStore {
    path: PathBuf,
    forwards: Vec<TunnelEntry>,
}

impl ForwardsStore {
    /// Loads `forwards.json` and prunes entries whose pid is gone. The prune
    /// is persisted immediately when it removed anything.
    pub fn load() -> anyhow::Result<Self> {
        let path = rv_dir()?.join("forwards.json");
        let file: ForwardsFile = load_json(&path)?;
        let before = file.forwards.len();
        let forwards: Vec<TunnelEntry> = file
            .forwards
            .into_iter()
            .filter(|t| pid_alive(t.pid))
            .collect();

        let store = Self { path, forwards };
        if store.forwards.len() != before {
            store.persist()?;
        }
        Ok(store)
    }

    pub fn entries(&self) -> &[TunnelEntry] {
        &self.forwards
    }

    pub fn add(&mut self, entry: TunnelEntry) {
        self.forwards.push(entry);
    }

    /// Removes the tunnel on `local_port`, returning it for the caller to
    /// kill.
    pub fn remove_by_port(&mut self, local_port: u16) -> Option<TunnelEntry> {
        let idx = self
            .forwards
            .iter()
            .position(|t| t.local_port == local_port)?;
        Some(self.forwards.remove(idx))
    }

    pub fn persist(&self) -> anyhow::Result<()> {
        persist_json(
            &self.path,
            &ForwardsFile {
                forwards: self.forwards.clone(),
            },
        )
    }
}

// --- requests.json ----------------------------------------------------------

/// One strategy inside a request record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedStrategy {
    pub job_id: u64,
    pub kind: String,
    pub gpu_type: String,
    pub nodes: u32,
}

/// Everything submitted for one logical `rv run` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    /// Client-generated id.
    pub id: String,
    /// Unix seconds.
    pub created_at: i64,
    pub strategies: Vec<RecordedStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirty: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RequestsFile {
    #[serde(default)]
    requests: Vec<RequestRecord>,
}

/// History of fan-out requests, pruned to seven days on every write.
#[derive(Debug)]
pub struct RequestsStore {
    path: PathBuf,
    requests: Vec<RequestRecord>,
}

impl RequestsStore {
    pub fn load() -> anyhow::Result<Self> {
        let path = rv_dir()?.join("requests.json");
        let file: RequestsFile = load_json(&path)?;
        Ok(Self {
            path,
            requests: file.requests,
        })
    }

    /// Generates a new client-side request id.
    pub fn next_id() -> String {
        format!(
            "req-{}-{}",
            chrono::Utc::now().timestamp_millis(),
            std::process::id()
        )
    }

    pub fn records(&self) -> &[RequestRecord] {
        &self.requests
    }

    pub fn find(&self, id: &str) -> Option<&RequestRecord> {
        self.requests.iter().find(|r| r.id == id)
    }

    pub fn add(&mut self, record: RequestRecord) {
        self.requests.push(record);
    }

    pub fn persist(&self) -> anyhow::Result<()> {
        let cutoff = chrono::Utc::now().timestamp() - REQUEST_RETENTION_SECS;
        let kept: Vec<RequestRecord> = self
            .requests
            .iter()
            .filter(|r| r.created_at >= cutoff)
            .cloned()
            .collect();
        persist_json(&self.path, &RequestsFile { requests: kept })
    }
}
