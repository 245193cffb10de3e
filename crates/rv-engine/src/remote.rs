//! Remote command execution over a persistent multiplexed SSH connection.
//!
//! One control-master connection is established per process and every call
//! reuses it, so each `exec` is a cheap channel open rather than a fresh
//! handshake. File syncs ride the same control socket through rsync.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;
use tracing::{debug, trace};

use rv_core::error::{Result, RvError};

/// Literal marker `exec_batch` prints between command outputs. Chosen so it
/// cannot plausibly appear in scheduler output.
pub const BATCH_DELIM: &str = "___RV_DELIM___";

/// Default wall-clock timeout for a single remote command.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for the streaming file syncs.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Delete extraneous files on the receiving side.
    pub delete: bool,
    /// Report what would transfer without transferring.
    pub dry_run: bool,
    /// `--exclude` patterns.
    pub exclude: Vec<String>,
    /// Raw `--filter` rules.
    pub filters: Vec<String>,
}

/// Executes commands on one remote host over a shared control connection.
#[derive(Debug, Clone)]
pub struct RemoteExecutor {
    host: String,
    control_path: PathBuf,
}

impl RemoteExecutor {
    /// Creates an executor for `host` (an ssh alias). The control socket
    /// lives under `~/.rv/`.
    pub fn new(host: &str) -> Result<Self> {
        let dir = rv_core::config::ensure_rv_dir()?;
        Ok(Self {
            host: host.to_string(),
            control_path: dir.join("cm-%C"),
        })
    }

    fn ssh_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-o")
            .arg("ControlPersist=10m")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ConnectTimeout=10");
        cmd
    }

    /// ssh `-e` string for rsync, so syncs reuse the control connection.
    fn rsync_rsh(&self) -> String {
        format!(
            "ssh -o ControlMaster=auto -o ControlPath={} -o ControlPersist=10m -o BatchMode=yes",
            self.control_path.display()
        )
    }

    /// Runs `command` remotely and returns its stdout.
    ///
    /// The wall-clock `timeout` (default 30 s) kills the transport process
    /// on expiry and surfaces [`RvError::Timeout`].
    pub async fn exec(&self, command: &str, timeout: Option<Duration>) -> Result<String> {
        let timeout = timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT);
        trace!(host = %self.host, %command, "remote exec");

        let mut cmd = self.ssh_command();
        cmd.arg(&self.host)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| RvError::Config(format!("spawn ssh: {e}")))?;

        // Dropping the future on timeout kills the child via kill_on_drop.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(res) => res.map_err(|e| RvError::Config(format!("wait for ssh: {e}")))?,
            Err(_) => return Err(RvError::Timeout(timeout)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let code = output.status.code().unwrap_or(255);
        Err(self.classify(code, stderr))
    }

    /// Maps a non-zero ssh exit into a typed error. Exit 255 is the
    /// transport itself; anything else is the remote command's own status.
    fn classify(&self, code: i32, stderr: String) -> RvError {
        if code == 255 {
            let s = stderr.to_ascii_lowercase();
            if s.contains("permission denied") || s.contains("publickey") {
                return RvError::AuthFailed;
            }
            if s.contains("could not resolve hostname")
                || s.contains("no route to host")
                || s.contains("network is unreachable")
            {
                return RvError::Unreachable(self.host.clone());
            }
            if s.contains("connection refused") {
                return RvError::Refused(self.host.clone());
            }
            if s.contains("timed out") {
                return RvError::Unreachable(self.host.clone());
            }
        }
        RvError::RemoteExit {
            code,
            stderr: stderr.trim().to_string(),
        }
    }

    /// Runs several commands in one round-trip, returning one stdout per
    /// command, in input order.
    ///
    /// Commands are joined with `;` so a failing command does not
    /// short-circuit the rest; callers detect failures as empty output.
    pub async fn exec_batch(&self, commands: &[String]) -> Result<Vec<String>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let joined = commands
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(&format!(" ; echo {BATCH_DELIM} ; "));
        // The trailing `:` pins the remote exit status to 0; only the
        // transport can fail a batch.
        let script = format!("{joined} ; :");

        debug!(host = %self.host, n = commands.len(), "remote exec batch");
        let out = self
            .exec(&script, Some(DEFAULT_EXEC_TIMEOUT * 2))
            .await?;

        let parts: Vec<String> = out
            .split(BATCH_DELIM)
            .map(|p| p.trim_matches('\n').to_string())
            .collect();
        if parts.len() != commands.len() {
            return Err(RvError::Parse(format!(
                "batch returned {} sections for {} commands",
                parts.len(),
                commands.len()
            )));
        }
        Ok(parts)
    }

    /// Streams `bytes` into `remote_path`, creating parent directories.
    pub async fn write_file(&self, remote_path: &str, bytes: &[u8]) -> Result<()> {
        let dir = match remote_path.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => dir,
            _ => ".",
        };
        let mut cmd = self.ssh_command();
        cmd.arg(&self.host)
            .arg(format!("mkdir -p {dir} && cat > {remote_path}"))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| RvError::Config(format!("spawn ssh: {e}")))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RvError::Config("ssh stdin unavailable".to_string()))?;
        stdin
            .write_all(bytes)
            .await
            .map_err(|e| RvError::Config(format!("write to ssh stdin: {e}")))?;
        drop(stdin);

        let output = match tokio::time::timeout(DEFAULT_EXEC_TIMEOUT, child.wait_with_output())
            .await
        {
            Ok(res) => res.map_err(|e| RvError::Config(format!("wait for ssh: {e}")))?,
            Err(_) => return Err(RvError::Timeout(DEFAULT_EXEC_TIMEOUT)),
        };
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Err(self.classify(output.status.code().unwrap_or(255), stderr))
    }

    /// Mirrors a remote path to a local one via rsync.
    pub async fn pull_stream(
        &self,
        remote_path: &str,
        local_path: &Path,
        opts: &SyncOptions,
    ) -> Result<()> {
        let src = format!("{}:{}", self.host, remote_path);
        self.run_rsync(&src, &local_path.display().to_string(), opts, None)
            .await
    }

    /// Mirrors a local path to a remote one via rsync.
    pub async fn push_stream(
        &self,
        local_path: &Path,
        remote_path: &str,
        opts: &SyncOptions,
    ) -> Result<()> {
        let dst = format!("{}:{}", self.host, remote_path);
        self.run_rsync(&local_path.display().to_string(), &dst, opts, None)
            .await
    }

    /// Like [`push_stream`](Self::push_stream) but transfers only the files
    /// named in `file_list` (used to mirror VCS-tracked files exactly).
    pub async fn push_stream_with_list(
        &self,
        local_path: &Path,
        remote_path: &str,
        file_list: &[String],
        opts: &SyncOptions,
    ) -> Result<()> {
        let dst = format!("{}:{}", self.host, remote_path);
        self.run_rsync(
            &local_path.display().to_string(),
            &dst,
            opts,
            Some(file_list),
        )
        .await
    }

    async fn run_rsync(
        &self,
        src: &str,
        dst: &str,
        opts: &SyncOptions,
        file_list: Option<&[String]>,
    ) -> Result<()> {
        let mut cmd = Command::new("rsync");
        cmd.arg("-az").arg("-e").arg(self.rsync_rsh());
        if opts.delete {
            cmd.arg("--delete");
        }
        if opts.dry_run {
            cmd.arg("--dry-run");
        }
        for pat in &opts.exclude {
            cmd.arg(format!("--exclude={pat}"));
        }
        for rule in &opts.filters {
            cmd.arg(format!("--filter={rule}"));
        }
        if file_list.is_some() {
            cmd.arg("--files-from=-");
        }
        cmd.arg(src)
            .arg(dst)
            .stdin(if file_list.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(%src, %dst, "rsync");
        let mut child = cmd
            .spawn()
            .map_err(|e| RvError::Config(format!("spawn rsync: {e}")))?;

        if let Some(files) = file_list {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| RvError::Config("rsync stdin unavailable".to_string()))?;
            let payload = files.join("\n");
            stdin
                .write_all(payload.as_bytes())
                .await
                .map_err(|e| RvError::Config(format!("write rsync file list: {e}")))?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RvError::Config(format!("wait for rsync: {e}")))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Err(self.classify(output.status.code().unwrap_or(255), stderr))
    }

    /// Allocates a terminal and proxies the user through to `argv` on the
    /// remote host. Returns the remote exit code.
    pub async fn exec_interactive(&self, argv: &[String]) -> Result<i32> {
        let mut cmd = self.ssh_command();
        cmd.arg("-t").arg(&self.host);
        for arg in argv {
            cmd.arg(arg);
        }
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|e| RvError::Config(format!("spawn ssh -t: {e}")))?;
        let status = child
            .wait()
            .await
            .map_err(|e| RvError::Config(format!("wait for ssh -t: {e}")))?;
        Ok(status.code().unwrap_or(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> RemoteExecutor {
        RemoteExecutor {
            host: "hpc".to_string(),
            control_path: PathBuf::from("/tmp/cm-%C"),
        }
    }

    #[test]
    fn classify_transport_errors() {
        let ex = executor();
        assert!(matches!(
            ex.classify(255, "user@host: Permission denied (publickey).".into()),
            RvError::AuthFailed
        ));
        assert!(matches!(
            ex.classify(255, "ssh: Could not resolve hostname hpc".into()),
            RvError::Unreachable(_)
        ));
        assert!(matches!(
            ex.classify(255, "connect to host hpc port 22: Connection refused".into()),
            RvError::Refused(_)
        ));
    }

    #[test]
    fn classify_remote_exit_passes_code_through() {
        let ex = executor();
        match ex.classify(3, "boom\n".into()) {
            RvError::RemoteExit { code, stderr } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn batch_split_preserves_order_and_count() {
        // Mirrors the splitting exec_batch performs on the remote output.
        let out = format!("one\n{BATCH_DELIM}\n\n{BATCH_DELIM}\nthree\n");
        let parts: Vec<&str> = out.split(BATCH_DELIM).map(|p| p.trim_matches('\n')).collect();
        assert_eq!(parts, vec!["one", "", "three"]);
    }
}
