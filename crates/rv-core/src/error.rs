//! Error kinds shared across the workspace.

use std::time::Duration;

/// Everything that can go wrong between the local CLI and the cluster.
///
/// Connection variants are classified from the transport's stderr; parse
/// errors are fatal only on primary scheduler paths (best-effort paths catch
/// them and fall back to defaults).
#[derive(Debug, thiserror::Error)]
pub enum RvError {
    #[error("authentication failed — run `rv init` to re-provision access")]
    AuthFailed,

    #[error("cannot reach {0} — are you on the VPN?")]
    Unreachable(String),

    #[error("connection refused by {0}")]
    Refused(String),

    #[error("remote command timed out after {0:?}")]
    Timeout(Duration),

    /// The remote command itself ran and exited non-zero.
    #[error("remote command exited with status {code}: {stderr}")]
    RemoteExit { code: i32, stderr: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("no configuration found — run `rv init` first")]
    NotInitialized,

    #[error("unexpected scheduler output: {0}")]
    Parse(String),

    #[error("allocation failed: {0}")]
    Allocator(String),
}

impl RvError {
    /// Process exit code for this error. The remote job's own non-zero exit
    /// code propagates verbatim; everything else is 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            RvError::RemoteExit { code, .. } => *code,
            _ => 1,
        }
    }

    /// True for transport-level failures where retrying inside a loop is
    /// pointless and the user should check connectivity instead.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            RvError::AuthFailed
                | RvError::Unreachable(_)
                | RvError::Refused(_)
                | RvError::Timeout(_)
        )
    }
}

/// Workspace-wide result alias.
pub type Result<T> = std::result::Result<T, RvError>;
