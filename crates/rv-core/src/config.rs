//! Local configuration (`~/.rv/config.toml`).

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::RvError;

/// Connection details for the cluster login host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Connection {
    /// SSH host alias used for every remote call (`ssh <host>`).
    pub host: String,
    /// Cluster username.
    pub user: String,
    /// Real hostname behind the alias, for display and ssh-config writing.
    #[serde(default)]
    pub hostname: String,
}

/// Per-user submission defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub gpu_type: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub partition: Option<String>,
    /// Derive job names from the command text instead of the directory name.
    #[serde(default)]
    pub ai_naming: bool,
}

/// Remote filesystem layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Paths {
    #[serde(default)]
    pub scratch: Option<String>,
    #[serde(default)]
    pub home: Option<String>,
}

impl Paths {
    /// Scratch directory for `user`, defaulting to the cluster convention.
    pub fn scratch_for(&self, user: &str) -> String {
        match &self.scratch {
            Some(s) => s.clone(),
            None => format!("/scratch/{user}"),
        }
    }
}

/// Job event notification settings.
///
/// `token` is a secret shared with the notification receiver (it is embedded
/// into every synthesized batch script), not a per-user credential.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Notifications {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Endpoint the batch script POSTs events to.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// The whole of `~/.rv/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub connection: Connection,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub notifications: Notifications,
    /// Shared group caches by name (e.g. `hf` → a group-readable HF_HOME).
    #[serde(default)]
    pub cache: BTreeMap<String, String>,
}

impl Config {
    fn normalize(&mut self) {
        for field in [
            &mut self.defaults.account,
            &mut self.defaults.gpu_type,
            &mut self.defaults.time,
            &mut self.defaults.partition,
            &mut self.paths.scratch,
            &mut self.paths.home,
            &mut self.notifications.email,
            &mut self.notifications.token,
            &mut self.notifications.endpoint,
        ] {
            *field = field.as_ref().map(|s| s.trim().to_string());
            if matches!(field.as_deref(), Some(s) if s.is_empty()) {
                *field = None;
            }
        }
    }
}

/// `~/.rv`, resolved from `HOME`.
pub fn rv_dir() -> Result<PathBuf, RvError> {
    let home = std::env::var_os("HOME")
        .ok_or_else(|| RvError::Config("HOME is not set".to_string()))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        return Err(RvError::Config("HOME is set but empty".to_string()));
    }
    Ok(home.join(".rv"))
}

/// Path of the config file.
pub fn config_path() -> Result<PathBuf, RvError> {
    Ok(rv_dir()?.join("config.toml"))
}

/// Creates `~/.rv` (mode 0700) if missing and returns it.
pub fn ensure_rv_dir() -> Result<PathBuf, RvError> {
    let dir = rv_dir()?;
    if !dir.exists() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt as _;
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&dir)
                .map_err(|e| RvError::Config(format!("create {}: {e}", dir.display())))?;
        }
        #[cfg(not(unix))]
        std::fs::create_dir_all(&dir)
            .map_err(|e| RvError::Config(format!("create {}: {e}", dir.display())))?;
    }
    Ok(dir)
}

/// Loads the config, failing with `NotInitialized` when no file exists.
pub fn load_config() -> Result<Config, RvError> {
    let path = config_path()?;
    if !path.exists() {
        return Err(RvError::NotInitialized);
    }
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| RvError::Config(format!("read {}: {e}", path.display())))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| RvError::Config(format!("malformed config: {e}")))?;
    cfg.normalize();
    if cfg.connection.host.trim().is_empty() || cfg.connection.user.trim().is_empty() {
        return Err(RvError::Config(
            "connection.host and connection.user are required".to_string(),
        ));
    }
    Ok(cfg)
}

/// Saves the config atomically (temp file + rename, mode 0600).
pub fn save_config(cfg: &Config) -> Result<(), RvError> {
    ensure_rv_dir()?;
    let path = config_path()?;

    let mut cfg = cfg.clone();
    cfg.normalize();

    let text = toml::to_string_pretty(&cfg)
        .map_err(|e| RvError::Config(format!("serialize config: {e}")))?;

    let tmp = path.with_extension("toml.tmp");
    write_private(&tmp, text.as_bytes())
        .map_err(|e| RvError::Config(format!("write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, &path)
        .map_err(|e| RvError::Config(format!("rename into {}: {e}", path.display())))?;
    Ok(())
}

/// Writes `bytes` to `path` with mode 0600, truncating any previous content.
pub(crate) fn write_private(path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt as _;
        opts.mode(0o600);
    }
    let mut f = opts.open(path)?;
    f.write_all(bytes)?;
    f.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        let mut cfg = Config::default();
        cfg.connection.host = "hpc".to_string();
        cfg.connection.user = "abc1de".to_string();
        cfg.connection.hostname = "login.hpc.example.edu".to_string();
        cfg.defaults.account = Some("lab-acct".to_string());
        cfg.defaults.time = Some("  4h ".to_string());
        cfg.notifications.enabled = true;
        cfg.notifications.email = Some("".to_string());
        cfg.cache
            .insert("hf".to_string(), "/project/lab/hf-cache".to_string());
        cfg
    }

    #[test]
    fn toml_round_trip_is_stable() {
        let mut cfg = sample();
        cfg.normalize();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        let text2 = toml::to_string_pretty(&back).unwrap();
        assert_eq!(text, text2);
    }

    #[test]
    fn normalize_drops_empty_strings() {
        let mut cfg = sample();
        cfg.normalize();
        assert_eq!(cfg.defaults.time.as_deref(), Some("4h"));
        assert_eq!(cfg.notifications.email, None);
    }

    #[test]
    fn scratch_defaults_by_user() {
        let cfg = sample();
        assert_eq!(cfg.paths.scratch_for("abc1de"), "/scratch/abc1de");
    }
}
