//! Live configuration and persistence of management changes.
//!
//! Readers take a lock-free snapshot through `ArcSwap`. Writers serialize on
//! a mutex, build the next config, persist it, and only then publish it, so a
//! failed write leaves both the file and the in-memory config untouched.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;

use crate::config::loader::{load_config, ConfigError, ConfigFormat};
use crate::config::schema::ProxyConfig;

/// Number of timestamped backups kept next to the config file.
pub const MAX_BACKUPS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("backend '{0}' not found")]
    NotFound(String),

    #[error("backend '{name}' is already {}", state_word(.enabled))]
    AlreadyInState { name: String, enabled: bool },

    #[error("failed to persist config to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(String),
}

fn state_word(enabled: &bool) -> &'static str {
    if *enabled {
        "enabled"
    } else {
        "disabled"
    }
}

/// Owner of the live `ProxyConfig`.
pub struct ConfigManager {
    current: ArcSwap<ProxyConfig>,
    path: Option<PathBuf>,
    format: ConfigFormat,
    write_lock: Mutex<()>,
}

impl ConfigManager {
    /// Load from disk; later changes are written back to the same file.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = load_config(&path)?;
        let format = ConfigFormat::from_path(&path);
        Ok(Self {
            current: ArcSwap::from_pointee(config),
            path: Some(path),
            format,
            write_lock: Mutex::new(()),
        })
    }

    /// Manager without a backing file. Changes live in memory only.
    pub fn in_memory(config: ProxyConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
            path: None,
            format: ConfigFormat::Json,
            write_lock: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<ProxyConfig> {
        self.current.load_full()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Flip a backend's `enabled` flag and persist the result.
    pub fn set_backend_enabled(
        &self,
        name: &str,
        enabled: bool,
    ) -> Result<Arc<ProxyConfig>, ManagerError> {
        self.set_backend_enabled_with(name, enabled, |_| {})
    }

    /// Like [`set_backend_enabled`](Self::set_backend_enabled), running
    /// `applied` on the new snapshot before the write lock is released.
    /// Toggles of the same backend therefore reach `applied` in the order
    /// they were persisted.
    pub fn set_backend_enabled_with<F>(
        &self,
        name: &str,
        enabled: bool,
        applied: F,
    ) -> Result<Arc<ProxyConfig>, ManagerError>
    where
        F: FnOnce(&ProxyConfig),
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut next = ProxyConfig::clone(&self.current.load());
        let backend = next
            .backends
            .iter_mut()
            .find(|b| b.name == name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;

        if backend.enabled == enabled {
            return Err(ManagerError::AlreadyInState {
                name: name.to_string(),
                enabled,
            });
        }
        backend.enabled = enabled;

        if let Some(path) = &self.path {
            self.persist(path, &next)?;
        }

        let next = Arc::new(next);
        self.current.store(next.clone());
        applied(&next);
        tracing::info!(backend = %name, enabled, "Backend toggled");
        Ok(next)
    }

    fn persist(&self, path: &Path, config: &ProxyConfig) -> Result<(), ManagerError> {
        let content = match self.format {
            ConfigFormat::Json => serde_json::to_string_pretty(config)
                .map_err(|e| ManagerError::Serialize(e.to_string()))?,
            ConfigFormat::Toml => toml::to_string_pretty(config)
                .map_err(|e| ManagerError::Serialize(e.to_string()))?,
        };

        if path.exists() {
            if let Err(e) = backup(path, self.format) {
                // Backup failure is logged, not fatal.
                tracing::warn!(path = %path.display(), error = %e, "Config backup failed");
            }
        }

        write_atomic(path, content.as_bytes()).map_err(|source| ManagerError::Persist {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Write to `<path>.tmp` then rename over the original.
fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, content)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Copy the current file to `backups/<stem>.<YYYYMMDD-HHMMSS>.<ext>` and prune.
fn backup(path: &Path, format: ConfigFormat) -> std::io::Result<PathBuf> {
    let dir = backup_dir(path);
    fs::create_dir_all(&dir)?;

    let stem = file_stem(path);
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let target = dir.join(format!("{stem}.{stamp}.{}", format.extension()));
    fs::copy(path, &target)?;

    prune_backups(&dir, &stem, format)?;
    Ok(target)
}

pub fn backup_dir(path: &Path) -> PathBuf {
    path.parent()
        .unwrap_or_else(|| Path::new("."))
        .join("backups")
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("config")
        .to_string()
}

/// Keep only the newest `MAX_BACKUPS` files. Timestamps sort lexically.
fn prune_backups(dir: &Path, stem: &str, format: ConfigFormat) -> std::io::Result<()> {
    let prefix = format!("{stem}.");
    let suffix = format!(".{}", format.extension());

    let mut backups: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(&suffix))
        })
        .collect();
    backups.sort();

    let excess = backups.len().saturating_sub(MAX_BACKUPS);
    for old in backups.into_iter().take(excess) {
        fs::remove_file(&old)?;
    }
    Ok(())
}

/// Mask a secret for display: `sk-a...wxyz`, or `****` when short.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "backends": [
            {"name": "primary", "base_url": "http://127.0.0.1:1", "token": "sk-primary-token"},
            {"name": "fallback", "base_url": "http://127.0.0.1:2", "enabled": false}
        ]
    }"#;

    fn write_config(dir: &Path) -> PathBuf {
        let path = dir.join("config.json");
        fs::write(&path, CONFIG).unwrap();
        path
    }

    #[test]
    fn toggle_persists_and_backs_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path());
        let manager = ConfigManager::load(&path).unwrap();

        manager.set_backend_enabled("fallback", true).unwrap();

        assert!(manager.snapshot().backend("fallback").unwrap().enabled);
        let reloaded = load_config(&path).unwrap();
        assert!(reloaded.backend("fallback").unwrap().enabled);

        let backups: Vec<_> = fs::read_dir(backup_dir(&path)).unwrap().collect();
        assert_eq!(backups.len(), 1);
        assert!(!dir.path().join("config.json.tmp").exists());
    }

    #[test]
    fn toggle_errors() {
        let manager = ConfigManager::in_memory(serde_json::from_str(CONFIG).unwrap());

        let err = manager.set_backend_enabled("primary", true).unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyInState { enabled: true, .. }));
        assert_eq!(err.to_string(), "backend 'primary' is already enabled");

        let err = manager.set_backend_enabled("nope", false).unwrap_err();
        assert!(matches!(err, ManagerError::NotFound(_)));
    }

    #[test]
    fn applied_hook_runs_under_the_write_lock() {
        let manager = ConfigManager::in_memory(serde_json::from_str(CONFIG).unwrap());

        let mut seen = None;
        manager
            .set_backend_enabled_with("primary", false, |config| {
                assert!(manager.write_lock.try_lock().is_err());
                seen = config.backend("primary").map(|b| b.enabled);
            })
            .unwrap();
        assert_eq!(seen, Some(false));

        let mut called = false;
        let err = manager
            .set_backend_enabled_with("primary", false, |_| called = true)
            .unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyInState { .. }));
        assert!(!called);
    }

    #[test]
    fn failed_write_keeps_previous_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path());
        let manager = ConfigManager::load(&path).unwrap();

        // A directory squatting on the temp path makes the write fail.
        fs::create_dir(dir.path().join("config.json.tmp")).unwrap();

        let err = manager.set_backend_enabled("primary", false).unwrap_err();
        assert!(matches!(err, ManagerError::Persist { .. }));
        assert!(manager.snapshot().backend("primary").unwrap().enabled);
    }

    #[test]
    fn keeps_five_newest_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path());
        let backups = backup_dir(&path);
        fs::create_dir_all(&backups).unwrap();
        for day in 1..=7 {
            fs::write(backups.join(format!("config.2020010{day}-000000.json")), "{}").unwrap();
        }
        fs::write(backups.join("unrelated.txt"), "keep me").unwrap();

        let manager = ConfigManager::load(&path).unwrap();
        manager.set_backend_enabled("primary", false).unwrap();

        let mut names: Vec<String> = fs::read_dir(&backups)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        assert_eq!(names.len(), MAX_BACKUPS + 1);
        assert!(names.contains(&"unrelated.txt".to_string()));
        assert!(!names.contains(&"config.20200101-000000.json".to_string()));
        assert!(!names.contains(&"config.20200103-000000.json".to_string()));
        assert!(names.contains(&"config.20200104-000000.json".to_string()));
    }

    #[test]
    fn masks_tokens() {
        assert_eq!(mask_token("short"), "****");
        assert_eq!(mask_token("12345678"), "****");
        assert_eq!(mask_token("sk-abcdefghijklmnop"), "sk-a...mnop");
    }
}
