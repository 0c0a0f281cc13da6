//! Engine configuration, loaded from `~/.config/rangeload/config.toml`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Global configuration for one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Connect timeout per HTTP request, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Read-stall timeout per HTTP request, in milliseconds. A transfer
    /// that moves no data for this long is aborted as a transport failure.
    pub read_timeout_ms: u64,
    /// Total worker-thread budget across all concurrently active jobs.
    pub all_download_threads: usize,
    /// Segment workers per job when the server supports ranges.
    pub each_download_threads: usize,
    /// Retry budget tracked per job. The engine records attempts but does
    /// not re-enqueue on its own; retry policy belongs to the caller.
    pub retry_count: u32,
    /// HTTP method used for the probe and segment requests.
    #[serde(default = "default_method")]
    pub method: String,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            read_timeout_ms: 10_000,
            all_download_threads: 9,
            each_download_threads: 3,
            retry_count: 3,
            method: default_method(),
        }
    }
}

impl DownloadConfig {
    /// Checks internal consistency. Called by `Engine::new` before anything
    /// is scheduled.
    pub fn validate(&self) -> Result<()> {
        if self.all_download_threads == 0 || self.each_download_threads == 0 {
            anyhow::bail!("thread budgets must be at least 1");
        }
        if self.each_download_threads > self.all_download_threads {
            anyhow::bail!(
                "each_download_threads ({}) must not exceed all_download_threads ({})",
                self.each_download_threads,
                self.all_download_threads
            );
        }
        Ok(())
    }

    /// Concurrency cap for the scheduler: total worker budget divided by the
    /// per-job worker budget, so segment workers across all active jobs never
    /// exceed `all_download_threads`.
    pub fn max_active_jobs(&self) -> usize {
        (self.all_download_threads / self.each_download_threads.max(1)).max(1)
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("rangeload")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from the default XDG location, creating a default
/// file if none exists.
pub fn load_or_init() -> Result<DownloadConfig> {
    load_or_init_at(&config_path()?)
}

/// Like `load_or_init` but against an explicit path, for embedders and
/// tests with their own layout.
pub fn load_or_init_at(path: &Path) -> Result<DownloadConfig> {
    if !path.exists() {
        let default_cfg = DownloadConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(path)?;
    let cfg: DownloadConfig = toml::from_str(&data)?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = DownloadConfig::default();
        assert_eq!(cfg.connect_timeout_ms, 10_000);
        assert_eq!(cfg.read_timeout_ms, 10_000);
        assert_eq!(cfg.all_download_threads, 9);
        assert_eq!(cfg.each_download_threads, 3);
        assert_eq!(cfg.retry_count, 3);
        assert_eq!(cfg.method, "GET");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = DownloadConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: DownloadConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.all_download_threads, cfg.all_download_threads);
        assert_eq!(parsed.each_download_threads, cfg.each_download_threads);
        assert_eq!(parsed.method, cfg.method);
    }

    #[test]
    fn config_toml_custom_values() {
        let toml = r#"
            connect_timeout_ms = 5000
            read_timeout_ms = 20000
            all_download_threads = 12
            each_download_threads = 4
            retry_count = 1
        "#;
        let cfg: DownloadConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.connect_timeout_ms, 5000);
        assert_eq!(cfg.all_download_threads, 12);
        assert_eq!(cfg.each_download_threads, 4);
        // method falls back to GET when absent
        assert_eq!(cfg.method, "GET");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn load_or_init_creates_then_reloads_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/config.toml");

        let created = load_or_init_at(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created.all_download_threads, 9);

        // Second call parses the file written by the first.
        let reloaded = load_or_init_at(&path).unwrap();
        assert_eq!(reloaded.each_download_threads, created.each_download_threads);
        assert_eq!(reloaded.method, "GET");
    }

    #[test]
    fn load_or_init_rejects_inconsistent_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "connect_timeout_ms = 1000\nread_timeout_ms = 1000\n\
             all_download_threads = 2\neach_download_threads = 3\nretry_count = 1\n",
        )
        .unwrap();
        assert!(load_or_init_at(&path).is_err());
    }

    #[test]
    fn per_job_budget_must_fit_global_budget() {
        let cfg = DownloadConfig {
            all_download_threads: 2,
            each_download_threads: 3,
            ..DownloadConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn max_active_jobs_is_floor_division() {
        let cfg = DownloadConfig {
            all_download_threads: 9,
            each_download_threads: 3,
            ..DownloadConfig::default()
        };
        assert_eq!(cfg.max_active_jobs(), 3);

        let cfg = DownloadConfig {
            all_download_threads: 10,
            each_download_threads: 3,
            ..DownloadConfig::default()
        };
        assert_eq!(cfg.max_active_jobs(), 3);

        let cfg = DownloadConfig {
            all_download_threads: 3,
            each_download_threads: 3,
            ..DownloadConfig::default()
        };
        assert_eq!(cfg.max_active_jobs(), 1);
    }
}
