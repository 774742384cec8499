//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `MUSHER_STAGING_DIR`: compute-side staging root (default: random name)
//! - `MUSHER_TRANSFER_BUCKET`: relay bucket for tree transfers (optional,
//!   `gs://` prefix allowed)
//! - `MUSHER_BILLING_PROJECT`: project charged for requester-pays access
//! - `MUSHER_DISK_TYPE`: ephemeral disk type, `standard` or `ssd`; `none`
//!   disables provisioning (default: standard)
//! - `MUSHER_LOCAL_DOWNLOAD_DIR`: mount root for node-local downloads
//!   (default: /mnt/musher-local-downloads/<engine key>)
//! - `MUSHER_PREP_CONCURRENCY`: concurrent jobs during input preparation
//!   (default: num_cpus * 2)
//! - `MUSHER_OUTPUT_DIR`: default destination for collected outputs
//!   (default: musher_output)

use std::{
    env,
    path::PathBuf,
    sync::{OnceLock, RwLock},
};

use anyhow::{Context, Result};

use crate::localization::{LocalizeMode, LocalizerOptions};

/// Global configuration cache
static CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

/// Engine configuration
#[derive(Clone, Debug)]
pub struct Config {
    /// Compute-side staging root; a random name is chosen when unset
    pub staging_dir: Option<PathBuf>,

    /// Bucket relaying tree transfers, without the scheme prefix
    pub transfer_bucket: Option<String>,

    /// Project charged for requester-pays bucket access
    pub billing_project: Option<String>,

    /// Ephemeral disk type; `None` disables provisioning
    pub disk_type: Option<String>,

    /// Mount root for node-local downloads
    pub local_download_dir: Option<PathBuf>,

    /// Concurrent jobs during input preparation
    pub prep_concurrency: usize,

    /// Default destination for collected outputs
    pub output_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            staging_dir: None,
            transfer_bucket: None,
            billing_project: None,
            disk_type: Some("standard".to_string()),
            local_download_dir: None,
            prep_concurrency: num_cpus::get().max(1) * 2,
            output_dir: PathBuf::from("musher_output"),
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();
        let staging_dir = env::var("MUSHER_STAGING_DIR").ok().map(PathBuf::from);
        let transfer_bucket = env::var("MUSHER_TRANSFER_BUCKET")
            .ok()
            .map(|bucket| bucket.trim_start_matches("gs://").to_string());
        let billing_project = env::var("MUSHER_BILLING_PROJECT").ok();
        let disk_type = match env::var("MUSHER_DISK_TYPE") {
            Ok(value) if value == "none" => None,
            Ok(value) => Some(value),
            Err(_) => defaults.disk_type,
        };
        let local_download_dir = env::var("MUSHER_LOCAL_DOWNLOAD_DIR").ok().map(PathBuf::from);
        let prep_concurrency = match env::var("MUSHER_PREP_CONCURRENCY") {
            Ok(value) => value
                .parse()
                .context("MUSHER_PREP_CONCURRENCY must be a positive integer")?,
            Err(_) => defaults.prep_concurrency,
        };
        let output_dir = env::var("MUSHER_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.output_dir);
        Ok(Self {
            staging_dir,
            transfer_bucket,
            billing_project,
            disk_type,
            local_download_dir,
            prep_concurrency,
            output_dir,
        })
    }

    /// Localizer options derived from this configuration.
    pub fn localizer_options(&self, mode: LocalizeMode) -> LocalizerOptions {
        LocalizerOptions {
            mode,
            staging_dir: self.staging_dir.clone(),
            transfer_bucket: self.transfer_bucket.clone(),
            disk_type: self.disk_type.clone(),
            local_download_dir: self.local_download_dir.clone(),
            prep_concurrency: self.prep_concurrency,
        }
    }
}

/// Process-wide configuration, loaded from the environment on first use.
pub fn get() -> Result<Config> {
    if let Some(lock) = CONFIG.get() {
        return Ok(lock.read().expect("config lock poisoned").clone());
    }
    let config = Config::from_env()?;
    let lock = CONFIG.get_or_init(|| RwLock::new(config));
    Ok(lock.read().expect("config lock poisoned").clone())
}

/// Replace the process-wide configuration (tests and embedders).
pub fn set(config: Config) {
    let lock = CONFIG.get_or_init(|| RwLock::new(Config::default()));
    *lock.write().expect("config lock poisoned") = config;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_standard_disks() {
        let config = Config::default();
        assert_eq!(config.disk_type.as_deref(), Some("standard"));
        assert!(config.prep_concurrency >= 2);
    }

    #[test]
    fn options_carry_mode_and_bucket() {
        let config = Config {
            transfer_bucket: Some("bucket".into()),
            ..Config::default()
        };
        let options = config.localizer_options(LocalizeMode::Shared);
        assert_eq!(options.mode, LocalizeMode::Shared);
        assert_eq!(options.transfer_bucket.as_deref(), Some("bucket"));
    }
}
