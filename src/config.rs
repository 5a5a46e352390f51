//! Project configuration
//!
//! Read from `<dir>/converge.toml`, falling back to
//! `~/.config/converge/config.toml`. Every field is optional; command-line
//! flags override what the file says.

use anyhow::{Context, Result};
use reconcile::{RetryConfig, RunOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const PROJECT_FILE: &str = "converge.toml";

/// Get the user config directory path
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join("converge"))
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConvergeConfig {
    /// Path of the store file; relative paths are resolved against the project
    #[serde(default)]
    pub store: Option<String>,

    #[serde(default)]
    pub deploy: DeployConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeployConfig {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub force_update: bool,
    #[serde(default)]
    pub verbose_diff: bool,
    #[serde(default)]
    pub prune: bool,
    #[serde(default)]
    pub fail_fast: bool,
    /// Worker threads
    pub jobs: Option<usize>,
    /// Items per remote call
    pub batch_size: Option<usize>,
    /// Run deadline in seconds
    pub deadline_secs: Option<u64>,
    /// Attempts per call, the first one included
    pub retries: Option<u32>,
}

/// Command-line values that take precedence over the file
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub dry_run: bool,
    pub force_update: bool,
    pub verbose_diff: bool,
    pub prune: bool,
    pub fail_fast: bool,
    pub jobs: Option<usize>,
    pub deadline_secs: Option<u64>,
}

impl ConvergeConfig {
    /// Load the config for a project directory
    pub fn load(project: &Path) -> Result<Self> {
        let local = project.join(PROJECT_FILE);
        if local.exists() {
            return Self::load_from(&local);
        }
        match config_dir() {
            Ok(dir) if dir.join("config.toml").exists() => {
                Self::load_from(&dir.join("config.toml"))
            }
            _ => {
                log::debug!("no config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Store file for a project, `<project>/store.json` unless configured
    pub fn store_path(&self, project: &Path) -> PathBuf {
        match &self.store {
            Some(store) => {
                let expanded = PathBuf::from(shellexpand::tilde(store).as_ref());
                if expanded.is_absolute() {
                    expanded
                } else {
                    project.join(expanded)
                }
            }
            None => project.join("store.json"),
        }
    }

    pub fn run_options(&self, overrides: &Overrides) -> RunOptions {
        let deploy = &self.deploy;
        let defaults = RunOptions::default();
        let retry = match deploy.retries {
            Some(max_attempts) => RetryConfig {
                max_attempts,
                ..RetryConfig::default()
            },
            None => RetryConfig::default(),
        };

        RunOptions {
            dry_run: overrides.dry_run || deploy.dry_run,
            force_update: overrides.force_update || deploy.force_update,
            verbose_diff: overrides.verbose_diff || deploy.verbose_diff,
            prune: overrides.prune || deploy.prune,
            fail_fast: overrides.fail_fast || deploy.fail_fast,
            concurrency: overrides.jobs.or(deploy.jobs).unwrap_or(defaults.concurrency),
            batch_size: deploy.batch_size.unwrap_or(defaults.batch_size),
            deadline: overrides
                .deadline_secs
                .or(deploy.deadline_secs)
                .map(Duration::from_secs),
            retry,
        }
    }
}
