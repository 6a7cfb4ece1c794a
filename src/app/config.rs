//! Config file loading and layering.
//!
//! Priority: CLI flags, then the TOML file, then built-in defaults.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use mss_core::download::constants::PAGE_TIMEOUT_SECS;
use mss_core::download::{DEFAULT_PER_HOST_CONNECTIONS, MIN_VALID_PAGE_BYTES};
use mss_core::library::{LibraryProfile, LibraryRegistryBuilder};
use mss_core::manifest::DEFAULT_MANIFEST_TIMEOUT;
use mss_core::orchestrator::{DEFAULT_MAX_ACTIVE_JOBS, DEFAULT_STALL_TIMEOUT, OrchestratorConfig};
use mss_core::split::{DEFAULT_MAX_PAGES_PER_PART, DEFAULT_MAX_PART_BYTES, SplitPolicy};
use serde::Deserialize;

use crate::cli::Cli;

const APP_DIR: &str = "mss-downloader";
const STATE_DIR_NAME: &str = ".mss-downloader";
const MIB: u64 = 1024 * 1024;

/// TOML file contents. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FileConfig {
    pub(crate) output_dir: Option<PathBuf>,
    pub(crate) state_dir: Option<PathBuf>,
    pub(crate) max_active_jobs: Option<usize>,
    pub(crate) max_pages_per_part: Option<usize>,
    pub(crate) max_part_mb: Option<u64>,
    pub(crate) failure_tolerance: Option<f64>,
    pub(crate) stall_timeout_secs: Option<u64>,
    pub(crate) manifest_timeout_secs: Option<u64>,
    pub(crate) page_timeout_secs: Option<u64>,
    pub(crate) per_host_connections: Option<usize>,
    pub(crate) min_page_bytes: Option<u64>,
    #[serde(default)]
    pub(crate) libraries: BTreeMap<String, LibraryOverride>,
}

/// `[libraries.<id>]` table.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LibraryOverride {
    pub(crate) concurrency: Option<usize>,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) base_delay_ms: Option<u64>,
    pub(crate) max_delay_ms: Option<u64>,
    pub(crate) jitter: Option<f64>,
    pub(crate) timeout_multiplier: Option<f64>,
    pub(crate) avg_page_kb: Option<u64>,
    pub(crate) max_part_mb: Option<u64>,
}

impl FileConfig {
    /// Validates ranges.
    pub(crate) fn validate(&self) -> Result<()> {
        check_range("max_active_jobs", self.max_active_jobs, 1, 8)?;
        check_range("max_pages_per_part", self.max_pages_per_part, 1, 10_000)?;
        check_range("max_part_mb", self.max_part_mb, 1, 4096)?;
        check_range("stall_timeout_secs", self.stall_timeout_secs, 10, 86_400)?;
        check_range("manifest_timeout_secs", self.manifest_timeout_secs, 1, 3600)?;
        check_range("page_timeout_secs", self.page_timeout_secs, 1, 3600)?;
        check_range("per_host_connections", self.per_host_connections, 1, 64)?;
        check_range("min_page_bytes", self.min_page_bytes, 1, 10 * MIB)?;
        check_fraction("failure_tolerance", self.failure_tolerance)?;
        for (id, library) in &self.libraries {
            library
                .validate()
                .with_context(|| format!("Invalid `[libraries.{id}]` table"))?;
        }
        Ok(())
    }
}

impl LibraryOverride {
    fn validate(&self) -> Result<()> {
        check_range("concurrency", self.concurrency, 1, 32)?;
        check_range("max_attempts", self.max_attempts, 1, 50)?;
        check_range("base_delay_ms", self.base_delay_ms, 1, 600_000)?;
        check_range("max_delay_ms", self.max_delay_ms, 1, 3_600_000)?;
        check_range("avg_page_kb", self.avg_page_kb, 1, 100 * 1024)?;
        check_range("max_part_mb", self.max_part_mb, 1, 4096)?;
        check_fraction("jitter", self.jitter)?;
        if let Some(multiplier) = self.timeout_multiplier
            && !(multiplier.is_finite() && (0.1..=20.0).contains(&multiplier))
        {
            bail!("Invalid config value for `timeout_multiplier`: {multiplier}. Expected range: 0.1..=20");
        }
        if let (Some(base), Some(max)) = (self.base_delay_ms, self.max_delay_ms)
            && max < base
        {
            bail!("Invalid config: `max_delay_ms` ({max}) is below `base_delay_ms` ({base})");
        }
        Ok(())
    }

    /// Applies the set keys to `profile`.
    pub(crate) fn apply(&self, profile: &mut LibraryProfile) {
        if let Some(concurrency) = self.concurrency {
            profile.concurrency = concurrency;
        }
        if let Some(max_attempts) = self.max_attempts {
            profile.backoff = profile.backoff.with_max_attempts(max_attempts);
        }
        if self.base_delay_ms.is_some() || self.max_delay_ms.is_some() {
            let base = self
                .base_delay_ms
                .map_or(profile.backoff.base_delay(), Duration::from_millis);
            let max = self
                .max_delay_ms
                .map_or(profile.backoff.max_delay(), Duration::from_millis);
            profile.backoff = profile.backoff.with_delays(base, max);
        }
        if let Some(jitter) = self.jitter {
            profile.backoff = profile.backoff.with_jitter(jitter);
        }
        if let Some(multiplier) = self.timeout_multiplier {
            profile.timeout_multiplier = multiplier;
        }
        if let Some(kb) = self.avg_page_kb {
            profile.avg_page_bytes = kb * 1024;
        }
        if let Some(mb) = self.max_part_mb {
            profile.max_part_bytes = Some(mb * MIB);
        }
    }
}

fn check_range<T>(field: &str, value: Option<T>, min: T, max: T) -> Result<()>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    let Some(value) = value else {
        return Ok(());
    };
    if value < min || value > max {
        bail!("Invalid config value for `{field}`: {value}. Expected range: {min}..={max}");
    }
    Ok(())
}

fn check_fraction(field: &str, value: Option<f64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(0.0..=1.0).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 0.0..=1.0");
    }
    Ok(())
}

/// Resolves the default config path.
///
/// 1. `$XDG_CONFIG_HOME/mss-downloader/config.toml`
/// 2. `$HOME/.config/mss-downloader/config.toml`
#[must_use]
pub(crate) fn default_config_path() -> Option<PathBuf> {
    if let Some(xdg) = env_var_non_empty("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join(APP_DIR).join("config.toml"));
    }
    let home = env_var_non_empty("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join("config.toml"),
    )
}

fn env_var_non_empty(name: &str) -> Option<std::ffi::OsString> {
    env::var_os(name).filter(|value| !value.is_empty())
}

/// Loads `explicit`, or the default path when it exists.
///
/// An explicit path that does not exist is an error; a missing default file is not.
pub(crate) fn load(explicit: Option<&Path>) -> Result<FileConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(FileConfig::default()),
        },
    };
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse(&raw).with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

pub(crate) fn parse(raw: &str) -> Result<FileConfig> {
    let config: FileConfig = toml::from_str(raw)?;
    config.validate()?;
    Ok(config)
}

/// Effective settings after layering.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) output_dir: PathBuf,
    pub(crate) state_dir: PathBuf,
    pub(crate) max_active_jobs: usize,
    pub(crate) split: SplitPolicy,
    pub(crate) failure_tolerance: f64,
    pub(crate) stall_timeout: Duration,
    pub(crate) manifest_timeout: Duration,
    pub(crate) page_timeout: Duration,
    pub(crate) per_host_connections: usize,
    pub(crate) min_page_bytes: u64,
    pub(crate) libraries: BTreeMap<String, LibraryOverride>,
}

impl Settings {
    pub(crate) fn resolve(cli: &Cli, file: FileConfig) -> Self {
        let output_dir = cli
            .output_dir
            .clone()
            .or(file.output_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        let state_dir = cli
            .state_dir
            .clone()
            .or(file.state_dir)
            .unwrap_or_else(|| output_dir.join(STATE_DIR_NAME));
        Self {
            max_active_jobs: cli
                .jobs
                .map(usize::from)
                .or(file.max_active_jobs)
                .unwrap_or(DEFAULT_MAX_ACTIVE_JOBS),
            split: SplitPolicy {
                max_pages_per_part: file
                    .max_pages_per_part
                    .unwrap_or(DEFAULT_MAX_PAGES_PER_PART),
                max_bytes_per_part: file
                    .max_part_mb
                    .map_or(DEFAULT_MAX_PART_BYTES, |mb| mb * MIB),
            },
            failure_tolerance: file.failure_tolerance.unwrap_or(0.0),
            stall_timeout: file
                .stall_timeout_secs
                .map_or(DEFAULT_STALL_TIMEOUT, Duration::from_secs),
            manifest_timeout: file
                .manifest_timeout_secs
                .map_or(DEFAULT_MANIFEST_TIMEOUT, Duration::from_secs),
            page_timeout: file
                .page_timeout_secs
                .map_or(Duration::from_secs(PAGE_TIMEOUT_SECS), Duration::from_secs),
            per_host_connections: file
                .per_host_connections
                .unwrap_or(DEFAULT_PER_HOST_CONNECTIONS),
            min_page_bytes: file.min_page_bytes.unwrap_or(MIN_VALID_PAGE_BYTES),
            libraries: file.libraries,
            output_dir,
            state_dir,
        }
    }

    /// Applies `[libraries.<id>]` tables to the built-in profiles.
    pub(crate) fn apply_library_overrides(&self, builder: &mut LibraryRegistryBuilder) -> Result<()> {
        for (id, library) in &self.libraries {
            let Some(profile) = builder.profile_mut(id) else {
                bail!(
                    "Unknown library `{id}` in config `[libraries]` table\n  \
                     Suggestion: use an id from the built-in library table, e.g. `gallica` or `iiif`"
                );
            };
            library.apply(profile);
        }
        Ok(())
    }

    pub(crate) fn orchestrator_config(&self) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::new(&self.output_dir, &self.state_dir);
        config.max_active_jobs = self.max_active_jobs;
        config.split = self.split;
        config.failure_tolerance = self.failure_tolerance;
        config.page_timeout = self.page_timeout;
        config.stall_timeout = self.stall_timeout;
        config
    }
}
