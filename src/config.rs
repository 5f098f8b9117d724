//! Experiment configuration for a post-processing run.
//!
//! All user input arrives through a single YAML file with two top-level
//! sections: `cmor`, which controls where model output lives and how the
//! run is chunked and queued, and `attrs`, a free-form table of CMIP global
//! attributes (experiment_id, activity_id, parent_*, calendar, and so on)
//! that is passed through to the output files untouched.
//!
//! The configuration is read exactly once, at startup, into an immutable
//! [`AppConfig`] that is then passed by reference to every component. No
//! other part of the crate reads the process environment or mutates shared
//! options.
//!
//! Most of the output paths (`variable_maps`, `database`, the log
//! directories, ...) can be left unset, in which case they are derived from
//! `maindir` and `exp`.
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::Deserialize;

use crate::utils::parse_yyyymmdd;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not open configuration file {} because: {reason}", .path.display())]
    CouldNotOpen { path: PathBuf, reason: String },
    #[error("Configuration file {} is not valid YAML: {reason}", .path.display())]
    BadYaml { path: PathBuf, reason: String },
    #[error("Bad value for '{key}': {reason}")]
    BadValue { key: &'static str, reason: String },
    #[error("Required input {descr} ({}) does not exist", .path.display())]
    MissingInput { descr: &'static str, path: PathBuf },
}

/// Which family of CMOR tables the run targets. In `cmip6` mode table
/// definition files are expected to follow the official `CMIP6_<table>.json`
/// naming; in `custom` mode they are simply `<table>.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Cmip6,
    Custom,
}

/// The whole configuration file: the `cmor` run controls plus the free-form
/// `attrs` global-attribute table.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub cmor: CmorConfig,
    #[serde(default)]
    pub attrs: IndexMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CmorConfig {
    /// Compute project the batch job is billed to.
    pub project: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Root directory holding one subdirectory per experiment.
    pub maindir: PathBuf,
    /// Local experiment id; also the subdirectory of `maindir` with the raw output.
    pub exp: String,
    /// First day of the experiment range, as YYYYMMDD.
    pub start_date: String,
    /// Day after the last day of the experiment range, as YYYYMMDD.
    pub end_date: String,
    /// Reference date for the output time axis; "default" means `start_date`.
    #[serde(default = "default_keyword")]
    pub reference_date: String,
    /// Which ACCESS model produced the raw output (e.g. "ESM1.5", "CM2").
    pub access_version: String,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    /// Master variable-mapping catalog (CSV).
    pub master_map: PathBuf,
    /// Directory holding the CMOR table definition JSON files.
    pub tables_path: PathBuf,
    #[serde(default)]
    pub variable_maps: Option<PathBuf>,
    #[serde(default)]
    pub success_lists: Option<PathBuf>,
    #[serde(default)]
    pub cmor_logs: Option<PathBuf>,
    #[serde(default)]
    pub var_logs: Option<PathBuf>,
    #[serde(default)]
    pub app_logs: Option<PathBuf>,
    #[serde(default)]
    pub database: Option<PathBuf>,
    #[serde(default)]
    pub app_job: Option<PathBuf>,
    /// Restrict each table's variables to those the data request asks for.
    #[serde(default)]
    pub force_dreq: bool,
    /// Data request CSV; "default" means `cmvme_all.csv` under `tables_path`.
    #[serde(default = "default_keyword")]
    pub dreq: String,
    /// Honor the per-variable year ranges from the data request when queueing.
    #[serde(default)]
    pub dreq_years: bool,
    /// "all", or a single CMOR table id to restrict the run to.
    #[serde(default = "default_all")]
    pub tables: String,
    /// "all", or a single CMOR variable name to restrict the run to.
    #[serde(default = "default_all")]
    pub variable_to_process: String,
    /// Optional YAML list of variable names to restrict each table to.
    #[serde(default)]
    pub var_subset_list: Option<PathBuf>,
    /// Target output file size, in MB.
    #[serde(default = "default_max_size")]
    pub max_size: f64,
    pub path_template: String,
    pub file_template: String,
    /// Memory (GB) requested per CPU in the batch job script.
    #[serde(default = "default_mem_per_cpu")]
    pub mem_per_cpu: u32,
    /// Worker pool size, and the CPU count requested in the batch job script.
    #[serde(default = "default_ncpus")]
    pub ncpus: usize,
    /// Extra projects whose /g/data storage must be mounted by the batch job.
    #[serde(default)]
    pub addprojs: Vec<String>,
    /// Reprocess rows even when their output file already exists.
    #[serde(default, rename = "override")]
    pub override_existing: bool,
    /// Version label stamped on every queue row; defaults to today's date.
    #[serde(default)]
    pub version: Option<String>,
}

fn default_queue() -> String {
    "normal".to_string()
}

fn default_keyword() -> String {
    "default".to_string()
}

fn default_mode() -> Mode {
    Mode::Cmip6
}

fn default_all() -> String {
    "all".to_string()
}

fn default_max_size() -> f64 {
    2048.0
}

fn default_mem_per_cpu() -> u32 {
    8
}

fn default_ncpus() -> usize {
    1
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|e| ConfigError::CouldNotOpen {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: AppConfig =
            serde_yaml::from_slice(&data).map_err(|e| ConfigError::BadYaml {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values that serde cannot: the date strings must parse and
    /// the range must not be reversed. Called by `from_file`; failing here
    /// aborts the run before any queue work begins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let start = self.start_date()?;
        let end = self.end_date()?;
        if end <= start {
            return Err(ConfigError::BadValue {
                key: "end_date",
                reason: format!(
                    "end_date ({}) must fall after start_date ({})",
                    self.cmor.end_date, self.cmor.start_date
                ),
            });
        }
        self.reference_date()?;
        if self.cmor.max_size <= 0.0 {
            return Err(ConfigError::BadValue {
                key: "max_size",
                reason: format!("max_size must be positive, got {}", self.cmor.max_size),
            });
        }
        if self.cmor.ncpus == 0 {
            return Err(ConfigError::BadValue {
                key: "ncpus",
                reason: "ncpus must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Check that the input files the run cannot proceed without are present.
    /// Kept separate from [`AppConfig::validate`] so that tests can build
    /// configurations without touching the file system.
    pub fn check_inputs(&self) -> Result<(), ConfigError> {
        if !self.cmor.master_map.is_file() {
            return Err(ConfigError::MissingInput {
                descr: "master mapping catalog",
                path: self.cmor.master_map.clone(),
            });
        }
        if !self.cmor.tables_path.is_dir() {
            return Err(ConfigError::MissingInput {
                descr: "CMOR tables directory",
                path: self.cmor.tables_path.clone(),
            });
        }
        if let Some(subset) = &self.cmor.var_subset_list {
            if !subset.is_file() {
                return Err(ConfigError::MissingInput {
                    descr: "variable subset list",
                    path: subset.clone(),
                });
            }
        }
        if self.cmor.force_dreq && !self.dreq_path().is_file() {
            return Err(ConfigError::MissingInput {
                descr: "data request file",
                path: self.dreq_path(),
            });
        }
        Ok(())
    }

    pub fn start_date(&self) -> Result<NaiveDate, ConfigError> {
        parse_yyyymmdd(&self.cmor.start_date).map_err(|e| ConfigError::BadValue {
            key: "start_date",
            reason: e.to_string(),
        })
    }

    pub fn end_date(&self) -> Result<NaiveDate, ConfigError> {
        parse_yyyymmdd(&self.cmor.end_date).map_err(|e| ConfigError::BadValue {
            key: "end_date",
            reason: e.to_string(),
        })
    }

    /// The reference date for the output time axes; the keyword "default"
    /// resolves to the experiment start date.
    pub fn reference_date(&self) -> Result<NaiveDate, ConfigError> {
        if self.cmor.reference_date == "default" {
            self.start_date()
        } else {
            parse_yyyymmdd(&self.cmor.reference_date).map_err(|e| ConfigError::BadValue {
                key: "reference_date",
                reason: e.to_string(),
            })
        }
    }

    /// The activity_id global attribute, if the user supplied one. Needed
    /// for the data-request MIP membership test when `force_dreq` is on.
    pub fn activity_id(&self) -> Option<&str> {
        self.attrs.get("activity_id").and_then(|v| v.as_str())
    }

    fn exp_dir(&self) -> PathBuf {
        self.cmor.maindir.join(&self.cmor.exp)
    }

    fn derived(&self, configured: &Option<PathBuf>, leaf: &str) -> PathBuf {
        configured
            .clone()
            .unwrap_or_else(|| self.exp_dir().join(leaf))
    }

    pub fn variable_maps_dir(&self) -> PathBuf {
        self.derived(&self.cmor.variable_maps, "variable_maps")
    }

    pub fn success_lists_dir(&self) -> PathBuf {
        self.derived(&self.cmor.success_lists, "success_lists")
    }

    pub fn cmor_logs_dir(&self) -> PathBuf {
        self.derived(&self.cmor.cmor_logs, "cmor_logs")
    }

    pub fn var_logs_dir(&self) -> PathBuf {
        self.derived(&self.cmor.var_logs, "variable_logs")
    }

    pub fn app_logs_dir(&self) -> PathBuf {
        self.derived(&self.cmor.app_logs, "app_logs")
    }

    pub fn database_path(&self) -> PathBuf {
        self.cmor
            .database
            .clone()
            .unwrap_or_else(|| self.exp_dir().join("database.db"))
    }

    pub fn app_job_path(&self) -> PathBuf {
        self.cmor
            .app_job
            .clone()
            .unwrap_or_else(|| self.exp_dir().join("app_job.sh"))
    }

    pub fn dreq_path(&self) -> PathBuf {
        if self.cmor.dreq == "default" {
            self.cmor.tables_path.join("cmvme_all.csv")
        } else {
            PathBuf::from(&self.cmor.dreq)
        }
    }
}
