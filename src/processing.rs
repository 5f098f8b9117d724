//! Driving the per-row conversion across a worker pool.
//!
//! The conversion itself (reading the source NetCDF files, resampling,
//! defining CMOR axes, writing the output) lives behind the
//! [`RowConverter`] trait; this module owns everything around it: claiming
//! unprocessed rows, deciding whether a row even needs converting, mapping
//! the converter's outcome onto a row status, and summarising the run into
//! the success/failure CSV reports.
//!
//! Workers never share a database connection. Each row's task opens its own
//! connection to record the outcome, mirroring one-connection-per-worker
//! process pools; SQLite's locking plus the queue's busy timeout make the
//! concurrent updates safe. There is no in-run retry: a row whose task dies
//! simply stays `unprocessed` for the next invocation, and population being
//! idempotent makes that rerun cheap.
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use rayon::prelude::*;

use crate::config::{AppConfig, ConfigError};
use crate::queue::{JobRow, Queue, QueueError, RowStatus};
use crate::utils;

/// Exit code the external wrapper uses to signal "no source data in range".
const NO_DATA_EXIT_CODE: i32 = 10;

/// What the conversion step reports back for one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionOutcome {
    /// A file was produced at the given path.
    Wrote(PathBuf),
    /// No source data overlaps the requested time range.
    NoData,
    /// The conversion step returned a code this crate does not recognise.
    UnknownCode(i32),
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("could not launch the conversion command: {0}")]
    Spawn(std::io::Error),
    #[error("{0}")]
    Failed(String),
}

/// The opaque CMOR conversion sink. Implementations must be callable from
/// multiple worker threads at once.
pub trait RowConverter: Send + Sync {
    fn convert(&self, row: &JobRow) -> Result<ConversionOutcome, ConversionError>;
}

/// Production converter: shells out to a per-row wrapper command with the
/// row's fields exported as `APP_*` environment variables. The wrapper
/// prints the produced file's path as its last line of stdout and exits 0;
/// exit code 10 means no source data was found in the row's time range.
pub struct ExternalConverter {
    command: String,
}

impl ExternalConverter {
    pub fn new<S: Into<String>>(command: S) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl RowConverter for ExternalConverter {
    fn convert(&self, row: &JobRow) -> Result<ConversionOutcome, ConversionError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("APP_INFILE", &row.infile)
            .env("APP_OUTPATH", &row.outpath)
            .env("APP_FILE_NAME", &row.file_name)
            .env("APP_VIN", &row.vin)
            .env("APP_VARIABLE_ID", &row.variable_id)
            .env("APP_CMIP_TABLE", &row.cmip_table)
            .env("APP_FREQUENCY", &row.frequency)
            .env("APP_TIMESHOT", row.timeshot.to_string())
            .env("APP_TSTART", utils::format_yyyymmdd(row.tstart))
            .env("APP_TEND", utils::format_yyyymmdd(row.tend))
            .env("APP_CALCULATION", &row.calculation)
            .env("APP_IN_UNITS", &row.in_units)
            .env("APP_POSITIVE", &row.positive)
            .env("APP_CFNAME", &row.cfname)
            .env("APP_REFERENCE_DATE", &row.reference_date)
            .env("APP_VERSION", &row.version)
            .output()
            .map_err(ConversionError::Spawn)?;

        match output.status.code() {
            Some(0) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let path = stdout
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .map(|l| PathBuf::from(l.trim()));
                match path {
                    Some(p) => Ok(ConversionOutcome::Wrote(p)),
                    None => Err(ConversionError::Failed(
                        "wrapper exited 0 without printing an output path".to_string(),
                    )),
                }
            }
            Some(NO_DATA_EXIT_CODE) => Ok(ConversionOutcome::NoData),
            Some(code) => Ok(ConversionOutcome::UnknownCode(code)),
            None => Err(ConversionError::Failed(
                "conversion command was killed by a signal".to_string(),
            )),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not build the worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("Could not write report {} because: {reason}", .path.display())]
    Report { path: PathBuf, reason: String },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSummary {
    pub processed: usize,
    pub data_unavailable: usize,
    pub unknown_return_code: usize,
    pub file_mismatch: usize,
    pub processing_failed: usize,
    /// Rows skipped because their output file already exists on disk.
    pub skipped: usize,
    /// Rows whose outcome could not be written back to the database.
    pub update_failed: usize,
}

impl std::fmt::Display for ProcessSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} processed, {} data_unavailable, {} unknown_return_code, \
             {} file_mismatch, {} processing_failed, {} skipped",
            self.processed,
            self.data_unavailable,
            self.unknown_return_code,
            self.file_mismatch,
            self.processing_failed,
            self.skipped
        )
    }
}

enum RowOutcome {
    Skipped,
    Recorded(RowStatus),
    UpdateFailed,
}

/// Process every unprocessed row for the configured experiment.
///
/// Rows are fetched once up front; completion order across workers is
/// arbitrary. Terminal-status rows are not fetched at all, and without the
/// override flag a fetched row whose output file already exists is skipped
/// without invoking the converter.
pub fn process_queue(
    config: &AppConfig,
    converter: &dyn RowConverter,
) -> Result<ProcessSummary, ProcessingError> {
    let db_path = config.database_path();
    let rows = {
        let queue = Queue::open(&db_path)?;
        queue.fetch_unprocessed(&config.cmor.exp)?
    };
    if rows.is_empty() {
        log::info!("no unprocessed rows for experiment {}", config.cmor.exp);
        return Ok(ProcessSummary::default());
    }
    log::info!(
        "processing {} row(s) for experiment {} on {} worker(s)",
        rows.len(),
        config.cmor.exp,
        config.cmor.ncpus
    );

    let var_logs = config.var_logs_dir();
    if let Err(e) = utils::ensure_dir(&var_logs) {
        log::warn!(
            "could not create per-variable log directory {}: {e}",
            var_logs.display()
        );
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.cmor.ncpus)
        .build()?;
    let pbar = indicatif::ProgressBar::new(rows.len() as u64);

    let override_existing = config.cmor.override_existing;
    let outcomes: Vec<RowOutcome> = pool.install(|| {
        rows.par_iter()
            .map(|row| {
                let outcome = process_row(&db_path, row, override_existing, converter, &var_logs);
                pbar.inc(1);
                outcome
            })
            .collect()
    });
    pbar.finish_and_clear();

    let mut summary = ProcessSummary::default();
    for outcome in outcomes {
        match outcome {
            RowOutcome::Skipped => summary.skipped += 1,
            RowOutcome::UpdateFailed => summary.update_failed += 1,
            RowOutcome::Recorded(status) => match status {
                RowStatus::Processed => summary.processed += 1,
                RowStatus::DataUnavailable => summary.data_unavailable += 1,
                RowStatus::UnknownReturnCode => summary.unknown_return_code += 1,
                RowStatus::FileMismatch => summary.file_mismatch += 1,
                RowStatus::ProcessingFailed => summary.processing_failed += 1,
                RowStatus::Unprocessed => (),
            },
        }
    }
    log::info!("worker pool finished: {summary}");
    Ok(summary)
}

fn process_row(
    db_path: &Path,
    row: &JobRow,
    override_existing: bool,
    converter: &dyn RowConverter,
    var_logs: &Path,
) -> RowOutcome {
    let label = format!(
        "{}/{} [{} - {}]",
        row.cmip_table, row.variable_id, row.tstart, row.tend
    );

    if !override_existing && row.file_name.is_file() {
        log::info!("{label}: output file already exists, skipping");
        return RowOutcome::Skipped;
    }

    let status = decide_status(row, converter, &label);
    write_row_log(var_logs, row, status);

    let update = Queue::open(db_path).and_then(|queue| queue.update_status(row, status));
    match update {
        Ok(()) => RowOutcome::Recorded(status),
        Err(e) => {
            log::error!("{label}: finished with status {status} but the database update failed: {e}");
            RowOutcome::UpdateFailed
        }
    }
}

/// The per-row state machine: every path out of here is a terminal status.
fn decide_status(row: &JobRow, converter: &dyn RowConverter, label: &str) -> RowStatus {
    // Multiple inputs can only be combined through a calculation; a mapping
    // that lists several but no expression is a catalog bug.
    if row.vin.split_whitespace().count() > 1 && row.calculation.trim().is_empty() {
        log::error!("{label}: multiple input variables but no calculation expression");
        return RowStatus::ProcessingFailed;
    }

    match converter.convert(row) {
        Ok(ConversionOutcome::Wrote(path)) => {
            if path == row.file_name {
                log::info!("{label}: wrote {}", path.display());
                RowStatus::Processed
            } else {
                log::warn!(
                    "{label}: conversion produced {} but the queue planned {}; \
                     check the path and file templates",
                    path.display(),
                    row.file_name.display()
                );
                RowStatus::FileMismatch
            }
        }
        Ok(ConversionOutcome::NoData) => {
            log::warn!("{label}: no source data in the requested range");
            RowStatus::DataUnavailable
        }
        Ok(ConversionOutcome::UnknownCode(code)) => {
            log::warn!("{label}: conversion returned unrecognised code {code}");
            RowStatus::UnknownReturnCode
        }
        Err(e) => {
            log::error!("{label}: conversion failed: {e}");
            RowStatus::ProcessingFailed
        }
    }
}

/// Append this row's outcome to its own small log file. Best effort only;
/// the database status is the record that matters.
fn write_row_log(var_logs: &Path, row: &JobRow, status: RowStatus) {
    let log_name = format!(
        "{}_{}_{}.log",
        row.cmip_table,
        row.variable_id,
        utils::format_yyyymmdd(row.tstart)
    );
    let path = var_logs.join(log_name);
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| {
            writeln!(
                f,
                "{} {} -> {status} ({})",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                row.file_name.display(),
                row.infile
            )
        });
    if let Err(e) = result {
        log::debug!("could not write row log {}: {e}", path.display());
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReportStats {
    pub success_written: usize,
    pub failed_written: usize,
}

/// Derive the per-experiment success/failure CSV reports from the row
/// statuses. Rows already present in an existing report (keyed by table,
/// variable, tstart and tend) are never appended twice, so the reports
/// accumulate across runs without duplicates.
pub fn write_reports(config: &AppConfig) -> Result<ReportStats, ProcessingError> {
    let queue = Queue::open(&config.database_path())?;
    let exp = &config.cmor.exp;
    let outdir = config.success_lists_dir();
    utils::ensure_dir(&outdir).map_err(|e| ProcessingError::Report {
        path: outdir.clone(),
        reason: e.to_string(),
    })?;

    let success_rows: Vec<Vec<String>> = queue
        .fetch_with_status(exp, RowStatus::Processed)?
        .iter()
        .map(|row| {
            vec![
                row.cmip_table.clone(),
                row.variable_id.clone(),
                utils::format_yyyymmdd(row.tstart),
                utils::format_yyyymmdd(row.tend),
                row.file_name.to_string_lossy().to_string(),
            ]
        })
        .collect();

    let mut failed_rows: Vec<Vec<String>> = vec![];
    for status in [
        RowStatus::DataUnavailable,
        RowStatus::UnknownReturnCode,
        RowStatus::FileMismatch,
        RowStatus::ProcessingFailed,
    ] {
        for row in queue.fetch_with_status(exp, status)? {
            failed_rows.push(vec![
                row.cmip_table.clone(),
                row.variable_id.clone(),
                utils::format_yyyymmdd(row.tstart),
                utils::format_yyyymmdd(row.tend),
            ]);
        }
    }

    let success_path = outdir.join(format!("{exp}_success.csv"));
    let failed_path = outdir.join(format!("{exp}_failed.csv"));
    let stats = ReportStats {
        success_written: append_report(
            &success_path,
            &["table", "variable_id", "tstart", "tend", "output_path"],
            success_rows,
        )?,
        failed_written: append_report(
            &failed_path,
            &["table", "variable_id", "tstart", "tend"],
            failed_rows,
        )?,
    };
    log::info!(
        "reports: {} new success line(s) in {}, {} new failure line(s) in {}",
        stats.success_written,
        success_path.display(),
        stats.failed_written,
        failed_path.display()
    );
    Ok(stats)
}

/// Rows are keyed by their first four fields (table, variable_id, tstart,
/// tend); keys already present in the file are dropped.
fn append_report(
    path: &Path,
    header: &[&str],
    rows: Vec<Vec<String>>,
) -> Result<usize, ProcessingError> {
    let report_err = |reason: String| ProcessingError::Report {
        path: path.to_path_buf(),
        reason,
    };

    let mut seen: HashSet<String> = HashSet::new();
    let exists = path.is_file();
    if exists {
        let mut rdr = csv::Reader::from_path(path).map_err(|e| report_err(e.to_string()))?;
        for record in rdr.records() {
            let record = record.map_err(|e| report_err(e.to_string()))?;
            seen.insert(report_key(record.iter()));
        }
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| report_err(e.to_string()))?;
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if !exists {
        wtr.write_record(header)
            .map_err(|e| report_err(e.to_string()))?;
    }

    let mut written = 0;
    for row in rows {
        let key = report_key(row.iter().map(|s| s.as_str()));
        if seen.insert(key) {
            wtr.write_record(&row)
                .map_err(|e| report_err(e.to_string()))?;
            written += 1;
        }
    }
    wtr.flush().map_err(|e| report_err(e.to_string()))?;
    Ok(written)
}

fn report_key<'a, I: Iterator<Item = &'a str>>(fields: I) -> String {
    fields.take(4).collect::<Vec<_>>().join("\u{1f}")
}
