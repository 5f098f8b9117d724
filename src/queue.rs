//! The persistent job queue.
//!
//! One row of the `file_master` table describes exactly one output file to
//! produce: which variable, from which source files, over which time chunk,
//! written where. The SQLite database is the sole source of truth for row
//! state across the worker pool; every worker opens its own connection and
//! SQLite's file locking (with a generous busy timeout) serializes the
//! writes.
//!
//! Population is idempotent: rows are keyed by (local_exp_id, variable_id,
//! cmip_table, tstart, version) and inserted with `INSERT OR IGNORE`, so
//! re-populating with the same inputs changes nothing and an existing row
//! always wins. Rows are never deleted except by a full rebuild.
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;
use indexmap::IndexMap;
use rusqlite::Connection;

use crate::chunking::{self, ChunkError};
use crate::config::{AppConfig, ConfigError};
use crate::error::TemplateError;
use crate::mapping::{self, MappingError, ResolvedMapping};
use crate::matcher::Timeshot;
use crate::tables::parse_year_range;
use crate::utils;

/// How long a connection waits on a locked database before giving up.
/// Generous because a whole worker pool shares the file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(200);

const CREATE_TABLE_SQL: &str = "
CREATE TABLE IF NOT EXISTS file_master (
    infile TEXT,
    outpath TEXT,
    file_name TEXT,
    vin TEXT,
    variable_id TEXT,
    cmip_table TEXT,
    frequency TEXT,
    timeshot TEXT,
    tstart TEXT,
    tend TEXT,
    status TEXT,
    file_size REAL,
    local_exp_id TEXT,
    calculation TEXT,
    in_units TEXT,
    positive TEXT,
    cfname TEXT,
    reference_date TEXT,
    version TEXT,
    PRIMARY KEY (local_exp_id, variable_id, cmip_table, tstart, version)
)";

const ROW_COLUMNS: &str = "infile, outpath, file_name, vin, variable_id, cmip_table, \
     frequency, timeshot, tstart, tend, status, file_size, local_exp_id, \
     calculation, in_units, positive, cfname, reference_date, version";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("Row for {variable_id}/{cmip_table} has an invalid '{column}' value: '{value}'")]
    BadColumn {
        variable_id: String,
        cmip_table: String,
        column: &'static str,
        value: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PopulateError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("Could not list variable maps under {} because: {reason}", .path.display())]
    CouldNotListMaps { path: PathBuf, reason: String },
}

/// Lifecycle state of one queue row. Every state other than `Unprocessed`
/// is terminal within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum RowStatus {
    Unprocessed,
    Processed,
    DataUnavailable,
    UnknownReturnCode,
    FileMismatch,
    ProcessingFailed,
}

/// One unit of work: one output file to produce.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    /// Glob locating the raw source files for this variable.
    pub infile: String,
    /// Directory the output file is written to.
    pub outpath: PathBuf,
    /// Full planned path of the output file.
    pub file_name: PathBuf,
    /// Space-separated raw input variable names.
    pub vin: String,
    pub variable_id: String,
    pub cmip_table: String,
    pub frequency: String,
    pub timeshot: Timeshot,
    pub tstart: NaiveDate,
    pub tend: NaiveDate,
    pub status: RowStatus,
    /// Projected output size, MB.
    pub file_size: f64,
    pub local_exp_id: String,
    pub calculation: String,
    pub in_units: String,
    pub positive: String,
    pub cfname: String,
    pub reference_date: String,
    pub version: String,
}

/// A handle on the queue database. Cheap to open; worker tasks open one
/// each rather than sharing.
pub struct Queue {
    conn: Connection,
}

impl Queue {
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(CREATE_TABLE_SQL)?;
        Ok(Self { conn })
    }

    /// Drop and recreate the work table. The only way rows are ever deleted.
    pub fn rebuild(&self) -> Result<(), QueueError> {
        self.conn
            .execute_batch("DROP TABLE IF EXISTS file_master")?;
        self.conn.execute_batch(CREATE_TABLE_SQL)?;
        Ok(())
    }

    /// Idempotent insert: an existing row with the same primary key wins
    /// and `false` is returned.
    pub fn insert_row(&self, row: &JobRow) -> Result<bool, QueueError> {
        let sql = format!(
            "INSERT OR IGNORE INTO file_master ({ROW_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
        );
        let changed = self.conn.execute(
            &sql,
            rusqlite::params![
                row.infile,
                row.outpath.to_string_lossy().into_owned(),
                row.file_name.to_string_lossy().into_owned(),
                row.vin,
                row.variable_id,
                row.cmip_table,
                row.frequency,
                row.timeshot.to_string(),
                row.tstart,
                row.tend,
                row.status.to_string(),
                row.file_size,
                row.local_exp_id,
                row.calculation,
                row.in_units,
                row.positive,
                row.cfname,
                row.reference_date,
                row.version,
            ],
        )?;
        Ok(changed == 1)
    }

    /// All rows still waiting to be processed for one experiment, in
    /// insertion order.
    pub fn fetch_unprocessed(&self, local_exp_id: &str) -> Result<Vec<JobRow>, QueueError> {
        self.fetch_with_status(local_exp_id, RowStatus::Unprocessed)
    }

    pub fn fetch_with_status(
        &self,
        local_exp_id: &str,
        status: RowStatus,
    ) -> Result<Vec<JobRow>, QueueError> {
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM file_master \
             WHERE status = ?1 AND local_exp_id = ?2 ORDER BY rowid"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params![status.to_string(), local_exp_id],
            row_from_sql,
        )?;

        let mut out = vec![];
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Record the outcome of processing one row.
    pub fn update_status(&self, row: &JobRow, status: RowStatus) -> Result<(), QueueError> {
        self.conn.execute(
            "UPDATE file_master SET status = ?1 \
             WHERE local_exp_id = ?2 AND variable_id = ?3 AND cmip_table = ?4 \
               AND tstart = ?5 AND version = ?6",
            rusqlite::params![
                status.to_string(),
                row.local_exp_id,
                row.variable_id,
                row.cmip_table,
                row.tstart,
                row.version,
            ],
        )?;
        Ok(())
    }

    pub fn count_rows(&self, local_exp_id: &str) -> Result<usize, QueueError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM file_master WHERE local_exp_id = ?1",
            [local_exp_id],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// Per-status row counts, for the end-of-run summary.
    pub fn status_counts(&self, local_exp_id: &str) -> Result<Vec<(String, usize)>, QueueError> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM file_master \
             WHERE local_exp_id = ?1 GROUP BY status ORDER BY status",
        )?;
        let rows = stmt.query_map([local_exp_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as usize))
        })?;

        let mut out = vec![];
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Deserialize one `file_master` row; returns the inner result so that
/// column-parse failures carry their own error rather than an sqlite one.
fn row_from_sql(r: &rusqlite::Row<'_>) -> rusqlite::Result<Result<JobRow, QueueError>> {
    let variable_id: String = r.get(4)?;
    let cmip_table: String = r.get(5)?;
    let timeshot_raw: String = r.get(7)?;
    let status_raw: String = r.get(10)?;

    let timeshot = match Timeshot::from_str(&timeshot_raw) {
        Ok(t) => t,
        Err(_) => {
            return Ok(Err(QueueError::BadColumn {
                variable_id,
                cmip_table,
                column: "timeshot",
                value: timeshot_raw,
            }))
        }
    };
    let status = match RowStatus::from_str(&status_raw) {
        Ok(s) => s,
        Err(_) => {
            return Ok(Err(QueueError::BadColumn {
                variable_id,
                cmip_table,
                column: "status",
                value: status_raw,
            }))
        }
    };

    Ok(Ok(JobRow {
        infile: r.get(0)?,
        outpath: PathBuf::from(r.get::<_, String>(1)?),
        file_name: PathBuf::from(r.get::<_, String>(2)?),
        vin: r.get(3)?,
        variable_id,
        cmip_table,
        frequency: r.get(6)?,
        timeshot,
        tstart: r.get(8)?,
        tend: r.get(9)?,
        status,
        file_size: r.get(11)?,
        local_exp_id: r.get(12)?,
        calculation: r.get(13)?,
        in_units: r.get(14)?,
        positive: r.get(15)?,
        cfname: r.get(16)?,
        reference_date: r.get(17)?,
        version: r.get(18)?,
    }))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PopulateStats {
    pub inserted: usize,
    pub duplicates: usize,
    pub skipped_variables: usize,
}

/// Fill the queue from every per-table variable map on disk.
pub fn populate(queue: &Queue, config: &AppConfig) -> Result<PopulateStats, PopulateError> {
    let maps_dir = config.variable_maps_dir();
    let mut map_files: Vec<PathBuf> = std::fs::read_dir(&maps_dir)
        .map_err(|e| PopulateError::CouldNotListMaps {
            path: maps_dir.clone(),
            reason: e.to_string(),
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    map_files.sort();

    let version = config
        .cmor
        .version
        .clone()
        .unwrap_or_else(|| chrono::Local::now().format("%Y%m%d").to_string());

    let mut stats = PopulateStats::default();
    for map_file in &map_files {
        let mappings = mapping::read_table_map(map_file)?;
        for m in &mappings {
            populate_variable(queue, config, m, &version, &mut stats)?;
        }
    }

    log::info!(
        "queue populate: {} row(s) inserted, {} duplicate(s) ignored, {} variable(s) skipped",
        stats.inserted,
        stats.duplicates,
        stats.skipped_variables
    );
    Ok(stats)
}

fn populate_variable(
    queue: &Queue,
    config: &AppConfig,
    mapping: &ResolvedMapping,
    version: &str,
    stats: &mut PopulateStats,
) -> Result<(), PopulateError> {
    let exp_start = config.start_date()?;
    let exp_end = config.end_date()?;

    let (start, end) = match clamp_to_years(exp_start, exp_end, mapping, config) {
        Some(range) => range,
        None => {
            log::warn!(
                "{}/{}: requested years ({}) do not overlap the experiment range \
                 ({} to {}), skipping",
                mapping.table,
                mapping.cmip_var,
                mapping.years,
                config.cmor.start_date,
                config.cmor.end_date
            );
            stats.skipped_variables += 1;
            return Ok(());
        }
    };

    warn_if_no_source_files(config, mapping);

    let grid_bytes = chunking::estimate_grid_size_bytes(
        &mapping.dimensions,
        &mapping.realm,
        &config.cmor.access_version,
    );
    let plan = chunking::plan_chunks(
        grid_bytes,
        &mapping.frequency,
        start,
        end,
        config.cmor.max_size,
    )?;
    log::debug!(
        "{}/{}: chunking by {} ({:.1} MB per file)",
        mapping.table,
        mapping.cmip_var,
        plan.interval,
        plan.size_mb
    );

    let reference_date = utils::format_yyyymmdd(config.reference_date()?);
    for (tstart, tend) in plan.iter_chunks(start, end) {
        let row = render_row(
            config,
            mapping,
            tstart,
            tend,
            plan.size_mb,
            &reference_date,
            version,
        )?;
        if queue.insert_row(&row)? {
            stats.inserted += 1;
        } else {
            log::debug!(
                "{}/{} chunk starting {tstart} already queued, leaving the existing row",
                mapping.table,
                mapping.cmip_var
            );
            stats.duplicates += 1;
        }
    }
    Ok(())
}

/// Pre-flight check only: rows are queued regardless, since the data may
/// land on disk before the worker pool runs, but a pattern matching nothing
/// at populate time is worth a heads-up.
fn warn_if_no_source_files(config: &AppConfig, mapping: &ResolvedMapping) {
    let pattern = format!(
        "{}/{}/{}",
        config.cmor.maindir.to_string_lossy(),
        config.cmor.exp,
        mapping.file_structure
    );
    match glob::glob(&pattern) {
        Ok(mut paths) => {
            if paths.next().is_none() {
                log::warn!(
                    "{}/{}: no source files currently match {pattern}",
                    mapping.table,
                    mapping.cmip_var
                );
            }
        }
        Err(e) => log::warn!(
            "{}/{}: source pattern {pattern} is not a valid glob: {e}",
            mapping.table,
            mapping.cmip_var
        ),
    }
}

/// Clamp the experiment range to the mapping's data-request years. `None`
/// means the two ranges are disjoint and the variable cannot be produced.
fn clamp_to_years(
    exp_start: NaiveDate,
    exp_end: NaiveDate,
    mapping: &ResolvedMapping,
    config: &AppConfig,
) -> Option<(NaiveDate, NaiveDate)> {
    if !config.cmor.dreq_years {
        return Some((exp_start, exp_end));
    }
    let Ok(Some((y0, y1))) = parse_year_range(&mapping.years) else {
        return Some((exp_start, exp_end));
    };

    // year range START:END is inclusive, so the clamp window runs from
    // Jan 1 of START to Jan 1 of END+1
    let years_start = NaiveDate::from_ymd_opt(y0, 1, 1)?;
    let years_end = NaiveDate::from_ymd_opt(y1 + 1, 1, 1)?;

    let start = exp_start.max(years_start);
    let end = exp_end.min(years_end);
    if start >= end {
        None
    } else {
        Some((start, end))
    }
}

fn render_row(
    config: &AppConfig,
    mapping: &ResolvedMapping,
    tstart: NaiveDate,
    tend: NaiveDate,
    file_size: f64,
    reference_date: &str,
    version: &str,
) -> Result<JobRow, PopulateError> {
    let date_range = if mapping.frequency == "fx" {
        String::new()
    } else {
        format!(
            "{}-{}",
            utils::format_yyyymmdd(tstart),
            utils::format_yyyymmdd(tend)
        )
    };

    let mut fields = IndexMap::new();
    fields.insert(
        "maindir".to_string(),
        config.cmor.maindir.to_string_lossy().to_string(),
    );
    fields.insert("local_exp_id".to_string(), config.cmor.exp.clone());
    fields.insert("variable_id".to_string(), mapping.cmip_var.clone());
    fields.insert("cmip_table".to_string(), mapping.table.clone());
    fields.insert("frequency".to_string(), mapping.frequency.clone());
    fields.insert("timeshot".to_string(), mapping.timeshot.to_string());
    fields.insert("realm".to_string(), mapping.realm.clone());
    fields.insert("project".to_string(), config.cmor.project.clone());
    fields.insert(
        "access_version".to_string(),
        config.cmor.access_version.clone(),
    );
    fields.insert("version".to_string(), version.to_string());
    fields.insert("date_range".to_string(), date_range);

    let outpath = PathBuf::from(utils::render_template(&config.cmor.path_template, &fields)?);
    let file_name = outpath.join(utils::render_template(&config.cmor.file_template, &fields)?);

    let infile = format!(
        "{}/{}/{}",
        config.cmor.maindir.to_string_lossy(),
        config.cmor.exp,
        mapping.file_structure
    );

    Ok(JobRow {
        infile,
        outpath,
        file_name,
        vin: mapping.input_vars.clone(),
        variable_id: mapping.cmip_var.clone(),
        cmip_table: mapping.table.clone(),
        frequency: mapping.frequency.clone(),
        timeshot: mapping.timeshot,
        tstart,
        tend,
        status: RowStatus::Unprocessed,
        file_size,
        local_exp_id: config.cmor.exp.clone(),
        calculation: mapping.calculation.clone(),
        in_units: mapping.units.clone(),
        positive: mapping.positive.clone(),
        cfname: mapping.cfname.clone(),
        reference_date: reference_date.to_string(),
        version: version.to_string(),
    })
}
