//! CMOR table definitions and the data request.
//!
//! A CMOR table JSON file declares every variable the table can hold, with
//! its frequency and modeling realm; those declarations drive the catalog
//! matching. The data request is a CSV listing which variables each
//! activity actually needs, over which years.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;

use crate::config::Mode;

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("Could not open table file {} because: {reason}", .path.display())]
    CouldNotOpen { path: PathBuf, reason: String },
    #[error("Table file {} is not a valid CMOR table: {reason}", .path.display())]
    BadFormat { path: PathBuf, reason: String },
    #[error("Could not list tables under {} because: {reason}", .path.display())]
    CouldNotList { path: PathBuf, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DreqError {
    #[error("Could not open data request {} because: {reason}", .path.display())]
    CouldNotOpen { path: PathBuf, reason: String },
    #[error("Could not read row {row} of data request {}: {reason}", .path.display())]
    CouldNotRead {
        path: PathBuf,
        row: usize,
        reason: String,
    },
    #[error("Bad year range '{years}' in data request for {table}/{cmor_name}")]
    BadYears {
        table: String,
        cmor_name: String,
        years: String,
    },
}

/// One variable declared by a CMOR table.
#[derive(Debug, Clone, Deserialize)]
pub struct TableVariable {
    pub frequency: String,
    pub modeling_realm: String,
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub cell_methods: String,
    #[serde(default)]
    pub standard_name: String,
    #[serde(default)]
    pub long_name: String,
    #[serde(default)]
    pub dimensions: String,
    #[serde(default)]
    pub positive: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TableHeader {
    #[serde(default)]
    pub table_id: String,
    #[serde(default)]
    pub realm: String,
    #[serde(default)]
    pub mip_era: String,
}

/// A parsed CMOR table definition. `variable_entry` keeps the file's
/// declaration order.
#[derive(Debug, Clone, Deserialize)]
pub struct CmorTable {
    #[serde(rename = "Header", default)]
    pub header: TableHeader,
    pub variable_entry: IndexMap<String, TableVariable>,
}

impl CmorTable {
    pub fn from_file(path: &Path) -> Result<Self, TableError> {
        let data = std::fs::read(path).map_err(|e| TableError::CouldNotOpen {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_slice(&data).map_err(|e| TableError::BadFormat {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// The file a table id lives in, which depends on the run mode: official
/// CMIP6 tables are distributed as `CMIP6_<table>.json`.
pub fn table_file_name(mode: Mode, table: &str) -> String {
    match mode {
        Mode::Cmip6 => format!("CMIP6_{table}.json"),
        Mode::Custom => format!("{table}.json"),
    }
}

/// List the table ids available under the tables directory, sorted, minus
/// the axis/grid/CV helper files that are not variable tables.
pub fn list_tables(tables_path: &Path, mode: Mode) -> Result<Vec<String>, TableError> {
    const NOT_VARIABLE_TABLES: [&str; 5] =
        ["coordinate", "grids", "formula_terms", "CV", "input_example"];

    let entries = std::fs::read_dir(tables_path).map_err(|e| TableError::CouldNotList {
        path: tables_path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut tables = vec![];
    for entry in entries {
        let entry = entry.map_err(|e| TableError::CouldNotList {
            path: tables_path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(stem) = name.strip_suffix(".json") else {
            continue;
        };
        let table = match mode {
            Mode::Cmip6 => match stem.strip_prefix("CMIP6_") {
                Some(t) => t,
                None => continue,
            },
            Mode::Custom => stem,
        };
        if NOT_VARIABLE_TABLES.contains(&table) {
            continue;
        }
        tables.push(table.to_string());
    }
    tables.sort();
    Ok(tables)
}

/// One row of the data request: a variable one or more MIPs asked for.
#[derive(Debug, Clone)]
pub struct DreqEntry {
    pub table: String,
    pub cmor_name: String,
    /// Comma-separated MIP list, e.g. "CMIP,ScenarioMIP".
    pub mips: String,
    /// "all" or an inclusive "START:END" year range.
    pub years: String,
}

impl DreqEntry {
    /// Exact membership test of `activity_id` against the comma-split MIP
    /// list. "CMIP" must not match inside "FAFMIP".
    pub fn allows_activity(&self, activity_id: &str) -> bool {
        self.mips.split(',').any(|m| m.trim() == activity_id)
    }

    /// The inclusive year range this entry restricts the variable to, or
    /// `None` when it covers the whole experiment ("all").
    pub fn year_range(&self) -> Result<Option<(i32, i32)>, DreqError> {
        parse_year_range(&self.years).map_err(|_| DreqError::BadYears {
            table: self.table.clone(),
            cmor_name: self.cmor_name.clone(),
            years: self.years.clone(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("'{0}' is not a valid year range (expected 'all' or 'START:END')")]
pub struct YearRangeError(pub String);

/// Parse "all" or "START:END" (inclusive). Errors on anything else.
pub fn parse_year_range(years: &str) -> Result<Option<(i32, i32)>, YearRangeError> {
    let bad = || YearRangeError(years.to_string());
    let years = years.trim();
    if years.is_empty() || years == "all" {
        return Ok(None);
    }
    let (start, end) = years.split_once(':').ok_or_else(bad)?;
    let start: i32 = start.trim().parse().map_err(|_| bad())?;
    let end: i32 = end.trim().parse().map_err(|_| bad())?;
    if end < start {
        return Err(bad());
    }
    Ok(Some((start, end)))
}

/// The data request, indexed by (table, cmor_name).
#[derive(Debug, Clone, Default)]
pub struct DataRequest {
    entries: HashMap<(String, String), DreqEntry>,
}

impl DataRequest {
    pub fn from_csv(path: &Path) -> Result<Self, DreqError> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| DreqError::CouldNotOpen {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let mut entries = HashMap::new();
        for (irow, record) in rdr.deserialize::<DreqRecord>().enumerate() {
            let record = record.map_err(|e| DreqError::CouldNotRead {
                path: path.to_path_buf(),
                row: irow + 2,
                reason: e.to_string(),
            })?;
            let entry = DreqEntry {
                table: record.table,
                cmor_name: record.cmor_name,
                mips: record.mips,
                years: record.years,
            };
            // validate eagerly so a bad range fails the load, not the populate
            entry.year_range()?;
            entries.insert((entry.table.clone(), entry.cmor_name.clone()), entry);
        }
        Ok(Self { entries })
    }

    pub fn get(&self, table: &str, cmor_name: &str) -> Option<&DreqEntry> {
        self.entries
            .get(&(table.to_string(), cmor_name.to_string()))
    }

    /// The variable names the request lists for one table, restricted to
    /// entries whose MIP list contains `activity_id`.
    pub fn variables_for_activity(&self, table: &str, activity_id: &str) -> Vec<&str> {
        self.entries
            .values()
            .filter(|e| e.table == table && e.allows_activity(activity_id))
            .map(|e| e.cmor_name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct DreqRecord {
    table: String,
    cmor_name: String,
    mips: String,
    years: String,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    pub(crate) const AMON_TABLE_JSON: &str = r#"{
        "Header": {"table_id": "Table Amon", "realm": "atmos", "mip_era": "CMIP6"},
        "variable_entry": {
            "tas": {
                "frequency": "mon",
                "modeling_realm": "atmos",
                "units": "K",
                "cell_methods": "area: time: mean",
                "standard_name": "air_temperature",
                "long_name": "Near-Surface Air Temperature",
                "dimensions": "longitude latitude time height2m"
            },
            "pr": {
                "frequency": "mon",
                "modeling_realm": "atmos",
                "units": "kg m-2 s-1",
                "cell_methods": "area: time: mean",
                "standard_name": "precipitation_flux",
                "long_name": "Precipitation",
                "dimensions": "longitude latitude time"
            },
            "ta": {
                "frequency": "mon",
                "modeling_realm": "atmos",
                "units": "K",
                "dimensions": "longitude latitude plev19 time"
            }
        }
    }"#;

    const DREQ_CSV: &str = "\
table,cmor_name,mips,years
Amon,tas,\"CMIP,ScenarioMIP\",all
Amon,pr,CMIP,1985:1989
Omon,tos,FAFMIP,all
";

    #[test]
    fn test_parse_cmor_table() {
        let table: CmorTable = serde_json::from_str(AMON_TABLE_JSON).unwrap();
        assert_eq!(table.header.realm, "atmos");
        assert_eq!(table.variable_entry.len(), 3);
        // declaration order must be preserved
        let names: Vec<_> = table.variable_entry.keys().collect();
        assert_eq!(names, vec!["tas", "pr", "ta"]);
        assert_eq!(table.variable_entry["tas"].frequency, "mon");
    }

    #[rstest]
    #[case(Mode::Cmip6, "Amon", "CMIP6_Amon.json")]
    #[case(Mode::Custom, "Amon", "Amon.json")]
    fn test_table_file_name(#[case] mode: Mode, #[case] table: &str, #[case] expected: &str) {
        assert_eq!(table_file_name(mode, table), expected);
    }

    #[test]
    fn test_list_tables_skips_helper_files() {
        let dir = tempdir::TempDir::new("tables-test").unwrap();
        for name in [
            "CMIP6_Amon.json",
            "CMIP6_Omon.json",
            "CMIP6_coordinate.json",
            "CMIP6_CV.json",
            "README.md",
        ] {
            std::fs::write(dir.path().join(name), "{}").unwrap();
        }

        let tables = list_tables(dir.path(), Mode::Cmip6).unwrap();
        assert_eq!(tables, vec!["Amon", "Omon"]);
    }

    fn write_dreq(dir: &tempdir::TempDir) -> PathBuf {
        let path = dir.path().join("dreq.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(DREQ_CSV.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_data_request_activity_membership_is_exact() {
        let dir = tempdir::TempDir::new("dreq-test").unwrap();
        let dreq = DataRequest::from_csv(&write_dreq(&dir)).unwrap();

        let tas = dreq.get("Amon", "tas").unwrap();
        assert!(tas.allows_activity("CMIP"));
        assert!(tas.allows_activity("ScenarioMIP"));
        assert!(!tas.allows_activity("FAFMIP"));

        // "CMIP" is a substring of "FAFMIP"; membership must still be exact
        let tos = dreq.get("Omon", "tos").unwrap();
        assert!(!tos.allows_activity("CMIP"));
        assert!(tos.allows_activity("FAFMIP"));
    }

    #[test]
    fn test_data_request_year_ranges() {
        let dir = tempdir::TempDir::new("dreq-test").unwrap();
        let dreq = DataRequest::from_csv(&write_dreq(&dir)).unwrap();

        assert_eq!(dreq.get("Amon", "tas").unwrap().year_range().unwrap(), None);
        assert_eq!(
            dreq.get("Amon", "pr").unwrap().year_range().unwrap(),
            Some((1985, 1989))
        );
        assert!(dreq.get("Amon", "tos").is_none());
    }

    #[rstest]
    #[case("all", None)]
    #[case("", None)]
    #[case("1985:1989", Some((1985, 1989)))]
    #[case("2000:2000", Some((2000, 2000)))]
    fn test_parse_year_range(#[case] years: &str, #[case] expected: Option<(i32, i32)>) {
        assert_eq!(parse_year_range(years).unwrap(), expected);
    }

    #[test]
    fn test_parse_year_range_rejects_garbage() {
        assert!(parse_year_range("1985-1989").is_err());
        assert!(parse_year_range("1990:1985").is_err());
        assert!(parse_year_range("then:now").is_err());
    }
}
