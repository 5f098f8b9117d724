//! The master variable-mapping catalog.
//!
//! The catalog is a CSV file with one row per (CMIP variable, realm,
//! frequency) combination, mapping the CMOR output name to the raw model
//! variable(s) it is built from, plus the calculation expression, units and
//! file pattern needed to produce it. Rows whose `cmip_var` column begins
//! with `#` are comments; they are kept in the in-memory catalog (so line
//! numbers and ordering survive) but are never eligible to match.
//!
//! File order matters: when two rows tie for the same request, the first
//! one in the file wins, so the loader never reorders or de-duplicates.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// The column names expected in the catalog header, in their usual order.
const EXPECTED_COLUMNS: [&str; 12] = [
    "cmip_var",
    "input_vars",
    "calculation",
    "units",
    "dimensions",
    "frequency",
    "realm",
    "cell_methods",
    "positive",
    "access_ver",
    "notes",
    "filename",
];

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Could not open master catalog {} because: {reason}", .path.display())]
    CouldNotOpen { path: PathBuf, reason: String },
    #[error("Could not read row {row} of master catalog {}: {reason}", .path.display())]
    CouldNotRead {
        path: PathBuf,
        row: usize,
        reason: String,
    },
    #[error("Master catalog {} is missing required column '{column}'", .path.display())]
    MissingColumn { path: PathBuf, column: String },
}

/// One row of the master catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    /// CMIP/CMOR output variable name. A leading '#' marks a comment row.
    pub cmip_var: String,
    /// Space-separated list of raw model variable names.
    pub input_vars: String,
    /// Calculation expression handed to the external evaluator; empty when
    /// the input variable is written through unchanged.
    pub calculation: String,
    pub units: String,
    pub dimensions: String,
    pub frequency: String,
    pub realm: String,
    pub cell_methods: String,
    /// "up", "down", or empty.
    pub positive: String,
    pub access_ver: String,
    pub notes: String,
    /// Glob pattern locating the raw source files within the realm directory.
    pub filename: String,
}

impl MappingEntry {
    pub fn is_comment(&self) -> bool {
        self.cmip_var.starts_with('#')
    }

    /// The individual raw input variable names.
    pub fn input_var_list(&self) -> Vec<&str> {
        self.input_vars.split_whitespace().collect()
    }
}

/// The master catalog, in file order.
#[derive(Debug, Clone)]
pub struct MasterCatalog {
    entries: Vec<MappingEntry>,
}

impl MasterCatalog {
    pub fn from_csv(path: &Path) -> Result<Self, CatalogError> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| CatalogError::CouldNotOpen {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let headers = rdr
            .headers()
            .map_err(|e| CatalogError::CouldNotRead {
                path: path.to_path_buf(),
                row: 1,
                reason: e.to_string(),
            })?
            .clone();

        let column_index = |name: &str| -> Result<usize, CatalogError> {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| CatalogError::MissingColumn {
                    path: path.to_path_buf(),
                    column: name.to_string(),
                })
        };

        // All columns must be present up front; a catalog missing one is a
        // configuration error, not something to paper over row by row.
        let mut indices = [0usize; EXPECTED_COLUMNS.len()];
        for (i, name) in EXPECTED_COLUMNS.iter().enumerate() {
            indices[i] = column_index(name)?;
        }

        let mut entries = vec![];
        for (irow, record) in rdr.records().enumerate() {
            let record = record.map_err(|e| CatalogError::CouldNotRead {
                path: path.to_path_buf(),
                row: irow + 2,
                reason: e.to_string(),
            })?;

            let field = |i: usize| record.get(indices[i]).unwrap_or("").to_string();
            entries.push(MappingEntry {
                cmip_var: field(0),
                input_vars: field(1),
                calculation: field(2),
                units: field(3),
                dimensions: field(4),
                frequency: field(5),
                realm: field(6),
                cell_methods: field(7),
                positive: field(8),
                access_ver: field(9),
                notes: field(10),
                filename: field(11),
            });
        }

        Ok(Self { entries })
    }

    pub fn from_entries(entries: Vec<MappingEntry>) -> Self {
        Self { entries }
    }

    /// Every row, comments included, in file order.
    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    /// Rows eligible to match, in file order.
    pub fn iter_active(&self) -> impl Iterator<Item = &MappingEntry> {
        self.entries.iter().filter(|e| !e.is_comment())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// A catalog entry with sensible blanks, for building test catalogs.
    pub(crate) fn entry(cmip_var: &str, realm: &str, frequency: &str) -> MappingEntry {
        MappingEntry {
            cmip_var: cmip_var.to_string(),
            input_vars: format!("fld_{cmip_var}"),
            calculation: String::new(),
            units: "K".to_string(),
            dimensions: "longitude latitude time".to_string(),
            frequency: frequency.to_string(),
            realm: realm.to_string(),
            cell_methods: "area: time: mean".to_string(),
            positive: String::new(),
            access_ver: "CM2".to_string(),
            notes: String::new(),
            filename: format!("{cmip_var}_*.nc"),
        }
    }

    const CATALOG_CSV: &str = "\
cmip_var,input_vars,calculation,units,dimensions,frequency,realm,cell_methods,positive,access_ver,notes,filename
tas,fld_s03i236,,K,longitude latitude time,mon,atmos,area: time: mean,,CM2,,a.pm*.nc
#tas,old entry kept for reference,,K,longitude latitude time,mon,atmos,,,CM2,,a.pm*.nc
pr,fld_s05i214 fld_s05i215,\"var[0]+var[1]\",kg m-2 s-1,longitude latitude time,day,atmos,area: time: mean,,CM2,,a.pd*.nc
";

    #[test]
    fn test_load_catalog_preserves_order_and_comments() {
        let dir = tempdir::TempDir::new("catalog-test").unwrap();
        let path = dir.path().join("master_map.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(CATALOG_CSV.as_bytes()).unwrap();
        drop(f);

        let catalog = MasterCatalog::from_csv(&path).unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.entries()[0].cmip_var, "tas");
        assert!(catalog.entries()[1].is_comment());
        assert_eq!(catalog.entries()[2].cmip_var, "pr");
        // quoted calculation expression must survive the comma inside it
        assert_eq!(catalog.entries()[2].calculation, "var[0]+var[1]");

        let active: Vec<_> = catalog.iter_active().map(|e| e.cmip_var.as_str()).collect();
        assert_eq!(active, vec!["tas", "pr"]);
    }

    #[test]
    fn test_missing_column_is_fatal() {
        let dir = tempdir::TempDir::new("catalog-test").unwrap();
        let path = dir.path().join("bad_map.csv");
        std::fs::write(&path, "cmip_var,input_vars\ntas,fld_s03i236\n").unwrap();

        let err = MasterCatalog::from_csv(&path).unwrap_err();
        assert!(matches!(err, CatalogError::MissingColumn { column, .. } if column == "calculation"));
    }

    #[test]
    fn test_input_var_list() {
        let mut e = entry("pr", "atmos", "day");
        e.input_vars = "fld_s05i214 fld_s05i215".to_string();
        assert_eq!(e.input_var_list(), vec!["fld_s05i214", "fld_s05i215"]);
    }
}
