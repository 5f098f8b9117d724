//! Building per-table variable maps.
//!
//! For each CMOR table in the run, the builder works out which of the
//! table's declared variables are wanted (all of them, a user-supplied
//! subset, or whatever the data request asks for), resolves each one
//! through the catalog matcher, and writes the resolved mappings to one
//! JSON file per table under the `variable_maps` directory. Those files
//! are the input to queue population.
//!
//! A variable with no usable catalog entry is logged and left out; a table
//! where nothing matched gets no file at all. Neither aborts the build.
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::catalog::{MappingEntry, MasterCatalog};
use crate::config::AppConfig;
use crate::matcher::{self, AxisModifiers, Timeshot};
use crate::tables::{self, CmorTable, DataRequest, TableError};

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("Could not write variable map {} because: {reason}", .path.display())]
    CouldNotWrite { path: PathBuf, reason: String },
    #[error("Could not read variable map {} because: {reason}", .path.display())]
    CouldNotRead { path: PathBuf, reason: String },
    #[error("Could not read variable subset list {} because: {reason}", .path.display())]
    BadSubsetList { path: PathBuf, reason: String },
    #[error("force_dreq is enabled but the configuration's attrs section has no activity_id")]
    MissingActivity,
    #[error("force_dreq is enabled but no data request was loaded")]
    MissingDataRequest,
}

/// A catalog entry resolved for one table: the entry's fields plus where it
/// is going (`table`), how its time axis behaves (`timeshot`, `resample`),
/// which years the data request restricts it to, and where its source files
/// live relative to the experiment directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedMapping {
    pub cmip_var: String,
    pub input_vars: String,
    pub calculation: String,
    pub units: String,
    pub dimensions: String,
    pub frequency: String,
    pub realm: String,
    pub cell_methods: String,
    pub positive: String,
    pub table: String,
    pub timeshot: Timeshot,
    /// Resample target code ("M", "D", ...) when the catalog entry's
    /// frequency differs from the requested one; empty otherwise.
    #[serde(default)]
    pub resample: String,
    /// "all" or an inclusive "START:END" year range from the data request.
    #[serde(default = "default_years")]
    pub years: String,
    /// CF standard name from the table's variable declaration.
    #[serde(default)]
    pub cfname: String,
    /// Source-file glob relative to the experiment directory, realm
    /// directory included.
    pub file_structure: String,
    #[serde(default)]
    pub axis_modifiers: AxisModifiers,
}

fn default_years() -> String {
    "all".to_string()
}

impl ResolvedMapping {
    pub(crate) fn new(
        entry: &MappingEntry,
        table: &str,
        timeshot: Timeshot,
        resample: &str,
        realm: &str,
    ) -> Self {
        let file_structure = format!("{}/{}", matcher::realm_directory(realm), entry.filename);
        Self {
            cmip_var: entry.cmip_var.clone(),
            input_vars: entry.input_vars.clone(),
            calculation: entry.calculation.clone(),
            units: entry.units.clone(),
            dimensions: entry.dimensions.clone(),
            frequency: entry.frequency.clone(),
            realm: entry.realm.clone(),
            cell_methods: entry.cell_methods.clone(),
            positive: entry.positive.clone(),
            table: table.to_string(),
            timeshot,
            resample: resample.to_string(),
            years: default_years(),
            cfname: String::new(),
            file_structure,
            axis_modifiers: AxisModifiers::parse(&entry.notes),
        }
    }

    pub fn input_var_list(&self) -> Vec<&str> {
        self.input_vars.split_whitespace().collect()
    }
}

/// Load a user-supplied variable subset list: a YAML sequence of CMOR names.
pub fn load_subset_list(path: &Path) -> Result<Vec<String>, MappingError> {
    let data = std::fs::read(path).map_err(|e| MappingError::BadSubsetList {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    serde_yaml::from_slice(&data).map_err(|e| MappingError::BadSubsetList {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Which of a table's variables should be resolved, per the precedence
/// rules: a single requested variable beats the subset list, which beats
/// the data request, which beats "everything the table declares".
fn selection_set(
    table: &str,
    cmor_table: &CmorTable,
    config: &AppConfig,
    dreq: Option<&DataRequest>,
) -> Result<HashSet<String>, MappingError> {
    let declared: HashSet<&str> = cmor_table
        .variable_entry
        .keys()
        .map(|k| k.as_str())
        .collect();

    if config.cmor.variable_to_process != "all" {
        let mut set = HashSet::new();
        if declared.contains(config.cmor.variable_to_process.as_str()) {
            set.insert(config.cmor.variable_to_process.clone());
        }
        return Ok(set);
    }

    if let Some(subset_path) = &config.cmor.var_subset_list {
        let subset = load_subset_list(subset_path)?;
        return Ok(subset
            .into_iter()
            .filter(|v| declared.contains(v.as_str()))
            .collect());
    }

    if config.cmor.force_dreq {
        let dreq = dreq.ok_or(MappingError::MissingDataRequest)?;
        let activity = config.activity_id().ok_or(MappingError::MissingActivity)?;
        return Ok(dreq
            .variables_for_activity(table, activity)
            .into_iter()
            .filter(|v| declared.contains(v))
            .map(|v| v.to_string())
            .collect());
    }

    Ok(declared.into_iter().map(|v| v.to_string()).collect())
}

/// Resolve the selected variables of one table against the catalog, in the
/// table's declaration order.
pub fn resolve_table(
    table: &str,
    cmor_table: &CmorTable,
    catalog: &MasterCatalog,
    config: &AppConfig,
    dreq: Option<&DataRequest>,
) -> Result<Vec<ResolvedMapping>, MappingError> {
    let selection = selection_set(table, cmor_table, config, dreq)?;

    let mut resolved = vec![];
    for (name, declared) in cmor_table.variable_entry.iter() {
        if !selection.contains(name) {
            continue;
        }
        match matcher::find_match(
            table,
            name,
            &declared.modeling_realm,
            &declared.frequency,
            catalog,
        ) {
            Some(mut mapping) => {
                mapping.cfname = declared.standard_name.clone();
                if config.cmor.force_dreq {
                    if let Some(entry) = dreq.and_then(|d| d.get(table, name)) {
                        mapping.years = entry.years.clone();
                    }
                }
                resolved.push(mapping);
            }
            None => {
                log::info!(
                    "{table}/{name}: no match in the master catalog at {} ({}), skipping",
                    declared.frequency,
                    declared.modeling_realm
                );
            }
        }
    }
    Ok(resolved)
}

/// Serialize one table's resolved mappings to `<dir>/<table>.json`.
pub fn write_table_map(
    dir: &Path,
    table: &str,
    mappings: &[ResolvedMapping],
) -> Result<PathBuf, MappingError> {
    let path = dir.join(format!("{table}.json"));
    let could_not_write = |reason: String| MappingError::CouldNotWrite {
        path: path.clone(),
        reason,
    };

    crate::utils::ensure_dir(dir).map_err(|e| could_not_write(e.to_string()))?;
    let f = std::fs::File::create(&path).map_err(|e| could_not_write(e.to_string()))?;
    serde_json::to_writer_pretty(f, mappings).map_err(|e| could_not_write(e.to_string()))?;
    Ok(path)
}

/// Read one per-table map file back, as queue population does.
pub fn read_table_map(path: &Path) -> Result<Vec<ResolvedMapping>, MappingError> {
    let data = std::fs::read(path).map_err(|e| MappingError::CouldNotRead {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    serde_json::from_slice(&data).map_err(|e| MappingError::CouldNotRead {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Build the variable map for one table, writing `<table>.json` when at
/// least one variable resolved. Returns the written path, if any.
pub fn build_table_map(
    table: &str,
    catalog: &MasterCatalog,
    config: &AppConfig,
    dreq: Option<&DataRequest>,
) -> Result<Option<PathBuf>, MappingError> {
    let table_file = config
        .cmor
        .tables_path
        .join(tables::table_file_name(config.cmor.mode, table));
    let cmor_table = CmorTable::from_file(&table_file)?;

    let resolved = resolve_table(table, &cmor_table, catalog, config, dreq)?;
    if resolved.is_empty() {
        log::warn!("{table}: no matching variables found, writing no map file");
        return Ok(None);
    }

    log::info!("{table}: resolved {} variable(s)", resolved.len());
    let path = write_table_map(&config.variable_maps_dir(), table, &resolved)?;
    Ok(Some(path))
}

/// Build variable maps for every table in the run. Returns the number of
/// map files written.
pub fn build_all_maps(config: &AppConfig, catalog: &MasterCatalog) -> Result<usize, MappingError> {
    let dreq = if config.cmor.force_dreq {
        Some(DataRequest::from_csv(&config.dreq_path()).map_err(|e| {
            MappingError::CouldNotRead {
                path: config.dreq_path(),
                reason: e.to_string(),
            }
        })?)
    } else {
        None
    };

    let table_ids = if config.cmor.tables == "all" {
        tables::list_tables(&config.cmor.tables_path, config.cmor.mode)?
    } else {
        vec![config.cmor.tables.clone()]
    };

    log::info!("building maps for table(s): {}", table_ids.iter().join(", "));
    let mut written = 0;
    for table in &table_ids {
        if build_table_map(table, catalog, config, dreq.as_ref())?.is_some() {
            written += 1;
        }
    }
    log::info!(
        "wrote {written} variable map(s) for {} table(s) under {}",
        table_ids.len(),
        config.variable_maps_dir().display()
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::entry;
    use crate::config::tests::minimal_config;
    use crate::tables::tests::AMON_TABLE_JSON;

    fn amon() -> CmorTable {
        serde_json::from_str(AMON_TABLE_JSON).unwrap()
    }

    fn catalog_with_tas_and_pr() -> MasterCatalog {
        MasterCatalog::from_entries(vec![
            entry("tas", "atmos", "mon"),
            entry("pr", "atmos", "day"),
        ])
    }

    #[test]
    fn test_resolve_table_all_variables() {
        let config = minimal_config();
        let resolved =
            resolve_table("Amon", &amon(), &catalog_with_tas_and_pr(), &config, None).unwrap();

        // ta has no catalog entry and must be skipped; pr resolves via the
        // day -> mon fallback
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].cmip_var, "tas");
        assert_eq!(resolved[0].resample, "");
        assert_eq!(resolved[0].years, "all");
        assert_eq!(resolved[0].table, "Amon");
        assert_eq!(resolved[0].file_structure, "atm/tas_*.nc");
        assert_eq!(resolved[0].cfname, "air_temperature");
        assert_eq!(resolved[1].cmip_var, "pr");
        assert_eq!(resolved[1].resample, "M");
    }

    #[test]
    fn test_resolve_table_single_variable_override() {
        let mut config = minimal_config();
        config.cmor.variable_to_process = "pr".to_string();
        let resolved =
            resolve_table("Amon", &amon(), &catalog_with_tas_and_pr(), &config, None).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].cmip_var, "pr");
    }

    #[test]
    fn test_resolve_table_subset_list() {
        let dir = tempdir::TempDir::new("mapping-test").unwrap();
        let subset_path = dir.path().join("subset.yaml");
        std::fs::write(&subset_path, "- tas\n- zg\n").unwrap();

        let mut config = minimal_config();
        config.cmor.var_subset_list = Some(subset_path);
        let resolved =
            resolve_table("Amon", &amon(), &catalog_with_tas_and_pr(), &config, None).unwrap();
        // zg is not declared by the table, pr is excluded by the subset
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].cmip_var, "tas");
    }

    #[test]
    fn test_resolve_table_force_dreq_filters_by_activity_and_attaches_years() {
        let dir = tempdir::TempDir::new("mapping-test").unwrap();
        let dreq_path = dir.path().join("dreq.csv");
        std::fs::write(
            &dreq_path,
            "table,cmor_name,mips,years\nAmon,tas,CMIP,1985:1989\nAmon,pr,OMIP,all\n",
        )
        .unwrap();
        let dreq = DataRequest::from_csv(&dreq_path).unwrap();

        let mut config = minimal_config();
        config.cmor.force_dreq = true;
        let resolved = resolve_table(
            "Amon",
            &amon(),
            &catalog_with_tas_and_pr(),
            &config,
            Some(&dreq),
        )
        .unwrap();

        // pr is requested by OMIP only; the run's activity_id is CMIP
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].cmip_var, "tas");
        assert_eq!(resolved[0].years, "1985:1989");
    }

    #[test]
    fn test_force_dreq_without_activity_id_is_an_error() {
        let mut config = minimal_config();
        config.cmor.force_dreq = true;
        config.attrs.shift_remove("activity_id");
        let dreq = DataRequest::default();

        let err = resolve_table(
            "Amon",
            &amon(),
            &catalog_with_tas_and_pr(),
            &config,
            Some(&dreq),
        )
        .unwrap_err();
        assert!(matches!(err, MappingError::MissingActivity));
    }

    #[test]
    fn test_map_file_round_trip() {
        let dir = tempdir::TempDir::new("mapping-test").unwrap();
        let config = minimal_config();
        let resolved =
            resolve_table("Amon", &amon(), &catalog_with_tas_and_pr(), &config, None).unwrap();

        let path = write_table_map(dir.path(), "Amon", &resolved).unwrap();
        assert_eq!(path.file_name().unwrap(), "Amon.json");

        let read_back = read_table_map(&path).unwrap();
        assert_eq!(read_back, resolved);
    }
}
