//! Matching requested CMOR variables against the master catalog.
//!
//! A CMOR table requests a variable at a particular realm and frequency.
//! The catalog may carry that variable at the exact frequency, at a
//! different frequency (usable by resampling), or not at all. The rules:
//!
//! 1. An exact (cmip_var, realm, frequency) match always wins, and among
//!    several exact matches the first one in catalog order wins. Catalog
//!    order is part of the contract; changing it can silently change which
//!    raw model variable feeds an output file.
//! 2. With no exact match, the neighboring frequencies in
//!    [`FREQUENCY_ORDER`] are tried in order, starting just after the
//!    requested frequency and moving toward higher resolution. The first
//!    entry found is selected and annotated with the resample code of the
//!    frequency that was actually requested, telling the conversion step to
//!    resample down to it.
//! 3. No entry anywhere means the variable is skipped for that table. That
//!    is an expected outcome, not an error.
use serde::{Deserialize, Serialize};

use crate::catalog::MasterCatalog;
use crate::mapping::ResolvedMapping;

/// Output frequencies, coarsest first. Fallback scans this list from the
/// position after the requested frequency toward the high-resolution end.
pub const FREQUENCY_ORDER: [&str; 12] = [
    "10yr", "yr", "mon", "10day", "7day", "day", "12hr", "6hr", "3hr", "1hr", "30min", "10min",
];

/// Whether a value represents a time mean, an instantaneous snapshot, or a
/// climatological mean.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Timeshot {
    Mean,
    Point,
    Clim,
}

/// Strip the timeshot markers from a table's frequency string: a `Pt`
/// suffix means instantaneous values, and `monC` is a monthly climatology.
pub fn normalize_frequency(frequency: &str) -> (String, Timeshot) {
    if frequency == "monC" {
        ("mon".to_string(), Timeshot::Clim)
    } else if let Some(stripped) = frequency.strip_suffix("Pt") {
        (stripped.to_string(), Timeshot::Point)
    } else {
        (frequency.to_string(), Timeshot::Mean)
    }
}

/// The resample target code recorded on a fallback match, consumed by the
/// downstream resampler. These are the pandas-style offset aliases the
/// conversion step expects.
pub fn resample_code(frequency: &str) -> Option<&'static str> {
    let code = match frequency {
        "10yr" => "10A",
        "yr" => "A",
        "mon" => "M",
        "10day" => "10D",
        "7day" => "7D",
        "day" => "D",
        "12hr" => "12H",
        "6hr" => "6H",
        "3hr" => "3H",
        "1hr" => "H",
        "30min" => "30T",
        "10min" => "10T",
        _ => return None,
    };
    Some(code)
}

/// The data directory a realm's raw output lives under. Land diagnostics
/// come out of the atmosphere model, so `land` lives under the atmos tree.
pub fn realm_directory(realm: &str) -> &str {
    match realm {
        "atmos" | "land" | "landIce" | "aerosol" | "atmosChem" => "atm",
        "ocean" | "ocnBgchem" => "ocn",
        "seaIce" => "ice",
        other => other,
    }
}

/// Axis-handling tweaks a mapping can request, decided once here and
/// consumed as plain booleans downstream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisModifiers {
    pub drop_x: bool,
    pub drop_y: bool,
    pub drop_level: bool,
    pub switch_levels: bool,
    pub sum_levels: bool,
}

impl AxisModifiers {
    /// Parse whitespace-separated modifier tokens from a catalog notes
    /// field. Unknown tokens are ignored; the notes column is free-form.
    pub fn parse(tokens: &str) -> Self {
        let mut flags = Self::default();
        for token in tokens.split_whitespace() {
            match token {
                "dropX" => flags.drop_x = true,
                "dropY" => flags.drop_y = true,
                "dropLev" => flags.drop_level = true,
                "switchlevs" => flags.switch_levels = true,
                "sumLevs" => flags.sum_levels = true,
                _ => (),
            }
        }
        flags
    }
}

/// Find the catalog entry to use for one requested variable.
///
/// Returns `None` when nothing in the catalog can serve the request, at the
/// exact frequency or via resampling. Callers log that and move on.
pub fn find_match(
    table: &str,
    cmor_name: &str,
    realm: &str,
    frequency: &str,
    catalog: &MasterCatalog,
) -> Option<ResolvedMapping> {
    let (want_freq, timeshot) = normalize_frequency(frequency);

    // Exact match first: realm and frequency both equal, first in catalog
    // order wins.
    for entry in catalog.iter_active() {
        if entry.cmip_var == cmor_name && entry.realm == realm && entry.frequency == want_freq {
            return Some(ResolvedMapping::new(entry, table, timeshot, "", realm));
        }
    }

    // Fallback: walk the frequencies after the requested one toward higher
    // resolution; the first near-match (same realm, candidate frequency)
    // found is selected and must be resampled to the requested frequency.
    let position = FREQUENCY_ORDER.iter().position(|f| *f == want_freq)?;
    let code = resample_code(&want_freq)?;
    for candidate in &FREQUENCY_ORDER[position + 1..] {
        for entry in catalog.iter_active() {
            if entry.cmip_var == cmor_name && entry.realm == realm && entry.frequency == *candidate
            {
                log::info!(
                    "{table}/{cmor_name}: no {want_freq} entry in the catalog, \
                     resampling from {candidate}"
                );
                return Some(ResolvedMapping::new(entry, table, timeshot, code, realm));
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::entry;
    use rstest::rstest;

    fn catalog(entries: Vec<crate::catalog::MappingEntry>) -> MasterCatalog {
        MasterCatalog::from_entries(entries)
    }

    #[rstest]
    #[case("mon", "mon", Timeshot::Mean)]
    #[case("monPt", "mon", Timeshot::Point)]
    #[case("monC", "mon", Timeshot::Clim)]
    #[case("3hrPt", "3hr", Timeshot::Point)]
    #[case("day", "day", Timeshot::Mean)]
    fn test_normalize_frequency(
        #[case] raw: &str,
        #[case] freq: &str,
        #[case] timeshot: Timeshot,
    ) {
        let (f, t) = normalize_frequency(raw);
        assert_eq!(f, freq);
        assert_eq!(t, timeshot);
    }

    #[test]
    fn test_exact_match_beats_near_matches() {
        // The day and 6hr rows are nearer the top; the exact mon row must
        // still win regardless of order.
        let cat = catalog(vec![
            entry("tas", "atmos", "day"),
            entry("tas", "atmos", "6hr"),
            entry("tas", "atmos", "mon"),
        ]);
        let m = find_match("Amon", "tas", "atmos", "mon", &cat).unwrap();
        assert_eq!(m.frequency, "mon");
        assert_eq!(m.resample, "");
    }

    #[test]
    fn test_exact_match_first_in_catalog_order_wins() {
        let mut first = entry("tas", "atmos", "mon");
        first.input_vars = "fld_first".to_string();
        let mut second = entry("tas", "atmos", "mon");
        second.input_vars = "fld_second".to_string();

        let cat = catalog(vec![first, second]);
        let m = find_match("Amon", "tas", "atmos", "mon", &cat).unwrap();
        assert_eq!(m.input_vars, "fld_first");
    }

    #[test]
    fn test_fallback_to_higher_resolution_with_resample() {
        // Catalog only has tas at day; an Amon request must resample it.
        let cat = catalog(vec![entry("tas", "atmos", "day")]);
        let m = find_match("Amon", "tas", "atmos", "mon", &cat).unwrap();
        assert_eq!(m.frequency, "day");
        assert_eq!(m.resample, "M");
        assert_eq!(m.timeshot, Timeshot::Mean);
    }

    #[test]
    fn test_fallback_picks_nearest_frequency() {
        // Both 6hr and day entries could serve a mon request; day sits
        // earlier in the scan so it must win.
        let cat = catalog(vec![
            entry("tas", "atmos", "6hr"),
            entry("tas", "atmos", "day"),
        ]);
        let m = find_match("Amon", "tas", "atmos", "mon", &cat).unwrap();
        assert_eq!(m.frequency, "day");
    }

    #[test]
    fn test_fallback_never_looks_coarser_than_requested() {
        // A yr-only entry cannot serve a mon request; yr sits before mon in
        // the priority order.
        let cat = catalog(vec![entry("tas", "atmos", "yr")]);
        assert!(find_match("Amon", "tas", "atmos", "mon", &cat).is_none());
    }

    #[test]
    fn test_realm_must_match() {
        let cat = catalog(vec![entry("tos", "ocean", "mon")]);
        assert!(find_match("Amon", "tos", "atmos", "mon", &cat).is_none());
    }

    #[test]
    fn test_comment_rows_never_match() {
        let mut commented = entry("tas", "atmos", "mon");
        commented.cmip_var = "#tas".to_string();
        let cat = catalog(vec![commented, entry("tas", "atmos", "day")]);

        // The only mon entry is commented out, so the day entry must be
        // selected via fallback rather than the comment row exactly.
        let m = find_match("Amon", "tas", "atmos", "mon", &cat).unwrap();
        assert_eq!(m.frequency, "day");
        assert_eq!(m.resample, "M");
    }

    #[test]
    fn test_no_match_returns_none() {
        let cat = catalog(vec![entry("pr", "atmos", "mon")]);
        assert!(find_match("Amon", "tas", "atmos", "mon", &cat).is_none());
    }

    #[test]
    fn test_point_request_matches_stripped_frequency() {
        let cat = catalog(vec![entry("ta", "atmos", "6hr")]);
        let m = find_match("6hrPlevPt", "ta", "atmos", "6hrPt", &cat).unwrap();
        assert_eq!(m.frequency, "6hr");
        assert_eq!(m.timeshot, Timeshot::Point);
        assert_eq!(m.resample, "");
    }

    #[rstest]
    #[case("atmos", "atm")]
    #[case("land", "atm")]
    #[case("ocean", "ocn")]
    #[case("ocnBgchem", "ocn")]
    #[case("seaIce", "ice")]
    fn test_realm_directory(#[case] realm: &str, #[case] dir: &str) {
        assert_eq!(realm_directory(realm), dir);
    }

    #[test]
    fn test_axis_modifiers_parse() {
        let flags = AxisModifiers::parse("dropLev sumLevs");
        assert!(flags.drop_level);
        assert!(flags.sum_levels);
        assert!(!flags.drop_x);

        assert_eq!(AxisModifiers::parse(""), AxisModifiers::default());
        // free-form notes text must not trip the parser
        assert_eq!(
            AxisModifiers::parse("derived from CMIP5"),
            AxisModifiers::default()
        );
    }
}
