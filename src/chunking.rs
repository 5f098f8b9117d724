//! Splitting an experiment's date range into output-file chunks.
//!
//! One output file should weigh roughly the configured `max_size`. From the
//! variable's per-timestep grid size and output frequency we project the
//! size of the whole experiment in one file; if that is close enough, one
//! file it is. Otherwise a fixed ladder of candidate intervals (100 years
//! down to 1 day) is walked and the first interval whose projected size
//! lands inside the acceptance band is chosen. Every chunk then becomes
//! exactly one row in the job queue.
use chrono::{Days, Months, NaiveDate};

/// Accept an interval when its projected size is within this band of the
/// requested maximum.
const SIZE_BAND: (f64, f64) = (0.3, 1.1);

const MB: f64 = 1024.0 * 1024.0;

/// Candidate chunk intervals, largest first.
const CANDIDATE_INTERVALS: [Interval; 6] = [
    Interval::Years(100),
    Interval::Years(10),
    Interval::Years(1),
    Interval::Months(1),
    Interval::Days(7),
    Interval::Days(1),
];

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("'{0}' is not a frequency the chunk planner knows the timestep rate for")]
    UnknownFrequency(String),
}

/// Model timesteps per day for each output frequency.
pub fn steps_per_day(frequency: &str) -> Option<f64> {
    let steps = match frequency {
        "10min" => 1440.0,
        "30min" => 48.0,
        "1hr" => 24.0,
        "3hr" => 8.0,
        "6hr" => 4.0,
        "12hr" => 2.0,
        "day" => 1.0,
        "7day" => 1.0 / 7.0,
        "10day" => 0.1,
        "mon" => 1.0 / 30.0,
        "yr" => 1.0 / 365.0,
        "10yr" => 1.0 / 3650.0,
        "fx" => 0.0,
        _ => return None,
    };
    Some(steps)
}

/// A chunk interval: a whole number of years, months or days, or the whole
/// experiment span in one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    Years(u32),
    Months(u32),
    Days(u32),
    WholeSpan,
}

impl Interval {
    /// Nominal length in days, for size projection only. Calendar stepping
    /// in [`ChunkPlan::iter_chunks`] uses real month/year arithmetic.
    fn approx_days(&self) -> Option<f64> {
        match self {
            Interval::Years(n) => Some(365.0 * f64::from(*n)),
            Interval::Months(n) => Some(30.0 * f64::from(*n)),
            Interval::Days(n) => Some(f64::from(*n)),
            Interval::WholeSpan => None,
        }
    }

    fn advance(&self, date: NaiveDate) -> Option<NaiveDate> {
        match self {
            Interval::Years(n) => date.checked_add_months(Months::new(12 * n)),
            Interval::Months(n) => date.checked_add_months(Months::new(*n)),
            Interval::Days(n) => date.checked_add_days(Days::new(u64::from(*n))),
            Interval::WholeSpan => None,
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interval::Years(n) => write!(f, "{n} year(s)"),
            Interval::Months(n) => write!(f, "{n} month(s)"),
            Interval::Days(n) => write!(f, "{n} day(s)"),
            Interval::WholeSpan => write!(f, "whole experiment"),
        }
    }
}

/// The planner's decision for one variable: the chunk interval and the
/// projected size of each chunk file.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPlan {
    pub interval: Interval,
    /// Projected size of one chunk file, MB.
    pub size_mb: f64,
}

impl ChunkPlan {
    /// The `(tstart, tend)` pairs covering `[start, end]`: half-open,
    /// back-to-back, with the final `tend` clamped to `end`.
    pub fn iter_chunks(&self, start: NaiveDate, end: NaiveDate) -> Vec<(NaiveDate, NaiveDate)> {
        if matches!(self.interval, Interval::WholeSpan) {
            return vec![(start, end)];
        }

        let mut chunks = vec![];
        let mut tstart = start;
        while tstart < end {
            let tend = match self.interval.advance(tstart) {
                Some(next) if next < end => next,
                _ => end,
            };
            chunks.push((tstart, tend));
            tstart = tend;
        }
        chunks
    }
}

/// Choose the chunk interval for one variable.
///
/// `grid_size_bytes` is the size of one timestep of the variable on disk;
/// sizes are projected in binary MB. When no candidate interval lands in
/// the acceptance band the planner degrades to 1-day chunks and says so,
/// since every file it produces will then be off-budget.
pub fn plan_chunks(
    grid_size_bytes: f64,
    frequency: &str,
    start: NaiveDate,
    end: NaiveDate,
    max_size_mb: f64,
) -> Result<ChunkPlan, ChunkError> {
    let steps = steps_per_day(frequency)
        .ok_or_else(|| ChunkError::UnknownFrequency(frequency.to_string()))?;
    let size_tstep_mb = grid_size_bytes / MB;

    // Time-invariant fields get one file regardless of budget.
    if steps == 0.0 {
        return Ok(ChunkPlan {
            interval: Interval::WholeSpan,
            size_mb: size_tstep_mb,
        });
    }

    let per_day_mb = size_tstep_mb * steps;
    let span_days = (end - start).num_days() as f64;
    let whole_span_mb = per_day_mb * span_days;

    if whole_span_mb <= SIZE_BAND.1 * max_size_mb {
        return Ok(ChunkPlan {
            interval: Interval::WholeSpan,
            size_mb: whole_span_mb,
        });
    }

    for interval in CANDIDATE_INTERVALS {
        let Some(days) = interval.approx_days() else {
            continue;
        };
        let size_mb = per_day_mb * days;
        if size_mb >= SIZE_BAND.0 * max_size_mb && size_mb <= SIZE_BAND.1 * max_size_mb {
            return Ok(ChunkPlan { interval, size_mb });
        }
    }

    // Even single days overshoot (or everything undershoots the band).
    // Take the smallest interval and warn; the files will be off-budget.
    let size_mb = per_day_mb;
    log::warn!(
        "no chunk interval fits the size band for max_size={max_size_mb} MB \
         (1-day chunks project to {size_mb:.1} MB); falling back to 1-day chunks"
    );
    Ok(ChunkPlan {
        interval: Interval::Days(1),
        size_mb,
    })
}

/// Estimate the on-disk size of one timestep of a variable from its
/// dimension list, assuming 4-byte floats. Horizontal grid sizes are per
/// model component; a level-type dimension in the list multiplies in its
/// level count.
pub fn estimate_grid_size_bytes(dimensions: &str, realm: &str, access_version: &str) -> f64 {
    const BYTES_PER_VALUE: f64 = 4.0;

    let horizontal: f64 = match realm {
        "ocean" | "ocnBgchem" | "seaIce" => 360.0 * 300.0,
        // atmosphere grid: ESM1.5 runs N96 with 145 latitude rows
        _ => {
            if access_version.starts_with("ESM") {
                192.0 * 145.0
            } else {
                192.0 * 144.0
            }
        }
    };

    let mut levels = 1.0;
    for token in dimensions.split_whitespace() {
        levels *= match token {
            "alevel" | "alevhalf" => {
                if access_version.starts_with("ESM") {
                    38.0
                } else {
                    85.0
                }
            }
            "olevel" | "olevhalf" | "depth_coord" => 50.0,
            "sdepth" => 4.0,
            other => {
                if let Some(n) = other.strip_prefix("plev").and_then(|s| s.parse::<u32>().ok()) {
                    f64::from(n)
                } else {
                    1.0
                }
            }
        };
    }

    horizontal * levels * BYTES_PER_VALUE
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_whole_span_when_everything_fits() {
        // 0.05 MB per daily timestep over 3650 days projects to 182.5 MB,
        // inside 110% of a 500 MB budget: one file for the experiment.
        let start = date(2000, 1, 1);
        let end = start.checked_add_days(Days::new(3650)).unwrap();
        let plan = plan_chunks(0.05 * MB, "day", start, end, 500.0).unwrap();

        assert_eq!(plan.interval, Interval::WholeSpan);
        assert!((plan.size_mb - 182.5).abs() < 1e-9);
        assert_eq!(plan.iter_chunks(start, end), vec![(start, end)]);
    }

    #[test]
    fn test_interval_selection_hits_size_band() {
        // 0.1 MB/day: 10-year chunks project to 365 MB, inside
        // [150, 550] for a 500 MB budget. 100-year chunks overshoot.
        let start = date(1900, 1, 1);
        let end = date(2000, 1, 1);
        let plan = plan_chunks(0.1 * MB, "day", start, end, 500.0).unwrap();

        assert_eq!(plan.interval, Interval::Years(10));
        let lo = 0.3 * 500.0;
        let hi = 1.1 * 500.0;
        assert!(plan.size_mb >= lo && plan.size_mb <= hi);
    }

    #[test]
    fn test_monthly_interval_for_high_volume_output() {
        // 100 MB per day of 3-hourly output: a month projects to 3000 MB
        // against a 5000 MB budget, within [1500, 5500].
        let start = date(1985, 1, 1);
        let end = date(1995, 1, 1);
        let plan = plan_chunks(12.5 * MB, "3hr", start, end, 5000.0).unwrap();
        assert_eq!(plan.interval, Interval::Months(1));
    }

    #[test]
    fn test_fallback_to_single_days_when_nothing_fits() {
        // 1000 MB/day: even one day overshoots 110% of a 500 MB budget,
        // so the planner degrades to 1-day chunks.
        let start = date(1985, 1, 1);
        let end = date(1986, 1, 1);
        let plan = plan_chunks(1000.0 * MB, "day", start, end, 500.0).unwrap();
        assert_eq!(plan.interval, Interval::Days(1));
    }

    #[test]
    fn test_fx_gets_single_chunk() {
        let start = date(1985, 1, 1);
        let end = date(2085, 1, 1);
        let plan = plan_chunks(10.0 * MB, "fx", start, end, 1.0).unwrap();
        assert_eq!(plan.interval, Interval::WholeSpan);
        assert_eq!(plan.iter_chunks(start, end), vec![(start, end)]);
    }

    #[test]
    fn test_unknown_frequency_is_an_error() {
        let start = date(1985, 1, 1);
        let err = plan_chunks(1.0, "fortnightly", start, date(1986, 1, 1), 500.0).unwrap_err();
        assert!(matches!(err, ChunkError::UnknownFrequency(f) if f == "fortnightly"));
    }

    /// Chunks must cover [start, end] exactly: back-to-back, no gaps, no
    /// overlaps, final tend equal to end.
    fn assert_exact_coverage(
        chunks: &[(NaiveDate, NaiveDate)],
        start: NaiveDate,
        end: NaiveDate,
    ) {
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].0, start);
        assert_eq!(chunks.last().unwrap().1, end);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
        for (tstart, tend) in chunks {
            assert!(tstart < tend);
        }
    }

    #[rstest]
    #[case(Interval::Years(1))]
    #[case(Interval::Years(10))]
    #[case(Interval::Months(1))]
    #[case(Interval::Days(7))]
    fn test_chunk_coverage(#[case] interval: Interval) {
        let plan = ChunkPlan {
            interval,
            size_mb: 0.0,
        };
        // deliberately not a whole multiple of any candidate interval
        let start = date(1985, 1, 1);
        let end = date(1990, 3, 15);
        let chunks = plan.iter_chunks(start, end);
        assert_exact_coverage(&chunks, start, end);
    }

    #[test]
    fn test_monthly_chunks_step_by_calendar_month() {
        let plan = ChunkPlan {
            interval: Interval::Months(1),
            size_mb: 0.0,
        };
        let chunks = plan.iter_chunks(date(1999, 11, 1), date(2000, 3, 1));
        assert_eq!(
            chunks,
            vec![
                (date(1999, 11, 1), date(1999, 12, 1)),
                (date(1999, 12, 1), date(2000, 1, 1)),
                (date(2000, 1, 1), date(2000, 2, 1)),
                // February 2000 is a leap month; calendar stepping, not 30 days
                (date(2000, 2, 1), date(2000, 3, 1)),
            ]
        );
    }

    #[test]
    fn test_final_chunk_clamped_to_end() {
        let plan = ChunkPlan {
            interval: Interval::Years(10),
            size_mb: 0.0,
        };
        let chunks = plan.iter_chunks(date(1985, 1, 1), date(1991, 6, 1));
        assert_eq!(chunks, vec![(date(1985, 1, 1), date(1991, 6, 1))]);
    }

    #[rstest]
    #[case("longitude latitude time", "atmos", "CM2", 192.0 * 144.0 * 4.0)]
    #[case("longitude latitude time", "atmos", "ESM1.5", 192.0 * 145.0 * 4.0)]
    #[case("longitude latitude plev19 time", "atmos", "CM2", 192.0 * 144.0 * 19.0 * 4.0)]
    #[case("longitude latitude alevel time", "atmos", "ESM1.5", 192.0 * 145.0 * 38.0 * 4.0)]
    #[case("longitude latitude olevel time", "ocean", "CM2", 360.0 * 300.0 * 50.0 * 4.0)]
    #[case("longitude latitude time", "seaIce", "CM2", 360.0 * 300.0 * 4.0)]
    fn test_estimate_grid_size(
        #[case] dimensions: &str,
        #[case] realm: &str,
        #[case] version: &str,
        #[case] expected: f64,
    ) {
        assert_eq!(estimate_grid_size_bytes(dimensions, realm, version), expected);
    }
}
