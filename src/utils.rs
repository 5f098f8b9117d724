//! General utilities, not particular to any one post-processing step.
use std::path::Path;
use std::sync::OnceLock;

use chrono::NaiveDate;
use indexmap::IndexMap;

use crate::error::{DateParseError, TemplateError};

static PLACEHOLDER_REGEX: OnceLock<regex::Regex> = OnceLock::new();

/// Parse one of the compact 8-digit date strings (e.g. "19850101") used in
/// the experiment configuration and the job queue primary key.
pub fn parse_yyyymmdd(s: &str) -> Result<NaiveDate, DateParseError> {
    let s = s.trim();
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DateParseError::BadFormat(s.to_string()));
    }

    // Slicing is safe, we just confirmed the string is 8 ASCII digits.
    let year: i32 = s[..4].parse().unwrap();
    let month: u32 = s[4..6].parse().unwrap();
    let day: u32 = s[6..].parse().unwrap();

    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or(DateParseError::InvalidDate(year, month, day))
}

/// Format a date back into the compact 8-digit form.
pub fn format_yyyymmdd(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Replace `{placeholder}` markers in a path or file name template with the
/// given field values. Referencing a placeholder that is not in `fields` is
/// an error; it almost always means a typo in the user's template.
pub fn render_template(
    template: &str,
    fields: &IndexMap<String, String>,
) -> Result<String, TemplateError> {
    let re = PLACEHOLDER_REGEX
        .get_or_init(|| regex::Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

    let mut out = String::with_capacity(template.len());
    let mut last_end = 0;
    for caps in re.captures_iter(template) {
        let whole = caps.get(0).unwrap();
        let key = caps.get(1).unwrap().as_str();
        let value = fields
            .get(key)
            .ok_or_else(|| TemplateError::UnknownPlaceholder(key.to_string()))?;
        out.push_str(&template[last_end..whole.start()]);
        out.push_str(value);
        last_end = whole.end();
    }
    out.push_str(&template[last_end..]);
    Ok(out)
}

/// Create a directory (and any missing parents) if it does not already exist.
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.is_dir() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yyyymmdd() {
        let date = parse_yyyymmdd("19850101").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(1985, 1, 1).unwrap());

        let date = parse_yyyymmdd("20141231").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2014, 12, 31).unwrap());
    }

    #[test]
    fn test_parse_yyyymmdd_rejects_bad_input() {
        assert!(matches!(
            parse_yyyymmdd("1985-01-01"),
            Err(DateParseError::BadFormat(_))
        ));
        assert!(matches!(
            parse_yyyymmdd("198501"),
            Err(DateParseError::BadFormat(_))
        ));
        assert!(matches!(
            parse_yyyymmdd("19850230"),
            Err(DateParseError::InvalidDate(1985, 2, 30))
        ));
    }

    #[test]
    fn test_date_round_trip() {
        let s = "20100315";
        assert_eq!(format_yyyymmdd(parse_yyyymmdd(s).unwrap()), s);
    }

    #[test]
    fn test_render_template() {
        let mut fields = IndexMap::new();
        fields.insert("variable_id".to_string(), "tas".to_string());
        fields.insert("cmip_table".to_string(), "Amon".to_string());
        fields.insert("date_range".to_string(), "19850101-19891231".to_string());

        let rendered =
            render_template("{variable_id}_{cmip_table}_{date_range}.nc", &fields).unwrap();
        assert_eq!(rendered, "tas_Amon_19850101-19891231.nc");
    }

    #[test]
    fn test_render_template_unknown_placeholder() {
        let fields = IndexMap::new();
        let err = render_template("{nope}.nc", &fields).unwrap_err();
        assert!(matches!(err, TemplateError::UnknownPlaceholder(k) if k == "nope"));
    }

    #[test]
    fn test_render_template_no_placeholders() {
        let fields = IndexMap::new();
        assert_eq!(render_template("plain.nc", &fields).unwrap(), "plain.nc");
    }
}
