//! Common errors across the access-pp crate

/// Errors raised when parsing the compact YYYYMMDD date strings used
/// throughout the experiment configuration and the job queue.
#[derive(Debug, thiserror::Error)]
pub enum DateParseError {
    #[error("'{0}' is not an 8-digit YYYYMMDD date string")]
    BadFormat(String),
    #[error("Year {0}, month {1}, day {2} is not a valid date")]
    InvalidDate(i32, u32, u32),
}

/// Errors raised while rendering a path or file name template.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("template references unknown placeholder '{{{0}}}'")]
    UnknownPlaceholder(String),
}
