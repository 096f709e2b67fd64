use chrono::NaiveDate;

/// Query errors. Upstream trouble never shows up here; it is reported
/// through the envelope flags instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    InvalidRange { start: NaiveDate, end: NaiveDate },
    LimitExceeded(&'static str),
    InvalidSubject,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange { start, end } => {
                write!(f, "invalid date range: {start} is after {end}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::InvalidSubject => write!(f, "subject id must not be empty"),
        }
    }
}

impl std::error::Error for EngineError {}
