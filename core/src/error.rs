use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid rule table: {reason}")]
    InvalidRuleTable { reason: String },

    #[error("Stage '{stage}' requires output from '{missing}' which has not run")]
    StageOrder {
        stage: &'static str,
        missing: &'static str,
    },

    #[error("Unknown operating status '{0}'")]
    UnknownStatus(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// A single rule that could not be evaluated for one carrier.
///
/// These never abort a run: the scoring stage logs them, skips the rule,
/// and tags the carrier with the partial-evaluation flag.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("field '{field}' is negative ({value})")]
    NegativeCount { field: &'static str, value: i64 },

    #[error("rate '{field}' is outside [0, 1] ({value})")]
    InvalidRate { field: &'static str, value: f64 },

    #[error("amount '{field}' is not a finite non-negative number ({value})")]
    InvalidAmount { field: &'static str, value: f64 },
}
