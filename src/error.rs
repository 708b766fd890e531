use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("integrity violation in {scope}: {detail}")]
    IntegrityViolation { scope: String, detail: String },

    #[error("{job} for season {season} blocked: upstream {upstream} {reason}")]
    StaleUpstream {
        job: &'static str,
        upstream: &'static str,
        season: u32,
        reason: String,
    },

    #[error("unknown job '{0}'")]
    UnknownJob(String),

    #[error("round {0} is not a league round (expected 1-4)")]
    InvalidRound(u8),
}

impl EngineError {
    pub fn integrity(scope: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::IntegrityViolation {
            scope: scope.into(),
            detail: detail.into(),
        }
    }
}
