use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can end a run. Identifier searches with the wrong number of
/// matches are not errors; the pipeline reports those and returns normally.
#[derive(Debug, Error)]
pub enum Error {
    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("token cache {}: {source}", path.display())]
    TokenCache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} returned {status}: {body}")]
    Api {
        endpoint: String,
        status: StatusCode,
        body: String,
    },

    /// The read does not span the target position.
    #[error("read starting at {start} does not cover position {target} (sequence length {len})")]
    OffsetOutOfRange { start: i64, target: i64, len: usize },

    #[error("position {0} has no representable half-open interval")]
    InvalidPosition(i64),

    #[error("genotype index {index} has no matching alternate base (only {alternates} present)")]
    GenotypeIndex { index: i32, alternates: usize },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit code for this error. Usage errors exit with 2 from clap.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Authorization(_) | Self::TokenCache { .. } => 3,
            Self::InvalidUrl(_) | Self::Transport { .. } | Self::Api { .. } => 4,
            Self::InvalidPosition(_)
            | Self::OffsetOutOfRange { .. }
            | Self::GenotypeIndex { .. }
            | Self::Json(_)
            | Self::Io(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_from_usage() {
        let errors = [
            Error::Authorization("denied".to_string()),
            Error::Api {
                endpoint: "reads/search".to_string(),
                status: StatusCode::FORBIDDEN,
                body: String::new(),
            },
            Error::OffsetOutOfRange {
                start: 10,
                target: 20,
                len: 4,
            },
            Error::InvalidPosition(i64::MAX),
        ];
        let codes: Vec<i32> = errors.iter().map(Error::exit_code).collect();
        assert_eq!(codes, vec![3, 4, 1, 1]);
        assert!(!codes.contains(&2));
    }
}
