use thiserror::Error;

use crate::profile::Mode;

/// Errors raised while parsing, merging or dumping coverage profiles
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoverError {
    #[error("bad mode line: {0:?}")]
    InvalidMode(String),

    #[error("line {line_no} does not match the profile format: {line:?}")]
    MalformedLine { line_no: usize, line: String },

    #[error("mode for {file} mismatches: expected {expected}, found {found}")]
    ModeMismatch {
        file: String,
        expected: Mode,
        found: Mode,
    },

    #[error("coverage block mismatch in {file}: {detail}")]
    BlockMismatch { file: String, detail: String },

    #[error("expected at least one coverage file")]
    NoProfiles,

    #[error("failed to dump profile: profile has no coverage blocks")]
    EmptyProfile,
}
