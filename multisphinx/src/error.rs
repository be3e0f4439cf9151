use thiserror::Error;

use crate::config::ConfigError;
use crate::lattice::LatticeError;

pub type MultisphinxResult<T> = Result<T, MultisphinxError>;

/// Crate-wide error type.
///
/// Variants are grouped the way search.md's error taxonomy groups them:
/// configuration/initialization, resource exhaustion, protocol/cancellation
/// and fatal data-integrity violations. Recoverable data-integrity events
/// are *not* represented here -- they are logged and skipped in place,
/// see [`crate::error::SkipReason`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MultisphinxError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("lattice error: {0}")]
    Lattice(#[from] LatticeError),

    #[error("out of memory growing {what}")]
    OutOfMemory { what: &'static str },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("language model does not contain an end-of-sentence word")]
    NoEndOfSentence,

    #[error("back-pointer table corrupt: {0}")]
    BptblCorrupt(String),
}

/// A recoverable data-integrity event (search.md §7).
///
/// These are logged at `warn` level by the caller and cause the
/// offending arc or node to be skipped; they never abort the search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UnknownWord { wid: i32 },
    UnmatchedRightContext { wid: i32, rc: u16 },
    BackoffNotFound { lm_state: i32 },
    DegenerateNode { sf: i32, lm_state: i32 },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::UnknownWord { wid } => write!(f, "unknown word {} in arc stream", wid),
            SkipReason::UnmatchedRightContext { wid, rc } => {
                write!(f, "no matching right context {} for word {}", rc, wid)
            }
            SkipReason::BackoffNotFound { lm_state } => {
                write!(f, "backoff N-gram not found for lm_state {}", lm_state)
            }
            SkipReason::DegenerateNode { sf, lm_state } => write!(
                f,
                "node (sf={}, lm_state={}) has no entries or no exits",
                sf, lm_state
            ),
        }
    }
}
