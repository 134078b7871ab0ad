use std::fmt;

use crate::weave::WeaveError;

/// Machine-readable error codes for tooling and agent-friendly decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    MalformedStoredTree,
    InvalidWeave,
    EncodeFailed,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::MalformedStoredTree => "E2001",
            Self::InvalidWeave => "E3001",
            Self::EncodeFailed => "E5001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::MalformedStoredTree => "Stored tree could not be decoded",
            Self::InvalidWeave => "Weave violates its structural invariants",
            Self::EncodeFailed => "Stored tree could not be encoded",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::MalformedStoredTree => {
                Some("Check that the file is a stored tree with `site`, `knownSites` and `weave`.")
            }
            Self::InvalidWeave => {
                Some("Re-import the atoms from a healthy replica; a second root or a missing cause was found.")
            }
            Self::EncodeFailed => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors surfaced by the causal tree at its boundaries.
///
/// Expected negative outcomes inside the engine (unknown tags, duplicate
/// atoms, out-of-range edits) are `None`/empty results, not errors.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error(transparent)]
    InvalidWeave(#[from] WeaveError),

    #[error("failed to decode stored tree: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to encode stored tree: {0}")]
    Encode(#[source] serde_json::Error),
}

impl TreeError {
    /// Return the machine-readable error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidWeave(_) => ErrorCode::InvalidWeave,
            Self::Decode(_) => ErrorCode::MalformedStoredTree,
            Self::Encode(_) => ErrorCode::EncodeFailed,
        }
    }
}
