//! Error types for the event tree.
//!
//! Configuration problems, structural invariant violations, backing-file I/O and lookups of
//! things that do not exist are kept in separate variants so callers can tell "bad input" apart
//! from "corrupted state".

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the event tree, its backing file and the binning engine.
#[derive(Error, Debug)]
pub enum Error {
    /// A configuration value is invalid (zero split factor, empty extents, zero bins...).
    #[error("invalid {what}: {reason}")]
    InvalidArgument {
        /// Name of the offending argument.
        what: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// A runtime-sized list does not match the dimensionality of the workspace.
    #[error("{context}: expected {expected} dimensions, found {found}")]
    DimensionMismatch {
        /// Dimensionality of the workspace.
        expected: usize,
        /// Length that was supplied.
        found: usize,
        /// What was being validated.
        context: &'static str,
    },

    /// A dimension was requested by index that the workspace doesn't have.
    #[error("dimension index {index} not found (workspace has {available} dimensions)")]
    DimensionNotFound {
        /// The requested index.
        index: usize,
        /// Number of dimensions in the workspace.
        available: usize,
    },

    /// A dimension was requested by name that the workspace doesn't have.
    #[error("dimension named '{name}' not found")]
    DimensionNameNotFound {
        /// The requested name.
        name: String,
    },

    /// A node id that doesn't exist in the tree.
    #[error("node {id} not found")]
    NodeNotFound {
        /// The requested id.
        id: u64,
    },

    /// A structural invariant of the tree does not hold.
    #[error("tree structure violated: {reason}")]
    Structure {
        /// Description of the violation.
        reason: String,
    },

    /// Reading or writing the backing file failed.
    #[error("I/O error while {context} ({path}): {source}")]
    Io {
        /// What the engine was doing.
        context: &'static str,
        /// The backing file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The backing file is not a valid event tree container.
    #[error("invalid backing file {path}: {reason}")]
    Format {
        /// The backing file.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// A disk operation was requested on a workspace that lives only in memory.
    #[error("workspace is not file backed")]
    NotFileBacked,

    /// The operation stopped early because its progress reporter was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn invalid(what: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            what,
            reason: reason.into(),
        }
    }

    pub(crate) fn structure(reason: impl Into<String>) -> Self {
        Self::Structure {
            reason: reason.into(),
        }
    }

    pub(crate) fn io(
        context: &'static str,
        path: impl Into<PathBuf>,
    ) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io {
            context,
            path,
            source,
        }
    }

    /// Checks that a runtime length matches the dimensionality `expected`.
    pub(crate) fn check_len(expected: usize, found: usize, context: &'static str) -> Result<()> {
        if expected == found {
            Ok(())
        } else {
            Err(Self::DimensionMismatch {
                expected,
                found,
                context,
            })
        }
    }

    /// Returns `true` for the not-found family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::DimensionNotFound { .. }
                | Self::DimensionNameNotFound { .. }
                | Self::NodeNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_len_reports_both_sizes() {
        assert!(Error::check_len(3, 3, "extents").is_ok());

        let err = Error::check_len(3, 2, "split factors").unwrap_err();
        assert_eq!(
            err.to_string(),
            "split factors: expected 3 dimensions, found 2"
        );
    }

    #[test]
    fn not_found_family_is_distinct() {
        assert!(Error::NodeNotFound { id: 4 }.is_not_found());
        assert!(Error::DimensionNotFound {
            index: 5,
            available: 3
        }
        .is_not_found());
        assert!(!Error::structure("gap in child ids").is_not_found());
        assert!(!Error::invalid("split_into", "zero").is_not_found());
    }
}
