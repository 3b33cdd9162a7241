//! Error-handling code.

use std::fmt;

use anyhow::Error;
use thiserror::Error as ThisError;

/// The typed error taxonomy for the control plane.
///
/// Most functions in this crate return `anyhow::Error` so that context can
/// be attached as errors propagate, but callers (HTTP handlers, the CLI)
/// sometimes need to react to a specific *kind* of failure without
/// string-matching a message. Construct one of these, wrap it with
/// `anyhow::Error::from` (or just `?`), and recover it later with
/// `anyhow::Error::downcast_ref::<CoreError>()`.
#[derive(Debug, ThisError)]
pub enum CoreError {
    /// No pipeline with this name exists.
    #[error("no pipeline named {name:?}")]
    PipelineNotFound {
        /// The pipeline name that was looked up.
        name: String,
    },

    /// No job with this id exists.
    #[error("no job with id {id}")]
    JobNotFound {
        /// The job id that was looked up.
        id: uuid::Uuid,
    },

    /// A pipeline with this name already exists.
    #[error("pipeline {name:?} already exists")]
    PipelineAlreadyExists {
        /// The colliding pipeline name.
        name: String,
    },

    /// The caller lacks the required scope on a repo.
    #[error("not authorized: {scope} access to repo {repo:?} is required")]
    NotAuthorized {
        /// The repo the caller needed access to.
        repo: String,
        /// The scope that was required.
        scope: String,
    },

    /// The request failed shape validation.
    #[error("validation error: {message}")]
    Validation {
        /// A human-readable description of what's wrong.
        message: String,
    },

    /// An input commit has no data associated with it.
    #[error("commit {commit} has no data")]
    EmptyInput {
        /// The empty commit.
        commit: String,
    },

    /// A job's input commits don't share the expected parent commits.
    #[error("parent inputs mismatch at commit {parent}")]
    ParentInputsMismatch {
        /// The commit whose parents didn't match.
        parent: String,
    },

    /// A call to an external system failed in a way that might succeed if
    /// retried.
    #[error("transient error calling {subsystem}: {message}")]
    TransientRpc {
        /// The subsystem that was called (CAFS, COR, TX-KV, ...).
        subsystem: String,
        /// A human-readable description of the failure.
        message: String,
    },

    /// We hit a state that should be unreachable if the code is correct.
    #[error("internal invariant violated: {message}")]
    Invariant {
        /// A human-readable description of the violated invariant.
        message: String,
    },

    /// An external subsystem (CAFS, COR, TX-KV) could not be reached at
    /// all.
    #[error("{subsystem} is unavailable")]
    Unavailable {
        /// The subsystem that is unavailable.
        subsystem: String,
    },

    /// The requested operation is not implemented (by design).
    #[error("{operation} is not implemented")]
    Unimplemented {
        /// The name of the unimplemented operation.
        operation: String,
    },
}

impl CoreError {
    /// Is this the kind of error that should be treated as idempotent
    /// cleanup noise (e.g. deleting a file that's already gone)?
    ///
    /// CAFS doesn't give us a typed "not found" distinct from other errors,
    /// so we classify by matching substrings of the underlying message.
    pub fn is_idempotent_cafs_error(err: &Error) -> bool {
        let message = err.to_string().to_lowercase();
        message.contains("not found") || message.contains("already exists")
    }
}

/// Support for displaying an error with a complete list of causes, and an
/// optional backtrace.
pub trait DisplayCausesAndBacktraceExt {
    /// Display the error and its causes, plus a backtrace (if available).
    fn display_causes_and_backtrace(&self) -> DisplayCauses<'_>;

    /// Display the error and its causes.
    fn display_causes_without_backtrace(&self) -> DisplayCauses<'_>;
}

impl DisplayCausesAndBacktraceExt for Error {
    fn display_causes_and_backtrace(&self) -> DisplayCauses<'_> {
        DisplayCauses {
            err: self,
            show_backtrace: true,
        }
    }

    fn display_causes_without_backtrace(&self) -> DisplayCauses<'_> {
        DisplayCauses {
            err: self,
            show_backtrace: false,
        }
    }
}

/// Helper type used to display errors.
pub struct DisplayCauses<'a> {
    /// The error to display.
    err: &'a Error,

    /// Should we show the backtrace?
    show_backtrace: bool,
}

impl fmt::Display for DisplayCauses<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ERROR: {}", self.err)?;
        let mut source = self.err.source();
        while let Some(next) = source {
            writeln!(f, "  caused by: {}", next)?;
            source = next.source();
        }

        if self.show_backtrace {
            write!(f, "{}", self.err.backtrace())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_cafs_errors_are_classified_by_substring() {
        let not_found = Error::msg("branch master: not found");
        let already_exists = Error::msg("object already Exists in store");
        let other = Error::msg("connection reset by peer");
        assert!(CoreError::is_idempotent_cafs_error(&not_found));
        assert!(CoreError::is_idempotent_cafs_error(&already_exists));
        assert!(!CoreError::is_idempotent_cafs_error(&other));
    }
}
