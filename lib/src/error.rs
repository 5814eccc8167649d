// Copyright 2024 The Meridian Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]
//! User-facing error kinds and the process exit-code taxonomy.
//!
//! Every component surfaces its own error type; at the facade boundary they
//! convert into [`Error`], which carries the exit code a command should
//! terminate with.

use thiserror::Error;

use crate::backend::BackendError;
use crate::path::InvalidDatasetPathError;

pub mod exit_code {
    //! Exit codes as reported to the host shell.

    pub const SUCCESS: i32 = 0;
    pub const SUCCESS_WITH_FLAG: i32 = 1;

    pub const INVALID_ARGUMENT: i32 = 2;

    // We could use 1 for this, except in --exit-code mode.
    // So we always use 11 for consistency.
    pub const UNCATEGORIZED_ERROR: i32 = 11;

    pub const INVALID_OPERATION: i32 = 20;
    pub const MERGE_CONFLICT: i32 = 21;
    pub const PATCH_DOES_NOT_APPLY: i32 = 22;
    pub const SCHEMA_VIOLATION: i32 = 23;
    pub const UNSUPPORTED_VERSION: i32 = 24;
    pub const CRS_ERROR: i32 = 25;
    pub const GEOMETRY_ERROR: i32 = 26;
    pub const SPATIAL_FILTER_CONFLICT: i32 = 27;
    pub const INVALID_FILE_FORMAT: i32 = 28;
    pub const UNCOMMITTED_CHANGES: i32 = 29;
    // Ran out of 2x numbers. Oh well.
    pub const WORKING_COPY_OR_IMPORT_CONFLICT: i32 = 31;

    pub const NOT_FOUND: i32 = 40;
    pub const NO_REPOSITORY: i32 = 41;
    pub const NO_DATA: i32 = 42;
    pub const NO_BRANCH: i32 = 43;
    pub const NO_CHANGES: i32 = 44;
    pub const NO_WORKING_COPY: i32 = 45;
    pub const NO_USER: i32 = 46;
    pub const NO_COMMIT: i32 = 47;
    pub const NO_IMPORT_SOURCE: i32 = 48;
    pub const NO_TABLE: i32 = 49;
    pub const NO_CONFLICT: i32 = 50;
    pub const NO_DRIVER: i32 = 51;
    pub const NO_SPATIAL_FILTER: i32 = 52;
    pub const NO_SPATIAL_FILTER_INDEX: i32 = 53;

    pub const CONNECTION_ERROR: i32 = 60;

    pub const SUBPROCESS_ERROR_FLAG: i32 = 128;
    pub const DEFAULT_SUBPROCESS_ERROR: i32 = 129;
}

/// Maps a child-process exit status to our subprocess exit-code range, so
/// that signal-kills and ordinary failures stay distinguishable.
pub fn translate_subprocess_exit_code(code: i32) -> i32 {
    use exit_code::SUBPROCESS_ERROR_FLAG;
    if code > 0 && code < SUBPROCESS_ERROR_FLAG {
        SUBPROCESS_ERROR_FLAG + code
    } else if (SUBPROCESS_ERROR_FLAG..2 * SUBPROCESS_ERROR_FLAG).contains(&code) {
        code
    } else {
        SUBPROCESS_ERROR_FLAG
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The user-facing error kinds. The top-level command maps each kind to its
/// exit code and writes a single-line message on the error stream.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{message}")]
    NotFound { message: String, exit_code: i32 },
    #[error("{message}")]
    InvalidOperation { message: String },
    #[error("You have uncommitted changes in your working copy")]
    UncommittedChanges,
    #[error("Patch does not apply:\n{}", conflicts.join("\n"))]
    PatchDoesNotApply { conflicts: Vec<String> },
    #[error("{message}")]
    SchemaViolation { message: String },
    #[error("Repository version {version} is not supported by this build")]
    UnsupportedVersion { version: u32 },
    #[error("{message}")]
    CrsError { message: String },
    #[error("{message}")]
    GeometryError { message: String },
    #[error("{message}")]
    InvalidFileFormat { message: String },
    #[error("{message}\nCaused by error:\n{cause}")]
    ConnectionError { message: String, cause: String },
    #[error("{message}")]
    SubprocessError { message: String, exit_code: i32 },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Dataset(#[from] crate::dataset::DatasetError),
    #[error(transparent)]
    DatasetPath(#[from] InvalidDatasetPathError),
    #[error("{message}")]
    Uncategorized { message: String },
}

impl Error {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            exit_code: exit_code::NOT_FOUND,
        }
    }

    pub fn not_found_with_code(message: impl Into<String>, exit_code: i32) -> Self {
        Self::NotFound {
            message: message.into(),
            exit_code,
        }
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    pub fn schema_violation(message: impl Into<String>) -> Self {
        Self::SchemaViolation {
            message: message.into(),
        }
    }

    pub fn no_changes() -> Self {
        Self::not_found_with_code("No changes to commit", exit_code::NO_CHANGES)
    }

    pub fn subprocess(message: impl Into<String>, status: i32) -> Self {
        Self::SubprocessError {
            message: message.into(),
            exit_code: translate_subprocess_exit_code(status),
        }
    }

    /// The §6.6 exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound { exit_code, .. } => *exit_code,
            Self::InvalidOperation { .. } => exit_code::INVALID_OPERATION,
            Self::UncommittedChanges => exit_code::UNCOMMITTED_CHANGES,
            Self::PatchDoesNotApply { .. } => exit_code::PATCH_DOES_NOT_APPLY,
            Self::SchemaViolation { .. } => exit_code::SCHEMA_VIOLATION,
            Self::UnsupportedVersion { .. } => exit_code::UNSUPPORTED_VERSION,
            Self::CrsError { .. } => exit_code::CRS_ERROR,
            Self::GeometryError { .. } => exit_code::GEOMETRY_ERROR,
            Self::InvalidFileFormat { .. } => exit_code::INVALID_FILE_FORMAT,
            Self::ConnectionError { .. } => exit_code::CONNECTION_ERROR,
            Self::SubprocessError { exit_code, .. } => *exit_code,
            Self::Backend(BackendError::ImportHelperFailed { status }) => {
                translate_subprocess_exit_code(*status)
            }
            Self::Backend(_) => exit_code::UNCATEGORIZED_ERROR,
            Self::Dataset(err) => match err {
                crate::dataset::DatasetError::FeatureNotFound { .. } => exit_code::NOT_FOUND,
                crate::dataset::DatasetError::UnsupportedDatasetVersion { .. } => {
                    exit_code::UNSUPPORTED_VERSION
                }
                _ => exit_code::UNCATEGORIZED_ERROR,
            },
            Self::DatasetPath(_) => exit_code::INVALID_OPERATION,
            Self::Uncategorized { .. } => exit_code::UNCATEGORIZED_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_subprocess_exit_code() {
        // Ordinary failures move into the 128+ range.
        assert_eq!(translate_subprocess_exit_code(1), 129);
        assert_eq!(translate_subprocess_exit_code(42), 170);
        // Signal-kills (128+N) pass through unchanged.
        assert_eq!(translate_subprocess_exit_code(137), 137);
        // Anything else collapses to the flag value.
        assert_eq!(translate_subprocess_exit_code(0), 128);
        assert_eq!(translate_subprocess_exit_code(-9), 128);
        assert_eq!(translate_subprocess_exit_code(300), 128);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::no_changes().exit_code(), exit_code::NO_CHANGES);
        assert_eq!(
            Error::UncommittedChanges.exit_code(),
            exit_code::UNCOMMITTED_CHANGES
        );
        assert_eq!(
            Error::PatchDoesNotApply { conflicts: vec![] }.exit_code(),
            exit_code::PATCH_DOES_NOT_APPLY
        );
        assert_eq!(Error::subprocess("worker died", 3).exit_code(), 131);
    }
}
