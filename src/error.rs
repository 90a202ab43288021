use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Errors surfaced by rowshift operations.
#[derive(Error, Debug)]
pub enum RowShiftError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{0}")]
    Error(String),
}

impl RowShiftError {
    /// The engine result code behind this error, where one exists.
    pub fn engine_code(&self) -> ErrorCode {
        match self {
            RowShiftError::Database(rusqlite::Error::SqliteFailure(err, _)) => {
                ErrorCode::from_raw(err.extended_code)
            }
            RowShiftError::Database(_) => ErrorCode::Error,
            RowShiftError::Error(_) => ErrorCode::Error,
        }
    }
}

/// Generic translation of the engine's result codes. Extended codes are
/// masked down to their primary code; anything unrecognized is carried
/// through as `Other`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    Ok,
    Error,
    Busy,
    Locked,
    NoMemory,
    ReadOnly,
    Interrupt,
    IoError,
    Corrupt,
    Full,
    CantOpen,
    Misuse,
    Notice,
    Warning,
    Other(i32),
}

impl ErrorCode {
    pub fn from_raw(raw: i32) -> Self {
        // Extended result codes keep the primary code in the low byte.
        match raw & 0xff {
            0 => ErrorCode::Ok,
            1 => ErrorCode::Error,
            5 => ErrorCode::Busy,
            6 => ErrorCode::Locked,
            7 => ErrorCode::NoMemory,
            8 => ErrorCode::ReadOnly,
            9 => ErrorCode::Interrupt,
            10 => ErrorCode::IoError,
            11 => ErrorCode::Corrupt,
            13 => ErrorCode::Full,
            14 => ErrorCode::CantOpen,
            21 => ErrorCode::Misuse,
            27 => ErrorCode::Notice,
            28 => ErrorCode::Warning,
            _ => ErrorCode::Other(raw),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ErrorCode::Ok)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Other(raw) => write!(f, "code {raw}"),
            other => write!(f, "{other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw_primary_codes() {
        assert_eq!(ErrorCode::from_raw(0), ErrorCode::Ok);
        assert_eq!(ErrorCode::from_raw(5), ErrorCode::Busy);
        assert_eq!(ErrorCode::from_raw(21), ErrorCode::Misuse);
    }

    #[test]
    fn test_from_raw_extended_codes_mask_to_primary() {
        // SQLITE_IOERR_READ = 266 = (1 << 8) | 10
        assert_eq!(ErrorCode::from_raw(266), ErrorCode::IoError);
        // SQLITE_BUSY_RECOVERY = 261 = (1 << 8) | 5
        assert_eq!(ErrorCode::from_raw(261), ErrorCode::Busy);
    }

    #[test]
    fn test_from_raw_unknown_code() {
        assert_eq!(ErrorCode::from_raw(99), ErrorCode::Other(99));
    }

    #[test]
    fn test_engine_code_of_database_error() {
        let err = RowShiftError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::DatabaseBusy,
                extended_code: 5,
            },
            None,
        ));
        assert_eq!(err.engine_code(), ErrorCode::Busy);
    }
}
