use std::io;

use thiserror::Error;

/// Coarse classification of a [`SaveError`], for callers that only need to
/// decide how to react (report, skip, abort).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Io,
    Parse,
    NotFound,
    UnsupportedOperation,
    Database,
}

#[derive(Debug, Error)]
pub enum SaveError {
    /// A read ran past the end of the buffer.
    #[error("buffer underflow at offset {offset}: need {needed} bytes, buffer length {len}")]
    BufferUnderflow {
        offset: usize,
        needed: usize,
        len: usize,
    },

    /// A name index is missing from the active name table.
    #[error("unresolved name index {index} at offset {offset}")]
    UnresolvedName { index: u32, offset: usize },

    /// A struct payload did not end where its declared size says it should.
    #[error(
        "struct {struct_type} size mismatch: expected end {expected_end}, cursor at {actual_end}"
    )]
    StructSizeMismatch {
        struct_type: String,
        expected_end: usize,
        actual_end: usize,
    },

    #[error("unsupported value type {value_type} for property {property}")]
    UnsupportedValueType { property: String, value_type: String },

    #[error("unsupported archive version {0}, expected {1}")]
    ArchiveVersionUnsupported(u32, u32),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl SaveError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BufferUnderflow { .. }
            | Self::UnresolvedName { .. }
            | Self::StructSizeMismatch { .. }
            | Self::InvalidData(_)
            | Self::Decompress(_) => ErrorCode::Parse,
            Self::UnsupportedValueType { .. } | Self::ArchiveVersionUnsupported(..) => {
                ErrorCode::UnsupportedOperation
            }
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Io(_) => ErrorCode::Io,
            Self::Database(_) => ErrorCode::Database,
        }
    }

    /// Only a struct desync can be resynced locally; everything else aborts
    /// the current object.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::StructSizeMismatch { .. })
    }
}

pub type Result<T> = std::result::Result<T, SaveError>;
