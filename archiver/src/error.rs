//! Error taxonomy that crosses the worker protocol boundary.
//!
//! `ArchiveError` is the one typed error in this crate: it is what a worker
//! sends back to its parent on failure (§6 "Response (error)") and what gets
//! persisted verbatim into a `.error` / `global.error` spool marker. Every
//! other fallible path (CLI glue, storage I/O, config loading) uses
//! `anyhow::Result` with `.context(...)`, matching the teacher's dominant
//! style (`bottomless::replicator` is `anyhow` end to end).

use crate::pack::{PackError, PackReader, PackWriter};
use thiserror::Error;

/// Numeric error codes carried on the wire and in spool markers. Kept small
/// and stable since they are a persisted, cross-process contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    InvalidArgument = 1,
    ConfigEnvironment = 2,
    NotFound = 3,
    TransientIo = 4,
    Integrity = 5,
    Protocol = 6,
    Assertion = 7,
}

impl ErrorCode {
    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => ErrorCode::InvalidArgument,
            2 => ErrorCode::ConfigEnvironment,
            3 => ErrorCode::NotFound,
            4 => ErrorCode::TransientIo,
            5 => ErrorCode::Integrity,
            6 => ErrorCode::Protocol,
            _ => ErrorCode::Assertion,
        }
    }
}

/// The error shape that crosses the worker IPC boundary and is persisted
/// into `.error` / `global.error` markers (§6, §7).
#[derive(Debug, Error, Clone)]
#[error("[{code:?}] {message}")]
pub struct ArchiveError {
    pub code: ErrorCode,
    pub message: String,
    pub stack: Option<String>,
}

impl ArchiveError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ArchiveError {
            code,
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn transient_io(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TransientIo, message)
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Integrity, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Protocol, message)
    }

    /// Encodes as a pack object: `{code: i32, message: string, stack: string?}`.
    pub fn write_pack(&self, w: &mut PackWriter) -> crate::pack::Result<()> {
        w.write_i32(1, self.code as i32)?;
        w.write_string(2, &self.message)?;
        w.write_string_opt(3, self.stack.as_deref())?;
        Ok(())
    }

    pub fn to_pack_bytes(&self) -> Vec<u8> {
        let mut w = PackWriter::new();
        // propagating a pack encode failure here would recurse forever
        self.write_pack(&mut w).expect("ArchiveError always encodes");
        w.into_bytes()
    }

    pub fn read_pack(r: &mut PackReader) -> crate::pack::Result<Self> {
        let code = r.read_i32(1, ErrorCode::Assertion as i32)?;
        let message = r
            .read_string(2, None)?
            .ok_or_else(|| PackError::Format("error pack missing message".into()))?;
        let stack = r.read_string(3, None)?;
        Ok(ArchiveError {
            code: ErrorCode::from_i32(code),
            message,
            stack,
        })
    }
}

impl From<PackError> for ArchiveError {
    fn from(e: PackError) -> Self {
        ArchiveError::protocol(e.to_string())
    }
}

impl From<std::io::Error> for ArchiveError {
    fn from(e: std::io::Error) -> Self {
        ArchiveError::transient_io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_error_round_trips_through_pack() {
        let err = ArchiveError::integrity("sha1 mismatch").with_stack("at fetch_segment");
        let bytes = err.to_pack_bytes();
        let mut r = PackReader::new(&bytes);
        let decoded = ArchiveError::read_pack(&mut r).unwrap();
        assert_eq!(decoded.code, ErrorCode::Integrity);
        assert_eq!(decoded.message, "sha1 mismatch");
        assert_eq!(decoded.stack.as_deref(), Some("at fetch_segment"));
    }
}
