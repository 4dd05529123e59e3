//! Error handling and C-ABI error codes for fastplane

use crate::types::SocketId;
use std::cell::RefCell;
use std::os::raw::c_char;
use thiserror::Error;

/// Arena-level failures. These abort the build in progress; the published
/// generation stays authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("socket {socket_id} exhausted: '{name}' wants {requested} bytes, {available} left")]
    Exhausted {
        name: String,
        socket_id: SocketId,
        requested: u64,
        available: u64,
    },
    #[error("unknown socket {0}")]
    UnknownSocket(SocketId),
    #[error("zero-sized allocation for '{0}'")]
    ZeroSize(String),
    #[error("cannot bind '{name}' to numa node {socket_id}: {reason}")]
    NumaBind {
        name: String,
        socket_id: SocketId,
        reason: String,
    },
    #[error("mapping '{name}' ({size} bytes) failed: {reason}")]
    Map {
        name: String,
        size: u64,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error("'{name}' on socket {socket_id} overflowed at capacity {capacity} after {attempts} attempts")]
    CapacityOverflow {
        name: String,
        socket_id: SocketId,
        capacity: usize,
        attempts: u32,
    },
    #[error("invalid reference: {0}")]
    InvalidReference(String),
    #[error("structural inconsistency: {0}")]
    StructuralInconsistency(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("resolution failed: {0}")]
    Resolve(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    AllocationFailed = 1,
    CapacityOverflow = 2,
    InvalidReference = 3,
    StructuralInconsistency = 4,
    InvalidHandle = 5,
    Utf8Error = 6,
    InvalidArgument = 7,
    ConfigError = 8,
    ResolveFailed = 9,
    NotFound = 12,
    Unknown = 255,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Success => "Success",
            ErrorCode::AllocationFailed => "Allocation failed",
            ErrorCode::CapacityOverflow => "Capacity overflow",
            ErrorCode::InvalidReference => "Invalid reference",
            ErrorCode::StructuralInconsistency => "Structural inconsistency",
            ErrorCode::InvalidHandle => "Invalid handle",
            ErrorCode::Utf8Error => "UTF-8 conversion error",
            ErrorCode::InvalidArgument => "Invalid argument",
            ErrorCode::ConfigError => "Configuration error",
            ErrorCode::ResolveFailed => "Resolution failed",
            ErrorCode::NotFound => "Not found",
            ErrorCode::Unknown => "Unknown error",
        }
    }

    fn as_cstr(self) -> &'static [u8] {
        match self {
            ErrorCode::Success => b"Success\0",
            ErrorCode::AllocationFailed => b"Allocation failed\0",
            ErrorCode::CapacityOverflow => b"Capacity overflow\0",
            ErrorCode::InvalidReference => b"Invalid reference\0",
            ErrorCode::StructuralInconsistency => b"Structural inconsistency\0",
            ErrorCode::InvalidHandle => b"Invalid handle\0",
            ErrorCode::Utf8Error => b"UTF-8 conversion error\0",
            ErrorCode::InvalidArgument => b"Invalid argument\0",
            ErrorCode::ConfigError => b"Configuration error\0",
            ErrorCode::ResolveFailed => b"Resolution failed\0",
            ErrorCode::NotFound => b"Not found\0",
            ErrorCode::Unknown => b"Unknown error\0",
        }
    }
}

// Thread-local last error for C-ABI
thread_local! {
    static LAST_ERROR: RefCell<ErrorCode> = const { RefCell::new(ErrorCode::Success) };
}

pub fn set_last_error(code: ErrorCode) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = code);
}

pub fn get_last_error() -> ErrorCode {
    LAST_ERROR.with(|cell| *cell.borrow())
}

#[no_mangle]
pub extern "C" fn fastplane_last_error() -> ErrorCode {
    get_last_error()
}

#[no_mangle]
pub extern "C" fn fastplane_strerror(code: ErrorCode) -> *const c_char {
    code.as_cstr().as_ptr() as *const c_char
}

// Map internal Error to ErrorCode
pub fn map_error(e: &Error) -> ErrorCode {
    match e {
        Error::Allocation(_) => ErrorCode::AllocationFailed,
        Error::CapacityOverflow { .. } => ErrorCode::CapacityOverflow,
        Error::InvalidReference(_) => ErrorCode::InvalidReference,
        Error::StructuralInconsistency(_) => ErrorCode::StructuralInconsistency,
        Error::Config(_) => ErrorCode::ConfigError,
        Error::Resolve(_) => ErrorCode::ResolveFailed,
    }
}

/// Collapse a typed result into the single code reported to the control plane.
pub fn result_code<T>(r: &Result<T>) -> ErrorCode {
    match r {
        Ok(_) => ErrorCode::Success,
        Err(e) => map_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_errors_map_to_one_code() {
        let e: Error = AllocationError::UnknownSocket(3).into();
        assert_eq!(map_error(&e), ErrorCode::AllocationFailed);
        assert_eq!(result_code::<()>(&Err(e)), ErrorCode::AllocationFailed);
        assert_eq!(result_code(&Ok(1)), ErrorCode::Success);
    }

    #[test]
    fn last_error_is_thread_local() {
        set_last_error(ErrorCode::NotFound);
        let other = std::thread::spawn(get_last_error).join().unwrap();
        assert_eq!(other, ErrorCode::Success);
        assert_eq!(get_last_error(), ErrorCode::NotFound);
    }
}
