use std::ffi::CStr;

use thiserror::Error;

/// Why a resolution or database query failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Status {
    /// No live allocation contains the address.
    #[error("unknown address")]
    UnknownAddress,
    /// The address points into the middle of a scalar, or into padding.
    #[error("bad alignment")]
    BadAlignment,
    /// The offset is past the end of the containing type.
    #[error("bad offset")]
    BadOffset,
    /// The type is not of the kind the query needs (e.g. not a struct).
    #[error("wrong kind")]
    WrongKind,
    #[error("invalid allocation id")]
    InvalidAllocId,
    #[error("invalid type id")]
    InvalidTypeId,
    /// The type cannot be resolved unambiguously, e.g. a union.
    #[error("unsupported type")]
    UnsupportedType,
    #[error("internal error")]
    Error,
}

/// The status codes handed across the C interface.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 0,
    UnknownAddress,
    BadAlignment,
    BadOffset,
    WrongKind,
    InvalidAllocId,
    InvalidTypeId,
    UnsupportedType,
    Error,
}

impl From<Status> for StatusCode {
    fn from(status: Status) -> Self {
        match status {
            Status::UnknownAddress => StatusCode::UnknownAddress,
            Status::BadAlignment => StatusCode::BadAlignment,
            Status::BadOffset => StatusCode::BadOffset,
            Status::WrongKind => StatusCode::WrongKind,
            Status::InvalidAllocId => StatusCode::InvalidAllocId,
            Status::InvalidTypeId => StatusCode::InvalidTypeId,
            Status::UnsupportedType => StatusCode::UnsupportedType,
            Status::Error => StatusCode::Error,
        }
    }
}

impl<T> From<Result<T, Status>> for StatusCode {
    fn from(result: Result<T, Status>) -> Self {
        match result {
            Ok(_) => StatusCode::Ok,
            Err(status) => status.into(),
        }
    }
}

impl StatusCode {
    pub const fn name(self) -> &'static CStr {
        match self {
            StatusCode::Ok => c"ok",
            StatusCode::UnknownAddress => c"unknown address",
            StatusCode::BadAlignment => c"bad alignment",
            StatusCode::BadOffset => c"bad offset",
            StatusCode::WrongKind => c"wrong kind",
            StatusCode::InvalidAllocId => c"invalid allocation id",
            StatusCode::InvalidTypeId => c"invalid type id",
            StatusCode::UnsupportedType => c"unsupported type",
            StatusCode::Error => c"internal error",
        }
    }
}
