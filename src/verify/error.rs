use std::{backtrace::Backtrace, fmt};

use thiserror::Error;

use crate::{error::Status, resolve::PointerInfo};

/// The checker itself could not come to a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum InternalError {
    #[error("the MPI type combiner {0} is currently not supported")]
    UnsupportedCombiner(String),
    #[error("{0}")]
    UnsupportedCombinerArgs(String),
    /// Malformed combiner arguments
    #[error("{0}")]
    InvalidArgument(String),
    #[error("resolving the buffer failed: {0}")]
    Resolution(#[from] Status),
}

/// The buffer does not match the datatype.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("buffer too small ({actual} elements, {required} required)")]
    InsufficientBufferSize { actual: usize, required: usize },
    #[error("expected a type matching MPI type \"{mpi_type}\", but found type \"{type_name}\"")]
    BuiltinTypeMismatch {
        buffer: PointerInfo,
        type_name: String,
        mpi_type: String,
    },
    #[error("expected a struct type, but found type \"{type_name}\"")]
    BufferNotOfStructType { buffer: PointerInfo, type_name: String },
    #[error("expected {mpi_members} members, but the type \"{type_name}\" has {struct_members} members")]
    MemberCountMismatch {
        buffer: PointerInfo,
        type_name: String,
        struct_members: usize,
        mpi_members: usize,
    },
    #[error(
        "expected a byte offset of {mpi_offset} for member \"{member}\", but the type \"{type_name}\" has an offset of {struct_offset}"
    )]
    MemberOffsetMismatch {
        buffer: PointerInfo,
        type_name: String,
        member: String,
        struct_offset: usize,
        mpi_offset: i64,
    },
    #[error("the typecheck for member \"{member}\" failed ({error})")]
    MemberTypeMismatch {
        buffer: PointerInfo,
        member: String,
        error: Box<TypeError>,
    },
    #[error(
        "expected member \"{member}\" to have {mpi_count} element{}, but the type \"{member_type}\" of \"{member}\" has {buffer_count} element{}",
        plural(.mpi_count),
        plural(.buffer_count)
    )]
    MemberElementCountMismatch {
        buffer: PointerInfo,
        member: String,
        member_type: String,
        buffer_count: usize,
        mpi_count: usize,
    },
    /// The buffer failed, and so did every first member it wraps.
    #[error("{primary}. {}", join(.subtypes))]
    StructSubtypeErrors {
        primary: Box<TypeError>,
        subtypes: Vec<StructSubtypeMismatch>,
    },
}

/// One wrapper retry: `member` (the first member of `outer`) was checked in
/// place of the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructSubtypeMismatch {
    pub outer: PointerInfo,
    pub outer_name: String,
    pub member: PointerInfo,
    pub member_name: String,
    pub error: Box<TypeError>,
}

impl fmt::Display for StructSubtypeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tried the first member [{} x {}] of struct type \"{}\" with error: {}",
            self.member.count, self.member_name, self.outer_name, self.error
        )
    }
}

fn plural(n: &usize) -> &'static str {
    if *n == 1 {
        ""
    } else {
        "s"
    }
}

fn join(subtypes: &[StructSubtypeMismatch]) -> String {
    subtypes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(". ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckErrorKind {
    #[error(transparent)]
    Internal(#[from] InternalError),
    #[error(transparent)]
    Type(#[from] TypeError),
}

impl From<Status> for CheckErrorKind {
    fn from(status: Status) -> Self {
        CheckErrorKind::Internal(status.into())
    }
}

/// A failed buffer check, optionally with the call stack it failed on.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct CheckError {
    pub kind: CheckErrorKind,
    pub backtrace: Option<Backtrace>,
}

impl CheckError {
    pub fn new(kind: CheckErrorKind, capture_backtrace: bool) -> Self {
        Self {
            kind,
            backtrace: capture_backtrace.then(Backtrace::force_capture),
        }
    }

    pub fn is_type_error(&self) -> bool {
        matches!(self.kind, CheckErrorKind::Type(_))
    }

    /// Prefix for log lines, as `"type error "` or `"internal error "`.
    pub fn category(&self) -> &'static str {
        if self.is_type_error() {
            "type error "
        } else {
            "internal error "
        }
    }
}

impl From<CheckErrorKind> for CheckError {
    fn from(kind: CheckErrorKind) -> Self {
        Self::new(kind, false)
    }
}
