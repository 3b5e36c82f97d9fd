// SPDX-License-Identifier: Apache-2.0

//! Status codes crossing the boundary

use core::fmt;

/// A status code as stored in [`CallArgs::result`](crate::call::CallArgs::result),
/// in the first field of a callee's output and in response frames
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// The operation succeeded
    Ok = 0,
    /// The operation failed without a more specific reason
    Failure = 1,
    /// A parameter failed validation
    InvalidParameter = 2,
    /// The requested table or function does not exist
    NotFound = 3,
    /// Sizes overflowed or memory could not be allocated
    OutOfMemory = 4,
    /// The peer broke the call contract
    Unexpected = 5,
    /// The peer does not handle the requested operation
    NotImplemented = 6,
}

impl Status {
    /// The status as a `Result`
    #[inline]
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Ok => Ok(()),
            Self::Failure => Err(Error::Failure),
            Self::InvalidParameter => Err(Error::InvalidParameter),
            Self::NotFound => Err(Error::NotFound),
            Self::OutOfMemory => Err(Error::OutOfMemory),
            Self::Unexpected => Err(Error::Unexpected),
            Self::NotImplemented => Err(Error::NotImplemented),
        }
    }
}

impl TryFrom<u32> for Status {
    type Error = Error;

    #[inline]
    fn try_from(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => Self::Ok,
            1 => Self::Failure,
            2 => Self::InvalidParameter,
            3 => Self::NotFound,
            4 => Self::OutOfMemory,
            5 => Self::Unexpected,
            6 => Self::NotImplemented,
            _ => return Err(Error::Unexpected),
        })
    }
}

impl From<Status> for u32 {
    #[inline(always)]
    fn from(status: Status) -> Self {
        status as u32
    }
}

impl<T> From<Result<T>> for Status {
    #[inline]
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(e) => e.into(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.into_result() {
            Ok(()) => f.write_str("success"),
            Err(e) => e.fmt(f),
        }
    }
}

/// A failed [`Status`]
#[derive(thiserror::Error, Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    #[error("operation failed")]
    Failure,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("table or function not found")]
    NotFound,
    #[error("out of memory")]
    OutOfMemory,
    #[error("unexpected response from the peer")]
    Unexpected,
    #[error("operation not implemented by the peer")]
    NotImplemented,
}

impl From<Error> for Status {
    #[inline]
    fn from(e: Error) -> Self {
        match e {
            Error::Failure => Self::Failure,
            Error::InvalidParameter => Self::InvalidParameter,
            Error::NotFound => Self::NotFound,
            Error::OutOfMemory => Self::OutOfMemory,
            Error::Unexpected => Self::Unexpected,
            Error::NotImplemented => Self::NotImplemented,
        }
    }
}

/// Result type returned by functionality exposed by this crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;
