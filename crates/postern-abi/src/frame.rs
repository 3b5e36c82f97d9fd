// SPDX-License-Identifier: Apache-2.0

//! Fixed-size transport frames

use crate::status::{Error, Result, Status};

/// Number of `u64` words in a frame
pub const FRAME_WORDS: usize = 9;

/// Size of an encoded frame in bytes
pub const FRAME_SIZE: usize = FRAME_WORDS * core::mem::size_of::<u64>();

/// Number of request arguments
pub const ARGC: usize = 6;

/// The `kind` word of a frame
#[repr(u64)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    /// A forwarded syscall
    Syscall = 1,
    /// A call of a boundary [`Function`]
    Function = 2,
    /// The reply to the last request
    Response = 3,
}

impl TryFrom<u64> for Kind {
    type Error = Error;

    #[inline]
    fn try_from(raw: u64) -> Result<Self> {
        match raw {
            1 => Ok(Self::Syscall),
            2 => Ok(Self::Function),
            3 => Ok(Self::Response),
            _ => Err(Error::Unexpected),
        }
    }
}

/// Boundary functions carried by [`Request::Function`]
#[repr(u64)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Function {
    /// Host to guest: dispatch the [`CallArgs`](crate::call::CallArgs) at `arg0`
    CallEnclave = 1,
    /// Guest to host: dispatch the [`CallArgs`](crate::call::CallArgs) at `arg0`
    CallHost = 2,
    /// Guest to host: allocate `arg0` bytes of host-visible memory
    Malloc = 3,
    /// Guest to host: allocate `arg0 * arg1` zeroed bytes of host-visible memory
    Calloc = 4,
    /// Guest to host: release the host-visible allocation at `arg0`
    Free = 5,
    /// Host to guest: store [`Settings`](crate::call::Settings) at `arg0`
    GetSettings = 6,
    /// Either way: echo `arg0`
    Ping = 7,
    /// Host to guest: leave the serve loop with exit status `arg0`
    Terminate = 8,
    /// Guest to host: resize the host-visible allocation at `arg0` to `arg1`
    /// bytes, allocating if `arg0` is null
    Realloc = 9,
}

impl TryFrom<u64> for Function {
    type Error = Error;

    #[inline]
    fn try_from(raw: u64) -> Result<Self> {
        Ok(match raw {
            1 => Self::CallEnclave,
            2 => Self::CallHost,
            3 => Self::Malloc,
            4 => Self::Calloc,
            5 => Self::Free,
            6 => Self::GetSettings,
            7 => Self::Ping,
            8 => Self::Terminate,
            9 => Self::Realloc,
            _ => return Err(Error::NotImplemented),
        })
    }
}

/// A request frame
///
/// The number is kept raw so that a receiver can answer numbers it does not
/// know with [`Status::NotImplemented`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Syscall { num: u64, argv: [u64; ARGC] },
    Function { num: u64, argv: [u64; ARGC] },
}

impl Request {
    /// A function request with the given arguments, padded with zeroes
    ///
    /// Arguments beyond [`ARGC`] are dropped.
    pub fn function(function: Function, args: &[u64]) -> Self {
        let mut argv = [0; ARGC];
        for (slot, arg) in argv.iter_mut().zip(args) {
            *slot = *arg;
        }
        Self::Function {
            num: function as u64,
            argv,
        }
    }

    /// A syscall request
    pub fn syscall(num: u64, argv: [u64; ARGC]) -> Self {
        Self::Syscall { num, argv }
    }
}

/// A response frame
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// Whether the request was handled
    pub status: Status,
    /// The raw return value of the request
    pub ret: u64,
}

impl Response {
    #[inline]
    pub fn ok(ret: u64) -> Self {
        Self {
            status: Status::Ok,
            ret,
        }
    }

    #[inline]
    pub fn not_implemented() -> Self {
        Self::error(Error::NotImplemented)
    }

    #[inline]
    pub fn error(err: Error) -> Self {
        Self {
            status: err.into(),
            ret: 0,
        }
    }

    /// The return value if the request was handled
    #[inline]
    pub fn into_result(self) -> Result<u64> {
        self.status.into_result().map(|()| self.ret)
    }
}

/// One frame on the wire
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

impl Frame {
    /// Encodes the frame.
    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut words = [0u64; FRAME_WORDS];

        match self {
            Self::Request(Request::Syscall { num, argv }) => {
                words[0] = Kind::Syscall as u64;
                words[1] = *num;
                words[2..8].copy_from_slice(argv);
            }
            Self::Request(Request::Function { num, argv }) => {
                words[0] = Kind::Function as u64;
                words[1] = *num;
                words[2..8].copy_from_slice(argv);
            }
            Self::Response(Response { status, ret }) => {
                words[0] = Kind::Response as u64;
                words[1] = u32::from(*status).into();
                words[8] = *ret;
            }
        }

        let mut bytes = [0u8; FRAME_SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Decodes a frame.
    ///
    /// Unknown kinds and response statuses are [`Error::Unexpected`].
    pub fn decode(bytes: &[u8; FRAME_SIZE]) -> Result<Self> {
        let mut words = [0u64; FRAME_WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_le_bytes(raw);
        }

        let mut argv = [0u64; ARGC];
        argv.copy_from_slice(&words[2..8]);

        Ok(match Kind::try_from(words[0])? {
            Kind::Syscall => Self::Request(Request::Syscall {
                num: words[1],
                argv,
            }),
            Kind::Function => Self::Request(Request::Function {
                num: words[1],
                argv,
            }),
            Kind::Response => {
                let status = u32::try_from(words[1]).map_err(|_| Error::Unexpected)?;
                Self::Response(Response {
                    status: Status::try_from(status)?,
                    ret: words[8],
                })
            }
        })
    }
}
