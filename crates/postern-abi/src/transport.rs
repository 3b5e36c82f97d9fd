// SPDX-License-Identifier: Apache-2.0

//! Synchronous request/response transport

use crate::frame::{Frame, Request, Response, FRAME_SIZE};

use std::io::{self, Read, Write};

/// A blocking, duplex frame channel
///
/// Every request is answered by exactly one response. A side waiting for its
/// response serves any requests the peer sends in the meantime.
pub trait Transport {
    /// Sends one frame.
    fn send(&mut self, frame: &Frame) -> io::Result<()>;

    /// Blocks until one frame arrives.
    fn recv(&mut self) -> io::Result<Frame>;

    /// Sends `request` and blocks for its response, answering nested
    /// requests from the peer with `serve`.
    fn call<F>(&mut self, request: Request, mut serve: F) -> io::Result<Response>
    where
        Self: Sized,
        F: FnMut(&mut Self, Request) -> Response,
    {
        self.send(&Frame::Request(request))?;

        loop {
            match self.recv()? {
                Frame::Response(response) => return Ok(response),
                Frame::Request(nested) => {
                    let response = serve(self, nested);
                    self.send(&Frame::Response(response))?;
                }
            }
        }
    }
}

/// A [`Transport`] over any byte stream
#[derive(Debug)]
pub struct Channel<S> {
    stream: S,
}

impl<S> Channel<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

impl<S: Read + Write> Transport for Channel<S> {
    fn send(&mut self, frame: &Frame) -> io::Result<()> {
        self.stream.write_all(&frame.encode())?;
        self.stream.flush()
    }

    fn recv(&mut self) -> io::Result<Frame> {
        let mut bytes = [0u8; FRAME_SIZE];
        self.stream.read_exact(&mut bytes)?;
        Frame::decode(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
