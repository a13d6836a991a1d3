use Result;

use bufstream::BufStream;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use connstring::Host;

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

// Replies longer than this are assumed to be stream corruption.
const MAX_FRAME_SIZE: u32 = 48 * 1000 * 1000;

/// Encapsulates the functionality for how to connect to the server.
#[derive(Debug, Clone)]
pub enum StreamConnector {
    /// Connect to the server through a TCP stream.
    Tcp,
    /// Produce in-memory streams that connect instantly and carry no
    /// traffic. Used by tests that exercise pool and topology behavior
    /// without servers.
    Mock,
}

impl Default for StreamConnector {
    fn default() -> Self {
        StreamConnector::Tcp
    }
}

impl StreamConnector {
    /// Opens a stream to the given host, failing if the transport cannot be
    /// established within `timeout`.
    pub fn connect(&self, host: &Host, timeout: Duration) -> Result<Stream> {
        match *self {
            StreamConnector::Tcp => {
                let mut last_err = io::Error::new(io::ErrorKind::NotFound,
                                                  format!("Failed to resolve '{}'.", host));

                for addr in (&host.host_name[..], host.port).to_socket_addrs()? {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(socket) => return Ok(Stream::Tcp(BufStream::new(socket))),
                        Err(err) => last_err = err,
                    }
                }

                Err(last_err.into())
            }
            StreamConnector::Mock => Ok(Stream::Mock(MockStream::new())),
        }
    }
}

/// An in-memory stand-in for a transport connection. Replies are scripted;
/// an unscripted request fails the way a dropped socket would.
pub struct MockStream {
    replies: VecDeque<Vec<u8>>,
    pub sent: Vec<Vec<u8>>,
}

impl MockStream {
    pub fn new() -> MockStream {
        MockStream {
            replies: VecDeque::new(),
            sent: Vec::new(),
        }
    }

    /// Queues a reply for a future request.
    pub fn push_reply(&mut self, reply: Vec<u8>) {
        self.replies.push_back(reply);
    }
}

/// One transport connection. The payload bytes exchanged over it are opaque
/// to this crate.
pub enum Stream {
    Tcp(BufStream<TcpStream>),
    Mock(MockStream),
}

impl Stream {
    /// Sends one opaque request and reads one opaque reply, bounded by
    /// `timeout`. Frames are a little-endian length prefix followed by the
    /// payload.
    pub fn send_receive(&mut self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        match *self {
            Stream::Tcp(ref mut buffered) => {
                {
                    let socket = buffered.get_ref();
                    socket.set_write_timeout(Some(timeout))?;
                    socket.set_read_timeout(Some(timeout))?;
                }

                buffered.write_u32::<LittleEndian>(payload.len() as u32)?;
                buffered.write_all(payload)?;
                buffered.flush()?;

                let len = buffered.read_u32::<LittleEndian>()?;
                if len > MAX_FRAME_SIZE {
                    return Err(io::Error::new(io::ErrorKind::InvalidData,
                                              format!("Reply frame of {} bytes exceeds the \
                                                       maximum message size.", len)).into());
                }

                let mut reply = vec![0u8; len as usize];
                buffered.read_exact(&mut reply)?;
                Ok(reply)
            }
            Stream::Mock(ref mut mock) => {
                mock.sent.push(payload.to_vec());
                match mock.replies.pop_front() {
                    Some(reply) => Ok(reply),
                    None => Err(io::Error::new(io::ErrorKind::ConnectionReset,
                                               "Mock stream has no scripted reply.").into()),
                }
            }
        }
    }

    /// Closes the underlying transport. Errors on teardown are ignored.
    pub fn close(&mut self) {
        if let Stream::Tcp(ref mut buffered) = *self {
            let _ = buffered.get_ref().shutdown(Shutdown::Both);
        }
    }

    /// A second handle to the underlying socket, usable to shut it down
    /// from another thread while this one is blocked on a read.
    pub fn tcp_handle(&self) -> Option<TcpStream> {
        match *self {
            Stream::Tcp(ref buffered) => buffered.get_ref().try_clone().ok(),
            Stream::Mock(_) => None,
        }
    }
}
