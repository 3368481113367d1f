//! Plain TCP byte link

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use super::Link;

/// Unencrypted TCP link
pub(crate) struct PlainLink {
    stream: TcpStream,
}

impl PlainLink {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl Link for PlainLink {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn read_timeout(&self) -> io::Result<Option<Duration>> {
        self.stream.read_timeout()
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    fn shutdown(self: Box<Self>) {
        // The peer may already be gone.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
