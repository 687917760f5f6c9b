use crate::error::{Error, Result};

use std::io::{BufRead as _, BufReader, Write as _};
use std::net::TcpStream;

/// A replikv client: a keep-alive session with a single node, sending one
/// command line at a time and reading response lines.
pub struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    /// Connects to a node.
    pub fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Ok(Self { reader: BufReader::new(stream.try_clone()?), writer: stream })
    }

    /// Clones the session, sharing the underlying connection. Used to read
    /// responses on a separate thread.
    pub fn try_clone(&self) -> Result<Self> {
        let stream = self.writer.try_clone()?;
        Ok(Self { reader: BufReader::new(stream.try_clone()?), writer: stream })
    }

    /// Sends a command line.
    pub fn send(&mut self, command: &str) -> Result<()> {
        self.writer.write_all(command.as_bytes())?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    /// Receives one response line, without its trailing newline.
    pub fn recv_line(&mut self) -> Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(Error::IO("server closed the connection".to_string()));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Sends a command and returns the first line of its response. Commands
    /// with multi-line responses (KEYS) should use send() and recv_line()
    /// directly.
    pub fn call(&mut self, command: &str) -> Result<String> {
        self.send(command)?;
        self.recv_line()
    }
}
