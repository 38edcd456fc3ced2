//! HTTP chunked-transfer-encoding decoder for upload sources.
//!
//! Some gateways hand the engine a request body still wearing its
//! `Transfer-Encoding: chunked` envelope. This decoder strips the framing
//! (`<hex size>\r\n<payload>\r\n` frames, a `0`-sized terminator, optional
//! trailer lines) and yields only payload bytes. It is a push state
//! machine: feed it arbitrary buffer fragments, collect payload slices.

use bytes::{Bytes, BytesMut};

use crate::error::IoError;

/// Longest accepted size line, chunk extensions included.
const MAX_SIZE_LINE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Reading the `<hex size>[;ext]\r\n` line.
    SizeLine,
    /// Reading payload bytes; the count still owed.
    Data(u64),
    /// Reading the `\r\n` that closes a payload frame.
    DataEnd,
    /// Reading trailer lines after the terminal frame.
    Trailer,
    /// Terminal frame and trailers consumed.
    Done,
}

/// Streaming decoder for the chunked transfer envelope.
pub(crate) struct ChunkedDecoder {
    state: State,
    line: BytesMut,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: State::SizeLine,
            line: BytesMut::new(),
        }
    }

    /// Whether the terminal frame has been fully consumed.
    pub fn finished(&self) -> bool {
        self.state == State::Done
    }

    /// Feed one buffer, collecting decoded payload slices.
    pub fn push(&mut self, data: &Bytes) -> Result<Vec<Bytes>, IoError> {
        let mut out = Vec::new();
        let mut pos = 0usize;

        while pos < data.len() {
            match self.state {
                State::SizeLine => {
                    pos = self.take_line(data, pos)?;
                    if let Some(line) = self.complete_line() {
                        let size = parse_size_line(&line)?;
                        self.state = if size == 0 {
                            State::Trailer
                        } else {
                            State::Data(size)
                        };
                    }
                }
                State::Data(remaining) => {
                    let take = (remaining as usize).min(data.len() - pos);
                    out.push(data.slice(pos..pos + take));
                    pos += take;
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        State::DataEnd
                    } else {
                        State::Data(left)
                    };
                }
                State::DataEnd => {
                    pos = self.take_line(data, pos)?;
                    if let Some(line) = self.complete_line() {
                        if !line.is_empty() {
                            return Err(bad_envelope("payload frame not closed by CRLF"));
                        }
                        self.state = State::SizeLine;
                    }
                }
                State::Trailer => {
                    pos = self.take_line(data, pos)?;
                    if let Some(line) = self.complete_line()
                        && line.is_empty()
                    {
                        self.state = State::Done;
                    }
                }
                State::Done => {
                    return Err(bad_envelope("bytes after the terminal frame"));
                }
            }
        }

        Ok(out)
    }

    /// Accumulate bytes of the current line up to and including `\n`.
    fn take_line(&mut self, data: &Bytes, mut pos: usize) -> Result<usize, IoError> {
        while pos < data.len() {
            let byte = data[pos];
            self.line.extend_from_slice(&[byte]);
            pos += 1;
            if byte == b'\n' {
                break;
            }
            if self.line.len() > MAX_SIZE_LINE {
                return Err(bad_envelope("envelope line too long"));
            }
        }
        Ok(pos)
    }

    /// The finished line without its CRLF, if one is buffered.
    fn complete_line(&mut self) -> Option<Vec<u8>> {
        if self.line.last() != Some(&b'\n') {
            return None;
        }
        let mut line = self.line.split().to_vec();
        line.pop(); // \n
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }
}

/// Parse `<hex size>[;extension]`.
fn parse_size_line(line: &[u8]) -> Result<u64, IoError> {
    let size_part = line
        .split(|&b| b == b';')
        .next()
        .unwrap_or_default();
    let text = std::str::from_utf8(size_part)
        .map_err(|_| bad_envelope("size line is not UTF-8"))?
        .trim();
    u64::from_str_radix(text, 16).map_err(|_| bad_envelope("size line is not hex"))
}

fn bad_envelope(reason: &str) -> IoError {
    IoError::Source(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("chunked transfer envelope: {reason}"),
    ))
}
