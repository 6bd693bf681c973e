// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use std;
use std::io::BufRead;
use std::num::Wrapping;
use std::time::Instant;

use super::Error;
use super::cryptobuf::CryptoBuf;

/// One direction of a transport: the wire-byte buffer, the length of the
/// packet currently being read (0 between packets), the byte counter
/// feeding the rekey limits, and the sequence number. Sequence numbers
/// are never reset, they keep counting through rekeys.
#[derive(Debug)]
pub struct SSHBuffer {
    pub buffer: CryptoBuf,
    pub len: usize, // next packet length.
    pub bytes: usize,
    pub seqn: Wrapping<u32>,
}

impl SSHBuffer {
    pub fn new() -> Self {
        SSHBuffer {
            buffer: CryptoBuf::new(),
            len: 0,
            bytes: 0,
            seqn: Wrapping(0),
        }
    }

    pub fn send_ssh_id(&mut self, id: &[u8]) {
        self.buffer.extend(id);
        self.buffer.push(b'\r');
        self.buffer.push(b'\n');
    }

    /// Reads the peer's version line, skipping up to `junk_limit` pre-banner
    /// lines. Each line must stay under 256 bytes. Returns the id line
    /// (without CR LF), or None when more bytes are needed.
    pub fn read_ssh_id<R: BufRead>(&mut self,
                                   stream: &mut R,
                                   junk_limit: usize,
                                   junk_seen: &mut usize)
                                   -> Result<Option<Vec<u8>>, Error> {
        loop {
            let (consume, line) = {
                let buf = match stream.fill_buf() {
                    Ok(buf) => buf,
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        return Ok(None)
                    }
                    Err(e) => return Err(Error::IO(e)),
                };
                if buf.is_empty() {
                    return Err(Error::HUP);
                }
                match buf.iter().position(|&c| c == b'\n') {
                    Some(i) if i <= 255 => {
                        let mut line = &buf[..i];
                        if line.last() == Some(&b'\r') {
                            line = &line[..line.len() - 1];
                        }
                        if line.starts_with(b"SSH-") {
                            if line.starts_with(b"SSH-2.0-") {
                                (i + 1, Some(line.to_vec()))
                            } else {
                                return Err(Error::Version);
                            }
                        } else {
                            debug!("skipping pre-version line: {:?}",
                                   std::str::from_utf8(line));
                            *junk_seen += 1;
                            if *junk_seen > junk_limit {
                                return Err(Error::Version);
                            }
                            (i + 1, None)
                        }
                    }
                    Some(_) => return Err(Error::Version),
                    None => {
                        if buf.len() > 255 {
                            return Err(Error::Version);
                        }
                        return Ok(None);
                    }
                }
            };
            stream.consume(consume);
            self.bytes += consume;
            if let Some(line) = line {
                return Ok(Some(line));
            }
        }
    }
}

#[derive(Debug)]
pub struct SSHBuffers {
    pub read: SSHBuffer,
    pub write: SSHBuffer,
    pub write_cursor: usize,
    pub last_rekey: Instant,
}

impl SSHBuffers {
    pub fn new() -> Self {
        SSHBuffers {
            read: SSHBuffer::new(),
            write: SSHBuffer::new(),
            write_cursor: 0,
            last_rekey: Instant::now(),
        }
    }

    /// Returns true iff the write buffer has been completely written.
    pub fn write_all<W: std::io::Write>(&mut self, stream: &mut W) -> Result<bool, Error> {
        while self.write_cursor < self.write.buffer.len() {
            match self.write.buffer.write_all_from(self.write_cursor, stream) {
                Ok(s) => {
                    self.write_cursor += s;
                    self.write.bytes += s;
                    stream.flush()?;
                }
                Err(e) => {
                    if e.kind() == std::io::ErrorKind::WouldBlock {
                        return Ok(false); // need to wait for writability
                    } else {
                        return Err(Error::IO(e));
                    }
                }
            }
        }
        self.write.buffer.clear();
        self.write_cursor = 0;
        Ok(true)
    }

    pub fn needs_rekeying(&self, limits: &super::Limits) -> bool {
        self.write.bytes >= limits.rekey_write_limit ||
        self.read.bytes >= limits.rekey_read_limit ||
        self.last_rekey.elapsed() >= limits.rekey_time_limit
    }
}
