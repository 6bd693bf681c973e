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
use std::collections::VecDeque;

use cryptobuf::CryptoBuf;
use msg;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ChannelState {
    Opening,
    Open,
    EofSent,
    Closed,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ChannelMode {
    Shell,
    Exec,
    Subsystem,
}

/// Channel requests queued behind CHANNEL_OPEN; each waits for the
/// CHANNEL_SUCCESS of the previous one.
#[derive(Debug, Clone)]
pub enum Request {
    PtyReq,
    Shell,
    Exec(String),
    Subsystem(String),
}

/// The single session channel of a connection. The local id is the
/// connection's channel id in the registry.
#[derive(Debug)]
pub struct Channel {
    pub recipient_channel: u32,
    pub sender_channel: u32,
    /// Credit the peer has granted us.
    pub recipient_window_size: u32,
    /// Credit we have granted the peer.
    pub sender_window_size: u32,
    pub recipient_maximum_packet_size: u32,
    pub sender_maximum_packet_size: u32,
    initial_window_size: u32,
    pub state: ChannelState,
    pub mode: Option<ChannelMode>,
    pub pending_requests: VecDeque<Request>,
    /// A want-reply request is out and unanswered.
    pub request_in_flight: Option<Request>,

    /// Bytes received for the caller, appended under the registry lock,
    /// read by snapshot.
    pub received: Vec<u8>,
    /// How far the SFTP handle has consumed `received`.
    pub sftp_cursor: usize,
    pub cmd_complete: bool,
    pub exit_status: Option<u32>,
}

impl Channel {
    pub fn new(sender_channel: u32, window_size: u32, maxpacket: u32) -> Channel {
        Channel {
            recipient_channel: 0,
            sender_channel: sender_channel,
            recipient_window_size: 0,
            sender_window_size: window_size,
            recipient_maximum_packet_size: 0,
            sender_maximum_packet_size: maxpacket,
            initial_window_size: window_size,
            state: ChannelState::Opening,
            mode: None,
            pending_requests: VecDeque::new(),
            request_in_flight: None,
            received: Vec::new(),
            sftp_cursor: 0,
            cmd_complete: false,
            exit_status: None,
        }
    }

    pub fn open(&self, write: &mut CryptoBuf) {
        push_packet!(write, {
            write.push(msg::CHANNEL_OPEN);
            write.extend_ssh_string(b"session");
            write.push_u32_be(self.sender_channel);
            write.push_u32_be(self.sender_window_size);
            write.push_u32_be(self.sender_maximum_packet_size);
        });
    }

    /// Send the next queued request, if none is in flight. Returns false
    /// when the queue has drained.
    pub fn send_next_request(&mut self, write: &mut CryptoBuf) -> bool {
        if self.request_in_flight.is_some() {
            return true;
        }
        let req = match self.pending_requests.pop_front() {
            Some(req) => req,
            None => return false,
        };
        push_packet!(write, {
            write.push(msg::CHANNEL_REQUEST);
            write.push_u32_be(self.recipient_channel);
            match req {
                Request::PtyReq => {
                    write.extend_ssh_string(b"pty-req");
                    write.push(1); // want_reply
                    write.extend_ssh_string(b"xterm");
                    write.push_u32_be(80);
                    write.push_u32_be(24);
                    write.push_u32_be(0);
                    write.push_u32_be(0);
                    // Terminal modes: just TTY_OP_END.
                    write.extend_ssh_string(&[0]);
                }
                Request::Shell => {
                    write.extend_ssh_string(b"shell");
                    write.push(1);
                }
                Request::Exec(ref cmd) => {
                    write.extend_ssh_string(b"exec");
                    write.push(1);
                    write.extend_ssh_string(cmd.as_bytes());
                }
                Request::Subsystem(ref name) => {
                    write.extend_ssh_string(b"subsystem");
                    write.push(1);
                    write.extend_ssh_string(name.as_bytes());
                }
            }
        });
        self.request_in_flight = Some(req);
        true
    }

    /// Queue as much of `buf` as the peer's window and maximum packet
    /// size currently allow. Returns how much was consumed; the caller
    /// parks on the rest until a WINDOW_ADJUST arrives.
    pub fn data(&mut self, write: &mut CryptoBuf, mut buf: &[u8]) -> usize {
        let mut total = 0;
        while buf.len() > 0 && self.recipient_window_size > 0 {
            // Compute the length we're allowed to send.
            let off = std::cmp::min(buf.len(), self.recipient_maximum_packet_size as usize);
            let off = std::cmp::min(off, self.recipient_window_size as usize);
            push_packet!(write, {
                write.push(msg::CHANNEL_DATA);
                write.push_u32_be(self.recipient_channel);
                write.extend_ssh_string(&buf[..off]);
            });
            self.recipient_window_size -= off as u32;
            buf = &buf[off..];
            total += off;
        }
        total
    }

    /// Account for received payload bytes, and top the window back up
    /// once it falls below half of its initial value.
    pub fn adjust_window(&mut self, write: &mut CryptoBuf, data_len: usize) {
        self.sender_window_size = self.sender_window_size.saturating_sub(data_len as u32);
        if self.sender_window_size < self.initial_window_size / 2 {
            push_packet!(write, {
                write.push(msg::CHANNEL_WINDOW_ADJUST);
                write.push_u32_be(self.recipient_channel);
                write.push_u32_be(self.initial_window_size - self.sender_window_size);
            });
            self.sender_window_size = self.initial_window_size;
        }
    }

    pub fn eof(&mut self, write: &mut CryptoBuf) {
        if self.state == ChannelState::Open {
            push_packet!(write, {
                write.push(msg::CHANNEL_EOF);
                write.push_u32_be(self.recipient_channel);
            });
            self.state = ChannelState::EofSent;
        }
    }

    pub fn close(&mut self, write: &mut CryptoBuf) {
        if self.state != ChannelState::Closed {
            push_packet!(write, {
                write.push(msg::CHANNEL_CLOSE);
                write.push_u32_be(self.recipient_channel);
            });
            self.state = ChannelState::Closed;
        }
    }

    /// Substring search over the receive buffer, from the tail backwards
    /// (recent output is what callers wait for).
    pub fn find_backwards(&self, pattern: &[u8]) -> bool {
        if pattern.is_empty() || pattern.len() > self.received.len() {
            return false;
        }
        let mut i = self.received.len() - pattern.len();
        loop {
            if &self.received[i..i + pattern.len()] == pattern {
                return true;
            }
            if i == 0 {
                return false;
            }
            i -= 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn open_channel() -> Channel {
        let mut c = Channel::new(1, 0x7fffffff, 0x4000);
        c.recipient_channel = 99;
        c.recipient_window_size = 0x100000;
        c.recipient_maximum_packet_size = 0x4000;
        c.state = ChannelState::Open;
        c
    }

    fn parse_packets(write: &CryptoBuf) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        let mut i = 0;
        while i < write.len() {
            let len = write.read_u32_be(i) as usize;
            packets.push(write.as_slice()[i + 4..i + 4 + len].to_vec());
            i += 4 + len;
        }
        packets
    }

    #[test]
    fn data_splits_at_max_packet() {
        let mut c = open_channel();
        let mut write = CryptoBuf::new();
        let payload = vec![0x7a; 0x4000 * 2 + 100];
        let sent = c.data(&mut write, &payload);
        assert_eq!(sent, payload.len());

        let packets = parse_packets(&write);
        assert_eq!(packets.len(), 3);
        let mut reassembled = Vec::new();
        for p in &packets {
            assert_eq!(p[0], msg::CHANNEL_DATA);
            use encoding::Reader;
            let mut r = p[..].reader(1);
            assert_eq!(r.read_u32().unwrap(), 99);
            let chunk = r.read_string().unwrap();
            assert!(chunk.len() <= 0x4000);
            reassembled.extend_from_slice(chunk);
        }
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn data_respects_the_window() {
        let mut c = open_channel();
        c.recipient_window_size = 10;
        let mut write = CryptoBuf::new();
        let sent = c.data(&mut write, b"0123456789abcdef");
        assert_eq!(sent, 10);
        assert_eq!(c.recipient_window_size, 0);
        // Window closed: nothing more goes out.
        let sent = c.data(&mut write, b"abcdef");
        assert_eq!(sent, 0);
    }

    #[test]
    fn window_adjust_is_emitted_below_half() {
        let mut c = Channel::new(1, 1000, 0x4000);
        c.recipient_channel = 7;
        c.state = ChannelState::Open;
        let mut write = CryptoBuf::new();

        c.adjust_window(&mut write, 400);
        assert_eq!(write.len(), 0);
        assert_eq!(c.sender_window_size, 600);

        c.adjust_window(&mut write, 200);
        let packets = parse_packets(&write);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0][0], msg::CHANNEL_WINDOW_ADJUST);
        use encoding::Reader;
        let mut r = packets[0][..].reader(1);
        assert_eq!(r.read_u32().unwrap(), 7);
        assert_eq!(r.read_u32().unwrap(), 600);
        assert_eq!(c.sender_window_size, 1000);
    }

    #[test]
    fn open_packet_layout() {
        let c = Channel::new(3, 0x7fffffff, 0x4000);
        let mut write = CryptoBuf::new();
        c.open(&mut write);
        let packets = parse_packets(&write);
        use encoding::Reader;
        let mut r = packets[0][..].reader(0);
        assert_eq!(r.read_byte().unwrap(), msg::CHANNEL_OPEN);
        assert_eq!(r.read_string().unwrap(), b"session");
        assert_eq!(r.read_u32().unwrap(), 3);
        assert_eq!(r.read_u32().unwrap(), 0x7fffffff);
        assert_eq!(r.read_u32().unwrap(), 0x4000);
    }

    #[test]
    fn requests_run_one_at_a_time() {
        let mut c = open_channel();
        c.pending_requests.push_back(Request::PtyReq);
        c.pending_requests.push_back(Request::Shell);
        let mut write = CryptoBuf::new();

        assert!(c.send_next_request(&mut write));
        assert_eq!(parse_packets(&write).len(), 1);
        // Second call does nothing while the first is unanswered.
        assert!(c.send_next_request(&mut write));
        assert_eq!(parse_packets(&write).len(), 1);

        c.request_in_flight = None; // CHANNEL_SUCCESS came in
        assert!(c.send_next_request(&mut write));
        assert_eq!(parse_packets(&write).len(), 2);

        c.request_in_flight = None;
        assert!(!c.send_next_request(&mut write));
    }

    #[test]
    fn tail_search() {
        let mut c = open_channel();
        c.received.extend_from_slice(b"login:\r\nwelcome\r\nhello\r\n");
        assert!(c.find_backwards(b"hello"));
        assert!(c.find_backwards(b"login:"));
        assert!(!c.find_backwards(b"goodbye"));
        assert!(!c.find_backwards(b""));
    }
}
