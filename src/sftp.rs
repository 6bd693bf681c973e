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

//! The SFTP transport hook. The subsystem's file semantics live outside
//! this crate; what is guaranteed here is in-order delivery of the byte
//! stream and the length-prefixed request/reply framing riding on
//! CHANNEL_DATA.

use std;
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, BigEndian};

use super::Error;
use registry::{Shared, find_index, send_on};
use transport::Phase;

/// Handle to the `sftp` subsystem running on one connection's channel,
/// obtained from [`Ssh::init_sftp`](super::Ssh::init_sftp).
pub struct Sftp {
    shared: Arc<Shared>,
    channel: u32,
}

pub(crate) fn new_handle(shared: Arc<Shared>, channel: u32) -> Sftp {
    Sftp {
        shared: shared,
        channel: channel,
    }
}

impl Sftp {
    pub fn channel_id(&self) -> u32 {
        self.channel
    }

    /// Send raw subsystem bytes; framing is the caller's business.
    pub fn send(&self, data: &[u8]) -> Result<(), Error> {
        send_on(&self.shared, self.channel, data)
    }

    /// Wait for the next length-prefixed packet from the subsystem and
    /// return its body, consuming it from the stream. Packets come back
    /// in wire order. `timeout_s == 0` waits forever.
    pub fn read_packet(&self, timeout_s: u64) -> Option<Vec<u8>> {
        let deadline = if timeout_s > 0 {
            Some(Instant::now() + Duration::from_secs(timeout_s))
        } else {
            None
        };
        let mut guard = self.shared.registry.lock().unwrap();
        loop {
            {
                let reg = &mut *guard;
                let i = find_index(&reg.connections, self.channel)?;
                let conn = &mut reg.connections[i];
                let phase = conn.transport.phase;
                if let Some(enc) = conn.transport.enc() {
                    if let Some(ref mut channel) = enc.channel {
                        let avail = channel.received.len() - channel.sftp_cursor;
                        if avail >= 4 {
                            let len = BigEndian::read_u32(&channel.received
                                [channel.sftp_cursor..]) as usize;
                            if avail >= 4 + len {
                                let start = channel.sftp_cursor + 4;
                                let packet = channel.received[start..start + len].to_vec();
                                channel.sftp_cursor += 4 + len;
                                return Some(packet);
                            }
                        }
                    }
                }
                if phase == Phase::Closing || phase == Phase::Closed {
                    return None;
                }
            }
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return None;
                }
                let slice = std::cmp::min(Duration::from_millis(10), deadline - now);
                guard = self.shared.cond.wait_timeout(guard, slice).unwrap().0;
            } else {
                guard = self.shared
                    .cond
                    .wait_timeout(guard, Duration::from_millis(10))
                    .unwrap()
                    .0;
            }
        }
    }
}
