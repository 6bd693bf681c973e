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
use std::time::Instant;

use byteorder::{ByteOrder, BigEndian};
use rand::rngs::StdRng;

use super::{Error, Limits};
use cryptobuf::CryptoBuf;
use sshbuffer::SSHBuffers;
use negociation::Names;
use kex;
use cipher;
use channel::Channel;

/// The transcript of the key exchange in flight. Version strings survive
/// rekeys; the KEXINIT payloads and ephemeral values are per-exchange.
#[derive(Debug)]
pub struct Exchange {
    pub client_id: CryptoBuf,
    pub server_id: CryptoBuf,
    pub client_kex_init: CryptoBuf,
    pub server_kex_init: CryptoBuf,
    pub client_ephemeral: CryptoBuf,
    pub server_ephemeral: CryptoBuf,
}

impl Exchange {
    pub fn new() -> Self {
        Exchange {
            client_id: CryptoBuf::new(),
            server_id: CryptoBuf::new(),
            client_kex_init: CryptoBuf::new(),
            server_kex_init: CryptoBuf::new(),
            client_ephemeral: CryptoBuf::new(),
            server_ephemeral: CryptoBuf::new(),
        }
    }
}

#[derive(Debug)]
pub enum Kex {
    /// Our KEXINIT may have been sent; waiting for the server's.
    KexInit(KexInit),

    /// Algorithms are agreed and KEXDH_INIT is out; waiting for
    /// KEXDH_REPLY.
    KexDhDone(KexDhDone),

    /// The DH is over and our NEWKEYS is out; waiting for the server's
    /// NEWKEYS.
    NewKeys(NewKeys),
}

#[derive(Debug)]
pub struct KexInit {
    pub exchange: Exchange,
    pub session_id: Option<kex::Digest>,
    pub sent: bool,
}

impl KexInit {
    /// Start a rekey from an established session, keeping the version
    /// strings and the session id.
    pub fn rekey(ex: Exchange, session_id: &kex::Digest, sent: bool) -> Self {
        let mut kexinit = KexInit {
            exchange: ex,
            session_id: Some(session_id.clone()),
            sent: sent,
        };
        kexinit.exchange.client_kex_init.clear();
        kexinit.exchange.server_kex_init.clear();
        kexinit.exchange.client_ephemeral.clear();
        kexinit.exchange.server_ephemeral.clear();
        kexinit
    }
}

#[derive(Debug)]
pub struct KexDhDone {
    pub exchange: Exchange,
    pub names: Names,
    pub kex: kex::Algorithm,
    pub session_id: Option<kex::Digest>,
}

impl KexDhDone {
    pub fn compute_keys(self,
                        hash: kex::Digest,
                        buffer: &mut CryptoBuf)
                        -> Result<NewKeys, Error> {
        // The session id is the hash of the first exchange, whatever
        // rekeys happen later.
        let session_id = if let Some(session_id) = self.session_id {
            session_id
        } else {
            hash.clone()
        };
        let cipher = self.kex.compute_keys(&session_id, &hash, buffer, &self.names)?;
        Ok(NewKeys {
            exchange: self.exchange,
            names: self.names,
            kex: self.kex,
            cipher: cipher,
            session_id: session_id,
            received: false,
            sent: false,
        })
    }
}

#[derive(Debug)]
pub struct NewKeys {
    pub exchange: Exchange,
    pub names: Names,
    pub kex: kex::Algorithm,
    pub cipher: cipher::CipherPair,
    pub session_id: kex::Digest,
    pub received: bool,
    pub sent: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum EncryptedState {
    WaitingServiceAccept,
    WaitingAuthRequest,
    Authenticated,
}

/// Session state once the first NEWKEYS pair has been installed.
#[derive(Debug)]
pub struct Encrypted {
    pub state: EncryptedState,

    // It's always Some, except when we std::mem::replace it temporarily.
    pub exchange: Option<Exchange>,
    pub session_id: kex::Digest,
    pub names: Names,
    pub rekey: Option<Kex>,
    pub channel: Option<Channel>,

    /// Queue of length-prefixed plaintext packets, sealed by `flush`.
    /// Channel data sits here while a rekey is in progress.
    pub write: CryptoBuf,
    pub write_cursor: usize,
}

impl Encrypted {
    pub fn new(newkeys: &NewKeys) -> Encrypted {
        Encrypted {
            state: EncryptedState::WaitingServiceAccept,
            exchange: None,
            session_id: newkeys.session_id.clone(),
            names: newkeys.names,
            rekey: None,
            channel: None,
            write: CryptoBuf::new(),
            write_cursor: 0,
        }
    }

    /// Seal queued plaintext packets into the wire buffer. Returns true
    /// when a rekey limit was reached; the remaining packets stay queued
    /// until the rekey finishes.
    pub fn flush(&mut self,
                 limits: &Limits,
                 cipher: &mut cipher::CipherPair,
                 buffers: &mut SSHBuffers,
                 rng: &mut StdRng)
                 -> bool {
        if self.rekey.is_some() {
            return false;
        }
        while self.write_cursor < self.write.len() {
            if buffers.needs_rekeying(limits) {
                // Resetting those now is not strictly correct (we're
                // resetting before the rekeying), but since the bytes
                // sent during rekeying are counted, the limits remain an
                // upper bound on what a key epoch can carry.
                buffers.write.bytes = 0;
                buffers.read.bytes = 0;
                buffers.last_rekey = Instant::now();
                return true;
            }
            let len = BigEndian::read_u32(&self.write.as_slice()[self.write_cursor..]) as usize;
            {
                let packet =
                    &self.write.as_slice()[(self.write_cursor + 4)..(self.write_cursor + 4 + len)];
                cipher.write(packet, &mut buffers.write, rng);
            }
            self.write_cursor += 4 + len
        }
        if self.write_cursor >= self.write.len() {
            // If all packets have been written, clear.
            self.write_cursor = 0;
            self.write.clear();
        }
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn flush_seals_queued_packets() {
        let mut enc = Encrypted {
            state: EncryptedState::Authenticated,
            exchange: None,
            session_id: kex::Digest::Sha1([0; 20]),
            names: ::negociation::Names {
                kex: ::kex::DH_GROUP1_SHA1,
                key: ::key::SSH_RSA,
                cipher: ::cipher::AES128_CBC,
                mac: ::mac::NONE,
                ignore_guessed: false,
            },
            rekey: None,
            channel: None,
            write: CryptoBuf::new(),
            write_cursor: 0,
        };
        push_packet!(enc.write, {
            enc.write.push(::msg::IGNORE);
        });
        let mut cipher = cipher::CipherPair::clear();
        let mut buffers = SSHBuffers::new();
        let mut rng = StdRng::seed_from_u64(5);
        let limits = Limits::default();

        assert!(!enc.flush(&limits, &mut cipher, &mut buffers, &mut rng));
        assert!(buffers.write.buffer.len() >= 16);
        assert_eq!(buffers.write.seqn.0, 1);
        assert_eq!(enc.write.len(), 0);
        assert_eq!(enc.write_cursor, 0);
    }

    #[test]
    fn flush_stops_at_rekey_limit() {
        let mut enc = Encrypted {
            state: EncryptedState::Authenticated,
            exchange: None,
            session_id: kex::Digest::Sha1([0; 20]),
            names: ::negociation::Names {
                kex: ::kex::DH_GROUP1_SHA1,
                key: ::key::SSH_RSA,
                cipher: ::cipher::AES128_CBC,
                mac: ::mac::NONE,
                ignore_guessed: false,
            },
            rekey: None,
            channel: None,
            write: CryptoBuf::new(),
            write_cursor: 0,
        };
        push_packet!(enc.write, {
            enc.write.push(::msg::IGNORE);
        });
        let mut cipher = cipher::CipherPair::clear();
        let mut buffers = SSHBuffers::new();
        buffers.write.bytes = 2 << 30;
        let mut rng = StdRng::seed_from_u64(5);
        let limits = Limits::default();

        assert!(enc.flush(&limits, &mut cipher, &mut buffers, &mut rng));
        // Nothing was sealed, the packet stays queued for after the rekey.
        assert_eq!(buffers.write.buffer.len(), 0);
        assert!(enc.write.len() > 0);
        // Counters were rearmed for the next epoch.
        assert_eq!(buffers.write.bytes, 0);
    }
}
