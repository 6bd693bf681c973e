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

use byteorder::{ByteOrder, BigEndian};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use md5::Md5;

use super::Error;
use super::cryptobuf::CryptoBuf;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Name(pub &'static str);
impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

pub const HMAC_MD5: Name = Name("hmac-md5");
pub const HMAC_SHA1: Name = Name("hmac-sha1");
pub const NONE: Name = Name("none");

pub const NAMES: [Name; 3] = [HMAC_MD5, HMAC_SHA1, NONE];

pub fn key_len(name: Name) -> usize {
    match name {
        HMAC_MD5 => 16,
        HMAC_SHA1 => 20,
        _ => 0,
    }
}

pub fn mac_len(name: Name) -> usize {
    match name {
        HMAC_MD5 => 16,
        HMAC_SHA1 => 20,
        _ => 0,
    }
}

/// One direction's integrity key. The MAC input is the sequence number as
/// a big-endian u32 followed by the unencrypted packet.
pub struct MacKey {
    name: Name,
    key: CryptoBuf,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(fmt, "MacKey({:?})", self.name.0)
    }
}

impl MacKey {
    pub fn new(name: Name, key: &[u8]) -> MacKey {
        let mut k = CryptoBuf::new();
        k.extend(key);
        MacKey { name: name, key: k }
    }

    pub fn mac_len(&self) -> usize {
        mac_len(self.name)
    }

    pub fn sign(&self, seqn: u32, packet: &[u8], tag_out: &mut [u8]) -> Result<(), Error> {
        let mut seq = [0; 4];
        BigEndian::write_u32(&mut seq, seqn);
        match self.name {
            HMAC_SHA1 => {
                let mut h = Hmac::<Sha1>::new_from_slice(self.key.as_slice())
                    .map_err(|_| Error::Inconsistent)?;
                h.update(&seq);
                h.update(packet);
                tag_out.copy_from_slice(&h.finalize().into_bytes());
            }
            HMAC_MD5 => {
                let mut h = Hmac::<Md5>::new_from_slice(self.key.as_slice())
                    .map_err(|_| Error::Inconsistent)?;
                h.update(&seq);
                h.update(packet);
                tag_out.copy_from_slice(&h.finalize().into_bytes());
            }
            _ => {}
        }
        Ok(())
    }

    /// Constant-time comparison, through `hmac`'s `verify_slice`.
    pub fn verify(&self, seqn: u32, packet: &[u8], tag: &[u8]) -> Result<(), Error> {
        let mut seq = [0; 4];
        BigEndian::write_u32(&mut seq, seqn);
        match self.name {
            HMAC_SHA1 => {
                let mut h = Hmac::<Sha1>::new_from_slice(self.key.as_slice())
                    .map_err(|_| Error::Inconsistent)?;
                h.update(&seq);
                h.update(packet);
                h.verify_slice(tag).map_err(|_| Error::PacketAuth)
            }
            HMAC_MD5 => {
                let mut h = Hmac::<Md5>::new_from_slice(self.key.as_slice())
                    .map_err(|_| Error::Inconsistent)?;
                h.update(&seq);
                h.update(packet);
                h.verify_slice(tag).map_err(|_| Error::PacketAuth)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        for &name in &[HMAC_SHA1, HMAC_MD5] {
            let key = MacKey::new(name, &vec![0x0b; key_len(name)]);
            let mut tag = vec![0; mac_len(name)];
            key.sign(3, b"Hi There", &mut tag).unwrap();
            key.verify(3, b"Hi There", &tag).unwrap();
        }
    }

    #[test]
    fn tampering_is_detected() {
        let key = MacKey::new(HMAC_SHA1, &[0x0b; 20]);
        let mut tag = [0; 20];
        key.sign(3, b"Hi There", &mut tag).unwrap();
        match key.verify(4, b"Hi There", &tag) {
            Err(Error::PacketAuth) => {}
            other => panic!("wrong sequence number accepted: {:?}", other),
        }
        tag[0] ^= 1;
        match key.verify(3, b"Hi There", &tag) {
            Err(Error::PacketAuth) => {}
            other => panic!("flipped tag accepted: {:?}", other),
        }
    }

    #[test]
    fn none_accepts_anything() {
        let key = MacKey::new(NONE, b"");
        assert_eq!(key.mac_len(), 0);
        key.verify(0, b"payload", b"").unwrap();
    }
}
