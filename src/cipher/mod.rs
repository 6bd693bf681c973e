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

use rand::rngs::StdRng;
use rand::RngCore;

use super::Error;
use super::cryptobuf::CryptoBuf;
use super::sshbuffer::SSHBuffer;
use super::mac::MacKey;

pub mod block;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Name(pub &'static str);
impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

pub const AES128_CBC: Name = Name("aes128-cbc");
pub const AES192_CBC: Name = Name("aes192-cbc");
pub const AES256_CBC: Name = Name("aes256-cbc");
pub const TRIPLE_DES_CBC: Name = Name("3des-cbc");
pub const BLOWFISH_CBC: Name = Name("blowfish-cbc");
pub const CAST128_CBC: Name = Name("cast128-cbc");
pub const TWOFISH_CBC: Name = Name("twofish-cbc");
pub const TWOFISH256_CBC: Name = Name("twofish256-cbc");

pub const NAMES: [Name; 8] = [AES256_CBC,
                              AES192_CBC,
                              TWOFISH_CBC,
                              TWOFISH256_CBC,
                              BLOWFISH_CBC,
                              TRIPLE_DES_CBC,
                              AES128_CBC,
                              CAST128_CBC];

pub fn key_size(c: Name) -> usize {
    match c {
        AES128_CBC => 16,
        AES192_CBC => 24,
        AES256_CBC => 32,
        TRIPLE_DES_CBC => 24,
        BLOWFISH_CBC => 16,
        CAST128_CBC => 16,
        // "twofish-cbc" is the 256-bit variant, see the secsh transport
        // draft; "twofish128-cbc" would be the 128-bit one.
        TWOFISH_CBC => 32,
        TWOFISH256_CBC => 32,
        _ => 0,
    }
}

pub fn block_size(c: Name) -> usize {
    match c {
        AES128_CBC | AES192_CBC | AES256_CBC => 16,
        TWOFISH_CBC | TWOFISH256_CBC => 16,
        TRIPLE_DES_CBC | BLOWFISH_CBC | CAST128_CBC => 8,
        _ => 8,
    }
}

/// Local-to-remote context: the CBC encryptor and the MAC key of the
/// current epoch, replaced together on rekey.
pub enum SealingCipher {
    Clear,
    Block { enc: block::Enc, mac: MacKey },
}

/// Remote-to-local context.
pub enum OpeningCipher {
    Clear,
    Block { dec: block::Dec, mac: MacKey },
}

impl std::fmt::Debug for SealingCipher {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        match *self {
            SealingCipher::Clear => fmt.write_str("Clear"),
            SealingCipher::Block { ref mac, .. } => write!(fmt, "Block {{ mac: {:?} }}", mac),
        }
    }
}
impl std::fmt::Debug for OpeningCipher {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        match *self {
            OpeningCipher::Clear => fmt.write_str("Clear"),
            OpeningCipher::Block { ref mac, .. } => write!(fmt, "Block {{ mac: {:?} }}", mac),
        }
    }
}

// RFC 4253 makes reference to "the cipher block size or 8, whichever is
// larger" when specifying how the padding works. This is the "8" in "or 8".
const MINIMUM_BLOCK_SIZE_FOR_PADDING: usize = 8;

const MINIMUM_PACKET_LEN: usize = 16;

pub const PACKET_LENGTH_LEN: usize = 4;

const PADDING_LENGTH_LEN: usize = 1;

/// Hard cap on the length field of an inbound packet; anything larger is
/// treated as a protocol violation rather than an allocation request.
pub const MAX_PACKET_LENGTH: usize = 1 << 20;

impl SealingCipher {
    fn block_size(&self) -> usize {
        match *self {
            SealingCipher::Clear => MINIMUM_BLOCK_SIZE_FOR_PADDING,
            SealingCipher::Block { ref enc, .. } => {
                std::cmp::max(enc.block_size(), MINIMUM_BLOCK_SIZE_FOR_PADDING)
            }
        }
    }
    fn mac_len(&self) -> usize {
        match *self {
            SealingCipher::Clear => 0,
            SealingCipher::Block { ref mac, .. } => mac.mac_len(),
        }
    }
}

impl OpeningCipher {
    fn block_size(&self) -> usize {
        match *self {
            OpeningCipher::Clear => MINIMUM_BLOCK_SIZE_FOR_PADDING,
            OpeningCipher::Block { ref dec, .. } => {
                std::cmp::max(dec.block_size(), MINIMUM_BLOCK_SIZE_FOR_PADDING)
            }
        }
    }
    fn mac_len(&self) -> usize {
        match *self {
            OpeningCipher::Clear => 0,
            OpeningCipher::Block { ref mac, .. } => mac.mac_len(),
        }
    }
    fn decrypt(&mut self, data: &mut [u8]) {
        if let OpeningCipher::Block { ref mut dec, .. } = *self {
            dec.decrypt(data)
        }
    }
    fn verify(&self, seqn: u32, packet: &[u8], tag: &[u8]) -> Result<(), Error> {
        match *self {
            OpeningCipher::Clear => Ok(()),
            OpeningCipher::Block { ref mac, .. } => mac.verify(seqn, packet, tag),
        }
    }
}

pub struct CipherPair {
    pub local_to_remote: SealingCipher,
    pub remote_to_local: OpeningCipher,
}

impl std::fmt::Debug for CipherPair {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(fmt,
               "CipherPair {{ local_to_remote: {:?}, remote_to_local: {:?} }}",
               self.local_to_remote,
               self.remote_to_local)
    }
}

impl CipherPair {
    /// The pre-NEWKEYS state: no encryption, no MAC.
    pub fn clear() -> CipherPair {
        CipherPair {
            local_to_remote: SealingCipher::Clear,
            remote_to_local: OpeningCipher::Clear,
        }
    }

    /// Fills the read buffer from the stream, without consuming bytes past
    /// `target`. Returns false if the stream would block first.
    fn fill(stream: &mut dyn BufRead, buffer: &mut SSHBuffer, target: usize)
            -> Result<bool, Error> {
        while buffer.buffer.len() < target {
            let consumed = match stream.fill_buf() {
                Ok(buf) => {
                    if buf.is_empty() {
                        // EOF in the middle of a packet.
                        return Err(Error::HUP);
                    }
                    let n = std::cmp::min(buf.len(), target - buffer.buffer.len());
                    buffer.buffer.extend(&buf[..n]);
                    n
                }
                Err(e) => {
                    if e.kind() == std::io::ErrorKind::WouldBlock {
                        return Ok(false);
                    } else {
                        return Err(Error::IO(e));
                    }
                }
            };
            stream.consume(consumed);
            buffer.bytes += consumed;
        }
        Ok(true)
    }

    /// Reads one binary packet: decrypt the first block, read the length,
    /// read and decrypt the remainder, verify the MAC, strip the padding.
    /// Returns true when `payload` holds a complete packet payload; false
    /// when the stream ran dry mid-packet (come back on the next readable
    /// event).
    pub fn read(&mut self,
                stream: &mut dyn BufRead,
                buffer: &mut SSHBuffer,
                payload: &mut CryptoBuf)
                -> Result<bool, Error> {
        let block_size = self.remote_to_local.block_size();
        let mac_len = self.remote_to_local.mac_len();

        if buffer.len == 0 {
            if !CipherPair::fill(stream, buffer, block_size)? {
                return Ok(false);
            }
            {
                let buf = buffer.buffer.as_mut_slice();
                self.remote_to_local.decrypt(&mut buf[..block_size]);
            }
            let packet_length = buffer.buffer.read_u32_be(0) as usize;
            if packet_length > MAX_PACKET_LENGTH {
                return Err(Error::OversizedPacket);
            }
            if packet_length < PADDING_LENGTH_LEN + 4 ||
               (packet_length + PACKET_LENGTH_LEN) % block_size != 0 {
                return Err(Error::Inconsistent);
            }
            buffer.len = PACKET_LENGTH_LEN + packet_length + mac_len;
            debug!("buffer len: {:?}", buffer.len);
        }

        if !CipherPair::fill(stream, buffer, buffer.len)? {
            return Ok(false);
        }

        let seqn = buffer.seqn.0;
        let ciphertext_len = buffer.len - mac_len;
        {
            let buf = buffer.buffer.as_mut_slice();
            self.remote_to_local.decrypt(&mut buf[block_size..ciphertext_len]);
        }
        {
            let buf = buffer.buffer.as_slice();
            let (plaintext, tag) = buf[..buffer.len].split_at(ciphertext_len);
            self.remote_to_local.verify(seqn, plaintext, tag)?;
        }

        let packet_length = buffer.buffer.read_u32_be(0) as usize;
        let padding_length = buffer.buffer[PACKET_LENGTH_LEN] as usize;
        let payload_end = (PACKET_LENGTH_LEN + packet_length)
            .checked_sub(padding_length)
            .ok_or(Error::IndexOutOfBounds)?;
        if payload_end < PACKET_LENGTH_LEN + PADDING_LENGTH_LEN {
            return Err(Error::IndexOutOfBounds);
        }

        payload.clear();
        payload.extend(&buffer.buffer.as_slice()
            [(PACKET_LENGTH_LEN + PADDING_LENGTH_LEN)..payload_end]);

        // Sequence numbers are on 32 bits and wrap.
        // https://tools.ietf.org/html/rfc4253#section-6.4
        buffer.seqn += Wrapping(1);
        buffer.len = 0;
        buffer.buffer.clear();
        Ok(true)
    }

    /// Appends one sealed packet carrying `payload` to the write buffer:
    /// pad, MAC over the plaintext, encrypt, emit ciphertext then MAC.
    pub fn write(&mut self, payload: &[u8], buffer: &mut SSHBuffer, rng: &mut StdRng) {
        // https://tools.ietf.org/html/rfc4253#section-6
        //
        // The variables `payload`, `packet_length` and `padding_length`
        // refer to the protocol fields of the same names.
        let block_size = self.local_to_remote.block_size();
        let unpadded_len = PACKET_LENGTH_LEN + PADDING_LENGTH_LEN + payload.len();
        let mut padding_length = match unpadded_len % block_size {
            0 => 0,
            n => block_size - n,
        };
        // RFC 4253 says "There MUST be at least four bytes of padding."
        if padding_length < 4 {
            padding_length += block_size;
        }
        // And the whole packet must be at least 16 bytes.
        while unpadded_len + padding_length < MINIMUM_PACKET_LEN {
            padding_length += block_size;
        }
        debug_assert_eq!((unpadded_len + padding_length) % block_size, 0);

        let packet_length = PADDING_LENGTH_LEN + payload.len() + padding_length;
        let mac_len = self.local_to_remote.mac_len();
        let offset = buffer.buffer.len();

        assert!(packet_length <= std::u32::MAX as usize);
        buffer.buffer.push_u32_be(packet_length as u32);
        assert!(padding_length <= std::u8::MAX as usize);
        buffer.buffer.push(padding_length as u8);
        buffer.buffer.extend(payload);
        rng.fill_bytes(buffer.buffer.reserve(padding_length));
        buffer.buffer.reserve(mac_len);

        let seqn = buffer.seqn.0;
        let buf = &mut buffer.buffer.as_mut_slice()[offset..];
        let (plaintext, tag) = buf.split_at_mut(PACKET_LENGTH_LEN + packet_length);
        if let SealingCipher::Block { ref mut enc, ref mac } = self.local_to_remote {
            // The MAC covers the sequence number and the plaintext packet;
            // both sides of this call stay in the same key epoch.
            mac.sign(seqn, plaintext, tag).unwrap_or(());
            enc.encrypt(plaintext);
        }

        // Sequence numbers are on 32 bits and wrap.
        // https://tools.ietf.org/html/rfc4253#section-6.4
        buffer.seqn += Wrapping(1);
    }
}

impl block::Enc {
    pub fn block_size(&self) -> usize {
        match *self {
            block::Enc::TripleDes(_) | block::Enc::Blowfish(_) | block::Enc::Cast128(_) => 8,
            _ => 16,
        }
    }
}
impl block::Dec {
    pub fn block_size(&self) -> usize {
        match *self {
            block::Dec::TripleDes(_) | block::Dec::Blowfish(_) | block::Dec::Cast128(_) => 8,
            _ => 16,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use mac;
    use byteorder::{ByteOrder, BigEndian};
    use rand::SeedableRng;
    use std::io::{BufReader, Cursor};

    fn pair(cipher: Name, m: mac::Name, epoch: u8) -> CipherPair {
        let key = vec![epoch; key_size(cipher)];
        let iv = vec![0x55; block_size(cipher)];
        let mac_key = vec![0x77; mac::key_len(m)];
        CipherPair {
            local_to_remote: SealingCipher::Block {
                enc: block::sealing(cipher, &key, &iv).unwrap(),
                mac: mac::MacKey::new(m, &mac_key),
            },
            remote_to_local: OpeningCipher::Block {
                dec: block::opening(cipher, &key, &iv).unwrap(),
                mac: mac::MacKey::new(m, &mac_key),
            },
        }
    }

    fn seal_one(pair: &mut CipherPair, payload: &[u8]) -> Vec<u8> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let mut buffer = ::sshbuffer::SSHBuffer::new();
        pair.write(payload, &mut buffer, &mut rng);
        buffer.buffer.as_slice().to_vec()
    }

    fn open_one(pair: &mut CipherPair, wire: &[u8]) -> Result<Vec<u8>, Error> {
        let mut buffer = ::sshbuffer::SSHBuffer::new();
        let mut payload = CryptoBuf::new();
        let mut stream = BufReader::new(Cursor::new(wire.to_vec()));
        if pair.read(&mut stream, &mut buffer, &mut payload)? {
            Ok(payload.as_slice().to_vec())
        } else {
            panic!("packet was complete but read returned false")
        }
    }

    #[test]
    fn seal_open_round_trip_every_cipher_and_mac() {
        for &cipher in NAMES.iter() {
            for &m in &[mac::HMAC_SHA1, mac::HMAC_MD5, mac::NONE] {
                let mut sealer = pair(cipher, m, 9);
                let mut opener = pair(cipher, m, 9);
                let wire = seal_one(&mut sealer, b"some payload bytes");
                let got = open_one(&mut opener, &wire).unwrap();
                assert_eq!(got, b"some payload bytes");
            }
        }
    }

    #[test]
    fn corrupted_ciphertext_fails_the_mac() {
        let mut sealer = pair(AES256_CBC, mac::HMAC_SHA1, 1);
        let mut opener = pair(AES256_CBC, mac::HMAC_SHA1, 1);
        let mut wire = seal_one(&mut sealer, b"attack at dawn");
        let mid = wire.len() / 2;
        wire[mid] ^= 0x01;
        match open_one(&mut opener, &wire) {
            Err(Error::PacketAuth) => {}
            other => panic!("corruption went unnoticed: {:?}", other),
        }
    }

    #[test]
    fn corrupted_tag_fails_the_mac() {
        let mut sealer = pair(TRIPLE_DES_CBC, mac::HMAC_MD5, 1);
        let mut opener = pair(TRIPLE_DES_CBC, mac::HMAC_MD5, 1);
        let mut wire = seal_one(&mut sealer, b"attack at dawn");
        let last = wire.len() - 1;
        wire[last] ^= 0x80;
        match open_one(&mut opener, &wire) {
            Err(Error::PacketAuth) => {}
            other => panic!("corruption went unnoticed: {:?}", other),
        }
    }

    #[test]
    fn padding_rules_hold() {
        // Cleartext packets expose the length and padding fields directly.
        let mut clear = CipherPair::clear();
        for payload_len in 0..70 {
            let payload = vec![0x61; payload_len];
            let wire = seal_one(&mut clear, &payload);
            let packet_length = BigEndian::read_u32(&wire) as usize;
            let padding_length = wire[4] as usize;
            assert_eq!(packet_length, PADDING_LENGTH_LEN + payload_len + padding_length);
            assert!(padding_length >= 4, "padding {} too small", padding_length);
            assert!(packet_length + PACKET_LENGTH_LEN >= MINIMUM_PACKET_LEN);
            assert_eq!((packet_length + PACKET_LENGTH_LEN) % 8, 0);
        }
        // Under a 16-byte-block cipher the whole packet is block aligned.
        let mut sealer = pair(AES128_CBC, mac::NONE, 1);
        let mut opener = pair(AES128_CBC, mac::NONE, 1);
        for payload_len in 0..40 {
            let payload = vec![0x61; payload_len];
            let wire = seal_one(&mut sealer, &payload);
            assert!(wire.len() >= MINIMUM_PACKET_LEN);
            assert_eq!(wire.len() % 16, 0);
            assert_eq!(open_one(&mut opener, &wire).unwrap(), payload);
        }
    }

    #[test]
    fn oversized_length_is_fatal() {
        let mut opener = CipherPair::clear();
        let mut wire = Vec::new();
        wire.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]); // absurd length
        wire.extend_from_slice(&[0; 60]);
        match open_one(&mut opener, &wire) {
            Err(Error::OversizedPacket) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn sequence_numbers_advance_and_matter() {
        let mut sealer = pair(AES128_CBC, mac::HMAC_SHA1, 1);
        let mut opener = pair(AES128_CBC, mac::HMAC_SHA1, 1);
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let mut out = ::sshbuffer::SSHBuffer::new();
        sealer.write(b"one", &mut out, &mut rng);
        sealer.write(b"two", &mut out, &mut rng);
        assert_eq!(out.seqn.0, 2);

        let wire = out.buffer.as_slice().to_vec();
        let mut stream = BufReader::new(Cursor::new(wire));
        let mut inbuf = ::sshbuffer::SSHBuffer::new();
        let mut payload = CryptoBuf::new();
        assert!(opener.read(&mut stream, &mut inbuf, &mut payload).unwrap());
        assert_eq!(payload.as_slice(), b"one");
        assert!(opener.read(&mut stream, &mut inbuf, &mut payload).unwrap());
        assert_eq!(payload.as_slice(), b"two");
        assert_eq!(inbuf.seqn.0, 2);
    }
}
