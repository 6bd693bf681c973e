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

use byteorder::{ByteOrder, BigEndian};
use super::Error;
use super::cryptobuf::CryptoBuf;

pub trait Bytes {
    fn bytes(&self) -> &[u8];
}

impl<A: AsRef<str>> Bytes for A {
    fn bytes(&self) -> &[u8] {
        self.as_ref().as_bytes()
    }
}

impl CryptoBuf {
    pub fn extend_ssh_string(&mut self, s: &[u8]) {
        self.push_u32_be(s.len() as u32);
        self.extend(s);
    }

    /// Encode a big-endian magnitude as an SSH mpint: leading zeroes are
    /// dropped, and a zero byte is prepended when the most significant bit
    /// of the remaining magnitude is set.
    pub fn extend_ssh_mpint(&mut self, s: &[u8]) {
        let mut i = 0;
        while i < s.len() && s[i] == 0 {
            i += 1
        }
        if i >= s.len() {
            self.push_u32_be(0);
            return;
        }
        if s[i] & 0x80 != 0 {
            self.push_u32_be((s.len() - i + 1) as u32);
            self.push(0)
        } else {
            self.push_u32_be((s.len() - i) as u32);
        }
        self.extend(&s[i..]);
    }

    pub fn extend_bool(&mut self, b: bool) {
        self.push(if b { 1 } else { 0 });
    }

    pub fn extend_list<A: Bytes, I: Iterator<Item = A>>(&mut self, list: I) {
        let len0 = self.len();
        self.extend(&[0, 0, 0, 0]);
        let mut first = true;
        for i in list {
            if !first {
                self.push(b',')
            } else {
                first = false;
            }
            self.extend(i.bytes())
        }
        let len = (self.len() - len0 - 4) as u32;

        let buf = self.as_mut_slice();
        BigEndian::write_u32(&mut buf[len0..], len);
    }

    pub fn write_empty_list(&mut self) {
        self.extend(&[0, 0, 0, 0]);
    }
}

pub trait Reader {
    fn reader<'a>(&'a self, starting_at: usize) -> Position<'a>;
}

impl Reader for CryptoBuf {
    fn reader<'a>(&'a self, starting_at: usize) -> Position<'a> {
        Position {
            s: self.as_slice(),
            position: starting_at,
        }
    }
}

impl Reader for [u8] {
    fn reader<'a>(&'a self, starting_at: usize) -> Position<'a> {
        Position {
            s: self,
            position: starting_at,
        }
    }
}

pub struct Position<'a> {
    s: &'a [u8],
    pub position: usize,
}

impl<'a> Position<'a> {
    pub fn read_string(&mut self) -> Result<&'a [u8], Error> {
        let len = self.read_u32()? as usize;
        if self.position.checked_add(len).map_or(false, |end| end <= self.s.len()) {
            let result = &self.s[self.position..(self.position + len)];
            self.position += len;
            Ok(result)
        } else {
            Err(Error::IndexOutOfBounds)
        }
    }

    /// Reads the raw big-endian magnitude of an mpint, with the sign byte
    /// stripped. Only non-negative values appear in this protocol.
    pub fn read_mpint(&mut self) -> Result<&'a [u8], Error> {
        let s = self.read_string()?;
        if s.len() > 0 && s[0] == 0 {
            Ok(&s[1..])
        } else {
            Ok(s)
        }
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        if self.position + 4 <= self.s.len() {
            let u = BigEndian::read_u32(&self.s[self.position..]);
            self.position += 4;
            Ok(u)
        } else {
            Err(Error::IndexOutOfBounds)
        }
    }

    pub fn read_u64(&mut self) -> Result<u64, Error> {
        if self.position + 8 <= self.s.len() {
            let u = BigEndian::read_u64(&self.s[self.position..]);
            self.position += 8;
            Ok(u)
        } else {
            Err(Error::IndexOutOfBounds)
        }
    }

    pub fn read_byte(&mut self) -> Result<u8, Error> {
        if self.position + 1 <= self.s.len() {
            let u = self.s[self.position];
            self.position += 1;
            Ok(u)
        } else {
            Err(Error::IndexOutOfBounds)
        }
    }

    pub fn read_bool(&mut self) -> Result<bool, Error> {
        Ok(self.read_byte()? != 0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn string_round_trip() {
        let mut buf = CryptoBuf::new();
        buf.extend_ssh_string(b"ssh-userauth");
        let mut r = buf.reader(0);
        assert_eq!(r.read_string().unwrap(), b"ssh-userauth");
        assert!(r.read_byte().is_err());
    }

    #[test]
    fn mpint_high_bit_is_padded() {
        let mut buf = CryptoBuf::new();
        buf.extend_ssh_mpint(&[0x80, 0x01]);
        assert_eq!(buf.as_slice(), &[0, 0, 0, 3, 0, 0x80, 0x01]);
        let mut r = buf.reader(0);
        assert_eq!(r.read_mpint().unwrap(), &[0x80, 0x01]);
    }

    #[test]
    fn mpint_leading_zeroes_are_dropped() {
        let mut buf = CryptoBuf::new();
        buf.extend_ssh_mpint(&[0, 0, 0x12, 0x34]);
        assert_eq!(buf.as_slice(), &[0, 0, 0, 2, 0x12, 0x34]);
    }

    #[test]
    fn mpint_zero() {
        let mut buf = CryptoBuf::new();
        buf.extend_ssh_mpint(&[0, 0, 0]);
        assert_eq!(buf.as_slice(), &[0, 0, 0, 0]);
    }

    #[test]
    fn numbers_round_trip() {
        let mut buf = CryptoBuf::new();
        buf.push_u32_be(42);
        buf.push_u64_be(1 << 40);
        buf.extend_bool(true);
        buf.extend_bool(false);
        let mut r = buf.reader(0);
        assert_eq!(r.read_u32().unwrap(), 42);
        assert_eq!(r.read_u64().unwrap(), 1 << 40);
        assert_eq!(r.read_bool().unwrap(), true);
        assert_eq!(r.read_bool().unwrap(), false);
    }

    #[test]
    fn name_list() {
        let mut buf = CryptoBuf::new();
        buf.extend_list(["hmac-md5", "hmac-sha1", "none"].iter());
        let mut r = buf.reader(0);
        assert_eq!(r.read_string().unwrap(), b"hmac-md5,hmac-sha1,none");
    }

    #[test]
    fn truncated_string_fails() {
        // Length field claims four bytes, only two follow.
        let raw = [0u8, 0, 0, 4, b'a', b'b'];
        let mut r = raw.reader(0);
        assert!(r.read_string().is_err());
    }

    #[test]
    fn overflowing_length_fails() {
        let raw = [0xffu8, 0xff, 0xff, 0xff, 1, 2, 3];
        let mut r = raw.reader(0);
        assert!(r.read_string().is_err());
    }
}
