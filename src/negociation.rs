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

use super::Error;
use super::key;
use super::kex;
use super::cipher;
use super::mac;
use super::compression;
use super::msg;
use super::encoding::Reader;
use super::cryptobuf::CryptoBuf;

/// The outcome of algorithm negotiation, one name per category.
#[derive(Debug, Clone, Copy)]
pub struct Names {
    pub kex: kex::Name,
    pub key: key::Name,
    pub cipher: cipher::Name,
    pub mac: mac::Name,
    /// The server guessed its first KEXDH packet and guessed wrong; the
    /// next packet must be dropped.
    pub ignore_guessed: bool,
}

/// The ordered preference lists offered in our KEXINIT. `prefer_cipher`
/// and `prefer_mac` hoist a name to the head of its list, so the offered
/// list always leads with the preferred name when one is set.
#[derive(Debug, Clone)]
pub struct Preferred {
    pub kex: Vec<kex::Name>,
    pub key: Vec<key::Name>,
    pub cipher: Vec<cipher::Name>,
    pub mac: Vec<mac::Name>,
}

impl std::default::Default for Preferred {
    fn default() -> Preferred {
        Preferred {
            kex: kex::NAMES.to_vec(),
            key: key::NAMES.to_vec(),
            cipher: cipher::NAMES.to_vec(),
            mac: mac::NAMES.to_vec(),
        }
    }
}

fn hoist<N: AsRef<str> + Copy>(list: &mut Vec<N>, name: &str) -> bool {
    if let Some(i) = list.iter().position(|n| n.as_ref() == name) {
        let n = list.remove(i);
        list.insert(0, n);
        true
    } else {
        false
    }
}

impl Preferred {
    pub fn prefer_cipher(&mut self, name: &str) -> bool {
        hoist(&mut self.cipher, name)
    }
    pub fn prefer_mac(&mut self, name: &str) -> bool {
        hoist(&mut self.mac, name)
    }
}

/// The first name of our preference list that also appears in the peer's
/// name-list. As the client our list is the one that decides, see
/// https://tools.ietf.org/html/rfc4253#section-7.1
fn select<N: AsRef<str> + Copy>(local: &[N], remote: &[u8]) -> Option<N> {
    for l in local {
        for r in remote.split(|&x| x == b',') {
            if l.as_ref().as_bytes() == r {
                return Some(*l);
            }
        }
    }
    None
}

fn first_name(list: &[u8]) -> &[u8] {
    list.split(|&x| x == b',').next().unwrap_or(b"")
}

/// Parse the server's KEXINIT and negotiate every category against our
/// preference lists.
pub fn read_kex(buffer: &[u8], preferred: &Preferred) -> Result<Names, Error> {
    if buffer.len() == 0 || buffer[0] != msg::KEXINIT {
        return Err(Error::KexInit);
    }
    // msg byte, then the 16-byte cookie.
    let mut r = buffer.reader(17);
    let kex_list = r.read_string()?;
    let key_list = r.read_string()?;
    let cipher_c2s = r.read_string()?;
    let cipher_s2c = r.read_string()?;
    let mac_c2s = r.read_string()?;
    let mac_s2c = r.read_string()?;
    let comp_c2s = r.read_string()?;
    let comp_s2c = r.read_string()?;
    let _lang_c2s = r.read_string()?;
    let _lang_s2c = r.read_string()?;
    let follows = r.read_bool()?;
    let _reserved = r.read_u32()?;

    debug!("kex_algorithms: {:?}", std::str::from_utf8(kex_list));
    debug!("server_host_key_algorithms: {:?}", std::str::from_utf8(key_list));
    debug!("ciphers: {:?} / {:?}",
           std::str::from_utf8(cipher_c2s),
           std::str::from_utf8(cipher_s2c));
    debug!("macs: {:?} / {:?}",
           std::str::from_utf8(mac_c2s),
           std::str::from_utf8(mac_s2c));

    let kex = select(&preferred.kex, kex_list)
        .ok_or(Error::NoCommonAlgorithm("kex"))?;
    let key = select(&preferred.key, key_list)
        .ok_or(Error::NoCommonAlgorithm("host key"))?;

    // Both directions run the same cipher and the same MAC; each must be
    // acceptable in both of the server's lists.
    let cipher = select(&preferred.cipher, cipher_c2s)
        .and_then(|c| if select(&[c], cipher_s2c).is_some() { Some(c) } else { None })
        .ok_or(Error::NoCommonAlgorithm("cipher"))?;
    let mac = select(&preferred.mac, mac_c2s)
        .and_then(|m| if select(&[m], mac_s2c).is_some() { Some(m) } else { None })
        .ok_or(Error::NoCommonAlgorithm("mac"))?;

    if select(&[compression::NONE], comp_c2s).is_none() ||
       select(&[compression::NONE], comp_s2c).is_none() {
        return Err(Error::NoCommonAlgorithm("compression"));
    }

    let ignore_guessed = follows &&
        (first_name(kex_list) != kex.as_ref().as_bytes() ||
         first_name(key_list) != key.as_ref().as_bytes());

    Ok(Names {
        kex: kex,
        key: key,
        cipher: cipher,
        mac: mac,
        ignore_guessed: ignore_guessed,
    })
}

/// Write our KEXINIT payload. The cookie is drawn from the shared RNG by
/// the caller.
pub fn write_kex(preferred: &Preferred, cookie: &[u8; 16], buf: &mut CryptoBuf) {
    buf.push(msg::KEXINIT);
    buf.extend(cookie);

    buf.extend_list(preferred.kex.iter());
    buf.extend_list(preferred.key.iter());

    buf.extend_list(preferred.cipher.iter()); // cipher client to server
    buf.extend_list(preferred.cipher.iter()); // cipher server to client

    buf.extend_list(preferred.mac.iter()); // mac client to server
    buf.extend_list(preferred.mac.iter()); // mac server to client

    buf.extend_list(compression::NAMES.iter()); // compression client to server
    buf.extend_list(compression::NAMES.iter()); // compression server to client

    buf.write_empty_list(); // languages client to server
    buf.write_empty_list(); // languages server to client

    buf.push(0); // doesn't follow
    buf.extend(&[0, 0, 0, 0]); // reserved
}

#[cfg(test)]
mod test {
    use super::*;

    fn server_kexinit(kex: &str, key: &str, cipher: &str, mac: &str, comp: &str) -> CryptoBuf {
        let mut buf = CryptoBuf::new();
        buf.push(msg::KEXINIT);
        buf.extend(&[0; 16]);
        buf.extend_ssh_string(kex.as_bytes());
        buf.extend_ssh_string(key.as_bytes());
        buf.extend_ssh_string(cipher.as_bytes());
        buf.extend_ssh_string(cipher.as_bytes());
        buf.extend_ssh_string(mac.as_bytes());
        buf.extend_ssh_string(mac.as_bytes());
        buf.extend_ssh_string(comp.as_bytes());
        buf.extend_ssh_string(comp.as_bytes());
        buf.write_empty_list();
        buf.write_empty_list();
        buf.push(0);
        buf.extend(&[0, 0, 0, 0]);
        buf
    }

    #[test]
    fn negotiates_our_preference() {
        let p = Preferred::default();
        let kexinit = server_kexinit("diffie-hellman-group14-sha1,diffie-hellman-group1-sha1",
                                     "ssh-rsa,ssh-dss",
                                     "aes128-cbc,aes256-cbc",
                                     "hmac-sha1,hmac-md5",
                                     "none");
        let names = read_kex(kexinit.as_slice(), &p).unwrap();
        // Ours lead with group1, ssh-dss, aes256 and hmac-md5.
        assert_eq!(names.kex.as_ref(), "diffie-hellman-group1-sha1");
        assert_eq!(names.key.as_ref(), "ssh-dss");
        assert_eq!(names.cipher.as_ref(), "aes256-cbc");
        assert_eq!(names.mac.as_ref(), "hmac-md5");
        assert!(!names.ignore_guessed);
    }

    #[test]
    fn single_server_mac_is_taken() {
        let p = Preferred::default();
        let kexinit = server_kexinit("diffie-hellman-group1-sha1",
                                     "ssh-rsa",
                                     "aes256-cbc",
                                     "hmac-md5",
                                     "none");
        let names = read_kex(kexinit.as_slice(), &p).unwrap();
        assert_eq!(names.mac.as_ref(), "hmac-md5");
    }

    #[test]
    fn unknown_mac_is_rejected() {
        let p = Preferred::default();
        let kexinit = server_kexinit("diffie-hellman-group1-sha1",
                                     "ssh-rsa",
                                     "aes256-cbc",
                                     "hmac-ripemd160",
                                     "none");
        match read_kex(kexinit.as_slice(), &p) {
            Err(Error::NoCommonAlgorithm("mac")) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn hoisting_changes_the_selection() {
        let mut p = Preferred::default();
        assert!(p.prefer_cipher("3des-cbc"));
        assert!(p.prefer_mac("hmac-sha1"));
        assert!(!p.prefer_cipher("rot13-cbc"));
        let kexinit = server_kexinit("diffie-hellman-group1-sha1",
                                     "ssh-rsa",
                                     "aes256-cbc,3des-cbc",
                                     "hmac-md5,hmac-sha1",
                                     "none");
        let names = read_kex(kexinit.as_slice(), &p).unwrap();
        assert_eq!(names.cipher.as_ref(), "3des-cbc");
        assert_eq!(names.mac.as_ref(), "hmac-sha1");
    }

    #[test]
    fn compression_must_include_none() {
        let p = Preferred::default();
        let kexinit = server_kexinit("diffie-hellman-group1-sha1",
                                     "ssh-rsa",
                                     "aes256-cbc",
                                     "hmac-sha1",
                                     "zlib");
        match read_kex(kexinit.as_slice(), &p) {
            Err(Error::NoCommonAlgorithm("compression")) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn our_kexinit_is_parseable() {
        let p = Preferred::default();
        let mut buf = CryptoBuf::new();
        write_kex(&p, &[7; 16], &mut buf);
        let names = read_kex(buf.as_slice(), &p).unwrap();
        assert_eq!(names.kex.as_ref(), "diffie-hellman-group1-sha1");
        assert_eq!(names.cipher.as_ref(), "aes256-cbc");
    }
}
