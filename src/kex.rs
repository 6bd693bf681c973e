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
use num_bigint_dig::{BigUint, RandBigInt};
use num_traits::One;
use sha1::{Sha1, Digest as _};
use rand::rngs::StdRng;

use super::Error;
use super::msg;
use super::cryptobuf::CryptoBuf;
use negociation::Names;
use session::Exchange;
use cipher;
use mac;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Name(pub &'static str);
impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

pub const DH_GROUP1_SHA1: Name = Name("diffie-hellman-group1-sha1");
pub const DH_GROUP14_SHA1: Name = Name("diffie-hellman-group14-sha1");

pub const NAMES: [Name; 2] = [DH_GROUP1_SHA1, DH_GROUP14_SHA1];

// The Oakley group 2 prime, https://tools.ietf.org/html/rfc2409#section-6.2
const GROUP1_PRIME: &'static [u8] =
    b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
      020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
      4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
      EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF";

// The 2048-bit MODP group, https://tools.ietf.org/html/rfc3526#section-3
const GROUP14_PRIME: &'static [u8] =
    b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
      020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
      4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
      EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
      98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
      9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
      E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
      3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

fn group_prime(name: Name) -> BigUint {
    let hex: Vec<u8> = match name {
            DH_GROUP1_SHA1 => GROUP1_PRIME,
            _ => GROUP14_PRIME,
        }
        .iter()
        .cloned()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    // The constant is well-formed hex.
    BigUint::parse_bytes(&hex, 16).unwrap()
}

/// Both negotiable groups hash with SHA-1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Digest {
    Sha1([u8; 20]),
}

impl Digest {
    pub fn as_bytes(&self) -> &[u8] {
        match *self {
            Digest::Sha1(ref d) => d,
        }
    }
}

#[derive(Debug)]
pub struct Algorithm {
    name: Name,
    prime: BigUint,
    secret: BigUint,
    shared_secret: Option<BigUint>,
}

impl Algorithm {
    /// Draw the private exponent, publish `e = g^x mod p` as KEXDH_INIT
    /// and record it in the exchange transcript.
    pub fn client_dh(name: Name,
                     client_ephemeral: &mut CryptoBuf,
                     buf: &mut CryptoBuf,
                     rng: &mut StdRng)
                     -> Algorithm {
        let prime = group_prime(name);
        let generator = BigUint::from(2u32);
        let one = BigUint::one();
        let x = rng.gen_biguint_range(&one, &(&prime - &one));
        let e = generator.modpow(&x, &prime);

        client_ephemeral.clear();
        client_ephemeral.extend(&e.to_bytes_be());

        buf.push(msg::KEXDH_INIT);
        buf.extend_ssh_mpint(&e.to_bytes_be());

        Algorithm {
            name: name,
            prime: prime,
            secret: x,
            shared_secret: None,
        }
    }

    /// On KEXDH_REPLY, `K = f^x mod p`. Degenerate group elements are a
    /// protocol violation.
    pub fn compute_shared_secret(&mut self, remote_pubkey: &[u8]) -> Result<(), Error> {
        let f = BigUint::from_bytes_be(remote_pubkey);
        let one = BigUint::one();
        if f <= one || f >= &self.prime - &one {
            return Err(Error::Kex);
        }
        self.shared_secret = Some(f.modpow(&self.secret, &self.prime));
        Ok(())
    }

    /// The exchange hash H, also the session id of the first exchange.
    /// See https://tools.ietf.org/html/rfc4253#section-8
    pub fn compute_exchange_hash(&self,
                                 server_key_blob: &[u8],
                                 exchange: &Exchange,
                                 buffer: &mut CryptoBuf)
                                 -> Result<Digest, Error> {
        buffer.clear();
        buffer.extend_ssh_string(exchange.client_id.as_slice());
        buffer.extend_ssh_string(exchange.server_id.as_slice());
        buffer.extend_ssh_string(exchange.client_kex_init.as_slice());
        buffer.extend_ssh_string(exchange.server_kex_init.as_slice());
        buffer.extend_ssh_string(server_key_blob);
        buffer.extend_ssh_mpint(exchange.client_ephemeral.as_slice());
        buffer.extend_ssh_mpint(exchange.server_ephemeral.as_slice());
        if let Some(ref shared) = self.shared_secret {
            buffer.extend_ssh_mpint(&shared.to_bytes_be());
        } else {
            return Err(Error::Kex);
        }
        let mut hash = [0; 20];
        hash.copy_from_slice(&Sha1::digest(buffer.as_slice()));
        Ok(Digest::Sha1(hash))
    }

    /// Derive both directions' keys and build the cipher contexts, per
    /// https://tools.ietf.org/html/rfc4253#section-7.2
    pub fn compute_keys(&self,
                        session_id: &Digest,
                        exchange_hash: &Digest,
                        buffer: &mut CryptoBuf,
                        names: &Names)
                        -> Result<cipher::CipherPair, Error> {
        let mut compute_key = |c: u8, out: &mut CryptoBuf, len: usize| {
            buffer.clear();
            out.clear();
            if let Some(ref shared) = self.shared_secret {
                buffer.extend_ssh_mpint(&shared.to_bytes_be());
            }
            buffer.extend(exchange_hash.as_bytes());
            buffer.push(c);
            buffer.extend(session_id.as_bytes());
            out.extend(&Sha1::digest(buffer.as_slice()));

            while out.len() < len {
                // extend.
                buffer.clear();
                if let Some(ref shared) = self.shared_secret {
                    buffer.extend_ssh_mpint(&shared.to_bytes_be());
                }
                buffer.extend(exchange_hash.as_bytes());
                buffer.extend(out.as_slice());
                out.extend(&Sha1::digest(buffer.as_slice()));
            }
            out.truncate(len);
        };

        let iv_len = cipher::block_size(names.cipher);
        let key_len = cipher::key_size(names.cipher);
        let mac_len = mac::key_len(names.mac);

        let mut iv = CryptoBuf::new();
        let mut key = CryptoBuf::new();
        let mut mac_key = CryptoBuf::new();

        compute_key(b'A', &mut iv, iv_len);
        compute_key(b'C', &mut key, key_len);
        compute_key(b'E', &mut mac_key, mac_len);
        let local_to_remote = cipher::SealingCipher::Block {
            enc: cipher::block::sealing(names.cipher, key.as_slice(), iv.as_slice())?,
            mac: mac::MacKey::new(names.mac, mac_key.as_slice()),
        };

        compute_key(b'B', &mut iv, iv_len);
        compute_key(b'D', &mut key, key_len);
        compute_key(b'F', &mut mac_key, mac_len);
        let remote_to_local = cipher::OpeningCipher::Block {
            dec: cipher::block::opening(names.cipher, key.as_slice(), iv.as_slice())?,
            mac: mac::MacKey::new(names.mac, mac_key.as_slice()),
        };

        Ok(cipher::CipherPair {
            local_to_remote: local_to_remote,
            remote_to_local: remote_to_local,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn shared_secret_is_symmetric() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut eph = CryptoBuf::new();
        let mut buf = CryptoBuf::new();

        for &name in NAMES.iter() {
            let mut client = Algorithm::client_dh(name, &mut eph, &mut buf, &mut rng);
            buf.clear();
            let mut server = Algorithm::client_dh(name, &mut buf, &mut CryptoBuf::new(), &mut rng);
            let f = buf.as_slice().to_vec();

            client.compute_shared_secret(&f).unwrap();
            server.compute_shared_secret(eph.as_slice()).unwrap();
            assert_eq!(client.shared_secret, server.shared_secret);
        }
    }

    #[test]
    fn degenerate_f_is_rejected() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut eph = CryptoBuf::new();
        let mut buf = CryptoBuf::new();
        let mut client = Algorithm::client_dh(DH_GROUP1_SHA1, &mut eph, &mut buf, &mut rng);
        assert!(client.compute_shared_secret(&[1]).is_err());
        assert!(client.compute_shared_secret(&[0]).is_err());
    }

    #[test]
    fn kexdh_init_layout() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut eph = CryptoBuf::new();
        let mut buf = CryptoBuf::new();
        let _ = Algorithm::client_dh(DH_GROUP14_SHA1, &mut eph, &mut buf, &mut rng);
        assert_eq!(buf[0], ::msg::KEXDH_INIT);
        use encoding::Reader;
        let mut r = buf.as_slice().reader(1);
        let e = r.read_mpint().unwrap();
        // e fits the group and is non-trivial.
        assert!(e.len() <= 256);
        assert!(e.len() > 16);
    }

    #[test]
    fn derived_keys_have_requested_lengths() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut eph = CryptoBuf::new();
        let mut buf = CryptoBuf::new();
        let mut client = Algorithm::client_dh(DH_GROUP1_SHA1, &mut eph, &mut buf, &mut rng);
        buf.clear();
        let mut peer_eph = CryptoBuf::new();
        let _server = Algorithm::client_dh(DH_GROUP1_SHA1, &mut peer_eph, &mut buf, &mut rng);
        client.compute_shared_secret(peer_eph.as_slice()).unwrap();

        let hash = Digest::Sha1([0x21; 20]);
        let names = ::negociation::Names {
            kex: DH_GROUP1_SHA1,
            key: ::key::SSH_RSA,
            cipher: ::cipher::AES256_CBC,
            mac: ::mac::HMAC_SHA1,
            ignore_guessed: false,
        };
        // aes256 wants a 32-byte key, which takes two SHA-1 rounds.
        let pair = client.compute_keys(&hash, &hash, &mut buf, &names).unwrap();
        match pair.local_to_remote {
            ::cipher::SealingCipher::Block { .. } => {}
            _ => panic!("no cipher installed"),
        }
    }

    #[test]
    fn exchange_hash_covers_the_whole_transcript() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut exchange = Exchange::new();
        exchange.client_id.extend(b"SSH-2.0-sshmux_0.1.0");
        exchange.server_id.extend(b"SSH-2.0-OpenSSH_7.4");
        exchange.client_kex_init.extend(b"\x14fake client kexinit");
        exchange.server_kex_init.extend(b"\x14fake server kexinit");

        let mut buf = CryptoBuf::new();
        let mut client =
            Algorithm::client_dh(DH_GROUP1_SHA1, &mut exchange.client_ephemeral, &mut buf, &mut rng);
        buf.clear();
        let mut peer = CryptoBuf::new();
        let _ = Algorithm::client_dh(DH_GROUP1_SHA1, &mut peer, &mut buf, &mut rng);
        exchange.server_ephemeral.extend(peer.as_slice());
        client.compute_shared_secret(peer.as_slice()).unwrap();

        let mut scratch = CryptoBuf::new();
        let h1 = client.compute_exchange_hash(b"blob", &exchange, &mut scratch).unwrap();
        let h2 = client.compute_exchange_hash(b"blob", &exchange, &mut scratch).unwrap();
        assert_eq!(h1, h2);
        let h3 = client.compute_exchange_hash(b"other blob", &exchange, &mut scratch).unwrap();
        assert!(h1 != h3);
        exchange.server_id.clear();
        exchange.server_id.extend(b"SSH-2.0-OpenSSH_8.0");
        let h4 = client.compute_exchange_hash(b"blob", &exchange, &mut scratch).unwrap();
        assert!(h1 != h4);
    }
}
