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

//! CBC instances for the negotiable block ciphers. The CBC state chains
//! across packets, so every instance lives for one key epoch and one
//! direction.

use aes::{Aes128, Aes192, Aes256};
use aes::cipher::{BlockEncryptMut, BlockDecryptMut, BlockSizeUser, KeyInit, InnerIvInit};
use aes::cipher::generic_array::GenericArray;
use des::TdesEde3;
use blowfish::Blowfish;
use cast5::Cast5;
use twofish::Twofish;
use cbc;

use super::Name;
use super::super::Error;

pub enum Enc {
    Aes128(cbc::Encryptor<Aes128>),
    Aes192(cbc::Encryptor<Aes192>),
    Aes256(cbc::Encryptor<Aes256>),
    TripleDes(cbc::Encryptor<TdesEde3>),
    Blowfish(cbc::Encryptor<Blowfish>),
    Cast128(cbc::Encryptor<Cast5>),
    Twofish(cbc::Encryptor<Twofish>),
}

pub enum Dec {
    Aes128(cbc::Decryptor<Aes128>),
    Aes192(cbc::Decryptor<Aes192>),
    Aes256(cbc::Decryptor<Aes256>),
    TripleDes(cbc::Decryptor<TdesEde3>),
    Blowfish(cbc::Decryptor<Blowfish>),
    Cast128(cbc::Decryptor<Cast5>),
    Twofish(cbc::Decryptor<Twofish>),
}

fn encrypt_in_place<C: BlockEncryptMut>(c: &mut C, data: &mut [u8]) {
    let bs = C::block_size();
    debug_assert!(data.len() % bs == 0);
    for chunk in data.chunks_exact_mut(bs) {
        c.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }
}

fn decrypt_in_place<C: BlockDecryptMut>(c: &mut C, data: &mut [u8]) {
    let bs = C::block_size();
    debug_assert!(data.len() % bs == 0);
    for chunk in data.chunks_exact_mut(bs) {
        c.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }
}

macro_rules! init {
    ($mode:ident, $cipher:ty, $variant:path, $key:expr, $iv:expr) => {
        {
            let c = <$cipher>::new_from_slice($key).map_err(|_| Error::Kex)?;
            let m = cbc::$mode::inner_iv_slice_init(c, $iv).map_err(|_| Error::Kex)?;
            Ok($variant(m))
        }
    };
}

pub fn sealing(name: Name, key: &[u8], iv: &[u8]) -> Result<Enc, Error> {
    match name {
        super::AES128_CBC => init!(Encryptor, Aes128, Enc::Aes128, key, iv),
        super::AES192_CBC => init!(Encryptor, Aes192, Enc::Aes192, key, iv),
        super::AES256_CBC => init!(Encryptor, Aes256, Enc::Aes256, key, iv),
        super::TRIPLE_DES_CBC => init!(Encryptor, TdesEde3, Enc::TripleDes, key, iv),
        super::BLOWFISH_CBC => init!(Encryptor, Blowfish, Enc::Blowfish, key, iv),
        super::CAST128_CBC => init!(Encryptor, Cast5, Enc::Cast128, key, iv),
        super::TWOFISH_CBC | super::TWOFISH256_CBC => {
            init!(Encryptor, Twofish, Enc::Twofish, key, iv)
        }
        _ => Err(Error::Kex),
    }
}

pub fn opening(name: Name, key: &[u8], iv: &[u8]) -> Result<Dec, Error> {
    match name {
        super::AES128_CBC => init!(Decryptor, Aes128, Dec::Aes128, key, iv),
        super::AES192_CBC => init!(Decryptor, Aes192, Dec::Aes192, key, iv),
        super::AES256_CBC => init!(Decryptor, Aes256, Dec::Aes256, key, iv),
        super::TRIPLE_DES_CBC => init!(Decryptor, TdesEde3, Dec::TripleDes, key, iv),
        super::BLOWFISH_CBC => init!(Decryptor, Blowfish, Dec::Blowfish, key, iv),
        super::CAST128_CBC => init!(Decryptor, Cast5, Dec::Cast128, key, iv),
        super::TWOFISH_CBC | super::TWOFISH256_CBC => {
            init!(Decryptor, Twofish, Dec::Twofish, key, iv)
        }
        _ => Err(Error::Kex),
    }
}

impl Enc {
    pub fn encrypt(&mut self, data: &mut [u8]) {
        match *self {
            Enc::Aes128(ref mut c) => encrypt_in_place(c, data),
            Enc::Aes192(ref mut c) => encrypt_in_place(c, data),
            Enc::Aes256(ref mut c) => encrypt_in_place(c, data),
            Enc::TripleDes(ref mut c) => encrypt_in_place(c, data),
            Enc::Blowfish(ref mut c) => encrypt_in_place(c, data),
            Enc::Cast128(ref mut c) => encrypt_in_place(c, data),
            Enc::Twofish(ref mut c) => encrypt_in_place(c, data),
        }
    }
}

impl Dec {
    pub fn decrypt(&mut self, data: &mut [u8]) {
        match *self {
            Dec::Aes128(ref mut c) => decrypt_in_place(c, data),
            Dec::Aes192(ref mut c) => decrypt_in_place(c, data),
            Dec::Aes256(ref mut c) => decrypt_in_place(c, data),
            Dec::TripleDes(ref mut c) => decrypt_in_place(c, data),
            Dec::Blowfish(ref mut c) => decrypt_in_place(c, data),
            Dec::Cast128(ref mut c) => decrypt_in_place(c, data),
            Dec::Twofish(ref mut c) => decrypt_in_place(c, data),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use cipher::{key_size, block_size, NAMES};
    use cipher::Name;

    fn round_trip(name: Name) {
        let key = vec![0x42; key_size(name)];
        let iv = vec![0x17; block_size(name)];
        let mut enc = sealing(name, &key, &iv).unwrap();
        let mut dec = opening(name, &key, &iv).unwrap();

        let bs = block_size(name);
        let mut data: Vec<u8> = (0..(3 * bs) as u8).collect();
        let reference = data.clone();
        enc.encrypt(&mut data);
        assert!(data != reference);
        dec.decrypt(&mut data);
        assert_eq!(data, reference);
    }

    #[test]
    fn all_ciphers_round_trip() {
        for &name in NAMES.iter() {
            round_trip(name);
        }
    }

    #[test]
    fn cbc_state_chains_across_calls() {
        let name = super::super::AES128_CBC;
        let key = vec![1; key_size(name)];
        let iv = vec![2; block_size(name)];
        let mut enc = sealing(name, &key, &iv).unwrap();
        let mut dec = opening(name, &key, &iv).unwrap();

        let mut first = vec![0u8; 16];
        let mut second = vec![0u8; 16];
        enc.encrypt(&mut first);
        enc.encrypt(&mut second);
        // Same plaintext, different ciphertext: the IV chained.
        assert!(first != second);
        dec.decrypt(&mut first);
        dec.decrypt(&mut second);
        assert_eq!(first, vec![0u8; 16]);
        assert_eq!(second, vec![0u8; 16]);
    }
}
