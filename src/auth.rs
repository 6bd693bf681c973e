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
use super::key;

bitflags! {
    /// Set of authentication methods, represented by bit flags.
    pub struct MethodSet: u32 {
        const NONE = 1;
        const PASSWORD = 2;
        const PUBLICKEY = 4;
        const HOSTBASED = 8;
    }
}

impl MethodSet {
    pub fn from_bytes(b: &[u8]) -> Option<MethodSet> {
        match b {
            b"none" => Some(MethodSet::NONE),
            b"password" => Some(MethodSet::PASSWORD),
            b"publickey" => Some(MethodSet::PUBLICKEY),
            b"hostbased" => Some(MethodSet::HOSTBASED),
            _ => None,
        }
    }
}

/// The credentials a connection authenticates with.
#[derive(Debug)]
pub enum Method {
    Password { user: String, password: String },
    PublicKey { user: String, key: key::Algorithm },
}

impl Method {
    pub fn user(&self) -> &str {
        match *self {
            Method::Password { ref user, .. } => user,
            Method::PublicKey { ref user, .. } => user,
        }
    }

    pub fn set(&self) -> MethodSet {
        match *self {
            Method::Password { .. } => MethodSet::PASSWORD,
            Method::PublicKey { .. } => MethodSet::PUBLICKEY,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn method_set_from_server_list() {
        let mut set = MethodSet::empty();
        for name in b"publickey,password".split(|&c| c == b',') {
            if let Some(m) = MethodSet::from_bytes(name) {
                set |= m;
            }
        }
        assert!(set.contains(MethodSet::PASSWORD));
        assert!(set.contains(MethodSet::PUBLICKEY));
        assert!(!set.contains(MethodSet::HOSTBASED));
    }
}
