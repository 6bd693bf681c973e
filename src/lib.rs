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

//! Multi-connection SSH-2 client library.
//!
//! This library maintains many encrypted SSH-2 sessions inside a single
//! process, from one background reactor thread. Each connection owns one
//! socket, one transport state machine (version exchange, key exchange,
//! rekeying, binary packet protocol) and one session channel carrying a
//! shell, a remote command or an SFTP subsystem.
//!
//! Create an [`Ssh`] context, then open connections with
//! [`Ssh::connect_with_password`] or [`Ssh::connect_with_key`]. Both return
//! a channel id; all further calls are keyed by it. The reactor does all
//! socket I/O; caller threads only queue data and wait on results.
//!
//! ```no_run
//! let ssh = sshmux::Ssh::new().unwrap();
//! let id = ssh.connect_with_password("host", 22, "user", "secret", true, 10).unwrap();
//! ssh.send(id, b"echo hello\n").unwrap();
//! if ssh.wait_for(id, b"hello", 5) {
//!     let out = ssh.read(id).unwrap();
//!     println!("{}", String::from_utf8_lossy(&out));
//! }
//! ssh.close(id).unwrap();
//! ```
//!
//! This library will never do much more than handling the SSH protocol.
//! In particular it does not interpret SFTP messages (only the channel
//! they ride on), does not decide host-key trust, and does not run
//! external processes.

extern crate libc;
extern crate rand;
extern crate mio;

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate log;
extern crate byteorder;

extern crate num_bigint_dig;
extern crate num_traits;
extern crate sha1;
extern crate md5;
extern crate hmac;
extern crate aes;
extern crate cbc;
extern crate des;
extern crate blowfish;
extern crate cast5;
extern crate twofish;
extern crate rsa;
extern crate dsa;
extern crate base64;

mod cryptobuf;
pub use cryptobuf::CryptoBuf;

mod sshbuffer;

#[derive(Debug)]
pub enum Error {
    /// Could not read or parse a private key file.
    CouldNotReadKey,
    /// The peer's KEXINIT could not be parsed.
    KexInit,
    /// No acceptable `SSH-2.0-` version line was received.
    Version,
    /// Key exchange failed (bad DH reply, degenerate group element,
    /// unusable host key).
    Kex,
    /// No common algorithm in the named category.
    NoCommonAlgorithm(&'static str),
    /// MAC verification failed on an inbound packet.
    PacketAuth,
    /// The server's signature over the exchange hash did not verify.
    BadSignature,
    /// The server rejected the supplied credentials.
    AuthFailed,
    /// The server refused to open the session channel.
    ChannelOpenFailure(ChannelOpenReason),
    /// The server replied CHANNEL_FAILURE to a channel request.
    ChannelRequestFailure,
    /// A packet length field exceeded the accepted maximum.
    OversizedPacket,
    /// The handshake did not finish within the allotted time.
    Timeout,
    /// The connection failed; the error log has the structured record.
    ConnectionFailed,
    Inconsistent,
    HUP,
    IndexOutOfBounds,
    Utf8(std::str::Utf8Error),
    WrongChannel,
    WrongState,
    IO(std::io::Error),
    Disconnect,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::IO(e)
    }
}
impl From<std::str::Utf8Error> for Error {
    fn from(e: std::str::Utf8Error) -> Error {
        Error::Utf8(e)
    }
}

/// Reason codes of CHANNEL_OPEN_FAILURE, RFC 4254 section 5.1.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelOpenReason {
    AdministrativelyProhibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
    Unknown(u32),
}

impl ChannelOpenReason {
    fn from_u32(c: u32) -> ChannelOpenReason {
        match c {
            1 => ChannelOpenReason::AdministrativelyProhibited,
            2 => ChannelOpenReason::ConnectFailed,
            3 => ChannelOpenReason::UnknownChannelType,
            4 => ChannelOpenReason::ResourceShortage,
            c => ChannelOpenReason::Unknown(c),
        }
    }
}

macro_rules! push_packet {
    ( $buffer:expr, $x:expr ) => {
        {
            use byteorder::{BigEndian, ByteOrder};
            let i0 = $buffer.len();
            $buffer.extend(b"\0\0\0\0");
            let x = $x;
            let i1 = $buffer.len();
            let buf = $buffer.as_mut_slice();
            BigEndian::write_u32(&mut buf[i0..], (i1-i0-4) as u32);
            x
        }
    };
}

pub mod negociation;
mod msg;
pub mod key;
pub mod kex;

pub mod cipher;
pub mod mac;
pub mod compression;

mod encoding;

pub mod auth;

mod session;
mod channel;
mod transport;
mod registry;
mod sftp;

pub use registry::{Ssh, ErrorRecord};
pub use sftp::Sftp;
pub use key::generate_key_pair;

/// Rekeying thresholds, following the recommendations of
/// https://tools.ietf.org/html/rfc4253#section-9
#[derive(Debug, Clone)]
pub struct Limits {
    pub rekey_write_limit: usize,
    pub rekey_read_limit: usize,
    pub rekey_time_limit: std::time::Duration,
}

impl std::default::Default for Limits {
    fn default() -> Self {
        Limits {
            rekey_write_limit: 1 << 30, // 1 Gb
            rekey_read_limit: 1 << 30, // 1 Gb
            rekey_time_limit: std::time::Duration::from_secs(3600),
        }
    }
}

/// The identification string is a build-time constant; the trailing CR LF
/// is added on the wire.
pub const CLIENT_ID: &'static str = concat!("SSH-2.0-sshmux_", env!("CARGO_PKG_VERSION"));

#[derive(Debug)]
pub struct Config {
    /// Identification string sent during version exchange.
    pub client_id: String,
    pub limits: Limits,
    /// Initial window size offered on the session channel.
    pub window_size: u32,
    /// Maximum packet size offered on the session channel.
    pub maximum_packet_size: u32,
    /// How many non-version lines a server may send before its banner.
    pub banner_junk_limit: usize,
    pub preferred: negociation::Preferred,
}

impl std::default::Default for Config {
    fn default() -> Config {
        Config {
            client_id: CLIENT_ID.to_string(),
            limits: Limits::default(),
            window_size: 0x7fffffff,
            maximum_packet_size: 0x4000,
            banner_junk_limit: 50,
            preferred: negociation::Preferred::default(),
        }
    }
}
