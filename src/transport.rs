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
use std::io::{Read, Write, BufReader};
use std::time::Instant;

use rand::RngCore;
use rand::rngs::StdRng;

use super::{Config, Error, ChannelOpenReason};
use cryptobuf::CryptoBuf;
use sshbuffer::SSHBuffers;
use negociation;
use session::{Exchange, Kex, KexInit, KexDhDone, Encrypted, EncryptedState};
use kex;
use cipher;
use channel::{Channel, ChannelState, ChannelMode, Request};
use auth;
use key;
use msg;
use encoding::Reader;

/// Where a connection stands, as seen by callers. One tagged state, not a
/// pile of booleans.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Phase {
    /// Version exchange, key exchange.
    Connecting,
    Authenticating,
    /// CHANNEL_OPEN and mode requests are in flight.
    Opening,
    /// Channel open and idle; a command or subsystem may be started.
    Idle,
    ShellOpen,
    ExecRunning,
    /// The command finished; the receive buffer stays readable until the
    /// caller closes.
    ExecComplete,
    SftpOpen,
    /// Being torn down; the reactor sweeps it on its next pass.
    Closing,
    Closed,
}

pub enum TransportState {
    VersionExchange { junk_seen: usize },
    Kex(Kex),
    Encrypted(Encrypted),
}

/// One connection's protocol driver: the socket, the wire buffers, the
/// cipher contexts of the current epoch and the state machine.
pub struct Transport<S: Read + Write> {
    pub stream: BufReader<S>,
    pub buffers: SSHBuffers,
    pub cipher: cipher::CipherPair,
    pub state: Option<TransportState>,
    pub phase: Phase,
    pub channel_id: u32,
    auth: auth::Method,
    shell: bool,
    pub server_key_blob: Option<Vec<u8>>,
    /// Handshake deadline; None waits forever.
    pub deadline: Option<Instant>,
    payload: CryptoBuf,
    buffer: CryptoBuf,
}

impl<S: Read + Write> Transport<S> {
    pub fn new(channel_id: u32,
               stream: S,
               config: &Config,
               auth: auth::Method,
               shell: bool,
               deadline: Option<Instant>)
               -> Transport<S> {
        let mut buffers = SSHBuffers::new();
        buffers.write.send_ssh_id(config.client_id.as_bytes());
        Transport {
            stream: BufReader::new(stream),
            buffers: buffers,
            cipher: cipher::CipherPair::clear(),
            state: Some(TransportState::VersionExchange { junk_seen: 0 }),
            phase: Phase::Connecting,
            channel_id: channel_id,
            auth: auth,
            shell: shell,
            server_key_blob: None,
            deadline: deadline,
            payload: CryptoBuf::new(),
            buffer: CryptoBuf::new(),
        }
    }

    pub fn enc(&mut self) -> Option<&mut Encrypted> {
        match self.state {
            Some(TransportState::Encrypted(ref mut enc)) => Some(enc),
            _ => None,
        }
    }

    fn write_packet(&mut self, payload: &[u8], rng: &mut StdRng) {
        self.cipher.write(payload, &mut self.buffers.write, rng);
    }

    /// Serialize our KEXINIT, record it in the transcript and put it on
    /// the wire (clear on the first exchange, sealed during a rekey).
    fn write_kexinit(&mut self,
                     config: &Config,
                     kexinit: &mut KexInit,
                     rng: &mut StdRng) {
        let mut cookie = [0; 16];
        rng.fill_bytes(&mut cookie);
        self.buffer.clear();
        negociation::write_kex(&config.preferred, &cookie, &mut self.buffer);
        kexinit.exchange.client_kex_init.clear();
        kexinit.exchange.client_kex_init.extend(self.buffer.as_slice());
        self.cipher.write(self.buffer.as_slice(), &mut self.buffers.write, rng);
        kexinit.sent = true;
    }

    /// Negotiate against the server's KEXINIT payload and send
    /// KEXDH_INIT.
    fn client_dh(&mut self,
                 mut kexinit: KexInit,
                 server_payload: &[u8],
                 config: &Config,
                 rng: &mut StdRng)
                 -> Result<KexDhDone, Error> {
        let names = negociation::read_kex(server_payload, &config.preferred)?;
        kexinit.exchange.server_kex_init.clear();
        kexinit.exchange.server_kex_init.extend(server_payload);
        debug!("negotiated: {:?}", names);

        self.buffer.clear();
        let algo = kex::Algorithm::client_dh(names.kex,
                                             &mut kexinit.exchange.client_ephemeral,
                                             &mut self.buffer,
                                             rng);
        self.cipher.write(self.buffer.as_slice(), &mut self.buffers.write, rng);
        Ok(KexDhDone {
            exchange: kexinit.exchange,
            names: names,
            kex: algo,
            session_id: kexinit.session_id,
        })
    }

    /// KEXDH_REPLY: compute K and H, verify the host signature, send
    /// NEWKEYS. The caller decides what the returned hash binds (session
    /// id on the first exchange).
    fn client_kexdh_reply(&mut self,
                          mut kexdhdone: KexDhDone,
                          payload: &[u8],
                          rng: &mut StdRng)
                          -> Result<Kex, Error> {
        let (key_blob, hash) = {
            let mut r = payload.reader(1);
            let key_blob = r.read_string()?;
            let f = r.read_mpint()?;
            let sig = r.read_string()?;

            kexdhdone.exchange.server_ephemeral.clear();
            kexdhdone.exchange.server_ephemeral.extend(f);
            kexdhdone.kex.compute_shared_secret(f)?;

            let public_key = key::parse_public_key(key_blob)?;
            let hash = kexdhdone.kex
                .compute_exchange_hash(key_blob, &kexdhdone.exchange, &mut self.buffer)?;
            public_key.verify_exchange(&hash, sig)?;
            debug!("exchange hash verified against {:?}", public_key);
            (key_blob.to_vec(), hash)
        };
        self.server_key_blob = Some(key_blob);

        self.write_packet(&[msg::NEWKEYS], rng);
        let mut newkeys = kexdhdone.compute_keys(hash, &mut self.buffer)?;
        newkeys.sent = true;
        Ok(Kex::NewKeys(newkeys))
    }

    /// Messages that may turn up in any state.
    fn transport_misc(&mut self, payload: &[u8]) -> Result<bool, Error> {
        match payload.get(0) {
            Some(&msg::DISCONNECT) => {
                let mut r = payload.reader(1);
                let reason = r.read_u32().unwrap_or(0);
                info!("received DISCONNECT, reason {}", reason);
                Err(Error::Disconnect)
            }
            Some(&msg::IGNORE) => Ok(true),
            Some(&msg::DEBUG) => {
                let mut r = payload.reader(1);
                let _always_display = r.read_bool()?;
                let message = r.read_string()?;
                debug!("server debug: {:?}", std::str::from_utf8(message));
                Ok(true)
            }
            Some(&msg::UNIMPLEMENTED) => {
                let mut r = payload.reader(1);
                info!("server could not handle our packet {:?}", r.read_u32());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Drive the inbound pipeline one packet forward. Returns false when
    /// the socket would block; call again on the next readable event.
    pub fn read_step(&mut self, config: &Config, rng: &mut StdRng) -> Result<bool, Error> {
        let state = std::mem::replace(&mut self.state, None);
        match state {
            None => Err(Error::Inconsistent),

            Some(TransportState::VersionExchange { mut junk_seen }) => {
                let id = self.buffers
                    .read
                    .read_ssh_id(&mut self.stream, config.banner_junk_limit, &mut junk_seen)?;
                if let Some(server_id) = id {
                    info!("server version: {:?}", std::str::from_utf8(&server_id));
                    let mut exchange = Exchange::new();
                    exchange.client_id.extend(config.client_id.as_bytes());
                    exchange.server_id.extend(&server_id);
                    let mut kexinit = KexInit {
                        exchange: exchange,
                        session_id: None,
                        sent: false,
                    };
                    self.write_kexinit(config, &mut kexinit, rng);
                    self.state = Some(TransportState::Kex(Kex::KexInit(kexinit)));
                    Ok(true)
                } else {
                    self.state = Some(TransportState::VersionExchange { junk_seen: junk_seen });
                    Ok(false)
                }
            }

            Some(TransportState::Kex(Kex::KexInit(kexinit))) => {
                let mut payload_buf = std::mem::replace(&mut self.payload, CryptoBuf::new());
                let mut progressed = false;
                let next;
                if self.cipher
                    .read(&mut self.stream, &mut self.buffers.read, &mut payload_buf)? {
                    progressed = true;
                    if payload_buf.as_slice().get(0) == Some(&msg::KEXINIT) {
                        let done =
                            self.client_dh(kexinit, payload_buf.as_slice(), config, rng)?;
                        next = TransportState::Kex(Kex::KexDhDone(done));
                    } else if self.transport_misc(payload_buf.as_slice())? {
                        next = TransportState::Kex(Kex::KexInit(kexinit));
                    } else {
                        return Err(Error::KexInit);
                    }
                } else {
                    next = TransportState::Kex(Kex::KexInit(kexinit));
                }
                self.payload = payload_buf;
                self.state = Some(next);
                Ok(progressed)
            }

            Some(TransportState::Kex(Kex::KexDhDone(mut kexdhdone))) => {
                let mut payload_buf = std::mem::replace(&mut self.payload, CryptoBuf::new());
                let mut progressed = false;
                let next;
                if self.cipher
                    .read(&mut self.stream, &mut self.buffers.read, &mut payload_buf)? {
                    progressed = true;
                    if kexdhdone.names.ignore_guessed {
                        // The server sent a guessed KEXDH packet for an
                        // algorithm we rejected; drop it.
                        kexdhdone.names.ignore_guessed = false;
                        next = TransportState::Kex(Kex::KexDhDone(kexdhdone));
                    } else if payload_buf.as_slice().get(0) == Some(&msg::KEXDH_REPLY) {
                        let kex = self.client_kexdh_reply(kexdhdone, payload_buf.as_slice(), rng)?;
                        next = TransportState::Kex(kex);
                    } else if self.transport_misc(payload_buf.as_slice())? {
                        next = TransportState::Kex(Kex::KexDhDone(kexdhdone));
                    } else {
                        return Err(Error::Kex);
                    }
                } else {
                    next = TransportState::Kex(Kex::KexDhDone(kexdhdone));
                }
                self.payload = payload_buf;
                self.state = Some(next);
                Ok(progressed)
            }

            Some(TransportState::Kex(Kex::NewKeys(mut newkeys))) => {
                let mut payload_buf = std::mem::replace(&mut self.payload, CryptoBuf::new());
                let mut progressed = false;
                let next;
                if self.cipher
                    .read(&mut self.stream, &mut self.buffers.read, &mut payload_buf)? {
                    progressed = true;
                    if payload_buf.as_slice().get(0) == Some(&msg::NEWKEYS) {
                        newkeys.received = true;
                        // Install both directions at once; nothing is in
                        // flight between our NEWKEYS and the server's.
                        let mut enc = Encrypted::new(&newkeys);
                        enc.exchange = Some(newkeys.exchange);
                        self.cipher = newkeys.cipher;

                        self.buffer.clear();
                        self.buffer.push(msg::SERVICE_REQUEST);
                        self.buffer.extend_ssh_string(b"ssh-userauth");
                        let buffer = std::mem::replace(&mut self.buffer, CryptoBuf::new());
                        self.write_packet(buffer.as_slice(), rng);
                        self.buffer = buffer;

                        self.phase = Phase::Authenticating;
                        next = TransportState::Encrypted(enc);
                    } else if self.transport_misc(payload_buf.as_slice())? {
                        next = TransportState::Kex(Kex::NewKeys(newkeys));
                    } else {
                        return Err(Error::Kex);
                    }
                } else {
                    next = TransportState::Kex(Kex::NewKeys(newkeys));
                }
                self.payload = payload_buf;
                self.state = Some(next);
                Ok(progressed)
            }

            Some(TransportState::Encrypted(mut enc)) => {
                let mut payload_buf = std::mem::replace(&mut self.payload, CryptoBuf::new());
                let mut progressed = false;
                if self.cipher
                    .read(&mut self.stream, &mut self.buffers.read, &mut payload_buf)? {
                    progressed = true;
                    self.client_read_encrypted(&mut enc, payload_buf.as_slice(), config, rng)?;
                }
                self.payload = payload_buf;
                self.state = Some(TransportState::Encrypted(enc));
                Ok(progressed)
            }
        }
    }

    fn client_read_encrypted(&mut self,
                             enc: &mut Encrypted,
                             buf: &[u8],
                             config: &Config,
                             rng: &mut StdRng)
                             -> Result<(), Error> {
        // Either this packet is a KEXINIT, in which case we start a key
        // re-exchange.
        if buf.get(0) == Some(&msg::KEXINIT) {
            match std::mem::replace(&mut enc.rekey, None) {
                Some(Kex::KexInit(kexinit)) => {
                    // We initiated; our KEXINIT is already out.
                    enc.rekey = Some(Kex::KexDhDone(self.client_dh(kexinit, buf, config, rng)?));
                }
                None => {
                    // The server is initiating a rekeying.
                    if let Some(exchange) = std::mem::replace(&mut enc.exchange, None) {
                        let mut kexinit = KexInit::rekey(exchange, &enc.session_id, false);
                        self.write_kexinit(config, &mut kexinit, rng);
                        enc.rekey =
                            Some(Kex::KexDhDone(self.client_dh(kexinit, buf, config, rng)?));
                    }
                }
                Some(other) => {
                    // KEXINIT in the middle of a running exchange.
                    debug!("unexpected KEXINIT, rekey state {:?}", other);
                    return Err(Error::Kex);
                }
            }
            return Ok(());
        }

        // A rekey in progress owns all transport-layer messages.
        match std::mem::replace(&mut enc.rekey, None) {
            Some(Kex::KexDhDone(mut kexdhdone)) => {
                if kexdhdone.names.ignore_guessed {
                    kexdhdone.names.ignore_guessed = false;
                    enc.rekey = Some(Kex::KexDhDone(kexdhdone));
                    return Ok(());
                }
                if buf.get(0) == Some(&msg::KEXDH_REPLY) {
                    enc.rekey = Some(self.client_kexdh_reply(kexdhdone, buf, rng)?);
                    return Ok(());
                }
                enc.rekey = Some(Kex::KexDhDone(kexdhdone));
                // Transport messages are still allowed while rekeying.
                if self.transport_misc(buf)? {
                    return Ok(());
                }
                return Err(Error::Kex);
            }
            Some(Kex::NewKeys(newkeys)) => {
                if buf.get(0) == Some(&msg::NEWKEYS) {
                    // The new epoch is installed atomically; the session
                    // id and the sequence numbers carry over.
                    enc.exchange = Some(newkeys.exchange);
                    self.cipher = newkeys.cipher;
                    debug!("rekey complete on channel {}", self.channel_id);
                    return Ok(());
                }
                enc.rekey = Some(Kex::NewKeys(newkeys));
                if self.transport_misc(buf)? {
                    return Ok(());
                }
                return Err(Error::Kex);
            }
            other => enc.rekey = other,
        }

        if self.transport_misc(buf)? {
            return Ok(());
        }

        match buf.get(0).cloned() {
            Some(msg::SERVICE_ACCEPT) => {
                if enc.state != EncryptedState::WaitingServiceAccept {
                    return Err(Error::Inconsistent);
                }
                let mut r = buf.reader(1);
                if r.read_string()? != b"ssh-userauth" {
                    return Err(Error::Inconsistent);
                }
                self.write_auth_request(enc);
                enc.state = EncryptedState::WaitingAuthRequest;
                Ok(())
            }
            Some(msg::USERAUTH_BANNER) => {
                let mut r = buf.reader(1);
                info!("auth banner: {:?}", std::str::from_utf8(r.read_string()?));
                Ok(())
            }
            Some(msg::USERAUTH_SUCCESS) => {
                if enc.state != EncryptedState::WaitingAuthRequest {
                    return Err(Error::Inconsistent);
                }
                enc.state = EncryptedState::Authenticated;
                self.phase = Phase::Opening;

                let mut channel =
                    Channel::new(self.channel_id, config.window_size, config.maximum_packet_size);
                channel.open(&mut enc.write);
                if self.shell {
                    channel.pending_requests.push_back(Request::PtyReq);
                    channel.pending_requests.push_back(Request::Shell);
                }
                enc.channel = Some(channel);
                Ok(())
            }
            Some(msg::USERAUTH_FAILURE) => {
                let mut r = buf.reader(1);
                let remaining = r.read_string()?;
                let mut methods = auth::MethodSet::empty();
                for name in remaining.split(|&c| c == b',') {
                    if let Some(m) = auth::MethodSet::from_bytes(name) {
                        methods |= m;
                    }
                }
                if methods.contains(self.auth.set()) {
                    info!("credentials rejected");
                } else {
                    info!("server does not accept {:?} at all; it offers {:?}",
                          self.auth.set(),
                          methods);
                }
                Err(Error::AuthFailed)
            }
            Some(msg::USERAUTH_PK_OK) => {
                self.client_send_signature(enc)?;
                Ok(())
            }
            Some(msg::GLOBAL_REQUEST) => {
                let mut r = buf.reader(1);
                let name = r.read_string()?;
                let want_reply = r.read_bool()?;
                debug!("global request: {:?}", std::str::from_utf8(name));
                if want_reply {
                    push_packet!(enc.write, {
                        enc.write.push(msg::REQUEST_FAILURE);
                    });
                }
                Ok(())
            }
            Some(msg::REQUEST_SUCCESS) | Some(msg::REQUEST_FAILURE) => {
                // We never send global requests.
                debug!("stray global request reply");
                Ok(())
            }
            Some(msg::CHANNEL_OPEN_CONFIRMATION) => {
                let mut r = buf.reader(1);
                let id_send = r.read_u32()?;
                let id_recv = r.read_u32()?;
                let window = r.read_u32()?;
                let max_packet = r.read_u32()?;
                match enc.channel {
                    Some(ref mut channel) if channel.sender_channel == id_send => {
                        channel.recipient_channel = id_recv;
                        channel.recipient_window_size = window;
                        channel.recipient_maximum_packet_size = max_packet;
                        channel.state = ChannelState::Open;
                        if !channel.send_next_request(&mut enc.write) {
                            self.phase = Phase::Idle;
                        }
                        Ok(())
                    }
                    // We've not requested this channel, close connection.
                    _ => Err(Error::Inconsistent),
                }
            }
            Some(msg::CHANNEL_OPEN_FAILURE) => {
                let mut r = buf.reader(1);
                let _channel = r.read_u32()?;
                let reason = ChannelOpenReason::from_u32(r.read_u32()?);
                Err(Error::ChannelOpenFailure(reason))
            }
            Some(msg::CHANNEL_SUCCESS) => {
                let mut done = false;
                if let Some(ref mut channel) = enc.channel {
                    match channel.request_in_flight.take() {
                        Some(Request::PtyReq) => {}
                        Some(Request::Shell) => {
                            channel.mode = Some(ChannelMode::Shell);
                            self.phase = Phase::ShellOpen;
                        }
                        Some(Request::Exec(_)) => {
                            channel.mode = Some(ChannelMode::Exec);
                            self.phase = Phase::ExecRunning;
                        }
                        Some(Request::Subsystem(_)) => {
                            channel.mode = Some(ChannelMode::Subsystem);
                            self.phase = Phase::SftpOpen;
                        }
                        None => debug!("CHANNEL_SUCCESS with no request in flight"),
                    }
                    if !channel.send_next_request(&mut enc.write) &&
                       self.phase == Phase::Opening {
                        done = true;
                    }
                }
                if done {
                    self.phase = Phase::Idle;
                }
                Ok(())
            }
            Some(msg::CHANNEL_FAILURE) => Err(Error::ChannelRequestFailure),
            Some(msg::CHANNEL_DATA) => {
                let mut r = buf.reader(1);
                let _channel_num = r.read_u32()?;
                let data = r.read_string()?;
                if let Some(ref mut channel) = enc.channel {
                    channel.received.extend_from_slice(data);
                    channel.adjust_window(&mut enc.write, data.len());
                }
                Ok(())
            }
            Some(msg::CHANNEL_EXTENDED_DATA) => {
                let mut r = buf.reader(1);
                let _channel_num = r.read_u32()?;
                let code = r.read_u32()?;
                let data = r.read_string()?;
                debug!("extended data, code {}", code);
                // stderr lands in the same caller-visible buffer.
                if let Some(ref mut channel) = enc.channel {
                    channel.received.extend_from_slice(data);
                    channel.adjust_window(&mut enc.write, data.len());
                }
                Ok(())
            }
            Some(msg::CHANNEL_WINDOW_ADJUST) => {
                let mut r = buf.reader(1);
                let _channel_num = r.read_u32()?;
                let amount = r.read_u32()?;
                if let Some(ref mut channel) = enc.channel {
                    channel.recipient_window_size =
                        channel.recipient_window_size.saturating_add(amount);
                }
                Ok(())
            }
            Some(msg::CHANNEL_EOF) => {
                if let Some(ref mut channel) = enc.channel {
                    if channel.mode == Some(ChannelMode::Exec) {
                        channel.cmd_complete = true;
                        self.phase = Phase::ExecComplete;
                    }
                }
                Ok(())
            }
            Some(msg::CHANNEL_CLOSE) => {
                if let Some(ref mut channel) = enc.channel {
                    // Reply with our own CHANNEL_CLOSE if we haven't.
                    channel.close(&mut enc.write);
                    if channel.mode == Some(ChannelMode::Exec) {
                        // Keep the receive buffer readable until the
                        // caller closes.
                        channel.cmd_complete = true;
                        self.phase = Phase::ExecComplete;
                    } else {
                        self.phase = Phase::Closing;
                    }
                }
                Ok(())
            }
            Some(msg::CHANNEL_REQUEST) => {
                let mut r = buf.reader(1);
                let _channel_num = r.read_u32()?;
                let req = r.read_string()?;
                match req {
                    b"exit-status" => {
                        r.read_byte()?; // want_reply, always false here
                        let status = r.read_u32()?;
                        if let Some(ref mut channel) = enc.channel {
                            channel.exit_status = Some(status);
                            if channel.mode == Some(ChannelMode::Exec) {
                                channel.cmd_complete = true;
                                self.phase = Phase::ExecComplete;
                            }
                        }
                        Ok(())
                    }
                    b"exit-signal" => {
                        r.read_byte()?;
                        let signal = r.read_string()?;
                        info!("remote command killed by signal {:?}",
                              std::str::from_utf8(signal));
                        if let Some(ref mut channel) = enc.channel {
                            if channel.mode == Some(ChannelMode::Exec) {
                                channel.cmd_complete = true;
                                self.phase = Phase::ExecComplete;
                            }
                        }
                        Ok(())
                    }
                    req => {
                        debug!("unhandled channel request: {:?}", std::str::from_utf8(req));
                        Ok(())
                    }
                }
            }
            _ => {
                info!("unhandled packet: {:?}", buf.get(0));
                let seqn = self.buffers.read.seqn.0.wrapping_sub(1);
                push_packet!(enc.write, {
                    enc.write.push(msg::UNIMPLEMENTED);
                    enc.write.push_u32_be(seqn);
                });
                Ok(())
            }
        }
    }

    fn write_auth_request(&mut self, enc: &mut Encrypted) {
        push_packet!(enc.write, {
            enc.write.push(msg::USERAUTH_REQUEST);
            match self.auth {
                auth::Method::Password { ref user, ref password } => {
                    enc.write.extend_ssh_string(user.as_bytes());
                    enc.write.extend_ssh_string(b"ssh-connection");
                    enc.write.extend_ssh_string(b"password");
                    enc.write.push(0);
                    enc.write.extend_ssh_string(password.as_bytes());
                }
                auth::Method::PublicKey { ref user, ref key } => {
                    enc.write.extend_ssh_string(user.as_bytes());
                    enc.write.extend_ssh_string(b"ssh-connection");
                    enc.write.extend_ssh_string(b"publickey");
                    enc.write.push(0); // This is a probe.
                    enc.write.extend_ssh_string(key.name().as_bytes());
                    key.push_to(&mut enc.write);
                }
            }
        });
    }

    /// The server accepted our key (USERAUTH_PK_OK); send the signed
    /// request. The signature covers the session id and the request
    /// payload itself.
    fn client_send_signature(&mut self, enc: &mut Encrypted) -> Result<(), Error> {
        if let auth::Method::PublicKey { ref user, ref key } = self.auth {
            self.buffer.clear();
            self.buffer.extend_ssh_string(enc.session_id.as_bytes());
            let i0 = self.buffer.len();
            self.buffer.push(msg::USERAUTH_REQUEST);
            self.buffer.extend_ssh_string(user.as_bytes());
            self.buffer.extend_ssh_string(b"ssh-connection");
            self.buffer.extend_ssh_string(b"publickey");
            self.buffer.push(1);
            self.buffer.extend_ssh_string(key.name().as_bytes());
            key.push_to(&mut self.buffer);
            // Sign over everything built so far (session id included),
            // then append the signature to the request.
            let signed = self.buffer.as_slice().to_vec();
            key.add_signature(&mut self.buffer, &signed)?;
            push_packet!(enc.write, {
                enc.write.extend(&self.buffer.as_slice()[i0..]);
            });
        }
        Ok(())
    }

    /// Seal queued session packets, start a rekey when a limit trips, and
    /// push the wire bytes out. Returns false while bytes remain unsent.
    pub fn flush(&mut self, config: &Config, rng: &mut StdRng) -> Result<bool, Error> {
        let mut start_rekey = false;
        if let Some(TransportState::Encrypted(ref mut enc)) = self.state {
            start_rekey = enc.flush(&config.limits, &mut self.cipher, &mut self.buffers, rng);
            if !start_rekey && enc.rekey.is_none() &&
               self.buffers.needs_rekeying(&config.limits) {
                self.buffers.write.bytes = 0;
                self.buffers.read.bytes = 0;
                self.buffers.last_rekey = Instant::now();
                start_rekey = true;
            }
        }
        if start_rekey {
            self.initiate_rekey(config, rng);
        }
        let done = {
            let buffers = &mut self.buffers;
            buffers.write_all(self.stream.get_mut())?
        };
        Ok(done)
    }

    fn initiate_rekey(&mut self, config: &Config, rng: &mut StdRng) {
        let mut kexinit = None;
        if let Some(TransportState::Encrypted(ref mut enc)) = self.state {
            if enc.rekey.is_none() {
                if let Some(exchange) = std::mem::replace(&mut enc.exchange, None) {
                    kexinit = Some(KexInit::rekey(exchange, &enc.session_id, false));
                }
            }
        }
        if let Some(mut kexinit) = kexinit {
            debug!("initiating rekey on channel {}", self.channel_id);
            self.write_kexinit(config, &mut kexinit, rng);
            if let Some(TransportState::Encrypted(ref mut enc)) = self.state {
                enc.rekey = Some(Kex::KexInit(kexinit));
            }
        }
    }

    /// Queue a DISCONNECT and mark the connection for sweeping.
    pub fn disconnect(&mut self, rng: &mut StdRng) {
        self.buffer.clear();
        self.buffer.push(msg::DISCONNECT);
        self.buffer.push_u32_be(11); // SSH_DISCONNECT_BY_APPLICATION
        self.buffer.extend_ssh_string(b"");
        self.buffer.extend_ssh_string(b"");
        let buffer = std::mem::replace(&mut self.buffer, CryptoBuf::new());
        self.write_packet(buffer.as_slice(), rng);
        self.buffer = buffer;
        self.phase = Phase::Closing;
    }
}

#[cfg(test)]
mod test {
    extern crate env_logger;
    use super::*;
    use rand::SeedableRng;
    use cipher::CipherPair;
    use sshbuffer::SSHBuffer;

    /// A fake socket: reads come from a script, writes are captured, and
    /// running past the script yields WouldBlock like a drained
    /// non-blocking socket.
    struct FakeSock {
        input: Vec<u8>,
        pos: usize,
        output: Vec<u8>,
    }

    impl FakeSock {
        fn new() -> FakeSock {
            FakeSock {
                input: Vec::new(),
                pos: 0,
                output: Vec::new(),
            }
        }
    }

    impl Read for FakeSock {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.input.len() {
                return Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "drained"));
            }
            let n = std::cmp::min(buf.len(), self.input.len() - self.pos);
            buf[..n].copy_from_slice(&self.input[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    impl Write for FakeSock {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn new_transport(input: Vec<u8>) -> Transport<FakeSock> {
        let mut sock = FakeSock::new();
        sock.input = input;
        let config = Config::default();
        let auth = auth::Method::Password {
            user: "u".to_string(),
            password: "p".to_string(),
        };
        Transport::new(1, sock, &config, auth, false, None)
    }

    fn drain(t: &mut Transport<FakeSock>, config: &Config, rng: &mut StdRng) {
        loop {
            match t.read_step(config, rng) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => panic!("read_step failed: {:?}", e),
            }
        }
    }

    #[test]
    fn banner_then_kexinit() {
        let _ = env_logger::try_init();
        let config = Config::default();
        let mut rng = StdRng::seed_from_u64(7);
        let mut t = new_transport(b"Welcome!\r\nSSH-2.0-OpenSSH_7.4\r\n".to_vec());

        drain(&mut t, &config, &mut rng);
        match t.state {
            Some(TransportState::Kex(Kex::KexInit(ref kexinit))) => {
                assert!(kexinit.sent);
                assert_eq!(kexinit.exchange.server_id.as_slice(), b"SSH-2.0-OpenSSH_7.4");
                assert_eq!(kexinit.exchange.client_id.as_slice(),
                           config.client_id.as_bytes());
                assert_eq!(kexinit.exchange.client_kex_init[0], msg::KEXINIT);
            }
            _ => panic!("wrong state after banner"),
        }
        t.flush(&config, &mut rng).unwrap();
        // Banner and KEXINIT went out.
        let out = t.stream.get_ref().output.clone();
        assert!(out.starts_with(config.client_id.as_bytes()));
        assert!(out.len() > config.client_id.len() + 2 + 16);
    }

    #[test]
    fn server_kexinit_triggers_dh() {
        let config = Config::default();
        let mut rng = StdRng::seed_from_u64(7);

        let mut input = b"SSH-2.0-OpenSSH_7.4\r\n".to_vec();
        // A fair server KEXINIT, framed in the clear.
        let mut payload = CryptoBuf::new();
        negociation::write_kex(&config.preferred, &[9; 16], &mut payload);
        let mut clear = CipherPair::clear();
        let mut wire = SSHBuffer::new();
        clear.write(payload.as_slice(), &mut wire, &mut rng);
        input.extend_from_slice(wire.buffer.as_slice());

        let mut t = new_transport(input);
        drain(&mut t, &config, &mut rng);
        match t.state {
            Some(TransportState::Kex(Kex::KexDhDone(ref done))) => {
                assert_eq!(done.names.kex.as_ref(), "diffie-hellman-group1-sha1");
                assert!(done.session_id.is_none());
            }
            _ => panic!("expected KexDhDone"),
        }
        // KEXDH_INIT is queued behind the banner and our KEXINIT.
        t.flush(&config, &mut rng).unwrap();
        assert!(t.stream.get_ref().output.len() > 0);
    }

    #[test]
    fn garbage_instead_of_kexinit_is_fatal() {
        let config = Config::default();
        let mut rng = StdRng::seed_from_u64(7);

        let mut input = b"SSH-2.0-OpenSSH_7.4\r\n".to_vec();
        let mut clear = CipherPair::clear();
        let mut wire = SSHBuffer::new();
        clear.write(&[msg::CHANNEL_DATA, 0, 0, 0, 0], &mut wire, &mut rng);
        input.extend_from_slice(wire.buffer.as_slice());

        let mut t = new_transport(input);
        // Banner.
        assert!(t.read_step(&config, &mut rng).unwrap());
        match t.read_step(&config, &mut rng) {
            Err(Error::KexInit) => {}
            o => panic!("expected KexInit error, got {:?}", o),
        }
    }

    #[test]
    fn ignore_and_debug_are_skipped_during_kex() {
        let config = Config::default();
        let mut rng = StdRng::seed_from_u64(7);

        let mut input = b"SSH-2.0-OpenSSH_7.4\r\n".to_vec();
        let mut clear = CipherPair::clear();
        let mut wire = SSHBuffer::new();
        clear.write(&[msg::IGNORE], &mut wire, &mut rng);
        let mut debug_payload = CryptoBuf::new();
        debug_payload.push(msg::DEBUG);
        debug_payload.push(0);
        debug_payload.extend_ssh_string(b"hello");
        debug_payload.extend_ssh_string(b"en");
        clear.write(debug_payload.as_slice(), &mut wire, &mut rng);
        input.extend_from_slice(wire.buffer.as_slice());

        let mut t = new_transport(input);
        drain(&mut t, &config, &mut rng);
        match t.state {
            Some(TransportState::Kex(Kex::KexInit(_))) => {}
            _ => panic!("IGNORE/DEBUG should not advance the state"),
        }
    }
}
