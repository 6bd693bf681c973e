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

//! The connection registry and its reactor. One background thread owns
//! readiness for every socket; caller threads interact through the
//! registry lock and a condition variable the reactor signals after each
//! pass that changed anything.

use std;
use std::net::ToSocketAddrs;
use std::sync::{Arc, Mutex, Condvar};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};
use mio::net::TcpStream;
use rand::SeedableRng;
use rand::rngs::StdRng;

use super::{Config, Error};
use auth;
use key;
use channel::{ChannelState, Request};
use transport::{Transport, Phase};

/// A structured record of a fatal (or misuse) error, keyed by channel id.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub channel: u32,
    pub message: String,
}

pub(crate) struct Connection {
    pub channel_id: u32,
    pub transport: Transport<TcpStream>,
}

pub(crate) struct Registry {
    pub connections: Vec<Connection>,
    pub errors: Vec<ErrorRecord>,
    pub config: Config,
}

pub(crate) struct Shared {
    pub registry: Mutex<Registry>,
    pub cond: Condvar,
    pub running: AtomicBool,
    /// The process-wide RNG has its own lock, so crypto code running
    /// under the registry lock never inverts lock order against another
    /// caller. Always acquire registry before rng.
    pub rng: Mutex<StdRng>,
    pub poll_registry: mio::Registry,
}

/// How long callers sleep on the condvar between wakeups; the reactor
/// also signals it after every pass that changed state.
const WAIT_SLICE: Duration = Duration::from_millis(10);

pub(crate) fn find_index(connections: &[Connection], id: u32) -> Option<usize> {
    connections.iter().position(|c| c.channel_id == id)
}

fn alloc_channel_id(connections: &[Connection]) -> Option<u32> {
    let mut id: u32 = 1;
    'outer: while id < 0x7fffffff {
        for c in connections {
            if c.channel_id == id {
                id += 1;
                continue 'outer;
            }
        }
        return Some(id);
    }
    None
}

fn record(errors: &mut Vec<ErrorRecord>, channel: u32, message: String) {
    info!("channel {}: {}", channel, message);
    errors.push(ErrorRecord {
        channel: channel,
        message: message,
    });
}

/// Push the structured record and queue the DISCONNECT; the sweep picks
/// the connection up on the next pass.
fn fatal(conn: &mut Connection, errors: &mut Vec<ErrorRecord>, rng: &mut StdRng, e: Error) {
    record(errors, conn.channel_id, format!("{:?}", e));
    conn.transport.disconnect(rng);
}

/// Queue `data` on a channel, parking while the remote window is closed.
/// Shared between the context API and the SFTP handle.
pub(crate) fn send_on(shared: &Shared, channel_id: u32, data: &[u8]) -> Result<(), Error> {
    let mut guard = shared.registry.lock().unwrap();
    let mut offset = 0;
    loop {
        {
            let reg = &mut *guard;
            let i = match find_index(&reg.connections, channel_id) {
                Some(i) => i,
                None => {
                    record(&mut reg.errors, channel_id,
                           format!("bad channel {} specified for sending", channel_id));
                    return Err(Error::WrongChannel);
                }
            };
            let conn = &mut reg.connections[i];
            match conn.transport.phase {
                Phase::Closing | Phase::Closed => return Err(Error::ConnectionFailed),
                _ => {}
            }
            let enc = conn.transport.enc().ok_or(Error::WrongState)?;
            match enc.channel {
                Some(ref mut channel) => {
                    if channel.state != ChannelState::Open {
                        return Err(Error::WrongState);
                    }
                    offset += channel.data(&mut enc.write, &data[offset..]);
                }
                None => return Err(Error::WrongState),
            }
        }
        if offset >= data.len() {
            return Ok(());
        }
        guard = shared.cond.wait_timeout(guard, WAIT_SLICE).unwrap().0;
    }
}

fn ready(phase: Phase) -> bool {
    match phase {
        Phase::Idle | Phase::ShellOpen | Phase::ExecRunning | Phase::ExecComplete |
        Phase::SftpOpen => true,
        _ => false,
    }
}

fn reactor(shared: Arc<Shared>, mut poll: Poll) {
    let mut events = Events::with_capacity(64);
    while shared.running.load(Ordering::SeqCst) {
        let pollable = {
            let mut guard = shared.registry.lock().unwrap();
            let reg = &mut *guard;
            let mut rng = shared.rng.lock().unwrap();
            let now = Instant::now();

            for conn in reg.connections.iter_mut() {
                // Handshake deadlines; established connections wait on
                // caller-supplied timeouts instead.
                if ready(conn.transport.phase) {
                    conn.transport.deadline = None;
                } else if let Some(deadline) = conn.transport.deadline {
                    if now >= deadline && conn.transport.phase != Phase::Closing {
                        fatal(conn, &mut reg.errors, &mut rng, Error::Timeout);
                    }
                }
                // Drain pending writes.
                match conn.transport.flush(&reg.config, &mut rng) {
                    Ok(_) => {}
                    Err(e) => {
                        if conn.transport.phase != Phase::Closing {
                            fatal(conn, &mut reg.errors, &mut rng, e);
                        }
                        conn.transport.phase = Phase::Closed;
                    }
                }
                if conn.transport.phase == Phase::Closing {
                    // The DISCONNECT had its flush; mark for the sweep.
                    conn.transport.phase = Phase::Closed;
                }
                if conn.transport.phase == Phase::Closed {
                    let _ = shared.poll_registry
                        .deregister(conn.transport.stream.get_mut());
                }
            }
            // The sweep is the only place connections leave the registry.
            let before = reg.connections.len();
            reg.connections.retain(|c| c.transport.phase != Phase::Closed);
            if reg.connections.len() != before {
                shared.cond.notify_all();
            }
            reg.connections.len()
        };

        if pollable > 0 {
            match poll.poll(&mut events, Some(Duration::from_millis(10))) {
                Ok(()) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("poll failed: {:?}", e);
                    std::thread::sleep(Duration::from_millis(1));
                    continue;
                }
            }
        } else {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }

        if events.is_empty() {
            continue;
        }

        let mut guard = shared.registry.lock().unwrap();
        let reg = &mut *guard;
        let mut rng = shared.rng.lock().unwrap();
        for event in events.iter() {
            let id = event.token().0 as u32;
            let i = match find_index(&reg.connections, id) {
                Some(i) => i,
                None => continue,
            };
            loop {
                let step = {
                    let conn = &mut reg.connections[i];
                    conn.transport.read_step(&reg.config, &mut rng)
                };
                match step {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        fatal(&mut reg.connections[i], &mut reg.errors, &mut rng, e);
                        break;
                    }
                }
            }
            // Whatever the handlers queued goes out right away.
            let flush = {
                let conn = &mut reg.connections[i];
                conn.transport.flush(&reg.config, &mut rng)
            };
            if let Err(e) = flush {
                let conn = &mut reg.connections[i];
                if conn.transport.phase != Phase::Closing {
                    fatal(conn, &mut reg.errors, &mut rng, e);
                }
                conn.transport.phase = Phase::Closed;
            }
        }
        shared.cond.notify_all();
    }
}

/// The library context: the registry of live connections, the reactor
/// thread, the shared RNG and the error log. Freely instantiable; each
/// instance runs its own reactor.
pub struct Ssh {
    pub(crate) shared: Arc<Shared>,
    reactor: Option<JoinHandle<()>>,
}

impl Ssh {
    pub fn new() -> Result<Ssh, Error> {
        Ssh::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Ssh, Error> {
        let poll = Poll::new()?;
        let poll_registry = poll.registry().try_clone()?;
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry {
                connections: Vec::new(),
                errors: Vec::new(),
                config: config,
            }),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
            rng: Mutex::new(StdRng::from_entropy()),
            poll_registry: poll_registry,
        });
        let thread_shared = shared.clone();
        let reactor = std::thread::Builder::new()
            .name("sshmux-reactor".to_string())
            .spawn(move || reactor(thread_shared, poll))?;
        Ok(Ssh {
            shared: shared,
            reactor: Some(reactor),
        })
    }

    /// Open a connection and authenticate with a password. Returns the
    /// channel id all further calls are keyed by. `timeout_s == 0` waits
    /// forever.
    pub fn connect_with_password(&self,
                                 host: &str,
                                 port: u16,
                                 user: &str,
                                 password: &str,
                                 shell: bool,
                                 timeout_s: u64)
                                 -> Result<u32, Error> {
        let auth = auth::Method::Password {
            user: user.to_string(),
            password: password.to_string(),
        };
        self.connect(host, port, auth, shell, timeout_s)
    }

    /// Open a connection and authenticate with a private key file (PEM,
    /// RSA or DSA).
    pub fn connect_with_key(&self,
                            host: &str,
                            port: u16,
                            user: &str,
                            priv_key_path: &str,
                            shell: bool,
                            timeout_s: u64)
                            -> Result<u32, Error> {
        let key = key::load_secret_key(priv_key_path)?;
        let auth = auth::Method::PublicKey {
            user: user.to_string(),
            key: key,
        };
        self.connect(host, port, auth, shell, timeout_s)
    }

    fn connect(&self,
               host: &str,
               port: u16,
               auth: auth::Method,
               shell: bool,
               timeout_s: u64)
               -> Result<u32, Error> {
        let deadline = if timeout_s > 0 {
            Some(Instant::now() + Duration::from_secs(timeout_s))
        } else {
            None
        };

        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                Error::IO(std::io::Error::new(std::io::ErrorKind::Other,
                                              "host did not resolve"))
            })?;
        let stream = if let Some(deadline) = deadline {
            let budget = deadline.saturating_duration_since(Instant::now());
            std::net::TcpStream::connect_timeout(&addr, std::cmp::max(budget, Duration::from_millis(1)))?
        } else {
            std::net::TcpStream::connect(&addr)?
        };
        stream.set_nonblocking(true)?;
        let _ = stream.set_nodelay(true);
        let mut stream = TcpStream::from_std(stream);

        let id = {
            let mut guard = self.shared.registry.lock().unwrap();
            let reg = &mut *guard;
            let id = match alloc_channel_id(&reg.connections) {
                Some(id) => id,
                None => {
                    record(&mut reg.errors, 0,
                           "maximum channel count reached".to_string());
                    return Err(Error::WrongChannel);
                }
            };
            self.shared.poll_registry
                .register(&mut stream, Token(id as usize), Interest::READABLE)?;
            let transport = Transport::new(id, stream, &reg.config, auth, shell, deadline);
            reg.connections.push(Connection {
                channel_id: id,
                transport: transport,
            });
            id
        };

        // The reactor drives the handshake; wait for the outcome.
        let mut guard = self.shared.registry.lock().unwrap();
        loop {
            match find_index(&guard.connections, id) {
                None => return Err(Error::ConnectionFailed),
                Some(i) => {
                    match guard.connections[i].transport.phase {
                        Phase::Idle | Phase::ShellOpen => return Ok(id),
                        Phase::Closing | Phase::Closed => return Err(Error::ConnectionFailed),
                        _ => {}
                    }
                }
            }
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    let reg = &mut *guard;
                    if let Some(i) = find_index(&reg.connections, id) {
                        let mut rng = self.shared.rng.lock().unwrap();
                        record(&mut reg.errors, id, format!("{:?}", Error::Timeout));
                        reg.connections[i].transport.disconnect(&mut rng);
                    }
                    return Err(Error::Timeout);
                }
                let slice = std::cmp::min(WAIT_SLICE, deadline - now);
                guard = self.shared.cond.wait_timeout(guard, slice).unwrap().0;
            } else {
                guard = self.shared.cond.wait_timeout(guard, WAIT_SLICE).unwrap().0;
            }
        }
    }

    /// Queue `data` on the channel. Parks while the remote window is
    /// closed, until the peer adjusts it or the connection dies.
    pub fn send(&self, channel_id: u32, data: &[u8]) -> Result<(), Error> {
        send_on(&self.shared, channel_id, data)
    }

    /// Run a remote command on an idle connection and wait for it to
    /// complete (EOF, CLOSE or exit-status). `timeout_s == 0` waits
    /// forever; on expiry the command keeps running and false is
    /// returned.
    pub fn send_cmd(&self, channel_id: u32, cmd: &str, timeout_s: u64) -> Result<bool, Error> {
        let deadline = if timeout_s > 0 {
            Some(Instant::now() + Duration::from_secs(timeout_s))
        } else {
            None
        };
        let mut guard = self.shared.registry.lock().unwrap();
        {
            let reg = &mut *guard;
            let i = match find_index(&reg.connections, channel_id) {
                Some(i) => i,
                None => {
                    record(&mut reg.errors, channel_id,
                           format!("bad channel {} specified for sending", channel_id));
                    return Err(Error::WrongChannel);
                }
            };
            let conn = &mut reg.connections[i];
            if conn.transport.phase != Phase::Idle {
                return Err(Error::WrongState);
            }
            let enc = conn.transport.enc().ok_or(Error::WrongState)?;
            match enc.channel {
                Some(ref mut channel) => {
                    channel.pending_requests.push_back(Request::Exec(cmd.to_string()));
                    channel.send_next_request(&mut enc.write);
                }
                None => return Err(Error::WrongState),
            }
        }

        loop {
            {
                let reg = &*guard;
                let i = match find_index(&reg.connections, channel_id) {
                    Some(i) => i,
                    None => return Ok(false),
                };
                let conn = &reg.connections[i];
                match conn.transport.phase {
                    Phase::ExecComplete => return Ok(true),
                    Phase::Closing | Phase::Closed => return Ok(false),
                    _ => {}
                }
            }
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(false);
                }
                let slice = std::cmp::min(WAIT_SLICE, deadline - now);
                guard = self.shared.cond.wait_timeout(guard, slice).unwrap().0;
            } else {
                guard = self.shared.cond.wait_timeout(guard, WAIT_SLICE).unwrap().0;
            }
        }
    }

    /// Snapshot of the channel's receive buffer, or None when empty or
    /// unknown.
    pub fn read(&self, channel_id: u32) -> Option<Vec<u8>> {
        let mut guard = self.shared.registry.lock().unwrap();
        let reg = &mut *guard;
        match find_index(&reg.connections, channel_id) {
            Some(i) => {
                let conn = &mut reg.connections[i];
                conn.transport
                    .enc()
                    .and_then(|enc| enc.channel.as_ref())
                    .and_then(|channel| if channel.received.is_empty() {
                        None
                    } else {
                        Some(channel.received.clone())
                    })
            }
            None => {
                record(&mut reg.errors, channel_id,
                       format!("bad channel {} specified for reading", channel_id));
                None
            }
        }
    }

    pub fn received_size(&self, channel_id: u32) -> usize {
        let mut guard = self.shared.registry.lock().unwrap();
        let reg = &mut *guard;
        match find_index(&reg.connections, channel_id) {
            Some(i) => {
                let conn = &mut reg.connections[i];
                conn.transport
                    .enc()
                    .and_then(|enc| enc.channel.as_ref())
                    .map_or(0, |channel| channel.received.len())
            }
            None => 0,
        }
    }

    /// Poll the receive buffer for `pattern` (searched from the tail)
    /// until it shows up or the timeout expires. `timeout_s == 0` waits
    /// forever.
    pub fn wait_for(&self, channel_id: u32, pattern: &[u8], timeout_s: u64) -> bool {
        let deadline = if timeout_s > 0 {
            Some(Instant::now() + Duration::from_secs(timeout_s))
        } else {
            None
        };
        let mut guard = self.shared.registry.lock().unwrap();
        loop {
            {
                let reg = &mut *guard;
                let i = match find_index(&reg.connections, channel_id) {
                    Some(i) => i,
                    None => {
                        record(&mut reg.errors, channel_id,
                               format!("bad channel {} specified for waiting", channel_id));
                        return false;
                    }
                };
                let conn = &mut reg.connections[i];
                let found = conn.transport
                    .enc()
                    .and_then(|enc| enc.channel.as_ref())
                    .map_or(false, |channel| channel.find_backwards(pattern));
                if found {
                    return true;
                }
                if conn.transport.phase == Phase::Closing ||
                   conn.transport.phase == Phase::Closed {
                    return false;
                }
            }
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                let slice = std::cmp::min(WAIT_SLICE, deadline - now);
                guard = self.shared.cond.wait_timeout(guard, slice).unwrap().0;
            } else {
                guard = self.shared.cond.wait_timeout(guard, WAIT_SLICE).unwrap().0;
            }
        }
    }

    /// Politely close the channel and the connection; the reactor sweeps
    /// the entry on its next pass and the id becomes invalid.
    pub fn close(&self, channel_id: u32) -> Result<(), Error> {
        let mut guard = self.shared.registry.lock().unwrap();
        let reg = &mut *guard;
        let i = match find_index(&reg.connections, channel_id) {
            Some(i) => i,
            None => {
                record(&mut reg.errors, channel_id,
                       format!("bad channel {} specified for closing", channel_id));
                return Err(Error::WrongChannel);
            }
        };
        let mut rng = self.shared.rng.lock().unwrap();
        {
            let conn = &mut reg.connections[i];
            if let Some(enc) = conn.transport.enc() {
                if let Some(ref mut channel) = enc.channel {
                    channel.eof(&mut enc.write);
                    channel.close(&mut enc.write);
                }
            }
            // Seal the channel close before the DISCONNECT goes on the
            // wire.
            let _ = conn.transport.flush(&reg.config, &mut rng);
            conn.transport.disconnect(&mut rng);
        }
        reg.errors.retain(|r| r.channel != channel_id);
        Ok(())
    }

    /// Request the `sftp` subsystem on an idle connection; the returned
    /// handle rides this channel.
    pub fn init_sftp(&self, channel_id: u32) -> Result<super::Sftp, Error> {
        let mut guard = self.shared.registry.lock().unwrap();
        {
            let reg = &mut *guard;
            let i = match find_index(&reg.connections, channel_id) {
                Some(i) => i,
                None => {
                    record(&mut reg.errors, channel_id,
                           format!("bad channel {}: cannot initialize SFTP", channel_id));
                    return Err(Error::WrongChannel);
                }
            };
            let conn = &mut reg.connections[i];
            if conn.transport.phase != Phase::Idle {
                return Err(Error::WrongState);
            }
            let enc = conn.transport.enc().ok_or(Error::WrongState)?;
            match enc.channel {
                Some(ref mut channel) => {
                    channel.pending_requests.push_back(Request::Subsystem("sftp".to_string()));
                    channel.send_next_request(&mut enc.write);
                }
                None => return Err(Error::WrongState),
            }
        }
        loop {
            {
                let reg = &*guard;
                let i = match find_index(&reg.connections, channel_id) {
                    Some(i) => i,
                    None => return Err(Error::ConnectionFailed),
                };
                match reg.connections[i].transport.phase {
                    Phase::SftpOpen => {
                        return Ok(super::sftp::new_handle(self.shared.clone(), channel_id))
                    }
                    Phase::Closing | Phase::Closed => return Err(Error::ConnectionFailed),
                    _ => {}
                }
            }
            guard = self.shared.cond.wait_timeout(guard, WAIT_SLICE).unwrap().0;
        }
    }

    /// The server's raw host-key blob, for the caller's trust decision.
    pub fn server_public_key(&self, channel_id: u32) -> Option<Vec<u8>> {
        let guard = self.shared.registry.lock().unwrap();
        find_index(&guard.connections, channel_id)
            .and_then(|i| guard.connections[i].transport.server_key_blob.clone())
    }

    /// Hoist a cipher and/or MAC to the head of the offered lists for
    /// connections opened after this call. Unknown names are ignored.
    pub fn set_options(&self, preferred_cipher: Option<&str>, preferred_mac: Option<&str>) {
        let mut guard = self.shared.registry.lock().unwrap();
        if let Some(name) = preferred_cipher {
            if !guard.config.preferred.prefer_cipher(name) {
                warn!("unknown cipher {:?} ignored", name);
            }
        }
        if let Some(name) = preferred_mac {
            if !guard.config.preferred.prefer_mac(name) {
                warn!("unknown mac {:?} ignored", name);
            }
        }
    }

    /// Snapshot of the error log. Fatal protocol errors and misuse
    /// reports land here, keyed by channel id.
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.shared.registry.lock().unwrap().errors.clone()
    }
}

impl Drop for Ssh {
    fn drop(&mut self) {
        {
            let mut guard = self.shared.registry.lock().unwrap();
            let reg = &mut *guard;
            let mut rng = self.shared.rng.lock().unwrap();
            for conn in reg.connections.iter_mut() {
                if let Some(enc) = conn.transport.enc() {
                    if let Some(ref mut channel) = enc.channel {
                        channel.eof(&mut enc.write);
                        channel.close(&mut enc.write);
                    }
                }
                let _ = conn.transport.flush(&reg.config, &mut rng);
                conn.transport.disconnect(&mut rng);
            }
        }
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reactor.take() {
            let _ = handle.join();
        }
        // Best-effort delivery of the disconnects, after the reactor is
        // gone.
        let mut guard = self.shared.registry.lock().unwrap();
        let reg = &mut *guard;
        let mut rng = self.shared.rng.lock().unwrap();
        for conn in reg.connections.iter_mut() {
            let _ = conn.transport.flush(&reg.config, &mut rng);
        }
        reg.connections.clear();
    }
}

#[cfg(test)]
mod test {
    extern crate env_logger;
    use super::*;
    use std::io::Write;

    #[test]
    fn channel_ids_are_smallest_free() {
        let conns: Vec<Connection> = Vec::new();
        assert_eq!(alloc_channel_id(&conns), Some(1));
    }

    #[test]
    fn context_starts_and_stops() {
        let ssh = Ssh::new().unwrap();
        assert!(ssh.errors().is_empty());
        drop(ssh);
    }

    #[test]
    fn two_contexts_coexist() {
        let a = Ssh::new().unwrap();
        let b = Ssh::new().unwrap();
        drop(a);
        drop(b);
    }

    #[test]
    fn misuse_is_recorded_and_non_fatal() {
        let ssh = Ssh::new().unwrap();
        assert!(match ssh.send(42, b"data") {
            Err(Error::WrongChannel) => true,
            _ => false,
        });
        assert!(ssh.read(42).is_none());
        assert_eq!(ssh.received_size(42), 0);
        assert!(!ssh.wait_for(42, b"x", 1));
        let errors = ssh.errors();
        assert!(errors.iter().any(|r| r.channel == 42));
    }

    #[test]
    fn set_options_accepts_known_names_only() {
        let ssh = Ssh::new().unwrap();
        ssh.set_options(Some("3des-cbc"), Some("hmac-sha1"));
        {
            let guard = ssh.shared.registry.lock().unwrap();
            assert_eq!(guard.config.preferred.cipher[0].as_ref(), "3des-cbc");
            assert_eq!(guard.config.preferred.mac[0].as_ref(), "hmac-sha1");
        }
        ssh.set_options(Some("rot13-cbc"), None);
        {
            let guard = ssh.shared.registry.lock().unwrap();
            assert_eq!(guard.config.preferred.cipher[0].as_ref(), "3des-cbc");
        }
    }

    #[test]
    fn rejected_banner_fails_the_connect_and_is_logged() {
        let _ = env_logger::try_init();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"SSH-1.5-ancient\r\n").unwrap();
            // Hold the socket open long enough for the client to parse.
            std::thread::sleep(std::time::Duration::from_millis(300));
        });

        let ssh = Ssh::new().unwrap();
        let r = ssh.connect_with_password(&addr.ip().to_string(),
                                          addr.port(),
                                          "user",
                                          "password",
                                          false,
                                          5);
        assert!(r.is_err());
        let errors = ssh.errors();
        assert!(errors.iter().any(|r| r.message.contains("Version")),
                "log: {:?}",
                errors);
        server.join().unwrap();
    }

    #[test]
    fn connect_timeout_is_reported() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            // Accept and stay silent; the client should give up.
            let (_sock, _) = listener.accept().unwrap();
            std::thread::sleep(std::time::Duration::from_millis(1500));
        });

        let ssh = Ssh::new().unwrap();
        let t0 = std::time::Instant::now();
        let r = ssh.connect_with_password(&addr.ip().to_string(),
                                          addr.port(),
                                          "user",
                                          "password",
                                          false,
                                          1);
        assert!(r.is_err());
        assert!(t0.elapsed() < std::time::Duration::from_secs(5));
        server.join().unwrap();
    }
}
