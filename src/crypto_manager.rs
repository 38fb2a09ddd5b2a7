//! # Crypto Manager
//!
//! Sits between the transport channel and the envelope layer. The
//! Diffie-Hellman variant drives the key cycle:
//!
//! ```text
//!   Host (acceptor)                      Peer (initiator)
//!        |--- NewKey(request) ----------------->|   cycle 0, plaintext
//!        |<-- ReplyExchange(B) -----------------|   peer holds K1 pending
//!        |--- NotifyEnc ----------------------->|   both install K1, cycle 1
//!        |--- NewKey(request, K1) ------------->|
//!        |<-- ReplyExchange(B, K1) -------------|
//!        |--- NotifyEnc ----------------------->|   both install K2, cycle 2
//!        |<========== Normal(data, K2) ========>|
//! ```
//!
//! Only the host starts an exchange. Every five minutes it rotates the key
//! with the same NewKey/ReplyExchange/NotifyEnc sequence, encrypted under
//! the current key. Between sending its reply and seeing the NotifyEnc the
//! peer is "in the middle of transition" and already encrypts outbound data
//! with the new key; the host installs that key before it can read such
//! data, because TCP preserves the order of the reply and the data.
//!
//! Each manager runs its own tick loop. Inside one tick, receive work
//! always happens before send work, and the transport's queues stay locked
//! for the whole tick.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::CryptoConfig;
use crate::crypto::SymmetricKey;
use crate::error::{ProtocolError, ProtocolResult};
use crate::key_exchange::DiffieHellman;
use crate::packet::{Packet, PacketKind};
use crate::transport::{ChannelGuard, TransportChannel};

/// Progress through the initial key exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum CryptoCycle {
    NoKey = 0,
    FirstExchangeDone = 1,
    SteadyState = 2,
}

impl CryptoCycle {
    /// Next cycle after a key installation; saturates at steady state
    pub fn advance(self) -> Self {
        match self {
            CryptoCycle::NoKey => CryptoCycle::FirstExchangeDone,
            CryptoCycle::FirstExchangeDone | CryptoCycle::SteadyState => CryptoCycle::SteadyState,
        }
    }
}

/// Encryption applied to a session, chosen when it is constructed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CryptoStandard {
    /// No key exchange and no encryption. Testing only.
    None,
    #[default]
    DiffieHellmanAes256,
}

/// Which end of the TCP connection this side is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    /// The host; the only side allowed to start a key exchange
    Acceptor,
}

impl Role {
    pub fn is_host(self) -> bool {
        self == Role::Acceptor
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Acceptor => f.write_str("host"),
        }
    }
}

/// Plaintext message channel offered to the service layer
pub trait SecureChannel: Send + Sync {
    /// Queue plaintext for sending; empty messages are ignored
    fn send_message(&self, message: Bytes);

    /// Pop one decrypted inbound message
    fn retrieve_message(&self) -> Option<Bytes>;

    fn available_messages(&self) -> usize;

    /// Ask for a key rotation at the next opportunity
    fn request_new_key(&self);

    fn cycle(&self) -> CryptoCycle;

    fn is_running(&self) -> bool;

    /// Stop the manager and close the transport; idempotent
    fn stop(&self);

    fn peer_addr(&self) -> SocketAddr;
}

/// Packet-level access for one tick
pub trait PacketLink {
    fn send_packet(&mut self, packet: Packet);

    /// Next inbound packet, parsed
    fn next_packet(&mut self) -> ProtocolResult<Option<Packet>>;
}

impl PacketLink for ChannelGuard<'_> {
    fn send_packet(&mut self, packet: Packet) {
        self.send(packet.to_bytes().freeze());
    }

    fn next_packet(&mut self) -> ProtocolResult<Option<Packet>> {
        self.receive().map(|frame| Packet::from_bytes(&frame)).transpose()
    }
}

/// Per-tick protocol logic behind a [`CryptoManager`]
pub trait PacketSchedule: Send + 'static {
    /// Receive-side work for one tick; returns delivered plaintext
    fn poll(&mut self, link: &mut dyn PacketLink, now: Instant) -> ProtocolResult<Option<Vec<u8>>>;

    /// Whether outbound data may be sent yet
    fn can_send(&self) -> bool;

    /// Wrap one plaintext message as a `Normal` packet
    fn seal(&mut self, link: &mut dyn PacketLink, plaintext: &[u8]);

    fn cycle(&self) -> CryptoCycle;

    fn request_rotation(&mut self);
}

/// Diffie-Hellman key cycle with AES-256 payload encryption
pub struct KeySchedule {
    role: Role,
    dh: DiffieHellman,
    cycle: CryptoCycle,
    current: Option<SymmetricKey>,
    /// Key offered in our last reply, live once NotifyEnc arrives
    pending: Option<SymmetricKey>,
    changing_key: bool,
    middle_of_transition: bool,
    first_exchange: bool,
    rotate_requested: bool,
    started: Instant,
    last_rotation: Instant,
    rotation_interval: Duration,
    key_timeout: Duration,
}

impl KeySchedule {
    pub fn new(role: Role, config: &CryptoConfig) -> Self {
        let now = Instant::now();
        Self {
            role,
            dh: DiffieHellman::new(config.dh_byte_size),
            cycle: CryptoCycle::NoKey,
            current: None,
            pending: None,
            changing_key: false,
            middle_of_transition: false,
            first_exchange: true,
            rotate_requested: false,
            started: now,
            last_rotation: now,
            rotation_interval: config.rotation_interval(),
            key_timeout: config.key_timeout(),
        }
    }

    pub fn is_changing_key(&self) -> bool {
        self.changing_key
    }

    pub fn is_in_transition(&self) -> bool {
        self.middle_of_transition
    }

    fn violation(&self, kind: PacketKind) -> ProtocolError {
        ProtocolError::PolicyViolation(format!(
            "{:?} packet not allowed for {} at cycle {:?}",
            kind, self.role, self.cycle
        ))
    }

    fn current_key(&self) -> ProtocolResult<&SymmetricKey> {
        self.current
            .as_ref()
            .ok_or_else(|| ProtocolError::CryptoError("No key installed".to_string()))
    }

    /// Encrypt under the current key once one exists
    fn protect(&self, content: Vec<u8>) -> ProtocolResult<Vec<u8>> {
        if self.cycle == CryptoCycle::NoKey {
            return Ok(content);
        }
        Ok(self.current_key()?.encrypt(&content))
    }

    fn unprotect(&self, content: &[u8]) -> ProtocolResult<Vec<u8>> {
        if self.cycle == CryptoCycle::NoKey {
            return Ok(content.to_vec());
        }
        self.current_key()?.decrypt(content)
    }

    /// Send a fresh NewKey request
    fn send_request(&mut self, link: &mut dyn PacketLink) -> ProtocolResult<()> {
        let request = self.dh.generate_request();
        let content = self.protect(request)?;
        link.send_packet(Packet::new(PacketKind::NewKey, content));
        self.changing_key = true;
        debug!(cycle = ?self.cycle, "key exchange requested");
        Ok(())
    }

    fn install(&mut self, key: SymmetricKey) {
        self.current = Some(key);
        self.cycle = self.cycle.advance();
        info!(role = %self.role, cycle = ?self.cycle, "session key installed");
    }

    fn answer_request(&mut self, content: &[u8]) -> ProtocolResult<(Vec<u8>, SymmetricKey)> {
        let request = self.unprotect(content)?;
        let response = self.dh.generate_response(&request)?;
        let key = self.dh.derived_key().ok_or_else(short_secret)?;
        Ok((self.protect(response)?, SymmetricKey::new(key)))
    }

    fn on_new_key(&mut self, link: &mut dyn PacketLink, content: &[u8]) {
        match self.answer_request(content) {
            Ok((response, key)) => {
                link.send_packet(Packet::new(PacketKind::ReplyExchange, response));
                self.pending = Some(key);
                self.middle_of_transition = true;
            }
            Err(e) => {
                warn!(error = %e, "could not answer key exchange");
                link.send_packet(Packet::empty(PacketKind::KeyResponseError));
            }
        }
    }

    fn accept_response(&mut self, content: &[u8]) -> ProtocolResult<SymmetricKey> {
        let response = self.unprotect(content)?;
        self.dh.handle_response(&response)?;
        let key = self.dh.derived_key().ok_or_else(short_secret)?;
        Ok(SymmetricKey::new(key))
    }

    fn on_reply(&mut self, link: &mut dyn PacketLink, content: &[u8], now: Instant) -> ProtocolResult<()> {
        let key = match self.accept_response(content) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "key exchange response unusable, restarting");
                return self.send_request(link);
            }
        };

        link.send_packet(Packet::empty(PacketKind::NotifyEnc));
        self.install(key);
        self.changing_key = false;
        self.last_rotation = now;

        if self.cycle < CryptoCycle::SteadyState {
            self.send_request(link)?;
        }
        Ok(())
    }

    fn on_notify(&mut self) -> ProtocolResult<()> {
        let key = self
            .pending
            .take()
            .ok_or_else(|| self.violation(PacketKind::NotifyEnc))?;
        self.install(key);
        self.middle_of_transition = false;
        Ok(())
    }

    fn dispatch(
        &mut self,
        link: &mut dyn PacketLink,
        packet: Packet,
        now: Instant,
    ) -> ProtocolResult<Option<Vec<u8>>> {
        let host = self.role.is_host();

        match packet.kind {
            PacketKind::Normal => {
                if self.cycle < CryptoCycle::SteadyState {
                    return Err(self.violation(packet.kind));
                }
                let plaintext = self.current_key()?.decrypt(&packet.content)?;
                return Ok(Some(plaintext));
            }
            PacketKind::NewKey if !host => self.on_new_key(link, &packet.content),
            PacketKind::ReplyExchange if host => self.on_reply(link, &packet.content, now)?,
            PacketKind::NotifyEnc if !host && self.middle_of_transition => self.on_notify()?,
            PacketKind::KeyResponseError if host => {
                debug!("peer failed to answer, retrying key exchange");
                self.send_request(link)?;
            }
            other => return Err(self.violation(other)),
        }
        Ok(None)
    }
}

fn short_secret() -> ProtocolError {
    ProtocolError::KeyExchangeError("Shared secret shorter than 32 bytes".to_string())
}

impl PacketSchedule for KeySchedule {
    fn poll(&mut self, link: &mut dyn PacketLink, now: Instant) -> ProtocolResult<Option<Vec<u8>>> {
        let host = self.role.is_host();

        if host && self.cycle == CryptoCycle::SteadyState && !self.changing_key {
            let due = now.duration_since(self.last_rotation) >= self.rotation_interval;
            if due || self.rotate_requested {
                info!("rotating session key");
                self.send_request(link)?;
                self.last_rotation = now;
                self.rotate_requested = false;
            }
        }

        if host && self.first_exchange {
            self.first_exchange = false;
            self.send_request(link)?;
        }

        let delivered = match link.next_packet()? {
            Some(packet) => self.dispatch(link, packet, now)?,
            None => None,
        };

        if self.current.is_none() && now.duration_since(self.started) > self.key_timeout {
            return Err(ProtocolError::Timeout(self.key_timeout.as_secs()));
        }

        Ok(delivered)
    }

    fn can_send(&self) -> bool {
        self.cycle == CryptoCycle::SteadyState
    }

    fn seal(&mut self, link: &mut dyn PacketLink, plaintext: &[u8]) {
        let key = match (self.middle_of_transition, &self.pending, &self.current) {
            (true, Some(pending), _) => pending,
            (_, _, Some(current)) => current,
            _ => return,
        };
        link.send_packet(Packet::new(PacketKind::Normal, key.encrypt(plaintext)));
    }

    fn cycle(&self) -> CryptoCycle {
        self.cycle
    }

    fn request_rotation(&mut self) {
        if self.role.is_host() {
            self.rotate_requested = true;
        } else {
            debug!("rotation request ignored on initiator side");
        }
    }
}

/// Pass-through schedule for [`CryptoStandard::None`]
#[derive(Debug, Default)]
pub struct PlainSchedule;

impl PacketSchedule for PlainSchedule {
    fn poll(&mut self, link: &mut dyn PacketLink, _now: Instant) -> ProtocolResult<Option<Vec<u8>>> {
        match link.next_packet()? {
            Some(packet) if packet.kind == PacketKind::Normal => Ok(Some(packet.content.to_vec())),
            Some(packet) => Err(ProtocolError::PolicyViolation(format!(
                "{:?} packet on an unencrypted session",
                packet.kind
            ))),
            None => Ok(None),
        }
    }

    fn can_send(&self) -> bool {
        true
    }

    fn seal(&mut self, link: &mut dyn PacketLink, plaintext: &[u8]) {
        link.send_packet(Packet::new(PacketKind::Normal, plaintext.to_vec()));
    }

    fn cycle(&self) -> CryptoCycle {
        CryptoCycle::SteadyState
    }

    fn request_rotation(&mut self) {}
}

/// A tick loop binding one schedule to one transport channel
pub struct CryptoManager<S: PacketSchedule> {
    transport: TransportChannel,
    schedule: Mutex<S>,
    outbound: Mutex<VecDeque<Bytes>>,
    inbound: Mutex<VecDeque<Bytes>>,
    running: AtomicBool,
    tick_interval: Duration,
}

pub type DhAesManager = CryptoManager<KeySchedule>;
pub type PlainManager = CryptoManager<PlainSchedule>;

impl<S: PacketSchedule> CryptoManager<S> {
    /// Start the tick loop on the current tokio runtime
    pub fn start(transport: TransportChannel, schedule: S, tick_interval: Duration) -> Arc<Self> {
        let manager = Arc::new(Self {
            transport,
            schedule: Mutex::new(schedule),
            outbound: Mutex::new(VecDeque::new()),
            inbound: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(true),
            tick_interval,
        });

        tokio::spawn(run_manager(manager.clone()));
        manager
    }

    fn tick(&self) -> ProtocolResult<()> {
        let mut link = self.transport.lock();
        let mut schedule = self.schedule.lock();

        if let Some(plaintext) = schedule.poll(&mut link, Instant::now())? {
            if !plaintext.is_empty() {
                self.inbound.lock().push_back(Bytes::from(plaintext));
            }
        }

        if schedule.can_send() {
            let next = self.outbound.lock().pop_front();
            if let Some(message) = next {
                schedule.seal(&mut link, &message);
            }
        }
        Ok(())
    }

    /// Seal plaintext still queued so the transport sends it before closing
    fn flush_outbound(&self) {
        let mut link = self.transport.lock();
        let mut schedule = self.schedule.lock();
        if !schedule.can_send() {
            return;
        }
        let pending: Vec<Bytes> = self.outbound.lock().drain(..).collect();
        for message in pending {
            schedule.seal(&mut link, &message);
        }
    }

    /// Decrypt frames that arrived before the peer hung up
    fn drain_inbound(&self) {
        while self.transport.lock().pending_inbound() > 0 {
            if let Err(e) = self.tick() {
                debug!(peer = %self.transport.peer_addr(), error = %e, "dropping undecodable tail");
                break;
            }
        }
    }

    fn shutdown(&self, reason: &str) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(peer = %self.transport.peer_addr(), reason, "crypto manager stopped");
            self.flush_outbound();
            self.transport.close();
        }
    }
}

async fn run_manager<S: PacketSchedule>(manager: Arc<CryptoManager<S>>) {
    while manager.running.load(Ordering::SeqCst) {
        if !manager.transport.is_connected() {
            manager.drain_inbound();
            manager.shutdown("transport closed");
            break;
        }
        if let Err(e) = manager.tick() {
            warn!(peer = %manager.transport.peer_addr(), error = %e, "crypto manager failure");
            manager.shutdown("protocol error");
            break;
        }
        tokio::time::sleep(manager.tick_interval).await;
    }
}

impl<S: PacketSchedule> SecureChannel for CryptoManager<S> {
    fn send_message(&self, message: Bytes) {
        if !message.is_empty() {
            self.outbound.lock().push_back(message);
        }
    }

    fn retrieve_message(&self) -> Option<Bytes> {
        self.inbound.lock().pop_front()
    }

    fn available_messages(&self) -> usize {
        self.inbound.lock().len()
    }

    fn request_new_key(&self) {
        self.schedule.lock().request_rotation();
    }

    fn cycle(&self) -> CryptoCycle {
        self.schedule.lock().cycle()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.shutdown("stop requested");
    }

    fn peer_addr(&self) -> SocketAddr {
        self.transport.peer_addr()
    }
}

/// Build the crypto manager selected by `config.standard`
pub fn start_channel(
    transport: TransportChannel,
    role: Role,
    config: &CryptoConfig,
) -> Arc<dyn SecureChannel> {
    let tick = config.tick_interval();
    match config.standard {
        CryptoStandard::DiffieHellmanAes256 => {
            let manager: Arc<DhAesManager> =
                CryptoManager::start(transport, KeySchedule::new(role, config), tick);
            manager
        }
        CryptoStandard::None => {
            warn!(peer = %transport.peer_addr(), "session runs WITHOUT encryption");
            let manager: Arc<PlainManager> = CryptoManager::start(transport, PlainSchedule, tick);
            manager
        }
    }
}
