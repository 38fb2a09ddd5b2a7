//! # Service Manager
//!
//! One per session. Owns the secure channel, the control-message codec and
//! the registry of services multiplexed over the session.
//!
//! ## Tick
//!
//! Each tick runs with the registry lock held, in this order:
//!
//! 1. feed one decrypted message into the control codec
//! 2. dequeue and dispatch at most one control message
//! 3. poll every service for output and wrap it as `ServiceData`
//! 4. flush up to `max_flush_size` codec bytes to the secure channel
//!
//! so a removal dispatched in step 2 is visible before step 3 polls.
//!
//! ## Service IDs
//!
//! The initiator numbers its services from 0 and the host from 2^63, so
//! ids chosen independently by the two sides never collide.
//!
//! Do not call into the manager while holding a service's lock; the tick
//! takes the registry lock before any service lock.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::cache::{password_digest, PrimaryCache};
use crate::config::{Config, ServiceConfig};
use crate::control::{
    AddService, Blacklisted, ConnectionState, ControlMessage, Greet, GreetReply, Login, LoginReply,
    LoginState, Register, RegisterFlag, RegisterReply, RemoveService, ServiceData, ServiceMismatch,
};
use crate::crypto_manager::{start_channel, CryptoCycle, Role, SecureChannel};
use crate::envelope::{Envelope, EnvelopeCodec};
use crate::error::{ProtocolError, ProtocolResult};
use crate::service::{ServiceCatalog, ServiceHandle};
use crate::transport::TransportChannel;
use crate::PROTOCOL_VERSION;

/// First service id handed out by the host
pub const ACCEPTOR_ID_BASE: u64 = 1 << 63;

/// What the initiator has learned from the host's replies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthState {
    pub greet: Option<ConnectionState>,
    pub login: Option<LoginState>,
    pub register: Option<RegisterFlag>,
    pub retries: u16,
    /// Entity id to present in the next greeting
    pub next_greet_id: u64,
    pub server_name: String,
    pub blacklisted: Option<String>,
}

struct SessionState {
    codec: EnvelopeCodec<ControlMessage>,
    services: BTreeMap<u64, ServiceHandle>,
    ids_by_type: HashMap<String, u64>,
    next_id: u64,
    disconnect_at: Option<Instant>,
    peer_authenticated: bool,
    auth: AuthState,
}

struct ManagerInner {
    role: Role,
    channel: Arc<dyn SecureChannel>,
    catalog: ServiceCatalog,
    cache: Arc<PrimaryCache>,
    config: ServiceConfig,
    remote_addr: SocketAddr,
    permit_service_add: AtomicBool,
    running: AtomicBool,
    state: Mutex<SessionState>,
}

/// Handle to one session's service manager
///
/// Clones share the same session.
#[derive(Clone)]
pub struct ServiceManager {
    inner: Arc<ManagerInner>,
}

impl ServiceManager {
    /// Connect to a host and start an initiator session
    pub async fn connect(
        addr: SocketAddr,
        catalog: ServiceCatalog,
        cache: Arc<PrimaryCache>,
        config: &Config,
    ) -> ProtocolResult<Self> {
        let transport = TransportChannel::connect(addr, config.transport.clone()).await?;
        let channel = start_channel(transport, Role::Initiator, &config.crypto);
        Ok(Self::with_channel(
            channel,
            Role::Initiator,
            catalog,
            cache,
            config.service.clone(),
        ))
    }

    /// Start a host session on an accepted stream
    pub fn accept(
        stream: TcpStream,
        catalog: ServiceCatalog,
        cache: Arc<PrimaryCache>,
        config: &Config,
    ) -> ProtocolResult<Self> {
        let transport = TransportChannel::from_stream(stream, config.transport.clone())?;
        let channel = start_channel(transport, Role::Acceptor, &config.crypto);
        Ok(Self::with_channel(
            channel,
            Role::Acceptor,
            catalog,
            cache,
            config.service.clone(),
        ))
    }

    /// Run a session over an existing secure channel
    pub fn with_channel(
        channel: Arc<dyn SecureChannel>,
        role: Role,
        catalog: ServiceCatalog,
        cache: Arc<PrimaryCache>,
        config: ServiceConfig,
    ) -> Self {
        let next_id = match role {
            Role::Initiator => 0,
            Role::Acceptor => ACCEPTOR_ID_BASE,
        };

        let inner = Arc::new(ManagerInner {
            role,
            remote_addr: channel.peer_addr(),
            channel,
            catalog,
            cache,
            permit_service_add: AtomicBool::new(config.permit_service_add),
            running: AtomicBool::new(true),
            state: Mutex::new(SessionState {
                codec: EnvelopeCodec::new(),
                services: BTreeMap::new(),
                ids_by_type: HashMap::new(),
                next_id,
                disconnect_at: None,
                peer_authenticated: false,
                auth: AuthState::default(),
            }),
            config,
        });

        info!(peer = %inner.remote_addr, role = %role, "session started");
        tokio::spawn(run_session(inner.clone()));
        Self { inner }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn crypto_cycle(&self) -> CryptoCycle {
        self.inner.channel.cycle()
    }

    /// Stop the session, its crypto manager and its transport
    pub fn stop(&self) {
        self.inner.shutdown("stop requested");
    }

    pub fn allow_services(&self) {
        self.inner.permit_service_add.store(true, Ordering::SeqCst);
    }

    /// Decline every service the peer announces from now on
    pub fn forbid_services(&self) {
        self.inner.permit_service_add.store(false, Ordering::SeqCst);
    }

    /// Ask for a key rotation; only effective on the host
    pub fn request_new_key(&self) {
        if self.ensure_running().is_ok() {
            self.inner.channel.request_new_key();
        }
    }

    fn ensure_running(&self) -> ProtocolResult<()> {
        if self.is_running() && self.inner.channel.is_running() {
            return Ok(());
        }
        self.inner.shutdown("secure channel closed");
        Err(ProtocolError::ConnectionClosed)
    }

    /// Register a local service and announce it to the peer
    ///
    /// A second service of an already registered type is not added; the
    /// existing id is returned instead. If the host announces the same type
    /// before this side's announcement reaches it, the service moves to the
    /// host's id; look it up again with [`ServiceManager::service_id`].
    pub fn add_service(&self, service: ServiceHandle) -> ProtocolResult<u64> {
        self.ensure_running()?;
        let type_name = service.lock().type_name();

        let mut state = self.inner.state.lock();
        if let Some(id) = state.ids_by_type.get(type_name) {
            return Ok(*id);
        }

        let id = state.next_id;
        state.next_id += 1;
        service.lock().set_active(true);
        state.services.insert(id, service);
        state.ids_by_type.insert(type_name.to_string(), id);
        state.codec.enqueue(&ControlMessage::AddService(AddService {
            id,
            type_name: type_name.to_string(),
        }))?;

        debug!(peer = %self.inner.remote_addr, service_id = id, service = type_name, "service added");
        Ok(id)
    }

    pub fn add_services(&self, services: Vec<ServiceHandle>) -> ProtocolResult<Vec<u64>> {
        services
            .into_iter()
            .map(|service| self.add_service(service))
            .collect()
    }

    /// Remove a local service and tell the peer; false if the id is unknown
    pub fn remove_service(&self, id: u64) -> ProtocolResult<bool> {
        self.ensure_running()?;
        let mut state = self.inner.state.lock();
        if !state.remove(id) {
            return Ok(false);
        }
        state
            .codec
            .enqueue(&ControlMessage::RemoveService(RemoveService { id }))?;
        debug!(peer = %self.inner.remote_addr, service_id = id, "service removed");
        Ok(true)
    }

    pub fn service(&self, id: u64) -> Option<ServiceHandle> {
        self.inner.state.lock().services.get(&id).cloned()
    }

    pub fn service_id(&self, type_name: &str) -> Option<u64> {
        self.inner.state.lock().ids_by_type.get(type_name).copied()
    }

    pub fn active_services(&self) -> Vec<(u64, ServiceHandle)> {
        self.inner
            .state
            .lock()
            .services
            .iter()
            .map(|(id, service)| (*id, service.clone()))
            .collect()
    }

    /// Greet the host with the last entity id it gave us
    pub fn greet(&self) -> ProtocolResult<()> {
        self.send_request(|state| {
            ControlMessage::Greet(Greet {
                id: state.auth.next_greet_id,
                version: PROTOCOL_VERSION.to_string(),
            })
        })
    }

    pub fn login(&self, name: &str, password: &str) -> ProtocolResult<()> {
        let auth = password_digest(password);
        self.send_request(|_| {
            ControlMessage::Login(Login {
                name: name.to_string(),
                auth,
            })
        })
    }

    pub fn register(&self, name: &str, password: &str) -> ProtocolResult<()> {
        let auth = password_digest(password);
        self.send_request(|_| {
            ControlMessage::Register(Register {
                name: name.to_string(),
                auth,
            })
        })
    }

    fn send_request(
        &self,
        build: impl FnOnce(&SessionState) -> ControlMessage,
    ) -> ProtocolResult<()> {
        if self.inner.role.is_host() {
            return Err(ProtocolError::PolicyViolation(
                "Only the initiator sends handshake requests".to_string(),
            ));
        }
        self.ensure_running()?;
        let mut state = self.inner.state.lock();
        let message = build(&state);
        state.codec.enqueue(&message)
    }

    pub fn auth_state(&self) -> AuthState {
        self.inner.state.lock().auth.clone()
    }

    /// Host side: whether the peer has greeted or logged in successfully
    pub fn is_peer_authenticated(&self) -> bool {
        self.inner.state.lock().peer_authenticated
    }
}

impl SessionState {
    /// Move a registered service to a new id
    fn rekey(&mut self, from: u64, to: u64) {
        if let Some(service) = self.services.remove(&from) {
            let type_name = service.lock().type_name();
            self.services.insert(to, service);
            self.ids_by_type.insert(type_name.to_string(), to);
        }
    }

    fn remove(&mut self, id: u64) -> bool {
        match self.services.remove(&id) {
            Some(service) => {
                let mut service = service.lock();
                service.set_active(false);
                self.ids_by_type.remove(service.type_name());
                true
            }
            None => false,
        }
    }

    /// Send `Blacklisted` and disconnect once the grace period ends
    fn blacklist(&mut self, reason: &str, grace: Duration) -> ProtocolResult<()> {
        if self.disconnect_at.is_some() {
            return Ok(());
        }
        self.codec.enqueue(&ControlMessage::Blacklisted(Blacklisted {
            reason: reason.to_string(),
        }))?;
        self.disconnect_at = Some(Instant::now() + grace);
        Ok(())
    }

    fn schedule_disconnect(&mut self, grace: Duration) {
        if self.disconnect_at.is_none() {
            self.disconnect_at = Some(Instant::now() + grace);
        }
    }
}

impl ManagerInner {
    fn shutdown(&self, reason: &str) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(peer = %self.remote_addr, reason, "session stopped");
            self.channel.stop();
            for service in self.state.lock().services.values() {
                service.lock().set_active(false);
            }
        }
    }

    fn tick(&self) -> ProtocolResult<()> {
        let mut state = self.state.lock();

        if let Some(deadline) = state.disconnect_at {
            if Instant::now() >= deadline {
                return Err(ProtocolError::PolicyViolation(
                    "Disconnect grace period elapsed".to_string(),
                ));
            }
        }

        if let Some(message) = self.channel.retrieve_message() {
            state.codec.feed(&message);
        }

        if let Some(message) = state.codec.try_dequeue()? {
            self.dispatch(&mut state, message)?;
        }

        let mut outgoing = Vec::new();
        for (id, service) in &state.services {
            let mut service = service.lock();
            if !service.available() {
                continue;
            }
            let data = service.write();
            if data.len() > self.config.max_write_size {
                warn!(service_id = *id, size = data.len(), "service write over limit dropped");
                continue;
            }
            if !data.is_empty() {
                outgoing.push(ServiceData { id: *id, data });
            }
        }
        for data in outgoing {
            state.codec.enqueue(&ControlMessage::ServiceData(data))?;
        }

        self.flush(&mut state);
        Ok(())
    }

    /// Dispatch whatever the channel delivered before it stopped
    fn drain(&self) -> ProtocolResult<()> {
        let mut state = self.state.lock();
        while let Some(message) = self.channel.retrieve_message() {
            state.codec.feed(&message);
        }
        while let Some(message) = state.codec.try_dequeue()? {
            self.dispatch(&mut state, message)?;
        }
        Ok(())
    }

    fn flush(&self, state: &mut SessionState) {
        let chunk = state.codec.write(self.config.max_flush_size);
        if !chunk.is_empty() {
            self.channel.send_message(chunk);
        }
    }

    fn dispatch(&self, state: &mut SessionState, message: ControlMessage) -> ProtocolResult<()> {
        if message.is_request() && !self.role.is_host() {
            return Err(ProtocolError::PolicyViolation(format!(
                "{} received by the initiator",
                message.type_name()
            )));
        }
        if message.is_reply() && self.role.is_host() {
            return Err(ProtocolError::PolicyViolation(format!(
                "{} received by the host",
                message.type_name()
            )));
        }

        match message {
            ControlMessage::AddService(add) => self.on_add_service(state, add),
            ControlMessage::RemoveService(remove) => {
                if state.remove(remove.id) {
                    debug!(peer = %self.remote_addr, service_id = remove.id, "service removed by peer");
                }
                Ok(())
            }
            ControlMessage::ServiceMismatch(_) => Err(ProtocolError::PolicyViolation(
                "Peer reported a service mismatch".to_string(),
            )),
            ControlMessage::ServiceData(data) => {
                match state.services.get(&data.id) {
                    Some(service) => service.lock().read(&data.data),
                    None => debug!(service_id = data.id, "data for unknown service ignored"),
                }
                Ok(())
            }
            ControlMessage::Greet(greet) => self.on_greet(state, greet),
            ControlMessage::Login(login) => self.on_login(state, login),
            ControlMessage::Register(register) => self.on_register(state, register),
            ControlMessage::Blacklisted(blacklisted) => {
                warn!(peer = %self.remote_addr, reason = %blacklisted.reason, "blacklisted by host");
                state.auth.blacklisted = Some(blacklisted.reason);
                Ok(())
            }
            ControlMessage::GreetReply(reply) => {
                info!(peer = %self.remote_addr, state = ?reply.state, "greet reply");
                state.auth.greet = Some(reply.state);
                state.auth.retries = reply.retries;
                state.auth.server_name = reply.server_name;
                Ok(())
            }
            ControlMessage::LoginReply(reply) => {
                info!(peer = %self.remote_addr, state = ?reply.state, "login reply");
                state.auth.login = Some(reply.state);
                state.auth.retries = reply.retries;
                if reply.state == LoginState::Authenticated {
                    state.auth.next_greet_id = reply.next_greet_id;
                }
                Ok(())
            }
            ControlMessage::RegisterReply(reply) => {
                info!(peer = %self.remote_addr, flag = ?reply.flag, "register reply");
                state.auth.register = Some(reply.flag);
                Ok(())
            }
        }
    }

    fn on_add_service(&self, state: &mut SessionState, add: AddService) -> ProtocolResult<()> {
        if state.services.contains_key(&add.id) {
            state
                .codec
                .enqueue(&ControlMessage::ServiceMismatch(ServiceMismatch))?;
            self.flush(state);
            return Err(ProtocolError::DuplicateService(add.id));
        }

        let decline = |state: &mut SessionState, why: &str| {
            info!(peer = %self.remote_addr, service_id = add.id, service = %add.type_name, why, "service declined");
            state
                .codec
                .enqueue(&ControlMessage::RemoveService(RemoveService { id: add.id }))
        };

        if !self.permit_service_add.load(Ordering::SeqCst) {
            return decline(state, "services forbidden");
        }
        if let Some(&existing) = state.ids_by_type.get(&add.type_name) {
            // Both sides announced the type at once: the host's id wins on
            // both ends, the host declines the initiator's announcement
            if !self.role.is_host() && existing < ACCEPTOR_ID_BASE && add.id >= ACCEPTOR_ID_BASE {
                state.rekey(existing, add.id);
                info!(peer = %self.remote_addr, from = existing, to = add.id, service = %add.type_name, "service moved to host id");
                return Ok(());
            }
            return decline(state, "type already registered");
        }

        let service = match self.catalog.create(&add.type_name) {
            Ok(service) => service,
            Err(e) => return decline(state, &e.to_string()),
        };

        service.lock().set_active(true);
        state.services.insert(add.id, service);
        state.ids_by_type.insert(add.type_name.clone(), add.id);
        debug!(peer = %self.remote_addr, service_id = add.id, service = %add.type_name, "service added by peer");
        Ok(())
    }

    fn on_greet(&self, state: &mut SessionState, greet: Greet) -> ProtocolResult<()> {
        let ip = self.remote_addr.ip();
        let grace = self.config.blacklist_grace();

        if greet.version != PROTOCOL_VERSION {
            warn!(peer = %self.remote_addr, version = %greet.version, "peer runs another protocol version");
            state.codec.enqueue(&ControlMessage::GreetReply(GreetReply {
                retries: 0,
                state: ConnectionState::WrongVersion,
                server_name: self.config.server_name.clone(),
            }))?;
            state.schedule_disconnect(grace);
            return Ok(());
        }

        let retries = self.cache.retries_left(ip, self.config.max_retries);
        let entity = if greet.id > 0 {
            self.cache.entity(greet.id)
        } else {
            None
        };

        if let Some(entity) = &entity {
            if !entity.blacklisted && retries > 0 {
                state.peer_authenticated = true;
                state.codec.enqueue(&ControlMessage::GreetReply(GreetReply {
                    retries,
                    state: ConnectionState::ConnectionAuthenticated,
                    server_name: self.config.server_name.clone(),
                }))?;
                info!(peer = %self.remote_addr, entity = entity.id, "known peer greeted");
                return Ok(());
            }
            if !entity.blacklisted {
                // Address has no login attempts left
                self.cache.set_blacklisted(entity.id, true);
                warn!(peer = %self.remote_addr, entity = entity.id, "entity blacklisted");
            }
        }

        state.codec.enqueue(&ControlMessage::GreetReply(GreetReply {
            retries,
            state: ConnectionState::ConnectionInvalid,
            server_name: self.config.server_name.clone(),
        }))?;
        if entity.is_some() {
            state.blacklist("Entity blacklisted", grace)?;
        } else if self.config.require_authentication {
            state.blacklist("Authentication required", grace)?;
        }
        Ok(())
    }

    fn on_login(&self, state: &mut SessionState, login: Login) -> ProtocolResult<()> {
        let ip = self.remote_addr.ip();

        if self.cache.verify_user(&login.name, &login.auth) {
            self.cache.reset_retries(ip);
            let entity = self.cache.add_entity(login.name.clone());
            state.peer_authenticated = true;
            state.disconnect_at = None;
            info!(peer = %self.remote_addr, user = %login.name, "login accepted");
            return state.codec.enqueue(&ControlMessage::LoginReply(LoginReply {
                name: login.name,
                retries: self.config.max_retries,
                next_greet_id: entity,
                state: LoginState::Authenticated,
            }));
        }

        let left = self.cache.consume_retry(ip, self.config.max_retries);
        warn!(peer = %self.remote_addr, user = %login.name, retries = left, "login rejected");
        state.codec.enqueue(&ControlMessage::LoginReply(LoginReply {
            name: login.name,
            retries: left,
            next_greet_id: 0,
            state: LoginState::NotAuthenticated,
        }))?;
        if left == 0 {
            state.blacklist("Too many failed logins", self.config.blacklist_grace())?;
        }
        Ok(())
    }

    fn on_register(&self, state: &mut SessionState, register: Register) -> ProtocolResult<()> {
        let flag = if !self.config.allow_registration {
            RegisterFlag::Rejected
        } else if self.cache.add_user(&register.name, &register.auth) {
            RegisterFlag::Success
        } else {
            RegisterFlag::Existed
        };

        info!(peer = %self.remote_addr, user = %register.name, flag = ?flag, "registration");
        state.codec.enqueue(&ControlMessage::RegisterReply(RegisterReply {
            name: register.name,
            title: self.config.server_name.clone(),
            flag,
        }))
    }
}

async fn run_session(inner: Arc<ManagerInner>) {
    let interval = inner.config.tick_interval();

    while inner.running.load(Ordering::SeqCst) {
        if !inner.channel.is_running() {
            if let Err(e) = inner.drain() {
                warn!(peer = %inner.remote_addr, error = %e, "session failure");
            }
            inner.shutdown("secure channel closed");
            break;
        }
        if let Err(e) = inner.tick() {
            if e.is_fatal() {
                warn!(peer = %inner.remote_addr, error = %e, "session failure");
            } else {
                info!(peer = %inner.remote_addr, error = %e, "session ended");
            }
            inner.shutdown("protocol error");
            break;
        }
        tokio::time::sleep(interval).await;
    }
}
