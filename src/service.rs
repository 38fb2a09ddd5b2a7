//! # Services
//!
//! A service is a pluggable endpoint multiplexed over one session. The
//! service manager polls it once per tick: `available()` then `write()` for
//! outbound bytes, and `read()` for every payload the peer's twin sent.
//!
//! Services are called with the session's registry lock held and must
//! never block.

use std::any::type_name;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::envelope::EnvelopeCodec;
use crate::envelope_messages;
use crate::error::{ProtocolError, ProtocolResult};
use crate::MAX_SERVICE_WRITE;

pub trait Service: Send {
    /// Catalog name; both peers must register the type under it
    fn type_name(&self) -> &'static str;

    /// Consume bytes sent by the peer's instance
    fn read(&mut self, data: &[u8]);

    /// Produce bytes for the peer's instance
    fn write(&mut self) -> Vec<u8>;

    /// Whether `write()` has anything to return
    fn available(&self) -> bool;

    fn is_active(&self) -> bool;

    fn set_active(&mut self, active: bool);
}

/// Shared handle to a registered service
pub type ServiceHandle = Arc<Mutex<dyn Service>>;

type ServiceFactory = Arc<dyn Fn() -> ServiceHandle + Send + Sync>;

/// Name to constructor map used to instantiate services a peer announces
#[derive(Clone, Default)]
pub struct ServiceCatalog {
    factories: BTreeMap<String, ServiceFactory>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the built-in services
    pub fn with_builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register::<EchoService>();
        catalog
    }

    /// Register a default-constructible service under its Rust type name
    pub fn register<S>(&mut self) -> &mut Self
    where
        S: Service + Default + 'static,
    {
        self.register_with(type_name::<S>(), || {
            let handle: ServiceHandle = Arc::new(Mutex::new(S::default()));
            handle
        })
    }

    /// Register a custom constructor under an explicit name
    pub fn register_with<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> ServiceHandle + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(service = %name, "service type registered");
        self.factories.insert(name, Arc::new(factory));
        self
    }

    pub fn create(&self, name: &str) -> ProtocolResult<ServiceHandle> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| ProtocolError::UnknownService(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

/// Wrap a concrete service as a [`ServiceHandle`]
pub fn handle<S: Service + 'static>(service: S) -> ServiceHandle {
    Arc::new(Mutex::new(service))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoCall {
    pub message: String,
}

envelope_messages! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum EchoMessage {
        EchoCall(EchoCall),
    }
}

const ECHO_PREFIX: &str = "Post:";

/// Test service: answers every call with `Post:<message>`
///
/// Replies are not answered again, so two echo services settle after one
/// round trip.
pub struct EchoService {
    codec: EnvelopeCodec<EchoMessage>,
    previous_message: Option<String>,
    received: Vec<String>,
    active: bool,
}

impl EchoService {
    /// Queue a call for the peer's echo service
    pub fn call(&mut self, message: impl Into<String>) -> ProtocolResult<()> {
        self.codec.enqueue(&EchoMessage::EchoCall(EchoCall {
            message: message.into(),
        }))
    }

    pub fn previous_message(&self) -> Option<&str> {
        self.previous_message.as_deref()
    }

    /// Every message received so far, oldest first
    pub fn received(&self) -> &[String] {
        &self.received
    }

    fn process(&mut self) -> ProtocolResult<()> {
        while let Some(EchoMessage::EchoCall(call)) = self.codec.try_dequeue()? {
            if !call.message.starts_with(ECHO_PREFIX) {
                self.call(format!("{}{}", ECHO_PREFIX, call.message))?;
            }
            self.received.push(call.message.clone());
            self.previous_message = Some(call.message);
        }
        Ok(())
    }
}

impl Default for EchoService {
    fn default() -> Self {
        Self {
            codec: EnvelopeCodec::with_max_message_size(MAX_SERVICE_WRITE),
            previous_message: None,
            received: Vec::new(),
            active: false,
        }
    }
}

impl Service for EchoService {
    fn type_name(&self) -> &'static str {
        type_name::<Self>()
    }

    fn read(&mut self, data: &[u8]) {
        self.codec.feed(data);
        if let Err(e) = self.process() {
            warn!(error = %e, "echo service dropped malformed input");
        }
    }

    fn write(&mut self) -> Vec<u8> {
        self.codec.write(MAX_SERVICE_WRITE).to_vec()
    }

    fn available(&self) -> bool {
        self.codec.has_outbound()
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn set_active(&mut self, active: bool) {
        self.active = active;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pump(from: &mut EchoService, to: &mut EchoService) {
        while from.available() {
            let bytes = from.write();
            to.read(&bytes);
        }
    }

    #[test]
    fn test_echo_round_trip() {
        let mut local = EchoService::default();
        let mut remote = EchoService::default();

        local.call("hello").unwrap();
        pump(&mut local, &mut remote);
        assert_eq!(remote.previous_message(), Some("hello"));

        pump(&mut remote, &mut local);
        assert_eq!(local.previous_message(), Some("Post:hello"));

        // Replies are not echoed again
        assert!(!local.available());
    }

    #[test]
    fn test_catalog_creates_by_name() {
        let catalog = ServiceCatalog::with_builtin();
        let name = type_name::<EchoService>();

        assert!(catalog.contains(name));
        let service = catalog.create(name).unwrap();
        assert_eq!(service.lock().type_name(), name);
    }

    #[test]
    fn test_catalog_unknown_name() {
        let catalog = ServiceCatalog::new();
        assert!(matches!(
            catalog.create("missing::Service"),
            Err(ProtocolError::UnknownService(_))
        ));
    }

    #[test]
    fn test_catalog_closure_factory() {
        let mut catalog = ServiceCatalog::new();
        catalog.register_with("custom", || handle(EchoService::default()));
        assert_eq!(catalog.names(), vec!["custom"]);
        assert!(catalog.create("custom").is_ok());
    }
}
