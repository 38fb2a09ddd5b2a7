//! Directory shared by every session of one supervisor
//!
//! Connection entities, users and per-address login budgets. Everything
//! lives in memory behind one lock and is handed around as an `Arc`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use constant_time_eq::constant_time_eq;
use parking_lot::RwLock;
use sha2::{Digest, Sha512};
use tracing::debug;

/// A remote party the host has seen before
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEntity {
    pub id: u64,
    pub title: String,
    pub blacklisted: bool,
}


#[derive(Debug)]
struct CacheState {
    entities: HashMap<u64, ConnectionEntity>,
    /// Name to SHA-512 password digest
    users: HashMap<String, Vec<u8>>,
    retries: HashMap<IpAddr, u16>,
    next_entity_id: u64,
}

/// Shared user and connection directory
#[derive(Debug)]
pub struct PrimaryCache {
    state: RwLock<CacheState>,
}

impl Default for PrimaryCache {
    fn default() -> Self {
        Self {
            state: RwLock::new(CacheState {
                entities: HashMap::new(),
                users: HashMap::new(),
                retries: HashMap::new(),
                next_entity_id: 1,
            }),
        }
    }
}

/// SHA-512 digest sent in login and register messages
pub fn password_digest(password: &str) -> Vec<u8> {
    Sha512::digest(password.as_bytes()).to_vec()
}

impl PrimaryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entity(&self, id: u64) -> Option<ConnectionEntity> {
        self.state.read().entities.get(&id).cloned()
    }

    pub fn has_entity(&self, id: u64) -> bool {
        self.state.read().entities.contains_key(&id)
    }

    /// Record a new entity and return its id
    pub fn add_entity(&self, title: impl Into<String>) -> u64 {
        let mut state = self.state.write();
        let id = state.next_entity_id;
        state.next_entity_id += 1;
        state.entities.insert(
            id,
            ConnectionEntity {
                id,
                title: title.into(),
                blacklisted: false,
            },
        );
        id
    }

    pub fn set_blacklisted(&self, id: u64, blacklisted: bool) {
        if let Some(entity) = self.state.write().entities.get_mut(&id) {
            entity.blacklisted = blacklisted;
        }
    }

    /// Create a user; returns false when the name is taken
    pub fn add_user(&self, name: &str, digest: &[u8]) -> bool {
        let mut state = self.state.write();
        if state.users.contains_key(name) {
            return false;
        }
        state.users.insert(name.to_string(), digest.to_vec());
        debug!(user = name, "user added");
        true
    }

    pub fn has_user(&self, name: &str) -> bool {
        self.state.read().users.contains_key(name)
    }

    /// Check a password digest in constant time
    pub fn verify_user(&self, name: &str, digest: &[u8]) -> bool {
        self.state
            .read()
            .users
            .get(name)
            .map_or(false, |stored| constant_time_eq(stored, digest))
    }

    /// Login attempts left for an address
    pub fn retries_left(&self, addr: IpAddr, max_retries: u16) -> u16 {
        self.state
            .read()
            .retries
            .get(&addr)
            .copied()
            .unwrap_or(max_retries)
    }

    /// Spend one attempt and return what is left
    pub fn consume_retry(&self, addr: IpAddr, max_retries: u16) -> u16 {
        let mut state = self.state.write();
        let left = state.retries.entry(addr).or_insert(max_retries);
        *left = left.saturating_sub(1);
        *left
    }

    pub fn reset_retries(&self, addr: IpAddr) {
        self.state.write().retries.remove(&addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_entity_ids_start_at_one() {
        let cache = PrimaryCache::new();
        let first = cache.add_entity("alpha");
        let second = cache.add_entity("beta");

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert!(cache.has_entity(1));
        assert!(!cache.has_entity(0));

        cache.set_blacklisted(first, true);
        assert!(cache.entity(first).unwrap().blacklisted);
    }

    #[test]
    fn test_user_verification() {
        let cache = PrimaryCache::new();
        let digest = password_digest("hunter2");
        assert_eq!(digest.len(), 64);

        assert!(cache.add_user("alice", &digest));
        assert!(!cache.add_user("alice", &digest));

        assert!(cache.verify_user("alice", &digest));
        assert!(!cache.verify_user("alice", &password_digest("wrong")));
        assert!(!cache.verify_user("bob", &digest));
    }

    #[test]
    fn test_retry_budget() {
        let cache = PrimaryCache::new();
        let addr = IpAddr::V4(Ipv4Addr::LOCALHOST);

        assert_eq!(cache.retries_left(addr, 3), 3);
        assert_eq!(cache.consume_retry(addr, 3), 2);
        assert_eq!(cache.consume_retry(addr, 3), 1);
        assert_eq!(cache.consume_retry(addr, 3), 0);
        assert_eq!(cache.consume_retry(addr, 3), 0);

        cache.reset_retries(addr);
        assert_eq!(cache.retries_left(addr, 3), 3);
    }
}
