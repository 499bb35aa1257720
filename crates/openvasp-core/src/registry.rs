//! Counterparty key lookup.
//!
//! Peers publish three compressed secp256k1 public keys under their
//! identity code: a transport key (asymmetric envelope encryption for
//! bootstrap frames), a signing key (payload signature verification),
//! and a message key (session-level key agreement). The lookup backend
//! (on-chain registry, directory service) is out of scope; this module
//! only fixes the interface.

use crate::types::VaspCode;
use async_trait::async_trait;
use std::collections::HashMap;

/// Async counterparty key lookup.
///
/// Every method returns the compressed public key as lowercase hex, or
/// `None` when the counterparty has not published a key of that kind.
/// Callers must treat a missing key as an explicit error - never
/// fabricate a default.
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    /// The peer's transport (envelope encryption) key
    async fn transport_key(&self, code: &VaspCode) -> Option<String>;

    /// The peer's payload signing key
    async fn signing_key(&self, code: &VaspCode) -> Option<String>;

    /// The peer's session message key
    async fn message_key(&self, code: &VaspCode) -> Option<String>;
}

/// Registry entry for one VASP
#[derive(Debug, Clone, Default)]
pub struct RegistryEntry {
    /// Compressed transport key hex
    pub transport_key: Option<String>,
    /// Compressed signing key hex
    pub signing_key: Option<String>,
    /// Compressed message key hex
    pub message_key: Option<String>,
}

/// Fixed in-memory registry for known peer sets and tests.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    entries: HashMap<VaspCode, RegistryEntry>,
}

impl StaticRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for a VASP
    pub fn insert(&mut self, code: VaspCode, entry: RegistryEntry) {
        self.entries.insert(code, entry);
    }
}

#[async_trait]
impl KeyRegistry for StaticRegistry {
    async fn transport_key(&self, code: &VaspCode) -> Option<String> {
        self.entries.get(code)?.transport_key.clone()
    }

    async fn signing_key(&self, code: &VaspCode) -> Option<String> {
        self.entries.get(code)?.signing_key.clone()
    }

    async fn message_key(&self, code: &VaspCode) -> Option<String> {
        self.entries.get(code)?.message_key.clone()
    }
}
