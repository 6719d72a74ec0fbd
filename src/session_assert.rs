//! Session asserter (C7): guarantees a Signal session exists for every
//! target JID before the fan-out stage tries to encrypt to it, fetching
//! pre-key bundles for whichever targets are missing one.
//!
//! Grounded on the teacher's IQ-roundtrip shape in `socket::mod` adapted to
//! an injected [`PreKeyFetchTransport`], the same decoupling
//! [`crate::usync::UsyncTransport`] gives the device directory.

use crate::error::Result;
use crate::jid::Jid;
use crate::lid::LidMappingStore;
use crate::signal::prekey::PreKeyBundle;
use crate::signal::repository::SignalRepository;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Fetches pre-key bundles for a batch of wire-addressed JIDs via `<iq
/// xmlns="encrypt" type="get">`. `forced` adds `reason="identity"` to each
/// `<user>` child, per spec.md §4.6 step 5.
#[async_trait]
pub trait PreKeyFetchTransport: Send + Sync {
    async fn fetch_prekey_bundles(&self, wire_jids: &[Jid], forced: bool) -> Result<Vec<(Jid, PreKeyBundle)>>;
}

pub struct NoopPreKeyFetchTransport;

#[async_trait]
impl PreKeyFetchTransport for NoopPreKeyFetchTransport {
    async fn fetch_prekey_bundles(&self, _wire_jids: &[Jid], _forced: bool) -> Result<Vec<(Jid, PreKeyBundle)>> {
        Ok(Vec::new())
    }
}

/// Guarantees a Signal session for every target, fetching only on miss or
/// when `force` is set. No TTL: unlike the device and mapping caches, this
/// tracks the authoritative `validateSession` answer for the process
/// lifetime, invalidated only by explicit session deletion/migration.
pub struct SessionAsserter {
    repository: Arc<SignalRepository>,
    mapping: Arc<LidMappingStore>,
    transport: Box<dyn PreKeyFetchTransport>,
    peer_sessions: RwLock<HashMap<String, bool>>,
}

impl SessionAsserter {
    pub fn new(repository: Arc<SignalRepository>, mapping: Arc<LidMappingStore>, transport: Box<dyn PreKeyFetchTransport>) -> Self {
        Self { repository, mapping, transport, peer_sessions: RwLock::new(HashMap::new()) }
    }

    /// Returns whether a fetch actually happened.
    pub async fn assert_sessions(&self, jids: &[Jid], force: bool) -> Result<bool> {
        let mut seen = HashSet::new();
        let mut deduped = Vec::new();
        for jid in jids {
            if seen.insert(jid.to_string()) {
                deduped.push(jid.clone());
            }
        }

        let mut need_fetch = Vec::new();
        for jid in &deduped {
            let key = jid.to_string();
            let cached = self.peer_sessions.read().await.get(&key).copied();
            let has_session = match cached {
                Some(v) => v,
                None => {
                    let validation = self.repository.validate_session(jid).await?;
                    self.peer_sessions.write().await.insert(key, validation.exists);
                    validation.exists
                }
            };
            if !has_session || force {
                need_fetch.push(jid.clone());
            }
        }

        if need_fetch.is_empty() {
            return Ok(false);
        }

        let pn_targets: Vec<Jid> = need_fetch.iter().filter(|j| j.is_user()).cloned().collect();
        let pairs = self.mapping.lids_for_pns(&pn_targets).await?;

        let mut wire_jids = Vec::with_capacity(need_fetch.len());
        for jid in &need_fetch {
            if jid.is_user() {
                if let Some(pair) = pairs.iter().find(|p| p.pn == *jid) {
                    wire_jids.push(pair.lid.clone());
                    continue;
                }
            }
            wire_jids.push(jid.clone());
        }

        let bundles = self.transport.fetch_prekey_bundles(&wire_jids, force).await?;
        for (jid, bundle) in &bundles {
            self.repository.inject_e2e_session(jid, bundle).await?;
        }

        let mut cache = self.peer_sessions.write().await;
        for jid in &wire_jids {
            cache.insert(jid.to_string(), true);
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jid::ServerKind;
    use crate::keystore::{KeyStore, MemoryKeyStoreBackend};
    use crate::lid::NoopResolver;
    use crate::signal::binding::StorageBinding;
    use crate::util::keys::SigningKeyPair;

    struct EmptyTransport;

    #[async_trait]
    impl PreKeyFetchTransport for EmptyTransport {
        async fn fetch_prekey_bundles(&self, _wire_jids: &[Jid], _forced: bool) -> Result<Vec<(Jid, PreKeyBundle)>> {
            Ok(Vec::new())
        }
    }

    fn asserter() -> SessionAsserter {
        let store = Arc::new(KeyStore::new(Box::new(MemoryKeyStoreBackend::new())));
        let mapping = Arc::new(LidMappingStore::new(store.clone(), Box::new(NoopResolver)));
        let binding = Arc::new(StorageBinding::new(mapping.clone(), SigningKeyPair::generate(), 1));
        let repository = Arc::new(SignalRepository::new(store, binding));
        SessionAsserter::new(repository, mapping, Box::new(EmptyTransport))
    }

    #[tokio::test]
    async fn fetch_happens_on_first_call_with_no_bundles_returned() {
        let asserter = asserter();
        let jid = Jid::new("555", ServerKind::User);
        let fetched = asserter.assert_sessions(&[jid], false).await.unwrap();
        assert!(fetched);
    }

    #[tokio::test]
    async fn dedupes_repeated_targets() {
        let asserter = asserter();
        let jid = Jid::new("555", ServerKind::User);
        asserter.assert_sessions(&[jid.clone(), jid], false).await.unwrap();
        assert_eq!(asserter.peer_sessions.read().await.len(), 1);
    }
}
