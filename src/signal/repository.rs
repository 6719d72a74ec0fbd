//! Signal repository (C5): the transactional operation surface the relay
//! pipeline calls — encrypt/decrypt for pairwise and group messages, session
//! injection, validation, deletion and PN→LID migration. Every public method
//! wraps its work in [`KeyStore::transaction`] tagged per spec.md's naming
//! (`jid`, `group-id`, `delete-<n>-sessions`, `migrate-<n>-sessions-<to-user>`).
//!
//! Grounded on the teacher's `signal::SignalProtocolManager`, generalized
//! from its four boxed in-process stores to the key-store-backed
//! [`StorageBinding`].

use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::keystore::KeyStore;
use crate::signal::address::SignalAddress;
use crate::signal::binding::StorageBinding;
use crate::signal::group::{SenderKey, SenderKeyDistribution, SenderKeyState};
use crate::signal::prekey::PreKeyBundle;
use crate::signal::session::SessionState;
use crate::signal::{SignalMessage, SignalMessageType};
use crate::util::keys::ECKeyPair;
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;

pub struct EncryptedMessage {
    pub message_type: &'static str,
    pub ciphertext: Vec<u8>,
}

pub struct GroupEncryptResult {
    pub ciphertext: Vec<u8>,
    pub sender_key_distribution_message: Vec<u8>,
}

pub struct SessionValidation {
    pub exists: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MigrationResult {
    pub migrated: u32,
    pub skipped: u32,
    pub total: u32,
}

const MIGRATED_SESSION_CACHE_TTL: Duration = Duration::from_secs(3 * 24 * 3600);

fn wire_type(message_type: SignalMessageType) -> &'static str {
    match message_type {
        SignalMessageType::PreKeyWhisperMessage => "pkmsg",
        _ => "msg",
    }
}

fn parse_wire_type(type_str: &str) -> Result<SignalMessageType> {
    match type_str {
        "pkmsg" => Ok(SignalMessageType::PreKeyWhisperMessage),
        "msg" => Ok(SignalMessageType::WhisperMessage),
        other => Err(Error::UnknownMessageType(other.to_string())),
    }
}

pub struct SignalRepository {
    store: Arc<KeyStore>,
    binding: Arc<StorageBinding>,
    migrated_cache: crate::cache::TtlCache<String, ()>,
}

impl SignalRepository {
    pub fn new(store: Arc<KeyStore>, binding: Arc<StorageBinding>) -> Self {
        Self { store, binding, migrated_cache: crate::cache::TtlCache::new(MIGRATED_SESSION_CACHE_TTL) }
    }

    pub async fn encrypt_message(&self, jid: &Jid, data: &[u8]) -> Result<EncryptedMessage> {
        let address = self.binding.resolve_address(jid).await?;
        let tag = jid.to_string();
        let binding = self.binding.clone();
        let data = data.to_vec();
        self.store
            .transaction(&tag, move |txn| {
                let binding = binding.clone();
                let address = address.clone();
                Box::pin(async move {
                    let mut session = binding
                        .load_session(txn, &address)
                        .await?
                        .ok_or_else(|| Error::SessionMissing(address.to_string()))?;
                    let message = session.encrypt(&data)?;
                    binding.store_session(txn, &address, &session).await?;
                    Ok(EncryptedMessage {
                        message_type: wire_type(message.message_type),
                        ciphertext: message.serialized,
                    })
                })
            })
            .await
    }

    /// The opaque `tctoken` column value stored for `jid`, if any.
    pub async fn get_tctoken(&self, jid: &Jid) -> Result<Option<Vec<u8>>> {
        let key = jid.to_string();
        let row = self.store.get("tctoken", &[key.clone()]).await?;
        Ok(row.get(&key).cloned().flatten())
    }

    pub async fn decrypt_message(&self, jid: &Jid, message_type: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let signal_type = parse_wire_type(message_type)?;
        let address = self.binding.resolve_address(jid).await?;
        let tag = jid.to_string();
        let binding = self.binding.clone();
        let ciphertext = ciphertext.to_vec();
        self.store
            .transaction(&tag, move |txn| {
                let binding = binding.clone();
                let address = address.clone();
                Box::pin(async move {
                    let mut session = binding
                        .load_session(txn, &address)
                        .await?
                        .ok_or_else(|| Error::SessionMissing(address.to_string()))?;
                    let plaintext = session.decrypt(&SignalMessage { message_type: signal_type, serialized: ciphertext })?;
                    binding.store_session(txn, &address, &session).await?;
                    Ok(plaintext)
                })
            })
            .await
    }

    pub async fn encrypt_group_message(
        &self,
        group_id: &str,
        me: &SignalAddress,
        data: &[u8],
    ) -> Result<GroupEncryptResult> {
        let tag = group_id.to_string();
        let binding = self.binding.clone();
        let group_id = group_id.to_string();
        let me = me.clone();
        let data = data.to_vec();
        self.store
            .transaction(&tag, move |txn| {
                let binding = binding.clone();
                Box::pin(async move {
                    let mut record = match binding.load_sender_key(txn, &group_id, &me).await? {
                        Some(record) => record,
                        None => {
                            let record = new_sender_key_record();
                            binding.store_sender_key(txn, &group_id, &me, &record).await?;
                            record
                        }
                    };
                    let distribution = SenderKeyDistribution::new(
                        record.sender_key_id,
                        record.sender_key.iteration,
                        record.sender_key.chain_key,
                        record.sender_key.signing_key,
                    );
                    let message = record.encrypt(&data)?;
                    binding.store_sender_key(txn, &group_id, &me, &record).await?;
                    Ok(GroupEncryptResult {
                        ciphertext: message.serialized,
                        sender_key_distribution_message: distribution.serialize()?.serialized,
                    })
                })
            })
            .await
    }

    pub async fn decrypt_group_message(
        &self,
        group_id: &str,
        author: &SignalAddress,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let tag = group_id.to_string();
        let binding = self.binding.clone();
        let group_id = group_id.to_string();
        let author = author.clone();
        let ciphertext = ciphertext.to_vec();
        self.store
            .transaction(&tag, move |txn| {
                let binding = binding.clone();
                Box::pin(async move {
                    let mut record = binding
                        .load_sender_key(txn, &group_id, &author)
                        .await?
                        .ok_or_else(|| Error::SessionMissing(format!("{group_id}/{author}")))?;
                    let message = SignalMessage { message_type: SignalMessageType::SenderKeyMessage, serialized: ciphertext };
                    let plaintext = record.decrypt(&message)?;
                    binding.store_sender_key(txn, &group_id, &author, &record).await?;
                    Ok(plaintext)
                })
            })
            .await
    }

    /// Installs a sender key received from `author`; creates an empty
    /// record first if one doesn't already exist for a later fast-forward.
    pub async fn process_sender_key_distribution_message(
        &self,
        group_id: Option<&str>,
        author: &SignalAddress,
        item: &[u8],
    ) -> Result<()> {
        let group_id = group_id.ok_or(Error::MissingGroupId)?;
        let distribution = SenderKeyDistribution::deserialize(&SignalMessage {
            message_type: SignalMessageType::SenderKeyDistributionMessage,
            serialized: item.to_vec(),
        })?;

        let tag = group_id.to_string();
        let binding = self.binding.clone();
        let group_id = group_id.to_string();
        let author = author.clone();
        self.store
            .transaction(&tag, move |txn| {
                let binding = binding.clone();
                Box::pin(async move {
                    let mut state = SenderKeyState::new(
                        distribution.id,
                        distribution.chain_key,
                        distribution.signing_key,
                    );
                    state.sender_key.iteration = distribution.iteration;
                    binding.store_sender_key(txn, &group_id, &author, &state).await
                })
            })
            .await
    }

    /// Seeds an outgoing pairwise session from a received pre-key bundle.
    pub async fn inject_e2e_session(&self, jid: &Jid, bundle: &PreKeyBundle) -> Result<()> {
        let address = self.binding.resolve_address(jid).await?;
        let tag = jid.to_string();
        let binding = self.binding.clone();
        let bundle = bundle.clone();
        self.store
            .transaction(&tag, move |txn| {
                let binding = binding.clone();
                let address = address.clone();
                Box::pin(async move {
                    let ephemeral = ECKeyPair::generate();
                    let (session, _base_key) = SessionState::initialize_alice_session(
                        binding.get_our_identity_keypair(),
                        &bundle,
                        &ephemeral,
                    )?;
                    binding.store_session(txn, &address, &session).await
                })
            })
            .await
    }

    /// Exists iff a record is loadable and reports at least one open
    /// ratchet direction.
    pub async fn validate_session(&self, jid: &Jid) -> Result<SessionValidation> {
        let address = self.binding.resolve_address(jid).await?;
        let tag = jid.to_string();
        let binding = self.binding.clone();
        self.store
            .transaction(&tag, move |txn| {
                let binding = binding.clone();
                let address = address.clone();
                Box::pin(async move {
                    match binding.load_session(txn, &address).await? {
                        Some(session) if session.is_open() => {
                            Ok(SessionValidation { exists: true, reason: None })
                        }
                        Some(_) => Ok(SessionValidation {
                            exists: false,
                            reason: Some("session record has no open ratchet".to_string()),
                        }),
                        None => Ok(SessionValidation { exists: false, reason: Some("no session record".to_string()) }),
                    }
                })
            })
            .await
    }

    /// Sets every target's session to null in one transaction.
    pub async fn delete_session(&self, jids: &[Jid]) -> Result<()> {
        let tag = format!("delete-{}-sessions", jids.len());
        let binding = self.binding.clone();
        let jids = jids.to_vec();
        self.store
            .transaction(&tag, move |txn| {
                let binding = binding.clone();
                Box::pin(async move {
                    for jid in &jids {
                        let address = binding.resolve_address(jid).await?;
                        binding.delete_session(txn, &address).await;
                    }
                    Ok(())
                })
            })
            .await
    }

    /// Filters `device_keys` down to the ones not yet marked in `group_id`'s
    /// sender-key memory — the devices a group send still needs to include
    /// in its sender-key distribution fan-out.
    pub async fn sender_key_memory_missing(&self, group_id: &str, device_keys: &[String]) -> Result<Vec<String>> {
        let tag = group_id.to_string();
        let binding = self.binding.clone();
        let group_id = group_id.to_string();
        let device_keys = device_keys.to_vec();
        self.store
            .transaction(&tag, move |txn| {
                let binding = binding.clone();
                let group_id = group_id.clone();
                let device_keys = device_keys.clone();
                Box::pin(async move {
                    let mut missing = Vec::new();
                    for key in &device_keys {
                        if !binding.sender_key_memory_contains(txn, &group_id, key).await? {
                            missing.push(key.clone());
                        }
                    }
                    Ok(missing)
                })
            })
            .await
    }

    /// Marks `device_keys` as having received `group_id`'s current
    /// sender-key distribution.
    pub async fn mark_sender_key_memory(&self, group_id: &str, device_keys: &[String]) -> Result<()> {
        let tag = group_id.to_string();
        let binding = self.binding.clone();
        let group_id = group_id.to_string();
        let device_keys = device_keys.to_vec();
        self.store
            .transaction(&tag, move |txn| {
                let binding = binding.clone();
                let group_id = group_id.clone();
                let device_keys = device_keys.clone();
                Box::pin(async move {
                    binding.sender_key_memory_mark(txn, &group_id, &device_keys).await;
                    Ok(())
                })
            })
            .await
    }

    /// Migrates every device of `from_pn`'s user onto `to_lid`'s user,
    /// preserving device numbers. See spec.md §4.4 for the 8-step algorithm
    /// this follows.
    pub async fn migrate_session(&self, from_pn: &Jid, to_lid: &Jid) -> Result<MigrationResult> {
        let pn_user = from_pn.user.clone();
        let device_list_row = self.store.get("device-list", &[pn_user.clone()]).await?;
        let mut devices: Vec<u16> = match device_list_row.get(&pn_user).cloned().flatten() {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => return Ok(MigrationResult::default()),
        };
        if !devices.contains(&from_pn.device) {
            devices.push(from_pn.device);
        }

        let mut to_migrate = Vec::new();
        let mut skipped = 0u32;
        for device in &devices {
            let cache_key = format!("{pn_user}.{device}");
            if self.migrated_cache.get(&cache_key).await.is_some() {
                skipped += 1;
            } else {
                to_migrate.push(*device);
            }
        }
        let total = devices.len() as u32;
        if to_migrate.is_empty() {
            return Ok(MigrationResult { migrated: 0, skipped, total });
        }

        let tag = format!("migrate-{}-sessions-{}", to_migrate.len(), to_lid.user);
        let binding = self.binding.clone();
        let pn_user_for_txn = pn_user.clone();
        let to_lid = to_lid.clone();
        let to_migrate_for_txn = to_migrate.clone();
        let migrated_devices = self
            .store
            .transaction(&tag, move |txn| {
                let binding = binding.clone();
                let pn_user = pn_user_for_txn.clone();
                let to_lid = to_lid.clone();
                let to_migrate = to_migrate_for_txn.clone();
                Box::pin(async move {
                    let mut migrated = Vec::new();
                    for device in to_migrate {
                        let pn_jid = Jid::with_device(&pn_user, device, from_pn_server(device))?;
                        let pn_addr = SignalAddress::from_jid(&pn_jid)?;
                        let lid_jid = pn_jid.to_lid_address(&to_lid.user);
                        let lid_addr = SignalAddress::from_jid(&lid_jid)?;

                        if let Some(session) = binding.load_session(txn, &pn_addr).await? {
                            if session.is_open() {
                                binding.store_session(txn, &lid_addr, &session).await?;
                                binding.delete_session(txn, &pn_addr).await;
                                migrated.push(device);
                            }
                        }
                    }
                    Ok(migrated)
                })
            })
            .await?;

        for device in &migrated_devices {
            self.migrated_cache.insert(format!("{pn_user}.{device}"), ()).await;
        }

        Ok(MigrationResult { migrated: migrated_devices.len() as u32, skipped, total })
    }
}

fn from_pn_server(device: u16) -> crate::jid::ServerKind {
    if device == crate::jid::HOSTED_DEVICE {
        crate::jid::ServerKind::Hosted
    } else {
        crate::jid::ServerKind::User
    }
}

fn new_sender_key_record() -> SenderKeyState {
    let mut rng = rand::thread_rng();
    let mut chain_key = [0u8; 32];
    rng.fill_bytes(&mut chain_key);
    let signing_key = ECKeyPair::generate().public_bytes();
    let sender_key_id = rng.next_u32();
    SenderKeyState { sender_key_id, sender_key: SenderKey::new(sender_key_id, chain_key, signing_key), message_number: 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jid::ServerKind;
    use crate::keystore::MemoryKeyStoreBackend;
    use crate::lid::{LidMappingStore, NoopResolver};
    use crate::util::keys::SigningKeyPair;

    fn repository() -> SignalRepository {
        let store = Arc::new(KeyStore::new(Box::new(MemoryKeyStoreBackend::new())));
        let mapping = Arc::new(LidMappingStore::new(store.clone(), Box::new(NoopResolver)));
        let binding = Arc::new(StorageBinding::new(mapping, SigningKeyPair::generate(), 7));
        SignalRepository::new(store, binding)
    }

    #[tokio::test]
    async fn encrypt_without_session_surfaces_session_missing() {
        let repo = repository();
        let jid = Jid::new("555", ServerKind::User);
        let err = repo.encrypt_message(&jid, b"hi").await.unwrap_err();
        assert!(matches!(err, Error::SessionMissing(_)));
    }

    #[tokio::test]
    async fn validate_session_false_when_absent() {
        let repo = repository();
        let jid = Jid::new("555", ServerKind::User);
        let validation = repo.validate_session(&jid).await.unwrap();
        assert!(!validation.exists);
    }

    #[tokio::test]
    async fn decrypt_rejects_unknown_type() {
        let repo = repository();
        let jid = Jid::new("555", ServerKind::User);
        let err = repo.decrypt_message(&jid, "weird", b"x").await.unwrap_err();
        assert!(matches!(err, Error::UnknownMessageType(_)));
    }

    #[tokio::test]
    async fn group_encrypt_bootstraps_sender_key_record() {
        let repo = repository();
        let me = SignalAddress { user: "me".to_string(), device: 0 };
        let result = repo.encrypt_group_message("group1", &me, b"hello").await.unwrap();
        assert!(!result.ciphertext.is_empty());
        assert_eq!(result.sender_key_distribution_message.len(), 72);
    }

    #[tokio::test]
    async fn migrate_session_is_noop_without_device_list() {
        let repo = repository();
        let pn = Jid::new("555", ServerKind::User);
        let lid = Jid::new("abc", ServerKind::Lid);
        let result = repo.migrate_session(&pn, &lid).await.unwrap();
        assert_eq!(result, MigrationResult::default());
    }
}
