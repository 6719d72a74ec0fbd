//! Encryption fan-out (C7): `createParticipantNodes` — encrypts one message
//! to many recipients concurrently, substituting the device-sent-message
//! variant for the sender's own other devices, and reports whether any
//! recipient needed a pre-key message (which forces `<device-identity>`
//! inclusion upstream).
//!
//! Grounded on the teacher's `binary::node::Node` builder for stanza
//! assembly and on [`crate::keystore::KeyStore`]'s per-tag mutex idiom for
//! the per-recipient serialization spec.md §5 requires.

use crate::binary::node::Node;
use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::signal::repository::SignalRepository;
use futures_util::future::try_join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Either one patched payload for every recipient, or a distinct payload
/// per wire-addressed recipient (keyed by `Jid::to_string()`).
pub enum PatchedMessage {
    Single(Vec<u8>),
    PerRecipient(HashMap<String, Vec<u8>>),
}

pub type PreSendPatcher = dyn Fn(&[u8]) -> PatchedMessage + Send + Sync;

/// Identity context needed to decide whether a recipient is "our own,
/// non-exact device" and should get the DSM substitute instead.
pub struct FanoutContext<'a> {
    pub own_pn_user: &'a str,
    pub own_lid_user: &'a str,
    pub own_exact_device: u16,
}

pub struct FanoutResult {
    pub nodes: Vec<Node>,
    pub should_include_device_identity: bool,
}

fn payload_for<'a>(patched: &'a PatchedMessage, wire_key: &str) -> &'a [u8] {
    match patched {
        PatchedMessage::Single(bytes) => bytes.as_slice(),
        PatchedMessage::PerRecipient(map) => map.get(wire_key).map(|v| v.as_slice()).unwrap_or(&[]),
    }
}

fn build_to_node(jid: &Jid, enc_type: &'static str, ciphertext: Vec<u8>) -> Node {
    let enc = Node::new("enc".to_string())
        .attr("v".to_string(), "2".to_string())
        .attr("type".to_string(), enc_type.to_string())
        .with_binary(ciphertext);
    Node::new("to".to_string()).attr("jid".to_string(), jid.to_string()).with_children(vec![enc])
}

/// Encrypts to every recipient under a per-recipient keyed mutex, so Signal
/// session state is never mutated concurrently for the same peer across
/// overlapping sends.
pub struct EncryptionFanout {
    repository: Arc<SignalRepository>,
    recipient_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EncryptionFanout {
    pub fn new(repository: Arc<SignalRepository>) -> Self {
        Self { repository, recipient_locks: Mutex::new(HashMap::new()) }
    }

    async fn recipient_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.recipient_locks.lock().await;
        locks.entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub async fn create_participant_nodes(
        &self,
        recipients: &[Jid],
        message: &[u8],
        context: &FanoutContext<'_>,
        patcher: Option<&PreSendPatcher>,
        dsm_message: Option<&[u8]>,
    ) -> Result<FanoutResult> {
        let patched = match patcher {
            Some(patch) => patch(message),
            None => PatchedMessage::Single(message.to_vec()),
        };
        let should_include_device_identity = Arc::new(Mutex::new(false));

        let tasks = recipients.iter().map(|recipient| {
            let flag = should_include_device_identity.clone();
            let patched = &patched;
            let repository = &self.repository;
            async move {
                let wire_key = recipient.to_string();
                let lock = self.recipient_lock(&wire_key).await;
                let _guard = lock.lock().await;

                let is_own_non_exact_device = (recipient.user == context.own_pn_user
                    || recipient.user == context.own_lid_user)
                    && recipient.device != context.own_exact_device;

                let payload = if is_own_non_exact_device {
                    dsm_message.unwrap_or_else(|| payload_for(patched, &wire_key))
                } else {
                    payload_for(patched, &wire_key)
                };

                let encrypted = repository.encrypt_message(recipient, payload).await?;
                if encrypted.message_type == "pkmsg" {
                    *flag.lock().await = true;
                }

                Ok::<Node, Error>(build_to_node(recipient, encrypted.message_type, encrypted.ciphertext))
            }
        });

        let nodes = try_join_all(tasks).await?;
        let should_include_device_identity = *should_include_device_identity.lock().await;
        Ok(FanoutResult { nodes, should_include_device_identity })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jid::ServerKind;
    use crate::keystore::{KeyStore, MemoryKeyStoreBackend};
    use crate::lid::{LidMappingStore, NoopResolver};
    use crate::signal::binding::StorageBinding;
    use crate::signal::prekey::PreKeyBundle;
    use crate::util::keys::SigningKeyPair;

    async fn fanout_with_session(recipient: &Jid) -> EncryptionFanout {
        let store = Arc::new(KeyStore::new(Box::new(MemoryKeyStoreBackend::new())));
        let mapping = Arc::new(LidMappingStore::new(store.clone(), Box::new(NoopResolver)));
        let our_identity = SigningKeyPair::generate();
        let binding = Arc::new(StorageBinding::new(mapping, our_identity.clone(), 1));
        let repository = Arc::new(SignalRepository::new(store, binding));

        let their_identity = SigningKeyPair::generate();
        let bundle = PreKeyBundle::new(&their_identity, 1, Some(2), 42, recipient.device as u32).unwrap();
        repository.inject_e2e_session(recipient, &bundle).await.unwrap();
        EncryptionFanout::new(repository)
    }

    #[tokio::test]
    async fn encrypts_to_every_recipient_once() {
        let recipient = Jid::new("555", ServerKind::User);
        let fanout = fanout_with_session(&recipient).await;
        let context = FanoutContext { own_pn_user: "me", own_lid_user: "me-lid", own_exact_device: 0 };

        let result = fanout
            .create_participant_nodes(&[recipient.clone()], b"hello", &context, None, None)
            .await
            .unwrap();

        assert_eq!(result.nodes.len(), 1);
        assert_eq!(result.nodes[0].tag, "to");
        assert_eq!(result.nodes[0].get_attr("jid"), Some(&recipient.to_string()));
    }

    #[tokio::test]
    async fn first_message_is_a_prekey_message() {
        let recipient = Jid::new("555", ServerKind::User);
        let fanout = fanout_with_session(&recipient).await;
        let context = FanoutContext { own_pn_user: "me", own_lid_user: "me-lid", own_exact_device: 0 };

        let result = fanout
            .create_participant_nodes(&[recipient], b"hello", &context, None, None)
            .await
            .unwrap();
        assert!(result.should_include_device_identity);
    }
}
