//! Relay pipeline (C8, spec.md §4.8): the single entry point that takes a
//! destination, a plaintext payload and a handful of options, picks one of
//! five delivery paths, and produces the outbound `<message>` stanza.
//!
//! Grounded on the teacher's `messaging::MessageBuilder` for stanza
//! attribute/child assembly and on `client.rs`'s send-path dispatch by
//! destination server, rebuilt around the injected [`SignalRepository`],
//! [`DeviceDirectory`], [`SessionAsserter`] and [`EncryptionFanout`]
//! components spec.md §4.8 composes.

use crate::binary::node::Node;
use crate::config::{CachedGroupMetadata, OwnEvent};
use crate::devices::DeviceDirectory;
use crate::error::{Error, Result};
use crate::fanout::{EncryptionFanout, FanoutContext};
use crate::jid::{Jid, ServerKind, HOSTED_DEVICE};
use crate::lid::LidMappingStore;
use crate::retry::MessageRetryCache;
use crate::session_assert::SessionAsserter;
use crate::signal::address::SignalAddress;
use crate::signal::repository::SignalRepository;
use crate::util::crypto::sha256;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Sink an [`OwnEvent`] is handed to once a non-newsletter send succeeds and
/// `emit_own_events` is set.
pub type OwnEventSink = dyn Fn(OwnEvent) + Send + Sync;

/// Group participant list plus the identity servers expect senders to use,
/// as loaded from cache or fetched live.
#[derive(Debug, Clone)]
pub struct GroupMetadata {
    pub participants: Vec<Jid>,
    pub addressing_mode: AddressingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    Lid,
    Pn,
}

impl std::fmt::Display for AddressingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressingMode::Lid => write!(f, "lid"),
            AddressingMode::Pn => write!(f, "pn"),
        }
    }
}

/// `cachedGroupMetadata` consulted first, falling back to this live fetch.
#[async_trait]
pub trait GroupMetadataFetcher: Send + Sync {
    async fn fetch_group_metadata(&self, group_id: &str) -> Result<GroupMetadata>;
}

/// The kind of content being sent, used only to derive the stanza `type`
/// attribute. First match wins: poll, then event, then any non-empty media
/// subtype, else text.
pub enum MessageKind {
    Poll,
    Event,
    Media(&'static str),
    Text,
}

impl MessageKind {
    fn type_attr(&self) -> &'static str {
        match self {
            MessageKind::Poll => "poll",
            MessageKind::Event => "event",
            MessageKind::Media(_) => "media",
            MessageKind::Text => "text",
        }
    }

    fn mediatype(&self) -> Option<&'static str> {
        match self {
            MessageKind::Media(subtype) if !subtype.is_empty() => Some(subtype),
            _ => None,
        }
    }
}

/// A single retry target: `participant` present on the options means this
/// send is a retry-resend rather than a fresh fan-out.
#[derive(Debug, Clone)]
pub struct RetryParticipant {
    pub jid: Jid,
    pub count: u32,
}

#[derive(Default)]
pub struct RelayOptions {
    pub participant: Option<RetryParticipant>,
    /// `category=peer`: single-recipient, no `<participants>` wrapper.
    pub peer_data_operation: bool,
    /// Pre-wrapped `deviceSentMessage` bytes, substituted for the sender's
    /// own other devices. Building the wrapper itself is out of scope here;
    /// callers that need the substitution supply the encoded bytes.
    pub dsm_payload: Option<Vec<u8>>,
    pub message_id: Option<String>,
    pub edit: bool,
    pub decrypt_fail: bool,
    pub use_cached_group_metadata: bool,
    pub extra_nodes: Vec<Node>,
}

/// Identity context for a single relay call: which of our own JIDs match
/// which server, and which device we're sending from.
pub struct RelayContext<'a> {
    pub own_pn: Option<&'a Jid>,
    pub own_lid: Option<&'a Jid>,
    pub own_exact_device: u16,
}

impl<'a> RelayContext<'a> {
    fn require_own_pn(&self) -> Result<&'a Jid> {
        self.own_pn.ok_or(Error::AuthenticationMissing)
    }

    fn identity_for_server(&self, server: ServerKind) -> Result<&'a Jid> {
        if server.is_lid() {
            self.own_lid.ok_or(Error::AuthenticationMissing)
        } else {
            self.require_own_pn()
        }
    }

    fn fanout_context(&self) -> FanoutContext<'_> {
        FanoutContext {
            own_pn_user: self.own_pn.map(|j| j.user.as_str()).unwrap_or(""),
            own_lid_user: self.own_lid.map(|j| j.user.as_str()).unwrap_or(""),
            own_exact_device: self.own_exact_device,
        }
    }

    fn is_own_user(&self, user: &str) -> bool {
        self.own_pn.is_some_and(|j| j.user == user) || self.own_lid.is_some_and(|j| j.user == user)
    }
}

fn status_broadcast_jid() -> Jid {
    Jid::new("status", ServerKind::Broadcast)
}

fn generate_message_id() -> String {
    Uuid::new_v4().simple().to_string().to_uppercase()
}

/// v2 participant hash: `"2:" + base64(sha256(sorted, '\0'-joined jids)[..6])`.
fn compute_phash(recipients: &[Jid]) -> String {
    let mut sorted: Vec<String> = recipients.iter().map(|j| j.to_string()).collect();
    sorted.sort();
    let joined = sorted.join("\0");
    let digest = sha256(joined.as_bytes());
    format!("2:{}", STANDARD.encode(&digest[..6]))
}

fn base_attrs(message_id: &str, kind: &MessageKind) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    attrs.insert("id".to_string(), message_id.to_string());
    attrs.insert("type".to_string(), kind.type_attr().to_string());
    if let Some(mediatype) = kind.mediatype() {
        attrs.insert("mediatype".to_string(), mediatype.to_string());
    }
    attrs
}

fn enc_node(enc_type: &'static str, ciphertext: Vec<u8>, count: Option<u32>) -> Node {
    let mut node = Node::new("enc".to_string())
        .attr("v".to_string(), "2".to_string())
        .attr("type".to_string(), enc_type.to_string());
    if let Some(count) = count {
        node = node.attr("count".to_string(), count.to_string());
    }
    node.with_binary(ciphertext)
}

fn device_identity_node() -> Node {
    Node::new("device-identity".to_string())
}

fn tctoken_node(bytes: Vec<u8>) -> Node {
    Node::new("tctoken".to_string()).with_binary(bytes)
}

/// The C8 relay pipeline. Stateless across calls except for the components
/// it wraps; safe to share behind an `Arc`.
pub struct RelayPipeline {
    repository: Arc<SignalRepository>,
    devices: Arc<DeviceDirectory>,
    fanout: Arc<EncryptionFanout>,
    asserter: Arc<SessionAsserter>,
    mapping: Arc<LidMappingStore>,
    group_metadata: Box<dyn GroupMetadataFetcher>,
    retry_cache: Option<Arc<MessageRetryCache>>,
    cached_group_metadata: Option<Box<CachedGroupMetadata>>,
    emit_own_events: bool,
    own_events: Option<Box<OwnEventSink>>,
}

impl RelayPipeline {
    pub fn new(
        repository: Arc<SignalRepository>,
        devices: Arc<DeviceDirectory>,
        fanout: Arc<EncryptionFanout>,
        asserter: Arc<SessionAsserter>,
        mapping: Arc<LidMappingStore>,
        group_metadata: Box<dyn GroupMetadataFetcher>,
        retry_cache: Option<Arc<MessageRetryCache>>,
    ) -> Self {
        Self {
            repository,
            devices,
            fanout,
            asserter,
            mapping,
            group_metadata,
            retry_cache,
            cached_group_metadata: None,
            emit_own_events: false,
            own_events: None,
        }
    }

    /// Wires `cachedGroupMetadata`, consulted by the group path before
    /// falling back to a live fetch when `use_cached_group_metadata` is set.
    pub fn with_cached_group_metadata(mut self, cached: Box<CachedGroupMetadata>) -> Self {
        self.cached_group_metadata = Some(cached);
        self
    }

    /// Wires `emitOwnEvents`: when `enabled`, a successful non-newsletter
    /// send is handed to `sink` as an [`OwnEvent`] append.
    pub fn with_own_events(mut self, enabled: bool, sink: Box<OwnEventSink>) -> Self {
        self.emit_own_events = enabled;
        self.own_events = Some(sink);
        self
    }

    pub async fn relay_message(
        &self,
        jid: &Jid,
        plaintext: &[u8],
        kind: MessageKind,
        context: &RelayContext<'_>,
        options: RelayOptions,
    ) -> Result<Node> {
        let message_id = options.message_id.clone().unwrap_or_else(generate_message_id);

        if jid.is_newsletter() {
            return Ok(self.relay_newsletter(jid, &message_id, plaintext, &kind));
        }

        if let Some(participant) = options.participant.clone() {
            return self.relay_retry_resend(jid, &message_id, plaintext, &kind, context, &participant, &options).await;
        }

        if options.peer_data_operation {
            return self.relay_peer_data_operation(jid, &message_id, plaintext, &kind, context).await;
        }

        let is_broadcast_target = jid.is_group() || *jid == status_broadcast_jid();
        let stanza = if is_broadcast_target {
            self.relay_group_or_broadcast(jid, &message_id, plaintext, &kind, context, &options).await?
        } else {
            self.relay_direct(jid, &message_id, plaintext, &kind, context, &options).await?
        };

        if let Some(cache) = &self.retry_cache {
            cache.record(&jid.to_string(), &message_id, plaintext.to_vec()).await;
        }

        if self.emit_own_events {
            if let Some(sink) = &self.own_events {
                sink(OwnEvent { message_id: message_id.clone(), to: jid.to_string(), stanza: stanza.clone() });
            }
        }

        Ok(stanza)
    }

    fn relay_newsletter(&self, jid: &Jid, message_id: &str, plaintext: &[u8], kind: &MessageKind) -> Node {
        let mut attrs = base_attrs(message_id, kind);
        attrs.insert("to".to_string(), jid.to_string());
        let plaintext_node = Node::new("plaintext".to_string()).with_binary(plaintext.to_vec());
        Node::with_attrs("message".to_string(), attrs).with_children(vec![plaintext_node])
    }

    async fn relay_retry_resend(
        &self,
        jid: &Jid,
        message_id: &str,
        plaintext: &[u8],
        kind: &MessageKind,
        context: &RelayContext<'_>,
        participant: &RetryParticipant,
        options: &RelayOptions,
    ) -> Result<Node> {
        let wire_target = resolve_retry_target(&self.mapping, &participant.jid).await?;
        let is_own_target = context.is_own_user(&wire_target.user);
        let payload: &[u8] = if is_own_target {
            options.dsm_payload.as_deref().unwrap_or(plaintext)
        } else {
            plaintext
        };

        let encrypted = self.repository.encrypt_message(&wire_target, payload).await?;

        let mut attrs = base_attrs(message_id, kind);
        if jid.is_group() {
            attrs.insert("to".to_string(), jid.to_string());
            attrs.insert("participant".to_string(), wire_target.to_string());
        } else {
            attrs.insert("to".to_string(), wire_target.to_string());
            attrs.insert("device_fanout".to_string(), "false".to_string());
            if is_own_target {
                attrs.insert("recipient".to_string(), jid.to_string());
            }
        }

        let mut children = vec![enc_node(encrypted.message_type, encrypted.ciphertext, Some(participant.count))];
        if encrypted.message_type == "pkmsg" {
            children.push(device_identity_node());
        }
        children.extend(options.extra_nodes.iter().cloned());

        Ok(Node::with_attrs("message".to_string(), attrs).with_children(children))
    }

    async fn relay_peer_data_operation(
        &self,
        jid: &Jid,
        message_id: &str,
        plaintext: &[u8],
        kind: &MessageKind,
        context: &RelayContext<'_>,
    ) -> Result<Node> {
        context.require_own_pn()?;
        self.asserter.assert_sessions(std::slice::from_ref(jid), false).await?;
        let encrypted = self.repository.encrypt_message(jid, plaintext).await?;

        let mut attrs = base_attrs(message_id, kind);
        attrs.insert("to".to_string(), jid.to_string());
        attrs.insert("category".to_string(), "peer".to_string());

        let enc = enc_node(encrypted.message_type, encrypted.ciphertext, None);
        Ok(Node::with_attrs("message".to_string(), attrs).with_children(vec![enc]))
    }

    async fn relay_direct(
        &self,
        jid: &Jid,
        message_id: &str,
        plaintext: &[u8],
        kind: &MessageKind,
        context: &RelayContext<'_>,
        options: &RelayOptions,
    ) -> Result<Node> {
        let own_identity = context.identity_for_server(jid.server)?;

        let lookup = self.devices.get_devices(&[own_identity.clone(), jid.clone()], true, false).await?;
        let recipients: Vec<Jid> = lookup
            .jids
            .into_iter()
            .filter(|d| !(d.user == own_identity.user && d.device == context.own_exact_device))
            .collect();

        self.asserter.assert_sessions(&recipients, !lookup.newly_mapped_lids.is_empty()).await?;

        let fanout_context = context.fanout_context();
        let result = self
            .fanout
            .create_participant_nodes(&recipients, plaintext, &fanout_context, None, options.dsm_payload.as_deref())
            .await?;

        let mut attrs = base_attrs(message_id, kind);
        attrs.insert("to".to_string(), jid.to_string());
        if options.edit {
            attrs.insert("edit".to_string(), "true".to_string());
        }
        if options.decrypt_fail {
            attrs.insert("decrypt-fail".to_string(), "true".to_string());
        }
        if !recipients.is_empty() {
            attrs.insert("phash".to_string(), compute_phash(&recipients));
        }

        let mut children = vec![Node::new("participants".to_string()).with_children(result.nodes)];
        if result.should_include_device_identity {
            children.push(device_identity_node());
        }
        if let Some(token) = self.repository.get_tctoken(jid).await? {
            children.push(tctoken_node(token));
        }
        children.extend(options.extra_nodes.iter().cloned());

        Ok(Node::with_attrs("message".to_string(), attrs).with_children(children))
    }

    async fn relay_group_or_broadcast(
        &self,
        jid: &Jid,
        message_id: &str,
        plaintext: &[u8],
        kind: &MessageKind,
        context: &RelayContext<'_>,
        options: &RelayOptions,
    ) -> Result<Node> {
        let cached = if options.use_cached_group_metadata {
            self.cached_group_metadata.as_ref().and_then(|cached| cached(&jid.user))
        } else {
            None
        };
        let metadata = match cached {
            Some(metadata) => metadata,
            None => self.group_metadata.fetch_group_metadata(&jid.user).await?,
        };

        let own_identity = match metadata.addressing_mode {
            AddressingMode::Lid => context.own_lid.ok_or(Error::AuthenticationMissing)?,
            AddressingMode::Pn => context.require_own_pn()?,
        };
        let sender_jid = Jid::with_device(&own_identity.user, context.own_exact_device, own_identity.server)?;
        let sender_address = SignalAddress::from_jid(&sender_jid)?;

        let group_result = self.repository.encrypt_group_message(&jid.user, &sender_address, plaintext).await?;

        let device_lookup = self.devices.get_devices(&metadata.participants, true, false).await?;
        let distributable: Vec<Jid> = device_lookup
            .jids
            .into_iter()
            .filter(|d| d.device != HOSTED_DEVICE && !d.is_hosted())
            .collect();

        let device_keys: Vec<String> = distributable.iter().map(|d| d.to_string()).collect();
        let missing_keys = self.repository.sender_key_memory_missing(&jid.user, &device_keys).await?;
        let missing_devices: Vec<Jid> =
            distributable.into_iter().filter(|d| missing_keys.contains(&d.to_string())).collect();

        let mut participant_nodes = Vec::new();
        let mut should_include_device_identity = false;
        if !missing_devices.is_empty() {
            self.asserter.assert_sessions(&missing_devices, false).await?;
            let fanout_context = context.fanout_context();
            let result = self
                .fanout
                .create_participant_nodes(
                    &missing_devices,
                    &group_result.sender_key_distribution_message,
                    &fanout_context,
                    None,
                    None,
                )
                .await?;
            should_include_device_identity = result.should_include_device_identity;
            participant_nodes = result.nodes;
            self.repository.mark_sender_key_memory(&jid.user, &missing_keys).await?;
        }

        let mut attrs = base_attrs(message_id, kind);
        attrs.insert("to".to_string(), jid.to_string());
        attrs.insert("addressing_mode".to_string(), metadata.addressing_mode.to_string());

        let mut children = vec![enc_node("skmsg", group_result.ciphertext, None)];
        if !participant_nodes.is_empty() {
            children.push(Node::new("participants".to_string()).with_children(participant_nodes));
        }
        if should_include_device_identity {
            children.push(device_identity_node());
        }
        children.extend(options.extra_nodes.iter().cloned());

        Ok(Node::with_attrs("message".to_string(), attrs).with_children(children))
    }
}

/// Builds a `<receipt id type [t] to|recipient [participant]><list>...
/// </list></receipt>` stanza. `ids[0]` becomes the `id` attribute; any
/// further ids become `<list><item id=.../></list>` entries for batched
/// acks. `receipt_type` is omitted for a plain delivery receipt. Read
/// receipts pass a `timestamp`; direct-chat sender receipts pass the
/// original sender as `recipient` and the sender's device as `to`.
pub fn build_receipt(
    ids: &[String],
    receipt_type: Option<&str>,
    timestamp: Option<u64>,
    to: &Jid,
    recipient: Option<&Jid>,
    participant: Option<&Jid>,
) -> Node {
    let mut attrs = HashMap::new();
    attrs.insert("id".to_string(), ids.first().cloned().unwrap_or_default());
    if let Some(receipt_type) = receipt_type {
        attrs.insert("type".to_string(), receipt_type.to_string());
    }
    if let Some(timestamp) = timestamp {
        attrs.insert("t".to_string(), timestamp.to_string());
    }
    attrs.insert("to".to_string(), to.to_string());
    if let Some(recipient) = recipient {
        attrs.insert("recipient".to_string(), recipient.to_string());
    }
    if let Some(participant) = participant {
        attrs.insert("participant".to_string(), participant.to_string());
    }

    let items: Vec<Node> = ids
        .iter()
        .skip(1)
        .map(|id| Node::new("item".to_string()).attr("id".to_string(), id.clone()))
        .collect();
    let list = Node::new("list".to_string()).with_children(items);
    Node::with_attrs("receipt".to_string(), attrs).with_children(vec![list])
}

/// Resolves a retry target's wire JID through the PN/LID mapping before a
/// retry-resend, per spec.md §4.8 ("route addressing per the rules below").
pub async fn resolve_retry_target(mapping: &LidMappingStore, target: &Jid) -> Result<Jid> {
    if !target.is_user() {
        return Ok(target.clone());
    }
    match mapping.lid_for_pn(target).await? {
        Some(lid) => Ok(lid),
        None => Ok(target.clone()),
    }
}
