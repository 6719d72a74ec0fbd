//! Configuration surface (spec.md §6): the options a caller can set when
//! wiring up the relay, with the TTL defaults the other components already
//! bake into their constructors.
//!
//! Grounded on the teacher's `GroupManagerConfig`/`connection::manager`
//! config-struct-with-`Default` shape.

use crate::binary::node::Node;
use crate::fanout::PatchedMessage;
use crate::relay::{AddressingMode, GroupMetadata};
use std::time::Duration;

/// `userDevicesCache` TTL. [`crate::devices::DeviceDirectory`] already bakes
/// this in as `USER_DEVICES_CACHE_TTL`; kept here too so callers assembling
/// a [`RelayConfig`] can see the default without reading that module.
pub const USER_DEVICES_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
/// `lid-mapping` cache TTL, mirrored from [`crate::lid::LidMappingStore`].
pub const MAPPING_CACHE_TTL: Duration = Duration::from_secs(3 * 24 * 60 * 60);
/// Migrated-session cache TTL, mirrored from
/// [`crate::signal::repository::SignalRepository`].
pub const MIGRATED_SESSION_CACHE_TTL: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// `patchMessageBeforeSending`: a pre-send hook that may return per-recipient
/// patched messages instead of one shared payload.
pub type PatchMessageBeforeSending = dyn Fn(&[u8]) -> PatchedMessage + Send + Sync;

/// `cachedGroupMetadata`: caller-supplied lookup, consulted before falling
/// back to a live fetch. Returns `None` on a cache miss, never an error —
/// a failing cache is the caller's problem to surface, not the relay's.
pub type CachedGroupMetadata = dyn Fn(&str) -> Option<GroupMetadata> + Send + Sync;

/// The options a caller can set when constructing a relay. Every field has a
/// spec-mandated default; only `patch_message_before_sending` and
/// `cached_group_metadata` are absent by default since they're opt-in hooks.
pub struct RelayConfig {
    pub enable_recent_message_cache: bool,
    pub max_msg_retry_count: usize,
    pub emit_own_events: bool,
    pub link_preview_image_thumbnail_width: u32,
    pub generate_high_quality_link_preview: bool,
    pub patch_message_before_sending: Option<Box<PatchMessageBeforeSending>>,
    pub cached_group_metadata: Option<Box<CachedGroupMetadata>>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enable_recent_message_cache: true,
            max_msg_retry_count: 5,
            emit_own_events: false,
            link_preview_image_thumbnail_width: 192,
            generate_high_quality_link_preview: false,
            patch_message_before_sending: None,
            cached_group_metadata: None,
        }
    }
}

/// A locally emitted "own send" event, appended to the upsert stream when
/// `emit_own_events` is set and a send succeeds.
#[derive(Debug, Clone)]
pub struct OwnEvent {
    pub message_id: String,
    pub to: String,
    pub stanza: Node,
}
