//! Device directory (C6): resolves user-level JIDs to the full set of
//! device-qualified JIDs, backed by a 5-minute TTL cache and the key store's
//! `device-list` column, backfilling PN/LID mappings it learns along the way.
//!
//! Grounded on the teacher's device-session bookkeeping in
//! `auth::multidevice::MultiDeviceManager`, rebuilt around the USync query
//! shape and caching rules of spec.md §4.5.

use crate::cache::TtlCache;
use crate::error::Result;
use crate::jid::{Jid, ServerKind};
use crate::keystore::KeyStore;
use crate::lid::LidMappingStore;
use crate::usync::{UsyncRequest, UsyncTransport};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const USER_DEVICES_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Result of a directory lookup: the device-qualified JIDs, plus any user
/// whose LID mapping was learned for the first time during this call — a
/// signal to the caller (session asserter) that those sessions may need a
/// forced refresh.
pub struct DeviceLookupResult {
    pub jids: Vec<Jid>,
    pub newly_mapped_lids: Vec<String>,
}

pub struct DeviceDirectory {
    store: Arc<KeyStore>,
    mapping: Arc<LidMappingStore>,
    transport: Box<dyn UsyncTransport>,
    cache: TtlCache<String, Vec<u16>>,
}

impl DeviceDirectory {
    pub fn new(store: Arc<KeyStore>, mapping: Arc<LidMappingStore>, transport: Box<dyn UsyncTransport>) -> Self {
        Self { store, mapping, transport, cache: TtlCache::new(USER_DEVICES_CACHE_TTL) }
    }

    pub async fn get_devices(&self, jids: &[Jid], use_cache: bool, ignore_zero_devices: bool) -> Result<DeviceLookupResult> {
        let mut result = Vec::new();
        let mut user_level = Vec::new();
        for jid in jids {
            if jid.device != 0 {
                result.push(jid.clone());
            } else {
                user_level.push(jid.clone());
            }
        }

        let mut fetch_list = Vec::new();
        for jid in &user_level {
            if use_cache {
                if let Some(devices) = self.cache.get(&jid.user).await {
                    push_devices(&mut result, jid, &devices, ignore_zero_devices);
                    continue;
                }
            }
            fetch_list.push(jid.clone());
        }

        if fetch_list.is_empty() {
            return Ok(DeviceLookupResult { jids: result, newly_mapped_lids: Vec::new() });
        }

        let requested_as_lid: HashSet<String> =
            fetch_list.iter().filter(|j| j.is_lid()).map(|j| j.user.clone()).collect();
        let requests: Vec<UsyncRequest> =
            fetch_list.iter().map(|j| UsyncRequest { user: j.user.clone(), as_lid: j.is_lid() }).collect();
        let responses = self.transport.query_devices(&requests).await?;

        let mut newly_mapped_lids = Vec::new();
        let mut pairs = Vec::new();
        for response in &responses {
            if let Some(lid) = &response.lid {
                let pn_probe = Jid::new(response.user.clone(), ServerKind::User);
                if self.mapping.lid_for_pn(&pn_probe).await?.is_none() {
                    newly_mapped_lids.push(lid.clone());
                }
                pairs.push((
                    Jid::new(response.user.clone(), ServerKind::User),
                    Jid::new(lid.clone(), ServerKind::Lid),
                ));
            }
        }
        if !pairs.is_empty() {
            if let Err(e) = self.mapping.store(&pairs).await {
                warn!(error = %e, "failed to persist LID mappings discovered via USync");
            }
        }

        let mut by_user = HashMap::new();
        for response in &responses {
            let server = if requested_as_lid.contains(&response.user) {
                ServerKind::Lid
            } else {
                fetch_list.iter().find(|j| j.user == response.user).map(|j| j.server).unwrap_or(ServerKind::User)
            };
            let devices: Vec<u16> = response.devices.iter().map(|d| d.device).collect();
            let jid = Jid::new(response.user.clone(), server);
            push_devices(&mut result, &jid, &devices, ignore_zero_devices);
            by_user.insert(response.user.clone(), devices.clone());
            self.cache.insert(response.user.clone(), devices).await;
        }

        let mut writes = HashMap::new();
        for (user, devices) in &by_user {
            match serde_json::to_vec(devices) {
                Ok(bytes) => {
                    writes.insert(user.clone(), Some(bytes));
                }
                Err(e) => warn!(error = %e, user, "failed to encode device list"),
            }
        }
        if !writes.is_empty() {
            if let Err(e) = self.store.set("device-list", writes).await {
                warn!(error = %e, "failed to persist device list");
            }
        }

        Ok(DeviceLookupResult { jids: result, newly_mapped_lids })
    }
}

fn push_devices(result: &mut Vec<Jid>, jid: &Jid, devices: &[u16], ignore_zero_devices: bool) {
    let mut devices = devices.to_vec();
    if !ignore_zero_devices && !devices.contains(&0) {
        devices.push(0);
    }
    for device in devices {
        if let Ok(qualified) = Jid::with_device(&jid.user, device, jid.server) {
            result.push(qualified);
        }
    }
}
