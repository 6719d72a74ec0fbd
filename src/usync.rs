//! USync: the device-discovery and PN/LID-resolution protocol surface the
//! device directory (C6) calls into. The actual wire query (an `<iq
//! xmlns="usync">` roundtrip) lives on the transport; this module only
//! defines the request/response shapes so [`crate::devices::DeviceDirectory`]
//! stays decoupled from the socket.
//!
//! Grounded on the teacher's `socket`/`binary::node` IQ plumbing, generalized
//! to an injected trait the way [`crate::lid::PnToLidResolver`] decouples
//! mapping backfill from the transport.

use crate::error::Result;
use async_trait::async_trait;

/// One user to resolve devices for. `as_lid` records whether the caller
/// originally addressed this user by LID (it changes which server the
/// returned devices are encoded under).
#[derive(Debug, Clone)]
pub struct UsyncRequest {
    pub user: String,
    pub as_lid: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct UsyncDeviceEntry {
    pub device: u16,
}

/// A single user's USync result: its device list, plus the PN/LID
/// counterpart the server chose to disclose, if any.
#[derive(Debug, Clone)]
pub struct UsyncUserResult {
    pub user: String,
    pub lid: Option<String>,
    pub devices: Vec<UsyncDeviceEntry>,
}

/// The device-protocol + LID-protocol USync query: given a set of user-level
/// requests, returns per-user device lists and any disclosed LID mapping.
#[async_trait]
pub trait UsyncTransport: Send + Sync {
    async fn query_devices(&self, requests: &[UsyncRequest]) -> Result<Vec<UsyncUserResult>>;
}

/// A transport that resolves to an empty device list for every request —
/// useful as a default before a real socket is wired up, and in tests.
pub struct NoopUsyncTransport;

#[async_trait]
impl UsyncTransport for NoopUsyncTransport {
    async fn query_devices(&self, requests: &[UsyncRequest]) -> Result<Vec<UsyncUserResult>> {
        Ok(requests
            .iter()
            .map(|r| UsyncUserResult { user: r.user.clone(), lid: None, devices: Vec::new() })
            .collect())
    }
}
