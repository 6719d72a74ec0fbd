//! Addressing: the JID (Jabber-style ID) that names a user, group, newsletter
//! or broadcast list, qualified by device and by which of the four servers
//! it lives on.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The server a JID's `user` part is scoped to.
///
/// Replaces a free-form `server: String` so the "device 99 implies a hosted
/// server" invariant (see [`Jid::validate`]) is checkable without string
/// comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServerKind {
    /// Regular phone-number-addressed user, `s.whatsapp.net`.
    User,
    /// Privacy-preserving identifier, `lid`.
    Lid,
    /// Hosted (business-API) phone number, `hosted`.
    Hosted,
    /// Hosted number addressed by LID, `hosted.lid`.
    HostedLid,
    /// Group, `g.us`.
    Group,
    /// Newsletter/channel, `newsletter`.
    Newsletter,
    /// Status broadcast, `broadcast`.
    Broadcast,
}

impl ServerKind {
    fn domain(self) -> &'static str {
        match self {
            ServerKind::User => "s.whatsapp.net",
            ServerKind::Lid => "lid",
            ServerKind::Hosted => "hosted",
            ServerKind::HostedLid => "hosted.lid",
            ServerKind::Group => "g.us",
            ServerKind::Newsletter => "newsletter",
            ServerKind::Broadcast => "broadcast",
        }
    }

    fn from_domain(domain: &str) -> Result<Self> {
        match domain {
            "s.whatsapp.net" | "c.us" => Ok(ServerKind::User),
            "lid" => Ok(ServerKind::Lid),
            "hosted" => Ok(ServerKind::Hosted),
            "hosted.lid" => Ok(ServerKind::HostedLid),
            "g.us" => Ok(ServerKind::Group),
            "newsletter" => Ok(ServerKind::Newsletter),
            "broadcast" => Ok(ServerKind::Broadcast),
            other => Err(Error::InvalidJid(format!("unrecognized server domain: {other}"))),
        }
    }

    /// Whether this server is one of the two LID-addressed servers.
    pub fn is_lid(self) -> bool {
        matches!(self, ServerKind::Lid | ServerKind::HostedLid)
    }

    /// Whether this server is one of the two hosted (business-API) servers.
    pub fn is_hosted(self) -> bool {
        matches!(self, ServerKind::Hosted | ServerKind::HostedLid)
    }
}

/// A fully qualified WhatsApp address: `user[:device]@server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Jid {
    pub user: String,
    pub device: u16,
    pub server: ServerKind,
}

/// Device id reserved for hosted (business-API) numbers; only valid on
/// `Hosted`/`HostedLid` servers.
pub const HOSTED_DEVICE: u16 = 99;

impl Jid {
    /// Build a device-0 (no `:device` suffix) JID on the given server.
    pub fn new(user: impl Into<String>, server: ServerKind) -> Self {
        Self { user: user.into(), device: 0, server }
    }

    /// Build a JID with an explicit device, validating the hosted invariant.
    pub fn with_device(user: impl Into<String>, device: u16, server: ServerKind) -> Result<Self> {
        let jid = Self { user: user.into(), device, server };
        jid.validate()?;
        Ok(jid)
    }

    pub fn new_group(group_id: impl Into<String>) -> Self {
        Self::new(group_id, ServerKind::Group)
    }

    /// Device 99 is reserved for hosted numbers; any other device on a
    /// hosted server, or device 99 on a non-hosted server, is malformed.
    pub fn validate(&self) -> Result<()> {
        if self.device == HOSTED_DEVICE && !self.server.is_hosted() {
            return Err(Error::InvalidJid(format!(
                "device 99 requires a hosted server, got {:?}",
                self.server
            )));
        }
        if self.server.is_hosted() && self.device != HOSTED_DEVICE && self.device != 0 {
            return Err(Error::InvalidJid(format!(
                "hosted server {:?} requires device 99, got {}",
                self.server, self.device
            )));
        }
        Ok(())
    }

    pub fn is_user(&self) -> bool {
        matches!(self.server, ServerKind::User | ServerKind::Hosted)
    }

    pub fn is_lid(&self) -> bool {
        self.server.is_lid()
    }

    pub fn is_group(&self) -> bool {
        self.server == ServerKind::Group
    }

    pub fn is_newsletter(&self) -> bool {
        self.server == ServerKind::Newsletter
    }

    pub fn is_broadcast(&self) -> bool {
        self.server == ServerKind::Broadcast
    }

    pub fn is_hosted(&self) -> bool {
        self.server.is_hosted()
    }

    /// Drop the device suffix, e.g. for identity-key lookups that are keyed
    /// per-user rather than per-device.
    pub fn to_non_ad(&self) -> Self {
        Self { user: self.user.clone(), device: 0, server: self.server }
    }

    /// Re-address this JID's user onto a LID identity, keeping the device
    /// and choosing the LID server that mirrors this JID's hosted-ness.
    pub fn to_lid_address(&self, lid_user: impl Into<String>) -> Self {
        let server = if self.server.is_hosted() { ServerKind::HostedLid } else { ServerKind::Lid };
        Self { user: lid_user.into(), device: self.device, server }
    }

    /// Re-address a LID JID back onto its phone-number identity.
    pub fn to_pn_address(&self, pn_user: impl Into<String>) -> Self {
        let server = if self.server.is_hosted() { ServerKind::Hosted } else { ServerKind::User };
        Self { user: pn_user.into(), device: self.device, server }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.device != 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server.domain())
        } else {
            write!(f, "{}@{}", self.user, self.server.domain())
        }
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (user_part, domain) = s
            .split_once('@')
            .ok_or_else(|| Error::InvalidJid(format!("missing '@' in JID: {s}")))?;
        let server = ServerKind::from_domain(domain)?;

        let jid = match user_part.split_once(':') {
            Some((user, device_str)) => {
                let device = device_str
                    .parse()
                    .map_err(|_| Error::InvalidJid(format!("invalid device in JID: {s}")))?;
                Jid { user: user.to_string(), device, server }
            }
            None => Jid { user: user_part.to_string(), device: 0, server },
        };
        jid.validate()?;
        Ok(jid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_user_jid() {
        let s = "1234567890@s.whatsapp.net";
        let jid: Jid = s.parse().unwrap();
        assert_eq!(jid.user, "1234567890");
        assert_eq!(jid.server, ServerKind::User);
        assert_eq!(jid.to_string(), s);
    }

    #[test]
    fn round_trips_device_suffixed_jid() {
        let s = "1234567890:5@s.whatsapp.net";
        let jid: Jid = s.parse().unwrap();
        assert_eq!(jid.device, 5);
        assert_eq!(jid.to_string(), s);
    }

    #[test]
    fn group_jid_helpers() {
        let jid = Jid::new_group("1234-5678");
        assert!(jid.is_group());
        assert_eq!(jid.to_string(), "1234-5678@g.us");
    }

    #[test]
    fn device_99_requires_hosted_server() {
        assert!(Jid::with_device("1", 99, ServerKind::User).is_err());
        assert!(Jid::with_device("1", 99, ServerKind::Hosted).is_ok());
        assert!("1:99@hosted".parse::<Jid>().is_ok());
        assert!("1:99@s.whatsapp.net".parse::<Jid>().is_err());
    }

    #[test]
    fn hosted_server_rejects_non_99_device() {
        assert!(Jid::with_device("1", 3, ServerKind::Hosted).is_err());
    }

    #[test]
    fn lid_address_mirrors_hosted_ness() {
        let pn = Jid::with_device("555", 99, ServerKind::Hosted).unwrap();
        let lid = pn.to_lid_address("abc123");
        assert_eq!(lid.server, ServerKind::HostedLid);
        assert_eq!(lid.device, 99);

        let pn = Jid::new("555", ServerKind::User);
        let lid = pn.to_lid_address("abc123");
        assert_eq!(lid.server, ServerKind::Lid);
    }

    #[test]
    fn to_non_ad_drops_device() {
        let jid = Jid::with_device("1", 2, ServerKind::User).unwrap();
        assert_eq!(jid.to_non_ad().to_string(), "1@s.whatsapp.net");
    }

    #[test]
    fn rejects_jid_without_at() {
        assert!("no-at-sign".parse::<Jid>().is_err());
    }
}
