//! The Signal protocol address: the key under which sessions and sender
//! keys are indexed, distinct from the wire JID because a LID and its PN
//! counterpart must index different session slots.

use crate::error::{Error, Result};
use crate::jid::{Jid, ServerKind};
use serde::{Deserialize, Serialize};

/// `user + "_" + domain-type` for non-regular identities, bare `user`
/// otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalAddress {
    pub user: String,
    pub device: u16,
}

fn domain_type(server: ServerKind) -> Result<Option<u8>> {
    match server {
        ServerKind::User | ServerKind::Hosted => Ok(None),
        ServerKind::Lid | ServerKind::HostedLid => Ok(Some(1)),
        other => Err(Error::InvalidJid(format!("{other:?} has no Signal address"))),
    }
}

impl SignalAddress {
    pub fn from_jid(jid: &Jid) -> Result<Self> {
        let user = match domain_type(jid.server)? {
            None => jid.user.clone(),
            Some(domain) => format!("{}_{domain}", jid.user),
        };
        Ok(Self { user, device: jid.device })
    }

    /// The key store row key: `user.device`.
    pub fn to_key(&self) -> String {
        format!("{}.{}", self.user, self.device)
    }
}

impl std::fmt::Display for SignalAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_user_address_has_no_suffix() {
        let jid = Jid::with_device("1555", 2, ServerKind::User).unwrap();
        let addr = SignalAddress::from_jid(&jid).unwrap();
        assert_eq!(addr.user, "1555");
        assert_eq!(addr.to_key(), "1555.2");
    }

    #[test]
    fn lid_address_gets_domain_suffix() {
        let jid = Jid::new("abc", ServerKind::Lid);
        let addr = SignalAddress::from_jid(&jid).unwrap();
        assert_eq!(addr.user, "abc_1");
        assert_eq!(addr.to_key(), "abc_1.0");
    }

    #[test]
    fn group_jid_has_no_signal_address() {
        let jid = Jid::new_group("1234-5678");
        assert!(SignalAddress::from_jid(&jid).is_err());
    }
}
