//! Identity keys. Trust is enforced elsewhere — per the storage binding's
//! contract, `is_trusted_identity` always answers `true` — so unlike the
//! teacher's `TrustLevel`-bearing record, this module only tracks which
//! public key was last seen per address, for change detection.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKey {
    pub public_key: [u8; 32],
}

impl IdentityKey {
    pub fn new(public_key: [u8; 32]) -> Self {
        Self { public_key }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public_key
    }
}

impl From<&crate::util::keys::SigningKeyPair> for IdentityKey {
    fn from(keypair: &crate::util::keys::SigningKeyPair) -> Self {
        Self::new(keypair.public_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::keys::SigningKeyPair;

    #[test]
    fn identity_key_from_keypair_matches_public_bytes() {
        let keypair = SigningKeyPair::generate();
        let identity = IdentityKey::from(&keypair);
        assert_eq!(identity.public_bytes(), keypair.public_bytes());
    }
}
