//! Signal protocol capability surface: wire message framing shared by the
//! pairwise (`session`) and group (`group`) ratchets, the storage binding
//! (C4) that adapts the key store to what the ratchets need, and the
//! repository (C5) that exposes the transactional operations the relay
//! pipeline calls.

pub mod address;
pub mod binding;
pub mod group;
pub mod identity;
pub mod prekey;
pub mod repository;
pub mod session;

pub use address::SignalAddress;
pub use binding::StorageBinding;
pub use group::*;
pub use identity::*;
pub use prekey::*;
pub use repository::{
    EncryptedMessage, GroupEncryptResult, MigrationResult, SessionValidation, SignalRepository,
};
pub use session::*;

/// Signal protocol version used by WhatsApp.
pub const SIGNAL_PROTOCOL_VERSION: u8 = 3;

pub const DJB_TYPE: u8 = 0x05;
pub const EC_TYPE: u8 = 0x05;

/// Wire message type. `PreKeyWhisperMessage` (3) must surface as `pkmsg` and
/// trigger `device-identity` inclusion upstream; anything else maps to `msg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalMessageType {
    WhisperMessage = 1,
    PreKeyWhisperMessage = 3,
    SenderKeyMessage = 7,
    SenderKeyDistributionMessage = 8,
}

#[derive(Debug, Clone)]
pub struct SignalMessage {
    pub message_type: SignalMessageType,
    pub serialized: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_values() {
        assert_eq!(SignalMessageType::WhisperMessage as u8, 1);
        assert_eq!(SignalMessageType::PreKeyWhisperMessage as u8, 3);
    }
}
