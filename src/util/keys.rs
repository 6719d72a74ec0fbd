use crate::error::{Error, Result};
use ed25519_dalek::{SigningKey, VerifyingKey};
use curve25519_dalek::{constants, scalar::Scalar, montgomery::MontgomeryPoint};

/// Elliptic curve key pair for X25519
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ECKeyPair {
    pub private_key: [u8; 32],
    pub public_key: [u8; 32],
}

impl ECKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut rng = rand::thread_rng();
        let mut private_key = [0u8; 32];
        rng.fill_bytes(&mut private_key);
        
        // Clamp the private key for X25519
        private_key[0] &= 248;
        private_key[31] &= 127;
        private_key[31] |= 64;
        
        // Derive public key using curve25519-dalek
        let scalar = Scalar::from_bytes_mod_order(private_key);
        let public_point = &scalar * &constants::X25519_BASEPOINT;
        let public_key = public_point.to_bytes();
        
        Self {
            private_key,
            public_key,
        }
    }
    
    /// Create from private key bytes
    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(Error::Crypto("Private key must be 32 bytes".to_string()));
        }
        
        let mut private_key = [0u8; 32];
        private_key.copy_from_slice(bytes);
        
        // Clamp the private key for X25519
        private_key[0] &= 248;
        private_key[31] &= 127;
        private_key[31] |= 64;
        
        // Derive public key using curve25519-dalek
        let scalar = Scalar::from_bytes_mod_order(private_key);
        let public_point = &scalar * &constants::X25519_BASEPOINT;
        let public_key = public_point.to_bytes();
        
        Ok(Self {
            private_key,
            public_key,
        })
    }
    
    /// Get private key bytes
    pub fn private_bytes(&self) -> [u8; 32] {
        self.private_key
    }
    
    /// Get public key bytes
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public_key
    }
    
    /// Perform ECDH using curve25519-dalek
    pub fn ecdh(&self, other_public: &[u8; 32]) -> [u8; 32] {
        // Create scalar from our private key
        let our_scalar = Scalar::from_bytes_mod_order(self.private_key);
        
        // Create Montgomery point from other party's public key
        let other_point = MontgomeryPoint(*other_public);
        
        // Perform scalar multiplication (ECDH)
        let shared_point = &our_scalar * &other_point;
        
        shared_point.to_bytes()
    }
    
    /// Perform ECDH with raw bytes
    pub fn ecdh_bytes(&self, other_public_bytes: &[u8; 32]) -> Result<[u8; 32]> {
        Ok(self.ecdh(other_public_bytes))
    }
}

/// Ed25519 signing key pair
#[derive(Debug, Clone)]
pub struct SigningKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl SigningKeyPair {
    /// Generate a new random signing key pair
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut rng = rand::thread_rng();
        let mut secret_key_bytes = [0u8; 32];
        rng.fill_bytes(&mut secret_key_bytes);
        
        let signing_key = SigningKey::from_bytes(&secret_key_bytes);
        let verifying_key = signing_key.verifying_key();
        
        Self {
            signing_key,
            verifying_key,
        }
    }
    
    /// Create from private key bytes
    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(Error::Crypto("Signing key must be 32 bytes".to_string()));
        }
        
        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(bytes);
        
        let signing_key = SigningKey::from_bytes(&key_bytes);
        let verifying_key = signing_key.verifying_key();
        
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }
    
    /// Get private key bytes  
    pub fn private_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
    
    /// Get public key bytes
    pub fn public_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }
    
    /// Get access to the signing key
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
    
    /// Get access to the verifying key
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_ec_keypair_generation() {
        let keypair1 = ECKeyPair::generate();
        let keypair2 = ECKeyPair::generate();
        
        // Keys should be 32 bytes
        assert_eq!(keypair1.private_bytes().len(), 32);
        assert_eq!(keypair1.public_bytes().len(), 32);
        
        // Different generations should produce different keys
        assert_ne!(keypair1.private_bytes(), keypair2.private_bytes());
        assert_ne!(keypair1.public_bytes(), keypair2.public_bytes());
    }
    
    #[test]
    fn test_ec_keypair_from_private_bytes() {
        let private_key = [42u8; 32];
        let keypair = ECKeyPair::from_private_bytes(&private_key).unwrap();
        
        // The private key should be clamped for X25519
        let clamped_private = keypair.private_bytes();
        assert_eq!(clamped_private[0] & 7, 0); // Lower 3 bits cleared
        assert_eq!(clamped_private[31] & 128, 0); // Bit 255 cleared
        assert_eq!(clamped_private[31] & 64, 64); // Bit 254 set
    }
    
    #[test]
    fn test_ecdh_consistency() {
        let alice = ECKeyPair::generate();
        let bob = ECKeyPair::generate();
        
        // Perform ECDH from both sides
        let shared_alice = alice.ecdh(&bob.public_bytes());
        let shared_bob = bob.ecdh(&alice.public_bytes());
        
        // Shared secrets should be identical
        assert_eq!(shared_alice, shared_bob);
    }
    
    #[test]
    fn test_ecdh_different_keys() {
        let alice = ECKeyPair::generate();
        let bob = ECKeyPair::generate();
        let charlie = ECKeyPair::generate();
        
        let shared_alice_bob = alice.ecdh(&bob.public_bytes());
        let shared_alice_charlie = alice.ecdh(&charlie.public_bytes());
        
        // Different key exchanges should produce different results
        assert_ne!(shared_alice_bob, shared_alice_charlie);
    }
    
    #[test]
    fn test_signing_keypair_generation() {
        let keypair1 = SigningKeyPair::generate();
        let keypair2 = SigningKeyPair::generate();
        
        // Keys should be 32 bytes
        assert_eq!(keypair1.private_bytes().len(), 32);
        assert_eq!(keypair1.public_bytes().len(), 32);
        
        // Different generations should produce different keys
        assert_ne!(keypair1.private_bytes(), keypair2.private_bytes());
        assert_ne!(keypair1.public_bytes(), keypair2.public_bytes());
    }
    
    #[test]
    fn test_signing_keypair_from_private_bytes() {
        let private_key = [1u8; 32];
        let keypair = SigningKeyPair::from_private_bytes(&private_key).unwrap();
        
        assert_eq!(keypair.private_bytes(), private_key);
        assert_eq!(keypair.public_bytes().len(), 32);
    }
    
    #[test]
    fn test_invalid_private_key_length() {
        let invalid_key = [1u8; 16]; // Wrong length
        assert!(ECKeyPair::from_private_bytes(&invalid_key).is_err());
        assert!(SigningKeyPair::from_private_bytes(&invalid_key).is_err());
    }
}