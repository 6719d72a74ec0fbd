use crate::error::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use ring::digest;
use sha2::Sha256;

/// AES-GCM encryption utility
pub struct AesGcm {
    cipher: Aes256Gcm,
}

impl AesGcm {
    /// Create a new AES-GCM cipher with the given key
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 32 {
            return Err(Error::Crypto("AES key must be 32 bytes".to_string()));
        }
        
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::Crypto(format!("Failed to create AES cipher: {}", e)))?;
        
        Ok(Self { cipher })
    }
    
    /// Encrypt data with the given nonce
    pub fn encrypt(&self, nonce: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != 12 {
            return Err(Error::Crypto("Nonce must be 12 bytes".to_string()));
        }
        
        let nonce = Nonce::from_slice(nonce);
        self.cipher
            .encrypt(nonce, data)
            .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))
    }
    
    /// Decrypt data with the given nonce
    pub fn decrypt(&self, nonce: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != 12 {
            return Err(Error::Crypto("Nonce must be 12 bytes".to_string()));
        }
        
        let nonce = Nonce::from_slice(nonce);
        self.cipher
            .decrypt(nonce, data)
            .map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))
    }
}

/// HKDF key derivation
pub fn hkdf_expand(key: &[u8], info: &[u8], length: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(None, key);
    let mut output = vec![0u8; length];
    hk.expand(info, &mut output)
        .map_err(|e| Error::Crypto(format!("HKDF expansion failed: {}", e)))?;
    Ok(output)
}

/// SHA-256 hash
pub fn sha256(data: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA256, data).as_ref().to_vec()
}

/// Generate random bytes
pub fn random_bytes(length: usize) -> Vec<u8> {
    use ring::rand::{SecureRandom, SystemRandom};
    
    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; length];
    rng.fill(&mut bytes).unwrap();
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_sha256() {
        let input = b"hello world";
        let hash = sha256(input);
        
        // SHA256 of "hello world" should be consistent
        assert_eq!(hash.len(), 32);
        assert_ne!(hash, [0u8; 32]); // Should not be all zeros
    }
    
    #[test]
    fn test_hkdf_expand() {
        let ikm = b"input key material";
        let salt = b"salt";
        let length = 32;
        
        let result = hkdf_expand(ikm, salt, length).unwrap();
        
        assert_eq!(result.len(), length);
        assert_ne!(result, vec![0u8; length]); // Should not be all zeros
    }
    
    #[test]
    fn test_aes_gcm_encrypt_decrypt() {
        let key = [1u8; 32];
        let nonce = [2u8; 12];
        let plaintext = b"secret message";
        
        let aes = AesGcm::new(&key).unwrap();
        
        // Encrypt
        let ciphertext = aes.encrypt(&nonce, plaintext).unwrap();
        assert_ne!(ciphertext, plaintext);
        assert!(ciphertext.len() > plaintext.len()); // Should include auth tag
        
        // Decrypt
        let decrypted = aes.decrypt(&nonce, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }
    
    #[test]
    fn test_aes_gcm_wrong_key() {
        let key1 = [1u8; 32];
        let key2 = [2u8; 32];
        let nonce = [3u8; 12];
        let plaintext = b"secret message";
        
        let aes1 = AesGcm::new(&key1).unwrap();
        let aes2 = AesGcm::new(&key2).unwrap();
        
        let ciphertext = aes1.encrypt(&nonce, plaintext).unwrap();
        
        // Decryption with wrong key should fail
        assert!(aes2.decrypt(&nonce, &ciphertext).is_err());
    }
    
    #[test]
    fn test_generate_key() {
        let key1 = random_bytes(32);
        let key2 = random_bytes(32);
        
        assert_eq!(key1.len(), 32);
        assert_eq!(key2.len(), 32);
        assert_ne!(key1, key2); // Should be different random keys
    }
}