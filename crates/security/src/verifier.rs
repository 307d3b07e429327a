use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use farm_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

/// Checks ed25519 signatures against one trusted public key.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    public_key: VerifyingKey,
}

impl SignatureVerifier {
    pub fn new(public_key: VerifyingKey) -> Self {
        Self { public_key }
    }

    pub fn from_hex(hex: &str) -> Result<Self> {
        let bytes = hex::decode(hex.trim())
            .map_err(|e| Error::Security(format!("Invalid hex: {}", e)))?;
        let key_bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Security("Public key must be 32 bytes".to_string()))?;

        let public_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| Error::Security(format!("Invalid public key: {}", e)))?;

        Ok(Self { public_key })
    }

    /// Accepts either a bare 32-byte key or a SubjectPublicKeyInfo body, in
    /// which case the raw key is the trailing 32 bytes.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let body: String = pem
            .lines()
            .filter(|line| !line.starts_with("-----"))
            .map(str::trim)
            .collect();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(body.as_bytes())
            .map_err(|e| Error::Security(format!("Failed to decode PEM: {}", e)))?;
        if decoded.len() < 32 {
            return Err(Error::Security(format!(
                "PEM decoded data too short: {} bytes (expected >= 32)",
                decoded.len()
            )));
        }
        let key_bytes: [u8; 32] = decoded[decoded.len() - 32..]
            .try_into()
            .map_err(|_| Error::Security("Failed to extract key bytes from PEM".to_string()))?;

        let public_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| Error::Security(format!("Invalid public key: {}", e)))?;
        Ok(Self { public_key })
    }

    /// Hex SHA-256 of the raw public key. Two artifacts signed by the same
    /// key share this fingerprint.
    pub fn fingerprint(&self) -> String {
        sha256_hex(self.public_key.as_bytes())
    }

    /// Signature may be hex (128 chars) or base64.
    pub fn verify(&self, message: &[u8], signature: &str) -> Result<()> {
        let signature = signature.trim();
        let sig_bytes = if signature.len() == 128 && signature.chars().all(|c| c.is_ascii_hexdigit())
        {
            hex::decode(signature)
                .map_err(|e| Error::Security(format!("Invalid signature hex: {}", e)))?
        } else {
            base64::engine::general_purpose::STANDARD
                .decode(signature)
                .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(signature))
                .map_err(|e| Error::Security(format!("Invalid signature encoding: {}", e)))?
        };

        let sig_array: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| Error::Security("Signature must be 64 bytes".to_string()))?;
        let signature = Signature::from_bytes(&sig_array);

        self.public_key
            .verify(message, &signature)
            .map_err(|e| Error::Security(format!("Signature verification failed: {}", e)))?;

        debug!("Signature verified");
        Ok(())
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(sha256_hex(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_verify_hex_and_base64_signatures() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let verifier = SignatureVerifier::from_hex(&hex::encode(key.verifying_key().as_bytes())).unwrap();
        let sig = key.sign(b"payload").to_bytes();

        assert!(verifier.verify(b"payload", &hex::encode(sig)).is_ok());
        let b64 = base64::engine::general_purpose::STANDARD.encode(sig);
        assert!(verifier.verify(b"payload", &b64).is_ok());
        assert!(verifier.verify(b"tampered", &b64).is_err());
    }

    #[test]
    fn test_fingerprint_depends_on_key_only() {
        let a = SignatureVerifier::new(SigningKey::from_bytes(&[1u8; 32]).verifying_key());
        let b = SignatureVerifier::new(SigningKey::from_bytes(&[1u8; 32]).verifying_key());
        let c = SignatureVerifier::new(SigningKey::from_bytes(&[2u8; 32]).verifying_key());
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_bad_key_length_rejected() {
        assert!(SignatureVerifier::from_hex("abcd").is_err());
    }
}
