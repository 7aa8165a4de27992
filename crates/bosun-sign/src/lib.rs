//! Plan signature verification.
//!
//! The orchestrator signs each plan with its engine key: PKCS#1 v1.5 over a
//! SHA-256 digest of the input queue name concatenated with the raw plan
//! bytes. The queue name prefix ties a signature to one agent's queue, so a
//! plan signed for another instance never verifies here. When no key is
//! configured the verifier is absent and verification is skipped entirely
//! (development mode).

use anyhow::{Context, Result};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};

/// Why a plan signature was rejected.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("required signature was not found")]
    MissingSignature,
    #[error("signature does not match the plan payload")]
    BadSignature,
}

/// Verifies plan signatures against the pinned engine public key.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    key: RsaPublicKey,
    input_queue: String,
}

impl SignatureVerifier {
    /// Load the engine key from a PEM string (SubjectPublicKeyInfo or PKCS#1).
    ///
    /// `input_queue` is mixed into every signed payload; it must match the
    /// queue name the orchestrator signed for.
    pub fn from_pem(pem: &str, input_queue: impl Into<String>) -> Result<Self> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .context("engine key is not a valid RSA public key PEM")?;
        Ok(Self {
            key,
            input_queue: input_queue.into(),
        })
    }

    /// Check `signature` against `input_queue || data`.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        if signature.is_empty() {
            return Err(SignatureError::MissingSignature);
        }

        let mut hasher = Sha256::new();
        hasher.update(self.input_queue.as_bytes());
        hasher.update(data);
        let digest = hasher.finalize();

        self.key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
            .map_err(|_| SignatureError::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};

    fn keypair() -> (RsaPrivateKey, String) {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).expect("generate key");
        let pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .expect("encode pem");
        (private, pem)
    }

    fn sign(private: &RsaPrivateKey, queue: &str, data: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(queue.as_bytes());
        hasher.update(data);
        private
            .sign(Pkcs1v15Sign::new::<Sha256>(), &hasher.finalize())
            .expect("sign")
    }

    #[test]
    fn accepts_valid_signature() {
        let (private, pem) = keypair();
        let verifier = SignatureVerifier::from_pem(&pem, "agent-queue").expect("load key");
        let signature = sign(&private, "agent-queue", b"{\"Scripts\":{}}");
        verifier
            .verify(b"{\"Scripts\":{}}", &signature)
            .expect("verify");
    }

    #[test]
    fn rejects_empty_signature() {
        let (_, pem) = keypair();
        let verifier = SignatureVerifier::from_pem(&pem, "agent-queue").expect("load key");
        assert!(matches!(
            verifier.verify(b"payload", b""),
            Err(SignatureError::MissingSignature)
        ));
    }

    #[test]
    fn rejects_tampered_payload() {
        let (private, pem) = keypair();
        let verifier = SignatureVerifier::from_pem(&pem, "agent-queue").expect("load key");
        let signature = sign(&private, "agent-queue", b"original");
        assert!(matches!(
            verifier.verify(b"tampered", &signature),
            Err(SignatureError::BadSignature)
        ));
    }

    #[test]
    fn queue_name_is_part_of_the_payload() {
        let (private, pem) = keypair();
        let verifier = SignatureVerifier::from_pem(&pem, "queue-a").expect("load key");
        let signature = sign(&private, "queue-b", b"payload");
        assert!(matches!(
            verifier.verify(b"payload", &signature),
            Err(SignatureError::BadSignature)
        ));
    }

    #[test]
    fn rejects_invalid_pem() {
        assert!(SignatureVerifier::from_pem("not a key", "q").is_err());
    }
}
