//! Proof-key code exchange (RFC 7636, S256 only)

use aliri_base64::Base64Url;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::{CodeVerifier, CodeVerifierRef, Nonce, State};

/// A single-use verifier/challenge pair
///
/// Generated once per authorization attempt. The verifier is held only long
/// enough to complete the matching code exchange and is never cached.
#[derive(Debug)]
pub struct PkcePair {
    verifier: CodeVerifier,
    challenge: String,
}

impl PkcePair {
    /// Generates a fresh pair from 32 bytes of OS randomness
    pub fn generate() -> Self {
        let verifier = CodeVerifier::new(random_urlsafe(32));
        let challenge = challenge_s256(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    /// The proof key to be presented at the code exchange
    #[inline]
    pub fn verifier(&self) -> &CodeVerifierRef {
        &self.verifier
    }

    /// Consumes the pair, yielding the proof key
    #[inline]
    pub fn into_verifier(self) -> CodeVerifier {
        self.verifier
    }

    /// The `S256` challenge derived from the verifier
    #[inline]
    pub fn challenge(&self) -> &str {
        &self.challenge
    }
}

/// Computes `base64url(SHA-256(verifier))`
pub fn challenge_s256(verifier: &CodeVerifierRef) -> String {
    let digest = Sha256::digest(verifier.as_str().as_bytes());
    Base64Url::from_raw(digest.to_vec()).to_string()
}

/// Generates a fresh anti-replay state value
pub fn random_state() -> State {
    State::new(random_urlsafe(32))
}

/// Generates a fresh nonce to bind into the requested identity token
pub fn random_nonce() -> Nonce {
    Nonce::new(random_urlsafe(32))
}

fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    Base64Url::from_raw(bytes).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_is_recomputable_from_verifier() {
        let pair = PkcePair::generate();
        assert_eq!(pair.challenge(), challenge_s256(pair.verifier()));
    }

    #[test]
    fn verifier_length_is_within_rfc_bounds() {
        let pair = PkcePair::generate();
        let len = pair.verifier().as_str().len();
        assert!(len >= 43 && len <= 128);
    }

    #[test]
    fn pairs_are_unique_per_attempt() {
        let a = PkcePair::generate();
        let b = PkcePair::generate();
        assert_ne!(a.verifier().as_str(), b.verifier().as_str());
        assert_ne!(a.challenge(), b.challenge());
    }

    #[test]
    fn state_and_nonce_are_random() {
        assert_ne!(random_state(), random_state());
        assert_ne!(random_nonce(), random_nonce());
    }
}
