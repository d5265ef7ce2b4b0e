//! Key vault: password hashing and the sealed Ed25519 private-key store.
//!
//! A user's libp2p keypair is serialized with the protobuf encoding, padded
//! with PKCS#7 and encrypted with AES-256-CBC under a key derived from the
//! passphrase via PBKDF2-HMAC-SHA3-256.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut as _, BlockEncryptMut as _, KeyIvInit as _};
use libp2p::identity::Keypair;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore as _;
use sha2::{Digest as _, Sha256};
use sha3::Sha3_256;

use crate::error::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Length of a protobuf-encoded Ed25519 keypair. Decryption output of any
/// other length is rejected rather than truncated.
pub const ED25519_PROTOBUF_LEN: usize = 68;

const PBKDF2_ROUNDS: u32 = 100_000;
const DERIVED_KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
const IV_LEN: usize = 16;

/// An encrypted private key together with the randomness needed to open it.
#[derive(Clone, Debug)]
pub struct SealedKey {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub salt: Vec<u8>,
}

/// Hash a passphrase for storage.
pub fn hash_password(password: &str) -> Result<String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST).map_err(|e| {
        tracing::error!("failed to hash password: {e}");
        Error::Internal
    })
}

/// Verify a passphrase against a stored hash. Malformed hashes count as a
/// mismatch so login stays indistinguishable from an unknown user.
#[must_use]
pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// Generate an Ed25519 keypair. With a seed, the secret key is the SHA2-256
/// of the seed string, so the same seed reproduces the same peer id.
pub fn generate_keypair(seed: Option<&str>) -> Result<Keypair> {
    match seed {
        Some(seed) => {
            let digest: [u8; 32] = Sha256::digest(seed.as_bytes()).into();
            Keypair::ed25519_from_bytes(digest).map_err(|e| {
                tracing::error!("failed to derive a keypair from seed: {e}");
                Error::Internal
            })
        }
        None => Ok(Keypair::generate_ed25519()),
    }
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; DERIVED_KEY_LEN] {
    let mut key = [0u8; DERIVED_KEY_LEN];
    pbkdf2_hmac::<Sha3_256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Encrypt a keypair under a passphrase with a fresh random IV and salt.
pub fn seal_keypair(keypair: &Keypair, password: &str) -> Result<SealedKey> {
    let key_bytes = keypair.to_protobuf_encoding().map_err(|e| {
        tracing::error!("failed to serialize private key: {e}");
        Error::Internal
    })?;

    let mut salt = vec![0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut iv = vec![0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let derived = derive_key(password, &salt);
    let cipher = Aes256CbcEnc::new_from_slices(&derived, &iv).map_err(|e| {
        tracing::error!("failed to initialize cipher: {e}");
        Error::Internal
    })?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(&key_bytes);

    Ok(SealedKey {
        ciphertext,
        iv,
        salt,
    })
}

/// Decrypt a sealed keypair. Every failure mode collapses to
/// `InvalidCredentials` so callers cannot distinguish a bad password from a
/// corrupted record.
pub fn unseal_keypair(
    password: &str,
    ciphertext: &[u8],
    iv: &[u8],
    salt: &[u8],
) -> Result<Keypair> {
    let derived = derive_key(password, salt);
    let cipher =
        Aes256CbcDec::new_from_slices(&derived, iv).map_err(|_| Error::InvalidCredentials)?;
    let key_bytes = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::InvalidCredentials)?;

    if key_bytes.len() != ED25519_PROTOBUF_LEN {
        tracing::warn!(
            "decrypted private key has length {}, expected {ED25519_PROTOBUF_LEN}",
            key_bytes.len()
        );
        return Err(Error::InvalidCredentials);
    }

    Keypair::from_protobuf_encoding(&key_bytes).map_err(|_| Error::InvalidCredentials)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_verifies() {
        let hash = hash_password("hunter2").expect("hashing succeeds");
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
        assert!(!verify_password("hunter2", "not-a-bcrypt-hash"));
    }

    #[test]
    fn seeded_keypairs_are_deterministic() {
        let a = generate_keypair(Some("pelican")).expect("keypair");
        let b = generate_keypair(Some("pelican")).expect("keypair");
        let c = generate_keypair(Some("walrus")).expect("keypair");
        assert_eq!(a.public().to_peer_id(), b.public().to_peer_id());
        assert_ne!(a.public().to_peer_id(), c.public().to_peer_id());
    }

    #[test]
    fn serialized_keypair_has_expected_length() {
        let keypair = generate_keypair(None).expect("keypair");
        let bytes = keypair.to_protobuf_encoding().expect("encoding");
        assert_eq!(bytes.len(), ED25519_PROTOBUF_LEN);
    }

    #[test]
    fn seal_and_unseal_round_trip() {
        let keypair = generate_keypair(Some("roundtrip")).expect("keypair");
        let sealed = seal_keypair(&keypair, "passphrase").expect("seal");

        let opened = unseal_keypair("passphrase", &sealed.ciphertext, &sealed.iv, &sealed.salt)
            .expect("unseal with the right passphrase");
        assert_eq!(
            opened.public().to_peer_id(),
            keypair.public().to_peer_id()
        );

        assert_eq!(
            unseal_keypair("wrong", &sealed.ciphertext, &sealed.iv, &sealed.salt).unwrap_err(),
            Error::InvalidCredentials
        );
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let keypair = generate_keypair(Some("truncated")).expect("keypair");
        let sealed = seal_keypair(&keypair, "passphrase").expect("seal");

        let truncated = &sealed.ciphertext[..sealed.ciphertext.len() - 16];
        assert_eq!(
            unseal_keypair("passphrase", truncated, &sealed.iv, &sealed.salt).unwrap_err(),
            Error::InvalidCredentials
        );
    }
}
