//! Key schedule and data cipher.
//!
//! Four key families derive from credential material. Only the session key
//! is exercised on the data path; initial/handshake/application keys are
//! derived and held for the planned AEAD expansion.
//!
//! The data cipher is a deterministic XOR keystream, NOT authenticated
//! encryption. It is a placeholder until the embedded peer supports AEAD;
//! replacing it requires revisiting the whole schedule, so do not extend it
//! here.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};

const INITIAL_SALT: &[u8] = b"quicvc-initial-salt-v1";
const HANDSHAKE_SALT: &[u8] = b"quicvc-handshake-salt-v1";
const APPLICATION_SALT: &[u8] = b"quicvc-application-salt-v1";

/// Interop session-key material, fixed by the embedded peer's firmware.
const SESSION_SALT: &[u8] = b"quicvc-esp32-v1";
const SESSION_SUFFIX: &[u8] = b"esp32-session-key";

pub const KEY_LEN: usize = 32;

pub type Key = [u8; KEY_LEN];

fn hkdf_derive(salt: &[u8], ikm: &[u8]) -> Key {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(&[], &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// Initial keys bind the two credential ids together.
pub fn derive_initial_key(local_vc_id: &str, remote_vc_id: &str) -> Key {
    let ikm = [local_vc_id.as_bytes(), remote_vc_id.as_bytes()].concat();
    hkdf_derive(INITIAL_SALT, &ikm)
}

/// Handshake keys mix the challenge with both credential proofs.
pub fn derive_handshake_key(challenge: &[u8], local_proof: &[u8], remote_proof: &[u8]) -> Key {
    let ikm = [challenge, local_proof, remote_proof].concat();
    hkdf_derive(HANDSHAKE_SALT, &ikm)
}

/// Application keys bind the two public keys.
pub fn derive_application_key(local_public_key: &[u8], remote_public_key: &[u8]) -> Key {
    let ikm = [local_public_key, remote_public_key].concat();
    hkdf_derive(APPLICATION_SALT, &ikm)
}

/// The interop session key: a plain digest over the owner's person id,
/// matching what the embedded peer computes.
pub fn derive_session_key(owner_person_id: &str) -> Key {
    let mut hasher = Sha256::new();
    hasher.update(SESSION_SALT);
    hasher.update(owner_person_id.as_bytes());
    hasher.update(SESSION_SUFFIX);
    hasher.finalize().into()
}

/// XORs `buf` with the key cycled from index 0. Symmetric: applying it twice
/// restores the input. The caller passes only the protected payload slice;
/// header bytes stay clear.
pub fn apply_keystream(key: &Key, buf: &mut [u8]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i % KEY_LEN];
    }
}
